fn main() -> std::io::Result<()> {
    // `signal_rtc.rs` is checked in pre-generated. Only regenerate it when
    // `GENERATE_PROTO` is set, e.g. after editing `signal_rtc.proto`.
    if std::env::var("GENERATE_PROTO").is_err() {
        println!("cargo:rerun-if-changed=build.rs");
        return Ok(());
    }

    println!("cargo:rerun-if-changed=src/signal_rtc.proto");
    println!("cargo:warning=GENERATE_PROTO is set, regenerating signaling frames...");

    let mut config = prost_build::Config::new();
    config.out_dir("src/");
    config.compile_protos(&["src/signal_rtc.proto"], &["src/"])?;
    Ok(())
}
