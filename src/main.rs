use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chime_signaling::chimecore::error::ExitStatus;
use chime_signaling::chimecore::session::{
    LogLevel, MeetingSessionCredentials, MeetingSessionUrls, SessionDescriptor,
};
use chime_signaling::controller::{self, SessionOptions};
use chrono::Local;
use clap::Parser;

// Joins a meeting with the parameters the launcher hands over.
//
// Usage:
//   chime-signaling --attendee_id ID --audio_host_url HOST --external_meeting_id NAME \
//       --external_user_id USER --join_token TOKEN --meeting_id ID \
//       --signaling_url wss://... [--send_audio_file_name input.pcm] [--log_level info]

#[derive(Parser, Debug)]
#[command(name = "chime-signaling")]
#[command(about = "Join a meeting's signaling session and stream audio files")]
struct Args {
    #[arg(long = "attendee_id")]
    attendee_id: String,

    #[arg(long = "audio_host_url")]
    audio_host_url: String,

    #[arg(long = "external_meeting_id")]
    external_meeting_id: String,

    #[arg(long = "external_user_id")]
    external_user_id: String,

    #[arg(long = "join_token")]
    join_token: String,

    /// verbose, debug, info, warning or error
    #[arg(long = "log_level", default_value = "error")]
    log_level: String,

    #[arg(long = "meeting_id")]
    meeting_id: String,

    #[arg(long = "signaling_url")]
    signaling_url: String,

    /// Audio to send: a 16-bit WAV, or raw 48 kHz stereo s16le
    #[arg(long = "send_audio_file_name", default_value = "")]
    send_audio_file_name: String,

    /// Directory for received audio
    #[arg(long = "media_out", default_value = "media_out")]
    media_out: PathBuf,

    #[arg(long = "connect_timeout_secs", default_value_t = 10)]
    connect_timeout_secs: u64,

    #[arg(long = "max_reconnect_attempts", default_value_t = 5)]
    max_reconnect_attempts: u32,
}

impl Args {
    fn descriptor(&self) -> Result<SessionDescriptor> {
        let log_level = LogLevel::from_str(&self.log_level)?;
        let descriptor = SessionDescriptor::new(
            &self.meeting_id,
            &self.external_meeting_id,
            MeetingSessionCredentials {
                attendee_id: self.attendee_id.clone(),
                external_user_id: self.external_user_id.clone(),
                join_token: self.join_token.clone(),
            },
            MeetingSessionUrls {
                audio_host_url: self.audio_host_url.clone(),
                signaling_url: self.signaling_url.clone(),
            },
        )
        .context("invalid meeting parameters")?
        .with_log_level(log_level)
        .with_audio_source(Some(PathBuf::from(&self.send_audio_file_name)));
        Ok(descriptor)
    }

    fn options(&self) -> SessionOptions {
        let mut options = SessionOptions::default();
        options.client.connect_timeout = Duration::from_secs(self.connect_timeout_secs.max(1));
        options.client.reconnect.max_attempts = self.max_reconnect_attempts;
        options.pipeline.media_out = self.media_out.clone();
        options
    }
}

fn print_banner(descriptor: &SessionDescriptor) {
    println!();
    println!("Attendee Name: {}", descriptor.attendee_name());
    println!("Attendee ID: {}", descriptor.attendee_id());
    println!("Meeting Name: {}", descriptor.external_meeting_id());
    println!("Meeting ID: {}", descriptor.meeting_id());
    println!(
        "Audio Filename: {}",
        descriptor
            .audio_source()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    );
    println!("Current Log Level: {}", descriptor.log_level());
}

/// The filter comes from `--log_level` only; `RUST_LOG` is not consulted.
fn logger(level: LogLevel) -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level.to_level_filter())
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        });
    builder
}

fn main() -> ExitCode {
    let args = Args::parse();
    let descriptor = match args.descriptor() {
        Ok(descriptor) => descriptor,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(ExitStatus::InvalidArguments.code() as u8);
        }
    };

    print_banner(&descriptor);
    logger(descriptor.log_level()).init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to build tokio runtime: {e}");
            return ExitCode::from(ExitStatus::Failed.code() as u8);
        }
    };

    let status = rt.block_on(controller::run(descriptor, args.options()));
    ExitCode::from(status.code() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_filter_follows_log_level() {
        assert_eq!(logger(LogLevel::Verbose).build().filter(), log::LevelFilter::Trace);
        assert_eq!(logger(LogLevel::Warning).build().filter(), log::LevelFilter::Warn);
        assert_eq!(logger(LogLevel::Error).build().filter(), log::LevelFilter::Error);
    }
}
