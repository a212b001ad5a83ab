//! Runtime half of the media pipeline: file I/O and the send/receive tasks.
//! Codec work lives in [`chimecore::media`].

pub mod pipeline;
pub mod sink;
pub mod source;

pub use pipeline::{MediaPipeline, MediaStats, PipelineConfig, PipelineIo};
pub use sink::PcmFileSink;
pub use source::{FileAudioSource, SourceFormat};
