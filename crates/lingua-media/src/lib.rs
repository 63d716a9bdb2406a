//! Media pipeline: transcoding client container audio into PCM for upstream.

pub mod transcoder;

pub use transcoder::{
    DiagnosticStream, FfmpegLauncher, FfmpegTranscoder, PcmStream, Transcoder, TranscoderEvent,
    TranscoderLauncher,
};
