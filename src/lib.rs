use std::path::PathBuf;
use std::time::Duration;

pub mod audio;
pub mod cache;
pub mod clip;
pub mod config;
pub mod decode;
pub mod sync;
pub mod task;
pub mod util;
pub mod wave;

pub use audio::{ClipMatch, Fingerprint, SyncParams, WindowFunction};
pub use clip::{Clip, ClipEvent, ClipEventKind, ClipId, ClipState};
pub use config::Config;
pub use sync::Synchronizer;
pub use task::{CancellationToken, Progress};
pub use wave::WaveFormat;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    UnsupportedFormat(String),
    #[error("file '{0}' has not been processed yet")]
    NotYetProcessed(String),
    #[error("operation canceled")]
    Canceled,
    #[error("{tool} failed: {reason}")]
    ExternalToolFailure { tool: String, reason: String },
    #[error("{tool} timed out after {timeout:?}")]
    ExternalToolTimeout { tool: String, timeout: Duration },
    #[error("no master file specified")]
    NoMaster,
    #[error("problem with master '{name}': {reason}")]
    MasterFailed { name: String, reason: String },
    #[error("invalid sync parameters: {0}")]
    InvalidParams(String),
    #[error("clip '{name}' cannot {operation} while {state:?}")]
    InvalidState {
        name: String,
        operation: &'static str,
        state: clip::ClipState,
    },
    #[error("cannot add file '{0}' from the temp folder; use another folder for source files")]
    TempFolderSource(PathBuf),
    #[error("clip not found: {0:?}")]
    ClipNotFound(clip::ClipId),
    #[error("could not find a match for '{0}'")]
    NoMatch(String),
    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg error: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),
    #[error("WAV error: {0}")]
    WavError(#[from] hound::Error),
    #[error("bincode error: {0}")]
    BincodeError(#[from] bincode::Error),
    #[error("serde_json error: {0}")]
    SerdeJSONError(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}

impl Error {
    /// Returns true if this error is a cooperative cancellation rather than a failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
