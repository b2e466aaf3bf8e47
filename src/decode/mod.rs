//! Decoding of arbitrary media files into PCM WAV files.

mod command;
#[cfg(feature = "ffmpeg")]
mod native;

use std::path::Path;
use std::sync::Arc;

pub use command::{FfmpegCommand, MediaExport};
#[cfg(feature = "ffmpeg")]
pub use native::NativeDecoder;

use crate::config::Config;
use crate::task::CancellationToken;
use crate::wave::WaveFormat;
use crate::Result;

/// Converts a media file into a 16-bit PCM WAV file.
pub trait Decoder: Send + Sync {
    /// Decodes the first audio stream of `source` into a WAV file at `dest` and returns its
    /// format.
    ///
    /// If `target` is set, the audio is resampled to the target sample rate. Implementations
    /// must observe `cancel` while decoding and fail with [Error::Canceled](crate::Error::Canceled).
    fn decode(
        &self,
        source: &Path,
        dest: &Path,
        target: Option<&WaveFormat>,
        cancel: &CancellationToken,
    ) -> Result<WaveFormat>;
}

/// Builds the decoder selected by `config`.
///
/// The in-process decoder is used when [Config::native_decoder] is set and the `ffmpeg`
/// feature is enabled; otherwise the `ffmpeg` executable is run.
pub fn from_config(config: &Config) -> Result<Arc<dyn Decoder>> {
    if config.native_decoder {
        #[cfg(feature = "ffmpeg")]
        {
            return Ok(Arc::new(NativeDecoder::new()?));
        }
        #[cfg(not(feature = "ffmpeg"))]
        tracing::warn!("native decoding requires the 'ffmpeg' feature; using the ffmpeg executable");
    }

    Ok(Arc::new(
        FfmpegCommand::new(&config.ffmpeg_path).with_timeout(config.decode_timeout()),
    ))
}

// Reads back the format of a freshly decoded file.
pub(crate) fn read_format(path: &Path) -> Result<WaveFormat> {
    let reader = hound::WavReader::open(path)?;
    Ok(reader.spec().into())
}
