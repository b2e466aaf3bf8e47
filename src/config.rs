use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::SyncParams;
use crate::Result;

/// Runtime configuration of a [Synchronizer](crate::Synchronizer).
///
/// Usually loaded from a JSON file with [Config::from_path]; every field is optional.
///
/// ```json
/// {
///   "ffmpeg_path": "/usr/local/bin/ffmpeg",
///   "temp_dir": "/tmp/clipsync",
///   "decode_timeout_secs": 300,
///   "sync_params": { "window_length": 512, "window_function": "hann" }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Path of the `ffmpeg` executable used to decode sources.
    pub ffmpeg_path: PathBuf,
    /// Directory for decoded audio and cached fingerprints.
    pub temp_dir: PathBuf,
    /// Wall-clock limit for a single decoder run, in seconds.
    pub decode_timeout_secs: u64,
    pub sync_params: SyncParams,
    /// Run the offset search on the rayon pool.
    pub threading: bool,
    /// Decode in-process instead of running `ffmpeg`. Requires the `ffmpeg` feature.
    pub native_decoder: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            temp_dir: std::env::temp_dir().join("clipsync"),
            decode_timeout_secs: crate::audio::DEFAULT_DECODE_TIMEOUT.as_secs(),
            sync_params: SyncParams::default(),
            threading: true,
            native_decoder: false,
        }
    }
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let f = std::fs::File::open(path.as_ref())?;
        let config: Config = serde_json::from_reader(std::io::BufReader::new(f))?;
        config.sync_params.validate()?;
        Ok(config)
    }

    pub fn decode_timeout(&self) -> Duration {
        Duration::from_secs(self.decode_timeout_secs)
    }

    /// Returns a new [Config] with the provided `ffmpeg_path`.
    pub fn with_ffmpeg_path(mut self, ffmpeg_path: impl Into<PathBuf>) -> Self {
        self.ffmpeg_path = ffmpeg_path.into();
        self
    }

    /// Returns a new [Config] with the provided `temp_dir`.
    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    /// Returns a new [Config] with the provided `decode_timeout`.
    pub fn with_decode_timeout(mut self, decode_timeout: Duration) -> Self {
        self.decode_timeout_secs = decode_timeout.as_secs();
        self
    }

    /// Returns a new [Config] with the provided `sync_params`.
    pub fn with_sync_params(mut self, sync_params: SyncParams) -> Self {
        self.sync_params = sync_params;
        self
    }

    /// Returns a new [Config] with `threading` set to the provided value.
    pub fn with_threading(mut self, threading: bool) -> Self {
        self.threading = threading;
        self
    }

    /// Returns a new [Config] with `native_decoder` set to the provided value.
    pub fn with_native_decoder(mut self, native_decoder: bool) -> Self {
        self.native_decoder = native_decoder;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::audio::WindowFunction;

    #[test]
    fn test_partial_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clipsync.json");
        std::fs::write(
            &path,
            r#"{"decode_timeout_secs": 30, "sync_params": {"window_length": 512, "window_function": "hann"}}"#,
        )
        .unwrap();

        let config = Config::from_path(&path).unwrap();
        assert_eq!(config.decode_timeout(), Duration::from_secs(30));
        assert_eq!(config.sync_params.window_length, 512);
        assert_eq!(config.sync_params.freq_range_step, crate::audio::DEFAULT_FREQ_RANGE_STEP);
        assert_eq!(config.sync_params.window_function, WindowFunction::Hann);
        assert_eq!(config.ffmpeg_path, PathBuf::from("ffmpeg"));
        assert!(config.threading);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clipsync.json");
        std::fs::write(&path, r#"{"sync_params": {"window_length": 300}}"#).unwrap();
        assert!(matches!(
            Config::from_path(&path),
            Err(crate::Error::InvalidParams(_))
        ));
    }

    #[test]
    fn test_builders() {
        let config = Config::default()
            .with_ffmpeg_path("/opt/ffmpeg")
            .with_decode_timeout(Duration::from_secs(5))
            .with_threading(false);
        assert_eq!(config.ffmpeg_path, PathBuf::from("/opt/ffmpeg"));
        assert_eq!(config.decode_timeout_secs, 5);
        assert!(!config.threading);
    }
}
