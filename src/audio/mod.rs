mod data;
mod fingerprint;
mod matcher;
mod params;

pub use data::{ClipMatch, Fingerprint};
pub use fingerprint::{combine_hashes, Fingerprinter, SpectralFingerprinter};
pub use matcher::{find_best_offset, OffsetCandidate};
pub use params::{SyncParams, WindowFunction};

/// Default analysis window length, in samples.
///
/// Each window of audio produces exactly one hash. Smaller windows give finer offsets at
/// the cost of more hashes to compare:
///
/// * 128 - short files
/// * 256 - medium files
/// * 4096 - long recordings
pub const DEFAULT_WINDOW_LENGTH: usize = 256;

/// Default frequency bucket width, in FFT bins.
///
/// The first `L/2` bins of each window are split into buckets of this width and the
/// loudest bin of each bucket contributes to the hash. With `L = 256` and a step of 60
/// there are 3 buckets: 0-59, 60-119 and 120-127. Three or four buckets work best.
pub const DEFAULT_FREQ_RANGE_STEP: usize = 60;

/// Default wall-clock limit for one external decoder run.
pub const DEFAULT_DECODE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(600);

/// Extension of the per-clip JSON report written alongside each synchronized clip.
pub static REPORT_FILE_EXT: &str = "clipsync.json";
