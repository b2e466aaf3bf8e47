use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Result;

/// Formats the given [Duration] as "MM:SSs"
pub fn format_time(t: Duration) -> String {
    let minutes = t.as_secs() / 60;
    let seconds = t.as_secs() % 60;
    format!("{:02}:{:02}s", minutes, seconds)
}

/// Formats a signed offset in seconds as "+HH:MM:SS.mmm".
pub fn format_offset(secs: f64) -> String {
    let sign = if secs < 0.0 { '-' } else { '+' };
    let total_ms = (secs.abs() * 1000.0).round() as u64;
    let (hours, rest) = (total_ms / 3_600_000, total_ms % 3_600_000);
    let (minutes, rest) = (rest / 60_000, rest % 60_000);
    let (seconds, millis) = (rest / 1000, rest % 1000);
    format!(
        "{}{:02}:{:02}:{:02}.{:03}",
        sign, hours, minutes, seconds, millis
    )
}

/// Checks if the given path points to an audio or video file by sniffing its header.
///
/// This is a very cheap check that does not guarantee the file can be decoded.
pub fn is_valid_media_file(path: impl AsRef<Path>) -> bool {
    let mut buf = [0u8; 8192];
    let n = match std::fs::File::open(path.as_ref()).and_then(|mut f| f.read(&mut buf)) {
        Ok(n) => n,
        Err(_) => return false,
    };
    let header = &buf[..n];
    infer::is_audio(header) || infer::is_video(header)
}

/// Expands `paths` into a list of media files.
///
/// Directories are searched one level deep. Files that are not media files are skipped.
pub fn find_media_files(paths: &[impl AsRef<Path>]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        let path = path.as_ref();
        if path.is_dir() {
            let mut entries = std::fs::read_dir(path)?
                .map(|e| e.map(|e| e.path()))
                .collect::<std::io::Result<Vec<_>>>()?;
            entries.sort();
            files.extend(
                entries
                    .into_iter()
                    .filter(|p| p.is_file() && is_valid_media_file(p)),
            );
        } else if is_valid_media_file(path) {
            files.push(path.to_owned());
        } else {
            tracing::warn!("skipping {}: not a media file", path.display());
        }
    }
    Ok(files)
}

/// Returns true if `path` is located inside `dir`.
pub fn is_in_dir(path: &Path, dir: &Path) -> bool {
    let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_owned());
    let dir = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_owned());
    path.starts_with(dir)
}

/// Removes every file in `dir` with the given extension. Missing directories are ignored.
pub fn remove_files_with_extension(dir: &Path, ext: &str) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |e| e == ext) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("failed to remove {}: {}", path.display(), e),
            }
        }
    }
    Ok(removed)
}

/// Returns the version string of the `FFmpeg` libraries linked into this binary.
#[cfg(feature = "ffmpeg")]
pub fn ffmpeg_version_string() -> String {
    let version_int = ffmpeg_next::util::version();

    // Reference: https://github.com/FFmpeg/FFmpeg/blob/130d19bf2044ac76372d1b97ab87ab283c8b37f8/libavutil/version.h#L64
    format!(
        "{}.{}.{}",
        version_int >> 16,
        (version_int & 0x00FF00) >> 8,
        version_int & 0xFF
    )
}

// A few seconds of "music": two tones whose pitches jump pseudo-randomly every 700
// samples, so no stretch of the signal repeats.
#[cfg(test)]
pub(crate) fn tone_sequence(n: usize, sample_rate: u32) -> Vec<i32> {
    let note = |k: usize| {
        let mut x = (k as u32).wrapping_mul(2654435761).wrapping_add(12345);
        x ^= x >> 15;
        x = x.wrapping_mul(2246822519);
        x ^= x >> 13;
        (x % 40) as f64
    };
    (0..n)
        .map(|i| {
            let t = i as f64 / sample_rate as f64;
            let k = i / 700;
            let f1 = 200.0 + 45.0 * note(k);
            let f2 = 2000.0 + 40.0 * note(k + 7919);
            let v = (2.0 * std::f64::consts::PI * f1 * t).sin() * 9000.0
                + (2.0 * std::f64::consts::PI * f2 * t).sin() * 4000.0;
            v as i32
        })
        .collect()
}
