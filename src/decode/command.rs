use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use super::Decoder;
use crate::task::CancellationToken;
use crate::wave::WaveFormat;
use crate::{Error, Result};

const TOOL: &str = "ffmpeg";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

// Substrings of ffmpeg's stderr that mean the input itself cannot be decoded.
const UNSUPPORTED_PATTERNS: &[&str] = &[
    "Invalid data found when processing input",
    "does not contain any stream",
    "Output file #0 does not contain any stream",
    "matches no streams",
];

/// The part of an LQ clip and of the master that line up, as cut by
/// [FfmpegCommand::export].
#[derive(Clone, Debug, PartialEq)]
pub struct MediaExport {
    pub lq: PathBuf,
    pub master: PathBuf,
    /// Seconds into the LQ clip where the exported media begins.
    pub query_start: f64,
    /// Seconds into the master where the exported audio begins.
    pub track_start: f64,
    pub duration: f64,
    /// Keep the LQ clip's video, with the master's audio in place of its own.
    pub keep_video: bool,
}

/// Decodes media by running an external `ffmpeg` process.
///
/// The process is killed if it runs longer than the configured timeout or if the clip is
/// canceled. A nonzero exit is reported as [Error::ExternalToolFailure] with ffmpeg's
/// stderr as the reason.
#[derive(Clone, Debug)]
pub struct FfmpegCommand {
    path: PathBuf,
    timeout: Duration,
    log_level: String,
}

impl Default for FfmpegCommand {
    fn default() -> Self {
        Self {
            path: PathBuf::from(TOOL),
            timeout: crate::audio::DEFAULT_DECODE_TIMEOUT,
            log_level: "error".to_string(),
        }
    }
}

impl FfmpegCommand {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::default().with_path(path)
    }

    /// Returns a new [FfmpegCommand] that runs the executable at `path`.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Returns a new [FfmpegCommand] with the provided wall-clock `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns a new [FfmpegCommand] with the provided ffmpeg `-v` level.
    pub fn with_log_level(mut self, log_level: impl Into<String>) -> Self {
        self.log_level = log_level.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Builds the ffmpeg arguments that extract the first audio stream of `source` as
    /// 16-bit PCM.
    pub fn build_args(&self, source: &Path, dest: &Path, target: Option<&WaveFormat>) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-nostdin".to_string(),
            "-hide_banner".to_string(),
            "-v".to_string(),
            self.log_level.clone(),
            "-i".to_string(),
            source.to_string_lossy().to_string(),
            "-vn".to_string(),
            "-map".to_string(),
            "0:a:0".to_string(),
            "-acodec".to_string(),
            "pcm_s16le".to_string(),
        ];

        if let Some(target) = target {
            args.push("-ar".to_string());
            args.push(target.sample_rate.to_string());
        }

        args.push("-f".to_string());
        args.push("wav".to_string());
        args.push(dest.to_string_lossy().to_string());

        args
    }

    /// Builds the ffmpeg arguments for `export`, writing to `dest`.
    ///
    /// With [MediaExport::keep_video] the LQ clip's first video stream is copied and its
    /// audio replaced by the matching part of the master. Otherwise only the master's audio
    /// is cut.
    pub fn build_export_args(&self, export: &MediaExport, dest: &Path) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-nostdin".to_string(),
            "-hide_banner".to_string(),
            "-v".to_string(),
            self.log_level.clone(),
        ];

        if export.keep_video {
            args.extend([
                "-ss".to_string(),
                export.query_start.to_string(),
                "-i".to_string(),
                export.lq.to_string_lossy().to_string(),
            ]);
        }
        args.extend([
            "-ss".to_string(),
            export.track_start.to_string(),
            "-i".to_string(),
            export.master.to_string_lossy().to_string(),
        ]);
        if export.keep_video {
            args.extend([
                "-c".to_string(),
                "copy".to_string(),
                "-map".to_string(),
                "0:v:0".to_string(),
                "-map".to_string(),
                "1:a:0".to_string(),
            ]);
        }
        args.extend([
            "-t".to_string(),
            export.duration.to_string(),
            dest.to_string_lossy().to_string(),
        ]);

        args
    }

    /// Writes the synchronized media described by `export` to `dest`.
    pub fn export(&self, export: &MediaExport, dest: &Path, cancel: &CancellationToken) -> Result<()> {
        let span = tracing::span!(tracing::Level::TRACE, "ffmpeg_export");
        let _enter = span.enter();

        cancel.check()?;

        let args = self.build_export_args(export, dest);
        let source = if export.keep_video { &export.lq } else { &export.master };
        self.run(&args, source, cancel)?;

        tracing::debug!(duration = export.duration, "exported {}", dest.display());
        Ok(())
    }

    // Runs ffmpeg with `args` and returns its stderr once it exits successfully.
    fn run(&self, args: &[String], source: &Path, cancel: &CancellationToken) -> Result<String> {
        tracing::debug!(path = %self.path.display(), "running ffmpeg {}", args.join(" "));

        let mut child = Command::new(&self.path)
            .args(args)
            .env("AV_LOG_FORCE_NOCOLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ExternalToolFailure {
                tool: TOOL.to_string(),
                reason: format!("failed to start '{}': {}", self.path.display(), e),
            })?;

        // Drain stderr on its own thread so a chatty process never blocks on a full pipe.
        let stderr = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });

        let status = self.wait(&mut child, cancel);
        let stderr = stderr
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let status = status?;

        if !status.success() {
            return Err(classify_failure(source, status, &stderr));
        }
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            tracing::debug!("ffmpeg: {}", line);
        }

        Ok(stderr)
    }

    // Waits for the child to exit while watching the timeout and the cancellation token.
    fn wait(&self, child: &mut Child, cancel: &CancellationToken) -> Result<ExitStatus> {
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }

            if cancel.is_canceled() {
                kill(child);
                return Err(Error::Canceled);
            }

            if started.elapsed() >= self.timeout {
                kill(child);
                return Err(Error::ExternalToolTimeout {
                    tool: TOOL.to_string(),
                    timeout: self.timeout,
                });
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::warn!("failed to kill {}: {}", TOOL, e);
    }
    let _ = child.wait();
}

// Maps a failed run to an error, using stderr to tell bad input from a broken tool.
fn classify_failure(source: &Path, status: ExitStatus, stderr: &str) -> Error {
    let stderr = stderr.trim();
    if UNSUPPORTED_PATTERNS.iter().any(|p| stderr.contains(p)) {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| source.display().to_string());
        return Error::UnsupportedFormat(format!("'{}' not supported", name));
    }

    let reason = if stderr.is_empty() {
        format!("exited with {}", status)
    } else {
        format!("exited with {}: {}", status, stderr)
    };
    Error::ExternalToolFailure {
        tool: TOOL.to_string(),
        reason,
    }
}

impl Decoder for FfmpegCommand {
    fn decode(
        &self,
        source: &Path,
        dest: &Path,
        target: Option<&WaveFormat>,
        cancel: &CancellationToken,
    ) -> Result<WaveFormat> {
        let span = tracing::span!(tracing::Level::TRACE, "ffmpeg_decode");
        let _enter = span.enter();

        cancel.check()?;

        let args = self.build_args(source, dest, target);
        self.run(&args, source, cancel)?;

        super::read_format(dest)
    }
}
