use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::audio::{ClipMatch, Fingerprint, Fingerprinter};
use crate::task::{CancellationToken, Progress};
use crate::wave::{SoundFile, SoundFileFactory, WaveFormat};
use crate::{Error, Result};

static NEXT_CLIP_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a [Clip].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClipId(u64);

impl ClipId {
    fn next() -> Self {
        Self(NEXT_CLIP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ClipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a [Clip].
///
/// ```text
/// Created -> Loading -> Loaded -> Hashing -> Hashed -> Matching -> Matched
/// ```
///
/// `Canceled` is reachable from any state that is not terminal. `Failed` is reachable from
/// `Loading`, `Hashing` and `Matching`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ClipState {
    Created,
    Loading,
    Loaded,
    Hashing,
    Hashed,
    Matching,
    Matched,
    Canceled,
    Failed,
}

impl ClipState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClipState::Canceled | ClipState::Failed)
    }
}

/// Notification raised by a clip as it moves through its lifecycle.
#[derive(Clone, Debug, PartialEq)]
pub struct ClipEvent {
    pub clip: ClipId,
    pub display_name: String,
    pub kind: ClipEventKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClipEventKind {
    Loaded,
    Hashed,
    Matched(ClipMatch),
    NoMatch,
    /// The reason is the error message, verbatim.
    Failed(String),
    Canceled,
}

#[derive(Debug)]
struct ClipInner {
    state: ClipState,
    wave_format: Option<WaveFormat>,
    data_length: u64,
    hashes: Option<Arc<Fingerprint>>,
    match_result: Option<ClipMatch>,
}

/// One audio/video source under processing.
///
/// A clip is driven through its states by [Clip::load], [Clip::calc_hashes] and
/// [Clip::sync]. All methods take `&self`, so a clip can be shared between the pipeline
/// running it and the [Synchronizer](crate::Synchronizer) that owns it.
pub struct Clip {
    id: ClipId,
    filename: PathBuf,
    display_name: String,
    fingerprinter: Arc<dyn Fingerprinter>,
    sound_files: Arc<dyn SoundFileFactory>,
    sound_file: Mutex<Option<Box<dyn SoundFile>>>,
    inner: Mutex<ClipInner>,
    progress: Progress,
    cancel: CancellationToken,
    disposed: AtomicBool,
    events: Option<Mutex<Sender<ClipEvent>>>,
}

impl std::fmt::Debug for Clip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clip")
            .field("id", &self.id)
            .field("filename", &self.filename)
            .field("state", &self.state())
            .finish()
    }
}

impl Clip {
    pub fn new(
        filename: impl Into<PathBuf>,
        fingerprinter: Arc<dyn Fingerprinter>,
        sound_files: Arc<dyn SoundFileFactory>,
    ) -> Self {
        let filename = filename.into();
        let display_name = filename
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| filename.display().to_string());

        Self {
            id: ClipId::next(),
            filename,
            display_name,
            fingerprinter,
            sound_files,
            sound_file: Mutex::new(None),
            inner: Mutex::new(ClipInner {
                state: ClipState::Created,
                wave_format: None,
                data_length: 0,
                hashes: None,
                match_result: None,
            }),
            progress: Progress::new(),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            events: None,
        }
    }

    /// Returns a new [Clip] that reports its [ClipEvent]s to `events`.
    pub fn with_events(mut self, events: Sender<ClipEvent>) -> Self {
        self.events = Some(Mutex::new(events));
        self
    }

    pub fn id(&self) -> ClipId {
        self.id
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// File name without the directory.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn state(&self) -> ClipState {
        self.inner().state
    }

    /// Format of the decoded audio. Set once the clip is loaded.
    pub fn wave_format(&self) -> Option<WaveFormat> {
        self.inner().wave_format
    }

    /// Length of the decoded audio in sample frames.
    pub fn data_length(&self) -> u64 {
        self.inner().data_length
    }

    /// Length of the decoded audio in seconds.
    pub fn duration_secs(&self) -> f64 {
        let inner = self.inner();
        match inner.wave_format {
            Some(f) if f.sample_rate > 0 => inner.data_length as f64 / f.sample_rate as f64,
            _ => 0.0,
        }
    }

    pub fn hashes(&self) -> Option<Arc<Fingerprint>> {
        self.inner().hashes.clone()
    }

    pub fn match_result(&self) -> Option<ClipMatch> {
        self.inner().match_result
    }

    /// Offset against the master in seconds. Only set while the clip is [ClipState::Matched].
    pub fn offset(&self) -> Option<f64> {
        let inner = self.inner();
        match inner.state {
            ClipState::Matched => inner.match_result.map(|m| m.offset),
            _ => None,
        }
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Opens a reader over the clip's raw PCM frames.
    pub fn open_pcm(&self) -> Result<Box<dyn Read + Send>> {
        match self.sound_file().as_ref() {
            Some(f) => f.pcm_reader(),
            None => Err(Error::NotYetProcessed(self.display_name.clone())),
        }
    }

    fn inner(&self) -> MutexGuard<'_, ClipInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sound_file(&self) -> MutexGuard<'_, Option<Box<dyn SoundFile>>> {
        self.sound_file.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, kind: ClipEventKind) {
        if let Some(events) = &self.events {
            let events = events.lock().unwrap_or_else(|e| e.into_inner());
            // The receiver may already be gone if the owner shut down.
            let _ = events.send(ClipEvent {
                clip: self.id,
                display_name: self.display_name.clone(),
                kind,
            });
        }
    }

    // Moves from one of `from` into `to`, or reports why the operation cannot start.
    fn begin(&self, from: &[ClipState], to: ClipState, operation: &'static str) -> Result<()> {
        self.cancel.check()?;
        let mut inner = self.inner();
        if !from.contains(&inner.state) {
            return Err(Error::InvalidState {
                name: self.display_name.clone(),
                operation,
                state: inner.state,
            });
        }
        inner.state = to;
        Ok(())
    }

    /// Records a failed stage and returns the error to propagate.
    ///
    /// A cancellation leaves the clip [ClipState::Canceled]. Any other error releases the
    /// clip's resources and leaves it [ClipState::Failed]. A clip that is already in a
    /// terminal state is left untouched.
    pub(crate) fn fail(&self, e: Error, stage: &'static str) -> Error {
        if e.is_canceled() || self.is_canceled() {
            self.cancel();
            return Error::Canceled;
        }

        tracing::error!(clip = self.display_name(), stage, "{}", e);

        let reason = e.to_string();
        {
            let mut inner = self.inner();
            if inner.state.is_terminal() {
                return e;
            }
            inner.state = ClipState::Failed;
        }

        // Stops any loop still running for this clip.
        self.cancel.cancel();
        self.dispose();
        self.emit(ClipEventKind::Failed(reason));

        e
    }

    /// Decodes the clip, resampling to `target` if provided.
    ///
    /// An unsupported source fails the clip with [Error::UnsupportedFormat].
    pub fn load(&self, target: Option<&WaveFormat>) -> Result<()> {
        let span = tracing::span!(tracing::Level::TRACE, "load");
        let _enter = span.enter();

        self.begin(&[ClipState::Created], ClipState::Loading, "load")?;
        tracing::debug!(clip = self.display_name(), "loading");

        let sound_file = match self.sound_files.create(&self.filename, target, &self.cancel) {
            Ok(f) => f,
            Err(Error::UnsupportedFormat(detail)) => {
                tracing::debug!(clip = self.display_name(), "{}", detail);
                let e = Error::UnsupportedFormat(format!("'{}' not supported", self.display_name));
                return Err(self.fail(e, "load"));
            }
            Err(e) => return Err(self.fail(e, "load")),
        };

        if self.is_canceled() {
            sound_file.dispose();
            return Err(self.fail(Error::Canceled, "load"));
        }

        let format = sound_file.wave_format();
        let data_length = sound_file.data_length();
        *self.sound_file() = Some(sound_file);

        {
            let mut inner = self.inner();
            if inner.state != ClipState::Loading {
                // Canceled while storing the sound file.
                drop(inner);
                return Err(self.fail(Error::Canceled, "load"));
            }
            inner.wave_format = Some(format);
            inner.data_length = data_length;
            inner.state = ClipState::Loaded;
        }

        tracing::debug!(
            clip = self.display_name(),
            sample_rate = format.sample_rate,
            channels = format.channels,
            bits_per_sample = format.bits_per_sample,
            data_length,
            "loaded"
        );
        self.emit(ClipEventKind::Loaded);

        Ok(())
    }

    /// Computes the clip's fingerprint, or loads it from the cache.
    ///
    /// Does nothing if the clip is already hashed.
    pub fn calc_hashes(&self) -> Result<()> {
        let span = tracing::span!(tracing::Level::TRACE, "calc_hashes");
        let _enter = span.enter();

        if self.inner().hashes.is_some() {
            return Ok(());
        }

        self.begin(&[ClipState::Loaded], ClipState::Hashing, "hash")?;

        let fp = match self.fingerprinter.create_fingerprint(self) {
            Ok(fp) => fp,
            Err(e) => return Err(self.fail(e, "hash")),
        };

        {
            let mut inner = self.inner();
            if inner.state != ClipState::Hashing || self.is_canceled() {
                drop(inner);
                return Err(self.fail(Error::Canceled, "hash"));
            }
            tracing::debug!(clip = self.display_name(), hashes = fp.len(), "hashed");
            inner.hashes = Some(Arc::new(fp));
            inner.state = ClipState::Hashed;
        }
        self.emit(ClipEventKind::Hashed);

        Ok(())
    }

    /// Aligns this clip against `master`.
    ///
    /// Both clips must be hashed; otherwise [Error::NotYetProcessed] names the clip that is
    /// not ready, checking the master first. On a match the clip becomes
    /// [ClipState::Matched] and its offset is set. Without a match it returns to
    /// [ClipState::Hashed] and `None` is returned.
    pub fn sync(&self, master: &Clip) -> Result<Option<ClipMatch>> {
        let span = tracing::span!(tracing::Level::TRACE, "sync");
        let _enter = span.enter();

        if master.hashes().is_none() {
            return Err(Error::NotYetProcessed(master.display_name().to_string()));
        }
        if self.hashes().is_none() {
            return Err(Error::NotYetProcessed(self.display_name.clone()));
        }

        self.begin(
            &[ClipState::Hashed, ClipState::Matched],
            ClipState::Matching,
            "match",
        )?;

        tracing::debug!(
            clip = self.display_name(),
            master = master.display_name(),
            "matching"
        );

        let result = match self.fingerprinter.match_clips(master, self) {
            Ok(result) => result,
            Err(e) => return Err(self.fail(e, "match")),
        };

        {
            let mut inner = self.inner();
            if inner.state != ClipState::Matching {
                drop(inner);
                return Err(self.fail(Error::Canceled, "match"));
            }
            inner.match_result = result;
            inner.state = match result {
                Some(_) => ClipState::Matched,
                None => ClipState::Hashed,
            };
        }

        match result {
            Some(m) => {
                tracing::info!(
                    clip = self.display_name(),
                    offset = m.offset,
                    match_count = m.match_count,
                    "matched"
                );
                self.emit(ClipEventKind::Matched(m));
            }
            None => {
                tracing::info!(clip = self.display_name(), "no match found");
                self.emit(ClipEventKind::NoMatch);
            }
        }

        Ok(result)
    }

    /// Cancels any work in progress and releases the clip's resources.
    ///
    /// Safe to call any number of times, from any thread.
    pub fn cancel(&self) {
        self.cancel.cancel();

        let changed = {
            let mut inner = self.inner();
            if inner.state.is_terminal() {
                false
            } else {
                inner.state = ClipState::Canceled;
                true
            }
        };

        if changed {
            tracing::debug!(clip = self.display_name(), "canceled");
            self.emit(ClipEventKind::Canceled);
        }

        self.dispose();
    }

    /// Deletes the clip's decoded temp audio and evicts its cached fingerprint.
    ///
    /// Only the first call has an effect.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(f) = self.sound_file().take() {
            f.dispose();
        }
        self.fingerprinter.cleanup(self);
    }

    /// Writes the audio between `start` and `end` (seconds) to a WAV file.
    pub(crate) fn save_excerpt(&self, dest: &Path, start: f64, end: f64) -> Result<()> {
        match self.sound_file().as_ref() {
            Some(f) => f.save_excerpt(dest, start, end),
            None => Err(Error::NotYetProcessed(self.display_name.clone())),
        }
    }
}
