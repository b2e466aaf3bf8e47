use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::audio::{ClipMatch, Fingerprinter, SpectralFingerprinter};
use crate::cache::{DiskCache, FingerprintCache, FINGERPRINT_NAMESPACE, WAV_NAMESPACE};
use crate::clip::{Clip, ClipEvent, ClipEventKind, ClipId};
use crate::config::Config;
use crate::decode::MediaExport;
use crate::task::CancellationToken;
use crate::wave::{DecodedSoundFileFactory, SoundFileFactory};
use crate::{Error, Result};

const GATE_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, PartialEq)]
enum StageOutcome {
    Done,
    Failed(String),
    Canceled,
}

impl StageOutcome {
    fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => StageOutcome::Done,
            Err(e) if e.is_canceled() => StageOutcome::Canceled,
            Err(e) => StageOutcome::Failed(e.to_string()),
        }
    }
}

/// One-shot barrier signaled when a master stage completes.
///
/// Only the first outcome is kept. Waiters poll their own cancellation token, so a canceled
/// LQ pipeline never stays blocked on the master.
#[derive(Debug, Default)]
struct StageGate {
    outcome: Mutex<Option<StageOutcome>>,
    signal: Condvar,
}

impl StageGate {
    fn open(&self, outcome: StageOutcome) {
        let mut current = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        if current.is_none() {
            *current = Some(outcome);
            self.signal.notify_all();
        }
    }

    // Blocks until the stage completes. The master's failure becomes this clip's failure.
    fn wait(&self, master: &str, cancel: &CancellationToken) -> Result<()> {
        let mut current = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            cancel.check()?;
            match current.as_ref() {
                Some(StageOutcome::Done) => return Ok(()),
                Some(StageOutcome::Failed(reason)) => {
                    return Err(Error::MasterFailed {
                        name: master.to_string(),
                        reason: reason.clone(),
                    })
                }
                Some(StageOutcome::Canceled) => {
                    return Err(Error::MasterFailed {
                        name: master.to_string(),
                        reason: Error::Canceled.to_string(),
                    })
                }
                None => (),
            }
            current = self
                .signal
                .wait_timeout(current, GATE_POLL_INTERVAL)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

struct MasterSlot {
    clip: Arc<Clip>,
    loaded: Arc<StageGate>,
    hashed: Arc<StageGate>,
}

// Master pipeline: load at native rate, then hash. Each stage opens its gate whatever
// the outcome so that waiting LQ pipelines always wake up.
fn run_master(clip: &Clip, loaded: &StageGate, hashed: &StageGate) {
    let result = clip.load(None);
    let outcome = StageOutcome::of(&result);
    loaded.open(outcome.clone());
    if result.is_err() {
        hashed.open(outcome);
        return;
    }

    let result = clip.calc_hashes();
    hashed.open(StageOutcome::of(&result));
}

// LQ pipeline: wait for the master to load, load resampled to the master's format, hash,
// wait for the master's hashes, then match.
fn run_lq(clip: &Clip, master: &Clip, loaded: &StageGate, hashed: &StageGate) -> Result<()> {
    let cancel = clip.cancellation();

    loaded
        .wait(master.display_name(), cancel)
        .map_err(|e| clip.fail(e, "wait for master"))?;
    let target = master.wave_format();
    clip.load(target.as_ref())?;
    clip.calc_hashes()?;

    hashed
        .wait(master.display_name(), cancel)
        .map_err(|e| clip.fail(e, "wait for master"))?;
    clip.sync(master)?;

    Ok(())
}

/// Aligns any number of LQ clips against a single master clip.
///
/// Every clip is processed on its own named thread: the master is loaded and hashed, while
/// each LQ clip waits for the master to load (it is resampled to the master's format), then
/// hashes itself, waits for the master's hashes and is matched.
///
/// Pipelines report back through [ClipEvent]s. The collections owned by the
/// [Synchronizer] are only updated by [Synchronizer::process_events] and
/// [Synchronizer::wait], on the thread that owns it.
///
/// # Example
///
/// ```no_run
/// use clipsync::{Config, Synchronizer};
///
/// let mut sync = Synchronizer::new(Config::default()).unwrap();
/// sync.set_master("concert.mp4").unwrap();
/// let lq = sync.add_lq("phone.m4a").unwrap();
/// sync.wait();
/// println!("offset: {:?}", lq.offset());
/// ```
pub struct Synchronizer {
    temp_dir: PathBuf,
    fingerprinter: Arc<dyn Fingerprinter>,
    sound_files: Arc<dyn SoundFileFactory>,
    cache: Arc<dyn FingerprintCache>,
    master: Option<MasterSlot>,
    lq_clips: Vec<Arc<Clip>>,
    workers: Vec<JoinHandle<()>>,
    events_tx: Sender<ClipEvent>,
    events_rx: Receiver<ClipEvent>,
}

impl Synchronizer {
    /// Builds a synchronizer that decodes with `ffmpeg` (or in-process, see
    /// [Config::native_decoder]) and caches fingerprints on disk in the temp dir.
    pub fn new(config: Config) -> Result<Self> {
        config.sync_params.validate()?;

        let cache: Arc<dyn FingerprintCache> = Arc::new(DiskCache::new(&config.temp_dir)?);
        let fingerprinter = SpectralFingerprinter::new(config.sync_params.clone(), cache.clone())?
            .with_threading(config.threading);
        let decoder = crate::decode::from_config(&config)?;
        let sound_files = DecodedSoundFileFactory::new(decoder, &config.temp_dir);

        Ok(Self::with_components(
            &config.temp_dir,
            Arc::new(fingerprinter),
            Arc::new(sound_files),
            cache,
        ))
    }

    /// Builds a synchronizer from its parts.
    pub fn with_components(
        temp_dir: impl Into<PathBuf>,
        fingerprinter: Arc<dyn Fingerprinter>,
        sound_files: Arc<dyn SoundFileFactory>,
        cache: Arc<dyn FingerprintCache>,
    ) -> Self {
        let (events_tx, events_rx) = channel();
        Self {
            temp_dir: temp_dir.into(),
            fingerprinter,
            sound_files,
            cache,
            master: None,
            lq_clips: Vec::new(),
            workers: Vec::new(),
            events_tx,
            events_rx,
        }
    }

    /// Directory holding decoded audio and cached fingerprints.
    pub fn temp_path(&self) -> &Path {
        &self.temp_dir
    }

    pub fn master(&self) -> Option<Arc<Clip>> {
        self.master.as_ref().map(|m| m.clip.clone())
    }

    pub fn lq_clips(&self) -> &[Arc<Clip>] {
        &self.lq_clips
    }

    /// Looks up a master or LQ clip by id.
    pub fn clip(&self, id: ClipId) -> Option<Arc<Clip>> {
        self.master()
            .filter(|m| m.id() == id)
            .or_else(|| self.lq_clips.iter().find(|c| c.id() == id).cloned())
    }

    fn check_source(&self, filename: &Path) -> Result<()> {
        if crate::util::is_in_dir(filename, &self.temp_dir) {
            return Err(Error::TempFolderSource(filename.to_owned()));
        }
        Ok(())
    }

    fn new_clip(&self, filename: &Path) -> Clip {
        Clip::new(filename, self.fingerprinter.clone(), self.sound_files.clone())
            .with_events(self.events_tx.clone())
    }

    fn spawn(&mut self, name: String, f: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = std::thread::Builder::new().name(name).spawn(f)?;
        self.workers.push(handle);
        Ok(())
    }

    /// Sets the master clip and starts loading and hashing it.
    ///
    /// A previous master is canceled together with every LQ clip.
    pub fn set_master(&mut self, filename: impl AsRef<Path>) -> Result<Arc<Clip>> {
        let filename = filename.as_ref();
        self.check_source(filename)?;

        if let Some(old) = self.master.take() {
            tracing::info!(clip = old.clip.display_name(), "replacing master");
            old.clip.cancel();
            self.cancel_lq_clips();
        }

        let clip = Arc::new(self.new_clip(filename));
        let loaded = Arc::new(StageGate::default());
        let hashed = Arc::new(StageGate::default());

        {
            let (clip, loaded, hashed) = (clip.clone(), loaded.clone(), hashed.clone());
            self.spawn(format!("clipsync-master-{}", clip.id()), move || {
                run_master(&clip, &loaded, &hashed)
            })?;
        }

        tracing::info!(clip = clip.display_name(), "master set");
        self.master = Some(MasterSlot {
            clip: clip.clone(),
            loaded,
            hashed,
        });

        Ok(clip)
    }

    /// Adds an LQ clip and starts its pipeline. Requires a master.
    pub fn add_lq(&mut self, filename: impl AsRef<Path>) -> Result<Arc<Clip>> {
        let filename = filename.as_ref();
        self.check_source(filename)?;

        let (master, loaded, hashed) = match &self.master {
            Some(m) => (m.clip.clone(), m.loaded.clone(), m.hashed.clone()),
            None => return Err(Error::NoMaster),
        };

        let clip = Arc::new(self.new_clip(filename));
        {
            let clip = clip.clone();
            self.spawn(format!("clipsync-lq-{}", clip.id()), move || {
                // Failures are already recorded on the clip and reported as events.
                if let Err(e) = run_lq(&clip, &master, &loaded, &hashed) {
                    tracing::debug!(clip = clip.display_name(), "pipeline stopped: {}", e);
                }
            })?;
        }

        tracing::info!(clip = clip.display_name(), "LQ clip added");
        self.lq_clips.push(clip.clone());

        Ok(clip)
    }

    fn cancel_lq_clips(&mut self) {
        for clip in self.lq_clips.drain(..) {
            clip.cancel();
        }
    }

    /// Cancels and removes a clip. Removing the master removes every LQ clip too.
    pub fn cancel(&mut self, id: ClipId) -> Result<()> {
        if self.master.as_ref().map_or(false, |m| m.clip.id() == id) {
            if let Some(master) = self.master.take() {
                master.clip.cancel();
            }
            self.cancel_lq_clips();
            return Ok(());
        }

        match self.lq_clips.iter().position(|c| c.id() == id) {
            Some(idx) => {
                let clip = self.lq_clips.remove(idx);
                clip.cancel();
                Ok(())
            }
            None => Err(Error::ClipNotFound(id)),
        }
    }

    /// Cancels every clip.
    pub fn cancel_all(&mut self) {
        if let Some(master) = self.master.take() {
            master.clip.cancel();
        }
        self.cancel_lq_clips();
    }

    /// Drains pending [ClipEvent]s and removes failed clips from their collection.
    pub fn process_events(&mut self) -> Vec<ClipEvent> {
        let events: Vec<ClipEvent> = self.events_rx.try_iter().collect();

        for event in &events {
            tracing::trace!(clip = %event.display_name, kind = ?event.kind, "clip event");
            if let ClipEventKind::Failed(_) = event.kind {
                if self.master.as_ref().map_or(false, |m| m.clip.id() == event.clip) {
                    self.master = None;
                } else {
                    self.lq_clips.retain(|c| c.id() != event.clip);
                }
            }
        }

        events
    }

    /// Blocks until every running pipeline has finished, then processes pending events.
    pub fn wait(&mut self) -> Vec<ClipEvent> {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("a clip pipeline panicked");
            }
        }
        self.process_events()
    }

    // Returns LQ clip `id`, the master and their match.
    fn matched(&self, id: ClipId) -> Result<(&Arc<Clip>, Arc<Clip>, ClipMatch)> {
        let clip = self
            .lq_clips
            .iter()
            .find(|c| c.id() == id)
            .ok_or(Error::ClipNotFound(id))?;
        let master = self.master().ok_or(Error::NoMaster)?;
        let m = clip
            .match_result()
            .ok_or_else(|| Error::NoMatch(clip.display_name().to_string()))?;
        Ok((clip, master, m))
    }

    /// Writes the part of the master that matches LQ clip `id` to a WAV file at `dest`.
    ///
    /// The excerpt starts at the match position in the master and is as long as the
    /// matched part of the LQ clip.
    pub fn save(&self, id: ClipId, dest: impl AsRef<Path>) -> Result<()> {
        let (clip, master, m) = self.matched(id)?;

        let start = m.track_match_starts_at;
        let length = clip.duration_secs() - m.query_match_starts_at;
        tracing::debug!(
            clip = clip.display_name(),
            start,
            length,
            "saving master excerpt to {}",
            dest.as_ref().display()
        );

        master.save_excerpt(dest.as_ref(), start, start + length)
    }

    /// Describes the synchronized media for LQ clip `id`, to be written with
    /// [FfmpegCommand::export](crate::decode::FfmpegCommand::export).
    ///
    /// The export covers the overlap of both recordings from their match positions.
    pub fn media_export(&self, id: ClipId, keep_video: bool) -> Result<MediaExport> {
        let (clip, master, m) = self.matched(id)?;

        let lq_left = clip.duration_secs() - m.query_match_starts_at;
        let master_left = master.duration_secs() - m.track_match_starts_at;

        Ok(MediaExport {
            lq: clip.filename().to_path_buf(),
            master: master.filename().to_path_buf(),
            query_start: m.query_match_starts_at,
            track_start: m.track_match_starts_at,
            duration: lq_left.min(master_left).max(0.0),
            keep_video,
        })
    }

    /// Cancels every clip, then deletes cached fingerprints and decoded audio.
    pub fn clear_cache(&mut self) -> Result<()> {
        self.cancel_all();
        self.wait();
        self.cache.clear(FINGERPRINT_NAMESPACE)?;
        let removed = crate::util::remove_files_with_extension(&self.temp_dir, WAV_NAMESPACE)?;
        tracing::info!(removed, "cleared cache in {}", self.temp_dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::audio::SyncParams;
    use crate::cache::MemoryCache;
    use crate::clip::ClipState;
    use crate::util::tone_sequence;
    use crate::wave::{MemorySoundFile, SoundFile, WaveFormat};
    use std::collections::HashMap;

    #[derive(Default)]
    struct TestFactory {
        files: HashMap<PathBuf, Vec<i16>>,
        delay: Option<Duration>,
    }

    impl SoundFileFactory for TestFactory {
        fn create(
            &self,
            filename: &Path,
            _target: Option<&WaveFormat>,
            cancel: &CancellationToken,
        ) -> Result<Box<dyn SoundFile>> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            cancel.check()?;
            let samples = self
                .files
                .get(filename)
                .ok_or_else(|| Error::UnsupportedFormat(filename.display().to_string()))?;
            Ok(Box::new(MemorySoundFile::from_samples_i16(filename, 8000, samples)))
        }
    }

    fn synchronizer(factory: TestFactory) -> (Synchronizer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MemoryCache::default());
        let fingerprinter =
            SpectralFingerprinter::new(SyncParams::default(), cache.clone()).unwrap();
        let sync = Synchronizer::with_components(
            dir.path(),
            Arc::new(fingerprinter),
            Arc::new(factory),
            cache,
        );
        (sync, dir)
    }

    fn standard_factory() -> TestFactory {
        let master: Vec<i16> = tone_sequence(256 * 600, 8000)
            .into_iter()
            .map(|s| s as i16)
            .collect();
        let mut files = HashMap::new();
        files.insert(PathBuf::from("lq1.wav"), master[256 * 100..256 * 200].to_vec());
        files.insert(PathBuf::from("lq2.wav"), master[256 * 375..256 * 500].to_vec());
        files.insert(PathBuf::from("master.wav"), master);
        TestFactory { files, delay: None }
    }

    #[test]
    fn test_lq_requires_master() {
        let (mut sync, _dir) = synchronizer(standard_factory());
        assert!(matches!(sync.add_lq("lq1.wav"), Err(Error::NoMaster)));
    }

    #[test]
    fn test_synchronizes_lq_clips() {
        let (mut sync, _dir) = synchronizer(standard_factory());
        let master = sync.set_master("master.wav").unwrap();
        let lq1 = sync.add_lq("lq1.wav").unwrap();
        let lq2 = sync.add_lq("lq2.wav").unwrap();

        let events = sync.wait();

        assert_eq!(master.state(), ClipState::Hashed);
        assert_eq!(lq1.state(), ClipState::Matched);
        assert_eq!(lq2.state(), ClipState::Matched);
        assert!((lq1.offset().unwrap() - 3.2).abs() < 1e-9);
        assert!((lq2.offset().unwrap() - 12.0).abs() < 1e-9);
        assert_eq!(sync.lq_clips().len(), 2);

        let matched = events
            .iter()
            .filter(|e| matches!(e.kind, ClipEventKind::Matched(_)))
            .count();
        assert_eq!(matched, 2);
    }

    #[test]
    fn test_failed_clip_is_removed() {
        let (mut sync, _dir) = synchronizer(standard_factory());
        sync.set_master("master.wav").unwrap();
        let missing = sync.add_lq("missing.mov").unwrap();
        sync.add_lq("lq1.wav").unwrap();

        let events = sync.wait();
        assert_eq!(missing.state(), ClipState::Failed);
        assert!(events.iter().any(|e| e.clip == missing.id()
            && e.kind == ClipEventKind::Failed("'missing.mov' not supported".to_string())));
        assert_eq!(sync.lq_clips().len(), 1);
        assert_eq!(sync.lq_clips()[0].display_name(), "lq1.wav");
    }

    #[test]
    fn test_master_failure_propagates() {
        let (mut sync, _dir) = synchronizer(standard_factory());
        sync.set_master("missing-master.mov").unwrap();
        let lq = sync.add_lq("lq1.wav").unwrap();

        sync.wait();
        assert!(sync.master().is_none());
        assert_eq!(lq.state(), ClipState::Failed);
        assert!(sync.lq_clips().is_empty());
    }

    #[test]
    fn test_replacing_master_cancels_everything() {
        let mut factory = standard_factory();
        factory.delay = Some(Duration::from_millis(200));
        let (mut sync, _dir) = synchronizer(factory);

        let old_master = sync.set_master("master.wav").unwrap();
        let lq = sync.add_lq("lq1.wav").unwrap();
        let new_master = sync.set_master("master.wav").unwrap();

        assert!(old_master.is_canceled());
        assert!(lq.is_canceled());
        assert!(sync.lq_clips().is_empty());

        sync.wait();
        assert_eq!(old_master.state(), ClipState::Canceled);
        assert_eq!(lq.state(), ClipState::Canceled);
        assert_eq!(new_master.state(), ClipState::Hashed);
        assert_eq!(sync.master().unwrap().id(), new_master.id());
    }

    #[test]
    fn test_cancel_master_cancels_lq_clips() {
        let mut factory = standard_factory();
        factory.delay = Some(Duration::from_millis(200));
        let (mut sync, _dir) = synchronizer(factory);

        let master = sync.set_master("master.wav").unwrap();
        let lq = sync.add_lq("lq1.wav").unwrap();
        sync.cancel(master.id()).unwrap();

        sync.wait();
        assert!(sync.master().is_none());
        assert!(sync.lq_clips().is_empty());
        assert_eq!(lq.state(), ClipState::Canceled);
        assert!(matches!(sync.cancel(lq.id()), Err(Error::ClipNotFound(_))));
    }

    #[test]
    fn test_rejects_temp_folder_sources() {
        let (mut sync, dir) = synchronizer(standard_factory());
        let inside = dir.path().join("decoded.wav");
        std::fs::write(&inside, b"").unwrap();
        assert!(matches!(
            sync.set_master(&inside),
            Err(Error::TempFolderSource(_))
        ));
    }

    #[test]
    fn test_save_master_excerpt() {
        let (mut sync, dir) = synchronizer(standard_factory());
        sync.set_master("master.wav").unwrap();
        let lq = sync.add_lq("lq1.wav").unwrap();
        sync.wait();

        let dest = dir.path().join("excerpt.wav");
        sync.save(lq.id(), &dest).unwrap();
        let reader = hound::WavReader::open(&dest).unwrap();
        assert_eq!(reader.len(), 256 * 100);
    }

    #[test]
    fn test_save_without_match() {
        let mut factory = standard_factory();
        factory
            .files
            .insert(PathBuf::from("silence.wav"), vec![0; 256 * 20]);
        let (mut sync, dir) = synchronizer(factory);
        sync.set_master("master.wav").unwrap();
        let lq = sync.add_lq("silence.wav").unwrap();
        sync.wait();

        assert_eq!(lq.state(), ClipState::Hashed);
        assert!(matches!(
            sync.save(lq.id(), dir.path().join("x.wav")),
            Err(Error::NoMatch(_))
        ));
    }

    #[test]
    fn test_media_export() {
        let mut factory = standard_factory();
        // Runs 1.6 s past the end of the master.
        let mut tail = factory.files[Path::new("master.wav")][256 * 500..].to_vec();
        tail.extend(vec![0; 256 * 50]);
        factory.files.insert(PathBuf::from("tail.wav"), tail);

        let (mut sync, _dir) = synchronizer(factory);
        sync.set_master("master.wav").unwrap();
        let lq1 = sync.add_lq("lq1.wav").unwrap();
        let lq2 = sync.add_lq("lq2.wav").unwrap();
        let tail = sync.add_lq("tail.wav").unwrap();
        sync.wait();

        let export = sync.media_export(lq1.id(), true).unwrap();
        assert_eq!(export.lq, PathBuf::from("lq1.wav"));
        assert_eq!(export.master, PathBuf::from("master.wav"));
        assert_eq!(export.query_start, 0.0);
        assert!((export.track_start - 3.2).abs() < 1e-9);
        assert!((export.duration - 3.2).abs() < 1e-9);
        assert!(export.keep_video);

        let export = sync.media_export(lq2.id(), false).unwrap();
        assert!((export.track_start - 12.0).abs() < 1e-9);
        assert!((export.duration - 4.0).abs() < 1e-9);
        assert!(!export.keep_video);

        // Limited by what is left of the master.
        let export = sync.media_export(tail.id(), true).unwrap();
        assert!((export.track_start - 16.0).abs() < 1e-9);
        assert!((export.duration - 3.2).abs() < 1e-9);
    }

    #[test]
    fn test_media_export_without_match() {
        let mut factory = standard_factory();
        factory
            .files
            .insert(PathBuf::from("silence.wav"), vec![0; 256 * 20]);
        let (mut sync, _dir) = synchronizer(factory);
        sync.set_master("master.wav").unwrap();
        let lq = sync.add_lq("silence.wav").unwrap();
        sync.wait();

        assert!(matches!(
            sync.media_export(lq.id(), true),
            Err(Error::NoMatch(_))
        ));
        assert!(matches!(
            sync.media_export(sync.master().unwrap().id(), true),
            Err(Error::ClipNotFound(_))
        ));
    }

    #[test]
    fn test_stage_gate() {
        let gate = Arc::new(StageGate::default());
        let cancel = CancellationToken::new();

        let waiter = {
            let (gate, cancel) = (gate.clone(), cancel.clone());
            std::thread::spawn(move || gate.wait("master.wav", &cancel))
        };
        gate.open(StageOutcome::Failed("boom".to_string()));
        gate.open(StageOutcome::Done);

        match waiter.join().unwrap() {
            Err(Error::MasterFailed { name, reason }) => {
                assert_eq!(name, "master.wav");
                assert_eq!(reason, "boom");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let pending = StageGate::default();
        cancel.cancel();
        assert!(matches!(
            pending.wait("master.wav", &cancel),
            Err(Error::Canceled)
        ));
    }
}
