use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};

use super::{find_best_offset, ClipMatch, Fingerprint, SyncParams};
use crate::cache::{CacheKey, FingerprintCache};
use crate::clip::{Clip, ClipId};
use crate::task::{CancellationToken, Progress};
use crate::wave::WaveFormat;
use crate::{Error, Result};

/// Something that can fingerprint clips and find one clip inside another.
///
/// A single instance is shared by the master and every LQ clip of a [Synchronizer](crate::Synchronizer).
pub trait Fingerprinter: Send + Sync {
    /// Computes (or loads from cache) the fingerprint of a loaded clip.
    fn create_fingerprint(&self, clip: &Clip) -> Result<Fingerprint>;

    /// Aligns `query` against `master`. Both clips must be hashed. Returns `None` if no
    /// alignment was found.
    fn match_clips(&self, master: &Clip, query: &Clip) -> Result<Option<ClipMatch>>;

    /// Evicts any cached data held for `clip`, unless another clip still relies on it.
    fn cleanup(&self, clip: &Clip);
}

/// Combines per-bucket dominant frequencies into a single 32-bit hash.
///
/// `acc = v[0]`, then `acc = rotl(acc, 5) ^ v` for each following value. A single value is
/// returned unchanged and an empty slice hashes to 0.
pub fn combine_hashes(values: &[u32]) -> u32 {
    match values.split_first() {
        None => 0,
        Some((first, rest)) => rest
            .iter()
            .fold(*first, |acc, v| acc.rotate_left(5) ^ v),
    }
}

// Reusable FFT state for hashing one window at a time.
struct WindowHasher {
    fft: Arc<dyn RealToComplex<f64>>,
    coefficients: Vec<f64>,
    input: Vec<f64>,
    output: Vec<Complex<f64>>,
    dominant: Vec<u32>,
    half: usize,
    step: usize,
}

impl WindowHasher {
    fn new(params: &SyncParams) -> Self {
        let mut planner = RealFftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(params.window_length);
        let input = fft.make_input_vec();
        let output = fft.make_output_vec();

        Self {
            fft,
            coefficients: params.window_function.coefficients(params.window_length),
            input,
            output,
            dominant: Vec::with_capacity(params.bucket_count()),
            half: params.window_length / 2,
            step: params.freq_range_step,
        }
    }

    // Hashes the samples currently held in `self.input`.
    //
    // The transform direction does not matter here: for real input, the inverse transform
    // is the complex conjugate of the forward one and the bin magnitudes are identical.
    fn hash_input(&mut self) -> Result<u32> {
        for (x, w) in self.input.iter_mut().zip(&self.coefficients) {
            *x *= w;
        }

        self.fft
            .process(&mut self.input, &mut self.output)
            .map_err(|e| Error::InvalidParams(e.to_string()))?;

        self.dominant.clear();
        let mut start = 0;
        while start < self.half {
            let end = (start + self.step).min(self.half);

            // Ties keep the lowest bin. A silent bucket (log10(0) = -inf) keeps its first bin.
            let mut best_bin = start;
            let mut best_magnitude = f64::NEG_INFINITY;
            for bin in start..end {
                let magnitude = self.output[bin].norm().log10();
                if magnitude > best_magnitude {
                    best_magnitude = magnitude;
                    best_bin = bin;
                }
            }

            self.dominant.push(best_bin as u32);
            start = end;
        }

        Ok(combine_hashes(&self.dominant))
    }
}

// Fills `buf` completely. Returns false if the stream ended first.
fn read_window(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Fingerprints audio by picking the loudest frequency of each bucket in each window.
///
/// This is a best-effort spectral-peak heuristic and is not robust to noise or EQ
/// differences between recordings.
///
/// At a high-level, for every window of `L` samples of the first channel:
///
/// 1. Applies the configured window function
/// 2. Transforms the window into `L / 2` frequency bins
/// 3. Picks the dominant bin of every bucket of `freq_range_step` bins
/// 4. Combines the dominant bins into a single hash with [combine_hashes]
///
/// Fingerprints are stored in a [FingerprintCache] keyed by file and sample rate. A cached
/// fingerprint is only reused if it was built with the same [SyncParams].
pub struct SpectralFingerprinter {
    params: SyncParams,
    cache: Arc<dyn FingerprintCache>,
    threading: bool,
    // Clips currently relying on each cache entry. Entries are evicted by the last one.
    holders: Mutex<HashMap<CacheKey, HashSet<ClipId>>>,
}

impl SpectralFingerprinter {
    pub fn new(params: SyncParams, cache: Arc<dyn FingerprintCache>) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            cache,
            threading: true,
            holders: Mutex::new(HashMap::new()),
        })
    }

    /// Returns a new [SpectralFingerprinter] with `threading` set to the provided value.
    ///
    /// When disabled (or when the `rayon` feature is off), the offset search runs on the
    /// calling thread.
    pub fn with_threading(mut self, threading: bool) -> Self {
        self.threading = threading;
        self
    }

    pub fn params(&self) -> &SyncParams {
        &self.params
    }

    /// Hashes raw little-endian PCM frames read from `reader`.
    ///
    /// Only the first channel of each frame is used. Reading stops at the end of the stream
    /// or after `max_windows` windows; a trailing partial window is dropped.
    pub fn hash_stream(
        &self,
        mut reader: impl Read,
        format: &WaveFormat,
        max_windows: Option<u64>,
        cancel: &CancellationToken,
        progress: &Progress,
    ) -> Result<Vec<u32>> {
        let span = tracing::span!(tracing::Level::TRACE, "hash_stream");
        let _enter = span.enter();

        let bits = format.bits_per_sample;
        if !matches!(bits, 8 | 16 | 32) {
            return Err(Error::UnsupportedFormat(format!(
                "bit depth '{}' not supported; try 8, 16 or 32-bit audio instead",
                bits
            )));
        }

        let l = self.params.window_length;
        let block_align = format.block_align() as usize;
        if block_align == 0 {
            return Err(Error::UnsupportedFormat(
                "audio stream has no channels".to_string(),
            ));
        }

        let mut hasher = WindowHasher::new(&self.params);
        let mut buf = vec![0u8; block_align * l];
        let mut hashes = Vec::new();

        loop {
            cancel.check()?;

            if max_windows.map_or(false, |max| hashes.len() as u64 >= max) {
                break;
            }
            if !read_window(&mut reader, &mut buf)? {
                break;
            }

            for (sample, frame) in hasher.input.iter_mut().zip(buf.chunks_exact(block_align)) {
                *sample = match bits {
                    8 => frame[0] as f64,
                    16 => i16::from_le_bytes([frame[0], frame[1]]) as f64,
                    _ => i32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as f64,
                };
            }

            hashes.push(hasher.hash_input()?);
            progress.increment();
        }

        Ok(hashes)
    }

    /// Hashes mono samples that are already in memory.
    pub fn hashes_from_samples(&self, samples: &[i32]) -> Result<Vec<u32>> {
        let mut hasher = WindowHasher::new(&self.params);
        samples
            .chunks_exact(self.params.window_length)
            .map(|window| {
                for (x, s) in hasher.input.iter_mut().zip(window) {
                    *x = *s as f64;
                }
                hasher.hash_input()
            })
            .collect()
    }

    fn cache_key(clip: &Clip, format: &WaveFormat) -> CacheKey {
        CacheKey::new(clip.filename(), format.sample_rate)
    }

    fn holders(&self) -> MutexGuard<'_, HashMap<CacheKey, HashSet<ClipId>>> {
        self.holders.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Records that `clip` relies on the cache entry for `key`.
    fn hold(&self, key: &CacheKey, clip: ClipId) {
        self.holders().entry(key.clone()).or_default().insert(clip);
    }

    // Drops `clip`'s hold on `key`. Returns true once no other clip holds it.
    fn release(&self, key: &CacheKey, clip: ClipId) -> bool {
        let mut holders = self.holders();
        match holders.get_mut(key) {
            Some(ids) => {
                ids.remove(&clip);
                if ids.is_empty() {
                    holders.remove(key);
                    true
                } else {
                    false
                }
            }
            None => true,
        }
    }

    fn evict(&self, clip: &Clip, key: &CacheKey) {
        if !self.release(key, clip.id()) {
            tracing::debug!(clip = clip.display_name(), "fingerprint still used by another clip");
            return;
        }
        if let Err(e) = self.cache.remove(key) {
            tracing::warn!(clip = clip.display_name(), "failed to evict fingerprint: {}", e);
        }
    }

    // Stores a freshly computed fingerprint. A clip canceled around the write may already
    // have evicted its key, so its entry is dropped again.
    fn publish(&self, clip: &Clip, key: &CacheKey, fp: &Fingerprint) -> Result<()> {
        clip.cancellation().check()?;

        // A failed cache write only costs a recomputation next time.
        if let Err(e) = self.cache.set(key, fp) {
            tracing::warn!(clip = clip.display_name(), "failed to cache fingerprint: {}", e);
        }

        if clip.is_canceled() {
            self.evict(clip, key);
            return Err(Error::Canceled);
        }
        Ok(())
    }
}

impl Fingerprinter for SpectralFingerprinter {
    fn create_fingerprint(&self, clip: &Clip) -> Result<Fingerprint> {
        let format = clip.wave_format().ok_or_else(|| Error::InvalidState {
            name: clip.display_name().to_string(),
            operation: "fingerprint",
            state: clip.state(),
        })?;
        let key = Self::cache_key(clip, &format);
        self.hold(&key, clip.id());

        match self.cache.get(&key) {
            Ok(Some(fp)) if fp.params() == &self.params => {
                tracing::debug!(
                    clip = clip.display_name(),
                    hashes = fp.len(),
                    "loaded fingerprint from cache"
                );
                clip.progress().start(fp.len() as u64);
                clip.progress().finish();
                return Ok(fp);
            }
            Ok(Some(fp)) => tracing::debug!(
                clip = clip.display_name(),
                cached = ?fp.params(),
                "cached fingerprint was built with other params"
            ),
            Ok(None) => (),
            Err(e) => tracing::warn!(clip = clip.display_name(), "ignoring unreadable cache entry: {}", e),
        }

        let windows = clip.data_length() / self.params.window_length as u64;
        clip.progress().start(windows);

        tracing::debug!(clip = clip.display_name(), windows, "starting fingerprinting");

        let reader = clip.open_pcm()?;
        let hashes = self.hash_stream(
            std::io::BufReader::new(reader),
            &format,
            Some(windows),
            clip.cancellation(),
            clip.progress(),
        )?;

        let fp = Fingerprint::new(hashes, format.sample_rate, self.params.clone());
        self.publish(clip, &key, &fp)?;

        Ok(fp)
    }

    fn match_clips(&self, master: &Clip, query: &Clip) -> Result<Option<ClipMatch>> {
        let master_fp = master
            .hashes()
            .ok_or_else(|| Error::NotYetProcessed(master.display_name().to_string()))?;
        let query_fp = query
            .hashes()
            .ok_or_else(|| Error::NotYetProcessed(query.display_name().to_string()))?;

        if master_fp.sample_rate() != query_fp.sample_rate() {
            tracing::warn!(
                master_rate = master_fp.sample_rate(),
                query_rate = query_fp.sample_rate(),
                "comparing fingerprints with different sample rates"
            );
        }

        let best = find_best_offset(
            master_fp.hashes(),
            query_fp.hashes(),
            query.cancellation(),
            query.progress(),
            self.threading,
        )?;

        let sample_rate = query_fp.sample_rate();
        Ok(best.map(|b| {
            let hq_position = self.params.window_to_seconds(b.track_index as i64, sample_rate);
            let lq_position = self.params.window_to_seconds(b.query_index as i64, sample_rate);
            let offset = self.params.window_to_seconds(b.offset, sample_rate);
            tracing::debug!(hq_position, lq_position, offset, "seek positions");
            ClipMatch::new(lq_position, hq_position, offset).with_match_count(b.match_count)
        }))
    }

    fn cleanup(&self, clip: &Clip) {
        if let Some(format) = clip.wave_format() {
            self.evict(clip, &Self::cache_key(clip, &format));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::clip::ClipState;
    use crate::util::tone_sequence;
    use crate::wave::{MemorySoundFile, SoundFile, SoundFileFactory};
    use std::path::Path;

    fn fingerprinter(params: SyncParams) -> SpectralFingerprinter {
        SpectralFingerprinter::new(params, Arc::new(MemoryCache::default())).unwrap()
    }

    // Serves the same mono PCM for every file name.
    struct SameAudio {
        format: WaveFormat,
        samples: Vec<i16>,
    }

    impl SameAudio {
        fn new(sample_rate: u32, samples: Vec<i16>) -> Arc<dyn SoundFileFactory> {
            Arc::new(Self {
                format: WaveFormat::new(sample_rate, 1, 16),
                samples,
            })
        }
    }

    impl SoundFileFactory for SameAudio {
        fn create(
            &self,
            filename: &Path,
            _target: Option<&WaveFormat>,
            cancel: &CancellationToken,
        ) -> Result<Box<dyn SoundFile>> {
            cancel.check()?;
            let data = self.samples.iter().flat_map(|s| s.to_le_bytes()).collect();
            Ok(Box::new(MemorySoundFile::new(filename, self.format, data)))
        }
    }

    // Cancels the clip being hashed while its fingerprint is written.
    #[derive(Default)]
    struct CancelOnWrite {
        inner: MemoryCache,
        token: Mutex<Option<CancellationToken>>,
    }

    impl FingerprintCache for CancelOnWrite {
        fn get(&self, key: &CacheKey) -> Result<Option<Fingerprint>> {
            self.inner.get(key)
        }

        fn set(&self, key: &CacheKey, fingerprint: &Fingerprint) -> Result<()> {
            self.inner.set(key, fingerprint)?;
            if let Some(token) = self.token.lock().unwrap().as_ref() {
                token.cancel();
            }
            Ok(())
        }

        fn remove(&self, key: &CacheKey) -> Result<()> {
            self.inner.remove(key)
        }

        fn clear(&self, namespace: &str) -> Result<()> {
            self.inner.clear(namespace)
        }
    }

    fn pseudo_random_hashes(n: usize, seed: u32) -> Vec<u32> {
        let mut x = seed;
        (0..n)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x
            })
            .collect()
    }

    // Aligns `lq` against `hq` through clips whose fingerprints are already cached.
    fn match_cached(hq: Vec<u32>, lq: Vec<u32>, sample_rate: u32) -> ClipMatch {
        let params = SyncParams::default();
        let cache = Arc::new(MemoryCache::default());
        cache
            .set(
                &CacheKey::new("master.mov", sample_rate),
                &Fingerprint::new(hq, sample_rate, params.clone()),
            )
            .unwrap();
        cache
            .set(
                &CacheKey::new("lq.mov", sample_rate),
                &Fingerprint::new(lq, sample_rate, params.clone()),
            )
            .unwrap();

        let fp = Arc::new(SpectralFingerprinter::new(params, cache).unwrap());
        let audio = SameAudio::new(sample_rate, vec![0; 256]);
        let master = Clip::new("master.mov", fp.clone(), audio.clone());
        let lq = Clip::new("lq.mov", fp, audio);
        for clip in [&master, &lq] {
            clip.load(None).unwrap();
            clip.calc_hashes().unwrap();
        }
        lq.sync(&master).unwrap().unwrap()
    }

    #[test]
    fn test_match_positions_in_seconds() {
        let hq = pseudo_random_hashes(1800, 7);
        let lq = hq[100..200].to_vec();

        let m = match_cached(hq, lq, 48000);
        assert!((m.track_match_starts_at - 0.5333).abs() < 1e-4);
        assert_eq!(m.query_match_starts_at, 0.0);
        assert!((m.offset - m.track_match_starts_at).abs() < 1e-12);
        assert_eq!(m.match_count, 100);
    }

    #[test]
    fn test_clip_starting_five_minutes_in() {
        // 300 s at 48 kHz with 256-sample windows.
        let hq = pseudo_random_hashes(60000, 3);
        let lq = hq[56250..56350].to_vec();

        let m = match_cached(hq, lq, 48000);
        assert!((m.offset - 300.0).abs() < 1e-9);
        assert!((m.track_match_starts_at - 300.0).abs() < 1e-9);
        assert_eq!(m.query_match_starts_at, 0.0);
    }

    #[test]
    fn test_cache_hit_requires_same_params() {
        let cache = Arc::new(MemoryCache::default());
        let samples: Vec<i16> = tone_sequence(256 * 20, 8000)
            .into_iter()
            .map(|s| s as i16)
            .collect();
        let pcm: Vec<i32> = samples.iter().map(|s| *s as i32).collect();
        let audio = SameAudio::new(8000, samples);

        let narrow = Arc::new(
            SpectralFingerprinter::new(SyncParams::default().with_freq_range_step(40), cache.clone())
                .unwrap(),
        );
        let wide = Arc::new(SpectralFingerprinter::new(SyncParams::default(), cache.clone()).unwrap());

        let a = Clip::new("clip.wav", narrow.clone(), audio.clone());
        a.load(None).unwrap();
        a.calc_hashes().unwrap();
        let b = Clip::new("clip.wav", wide.clone(), audio);
        b.load(None).unwrap();
        b.calc_hashes().unwrap();

        let a_hashes = a.hashes().unwrap();
        let b_hashes = b.hashes().unwrap();
        assert_eq!(a_hashes.hashes(), narrow.hashes_from_samples(&pcm).unwrap().as_slice());
        assert_eq!(b_hashes.hashes(), wide.hashes_from_samples(&pcm).unwrap().as_slice());
        assert_ne!(a_hashes.hashes(), b_hashes.hashes());

        let cached = cache.get(&CacheKey::new("clip.wav", 8000)).unwrap().unwrap();
        assert_eq!(cached.params(), wide.params());
    }

    #[test]
    fn test_cancel_during_cache_write() {
        let cache = Arc::new(CancelOnWrite::default());
        let fp = Arc::new(SpectralFingerprinter::new(SyncParams::default(), cache.clone()).unwrap());
        let samples = tone_sequence(256 * 10, 8000).into_iter().map(|s| s as i16).collect();
        let clip = Clip::new("clip.wav", fp, SameAudio::new(8000, samples));

        clip.load(None).unwrap();
        *cache.token.lock().unwrap() = Some(clip.cancellation().clone());

        assert!(matches!(clip.calc_hashes(), Err(Error::Canceled)));
        assert_eq!(clip.state(), ClipState::Canceled);
        assert!(clip.hashes().is_none());
        assert!(cache.inner.is_empty());
    }

    fn to_pcm16(samples: &[i32]) -> Vec<u8> {
        samples
            .iter()
            .flat_map(|s| (*s as i16).to_le_bytes())
            .collect()
    }

    #[test]
    fn test_combine_hashes() {
        assert_eq!(combine_hashes(&[]), 0);
        assert_eq!(combine_hashes(&[42]), 42);
        assert_eq!(combine_hashes(&[1, 2]), (1 << 5) ^ 2);
        assert_eq!(combine_hashes(&[0x8000_0000, 0]), 0x10);
        assert_eq!(combine_hashes(&[3, 61, 127]), ((3u32.rotate_left(5) ^ 61).rotate_left(5)) ^ 127);
    }

    #[test]
    fn test_window_count_law() {
        let fp = fingerprinter(SyncParams::default());
        let samples = tone_sequence(256 * 10 + 255, 8000);
        assert_eq!(fp.hashes_from_samples(&samples).unwrap().len(), 10);

        let format = WaveFormat::new(8000, 1, 16);
        let hashes = fp
            .hash_stream(
                to_pcm16(&samples).as_slice(),
                &format,
                None,
                &CancellationToken::new(),
                &Progress::new(),
            )
            .unwrap();
        assert_eq!(hashes.len(), 10);
    }

    #[test]
    fn test_determinism() {
        let fp = fingerprinter(SyncParams::default());
        let samples = tone_sequence(256 * 40, 8000);
        let a = fp.hashes_from_samples(&samples).unwrap();
        let b = fp.hashes_from_samples(&samples).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_stream_matches_samples() {
        let fp = fingerprinter(SyncParams::default());
        let samples = tone_sequence(256 * 20, 8000);
        let from_samples = fp.hashes_from_samples(&samples).unwrap();
        let from_stream = fp
            .hash_stream(
                to_pcm16(&samples).as_slice(),
                &WaveFormat::new(8000, 1, 16),
                None,
                &CancellationToken::new(),
                &Progress::new(),
            )
            .unwrap();
        assert_eq!(from_samples, from_stream);
    }

    #[test]
    fn test_reads_first_channel_only() {
        let fp = fingerprinter(SyncParams::default());
        let left = tone_sequence(256 * 8, 8000);
        let stereo: Vec<u8> = left
            .iter()
            .enumerate()
            .flat_map(|(i, s)| {
                let right = ((i * 7919) % 20000) as i16;
                let mut frame = (*s as i16).to_le_bytes().to_vec();
                frame.extend_from_slice(&right.to_le_bytes());
                frame
            })
            .collect();

        let hashes = fp
            .hash_stream(
                stereo.as_slice(),
                &WaveFormat::new(8000, 2, 16),
                None,
                &CancellationToken::new(),
                &Progress::new(),
            )
            .unwrap();
        assert_eq!(hashes, fp.hashes_from_samples(&left).unwrap());
    }

    #[test]
    fn test_single_bucket_law() {
        let params = SyncParams::default().with_freq_range_step(128);
        let fp = fingerprinter(params);

        // A pure tone at exactly bin 32 of a 256-sample window.
        let samples: Vec<i32> = (0..256 * 4)
            .map(|i| {
                let phase = 2.0 * std::f64::consts::PI * 32.0 * i as f64 / 256.0;
                (phase.sin() * 10000.0) as i32
            })
            .collect();

        let hashes = fp.hashes_from_samples(&samples).unwrap();
        assert_eq!(hashes, vec![32; 4]);
    }

    #[test]
    fn test_unsupported_bit_depth() {
        let fp = fingerprinter(SyncParams::default());
        let result = fp.hash_stream(
            &[0u8; 3 * 512][..],
            &WaveFormat::new(8000, 1, 24),
            None,
            &CancellationToken::new(),
            &Progress::new(),
        );
        assert!(matches!(result, Err(Error::UnsupportedFormat(_))));
    }

    #[test]
    fn test_canceled_hashing() {
        let fp = fingerprinter(SyncParams::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = fp.hash_stream(
            &[0u8; 2 * 1024][..],
            &WaveFormat::new(8000, 1, 16),
            None,
            &cancel,
            &Progress::new(),
        );
        assert!(matches!(result, Err(Error::Canceled)));
    }

    #[test]
    fn test_shifted_audio_aligns() {
        let fp = fingerprinter(SyncParams::default());
        let master = tone_sequence(256 * 400, 8000);
        let hq = fp.hashes_from_samples(&master).unwrap();
        let lq = fp.hashes_from_samples(&master[256 * 150..256 * 250]).unwrap();

        let best = find_best_offset(&hq, &lq, &CancellationToken::new(), &Progress::new(), true)
            .unwrap()
            .unwrap();
        assert_eq!(best.offset, 150);
        assert_eq!(best.match_count, 100);
    }
}
