use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::decode::Decoder;
use crate::task::CancellationToken;
use crate::{Error, Result};

/// Sample rate, channel count and bit depth of a PCM stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct WaveFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl WaveFormat {
    pub fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
        }
    }

    /// Bytes per sample frame (all channels).
    pub fn block_align(&self) -> u32 {
        self.channels as u32 * (self.bits_per_sample as u32 / 8)
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.block_align() as u64
    }
}

impl From<hound::WavSpec> for WaveFormat {
    fn from(spec: hound::WavSpec) -> Self {
        Self::new(spec.sample_rate, spec.channels, spec.bits_per_sample)
    }
}

/// Decoded audio belonging to a clip.
///
/// Implementations expose the audio as headerless little-endian PCM frames and can write
/// a time range of it to a new WAV file.
pub trait SoundFile: Send + Sync {
    /// The source this audio was decoded from.
    fn filename(&self) -> &Path;

    fn wave_format(&self) -> WaveFormat;

    /// Length in sample frames.
    fn data_length(&self) -> u64;

    /// Length of the PCM data in bytes.
    fn byte_length(&self) -> u64;

    /// Opens a new reader over the raw PCM frames.
    fn pcm_reader(&self) -> Result<Box<dyn Read + Send>>;

    /// Writes the audio between `start` and `end` (seconds) to a WAV file at `dest`.
    fn save_excerpt(&self, dest: &Path, start: f64, end: f64) -> Result<()>;

    /// Releases any temporary resources. Must be safe to call more than once.
    fn dispose(&self);
}

/// Creates [SoundFile]s for clips.
pub trait SoundFileFactory: Send + Sync {
    /// Opens `filename`, resampling to `target` if provided.
    ///
    /// `cancel` is observed while waiting on a decoder.
    fn create(
        &self,
        filename: &Path,
        target: Option<&WaveFormat>,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn SoundFile>>;
}

// Copies the PCM bytes between `start` and `end` seconds into a new WAV file.
fn write_excerpt(
    mut reader: impl Read,
    format: &WaveFormat,
    byte_length: u64,
    dest: &Path,
    start: f64,
    end: f64,
) -> Result<()> {
    let block_align = format.block_align() as u64;
    let to_byte = |secs: f64| -> u64 {
        let frames = (secs.max(0.0) * format.sample_rate as f64).round() as u64;
        (frames * block_align).min(byte_length)
    };
    let (start, end) = (to_byte(start), to_byte(end));

    std::io::copy(&mut (&mut reader).take(start), &mut std::io::sink())?;

    let spec = hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: format.bits_per_sample,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(dest, spec)?;

    let mut frame = vec![0u8; block_align as usize];
    let mut remaining = end.saturating_sub(start) / block_align;
    while remaining > 0 {
        if let Err(e) = reader.read_exact(&mut frame) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                break;
            }
            return Err(e.into());
        }
        for sample in frame.chunks_exact(format.bits_per_sample as usize / 8) {
            match sample.len() {
                1 => writer.write_sample(sample[0] as i8 ^ i8::MIN)?,
                2 => writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?,
                3 => writer.write_sample(i32::from_le_bytes([0, sample[0], sample[1], sample[2]]) >> 8)?,
                _ => writer.write_sample(i32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]))?,
            }
        }
        remaining -= 1;
    }

    writer.finalize()?;
    Ok(())
}

/// Temp files shared between sound files.
///
/// Every holder of a path takes a lease on it; the file is deleted when the last lease is
/// released.
#[derive(Debug, Default)]
pub struct TempFiles {
    leases: Mutex<HashMap<PathBuf, usize>>,
}

impl TempFiles {
    fn leases(&self) -> MutexGuard<'_, HashMap<PathBuf, usize>> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn acquire(&self, path: &Path) {
        *self.leases().entry(path.to_owned()).or_insert(0) += 1;
    }

    /// Releases one lease on `path`, deleting the file if it was the last one.
    pub fn release(&self, path: &Path) {
        let mut leases = self.leases();
        if let Some(count) = leases.get_mut(path) {
            *count -= 1;
            if *count > 0 {
                return;
            }
            leases.remove(path);
        }

        // Deleted under the lock so that a new lease never sees a file being removed.
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!("removed temp file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => tracing::warn!("failed to remove temp file {}: {}", path.display(), e),
        }
    }

    /// Number of leases currently held on `path`.
    pub fn holders(&self, path: &Path) -> usize {
        self.leases().get(path).copied().unwrap_or(0)
    }
}

/// A PCM WAV file on disk.
///
/// If the file is temporary (e.g., decoded from a video), it is deleted on [SoundFile::dispose]
/// once no other sound file uses it.
pub struct WavFile {
    source: PathBuf,
    path: PathBuf,
    format: WaveFormat,
    data_offset: u64,
    byte_length: u64,
    temp_files: Option<Arc<TempFiles>>,
    disposed: AtomicBool,
}

impl WavFile {
    /// Opens an existing WAV file that is not owned by this process.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Self::open_decoded(path, path, false)
    }

    /// Opens `path`, the decoded form of `source`. If `temporary` is set, the file is
    /// deleted on dispose.
    pub fn open_decoded(source: &Path, path: &Path, temporary: bool) -> Result<Self> {
        let temp_files = temporary.then(|| {
            let temp_files = Arc::new(TempFiles::default());
            temp_files.acquire(path);
            temp_files
        });
        Self::open_leased(source, path, temp_files)
    }

    // Opens a temp file on which a lease is already held in `temp_files`.
    fn open_leased(source: &Path, path: &Path, temp_files: Option<Arc<TempFiles>>) -> Result<Self> {
        let reader = hound::WavReader::new(BufReader::new(File::open(path)?))?;
        let spec = reader.spec();
        if spec.sample_format != hound::SampleFormat::Int {
            return Err(Error::UnsupportedFormat(format!(
                "'{}' is not integer PCM",
                path.display()
            )));
        }
        let format = WaveFormat::from(spec);

        // hound leaves the reader positioned at the start of the sample data.
        let byte_length = reader.len() as u64 * (spec.bits_per_sample as u64 / 8);
        let mut inner = reader.into_inner();
        let data_offset = inner.seek(SeekFrom::Current(0))?;

        Ok(Self {
            source: source.to_owned(),
            path: path.to_owned(),
            format,
            data_offset,
            byte_length,
            temp_files,
            disposed: AtomicBool::new(false),
        })
    }

    /// Path of the WAV file itself.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SoundFile for WavFile {
    fn filename(&self) -> &Path {
        &self.source
    }

    fn wave_format(&self) -> WaveFormat {
        self.format
    }

    fn data_length(&self) -> u64 {
        match self.format.block_align() {
            0 => 0,
            align => self.byte_length / align as u64,
        }
    }

    fn byte_length(&self) -> u64 {
        self.byte_length
    }

    fn pcm_reader(&self) -> Result<Box<dyn Read + Send>> {
        let mut f = File::open(&self.path)?;
        f.seek(SeekFrom::Start(self.data_offset))?;
        Ok(Box::new(f.take(self.byte_length)))
    }

    fn save_excerpt(&self, dest: &Path, start: f64, end: f64) -> Result<()> {
        let reader = BufReader::new(self.pcm_reader()?);
        write_excerpt(reader, &self.format, self.byte_length, dest, start, end)
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(temp_files) = &self.temp_files {
            temp_files.release(&self.path);
        }
    }
}

/// PCM audio held in memory.
pub struct MemorySoundFile {
    source: PathBuf,
    format: WaveFormat,
    data: Arc<Vec<u8>>,
}

impl MemorySoundFile {
    pub fn new(source: impl Into<PathBuf>, format: WaveFormat, data: Vec<u8>) -> Self {
        Self {
            source: source.into(),
            format,
            data: Arc::new(data),
        }
    }

    /// Builds a 16-bit mono sound file from samples.
    pub fn from_samples_i16(source: impl Into<PathBuf>, sample_rate: u32, samples: &[i16]) -> Self {
        let data = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::new(source, WaveFormat::new(sample_rate, 1, 16), data)
    }
}

// Lets the shared buffer be read without copying it.
struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl SoundFile for MemorySoundFile {
    fn filename(&self) -> &Path {
        &self.source
    }

    fn wave_format(&self) -> WaveFormat {
        self.format
    }

    fn data_length(&self) -> u64 {
        match self.format.block_align() {
            0 => 0,
            align => self.data.len() as u64 / align as u64,
        }
    }

    fn byte_length(&self) -> u64 {
        self.data.len() as u64
    }

    fn pcm_reader(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(SharedBytes(self.data.clone()))))
    }

    fn save_excerpt(&self, dest: &Path, start: f64, end: f64) -> Result<()> {
        write_excerpt(
            self.data.as_slice(),
            &self.format,
            self.byte_length(),
            dest,
            start,
            end,
        )
    }

    fn dispose(&self) {}
}

static NEXT_PARTIAL_ID: AtomicU64 = AtomicU64::new(0);

/// Decodes sources into temp WAV files and opens them.
///
/// Temp files live in `temp_dir`, named after the source and the target sample rate. An
/// existing temp file is reused instead of being decoded again, and clips opening the same
/// source share it until the last one is disposed. A decode writes to a partial file that
/// only takes the temp file's name once complete.
pub struct DecodedSoundFileFactory {
    decoder: Arc<dyn Decoder>,
    temp_dir: PathBuf,
    temp_files: Arc<TempFiles>,
}

impl DecodedSoundFileFactory {
    pub fn new(decoder: Arc<dyn Decoder>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            decoder,
            temp_dir: temp_dir.into(),
            temp_files: Arc::new(TempFiles::default()),
        }
    }

    pub fn temp_files(&self) -> &TempFiles {
        &self.temp_files
    }

    fn decode_into(
        &self,
        filename: &Path,
        temp: &Path,
        target: Option<&WaveFormat>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let partial = temp.with_extension(format!(
            "{}.{}.part",
            std::process::id(),
            NEXT_PARTIAL_ID.fetch_add(1, Ordering::Relaxed)
        ));
        tracing::debug!("decoding {} into {}", filename.display(), partial.display());

        let result = self
            .decoder
            .decode(filename, &partial, target, cancel)
            .and_then(|_| Ok(std::fs::rename(&partial, temp)?));

        if let Err(e) = result {
            // Never leave a half-written file around to be reused.
            let _ = std::fs::remove_file(&partial);
            // Another clip may have finished decoding the same source first.
            if matches!(e, Error::IOError(_)) && temp.exists() {
                return Ok(());
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn temp_path(&self, source: &Path, target: Option<&WaveFormat>) -> PathBuf {
        let rate = target
            .map(|t| t.sample_rate.to_string())
            .unwrap_or_else(|| "native".to_string());
        let name = format!(
            "{:x}_{}.{}",
            md5::compute(source.to_string_lossy().as_bytes()),
            rate,
            crate::cache::WAV_NAMESPACE
        );
        self.temp_dir.join(name)
    }
}

impl SoundFileFactory for DecodedSoundFileFactory {
    fn create(
        &self,
        filename: &Path,
        target: Option<&WaveFormat>,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn SoundFile>> {
        std::fs::create_dir_all(&self.temp_dir)?;
        let temp = self.temp_path(filename, target);

        self.temp_files.acquire(&temp);

        if temp.exists() {
            tracing::debug!("reusing decoded audio at {}", temp.display());
        } else if let Err(e) = self.decode_into(filename, &temp, target, cancel) {
            self.temp_files.release(&temp);
            return Err(e);
        }

        match WavFile::open_leased(filename, &temp, Some(self.temp_files.clone())) {
            Ok(f) => Ok(Box::new(f)),
            Err(e) => {
                self.temp_files.release(&temp);
                match e {
                    Error::WavError(e) => Err(Error::UnsupportedFormat(format!(
                        "'{}' not supported: {}",
                        filename.display(),
                        e
                    ))),
                    e => Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn write_wav(path: &Path, format: WaveFormat, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for s in samples {
            writer.write_sample(*s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_wav_file_properties() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let samples: Vec<i16> = (0..2000).map(|i| i as i16).collect();
        write_wav(&path, WaveFormat::new(8000, 2, 16), &samples);

        let wav = WavFile::open(&path).unwrap();
        assert_eq!(wav.wave_format(), WaveFormat::new(8000, 2, 16));
        assert_eq!(wav.data_length(), 1000);
        assert_eq!(wav.byte_length(), 4000);

        let mut pcm = Vec::new();
        wav.pcm_reader().unwrap().read_to_end(&mut pcm).unwrap();
        assert_eq!(pcm.len(), 4000);
        assert_eq!(i16::from_le_bytes([pcm[2], pcm[3]]), 1);
    }

    #[test]
    fn test_save_excerpt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        let samples: Vec<i16> = (0..8000).map(|i| (i % 1000) as i16).collect();
        write_wav(&path, WaveFormat::new(1000, 1, 16), &samples);

        let wav = WavFile::open(&path).unwrap();
        let dest = dir.path().join("excerpt.wav");
        wav.save_excerpt(&dest, 2.5, 4.0).unwrap();

        let mut reader = hound::WavReader::open(&dest).unwrap();
        let excerpt: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(excerpt.len(), 1500);
        assert_eq!(excerpt[0], 500);

        // Ranges past the end are clamped.
        wav.save_excerpt(&dest, 7.0, 100.0).unwrap();
        let reader = hound::WavReader::open(&dest).unwrap();
        assert_eq!(reader.len(), 1000);
    }

    #[test]
    fn test_temp_files_are_removed_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp.wav");
        write_wav(&path, WaveFormat::new(8000, 1, 16), &[0; 100]);

        let wav = WavFile::open_decoded(Path::new("source.mp4"), &path, true).unwrap();
        assert_eq!(wav.filename(), Path::new("source.mp4"));
        wav.dispose();
        assert!(!path.exists());
        wav.dispose();

        write_wav(&path, WaveFormat::new(8000, 1, 16), &[0; 100]);
        let wav = WavFile::open(&path).unwrap();
        wav.dispose();
        assert!(path.exists());
    }

    // Writes a short silent WAV and counts its runs.
    #[derive(Default)]
    struct SilenceDecoder {
        runs: std::sync::atomic::AtomicUsize,
        fail: bool,
    }

    impl Decoder for SilenceDecoder {
        fn decode(
            &self,
            _source: &Path,
            dest: &Path,
            _target: Option<&WaveFormat>,
            cancel: &CancellationToken,
        ) -> Result<WaveFormat> {
            cancel.check()?;
            self.runs.fetch_add(1, Ordering::SeqCst);
            let format = WaveFormat::new(8000, 1, 16);
            write_wav(dest, format, &[0; 512]);
            if self.fail {
                return Err(Error::ExternalToolFailure {
                    tool: "ffmpeg".to_string(),
                    reason: "exited with 1".to_string(),
                });
            }
            Ok(format)
        }
    }

    #[test]
    fn test_clips_share_decoded_audio() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = Arc::new(SilenceDecoder::default());
        let factory = DecodedSoundFileFactory::new(decoder.clone(), dir.path());
        let cancel = CancellationToken::new();
        let source = Path::new("/media/phone.m4a");

        let a = factory.create(source, None, &cancel).unwrap();
        let b = factory.create(source, None, &cancel).unwrap();
        let temp = factory.temp_path(source, None);
        assert_eq!(decoder.runs.load(Ordering::SeqCst), 1);
        assert_eq!(factory.temp_files().holders(&temp), 2);

        a.dispose();
        a.dispose();
        assert!(temp.exists());
        assert_eq!(factory.temp_files().holders(&temp), 1);
        let mut pcm = Vec::new();
        b.pcm_reader().unwrap().read_to_end(&mut pcm).unwrap();
        assert_eq!(pcm.len(), 1024);

        b.dispose();
        assert!(!temp.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_decode_leaves_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = Arc::new(SilenceDecoder {
            fail: true,
            ..Default::default()
        });
        let factory = DecodedSoundFileFactory::new(decoder, dir.path());
        let source = Path::new("/media/broken.mov");

        let result = factory.create(source, None, &CancellationToken::new());
        assert!(matches!(result, Err(Error::ExternalToolFailure { .. })));
        assert_eq!(factory.temp_files().holders(&factory.temp_path(source, None)), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_memory_sound_file() {
        let f = MemorySoundFile::from_samples_i16("a.wav", 8000, &[1, 2, 3, 4]);
        assert_eq!(f.data_length(), 4);
        assert_eq!(f.byte_length(), 8);

        let mut pcm = Vec::new();
        f.pcm_reader().unwrap().read_to_end(&mut pcm).unwrap();
        assert_eq!(pcm, vec![1, 0, 2, 0, 3, 0, 4, 0]);
    }
}
