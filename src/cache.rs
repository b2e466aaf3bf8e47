use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::audio::Fingerprint;
use crate::Result;

/// Namespace (file extension) of cached fingerprints.
pub const FINGERPRINT_NAMESPACE: &str = "bin";

/// Namespace (file extension) of decoded temp audio.
pub const WAV_NAMESPACE: &str = "wav";

/// Identifies a cached fingerprint.
///
/// The same file fingerprinted at two different sample rates produces two different
/// fingerprints, so the sample rate is part of the key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    filename: PathBuf,
    sample_rate: u32,
}

impl CacheKey {
    pub fn new(filename: impl Into<PathBuf>, sample_rate: u32) -> Self {
        Self {
            filename: filename.into(),
            sample_rate,
        }
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// File name used to store this key on disk.
    pub fn file_name(&self) -> String {
        format!(
            "{:x}_{}.{}",
            md5::compute(self.filename.to_string_lossy().as_bytes()),
            self.sample_rate,
            FINGERPRINT_NAMESPACE
        )
    }
}

/// Storage for computed fingerprints.
///
/// Each operation is atomic for a single key; entries are immutable once stored.
pub trait FingerprintCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<Fingerprint>>;

    fn set(&self, key: &CacheKey, fingerprint: &Fingerprint) -> Result<()>;

    fn remove(&self, key: &CacheKey) -> Result<()>;

    /// Removes every entry in `namespace` (e.g., [FINGERPRINT_NAMESPACE]).
    fn clear(&self, namespace: &str) -> Result<()>;
}

/// Fingerprint cache backed by bincode files in a directory.
///
/// Decoded temp audio shares the directory, which is why [FingerprintCache::clear] takes
/// a namespace.
#[derive(Debug)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.file_name())
    }
}

impl FingerprintCache for DiskCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Fingerprint>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        Fingerprint::from_path(&path).map(Some)
    }

    fn set(&self, key: &CacheKey, fingerprint: &Fingerprint) -> Result<()> {
        // Write to a unique temp file, then rename, so readers never see a partial entry.
        let path = self.path(key);
        let tmp = path.with_extension(format!(
            "{}.{:?}.tmp",
            FINGERPRINT_NAMESPACE,
            std::thread::current().id()
        ));
        fingerprint.to_path(&tmp)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        tracing::trace!("cached fingerprint at {}", path.display());
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<()> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self, namespace: &str) -> Result<()> {
        let removed = crate::util::remove_files_with_extension(&self.root, namespace)?;
        tracing::debug!(namespace, removed, "cleared cache namespace");
        Ok(())
    }
}

/// In-process fingerprint cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<CacheKey, Arc<Fingerprint>>>,
}

impl MemoryCache {
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FingerprintCache for MemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Fingerprint>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).map(|fp| fp.as_ref().clone()))
    }

    fn set(&self, key: &CacheKey, fingerprint: &Fingerprint) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.clone(), Arc::new(fingerprint.clone()));
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }

    fn clear(&self, namespace: &str) -> Result<()> {
        if namespace == FINGERPRINT_NAMESPACE {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.clear();
        }
        Ok(())
    }
}
