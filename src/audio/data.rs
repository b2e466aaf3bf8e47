use std::path::Path;

use serde::{Deserialize, Serialize};

use super::SyncParams;
use crate::Result;

/// The fingerprint of a single clip: one hash per analysis window.
///
/// The struct carries the [SyncParams] the hashes were generated with. Two fingerprints can
/// only be compared if they share the same params and `sample_rate`; a cached fingerprint
/// built with other params is never reused.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Fingerprint {
    pub(crate) hashes: Vec<u32>,
    pub(crate) sample_rate: u32,
    pub(crate) params: SyncParams,
}

impl Fingerprint {
    pub fn new(hashes: Vec<u32>, sample_rate: u32, params: SyncParams) -> Self {
        Self {
            hashes,
            sample_rate,
            params,
        }
    }

    pub fn hashes(&self) -> &[u32] {
        &self.hashes
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn window_length(&self) -> usize {
        self.params.window_length
    }

    pub fn params(&self) -> &SyncParams {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Length of the fingerprinted audio, in seconds.
    pub fn duration_secs(&self) -> f64 {
        (self.hashes.len() * self.params.window_length) as f64 / self.sample_rate as f64
    }

    /// Load a fingerprint from a bincode file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let f = std::fs::File::open(path.as_ref())?;
        Ok(bincode::deserialize_from(std::io::BufReader::new(f))?)
    }

    /// Write this fingerprint to a bincode file.
    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let f = std::fs::File::create(path.as_ref())?;
        let mut w = std::io::BufWriter::new(f);
        bincode::serialize_into(&mut w, self)?;
        Ok(())
    }
}

/// Result of aligning a query (LQ) clip against a track (the master).
///
/// Given a master that started recording at 2:00pm and an LQ clip that started at 1:55pm,
/// `query_match_starts_at` is 5 minutes and `track_match_starts_at` is 0. If the LQ clip
/// started at 2:10pm instead, `query_match_starts_at` is 0 and `track_match_starts_at` is
/// 10 minutes.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct ClipMatch {
    /// Seconds into the query clip where the matched region begins.
    pub query_match_starts_at: f64,
    /// Seconds into the master where the matched region begins.
    pub track_match_starts_at: f64,
    /// `track_match_starts_at - query_match_starts_at`: how far into the master timeline
    /// the query's first sample lands. Negative if the query started before the master.
    pub offset: f64,
    /// Number of windows whose hashes agreed at this offset.
    pub match_count: usize,
}

impl ClipMatch {
    pub fn new(query_match_starts_at: f64, track_match_starts_at: f64, offset: f64) -> Self {
        Self {
            query_match_starts_at,
            track_match_starts_at,
            offset,
            match_count: 0,
        }
    }

    pub(crate) fn with_match_count(mut self, match_count: usize) -> Self {
        self.match_count = match_count;
        self
    }
}
