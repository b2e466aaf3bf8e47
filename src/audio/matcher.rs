#[cfg(feature = "rayon")]
extern crate rayon;

use std::cmp::Reverse;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::task::{CancellationToken, Progress};
use crate::Result;

/// Agreement between two hash sequences at a single window offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OffsetCandidate {
    /// Master window index minus query window index.
    pub offset: i64,
    /// Number of overlapping windows with equal hashes.
    pub match_count: usize,
    /// First master window that matched at this offset.
    pub track_index: usize,
    /// First query window that matched at this offset.
    pub query_index: usize,
}

impl OffsetCandidate {
    // Ordering key: most matches first, then the offset closest to zero, then the
    // smallest offset. Offsets are unique per search, so this is a total order.
    #[inline]
    fn rank(&self) -> (usize, Reverse<u64>, Reverse<i64>) {
        (
            self.match_count,
            Reverse(self.offset.unsigned_abs()),
            Reverse(self.offset),
        )
    }

    /// Returns the better of two candidates.
    #[inline]
    pub fn best(self, other: Self) -> Self {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

// Counts matching hashes for a single offset `o`. Returns `None` if nothing matched.
fn evaluate_offset(hq: &[u32], lq: &[u32], o: i64) -> Option<OffsetCandidate> {
    let (hn, ln) = (hq.len() as i64, lq.len() as i64);

    let start = o.max(0);
    let overlap = ln.min(ln + o).min(hn - o).min(hn);
    if overlap <= 0 {
        return None;
    }

    let mut first = None;
    let mut match_count = 0;

    for hq_idx in start..start + overlap {
        let lq_idx = hq_idx - o;
        if hq[hq_idx as usize] == lq[lq_idx as usize] {
            if first.is_none() {
                first = Some((hq_idx as usize, lq_idx as usize));
            }
            match_count += 1;
        }
    }

    first.map(|(track_index, query_index)| OffsetCandidate {
        offset: o,
        match_count,
        track_index,
        query_index,
    })
}

/// Finds the window offset between `hq` (master) and `lq` (query) with the most equal
/// hashes at overlapping positions.
///
/// Every offset in `[-(lq.len() - 1), hq.len() - 1]` is evaluated. Ties on match count go
/// to the offset closest to zero, then to the smaller offset, so the result does not
/// depend on how the work was scheduled. Returns `None` if no window matches at any offset.
///
/// `progress` counts evaluated offsets. `cancel` is checked once per offset; a cancel
/// aborts the whole search with [Error::Canceled](crate::Error::Canceled).
pub fn find_best_offset(
    hq: &[u32],
    lq: &[u32],
    cancel: &CancellationToken,
    progress: &Progress,
    threading: bool,
) -> Result<Option<OffsetCandidate>> {
    let span = tracing::span!(tracing::Level::TRACE, "find_best_offset");
    let _enter = span.enter();

    if hq.is_empty() || lq.is_empty() {
        progress.start(0);
        return Ok(None);
    }

    let start = -(lq.len() as i64 - 1);
    let end = hq.len() as i64;
    progress.start((end - start) as u64);

    let evaluate = |o: i64| {
        if cancel.is_canceled() {
            return None;
        }
        let candidate = evaluate_offset(hq, lq, o);
        progress.increment();
        candidate
    };

    #[cfg(feature = "rayon")]
    let best = if threading {
        (start..end)
            .into_par_iter()
            .filter_map(evaluate)
            .reduce_with(OffsetCandidate::best)
    } else {
        (start..end).filter_map(evaluate).reduce(OffsetCandidate::best)
    };

    #[cfg(not(feature = "rayon"))]
    let best = {
        let _ = threading;
        (start..end).filter_map(evaluate).reduce(OffsetCandidate::best)
    };

    cancel.check()?;

    tracing::debug!(
        candidates = end - start,
        best_offset = best.map(|b| b.offset),
        match_count = best.map(|b| b.match_count),
        "finished offset search"
    );

    Ok(best)
}
