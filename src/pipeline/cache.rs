//! Single-slot latest-frame cache shared by the capture loop and consumers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::capture::frame::{CachedFrame, CanonicalFrame};

/// Holds the most recent canonical frame.
///
/// The slot is an atomically swapped pointer to an immutable entry, so a
/// reader either sees the previous frame or the next one, never a mix, and
/// neither side waits on the other while copying.
pub struct FrameCache {
    slot: ArcSwapOption<CachedFrame>,
    next_sequence: CachePadded<AtomicU64>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_published: AtomicU64,
    snapshots_served: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub frames_published: u64,
    pub snapshots_served: u64,
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCache {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            next_sequence: CachePadded::new(AtomicU64::new(0)),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Replace the current entry. Returns the sequence id assigned to it.
    pub fn publish(&self, frame: CanonicalFrame) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let entry = Arc::new(CachedFrame {
            sequence,
            captured_at: SystemTime::now(),
            frame,
        });

        // Never let a late publisher move the visible sequence backwards.
        self.slot.rcu(|current| match current {
            Some(existing) if existing.sequence > sequence => Some(Arc::clone(existing)),
            _ => Some(Arc::clone(&entry)),
        });
        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
        sequence
    }

    /// The current entry, or `None` if nothing was ever published.
    pub fn snapshot(&self) -> Option<Arc<CachedFrame>> {
        let entry = self.slot.load_full();
        if entry.is_some() {
            self.stats.snapshots_served.fetch_add(1, Ordering::Relaxed);
        }
        entry
    }

    /// Sequence id of the visible entry, 0 before the first publish.
    pub fn latest_sequence(&self) -> u64 {
        match &*self.slot.load() {
            Some(entry) => entry.sequence,
            None => 0,
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            frames_published: self.stats.frames_published.load(Ordering::Relaxed),
            snapshots_served: self.stats.snapshots_served.load(Ordering::Relaxed),
        }
    }
}
