//! Bounded block cache with a frozen sink prefix and a sliding window.
//!
//! The cache holds at most `sink_size + window_size` entries. The first `sink_size`
//! blocks of a request are never evicted; later blocks go to a FIFO window that drops
//! its oldest entry before a new one is admitted once it holds `window_size` entries.

use std::collections::VecDeque;

use tracing::debug;

use crate::error::{Result, RollingSinkError};

/// Attention state produced for one clean block. Never mutated after insertion.
#[derive(Debug, Clone)]
pub struct CacheEntry<S> {
    block_index: usize,
    state: S,
}

impl<S> CacheEntry<S> {
    pub fn new(block_index: usize, state: S) -> Self {
        Self { block_index, state }
    }

    pub fn block_index(&self) -> usize {
        self.block_index
    }

    pub fn state(&self) -> &S {
        &self.state
    }
}

/// Counters over the lifetime of the current request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub insertions: u64,
    pub evictions: u64,
    /// Largest number of entries held at once.
    pub peak_len: usize,
}

pub struct SinkCache<S> {
    sink_size: usize,
    window_size: usize,
    sink: Vec<CacheEntry<S>>,
    window: VecDeque<CacheEntry<S>>,
    last_index: Option<usize>,
    stats: CacheStats,
}

impl<S> SinkCache<S> {
    pub fn new(sink_size: usize, window_size: usize) -> Result<Self> {
        if sink_size + window_size == 0 {
            return Err(RollingSinkError::Configuration(
                "sink cache needs room for at least one block".into(),
            ));
        }
        Ok(Self {
            sink_size,
            window_size,
            sink: Vec::with_capacity(sink_size),
            window: VecDeque::with_capacity(window_size),
            last_index: None,
            stats: CacheStats::default(),
        })
    }

    pub fn sink_size(&self) -> usize {
        self.sink_size
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn capacity(&self) -> usize {
        self.sink_size + self.window_size
    }

    pub fn len(&self) -> usize {
        self.sink.len() + self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sink.is_empty() && self.window.is_empty()
    }

    /// True once every sink slot is taken; the sink stays frozen until `reset`.
    pub fn sink_frozen(&self) -> bool {
        self.sink.len() == self.sink_size
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Inserts the entry of a freshly cleaned block.
    ///
    /// Block indices must be strictly increasing within a request. A rejected insert
    /// leaves the cache untouched.
    pub fn insert(&mut self, entry: CacheEntry<S>) -> Result<()> {
        let index = entry.block_index;
        if let Some(last) = self.last_index {
            if index <= last {
                return Err(RollingSinkError::CacheOrder { index, last });
            }
        }

        if index < self.sink_size && !self.sink_frozen() {
            self.sink.push(entry);
        } else if self.window_size == 0 {
            self.stats.evictions += 1;
            debug!(block = index, "window disabled, block not retained");
        } else {
            if self.window.len() == self.window_size {
                if let Some(evicted) = self.window.pop_front() {
                    self.stats.evictions += 1;
                    debug!(evicted = evicted.block_index, inserted = index, "evicted window block");
                }
            }
            self.window.push_back(entry);
        }

        self.last_index = Some(index);
        self.stats.insertions += 1;
        self.stats.peak_len = self.stats.peak_len.max(self.len());
        debug_assert!(self.len() <= self.capacity());
        Ok(())
    }

    /// Sink entries followed by window entries, in ascending block order.
    pub fn snapshot(&self) -> CacheSnapshot<'_, S> {
        CacheSnapshot {
            entries: self.sink.iter().chain(self.window.iter()).collect(),
        }
    }

    /// Drops every entry and counter. Called at the start and end of each request.
    pub fn reset(&mut self) {
        self.sink.clear();
        self.window.clear();
        self.last_index = None;
        self.stats = CacheStats::default();
    }
}

/// Read-only view of the retained entries that a block attends over.
pub struct CacheSnapshot<'a, S> {
    entries: Vec<&'a CacheEntry<S>>,
}

impl<'a, S> CacheSnapshot<'a, S> {
    /// A snapshot with no context, as seen by the first block.
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[&'a CacheEntry<S>] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a CacheEntry<S>> + '_ {
        self.entries.iter().copied()
    }

    pub fn block_indices(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.block_index).collect()
    }

    /// Positions the network assigns to the retained entries.
    ///
    /// Entries are re-numbered contiguously so the sink sits directly before the
    /// window, whatever the absolute block indices are.
    pub fn rolled_positions(&self) -> Vec<usize> {
        (0..self.entries.len()).collect()
    }

    /// Position of the block attending over this snapshot.
    pub fn next_position(&self) -> usize {
        self.entries.len()
    }
}
