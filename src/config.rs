use std::path::PathBuf;
use std::time::Duration;

use crate::errinput;

/// Configuration for a [`Store`](crate::Store).
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding the manifest and table files
    pub dir: PathBuf,

    /// Byte capacity of each memtable before rotation (default: 64MB)
    pub memtable_size: usize,

    /// Level 0 table count that activates compaction (default: 4)
    pub level0_file_limit: usize,

    /// Byte ceiling above which a level 1 table is split (default: 256MB)
    pub max_level1_size: u32,

    /// How often the compaction loop wakes (default: 1s)
    pub compaction_interval: Duration,

    /// How often the load-balance loop wakes (default: 10s)
    pub balance_interval: Duration,

    /// Bound on the pending write queue (default: 1000)
    pub write_queue_depth: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./siltdb"),
            memtable_size: 64 * 1024 * 1024, // 64MB
            level0_file_limit: 4,
            max_level1_size: 256 * 1024 * 1024, // 256MB
            compaction_interval: Duration::from_secs(1),
            balance_interval: Duration::from_secs(10),
            write_queue_depth: 1000,
        }
    }
}

impl Options {
    /// Create options with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set memtable byte capacity
    pub fn memtable_size(mut self, size: usize) -> Self {
        self.memtable_size = size;
        self
    }

    /// Set the level 0 table count that activates compaction
    pub fn level0_file_limit(mut self, limit: usize) -> Self {
        self.level0_file_limit = limit;
        self
    }

    /// Set the byte ceiling above which a level 1 table is split
    pub fn max_level1_size(mut self, size: u32) -> Self {
        self.max_level1_size = size;
        self
    }

    /// Set the compaction loop interval
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Set the load-balance loop interval
    pub fn balance_interval(mut self, interval: Duration) -> Self {
        self.balance_interval = interval;
        self
    }

    /// Set the pending write queue bound
    pub fn write_queue_depth(mut self, depth: usize) -> Self {
        self.write_queue_depth = depth;
        self
    }

    /// Validate option values before the store starts
    pub(crate) fn validate(&self) -> crate::error::Result<()> {
        if self.memtable_size == 0 {
            return errinput!("memtable_size must be non-zero");
        }
        if self.level0_file_limit < 2 {
            return errinput!("level0_file_limit must be at least 2");
        }
        if self.max_level1_size == 0 {
            return errinput!("max_level1_size must be non-zero");
        }
        if self.write_queue_depth == 0 {
            return errinput!("write_queue_depth must be non-zero");
        }
        if self.compaction_interval.is_zero() || self.balance_interval.is_zero() {
            return errinput!("maintenance intervals must be non-zero");
        }
        Ok(())
    }
}
