//! Open modes, tuning options and engine defaults
//!
//! All knobs must be set before `open`; setters fail with `Invalid` once a
//! database is attached to a directory.

use bitflags::bitflags;

bitflags! {
    /// Connection mode of an engine or index file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        /// Open as a reader.
        const READER = 1 << 0;
        /// Open as a writer.
        const WRITER = 1 << 1;
        /// Create the database if it does not exist (writer only).
        const CREATE = 1 << 2;
        /// Truncate the database on open (writer only).
        const TRUNCATE = 1 << 3;
        /// Skip file locking entirely.
        const NO_LOCK = 1 << 4;
        /// Fail instead of blocking when the file lock is contended.
        const LOCK_NONBLOCK = 1 << 5;
    }
}

bitflags! {
    /// Persistent tuning options, recorded in the header on creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TuningOptions: u8 {
        /// Size bucket arrays for databases beyond 2 GiB.
        const LARGE = 1 << 0;
        /// Compress spilled posting-list values with Snappy.
        const COMPRESS = 1 << 1;
    }
}

/// Default capacity of the write buffer before a forced flush (128 MiB).
pub const DEFAULT_BUFFER_CAPACITY: u64 = 1024 * 1024 * 128;

/// Default unit size of each index shard file (512 MiB).
pub const DEFAULT_SHARD_UNIT_SIZE: u64 = 1024 * 1024 * 512;

/// Default maximum number of forward-matching expansions.
pub const DEFAULT_FWM_MAX: u32 = 2048;

/// Default expected number of records.
pub const DEFAULT_EXPECTED_RECORDS: u64 = 1_000_000;

/// Default expected number of distinct tokens.
pub const DEFAULT_EXPECTED_TOKENS: u64 = 1_000_000;

/// Maximum number of index shards per engine.
pub const SHARD_MAX: usize = 32;

/// Leaf pages cached by a writer-mode index.
pub const LEAF_CACHE_WRITER: usize = 64;

/// Leaf pages cached by a reader-mode index.
pub const LEAF_CACHE_READER: usize = 1024;

/// Maximum length in bytes of a single search word.
pub const MAX_WORD_LEN: usize = 1024;

/// Pre-open tuning of an engine.
#[derive(Debug, Clone)]
pub struct Tuning {
    /// Expected number of records, controls primary-store bucket sizing.
    pub expected_records: u64,
    /// Expected number of distinct tokens, controls shard bucket sizing.
    pub expected_tokens: u64,
    /// Unit size of each shard file; the active shard cycles past this.
    pub shard_unit_size: u64,
    /// Persistent options written into the header on creation.
    pub opts: TuningOptions,
    /// Write-buffer capacity in bytes.
    pub buffer_capacity: u64,
    /// Leaf-cache page count, 0 means the mode-dependent default.
    pub leaf_cache: usize,
    /// Cap on forward-matching expansion during search.
    pub fwm_max: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            expected_records: DEFAULT_EXPECTED_RECORDS,
            expected_tokens: DEFAULT_EXPECTED_TOKENS,
            shard_unit_size: DEFAULT_SHARD_UNIT_SIZE,
            opts: TuningOptions::empty(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            leaf_cache: 0,
            fwm_max: DEFAULT_FWM_MAX,
        }
    }
}

impl Tuning {
    /// Leaf-cache count for the given mode, honoring an explicit override.
    pub fn leaf_cache_for(&self, mode: OpenMode) -> usize {
        if self.leaf_cache > 0 {
            self.leaf_cache
        } else if mode.contains(OpenMode::WRITER) {
            LEAF_CACHE_WRITER
        } else {
            LEAF_CACHE_READER
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let t = Tuning::default();
        assert_eq!(t.buffer_capacity, 128 * 1024 * 1024);
        assert_eq!(t.shard_unit_size, 512 * 1024 * 1024);
        assert_eq!(t.fwm_max, 2048);
        assert!(t.opts.is_empty());
    }

    #[test]
    fn test_leaf_cache_defaults() {
        let t = Tuning::default();
        assert_eq!(t.leaf_cache_for(OpenMode::WRITER | OpenMode::CREATE), LEAF_CACHE_WRITER);
        assert_eq!(t.leaf_cache_for(OpenMode::READER), LEAF_CACHE_READER);

        let mut t = Tuning::default();
        t.leaf_cache = 256;
        assert_eq!(t.leaf_cache_for(OpenMode::READER), 256);
    }

    #[test]
    fn test_mode_flags() {
        let m = OpenMode::WRITER | OpenMode::CREATE | OpenMode::TRUNCATE;
        assert!(m.contains(OpenMode::WRITER));
        assert!(!m.contains(OpenMode::READER));
        assert!(!m.contains(OpenMode::NO_LOCK));
    }
}
