//! Inverted-index layer: write buffering, per-shard indexes, set algebra

pub mod buffer;
pub mod idset;
pub mod qgram;
pub mod results;
pub mod word;

pub use idset::IdSet;
pub use qgram::QgramIndex;
pub use word::WordIndex;

use std::sync::Arc;

/// Matching mode of a primitive per-shard search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// The word occurs anywhere in the record.
    Substring,
    /// The record starts with the word.
    Prefix,
    /// The record ends with the word.
    Suffix,
    /// The record equals the word.
    Full,
}

/// Declared phase of a flush, reported through the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Started,
    GettingTokens,
    SortingTokens,
    StoringTokens,
    StoringKeywordList,
    GettingDeletedTokens,
    SortingDeletedTokens,
    StoringDeletedTokens,
    SynchronizingDatabase,
    Finished,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Started => "started",
            SyncPhase::GettingTokens => "getting tokens",
            SyncPhase::SortingTokens => "sorting tokens",
            SyncPhase::StoringTokens => "storing tokens",
            SyncPhase::StoringKeywordList => "storing keyword list",
            SyncPhase::GettingDeletedTokens => "getting deleted tokens",
            SyncPhase::SortingDeletedTokens => "sorting deleted tokens",
            SyncPhase::StoringDeletedTokens => "storing deleted tokens",
            SyncPhase::SynchronizingDatabase => "synchronizing database",
            SyncPhase::Finished => "finished",
        }
    }
}

/// Progress callback for long flushes: `(total, current, phase)`. Returning
/// `false` is a cooperative cancellation request; the flush stops at the
/// declared phase and the buffer retains whatever was not yet emitted.
pub type SyncCallback = Arc<dyn Fn(u64, u64, SyncPhase) -> bool + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names() {
        assert_eq!(SyncPhase::Started.as_str(), "started");
        assert_eq!(SyncPhase::SynchronizingDatabase.as_str(), "synchronizing database");
        assert_eq!(SyncPhase::Finished.as_str(), "finished");
    }
}
