//! siftdb Full-Text Index Engine
//!
//! A persistent, writer-buffered inverted index mapping tokens of UTF-8
//! text records to 64-bit record IDs, with substring / prefix / suffix /
//! full / token matching and boolean compound queries.
//!
//! ## Architecture
//! - Storage layer: ordered KV store (B+tree, LRU page cache, overflow chains)
//! - Index layer: write buffer + per-shard inverted indexes (q-gram / word)
//! - Engine layer: primary record store + up to 32 cycling index shards
//!
//! ## Variants
//! - [`QgramEngine`]: 2-codepoint window tokens, character-level substring
//!   matching with offset chaining
//! - [`WordEngine`]: whole-word tokens plus a vocabulary for substring /
//!   prefix / suffix expansion

pub mod codec;
pub mod config;
pub mod engine;
pub mod index;
pub mod storage;
pub mod text;

mod error;

pub use config::{OpenMode, Tuning, TuningOptions};
pub use engine::{QgramEngine, SearchMode, WordEngine};
pub use error::{Error, ErrorCode, Result};
pub use index::{MatchMode, QgramIndex, SyncCallback, SyncPhase, WordIndex};
pub use text::normalize::{normalize, NormalizeOptions};
