//! Sharded engine facades
//!
//! An engine is a directory: a primary record store holding each record's
//! original text plus its assigned shard, and up to 32 index shards named
//! `0001`..`0032`. Exactly one shard is current for new writes; the engine
//! cycles to the smallest shard (or opens a new one) when the current
//! shard's file grows past the configured unit size.

pub mod expr;
pub mod qgram;
pub mod word;

pub use qgram::QgramEngine;
pub use word::WordEngine;

use crate::config::{TuningOptions, SHARD_MAX};
use crate::{Error, Result};

/// Matching mode of an engine search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// The word occurs anywhere in the record.
    Substring,
    /// The record starts with the word.
    Prefix,
    /// The record ends with the word.
    Suffix,
    /// The record equals the word.
    Full,
    /// The word occurs delimited by spaces or record ends.
    Token,
    /// A space-delimited token starts with the word.
    TokenPrefix,
    /// A space-delimited token ends with the word.
    TokenSuffix,
}

/// Magic byte of the q-gram engine's primary store.
pub(crate) const QGRAM_MAGIC: u8 = 0x49;

/// Magic byte of the word engine's primary store.
pub(crate) const WORD_MAGIC: u8 = 0x4a;

/// Fixed header at the start of the primary store's opaque region.
///
/// | offset | field                |
/// |--------|----------------------|
/// | 0      | magic                |
/// | 1      | shard count          |
/// | 2      | tuning opts          |
/// | 3..10  | expected token count |
/// | 11..18 | shard unit size      |
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub magic: u8,
    pub shard_count: u8,
    pub opts: TuningOptions,
    pub expected_tokens: i64,
    pub shard_unit_size: i64,
}

pub(crate) const HEADER_LEN: usize = 19;

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.magic;
        buf[1] = self.shard_count;
        buf[2] = self.opts.bits();
        buf[3..11].copy_from_slice(&self.expected_tokens.to_le_bytes());
        buf[11..19].copy_from_slice(&self.shard_unit_size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8], expect_magic: u8) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Metadata("short header".into()));
        }
        if buf[0] != expect_magic {
            return Err(Error::Metadata(format!(
                "magic mismatch: expected {:#04x}, found {:#04x}",
                expect_magic, buf[0]
            )));
        }
        let shard_count = buf[1];
        if shard_count as usize > SHARD_MAX {
            return Err(Error::Metadata(format!(
                "shard count {} exceeds {}",
                shard_count, SHARD_MAX
            )));
        }
        Ok(Self {
            magic: buf[0],
            shard_count,
            opts: TuningOptions::from_bits_truncate(buf[2]),
            expected_tokens: i64::from_le_bytes(buf[3..11].try_into().unwrap()),
            shard_unit_size: i64::from_le_bytes(buf[11..19].try_into().unwrap()),
        })
    }
}

/// File name of the 1-based shard `n`: four zero-padded decimal digits.
pub(crate) fn shard_filename(n: usize) -> String {
    format!("{:04}", n)
}
