//! Sharded word engine
//!
//! Like the q-gram engine, but tokens are whole whitespace-delimited words
//! and the directory additionally holds a vocabulary store of every word
//! ever indexed. Substring, prefix and suffix searches expand the query
//! over the vocabulary before hitting the shards. The primary store keeps
//! each record as `"<shard>\t"` followed by the record's words joined by
//! tabs.

use super::expr;
use super::{shard_filename, Header, SearchMode, HEADER_LEN, WORD_MAGIC};
use crate::codec;
use crate::config::{OpenMode, Tuning, SHARD_MAX};
use crate::error::IoOp;
use crate::index::results;
use crate::index::{SyncCallback, WordIndex};
use crate::storage::TokenTree;
use crate::text::normalize::{normalize, NormalizeOptions};
use crate::text::tokenize::{split_words, WORD_DELIMS};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const PRIMARY_NAME: &str = "text.sdb";
const VOCAB_NAME: &str = "list.sdb";

/// Sharded, writer-buffered word search engine with a vocabulary.
pub struct WordEngine {
    inner: RwLock<Inner>,
}

struct Inner {
    path: Option<PathBuf>,
    primary: Option<TokenTree>,
    vocab: Option<Arc<TokenTree>>,
    shards: Vec<Option<WordIndex>>,
    shard_count: usize,
    current: usize,
    writer: bool,
    shard_mode: OpenMode,
    tuning: Tuning,
    sync_cb: Option<SyncCallback>,
    iter: Option<Option<Vec<u8>>>,
}

impl Inner {
    fn primary(&self) -> Result<&TokenTree> {
        self.primary
            .as_ref()
            .ok_or_else(|| Error::Invalid("database not opened".into()))
    }

    fn vocab(&self) -> Result<&Arc<TokenTree>> {
        self.vocab
            .as_ref()
            .ok_or_else(|| Error::Invalid("database not opened".into()))
    }

    fn check_writer(&self) -> Result<()> {
        if !self.writer {
            return Err(Error::Invalid("database opened read-only".into()));
        }
        Ok(())
    }

    fn shard(&self, n: usize) -> &WordIndex {
        self.shards[n].as_ref().expect("shard not opened")
    }

    fn shard_mut(&mut self, n: usize) -> &mut WordIndex {
        self.shards[n].as_mut().expect("shard not opened")
    }

    fn ensure_current_shard(&mut self) -> Result<()> {
        if self.current < self.shard_count {
            return Ok(());
        }
        if self.shard_count >= SHARD_MAX {
            self.current = self.shard_count - 1;
            return Ok(());
        }
        let path = self
            .path
            .as_ref()
            .expect("database not opened")
            .join(shard_filename(self.shard_count + 1));
        let mut idx = WordIndex::open(&path, self.shard_mode | OpenMode::CREATE, &self.tuning)?;
        idx.set_sync_callback(self.sync_cb.clone());
        idx.set_word_sink(Some(self.vocab()?.clone()));
        self.shards[self.shard_count] = Some(idx);
        self.current = self.shard_count;
        self.shard_count += 1;
        Ok(())
    }

    fn cycle_check(&mut self) -> Result<()> {
        if self.shard_count == 0 {
            return Ok(());
        }
        let active = self.current.min(self.shard_count - 1);
        if self.shard(active).file_size()? < self.tuning.shard_unit_size {
            return Ok(());
        }
        self.shard(active).cache_clear();
        let mut min = u64::MAX;
        self.current = 0;
        for i in 0..self.shard_count {
            let size = self.shard(i).file_size()?;
            if size < min {
                self.current = i;
                min = size;
            }
        }
        if min > self.tuning.shard_unit_size && self.shard_count < SHARD_MAX {
            self.current = self.shard_count;
        }
        Ok(())
    }

    /// Decode a primary-store value into `(raw words, shard)`.
    fn decode_record(&self, value: &[u8]) -> Result<(Vec<String>, usize)> {
        let text = std::str::from_utf8(value)
            .map_err(|_| Error::Misc("primary record is not UTF-8".into()))?;
        let mut parts = text.split('\t');
        let shard: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Misc("primary record missing shard prefix".into()))?;
        if shard >= SHARD_MAX || shard >= self.shard_count {
            return Err(Error::Misc(format!("record names unknown shard {}", shard)));
        }
        Ok((parts.map(str::to_owned).collect(), shard))
    }

    fn unindex(&mut self, id: u64, value: &[u8]) -> Result<bool> {
        let (words, shard) = self.decode_record(value)?;
        let norm = normalize_words(&words);
        self.shard_mut(shard).remove_words(id, &norm)
    }

    fn any_dirty(&self) -> bool {
        self.shards[..self.shard_count]
            .iter()
            .any(|s| s.as_ref().is_some_and(WordIndex::is_dirty))
    }

    fn flush_dirty(&mut self) -> Result<()> {
        for i in 0..self.shard_count {
            if self.shard(i).is_dirty() {
                self.shard_mut(i).memsync(0)?;
            }
        }
        Ok(())
    }

    /// Union of per-shard postings for one exact word.
    fn search_word(&self, word: &str) -> Result<Vec<u64>> {
        if self.shard_count == 0 {
            return Ok(Vec::new());
        }
        if self.shard_count == 1 {
            return self.shard(0).search(word);
        }
        let mut sets = Vec::with_capacity(self.shard_count);
        for i in 0..self.shard_count {
            sets.push(self.shard(i).search(word)?);
        }
        Ok(results::union(&sets))
    }

    /// Expand the query over the vocabulary, then union the matches of
    /// every expanded word.
    fn dispatch(&self, word: &str, mode: SearchMode) -> Result<Vec<u64>> {
        let fwm_max = self.tuning.fwm_max.max(1) as usize;
        let vocab = self.vocab()?;
        let words: Vec<Vec<u8>> = match mode {
            SearchMode::Full => vec![word.as_bytes().to_vec()],
            SearchMode::Prefix => vocab.forward_match_keys(word.as_bytes(), fwm_max)?,
            SearchMode::Substring => {
                let needle = word.as_bytes();
                let mut out = Vec::new();
                let mut cur = vocab.cursor();
                while out.len() < fwm_max {
                    let Some(key) = cur.next_key()? else {
                        break;
                    };
                    if contains_bytes(&key, needle) {
                        out.push(key);
                    }
                }
                out
            }
            SearchMode::Suffix => {
                let needle = word.as_bytes();
                let mut out = Vec::new();
                let mut cur = vocab.cursor();
                while out.len() < fwm_max {
                    let Some(key) = cur.next_key()? else {
                        break;
                    };
                    if key.ends_with(needle) {
                        out.push(key);
                    }
                }
                out
            }
            _ => {
                return Err(Error::Invalid(
                    "token modes apply to the q-gram engine only".into(),
                ))
            }
        };
        if words.is_empty() {
            return Ok(Vec::new());
        }
        if words.len() == 1 {
            let word = std::str::from_utf8(&words[0])
                .map_err(|_| Error::Misc("vocabulary word is not UTF-8".into()))?;
            return self.search_word(word);
        }
        let mut sets = Vec::with_capacity(words.len());
        for w in &words {
            let w = std::str::from_utf8(w)
                .map_err(|_| Error::Misc("vocabulary word is not UTF-8".into()))?;
            sets.push(self.search_word(w)?);
        }
        Ok(results::union(&sets))
    }

    fn write_header(&self) -> Result<()> {
        let header = Header {
            magic: WORD_MAGIC,
            shard_count: self.shard_count as u8,
            opts: self.tuning.opts,
            expected_tokens: self.tuning.expected_tokens as i64,
            shard_unit_size: self.tuning.shard_unit_size as i64,
        };
        self.primary()?.write_opaque(&header.encode())
    }
}

/// Normalize raw record words for indexing, dropping the ones that
/// normalize to nothing.
fn normalize_words(words: &[String]) -> Vec<String> {
    words
        .iter()
        .map(|w| normalize(w, NormalizeOptions::standard()))
        .filter(|w| !w.is_empty())
        .collect()
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

impl Default for WordEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl WordEngine {
    /// Create an unopened engine with default tuning.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                path: None,
                primary: None,
                vocab: None,
                shards: Vec::new(),
                shard_count: 0,
                current: 0,
                writer: false,
                shard_mode: OpenMode::READER,
                tuning: Tuning::default(),
                sync_cb: None,
                iter: None,
            }),
        }
    }

    /// Set the persistent tuning. Fails once the engine is open.
    pub fn tune(&self, tuning: Tuning) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.path.is_some() {
            return Err(Error::Invalid("tune after open".into()));
        }
        inner.tuning = tuning;
        Ok(())
    }

    /// Set the write-buffer capacity and leaf cache. Fails once open.
    pub fn set_cache(&self, buffer_capacity: u64, leaf_cache: usize) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.path.is_some() {
            return Err(Error::Invalid("set_cache after open".into()));
        }
        if buffer_capacity > 0 {
            inner.tuning.buffer_capacity = buffer_capacity;
        }
        inner.tuning.leaf_cache = leaf_cache;
        Ok(())
    }

    /// Cap forward-matching expansion during search. Fails once open.
    pub fn set_fwmmax(&self, fwm_max: u32) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.path.is_some() {
            return Err(Error::Invalid("set_fwmmax after open".into()));
        }
        inner.tuning.fwm_max = fwm_max;
        Ok(())
    }

    /// Install a progress callback for flushes.
    pub fn set_sync_callback(&self, cb: Option<SyncCallback>) {
        let mut inner = self.inner.write();
        inner.sync_cb = cb.clone();
        for shard in inner.shards.iter_mut().flatten() {
            shard.set_sync_callback(cb.clone());
        }
    }

    /// Open the engine on a directory.
    pub fn open(&self, path: &Path, mode: OpenMode) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.path.is_some() {
            return Err(Error::Invalid("database already opened".into()));
        }
        let writer = mode.contains(OpenMode::WRITER);
        if writer && mode.contains(OpenMode::CREATE) {
            match std::fs::create_dir(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(Error::from_io(e, path, IoOp::Mkdir)),
            }
        }
        if writer && mode.contains(OpenMode::TRUNCATE) {
            let mut victims = vec![path.join(PRIMARY_NAME), path.join(VOCAB_NAME)];
            for i in 1..=SHARD_MAX {
                victims.push(path.join(shard_filename(i)));
            }
            for victim in victims {
                match std::fs::remove_file(&victim) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::from_io(e, &victim, IoOp::Unlink)),
                }
            }
        }
        let meta = std::fs::metadata(path).map_err(|e| Error::from_io(e, path, IoOp::Stat))?;
        if !meta.is_dir() {
            return Err(Error::Misc(format!("{}: not a directory", path.display())));
        }
        let primary = TokenTree::open(
            &path.join(PRIMARY_NAME),
            mode,
            inner.tuning.leaf_cache_for(mode),
            false,
        )?;
        let vocab = Arc::new(TokenTree::open(
            &path.join(VOCAB_NAME),
            mode,
            inner.tuning.leaf_cache_for(mode),
            false,
        )?);
        let opaque = primary.opaque();
        let mut shard_count;
        if opaque[0] == 0 && writer {
            shard_count = 0;
            inner.writer = true;
        } else {
            let header = Header::decode(&opaque[..HEADER_LEN], WORD_MAGIC)?;
            shard_count = header.shard_count as usize;
            inner.tuning.opts = header.opts;
            inner.tuning.expected_tokens = header.expected_tokens as u64;
            inner.tuning.shard_unit_size = header.shard_unit_size as u64;
            inner.writer = writer;
        }
        while shard_count < SHARD_MAX && path.join(shard_filename(shard_count + 1)).is_file() {
            shard_count += 1;
        }
        let shard_mode = {
            let mut m = if writer { OpenMode::WRITER } else { OpenMode::READER };
            if mode.contains(OpenMode::NO_LOCK) {
                m |= OpenMode::NO_LOCK;
            }
            if mode.contains(OpenMode::LOCK_NONBLOCK) {
                m |= OpenMode::LOCK_NONBLOCK;
            }
            m
        };
        let mut shards: Vec<Option<WordIndex>> = (0..SHARD_MAX).map(|_| None).collect();
        let mut current = 0;
        let mut min = u64::MAX;
        for i in 0..shard_count {
            let mut idx = WordIndex::open(
                &path.join(shard_filename(i + 1)),
                shard_mode,
                &inner.tuning,
            )?;
            idx.set_sync_callback(inner.sync_cb.clone());
            idx.set_word_sink(Some(vocab.clone()));
            let size = idx.file_size()?;
            if size < min {
                current = i;
                min = size;
            }
            shards[i] = Some(idx);
        }
        inner.path = Some(path.to_path_buf());
        inner.primary = Some(primary);
        inner.vocab = Some(vocab);
        inner.shards = shards;
        inner.shard_count = shard_count;
        inner.current = current;
        inner.shard_mode = shard_mode;
        inner.iter = None;
        if opaque[0] == 0 && writer {
            inner.write_header()?;
        }
        Ok(())
    }

    /// Flush pending writes and close the engine.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.primary()?;
        if inner.writer {
            inner.write_header()?;
        }
        for shard in inner.shards.iter_mut() {
            if let Some(shard) = shard.take() {
                shard.close()?;
            }
        }
        let vocab = inner.vocab.take().unwrap();
        vocab.memsync(1)?;
        drop(vocab);
        let primary = inner.primary.take().unwrap();
        primary.memsync(1)?;
        drop(primary);
        inner.path = None;
        inner.shard_count = 0;
        inner.current = 0;
        inner.iter = None;
        Ok(())
    }

    /// Whether the engine is open.
    pub fn is_open(&self) -> bool {
        self.inner.read().path.is_some()
    }

    /// Store a record, splitting `text` on whitespace delimiters.
    pub fn put(&self, id: u64, text: &str) -> Result<()> {
        let words = split_words(text, WORD_DELIMS);
        self.put_words(id, &words)
    }

    /// Store a record from caller-tokenized words.
    pub fn put_words(&self, id: u64, words: &[String]) -> Result<()> {
        if id == 0 {
            return Err(Error::Invalid("record id must be positive".into()));
        }
        let mut inner = self.inner.write();
        inner.primary()?;
        inner.check_writer()?;
        inner.ensure_current_shard()?;
        let key = codec::encode_u64(id);
        if let Some(old) = inner.primary()?.get(&key)? {
            let synced = inner.unindex(id, &old)?;
            if synced {
                inner.cycle_check()?;
            }
            inner.primary()?.remove(&key)?;
        }
        let current = inner.current;
        // control characters inside a word collapse to spaces on insert
        let cleaned: Vec<String> = words
            .iter()
            .filter(|w| !w.is_empty() && w.len() <= crate::storage::btree::MAX_KEY_LEN)
            .map(|w| {
                w.chars()
                    .map(|c| if c < '\u{20}' { ' ' } else { c })
                    .collect::<String>()
            })
            .collect();
        let mut value = String::with_capacity(16 * cleaned.len() + 4);
        value.push_str(&current.to_string());
        for word in &cleaned {
            value.push('\t');
            value.push_str(word);
        }
        if !inner.primary()?.put_keep(&key, value.as_bytes())? {
            return Err(Error::Keep);
        }
        let norm = normalize_words(&cleaned);
        let synced = inner.shard_mut(current).put_words(id, &norm)?;
        if synced {
            inner.cycle_check()?;
        }
        Ok(())
    }

    /// Remove a record and its postings.
    pub fn remove(&self, id: u64) -> Result<()> {
        if id == 0 {
            return Err(Error::Invalid("record id must be positive".into()));
        }
        let mut inner = self.inner.write();
        inner.primary()?;
        inner.check_writer()?;
        let key = codec::encode_u64(id);
        let Some(value) = inner.primary()?.get(&key)? else {
            return Err(Error::NoRecord);
        };
        let synced = inner.unindex(id, &value)?;
        if synced {
            inner.cycle_check()?;
        }
        inner.primary()?.remove(&key)?;
        Ok(())
    }

    /// The stored words of a record, tab-joined.
    pub fn get(&self, id: u64) -> Result<Option<String>> {
        Ok(self.get_words(id)?.map(|words| words.join("\t")))
    }

    /// The stored words of a record.
    pub fn get_words(&self, id: u64) -> Result<Option<Vec<String>>> {
        if id == 0 {
            return Err(Error::Invalid("record id must be positive".into()));
        }
        let inner = self.inner.read();
        let Some(value) = inner.primary()?.get(&codec::encode_u64(id))? else {
            return Ok(None);
        };
        let (words, _) = inner.decode_record(&value)?;
        Ok(Some(words))
    }

    /// Search for records containing a word matching `word` in the given
    /// mode. Non-full modes expand over the vocabulary first.
    pub fn search(&self, word: &str, mode: SearchMode) -> Result<Vec<u64>> {
        let inner = self.flushed_read()?;
        let norm = normalize(word, NormalizeOptions::standard());
        inner.dispatch(&norm, mode)
    }

    /// Search with a compound expression of `&&`, `||` and `!!` terms.
    pub fn search_expr(&self, expr: &str) -> Result<Vec<u64>> {
        let inner = self.flushed_read()?;
        let terms = expr::parse_terms(expr);
        expr::evaluate(&terms, |term| {
            let Some((word, mode)) = expr::word_term_query(term) else {
                return Ok(Vec::new());
            };
            let norm = normalize(&word, NormalizeOptions::standard());
            inner.dispatch(&norm, mode)
        })
    }

    fn flushed_read(&self) -> Result<parking_lot::RwLockReadGuard<'_, Inner>> {
        let inner = self.inner.read();
        inner.primary()?;
        if !inner.any_dirty() {
            return Ok(inner);
        }
        drop(inner);
        {
            let mut inner = self.inner.write();
            inner.primary()?;
            inner.flush_dirty()?;
        }
        let inner = self.inner.read();
        inner.primary()?;
        Ok(inner)
    }

    /// Start iterating over record IDs. Traversal order is unspecified.
    pub fn iter_init(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.primary()?;
        inner.iter = Some(None);
        Ok(())
    }

    /// The next record ID of the iterator, or `None` at the end.
    pub fn iter_next(&self) -> Result<Option<u64>> {
        let mut inner = self.inner.write();
        inner.primary()?;
        let Some(pos) = inner.iter.clone() else {
            return Err(Error::Invalid("iterator not initialized".into()));
        };
        let primary = inner.primary()?;
        let mut cur = primary.cursor();
        let next = match pos {
            None => cur.next_key()?,
            Some(last) => {
                cur.jump(&last)?;
                let mut key = cur.next_key()?;
                if key.as_deref() == Some(last.as_slice()) {
                    key = cur.next_key()?;
                }
                key
            }
        };
        let Some(key) = next else {
            return Ok(None);
        };
        let (id, _) = codec::read_u64(&key)?;
        inner.iter = Some(Some(key));
        Ok(Some(id))
    }

    /// Flush every buffer and synchronize the files with the device.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.primary()?;
        inner.check_writer()?;
        for i in 0..inner.shard_count {
            inner.shard_mut(i).memsync(2)?;
        }
        inner.cycle_check()?;
        inner.write_header()?;
        inner.vocab()?.memsync(2)?;
        inner.primary()?.memsync(2)
    }

    /// Flush and compact every file of the engine.
    pub fn optimize(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.primary()?;
        inner.check_writer()?;
        inner.primary()?.optimize()?;
        inner.vocab()?.optimize()?;
        for i in 0..inner.shard_count {
            inner.shard_mut(i).optimize()?;
        }
        Ok(())
    }

    /// Remove every record. Shard files are emptied but never unlinked.
    pub fn vanish(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.primary()?;
        inner.check_writer()?;
        inner.primary()?.vanish()?;
        inner.vocab()?.vanish()?;
        for i in 0..inner.shard_count {
            inner.shard_mut(i).vanish()?;
        }
        inner.write_header()?;
        inner.current = 0;
        inner.iter = None;
        Ok(())
    }

    /// Copy the database directory to `dst`.
    pub fn copy(&self, dst: &Path) -> Result<()> {
        let mut inner = self.inner.write();
        inner.primary()?;
        match std::fs::create_dir(dst) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(Error::from_io(e, dst, IoOp::Mkdir)),
        }
        if inner.writer {
            inner.write_header()?;
        }
        inner.primary()?.copy(&dst.join(PRIMARY_NAME))?;
        inner.vocab()?.copy(&dst.join(VOCAB_NAME))?;
        for i in 0..inner.shard_count {
            let target = dst.join(shard_filename(i + 1));
            inner.shard_mut(i).copy(&target)?;
        }
        Ok(())
    }

    /// Number of stored records.
    pub fn record_count(&self) -> Result<u64> {
        let inner = self.inner.read();
        Ok(inner.primary()?.record_count())
    }

    /// Number of distinct words ever indexed.
    pub fn vocabulary_size(&self) -> Result<u64> {
        let inner = self.inner.read();
        Ok(inner.vocab()?.record_count())
    }

    /// Total size in bytes of the primary store, vocabulary and shards.
    pub fn file_size(&self) -> Result<u64> {
        let inner = self.inner.read();
        let mut sum = inner.primary()?.file_size()?;
        sum += inner.vocab()?.file_size()?;
        for i in 0..inner.shard_count {
            sum += inner.shard(i).file_size()?;
        }
        Ok(sum)
    }

    /// Number of open shards.
    pub fn shard_count(&self) -> usize {
        self.inner.read().shard_count
    }

    /// The directory path, when open.
    pub fn path(&self) -> Option<PathBuf> {
        self.inner.read().path.clone()
    }
}
