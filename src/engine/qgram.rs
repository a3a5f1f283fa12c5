//! Sharded q-gram engine
//!
//! The directory holds the primary record store `text.sdb` and up to 32
//! q-gram index shards. Each record's value in the primary store is its
//! original text with a single trailing byte naming the shard holding its
//! postings, so updates and deletes can target exactly that shard.

use super::expr;
use super::{shard_filename, Header, SearchMode, HEADER_LEN, QGRAM_MAGIC};
use crate::codec;
use crate::config::{OpenMode, Tuning, SHARD_MAX};
use crate::error::IoOp;
use crate::index::results;
use crate::index::{MatchMode, QgramIndex, SyncCallback};
use crate::storage::TokenTree;
use crate::text::normalize::{normalize, NormalizeOptions};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};

const PRIMARY_NAME: &str = "text.sdb";

/// Sharded, writer-buffered q-gram search engine.
///
/// All public operations acquire the engine's reader-writer method lock; a
/// search that observes a dirty write buffer upgrades to the writer lock,
/// flushes and retries.
pub struct QgramEngine {
    inner: RwLock<Inner>,
}

struct Inner {
    path: Option<PathBuf>,
    primary: Option<TokenTree>,
    shards: Vec<Option<QgramIndex>>,
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

    fn check_writer(&self) -> Result<()> {
        if !self.writer {
            return Err(Error::Invalid("database opened read-only".into()));
        }
        Ok(())
    }

    fn shard(&self, n: usize) -> &QgramIndex {
        self.shards[n].as_ref().expect("shard not opened")
    }

    fn shard_mut(&mut self, n: usize) -> &mut QgramIndex {
        self.shards[n].as_mut().expect("shard not opened")
    }

    fn shard_path(&self, n: usize) -> PathBuf {
        self.path
            .as_ref()
            .expect("database not opened")
            .join(shard_filename(n + 1))
    }

    /// Ensure a shard is current, creating the next shard file on the very
    /// first put after open or after cycling past every existing shard.
    fn ensure_current_shard(&mut self) -> Result<()> {
        if self.current < self.shard_count {
            return Ok(());
        }
        if self.shard_count >= SHARD_MAX {
            self.current = self.shard_count - 1;
            return Ok(());
        }
        let path = self.shard_path(self.shard_count);
        let mut idx = QgramIndex::open(
            &path,
            self.shard_mode | OpenMode::CREATE,
            &self.tuning,
        )?;
        idx.set_sync_callback(self.sync_cb.clone());
        self.shards[self.shard_count] = Some(idx);
        self.current = self.shard_count;
        self.shard_count += 1;
        Ok(())
    }

    /// After a flush reached the disk, advance the current shard if it grew
    /// past the unit size: drop its cache, pick the smallest shard, or
    /// schedule a new one while below the shard cap.
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

    /// Decode a primary-store value into `(text, shard)`.
    fn decode_record(&self, value: &[u8]) -> Result<(String, usize)> {
        let Some((&shard, text)) = value.split_last() else {
            return Err(Error::Misc("primary record missing shard trailer".into()));
        };
        let shard = shard as usize;
        if shard >= SHARD_MAX || shard >= self.shard_count {
            return Err(Error::Misc(format!("record names unknown shard {}", shard)));
        }
        let text = std::str::from_utf8(text)
            .map_err(|_| Error::Misc("primary record text is not UTF-8".into()))?;
        Ok((text.to_string(), shard))
    }

    /// Drop the postings of a stored record from its assigned shard.
    fn unindex(&mut self, id: u64, value: &[u8]) -> Result<bool> {
        let (text, shard) = self.decode_record(value)?;
        let norm = normalize(&text, NormalizeOptions::standard());
        self.shard_mut(shard).remove(id, &norm)
    }

    fn any_dirty(&self) -> bool {
        self.shards[..self.shard_count]
            .iter()
            .any(|s| s.as_ref().is_some_and(QgramIndex::is_dirty))
    }

    fn flush_dirty(&mut self) -> Result<()> {
        for i in 0..self.shard_count {
            if self.shard(i).is_dirty() {
                self.shard_mut(i).memsync(0)?;
            }
        }
        Ok(())
    }

    /// Search every shard and union the per-shard result sets.
    fn search_shards(&self, word: &str, mode: MatchMode) -> Result<Vec<u64>> {
        if self.shard_count == 0 {
            return Ok(Vec::new());
        }
        if self.shard_count == 1 {
            return self.shard(0).search(word, mode);
        }
        let mut sets = Vec::with_capacity(self.shard_count);
        for i in 0..self.shard_count {
            sets.push(self.shard(i).search(word, mode)?);
        }
        Ok(results::union(&sets))
    }

    /// Dispatch a normalized word, decomposing the token meta-modes into
    /// padded-space primitive queries.
    fn dispatch(&self, word: &str, mode: SearchMode) -> Result<Vec<u64>> {
        match mode {
            SearchMode::Substring => self.search_shards(word, MatchMode::Substring),
            SearchMode::Prefix => self.search_shards(word, MatchMode::Prefix),
            SearchMode::Suffix => self.search_shards(word, MatchMode::Suffix),
            SearchMode::Full => self.search_shards(word, MatchMode::Full),
            SearchMode::Token => {
                let sets = vec![
                    self.search_shards(word, MatchMode::Full)?,
                    self.search_shards(&format!(" {} ", word), MatchMode::Substring)?,
                    self.search_shards(&format!("{} ", word), MatchMode::Prefix)?,
                    self.search_shards(&format!(" {}", word), MatchMode::Suffix)?,
                ];
                Ok(results::union(&sets))
            }
            SearchMode::TokenPrefix => {
                let sets = vec![
                    self.search_shards(word, MatchMode::Prefix)?,
                    self.search_shards(&format!(" {}", word), MatchMode::Substring)?,
                ];
                Ok(results::union(&sets))
            }
            SearchMode::TokenSuffix => {
                let sets = vec![
                    self.search_shards(word, MatchMode::Suffix)?,
                    self.search_shards(&format!("{} ", word), MatchMode::Substring)?,
                ];
                Ok(results::union(&sets))
            }
        }
    }

    fn write_header(&self) -> Result<()> {
        let header = Header {
            magic: QGRAM_MAGIC,
            shard_count: self.shard_count as u8,
            opts: self.tuning.opts,
            expected_tokens: self.tuning.expected_tokens as i64,
            shard_unit_size: self.tuning.shard_unit_size as i64,
        };
        self.primary()?.write_opaque(&header.encode())
    }
}

impl Default for QgramEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl QgramEngine {
    /// Create an unopened engine with default tuning.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                path: None,
                primary: None,
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
            let mut victims = vec![path.join(PRIMARY_NAME)];
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
        let opaque = primary.opaque();
        let mut shard_count;
        if opaque[0] == 0 && writer {
            shard_count = 0;
            inner.writer = true;
        } else {
            let header = Header::decode(&opaque[..HEADER_LEN], QGRAM_MAGIC)?;
            shard_count = header.shard_count as usize;
            inner.tuning.opts = header.opts;
            inner.tuning.expected_tokens = header.expected_tokens as u64;
            inner.tuning.shard_unit_size = header.shard_unit_size as u64;
            inner.writer = writer;
        }
        // recover shard files present beyond a stale header count
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
        let mut shards: Vec<Option<QgramIndex>> = (0..SHARD_MAX).map(|_| None).collect();
        let mut current = 0;
        let mut min = u64::MAX;
        for i in 0..shard_count {
            let mut idx = QgramIndex::open(
                &path.join(shard_filename(i + 1)),
                shard_mode,
                &inner.tuning,
            )?;
            idx.set_sync_callback(inner.sync_cb.clone());
            let size = idx.file_size()?;
            if size < min {
                current = i;
                min = size;
            }
            shards[i] = Some(idx);
        }
        inner.path = Some(path.to_path_buf());
        inner.primary = Some(primary);
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

    /// Store a record, replacing any previous text under the same ID.
    pub fn put(&self, id: u64, text: &str) -> Result<()> {
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
        let mut value = Vec::with_capacity(text.len() + 1);
        value.extend_from_slice(text.as_bytes());
        value.push(current as u8);
        if !inner.primary()?.put_keep(&key, &value)? {
            return Err(Error::Keep);
        }
        let norm = normalize(text, NormalizeOptions::standard());
        let synced = inner.shard_mut(current).put(id, &norm)?;
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

    /// The stored original text of a record.
    pub fn get(&self, id: u64) -> Result<Option<String>> {
        if id == 0 {
            return Err(Error::Invalid("record id must be positive".into()));
        }
        let inner = self.inner.read();
        let Some(value) = inner.primary()?.get(&codec::encode_u64(id))? else {
            return Ok(None);
        };
        let (text, _) = inner.decode_record(&value)?;
        Ok(Some(text))
    }

    /// Search for records matching `word` in the given mode.
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
            let Some((word, mode)) = expr::qgram_term_query(term) else {
                return Ok(Vec::new());
            };
            let norm = normalize(&word, NormalizeOptions::standard());
            inner.dispatch(&norm, mode)
        })
    }

    /// Take the reader lock with every shard buffer clean, upgrading once
    /// to flush when a dirty buffer is observed.
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
        inner.primary()?.memsync(2)
    }

    /// Flush and compact every file of the engine.
    pub fn optimize(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.primary()?;
        inner.check_writer()?;
        inner.primary()?.optimize()?;
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

    /// Total size in bytes of the primary store and every shard.
    pub fn file_size(&self) -> Result<u64> {
        let inner = self.inner.read();
        let mut sum = inner.primary()?.file_size()?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_engine(path: &Path) -> QgramEngine {
        let engine = QgramEngine::new();
        engine
            .open(path, OpenMode::WRITER | OpenMode::CREATE)
            .unwrap();
        engine
    }

    #[test]
    fn test_open_close_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        let engine = open_engine(&path);
        assert_eq!(engine.shard_count(), 0);
        assert_eq!(engine.record_count().unwrap(), 0);
        engine.close().unwrap();
        // reader sees the valid header and no records
        let reader = QgramEngine::new();
        reader.open(&path, OpenMode::READER).unwrap();
        assert_eq!(reader.record_count().unwrap(), 0);
        assert_eq!(reader.search("foo", SearchMode::Full).unwrap(), Vec::<u64>::new());
        reader.close().unwrap();
    }

    #[test]
    fn test_empty_search() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir.path().join("db"));
        assert_eq!(engine.search("foo", SearchMode::Full).unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn test_single_insert_full_search() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir.path().join("db"));
        engine.put(1, "Hello World").unwrap();
        assert_eq!(engine.search("hello world", SearchMode::Full).unwrap(), vec![1]);
        assert_eq!(engine.search("hello", SearchMode::Prefix).unwrap(), vec![1]);
        assert_eq!(engine.search("world", SearchMode::Suffix).unwrap(), vec![1]);
        assert_eq!(engine.search("xyz", SearchMode::Full).unwrap(), Vec::<u64>::new());
        assert_eq!(engine.get(1).unwrap(), Some("Hello World".to_string()));
    }

    #[test]
    fn test_substring_modes() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir.path().join("db"));
        engine.put(1, "abcdef").unwrap();
        assert_eq!(engine.search("cd", SearchMode::Substring).unwrap(), vec![1]);
        assert_eq!(engine.search("cf", SearchMode::Substring).unwrap(), Vec::<u64>::new());
        assert_eq!(engine.search("ef", SearchMode::Suffix).unwrap(), vec![1]);
        assert_eq!(engine.search("ab", SearchMode::Prefix).unwrap(), vec![1]);
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir.path().join("db"));
        engine.put(1, "apple").unwrap();
        engine.put(2, "application").unwrap();
        engine.remove(1).unwrap();
        engine.sync().unwrap();
        assert_eq!(engine.search("app", SearchMode::Prefix).unwrap(), vec![2]);
        assert_eq!(engine.get(1).unwrap(), None);
        let err = engine.remove(1).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::NoRecord);
    }

    #[test]
    fn test_reput_replaces_tokens() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir.path().join("db"));
        engine.put(1, "first text").unwrap();
        engine.put(1, "second words").unwrap();
        assert_eq!(engine.search("first", SearchMode::Substring).unwrap(), Vec::<u64>::new());
        assert_eq!(engine.search("second", SearchMode::Substring).unwrap(), vec![1]);
        assert_eq!(engine.get(1).unwrap(), Some("second words".to_string()));
        assert_eq!(engine.record_count().unwrap(), 1);
    }

    #[test]
    fn test_normalization_end_to_end() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir.path().join("db"));
        engine.put(1, "Café  RÉSUMÉ").unwrap();
        assert_eq!(engine.search("cafe resume", SearchMode::Full).unwrap(), vec![1]);
        // original text round-trips unnormalized
        assert_eq!(engine.get(1).unwrap(), Some("Café  RÉSUMÉ".to_string()));
    }

    #[test]
    fn test_compound_expressions() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir.path().join("db"));
        engine.put(1, "red apple").unwrap();
        engine.put(2, "green apple").unwrap();
        engine.put(3, "red car").unwrap();
        assert_eq!(engine.search_expr("apple && red").unwrap(), vec![1]);
        assert_eq!(engine.search_expr("apple || car").unwrap(), vec![1, 2, 3]);
        assert_eq!(engine.search_expr("red !! car").unwrap(), vec![1]);
        assert_eq!(engine.search_expr("\"red apple\"").unwrap(), vec![1]);
    }

    #[test]
    fn test_token_modes() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir.path().join("db"));
        engine.put(1, "alpha beta gamma").unwrap();
        engine.put(2, "alphabet soup").unwrap();
        let hits = engine.search("alpha", SearchMode::Token).unwrap();
        assert_eq!(hits, vec![1]);
        let mut hits = engine.search("alpha", SearchMode::TokenPrefix).unwrap();
        hits.sort_unstable();
        assert_eq!(hits, vec![1, 2]);
        let hits = engine.search("beta", SearchMode::Token).unwrap();
        assert_eq!(hits, vec![1]);
        // "alphabet" is a token ending with "bet"
        let hits = engine.search("bet", SearchMode::TokenSuffix).unwrap();
        assert_eq!(hits, vec![2]);
        let hits = engine.search("soup", SearchMode::Token).unwrap();
        assert_eq!(hits, vec![2]);
    }

    #[test]
    fn test_token_bracket_expr() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir.path().join("db"));
        engine.put(1, "alpha beta").unwrap();
        engine.put(2, "alphabet").unwrap();
        assert_eq!(engine.search_expr("[[alpha]]").unwrap(), vec![1]);
        let mut hits = engine.search_expr("[[alpha*]]").unwrap();
        hits.sort_unstable();
        assert_eq!(hits, vec![1, 2]);
        assert_eq!(engine.search_expr("[[[[alpha").unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_shard_cycling() {
        let dir = TempDir::new().unwrap();
        let engine = QgramEngine::new();
        let mut tuning = Tuning::default();
        tuning.shard_unit_size = 64 * 1024;
        tuning.buffer_capacity = 16 * 1024;
        engine.tune(tuning).unwrap();
        let path = dir.path().join("db");
        engine.open(&path, OpenMode::WRITER | OpenMode::CREATE).unwrap();
        let filler = "lorem ipsum dolor sit amet consectetur adipiscing elit sed do eiusmod";
        let mut id = 1u64;
        while engine.shard_count() < 2 && id < 5000 {
            engine.put(id, &format!("{} {}", filler, id)).unwrap();
            id += 1;
        }
        assert!(engine.shard_count() >= 2, "expected cycling to open shard 0002");
        assert!(path.join("0001").is_file());
        assert!(path.join("0002").is_file());
        // every record still searchable across shards
        engine.sync().unwrap();
        let hits = engine.search("lorem", SearchMode::Prefix).unwrap();
        assert_eq!(hits.len() as u64, id - 1);
        engine.close().unwrap();

        // reopen sees the same shard count
        let engine = QgramEngine::new();
        engine.open(&path, OpenMode::WRITER).unwrap();
        assert!(engine.shard_count() >= 2);
        let hits = engine.search("lorem", SearchMode::Prefix).unwrap();
        assert_eq!(hits.len() as u64, id - 1);
        engine.close().unwrap();
    }

    #[test]
    fn test_iterator() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir.path().join("db"));
        for id in [5u64, 200, 7, 40] {
            engine.put(id, "some text").unwrap();
        }
        engine.iter_init().unwrap();
        let mut seen = Vec::new();
        while let Some(id) = engine.iter_next().unwrap() {
            seen.push(id);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![5, 7, 40, 200]);
    }

    #[test]
    fn test_iter_requires_init() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir.path().join("db"));
        let err = engine.iter_next().unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::Invalid);
    }

    #[test]
    fn test_vanish_keeps_shard_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        let engine = open_engine(&path);
        engine.put(1, "content here").unwrap();
        engine.sync().unwrap();
        assert!(path.join("0001").is_file());
        engine.vanish().unwrap();
        assert_eq!(engine.record_count().unwrap(), 0);
        assert_eq!(engine.search("content", SearchMode::Substring).unwrap(), Vec::<u64>::new());
        assert!(path.join("0001").is_file());
        // still usable after vanish
        engine.put(2, "content again").unwrap();
        assert_eq!(engine.search("content", SearchMode::Substring).unwrap(), vec![2]);
    }

    #[test]
    fn test_copy() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir.path().join("db"));
        engine.put(1, "copied text").unwrap();
        let dst = dir.path().join("backup");
        engine.copy(&dst).unwrap();
        engine.close().unwrap();
        let restored = QgramEngine::new();
        restored.open(&dst, OpenMode::READER).unwrap();
        assert_eq!(restored.search("copied", SearchMode::Prefix).unwrap(), vec![1]);
        assert_eq!(restored.get(1).unwrap(), Some("copied text".to_string()));
    }

    #[test]
    fn test_open_invalid_states() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        let engine = open_engine(&path);
        // double open
        let err = engine.open(&path, OpenMode::READER).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::Invalid);
        // tune after open
        assert_eq!(
            engine.tune(Tuning::default()).unwrap_err().code(),
            crate::ErrorCode::Invalid
        );
        engine.close().unwrap();
        // reader on a missing directory
        let missing = QgramEngine::new();
        let err = missing
            .open(&dir.path().join("absent"), OpenMode::READER)
            .unwrap_err();
        assert!(matches!(
            err.code(),
            crate::ErrorCode::NoFile | crate::ErrorCode::Stat
        ));
    }

    #[test]
    fn test_writer_mode_enforced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        open_engine(&path).close().unwrap();
        let reader = QgramEngine::new();
        reader.open(&path, OpenMode::READER).unwrap();
        assert_eq!(reader.put(1, "x").unwrap_err().code(), crate::ErrorCode::Invalid);
        assert_eq!(reader.sync().unwrap_err().code(), crate::ErrorCode::Invalid);
        assert_eq!(reader.vanish().unwrap_err().code(), crate::ErrorCode::Invalid);
        reader.close().unwrap();
    }

    #[test]
    fn test_truncate_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        {
            let engine = open_engine(&path);
            engine.put(1, "old world").unwrap();
            engine.close().unwrap();
        }
        let engine = QgramEngine::new();
        engine
            .open(
                &path,
                OpenMode::WRITER | OpenMode::CREATE | OpenMode::TRUNCATE,
            )
            .unwrap();
        assert_eq!(engine.record_count().unwrap(), 0);
        assert_eq!(engine.search("old", SearchMode::Substring).unwrap(), Vec::<u64>::new());
        engine.close().unwrap();
    }
}
