//! Single-shard word inverted index
//!
//! Tokens are whole words supplied by the caller (the sharded engine splits
//! and normalizes record text). Within one record each word contributes at
//! most one posting. The posting offset carries no information at word
//! granularity and is stored as zero.
//!
//! An optional word sink receives every flushed token; the sharded engine
//! installs its vocabulary store there to drive substring/prefix/suffix
//! expansion.

use super::buffer::WriteBuffer;
use super::{SyncCallback, SyncPhase};
use crate::codec;
use crate::config::{OpenMode, Tuning, TuningOptions, MAX_WORD_LEN};
use crate::storage::btree::MAX_KEY_LEN;
use crate::storage::TokenTree;
use crate::{Error, Result};
use ahash::AHashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic data at the start of the opaque header region.
const MAGIC: &[u8] = b"[word]";

/// Buckets of the deleted-id set.
const DELETED_IDS_BUCKETS: usize = 262139;

pub struct WordIndex {
    tree: TokenTree,
    buffer: Option<WriteBuffer<Vec<u8>>>,
    buffer_capacity: u64,
    sync_cb: Option<SyncCallback>,
    word_sink: Option<Arc<TokenTree>>,
    path: PathBuf,
}

impl WordIndex {
    /// Open a word index file.
    pub fn open(path: &Path, mode: OpenMode, tuning: &Tuning) -> Result<Self> {
        let tree = TokenTree::open(
            path,
            mode,
            tuning.leaf_cache_for(mode),
            tuning.opts.contains(TuningOptions::COMPRESS),
        )?;
        let writer = mode.contains(OpenMode::WRITER);
        if writer && tree.record_count() < 1 {
            tree.write_opaque(MAGIC)?;
        } else if !mode.contains(OpenMode::NO_LOCK) && !tree.opaque().starts_with(MAGIC) {
            return Err(Error::Metadata(format!(
                "{}: not a word index",
                path.display()
            )));
        }
        Ok(Self {
            tree,
            buffer: writer.then(|| WriteBuffer::new(DELETED_IDS_BUCKETS)),
            buffer_capacity: tuning.buffer_capacity,
            sync_cb: None,
            word_sink: None,
            path: path.to_path_buf(),
        })
    }

    /// Set the progress callback invoked at each flush phase.
    pub fn set_sync_callback(&mut self, cb: Option<SyncCallback>) {
        self.sync_cb = cb;
    }

    /// Install the store that receives every flushed word.
    pub fn set_word_sink(&mut self, sink: Option<Arc<TokenTree>>) {
        self.word_sink = sink;
    }

    /// Flush pending updates and close the index.
    pub fn close(mut self) -> Result<()> {
        if self.buffer.as_ref().is_some_and(WriteBuffer::is_dirty) {
            self.memsync(0)?;
        }
        self.tree.memsync(1)
    }

    /// Index `words` under `id`, one posting per distinct word. Returns
    /// true when the call flushed the buffer to disk.
    pub fn put_words(&mut self, id: u64, words: &[String]) -> Result<bool> {
        if id == 0 {
            return Err(Error::Invalid("record id must be positive".into()));
        }
        if self.buffer.is_none() {
            return Err(Error::Invalid("index opened read-only".into()));
        }
        if self.buffer.as_ref().unwrap().is_dead_id(id) {
            self.memsync(0)?;
        }
        let mut posting = Vec::with_capacity(12);
        codec::write_u64(&mut posting, id);
        codec::write_u32(&mut posting, 0);
        let buffer = self.buffer.as_mut().unwrap();
        let mut uniq = AHashSet::with_capacity(words.len());
        for word in words {
            if word.is_empty() || word.len() > MAX_KEY_LEN {
                continue;
            }
            if !uniq.insert(word.as_str()) {
                continue;
            }
            buffer.append(word.clone().into_bytes(), &posting);
        }
        if self.buffer.as_ref().unwrap().pending_bytes() >= self.buffer_capacity {
            self.memsync(1)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Remove the postings of `id`, whose indexed words were `words`.
    /// Returns true when the call flushed the buffer to disk.
    pub fn remove_words(&mut self, id: u64, words: &[String]) -> Result<bool> {
        if id == 0 {
            return Err(Error::Invalid("record id must be positive".into()));
        }
        if self.buffer.is_none() {
            return Err(Error::Invalid("index opened read-only".into()));
        }
        if self.buffer.as_ref().unwrap().is_dead_id(id) {
            return Ok(false);
        }
        if self.buffer.as_ref().unwrap().pending_len() > 0 {
            self.memsync(0)?;
        }
        let buffer = self.buffer.as_mut().unwrap();
        for word in words {
            if word.is_empty() || word.len() > MAX_KEY_LEN {
                continue;
            }
            buffer.mark_deleted(word.clone().into_bytes());
        }
        buffer.mark_dead_id(id);
        if self.buffer.as_ref().unwrap().deleted_bytes() >= self.buffer_capacity {
            self.memsync(1)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Whether the write buffer holds unflushed updates.
    pub fn is_dirty(&self) -> bool {
        self.buffer.as_ref().is_some_and(WriteBuffer::is_dirty)
    }

    /// Drain the write buffer into the KV store, feeding flushed words to
    /// the word sink.
    pub fn memsync(&mut self, level: u8) -> Result<()> {
        let Some(buffer) = self.buffer.as_mut() else {
            return Err(Error::Invalid("index opened read-only".into()));
        };
        let cb = self.sync_cb.clone();
        report(&cb, 0, 0, SyncPhase::Started)?;
        if buffer.pending_len() > 0 {
            report(&cb, 0, 0, SyncPhase::GettingTokens)?;
            let keys = buffer.sorted_pending_keys();
            let total = keys.len() as u64;
            report(&cb, total, 0, SyncPhase::SortingTokens)?;
            let mut stored = Vec::with_capacity(keys.len());
            for (i, key) in keys.iter().enumerate() {
                report(&cb, total, i as u64 + 1, SyncPhase::StoringTokens)?;
                let Some(bytes) = buffer.take_pending(key) else {
                    continue;
                };
                self.tree.put_cat(key, &bytes)?;
                stored.push(key.clone());
            }
            if let Some(sink) = &self.word_sink {
                report(&cb, 0, 0, SyncPhase::StoringKeywordList)?;
                for word in &stored {
                    sink.put_keep(word, b"")?;
                }
            }
        }
        if buffer.deleted_len() > 0 {
            report(&cb, 0, 0, SyncPhase::GettingDeletedTokens)?;
            let keys = buffer.sorted_deleted_keys();
            let total = keys.len() as u64;
            report(&cb, total, 0, SyncPhase::SortingDeletedTokens)?;
            for (i, key) in keys.iter().enumerate() {
                report(&cb, total, i as u64 + 1, SyncPhase::StoringDeletedTokens)?;
                if let Some(value) = self.tree.get(key)? {
                    let pruned = prune_postings(&value, |id| buffer.is_dead_id(id))?;
                    if pruned.is_empty() {
                        self.tree.remove(key)?;
                    } else if pruned.len() != value.len() {
                        self.tree.put(key, &pruned)?;
                    }
                }
                buffer.take_deleted(key);
            }
            buffer.clear_dead_ids();
        }
        if level > 0 {
            report(&cb, 0, 0, SyncPhase::SynchronizingDatabase)?;
            self.tree.memsync(level)?;
        }
        report(&cb, 0, 0, SyncPhase::Finished)?;
        Ok(())
    }

    /// IDs of the records containing `word` as a whole token.
    ///
    /// Pending buffered updates are not visible; the caller flushes first
    /// when read-after-write consistency is needed.
    pub fn search(&self, word: &str) -> Result<Vec<u64>> {
        if word.len() > MAX_WORD_LEN {
            return Err(Error::Invalid("search word too long".into()));
        }
        let Some(value) = self.tree.get(word.as_bytes())? else {
            return Ok(Vec::new());
        };
        let mut res = Vec::new();
        let mut buf = value.as_slice();
        while !buf.is_empty() {
            let (id, step) = codec::read_u64(buf)?;
            buf = &buf[step..];
            let (_, step) = codec::read_u32(buf)?;
            buf = &buf[step..];
            res.push(id);
        }
        Ok(res)
    }

    /// Number of distinct words stored.
    pub fn token_count(&self) -> u64 {
        self.tree.record_count()
    }

    /// Size of the index file in bytes.
    pub fn file_size(&self) -> Result<u64> {
        self.tree.file_size()
    }

    /// Number of words held in the write buffer.
    pub fn buffered_tokens(&self) -> usize {
        self.buffer.as_ref().map_or(0, WriteBuffer::pending_len)
    }

    /// Drop the page cache.
    pub fn cache_clear(&self) {
        self.tree.cache_clear();
    }

    /// Flush and compact the index file.
    pub fn optimize(&mut self) -> Result<()> {
        self.memsync(1)?;
        self.tree.optimize()
    }

    /// Remove every token and pending update.
    pub fn vanish(&mut self) -> Result<()> {
        let Some(buffer) = self.buffer.as_mut() else {
            return Err(Error::Invalid("index opened read-only".into()));
        };
        buffer.clear();
        self.tree.vanish()?;
        self.tree.write_opaque(MAGIC)
    }

    /// Flush and copy the index file to `dst`.
    pub fn copy(&mut self, dst: &Path) -> Result<()> {
        if self.buffer.is_some() {
            self.memsync(1)?;
        }
        self.tree.copy(dst)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn report(cb: &Option<SyncCallback>, total: u64, current: u64, phase: SyncPhase) -> Result<()> {
    if let Some(cb) = cb {
        if !cb(total, current, phase) {
            return Err(Error::Misc(format!("sync cancelled at {}", phase.as_str())));
        }
    }
    Ok(())
}

/// Rewrite a packed postings value, dropping postings whose ID is dead.
fn prune_postings(mut value: &[u8], dead: impl Fn(u64) -> bool) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(value.len());
    while !value.is_empty() {
        let start = value;
        let (id, step) = codec::read_u64(value)?;
        value = &value[step..];
        let (_, step2) = codec::read_u32(value)?;
        value = &value[step2..];
        if !dead(id) {
            out.extend_from_slice(&start[..step + step2]);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn open_writer(path: &Path) -> WordIndex {
        WordIndex::open(
            path,
            OpenMode::WRITER | OpenMode::CREATE,
            &Tuning::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_put_and_search() {
        let dir = TempDir::new().unwrap();
        let mut idx = open_writer(&dir.path().join("0001"));
        idx.put_words(1, &words(&["hello", "world"])).unwrap();
        idx.put_words(2, &words(&["hello", "rust"])).unwrap();
        idx.memsync(0).unwrap();
        assert_eq!(idx.search("hello").unwrap(), vec![1, 2]);
        assert_eq!(idx.search("world").unwrap(), vec![1]);
        assert_eq!(idx.search("absent").unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn test_dedup_within_record() {
        let dir = TempDir::new().unwrap();
        let mut idx = open_writer(&dir.path().join("0001"));
        idx.put_words(1, &words(&["dup", "dup", "dup"])).unwrap();
        idx.memsync(0).unwrap();
        assert_eq!(idx.search("dup").unwrap(), vec![1]);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let mut idx = open_writer(&dir.path().join("0001"));
        idx.put_words(1, &words(&["shared", "only1"])).unwrap();
        idx.put_words(2, &words(&["shared", "only2"])).unwrap();
        idx.remove_words(1, &words(&["shared", "only1"])).unwrap();
        idx.memsync(0).unwrap();
        assert_eq!(idx.search("shared").unwrap(), vec![2]);
        assert_eq!(idx.search("only1").unwrap(), Vec::<u64>::new());
        assert_eq!(idx.search("only2").unwrap(), vec![2]);
    }

    #[test]
    fn test_word_sink_collects_vocabulary() {
        let dir = TempDir::new().unwrap();
        let vocab = Arc::new(
            TokenTree::open(
                &dir.path().join("list.sdb"),
                OpenMode::WRITER | OpenMode::CREATE,
                16,
                false,
            )
            .unwrap(),
        );
        let mut idx = open_writer(&dir.path().join("0001"));
        idx.set_word_sink(Some(vocab.clone()));
        idx.put_words(1, &words(&["banana", "apple"])).unwrap();
        idx.put_words(2, &words(&["apple", "cherry"])).unwrap();
        idx.memsync(0).unwrap();
        assert_eq!(vocab.record_count(), 3);
        assert!(vocab.get(b"apple").unwrap().is_some());
        assert!(vocab.get(b"cherry").unwrap().is_some());
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0001");
        {
            let mut idx = open_writer(&path);
            idx.put_words(9, &words(&["durable"])).unwrap();
            idx.close().unwrap();
        }
        let idx = WordIndex::open(&path, OpenMode::READER, &Tuning::default()).unwrap();
        assert_eq!(idx.search("durable").unwrap(), vec![9]);
    }

    #[test]
    fn test_reput_after_remove() {
        let dir = TempDir::new().unwrap();
        let mut idx = open_writer(&dir.path().join("0001"));
        idx.put_words(1, &words(&["old"])).unwrap();
        idx.memsync(0).unwrap();
        idx.remove_words(1, &words(&["old"])).unwrap();
        idx.put_words(1, &words(&["new"])).unwrap();
        idx.memsync(0).unwrap();
        assert_eq!(idx.search("old").unwrap(), Vec::<u64>::new());
        assert_eq!(idx.search("new").unwrap(), vec![1]);
    }

    #[test]
    fn test_vanish() {
        let dir = TempDir::new().unwrap();
        let mut idx = open_writer(&dir.path().join("0001"));
        idx.put_words(1, &words(&["ephemeral"])).unwrap();
        idx.memsync(0).unwrap();
        idx.vanish().unwrap();
        assert_eq!(idx.search("ephemeral").unwrap(), Vec::<u64>::new());
        assert_eq!(idx.token_count(), 0);
    }
}
