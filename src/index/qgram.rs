//! Single-shard q-gram inverted index
//!
//! Tokens are 2-codepoint sliding windows over normalized text; every put
//! appends `(record_id, offset)` postings to the write buffer, and a flush
//! drains the buffer into the ordered KV store with keys sorted so the
//! B+tree sees sequential inserts. Substring search fetches the windows at
//! even positions and stitches them back together by offset chaining;
//! prefix/suffix/full constrain the chain ends.
//!
//! Callers are expected to normalize text before indexing and searching
//! with the same options; the sharded engine does this.

use super::buffer::WriteBuffer;
use super::idset::IdSet;
use super::{MatchMode, SyncCallback, SyncPhase};
use crate::codec;
use crate::config::{OpenMode, Tuning, TuningOptions, MAX_WORD_LEN};
use crate::storage::TokenTree;
use crate::text::normalize::to_units;
use crate::text::tokenize::{qgram_key, qgram_stream, Qgram};
use crate::{Error, Result};
use roaring::RoaringBitmap;
use std::path::{Path, PathBuf};

/// Magic data at the start of the opaque header region.
const MAGIC: &[u8] = b"[q-gram]";

/// Elements of the search presence bitmap.
pub const BITMAP_NUM: u64 = 524287;

/// Buckets of the deleted-id set.
const DELETED_IDS_BUCKETS: usize = 262139;

/// Coefficient of the bucket number for hash joins.
const HASH_JOIN_CO: usize = 4;

/// One parsed posting occurrence during a chained search.
#[derive(Debug, Clone, Copy)]
struct Occurrence {
    id: u64,
    off: i32,
    seq: u16,
    hash: u16,
}

pub struct QgramIndex {
    tree: TokenTree,
    buffer: Option<WriteBuffer<Qgram>>,
    buffer_capacity: u64,
    fwm_max: u32,
    sync_cb: Option<SyncCallback>,
    path: PathBuf,
}

impl std::fmt::Debug for QgramIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QgramIndex").finish()
    }
}

impl QgramIndex {
    /// Open a q-gram index file.
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
                "{}: not a q-gram index",
                path.display()
            )));
        }
        Ok(Self {
            tree,
            buffer: writer.then(|| WriteBuffer::new(DELETED_IDS_BUCKETS)),
            buffer_capacity: tuning.buffer_capacity,
            fwm_max: tuning.fwm_max.max(1),
            sync_cb: None,
            path: path.to_path_buf(),
        })
    }

    /// Set the progress callback invoked at each flush phase.
    pub fn set_sync_callback(&mut self, cb: Option<SyncCallback>) {
        self.sync_cb = cb;
    }

    /// Flush pending updates and close the index.
    pub fn close(mut self) -> Result<()> {
        if self.buffer.as_ref().is_some_and(WriteBuffer::is_dirty) {
            self.memsync(0)?;
        }
        self.tree.memsync(1)
    }

    /// Index `text` under `id`. Returns true when the call flushed the
    /// buffer to disk.
    pub fn put(&mut self, id: u64, text: &str) -> Result<bool> {
        if id == 0 {
            return Err(Error::Invalid("record id must be positive".into()));
        }
        if self.buffer.is_none() {
            return Err(Error::Invalid("index opened read-only".into()));
        }
        // old tombstones must commit before new postings for this id land
        if self.buffer.as_ref().unwrap().is_dead_id(id) {
            self.memsync(0)?;
        }
        let units = to_units(text);
        let mut posting = Vec::with_capacity(12);
        let buffer = self.buffer.as_mut().unwrap();
        for (gram, off) in qgram_stream(&units) {
            posting.clear();
            codec::write_u64(&mut posting, id);
            codec::write_u32(&mut posting, off);
            buffer.append(gram, &posting);
        }
        if self.buffer.as_ref().unwrap().pending_bytes() >= self.buffer_capacity {
            self.memsync(1)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Remove the postings of `id`, whose indexed text was `text`. Returns
    /// true when the call flushed the buffer to disk.
    pub fn remove(&mut self, id: u64, text: &str) -> Result<bool> {
        if id == 0 {
            return Err(Error::Invalid("record id must be positive".into()));
        }
        if self.buffer.is_none() {
            return Err(Error::Invalid("index opened read-only".into()));
        }
        if self.buffer.as_ref().unwrap().is_dead_id(id) {
            return Ok(false);
        }
        // pending postings of this id must land before the tombstones
        if self.buffer.as_ref().unwrap().pending_len() > 0 {
            self.memsync(0)?;
        }
        let units = to_units(text);
        let buffer = self.buffer.as_mut().unwrap();
        for (gram, _) in qgram_stream(&units) {
            buffer.mark_deleted(gram);
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

    /// Drain the write buffer into the KV store.
    ///
    /// Additions first, keys sorted, then deletions with tombstone pruning,
    /// then the deleted-id set is cleared. At `level >= 1` the store's dirty
    /// state is flushed; `level >= 2` adds fsync.
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
            for (i, key) in keys.iter().enumerate() {
                report(&cb, total, i as u64 + 1, SyncPhase::StoringTokens)?;
                let Some(bytes) = buffer.take_pending(key) else {
                    continue;
                };
                self.tree.put_cat(&qgram_key(*key), &bytes)?;
            }
        }
        if buffer.deleted_len() > 0 {
            report(&cb, 0, 0, SyncPhase::GettingDeletedTokens)?;
            let keys = buffer.sorted_deleted_keys();
            let total = keys.len() as u64;
            report(&cb, total, 0, SyncPhase::SortingDeletedTokens)?;
            for (i, key) in keys.iter().enumerate() {
                report(&cb, total, i as u64 + 1, SyncPhase::StoringDeletedTokens)?;
                let token = qgram_key(*key);
                if let Some(value) = self.tree.get(&token)? {
                    let pruned = prune_postings(&value, |id| buffer.is_dead_id(id))?;
                    if pruned.is_empty() {
                        self.tree.remove(&token)?;
                    } else if pruned.len() != value.len() {
                        self.tree.put(&token, &pruned)?;
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

    /// Search for `word` in the given mode, returning matching record IDs.
    ///
    /// Pending buffered updates are not visible; the caller flushes first
    /// when read-after-write consistency is needed.
    pub fn search(&self, word: &str, mode: MatchMode) -> Result<Vec<u64>> {
        if word.len() > MAX_WORD_LEN {
            return Err(Error::Invalid("search word too long".into()));
        }
        let units = to_units(word);
        if units.is_empty() {
            return Ok(Vec::new());
        }
        if units.len() >= 2 {
            self.search_chained(&units, mode)
        } else {
            self.search_single(word.as_bytes(), mode)
        }
    }

    /// Multi-window search: fetch q-grams at even positions, keep postings
    /// whose IDs survived the first window, then sort and walk offset
    /// chains.
    fn search_chained(&self, units: &[u16], mode: MatchMode) -> Result<Vec<u64>> {
        let anum = units.len();
        let mut ocrs: Vec<Occurrence> = Vec::with_capacity(1024);
        let mut pkmap = RoaringBitmap::new();
        let mut seq: u16 = 0;
        let mut obase = 0usize;
        let mut i = 0usize;
        while i < anum {
            obase = ocrs.len();
            let diff;
            if anum - i < 2 {
                // slide the last window back to stay in range
                i = anum - 2;
                diff = 1i32;
            } else {
                diff = 0;
            }
            let token = qgram_key([units[i], units[i + 1]]);
            if let Some(value) = self.tree.get(&token)? {
                let first = i == 0;
                for_each_posting(&value, |id, off| {
                    let off = off as i32 + diff;
                    let hash = (id % BITMAP_NUM) as u32;
                    if first || pkmap.contains(hash) {
                        ocrs.push(Occurrence {
                            id,
                            off,
                            seq,
                            hash: hash as u16,
                        });
                        if first {
                            pkmap.insert(hash);
                        }
                    }
                })?;
                if first && matches!(mode, MatchMode::Prefix | MatchMode::Full) {
                    ocrs.retain(|o| o.off == 0);
                }
            }
            seq += 1;
            if ocrs.len() <= obase {
                return Ok(Vec::new());
            }
            i += 2;
        }
        if matches!(mode, MatchMode::Suffix | MatchMode::Full) {
            obase = ocrs.len();
            let diff = (anum % 2) as i32 + 1;
            // the single-unit window keyed on the trailing character
            let token = qgram_key([units[anum - 1], 0]);
            if let Some(value) = self.tree.get(&token)? {
                for_each_posting(&value, |id, off| {
                    let off = off as i32 + diff;
                    let hash = (id % BITMAP_NUM) as u32;
                    if pkmap.contains(hash) {
                        ocrs.push(Occurrence {
                            id,
                            off,
                            seq,
                            hash: hash as u16,
                        });
                    }
                })?;
            }
            seq += 1;
            if ocrs.len() <= obase {
                return Ok(Vec::new());
            }
        }
        if seq > 1 {
            if ocrs.len() > u16::MAX as usize {
                chain_filter(&mut ocrs, obase, seq);
            }
            if ocrs.len() > u16::MAX as usize * 2 {
                counting_sort(&mut ocrs);
            } else {
                ocrs.sort_unstable_by(|a, b| a.id.cmp(&b.id).then(a.off.cmp(&b.off)));
            }
        }
        let mut idset = IdSet::new(ocrs.len() * HASH_JOIN_CO + 1);
        let mut res = Vec::new();
        let rem = (seq as i32 - 1) * 2;
        let mut ri = 0usize;
        while ri < ocrs.len() {
            let ocr = ocrs[ri];
            ri += 1;
            if ocr.seq > 0 {
                continue;
            }
            let mut max = ocr.off;
            let mut want: u16 = 1;
            for t in &ocrs[ri..] {
                if t.id != ocr.id {
                    break;
                }
                if t.seq == want && t.off == max + 2 {
                    max = t.off;
                    want += 1;
                }
            }
            if max == ocr.off + rem {
                if !idset.contains(ocr.id) {
                    res.push(ocr.id);
                    idset.mark(ocr.id);
                }
                while ri < ocrs.len() && ocrs[ri].id == ocr.id {
                    ri += 1;
                }
            }
        }
        Ok(res)
    }

    /// Single-character search: walk the cursor forward from the word,
    /// collecting postings from keys prefixed by it, capped at `fwm_max`.
    fn search_single(&self, word: &[u8], mode: MatchMode) -> Result<Vec<u64>> {
        let mut idset = IdSet::new((BITMAP_NUM / 8 + 1) as usize);
        let mut res = Vec::new();
        let pchk = matches!(mode, MatchMode::Prefix | MatchMode::Full);
        let schk = matches!(mode, MatchMode::Suffix | MatchMode::Full);
        let mut cur = self.tree.cursor();
        cur.jump(word)?;
        for _ in 0..self.fwm_max {
            let Some((key, value)) = cur.next_entry()? else {
                break;
            };
            if !key.starts_with(word) {
                break;
            }
            // suffix and full need the bare single-unit token key
            if schk && key != word {
                break;
            }
            for_each_posting(&value, |id, off| {
                if (!pchk || off == 0) && !idset.contains(id) {
                    res.push(id);
                    idset.mark(id);
                }
            })?;
        }
        res.sort_unstable();
        Ok(res)
    }

    /// Number of distinct tokens stored.
    pub fn token_count(&self) -> u64 {
        self.tree.record_count()
    }

    /// Size of the index file in bytes.
    pub fn file_size(&self) -> Result<u64> {
        self.tree.file_size()
    }

    /// Number of tokens held in the write buffer.
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

/// Parse a packed postings value, invoking `f(id, offset)` per posting.
fn for_each_posting(mut value: &[u8], mut f: impl FnMut(u64, u32)) -> Result<()> {
    while !value.is_empty() {
        let (id, step) = codec::read_u64(value)?;
        value = &value[step..];
        let (off, step) = codec::read_u32(value)?;
        value = &value[step..];
        f(id, off);
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

/// Prune first-window occurrences that cannot complete a chain: build a
/// bitmap of `(offset << 16 | id-hash)` over the last window and keep only
/// first-window entries whose projected end position is present.
fn chain_filter(ocrs: &mut Vec<Occurrence>, obase: usize, seq: u16) {
    let flnum = (ocrs.len() * 16 + 1) as u32;
    let mut flmap = RoaringBitmap::new();
    for o in &ocrs[obase..] {
        let hash = ((o.off as u32) << 16 | o.hash as u32) % flnum;
        flmap.insert(hash);
    }
    let mut filtered = Vec::with_capacity(ocrs.len());
    for o in &ocrs[..obase] {
        let rem = (seq as i32 - o.seq as i32 - 1) * 2;
        let hash = (((o.off + rem) as u32) << 16 | o.hash as u32) % flnum;
        if flmap.contains(hash) {
            filtered.push(*o);
        }
    }
    filtered.extend_from_slice(&ocrs[obase..]);
    *ocrs = filtered;
}

/// Counting sort by the 16-bit ID hash, then `(id, offset)` within each
/// bucket. Occurrences of one ID share a hash, so the result keeps equal
/// IDs contiguous while bounding the comparison sort to bucket size.
fn counting_sort(ocrs: &mut Vec<Occurrence>) {
    let mut starts = vec![0u32; 65537];
    for o in ocrs.iter() {
        starts[o.hash as usize + 1] += 1;
    }
    for i in 0..65536 {
        starts[i + 1] += starts[i];
    }
    let mut pos = starts.clone();
    let mut sorted = ocrs.clone();
    for o in ocrs.iter() {
        let p = &mut pos[o.hash as usize];
        sorted[*p as usize] = *o;
        *p += 1;
    }
    for h in 0..65536 {
        let s = starts[h] as usize;
        let e = starts[h + 1] as usize;
        if e - s > 1 {
            sorted[s..e].sort_unstable_by(|a, b| a.id.cmp(&b.id).then(a.off.cmp(&b.off)));
        }
    }
    *ocrs = sorted;
}
