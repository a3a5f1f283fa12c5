//! Ordered key-value store backing every index file
//!
//! A page-based B+Tree with variable-length byte-string keys and values.
//!
//! ## Page Layout (16KB)
//! ```text
//! [Header: 16 bytes]
//!   - is_leaf: 1 byte
//!   - num_keys: 4 bytes (u32)
//!   - next_leaf: 8 bytes (u64)
//!   - reserved: 3 bytes
//!
//! [Leaf entries: N * ([klen: u16][vlen: u32][key][value])]
//!   - Large value (overflow): vlen = 20, value = marker
//!     [0xFFFFFFFF][overflow_page_id: u64][total_size: u64]
//!
//! [Internal: N * ([klen: u16][key]) then (N+1) * child page_id: u64]
//! ```
//!
//! ## Overflow Page Chain
//! ```text
//! [next_page_id: u64][data_len: u32][data: bytes...]
//! ```
//!
//! The superblock occupies the first 256 bytes and carries a CRC32 plus a
//! 128-byte opaque region reserved for the layer above. Values larger than
//! the overflow threshold are spilled to overflow chains; with the COMPRESS
//! option they are Snappy-compressed first. Writes go through to the file
//! immediately; `memsync` persists the superblock and optionally calls
//! fsync.

use crate::config::OpenMode;
use crate::error::IoOp;
use crate::{Error, Result};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// Page size.
pub const PAGE_SIZE: usize = 16384;

/// Size of the opaque header region reserved for callers.
pub const OPAQUE_SIZE: usize = 128;

const HEADER_SIZE: usize = 16;
const SUPERBLOCK_SIZE: usize = 256;
const INVALID_PAGE_ID: u64 = u64::MAX;

/// Values larger than this are stored in overflow page chains.
const OVERFLOW_THRESHOLD: usize = 1024;
const OVERFLOW_MARKER: u32 = 0xFFFF_FFFF;
const OVERFLOW_MARKER_LEN: usize = 20;
const OVERFLOW_PAGE_HEADER: usize = 12;
const OVERFLOW_DATA_SIZE: usize = PAGE_SIZE - OVERFLOW_PAGE_HEADER;

/// Keys beyond this length are rejected outright.
pub(crate) const MAX_KEY_LEN: usize = 4096;

const TREE_MAGIC: u32 = 0x5344_4254; // "SDBT"
const TREE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct SuperBlock {
    magic: u32,
    version: u32,
    root_page_id: u64,
    next_page_id: u64,
    record_count: u64,
    compress: bool,
    opaque: Vec<u8>,
}

struct TreeState {
    root_page_id: u64,
    next_page_id: u64,
    record_count: u64,
    opaque: [u8; OPAQUE_SIZE],
}

/// Ordered KV store over a single file.
pub struct TokenTree {
    path: PathBuf,
    writer: bool,
    locked: bool,
    compress: bool,
    state: RwLock<TreeState>,
    file: Mutex<File>,
    cache: RwLock<LruCache<u64, Page>>,
}

#[derive(Clone)]
struct Page {
    page_id: u64,
    is_leaf: bool,
    keys: Vec<Vec<u8>>,
    values: Vec<Vec<u8>>,
    children: Vec<u64>,
    next_leaf: u64,
}

impl Page {
    fn new_leaf(page_id: u64) -> Self {
        Self {
            page_id,
            is_leaf: true,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            next_leaf: INVALID_PAGE_ID,
        }
    }

    fn new_internal(page_id: u64) -> Self {
        Self {
            page_id,
            is_leaf: false,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            next_leaf: INVALID_PAGE_ID,
        }
    }

    fn is_overflow_marker(value: &[u8]) -> bool {
        value.len() == OVERFLOW_MARKER_LEN && value[0..4] == OVERFLOW_MARKER.to_le_bytes()
    }

    /// Serialized byte size, counting large values as overflow markers.
    fn serialized_size(&self) -> usize {
        let mut size = HEADER_SIZE;
        if self.is_leaf {
            for (key, value) in self.keys.iter().zip(&self.values) {
                size += 2 + 4 + key.len();
                if Self::is_overflow_marker(value) || value.len() > OVERFLOW_THRESHOLD {
                    size += OVERFLOW_MARKER_LEN;
                } else {
                    size += value.len();
                }
            }
        } else {
            for key in &self.keys {
                size += 2 + key.len();
            }
            size += self.children.len() * 8;
        }
        size
    }

    /// Serialize into a page-sized buffer. Large values must already have
    /// been converted to overflow markers.
    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut off = 0;
        buf[off] = self.is_leaf as u8;
        off += 1;
        buf[off..off + 4].copy_from_slice(&(self.keys.len() as u32).to_le_bytes());
        off += 4;
        buf[off..off + 8].copy_from_slice(&self.next_leaf.to_le_bytes());
        off += 8;
        off += 3; // reserved
        if self.is_leaf {
            for (key, value) in self.keys.iter().zip(&self.values) {
                if value.len() > OVERFLOW_THRESHOLD && !Self::is_overflow_marker(value) {
                    return Err(Error::Misc(format!(
                        "page {}: unconverted large value ({} bytes)",
                        self.page_id,
                        value.len()
                    )));
                }
                let need = 2 + 4 + key.len() + value.len();
                if off + need > PAGE_SIZE {
                    return Err(Error::Misc(format!(
                        "page {} cannot fit {} keys",
                        self.page_id,
                        self.keys.len()
                    )));
                }
                buf[off..off + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
                off += 2;
                buf[off..off + 4].copy_from_slice(&(value.len() as u32).to_le_bytes());
                off += 4;
                buf[off..off + key.len()].copy_from_slice(key);
                off += key.len();
                buf[off..off + value.len()].copy_from_slice(value);
                off += value.len();
            }
        } else {
            for key in &self.keys {
                buf[off..off + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
                off += 2;
                buf[off..off + key.len()].copy_from_slice(key);
                off += key.len();
            }
            for &child in &self.children {
                if child == 0 || child == INVALID_PAGE_ID {
                    return Err(Error::Misc(format!(
                        "page {}: invalid child page id",
                        self.page_id
                    )));
                }
                buf[off..off + 8].copy_from_slice(&child.to_le_bytes());
                off += 8;
            }
        }
        Ok(buf)
    }

    fn deserialize(page_id: u64, buf: &[u8]) -> Result<Self> {
        if buf.len() < PAGE_SIZE {
            return Err(Error::RecordHeader(format!("short page {}", page_id)));
        }
        let mut off = 0;
        let is_leaf = buf[off] == 1;
        off += 1;
        let num_keys = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
        off += 4;
        let next_leaf = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        off += 8;
        off += 3;
        let mut keys = Vec::with_capacity(num_keys);
        let mut values = Vec::new();
        let mut children = Vec::new();
        if is_leaf {
            values.reserve(num_keys);
            for _ in 0..num_keys {
                if off + 6 > buf.len() {
                    return Err(Error::RecordHeader(format!("truncated leaf {}", page_id)));
                }
                let klen = u16::from_le_bytes(buf[off..off + 2].try_into().unwrap()) as usize;
                off += 2;
                let vlen = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
                off += 4;
                if off + klen + vlen > buf.len() {
                    return Err(Error::RecordHeader(format!("truncated entry in {}", page_id)));
                }
                keys.push(buf[off..off + klen].to_vec());
                off += klen;
                values.push(buf[off..off + vlen].to_vec());
                off += vlen;
            }
        } else {
            for _ in 0..num_keys {
                let klen = u16::from_le_bytes(buf[off..off + 2].try_into().unwrap()) as usize;
                off += 2;
                keys.push(buf[off..off + klen].to_vec());
                off += klen;
            }
            children.reserve(num_keys + 1);
            for _ in 0..=num_keys {
                let child = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
                if child == 0 || child == INVALID_PAGE_ID {
                    return Err(Error::RecordHeader(format!(
                        "invalid child in page {}",
                        page_id
                    )));
                }
                children.push(child);
                off += 8;
            }
        }
        Ok(Self {
            page_id,
            is_leaf,
            keys,
            values,
            children,
            next_leaf,
        })
    }
}

impl std::fmt::Debug for TokenTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenTree").finish()
    }
}

impl TokenTree {
    /// Open or create a tree file.
    ///
    /// `compress` is only honored on creation; existing files keep the
    /// option recorded in their superblock.
    pub fn open(path: &Path, mode: OpenMode, cache_pages: usize, compress: bool) -> Result<Self> {
        let writer = mode.contains(OpenMode::WRITER);
        if writer && mode.contains(OpenMode::TRUNCATE) {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::from_io(e, path, IoOp::Unlink)),
            }
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(writer)
            .create(writer && mode.contains(OpenMode::CREATE))
            .open(path)
            .map_err(|e| Error::from_io(e, path, IoOp::Open))?;
        let locked = !mode.contains(OpenMode::NO_LOCK);
        if locked {
            let nonblock = mode.contains(OpenMode::LOCK_NONBLOCK);
            let res = match (writer, nonblock) {
                (true, true) => FileExt::try_lock_exclusive(&file),
                (true, false) => FileExt::lock_exclusive(&file),
                (false, true) => FileExt::try_lock_shared(&file),
                (false, false) => FileExt::lock_shared(&file),
            };
            res.map_err(|e| Error::from_io(e, path, IoOp::Lock))?;
        }
        let len = file
            .metadata()
            .map_err(|e| Error::from_io(e, path, IoOp::Stat))?
            .len();
        let (state, compress) = if len == 0 {
            if !writer {
                return Err(Error::Metadata(format!("{}: empty tree file", path.display())));
            }
            let state = TreeState {
                root_page_id: 1,
                next_page_id: 2,
                record_count: 0,
                opaque: [0u8; OPAQUE_SIZE],
            };
            Self::write_superblock_to(&mut file, path, &state, compress)?;
            let root = Page::new_leaf(1);
            Self::write_page_to(&mut file, path, &root.serialize()?, 1)?;
            file.sync_all().map_err(|e| Error::from_io(e, path, IoOp::Write))?;
            (state, compress)
        } else {
            let sb = Self::read_superblock_from(&mut file, path)?;
            let mut opaque = [0u8; OPAQUE_SIZE];
            let n = sb.opaque.len().min(OPAQUE_SIZE);
            opaque[..n].copy_from_slice(&sb.opaque[..n]);
            (
                TreeState {
                    root_page_id: sb.root_page_id,
                    next_page_id: sb.next_page_id,
                    record_count: sb.record_count,
                    opaque,
                },
                sb.compress,
            )
        };
        let cache_pages = NonZeroUsize::new(cache_pages.max(1)).unwrap();
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            locked,
            compress,
            state: RwLock::new(state),
            file: Mutex::new(file),
            cache: RwLock::new(LruCache::new(cache_pages)),
        })
    }

    fn write_superblock_to(
        file: &mut File,
        path: &Path,
        state: &TreeState,
        compress: bool,
    ) -> Result<()> {
        let sb = SuperBlock {
            magic: TREE_MAGIC,
            version: TREE_VERSION,
            root_page_id: state.root_page_id,
            next_page_id: state.next_page_id,
            record_count: state.record_count,
            compress,
            opaque: state.opaque.to_vec(),
        };
        let body = bincode::serialize(&sb).map_err(|e| Error::Misc(e.to_string()))?;
        if body.len() + 8 > SUPERBLOCK_SIZE {
            return Err(Error::Misc("superblock overflow".into()));
        }
        let mut buf = vec![0u8; SUPERBLOCK_SIZE];
        buf[0..4].copy_from_slice(&(body.len() as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&crc32fast::hash(&body).to_le_bytes());
        buf[8..8 + body.len()].copy_from_slice(&body);
        file.seek(SeekFrom::Start(0))
            .map_err(|e| Error::from_io(e, path, IoOp::Seek))?;
        file.write_all(&buf)
            .map_err(|e| Error::from_io(e, path, IoOp::Write))?;
        Ok(())
    }

    fn read_superblock_from(file: &mut File, path: &Path) -> Result<SuperBlock> {
        let mut buf = vec![0u8; SUPERBLOCK_SIZE];
        file.seek(SeekFrom::Start(0))
            .map_err(|e| Error::from_io(e, path, IoOp::Seek))?;
        file.read_exact(&mut buf)
            .map_err(|e| Error::from_io(e, path, IoOp::Read))?;
        let body_len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        if body_len + 8 > SUPERBLOCK_SIZE {
            return Err(Error::Metadata(format!("{}: bad superblock", path.display())));
        }
        let crc = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let body = &buf[8..8 + body_len];
        if crc32fast::hash(body) != crc {
            return Err(Error::Metadata(format!(
                "{}: superblock checksum mismatch",
                path.display()
            )));
        }
        let sb: SuperBlock =
            bincode::deserialize(body).map_err(|e| Error::Metadata(e.to_string()))?;
        if sb.magic != TREE_MAGIC {
            return Err(Error::Metadata(format!("{}: bad magic", path.display())));
        }
        if sb.version != TREE_VERSION {
            return Err(Error::Metadata(format!(
                "{}: unsupported version {}",
                path.display(),
                sb.version
            )));
        }
        Ok(sb)
    }

    fn write_page_to(file: &mut File, path: &Path, buf: &[u8], page_id: u64) -> Result<()> {
        let off = SUPERBLOCK_SIZE as u64 + (page_id - 1) * PAGE_SIZE as u64;
        file.seek(SeekFrom::Start(off))
            .map_err(|e| Error::from_io(e, path, IoOp::Seek))?;
        file.write_all(buf)
            .map_err(|e| Error::from_io(e, path, IoOp::Write))?;
        Ok(())
    }

    fn sync_superblock(&self) -> Result<()> {
        let state = self.state.read();
        let mut file = self.file.lock();
        Self::write_superblock_to(&mut file, &self.path, &state, self.compress)
    }

    fn alloc_page_id(&self) -> u64 {
        let mut state = self.state.write();
        let id = state.next_page_id;
        state.next_page_id += 1;
        id
    }

    fn read_page(&self, page_id: u64) -> Result<Page> {
        if page_id == 0 || page_id == INVALID_PAGE_ID {
            return Err(Error::Misc(format!("invalid page id {}", page_id)));
        }
        if let Some(page) = self.cache.write().get(&page_id) {
            return Ok(page.clone());
        }
        let mut buf = vec![0u8; PAGE_SIZE];
        {
            let mut file = self.file.lock();
            let off = SUPERBLOCK_SIZE as u64 + (page_id - 1) * PAGE_SIZE as u64;
            file.seek(SeekFrom::Start(off))
                .map_err(|e| Error::from_io(e, &self.path, IoOp::Seek))?;
            file.read_exact(&mut buf)
                .map_err(|e| Error::from_io(e, &self.path, IoOp::Read))?;
        }
        let page = Page::deserialize(page_id, &buf)?;
        self.cache.write().put(page_id, page.clone());
        Ok(page)
    }

    /// Convert large values to overflow markers, serialize and write through.
    fn write_page(&self, page: &Page) -> Result<()> {
        let mut working = page.clone();
        if working.is_leaf {
            for value in working.values.iter_mut() {
                if value.len() > OVERFLOW_THRESHOLD && !Page::is_overflow_marker(value) {
                    let first = self.write_overflow_chain(value)?;
                    let mut marker = Vec::with_capacity(OVERFLOW_MARKER_LEN);
                    marker.extend_from_slice(&OVERFLOW_MARKER.to_le_bytes());
                    marker.extend_from_slice(&first.to_le_bytes());
                    marker.extend_from_slice(&(value.len() as u64).to_le_bytes());
                    *value = marker;
                }
            }
        }
        let buf = working.serialize()?;
        {
            let mut file = self.file.lock();
            Self::write_page_to(&mut file, &self.path, &buf, working.page_id)?;
        }
        let id = working.page_id;
        self.cache.write().put(id, working);
        Ok(())
    }

    fn write_overflow_chain(&self, data: &[u8]) -> Result<u64> {
        let chunks: Vec<&[u8]> = data.chunks(OVERFLOW_DATA_SIZE).collect();
        let first_id = {
            let mut state = self.state.write();
            let id = state.next_page_id;
            state.next_page_id += chunks.len() as u64;
            id
        };
        let mut file = self.file.lock();
        for (i, chunk) in chunks.iter().enumerate() {
            let page_id = first_id + i as u64;
            let next = if i + 1 < chunks.len() { page_id + 1 } else { 0 };
            let mut buf = vec![0u8; PAGE_SIZE];
            buf[0..8].copy_from_slice(&next.to_le_bytes());
            buf[8..12].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
            buf[12..12 + chunk.len()].copy_from_slice(chunk);
            Self::write_page_to(&mut file, &self.path, &buf, page_id)?;
        }
        Ok(first_id)
    }

    fn read_overflow_chain(&self, first_page_id: u64, total_size: u64) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity(total_size as usize);
        let mut page_id = first_page_id;
        let mut hops = 0u32;
        while page_id != 0 {
            hops += 1;
            if hops > 1_000_000 {
                return Err(Error::RecordHeader("overflow chain loop".into()));
            }
            let mut buf = vec![0u8; PAGE_SIZE];
            {
                let mut file = self.file.lock();
                let off = SUPERBLOCK_SIZE as u64 + (page_id - 1) * PAGE_SIZE as u64;
                file.seek(SeekFrom::Start(off))
                    .map_err(|e| Error::from_io(e, &self.path, IoOp::Seek))?;
                file.read_exact(&mut buf)
                    .map_err(|e| Error::from_io(e, &self.path, IoOp::Read))?;
            }
            let next = u64::from_le_bytes(buf[0..8].try_into().unwrap());
            let len = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
            if len > OVERFLOW_DATA_SIZE {
                return Err(Error::RecordHeader("corrupt overflow page".into()));
            }
            result.extend_from_slice(&buf[12..12 + len]);
            page_id = next;
        }
        Ok(result)
    }

    fn resolve_value(&self, value: &[u8]) -> Result<Vec<u8>> {
        let raw = if Page::is_overflow_marker(value) {
            let first = u64::from_le_bytes(value[4..12].try_into().unwrap());
            let total = u64::from_le_bytes(value[12..20].try_into().unwrap());
            if first == 0 {
                return Err(Error::RecordHeader("overflow marker with zero page id".into()));
            }
            self.read_overflow_chain(first, total)?
        } else {
            value.to_vec()
        };
        self.decode_value(raw)
    }

    fn encode_value(&self, value: &[u8]) -> Vec<u8> {
        if self.compress {
            snap::raw::Encoder::new()
                .compress_vec(value)
                .unwrap_or_else(|_| value.to_vec())
        } else {
            value.to_vec()
        }
    }

    fn decode_value(&self, raw: Vec<u8>) -> Result<Vec<u8>> {
        if self.compress {
            snap::raw::Decoder::new()
                .decompress_vec(&raw)
                .map_err(|e| Error::RecordHeader(format!("value decompression: {}", e)))
        } else {
            Ok(raw)
        }
    }

    fn check_writable(&self) -> Result<()> {
        if !self.writer {
            return Err(Error::Invalid("tree opened read-only".into()));
        }
        Ok(())
    }

    fn find_leaf(&self, key: &[u8]) -> Result<(Page, Vec<(u64, usize)>)> {
        let mut page_id = self.state.read().root_page_id;
        let mut path = Vec::new();
        loop {
            let page = self.read_page(page_id)?;
            if page.is_leaf {
                return Ok((page, path));
            }
            let child_idx = match page.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
                Ok(i) => i + 1,
                Err(i) => i,
            };
            if child_idx >= page.children.len() {
                return Err(Error::RecordHeader(format!(
                    "child index out of bounds in page {}",
                    page_id
                )));
            }
            path.push((page_id, child_idx));
            page_id = page.children[child_idx];
        }
    }

    /// Look up a key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (leaf, _) = self.find_leaf(key)?;
        match leaf.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
            Ok(i) => Ok(Some(self.resolve_value(&leaf.values[i])?)),
            Err(_) => Ok(None),
        }
    }

    /// Store a key-value pair, replacing any existing value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.store(key, value, StoreMode::Replace)?;
        Ok(())
    }

    /// Store only if the key is absent. Returns false when it existed.
    pub fn put_keep(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.store(key, value, StoreMode::Keep)
    }

    /// Append `value` to the existing value, creating the key if needed.
    pub fn put_cat(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.store(key, value, StoreMode::Concat)?;
        Ok(())
    }

    fn store(&self, key: &[u8], value: &[u8], mode: StoreMode) -> Result<bool> {
        self.check_writable()?;
        if key.len() > MAX_KEY_LEN {
            return Err(Error::Invalid(format!("key too long: {} bytes", key.len())));
        }
        let (mut leaf, path) = self.find_leaf(key)?;
        match leaf.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
            Ok(i) => {
                let encoded = match mode {
                    StoreMode::Keep => return Ok(false),
                    StoreMode::Replace => self.encode_value(value),
                    StoreMode::Concat => {
                        let mut existing = self.resolve_value(&leaf.values[i])?;
                        existing.extend_from_slice(value);
                        self.encode_value(&existing)
                    }
                };
                leaf.values[i] = encoded;
            }
            Err(i) => {
                leaf.keys.insert(i, key.to_vec());
                leaf.values.insert(i, self.encode_value(value));
                self.state.write().record_count += 1;
            }
        }
        if leaf.serialized_size() > PAGE_SIZE {
            let split = self.split_leaf(&mut leaf)?;
            self.write_page(&leaf)?;
            self.propagate_split(split, path)?;
        } else {
            self.write_page(&leaf)?;
        }
        Ok(true)
    }

    /// Split `page` by cumulative byte size, targeting 40% on the left.
    fn split_leaf(&self, page: &mut Page) -> Result<(Vec<u8>, u64)> {
        let target = PAGE_SIZE * 2 / 5;
        let mut left_size = HEADER_SIZE;
        let mut split_idx = 0;
        for i in 0..page.keys.len() {
            let vsize = if page.values[i].len() > OVERFLOW_THRESHOLD
                || Page::is_overflow_marker(&page.values[i])
            {
                OVERFLOW_MARKER_LEN
            } else {
                page.values[i].len()
            };
            let entry = 2 + 4 + page.keys[i].len() + vsize;
            if left_size + entry > target && split_idx > 0 {
                break;
            }
            left_size += entry;
            split_idx = i + 1;
        }
        split_idx = split_idx.clamp(1, page.keys.len() - 1);
        let new_page_id = self.alloc_page_id();
        let mut new_page = Page::new_leaf(new_page_id);
        new_page.keys = page.keys.split_off(split_idx);
        new_page.values = page.values.split_off(split_idx);
        new_page.next_leaf = page.next_leaf;
        page.next_leaf = new_page_id;
        let split_key = new_page.keys[0].clone();
        self.write_page(&new_page)?;
        Ok((split_key, new_page_id))
    }

    fn split_internal(&self, page: &mut Page) -> Result<(Vec<u8>, u64)> {
        let mid = page.keys.len() / 2;
        let new_page_id = self.alloc_page_id();
        let mut new_page = Page::new_internal(new_page_id);
        let split_key = page.keys[mid].clone();
        new_page.keys = page.keys.split_off(mid + 1);
        new_page.children = page.children.split_off(mid + 1);
        page.keys.pop();
        self.write_page(&new_page)?;
        Ok((split_key, new_page_id))
    }

    fn propagate_split(
        &self,
        mut split: (Vec<u8>, u64),
        mut path: Vec<(u64, usize)>,
    ) -> Result<()> {
        loop {
            let Some((parent_id, child_idx)) = path.pop() else {
                // root split
                let old_root = self.state.read().root_page_id;
                let new_root_id = self.alloc_page_id();
                let mut new_root = Page::new_internal(new_root_id);
                new_root.keys.push(split.0);
                new_root.children.push(old_root);
                new_root.children.push(split.1);
                self.write_page(&new_root)?;
                self.state.write().root_page_id = new_root_id;
                self.sync_superblock()?;
                return Ok(());
            };
            let mut parent = self.read_page(parent_id)?;
            parent.keys.insert(child_idx, split.0);
            parent.children.insert(child_idx + 1, split.1);
            if parent.serialized_size() > PAGE_SIZE {
                split = self.split_internal(&mut parent)?;
                self.write_page(&parent)?;
            } else {
                self.write_page(&parent)?;
                return Ok(());
            }
        }
    }

    /// Remove a key. Returns false if it was absent.
    ///
    /// Leaves are not rebalanced; `optimize` rebuilds the file compactly.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        self.check_writable()?;
        let (mut leaf, _) = self.find_leaf(key)?;
        match leaf.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
            Ok(i) => {
                leaf.keys.remove(i);
                leaf.values.remove(i);
                self.write_page(&leaf)?;
                self.state.write().record_count -= 1;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Keys starting with `prefix`, in order, capped at `max`.
    pub fn forward_match_keys(&self, prefix: &[u8], max: usize) -> Result<Vec<Vec<u8>>> {
        let mut cur = self.cursor();
        cur.jump(prefix)?;
        let mut out = Vec::new();
        while out.len() < max {
            let Some((key, _)) = cur.next_entry()? else {
                break;
            };
            if !key.starts_with(prefix) {
                break;
            }
            out.push(key);
        }
        Ok(out)
    }

    /// Forward cursor positioned before the first entry.
    pub fn cursor(&self) -> TreeCursor<'_> {
        TreeCursor {
            tree: self,
            leaf: None,
            idx: 0,
            started: false,
        }
    }

    /// Number of stored records.
    pub fn record_count(&self) -> u64 {
        self.state.read().record_count
    }

    /// Current file size in bytes.
    pub fn file_size(&self) -> Result<u64> {
        let file = self.file.lock();
        let meta = file
            .metadata()
            .map_err(|e| Error::from_io(e, &self.path, IoOp::Stat))?;
        Ok(meta.len())
    }

    /// Copy of the opaque header region.
    pub fn opaque(&self) -> [u8; OPAQUE_SIZE] {
        self.state.read().opaque
    }

    /// Overwrite the start of the opaque header region and persist it.
    pub fn write_opaque(&self, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        {
            let mut state = self.state.write();
            let n = data.len().min(OPAQUE_SIZE);
            state.opaque[..n].copy_from_slice(&data[..n]);
        }
        self.sync_superblock()
    }

    /// Persist the superblock; `level >= 2` additionally calls fsync.
    /// Page writes always go through to the file, so level 1 has nothing
    /// extra to do beyond the superblock.
    pub fn memsync(&self, level: u8) -> Result<()> {
        if self.writer {
            self.sync_superblock()?;
            if level >= 2 {
                let file = self.file.lock();
                file.sync_all()
                    .map_err(|e| Error::from_io(e, &self.path, IoOp::Write))?;
            }
        }
        Ok(())
    }

    /// Drop every cached page.
    pub fn cache_clear(&self) {
        self.cache.write().clear();
    }

    /// Rebuild the file compactly, reclaiming dead overflow pages.
    pub fn optimize(&self) -> Result<()> {
        self.check_writable()?;
        let tmp_path = self.path.with_extension("opt");
        {
            let tmp = TokenTree::open(
                &tmp_path,
                OpenMode::WRITER | OpenMode::CREATE | OpenMode::TRUNCATE | OpenMode::NO_LOCK,
                64,
                self.compress,
            )?;
            let mut cur = self.cursor();
            while let Some((key, value)) = cur.next_entry()? {
                tmp.put(&key, &value)?;
            }
            tmp.write_opaque(&self.opaque())?;
            tmp.memsync(2)?;
        }
        {
            let mut file = self.file.lock();
            std::fs::rename(&tmp_path, &self.path)
                .map_err(|e| Error::from_io(e, &self.path, IoOp::Rename))?;
            let new_file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.path)
                .map_err(|e| Error::from_io(e, &self.path, IoOp::Open))?;
            if self.locked {
                FileExt::lock_exclusive(&new_file)
                    .map_err(|e| Error::from_io(e, &self.path, IoOp::Lock))?;
            }
            *file = new_file;
        }
        self.cache.write().clear();
        let sb = {
            let mut file = self.file.lock();
            Self::read_superblock_from(&mut file, &self.path)?
        };
        let mut state = self.state.write();
        state.root_page_id = sb.root_page_id;
        state.next_page_id = sb.next_page_id;
        state.record_count = sb.record_count;
        Ok(())
    }

    /// Remove every record, resetting the file to a fresh state. The opaque
    /// region is cleared as well.
    pub fn vanish(&self) -> Result<()> {
        self.check_writable()?;
        {
            let mut state = self.state.write();
            state.root_page_id = 1;
            state.next_page_id = 2;
            state.record_count = 0;
            state.opaque = [0u8; OPAQUE_SIZE];
            let mut file = self.file.lock();
            file.set_len(0)
                .map_err(|e| Error::from_io(e, &self.path, IoOp::Trunc))?;
            Self::write_superblock_to(&mut file, &self.path, &state, self.compress)?;
            let root = Page::new_leaf(1);
            Self::write_page_to(&mut file, &self.path, &root.serialize()?, 1)?;
        }
        self.cache.write().clear();
        Ok(())
    }

    /// Copy the file to `dst` after persisting pending state.
    pub fn copy(&self, dst: &Path) -> Result<()> {
        self.memsync(1)?;
        std::fs::copy(&self.path, dst).map_err(|e| Error::from_io(e, dst, IoOp::Write))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TokenTree {
    fn drop(&mut self) {
        if self.writer {
            let _ = self.memsync(1);
        }
    }
}

#[derive(Clone, Copy)]
enum StoreMode {
    Replace,
    Keep,
    Concat,
}

/// Forward cursor over the leaf chain.
pub struct TreeCursor<'a> {
    tree: &'a TokenTree,
    leaf: Option<Page>,
    idx: usize,
    started: bool,
}

impl<'a> TreeCursor<'a> {
    /// Position before the smallest key not less than `key`.
    pub fn jump(&mut self, key: &[u8]) -> Result<()> {
        let (leaf, _) = self.tree.find_leaf(key)?;
        self.idx = match leaf.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
            Ok(i) => i,
            Err(i) => i,
        };
        self.leaf = Some(leaf);
        self.started = true;
        Ok(())
    }

    fn position_first(&mut self) -> Result<()> {
        let mut page_id = self.tree.state.read().root_page_id;
        loop {
            let page = self.tree.read_page(page_id)?;
            if page.is_leaf {
                self.leaf = Some(page);
                self.idx = 0;
                self.started = true;
                return Ok(());
            }
            page_id = page.children[0];
        }
    }

    /// Next entry in key order, or `None` at the end.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.started {
            self.position_first()?;
        }
        loop {
            let Some(leaf) = &self.leaf else {
                return Ok(None);
            };
            if self.idx < leaf.keys.len() {
                let key = leaf.keys[self.idx].clone();
                let value = self.tree.resolve_value(&leaf.values[self.idx])?;
                self.idx += 1;
                return Ok(Some((key, value)));
            }
            if leaf.next_leaf == INVALID_PAGE_ID {
                self.leaf = None;
                return Ok(None);
            }
            let next = self.tree.read_page(leaf.next_leaf)?;
            self.leaf = Some(next);
            self.idx = 0;
        }
    }

    /// Next key in key order, skipping value resolution.
    pub fn next_key(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.started {
            self.position_first()?;
        }
        loop {
            let Some(leaf) = &self.leaf else {
                return Ok(None);
            };
            if self.idx < leaf.keys.len() {
                let key = leaf.keys[self.idx].clone();
                self.idx += 1;
                return Ok(Some(key));
            }
            if leaf.next_leaf == INVALID_PAGE_ID {
                self.leaf = None;
                return Ok(None);
            }
            let next = self.tree.read_page(leaf.next_leaf)?;
            self.leaf = Some(next);
            self.idx = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_rw(path: &Path) -> TokenTree {
        TokenTree::open(
            path,
            OpenMode::WRITER | OpenMode::CREATE,
            64,
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.sdb");
        {
            let tree = open_rw(&path);
            tree.put(b"alpha", b"1").unwrap();
            tree.put(b"beta", b"2").unwrap();
            tree.memsync(2).unwrap();
        }
        let tree = TokenTree::open(&path, OpenMode::READER, 64, false).unwrap();
        assert_eq!(tree.get(b"alpha").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.get(b"beta").unwrap(), Some(b"2".to_vec()));
        assert_eq!(tree.get(b"gamma").unwrap(), None);
        assert_eq!(tree.record_count(), 2);
    }

    #[test]
    fn test_put_replaces() {
        let dir = TempDir::new().unwrap();
        let tree = open_rw(&dir.path().join("t.sdb"));
        tree.put(b"k", b"old").unwrap();
        tree.put(b"k", b"new").unwrap();
        assert_eq!(tree.get(b"k").unwrap(), Some(b"new".to_vec()));
        assert_eq!(tree.record_count(), 1);
    }

    #[test]
    fn test_put_keep() {
        let dir = TempDir::new().unwrap();
        let tree = open_rw(&dir.path().join("t.sdb"));
        assert!(tree.put_keep(b"k", b"first").unwrap());
        assert!(!tree.put_keep(b"k", b"second").unwrap());
        assert_eq!(tree.get(b"k").unwrap(), Some(b"first".to_vec()));
    }

    #[test]
    fn test_put_cat() {
        let dir = TempDir::new().unwrap();
        let tree = open_rw(&dir.path().join("t.sdb"));
        tree.put_cat(b"k", b"ab").unwrap();
        tree.put_cat(b"k", b"cd").unwrap();
        assert_eq!(tree.get(b"k").unwrap(), Some(b"abcd".to_vec()));
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let tree = open_rw(&dir.path().join("t.sdb"));
        tree.put(b"k", b"v").unwrap();
        assert!(tree.remove(b"k").unwrap());
        assert!(!tree.remove(b"k").unwrap());
        assert_eq!(tree.get(b"k").unwrap(), None);
        assert_eq!(tree.record_count(), 0);
    }

    #[test]
    fn test_many_keys_split_pages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.sdb");
        {
            let tree = open_rw(&path);
            for i in 0..5000u32 {
                let key = format!("key{:06}", i);
                let value = format!("value{}", i);
                tree.put(key.as_bytes(), value.as_bytes()).unwrap();
            }
            tree.memsync(2).unwrap();
        }
        let tree = TokenTree::open(&path, OpenMode::READER, 64, false).unwrap();
        assert_eq!(tree.record_count(), 5000);
        for i in (0..5000u32).step_by(97) {
            let key = format!("key{:06}", i);
            assert_eq!(
                tree.get(key.as_bytes()).unwrap(),
                Some(format!("value{}", i).into_bytes())
            );
        }
    }

    #[test]
    fn test_large_value_overflow() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.sdb");
        let big = vec![0x42u8; 100_000];
        {
            let tree = open_rw(&path);
            tree.put(b"big", &big).unwrap();
            tree.memsync(2).unwrap();
        }
        let tree = TokenTree::open(&path, OpenMode::READER, 64, false).unwrap();
        assert_eq!(tree.get(b"big").unwrap(), Some(big));
    }

    #[test]
    fn test_put_cat_grows_past_page() {
        let dir = TempDir::new().unwrap();
        let tree = open_rw(&dir.path().join("t.sdb"));
        let chunk = vec![7u8; 900];
        for _ in 0..50 {
            tree.put_cat(b"grow", &chunk).unwrap();
        }
        assert_eq!(tree.get(b"grow").unwrap().unwrap().len(), 900 * 50);
    }

    #[test]
    fn test_compressed_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.sdb");
        {
            let tree = TokenTree::open(
                &path,
                OpenMode::WRITER | OpenMode::CREATE,
                64,
                true,
            )
            .unwrap();
            let data = b"repetition repetition repetition".repeat(200);
            tree.put(b"k", &data).unwrap();
            tree.put_cat(b"k", b"!tail").unwrap();
            let back = tree.get(b"k").unwrap().unwrap();
            assert!(back.ends_with(b"!tail"));
            assert_eq!(back.len(), data.len() + 5);
            tree.memsync(2).unwrap();
        }
        // compression flag is read back from the superblock
        let tree = TokenTree::open(&path, OpenMode::READER, 64, false).unwrap();
        assert!(tree.get(b"k").unwrap().unwrap().ends_with(b"!tail"));
    }

    #[test]
    fn test_cursor_order() {
        let dir = TempDir::new().unwrap();
        let tree = open_rw(&dir.path().join("t.sdb"));
        for key in ["delta", "alpha", "echo", "charlie", "bravo"] {
            tree.put(key.as_bytes(), b"").unwrap();
        }
        let mut cur = tree.cursor();
        let mut keys = Vec::new();
        while let Some(k) = cur.next_key().unwrap() {
            keys.push(String::from_utf8(k).unwrap());
        }
        assert_eq!(keys, vec!["alpha", "bravo", "charlie", "delta", "echo"]);
    }

    #[test]
    fn test_cursor_jump() {
        let dir = TempDir::new().unwrap();
        let tree = open_rw(&dir.path().join("t.sdb"));
        for key in ["aa", "ab", "ba", "bb"] {
            tree.put(key.as_bytes(), b"").unwrap();
        }
        let mut cur = tree.cursor();
        cur.jump(b"ab").unwrap();
        assert_eq!(cur.next_key().unwrap(), Some(b"ab".to_vec()));
        assert_eq!(cur.next_key().unwrap(), Some(b"ba".to_vec()));

        let mut cur = tree.cursor();
        cur.jump(b"ac").unwrap();
        assert_eq!(cur.next_key().unwrap(), Some(b"ba".to_vec()));
    }

    #[test]
    fn test_forward_match_keys() {
        let dir = TempDir::new().unwrap();
        let tree = open_rw(&dir.path().join("t.sdb"));
        for key in ["app", "apple", "apply", "banana"] {
            tree.put(key.as_bytes(), b"").unwrap();
        }
        let keys = tree.forward_match_keys(b"app", 10).unwrap();
        assert_eq!(keys.len(), 3);
        let keys = tree.forward_match_keys(b"app", 2).unwrap();
        assert_eq!(keys.len(), 2);
        let keys = tree.forward_match_keys(b"zzz", 10).unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn test_opaque_region() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.sdb");
        {
            let tree = open_rw(&path);
            tree.write_opaque(&[0x49, 3, 7]).unwrap();
        }
        let tree = TokenTree::open(&path, OpenMode::READER, 64, false).unwrap();
        let opaque = tree.opaque();
        assert_eq!(&opaque[..3], &[0x49, 3, 7]);
        assert_eq!(opaque[3], 0);
    }

    #[test]
    fn test_vanish() {
        let dir = TempDir::new().unwrap();
        let tree = open_rw(&dir.path().join("t.sdb"));
        for i in 0..100u32 {
            tree.put(format!("k{}", i).as_bytes(), b"v").unwrap();
        }
        tree.vanish().unwrap();
        assert_eq!(tree.record_count(), 0);
        assert_eq!(tree.get(b"k1").unwrap(), None);
        tree.put(b"fresh", b"v").unwrap();
        assert_eq!(tree.get(b"fresh").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_optimize_preserves_content() {
        let dir = TempDir::new().unwrap();
        let tree = open_rw(&dir.path().join("t.sdb"));
        for i in 0..500u32 {
            tree.put(format!("k{:04}", i).as_bytes(), format!("v{}", i).as_bytes())
                .unwrap();
        }
        for i in (0..500u32).step_by(2) {
            tree.remove(format!("k{:04}", i).as_bytes()).unwrap();
        }
        tree.write_opaque(b"hdr").unwrap();
        tree.optimize().unwrap();
        assert_eq!(tree.record_count(), 250);
        assert_eq!(tree.get(b"k0001").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(tree.get(b"k0002").unwrap(), None);
        assert_eq!(&tree.opaque()[..3], b"hdr");
    }

    #[test]
    fn test_reader_cannot_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.sdb");
        {
            open_rw(&path);
        }
        let tree = TokenTree::open(&path, OpenMode::READER | OpenMode::NO_LOCK, 64, false).unwrap();
        assert!(tree.put(b"k", b"v").is_err());
        assert!(tree.remove(b"k").is_err());
        assert!(tree.vanish().is_err());
    }

    #[test]
    fn test_reader_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = TokenTree::open(&dir.path().join("absent.sdb"), OpenMode::READER, 64, false)
            .unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::NoFile);
    }

    #[test]
    fn test_truncate_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.sdb");
        {
            let tree = open_rw(&path);
            tree.put(b"k", b"v").unwrap();
        }
        let tree = TokenTree::open(
            &path,
            OpenMode::WRITER | OpenMode::CREATE | OpenMode::TRUNCATE,
            64,
            false,
        )
        .unwrap();
        assert_eq!(tree.get(b"k").unwrap(), None);
        assert_eq!(tree.record_count(), 0);
    }

    #[test]
    fn test_copy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.sdb");
        let dst = dir.path().join("copy.sdb");
        let tree = open_rw(&path);
        tree.put(b"k", b"v").unwrap();
        tree.copy(&dst).unwrap();
        drop(tree);
        let copied = TokenTree::open(&dst, OpenMode::READER, 64, false).unwrap();
        assert_eq!(copied.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
