use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::bitstream::{BitSource, ObitStream};
use crate::core::error::{Error, Result};

/// Production page size; tests create databanks with smaller pages to reach
/// deep trees quickly. Fixed for the lifetime of a databank.
pub const DEFAULT_PAGE_SIZE: usize = 8192;

pub const PAGE_HEADER_SIZE: usize = 8;

const FILE_SIGNATURE: [u8; 4] = *b"m6ix";
const FILE_HEADER_SIZE: u32 = 24;

const INITIAL_CACHE_SLOTS: usize = 16;
const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Empty,
    Branch,
    LeafSimple,
    LeafMulti,
    LeafMultiIdl,
    BitVector,
}

impl PageKind {
    fn tag(self) -> u8 {
        match self {
            PageKind::Empty => b'e',
            PageKind::Branch => b'b',
            PageKind::LeafSimple => b'l',
            PageKind::LeafMulti => b'm',
            PageKind::LeafMultiIdl => b'i',
            PageKind::BitVector => b'v',
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            b'e' => Ok(PageKind::Empty),
            b'b' => Ok(PageKind::Branch),
            b'l' => Ok(PageKind::LeafSimple),
            b'm' => Ok(PageKind::LeafMulti),
            b'i' => Ok(PageKind::LeafMultiIdl),
            b'v' => Ok(PageKind::BitVector),
            _ => Err(Error::corruption(format!("invalid page type byte {tag:#04x}"))),
        }
    }

    pub fn is_leaf(self) -> bool {
        matches!(
            self,
            PageKind::LeafSimple | PageKind::LeafMulti | PageKind::LeafMultiIdl
        )
    }
}

/// Header kept in page 0 of every index file, little-endian on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileHeader {
    /// Number of key entries in the tree.
    pub size: u32,
    pub depth: u32,
    pub root: u32,
    pub last_bits_page: u32,
}

/// One page worth of data. `body` is the usable area past the 8-byte page
/// header: keys packed from the start, values packed from the end (entry
/// pages), or a plain byte run (bit-vector pages).
pub struct PageBuf {
    pub kind: PageKind,
    pub flags: u8,
    pub n: u16,
    pub link: u32,
    pub body: Vec<u8>,
    /// Byte offset of each key in `body`; `key_offsets[n]` is one past the
    /// last key. Rebuilt when the page is read from disk.
    pub key_offsets: Vec<u16>,
    pub dirty: bool,
}

impl PageBuf {
    fn new(kind: PageKind, usable: usize) -> Self {
        PageBuf {
            kind,
            flags: 0,
            n: 0,
            link: 0,
            body: vec![0; usable],
            key_offsets: vec![0],
            dirty: true,
        }
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        let kind = PageKind::from_tag(data[0])?;
        let mut page = PageBuf {
            kind,
            flags: data[1],
            n: u16::from_le_bytes([data[2], data[3]]),
            link: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            body: data[PAGE_HEADER_SIZE..].to_vec(),
            key_offsets: Vec::new(),
            dirty: false,
        };
        if kind.is_leaf() || kind == PageKind::Branch {
            page.rebuild_key_offsets()?;
        }
        Ok(page)
    }

    fn to_bytes(&self, page_size: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(page_size);
        out.push(self.kind.tag());
        out.push(self.flags);
        out.extend_from_slice(&self.n.to_le_bytes());
        out.extend_from_slice(&self.link.to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn rebuild_key_offsets(&mut self) -> Result<()> {
        let mut offsets = Vec::with_capacity(self.n as usize + 1);
        let mut at = 0usize;
        offsets.push(0u16);
        for _ in 0..self.n {
            let len = *self
                .body
                .get(at)
                .ok_or_else(|| Error::corruption("key offset past page end"))?
                as usize;
            at += len + 1;
            if at > self.body.len() {
                return Err(Error::corruption("key runs past page end"));
            }
            offsets.push(at as u16);
        }
        self.key_offsets = offsets;
        Ok(())
    }

    pub fn deallocate(&mut self) {
        self.kind = PageKind::Empty;
        self.dirty = true;
    }
}

pub type PageRef = Arc<RwLock<PageBuf>>;

struct CacheSlot {
    page_nr: u32,
    page: Option<PageRef>,
    prev: usize,
    next: usize,
}

struct PagerState {
    header: FileHeader,
    header_dirty: bool,
    page_count: u32,
    slots: Vec<CacheSlot>,
    lru_head: usize,
    lru_tail: usize,
    map: HashMap<u32, usize>,
}

/// A fixed-page file with a reference-counted page cache. A leased page
/// (any outstanding [`PageRef`] clone) is never evicted; eviction scans the
/// LRU tail and the cache doubles when every slot is leased.
pub struct Pager {
    file: Arc<File>,
    path: PathBuf,
    page_size: usize,
    mode: OpenMode,
    state: Mutex<PagerState>,
}

impl Pager {
    pub fn create(path: &Path, page_size: usize) -> Result<Pager> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::io(e, format!("create {}", path.display())))?;

        let pager = Pager {
            file: Arc::new(file),
            path: path.to_path_buf(),
            page_size,
            mode: OpenMode::ReadWrite,
            state: Mutex::new(PagerState {
                header: FileHeader::default(),
                header_dirty: true,
                page_count: 1,
                slots: new_slots(INITIAL_CACHE_SLOTS),
                lru_head: 0,
                lru_tail: INITIAL_CACHE_SLOTS - 1,
                map: HashMap::new(),
            }),
        };
        pager.write_header(&pager.state.lock().header)?;
        Ok(pager)
    }

    pub fn open(path: &Path, page_size: usize, mode: OpenMode) -> Result<Pager> {
        let file = OpenOptions::new()
            .read(true)
            .write(mode == OpenMode::ReadWrite)
            .open(path)
            .map_err(|e| Error::io(e, format!("open {}", path.display())))?;

        let len = file
            .metadata()
            .map_err(|e| Error::io(e, format!("stat {}", path.display())))?
            .len();
        if len < page_size as u64 {
            return Err(Error::corruption(format!(
                "{} is shorter than one page",
                path.display()
            )));
        }

        let mut head = vec![0u8; FILE_HEADER_SIZE as usize];
        file.read_exact_at(&mut head, 0)
            .map_err(|e| Error::io(e, format!("read header of {}", path.display())))?;
        if head[0..4] != FILE_SIGNATURE {
            return Err(Error::corruption(format!(
                "bad signature in {}",
                path.display()
            )));
        }
        let header_size = u32::from_le_bytes(head[4..8].try_into().unwrap());
        if header_size != FILE_HEADER_SIZE {
            return Err(Error::corruption(format!(
                "unexpected header size {header_size} in {}",
                path.display()
            )));
        }
        let header = FileHeader {
            size: u32::from_le_bytes(head[8..12].try_into().unwrap()),
            depth: u32::from_le_bytes(head[12..16].try_into().unwrap()),
            root: u32::from_le_bytes(head[16..20].try_into().unwrap()),
            last_bits_page: u32::from_le_bytes(head[20..24].try_into().unwrap()),
        };

        Ok(Pager {
            file: Arc::new(file),
            path: path.to_path_buf(),
            page_size,
            mode,
            state: Mutex::new(PagerState {
                header,
                header_dirty: false,
                page_count: (len / page_size as u64) as u32,
                slots: new_slots(INITIAL_CACHE_SLOTS),
                lru_head: 0,
                lru_tail: INITIAL_CACHE_SLOTS - 1,
                map: HashMap::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn usable_size(&self) -> usize {
        self.page_size - PAGE_HEADER_SIZE
    }

    pub fn file_size(&self) -> u64 {
        self.state.lock().page_count as u64 * self.page_size as u64
    }

    pub fn header(&self) -> FileHeader {
        self.state.lock().header
    }

    pub fn update_header(&self, f: impl FnOnce(&mut FileHeader)) {
        let mut state = self.state.lock();
        f(&mut state.header);
        state.header_dirty = true;
    }

    fn write_header(&self, header: &FileHeader) -> Result<()> {
        let mut page = vec![0u8; self.page_size];
        page[0..4].copy_from_slice(&FILE_SIGNATURE);
        page[4..8].copy_from_slice(&FILE_HEADER_SIZE.to_le_bytes());
        page[8..12].copy_from_slice(&header.size.to_le_bytes());
        page[12..16].copy_from_slice(&header.depth.to_le_bytes());
        page[16..20].copy_from_slice(&header.root.to_le_bytes());
        page[20..24].copy_from_slice(&header.last_bits_page.to_le_bytes());
        self.file
            .write_all_at(&page, 0)
            .map_err(|e| Error::io(e, format!("write header of {}", self.path.display())))
    }

    /// Allocate a fresh page at the end of the file.
    pub fn allocate(&self, kind: PageKind) -> Result<(u32, PageRef)> {
        debug_assert!(self.mode == OpenMode::ReadWrite);
        let mut state = self.state.lock();
        let page_nr = state.page_count;
        state.page_count += 1;

        let page = Arc::new(RwLock::new(PageBuf::new(kind, self.usable_size())));
        self.install(&mut state, page_nr, page.clone())?;
        Ok((page_nr, page))
    }

    /// Load a page, returning a leased handle. The page stays cached while
    /// any clone of the handle is alive.
    pub fn load(&self, page_nr: u32) -> Result<PageRef> {
        if page_nr == 0 {
            return Err(Error::invariant("page 0 is the file header"));
        }

        let mut state = self.state.lock();
        if let Some(&slot) = state.map.get(&page_nr) {
            let page = state.slots[slot].page.clone().ok_or_else(|| {
                Error::new(crate::core::error::ErrorKind::Internal, "empty cache slot")
            })?;
            self.touch(&mut state, slot);
            return Ok(page);
        }

        if page_nr >= state.page_count {
            return Err(Error::corruption(format!(
                "page {page_nr} past end of {}",
                self.path.display()
            )));
        }

        let mut data = vec![0u8; self.page_size];
        self.file
            .read_exact_at(&mut data, page_nr as u64 * self.page_size as u64)
            .map_err(|e| Error::io(e, format!("read page {page_nr} of {}", self.path.display())))?;
        let buf = PageBuf::from_bytes(&data)?;
        if buf.kind == PageKind::Empty {
            return Err(Error::corruption(format!("load of deallocated page {page_nr}")));
        }

        let page = Arc::new(RwLock::new(buf));
        self.install(&mut state, page_nr, page.clone())?;
        Ok(page)
    }

    /// Put a page into a cache slot, evicting or growing as needed.
    fn install(&self, state: &mut PagerState, page_nr: u32, page: PageRef) -> Result<()> {
        let slot = self.reclaim_slot(state)?;
        if let Some(old) = state.slots[slot].page.take() {
            let old_nr = state.slots[slot].page_nr;
            state.map.remove(&old_nr);
            let buf = old.read();
            if buf.dirty {
                self.flush_page(old_nr, &buf)?;
                drop(buf);
                old.write().dirty = false;
            }
        }
        state.slots[slot].page_nr = page_nr;
        state.slots[slot].page = Some(page);
        state.map.insert(page_nr, slot);
        self.touch(state, slot);
        Ok(())
    }

    /// Find a reusable slot, scanning from the LRU tail and skipping leased
    /// pages; doubles the cache when everything is leased.
    fn reclaim_slot(&self, state: &mut PagerState) -> Result<usize> {
        let mut at = state.lru_tail;
        while at != NIL {
            let leased = state.slots[at]
                .page
                .as_ref()
                .map(|p| Arc::strong_count(p) > 1)
                .unwrap_or(false);
            if !leased {
                return Ok(at);
            }
            at = state.slots[at].prev;
        }

        // every slot leased: double the cache
        let old_len = state.slots.len();
        for i in 0..old_len {
            state.slots.push(CacheSlot {
                page_nr: 0,
                page: None,
                prev: if i == 0 { state.lru_tail } else { old_len + i - 1 },
                next: if i + 1 < old_len { old_len + i + 1 } else { NIL },
            });
        }
        state.slots[state.lru_tail].next = old_len;
        state.lru_tail = state.slots.len() - 1;
        Ok(state.lru_tail)
    }

    /// Move a slot to the LRU head.
    fn touch(&self, state: &mut PagerState, slot: usize) {
        if state.lru_head == slot {
            return;
        }
        let (prev, next) = (state.slots[slot].prev, state.slots[slot].next);
        if prev != NIL {
            state.slots[prev].next = next;
        }
        if next != NIL {
            state.slots[next].prev = prev;
        }
        if state.lru_tail == slot {
            state.lru_tail = prev;
        }
        state.slots[slot].prev = NIL;
        state.slots[slot].next = state.lru_head;
        if state.lru_head != NIL {
            state.slots[state.lru_head].prev = slot;
        }
        state.lru_head = slot;
    }

    fn flush_page(&self, page_nr: u32, buf: &PageBuf) -> Result<()> {
        let bytes = buf.to_bytes(self.page_size);
        self.file
            .write_all_at(&bytes, page_nr as u64 * self.page_size as u64)
            .map_err(|e| {
                Error::io(e, format!("write page {page_nr} of {}", self.path.display()))
            })
    }

    /// Write every dirty cached page and the header.
    pub fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        for i in 0..state.slots.len() {
            let Some(page) = state.slots[i].page.clone() else { continue };
            let page_nr = state.slots[i].page_nr;
            let mut buf = page.write();
            if buf.dirty {
                self.flush_page(page_nr, &buf)?;
                buf.dirty = false;
            }
        }
        if state.header_dirty {
            self.write_header(&state.header)?;
            state.header_dirty = false;
        }
        Ok(())
    }

    /// Drop dirty pages without writing them.
    pub fn rollback(&self) {
        let mut state = self.state.lock();
        for i in 0..state.slots.len() {
            let dirty = state.slots[i]
                .page
                .as_ref()
                .map(|p| p.read().dirty)
                .unwrap_or(false);
            if dirty {
                let page_nr = state.slots[i].page_nr;
                state.slots[i].page = None;
                state.map.remove(&page_nr);
            }
        }
        state.header_dirty = false;
    }

    pub fn sync(&self) -> Result<()> {
        self.commit()?;
        self.file
            .sync_all()
            .map_err(|e| Error::io(e, format!("fsync {}", self.path.display())))
    }

    /// Store a synced posting-list stream: inline into the returned 20-byte
    /// envelope when it fits in 19 bytes, otherwise appended to the
    /// bit-vector page chain with a (page, offset) pointer in the envelope.
    pub fn store_bits(&self, bits: &ObitStream) -> Result<[u8; 20]> {
        let data = bits.bytes()?;
        let mut out = [0u8; 20];

        if data.len() < 20 {
            out[0] = 0x80;
            out[1..1 + data.len()].copy_from_slice(&data);
            return Ok(out);
        }

        let last = self.header().last_bits_page;
        let (page_nr, mut page) = if last == 0 {
            let (nr, page) = self.allocate(PageKind::BitVector)?;
            self.update_header(|h| h.last_bits_page = nr);
            (nr, page)
        } else {
            (last, self.load(last)?)
        };

        {
            let buf = page.read();
            out[1..5].copy_from_slice(&page_nr.to_be_bytes());
            let offset = buf.n as u32;
            out[5] = 0;
            out[6..10].copy_from_slice(&offset.to_be_bytes());
        }

        let usable = self.usable_size();
        let mut remaining: &[u8] = &data;
        loop {
            let mut buf = page.write();
            let free = usable - buf.n as usize;
            let n = free.min(remaining.len());
            let at = buf.n as usize;
            buf.body[at..at + n].copy_from_slice(&remaining[..n]);
            buf.n += n as u16;
            buf.dirty = true;
            remaining = &remaining[n..];
            if remaining.is_empty() {
                break;
            }
            drop(buf);

            let (next_nr, next_page) = self.allocate(PageKind::BitVector)?;
            self.update_header(|h| h.last_bits_page = next_nr);
            page.write().link = next_nr;
            page = next_page;
        }

        Ok(out)
    }
}

fn new_slots(count: usize) -> Vec<CacheSlot> {
    (0..count)
        .map(|i| CacheSlot {
            page_nr: 0,
            page: None,
            prev: if i == 0 { NIL } else { i - 1 },
            next: if i + 1 < count { i + 1 } else { NIL },
        })
        .collect()
}

/// Reads a posting-list stream back out of the 20-byte envelope: either the
/// 19 inline bytes or the chained bit-vector pages.
pub struct PostingsSource {
    pager: Option<Arc<Pager>>,
    inline: [u8; 19],
    inline_pos: usize,
    inline_len: usize,
    page: Option<PageRef>,
    page_pos: usize,
    next_page: u32,
}

impl PostingsSource {
    pub fn from_envelope(pager: &Arc<Pager>, envelope: &[u8; 20]) -> Result<PostingsSource> {
        if envelope[0] & 0x80 != 0 {
            let mut inline = [0u8; 19];
            inline.copy_from_slice(&envelope[1..20]);
            Ok(PostingsSource {
                pager: None,
                inline,
                inline_pos: 0,
                inline_len: 19,
                page: None,
                page_pos: 0,
                next_page: 0,
            })
        } else {
            let page_nr = u32::from_be_bytes(envelope[1..5].try_into().unwrap());
            let offset = u32::from_be_bytes(envelope[6..10].try_into().unwrap()) as usize;
            Ok(PostingsSource {
                pager: Some(pager.clone()),
                inline: [0; 19],
                inline_pos: 0,
                inline_len: 0,
                page: None,
                page_pos: offset,
                next_page: page_nr,
            })
        }
    }
}

impl BitSource for PostingsSource {
    fn next_byte(&mut self) -> Result<u8> {
        let Some(pager) = &self.pager else {
            if self.inline_pos < self.inline_len {
                let b = self.inline[self.inline_pos];
                self.inline_pos += 1;
                return Ok(b);
            }
            return Ok(0);
        };

        loop {
            if let Some(page) = &self.page {
                let buf = page.read();
                if self.page_pos < buf.body.len() {
                    let b = buf.body[self.page_pos];
                    self.page_pos += 1;
                    return Ok(b);
                }
                self.next_page = buf.link;
                drop(buf);
                self.page = None;
                self.page_pos = 0;
            }

            if self.next_page == 0 {
                return Ok(0);
            }
            let page = pager.load(self.next_page)?;
            if page.read().kind != PageKind::BitVector {
                return Err(Error::corruption("posting chain leads to a non-bit-vector page"));
            }
            self.page = Some(page);
            self.next_page = 0;
        }
    }

    fn clone_source(&self) -> Box<dyn BitSource> {
        Box::new(PostingsSource {
            pager: self.pager.clone(),
            inline: self.inline,
            inline_pos: self.inline_pos,
            inline_len: self.inline_len,
            page: self.page.clone(),
            page_pos: self.page_pos,
            next_page: self.next_page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::IbitStream;

    fn temp_pager(page_size: usize) -> (tempfile::TempDir, Arc<Pager>) {
        let dir = tempfile::tempdir().unwrap();
        let pager = Pager::create(&dir.path().join("t.ix"), page_size).unwrap();
        (dir, Arc::new(pager))
    }

    #[test]
    fn allocate_load_round_trip() {
        let (_dir, pager) = temp_pager(256);
        let (nr, page) = pager.allocate(PageKind::LeafSimple).unwrap();
        {
            let mut buf = page.write();
            buf.body[0] = 3;
            buf.body[1..4].copy_from_slice(b"abc");
            buf.n = 1;
            buf.link = 7;
            buf.dirty = true;
        }
        drop(page);
        pager.commit().unwrap();

        let reopened = Pager::open(pager.path(), 256, OpenMode::ReadOnly).unwrap();
        let page = reopened.load(nr).unwrap();
        let buf = page.read();
        assert_eq!(buf.kind, PageKind::LeafSimple);
        assert_eq!(buf.n, 1);
        assert_eq!(buf.link, 7);
        assert_eq!(&buf.body[1..4], b"abc");
        assert_eq!(buf.key_offsets, vec![0, 4]);
    }

    #[test]
    fn cache_grows_when_all_pages_leased() {
        let (_dir, pager) = temp_pager(256);
        let mut leases = Vec::new();
        for _ in 0..INITIAL_CACHE_SLOTS + 5 {
            leases.push(pager.allocate(PageKind::LeafSimple).unwrap());
        }
        // all leased pages must still be reachable
        for (nr, page) in &leases {
            let again = pager.load(*nr).unwrap();
            assert!(Arc::ptr_eq(page, &again));
        }
    }

    #[test]
    fn rollback_discards_dirty_pages() {
        let (_dir, pager) = temp_pager(256);
        let (nr, page) = pager.allocate(PageKind::LeafMulti).unwrap();
        drop(page);
        pager.rollback();
        assert!(pager.load(nr).is_err());
    }

    #[test]
    fn store_bits_inline_and_chained() {
        let (_dir, pager) = temp_pager(256);

        // small stream goes inline
        let mut bits = ObitStream::new();
        crate::compression::write_array(&mut bits, &[1, 5, 9]).unwrap();
        bits.sync().unwrap();
        let envelope = pager.store_bits(&bits).unwrap();
        assert!(envelope[0] & 0x80 != 0);

        let source = PostingsSource::from_envelope(&pager, &envelope).unwrap();
        let mut ib = IbitStream::from_source(Box::new(source)).unwrap();
        assert_eq!(crate::compression::read_array(&mut ib).unwrap(), vec![1, 5, 9]);

        // large stream spills to the chain, spanning several 256-byte pages
        let values: Vec<u32> = (1..2000).map(|i| i * 7).collect();
        let mut bits = ObitStream::new();
        crate::compression::write_array(&mut bits, &values).unwrap();
        bits.sync().unwrap();
        let envelope = pager.store_bits(&bits).unwrap();
        assert_eq!(envelope[0] & 0x80, 0);

        let source = PostingsSource::from_envelope(&pager, &envelope).unwrap();
        let mut ib = IbitStream::from_source(Box::new(source)).unwrap();
        assert_eq!(crate::compression::read_array(&mut ib).unwrap(), values);

        // chains survive a commit + reopen
        pager.commit().unwrap();
        let reopened = Arc::new(Pager::open(pager.path(), 256, OpenMode::ReadOnly).unwrap());
        let source = PostingsSource::from_envelope(&reopened, &envelope).unwrap();
        let mut ib = IbitStream::from_source(Box::new(source)).unwrap();
        assert_eq!(crate::compression::read_array(&mut ib).unwrap(), values);
    }
}
