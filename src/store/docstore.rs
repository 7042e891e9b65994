use std::fs::{File, OpenOptions};
use std::io::Write;
use std::num::NonZeroUsize;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::compression::fastlz;
use crate::core::error::{Error, Result};
use crate::core::types::DocNr;
use crate::storage::OpenMode;

use super::document::{DocLinks, Document, InputDocument};

const STORE_SIGNATURE: [u8; 4] = *b"m6ds";
const STORE_HEADER_SIZE: usize = 32;
const TOC_ENTRY_SIZE: usize = 12;

const FLAG_COMPRESSED: u8 = 0x01;

const FETCH_CACHE_SIZE: usize = 128;

struct StoreState {
    /// (offset, size) per doc-nr, index 0 = doc-nr 1.
    toc: Vec<(u64, u32)>,
    data_end: u64,
    raw_text_bytes: u64,
    dirty: bool,
}

/// The document store of a databank: an append-only data file of compressed
/// document blobs, a table-of-contents file mapping doc-nrs to blobs, and a
/// norms file with per-document length norms for ranked scoring.
///
/// Documents are created during batch import and never mutated; fetches go
/// through a small LRU cache.
pub struct DocStore {
    dir: PathBuf,
    data: Arc<File>,
    mode: OpenMode,
    state: Mutex<StoreState>,
    cache: Mutex<LruCache<DocNr, Arc<Document>>>,
    norms: Mutex<Vec<f32>>,
    fasta: Option<Mutex<File>>,
}

fn data_path(dir: &Path) -> PathBuf {
    dir.join("docs.dat")
}

fn toc_path(dir: &Path) -> PathBuf {
    dir.join("docs.toc")
}

fn norms_path(dir: &Path) -> PathBuf {
    dir.join("docs.norms")
}

fn fasta_path(dir: &Path) -> PathBuf {
    dir.join("fasta")
}

impl DocStore {
    pub fn create(dir: &Path, with_fasta: bool) -> Result<DocStore> {
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(data_path(dir))
            .map_err(|e| Error::io(e, "create document store"))?;

        let mut header = [0u8; STORE_HEADER_SIZE];
        header[0..4].copy_from_slice(&STORE_SIGNATURE);
        header[4..8].copy_from_slice(&(STORE_HEADER_SIZE as u32).to_le_bytes());
        data.write_all_at(&header, 0)
            .map_err(|e| Error::io(e, "write document store header"))?;

        let fasta = if with_fasta {
            let f = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(fasta_path(dir))
                .map_err(|e| Error::io(e, "create fasta dump"))?;
            Some(Mutex::new(f))
        } else {
            None
        };

        Ok(DocStore {
            dir: dir.to_path_buf(),
            data: Arc::new(data),
            mode: OpenMode::ReadWrite,
            state: Mutex::new(StoreState {
                toc: Vec::new(),
                data_end: STORE_HEADER_SIZE as u64,
                raw_text_bytes: 0,
                dirty: true,
            }),
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(FETCH_CACHE_SIZE).unwrap())),
            norms: Mutex::new(Vec::new()),
            fasta,
        })
    }

    pub fn open(dir: &Path, mode: OpenMode) -> Result<DocStore> {
        let data = OpenOptions::new()
            .read(true)
            .write(mode == OpenMode::ReadWrite)
            .open(data_path(dir))
            .map_err(|e| Error::io(e, "open document store"))?;

        let mut header = [0u8; STORE_HEADER_SIZE];
        data.read_exact_at(&mut header, 0)
            .map_err(|e| Error::io(e, "read document store header"))?;
        if header[0..4] != STORE_SIGNATURE {
            return Err(Error::corruption("bad document store signature"));
        }
        let doc_count = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
        let data_end = u64::from_le_bytes(header[12..20].try_into().unwrap());
        let raw_text_bytes = u64::from_le_bytes(header[20..28].try_into().unwrap());

        let toc_bytes = std::fs::read(toc_path(dir)).map_err(|e| Error::io(e, "read store toc"))?;
        if toc_bytes.len() < doc_count * TOC_ENTRY_SIZE {
            return Err(Error::corruption("document toc shorter than header count"));
        }
        let mut toc = Vec::with_capacity(doc_count);
        for i in 0..doc_count {
            let at = i * TOC_ENTRY_SIZE;
            let offset = u64::from_le_bytes(toc_bytes[at..at + 8].try_into().unwrap());
            let size = u32::from_le_bytes(toc_bytes[at + 8..at + 12].try_into().unwrap());
            toc.push((offset, size));
        }

        let norms = match std::fs::read(norms_path(dir)) {
            Ok(bytes) => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                .collect(),
            Err(_) => Vec::new(),
        };

        Ok(DocStore {
            dir: dir.to_path_buf(),
            data: Arc::new(data),
            mode,
            state: Mutex::new(StoreState { toc, data_end, raw_text_bytes, dirty: false }),
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(FETCH_CACHE_SIZE).unwrap())),
            norms: Mutex::new(norms),
            fasta: None,
        })
    }

    pub fn size(&self) -> u32 {
        self.state.lock().toc.len() as u32
    }

    pub fn max_doc_nr(&self) -> DocNr {
        self.state.lock().toc.len() as DocNr
    }

    pub fn raw_text_bytes(&self) -> u64 {
        self.state.lock().raw_text_bytes
    }

    pub fn data_size(&self) -> u64 {
        self.state.lock().data_end
    }

    /// Length norm of a document, 1.0 when norms have not been computed.
    pub fn norm(&self, doc_nr: DocNr) -> f32 {
        if doc_nr == 0 {
            return 1.0;
        }
        let norms = self.norms.lock();
        norms
            .get(doc_nr as usize - 1)
            .copied()
            .filter(|n| *n > 0.0)
            .unwrap_or(1.0)
    }

    /// Append a document, assigning the next doc-nr. Serialized internally;
    /// concurrent callers see strictly increasing doc-nrs.
    pub fn store(&self, doc: &InputDocument) -> Result<DocNr> {
        if self.mode != OpenMode::ReadWrite {
            return Err(Error::invariant("store on a read-only databank"));
        }

        let mut state = self.state.lock();
        let doc_nr = state.toc.len() as DocNr + 1;
        let blob = encode_blob(doc_nr, doc)?;

        let offset = state.data_end;
        self.data
            .write_all_at(&blob, offset)
            .map_err(|e| Error::io(e, format!("append document {doc_nr}")))?;
        state.toc.push((offset, blob.len() as u32));
        state.data_end = offset + blob.len() as u64;
        state.raw_text_bytes += doc.text.len() as u64;
        state.dirty = true;
        drop(state);

        if let (Some(fasta), Some(text)) = (&self.fasta, &doc.fasta) {
            let mut f = fasta.lock();
            f.write_all(text.as_bytes())
                .and_then(|_| if text.ends_with('\n') { Ok(()) } else { f.write_all(b"\n") })
                .map_err(|e| Error::io(e, "append fasta record"))?;
        }

        Ok(doc_nr)
    }

    pub fn fetch(&self, doc_nr: DocNr) -> Result<Arc<Document>> {
        if doc_nr == 0 {
            return Err(Error::invariant("doc-nr 0 is reserved"));
        }
        if let Some(doc) = self.cache.lock().get(&doc_nr) {
            return Ok(doc.clone());
        }

        let (offset, size) = {
            let state = self.state.lock();
            match state.toc.get(doc_nr as usize - 1) {
                Some(&entry) => entry,
                None => return Err(Error::not_found(format!("document {doc_nr}"))),
            }
        };

        let mut blob = vec![0u8; size as usize];
        self.data
            .read_exact_at(&mut blob, offset)
            .map_err(|e| Error::io(e, format!("read document {doc_nr}")))?;
        let doc = Arc::new(decode_blob(doc_nr, &blob)?);
        self.cache.lock().put(doc_nr, doc.clone());
        Ok(doc)
    }

    /// Iterate all documents in doc-nr order.
    pub fn iter(&self) -> DocIter<'_> {
        DocIter { store: self, next: 1 }
    }

    /// Persist the toc, per-document norms and the final header.
    pub fn finish(&self, norms: Vec<f32>) -> Result<()> {
        let state = self.state.lock();

        let mut toc_bytes = Vec::with_capacity(state.toc.len() * TOC_ENTRY_SIZE);
        for (offset, size) in &state.toc {
            toc_bytes.extend_from_slice(&offset.to_le_bytes());
            toc_bytes.extend_from_slice(&size.to_le_bytes());
        }
        std::fs::write(toc_path(&self.dir), &toc_bytes)
            .map_err(|e| Error::io(e, "write store toc"))?;

        let mut norm_bytes = Vec::with_capacity(norms.len() * 4);
        for n in &norms {
            norm_bytes.extend_from_slice(&n.to_le_bytes());
        }
        std::fs::write(norms_path(&self.dir), &norm_bytes)
            .map_err(|e| Error::io(e, "write store norms"))?;
        *self.norms.lock() = norms;

        let mut header = [0u8; STORE_HEADER_SIZE];
        header[0..4].copy_from_slice(&STORE_SIGNATURE);
        header[4..8].copy_from_slice(&(STORE_HEADER_SIZE as u32).to_le_bytes());
        header[8..12].copy_from_slice(&(state.toc.len() as u32).to_le_bytes());
        header[12..20].copy_from_slice(&state.data_end.to_le_bytes());
        header[20..28].copy_from_slice(&state.raw_text_bytes.to_le_bytes());
        self.data
            .write_all_at(&header, 0)
            .map_err(|e| Error::io(e, "write document store header"))?;
        self.data
            .sync_all()
            .map_err(|e| Error::io(e, "fsync document store"))?;

        if let Some(fasta) = &self.fasta {
            fasta
                .lock()
                .sync_all()
                .map_err(|e| Error::io(e, "fsync fasta dump"))?;
        }

        Ok(())
    }

    /// Rewrite the store compactly into `dir`, preserving doc-nrs.
    pub fn vacuum_to(&self, dir: &Path) -> Result<DocStore> {
        let fresh = DocStore::create(dir, false)?;
        for doc in self.iter() {
            let doc = doc?;
            let mut input = InputDocument::new(doc.text.clone());
            for (name, value) in &doc.attributes {
                input.set_attribute(name, value)?;
            }
            for (db, ids) in &doc.links {
                for id in ids {
                    input.add_link(db, id);
                }
            }
            fresh.store(&input)?;
        }
        let norms = self.norms.lock().clone();
        fresh.finish(norms)?;
        Ok(fresh)
    }
}

pub struct DocIter<'a> {
    store: &'a DocStore,
    next: DocNr,
}

impl Iterator for DocIter<'_> {
    type Item = Result<Arc<Document>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.store.max_doc_nr() {
            return None;
        }
        let doc = self.store.fetch(self.next);
        self.next += 1;
        Some(doc)
    }
}

/// Blob layout: fixed header, attribute TOC, links, then the text payload
/// (fastlz-compressed when that wins, raw otherwise), crc-guarded.
fn encode_blob(doc_nr: DocNr, doc: &InputDocument) -> Result<Vec<u8>> {
    if doc.attributes.len() > 255 || doc.links.len() > 255 {
        return Err(Error::invariant("more than 255 attributes or link targets"));
    }

    let text = doc.text.as_bytes();
    let (payload, flags) = match fastlz::compress(text) {
        Some(packed) if packed.len() < text.len() => (packed, FLAG_COMPRESSED),
        _ => (text.to_vec(), 0),
    };
    let crc = crc32fast::hash(&payload);

    let mut out = Vec::with_capacity(payload.len() + 64);
    out.extend_from_slice(&doc_nr.to_le_bytes());
    out.push(flags);
    out.push(doc.attributes.len() as u8);
    out.push(doc.links.len() as u8);
    out.push(0);
    out.extend_from_slice(&(text.len() as u32).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());

    for (name, value) in &doc.attributes {
        write_short(&mut out, name.as_bytes())?;
        write_short(&mut out, value.as_bytes())?;
    }
    for (db, ids) in &doc.links {
        write_short(&mut out, db.as_bytes())?;
        out.extend_from_slice(&(ids.len() as u16).to_le_bytes());
        for id in ids {
            write_short(&mut out, id.as_bytes())?;
        }
    }

    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode_blob(expect_doc_nr: DocNr, blob: &[u8]) -> Result<Document> {
    if blob.len() < 20 {
        return Err(Error::corruption("document blob too short"));
    }
    let doc_nr = u32::from_le_bytes(blob[0..4].try_into().unwrap());
    if doc_nr != expect_doc_nr {
        return Err(Error::corruption(format!(
            "document blob nr {doc_nr}, expected {expect_doc_nr}"
        )));
    }
    let flags = blob[4];
    let attr_count = blob[5] as usize;
    let link_count = blob[6] as usize;
    let text_len = u32::from_le_bytes(blob[8..12].try_into().unwrap()) as usize;
    let comp_len = u32::from_le_bytes(blob[12..16].try_into().unwrap()) as usize;
    let crc = u32::from_le_bytes(blob[16..20].try_into().unwrap());

    let mut at = 20usize;
    let mut attributes = std::collections::BTreeMap::new();
    for _ in 0..attr_count {
        let name = read_short(blob, &mut at)?;
        let value = read_short(blob, &mut at)?;
        attributes.insert(name, value);
    }

    let mut links = DocLinks::new();
    for _ in 0..link_count {
        let db = read_short(blob, &mut at)?;
        if at + 2 > blob.len() {
            return Err(Error::corruption("truncated link table"));
        }
        let id_count = u16::from_le_bytes(blob[at..at + 2].try_into().unwrap()) as usize;
        at += 2;
        let mut ids = std::collections::BTreeSet::new();
        for _ in 0..id_count {
            ids.insert(read_short(blob, &mut at)?);
        }
        links.insert(db, ids);
    }

    if at + comp_len > blob.len() {
        return Err(Error::corruption("truncated document payload"));
    }
    let payload = &blob[at..at + comp_len];
    if crc32fast::hash(payload) != crc {
        return Err(Error::corruption(format!("document {doc_nr} payload crc mismatch")));
    }

    let text_bytes = if flags & FLAG_COMPRESSED != 0 {
        fastlz::decompress(payload, text_len)
            .ok_or_else(|| Error::corruption(format!("document {doc_nr} failed to decompress")))?
    } else {
        payload.to_vec()
    };
    let text = String::from_utf8(text_bytes)
        .map_err(|_| Error::corruption(format!("document {doc_nr} text is not utf-8")))?;

    Ok(Document { doc_nr, text, attributes, links })
}

fn write_short(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    if bytes.len() > 255 {
        return Err(Error::invariant("inline string longer than 255 bytes"));
    }
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
    Ok(())
}

fn read_short(blob: &[u8], at: &mut usize) -> Result<String> {
    let len = *blob
        .get(*at)
        .ok_or_else(|| Error::corruption("truncated inline string"))? as usize;
    *at += 1;
    let end = *at + len;
    if end > blob.len() {
        return Err(Error::corruption("truncated inline string"));
    }
    let s = String::from_utf8(blob[*at..end].to_vec())
        .map_err(|_| Error::corruption("inline string is not utf-8"))?;
    *at = end;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc(i: u32) -> InputDocument {
        let mut doc = InputDocument::new(format!(
            "ID   REC_{i:05}\nDE   Sample record number {i} with shared boilerplate text.\n"
        ));
        doc.set_attribute("id", &format!("REC_{i:05}")).unwrap();
        doc.set_attribute("title", &format!("record {i}")).unwrap();
        doc.add_link("taxonomy", "9606");
        doc
    }

    #[test]
    fn store_fetch_iterate() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocStore::create(dir.path(), false).unwrap();

        for i in 1..=50u32 {
            let nr = store.store(&sample_doc(i)).unwrap();
            assert_eq!(nr, i);
        }
        assert_eq!(store.size(), 50);
        store.finish(vec![1.0; 50]).unwrap();

        let doc = store.fetch(7).unwrap();
        assert_eq!(doc.attribute("id"), Some("REC_00007"));
        assert!(doc.text.contains("number 7"));
        assert_eq!(doc.links["taxonomy"].len(), 1);

        let nrs: Vec<u32> = store.iter().map(|d| d.unwrap().doc_nr).collect();
        assert_eq!(nrs, (1..=50).collect::<Vec<_>>());

        assert!(store.fetch(0).is_err());
        assert!(store.fetch(51).is_err());
    }

    #[test]
    fn reopen_read_only() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DocStore::create(dir.path(), false).unwrap();
            for i in 1..=10u32 {
                store.store(&sample_doc(i)).unwrap();
            }
            store.finish(vec![2.0; 10]).unwrap();
        }

        let store = DocStore::open(dir.path(), OpenMode::ReadOnly).unwrap();
        assert_eq!(store.size(), 10);
        assert_eq!(store.max_doc_nr(), 10);
        assert_eq!(store.norm(3), 2.0);
        let doc = store.fetch(10).unwrap();
        assert_eq!(doc.attribute("id"), Some("REC_00010"));
        assert!(store.store(&sample_doc(11)).is_err());
    }

    #[test]
    fn concurrent_store_serializes_doc_nrs() {
        use std::sync::Arc;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocStore::create(dir.path(), false).unwrap());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let mut nrs = Vec::new();
                for i in 0..25 {
                    nrs.push(store.store(&sample_doc(i)).unwrap());
                }
                nrs
            }));
        }
        let mut all: Vec<u32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        assert_eq!(all, (1..=100).collect::<Vec<_>>());
    }
}
