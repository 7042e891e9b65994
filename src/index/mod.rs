//! The B+ tree index family: one tree shape, several leaf flavours.

mod glob;
mod page;
mod tree;
mod value;

pub use glob::glob_match;
pub use tree::{BTree, BulkAppend, TreeCursor};
pub use value::{IndexValue, MultiData, MultiIdlData, PostingsEnvelope};

use std::cmp::Ordering;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::bitstream::{IbitStream, ObitStream};
use crate::compression::{
    compress_array, read_simple_array_into_bitmap, write_array, write_weighted_list,
    CompressedArrayIterator, WeightedArrayIterator,
};
use crate::core::error::{Error, Result};
use crate::core::types::{DocNr, IndexKind};
use crate::storage::{OpenMode, Pager, PostingsSource};

/// Key comparison flavour of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrder {
    Lexical,
    Numeric,
    Float,
}

impl KeyOrder {
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            KeyOrder::Lexical => a.cmp(b),
            KeyOrder::Numeric => compare_numeric(a, b),
            KeyOrder::Float => compare_float(a, b),
        }
    }

    pub fn for_kind(kind: IndexKind) -> KeyOrder {
        match kind {
            IndexKind::Number => KeyOrder::Numeric,
            IndexKind::Float => KeyOrder::Float,
            _ => KeyOrder::Lexical,
        }
    }
}

/// Integer text comparison: sign first, then magnitude. Falls back to plain
/// byte order for keys that are not integers.
fn compare_numeric(a: &[u8], b: &[u8]) -> Ordering {
    fn parse(s: &[u8]) -> Option<(bool, &[u8])> {
        let (neg, digits) = match s.split_first() {
            Some((b'-', rest)) => (true, rest),
            Some((b'+', rest)) => (false, rest),
            _ => (false, s),
        };
        if digits.is_empty() || !digits.iter().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let mut trimmed = digits;
        while trimmed.len() > 1 && trimmed[0] == b'0' {
            trimmed = &trimmed[1..];
        }
        Some((neg, trimmed))
    }

    match (parse(a), parse(b)) {
        (Some((na, da)), Some((nb, db))) => match (na, nb) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (false, false) => da.len().cmp(&db.len()).then_with(|| da.cmp(db)),
            (true, true) => db.len().cmp(&da.len()).then_with(|| db.cmp(da)),
        },
        _ => a.cmp(b),
    }
}

fn compare_float(a: &[u8], b: &[u8]) -> Ordering {
    let fa = std::str::from_utf8(a).ok().and_then(|s| s.parse::<f64>().ok());
    let fb = std::str::from_utf8(b).ok().and_then(|s| s.parse::<f64>().ok());
    match (fa, fb) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or_else(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

/// Payload found under one key, across every index flavour.
#[derive(Debug, Clone)]
pub enum KeyData {
    Unique(DocNr),
    Multi { count: u32, bits: PostingsEnvelope },
    MultiIdl { count: u32, bits: PostingsEnvelope, idl_offset: i64 },
}

impl KeyData {
    pub fn count(&self) -> u32 {
        match self {
            KeyData::Unique(_) => 1,
            KeyData::Multi { count, .. } => *count,
            KeyData::MultiIdl { count, .. } => *count,
        }
    }
}

enum TreeVariant {
    Simple(BTree<u32>),
    Multi(BTree<MultiData>),
    MultiIdl(BTree<MultiIdlData>),
}

/// One on-disk index: a paged file holding a B+ tree whose leaf flavour,
/// comparator and posting encoding follow the declared index kind.
pub struct IndexFile {
    name: String,
    kind: IndexKind,
    pager: Arc<Pager>,
    variant: TreeVariant,
}

impl IndexFile {
    pub fn create(name: &str, path: &Path, kind: IndexKind, page_size: usize) -> Result<IndexFile> {
        let pager = Arc::new(Pager::create(path, page_size)?);
        Ok(IndexFile { name: name.to_string(), kind, variant: make_variant(&pager, kind), pager })
    }

    pub fn open(
        name: &str,
        path: &Path,
        kind: IndexKind,
        page_size: usize,
        mode: OpenMode,
    ) -> Result<IndexFile> {
        let pager = Arc::new(Pager::open(path, page_size, mode)?);
        Ok(IndexFile { name: name.to_string(), kind, variant: make_variant(&pager, kind), pager })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    pub fn order(&self) -> KeyOrder {
        KeyOrder::for_kind(self.kind)
    }

    pub fn key_count(&self) -> u32 {
        self.pager.header().size
    }

    pub fn file_size(&self) -> u64 {
        self.pager.file_size()
    }

    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    pub fn commit(&self) -> Result<()> {
        self.pager.commit()
    }

    pub fn find_key(&self, key: &[u8]) -> Result<Option<KeyData>> {
        Ok(match &self.variant {
            TreeVariant::Simple(tree) => tree.find(key)?.map(KeyData::Unique),
            TreeVariant::Multi(tree) => tree
                .find(key)?
                .map(|d| KeyData::Multi { count: d.count, bits: d.bits }),
            TreeVariant::MultiIdl(tree) => tree.find(key)?.map(|d| KeyData::MultiIdl {
                count: d.count,
                bits: d.bits,
                idl_offset: d.idl_offset,
            }),
        })
    }

    /// All payloads with `lo <= key <= hi`, in key order.
    pub fn range_data(&self, lo: &[u8], hi: &[u8]) -> Result<Vec<KeyData>> {
        let order = self.order();
        let mut out = Vec::new();
        self.scan_from(lo, |key, data| {
            if order.compare(key, hi) == Ordering::Greater {
                return false;
            }
            out.push(data);
            true
        })?;
        Ok(out)
    }

    /// All payloads starting from `lo` while `keep` returns true.
    fn scan_from(
        &self,
        lo: &[u8],
        mut keep: impl FnMut(&[u8], KeyData) -> bool,
    ) -> Result<()> {
        match &self.variant {
            TreeVariant::Simple(tree) => {
                let mut cursor = tree.cursor_at(lo)?;
                while let Some((key, doc)) = cursor.next()? {
                    if !keep(&key, KeyData::Unique(doc)) {
                        break;
                    }
                }
            }
            TreeVariant::Multi(tree) => {
                let mut cursor = tree.cursor_at(lo)?;
                while let Some((key, d)) = cursor.next()? {
                    if !keep(&key, KeyData::Multi { count: d.count, bits: d.bits }) {
                        break;
                    }
                }
            }
            TreeVariant::MultiIdl(tree) => {
                let mut cursor = tree.cursor_at(lo)?;
                while let Some((key, d)) = cursor.next()? {
                    let data = KeyData::MultiIdl {
                        count: d.count,
                        bits: d.bits,
                        idl_offset: d.idl_offset,
                    };
                    if !keep(&key, data) {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Payloads of every key at or after `lo` (used by comparison queries).
    pub fn scan_ge(&self, lo: &[u8], include_lo: bool) -> Result<Vec<KeyData>> {
        let order = self.order();
        let mut out = Vec::new();
        self.scan_from(lo, |key, data| {
            if !include_lo && order.compare(key, lo) == Ordering::Equal {
                return true;
            }
            out.push(data);
            true
        })?;
        Ok(out)
    }

    /// Payloads of every key before `hi` (used by comparison queries).
    pub fn scan_lt(&self, hi: &[u8], include_hi: bool) -> Result<Vec<KeyData>> {
        let order = self.order();
        let mut out = Vec::new();
        self.scan_from(&[], |key, data| {
            match order.compare(key, hi) {
                Ordering::Less => {
                    out.push(data);
                    true
                }
                Ordering::Equal => {
                    if include_hi {
                        out.push(data);
                    }
                    false
                }
                Ordering::Greater => false,
            }
        })?;
        Ok(out)
    }

    /// Payloads of every key matching a `?`/`*` glob.
    pub fn pattern_data(&self, pattern: &[u8]) -> Result<Vec<KeyData>> {
        let mut out = Vec::new();
        self.scan_from(&[], |key, data| {
            if glob_match(pattern, key) {
                out.push(data);
            }
            true
        })?;
        Ok(out)
    }

    /// Keys in `[first, last]`, for browsing and suggestions.
    pub fn list_keys(&self, first: Option<&[u8]>, last: Option<&[u8]>) -> Result<Vec<Vec<u8>>> {
        let order = self.order();
        let mut out = Vec::new();
        self.scan_from(first.unwrap_or(&[]), |key, _| {
            if let Some(hi) = last {
                if order.compare(key, hi) == Ordering::Greater {
                    return false;
                }
            }
            out.push(key.to_vec());
            true
        })?;
        Ok(out)
    }

    /// Cursor over a posting-list payload.
    pub fn postings_iter(&self, data: &KeyData) -> Result<CompressedArrayIterator> {
        match data {
            KeyData::Unique(_) => Err(Error::invariant("unique index has no posting list")),
            KeyData::Multi { count, bits } | KeyData::MultiIdl { count, bits, .. } => {
                let source = PostingsSource::from_envelope(&self.pager, &bits.0)?;
                let stream = IbitStream::from_source(Box::new(source))?;
                Ok(CompressedArrayIterator::new(stream, *count))
            }
        }
    }

    /// Decode a posting-list payload straight into a bitmap; returns the
    /// number of newly set bits.
    pub fn postings_into_bitmap(
        &self,
        data: &KeyData,
        bitmap: &mut roaring::RoaringBitmap,
        max_value: DocNr,
    ) -> Result<u32> {
        match data {
            KeyData::Unique(doc) => Ok(u32::from(bitmap.insert(*doc))),
            KeyData::Multi { count, bits } | KeyData::MultiIdl { count, bits, .. } => {
                let source = PostingsSource::from_envelope(&self.pager, &bits.0)?;
                let mut stream = IbitStream::from_source(Box::new(source))?;
                read_simple_array_into_bitmap(&mut stream, *count, bitmap, max_value)
            }
        }
    }

    /// Cursor over a weighted posting-list payload.
    pub fn weighted_iter(&self, data: &KeyData) -> Result<WeightedArrayIterator> {
        match data {
            KeyData::Multi { count, bits } => {
                let source = PostingsSource::from_envelope(&self.pager, &bits.0)?;
                let stream = IbitStream::from_source(Box::new(source))?;
                Ok(WeightedArrayIterator::new(stream, *count))
            }
            _ => Err(Error::invariant("not a weighted index payload")),
        }
    }

    /// Incremental unique insert (doc-nr payload).
    pub fn insert_unique(&self, key: &[u8], doc: DocNr) -> Result<()> {
        if doc == 0 {
            return Err(Error::invariant("doc-nr 0 is reserved"));
        }
        match &self.variant {
            TreeVariant::Simple(tree) => {
                tree.insert(key, &doc)?;
                Ok(())
            }
            _ => Err(Error::invariant("not a unique index")),
        }
    }

    pub fn erase(&self, key: &[u8]) -> Result<bool> {
        match &self.variant {
            TreeVariant::Simple(tree) => tree.erase(key),
            TreeVariant::Multi(tree) => tree.erase(key),
            TreeVariant::MultiIdl(tree) => tree.erase(key),
        }
    }

    /// Sorted bulk loader used at batch finalization.
    pub fn bulk_writer(&self) -> Result<BulkWriter<'_>> {
        Ok(match &self.variant {
            TreeVariant::Simple(tree) => BulkWriter::Simple(tree.bulk_append()?),
            TreeVariant::Multi(tree) => {
                BulkWriter::Multi { bulk: tree.bulk_append()?, pager: &self.pager, weighted: self.kind == IndexKind::Weighted }
            }
            TreeVariant::MultiIdl(tree) => {
                BulkWriter::MultiIdl { bulk: tree.bulk_append()?, pager: &self.pager }
            }
        })
    }

    pub fn validate(&self) -> Result<()> {
        match &self.variant {
            TreeVariant::Simple(tree) => tree.validate(),
            TreeVariant::Multi(tree) => tree.validate(),
            TreeVariant::MultiIdl(tree) => tree.validate(),
        }
    }

    pub fn dump(&self, out: &mut dyn std::io::Write) -> Result<()> {
        match &self.variant {
            TreeVariant::Simple(tree) => tree.dump(out),
            TreeVariant::Multi(tree) => tree.dump(out),
            TreeVariant::MultiIdl(tree) => tree.dump(out),
        }
    }

    /// Rewrite into a fresh file at `path`, repacking leaves and posting
    /// chains. Phrase-capable indexes also rewrite their position arrays
    /// through `idl`.
    pub fn vacuum_to(
        &self,
        path: &Path,
        idl: Option<(&Arc<File>, &mut IdlWriter)>,
    ) -> Result<IndexFile> {
        let fresh = IndexFile::create(&self.name, path, self.kind, self.pager.page_size())?;
        let mut writer = fresh.bulk_writer()?;

        match &self.variant {
            TreeVariant::Simple(tree) => {
                let mut cursor = tree.cursor()?;
                while let Some((key, doc)) = cursor.next()? {
                    writer.push_unique(&key, doc)?;
                }
            }
            TreeVariant::Multi(tree) => {
                let mut cursor = tree.cursor()?;
                while let Some((key, d)) = cursor.next()? {
                    let data = KeyData::Multi { count: d.count, bits: d.bits };
                    if self.kind == IndexKind::Weighted {
                        let mut iter = self.weighted_iter(&data)?;
                        let mut docs = Vec::with_capacity(d.count as usize);
                        while let Some(pair) = iter.next()? {
                            docs.push(pair);
                        }
                        writer.push_weighted(&key, &docs)?;
                    } else {
                        let mut iter = self.postings_iter(&data)?;
                        let mut docs = Vec::with_capacity(d.count as usize);
                        while let Some(doc) = iter.next()? {
                            docs.push(doc);
                        }
                        writer.push_postings(&key, &docs)?;
                    }
                }
            }
            TreeVariant::MultiIdl(tree) => {
                let (old_idl, new_idl) = match idl {
                    Some(pair) => pair,
                    None => return Err(Error::invariant("phrase index vacuum needs its idl file")),
                };
                let mut cursor = tree.cursor()?;
                while let Some((key, d)) = cursor.next()? {
                    let data =
                        KeyData::MultiIdl { count: d.count, bits: d.bits, idl_offset: d.idl_offset };
                    let mut iter = self.postings_iter(&data)?;
                    let mut docs = Vec::with_capacity(d.count as usize);
                    while let Some(doc) = iter.next()? {
                        docs.push(doc);
                    }

                    // re-copy this key's position arrays into the new file
                    let mut old_bits = IbitStream::from_file(old_idl.clone(), d.idl_offset as u64)?;
                    let offset = new_idl.offset();
                    for _ in 0..docs.len() {
                        let positions = crate::compression::read_array(&mut old_bits)?;
                        new_idl.append_positions(&positions)?;
                    }
                    new_idl.finish_key()?;

                    writer.push_postings_idl(&key, &docs, offset)?;
                }
            }
        }

        writer.finish()?;
        fresh.pager.sync()?;
        Ok(fresh)
    }
}

fn make_variant(pager: &Arc<Pager>, kind: IndexKind) -> TreeVariant {
    let order = KeyOrder::for_kind(kind);
    match kind {
        IndexKind::Unique => TreeVariant::Simple(BTree::new(pager.clone(), order)),
        IndexKind::MultiIdl => TreeVariant::MultiIdl(BTree::new(pager.clone(), order)),
        _ => TreeVariant::Multi(BTree::new(pager.clone(), order)),
    }
}

/// Typed face over the bulk loaders; compresses posting lists on the way in.
pub enum BulkWriter<'a> {
    Simple(BulkAppend<'a, u32>),
    Multi { bulk: BulkAppend<'a, MultiData>, pager: &'a Arc<Pager>, weighted: bool },
    MultiIdl { bulk: BulkAppend<'a, MultiIdlData>, pager: &'a Arc<Pager> },
}

impl BulkWriter<'_> {
    pub fn push_unique(&mut self, key: &[u8], doc: DocNr) -> Result<()> {
        if doc == 0 {
            return Err(Error::invariant("doc-nr 0 is reserved"));
        }
        match self {
            BulkWriter::Simple(bulk) => bulk.push(key, &doc),
            _ => Err(Error::invariant("not a unique index")),
        }
    }

    pub fn push_postings(&mut self, key: &[u8], docs: &[DocNr]) -> Result<()> {
        match self {
            BulkWriter::Multi { bulk, pager, weighted: false } => {
                let mut bits = ObitStream::new();
                compress_array(&mut bits, docs)?;
                bits.sync()?;
                let envelope = pager.store_bits(&bits)?;
                bulk.push(
                    key,
                    &MultiData { count: docs.len() as u32, bits: PostingsEnvelope(envelope) },
                )
            }
            _ => Err(Error::invariant("not a plain multi index")),
        }
    }

    pub fn push_weighted(&mut self, key: &[u8], docs: &[(DocNr, u8)]) -> Result<()> {
        match self {
            BulkWriter::Multi { bulk, pager, weighted: true } => {
                let mut bits = ObitStream::new();
                write_weighted_list(&mut bits, docs)?;
                bits.sync()?;
                let envelope = pager.store_bits(&bits)?;
                bulk.push(
                    key,
                    &MultiData { count: docs.len() as u32, bits: PostingsEnvelope(envelope) },
                )
            }
            _ => Err(Error::invariant("not a weighted index")),
        }
    }

    pub fn push_postings_idl(&mut self, key: &[u8], docs: &[DocNr], idl_offset: i64) -> Result<()> {
        match self {
            BulkWriter::MultiIdl { bulk, pager } => {
                let mut bits = ObitStream::new();
                compress_array(&mut bits, docs)?;
                bits.sync()?;
                let envelope = pager.store_bits(&bits)?;
                bulk.push(
                    key,
                    &MultiIdlData {
                        count: docs.len() as u32,
                        bits: PostingsEnvelope(envelope),
                        idl_offset,
                    },
                )
            }
            _ => Err(Error::invariant("not a phrase-capable index")),
        }
    }

    pub fn finish(self) -> Result<()> {
        match self {
            BulkWriter::Simple(bulk) => bulk.finish(),
            BulkWriter::Multi { bulk, .. } => bulk.finish(),
            BulkWriter::MultiIdl { bulk, .. } => bulk.finish(),
        }
    }
}

/// Appends per-document position arrays to a `.idl` companion file. Each
/// key's arrays form one byte-aligned region; the region offset goes into
/// the leaf payload.
pub struct IdlWriter {
    bits: ObitStream,
    file: Arc<File>,
    offset: i64,
}

impl IdlWriter {
    pub fn create(path: &Path) -> Result<IdlWriter> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::io(e, format!("create {}", path.display())))?;
        let clone = file
            .try_clone()
            .map_err(|e| Error::io(e, "clone idl handle"))?;
        Ok(IdlWriter { bits: ObitStream::to_file(file), file: Arc::new(clone), offset: 0 })
    }

    /// Byte offset the next key's region will start at.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn append_positions(&mut self, positions: &[u32]) -> Result<()> {
        write_array(&mut self.bits, positions)
    }

    /// Close the current key's region at a byte boundary.
    pub fn finish_key(&mut self) -> Result<()> {
        self.bits.sync()?;
        self.offset = self.bits.byte_size() as i64;
        Ok(())
    }

    pub fn finish(mut self) -> Result<Arc<File>> {
        self.bits.sync()?;
        Ok(self.file)
    }
}
