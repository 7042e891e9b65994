//! The databank: a directory of paged index files plus the document store,
//! with batch import on the way in and find/fetch/link on the way out.

mod links;

pub use links::LinkTable;

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::tokenize_words;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{CompareOp, DocNr, IndexKind, TokenId, MAX_WEIGHT};
use crate::index::{IdlWriter, IndexFile, KeyData};
use crate::lexicon::{Lexicon, StagingLexicon};
use crate::query::{build, parse_query, ParsedQuery, FULL_TEXT};
use crate::search::{
    intersect_with, BitmapIterator, BoxedDocIterator, IntersectionIterator, MultiDocIterator,
    NoDocIterator, PhraseIterator, RankAccumulator, SingleDocIterator, TopDocs, UnionIterator,
    VectorIterator,
};
use crate::storage::{OpenMode, DEFAULT_PAGE_SIZE};
use crate::store::{DocStore, Document, InputDocument};

const META_FILE: &str = "header.meta";
const META_SIGNATURE: &str = "m6ix";
const SCHEMA_VERSION: u32 = 1;

const WEIGHT_INDEX: &str = "full-text-weight";
const LINKS_INDEX: &str = "links";
const ID_INDEX: &str = "id";

/// Past this many keys, a multi-key union decodes into a bitmap instead of
/// a heap of iterators.
const BITMAP_UNION_THRESHOLD: usize = 8;

/// A declared index of a databank schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDecl {
    pub name: String,
    pub kind: IndexKind,
}

/// Everything needed to create a new databank.
#[derive(Debug, Clone)]
pub struct Schema {
    pub name: String,
    pub indexes: Vec<IndexDecl>,
    pub stop_words: Vec<String>,
    pub with_fasta: bool,
    pub page_size: usize,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Schema {
        Schema {
            name: name.into(),
            indexes: Vec::new(),
            stop_words: Vec::new(),
            with_fasta: false,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn index(mut self, name: &str, kind: IndexKind) -> Schema {
        self.indexes.push(IndexDecl { name: name.to_string(), kind });
        self
    }

    pub fn stop_words(mut self, words: &[&str]) -> Schema {
        self.stop_words = words.iter().map(|w| w.to_string()).collect();
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Schema {
        self.page_size = page_size;
        self
    }

    pub fn with_fasta(mut self) -> Schema {
        self.with_fasta = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogEntry {
    name: String,
    kind: IndexKind,
    file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeaderMeta {
    signature: String,
    name: String,
    uuid: Uuid,
    schema_version: u32,
    page_size: usize,
    built: Option<DateTime<Utc>>,
    last_stop_word: TokenId,
    stop_words: Vec<String>,
    doc_count: u32,
    raw_text_bytes: u64,
    with_fasta: bool,
    indexes: Vec<CatalogEntry>,
}

/// Info block for the admin surface.
#[derive(Debug, Clone)]
pub struct DatabankInfo {
    pub name: String,
    pub uuid: Uuid,
    pub doc_count: u32,
    pub raw_text_bytes: u64,
    pub store_size: u64,
    pub total_size: u64,
    pub built: Option<DateTime<Utc>>,
    pub indexes: Vec<IndexInfo>,
}

#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub name: String,
    pub kind: IndexKind,
    pub key_count: u32,
    pub file_size: u64,
}

// ----------------------------------------------------------------
// batch-import accumulators

struct TermDoc {
    tf: u32,
    positions: Vec<u32>,
}

#[derive(Default)]
struct TermAcc {
    docs: BTreeMap<DocNr, TermDoc>,
}

enum NamedAcc {
    Unique(BTreeMap<Vec<u8>, DocNr>),
    Multi(BTreeMap<Vec<u8>, std::collections::BTreeSet<DocNr>>),
}

struct BatchState {
    lexicon: Arc<Lexicon>,
    last_stop_word: TokenId,
    full_text: Mutex<BTreeMap<TokenId, TermAcc>>,
    named: Mutex<HashMap<String, NamedAcc>>,
    norms: Mutex<Vec<f32>>,
}

/// A databank is either importing (exclusive writer, accumulators live) or
/// steady (read-only queries). One writer lifecycle at a time.
pub struct Databank {
    dir: PathBuf,
    mode: OpenMode,
    meta: Mutex<HeaderMeta>,
    store: DocStore,
    index_cache: Mutex<HashMap<String, Arc<IndexFile>>>,
    idl_file: Mutex<Option<Arc<File>>>,
    batch: Mutex<Option<Arc<BatchState>>>,
    link_table: Mutex<Option<Arc<LinkTable>>>,
}

impl Databank {
    /// Create a fresh databank directory with its built-in and declared
    /// indexes.
    pub fn create(path: &Path, schema: Schema) -> Result<Databank> {
        for decl in &schema.indexes {
            if matches!(decl.kind, IndexKind::Weighted | IndexKind::MultiIdl) {
                return Err(Error::invariant(
                    "weighted and phrase index kinds are built in, not declarable",
                ));
            }
            if decl.name == FULL_TEXT || decl.name == WEIGHT_INDEX || decl.name == LINKS_INDEX {
                return Err(Error::invariant(format!("index name {} is reserved", decl.name)));
            }
        }

        std::fs::create_dir_all(path)
            .map_err(|e| Error::io(e, format!("create {}", path.display())))?;

        let mut catalog = vec![
            CatalogEntry {
                name: FULL_TEXT.to_string(),
                kind: IndexKind::MultiIdl,
                file: format!("{FULL_TEXT}.ix"),
            },
            CatalogEntry {
                name: WEIGHT_INDEX.to_string(),
                kind: IndexKind::Weighted,
                file: format!("{WEIGHT_INDEX}.ix"),
            },
            CatalogEntry {
                name: LINKS_INDEX.to_string(),
                kind: IndexKind::Multi,
                file: format!("{LINKS_INDEX}.ix"),
            },
        ];
        for decl in &schema.indexes {
            catalog.push(CatalogEntry {
                name: decl.name.clone(),
                kind: decl.kind,
                file: format!("{}.ix", decl.name),
            });
        }

        let mut index_cache = HashMap::new();
        for entry in &catalog {
            let index = IndexFile::create(
                &entry.name,
                &path.join(&entry.file),
                entry.kind,
                schema.page_size,
            )?;
            index_cache.insert(entry.name.clone(), Arc::new(index));
        }

        let store = DocStore::create(path, schema.with_fasta)?;

        let meta = HeaderMeta {
            signature: META_SIGNATURE.to_string(),
            name: schema.name,
            uuid: Uuid::new_v4(),
            schema_version: SCHEMA_VERSION,
            page_size: schema.page_size,
            built: None,
            last_stop_word: 0,
            stop_words: schema.stop_words,
            doc_count: 0,
            raw_text_bytes: 0,
            with_fasta: schema.with_fasta,
            indexes: catalog,
        };
        write_meta(path, &meta)?;

        Ok(Databank {
            dir: path.to_path_buf(),
            mode: OpenMode::ReadWrite,
            meta: Mutex::new(meta),
            store,
            index_cache: Mutex::new(index_cache),
            idl_file: Mutex::new(None),
            batch: Mutex::new(None),
            link_table: Mutex::new(None),
        })
    }

    /// Open an existing databank; indexes load lazily on first use.
    pub fn open(path: &Path, mode: OpenMode) -> Result<Databank> {
        let meta = read_meta(path)?;
        let store = DocStore::open(path, mode)?;
        Ok(Databank {
            dir: path.to_path_buf(),
            mode,
            meta: Mutex::new(meta),
            store,
            index_cache: Mutex::new(HashMap::new()),
            idl_file: Mutex::new(None),
            batch: Mutex::new(None),
            link_table: Mutex::new(None),
        })
    }

    pub fn name(&self) -> String {
        self.meta.lock().name.clone()
    }

    pub fn uuid(&self) -> Uuid {
        self.meta.lock().uuid
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn size(&self) -> u32 {
        self.store.size()
    }

    pub fn max_doc_nr(&self) -> DocNr {
        self.store.max_doc_nr()
    }

    pub(crate) fn attach_link_table(&self, table: Arc<LinkTable>) {
        *self.link_table.lock() = Some(table);
    }

    fn index(&self, name: &str) -> Result<Arc<IndexFile>> {
        let name = if name == "*" { FULL_TEXT } else { name };
        if let Some(index) = self.index_cache.lock().get(name) {
            return Ok(index.clone());
        }

        let entry = {
            let meta = self.meta.lock();
            meta.indexes
                .iter()
                .find(|e| e.name == name)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("index {name}")))?
        };
        let page_size = self.meta.lock().page_size;
        let index = Arc::new(IndexFile::open(
            &entry.name,
            &self.dir.join(&entry.file),
            entry.kind,
            page_size,
            self.mode,
        )?);
        self.index_cache.lock().insert(entry.name.clone(), index.clone());
        Ok(index)
    }

    fn idl_handle(&self) -> Result<Arc<File>> {
        let mut guard = self.idl_file.lock();
        if let Some(file) = &*guard {
            return Ok(file.clone());
        }
        let path = self.dir.join(format!("{FULL_TEXT}.idl"));
        let file = File::open(&path)
            .map_err(|e| Error::io(e, format!("open {}", path.display())))?;
        let file = Arc::new(file);
        *guard = Some(file.clone());
        Ok(file)
    }

    // ----------------------------------------------------------------
    // batch import

    /// Enter batch-import state. The shared lexicon is seeded with the
    /// schema's stop words so their ids sit at or below the ceiling.
    pub fn start_batch_import(&self, lexicon: Arc<Lexicon>) -> Result<()> {
        if self.mode != OpenMode::ReadWrite {
            return Err(Error::invariant("batch import on a read-only databank"));
        }
        let mut batch = self.batch.lock();
        if batch.is_some() {
            return Err(Error::invariant("batch import already running"));
        }

        let mut last_stop_word = 0;
        {
            let meta = self.meta.lock();
            if !meta.stop_words.is_empty() && !lexicon.is_empty() {
                return Err(Error::invariant(
                    "stop words require a fresh shared lexicon",
                ));
            }
            for word in &meta.stop_words {
                last_stop_word = lexicon.store(word.to_ascii_lowercase().as_bytes());
            }
        }
        self.meta.lock().last_stop_word = last_stop_word;

        *batch = Some(Arc::new(BatchState {
            lexicon,
            last_stop_word,
            full_text: Mutex::new(BTreeMap::new()),
            named: Mutex::new(HashMap::new()),
            norms: Mutex::new(Vec::new()),
        }));
        info!("batch import started in {}", self.dir.display());
        Ok(())
    }

    fn batch(&self) -> Result<Arc<BatchState>> {
        self.batch
            .lock()
            .clone()
            .ok_or_else(|| Error::invariant("no batch import running"))
    }

    pub fn shared_lexicon(&self) -> Result<Arc<Lexicon>> {
        Ok(self.batch()?.lexicon.clone())
    }

    pub fn last_stop_word(&self) -> Result<TokenId> {
        Ok(self.batch()?.last_stop_word)
    }

    /// Store one document whose token streams have already been remapped to
    /// the shared lexicon. Thread-safe; doc-nr assignment is serialized.
    pub fn store(&self, doc: &InputDocument) -> Result<DocNr> {
        let batch = self.batch()?;
        let doc_nr = self.store.store(doc)?;

        // full-text postings and positions
        {
            let mut full_text = batch.full_text.lock();
            for (i, &token) in doc.full_text_tokens.iter().enumerate() {
                if token == 0 {
                    continue;
                }
                let term = full_text.entry(token).or_default();
                let entry = term
                    .docs
                    .entry(doc_nr)
                    .or_insert_with(|| TermDoc { tf: 0, positions: Vec::new() });
                entry.tf += 1;
                entry.positions.push(i as u32 + 1);
            }
        }

        // named token streams
        if !doc.index_tokens.is_empty() {
            let mut named = batch.named.lock();
            for field in &doc.index_tokens {
                let kind = self.catalog_kind(&field.index)?;
                if kind != IndexKind::Multi {
                    return Err(Error::invariant(format!(
                        "token stream for non-multi index {}",
                        field.index
                    )));
                }
                let acc = named
                    .entry(field.index.clone())
                    .or_insert_with(|| NamedAcc::Multi(BTreeMap::new()));
                let NamedAcc::Multi(map) = acc else {
                    return Err(Error::invariant(format!("index {} kind mismatch", field.index)));
                };
                for &token in &field.tokens {
                    if token == 0 {
                        continue;
                    }
                    if let Some(word) = batch.lexicon.get_string(token) {
                        map.entry(word).or_default().insert(doc_nr);
                    }
                }
            }
        }

        // literal key values
        if !doc.index_values.is_empty() {
            let mut named = batch.named.lock();
            for entry in &doc.index_values {
                let kind = self.catalog_kind(&entry.index)?;
                if kind != entry.kind {
                    return Err(Error::invariant(format!(
                        "index {} declared {kind:?}, got {:?}",
                        entry.index, entry.kind
                    )));
                }
                match kind {
                    IndexKind::Unique => {
                        let acc = named
                            .entry(entry.index.clone())
                            .or_insert_with(|| NamedAcc::Unique(BTreeMap::new()));
                        let NamedAcc::Unique(map) = acc else {
                            return Err(Error::invariant(format!(
                                "index {} kind mismatch",
                                entry.index
                            )));
                        };
                        if let Some(old) = map.insert(entry.value.clone().into_bytes(), doc_nr) {
                            warn!(
                                "duplicate key {} in unique index {}, doc {} replaces {}",
                                entry.value, entry.index, doc_nr, old
                            );
                        }
                    }
                    _ => {
                        let acc = named
                            .entry(entry.index.clone())
                            .or_insert_with(|| NamedAcc::Multi(BTreeMap::new()));
                        let NamedAcc::Multi(map) = acc else {
                            return Err(Error::invariant(format!(
                                "index {} kind mismatch",
                                entry.index
                            )));
                        };
                        map.entry(entry.value.clone().into_bytes())
                            .or_default()
                            .insert(doc_nr);
                    }
                }
            }
        }

        // links out, keyed "databank/id"
        if !doc.links.is_empty() {
            let mut named = batch.named.lock();
            let acc = named
                .entry(LINKS_INDEX.to_string())
                .or_insert_with(|| NamedAcc::Multi(BTreeMap::new()));
            if let NamedAcc::Multi(map) = acc {
                for (db, ids) in &doc.links {
                    for id in ids {
                        let key = format!("{}/{}", db, id.to_ascii_lowercase());
                        map.entry(key.into_bytes()).or_default().insert(doc_nr);
                    }
                }
            }
        }

        Ok(doc_nr)
    }

    /// Tokenize, remap and store a batch of documents built against one
    /// worker's staging lexicon.
    pub fn store_batch(
        &self,
        docs: &mut [InputDocument],
        staging: &mut StagingLexicon,
    ) -> Result<Vec<DocNr>> {
        let batch = self.batch()?;
        for doc in docs.iter_mut() {
            doc.tokenize(staging);
        }
        let remap = staging.flush_into_shared(&batch.lexicon);
        let mut doc_nrs = Vec::with_capacity(docs.len());
        for doc in docs.iter_mut() {
            doc.remap_tokens(&remap, batch.last_stop_word);
            doc_nrs.push(self.store(doc)?);
        }
        Ok(doc_nrs)
    }

    fn catalog_kind(&self, index: &str) -> Result<IndexKind> {
        let meta = self.meta.lock();
        meta.indexes
            .iter()
            .find(|e| e.name == index)
            .map(|e| e.kind)
            .ok_or_else(|| Error::not_found(format!("index {index}")))
    }

    /// Flush every accumulator into its B+ tree: the full-text and weight
    /// indexes sequentially (they share one walk and feed the norms), the
    /// declared indexes in parallel.
    pub fn end_batch_import(&self) -> Result<()> {
        let batch = self.batch()?;
        let max_doc = self.store.max_doc_nr();

        // full-text terms, sorted by their interned string
        let full_text = std::mem::take(&mut *batch.full_text.lock());
        let mut terms: Vec<(Vec<u8>, TermAcc)> = full_text
            .into_iter()
            .filter_map(|(token, acc)| batch.lexicon.get_string(token).map(|w| (w, acc)))
            .collect();
        terms.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let ft_index = self.index(FULL_TEXT)?;
        let wt_index = self.index(WEIGHT_INDEX)?;
        let mut idl = IdlWriter::create(&self.dir.join(format!("{FULL_TEXT}.idl")))?;
        let mut ft_writer = ft_index.bulk_writer()?;
        let mut wt_writer = wt_index.bulk_writer()?;
        let mut norms_sq = vec![0.0f32; max_doc as usize];

        for (key, acc) in &terms {
            let offset = idl.offset();
            let mut docs = Vec::with_capacity(acc.docs.len());
            let mut weighted = Vec::with_capacity(acc.docs.len());
            for (&doc, entry) in &acc.docs {
                idl.append_positions(&entry.positions)?;
                docs.push(doc);
                let weight = entry.tf.min(u32::from(MAX_WEIGHT)) as u8;
                weighted.push((doc, weight));
                norms_sq[doc as usize - 1] += (weight as f32) * (weight as f32);
            }
            idl.finish_key()?;
            ft_writer.push_postings_idl(key, &docs, offset)?;
            wt_writer.push_weighted(key, &weighted)?;
        }
        ft_writer.finish()?;
        wt_writer.finish()?;
        let idl_file = idl.finish()?;
        *self.idl_file.lock() = Some(idl_file);

        *batch.norms.lock() = norms_sq.into_iter().map(f32::sqrt).collect();

        // declared indexes and the link index, one job each
        let named = std::mem::take(&mut *batch.named.lock());
        let jobs: Vec<(Arc<IndexFile>, NamedAcc)> = named
            .into_iter()
            .map(|(name, acc)| Ok((self.index(&name)?, acc)))
            .collect::<Result<_>>()?;
        jobs.into_par_iter()
            .map(|(index, acc)| write_named_index(&index, acc))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "batch flush of {} finished: {} docs, {} terms",
            self.dir.display(),
            max_doc,
            terms.len()
        );
        Ok(())
    }

    /// Write the document norms and the final header; the databank is
    /// steady afterwards.
    pub fn finish_batch_import(&self) -> Result<()> {
        let batch = self.batch()?;
        let norms = std::mem::take(&mut *batch.norms.lock());
        self.store.finish(norms)?;

        {
            let mut meta = self.meta.lock();
            meta.built = Some(Utc::now());
            meta.doc_count = self.store.size();
            meta.raw_text_bytes = self.store.raw_text_bytes();
            write_meta(&self.dir, &meta)?;
        }

        *self.batch.lock() = None;
        info!("databank {} finalized", self.dir.display());
        Ok(())
    }

    // ----------------------------------------------------------------
    // queries

    /// Fold a case-insensitive key the way the tokenizer folds words.
    fn fold_key(&self, index_kind: IndexKind, value: &str) -> Vec<u8> {
        match index_kind {
            IndexKind::Number | IndexKind::Float => value.as_bytes().to_vec(),
            _ => value.to_ascii_lowercase().into_bytes(),
        }
    }

    pub(crate) fn term_iterator(
        &self,
        index: &str,
        term: &str,
    ) -> Result<Option<BoxedDocIterator>> {
        let index = self.index(index)?;
        let key = self.fold_key(index.kind(), term);
        let Some(data) = index.find_key(&key)? else {
            return Ok(None);
        };
        self.keydata_iterator(&index, data)
    }

    fn keydata_iterator(
        &self,
        index: &Arc<IndexFile>,
        data: KeyData,
    ) -> Result<Option<BoxedDocIterator>> {
        Ok(Some(match data {
            KeyData::Unique(doc) => Box::new(SingleDocIterator::new(doc)),
            data if index.kind() == IndexKind::Weighted => {
                // weighted lists come back in weight order; re-sort by doc
                let mut iter = index.weighted_iter(&data)?;
                let mut docs = Vec::new();
                while let Some((doc, _)) = iter.next()? {
                    docs.push(doc);
                }
                docs.sort_unstable();
                Box::new(VectorIterator::from_docs(docs))
            }
            data => {
                let iter = index.postings_iter(&data)?;
                Box::new(MultiDocIterator::from_iter(iter))
            }
        }))
    }

    /// Union over many key payloads: a bitmap decode once the key set is
    /// large, a heap union otherwise.
    fn multi_key_iterator(
        &self,
        index: &Arc<IndexFile>,
        data: Vec<KeyData>,
    ) -> Result<Option<BoxedDocIterator>> {
        if data.is_empty() {
            return Ok(None);
        }
        if data.len() == 1 {
            return self.keydata_iterator(index, data.into_iter().next().unwrap());
        }

        if data.iter().all(|d| matches!(d, KeyData::Unique(_))) {
            let mut docs: Vec<DocNr> = data
                .iter()
                .map(|d| match d {
                    KeyData::Unique(doc) => *doc,
                    _ => unreachable!(),
                })
                .collect();
            docs.sort_unstable();
            docs.dedup();
            return Ok(Some(Box::new(VectorIterator::from_docs(docs))));
        }

        if data.len() > BITMAP_UNION_THRESHOLD {
            let max = self.max_doc_nr();
            let mut bitmap = roaring::RoaringBitmap::new();
            for d in &data {
                if index.kind() == IndexKind::Weighted {
                    let mut iter = index.weighted_iter(d)?;
                    while let Some((doc, _)) = iter.next()? {
                        bitmap.insert(doc);
                    }
                } else {
                    index.postings_into_bitmap(d, &mut bitmap, max)?;
                }
            }
            return Ok(Some(Box::new(BitmapIterator::new(bitmap))));
        }

        let mut union = UnionIterator::new();
        for d in data {
            if let Some(iter) = self.keydata_iterator(index, d)? {
                union.add(iter)?;
            }
        }
        Ok(Some(Box::new(union)))
    }

    pub(crate) fn compare_iterator(
        &self,
        index_name: &str,
        op: CompareOp,
        value: &str,
    ) -> Result<Option<BoxedDocIterator>> {
        if op == CompareOp::Equals {
            return self.term_iterator(index_name, value);
        }
        let index = self.index(index_name)?;
        let key = self.fold_key(index.kind(), value);
        let data = match op {
            CompareOp::LessThan => index.scan_lt(&key, false)?,
            CompareOp::LessOrEqual => index.scan_lt(&key, true)?,
            CompareOp::GreaterOrEqual => index.scan_ge(&key, true)?,
            CompareOp::GreaterThan => index.scan_ge(&key, false)?,
            CompareOp::Equals => unreachable!(),
        };
        self.multi_key_iterator(&index, data)
    }

    pub(crate) fn range_iterator(
        &self,
        index_name: &str,
        lo: &str,
        hi: &str,
    ) -> Result<Option<BoxedDocIterator>> {
        let index = self.index(index_name)?;
        let lo = self.fold_key(index.kind(), lo);
        let hi = self.fold_key(index.kind(), hi);
        let data = index.range_data(&lo, &hi)?;
        self.multi_key_iterator(&index, data)
    }

    pub(crate) fn pattern_iterator(
        &self,
        index_name: &str,
        pattern: &str,
    ) -> Result<Option<BoxedDocIterator>> {
        let index = self.index(index_name)?;
        let pattern = self.fold_key(index.kind(), pattern);
        let data = index.pattern_data(&pattern)?;
        self.multi_key_iterator(&index, data)
    }

    pub(crate) fn phrase_iterator(
        &self,
        index_name: &str,
        terms: &[String],
    ) -> Result<Option<BoxedDocIterator>> {
        if terms.is_empty() {
            return Ok(None);
        }
        if terms.len() == 1 {
            return self.term_iterator(index_name, &terms[0]);
        }

        let index = self.index(index_name)?;
        if index.kind() != IndexKind::MultiIdl {
            // no positions on this index: approximate with a conjunction
            let mut isect = IntersectionIterator::new();
            for term in terms {
                match self.term_iterator(index_name, term)? {
                    Some(iter) => isect.add(iter),
                    None => return Ok(None),
                }
            }
            return Ok(Some(Box::new(isect)));
        }

        let mut parts: Vec<(BoxedDocIterator, i64, u32)> = Vec::with_capacity(terms.len());
        for (i, term) in terms.iter().enumerate() {
            let key = self.fold_key(index.kind(), term);
            let Some(KeyData::MultiIdl { count, bits, idl_offset }) = index.find_key(&key)? else {
                return Ok(None);
            };
            let data = KeyData::MultiIdl { count, bits, idl_offset };
            let iter = index.postings_iter(&data)?;
            parts.push((Box::new(MultiDocIterator::from_iter(iter)), idl_offset, i as u32));
        }

        let idl_file = self.idl_handle()?;
        Ok(Some(Box::new(PhraseIterator::new(&idl_file, parts)?)))
    }

    pub(crate) fn linked_iterator(
        &self,
        other_db: &str,
        id: &str,
    ) -> Result<Option<BoxedDocIterator>> {
        let folded = id.to_ascii_lowercase();

        // documents here that link out to other_db/id
        let links_out = self.term_iterator(LINKS_INDEX, &format!("{other_db}/{folded}"))?;

        // documents here that the other databank's record links back to
        let mut links_in: Option<BoxedDocIterator> = None;
        let table = self.link_table.lock().clone();
        if let Some(table) = table {
            let own_name = self.name();
            let mut docs = Vec::new();
            for other in table.resolve(other_db) {
                let Ok(doc) = other.fetch_by_id(id) else { continue };
                if let Some(ids) = doc.links.get(&own_name) {
                    for foreign in ids {
                        // a databank without an id index has no resolvable
                        // incoming links
                        match self.doc_nr_for_id(foreign) {
                            Ok(Some(doc_nr)) => docs.push(doc_nr),
                            Ok(None) => {}
                            Err(e) if e.kind == ErrorKind::NotFound => {}
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
            if !docs.is_empty() {
                docs.sort_unstable();
                docs.dedup();
                links_in = Some(Box::new(VectorIterator::from_docs(docs)));
            }
        }

        UnionIterator::create(links_out, links_in)
    }

    /// High-level find: parse, build the boolean filter, and rank the free
    /// terms. On a parse error the query downgrades to a bag of words.
    pub fn find(
        &self,
        query: &str,
        all_terms_required: bool,
        limit: usize,
    ) -> Result<BoxedDocIterator> {
        let parsed = match parse_query(query, all_terms_required) {
            Ok(parsed) => parsed,
            Err(e) if e.kind == ErrorKind::Parse => {
                warn!("query {query:?} failed to parse ({e}), retrying as bag of words");
                let terms = tokenize_words(query)
                    .into_iter()
                    .filter(|w| !matches!(w.as_str(), "and" | "or" | "not" | "between"))
                    .collect();
                ParsedQuery { ast: None, terms, is_boolean: false }
            }
            Err(e) => return Err(e),
        };

        if parsed.terms.is_empty() {
            let iter = match &parsed.ast {
                Some(ast) => build(ast, self)?,
                None => None,
            };
            return Ok(iter.unwrap_or_else(|| Box::new(NoDocIterator)));
        }

        let filter = match &parsed.ast {
            Some(ast) => build(ast, self)?,
            None => None,
        };
        self.find_ranked(&parsed.terms, filter, all_terms_required, limit)
    }

    /// Boolean-only find: no ranking, the filter tree is the result.
    pub fn find_boolean(&self, query: &str) -> Result<BoxedDocIterator> {
        let parsed = parse_query(query, true)?;
        let iter = match &parsed.ast {
            Some(ast) => build(ast, self)?,
            None => None,
        };
        Ok(iter.unwrap_or_else(|| Box::new(NoDocIterator)))
    }

    /// Accumulator-ranked retrieval over the weighted full-text index.
    pub fn find_ranked(
        &self,
        terms: &[String],
        filter: Option<BoxedDocIterator>,
        all_terms_required: bool,
        limit: usize,
    ) -> Result<BoxedDocIterator> {
        let max_doc = self.max_doc_nr();
        if max_doc == 0 || terms.is_empty() {
            return Ok(Box::new(NoDocIterator));
        }

        let wt_index = self.index(WEIGHT_INDEX)?;
        let mut acc = RankAccumulator::new(max_doc);

        for term in terms {
            let key = self.fold_key(IndexKind::Weighted, term);
            let Some(data) = wt_index.find_key(&key)? else { continue };
            let df = data.count().max(1);
            let idf = ((max_doc as f32) / (df as f32)).ln().max(0.0) + 1.0;
            let mut iter = wt_index.weighted_iter(&data)?;
            while let Some((doc, weight)) = iter.next()? {
                acc.add(doc, weight as f32 * idf);
            }
        }

        let mut matched = acc.matched_docs(terms.len(), all_terms_required);
        if let Some(mut filter) = filter {
            intersect_with(&mut matched, filter.as_mut())?;
        }

        let mut top = TopDocs::new(if limit == 0 { matched.len().max(1) } else { limit });
        for &doc in &matched {
            top.push(doc, acc.score(doc) / self.store.norm(doc));
        }
        Ok(Box::new(VectorIterator::new_ranked(top.into_ranked())))
    }

    /// Term lookup with a comparison operator.
    pub fn find_term(
        &self,
        index: &str,
        value: &str,
        op: CompareOp,
    ) -> Result<BoxedDocIterator> {
        Ok(self
            .compare_iterator(index, op, value)?
            .unwrap_or_else(|| Box::new(NoDocIterator)))
    }

    pub fn find_range(&self, index: &str, lo: &str, hi: &str) -> Result<BoxedDocIterator> {
        Ok(self
            .range_iterator(index, lo, hi)?
            .unwrap_or_else(|| Box::new(NoDocIterator)))
    }

    pub fn find_pattern(&self, index: &str, pattern: &str) -> Result<BoxedDocIterator> {
        Ok(self
            .pattern_iterator(index, pattern)?
            .unwrap_or_else(|| Box::new(NoDocIterator)))
    }

    /// Phrase search over a quoted string.
    pub fn find_string(&self, index: &str, phrase: &str) -> Result<BoxedDocIterator> {
        let words = tokenize_words(phrase);
        Ok(self
            .phrase_iterator(index, &words)?
            .unwrap_or_else(|| Box::new(NoDocIterator)))
    }

    /// Documents in this databank linked with `other_db`'s record `id`.
    pub fn linked_documents(&self, other_db: &str, id: &str) -> Result<BoxedDocIterator> {
        Ok(self
            .linked_iterator(other_db, id)?
            .unwrap_or_else(|| Box::new(NoDocIterator)))
    }

    /// Whether any document matches `index = value`; the doc-nr comes back
    /// only for an unambiguous single match.
    pub fn exists(&self, index: &str, value: &str) -> Result<(bool, DocNr)> {
        let index = self.index(index)?;
        let key = self.fold_key(index.kind(), value);
        match index.find_key(&key)? {
            None => Ok((false, 0)),
            Some(KeyData::Unique(doc)) => Ok((true, doc)),
            Some(data) if data.count() == 1 => {
                let mut iter = index.postings_iter(&data)?;
                Ok((true, iter.next()?.unwrap_or(0)))
            }
            Some(_) => Ok((true, 0)),
        }
    }

    pub fn doc_nr_for_id(&self, id: &str) -> Result<Option<DocNr>> {
        let index = self.index(ID_INDEX)?;
        let key = self.fold_key(index.kind(), id);
        Ok(match index.find_key(&key)? {
            Some(KeyData::Unique(doc)) => Some(doc),
            _ => None,
        })
    }

    pub fn fetch(&self, doc_nr: DocNr) -> Result<Arc<Document>> {
        self.store.fetch(doc_nr)
    }

    /// Fetch by the `id` attribute through the unique id index.
    pub fn fetch_by_id(&self, id: &str) -> Result<Arc<Document>> {
        match self.doc_nr_for_id(id)? {
            Some(doc_nr) => self.fetch(doc_nr),
            None => Err(Error::not_found(format!("document id {id}"))),
        }
    }

    pub fn documents(&self) -> crate::store::DocIter<'_> {
        self.store.iter()
    }

    /// Spelling suggestions: full-text keys within edit distance 2, scored
    /// by closeness, best first.
    pub fn suggest_corrections(&self, word: &str) -> Result<Vec<(String, u16)>> {
        let folded = word.to_ascii_lowercase();
        let index = self.index(FULL_TEXT)?;
        let mut scored: Vec<(String, u16)> = Vec::new();

        for key in index.list_keys(None, None)? {
            if key.len().abs_diff(folded.len()) > 2 {
                continue;
            }
            let Ok(candidate) = String::from_utf8(key) else { continue };
            if candidate == folded {
                continue;
            }
            let dist = edit_distance(&folded, &candidate, 2);
            if dist <= 2 {
                let len = folded.len().max(candidate.len()) as u16;
                scored.push((candidate, (len.saturating_sub(dist as u16)) * 100 / len));
            }
        }

        scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(10);
        Ok(scored)
    }

    /// Keys of an index within an optional `[first, last]` window, for
    /// browsing.
    pub fn list_index_entries(
        &self,
        index: &str,
        first: Option<&str>,
        last: Option<&str>,
    ) -> Result<Vec<String>> {
        let index = self.index(index)?;
        let first = first.map(|f| self.fold_key(index.kind(), f));
        let last = last.map(|l| self.fold_key(index.kind(), l));
        let keys = index.list_keys(first.as_deref(), last.as_deref())?;
        Ok(keys
            .into_iter()
            .map(|k| String::from_utf8_lossy(&k).into_owned())
            .collect())
    }

    pub fn info(&self) -> Result<DatabankInfo> {
        let meta = self.meta.lock().clone();
        let mut indexes = Vec::with_capacity(meta.indexes.len());
        let mut total = self.store.data_size();
        for entry in &meta.indexes {
            let index = self.index(&entry.name)?;
            total += index.file_size();
            indexes.push(IndexInfo {
                name: entry.name.clone(),
                kind: entry.kind,
                key_count: index.key_count(),
                file_size: index.file_size(),
            });
        }
        Ok(DatabankInfo {
            name: meta.name,
            uuid: meta.uuid,
            doc_count: meta.doc_count,
            raw_text_bytes: meta.raw_text_bytes,
            store_size: self.store.data_size(),
            total_size: total,
            built: meta.built,
            indexes,
        })
    }

    /// Structural check of every index tree.
    pub fn validate(&self) -> Result<()> {
        let entries = self.meta.lock().indexes.clone();
        for entry in entries {
            self.index(&entry.name)?.validate()?;
        }
        Ok(())
    }

    pub fn dump_index(&self, name: &str, out: &mut dyn std::io::Write) -> Result<()> {
        self.index(name)?.dump(out)
    }

    /// Rewrite the whole databank compactly into `target`.
    pub fn vacuum_into(&self, target: &Path) -> Result<()> {
        std::fs::create_dir_all(target)
            .map_err(|e| Error::io(e, format!("create {}", target.display())))?;

        let store = self.store.vacuum_to(target)?;
        drop(store);

        let entries = self.meta.lock().indexes.clone();
        for entry in &entries {
            let index = self.index(&entry.name)?;
            if entry.kind.has_idl() {
                let old_idl = self.idl_handle()?;
                let mut new_idl = IdlWriter::create(&target.join(format!("{}.idl", entry.name)))?;
                index.vacuum_to(&target.join(&entry.file), Some((&old_idl, &mut new_idl)))?;
                new_idl.finish()?;
            } else {
                index.vacuum_to(&target.join(&entry.file), None)?;
            }
        }

        let meta = self.meta.lock().clone();
        write_meta(target, &meta)?;

        if meta.with_fasta {
            let fasta = self.dir.join("fasta");
            if fasta.exists() {
                std::fs::copy(&fasta, target.join("fasta"))
                    .map_err(|e| Error::io(e, "copy fasta dump"))?;
            }
        }

        Ok(())
    }

    /// Vacuum in place: rewrite next to the original, then swap the
    /// directories. The original stays untouched until the rename.
    pub fn vacuum(path: &Path) -> Result<()> {
        let db = Databank::open(path, OpenMode::ReadOnly)?;
        let tmp = path.with_extension("vacuum-tmp");
        if tmp.exists() {
            std::fs::remove_dir_all(&tmp)
                .map_err(|e| Error::io(e, format!("clear {}", tmp.display())))?;
        }
        db.vacuum_into(&tmp)?;
        drop(db);

        let old = path.with_extension("vacuum-old");
        std::fs::rename(path, &old).map_err(|e| Error::io(e, "swap out old databank"))?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            // roll the original back in
            let _ = std::fs::rename(&old, path);
            return Err(Error::io(e, "swap in vacuumed databank"));
        }
        std::fs::remove_dir_all(&old).map_err(|e| Error::io(e, "remove old databank"))?;
        info!("vacuumed {}", path.display());
        Ok(())
    }
}

fn write_named_index(index: &Arc<IndexFile>, acc: NamedAcc) -> Result<()> {
    let order = index.order();
    let mut writer = index.bulk_writer()?;
    match acc {
        NamedAcc::Unique(map) => {
            let mut entries: Vec<(Vec<u8>, DocNr)> = map.into_iter().collect();
            entries.sort_unstable_by(|a, b| order.compare(&a.0, &b.0));
            for (key, doc) in entries {
                writer.push_unique(&key, doc)?;
            }
        }
        NamedAcc::Multi(map) => {
            let mut entries: Vec<(Vec<u8>, Vec<DocNr>)> = map
                .into_iter()
                .map(|(k, docs)| (k, docs.into_iter().collect()))
                .collect();
            entries.sort_unstable_by(|a, b| order.compare(&a.0, &b.0));
            for (key, docs) in entries {
                writer.push_postings(&key, &docs)?;
            }
        }
    }
    writer.finish()
}

fn write_meta(dir: &Path, meta: &HeaderMeta) -> Result<()> {
    let tmp = dir.join(format!("{META_FILE}.tmp"));
    let body = serde_json::to_vec_pretty(meta)?;
    std::fs::write(&tmp, body).map_err(|e| Error::io(e, "write databank header"))?;
    std::fs::rename(&tmp, dir.join(META_FILE))
        .map_err(|e| Error::io(e, "swap in databank header"))
}

fn read_meta(dir: &Path) -> Result<HeaderMeta> {
    let path = dir.join(META_FILE);
    let body = std::fs::read(&path)
        .map_err(|e| Error::io(e, format!("read {}", path.display())))?;
    let meta: HeaderMeta = serde_json::from_slice(&body)?;
    if meta.signature != META_SIGNATURE {
        return Err(Error::corruption(format!("bad signature in {}", path.display())));
    }
    Ok(meta)
}

/// Bounded Levenshtein distance with a cheap band cutoff.
pub(crate) fn edit_distance(a: &str, b: &str, bound: usize) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > bound {
        return bound + 1;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        cur[0] = i;
        let mut row_min = cur[0];
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            cur[j] = (prev[j] + 1).min(cur[j - 1] + 1).min(prev[j - 1] + cost);
            row_min = row_min.min(cur[j]);
        }
        if row_min > bound {
            return bound + 1;
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::DocIterator;

    fn drain(iter: &mut dyn DocIterator) -> Vec<DocNr> {
        let mut out = Vec::new();
        while let Some((doc, _)) = iter.next().unwrap() {
            out.push(doc);
        }
        out
    }

    fn build_id_databank(dir: &Path, n: u32) -> Arc<Databank> {
        let schema = Schema::new("ids")
            .index("id", IndexKind::Unique)
            .page_size(256);
        let db = Arc::new(Databank::create(dir, schema).unwrap());

        let lexicon = Arc::new(Lexicon::new());
        db.start_batch_import(lexicon).unwrap();

        let mut staging = StagingLexicon::new();
        let mut batch = Vec::new();
        for i in 1..=n {
            let id = format!("ID_{i:05}");
            let mut doc = InputDocument::new(id.to_ascii_lowercase());
            doc.set_attribute("id", &id).unwrap();
            doc.index_value("id", IndexKind::Unique, &id).unwrap();
            batch.push(doc);
        }
        db.store_batch(&mut batch, &mut staging).unwrap();
        db.end_batch_import().unwrap();
        db.finish_batch_import().unwrap();
        db
    }

    #[test]
    fn unique_index_lookup_after_bulk_build() {
        let dir = tempfile::tempdir().unwrap();
        let db = build_id_databank(dir.path(), 1000);

        let mut iter = db.find_term("id", "ID_00500", CompareOp::Equals).unwrap();
        let hits = drain(iter.as_mut());
        assert_eq!(hits.len(), 1);

        let doc = db.fetch(hits[0]).unwrap();
        assert_eq!(doc.text, "id_00500");
        assert_eq!(doc.attribute("id"), Some("ID_00500"));

        db.validate().unwrap();

        let (found, doc_nr) = db.exists("id", "id_00777").unwrap();
        assert!(found);
        assert_eq!(
            db.fetch(doc_nr).unwrap().attribute("id"),
            Some("ID_00777")
        );
        let (found, _) = db.exists("id", "ID_99999").unwrap();
        assert!(!found);
    }

    #[test]
    fn pattern_and_range_on_unique_index() {
        let dir = tempfile::tempdir().unwrap();
        let db = build_id_databank(dir.path(), 300);

        let mut iter = db.find_pattern("id", "ID_0001?").unwrap();
        assert_eq!(drain(iter.as_mut()).len(), 10);

        let mut iter = db.find_range("id", "ID_00010", "ID_00013").unwrap();
        assert_eq!(drain(iter.as_mut()).len(), 4);

        // a wide full-text pattern takes the bitmap-union path
        let mut iter = db.find_pattern("full-text", "id_000??").unwrap();
        assert_eq!(drain(iter.as_mut()).len(), 99);
    }

    fn build_structures_databank(dir: &Path) -> Arc<Databank> {
        let schema = Schema::new("structures")
            .index("id", IndexKind::Unique)
            .index("exp_method", IndexKind::Multi)
            .index("resolution", IndexKind::Float)
            .page_size(256);
        let db = Arc::new(Databank::create(dir, schema).unwrap());
        db.start_batch_import(Arc::new(Lexicon::new())).unwrap();

        let mut staging = StagingLexicon::new();
        let mut docs = Vec::new();
        for (id, resolution, text) in [
            ("1CRN", "1.0", "crambin structure solved by x-ray diffraction"),
            ("2GFP", "2.0", "green fluorescent protein beta barrel structure"),
        ] {
            let mut doc = InputDocument::new(text);
            doc.set_attribute("id", id).unwrap();
            doc.index_value("id", IndexKind::Unique, id).unwrap();
            doc.index_value("resolution", IndexKind::Float, resolution).unwrap();
            doc.index_text("exp_method", "x");
            docs.push(doc);
        }
        db.store_batch(&mut docs, &mut staging).unwrap();
        db.end_batch_import().unwrap();
        db.finish_batch_import().unwrap();
        db
    }

    #[test]
    fn boolean_queries_over_numeric_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let db = build_structures_databank(dir.path());

        let mut iter = db.find_boolean("resolution < 1.2").unwrap();
        assert_eq!(drain(iter.as_mut()), vec![1]);

        let mut iter = db.find_boolean("resolution > 1.2").unwrap();
        assert_eq!(drain(iter.as_mut()), vec![2]);

        let mut iter = db.find_boolean("exp_method:x").unwrap();
        assert_eq!(drain(iter.as_mut()), vec![1, 2]);

        let mut iter = db.find_boolean("resolution BETWEEN 0.5 AND 2.5").unwrap();
        assert_eq!(drain(iter.as_mut()), vec![1, 2]);

        let mut iter = db.find_boolean("crambin AND resolution < 1.2").unwrap();
        assert_eq!(drain(iter.as_mut()), vec![1]);

        let mut iter = db.find_boolean("NOT crambin").unwrap();
        assert_eq!(drain(iter.as_mut()), vec![2]);
    }

    #[test]
    fn ranked_find_prefers_heavier_documents() {
        let dir = tempfile::tempdir().unwrap();
        let schema = Schema::new("ranked").page_size(256);
        let db = Arc::new(Databank::create(dir.path(), schema).unwrap());
        db.start_batch_import(Arc::new(Lexicon::new())).unwrap();

        let mut staging = StagingLexicon::new();
        let mut docs = vec![
            InputDocument::new("kinase kinase kinase inhibitor study"),
            InputDocument::new("kinase mentioned once in a longer text about other things entirely"),
            InputDocument::new("no relevant terms at all here"),
        ];
        db.store_batch(&mut docs, &mut staging).unwrap();
        db.end_batch_import().unwrap();
        db.finish_batch_import().unwrap();

        let mut iter = db.find("kinase", true, 10).unwrap();
        assert!(iter.ranked());
        let mut hits = Vec::new();
        while let Some((doc, rank)) = iter.next().unwrap() {
            hits.push((doc, rank));
        }
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 1);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
        assert!(hits[1].1 < 1.0);
    }

    #[test]
    fn phrase_search_requires_adjacency() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(
            Databank::create(dir.path(), Schema::new("phrases").page_size(256)).unwrap(),
        );
        db.start_batch_import(Arc::new(Lexicon::new())).unwrap();

        let mut staging = StagingLexicon::new();
        let mut docs = vec![
            InputDocument::new("green fluorescent protein expressed in cells"),
            InputDocument::new("fluorescent green protein order is different"),
            InputDocument::new("green and also fluorescent protein"),
        ];
        db.store_batch(&mut docs, &mut staging).unwrap();
        db.end_batch_import().unwrap();
        db.finish_batch_import().unwrap();

        let mut iter = db.find_string("full-text", "green fluorescent protein").unwrap();
        assert_eq!(drain(iter.as_mut()), vec![1]);

        let mut iter = db.find_string("full-text", "fluorescent protein").unwrap();
        assert_eq!(drain(iter.as_mut()), vec![1, 3]);
    }

    #[test]
    fn stop_words_leave_position_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let schema = Schema::new("stops").stop_words(&["the", "of"]).page_size(256);
        let db = Arc::new(Databank::create(dir.path(), schema).unwrap());
        db.start_batch_import(Arc::new(Lexicon::new())).unwrap();

        let mut staging = StagingLexicon::new();
        let mut docs = vec![
            InputDocument::new("structure of the crambin protein"),
            InputDocument::new("structure protein"),
        ];
        db.store_batch(&mut docs, &mut staging).unwrap();
        db.end_batch_import().unwrap();
        db.finish_batch_import().unwrap();

        // stop words are not searchable
        let mut iter = db.find_boolean("the").unwrap();
        assert_eq!(drain(iter.as_mut()), Vec::<DocNr>::new());

        // and they keep phrase positions apart: "structure ... crambin" is
        // not adjacent in doc 1, "structure protein" is adjacent in doc 2
        let mut iter = db.find_string("full-text", "structure protein").unwrap();
        assert_eq!(drain(iter.as_mut()), vec![2]);
    }

    #[test]
    fn linked_documents_across_databanks() {
        let dir = tempfile::tempdir().unwrap();

        let sprot = {
            let schema = Schema::new("sprot").index("id", IndexKind::Unique).page_size(256);
            let db = Arc::new(Databank::create(&dir.path().join("sprot"), schema).unwrap());
            db.start_batch_import(Arc::new(Lexicon::new())).unwrap();
            let mut staging = StagingLexicon::new();
            let mut doc = InputDocument::new("crambin from crambe abyssinica");
            doc.set_attribute("id", "CRAM_CRAAB").unwrap();
            doc.index_value("id", IndexKind::Unique, "CRAM_CRAAB").unwrap();
            doc.add_link("pdb", "1CRN");
            let mut docs = vec![doc];
            db.store_batch(&mut docs, &mut staging).unwrap();
            db.end_batch_import().unwrap();
            db.finish_batch_import().unwrap();
            db
        };

        let pdb = {
            let schema = Schema::new("pdb").index("id", IndexKind::Unique).page_size(256);
            let db = Arc::new(Databank::create(&dir.path().join("pdb"), schema).unwrap());
            db.start_batch_import(Arc::new(Lexicon::new())).unwrap();
            let mut staging = StagingLexicon::new();
            let mut doc = InputDocument::new("crystal structure of crambin");
            doc.set_attribute("id", "1CRN").unwrap();
            doc.index_value("id", IndexKind::Unique, "1CRN").unwrap();
            let mut docs = vec![doc];
            db.store_batch(&mut docs, &mut staging).unwrap();
            db.end_batch_import().unwrap();
            db.finish_batch_import().unwrap();
            db
        };

        let table = LinkTable::new();
        table.register(&sprot, &[]);
        table.register(&pdb, &[]);

        // sprot links out to pdb/1CRN
        let mut iter = sprot.linked_documents("pdb", "1CRN").unwrap();
        assert_eq!(drain(iter.as_mut()), vec![1]);

        // and pdb sees the incoming link from sprot/CRAM_CRAAB
        let mut iter = pdb.linked_documents("sprot", "CRAM_CRAAB").unwrap();
        assert_eq!(drain(iter.as_mut()), vec![1]);

        // query syntax reaches the same result
        let mut iter = sprot.find_boolean("[pdb/1CRN]").unwrap();
        assert_eq!(drain(iter.as_mut()), vec![1]);
    }

    #[test]
    fn info_validate_dump_and_suggest() {
        let dir = tempfile::tempdir().unwrap();
        let db = build_structures_databank(dir.path());

        let info = db.info().unwrap();
        assert_eq!(info.name, "structures");
        assert_eq!(info.doc_count, 2);
        assert!(info.built.is_some());
        assert!(info.total_size > info.store_size);
        assert!(info.indexes.iter().any(|i| i.name == "resolution" && i.key_count == 2));

        db.validate().unwrap();

        let mut dump = Vec::new();
        db.dump_index("id", &mut dump).unwrap();
        let dump = String::from_utf8(dump).unwrap();
        assert!(dump.contains("1crn"));

        let suggestions = db.suggest_corrections("crambln").unwrap();
        assert_eq!(suggestions[0].0, "crambin");
    }

    #[test]
    fn vacuum_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            build_id_databank(&path, 200);
        }

        Databank::vacuum(&path).unwrap();

        let db = Databank::open(&path, OpenMode::ReadOnly).unwrap();
        assert_eq!(db.size(), 200);
        db.validate().unwrap();

        let doc = db.fetch_by_id("ID_00042").unwrap();
        assert_eq!(doc.attribute("id"), Some("ID_00042"));

        // posting lists and phrase positions survived the rewrite
        let mut iter = db.find_term("id", "ID_00117", CompareOp::Equals).unwrap();
        assert_eq!(drain(iter.as_mut()).len(), 1);
        let mut iter = db.find_string("full-text", "id_00117").unwrap();
        assert_eq!(drain(iter.as_mut()).len(), 1);
    }

    #[test]
    fn bag_of_words_fallback_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = build_structures_databank(dir.path());

        // trailing operator is a parse error; the fallback strips it
        let mut iter = db.find("crambin AND", true, 10).unwrap();
        assert_eq!(drain(iter.as_mut()), vec![1]);
    }

    #[test]
    fn doc_nr_query_and_match_all() {
        let dir = tempfile::tempdir().unwrap();
        let db = build_structures_databank(dir.path());

        let mut iter = db.find_boolean("#2").unwrap();
        assert_eq!(drain(iter.as_mut()), vec![2]);

        let mut iter = db.find_boolean("*").unwrap();
        assert_eq!(drain(iter.as_mut()), vec![1, 2]);
    }
}
