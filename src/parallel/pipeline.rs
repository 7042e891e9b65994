use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver, Sender};
use log::{info, warn};
use parking_lot::Mutex;

use crate::core::error::{Error, Result};
use crate::databank::Databank;
use crate::lexicon::{Lexicon, StagingLexicon};
use crate::store::InputDocument;

/// Documents per worker batch before the staging lexicon is flushed and the
/// batch handed to the store.
const BATCH_SIZE: usize = 100;

/// Records buffered between the file pool and the document pool.
const RECORD_QUEUE_DEPTH: usize = 100;

/// Interface to the per-databank scripted parsers, which live outside the
/// core. `split` runs on the file pool and cuts raw file text into record
/// texts; `parse` runs on the document pool and turns one record into an
/// input document.
pub trait RecordParser: Send + Sync {
    /// Default: the whole file is a single record.
    fn split(
        &self,
        _filename: &str,
        text: &str,
        emit: &mut dyn FnMut(String) -> Result<()>,
    ) -> Result<()> {
        emit(text.to_string())
    }

    fn parse(&self, filename: &str, record: &str) -> Result<InputDocument>;
}

/// Fallback parser: the whole file is one document, the file stem its id.
pub struct PlainTextParser;

impl RecordParser for PlainTextParser {
    fn parse(&self, filename: &str, record: &str) -> Result<InputDocument> {
        let stem = std::path::Path::new(filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.to_string());
        let mut doc = InputDocument::new(record);
        doc.set_attribute("id", &stem)?;
        Ok(doc)
    }
}

type RecordItem = (String, String); // (text, filename)

struct SharedState {
    error: Mutex<Option<Error>>,
    cancel: AtomicBool,
}

impl SharedState {
    fn fail(&self, err: Error) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Two-pool batch builder: a file pool reads input files into records, a
/// document pool parses records into documents and stores them in batches.
/// EOF propagates by channel closure; the first worker error cancels the
/// whole run and is rethrown from the driver.
pub struct BatchBuilder {
    databank: Arc<Databank>,
    parser: Arc<dyn RecordParser>,
    threads: usize,
    shared: Arc<SharedState>,
}

impl BatchBuilder {
    pub fn new(databank: Arc<Databank>, parser: Arc<dyn RecordParser>) -> BatchBuilder {
        BatchBuilder {
            databank,
            parser,
            threads: num_cpus::get().max(1),
            shared: Arc::new(SharedState {
                error: Mutex::new(None),
                cancel: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_threads(mut self, threads: usize) -> BatchBuilder {
        self.threads = threads.max(1);
        self
    }

    /// Cooperative cancellation flag; checked between records.
    pub fn cancel_flag(&self) -> Arc<SharedCancel> {
        Arc::new(SharedCancel { shared: self.shared.clone() })
    }

    /// Full import lifecycle: start, ingest all files, flush, finalize.
    pub fn build(&self, files: Vec<PathBuf>) -> Result<()> {
        let lexicon = Arc::new(Lexicon::new());
        self.databank.start_batch_import(lexicon)?;
        self.ingest(files)?;
        self.databank.end_batch_import()?;
        self.databank.finish_batch_import()
    }

    /// Ingest into an already-started batch import.
    pub fn ingest(&self, files: Vec<PathBuf>) -> Result<()> {
        let file_count = files.len();
        let (record_tx, record_rx) = bounded::<RecordItem>(RECORD_QUEUE_DEPTH);

        // with a single input everything runs on the document pool
        let file_workers = if file_count <= 1 {
            0
        } else {
            (self.threads / 2).clamp(1, file_count)
        };
        let doc_workers = self.threads;

        info!(
            "ingesting {file_count} files with {file_workers} reader and {doc_workers} document workers"
        );

        std::thread::scope(|scope| {
            for _ in 0..doc_workers {
                let record_rx = record_rx.clone();
                let shared = self.shared.clone();
                let databank = self.databank.clone();
                let parser = self.parser.clone();
                scope.spawn(move || {
                    document_worker(record_rx, databank, parser, shared);
                });
            }

            if file_workers == 0 {
                // a single input runs its file work on the driver thread
                for path in &files {
                    if self.shared.cancelled() {
                        break;
                    }
                    read_and_split(path, &self.parser, &record_tx, &self.shared);
                }
            } else {
                let (file_tx, file_rx) = bounded::<PathBuf>(file_count);
                for path in files {
                    let _ = file_tx.send(path);
                }
                drop(file_tx);

                for _ in 0..file_workers {
                    let file_rx = file_rx.clone();
                    let record_tx = record_tx.clone();
                    let shared = self.shared.clone();
                    let parser = self.parser.clone();
                    scope.spawn(move || {
                        while let Ok(path) = file_rx.recv() {
                            if shared.cancelled() {
                                break;
                            }
                            read_and_split(&path, &parser, &record_tx, &shared);
                        }
                    });
                }
            }
            drop(record_tx);
        });

        if let Some(err) = self.shared.error.lock().take() {
            return Err(err);
        }
        if self.shared.cancelled() {
            return Err(Error::cancelled());
        }
        Ok(())
    }
}

/// Handle for cancelling a running build from another thread.
pub struct SharedCancel {
    shared: Arc<SharedState>,
}

impl SharedCancel {
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::Relaxed);
    }
}

/// File-pool step: read one input file and push its record texts.
fn read_and_split(
    path: &std::path::Path,
    parser: &Arc<dyn RecordParser>,
    records: &Sender<RecordItem>,
    shared: &Arc<SharedState>,
) {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            shared.fail(Error::io(e, format!("read {}", path.display())));
            return;
        }
    };

    let name = path.to_string_lossy().into_owned();
    let result = parser.split(&name, &text, &mut |record| {
        if shared.cancelled() {
            return Err(Error::cancelled());
        }
        records
            .send((record, name.clone()))
            .map_err(|_| Error::cancelled())
    });
    if let Err(e) = result {
        if e.kind != crate::core::error::ErrorKind::Cancelled {
            warn!("split of {name} failed: {e}");
            shared.fail(e);
        }
    }
}

/// Document-pool step: parse records into documents and store them in
/// batches of up to 100 against a thread-local staging lexicon.
fn document_worker(
    records: Receiver<RecordItem>,
    databank: Arc<Databank>,
    parser: Arc<dyn RecordParser>,
    shared: Arc<SharedState>,
) {
    let mut staging = StagingLexicon::new();
    let mut batch: Vec<InputDocument> = Vec::with_capacity(BATCH_SIZE);

    let mut flush = |batch: &mut Vec<InputDocument>, staging: &mut StagingLexicon| {
        if batch.is_empty() {
            return;
        }
        if let Err(e) = databank.store_batch(batch, staging) {
            shared.fail(e);
        }
        batch.clear();
    };

    while let Ok((record, filename)) = records.recv() {
        if shared.cancelled() {
            break;
        }

        match parser.parse(&filename, &record) {
            Ok(doc) => {
                batch.push(doc);
                if batch.len() >= BATCH_SIZE {
                    flush(&mut batch, &mut staging);
                }
            }
            Err(e) => {
                warn!("parse of a record from {filename} failed: {e}");
                shared.fail(e);
                break;
            }
        }
    }

    flush(&mut batch, &mut staging);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::IndexKind;
    use crate::databank::Schema;
    use crate::search::DocIterator;
    use crate::storage::OpenMode;

    /// Flat-file style parser for tests: records separated by "//" lines,
    /// first line of each record is "ID   <id>".
    struct RecordPerSlashSlash;

    impl RecordParser for RecordPerSlashSlash {
        fn split(
            &self,
            _filename: &str,
            text: &str,
            emit: &mut dyn FnMut(String) -> Result<()>,
        ) -> Result<()> {
            for record in text.split("//\n").filter(|r| !r.trim().is_empty()) {
                emit(record.to_string())?;
            }
            Ok(())
        }

        fn parse(&self, _filename: &str, record: &str) -> Result<InputDocument> {
            let id = record
                .lines()
                .next()
                .and_then(|l| l.strip_prefix("ID   "))
                .unwrap_or("unknown")
                .trim()
                .to_string();
            let mut doc = InputDocument::new(record);
            doc.set_attribute("id", &id)?;
            doc.index_value("id", IndexKind::Unique, &id)?;
            Ok(doc)
        }
    }

    fn write_input_files(dir: &std::path::Path, files: usize, records_per_file: usize) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for f in 0..files {
            let mut body = String::new();
            for r in 0..records_per_file {
                let id = format!("REC_{:02}_{:03}", f, r);
                body.push_str(&format!(
                    "ID   {id}\nDE   unique term zx{f}q{r:03} plus shared crambin text\n//\n"
                ));
            }
            let path = dir.join(format!("input{f}.dat"));
            std::fs::write(&path, body).unwrap();
            paths.push(path);
        }
        paths
    }

    #[test]
    fn parallel_build_indexes_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = dir.path().join("db");
        let schema = Schema::new("testbank")
            .index("id", IndexKind::Unique)
            .page_size(512);
        let db = Arc::new(Databank::create(&db_dir, schema).unwrap());

        let input = write_input_files(dir.path(), 4, 30);
        let builder =
            BatchBuilder::new(db.clone(), Arc::new(RecordPerSlashSlash)).with_threads(4);
        builder.build(input).unwrap();

        assert_eq!(db.size(), 120);
        db.validate().unwrap();

        // every record is reachable by id and by content
        let doc = db.fetch_by_id("REC_02_017").unwrap();
        assert!(doc.text.contains("zx2q017"));

        let mut iter = db.find("crambin", true, 0).unwrap();
        let mut hits = 0;
        while iter.next().unwrap().is_some() {
            hits += 1;
        }
        assert_eq!(hits, 120);

        // reopen read-only and query again
        drop(iter);
        drop(builder);
        drop(db);
        let db = Databank::open(&db_dir, OpenMode::ReadOnly).unwrap();
        let mut iter = db.find("zx3q005", true, 10).unwrap();
        let (doc_nr, _) = iter.next().unwrap().unwrap();
        let doc = db.fetch(doc_nr).unwrap();
        assert_eq!(doc.attribute("id"), Some("REC_03_005"));
    }

    #[test]
    fn single_file_runs_on_the_document_pool() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = dir.path().join("db");
        let schema = Schema::new("single")
            .index("id", IndexKind::Unique)
            .page_size(512);
        let db = Arc::new(Databank::create(&db_dir, schema).unwrap());

        let input = write_input_files(dir.path(), 1, 250);
        let builder =
            BatchBuilder::new(db.clone(), Arc::new(RecordPerSlashSlash)).with_threads(3);
        builder.build(input).unwrap();

        assert_eq!(db.size(), 250);
        db.validate().unwrap();
    }

    #[test]
    fn worker_error_cancels_the_run() {
        struct FailingParser;
        impl RecordParser for FailingParser {
            fn parse(&self, _filename: &str, _record: &str) -> Result<InputDocument> {
                Err(Error::new(crate::core::error::ErrorKind::Parse, "boom"))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let db_dir = dir.path().join("db");
        let db = Arc::new(
            Databank::create(&db_dir, Schema::new("failing").page_size(512)).unwrap(),
        );

        let input = write_input_files(dir.path(), 3, 5);
        let builder = BatchBuilder::new(db, Arc::new(FailingParser)).with_threads(2);
        let err = builder.build(input).unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::Parse);
    }
}
