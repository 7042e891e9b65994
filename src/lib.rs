//! seqbank: a full-text retrieval engine for heterogeneous biological
//! sequence and annotation databanks.
//!
//! A databank is a directory of paged B+ tree index files plus a compressed
//! document store. Posting lists are bit-packed with a selector codec tuned
//! for sorted doc-nr streams; queries evaluate as trees of lazy doc-nr
//! iterators (union / intersection / not / phrase / ranked); ingest runs as
//! a two-pool pipeline with per-thread staging lexicons.
//!
//! ```no_run
//! use seqbank::core::types::IndexKind;
//! use seqbank::databank::{Databank, Schema};
//! use seqbank::search::DocIterator;
//!
//! # fn main() -> seqbank::core::error::Result<()> {
//! let schema = Schema::new("sprot").index("id", IndexKind::Unique);
//! let db = Databank::create(std::path::Path::new("/data/sprot"), schema)?;
//! // ... batch import, then:
//! let mut hits = db.find("crambin AND resolution < 2.0", true, 10)?;
//! while let Some((doc_nr, rank)) = hits.next()? {
//!     let doc = db.fetch(doc_nr)?;
//!     println!("{rank:.2} {}", doc.attribute("id").unwrap_or("?"));
//! }
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod bitstream;
pub mod compression;
pub mod core;
pub mod databank;
pub mod index;
pub mod lexicon;
pub mod parallel;
pub mod query;
pub mod search;
pub mod storage;
pub mod store;

pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::types::{CompareOp, DocNr, IndexKind};
pub use databank::{Databank, DatabankInfo, IndexDecl, LinkTable, Schema};
pub use store::{Document, InputDocument};
