//! Document model and the on-disk document store.

mod docstore;
mod document;

pub use docstore::{DocIter, DocStore};
pub use document::{DocLinks, Document, IndexTokens, IndexValueEntry, InputDocument};
