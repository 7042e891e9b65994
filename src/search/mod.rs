//! Query-time doc-nr streams and ranked scoring support.

mod iterators;
mod ranked;

pub use iterators::{
    collect_docs, intersect_with, AllDocIterator, BitmapIterator, BoxedDocIterator, DocIterator,
    IntersectionIterator, MultiDocIterator, NoDocIterator, NotIterator, PhraseIterator,
    SingleDocIterator, UnionIterator, VectorIterator,
};
pub use ranked::{RankAccumulator, TopDocs};
