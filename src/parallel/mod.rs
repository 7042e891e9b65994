//! Parallel batch-import pipeline.

mod pipeline;

pub use pipeline::{BatchBuilder, PlainTextParser, RecordParser, SharedCancel};
