//! Paged file storage shared by every index file of a databank.

mod pager;

pub use pager::{
    FileHeader, OpenMode, PageBuf, PageKind, PageRef, Pager, PostingsSource,
    DEFAULT_PAGE_SIZE, PAGE_HEADER_SIZE,
};
