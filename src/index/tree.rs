use std::collections::VecDeque;
use std::io::Write;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::core::error::{Error, Result};
use crate::core::types::MAX_KEY_LENGTH;
use crate::storage::{PageKind, PageRef, Pager};

use super::page;
use super::value::IndexValue;
use super::KeyOrder;

enum InsertOutcome {
    Done { inserted: bool },
    /// The page split; `up_key` and the new right page must be inserted
    /// into the caller.
    Split { up_key: Vec<u8>, right: u32, inserted: bool },
}

/// B+ tree with variable-length keys over a paged file. The leaf payload
/// type selects the page flavour; branch pages always hold child pointers.
pub struct BTree<V: IndexValue> {
    pager: Arc<Pager>,
    order: KeyOrder,
    auto_commit: AtomicBool,
    _value: PhantomData<V>,
}

impl<V: IndexValue> BTree<V> {
    pub fn new(pager: Arc<Pager>, order: KeyOrder) -> Self {
        BTree { pager, order, auto_commit: AtomicBool::new(true), _value: PhantomData }
    }

    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    pub fn order(&self) -> KeyOrder {
        self.order
    }

    pub fn size(&self) -> u32 {
        self.pager.header().size
    }

    pub fn depth(&self) -> u32 {
        self.pager.header().depth
    }

    /// Batch writers switch auto-commit off and commit once at the end.
    pub fn set_auto_commit(&self, on: bool) {
        self.auto_commit.store(on, AtomicOrdering::Relaxed);
    }

    pub fn commit(&self) -> Result<()> {
        self.pager.commit()
    }

    pub fn rollback(&self) {
        self.pager.rollback()
    }

    fn check_key(key: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(Error::invariant("key longer than 255 bytes"));
        }
        Ok(())
    }

    pub fn find(&self, key: &[u8]) -> Result<Option<V>> {
        Self::check_key(key)?;
        let mut page_nr = self.pager.header().root;
        while page_nr != 0 {
            let page = self.pager.load(page_nr)?;
            let buf = page.read();
            match buf.kind {
                PageKind::Branch => {
                    let (ix, _) = page::binary_search(&buf, key, self.order);
                    page_nr = if ix < 0 {
                        buf.link
                    } else {
                        page::get_value::<u32>(&buf, ix as usize)
                    };
                }
                kind if kind == V::LEAF_KIND => {
                    let (ix, matched) = page::binary_search(&buf, key, self.order);
                    return Ok(matched.then(|| page::get_value::<V>(&buf, ix as usize)));
                }
                kind => {
                    return Err(Error::corruption(format!(
                        "unexpected {kind:?} page in tree descent"
                    )))
                }
            }
        }
        Ok(None)
    }

    /// Insert, or update the payload of an existing key. Returns whether a
    /// new entry was created.
    pub fn insert(&self, key: &[u8], value: &V) -> Result<bool> {
        Self::check_key(key)?;

        let result = (|| {
            if self.pager.header().root == 0 {
                let (root_nr, _page) = self.pager.allocate(V::LEAF_KIND)?;
                self.pager.update_header(|h| {
                    h.root = root_nr;
                    h.depth = 1;
                });
            }

            let root = self.pager.header().root;
            let inserted = match self.insert_rec(root, key, value)? {
                InsertOutcome::Done { inserted } => inserted,
                InsertOutcome::Split { up_key, right, inserted } => {
                    let (new_root, page) = self.pager.allocate(PageKind::Branch)?;
                    {
                        let mut buf = page.write();
                        buf.link = root;
                        page::insert_key_value::<u32>(&mut buf, &up_key, &right, 0);
                    }
                    self.pager.update_header(|h| {
                        h.root = new_root;
                        h.depth += 1;
                    });
                    inserted
                }
            };

            if inserted {
                self.pager.update_header(|h| h.size += 1);
            }
            Ok(inserted)
        })();

        match result {
            Ok(inserted) => {
                if self.auto_commit.load(AtomicOrdering::Relaxed) {
                    self.pager.commit()?;
                }
                Ok(inserted)
            }
            Err(e) => {
                self.pager.rollback();
                Err(e)
            }
        }
    }

    fn insert_rec(&self, page_nr: u32, key: &[u8], value: &V) -> Result<InsertOutcome> {
        let page = self.pager.load(page_nr)?;
        let kind = page.read().kind;

        if kind == PageKind::Branch {
            let (ix, _) = {
                let buf = page.read();
                page::binary_search(&buf, key, self.order)
            };
            let child = {
                let buf = page.read();
                if ix < 0 {
                    buf.link
                } else {
                    page::get_value::<u32>(&buf, ix as usize)
                }
            };

            match self.insert_rec(child, key, value)? {
                InsertOutcome::Done { inserted } => Ok(InsertOutcome::Done { inserted }),
                InsertOutcome::Split { up_key, right, inserted } => {
                    let mut buf = page.write();
                    let at = (ix + 1) as usize;
                    if page::can_store::<u32>(&buf, &up_key) {
                        page::insert_key_value::<u32>(&mut buf, &up_key, &right, at);
                        Ok(InsertOutcome::Done { inserted })
                    } else {
                        let (next_nr, next_page) = self.pager.allocate(PageKind::Branch)?;
                        let mut next = next_page.write();
                        let n = buf.n as usize;
                        let mut split = n / 2;

                        let (promote, down);
                        if at == split {
                            promote = up_key;
                            down = right;
                            page::move_entries::<u32>(&mut buf, &mut next, split, 0, n - split);
                        } else if at < split {
                            split -= 1;
                            promote = page::get_key(&buf, split).to_vec();
                            down = page::get_value::<u32>(&buf, split);
                            page::move_entries::<u32>(&mut buf, &mut next, split + 1, 0, n - split - 1);
                            drop_last_entry(&mut buf);
                            if at <= split {
                                page::insert_key_value::<u32>(&mut buf, &up_key, &right, at);
                            } else {
                                page::insert_key_value::<u32>(&mut next, &up_key, &right, at - split - 1);
                            }
                        } else {
                            promote = page::get_key(&buf, split).to_vec();
                            down = page::get_value::<u32>(&buf, split);
                            page::move_entries::<u32>(&mut buf, &mut next, split + 1, 0, n - split - 1);
                            drop_last_entry(&mut buf);
                            if at < split {
                                page::insert_key_value::<u32>(&mut buf, &up_key, &right, at);
                            } else {
                                page::insert_key_value::<u32>(&mut next, &up_key, &right, at - split - 1);
                            }
                        }

                        next.link = down;
                        next.dirty = true;
                        Ok(InsertOutcome::Split { up_key: promote, right: next_nr, inserted })
                    }
                }
            }
        } else {
            if kind != V::LEAF_KIND {
                return Err(Error::corruption(format!(
                    "unexpected {kind:?} page in tree descent"
                )));
            }
            let mut buf = page.write();
            let (ix, matched) = page::binary_search(&buf, key, self.order);
            if matched {
                // unique index semantics: replace the payload
                page::set_value(&mut buf, ix as usize, value);
                return Ok(InsertOutcome::Done { inserted: false });
            }

            let at = (ix + 1) as usize;
            if page::can_store::<V>(&buf, key) {
                page::insert_key_value(&mut buf, key, value, at);
                Ok(InsertOutcome::Done { inserted: true })
            } else {
                let (next_nr, next_page) = self.pager.allocate(V::LEAF_KIND)?;
                let mut next = next_page.write();
                let n = buf.n as usize;
                let split = n / 2;

                page::move_entries::<V>(&mut buf, &mut next, split, 0, n - split);
                next.link = buf.link;
                next.dirty = true;
                buf.link = next_nr;
                buf.dirty = true;

                if at <= buf.n as usize {
                    page::insert_key_value(&mut buf, key, value, at);
                } else {
                    let offset = buf.n as usize;
                    page::insert_key_value(&mut next, key, value, at - offset);
                }

                let up_key = page::get_key(&next, 0).to_vec();
                Ok(InsertOutcome::Split { up_key, right: next_nr, inserted: true })
            }
        }
    }

    /// Remove a key. Returns whether it was present.
    pub fn erase(&self, key: &[u8]) -> Result<bool> {
        Self::check_key(key)?;
        if self.pager.header().root == 0 {
            return Ok(false);
        }

        let result = (|| {
            let root_nr = self.pager.header().root;
            let erased = self.erase_rec(root_nr, key, None, None)?;
            if erased {
                let root = self.pager.load(root_nr)?;
                let (n, link, is_branch) = {
                    let buf = root.read();
                    (buf.n, buf.link, buf.kind == PageKind::Branch)
                };
                if n == 0 {
                    root.write().deallocate();
                    self.pager.update_header(|h| {
                        h.root = if is_branch { link } else { 0 };
                        h.depth -= 1;
                    });
                }
                self.pager.update_header(|h| h.size -= 1);
            }
            Ok(erased)
        })();

        match result {
            Ok(erased) => {
                if self.auto_commit.load(AtomicOrdering::Relaxed) {
                    self.pager.commit()?;
                }
                Ok(erased)
            }
            Err(e) => {
                self.pager.rollback();
                Err(e)
            }
        }
    }

    fn erase_rec(
        &self,
        page_nr: u32,
        key: &[u8],
        parent: Option<(&PageRef, i32)>,
        link_ctx: Option<(PageRef, usize)>,
    ) -> Result<bool> {
        let page = self.pager.load(page_nr)?;
        let kind = page.read().kind;

        if kind == PageKind::Branch {
            let (ix, matched) = {
                let buf = page.read();
                page::binary_search(&buf, key, self.order)
            };
            let link_ctx = if matched {
                Some((page.clone(), ix as usize))
            } else {
                link_ctx
            };
            let child = {
                let buf = page.read();
                if ix < 0 {
                    buf.link
                } else {
                    page::get_value::<u32>(&buf, ix as usize)
                }
            };

            let erased = self.erase_rec(child, key, Some((&page, ix)), link_ctx)?;

            if erased && page::too_small::<u32>(&page.read()) {
                if let Some((parent_page, my_ix)) = parent {
                    let parent_n = parent_page.read().n as i32;
                    if my_ix + 1 < parent_n {
                        let right_nr = {
                            let pbuf = parent_page.read();
                            page::get_value::<u32>(&pbuf, (my_ix + 1) as usize)
                        };
                        let right = self.pager.load(right_nr)?;
                        self.branch_underflow(&page, &right, (my_ix + 1) as usize, parent_page)?;
                    }
                    if page::too_small::<u32>(&page.read()) && my_ix >= 0 {
                        let left_nr = {
                            let pbuf = parent_page.read();
                            if my_ix > 0 {
                                page::get_value::<u32>(&pbuf, (my_ix - 1) as usize)
                            } else {
                                pbuf.link
                            }
                        };
                        let left = self.pager.load(left_nr)?;
                        self.branch_underflow(&left, &page, my_ix as usize, parent_page)?;
                    }
                }
            }

            Ok(erased)
        } else {
            if kind != V::LEAF_KIND {
                return Err(Error::corruption(format!(
                    "unexpected {kind:?} page in tree descent"
                )));
            }

            let (ix, matched) = {
                let buf = page.read();
                page::binary_search(&buf, key, self.order)
            };
            if !matched {
                return Ok(false);
            }

            {
                let mut buf = page.write();
                page::erase_entry::<V>(&mut buf, ix as usize);
            }

            if let Some((parent_page, my_ix)) = parent {
                // the erased key opened this leaf; a branch page upstream may
                // carry it as a separator
                if ix == 0 && page.read().n > 0 {
                    if let Some((link_page, link_ix)) = &link_ctx {
                        let new_key = {
                            let buf = page.read();
                            page::get_key(&buf, 0).to_vec()
                        };
                        let mut lbuf = link_page.write();
                        let old_len = page::get_key(&lbuf, *link_ix).len() as i64;
                        let delta = new_key.len() as i64 - old_len;
                        // if the replacement does not fit, the stale
                        // separator stays; it remains a valid lower bound
                        if delta < 0 || delta < page::free::<u32>(&lbuf) as i64 {
                            page::replace_key(&mut lbuf, *link_ix, &new_key);
                        }
                    }
                }

                if page::too_small::<V>(&page.read()) {
                    let parent_n = parent_page.read().n as i32;
                    if my_ix + 1 < parent_n {
                        let right_nr = {
                            let pbuf = parent_page.read();
                            page::get_value::<u32>(&pbuf, (my_ix + 1) as usize)
                        };
                        let right = self.pager.load(right_nr)?;
                        self.leaf_underflow(&page, &right, (my_ix + 1) as usize, parent_page)?;
                    }
                    if page::too_small::<V>(&page.read()) && my_ix >= 0 {
                        let left_nr = {
                            let pbuf = parent_page.read();
                            if my_ix > 0 {
                                page::get_value::<u32>(&pbuf, (my_ix - 1) as usize)
                            } else {
                                pbuf.link
                            }
                        };
                        let left = self.pager.load(left_nr)?;
                        self.leaf_underflow(&left, &page, my_ix as usize, parent_page)?;
                    }
                }
            }

            Ok(true)
        }
    }

    /// `left` and `right` are adjacent leaves; `sep_ix` is the separator in
    /// `parent` between them. Merge when both fit in one page, otherwise
    /// shift entries toward the underfull side.
    fn leaf_underflow(
        &self,
        left: &PageRef,
        right: &PageRef,
        sep_ix: usize,
        parent: &PageRef,
    ) -> Result<()> {
        let mut lbuf = left.write();
        let mut rbuf = right.write();
        let usable = lbuf.body.len();
        let max = page::max_entries::<V>(usable);

        if page::free::<V>(&lbuf) + page::free::<V>(&rbuf) >= usable
            && lbuf.n as usize + rbuf.n as usize <= max
        {
            let at = lbuf.n as usize;
            let count = rbuf.n as usize;
            page::move_entries::<V>(&mut rbuf, &mut lbuf, 0, at, count);
            lbuf.link = rbuf.link;
            lbuf.dirty = true;
            rbuf.deallocate();

            let mut pbuf = parent.write();
            page::erase_entry::<u32>(&mut pbuf, sep_ix);
            return Ok(());
        }

        let (p_key_len, p_free) = {
            let pbuf = parent.read();
            (page::get_key(&pbuf, sep_ix).len() as i64, page::free::<u32>(&pbuf) as i64)
        };

        if page::free::<V>(&lbuf) > page::free::<V>(&rbuf) && (lbuf.n as usize) < max {
            // move leading entries of right into left
            let mut needed =
                (page::free::<V>(&lbuf) as i64 - page::free::<V>(&rbuf) as i64) / 2;
            let mut n = 0usize;
            let mut ln = 0usize;
            while n < rbuf.n as usize
                && n + lbuf.n as usize + 1 <= max
                && needed > page::get_key(&rbuf, n).len() as i64
            {
                let key_len = page::get_key(&rbuf, n).len() as i64;
                n += 1;
                if key_len - p_key_len + p_free > 0 {
                    ln = n;
                }
                needed -= key_len + 1 + V::SIZE as i64;
            }
            // the new separator must fit in the parent and right must keep
            // at least one entry
            if ln > 0 && ln < rbuf.n as usize {
                let candidate = page::get_key(&rbuf, ln).to_vec();
                let delta = candidate.len() as i64 - p_key_len;
                if delta <= p_free {
                    let at = lbuf.n as usize;
                    page::move_entries::<V>(&mut rbuf, &mut lbuf, 0, at, ln);
                    let mut pbuf = parent.write();
                    page::replace_key(&mut pbuf, sep_ix, &candidate);
                }
            }
        } else if page::free::<V>(&rbuf) > page::free::<V>(&lbuf) && (rbuf.n as usize) < max {
            // move trailing entries of left into right
            let mut needed =
                (page::free::<V>(&rbuf) as i64 - page::free::<V>(&lbuf) as i64) / 2;
            let mut n = 0usize;
            let mut ln = 0usize;
            while n < lbuf.n as usize
                && n + rbuf.n as usize + 1 <= max
                && needed > page::get_key(&lbuf, lbuf.n as usize - 1 - n).len() as i64
            {
                let key_len = page::get_key(&lbuf, lbuf.n as usize - 1 - n).len() as i64;
                n += 1;
                if key_len - p_key_len + p_free > 0 {
                    ln = n;
                }
                needed -= key_len + 1 + V::SIZE as i64;
            }
            if ln > 0 && ln < lbuf.n as usize {
                let from = lbuf.n as usize - ln;
                let candidate = page::get_key(&lbuf, from).to_vec();
                let delta = candidate.len() as i64 - p_key_len;
                if delta <= p_free {
                    page::move_entries::<V>(&mut lbuf, &mut rbuf, from, 0, ln);
                    let mut pbuf = parent.write();
                    page::replace_key(&mut pbuf, sep_ix, &candidate);
                }
            }
        }

        Ok(())
    }

    /// Branch variant: the separator travels down on merge or rotation.
    fn branch_underflow(
        &self,
        left: &PageRef,
        right: &PageRef,
        sep_ix: usize,
        parent: &PageRef,
    ) -> Result<()> {
        let mut lbuf = left.write();
        let mut rbuf = right.write();
        let usable = lbuf.body.len();
        let max = page::max_entries::<u32>(usable);

        let p_key = {
            let pbuf = parent.read();
            page::get_key(&pbuf, sep_ix).to_vec()
        };

        let merged_fits = page::free::<u32>(&lbuf) as i64 + page::free::<u32>(&rbuf) as i64
            - p_key.len() as i64
            - 5
            >= usable as i64;
        if merged_fits && lbuf.n as usize + rbuf.n as usize + 1 <= max {
            let at = lbuf.n as usize;
            let r_link = rbuf.link;
            page::insert_key_value::<u32>(&mut lbuf, &p_key, &r_link, at);
            let count = rbuf.n as usize;
            let at = lbuf.n as usize;
            page::move_entries::<u32>(&mut rbuf, &mut lbuf, 0, at, count);
            rbuf.deallocate();

            let mut pbuf = parent.write();
            page::erase_entry::<u32>(&mut pbuf, sep_ix);
            return Ok(());
        }

        if page::free::<u32>(&lbuf) > page::free::<u32>(&rbuf)
            && (lbuf.n as usize) < max
            && rbuf.n > 1
            && page::can_store::<u32>(&lbuf, &p_key)
        {
            // rotate the leading entry of right through the parent
            let r_key = page::get_key(&rbuf, 0).to_vec();
            let delta = r_key.len() as i64 - p_key.len() as i64;
            let p_free = parent.read();
            let p_free = page::free::<u32>(&p_free) as i64;
            if delta <= p_free {
                let at = lbuf.n as usize;
                let r_link = rbuf.link;
                page::insert_key_value::<u32>(&mut lbuf, &p_key, &r_link, at);
                {
                    let mut pbuf = parent.write();
                    page::replace_key(&mut pbuf, sep_ix, &r_key);
                }
                rbuf.link = page::get_value::<u32>(&rbuf, 0);
                page::erase_entry::<u32>(&mut rbuf, 0);
                rbuf.dirty = true;
            }
        } else if page::free::<u32>(&rbuf) > page::free::<u32>(&lbuf)
            && (rbuf.n as usize) < max
            && lbuf.n > 1
            && page::can_store::<u32>(&rbuf, &p_key)
        {
            let l_key = page::get_key(&lbuf, lbuf.n as usize - 1).to_vec();
            let delta = l_key.len() as i64 - p_key.len() as i64;
            let p_free = parent.read();
            let p_free = page::free::<u32>(&p_free) as i64;
            if delta <= p_free {
                let r_link = rbuf.link;
                page::insert_key_value::<u32>(&mut rbuf, &p_key, &r_link, 0);
                rbuf.link = page::get_value::<u32>(&lbuf, lbuf.n as usize - 1);
                rbuf.dirty = true;
                {
                    let mut pbuf = parent.write();
                    page::replace_key(&mut pbuf, sep_ix, &l_key);
                }
                let last = lbuf.n as usize - 1;
                page::erase_entry::<u32>(&mut lbuf, last);
            }
        }

        Ok(())
    }

    fn leftmost_leaf(&self) -> Result<u32> {
        let mut page_nr = self.pager.header().root;
        while page_nr != 0 {
            let page = self.pager.load(page_nr)?;
            let buf = page.read();
            if buf.kind != PageKind::Branch {
                return Ok(page_nr);
            }
            page_nr = buf.link;
        }
        Ok(0)
    }

    /// Cursor positioned at the first entry.
    pub fn cursor(&self) -> Result<TreeCursor<V>> {
        let leaf = self.leftmost_leaf()?;
        Ok(TreeCursor {
            pager: self.pager.clone(),
            page_nr: leaf,
            index: 0,
            _value: PhantomData,
        })
    }

    /// Cursor positioned at the first entry whose key is >= `lo`.
    pub fn cursor_at(&self, lo: &[u8]) -> Result<TreeCursor<V>> {
        let mut page_nr = self.pager.header().root;
        while page_nr != 0 {
            let page = self.pager.load(page_nr)?;
            let buf = page.read();
            if buf.kind != PageKind::Branch {
                break;
            }
            let (ix, _) = page::binary_search(&buf, lo, self.order);
            page_nr = if ix < 0 {
                buf.link
            } else {
                page::get_value::<u32>(&buf, ix as usize)
            };
        }

        if page_nr == 0 {
            return Ok(TreeCursor {
                pager: self.pager.clone(),
                page_nr: 0,
                index: 0,
                _value: PhantomData,
            });
        }

        let page = self.pager.load(page_nr)?;
        let buf = page.read();
        let (ix, matched) = page::binary_search(&buf, lo, self.order);
        let index = if matched { ix as usize } else { (ix + 1) as usize };
        Ok(TreeCursor {
            pager: self.pager.clone(),
            page_nr,
            index,
            _value: PhantomData,
        })
    }

    /// Values of every key matching a `?`/`*` glob, in key order.
    pub fn pattern(&self, glob: &[u8]) -> Result<Vec<(Vec<u8>, V)>> {
        let mut out = Vec::new();
        let mut cursor = self.cursor()?;
        while let Some((key, value)) = cursor.next()? {
            if super::glob::glob_match(glob, &key) {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    /// Check tree structure: page kinds, in-page and cross-page key order,
    /// occupancy of non-root pages, and the entry count against the header.
    pub fn validate(&self) -> Result<()> {
        let header = self.pager.header();
        if header.root == 0 {
            if header.size != 0 {
                return Err(Error::corruption("empty tree with non-zero size"));
            }
            return Ok(());
        }

        let count = self.validate_page(header.root, None, header.depth, true)?;
        if count != header.size {
            return Err(Error::corruption(format!(
                "tree holds {count} entries, header says {}",
                header.size
            )));
        }

        // leaf chain must cover all keys in ascending order
        let mut cursor = self.cursor()?;
        let mut last: Option<Vec<u8>> = None;
        let mut seen = 0u32;
        while let Some((key, _)) = cursor.next()? {
            if let Some(prev) = &last {
                if self.order.compare(prev, &key) != std::cmp::Ordering::Less {
                    return Err(Error::corruption("leaf chain out of order"));
                }
            }
            last = Some(key);
            seen += 1;
        }
        if seen != header.size {
            return Err(Error::corruption("leaf chain does not cover all entries"));
        }

        Ok(())
    }

    fn validate_page(
        &self,
        page_nr: u32,
        lower: Option<&[u8]>,
        depth: u32,
        is_root: bool,
    ) -> Result<u32> {
        let page = self.pager.load(page_nr)?;
        let buf = page.read();

        if depth == 0 {
            return Err(Error::corruption("tree deeper than header depth"));
        }

        for i in 1..buf.n as usize {
            if self.order.compare(page::get_key(&buf, i - 1), page::get_key(&buf, i))
                != std::cmp::Ordering::Less
            {
                return Err(Error::corruption(format!("page {page_nr} keys out of order")));
            }
        }

        match buf.kind {
            PageKind::Branch => {
                if page::too_small::<u32>(&buf) && !is_root {
                    return Err(Error::corruption(format!("branch page {page_nr} under half full")));
                }
                let mut count =
                    self.validate_page(buf.link, lower, depth - 1, false)?;
                for i in 0..buf.n as usize {
                    let key = page::get_key(&buf, i);
                    let child = page::get_value::<u32>(&buf, i);
                    count += self.validate_page(child, Some(key), depth - 1, false)?;
                }
                Ok(count)
            }
            kind if kind == V::LEAF_KIND => {
                if depth != 1 {
                    return Err(Error::corruption("leaf above the bottom level"));
                }
                if page::too_small::<V>(&buf) && !is_root {
                    return Err(Error::corruption(format!("leaf page {page_nr} under half full")));
                }
                if buf.n > 0 {
                    if let Some(lo) = lower {
                        // separators are lower bounds; they may be stale but
                        // never exceed the first key
                        if self.order.compare(lo, page::get_key(&buf, 0))
                            == std::cmp::Ordering::Greater
                        {
                            return Err(Error::corruption(format!(
                                "separator above first key of leaf {page_nr}"
                            )));
                        }
                    }
                }
                Ok(buf.n as u32)
            }
            kind => Err(Error::corruption(format!("unexpected {kind:?} page in tree"))),
        }
    }

    /// Write a textual rendering of the tree, one line per page.
    pub fn dump(&self, out: &mut dyn Write) -> Result<()> {
        let header = self.pager.header();
        writeln!(out, "tree: size={} depth={} root={}", header.size, header.depth, header.root)?;
        if header.root != 0 {
            self.dump_page(out, header.root, 0)?;
        }
        Ok(())
    }

    fn dump_page(&self, out: &mut dyn Write, page_nr: u32, level: usize) -> Result<()> {
        let page = self.pager.load(page_nr)?;
        let buf = page.read();
        let prefix = "  ".repeat(level);

        match buf.kind {
            PageKind::Branch => {
                write!(out, "{prefix}branch {page_nr}; n={}: {{", buf.n)?;
                for i in 0..buf.n as usize {
                    let key = String::from_utf8_lossy(page::get_key(&buf, i)).into_owned();
                    write!(out, "{}{key}", if i > 0 { ", " } else { "" })?;
                }
                writeln!(out, "}}")?;
                let link = buf.link;
                let children: Vec<u32> = (0..buf.n as usize)
                    .map(|i| page::get_value::<u32>(&buf, i))
                    .collect();
                drop(buf);
                self.dump_page(out, link, level + 1)?;
                for child in children {
                    self.dump_page(out, child, level + 1)?;
                }
            }
            _ => {
                write!(out, "{prefix}leaf {page_nr}; n={}: [", buf.n)?;
                for i in 0..buf.n as usize {
                    let key = String::from_utf8_lossy(page::get_key(&buf, i)).into_owned();
                    write!(out, "{}{key}", if i > 0 { ", " } else { "" })?;
                }
                writeln!(out, "] link={}", buf.link)?;
            }
        }
        Ok(())
    }

    /// Sorted bulk loader for an empty tree: packed leaves, branch levels
    /// built bottom-up. Used by batch finalization and vacuum.
    pub fn bulk_append(&self) -> Result<BulkAppend<'_, V>> {
        if self.pager.header().root != 0 {
            return Err(Error::invariant("bulk load requires an empty tree"));
        }
        Ok(BulkAppend {
            tree: self,
            leaf: None,
            up: Vec::new(),
            last_key: None,
            count: 0,
        })
    }
}

fn drop_last_entry(buf: &mut crate::storage::PageBuf) {
    buf.n -= 1;
    buf.key_offsets.truncate(buf.n as usize + 1);
    buf.dirty = true;
}

/// Forward scan over the leaf chain.
pub struct TreeCursor<V: IndexValue> {
    pager: Arc<Pager>,
    page_nr: u32,
    index: usize,
    _value: PhantomData<V>,
}

impl<V: IndexValue> TreeCursor<V> {
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, V)>> {
        loop {
            if self.page_nr == 0 {
                return Ok(None);
            }
            let page = self.pager.load(self.page_nr)?;
            let buf = page.read();
            if self.index < buf.n as usize {
                let key = page::get_key(&buf, self.index).to_vec();
                let value = page::get_value::<V>(&buf, self.index);
                self.index += 1;
                return Ok(Some((key, value)));
            }
            self.page_nr = buf.link;
            self.index = 0;
        }
    }
}

/// See [`BTree::bulk_append`].
pub struct BulkAppend<'a, V: IndexValue> {
    tree: &'a BTree<V>,
    leaf: Option<(u32, PageRef)>,
    /// First key and page nr of every leaf, for branch construction.
    up: Vec<(Vec<u8>, u32)>,
    last_key: Option<Vec<u8>>,
    count: u32,
}

impl<V: IndexValue> BulkAppend<'_, V> {
    pub fn push(&mut self, key: &[u8], value: &V) -> Result<()> {
        BTree::<V>::check_key(key)?;
        if let Some(last) = &self.last_key {
            if self.tree.order.compare(last, key) != std::cmp::Ordering::Less {
                return Err(Error::invariant("bulk load input not sorted"));
            }
        }
        self.last_key = Some(key.to_vec());

        if self.leaf.is_none() {
            let (nr, page) = self.tree.pager.allocate(V::LEAF_KIND)?;
            self.up.push((Vec::new(), nr));
            self.leaf = Some((nr, page));
        }

        let (_, page) = self.leaf.as_ref().unwrap();
        if !page::can_store::<V>(&page.read(), key) {
            let (nr, next) = self.tree.pager.allocate(V::LEAF_KIND)?;
            page.write().link = nr;
            self.up.push((key.to_vec(), nr));
            self.leaf = Some((nr, next));
        }

        let (_, page) = self.leaf.as_ref().unwrap();
        let mut buf = page.write();
        let at = buf.n as usize;
        page::insert_key_value(&mut buf, key, value, at);
        self.count += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        let BulkAppend { tree, up, count, .. } = self;

        if up.is_empty() {
            tree.pager.commit()?;
            return Ok(());
        }

        let mut depth = 1u32;
        let mut level: VecDeque<(Vec<u8>, u32)> = up.into();

        while level.len() > 1 {
            depth += 1;
            let mut next_level: VecDeque<(Vec<u8>, u32)> = VecDeque::new();

            let first = level.pop_front().unwrap();
            let (page_nr, mut page) = tree.pager.allocate(PageKind::Branch)?;
            page.write().link = first.1;
            next_level.push_back((first.0, page_nr));

            while let Some(tuple) = level.front().cloned() {
                let fits = page::can_store::<u32>(&page.read(), &tuple.0);
                if fits {
                    if level.len() == 1 {
                        let mut buf = page.write();
                        let at = buf.n as usize;
                        page::insert_key_value::<u32>(&mut buf, &tuple.0, &tuple.1, at);
                        level.pop_front();
                        break;
                    }
                    if level.len() == 2 {
                        // store both only when they fit together, so the
                        // trailing page is never left empty
                        let both_fit = {
                            let buf = page.read();
                            (buf.n as usize + 2) <= page::max_entries::<u32>(buf.body.len())
                                && page::free::<u32>(&buf)
                                    >= level[0].0.len() + level[1].0.len() + 2 + 8
                        };
                        if both_fit {
                            let mut buf = page.write();
                            for t in level.drain(..) {
                                let at = buf.n as usize;
                                page::insert_key_value::<u32>(&mut buf, &t.0, &t.1, at);
                            }
                            break;
                        }
                    } else {
                        let mut buf = page.write();
                        let at = buf.n as usize;
                        page::insert_key_value::<u32>(&mut buf, &tuple.0, &tuple.1, at);
                        level.pop_front();
                        continue;
                    }
                }

                // open a fresh branch page with this tuple as its link
                let tuple = level.pop_front().unwrap();
                let (nr, next) = tree.pager.allocate(PageKind::Branch)?;
                next.write().link = tuple.1;
                next_level.push_back((tuple.0, nr));
                page = next;
            }

            level = next_level;
        }

        let root = level.pop_front().map(|t| t.1).unwrap_or(0);
        tree.pager.update_header(|h| {
            h.root = root;
            h.depth = depth;
            h.size = count;
        });
        tree.pager.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::OpenMode;
    use std::collections::BTreeMap;

    fn temp_tree(page_size: usize) -> (tempfile::TempDir, BTree<u32>) {
        let dir = tempfile::tempdir().unwrap();
        let pager = Arc::new(Pager::create(&dir.path().join("t.ix"), page_size).unwrap());
        let tree = BTree::new(pager, KeyOrder::Lexical);
        tree.set_auto_commit(false);
        (dir, tree)
    }

    #[test]
    fn insert_and_find_thousand_keys() {
        let (_dir, tree) = temp_tree(256);
        for i in 1..=1000u32 {
            let key = format!("id_{i:05}");
            assert!(tree.insert(key.as_bytes(), &i).unwrap());
        }
        assert_eq!(tree.size(), 1000);
        assert!(tree.depth() > 1);

        assert_eq!(tree.find(b"id_00500").unwrap(), Some(500));
        assert_eq!(tree.find(b"id_01000").unwrap(), Some(1000));
        assert_eq!(tree.find(b"id_00000").unwrap(), None);
        assert_eq!(tree.find(b"nope").unwrap(), None);

        tree.validate().unwrap();
    }

    #[test]
    fn insert_updates_existing_key() {
        let (_dir, tree) = temp_tree(256);
        assert!(tree.insert(b"key", &1).unwrap());
        assert!(!tree.insert(b"key", &2).unwrap());
        assert_eq!(tree.size(), 1);
        assert_eq!(tree.find(b"key").unwrap(), Some(2));
    }

    #[test]
    fn erase_to_empty() {
        let (_dir, tree) = temp_tree(256);
        for i in 1..=100u32 {
            tree.insert(format!("k{i:03}").as_bytes(), &i).unwrap();
        }
        for i in 1..=100u32 {
            assert!(tree.erase(format!("k{i:03}").as_bytes()).unwrap(), "k{i:03}");
            tree.validate().unwrap();
        }
        assert_eq!(tree.size(), 0);
        assert!(!tree.erase(b"k001").unwrap());
    }

    #[test]
    fn cursor_yields_sorted_keys() {
        let (_dir, tree) = temp_tree(256);
        let mut keys: Vec<String> = (0..300u32).map(|i| format!("w{:04}", (i * 7919) % 10000)).collect();
        for (i, key) in keys.iter().enumerate() {
            tree.insert(key.as_bytes(), &(i as u32 + 1)).unwrap();
        }
        keys.sort();
        keys.dedup();

        let mut cursor = tree.cursor().unwrap();
        let mut seen = Vec::new();
        while let Some((key, _)) = cursor.next().unwrap() {
            seen.push(String::from_utf8(key).unwrap());
        }
        assert_eq!(seen, keys);
    }

    #[test]
    fn random_interleaved_inserts_and_erases() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let (_dir, tree) = temp_tree(256);
        let mut rng = StdRng::seed_from_u64(42);
        let mut model: BTreeMap<Vec<u8>, u32> = BTreeMap::new();

        for round in 0..3000u32 {
            let len = rng.gen_range(1..20);
            let key: Vec<u8> = (0..len).map(|_| rng.gen_range(b'a'..=b'f')).collect();
            if rng.gen_bool(0.6) {
                tree.insert(&key, &round).unwrap();
                model.insert(key, round);
            } else {
                let erased = tree.erase(&key).unwrap();
                assert_eq!(erased, model.remove(&key).is_some());
            }
        }

        assert_eq!(tree.size() as usize, model.len());
        for (key, value) in &model {
            assert_eq!(tree.find(key).unwrap(), Some(*value), "{}", String::from_utf8_lossy(key));
        }
        tree.validate().unwrap();

        // the range scan covers exactly the live keys in order
        let mut cursor = tree.cursor().unwrap();
        let mut seen = Vec::new();
        while let Some((key, _)) = cursor.next().unwrap() {
            seen.push(key);
        }
        let expected: Vec<Vec<u8>> = model.keys().cloned().collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn survives_commit_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.ix");
        {
            let pager = Arc::new(Pager::create(&path, 256).unwrap());
            let tree: BTree<u32> = BTree::new(pager, KeyOrder::Lexical);
            tree.set_auto_commit(false);
            for i in 1..=500u32 {
                tree.insert(format!("key{i:04}").as_bytes(), &i).unwrap();
            }
            tree.commit().unwrap();
        }
        let pager = Arc::new(Pager::open(&path, 256, OpenMode::ReadOnly).unwrap());
        let tree: BTree<u32> = BTree::new(pager, KeyOrder::Lexical);
        assert_eq!(tree.size(), 500);
        assert_eq!(tree.find(b"key0250").unwrap(), Some(250));
        tree.validate().unwrap();
    }

    #[test]
    fn bulk_append_builds_a_valid_tree() {
        let (_dir, tree) = temp_tree(256);
        {
            let mut bulk = tree.bulk_append().unwrap();
            for i in 1..=2000u32 {
                bulk.push(format!("entry{i:06}").as_bytes(), &i).unwrap();
            }
            bulk.finish().unwrap();
        }
        assert_eq!(tree.size(), 2000);
        tree.validate().unwrap();
        assert_eq!(tree.find(b"entry001234").unwrap(), Some(1234));

        let mut cursor = tree.cursor_at(b"entry001998").unwrap();
        let mut tail = Vec::new();
        while let Some((key, _)) = cursor.next().unwrap() {
            tail.push(String::from_utf8(key).unwrap());
        }
        assert_eq!(tail, vec!["entry001998", "entry001999", "entry002000"]);
    }

    #[test]
    fn bulk_append_rejects_unsorted_input() {
        let (_dir, tree) = temp_tree(256);
        let mut bulk = tree.bulk_append().unwrap();
        bulk.push(b"bbb", &1).unwrap();
        assert!(bulk.push(b"aaa", &2).is_err());
    }

    #[test]
    fn pattern_matches_globs() {
        let (_dir, tree) = temp_tree(256);
        for (i, key) in ["apple", "apricot", "banana", "cherry", "avocado"].iter().enumerate() {
            tree.insert(key.as_bytes(), &(i as u32 + 1)).unwrap();
        }
        let hits = tree.pattern(b"ap*").unwrap();
        let keys: Vec<&str> =
            hits.iter().map(|(k, _)| std::str::from_utf8(k).unwrap()).collect();
        assert_eq!(keys, vec!["apple", "apricot"]);

        let hits = tree.pattern(b"a*o*").unwrap();
        let keys: Vec<&str> =
            hits.iter().map(|(k, _)| std::str::from_utf8(k).unwrap()).collect();
        assert_eq!(keys, vec!["apricot", "avocado"]);
    }

    #[test]
    fn numeric_tree_orders_by_magnitude() {
        let dir = tempfile::tempdir().unwrap();
        let pager = Arc::new(Pager::create(&dir.path().join("n.ix"), 256).unwrap());
        let tree: BTree<u32> = BTree::new(pager, KeyOrder::Numeric);
        tree.set_auto_commit(false);
        for v in [5u32, 40, 7, 100, 9, 12] {
            tree.insert(v.to_string().as_bytes(), &v).unwrap();
        }
        let mut cursor = tree.cursor().unwrap();
        let mut seen = Vec::new();
        while let Some((_, v)) = cursor.next().unwrap() {
            seen.push(v);
        }
        assert_eq!(seen, vec![5, 7, 9, 12, 40, 100]);
    }
}

