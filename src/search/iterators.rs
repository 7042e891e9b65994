use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::sync::Arc;

use roaring::RoaringBitmap;

use crate::bitstream::IbitStream;
use crate::compression::{read_array, CompressedArrayIterator};
use crate::core::error::Result;
use crate::core::types::DocNr;

/// Lazy stream of `(doc_nr, rank)` pairs with doc-nrs monotone
/// non-decreasing. `count` is a best-effort upper bound on remaining hits.
pub trait DocIterator: Send {
    fn next(&mut self) -> Result<Option<(DocNr, f32)>>;
    fn count(&self) -> u32;
    fn ranked(&self) -> bool {
        false
    }
}

pub type BoxedDocIterator = Box<dyn DocIterator>;

/// Drain an iterator into a plain doc-nr list.
pub fn collect_docs(mut iter: BoxedDocIterator) -> Result<Vec<DocNr>> {
    let mut out = Vec::new();
    while let Some((doc, _)) = iter.next()? {
        out.push(doc);
    }
    Ok(out)
}

/// Keep only the entries of `docs` (sorted ascending) that `filter` also
/// yields. Used to restrict ranked results by a boolean filter.
pub fn intersect_with(docs: &mut Vec<DocNr>, filter: &mut dyn DocIterator) -> Result<()> {
    let input = std::mem::take(docs);
    docs.reserve(input.len());

    let mut current = filter.next()?;
    let mut it = input.into_iter();
    let mut doc = it.next();

    while let (Some(d), Some((f, _))) = (doc, current) {
        match d.cmp(&f) {
            Ordering::Equal => {
                docs.push(d);
                doc = it.next();
                current = filter.next()?;
            }
            Ordering::Less => doc = it.next(),
            Ordering::Greater => current = filter.next()?,
        }
    }
    Ok(())
}

// --------------------------------------------------------------------

pub struct AllDocIterator {
    cur: DocNr,
    max: DocNr,
}

impl AllDocIterator {
    pub fn new(max: DocNr) -> Self {
        AllDocIterator { cur: 1, max }
    }
}

impl DocIterator for AllDocIterator {
    fn next(&mut self) -> Result<Option<(DocNr, f32)>> {
        if self.cur > self.max {
            return Ok(None);
        }
        let doc = self.cur;
        self.cur += 1;
        Ok(Some((doc, 1.0)))
    }

    fn count(&self) -> u32 {
        self.max.saturating_sub(self.cur - 1)
    }
}

pub struct NoDocIterator;

impl DocIterator for NoDocIterator {
    fn next(&mut self) -> Result<Option<(DocNr, f32)>> {
        Ok(None)
    }

    fn count(&self) -> u32 {
        0
    }
}

pub struct SingleDocIterator {
    doc: DocNr,
    rank: f32,
}

impl SingleDocIterator {
    pub fn new(doc: DocNr) -> Self {
        SingleDocIterator { doc, rank: 1.0 }
    }
}

impl DocIterator for SingleDocIterator {
    fn next(&mut self) -> Result<Option<(DocNr, f32)>> {
        if self.doc == 0 {
            return Ok(None);
        }
        let doc = self.doc;
        self.doc = 0;
        Ok(Some((doc, self.rank)))
    }

    fn count(&self) -> u32 {
        u32::from(self.doc != 0)
    }
}

/// Iterator over a precomputed `(doc, rank)` vector, in the vector's order.
/// Ranked result lists come back through this to rejoin boolean composition.
pub struct VectorIterator {
    docs: std::vec::IntoIter<(DocNr, f32)>,
    remaining: u32,
    ranked: bool,
}

impl VectorIterator {
    pub fn new_ranked(docs: Vec<(DocNr, f32)>) -> Self {
        let remaining = docs.len() as u32;
        VectorIterator { docs: docs.into_iter(), remaining, ranked: true }
    }

    pub fn from_docs(docs: Vec<DocNr>) -> Self {
        let remaining = docs.len() as u32;
        let pairs: Vec<(DocNr, f32)> = docs.into_iter().map(|d| (d, 1.0)).collect();
        VectorIterator { docs: pairs.into_iter(), remaining, ranked: false }
    }
}

impl DocIterator for VectorIterator {
    fn next(&mut self) -> Result<Option<(DocNr, f32)>> {
        match self.docs.next() {
            Some(pair) => {
                self.remaining -= 1;
                Ok(Some(pair))
            }
            None => Ok(None),
        }
    }

    fn count(&self) -> u32 {
        self.remaining
    }

    fn ranked(&self) -> bool {
        self.ranked
    }
}

/// Stream over one compressed posting list.
pub struct MultiDocIterator {
    iter: CompressedArrayIterator,
}

impl MultiDocIterator {
    pub fn new(bits: IbitStream, length: u32) -> Self {
        MultiDocIterator { iter: CompressedArrayIterator::new(bits, length) }
    }

    pub fn from_iter(iter: CompressedArrayIterator) -> Self {
        MultiDocIterator { iter }
    }
}

impl DocIterator for MultiDocIterator {
    fn next(&mut self) -> Result<Option<(DocNr, f32)>> {
        Ok(self.iter.next()?.map(|doc| (doc, 1.0)))
    }

    fn count(&self) -> u32 {
        self.iter.remaining()
    }
}

/// Complement of an iterator against `[1, max]`.
pub struct NotIterator {
    iter: Option<BoxedDocIterator>,
    cur: DocNr,
    excluded: DocNr,
    max: DocNr,
    count: u32,
    primed: bool,
}

impl NotIterator {
    pub fn new(iter: BoxedDocIterator, max: DocNr) -> Self {
        let count = max.saturating_sub(iter.count());
        NotIterator { iter: Some(iter), cur: 0, excluded: 0, max, count, primed: false }
    }
}

impl DocIterator for NotIterator {
    fn next(&mut self) -> Result<Option<(DocNr, f32)>> {
        if !self.primed {
            self.primed = true;
            self.excluded = match &mut self.iter {
                Some(iter) => iter.next()?.map(|(d, _)| d).unwrap_or(0),
                None => 0,
            };
        }

        loop {
            self.cur += 1;
            if self.cur > self.max {
                return Ok(None);
            }
            if self.excluded == 0 || self.cur < self.excluded {
                return Ok(Some((self.cur, 1.0)));
            }
            // skip this doc and fetch the next excluded one
            self.excluded = match &mut self.iter {
                Some(iter) => iter.next()?.map(|(d, _)| d).unwrap_or(0),
                None => 0,
            };
        }
    }

    fn count(&self) -> u32 {
        self.count
    }
}

// --------------------------------------------------------------------

struct HeapPart {
    iter: BoxedDocIterator,
    doc: DocNr,
}

impl PartialEq for HeapPart {
    fn eq(&self, other: &Self) -> bool {
        self.doc == other.doc
    }
}
impl Eq for HeapPart {}
impl PartialOrd for HeapPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapPart {
    // reversed: BinaryHeap is a max-heap, we want the smallest doc on top
    fn cmp(&self, other: &Self) -> Ordering {
        other.doc.cmp(&self.doc)
    }
}

/// Union with duplicate suppression: a min-heap over the child heads.
pub struct UnionIterator {
    parts: BinaryHeap<HeapPart>,
    count: u32,
}

impl Default for UnionIterator {
    fn default() -> Self {
        Self::new()
    }
}

impl UnionIterator {
    pub fn new() -> Self {
        UnionIterator { parts: BinaryHeap::new(), count: 0 }
    }

    pub fn add(&mut self, mut iter: BoxedDocIterator) -> Result<()> {
        if let Some((doc, _)) = iter.next()? {
            self.count = self.count.saturating_add(iter.count().saturating_add(1));
            self.parts.push(HeapPart { iter, doc });
        }
        Ok(())
    }

    pub fn create(a: Option<BoxedDocIterator>, b: Option<BoxedDocIterator>) -> Result<Option<BoxedDocIterator>> {
        match (a, b) {
            (None, b) => Ok(b),
            (a, None) => Ok(a),
            (Some(a), Some(b)) => {
                let mut union = UnionIterator::new();
                union.add(a)?;
                union.add(b)?;
                Ok(Some(Box::new(union)))
            }
        }
    }
}

impl DocIterator for UnionIterator {
    fn next(&mut self) -> Result<Option<(DocNr, f32)>> {
        let Some(mut head) = self.parts.pop() else {
            return Ok(None);
        };
        let doc = head.doc;

        if let Some((next, _)) = head.iter.next()? {
            head.doc = next;
            self.parts.push(head);
        }

        // swallow equal heads so every doc comes out once
        while let Some(peer) = self.parts.peek() {
            if peer.doc > doc {
                break;
            }
            let mut peer = self.parts.pop().unwrap();
            if let Some((next, _)) = peer.iter.next()? {
                peer.doc = next;
                self.parts.push(peer);
            }
        }

        Ok(Some((doc, 1.0)))
    }

    fn count(&self) -> u32 {
        self.count
    }
}

/// Intersection: advance every child to the largest current head until all
/// heads agree.
pub struct IntersectionIterator {
    parts: Vec<HeapPart>,
    count: u32,
    primed: bool,
    pending: Vec<BoxedDocIterator>,
}

impl Default for IntersectionIterator {
    fn default() -> Self {
        Self::new()
    }
}

impl IntersectionIterator {
    pub fn new() -> Self {
        IntersectionIterator { parts: Vec::new(), count: 0, primed: false, pending: Vec::new() }
    }

    pub fn add(&mut self, iter: BoxedDocIterator) {
        self.count = self.count.max(iter.count());
        self.pending.push(iter);
    }

    pub fn create(a: Option<BoxedDocIterator>, b: Option<BoxedDocIterator>) -> Option<BoxedDocIterator> {
        match (a, b) {
            (Some(a), Some(b)) => {
                let mut isect = IntersectionIterator::new();
                isect.add(a);
                isect.add(b);
                Some(Box::new(isect))
            }
            _ => None,
        }
    }

    fn prime(&mut self) -> Result<()> {
        self.primed = true;
        for mut iter in self.pending.drain(..) {
            match iter.next()? {
                Some((doc, _)) => self.parts.push(HeapPart { iter, doc }),
                None => {
                    // one empty leg empties the whole intersection
                    self.parts.clear();
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

impl DocIterator for IntersectionIterator {
    fn next(&mut self) -> Result<Option<(DocNr, f32)>> {
        if !self.primed {
            self.prime()?;
        }

        loop {
            if self.parts.is_empty() {
                return Ok(None);
            }
            let target = self.parts.iter().map(|p| p.doc).max().unwrap_or(0);

            let mut all_equal = true;
            let mut exhausted = false;
            for i in 0..self.parts.len() {
                let part = &mut self.parts[i];
                while part.doc < target {
                    match part.iter.next()? {
                        Some((doc, _)) => part.doc = doc,
                        None => {
                            exhausted = true;
                            break;
                        }
                    }
                }
                if exhausted {
                    break;
                }
                all_equal = all_equal && part.doc == target;
            }
            if exhausted {
                self.parts.clear();
                return Ok(None);
            }

            if all_equal {
                // advance everyone past the hit for the next round
                for i in 0..self.parts.len() {
                    match self.parts[i].iter.next()? {
                        Some((doc, _)) => self.parts[i].doc = doc,
                        None => {
                            exhausted = true;
                            break;
                        }
                    }
                }
                if exhausted {
                    self.parts.clear();
                }
                return Ok(Some((target, 1.0)));
            }
        }
    }

    fn count(&self) -> u32 {
        self.count
    }
}

// --------------------------------------------------------------------

struct PhrasePart {
    iter: BoxedDocIterator,
    bits: IbitStream,
    /// 0-based position of this term within the phrase.
    phrase_index: u32,
    doc: DocNr,
    /// Positions of the current doc, shifted left by `phrase_index`.
    positions: Vec<i64>,
}

impl PhrasePart {
    fn read_positions(&mut self) -> Result<()> {
        let raw = read_array(&mut self.bits)?;
        self.positions = raw
            .into_iter()
            .map(|p| p as i64 - self.phrase_index as i64)
            .collect();
        Ok(())
    }

    fn advance(&mut self) -> Result<bool> {
        match self.iter.next()? {
            Some((doc, _)) => {
                self.doc = doc;
                self.read_positions()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Adjacency-checked conjunction: a document matches when the per-term
/// position arrays, each shifted by its phrase offset, still intersect.
pub struct PhraseIterator {
    parts: Vec<PhrasePart>,
    count: u32,
}

impl PhraseIterator {
    /// Each entry: the term's posting iterator, the idl file, the byte
    /// offset of the term's position arrays and the term's index in the
    /// phrase.
    pub fn new(
        idl_file: &Arc<File>,
        terms: Vec<(BoxedDocIterator, i64, u32)>,
    ) -> Result<PhraseIterator> {
        let mut parts = Vec::with_capacity(terms.len());
        let mut count = 0;
        let mut ok = true;

        for (iter, idl_offset, phrase_index) in terms {
            let bits = IbitStream::from_file(idl_file.clone(), idl_offset as u64)?;
            let mut part = PhrasePart { iter, bits, phrase_index, doc: 0, positions: Vec::new() };
            if !part.advance()? {
                ok = false;
                break;
            }
            count = count.max(part.iter.count());
            parts.push(part);
        }

        if !ok {
            parts.clear();
        }
        Ok(PhraseIterator { parts, count })
    }
}

impl DocIterator for PhraseIterator {
    fn next(&mut self) -> Result<Option<(DocNr, f32)>> {
        loop {
            if self.parts.is_empty() {
                return Ok(None);
            }
            let target = self.parts.iter().map(|p| p.doc).max().unwrap_or(0);

            let mut exhausted = false;
            for i in 0..self.parts.len() {
                while self.parts[i].doc < target {
                    if !self.parts[i].advance()? {
                        exhausted = true;
                        break;
                    }
                }
                if exhausted {
                    break;
                }
            }
            if exhausted {
                self.parts.clear();
                return Ok(None);
            }

            if self.parts.iter().all(|p| p.doc == target) {
                // intersect the shifted position lists
                let mut common = self.parts[0].positions.clone();
                for part in &self.parts[1..] {
                    let mut merged = Vec::new();
                    let (mut i, mut j) = (0, 0);
                    while i < common.len() && j < part.positions.len() {
                        match common[i].cmp(&part.positions[j]) {
                            Ordering::Equal => {
                                merged.push(common[i]);
                                i += 1;
                                j += 1;
                            }
                            Ordering::Less => i += 1,
                            Ordering::Greater => j += 1,
                        }
                    }
                    common = merged;
                    if common.is_empty() {
                        break;
                    }
                }

                let hit = !common.is_empty();
                for i in 0..self.parts.len() {
                    if !self.parts[i].advance()? {
                        exhausted = true;
                        break;
                    }
                }
                if exhausted {
                    self.parts.clear();
                }
                if hit {
                    return Ok(Some((target, 1.0)));
                }
                if exhausted {
                    return Ok(None);
                }
            }
        }
    }

    fn count(&self) -> u32 {
        self.count
    }
}

/// Scan over a dense hit bitmap, yielding set doc-nrs in order.
pub struct BitmapIterator {
    bitmap: RoaringBitmap,
    index: u32,
}

impl BitmapIterator {
    pub fn new(bitmap: RoaringBitmap) -> Self {
        BitmapIterator { bitmap, index: 0 }
    }
}

impl DocIterator for BitmapIterator {
    fn next(&mut self) -> Result<Option<(DocNr, f32)>> {
        match self.bitmap.select(self.index) {
            Some(doc) => {
                self.index += 1;
                Ok(Some((doc, 1.0)))
            }
            None => Ok(None),
        }
    }

    fn count(&self) -> u32 {
        (self.bitmap.len() as u32).saturating_sub(self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec_iter(docs: &[DocNr]) -> BoxedDocIterator {
        Box::new(VectorIterator::from_docs(docs.to_vec()))
    }

    fn drain(iter: &mut dyn DocIterator) -> Vec<DocNr> {
        let mut out = Vec::new();
        while let Some((doc, _)) = iter.next().unwrap() {
            out.push(doc);
        }
        out
    }

    #[test]
    fn union_is_set_union() {
        let mut union = UnionIterator::new();
        union.add(vec_iter(&[1, 4, 8])).unwrap();
        union.add(vec_iter(&[1, 2, 5, 8, 9])).unwrap();
        assert_eq!(drain(&mut union), vec![1, 2, 4, 5, 8, 9]);
    }

    #[test]
    fn intersection_is_set_intersection() {
        let mut isect = IntersectionIterator::new();
        isect.add(vec_iter(&[1, 4, 8]));
        isect.add(vec_iter(&[1, 2, 5, 8, 9]));
        assert_eq!(drain(&mut isect), vec![1, 8]);
    }

    #[test]
    fn three_way_composition_is_associative() {
        let a = &[2u32, 3, 5, 7, 11][..];
        let b = &[1u32, 3, 5, 9, 11][..];
        let c = &[3u32, 4, 5, 11, 12][..];

        let mut u1 = UnionIterator::new();
        u1.add(vec_iter(a)).unwrap();
        u1.add(vec_iter(b)).unwrap();
        u1.add(vec_iter(c)).unwrap();

        let mut inner = UnionIterator::new();
        inner.add(vec_iter(b)).unwrap();
        inner.add(vec_iter(c)).unwrap();
        let mut u2 = UnionIterator::new();
        u2.add(vec_iter(a)).unwrap();
        u2.add(Box::new(inner)).unwrap();

        assert_eq!(drain(&mut u1), drain(&mut u2));

        let mut i1 = IntersectionIterator::new();
        i1.add(vec_iter(a));
        i1.add(vec_iter(b));
        i1.add(vec_iter(c));
        assert_eq!(drain(&mut i1), vec![3, 5, 11]);
    }

    #[test]
    fn not_is_complement() {
        let mut not = NotIterator::new(vec_iter(&[2, 3, 7]), 8);
        assert_eq!(drain(&mut not), vec![1, 4, 5, 6, 8]);

        let mut not = NotIterator::new(Box::new(NoDocIterator), 3);
        assert_eq!(drain(&mut not), vec![1, 2, 3]);
    }

    #[test]
    fn all_and_single() {
        let mut all = AllDocIterator::new(4);
        assert_eq!(drain(&mut all), vec![1, 2, 3, 4]);

        let mut one = SingleDocIterator::new(9);
        assert_eq!(drain(&mut one), vec![9]);
    }

    #[test]
    fn empty_legs() {
        let mut union = UnionIterator::new();
        union.add(vec_iter(&[])).unwrap();
        union.add(vec_iter(&[5])).unwrap();
        assert_eq!(drain(&mut union), vec![5]);

        let mut isect = IntersectionIterator::new();
        isect.add(vec_iter(&[]));
        isect.add(vec_iter(&[5]));
        assert_eq!(drain(&mut isect), Vec::<DocNr>::new());
    }

    #[test]
    fn intersect_with_filter() {
        let mut docs = vec![1, 3, 5, 7, 9];
        let mut filter = VectorIterator::from_docs(vec![2, 3, 4, 7, 10]);
        intersect_with(&mut docs, &mut filter).unwrap();
        assert_eq!(docs, vec![3, 7]);
    }

    #[test]
    fn bitmap_iterator_yields_set_bits() {
        let mut bitmap = RoaringBitmap::new();
        for doc in [3u32, 17, 904] {
            bitmap.insert(doc);
        }
        let mut iter = BitmapIterator::new(bitmap);
        assert_eq!(drain(&mut iter), vec![3, 17, 904]);
    }

    #[test]
    fn phrase_adjacency() {
        use crate::index::IdlWriter;

        // three documents; phrase "rapid brown" must match docs where the
        // terms are adjacent in order
        //   doc 1: "rapid brown coat"        -> rapid@1 brown@2   (match)
        //   doc 2: "brown rapid"             -> rapid@2 brown@1   (no)
        //   doc 3: "rapid dark brown"        -> rapid@1 brown@3   (no)
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.idl");
        let mut idl = IdlWriter::create(&path).unwrap();

        let rapid_offset = idl.offset();
        idl.append_positions(&[1]).unwrap();
        idl.append_positions(&[2]).unwrap();
        idl.append_positions(&[1]).unwrap();
        idl.finish_key().unwrap();

        let brown_offset = idl.offset();
        idl.append_positions(&[2]).unwrap();
        idl.append_positions(&[1]).unwrap();
        idl.append_positions(&[3]).unwrap();
        idl.finish_key().unwrap();

        let file = idl.finish().unwrap();

        let terms: Vec<(BoxedDocIterator, i64, u32)> = vec![
            (vec_iter(&[1, 2, 3]), rapid_offset, 0),
            (vec_iter(&[1, 2, 3]), brown_offset, 1),
        ];
        let mut phrase = PhraseIterator::new(&file, terms).unwrap();
        assert_eq!(drain(&mut phrase), vec![1]);
    }
}
