use crate::core::types::DocNr;

/// Per-document score accumulator for ranked queries, dense over the
/// doc-nr space of one databank.
pub struct RankAccumulator {
    scores: Vec<f32>,
    terms_hit: Vec<u16>,
}

impl RankAccumulator {
    pub fn new(max_doc_nr: DocNr) -> Self {
        RankAccumulator {
            scores: vec![0.0; max_doc_nr as usize + 1],
            terms_hit: vec![0; max_doc_nr as usize + 1],
        }
    }

    /// Add one term's contribution for a document.
    pub fn add(&mut self, doc: DocNr, score: f32) {
        if let Some(slot) = self.scores.get_mut(doc as usize) {
            *slot += score;
            self.terms_hit[doc as usize] += 1;
        }
    }

    /// Documents with a non-zero score, optionally restricted to those hit
    /// by all `term_count` terms, sorted ascending by doc-nr.
    pub fn matched_docs(&self, term_count: usize, all_terms_required: bool) -> Vec<DocNr> {
        let mut out = Vec::new();
        for doc in 1..self.scores.len() {
            if self.scores[doc] <= 0.0 {
                continue;
            }
            if all_terms_required && (self.terms_hit[doc] as usize) < term_count {
                continue;
            }
            out.push(doc as DocNr);
        }
        out
    }

    pub fn score(&self, doc: DocNr) -> f32 {
        self.scores.get(doc as usize).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Scored {
    doc: DocNr,
    score: f32,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.doc == other.doc
    }
}
impl Eq for Scored {}
impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scored {
    // lowest score on top, so the heap root is the eviction candidate
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| other.doc.cmp(&self.doc))
    }
}

/// Bounded top-K collector: a min-heap of at most `k` scored documents.
pub struct TopDocs {
    k: usize,
    heap: std::collections::BinaryHeap<Scored>,
}

impl TopDocs {
    pub fn new(k: usize) -> Self {
        TopDocs { k: k.max(1), heap: std::collections::BinaryHeap::new() }
    }

    pub fn push(&mut self, doc: DocNr, score: f32) {
        if self.heap.len() < self.k {
            self.heap.push(Scored { doc, score });
            return;
        }
        if let Some(worst) = self.heap.peek() {
            if score > worst.score {
                self.heap.pop();
                self.heap.push(Scored { doc, score });
            }
        }
    }

    /// Results best-first, ranks scaled into [0, 1].
    pub fn into_ranked(self) -> Vec<(DocNr, f32)> {
        let mut out: Vec<Scored> = self.heap.into_vec();
        out.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.doc.cmp(&b.doc)));
        let max = out.first().map(|s| s.score).unwrap_or(0.0);
        out.into_iter()
            .map(|s| (s.doc, if max > 0.0 { s.score / max } else { 0.0 }))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_k_keeps_the_best() {
        let mut top = TopDocs::new(3);
        for (doc, score) in [(1, 0.5), (2, 2.0), (3, 1.0), (4, 3.0), (5, 0.1)] {
            top.push(doc, score);
        }
        let ranked = top.into_ranked();
        let docs: Vec<u32> = ranked.iter().map(|(d, _)| *d).collect();
        assert_eq!(docs, vec![4, 2, 3]);
        assert!((ranked[0].1 - 1.0).abs() < f32::EPSILON);
        assert!(ranked.iter().all(|(_, r)| (0.0..=1.0).contains(r)));
    }

    #[test]
    fn accumulator_tracks_term_hits() {
        let mut acc = RankAccumulator::new(5);
        acc.add(1, 0.7);
        acc.add(1, 0.3);
        acc.add(3, 0.9);

        assert_eq!(acc.matched_docs(2, true), vec![1]);
        assert_eq!(acc.matched_docs(2, false), vec![1, 3]);
        assert!(acc.score(1) > acc.score(3));
        assert_eq!(acc.score(2), 0.0);
    }
}
