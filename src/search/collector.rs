use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::SearchResult;
use crate::util::DocId;

/// One hit: composite doc id plus its score.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreDoc {
    pub doc: DocId,
    pub score: f32,
}

/// Result page of a top-n search.
#[derive(Clone, Debug, Default)]
pub struct TopDocs {
    pub total_hits: u32,
    pub score_docs: Vec<ScoreDoc>,
    pub max_score: f32,
}

/// Sink for (doc, score) pairs produced by scorers. `collect` receives
/// segment-local doc ids; the doc base from `set_next_reader` converts
/// them to composite ids.
pub trait Collector {
    fn set_next_reader(&mut self, doc_base: DocId) -> SearchResult<()>;

    fn collect(&mut self, doc: DocId, score: f32) -> SearchResult<()>;

    /// Collectors that tolerate out-of-order docs let scorers pick faster
    /// evaluation paths.
    fn accepts_docs_out_of_order(&self) -> bool {
        false
    }
}

// heap entry ordered so the weakest hit is on top
struct HeapSlot(ScoreDoc);

impl PartialEq for HeapSlot {
    fn eq(&self, other: &Self) -> bool {
        self.0.score == other.0.score && self.0.doc == other.0.doc
    }
}
impl Eq for HeapSlot {}
impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        // the heap pops its max: make the weakest hit (lowest score,
        // largest doc on ties) compare greatest
        other
            .0
            .score
            .partial_cmp(&self.0.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.0.doc.cmp(&other.0.doc))
    }
}

/// Keeps the `n` best hits in a bounded heap, keyed by score then doc id.
pub struct TopDocsCollector {
    limit: usize,
    heap: BinaryHeap<HeapSlot>,
    doc_base: DocId,
    total_hits: u32,
    max_score: f32,
}

impl TopDocsCollector {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            heap: BinaryHeap::with_capacity(limit.max(1) + 1),
            doc_base: 0,
            total_hits: 0,
            max_score: f32::NEG_INFINITY,
        }
    }

    pub fn into_top_docs(self) -> TopDocs {
        let mut score_docs: Vec<ScoreDoc> = self.heap.into_iter().map(|slot| slot.0).collect();
        score_docs.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.doc.cmp(&b.doc))
        });
        TopDocs {
            total_hits: self.total_hits,
            score_docs,
            max_score: if self.total_hits == 0 {
                f32::NAN
            } else {
                self.max_score
            },
        }
    }
}

impl Collector for TopDocsCollector {
    fn set_next_reader(&mut self, doc_base: DocId) -> SearchResult<()> {
        self.doc_base = doc_base;
        Ok(())
    }

    fn collect(&mut self, doc: DocId, score: f32) -> SearchResult<()> {
        self.total_hits += 1;
        self.max_score = self.max_score.max(score);
        self.heap.push(HeapSlot(ScoreDoc {
            doc: self.doc_base + doc,
            score,
        }));
        if self.heap.len() > self.limit {
            self.heap.pop();
        }
        Ok(())
    }

    fn accepts_docs_out_of_order(&self) -> bool {
        true
    }
}

/// Counts hits without keeping any.
#[derive(Default)]
pub struct TotalHitCountCollector {
    pub total_hits: u32,
}

impl Collector for TotalHitCountCollector {
    fn set_next_reader(&mut self, _doc_base: DocId) -> SearchResult<()> {
        Ok(())
    }

    fn collect(&mut self, _doc: DocId, _score: f32) -> SearchResult<()> {
        self.total_hits += 1;
        Ok(())
    }

    fn accepts_docs_out_of_order(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_best_n_sorted() {
        let mut collector = TopDocsCollector::new(2);
        collector.set_next_reader(0).unwrap();
        collector.collect(0, 0.5).unwrap();
        collector.collect(1, 2.0).unwrap();
        collector.set_next_reader(10).unwrap();
        collector.collect(0, 1.0).unwrap();
        collector.collect(3, 0.1).unwrap();

        let top = collector.into_top_docs();
        assert_eq!(top.total_hits, 4);
        assert_eq!(top.max_score, 2.0);
        assert_eq!(top.score_docs.len(), 2);
        assert_eq!(top.score_docs[0].doc, 1);
        assert_eq!(top.score_docs[1].doc, 10);
    }

    #[test]
    fn score_ties_prefer_smaller_doc() {
        let mut collector = TopDocsCollector::new(2);
        collector.set_next_reader(0).unwrap();
        collector.collect(7, 1.0).unwrap();
        collector.collect(3, 1.0).unwrap();
        collector.collect(5, 1.0).unwrap();
        let top = collector.into_top_docs();
        assert_eq!(top.score_docs[0].doc, 3);
        assert_eq!(top.score_docs[1].doc, 5);
    }
}
