use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::codec::postings::SegmentTermPositions;
use crate::document::Term;
use crate::error::SearchResult;
use crate::index::reader::SegmentReader;
use crate::search::scorer::{BoxScorer, Scorer, SearchStats};
use crate::search::similarity::{decode_norm, Similarity};
use crate::util::{DocId, NO_MORE_DOCS};

/// Position-aware queries: matches carry a `[start, end)` position span,
/// so they compose into proximity and ordered-window constraints.
#[derive(Clone, Debug, PartialEq)]
pub enum SpanQuery {
    Term {
        term: Term,
        boost: f32,
    },
    /// All clauses near each other, within `slop` positions of spare
    /// room, optionally in clause order.
    Near {
        clauses: Vec<SpanQuery>,
        slop: u32,
        in_order: bool,
        boost: f32,
    },
    /// Matches of `inner` that end at or before position `end`.
    First {
        inner: Box<SpanQuery>,
        end: u32,
        boost: f32,
    },
}

impl SpanQuery {
    pub fn boost(&self) -> f32 {
        match self {
            SpanQuery::Term { boost, .. }
            | SpanQuery::Near { boost, .. }
            | SpanQuery::First { boost, .. } => *boost,
        }
    }

    pub fn set_boost(&mut self, value: f32) {
        match self {
            SpanQuery::Term { boost, .. }
            | SpanQuery::Near { boost, .. }
            | SpanQuery::First { boost, .. } => *boost = value,
        }
    }

    /// The field a span query runs over; span trees are single-field.
    pub fn field(&self) -> &str {
        match self {
            SpanQuery::Term { term, .. } => &term.field,
            SpanQuery::Near { clauses, .. } => clauses[0].field(),
            SpanQuery::First { inner, .. } => inner.field(),
        }
    }

    fn collect_terms(&self, out: &mut Vec<Term>) {
        match self {
            SpanQuery::Term { term, .. } => out.push(term.clone()),
            SpanQuery::Near { clauses, .. } => {
                for clause in clauses {
                    clause.collect_terms(out);
                }
            }
            SpanQuery::First { inner, .. } => inner.collect_terms(out),
        }
    }
}

impl Hash for SpanQuery {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            SpanQuery::Term { term, boost } => {
                term.hash(state);
                boost.to_bits().hash(state);
            }
            SpanQuery::Near {
                clauses,
                slop,
                in_order,
                boost,
            } => {
                for clause in clauses {
                    clause.hash(state);
                }
                slop.hash(state);
                in_order.hash(state);
                boost.to_bits().hash(state);
            }
            SpanQuery::First { inner, end, boost } => {
                inner.hash(state);
                end.hash(state);
                boost.to_bits().hash(state);
            }
        }
    }
}

/// Evaluation tree over one leaf: aligns the involved term cursors on a
/// document, then enumerates that document's spans.
enum SpanEval {
    Term {
        tp: SegmentTermPositions,
        doc: DocId,
    },
    Near {
        subs: Vec<SpanEval>,
        slop: u32,
        in_order: bool,
    },
    First {
        sub: Box<SpanEval>,
        end: u32,
    },
}

impl SpanEval {
    fn build(query: &SpanQuery, reader: &SegmentReader) -> SearchResult<Option<SpanEval>> {
        match query {
            SpanQuery::Term { term, .. } => Ok(reader
                .term_positions(term)?
                .map(|tp| SpanEval::Term { tp, doc: -1 })),
            SpanQuery::Near { clauses, slop, in_order, .. } => {
                let mut subs = Vec::with_capacity(clauses.len());
                for clause in clauses {
                    match SpanEval::build(clause, reader)? {
                        Some(sub) => subs.push(sub),
                        None => return Ok(None),
                    }
                }
                Ok(Some(SpanEval::Near {
                    subs,
                    slop: *slop,
                    in_order: *in_order,
                }))
            }
            SpanQuery::First { inner, end, .. } => Ok(SpanEval::build(inner, reader)?
                .map(|sub| SpanEval::First {
                    sub: Box::new(sub),
                    end: *end,
                })),
        }
    }

    /// First doc `>= target` where every involved term is present.
    fn advance_doc(&mut self, target: DocId) -> SearchResult<DocId> {
        match self {
            SpanEval::Term { tp, doc } => {
                if *doc == NO_MORE_DOCS || *doc >= target {
                    return Ok(*doc);
                }
                *doc = if tp.advance(target)? {
                    tp.doc()
                } else {
                    NO_MORE_DOCS
                };
                Ok(*doc)
            }
            SpanEval::Near { subs, .. } => {
                let mut candidate = target;
                loop {
                    let mut max_doc = candidate;
                    let mut aligned = true;
                    for sub in subs.iter_mut() {
                        let doc = sub.advance_doc(candidate)?;
                        if doc == NO_MORE_DOCS {
                            return Ok(NO_MORE_DOCS);
                        }
                        if doc > max_doc {
                            max_doc = doc;
                            aligned = false;
                        }
                    }
                    if aligned {
                        return Ok(candidate);
                    }
                    candidate = max_doc;
                }
            }
            SpanEval::First { sub, .. } => sub.advance_doc(target),
        }
    }

    /// Spans of the current document, sorted by (start, end).
    fn spans_at(&self, doc: DocId) -> Vec<(u32, u32)> {
        match self {
            SpanEval::Term { tp, doc: current } => {
                if *current != doc {
                    return Vec::new();
                }
                tp.positions().iter().map(|&p| (p, p + 1)).collect()
            }
            SpanEval::Near { subs, slop, in_order } => {
                let sub_spans: Vec<Vec<(u32, u32)>> =
                    subs.iter().map(|s| s.spans_at(doc)).collect();
                if sub_spans.iter().any(|s| s.is_empty()) {
                    return Vec::new();
                }
                let mut matches = Vec::new();
                combine(&sub_spans, 0, &mut Vec::new(), *slop, *in_order, &mut matches);
                matches.sort_unstable();
                matches.dedup();
                matches
            }
            SpanEval::First { sub, end } => sub
                .spans_at(doc)
                .into_iter()
                .filter(|(_, span_end)| span_end <= end)
                .collect(),
        }
    }
}

/// Recursively picks one span per clause and keeps combinations whose
/// total window leaves at most `slop` uncovered positions.
fn combine(
    sub_spans: &[Vec<(u32, u32)>],
    depth: usize,
    chosen: &mut Vec<(u32, u32)>,
    slop: u32,
    in_order: bool,
    out: &mut Vec<(u32, u32)>,
) {
    if depth == sub_spans.len() {
        let start = chosen.iter().map(|s| s.0).min().unwrap();
        let end = chosen.iter().map(|s| s.1).max().unwrap();
        let covered: u32 = chosen.iter().map(|s| s.1 - s.0).sum();
        let width = end - start;
        if width >= covered && width - covered <= slop {
            out.push((start, end));
        } else if width < covered && slop > 0 {
            // overlapping picks still count as near for unordered spans
            out.push((start, end));
        }
        return;
    }
    for &span in &sub_spans[depth] {
        if in_order {
            if let Some(previous) = chosen.last() {
                if span.0 < previous.1 {
                    continue;
                }
            }
        }
        chosen.push(span);
        combine(sub_spans, depth + 1, chosen, slop, in_order, out);
        chosen.pop();
    }
}

/// Weight for the span family: idf sums over every involved term.
pub struct SpanWeight {
    query: SpanQuery,
    field: String,
    idf: f32,
    query_weight: f32,
    value: f32,
    similarity: Arc<dyn Similarity>,
}

impl SpanWeight {
    pub(crate) fn create(
        query: &SpanQuery,
        stats: &dyn SearchStats,
        similarity: &Arc<dyn Similarity>,
    ) -> SearchResult<SpanWeight> {
        let mut terms = Vec::new();
        query.collect_terms(&mut terms);
        let mut idf = 0.0;
        for term in &terms {
            idf += similarity.idf(stats.doc_freq(term)?, stats.max_doc());
        }
        Ok(SpanWeight {
            field: query.field().to_string(),
            query: query.clone(),
            idf,
            query_weight: idf * query.boost(),
            value: 0.0,
            similarity: Arc::clone(similarity),
        })
    }

    pub(crate) fn sum_of_squared_weights(&self) -> f32 {
        self.query_weight * self.query_weight
    }

    pub(crate) fn normalize(&mut self, norm: f32) {
        self.value = self.query_weight * norm * self.idf;
    }

    pub(crate) fn scorer(&self, reader: &SegmentReader) -> SearchResult<Option<BoxScorer>> {
        let eval = match SpanEval::build(&self.query, reader)? {
            Some(eval) => eval,
            None => return Ok(None),
        };
        let norms = reader.norms(&self.field)?;
        Ok(Some(Box::new(SpanScorer {
            eval,
            norms,
            value: self.value,
            similarity: Arc::clone(&self.similarity),
            doc: -1,
            freq: 0.0,
        })))
    }
}

/// Scores a span tree: each matching span contributes a proximity-decayed
/// unit of frequency.
pub struct SpanScorer {
    eval: SpanEval,
    norms: Option<Arc<Vec<u8>>>,
    value: f32,
    similarity: Arc<dyn Similarity>,
    doc: DocId,
    freq: f32,
}

impl SpanScorer {
    fn settle(&mut self, target: DocId) -> SearchResult<DocId> {
        let mut candidate = target.max(0);
        loop {
            let doc = self.eval.advance_doc(candidate)?;
            if doc == NO_MORE_DOCS {
                self.doc = NO_MORE_DOCS;
                return Ok(NO_MORE_DOCS);
            }
            let spans = self.eval.spans_at(doc);
            if !spans.is_empty() {
                self.freq = spans
                    .iter()
                    .map(|(start, end)| self.similarity.sloppy_freq(end - start - 1))
                    .sum();
                self.doc = doc;
                return Ok(doc);
            }
            candidate = doc + 1;
        }
    }
}

impl Scorer for SpanScorer {
    fn doc(&self) -> DocId {
        self.doc
    }

    fn next_doc(&mut self) -> SearchResult<DocId> {
        if self.doc == NO_MORE_DOCS {
            return Ok(NO_MORE_DOCS);
        }
        let target = if self.doc < 0 { 0 } else { self.doc + 1 };
        self.settle(target)
    }

    fn advance(&mut self, target: DocId) -> SearchResult<DocId> {
        if self.doc == NO_MORE_DOCS {
            return Ok(NO_MORE_DOCS);
        }
        self.settle(target)
    }

    fn score(&mut self) -> SearchResult<f32> {
        let norm = self
            .norms
            .as_ref()
            .map(|n| decode_norm(n[self.doc as usize]))
            .unwrap_or(1.0);
        Ok(self.similarity.tf(self.freq) * self.value * norm)
    }
}
