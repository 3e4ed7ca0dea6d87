use std::sync::Arc;

use crate::codec::postings::{SegmentTermDocs, SegmentTermPositions};
use crate::document::Term;
use crate::error::SearchResult;
use crate::index::reader::SegmentReader;
use crate::search::field_cache::FieldCacheRangeFilter;
use crate::search::query::{Occur, Query};
use crate::search::similarity::{decode_norm, Similarity};
use crate::search::spans::SpanWeight;
use crate::util::{BitVector, DocId, NO_MORE_DOCS};

/// Sorted iterator over matching documents of one segment. `doc()` is
/// undefined before the first `next_doc`/`advance`; both return
/// [`NO_MORE_DOCS`] when exhausted and stay there.
pub trait Scorer {
    fn doc(&self) -> DocId;
    fn next_doc(&mut self) -> SearchResult<DocId>;
    fn advance(&mut self, target: DocId) -> SearchResult<DocId>;
    fn score(&mut self) -> SearchResult<f32>;
}

pub type BoxScorer = Box<dyn Scorer>;

/// Aggregate statistics a weight needs at construction time.
pub trait SearchStats {
    fn doc_freq(&self, term: &Term) -> SearchResult<u32>;
    fn max_doc(&self) -> u32;
}

/// A query bound to concrete index statistics: idf and the query norm are
/// fixed here, then a scorer is built per leaf.
pub enum Weight {
    Term(TermWeight),
    Boolean(BooleanWeight),
    Phrase(PhraseWeight),
    MatchAll(MatchAllWeight),
    Filtered(FilteredWeight),
    Span(SpanWeight),
}

impl Weight {
    /// Builds the weight tree for an already-rewritten query.
    pub fn create(
        query: &Query,
        stats: &dyn SearchStats,
        similarity: &Arc<dyn Similarity>,
    ) -> SearchResult<Weight> {
        match query {
            Query::Term { term, boost } => {
                let idf = similarity.idf(stats.doc_freq(term)?, stats.max_doc());
                Ok(Weight::Term(TermWeight {
                    term: term.clone(),
                    idf,
                    query_weight: idf * boost,
                    value: 0.0,
                    similarity: Arc::clone(similarity),
                }))
            }
            Query::Boolean { clauses, boost } => {
                let mut subs = Vec::with_capacity(clauses.len());
                let mut max_coord = 0;
                for clause in clauses {
                    if clause.occur != Occur::MustNot {
                        max_coord += 1;
                    }
                    subs.push((clause.occur, Weight::create(&clause.query, stats, similarity)?));
                }
                Ok(Weight::Boolean(BooleanWeight {
                    subs,
                    boost: *boost,
                    max_coord,
                    similarity: Arc::clone(similarity),
                }))
            }
            Query::Phrase {
                field,
                terms,
                slop,
                boost,
            } => {
                let positions: Vec<Vec<String>> =
                    terms.iter().map(|t| vec![t.clone()]).collect();
                Self::phrase_weight(field, &positions, *slop, *boost, stats, similarity)
            }
            Query::MultiPhrase {
                field,
                positions,
                slop,
                boost,
            } => Self::phrase_weight(field, positions, *slop, *boost, stats, similarity),
            Query::MatchAll { boost } => Ok(Weight::MatchAll(MatchAllWeight {
                query_weight: *boost,
                value: 0.0,
            })),
            Query::Filtered { query, filter } => Ok(Weight::Filtered(FilteredWeight {
                inner: Box::new(Weight::create(query, stats, similarity)?),
                filter: filter.clone(),
            })),
            Query::Span(span) => Ok(Weight::Span(SpanWeight::create(
                span, stats, similarity,
            )?)),
            // derived forms must be rewritten before weighting
            other => Err(crate::error::SearchError::IllegalArgument(format!(
                "query not rewritten before weighting: {other:?}"
            ))),
        }
    }

    fn phrase_weight(
        field: &str,
        positions: &[Vec<String>],
        slop: u32,
        boost: f32,
        stats: &dyn SearchStats,
        similarity: &Arc<dyn Similarity>,
    ) -> SearchResult<Weight> {
        let mut idf = 0.0;
        for alternatives in positions {
            for text in alternatives {
                idf += similarity.idf(
                    stats.doc_freq(&Term::new(field, text.as_str()))?,
                    stats.max_doc(),
                );
            }
        }
        Ok(Weight::Phrase(PhraseWeight {
            field: field.to_string(),
            positions: positions.to_vec(),
            slop,
            idf,
            query_weight: idf * boost,
            value: 0.0,
            similarity: Arc::clone(similarity),
        }))
    }

    pub fn sum_of_squared_weights(&self) -> f32 {
        match self {
            Weight::Term(w) => w.query_weight * w.query_weight,
            Weight::Phrase(w) => w.query_weight * w.query_weight,
            Weight::MatchAll(w) => w.query_weight * w.query_weight,
            Weight::Boolean(w) => {
                let sum: f32 = w
                    .subs
                    .iter()
                    .filter(|(occur, _)| *occur != Occur::MustNot)
                    .map(|(_, sub)| sub.sum_of_squared_weights())
                    .sum();
                sum * w.boost * w.boost
            }
            Weight::Filtered(w) => w.inner.sum_of_squared_weights(),
            Weight::Span(w) => w.sum_of_squared_weights(),
        }
    }

    pub fn normalize(&mut self, norm: f32) {
        match self {
            Weight::Term(w) => {
                let normed = w.query_weight * norm;
                w.value = normed * w.idf;
            }
            Weight::Phrase(w) => {
                let normed = w.query_weight * norm;
                w.value = normed * w.idf;
            }
            Weight::MatchAll(w) => w.value = w.query_weight * norm,
            Weight::Boolean(w) => {
                let norm = norm * w.boost;
                for (_, sub) in &mut w.subs {
                    sub.normalize(norm);
                }
            }
            Weight::Filtered(w) => w.inner.normalize(norm),
            Weight::Span(w) => w.normalize(norm),
        }
    }

    /// Scorer over one leaf, or `None` when the leaf cannot match at all.
    pub fn scorer(&self, reader: &SegmentReader) -> SearchResult<Option<BoxScorer>> {
        match self {
            Weight::Term(w) => {
                let docs = match reader.term_docs(&w.term)? {
                    Some(docs) => docs,
                    None => return Ok(None),
                };
                let norms = reader.norms(&w.term.field)?;
                Ok(Some(Box::new(TermScorer {
                    docs,
                    norms,
                    value: w.value,
                    similarity: Arc::clone(&w.similarity),
                    doc: -1,
                })))
            }
            Weight::Boolean(w) => w.scorer(reader),
            Weight::Phrase(w) => w.scorer(reader),
            Weight::MatchAll(w) => Ok(Some(Box::new(MatchAllScorer {
                doc: -1,
                max_doc: reader.max_doc() as DocId,
                deleted: reader_deleted(reader),
                value: w.value,
            }))),
            Weight::Filtered(w) => {
                let inner = match w.inner.scorer(reader)? {
                    Some(inner) => inner,
                    None => return Ok(None),
                };
                let bits = w.filter.doc_id_set(reader)?;
                Ok(Some(Box::new(FilteredScorer { inner, bits })))
            }
            Weight::Span(w) => w.scorer(reader),
        }
    }
}

fn reader_deleted(reader: &SegmentReader) -> Option<Arc<BitVector>> {
    // scorers hold a snapshot so reads stay point-in-time
    if reader.has_deletions() {
        // the postings cursors already filter; match-all has no cursor
        let mut bits = BitVector::new(reader.max_doc());
        for doc in 0..reader.max_doc() as DocId {
            if reader.is_deleted(doc) {
                bits.set(doc);
            }
        }
        Some(Arc::new(bits))
    } else {
        None
    }
}

pub struct TermWeight {
    pub term: Term,
    idf: f32,
    query_weight: f32,
    value: f32,
    similarity: Arc<dyn Similarity>,
}

pub struct TermScorer {
    docs: SegmentTermDocs,
    norms: Option<Arc<Vec<u8>>>,
    value: f32,
    similarity: Arc<dyn Similarity>,
    doc: DocId,
}

impl Scorer for TermScorer {
    fn doc(&self) -> DocId {
        self.doc
    }

    fn next_doc(&mut self) -> SearchResult<DocId> {
        self.doc = if self.docs.next()? {
            self.docs.doc()
        } else {
            NO_MORE_DOCS
        };
        Ok(self.doc)
    }

    fn advance(&mut self, target: DocId) -> SearchResult<DocId> {
        if self.doc == NO_MORE_DOCS {
            return Ok(NO_MORE_DOCS);
        }
        self.doc = if self.docs.advance(target)? {
            self.docs.doc()
        } else {
            NO_MORE_DOCS
        };
        Ok(self.doc)
    }

    fn score(&mut self) -> SearchResult<f32> {
        let norm = self
            .norms
            .as_ref()
            .map(|n| decode_norm(n[self.doc as usize]))
            .unwrap_or(1.0);
        Ok(self.similarity.tf(self.docs.freq() as f32) * self.value * norm)
    }
}

pub struct BooleanWeight {
    subs: Vec<(Occur, Weight)>,
    boost: f32,
    max_coord: u32,
    similarity: Arc<dyn Similarity>,
}

impl BooleanWeight {
    fn scorer(&self, reader: &SegmentReader) -> SearchResult<Option<BoxScorer>> {
        let mut required = Vec::new();
        let mut optional = Vec::new();
        let mut prohibited = Vec::new();
        for (occur, sub) in &self.subs {
            let scorer = sub.scorer(reader)?;
            match occur {
                Occur::Must => match scorer {
                    Some(scorer) => required.push(SubScorer::new(scorer)),
                    // a missing required clause rules the leaf out
                    None => return Ok(None),
                },
                Occur::Should => {
                    if let Some(scorer) = scorer {
                        optional.push(SubScorer::new(scorer));
                    }
                }
                Occur::MustNot => {
                    if let Some(scorer) = scorer {
                        prohibited.push(SubScorer::new(scorer));
                    }
                }
            }
        }
        if required.is_empty() && optional.is_empty() {
            return Ok(None);
        }
        Ok(Some(Box::new(BooleanScorer {
            required,
            optional,
            prohibited,
            max_coord: self.max_coord,
            similarity: Arc::clone(&self.similarity),
            doc: -1,
            current_score: 0.0,
        })))
    }
}

struct SubScorer {
    scorer: BoxScorer,
    doc: DocId,
}

impl SubScorer {
    fn new(scorer: BoxScorer) -> Self {
        Self { scorer, doc: -1 }
    }

    fn advance_to(&mut self, target: DocId) -> SearchResult<DocId> {
        if self.doc < target {
            self.doc = if self.doc == -1 && target == 0 {
                self.scorer.next_doc()?
            } else {
                self.scorer.advance(target)?
            };
        }
        Ok(self.doc)
    }

    fn step(&mut self) -> SearchResult<DocId> {
        self.doc = self.scorer.next_doc()?;
        Ok(self.doc)
    }
}

/// Conjunction over `Must`, disjunction over `Should`, exclusion of
/// `MustNot`, with the coordination factor rewarding broader matches.
pub struct BooleanScorer {
    required: Vec<SubScorer>,
    optional: Vec<SubScorer>,
    prohibited: Vec<SubScorer>,
    max_coord: u32,
    similarity: Arc<dyn Similarity>,
    doc: DocId,
    current_score: f32,
}

impl BooleanScorer {
    /// Next candidate doc `>= target` matching the required/optional
    /// structure, ignoring prohibitions.
    fn candidate(&mut self, target: DocId) -> SearchResult<DocId> {
        if !self.required.is_empty() {
            // leapfrog the conjunction
            let mut aligned = target;
            loop {
                let mut max_doc = aligned;
                let mut all_match = true;
                for sub in &mut self.required {
                    let doc = sub.advance_to(max_doc.max(0))?;
                    if doc == NO_MORE_DOCS {
                        return Ok(NO_MORE_DOCS);
                    }
                    if doc > max_doc {
                        max_doc = doc;
                        all_match = false;
                    }
                }
                if all_match {
                    return Ok(max_doc);
                }
                aligned = max_doc;
            }
        } else {
            let mut min_doc = NO_MORE_DOCS;
            for sub in &mut self.optional {
                let doc = if sub.doc < target {
                    sub.advance_to(target.max(0))?
                } else {
                    sub.doc
                };
                min_doc = min_doc.min(doc);
            }
            Ok(min_doc)
        }
    }

    fn settle(&mut self, mut target: DocId) -> SearchResult<DocId> {
        loop {
            let candidate = self.candidate(target)?;
            if candidate == NO_MORE_DOCS {
                self.doc = NO_MORE_DOCS;
                return Ok(NO_MORE_DOCS);
            }
            // prohibited clauses veto the candidate
            let mut vetoed = false;
            for sub in &mut self.prohibited {
                if sub.advance_to(candidate)? == candidate {
                    vetoed = true;
                    break;
                }
            }
            if vetoed {
                target = candidate + 1;
                continue;
            }
            // score now: every cursor is already positioned
            let mut matched = 0;
            let mut score = 0.0;
            for sub in &mut self.required {
                score += sub.scorer.score()?;
                matched += 1;
            }
            for sub in &mut self.optional {
                if sub.doc < candidate {
                    sub.advance_to(candidate)?;
                }
                if sub.doc == candidate {
                    score += sub.scorer.score()?;
                    matched += 1;
                }
            }
            self.current_score = score * self.similarity.coord(matched, self.max_coord);
            self.doc = candidate;
            return Ok(candidate);
        }
    }
}

impl Scorer for BooleanScorer {
    fn doc(&self) -> DocId {
        self.doc
    }

    fn next_doc(&mut self) -> SearchResult<DocId> {
        if self.doc == NO_MORE_DOCS {
            return Ok(NO_MORE_DOCS);
        }
        let target = if self.doc < 0 {
            0
        } else if self.required.is_empty() {
            // disjunction: step every optional sitting on the current doc
            for sub in &mut self.optional {
                if sub.doc == self.doc {
                    sub.step()?;
                }
            }
            self.doc
        } else {
            // conjunction: step the whole block past the current doc
            self.doc + 1
        };
        self.settle(target)
    }

    fn advance(&mut self, target: DocId) -> SearchResult<DocId> {
        if self.doc == NO_MORE_DOCS {
            return Ok(NO_MORE_DOCS);
        }
        if self.required.is_empty() {
            for sub in &mut self.optional {
                if sub.doc != NO_MORE_DOCS && sub.doc < target {
                    sub.advance_to(target)?;
                }
            }
        }
        self.settle(target)
    }

    fn score(&mut self) -> SearchResult<f32> {
        Ok(self.current_score)
    }
}

pub struct PhraseWeight {
    field: String,
    positions: Vec<Vec<String>>,
    slop: u32,
    idf: f32,
    query_weight: f32,
    value: f32,
    similarity: Arc<dyn Similarity>,
}

impl PhraseWeight {
    fn scorer(&self, reader: &SegmentReader) -> SearchResult<Option<BoxScorer>> {
        let mut slots = Vec::with_capacity(self.positions.len());
        for (offset, alternatives) in self.positions.iter().enumerate() {
            let mut cursors = Vec::new();
            for text in alternatives {
                if let Some(tp) =
                    reader.term_positions(&Term::new(self.field.as_str(), text.as_str()))?
                {
                    cursors.push(PositionsCursor { tp, doc: -1 });
                }
            }
            if cursors.is_empty() {
                // one slot has no terms in this segment: no phrase match
                return Ok(None);
            }
            slots.push(PhraseSlot {
                cursors,
                offset: offset as u32,
            });
        }
        let norms = reader.norms(&self.field)?;
        Ok(Some(Box::new(PhraseScorer {
            slots,
            slop: self.slop,
            norms,
            value: self.value,
            similarity: Arc::clone(&self.similarity),
            doc: -1,
            freq: 0.0,
        })))
    }
}

struct PositionsCursor {
    tp: SegmentTermPositions,
    doc: DocId,
}

impl PositionsCursor {
    fn advance_to(&mut self, target: DocId) -> SearchResult<DocId> {
        if self.doc == NO_MORE_DOCS || self.doc >= target {
            return Ok(self.doc);
        }
        self.doc = if self.tp.advance(target)? {
            self.tp.doc()
        } else {
            NO_MORE_DOCS
        };
        Ok(self.doc)
    }
}

/// One phrase position: several alternative terms, any of which counts.
struct PhraseSlot {
    cursors: Vec<PositionsCursor>,
    offset: u32,
}

impl PhraseSlot {
    fn advance_to(&mut self, target: DocId) -> SearchResult<DocId> {
        let mut min_doc = NO_MORE_DOCS;
        for cursor in &mut self.cursors {
            min_doc = min_doc.min(cursor.advance_to(target)?);
        }
        Ok(min_doc)
    }

    /// Positions at `doc`, shifted left by the slot's phrase offset.
    fn adjusted_positions(&self, doc: DocId) -> Vec<i64> {
        let mut positions = Vec::new();
        for cursor in &self.cursors {
            if cursor.doc == doc {
                for &p in cursor.tp.positions() {
                    positions.push(p as i64 - self.offset as i64);
                }
            }
        }
        positions.sort_unstable();
        positions.dedup();
        positions
    }
}

/// Walks position postings of every slot in lock-step, advancing the
/// lagging slot, and scores docs where the terms line up within `slop`.
pub struct PhraseScorer {
    slots: Vec<PhraseSlot>,
    slop: u32,
    norms: Option<Arc<Vec<u8>>>,
    value: f32,
    similarity: Arc<dyn Similarity>,
    doc: DocId,
    freq: f32,
}

impl PhraseScorer {
    fn settle(&mut self, target: DocId) -> SearchResult<DocId> {
        let mut candidate = target.max(0);
        loop {
            // conjunction over slots, advancing the lagging one
            let mut max_doc = candidate;
            let mut all_match = true;
            for slot in &mut self.slots {
                let doc = slot.advance_to(candidate)?;
                if doc == NO_MORE_DOCS {
                    self.doc = NO_MORE_DOCS;
                    return Ok(NO_MORE_DOCS);
                }
                if doc > max_doc {
                    max_doc = doc;
                    all_match = false;
                }
            }
            if !all_match {
                candidate = max_doc;
                continue;
            }
            // positions must line up within the slop
            let freq = self.phrase_freq(candidate);
            if freq > 0.0 {
                self.doc = candidate;
                self.freq = freq;
                return Ok(candidate);
            }
            candidate += 1;
        }
    }

    fn phrase_freq(&self, doc: DocId) -> f32 {
        let lists: Vec<Vec<i64>> = self
            .slots
            .iter()
            .map(|slot| slot.adjusted_positions(doc))
            .collect();
        if lists.iter().any(|l| l.is_empty()) {
            return 0.0;
        }
        if self.slop == 0 {
            // exact: adjusted positions must coincide across all slots
            let mut matches = 0;
            'candidate: for &p in &lists[0] {
                for list in &lists[1..] {
                    if list.binary_search(&p).is_err() {
                        continue 'candidate;
                    }
                }
                matches += 1;
            }
            return matches as f32;
        }
        // sloppy: sweep the minimal windows over the k lists
        let mut pointers = vec![0usize; lists.len()];
        let mut freq = 0.0;
        loop {
            let mut min = i64::MAX;
            let mut max = i64::MIN;
            let mut min_list = 0;
            for (i, list) in lists.iter().enumerate() {
                let value = list[pointers[i]];
                if value < min {
                    min = value;
                    min_list = i;
                }
                max = max.max(value);
            }
            let window = (max - min) as u32;
            if window <= self.slop {
                freq += self.similarity.sloppy_freq(window);
            }
            pointers[min_list] += 1;
            if pointers[min_list] >= lists[min_list].len() {
                return freq;
            }
        }
    }
}

impl Scorer for PhraseScorer {
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

pub struct MatchAllWeight {
    query_weight: f32,
    value: f32,
}

pub struct MatchAllScorer {
    doc: DocId,
    max_doc: DocId,
    deleted: Option<Arc<BitVector>>,
    value: f32,
}

impl Scorer for MatchAllScorer {
    fn doc(&self) -> DocId {
        self.doc
    }

    fn next_doc(&mut self) -> SearchResult<DocId> {
        self.advance(self.doc + 1)
    }

    fn advance(&mut self, target: DocId) -> SearchResult<DocId> {
        let mut doc = target.max(0);
        while doc < self.max_doc {
            let dead = self.deleted.as_ref().map(|d| d.get(doc)).unwrap_or(false);
            if !dead {
                self.doc = doc;
                return Ok(doc);
            }
            doc += 1;
        }
        self.doc = NO_MORE_DOCS;
        Ok(NO_MORE_DOCS)
    }

    fn score(&mut self) -> SearchResult<f32> {
        Ok(self.value)
    }
}

pub struct FilteredWeight {
    inner: Box<Weight>,
    filter: FieldCacheRangeFilter,
}

pub struct FilteredScorer {
    inner: BoxScorer,
    bits: BitVector,
}

impl Scorer for FilteredScorer {
    fn doc(&self) -> DocId {
        self.inner.doc()
    }

    fn next_doc(&mut self) -> SearchResult<DocId> {
        loop {
            let doc = self.inner.next_doc()?;
            if doc == NO_MORE_DOCS || self.bits.get(doc) {
                return Ok(doc);
            }
        }
    }

    fn advance(&mut self, target: DocId) -> SearchResult<DocId> {
        let mut doc = self.inner.advance(target)?;
        while doc != NO_MORE_DOCS && !self.bits.get(doc) {
            doc = self.inner.next_doc()?;
        }
        Ok(doc)
    }

    fn score(&mut self) -> SearchResult<f32> {
        self.inner.score()
    }
}
