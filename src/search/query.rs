use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::document::{encode_i64_term, Term};
use crate::error::{SearchError, SearchResult};
use crate::index::reader::SegmentReader;
use crate::search::spans::SpanQuery;

/// Global bound on how many clauses a rewritten boolean query may carry;
/// range and fuzzy expansions respect it.
static MAX_CLAUSE_COUNT: AtomicUsize = AtomicUsize::new(1024);

pub fn max_clause_count() -> usize {
    MAX_CLAUSE_COUNT.load(Ordering::Acquire)
}

pub fn set_max_clause_count(count: usize) {
    MAX_CLAUSE_COUNT.store(count.max(1), Ordering::Release);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Occur {
    Must,
    Should,
    MustNot,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BooleanClause {
    pub occur: Occur,
    pub query: Query,
}

/// Immutable query description. `rewrite` reduces derived forms (prefix,
/// range, fuzzy) to primitive ones against a concrete set of segment
/// readers; scoring happens later through a weight.
#[derive(Clone, Debug, PartialEq)]
pub enum Query {
    Term {
        term: Term,
        boost: f32,
    },
    Boolean {
        clauses: Vec<BooleanClause>,
        boost: f32,
    },
    Phrase {
        field: String,
        terms: Vec<String>,
        slop: u32,
        boost: f32,
    },
    /// Like `Phrase`, but every position admits alternatives.
    MultiPhrase {
        field: String,
        positions: Vec<Vec<String>>,
        slop: u32,
        boost: f32,
    },
    Prefix {
        term: Term,
        boost: f32,
    },
    TermRange {
        field: String,
        lower: Option<String>,
        upper: Option<String>,
        include_lower: bool,
        include_upper: bool,
        boost: f32,
    },
    NumericRange {
        field: String,
        lower: Option<i64>,
        upper: Option<i64>,
        include_lower: bool,
        include_upper: bool,
        boost: f32,
    },
    Fuzzy {
        term: Term,
        min_similarity: f32,
        prefix_length: usize,
        boost: f32,
    },
    MatchAll {
        boost: f32,
    },
    /// Scoring query constrained by a non-scoring filter.
    Filtered {
        query: Box<Query>,
        filter: crate::search::field_cache::FieldCacheRangeFilter,
    },
    Span(SpanQuery),
}

impl Query {
    pub fn term(term: Term) -> Query {
        Query::Term { term, boost: 1.0 }
    }

    pub fn boolean(clauses: Vec<BooleanClause>) -> Query {
        Query::Boolean {
            clauses,
            boost: 1.0,
        }
    }

    pub fn phrase<F: Into<String>>(field: F, terms: Vec<String>, slop: u32) -> Query {
        Query::Phrase {
            field: field.into(),
            terms,
            slop,
            boost: 1.0,
        }
    }

    pub fn prefix(term: Term) -> Query {
        Query::Prefix { term, boost: 1.0 }
    }

    pub fn fuzzy(term: Term, min_similarity: f32, prefix_length: usize) -> Query {
        Query::Fuzzy {
            term,
            min_similarity,
            prefix_length,
            boost: 1.0,
        }
    }

    pub fn match_all() -> Query {
        Query::MatchAll { boost: 1.0 }
    }

    pub fn boost(&self) -> f32 {
        match self {
            Query::Term { boost, .. }
            | Query::Boolean { boost, .. }
            | Query::Phrase { boost, .. }
            | Query::MultiPhrase { boost, .. }
            | Query::Prefix { boost, .. }
            | Query::TermRange { boost, .. }
            | Query::NumericRange { boost, .. }
            | Query::Fuzzy { boost, .. }
            | Query::MatchAll { boost } => *boost,
            Query::Filtered { query, .. } => query.boost(),
            Query::Span(span) => span.boost(),
        }
    }

    pub fn with_boost(mut self, value: f32) -> Query {
        match &mut self {
            Query::Term { boost, .. }
            | Query::Boolean { boost, .. }
            | Query::Phrase { boost, .. }
            | Query::MultiPhrase { boost, .. }
            | Query::Prefix { boost, .. }
            | Query::TermRange { boost, .. }
            | Query::NumericRange { boost, .. }
            | Query::Fuzzy { boost, .. }
            | Query::MatchAll { boost } => *boost = value,
            Query::Filtered { query, .. } => {
                let inner = std::mem::replace(query.as_mut(), Query::match_all());
                **query = inner.with_boost(value);
            }
            Query::Span(span) => span.set_boost(value),
        }
        self
    }

    /// Rewrites to primitive form against the given leaves: expansions
    /// become boolean disjunctions, nested booleans rewrite recursively.
    /// The result is a fixpoint; rewriting it again returns it unchanged.
    pub fn rewrite(&self, leaves: &[&SegmentReader]) -> SearchResult<Query> {
        match self {
            Query::Prefix { term, boost } => {
                let terms = expand_prefix(leaves, term)?;
                disjunction(terms.into_iter().map(|t| (t, 1.0)).collect(), *boost)
            }
            Query::TermRange {
                field,
                lower,
                upper,
                include_lower,
                include_upper,
                boost,
            } => {
                let terms = expand_range(
                    leaves,
                    field,
                    lower.as_deref(),
                    upper.as_deref(),
                    *include_lower,
                    *include_upper,
                )?;
                disjunction(terms.into_iter().map(|t| (t, 1.0)).collect(), *boost)
            }
            Query::NumericRange {
                field,
                lower,
                upper,
                include_lower,
                include_upper,
                boost,
            } => {
                let terms = expand_range(
                    leaves,
                    field,
                    lower.map(encode_i64_term).as_deref(),
                    upper.map(encode_i64_term).as_deref(),
                    *include_lower,
                    *include_upper,
                )?;
                disjunction(terms.into_iter().map(|t| (t, 1.0)).collect(), *boost)
            }
            Query::Fuzzy {
                term,
                min_similarity,
                prefix_length,
                boost,
            } => {
                let scored = expand_fuzzy(leaves, term, *min_similarity, *prefix_length)?;
                disjunction(scored, *boost)
            }
            Query::Boolean { clauses, boost } => {
                let mut rewritten = Vec::with_capacity(clauses.len());
                let mut changed = false;
                for clause in clauses {
                    let query = clause.query.rewrite(leaves)?;
                    changed |= query != clause.query;
                    rewritten.push(BooleanClause {
                        occur: clause.occur,
                        query,
                    });
                }
                if changed {
                    Ok(Query::Boolean {
                        clauses: rewritten,
                        boost: *boost,
                    })
                } else {
                    Ok(self.clone())
                }
            }
            Query::Filtered { query, filter } => {
                let inner = query.rewrite(leaves)?;
                Ok(Query::Filtered {
                    query: Box::new(inner),
                    filter: filter.clone(),
                })
            }
            _ => Ok(self.clone()),
        }
    }
}

impl Hash for Query {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Query::Term { term, boost } => {
                term.hash(state);
                boost.to_bits().hash(state);
            }
            Query::Boolean { clauses, boost } => {
                for clause in clauses {
                    clause.occur.hash(state);
                    clause.query.hash(state);
                }
                boost.to_bits().hash(state);
            }
            Query::Phrase {
                field,
                terms,
                slop,
                boost,
            } => {
                field.hash(state);
                terms.hash(state);
                slop.hash(state);
                boost.to_bits().hash(state);
            }
            Query::MultiPhrase {
                field,
                positions,
                slop,
                boost,
            } => {
                field.hash(state);
                positions.hash(state);
                slop.hash(state);
                boost.to_bits().hash(state);
            }
            Query::Prefix { term, boost } => {
                term.hash(state);
                boost.to_bits().hash(state);
            }
            Query::TermRange {
                field,
                lower,
                upper,
                include_lower,
                include_upper,
                boost,
            } => {
                field.hash(state);
                lower.hash(state);
                upper.hash(state);
                include_lower.hash(state);
                include_upper.hash(state);
                boost.to_bits().hash(state);
            }
            Query::NumericRange {
                field,
                lower,
                upper,
                include_lower,
                include_upper,
                boost,
            } => {
                field.hash(state);
                lower.hash(state);
                upper.hash(state);
                include_lower.hash(state);
                include_upper.hash(state);
                boost.to_bits().hash(state);
            }
            Query::Fuzzy {
                term,
                min_similarity,
                prefix_length,
                boost,
            } => {
                term.hash(state);
                min_similarity.to_bits().hash(state);
                prefix_length.hash(state);
                boost.to_bits().hash(state);
            }
            Query::MatchAll { boost } => boost.to_bits().hash(state),
            Query::Filtered { query, filter } => {
                query.hash(state);
                filter.hash(state);
            }
            Query::Span(span) => span.hash(state),
        }
    }
}

fn disjunction(terms: Vec<(Term, f32)>, boost: f32) -> SearchResult<Query> {
    if terms.len() > max_clause_count() {
        return Err(SearchError::IllegalArgument(format!(
            "rewrite produced {} clauses, limit is {}",
            terms.len(),
            max_clause_count()
        )));
    }
    if terms.len() == 1 {
        let (term, weight) = terms.into_iter().next().unwrap();
        return Ok(Query::Term {
            term,
            boost: boost * weight,
        });
    }
    Ok(Query::Boolean {
        clauses: terms
            .into_iter()
            .map(|(term, weight)| BooleanClause {
                occur: Occur::Should,
                query: Query::Term {
                    term,
                    boost: weight,
                },
            })
            .collect(),
        boost,
    })
}

fn expand_prefix(leaves: &[&SegmentReader], term: &Term) -> SearchResult<BTreeSet<Term>> {
    let mut out = BTreeSet::new();
    for leaf in leaves {
        let mut cursor = leaf.terms_from(term)?;
        while let Some(current) = cursor.term() {
            if current.field != term.field || !current.text.starts_with(&term.text) {
                break;
            }
            out.insert(current);
            if !cursor.next()? {
                break;
            }
        }
    }
    Ok(out)
}

fn expand_range(
    leaves: &[&SegmentReader],
    field: &str,
    lower: Option<&str>,
    upper: Option<&str>,
    include_lower: bool,
    include_upper: bool,
) -> SearchResult<BTreeSet<Term>> {
    let start = Term::new(field, lower.unwrap_or(""));
    let mut out = BTreeSet::new();
    for leaf in leaves {
        let mut cursor = leaf.terms_from(&start)?;
        while let Some(current) = cursor.term() {
            if current.field != field {
                break;
            }
            if let Some(lower) = lower {
                if !include_lower && current.text == lower {
                    if !cursor.next()? {
                        break;
                    }
                    continue;
                }
            }
            if let Some(upper) = upper {
                let over = if include_upper {
                    current.text.as_str() > upper
                } else {
                    current.text.as_str() >= upper
                };
                if over {
                    break;
                }
            }
            out.insert(current);
            if !cursor.next()? {
                break;
            }
        }
    }
    Ok(out)
}

/// Levenshtein distance with early bail-out once the best achievable
/// similarity falls under the threshold.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            current[j + 1] = (previous[j] + cost)
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

pub(crate) fn fuzzy_similarity(target: &str, candidate: &str) -> f32 {
    let distance = levenshtein(target, candidate);
    let max_len = target.chars().count().max(candidate.chars().count()).max(1);
    1.0 - distance as f32 / max_len as f32
}

fn expand_fuzzy(
    leaves: &[&SegmentReader],
    term: &Term,
    min_similarity: f32,
    prefix_length: usize,
) -> SearchResult<Vec<(Term, f32)>> {
    if !(0.0..1.0).contains(&min_similarity) && min_similarity != 1.0 {
        return Err(SearchError::IllegalArgument(format!(
            "fuzzy min_similarity must be in [0, 1], got {min_similarity}"
        )));
    }
    // at full similarity only the exact term can match
    if min_similarity >= 1.0 {
        return Ok(vec![(term.clone(), 1.0)]);
    }
    let prefix: String = term.text.chars().take(prefix_length).collect();
    let start = Term::new(&term.field, prefix.as_str());
    let mut scored: Vec<(Term, f32)> = Vec::new();
    let mut seen = BTreeSet::new();
    for leaf in leaves {
        let mut cursor = leaf.terms_from(&start)?;
        while let Some(current) = cursor.term() {
            if current.field != term.field || !current.text.starts_with(&prefix) {
                break;
            }
            if seen.insert(current.clone()) {
                let similarity = fuzzy_similarity(&term.text, &current.text);
                if similarity >= min_similarity {
                    // closer terms get a proportionally higher boost
                    let weight = (similarity - min_similarity) / (1.0 - min_similarity);
                    scored.push((current, weight.max(f32::MIN_POSITIVE)));
                }
            }
            if !cursor.next()? {
                break;
            }
        }
    }
    // keep the best matches inside the clause limit
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(max_clause_count());
    scored.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn similarity_normalizes_by_length() {
        assert_eq!(fuzzy_similarity("abcd", "abcd"), 1.0);
        assert!(fuzzy_similarity("abcd", "abcx") >= 0.75 - f32::EPSILON);
        assert!(fuzzy_similarity("ab", "zz") <= 0.0 + f32::EPSILON);
    }

    #[test]
    fn boost_travels_through_with_boost() {
        let query = Query::term(Term::new("f", "x")).with_boost(2.5);
        assert_eq!(query.boost(), 2.5);
    }

    #[test]
    fn clause_limit_is_mutable() {
        let old = max_clause_count();
        set_max_clause_count(7);
        assert_eq!(max_clause_count(), 7);
        set_max_clause_count(old);
    }
}
