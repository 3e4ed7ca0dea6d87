use std::sync::Arc;

use crate::document::{Document, Term};
use crate::error::{SearchError, SearchResult};
use crate::index::reader::{IndexReader, SegmentReader};
use crate::search::collector::{Collector, TopDocs, TopDocsCollector};
use crate::search::query::Query;
use crate::search::scorer::{SearchStats, Weight};
use crate::search::similarity::{DefaultSimilarity, Similarity};
use crate::util::{DocId, NO_MORE_DOCS};

const MAX_REWRITE_ROUNDS: usize = 10;

/// Executes queries against an [`IndexReader`] under one similarity:
/// rewrite to primitive form, bind a weight, drive a scorer per leaf into
/// the collector.
pub struct Searcher {
    reader: IndexReader,
    similarity: Arc<dyn Similarity>,
}

impl SearchStats for Searcher {
    fn doc_freq(&self, term: &Term) -> SearchResult<u32> {
        self.reader.doc_freq(term)
    }

    fn max_doc(&self) -> u32 {
        self.reader.max_doc().max(1)
    }
}

impl Searcher {
    pub fn new(reader: IndexReader) -> Searcher {
        Searcher {
            reader,
            similarity: Arc::new(DefaultSimilarity),
        }
    }

    pub fn with_similarity(reader: IndexReader, similarity: Arc<dyn Similarity>) -> Searcher {
        Searcher { reader, similarity }
    }

    pub fn reader(&self) -> &IndexReader {
        &self.reader
    }

    pub fn doc(&self, doc: DocId) -> SearchResult<Document> {
        self.reader.document(doc)
    }

    pub fn doc_freq(&self, term: &Term) -> SearchResult<u32> {
        self.reader.doc_freq(term)
    }

    /// Reduces the query to primitive form, iterating until a fixpoint.
    pub fn rewrite(&self, query: &Query) -> SearchResult<Query> {
        let leaves: Vec<&SegmentReader> =
            self.reader.leaves().iter().map(|l| l.as_ref()).collect();
        let mut current = query.clone();
        for _ in 0..MAX_REWRITE_ROUNDS {
            let next = current.rewrite(&leaves)?;
            if next == current {
                return Ok(current);
            }
            current = next;
        }
        Err(SearchError::IllegalArgument(
            "query failed to reach a rewrite fixpoint".to_string(),
        ))
    }

    /// Builds the normalized weight for a query.
    pub fn weight(&self, query: &Query) -> SearchResult<Weight> {
        let rewritten = self.rewrite(query)?;
        let mut weight = Weight::create(&rewritten, self, &self.similarity)?;
        let sum = weight.sum_of_squared_weights();
        let norm = self.similarity.query_norm(sum);
        weight.normalize(norm);
        Ok(weight)
    }

    /// Top-`n` hits by descending score.
    pub fn search(&self, query: &Query, n: usize) -> SearchResult<TopDocs> {
        let mut collector = TopDocsCollector::new(n);
        self.search_collector(query, &mut collector)?;
        Ok(collector.into_top_docs())
    }

    /// Feeds every hit to the caller's collector, leaf by leaf.
    pub fn search_collector(
        &self,
        query: &Query,
        collector: &mut dyn Collector,
    ) -> SearchResult<()> {
        let weight = self.weight(query)?;
        for (leaf, &doc_base) in self
            .reader
            .leaves()
            .iter()
            .zip(self.reader.doc_bases().iter())
        {
            collector.set_next_reader(doc_base)?;
            if let Some(mut scorer) = weight.scorer(leaf.as_ref())? {
                loop {
                    let doc = scorer.next_doc()?;
                    if doc == NO_MORE_DOCS {
                        break;
                    }
                    let score = scorer.score()?;
                    collector.collect(doc, score)?;
                }
            }
        }
        Ok(())
    }
}

struct LeafStats<'a> {
    reader: &'a SegmentReader,
}

impl SearchStats for LeafStats<'_> {
    fn doc_freq(&self, term: &Term) -> SearchResult<u32> {
        self.reader.doc_freq(term)
    }

    fn max_doc(&self) -> u32 {
        self.reader.max_doc().max(1)
    }
}

/// Every live doc of one segment matching `query`; the writer uses this
/// to apply buffered delete-by-query.
pub(crate) fn docs_matching(
    query: &Query,
    reader: &SegmentReader,
) -> SearchResult<Vec<DocId>> {
    let leaves = [reader];
    let mut rewritten = query.clone();
    for _ in 0..MAX_REWRITE_ROUNDS {
        let next = rewritten.rewrite(&leaves)?;
        if next == rewritten {
            break;
        }
        rewritten = next;
    }
    let stats = LeafStats { reader };
    let similarity: Arc<dyn Similarity> = Arc::new(DefaultSimilarity);
    let mut weight = Weight::create(&rewritten, &stats, &similarity)?;
    weight.normalize(1.0);
    let mut docs = Vec::new();
    if let Some(mut scorer) = weight.scorer(reader)? {
        loop {
            let doc = scorer.next_doc()?;
            if doc == NO_MORE_DOCS {
                break;
            }
            docs.push(doc);
        }
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::WhitespaceAnalyzer;
    use crate::config::IndexWriterConfig;
    use crate::directory::{DirectoryRc, RamDirectory};
    use crate::document::Field;
    use crate::index::merge_scheduler::SerialMergeScheduler;
    use crate::index::writer::IndexWriter;
    use crate::search::field_cache::FieldCacheRangeFilter;
    use crate::search::query::{BooleanClause, Occur};
    use crate::search::spans::SpanQuery;

    fn index(bodies: &[&str]) -> Searcher {
        let dir: DirectoryRc = RamDirectory::new();
        let config = IndexWriterConfig::new(Arc::new(WhitespaceAnalyzer))
            .merge_scheduler(Arc::new(SerialMergeScheduler));
        let writer = IndexWriter::open(Arc::clone(&dir), config).unwrap();
        for (i, body) in bodies.iter().enumerate() {
            let mut doc = Document::new();
            doc.add(Field::text("body", *body));
            doc.add(Field::int("num", i as i64 * 10));
            writer.add_document(&doc).unwrap();
        }
        writer.close(true).unwrap();
        Searcher::new(IndexReader::open(dir).unwrap())
    }

    fn hit_docs(searcher: &Searcher, query: &Query) -> Vec<DocId> {
        let mut docs: Vec<DocId> = searcher
            .search(query, 100)
            .unwrap()
            .score_docs
            .iter()
            .map(|sd| sd.doc)
            .collect();
        docs.sort_unstable();
        docs
    }

    #[test]
    fn phrase_respects_slop() {
        let searcher = index(&["quick brown fox"]);
        let tight = Query::phrase("body", vec!["quick".into(), "fox".into()], 0);
        assert_eq!(hit_docs(&searcher, &tight), Vec::<DocId>::new());
        let slack = Query::phrase("body", vec!["quick".into(), "fox".into()], 1);
        assert_eq!(hit_docs(&searcher, &slack), vec![0]);
        let exact = Query::phrase(
            "body",
            vec!["quick".into(), "brown".into(), "fox".into()],
            0,
        );
        assert_eq!(hit_docs(&searcher, &exact), vec![0]);
    }

    #[test]
    fn boolean_clause_semantics() {
        let searcher = index(&["apple pie", "apple tart", "peach pie"]);
        let query = Query::boolean(vec![
            BooleanClause {
                occur: Occur::Must,
                query: Query::term(Term::new("body", "apple")),
            },
            BooleanClause {
                occur: Occur::MustNot,
                query: Query::term(Term::new("body", "tart")),
            },
        ]);
        assert_eq!(hit_docs(&searcher, &query), vec![0]);

        let either = Query::boolean(vec![
            BooleanClause {
                occur: Occur::Should,
                query: Query::term(Term::new("body", "tart")),
            },
            BooleanClause {
                occur: Occur::Should,
                query: Query::term(Term::new("body", "peach")),
            },
        ]);
        assert_eq!(hit_docs(&searcher, &either), vec![1, 2]);

        // matching both optional clauses outranks matching one
        let overlap = Query::boolean(vec![
            BooleanClause {
                occur: Occur::Should,
                query: Query::term(Term::new("body", "apple")),
            },
            BooleanClause {
                occur: Occur::Should,
                query: Query::term(Term::new("body", "pie")),
            },
        ]);
        let top = searcher.search(&overlap, 10).unwrap();
        assert_eq!(top.total_hits, 3);
        assert_eq!(top.score_docs[0].doc, 0);
    }

    #[test]
    fn empty_boolean_matches_nothing() {
        let searcher = index(&["anything"]);
        let query = Query::boolean(Vec::new());
        assert_eq!(searcher.search(&query, 10).unwrap().total_hits, 0);
    }

    #[test]
    fn fuzzy_at_full_similarity_equals_term_query() {
        let searcher = index(&["wizard duel", "lizard pond", "gizzard stew"]);
        let fuzzy = Query::fuzzy(Term::new("body", "wizard"), 1.0, 0);
        let term = Query::term(Term::new("body", "wizard"));
        assert_eq!(hit_docs(&searcher, &fuzzy), hit_docs(&searcher, &term));

        // "lizard" is one edit away; "gizzard" is two and stays out
        let loose = Query::fuzzy(Term::new("body", "wizard"), 0.75, 0);
        assert_eq!(hit_docs(&searcher, &loose), vec![0, 1]);
    }

    #[test]
    fn prefix_and_term_range_expand() {
        let searcher = index(&["car", "cart", "dog"]);
        assert_eq!(
            hit_docs(&searcher, &Query::prefix(Term::new("body", "car"))),
            vec![0, 1]
        );

        let range = Query::TermRange {
            field: "body".to_string(),
            lower: Some("car".to_string()),
            upper: Some("dog".to_string()),
            include_lower: true,
            include_upper: false,
            boost: 1.0,
        };
        assert_eq!(hit_docs(&searcher, &range), vec![0, 1]);

        let exclusive = Query::TermRange {
            field: "body".to_string(),
            lower: Some("car".to_string()),
            upper: Some("dog".to_string()),
            include_lower: false,
            include_upper: true,
            boost: 1.0,
        };
        assert_eq!(hit_docs(&searcher, &exclusive), vec![1, 2]);
    }

    #[test]
    fn numeric_range_over_encoded_terms() {
        let searcher = index(&["a", "b", "c", "d"]);
        // nums are 0, 10, 20, 30
        let query = Query::NumericRange {
            field: "num".to_string(),
            lower: Some(10),
            upper: Some(30),
            include_lower: true,
            include_upper: false,
            boost: 1.0,
        };
        assert_eq!(hit_docs(&searcher, &query), vec![1, 2]);
    }

    #[test]
    fn multi_phrase_alternatives() {
        let searcher = index(&["big red barn", "big blue barn", "small red barn"]);
        let query = Query::MultiPhrase {
            field: "body".to_string(),
            positions: vec![
                vec!["big".to_string()],
                vec!["red".to_string(), "blue".to_string()],
                vec!["barn".to_string()],
            ],
            slop: 0,
            boost: 1.0,
        };
        assert_eq!(hit_docs(&searcher, &query), vec![0, 1]);
    }

    #[test]
    fn match_all_and_filtered() {
        let searcher = index(&["one", "two", "three", "four"]);
        assert_eq!(
            searcher.search(&Query::match_all(), 10).unwrap().total_hits,
            4
        );

        let filtered = Query::Filtered {
            query: Box::new(Query::match_all()),
            filter: FieldCacheRangeFilter::Int {
                field: "num".to_string(),
                lower: Some(10),
                upper: Some(20),
                include_lower: true,
                include_upper: true,
            },
        };
        assert_eq!(hit_docs(&searcher, &filtered), vec![1, 2]);
    }

    #[test]
    fn span_near_orders_terms() {
        let searcher = index(&["quick brown fox", "fox outruns the quick hound"]);
        let ordered = Query::Span(SpanQuery::Near {
            clauses: vec![
                SpanQuery::Term {
                    term: Term::new("body", "quick"),
                    boost: 1.0,
                },
                SpanQuery::Term {
                    term: Term::new("body", "fox"),
                    boost: 1.0,
                },
            ],
            slop: 1,
            in_order: true,
            boost: 1.0,
        });
        // only doc 0 has "quick" before "fox" within one position of slack
        assert_eq!(hit_docs(&searcher, &ordered), vec![0]);

        let first = Query::Span(SpanQuery::First {
            inner: Box::new(SpanQuery::Term {
                term: Term::new("body", "fox"),
                boost: 1.0,
            }),
            end: 1,
            boost: 1.0,
        });
        assert_eq!(hit_docs(&searcher, &first), vec![1]);
    }

    #[test]
    fn collector_contract_streams_all_leaves() {
        let dir: DirectoryRc = RamDirectory::new();
        let config = IndexWriterConfig::new(Arc::new(WhitespaceAnalyzer))
            .merge_scheduler(Arc::new(SerialMergeScheduler))
            .merge_policy(Arc::new(crate::index::merge_policy::NoMergePolicy));
        let writer = IndexWriter::open(Arc::clone(&dir), config).unwrap();
        writer.add_document(&{
            let mut d = Document::new();
            d.add(Field::text("body", "shared alpha"));
            d
        }).unwrap();
        writer.commit().unwrap();
        writer.add_document(&{
            let mut d = Document::new();
            d.add(Field::text("body", "shared beta"));
            d
        }).unwrap();
        writer.close(true).unwrap();

        let reader = IndexReader::open(dir).unwrap();
        assert_eq!(reader.leaves().len(), 2);
        let searcher = Searcher::new(reader);
        let mut collector = crate::search::collector::TotalHitCountCollector::default();
        searcher
            .search_collector(&Query::term(Term::new("body", "shared")), &mut collector)
            .unwrap();
        assert_eq!(collector.total_hits, 2);
    }
}
