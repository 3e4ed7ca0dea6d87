pub mod collector;
pub mod field_cache;
pub mod query;
pub mod scorer;
pub mod searcher;
pub mod similarity;
pub mod spans;

pub use collector::{Collector, ScoreDoc, TopDocs, TopDocsCollector, TotalHitCountCollector};
pub use field_cache::{CachedArray, FieldCache, FieldCacheRangeFilter, Parser};
pub use query::{max_clause_count, set_max_clause_count, BooleanClause, Occur, Query};
pub use scorer::{Scorer, Weight};
pub use searcher::Searcher;
pub use similarity::{decode_norm, encode_norm, DefaultSimilarity, Similarity};
pub use spans::SpanQuery;
