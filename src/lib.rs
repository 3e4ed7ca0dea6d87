pub mod analysis;
pub mod codec;
pub mod config;
pub mod directory;
pub mod document;
pub mod error;
pub mod index;
pub mod search;
pub mod util;

pub use analysis::{Analyzer, KeywordAnalyzer, PerFieldAnalyzer, SimpleAnalyzer, WhitespaceAnalyzer};
pub use config::{IndexWriterConfig, OpenMode};
pub use directory::{Directory, DirectoryRc, FsDirectory, RamDirectory};
pub use document::{Document, Field, FieldOptions, FieldValue, Term};
pub use error::{SearchError, SearchResult};
pub use index::{IndexReader, IndexWriter};
pub use search::{Query, Searcher, TopDocs};
pub use util::{DocId, NO_MORE_DOCS};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempdir::TempDir;

    use crate::analysis::WhitespaceAnalyzer;
    use crate::config::IndexWriterConfig;
    use crate::directory::{DirectoryRc, FsDirectory};
    use crate::document::{Document, Field, Term};
    use crate::index::{IndexReader, IndexWriter};
    use crate::search::{Query, Searcher};

    #[test]
    fn usage() {
        let tmp_dir = TempDir::new("fulltext").unwrap();
        let dir: DirectoryRc = FsDirectory::open(tmp_dir.path()).unwrap();
        let config = IndexWriterConfig::new(Arc::new(WhitespaceAnalyzer));

        {
            // write
            let writer = IndexWriter::open(Arc::clone(&dir), config).unwrap();
            for (id, body) in [(1, "foo bar"), (2, "foo baz"), (3, "biz buz")] {
                let mut doc = Document::new();
                doc.add(Field::keyword("id", id.to_string()));
                doc.add(Field::text("body", body));
                writer.add_document(&doc).unwrap();
            }
            writer.commit().unwrap();

            // overwrite doc 3
            let mut doc = Document::new();
            doc.add(Field::keyword("id", "3"));
            doc.add(Field::text("body", "overwritten"));
            writer.update_document(Term::new("id", "3"), &doc).unwrap();
            writer.close(true).unwrap();
        }

        {
            // read back stored fields through a search
            let reader = IndexReader::open(Arc::clone(&dir)).unwrap();
            assert_eq!(reader.num_docs(), 3);
            let searcher = Searcher::new(reader.clone());

            let hits = searcher
                .search(&Query::term(Term::new("body", "foo")), 10)
                .unwrap();
            assert_eq!(hits.total_hits, 2);

            let hits = searcher
                .search(&Query::term(Term::new("body", "overwritten")), 10)
                .unwrap();
            assert_eq!(hits.total_hits, 1);
            let doc = searcher.doc(hits.score_docs[0].doc).unwrap();
            assert_eq!(doc.get("id").unwrap().value.as_text(), Some("3"));

            let hits = searcher
                .search(&Query::term(Term::new("body", "missing")), 10)
                .unwrap();
            assert_eq!(hits.total_hits, 0);
            reader.close().unwrap();
        }
    }
}
