pub mod deleter;
pub mod deletion_policy;
pub mod doc_writer;
pub mod merge_policy;
pub mod merge_scheduler;
pub mod merger;
pub mod reader;
pub mod segment_infos;
pub mod writer;

pub use deletion_policy::{
    DeletionPolicy, ExpirationTimeDeletionPolicy, IndexCommit, KeepLastN, KeepOnlyLastCommit,
    SnapshotDeletionPolicy,
};
pub use merge_policy::{
    LogByteSizeMergePolicy, LogDocMergePolicy, MergePolicy, MergeSpecification, NoMergePolicy,
    OneMerge,
};
pub use merge_scheduler::{ConcurrentMergeScheduler, MergeScheduler, SerialMergeScheduler};
pub use reader::{IndexReader, MultiTermDocs, MultiTermEnum, MultiTermPositions, SegmentReader};
pub use segment_infos::{SegmentInfo, SegmentInfos};
pub use writer::IndexWriter;
