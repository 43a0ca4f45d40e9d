pub mod buffer;
pub mod decider;
pub mod error;
pub mod indexer;
pub mod prompts;
pub mod query;
pub mod registry;
pub mod report;
pub mod retry;
pub mod segmenter;
pub mod source;
pub mod summarizer;
pub mod tools;
pub mod truncate;

pub use buffer::RollingBuffer;
pub use decider::{BoundaryDecider, DecisionOutcome, FallbackPolicy, Rejection};
pub use error::EngineError;
pub use indexer::Indexer;
pub use query::{Examination, NodeOverview, QueryError, QuerySurface, SearchHit};
pub use registry::ToolRegistry;
pub use report::{BudgetStage, BudgetWarning, BuildReport, FallbackRecord};
pub use segmenter::{SegmentationOutcome, Segmenter, SegmenterState, Strategy};
pub use source::{DocumentSource, FileSource, TextSource};
pub use summarizer::{SummaryBuilder, SummaryOutcome};
