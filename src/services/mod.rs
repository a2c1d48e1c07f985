pub mod indexer;
pub mod query;

pub use indexer::{IndexError, IndexProgress, IndexState, IndexSummary, Indexer, RunOptions};
pub use query::{Page, QueryError, QueryService};
