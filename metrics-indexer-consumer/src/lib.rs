//! Metrics String Indexer Consumer Library
//!
//! Turns batches of raw ingest metrics into batches whose metric names and
//! tag strings are replaced by integer ids, while enforcing per-organization
//! cardinality limits.

// Core modules
pub mod batch;
pub mod config;
pub mod indexer;
pub mod limiters;
pub mod metrics;
pub mod processing;
pub mod routing;

// Re-export commonly used types
pub use batch::{DropReason, IndexerBatch, IndexerOutputBatch, OutputMessage};
pub use config::MetricsIngestConfiguration;
pub use indexer::{build_indexer, FetchType, KeyResults, OrgStrings, StringIndexer};
pub use limiters::{CardinalityLimiter, CardinalityLimiterState};
pub use processing::{MessageProcessor, ProcessedBatch};
