//! # Metrics Indexer Core Library
//!
//! Shared types for the metrics string indexer consumer.
//!
//! ## Features
//!
//! - **Messages**: transport messages and their partition/offset join keys
//! - **Payloads**: the versioned ingest wire format and its indexed output form
//! - **Validation**: per-use-case tag validators
//! - **Fingerprints**: stable series identities for cardinality accounting

pub mod codec;
pub mod error;
pub mod fingerprint;
pub mod message;
pub mod metric_name;
pub mod payload;
pub mod tags;
pub mod use_case;
pub mod validation;

// Re-export commonly used types
pub use codec::{IngestCodec, SUPPORTED_VERSION};
pub use error::{IndexerError, IndexerResult};
pub use fingerprint::Fingerprint;
pub use message::{BrokerMeta, Header, RawMessage};
pub use metric_name::MetricName;
pub use payload::{
    GaugeValue, IndexedPayload, IndexedTagValue, IngestPayload, MetricValue, ParsedPayload,
};
pub use tags::TagSet;
pub use use_case::{UseCaseId, UseCaseKey};
pub use validation::{
    GenericMetricsTagsValidator, ReleaseHealthTagsValidator, TagLimits, TagsValidator,
};

/// Organization identifier
pub type OrgId = u64;

/// Version information for the metrics indexer
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum length for metric names
pub const MAX_METRIC_NAME_LENGTH: usize = 200;

/// Maximum length for tag keys
pub const MAX_TAG_KEY_LENGTH: usize = 200;

/// Maximum length for tag values of generic metrics
pub const MAX_TAG_VALUE_LENGTH: usize = 1000;

/// Maximum length for release health tag values
pub const RELEASE_HEALTH_MAX_TAG_VALUE_LENGTH: usize = 200;

/// Retention applied when a payload does not carry one
pub const DEFAULT_RETENTION_DAYS: u16 = 90;
