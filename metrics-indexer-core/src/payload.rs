//! Ingest and indexed payload types
//!
//! [`IngestPayload`] is the wire shape of an incoming metric. After decoding
//! it becomes a [`ParsedPayload`]; once its strings have been interned it is
//! emitted as an [`IndexedPayload`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

use crate::error::{IndexerError, IndexerResult};
use crate::fingerprint::Fingerprint;
use crate::metric_name::MetricName;
use crate::tags::TagSet;
use crate::use_case::UseCaseId;
use crate::OrgId;

fn default_retention_days() -> u16 {
    crate::DEFAULT_RETENTION_DAYS
}

/// Aggregated gauge value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaugeValue {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: u64,
    pub last: f64,
}

/// Metric value, tagged by its single-letter metric type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum MetricValue {
    #[serde(rename = "c")]
    Counter(f64),
    #[serde(rename = "s")]
    Set(Vec<u32>),
    #[serde(rename = "d")]
    Distribution(Vec<f64>),
    #[serde(rename = "g")]
    Gauge(GaugeValue),
}

impl MetricValue {
    /// Single-letter metric type as used on the wire
    pub fn metric_type(&self) -> &'static str {
        match self {
            MetricValue::Counter(_) => "c",
            MetricValue::Set(_) => "s",
            MetricValue::Distribution(_) => "d",
            MetricValue::Gauge(_) => "g",
        }
    }

    /// Reject values downstream storage cannot represent
    pub fn check(&self) -> IndexerResult<()> {
        let finite = match self {
            MetricValue::Counter(v) => v.is_finite(),
            MetricValue::Set(_) => true,
            MetricValue::Distribution(values) => values.iter().all(|v| v.is_finite()),
            MetricValue::Gauge(g) => {
                [g.min, g.max, g.sum, g.last].iter().all(|v| v.is_finite()) && g.min <= g.max
            }
        };

        if finite {
            Ok(())
        } else {
            Err(IndexerError::validation(format!(
                "Invalid {} value: must be finite",
                self.metric_type()
            )))
        }
    }
}

/// Incoming metric as encoded on the ingest topic
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct IngestPayload {
    /// Schema version, checked by the codec before decoding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,

    #[validate(range(min = 1, message = "org_id must be positive"))]
    pub org_id: OrgId,

    pub project_id: u64,

    /// Explicit use case. Derived from the MRI namespace when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_case_id: Option<UseCaseId>,

    #[validate(length(min = 1, message = "Metric name cannot be empty"))]
    pub name: String,

    #[serde(flatten)]
    pub value: MetricValue,

    /// Unix seconds
    pub timestamp: u64,

    #[serde(default)]
    #[validate(length(max = 100, message = "Too many tags"))]
    pub tags: BTreeMap<String, String>,

    #[serde(default = "default_retention_days")]
    pub retention_days: u16,
}

/// A decoded, structurally valid metric awaiting indexing
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPayload {
    pub org_id: OrgId,
    pub project_id: u64,
    pub use_case_id: UseCaseId,
    pub name: MetricName,
    pub value: MetricValue,
    pub timestamp: u64,
    pub tags: TagSet,
    pub retention_days: u16,
}

impl ParsedPayload {
    pub fn metric_type(&self) -> &'static str {
        self.value.metric_type()
    }

    /// Series identity used for cardinality accounting
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(self.org_id, self.use_case_id, &self.name, &self.tags)
    }
}

/// Tag value after indexing: an id, or the raw string when values are not interned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexedTagValue {
    Id(u64),
    Raw(String),
}

/// A metric whose strings have been replaced by integer ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedPayload {
    pub version: u32,
    pub org_id: OrgId,
    pub project_id: u64,
    pub use_case_id: UseCaseId,
    pub metric_id: u64,
    #[serde(flatten)]
    pub value: MetricValue,
    pub timestamp: u64,
    pub tags: BTreeMap<u64, IndexedTagValue>,
    pub retention_days: u16,
    /// Fetch type code → (id → string) for every string this message used
    pub mapping_meta: BTreeMap<String, BTreeMap<u64, String>>,
}
