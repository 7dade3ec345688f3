//! Versioned ingest codec
//!
//! Decodes JSON ingest payloads into [`ParsedPayload`]s and encodes
//! [`IndexedPayload`]s for the output topic.

use serde::Deserialize;
use validator::Validate;

use crate::error::{IndexerError, IndexerResult};
use crate::metric_name::MetricName;
use crate::payload::{IndexedPayload, IngestPayload, ParsedPayload};

/// The only ingest schema version this codec accepts
pub const SUPPORTED_VERSION: u32 = 2;

#[derive(Deserialize)]
struct SchemaHeader {
    #[serde(default)]
    version: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestCodec {
    version: u32,
}

impl Default for IngestCodec {
    fn default() -> Self {
        Self {
            version: SUPPORTED_VERSION,
        }
    }
}

impl IngestCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Decode a raw payload.
    ///
    /// Malformed JSON and schema mismatches are `Parse`/`SchemaVersion`
    /// errors; structurally valid payloads with bad field values are
    /// `Validation` errors.
    pub fn decode(&self, bytes: &[u8]) -> IndexerResult<ParsedPayload> {
        let header: SchemaHeader = serde_json::from_slice(bytes)
            .map_err(|e| IndexerError::parse(format!("Invalid ingest payload: {}", e)))?;

        match header.version {
            Some(v) if v == self.version => {}
            Some(v) => {
                return Err(IndexerError::SchemaVersion(format!(
                    "got {}, expected {}",
                    v, self.version
                )))
            }
            None => {
                return Err(IndexerError::SchemaVersion(
                    "missing version field".to_string(),
                ))
            }
        }

        let payload: IngestPayload = serde_json::from_slice(bytes)
            .map_err(|e| IndexerError::parse(format!("Invalid ingest payload: {}", e)))?;

        payload
            .validate()
            .map_err(|e| IndexerError::validation(e.to_string()))?;
        payload.value.check()?;

        let name = MetricName::new(payload.name)?;
        let use_case_id = match payload.use_case_id {
            Some(use_case) => use_case,
            None => name.use_case().ok_or_else(|| {
                IndexerError::parse(format!("Cannot derive use case from metric name {}", name))
            })?,
        };

        Ok(ParsedPayload {
            org_id: payload.org_id,
            project_id: payload.project_id,
            use_case_id,
            name,
            value: payload.value,
            timestamp: payload.timestamp,
            tags: payload.tags.into_iter().collect(),
            retention_days: payload.retention_days,
        })
    }

    pub fn encode(&self, payload: &IndexedPayload) -> IndexerResult<Vec<u8>> {
        Ok(serde_json::to_vec(payload)?)
    }
}
