//! Batch transformer: parse, filter, extract strings, reconstruct
//!
//! An [`IndexerBatch`] holds one delivered batch while it moves through the
//! pipeline. Messages that fail a stage are dropped and counted; the batch
//! itself never fails. Surviving messages keep their input order.

use metrics_indexer_core::{
    BrokerMeta, Header, IndexedPayload, IndexedTagValue, IndexerError, IngestCodec, ParsedPayload,
    RawMessage, TagsValidator, UseCaseId, UseCaseKey,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{error, trace, warn};

use crate::indexer::{KeyResults, OrgStrings};
use crate::routing::{RoutingHeader, SliceRouter};

pub const MAPPING_SOURCES_HEADER: &str = "mapping_sources";
pub const METRIC_TYPE_HEADER: &str = "metric_type";

/// Why a message was left out of the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DropReason {
    Parse,
    Validation,
    Cardinality,
    Indexer,
}

impl DropReason {
    pub const ALL: [DropReason; 4] = [
        DropReason::Parse,
        DropReason::Validation,
        DropReason::Cardinality,
        DropReason::Indexer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Parse => "parse",
            DropReason::Validation => "validation",
            DropReason::Cardinality => "cardinality",
            DropReason::Indexer => "indexer",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dropped message counts per reason
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropCounts {
    counts: BTreeMap<DropReason, u64>,
}

impl DropCounts {
    pub fn record(&mut self, reason: DropReason) {
        *self.counts.entry(reason).or_insert(0) += 1;
    }

    pub fn get(&self, reason: DropReason) -> u64 {
        self.counts.get(&reason).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DropReason, u64)> + '_ {
        self.counts.iter().map(|(reason, count)| (*reason, *count))
    }
}

/// An indexed message ready for the output topic
#[derive(Debug, Clone, PartialEq)]
pub struct OutputMessage {
    pub meta: BrokerMeta,
    pub key: Option<Vec<u8>>,
    pub headers: Vec<Header>,
    pub payload: IndexedPayload,
    /// Set in sliced mode
    pub routing: Option<RoutingHeader>,
}

impl OutputMessage {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .rev()
            .find(|h| h.name == name)
            .map(|h| h.value.as_slice())
    }
}

/// Output of one batch, either flat or grouped by destination slice
#[derive(Debug, Clone, PartialEq)]
pub enum IndexerOutputBatch {
    Single(Vec<OutputMessage>),
    Sliced(BTreeMap<u32, Vec<OutputMessage>>),
}

impl IndexerOutputBatch {
    pub fn len(&self) -> usize {
        match self {
            IndexerOutputBatch::Single(messages) => messages.len(),
            IndexerOutputBatch::Sliced(slices) => slices.values().map(Vec::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All messages; in sliced mode grouped by slice id
    pub fn messages(&self) -> Box<dyn Iterator<Item = &OutputMessage> + '_> {
        match self {
            IndexerOutputBatch::Single(messages) => Box::new(messages.iter()),
            IndexerOutputBatch::Sliced(slices) => Box::new(slices.values().flatten()),
        }
    }
}

/// Settings shared by every batch of one processor
#[derive(Clone)]
pub struct BatchOptions {
    pub use_case_key: UseCaseKey,
    pub should_index_tag_values: bool,
    pub validator: Arc<dyn TagsValidator>,
    /// Present when output is sliced
    pub router: Option<SliceRouter>,
}

struct Envelope {
    key: Option<Vec<u8>>,
    headers: Vec<Header>,
}

pub struct IndexerBatch {
    options: BatchOptions,
    codec: IngestCodec,
    parsed: Vec<(BrokerMeta, ParsedPayload)>,
    envelopes: HashMap<BrokerMeta, Envelope>,
    invalid_msg_meta: BTreeSet<BrokerMeta>,
    drops: DropCounts,
    payload_bytes: BTreeMap<UseCaseId, u64>,
    input_count: usize,
}

impl IndexerBatch {
    pub fn new(options: BatchOptions) -> Self {
        Self {
            options,
            codec: IngestCodec::new(),
            parsed: Vec::new(),
            envelopes: HashMap::new(),
            invalid_msg_meta: BTreeSet::new(),
            drops: DropCounts::default(),
            payload_bytes: BTreeMap::new(),
            input_count: 0,
        }
    }

    /// Decode raw messages and apply the tag validator. Failures are
    /// recorded, never raised.
    pub fn parse(&mut self, messages: Vec<RawMessage>) {
        let mut seen: HashSet<BrokerMeta> = self.parsed.iter().map(|(meta, _)| *meta).collect();

        for message in messages {
            self.input_count += 1;
            let (meta, key, headers, payload) = message.into_parts();

            if !seen.insert(meta) {
                warn!("Duplicate message meta {}, skipping", meta);
                self.drops.record(DropReason::Parse);
                continue;
            }

            let mut parsed = match self.codec.decode(&payload) {
                Ok(parsed) => parsed,
                Err(e @ IndexerError::Validation(_)) => {
                    warn!("Invalid message {}: {}", meta, e);
                    self.drops.record(DropReason::Validation);
                    continue;
                }
                Err(e) => {
                    warn!("Failed to parse message {}: {}", meta, e);
                    self.drops.record(DropReason::Parse);
                    self.invalid_msg_meta.insert(meta);
                    continue;
                }
            };

            if !self.options.use_case_key.serves(parsed.use_case_id) {
                warn!(
                    "Message {} has use case {} not served by {} consumer",
                    meta, parsed.use_case_id, self.options.use_case_key
                );
                self.drops.record(DropReason::Validation);
                continue;
            }

            if !self.validate_tags(meta, &mut parsed) {
                self.drops.record(DropReason::Validation);
                continue;
            }

            *self.payload_bytes.entry(parsed.use_case_id).or_insert(0) += payload.len() as u64;
            trace!("Parsed {} for org {}: {}", meta, parsed.org_id, parsed.name);

            self.envelopes.insert(meta, Envelope { key, headers });
            self.parsed.push((meta, parsed));
        }
    }

    /// Apply the tag policy in place. Returns false when the whole message
    /// must be dropped.
    ///
    /// An invalid key always drops the message. An invalid value strips that
    /// tag when values are indexed; raw values are forwarded verbatim, so in
    /// that mode the message is dropped instead.
    fn validate_tags(&self, meta: BrokerMeta, payload: &mut ParsedPayload) -> bool {
        let validator = &self.options.validator;

        if let Some(key) = payload.tags.keys().find(|k| !validator.is_key_allowed(k)) {
            warn!(
                "Dropping {} for org {}: invalid tag key {:?}",
                meta, payload.org_id, key
            );
            return false;
        }

        let invalid_values: Vec<String> = payload
            .tags
            .iter()
            .filter(|(_, v)| !validator.is_value_allowed(v))
            .map(|(k, _)| k.to_string())
            .collect();

        if invalid_values.is_empty() {
            return true;
        }

        if !self.options.should_index_tag_values {
            warn!(
                "Dropping {} for org {}: invalid tag values for {:?}",
                meta, payload.org_id, invalid_values
            );
            return false;
        }

        warn!(
            "Stripping invalid tag values from {} for org {}: {:?}",
            meta, payload.org_id, invalid_values
        );
        for key in &invalid_values {
            payload.tags.remove(key);
        }
        true
    }

    /// Drop messages rejected by the cardinality limiter
    pub fn filter_messages(&mut self, keys_to_remove: &BTreeSet<BrokerMeta>) {
        if keys_to_remove.is_empty() {
            return;
        }

        let drops = &mut self.drops;
        let envelopes = &mut self.envelopes;
        self.parsed.retain(|(meta, _)| {
            if !keys_to_remove.contains(meta) {
                return true;
            }
            trace!("Dropping {} over cardinality limit", meta);
            drops.record(DropReason::Cardinality);
            envelopes.remove(meta);
            false
        });
    }

    /// Strings the surviving messages need indexed
    pub fn extract_strings(&self) -> OrgStrings {
        let mut strings = OrgStrings::new();
        for (_, payload) in &self.parsed {
            strings.insert(payload.org_id, payload.name.as_str());
            for (key, value) in payload.tags.iter() {
                strings.insert(payload.org_id, key);
                if self.options.should_index_tag_values {
                    strings.insert(payload.org_id, value);
                }
            }
        }
        strings
    }

    /// Replace strings with ids. Messages with any unresolved string are dropped.
    pub fn reconstruct_messages(&mut self, results: &KeyResults) -> IndexerOutputBatch {
        let parsed = std::mem::take(&mut self.parsed);
        let mut output = Vec::with_capacity(parsed.len());

        for (meta, payload) in parsed {
            let envelope = self.envelopes.remove(&meta);
            match self.reconstruct_one(&payload, results) {
                Ok(indexed) => {
                    let Envelope { key, mut headers } = envelope.unwrap_or(Envelope {
                        key: None,
                        headers: Vec::new(),
                    });
                    let sources: String = indexed.mapping_meta.keys().map(String::as_str).collect();
                    headers.push(Header::new(MAPPING_SOURCES_HEADER, sources));
                    headers.push(Header::new(METRIC_TYPE_HEADER, payload.metric_type()));

                    let routing = self.options.router.map(|_| RoutingHeader {
                        org_id: payload.org_id,
                    });

                    output.push(OutputMessage {
                        meta,
                        key,
                        headers,
                        payload: indexed,
                        routing,
                    });
                }
                Err(missing) => {
                    error!(
                        "Failed to index message {} for org {}: unresolved string {:?}",
                        meta, payload.org_id, missing
                    );
                    self.drops.record(DropReason::Indexer);
                }
            }
        }

        match self.options.router {
            None => IndexerOutputBatch::Single(output),
            Some(router) => {
                let mut slices: BTreeMap<u32, Vec<OutputMessage>> = BTreeMap::new();
                for message in output {
                    slices
                        .entry(router.slice_for(message.payload.org_id))
                        .or_default()
                        .push(message);
                }
                IndexerOutputBatch::Sliced(slices)
            }
        }
    }

    /// Build the indexed payload, or return the first string without an id
    fn reconstruct_one(
        &self,
        payload: &ParsedPayload,
        results: &KeyResults,
    ) -> Result<IndexedPayload, String> {
        let org_id = payload.org_id;
        let mut mapping_meta: BTreeMap<String, BTreeMap<u64, String>> = BTreeMap::new();

        let mut resolve = |s: &str| -> Result<u64, String> {
            let id = results.get(org_id, s).ok_or_else(|| s.to_string())?;
            if let Some(metadata) = results.metadata(org_id, s) {
                mapping_meta
                    .entry(metadata.fetch_type.code().to_string())
                    .or_default()
                    .insert(id, s.to_string());
            }
            Ok(id)
        };

        let metric_id = resolve(payload.name.as_str())?;

        let mut tags = BTreeMap::new();
        for (key, value) in payload.tags.iter() {
            let key_id = resolve(key)?;
            let value = if self.options.should_index_tag_values {
                IndexedTagValue::Id(resolve(value)?)
            } else {
                IndexedTagValue::Raw(value.to_string())
            };
            tags.insert(key_id, value);
        }

        Ok(IndexedPayload {
            version: self.codec.version(),
            org_id,
            project_id: payload.project_id,
            use_case_id: payload.use_case_id,
            metric_id,
            value: payload.value.clone(),
            timestamp: payload.timestamp,
            tags,
            retention_days: payload.retention_days,
            mapping_meta,
        })
    }

    /// Surviving payloads in input order
    pub fn payloads(&self) -> &[(BrokerMeta, ParsedPayload)] {
        &self.parsed
    }

    /// Messages that could not be decoded, for dead-lettering
    pub fn invalid_msg_meta(&self) -> &BTreeSet<BrokerMeta> {
        &self.invalid_msg_meta
    }

    pub fn drops(&self) -> &DropCounts {
        &self.drops
    }

    /// Encoded payload bytes per use case, for cost accounting
    pub fn payload_bytes(&self) -> &BTreeMap<UseCaseId, u64> {
        &self.payload_bytes
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }
}
