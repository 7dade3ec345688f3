//! Transport-level message types
//!
//! A [`RawMessage`] is what the external transport delivers: the encoded
//! payload plus the partition/offset it was read from. The [`BrokerMeta`]
//! is the join key used to re-attach results to their source message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Partition and offset of a message on the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BrokerMeta {
    pub partition: u32,
    pub offset: u64,
}

impl BrokerMeta {
    pub fn new(partition: u32, offset: u64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for BrokerMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.offset)
    }
}

/// A single transport header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new<N: Into<String>, V: Into<Vec<u8>>>(name: N, value: V) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An encoded message as delivered by the transport. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    meta: BrokerMeta,
    key: Option<Vec<u8>>,
    headers: Vec<Header>,
    payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(meta: BrokerMeta, payload: Vec<u8>) -> Self {
        Self {
            meta,
            key: None,
            headers: Vec::new(),
            payload,
        }
    }

    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_headers(mut self, headers: Vec<Header>) -> Self {
        self.headers = headers;
        self
    }

    pub fn meta(&self) -> BrokerMeta {
        self.meta
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Split into (meta, key, headers, payload)
    pub fn into_parts(self) -> (BrokerMeta, Option<Vec<u8>>, Vec<Header>, Vec<u8>) {
        (self.meta, self.key, self.headers, self.payload)
    }
}
