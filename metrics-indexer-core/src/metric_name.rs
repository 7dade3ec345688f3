//! Metric name types and MRI parsing
//!
//! Metric names are metric resource identifiers (MRIs) of the form
//! `<type>:<namespace>/<name>@<unit>`, e.g. `c:transactions/count@none`.
//! Plain names are accepted as well; they just carry no namespace.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{IndexerError, IndexerResult};
use crate::use_case::UseCaseId;

/// Metric name - the string identifier of a metric
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MetricName(String);

/// The components of a well-formed MRI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mri<'a> {
    pub entity: &'a str,
    pub namespace: &'a str,
    pub name: &'a str,
    pub unit: &'a str,
}

impl MetricName {
    /// Create a new metric name
    pub fn new<S: Into<String>>(name: S) -> IndexerResult<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(IndexerError::validation("Metric name cannot be empty"));
        }

        if name.len() > crate::MAX_METRIC_NAME_LENGTH {
            return Err(IndexerError::validation(format!(
                "Metric name too long: {} > {}",
                name.len(),
                crate::MAX_METRIC_NAME_LENGTH
            )));
        }

        if name.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(IndexerError::validation(
                "Metric name contains invalid characters",
            ));
        }

        Ok(Self(name))
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the metric name is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Split the name into its MRI components, if it is one
    pub fn mri(&self) -> Option<Mri<'_>> {
        let (entity, rest) = self.0.split_once(':')?;
        let (namespace, rest) = rest.split_once('/')?;
        let (name, unit) = match rest.rsplit_once('@') {
            Some((name, unit)) => (name, unit),
            None => (rest, "none"),
        };

        if entity.is_empty() || namespace.is_empty() || name.is_empty() {
            return None;
        }

        Some(Mri {
            entity,
            namespace,
            name,
            unit,
        })
    }

    /// Use case implied by the MRI namespace
    pub fn use_case(&self) -> Option<UseCaseId> {
        self.mri()
            .and_then(|mri| UseCaseId::from_namespace(mri.namespace).ok())
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for MetricName {
    type Error = IndexerError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<MetricName> for String {
    fn from(name: MetricName) -> Self {
        name.0
    }
}

impl AsRef<str> for MetricName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for MetricName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for MetricName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
