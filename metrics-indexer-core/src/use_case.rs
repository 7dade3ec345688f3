//! Use case identifiers
//!
//! Every metric belongs to a use case (its MRI namespace). A consumer is
//! configured with a [`UseCaseKey`] which decides which use cases it serves
//! and which tag validation policy applies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{IndexerError, IndexerResult};

/// Per-message use case, derived from the metric namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseCaseId {
    Sessions,
    Transactions,
    Spans,
    Custom,
    EscalatingIssues,
}

/// Consumer-level use case grouping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseCaseKey {
    ReleaseHealth,
    Performance,
}

impl UseCaseId {
    pub fn as_str(&self) -> &'static str {
        match self {
            UseCaseId::Sessions => "sessions",
            UseCaseId::Transactions => "transactions",
            UseCaseId::Spans => "spans",
            UseCaseId::Custom => "custom",
            UseCaseId::EscalatingIssues => "escalating_issues",
        }
    }

    /// Map an MRI namespace onto its use case
    pub fn from_namespace(namespace: &str) -> IndexerResult<Self> {
        namespace.parse()
    }
}

impl FromStr for UseCaseId {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sessions" => Ok(UseCaseId::Sessions),
            "transactions" => Ok(UseCaseId::Transactions),
            "spans" => Ok(UseCaseId::Spans),
            "custom" => Ok(UseCaseId::Custom),
            "escalating_issues" => Ok(UseCaseId::EscalatingIssues),
            other => Err(IndexerError::parse(format!("Unknown use case: {}", other))),
        }
    }
}

impl fmt::Display for UseCaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl UseCaseKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            UseCaseKey::ReleaseHealth => "release_health",
            UseCaseKey::Performance => "performance",
        }
    }

    /// Whether a consumer for this key processes messages of `use_case`.
    /// Release health owns sessions; every other namespace is generic.
    pub fn serves(&self, use_case: UseCaseId) -> bool {
        match self {
            UseCaseKey::ReleaseHealth => use_case == UseCaseId::Sessions,
            UseCaseKey::Performance => use_case != UseCaseId::Sessions,
        }
    }
}

impl FromStr for UseCaseKey {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "release_health" | "release-health" => Ok(UseCaseKey::ReleaseHealth),
            "performance" => Ok(UseCaseKey::Performance),
            other => Err(IndexerError::configuration(format!(
                "Invalid use case key: {}. Valid options: release_health, performance",
                other
            ))),
        }
    }
}

impl fmt::Display for UseCaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
