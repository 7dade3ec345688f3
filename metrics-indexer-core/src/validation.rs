//! Tag validation policies
//!
//! Validators are pure predicates. What happens to a rejected key or value
//! (drop the tag or the whole message) is decided by the batch transformer.

use crate::use_case::UseCaseKey;

/// Length limits applied to tag keys and values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagLimits {
    /// Maximum tag key length in bytes
    pub max_key_length: usize,
    /// Maximum tag value length in bytes
    pub max_value_length: usize,
}

impl Default for TagLimits {
    fn default() -> Self {
        Self {
            max_key_length: crate::MAX_TAG_KEY_LENGTH,
            max_value_length: crate::MAX_TAG_VALUE_LENGTH,
        }
    }
}

/// Predicate capability deciding whether tag keys and values may be indexed
pub trait TagsValidator: Send + Sync {
    fn is_key_allowed(&self, key: &str) -> bool;

    fn is_value_allowed(&self, value: &str) -> bool;

    /// Name used in logs and metric labels
    fn name(&self) -> &'static str;
}

fn key_within(limits: &TagLimits, key: &str) -> bool {
    !key.is_empty()
        && key.len() <= limits.max_key_length
        && key
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':'))
}

fn value_within(limits: &TagLimits, value: &str) -> bool {
    value.len() <= limits.max_value_length && !value.chars().any(char::is_control)
}

/// Validator for the generic (performance) metrics consumer
#[derive(Debug, Clone, Default)]
pub struct GenericMetricsTagsValidator {
    limits: TagLimits,
}

impl GenericMetricsTagsValidator {
    pub fn new(limits: TagLimits) -> Self {
        Self { limits }
    }
}

impl TagsValidator for GenericMetricsTagsValidator {
    fn is_key_allowed(&self, key: &str) -> bool {
        key_within(&self.limits, key)
    }

    fn is_value_allowed(&self, value: &str) -> bool {
        value_within(&self.limits, value)
    }

    fn name(&self) -> &'static str {
        "generic"
    }
}

/// Validator for release health metrics, which store tag values in narrower columns
#[derive(Debug, Clone)]
pub struct ReleaseHealthTagsValidator {
    limits: TagLimits,
}

impl Default for ReleaseHealthTagsValidator {
    fn default() -> Self {
        Self {
            limits: TagLimits {
                max_key_length: crate::MAX_TAG_KEY_LENGTH,
                max_value_length: crate::RELEASE_HEALTH_MAX_TAG_VALUE_LENGTH,
            },
        }
    }
}

impl TagsValidator for ReleaseHealthTagsValidator {
    fn is_key_allowed(&self, key: &str) -> bool {
        key_within(&self.limits, key)
    }

    fn is_value_allowed(&self, value: &str) -> bool {
        value_within(&self.limits, value)
    }

    fn name(&self) -> &'static str {
        "release_health"
    }
}

/// Default validator for a consumer's use case key
pub fn for_use_case_key(key: UseCaseKey) -> Box<dyn TagsValidator> {
    match key {
        UseCaseKey::ReleaseHealth => Box::new(ReleaseHealthTagsValidator::default()),
        UseCaseKey::Performance => Box::new(GenericMetricsTagsValidator::default()),
    }
}
