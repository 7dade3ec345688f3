//! Slice routing for sliced output
//!
//! Organizations hash onto `logical_partitions`, which are split into
//! `slice_count` contiguous ranges. An organization therefore always lands on
//! the same slice for a given configuration.

use metrics_indexer_core::OrgId;
use serde::{Deserialize, Serialize};

use crate::config::SlicingConfig;

/// Routing header attached to sliced output messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHeader {
    pub org_id: OrgId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRouter {
    logical_partitions: u64,
    slice_count: u64,
}

impl SliceRouter {
    pub fn new(config: &SlicingConfig) -> Self {
        Self {
            logical_partitions: u64::from(config.logical_partitions.max(1)),
            slice_count: u64::from(config.slice_count.max(1)),
        }
    }

    pub fn logical_partition(&self, org_id: OrgId) -> u64 {
        org_id % self.logical_partitions
    }

    /// Slice id in `0..slice_count`
    pub fn slice_for(&self, org_id: OrgId) -> u32 {
        (self.logical_partition(org_id) * self.slice_count / self.logical_partitions) as u32
    }

    pub fn slice_count(&self) -> u32 {
        self.slice_count as u32
    }
}
