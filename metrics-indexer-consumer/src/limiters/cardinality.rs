//! Per-organization cardinality limiting
//!
//! Each (use case key, organization) pair has a sliding window of accepted
//! series fingerprints per quota. Checking a batch decides which new series
//! still fit; applying the resulting state records the granted ones. The two
//! steps are split so that the apply of one batch can overlap the next batch.

use async_trait::async_trait;
use metrics_indexer_core::{
    BrokerMeta, Fingerprint, IndexerResult, OrgId, ParsedPayload, UseCaseKey,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::store::CardinalityStore;
use crate::config::{CardinalityConfig, CardinalityQuota};

/// Hashes granted for one scope and quota, waiting to be recorded
#[derive(Debug, Clone, PartialEq, Eq)]
struct Grant {
    scope: String,
    granule: u64,
    oldest_kept: u64,
    hashes: Vec<u64>,
}

/// Outcome of a check: messages to drop plus the grants to record later
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardinalityLimiterState {
    keys_to_remove: BTreeSet<BrokerMeta>,
    grants: Vec<Grant>,
}

impl CardinalityLimiterState {
    /// A state that removes and records nothing
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn keys_to_remove(&self) -> &BTreeSet<BrokerMeta> {
        &self.keys_to_remove
    }

    /// Number of fingerprint grants awaiting apply
    pub fn granted_count(&self) -> usize {
        self.grants.iter().map(|g| g.hashes.len()).sum()
    }

    pub fn has_grants(&self) -> bool {
        !self.grants.is_empty()
    }
}

#[async_trait]
pub trait CardinalityLimiter: Send + Sync {
    /// Decide which payloads exceed their organization's quotas.
    /// `payloads` is in input order; earlier series win the last free slots.
    async fn check_cardinality_limits(
        &self,
        use_case_key: UseCaseKey,
        payloads: &[(BrokerMeta, ParsedPayload)],
    ) -> IndexerResult<CardinalityLimiterState>;

    /// Record the grants of a previous check
    async fn apply_cardinality_limits(&self, state: CardinalityLimiterState) -> IndexerResult<()>;
}

/// Sliding-window limiter over a [`CardinalityStore`]
pub struct WindowedCardinalityLimiter {
    store: Arc<dyn CardinalityStore>,
    config: CardinalityConfig,
}

/// Distinct fingerprints of one scope in first-seen order
struct ScopeRequest {
    org_id: OrgId,
    order: Vec<Fingerprint>,
    metas: BTreeMap<Fingerprint, Vec<BrokerMeta>>,
}

fn scope_prefix(use_case_key: UseCaseKey, org_id: OrgId) -> String {
    format!("{}-{}", use_case_key.as_str(), org_id)
}

fn quota_scope(prefix: &str, quota: &CardinalityQuota) -> String {
    format!("{}:{}:{}", prefix, quota.window_seconds, quota.granularity_seconds)
}

/// (current granule, first granule inside the window)
fn window_bounds(quota: &CardinalityQuota, now: u64) -> (u64, u64) {
    let granule = now / quota.granularity_seconds;
    let granules_per_window = (quota.window_seconds / quota.granularity_seconds).max(1);
    (granule, granule.saturating_sub(granules_per_window - 1))
}

impl WindowedCardinalityLimiter {
    pub fn new(store: Arc<dyn CardinalityStore>, config: CardinalityConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CardinalityConfig {
        &self.config
    }

    /// Check as of `now` (unix seconds)
    pub async fn check_at(
        &self,
        use_case_key: UseCaseKey,
        payloads: &[(BrokerMeta, ParsedPayload)],
        now: u64,
    ) -> IndexerResult<CardinalityLimiterState> {
        let mut scopes: BTreeMap<OrgId, ScopeRequest> = BTreeMap::new();

        for (meta, payload) in payloads {
            let org_id = payload.org_id;
            if !self.config.is_rolled_out(org_id) || self.config.quotas_for(org_id).is_empty() {
                continue;
            }

            let request = scopes.entry(org_id).or_insert_with(|| ScopeRequest {
                org_id,
                order: Vec::new(),
                metas: BTreeMap::new(),
            });
            let fingerprint = payload.fingerprint();
            let metas = request.metas.entry(fingerprint).or_default();
            if metas.is_empty() {
                request.order.push(fingerprint);
            }
            metas.push(*meta);
        }

        let mut state = CardinalityLimiterState::empty();
        for request in scopes.values() {
            self.check_scope(use_case_key, request, now, &mut state)
                .await?;
        }

        if !state.keys_to_remove.is_empty() {
            debug!(
                "Cardinality limiter rejected {} messages for {}",
                state.keys_to_remove.len(),
                use_case_key
            );
        }
        Ok(state)
    }

    async fn check_scope(
        &self,
        use_case_key: UseCaseKey,
        request: &ScopeRequest,
        now: u64,
        state: &mut CardinalityLimiterState,
    ) -> IndexerResult<()> {
        let prefix = scope_prefix(use_case_key, request.org_id);
        let quotas = self.config.quotas_for(request.org_id);

        let mut accepted: Vec<HashSet<u64>> = Vec::with_capacity(quotas.len());
        let mut remaining: Vec<u64> = Vec::with_capacity(quotas.len());
        for quota in quotas {
            let (granule, oldest) = window_bounds(quota, now);
            let set = self
                .store
                .accepted(&quota_scope(&prefix, quota), oldest..=granule)
                .await?;
            remaining.push(quota.limit.saturating_sub(set.len() as u64));
            accepted.push(set);
        }

        let mut granted = Vec::with_capacity(request.order.len());
        let mut rejected = 0usize;
        for fingerprint in &request.order {
            let hash = fingerprint.as_u64();
            let fits = accepted
                .iter()
                .zip(&remaining)
                .all(|(set, left)| set.contains(&hash) || *left > 0);

            if fits {
                for (set, left) in accepted.iter().zip(remaining.iter_mut()) {
                    if !set.contains(&hash) {
                        *left -= 1;
                    }
                }
                granted.push(hash);
            } else {
                rejected += 1;
                if let Some(metas) = request.metas.get(fingerprint) {
                    state.keys_to_remove.extend(metas.iter().copied());
                }
            }
        }

        if rejected > 0 {
            warn!(
                "Organization {} exceeded cardinality quota for {}: {} series rejected",
                request.org_id, use_case_key, rejected
            );
        }

        if !granted.is_empty() {
            for quota in quotas {
                let (granule, oldest_kept) = window_bounds(quota, now);
                state.grants.push(Grant {
                    scope: quota_scope(&prefix, quota),
                    granule,
                    oldest_kept,
                    hashes: granted.clone(),
                });
            }
        }

        Ok(())
    }
}

fn now_seconds() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[async_trait]
impl CardinalityLimiter for WindowedCardinalityLimiter {
    async fn check_cardinality_limits(
        &self,
        use_case_key: UseCaseKey,
        payloads: &[(BrokerMeta, ParsedPayload)],
    ) -> IndexerResult<CardinalityLimiterState> {
        match self.check_at(use_case_key, payloads, now_seconds()).await {
            Ok(state) => Ok(state),
            Err(e) if self.config.fail_open => {
                warn!("Cardinality check failed, admitting batch: {}", e);
                Ok(CardinalityLimiterState::empty())
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_cardinality_limits(&self, state: CardinalityLimiterState) -> IndexerResult<()> {
        for grant in &state.grants {
            self.store
                .record(&grant.scope, grant.granule, &grant.hashes, grant.oldest_kept)
                .await?;
        }
        Ok(())
    }
}
