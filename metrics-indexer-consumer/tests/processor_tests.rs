//! End-to-end tests for the message processor
//!
//! Batches are fed through `MessageProcessor` exactly as the transport would
//! deliver them, and the output, drop accounting and metrics are checked.

use async_trait::async_trait;
use metrics_indexer_consumer::{
    batch::{DropReason, IndexerOutputBatch, MAPPING_SOURCES_HEADER, METRIC_TYPE_HEADER},
    config::{CardinalityQuota, MetricsIngestConfiguration},
    indexer::build_indexer,
    limiters::{
        CardinalityLimiter, CardinalityLimiterState, CardinalityStore, MemoryCardinalityStore,
        WindowedCardinalityLimiter,
    },
    routing::{RoutingHeader, SliceRouter},
    MessageProcessor,
};
use metrics_indexer_core::{
    BrokerMeta, GenericMetricsTagsValidator, IndexedTagValue, IndexerError, IndexerResult,
    ParsedPayload, RawMessage, UseCaseKey,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

const COUNT: &str = "c:transactions/count@none";

fn payload(org_id: u64, name: &str, tags: Value) -> Value {
    json!({
        "version": 2,
        "org_id": org_id,
        "project_id": 10,
        "name": name,
        "type": "c",
        "value": 1.0,
        "timestamp": 1_700_000_000u64,
        "tags": tags,
    })
}

fn raw(offset: u64, value: &Value) -> RawMessage {
    RawMessage::new(BrokerMeta::new(0, offset), serde_json::to_vec(value).unwrap())
}

fn counter(offset: u64, org_id: u64, tags: Value) -> RawMessage {
    raw(offset, &payload(org_id, COUNT, tags))
}

fn quota(limit: u64) -> CardinalityQuota {
    CardinalityQuota {
        window_seconds: 3600,
        granularity_seconds: 600,
        limit,
    }
}

fn limited_config(limit: u64) -> MetricsIngestConfiguration {
    let mut config = MetricsIngestConfiguration::default();
    config.cardinality.quotas = vec![quota(limit)];
    config
}

#[cfg(test)]
mod accounting_tests {
    use super::*;

    #[tokio::test]
    async fn test_output_plus_drops_equals_input() {
        let mut processor = MessageProcessor::from_config(limited_config(2)).unwrap();

        let mut unsupported = payload(1, COUNT, json!({}));
        unsupported["version"] = json!(1);

        let messages = vec![
            counter(0, 1, json!({"transaction": "/a"})),
            RawMessage::new(BrokerMeta::new(0, 1), b"{not json".to_vec()),
            raw(2, &unsupported),
            counter(3, 1, json!({"bad key": "x"})),
            counter(4, 1, json!({"transaction": "/b"})),
            counter(5, 1, json!({"transaction": "/c"})),
        ];
        let input = messages.len() as u64;

        let processed = processor.process_batch(messages).await.unwrap();

        assert_eq!(processed.output.len() as u64 + processed.drops.total(), input);
        assert_eq!(processed.output.len(), 2);
        assert_eq!(processed.drops.get(DropReason::Parse), 2);
        assert_eq!(processed.drops.get(DropReason::Validation), 1);
        assert_eq!(processed.drops.get(DropReason::Cardinality), 1);
        assert_eq!(processed.invalid_msg_meta.len(), 2);

        assert_eq!(processor.metrics().messages_received.get(), input);
        assert_eq!(processor.metrics().messages_emitted.get(), 2);
        assert_eq!(processor.metrics().dropped("parse"), 2);
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_cardinality_drops_without_limits() {
        let mut processor = MessageProcessor::from_config(Default::default()).unwrap();

        let messages: Vec<_> = (0..200)
            .map(|i| counter(i, 1, json!({"transaction": format!("/t/{}", i)})))
            .collect();
        let processed = processor.process_batch(messages).await.unwrap();

        assert_eq!(processed.output.len(), 200);
        assert_eq!(processed.drops.get(DropReason::Cardinality), 0);
        assert_eq!(processor.metrics().keys_to_remove.get(), 0);
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_output_preserves_input_order() {
        let mut processor = MessageProcessor::from_config(Default::default()).unwrap();
        let messages = vec![
            counter(7, 3, json!({})),
            RawMessage::new(BrokerMeta::new(0, 8), b"bad".to_vec()),
            counter(9, 1, json!({})),
            counter(10, 2, json!({})),
        ];

        let output = processor.process_messages(messages).await.unwrap();
        let offsets: Vec<u64> = output.messages().map(|m| m.meta.offset).collect();
        assert_eq!(offsets, vec![7, 9, 10]);
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_health_consumer_skips_other_use_cases() {
        let mut config = MetricsIngestConfiguration::default();
        config.use_case = UseCaseKey::ReleaseHealth;
        let mut processor = MessageProcessor::from_config(config).unwrap();

        let session = raw(
            0,
            &payload(1, "c:sessions/session@none", json!({"session.status": "init"})),
        );
        let transaction = counter(1, 1, json!({}));

        let processed = processor
            .process_batch(vec![session, transaction])
            .await
            .unwrap();
        assert_eq!(processed.output.len(), 1);
        assert_eq!(processed.drops.get(DropReason::Validation), 1);
        processor.shutdown().await.unwrap();
    }
}

#[cfg(test)]
mod cardinality_scenario_tests {
    use super::*;

    #[tokio::test]
    async fn test_same_series_twice_with_quota_one() {
        let mut processor = MessageProcessor::from_config(limited_config(1)).unwrap();
        let tags = json!({"transaction": "/checkout"});

        let output = processor
            .process_messages(vec![counter(0, 1, tags.clone()), counter(1, 1, tags)])
            .await
            .unwrap();

        assert_eq!(output.len(), 2);
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_org_at_capacity_drops_new_series() {
        let mut processor = MessageProcessor::from_config(limited_config(1)).unwrap();

        let first = processor
            .process_messages(vec![counter(0, 1, json!({"transaction": "/a"}))])
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = processor
            .process_messages(vec![counter(1, 1, json!({"transaction": "/b"}))])
            .await
            .unwrap();

        assert_eq!(second.len(), 0);
        assert_eq!(processor.metrics().dropped("cardinality"), 1);

        // Already admitted series keep flowing
        let third = processor
            .process_messages(vec![counter(2, 1, json!({"transaction": "/a"}))])
            .await
            .unwrap();
        assert_eq!(third.len(), 1);
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_messages_do_not_use_quota() {
        let mut processor = MessageProcessor::from_config(limited_config(1)).unwrap();

        let processed = processor
            .process_batch(vec![
                counter(0, 1, json!({"bad key": "x"})),
                counter(1, 1, json!({"transaction": "/ok"})),
            ])
            .await
            .unwrap();
        let offsets: Vec<u64> = processed.output.messages().map(|m| m.meta.offset).collect();
        assert_eq!(offsets, vec![1]);
        assert_eq!(processed.drops.get(DropReason::Validation), 1);
        assert_eq!(processed.drops.get(DropReason::Cardinality), 0);

        let output = processor
            .process_messages(vec![counter(2, 1, json!({"transaction": "/ok"}))])
            .await
            .unwrap();
        assert_eq!(output.len(), 1);
        assert_eq!(processor.metrics().dropped("cardinality"), 0);
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stripped_tag_counts_as_emitted_series() {
        let mut processor = MessageProcessor::from_config(limited_config(1)).unwrap();

        // Both messages become the same series once the bad value is stripped
        let output = processor
            .process_messages(vec![
                counter(0, 1, json!({"transaction": "/a", "note": "x\u{0002}"})),
                counter(1, 1, json!({"transaction": "/a"})),
            ])
            .await
            .unwrap();
        assert_eq!(output.len(), 2);
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_other_orgs_unaffected() {
        let mut processor = MessageProcessor::from_config(limited_config(1)).unwrap();

        let output = processor
            .process_messages(vec![
                counter(0, 1, json!({"transaction": "/a"})),
                counter(1, 1, json!({"transaction": "/b"})),
                counter(2, 2, json!({"transaction": "/b"})),
            ])
            .await
            .unwrap();

        let offsets: Vec<u64> = output.messages().map(|m| m.meta.offset).collect();
        assert_eq!(offsets, vec![0, 2]);
        processor.shutdown().await.unwrap();
    }
}

/// Limiter wrapper that records the order of checks and (slow) applies
struct RecordingLimiter {
    inner: WindowedCardinalityLimiter,
    events: Arc<Mutex<Vec<&'static str>>>,
    apply_delay: Duration,
}

#[async_trait]
impl CardinalityLimiter for RecordingLimiter {
    async fn check_cardinality_limits(
        &self,
        use_case_key: UseCaseKey,
        payloads: &[(BrokerMeta, ParsedPayload)],
    ) -> IndexerResult<CardinalityLimiterState> {
        self.events.lock().push("check");
        self.inner
            .check_cardinality_limits(use_case_key, payloads)
            .await
    }

    async fn apply_cardinality_limits(&self, state: CardinalityLimiterState) -> IndexerResult<()> {
        self.events.lock().push("apply_start");
        tokio::time::sleep(self.apply_delay).await;
        let result = self.inner.apply_cardinality_limits(state).await;
        self.events.lock().push("apply_end");
        result
    }
}

/// Window store whose reads or writes fail
struct FailingStore {
    fail_reads: bool,
}

#[async_trait]
impl CardinalityStore for FailingStore {
    async fn accepted(
        &self,
        _scope: &str,
        _granules: RangeInclusive<u64>,
    ) -> IndexerResult<HashSet<u64>> {
        if self.fail_reads {
            Err(IndexerError::limiter("window store unavailable"))
        } else {
            Ok(HashSet::new())
        }
    }

    async fn record(
        &self,
        _scope: &str,
        _granule: u64,
        _hashes: &[u64],
        _oldest_kept: u64,
    ) -> IndexerResult<()> {
        Err(IndexerError::limiter("window store unavailable"))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

fn processor_with_limiter(
    config: MetricsIngestConfiguration,
    limiter: Arc<dyn CardinalityLimiter>,
) -> MessageProcessor {
    let indexer = build_indexer(&config).unwrap();
    MessageProcessor::with_components(
        config,
        indexer,
        limiter,
        Arc::new(GenericMetricsTagsValidator::default()),
    )
    .unwrap()
}

#[cfg(test)]
mod pipelining_tests {
    use super::*;

    #[tokio::test]
    async fn test_apply_completes_before_next_check() {
        let config = limited_config(100);
        let events = Arc::new(Mutex::new(Vec::new()));
        let limiter = RecordingLimiter {
            inner: WindowedCardinalityLimiter::new(
                Arc::new(MemoryCardinalityStore::new()),
                config.cardinality.clone(),
            ),
            events: Arc::clone(&events),
            apply_delay: Duration::from_millis(50),
        };
        let mut processor = processor_with_limiter(config, Arc::new(limiter));

        for i in 0..3u64 {
            processor
                .process_messages(vec![counter(i, 1, json!({"transaction": format!("/{}", i)}))])
                .await
                .unwrap();
        }
        processor.join().await.unwrap();

        assert_eq!(
            *events.lock(),
            vec![
                "check",
                "apply_start",
                "apply_end",
                "check",
                "apply_start",
                "apply_end",
                "check",
                "apply_start",
                "apply_end",
            ]
        );
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_apply_still_limits_next_batch() {
        let config = limited_config(1);
        let limiter = RecordingLimiter {
            inner: WindowedCardinalityLimiter::new(
                Arc::new(MemoryCardinalityStore::new()),
                config.cardinality.clone(),
            ),
            events: Arc::new(Mutex::new(Vec::new())),
            apply_delay: Duration::from_millis(100),
        };
        let mut processor = processor_with_limiter(config, Arc::new(limiter));

        let first = processor
            .process_messages(vec![counter(0, 1, json!({"transaction": "/a"}))])
            .await
            .unwrap();
        let second = processor
            .process_messages(vec![counter(1, 1, json!({"transaction": "/b"}))])
            .await
            .unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 0);
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_failure_surfaces_at_next_batch() {
        let config = limited_config(10);
        let limiter = WindowedCardinalityLimiter::new(
            Arc::new(FailingStore { fail_reads: false }),
            config.cardinality.clone(),
        );
        let mut processor = processor_with_limiter(config, Arc::new(limiter));

        // The first batch succeeds; its apply fails in the background
        processor
            .process_messages(vec![counter(0, 1, json!({}))])
            .await
            .unwrap();

        let err = processor
            .process_messages(vec![counter(1, 1, json!({}))])
            .await
            .unwrap_err();
        assert_eq!(err.category(), "limiter");
        assert_eq!(processor.metrics().apply_failures.get(), 1);
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_failure_ignored_when_fail_open() {
        let mut config = limited_config(10);
        config.cardinality.fail_open = true;
        let limiter = WindowedCardinalityLimiter::new(
            Arc::new(FailingStore { fail_reads: false }),
            config.cardinality.clone(),
        );
        let mut processor = processor_with_limiter(config, Arc::new(limiter));

        for i in 0..2 {
            processor
                .process_messages(vec![counter(i, 1, json!({}))])
                .await
                .unwrap();
        }
        processor.join().await.unwrap();
        assert_eq!(processor.metrics().apply_failures.get(), 2);
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_check_failure_policy() {
        let closed = limited_config(1);
        let limiter = WindowedCardinalityLimiter::new(
            Arc::new(FailingStore { fail_reads: true }),
            closed.cardinality.clone(),
        );
        let mut processor = processor_with_limiter(closed, Arc::new(limiter));
        assert!(processor
            .process_messages(vec![counter(0, 1, json!({}))])
            .await
            .is_err());
        processor.shutdown().await.unwrap();

        let mut open = limited_config(1);
        open.cardinality.fail_open = true;
        let limiter = WindowedCardinalityLimiter::new(
            Arc::new(FailingStore { fail_reads: true }),
            open.cardinality.clone(),
        );
        let mut processor = processor_with_limiter(open, Arc::new(limiter));
        let output = processor
            .process_messages(vec![
                counter(0, 1, json!({"transaction": "/a"})),
                counter(1, 1, json!({"transaction": "/b"})),
            ])
            .await
            .unwrap();
        assert_eq!(output.len(), 2);
        processor.shutdown().await.unwrap();
    }
}

#[cfg(test)]
mod indexing_tests {
    use super::*;

    #[tokio::test]
    async fn test_ids_stable_across_batches() {
        let mut processor = MessageProcessor::from_config(Default::default()).unwrap();
        let tags = json!({"transaction": "/home", "region": "eu"});

        let first = processor
            .process_messages(vec![counter(0, 1, tags.clone())])
            .await
            .unwrap();
        let second = processor
            .process_messages(vec![counter(1, 1, tags)])
            .await
            .unwrap();

        let a = first.messages().next().unwrap();
        let b = second.messages().next().unwrap();
        assert_eq!(a.payload.metric_id, b.payload.metric_id);
        assert_eq!(a.payload.tags, b.payload.tags);
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_round_trip_resolves_every_reference() {
        let mut processor = MessageProcessor::from_config(Default::default()).unwrap();
        let output = processor
            .process_messages(vec![
                counter(0, 1, json!({"transaction": "/a", "environment": "prod"})),
                counter(1, 2, json!({"custom": "value"})),
            ])
            .await
            .unwrap();
        assert_eq!(output.len(), 2);

        let indexer = processor.indexer().clone();
        for message in output.messages() {
            let org = message.payload.org_id;
            assert_eq!(
                indexer
                    .reverse_resolve(org, message.payload.metric_id)
                    .await
                    .unwrap()
                    .as_deref(),
                Some(COUNT)
            );
            for (key_id, value) in &message.payload.tags {
                assert!(indexer.reverse_resolve(org, *key_id).await.unwrap().is_some());
                let IndexedTagValue::Id(value_id) = value else {
                    panic!("tag values should be indexed");
                };
                assert!(indexer.reverse_resolve(org, *value_id).await.unwrap().is_some());
            }
        }
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_control_character_strips_only_that_tag() {
        let mut processor = MessageProcessor::from_config(Default::default()).unwrap();
        let output = processor
            .process_messages(vec![counter(
                0,
                1,
                json!({"transaction": "/a", "note": "line\u{0001}feed"}),
            )])
            .await
            .unwrap();

        assert_eq!(output.len(), 1);
        let message = output.messages().next().unwrap();
        assert_eq!(message.payload.tags.len(), 1);
        for strings in message.payload.mapping_meta.values() {
            assert!(!strings.values().any(|s| s == "note"));
        }
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_raw_tag_values_when_not_indexed() {
        let mut config = MetricsIngestConfiguration::default();
        config.should_index_tag_values = false;
        let mut processor = MessageProcessor::from_config(config).unwrap();

        let output = processor
            .process_messages(vec![counter(0, 1, json!({"transaction": "/a"}))])
            .await
            .unwrap();
        let message = output.messages().next().unwrap();
        assert_eq!(
            message.payload.tags.values().next(),
            Some(&IndexedTagValue::Raw("/a".to_string()))
        );
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mapping_headers() {
        let mut processor = MessageProcessor::from_config(Default::default()).unwrap();
        let tags = json!({"environment": "staging"});

        let first = processor
            .process_messages(vec![counter(0, 1, tags.clone())])
            .await
            .unwrap();
        let message = first.messages().next().unwrap();
        // "environment" is hardcoded; the name and "staging" are new
        assert_eq!(message.header(MAPPING_SOURCES_HEADER), Some(&b"fh"[..]));
        assert_eq!(message.header(METRIC_TYPE_HEADER), Some(&b"c"[..]));
        assert_eq!(message.payload.mapping_meta["f"].len(), 2);
        assert_eq!(message.payload.mapping_meta["h"].len(), 1);

        let second = processor
            .process_messages(vec![counter(1, 1, tags)])
            .await
            .unwrap();
        let message = second.messages().next().unwrap();
        assert_eq!(message.header(MAPPING_SOURCES_HEADER), Some(&b"ch"[..]));
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limited_strings_drop_message() {
        let mut config = MetricsIngestConfiguration::default();
        config.writes_limiter.per_org = vec![metrics_indexer_consumer::config::WriteQuota {
            window_seconds: 3600,
            limit: 3,
        }];
        let mut processor = MessageProcessor::from_config(config).unwrap();

        let processed = processor
            .process_batch(vec![
                counter(0, 1, json!({"color": "red"})),
                counter(1, 1, json!({"shape": "round"})),
            ])
            .await
            .unwrap();

        let offsets: Vec<u64> = processed.output.messages().map(|m| m.meta.offset).collect();
        assert_eq!(offsets, vec![0]);
        assert_eq!(processed.drops.get(DropReason::Indexer), 1);
        processor.shutdown().await.unwrap();
    }
}

#[cfg(test)]
mod slicing_tests {
    use super::*;

    fn sliced_config() -> MetricsIngestConfiguration {
        let mut config = MetricsIngestConfiguration::default();
        config.is_output_sliced = true;
        config.slicing.logical_partitions = 16;
        config.slicing.slice_count = 4;
        config
    }

    #[tokio::test]
    async fn test_orgs_route_to_stable_slices() {
        let config = sliced_config();
        let router = SliceRouter::new(&config.slicing);
        let mut processor = MessageProcessor::from_config(config).unwrap();

        for round in 0..2u64 {
            let messages: Vec<_> = (1..=20u64)
                .map(|org| counter(round * 100 + org, org, json!({})))
                .collect();
            let output = processor.process_messages(messages).await.unwrap();

            let IndexerOutputBatch::Sliced(slices) = output else {
                panic!("expected sliced output");
            };
            assert_eq!(slices.values().map(Vec::len).sum::<usize>(), 20);

            for (slice, messages) in &slices {
                assert!(*slice < 4);
                for message in messages {
                    let org_id = message.payload.org_id;
                    assert_eq!(router.slice_for(org_id), *slice);
                    assert_eq!(message.routing, Some(RoutingHeader { org_id }));
                }
            }
        }
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsliced_output_has_no_routing() {
        let mut processor = MessageProcessor::from_config(Default::default()).unwrap();
        let output = processor
            .process_messages(vec![counter(0, 1, json!({}))])
            .await
            .unwrap();

        assert!(matches!(output, IndexerOutputBatch::Single(_)));
        assert!(output.messages().all(|m| m.routing.is_none()));
        processor.shutdown().await.unwrap();
    }
}
