//! Push fan-out.
//!
//! [`PushDispatcher::publish`] builds one PUSH message per domain event and
//! delivers it to every active subscriber of its object type through a
//! [`PushSink`]. Recipients are attempted concurrently and independently;
//! one failing or slow recipient never blocks the rest.
//!
//! Counters:
//!
//! - `totalAttempts` counts publications (including ones with no recipient)
//! - `successCount` / `failureCount` count per-recipient deliveries
//! - `lastPushTimestamp` is the time of the most recent publication
//!
//! They only reset through [`PushDispatcher::reset_stats`].

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use crossline_core::{
    CrosslineError, FailedItem, Message, MessageFactory, ObjectType, PayloadObject, Result,
    SubscriberId, SystemId,
};
use serde::Serialize;
use serde_json::Value;
use dashmap::DashMap;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, warn};

use crate::subscription::SubscriptionRegistry;

/// Delivers a built PUSH to one subscriber.
#[async_trait]
pub trait PushSink: Send + Sync {
    /// Deliver `message` to `subscriber`.
    async fn deliver(&self, subscriber: &SubscriberId, message: Message) -> Result<()>;
}

/// Point-in-time copy of the delivery counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushStats {
    /// Publications attempted.
    pub total_attempts: u64,
    /// Successful per-recipient deliveries.
    pub success_count: u64,
    /// Failed per-recipient deliveries.
    pub failure_count: u64,
    /// Time of the last publication.
    pub last_push_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Counters {
    total_attempts: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    last_push_ms: AtomicI64,
}

/// Outcome of one publication.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Recipients the push was addressed to.
    pub recipients: usize,
    /// Recipients that accepted the push.
    pub delivered: usize,
    /// Recipients that failed, with reasons.
    pub failed: Vec<FailedItem>,
    /// The object was empty and nothing was sent.
    pub skipped: bool,
}

impl PublishReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Whether every recipient accepted the push.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of a batch publication.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Items submitted.
    pub total: usize,
    /// Items delivered to every recipient.
    pub succeeded: usize,
    /// Empty items that were skipped.
    pub skipped: usize,
    /// Items that failed, identified by index.
    pub failed: Vec<FailedItem>,
}

type Lane = mpsc::UnboundedSender<(ObjectType, Value)>;

/// Builds PUSH messages and fans them out to subscribers.
pub struct PushDispatcher {
    factory: MessageFactory,
    peer: SystemId,
    registry: Arc<SubscriptionRegistry>,
    sink: Arc<dyn PushSink>,
    delivery_timeout: Duration,
    workers: Arc<Semaphore>,
    lanes: DashMap<String, Lane>,
    counters: Counters,
}

impl PushDispatcher {
    /// Create a dispatcher.
    ///
    /// `peer` is the recipient system id written into every PUSH;
    /// `worker_concurrency` bounds publications queued through
    /// [`publish_ordered`](Self::publish_ordered).
    pub fn new(
        factory: MessageFactory,
        peer: SystemId,
        registry: Arc<SubscriptionRegistry>,
        sink: Arc<dyn PushSink>,
        delivery_timeout: Duration,
        worker_concurrency: usize,
    ) -> Self {
        Self {
            factory,
            peer,
            registry,
            sink,
            delivery_timeout,
            workers: Arc::new(Semaphore::new(worker_concurrency.max(1))),
            lanes: DashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Subscription registry used for recipient lookup.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Publish one object to every subscriber of `object_type`.
    pub async fn publish(&self, object_type: ObjectType, data: Value) -> Result<PublishReport> {
        if !object_type.is_pushable() {
            return Err(CrosslineError::validation(format!(
                "object type '{object_type}' cannot be pushed"
            )));
        }
        let object = PayloadObject::from_value(object_type, data);
        if object.is_empty() {
            warn!(%object_type, "ignoring publish of empty object");
            return Ok(PublishReport::skipped());
        }

        let _ = self.counters.total_attempts.fetch_add(1, Ordering::Relaxed);
        self.counters
            .last_push_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        let recipients = self.registry.subscribers_for(object_type);
        if recipients.is_empty() {
            debug!(%object_type, "no subscribers");
            return Ok(PublishReport::default());
        }

        let message = self.factory.push(&self.peer, object)?;
        let deliveries = recipients.iter().map(|subscriber| {
            let message = message.clone();
            async move {
                let delivery = self.sink.deliver(subscriber, message);
                let outcome = tokio::time::timeout(self.delivery_timeout, delivery)
                    .await
                    .unwrap_or_else(|_| {
                        Err(CrosslineError::internal(format!(
                            "delivery timed out after {:?}",
                            self.delivery_timeout
                        )))
                    });
                (subscriber, outcome)
            }
        });
        let outcomes = futures::future::join_all(deliveries).await;

        let mut report = PublishReport {
            recipients: recipients.len(),
            ..PublishReport::default()
        };
        for (subscriber, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    let _ = self.counters.success.fetch_add(1, Ordering::Relaxed);
                    report.delivered += 1;
                }
                Err(e) => {
                    let _ = self.counters.failure.fetch_add(1, Ordering::Relaxed);
                    warn!(%subscriber, %object_type, error = %e, "push delivery failed");
                    report.failed.push(FailedItem {
                        id: subscriber.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Publish by wire name; unknown or non-pushable names are rejected.
    pub async fn publish_named(&self, object_type: &str, data: Value) -> Result<PublishReport> {
        let object_type = ObjectType::parse_pushable(object_type)?;
        self.publish(object_type, data).await
    }

    /// Serialize `value` and publish it.
    pub async fn publish_value<T: Serialize + Sync>(
        &self,
        object_type: ObjectType,
        value: &T,
    ) -> Result<PublishReport> {
        let data = serde_json::to_value(value)
            .map_err(|e| CrosslineError::internal(format!("serialize {object_type}: {e}")))?;
        self.publish(object_type, data).await
    }

    /// Publish every item, continuing past failures.
    pub async fn publish_batch(
        &self,
        items: Vec<Value>,
        object_type: ObjectType,
    ) -> Result<BatchReport> {
        if !object_type.is_pushable() {
            return Err(CrosslineError::validation(format!(
                "object type '{object_type}' cannot be pushed"
            )));
        }
        let mut report = BatchReport {
            total: items.len(),
            ..BatchReport::default()
        };
        for (index, item) in items.into_iter().enumerate() {
            match self.publish(object_type, item).await {
                Ok(r) if r.skipped => report.skipped += 1,
                Ok(r) if r.is_complete() => report.succeeded += 1,
                Ok(r) => report.failed.push(FailedItem {
                    id: index.to_string(),
                    reason: format!("{} of {} recipients failed", r.failed.len(), r.recipients),
                }),
                Err(e) => report.failed.push(FailedItem {
                    id: index.to_string(),
                    reason: e.to_string(),
                }),
            }
        }
        Ok(report)
    }

    /// Queue a publication behind earlier ones sharing `key`.
    ///
    /// Publications with the same key reach subscribers in call order; each
    /// key drains on its own task and takes a worker permit per item, so
    /// different keys proceed independently. Returns without waiting for
    /// delivery.
    pub fn publish_ordered(self: &Arc<Self>, key: &str, object_type: ObjectType, data: Value) {
        let lane = self
            .lanes
            .entry(key.to_owned())
            .or_insert_with(|| self.open_lane(key))
            .clone();
        if lane.send((object_type, data)).is_err() {
            let _ = self.lanes.remove(key);
            warn!(key, %object_type, "push lane closed, event dropped");
        }
    }

    fn open_lane(self: &Arc<Self>, key: &str) -> Lane {
        let (tx, mut rx) = mpsc::unbounded_channel::<(ObjectType, Value)>();
        let dispatcher = Arc::downgrade(self);
        let key = key.to_owned();
        let _ = tokio::spawn(async move {
            while let Some((object_type, data)) = rx.recv().await {
                let Some(dispatcher) = dispatcher.upgrade() else {
                    break;
                };
                let Ok(_permit) = Arc::clone(&dispatcher.workers).acquire_owned().await else {
                    break;
                };
                if let Err(e) = dispatcher.publish(object_type, data).await {
                    warn!(%key, %object_type, error = %e, "background publish failed");
                }
            }
            debug!(%key, "push lane drained");
        });
        tx
    }

    /// Keys with an open publication lane.
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Current counters.
    pub fn stats(&self) -> PushStats {
        let last_ms = self.counters.last_push_ms.load(Ordering::Relaxed);
        PushStats {
            total_attempts: self.counters.total_attempts.load(Ordering::Relaxed),
            success_count: self.counters.success.load(Ordering::Relaxed),
            failure_count: self.counters.failure.load(Ordering::Relaxed),
            last_push_timestamp: (last_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_ms).single())
                .flatten(),
        }
    }

    /// Zero every counter.
    pub fn reset_stats(&self) {
        self.counters.total_attempts.store(0, Ordering::Relaxed);
        self.counters.success.store(0, Ordering::Relaxed);
        self.counters.failure.store(0, Ordering::Relaxed);
        self.counters.last_push_ms.store(0, Ordering::Relaxed);
        crossline_core::logging::marker(
            "resetPushStats",
            "push",
            crossline_core::logging::MarkerOutcome::Succeeded,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingSink, StaticAuth, wait_until};
    use crossline_core::{MessageKind, PeerRole};
    use serde_json::json;

    fn dispatcher(sink: Arc<RecordingSink>) -> (Arc<PushDispatcher>, Arc<SubscriptionRegistry>) {
        let auth = Arc::new(StaticAuth::accepting(&["t"]));
        let registry = Arc::new(SubscriptionRegistry::new(auth));
        let dispatcher = Arc::new(PushDispatcher::new(
            MessageFactory::new("utcs", PeerRole::Lower),
            SystemId::from("platform"),
            Arc::clone(&registry),
            sink,
            Duration::from_secs(1),
            4,
        ));
        (dispatcher, registry)
    }

    async fn subscribe(registry: &SubscriptionRegistry, who: &str, ty: ObjectType) {
        let _ = registry
            .add_subscription(&SubscriberId::from(who), ty, "t")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn zero_subscribers_counts_attempt_only() {
        let sink = Arc::new(RecordingSink::default());
        let (d, _reg) = dispatcher(Arc::clone(&sink));

        let report = d
            .publish(ObjectType::CrossStage, json!({"crossId": "c1", "stageNo": 2}))
            .await
            .unwrap();
        assert_eq!(report.recipients, 0);

        let stats = d.stats();
        assert_eq!(stats.total_attempts, 1);
        assert_eq!(stats.success_count, 0);
        assert_eq!(stats.failure_count, 0);
        assert!(stats.last_push_timestamp.is_some());
    }

    #[tokio::test]
    async fn one_push_message_per_publication() {
        let sink = Arc::new(RecordingSink::default());
        let (d, reg) = dispatcher(Arc::clone(&sink));
        subscribe(&reg, "a", ObjectType::CrossStage).await;
        subscribe(&reg, "b", ObjectType::CrossStage).await;

        let report = d
            .publish(ObjectType::CrossStage, json!({"crossId": "c1"}))
            .await
            .unwrap();
        assert_eq!(report.delivered, 2);

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1.kind(), MessageKind::Push);
        assert_eq!(sent[0].1.sequence(), sent[1].1.sequence());
        assert_eq!(d.stats().success_count, 2);
    }

    #[tokio::test]
    async fn failing_recipient_does_not_block_others() {
        let sink = Arc::new(RecordingSink::failing_for(&["a"]));
        let (d, reg) = dispatcher(Arc::clone(&sink));
        subscribe(&reg, "a", ObjectType::CrossCycle).await;
        subscribe(&reg, "b", ObjectType::CrossCycle).await;

        let report = d
            .publish(ObjectType::CrossCycle, json!({"crossId": "c1"}))
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, "a");

        let stats = d.stats();
        assert_eq!((stats.success_count, stats.failure_count), (1, 1));
    }

    #[tokio::test]
    async fn empty_object_is_noop() {
        let sink = Arc::new(RecordingSink::default());
        let (d, reg) = dispatcher(Arc::clone(&sink));
        subscribe(&reg, "a", ObjectType::CrossStage).await;

        for data in [Value::Null, json!({})] {
            let report = d.publish(ObjectType::CrossStage, data).await.unwrap();
            assert!(report.skipped);
        }
        assert!(sink.sent().is_empty());
        assert_eq!(d.stats().total_attempts, 0);
    }

    #[tokio::test]
    async fn unsupported_type_name_is_validation_error() {
        let sink = Arc::new(RecordingSink::default());
        let (d, _reg) = dispatcher(sink);
        for name in ["NoSuchType", "AdjustStage"] {
            let err = d.publish_named(name, json!({"a": 1})).await.unwrap_err();
            assert_eq!(err.kind(), crossline_core::ErrorKind::Validation);
        }
    }

    #[tokio::test]
    async fn batch_aggregates_without_aborting() {
        let sink = Arc::new(RecordingSink::failing_for(&["a"]));
        let (d, reg) = dispatcher(Arc::clone(&sink));
        subscribe(&reg, "a", ObjectType::CrossTrafficData).await;

        let items = vec![json!({"n": 1}), json!(null), json!({"n": 2})];
        let report = d
            .publish_batch(items, ObjectType::CrossTrafficData)
            .await
            .unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.succeeded, 0);
        assert_eq!(
            report.failed.iter().map(|f| f.id.as_str()).collect::<Vec<_>>(),
            vec!["0", "2"]
        );
    }

    #[tokio::test]
    async fn reset_stats_zeroes_counters() {
        let sink = Arc::new(RecordingSink::default());
        let (d, reg) = dispatcher(Arc::clone(&sink));
        subscribe(&reg, "a", ObjectType::CrossStage).await;
        let _ = d
            .publish(ObjectType::CrossStage, json!({"x": 1}))
            .await
            .unwrap();

        d.reset_stats();
        assert_eq!(d.stats(), PushStats::default());
    }

    #[tokio::test]
    async fn ordered_publications_keep_call_order_per_key() {
        let sink = Arc::new(RecordingSink::default());
        let (d, reg) = dispatcher(Arc::clone(&sink));
        subscribe(&reg, "a", ObjectType::CrossState).await;

        for n in 0..20 {
            d.publish_ordered("c1", ObjectType::CrossState, json!({"crossId": "c1", "n": n}));
            d.publish_ordered("c2", ObjectType::CrossState, json!({"crossId": "c2", "n": n}));
        }
        wait_until(|| sink.sent().len() == 40).await;

        for cross in ["c1", "c2"] {
            let seen: Vec<i64> = sink
                .sent()
                .iter()
                .map(|(_, m)| &m.objects()[0].data)
                .filter(|data| data["crossId"] == cross)
                .map(|data| data["n"].as_i64().unwrap())
                .collect();
            assert_eq!(seen, (0..20).collect::<Vec<_>>());
        }
        assert_eq!(d.lane_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_recipient_times_out() {
        let sink = Arc::new(RecordingSink::stalling_for(&["slow"]));
        let (d, reg) = dispatcher(Arc::clone(&sink));
        subscribe(&reg, "slow", ObjectType::CrossState).await;
        subscribe(&reg, "fast", ObjectType::CrossState).await;

        let report = d
            .publish(ObjectType::CrossState, json!({"crossId": "c1"}))
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed[0].id, "slow");
    }
}
