//! Subscription registry.
//!
//! Tracks which subscribers want pushes of which object types. Entries are
//! sharded by object type so subscribing to one type never contends with
//! fan-out lookups of another.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossline_core::logging::{MarkerOutcome, marker};
use crossline_core::{CrosslineError, ObjectType, Result, SubscriberId};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::collaborators::AuthValidator;

/// One active subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Who receives the pushes.
    pub subscriber_id: SubscriberId,
    /// Pushed object type.
    pub object_type: ObjectType,
    /// Token presented when subscribing.
    #[serde(skip)]
    pub token: String,
    /// Whether pushes are currently delivered.
    pub active: bool,
    /// When the subscription was (re)created.
    pub created_at: DateTime<Utc>,
}

/// Registry of subscriptions keyed by object type.
pub struct SubscriptionRegistry {
    auth: Arc<dyn AuthValidator>,
    by_type: DashMap<ObjectType, HashMap<SubscriberId, Subscription>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry validating tokens with `auth`.
    pub fn new(auth: Arc<dyn AuthValidator>) -> Self {
        Self {
            auth,
            by_type: DashMap::new(),
        }
    }

    /// Validate `token` and register the subscription.
    ///
    /// Re-subscribing replaces the previous entry.
    #[instrument(skip(self, token), fields(subscriber = %subscriber, object_type = %object_type))]
    pub async fn add_subscription(
        &self,
        subscriber: &SubscriberId,
        object_type: ObjectType,
        token: &str,
    ) -> Result<Subscription> {
        if subscriber.is_blank() {
            return Err(CrosslineError::validation("subscriber id is required"));
        }
        if !object_type.is_pushable() {
            return Err(CrosslineError::validation(format!(
                "object type '{object_type}' cannot be subscribed to"
            )));
        }
        if token.trim().is_empty() {
            return Err(CrosslineError::validation("subscription token is required"));
        }
        if let Err(e) = self.auth.validate(token).await {
            marker("addSubscription", subscriber, MarkerOutcome::Failed);
            return Err(e);
        }

        let subscription = Subscription {
            subscriber_id: subscriber.clone(),
            object_type,
            token: token.to_owned(),
            active: true,
            created_at: Utc::now(),
        };
        let _ = self
            .by_type
            .entry(object_type)
            .or_default()
            .insert(subscriber.clone(), subscription.clone());
        marker("addSubscription", subscriber, MarkerOutcome::Succeeded);
        Ok(subscription)
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn remove_subscription(&self, subscriber: &SubscriberId, object_type: ObjectType) -> bool {
        let removed = self
            .by_type
            .get_mut(&object_type)
            .is_some_and(|mut subs| subs.remove(subscriber).is_some());
        if removed {
            marker("removeSubscription", subscriber, MarkerOutcome::Succeeded);
        } else {
            debug!(%subscriber, %object_type, "no subscription to remove");
        }
        removed
    }

    /// Remove every subscription held by `subscriber` (on disconnect or
    /// logout). Returns how many were removed.
    pub fn remove_all_for_subscriber(&self, subscriber: &SubscriberId) -> usize {
        let mut removed = 0;
        for mut entry in self.by_type.iter_mut() {
            if entry.value_mut().remove(subscriber).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            marker("removeAllForSubscriber", subscriber, MarkerOutcome::Succeeded);
        }
        removed
    }

    /// Pause or resume delivery without dropping the subscription.
    pub fn set_active(&self, subscriber: &SubscriberId, object_type: ObjectType, active: bool) -> bool {
        self.by_type
            .get_mut(&object_type)
            .and_then(|mut subs| subs.get_mut(subscriber).map(|s| s.active = active))
            .is_some()
    }

    /// Active recipients for `object_type`, sorted.
    pub fn subscribers_for(&self, object_type: ObjectType) -> Vec<SubscriberId> {
        let mut ids: Vec<SubscriberId> = self
            .by_type
            .get(&object_type)
            .map(|subs| {
                subs.values()
                    .filter(|s| s.active)
                    .map(|s| s.subscriber_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Object types `subscriber` is subscribed to, sorted.
    pub fn subscriptions_of(&self, subscriber: &SubscriberId) -> Vec<ObjectType> {
        let mut types: Vec<ObjectType> = self
            .by_type
            .iter()
            .filter(|entry| entry.value().contains_key(subscriber))
            .map(|entry| *entry.key())
            .collect();
        types.sort();
        types
    }

    /// Total number of subscriptions.
    pub fn len(&self) -> usize {
        self.by_type.iter().map(|entry| entry.value().len()).sum()
    }

    /// Whether there are no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StaticAuth;
    use crossline_core::errors::AUTH_REJECTED;
    use crossline_core::logging::capture_logs;

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(Arc::new(StaticAuth::accepting(&["t1"])))
    }

    fn sub(id: &str) -> SubscriberId {
        SubscriberId::from(id)
    }

    #[tokio::test]
    async fn add_then_lookup() {
        let reg = registry();
        let s = reg
            .add_subscription(&sub("platform"), ObjectType::CrossTrafficData, "t1")
            .await
            .unwrap();
        assert!(s.active);
        assert_eq!(
            reg.subscribers_for(ObjectType::CrossTrafficData),
            vec![sub("platform")]
        );
        assert!(reg.subscribers_for(ObjectType::CrossStage).is_empty());
    }

    #[tokio::test]
    async fn invalid_token_rejected_without_registering() {
        let reg = registry();
        let err = reg
            .add_subscription(&sub("platform"), ObjectType::CrossStage, "bad")
            .await
            .unwrap_err();
        assert_eq!(err.code(), AUTH_REJECTED);
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn non_pushable_type_is_validation_error() {
        let reg = registry();
        let err = reg
            .add_subscription(&sub("platform"), ObjectType::AdjustStage, "t1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crossline_core::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn resubscribe_replaces_entry() {
        let reg = registry();
        for _ in 0..3 {
            let _ = reg
                .add_subscription(&sub("platform"), ObjectType::CrossStage, "t1")
                .await
                .unwrap();
        }
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn remove_all_for_subscriber_leaves_others() {
        let reg = registry();
        for ty in [ObjectType::CrossStage, ObjectType::CrossCycle] {
            let _ = reg.add_subscription(&sub("a"), ty, "t1").await.unwrap();
        }
        let _ = reg
            .add_subscription(&sub("b"), ObjectType::CrossStage, "t1")
            .await
            .unwrap();

        assert_eq!(reg.remove_all_for_subscriber(&sub("a")), 2);
        assert_eq!(reg.subscribers_for(ObjectType::CrossStage), vec![sub("b")]);
        assert!(reg.subscriptions_of(&sub("a")).is_empty());
    }

    #[tokio::test]
    async fn remove_single_and_missing() {
        let reg = registry();
        let _ = reg
            .add_subscription(&sub("a"), ObjectType::CrossStage, "t1")
            .await
            .unwrap();
        assert!(reg.remove_subscription(&sub("a"), ObjectType::CrossStage));
        assert!(!reg.remove_subscription(&sub("a"), ObjectType::CrossStage));
    }

    #[tokio::test]
    async fn inactive_subscription_not_a_recipient() {
        let reg = registry();
        let _ = reg
            .add_subscription(&sub("a"), ObjectType::CrossStage, "t1")
            .await
            .unwrap();
        assert!(reg.set_active(&sub("a"), ObjectType::CrossStage, false));
        assert!(reg.subscribers_for(ObjectType::CrossStage).is_empty());
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn subscription_emits_marker() {
        let (logs, _guard) = capture_logs();
        let reg = registry();
        let _ = reg
            .add_subscription(&sub("a"), ObjectType::CrossStage, "t1")
            .await
            .unwrap();
        let markers = logs.markers("addSubscription");
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].field("outcome"), Some("succeeded"));
    }
}
