//! In-process implementations of the control-plane collaborators.
//!
//! The binary runs against these when no external plan store, data store or
//! signal gateway is wired in. They are also what the integration tests use.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossline_control::{
    AuthValidator, InterventionType, Plan, PlanLookup, PushSink, SignalController,
    SubscriptionRegistry, TrafficDataSource,
};
use crossline_core::errors::AUTH_REJECTED;
use crossline_core::{CrossId, CrosslineError, Message, ObjectType, Result, SubscriberId};
use crossline_settings::TokenEntry;
use crossline_transport::{ConnectionTable, Session, SessionObserver};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

/// Accepts the tokens listed in the `auth` settings section.
pub struct TokenAuth {
    tokens: HashMap<String, SubscriberId>,
}

impl TokenAuth {
    /// Build from configured `{token, identity}` pairs.
    pub fn new(entries: &[TokenEntry]) -> Self {
        Self {
            tokens: entries
                .iter()
                .map(|e| (e.token.clone(), SubscriberId::from(e.identity.as_str())))
                .collect(),
        }
    }
}

#[async_trait]
impl AuthValidator for TokenAuth {
    async fn validate(&self, token: &str) -> Result<SubscriberId> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| CrosslineError::business(AUTH_REJECTED, "unknown or expired token"))
    }
}

/// Plan table held in memory.
///
/// Crosses without registered plans fall back to `default_plans`
/// (plans `1..=default_plans`), so a fresh server accepts the usual plan
/// numbers.
pub struct InMemoryPlans {
    plans: RwLock<HashMap<(CrossId, i32), Plan>>,
    default_plans: i32,
}

impl InMemoryPlans {
    /// Table where every cross has plans `1..=default_plans`.
    pub fn new(default_plans: i32) -> Self {
        Self {
            plans: RwLock::new(HashMap::new()),
            default_plans,
        }
    }

    /// Register or replace a plan.
    pub fn insert(&self, plan: Plan) {
        let _ = self
            .plans
            .write()
            .insert((plan.cross_id.clone(), plan.plan_no), plan);
    }
}

#[async_trait]
impl PlanLookup for InMemoryPlans {
    async fn find_plan(&self, cross_id: &CrossId, plan_no: i32) -> Result<Plan> {
        if let Some(plan) = self.plans.read().get(&(cross_id.clone(), plan_no)) {
            return Ok(plan.clone());
        }
        if (1..=self.default_plans).contains(&plan_no) {
            return Ok(Plan {
                cross_id: cross_id.clone(),
                plan_no,
                name: format!("default plan {plan_no}"),
                cycle_secs: 0,
            });
        }
        Err(CrosslineError::not_found(
            "Plan",
            format!("{cross_id}/{plan_no}"),
        ))
    }
}

type SeriesKey = (ObjectType, CrossId);

/// Historical records kept in memory, ordered by time per object type and
/// cross.
#[derive(Default)]
pub struct InMemoryTrafficStore {
    series: RwLock<HashMap<SeriesKey, BTreeMap<DateTime<Utc>, Vec<Value>>>>,
}

impl InMemoryTrafficStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one object observed at `at`.
    pub fn record(&self, object_type: ObjectType, cross_id: &CrossId, at: DateTime<Utc>, data: Value) {
        self.series
            .write()
            .entry((object_type, cross_id.clone()))
            .or_default()
            .entry(at)
            .or_default()
            .push(data);
    }
}

#[async_trait]
impl TrafficDataSource for InMemoryTrafficStore {
    async fn fetch_historical(
        &self,
        object_type: ObjectType,
        cross_id: &CrossId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Value>> {
        let series = self.series.read();
        let Some(points) = series.get(&(object_type, cross_id.clone())) else {
            return Ok(Vec::new());
        };
        Ok(points
            .range(start..=end)
            .flat_map(|(_, values)| values.iter().cloned())
            .collect())
    }
}

/// Signal gateway stand-in that only logs the requested adjustment.
#[derive(Default)]
pub struct LoggingSignalController {
    adjustments: RwLock<Vec<(CrossId, u32, InterventionType, u32)>>,
}

impl LoggingSignalController {
    /// Adjustments received so far.
    pub fn adjustments(&self) -> Vec<(CrossId, u32, InterventionType, u32)> {
        self.adjustments.read().clone()
    }
}

#[async_trait]
impl SignalController for LoggingSignalController {
    async fn adjust_stage(
        &self,
        cross_id: &CrossId,
        stage_no: u32,
        intervention: InterventionType,
        length_secs: u32,
    ) -> Result<()> {
        info!(
            %cross_id,
            stage_no,
            intervention = intervention.as_str(),
            length_secs,
            "stage adjustment requested"
        );
        self.adjustments
            .write()
            .push((cross_id.clone(), stage_no, intervention, length_secs));
        Ok(())
    }
}

/// Delivers pushes over whichever session the subscriber is logged in on.
pub struct SessionPushSink(pub Arc<ConnectionTable>);

#[async_trait]
impl PushSink for SessionPushSink {
    async fn deliver(&self, subscriber: &SubscriberId, message: Message) -> Result<()> {
        self.0.send_to_peer(subscriber, message).await
    }
}

/// Drops a peer's subscriptions when its session closes.
pub struct SubscriptionCleanup {
    subscriptions: Arc<SubscriptionRegistry>,
    connections: Arc<ConnectionTable>,
}

impl SubscriptionCleanup {
    /// Observer over `subscriptions`, consulting `connections` so a peer
    /// still logged in on another session keeps its subscriptions.
    pub fn new(subscriptions: Arc<SubscriptionRegistry>, connections: Arc<ConnectionTable>) -> Self {
        Self {
            subscriptions,
            connections,
        }
    }
}

impl SessionObserver for SubscriptionCleanup {
    fn on_close(&self, session: &Arc<Session>) {
        let Some(peer) = session.peer() else {
            return;
        };
        if !self.connections.find_by_peer(&peer).is_empty() {
            debug!(%peer, "peer still connected elsewhere, keeping subscriptions");
            return;
        }
        let removed = self.subscriptions.remove_all_for_subscriber(&peer);
        info!(%peer, removed, session_id = session.id(), "peer disconnected");
    }
}
