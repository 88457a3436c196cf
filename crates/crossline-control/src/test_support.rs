//! In-memory collaborators for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossline_core::errors::AUTH_REJECTED;
use crossline_core::{CrossId, CrosslineError, Message, ObjectType, Result, SubscriberId};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Semaphore;

use crate::collaborators::{
    AuthValidator, InterventionType, Plan, PlanLookup, SignalController, TrafficDataSource,
};
use crate::control_mode::ControlModeManager;
use crate::flow_lock::FlowLockController;
use crate::plane::{Collaborators, ControlPlane, ControlPlaneConfig};
use crate::push::PushSink;
use crate::retrans::RetransmissionOrchestrator;

/// Poll `cond` until it holds, yielding to other tasks in between.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

pub struct StaticAuth {
    tokens: HashSet<String>,
}

impl StaticAuth {
    pub fn accepting(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| (*t).to_owned()).collect(),
        }
    }
}

#[async_trait]
impl AuthValidator for StaticAuth {
    async fn validate(&self, token: &str) -> Result<SubscriberId> {
        if self.tokens.contains(token) {
            Ok(SubscriberId::from(format!("id-{token}")))
        } else {
            Err(CrosslineError::business(AUTH_REJECTED, "token rejected"))
        }
    }
}

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(SubscriberId, Message)>>,
    failing: HashSet<String>,
    stalling: HashSet<String>,
}

impl RecordingSink {
    pub fn failing_for(ids: &[&str]) -> Self {
        Self {
            failing: ids.iter().map(|s| (*s).to_owned()).collect(),
            ..Self::default()
        }
    }

    pub fn stalling_for(ids: &[&str]) -> Self {
        Self {
            stalling: ids.iter().map(|s| (*s).to_owned()).collect(),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<(SubscriberId, Message)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl PushSink for RecordingSink {
    async fn deliver(&self, subscriber: &SubscriberId, message: Message) -> Result<()> {
        if self.stalling.contains(subscriber.as_str()) {
            std::future::pending::<()>().await;
        }
        if self.failing.contains(subscriber.as_str()) {
            return Err(CrosslineError::connection_closed("subscriber offline"));
        }
        self.sent.lock().push((subscriber.clone(), message));
        Ok(())
    }
}

/// Plans 1 to 16 exist on every cross.
pub struct FakePlans;

#[async_trait]
impl PlanLookup for FakePlans {
    async fn find_plan(&self, cross_id: &CrossId, plan_no: i32) -> Result<Plan> {
        if (1..=16).contains(&plan_no) {
            Ok(Plan {
                cross_id: cross_id.clone(),
                plan_no,
                name: format!("plan {plan_no}"),
                cycle_secs: 120,
            })
        } else {
            Err(CrosslineError::not_found("Plan", plan_no.to_string()))
        }
    }
}

#[derive(Clone)]
pub struct Gate {
    waiting: Arc<AtomicBool>,
    permits: Arc<Semaphore>,
}

impl Gate {
    fn new() -> Self {
        Self {
            waiting: Arc::new(AtomicBool::new(false)),
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        self.permits.add_permits(1);
    }

    async fn pass(&self) {
        self.waiting.store(true, Ordering::SeqCst);
        let _ = self.permits.acquire().await.map(|p| p.forget());
    }
}

#[derive(Default)]
pub struct FakeTrafficData {
    failing: Mutex<HashSet<CrossId>>,
    panicking: Mutex<HashSet<CrossId>>,
    records: Mutex<HashMap<CrossId, usize>>,
    gates: Mutex<HashMap<CrossId, Gate>>,
    fetched: Mutex<Vec<CrossId>>,
}

impl FakeTrafficData {
    pub fn fail_for(&self, cross: &str) {
        let _ = self.failing.lock().insert(CrossId::from(cross));
    }

    pub fn panic_for(&self, cross: &str) {
        let _ = self.panicking.lock().insert(CrossId::from(cross));
    }

    pub fn set_records(&self, cross: &str, count: usize) {
        let _ = self.records.lock().insert(CrossId::from(cross), count);
    }

    pub fn gate_for(&self, cross: &str) -> Gate {
        let gate = Gate::new();
        let _ = self.gates.lock().insert(CrossId::from(cross), gate.clone());
        gate
    }

    pub fn fetched(&self) -> Vec<CrossId> {
        self.fetched.lock().clone()
    }
}

#[async_trait]
impl TrafficDataSource for FakeTrafficData {
    async fn fetch_historical(
        &self,
        object_type: ObjectType,
        cross_id: &CrossId,
        start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<Value>> {
        self.fetched.lock().push(cross_id.clone());
        let gate = self.gates.lock().get(cross_id).cloned();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if self.panicking.lock().contains(cross_id) {
            panic!("fetch exploded for {cross_id}");
        }
        if self.failing.lock().contains(cross_id) {
            return Err(CrosslineError::internal(format!("store unavailable for {cross_id}")));
        }
        let count = self.records.lock().get(cross_id).copied().unwrap_or(0);
        Ok((0..count)
            .map(|i| json!({"crossId": cross_id, "type": object_type.as_str(), "seq": i, "at": start}))
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingSignals {
    calls: Mutex<Vec<(CrossId, u32, InterventionType, u32)>>,
}

impl RecordingSignals {
    pub fn calls(&self) -> Vec<(CrossId, u32, InterventionType, u32)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SignalController for RecordingSignals {
    async fn adjust_stage(
        &self,
        cross_id: &CrossId,
        stage_no: u32,
        intervention: InterventionType,
        length_secs: u32,
    ) -> Result<()> {
        self.calls
            .lock()
            .push((cross_id.clone(), stage_no, intervention, length_secs));
        Ok(())
    }
}

/// A fully wired control plane over the fakes above.
pub struct Harness {
    pub plane: ControlPlane,
    pub modes: Arc<ControlModeManager>,
    pub flow: Arc<FlowLockController>,
    pub retrans: Arc<RetransmissionOrchestrator>,
    pub sink: Arc<RecordingSink>,
    pub data: Arc<FakeTrafficData>,
    pub signals: Arc<RecordingSignals>,
}

impl Harness {
    pub fn new() -> Self {
        let sink = Arc::new(RecordingSink::default());
        let data = Arc::new(FakeTrafficData::default());
        let signals = Arc::new(RecordingSignals::default());
        let config = ControlPlaneConfig {
            peer: "platform".into(),
            delivery_timeout: Duration::from_secs(1),
            ..ControlPlaneConfig::default()
        };
        let plane = ControlPlane::new(
            &config,
            Collaborators {
                plans: Arc::new(FakePlans),
                data: Arc::clone(&data) as Arc<dyn TrafficDataSource>,
                auth: Arc::new(StaticAuth::accepting(&["t"])),
                signals: Arc::clone(&signals) as Arc<dyn SignalController>,
                sink: Arc::clone(&sink) as Arc<dyn PushSink>,
            },
        );
        Self {
            modes: Arc::clone(&plane.modes),
            flow: Arc::clone(&plane.flow),
            retrans: Arc::clone(&plane.retrans),
            plane,
            sink,
            data,
            signals,
        }
    }

    pub async fn subscribe(&self, who: &str, object_type: ObjectType) {
        let _ = self
            .plane
            .subscriptions
            .add_subscription(&SubscriberId::from(who), object_type, "t")
            .await
            .unwrap();
    }
}
