//! Flow direction locks and stage interventions.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossline_core::errors::{LOCK_MODE_CONFLICT, LOCK_STAGE_MISMATCH};
use crossline_core::logging::{MarkerOutcome, marker};
use crossline_core::{CrossId, CrosslineError, ObjectType, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::collaborators::{InterventionType, SignalController};
use crate::control_mode::{ControlMode, ControlModeManager, CrossControlMode};
use crate::push::PushDispatcher;

/// Class of traffic a lock applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowType {
    /// Motor vehicles.
    Motor,
    /// Bicycles and other non-motor vehicles.
    NonMotor,
    /// Pedestrians.
    Pedestrian,
}

/// Approach or exit direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum Direction {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
}

/// How the locked flow is served.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockType {
    /// Hold the given stage, which must be the one currently running.
    CurrentStage,
    /// Jump to and hold the given stage.
    SpecifiedStage,
    /// Release only the entrance, stage chosen by the controller.
    SingleEntrance,
    /// Release the entrance/exit pair, stage chosen by the controller.
    DirectionRelease,
}

impl LockType {
    /// Whether the lock names its stage explicitly (`lockStageNo > 0`)
    /// rather than leaving it to the controller (`lockStageNo == 0`).
    pub fn requires_explicit_stage(self) -> bool {
        matches!(self, Self::CurrentStage | Self::SpecifiedStage)
    }
}

/// Identity of a lock: one per cross, flow type and direction pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowLockKey {
    /// Cross.
    pub cross_id: CrossId,
    /// Flow type.
    pub flow_type: FlowType,
    /// Entrance direction.
    pub entrance: Direction,
    /// Exit direction.
    pub exit: Direction,
}

impl fmt::Display for FlowLockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{:?}/{:?}->{:?}",
            self.cross_id, self.flow_type, self.entrance, self.exit
        )
    }
}

/// A lock request as received from the peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowLockRequest {
    /// Which flow to lock.
    #[serde(flatten)]
    pub key: FlowLockKey,
    /// How the flow is served.
    pub lock_type: LockType,
    /// Stage to hold; 0 when the lock type leaves it to the controller.
    pub lock_stage_no: i32,
    /// Lock duration; 0 holds until unlocked.
    #[serde(rename = "duration")]
    pub duration_secs: i64,
}

/// An active lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowLock {
    /// Which flow is locked.
    #[serde(flatten)]
    pub key: FlowLockKey,
    /// How the flow is served.
    pub lock_type: LockType,
    /// Held stage, 0 if chosen by the controller.
    pub lock_stage_no: u32,
    /// Lock duration in seconds.
    #[serde(rename = "duration")]
    pub duration_secs: u32,
    /// When the lock was (re)applied.
    pub lock_time: DateTime<Utc>,
}

/// Active locks of one cross.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    /// Cross.
    pub cross_id: CrossId,
    /// Locks ordered by key.
    pub locks: Vec<FlowLock>,
}

/// Shared lock storage. The control mode manager clears a cross's locks
/// when it enters a special mode.
#[derive(Debug, Default)]
pub struct FlowLockTable {
    locks: DashMap<FlowLockKey, FlowLock>,
}

impl FlowLockTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite; returns the replaced lock.
    pub fn insert(&self, lock: FlowLock) -> Option<FlowLock> {
        self.locks.insert(lock.key.clone(), lock)
    }

    /// Remove one lock.
    pub fn remove(&self, key: &FlowLockKey) -> Option<FlowLock> {
        self.locks.remove(key).map(|(_, lock)| lock)
    }

    /// Active lock at `key`.
    pub fn get(&self, key: &FlowLockKey) -> Option<FlowLock> {
        self.locks.get(key).map(|l| l.value().clone())
    }

    /// Locks on `cross_id`, ordered by key.
    pub fn for_cross(&self, cross_id: &CrossId) -> Vec<FlowLock> {
        let mut locks: Vec<FlowLock> = self
            .locks
            .iter()
            .filter(|e| &e.key().cross_id == cross_id)
            .map(|e| e.value().clone())
            .collect();
        locks.sort_by(|a, b| a.key.cmp(&b.key));
        locks
    }

    /// Drop every lock on `cross_id`; returns how many were removed.
    pub fn release_cross(&self, cross_id: &CrossId) -> usize {
        let before = self.locks.len();
        self.locks.retain(|key, _| &key.cross_id != cross_id);
        before.saturating_sub(self.locks.len())
    }

    /// Total active locks.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no lock is active.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Validated lock, unlock and stage override commands.
pub struct FlowLockController {
    locks: Arc<FlowLockTable>,
    modes: Arc<ControlModeManager>,
    signals: Arc<dyn SignalController>,
    dispatcher: Arc<PushDispatcher>,
    max_duration_secs: u32,
}

impl FlowLockController {
    /// Create a controller sharing `locks` with the mode manager.
    pub fn new(
        locks: Arc<FlowLockTable>,
        modes: Arc<ControlModeManager>,
        signals: Arc<dyn SignalController>,
        dispatcher: Arc<PushDispatcher>,
        max_duration_secs: u32,
    ) -> Self {
        Self {
            locks,
            modes,
            signals,
            dispatcher,
            max_duration_secs,
        }
    }

    /// Lock table shared with the mode manager.
    pub fn table(&self) -> &Arc<FlowLockTable> {
        &self.locks
    }

    /// Validate and store a lock, replacing any lock on the same key.
    ///
    /// A cross in a special mode holds no locks, so the request is refused
    /// with `LOCK_MODE_CONFLICT` until it returns to a normal mode.
    #[instrument(skip(self, request), fields(key = %request.key))]
    pub fn lock_flow_direction(&self, request: &FlowLockRequest) -> Result<FlowLock> {
        let cross_id = &request.key.cross_id;
        let result = self.validate(request).and_then(|(stage, duration)| {
            self.modes.with_cross(cross_id, |current| {
                if let Some(mode) = current.map(|m| m.mode).filter(|m| m.is_special()) {
                    return Err(CrosslineError::business(
                        LOCK_MODE_CONFLICT,
                        format!("cross {cross_id} is in {mode} and cannot hold a flow lock"),
                    ));
                }
                let lock = FlowLock {
                    key: request.key.clone(),
                    lock_type: request.lock_type,
                    lock_stage_no: stage,
                    duration_secs: duration,
                    lock_time: Utc::now(),
                };
                if self.locks.insert(lock.clone()).is_some() {
                    debug!("replaced existing lock");
                }
                self.publish_event(cross_id, serde_json::to_value(&lock), true);
                Ok(lock)
            })
        });
        let outcome = if result.is_ok() {
            MarkerOutcome::Succeeded
        } else {
            MarkerOutcome::Failed
        };
        marker("lockFlowDirection", cross_id, outcome);
        result
    }

    fn validate(&self, request: &FlowLockRequest) -> Result<(u32, u32)> {
        if request.key.cross_id.is_blank() {
            return Err(CrosslineError::validation("cross id is required"));
        }
        let max = i64::from(self.max_duration_secs);
        let duration = u32::try_from(request.duration_secs)
            .ok()
            .filter(|d| i64::from(*d) <= max)
            .ok_or_else(|| {
                CrosslineError::validation(format!(
                    "lock duration {} is outside [0, {max}] seconds",
                    request.duration_secs
                ))
            })?;
        let stage = u32::try_from(request.lock_stage_no).map_err(|_| {
            CrosslineError::validation(format!(
                "lock stage number {} is negative",
                request.lock_stage_no
            ))
        })?;
        // A stage number that contradicts the lock type breaks a protocol
        // rule rather than a field format, hence Business, not Validation.
        let explicit = request.lock_type.requires_explicit_stage();
        if explicit && stage == 0 {
            return Err(CrosslineError::business(
                LOCK_STAGE_MISMATCH,
                format!("{:?} lock requires a stage number", request.lock_type),
            ));
        }
        if !explicit && stage != 0 {
            return Err(CrosslineError::business(
                LOCK_STAGE_MISMATCH,
                format!(
                    "{:?} lock must not name a stage (got {stage})",
                    request.lock_type
                ),
            ));
        }
        Ok((stage, duration))
    }

    /// Remove the lock at `key`. A missing lock is not an error.
    #[instrument(skip(self), fields(key = %key))]
    pub fn unlock_flow_direction(&self, key: &FlowLockKey) -> Result<Option<FlowLock>> {
        if key.cross_id.is_blank() {
            return Err(CrosslineError::validation("cross id is required"));
        }
        let removed = self.modes.with_cross(&key.cross_id, |_| {
            let removed = self.locks.remove(key);
            if removed.is_some() {
                self.publish_event(&key.cross_id, serde_json::to_value(key), false);
            }
            removed
        });
        if removed.is_none() {
            info!("no active lock to release");
        }
        marker("unlockFlowDirection", &key.cross_id, MarkerOutcome::Succeeded);
        Ok(removed)
    }

    /// Snapshot of the active locks on `cross_id`.
    pub fn get_lock_status(&self, cross_id: &CrossId) -> LockStatus {
        LockStatus {
            cross_id: cross_id.clone(),
            locks: self.locks.for_cross(cross_id),
        }
    }

    /// Ask the signal controller to extend, shorten or skip a stage.
    #[instrument(skip(self), fields(cross_id = %cross_id, intervention = intervention.as_str()))]
    pub async fn stage_intervention(
        &self,
        cross_id: &CrossId,
        stage_no: u32,
        intervention: InterventionType,
        length_secs: i64,
    ) -> Result<()> {
        let result = async {
            if cross_id.is_blank() {
                return Err(CrosslineError::validation("cross id is required"));
            }
            let length = u32::try_from(length_secs)
                .ok()
                .filter(|l| *l > 0)
                .ok_or_else(|| {
                    CrosslineError::validation(format!(
                        "intervention length must be positive (got {length_secs})"
                    ))
                })?;
            self.signals
                .adjust_stage(cross_id, stage_no, intervention, length)
                .await
        }
        .await;
        let outcome = if result.is_ok() {
            MarkerOutcome::Succeeded
        } else {
            MarkerOutcome::Failed
        };
        marker("stageIntervention", cross_id, outcome);
        result
    }

    /// Immediate mode override, bypassing the transition rules.
    pub async fn emergency_control(
        &self,
        cross_id: &CrossId,
        mode: ControlMode,
        plan_no: Option<i32>,
    ) -> Result<CrossControlMode> {
        self.modes.emergency_control(cross_id, mode, plan_no).await
    }

    // Shares the cross's lane with mode events.
    fn publish_event(&self, cross_id: &CrossId, encoded: serde_json::Result<Value>, locked: bool) {
        match encoded {
            Ok(Value::Object(mut data)) => {
                let _ = data.insert("locked".to_owned(), Value::Bool(locked));
                self.dispatcher.publish_ordered(
                    cross_id,
                    ObjectType::LockFlowDirection,
                    Value::Object(data),
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to encode lock event"),
        }
    }
}
