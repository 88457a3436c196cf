//! Per-cross control mode state machine.
//!
//! A cross has no mode until the first successful switch. Each switch:
//!
//! 1. validates the cross id
//! 2. normalizes the plan: special modes drop it, normal modes require one
//!    that is either a sentinel (at or below the configured ceiling) or
//!    resolvable through the [`PlanLookup`]
//! 3. checks [`TransitionRules`] (a same-mode refresh is always allowed)
//! 4. pushes the previous mode onto the bounded, most-recent-first history,
//!    installs the new mode, runs side effects and publishes `CrossCtrlInfo`
//!
//! Steps 1–3 never mutate anything. Each cross has its own lock, so
//! unrelated crosses never contend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossline_core::errors::SWITCH_FORBIDDEN;
use crossline_core::logging::{MarkerOutcome, marker};
use crossline_core::{CrossId, CrosslineError, ErrorKind, FailedItem, ObjectType, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::collaborators::PlanLookup;
use crate::flow_lock::FlowLockTable;
use crate::push::PushDispatcher;

/// Plan run when a normal mode is forced without one and the cross never
/// ran a plan.
pub const DEFAULT_PLAN_NO: i32 = 1;

/// Operating mode of a cross.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMode {
    /// Signals dark.
    LightOff,
    /// All approaches red.
    AllRed,
    /// All approaches flashing yellow.
    AllYellowFlash,
    /// Cancel the current override.
    Cancel,
    /// Fixed-time plan.
    SingleTiming,
    /// Vehicle-actuated plan.
    SingleActuated,
    /// Single-cross adaptive.
    SingleAdaptive,
    /// Manual operation from the cabinet.
    Manual,
    /// Fixed-time coordination.
    FixCoordinated,
    /// Adaptive coordination.
    AdaptiveCoordinated,
}

impl ControlMode {
    /// Every mode.
    pub const ALL: [Self; 10] = [
        Self::LightOff,
        Self::AllRed,
        Self::AllYellowFlash,
        Self::Cancel,
        Self::SingleTiming,
        Self::SingleActuated,
        Self::SingleAdaptive,
        Self::Manual,
        Self::FixCoordinated,
        Self::AdaptiveCoordinated,
    ];

    /// Special modes run without a plan.
    pub fn is_special(self) -> bool {
        matches!(
            self,
            Self::LightOff | Self::AllRed | Self::AllYellowFlash | Self::Cancel
        )
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LightOff => "LIGHT_OFF",
            Self::AllRed => "ALL_RED",
            Self::AllYellowFlash => "ALL_YELLOW_FLASH",
            Self::Cancel => "CANCEL",
            Self::SingleTiming => "SINGLE_TIMING",
            Self::SingleActuated => "SINGLE_ACTUATED",
            Self::SingleAdaptive => "SINGLE_ADAPTIVE",
            Self::Manual => "MANUAL",
            Self::FixCoordinated => "FIX_COORDINATED",
            Self::AdaptiveCoordinated => "ADAPTIVE_COORDINATED",
        }
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlMode {
    type Err = CrosslineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| CrosslineError::validation(format!("unknown control mode '{s}'")))
    }
}

/// The mode in effect on a cross.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossControlMode {
    /// Cross id.
    pub cross_id: CrossId,
    /// Mode.
    pub mode: ControlMode,
    /// Plan number; always `None` for special modes.
    pub plan_no: Option<i32>,
    /// When the mode took effect.
    pub effective_time: DateTime<Utc>,
}

/// Forbidden direct transitions.
///
/// Anything not listed is allowed. A transition to the current mode is always
/// allowed regardless of the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionRules {
    forbidden: HashMap<ControlMode, HashSet<ControlMode>>,
}

impl TransitionRules {
    /// A table with no restrictions.
    pub fn permissive() -> Self {
        Self {
            forbidden: HashMap::new(),
        }
    }

    /// Forbid `from → to`.
    #[must_use]
    pub fn forbid(mut self, from: ControlMode, to: ControlMode) -> Self {
        self.add(from, to);
        self
    }

    /// Forbid `from → to` in place.
    pub fn add(&mut self, from: ControlMode, to: ControlMode) {
        let _ = self.forbidden.entry(from).or_default().insert(to);
    }

    /// Whether `from → to` may be taken directly.
    pub fn permits(&self, from: ControlMode, to: ControlMode) -> bool {
        from == to
            || !self
                .forbidden
                .get(&from)
                .is_some_and(|targets| targets.contains(&to))
    }
}

impl Default for TransitionRules {
    /// A dark cross must pass through another mode before running a plan.
    fn default() -> Self {
        Self::permissive()
            .forbid(ControlMode::LightOff, ControlMode::SingleTiming)
            .forbid(ControlMode::LightOff, ControlMode::SingleActuated)
    }
}

/// Manager tunables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlModeConfig {
    /// History entries kept per cross.
    pub history_limit: usize,
    /// Plan numbers at or below this value skip the plan lookup.
    pub sentinel_plan_ceiling: i32,
}

impl Default for ControlModeConfig {
    fn default() -> Self {
        Self {
            history_limit: crossline_core::constants::DEFAULT_HISTORY_LIMIT,
            sentinel_plan_ceiling: -1,
        }
    }
}

#[derive(Debug, Default)]
struct CrossModeState {
    current: Option<CrossControlMode>,
    history: VecDeque<CrossControlMode>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SwitchPolicy {
    CheckRules,
    Override,
}

/// Per-cross control mode state.
pub struct ControlModeManager {
    config: ControlModeConfig,
    rules: RwLock<TransitionRules>,
    states: DashMap<CrossId, Arc<Mutex<CrossModeState>>>,
    plans: Arc<dyn PlanLookup>,
    locks: Arc<FlowLockTable>,
    dispatcher: Arc<PushDispatcher>,
}

impl ControlModeManager {
    /// Create a manager with the default transition rules.
    pub fn new(
        config: ControlModeConfig,
        plans: Arc<dyn PlanLookup>,
        locks: Arc<FlowLockTable>,
        dispatcher: Arc<PushDispatcher>,
    ) -> Self {
        Self {
            config,
            rules: RwLock::new(TransitionRules::default()),
            states: DashMap::new(),
            plans,
            locks,
            dispatcher,
        }
    }

    /// Replace the transition rule table.
    #[must_use]
    pub fn with_rules(self, rules: TransitionRules) -> Self {
        *self.rules.write() = rules;
        self
    }

    /// Forbid an additional transition at runtime.
    pub fn forbid_transition(&self, from: ControlMode, to: ControlMode) {
        self.rules.write().add(from, to);
    }

    fn state(&self, cross_id: &CrossId) -> Arc<Mutex<CrossModeState>> {
        Arc::clone(self.states.entry(cross_id.clone()).or_default().value())
    }

    /// Switch a cross to `mode`.
    #[instrument(skip(self), fields(cross_id = %cross_id, mode = %mode))]
    pub async fn set_control_mode(
        &self,
        cross_id: &CrossId,
        mode: ControlMode,
        plan_no: Option<i32>,
    ) -> Result<CrossControlMode> {
        let result = async {
            let plan_no = self.normalize_plan(cross_id, mode, plan_no).await?;
            self.apply(cross_id, mode, plan_no, SwitchPolicy::CheckRules)
        }
        .await;
        self.finish("setControlMode", cross_id, result)
    }

    /// Switch several crosses, attempting every one.
    ///
    /// Fails with `PartialFailure` listing the crosses that were rejected;
    /// the others keep their new mode.
    pub async fn batch_set_control_mode(
        &self,
        cross_ids: &[CrossId],
        mode: ControlMode,
        plan_no: Option<i32>,
    ) -> Result<Vec<CrossControlMode>> {
        if cross_ids.is_empty() {
            return Err(CrosslineError::validation("cross id list is empty"));
        }
        let mut applied = Vec::with_capacity(cross_ids.len());
        let mut failed = Vec::new();
        for cross_id in cross_ids {
            match self.set_control_mode(cross_id, mode, plan_no).await {
                Ok(state) => applied.push(state),
                Err(e) => failed.push(FailedItem {
                    id: cross_id.to_string(),
                    reason: e.to_string(),
                }),
            }
        }
        if failed.is_empty() {
            Ok(applied)
        } else {
            warn!(
                total = cross_ids.len(),
                failed = failed.len(),
                %mode,
                "batch control mode switch partially failed"
            );
            Err(CrosslineError::PartialFailure {
                operation: "batchSetControlMode".to_owned(),
                total: cross_ids.len(),
                failed,
            })
        }
    }

    /// Immediate override that skips the transition rules.
    ///
    /// An explicit `plan_no` is validated as in
    /// [`set_control_mode`](Self::set_control_mode). Without one, a normal
    /// mode runs the last plan the cross ran (current mode first, then
    /// history), or [`DEFAULT_PLAN_NO`] if it never ran one.
    #[instrument(skip(self), fields(cross_id = %cross_id, mode = %mode))]
    pub async fn emergency_control(
        &self,
        cross_id: &CrossId,
        mode: ControlMode,
        plan_no: Option<i32>,
    ) -> Result<CrossControlMode> {
        let result = async {
            let plan_no = match plan_no {
                None if !mode.is_special() && !cross_id.is_blank() => {
                    Some(self.last_plan(cross_id))
                }
                _ => self.normalize_plan(cross_id, mode, plan_no).await?,
            };
            self.apply(cross_id, mode, plan_no, SwitchPolicy::Override)
        }
        .await;
        self.finish("emergencyControl", cross_id, result)
    }

    fn last_plan(&self, cross_id: &CrossId) -> i32 {
        let Some(state) = self.states.get(cross_id).map(|s| Arc::clone(s.value())) else {
            return DEFAULT_PLAN_NO;
        };
        let guard = state.lock();
        guard
            .current
            .iter()
            .chain(guard.history.iter())
            .find_map(|m| m.plan_no)
            .unwrap_or(DEFAULT_PLAN_NO)
    }

    /// Administrative reset to SINGLE_TIMING / [`DEFAULT_PLAN_NO`], skipping
    /// the transition rules and plan lookup.
    pub fn reset_to_default_mode(&self, cross_id: &CrossId) -> Result<CrossControlMode> {
        let result = self.apply(
            cross_id,
            ControlMode::SingleTiming,
            Some(DEFAULT_PLAN_NO),
            SwitchPolicy::Override,
        );
        self.finish("resetToDefaultMode", cross_id, result)
    }

    /// Whether `cross_id` may switch directly to `mode` now.
    pub fn can_switch(&self, cross_id: &CrossId, mode: ControlMode) -> bool {
        match self.current_mode(cross_id) {
            None => true,
            Some(current) => self.rules.read().permits(current.mode, mode),
        }
    }

    /// Mode in effect, if any.
    pub fn current_mode(&self, cross_id: &CrossId) -> Option<CrossControlMode> {
        let state = self.states.get(cross_id).map(|s| Arc::clone(s.value()))?;
        let guard = state.lock();
        guard.current.clone()
    }

    /// Up to `limit` previous modes, most recent first.
    pub fn get_control_mode_history(&self, cross_id: &CrossId, limit: usize) -> Vec<CrossControlMode> {
        let Some(state) = self.states.get(cross_id).map(|s| Arc::clone(s.value())) else {
            return Vec::new();
        };
        let guard = state.lock();
        guard.history.iter().take(limit).cloned().collect()
    }

    /// Crosses that have a mode, sorted.
    pub fn crosses(&self) -> Vec<CrossId> {
        let mut ids: Vec<CrossId> = self
            .states
            .iter()
            .filter(|e| e.value().lock().current.is_some())
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Run `f` under the cross's mode lock with the mode in effect.
    ///
    /// Mode switches on the same cross wait for `f`, so lock changes made
    /// inside it cannot interleave with a switch's lock release or events.
    pub(crate) fn with_cross<R>(
        &self,
        cross_id: &CrossId,
        f: impl FnOnce(Option<&CrossControlMode>) -> R,
    ) -> R {
        let state = self.state(cross_id);
        let guard = state.lock();
        f(guard.current.as_ref())
    }

    async fn normalize_plan(
        &self,
        cross_id: &CrossId,
        mode: ControlMode,
        plan_no: Option<i32>,
    ) -> Result<Option<i32>> {
        if cross_id.is_blank() {
            return Err(CrosslineError::validation("cross id is required"));
        }
        if mode.is_special() {
            if let Some(plan) = plan_no.filter(|p| *p != 0) {
                warn!(%cross_id, %mode, plan, "ignoring plan number for special mode");
            }
            return Ok(None);
        }

        let Some(plan) = plan_no else {
            return Err(CrosslineError::validation(format!(
                "plan number is required for {mode}"
            )));
        };
        if plan <= self.config.sentinel_plan_ceiling {
            debug!(%cross_id, plan, "sentinel plan number accepted without lookup");
            return Ok(Some(plan));
        }
        if plan <= 0 {
            return Err(CrosslineError::validation("plan number must be positive"));
        }
        match self.plans.find_plan(cross_id, plan).await {
            Ok(_) => Ok(Some(plan)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(CrosslineError::validation(format!(
                "unknown plan {plan} for cross {cross_id}"
            ))),
            Err(e) => Err(e),
        }
    }

    fn apply(
        &self,
        cross_id: &CrossId,
        mode: ControlMode,
        plan_no: Option<i32>,
        policy: SwitchPolicy,
    ) -> Result<CrossControlMode> {
        if cross_id.is_blank() {
            return Err(CrosslineError::validation("cross id is required"));
        }
        let next = CrossControlMode {
            cross_id: cross_id.clone(),
            mode,
            plan_no: if mode.is_special() { None } else { plan_no },
            effective_time: Utc::now(),
        };

        let state = self.state(cross_id);
        {
            let mut guard = state.lock();
            if policy == SwitchPolicy::CheckRules {
                if let Some(current) = &guard.current {
                    if !self.rules.read().permits(current.mode, mode) {
                        return Err(CrosslineError::business(
                            SWITCH_FORBIDDEN,
                            format!("cross {cross_id} cannot switch from {} to {mode}", current.mode),
                        ));
                    }
                }
            }
            if let Some(previous) = guard.current.replace(next.clone()) {
                guard.history.push_front(previous);
                guard.history.truncate(self.config.history_limit);
            }

            if mode.is_special() {
                let released = self.locks.release_cross(cross_id);
                if released > 0 {
                    debug!(%cross_id, %mode, released, "released flow locks for special mode");
                }
            }
            // Queued before the guard drops so events leave in switch order.
            match serde_json::to_value(&next) {
                Ok(data) => {
                    self.dispatcher
                        .publish_ordered(cross_id, ObjectType::CrossCtrlInfo, data);
                }
                Err(e) => warn!(%cross_id, error = %e, "failed to encode mode change event"),
            }
        }
        Ok(next)
    }

    fn finish(
        &self,
        operation: &str,
        cross_id: &CrossId,
        result: Result<CrossControlMode>,
    ) -> Result<CrossControlMode> {
        match &result {
            Ok(_) => marker(operation, cross_id, MarkerOutcome::Succeeded),
            Err(e) => {
                debug!(%cross_id, code = e.code(), error = %e, "{operation} rejected");
                marker(operation, cross_id, MarkerOutcome::Failed);
            }
        }
        result
    }
}
