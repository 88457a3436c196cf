//! Explicitly constructed control-plane state.
//!
//! [`ControlPlane`] owns every shared map (subscriptions, modes, locks,
//! retransmission tasks). Nothing here is global: each instance is isolated,
//! so tests and multiple listeners can run side by side.

use std::sync::Arc;
use std::time::Duration;

use crossline_core::{MessageFactory, PeerRole, SystemId};
use crossline_settings::CrosslineSettings;

use crate::collaborators::{AuthValidator, PlanLookup, SignalController, TrafficDataSource};
use crate::control_mode::{ControlModeConfig, ControlModeManager};
use crate::flow_lock::{FlowLockController, FlowLockTable};
use crate::push::{PushDispatcher, PushSink};
use crate::retrans::RetransmissionOrchestrator;
use crate::subscription::SubscriptionRegistry;

/// Tunables derived from [`CrosslineSettings`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlPlaneConfig {
    /// Local system id written into pushes.
    pub local: SystemId,
    /// Peer system id pushes are addressed to.
    pub peer: SystemId,
    /// Which end of the link this process plays.
    pub role: PeerRole,
    /// Mode manager tunables.
    pub modes: ControlModeConfig,
    /// Upper bound for lock durations.
    pub max_lock_duration_secs: u32,
    /// Per-recipient delivery timeout.
    pub delivery_timeout: Duration,
    /// Concurrent background publications.
    pub push_workers: usize,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self::from(&CrosslineSettings::default())
    }
}

impl From<&CrosslineSettings> for ControlPlaneConfig {
    fn from(settings: &CrosslineSettings) -> Self {
        Self {
            local: SystemId::from(settings.identity.system_id.as_str()),
            peer: SystemId::from(settings.identity.peer_system_id.as_str()),
            role: settings.identity.role,
            modes: ControlModeConfig {
                history_limit: settings.control.history_limit,
                sentinel_plan_ceiling: settings.control.sentinel_plan_ceiling,
            },
            max_lock_duration_secs: settings.control.max_lock_duration_secs,
            delivery_timeout: Duration::from_millis(settings.push.delivery_timeout_ms),
            push_workers: settings.push.worker_concurrency,
        }
    }
}

/// External systems the control plane depends on.
#[derive(Clone)]
pub struct Collaborators {
    /// Timing plan lookup.
    pub plans: Arc<dyn PlanLookup>,
    /// Historical data for retransmission.
    pub data: Arc<dyn TrafficDataSource>,
    /// Token validation.
    pub auth: Arc<dyn AuthValidator>,
    /// Signal controller gateway.
    pub signals: Arc<dyn SignalController>,
    /// Outbound push delivery.
    pub sink: Arc<dyn PushSink>,
}

/// Handles to every control-plane component.
#[derive(Clone)]
pub struct ControlPlane {
    /// Subscription registry.
    pub subscriptions: Arc<SubscriptionRegistry>,
    /// Push fan-out.
    pub dispatcher: Arc<PushDispatcher>,
    /// Control mode state machine.
    pub modes: Arc<ControlModeManager>,
    /// Flow locks and stage interventions.
    pub flow: Arc<FlowLockController>,
    /// Retransmission tasks.
    pub retrans: Arc<RetransmissionOrchestrator>,
    /// Auth validator, shared with login handling.
    pub auth: Arc<dyn AuthValidator>,
}

impl ControlPlane {
    /// Wire the components together.
    pub fn new(config: &ControlPlaneConfig, collaborators: Collaborators) -> Self {
        let subscriptions = Arc::new(SubscriptionRegistry::new(Arc::clone(&collaborators.auth)));
        let dispatcher = Arc::new(PushDispatcher::new(
            MessageFactory::new(config.local.clone(), config.role),
            config.peer.clone(),
            Arc::clone(&subscriptions),
            collaborators.sink,
            config.delivery_timeout,
            config.push_workers,
        ));
        let locks = Arc::new(FlowLockTable::new());
        let modes = Arc::new(ControlModeManager::new(
            config.modes,
            collaborators.plans,
            Arc::clone(&locks),
            Arc::clone(&dispatcher),
        ));
        let flow = Arc::new(FlowLockController::new(
            locks,
            Arc::clone(&modes),
            collaborators.signals,
            Arc::clone(&dispatcher),
            config.max_lock_duration_secs,
        ));
        let retrans = Arc::new(RetransmissionOrchestrator::new(
            collaborators.data,
            Arc::clone(&dispatcher),
        ));
        Self {
            subscriptions,
            dispatcher,
            modes,
            flow,
            retrans,
            auth: collaborators.auth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_follows_settings() {
        let mut settings = CrosslineSettings::default();
        settings.control.history_limit = 10;
        settings.control.sentinel_plan_ceiling = -100;
        settings.identity.peer_system_id = "platform".into();

        let config = ControlPlaneConfig::from(&settings);
        assert_eq!(config.modes.history_limit, 10);
        assert_eq!(config.modes.sentinel_plan_ceiling, -100);
        assert_eq!(config.peer.as_str(), "platform");
        assert_eq!(config.max_lock_duration_secs, 3600);
    }

    #[tokio::test]
    async fn instances_are_isolated() {
        let a = crate::test_support::Harness::new();
        let b = crate::test_support::Harness::new();
        let cross = crossline_core::CrossId::from("c1");
        let _ = a
            .modes
            .set_control_mode(&cross, crate::ControlMode::AllRed, None)
            .await
            .unwrap();
        assert!(a.modes.current_mode(&cross).is_some());
        assert!(b.modes.current_mode(&cross).is_none());
    }
}
