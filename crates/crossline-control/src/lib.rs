//! # crossline-control
//!
//! Control plane of a Crossline lower peer:
//!
//! - **Subscriptions**: who wants pushes of which object type
//! - **Push**: one PUSH per event, fanned out per recipient with counters
//! - **Control modes**: per-cross state machine with transition rules and
//!   bounded history
//! - **Flow locks**: validated direction locks and stage interventions
//! - **Retransmission**: cancellable background replay of historical data
//!
//! All state lives in an explicitly constructed [`ControlPlane`].

#![deny(unsafe_code)]

pub mod collaborators;
pub mod control_mode;
pub mod flow_lock;
pub mod plane;
pub mod push;
pub mod retrans;
pub mod subscription;

#[cfg(test)]
mod test_support;

pub use collaborators::{
    AuthValidator, InterventionType, Plan, PlanLookup, SignalController, TrafficDataSource,
};
pub use control_mode::{
    ControlMode, ControlModeConfig, ControlModeManager, CrossControlMode, TransitionRules,
};
pub use flow_lock::{
    Direction, FlowLock, FlowLockController, FlowLockKey, FlowLockRequest, FlowLockTable,
    FlowType, LockStatus, LockType,
};
pub use plane::{Collaborators, ControlPlane, ControlPlaneConfig};
pub use push::{BatchReport, PublishReport, PushDispatcher, PushSink, PushStats};
pub use retrans::{RetransTask, RetransmissionOrchestrator, TaskStatus};
pub use subscription::{Subscription, SubscriptionRegistry};
