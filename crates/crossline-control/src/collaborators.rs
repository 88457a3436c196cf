//! Contracts of the external systems the control plane consumes.
//!
//! Each collaborator is an async trait so adapters can sit on a database,
//! an RPC client or an in-memory table. Implementations report a missing
//! entity as [`crossline_core::CrosslineError::NotFound`]; any other error
//! is propagated to the caller unchanged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossline_core::{CrossId, ObjectType, Result, SubscriberId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A timing plan as far as the control plane cares.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// Cross the plan belongs to.
    pub cross_id: CrossId,
    /// Plan number.
    pub plan_no: i32,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Cycle length in seconds.
    #[serde(default)]
    pub cycle_secs: u32,
}

/// Timing plan lookup.
#[async_trait]
pub trait PlanLookup: Send + Sync {
    /// Find `plan_no` for `cross_id`.
    async fn find_plan(&self, cross_id: &CrossId, plan_no: i32) -> Result<Plan>;
}

/// Historical record query used by retransmission.
#[async_trait]
pub trait TrafficDataSource: Send + Sync {
    /// Records of `object_type` for one cross within `[start, end]`.
    async fn fetch_historical(
        &self,
        object_type: ObjectType,
        cross_id: &CrossId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Value>>;
}

/// Token validation.
#[async_trait]
pub trait AuthValidator: Send + Sync {
    /// Resolve a token to the identity it was issued to.
    ///
    /// An unknown or expired token is a `Business` error with code
    /// `AUTH_REJECTED`.
    async fn validate(&self, token: &str) -> Result<SubscriberId>;
}

/// Stage adjustment requested by a stage intervention.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterventionType {
    /// Lengthen the stage.
    Extend,
    /// Shorten the stage.
    Shorten,
    /// Skip the stage.
    Skip,
}

impl InterventionType {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extend => "EXTEND",
            Self::Shorten => "SHORTEN",
            Self::Skip => "SKIP",
        }
    }
}

/// Signal-control hardware gateway.
#[async_trait]
pub trait SignalController: Send + Sync {
    /// Apply a stage intervention on the controller of `cross_id`.
    async fn adjust_stage(
        &self,
        cross_id: &CrossId,
        stage_no: u32,
        intervention: InterventionType,
        length_secs: u32,
    ) -> Result<()>;
}
