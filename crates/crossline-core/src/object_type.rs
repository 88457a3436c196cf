//! Catalogue of protocol object types.
//!
//! Every payload object in a [`crate::message::Message`] is tagged with one of
//! these names. Subscriptions, push publication and retransmission only accept
//! the [pushable](ObjectType::is_pushable) subset.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::CrosslineError;

/// Known object type names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectType {
    // ── Session objects ─────────────────────────────────────────────
    /// Peer login carrying an auth token.
    Login,
    /// Peer logout.
    Logout,
    /// Keep-alive notification.
    HeartBeat,
    /// Subscription request naming another object type.
    Subscription,

    // ── Parameters ──────────────────────────────────────────────────
    /// System description.
    SysInfo,
    /// Intersection parameters.
    CrossParam,
    /// Timing plan parameters.
    PlanParam,

    // ── Runtime data (pushable) ─────────────────────────────────────
    /// Online/offline state of a cross.
    CrossState,
    /// Signal controller fault report.
    SignalControllerError,
    /// Current control mode and plan of a cross.
    CrossCtrlInfo,
    /// Cycle start report.
    CrossCycle,
    /// Stage change report.
    CrossStage,
    /// Lamp state of each signal group.
    CrossSignalGroupStatus,
    /// Per-lane traffic flow statistics.
    CrossTrafficData,
    /// Per-stage traffic statistics.
    StageTrafficData,
    /// Variable lane state.
    VarLaneStatus,
    /// Coordinated route control info.
    RouteCtrlInfo,
    /// Recommended route speed.
    RouteSpeed,
    /// Flow direction lock state.
    LockFlowDirection,

    // ── Commands ────────────────────────────────────────────────────
    /// Release a flow direction lock.
    UnlockFlowDirection,
    /// Extend, shorten or skip a stage.
    AdjustStage,
    /// Immediate control override.
    EmergencyCtrl,
    /// Control mode history query.
    CrossCtrlInfoHistory,
    /// Retransmission request / task status.
    RetransTask,
    /// Cancel a retransmission task.
    RetransCancel,
}

impl ObjectType {
    /// Every known object type.
    pub const ALL: [Self; 25] = [
        Self::Login,
        Self::Logout,
        Self::HeartBeat,
        Self::Subscription,
        Self::SysInfo,
        Self::CrossParam,
        Self::PlanParam,
        Self::CrossState,
        Self::SignalControllerError,
        Self::CrossCtrlInfo,
        Self::CrossCycle,
        Self::CrossStage,
        Self::CrossSignalGroupStatus,
        Self::CrossTrafficData,
        Self::StageTrafficData,
        Self::VarLaneStatus,
        Self::RouteCtrlInfo,
        Self::RouteSpeed,
        Self::LockFlowDirection,
        Self::UnlockFlowDirection,
        Self::AdjustStage,
        Self::EmergencyCtrl,
        Self::CrossCtrlInfoHistory,
        Self::RetransTask,
        Self::RetransCancel,
    ];

    /// Wire name of the object type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Login => "Login",
            Self::Logout => "Logout",
            Self::HeartBeat => "HeartBeat",
            Self::Subscription => "Subscription",
            Self::SysInfo => "SysInfo",
            Self::CrossParam => "CrossParam",
            Self::PlanParam => "PlanParam",
            Self::CrossState => "CrossState",
            Self::SignalControllerError => "SignalControllerError",
            Self::CrossCtrlInfo => "CrossCtrlInfo",
            Self::CrossCycle => "CrossCycle",
            Self::CrossStage => "CrossStage",
            Self::CrossSignalGroupStatus => "CrossSignalGroupStatus",
            Self::CrossTrafficData => "CrossTrafficData",
            Self::StageTrafficData => "StageTrafficData",
            Self::VarLaneStatus => "VarLaneStatus",
            Self::RouteCtrlInfo => "RouteCtrlInfo",
            Self::RouteSpeed => "RouteSpeed",
            Self::LockFlowDirection => "LockFlowDirection",
            Self::UnlockFlowDirection => "UnlockFlowDirection",
            Self::AdjustStage => "AdjustStage",
            Self::EmergencyCtrl => "EmergencyCtrl",
            Self::CrossCtrlInfoHistory => "CrossCtrlInfoHistory",
            Self::RetransTask => "RetransTask",
            Self::RetransCancel => "RetransCancel",
        }
    }

    /// Whether objects of this type may be pushed to subscribers (and hence
    /// subscribed to and retransmitted).
    pub fn is_pushable(self) -> bool {
        matches!(
            self,
            Self::CrossState
                | Self::SignalControllerError
                | Self::CrossCtrlInfo
                | Self::CrossCycle
                | Self::CrossStage
                | Self::CrossSignalGroupStatus
                | Self::CrossTrafficData
                | Self::StageTrafficData
                | Self::VarLaneStatus
                | Self::RouteCtrlInfo
                | Self::RouteSpeed
                | Self::LockFlowDirection
        )
    }

    /// Parse a name and require it to be pushable.
    pub fn parse_pushable(name: &str) -> Result<Self, CrosslineError> {
        let ty: Self = name.parse()?;
        if ty.is_pushable() {
            Ok(ty)
        } else {
            Err(CrosslineError::validation(format!(
                "object type '{name}' cannot be pushed"
            )))
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = CrosslineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CrosslineError::validation(format!("unsupported object type '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn names_roundtrip_through_from_str() {
        for ty in ObjectType::ALL {
            assert_eq!(ty.as_str().parse::<ObjectType>().unwrap(), ty);
        }
    }

    #[test]
    fn serde_uses_wire_name() {
        let json = serde_json::to_string(&ObjectType::CrossTrafficData).unwrap();
        assert_eq!(json, "\"CrossTrafficData\"");
    }

    #[test]
    fn unknown_name_is_validation_error() {
        let err = "Bogus".parse::<ObjectType>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("Bogus"));
    }

    #[test]
    fn pushable_subset() {
        assert!(ObjectType::CrossTrafficData.is_pushable());
        assert!(ObjectType::CrossCtrlInfo.is_pushable());
        assert!(!ObjectType::Login.is_pushable());
        assert!(!ObjectType::AdjustStage.is_pushable());
    }

    #[test]
    fn parse_pushable_rejects_commands() {
        assert!(ObjectType::parse_pushable("CrossStage").is_ok());
        let err = ObjectType::parse_pushable("AdjustStage").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
