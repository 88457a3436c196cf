//! Request handlers for every `(operation, object type)` route the lower
//! peer serves.

pub mod control;
pub mod flow;
pub mod retrans;
pub mod session;
pub mod subscription;
pub mod system;

use std::sync::Arc;
use std::time::Instant;

use crossline_control::ControlPlane;
use crossline_core::errors::NOT_LOGGED_IN;
use crossline_core::{
    CrosslineError, Message, ObjectType, Operation, PayloadObject, Result, SubscriberId, SystemId,
};
use crossline_transport::{ConnectionTable, HandlerRegistry, Session};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Shared state handed to every handler.
pub struct HandlerContext {
    /// Control-plane components.
    pub plane: ControlPlane,
    /// Live sessions.
    pub connections: Arc<ConnectionTable>,
    /// Local system id reported by `SysInfo`.
    pub local: SystemId,
    /// Default history page size.
    pub history_limit: usize,
    /// Server start time.
    pub started_at: Instant,
}

/// Register every route on `registry`.
pub fn register_handlers(registry: &mut HandlerRegistry, ctx: &Arc<HandlerContext>) {
    use Operation::{Notify, Query, Set, Subscribe, Unsubscribe};

    registry.register(Set, ObjectType::Login, session::LoginHandler(Arc::clone(ctx)));
    registry.register(Set, ObjectType::Logout, session::LogoutHandler(Arc::clone(ctx)));
    registry.register(Notify, ObjectType::HeartBeat, session::HeartBeatHandler);

    registry.register(
        Subscribe,
        ObjectType::Subscription,
        subscription::SubscribeHandler(Arc::clone(ctx)),
    );
    registry.register(
        Unsubscribe,
        ObjectType::Subscription,
        subscription::UnsubscribeHandler(Arc::clone(ctx)),
    );

    registry.register(Set, ObjectType::CrossCtrlInfo, control::SetControlModeHandler(Arc::clone(ctx)));
    registry.register(Query, ObjectType::CrossCtrlInfo, control::QueryControlModeHandler(Arc::clone(ctx)));
    registry.register(
        Query,
        ObjectType::CrossCtrlInfoHistory,
        control::QueryModeHistoryHandler(Arc::clone(ctx)),
    );
    registry.register(Set, ObjectType::EmergencyCtrl, control::EmergencyControlHandler(Arc::clone(ctx)));

    registry.register(Set, ObjectType::LockFlowDirection, flow::LockFlowHandler(Arc::clone(ctx)));
    registry.register(Set, ObjectType::UnlockFlowDirection, flow::UnlockFlowHandler(Arc::clone(ctx)));
    registry.register(Query, ObjectType::LockFlowDirection, flow::QueryLockStatusHandler(Arc::clone(ctx)));
    registry.register(Set, ObjectType::AdjustStage, flow::AdjustStageHandler(Arc::clone(ctx)));

    registry.register(Set, ObjectType::RetransTask, retrans::RequestRetransHandler(Arc::clone(ctx)));
    registry.register(Query, ObjectType::RetransTask, retrans::QueryRetransHandler(Arc::clone(ctx)));
    registry.register(Set, ObjectType::RetransCancel, retrans::CancelRetransHandler(Arc::clone(ctx)));

    registry.register(Query, ObjectType::SysInfo, system::SysInfoHandler(Arc::clone(ctx)));
}

/// Body of the first payload object.
pub(crate) fn first_object(request: &Message) -> Result<&PayloadObject> {
    request
        .objects()
        .first()
        .ok_or_else(|| CrosslineError::validation("request carries no payload objects"))
}

/// Decode the first payload object.
pub(crate) fn decode_first<T: DeserializeOwned>(request: &Message) -> Result<T> {
    first_object(request)?.decode()
}

/// Extract a required field from an object body.
pub(crate) fn require_param<'a>(data: &'a Value, key: &str) -> Result<&'a Value> {
    data.get(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| CrosslineError::validation(format!("Missing required parameter: {key}")))
}

/// Extract a required string field.
pub(crate) fn require_string_param(data: &Value, key: &str) -> Result<String> {
    require_param(data, key)?
        .as_str()
        .map(ToOwned::to_owned)
        .ok_or_else(|| CrosslineError::validation(format!("Parameter '{key}' must be a string")))
}

/// Identity bound to the session by a successful login.
pub(crate) fn require_login(session: &Session) -> Result<SubscriberId> {
    session
        .peer()
        .ok_or_else(|| CrosslineError::business(NOT_LOGGED_IN, "login required"))
}

/// Serialize one response object.
pub(crate) fn reply<T: Serialize>(object_type: ObjectType, value: &T) -> Result<Vec<PayloadObject>> {
    Ok(vec![PayloadObject::new(object_type, value)?])
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::sync::Arc;
    use std::time::Instant;

    use crossline_control::{Collaborators, ControlPlane, ControlPlaneConfig};
    use crossline_core::{
        Message, MessageFactory, ObjectType, PayloadObject, PeerRole, SubscriberId, SystemId,
    };
    use crossline_settings::TokenEntry;
    use crossline_transport::{ConnectionTable, Session, SessionConfig};
    use serde_json::Value;

    use super::HandlerContext;
    use crate::adapters::{
        InMemoryPlans, InMemoryTrafficStore, LoggingSignalController, SessionPushSink, TokenAuth,
    };

    pub struct TestContext {
        pub ctx: Arc<HandlerContext>,
        pub session: Arc<Session>,
        pub signals: Arc<LoggingSignalController>,
        pub store: Arc<InMemoryTrafficStore>,
        factory: MessageFactory,
    }

    impl TestContext {
        pub fn new() -> Self {
            let connections = Arc::new(ConnectionTable::new());
            let signals = Arc::new(LoggingSignalController::default());
            let store = Arc::new(InMemoryTrafficStore::new());
            let plane = ControlPlane::new(
                &ControlPlaneConfig::default(),
                Collaborators {
                    plans: Arc::new(InMemoryPlans::new(8)),
                    data: Arc::clone(&store) as _,
                    auth: Arc::new(TokenAuth::new(&[TokenEntry {
                        token: "tok".into(),
                        identity: "platform".into(),
                    }])),
                    signals: Arc::clone(&signals) as _,
                    sink: Arc::new(SessionPushSink(Arc::clone(&connections))),
                },
            );
            let ctx = Arc::new(HandlerContext {
                plane,
                connections,
                local: SystemId::from("utcs"),
                history_limit: 50,
                started_at: Instant::now(),
            });
            let (session, _peer) =
                Session::in_memory_pair(SessionConfig::default(), Default::default(), Default::default());
            Self {
                ctx,
                session,
                signals,
                store,
                factory: MessageFactory::new("platform", PeerRole::Upper).with_token("tok"),
            }
        }

        /// A context whose session is already logged in as `platform`.
        pub fn logged_in() -> Self {
            let t = Self::new();
            t.session.bind_peer(SubscriberId::from("platform"));
            t
        }

        pub fn set(&self, object_type: ObjectType, data: Value) -> Message {
            self.factory
                .set(&SystemId::from("utcs"), vec![PayloadObject::from_value(object_type, data)])
                .unwrap()
        }

        pub fn query(&self, object_type: ObjectType, data: Value) -> Message {
            self.factory
                .query(&SystemId::from("utcs"), vec![PayloadObject::from_value(object_type, data)])
                .unwrap()
        }

        pub fn subscribe(&self, object_type: ObjectType) -> Message {
            self.factory.subscribe(&SystemId::from("utcs"), object_type).unwrap()
        }
    }
}
