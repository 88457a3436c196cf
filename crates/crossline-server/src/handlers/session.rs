//! Login, logout and heartbeat.

use std::sync::Arc;

use async_trait::async_trait;
use crossline_core::logging::{MarkerOutcome, marker};
use crossline_core::message::LoginPayload;
use crossline_core::{CrosslineError, Message, ObjectType, PayloadObject, Result};
use crossline_transport::{RequestHandler, Session};
use serde_json::json;
use tracing::{debug, info, instrument};

use super::{HandlerContext, decode_first, reply, require_login};

/// SET `Login`: validate the token and bind the identity to the session.
pub struct LoginHandler(pub Arc<HandlerContext>);

#[async_trait]
impl RequestHandler for LoginHandler {
    #[instrument(skip_all, fields(route = "SET Login", session_id = session.id()))]
    async fn handle(&self, request: &Message, session: &Arc<Session>) -> Result<Vec<PayloadObject>> {
        let login: LoginPayload = decode_first(request)?;
        if login.token.trim().is_empty() {
            return Err(CrosslineError::validation("login token is required"));
        }
        let identity = match self.0.plane.auth.validate(&login.token).await {
            Ok(identity) => identity,
            Err(e) => {
                marker("login", session.id(), MarkerOutcome::Failed);
                return Err(e);
            }
        };
        session.bind_peer(identity.clone());
        info!(peer = %identity, remote = session.remote(), "peer logged in");
        marker("login", &identity, MarkerOutcome::Succeeded);
        reply(
            ObjectType::Login,
            &json!({ "identity": identity, "systemId": self.0.local }),
        )
    }
}

/// SET `Logout`: unbind the identity and drop its subscriptions.
pub struct LogoutHandler(pub Arc<HandlerContext>);

#[async_trait]
impl RequestHandler for LogoutHandler {
    #[instrument(skip_all, fields(route = "SET Logout", session_id = session.id()))]
    async fn handle(&self, _request: &Message, session: &Arc<Session>) -> Result<Vec<PayloadObject>> {
        let peer = require_login(session)?;
        let _ = session.unbind_peer();
        let removed = if self.0.connections.find_by_peer(&peer).is_empty() {
            self.0.plane.subscriptions.remove_all_for_subscriber(&peer)
        } else {
            0
        };
        info!(%peer, removed, "peer logged out");
        marker("logout", &peer, MarkerOutcome::Succeeded);
        reply(ObjectType::Logout, &json!({ "identity": peer }))
    }
}

/// NOTIFY `HeartBeat`. Receiving the frame already refreshed the session's
/// activity clock.
pub struct HeartBeatHandler;

#[async_trait]
impl RequestHandler for HeartBeatHandler {
    async fn handle(&self, _request: &Message, session: &Arc<Session>) -> Result<Vec<PayloadObject>> {
        debug!(session_id = session.id(), "heartbeat");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_helpers::TestContext;
    use crossline_core::errors::{AUTH_REJECTED, NOT_LOGGED_IN};
    use crossline_core::SubscriberId;

    #[tokio::test]
    async fn login_binds_identity() {
        let t = TestContext::new();
        let request = t.set(ObjectType::Login, json!({"token": "tok"}));
        let objects = LoginHandler(Arc::clone(&t.ctx))
            .handle(&request, &t.session)
            .await
            .unwrap();
        assert_eq!(objects[0].data["identity"], "platform");
        assert_eq!(t.session.peer(), Some(SubscriberId::from("platform")));
    }

    #[tokio::test]
    async fn bad_token_leaves_session_anonymous() {
        let t = TestContext::new();
        let request = t.set(ObjectType::Login, json!({"token": "wrong"}));
        let err = LoginHandler(Arc::clone(&t.ctx))
            .handle(&request, &t.session)
            .await
            .unwrap_err();
        assert_eq!(err.code(), AUTH_REJECTED);
        assert!(t.session.peer().is_none());
    }

    #[tokio::test]
    async fn missing_token_field_is_validation_error() {
        let t = TestContext::new();
        let request = t.set(ObjectType::Login, json!({"user": "x"}));
        let err = LoginHandler(Arc::clone(&t.ctx))
            .handle(&request, &t.session)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crossline_core::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn logout_requires_login_and_drops_subscriptions() {
        let t = TestContext::new();
        let logout = t.set(ObjectType::Logout, json!({}));
        let err = LogoutHandler(Arc::clone(&t.ctx))
            .handle(&logout, &t.session)
            .await
            .unwrap_err();
        assert_eq!(err.code(), NOT_LOGGED_IN);

        let peer = SubscriberId::from("platform");
        t.session.bind_peer(peer.clone());
        let _ = t
            .ctx
            .plane
            .subscriptions
            .add_subscription(&peer, ObjectType::CrossStage, "tok")
            .await
            .unwrap();

        let _ = LogoutHandler(Arc::clone(&t.ctx))
            .handle(&logout, &t.session)
            .await
            .unwrap();
        assert!(t.session.peer().is_none());
        assert!(t.ctx.plane.subscriptions.is_empty());
    }
}
