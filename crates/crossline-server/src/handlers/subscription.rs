//! SUBSCRIBE / UNSUBSCRIBE.

use std::sync::Arc;

use async_trait::async_trait;
use crossline_core::message::SubscriptionPayload;
use crossline_core::{CrosslineError, Message, ObjectType, PayloadObject, Result};
use crossline_transport::{RequestHandler, Session};
use serde_json::json;
use tracing::instrument;

use super::{HandlerContext, decode_first, reply, require_login};

/// Register the logged-in peer for pushes of one object type.
///
/// The request's auth token is validated again for every subscription.
pub struct SubscribeHandler(pub Arc<HandlerContext>);

#[async_trait]
impl RequestHandler for SubscribeHandler {
    #[instrument(skip_all, fields(route = "SUBSCRIBE", session_id = session.id()))]
    async fn handle(&self, request: &Message, session: &Arc<Session>) -> Result<Vec<PayloadObject>> {
        let peer = require_login(session)?;
        let body: SubscriptionPayload = decode_first(request)?;
        let token = request
            .token()
            .ok_or_else(|| CrosslineError::validation("subscription requires an auth token"))?;
        let subscription = self
            .0
            .plane
            .subscriptions
            .add_subscription(&peer, body.object_type, token)
            .await?;
        reply(ObjectType::Subscription, &subscription)
    }
}

/// Remove one subscription of the logged-in peer.
pub struct UnsubscribeHandler(pub Arc<HandlerContext>);

#[async_trait]
impl RequestHandler for UnsubscribeHandler {
    #[instrument(skip_all, fields(route = "UNSUBSCRIBE", session_id = session.id()))]
    async fn handle(&self, request: &Message, session: &Arc<Session>) -> Result<Vec<PayloadObject>> {
        let peer = require_login(session)?;
        let body: SubscriptionPayload = decode_first(request)?;
        let removed = self
            .0
            .plane
            .subscriptions
            .remove_subscription(&peer, body.object_type);
        reply(
            ObjectType::Subscription,
            &json!({ "objectType": body.object_type, "removed": removed }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_helpers::TestContext;
    use crossline_core::SubscriberId;

    #[tokio::test]
    async fn subscribe_then_unsubscribe() {
        let t = TestContext::logged_in();
        let request = t.subscribe(ObjectType::CrossCycle);
        let objects = SubscribeHandler(Arc::clone(&t.ctx))
            .handle(&request, &t.session)
            .await
            .unwrap();
        assert_eq!(objects[0].data["objectType"], "CrossCycle");
        assert_eq!(
            t.ctx.plane.subscriptions.subscribers_for(ObjectType::CrossCycle),
            vec![SubscriberId::from("platform")]
        );

        let request = t.subscribe(ObjectType::CrossCycle);
        let objects = UnsubscribeHandler(Arc::clone(&t.ctx))
            .handle(&request, &t.session)
            .await
            .unwrap();
        assert_eq!(objects[0].data["removed"], true);
        assert!(t.ctx.plane.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn anonymous_session_cannot_subscribe() {
        let t = TestContext::new();
        let request = t.subscribe(ObjectType::CrossCycle);
        assert!(SubscribeHandler(Arc::clone(&t.ctx))
            .handle(&request, &t.session)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn non_pushable_type_rejected() {
        let t = TestContext::logged_in();
        let request = t.subscribe(ObjectType::AdjustStage);
        let err = SubscribeHandler(Arc::clone(&t.ctx))
            .handle(&request, &t.session)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crossline_core::ErrorKind::Validation);
    }
}
