//! Flow locks and stage interventions.

use std::sync::Arc;

use async_trait::async_trait;
use crossline_control::{FlowLockKey, FlowLockRequest, InterventionType};
use crossline_core::{CrossId, Message, ObjectType, PayloadObject, Result};
use crossline_transport::{RequestHandler, Session};
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use super::{HandlerContext, decode_first, first_object, reply, require_login, require_string_param};

/// SET `LockFlowDirection`.
pub struct LockFlowHandler(pub Arc<HandlerContext>);

#[async_trait]
impl RequestHandler for LockFlowHandler {
    #[instrument(skip_all, fields(route = "SET LockFlowDirection"))]
    async fn handle(&self, request: &Message, session: &Arc<Session>) -> Result<Vec<PayloadObject>> {
        let _ = require_login(session)?;
        let body: FlowLockRequest = decode_first(request)?;
        let lock = self.0.plane.flow.lock_flow_direction(&body)?;
        reply(ObjectType::LockFlowDirection, &lock)
    }
}

/// SET `UnlockFlowDirection`. Releasing a lock that is not held succeeds
/// with `released: false`.
pub struct UnlockFlowHandler(pub Arc<HandlerContext>);

#[async_trait]
impl RequestHandler for UnlockFlowHandler {
    #[instrument(skip_all, fields(route = "SET UnlockFlowDirection"))]
    async fn handle(&self, request: &Message, session: &Arc<Session>) -> Result<Vec<PayloadObject>> {
        let _ = require_login(session)?;
        let key: FlowLockKey = decode_first(request)?;
        let released = self.0.plane.flow.unlock_flow_direction(&key)?.is_some();
        reply(
            ObjectType::UnlockFlowDirection,
            &json!({
                "crossId": key.cross_id,
                "flowType": key.flow_type,
                "entrance": key.entrance,
                "exit": key.exit,
                "released": released,
            }),
        )
    }
}

/// QUERY `LockFlowDirection`: active locks of `crossId`.
pub struct QueryLockStatusHandler(pub Arc<HandlerContext>);

#[async_trait]
impl RequestHandler for QueryLockStatusHandler {
    #[instrument(skip_all, fields(route = "QUERY LockFlowDirection"))]
    async fn handle(&self, request: &Message, session: &Arc<Session>) -> Result<Vec<PayloadObject>> {
        let _ = require_login(session)?;
        let cross_id = CrossId::from(require_string_param(&first_object(request)?.data, "crossId")?);
        reply(
            ObjectType::LockFlowDirection,
            &self.0.plane.flow.get_lock_status(&cross_id),
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdjustStageBody {
    cross_id: CrossId,
    stage_no: u32,
    #[serde(rename = "type")]
    intervention: InterventionType,
    length: i64,
}

/// SET `AdjustStage`: extend, shorten or skip a stage.
pub struct AdjustStageHandler(pub Arc<HandlerContext>);

#[async_trait]
impl RequestHandler for AdjustStageHandler {
    #[instrument(skip_all, fields(route = "SET AdjustStage"))]
    async fn handle(&self, request: &Message, session: &Arc<Session>) -> Result<Vec<PayloadObject>> {
        let _ = require_login(session)?;
        let body: AdjustStageBody = decode_first(request)?;
        self.0
            .plane
            .flow
            .stage_intervention(&body.cross_id, body.stage_no, body.intervention, body.length)
            .await?;
        reply(
            ObjectType::AdjustStage,
            &json!({
                "crossId": body.cross_id,
                "stageNo": body.stage_no,
                "type": body.intervention,
                "length": body.length,
            }),
        )
    }
}
