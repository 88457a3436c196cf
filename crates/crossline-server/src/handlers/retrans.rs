//! Retransmission task routes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossline_core::{CrossId, Message, ObjectType, PayloadObject, Result, TaskId};
use crossline_transport::{RequestHandler, Session};
use serde::Deserialize;
use tracing::instrument;

use super::{HandlerContext, decode_first, first_object, reply, require_login, require_string_param};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetransBody {
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    object_type: String,
    cross_ids: Vec<CrossId>,
}

fn task_id(request: &Message) -> Result<TaskId> {
    require_string_param(&first_object(request)?.data, "taskId").map(TaskId::from)
}

/// SET `RetransTask`: accept a replay window and start it in the background.
///
/// The response carries the task in `PENDING`; progress is polled with
/// QUERY `RetransTask`.
pub struct RequestRetransHandler(pub Arc<HandlerContext>);

#[async_trait]
impl RequestHandler for RequestRetransHandler {
    #[instrument(skip_all, fields(route = "SET RetransTask"))]
    async fn handle(&self, request: &Message, session: &Arc<Session>) -> Result<Vec<PayloadObject>> {
        let _ = require_login(session)?;
        let body: RetransBody = decode_first(request)?;
        let task = self.0.plane.retrans.request_retransmission(
            body.start_time,
            body.end_time,
            &body.object_type,
            body.cross_ids,
        )?;
        reply(ObjectType::RetransTask, &task)
    }
}

/// QUERY `RetransTask` by `taskId`.
pub struct QueryRetransHandler(pub Arc<HandlerContext>);

#[async_trait]
impl RequestHandler for QueryRetransHandler {
    #[instrument(skip_all, fields(route = "QUERY RetransTask"))]
    async fn handle(&self, request: &Message, session: &Arc<Session>) -> Result<Vec<PayloadObject>> {
        let _ = require_login(session)?;
        let task = self.0.plane.retrans.get_task_status(&task_id(request)?)?;
        reply(ObjectType::RetransTask, &task)
    }
}

/// SET `RetransCancel` by `taskId`.
pub struct CancelRetransHandler(pub Arc<HandlerContext>);

#[async_trait]
impl RequestHandler for CancelRetransHandler {
    #[instrument(skip_all, fields(route = "SET RetransCancel"))]
    async fn handle(&self, request: &Message, session: &Arc<Session>) -> Result<Vec<PayloadObject>> {
        let _ = require_login(session)?;
        let task = self.0.plane.retrans.cancel_task(&task_id(request)?)?;
        reply(ObjectType::RetransTask, &task)
    }
}
