//! System information.

use std::sync::Arc;

use async_trait::async_trait;
use crossline_core::{Message, ObjectType, PayloadObject, Result};
use crossline_transport::{RequestHandler, Session};
use serde_json::json;
use tracing::instrument;

use super::{HandlerContext, reply, require_login};

/// QUERY `SysInfo`: identity, uptime and runtime counters.
pub struct SysInfoHandler(pub Arc<HandlerContext>);

#[async_trait]
impl RequestHandler for SysInfoHandler {
    #[instrument(skip_all, fields(route = "QUERY SysInfo"))]
    async fn handle(&self, _request: &Message, session: &Arc<Session>) -> Result<Vec<PayloadObject>> {
        let _ = require_login(session)?;
        let ctx = &self.0;
        reply(
            ObjectType::SysInfo,
            &json!({
                "systemId": ctx.local,
                "version": crossline_core::constants::VERSION,
                "connections": ctx.connections.len(),
                "subscriptions": ctx.plane.subscriptions.len(),
                "controlledCrosses": ctx.plane.modes.crosses().len(),
                "pushStats": ctx.plane.dispatcher.stats(),
                "retransTasks": ctx.plane.retrans.status_counts(),
                "uptimeSecs": ctx.started_at.elapsed().as_secs(),
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_helpers::TestContext;
    use crossline_control::ControlMode;
    use crossline_core::CrossId;

    #[tokio::test]
    async fn reports_counters() {
        let t = TestContext::logged_in();
        let _ = t
            .ctx
            .plane
            .modes
            .set_control_mode(&CrossId::from("c1"), ControlMode::AllRed, None)
            .await
            .unwrap();

        let query = t.query(ObjectType::SysInfo, json!({}));
        let objects = SysInfoHandler(Arc::clone(&t.ctx))
            .handle(&query, &t.session)
            .await
            .unwrap();
        let info = &objects[0].data;
        assert_eq!(info["systemId"], "utcs");
        assert_eq!(info["controlledCrosses"], 1);
        assert_eq!(info["connections"], 0);
        assert!(info["pushStats"]["totalAttempts"].is_u64());
    }
}
