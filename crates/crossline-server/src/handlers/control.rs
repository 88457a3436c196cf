//! Control-mode routes.

use std::sync::Arc;

use async_trait::async_trait;
use crossline_control::ControlMode;
use crossline_core::{CrossId, CrosslineError, Message, ObjectType, PayloadObject, Result};
use crossline_transport::{RequestHandler, Session};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::instrument;

use super::{HandlerContext, decode_first, first_object, reply, require_login, require_string_param};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetModeBody {
    #[serde(default)]
    cross_id: Option<CrossId>,
    #[serde(default)]
    cross_ids: Vec<CrossId>,
    mode: ControlMode,
    #[serde(default)]
    plan_no: Option<i32>,
}

/// SET `CrossCtrlInfo`: switch one cross (`crossId`) or several
/// (`crossIds`).
pub struct SetControlModeHandler(pub Arc<HandlerContext>);

#[async_trait]
impl RequestHandler for SetControlModeHandler {
    #[instrument(skip_all, fields(route = "SET CrossCtrlInfo"))]
    async fn handle(&self, request: &Message, session: &Arc<Session>) -> Result<Vec<PayloadObject>> {
        let _ = require_login(session)?;
        let body: SetModeBody = decode_first(request)?;
        let modes = &self.0.plane.modes;
        match (body.cross_id, body.cross_ids.is_empty()) {
            (Some(_), false) => Err(CrosslineError::validation(
                "give either crossId or crossIds, not both",
            )),
            (Some(cross_id), true) => {
                let state = modes.set_control_mode(&cross_id, body.mode, body.plan_no).await?;
                reply(ObjectType::CrossCtrlInfo, &state)
            }
            (None, false) => modes
                .batch_set_control_mode(&body.cross_ids, body.mode, body.plan_no)
                .await?
                .iter()
                .map(|state| PayloadObject::new(ObjectType::CrossCtrlInfo, state))
                .collect(),
            (None, true) => Err(CrosslineError::validation(
                "Missing required parameter: crossId",
            )),
        }
    }
}

/// QUERY `CrossCtrlInfo`: the mode in effect on `crossId`.
pub struct QueryControlModeHandler(pub Arc<HandlerContext>);

#[async_trait]
impl RequestHandler for QueryControlModeHandler {
    #[instrument(skip_all, fields(route = "QUERY CrossCtrlInfo"))]
    async fn handle(&self, request: &Message, session: &Arc<Session>) -> Result<Vec<PayloadObject>> {
        let _ = require_login(session)?;
        let cross_id = CrossId::from(require_string_param(&first_object(request)?.data, "crossId")?);
        let state = self
            .0
            .plane
            .modes
            .current_mode(&cross_id)
            .ok_or_else(|| CrosslineError::not_found("CrossCtrlInfo", cross_id.as_str()))?;
        reply(ObjectType::CrossCtrlInfo, &state)
    }
}

/// QUERY `CrossCtrlInfoHistory`: previous modes, most recent first.
pub struct QueryModeHistoryHandler(pub Arc<HandlerContext>);

#[async_trait]
impl RequestHandler for QueryModeHistoryHandler {
    #[instrument(skip_all, fields(route = "QUERY CrossCtrlInfoHistory"))]
    async fn handle(&self, request: &Message, session: &Arc<Session>) -> Result<Vec<PayloadObject>> {
        let _ = require_login(session)?;
        let data = &first_object(request)?.data;
        let cross_id = CrossId::from(require_string_param(data, "crossId")?);
        let limit = match data.get("limit") {
            None | Some(Value::Null) => self.0.history_limit,
            Some(raw) => match raw.as_u64() {
                Some(n) if n > 0 => usize::try_from(n).unwrap_or(usize::MAX),
                _ => {
                    return Err(CrosslineError::validation(format!(
                        "limit must be a positive integer (got {raw})"
                    )));
                }
            },
        };
        let history = self
            .0
            .plane
            .modes
            .get_control_mode_history(&cross_id, limit);
        reply(
            ObjectType::CrossCtrlInfoHistory,
            &json!({ "crossId": cross_id, "history": history }),
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmergencyBody {
    cross_id: CrossId,
    mode: ControlMode,
    #[serde(default)]
    plan_no: Option<i32>,
}

/// SET `EmergencyCtrl`: immediate override that ignores transition rules.
///
/// `planNo` is optional; without it a normal mode resumes the cross's last
/// plan.
pub struct EmergencyControlHandler(pub Arc<HandlerContext>);

#[async_trait]
impl RequestHandler for EmergencyControlHandler {
    #[instrument(skip_all, fields(route = "SET EmergencyCtrl"))]
    async fn handle(&self, request: &Message, session: &Arc<Session>) -> Result<Vec<PayloadObject>> {
        let _ = require_login(session)?;
        let body: EmergencyBody = decode_first(request)?;
        let state = self
            .0
            .plane
            .flow
            .emergency_control(&body.cross_id, body.mode, body.plan_no)
            .await?;
        reply(ObjectType::CrossCtrlInfo, &state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_helpers::TestContext;
    use crossline_core::ErrorKind;
    use crossline_core::errors::SWITCH_FORBIDDEN;

    #[tokio::test]
    async fn set_then_query_mode() {
        let t = TestContext::logged_in();
        let set = t.set(
            ObjectType::CrossCtrlInfo,
            json!({"crossId": "11010000100001", "mode": "SINGLE_TIMING", "planNo": 2}),
        );
        let objects = SetControlModeHandler(Arc::clone(&t.ctx))
            .handle(&set, &t.session)
            .await
            .unwrap();
        assert_eq!(objects[0].data["mode"], "SINGLE_TIMING");
        assert_eq!(objects[0].data["planNo"], 2);

        let query = t.query(ObjectType::CrossCtrlInfo, json!({"crossId": "11010000100001"}));
        let objects = QueryControlModeHandler(Arc::clone(&t.ctx))
            .handle(&query, &t.session)
            .await
            .unwrap();
        assert_eq!(objects[0].data["planNo"], 2);
    }

    #[tokio::test]
    async fn batch_switch_returns_one_object_per_cross() {
        let t = TestContext::logged_in();
        let set = t.set(
            ObjectType::CrossCtrlInfo,
            json!({"crossIds": ["c1", "c2"], "mode": "ALL_RED"}),
        );
        let objects = SetControlModeHandler(Arc::clone(&t.ctx))
            .handle(&set, &t.session)
            .await
            .unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[1].data["crossId"], "c2");
    }

    #[tokio::test]
    async fn unknown_cross_query_is_not_found() {
        let t = TestContext::logged_in();
        let query = t.query(ObjectType::CrossCtrlInfo, json!({"crossId": "nowhere"}));
        let err = QueryControlModeHandler(Arc::clone(&t.ctx))
            .handle(&query, &t.session)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn forbidden_transition_surfaces_business_code() {
        let t = TestContext::logged_in();
        let handler = SetControlModeHandler(Arc::clone(&t.ctx));
        let off = t.set(ObjectType::CrossCtrlInfo, json!({"crossId": "c1", "mode": "LIGHT_OFF"}));
        let _ = handler.handle(&off, &t.session).await.unwrap();
        let timing = t.set(
            ObjectType::CrossCtrlInfo,
            json!({"crossId": "c1", "mode": "SINGLE_TIMING", "planNo": 1}),
        );
        let err = handler.handle(&timing, &t.session).await.unwrap_err();
        assert_eq!(err.code(), SWITCH_FORBIDDEN);
    }

    #[tokio::test]
    async fn missing_cross_and_conflicting_targets_rejected() {
        let t = TestContext::logged_in();
        let handler = SetControlModeHandler(Arc::clone(&t.ctx));
        let none = t.set(ObjectType::CrossCtrlInfo, json!({"mode": "ALL_RED"}));
        let err = handler.handle(&none, &t.session).await.unwrap_err();
        assert!(err.to_string().contains("crossId"));

        let both = t.set(
            ObjectType::CrossCtrlInfo,
            json!({"crossId": "c1", "crossIds": ["c2"], "mode": "ALL_RED"}),
        );
        let err = handler.handle(&both, &t.session).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn history_respects_limit() {
        let t = TestContext::logged_in();
        let cross = CrossId::from("c1");
        for plan in 1..=4 {
            let _ = t
                .ctx
                .plane
                .modes
                .set_control_mode(&cross, ControlMode::SingleTiming, Some(plan))
                .await
                .unwrap();
        }
        let query = t.query(ObjectType::CrossCtrlInfoHistory, json!({"crossId": "c1", "limit": 2}));
        let objects = QueryModeHistoryHandler(Arc::clone(&t.ctx))
            .handle(&query, &t.session)
            .await
            .unwrap();
        let history = objects[0].data["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["planNo"], 3);
    }

    #[tokio::test]
    async fn history_rejects_malformed_limit() {
        let t = TestContext::logged_in();
        let handler = QueryModeHistoryHandler(Arc::clone(&t.ctx));
        for limit in [json!(0), json!(-5), json!("10"), json!(2.5)] {
            let query = t.query(
                ObjectType::CrossCtrlInfoHistory,
                json!({"crossId": "c1", "limit": limit}),
            );
            let err = handler.handle(&query, &t.session).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "limit {limit}");
        }

        let query = t.query(ObjectType::CrossCtrlInfoHistory, json!({"crossId": "c1"}));
        let objects = handler.handle(&query, &t.session).await.unwrap();
        assert!(objects[0].data["history"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn emergency_control_overrides_rules() {
        let t = TestContext::logged_in();
        let cross = CrossId::from("c1");
        let _ = t
            .ctx
            .plane
            .modes
            .set_control_mode(&cross, ControlMode::SingleTiming, Some(3))
            .await
            .unwrap();
        let _ = t
            .ctx
            .plane
            .modes
            .set_control_mode(&cross, ControlMode::LightOff, None)
            .await
            .unwrap();

        let handler = EmergencyControlHandler(Arc::clone(&t.ctx));
        let set = t.set(
            ObjectType::EmergencyCtrl,
            json!({"crossId": "c1", "mode": "SINGLE_TIMING"}),
        );
        let objects = handler.handle(&set, &t.session).await.unwrap();
        assert_eq!(objects[0].data["mode"], "SINGLE_TIMING");
        assert_eq!(objects[0].data["planNo"], 3);

        let set = t.set(
            ObjectType::EmergencyCtrl,
            json!({"crossId": "c1", "mode": "ALL_YELLOW_FLASH", "planNo": 4}),
        );
        let objects = handler.handle(&set, &t.session).await.unwrap();
        assert_eq!(objects[0].data["mode"], "ALL_YELLOW_FLASH");
        assert!(objects[0].data["planNo"].is_null());
    }
}
