//! Upper platform talking to a real `CrosslineServer` over TCP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use crossline_core::errors::{HANDLER_NOT_FOUND, NOT_LOGGED_IN};
use crossline_core::{CrossId, Message, MessageFactory, ObjectType, PayloadObject, PeerRole, SystemId};
use crossline_server::adapters::{InMemoryPlans, InMemoryTrafficStore, LoggingSignalController, TokenAuth};
use crossline_server::{Backends, CrosslineServer};
use crossline_settings::{CrosslineSettings, TokenEntry};
use crossline_transport::{Client, HandlerRegistry, PushListener, SessionConfig};
use parking_lot::Mutex;
use serde_json::json;

#[derive(Clone, Default)]
struct Pushes(Arc<Mutex<Vec<Message>>>);

#[async_trait]
impl PushListener for Pushes {
    async fn on_push(&self, push: &Message) {
        self.0.lock().push(push.clone());
    }
}

impl Pushes {
    async fn wait_for(&self, count: usize) -> Vec<Message> {
        for _ in 0..400 {
            let seen = self.0.lock().clone();
            if seen.len() >= count {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} pushes, got {}", self.0.lock().len());
    }
}

fn settings() -> CrosslineSettings {
    let mut settings = CrosslineSettings::default();
    settings.server.host = "127.0.0.1".into();
    settings.server.port = 0;
    settings.auth.tokens = vec![TokenEntry {
        token: "tok".into(),
        identity: "platform".into(),
    }];
    settings
}

struct Fixture {
    server: CrosslineServer,
    store: Arc<InMemoryTrafficStore>,
    addr: String,
}

async fn start() -> Fixture {
    let settings = settings();
    let store = Arc::new(InMemoryTrafficStore::new());
    let backends = Backends {
        plans: Arc::new(InMemoryPlans::new(8)),
        data: Arc::clone(&store) as _,
        auth: Arc::new(TokenAuth::new(&settings.auth.tokens)),
        signals: Arc::new(LoggingSignalController::default()),
    };
    let server = CrosslineServer::with_backends(settings, backends);
    let (addr, _handle) = server.listen().await.unwrap();
    Fixture {
        server,
        store,
        addr: addr.to_string(),
    }
}

async fn connect(addr: &str, pushes: &Pushes) -> Client {
    let mut registry = HandlerRegistry::new();
    registry.add_listener(None, pushes.clone());
    Client::connect(
        addr,
        MessageFactory::new("platform", PeerRole::Upper).with_token("tok"),
        SystemId::from("utcs"),
        SessionConfig::default(),
        Arc::new(registry),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn control_mode_switch_is_pushed_to_subscriber() {
    let fixture = start().await;
    let pushes = Pushes::default();
    let client = connect(&fixture.addr, &pushes).await;

    let err = client.subscribe(ObjectType::CrossCtrlInfo).await.unwrap_err();
    assert_eq!(err.code(), NOT_LOGGED_IN);

    let objects = client.login("tok").await.unwrap();
    assert_eq!(objects[0].data["identity"], "platform");
    client.subscribe(ObjectType::CrossCtrlInfo).await.unwrap();

    let objects = client
        .set(vec![PayloadObject::from_value(
            ObjectType::CrossCtrlInfo,
            json!({"crossId": "11010000100001", "mode": "SINGLE_TIMING", "planNo": 3}),
        )])
        .await
        .unwrap();
    assert_eq!(objects[0].data["planNo"], 3);

    let seen = pushes.wait_for(1).await;
    assert_eq!(seen[0].object_type(), Some(ObjectType::CrossCtrlInfo));
    assert_eq!(seen[0].objects()[0].data["crossId"], "11010000100001");

    let objects = client
        .query(vec![PayloadObject::from_value(
            ObjectType::SysInfo,
            json!({"detail": true}),
        )])
        .await
        .unwrap();
    assert_eq!(objects[0].data["connections"], 1);

    client.close();
    fixture.server.shutdown().shutdown();
}

#[tokio::test]
async fn lock_and_query_over_the_wire() {
    let fixture = start().await;
    let client = connect(&fixture.addr, &Pushes::default()).await;
    let _ = client.login("tok").await.unwrap();

    let _ = client
        .set(vec![PayloadObject::from_value(
            ObjectType::LockFlowDirection,
            json!({
                "crossId": "c1",
                "flowType": "PEDESTRIAN",
                "entrance": "EAST",
                "exit": "WEST",
                "lockType": "DIRECTION_RELEASE",
                "lockStageNo": 0,
                "duration": 0
            }),
        )])
        .await
        .unwrap();

    let objects = client
        .query(vec![PayloadObject::from_value(
            ObjectType::LockFlowDirection,
            json!({"crossId": "c1"}),
        )])
        .await
        .unwrap();
    assert_eq!(objects[0].data["locks"][0]["lockType"], "DIRECTION_RELEASE");

    fixture.server.shutdown().shutdown();
}

#[tokio::test]
async fn retransmission_replays_history_as_pushes() {
    let fixture = start().await;
    let now = Utc::now();
    let cross = CrossId::from("c1");
    for minutes in [10, 20] {
        fixture.store.record(
            ObjectType::CrossCycle,
            &cross,
            now - chrono::Duration::minutes(minutes),
            json!({"crossId": "c1", "cycleLen": minutes}),
        );
    }

    let pushes = Pushes::default();
    let client = connect(&fixture.addr, &pushes).await;
    let _ = client.login("tok").await.unwrap();
    client.subscribe(ObjectType::CrossCycle).await.unwrap();

    let objects = client
        .set(vec![PayloadObject::from_value(
            ObjectType::RetransTask,
            json!({
                "startTime": now - chrono::Duration::hours(1),
                "endTime": now,
                "objectType": "CrossCycle",
                "crossIds": ["c1"],
            }),
        )])
        .await
        .unwrap();
    let task_id = objects[0].data["taskId"].clone();

    let seen = pushes.wait_for(2).await;
    assert!(seen.iter().all(|m| m.object_type() == Some(ObjectType::CrossCycle)));

    let objects = client
        .query(vec![PayloadObject::from_value(
            ObjectType::RetransTask,
            json!({"taskId": task_id}),
        )])
        .await
        .unwrap();
    assert_eq!(objects[0].data["publishedCount"], 2);

    fixture.server.shutdown().shutdown();
}

#[tokio::test]
async fn unknown_route_reports_handler_not_found() {
    let fixture = start().await;
    let client = connect(&fixture.addr, &Pushes::default()).await;
    let _ = client.login("tok").await.unwrap();

    let err = client
        .query(vec![PayloadObject::from_value(
            ObjectType::CrossParam,
            json!({"crossId": "c1"}),
        )])
        .await
        .unwrap_err();
    assert_eq!(err.code(), HANDLER_NOT_FOUND);

    fixture.server.shutdown().shutdown();
}

#[tokio::test]
async fn disconnect_drops_subscriptions() {
    let fixture = start().await;
    let client = connect(&fixture.addr, &Pushes::default()).await;
    let _ = client.login("tok").await.unwrap();
    client.subscribe(ObjectType::CrossStage).await.unwrap();
    assert_eq!(fixture.server.plane().subscriptions.len(), 1);

    client.close();
    for _ in 0..400 {
        if fixture.server.plane().subscriptions.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(fixture.server.plane().subscriptions.is_empty());
    assert!(fixture.server.connections().is_empty());

    fixture.server.shutdown().shutdown();
}
