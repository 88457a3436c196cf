//! Outbound connector.
//!
//! [`Client`] dials a peer, wraps the stream in a [`Session`] and offers the
//! request shortcuts an upper-level platform needs: login, subscription
//! management, QUERY/SET and periodic heartbeats.

use std::sync::Arc;
use std::time::Duration;

use crossline_core::message::LoginPayload;
use crossline_core::{
    CrosslineError, MessageFactory, ObjectType, PayloadObject, Result, SystemId,
};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::HandlerRegistry;
use crate::session::{Session, SessionConfig};

/// A connected peer link.
#[derive(Debug, Clone)]
pub struct Client {
    session: Arc<Session>,
    factory: MessageFactory,
    peer: SystemId,
}

impl Client {
    /// Dial `addr` and start the session.
    ///
    /// `registry` serves requests and pushes the peer sends back.
    pub async fn connect(
        addr: &str,
        factory: MessageFactory,
        peer: SystemId,
        config: SessionConfig,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            CrosslineError::connection_closed(format!("connect to {addr} failed: {e}"))
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let (session, _reader) = Session::spawn(stream, addr, config, registry);
        info!(session_id = session.id(), %addr, peer = %peer, "connected to peer");
        Ok(Self::from_session(session, factory, peer))
    }

    /// Wrap an existing session.
    pub fn from_session(session: Arc<Session>, factory: MessageFactory, peer: SystemId) -> Self {
        Self {
            session,
            factory,
            peer,
        }
    }

    /// Underlying session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Message factory bound to the local identity.
    pub fn factory(&self) -> &MessageFactory {
        &self.factory
    }

    /// Peer system id.
    pub fn peer(&self) -> &SystemId {
        &self.peer
    }

    /// Log in with `token`.
    pub async fn login(&self, token: &str) -> Result<Vec<PayloadObject>> {
        let body = LoginPayload {
            token: token.to_owned(),
        };
        let request = self
            .factory
            .set(&self.peer, vec![PayloadObject::new(ObjectType::Login, &body)?])?;
        self.session.request(request).await
    }

    /// Log out.
    pub async fn logout(&self) -> Result<()> {
        let request = self.factory.set(
            &self.peer,
            vec![PayloadObject::from_value(ObjectType::Logout, json!({}))],
        )?;
        let _ = self.session.request(request).await?;
        Ok(())
    }

    /// Subscribe to pushes of `object_type`.
    pub async fn subscribe(&self, object_type: ObjectType) -> Result<()> {
        let request = self.factory.subscribe(&self.peer, object_type)?;
        let _ = self.session.request(request).await?;
        Ok(())
    }

    /// Stop pushes of `object_type`.
    pub async fn unsubscribe(&self, object_type: ObjectType) -> Result<()> {
        let request = self.factory.unsubscribe(&self.peer, object_type)?;
        let _ = self.session.request(request).await?;
        Ok(())
    }

    /// QUERY and return the response objects.
    pub async fn query(&self, objects: Vec<PayloadObject>) -> Result<Vec<PayloadObject>> {
        let request = self.factory.query(&self.peer, objects)?;
        self.session.request(request).await
    }

    /// SET and return the response objects.
    pub async fn set(&self, objects: Vec<PayloadObject>) -> Result<Vec<PayloadObject>> {
        let request = self.factory.set(&self.peer, objects)?;
        self.session.request(request).await
    }

    /// Fire-and-forget NOTIFY.
    pub async fn notify(&self, objects: Vec<PayloadObject>) -> Result<()> {
        let message = self.factory.notify(&self.peer, objects)?;
        self.session.send(message).await
    }

    /// Send one heartbeat.
    pub async fn heartbeat(&self) -> Result<()> {
        self.notify(vec![PayloadObject::from_value(
            ObjectType::HeartBeat,
            json!({}),
        )])
        .await
    }

    /// Send heartbeats every `interval` until the session closes or
    /// `shutdown` is cancelled.
    pub fn spawn_heartbeat(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = client.session.wait_closed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = client.heartbeat().await {
                            warn!(error = %e, "heartbeat failed");
                            break;
                        }
                    }
                }
            }
            debug!(session_id = client.session.id(), "heartbeat stopped");
        })
    }

    /// Close the link.
    pub fn close(&self) {
        self.session.close("closed by client");
    }
}
