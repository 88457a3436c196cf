//! `CrosslineServer`: TCP listener wired to the control plane.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossline_control::{
    AuthValidator, Collaborators, ControlPlane, ControlPlaneConfig, PlanLookup, SignalController,
    TrafficDataSource,
};
use crossline_core::SystemId;
use crossline_settings::CrosslineSettings;
use crossline_transport::{
    ConnectionTable, HandlerRegistry, Listener, SessionConfig, ShutdownCoordinator,
};
use tokio::task::JoinHandle;
use tracing::info;

use crate::adapters::{
    InMemoryPlans, InMemoryTrafficStore, LoggingSignalController, SessionPushSink,
    SubscriptionCleanup, TokenAuth,
};
use crate::handlers::{HandlerContext, register_handlers};

/// Plans every cross accepts when no plan store is wired in.
const DEFAULT_PLAN_COUNT: i32 = 16;

/// External systems the server delegates to.
#[derive(Clone)]
pub struct Backends {
    /// Timing plan lookup.
    pub plans: Arc<dyn PlanLookup>,
    /// Historical data for retransmission.
    pub data: Arc<dyn TrafficDataSource>,
    /// Token validation.
    pub auth: Arc<dyn AuthValidator>,
    /// Signal controller gateway.
    pub signals: Arc<dyn SignalController>,
}

impl Backends {
    /// In-memory backends; tokens come from the `auth` settings section.
    pub fn in_memory(settings: &CrosslineSettings) -> Self {
        Self {
            plans: Arc::new(InMemoryPlans::new(DEFAULT_PLAN_COUNT)),
            data: Arc::new(InMemoryTrafficStore::new()),
            auth: Arc::new(TokenAuth::new(&settings.auth.tokens)),
            signals: Arc::new(LoggingSignalController::default()),
        }
    }
}

/// Session tunables taken from settings.
pub fn session_config(settings: &CrosslineSettings) -> SessionConfig {
    SessionConfig {
        request_timeout: Duration::from_millis(settings.session.request_timeout_ms),
        write_timeout: Duration::from_millis(settings.server.write_timeout_ms),
        max_frame_bytes: settings.server.max_frame_bytes,
        ..SessionConfig::default()
    }
}

/// The lower-peer server.
pub struct CrosslineServer {
    settings: CrosslineSettings,
    plane: ControlPlane,
    connections: Arc<ConnectionTable>,
    registry: Arc<HandlerRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl CrosslineServer {
    /// Server over in-memory backends.
    pub fn new(settings: CrosslineSettings) -> Self {
        let backends = Backends::in_memory(&settings);
        Self::with_backends(settings, backends)
    }

    /// Server over the given backends.
    pub fn with_backends(settings: CrosslineSettings, backends: Backends) -> Self {
        let connections = Arc::new(ConnectionTable::new());
        let plane = ControlPlane::new(
            &ControlPlaneConfig::from(&settings),
            Collaborators {
                plans: backends.plans,
                data: backends.data,
                auth: backends.auth,
                signals: backends.signals,
                sink: Arc::new(SessionPushSink(Arc::clone(&connections))),
            },
        );
        let ctx = Arc::new(HandlerContext {
            plane: plane.clone(),
            connections: Arc::clone(&connections),
            local: SystemId::from(settings.identity.system_id.as_str()),
            history_limit: settings.control.history_limit,
            started_at: Instant::now(),
        });
        let mut registry = HandlerRegistry::new();
        register_handlers(&mut registry, &ctx);

        Self {
            settings,
            plane,
            connections,
            registry: Arc::new(registry),
            shutdown: Arc::new(ShutdownCoordinator::new()),
        }
    }

    /// Bind the listener and start accepting peers.
    ///
    /// Also starts the retransmission cleanup sweeper. Both stop when the
    /// shutdown coordinator fires; the returned handle completes once the
    /// listener has closed every session.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.settings.server.host, self.settings.server.port);
        let listener = Listener::bind(
            &addr,
            session_config(&self.settings),
            Arc::clone(&self.registry),
            Arc::clone(&self.connections),
            self.settings.server.max_connections,
        )
        .await?
        .with_observer(Arc::new(SubscriptionCleanup::new(
            Arc::clone(&self.plane.subscriptions),
            Arc::clone(&self.connections),
        )));
        let bound = listener.local_addr()?;

        let retrans = &self.settings.retrans;
        self.shutdown.track(self.plane.retrans.spawn_cleanup_sweeper(
            Duration::from_secs(retrans.cleanup_interval_secs),
            retrans.keep_days,
            self.shutdown.token(),
        ));

        let handle = tokio::spawn(listener.run(self.shutdown.token()));
        info!(
            %bound,
            system_id = %self.settings.identity.system_id,
            routes = self.registry.routes().len(),
            "crossline server started"
        );
        Ok((bound, handle))
    }

    /// Control-plane components.
    pub fn plane(&self) -> &ControlPlane {
        &self.plane
    }

    /// Live sessions.
    pub fn connections(&self) -> &Arc<ConnectionTable> {
        &self.connections
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Route table.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Effective settings.
    pub fn settings(&self) -> &CrosslineSettings {
        &self.settings
    }
}
