//! One framed connection to a peer.
//!
//! A [`Session`] owns both halves of a byte stream:
//!
//! - the write half sits behind an async mutex so frames from concurrent
//!   senders are never interleaved
//! - the read half is drained by a single task that processes frames in
//!   arrival order: RESPONSE completes a pending call, REQUEST goes through
//!   the [`HandlerRegistry`] (and is answered unless it is a NOTIFY), PUSH is
//!   handed to the registry's listeners
//!
//! Closing is idempotent. The first close fails every pending call with
//! `ConnectionClosed`; the reader task then shuts the write half down.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossline_core::{
    CrosslineError, Message, MessageBuilder, MessageKind, Operation, PayloadObject, Result,
    SubscriberId,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{InboundFrame, JsonSerializer, MessageCodec, Serializer};
use crate::pending::PendingCalls;
use crate::registry::HandlerRegistry;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Per-session tunables.
#[derive(Clone)]
pub struct SessionConfig {
    /// Default timeout for [`Session::request`].
    pub request_timeout: Duration,
    /// Upper bound on writing one frame.
    pub write_timeout: Duration,
    /// Largest accepted frame payload.
    pub max_frame_bytes: usize,
    /// Payload serializer.
    pub serializer: Arc<dyn Serializer>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            max_frame_bytes: 4 * 1024 * 1024,
            serializer: Arc::new(JsonSerializer),
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("request_timeout", &self.request_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .finish_non_exhaustive()
    }
}

/// Frame counters for one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Well-formed frames received.
    pub frames_in: u64,
    /// Frames written.
    pub frames_out: u64,
    /// Frames dropped because the payload did not decode.
    pub malformed: u64,
}

/// A live connection.
pub struct Session {
    id: String,
    remote: String,
    config: SessionConfig,
    registry: Arc<HandlerRegistry>,
    pending: PendingCalls,
    writer: tokio::sync::Mutex<FramedWrite<BoxedWriter, MessageCodec>>,
    peer: Mutex<Option<SubscriberId>>,
    closed: CancellationToken,
    close_reason: Mutex<Option<String>>,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    malformed: AtomicU64,
}

impl Session {
    /// Wrap a byte stream and start its reader task.
    ///
    /// The returned handle resolves once the session has closed and the
    /// write half has been shut down.
    pub fn spawn<S>(
        stream: S,
        remote: impl Into<String>,
        config: SessionConfig,
        registry: Arc<HandlerRegistry>,
    ) -> (Arc<Self>, JoinHandle<()>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(
            Box::new(read_half) as BoxedReader,
            MessageCodec::new(Arc::clone(&config.serializer), config.max_frame_bytes),
        );
        let writer = FramedWrite::new(
            Box::new(write_half) as BoxedWriter,
            MessageCodec::new(Arc::clone(&config.serializer), config.max_frame_bytes),
        );

        let now = Instant::now();
        let session = Arc::new(Self {
            id: Uuid::now_v7().to_string(),
            remote: remote.into(),
            config,
            registry,
            pending: PendingCalls::new(),
            writer: tokio::sync::Mutex::new(writer),
            peer: Mutex::new(None),
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
            connected_at: now,
            last_activity: Mutex::new(now),
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        });
        debug!(session_id = %session.id, remote = %session.remote, "session opened");

        let handle = tokio::spawn(Arc::clone(&session).read_loop(reader));
        (session, handle)
    }

    /// Two sessions joined by an in-memory pipe.
    pub fn in_memory_pair(
        config: SessionConfig,
        left: Arc<HandlerRegistry>,
        right: Arc<HandlerRegistry>,
    ) -> (Arc<Self>, Arc<Self>) {
        let (a, b) = tokio::io::duplex(config.max_frame_bytes.max(64 * 1024));
        let (left, _) = Self::spawn(a, "memory:left", config.clone(), left);
        let (right, _) = Self::spawn(b, "memory:right", config, right);
        (left, right)
    }

    // ── Identity ────────────────────────────────────────────────────

    /// Connection id (UUID v7).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remote address label.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Identity bound by a successful login.
    pub fn peer(&self) -> Option<SubscriberId> {
        self.peer.lock().clone()
    }

    /// Bind the logged-in identity.
    pub fn bind_peer(&self, peer: SubscriberId) {
        *self.peer.lock() = Some(peer);
    }

    /// Clear the bound identity, returning it.
    pub fn unbind_peer(&self) -> Option<SubscriberId> {
        self.peer.lock().take()
    }

    // ── Sending ─────────────────────────────────────────────────────

    /// Write one message.
    ///
    /// A write failure or write timeout closes the session.
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let sequence = message.sequence();
        let mut writer = self.writer.lock().await;
        let outcome = tokio::time::timeout(self.config.write_timeout, writer.send(message)).await;
        drop(writer);

        let reason = match outcome {
            Ok(Ok(())) => {
                let _ = self.frames_out.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Ok(Err(e)) => format!("write failed: {e}"),
            Err(_) => format!("write timed out after {:?}", self.config.write_timeout),
        };
        warn!(session_id = %self.id, sequence, %reason, "closing session after write failure");
        self.close(&reason);
        Err(CrosslineError::connection_closed(reason))
    }

    /// Send a REQUEST and wait for its RESPONSE.
    ///
    /// Returns the RESPONSE as received, including an error body if the peer
    /// rejected the request. Fails with `Timeout` when nothing arrives within
    /// `timeout` (a later response is discarded) and with `ConnectionClosed`
    /// when the session closes first.
    pub async fn send_request(&self, request: Message, timeout: Duration) -> Result<Message> {
        if request.kind() != MessageKind::Request {
            return Err(CrosslineError::validation(format!(
                "only REQUEST messages can await a response, got {:?}",
                request.kind()
            )));
        }
        if request.operation() == Operation::Notify {
            return Err(CrosslineError::validation(
                "NOTIFY requests are not answered; use send",
            ));
        }

        let sequence = request.sequence();
        let rx = self.pending.register(sequence, timeout)?;
        let _guard = self.pending.guard(sequence);
        self.send(request).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_dropped)) => Err(self.closed_error()),
            Err(_elapsed) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(session_id = %self.id, sequence, timeout_ms, "request timed out");
                Err(CrosslineError::Timeout {
                    sequence,
                    timeout_ms,
                })
            }
        }
    }

    /// Send a REQUEST with the default timeout and unwrap the response.
    pub async fn request(&self, request: Message) -> Result<Vec<PayloadObject>> {
        self.send_request(request, self.config.request_timeout)
            .await?
            .into_result()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Close the session. Only the first call has any effect.
    pub fn close(&self, reason: &str) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.to_owned());
        }
        self.closed.cancel();
        let failed = self
            .pending
            .fail_all(&CrosslineError::connection_closed(reason));
        info!(
            session_id = %self.id,
            remote = %self.remote,
            peer = ?self.peer(),
            reason,
            failed_pending = failed,
            "session closed"
        );
    }

    /// Whether the session has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session has closed.
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }

    /// Why the session closed, if it has.
    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    // ── Diagnostics ─────────────────────────────────────────────────

    /// Outstanding requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Session age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Frame counters.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────

    async fn read_loop(self: Arc<Self>, mut reader: FramedRead<BoxedReader, MessageCodec>) {
        let reason = loop {
            tokio::select! {
                () = self.closed.cancelled() => break None,
                frame = reader.next() => match frame {
                    // A handler still running at close time is abandoned.
                    Some(Ok(frame)) => tokio::select! {
                        () = self.closed.cancelled() => break None,
                        () = self.handle_frame(frame) => {}
                    },
                    Some(Err(e)) => break Some(format!("read failed: {e}")),
                    None => break Some("peer closed the connection".to_owned()),
                },
            }
        };
        if let Some(reason) = reason {
            self.close(&reason);
        }

        let mut writer = self.writer.lock().await;
        if let Ok(Err(e)) = tokio::time::timeout(self.config.write_timeout, writer.close()).await {
            debug!(session_id = %self.id, error = %e, "write half shutdown failed");
        }
    }

    async fn handle_frame(self: &Arc<Self>, frame: InboundFrame) {
        let message = match frame {
            InboundFrame::Message(message) => message,
            InboundFrame::Malformed { len, reason } => {
                let _ = self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(session_id = %self.id, len, %reason, "dropping malformed frame");
                return;
            }
        };
        let _ = self.frames_in.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();

        match message.kind() {
            MessageKind::Response => {
                if let Err(late) = self.pending.complete(message) {
                    warn!(
                        session_id = %self.id,
                        sequence = late.sequence(),
                        "discarding response with no pending request"
                    );
                }
            }
            MessageKind::Request => self.handle_request(message).await,
            MessageKind::Push => {
                if self.registry.deliver_push(&message).await == 0 {
                    debug!(
                        session_id = %self.id,
                        object_type = ?message.object_type(),
                        "push had no listener"
                    );
                }
            }
        }
    }

    async fn handle_request(self: &Arc<Self>, request: Message) {
        let result = self.registry.dispatch(&request, self).await;

        if request.operation() == Operation::Notify {
            if let Err(e) = result {
                warn!(
                    session_id = %self.id,
                    sequence = request.sequence(),
                    error = %e,
                    "notify handler failed"
                );
            }
            return;
        }

        let builder = match result {
            Ok(objects) => MessageBuilder::response_to(&request).objects(objects),
            Err(e) => {
                debug!(
                    session_id = %self.id,
                    sequence = request.sequence(),
                    code = e.code(),
                    error = %e,
                    "request rejected"
                );
                MessageBuilder::response_to(&request).error(e.to_error_body())
            }
        };
        let response = match builder.build() {
            Ok(response) => response,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "failed to build response");
                return;
            }
        };
        if let Err(e) = self.send(response).await {
            warn!(
                session_id = %self.id,
                sequence = request.sequence(),
                error = %e,
                "failed to send response"
            );
        }
    }

    fn closed_error(&self) -> CrosslineError {
        let reason = self
            .close_reason()
            .unwrap_or_else(|| "session closed".to_owned());
        CrosslineError::connection_closed(reason)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("peer", &self.peer())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
