//! # crossline-transport
//!
//! Framed session layer for the Crossline link:
//!
//! - **Codec**: 4-byte length-prefixed frames with a pluggable [`Serializer`]
//! - **Session**: serialized writes, request/response correlation with
//!   per-call timeouts, in-order inbound dispatch
//! - **Registry**: `(operation, object type)` request routing and push
//!   listeners
//! - **Listener / Client**: TCP accept loop and outbound connector
//! - **Shutdown**: cancellation and task draining

#![deny(unsafe_code)]

pub mod client;
pub mod codec;
pub mod connections;
pub mod listener;
pub mod pending;
pub mod registry;
pub mod session;
pub mod shutdown;

pub use client::Client;
pub use codec::{CodecError, InboundFrame, JsonSerializer, MessageCodec, Serializer};
pub use connections::ConnectionTable;
pub use listener::{Listener, SessionObserver};
pub use pending::PendingCalls;
pub use registry::{HandlerRegistry, PushListener, RequestHandler};
pub use session::{Session, SessionConfig, SessionStats};
pub use shutdown::ShutdownCoordinator;
