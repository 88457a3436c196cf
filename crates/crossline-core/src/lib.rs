//! # crossline-core
//!
//! Foundation types shared by every Crossline crate:
//!
//! - **Errors**: [`errors::CrosslineError`] taxonomy and the wire [`errors::ErrorBody`]
//! - **Branded IDs**: `CrossId`, `SystemId`, `SubscriberId`, `TaskId`
//! - **Object types**: the protocol object catalogue and its pushable subset
//! - **Messages**: immutable [`message::Message`] values built through
//!   [`message::MessageBuilder`] with process-wide sequence allocation
//! - **Logging**: subscriber setup, execution markers, capture utilities

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod message;
pub mod object_type;

pub use errors::{CrosslineError, ErrorBody, ErrorKind, FailedItem, Result};
pub use ids::{CrossId, SubscriberId, SystemId, TaskId};
pub use message::{
    Message, MessageBuilder, MessageFactory, MessageKind, Operation, PayloadObject, PeerRole,
};
pub use object_type::ObjectType;
