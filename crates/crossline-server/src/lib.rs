//! # crossline-server
//!
//! Lower-peer server for the Crossline link: routes inbound requests to the
//! control plane, pushes its events back over the peer's session, and ships
//! in-memory collaborators for running without external systems.

#![deny(unsafe_code)]

pub mod adapters;
pub mod handlers;
pub mod server;

pub use server::{Backends, CrosslineServer, session_config};
