//! portrpc Client
//!
//! Calls remote operations through any [`Connector`](portrpc_common::transport::Connector).
//!
//! Every call opens its own conn, sends one request, decodes one response
//! and closes the conn. Failures come back as a [`CallError`] whose variant
//! tells connection, send, transport, service and decode failures apart.

pub mod client;

pub use client::{CallError, Client};
