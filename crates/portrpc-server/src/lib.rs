//! portrpc Server
//!
//! This crate hosts services behind any portrpc transport.
//!
//! A service is a plain struct implementing [`Service`], which lists the
//! operations reachable over RPC. The [`Server`] routes each incoming
//! `"Service.Method"` request to the matching operation, decodes its
//! argument with the server's payload codec and replies with the encoded
//! result or a status code describing the failure.

pub mod registry;
pub mod server;

pub use registry::{Method, MethodSet, Service, ServiceEntry};
pub use server::{Server, ServerState};

pub use portrpc_common;
