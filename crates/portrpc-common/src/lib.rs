//! portrpc Common Types and Transports
//!
//! This crate provides the protocol definitions, payload codecs and
//! transports shared by the portrpc server and client.
//!
//! # Overview
//!
//! portrpc is a transport-agnostic RPC runtime. A caller names a
//! `"Service.Method"`, sends a payload encoded with a pluggable codec and
//! receives either a payload or an error. Neither side is tied to a wire:
//! servers pull conns from a [`transport::Listener`], clients open them
//! through a [`transport::Connector`].
//!
//! - **Protocol Layer**: [`Request`], [`Response`], [`StatusCode`], [`Metadata`], [`Version`]
//! - **Payload Layer**: the [`payload::Codec`] contract with JSON and postcard adapters
//! - **Transport Layer**: binary envelope, HTTP, in-memory and TCP transports
//! - **Logging**: the [`logger::Logger`] sink used by the server
//!
//! # Example
//!
//! ```
//! use portrpc_common::{Body, Request, Response, StatusCode};
//!
//! let request = Request::new("Calculator.Add", Body::from(r#"{"A":10,"B":15}"#));
//! assert_eq!(request.service_method.split(), Some(("Calculator", "Add")));
//!
//! let response = Response::error(StatusCode::MethodNotFound, "code: StatusMethodNotFound");
//! assert!(!response.status.is_ok());
//! ```

pub mod logger;
pub mod payload;
pub mod protocol;
pub mod transport;

pub use protocol::*;
