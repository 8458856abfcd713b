//! portrpc Transport Layer
//!
//! This module defines the transport contract that servers and clients are
//! written against, and ships three implementations of it.
//!
//! # Architecture
//!
//! A transport has three roles:
//! - **[`Connector`]**: client side, opens a logical connection to an address
//! - **[`Listener`]**: server side, accepts logical connections until closed
//! - **Conn** ([`ClientConn`] / [`ServerConn`]): carries exactly one
//!   request/response exchange, then is released
//!
//! A client conn's `send` is one blocking round trip: write the request,
//! wait for the response. No call is multiplexed over another call's conn.
//!
//! # Components
//!
//! - **[`WireCodec`]**: binary envelope for byte-stream transports
//! - **[`HttpConnector`]** / **[`HttpListener`]**: HTTP/1.1 via hyper
//! - **[`Cluster`]** / **[`Peer`]**: in-process transport
//! - **[`TcpConnector`]** / **[`TcpListener`]**: raw TCP with the binary envelope
//!
//! # Cancellation
//!
//! Every blocking step takes a [`CancellationToken`] and returns
//! [`RpcError::Cancelled`](crate::RpcError::Cancelled) promptly once it fires.

pub mod codec;
pub mod http;
pub mod http_listener;
pub mod inmem;
pub mod tcp;
pub mod tcp_server;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::protocol::error::Result;
use crate::protocol::{Request, Response};

pub use codec::{RequestHeader, ResponseHeader, WireCodec};
pub use http::{HttpConnector, DEFAULT_PATH};
pub use http_listener::HttpListener;
pub use inmem::{Cluster, InmemListener, Peer};
pub use tcp::TcpConnector;
pub use tcp_server::TcpListener;

/// Opens client-side conns.
pub trait Connector: Send + Sync {
    /// Opens a conn to `addr`. Never returns a half-open conn.
    fn connect<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        addr: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn ClientConn>>>;
}

/// Client side of one request/response exchange.
pub trait ClientConn: Send {
    /// Sends `request` and waits for the matching response.
    ///
    /// The response body may still be attached to the conn, so the caller
    /// closes the conn only after consuming it.
    fn send<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        request: Request,
    ) -> BoxFuture<'a, Result<Response>>;

    /// Releases the conn. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Source of server-side conns.
pub trait Listener: Send + Sync {
    /// Waits for the next conn.
    ///
    /// Once [`close`](Listener::close) has been called, every pending and
    /// future call returns [`RpcError::ListenerClosed`](crate::RpcError::ListenerClosed).
    fn accept(&self) -> BoxFuture<'_, Result<Box<dyn ServerConn>>>;

    /// Stops accepting. Idempotent and callable from any task.
    fn close(&self) -> Result<()>;
}

/// Server side of one request/response exchange.
pub trait ServerConn: Send {
    /// Hands out the incoming request.
    ///
    /// Message-oriented transports return the request they already parsed;
    /// byte-stream transports read the envelope here. Yields the request
    /// at most once.
    fn take_request(&mut self) -> BoxFuture<'_, Result<Request>>;

    /// Address of the remote side, for diagnostics.
    fn peer_addr(&self) -> String;

    /// Delivers the response. May succeed at most once per conn.
    fn send<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        response: Response,
    ) -> BoxFuture<'a, Result<()>>;

    /// Releases the conn. Idempotent, and implied by drop.
    fn close(&mut self) -> Result<()>;
}
