//! HTTP Listener
//!
//! hyper drives one handler activation per inbound request and expects the
//! activation to produce the response. The server, on the other hand, pulls
//! conns from [`Listener::accept`] and replies later from its own worker
//! task. This module bridges the two:
//!
//! 1. the handler parses the envelope headers and wraps the request body
//! 2. it creates an [`HttpServerConn`] holding a one-shot reply slot
//! 3. it hands the conn to `accept` through a channel, racing shutdown
//! 4. it waits on the reply slot, racing shutdown
//! 5. it returns the reply to hyper, which streams the body out
//!
//! Closing the listener stops the accept loop, asks every open HTTP
//! connection to shut down gracefully and releases handlers parked in
//! steps 3 and 4 with `503 Service Unavailable`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Method;
use hyper_util::rt::TokioIo;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use super::http::{
    decode_request_headers, encode_metadata_header, from_incoming, full_body, into_http_body,
    normalize_path, HttpBody, DEFAULT_PATH, ERROR_HEADER, METADATA_HEADER, STATUS_HEADER,
};
use super::{Listener, ServerConn};
use crate::protocol::error::{Result, RpcError};
use crate::protocol::{Request, Response};

type HyperResponse = hyper::Response<HttpBody>;

/// Pause after a failed TCP accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Server side of the HTTP transport.
pub struct HttpListener {
    local_addr: SocketAddr,
    conns: Mutex<mpsc::Receiver<HttpServerConn>>,
    shutdown: CancellationToken,
    last_error: Arc<RwLock<Option<String>>>,
}

impl HttpListener {
    /// Binds to `addr` and starts serving calls sent with `method` to `path`.
    ///
    /// # Arguments
    ///
    /// * `addr` - The address to bind to (e.g., "127.0.0.1:0")
    /// * `path` - Request path carrying RPC calls
    /// * `method` - HTTP method carrying RPC calls
    ///
    /// # Returns
    ///
    /// A running listener, or a connection error if binding fails
    pub async fn bind(addr: &str, path: impl Into<String>, method: Method) -> Result<Self> {
        let tcp = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to bind to {}: {}", addr, e)))?;
        let local_addr = tcp.local_addr()?;

        let (tx, rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let last_error = Arc::new(RwLock::new(None));

        let route = Arc::new(Route {
            path: normalize_path(path.into()),
            method,
            conns: tx,
            shutdown: shutdown.clone(),
        });

        tracing::info!("HTTP listener on {} serving {} {}", local_addr, route.method, route.path);
        tokio::spawn(serve(tcp, route, shutdown.clone(), last_error.clone()));

        Ok(Self {
            local_addr,
            conns: Mutex::new(rx),
            shutdown,
            last_error,
        })
    }

    /// Binds with [`DEFAULT_PATH`] and `POST`.
    pub async fn bind_default(addr: &str) -> Result<Self> {
        Self::bind(addr, DEFAULT_PATH, Method::POST).await
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Most recent transport-level failure seen by the accept loop.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Listener for HttpListener {
    fn accept(&self) -> BoxFuture<'_, Result<Box<dyn ServerConn>>> {
        Box::pin(async move {
            if self.shutdown.is_cancelled() {
                return Err(RpcError::ListenerClosed);
            }

            let mut conns = tokio::select! {
                guard = self.conns.lock() => guard,
                _ = self.shutdown.cancelled() => return Err(RpcError::ListenerClosed),
            };

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Err(RpcError::ListenerClosed),
                conn = conns.recv() => conn
                    .map(|c| Box::new(c) as Box<dyn ServerConn>)
                    .ok_or(RpcError::ListenerClosed),
            }
        })
    }

    fn close(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();
        tracing::info!("HTTP listener on {} closed", self.local_addr);
        Ok(())
    }
}

impl Drop for HttpListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Accepts TCP connections and serves HTTP/1.1 on each until shutdown.
async fn serve(
    tcp: tokio::net::TcpListener,
    route: Arc<Route>,
    shutdown: CancellationToken,
    last_error: Arc<RwLock<Option<String>>>,
) {
    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = tcp.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!("HTTP accept failed: {}", e);
                    *last_error.write().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let route = route.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let route = route.clone();
                async move { Ok::<_, Infallible>(route.handle(remote, req).await) }
            });

            let conn = http1::Builder::new().serve_connection(io, service);
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = shutdown.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };
            if let Err(err) = result {
                tracing::debug!("Error serving connection from {}: {}", remote, err);
            }
        });
    }
    tracing::debug!("HTTP accept loop stopped");
}

/// Per-listener routing and handoff state shared by all handler activations.
struct Route {
    path: String,
    method: Method,
    conns: mpsc::Sender<HttpServerConn>,
    shutdown: CancellationToken,
}

impl Route {
    async fn handle(&self, remote: SocketAddr, req: hyper::Request<Incoming>) -> HyperResponse {
        if req.uri().path() != self.path {
            return plain(hyper::StatusCode::NOT_FOUND, "404 page not found");
        }
        if req.method() != self.method {
            return plain(hyper::StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }

        let (parts, incoming) = req.into_parts();
        let (service_method, metadata) = match decode_request_headers(&parts.headers) {
            Ok(decoded) => decoded,
            Err(e) => return plain(hyper::StatusCode::BAD_REQUEST, e.to_string()),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let conn = HttpServerConn {
            remote,
            request: Some(Request {
                service_method,
                metadata,
                body: from_incoming(incoming),
            }),
            reply: Some(reply_tx),
        };

        tokio::select! {
            sent = self.conns.send(conn) => {
                if sent.is_err() {
                    return closed();
                }
            }
            _ = self.shutdown.cancelled() => return closed(),
        }

        tokio::select! {
            reply = reply_rx => match reply {
                Ok(response) => response,
                Err(_) => plain(
                    hyper::StatusCode::INTERNAL_SERVER_ERROR,
                    "connection closed without a response",
                ),
            },
            _ = self.shutdown.cancelled() => closed(),
        }
    }
}

fn plain(status: hyper::StatusCode, text: impl Into<String>) -> HyperResponse {
    let mut response = hyper::Response::new(full_body(text.into()));
    *response.status_mut() = status;
    response
}

fn closed() -> HyperResponse {
    plain(hyper::StatusCode::SERVICE_UNAVAILABLE, "listener is closed")
}

/// Server side of one HTTP exchange.
///
/// Replying fills the handler activation's one-shot slot; the handler then
/// returns and hyper streams the body to the caller.
pub struct HttpServerConn {
    remote: SocketAddr,
    request: Option<Request>,
    reply: Option<oneshot::Sender<HyperResponse>>,
}

impl HttpServerConn {
    fn build_response(response: Response) -> Result<HyperResponse> {
        let mut builder = hyper::Response::builder()
            .status(hyper::StatusCode::OK)
            .header(STATUS_HEADER, response.status.as_u16().to_string());
        if !response.metadata.is_empty() {
            builder = builder.header(METADATA_HEADER, encode_metadata_header(&response.metadata)?);
        }

        let body = if response.status.is_ok() && response.error.is_none() {
            into_http_body(response.body)
        } else {
            builder = builder.header(ERROR_HEADER, "true");
            full_body(response.error.unwrap_or_default())
        };
        Ok(builder.body(body)?)
    }
}

impl ServerConn for HttpServerConn {
    fn take_request(&mut self) -> BoxFuture<'_, Result<Request>> {
        let request = self.request.take();
        Box::pin(async move {
            request.ok_or_else(|| RpcError::Protocol("request already taken".to_string()))
        })
    }

    fn peer_addr(&self) -> String {
        self.remote.to_string()
    }

    fn send<'a>(
        &'a mut self,
        _cancel: &'a CancellationToken,
        response: Response,
    ) -> BoxFuture<'a, Result<()>> {
        let reply = self.reply.take();
        Box::pin(async move {
            let reply = reply.ok_or_else(|| RpcError::Protocol("response already sent".to_string()))?;
            let http_response = Self::build_response(response)?;
            reply
                .send(http_response)
                .map_err(|_| RpcError::Connection("HTTP handler is gone".to_string()))
        })
    }

    fn close(&mut self) -> Result<()> {
        self.request = None;
        self.reply = None;
        Ok(())
    }
}
