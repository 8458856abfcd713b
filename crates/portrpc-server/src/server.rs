//! portrpc Server
//!
//! The server owns a registry of services, pulls conns from a
//! [`Listener`] and dispatches each one on its own task.
//!
//! # Lifecycle
//!
//! ```text
//! Created --start--> Running --(listener closed / close)--> Closed
//! ```
//!
//! Services are registered while `Created`. `start` freezes the registry,
//! so lookups during dispatch take no lock.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use portrpc_common::payload::JsonCodec;
//! use portrpc_common::transport::HttpListener;
//! use portrpc_server::Server;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> portrpc_common::Result<()> {
//! let server = Arc::new(Server::new(JsonCodec));
//! // server.register(Calculator)?;
//! let listener = HttpListener::bind_default("127.0.0.1:8080").await?;
//! server.start(&CancellationToken::new(), Arc::new(listener)).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use portrpc_common::logger::{Logger, NoopLogger};
use portrpc_common::payload::Codec;
use portrpc_common::protocol::error::{Result, RpcError};
use portrpc_common::transport::{Listener, ServerConn};
use portrpc_common::{Body, Request, Response, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::registry::{service_type_name, InvokeError, Registry, Service, ServiceEntry};

/// Pause after a failed accept so a listener that keeps failing does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Lifecycle state of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Running,
    Closed,
}

/// RPC server generic over the payload codec.
pub struct Server<C: Codec> {
    codec: C,
    logger: Arc<dyn Logger>,
    state: Mutex<ServerState>,
    /// Registrations made before `start`.
    pending: Mutex<Registry>,
    /// Registry published by `start`; read without locking afterwards.
    frozen: OnceLock<Arc<Registry>>,
    listener: Mutex<Option<Arc<dyn Listener>>>,
    shutdown: CancellationToken,
}

impl<C: Codec> Server<C> {
    /// Creates a server that logs nowhere.
    pub fn new(codec: C) -> Self {
        Self::with_logger(codec, Arc::new(NoopLogger))
    }

    /// Creates a server logging to `logger`.
    pub fn with_logger(codec: C, logger: Arc<dyn Logger>) -> Self {
        Self {
            codec,
            logger,
            state: Mutex::new(ServerState::Created),
            pending: Mutex::new(HashMap::new()),
            frozen: OnceLock::new(),
            listener: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `service` under its type name: the last path segment with
    /// generic arguments stripped, so `app::Calculator` registers as
    /// `"Calculator"`.
    pub fn register<S: Service>(&self, service: S) -> Result<()> {
        self.register_with_name(service, service_type_name::<S>())
    }

    /// Registers `service` under `name`, replacing any service already
    /// registered under that name.
    ///
    /// # Errors
    ///
    /// Fails once the server has been started.
    pub fn register_with_name<S: Service>(&self, service: S, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(RpcError::Server("service name must not be empty".to_string()));
        }

        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ServerState::Created {
            return Err(RpcError::Server(format!(
                "cannot register service {} after the server was started",
                name
            )));
        }

        let entry = ServiceEntry::build(service, name.clone(), self.codec.clone());
        self.logger.debug(
            "service registered",
            &[("service", &name), ("methods", &entry.method_names().join(","))],
        );

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.insert(name.clone(), Arc::new(entry)).is_some() {
            self.logger.warn("service replaced", &[("service", &name)]);
        }
        Ok(())
    }

    /// Serves conns from `listener` until it closes.
    ///
    /// Each accepted conn is dispatched on its own task. Returns `Ok` when
    /// the listener reports [`RpcError::ListenerClosed`], after [`close`]
    /// or once `cancel` fires. Other accept errors are logged and
    /// accepting continues. The listener is always closed on return.
    ///
    /// # Errors
    ///
    /// [`RpcError::Cancelled`] if `cancel` has already fired, or
    /// [`RpcError::Server`] if the server was already started or closed.
    ///
    /// [`close`]: Server::close
    pub async fn start(self: &Arc<Self>, cancel: &CancellationToken, listener: Arc<dyn Listener>) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(RpcError::Cancelled);
        }

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                ServerState::Created => *state = ServerState::Running,
                ServerState::Running => return Err(RpcError::Server("server already started".to_string())),
                ServerState::Closed => return Err(RpcError::Server("server is closed".to_string())),
            }
            *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener.clone());

            let registry = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
            let _ = self.frozen.set(Arc::new(registry));
        }

        self.logger.info("server started", &[]);
        let result = self.accept_loop(cancel, listener.as_ref()).await;

        if let Err(err) = listener.close() {
            self.logger.warn("closing listener failed", &[("error", &err)]);
        }
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ServerState::Closed;
        self.logger.info("server stopped", &[]);
        result
    }

    async fn accept_loop(self: &Arc<Self>, cancel: &CancellationToken, listener: &dyn Listener) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };

            let conn = match accepted {
                Ok(conn) => conn,
                Err(RpcError::ListenerClosed) => return Ok(()),
                Err(err) => {
                    self.logger.error("accept failed", &[("error", &err)]);
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                    }
                }
            };

            let server = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let peer = conn.peer_addr();
                if let Err(err) = server.handle_conn(&cancel, conn).await {
                    server.logger.error("handling conn failed", &[("peer", &peer), ("error", &err)]);
                }
            });
        }
    }

    /// Stops the server: closes its listener, which unblocks a pending
    /// [`start`](Server::start). Idempotent.
    pub fn close(&self) -> Result<()> {
        self.shutdown.cancel();

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == ServerState::Created {
            *state = ServerState::Closed;
        }
        drop(state);

        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match listener {
            Some(listener) => listener.close(),
            None => Ok(()),
        }
    }

    /// Serves a single conn and closes it.
    ///
    /// Routing, decoding and service failures are answered with an error
    /// response. Only a failure to obtain the request or to deliver the
    /// response is returned.
    pub async fn handle_conn(&self, cancel: &CancellationToken, mut conn: Box<dyn ServerConn>) -> Result<()> {
        let result = self.serve_conn(cancel, conn.as_mut()).await;
        if let Err(err) = conn.close() {
            self.logger.debug("closing conn failed", &[("error", &err)]);
        }
        result
    }

    async fn serve_conn(&self, cancel: &CancellationToken, conn: &mut dyn ServerConn) -> Result<()> {
        let request = match conn.take_request().await {
            Ok(request) => request,
            Err(err) => {
                // Framing errors still get an answer when the conn allows it.
                let reply = Response::error(StatusCode::BadRequest, format!("can't read request: {}", err));
                let _ = conn.send(cancel, reply).await;
                return Err(err);
            }
        };

        let response = self.dispatch(cancel, request).await;
        conn.send(cancel, response).await
    }

    /// Routes one request to its operation and builds the response.
    async fn dispatch(&self, cancel: &CancellationToken, request: Request) -> Response {
        let Request {
            service_method,
            body,
            ..
        } = request;

        let Some((service_name, method_name)) = service_method.split() else {
            return reject(body, StatusCode::InvalidServiceMethod).await;
        };

        let registry = self.registry();
        let Some(service) = registry.get(service_name) else {
            return reject(body, StatusCode::ServiceNotFound).await;
        };
        let Some(method) = service.method(method_name) else {
            return reject(body, StatusCode::MethodNotFound).await;
        };

        let decoded = match method.decode(body).await {
            Ok(decoded) => decoded,
            Err(err) => {
                return Response::error(StatusCode::BadRequest, format!("can't decode: {}", err));
            }
        };

        let invoked = AssertUnwindSafe(method.invoke(cancel.clone(), decoded))
            .catch_unwind()
            .await;

        match invoked {
            Ok(Ok(body)) => Response::ok(body),
            Ok(Err(InvokeError::Service(err))) => {
                Response::error(StatusCode::ErrorFromService, format!("error from service: {}", err))
            }
            Ok(Err(InvokeError::Internal(err))) => Response::error(StatusCode::InternalError, err),
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                self.logger.error(
                    "operation panicked",
                    &[("service_method", &service_method), ("panic", &reason)],
                );
                Response::error(StatusCode::InternalError, format!("operation panicked: {}", reason))
            }
        }
    }

    fn registry(&self) -> Arc<Registry> {
        if let Some(frozen) = self.frozen.get() {
            return frozen.clone();
        }
        Arc::new(self.pending.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

/// Builds a routing failure response, discarding the unread request body.
async fn reject(body: Body, status: StatusCode) -> Response {
    let _ = body.discard().await;
    Response::error(status, format!("code: {}", status))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
