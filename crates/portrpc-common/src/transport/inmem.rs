//! In-process transport
//!
//! A [`Cluster`] is a private address space of [`Peer`]s. Every peer owns an
//! inbox; a client conn delivers itself into the target peer's inbox and
//! then waits on its own one-shot reply slot. No bytes are serialized
//! beyond the payload body, which makes this transport a deterministic
//! substrate for exercising servers and clients.
//!
//! # Example
//!
//! ```no_run
//! use portrpc_common::transport::{Cluster, Connector};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> portrpc_common::Result<()> {
//! let cluster = Cluster::new();
//! let server_peer = cluster.new_peer();
//! let client_peer = cluster.new_peer();
//!
//! let listener = server_peer.listen();
//! let conn = client_peer.connect(&CancellationToken::new(), server_peer.addr()).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use super::{ClientConn, Connector, Listener, ServerConn};
use crate::protocol::error::{Result, RpcError};
use crate::protocol::{Request, Response};

type Inbox = mpsc::Sender<InmemServerConn>;

#[derive(Default)]
struct Directory {
    peers: HashMap<String, Inbox>,
    last_id: u64,
}

/// Shared directory of peers.
///
/// Cloning a `Cluster` yields another handle to the same directory.
#[derive(Clone, Default)]
pub struct Cluster {
    directory: Arc<RwLock<Directory>>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a peer with the next free numeric address (`"1"`, `"2"`, ...).
    pub fn new_peer(&self) -> Peer {
        // The slot only parks a call; the caller stays blocked until an
        // `accept` acknowledges it, so the handoff is a rendezvous.
        let (tx, rx) = mpsc::channel(1);

        let mut dir = self.directory.write().unwrap_or_else(PoisonError::into_inner);
        dir.last_id += 1;
        let addr = dir.last_id.to_string();
        dir.peers.insert(addr.clone(), tx);
        drop(dir);

        tracing::debug!("inmem peer {} joined", addr);

        Peer {
            cluster: self.clone(),
            addr,
            inbox: Arc::new(Mutex::new(rx)),
        }
    }

    /// Removes a peer from the directory. Later connects to `addr` fail with
    /// [`RpcError::PeerNotFound`] and its listeners report closed once drained.
    pub fn remove_peer(&self, addr: &str) -> bool {
        let mut dir = self.directory.write().unwrap_or_else(PoisonError::into_inner);
        dir.peers.remove(addr).is_some()
    }

    pub fn len(&self) -> usize {
        let dir = self.directory.read().unwrap_or_else(PoisonError::into_inner);
        dir.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, addr: &str) -> Option<Inbox> {
        let dir = self.directory.read().unwrap_or_else(PoisonError::into_inner);
        dir.peers.get(addr).cloned()
    }
}

/// A member of a [`Cluster`]. Acts as a [`Connector`] and can listen for
/// inbound calls.
pub struct Peer {
    cluster: Cluster,
    addr: String,
    inbox: Arc<Mutex<mpsc::Receiver<InmemServerConn>>>,
}

impl Peer {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Starts listening on this peer's inbox.
    pub fn listen(&self) -> InmemListener {
        InmemListener {
            addr: self.addr.clone(),
            inbox: self.inbox.clone(),
            shutdown: CancellationToken::new(),
        }
    }
}

impl Connector for Peer {
    fn connect<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        addr: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn ClientConn>>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(RpcError::Cancelled);
            }

            let target = self
                .cluster
                .lookup(addr)
                .ok_or_else(|| RpcError::PeerNotFound(addr.to_string()))?;

            Ok(Box::new(InmemClientConn {
                from: self.addr.clone(),
                to: addr.to_string(),
                target,
                closed: false,
            }) as Box<dyn ClientConn>)
        })
    }
}

/// Accepts conns delivered to a peer's inbox.
pub struct InmemListener {
    addr: String,
    inbox: Arc<Mutex<mpsc::Receiver<InmemServerConn>>>,
    shutdown: CancellationToken,
}

impl InmemListener {
    /// Address of the owning peer.
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Listener for InmemListener {
    fn accept(&self) -> BoxFuture<'_, Result<Box<dyn ServerConn>>> {
        Box::pin(async move {
            if self.shutdown.is_cancelled() {
                // Covers a `close` that found the inbox locked.
                if let Ok(mut inbox) = self.inbox.try_lock() {
                    drain(&mut inbox);
                }
                return Err(RpcError::ListenerClosed);
            }

            let mut inbox = tokio::select! {
                guard = self.inbox.lock() => guard,
                _ = self.shutdown.cancelled() => return Err(RpcError::ListenerClosed),
            };

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    // `close` cannot drain while this accept holds the inbox.
                    drain(&mut inbox);
                    Err(RpcError::ListenerClosed)
                }
                conn = inbox.recv() => match conn {
                    Some(mut conn) => {
                        if let Some(accepted) = conn.accepted.take() {
                            let _ = accepted.send(());
                        }
                        Ok(Box::new(conn) as Box<dyn ServerConn>)
                    }
                    None => Err(RpcError::ListenerClosed),
                },
            }
        })
    }

    fn close(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();

        // Calls already queued but never accepted learn about it right away.
        if let Ok(mut inbox) = self.inbox.try_lock() {
            drain(&mut inbox);
        }

        tracing::debug!("inmem listener {} closed", self.addr);
        Ok(())
    }
}

/// Drops every parked call; their callers see the acknowledgement fail.
fn drain(inbox: &mut mpsc::Receiver<InmemServerConn>) {
    while let Ok(conn) = inbox.try_recv() {
        drop(conn);
    }
}

struct InmemClientConn {
    from: String,
    to: String,
    target: Inbox,
    closed: bool,
}

impl ClientConn for InmemClientConn {
    fn send<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        request: Request,
    ) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            if self.closed {
                return Err(RpcError::Connection("conn is closed".to_string()));
            }

            // Fires when this call returns, whatever the outcome, so the
            // server side never waits on a caller that is gone.
            let call = cancel.child_token();
            let _guard = call.clone().drop_guard();

            let (accepted_tx, accepted_rx) = oneshot::channel();
            let (reply_tx, reply_rx) = oneshot::channel();
            let conn = InmemServerConn {
                from: self.from.clone(),
                request: Some(request),
                accepted: Some(accepted_tx),
                reply: Some(reply_tx),
                call: call.clone(),
            };

            tokio::select! {
                sent = self.target.send(conn) => {
                    sent.map_err(|_| RpcError::Connection(format!("peer {} is gone", self.to)))?;
                }
                _ = call.cancelled() => return Err(RpcError::Cancelled),
            }

            tokio::select! {
                accepted = accepted_rx => {
                    accepted.map_err(|_| {
                        RpcError::Connection(format!("peer {} closed before accepting the call", self.to))
                    })?;
                }
                _ = call.cancelled() => return Err(RpcError::Cancelled),
            }

            tokio::select! {
                reply = reply_rx => reply.map_err(|_| {
                    RpcError::Connection(format!("peer {} dropped the call without replying", self.to))
                }),
                _ = call.cancelled() => Err(RpcError::Cancelled),
            }
        })
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Server side of an in-memory call; replying delivers into the caller's
/// one-shot slot.
pub struct InmemServerConn {
    from: String,
    request: Option<Request>,
    accepted: Option<oneshot::Sender<()>>,
    reply: Option<oneshot::Sender<Response>>,
    call: CancellationToken,
}

impl ServerConn for InmemServerConn {
    fn take_request(&mut self) -> BoxFuture<'_, Result<Request>> {
        let request = self.request.take();
        Box::pin(async move {
            request.ok_or_else(|| RpcError::Protocol("request already taken".to_string()))
        })
    }

    fn peer_addr(&self) -> String {
        self.from.clone()
    }

    fn send<'a>(
        &'a mut self,
        _cancel: &'a CancellationToken,
        response: Response,
    ) -> BoxFuture<'a, Result<()>> {
        let reply = self.reply.take();
        let call = self.call.clone();
        Box::pin(async move {
            let reply = reply.ok_or_else(|| RpcError::Protocol("response already sent".to_string()))?;
            if call.is_cancelled() {
                return Err(RpcError::Cancelled);
            }
            reply
                .send(response)
                .map_err(|_| RpcError::Connection("caller stopped waiting".to_string()))
        })
    }

    fn close(&mut self) -> Result<()> {
        self.reply = None;
        self.request = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Body, StatusCode};
    use std::time::Duration;

    #[test]
    fn test_sequential_addresses() {
        let cluster = Cluster::new();
        let a = cluster.new_peer();
        let b = cluster.new_peer();
        assert_eq!(a.addr(), "1");
        assert_eq!(b.addr(), "2");
        assert_eq!(cluster.len(), 2);
    }

    #[tokio::test]
    async fn test_connect_unknown_peer() {
        let cluster = Cluster::new();
        let peer = cluster.new_peer();
        let result = peer.connect(&CancellationToken::new(), "42").await;
        assert!(matches!(result, Err(RpcError::PeerNotFound(addr)) if addr == "42"));
    }

    #[tokio::test]
    async fn test_connect_removed_peer() {
        let cluster = Cluster::new();
        let a = cluster.new_peer();
        let b = cluster.new_peer();
        assert!(cluster.remove_peer(b.addr()));
        let result = a.connect(&CancellationToken::new(), b.addr()).await;
        assert!(matches!(result, Err(RpcError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn test_send_and_reply() {
        let cluster = Cluster::new();
        let server = cluster.new_peer();
        let client = cluster.new_peer();
        let listener = server.listen();

        let handle = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let request = conn.take_request().await.unwrap();
            assert_eq!(conn.peer_addr(), "2");
            let payload = request.body.read_to_end().await.unwrap();
            conn.send(&CancellationToken::new(), Response::ok(Body::from_bytes(payload)))
                .await
                .unwrap();
            conn.close().unwrap();
            conn.close().unwrap();
        });

        let cancel = CancellationToken::new();
        let mut conn = client.connect(&cancel, server.addr()).await.unwrap();
        let response = conn
            .send(&cancel, Request::new("Echo.Say", Body::from("ping")))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::Ok);
        assert_eq!(response.body.read_to_end().await.unwrap(), b"ping");
        conn.close().unwrap();
        conn.close().unwrap();

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let cluster = Cluster::new();
        let peer = cluster.new_peer();
        let listener = Arc::new(peer.listen());

        let pending = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.close().unwrap();
        listener.close().unwrap();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(RpcError::ListenerClosed)));
        assert!(matches!(listener.accept().await, Err(RpcError::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_send_cancelled_when_nobody_accepts() {
        let cluster = Cluster::new();
        let server = cluster.new_peer();
        let client = cluster.new_peer();

        let cancel = CancellationToken::new();
        let mut conn = client.connect(&cancel, server.addr()).await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = conn.send(&cancel, Request::new("A.B", Body::empty())).await;
        assert!(matches!(result, Err(RpcError::Cancelled)));
    }

    #[tokio::test]
    async fn test_second_reply_rejected() {
        let cluster = Cluster::new();
        let server = cluster.new_peer();
        let client = cluster.new_peer();
        let listener = server.listen();

        let handle = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let cancel = CancellationToken::new();
            conn.send(&cancel, Response::ok(Body::empty())).await.unwrap();
            let again = conn.send(&cancel, Response::ok(Body::empty())).await;
            assert!(matches!(again, Err(RpcError::Protocol(_))));
        });

        let cancel = CancellationToken::new();
        let mut conn = client.connect(&cancel, server.addr()).await.unwrap();
        conn.send(&cancel, Request::new("A.B", Body::empty())).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_waits_for_accept() {
        let cluster = Cluster::new();
        let server = cluster.new_peer();
        let client = cluster.new_peer();
        let listener = server.listen();
        let target = server.addr().to_string();

        let call = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let mut conn = client.connect(&cancel, &target).await.unwrap();
            conn.send(&cancel, Request::new("A.B", Body::empty())).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!call.is_finished());

        let mut conn = listener.accept().await.unwrap();
        conn.send(&CancellationToken::new(), Response::ok(Body::empty()))
            .await
            .unwrap();

        let response = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(response.status, StatusCode::Ok);
    }

    #[tokio::test]
    async fn test_close_fails_parked_call() {
        let cluster = Cluster::new();
        let server = cluster.new_peer();
        let client = cluster.new_peer();
        let listener = server.listen();
        let target = server.addr().to_string();

        let call = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let mut conn = client.connect(&cancel, &target).await.unwrap();
            conn.send(&cancel, Request::new("A.B", Body::empty())).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        listener.close().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .expect("parked call must fail once the listener closes")
            .unwrap();
        assert!(matches!(result, Err(RpcError::Connection(_))));
    }

    #[tokio::test]
    async fn test_accept_after_close_drains_parked_call() {
        let cluster = Cluster::new();
        let server = cluster.new_peer();
        let listener = server.listen();

        // Hold the inbox so `close` cannot drain the parked call itself.
        let inbox = cluster.lookup(server.addr()).unwrap();
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let (reply_tx, _reply_rx) = oneshot::channel();
        let inbox_guard = listener.inbox.lock().await;
        inbox
            .send(InmemServerConn {
                from: "caller".to_string(),
                request: Some(Request::new("A.B", Body::empty())),
                accepted: Some(accepted_tx),
                reply: Some(reply_tx),
                call: CancellationToken::new(),
            })
            .await
            .unwrap();

        listener.close().unwrap();
        drop(inbox_guard);

        assert!(matches!(listener.accept().await, Err(RpcError::ListenerClosed)));
        let accepted = tokio::time::timeout(Duration::from_secs(5), accepted_rx).await.unwrap();
        assert!(accepted.is_err());
    }

    #[tokio::test]
    async fn test_listener_closed_once_cluster_is_gone() {
        let cluster = Cluster::new();
        let peer = cluster.new_peer();
        let listener = peer.listen();

        drop(peer);
        drop(cluster);

        let result = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap();
        assert!(matches!(result, Err(RpcError::ListenerClosed)));
    }
}
