use std::net::SocketAddr;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::codec::WireCodec;
use super::{Listener, ServerConn};
use crate::protocol::error::{Result, RpcError};
use crate::protocol::{Body, Request, Response};

/// Raw TCP listener speaking the binary envelope.
///
/// Accepted conns parse the request envelope lazily in
/// [`ServerConn::take_request`], so a slow client never stalls `accept`.
pub struct TcpListener {
    listener: tokio::net::TcpListener,
    wire: WireCodec,
    shutdown: CancellationToken,
}

impl TcpListener {
    /// Creates a new TCP listener bound to the specified address.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "0.0.0.0:8080")
    pub async fn bind(bind_addr: &str) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self {
            listener,
            wire: WireCodec::default(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_wire_codec(mut self, wire: WireCodec) -> Self {
        self.wire = wire;
        self
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RpcError::Connection(format!("Failed to get local addr: {}", e)))
    }
}

impl Listener for TcpListener {
    fn accept(&self) -> BoxFuture<'_, Result<Box<dyn ServerConn>>> {
        Box::pin(async move {
            if self.shutdown.is_cancelled() {
                return Err(RpcError::ListenerClosed);
            }

            let (stream, remote) = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(RpcError::ListenerClosed),
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tokio::select! {
                            _ = self.shutdown.cancelled() => return Err(RpcError::ListenerClosed),
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                        return Err(RpcError::Connection(format!("Failed to accept connection: {}", e)));
                    }
                },
            };

            tracing::debug!("Connection established from {}", remote);
            Ok(Box::new(TcpServerConn {
                wire: self.wire,
                remote,
                stream: Some(stream),
                write_half: None,
                unread: None,
            }) as Box<dyn ServerConn>)
        })
    }

    fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        Ok(())
    }
}

struct TcpServerConn {
    wire: WireCodec,
    remote: SocketAddr,
    stream: Option<TcpStream>,
    write_half: Option<OwnedWriteHalf>,
    /// Read half left behind by a request that failed to parse.
    unread: Option<OwnedReadHalf>,
}

/// How long a rejected request's remaining input is discarded before the
/// conn is closed anyway.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed accept, so the caller's retry does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

impl TcpServerConn {
    /// Splits the stream on first use, keeping the write half for the reply.
    fn split(&mut self) -> Option<OwnedReadHalf> {
        let stream = self.stream.take()?;
        let (read_half, write_half) = stream.into_split();
        self.write_half = Some(write_half);
        Some(read_half)
    }
}

impl ServerConn for TcpServerConn {
    fn take_request(&mut self) -> BoxFuture<'_, Result<Request>> {
        Box::pin(async move {
            let mut read_half = self
                .split()
                .ok_or_else(|| RpcError::Protocol("request already taken".to_string()))?;

            match self.wire.decode_request_header(&mut read_half).await {
                Ok(header) => Ok(Request {
                    service_method: header.service_method,
                    metadata: header.metadata,
                    body: Body::from_reader(read_half),
                }),
                Err(err) => {
                    self.unread = Some(read_half);
                    Err(err)
                }
            }
        })
    }

    fn peer_addr(&self) -> String {
        self.remote.to_string()
    }

    fn send<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        response: Response,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            // Replying before the request was read still needs the write half.
            let _ = self.split();
            let mut write_half = self
                .write_half
                .take()
                .ok_or_else(|| RpcError::Protocol("response already sent".to_string()))?;

            let wire = self.wire;
            let unread = self.unread.take();
            let remote = self.remote;
            tokio::select! {
                written = async {
                    wire.write_response(&mut write_half, response).await?;
                    write_half.shutdown().await?;
                    // Closing with unread input resets the connection and can
                    // destroy the reply before the peer reads it, so read to EOF.
                    if let Some(mut read_half) = unread {
                        let drained = tokio::time::timeout(
                            DRAIN_TIMEOUT,
                            tokio::io::copy(&mut read_half, &mut tokio::io::sink()),
                        )
                        .await;
                        if drained.is_err() {
                            tracing::debug!("{} kept sending past the drain deadline", remote);
                        }
                    }
                    Ok::<(), RpcError>(())
                } => written,
                _ = cancel.cancelled() => Err(RpcError::Cancelled),
            }
        })
    }

    fn close(&mut self) -> Result<()> {
        self.stream = None;
        self.write_half = None;
        self.unread = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_listener_creation() {
        let listener = TcpListener::bind("127.0.0.1:0").await;
        assert!(listener.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_listener_local_addr() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        assert!(addr.is_ok());
    }

    #[tokio::test]
    async fn test_accept_after_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.close().unwrap();
        listener.close().unwrap();
        assert!(matches!(listener.accept().await, Err(RpcError::ListenerClosed)));
    }
}
