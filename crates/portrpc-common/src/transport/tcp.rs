use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::codec::WireCodec;
use super::{ClientConn, Connector};
use crate::protocol::error::{Result, RpcError};
use crate::protocol::{Request, Response};

/// Default timeout for establishing a TCP connection (5 seconds)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Raw TCP connector speaking the binary envelope.
///
/// Each call opens a fresh connection: the request envelope and body are
/// written, the write half is shut down to mark the end of the body, and
/// the response is read until the server closes the connection.
///
/// # Wire Protocol
///
/// ```text
/// client -> server: [request header] [body bytes...] FIN
/// server -> client: [response header] [body bytes or error text...] FIN
/// ```
///
/// # Example
///
/// ```no_run
/// use portrpc_common::transport::{Connector, TcpConnector};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn demo() -> portrpc_common::Result<()> {
/// let connector = TcpConnector::new();
/// let conn = connector.connect(&CancellationToken::new(), "127.0.0.1:9000").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TcpConnector {
    wire: WireCodec,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self {
            wire: WireCodec::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_wire_codec(mut self, wire: WireCodec) -> Self {
        self.wire = wire;
        self
    }

    /// Connects to a remote endpoint.
    ///
    /// The address may resolve to several socket addresses; each is tried
    /// in turn until one succeeds.
    async fn dial(&self, addr: &str) -> Result<TcpStream> {
        let socket_addrs = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| RpcError::Connection(format!("Invalid address '{}': {}", addr, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(socket_addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = Some(e.to_string()),
                Err(_) => last_err = Some(format!("timed out after {:?}", self.connect_timeout)),
            }
        }

        Err(RpcError::Connection(format!(
            "Failed to connect to {}: {}",
            addr,
            last_err.unwrap_or_else(|| "no addresses resolved".to_string())
        )))
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        addr: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn ClientConn>>> {
        Box::pin(async move {
            let stream = tokio::select! {
                stream = self.dial(addr) => stream?,
                _ = cancel.cancelled() => return Err(RpcError::Cancelled),
            };
            Ok(Box::new(TcpClientConn {
                wire: self.wire,
                stream: Some(stream),
            }) as Box<dyn ClientConn>)
        })
    }
}

struct TcpClientConn {
    wire: WireCodec,
    stream: Option<TcpStream>,
}

impl ClientConn for TcpClientConn {
    fn send<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        request: Request,
    ) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let stream = self
                .stream
                .take()
                .ok_or_else(|| RpcError::Connection("conn is closed or already used".to_string()))?;
            let wire = self.wire;

            let round_trip = async move {
                let (read_half, mut write_half) = stream.into_split();
                wire.write_request(&mut write_half, request).await?;
                write_half.shutdown().await?;
                wire.read_response(read_half).await
            };

            tokio::select! {
                response = round_trip => response,
                _ = cancel.cancelled() => Err(RpcError::Cancelled),
            }
        })
    }

    fn close(&mut self) -> Result<()> {
        self.stream = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_connector_default() {
        let connector = TcpConnector::default();
        assert_eq!(connector.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let vacant = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            vacant.local_addr().unwrap().port()
        };

        let connector = TcpConnector::new().with_timeout(Duration::from_secs(1));
        let result = connector
            .connect(&CancellationToken::new(), &format!("127.0.0.1:{}", port))
            .await;
        assert!(matches!(result, Err(RpcError::Connection(_))));
    }

    #[tokio::test]
    async fn test_connect_invalid_address() {
        let connector = TcpConnector::new();
        let result = connector.connect(&CancellationToken::new(), "not an address").await;
        assert!(matches!(result, Err(RpcError::Connection(_))));
    }
}
