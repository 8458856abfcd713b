use std::sync::Arc;

use portrpc_common::payload::{decode_body, encode_body, Codec, CodecError};
use portrpc_common::protocol::error::RpcError;
use portrpc_common::transport::{ClientConn, Connector};
use portrpc_common::{Metadata, Request, ServiceMethod, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure of a single [`Client::call`].
///
/// Exactly one cause per error, so callers branch on the variant rather
/// than on the message.
#[derive(Error, Debug)]
pub enum CallError {
    #[error("can't connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: RpcError,
    },

    #[error("can't send request: {0}")]
    Send(#[source] RpcError),

    #[error("transport error: {status}: {message}")]
    Transport { status: StatusCode, message: String },

    #[error("service error: {0}")]
    Service(String),

    #[error("can't decode response: {0}")]
    Decode(#[source] CodecError),
}

impl CallError {
    /// The remote operation ran and returned an error.
    pub fn is_service_error(&self) -> bool {
        matches!(self, CallError::Service(_))
    }

    /// The server answered with a non-OK status other than a service error:
    /// routing, decoding or internal failures.
    pub fn is_transport_error(&self) -> bool {
        matches!(self, CallError::Transport { .. })
    }
}

/// RPC client bound to one address, payload codec and transport.
///
/// Cloning is cheap; clones share the connector.
#[derive(Clone)]
pub struct Client<C: Codec> {
    addr: String,
    codec: C,
    connector: Arc<dyn Connector>,
}

impl<C: Codec> Client<C> {
    pub fn new(addr: impl Into<String>, codec: C, connector: impl Connector + 'static) -> Self {
        Self::with_shared_connector(addr, codec, Arc::new(connector))
    }

    /// Creates a client over a connector shared with other clients.
    pub fn with_shared_connector(addr: impl Into<String>, codec: C, connector: Arc<dyn Connector>) -> Self {
        Self {
            addr: addr.into(),
            codec,
            connector,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Calls `service_method` (`"Service.Method"`) with `request` and decodes
    /// the result.
    ///
    /// Makes exactly one attempt.
    pub async fn call<Req, Resp>(
        &self,
        cancel: &CancellationToken,
        service_method: impl Into<ServiceMethod>,
        request: Req,
    ) -> Result<Resp, CallError>
    where
        Req: Serialize + Send + 'static,
        Resp: DeserializeOwned + Send + 'static,
    {
        self.call_with_metadata(cancel, service_method, Metadata::new(), request)
            .await
    }

    /// Like [`call`](Client::call), sending `metadata` with the request.
    pub async fn call_with_metadata<Req, Resp>(
        &self,
        cancel: &CancellationToken,
        service_method: impl Into<ServiceMethod>,
        metadata: Metadata,
        request: Req,
    ) -> Result<Resp, CallError>
    where
        Req: Serialize + Send + 'static,
        Resp: DeserializeOwned + Send + 'static,
    {
        let service_method = service_method.into();
        let mut conn = self
            .connector
            .connect(cancel, &self.addr)
            .await
            .map_err(|source| CallError::Connect {
                addr: self.addr.clone(),
                source,
            })?;

        let result = self
            .exchange(cancel, conn.as_mut(), service_method, metadata, request)
            .await;

        if let Err(err) = conn.close() {
            tracing::debug!("closing conn to {} failed: {}", self.addr, err);
        }
        result
    }

    async fn exchange<Req, Resp>(
        &self,
        cancel: &CancellationToken,
        conn: &mut dyn ClientConn,
        service_method: ServiceMethod,
        metadata: Metadata,
        request: Req,
    ) -> Result<Resp, CallError>
    where
        Req: Serialize + Send + 'static,
        Resp: DeserializeOwned + Send + 'static,
    {
        let body = encode_body(&self.codec, request);
        let request = Request::new(service_method, body).with_metadata(metadata);

        let response = conn.send(cancel, request).await.map_err(CallError::Send)?;

        match response.status {
            StatusCode::Ok => decode_body(&self.codec, response.body)
                .await
                .map_err(CallError::Decode),
            StatusCode::ErrorFromService => Err(CallError::Service(response.error.unwrap_or_default())),
            status => Err(CallError::Transport {
                status,
                message: response.error.unwrap_or_default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use portrpc_common::payload::JsonCodec;
    use portrpc_common::protocol::error::Result;
    use portrpc_common::{Body, Response};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers every call with a canned response and counts closes.
    struct FakeConnector {
        reply: fn() -> Response,
        seen: Arc<Mutex<Vec<(String, Metadata)>>>,
        closes: Arc<AtomicUsize>,
    }

    impl FakeConnector {
        fn new(reply: fn() -> Response) -> Self {
            Self {
                reply,
                seen: Arc::new(Mutex::new(Vec::new())),
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct FakeConn {
        reply: fn() -> Response,
        seen: Arc<Mutex<Vec<(String, Metadata)>>>,
        closes: Arc<AtomicUsize>,
    }

    impl Connector for FakeConnector {
        fn connect<'a>(
            &'a self,
            _cancel: &'a CancellationToken,
            addr: &'a str,
        ) -> BoxFuture<'a, Result<Box<dyn ClientConn>>> {
            Box::pin(async move {
                if addr == "unreachable" {
                    return Err(RpcError::Connection("refused".to_string()));
                }
                Ok(Box::new(FakeConn {
                    reply: self.reply,
                    seen: self.seen.clone(),
                    closes: self.closes.clone(),
                }) as Box<dyn ClientConn>)
            })
        }
    }

    impl ClientConn for FakeConn {
        fn send<'a>(
            &'a mut self,
            _cancel: &'a CancellationToken,
            request: Request,
        ) -> BoxFuture<'a, Result<Response>> {
            Box::pin(async move {
                if request.service_method.as_str() == "Broken.Pipe" {
                    return Err(RpcError::Transport("broken pipe".to_string()));
                }
                request.body.discard().await?;
                self.seen
                    .lock()
                    .unwrap()
                    .push((request.service_method.to_string(), request.metadata));
                Ok((self.reply)())
            })
        }

        fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ok_25() -> Response {
        Response::ok(Body::from("25"))
    }

    fn not_json() -> Response {
        Response::ok(Body::from("{oops"))
    }

    fn service_failed() -> Response {
        Response::error(StatusCode::ErrorFromService, "error from service: division by zero")
    }

    fn method_missing() -> Response {
        Response::error(StatusCode::MethodNotFound, "code: StatusMethodNotFound")
    }

    // ========================================================================
    // Call outcomes
    // ========================================================================

    #[tokio::test]
    async fn test_call_ok() {
        let connector = FakeConnector::new(ok_25);
        let closes = connector.closes.clone();
        let client = Client::new("fake", JsonCodec, connector);

        let result: i64 = client
            .call(&CancellationToken::new(), "Calc.Add", (10, 15))
            .await
            .unwrap();

        assert_eq!(result, 25);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_call_sends_metadata() {
        let connector = FakeConnector::new(ok_25);
        let seen = connector.seen.clone();
        let client = Client::new("fake", JsonCodec, connector);

        let mut metadata = Metadata::new();
        metadata.append("trace-id", "abc");
        let _: i64 = client
            .call_with_metadata(&CancellationToken::new(), "Calc.Add", metadata, ())
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, "Calc.Add");
        assert_eq!(seen[0].1.get_first("trace-id"), Some("abc"));
    }

    #[tokio::test]
    async fn test_call_connect_error() {
        let client = Client::new("unreachable", JsonCodec, FakeConnector::new(ok_25));
        let err = client
            .call::<_, i64>(&CancellationToken::new(), "Calc.Add", ())
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Connect { ref addr, .. } if addr == "unreachable"));
        assert!(!err.is_service_error());
        assert!(!err.is_transport_error());
    }

    #[tokio::test]
    async fn test_call_send_error_closes_conn() {
        let connector = FakeConnector::new(ok_25);
        let closes = connector.closes.clone();
        let client = Client::new("fake", JsonCodec, connector);

        let err = client
            .call::<_, i64>(&CancellationToken::new(), "Broken.Pipe", ())
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Send(RpcError::Transport(_))));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_call_service_error() {
        let client = Client::new("fake", JsonCodec, FakeConnector::new(service_failed));
        let err = client
            .call::<_, i64>(&CancellationToken::new(), "Calc.Divide", (10, 0))
            .await
            .unwrap_err();

        assert!(err.is_service_error());
        assert!(!err.is_transport_error());
        assert!(err.to_string().contains("division by zero"));
    }

    #[tokio::test]
    async fn test_call_transport_error() {
        let client = Client::new("fake", JsonCodec, FakeConnector::new(method_missing));
        let err = client
            .call::<_, i64>(&CancellationToken::new(), "Calc.Nope", ())
            .await
            .unwrap_err();

        assert!(err.is_transport_error());
        assert!(matches!(
            err,
            CallError::Transport { status: StatusCode::MethodNotFound, .. }
        ));
    }

    #[tokio::test]
    async fn test_call_decode_error() {
        let client = Client::new("fake", JsonCodec, FakeConnector::new(not_json));
        let err = client
            .call::<_, i64>(&CancellationToken::new(), "Calc.Add", ())
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Decode(_)));
    }
}
