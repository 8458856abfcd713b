//! HTTP Transport (client side) and the header mapping shared with
//! [`HttpListener`](super::HttpListener).
//!
//! # Header Mapping
//!
//! One RPC call is one HTTP exchange on a configured path and method.
//! The envelope travels in four headers:
//!
//! | Header | Direction | Value |
//! |---|---|---|
//! | `portrpc-service-method` | request | `Service.Method` |
//! | `portrpc-metadata` | both | metadata as JSON, percent-encoded; absent means empty |
//! | `portrpc-status` | response | decimal [`StatusCode`] |
//! | `portrpc-error` | response | `true` when the body is error text |
//!
//! Request and response bodies are streamed as-is. Every RPC outcome,
//! including routing and service failures, travels with HTTP 200; any other
//! HTTP status comes from the HTTP layer itself and is reported to the
//! caller as an [`StatusCode::InternalError`] response, which clients treat
//! as a transport failure.

use std::io;

use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Method, Uri};
use hyper_util::client::legacy::connect::HttpConnector as TcpHttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;

use super::codec::MAX_ERROR_LEN;
use super::{ClientConn, Connector};
use crate::payload::CodecError;
use crate::protocol::error::{Result, RpcError};
use crate::protocol::{Body, Metadata, Request, Response, ServiceMethod, StatusCode};

pub const SERVICE_METHOD_HEADER: &str = "portrpc-service-method";
pub const METADATA_HEADER: &str = "portrpc-metadata";
pub const STATUS_HEADER: &str = "portrpc-status";
pub const ERROR_HEADER: &str = "portrpc-error";

/// Path used by [`HttpConnector::default`] and listeners built without one.
pub const DEFAULT_PATH: &str = "/rpc";

/// Body type sent by both sides of the HTTP transport.
pub type HttpBody = UnsyncBoxBody<Bytes, io::Error>;

/// Encodes metadata as the value of [`METADATA_HEADER`].
pub fn encode_metadata_header(metadata: &Metadata) -> Result<HeaderValue> {
    let json = serde_json::to_string(metadata).map_err(CodecError::from)?;
    let escaped = utf8_percent_encode(&json, NON_ALPHANUMERIC).to_string();
    HeaderValue::from_str(&escaped)
        .map_err(|e| RpcError::Protocol(format!("invalid metadata header: {}", e)))
}

/// Decodes [`METADATA_HEADER`] from a header map. A missing header is empty
/// metadata.
pub fn decode_metadata_header(headers: &HeaderMap) -> Result<Metadata> {
    let Some(value) = headers.get(METADATA_HEADER) else {
        return Ok(Metadata::new());
    };
    let raw = value
        .to_str()
        .map_err(|e| RpcError::Protocol(format!("metadata header is not ascii: {}", e)))?;
    let json = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|e| RpcError::Protocol(format!("query unescape metadata: {}", e)))?;
    let metadata = serde_json::from_str(&json).map_err(CodecError::from)?;
    Ok(metadata)
}

/// Reads the service method and metadata of an inbound request.
pub fn decode_request_headers(headers: &HeaderMap) -> Result<(ServiceMethod, Metadata)> {
    let service_method = match headers.get(SERVICE_METHOD_HEADER) {
        Some(value) => value
            .to_str()
            .map_err(|e| RpcError::Protocol(format!("service method header is not ascii: {}", e)))?,
        None => "",
    };
    let metadata = decode_metadata_header(headers)?;
    Ok((ServiceMethod::new(service_method), metadata))
}

/// Reads the RPC status of a response.
pub fn decode_status_header(headers: &HeaderMap) -> Result<StatusCode> {
    let raw = headers
        .get(STATUS_HEADER)
        .ok_or_else(|| RpcError::Protocol("no status code in header".to_string()))?
        .to_str()
        .map_err(|e| RpcError::Protocol(format!("status header is not ascii: {}", e)))?;
    let code: u16 = raw
        .parse()
        .map_err(|e| RpcError::Protocol(format!("convert status from header to int: {}", e)))?;
    StatusCode::from_u16(code).ok_or_else(|| RpcError::Protocol(format!("unknown status code {}", code)))
}

pub(crate) fn has_error(headers: &HeaderMap) -> bool {
    headers
        .get(ERROR_HEADER)
        .map(|v| v.as_bytes() == b"true")
        .unwrap_or(false)
}

/// Streams a [`Body`] out as an HTTP body.
pub(crate) fn into_http_body(body: Body) -> HttpBody {
    StreamBody::new(ReaderStream::new(body).map_ok(Frame::data)).boxed_unsync()
}

/// Fixed HTTP body, used for error text.
pub(crate) fn full_body(bytes: impl Into<Bytes>) -> HttpBody {
    let bytes: Bytes = bytes.into();
    BodyExt::map_err(Full::new(bytes), |never| -> io::Error { match never {} }).boxed_unsync()
}

/// Exposes an inbound hyper body as a [`Body`] without buffering it.
pub(crate) fn from_incoming(incoming: Incoming) -> Body {
    let chunks = TryStreamExt::map_err(incoming.into_data_stream(), io::Error::other);
    Body::from_reader(StreamReader::new(chunks))
}

/// Reads a bounded amount of text from an inbound body.
async fn read_text(incoming: Incoming) -> Result<String> {
    let collected = Limited::new(incoming, MAX_ERROR_LEN as usize)
        .collect()
        .await
        .map_err(|e| RpcError::Transport(format!("read response body: {}", e)))?;
    Ok(String::from_utf8_lossy(&collected.to_bytes()).into_owned())
}

/// Opens HTTP conns to `http://<addr><path>`.
///
/// Connections to the same host are reused by the underlying hyper client,
/// but each call is still its own HTTP exchange.
///
/// # Example
///
/// ```no_run
/// use portrpc_common::transport::{Connector, HttpConnector};
/// use hyper::Method;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn demo() -> portrpc_common::Result<()> {
/// let connector = HttpConnector::new("/rpc", Method::POST);
/// let conn = connector.connect(&CancellationToken::new(), "127.0.0.1:8080").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HttpConnector {
    client: Client<TcpHttpConnector, HttpBody>,
    path: String,
    method: Method,
}

impl HttpConnector {
    /// Creates a connector that sends calls with `method` to `path`.
    pub fn new(path: impl Into<String>, method: Method) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            path: normalize_path(path.into()),
            method,
        }
    }

    fn endpoint(&self, addr: &str) -> Result<Uri> {
        let base = if addr.contains("://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr.trim_end_matches('/'))
        };
        format!("{}{}", base, self.path)
            .parse::<Uri>()
            .map_err(|e| RpcError::InvalidRequest(format!("create url to connect via http: {}", e)))
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_PATH, Method::POST)
    }
}

impl Connector for HttpConnector {
    fn connect<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        addr: &'a str,
    ) -> futures::future::BoxFuture<'a, Result<Box<dyn ClientConn>>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(RpcError::Cancelled);
            }
            let uri = self.endpoint(addr)?;
            Ok(Box::new(HttpClientConn {
                client: self.client.clone(),
                method: self.method.clone(),
                uri,
                closed: false,
            }) as Box<dyn ClientConn>)
        })
    }
}

pub(crate) fn normalize_path(path: String) -> String {
    if path.starts_with('/') {
        path
    } else {
        format!("/{}", path)
    }
}

struct HttpClientConn {
    client: Client<TcpHttpConnector, HttpBody>,
    method: Method,
    uri: Uri,
    closed: bool,
}

impl HttpClientConn {
    async fn round_trip(&self, request: Request) -> Result<Response> {
        let mut builder = hyper::Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone())
            .header(SERVICE_METHOD_HEADER, request.service_method.as_str());
        if !request.metadata.is_empty() {
            builder = builder.header(METADATA_HEADER, encode_metadata_header(&request.metadata)?);
        }
        let http_request = builder.body(into_http_body(request.body))?;

        let http_response = self
            .client
            .request(http_request)
            .await
            .map_err(|e| RpcError::Connection(format!("do http request: {}", e)))?;
        let (parts, incoming) = http_response.into_parts();

        if parts.status != hyper::StatusCode::OK {
            let text = read_text(incoming).await?;
            return Ok(Response::error(
                StatusCode::InternalError,
                format!("got bad status code: {}, body: {}", parts.status, text),
            ));
        }

        let status = decode_status_header(&parts.headers)?;
        let metadata = decode_metadata_header(&parts.headers)?;

        if has_error(&parts.headers) {
            let text = read_text(incoming).await?;
            return Ok(Response::error(status, text).with_metadata(metadata));
        }
        Ok(Response::ok(from_incoming(incoming)).with_metadata(metadata))
    }
}

impl ClientConn for HttpClientConn {
    fn send<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
        request: Request,
    ) -> futures::future::BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            if self.closed {
                return Err(RpcError::Connection("conn is closed".to_string()));
            }
            tokio::select! {
                result = self.round_trip(request) => result,
                _ = cancel.cancelled() => Err(RpcError::Cancelled),
            }
        })
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
