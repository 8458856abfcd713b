use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{Result, RpcError};
use crate::protocol::{
    Body, Metadata, Request, Response, ServiceMethod, StatusCode, Version, PROTOCOL_VERSION,
};

/// Maximum length of a single string field in a header (16 MiB)
pub const MAX_FIELD_LEN: usize = 16 * 1024 * 1024;

/// Maximum number of metadata pairs, and of values per pair, in a header
pub const MAX_METADATA_ENTRIES: usize = 65_536;

/// Maximum size of the error text following a non-OK response header (16 MiB)
pub const MAX_ERROR_LEN: u64 = 16 * 1024 * 1024;

/// Decoded request envelope, without its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub version: Version,
    pub service_method: ServiceMethod,
    pub metadata: Metadata,
}

/// Decoded response envelope, without its body or error text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    pub version: Version,
    pub status: StatusCode,
    pub metadata: Metadata,
}

/// Binary envelope codec for byte-stream transports.
///
/// Wire layout, all integers big-endian:
///
/// ```text
/// request:  major u16 | minor u16 | patch u16 | service_method | metadata | body...
/// response: major u16 | minor u16 | patch u16 | status u16 | metadata | body or error text...
///
/// string:   len u32 | utf-8 bytes
/// metadata: pairs u32 | { key string | values u32 | { value string }* }*
/// ```
///
/// The body is never part of the header. Writers copy it after the header
/// and readers expose whatever follows the header as the body stream.
///
/// # Example
///
/// ```
/// use portrpc_common::transport::WireCodec;
/// use portrpc_common::{Metadata, ServiceMethod};
///
/// # tokio_test_block_on(async {
/// let codec = WireCodec::default();
/// let bytes = codec
///     .encode_request_header(&ServiceMethod::new("Calc.Add"), &Metadata::new())
///     .unwrap();
///
/// let header = codec.decode_request_header(&mut bytes.as_slice()).await.unwrap();
/// assert_eq!(header.service_method.as_str(), "Calc.Add");
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct WireCodec {
    version: Version,
    ignore_version: bool,
}

impl WireCodec {
    /// Creates a codec that writes `version` and rejects peers with a
    /// different major version.
    pub fn new(version: Version) -> Self {
        Self {
            version,
            ignore_version: false,
        }
    }

    /// Accept peers of any version.
    pub fn ignoring_version(mut self) -> Self {
        self.ignore_version = true;
        self
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Encodes a request header into a byte vector.
    ///
    /// # Arguments
    ///
    /// * `service_method` - The call target
    /// * `metadata` - Request metadata, written in iteration order
    ///
    /// # Returns
    ///
    /// The encoded header, or a protocol error if a field exceeds its limit
    pub fn encode_request_header(
        &self,
        service_method: &ServiceMethod,
        metadata: &Metadata,
    ) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        put_version(&mut buf, self.version);
        put_string(&mut buf, service_method.as_str())?;
        put_metadata(&mut buf, metadata)?;
        Ok(buf)
    }

    /// Encodes a response header into a byte vector.
    pub fn encode_response_header(&self, status: StatusCode, metadata: &Metadata) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(32);
        put_version(&mut buf, self.version);
        buf.extend_from_slice(&status.as_u16().to_be_bytes());
        put_metadata(&mut buf, metadata)?;
        Ok(buf)
    }

    /// Decodes a request header, leaving the reader positioned at the body.
    ///
    /// An incompatible peer version fails with
    /// [`RpcError::IncompatibleVersion`], which carries the peer's version.
    pub async fn decode_request_header<R>(&self, reader: &mut R) -> Result<RequestHeader>
    where
        R: AsyncRead + Unpin,
    {
        let version = self.read_version(reader).await?;
        let service_method = ServiceMethod::new(get_string(reader).await?);
        let metadata = get_metadata(reader).await?;
        Ok(RequestHeader {
            version,
            service_method,
            metadata,
        })
    }

    /// Decodes a response header, leaving the reader positioned at the body.
    pub async fn decode_response_header<R>(&self, reader: &mut R) -> Result<ResponseHeader>
    where
        R: AsyncRead + Unpin,
    {
        let version = self.read_version(reader).await?;
        let raw = reader.read_u16().await.map_err(map_header_error)?;
        let status = StatusCode::from_u16(raw)
            .ok_or_else(|| RpcError::Protocol(format!("unknown status code {}", raw)))?;
        let metadata = get_metadata(reader).await?;
        Ok(ResponseHeader {
            version,
            status,
            metadata,
        })
    }

    /// Writes a request header followed by its body.
    pub async fn write_request<W>(&self, writer: &mut W, request: Request) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let header = self.encode_request_header(&request.service_method, &request.metadata)?;
        writer.write_all(&header).await?;

        let mut body = request.body;
        tokio::io::copy(&mut body, writer).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads a request header and exposes the rest of the stream as its body.
    pub async fn read_request<R>(&self, mut reader: R) -> Result<Request>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let header = self.decode_request_header(&mut reader).await?;
        Ok(Request {
            service_method: header.service_method,
            metadata: header.metadata,
            body: Body::from_reader(reader),
        })
    }

    /// Writes a response header followed by its body, or by its error
    /// text when the status is not OK.
    pub async fn write_response<W>(&self, writer: &mut W, response: Response) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let header = self.encode_response_header(response.status, &response.metadata)?;
        writer.write_all(&header).await?;

        if response.status.is_ok() {
            let mut body = response.body;
            tokio::io::copy(&mut body, writer).await?;
        } else if let Some(message) = &response.error {
            writer.write_all(message.as_bytes()).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Reads a response.
    ///
    /// For a non-OK status the remaining bytes are read as the error text.
    /// For an OK status the remaining stream becomes the body and is not
    /// read here.
    pub async fn read_response<R>(&self, mut reader: R) -> Result<Response>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let header = self.decode_response_header(&mut reader).await?;

        if header.status.is_ok() {
            return Ok(Response::ok(Body::from_reader(reader)).with_metadata(header.metadata));
        }

        let mut raw = Vec::new();
        (&mut reader).take(MAX_ERROR_LEN).read_to_end(&mut raw).await?;
        let message = String::from_utf8_lossy(&raw).into_owned();
        Ok(Response::error(header.status, message).with_metadata(header.metadata))
    }

    async fn read_version<R>(&self, reader: &mut R) -> Result<Version>
    where
        R: AsyncRead + Unpin,
    {
        let major = reader.read_u16().await.map_err(map_header_error)?;
        let minor = reader.read_u16().await.map_err(map_header_error)?;
        let patch = reader.read_u16().await.map_err(map_header_error)?;
        let theirs = Version::new(major, minor, patch);

        if !self.ignore_version && !self.version.compatible_with(&theirs) {
            return Err(RpcError::IncompatibleVersion {
                ours: self.version,
                theirs,
            });
        }
        Ok(theirs)
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(PROTOCOL_VERSION)
    }
}

fn put_version(buf: &mut Vec<u8>, version: Version) {
    buf.extend_from_slice(&version.major.to_be_bytes());
    buf.extend_from_slice(&version.minor.to_be_bytes());
    buf.extend_from_slice(&version.patch.to_be_bytes());
}

fn put_len(buf: &mut Vec<u8>, len: usize, limit: usize, what: &str) -> Result<()> {
    if len > limit {
        return Err(RpcError::Protocol(format!(
            "{} too large: {} (max {})",
            what, len, limit
        )));
    }
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    Ok(())
}

fn put_string(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    put_len(buf, value.len(), MAX_FIELD_LEN, "string field")?;
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn put_metadata(buf: &mut Vec<u8>, metadata: &Metadata) -> Result<()> {
    put_len(buf, metadata.len(), MAX_METADATA_ENTRIES, "metadata")?;
    for (key, values) in metadata.iter() {
        put_string(buf, key)?;
        put_len(buf, values.len(), MAX_METADATA_ENTRIES, "metadata value list")?;
        for value in values {
            put_string(buf, value)?;
        }
    }
    Ok(())
}

async fn get_len<R>(reader: &mut R, limit: usize, what: &str) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await.map_err(map_header_error)? as usize;
    if len > limit {
        return Err(RpcError::Protocol(format!(
            "{} too large: {} (max {})",
            what, len, limit
        )));
    }
    Ok(len)
}

async fn get_string<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let len = get_len(reader, MAX_FIELD_LEN, "string field").await?;
    let mut raw = vec![0u8; len];
    reader.read_exact(&mut raw).await.map_err(map_header_error)?;
    String::from_utf8(raw).map_err(|e| RpcError::Protocol(format!("invalid utf-8 in header: {}", e)))
}

async fn get_metadata<R>(reader: &mut R) -> Result<Metadata>
where
    R: AsyncRead + Unpin,
{
    let pairs = get_len(reader, MAX_METADATA_ENTRIES, "metadata").await?;
    let mut metadata = Metadata::new();
    for _ in 0..pairs {
        let key = get_string(reader).await?;
        let count = get_len(reader, MAX_METADATA_ENTRIES, "metadata value list").await?;
        let mut values = Vec::with_capacity(count.min(16));
        for _ in 0..count {
            values.push(get_string(reader).await?);
        }
        metadata.push_entry(key, values);
    }
    Ok(metadata)
}

/// A header cut short is a framing problem, not a plain I/O failure.
fn map_header_error(err: std::io::Error) -> RpcError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        RpcError::Protocol("truncated envelope header".to_string())
    } else {
        RpcError::Io(err)
    }
}
