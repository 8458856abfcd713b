use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

/// Payload byte stream of a request or response.
///
/// A `Body` is read at most once. It is never buffered by the runtime
/// itself; transports hand the underlying stream through untouched.
#[derive(Default)]
pub struct Body {
    inner: Option<BoxReader>,
}

impl Body {
    pub fn empty() -> Self {
        Body { inner: None }
    }

    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Body {
            inner: Some(Box::pin(reader)),
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Body::empty();
        }
        Body::from_reader(io::Cursor::new(bytes))
    }

    /// Whether the body is known to be empty without reading it.
    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// Drains the body into memory.
    pub async fn read_to_end(mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        AsyncReadExt::read_to_end(&mut self, &mut buf).await?;
        Ok(buf)
    }

    /// Reads and discards the rest of the body.
    pub async fn discard(mut self) -> io::Result<u64> {
        tokio::io::copy(&mut self, &mut tokio::io::sink()).await
    }
}

impl AsyncRead for Body {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.inner.as_mut() {
            Some(reader) => reader.as_mut().poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("empty", &self.inner.is_none())
            .finish()
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::from_bytes(value)
    }
}

impl From<&'static str> for Body {
    fn from(value: &'static str) -> Self {
        Body::from_bytes(value.as_bytes())
    }
}
