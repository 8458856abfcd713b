use std::io::{self, BufWriter, Write};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::io::{StreamReader, SyncIoBridge};

use super::{Codec, CodecError};
use crate::protocol::Body;

/// Size of the chunks handed from the encoder thread to the body reader.
const CHUNK_SIZE: usize = 16 * 1024;

/// Chunks buffered between encoder and reader before the encoder blocks.
const PIPE_DEPTH: usize = 4;

/// Encodes `value` into a streaming [`Body`].
///
/// The encoder runs on the blocking pool and its output is handed over in
/// bounded chunks, so the payload is never materialized in full. An encoder
/// failure surfaces as a read error on the returned body.
///
/// Must be called from within a tokio runtime.
pub fn encode_body<C, T>(codec: &C, value: T) -> Body
where
    C: Codec,
    T: Serialize + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<io::Result<Bytes>>(PIPE_DEPTH);
    let codec = codec.clone();

    tokio::task::spawn_blocking(move || {
        let result = (|| {
            let mut writer = BufWriter::with_capacity(CHUNK_SIZE, ChannelWriter { tx: tx.clone() });
            codec.encode(&mut writer, &value)?;
            writer.flush()?;
            Ok::<_, CodecError>(())
        })();

        if let Err(err) = result {
            tracing::debug!("payload encoding failed: {}", err);
            let _ = tx.blocking_send(Err(io::Error::other(err)));
        }
    });

    let chunks = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
    Body::from_reader(StreamReader::new(chunks))
}

/// Decodes a value of type `T` from a [`Body`] on the blocking pool.
///
/// Must be called from within a tokio runtime.
pub async fn decode_body<C, T>(codec: &C, body: Body) -> Result<T, CodecError>
where
    C: Codec,
    T: DeserializeOwned + Send + 'static,
{
    let codec = codec.clone();
    let handle = Handle::current();

    tokio::task::spawn_blocking(move || {
        let mut reader = SyncIoBridge::new_with_handle(body, handle);
        codec.decode(&mut reader)
    })
    .await
    .map_err(|e| CodecError::Custom(format!("decode task failed: {}", e)))?
}

/// `std::io::Write` half of the encoder pipe.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "body reader dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
