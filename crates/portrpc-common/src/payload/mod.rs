//! Payload codec contract
//!
//! A payload codec turns typed application values into the byte stream
//! carried as a request or response body, and back. The runtime never
//! inspects payload bytes; any format that can satisfy [`Encoder`] and
//! [`Decoder`] plugs in.
//!
//! # Components
//!
//! - **[`Encoder`]** / **[`Decoder`]**: the two one-method contracts
//! - **[`Codec`]**: both halves together, blanket-implemented
//! - **[`JsonCodec`]**: `serde_json` adapter
//! - **[`PostcardCodec`]**: `postcard` adapter
//! - **[`encode_body`]** / **[`decode_body`]**: bridge a codec to a streaming [`Body`](crate::protocol::Body)
//!
//! # Example
//!
//! ```
//! use portrpc_common::payload::{Decoder, Encoder, JsonCodec};
//!
//! let mut buf = Vec::new();
//! JsonCodec.encode(&mut buf, &vec![1u32, 2, 3]).unwrap();
//! let back: Vec<u32> = JsonCodec.decode(&mut buf.as_slice()).unwrap();
//! assert_eq!(back, vec![1, 2, 3]);
//! ```

pub mod json;
pub mod postcard;
pub mod stream;

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use self::json::JsonCodec;
pub use self::postcard::PostcardCodec;
pub use stream::{decode_body, encode_body};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("postcard codec error: {0}")]
    Postcard(#[from] ::postcard::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Custom(String),
}

/// Serializes a value onto a byte sink.
pub trait Encoder {
    fn encode<T>(&self, writer: &mut dyn Write, value: &T) -> Result<(), CodecError>
    where
        T: Serialize + ?Sized;
}

/// Deserializes a value of the caller's chosen type from a byte source.
pub trait Decoder {
    fn decode<T>(&self, reader: &mut dyn Read) -> Result<T, CodecError>
    where
        T: DeserializeOwned;
}

/// A payload format usable by servers and clients.
///
/// Implemented for every `Encoder + Decoder` that can be shared across tasks.
pub trait Codec: Encoder + Decoder + Clone + Send + Sync + 'static {}

impl<T> Codec for T where T: Encoder + Decoder + Clone + Send + Sync + 'static {}
