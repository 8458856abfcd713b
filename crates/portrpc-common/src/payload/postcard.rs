use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{CodecError, Decoder, Encoder};

/// Compact binary payloads via `postcard`.
///
/// Postcard messages are not self-delimiting, so decoding consumes the
/// whole remaining stream as one message.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardCodec;

impl Encoder for PostcardCodec {
    fn encode<T>(&self, writer: &mut dyn Write, value: &T) -> Result<(), CodecError>
    where
        T: Serialize + ?Sized,
    {
        postcard::to_io(value, writer)?;
        Ok(())
    }
}

impl Decoder for PostcardCodec {
    fn decode<T>(&self, reader: &mut dyn Read) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(postcard::from_bytes(&buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Quotient {
        result: i64,
        remainder: Option<i64>,
    }

    #[test]
    fn test_postcard_codec_round_trip() {
        let value = Quotient { result: 5, remainder: Some(0) };
        let mut buf = Vec::new();
        PostcardCodec.encode(&mut buf, &value).unwrap();

        let decoded: Quotient = PostcardCodec.decode(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_postcard_codec_truncated_input() {
        let result: Result<Quotient, _> = PostcardCodec.decode(&mut &[][..]);
        assert!(matches!(result, Err(CodecError::Postcard(_))));
    }
}
