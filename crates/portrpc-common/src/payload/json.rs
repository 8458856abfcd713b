use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{CodecError, Decoder, Encoder};

/// JSON payloads via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Encoder for JsonCodec {
    fn encode<T>(&self, writer: &mut dyn Write, value: &T) -> Result<(), CodecError>
    where
        T: Serialize + ?Sized,
    {
        Ok(serde_json::to_writer(writer, value)?)
    }
}

impl Decoder for JsonCodec {
    fn decode<T>(&self, reader: &mut dyn Read) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pair {
        a: i64,
        b: i64,
    }

    #[test]
    fn test_json_codec_round_trip() {
        let mut buf = Vec::new();
        JsonCodec.encode(&mut buf, &Pair { a: 10, b: 15 }).unwrap();
        assert_eq!(buf, br#"{"a":10,"b":15}"#);

        let decoded: Pair = JsonCodec.decode(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, Pair { a: 10, b: 15 });
    }

    #[test]
    fn test_json_codec_rejects_wrong_shape() {
        let data = br#"{"a":"ten"}"#;
        let result: Result<Pair, _> = JsonCodec.decode(&mut &data[..]);
        assert!(matches!(result, Err(CodecError::Json(_))));
    }
}
