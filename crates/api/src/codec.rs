//! Wire framing for the control channel.
//!
//! Messages are length-prefixed JSON frames.  The typed [`Encoder`] and
//! [`Decoder`] wrap a length-delimited codec so each side of the channel
//! reads and writes exactly its own message type; a frame that does not
//! deserialize is a protocol error, not a panic.

use std::marker::PhantomData;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::LengthDelimitedCodec;

/// Frames larger than this are rejected outright.  Configuration documents
/// and ruleset listings fit comfortably; anything bigger is a protocol
/// error or an attack.
const MAX_FRAME: usize = 8 * 1024 * 1024;

/// JSON-decode frames into `D`.
pub struct Decoder<D> {
    inner: LengthDelimitedCodec,
    _decode_type: PhantomData<D>,
}

/// JSON-encode `E` into frames.
pub struct Encoder<E> {
    inner: LengthDelimitedCodec,
    _encode_type: PhantomData<E>,
}

fn length_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME)
        .new_codec()
}

impl<D> Default for Decoder<D> {
    fn default() -> Self {
        Self {
            inner: length_codec(),
            _decode_type: PhantomData,
        }
    }
}

impl<E> Default for Encoder<E> {
    fn default() -> Self {
        Self {
            inner: length_codec(),
            _encode_type: PhantomData,
        }
    }
}

impl<D: serde::de::DeserializeOwned> tokio_util::codec::Decoder for Decoder<D> {
    type Error = std::io::Error;
    type Item = D;

    fn decode(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<D>> {
        let Some(frame) = self.inner.decode(buf)? else {
            return Ok(None);
        };
        let msg = serde_json::from_slice(&frame).map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "could not deserialize {}: {err}",
                    std::any::type_name::<D>()
                ),
            )
        })?;
        Ok(Some(msg))
    }
}

impl<E: serde::Serialize> tokio_util::codec::Encoder<&E> for Encoder<E> {
    type Error = std::io::Error;

    fn encode(&mut self, msg: &E, buf: &mut BytesMut) -> std::io::Result<()> {
        let bytes = serde_json::to_vec(msg).map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("could not serialize {}: {err}", std::any::type_name::<E>()),
            )
        })?;
        self.inner.encode(Bytes::from(bytes), buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    use crate::msg::{Op, Request};

    #[test]
    fn frames_round_trip() {
        let request = Request {
            id: 3,
            token: None,
            deadline_secs: None,
            client_addr: None,
            op: Op::Health,
        };

        let mut buf = BytesMut::new();
        Encoder::default().encode(&request, &mut buf).unwrap();

        let decoded: Request = Decoder::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let request = Request {
            id: 3,
            token: None,
            deadline_secs: None,
            client_addr: None,
            op: Op::Health,
        };

        let mut buf = BytesMut::new();
        Encoder::default().encode(&request, &mut buf).unwrap();
        let mut partial = buf.split_to(buf.len() - 1);

        let mut decoder = Decoder::<Request>::default();
        assert!(decoder.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert!(decoder.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn garbage_frames_error_instead_of_panicking() {
        let mut buf = BytesMut::new();
        let mut lengths = length_codec();
        lengths
            .encode(Bytes::from_static(b"not json"), &mut buf)
            .unwrap();

        let mut decoder = Decoder::<Request>::default();
        assert!(decoder.decode(&mut buf).is_err());
    }
}
