//! Length-delimited bincode codec for edge TCP streams.
//!
//! Wire format: 4-byte big-endian length prefix + bincode payload.
//! One codec type decodes a single frame type `D` and encodes anything
//! serializable, so the server side can read `Handshake` then `Packet` while
//! writing `HandshakeReply` then `Packet` over the same `Framed` stream.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::packet::Packet;
use crate::{ProtocolError, MAX_FRAME_BYTES};

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec for framing values over a byte stream.
pub struct FrameCodec<D> {
    _decodes: PhantomData<fn() -> D>,
}

/// Codec for the post-handshake packet stream.
pub type PacketCodec = FrameCodec<Packet>;

impl<D> FrameCodec<D> {
    pub fn new() -> Self {
        Self {
            _decodes: PhantomData,
        }
    }
}

impl<D> Default for FrameCodec<D> {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize a value into a complete frame (prefix included).
pub fn encode_frame<T: Serialize>(item: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload = bincode::serialize(item)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

impl<D: DeserializeOwned> Decoder for FrameCodec<D> {
    type Item = D;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_BYTES,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let frame = src.split_to(length);

        let item: D = bincode::deserialize(&frame)?;
        Ok(Some(item))
    }
}

impl<D, T: Serialize> Encoder<T> for FrameCodec<D> {
    type Error = ProtocolError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&item)?;

        if payload.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_BYTES,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}
