//! Framing of requests and replies on the wire.
//!
//! A [`Codec`] turns a payload into bytes for the socket, and carves complete frames back out of
//! whatever has been read so far. Two framings are provided: [`LengthHeaderCodec`] (the default)
//! and [`CrLfCodec`].

use std::{fmt, io};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dyn_clone::DynClone;
use serde::{Deserialize, Serialize};

/// Encodes outbound payloads and decodes inbound frames.
///
/// Codecs are cloned into every connection a factory produces, so they should hold configuration
/// only.
pub trait Codec: DynClone + fmt::Debug + Send + Sync + 'static {
    /// Appends the framed payload to `dst`.
    fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> io::Result<()>;

    /// Splits the next complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. An error means the stream can no longer be
    /// decoded and the connection must be closed.
    fn decode(&self, src: &mut BytesMut) -> io::Result<Option<Bytes>>;
}

dyn_clone::clone_trait_object!(Codec);

/// A boxed codec.
pub type BoxCodec = Box<dyn Codec>;

/// Frames prefixed with their length as a 4 byte big-endian integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LengthHeaderCodec {
    max_frame_len: usize,
}

impl LengthHeaderCodec {
    /// Default upper bound on a frame body.
    pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

    /// Creates a codec rejecting frames larger than `max_frame_len`.
    pub fn new(max_frame_len: usize) -> Self {
        LengthHeaderCodec { max_frame_len }
    }
}

impl Default for LengthHeaderCodec {
    fn default() -> Self {
        LengthHeaderCodec::new(Self::DEFAULT_MAX_FRAME_LEN)
    }
}

impl Codec for LengthHeaderCodec {
    fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        if payload.len() > self.max_frame_len || payload.len() > u32::MAX as usize {
            return Err(frame_too_large(payload.len(), self.max_frame_len));
        }
        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(payload);
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_len {
            return Err(frame_too_large(len, self.max_frame_len));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        Ok(Some(src.split_to(len).freeze()))
    }
}

/// Frames terminated by `\r\n`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CrLfCodec {
    max_frame_len: usize,
}

impl CrLfCodec {
    /// Default upper bound on a frame body.
    pub const DEFAULT_MAX_FRAME_LEN: usize = 2048;

    /// Creates a codec rejecting frames larger than `max_frame_len`.
    pub fn new(max_frame_len: usize) -> Self {
        CrLfCodec { max_frame_len }
    }
}

impl Default for CrLfCodec {
    fn default() -> Self {
        CrLfCodec::new(Self::DEFAULT_MAX_FRAME_LEN)
    }
}

impl Codec for CrLfCodec {
    fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        if payload.len() > self.max_frame_len {
            return Err(frame_too_large(payload.len(), self.max_frame_len));
        }
        if payload.windows(2).any(|w| w == b"\r\n") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "payload contains a frame terminator",
            ));
        }
        dst.reserve(payload.len() + 2);
        dst.put_slice(payload);
        dst.put_slice(b"\r\n");
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        match src.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => {
                if pos > self.max_frame_len {
                    return Err(frame_too_large(pos, self.max_frame_len));
                }
                let frame = src.split_to(pos).freeze();
                src.advance(2);
                Ok(Some(frame))
            }
            // The terminator may straddle reads, so one extra byte is tolerated.
            None if src.len() > self.max_frame_len + 1 => {
                Err(frame_too_large(src.len(), self.max_frame_len))
            }
            None => Ok(None),
        }
    }
}

/// Serializable codec selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CodecConfig {
    /// See [`LengthHeaderCodec`].
    LengthHeader {
        /// Maximum frame body length.
        #[serde(default = "default_length_header_max")]
        max_frame_len: usize,
    },
    /// See [`CrLfCodec`].
    CrLf {
        /// Maximum frame body length.
        #[serde(default = "default_crlf_max")]
        max_frame_len: usize,
    },
}

impl CodecConfig {
    /// Builds the configured codec.
    pub fn build(&self) -> BoxCodec {
        match *self {
            CodecConfig::LengthHeader { max_frame_len } => {
                Box::new(LengthHeaderCodec::new(max_frame_len))
            }
            CodecConfig::CrLf { max_frame_len } => Box::new(CrLfCodec::new(max_frame_len)),
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig::LengthHeader {
            max_frame_len: LengthHeaderCodec::DEFAULT_MAX_FRAME_LEN,
        }
    }
}

fn default_length_header_max() -> usize {
    LengthHeaderCodec::DEFAULT_MAX_FRAME_LEN
}

fn default_crlf_max() -> usize {
    CrLfCodec::DEFAULT_MAX_FRAME_LEN
}

fn frame_too_large(len: usize, max: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame of {len} bytes exceeds maximum of {max}"),
    )
}
