//! Binary wire codecs for the three broadcast streams (signal, stimulation,
//! experiment info), all little-endian regardless of host, all framed the
//! same way: a `u64` length prefix followed by that many payload bytes. The
//! payload layouts themselves differ per stream and are implemented in the
//! sibling modules.
//!
//! The framing/payload split mirrors `sbx::frame`'s small structs with
//! explicit `read`/`write` over `bytes::{Buf, BufMut}`; the `Framed`-adapter
//! half mirrors `relay::frame::FrameCodec`.

use std::fmt;
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub mod signal;
pub mod stimframe;
pub mod expinfo;

pub use expinfo::ExperimentInfo;
pub use signal::{SignalChunkDecoder, SignalEvent, SignalHeader};
pub use stimframe::{decode_stimulation_chunk, encode_stimulation_chunk};

#[derive(Debug)]
pub enum CodecError {
	Io(io::Error),
	Truncated { what: &'static str },
	Malformed { what: &'static str },
}

impl fmt::Display for CodecError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::Io(e) => write!(f, "I/O error: {}", e),
			Self::Truncated { what } => write!(f, "truncated while decoding {}", what),
			Self::Malformed { what } => write!(f, "malformed {}", what),
		}
	}
}

impl std::error::Error for CodecError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Self::Io(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for CodecError {
	fn from(e: io::Error) -> Self {
		Self::Io(e)
	}
}

pub(crate) fn need(buf: &impl Buf, n: usize, what: &'static str) -> Result<(), CodecError> {
	if buf.remaining() < n {
		Err(CodecError::Truncated { what })
	} else {
		Ok(())
	}
}

/// Write the `u64`-length-prefixed frame for `payload` into `dst`.
pub fn write_frame(dst: &mut BytesMut, payload: &[u8]) {
	dst.reserve(8 + payload.len());
	dst.put_u64_le(payload.len() as u64);
	dst.put_slice(payload);
}

/// Try to pull one complete length-prefixed frame's payload out of `src`,
/// advancing past it. Returns `Ok(None)` if more bytes are needed.
pub fn read_frame(src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
	if src.len() < 8 {
		return Ok(None);
	}
	let mut len_bytes = [0u8; 8];
	len_bytes.copy_from_slice(&src[..8]);
	let len = u64::from_le_bytes(len_bytes) as usize;

	if src.len() < 8 + len {
		src.reserve(8 + len - src.len());
		return Ok(None);
	}

	src.advance(8);
	let payload = src.split_to(len).freeze();
	Ok(Some(payload))
}

/// `tokio_util::codec` adapter for the `u64`-length-prefixed chunk framing.
/// Used to run the framing over a real `TcpStream` via `Framed`; the chunk
/// payload itself is left opaque here (callers encode/decode with the
/// sibling modules) since a client determines payload kind from stream
/// position, not from an in-band tag (see `SignalChunkDecoder`).
pub struct ChunkCodec;

impl Decoder for ChunkCodec {
	type Item = Bytes;
	type Error = CodecError;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		read_frame(src)
	}
}

impl Encoder<&[u8]> for ChunkCodec {
	type Error = CodecError;

	fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
		write_frame(dst, item);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn read_frame_returns_none_when_incomplete() {
		let mut buf = BytesMut::new();
		buf.put_u64_le(10);
		buf.put_slice(&[1, 2, 3]);
		assert!(read_frame(&mut buf).unwrap().is_none());
	}

	#[test]
	fn write_then_read_frame_round_trips() {
		let mut buf = BytesMut::new();
		write_frame(&mut buf, b"hello");
		let payload = read_frame(&mut buf).unwrap().unwrap();
		assert_eq!(&payload[..], b"hello");
		assert!(buf.is_empty());
	}

	#[test]
	fn read_frame_leaves_trailing_bytes_for_next_call() {
		let mut buf = BytesMut::new();
		write_frame(&mut buf, b"one");
		write_frame(&mut buf, b"two");
		let first = read_frame(&mut buf).unwrap().unwrap();
		assert_eq!(&first[..], b"one");
		let second = read_frame(&mut buf).unwrap().unwrap();
		assert_eq!(&second[..], b"two");
	}
}
