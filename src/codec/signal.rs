//! Signal stream payloads: one header chunk, then any number of buffer
//! chunks, optionally terminated by an empty end marker.

use bytes::{Buf, BufMut, BytesMut};

use super::{need, CodecError};

#[derive(Debug, Clone, PartialEq)]
pub struct SignalHeader {
	pub sampling_hz: u64,
	pub channel_names: Vec<String>,
	pub samples_per_block: u32,
	/// `(unit_code, scale_code)` per channel, if the driver provided units.
	pub channel_units: Option<Vec<(f64, f64)>>,
	pub channel_gains: Option<Vec<f32>>,
}

impl SignalHeader {
	pub fn channels(&self) -> usize {
		self.channel_names.len()
	}

	pub fn encode(&self, dst: &mut BytesMut) {
		dst.put_u64_le(self.sampling_hz);
		dst.put_u16_le(self.channel_names.len() as u16);
		dst.put_u32_le(self.samples_per_block);

		for name in &self.channel_names {
			let bytes = name.as_bytes();
			dst.put_u16_le(bytes.len() as u16);
			dst.put_slice(bytes);
		}

		match &self.channel_units {
			Some(units) => {
				dst.put_u8(1);
				for (unit_code, scale_code) in units {
					dst.put_f64_le(*unit_code);
					dst.put_f64_le(*scale_code);
				}
			}
			None => dst.put_u8(0),
		}

		match &self.channel_gains {
			Some(gains) => {
				dst.put_u8(1);
				for gain in gains {
					dst.put_f32_le(*gain);
				}
			}
			None => dst.put_u8(0),
		}

		// Channel-localisation matrix: reserved, always absent in this core.
		dst.put_u8(0);
	}

	pub fn decode(mut src: &[u8]) -> Result<Self, CodecError> {
		need(&src, 8 + 2 + 4, "signal header")?;
		let sampling_hz = src.get_u64_le();
		let channels = src.get_u16_le() as usize;
		let samples_per_block = src.get_u32_le();

		let mut channel_names = Vec::with_capacity(channels);
		for _ in 0..channels {
			need(&src, 2, "signal header channel name length")?;
			let len = src.get_u16_le() as usize;
			need(&src, len, "signal header channel name")?;
			let mut buf = vec![0u8; len];
			src.copy_to_slice(&mut buf);
			let name = String::from_utf8(buf).map_err(|_| CodecError::Malformed {
				what: "signal header channel name (invalid UTF-8)",
			})?;
			channel_names.push(name);
		}

		need(&src, 1, "signal header units flag")?;
		let channel_units = if src.get_u8() != 0 {
			let mut units = Vec::with_capacity(channels);
			for _ in 0..channels {
				need(&src, 16, "signal header unit entry")?;
				let unit_code = src.get_f64_le();
				let scale_code = src.get_f64_le();
				units.push((unit_code, scale_code));
			}
			Some(units)
		} else {
			None
		};

		need(&src, 1, "signal header gains flag")?;
		let channel_gains = if src.get_u8() != 0 {
			let mut gains = Vec::with_capacity(channels);
			for _ in 0..channels {
				need(&src, 4, "signal header gain entry")?;
				gains.push(src.get_f32_le());
			}
			Some(gains)
		} else {
			None
		};

		need(&src, 1, "signal header localisation flag")?;
		let _localisation_reserved = src.get_u8();

		Ok(Self {
			sampling_hz,
			channel_names,
			samples_per_block,
			channel_units,
			channel_gains,
		})
	}
}

/// Encode a `channels x samples_per_block` buffer, channel-major.
pub fn encode_buffer(dst: &mut BytesMut, buffer: &[f64]) {
	dst.reserve(buffer.len() * 8);
	for v in buffer {
		dst.put_f64_le(*v);
	}
}

pub fn decode_buffer(mut src: &[u8], channels: usize, samples_per_block: u32) -> Result<Vec<f64>, CodecError> {
	let expected = channels * samples_per_block as usize;
	need(&src, expected * 8, "signal buffer")?;
	let mut out = Vec::with_capacity(expected);
	for _ in 0..expected {
		out.push(src.get_f64_le());
	}
	Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
	HeaderReceived(SignalHeader),
	BufferReceived(Vec<f64>),
	EndReceived,
}

/// Stateful decoder that tells a header chunk from a buffer chunk from the
/// empty end marker by tracking whether the header has been seen yet, since
/// the wire itself carries no chunk-kind tag.
pub struct SignalChunkDecoder {
	channels: usize,
	samples_per_block: u32,
	header_received: bool,
}

impl SignalChunkDecoder {
	pub fn new() -> Self {
		Self {
			channels: 0,
			samples_per_block: 0,
			header_received: false,
		}
	}

	pub fn decode_chunk(&mut self, payload: &[u8]) -> Result<SignalEvent, CodecError> {
		if !self.header_received {
			let header = SignalHeader::decode(payload)?;
			self.channels = header.channels();
			self.samples_per_block = header.samples_per_block;
			self.header_received = true;
			return Ok(SignalEvent::HeaderReceived(header));
		}

		if payload.is_empty() {
			return Ok(SignalEvent::EndReceived);
		}

		let buffer = decode_buffer(payload, self.channels, self.samples_per_block)?;
		Ok(SignalEvent::BufferReceived(buffer))
	}
}

impl Default for SignalChunkDecoder {
	fn default() -> Self {
		Self::new()
	}
}
