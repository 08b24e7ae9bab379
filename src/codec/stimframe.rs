//! Stimulation stream payload: `count:u32` followed by that many
//! `{id:u64, date:u64, duration:u64}` records.

use bytes::{Buf, BufMut, BytesMut};

use crate::stim::Stimulation;
use crate::time::Time;

use super::{need, CodecError};

pub fn encode_stimulation_chunk(dst: &mut BytesMut, entries: &[Stimulation]) {
	dst.reserve(4 + entries.len() * 24);
	dst.put_u32_le(entries.len() as u32);
	for entry in entries {
		dst.put_u64_le(entry.id);
		dst.put_u64_le(entry.date.raw());
		dst.put_u64_le(entry.duration.raw());
	}
}

pub fn decode_stimulation_chunk(mut src: &[u8]) -> Result<Vec<Stimulation>, CodecError> {
	need(&src, 4, "stimulation chunk count")?;
	let count = src.get_u32_le() as usize;
	let mut out = Vec::with_capacity(count);
	for _ in 0..count {
		need(&src, 24, "stimulation record")?;
		let id = src.get_u64_le();
		let date = Time::from_raw(src.get_u64_le());
		let duration = Time::from_raw(src.get_u64_le());
		out.push(Stimulation { id, date, duration });
	}
	Ok(out)
}
