//! Experiment-info payload: an "unset" bit or a value for each field,
//! strings length-prefixed.

use bytes::{Buf, BufMut, BytesMut};

use super::{need, CodecError};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperimentInfo {
	pub experiment_id: Option<u64>,
	pub subject_id: Option<u64>,
	pub subject_name: Option<String>,
	pub subject_age: Option<u32>,
	pub subject_gender: Option<u8>,
	pub lab_id: Option<u64>,
	pub lab_name: Option<String>,
	pub technician_id: Option<u64>,
	pub technician_name: Option<String>,
	/// Session date, as a raw `Time` value (see `crate::time::Time`).
	pub date: Option<u64>,
}

fn put_opt_u64(dst: &mut BytesMut, v: Option<u64>) {
	match v {
		Some(v) => {
			dst.put_u8(1);
			dst.put_u64_le(v);
		}
		None => dst.put_u8(0),
	}
}

fn get_opt_u64(mut src: &[u8], rest: &mut &[u8], what: &'static str) -> Result<Option<u64>, CodecError> {
	need(&src, 1, what)?;
	let present = src.get_u8() != 0;
	if present {
		need(&src, 8, what)?;
		let v = src.get_u64_le();
		*rest = src;
		Ok(Some(v))
	} else {
		*rest = src;
		Ok(None)
	}
}

fn put_opt_u32(dst: &mut BytesMut, v: Option<u32>) {
	match v {
		Some(v) => {
			dst.put_u8(1);
			dst.put_u32_le(v);
		}
		None => dst.put_u8(0),
	}
}

fn get_opt_u32(mut src: &[u8], rest: &mut &[u8], what: &'static str) -> Result<Option<u32>, CodecError> {
	need(&src, 1, what)?;
	let present = src.get_u8() != 0;
	if present {
		need(&src, 4, what)?;
		let v = src.get_u32_le();
		*rest = src;
		Ok(Some(v))
	} else {
		*rest = src;
		Ok(None)
	}
}

fn put_opt_u8(dst: &mut BytesMut, v: Option<u8>) {
	match v {
		Some(v) => {
			dst.put_u8(1);
			dst.put_u8(v);
		}
		None => dst.put_u8(0),
	}
}

fn get_opt_u8(mut src: &[u8], rest: &mut &[u8], what: &'static str) -> Result<Option<u8>, CodecError> {
	need(&src, 1, what)?;
	let present = src.get_u8() != 0;
	if present {
		need(&src, 1, what)?;
		let v = src.get_u8();
		*rest = src;
		Ok(Some(v))
	} else {
		*rest = src;
		Ok(None)
	}
}

fn put_opt_str(dst: &mut BytesMut, v: &Option<String>) {
	match v {
		Some(s) => {
			dst.put_u8(1);
			let bytes = s.as_bytes();
			dst.put_u32_le(bytes.len() as u32);
			dst.put_slice(bytes);
		}
		None => dst.put_u8(0),
	}
}

fn get_opt_str(mut src: &[u8], rest: &mut &[u8], what: &'static str) -> Result<Option<String>, CodecError> {
	need(&src, 1, what)?;
	let present = src.get_u8() != 0;
	if !present {
		*rest = src;
		return Ok(None);
	}
	need(&src, 4, what)?;
	let len = src.get_u32_le() as usize;
	need(&src, len, what)?;
	let mut buf = vec![0u8; len];
	src.copy_to_slice(&mut buf);
	*rest = src;
	String::from_utf8(buf)
		.map(Some)
		.map_err(|_| CodecError::Malformed { what })
}

impl ExperimentInfo {
	pub fn encode(&self, dst: &mut BytesMut) {
		put_opt_u64(dst, self.experiment_id);
		put_opt_u64(dst, self.subject_id);
		put_opt_str(dst, &self.subject_name);
		put_opt_u32(dst, self.subject_age);
		put_opt_u8(dst, self.subject_gender);
		put_opt_u64(dst, self.lab_id);
		put_opt_str(dst, &self.lab_name);
		put_opt_u64(dst, self.technician_id);
		put_opt_str(dst, &self.technician_name);
		put_opt_u64(dst, self.date);
	}

	pub fn decode(src: &[u8]) -> Result<Self, CodecError> {
		let mut rest = src;
		let experiment_id = get_opt_u64(rest, &mut rest, "experiment id")?;
		let subject_id = get_opt_u64(rest, &mut rest, "subject id")?;
		let subject_name = get_opt_str(rest, &mut rest, "subject name")?;
		let subject_age = get_opt_u32(rest, &mut rest, "subject age")?;
		let subject_gender = get_opt_u8(rest, &mut rest, "subject gender")?;
		let lab_id = get_opt_u64(rest, &mut rest, "lab id")?;
		let lab_name = get_opt_str(rest, &mut rest, "lab name")?;
		let technician_id = get_opt_u64(rest, &mut rest, "technician id")?;
		let technician_name = get_opt_str(rest, &mut rest, "technician name")?;
		let date = get_opt_u64(rest, &mut rest, "experiment date")?;

		Ok(Self {
			experiment_id,
			subject_id,
			subject_name,
			subject_age,
			subject_gender,
			lab_id,
			lab_name,
			technician_id,
			technician_name,
			date,
		})
	}
}
