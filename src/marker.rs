//! Well-known stimulation ids reserved by the core. Values are preserved
//! verbatim from the system being distilled; nothing outside this module
//! should care what the numbers actually are.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[repr(u64)]
#[derive(IntoPrimitive, TryFromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
pub enum Marker {
	AddedSamplesBegin = 0x8502,
	AddedSamplesEnd = 0x8503,
	RemovedSamples = 0x8504,
	Artifact = 0x8600,
	NoArtifact = 0x8601,
}

impl Marker {
	pub fn id(self) -> u64 {
		self.into()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::convert::TryFrom;

	#[test]
	fn round_trips_through_raw_id() {
		for m in [
			Marker::AddedSamplesBegin,
			Marker::AddedSamplesEnd,
			Marker::RemovedSamples,
			Marker::Artifact,
			Marker::NoArtifact,
		] {
			let raw = m.id();
			assert_eq!(Marker::try_from(raw).unwrap(), m);
		}
	}
}
