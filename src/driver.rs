//! Device driver contract, plus two reference drivers (`GeneratorDriver`,
//! `ReplayDriver`) that ground the contract concretely and serve as test
//! fixtures. Neither talks to real hardware.

use std::error::Error as StdError;
use std::fmt;
use std::ops::Range;

use crate::codec::SignalHeader;
use crate::stim::StimulationSet;

#[derive(Debug)]
pub enum DriverError {
	Other(Box<dyn StdError + Send + Sync>),
}

impl fmt::Display for DriverError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::Other(e) => write!(f, "driver error: {}", e),
		}
	}
}

impl StdError for DriverError {
	fn source(&self) -> Option<&(dyn StdError + 'static)> {
		match self {
			Self::Other(e) => Some(e.as_ref()),
		}
	}
}

/// Callback surface a driver pushes samples and stimulations through.
/// Implemented by the pipeline; passed to `Driver::initialize` as a borrow
/// scoped to the session, avoiding the shared-ownership cycle the original
/// driver/context pairing needed.
pub trait PipelineCallback {
	fn set_samples(&mut self, buf: &[f64], count: usize);
	fn set_stimulation_set(&mut self, set: &StimulationSet);
}

/// Required interface for any device driver. The pipeline promises: exactly
/// one active driver at a time, never calls `poll` before `start`, never
/// mutates driver state from another task.
pub trait Driver: Send {
	fn initialize(&mut self, samples_per_block: u32, callback: &mut dyn PipelineCallback) -> Result<(), DriverError>;

	/// Valid only after a successful `initialize`.
	fn header(&self) -> &SignalHeader;

	fn start(&mut self) -> Result<(), DriverError>;

	/// One non-blocking iteration. Returns whether it produced data. An
	/// `Err` is irrecoverable.
	fn poll(&mut self, callback: &mut dyn PipelineCallback) -> Result<bool, DriverError>;

	fn stop(&mut self);
	fn uninitialize(&mut self);

	fn is_configurable(&self) -> bool {
		false
	}

	fn impedance(&self, _channel: usize) -> Option<f64> {
		None
	}

	fn channel_units(&self) -> Option<Vec<(u16, u16)>> {
		None
	}
}

/// A synthetic per-sample waveform, evaluated at an absolute sample index.
#[derive(Debug, Clone)]
pub enum Waveform {
	Constant(f64),
	/// `value(n) = start + step * n`.
	Ramp { start: f64, step: f64 },
}

impl Waveform {
	fn value_at(&self, sample_index: u64) -> f64 {
		match self {
			Self::Constant(v) => *v,
			Self::Ramp { start, step } => start + step * sample_index as f64,
		}
	}
}

/// A half-open sample-index range over which the named channels are
/// forced to `NaN`, used to exercise the NaN-replacement policy.
#[derive(Debug, Clone)]
pub struct NanBurst {
	pub channels: Vec<usize>,
	pub samples: Range<u64>,
}

/// Deterministic synthetic signal source. Produces one value per channel per
/// sample from a single `Waveform`, with optional `NanBurst`s overlaid.
pub struct GeneratorDriver {
	channels: usize,
	sampling_hz: u64,
	samples_per_block: u32,
	waveform: Waveform,
	nan_bursts: Vec<NanBurst>,
	samples_per_poll: u64,
	total_samples: Option<u64>,
	header: Option<SignalHeader>,
	produced: u64,
	real_time_paced: bool,
	wall_start: Option<std::time::Instant>,
	actual_sampling_hz: u64,
}

impl GeneratorDriver {
	pub fn new(channels: usize, sampling_hz: u64, waveform: Waveform) -> Self {
		Self {
			channels,
			sampling_hz,
			samples_per_block: 0,
			waveform,
			nan_bursts: Vec::new(),
			samples_per_poll: 1,
			total_samples: None,
			header: None,
			produced: 0,
			real_time_paced: false,
			wall_start: None,
			actual_sampling_hz: sampling_hz,
		}
	}

	pub fn with_nan_burst(mut self, burst: NanBurst) -> Self {
		self.nan_bursts.push(burst);
		self
	}

	pub fn with_samples_per_poll(mut self, n: u64) -> Self {
		self.samples_per_poll = n.max(1);
		self
	}

	pub fn with_total_samples(mut self, n: u64) -> Self {
		self.total_samples = Some(n);
		self
	}

	/// Instead of handing over `samples_per_poll` samples on every call, only
	/// release the samples that should exist by now given wall-clock elapsed
	/// time and `actual_sampling_hz` -- for exercising drift/skew scenarios
	/// against a real clock instead of a hand-fed schedule.
	pub fn with_real_time_pacing(mut self, actual_sampling_hz: u64) -> Self {
		self.real_time_paced = true;
		self.actual_sampling_hz = actual_sampling_hz;
		self
	}

	fn is_nan_forced(&self, channel: usize, sample_index: u64) -> bool {
		self.nan_bursts
			.iter()
			.any(|b| b.channels.contains(&channel) && b.samples.contains(&sample_index))
	}
}

impl Driver for GeneratorDriver {
	fn initialize(&mut self, samples_per_block: u32, _callback: &mut dyn PipelineCallback) -> Result<(), DriverError> {
		self.samples_per_block = samples_per_block;
		self.header = Some(SignalHeader {
			sampling_hz: self.sampling_hz,
			channel_names: (0..self.channels).map(|i| format!("Ch{}", i)).collect(),
			samples_per_block,
			channel_units: None,
			channel_gains: None,
		});
		Ok(())
	}

	fn header(&self) -> &SignalHeader {
		self.header.as_ref().expect("initialize must be called before header()")
	}

	fn start(&mut self) -> Result<(), DriverError> {
		self.wall_start = Some(std::time::Instant::now());
		Ok(())
	}

	fn poll(&mut self, callback: &mut dyn PipelineCallback) -> Result<bool, DriverError> {
		if let Some(total) = self.total_samples {
			if self.produced >= total {
				return Ok(false);
			}
		}

		let mut remaining = self.samples_per_poll;
		if self.real_time_paced {
			let elapsed = self.wall_start.map(|s| s.elapsed()).unwrap_or_default();
			let due = (elapsed.as_secs_f64() * self.actual_sampling_hz as f64) as u64;
			let available = due.saturating_sub(self.produced);
			remaining = remaining.min(available);
		}
		if let Some(total) = self.total_samples {
			remaining = remaining.min(total - self.produced);
		}
		if remaining == 0 {
			return Ok(false);
		}

		let mut buf = Vec::with_capacity((remaining as usize) * self.channels);
		for i in 0..remaining {
			let sample_index = self.produced + i;
			let value = self.waveform.value_at(sample_index);
			for ch in 0..self.channels {
				if self.is_nan_forced(ch, sample_index) {
					buf.push(f64::NAN);
				} else {
					buf.push(value);
				}
			}
		}

		self.produced += remaining;
		callback.set_samples(&buf, remaining as usize);
		Ok(true)
	}

	fn stop(&mut self) {}

	fn uninitialize(&mut self) {
		self.header = None;
		self.produced = 0;
	}
}

/// Plays back a pre-recorded `Vec<Vec<f64>>` (one inner vector per sample,
/// channel-major) at the declared rate. `schedule` lets a test deliver a
/// different sample count per `poll()` than the driver declared, to exercise
/// drift correction without a real clock.
pub struct ReplayDriver {
	channels: usize,
	sampling_hz: u64,
	samples_per_block: u32,
	frames: Vec<Vec<f64>>,
	schedule: Vec<usize>,
	header: Option<SignalHeader>,
	cursor: usize,
	poll_index: usize,
}

impl ReplayDriver {
	/// `frames` are channel-major per-sample vectors, each of length `channels`.
	pub fn new(channels: usize, sampling_hz: u64, frames: Vec<Vec<f64>>) -> Self {
		Self {
			channels,
			sampling_hz,
			samples_per_block: 0,
			frames,
			schedule: Vec::new(),
			header: None,
			cursor: 0,
			poll_index: 0,
		}
	}

	/// Override how many samples are delivered on each successive `poll()`
	/// call; once exhausted, falls back to delivering one sample per call.
	/// Used to simulate a driver that delivers more or fewer samples than
	/// its declared rate over a span of wall-clock time.
	pub fn with_poll_schedule(mut self, schedule: Vec<usize>) -> Self {
		self.schedule = schedule;
		self
	}
}

impl Driver for ReplayDriver {
	fn initialize(&mut self, samples_per_block: u32, _callback: &mut dyn PipelineCallback) -> Result<(), DriverError> {
		self.samples_per_block = samples_per_block;
		self.header = Some(SignalHeader {
			sampling_hz: self.sampling_hz,
			channel_names: (0..self.channels).map(|i| format!("Ch{}", i)).collect(),
			samples_per_block,
			channel_units: None,
			channel_gains: None,
		});
		Ok(())
	}

	fn header(&self) -> &SignalHeader {
		self.header.as_ref().expect("initialize must be called before header()")
	}

	fn start(&mut self) -> Result<(), DriverError> {
		Ok(())
	}

	fn poll(&mut self, callback: &mut dyn PipelineCallback) -> Result<bool, DriverError> {
		if self.cursor >= self.frames.len() {
			return Ok(false);
		}

		let want = self
			.schedule
			.get(self.poll_index)
			.copied()
			.unwrap_or(1)
			.min(self.frames.len() - self.cursor);
		self.poll_index += 1;
		if want == 0 {
			return Ok(false);
		}

		let mut buf = Vec::with_capacity(want * self.channels);
		for frame in &self.frames[self.cursor..self.cursor + want] {
			assert_eq!(frame.len(), self.channels, "replay frame channel count mismatch");
			buf.extend_from_slice(frame);
		}
		self.cursor += want;

		callback.set_samples(&buf, want);
		Ok(true)
	}

	fn stop(&mut self) {}

	fn uninitialize(&mut self) {
		self.header = None;
		self.cursor = 0;
		self.poll_index = 0;
	}
}
