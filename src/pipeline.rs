//! Orchestrator: owns the driver handle, oversampler, NaN policy,
//! pending-buffer ring, plug-in hook dispatch and client fan-out; runs the
//! hot loop that ties them together.

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, oneshot};

use crate::codec;
use crate::codec::SignalHeader;
use crate::driver::{Driver, DriverError, PipelineCallback};
use crate::drift::{DriftConfig, DriftCorrector};
use crate::hooks::Hooks;
use crate::listener::PendingConnection;
use crate::session::ClientSession;
use crate::stim::StimulationSet;
use crate::time::Time;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NanPolicy {
	LastCorrectValue,
	Zero,
	Disabled,
}

#[derive(Debug)]
pub enum ServerError {
	Driver(DriverError),
	Timeout,
	BindFailed(std::io::Error),
	InternalInvariant(&'static str),
	HookRejectedStart,
}

impl fmt::Display for ServerError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::Driver(e) => write!(f, "driver error: {}", e),
			Self::Timeout => write!(f, "no data received from driver within the configured timeout"),
			Self::BindFailed(e) => write!(f, "failed to bind listening socket: {}", e),
			Self::InternalInvariant(what) => write!(f, "internal invariant violated: {}", what),
			Self::HookRejectedStart => write!(f, "a registered hook rejected start"),
		}
	}
}

impl StdError for ServerError {
	fn source(&self) -> Option<&(dyn StdError + 'static)> {
		match self {
			Self::Driver(e) => Some(e),
			Self::BindFailed(e) => Some(e),
			_ => None,
		}
	}
}

impl From<DriverError> for ServerError {
	fn from(e: DriverError) -> Self {
		Self::Driver(e)
	}
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
	pub oversampling_factor: u32,
	pub nan_policy: NanPolicy,
	pub drift: DriftConfig,
	/// > 0: sleep that many ms between empty polls; 0: yield; < 0: busy spin.
	pub started_driver_sleep_ms: i64,
	pub stopped_driver_sleep_ms: u64,
	pub driver_timeout: Duration,
	/// Sent once to each client right after the signal header, on subscribe.
	pub experiment_info: codec::ExperimentInfo,
}

impl Default for PipelineConfig {
	fn default() -> Self {
		Self {
			oversampling_factor: 1,
			nan_policy: NanPolicy::Disabled,
			drift: DriftConfig::default(),
			started_driver_sleep_ms: 0,
			stopped_driver_sleep_ms: 100,
			driver_timeout: Duration::from_secs(5),
			experiment_info: codec::ExperimentInfo::default(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
	Idle,
	Connected,
	Started,
}

/// Borrows the fields of `Pipeline` that the driver pushes into; constructed
/// fresh for each `poll`/`initialize` call so the driver never holds a
/// reference that outlives the call, per the one-way adaptation of the
/// source's driver/context cycle.
struct Producer<'a> {
	cfg: &'a PipelineConfig,
	channels: usize,
	rate: u32,
	ring: &'a mut VecDeque<Vec<f64>>,
	pending_stim: &'a mut StimulationSet,
	last_good: &'a mut Vec<f64>,
	bad_run_active: &'a mut bool,
	prev_input: &'a mut Vec<f64>,
	output_count: &'a mut u64,
	drift: &'a mut DriftCorrector,
	start_instant: Instant,
}

impl<'a> PipelineCallback for Producer<'a> {
	fn set_samples(&mut self, buf: &[f64], count: usize) {
		if count == 0 {
			return;
		}
		let factor = self.cfg.oversampling_factor.max(1);

		for i in 0..count {
			let curr = &buf[i * self.channels..(i + 1) * self.channels];

			for j in 0..factor {
				let frac = (j + 1) as f64 / factor as f64;
				let mut out_is_bad = false;
				let mut out_sample = Vec::with_capacity(self.channels);

				for ch in 0..self.channels {
					let prev_v = self.prev_input[ch];
					let curr_v = curr[ch];
					let mut v = prev_v + frac * (curr_v - prev_v);

					if !v.is_finite() {
						out_is_bad = true;
						v = match self.cfg.nan_policy {
							NanPolicy::Disabled => v,
							NanPolicy::Zero => 0.0,
							NanPolicy::LastCorrectValue => self.last_good[ch],
						};
					} else {
						self.last_good[ch] = v;
					}
					out_sample.push(v);
				}

				let date = Time::of_samples(self.rate, *self.output_count);
				if out_is_bad && !*self.bad_run_active {
					*self.bad_run_active = true;
					self.pending_stim.push_back(crate::marker::Marker::Artifact.id(), date, Time::ZERO);
					trace!("artifact run begins at {}", date.to_seconds());
				} else if !out_is_bad && *self.bad_run_active {
					*self.bad_run_active = false;
					self.pending_stim.push_back(crate::marker::Marker::NoArtifact.id(), date, Time::ZERO);
					trace!("artifact run ends at {}", date.to_seconds());
				}

				self.ring.push_back(out_sample);
				*self.output_count += 1;
			}

			for ch in 0..self.channels {
				// Only remember finite inputs: interpolating against a stale
				// `NaN` prev would poison the first good sample after a run.
				if curr[ch].is_finite() {
					self.prev_input[ch] = curr[ch];
				}
			}
		}

		let elapsed = Instant::now().saturating_duration_since(self.start_instant);
		self.drift.estimate_drift(Time::from_duration(elapsed), (count as u64) * factor as u64);
	}

	fn set_stimulation_set(&mut self, set: &StimulationSet) {
		let shift = Time::of_samples(self.rate, *self.output_count);
		self.pending_stim.append(set, shift);
	}
}

/// Mutable view of the samples about to be fanned out for one block, handed
/// to `Hooks::loop_hook` so a producing plug-in can alter values in place
/// before per-client projection and drift correction see them. Backed by the
/// same per-sample rows `Pipeline` itself keeps in its ring.
pub struct PendingRing<'a> {
	rows: &'a mut [Vec<f64>],
}

impl<'a> PendingRing<'a> {
	pub fn new(rows: &'a mut [Vec<f64>]) -> Self {
		Self { rows }
	}

	pub fn len(&self) -> usize {
		self.rows.len()
	}

	pub fn is_empty(&self) -> bool {
		self.rows.is_empty()
	}

	pub fn channels(&self) -> usize {
		self.rows.first().map_or(0, |row| row.len())
	}

	/// Per-channel values for sample `index` within this block.
	pub fn sample(&self, index: usize) -> &[f64] {
		&self.rows[index]
	}

	pub fn sample_mut(&mut self, index: usize) -> &mut [f64] {
		&mut self.rows[index]
	}
}

pub struct Pipeline {
	driver: Box<dyn Driver>,
	hooks: Box<dyn Hooks>,
	drift: DriftCorrector,
	cfg: PipelineConfig,

	state: PipelineState,
	channels: usize,
	rate: u32,
	samples_per_block: u32,
	header: Option<SignalHeader>,

	ring: VecDeque<Vec<f64>>,
	pending_stim: StimulationSet,
	last_good: Vec<f64>,
	bad_run_active: bool,
	prev_input: Vec<f64>,
	output_count: u64,
	blocks_emitted: u64,
	last_time: Time,

	clients: Vec<ClientSession>,
	pending_rx: mpsc::UnboundedReceiver<PendingConnection>,
	start_instant: Instant,
}

impl Pipeline {
	pub fn new(driver: Box<dyn Driver>, hooks: Box<dyn Hooks>, pending_rx: mpsc::UnboundedReceiver<PendingConnection>, cfg: PipelineConfig) -> Self {
		Self {
			driver,
			hooks,
			drift: DriftCorrector::new(cfg.drift),
			cfg,
			state: PipelineState::Idle,
			channels: 0,
			rate: 0,
			samples_per_block: 0,
			header: None,
			ring: VecDeque::new(),
			pending_stim: StimulationSet::new(),
			last_good: Vec::new(),
			bad_run_active: false,
			prev_input: Vec::new(),
			output_count: 0,
			blocks_emitted: 0,
			last_time: Time::ZERO,
			clients: Vec::new(),
			pending_rx,
			start_instant: Instant::now(),
		}
	}

	pub fn connect(&mut self, samples_per_block: u32) -> Result<(), ServerError> {
		// `initialize` needs a callback but produces no samples; a scratch
		// producer is enough to satisfy the trait.
		let mut scratch_ring = VecDeque::new();
		let mut scratch_stim = StimulationSet::new();
		let mut scratch_good = Vec::new();
		let mut scratch_bad = false;
		let mut scratch_prev = Vec::new();
		let mut scratch_count = 0u64;
		let mut producer = Producer {
			cfg: &self.cfg,
			channels: 0,
			rate: 1,
			ring: &mut scratch_ring,
			pending_stim: &mut scratch_stim,
			last_good: &mut scratch_good,
			bad_run_active: &mut scratch_bad,
			prev_input: &mut scratch_prev,
			output_count: &mut scratch_count,
			drift: &mut self.drift,
			start_instant: self.start_instant,
		};
		self.driver.initialize(samples_per_block, &mut producer)?;

		let mut header = self.driver.header().clone();
		if header.channel_units.is_none() {
			header.channel_units = self
				.driver
				.channel_units()
				.map(|units| units.into_iter().map(|(unit, scale)| (unit as f64, scale as f64)).collect());
		}
		self.channels = header.channels();
		self.rate = header.sampling_hz as u32;
		self.samples_per_block = samples_per_block;
		self.last_good = vec![0.0; self.channels];
		self.prev_input = vec![0.0; self.channels];
		self.header = Some(header);
		self.hooks.create();
		self.state = PipelineState::Connected;
		info!("pipeline connected: {} channels at {}hz, block {}", self.channels, self.rate, samples_per_block);
		Ok(())
	}

	pub fn start(&mut self) -> Result<(), ServerError> {
		let header = self.header.as_ref().expect("connect() must run before start()");
		if !self.hooks.start(&header.channel_names, self.rate, self.channels as u16, self.samples_per_block) {
			warn!("start rejected by a registered hook");
			return Err(ServerError::HookRejectedStart);
		}

		self.driver.start()?;
		self.start_instant = Instant::now();
		if !self.drift.start(self.rate, Time::ZERO) {
			return Err(ServerError::InternalInvariant("drift corrector rejected a zero sampling rate"));
		}
		self.state = PipelineState::Started;
		info!("pipeline started");
		Ok(())
	}

	pub fn stop(&mut self) {
		self.driver.stop();
		self.drift.stop();
		self.drift.log_stats();
		self.state = PipelineState::Connected;
		self.hooks.stop();
		info!("pipeline stopped");
	}

	pub async fn disconnect(&mut self) {
		self.driver.uninitialize();
		for mut client in self.clients.drain(..) {
			client.shutdown().await;
		}
		self.ring.clear();
		self.pending_stim.clear();
		self.output_count = 0;
		self.blocks_emitted = 0;
		self.header = None;
		self.state = PipelineState::Idle;
		info!("pipeline disconnected");
	}

	fn buffer_duration(&self) -> Time {
		Time::of_samples(self.rate, self.samples_per_block as u64)
	}

	fn connect_time_for(&self, accepted_at: Instant) -> Time {
		Time::from_duration(accepted_at.saturating_duration_since(self.start_instant))
	}

	fn accept_pending(&mut self) {
		while let Ok(pending) = self.pending_rx.try_recv() {
			if self.state != PipelineState::Started {
				debug!("dropping connection from {}: pipeline is not started", pending.addr);
				continue;
			}

			let connect_time = self.connect_time_for(pending.accepted_at);
			let samples_since_start = connect_time.as_samples(self.rate) as i64;
			let ring_len = self.ring.len() as i64;
			let corrected = self.drift.corrected() as i64;
			let skip = (samples_since_start - (corrected - ring_len)).max(0) as u32;

			let skip_time = Time::of_samples(self.rate, skip as u64);
			let stimulation_offset = Time::of_samples(self.rate, self.blocks_emitted * self.samples_per_block as u64) + skip_time;

			let mut session = ClientSession::spawn(pending.socket, connect_time);
			session.samples_to_skip = skip;
			session.stimulation_offset = stimulation_offset;
			self.hooks.accept_new_connection();

			if let Some(header) = &self.header {
				let mut dst = BytesMut::new();
				header.encode(&mut dst);
				let mut frame = BytesMut::new();
				codec::write_frame(&mut frame, &dst);
				session.enqueue(frame.freeze());
			}

			{
				let mut dst = BytesMut::new();
				self.cfg.experiment_info.encode(&mut dst);
				let mut frame = BytesMut::new();
				codec::write_frame(&mut frame, &dst);
				session.enqueue(frame.freeze());
			}

			info!("client {} subscribed, skipping {} samples", pending.addr, skip);
			self.clients.push(session);
		}
	}

	fn reap_disconnected(&mut self) -> Vec<ClientSession> {
		let mut reaped = Vec::new();
		let mut i = 0;
		while i < self.clients.len() {
			if self.clients[i].is_closed() {
				reaped.push(self.clients.remove(i));
			} else {
				i += 1;
			}
		}
		reaped
	}

	async fn drive_driver_once(&mut self) -> Result<bool, ServerError> {
		let mut producer = Producer {
			cfg: &self.cfg,
			channels: self.channels,
			rate: self.rate,
			ring: &mut self.ring,
			pending_stim: &mut self.pending_stim,
			last_good: &mut self.last_good,
			bad_run_active: &mut self.bad_run_active,
			prev_input: &mut self.prev_input,
			output_count: &mut self.output_count,
			drift: &mut self.drift,
			start_instant: self.start_instant,
		};

		let deadline = Instant::now() + self.cfg.driver_timeout;
		loop {
			let got_data = self.driver.poll(&mut producer)?;
			if got_data {
				return Ok(true);
			}
			if Instant::now() >= deadline {
				return Ok(false);
			}
			if self.cfg.started_driver_sleep_ms > 0 {
				tokio::time::sleep(Duration::from_millis(self.cfg.started_driver_sleep_ms as u64)).await;
			} else if self.cfg.started_driver_sleep_ms == 0 {
				tokio::task::yield_now().await;
			}
			// negative: busy spin, loop immediately
		}
	}

	fn emit_blocks(&mut self) {
		let block_len = self.samples_per_block as usize;
		while self.ring.len() >= 2 * block_len {
			let start_time = Time::of_samples(self.rate, self.blocks_emitted * self.samples_per_block as u64);
			let end_time = start_time + self.buffer_duration();

			{
				let rows = self.ring.make_contiguous();
				let mut view = PendingRing::new(&mut rows[..block_len]);
				self.hooks.loop_hook(&mut view, &mut self.pending_stim, start_time, end_time, self.last_time);
			}

			for client in &mut self.clients {
				if client.samples_to_skip < self.samples_per_block {
					let offset = client.samples_to_skip as usize;
					let mut signal_buf = Vec::with_capacity(self.channels * block_len);
					for ch in 0..self.channels {
						for s in 0..block_len {
							let idx = offset + s;
							let v = self.ring.get(idx).map(|row| row[ch]).unwrap_or(0.0);
							signal_buf.push(v);
						}
					}

					let mut payload = BytesMut::new();
					codec::signal::encode_buffer(&mut payload, &signal_buf);
					let mut frame = BytesMut::new();
					codec::write_frame(&mut frame, &payload);
					client.enqueue(frame.freeze());

					let chunk_stims = self.pending_stim.select_and_rebase(start_time, end_time, client.stimulation_offset);
					let mut stim_payload = BytesMut::new();
					codec::encode_stimulation_chunk(&mut stim_payload, &chunk_stims.iter().copied().collect::<Vec<_>>());
					let mut stim_frame = BytesMut::new();
					codec::write_frame(&mut stim_frame, &stim_payload);
					client.enqueue(stim_frame.freeze());
				} else {
					client.samples_to_skip -= self.samples_per_block;
				}
			}

			self.pending_stim.remove_range(Time::ZERO, end_time);
			for _ in 0..block_len {
				self.ring.pop_front();
			}

			self.blocks_emitted += 1;
			self.last_time = end_time;
		}
	}

	/// One full hot-loop iteration: accept, reap, drive the driver, emit.
	/// Returns `Ok(false)` on a driver timeout (the caller should stop the
	/// session), `Ok(true)` to keep iterating.
	pub async fn iterate(&mut self) -> Result<bool, ServerError> {
		self.accept_pending();
		let reaped = self.reap_disconnected();
		for mut client in reaped {
			client.shutdown().await;
		}

		if self.state != PipelineState::Started {
			tokio::time::sleep(Duration::from_millis(self.cfg.stopped_driver_sleep_ms)).await;
			return Ok(true);
		}

		let got_data = match self.drive_driver_once().await {
			Ok(v) => v,
			Err(e) => {
				error!("driver error, tearing down session: {}", e);
				return Err(e);
			}
		};
		if !got_data {
			warn!("driver produced no data within the configured timeout");
			return Ok(false);
		}

		use crate::drift::DriftCorrectionPolicy;
		if self.drift.policy() == DriftCorrectionPolicy::Forced {
			let suggestion = self.drift.suggested();
			let padding = self.ring.back().cloned().unwrap_or_else(|| vec![0.0; self.channels]);
			self.drift.apply(suggestion, &mut self.ring, &mut self.pending_stim, &padding);
		}

		self.emit_blocks();
		Ok(true)
	}

	/// Run the hot loop until `quit` fires or the driver times out.
	pub async fn run_until_stopped(&mut self, quit: &mut oneshot::Receiver<()>) -> Result<(), ServerError> {
		loop {
			tokio::select! {
				_ = &mut *quit => {
					debug!("pipeline told to stop");
					return Ok(());
				}
				result = self.iterate() => {
					match result {
						Ok(true) => continue,
						Ok(false) => return Err(ServerError::Timeout),
						Err(e) => return Err(e),
					}
				}
			}
		}
	}
}
