//! Lifecycle state machine owning the `Pipeline` and the `ListenerTask`,
//! exposing the GUI-facing status contract. Mirrors the original
//! `CAcquisitionServerThread::EStatus` transitions.

use std::sync::{Arc, Mutex};

use log::{error, info};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::driver::Driver;
use crate::hooks::Hooks;
use crate::listener::ListenerTask;
use crate::pipeline::{Pipeline, PipelineConfig, ServerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
	Idle,
	Connected,
	Started,
	Terminated,
}

#[derive(Debug, Clone)]
pub struct StatusSnapshot {
	pub state: SupervisorState,
	pub client_count: usize,
	pub drift_ms: f64,
	pub last_error: Option<String>,
}

impl Default for StatusSnapshot {
	fn default() -> Self {
		Self {
			state: SupervisorState::Idle,
			client_count: 0,
			drift_ms: 0.0,
			last_error: None,
		}
	}
}

/// Owns the `Pipeline`, the `ListenerTask`, and the current
/// `SupervisorState`. Any core error forces a transition back to `Idle` and
/// records a status string for a UI layer.
pub struct Supervisor {
	state: SupervisorState,
	listener: Option<ListenerTask>,
	pipeline_quit: Option<oneshot::Sender<()>>,
	pipeline_task: Option<JoinHandle<(Pipeline, Result<(), ServerError>)>>,
	status: Arc<Mutex<StatusSnapshot>>,
	samples_per_block: u32,
}

impl Supervisor {
	pub fn new() -> Self {
		Self {
			state: SupervisorState::Idle,
			listener: None,
			pipeline_quit: None,
			pipeline_task: None,
			status: Arc::new(Mutex::new(StatusSnapshot::default())),
			samples_per_block: 32,
		}
	}

	pub fn status(&self) -> StatusSnapshot {
		self.status.lock().unwrap().clone()
	}

	fn set_status_error(&self, message: String) {
		error!("{}", message);
		let mut guard = self.status.lock().unwrap();
		guard.last_error = Some(message);
		guard.state = SupervisorState::Idle;
	}

	/// Bind the listening socket, build and connect the pipeline for
	/// `driver`. Does not yet admit samples -- `start()` does that.
	pub async fn connect(&mut self, driver: Box<dyn Driver>, hooks: Box<dyn Hooks>, listen_addr: (&str, u16), samples_per_block: u32, cfg: PipelineConfig) -> Result<(), ServerError> {
		if self.state != SupervisorState::Idle {
			self.set_status_error("connect() called while not idle".into());
			return Err(ServerError::InternalInvariant("connect() requires the Idle state"));
		}

		let listener = TcpListener::bind(listen_addr).await.map_err(ServerError::BindFailed)?;
		let (listener_task, pending_rx) = ListenerTask::spawn(listener);

		let mut pipeline = Pipeline::new(driver, hooks, pending_rx, cfg);
		if let Err(e) = pipeline.connect(samples_per_block) {
			self.set_status_error(format!("connect failed: {}", e));
			return Err(e);
		}

		self.listener = Some(listener_task);
		self.samples_per_block = samples_per_block;
		self.state = SupervisorState::Connected;
		self.status.lock().unwrap().state = SupervisorState::Connected;

		// parked here until `start()`; stash it behind a task that idles
		// on the quit channel so `disconnect()` from `Connected` has a
		// uniform teardown path.
		let (quit_tx, mut quit_rx) = oneshot::channel();
		self.pipeline_quit = Some(quit_tx);
		self.pipeline_task = Some(tokio::spawn(async move {
			let _ = (&mut quit_rx).await;
			(pipeline, Ok(()))
		}));

		info!("supervisor connected");
		Ok(())
	}

	/// Transition `Connected -> Started`, spawning the hot-loop task.
	pub async fn start(&mut self) -> Result<(), ServerError> {
		if self.state != SupervisorState::Connected {
			return Err(ServerError::InternalInvariant("start() requires the Connected state"));
		}

		// reclaim the parked pipeline from the idling task
		let quit_tx = self.pipeline_quit.take().expect("connected state always holds a quit sender");
		let _ = quit_tx.send(());
		let (mut pipeline, _) = self
			.pipeline_task
			.take()
			.expect("connected state always holds a pipeline task")
			.await
			.map_err(|_| ServerError::InternalInvariant("pipeline task panicked while parked"))?;

		if let Err(e) = pipeline.start() {
			self.set_status_error(format!("start failed: {}", e));
			return Err(e);
		}

		let status = self.status.clone();
		let (quit_tx, mut quit_rx) = oneshot::channel();
		self.pipeline_quit = Some(quit_tx);
		self.pipeline_task = Some(tokio::spawn(async move {
			let result = pipeline.run_until_stopped(&mut quit_rx).await;
			if let Err(e) = &result {
				let mut guard = status.lock().unwrap();
				guard.last_error = Some(format!("{}", e));
				guard.state = SupervisorState::Idle;
			}
			(pipeline, result)
		}));

		self.state = SupervisorState::Started;
		self.status.lock().unwrap().state = SupervisorState::Started;
		info!("supervisor started");
		Ok(())
	}

	async fn stop_pipeline_task(&mut self) -> Option<Pipeline> {
		if let Some(quit_tx) = self.pipeline_quit.take() {
			let _ = quit_tx.send(());
		}
		if let Some(task) = self.pipeline_task.take() {
			match task.await {
				Ok((pipeline, _)) => Some(pipeline),
				Err(_) => {
					error!("pipeline task panicked during shutdown");
					None
				}
			}
		} else {
			None
		}
	}

	/// Transition `Started -> Connected`.
	pub async fn stop(&mut self) -> Result<(), ServerError> {
		if self.state != SupervisorState::Started {
			return Err(ServerError::InternalInvariant("stop() requires the Started state"));
		}

		let mut pipeline = self.stop_pipeline_task().await.ok_or(ServerError::InternalInvariant("pipeline vanished during stop()"))?;
		pipeline.stop();

		let (quit_tx, mut quit_rx) = oneshot::channel();
		self.pipeline_quit = Some(quit_tx);
		self.pipeline_task = Some(tokio::spawn(async move {
			let _ = (&mut quit_rx).await;
			(pipeline, Ok(()))
		}));

		self.state = SupervisorState::Connected;
		self.status.lock().unwrap().state = SupervisorState::Connected;
		info!("supervisor stopped");
		Ok(())
	}

	/// Transition back to `Idle`, tearing down the listener and the driver.
	pub async fn disconnect(&mut self) {
		if let Some(mut listener) = self.listener.take() {
			listener.stop().await;
		}
		if let Some(mut pipeline) = self.stop_pipeline_task().await {
			pipeline.disconnect().await;
		}
		self.state = SupervisorState::Idle;
		self.status.lock().unwrap().state = SupervisorState::Idle;
		info!("supervisor disconnected");
	}

	/// Tear down everything permanently; no further transitions are valid.
	pub async fn terminate(&mut self) {
		self.disconnect().await;
		self.state = SupervisorState::Terminated;
		self.status.lock().unwrap().state = SupervisorState::Terminated;
	}
}

impl Default for Supervisor {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::driver::{GeneratorDriver, NanBurst, Waveform};
	use crate::drift::{DriftConfig, DriftCorrectionPolicy};
	use crate::hooks::NullHooks;
	use crate::marker::Marker;
	use crate::pipeline::NanPolicy;

	#[tokio::test]
	async fn connect_then_start_reaches_started_state() {
		let driver = GeneratorDriver::new(2, 100, Waveform::Constant(1.0)).with_samples_per_poll(4);
		let mut sup = Supervisor::new();
		sup.connect(Box::new(driver), Box::new(NullHooks), ("127.0.0.1", 0), 4, PipelineConfig::default())
			.await
			.unwrap();
		assert_eq!(sup.status().state, SupervisorState::Connected);

		sup.start().await.unwrap();
		assert_eq!(sup.status().state, SupervisorState::Started);

		sup.stop().await.unwrap();
		assert_eq!(sup.status().state, SupervisorState::Connected);

		sup.disconnect().await;
		assert_eq!(sup.status().state, SupervisorState::Idle);
	}

	#[tokio::test]
	async fn start_without_connect_is_rejected() {
		let mut sup = Supervisor::new();
		assert!(sup.start().await.is_err());
	}

	// End-to-end scenarios driven through a real Pipeline and a loopback
	// TcpStream, in the style of `relay::socket::tests::test_sockets`.

	use bytes::{Bytes, BytesMut};
	use tokio::io::AsyncReadExt;
	use tokio::net::TcpStream;

	use crate::codec::{self, signal::SignalHeader};

	async fn read_frames(stream: &mut TcpStream, count: usize) -> Vec<Bytes> {
		let mut buf = BytesMut::new();
		let mut frames = Vec::new();
		while frames.len() < count {
			if let Some(frame) = codec::read_frame(&mut buf).unwrap() {
				frames.push(frame);
				continue;
			}
			let n = stream.read_buf(&mut buf).await.unwrap();
			assert!(n > 0, "peer closed before {} frames arrived (got {})", count, frames.len());
		}
		frames
	}

	fn fast_timeout_cfg(drift: DriftConfig) -> PipelineConfig {
		PipelineConfig {
			drift,
			driver_timeout: std::time::Duration::from_millis(150),
			started_driver_sleep_ms: 0,
			..PipelineConfig::default()
		}
	}

	/// Scenario 1: clean session. Rate 512, 8 channels, block 32, constant
	/// 1.0, 2048 samples fed in a single poll. The ring holds back its final
	/// block (the 2x surplus invariant, see `pipeline.rs`'s own test), so a
	/// single-shot finite session yields 63 chunks, not 64.
	#[tokio::test]
	async fn scenario_clean_session() {
		let driver = GeneratorDriver::new(8, 512, Waveform::Constant(1.0)).with_samples_per_poll(2048).with_total_samples(2048);
		let mut sup = Supervisor::new();
		sup.connect(Box::new(driver), Box::new(NullHooks), ("127.0.0.1", 0), 32, fast_timeout_cfg(DriftConfig::default()))
			.await
			.unwrap();

		let mut client = TcpStream::connect(sup_local_addr(&sup)).await.unwrap();
		sup.start().await.unwrap();

		let blocks = 2048 / 32 - 1;
		let frames = read_frames(&mut client, 2 + 2 * blocks).await;

		let header = SignalHeader::decode(&frames[0]).unwrap();
		assert_eq!(header.channels(), 8);
		assert_eq!(header.samples_per_block, 32);

		for b in 0..blocks {
			let signal = &frames[2 + 2 * b];
			let values = codec::signal::decode_buffer(signal, 8, 32).unwrap();
			assert!(values.iter().all(|v| *v == 1.0), "block {} had a non-1.0 sample", b);

			let stim = &frames[3 + 2 * b];
			let entries = codec::decode_stimulation_chunk(stim).unwrap();
			assert!(entries.is_empty(), "block {} carried unexpected stimulations", b);
		}
	}

	/// Scenario 2: a NaN burst on channels 0 and 3 between samples 100 and
	/// 198 (the half-open `100..199` range), with the `Zero` NaN policy.
	#[tokio::test]
	async fn scenario_nan_burst() {
		let driver = GeneratorDriver::new(8, 512, Waveform::Constant(1.0))
			.with_nan_burst(NanBurst {
				channels: vec![0, 3],
				samples: 100..199,
			})
			.with_samples_per_poll(2048)
			.with_total_samples(2048);
		let mut sup = Supervisor::new();
		let mut cfg = fast_timeout_cfg(DriftConfig::default());
		cfg.nan_policy = NanPolicy::Zero;
		sup.connect(Box::new(driver), Box::new(NullHooks), ("127.0.0.1", 0), 32, cfg).await.unwrap();

		let mut client = TcpStream::connect(sup_local_addr(&sup)).await.unwrap();
		sup.start().await.unwrap();

		let blocks = 2048 / 32 - 1;
		let frames = read_frames(&mut client, 2 + 2 * blocks).await;

		let mut seen_artifact = false;
		let mut seen_no_artifact = false;
		for b in 0..blocks {
			let signal = &frames[2 + 2 * b];
			let values = codec::signal::decode_buffer(signal, 8, 32).unwrap();
			for s in 0..32usize {
				let sample_index = (b * 32 + s) as u64;
				let in_burst = (100..199).contains(&sample_index);
				for ch in 0..8usize {
					let v = values[ch * 32 + s];
					if in_burst && (ch == 0 || ch == 3) {
						assert_eq!(v, 0.0, "sample {} channel {} should have been zeroed", sample_index, ch);
					} else {
						assert_eq!(v, 1.0, "sample {} channel {} should be untouched", sample_index, ch);
					}
				}
			}

			let stim = &frames[3 + 2 * b];
			for entry in codec::decode_stimulation_chunk(stim).unwrap() {
				if entry.id == Marker::Artifact.id() {
					assert_eq!(entry.date, crate::time::Time::of_samples(512, 100));
					seen_artifact = true;
				} else if entry.id == Marker::NoArtifact.id() {
					assert_eq!(entry.date, crate::time::Time::of_samples(512, 199));
					seen_no_artifact = true;
				}
			}
		}
		assert!(seen_artifact, "expected an Artifact marker at sample 100");
		assert!(seen_no_artifact, "expected a NoArtifact marker at sample 199");
	}

	/// Scenario 6: 2x oversampling of a unit ramp. `output[2k+1] = input[k]`,
	/// `output[2k] = 0.5*(input[k-1] + input[k])` with `input[-1] == 0`.
	#[tokio::test]
	async fn scenario_oversampling_doubles_a_ramp() {
		let driver = GeneratorDriver::new(1, 100, Waveform::Ramp { start: 0.0, step: 1.0 })
			.with_samples_per_poll(100)
			.with_total_samples(100);
		let mut sup = Supervisor::new();
		let mut cfg = fast_timeout_cfg(DriftConfig::default());
		cfg.oversampling_factor = 2;
		sup.connect(Box::new(driver), Box::new(NullHooks), ("127.0.0.1", 0), 50, cfg).await.unwrap();

		let mut client = TcpStream::connect(sup_local_addr(&sup)).await.unwrap();
		sup.start().await.unwrap();

		let frames = read_frames(&mut client, 3).await;
		let signal = codec::signal::decode_buffer(&frames[2], 1, 50).unwrap();

		assert_eq!(signal[0], 0.0);
		assert_eq!(signal[1], 0.0);
		assert_eq!(signal[2], 0.5);
		assert_eq!(signal[3], 1.0);
		assert_eq!(signal[4], 1.5);
		assert_eq!(signal[5], 2.0);
	}

	/// Scenario 3: the driver delivers samples faster than its declared rate.
	/// Paced against the real clock, so timing-sensitive; a generous jitter
	/// window keeps it from being flaky.
	#[tokio::test]
	async fn scenario_drift_too_fast_emits_removed_samples() {
		let driver = GeneratorDriver::new(1, 1000, Waveform::Constant(1.0)).with_real_time_pacing(1200).with_samples_per_poll(16);
		let mut sup = Supervisor::new();
		let drift = DriftConfig {
			policy: DriftCorrectionPolicy::Forced,
			tolerance_ms: 5,
			jitter_estimation_count: 8,
			initial_skip_ms: 0,
		};
		sup.connect(Box::new(driver), Box::new(NullHooks), ("127.0.0.1", 0), 20, fast_timeout_cfg(drift)).await.unwrap();

		let mut client = TcpStream::connect(sup_local_addr(&sup)).await.unwrap();
		sup.start().await.unwrap();

		let mut seen_removed = false;
		let mut buf = BytesMut::new();
		let mut frame_index = 0u64; // 0: header, 1: experiment info, then alternating signal(even)/stim(odd)
		let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
		while !seen_removed && std::time::Instant::now() < deadline {
			let frame = loop {
				if let Some(f) = codec::read_frame(&mut buf).unwrap() {
					break f;
				}
				tokio::time::timeout(std::time::Duration::from_millis(500), client.read_buf(&mut buf))
					.await
					.expect("socket should keep producing frames")
					.unwrap();
			};
			if frame_index >= 3 && frame_index % 2 == 1 {
				let entries = codec::decode_stimulation_chunk(&frame).unwrap();
				if entries.iter().any(|e| e.id == Marker::RemovedSamples.id()) {
					seen_removed = true;
				}
			}
			frame_index += 1;
		}
		assert!(seen_removed, "expected a RemovedSamples marker once the driver outran its declared rate");
	}

	/// Scenario 4: the driver delivers samples slower than its declared
	/// rate, expecting an `AddedSamplesBegin`/`AddedSamplesEnd` pair, the
	/// latter with a zero duration (the open question in DESIGN.md).
	#[tokio::test]
	async fn scenario_drift_too_slow_emits_added_samples() {
		let driver = GeneratorDriver::new(1, 1000, Waveform::Constant(1.0)).with_real_time_pacing(800).with_samples_per_poll(16);
		let mut sup = Supervisor::new();
		let drift = DriftConfig {
			policy: DriftCorrectionPolicy::Forced,
			tolerance_ms: 5,
			jitter_estimation_count: 8,
			initial_skip_ms: 0,
		};
		sup.connect(Box::new(driver), Box::new(NullHooks), ("127.0.0.1", 0), 20, fast_timeout_cfg(drift)).await.unwrap();

		let mut client = TcpStream::connect(sup_local_addr(&sup)).await.unwrap();
		sup.start().await.unwrap();

		let mut seen_begin = false;
		let mut seen_end_with_zero_duration = false;
		let mut buf = BytesMut::new();
		let mut frame_index = 0u64;
		let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
		while !(seen_begin && seen_end_with_zero_duration) && std::time::Instant::now() < deadline {
			let frame = loop {
				if let Some(f) = codec::read_frame(&mut buf).unwrap() {
					break f;
				}
				tokio::time::timeout(std::time::Duration::from_millis(500), client.read_buf(&mut buf))
					.await
					.expect("socket should keep producing frames")
					.unwrap();
			};
			if frame_index >= 3 && frame_index % 2 == 1 {
				for e in codec::decode_stimulation_chunk(&frame).unwrap() {
					if e.id == Marker::AddedSamplesBegin.id() {
						seen_begin = true;
					}
					if e.id == Marker::AddedSamplesEnd.id() && e.duration == crate::time::Time::ZERO {
						seen_end_with_zero_duration = true;
					}
				}
			}
			frame_index += 1;
		}
		assert!(seen_begin, "expected an AddedSamplesBegin marker once the driver lagged its declared rate");
		assert!(seen_end_with_zero_duration, "expected an AddedSamplesEnd marker with zero duration");
	}

	/// Scenario 5: a client that subscribes mid-session only ever sees
	/// block-aligned data starting at the next block boundary at or after
	/// its connect time. Paced against the real clock (~530ms), so this is
	/// a wall-clock integration test with a generous tolerance window.
	#[tokio::test]
	async fn scenario_late_subscriber_starts_at_next_block_boundary() {
		let driver = GeneratorDriver::new(1, 1000, Waveform::Ramp { start: 0.0, step: 1.0 })
			.with_real_time_pacing(1000)
			.with_samples_per_poll(10);
		let mut sup = Supervisor::new();
		sup.connect(Box::new(driver), Box::new(NullHooks), ("127.0.0.1", 0), 100, fast_timeout_cfg(DriftConfig::default()))
			.await
			.unwrap();

		let mut client1 = TcpStream::connect(sup_local_addr(&sup)).await.unwrap();
		sup.start().await.unwrap();
		let _ = read_frames(&mut client1, 2).await; // drain client1's header and experiment info

		tokio::time::sleep(std::time::Duration::from_millis(530)).await;

		let mut client2 = TcpStream::connect(sup_local_addr(&sup)).await.unwrap();
		let frames = read_frames(&mut client2, 3).await; // header, experiment info, first signal chunk
		SignalHeader::decode(&frames[0]).unwrap();
		let first_block = codec::signal::decode_buffer(&frames[2], 1, 100).unwrap();

		let first_value = first_block[0];
		assert_eq!(first_value.fract(), 0.0, "block boundaries always land on whole sample indices");
		assert_eq!((first_value as i64) % 100, 0, "late subscriber's first chunk must start on a block boundary");
		assert!(first_value >= 400.0 && first_value <= 900.0, "first chunk should begin near 530ms of 1000Hz samples, got {}", first_value);
	}

	fn sup_local_addr(sup: &Supervisor) -> std::net::SocketAddr {
		sup.listener.as_ref().expect("connect() must have bound a listener").local_addr()
	}
}
