//! Jitter estimation and sample-rate drift correction.
//!
//! Ported from the acquisition server's `CDriftCorrection`: every driver push
//! contributes one jitter sample (in fractional output samples); once the
//! jitter ring is full, a simple moving average gives a drift estimate in
//! samples, convertible to milliseconds. If the policy allows it, `apply`
//! pads or truncates the pending ring to walk the estimate back towards zero.

use std::collections::VecDeque;

use log::{debug, info, trace, warn};

use crate::marker::Marker;
use crate::stim::StimulationSet;
use crate::time::Time;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftCorrectionPolicy {
	DriverChoice,
	Forced,
	Disabled,
}

impl Default for DriftCorrectionPolicy {
	fn default() -> Self {
		DriftCorrectionPolicy::DriverChoice
	}
}

#[derive(Debug, Clone, Copy)]
pub struct DriftConfig {
	pub policy: DriftCorrectionPolicy,
	pub tolerance_ms: u64,
	pub jitter_estimation_count: usize,
	pub initial_skip_ms: u64,
}

impl Default for DriftConfig {
	fn default() -> Self {
		Self {
			policy: DriftCorrectionPolicy::DriverChoice,
			tolerance_ms: 5,
			jitter_estimation_count: 128,
			initial_skip_ms: 0,
		}
	}
}

pub struct DriftCorrector {
	cfg: DriftConfig,
	sampling: u32,

	started: bool,
	start_time: Time,
	initial_skip: Time,
	initial_skip_passed: bool,
	last_estimation_time: Time,

	received: u64,
	corrected: u64,
	inner_latency_samples: i64,

	jitters: VecDeque<f64>,
	estimate: f64,
	too_fast_max: f64,
	too_slow_max: f64,

	added: u64,
	removed: u64,
	interventions: u64,
}

impl DriftCorrector {
	pub fn new(cfg: DriftConfig) -> Self {
		let initial_skip = Time::from_millis(cfg.initial_skip_ms);
		Self {
			cfg,
			sampling: 0,
			started: false,
			start_time: Time::ZERO,
			initial_skip,
			initial_skip_passed: cfg.initial_skip_ms == 0,
			last_estimation_time: Time::ZERO,
			received: 0,
			corrected: 0,
			inner_latency_samples: 0,
			jitters: VecDeque::new(),
			estimate: 0.0,
			too_fast_max: 0.0,
			too_slow_max: 0.0,
			added: 0,
			removed: 0,
			interventions: 0,
		}
	}

	/// A zero sampling rate is a configuration error: reported, not thrown.
	pub fn start(&mut self, sampling: u32, start_time: Time) -> bool {
		if sampling == 0 {
			warn!("drift correction does not support a sampling rate of 0");
			return false;
		}

		self.reset();
		self.sampling = sampling;
		self.start_time = start_time + self.initial_skip;
		self.last_estimation_time = start_time;
		self.started = true;

		debug!(
			"drift correction started: policy={:?} tolerance={}ms jitter_window={}",
			self.cfg.policy, self.cfg.tolerance_ms, self.cfg.jitter_estimation_count
		);

		true
	}

	pub fn stop(&mut self) {
		self.started = false;
	}

	fn reset(&mut self) {
		self.jitters.clear();
		self.received = 0;
		self.corrected = 0;
		self.inner_latency_samples = 0;
		self.estimate = 0.0;
		self.too_fast_max = 0.0;
		self.too_slow_max = 0.0;
		self.added = 0;
		self.removed = 0;
		self.interventions = 0;
		self.initial_skip_passed = self.cfg.initial_skip_ms == 0;
	}

	pub fn set_inner_latency_samples(&mut self, samples: i64) {
		self.inner_latency_samples = samples;
	}

	pub fn received(&self) -> u64 {
		self.received
	}

	pub fn corrected(&self) -> u64 {
		self.corrected
	}

	pub fn policy(&self) -> DriftCorrectionPolicy {
		self.cfg.policy
	}

	fn tolerance_samples(&self) -> f64 {
		(self.cfg.tolerance_ms as f64 * self.sampling as f64) / 1000.0
	}

	pub fn drift_ms(&self) -> f64 {
		1000.0 * self.estimate / self.sampling.max(1) as f64
	}

	pub fn drift_too_fast_max_ms(&self) -> f64 {
		1000.0 * self.too_fast_max / self.sampling.max(1) as f64
	}

	pub fn drift_too_slow_max_ms(&self) -> f64 {
		1000.0 * self.too_slow_max / self.sampling.max(1) as f64
	}

	fn compute_jitter(&self, current_time: Time) -> f64 {
		let expected_time = self.start_time + Time::of_samples(self.sampling, self.corrected);
		let time_diff = if expected_time >= current_time {
			(expected_time - current_time).to_seconds()
		} else {
			-(current_time - expected_time).to_seconds()
		};
		time_diff * self.sampling as f64 + self.inner_latency_samples as f64
	}

	/// Feed `new_samples` newly-received samples at host time `now`, updating
	/// the jitter ring and drift estimate. Returns `false` if called before
	/// `start`.
	pub fn estimate_drift(&mut self, now: Time, new_samples: u64) -> bool {
		if !self.started {
			warn!("estimate_drift() called before start()");
			return false;
		}

		if now < self.start_time {
			// Allow the driver to stabilize; see DriftInitialSkipPeriodMs.
			return true;
		}
		if !self.initial_skip_passed {
			self.initial_skip_passed = true;
			self.start_time = now;
			self.last_estimation_time = now;
			return true;
		}

		self.received += new_samples;
		self.corrected += new_samples;

		let jitter = self.compute_jitter(now);
		self.jitters.push_back(jitter);
		if self.jitters.len() > self.cfg.jitter_estimation_count {
			self.jitters.pop_front();
		}

		if self.jitters.len() == self.cfg.jitter_estimation_count {
			let sum: f64 = self.jitters.iter().sum();
			self.estimate = sum / self.cfg.jitter_estimation_count as f64;

			if self.estimate > 0.0 {
				self.too_fast_max = self.too_fast_max.max(self.estimate);
			} else {
				self.too_slow_max = self.too_slow_max.max(-self.estimate);
			}

			if self.estimate.abs() > self.tolerance_samples() {
				trace!(
					"drift estimate {:.2} samples ({:.2}ms), jitter {:.2}",
					self.estimate,
					self.drift_ms(),
					jitter
				);
			}
		}

		self.last_estimation_time = now;
		true
	}

	/// Correction suggested by the current estimate: 0 inside tolerance,
	/// otherwise the opposite-signed, truncated-toward-zero estimate.
	pub fn suggested(&self) -> i64 {
		if self.drift_ms().abs() <= self.cfg.tolerance_ms as f64 {
			0
		} else {
			-(self.estimate.trunc() as i64)
		}
	}

	/// Apply a correction of `k` samples (positive = pad, negative = drop) to
	/// the pending ring and stimulation set. Returns `false` without
	/// mutating anything if the policy is `Disabled` or the corrector hasn't
	/// started.
	pub fn apply(
		&mut self,
		correction: i64,
		pending_buffers: &mut VecDeque<Vec<f64>>,
		pending_stim_set: &mut StimulationSet,
		padding: &[f64],
	) -> bool {
		if !self.started {
			warn!("correct_drift() called before start()");
			return false;
		}
		if self.cfg.policy == DriftCorrectionPolicy::Disabled {
			return false;
		}

		if correction == 0 {
			return true;
		}

		debug!("correcting drift by {} samples", correction);

		if correction > 0 {
			let k = correction as u64;
			for _ in 0..k {
				pending_buffers.push_back(padding.to_vec());
			}

			let time_of_incorrect = Time::of_samples(self.sampling, self.corrected - 1);
			let duration_of_incorrect = Time::of_samples(self.sampling, k);
			let time_of_correct = Time::of_samples(self.sampling, self.corrected - 1 + k);
			pending_stim_set.push_back(Marker::AddedSamplesBegin.id(), time_of_incorrect, duration_of_incorrect);
			pending_stim_set.push_back(Marker::AddedSamplesEnd.id(), time_of_correct, Time::ZERO);

			self.estimate += correction as f64;
			self.corrected += k;
			self.added += k;
			self.interventions += 1;
		} else {
			let want = (-correction) as usize;
			let removed = want.min(pending_buffers.len());
			let new_len = pending_buffers.len() - removed;
			pending_buffers.truncate(new_len);

			let last_sample_date = Time::of_samples(self.sampling, self.corrected - removed as u64);
			pending_stim_set.clamp_dates_to(last_sample_date);
			pending_stim_set.push_back(Marker::RemovedSamples.id(), last_sample_date, Time::ZERO);

			self.estimate -= removed as f64;
			self.corrected -= removed as u64;
			self.removed += removed as u64;
			self.interventions += 1;
		}

		// Keep the jitter ring's moving average consistent with the new
		// zero: shift every buffered jitter by the same correction instead
		// of discarding history.
		for j in self.jitters.iter_mut() {
			*j += correction as f64;
		}

		true
	}

	/// Emit the same summary the original driver prints when a tolerance
	/// breach occurred; a no-op (beyond a debug line) otherwise.
	pub fn log_stats(&self) {
		if !self.started {
			info!("drift correction is stopped, no statistics were collected");
			return;
		}

		let elapsed = self.last_estimation_time.saturating_sub(self.start_time);
		let elapsed_sec = elapsed.to_seconds();
		let theoretical = self.sampling as f64 * elapsed_sec;

		let tol = self.cfg.tolerance_ms as f64;
		let drift_ratio = self.drift_ms() / tol;
		let fast_ratio = self.drift_too_fast_max_ms() / tol;
		let slow_ratio = self.drift_too_slow_max_ms() / tol;

		if fast_ratio <= 1.0 && slow_ratio <= 1.0 && drift_ratio.abs() <= 1.0 {
			debug!("drift within tolerance after {:.1}s", elapsed_sec);
			return;
		}

		let estimated_rate = self.received as f64 / elapsed_sec.max(1e-9);
		info!(
			"stats after {:.1}s session of {}hz sampling (declared rate)",
			elapsed_sec, self.sampling
		);
		info!(
			"  estimate: driver samples at {:.1}hz ({:.1}% of declared)",
			estimated_rate,
			100.0 * estimated_rate / self.sampling as f64
		);
		info!("  received: {} samples", self.received);
		info!("  expected: {:.1} samples", theoretical);
		info!(
			"  returned: {} samples ({})",
			self.corrected,
			if self.cfg.policy == DriftCorrectionPolicy::Disabled {
				"drift correction disabled"
			} else {
				"after drift correction"
			}
		);
		info!("  added: {} samples", self.added);
		info!("  removed: {} samples", self.removed);
		info!("  operated: {} times (interventions)", self.interventions);

		let log_peak = |ratio: f64, label: &str, ms: f64| {
			if ratio > 1.0 {
				warn!("  {}: {:.2}ms ({:.0}% of tolerance)", label, ms, 100.0 * ratio);
			} else {
				info!("  {}: {:.2}ms ({:.0}% of tolerance)", label, ms, 100.0 * ratio);
			}
		};
		log_peak(slow_ratio, "slow peak", self.drift_too_slow_max_ms());
		log_peak(fast_ratio, "fast peak", self.drift_too_fast_max_ms());
		log_peak(drift_ratio.abs(), "last estim", self.drift_ms());

		if self.cfg.policy == DriftCorrectionPolicy::DriverChoice && self.added == 0 && self.removed == 0 {
			warn!("the driver did not try to correct the drift; this may be a feature of the driver");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn corrector(policy: DriftCorrectionPolicy) -> DriftCorrector {
		DriftCorrector::new(DriftConfig {
			policy,
			tolerance_ms: 5,
			jitter_estimation_count: 4,
			initial_skip_ms: 0,
		})
	}

	#[test]
	fn start_rejects_zero_sampling_rate() {
		let mut c = corrector(DriftCorrectionPolicy::Forced);
		assert!(!c.start(0, Time::ZERO));
	}

	#[test]
	fn estimate_drift_requires_started() {
		let mut c = corrector(DriftCorrectionPolicy::Forced);
		assert!(!c.estimate_drift(Time::ZERO, 10));
	}

	#[test]
	fn suggested_is_zero_within_tolerance() {
		let mut c = corrector(DriftCorrectionPolicy::Forced);
		c.start(1000, Time::ZERO);
		// fill the jitter ring with values that stay within 5ms = 5 samples
		for i in 1..=4u64 {
			let now = Time::of_samples(1000, i * 100);
			c.estimate_drift(now, 100);
		}
		assert_eq!(c.suggested(), 0);
	}

	#[test]
	fn suggested_is_nonzero_when_driver_is_fast() {
		let mut c = corrector(DriftCorrectionPolicy::Forced);
		c.start(1000, Time::ZERO);
		// Driver declares 100 samples but host clock only advanced by the
		// equivalent of 90 samples each push: driver is running ahead.
		for i in 1..=4u64 {
			let now = Time::of_samples(1000, i * 90);
			c.estimate_drift(now, 100);
		}
		assert!(c.suggested() < 0, "driver running fast should suggest dropping samples");
	}

	#[test]
	fn suggested_is_nonzero_when_driver_is_slow() {
		let mut c = corrector(DriftCorrectionPolicy::Forced);
		c.start(1000, Time::ZERO);
		for i in 1..=4u64 {
			let now = Time::of_samples(1000, i * 110);
			c.estimate_drift(now, 100);
		}
		assert!(c.suggested() > 0, "driver running slow should suggest padding samples");
	}

	#[test]
	fn apply_pad_emits_begin_and_end_markers() {
		let mut c = corrector(DriftCorrectionPolicy::Forced);
		c.start(1000, Time::ZERO);
		c.corrected = 50;
		let mut ring = VecDeque::new();
		let mut stims = StimulationSet::new();
		let padding = vec![1.0, 2.0];
		assert!(c.apply(3, &mut ring, &mut stims, &padding));
		assert_eq!(ring.len(), 3);
		assert!(ring.iter().all(|v| v == &padding));
		assert_eq!(stims.size(), 2);
		assert_eq!(stims.get_id(0), Marker::AddedSamplesBegin.id());
		assert_eq!(stims.get_duration(0), Time::of_samples(1000, 3));
		assert_eq!(stims.get_id(1), Marker::AddedSamplesEnd.id());
		assert_eq!(stims.get_duration(1), Time::ZERO);
		assert_eq!(c.added, 3);
		assert_eq!(c.corrected, 53);
	}

	#[test]
	fn apply_drop_removes_tail_and_emits_marker() {
		let mut c = corrector(DriftCorrectionPolicy::Forced);
		c.start(1000, Time::ZERO);
		c.corrected = 50;
		let mut ring: VecDeque<Vec<f64>> = (0..10).map(|i| vec![i as f64]).collect();
		let mut stims = StimulationSet::new();
		stims.push_back(99, Time::of_samples(1000, 1000), Time::ZERO);
		assert!(c.apply(-3, &mut ring, &mut stims, &[]));
		assert_eq!(ring.len(), 7);
		assert_eq!(c.removed, 3);
		assert_eq!(c.corrected, 47);
		// marker + the pre-existing future stim, clamped
		assert_eq!(stims.size(), 2);
		assert_eq!(stims.get_date(0), Time::of_samples(1000, 47));
	}

	#[test]
	fn apply_drop_clamps_at_ring_length() {
		let mut c = corrector(DriftCorrectionPolicy::Forced);
		c.start(1000, Time::ZERO);
		c.corrected = 50;
		let mut ring: VecDeque<Vec<f64>> = (0..2).map(|i| vec![i as f64]).collect();
		let mut stims = StimulationSet::new();
		assert!(c.apply(-10, &mut ring, &mut stims, &[]));
		assert_eq!(ring.len(), 0);
		assert_eq!(c.removed, 2);
	}

	#[test]
	fn apply_is_noop_when_disabled() {
		let mut c = corrector(DriftCorrectionPolicy::Disabled);
		c.start(1000, Time::ZERO);
		let mut ring = VecDeque::new();
		let mut stims = StimulationSet::new();
		assert!(!c.apply(5, &mut ring, &mut stims, &[1.0]));
		assert!(ring.is_empty());
		assert!(stims.is_empty());
	}

	#[test]
	fn apply_preserves_received_count() {
		let mut c = corrector(DriftCorrectionPolicy::Forced);
		c.start(1000, Time::ZERO);
		for i in 1..=4u64 {
			c.estimate_drift(Time::of_samples(1000, i * 100), 100);
		}
		let received_before = c.received();
		let mut ring = VecDeque::new();
		let mut stims = StimulationSet::new();
		c.apply(5, &mut ring, &mut stims, &[0.0]);
		assert_eq!(c.received(), received_before, "drift correction must never rewrite received count");
	}

	#[test]
	fn apply_shifts_buffered_jitters() {
		let mut c = corrector(DriftCorrectionPolicy::Forced);
		c.start(1000, Time::ZERO);
		for i in 1..=4u64 {
			c.estimate_drift(Time::of_samples(1000, i * 90), 100);
		}
		let mut ring = VecDeque::new();
		let mut stims = StimulationSet::new();
		let suggestion = c.suggested();
		c.apply(suggestion, &mut ring, &mut stims, &[0.0]);
		// after applying the full suggested correction the estimate should
		// land back within tolerance
		assert!(c.drift_ms().abs() <= c.cfg.tolerance_ms as f64 + 1e-6);
	}
}
