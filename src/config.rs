//! TOML-driven configuration: driver choice, policy tokens, listen address.
//! Validated before a `Supervisor` is built, mirroring `runtime::Config`'s
//! check-then-build split (`check()` finds the first problem, `build()`
//! calls it before doing any real work).

use std::error::Error as StdError;
use std::fmt;

use serde_derive::Deserialize;

use crate::driver::{Driver, GeneratorDriver, NanBurst, ReplayDriver, Waveform};
use crate::drift::{DriftConfig, DriftCorrectionPolicy};
use crate::hooks::{Hooks, NullHooks};
use crate::pipeline::{NanPolicy, PipelineConfig};
use crate::supervisor::Supervisor;

#[derive(Debug)]
pub enum ConfigError {
	ZeroSamplingRate,
	ZeroChannels,
	PortInUse { port: u16, source: std::io::Error },
	UnrecognisedPolicy { token: &'static str, value: String },
	UndefinedDriver { name: String },
}

impl fmt::Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::ZeroSamplingRate => write!(f, "driver sampling rate must be nonzero"),
			Self::ZeroChannels => write!(f, "driver must declare at least one channel"),
			Self::PortInUse { port, source } => write!(f, "listen port {} is unavailable: {}", port, source),
			Self::UnrecognisedPolicy { token, value } => write!(f, "unrecognised value {:?} for {}", value, token),
			Self::UndefinedDriver { name } => write!(f, "undefined driver {:?}", name),
		}
	}
}

impl StdError for ConfigError {
	fn source(&self) -> Option<&(dyn StdError + 'static)> {
		match self {
			Self::PortInUse { source, .. } => Some(source),
			_ => None,
		}
	}
}

fn default_listen_address() -> String {
	"0.0.0.0".into()
}

fn default_listen_port() -> u16 {
	1024
}

fn default_samples_per_block() -> u32 {
	32
}

fn default_drift_policy() -> String {
	"DriverChoice".into()
}

fn default_tolerance_ms() -> u64 {
	5
}

fn default_jitter_count() -> usize {
	128
}

fn default_initial_skip_ms() -> u64 {
	0
}

fn default_oversampling_factor() -> u32 {
	1
}

fn default_nan_policy() -> String {
	"Disabled".into()
}

fn default_started_sleep_ms() -> i64 {
	0
}

fn default_stopped_sleep_ms() -> u64 {
	100
}

fn default_driver_timeout_ms() -> u64 {
	5000
}

fn bool_false() -> bool {
	false
}

/// Selects and parameterises one of the in-tree reference drivers (§4.6).
/// A real hardware driver is out of scope; this token only ever resolves to
/// `GeneratorDriver` or `ReplayDriver`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind")]
pub enum DriverConfig {
	Generator {
		channels: usize,
		sampling_hz: u64,
		#[serde(default)]
		waveform: WaveformConfig,
		#[serde(default)]
		nan_bursts: Vec<NanBurstConfig>,
	},
	Replay {
		channels: usize,
		sampling_hz: u64,
		frames: Vec<Vec<f64>>,
	},
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "shape")]
pub enum WaveformConfig {
	Constant { value: f64 },
	Ramp { start: f64, step: f64 },
}

impl Default for WaveformConfig {
	fn default() -> Self {
		WaveformConfig::Constant { value: 0.0 }
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct NanBurstConfig {
	pub channels: Vec<usize>,
	pub start_sample: u64,
	pub end_sample: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentInfoConfig {
	pub experiment_id: Option<u64>,
	pub subject_id: Option<u64>,
	pub subject_name: Option<String>,
	pub subject_age: Option<u32>,
	pub subject_gender: Option<u8>,
	pub lab_id: Option<u64>,
	pub lab_name: Option<String>,
	pub technician_id: Option<u64>,
	pub technician_name: Option<String>,
	pub date: Option<u64>,
}

impl From<ExperimentInfoConfig> for crate::codec::ExperimentInfo {
	fn from(c: ExperimentInfoConfig) -> Self {
		Self {
			experiment_id: c.experiment_id,
			subject_id: c.subject_id,
			subject_name: c.subject_name,
			subject_age: c.subject_age,
			subject_gender: c.subject_gender,
			lab_id: c.lab_id,
			lab_name: c.lab_name,
			technician_id: c.technician_id,
			technician_name: c.technician_name,
			date: c.date,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	#[serde(default = "default_listen_address")]
	pub listen_address: String,
	#[serde(default = "default_listen_port")]
	pub listen_port: u16,
	#[serde(default = "default_samples_per_block")]
	pub samples_per_block: u32,

	pub driver: DriverConfig,

	#[serde(default = "default_drift_policy")]
	pub drift_correction_policy: String,
	#[serde(default = "default_tolerance_ms")]
	pub drift_tolerance_duration_ms: u64,
	#[serde(default = "default_jitter_count")]
	pub jitter_estimation_count_for_drift: usize,
	#[serde(default = "default_initial_skip_ms")]
	pub drift_initial_skip_period_ms: u64,

	#[serde(default = "default_oversampling_factor")]
	pub over_sampling_factor: u32,
	#[serde(default = "default_nan_policy")]
	pub nan_replacement_policy: String,

	#[serde(default = "default_started_sleep_ms")]
	pub started_driver_sleep_duration_ms: i64,
	#[serde(default = "default_stopped_sleep_ms")]
	pub stopped_driver_sleep_duration_ms: u64,
	#[serde(default = "default_driver_timeout_ms")]
	pub driver_timeout_duration_ms: u64,

	#[serde(default = "bool_false")]
	pub channel_selection: bool,
	#[serde(default = "bool_false")]
	pub check_impedance: bool,

	pub experiment_info: Option<ExperimentInfoConfig>,

	/// Overrides `RUST_LOG` when set; read (not enforced) by the binary.
	pub log_level: Option<String>,
}

/// Everything `Config::build()` resolves: an un-started `Supervisor` plus
/// the pieces `Supervisor::connect` needs, since binding the listener is
/// inherently async and `build()` itself is not.
pub struct BuiltServer {
	pub supervisor: Supervisor,
	pub driver: Box<dyn Driver>,
	pub hooks: Box<dyn Hooks>,
	pub listen_address: String,
	pub listen_port: u16,
	pub samples_per_block: u32,
	pub pipeline_config: PipelineConfig,
}

impl Config {
	/// First problem found, if any; `None` means `build()` will succeed.
	pub fn check(&self) -> Option<ConfigError> {
		match &self.driver {
			DriverConfig::Generator { channels, sampling_hz, .. } | DriverConfig::Replay { channels, sampling_hz, .. } => {
				if *sampling_hz == 0 {
					return Some(ConfigError::ZeroSamplingRate);
				}
				if *channels == 0 {
					return Some(ConfigError::ZeroChannels);
				}
			}
		}

		if parse_drift_policy(&self.drift_correction_policy).is_none() {
			return Some(ConfigError::UnrecognisedPolicy {
				token: "DriftCorrectionPolicy",
				value: self.drift_correction_policy.clone(),
			});
		}
		if parse_nan_policy(&self.nan_replacement_policy).is_none() {
			return Some(ConfigError::UnrecognisedPolicy {
				token: "NaNReplacementPolicy",
				value: self.nan_replacement_policy.clone(),
			});
		}

		if let Err(e) = std::net::TcpListener::bind((self.listen_address.as_str(), self.listen_port)) {
			return Some(ConfigError::PortInUse { port: self.listen_port, source: e });
		}

		None
	}

	pub fn build(self) -> Result<BuiltServer, ConfigError> {
		if let Some(e) = self.check() {
			return Err(e);
		}

		let policy = parse_drift_policy(&self.drift_correction_policy).expect("checked above");
		let nan_policy = parse_nan_policy(&self.nan_replacement_policy).expect("checked above");
		let experiment_info = self.experiment_info.map(Into::into).unwrap_or_default();

		let driver: Box<dyn Driver> = match self.driver {
			DriverConfig::Generator {
				channels,
				sampling_hz,
				waveform,
				nan_bursts,
			} => {
				let waveform = match waveform {
					WaveformConfig::Constant { value } => Waveform::Constant(value),
					WaveformConfig::Ramp { start, step } => Waveform::Ramp { start, step },
				};
				let mut generator = GeneratorDriver::new(channels, sampling_hz, waveform);
				for burst in nan_bursts {
					generator = generator.with_nan_burst(NanBurst {
						channels: burst.channels,
						samples: burst.start_sample..burst.end_sample,
					});
				}
				Box::new(generator)
			}
			DriverConfig::Replay { channels, sampling_hz, frames } => Box::new(ReplayDriver::new(channels, sampling_hz, frames)),
		};

		let pipeline_config = PipelineConfig {
			oversampling_factor: self.over_sampling_factor.clamp(1, 16),
			nan_policy,
			drift: DriftConfig {
				policy,
				tolerance_ms: self.drift_tolerance_duration_ms,
				jitter_estimation_count: self.jitter_estimation_count_for_drift,
				initial_skip_ms: self.drift_initial_skip_period_ms,
			},
			started_driver_sleep_ms: self.started_driver_sleep_duration_ms,
			stopped_driver_sleep_ms: self.stopped_driver_sleep_duration_ms,
			driver_timeout: std::time::Duration::from_millis(self.driver_timeout_duration_ms),
			experiment_info,
		};

		Ok(BuiltServer {
			supervisor: Supervisor::new(),
			driver,
			hooks: Box::new(NullHooks),
			listen_address: self.listen_address,
			listen_port: self.listen_port,
			samples_per_block: self.samples_per_block,
			pipeline_config,
		})
	}
}

fn parse_drift_policy(s: &str) -> Option<DriftCorrectionPolicy> {
	match s {
		"DriverChoice" => Some(DriftCorrectionPolicy::DriverChoice),
		"Forced" => Some(DriftCorrectionPolicy::Forced),
		"Disabled" => Some(DriftCorrectionPolicy::Disabled),
		_ => None,
	}
}

fn parse_nan_policy(s: &str) -> Option<NanPolicy> {
	match s {
		"LastCorrectValue" => Some(NanPolicy::LastCorrectValue),
		"Zero" => Some(NanPolicy::Zero),
		"Disabled" => Some(NanPolicy::Disabled),
		_ => None,
	}
}
