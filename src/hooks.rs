//! Plug-in hook interface. Replaces the source's inheritance hierarchy with
//! a trait of default no-ops; instances are registered in an ordered list,
//! producers (LSL outlet, debug fiddler) before consumers.

use crate::pipeline::PendingRing;
use crate::stim::StimulationSet;
use crate::time::Time;

/// Called at points in the pipeline lifecycle and hot loop. All methods
/// default to no-ops (or, for `start`, unconditional acceptance) so a hook
/// only needs to implement what it cares about.
pub trait Hooks: Send {
	/// Called once right after the pipeline connects to a driver.
	fn create(&mut self) {}

	/// Called on the `Connected -> Started` transition; returning `false`
	/// aborts the start.
	fn start(&mut self, _channel_names: &[String], _rate: u32, _channels: u16, _samples_per_block: u32) -> bool {
		true
	}

	fn stop(&mut self) {}

	/// Called once per emitted block, before per-client fan-out, with the
	/// ring contents windowed to the block and the pending stimulation set
	/// for the same span. Both are mutable: a producing plug-in (e.g. a
	/// debug fiddler) may alter samples or stimulations in place; a purely
	/// observing plug-in (e.g. an LSL bridge) must not reorder or delete
	/// entries.
	fn loop_hook(&mut self, _ring: &mut PendingRing, _stimulations: &mut StimulationSet, _start_time: Time, _end_time: Time, _last_time: Time) {}

	/// Called once per newly accepted client connection.
	fn accept_new_connection(&mut self) {}
}

/// No-op implementation, used when no plug-in host is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHooks;

impl Hooks for NullHooks {}

/// Ordered dispatch list; producers (e.g. an LSL outlet) should be
/// registered before consumers (e.g. a debug fiddler) so that anything a
/// consumer observes has already been produced this iteration.
#[derive(Default)]
pub struct HookChain {
	hooks: Vec<Box<dyn Hooks>>,
}

impl HookChain {
	pub fn new() -> Self {
		Self { hooks: Vec::new() }
	}

	pub fn register(&mut self, hook: Box<dyn Hooks>) {
		self.hooks.push(hook);
	}
}

impl Hooks for HookChain {
	fn create(&mut self) {
		for h in &mut self.hooks {
			h.create();
		}
	}

	fn start(&mut self, channel_names: &[String], rate: u32, channels: u16, samples_per_block: u32) -> bool {
		let mut accepted = true;
		for h in &mut self.hooks {
			accepted &= h.start(channel_names, rate, channels, samples_per_block);
		}
		accepted
	}

	fn stop(&mut self) {
		for h in &mut self.hooks {
			h.stop();
		}
	}

	fn loop_hook(&mut self, ring: &mut PendingRing, stimulations: &mut StimulationSet, start_time: Time, end_time: Time, last_time: Time) {
		for h in &mut self.hooks {
			h.loop_hook(ring, stimulations, start_time, end_time, last_time);
		}
	}

	fn accept_new_connection(&mut self) {
		for h in &mut self.hooks {
			h.accept_new_connection();
		}
	}
}

/// In-process test double: records every call it receives so a test can
/// assert on hook-dispatch ordering and arguments without an external
/// plug-in host.
pub struct LoopbackHooks {
	pub creates: u32,
	pub starts: Vec<(Vec<String>, u32, u16, u32)>,
	/// What `start` returns; flip to `false` to exercise hook-rejected starts.
	pub start_result: bool,
	pub stops: u32,
	pub loop_calls: Vec<(Time, Time, Time)>,
	pub accepts: u32,
}

impl Default for LoopbackHooks {
	fn default() -> Self {
		Self {
			creates: 0,
			starts: Vec::new(),
			start_result: true,
			stops: 0,
			loop_calls: Vec::new(),
			accepts: 0,
		}
	}
}

impl Hooks for LoopbackHooks {
	fn create(&mut self) {
		self.creates += 1;
	}

	fn start(&mut self, channel_names: &[String], rate: u32, channels: u16, samples_per_block: u32) -> bool {
		self.starts.push((channel_names.to_vec(), rate, channels, samples_per_block));
		self.start_result
	}

	fn stop(&mut self) {
		self.stops += 1;
	}

	fn loop_hook(&mut self, _ring: &mut PendingRing, _stimulations: &mut StimulationSet, start_time: Time, end_time: Time, last_time: Time) {
		self.loop_calls.push((start_time, end_time, last_time));
	}

	fn accept_new_connection(&mut self) {
		self.accepts += 1;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn null_hooks_accepts_every_call() {
		let mut hooks = NullHooks;
		hooks.create();
		assert!(hooks.start(&["Cz".to_string()], 512, 1, 32));
		let mut rows: Vec<Vec<f64>> = vec![vec![0.0]];
		let mut ring = PendingRing::new(&mut rows);
		let mut stims = StimulationSet::new();
		hooks.loop_hook(&mut ring, &mut stims, Time::ZERO, Time::ZERO, Time::ZERO);
		hooks.accept_new_connection();
		hooks.stop();
	}

	#[test]
	fn chain_dispatches_to_every_registered_hook_in_order() {
		let mut chain = HookChain::new();
		chain.register(Box::new(LoopbackHooks::default()));
		chain.register(Box::new(LoopbackHooks::default()));
		chain.create();
		assert!(chain.start(&[], 100, 1, 10));
		let mut rows: Vec<Vec<f64>> = Vec::new();
		let mut ring = PendingRing::new(&mut rows);
		let mut stims = StimulationSet::new();
		chain.loop_hook(&mut ring, &mut stims, Time::ZERO, Time::ZERO, Time::ZERO);
		chain.accept_new_connection();
		chain.stop();
		assert_eq!(chain.hooks.len(), 2);
	}

	#[test]
	fn chain_aggregates_start_results_with_and() {
		let mut chain = HookChain::new();
		chain.register(Box::new(LoopbackHooks::default()));
		let mut rejecting = LoopbackHooks::default();
		rejecting.start_result = false;
		chain.register(Box::new(rejecting));
		chain.register(Box::new(LoopbackHooks::default()));

		assert!(!chain.start(&[], 100, 1, 10), "one rejecting hook must veto the whole chain");
	}

	#[test]
	fn loopback_hooks_records_calls() {
		let mut hooks = LoopbackHooks::default();
		hooks.create();
		hooks.create();
		assert!(hooks.start(&["Cz".to_string(), "Fz".to_string()], 512, 2, 32));
		let mut rows: Vec<Vec<f64>> = Vec::new();
		let mut ring = PendingRing::new(&mut rows);
		let mut stims = StimulationSet::new();
		hooks.loop_hook(&mut ring, &mut stims, Time::ZERO, Time::of_samples(100, 10), Time::ZERO);
		hooks.accept_new_connection();
		hooks.accept_new_connection();
		assert_eq!(hooks.creates, 2);
		assert_eq!(hooks.starts.len(), 1);
		assert_eq!(hooks.starts[0].1, 512);
		assert_eq!(hooks.loop_calls.len(), 1);
		assert_eq!(hooks.accepts, 2);
	}
}
