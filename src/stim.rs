//! Ordered sequence of `(id, date, duration)` stimulations. Dates are not
//! required to be sorted -- the pipeline appends with monotone sample-derived
//! dates in practice, but drift correction rewrites dates in place, so no
//! ordering invariant is enforced here.

use crate::time::Time;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stimulation {
	pub id: u64,
	pub date: Time,
	pub duration: Time,
}

#[derive(Debug, Clone, Default)]
pub struct StimulationSet {
	entries: Vec<Stimulation>,
}

impl StimulationSet {
	pub fn new() -> Self {
		Self { entries: Vec::new() }
	}

	pub fn push_back(&mut self, id: u64, date: Time, duration: Time) {
		self.entries.push(Stimulation { id, date, duration });
	}

	pub fn size(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn get(&self, i: usize) -> Stimulation {
		self.entries[i]
	}

	pub fn get_id(&self, i: usize) -> u64 {
		self.entries[i].id
	}

	pub fn get_date(&self, i: usize) -> Time {
		self.entries[i].date
	}

	pub fn get_duration(&self, i: usize) -> Time {
		self.entries[i].duration
	}

	pub fn set_date(&mut self, i: usize, date: Time) {
		self.entries[i].date = date;
	}

	pub fn erase(&mut self, i: usize) {
		self.entries.remove(i);
	}

	pub fn clear(&mut self) {
		self.entries.clear();
	}

	pub fn iter(&self) -> impl Iterator<Item = &Stimulation> {
		self.entries.iter()
	}

	/// Append every entry of `src`, shifting each date by `shift`.
	pub fn append(&mut self, src: &StimulationSet, shift: Time) {
		self.append_range(src, 0, src.size(), shift);
	}

	/// Append entries `[start, end)` of `src`, shifting each date by `shift`.
	pub fn append_range(&mut self, src: &StimulationSet, start: usize, end: usize, shift: Time) {
		for entry in &src.entries[start..end] {
			self.entries.push(Stimulation {
				id: entry.id,
				date: entry.date + shift,
				duration: entry.duration,
			});
		}
	}

	/// Drop every entry whose date lies in `[start, end)`.
	pub fn remove_range(&mut self, start: Time, end: Time) {
		self.entries.retain(|e| !(e.date >= start && e.date < end));
	}

	/// Copy the contents of `src` into `self`, shifting every date by `shift`.
	pub fn copy(&mut self, src: &StimulationSet, shift: Time) {
		self.clear();
		self.append(src, shift);
	}

	/// Every entry with `lo <= date <= hi`, re-dated `date - max(0, date - offset)`.
	///
	/// Mirrors the per-client re-dating done in the pipeline hot loop (§4.8):
	/// a stimulation that arrived before the client's stimulation offset keeps
	/// its date, one that arrived after is clamped back to the offset.
	pub fn select_and_rebase(&self, lo: Time, hi: Time, offset: Time) -> StimulationSet {
		let mut out = StimulationSet::new();
		for entry in &self.entries {
			if entry.date >= lo && entry.date <= hi {
				let shift_back = if entry.date > offset {
					entry.date - offset
				} else {
					Time::ZERO
				};
				out.push_back(entry.id, entry.date - shift_back, entry.duration);
			}
		}
		out
	}

	/// Clamp every date greater than `bound` down to `bound`, in place.
	pub fn clamp_dates_to(&mut self, bound: Time) {
		for entry in self.entries.iter_mut() {
			if entry.date > bound {
				entry.date = bound;
			}
		}
	}
}
