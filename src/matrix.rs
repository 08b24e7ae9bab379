//! Dense row-major `f64` tensor with per-axis labels. Used to hand a
//! `channels x samples_per_block` window of the pending ring to a client
//! without copying the whole ring.

#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
	buffer: Vec<f64>,
	dim_sizes: Vec<usize>,
	dim_labels: Vec<Vec<String>>,
}

impl Matrix {
	pub fn new(dim_sizes: Vec<usize>) -> Self {
		let total: usize = dim_sizes.iter().product();
		let dim_labels = dim_sizes.iter().map(|_| Vec::new()).collect();
		Self {
			buffer: vec![0.0; total],
			dim_sizes,
			dim_labels,
		}
	}

	pub fn dim_sizes(&self) -> &[usize] {
		&self.dim_sizes
	}

	pub fn dim_labels(&self, axis: usize) -> &[String] {
		&self.dim_labels[axis]
	}

	pub fn set_dim_labels(&mut self, axis: usize, labels: Vec<String>) {
		assert_eq!(labels.len(), self.dim_sizes[axis]);
		self.dim_labels[axis] = labels;
	}

	pub fn buffer(&self) -> &[f64] {
		&self.buffer
	}

	pub fn buffer_mut(&mut self) -> &mut [f64] {
		&mut self.buffer
	}

	pub fn element_count(&self) -> usize {
		self.buffer.len()
	}

	/// Discards content, keeps labels if the new shape matches the old one's
	/// axis count and sizes agree; otherwise resets labels to empty.
	pub fn resize(&mut self, dim_sizes: Vec<usize>) {
		let total: usize = dim_sizes.iter().product();
		self.buffer = vec![0.0; total];
		if dim_sizes != self.dim_sizes {
			self.dim_labels = dim_sizes.iter().map(|_| Vec::new()).collect();
		}
		self.dim_sizes = dim_sizes;
	}

	/// Copy shape and labels from `src`, discarding this matrix's content.
	pub fn copy_description(&mut self, src: &Matrix) {
		self.dim_sizes = src.dim_sizes.clone();
		self.dim_labels = src.dim_labels.clone();
		self.buffer = vec![0.0; src.element_count()];
	}

	/// Copy buffer content from `src`. Panics if element counts disagree --
	/// callers are expected to have matched shapes via `copy_description`
	/// or to know the shapes agree by construction.
	pub fn copy_content(&mut self, src: &Matrix) {
		assert_eq!(
			self.element_count(),
			src.element_count(),
			"copy_content requires equal element counts"
		);
		self.buffer.copy_from_slice(&src.buffer);
	}

	/// Elementwise sanity check: every element finite (and non-NaN whenever
	/// `check_nan` is set; every element non-infinite whenever `check_inf`
	/// is set).
	pub fn is_buffer_valid(&self, check_nan: bool, check_inf: bool) -> bool {
		self.buffer
			.iter()
			.all(|&v| (!check_nan || !v.is_nan()) && (!check_inf || !v.is_infinite()))
	}
}
