use std::sync::{
	atomic::{AtomicU64, Ordering},
	Arc,
};

/// This enum reports how far a batch decomposition has progressed.
#[derive(Debug)]
pub enum ExplainProgress {
	ExplainingRows(ProgressCounter),
}

/// A cheaply clonable counter that can be read from another thread while a batch runs. The total is the number of rows in the batch; the count is the number of rows decomposed so far.
#[derive(Clone, Debug)]
pub struct ProgressCounter {
	current: Arc<AtomicU64>,
	total: u64,
}

impl ProgressCounter {
	pub fn new(total: u64) -> ProgressCounter {
		ProgressCounter {
			current: Arc::new(AtomicU64::new(0)),
			total,
		}
	}

	pub fn total(&self) -> u64 {
		self.total
	}

	pub fn get(&self) -> u64 {
		self.current.load(Ordering::Relaxed)
	}

	pub fn inc(&self, amount: u64) {
		self.current.fetch_add(amount, Ordering::Relaxed);
	}
}
