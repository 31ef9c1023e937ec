use std::sync::{
  Arc,
  atomic::{AtomicUsize, Ordering},
};

#[derive(Debug, Clone, Default)]
/// Counter for serving connections, shared among all proxy listeners
pub struct ConnectionCount(Arc<AtomicUsize>);

impl ConnectionCount {
  pub(crate) fn current(&self) -> usize {
    self.0.load(Ordering::Relaxed)
  }

  pub(crate) fn increment(&self) -> usize {
    self.0.fetch_add(1, Ordering::Relaxed)
  }

  /// Saturating decrement, never goes below zero
  pub(crate) fn decrement(&self) -> usize {
    self
      .0
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
      .unwrap_or(0)
  }
}
