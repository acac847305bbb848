use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Cooperative cancellation flag shared between a build driver and the
/// request tracker.
///
/// The tracker consults the signal after every awaited request body. It never
/// interrupts a body mid-flight, so aborting leaves the request graph in a
/// consistent state.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal {
  aborted: Arc<AtomicBool>,
}

impl AbortSignal {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn abort(&self) {
    self.aborted.store(true, Ordering::SeqCst);
  }

  pub fn aborted(&self) -> bool {
    self.aborted.load(Ordering::SeqCst)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn clones_share_the_flag() {
    let signal = AbortSignal::new();
    let clone = signal.clone();

    assert!(!clone.aborted());
    signal.abort();
    assert!(clone.aborted());
  }
}
