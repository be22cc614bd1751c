//! Process-wide "no gate required" override.
//!
//! Resolved once at startup and shared by every session. It can be flipped while
//! sessions are live (an authorization change), so readers consult it each time
//! they compute an artifact's effective question count instead of caching it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

#[derive(Clone, Debug, Default)]
pub struct GateOverride {
  bypass: Arc<AtomicBool>,
}

impl GateOverride {
  pub fn new(bypass: bool) -> Self {
    Self { bypass: Arc::new(AtomicBool::new(bypass)) }
  }

  pub fn is_bypassed(&self) -> bool {
    self.bypass.load(Ordering::Acquire)
  }

  pub fn set_bypass(&self, bypass: bool) {
    let prev = self.bypass.swap(bypass, Ordering::AcqRel);
    if prev != bypass {
      info!(target: "session", bypass, "Gate override changed");
    }
  }

  /// Question count after the override: 0 when bypassed.
  pub fn effective_total(&self, total_questions: u32) -> u32 {
    if self.is_bypassed() { 0 } else { total_questions }
  }
}
