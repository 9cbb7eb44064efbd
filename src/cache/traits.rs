//! Core traits for the caching system.

/// A cache whose expired entries can be evicted independently of access.
pub trait Sweep: Send + Sync {
  /// Remove every expired entry, returning the number evicted.
  fn sweep(&self) -> usize;

  /// Short label used in log lines.
  fn name(&self) -> &'static str;
}
