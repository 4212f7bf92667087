// Conveyor - a persistent job queue for Rust
//
// This library re-exports the queue engine and, with the `cron` feature, the
// cron pattern parser used by job schedulers.

// Re-export core functionality
pub use conveyor_queue::*;

// Re-export optional crates
#[cfg(feature = "cron")]
pub use conveyor_cron;
