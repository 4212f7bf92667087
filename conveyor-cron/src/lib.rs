//! Cron expressions for Conveyor job schedulers.
//!
//! Parses standard cron expressions (5, 6 or 7 fields) and computes their
//! next occurrences. The queue's repeat engine uses it to place the next
//! instance of a cron-driven job scheduler. Days of the week use the classic
//! numbering: 0 and 7 are Sunday, 1 is Monday.
//!
//! ## Quick Start
//!
//! ```
//! use conveyor_cron::CronExpression;
//!
//! // Parse a cron expression for "every hour"
//! let expr = CronExpression::parse("0 * * * *").unwrap();
//!
//! // Get next execution time
//! let now = chrono::Utc::now();
//! let next = expr.next_after(now);
//!
//! assert!(next.is_some());
//! assert!(next.unwrap() > now);
//!
//! // Millisecond timestamps, as stored by the queue
//! let millis = now.timestamp_millis();
//! assert!(expr.next_after_millis(millis).unwrap() > millis);
//! ```

pub mod error;
pub mod expression;

pub use error::{CronError, CronResult};
pub use expression::CronExpression;
