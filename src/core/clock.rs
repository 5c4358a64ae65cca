//! Time source used by the scheduler.

use chrono::{DateTime, Utc};

/// Source of the current time.
///
/// The scheduler reads time only through this trait so retry delays and
/// zombie thresholds can be tested without sleeping.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
