//! Time-related operations: sleeping, timeouts and monotonic instants.
//!
//! ```rust
//! use core_async::time::{sleep, timeout, Duration};
//!
//! async fn example() {
//!     let quick = timeout(Duration::from_millis(50), async { 1 }).await;
//!     assert_eq!(quick.unwrap(), 1);
//!     sleep(Duration::from_millis(1)).await;
//! }
//! ```

pub use tokio::time::{interval, sleep, sleep_until, timeout, Interval, Sleep, Timeout};

pub use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Error returned by [`timeout`] when the deadline elapses first.
pub use tokio::time::error::Elapsed;
