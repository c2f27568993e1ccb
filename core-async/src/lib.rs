//! Runtime abstraction layer for the audio cache crates.
//!
//! Every `core-*` crate goes through this crate instead of naming Tokio
//! directly, so the executor, the file-system helpers and the synchronization
//! primitives are chosen in exactly one place.
//!
//! # Modules
//!
//! - `task`: task spawning and join handles
//! - `time`: sleeping, timeouts and instants
//! - `sync`: async locks, channels, semaphores and cancellation tokens
//! - `fs`: async file-system operations used by the disk tiers
//! - `io`: async read/write extension traits
//!
//! # Examples
//!
//! ```rust
//! use core_async::task;
//! use core_async::time::{sleep, Duration};
//!
//! async fn example() {
//!     let handle = task::spawn(async {
//!         sleep(Duration::from_millis(5)).await;
//!         42
//!     });
//!     assert_eq!(handle.await.unwrap(), 42);
//! }
//! ```

pub mod fs;
pub mod io;
pub mod sync;
pub mod task;
pub mod time;

pub use task::spawn;
pub use time::{sleep, Duration, Instant};
