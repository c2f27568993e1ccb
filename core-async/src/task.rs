//! Task spawning.
//!
//! Background work (preload fetches, bridge range fetches) is spawned through
//! [`spawn`], which hands the future to the ambient Tokio runtime.

pub use tokio::task::{spawn_blocking, yield_now, AbortHandle, JoinError, JoinHandle};

/// Spawns a new asynchronous task on the current runtime.
///
/// The task may run on any worker thread, hence the `Send + 'static` bounds.
///
/// ```rust
/// use core_async::task::spawn;
///
/// # async fn example() {
/// let handle = spawn(async { 7 });
/// assert_eq!(handle.await.unwrap(), 7);
/// # }
/// ```
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::task::spawn(future)
}

/// Result type for task operations.
pub type Result<T> = std::result::Result<T, JoinError>;
