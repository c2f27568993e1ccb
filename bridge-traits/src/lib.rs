//! # Host Bridge Traits
//!
//! Capabilities the audio cache needs from its host but does not implement
//! itself.
//!
//! ## Traits
//!
//! - [`HttpClient`](http::HttpClient) - range-capable streaming downloads with
//!   a declared total content length
//! - [`Clock`](time::Clock) - time source for ledger timestamps and preload
//!   ordering, replaceable in tests
//!
//! ## Platform Requirements
//!
//! | Platform | Implementation Crate |
//! |----------|---------------------|
//! | Desktop  | `bridge-desktop`    |
//! | Other    | host-provided       |
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! convert platform errors into it and keep messages actionable (status codes,
//! URLs, timeouts).
//!
//! ## Thread Safety
//!
//! Bridge traits require `Send + Sync`: preload workers and the stream bridge
//! call them from spawned tasks concurrently.

pub mod error;
pub mod http;
pub mod time;

pub use error::BridgeError;

pub use http::{ByteRange, ByteStream, HttpClient, HttpMethod, HttpRequest, HttpStream, RetryPolicy};
pub use time::{Clock, LogLevel, ManualClock, SystemClock};
