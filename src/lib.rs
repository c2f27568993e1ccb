//! Workspace umbrella crate.
//!
//! Host applications depend on `audio-cache-workspace` and pick a feature:
//! `desktop-shims` pulls in the fully wired `core-service` (reqwest-backed
//! network access included), `playback-only` exposes just the cache tiers so
//! a host can supply its own `HttpClient`.

#[cfg(feature = "desktop-shims")]
pub use core_service as service;

#[cfg(feature = "playback-only")]
pub use core_playback as playback;
