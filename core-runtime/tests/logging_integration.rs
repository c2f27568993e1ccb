//! Integration tests for logging system

use bridge_traits::time::LogLevel;
use core_runtime::logging::{init_logging, redact_url, strip_path, LogFormat, LoggingConfig};
use core_runtime::Error;

#[test]
fn test_logging_initialization_once() {
    // A global subscriber can only be installed once per process
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Debug);

    init_logging(config.clone()).expect("first init succeeds");
    tracing::info!(track_id = "42", "logging initialised");

    let second = init_logging(config);
    assert!(matches!(second, Err(Error::AlreadyInitialized)));
}

#[test]
fn test_invalid_filter_rejected_before_install() {
    let config = LoggingConfig::default().with_filter("core_playback=[");
    assert!(matches!(init_logging(config), Err(Error::Config(_))));
}

#[test]
fn test_source_urls_never_leak_query() {
    let url = "https://media.example.com/tracks/abc.flac?X-Amz-Signature=deadbeef";
    let redacted = redact_url(url);

    assert!(redacted.starts_with("https://media.example.com/tracks/abc.flac"));
    assert!(!redacted.contains("deadbeef"));
}

#[test]
fn test_path_stripping() {
    assert_eq!(strip_path("/tmp/root/MusicTemp/7.mp3.tmp"), "7.mp3.tmp");
    assert_eq!(strip_path("relative/MusicCache/index.json"), "index.json");
}
