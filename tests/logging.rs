//! Subscriber installation from `LoggingConfig`
//!
//! Runs in its own test binary since the global subscriber can be set only once.

#![allow(clippy::unwrap_used)]

use framelink::config::LoggingConfig;
use framelink::error::ProtocolError;
use framelink::utils::logging::init_logging;

#[test]
fn test_init_logging_installs_once() {
    let missing_path = LoggingConfig {
        log_to_file: true,
        log_file_path: None,
        ..LoggingConfig::default()
    };
    assert!(matches!(
        init_logging(&missing_path),
        Err(ProtocolError::ConfigError(_))
    ));

    let config = LoggingConfig {
        json_format: true,
        ..LoggingConfig::default()
    };
    init_logging(&config).unwrap();

    // A second global subscriber is refused
    assert!(matches!(
        init_logging(&config),
        Err(ProtocolError::ConfigError(_))
    ));
}
