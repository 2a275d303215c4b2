//! Configuration tests
//!
//! Environment-variable parsing is process-global state, so these tests
//! avoid mutating the environment and exercise the pure pieces: defaults
//! and the validation helpers.

use super::*;

#[test]
fn test_defaults_are_sane() {
    let config = Config::default();
    assert_eq!(config.listen_addr.port(), 8080);
    assert_eq!(config.proxy_path_prefix, "/v1");
    assert_eq!(config.request_timeout, Duration::from_secs(30));
    assert_eq!(config.rate_limit.max_concurrent_requests, 100);
    assert!(config.rate_limit.admission_wait <= Duration::from_millis(100));
    assert_eq!(config.bus.backend, BusBackend::Memory);
    assert!(config.bus.capacity > 0);
    assert!(config.dispatcher.max_retries > 0);
    assert!(config.dispatcher.fallback_on_failure);
}

#[test]
fn test_env_parse_falls_back() {
    // A variable that cannot exist in a sane environment
    assert_eq!(env_parse("LLMGATE_TEST_UNSET_VALUE_XYZ", 42u32), 42);
}

#[test]
fn test_env_bool_defaults() {
    assert!(env_bool("LLMGATE_TEST_UNSET_FLAG_XYZ", true));
    assert!(!env_bool("LLMGATE_TEST_UNSET_FLAG_XYZ", false));
}

#[test]
fn test_dispatcher_settings_defaults() {
    let settings = DispatcherSettings::default();
    assert_eq!(settings.batch_size, 50);
    assert_eq!(settings.flush_interval, Duration::from_secs(1));
    assert_eq!(settings.max_retries, 3);
    assert_eq!(settings.retry_base_delay, Duration::from_millis(200));
}
