//! Integration tests for configuration loading and validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use framewire::config::{NetworkConfig, MAX_PAYLOAD_SIZE};
use framewire::{TlsOptions, VerifyMode};
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
    assert_eq!(config.transport.max_payload_size, MAX_PAYLOAD_SIZE);
    assert!(config.transport.tls.is_none());
}

#[test]
fn test_invalid_bind_address() {
    let mut config = NetworkConfig::default();
    config.server.bind_address = "not-an-ip".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid server bind address")));
}

#[test]
fn test_empty_bind_address() {
    let mut config = NetworkConfig::default();
    config.server.bind_address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_ipv6_bind_address_accepted() {
    let mut config = NetworkConfig::default();
    config.server.bind_address = "::".to_string();
    assert!(config.validate().is_empty());
}

#[test]
fn test_zero_backlog() {
    let mut config = NetworkConfig::default();
    config.server.backlog = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Backlog must be greater than 0")));
}

#[test]
fn test_handshake_timeout_bounds() {
    let mut config = NetworkConfig::default();
    config.server.handshake_timeout = Duration::from_millis(50);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Handshake timeout too short")));

    config.server.handshake_timeout = Duration::from_secs(400);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Handshake timeout too long")));
}

#[test]
fn test_connect_timeout_bounds() {
    let mut config = NetworkConfig::default();
    config.client.connect_timeout = Duration::from_millis(10);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Connect timeout too short")));

    config.client.connect_timeout = Duration::from_secs(301);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Connect timeout too long")));
}

#[test]
fn test_max_payload_size_bounds() {
    let mut config = NetworkConfig::default();
    config.transport.max_payload_size = 0;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max payload size cannot be 0")));

    config.transport.max_payload_size = 2 * 1024 * 1024 * 1024;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max payload size too large")));
}

#[test]
fn test_missing_tls_files_reported() {
    let mut config = NetworkConfig::default();
    config.transport.tls = Some(
        TlsOptions::new()
            .set_certificate_file("/nonexistent/server.crt")
            .set_private_key_file("/nonexistent/server.key"),
    );

    let errors = config.validate();
    assert_eq!(
        errors.iter().filter(|e| e.contains("does not exist")).count(),
        2
    );
}

#[test]
fn test_tls_certificate_without_key() {
    let dir = tempfile::tempdir().unwrap();
    let cert = dir.path().join("server.crt");
    std::fs::write(&cert, "placeholder").unwrap();

    let options = TlsOptions::new().set_certificate_file(&cert);
    assert!(options
        .validate(false)
        .iter()
        .any(|e| e.contains("must be set together")));
    assert!(options
        .validate(true)
        .iter()
        .any(|e| e.contains("needs both certificate_file and private_key_file")));
}

#[test]
fn test_app_name_bounds() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = String::new();
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));

    config.logging.app_name = "a".repeat(65);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Application name too long")));
}

#[test]
fn test_validate_strict() {
    assert!(NetworkConfig::default().validate_strict().is_ok());

    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.backlog = 0;
        c.transport.max_payload_size = 0;
    });
    let err = config.validate_strict().unwrap_err().to_string();
    assert!(err.contains("Configuration validation failed"));
    assert!(err.contains("Backlog"));
    assert!(err.contains("Max payload size"));
}

#[test]
fn test_toml_sections_are_optional() {
    let config = NetworkConfig::from_toml("").unwrap();
    assert_eq!(config, NetworkConfig::default());

    let config = NetworkConfig::from_toml(
        r#"
        [server]
        bind_address = "127.0.0.1"
        handshake_timeout = 2500

        [client]
        connect_timeout = 750

        [transport.tls]
        ca_file = "ca.pem"
        verify_mode = "require_peer"
        server_name = "chat.local"

        [logging]
        log_level = "debug"
        json_format = true
        "#,
    )
    .unwrap();

    assert_eq!(config.server.bind_address, "127.0.0.1");
    assert_eq!(config.server.handshake_timeout, Duration::from_millis(2500));
    assert_eq!(config.server.backlog, NetworkConfig::default().server.backlog);
    assert_eq!(config.client.connect_timeout, Duration::from_millis(750));
    assert_eq!(config.logging.log_level, Level::DEBUG);
    assert!(config.logging.json_format);

    let tls = config.transport.tls.unwrap();
    assert_eq!(tls.verify_mode, VerifyMode::RequirePeer);
    assert_eq!(tls.server_name.as_deref(), Some("chat.local"));
    assert!(tls.certificate_file.is_none());
}

#[test]
fn test_invalid_toml_rejected() {
    assert!(NetworkConfig::from_toml("[server]\nport = \"sixty\"").is_err());
    assert!(NetworkConfig::from_toml("[logging]\nlog_level = \"loud\"").is_err());
    assert!(NetworkConfig::from_toml("[transport.tls]\nverify_mode = \"maybe\"").is_err());
}

#[test]
fn test_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("framewire.toml");

    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.port = 4242;
        c.logging.log_level = Level::WARN;
        c.transport.tls = Some(TlsOptions::new().set_server_name("example.org"));
    });
    config.save_to_file(&path).unwrap();

    let reloaded = NetworkConfig::from_file(&path).unwrap();
    assert_eq!(reloaded, config);
}

#[test]
fn test_missing_file_is_config_error() {
    let err = NetworkConfig::from_file("/nonexistent/framewire.toml").unwrap_err();
    assert!(err.to_string().contains("Failed to open config file"));
}

#[test]
fn test_example_config_parses() {
    let example = NetworkConfig::example_config();
    assert!(example.contains("[server]"));
    assert_eq!(
        NetworkConfig::from_toml(&example).unwrap(),
        NetworkConfig::default()
    );
}

#[test]
fn test_env_overrides() {
    std::env::set_var("FRAMEWIRE_PORT", "61000");
    std::env::set_var("FRAMEWIRE_CONNECT_TIMEOUT_MS", "1500");
    std::env::set_var("FRAMEWIRE_LOG_LEVEL", "trace");

    let config = NetworkConfig::from_env().unwrap();
    assert_eq!(config.server.port, 61000);
    assert_eq!(config.client.connect_timeout, Duration::from_millis(1500));
    assert_eq!(config.server.handshake_timeout, Duration::from_millis(1500));
    assert_eq!(config.logging.log_level, Level::TRACE);

    std::env::set_var("FRAMEWIRE_PORT", "not-a-port");
    assert!(NetworkConfig::from_env().is_err());

    std::env::remove_var("FRAMEWIRE_PORT");
    std::env::remove_var("FRAMEWIRE_CONNECT_TIMEOUT_MS");
    std::env::remove_var("FRAMEWIRE_LOG_LEVEL");
}
