//! Listener selection and runtime configuration

mod common;

use common::{env_of, write_tls_files};
use std::path::PathBuf;
use supervisor::{
    resolve_listener, select_mode, ListenerDecision, ListenerMode, RuntimeConfig, RuntimeDefaults,
    SupervisorError,
};
use tempfile::TempDir;

fn defaults_with(key: PathBuf, cert: PathBuf) -> RuntimeDefaults {
    RuntimeDefaults {
        ssl_key_path: Some(key),
        ssl_cert_path: Some(cert),
        ..RuntimeDefaults::default()
    }
}

#[test]
fn test_unset_environment_is_plain_on_default_port() {
    let config = RuntimeConfig::from_lookup(env_of(&[]), &RuntimeDefaults::default()).unwrap();

    assert!(!config.use_ssl);
    assert_eq!(config.plain_port, 8080);
    assert_eq!(config.ssl_port, 8443);
    assert_eq!(select_mode(&config), ListenerMode::Plain);
    assert_eq!(config.active_port(), 8080);
}

#[test]
fn test_only_exact_true_selects_ssl() {
    for value in ["TRUE", "True", "1", "yes", " true", "false", ""] {
        let config =
            RuntimeConfig::from_lookup(env_of(&[("USE_SSL", value)]), &RuntimeDefaults::default())
                .unwrap();
        assert_eq!(select_mode(&config), ListenerMode::Plain, "USE_SSL={:?}", value);
    }

    let config =
        RuntimeConfig::from_lookup(env_of(&[("USE_SSL", "true")]), &RuntimeDefaults::default())
            .unwrap();
    assert_eq!(select_mode(&config), ListenerMode::Ssl);
}

#[test]
fn test_ports_and_paths_from_environment() {
    let lookup = env_of(&[
        ("USE_SSL", "true"),
        ("PORT", "9000"),
        ("SSL_PORT", "9443"),
        ("SSL_KEY_PATH", "/custom/key.pem"),
        ("SSL_CERT_PATH", "/custom/cert.pem"),
    ]);
    let defaults = defaults_with("/app/ssl/key.pem".into(), "/app/ssl/cert.pem".into());

    let config = RuntimeConfig::from_lookup(lookup, &defaults).unwrap();

    assert_eq!(config.plain_port, 9000);
    assert_eq!(config.ssl_port, 9443);
    assert_eq!(config.active_port(), 9443);
    assert_eq!(config.ssl_key_path, Some(PathBuf::from("/custom/key.pem")));
    assert_eq!(config.ssl_cert_path, Some(PathBuf::from("/custom/cert.pem")));
}

#[test]
fn test_empty_values_fall_back_to_defaults() {
    let lookup = env_of(&[("PORT", ""), ("SSL_PORT", ""), ("SSL_KEY_PATH", "")]);
    let defaults = defaults_with("/app/ssl/key.pem".into(), "/app/ssl/cert.pem".into());

    let config = RuntimeConfig::from_lookup(lookup, &defaults).unwrap();

    assert_eq!(config.plain_port, 8080);
    assert_eq!(config.ssl_port, 8443);
    assert_eq!(config.ssl_key_path, Some(PathBuf::from("/app/ssl/key.pem")));
}

#[test]
fn test_invalid_ports_are_rejected() {
    for (var, value) in [("PORT", "abc"), ("PORT", "0"), ("SSL_PORT", "70000"), ("SSL_PORT", "-1")] {
        let result = RuntimeConfig::from_lookup(env_of(&[(var, value)]), &RuntimeDefaults::default());
        match result {
            Err(SupervisorError::InvalidPort { var: got, value: raw }) => {
                assert_eq!(got, var);
                assert_eq!(raw, value);
            }
            other => panic!("expected InvalidPort for {}={}, got {:?}", var, value, other),
        }
    }
}

#[test]
fn test_plain_mode_never_touches_tls_files() {
    let defaults = defaults_with("/nonexistent/key.pem".into(), "/nonexistent/cert.pem".into());
    let config = RuntimeConfig::from_lookup(env_of(&[("PORT", "8081")]), &defaults).unwrap();

    let decision = resolve_listener(&config, "0.0.0.0").unwrap();

    assert_eq!(
        decision,
        ListenerDecision::PlainListen {
            host: "0.0.0.0".to_string(),
            port: 8081
        }
    );
    assert!(decision.tls().is_none());
}

#[test]
fn test_ssl_with_readable_files() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let (key, cert) = write_tls_files(temp_dir.path());
    let config =
        RuntimeConfig::from_lookup(env_of(&[("USE_SSL", "true")]), &defaults_with(key.clone(), cert.clone()))
            .unwrap();

    let decision = resolve_listener(&config, "0.0.0.0").unwrap();

    assert_eq!(decision.mode(), ListenerMode::Ssl);
    assert_eq!(decision.port(), 8443);
    let tls = decision.tls().unwrap();
    assert_eq!(tls.key_path, key);
    assert_eq!(tls.cert_path, cert);
}

#[test]
fn test_ssl_with_missing_cert_is_fatal() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let (key, _) = write_tls_files(temp_dir.path());
    let missing = temp_dir.path().join("missing.pem");
    let config =
        RuntimeConfig::from_lookup(env_of(&[("USE_SSL", "true")]), &defaults_with(key, missing.clone()))
            .unwrap();

    match resolve_listener(&config, "0.0.0.0") {
        Err(SupervisorError::TlsMaterial { var, path, .. }) => {
            assert_eq!(var, "SSL_CERT_PATH");
            assert_eq!(path, missing);
        }
        other => panic!("expected TlsMaterial error, got {:?}", other),
    }
}

#[test]
fn test_ssl_with_directory_as_key_is_fatal() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let (_, cert) = write_tls_files(temp_dir.path());
    let config = RuntimeConfig::from_lookup(
        env_of(&[("USE_SSL", "true")]),
        &defaults_with(temp_dir.path().to_path_buf(), cert),
    )
    .unwrap();

    let err = resolve_listener(&config, "0.0.0.0").unwrap_err();
    assert!(matches!(err, SupervisorError::TlsMaterial { var: "SSL_KEY_PATH", .. }));
}

#[test]
fn test_ssl_without_any_path_is_fatal() {
    let config =
        RuntimeConfig::from_lookup(env_of(&[("USE_SSL", "true")]), &RuntimeDefaults::default())
            .unwrap();

    let err = resolve_listener(&config, "0.0.0.0").unwrap_err();
    assert!(matches!(err, SupervisorError::MissingTlsPath("SSL_KEY_PATH")));
}

#[test]
fn test_resolution_is_repeatable() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let (key, cert) = write_tls_files(temp_dir.path());
    let lookup = env_of(&[("USE_SSL", "true"), ("SSL_PORT", "9443")]);
    let defaults = defaults_with(key, cert);

    let first = resolve_listener(&RuntimeConfig::from_lookup(&lookup, &defaults).unwrap(), "0.0.0.0").unwrap();
    let second = resolve_listener(&RuntimeConfig::from_lookup(&lookup, &defaults).unwrap(), "0.0.0.0").unwrap();

    assert_eq!(first, second);
}
