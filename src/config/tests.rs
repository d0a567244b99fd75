//! Configuration tests

use super::*;

#[test]
fn test_default_config() {
    let cfg = Config::default();

    assert_eq!(cfg.log.level, "info");
    assert_eq!(cfg.server.bind.port(), 1883);
    assert_eq!(cfg.server.workers, 0);
    assert_eq!(cfg.limits.max_connections, 100_000);
    assert_eq!(cfg.limits.max_packet_size, 1024 * 1024);
    assert_eq!(cfg.session.default_keep_alive, 0);
    assert_eq!(cfg.scripts.sync_timeout_ms, 10_000);
}

#[test]
fn test_parse_full_toml() {
    let cfg = Config::from_toml(
        r#"
        [log]
        level = "debug"

        [server]
        bind = "127.0.0.1:2883"
        workers = 4

        [limits]
        max_connections = 500
        max_packet_size = 65536

        [session]
        default_keep_alive = 30
        cleanup_interval = 5
        connect_timeout = 10

        [scripts]
        sync_timeout_ms = 2500
        "#,
    )
    .unwrap();

    assert_eq!(cfg.log.level, "debug");
    assert_eq!(cfg.server.bind.port(), 2883);
    assert_eq!(cfg.server.workers, 4);
    assert_eq!(cfg.limits.max_connections, 500);
    assert_eq!(cfg.limits.max_packet_size, 65536);
    assert_eq!(cfg.session.default_keep_alive, 30);
    assert_eq!(cfg.session.cleanup_interval, 5);
    assert_eq!(cfg.scripts.sync_timeout_ms, 2500);
}

#[test]
fn test_partial_toml_keeps_defaults() {
    let cfg = Config::from_toml(
        r#"
        [server]
        bind = "0.0.0.0:1884"
        "#,
    )
    .unwrap();

    assert_eq!(cfg.server.bind.port(), 1884);
    assert_eq!(cfg.log.level, "info");
    assert_eq!(cfg.limits.max_connections, 100_000);
}

#[test]
fn test_invalid_toml_is_rejected() {
    assert!(Config::from_toml("not valid [ toml").is_err());
    assert!(Config::from_toml("[server]\nbind = \"not-an-addr\"").is_err());
}

#[test]
fn test_zero_limits_are_rejected() {
    let result = Config::from_toml(
        r#"
        [limits]
        max_packet_size = 0
        "#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_broker_config_derivation() {
    let cfg = Config::from_toml(
        r#"
        [server]
        bind = "127.0.0.1:2883"

        [session]
        cleanup_interval = 7

        [scripts]
        sync_timeout_ms = 1234
        "#,
    )
    .unwrap();

    let broker = cfg.broker_config();
    assert_eq!(broker.bind_addr.port(), 2883);
    assert_eq!(broker.cleanup_interval, Duration::from_secs(7));
    assert_eq!(broker.sync_script_timeout, Duration::from_millis(1234));
}
