use std::time::Duration;

use poolbus_core::config::{ConfigError, EngineConfig, FlowControl, Parity, TransportKind};
use poolbus_core::engine::DuplicatePolicy;
use pretty_assertions::assert_eq;

const SAMPLE: &str = r#"{
    "rs485Port": "/dev/ttyAMA0",
    "portSettings": { "baudRate": 9600, "dataBits": 8, "parity": "none", "stopBits": 1, "flowControl": "none" },
    "netConnect": true,
    "netHost": "bridge.local",
    "netPort": 9801,
    "inactivityRetry": 30,
    "responseTimeouts": { "controller": 2500, "pump": 1500, "chlorinator": 1000 },
    "defaultRetries": 5,
    "duplicateResponses": "all"
}"#;

#[test]
fn test_parse_sample() {
    let config = EngineConfig::from_json_str(SAMPLE).unwrap();

    assert_eq!(config.transport_kind(), TransportKind::Net);
    assert_eq!(config.net_address(), "bridge.local:9801");
    assert_eq!(config.rs485_port, "/dev/ttyAMA0");
    assert_eq!(config.port_settings.parity, Parity::None);
    assert_eq!(config.port_settings.flow_control, FlowControl::None);
    assert_eq!(config.inactivity_retry(), Some(Duration::from_secs(30)));
    assert_eq!(config.duplicate_responses, DuplicatePolicy::All);

    let defaults = config.command_defaults();
    assert_eq!(defaults.tries, 5);
    assert_eq!(defaults.pump_timeout, Duration::from_millis(1500));
    assert_eq!(defaults.chlorinator_timeout, Duration::from_millis(1000));
}

#[test]
fn test_parse_legacy_comms_section() {
    let json = r#"{
        "rs485Port": "/dev/ttyUSB0",
        "portSettings": { "baudRate": 9600, "dataBits": 8, "parity": "none", "stopBits": 1, "flowControl": false, "autoOpen": false, "lock": false },
        "mockPort": false,
        "netConnect": false,
        "netHost": "raspberrypi",
        "netPort": 9801,
        "inactivityRetry": 10
    }"#;
    let config = EngineConfig::from_json_str(json).unwrap();

    assert_eq!(config, EngineConfig::default());
    assert_eq!(config.port_settings.flow_control, FlowControl::None);

    let hardware = EngineConfig::from_json_str(r#"{"portSettings": {"flowControl": true}}"#).unwrap();
    assert_eq!(hardware.port_settings.flow_control, FlowControl::Hardware);
}

#[test]
fn test_missing_keys_use_defaults() {
    let config = EngineConfig::from_json_str("{}").unwrap();
    let defaults = EngineConfig::default();

    assert_eq!(config.transport_kind(), TransportKind::Serial);
    assert_eq!(config.rs485_port, defaults.rs485_port);
    assert_eq!(config.min_frame_bytes, defaults.min_frame_bytes);
    assert_eq!(config.process_interval(), defaults.process_interval());
    assert!(config.collision_backoff);
    assert!(!config.suppress_write);
}

#[test]
fn test_mock_wins_over_net() {
    let config = EngineConfig::from_json_str(r#"{"netConnect": true, "mockPort": true}"#).unwrap();
    assert_eq!(config.transport_kind(), TransportKind::Mock);
}

#[test]
fn test_invalid_settings_rejected() {
    let bad = [
        r#"{"portSettings": {"baudRate": 0}}"#,
        r#"{"portSettings": {"stopBits": 3}}"#,
        r#"{"netConnect": true, "netPort": 0}"#,
        r#"{"rs485Port": "  "}"#,
    ];
    for json in bad {
        assert!(
            matches!(EngineConfig::from_json_str(json), Err(ConfigError::Invalid(_))),
            "accepted {}",
            json
        );
    }
}

#[test]
fn test_malformed_json() {
    assert!(matches!(
        EngineConfig::from_json_str("{ not json"),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("poolbus.json");
    std::fs::write(&path, SAMPLE).unwrap();

    let config = EngineConfig::from_file(&path).unwrap();
    assert_eq!(config.net_host, "bridge.local");

    assert!(matches!(
        EngineConfig::from_file(dir.path().join("missing.json")),
        Err(ConfigError::Io(_))
    ));
}
