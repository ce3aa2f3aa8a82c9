use std::time::Duration;

use gbridge::config::{AppConfig, EdgeDetect};
use gbridge::error::AppError;

const SAMPLE: &str = r#"
{
    "http": {
        "host": "localhost:8080",
        "path": "/api/v1"
    },
    "channels": {
        "7": { "name": "LED", "chip": "/dev/gpiochip0", "line": 7 },
        "8": { "name": "PIR sensor", "chip": "/dev/gpiochip0", "line": 8 }
    },
    "modules": [
        {
            "name": "motionsensor",
            "path": "modules/default/motionsensor",
            "bridge": {
                "input_channel": 8,
                "output_channel": 7,
                "debounce_ms": 50
            }
        }
    ]
}
"#;

#[test]
fn sample_config_uses_defaults() {
    let cfg = AppConfig::from_json(SAMPLE).expect("valid sample config");

    assert_eq!(cfg.http.timeout, 30);
    assert_eq!(cfg.broadcast_capacity, 64);
    assert_eq!(cfg.event_history_capacity, 32);
    assert_eq!(cfg.channels.len(), 2);
    assert_eq!(cfg.channels[&8].line, 8);

    let bridge = cfg.modules[0].bridge_config().unwrap();
    assert_eq!(bridge.input_channel, 8);
    assert_eq!(bridge.output_channel, 7);
    assert!(!bridge.initial_output_state);
    assert_eq!(bridge.debounce_window, Duration::from_millis(50));
    assert_eq!(bridge.input_edge, EdgeDetect::Both);
}

#[test]
fn negative_debounce_is_a_configuration_error() {
    let json = SAMPLE.replace("\"debounce_ms\": 50", "\"debounce_ms\": -5");
    let cfg = AppConfig::from_json(&json).unwrap();

    let err = cfg.modules[0].bridge_config().unwrap_err();
    assert!(matches!(err, AppError::Configuration(_)));
}

#[test]
fn edge_mode_is_kebab_case() {
    let json = SAMPLE.replace(
        "\"debounce_ms\": 50",
        "\"debounce_ms\": 50, \"input_edge\": \"rising\", \"initial_output_state\": true",
    );
    let cfg = AppConfig::from_json(&json).unwrap();

    let bridge = cfg.modules[0].bridge_config().unwrap();
    assert_eq!(bridge.input_edge, EdgeDetect::Rising);
    assert!(bridge.initial_output_state);
}

#[test]
fn zero_broadcast_capacity_is_rejected() {
    let json = SAMPLE.replacen('{', "{ \"broadcast_capacity\": 0,", 1);

    assert!(matches!(
        AppConfig::from_json(&json),
        Err(AppError::Configuration(_))
    ));
}

#[test]
fn malformed_json_is_rejected() {
    assert!(matches!(
        AppConfig::from_json("{ not json"),
        Err(AppError::Configuration(_))
    ));
}

#[test]
fn missing_file_is_a_configuration_error() {
    let err = AppConfig::load_from_file("/nonexistent/gbridge.json").unwrap_err();
    assert!(matches!(err, AppError::Configuration(_)));
}

#[test]
fn edge_matching() {
    assert!(EdgeDetect::Both.matches(EdgeDetect::Rising));
    assert!(EdgeDetect::Both.matches(EdgeDetect::Falling));
    assert!(EdgeDetect::Rising.matches(EdgeDetect::Rising));
    assert!(!EdgeDetect::Rising.matches(EdgeDetect::Falling));
    assert!(!EdgeDetect::Falling.matches(EdgeDetect::Rising));
    assert!(!EdgeDetect::None.matches(EdgeDetect::Rising));
}
