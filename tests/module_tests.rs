use std::sync::{Arc, Mutex};
use std::time::Duration;

use gbridge::backend::MockGpioBackend;
use gbridge::bridge::{Bridge, BridgeConfig, BridgeState};
use gbridge::config::AppConfig;
use gbridge::error::AppError;
use gbridge::module::{ModuleHost, ModuleRegistration, load_modules};

fn recording_module(
    name: &str,
    journal: &Arc<Mutex<Vec<String>>>,
    fail_start: bool,
) -> ModuleRegistration {
    let on_start = journal.clone();
    let on_stop = journal.clone();
    let start_name = name.to_string();
    let stop_name = name.to_string();
    ModuleRegistration::new(
        name,
        format!("modules/{name}"),
        move || {
            on_start.lock().unwrap().push(format!("start {start_name}"));
            if fail_start {
                Err(AppError::ChannelUnavailable("line busy".into()))
            } else {
                Ok(())
            }
        },
        move || on_stop.lock().unwrap().push(format!("stop {stop_name}")),
    )
}

#[test]
fn duplicate_names_are_ignored() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut host = ModuleHost::new();

    assert!(host.register(recording_module("clock", &journal, false)));
    assert!(!host.register(recording_module("clock", &journal, false)));
    assert!(host.register(recording_module("motionsensor", &journal, false)));

    assert_eq!(host.len(), 2);
    assert_eq!(host.names(), vec!["clock", "motionsensor"]);
}

#[test]
fn modules_start_in_order_and_stop_in_reverse() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut host = ModuleHost::new();
    host.register(recording_module("a", &journal, false));
    host.register(recording_module("b", &journal, false));

    host.start_all().unwrap();
    host.stop_all();

    assert_eq!(
        *journal.lock().unwrap(),
        vec!["start a", "start b", "stop b", "stop a"]
    );
}

#[test]
fn failed_start_rolls_back_started_modules() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut host = ModuleHost::new();
    host.register(recording_module("a", &journal, false));
    host.register(recording_module("b", &journal, false));
    host.register(recording_module("c", &journal, true));
    host.register(recording_module("d", &journal, false));

    let err = host.start_all().unwrap_err();

    assert!(matches!(err, AppError::ChannelUnavailable(_)));
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["start a", "start b", "start c", "stop b", "stop a"]
    );
}

#[test]
fn registration_exposes_name_and_path() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let module = recording_module("motionsensor", &journal, false);

    assert_eq!(module.name(), "motionsensor");
    assert_eq!(module.path(), std::path::Path::new("modules/motionsensor"));
}

#[test]
fn bridge_registration_drives_lifecycle() {
    let backend = Arc::new(MockGpioBackend::default());
    let config = BridgeConfig::new(8, 7).with_debounce_window(Duration::from_millis(50));
    let bridge = Arc::new(Bridge::configure(backend.clone(), config).unwrap());

    let mut host = ModuleHost::new();
    host.register(bridge.registration("motionsensor", "modules/default/motionsensor"));

    host.start_all().unwrap();
    assert_eq!(bridge.state(), BridgeState::Running);

    // a repeated start is only a warning for the host
    host.start_all().unwrap();
    assert_eq!(bridge.state(), BridgeState::Running);

    host.stop_all();
    assert_eq!(bridge.state(), BridgeState::Stopped);
    assert!(!backend.is_reserved(8));
    assert!(!backend.is_reserved(7));
}

#[test]
fn stopped_bridge_fails_host_start() {
    let backend = Arc::new(MockGpioBackend::default());
    let bridge = Arc::new(Bridge::configure(backend, BridgeConfig::new(8, 7)).unwrap());
    let mut host = ModuleHost::new();
    host.register(bridge.registration("motionsensor", "modules/motionsensor"));

    bridge.stop();

    assert!(matches!(host.start_all(), Err(AppError::InvalidState(_))));
}

const MIXED_MODULES: &str = r#"
{
    "http": { "host": "localhost:8080", "path": "/api/v1" },
    "modules": [
        {
            "name": "negative-window",
            "path": "modules/negative-window",
            "bridge": { "input_channel": 1, "output_channel": 2, "debounce_ms": -5 }
        },
        {
            "name": "missing-line",
            "path": "modules/missing-line",
            "bridge": { "input_channel": 3, "output_channel": 4, "debounce_ms": 10 }
        },
        {
            "name": "motionsensor",
            "path": "modules/default/motionsensor",
            "bridge": { "input_channel": 8, "output_channel": 7, "debounce_ms": 50 }
        },
        {
            "name": "busy-led",
            "path": "modules/busy-led",
            "bridge": { "input_channel": 9, "output_channel": 7, "debounce_ms": 10 }
        },
        {
            "name": "motionsensor",
            "path": "modules/copy/motionsensor",
            "bridge": { "input_channel": 5, "output_channel": 6, "debounce_ms": 10 }
        }
    ]
}
"#;

#[test]
fn load_modules_skips_unusable_modules() {
    let config = AppConfig::from_json(MIXED_MODULES).unwrap();
    let backend = Arc::new(MockGpioBackend::default());
    backend.mark_absent(4);

    let (bridges, host) = load_modules(&config, &backend);

    assert_eq!(host.names(), vec!["motionsensor"]);
    assert_eq!(bridges.len(), 1);
    assert_eq!(
        bridges["motionsensor"].config().debounce_window,
        Duration::from_millis(50)
    );
    for id in [1, 2, 3, 4, 5, 6, 9] {
        assert!(!backend.is_reserved(id), "channel {id} leaked");
    }
    assert!(backend.is_reserved(8));
    assert!(backend.is_reserved(7));

    host.start_all().unwrap();
    assert_eq!(bridges["motionsensor"].state(), BridgeState::Running);
    host.stop_all();
    assert!(!backend.is_reserved(8));
}
