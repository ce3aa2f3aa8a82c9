use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, test, web};
use gbridge::backend::MockGpioBackend;
use gbridge::bridge::{Bridge, BridgeConfig};
use gbridge::config::EdgeDetect;
use gbridge::routes::AppState;
use rustc_hash::FxHashMap;
use serde_json::Value;

const SCOPE: &str = "/api/v1";

fn sample_state() -> (Arc<MockGpioBackend>, AppState<MockGpioBackend>) {
    let backend = Arc::new(MockGpioBackend::default());
    let config = BridgeConfig::new(8, 7).with_debounce_window(Duration::from_millis(50));
    let bridge = Arc::new(Bridge::configure(backend.clone(), config).expect("bridge configures"));

    let mut bridges = FxHashMap::default();
    bridges.insert("motionsensor".to_string(), bridge);

    let state = AppState {
        backend: backend.clone(),
        bridges: Arc::new(bridges),
    };
    (backend, state)
}

macro_rules! init_app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state.clone()))
                .service($state.api_scope(SCOPE)),
        )
        .await
    };
}

#[actix_rt::test]
async fn list_modules_returns_all() {
    let (_backend, state) = sample_state();
    let app = init_app!(state);

    let req = test::TestRequest::get().uri("/api/v1/modules").to_request();
    let response: FxHashMap<String, Value> = test::call_and_read_body_json(&app, req).await;

    assert_eq!(response.len(), 1);
    let status = &response["motionsensor"];
    assert_eq!(status["state"], "configured");
    assert_eq!(status["input_channel"], 8);
    assert_eq!(status["output_channel"], 7);
    assert_eq!(status["debounce_ms"], 50);
}

#[actix_rt::test]
async fn unknown_module_returns_404() {
    let (_backend, state) = sample_state();
    let app = init_app!(state);

    let req = test::TestRequest::get()
        .uri("/api/v1/modules/clock")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_rt::test]
async fn wrong_method_returns_405() {
    let (_backend, state) = sample_state();
    let app = init_app!(state);

    let req = test::TestRequest::get()
        .uri("/api/v1/modules/motionsensor/start")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);

    let req = test::TestRequest::post()
        .uri("/api/v1/modules/motionsensor/output")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}

#[actix_rt::test]
async fn start_then_start_again_conflicts() {
    let (_backend, state) = sample_state();
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/modules/motionsensor/start")
        .to_request();
    let status: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(status["state"], "running");

    let req = test::TestRequest::post()
        .uri("/api/v1/modules/motionsensor/start")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
}

#[actix_rt::test]
async fn transitions_show_up_in_output_and_events() {
    let (backend, state) = sample_state();
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/modules/motionsensor/start")
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    for t in [0, 10, 40, 120, 300] {
        backend.inject_edge(8, EdgeDetect::Rising, t).unwrap();
    }

    let req = test::TestRequest::get()
        .uri("/api/v1/modules/motionsensor/output")
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "true");

    let req = test::TestRequest::get()
        .uri("/api/v1/modules/motionsensor/events?limit=2")
        .to_request();
    let events: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["timestamp_ms"], 120);
    assert_eq!(events[1]["timestamp_ms"], 300);
    assert_eq!(events[1]["output_state"], true);

    let req = test::TestRequest::get()
        .uri("/api/v1/modules/motionsensor/event")
        .to_request();
    let last: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(last["edge"], "rising");
    assert_eq!(last["written"], true);

    let req = test::TestRequest::get()
        .uri("/api/v1/modules/motionsensor")
        .to_request();
    let status: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(status["counters"]["accepted"], 3);
    assert_eq!(status["counters"]["bounced"], 2);
}

#[actix_rt::test]
async fn last_event_is_empty_before_any_transition() {
    let (_backend, state) = sample_state();
    let app = init_app!(state);

    let req = test::TestRequest::get()
        .uri("/api/v1/modules/motionsensor/event")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let body = test::read_body(resp).await;
    assert!(body.is_empty());
}

#[actix_rt::test]
async fn input_read_requires_running_bridge() {
    let (backend, state) = sample_state();
    let app = init_app!(state);

    let req = test::TestRequest::get()
        .uri("/api/v1/modules/motionsensor/input")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    let req = test::TestRequest::post()
        .uri("/api/v1/modules/motionsensor/start")
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());
    backend.set_input(8, true, 0).unwrap();

    let req = test::TestRequest::get()
        .uri("/api/v1/modules/motionsensor/input")
        .to_request();
    let body = test::call_and_read_body(&app, req).await;
    assert_eq!(body, "true");
}

#[actix_rt::test]
async fn stop_releases_channels() {
    let (_backend, state) = sample_state();
    let app = init_app!(state);

    let req = test::TestRequest::get().uri("/api/v1/channels/7").to_request();
    let channel: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(channel["direction"], "output");
    assert_eq!(channel["edge"], "none");

    let req = test::TestRequest::post()
        .uri("/api/v1/modules/motionsensor/stop")
        .to_request();
    let status: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(status["state"], "stopped");

    let req = test::TestRequest::get().uri("/api/v1/channels/7").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::post()
        .uri("/api/v1/modules/motionsensor/start")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);
}

#[actix_rt::test]
async fn invalid_channel_id_returns_400() {
    let (_backend, state) = sample_state();
    let app = init_app!(state);

    let req = test::TestRequest::get()
        .uri("/api/v1/channels/led")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}
