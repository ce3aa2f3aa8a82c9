use log::warn;
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::bridge::{Bridge, BridgeStatus, Transition};
use crate::error::AppError;
use crate::gpio::{ChannelId, GpioBackend};

pub struct AppState<B: GpioBackend + 'static> {
    pub backend: Arc<B>,
    pub bridges: Arc<FxHashMap<String, Arc<Bridge<B>>>>,
}

impl<B: GpioBackend + 'static> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            bridges: Arc::clone(&self.bridges),
        }
    }
}

impl<B: GpioBackend + 'static> AppState<B> {
    fn bridge(&self, name: &str) -> Result<&Arc<Bridge<B>>, AppError> {
        self.bridges
            .get(name)
            .ok_or_else(|| AppError::NotFound(format!("module {name}")))
    }
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    limit: Option<usize>,
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<Transition>,
) {
    let mut events = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            event = events.next() => {
                let Some(event) = event else { break; };

                match event {
                    Ok(transition) => {
                        if let Ok(text) = serde_json::to_string(&transition)
                            && session.text(text).await.is_err()
                        {
                            warn!("WebSocket client disconnected");
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        let notice = AppError::Gpio(format!("Event stream lagged by {n} messages"));
                        if session.text(notice.to_string()).await.is_err() {
                            warn!("WebSocket client lagged and disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl<B: GpioBackend + 'static> AppState<B> {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                web::resource("/modules")
                    .route(web::get().to(list_modules::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/modules/{name}")
                    .route(web::get().to(module_status::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/modules/{name}/start")
                    .route(web::post().to(start_module::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/modules/{name}/stop")
                    .route(web::post().to(stop_module::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/modules/{name}/output")
                    .route(web::get().to(get_output::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/modules/{name}/input")
                    .route(web::get().to(get_input::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/modules/{name}/event")
                    .route(web::get().to(get_last_event::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/modules/{name}/events")
                    .route(web::get().to(get_events::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/modules/{name}/events/ws")
                    .route(web::get().to(events_ws::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/channels/{channel_id}")
                    .route(web::get().to(get_channel::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
    }
}

async fn list_modules<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let statuses: FxHashMap<String, BridgeStatus> = state
        .bridges
        .iter()
        .map(|(name, bridge)| (name.clone(), bridge.status()))
        .collect();

    Ok(web::Json(statuses))
}

async fn module_status<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let name = parse_module_name(&req)?;
    let bridge = state.bridge(name)?;

    Ok(web::Json(bridge.status()))
}

async fn start_module<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let name = parse_module_name(&req)?;
    let bridge = state.bridge(name)?;
    bridge.start()?;

    Ok(web::Json(bridge.status()))
}

async fn stop_module<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let name = parse_module_name(&req)?;
    let bridge = state.bridge(name)?;
    bridge.stop();

    Ok(web::Json(bridge.status()))
}

async fn get_output<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let name = parse_module_name(&req)?;
    let bridge = state.bridge(name)?;

    Ok(web::Json(bridge.output_state()))
}

async fn get_input<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let name = parse_module_name(&req)?;
    let value = state.bridge(name)?.read_input()?;

    Ok(web::Json(value))
}

async fn get_last_event<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let name = parse_module_name(&req)?;
    let last = state.bridge(name)?.last_event();

    match last {
        Some(event) => Ok(HttpResponse::Ok().json(event)),
        None => Ok(HttpResponse::Ok().finish()),
    }
}

async fn get_events<B: GpioBackend + 'static>(
    req: HttpRequest,
    query: web::Query<EventsQuery>,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let name = parse_module_name(&req)?;
    let events = state.bridge(name)?.events(query.limit);

    Ok(web::Json(events))
}

async fn events_ws<B: GpioBackend + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    let name = parse_module_name(&req)?;
    let rx = state.bridge(name)?.subscribe_events();
    let (response, session, client_stream) = actix_ws::handle(&req, stream)
        .map_err(|e| AppError::InvalidValue(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx).await;
    });

    Ok(response)
}

async fn get_channel<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let channel_id = parse_channel_id(&req)?;
    let channel = state
        .backend
        .channel(channel_id)
        .ok_or_else(|| AppError::NotFound(format!("channel {channel_id}")))?;

    Ok(web::Json(channel))
}

fn parse_module_name(req: &HttpRequest) -> Result<&str, AppError> {
    req.match_info()
        .get("name")
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::InvalidValue("Missing module name".into()))
}

fn parse_channel_id(req: &HttpRequest) -> Result<ChannelId, AppError> {
    let channel_id = req
        .match_info()
        .get("channel_id")
        .ok_or_else(|| AppError::InvalidValue("Missing channel id".into()))?;
    let channel_id = channel_id
        .parse::<ChannelId>()
        .map_err(|_| AppError::InvalidValue("Invalid channel id".into()))?;

    Ok(channel_id)
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
