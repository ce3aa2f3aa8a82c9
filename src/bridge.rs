//! Debounced input-to-output bridge.
//!
//! A [`Bridge`] owns one input and one output channel. Once started it
//! listens for edges on the input and toggles the output for every edge
//! that is not a bounce.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::EdgeDetect;
use crate::error::AppError;
use crate::gpio::{ChannelHandle, ChannelId, Direction, EdgeEvent, GpioBackend, Subscription};
use crate::module::ModuleRegistration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub input_channel: ChannelId,
    pub output_channel: ChannelId,
    pub initial_output_state: bool,
    pub debounce_window: Duration,
    pub input_edge: EdgeDetect,
}

impl BridgeConfig {
    pub fn new(input_channel: ChannelId, output_channel: ChannelId) -> Self {
        Self {
            input_channel,
            output_channel,
            initial_output_state: false,
            debounce_window: Duration::ZERO,
            input_edge: EdgeDetect::Both,
        }
    }

    pub fn with_initial_output_state(mut self, state: bool) -> Self {
        self.initial_output_state = state;
        self
    }

    pub fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    pub fn with_input_edge(mut self, edge: EdgeDetect) -> Self {
        self.input_edge = edge;
        self
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.input_channel == self.output_channel {
            return Err(AppError::Configuration(format!(
                "input and output must be distinct channels, both are {}",
                self.input_channel
            )));
        }
        if self.input_edge == EdgeDetect::None {
            return Err(AppError::Configuration(
                "input edge mode must not be none".into(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a bridge. A `Bridge` value only exists once configured;
/// nothing leaves `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BridgeState {
    Configured,
    Running,
    Stopped,
}

/// One accepted input transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub edge: EdgeDetect,
    pub output_state: bool,
    pub timestamp_ms: u64,
    /// False when writing the output channel failed.
    pub written: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeCounters {
    pub accepted: u64,
    pub bounced: u64,
    pub write_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub state: BridgeState,
    pub input_channel: ChannelId,
    pub output_channel: ChannelId,
    pub output_state: bool,
    pub debounce_ms: u64,
    pub last_transition_ms: Option<u64>,
    pub counters: BridgeCounters,
}

/// Bounded history of transitions plus a live broadcast feed.
pub struct TransitionLog {
    event_tx: broadcast::Sender<Transition>,
    history: RwLock<VecDeque<Transition>>,
    capacity: usize,
}

impl TransitionLog {
    pub fn new(broadcast_capacity: usize, capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            event_tx,
            history: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, transition: Transition) {
        if self.capacity > 0 {
            let mut history = self.history.write();
            while history.len() >= self.capacity {
                history.pop_front();
            }
            history.push_back(transition.clone());
        }
        let _ = self.event_tx.send(transition);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.event_tx.subscribe()
    }

    /// Most recent `limit` transitions, oldest first.
    pub fn recent(&self, limit: Option<usize>) -> Vec<Transition> {
        let history = self.history.read();
        let skip = limit.map_or(0, |lim| history.len().saturating_sub(lim));
        history.iter().skip(skip).cloned().collect()
    }

    pub fn last(&self) -> Option<Transition> {
        self.history.read().back().cloned()
    }
}

struct BridgeInner {
    state: BridgeState,
    output_state: bool,
    last_transition_ms: Option<u64>,
    last_edge_ms: Option<u64>,
    input: Option<ChannelHandle>,
    output: Option<ChannelHandle>,
    counters: BridgeCounters,
}

struct Shared<B: GpioBackend> {
    backend: Arc<B>,
    debounce_window: Duration,
    inner: Mutex<BridgeInner>,
    log: TransitionLog,
}

impl<B: GpioBackend> Shared<B> {
    fn write_output(&self, inner: &BridgeInner, value: bool) -> Result<(), AppError> {
        if inner.state != BridgeState::Running {
            return Err(AppError::InvalidState(format!(
                "output can only be written while running, bridge is {:?}",
                inner.state
            )));
        }
        let handle = inner
            .output
            .as_ref()
            .ok_or_else(|| AppError::InvalidState("output channel released".into()))?;
        self.backend.write(handle, value)
    }

    fn is_bounce(&self, inner: &BridgeInner, now_ms: u64) -> bool {
        let within = |since: Option<u64>| {
            since.is_some_and(|t| Duration::from_millis(now_ms.saturating_sub(t)) < self.debounce_window)
        };
        within(inner.last_transition_ms) || within(inner.last_edge_ms)
    }

    /// Runs once per raw edge notification. Errors never leave this function.
    fn on_edge(&self, event: EdgeEvent) {
        let mut inner = self.inner.lock();
        if inner.state != BridgeState::Running {
            debug!(
                "edge on channel {} ignored, bridge is {:?}",
                event.channel_id, inner.state
            );
            return;
        }

        let bounced = self.is_bounce(&inner, event.timestamp_ms);
        inner.last_edge_ms = Some(event.timestamp_ms);
        if bounced {
            inner.counters.bounced += 1;
            debug!(
                "bounce on channel {} at {}ms discarded",
                event.channel_id, event.timestamp_ms
            );
            return;
        }

        let next = !inner.output_state;
        inner.output_state = next;
        inner.last_transition_ms = Some(event.timestamp_ms);
        inner.counters.accepted += 1;

        let written = match self.write_output(&inner, next) {
            Ok(()) => true,
            Err(e) => {
                inner.counters.write_failures += 1;
                warn!(
                    "failed to write {next} to channel {}: {e}",
                    inner.output.as_ref().map_or(0, ChannelHandle::id)
                );
                false
            }
        };
        debug!(
            "{:?} edge on channel {} at {}ms, output now {next}",
            event.edge, event.channel_id, event.timestamp_ms
        );

        // recorded under the bridge lock so history follows acceptance order
        self.log.record(Transition {
            edge: event.edge,
            output_state: next,
            timestamp_ms: event.timestamp_ms,
            written,
        });
    }
}

pub struct Bridge<B: GpioBackend + 'static> {
    config: BridgeConfig,
    shared: Arc<Shared<B>>,
    subscription: Mutex<Option<Subscription>>,
}

impl<B: GpioBackend + 'static> Bridge<B> {
    /// Validates `config` and reserves both channels.
    pub fn configure(backend: Arc<B>, config: BridgeConfig) -> Result<Self, AppError> {
        Self::configure_with_log(backend, config, TransitionLog::new(64, 32))
    }

    pub fn configure_with_log(
        backend: Arc<B>,
        config: BridgeConfig,
        log: TransitionLog,
    ) -> Result<Self, AppError> {
        config.validate()?;

        let input = backend
            .reserve(config.input_channel, Direction::Input, config.input_edge)
            .map_err(Self::unavailable)?;
        let output = match backend.reserve(config.output_channel, Direction::Output, EdgeDetect::None)
        {
            Ok(handle) => handle,
            Err(e) => {
                backend.release(input);
                return Err(Self::unavailable(e));
            }
        };

        info!(
            "bridge configured: input channel {} -> output channel {}, debounce {:?}",
            config.input_channel, config.output_channel, config.debounce_window
        );

        let shared = Arc::new(Shared {
            backend,
            debounce_window: config.debounce_window,
            inner: Mutex::new(BridgeInner {
                state: BridgeState::Configured,
                output_state: config.initial_output_state,
                last_transition_ms: None,
                last_edge_ms: None,
                input: Some(input),
                output: Some(output),
                counters: BridgeCounters::default(),
            }),
            log,
        });

        Ok(Self {
            config,
            shared,
            subscription: Mutex::new(None),
        })
    }

    fn unavailable(e: AppError) -> AppError {
        match e {
            AppError::ChannelUnavailable(_) => e,
            other => AppError::ChannelUnavailable(other.to_string()),
        }
    }

    /// Drives the output to its initial level and subscribes to the input.
    pub fn start(&self) -> Result<(), AppError> {
        let mut subscription = self.subscription.lock();
        let mut inner = self.shared.inner.lock();

        match inner.state {
            BridgeState::Running => {
                warn!(
                    "bridge on channel {} already running",
                    self.config.input_channel
                );
                return Err(AppError::AlreadyStarted(format!(
                    "bridge on channel {} is already running",
                    self.config.input_channel
                )));
            }
            BridgeState::Stopped => {
                return Err(AppError::InvalidState(
                    "a stopped bridge cannot be restarted".into(),
                ));
            }
            BridgeState::Configured => {}
        }

        inner.state = BridgeState::Running;
        let initial = self.config.initial_output_state;
        if let Err(e) = self.shared.write_output(&inner, initial) {
            inner.state = BridgeState::Configured;
            return Err(e);
        }
        inner.output_state = initial;

        let shared = Arc::clone(&self.shared);
        let subscribed = match inner.input.as_ref() {
            Some(input) => self
                .shared
                .backend
                .subscribe(input, Arc::new(move |event: EdgeEvent| shared.on_edge(event))),
            None => Err(AppError::InvalidState("input channel released".into())),
        };
        match subscribed {
            Ok(sub) => *subscription = Some(sub),
            Err(e) => {
                inner.state = BridgeState::Configured;
                return Err(e);
            }
        }

        info!(
            "bridge started: channel {} -> channel {}, output {}",
            self.config.input_channel, self.config.output_channel, initial
        );
        Ok(())
    }

    /// Stops listening and releases both channels. Safe from any state.
    pub fn stop(&self) {
        let mut subscription = self.subscription.lock();
        {
            let mut inner = self.shared.inner.lock();
            if inner.state == BridgeState::Stopped {
                return;
            }
            inner.state = BridgeState::Stopped;
        }

        // a handler blocked on the bridge lock sees Stopped and returns,
        // so cancelling here cannot wait on ourselves
        if let Some(sub) = subscription.take() {
            sub.cancel();
        }

        let (input, output) = {
            let mut inner = self.shared.inner.lock();
            (inner.input.take(), inner.output.take())
        };
        for handle in [input, output].into_iter().flatten() {
            self.shared.backend.release(handle);
        }

        info!(
            "bridge stopped: channel {} -> channel {}",
            self.config.input_channel, self.config.output_channel
        );
    }

    /// Rewrites the tracked output state to the output line, e.g. after a
    /// failed transition write.
    pub fn refresh_output(&self) -> Result<(), AppError> {
        let inner = self.shared.inner.lock();
        self.shared.write_output(&inner, inner.output_state)
    }

    pub fn read_input(&self) -> Result<bool, AppError> {
        let inner = self.shared.inner.lock();
        if inner.state != BridgeState::Running {
            return Err(AppError::InvalidState(format!(
                "input can only be read while running, bridge is {:?}",
                inner.state
            )));
        }
        let handle = inner
            .input
            .as_ref()
            .ok_or_else(|| AppError::InvalidState("input channel released".into()))?;
        self.shared.backend.read(handle)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> BridgeState {
        self.shared.inner.lock().state
    }

    pub fn output_state(&self) -> bool {
        self.shared.inner.lock().output_state
    }

    pub fn status(&self) -> BridgeStatus {
        let inner = self.shared.inner.lock();
        BridgeStatus {
            state: inner.state,
            input_channel: self.config.input_channel,
            output_channel: self.config.output_channel,
            output_state: inner.output_state,
            debounce_ms: self.config.debounce_window.as_millis() as u64,
            last_transition_ms: inner.last_transition_ms,
            counters: inner.counters,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Transition> {
        self.shared.log.subscribe()
    }

    pub fn events(&self, limit: Option<usize>) -> Vec<Transition> {
        self.shared.log.recent(limit)
    }

    pub fn last_event(&self) -> Option<Transition> {
        self.shared.log.last()
    }

    /// Lifecycle hooks for the module host, bound to this bridge.
    pub fn registration(
        self: &Arc<Self>,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> ModuleRegistration {
        let starter = Arc::clone(self);
        let stopper = Arc::clone(self);
        ModuleRegistration::new(
            name,
            path,
            move || match starter.start() {
                Err(e) if e.is_recoverable() => {
                    debug!("module start skipped: {e}");
                    Ok(())
                }
                other => other,
            },
            move || stopper.stop(),
        )
    }
}

impl<B: GpioBackend + 'static> Drop for Bridge<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
