use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::debug;
use parking_lot::RwLock as PLRwLock;

use crate::config::EdgeDetect;
use crate::error::AppError;
use crate::gpio::{
    Channel, ChannelHandle, ChannelId, Direction, EdgeCallback, EdgeEvent, GpioBackend,
    Subscription,
};

/// In-process GPIO layer. Edges are injected by the caller and delivered
/// synchronously on the injecting thread.
#[derive(Default)]
pub struct MockGpioBackend {
    shared: Arc<MockShared>,
}

#[derive(Default)]
struct MockShared {
    pins: RwLock<HashMap<ChannelId, Mutex<MockPinState>>>, // keyed by channel id
    absent: RwLock<HashSet<ChannelId>>,
    failing_writes: RwLock<HashSet<ChannelId>>,
    writes: Mutex<Vec<(ChannelId, bool)>>,
    next_token: AtomicU64,
}

struct MockPinState {
    channel: Channel,
    subscribers: Vec<MockSubscriber>,
}

#[derive(Clone)]
struct MockSubscriber {
    token: u64,
    callback: EdgeCallback,
    // held for reading while a callback runs, taken for writing on cancel
    active: Arc<PLRwLock<bool>>,
}

impl MockGpioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes later reservations of `channel_id` fail as if the line did not exist.
    pub fn mark_absent(&self, channel_id: ChannelId) {
        if let Ok(mut absent) = self.shared.absent.write() {
            absent.insert(channel_id);
        }
    }

    pub fn fail_writes(&self, channel_id: ChannelId, fail: bool) {
        if let Ok(mut failing) = self.shared.failing_writes.write() {
            if fail {
                failing.insert(channel_id);
            } else {
                failing.remove(&channel_id);
            }
        }
    }

    pub fn is_reserved(&self, channel_id: ChannelId) -> bool {
        self.shared
            .pins
            .read()
            .map(|pins| pins.contains_key(&channel_id))
            .unwrap_or(false)
    }

    /// Successful writes to `channel_id`, oldest first.
    pub fn writes(&self, channel_id: ChannelId) -> Vec<bool> {
        self.shared
            .writes
            .lock()
            .map(|w| {
                w.iter()
                    .filter(|(id, _)| *id == channel_id)
                    .map(|(_, v)| *v)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, channel_id: ChannelId) -> usize {
        self.shared
            .pins
            .read()
            .ok()
            .and_then(|pins| {
                pins.get(&channel_id)
                    .and_then(|p| p.lock().ok().map(|p| p.subscribers.len()))
            })
            .unwrap_or(0)
    }

    /// Drives an input line to `value`; an edge is delivered only when the
    /// level changes and the edge matches the channel's edge mode.
    pub fn set_input(
        &self,
        channel_id: ChannelId,
        value: bool,
        timestamp_ms: u64,
    ) -> Result<(), AppError> {
        let previous = self.update_input(channel_id, value)?;
        if previous == value {
            return Ok(());
        }
        let edge = if value {
            EdgeDetect::Rising
        } else {
            EdgeDetect::Falling
        };
        self.dispatch(channel_id, edge, value, timestamp_ms)
    }

    /// Delivers a raw edge notification regardless of the previous level,
    /// the way a bouncing contact does.
    pub fn inject_edge(
        &self,
        channel_id: ChannelId,
        edge: EdgeDetect,
        timestamp_ms: u64,
    ) -> Result<(), AppError> {
        let value = match edge {
            EdgeDetect::Rising => true,
            EdgeDetect::Falling => false,
            EdgeDetect::None | EdgeDetect::Both => {
                return Err(AppError::InvalidValue(
                    "injected edge must be rising or falling".into(),
                ));
            }
        };
        self.update_input(channel_id, value)?;
        self.dispatch(channel_id, edge, value, timestamp_ms)
    }

    fn update_input(&self, channel_id: ChannelId, value: bool) -> Result<bool, AppError> {
        let pins = self
            .shared
            .pins
            .read()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;
        let entry = pins
            .get(&channel_id)
            .ok_or_else(|| AppError::InvalidState("channel not reserved".into()))?;
        let mut pin = entry
            .lock()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;

        if pin.channel.direction != Direction::Input {
            return Err(AppError::InvalidState(
                "only input channels can be driven externally".into(),
            ));
        }
        let previous = pin.channel.state;
        pin.channel.state = value;
        Ok(previous)
    }

    fn dispatch(
        &self,
        channel_id: ChannelId,
        edge: EdgeDetect,
        value: bool,
        timestamp_ms: u64,
    ) -> Result<(), AppError> {
        // callbacks run without the pin table locked, they may call back into the backend
        let subscribers = {
            let pins = self
                .shared
                .pins
                .read()
                .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;
            let Some(entry) = pins.get(&channel_id) else {
                return Ok(());
            };
            let pin = entry
                .lock()
                .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;
            if !pin.channel.edge.matches(edge) {
                debug!("mock channel {channel_id}: {edge:?} edge filtered");
                return Ok(());
            }
            pin.subscribers.clone()
        };

        for subscriber in subscribers {
            let active = subscriber.active.read();
            if *active {
                (subscriber.callback)(EdgeEvent {
                    channel_id,
                    edge,
                    value,
                    timestamp_ms,
                });
            }
        }
        Ok(())
    }
}

impl MockShared {
    fn unsubscribe(&self, channel_id: ChannelId, token: u64) {
        let Ok(pins) = self.pins.read() else {
            return;
        };
        if let Some(entry) = pins.get(&channel_id)
            && let Ok(mut pin) = entry.lock()
        {
            pin.subscribers.retain(|s| s.token != token);
        }
    }
}

impl GpioBackend for MockGpioBackend {
    fn reserve(
        &self,
        channel_id: ChannelId,
        direction: Direction,
        edge: EdgeDetect,
    ) -> Result<ChannelHandle, AppError> {
        let absent = self
            .shared
            .absent
            .read()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;
        if absent.contains(&channel_id) {
            return Err(AppError::ChannelUnavailable(format!(
                "channel {channel_id} not present"
            )));
        }

        if direction == Direction::Output && edge != EdgeDetect::None {
            return Err(AppError::InvalidState(
                "edge detection requires an input channel".into(),
            ));
        }

        let mut pins = self
            .shared
            .pins
            .write()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;
        if pins.contains_key(&channel_id) {
            return Err(AppError::ChannelUnavailable(format!(
                "channel {channel_id} already in use"
            )));
        }

        pins.insert(
            channel_id,
            Mutex::new(MockPinState {
                channel: Channel {
                    id: channel_id,
                    direction,
                    edge,
                    state: false,
                },
                subscribers: Vec::new(),
            }),
        );

        Ok(ChannelHandle::new(channel_id, direction))
    }

    fn write(&self, handle: &ChannelHandle, value: bool) -> Result<(), AppError> {
        let pins = self
            .shared
            .pins
            .read()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;
        let entry = pins
            .get(&handle.id())
            .ok_or_else(|| AppError::InvalidState("channel not reserved".into()))?;
        let mut pin = entry
            .lock()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;

        if pin.channel.direction != Direction::Output {
            return Err(AppError::InvalidState(
                "channel must be an output to set value".into(),
            ));
        }

        let failing = self
            .shared
            .failing_writes
            .read()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;
        if failing.contains(&handle.id()) {
            return Err(AppError::Gpio(format!(
                "simulated write failure on channel {}",
                handle.id()
            )));
        }

        pin.channel.state = value;
        self.shared
            .writes
            .lock()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?
            .push((handle.id(), value));
        Ok(())
    }

    fn read(&self, handle: &ChannelHandle) -> Result<bool, AppError> {
        let pins = self
            .shared
            .pins
            .read()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;
        let entry = pins
            .get(&handle.id())
            .ok_or_else(|| AppError::InvalidState("channel not reserved".into()))?;
        let pin = entry
            .lock()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;

        Ok(pin.channel.state)
    }

    fn subscribe(
        &self,
        handle: &ChannelHandle,
        callback: EdgeCallback,
    ) -> Result<Subscription, AppError> {
        let channel_id = handle.id();
        let pins = self
            .shared
            .pins
            .read()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;
        let entry = pins
            .get(&channel_id)
            .ok_or_else(|| AppError::InvalidState("channel not reserved".into()))?;
        let mut pin = entry
            .lock()
            .map_err(|e| AppError::Gpio(format!("lock poisoned: {e}")))?;

        if pin.channel.edge == EdgeDetect::None {
            return Err(AppError::InvalidState(
                "subscribing requires edge detection to be enabled".into(),
            ));
        }

        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(PLRwLock::new(true));
        pin.subscribers.push(MockSubscriber {
            token,
            callback,
            active: active.clone(),
        });

        let shared = Arc::clone(&self.shared);
        Ok(Subscription::new(move || {
            // waits for an in-flight callback to return
            *active.write() = false;
            shared.unsubscribe(channel_id, token);
        }))
    }

    fn release(&self, handle: ChannelHandle) {
        if let Ok(mut pins) = self.shared.pins.write() {
            pins.remove(&handle.id());
        }
    }

    fn channel(&self, channel_id: ChannelId) -> Option<Channel> {
        let pins = self.shared.pins.read().ok()?;
        let pin = pins.get(&channel_id)?.lock().ok()?;
        Some(pin.channel.clone())
    }
}
