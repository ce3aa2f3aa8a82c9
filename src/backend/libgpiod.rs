use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, yield_now};
use std::time::Duration;

use libgpiod::{chip::Chip, line, line::EventClock, request};
use parking_lot::{FairMutex, Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::config::{ChannelConfig, EdgeDetect};
use crate::error::AppError;
use crate::gpio::{
    Channel, ChannelHandle, ChannelId, Direction, EdgeCallback, EdgeEvent, GpioBackend,
    Subscription,
};

const LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY: usize = 64;
const LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS: Duration = Duration::from_millis(10);

pub struct LibgpiodBackend {
    channels: FxHashMap<ChannelId, ChannelConfig>,
    pins: RwLock<FxHashMap<ChannelId, Mutex<PinHandle>>>, // reserved channels only
}

struct PinHandle {
    line: u32,
    channel: Channel,
    gpiod_handle: Arc<FairMutex<GpiodHandle>>,
}

struct GpiodHandle {
    request: request::Request,
}

impl GpiodHandle {
    fn new(chip: &str, line_cfg: &line::Config) -> Result<Self, AppError> {
        let chip = Self::open_chip(chip)?;
        let request = Self::request_lines(&chip, line_cfg)?;
        Ok(Self { request })
    }

    fn open_chip(path: &str) -> Result<Chip, AppError> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| AppError::ChannelUnavailable(format!("open chip {path}: {e}")))
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, AppError> {
        let mut req_cfg =
            request::Config::new().map_err(|e| AppError::Gpio(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| AppError::Gpio(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| AppError::ChannelUnavailable(format!("request lines: {e}")))
    }
}

struct EdgeListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EdgeListener {
    fn new(
        channel_id: ChannelId,
        gpiod_handle: Arc<FairMutex<GpiodHandle>>,
        callback: EdgeCallback,
    ) -> Result<Self, AppError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let mut buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| AppError::Gpio(format!("event buffer: {e}")))?;

        let handle = thread::spawn(move || {
            while !cancel_flag.load(Ordering::Acquire) {
                let mut pending = Vec::new();
                {
                    let hdl = gpiod_handle.lock();
                    let req = &hdl.request;

                    let has_event =
                        match req.wait_edge_events(Some(LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS)) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!("wait edge events error for channel {channel_id}: {e}");
                                yield_now();
                                continue;
                            }
                        };
                    if !has_event {
                        continue;
                    }

                    let events = match req.read_edge_events(&mut buffer) {
                        Ok(evts) => evts,
                        Err(e) => {
                            warn!("read edge events error for channel {channel_id}: {e}");
                            yield_now();
                            continue;
                        }
                    };
                    for evt in events {
                        let evt = match evt {
                            Ok(e) => e,
                            Err(_) => continue,
                        };
                        let (edge, value) = match evt.event_type() {
                            Ok(line::EdgeKind::Rising) => (EdgeDetect::Rising, true),
                            Ok(line::EdgeKind::Falling) => (EdgeDetect::Falling, false),
                            Err(_) => continue,
                        };
                        pending.push(EdgeEvent {
                            channel_id,
                            edge,
                            value,
                            timestamp_ms: evt.timestamp().as_millis() as u64,
                        });
                    }
                }

                // the request lock is released before handing events out
                for event in pending {
                    if cancel_flag.load(Ordering::Acquire) {
                        break;
                    }
                    callback(event);
                }
            }
            debug!("edge listener for channel {channel_id} exited");
        });

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            // cancelled from inside a callback, the loop exits on its own
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }
}

impl LibgpiodBackend {
    pub fn new(channels: FxHashMap<ChannelId, ChannelConfig>) -> Result<Self, AppError> {
        Ok(Self {
            channels,
            pins: RwLock::new(FxHashMap::default()),
        })
    }

    fn make_line_settings(
        direction: Direction,
        edge: EdgeDetect,
    ) -> Result<line::Settings, AppError> {
        let mut ls =
            line::Settings::new().map_err(|e| AppError::Gpio(format!("libgpiod settings: {e}")))?;

        match direction {
            Direction::Output => {
                ls.set_direction(line::Direction::Output)
                    .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
                ls.set_drive(line::Drive::PushPull)
                    .map_err(|e| AppError::Gpio(format!("set drive: {e}")))?;
            }
            Direction::Input => {
                ls.set_direction(line::Direction::Input)
                    .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
            }
        }

        let edge = match edge {
            EdgeDetect::None => None,
            EdgeDetect::Rising => Some(line::Edge::Rising),
            EdgeDetect::Falling => Some(line::Edge::Falling),
            EdgeDetect::Both => Some(line::Edge::Both),
        };
        if edge.is_some() {
            ls.set_edge_detection(edge)
                .map_err(|e| AppError::Gpio(format!("set edge detection: {e}")))?;
            // debounce compares timestamps, so they must not jump with wall-clock changes
            ls.set_event_clock(EventClock::Monotonic)
                .map_err(|e| AppError::Gpio(format!("set event clock: {e}")))?;
        }

        Ok(ls)
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, AppError> {
        let mut cfg =
            line::Config::new().map_err(|e| AppError::Gpio(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| AppError::Gpio(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }

    fn to_value(value: bool) -> line::Value {
        if value {
            line::Value::Active
        } else {
            line::Value::InActive
        }
    }

    fn from_value(value: line::Value) -> bool {
        match value {
            line::Value::InActive => false,
            line::Value::Active => true,
        }
    }
}

impl GpioBackend for LibgpiodBackend {
    fn reserve(
        &self,
        channel_id: ChannelId,
        direction: Direction,
        edge: EdgeDetect,
    ) -> Result<ChannelHandle, AppError> {
        if direction == Direction::Output && edge != EdgeDetect::None {
            return Err(AppError::InvalidState(
                "edge detection requires an input channel".into(),
            ));
        }

        let cfg = self.channels.get(&channel_id).ok_or_else(|| {
            AppError::ChannelUnavailable(format!("channel {channel_id} not configured"))
        })?;

        let pins = self.pins.upgradable_read();
        if pins.contains_key(&channel_id) {
            return Err(AppError::ChannelUnavailable(format!(
                "channel {channel_id} already in use"
            )));
        }

        let line_settings = Self::make_line_settings(direction, edge)?;
        let line_cfg = Self::make_line_config(cfg.line, line_settings)?;
        let gpiod_handle = Arc::new(FairMutex::new(GpiodHandle::new(&cfg.chip, &line_cfg)?));

        let handle = PinHandle {
            line: cfg.line,
            channel: Channel {
                id: channel_id,
                direction,
                edge,
                state: false,
            },
            gpiod_handle,
        };

        let mut pins = parking_lot::RwLockUpgradableReadGuard::upgrade(pins);
        pins.insert(channel_id, Mutex::new(handle));
        debug!(
            "reserved channel {channel_id} ({} line {}) as {direction:?}",
            cfg.chip, cfg.line
        );

        Ok(ChannelHandle::new(channel_id, direction))
    }

    fn write(&self, handle: &ChannelHandle, value: bool) -> Result<(), AppError> {
        let pins = self.pins.read();
        let pin_lock = pins
            .get(&handle.id())
            .ok_or_else(|| AppError::InvalidState("channel not reserved".into()))?;
        let mut pin = pin_lock.lock();

        if pin.channel.direction != Direction::Output {
            return Err(AppError::InvalidState(
                "channel must be an output to set value".into(),
            ));
        }

        let offset = pin.line;
        pin.gpiod_handle
            .lock()
            .request
            .set_value(offset, Self::to_value(value))
            .map_err(|e| AppError::Gpio(format!("set value: {e}")))?;
        pin.channel.state = value;
        Ok(())
    }

    fn read(&self, handle: &ChannelHandle) -> Result<bool, AppError> {
        let pins = self.pins.read();
        let pin_lock = pins
            .get(&handle.id())
            .ok_or_else(|| AppError::InvalidState("channel not reserved".into()))?;
        let mut pin = pin_lock.lock();

        let offset = pin.line;
        let value = pin
            .gpiod_handle
            .lock()
            .request
            .value(offset)
            .map_err(|e| AppError::Gpio(format!("get value: {e}")))?;
        let value = Self::from_value(value);
        pin.channel.state = value;
        Ok(value)
    }

    fn subscribe(
        &self,
        handle: &ChannelHandle,
        callback: EdgeCallback,
    ) -> Result<Subscription, AppError> {
        let pins = self.pins.read();
        let pin_lock = pins
            .get(&handle.id())
            .ok_or_else(|| AppError::InvalidState("channel not reserved".into()))?;
        let pin = pin_lock.lock();

        if pin.channel.edge == EdgeDetect::None {
            return Err(AppError::InvalidState(
                "subscribing requires edge detection to be enabled".into(),
            ));
        }

        let listener = EdgeListener::new(handle.id(), pin.gpiod_handle.clone(), callback)?;
        Ok(Subscription::new(move || drop(listener)))
    }

    fn release(&self, handle: ChannelHandle) {
        if self.pins.write().remove(&handle.id()).is_some() {
            debug!("released channel {}", handle.id());
        }
    }

    fn channel(&self, channel_id: ChannelId) -> Option<Channel> {
        let pins = self.pins.read();
        let pin = pins.get(&channel_id)?.lock();
        Some(pin.channel.clone())
    }
}
