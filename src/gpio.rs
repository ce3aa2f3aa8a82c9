use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::EdgeDetect;
use crate::error::AppError;

pub type ChannelId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Input,
    Output,
}

/// Snapshot of one reserved digital line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub id: ChannelId,
    pub direction: Direction,
    pub edge: EdgeDetect,
    pub state: bool,
}

/// Exclusive claim on a reserved channel, handed back through `release`.
#[derive(Debug, PartialEq, Eq)]
pub struct ChannelHandle {
    id: ChannelId,
    direction: Direction,
}

impl ChannelHandle {
    pub fn new(id: ChannelId, direction: Direction) -> Self {
        Self { id, direction }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeEvent {
    pub channel_id: ChannelId,
    pub edge: EdgeDetect,
    /// Line level after the edge.
    pub value: bool,
    pub timestamp_ms: u64,
}

pub type EdgeCallback = Arc<dyn Fn(EdgeEvent) + Send + Sync>;

/// Unsubscribe handle returned by `GpioBackend::subscribe`.
///
/// Cancelling (explicitly or by dropping) guarantees the callback is not
/// invoked once `cancel` returns.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Pin-level primitives the bridge consumes.
pub trait GpioBackend: Send + Sync {
    fn reserve(
        &self,
        channel_id: ChannelId,
        direction: Direction,
        edge: EdgeDetect,
    ) -> Result<ChannelHandle, AppError>;
    fn write(&self, handle: &ChannelHandle, value: bool) -> Result<(), AppError>;
    fn read(&self, handle: &ChannelHandle) -> Result<bool, AppError>;
    fn subscribe(
        &self,
        handle: &ChannelHandle,
        callback: EdgeCallback,
    ) -> Result<Subscription, AppError>;
    fn release(&self, handle: ChannelHandle);
    /// Current snapshot of a reserved channel, `None` when not reserved.
    fn channel(&self, channel_id: ChannelId) -> Option<Channel>;
}
