pub mod backend;
pub mod bridge;
pub mod config;
pub mod error;
pub mod gpio;
pub mod module;
pub mod routes;

pub use bridge::{
    Bridge, BridgeConfig, BridgeCounters, BridgeState, BridgeStatus, Transition, TransitionLog,
};
pub use config::{AppConfig, BridgeSection, ChannelConfig, EdgeDetect, HttpConfig, ModuleConfig};
pub use error::AppError;
pub use gpio::{
    Channel, ChannelHandle, ChannelId, Direction, EdgeCallback, EdgeEvent, GpioBackend,
    Subscription,
};
pub use module::{ModuleHost, ModuleRegistration, load_modules};
pub use routes::AppState;

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::MockGpioBackend;
