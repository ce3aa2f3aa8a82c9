use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{error, info, warn};
use rustc_hash::FxHashMap;

use crate::bridge::{Bridge, TransitionLog};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::gpio::GpioBackend;

type StartHook = Box<dyn Fn() -> Result<(), AppError> + Send + Sync>;
type StopHook = Box<dyn Fn() + Send + Sync>;

/// A named unit the host starts once the server is up and stops on shutdown.
pub struct ModuleRegistration {
    name: String,
    path: PathBuf,
    start: StartHook,
    stop: StopHook,
}

impl ModuleRegistration {
    pub fn new<S, T>(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        start: S,
        stop: T,
    ) -> Self
    where
        S: Fn() -> Result<(), AppError> + Send + Sync + 'static,
        T: Fn() + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            path: path.into(),
            start: Box::new(start),
            stop: Box::new(stop),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start(&self) -> Result<(), AppError> {
        (self.start)()
    }

    pub fn stop(&self) {
        (self.stop)()
    }
}

impl fmt::Debug for ModuleRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistration")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct ModuleHost {
    modules: Vec<ModuleRegistration>,
}

impl ModuleHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when a module with the same name is already registered.
    pub fn register(&mut self, module: ModuleRegistration) -> bool {
        if self.modules.iter().any(|m| m.name == module.name) {
            warn!("module {} already registered, ignoring duplicate", module.name);
            return false;
        }
        info!(
            "registered module {} at {}",
            module.name,
            module.path.display()
        );
        self.modules.push(module);
        true
    }

    /// Starts every module in registration order. On failure the modules
    /// already started are stopped again, newest first.
    pub fn start_all(&self) -> Result<(), AppError> {
        for (idx, module) in self.modules.iter().enumerate() {
            if let Err(e) = module.start() {
                error!("module {} failed to start: {e}", module.name);
                for started in self.modules[..idx].iter().rev() {
                    started.stop();
                }
                return Err(e);
            }
        }
        info!("{} module(s) started", self.modules.len());
        Ok(())
    }

    pub fn stop_all(&self) {
        for module in self.modules.iter().rev() {
            module.stop();
        }
        info!("{} module(s) stopped", self.modules.len());
    }

    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Configures one bridge per listed module and registers it with a new host.
///
/// A module whose bridge section is invalid or whose channels cannot be
/// reserved is logged and left out; the remaining modules still load.
pub fn load_modules<B: GpioBackend + 'static>(
    config: &AppConfig,
    backend: &Arc<B>,
) -> (FxHashMap<String, Arc<Bridge<B>>>, ModuleHost) {
    let mut bridges = FxHashMap::default();
    let mut host = ModuleHost::new();

    for module in &config.modules {
        if bridges.contains_key(&module.name) {
            warn!("module {} listed twice, keeping the first", module.name);
            continue;
        }
        let bridge_config = match module.bridge_config() {
            Ok(cfg) => cfg,
            Err(e) => {
                error!("skipping module {}: {e}", module.name);
                continue;
            }
        };
        let log = TransitionLog::new(config.broadcast_capacity, config.event_history_capacity);
        let bridge = match Bridge::configure_with_log(backend.clone(), bridge_config, log) {
            Ok(bridge) => Arc::new(bridge),
            Err(e) => {
                error!("skipping module {}: {e}", module.name);
                continue;
            }
        };

        host.register(bridge.registration(module.name.clone(), module.path.clone()));
        bridges.insert(module.name.clone(), bridge);
    }

    (bridges, host)
}
