pub mod arbitration;
pub mod scheduler;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::Config;
use crate::optimizer::{MachineConfig, OptimizerDeps, OptimizerStatus, PeakExportOptimizer};

pub use arbitration::{ArbitrationError, ArbitrationState, ControlRegistry, Controller, Permission};
pub use scheduler::{PeriodicTaskConfig, TaskScheduler, TaskStatus};

#[derive(Clone)]
pub struct AppState {
    pub cfg: Config,
    pub tz: Tz,
    pub optimizer: Arc<Mutex<PeakExportOptimizer>>,
    pub optimizer_status: Arc<parking_lot::RwLock<OptimizerStatus>>,
    pub registry: Arc<ControlRegistry>,
    pub scheduler: Arc<TaskScheduler>,
}

impl AppState {
    /// Wire the production collaborators for this build.
    pub async fn new(cfg: Config) -> Result<Self> {
        #[cfg(feature = "sim")]
        let deps = {
            use crate::domain::SimulatedGateway;
            use crate::forecast::{
                ClearSkySolarForecaster, GridMixSource, HttpGridMixSource, StaticGridMix,
            };
            use crate::notify::LogNotifier;
            use crate::repo::JsonFileStore;

            let store = JsonFileStore::open(&cfg.store.path)
                .with_context(|| format!("failed to open state store {}", cfg.store.path))?;
            let grid_mix: Arc<dyn GridMixSource> = match &cfg.clean_grid.source_url {
                Some(url) => Arc::new(HttpGridMixSource::new(
                    url.clone(),
                    std::time::Duration::from_secs(cfg.clean_grid.cache_ttl_seconds),
                )?),
                None => Arc::new(StaticGridMix(None)),
            };
            info!("using simulated device gateway");
            OptimizerDeps {
                gateway: Arc::new(SimulatedGateway::default()),
                store: Arc::new(store),
                solar: Arc::new(ClearSkySolarForecaster::default()),
                grid_mix,
                notifier: Arc::new(LogNotifier),
            }
        };
        #[cfg(not(feature = "sim"))]
        let deps: OptimizerDeps = anyhow::bail!("no device gateway compiled in; build with the `sim` feature");

        Self::with_deps(cfg, deps).await
    }

    /// Assemble around caller-supplied collaborators and run crash recovery.
    pub async fn with_deps(cfg: Config, deps: OptimizerDeps) -> Result<Self> {
        let tz = cfg.site.tz()?;
        let optimizer = PeakExportOptimizer::new(deps.clone(), MachineConfig::from_config(&cfg), tz);
        let optimizer_status = optimizer.status_handle();
        let registry = Arc::new(ControlRegistry::load(deps.store.clone(), optimizer_status.clone()));

        let mut optimizer = optimizer.with_offgrid_flag(registry.offgrid_flag());
        optimizer.start(Utc::now().with_timezone(&tz)).await;
        let optimizer = Arc::new(Mutex::new(optimizer));

        let scheduler = Arc::new(TaskScheduler::with_config(
            optimizer.clone(),
            tz,
            PeriodicTaskConfig {
                optimizer_tick_secs: cfg.controller.optimizer_tick_seconds,
            },
        ));

        Ok(Self {
            cfg,
            tz,
            optimizer,
            optimizer_status,
            registry,
            scheduler,
        })
    }

    /// Current wall-clock time in the site timezone.
    pub fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }
}

pub fn spawn_controller_tasks(state: &AppState) {
    state.scheduler.clone().start();
}
