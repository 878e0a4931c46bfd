use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::optimizer::PeakExportOptimizer;

/// Periodic task configuration
#[derive(Debug, Clone)]
pub struct PeriodicTaskConfig {
    /// Optimizer evaluation interval (seconds)
    pub optimizer_tick_secs: u64,
}

impl Default for PeriodicTaskConfig {
    fn default() -> Self {
        Self {
            optimizer_tick_secs: 120,
        }
    }
}

/// Task status tracking
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
}

impl TaskStatus {
    fn started(&mut self, now: DateTime<Utc>) {
        self.last_run = Some(now);
        self.run_count += 1;
    }

    fn succeeded(&mut self, now: DateTime<Utc>) {
        self.last_success = Some(now);
        self.success_count += 1;
        self.last_error = None;
    }

    fn failed(&mut self, message: String) {
        self.error_count += 1;
        self.last_error = Some(message);
    }
}

/// Periodic task scheduler
///
/// Each subsystem gets its own loop, so one slow evaluation never delays
/// another subsystem, and a subsystem's own ticks never overlap.
pub struct TaskScheduler {
    config: PeriodicTaskConfig,
    optimizer: Arc<Mutex<PeakExportOptimizer>>,
    tz: Tz,
    optimizer_status: Arc<RwLock<TaskStatus>>,
}

impl TaskScheduler {
    pub fn new(optimizer: Arc<Mutex<PeakExportOptimizer>>, tz: Tz) -> Self {
        Self::with_config(optimizer, tz, PeriodicTaskConfig::default())
    }

    pub fn with_config(
        optimizer: Arc<Mutex<PeakExportOptimizer>>,
        tz: Tz,
        config: PeriodicTaskConfig,
    ) -> Self {
        Self {
            config,
            optimizer,
            tz,
            optimizer_status: Arc::new(RwLock::new(TaskStatus::default())),
        }
    }

    /// Start all periodic tasks
    pub fn start(self: Arc<Self>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_optimizer_task().await;
        });
        info!(
            optimizer_tick_secs = self.config.optimizer_tick_secs,
            "periodic tasks started"
        );
    }

    async fn run_optimizer_task(&self) {
        let mut interval = interval(Duration::from_secs(self.config.optimizer_tick_secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.run_optimizer_once().await;
        }
    }

    /// One optimizer evaluation. The tick runs on its own task so a panic is
    /// recorded as a failed run instead of ending the loop.
    pub async fn run_optimizer_once(&self) {
        let now = Utc::now();
        self.optimizer_status.write().await.started(now);

        let optimizer = self.optimizer.clone();
        let local = now.with_timezone(&self.tz);
        let outcome = tokio::spawn(async move {
            optimizer.lock().await.tick(local).await;
        })
        .await;

        let mut status = self.optimizer_status.write().await;
        match outcome {
            Ok(()) => {
                status.succeeded(now);
                debug!("optimizer tick completed");
            }
            Err(e) => {
                status.failed(e.to_string());
                error!(error = %e, "optimizer tick aborted");
            }
        }
    }

    pub async fn get_optimizer_status(&self) -> TaskStatus {
        self.optimizer_status.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CleanGridConfig, OptimizerConfig};
    use crate::domain::SimulatedGateway;
    use crate::forecast::{GridMixSource, NoSolarForecast, StaticGridMix};
    use crate::notify::RecordingNotifier;
    use crate::optimizer::{MachineConfig, OptimizerDeps, OptimizerParams};
    use crate::repo::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn optimizer() -> Arc<Mutex<PeakExportOptimizer>> {
        let deps = OptimizerDeps {
            gateway: Arc::new(SimulatedGateway::default()),
            store: Arc::new(MemoryStore::new()),
            solar: Arc::new(NoSolarForecast),
            grid_mix: Arc::new(StaticGridMix(None)),
            notifier: Arc::new(RecordingNotifier::default()),
        };
        Arc::new(Mutex::new(PeakExportOptimizer::new(
            deps,
            MachineConfig::default(),
            chrono_tz::UTC,
        )))
    }

    #[tokio::test]
    async fn test_task_scheduler_creation() {
        let scheduler = TaskScheduler::new(optimizer(), chrono_tz::UTC);
        let status = scheduler.get_optimizer_status().await;
        assert_eq!(status.run_count, 0);
        assert_eq!(status.success_count, 0);
    }

    #[tokio::test]
    async fn test_run_once_records_success() {
        let scheduler = TaskScheduler::new(optimizer(), chrono_tz::UTC);
        scheduler.run_optimizer_once().await;
        scheduler.run_optimizer_once().await;

        let status = scheduler.get_optimizer_status().await;
        assert_eq!(status.run_count, 2);
        assert_eq!(status.success_count, 2);
        assert!(status.last_error.is_none());
        assert!(status.last_success.is_some());
    }

    /// Grid-mix feed whose first read panics.
    #[derive(Default)]
    struct PanicsOnce {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl GridMixSource for PanicsOnce {
        async fn fossil_pct(&self) -> anyhow::Result<Option<f64>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("grid mix feed exploded");
            }
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_panicking_tick_is_recorded_and_loop_continues() {
        let gateway = Arc::new(SimulatedGateway::default());
        // Off-peak around the clock, so every tick reaches the grid-mix check.
        gateway.set_tariff(Some(serde_json::json!({
            "seasons": {"All": {"tou_periods": {"OFF_PEAK": [{"fromDayOfWeek": 0, "toDayOfWeek": 6}]}}}
        })));

        let deps = OptimizerDeps {
            gateway,
            store: Arc::new(MemoryStore::new()),
            solar: Arc::new(NoSolarForecast),
            grid_mix: Arc::new(PanicsOnce::default()),
            notifier: Arc::new(RecordingNotifier::default()),
        };
        let cfg = MachineConfig {
            clean_grid: CleanGridConfig {
                enabled: true,
                ..CleanGridConfig::default()
            },
            ..MachineConfig::default()
        };
        let mut optimizer = PeakExportOptimizer::new(deps, cfg, chrono_tz::UTC);
        optimizer
            .enable(
                OptimizerParams::from_config(&OptimizerConfig::default()),
                Utc::now().with_timezone(&chrono_tz::UTC),
            )
            .await;
        let scheduler = TaskScheduler::new(Arc::new(Mutex::new(optimizer)), chrono_tz::UTC);

        scheduler.run_optimizer_once().await;
        let status = scheduler.get_optimizer_status().await;
        assert_eq!(status.error_count, 1);
        assert!(status.last_error.as_deref().unwrap_or_default().contains("panic"));

        scheduler.run_optimizer_once().await;
        let status = scheduler.get_optimizer_status().await;
        assert_eq!(status.run_count, 2);
        assert_eq!(status.success_count, 1);
        assert!(status.last_error.is_none());
    }

    #[test]
    fn test_failed_run_keeps_counts() {
        let mut status = TaskStatus::default();
        status.started(Utc::now());
        status.failed("boom".into());
        assert_eq!(status.run_count, 1);
        assert_eq!(status.error_count, 1);
        assert_eq!(status.last_error.as_deref(), Some("boom"));
    }
}
