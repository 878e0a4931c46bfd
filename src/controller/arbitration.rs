//! Who may write device settings right now.
//!
//! The active controller is derived on demand from the optimizer snapshot and
//! the off-grid flag; nothing here is cached between calls.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;
use tracing::{info, warn};

use crate::optimizer::{OptimizerStatus, Phase};
use crate::repo::{StateStore, StoreError};

pub const OFFGRID_ACTIVE: &str = "offgrid.active";
pub const EV_STRATEGY: &str = "ev_scheduler.strategy";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Controller {
    Manual,
    Automation,
    EvScheduler,
    Optimizer,
    Offgrid,
}

impl Controller {
    /// Higher overrides lower. The EV scheduler shares the automation tier; it
    /// never competes for battery settings.
    pub fn priority(self) -> u8 {
        match self {
            Controller::Manual => 0,
            Controller::Automation | Controller::EvScheduler => 1,
            Controller::Optimizer => 2,
            Controller::Offgrid => 3,
        }
    }

    fn denial_reason(self) -> String {
        match self {
            Controller::Offgrid => "Off-Grid Mode is active".to_string(),
            Controller::Optimizer => {
                "Peak export optimizer is controlling the battery during peak hours".to_string()
            }
            other => format!("{other} is active"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Permission {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub active: Option<Controller>,
}

#[derive(Debug, Error)]
pub enum ArbitrationError {
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Derived view; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbitrationState {
    pub offgrid_active: bool,
    pub optimizer_controlling: bool,
}

impl ArbitrationState {
    pub fn derive(optimizer_enabled: bool, phase: Phase, offgrid_active: bool) -> Self {
        Self {
            offgrid_active,
            optimizer_controlling: optimizer_enabled && phase.is_controlling(),
        }
    }

    pub fn active(&self) -> Option<Controller> {
        if self.offgrid_active {
            Some(Controller::Offgrid)
        } else if self.optimizer_controlling {
            Some(Controller::Optimizer)
        } else {
            None
        }
    }

    pub fn can_act(&self, requester: Controller) -> Permission {
        let active = self.active();
        match active {
            None => Permission { allowed: true, reason: None, active },
            Some(owner) if owner == requester || requester.priority() >= owner.priority() => {
                Permission { allowed: true, reason: None, active }
            }
            Some(owner) => Permission {
                allowed: false,
                reason: Some(owner.denial_reason()),
                active,
            },
        }
    }

    /// Turning a mode on is refused while the other exclusive mode holds the device.
    pub fn check_mode_conflict(&self, enabling: Controller) -> Result<(), ArbitrationError> {
        match enabling {
            Controller::Offgrid if self.optimizer_controlling => Err(ArbitrationError::Conflict(
                "Cannot enable Off-Grid Mode while the peak export optimizer is actively managing peak hours. \
                 Disable the optimizer first or wait until peak ends."
                    .to_string(),
            )),
            Controller::Optimizer if self.offgrid_active => Err(ArbitrationError::Conflict(
                "Cannot enable the peak export optimizer while Off-Grid Mode is active. \
                 Disable Off-Grid Mode first."
                    .to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Process-wide arbitration registry.
///
/// Holds the off-grid flag (shared with the optimizer so it can refuse to take
/// control) and the EV scheduler's strategy for advisory warnings.
pub struct ControlRegistry {
    store: Arc<dyn StateStore>,
    offgrid: Arc<AtomicBool>,
    optimizer: Arc<RwLock<OptimizerStatus>>,
}

impl ControlRegistry {
    pub fn load(store: Arc<dyn StateStore>, optimizer: Arc<RwLock<OptimizerStatus>>) -> Self {
        let active = match store.get(OFFGRID_ACTIVE) {
            Ok(v) => v.and_then(|v| v.as_bool()).unwrap_or(false),
            Err(e) => {
                warn!(error = %e, "could not read off-grid flag, assuming inactive");
                false
            }
        };
        if active {
            info!("off-grid mode active from previous run");
        }
        Self {
            store,
            offgrid: Arc::new(AtomicBool::new(active)),
            optimizer,
        }
    }

    pub fn offgrid_flag(&self) -> Arc<AtomicBool> {
        self.offgrid.clone()
    }

    pub fn offgrid_active(&self) -> bool {
        self.offgrid.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ArbitrationState {
        let (enabled, phase) = {
            let status = self.optimizer.read();
            (status.enabled, status.phase)
        };
        ArbitrationState::derive(enabled, phase, self.offgrid_active())
    }

    pub fn can_act(&self, requester: Controller) -> Permission {
        let permission = self.snapshot().can_act(requester);
        if !permission.allowed {
            info!(%requester, active = ?permission.active, "device write denied");
        }
        permission
    }

    pub fn check_optimizer_enable(&self) -> Result<(), ArbitrationError> {
        self.snapshot().check_mode_conflict(Controller::Optimizer)
    }

    pub fn set_offgrid(&self, active: bool) -> Result<(), ArbitrationError> {
        if active {
            self.snapshot().check_mode_conflict(Controller::Offgrid)?;
        }
        self.store.set(OFFGRID_ACTIVE, Value::Bool(active))?;
        self.offgrid.store(active, Ordering::Relaxed);
        info!(active, "off-grid mode changed");
        Ok(())
    }

    /// `None` or `"off"` means the EV scheduler is idle.
    pub fn set_ev_strategy(&self, strategy: Option<&str>) -> Result<(), ArbitrationError> {
        let value = match strategy {
            Some(s) if s != "off" => Value::String(s.to_string()),
            _ => Value::Null,
        };
        self.store.set(EV_STRATEGY, value)?;
        Ok(())
    }

    pub fn ev_strategy(&self) -> Option<String> {
        match self.store.get(EV_STRATEGY) {
            Ok(Some(Value::String(s))) if s != "off" => Some(s),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "could not read EV scheduler strategy");
                None
            }
        }
    }

    /// Manual vehicle-charging changes are never blocked, only warned about.
    pub fn check_ev_manual(&self) -> Permission {
        Permission {
            allowed: true,
            reason: self.ev_strategy().map(|strategy| {
                format!("EV smart scheduler ({strategy}) is active. Manual changes may be overridden.")
            }),
            active: None,
        }
    }
}
