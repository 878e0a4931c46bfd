//! Process restarts at awkward moments, with state kept in the JSON file store.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{local, params, pre_peak_settings, Site};
use peak_export_controller::domain::{DeviceSettings, OperationMode};
use peak_export_controller::optimizer::{persistence, Phase};
use peak_export_controller::repo::{JsonFileStore, StateStore};

fn open(path: &Path) -> Arc<dyn StateStore> {
    Arc::new(JsonFileStore::open(path).unwrap())
}

/// Same device, freshly reopened store: what a restarted process sees.
fn restart(site: &Site, path: &Path) -> Site {
    Site {
        gateway: site.gateway.clone(),
        store: open(path),
        notifier: site.notifier.clone(),
    }
}

#[tokio::test]
async fn test_restart_mid_dump_resumes_and_restores() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let site = Site::new(open(&path));

    {
        let mut opt = site.optimizer();
        opt.enable(params(), local(3, 17, 0)).await;
        opt.tick(local(3, 19, 0)).await;
        assert_eq!(opt.state().phase, Phase::Dumping);
    }

    let site = restart(&site, &path);
    let mut opt = site.optimizer();
    opt.start(local(3, 19, 10)).await;
    assert!(opt.state().enabled);
    assert_eq!(opt.state().phase, Phase::Dumping);
    assert!(opt.state().dump_started_at.is_some());

    // No second capture: the restore point must still be the pre-peak one.
    let rp = opt.state().restore_point.unwrap();
    assert_eq!(rp.reserve_pct, Some(30.0));

    opt.tick(local(3, 21, 0)).await;
    assert_eq!(opt.state().phase, Phase::Idle);
    assert_eq!(site.gateway.settings(), pre_peak_settings());
}

#[tokio::test]
async fn test_restart_after_peak_restores_on_first_tick() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let site = Site::new(open(&path));

    {
        let mut opt = site.optimizer();
        opt.enable(params(), local(3, 17, 0)).await;
        opt.tick(local(3, 19, 0)).await;
        assert_eq!(site.gateway.settings().reserve_pct, 5.0);
    }

    // Down from 19:05 until 22:30: peak ended while nobody was watching.
    let site = restart(&site, &path);
    let mut opt = site.optimizer();
    opt.start(local(3, 22, 30)).await;
    assert_eq!(opt.state().phase, Phase::Dumping);
    assert_eq!(site.gateway.settings().reserve_pct, 5.0);

    opt.tick(local(3, 22, 32)).await;
    assert_eq!(opt.state().phase, Phase::Idle);
    assert_eq!(site.gateway.settings(), pre_peak_settings());

    let reopened = open(&path);
    assert!(reopened.get(persistence::RESTORE_MODE).unwrap().is_none());
    assert_eq!(
        reopened.get(persistence::PHASE).unwrap(),
        Some(serde_json::json!("idle"))
    );
}

#[tokio::test]
async fn test_restart_into_peak_with_idle_phase_captures_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let site = Site::new(open(&path));

    {
        let mut opt = site.optimizer();
        opt.enable(params(), local(3, 12, 0)).await;
    }

    let site = restart(&site, &path);
    let mut opt = site.optimizer();
    opt.start(local(3, 17, 30)).await;
    assert_eq!(opt.state().phase, Phase::PeakHold);
    assert_eq!(site.gateway.settings().mode, OperationMode::SelfConsumption);
    assert_eq!(opt.state().restore_point.unwrap().reserve_pct, Some(30.0));
}

#[tokio::test]
async fn test_end_peak_twice_matches_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let site = Site::new(open(&path));

    let mut opt = site.optimizer();
    opt.enable(params(), local(3, 17, 0)).await;
    opt.tick(local(3, 19, 0)).await;

    assert!(opt.end_peak(&local(3, 19, 30)).await);
    let once: DeviceSettings = site.gateway.settings();
    let commands_after_first = site.gateway.commands().len();

    assert!(!opt.end_peak(&local(3, 19, 31)).await);
    assert_eq!(site.gateway.settings(), once);
    assert_eq!(site.gateway.commands().len(), commands_after_first);
    assert_eq!(once, pre_peak_settings());
}

#[tokio::test]
async fn test_partial_restore_point_fills_safe_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let site = Site::new(open(&path));

    {
        let mut opt = site.optimizer();
        opt.enable(params(), local(3, 17, 0)).await;
    }
    // Simulate a torn write: only the mode survived.
    site.store.remove(persistence::RESTORE_RESERVE_PCT).unwrap();
    site.store.remove(persistence::RESTORE_EXPORT_RULE).unwrap();
    site.store.remove(persistence::RESTORE_GRID_CHARGING).unwrap();

    let site = restart(&site, &path);
    let mut opt = site.optimizer();
    opt.start(local(3, 21, 10)).await;
    opt.tick(local(3, 21, 12)).await;

    let restored = site.gateway.settings();
    assert_eq!(restored.mode, OperationMode::Autonomous);
    assert_eq!(restored.reserve_pct, 20.0);
    assert_eq!(restored, DeviceSettings::default());
}
