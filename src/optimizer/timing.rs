//! Dump-timing math and restart phase derivation. No I/O here.

use chrono::{Duration, NaiveDateTime, NaiveTime, Timelike};
use serde::Serialize;

use super::state::{Decision, Phase};
use crate::domain::BatteryCapacity;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DumpTimingInput {
    pub soc_pct: f64,
    pub min_reserve_pct: f64,
    pub capacity: BatteryCapacity,
    pub home_load_kw: f64,
    pub minutes_remaining: f64,
    pub buffer_minutes: f64,
    /// Below this much dischargeable energy a dump is not worth starting.
    pub negligible_kwh: f64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct DumpTiming {
    pub available_kwh: f64,
    pub minutes_needed: f64,
    pub minutes_remaining: f64,
    pub trigger_at_minutes: f64,
    /// Display only: what reaches the grid after the home is served.
    pub net_export_kw: f64,
    pub decision: Decision,
}

/// Decide whether the battery must start discharging now to empty to the
/// reserve floor before the peak window closes.
///
/// The battery drains at its full rated power regardless of how that power
/// splits between home and grid, so `minutes_needed` uses max power only.
pub fn evaluate_dump_timing(input: &DumpTimingInput) -> DumpTiming {
    let available_pct = (input.soc_pct - input.min_reserve_pct).max(0.0);
    let available_kwh = input.capacity.kwh_for_pct(available_pct);
    let drain_kw = input.capacity.max_power_kw;
    let minutes_needed = if drain_kw > 0.0 {
        available_kwh / drain_kw * 60.0
    } else {
        0.0
    };
    let trigger_at_minutes = input.minutes_remaining - input.buffer_minutes;
    let net_export_kw = (drain_kw - input.home_load_kw).max(0.1);

    let decision = if available_kwh <= 0.0 || available_kwh < input.negligible_kwh {
        Decision::Skip
    } else if minutes_needed >= trigger_at_minutes {
        Decision::Dump
    } else {
        Decision::Wait
    };

    DumpTiming {
        available_kwh,
        minutes_needed,
        minutes_remaining: input.minutes_remaining,
        trigger_at_minutes,
        net_export_kw,
        decision,
    }
}

/// Minutes from `now` until `end_minute` (minute of day, 1440 = next midnight).
///
/// An end at or before `now` is taken to be tomorrow's.
pub fn minutes_until(now: &NaiveDateTime, end_minute: u32) -> f64 {
    let midnight = now.date().and_time(NaiveTime::MIN);
    let mut end = midnight + Duration::minutes(i64::from(end_minute));
    if end <= *now {
        end += Duration::days(1);
    }
    (end - *now).num_seconds() as f64 / 60.0
}

/// Minutes from `now` until `start_minute` today, `None` once it has passed.
pub fn minutes_until_today(now: &NaiveDateTime, start_minute: u32) -> Option<i64> {
    let now_minute = i64::from(now.hour() * 60 + now.minute());
    let delta = i64::from(start_minute) - now_minute;
    (delta > 0).then_some(delta)
}

/// What to do with a persisted phase when the process starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Still in peak: continue the saved phase as-is.
    Resume(Phase),
    /// In peak with nothing saved: run a normal PeakHold entry now.
    FreshPeakHold,
    /// Peak is over but settings were left in peak configuration: keep the
    /// phase for one tick so "end peak" restores them.
    PendingRestore(Phase),
    Idle,
}

pub fn recover_phase(saved: Phase, in_peak: bool) -> Recovery {
    match (in_peak, saved) {
        (true, Phase::Idle) => Recovery::FreshPeakHold,
        (true, phase) => Recovery::Resume(phase),
        (false, phase) if phase.is_peak_phase() => Recovery::PendingRestore(phase),
        (false, _) => Recovery::Idle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CapacitySource;
    use chrono::NaiveDate;
    use proptest::prelude::*;
    use rstest::rstest;

    fn capacity(kwh: f64, kw: f64) -> BatteryCapacity {
        BatteryCapacity {
            capacity_kwh: kwh,
            max_power_kw: kw,
            source: CapacitySource::Defaults,
        }
    }

    fn input(soc: f64, min_reserve: f64, cap: BatteryCapacity, remaining: f64) -> DumpTimingInput {
        DumpTimingInput {
            soc_pct: soc,
            min_reserve_pct: min_reserve,
            capacity: cap,
            home_load_kw: 1.0,
            minutes_remaining: remaining,
            buffer_minutes: 15.0,
            negligible_kwh: 1.0,
        }
    }

    #[test]
    fn test_late_in_peak_with_full_battery_dumps() {
        let t = evaluate_dump_timing(&input(85.0, 5.0, capacity(27.0, 11.5), 20.0));
        assert!((t.available_kwh - 21.6).abs() < 1e-9);
        assert!((t.minutes_needed - 112.695_652).abs() < 1e-3);
        assert!((t.trigger_at_minutes - 5.0).abs() < 1e-9);
        assert_eq!(t.decision, Decision::Dump);
    }

    #[test]
    fn test_small_surplus_is_skipped() {
        let t = evaluate_dump_timing(&input(30.0, 25.0, capacity(13.5, 5.0), 200.0));
        assert!((t.available_kwh - 0.675).abs() < 1e-9);
        assert_eq!(t.decision, Decision::Skip);

        // Skip wins even when the window is nearly over.
        let t = evaluate_dump_timing(&input(30.0, 25.0, capacity(13.5, 5.0), 1.0));
        assert_eq!(t.decision, Decision::Skip);
    }

    #[test]
    fn test_early_in_peak_waits() {
        let t = evaluate_dump_timing(&input(85.0, 5.0, capacity(27.0, 11.5), 240.0));
        assert_eq!(t.decision, Decision::Wait);
    }

    #[test]
    fn test_soc_below_reserve_has_nothing_available() {
        let t = evaluate_dump_timing(&input(3.0, 5.0, capacity(27.0, 11.5), 10.0));
        assert_eq!(t.available_kwh, 0.0);
        assert_eq!(t.decision, Decision::Skip);
    }

    #[rstest]
    #[case(17, 0, 21 * 60, 240.0)]
    #[case(20, 30, 21 * 60, 30.0)]
    #[case(23, 50, 7 * 60, 430.0)]
    #[case(21, 0, 21 * 60, 1440.0)]
    #[case(22, 0, 24 * 60, 120.0)]
    fn test_minutes_until(#[case] h: u32, #[case] m: u32, #[case] end: u32, #[case] expected: f64) {
        let now = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap().and_hms_opt(h, m, 0).unwrap();
        assert!((minutes_until(&now, end) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_minutes_until_today() {
        let now = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap().and_hms_opt(15, 20, 0).unwrap();
        assert_eq!(minutes_until_today(&now, 17 * 60), Some(100));
        assert_eq!(minutes_until_today(&now, 15 * 60), None);
    }

    #[rstest]
    #[case(Phase::PeakHold, true, Recovery::Resume(Phase::PeakHold))]
    #[case(Phase::Dumping, true, Recovery::Resume(Phase::Dumping))]
    #[case(Phase::Complete, true, Recovery::Resume(Phase::Complete))]
    #[case(Phase::Idle, true, Recovery::FreshPeakHold)]
    #[case(Phase::Dumping, false, Recovery::PendingRestore(Phase::Dumping))]
    #[case(Phase::Complete, false, Recovery::PendingRestore(Phase::Complete))]
    #[case(Phase::Idle, false, Recovery::Idle)]
    fn test_recover_phase(#[case] saved: Phase, #[case] in_peak: bool, #[case] expected: Recovery) {
        assert_eq!(recover_phase(saved, in_peak), expected);
    }

    proptest! {
        #[test]
        fn prop_dump_never_reverts_as_soc_rises(
            soc in 0.0f64..100.0,
            step in 0.0f64..30.0,
            remaining in 0.0f64..600.0,
        ) {
            let cap = capacity(27.0, 11.5);
            let lo = evaluate_dump_timing(&input(soc, 5.0, cap, remaining));
            let hi = evaluate_dump_timing(&input((soc + step).min(100.0), 5.0, cap, remaining));
            if lo.decision == Decision::Dump {
                prop_assert_eq!(hi.decision, Decision::Dump);
            }
        }

        #[test]
        fn prop_dump_never_reverts_as_window_closes(
            soc in 0.0f64..100.0,
            remaining in 0.0f64..600.0,
            elapsed in 0.0f64..600.0,
        ) {
            let cap = capacity(13.5, 5.0);
            let early = evaluate_dump_timing(&input(soc, 10.0, cap, remaining));
            let later = evaluate_dump_timing(&input(soc, 10.0, cap, (remaining - elapsed).max(0.0)));
            if early.decision == Decision::Dump {
                prop_assert_eq!(later.decision, Decision::Dump);
            }
        }
    }
}
