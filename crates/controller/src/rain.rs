//! Rain compensation (C8): trims or skips a task based on recent rainfall.

use crate::channel::RainCompensation;
use crate::task::TaskMode;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RainImpact {
    pub raw_mm: f32,
    pub effective_mm: f32,
    pub reduction_pct: f32,
    pub skip: bool,
}

/// Source of "millimeters of rain in the last N hours" — a pure external
/// input per the data model.
pub trait RainfallSource {
    fn rainfall_last_hours(&self, hours: u32) -> f32;
}

/// Applies §4.8. Returns `(adjusted_mode, impact)`; `adjusted_mode` is
/// `None` when the task should be skipped.
pub fn apply(
    rc: &RainCompensation,
    source: &dyn RainfallSource,
    mode: TaskMode,
) -> (Option<TaskMode>, Option<RainImpact>) {
    if !rc.enabled {
        return (Some(mode), None);
    }

    let raw = source.rainfall_last_hours(rc.lookback_hours);
    let effective = raw * rc.reduction_factor;

    if effective >= rc.skip_threshold_mm {
        return (
            None,
            Some(RainImpact {
                raw_mm: raw,
                effective_mm: effective,
                reduction_pct: 100.0,
                skip: true,
            }),
        );
    }

    let reduction_pct = if rc.skip_threshold_mm > 0.0 {
        (rc.sensitivity_pct * effective / rc.skip_threshold_mm).min(100.0)
    } else {
        0.0
    };

    let factor = 1.0 - reduction_pct / 100.0;

    let adjusted = match mode {
        TaskMode::ByVolume { liters } => {
            let trimmed = liters as f32 * factor;
            if trimmed < 1.0 {
                None
            } else {
                Some(TaskMode::ByVolume {
                    liters: trimmed.round() as u16,
                })
            }
        }
        TaskMode::ByDuration { minutes } => {
            let trimmed = minutes as f32 * factor;
            if trimmed < 1.0 {
                None
            } else {
                Some(TaskMode::ByDuration {
                    minutes: trimmed.round() as u16,
                })
            }
        }
    };

    let skip = adjusted.is_none();
    (
        adjusted,
        Some(RainImpact {
            raw_mm: raw,
            effective_mm: effective,
            reduction_pct,
            skip,
        }),
    )
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRain(f32);
    impl RainfallSource for FixedRain {
        fn rainfall_last_hours(&self, _hours: u32) -> f32 {
            self.0
        }
    }

    fn rc(enabled: bool) -> RainCompensation {
        RainCompensation {
            enabled,
            sensitivity_pct: 75.0,
            skip_threshold_mm: 5.0,
            reduction_factor: 0.8,
            lookback_hours: 48,
        }
    }

    #[test]
    fn disabled_compensation_passes_through() {
        let (mode, impact) = apply(&rc(false), &FixedRain(100.0), TaskMode::ByVolume { liters: 3 });
        assert_eq!(mode, Some(TaskMode::ByVolume { liters: 3 }));
        assert!(impact.is_none());
    }

    // S4 from the scenario table: rainfall_48h = 8.0mm -> effective 6.4 >= 5.0 -> skip.
    #[test]
    fn s4_rain_skip_scenario() {
        let (mode, impact) = apply(&rc(true), &FixedRain(8.0), TaskMode::ByVolume { liters: 3 });
        assert_eq!(mode, None);
        let impact = impact.unwrap();
        assert!((impact.effective_mm - 6.4).abs() < 1e-4);
        assert!(impact.skip);
    }

    #[test]
    fn threshold_exactly_at_skip_is_inclusive() {
        // reduction_factor=1.0, raw=5.0 -> effective=5.0 == skip_threshold_mm(5.0)
        let rc = RainCompensation {
            enabled: true,
            sensitivity_pct: 50.0,
            skip_threshold_mm: 5.0,
            reduction_factor: 1.0,
            lookback_hours: 24,
        };
        let (mode, impact) = apply(&rc, &FixedRain(5.0), TaskMode::ByVolume { liters: 3 });
        assert_eq!(mode, None);
        assert!(impact.unwrap().skip);
    }

    #[test]
    fn partial_rain_trims_volume() {
        let (mode, _impact) = apply(&rc(true), &FixedRain(2.0), TaskMode::ByVolume { liters: 10 });
        // effective = 2.0*0.8=1.6, reduction_pct=min(100,75*1.6/5*100)=24
        match mode.unwrap() {
            TaskMode::ByVolume { liters } => assert_eq!(liters, 8), // 10*(1-0.24)=7.6 -> rounds to 8
            _ => panic!("wrong mode"),
        }
    }

    #[test]
    fn partial_rain_trims_duration() {
        let (mode, _) = apply(&rc(true), &FixedRain(2.0), TaskMode::ByDuration { minutes: 20 });
        match mode.unwrap() {
            TaskMode::ByDuration { minutes } => assert!(minutes < 20 && minutes > 0),
            _ => panic!("wrong mode"),
        }
    }

    #[test]
    fn trimmed_below_one_liter_is_skipped() {
        let rc = RainCompensation {
            enabled: true,
            sensitivity_pct: 99.0,
            skip_threshold_mm: 10.0,
            reduction_factor: 1.0,
            lookback_hours: 24,
        };
        let (mode, impact) = apply(&rc, &FixedRain(9.9), TaskMode::ByVolume { liters: 1 });
        assert_eq!(mode, None);
        assert!(impact.unwrap().skip);
    }

    #[test]
    fn no_rain_leaves_task_unchanged() {
        let (mode, impact) = apply(&rc(true), &FixedRain(0.0), TaskMode::ByVolume { liters: 3 });
        assert_eq!(mode, Some(TaskMode::ByVolume { liters: 3 }));
        assert_eq!(impact.unwrap().reduction_pct, 0.0);
    }
}
