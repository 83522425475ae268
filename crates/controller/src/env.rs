//! Environment reader (C10): validated temperature/humidity/pressure/rain
//! samples for the auto scheduler, backed by a swappable port chosen once
//! at construction (§9) — never by `#[cfg(...)]` branches in the core.

use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ValidityFlags {
    pub temp_valid: bool,
    pub rh_valid: bool,
    pub pressure_valid: bool,
    pub rain_valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DerivedValues {
    pub vp_sat_kpa: f64,
    pub vp_actual_kpa: f64,
    pub dewpoint_c: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvSample {
    pub timestamp: i64,
    pub temp_mean_c: f64,
    pub temp_min_c: f64,
    pub temp_max_c: f64,
    pub rh_pct: f64,
    pub pressure_hpa: f64,
    pub rain_mm_24h: f64,
    pub derived: DerivedValues,
    pub validity: ValidityFlags,
    pub data_quality_pct: u8,
}

const TEMP_RANGE: std::ops::RangeInclusive<f64> = -50.0..=70.0;
const RH_RANGE: std::ops::RangeInclusive<f64> = 0.0..=100.0;
const PRESSURE_RANGE: std::ops::RangeInclusive<f64> = 800.0..=1200.0;
const RAIN_RANGE: std::ops::RangeInclusive<f64> = 0.0..=500.0;

/// Saturation vapor pressure (Tetens approximation, kPa) at `temp_c`.
fn vp_sat_kpa(temp_c: f64) -> f64 {
    0.6108 * ((17.27 * temp_c) / (temp_c + 237.3)).exp()
}

fn dewpoint_c(temp_c: f64, rh_pct: f64) -> f64 {
    let rh = (rh_pct / 100.0).max(1e-6);
    let gamma = ((17.27 * temp_c) / (237.3 + temp_c)) + rh.ln();
    (237.3 * gamma) / (17.27 - gamma)
}

/// Validates raw readings per §4.10 and computes derived psychrometric
/// values strictly from fields that are valid (decision recorded in
/// SPEC_FULL.md/DESIGN.md open-question #2).
pub fn build_sample(
    timestamp: i64,
    temp_mean_c: f64,
    temp_min_c: f64,
    temp_max_c: f64,
    rh_pct: f64,
    pressure_hpa: f64,
    rain_mm_24h: f64,
    data_quality_pct: u8,
) -> EnvSample {
    let validity = ValidityFlags {
        temp_valid: TEMP_RANGE.contains(&temp_mean_c),
        rh_valid: RH_RANGE.contains(&rh_pct),
        pressure_valid: PRESSURE_RANGE.contains(&pressure_hpa),
        rain_valid: RAIN_RANGE.contains(&rain_mm_24h),
    };

    let derived = if validity.temp_valid {
        let vp_sat = vp_sat_kpa(temp_mean_c);
        let vp_actual = if validity.rh_valid {
            vp_sat * (rh_pct / 100.0)
        } else {
            0.0
        };
        DerivedValues {
            vp_sat_kpa: vp_sat,
            vp_actual_kpa: vp_actual,
            dewpoint_c: if validity.rh_valid {
                dewpoint_c(temp_mean_c, rh_pct)
            } else {
                0.0
            },
        }
    } else {
        DerivedValues::default()
    };

    EnvSample {
        timestamp,
        temp_mean_c,
        temp_min_c,
        temp_max_c,
        rh_pct,
        pressure_hpa,
        rain_mm_24h,
        derived,
        validity,
        data_quality_pct,
    }
}

/// A seasonally-parameterised conservative fallback used when every
/// primary source is unavailable (§4.10).
pub fn fallback_sample(timestamp: i64, month_of_year: u32) -> EnvSample {
    // Crude mid-latitude seasonal curve: warmest in month 7 (July), coolest
    // in month 1 (January). Good enough to keep scheduling conservative.
    let phase = ((month_of_year as f64 - 7.0) / 12.0) * std::f64::consts::TAU;
    let temp = 15.0 - 10.0 * phase.cos();
    build_sample(timestamp, temp, temp - 5.0, temp + 5.0, 55.0, 1013.0, 0.0, 60)
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Swappable backend for environment readings, selected once at construction.
pub trait EnvPort: Send + Sync {
    fn sample(&mut self) -> EnvSample;
}

pub const DEFAULT_MAX_SENSOR_AGE_SECS: i64 = 30 * 60;

#[derive(Debug, Clone, Copy)]
struct FieldWatermark {
    value: f64,
    changed_epoch: i64,
}

/// Wraps any backend and invalidates a field once its underlying reading
/// has held the same value for longer than `max_age_secs` — a stuck sensor
/// replaying a cached value still looks in-range to `build_sample`'s range
/// check alone, so staleness needs its own per-field last-good-timestamp
/// (§4.10: "stale readings ... invalidate their fields").
pub struct StaleGuardReader {
    inner: Box<dyn EnvPort>,
    max_age_secs: i64,
    temp: Option<FieldWatermark>,
    rh: Option<FieldWatermark>,
    pressure: Option<FieldWatermark>,
    rain: Option<FieldWatermark>,
}

impl StaleGuardReader {
    pub fn new(inner: Box<dyn EnvPort>, max_age_secs: i64) -> Self {
        Self {
            inner,
            max_age_secs,
            temp: None,
            rh: None,
            pressure: None,
            rain: None,
        }
    }

    /// Updates the watermark if `value` differs from the last seen reading,
    /// and returns the age (seconds) since the value last changed.
    fn track(watermark: &mut Option<FieldWatermark>, value: f64, now: i64) -> i64 {
        match watermark {
            Some(w) if w.value == value => now - w.changed_epoch,
            _ => {
                *watermark = Some(FieldWatermark {
                    value,
                    changed_epoch: now,
                });
                0
            }
        }
    }
}

impl EnvPort for StaleGuardReader {
    fn sample(&mut self) -> EnvSample {
        let mut raw = self.inner.sample();
        let now = raw.timestamp;

        let temp_age = Self::track(&mut self.temp, raw.temp_mean_c, now);
        let rh_age = Self::track(&mut self.rh, raw.rh_pct, now);
        let pressure_age = Self::track(&mut self.pressure, raw.pressure_hpa, now);
        let rain_age = Self::track(&mut self.rain, raw.rain_mm_24h, now);

        raw.validity.temp_valid &= temp_age <= self.max_age_secs;
        raw.validity.rh_valid &= rh_age <= self.max_age_secs;
        raw.validity.pressure_valid &= pressure_age <= self.max_age_secs;
        raw.validity.rain_valid &= rain_age <= self.max_age_secs;

        // Open question #2: derived values are recomputed strictly from
        // fields still valid after the staleness check, same rule as the
        // range check in `build_sample`.
        raw.derived = if raw.validity.temp_valid {
            let vp_sat = vp_sat_kpa(raw.temp_mean_c);
            DerivedValues {
                vp_sat_kpa: vp_sat,
                vp_actual_kpa: if raw.validity.rh_valid {
                    vp_sat * (raw.rh_pct / 100.0)
                } else {
                    0.0
                },
                dewpoint_c: if raw.validity.rh_valid {
                    dewpoint_c(raw.temp_mean_c, raw.rh_pct)
                } else {
                    0.0
                },
            }
        } else {
            DerivedValues::default()
        };

        raw
    }
}

// ---------------------------------------------------------------------------
// Simulated backend
// ---------------------------------------------------------------------------

/// A deterministic-feeling but stochastic generator composed of
/// mean-reversion toward a baseline, a bounded random walk, a diurnal
/// sinusoid, small electronic noise, and occasional spikes — the same
/// compositional technique this codebase's sensor-node ancestor used for
/// simulated soil moisture, generalised across four environmental signals.
#[cfg(feature = "sim")]
pub struct SimEnvReader {
    started: std::time::Instant,
    temp_state: f64,
    rh_state: f64,
    pressure_state: f64,
    rain_accum_mm: f64,
    diurnal_period_s: f64,
    baseline_temp: f64,
    baseline_rh: f64,
    baseline_pressure: f64,
}

#[cfg(feature = "sim")]
impl SimEnvReader {
    pub fn new(baseline_temp: f64, baseline_rh: f64, baseline_pressure: f64) -> Self {
        Self {
            started: std::time::Instant::now(),
            temp_state: baseline_temp,
            rh_state: baseline_rh,
            pressure_state: baseline_pressure,
            rain_accum_mm: 0.0,
            diurnal_period_s: 86_400.0,
            baseline_temp,
            baseline_rh,
            baseline_pressure,
        }
    }

    /// Approximate standard normal via Irwin-Hall (sum of 12 uniforms - 6).
    fn approx_std_normal() -> f64 {
        let mut sum = 0.0;
        for _ in 0..12 {
            sum += fastrand::f64();
        }
        sum - 6.0
    }

    fn mean_revert_walk(state: f64, baseline: f64, reversion: f64, walk_sigma: f64) -> f64 {
        let pull = (baseline - state) * reversion;
        let walk = Self::approx_std_normal() * walk_sigma;
        state + pull + walk
    }

    fn diurnal_offset(&self, amplitude: f64) -> f64 {
        let t = self.started.elapsed().as_secs_f64();
        amplitude * (std::f64::consts::TAU * t / self.diurnal_period_s).sin()
    }
}

#[cfg(feature = "sim")]
impl EnvPort for SimEnvReader {
    fn sample(&mut self) -> EnvSample {
        self.temp_state = Self::mean_revert_walk(self.temp_state, self.baseline_temp, 0.05, 0.15);
        self.rh_state = Self::mean_revert_walk(self.rh_state, self.baseline_rh, 0.05, 0.8)
            .clamp(0.0, 100.0);
        self.pressure_state =
            Self::mean_revert_walk(self.pressure_state, self.baseline_pressure, 0.02, 0.3);

        // Rare rain spike; decays geometrically once it starts.
        if fastrand::f64() < 0.002 {
            self.rain_accum_mm += fastrand::f64() * 4.0;
        }
        self.rain_accum_mm *= 0.98;

        let temp = self.temp_state + self.diurnal_offset(4.0) + Self::approx_std_normal() * 0.05;
        let rh = (self.rh_state - self.diurnal_offset(8.0)).clamp(0.0, 100.0);
        let pressure = self.pressure_state;

        build_sample(
            now_unix(),
            temp,
            temp - 3.0,
            temp + 3.0,
            rh,
            pressure,
            self.rain_accum_mm,
            95,
        )
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Validation ----------------------------------------------------------

    #[test]
    fn in_range_values_all_valid() {
        let s = build_sample(0, 25.0, 20.0, 30.0, 50.0, 1013.0, 0.0, 100);
        assert!(s.validity.temp_valid);
        assert!(s.validity.rh_valid);
        assert!(s.validity.pressure_valid);
        assert!(s.validity.rain_valid);
    }

    #[test]
    fn out_of_range_temp_invalidated_but_sample_returned() {
        let s = build_sample(0, 200.0, 20.0, 30.0, 50.0, 1013.0, 0.0, 100);
        assert!(!s.validity.temp_valid);
        assert_eq!(s.temp_mean_c, 200.0);
    }

    #[test]
    fn out_of_range_rh_invalidated() {
        let s = build_sample(0, 25.0, 20.0, 30.0, 150.0, 1013.0, 0.0, 100);
        assert!(!s.validity.rh_valid);
    }

    #[test]
    fn out_of_range_pressure_invalidated() {
        let s = build_sample(0, 25.0, 20.0, 30.0, 50.0, 50.0, 0.0, 100);
        assert!(!s.validity.pressure_valid);
    }

    #[test]
    fn out_of_range_rain_invalidated() {
        let s = build_sample(0, 25.0, 20.0, 30.0, 50.0, 1013.0, 600.0, 100);
        assert!(!s.validity.rain_valid);
    }

    #[test]
    fn derived_values_skipped_when_temp_invalid() {
        let s = build_sample(0, 200.0, 20.0, 30.0, 50.0, 1013.0, 0.0, 100);
        assert_eq!(s.derived.vp_sat_kpa, 0.0);
    }

    #[test]
    fn derived_values_computed_when_temp_and_rh_valid() {
        let s = build_sample(0, 25.0, 20.0, 30.0, 50.0, 1013.0, 0.0, 100);
        assert!(s.derived.vp_sat_kpa > 0.0);
        assert!(s.derived.vp_actual_kpa > 0.0);
    }

    #[test]
    fn offset_not_applied_to_invalid_reading() {
        // Open question #2: an invalid reading is flagged, not offset/derived.
        let s = build_sample(0, -1000.0, 20.0, 30.0, 50.0, 1013.0, 0.0, 100);
        assert!(!s.validity.temp_valid);
        assert_eq!(s.derived.dewpoint_c, 0.0);
    }

    // -- Staleness ---------------------------------------------------------

    struct FixedReading(EnvSample);
    impl EnvPort for FixedReading {
        fn sample(&mut self) -> EnvSample {
            self.0
        }
    }

    #[test]
    fn fresh_repeated_reading_stays_valid_within_age_bound() {
        let fixed = build_sample(0, 25.0, 20.0, 30.0, 50.0, 1013.0, 0.0, 100);
        let mut guard = StaleGuardReader::new(Box::new(FixedReading(fixed)), 600);
        let s1 = guard.sample();
        assert!(s1.validity.temp_valid);
        // Same reading again at the same timestamp: age is 0, still fresh.
        let s2 = guard.sample();
        assert!(s2.validity.temp_valid);
    }

    #[test]
    fn unchanged_reading_past_max_age_is_invalidated() {
        struct AgingFixed {
            sample: EnvSample,
            calls: u32,
        }
        impl EnvPort for AgingFixed {
            fn sample(&mut self) -> EnvSample {
                self.calls += 1;
                // First call establishes the watermark at t=0; the second
                // call replays the same value far enough in the future to
                // exceed the staleness bound.
                self.sample.timestamp = if self.calls == 1 { 0 } else { 1_000 };
                self.sample
            }
        }
        let fixed = build_sample(0, 25.0, 20.0, 30.0, 50.0, 1013.0, 0.0, 100);
        let mut guard = StaleGuardReader::new(Box::new(AgingFixed { sample: fixed, calls: 0 }), 600);
        let s1 = guard.sample();
        assert!(s1.validity.temp_valid);
        let s2 = guard.sample();
        assert!(!s2.validity.temp_valid);
        assert_eq!(s2.derived.vp_sat_kpa, 0.0);
    }

    #[test]
    fn changing_reading_never_goes_stale() {
        struct Counting(f64);
        impl EnvPort for Counting {
            fn sample(&mut self) -> EnvSample {
                self.0 += 1.0;
                build_sample(1_000_000, self.0, self.0 - 5.0, self.0 + 5.0, 50.0, 1013.0, 0.0, 100)
            }
        }
        let mut guard = StaleGuardReader::new(Box::new(Counting(20.0)), 0);
        for _ in 0..5 {
            let s = guard.sample();
            assert!(s.validity.temp_valid);
        }
    }

    // -- Fallback --------------------------------------------------------

    #[test]
    fn fallback_sample_has_reduced_quality_and_all_valid() {
        let s = fallback_sample(0, 7);
        assert_eq!(s.data_quality_pct, 60);
        assert!(s.validity.temp_valid && s.validity.rh_valid && s.validity.pressure_valid);
    }

    #[cfg(feature = "sim")]
    #[test]
    fn sim_reader_produces_samples_near_baseline() {
        let mut r = SimEnvReader::new(20.0, 50.0, 1013.0);
        for _ in 0..20 {
            let s = r.sample();
            assert!(s.temp_mean_c > -10.0 && s.temp_mean_c < 50.0);
            assert!(s.rh_pct >= 0.0 && s.rh_pct <= 100.0);
        }
    }
}
