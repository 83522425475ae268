//! FAO-56 auto scheduler (C9): converts environmental data and crop
//! parameters into a target volume per AUTO channel.

use crate::channel::{Channel, ChannelStore, WateringMode};
use crate::env::EnvSample;
use crate::queue::TaskQueue;
use crate::state::{StateCoordinator, SystemEvent};
use crate::task::{Task, TaskMode, Trigger};

/// Crop coefficient staged by growth phase, looked up by days after
/// planting. Mirrors the FAO-56 initial/development/mid/late staging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlantProfile {
    pub kc_initial: f64,
    pub kc_mid: f64,
    pub kc_late: f64,
    pub initial_stage_days: u32,
    pub development_stage_days: u32,
    pub mid_stage_days: u32,
    /// m² per plant when the channel is plant-count based and no explicit
    /// spacing is configured.
    pub default_plant_footprint_m2: f64,
    /// Fractional reduction applied in `AutoEco` mode at this growth stage.
    pub eco_deficit_fraction: f64,
}

impl PlantProfile {
    pub fn kc_at(&self, days_after_planting: i64) -> f64 {
        let d = days_after_planting.max(0) as u32;
        if d <= self.initial_stage_days {
            self.kc_initial
        } else if d <= self.initial_stage_days + self.development_stage_days {
            let span = self.development_stage_days.max(1) as f64;
            let progress = (d - self.initial_stage_days) as f64 / span;
            self.kc_initial + (self.kc_mid - self.kc_initial) * progress
        } else if d <= self.initial_stage_days + self.development_stage_days + self.mid_stage_days
        {
            self.kc_mid
        } else {
            self.kc_late
        }
    }

    pub fn default_lawn() -> Self {
        Self {
            kc_initial: 0.7,
            kc_mid: 1.1,
            kc_late: 0.85,
            initial_stage_days: 10,
            development_stage_days: 20,
            mid_stage_days: 60,
            default_plant_footprint_m2: 0.25,
            eco_deficit_fraction: 0.15,
        }
    }
}

/// Simplified Penman-Monteith reference evapotranspiration (mm/day),
/// parameterised by mean temperature, relative humidity, pressure,
/// latitude, day-of-year, and fractional sun exposure. This trades the
/// full radiation-balance form for a compact estimator suitable for an
/// embedded controller with no solar-radiation sensor.
pub fn reference_eto_mm_day(
    temp_mean_c: f64,
    rh_pct: f64,
    pressure_hpa: f64,
    latitude_deg: f64,
    day_of_year: u32,
    sun_exposure_pct: f64,
) -> f64 {
    let delta = 4098.0 * (0.6108 * ((17.27 * temp_mean_c) / (temp_mean_c + 237.3)).exp())
        / (temp_mean_c + 237.3).powi(2);
    let gamma = 0.000665 * (pressure_hpa / 10.0);

    let lat_rad = latitude_deg.to_radians();
    let day_angle = 2.0 * std::f64::consts::PI * day_of_year as f64 / 365.0;
    let declination = 0.409 * (day_angle - 1.39).sin();
    let sunset_angle = (-lat_rad.tan() * declination.tan()).clamp(-1.0, 1.0).acos();
    let ra = 37.6
        * (sunset_angle * lat_rad.sin() * declination.sin()
            + lat_rad.cos() * declination.cos() * sunset_angle.sin());

    let sun_fraction = (sun_exposure_pct / 100.0).clamp(0.0, 1.0);
    let rs = (0.25 + 0.50 * sun_fraction) * ra;
    let rn = 0.77 * rs;

    let es = 0.6108 * ((17.27 * temp_mean_c) / (temp_mean_c + 237.3)).exp();
    let ea = es * (rh_pct / 100.0).clamp(0.0, 1.0);
    let vpd = (es - ea).max(0.0);

    let wind_u2 = 1.0; // no anemometer on this platform; a mild constant.
    let numerator = 0.408 * delta * rn + gamma * (900.0 / (temp_mean_c + 273.0)) * wind_u2 * vpd;
    let denominator = delta + gamma * (1.0 + 0.34 * wind_u2);

    (numerator / denominator).max(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleOutcome {
    pub channel_id: u8,
    pub calculated_l: f64,
    pub capped_l: f64,
    pub enqueued: bool,
}

/// §4.9 per-channel computation. Returns `None` if the channel is not
/// AUTO-valid or already has work pending/active.
fn compute_for_channel(
    ch: &Channel,
    env: &EnvSample,
    profile: &PlantProfile,
    now_epoch: i64,
    day_of_year: u32,
) -> Option<ScheduleOutcome> {
    if !ch.auto_valid() {
        return None;
    }

    let days_after_planting = ch.days_after_planting(now_epoch);
    let eto = reference_eto_mm_day(
        env.temp_mean_c,
        env.rh_pct,
        env.pressure_hpa,
        ch.latitude_deg as f64,
        day_of_year,
        ch.sun_exposure_pct as f64,
    );
    let kc = profile.kc_at(days_after_planting);
    let etc = kc * eto;

    let net_mm = (etc - env.rain_mm_24h).max(0.0);

    let efficiency = ch.irrigation_method.efficiency();
    let gross_mm = match ch.mode {
        WateringMode::AutoEco => net_mm * (1.0 - profile.eco_deficit_fraction) / efficiency,
        _ => net_mm / efficiency,
    };

    let calculated_l = if ch.use_area_based {
        gross_mm * ch.area_m2 as f64
    } else {
        let footprint = profile.default_plant_footprint_m2;
        gross_mm * footprint * ch.plant_count as f64
    };

    let capped_l = if ch.max_volume_limit_l > 0.0 {
        calculated_l.min(ch.max_volume_limit_l as f64)
    } else {
        calculated_l
    };

    Some(ScheduleOutcome {
        channel_id: ch.id,
        calculated_l,
        capped_l,
        enqueued: capped_l >= 1.0,
    })
}

/// Runs one scheduling pass over every channel in the store, enqueuing
/// `ByVolume` tasks where §4.9 calls for it. Skips channels with an
/// existing pending/active task for that channel.
pub fn run_once(
    store: &ChannelStore,
    queue: &mut TaskQueue,
    env: &EnvSample,
    profile_for: impl Fn(&Channel) -> PlantProfile,
    active_channel: Option<u8>,
    now_epoch: i64,
    day_of_year: u32,
    state: &StateCoordinator,
) -> Vec<ScheduleOutcome> {
    let mut outcomes = Vec::new();
    for ch in store.all() {
        if !ch.mode.is_auto() {
            continue;
        }
        if Some(ch.id) == active_channel || queue.has_pending_for(ch.id) {
            continue;
        }
        let profile = profile_for(ch);
        if let Some(outcome) = compute_for_channel(ch, env, &profile, now_epoch, day_of_year) {
            if outcome.capped_l < outcome.calculated_l {
                state.emit(SystemEvent::ConstraintApplied {
                    channel: ch.id,
                    calculated_l: outcome.calculated_l,
                    capped_l: outcome.capped_l,
                    mode: "volume_limit",
                });
            }
            if outcome.enqueued {
                let liters = outcome.capped_l.round() as u16;
                let task = Task::new(
                    ch.id,
                    Trigger::Scheduled,
                    TaskMode::ByVolume { liters },
                    now_epoch,
                );
                // Re-check channel lock at enqueue time per §5 ordering
                // guarantees — a lock set between snapshot and enqueue is
                // still honored.
                let _ = queue.enqueue(task, ch, false, now_epoch);
            }
            outcomes.push(outcome);
        }
    }
    outcomes
}

// ===========================================================================
// Tests
// ===========================================================================
