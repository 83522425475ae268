//! TOML config file loading and persistence seeding (C13).
//!
//! On first boot the persistence adapter is empty; this module reads a
//! human-edited TOML file and upserts its channel definitions into the
//! store so the controller always resolves channel configuration the same
//! way, whether it came from disk on day one or from prior runtime state.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::channel::{
    Channel, CustomPlant, IrrigationMethod, PlantCategory, RainCompensation, ScheduleEvent,
    WateringMode,
};
use crate::persistence::{AutoCalcSettings, Store};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
    #[serde(default)]
    pub system: SystemEntry,
}

#[derive(Debug, Deserialize)]
pub struct ChannelEntry {
    pub channel_id: u8,
    pub name: String,

    #[serde(default)]
    pub schedule: ScheduleEntry,
    #[serde(default)]
    pub auto_enabled: bool,
    #[serde(default)]
    pub mode: ModeEntry,
    #[serde(default)]
    pub irrigation_method: IrrigationMethodEntry,

    #[serde(default)]
    pub plant_category: PlantCategoryEntry,
    #[serde(default)]
    pub plant_variant: u16,
    pub custom_water_need_factor: Option<f32>,
    pub soil_index: Option<u8>,
    #[serde(default = "default_sun_exposure")]
    pub sun_exposure_pct: f32,
    #[serde(default)]
    pub latitude_deg: f32,
    #[serde(default)]
    pub planting_date_epoch: i64,

    #[serde(default = "default_true")]
    pub use_area_based: bool,
    #[serde(default)]
    pub area_m2: f32,
    #[serde(default)]
    pub plant_count: u32,

    #[serde(default = "default_flow")]
    pub nominal_flow_ml_min: f32,
    pub pulses_per_liter: Option<u32>,
    #[serde(default)]
    pub max_volume_limit_l: f32,

    #[serde(default)]
    pub rain_compensation: RainCompensationEntry,
}

fn default_sun_exposure() -> f32 {
    100.0
}
fn default_true() -> bool {
    true
}
fn default_flow() -> f32 {
    2000.0
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub enum ScheduleEntry {
    #[default]
    Auto,
    Daily {
        dow_mask: u8,
        start_hhmm: u16,
    },
    Periodic {
        interval_days: u16,
        start_hhmm: u16,
    },
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub enum ModeEntry {
    #[default]
    AutoQuality,
    AutoEco,
    ByDuration {
        minutes: u16,
    },
    ByVolume {
        liters: u16,
    },
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub enum IrrigationMethodEntry {
    #[default]
    Drip,
    Sprinkler,
    Surface,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub enum PlantCategoryEntry {
    Vegetable,
    Fruit,
    Flower,
    #[default]
    Lawn,
    Tree,
    Other,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RainCompensationEntry {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub sensitivity_pct: f32,
    #[serde(default)]
    pub skip_threshold_mm: f32,
    #[serde(default = "default_one")]
    pub reduction_factor: f32,
    #[serde(default = "default_lookback")]
    pub lookback_hours: u32,
}

fn default_one() -> f32 {
    1.0
}
fn default_lookback() -> u32 {
    24
}

#[derive(Debug, Deserialize)]
pub struct SystemEntry {
    #[serde(default = "default_auto_interval")]
    pub auto_calc_interval_min: u32,
    #[serde(default = "default_true")]
    pub auto_calc_enabled: bool,
    #[serde(default = "default_max_sensor_age_min")]
    pub max_sensor_age_min: u32,
}

fn default_auto_interval() -> u32 {
    60
}

fn default_max_sensor_age_min() -> u32 {
    30
}

impl Default for SystemEntry {
    fn default() -> Self {
        Self {
            auto_calc_interval_min: default_auto_interval(),
            auto_calc_enabled: true,
            max_sensor_age_min: default_max_sensor_age_min(),
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    Ok(config)
}

fn to_channel(entry: &ChannelEntry) -> Channel {
    let mut c = Channel::new(entry.channel_id, entry.name.clone());
    c.schedule = match entry.schedule {
        ScheduleEntry::Auto => ScheduleEvent::Auto { start_hhmm: 360 },
        ScheduleEntry::Daily {
            dow_mask,
            start_hhmm,
        } => ScheduleEvent::Daily {
            dow_mask,
            start_hhmm,
        },
        ScheduleEntry::Periodic {
            interval_days,
            start_hhmm,
        } => ScheduleEvent::Periodic {
            interval_days,
            start_hhmm,
            last_run_date: 0,
        },
    };
    c.auto_enabled = entry.auto_enabled;
    c.mode = match entry.mode {
        ModeEntry::AutoQuality => WateringMode::AutoQuality,
        ModeEntry::AutoEco => WateringMode::AutoEco,
        ModeEntry::ByDuration { minutes } => WateringMode::ByDuration { minutes },
        ModeEntry::ByVolume { liters } => WateringMode::ByVolume { liters },
    };
    c.irrigation_method = match entry.irrigation_method {
        IrrigationMethodEntry::Drip => IrrigationMethod::Drip,
        IrrigationMethodEntry::Sprinkler => IrrigationMethod::Sprinkler,
        IrrigationMethodEntry::Surface => IrrigationMethod::Surface,
    };
    c.plant_category = match entry.plant_category {
        PlantCategoryEntry::Vegetable => PlantCategory::Vegetable,
        PlantCategoryEntry::Fruit => PlantCategory::Fruit,
        PlantCategoryEntry::Flower => PlantCategory::Flower,
        PlantCategoryEntry::Lawn => PlantCategory::Lawn,
        PlantCategoryEntry::Tree => PlantCategory::Tree,
        PlantCategoryEntry::Other => PlantCategory::Other,
    };
    c.plant_variant = entry.plant_variant;
    c.custom_plant = entry
        .custom_water_need_factor
        .map(|f| CustomPlant { water_need_factor: f });
    c.soil_index = entry.soil_index;
    c.sun_exposure_pct = entry.sun_exposure_pct;
    c.latitude_deg = entry.latitude_deg;
    c.planting_date_epoch = entry.planting_date_epoch;
    c.use_area_based = entry.use_area_based;
    c.area_m2 = entry.area_m2;
    c.plant_count = entry.plant_count;
    c.nominal_flow_ml_min = entry.nominal_flow_ml_min;
    c.pulses_per_liter = entry.pulses_per_liter;
    c.max_volume_limit_l = entry.max_volume_limit_l;
    c.rain_compensation = RainCompensation {
        enabled: entry.rain_compensation.enabled,
        sensitivity_pct: entry.rain_compensation.sensitivity_pct,
        skip_threshold_mm: entry.rain_compensation.skip_threshold_mm,
        reduction_factor: entry.rain_compensation.reduction_factor,
        lookback_hours: entry.rain_compensation.lookback_hours,
    };
    c
}

/// Upsert all channels from the config into the store. Called once on
/// first boot (empty store) and, harmlessly, on every boot thereafter —
/// config values always win over whatever was last persisted for fields
/// the file defines.
pub async fn apply(config: &Config, store: &dyn Store) -> Result<()> {
    for entry in &config.channels {
        let channel = to_channel(entry);
        store
            .save_channel(&channel)
            .await
            .with_context(|| format!("failed to upsert channel {}", entry.channel_id))?;
    }
    store
        .save_auto_calc_settings(&auto_calc_settings(config))
        .await
        .context("failed to persist system.auto_calc settings")?;
    tracing::info!(channels = config.channels.len(), "config applied");
    Ok(())
}

/// Converts the file's `auto_calc_interval_min` (config-file unit) into the
/// runtime's `interval_hours` (controller/API unit, §6:
/// `auto_calc_set_interval(hours∈1..24)`), clamping into range rather than
/// silently truncating a too-small or too-large minutes value to zero.
fn auto_calc_settings(config: &Config) -> AutoCalcSettings {
    let hours = (config.system.auto_calc_interval_min / 60).clamp(1, 24);
    AutoCalcSettings {
        interval_hours: hours,
        enabled: config.system.auto_calc_enabled,
    }
}

/// Max sensor reading age, in seconds, before the environment reader
/// invalidates a field regardless of whether it's in range (§4.10).
pub fn max_sensor_age_secs(config: &Config) -> i64 {
    config.system.max_sensor_age_min as i64 * 60
}

// ===========================================================================
// Tests
// ===========================================================================
