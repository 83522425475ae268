//! Channel store (C3): the eight irrigation zones and their configuration.
//!
//! Mutation discipline (the single "system mutex") is enforced by the
//! caller — `Controller` wraps a `ChannelStore` in the same lock that
//! guards the queue, locks, and state. This module only holds the data and
//! the pure predicates over it.

use serde::{Deserialize, Serialize};

pub const NUM_CHANNELS: usize = 8;
pub const MAX_NAME_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockLevel {
    None,
    Soft,
    Hard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockReason {
    NoFlow,
    UnexpectedFlow,
    Manual,
    Operator,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HydraulicLock {
    pub level: LockLevel,
    pub reason: Option<LockReason>,
    pub locked_at_epoch: i64,
    pub retry_after_epoch: i64,
}

impl HydraulicLock {
    pub fn none() -> Self {
        Self {
            level: LockLevel::None,
            reason: None,
            locked_at_epoch: 0,
            retry_after_epoch: 0,
        }
    }

    pub fn is_blocking(&self, now: i64) -> bool {
        match self.level {
            LockLevel::None => false,
            LockLevel::Hard => true,
            LockLevel::Soft => now < self.retry_after_epoch,
        }
    }
}

impl Default for HydraulicLock {
    fn default() -> Self {
        Self::none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlantCategory {
    Vegetable,
    Fruit,
    Flower,
    Lawn,
    Tree,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CustomPlant {
    pub water_need_factor: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleEvent {
    Daily {
        dow_mask: u8,
        start_hhmm: u16,
    },
    Periodic {
        interval_days: u16,
        start_hhmm: u16,
        last_run_date: i64,
    },
    Auto {
        start_hhmm: u16,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WateringMode {
    ByDuration { minutes: u16 },
    ByVolume { liters: u16 },
    AutoQuality,
    AutoEco,
}

impl WateringMode {
    pub fn is_auto(&self) -> bool {
        matches!(self, WateringMode::AutoQuality | WateringMode::AutoEco)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RainCompensation {
    pub enabled: bool,
    pub sensitivity_pct: f32,
    pub skip_threshold_mm: f32,
    pub reduction_factor: f32,
    pub lookback_hours: u32,
}

impl Default for RainCompensation {
    fn default() -> Self {
        Self {
            enabled: false,
            sensitivity_pct: 0.0,
            skip_threshold_mm: 0.0,
            reduction_factor: 0.0,
            lookback_hours: 24,
        }
    }
}

/// Delivery method, used by the auto scheduler to derate gross application
/// depth by a typical application efficiency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrrigationMethod {
    Drip,
    Sprinkler,
    Surface,
}

impl IrrigationMethod {
    pub fn efficiency(&self) -> f64 {
        match self {
            IrrigationMethod::Drip => 0.9,
            IrrigationMethod::Sprinkler => 0.75,
            IrrigationMethod::Surface => 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: u8,
    pub name: String,

    pub schedule: ScheduleEvent,
    pub auto_enabled: bool,
    pub mode: WateringMode,
    pub irrigation_method: IrrigationMethod,

    pub plant_category: PlantCategory,
    pub plant_variant: u16,
    pub custom_plant: Option<CustomPlant>,
    pub soil_index: Option<u8>,
    pub sun_exposure_pct: f32,
    pub latitude_deg: f32,
    pub planting_date_epoch: i64,

    pub use_area_based: bool,
    pub area_m2: f32,
    pub plant_count: u32,

    pub nominal_flow_ml_min: f32,
    pub pulses_per_liter: Option<u32>,
    pub max_volume_limit_l: f32,

    pub rain_compensation: RainCompensation,

    pub last_watering_epoch: i64,
    pub error_count: u32,

    pub lock: HydraulicLock,
}

impl Channel {
    pub fn new(id: u8, name: impl Into<String>) -> Self {
        let mut name = name.into();
        name.truncate(MAX_NAME_LEN);
        Self {
            id,
            name,
            schedule: ScheduleEvent::Auto { start_hhmm: 600 },
            auto_enabled: false,
            mode: WateringMode::ByDuration { minutes: 10 },
            irrigation_method: IrrigationMethod::Drip,
            plant_category: PlantCategory::Lawn,
            plant_variant: 0,
            custom_plant: None,
            soil_index: None,
            sun_exposure_pct: 100.0,
            latitude_deg: 0.0,
            planting_date_epoch: 0,
            use_area_based: true,
            area_m2: 0.0,
            plant_count: 0,
            nominal_flow_ml_min: 2000.0,
            pulses_per_liter: None,
            max_volume_limit_l: 0.0,
            rain_compensation: RainCompensation::default(),
            last_watering_epoch: 0,
            error_count: 0,
            lock: HydraulicLock::none(),
        }
    }

    pub fn days_after_planting(&self, now_epoch: i64) -> i64 {
        if self.planting_date_epoch <= 0 {
            return 0;
        }
        ((now_epoch - self.planting_date_epoch) / 86_400).max(0)
    }

    /// §3 invariant: coverage is well-formed for exactly one of the two modes.
    pub fn coverage_valid(&self) -> bool {
        if self.use_area_based {
            self.area_m2 > 0.0
        } else {
            self.plant_count > 0
        }
    }

    /// §3 invariant for custom plants.
    pub fn custom_plant_valid(&self) -> bool {
        if self.plant_category != PlantCategory::Other {
            return true;
        }
        self.custom_plant
            .map(|p| (0.1..=5.0).contains(&p.water_need_factor))
            .unwrap_or(false)
    }

    /// §3/§4.9: a channel in AUTO mode is accepted for execution only if
    /// plant resolvable, soil set, planting date set, and coverage configured.
    pub fn auto_valid(&self) -> bool {
        self.mode.is_auto()
            && self.auto_enabled
            && self.soil_index.is_some()
            && self.planting_date_epoch != 0
            && self.coverage_valid()
            && self.custom_plant_valid()
    }
}

/// The eight channel records, indexed by id.
pub struct ChannelStore {
    channels: [Channel; NUM_CHANNELS],
}

impl ChannelStore {
    pub fn new() -> Self {
        let channels = std::array::from_fn(|i| Channel::new(i as u8, format!("Zone {}", i + 1)));
        Self { channels }
    }

    pub fn get(&self, id: u8) -> Option<&Channel> {
        self.channels.get(id as usize)
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut Channel> {
        self.channels.get_mut(id as usize)
    }

    pub fn set(&mut self, id: u8, channel: Channel) -> bool {
        match self.channels.get_mut(id as usize) {
            Some(slot) => {
                *slot = channel;
                true
            }
            None => false,
        }
    }

    pub fn all(&self) -> &[Channel; NUM_CHANNELS] {
        &self.channels
    }

    pub fn all_mut(&mut self) -> &mut [Channel; NUM_CHANNELS] {
        &mut self.channels
    }
}

impl Default for ChannelStore {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
