//! Persistence adapter (C12): an external collaborator per the purpose
//! statement, reached only through the `Store` trait so the core never
//! depends on a concrete backend. SQLite is the production implementation;
//! an in-memory backend serves tests.
//!
//! Queries use `sqlx`'s runtime-checked API (`query`/`query_as`) rather
//! than the compile-time `query!` macro family, so the crate builds
//! without a live database or a checked-query cache available at compile
//! time — see DESIGN.md.

use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};

use crate::channel::{Channel, HydraulicLock};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowCalibration {
    pub pulses_per_liter: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoCalcSettings {
    pub interval_hours: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeCounters {
    pub days_since_start: i64,
    pub tz_offset_minutes: i32,
    pub dst_rule: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHistoryRow {
    pub ts: i64,
    pub channel_id: u8,
    pub phase: String,
    pub requested_ml: Option<f64>,
    pub delivered_ml: Option<f64>,
    pub reason: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_channels(&self) -> Result<Vec<Channel>>;
    async fn save_channel(&self, channel: &Channel) -> Result<()>;

    async fn load_global_lock(&self) -> Result<Option<HydraulicLock>>;
    async fn save_global_lock(&self, lock: &HydraulicLock) -> Result<()>;

    async fn load_flow_calibration(&self) -> Result<Option<FlowCalibration>>;
    async fn save_flow_calibration(&self, cal: &FlowCalibration) -> Result<()>;

    async fn load_auto_calc_settings(&self) -> Result<Option<AutoCalcSettings>>;
    async fn save_auto_calc_settings(&self, settings: &AutoCalcSettings) -> Result<()>;

    async fn load_runtime_counters(&self) -> Result<Option<RuntimeCounters>>;
    async fn save_runtime_counters(&self, counters: &RuntimeCounters) -> Result<()>;

    async fn append_task_history(&self, row: &TaskHistoryRow) -> Result<()>;

    /// Last volume delivered on `channel_id`, if any history exists.
    /// Decision for open question #1: read from history, never fabricate.
    async fn last_volume_ml(&self, channel_id: u8) -> Result<Option<f64>>;
    async fn total_volume_ml(&self, channel_id: u8) -> Result<Option<f64>>;
}

// ---------------------------------------------------------------------------
// SQLite-backed store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    /// Atomically snapshots the database file via `VACUUM INTO`, mitigating
    /// SD-card wear from the source platform's periodic full-copy backups.
    pub async fn backup(&self, dest_path: &str) -> Result<()> {
        let escaped = dest_path.replace('\'', "''");
        sqlx::query(&format!("VACUUM INTO '{escaped}'"))
            .execute(&self.pool)
            .await
            .context("backup failed")?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("health check failed")?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_channels(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query("SELECT record_json FROM channel_config ORDER BY channel_id")
            .fetch_all(&self.pool)
            .await
            .context("load_channels failed")?;
        rows.into_iter()
            .map(|r| {
                let json: String = r.get(0);
                serde_json::from_str(&json).context("corrupt channel_config row")
            })
            .collect()
    }

    async fn save_channel(&self, channel: &Channel) -> Result<()> {
        let json = serde_json::to_string(channel).context("serialize channel failed")?;
        sqlx::query(
            "INSERT INTO channel_config (channel_id, record_json) VALUES (?, ?)
             ON CONFLICT(channel_id) DO UPDATE SET record_json = excluded.record_json",
        )
        .bind(channel.id as i64)
        .bind(json)
        .execute(&self.pool)
        .await
        .context("save_channel failed")?;
        Ok(())
    }

    async fn load_global_lock(&self) -> Result<Option<HydraulicLock>> {
        let row = sqlx::query("SELECT record_json FROM global_lock WHERE id = 0")
            .fetch_optional(&self.pool)
            .await
            .context("load_global_lock failed")?;
        row.map(|r| {
            let json: String = r.get(0);
            serde_json::from_str(&json).context("corrupt global_lock row")
        })
        .transpose()
    }

    async fn save_global_lock(&self, lock: &HydraulicLock) -> Result<()> {
        let json = serde_json::to_string(lock).context("serialize global lock failed")?;
        sqlx::query(
            "INSERT INTO global_lock (id, record_json) VALUES (0, ?)
             ON CONFLICT(id) DO UPDATE SET record_json = excluded.record_json",
        )
        .bind(json)
        .execute(&self.pool)
        .await
        .context("save_global_lock failed")?;
        Ok(())
    }

    async fn load_flow_calibration(&self) -> Result<Option<FlowCalibration>> {
        let row = sqlx::query("SELECT pulses_per_liter FROM flow_calibration WHERE id = 0")
            .fetch_optional(&self.pool)
            .await
            .context("load_flow_calibration failed")?;
        Ok(row.map(|r| FlowCalibration {
            pulses_per_liter: r.get::<i64, _>(0) as u32,
        }))
    }

    async fn save_flow_calibration(&self, cal: &FlowCalibration) -> Result<()> {
        sqlx::query(
            "INSERT INTO flow_calibration (id, pulses_per_liter) VALUES (0, ?)
             ON CONFLICT(id) DO UPDATE SET pulses_per_liter = excluded.pulses_per_liter",
        )
        .bind(cal.pulses_per_liter as i64)
        .execute(&self.pool)
        .await
        .context("save_flow_calibration failed")?;
        Ok(())
    }

    async fn load_auto_calc_settings(&self) -> Result<Option<AutoCalcSettings>> {
        let row = sqlx::query("SELECT interval_hours, enabled FROM auto_calc_settings WHERE id = 0")
            .fetch_optional(&self.pool)
            .await
            .context("load_auto_calc_settings failed")?;
        Ok(row.map(|r| AutoCalcSettings {
            interval_hours: r.get::<i64, _>(0) as u32,
            enabled: r.get::<i64, _>(1) != 0,
        }))
    }

    async fn save_auto_calc_settings(&self, settings: &AutoCalcSettings) -> Result<()> {
        sqlx::query(
            "INSERT INTO auto_calc_settings (id, interval_hours, enabled) VALUES (0, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               interval_hours = excluded.interval_hours,
               enabled = excluded.enabled",
        )
        .bind(settings.interval_hours as i64)
        .bind(settings.enabled as i64)
        .execute(&self.pool)
        .await
        .context("save_auto_calc_settings failed")?;
        Ok(())
    }

    async fn load_runtime_counters(&self) -> Result<Option<RuntimeCounters>> {
        let row = sqlx::query(
            "SELECT days_since_start, tz_offset_minutes, dst_rule FROM runtime_counters WHERE id = 0",
        )
        .fetch_optional(&self.pool)
        .await
        .context("load_runtime_counters failed")?;
        Ok(row.map(|r| RuntimeCounters {
            days_since_start: r.get(0),
            tz_offset_minutes: r.get::<i64, _>(1) as i32,
            dst_rule: r.get(2),
        }))
    }

    async fn save_runtime_counters(&self, counters: &RuntimeCounters) -> Result<()> {
        sqlx::query(
            "INSERT INTO runtime_counters (id, days_since_start, tz_offset_minutes, dst_rule)
             VALUES (0, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               days_since_start = excluded.days_since_start,
               tz_offset_minutes = excluded.tz_offset_minutes,
               dst_rule = excluded.dst_rule",
        )
        .bind(counters.days_since_start)
        .bind(counters.tz_offset_minutes as i64)
        .bind(&counters.dst_rule)
        .execute(&self.pool)
        .await
        .context("save_runtime_counters failed")?;
        Ok(())
    }

    async fn append_task_history(&self, row: &TaskHistoryRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_history (ts, channel_id, phase, requested_ml, delivered_ml, reason)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(row.ts)
        .bind(row.channel_id as i64)
        .bind(&row.phase)
        .bind(row.requested_ml)
        .bind(row.delivered_ml)
        .bind(&row.reason)
        .execute(&self.pool)
        .await
        .context("append_task_history failed")?;
        Ok(())
    }

    async fn last_volume_ml(&self, channel_id: u8) -> Result<Option<f64>> {
        let row = sqlx::query(
            "SELECT delivered_ml FROM task_history
             WHERE channel_id = ? AND phase = 'Completed' AND delivered_ml IS NOT NULL
             ORDER BY ts DESC LIMIT 1",
        )
        .bind(channel_id as i64)
        .fetch_optional(&self.pool)
        .await
        .context("last_volume_ml failed")?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn total_volume_ml(&self, channel_id: u8) -> Result<Option<f64>> {
        let row = sqlx::query(
            "SELECT SUM(delivered_ml) FROM task_history
             WHERE channel_id = ? AND phase = 'Completed'",
        )
        .bind(channel_id as i64)
        .fetch_one(&self.pool)
        .await
        .context("total_volume_ml failed")?;
        Ok(row.get(0))
    }
}

/// Extracts the working database file path from a `sqlite:` connection
/// string, or `None` for `:memory:`/in-memory URLs that have nothing to
/// back up or restore.
pub fn db_file_path(db_url: &str) -> Option<String> {
    let stripped = db_url.strip_prefix("sqlite:")?;
    if stripped.starts_with(":memory:") || stripped.is_empty() {
        return None;
    }
    let path = stripped.split('?').next().unwrap_or(stripped);
    if path.is_empty() {
        return None;
    }
    Some(path.to_string())
}

/// Restores a database backup to the working path if the working file is
/// missing or empty (e.g. a tmpfs-backed working directory after reboot).
/// Call before [`SqliteStore::connect`]. Returns `true` if a restore ran.
pub fn restore_from_backup(working_path: &str, backup_path: &str) -> Result<bool> {
    let backup = std::path::Path::new(backup_path);
    if !backup.exists() {
        return Ok(false);
    }

    let working = std::path::Path::new(working_path);
    let needs_restore =
        !working.exists() || working.metadata().map(|m| m.len() == 0).unwrap_or(true);

    if needs_restore {
        if let Some(parent) = working.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        std::fs::copy(backup, working)
            .with_context(|| format!("restore backup '{backup_path}' -> '{working_path}'"))?;
        return Ok(true);
    }
    Ok(false)
}

// ---------------------------------------------------------------------------
// In-memory store (tests, and first-boot-before-config-applied default)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    channels: Vec<Channel>,
    global_lock: Option<HydraulicLock>,
    calibration: Option<FlowCalibration>,
    auto_calc_settings: Option<AutoCalcSettings>,
    counters: Option<RuntimeCounters>,
    history: Vec<TaskHistoryRow>,
}

pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_channels(&self) -> Result<Vec<Channel>> {
        Ok(self.inner.lock().unwrap().channels.clone())
    }

    async fn save_channel(&self, channel: &Channel) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.channels.iter_mut().find(|c| c.id == channel.id) {
            *existing = channel.clone();
        } else {
            inner.channels.push(channel.clone());
        }
        Ok(())
    }

    async fn load_global_lock(&self) -> Result<Option<HydraulicLock>> {
        Ok(self.inner.lock().unwrap().global_lock.clone())
    }

    async fn save_global_lock(&self, lock: &HydraulicLock) -> Result<()> {
        self.inner.lock().unwrap().global_lock = Some(lock.clone());
        Ok(())
    }

    async fn load_flow_calibration(&self) -> Result<Option<FlowCalibration>> {
        Ok(self.inner.lock().unwrap().calibration.clone())
    }

    async fn save_flow_calibration(&self, cal: &FlowCalibration) -> Result<()> {
        self.inner.lock().unwrap().calibration = Some(cal.clone());
        Ok(())
    }

    async fn load_auto_calc_settings(&self) -> Result<Option<AutoCalcSettings>> {
        Ok(self.inner.lock().unwrap().auto_calc_settings.clone())
    }

    async fn save_auto_calc_settings(&self, settings: &AutoCalcSettings) -> Result<()> {
        self.inner.lock().unwrap().auto_calc_settings = Some(settings.clone());
        Ok(())
    }

    async fn load_runtime_counters(&self) -> Result<Option<RuntimeCounters>> {
        Ok(self.inner.lock().unwrap().counters.clone())
    }

    async fn save_runtime_counters(&self, counters: &RuntimeCounters) -> Result<()> {
        self.inner.lock().unwrap().counters = Some(counters.clone());
        Ok(())
    }

    async fn append_task_history(&self, row: &TaskHistoryRow) -> Result<()> {
        self.inner.lock().unwrap().history.push(row.clone());
        Ok(())
    }

    async fn last_volume_ml(&self, channel_id: u8) -> Result<Option<f64>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .history
            .iter()
            .rev()
            .find(|r| r.channel_id == channel_id && r.phase == "Completed" && r.delivered_ml.is_some())
            .and_then(|r| r.delivered_ml))
    }

    async fn total_volume_ml(&self, channel_id: u8) -> Result<Option<f64>> {
        let inner = self.inner.lock().unwrap();
        let rows: Vec<f64> = inner
            .history
            .iter()
            .filter(|r| r.channel_id == channel_id && r.phase == "Completed")
            .filter_map(|r| r.delivered_ml)
            .collect();
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.iter().sum())
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
