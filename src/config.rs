use std::path::PathBuf;

use crate::model::{Ms, DAY_MS, MINUTE_MS};

/// How a day is cut into bookable slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub slot_duration_ms: Ms,
    /// Offset from midnight where the first slot starts.
    pub day_start_ms: Ms,
    /// Offset from midnight no slot may run past.
    pub day_end_ms: Ms,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            slot_duration_ms: 60 * MINUTE_MS,
            day_start_ms: 8 * 60 * MINUTE_MS,
            day_end_ms: 22 * 60 * MINUTE_MS,
        }
    }
}

impl ScheduleConfig {
    pub fn new(slot_minutes: i64, day_start: &str, day_end: &str) -> Result<Self, ConfigError> {
        if slot_minutes <= 0 {
            return Err(ConfigError::Invalid("slot duration must be positive"));
        }
        let slot_duration_ms = slot_minutes
            .checked_mul(MINUTE_MS)
            .ok_or(ConfigError::Invalid("slot duration longer than the day"))?;
        let schedule = Self {
            slot_duration_ms,
            day_start_ms: parse_time_of_day(day_start)?,
            day_end_ms: parse_time_of_day(day_end)?,
        };
        if schedule.day_start_ms >= schedule.day_end_ms {
            return Err(ConfigError::Invalid("day start must be before day end"));
        }
        if schedule.slot_duration_ms > schedule.day_end_ms - schedule.day_start_ms {
            return Err(ConfigError::Invalid("slot duration longer than the day"));
        }
        Ok(schedule)
    }
}

/// Settings injected into the engine. Nothing here is process-global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Max simultaneous active bookings per user.
    pub booking_quota: u32,
    pub schedule: ScheduleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            booking_quota: 3,
            schedule: ScheduleConfig::default(),
        }
    }
}

/// Process configuration, read once from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let slot_minutes = parse_or(&get, "SLOTBOOK_SLOT_MINUTES", 60)?;
        let day_start = get("SLOTBOOK_DAY_START").unwrap_or_else(|| "08:00".into());
        let day_end = get("SLOTBOOK_DAY_END").unwrap_or_else(|| "22:00".into());
        let schedule = ScheduleConfig::new(slot_minutes, &day_start, &day_end)?;

        Ok(Self {
            bind: get("SLOTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "SLOTBOOK_PORT", 5433)?,
            data_dir: PathBuf::from(get("SLOTBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("SLOTBOOK_PASSWORD").unwrap_or_else(|| "slotbook".into()),
            max_connections: parse_or(&get, "SLOTBOOK_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&get, "SLOTBOOK_COMPACT_THRESHOLD", 1000)?,
            tls_cert: get("SLOTBOOK_TLS_CERT"),
            tls_key: get("SLOTBOOK_TLS_KEY"),
            metrics_port: get("SLOTBOOK_METRICS_PORT")
                .map(|v| v.parse().map_err(|_| ConfigError::Parse("SLOTBOOK_METRICS_PORT", v)))
                .transpose()?,
            engine: EngineConfig {
                booking_quota: parse_or(&get, "SLOTBOOK_BOOKING_QUOTA", 3)?,
                schedule,
            },
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Parse(key, v)),
        None => Ok(default),
    }
}

/// Parse `HH:MM` into an offset from midnight.
pub fn parse_time_of_day(s: &str) -> Result<Ms, ConfigError> {
    let bad = || ConfigError::Parse("time of day", s.to_string());
    let (h, m) = s.trim().split_once(':').ok_or_else(bad)?;
    let h: i64 = h.parse().map_err(|_| bad())?;
    let m: i64 = m.parse().map_err(|_| bad())?;
    if !(0..=24).contains(&h) || !(0..60).contains(&m) {
        return Err(bad());
    }
    let offset = (h * 60 + m) * MINUTE_MS;
    if offset > DAY_MS {
        return Err(bad());
    }
    Ok(offset)
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Parse(&'static str, String),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parse(key, v) => write!(f, "invalid value for {key}: {v:?}"),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
