//! Recurring backup schedules.

use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::BackupType;

/// How often a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScheduleInterval {
    /// Top of every hour.
    Hourly,
    /// Every UTC midnight.
    Daily,
    /// Every Sunday at UTC midnight.
    Weekly,
    /// First day of every month at UTC midnight.
    Monthly,
    /// A cron expression. Accepted in configuration; not schedulable.
    Cron(String),
}

impl std::fmt::Display for ScheduleInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleInterval::Hourly => write!(f, "hourly"),
            ScheduleInterval::Daily => write!(f, "daily"),
            ScheduleInterval::Weekly => write!(f, "weekly"),
            ScheduleInterval::Monthly => write!(f, "monthly"),
            ScheduleInterval::Cron(expr) => write!(f, "cron:{}", expr),
        }
    }
}

/// Error returned when an interval string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid schedule interval '{0}'")]
pub struct ParseIntervalError(pub String);

impl FromStr for ScheduleInterval {
    type Err = ParseIntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some(expr) = trimmed.strip_prefix("cron:") {
            let expr = expr.trim();
            if expr.is_empty() {
                return Err(ParseIntervalError(s.to_string()));
            }
            return Ok(ScheduleInterval::Cron(expr.to_string()));
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "hourly" => Ok(ScheduleInterval::Hourly),
            "daily" => Ok(ScheduleInterval::Daily),
            "weekly" => Ok(ScheduleInterval::Weekly),
            "monthly" => Ok(ScheduleInterval::Monthly),
            _ => Err(ParseIntervalError(s.to_string())),
        }
    }
}

impl Serialize for ScheduleInterval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ScheduleInterval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A recurring backup job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Kind of backup to take.
    pub backup_type: BackupType,
    /// When to take it.
    pub interval: ScheduleInterval,
    /// Retention for backups taken by this schedule.
    pub retention_days: u32,
    /// Disabled schedules are kept but never started.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleConfig {
    /// Create an enabled schedule.
    pub fn new(backup_type: BackupType, interval: ScheduleInterval, retention_days: u32) -> Self {
        Self {
            backup_type,
            interval,
            retention_days,
            enabled: true,
        }
    }

    /// Set whether the schedule is enabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}
