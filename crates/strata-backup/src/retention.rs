//! Retention policy: which backups a cleanup pass deletes.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};

use strata_core::model::{BackupInfo, BackupType};
use strata_core::BackupConfig;

/// Retention knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Backups younger than this are always kept.
    pub retention_days: u32,
    /// Expired backups: keep the newest per type for this many recent weeks.
    pub keep_weekly: u32,
    /// Expired backups: keep the newest per type for this many recent months.
    pub keep_monthly: u32,
}

impl RetentionPolicy {
    pub fn new(retention_days: u32) -> Self {
        Self {
            retention_days,
            keep_weekly: 0,
            keep_monthly: 0,
        }
    }

    pub fn with_keep_weekly(mut self, weeks: u32) -> Self {
        self.keep_weekly = weeks;
        self
    }

    pub fn with_keep_monthly(mut self, months: u32) -> Self {
        self.keep_monthly = months;
        self
    }

    /// Instant before which `backup` is expired. A per-backup retention
    /// override takes precedence over the policy window.
    pub fn cutoff(&self, backup: &BackupInfo, now: DateTime<Utc>) -> DateTime<Utc> {
        let days = backup.retention_days().unwrap_or(self.retention_days);
        now - Duration::days(i64::from(days))
    }

    /// Select the backups to delete.
    ///
    /// 1. Non-terminal and unexpired backups are kept.
    /// 2. Expired backups are grouped by type and UTC day; only the newest of
    ///    each day survives.
    /// 3. A survivor is kept when it is the newest of its type in one of the
    ///    `keep_weekly` most recent ISO weeks, or one of the `keep_monthly`
    ///    most recent months, that hold expired backups of that type.
    ///
    /// Everything else is returned, newest first.
    pub fn select_expired<'a>(&self, backups: &'a [BackupInfo], now: DateTime<Utc>) -> Vec<&'a BackupInfo> {
        let mut expired: Vec<&BackupInfo> = backups
            .iter()
            .filter(|b| b.is_terminal() && b.started_at <= self.cutoff(b, now))
            .collect();
        expired.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.backup_id.cmp(&b.backup_id)));

        let mut delete: Vec<&BackupInfo> = Vec::new();
        let mut seen_days: HashSet<(BackupType, NaiveDate)> = HashSet::new();
        let mut survivors: BTreeMap<BackupType, Vec<&BackupInfo>> = BTreeMap::new();
        for backup in expired {
            if seen_days.insert((backup.backup_type, backup.started_at.date_naive())) {
                survivors.entry(backup.backup_type).or_default().push(backup);
            } else {
                delete.push(backup);
            }
        }

        for of_type in survivors.values() {
            let mut keep: BTreeSet<&str> = BTreeSet::new();
            keep.extend(newest_per_period(of_type, self.keep_weekly, |b| {
                let week = b.started_at.iso_week();
                (week.year(), week.week())
            }));
            keep.extend(newest_per_period(of_type, self.keep_monthly, |b| {
                (b.started_at.year(), b.started_at.month())
            }));

            delete.extend(
                of_type
                    .iter()
                    .copied()
                    .filter(|b| !keep.contains(b.backup_id.as_str())),
            );
        }

        delete.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        delete
    }
}

impl From<&BackupConfig> for RetentionPolicy {
    fn from(config: &BackupConfig) -> Self {
        Self {
            retention_days: config.retention_days,
            keep_weekly: config.keep_weekly,
            keep_monthly: config.keep_monthly,
        }
    }
}

/// Ids of the newest backup in each of the `periods` most recent periods.
///
/// `sorted` must be ordered newest first.
fn newest_per_period<'a, K, F>(sorted: &[&'a BackupInfo], periods: u32, period_of: F) -> Vec<&'a str>
where
    K: Eq,
    F: Fn(&BackupInfo) -> K,
{
    let mut kept = Vec::new();
    let mut last: Option<K> = None;
    for &backup in sorted {
        if kept.len() >= periods as usize {
            break;
        }
        let period = period_of(backup);
        if last.as_ref() != Some(&period) {
            kept.push(backup.backup_id.as_str());
            last = Some(period);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use strata_core::model::BackupStatus;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap()
    }

    fn completed(id: &str, backup_type: BackupType, started_at: DateTime<Utc>) -> BackupInfo {
        let mut info = BackupInfo::in_progress(id, backup_type, format!("/b/{}.dump", id), started_at);
        info.complete(1, "c", started_at);
        info
    }

    fn ids(selected: Vec<&BackupInfo>) -> Vec<&str> {
        selected.into_iter().map(|b| b.backup_id.as_str()).collect()
    }

    #[test]
    fn test_old_backup_deleted_recent_kept() {
        let backups = vec![
            completed("old", BackupType::Full, now() - Duration::days(10)),
            completed("new", BackupType::Full, now() - Duration::days(1)),
        ];
        let policy = RetentionPolicy::new(7);
        assert_eq!(ids(policy.select_expired(&backups, now())), vec!["old"]);
    }

    #[test]
    fn test_in_progress_never_deleted() {
        let running = BackupInfo::in_progress("running", BackupType::Full, "/b/r.dump", now() - Duration::days(40));
        assert_eq!(running.status, BackupStatus::InProgress);
        let policy = RetentionPolicy::new(7);
        assert!(policy.select_expired(&[running], now()).is_empty());
    }

    #[test]
    fn test_one_per_day_then_weekly() {
        let day = |d: i64, h: i64| now() - Duration::days(d) + Duration::hours(h);
        let backups = vec![
            // 2024-03-10 (week 10): two backups, the later one survives the day pass.
            completed("w10-early", BackupType::Full, day(10, -6)),
            completed("w10-late", BackupType::Full, day(10, 0)),
            // 2024-03-04 (week 10 as well): older day in the same week.
            completed("w10-monday", BackupType::Full, day(16, 0)),
            // 2024-02-28 (week 9).
            completed("w9", BackupType::Full, day(21, 0)),
            // 2024-02-14 (week 7).
            completed("w7", BackupType::Full, day(35, 0)),
        ];

        let policy = RetentionPolicy::new(7).with_keep_weekly(2);
        let deleted = ids(policy.select_expired(&backups, now()));

        assert!(deleted.contains(&"w10-early"));
        assert!(deleted.contains(&"w10-monday"));
        assert!(deleted.contains(&"w7"));
        assert!(!deleted.contains(&"w10-late"));
        assert!(!deleted.contains(&"w9"));
        assert_eq!(deleted.len(), 3);
    }

    #[test]
    fn test_monthly_keeps_newest_per_month() {
        let backups = vec![
            completed("feb", BackupType::Full, Utc.with_ymd_and_hms(2024, 2, 20, 0, 0, 0).unwrap()),
            completed("feb-early", BackupType::Full, Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap()),
            completed("jan", BackupType::Full, Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()),
            completed("dec", BackupType::Full, Utc.with_ymd_and_hms(2023, 12, 15, 0, 0, 0).unwrap()),
        ];
        let policy = RetentionPolicy::new(7).with_keep_monthly(2);
        let deleted = ids(policy.select_expired(&backups, now()));
        assert_eq!(deleted, vec!["feb-early", "dec"]);
    }

    #[test]
    fn test_types_are_independent() {
        let at = now() - Duration::days(20);
        let backups = vec![
            completed("full", BackupType::Full, at),
            completed("incr", BackupType::Incremental, at),
        ];
        let policy = RetentionPolicy::new(7).with_keep_weekly(1);
        assert!(policy.select_expired(&backups, now()).is_empty());
    }

    #[test]
    fn test_per_backup_retention_override() {
        let mut weekly = completed("weekly", BackupType::Full, now() - Duration::days(10));
        weekly
            .metadata
            .insert(BackupInfo::RETENTION_KEY.to_string(), "28".to_string());
        let daily = completed("daily", BackupType::Full, now() - Duration::days(11));

        let policy = RetentionPolicy::new(7);
        assert_eq!(ids(policy.select_expired(&[weekly, daily], now())), vec!["daily"]);
    }

    #[test]
    fn test_failed_backups_expire_too() {
        let mut failed = BackupInfo::in_progress("failed", BackupType::Full, "/b/f.dump", now() - Duration::days(9));
        failed.fail("boom", now() - Duration::days(9));
        let policy = RetentionPolicy::new(7);
        assert_eq!(ids(policy.select_expired(&[failed], now())), vec!["failed"]);
    }
}
