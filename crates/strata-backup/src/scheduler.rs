//! Backup scheduler.
//!
//! Every enabled schedule runs in its own tokio task: compute the next run,
//! sleep until then, take the backup, repeat. A separate task runs the
//! retention cleanup once a day. Tasks observe cancellation only while
//! sleeping, so [`Scheduler::stop`] lets in-flight backups finish.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Timelike, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use strata_core::model::{BackupInfo, BackupType, ScheduleConfig, ScheduleInterval};

use crate::backup::BackupManager;
use crate::error::{BackupError, ScheduleError};
use crate::notify::{LogNotifier, Notifier};

/// Pause after a failed scheduled backup before the schedule resumes.
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Next firing time of `interval` strictly after `now`, in UTC.
pub fn next_run(interval: &ScheduleInterval, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    let today = now.date_naive();
    let midnight = |date: NaiveDate| date.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
    let invalid = || ScheduleError::UnsupportedInterval(interval.to_string());

    match interval {
        ScheduleInterval::Hourly => {
            let hour = today.and_hms_opt(now.hour(), 0, 0).ok_or_else(invalid)?.and_utc();
            Ok(hour + ChronoDuration::hours(1))
        }
        ScheduleInterval::Daily => midnight(today.succ_opt().ok_or_else(invalid)?).ok_or_else(invalid),
        ScheduleInterval::Weekly => {
            let days = match now.weekday().num_days_from_sunday() {
                0 => 7,
                n => 7 - n,
            };
            midnight(today + ChronoDuration::days(i64::from(days))).ok_or_else(invalid)
        }
        ScheduleInterval::Monthly => {
            let (year, month) = if now.month() == 12 {
                (now.year() + 1, 1)
            } else {
                (now.year(), now.month() + 1)
            };
            midnight(NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?).ok_or_else(invalid)
        }
        ScheduleInterval::Cron(_) => Err(invalid()),
    }
}

/// Source of UTC time for computing run times.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Starts at a fixed UTC time and advances with the tokio timer, so it
/// follows paused and advanced runtime time.
#[derive(Debug, Clone, Copy)]
pub struct TimerClock {
    anchor: DateTime<Utc>,
    started: Instant,
}

impl TimerClock {
    pub fn starting_at(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            started: Instant::now(),
        }
    }
}

impl Clock for TimerClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed =
            ChronoDuration::from_std(self.started.elapsed()).unwrap_or_else(|_| ChronoDuration::zero());
        self.anchor.checked_add_signed(elapsed).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Sleep for `duration`. Returns `false` when cancelled first.
async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Sleep until `clock` reads `at` or later. Returns `false` when cancelled.
async fn sleep_until(clock: &dyn Clock, at: DateTime<Utc>, token: &CancellationToken) -> bool {
    loop {
        let remaining = (at - clock.now()).to_std().unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            return true;
        }
        if !sleep_or_cancel(remaining, token).await {
            return false;
        }
    }
}

/// State shared by scheduler tasks.
#[derive(Clone)]
struct TaskContext {
    backups: Arc<BackupManager>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl TaskContext {
    /// Take one scheduled backup and send the configured notification.
    async fn fire(&self, name: &str, schedule: &ScheduleConfig) -> Result<BackupInfo, BackupError> {
        let config = self.backups.config();
        let result = self
            .backups
            .create_backup_with_retention(schedule.backup_type, Some(schedule.retention_days))
            .await;

        match &result {
            Ok(info) => {
                info!(schedule = name, backup_id = %info.backup_id, "scheduled backup completed");
                if config.notify_on_success {
                    let subject = format!("Backup succeeded: {}", name);
                    let message = format!(
                        "{} backup {} completed ({} bytes)",
                        info.backup_type, info.backup_id, info.size_bytes
                    );
                    self.notifier.notify(&subject, &message).await;
                }
            }
            Err(e) => {
                error!(schedule = name, error = %e, "scheduled backup failed");
                if config.notify_on_failure {
                    let subject = format!("Backup failed: {}", name);
                    self.notifier.notify(&subject, &e.to_string()).await;
                }
            }
        }
        result
    }

    async fn run_schedule(self, name: String, schedule: ScheduleConfig, token: CancellationToken) {
        loop {
            let next = match next_run(&schedule.interval, self.clock.now()) {
                Ok(next) => next,
                Err(e) => {
                    error!(schedule = %name, error = %e, "schedule stopped");
                    return;
                }
            };
            debug!(schedule = %name, next_run = %next, "waiting for next run");
            if !sleep_until(self.clock.as_ref(), next, &token).await {
                break;
            }

            if self.fire(&name, &schedule).await.is_err() && !sleep_or_cancel(FAILURE_BACKOFF, &token).await {
                break;
            }
        }
        debug!(schedule = %name, "schedule task stopped");
    }

    async fn run_cleanup(self, token: CancellationToken) {
        loop {
            let next = match next_run(&ScheduleInterval::Daily, self.clock.now()) {
                Ok(next) => next,
                Err(e) => {
                    error!(error = %e, "cleanup task stopped");
                    return;
                }
            };
            if !sleep_until(self.clock.as_ref(), next, &token).await {
                break;
            }
            match self.backups.cleanup_old_backups().await {
                Ok(deleted) => info!(deleted, "scheduled cleanup finished"),
                Err(e) => error!(error = %e, "scheduled cleanup failed"),
            }
        }
        debug!("cleanup task stopped");
    }
}

struct Task {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Running {
    root: CancellationToken,
    tasks: BTreeMap<String, Task>,
    cleanup: Option<Task>,
    /// Tasks of removed or replaced schedules that may still be finishing.
    retired: Vec<JoinHandle<()>>,
}

impl Running {
    fn retire(&mut self, task: Task) {
        task.token.cancel();
        self.retired.retain(|handle| !handle.is_finished());
        self.retired.push(task.handle);
    }
}

/// Runs named backup schedules and the daily cleanup.
pub struct Scheduler {
    context: TaskContext,
    schedules: Mutex<BTreeMap<String, ScheduleConfig>>,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    /// Create a scheduler that logs notifications.
    pub fn new(backups: Arc<BackupManager>) -> Self {
        let notifier = Arc::new(LogNotifier::new(backups.config().notification_target.clone()));
        Self {
            context: TaskContext {
                backups,
                notifier,
                clock: Arc::new(SystemClock),
            },
            schedules: Mutex::new(BTreeMap::new()),
            running: Mutex::new(None),
        }
    }

    /// Send notifications through `notifier`.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.context.notifier = notifier;
        self
    }

    /// Read run times from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.context.clock = clock;
        self
    }

    /// Add or replace a schedule. While running, the schedule starts at once.
    pub fn add_schedule(&self, name: impl Into<String>, config: ScheduleConfig) {
        let name = name.into();
        info!(schedule = %name, interval = %config.interval, backup_type = %config.backup_type, "adding schedule");
        self.schedules.lock().insert(name.clone(), config.clone());

        let mut running = self.running.lock();
        if let Some(running) = running.as_mut() {
            if let Some(old) = running.tasks.remove(&name) {
                running.retire(old);
            }
            if let Some(task) = self.spawn_schedule(&running.root, &name, &config) {
                running.tasks.insert(name, task);
            }
        }
    }

    /// Remove a schedule. A running task stops at its next wait.
    pub fn remove_schedule(&self, name: &str) -> Result<ScheduleConfig, ScheduleError> {
        let removed = self
            .schedules
            .lock()
            .remove(name)
            .ok_or_else(|| ScheduleError::NotFound(name.to_string()))?;

        if let Some(running) = self.running.lock().as_mut() {
            if let Some(task) = running.tasks.remove(name) {
                running.retire(task);
            }
        }
        info!(schedule = name, "removed schedule");
        Ok(removed)
    }

    /// Snapshot of the configured schedules.
    pub fn schedules(&self) -> BTreeMap<String, ScheduleConfig> {
        self.schedules.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    fn spawn_schedule(&self, root: &CancellationToken, name: &str, config: &ScheduleConfig) -> Option<Task> {
        if !config.enabled {
            debug!(schedule = name, "schedule disabled");
            return None;
        }
        if let Err(e) = next_run(&config.interval, self.context.clock.now()) {
            warn!(schedule = name, error = %e, "schedule cannot run");
            return None;
        }

        let token = root.child_token();
        let handle = tokio::spawn(self.context.clone().run_schedule(
            name.to_string(),
            config.clone(),
            token.clone(),
        ));
        Some(Task { token, handle })
    }

    /// Start one task per enabled schedule and the cleanup task.
    pub fn start(&self) -> Result<(), ScheduleError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(ScheduleError::AlreadyRunning);
        }

        let mut state = Running::default();
        for (name, config) in self.schedules.lock().iter() {
            if let Some(task) = self.spawn_schedule(&state.root, name, config) {
                state.tasks.insert(name.clone(), task);
            }
        }

        let token = state.root.child_token();
        let handle = tokio::spawn(self.context.clone().run_cleanup(token.clone()));
        state.cleanup = Some(Task { token, handle });

        info!(tasks = state.tasks.len(), "scheduler started");
        *running = Some(state);
        Ok(())
    }

    /// Cancel all waits and wait for every task to finish.
    pub async fn stop(&self) {
        let Some(state) = self.running.lock().take() else {
            return;
        };
        state.root.cancel();

        let handles = state
            .tasks
            .into_values()
            .chain(state.cleanup)
            .map(|task| task.handle)
            .chain(state.retired);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler task ended abnormally");
            }
        }
        info!("scheduler stopped");
    }

    /// Register the standard schedules: daily full, hourly incremental, and
    /// weekly full backups kept four times as long.
    pub fn create_default_schedules(&self) {
        let retention = self.context.backups.config().retention_days;
        self.add_schedule(
            "daily_full",
            ScheduleConfig::new(BackupType::Full, ScheduleInterval::Daily, retention),
        );
        self.add_schedule(
            "hourly_incremental",
            ScheduleConfig::new(BackupType::Incremental, ScheduleInterval::Hourly, retention),
        );
        self.add_schedule(
            "weekly_full",
            ScheduleConfig::new(BackupType::Full, ScheduleInterval::Weekly, retention.saturating_mul(4)),
        );
    }

    /// Run one schedule immediately, outside its timer.
    pub async fn run_now(&self, name: &str) -> Result<BackupInfo, ScheduleError> {
        let schedule = self
            .schedules
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ScheduleError::NotFound(name.to_string()))?;
        Ok(self.context.fire(name, &schedule).await?)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("schedules", &self.schedules.lock().len())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use crate::tool::{DumpRequest, RestoreRequest, SnapshotTool};
    use chrono::TimeZone;
    use std::path::Path;

    struct NoopTool;

    #[async_trait::async_trait]
    impl SnapshotTool for NoopTool {
        async fn dump(&self, _request: &DumpRequest) -> Result<(), ToolError> {
            Ok(())
        }

        async fn restore(&self, _request: &RestoreRequest) -> Result<(), ToolError> {
            Ok(())
        }

        async fn list_contents(&self, _artifact: &Path) -> Result<Vec<String>, ToolError> {
            Ok(Vec::new())
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_next_run_hourly() {
        assert_eq!(
            next_run(&ScheduleInterval::Hourly, at(2024, 1, 1, 10, 23)).unwrap(),
            at(2024, 1, 1, 11, 0)
        );
        assert_eq!(
            next_run(&ScheduleInterval::Hourly, at(2024, 1, 1, 23, 0)).unwrap(),
            at(2024, 1, 2, 0, 0)
        );
    }

    #[test]
    fn test_next_run_daily() {
        assert_eq!(
            next_run(&ScheduleInterval::Daily, at(2024, 2, 28, 0, 0)).unwrap(),
            at(2024, 2, 29, 0, 0)
        );
    }

    #[test]
    fn test_next_run_weekly() {
        // 2024-01-03 is a Wednesday.
        assert_eq!(
            next_run(&ScheduleInterval::Weekly, at(2024, 1, 3, 12, 0)).unwrap(),
            at(2024, 1, 7, 0, 0)
        );
        // Sunday itself rolls over to the following Sunday.
        assert_eq!(
            next_run(&ScheduleInterval::Weekly, at(2024, 1, 7, 0, 0)).unwrap(),
            at(2024, 1, 14, 0, 0)
        );
        assert_eq!(
            next_run(&ScheduleInterval::Weekly, at(2024, 1, 6, 23, 59)).unwrap(),
            at(2024, 1, 7, 0, 0)
        );
    }

    #[test]
    fn test_next_run_monthly() {
        assert_eq!(
            next_run(&ScheduleInterval::Monthly, at(2024, 1, 31, 8, 0)).unwrap(),
            at(2024, 2, 1, 0, 0)
        );
        assert_eq!(
            next_run(&ScheduleInterval::Monthly, at(2024, 12, 1, 0, 0)).unwrap(),
            at(2025, 1, 1, 0, 0)
        );
    }

    #[test]
    fn test_cron_is_unsupported() {
        let cron = ScheduleInterval::Cron("0 3 * * *".to_string());
        assert!(matches!(
            next_run(&cron, at(2024, 1, 1, 0, 0)),
            Err(ScheduleError::UnsupportedInterval(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_clock_follows_runtime_time() {
        let clock = TimerClock::starting_at(at(2024, 1, 1, 10, 30));
        tokio::time::advance(Duration::from_secs(90 * 60)).await;
        assert_eq!(clock.now(), at(2024, 1, 1, 12, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_until_reaches_target() {
        let clock = TimerClock::starting_at(at(2024, 1, 1, 10, 23));
        let token = CancellationToken::new();
        assert!(sleep_until(&clock, at(2024, 1, 1, 11, 0), &token).await);
        let overshoot = clock.now() - at(2024, 1, 1, 11, 0);
        assert!(overshoot >= ChronoDuration::zero() && overshoot < ChronoDuration::seconds(1));

        // A target in the past returns at once.
        assert!(sleep_until(&clock, at(2024, 1, 1, 9, 0), &token).await);

        token.cancel();
        assert!(!sleep_until(&clock, at(2024, 1, 1, 12, 0), &token).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_tasks_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let backups = BackupManager::new(
            strata_core::BackupConfig::new(dir.path().join("backups")),
            strata_core::ConnectionParams::new("localhost", 5432, "app", "shop"),
            Arc::new(NoopTool),
        )
        .unwrap();
        let scheduler = Scheduler::new(Arc::new(backups));
        scheduler.start().unwrap();

        for _ in 0..10 {
            scheduler.add_schedule(
                "nightly",
                ScheduleConfig::new(BackupType::Full, ScheduleInterval::Daily, 7),
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let retired = scheduler.running.lock().as_ref().map(|r| r.retired.len());
        assert_eq!(retired, Some(1));

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_or_cancel() {
        let token = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_secs(3600), &token).await);

        token.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(3600), &token).await);
    }
}
