//! Scheduler lifecycle and notification behavior.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use common::{RecordingNotifier, TestContext};
use strata_backup::{next_run, BackupManager, ScheduleError, Scheduler, TimerClock, FAILURE_BACKOFF};
use strata_core::{BackupStatus, BackupType, ScheduleConfig, ScheduleInterval};

fn scheduler(ctx: &TestContext, notify_on_success: bool) -> (Scheduler, Arc<RecordingNotifier>) {
    let config = ctx.config().with_notifications(notify_on_success, true);
    let notifier = Arc::new(RecordingNotifier::default());
    let scheduler = Scheduler::new(Arc::new(ctx.manager(config))).with_notifier(notifier.clone());
    (scheduler, notifier)
}

/// A scheduler whose clock starts at 2024-01-01 10:30 UTC and follows
/// runtime time.
fn timed_scheduler(ctx: &TestContext) -> (Scheduler, Arc<BackupManager>) {
    let backups = Arc::new(ctx.manager(ctx.config()));
    let clock = TimerClock::starting_at(Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap());
    let scheduler = Scheduler::new(backups.clone()).with_clock(Arc::new(clock));
    (scheduler, backups)
}

async fn count(backups: &BackupManager, backup_type: BackupType, status: BackupStatus) -> usize {
    backups
        .list_backups(Some(backup_type), None)
        .await
        .unwrap()
        .iter()
        .filter(|info| info.status == status)
        .count()
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

#[test]
fn test_timing_examples() {
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 23, 0).unwrap();
    assert_eq!(
        next_run(&ScheduleInterval::Hourly, now).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap()
    );

    let wednesday = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
    assert_eq!(
        next_run(&ScheduleInterval::Weekly, wednesday).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 7, 0, 0, 0).unwrap()
    );
}

#[test]
fn test_default_schedules() {
    let ctx = TestContext::new();
    let (scheduler, _) = scheduler(&ctx, false);
    scheduler.create_default_schedules();

    let schedules = scheduler.schedules();
    let names: Vec<_> = schedules.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["daily_full", "hourly_incremental", "weekly_full"]);
    assert_eq!(schedules["hourly_incremental"].backup_type, BackupType::Incremental);
    assert_eq!(schedules["daily_full"].retention_days, 30);
    assert_eq!(schedules["weekly_full"].retention_days, 120);
    assert_eq!(schedules["weekly_full"].interval, ScheduleInterval::Weekly);
}

#[test]
fn test_remove_unknown_schedule() {
    let ctx = TestContext::new();
    let (scheduler, _) = scheduler(&ctx, false);
    assert!(matches!(
        scheduler.remove_schedule("nightly"),
        Err(ScheduleError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_start_and_stop() {
    let ctx = TestContext::new();
    let (scheduler, notifier) = scheduler(&ctx, true);
    scheduler.create_default_schedules();
    scheduler.add_schedule(
        "paused",
        ScheduleConfig::new(BackupType::Full, ScheduleInterval::Daily, 7).with_enabled(false),
    );
    scheduler.add_schedule(
        "cron",
        ScheduleConfig::new(BackupType::Full, ScheduleInterval::Cron("0 3 * * *".into()), 7),
    );

    scheduler.start().unwrap();
    assert!(scheduler.is_running());
    assert!(matches!(scheduler.start(), Err(ScheduleError::AlreadyRunning)));

    scheduler.add_schedule(
        "monthly_full",
        ScheduleConfig::new(BackupType::Full, ScheduleInterval::Monthly, 365),
    );
    scheduler.remove_schedule("hourly_incremental").unwrap();

    scheduler.stop().await;
    assert!(!scheduler.is_running());
    assert!(ctx.tool.dumps.lock().is_empty());
    assert!(notifier.sent.lock().is_empty());

    // A stopped scheduler can be started again.
    scheduler.start().unwrap();
    scheduler.stop().await;
}

#[tokio::test]
async fn test_success_notification_follows_config() {
    let ctx = TestContext::new();
    let (scheduler, notifier) = scheduler(&ctx, false);
    scheduler.create_default_schedules();

    let info = scheduler.run_now("weekly_full").await.unwrap();
    assert_eq!(info.retention_days(), Some(120));
    assert!(notifier.sent.lock().is_empty());

    let ctx = TestContext::new();
    let (scheduler, notifier) = self::scheduler(&ctx, true);
    scheduler.create_default_schedules();
    scheduler.run_now("daily_full").await.unwrap();

    let sent = notifier.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "Backup succeeded: daily_full");
}

#[tokio::test]
async fn test_failure_notification() {
    let ctx = TestContext::new();
    let (scheduler, notifier) = scheduler(&ctx, false);
    scheduler.create_default_schedules();
    ctx.tool.fail_dump.store(true, Ordering::SeqCst);

    let err = scheduler.run_now("hourly_incremental").await.unwrap_err();
    assert!(matches!(err, ScheduleError::Backup(_)));

    let sent = notifier.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "Backup failed: hourly_incremental");
    assert!(sent[0].1.contains("connection refused"));
}

#[tokio::test(start_paused = true)]
async fn test_hourly_schedule_fires_on_the_hour() {
    let ctx = TestContext::new();
    let (scheduler, backups) = timed_scheduler(&ctx);
    scheduler.add_schedule(
        "hourly",
        ScheduleConfig::new(BackupType::Incremental, ScheduleInterval::Hourly, 7),
    );
    scheduler.start().unwrap();

    // 10:50, before the first top of the hour.
    tokio::time::sleep(minutes(20)).await;
    assert!(ctx.tool.dumps.lock().is_empty());

    // 13:50: runs at 11:00, 12:00, and 13:00.
    tokio::time::sleep(minutes(180)).await;
    scheduler.stop().await;

    assert_eq!(ctx.tool.dumps.lock().len(), 3);
    assert_eq!(count(&backups, BackupType::Incremental, BackupStatus::Completed).await, 3);
}

#[tokio::test(start_paused = true)]
async fn test_failing_schedule_does_not_block_others() {
    let ctx = TestContext::new();
    let (scheduler, backups) = timed_scheduler(&ctx);
    *ctx.tool.fail_type.lock() = Some(BackupType::Incremental);
    scheduler.add_schedule(
        "incremental",
        ScheduleConfig::new(BackupType::Incremental, ScheduleInterval::Hourly, 7),
    );
    scheduler.add_schedule(
        "full",
        ScheduleConfig::new(BackupType::Full, ScheduleInterval::Hourly, 7),
    );
    scheduler.start().unwrap();

    // 12:30: both schedules ran at 11:00 and 12:00.
    tokio::time::sleep(minutes(120)).await;
    scheduler.stop().await;

    assert_eq!(count(&backups, BackupType::Full, BackupStatus::Completed).await, 2);
    assert_eq!(count(&backups, BackupType::Incremental, BackupStatus::Failed).await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_failure_backs_off_before_next_run() {
    let ctx = TestContext::new();
    let (scheduler, _) = timed_scheduler(&ctx);
    ctx.tool.fail_dump.store(true, Ordering::SeqCst);
    // The 11:00 dump fails at 11:57; the backoff runs past 12:00.
    *ctx.tool.dump_delay.lock() = Some(minutes(57));
    assert_eq!(FAILURE_BACKOFF, minutes(5));
    scheduler.add_schedule(
        "hourly",
        ScheduleConfig::new(BackupType::Full, ScheduleInterval::Hourly, 7),
    );
    scheduler.start().unwrap();

    // 12:30: the 12:00 run was skipped.
    tokio::time::sleep(minutes(120)).await;
    assert_eq!(ctx.tool.dumps.lock().len(), 1);

    // 13:30: the schedule resumed at 13:00.
    tokio::time::sleep(minutes(60)).await;
    assert_eq!(ctx.tool.dumps.lock().len(), 2);

    scheduler.stop().await;
}
