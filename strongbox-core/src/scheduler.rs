/*!
Calendar-driven scheduling of automatic backups.

Backups fire at 02:00 local time: every day, every Sunday or on the first of
each month depending on [`Frequency`]. The scheduler follows configuration
changes published by the [`BackupManager`] and re-arms its timer without a
restart. Stopping only interrupts the wait between runs; a backup that has
already started is allowed to finish.
*/

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, Local, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backup::BackupManager;
use crate::config::{BackupConfig, Frequency};
use crate::record::BackupOrigin;

/// Hour of the day (local time) at which scheduled backups fire
pub const SCHEDULE_HOUR: u32 = 2;

/// Longest single sleep; the wall clock is re-checked after each one
const MAX_SLEEP: Duration = Duration::from_secs(15 * 60);

/// First scheduled instant strictly after `now` for `frequency`
pub fn next_run_after<Tz: TimeZone>(frequency: Frequency, now: &DateTime<Tz>) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();

    let mut date = match frequency {
        Frequency::Daily => today,
        Frequency::Weekly => {
            let days_to_sunday = (7 - today.weekday().num_days_from_sunday()) % 7;
            today + Days::new(u64::from(days_to_sunday))
        }
        Frequency::Monthly => today.with_day(1).unwrap_or(today),
    };

    loop {
        let candidate = resolve_local(&tz, date.and_time(schedule_time()));
        if candidate > *now {
            return candidate;
        }
        date = advance(frequency, date);
    }
}

fn schedule_time() -> NaiveTime {
    NaiveTime::from_hms_opt(SCHEDULE_HOUR, 0, 0).unwrap_or(NaiveTime::MIN)
}

fn advance(frequency: Frequency, date: NaiveDate) -> NaiveDate {
    match frequency {
        Frequency::Daily => date + Days::new(1),
        Frequency::Weekly => date + Days::new(7),
        Frequency::Monthly => date
            .checked_add_months(Months::new(1))
            .unwrap_or(date + Days::new(31)),
    }
}

/// Map a local wall-clock time to an instant, moving past DST gaps
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    let mut probe = naive;
    for _ in 0..4 {
        if let Some(resolved) = tz.from_local_datetime(&probe).earliest() {
            return resolved;
        }
        probe += chrono::Duration::minutes(30);
    }
    tz.from_utc_datetime(&naive)
}

/// Background task that fires scheduled backups
///
/// # Example
/// ```rust,no_run
/// use strongbox_core::{BackupConfig, BackupManager, BackupScheduler, StoreConfig};
///
/// # async fn run() -> strongbox_core::Result<()> {
/// let manager = BackupManager::open(BackupConfig::default(), &StoreConfig::from_env()?)?;
/// let mut scheduler = BackupScheduler::start(manager);
/// // ...
/// scheduler.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct BackupScheduler {
    handle: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    next_wake: watch::Receiver<Option<DateTime<Local>>>,
}

impl BackupScheduler {
    /// Spawn the scheduling loop on the current tokio runtime
    pub fn start(manager: Arc<BackupManager>) -> Self {
        let (wake_tx, next_wake) = watch::channel(None);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let config_rx = manager.subscribe_config();
        let handle = tokio::spawn(run_schedule(manager, config_rx, shutdown_rx, wake_tx));

        info!("Backup scheduler started");
        Self {
            handle: Some(handle),
            shutdown,
            next_wake,
        }
    }

    /// Receiver of the currently armed wake-up time
    pub fn next_wake(&self) -> watch::Receiver<Option<DateTime<Local>>> {
        self.next_wake.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the scheduling loop
    ///
    /// Waits for a backup that is already running to finish and be recorded.
    pub async fn stop(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(()) => info!("Backup scheduler stopped"),
                Err(e) => error!("Backup scheduler task failed: {}", e),
            }
        }
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn run_schedule(
    manager: Arc<BackupManager>,
    mut config_rx: watch::Receiver<BackupConfig>,
    mut shutdown: watch::Receiver<bool>,
    wake_tx: watch::Sender<Option<DateTime<Local>>>,
) {
    'arm: loop {
        if *shutdown.borrow() {
            return;
        }
        let frequency = config_rx.borrow_and_update().frequency;
        let next = next_run_after(frequency, &Local::now());
        wake_tx.send_replace(Some(next));
        info!("Next {} backup scheduled at {}", frequency, next);

        loop {
            let remaining = (next - Local::now()).to_std().unwrap_or_default();
            if remaining.is_zero() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(remaining.min(MAX_SLEEP)) => {}
                _ = shutdown.changed() => {
                    debug!("Backup scheduler shutting down");
                    return;
                }
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        warn!("Configuration channel closed, backup scheduler exiting");
                        return;
                    }
                    debug!("Backup configuration changed, rescheduling");
                    continue 'arm;
                }
            }
        }

        info!("Starting scheduled backup");
        match manager.create_backup(BackupOrigin::Scheduled).await {
            Ok(record) => info!("Scheduled backup {} completed", record.id),
            Err(e) => error!("Scheduled backup failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MockSnapshotCapturer;
    use crate::config::ConfigUpdate;
    use chrono::{Timelike, Utc, Weekday};
    use tempfile::TempDir;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_daily_schedule() {
        assert_eq!(
            next_run_after(Frequency::Daily, &at(2024, 3, 13, 1, 0)),
            at(2024, 3, 13, 2, 0)
        );
        assert_eq!(
            next_run_after(Frequency::Daily, &at(2024, 3, 13, 2, 0)),
            at(2024, 3, 14, 2, 0)
        );
        assert_eq!(
            next_run_after(Frequency::Daily, &at(2024, 12, 31, 10, 0)),
            at(2025, 1, 1, 2, 0)
        );
    }

    #[test]
    fn test_weekly_schedule_fires_on_sunday() {
        // 2024-03-13 is a Wednesday
        let next = next_run_after(Frequency::Weekly, &at(2024, 3, 13, 10, 0));
        assert_eq!(next, at(2024, 3, 17, 2, 0));
        assert_eq!(next.weekday(), Weekday::Sun);

        assert_eq!(
            next_run_after(Frequency::Weekly, &at(2024, 3, 17, 1, 30)),
            at(2024, 3, 17, 2, 0)
        );
        assert_eq!(
            next_run_after(Frequency::Weekly, &at(2024, 3, 17, 3, 0)),
            at(2024, 3, 24, 2, 0)
        );
    }

    #[test]
    fn test_monthly_schedule_fires_on_first() {
        assert_eq!(
            next_run_after(Frequency::Monthly, &at(2024, 3, 13, 10, 0)),
            at(2024, 4, 1, 2, 0)
        );
        assert_eq!(
            next_run_after(Frequency::Monthly, &at(2024, 3, 1, 0, 15)),
            at(2024, 3, 1, 2, 0)
        );
        assert_eq!(
            next_run_after(Frequency::Monthly, &at(2024, 12, 15, 2, 0)),
            at(2025, 1, 1, 2, 0)
        );
    }

    #[test]
    fn test_next_run_is_strictly_after_now() {
        let mut now = at(2024, 2, 27, 0, 0);
        for _ in 0..200 {
            for frequency in [Frequency::Daily, Frequency::Weekly, Frequency::Monthly] {
                let next = next_run_after(frequency, &now);
                assert!(next > now);
                assert_eq!(next.hour(), SCHEDULE_HOUR);
            }
            now += chrono::Duration::hours(7);
        }
    }

    #[tokio::test]
    async fn test_scheduler_follows_config_updates() {
        let temp_dir = TempDir::new().unwrap();
        let mut mock = MockSnapshotCapturer::new();
        mock.expect_engine_name().return_const("sqlite");
        mock.expect_artifact_extension().return_const("sqlite");
        mock.expect_capture().never();

        let manager = BackupManager::with_capturer(
            BackupConfig::with_directory(temp_dir.path()),
            Box::new(mock),
        )
        .unwrap();

        let mut scheduler = BackupScheduler::start(manager.clone());
        let mut wake = scheduler.next_wake();

        let first = {
            let armed =
                tokio::time::timeout(Duration::from_secs(5), wake.wait_for(|w| w.is_some()))
                    .await
                    .unwrap()
                    .unwrap();
            (*armed).unwrap()
        };
        assert!(first > Local::now());
        assert!(scheduler.is_running());

        manager
            .update_config(ConfigUpdate {
                frequency: Some(Frequency::Monthly),
                ..ConfigUpdate::default()
            })
            .await
            .unwrap();

        let rearmed = {
            let armed = tokio::time::timeout(
                Duration::from_secs(5),
                wake.wait_for(|w| w.is_some_and(|t| t.day() == 1)),
            )
            .await
            .unwrap()
            .unwrap();
            (*armed).unwrap()
        };
        assert_eq!(rearmed.hour(), SCHEDULE_HOUR);

        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_dropped_scheduler_exits_without_running_backups() {
        let temp_dir = TempDir::new().unwrap();
        let mut mock = MockSnapshotCapturer::new();
        mock.expect_engine_name().return_const("sqlite");
        mock.expect_artifact_extension().return_const("sqlite");
        mock.expect_capture().never();

        let manager = BackupManager::with_capturer(
            BackupConfig::with_directory(temp_dir.path()),
            Box::new(mock),
        )
        .unwrap();

        let scheduler = BackupScheduler::start(manager.clone());
        let mut wake = scheduler.next_wake();
        tokio::time::timeout(Duration::from_secs(5), wake.wait_for(|w| w.is_some()))
            .await
            .unwrap()
            .unwrap();
        drop(scheduler);

        // The loop holds the only other handle to the manager until it exits
        tokio::time::timeout(Duration::from_secs(5), async {
            while Arc::strong_count(&manager) > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(manager.get_history().await.is_empty());
    }
}
