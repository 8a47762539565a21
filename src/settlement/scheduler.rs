// Reconciliation Scheduler - runs the reconciliation jobs in-process
//
// Daily: once at the configured UTC hour, off-peak
// Hourly: every hour; deficits close sooner as donations arrive
//
// A failed run is logged and retried on the next tick, never fatal.

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info};

use crate::ledger::LedgerStore;
use crate::settlement::reconciler::{Reconciler, RunOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileFrequency {
    Daily,
    Hourly,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileScheduleConfig {
    pub frequency: ReconcileFrequency,
    /// UTC hour for daily runs (0-23)
    pub execution_hour: u32,
    pub options: RunOptions,
}

pub struct ReconcileScheduler<S: LedgerStore> {
    config: ReconcileScheduleConfig,
    reconciler: Arc<Reconciler<S>>,
}

impl<S: LedgerStore> ReconcileScheduler<S> {
    pub fn new(config: ReconcileScheduleConfig, reconciler: Arc<Reconciler<S>>) -> Self {
        Self { config, reconciler }
    }

    /// Start the scheduler (runs in background)
    pub fn start(&self) -> JoinHandle<()> {
        let config = self.config;
        let reconciler = self.reconciler.clone();

        tokio::spawn(async move {
            match config.frequency {
                ReconcileFrequency::Daily => Self::run_daily_scheduler(&config, &reconciler).await,
                ReconcileFrequency::Hourly => {
                    Self::run_hourly_scheduler(&config, &reconciler).await
                }
            }
        })
    }

    async fn run_daily_scheduler(config: &ReconcileScheduleConfig, reconciler: &Reconciler<S>) {
        loop {
            let now = Utc::now();
            let next_execution = calculate_next_daily_execution(now, config.execution_hour);
            let wait = next_execution.signed_duration_since(now);

            if wait.num_seconds() > 0 {
                info!(
                    "⏰ Next reconciliation scheduled for: {} UTC",
                    next_execution.format("%Y-%m-%d %H:%M:%S")
                );
                tokio::time::sleep(Duration::from_secs(wait.num_seconds() as u64)).await;
            }

            info!("🔄 Starting daily reconciliation cycle");
            Self::run_cycle(config, reconciler).await;
        }
    }

    async fn run_hourly_scheduler(config: &ReconcileScheduleConfig, reconciler: &Reconciler<S>) {
        let mut interval = interval(Duration::from_secs(3600));

        loop {
            interval.tick().await;

            info!("🔄 Starting hourly reconciliation cycle");
            Self::run_cycle(config, reconciler).await;
        }
    }

    async fn run_cycle(config: &ReconcileScheduleConfig, reconciler: &Reconciler<S>) {
        match reconciler.run_all(config.options).await {
            Ok(summaries) => {
                let failed: usize = summaries.iter().map(|s| s.failed).sum();
                let drawn: i64 = summaries.iter().map(|s| s.credits_drawn).sum();
                info!(failed, credits_drawn = drawn, "✓ Reconciliation cycle completed");
            }
            Err(e) => {
                error!("❌ Reconciliation cycle failed: {:?}", e);
            }
        }
    }
}

/// Next occurrence of `execution_hour`:00 UTC strictly after `now`
fn calculate_next_daily_execution(now: DateTime<Utc>, execution_hour: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(execution_hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = Utc.from_utc_datetime(&now.date_naive().and_time(at));

    if today <= now {
        today + chrono::Duration::days(1)
    } else {
        today
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Timelike};

    use super::*;
    use crate::ledger::memory::MemoryLedger;
    use crate::settlement::earn_shift::EarnShiftFunder;

    #[test]
    fn test_calculate_next_daily_execution() {
        // Current time: 2024-01-01 10:00:00 UTC
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

        // Execution hour: 14:00 (today)
        let next = calculate_next_daily_execution(now, 14);
        assert_eq!(next.hour(), 14);
        assert_eq!(next.day(), 1);

        // Execution hour: 09:00 (already passed, so tomorrow)
        let next = calculate_next_daily_execution(now, 9);
        assert_eq!(next.hour(), 9);
        assert_eq!(next.day(), 2);

        // Exactly on the hour runs tomorrow, not now
        let next = calculate_next_daily_execution(now, 10);
        assert_eq!(next.day(), 2);
    }

    #[tokio::test]
    async fn test_scheduler_task_can_be_started_and_aborted() {
        let ledger = MemoryLedger::new();
        let funder = Arc::new(EarnShiftFunder::new(Arc::new(ledger), "general"));
        let scheduler = ReconcileScheduler::new(
            ReconcileScheduleConfig {
                frequency: ReconcileFrequency::Daily,
                execution_hour: 2,
                options: RunOptions::default(),
            },
            Arc::new(Reconciler::new(funder)),
        );

        let handle = scheduler.start();
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
