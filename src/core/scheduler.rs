//! Promotes due scheduled tasks and enqueues periodic ones.
//!
//! The scheduler never runs task bodies. Every tick it drains the schedule up
//! to "now" into the ready queue; once per wall-clock minute it also checks
//! every registered crontab.

use crate::core::Scrooge;
use crate::core::worker::ShutdownMode;
use crate::error::ScroogeResult;
use crate::signals::{Signal, SignalEvent};
use crate::task::Task;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Scheduled tasks moved to the ready queue
    pub promoted: usize,
    /// Periodic tasks enqueued
    pub periodic: usize,
    /// Periodic occurrences skipped by a revocation
    pub skipped: usize,
}

/// Scheduler loop state.
#[derive(Debug)]
pub struct Scheduler {
    scrooge: Scrooge,
    interval: Duration,
    periodic: bool,
    last_periodic_minute: Option<DateTime<Utc>>,
}

impl Scheduler {
    /// Scheduler ticking every `interval`; `periodic` enables crontab checks.
    pub fn new(scrooge: Scrooge, interval: Duration, periodic: bool) -> Self {
        Self {
            scrooge,
            interval,
            periodic,
            last_periodic_minute: None,
        }
    }

    /// One scheduler pass as of `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> ScroogeResult<TickReport> {
        let mut report = TickReport::default();

        for task in self.scrooge.read_schedule(now).await? {
            tracing::debug!("Promoting scheduled task {} ({})", task.id, task.name);
            match self.scrooge.enqueue_ready(&task).await {
                Ok(()) => report.promoted += 1,
                Err(e) => {
                    tracing::error!("Failed to enqueue scheduled task {}: {}", task.id, e);
                    // Put it back quietly; it was already announced as scheduled.
                    if let Err(e) = self.restore(&task, now).await {
                        tracing::error!("Lost scheduled task {} ({}): {}", task.id, task.name, e);
                    }
                }
            }
        }

        if self.periodic {
            let minute = now.duration_trunc(TimeDelta::minutes(1)).unwrap_or(now);
            if self.last_periodic_minute != Some(minute) {
                self.last_periodic_minute = Some(minute);
                self.enqueue_periodic(now, &mut report).await?;
            }
        }

        if report.promoted > 0 || report.periodic > 0 {
            tracing::info!(
                "Scheduler tick: {} promoted, {} periodic",
                report.promoted,
                report.periodic
            );
        }
        Ok(report)
    }

    async fn restore(&self, task: &Task, now: DateTime<Utc>) -> ScroogeResult<()> {
        self.scrooge
            .storage()
            .schedule_add(task.serialize()?, task.eta.unwrap_or(now), task.priority)
            .await
    }

    async fn enqueue_periodic(
        &self,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> ScroogeResult<()> {
        for task in self.scrooge.read_periodic(now)? {
            if self.scrooge.is_revoked(&task, now, false).await? {
                tracing::info!("Periodic task {} revoked, skipping this run", task.name);
                self.scrooge
                    .signals()
                    .send(&SignalEvent::new(Signal::Revoked, &task));
                report.skipped += 1;
                continue;
            }
            tracing::info!("Enqueueing periodic task {}", task.name);
            self.scrooge.enqueue(task).await?;
            report.periodic += 1;
        }
        Ok(())
    }

    /// Tick until `shutdown` leaves [`ShutdownMode::Running`].
    pub async fn run(mut self, mut shutdown: watch::Receiver<ShutdownMode>) {
        tracing::info!(
            "🔧 Scheduler started (interval {:?}, periodic {})",
            self.interval,
            self.periodic
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        tracing::error!("Scheduler tick failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() != ShutdownMode::Running {
                        break;
                    }
                }
            }
        }

        tracing::info!("Scheduler stopped");
    }
}
