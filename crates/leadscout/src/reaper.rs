//! Stuck-task recovery.
//!
//! A sweep expires idempotency entries whose TTL has passed and puts tasks
//! that have been `running` longer than the staleness threshold back in the
//! queue, together with their jobs. Both steps always run; a failure in one
//! is logged and counted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use crate::cleanup::non_fatal;
use crate::db::{job_repo, Database};
use crate::idempotency::IdempotencyCache;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaperReport {
    pub expired_entries: usize,
    pub recovered_tasks: usize,
    /// Steps that failed and were skipped.
    pub errors: usize,
}

#[derive(Clone)]
pub struct Reaper {
    db: Database,
    cache: IdempotencyCache,
    stuck_threshold: chrono::Duration,
}

impl Reaper {
    pub fn new(db: Database, cache: IdempotencyCache, stuck_threshold: chrono::Duration) -> Self {
        Self {
            db,
            cache,
            stuck_threshold,
        }
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> ReaperReport {
        let mut report = ReaperReport::default();

        match non_fatal("expire idempotency entries", || self.cache.expire_all_before(now)) {
            Some(n) => report.expired_entries = n,
            None => report.errors += 1,
        }

        let cutoff = now - self.stuck_threshold;
        match non_fatal("recover stuck tasks", || {
            job_repo::reset_stuck_tasks(&self.db, cutoff, now)
        }) {
            Some(n) => report.recovered_tasks = n,
            None => report.errors += 1,
        }

        if report.expired_entries > 0 || report.recovered_tasks > 0 {
            log::info!(
                "Reaper: expired {} cache entries, recovered {} stuck tasks",
                report.expired_entries,
                report.recovered_tasks
            );
        }
        report
    }
}

/// Runs [`Reaper::sweep`] on a fixed interval, or on demand through the
/// trigger channel.
pub struct ReaperScheduler {
    reaper: Reaper,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl ReaperScheduler {
    pub fn new(reaper: Reaper, interval: Duration) -> Self {
        Self {
            reaper,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Spawns the sweep loop on the current runtime.
    pub fn start(&self, mut trigger_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let reaper = self.reaper.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let wake = Arc::clone(&self.wake);
        let interval = self.interval;

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await; // skip immediate first tick

            loop {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }

                tokio::select! {
                    _ = timer.tick() => {},
                    Ok(()) = trigger_rx.recv() => {
                        log::info!("Manual reaper sweep triggered");
                    },
                    _ = wake.notified() => {},
                }

                if shutdown.load(Ordering::Acquire) {
                    break;
                }

                let report = reaper.sweep(Utc::now());
                if report.errors > 0 {
                    log::warn!("Reaper sweep finished with {} failed steps", report.errors);
                }
            }
            log::debug!("Reaper scheduler stopped");
        })
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::queue::{JobStatus, JobStore, NewJob, TaskStatus};

    fn reaper(db: &Database) -> Reaper {
        let policy = PolicyConfig::default();
        Reaper::new(
            db.clone(),
            IdempotencyCache::new(db.clone(), policy.idempotency_ttl()),
            policy.stuck_task_threshold(),
        )
    }

    #[test]
    fn test_sweep_on_empty_store() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(reaper(&db).sweep(Utc::now()), ReaperReport::default());
    }

    #[test]
    fn test_sweep_expires_and_recovers() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let store = JobStore::new(db.clone(), &PolicyConfig::default());
        let cache = IdempotencyCache::new(db.clone(), chrono::Duration::seconds(60));

        cache
            .reserve_at("old", chrono::Duration::seconds(60), now - chrono::Duration::minutes(5))
            .unwrap();
        cache.reserve_at("fresh", chrono::Duration::seconds(60), now).unwrap();

        let id = store
            .enqueue(NewJob::new("work", serde_json::json!({})).run_at(now - chrono::Duration::hours(1)))
            .unwrap();
        let claimed = store
            .claim_at(&["work"], now - chrono::Duration::minutes(30))
            .unwrap()
            .unwrap();

        let report = reaper(&db).sweep(now);
        assert_eq!(report.expired_entries, 1);
        assert_eq!(report.recovered_tasks, 1);
        assert_eq!(report.errors, 0);

        assert!(cache.lookup("fresh").unwrap().is_some());
        let job = store.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 0);
        let tasks = store.tasks_for_job(&id).unwrap();
        assert_eq!(tasks[0].id, claimed.task.id);
        assert_eq!(tasks[0].status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_scheduler_stops() {
        let db = Database::open_in_memory().unwrap();
        let scheduler = ReaperScheduler::new(reaper(&db), Duration::from_millis(20));
        let (trigger_tx, trigger_rx) = broadcast::channel(4);
        let handle = scheduler.start(trigger_rx);

        let _ = trigger_tx.send(());
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.stop();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
