use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::RwLock;
use tokio::sync::{Mutex, Notify};
use tokio::time::Duration;

#[derive(Debug, Clone)]
pub struct QueuedRun {
    pub run_id: String,
    pub report_id: String,
    pub queued_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
}

type ExecutorFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
type Executor = Arc<dyn Fn(String) -> ExecutorFuture + Send + Sync>;

/// Bounded dispatch queue for scheduled report runs. Execution per report is
/// serialized (one in-flight run per report id); distinct reports run in
/// parallel up to the global limit.
#[derive(Clone)]
pub struct RunQueue {
    queue: Arc<Mutex<Vec<QueuedRun>>>,
    running_global: Arc<Mutex<usize>>,
    running_reports: Arc<Mutex<HashSet<String>>>,
    notify: Arc<Notify>,
    executor: Arc<RwLock<Option<Executor>>>,
    global_limit: usize,
    max_queue_size: usize,
}

impl RunQueue {
    pub fn new(global_limit: usize, max_queue_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            running_global: Arc::new(Mutex::new(0)),
            running_reports: Arc::new(Mutex::new(HashSet::new())),
            notify: Arc::new(Notify::new()),
            executor: Arc::new(RwLock::new(None)),
            global_limit: global_limit.max(1),
            max_queue_size,
        }
    }

    pub fn set_executor(&self, executor: Executor) {
        let mut writer = self.executor.write().expect("run queue executor write lock");
        *writer = Some(executor);
    }

    pub async fn enqueue(&self, run: QueuedRun) -> Result<(), String> {
        {
            let mut queue = self.queue.lock().await;
            if queue.iter().any(|queued| queued.run_id == run.run_id) {
                return Ok(());
            }
            if queue.len() >= self.max_queue_size {
                return Err(format!(
                    "Queue capacity exceeded (max {}).",
                    self.max_queue_size
                ));
            }
            queue.push(run);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub async fn has_capacity(&self) -> bool {
        let queue = self.queue.lock().await;
        queue.len() < self.max_queue_size
    }

    pub fn start(&self) {
        let queue = self.clone();
        tokio::spawn(async move {
            queue.run_loop().await;
        });
    }

    async fn run_loop(self) {
        loop {
            self.notify.notified().await;
            let mut blocked_attempts = 0usize;
            loop {
                let (maybe_run, next_delay) = self.pick_next_run().await;
                let Some(run) = maybe_run else {
                    if let Some(delay) = next_delay {
                        let notify = self.notify.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            notify.notify_one();
                        });
                    }
                    break;
                };

                if !self.try_reserve_slot(&run.report_id).await {
                    let mut queue = self.queue.lock().await;
                    queue.push(run);
                    blocked_attempts += 1;
                    if blocked_attempts >= queue.len() {
                        break;
                    }
                    continue;
                }
                blocked_attempts = 0;

                let queue = self.clone();
                tokio::spawn(async move {
                    let failed = queue.execute(run.run_id.clone()).await;
                    queue.release_slot(&run.report_id).await;
                    if failed {
                        tracing::warn!(run_id = %run.run_id, "scheduled run finished in failed state");
                    }
                    queue.notify.notify_one();
                });
            }
        }
    }

    async fn execute(&self, run_id: String) -> bool {
        let executor = self
            .executor
            .read()
            .expect("run queue executor read lock")
            .clone();
        match executor {
            Some(executor) => executor(run_id).await,
            None => true,
        }
    }

    async fn pick_next_run(&self) -> (Option<QueuedRun>, Option<Duration>) {
        let busy = {
            let running = self.running_reports.lock().await;
            running.clone()
        };

        let mut queue = self.queue.lock().await;
        if queue.is_empty() {
            return (None, None);
        }

        let now = Utc::now();
        let best_index = queue
            .iter()
            .enumerate()
            .filter(|(_, run)| run.not_before <= now && !busy.contains(&run.report_id))
            .min_by_key(|(_, run)| run.queued_at)
            .map(|(index, _)| index);

        let Some(best_index) = best_index else {
            // Nothing dispatchable yet; wake up when the earliest hold expires.
            let next_ready_at = queue.iter().map(|run| run.not_before).min();
            let delay = next_ready_at.map(|at| {
                let diff = at.signed_duration_since(now).num_milliseconds();
                Duration::from_millis(diff.max(0) as u64)
            });
            return (None, delay);
        };

        (Some(queue.remove(best_index)), None)
    }

    async fn try_reserve_slot(&self, report_id: &str) -> bool {
        let mut global = self.running_global.lock().await;
        if *global >= self.global_limit {
            return false;
        }

        let mut reports = self.running_reports.lock().await;
        if reports.contains(report_id) {
            return false;
        }

        *global += 1;
        reports.insert(report_id.to_string());
        true
    }

    async fn release_slot(&self, report_id: &str) {
        let mut global = self.running_global.lock().await;
        if *global > 0 {
            *global -= 1;
        }

        let mut reports = self.running_reports.lock().await;
        reports.remove(report_id);
    }
}

#[cfg(test)]
mod tests {
    use super::{QueuedRun, RunQueue};
    use chrono::{Duration, Utc};

    fn queued(run_id: &str, report_id: &str) -> QueuedRun {
        let now = Utc::now();
        QueuedRun {
            run_id: run_id.to_string(),
            report_id: report_id.to_string(),
            queued_at: now,
            not_before: now,
        }
    }

    #[tokio::test]
    async fn queue_capacity_is_enforced() {
        let queue = RunQueue::new(1, 1);
        queue.enqueue(queued("first", "r1")).await.expect("first enqueue");
        let err = queue
            .enqueue(queued("second", "r2"))
            .await
            .expect_err("second enqueue should fail");
        assert!(err.contains("Queue capacity exceeded"));
    }

    #[tokio::test]
    async fn duplicate_run_ids_are_ignored() {
        let queue = RunQueue::new(1, 8);
        queue.enqueue(queued("run", "r1")).await.expect("enqueue");
        queue.enqueue(queued("run", "r1")).await.expect("duplicate enqueue is a no-op");
        let pending = queue.queue.lock().await;
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn same_report_never_holds_two_slots() {
        let queue = RunQueue::new(4, 8);
        assert!(queue.try_reserve_slot("report-a").await);
        assert!(!queue.try_reserve_slot("report-a").await);
        assert!(queue.try_reserve_slot("report-b").await);

        queue.release_slot("report-a").await;
        assert!(queue.try_reserve_slot("report-a").await);
    }

    #[tokio::test]
    async fn busy_reports_are_skipped_when_picking() {
        let queue = RunQueue::new(4, 8);
        queue.enqueue(queued("run-1", "report-a")).await.expect("enqueue");
        queue.enqueue(queued("run-2", "report-b")).await.expect("enqueue");

        assert!(queue.try_reserve_slot("report-a").await);
        let (picked, _) = queue.pick_next_run().await;
        let picked = picked.expect("report-b run is dispatchable");
        assert_eq!(picked.run_id, "run-2");
    }

    #[tokio::test]
    async fn held_runs_schedule_a_wakeup_delay() {
        let queue = RunQueue::new(4, 8);
        let now = Utc::now();
        queue
            .enqueue(QueuedRun {
                run_id: "later".to_string(),
                report_id: "r1".to_string(),
                queued_at: now,
                not_before: now + Duration::seconds(30),
            })
            .await
            .expect("enqueue");

        let (picked, delay) = queue.pick_next_run().await;
        assert!(picked.is_none());
        assert!(delay.expect("delay until the hold expires").as_secs() <= 30);
    }

    #[tokio::test]
    async fn ready_runs_dispatch_in_fifo_order() {
        let queue = RunQueue::new(4, 8);
        let now = Utc::now();
        queue
            .enqueue(QueuedRun {
                run_id: "newer".to_string(),
                report_id: "r1".to_string(),
                queued_at: now,
                not_before: now - Duration::seconds(1),
            })
            .await
            .expect("enqueue");
        queue
            .enqueue(QueuedRun {
                run_id: "older".to_string(),
                report_id: "r2".to_string(),
                queued_at: now - Duration::seconds(60),
                not_before: now - Duration::seconds(1),
            })
            .await
            .expect("enqueue");

        let (picked, _) = queue.pick_next_run().await;
        assert_eq!(picked.expect("a run is ready").run_id, "older");
    }
}
