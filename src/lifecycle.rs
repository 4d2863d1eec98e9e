//! Report lifecycle orchestration: creation, schedule management, and run
//! triggering. Execution per report is serialized; distinct reports run in
//! parallel through the dispatch queue.

use crate::db::Database;
use crate::errors::{CoreError, CoreResult};
use crate::executor::{RunExecutor, RunOutcome};
use crate::models::{
    EngineSettings, ListReportsFilters, Report, ReportDefinition, ReportRun, ReportStatus,
    RunStatus, SqlQuery, TriggerType, UpdateSchedulePayload,
};
use crate::queue::{QueuedRun, RunQueue};
use crate::schedule;
use chrono::{DateTime, FixedOffset, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

#[derive(Clone)]
pub struct ReportEngine {
    db: Arc<Database>,
    queue: RunQueue,
    executor: Arc<dyn RunExecutor>,
    run_locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ReportEngine {
    pub fn new(db: Arc<Database>, executor: Arc<dyn RunExecutor>) -> CoreResult<Arc<Self>> {
        let settings = db.get_settings()?;
        let queue = RunQueue::new(settings.max_parallel_runs, settings.max_queue_size);

        let this = Arc::new(Self {
            db,
            queue: queue.clone(),
            executor,
            run_locks: Arc::new(StdMutex::new(HashMap::new())),
        });

        match this.db.mark_orphan_runs_failed() {
            Ok(repaired) if repaired > 0 => {
                tracing::warn!(count = repaired, "marked orphaned runs as failed on startup");
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(error = %error, "orphaned run repair failed");
            }
        }

        let weak = Arc::downgrade(&this);
        queue.set_executor(Arc::new(move |run_id: String| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(engine) = weak.upgrade() {
                    engine.execute_run(&run_id).await
                } else {
                    true
                }
            })
        }));

        Ok(this)
    }

    /// Starts the background dispatch loop for scheduled runs.
    pub fn start_dispatcher(&self) {
        self.queue.start();
    }

    pub fn create_report(&self, owner_id: &str, definition: ReportDefinition) -> CoreResult<Report> {
        validate_definition(&definition)?;
        let report = self.db.create_report(owner_id, &definition)?;
        tracing::info!(report_id = %report.id, title = %report.title, "created report");
        Ok(report)
    }

    pub fn get_report(&self, report_id: &str) -> CoreResult<Option<Report>> {
        self.db.get_report(report_id)
    }

    pub fn list_reports(&self, filters: &ListReportsFilters) -> CoreResult<Vec<Report>> {
        self.db.list_reports(filters)
    }

    /// Validates and applies a schedule change; the status may be changed in
    /// the same call (e.g. pausing without touching the schedule).
    pub fn update_schedule(
        &self,
        report_id: &str,
        payload: UpdateSchedulePayload,
    ) -> CoreResult<Report> {
        let spec = payload
            .schedule_config
            .unwrap_or_default()
            .into_spec(payload.schedule_type)?;

        self.db
            .update_report_schedule(report_id, &spec, payload.status)?
            .ok_or_else(|| CoreError::NotFound(format!("report {} not found", report_id)))
    }

    /// Structured replacement for editing queries as raw text: malformed
    /// input is rejected, never silently dropped.
    pub fn update_queries(&self, report_id: &str, queries: Vec<SqlQuery>) -> CoreResult<Report> {
        validate_queries(&queries)?;
        self.db
            .update_report_queries(report_id, &queries)?
            .ok_or_else(|| CoreError::NotFound(format!("report {} not found", report_id)))
    }

    pub fn update_prompt(&self, report_id: &str, user_prompt: &str) -> CoreResult<Report> {
        if user_prompt.trim().is_empty() {
            return Err(CoreError::Validation("user prompt cannot be blank".to_string()));
        }
        self.db
            .update_report_prompt(report_id, user_prompt)?
            .ok_or_else(|| CoreError::NotFound(format!("report {} not found", report_id)))
    }

    pub fn toggle_pin(&self, report_id: &str) -> CoreResult<Report> {
        self.db
            .toggle_report_pin(report_id)?
            .ok_or_else(|| CoreError::NotFound(format!("report {} not found", report_id)))
    }

    /// Deletes the report and all of its runs.
    pub fn delete_report(&self, report_id: &str) -> CoreResult<()> {
        if !self.db.delete_report(report_id)? {
            return Err(CoreError::NotFound(format!("report {} not found", report_id)));
        }
        let mut locks = self.run_locks.lock().expect("run lock registry");
        locks.remove(report_id);
        tracing::info!(report_id = %report_id, "deleted report and its runs");
        Ok(())
    }

    /// Runs a report now, regardless of its status, and waits for the
    /// outcome. A failed execution is persisted as a failed run and returned
    /// as an error.
    pub async fn trigger_manual_run(&self, report_id: &str) -> CoreResult<ReportRun> {
        if self.db.get_report(report_id)?.is_none() {
            return Err(CoreError::NotFound(format!("report {} not found", report_id)));
        }

        let run = self.db.insert_run(report_id, TriggerType::Manual)?;
        let failed = self.execute_run(&run.id).await;
        let run = self
            .db
            .get_run(&run.id)?
            .ok_or_else(|| CoreError::Internal("run record vanished mid-flight".to_string()))?;

        if failed {
            let message = run
                .error_message
                .clone()
                .unwrap_or_else(|| "run failed".to_string());
            return Err(CoreError::Execution(message));
        }
        Ok(run)
    }

    /// Evaluates the due set at `now` and dispatches one run per due report.
    /// Returns the pending run records; execution happens on the dispatch
    /// loop, so two due reports never block each other.
    pub async fn trigger_due_runs(&self, now: DateTime<Utc>) -> CoreResult<Vec<ReportRun>> {
        let settings = self.db.get_settings()?;
        let offset = reference_offset(&settings);

        let mut triggered = Vec::new();
        for report in self.db.list_active_reports()? {
            let due = schedule::next_due(&report.schedule, report.last_run_at, now, offset)
                .map(|next| next <= now)
                .unwrap_or(false);
            if !due {
                continue;
            }
            // A report with a run already in flight is picked up again on the
            // next evaluation after that run reaches a terminal state.
            if self.db.has_open_run(&report.id)? {
                continue;
            }

            let run = self.db.insert_run(&report.id, TriggerType::Scheduled)?;
            let enqueued = self
                .queue
                .enqueue(QueuedRun {
                    run_id: run.id.clone(),
                    report_id: report.id.clone(),
                    queued_at: now,
                    not_before: now,
                })
                .await;
            if let Err(error) = enqueued {
                tracing::warn!(report_id = %report.id, error = %error, "could not enqueue due run");
                let outcome = RunOutcome {
                    error_message: Some(error),
                    ..RunOutcome::default()
                };
                self.db.finish_run(&run.id, RunStatus::Failed, 0, &outcome)?;
                continue;
            }
            triggered.push(run);
        }
        Ok(triggered)
    }

    pub fn get_run(&self, run_id: &str) -> CoreResult<Option<ReportRun>> {
        self.db.get_run(run_id)
    }

    pub fn list_runs(&self, report_id: &str, page: u32, per_page: u32) -> CoreResult<Vec<ReportRun>> {
        self.db.list_runs_by_report(report_id, page, per_page)
    }

    pub fn get_settings(&self) -> CoreResult<EngineSettings> {
        self.db.get_settings()
    }

    pub fn update_settings(&self, update: serde_json::Value) -> CoreResult<EngineSettings> {
        self.db.update_settings(update)
    }

    /// Executes one run to its terminal state. Returns whether it failed.
    /// Both trigger paths funnel through here, under the report's run lock.
    pub(crate) async fn execute_run(&self, run_id: &str) -> bool {
        let Ok(Some(run)) = self.db.get_run(run_id) else {
            return true;
        };
        if run.status.is_terminal() {
            return run.status == RunStatus::Failed;
        }

        let lock = self.report_lock(&run.report_id);
        let _guard = lock.lock().await;

        let Ok(Some(report)) = self.db.get_report(&run.report_id) else {
            // Owner vanished between trigger and dispatch.
            let outcome = RunOutcome {
                error_message: Some("report was deleted before the run started".to_string()),
                ..RunOutcome::default()
            };
            let _ = self.db.finish_run(run_id, RunStatus::Failed, 0, &outcome);
            return true;
        };

        if let Err(error) = self.db.mark_run_running(run_id) {
            tracing::warn!(run_id = %run_id, error = %error, "could not mark run running");
            return true;
        }

        let timeout_ms = self
            .db
            .get_settings()
            .map(|settings| settings.executor_timeout_ms)
            .unwrap_or_else(|_| EngineSettings::default().executor_timeout_ms);

        let started = std::time::Instant::now();
        let executed = timeout(
            Duration::from_millis(timeout_ms),
            self.executor.execute(report.definition()),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let (status, outcome) = match executed {
            Err(_) => (
                RunStatus::Failed,
                RunOutcome {
                    error_message: Some(format!("run executor timed out after {} ms", timeout_ms)),
                    ..RunOutcome::default()
                },
            ),
            Ok(Err(error)) => (
                RunStatus::Failed,
                RunOutcome {
                    error_message: Some(error.to_string()),
                    ..RunOutcome::default()
                },
            ),
            Ok(Ok(outcome)) => {
                // Individual query failures inside the outcome do not fail
                // the run; only an aggregate executor error does.
                let status = if outcome.error_message.is_some() {
                    RunStatus::Failed
                } else {
                    RunStatus::Completed
                };
                (status, outcome)
            }
        };

        if let Err(error) = self.db.finish_run(run_id, status, duration_ms, &outcome) {
            tracing::error!(run_id = %run_id, error = %error, "could not persist run outcome");
            return true;
        }

        match status {
            RunStatus::Completed => {
                if let Err(error) = self.db.set_report_last_run(&run.report_id, Utc::now()) {
                    tracing::warn!(report_id = %run.report_id, error = %error, "could not update last run time");
                }
                // A successful run clears a prior execution error.
                if report.status == ReportStatus::Error {
                    let _ = self.db.set_report_status(&run.report_id, ReportStatus::Active);
                }
                tracing::info!(run_id = %run_id, report_id = %run.report_id, duration_ms, "run completed");
                false
            }
            _ => {
                let _ = self.db.set_report_status(&run.report_id, ReportStatus::Error);
                tracing::warn!(
                    run_id = %run_id,
                    report_id = %run.report_id,
                    error = outcome.error_message.as_deref().unwrap_or("unknown"),
                    "run failed"
                );
                true
            }
        }
    }

    fn report_lock(&self, report_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.run_locks.lock().expect("run lock registry");
        locks
            .entry(report_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn reference_offset(settings: &EngineSettings) -> FixedOffset {
    FixedOffset::east_opt(settings.utc_offset_minutes * 60)
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"))
}

fn validate_definition(definition: &ReportDefinition) -> CoreResult<()> {
    if definition.title.trim().is_empty() {
        return Err(CoreError::Validation("report title cannot be blank".to_string()));
    }
    validate_queries(&definition.sql_queries)
}

fn validate_queries(queries: &[SqlQuery]) -> CoreResult<()> {
    if queries.is_empty() {
        return Err(CoreError::Validation(
            "a report needs at least one query".to_string(),
        ));
    }
    for query in queries {
        if query.query.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "query '{}' has no query text",
                query.purpose
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{validate_definition, validate_queries};
    use crate::models::{ReportDefinition, SqlQuery};

    fn query(purpose: &str, text: &str) -> SqlQuery {
        SqlQuery {
            purpose: purpose.to_string(),
            query: text.to_string(),
        }
    }

    #[test]
    fn blank_titles_are_rejected() {
        let definition = ReportDefinition {
            title: "   ".to_string(),
            description: String::new(),
            sql_queries: vec![query("totals", "SELECT 1")],
            user_prompt: "totals".to_string(),
        };
        assert!(validate_definition(&definition).is_err());
    }

    #[test]
    fn empty_query_lists_are_rejected() {
        assert!(validate_queries(&[]).is_err());
    }

    #[test]
    fn blank_query_text_is_rejected() {
        assert!(validate_queries(&[query("totals", "  ")]).is_err());
    }

    #[test]
    fn well_formed_queries_pass() {
        assert!(validate_queries(&[query("totals", "SELECT COUNT(*) FROM orders")]).is_ok());
    }
}
