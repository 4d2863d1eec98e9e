use crate::errors::{CoreError, CoreResult};
use crate::executor::RunOutcome;
use crate::models::{
    DayOfWeek, EngineSettings, ListReportsFilters, PublishedReport, PublishedReportLink, Report,
    ReportDefinition, ReportRun, ReportStatus, RunStatus, ScheduleSpec, SqlQuery, TriggerType,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &Path) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| CoreError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(CoreError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(CoreError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(CoreError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(CoreError::from)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> CoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Internal("database mutex poisoned".to_string()))
    }

    // ─── Reports ──────────────────────────────────────────────────────────────

    pub fn create_report(
        &self,
        owner_id: &str,
        definition: &ReportDefinition,
    ) -> CoreResult<Report> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let queries_json = serde_json::to_string(&definition.sql_queries)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO reports (
               id, owner_id, title, description, status, schedule_type, schedule_config_json,
               sql_queries_json, user_prompt, is_pinned, last_run_at, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, 0, NULL, ?9, ?9)",
            params![
                id,
                owner_id,
                definition.title,
                definition.description,
                ReportStatus::Draft.as_str(),
                "once",
                queries_json,
                definition.user_prompt,
                now.to_rfc3339(),
            ],
        )?;

        Ok(Report {
            id,
            owner_id: owner_id.to_string(),
            title: definition.title.clone(),
            description: definition.description.clone(),
            status: ReportStatus::Draft,
            schedule: ScheduleSpec::Once,
            sql_queries: definition.sql_queries.clone(),
            user_prompt: definition.user_prompt.clone(),
            is_pinned: false,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_report(&self, report_id: &str) -> CoreResult<Option<Report>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, owner_id, title, description, status, schedule_type, schedule_config_json,
                    sql_queries_json, user_prompt, is_pinned, last_run_at, created_at, updated_at
             FROM reports WHERE id = ?1",
            [report_id],
            parse_report_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    pub fn list_reports(&self, filters: &ListReportsFilters) -> CoreResult<Vec<Report>> {
        let conn = self.conn()?;
        let mut query = String::from(
            "SELECT id, owner_id, title, description, status, schedule_type, schedule_config_json,
                    sql_queries_json, user_prompt, is_pinned, last_run_at, created_at, updated_at
             FROM reports WHERE 1 = 1",
        );
        let mut params_vec: Vec<String> = Vec::new();

        if let Some(owner_id) = &filters.owner_id {
            query.push_str(" AND owner_id = ?");
            params_vec.push(owner_id.clone());
        }
        if let Some(status) = filters.status {
            query.push_str(" AND status = ?");
            params_vec.push(status.as_str().to_string());
        }
        if filters.pinned_only.unwrap_or(false) {
            query.push_str(" AND is_pinned = 1");
        }
        if let Some(search) = &filters.search {
            query.push_str(" AND title LIKE ?");
            params_vec.push(format!("%{}%", search));
        }

        query.push_str(" ORDER BY is_pinned DESC, updated_at DESC");
        let limit = filters.limit.unwrap_or(100);
        let offset = filters.offset.unwrap_or(0);
        query.push_str(" LIMIT ? OFFSET ?");

        let mut statement = conn.prepare(&query)?;
        let mut dyn_params: Vec<&dyn rusqlite::ToSql> = params_vec
            .iter()
            .map(|param| param as &dyn rusqlite::ToSql)
            .collect();
        dyn_params.push(&limit);
        dyn_params.push(&offset);

        let rows = statement.query_map(rusqlite::params_from_iter(dyn_params), parse_report_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn list_active_reports(&self) -> CoreResult<Vec<Report>> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(
            "SELECT id, owner_id, title, description, status, schedule_type, schedule_config_json,
                    sql_queries_json, user_prompt, is_pinned, last_run_at, created_at, updated_at
             FROM reports WHERE status = 'active' ORDER BY created_at ASC",
        )?;
        let rows = statement
            .query_map([], parse_report_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_report_schedule(
        &self,
        report_id: &str,
        schedule: &ScheduleSpec,
        status: Option<ReportStatus>,
    ) -> CoreResult<Option<Report>> {
        // A one-shot schedule stores no config at all.
        let config_json = match schedule {
            ScheduleSpec::Once => None,
            other => Some(serde_json::to_string(other)?),
        };
        let now = Utc::now().to_rfc3339();

        let conn = self.conn()?;
        let changed = match status {
            Some(status) => conn.execute(
                "UPDATE reports
                 SET schedule_type = ?1, schedule_config_json = ?2, status = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    schedule.schedule_type().as_str(),
                    config_json,
                    status.as_str(),
                    now,
                    report_id
                ],
            )?,
            None => conn.execute(
                "UPDATE reports
                 SET schedule_type = ?1, schedule_config_json = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![
                    schedule.schedule_type().as_str(),
                    config_json,
                    now,
                    report_id
                ],
            )?,
        };
        if changed == 0 {
            return Ok(None);
        }
        drop(conn);
        self.get_report(report_id)
    }

    pub fn set_report_status(&self, report_id: &str, status: ReportStatus) -> CoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE reports SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), report_id],
        )?;
        Ok(changed > 0)
    }

    pub fn toggle_report_pin(&self, report_id: &str) -> CoreResult<Option<Report>> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE reports SET is_pinned = 1 - is_pinned, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), report_id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        drop(conn);
        self.get_report(report_id)
    }

    pub fn update_report_queries(
        &self,
        report_id: &str,
        queries: &[SqlQuery],
    ) -> CoreResult<Option<Report>> {
        let queries_json = serde_json::to_string(queries)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE reports SET sql_queries_json = ?1, updated_at = ?2 WHERE id = ?3",
            params![queries_json, Utc::now().to_rfc3339(), report_id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        drop(conn);
        self.get_report(report_id)
    }

    pub fn update_report_prompt(
        &self,
        report_id: &str,
        user_prompt: &str,
    ) -> CoreResult<Option<Report>> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE reports SET user_prompt = ?1, updated_at = ?2 WHERE id = ?3",
            params![user_prompt, Utc::now().to_rfc3339(), report_id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        drop(conn);
        self.get_report(report_id)
    }

    pub fn set_report_last_run(&self, report_id: &str, at: DateTime<Utc>) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE reports SET last_run_at = ?1 WHERE id = ?2",
            params![at.to_rfc3339(), report_id],
        )?;
        Ok(())
    }

    pub fn delete_report(&self, report_id: &str) -> CoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM reports WHERE id = ?1", [report_id])?;
        Ok(changed > 0)
    }

    // ─── Runs ─────────────────────────────────────────────────────────────────

    pub fn insert_run(&self, report_id: &str, trigger: TriggerType) -> CoreResult<ReportRun> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO runs (id, report_id, status, trigger_type, created_at, queries_executed_json)
             VALUES (?1, ?2, ?3, ?4, ?5, '[]')",
            params![
                id,
                report_id,
                RunStatus::Pending.as_str(),
                trigger.as_str(),
                now.to_rfc3339()
            ],
        )?;

        Ok(ReportRun {
            id,
            report_id: report_id.to_string(),
            status: RunStatus::Pending,
            trigger_type: trigger,
            created_at: now,
            duration_ms: None,
            queries_executed: Vec::new(),
            result_markdown: None,
            result_data: None,
            error_message: None,
            llm_prompt: None,
        })
    }

    pub fn mark_run_running(&self, run_id: &str) -> CoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE runs SET status = 'running' WHERE id = ?1 AND status = 'pending'",
            [run_id],
        )?;
        Ok(changed > 0)
    }

    /// Writes the terminal state of a run. History is append-only: a run
    /// already in a terminal state is left untouched.
    pub fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        duration_ms: i64,
        outcome: &RunOutcome,
    ) -> CoreResult<bool> {
        let queries_json = serde_json::to_string(&outcome.queries_executed)?;
        let result_data_json = outcome
            .result_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE runs
             SET status = ?1, duration_ms = ?2, queries_executed_json = ?3,
                 result_markdown = ?4, result_data_json = ?5, error_message = ?6, llm_prompt = ?7
             WHERE id = ?8 AND status IN ('pending', 'running')",
            params![
                status.as_str(),
                duration_ms,
                queries_json,
                outcome.result_markdown,
                result_data_json,
                outcome.error_message,
                outcome.llm_prompt,
                run_id
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_run(&self, run_id: &str) -> CoreResult<Option<ReportRun>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, report_id, status, trigger_type, created_at, duration_ms,
                    queries_executed_json, result_markdown, result_data_json, error_message, llm_prompt
             FROM runs WHERE id = ?1",
            [run_id],
            parse_run_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    pub fn list_runs_by_report(
        &self,
        report_id: &str,
        page: u32,
        per_page: u32,
    ) -> CoreResult<Vec<ReportRun>> {
        let per_page = per_page.clamp(1, 500);
        let offset = page.saturating_sub(1) * per_page;

        let conn = self.conn()?;
        let mut statement = conn.prepare(
            "SELECT id, report_id, status, trigger_type, created_at, duration_ms,
                    queries_executed_json, result_markdown, result_data_json, error_message, llm_prompt
             FROM runs WHERE report_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = statement
            .query_map(params![report_id, per_page, offset], parse_run_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn has_open_run(&self, report_id: &str) -> CoreResult<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM runs WHERE report_id = ?1 AND status IN ('pending', 'running')",
            [report_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Runs left non-terminal by a previous process can never finish; they
    /// are closed out as failed at startup.
    pub fn mark_orphan_runs_failed(&self) -> CoreResult<u64> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE runs
             SET status = 'failed', error_message = 'Engine restarted during run'
             WHERE status IN ('pending', 'running')",
            [],
        )?;
        Ok(changed as u64)
    }

    // ─── Published reports ────────────────────────────────────────────────────

    pub fn insert_published_report(
        &self,
        report_id: &str,
        slug: &str,
        title: &str,
        description: Option<&str>,
        source_title: &str,
        password: &str,
    ) -> CoreResult<PublishedReport> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO published_reports
               (id, report_id, slug, title, description, source_title, password, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            params![
                id,
                report_id,
                slug,
                title,
                description,
                source_title,
                password,
                now.to_rfc3339()
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(error) if is_unique_violation(&error) => {
                return Err(CoreError::Conflict(format!("slug '{}' already in use", slug)));
            }
            Err(error) => return Err(error.into()),
        }

        Ok(PublishedReport {
            id,
            report_id: report_id.to_string(),
            slug: slug.to_string(),
            title: title.to_string(),
            description: description.map(ToString::to_string),
            source_title: source_title.to_string(),
            password: password.to_string(),
            is_active: true,
            created_at: now,
        })
    }

    pub fn get_published_report(&self, pub_id: &str) -> CoreResult<Option<PublishedReport>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, report_id, slug, title, description, source_title, password, is_active, created_at
             FROM published_reports WHERE id = ?1",
            [pub_id],
            parse_published_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    pub fn get_published_report_by_slug(&self, slug: &str) -> CoreResult<Option<PublishedReport>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, report_id, slug, title, description, source_title, password, is_active, created_at
             FROM published_reports WHERE slug = ?1",
            [slug],
            parse_published_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    pub fn list_published_reports(
        &self,
        page: u32,
        per_page: u32,
    ) -> CoreResult<Vec<PublishedReport>> {
        let per_page = per_page.clamp(1, 500);
        let offset = page.saturating_sub(1) * per_page;

        let conn = self.conn()?;
        let mut statement = conn.prepare(
            "SELECT id, report_id, slug, title, description, source_title, password, is_active, created_at
             FROM published_reports
             ORDER BY created_at DESC, id DESC
             LIMIT ?1 OFFSET ?2",
        )?;
        let rows = statement
            .query_map(params![per_page, offset], parse_published_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_published_password(&self, pub_id: &str, password: &str) -> CoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE published_reports SET password = ?1 WHERE id = ?2",
            params![password, pub_id],
        )?;
        Ok(changed > 0)
    }

    pub fn set_published_active(&self, pub_id: &str, is_active: bool) -> CoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE published_reports SET is_active = ?1 WHERE id = ?2",
            params![is_active as i32, pub_id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_published_report(&self, pub_id: &str) -> CoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM published_reports WHERE id = ?1", [pub_id])?;
        Ok(changed > 0)
    }

    // ─── Published report links ───────────────────────────────────────────────

    pub fn insert_link(
        &self,
        pub_id: &str,
        target_pub_id: &str,
        label: Option<&str>,
    ) -> CoreResult<PublishedReportLink> {
        let id = Uuid::new_v4().to_string();

        let conn = self.conn()?;
        let sort_order: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sort_order), 0) + 1 FROM published_report_links
             WHERE published_report_id = ?1",
            [pub_id],
            |row| row.get(0),
        )?;

        let inserted = conn.execute(
            "INSERT INTO published_report_links
               (id, published_report_id, target_published_report_id, label, sort_order)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, pub_id, target_pub_id, label, sort_order],
        );
        match inserted {
            Ok(_) => {}
            Err(error) if is_unique_violation(&error) => {
                return Err(CoreError::Conflict(
                    "link to that published report already exists".to_string(),
                ));
            }
            Err(error) => return Err(error.into()),
        }

        Ok(PublishedReportLink {
            id,
            published_report_id: pub_id.to_string(),
            target_published_report_id: target_pub_id.to_string(),
            label: label.map(ToString::to_string),
            sort_order,
        })
    }

    pub fn delete_link(&self, pub_id: &str, link_id: &str) -> CoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM published_report_links WHERE id = ?1 AND published_report_id = ?2",
            params![link_id, pub_id],
        )?;
        Ok(changed > 0)
    }

    pub fn list_links(&self, pub_id: &str) -> CoreResult<Vec<PublishedReportLink>> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(
            "SELECT id, published_report_id, target_published_report_id, label, sort_order
             FROM published_report_links
             WHERE published_report_id = ?1
             ORDER BY sort_order ASC",
        )?;
        let rows = statement
            .query_map([pub_id], |row| {
                Ok(PublishedReportLink {
                    id: row.get(0)?,
                    published_report_id: row.get(1)?,
                    target_published_report_id: row.get(2)?,
                    label: row.get(3)?,
                    sort_order: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Settings ─────────────────────────────────────────────────────────────

    pub fn get_settings(&self) -> CoreResult<EngineSettings> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = 'engine'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<EngineSettings>(&raw).unwrap_or_default()),
            None => Ok(EngineSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> CoreResult<EngineSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: EngineSettings = serde_json::from_value(merged)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES ('engine', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![serde_json::to_string(&settings)?, Utc::now().to_rfc3339()],
        )?;

        Ok(settings)
    }
}

fn parse_report_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Report> {
    let schedule_type: String = row.get(5)?;
    let schedule_config_json: Option<String> = row.get(6)?;
    let queries_json: String = row.get(7)?;

    Ok(Report {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: parse_report_status(&row.get::<_, String>(4)?),
        schedule: parse_schedule(&schedule_type, schedule_config_json.as_deref()),
        sql_queries: serde_json::from_str::<Vec<SqlQuery>>(&queries_json).unwrap_or_default(),
        user_prompt: row.get(8)?,
        is_pinned: row.get::<_, i64>(9)? != 0,
        last_run_at: row
            .get::<_, Option<String>>(10)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        created_at: parse_time(&row.get::<_, String>(11)?)?,
        updated_at: parse_time(&row.get::<_, String>(12)?)?,
    })
}

fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReportRun> {
    let queries_json: String = row.get(6)?;
    let result_data_json: Option<String> = row.get(8)?;

    Ok(ReportRun {
        id: row.get(0)?,
        report_id: row.get(1)?,
        status: parse_run_status(&row.get::<_, String>(2)?),
        trigger_type: parse_trigger(&row.get::<_, String>(3)?),
        created_at: parse_time(&row.get::<_, String>(4)?)?,
        duration_ms: row.get(5)?,
        queries_executed: serde_json::from_str(&queries_json).unwrap_or_default(),
        result_markdown: row.get(7)?,
        result_data: result_data_json.and_then(|raw| serde_json::from_str(&raw).ok()),
        error_message: row.get(9)?,
        llm_prompt: row.get(10)?,
    })
}

fn parse_published_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PublishedReport> {
    Ok(PublishedReport {
        id: row.get(0)?,
        report_id: row.get(1)?,
        slug: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        source_title: row.get(5)?,
        password: row.get(6)?,
        is_active: row.get::<_, i64>(7)? != 0,
        created_at: parse_time(&row.get::<_, String>(8)?)?,
    })
}

fn parse_report_status(raw: &str) -> ReportStatus {
    match raw {
        "draft" => ReportStatus::Draft,
        "active" => ReportStatus::Active,
        "paused" => ReportStatus::Paused,
        "error" => ReportStatus::Error,
        _ => ReportStatus::Draft,
    }
}

fn parse_run_status(raw: &str) -> RunStatus {
    match raw {
        "pending" => RunStatus::Pending,
        "running" => RunStatus::Running,
        "completed" => RunStatus::Completed,
        _ => RunStatus::Failed,
    }
}

fn parse_trigger(raw: &str) -> TriggerType {
    match raw {
        "scheduled" => TriggerType::Scheduled,
        _ => TriggerType::Manual,
    }
}

/// Loose view of a stored schedule config. Rows written before a field
/// existed, or hand-edited ones, still read back; missing fields take the
/// documented defaults (hour 9, minute 0, Monday, day 1).
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyScheduleConfig {
    hour: Option<u32>,
    minute: Option<u32>,
    #[serde(alias = "day_of_week")]
    day_of_week: Option<DayOfWeek>,
    #[serde(alias = "day_of_month")]
    day_of_month: Option<u32>,
}

fn parse_schedule(schedule_type: &str, config_json: Option<&str>) -> ScheduleSpec {
    if let Some(raw) = config_json {
        if let Ok(spec) = serde_json::from_str::<ScheduleSpec>(raw) {
            return spec;
        }
    }

    let legacy = config_json
        .and_then(|raw| serde_json::from_str::<LegacyScheduleConfig>(raw).ok())
        .unwrap_or_default();
    let hour = legacy.hour.unwrap_or(9).min(23);
    let minute = legacy.minute.unwrap_or(0).min(59);

    match schedule_type {
        "daily" => ScheduleSpec::Daily { hour, minute },
        "weekly" => ScheduleSpec::Weekly {
            day_of_week: legacy.day_of_week.unwrap_or(DayOfWeek::Mon),
            hour,
            minute,
        },
        "monthly" => ScheduleSpec::Monthly {
            day_of_month: legacy.day_of_month.unwrap_or(1).clamp(1, 31),
            hour,
            minute,
        },
        _ => ScheduleSpec::Once,
    }
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_schedule, Database};
    use crate::executor::RunOutcome;
    use crate::models::{
        DayOfWeek, ReportDefinition, RunStatus, ScheduleSpec, SqlQuery, TriggerType,
    };

    fn definition(title: &str) -> ReportDefinition {
        ReportDefinition {
            title: title.to_string(),
            description: String::new(),
            sql_queries: vec![SqlQuery {
                purpose: "totals".to_string(),
                query: "SELECT COUNT(*) FROM orders".to_string(),
            }],
            user_prompt: "summarize order volume".to_string(),
        }
    }

    #[test]
    fn incomplete_legacy_config_degrades_to_defaults() {
        let spec = parse_schedule("weekly", Some(r#"{"hour": 14}"#));
        assert_eq!(
            spec,
            ScheduleSpec::Weekly {
                day_of_week: DayOfWeek::Mon,
                hour: 14,
                minute: 0
            }
        );

        let spec = parse_schedule("monthly", None);
        assert_eq!(
            spec,
            ScheduleSpec::Monthly {
                day_of_month: 1,
                hour: 9,
                minute: 0
            }
        );
    }

    #[test]
    fn unknown_schedule_type_reads_as_once() {
        assert_eq!(parse_schedule("hourly", None), ScheduleSpec::Once);
    }

    #[test]
    fn schedule_config_round_trips() {
        let db = Database::in_memory().expect("db");
        let report = db.create_report("user-1", &definition("Revenue")).expect("create");

        let spec = ScheduleSpec::Monthly {
            day_of_month: 31,
            hour: 8,
            minute: 30,
        };
        let updated = db
            .update_report_schedule(&report.id, &spec, None)
            .expect("update schedule")
            .expect("report exists");
        assert_eq!(updated.schedule, spec);
    }

    #[test]
    fn terminal_runs_are_never_rewritten() {
        let db = Database::in_memory().expect("db");
        let report = db.create_report("user-1", &definition("Revenue")).expect("create");
        let run = db.insert_run(&report.id, TriggerType::Manual).expect("insert run");

        assert!(db.mark_run_running(&run.id).expect("mark running"));
        let completed = RunOutcome {
            result_markdown: Some("# done".to_string()),
            ..RunOutcome::default()
        };
        assert!(db.finish_run(&run.id, RunStatus::Completed, 42, &completed).expect("finish"));

        // A second terminal write must be a no-op.
        let overwrite = RunOutcome {
            error_message: Some("late failure".to_string()),
            ..RunOutcome::default()
        };
        assert!(!db.finish_run(&run.id, RunStatus::Failed, 99, &overwrite).expect("finish again"));

        let stored = db.get_run(&run.id).expect("get run").expect("exists");
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.result_markdown.as_deref(), Some("# done"));
        assert!(stored.error_message.is_none());
    }

    #[test]
    fn deleting_a_report_cascades_to_its_runs() {
        let db = Database::in_memory().expect("db");
        let report = db.create_report("user-1", &definition("Revenue")).expect("create");
        let run = db.insert_run(&report.id, TriggerType::Manual).expect("insert run");

        assert!(db.delete_report(&report.id).expect("delete report"));
        assert!(db.get_run(&run.id).expect("get run").is_none());
    }

    #[test]
    fn deleting_a_published_report_cascades_links_in_both_directions() {
        let db = Database::in_memory().expect("db");
        let a = db
            .insert_published_report("r1", "alpha", "Alpha", None, "Alpha", "secretAAA")
            .expect("publish a");
        let b = db
            .insert_published_report("r2", "beta", "Beta", None, "Beta", "secretBBB")
            .expect("publish b");
        let c = db
            .insert_published_report("r3", "gamma", "Gamma", None, "Gamma", "secretCCC")
            .expect("publish c");

        db.insert_link(&a.id, &b.id, None).expect("a -> b");
        db.insert_link(&c.id, &a.id, None).expect("c -> a");

        assert!(db.delete_published_report(&a.id).expect("delete a"));
        assert!(db.list_links(&a.id).expect("links of a").is_empty());
        assert!(db.list_links(&c.id).expect("links of c").is_empty());
    }

    #[test]
    fn orphaned_runs_are_failed_on_startup() {
        let db = Database::in_memory().expect("db");
        let report = db.create_report("user-1", &definition("Revenue")).expect("create");
        let run = db.insert_run(&report.id, TriggerType::Scheduled).expect("insert run");
        db.mark_run_running(&run.id).expect("mark running");

        let repaired = db.mark_orphan_runs_failed().expect("repair");
        assert_eq!(repaired, 1);

        let stored = db.get_run(&run.id).expect("get run").expect("exists");
        assert_eq!(stored.status, RunStatus::Failed);
        assert!(stored.error_message.is_some());
    }

    #[test]
    fn settings_update_merges_partial_json() {
        let db = Database::in_memory().expect("db");
        let updated = db
            .update_settings(serde_json::json!({ "utcOffsetMinutes": 330 }))
            .expect("update settings");
        assert_eq!(updated.utc_offset_minutes, 330);
        // Untouched fields keep their defaults.
        assert_eq!(updated.max_parallel_runs, 4);

        let reread = db.get_settings().expect("get settings");
        assert_eq!(reread.utc_offset_minutes, 330);
    }
}
