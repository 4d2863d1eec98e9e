use crate::errors::{CoreError, CoreResult};
use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportStatus {
    Draft,
    Active,
    Paused,
    Error,
}

impl ReportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleType {
    Once,
    Daily,
    Weekly,
    Monthly,
}

impl ScheduleType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mon => "mon",
            Self::Tue => "tue",
            Self::Wed => "wed",
            Self::Thu => "thu",
            Self::Fri => "fri",
            Self::Sat => "sat",
            Self::Sun => "sun",
        }
    }

    pub fn weekday(self) -> Weekday {
        match self {
            Self::Mon => Weekday::Mon,
            Self::Tue => Weekday::Tue,
            Self::Wed => Weekday::Wed,
            Self::Thu => Weekday::Thu,
            Self::Fri => Weekday::Fri,
            Self::Sat => Weekday::Sat,
            Self::Sun => Weekday::Sun,
        }
    }
}

/// Schedule configuration keyed by schedule type. Field combinations that
/// make no sense for a given type are unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ScheduleSpec {
    Once,
    Daily {
        hour: u32,
        minute: u32,
    },
    Weekly {
        day_of_week: DayOfWeek,
        hour: u32,
        minute: u32,
    },
    Monthly {
        day_of_month: u32,
        hour: u32,
        minute: u32,
    },
}

impl ScheduleSpec {
    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            Self::Once => ScheduleType::Once,
            Self::Daily { .. } => ScheduleType::Daily,
            Self::Weekly { .. } => ScheduleType::Weekly,
            Self::Monthly { .. } => ScheduleType::Monthly,
        }
    }
}

/// Loose schedule fields as they arrive from a client. Validated into a
/// `ScheduleSpec` before anything is stored; an unspecified minute
/// legitimately defaults to 0, everything else the type requires must be
/// present.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfigPayload {
    pub hour: Option<u32>,
    pub minute: Option<u32>,
    pub day_of_week: Option<DayOfWeek>,
    pub day_of_month: Option<u32>,
}

impl ScheduleConfigPayload {
    pub fn into_spec(self, schedule_type: ScheduleType) -> CoreResult<ScheduleSpec> {
        let minute = self.minute.unwrap_or(0);
        if minute > 59 {
            return Err(CoreError::Validation(format!(
                "minute {} is out of range (0-59)",
                minute
            )));
        }

        match schedule_type {
            ScheduleType::Once => Ok(ScheduleSpec::Once),
            ScheduleType::Daily => Ok(ScheduleSpec::Daily {
                hour: required_hour(self.hour, schedule_type)?,
                minute,
            }),
            ScheduleType::Weekly => {
                let day_of_week = self.day_of_week.ok_or_else(|| {
                    CoreError::Validation("weekly schedule requires a day of week".to_string())
                })?;
                Ok(ScheduleSpec::Weekly {
                    day_of_week,
                    hour: required_hour(self.hour, schedule_type)?,
                    minute,
                })
            }
            ScheduleType::Monthly => {
                let day_of_month = self.day_of_month.ok_or_else(|| {
                    CoreError::Validation("monthly schedule requires a day of month".to_string())
                })?;
                if !(1..=31).contains(&day_of_month) {
                    return Err(CoreError::Validation(format!(
                        "day of month {} is out of range (1-31)",
                        day_of_month
                    )));
                }
                Ok(ScheduleSpec::Monthly {
                    day_of_month,
                    hour: required_hour(self.hour, schedule_type)?,
                    minute,
                })
            }
        }
    }
}

fn required_hour(hour: Option<u32>, schedule_type: ScheduleType) -> CoreResult<u32> {
    let hour = hour.ok_or_else(|| {
        CoreError::Validation(format!(
            "schedule type '{}' requires an hour",
            schedule_type.as_str()
        ))
    })?;
    if hour > 23 {
        return Err(CoreError::Validation(format!(
            "hour {} is out of range (0-23)",
            hour
        )));
    }
    Ok(hour)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlQuery {
    pub purpose: String,
    pub query: String,
}

/// The authorable core of a report: what a completed conversation session
/// yields and what the run executor consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDefinition {
    pub title: String,
    pub description: String,
    pub sql_queries: Vec<SqlQuery>,
    pub user_prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub description: String,
    pub status: ReportStatus,
    pub schedule: ScheduleSpec,
    pub sql_queries: Vec<SqlQuery>,
    pub user_prompt: String,
    pub is_pinned: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Report {
    pub fn definition(&self) -> ReportDefinition {
        ReportDefinition {
            title: self.title.clone(),
            description: self.description.clone(),
            sql_queries: self.sql_queries.clone(),
            user_prompt: self.user_prompt.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerType {
    Manual,
    Scheduled,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
        }
    }
}

/// Per-query execution record. One entry may carry an error while its
/// siblings succeed; the run's own status reflects the aggregate outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryExecution {
    pub purpose: String,
    pub query: String,
    pub row_count: Option<u64>,
    pub elapsed_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRun {
    pub id: String,
    pub report_id: String,
    pub status: RunStatus,
    pub trigger_type: TriggerType,
    pub created_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub queries_executed: Vec<QueryExecution>,
    pub result_markdown: Option<String>,
    pub result_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub llm_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedReport {
    pub id: String,
    pub report_id: String,
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    /// Title the source report had at publish time, regardless of any
    /// title supplied for the published artifact.
    pub source_title: String,
    pub password: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedReportLink {
    pub id: String,
    pub published_report_id: String,
    pub target_published_report_id: String,
    pub label: Option<String>,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Open,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSession {
    pub id: String,
    pub turns: Vec<ConversationTurn>,
    pub state: SessionState,
    /// Present once the assistant signals completion; ready to be persisted
    /// as a report.
    pub preview: Option<ReportDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSchedulePayload {
    pub schedule_type: ScheduleType,
    pub schedule_config: Option<ScheduleConfigPayload>,
    pub status: Option<ReportStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListReportsFilters {
    pub owner_id: Option<String>,
    pub status: Option<ReportStatus>,
    pub pinned_only: Option<bool>,
    pub search: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSettings {
    /// Minutes east of UTC for the schedule reference timezone.
    pub utc_offset_minutes: i32,
    pub executor_timeout_ms: u64,
    pub max_parallel_runs: usize,
    pub max_queue_size: usize,
    pub secret_length: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            executor_timeout_ms: 300_000,
            max_parallel_runs: 4,
            max_queue_size: 256,
            secret_length: 12,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ScheduleConfigPayload, ScheduleSpec, ScheduleType};

    #[test]
    fn daily_minute_defaults_to_zero() {
        let spec = ScheduleConfigPayload {
            hour: Some(7),
            ..ScheduleConfigPayload::default()
        }
        .into_spec(ScheduleType::Daily)
        .expect("valid daily spec");
        assert_eq!(spec, ScheduleSpec::Daily { hour: 7, minute: 0 });
    }

    #[test]
    fn daily_without_hour_is_rejected() {
        let err = ScheduleConfigPayload::default()
            .into_spec(ScheduleType::Daily)
            .expect_err("hour is required");
        assert!(err.to_string().contains("requires an hour"));
    }

    #[test]
    fn weekly_requires_day_of_week() {
        let err = ScheduleConfigPayload {
            hour: Some(9),
            ..ScheduleConfigPayload::default()
        }
        .into_spec(ScheduleType::Weekly)
        .expect_err("day of week is required");
        assert!(err.to_string().contains("day of week"));
    }

    #[test]
    fn monthly_day_out_of_range_is_rejected() {
        let err = ScheduleConfigPayload {
            hour: Some(9),
            day_of_month: Some(32),
            ..ScheduleConfigPayload::default()
        }
        .into_spec(ScheduleType::Monthly)
        .expect_err("day 32 is invalid");
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn once_ignores_extra_fields() {
        let spec = ScheduleConfigPayload {
            hour: Some(9),
            minute: Some(30),
            ..ScheduleConfigPayload::default()
        }
        .into_spec(ScheduleType::Once)
        .expect("once is always valid");
        assert_eq!(spec, ScheduleSpec::Once);
    }
}
