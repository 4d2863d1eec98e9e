//! Seam to the external query/narrative collaborators. The engine hands an
//! executor a report definition and records whatever comes back on the run.

use crate::errors::CoreResult;
use crate::models::{QueryExecution, ReportDefinition};
use std::future::Future;
use std::pin::Pin;

/// Outcome of executing a report's queries and narrative generation.
///
/// Per-query failures live inside `queries_executed`; `error_message` is set
/// only when the executor failed as a whole. A run with failed queries but no
/// aggregate error still completes.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub result_markdown: Option<String>,
    pub result_data: Option<serde_json::Value>,
    pub queries_executed: Vec<QueryExecution>,
    /// Exact prompt sent to the narrative collaborator, retained for audit.
    pub llm_prompt: Option<String>,
    pub error_message: Option<String>,
}

pub type ExecuteFuture = Pin<Box<dyn Future<Output = CoreResult<RunOutcome>> + Send>>;

pub trait RunExecutor: Send + Sync {
    fn execute(&self, definition: ReportDefinition) -> ExecuteFuture;
}

impl<F> RunExecutor for F
where
    F: Fn(ReportDefinition) -> ExecuteFuture + Send + Sync,
{
    fn execute(&self, definition: ReportDefinition) -> ExecuteFuture {
        (self)(definition)
    }
}
