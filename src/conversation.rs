//! Authoring dialogues. A session accumulates turns until the assistant
//! collaborator signals completion, at which point it carries a report
//! definition ready to be persisted. Sessions live only as long as the
//! dialogue; saving the definition as a report supersedes them.

use crate::errors::{CoreError, CoreResult};
use crate::models::{ConversationSession, ConversationTurn, ReportDefinition, SessionState, TurnRole};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// What the assistant collaborator returns for one exchange.
#[derive(Debug, Clone)]
pub struct AssistantReply {
    pub reply_text: String,
    pub is_complete: bool,
    pub report_preview: Option<ReportDefinition>,
}

pub type ConverseFuture = Pin<Box<dyn Future<Output = CoreResult<AssistantReply>> + Send>>;

pub trait Assistant: Send + Sync {
    fn converse(&self, history: Vec<ConversationTurn>) -> ConverseFuture;
}

impl<F> Assistant for F
where
    F: Fn(Vec<ConversationTurn>) -> ConverseFuture + Send + Sync,
{
    fn converse(&self, history: Vec<ConversationTurn>) -> ConverseFuture {
        (self)(history)
    }
}

/// Result of one `send_message` call, for the caller to render.
#[derive(Debug, Clone)]
pub struct SessionUpdate {
    pub session_id: String,
    pub reply_text: String,
    pub is_complete: bool,
    pub report_preview: Option<ReportDefinition>,
}

#[derive(Clone)]
pub struct SessionManager {
    assistant: Arc<dyn Assistant>,
    sessions: Arc<Mutex<HashMap<String, ConversationSession>>>,
    assistant_timeout: Duration,
}

impl SessionManager {
    pub fn new(assistant: Arc<dyn Assistant>, assistant_timeout: Duration) -> Self {
        Self {
            assistant,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            assistant_timeout,
        }
    }

    /// Sends a user message, creating a session when `session_id` is absent.
    ///
    /// The user's turn is recorded before the assistant is invoked; if the
    /// assistant fails or times out the session keeps that turn and nothing
    /// else, and the call can simply be retried.
    pub async fn send_message(
        &self,
        session_id: Option<&str>,
        message: &str,
    ) -> CoreResult<SessionUpdate> {
        if message.trim().is_empty() {
            return Err(CoreError::Validation("message cannot be empty".to_string()));
        }

        let (session_id, history) = {
            let mut sessions = self.sessions.lock().await;
            let session = match session_id {
                Some(id) => sessions.get_mut(id).ok_or_else(|| {
                    CoreError::NotFound(format!("conversation session {} not found", id))
                })?,
                None => {
                    let id = Uuid::new_v4().to_string();
                    sessions.entry(id.clone()).or_insert(ConversationSession {
                        id,
                        turns: Vec::new(),
                        state: SessionState::Open,
                        preview: None,
                    })
                }
            };
            if session.state == SessionState::Complete {
                return Err(CoreError::Validation(
                    "conversation session is complete; start a new session to keep authoring"
                        .to_string(),
                ));
            }
            session.turns.push(ConversationTurn {
                role: TurnRole::User,
                content: message.to_string(),
            });
            (session.id.clone(), session.turns.clone())
        };

        let reply = match timeout(self.assistant_timeout, self.assistant.converse(history)).await {
            Err(_) => {
                return Err(CoreError::Execution(format!(
                    "assistant did not respond within {} ms",
                    self.assistant_timeout.as_millis()
                )))
            }
            Ok(Err(error)) => {
                tracing::warn!(session_id = %session_id, error = %error, "assistant call failed");
                return Err(CoreError::Execution(error.to_string()));
            }
            Ok(Ok(reply)) => reply,
        };

        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&session_id).ok_or_else(|| {
            CoreError::NotFound(format!("conversation session {} not found", session_id))
        })?;
        session.turns.push(ConversationTurn {
            role: TurnRole::Assistant,
            content: reply.reply_text.clone(),
        });
        if reply.is_complete {
            session.state = SessionState::Complete;
            session.preview = reply.report_preview.clone();
        }

        Ok(SessionUpdate {
            session_id,
            reply_text: reply.reply_text,
            is_complete: reply.is_complete,
            report_preview: reply.report_preview,
        })
    }

    pub async fn get_session(&self, session_id: &str) -> Option<ConversationSession> {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).cloned()
    }

    pub async fn discard_session(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::{Assistant, AssistantReply, ConverseFuture, SessionManager};
    use crate::errors::CoreError;
    use crate::models::{ConversationTurn, ReportDefinition, SessionState, SqlQuery, TurnRole};
    use std::sync::Arc;
    use tokio::time::Duration;

    fn scripted(replies: Vec<AssistantReply>) -> Arc<dyn Assistant> {
        let remaining = std::sync::Mutex::new(replies);
        Arc::new(move |_history: Vec<ConversationTurn>| -> ConverseFuture {
            let reply = remaining.lock().expect("replies lock").remove(0);
            Box::pin(async move { Ok(reply) })
        })
    }

    fn preview() -> ReportDefinition {
        ReportDefinition {
            title: "Weekly signups".to_string(),
            description: "Signup counts by channel".to_string(),
            sql_queries: vec![SqlQuery {
                purpose: "signup counts".to_string(),
                query: "SELECT channel, COUNT(*) FROM signups GROUP BY channel".to_string(),
            }],
            user_prompt: "weekly signups by channel".to_string(),
        }
    }

    #[tokio::test]
    async fn dialogue_runs_to_completion_and_locks() {
        let assistant = scripted(vec![
            AssistantReply {
                reply_text: "Which channels matter?".to_string(),
                is_complete: false,
                report_preview: None,
            },
            AssistantReply {
                reply_text: "Here is your report.".to_string(),
                is_complete: true,
                report_preview: Some(preview()),
            },
        ]);
        let manager = SessionManager::new(assistant, Duration::from_secs(5));

        let first = manager.send_message(None, "I want a signup report").await.expect("first send");
        assert!(!first.is_complete);

        let second = manager
            .send_message(Some(&first.session_id), "all channels")
            .await
            .expect("second send");
        assert!(second.is_complete);
        assert_eq!(
            second.report_preview.as_ref().map(|p| p.title.as_str()),
            Some("Weekly signups")
        );

        let session = manager.get_session(&first.session_id).await.expect("session exists");
        assert_eq!(session.state, SessionState::Complete);
        assert_eq!(session.turns.len(), 4);

        let err = manager
            .send_message(Some(&first.session_id), "one more thing")
            .await
            .expect_err("completed sessions are read-only");
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn assistant_failure_leaves_only_the_user_turn() {
        let assistant: Arc<dyn Assistant> =
            Arc::new(move |_history: Vec<ConversationTurn>| -> ConverseFuture {
                Box::pin(async { Err(CoreError::Execution("model unavailable".to_string())) })
            });
        let manager = SessionManager::new(assistant, Duration::from_secs(5));

        let opened = manager.send_message(None, "hello").await;
        let err = opened.expect_err("assistant failure surfaces");
        assert!(matches!(err, CoreError::Execution(_)));
    }

    #[tokio::test]
    async fn assistant_timeout_preserves_session_for_retry() {
        let assistant: Arc<dyn Assistant> =
            Arc::new(move |_history: Vec<ConversationTurn>| -> ConverseFuture {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(AssistantReply {
                        reply_text: "too late".to_string(),
                        is_complete: false,
                        report_preview: None,
                    })
                })
            });
        let manager = SessionManager::new(assistant, Duration::from_millis(20));

        let first = manager.send_message(None, "hello").await;
        assert!(matches!(first, Err(CoreError::Execution(_))));

        // The session (created by the failed call) holds exactly the user turn.
        let sessions = manager.sessions.lock().await;
        let session = sessions.values().next().expect("session was created");
        assert_eq!(session.turns.len(), 1);
        assert_eq!(session.turns[0].role, TurnRole::User);
        assert_eq!(session.state, SessionState::Open);
    }
}
