use std::time::Duration;

use async_trait::async_trait;
use rmcp::RoleServer;
use rmcp::model::{CreateElicitationRequestParams, ElicitationAction, ElicitationSchema};
use rmcp::service::Peer;
use serde_json::Value;

use crate::error::BosunError;

/// Default bound on how long we wait for the user to answer.
pub const DEFAULT_ELICITATION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElicitAction {
    Accept,
    Decline,
    Cancel,
}

impl ElicitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Decline => "decline",
            Self::Cancel => "cancel",
        }
    }
}

/// The user's answer, returned verbatim for the safety evaluator to
/// incorporate.
#[derive(Debug, Clone)]
pub struct ElicitAnswer {
    pub action: ElicitAction,
    pub content: Option<Value>,
}

impl ElicitAnswer {
    pub fn approved(&self) -> bool {
        self.action == ElicitAction::Accept
            && self
                .content
                .as_ref()
                .and_then(|c| c.get("approve"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    pub fn reason(&self) -> Option<String> {
        self.content
            .as_ref()
            .and_then(|c| c.get("reason"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// The user-confirmation channel. The production impl issues an MCP
/// `elicitation/create` reverse request through the connected peer.
#[async_trait]
pub trait Elicitor: Send + Sync {
    async fn ask(&self, question: &str, timeout: Duration) -> Result<ElicitAnswer, BosunError>;
}

pub struct PeerElicitor {
    peer: Peer<RoleServer>,
}

impl PeerElicitor {
    pub fn new(peer: Peer<RoleServer>) -> Self {
        Self { peer }
    }
}

#[async_trait]
impl Elicitor for PeerElicitor {
    async fn ask(&self, question: &str, timeout: Duration) -> Result<ElicitAnswer, BosunError> {
        let schema = ElicitationSchema::builder()
            .required_bool("approve")
            .optional_string("reason")
            .build()
            .map_err(|e| {
                BosunError::ElicitationUnavailable(format!("schema construction failed: {e}"))
            })?;

        let request = self
            .peer
            .create_elicitation(CreateElicitationRequestParams::FormElicitationParams {
                meta: None,
                message: question.to_string(),
                requested_schema: schema,
            });

        let result = match tokio::time::timeout(timeout, request).await {
            // Expiry is equivalent to the user cancelling.
            Err(_) => {
                tracing::info!(timeout_secs = timeout.as_secs(), "elicitation timed out");
                return Ok(ElicitAnswer {
                    action: ElicitAction::Cancel,
                    content: None,
                });
            }
            Ok(Err(e)) => {
                return Err(BosunError::ElicitationUnavailable(format!(
                    "elicitation transport failed: {e}"
                )));
            }
            Ok(Ok(result)) => result,
        };

        let content = result.content;
        let action = match result.action {
            ElicitationAction::Accept if content.is_none() => {
                // Accept without payload cannot be interpreted; treat it as a
                // decline rather than inventing an answer.
                ElicitAction::Decline
            }
            ElicitationAction::Accept => ElicitAction::Accept,
            ElicitationAction::Decline => ElicitAction::Decline,
            ElicitationAction::Cancel => ElicitAction::Cancel,
        };

        Ok(ElicitAnswer { action, content })
    }
}
