use async_trait::async_trait;
use rmcp::RoleServer;
use rmcp::model::{
    CreateMessageRequestParams, Role, SamplingContent, SamplingMessage, SamplingMessageContent,
};
use rmcp::service::Peer;

use crate::error::BosunError;
use crate::history::HistoryEntry;

use super::decision::{SafetyDecision, Verdict};
use super::parse::parse_decision;

/// Placeholder the model is told to use in place of the literal command
/// inside its reasoning, so shell metacharacters never collide with JSON
/// escaping. Substituted back after parsing.
pub const COMMAND_PLACEHOLDER: &str = "{{COMMAND}}";

const MAX_RESPONSE_TOKENS: u32 = 1024;
const LOW_DENY_CONFIDENCE: f64 = 0.6;

/// Message exchange with the evaluating model. The production impl speaks
/// MCP sampling through the connected peer; tests substitute scripted fakes.
#[async_trait]
pub trait SamplingClient: Send + Sync {
    async fn create_message(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> Result<String, BosunError>;
}

/// Sampling over the MCP peer that issued the current request.
pub struct PeerSampling {
    peer: Peer<RoleServer>,
}

impl PeerSampling {
    pub fn new(peer: Peer<RoleServer>) -> Self {
        Self { peer }
    }
}

#[async_trait]
impl SamplingClient for PeerSampling {
    async fn create_message(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> Result<String, BosunError> {
        let result = self
            .peer
            .create_message(CreateMessageRequestParams {
                meta: None,
                task: None,
                messages: vec![SamplingMessage {
                    role: Role::User,
                    content: SamplingContent::Single(SamplingMessageContent::text(user_prompt)),
                    meta: None,
                }],
                model_preferences: None,
                system_prompt: Some(system_prompt.to_string()),
                include_context: None,
                temperature: None,
                max_tokens,
                stop_sequences: None,
                metadata: None,
                tools: None,
                tool_choice: None,
            })
            .await
            .map_err(|e| BosunError::ExecutionFailure(format!("sampling request failed: {e}")))?;

        result
            .message
            .content
            .into_vec()
            .into_iter()
            .find_map(|c| c.as_text().map(|t| t.text.clone()))
            .ok_or_else(|| {
                BosunError::ExecutionFailure("sampling reply carried no text content".to_string())
            })
    }
}

/// Which round of the decision pipeline this evaluation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationStage {
    Initial,
    ReevaluateWithUserIntent,
    ReevaluateWithAdditionalContext,
}

impl EvaluationStage {
    fn label(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::ReevaluateWithUserIntent => "reevaluate_with_user_intent",
            Self::ReevaluateWithAdditionalContext => "reevaluate_with_additional_context",
        }
    }
}

pub struct EvaluationRequest<'a> {
    pub command: &'a str,
    pub working_directory: &'a str,
    pub history: &'a [HistoryEntry],
    pub detected_patterns: &'a [&'static str],
    pub comment: Option<&'a str>,
    pub stage: EvaluationStage,
    /// The user's elicitation answer, present on user-intent re-evaluation.
    pub user_answer: Option<&'a str>,
}

const SYSTEM_PROMPT: &str = r#"You are a command-safety evaluator for a shell execution gateway.
Given a shell command and its context, decide whether it is safe to run.

Respond with a single JSON object and nothing else. Schema:
{
  "verdict": "ALLOW" | "DENY" | "NEED_MORE_HISTORY" | "NEED_USER_CONFIRM" | "NEED_ASSISTANT_CONFIRM",
  "reasoning": string,
  "risk_factors": [{"severity": "low"|"medium"|"high"|"critical", "description": string}],
  "suggested_alternatives": [string],
  "required_context": {
    "history_depth": integer,
    "execution_results": integer,
    "search_keywords": [string],
    "user_intent_question": string,
    "assistant_request": string
  }
}

Rules:
- When you mention the command in "reasoning", write the token {{COMMAND}} instead
  of the command text itself.
- Use NEED_MORE_HISTORY when earlier commands would change the verdict; set
  required_context.history_depth.
- Use NEED_USER_CONFIRM for destructive or ambiguous commands; set
  required_context.user_intent_question to the question the user must answer.
- Use NEED_ASSISTANT_CONFIRM when the calling assistant must supply missing
  context; set required_context.assistant_request.
- ALLOW must not be combined with a critical risk factor.
- Output only the JSON object. No prose, no code fences."#;

/// One evaluation round: build the prompt, exchange messages, parse, then
/// post-validate.
pub async fn evaluate(
    client: &dyn SamplingClient,
    req: &EvaluationRequest<'_>,
) -> SafetyDecision {
    let user_prompt = build_user_prompt(req);

    let raw = match client
        .create_message(SYSTEM_PROMPT, &user_prompt, MAX_RESPONSE_TOKENS)
        .await
    {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(stage = req.stage.label(), "evaluator exchange failed: {e}");
            return SafetyDecision::new(
                Verdict::NeedUserConfirm,
                format!("safety evaluator unavailable ({}); requiring user confirmation", e.kind()),
                0.3,
            );
        }
    };

    let mut decision = parse_decision(&raw);
    decision.reasoning = decision.reasoning.replace(COMMAND_PLACEHOLDER, req.command);
    post_validate(&mut decision);
    tracing::debug!(
        stage = req.stage.label(),
        verdict = decision.verdict.as_str(),
        confidence = decision.confidence,
        "safety evaluation round complete"
    );
    decision
}

fn build_user_prompt(req: &EvaluationRequest<'_>) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(&format!("Stage: {}\n", req.stage.label()));
    prompt.push_str(&format!("Command: {}\n", req.command));
    prompt.push_str(&format!("Working directory: {}\n", req.working_directory));

    if req.detected_patterns.is_empty() {
        prompt.push_str("Pattern scanner: no dangerous patterns matched\n");
    } else {
        prompt.push_str(&format!(
            "Pattern scanner matched: {}\n",
            req.detected_patterns.join(", ")
        ));
    }

    if let Some(comment) = req.comment {
        prompt.push_str(&format!("Caller comment: {comment}\n"));
    }
    if let Some(answer) = req.user_answer {
        prompt.push_str(&format!("User's answer to the confirmation question: {answer}\n"));
    }

    if req.history.is_empty() {
        prompt.push_str("Recent history: (empty)\n");
    } else {
        prompt.push_str("Recent history (newest first):\n");
        for entry in req.history {
            prompt.push_str(&format!(
                "- [{}] {} (executed={}, decision={})\n",
                entry.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
                entry.command,
                entry.executed,
                entry.decision.as_deref().unwrap_or("-"),
            ));
        }
    }

    prompt
}

/// Consistency checks on top of schema validation. An ALLOW carrying a
/// critical risk factor is downgraded; a low-confidence DENY stands but gets
/// a warning attached.
fn post_validate(decision: &mut SafetyDecision) {
    if decision.verdict == Verdict::Allow && decision.has_critical_risk() {
        decision.warnings.push(
            "verdict ALLOW carried a critical risk factor; downgraded to NEED_USER_CONFIRM"
                .to_string(),
        );
        decision.verdict = Verdict::NeedUserConfirm;
        if decision
            .required_context
            .as_ref()
            .and_then(|c| c.user_intent_question.as_ref())
            .is_none()
        {
            decision.required_context = Some(super::decision::RequiredContext {
                user_intent_question: Some(
                    "The evaluator flagged a critical risk. Run this command anyway?".to_string(),
                ),
                ..Default::default()
            });
        }
    }

    if decision.verdict == Verdict::Deny && decision.confidence < LOW_DENY_CONFIDENCE {
        decision
            .warnings
            .push("DENY verdict with low confidence".to_string());
    }
}
