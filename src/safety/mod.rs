pub mod decision;
pub mod elicit;
pub mod evaluator;
pub mod parse;
pub mod patterns;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;

use crate::error::BosunError;
use crate::history::{HistoryEntry, HistoryLog};

use decision::{SafetyDecision, Verdict};
use elicit::{ElicitAnswer, Elicitor};
use evaluator::{EvaluationRequest, EvaluationStage, SamplingClient};

const INITIAL_HISTORY_DEPTH: usize = 10;
const MAX_HISTORY_DEPTH: usize = 50;
const SIMILAR_HISTORY_LIMIT: usize = 5;
/// Hard bound on LLM re-evaluations per original request.
const MAX_REEVALUATIONS: usize = 2;

static CONFIRM_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Final admission outcome for one command.
#[derive(Debug)]
pub enum SafetyOutcome {
    Admitted(SafetyDecision),
    Refused(SafetyDecision),
    /// The calling assistant must supply more context; nothing was admitted.
    AssistantConfirmRequired(SafetyDecision),
}

/// Transport-backed channels for one request. Built per call from the MCP
/// peer; absent when the client lacks the capability.
pub struct SafetyChannels<'a> {
    pub sampling: Option<&'a dyn SamplingClient>,
    pub elicitor: Option<&'a dyn Elicitor>,
}

/// Orchestrates pattern scanning, LLM evaluation, and user elicitation into
/// a single admission decision. Owns nothing mutable beyond the history
/// handle it shares with the process manager.
pub struct SafetyEvaluator {
    history: Arc<HistoryLog>,
    llm_enabled: bool,
    elicitation_enabled: bool,
    elicitation_timeout: Duration,
}

impl SafetyEvaluator {
    pub fn new(
        history: Arc<HistoryLog>,
        llm_enabled: bool,
        elicitation_enabled: bool,
        elicitation_timeout: Duration,
    ) -> Self {
        Self {
            history,
            llm_enabled,
            elicitation_enabled,
            elicitation_timeout,
        }
    }

    /// Decide whether `command` may run. Every refusal is recorded in the
    /// history log; admissions are recorded by the process manager when the
    /// execution record finalizes.
    pub async fn assess(
        &self,
        command: &str,
        working_directory: &str,
        comment: Option<&str>,
        channels: &SafetyChannels<'_>,
    ) -> Result<SafetyOutcome, BosunError> {
        let tags = patterns::scan(command);

        let sampling = if self.llm_enabled {
            channels.sampling
        } else {
            None
        };

        let Some(client) = sampling else {
            return Ok(self.pattern_only(command, working_directory, &tags));
        };

        // LLM-enabled mode: scanner output is advisory context.
        let mut history_depth = INITIAL_HISTORY_DEPTH;
        let mut search_keywords: Option<Vec<String>> = None;
        let mut stage = EvaluationStage::Initial;
        let mut user_answer: Option<ElicitAnswer> = None;
        let mut reevaluations = 0usize;

        loop {
            let history = self.gather_history(command, history_depth, search_keywords.as_deref());
            let answer_text = user_answer.as_ref().map(answer_summary);
            let req = EvaluationRequest {
                command,
                working_directory,
                history: &history,
                detected_patterns: &tags,
                comment,
                stage,
                user_answer: answer_text.as_deref(),
            };
            let decision = evaluator::evaluate(client, &req).await;

            match decision.verdict {
                Verdict::Allow => return Ok(SafetyOutcome::Admitted(decision)),
                Verdict::Deny => {
                    self.record_refusal(command, working_directory, &tags, &decision);
                    return Ok(SafetyOutcome::Refused(decision));
                }
                Verdict::NeedAssistantConfirm => {
                    return Ok(SafetyOutcome::AssistantConfirmRequired(decision));
                }
                Verdict::NeedMoreHistory => {
                    if reevaluations >= MAX_REEVALUATIONS {
                        return Ok(self.conservative_refusal(command, working_directory, &tags, decision));
                    }
                    reevaluations += 1;
                    let required = decision.required_context.as_ref();
                    history_depth = required
                        .and_then(|c| c.history_depth)
                        .map(|d| d as usize)
                        .unwrap_or(MAX_HISTORY_DEPTH)
                        .clamp(history_depth, MAX_HISTORY_DEPTH);
                    search_keywords = required.and_then(|c| c.search_keywords.clone());
                    stage = EvaluationStage::ReevaluateWithAdditionalContext;
                }
                Verdict::NeedUserConfirm => {
                    if reevaluations >= MAX_REEVALUATIONS {
                        return Ok(self.conservative_refusal(command, working_directory, &tags, decision));
                    }
                    let answer = self
                        .confirm_with_user(command, working_directory, channels, &decision)
                        .await?;
                    if !answer.approved() {
                        let mut refused = decision;
                        refused.verdict = Verdict::Deny;
                        refused.reasoning = format!(
                            "user {} the confirmation request",
                            answer.action.as_str()
                        );
                        self.record_refusal(command, working_directory, &tags, &refused);
                        return Ok(SafetyOutcome::Refused(refused));
                    }
                    reevaluations += 1;
                    user_answer = Some(answer);
                    stage = EvaluationStage::ReevaluateWithUserIntent;
                }
            }
        }
    }

    /// Context slice for one evaluation round: recent entries, similar past
    /// commands, and (on re-evaluation) keyword-matched history, deduplicated
    /// by entry id.
    fn gather_history(
        &self,
        command: &str,
        depth: usize,
        keywords: Option<&[String]>,
    ) -> Vec<HistoryEntry> {
        let mut entries = self.history.recent(depth);
        let mut extra = self.history.find_similar(command, SIMILAR_HISTORY_LIMIT);
        if let Some(keywords) = keywords {
            extra.extend(self.history.search(depth, Some(keywords), None));
        }
        for entry in extra {
            if !entries.iter().any(|e| {
                e.execution_id == entry.execution_id && e.timestamp == entry.timestamp
            }) {
                entries.push(entry);
            }
        }
        entries
    }

    /// Pattern-only policy: a non-empty scan is a hard refuse.
    fn pattern_only(
        &self,
        command: &str,
        working_directory: &str,
        tags: &[&'static str],
    ) -> SafetyOutcome {
        if tags.is_empty() {
            return SafetyOutcome::Admitted(SafetyDecision::new(
                Verdict::Allow,
                "no dangerous patterns matched",
                1.0,
            ));
        }
        let decision = SafetyDecision {
            verdict: Verdict::Deny,
            reasoning: format!("command matched dangerous patterns: {}", tags.join(", ")),
            confidence: 1.0,
            risk_factors: Vec::new(),
            suggested_alternatives: Vec::new(),
            required_context: None,
            warnings: Vec::new(),
        };
        self.record_refusal(command, working_directory, tags, &decision);
        SafetyOutcome::Refused(decision)
    }

    async fn confirm_with_user(
        &self,
        command: &str,
        working_directory: &str,
        channels: &SafetyChannels<'_>,
        decision: &SafetyDecision,
    ) -> Result<ElicitAnswer, BosunError> {
        if !self.elicitation_enabled {
            return Err(BosunError::ElicitationUnavailable(
                "elicitation disabled by configuration".to_string(),
            ));
        }
        let Some(elicitor) = channels.elicitor else {
            return Err(BosunError::ElicitationUnavailable(
                "client does not support elicitation".to_string(),
            ));
        };

        let question = decision
            .required_context
            .as_ref()
            .and_then(|c| c.user_intent_question.clone())
            .unwrap_or_else(|| format!("Allow this command to run?\n\n  {command}"));

        let answer = elicitor.ask(&question, self.elicitation_timeout).await?;

        // Synthetic confirmation entry, correlated by a counter id.
        let seq = CONFIRM_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.history.append(HistoryEntry {
            execution_id: format!("confirm_{seq}"),
            command: format!("[user confirmation] {command}"),
            working_directory: working_directory.to_string(),
            timestamp: Utc::now(),
            executed: false,
            classification: None,
            decision: Some(answer.action.as_str().to_string()),
            output_summary: answer.reason(),
        });

        Ok(answer)
    }

    fn conservative_refusal(
        &self,
        command: &str,
        working_directory: &str,
        tags: &[&'static str],
        last: SafetyDecision,
    ) -> SafetyOutcome {
        let decision = SafetyDecision {
            verdict: Verdict::Deny,
            reasoning: format!(
                "evaluation loop exhausted without a definitive verdict (last: {}); refusing conservatively",
                last.verdict.as_str()
            ),
            confidence: 1.0,
            risk_factors: last.risk_factors,
            suggested_alternatives: last.suggested_alternatives,
            required_context: None,
            warnings: last.warnings,
        };
        self.record_refusal(command, working_directory, tags, &decision);
        SafetyOutcome::Refused(decision)
    }

    fn record_refusal(
        &self,
        command: &str,
        working_directory: &str,
        tags: &[&'static str],
        decision: &SafetyDecision,
    ) {
        let seq = CONFIRM_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.history.append(HistoryEntry {
            execution_id: format!("refused_{seq}"),
            command: command.to_string(),
            working_directory: working_directory.to_string(),
            timestamp: Utc::now(),
            executed: false,
            classification: (!tags.is_empty()).then(|| tags.join(",")),
            decision: Some("deny".to_string()),
            output_summary: Some(decision.reasoning.clone()),
        });
    }
}

fn answer_summary(answer: &ElicitAnswer) -> String {
    match answer.reason() {
        Some(reason) => format!("{} — {}", answer.action.as_str(), reason),
        None => answer.action.as_str().to_string(),
    }
}

/// Build the structured refusal payload returned to callers (reasoning plus
/// suggested alternatives).
pub fn refusal_payload(decision: &SafetyDecision) -> serde_json::Value {
    serde_json::json!({
        "status": "refused",
        "kind": "safety_refusal",
        "reasoning": decision.reasoning,
        "suggested_alternatives": decision.suggested_alternatives,
        "risk_factors": decision.risk_factors,
        "warnings": decision.warnings,
    })
}
