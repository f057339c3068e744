use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use bosun::error::BosunError;
use bosun::history::HistoryEntry;
use bosun::safety::decision::Verdict;
use bosun::safety::evaluator::{
    EvaluationRequest, EvaluationStage, SamplingClient, evaluate,
};

struct OneShot {
    reply: String,
    seen: Mutex<Option<(String, String)>>,
}

impl OneShot {
    fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            seen: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SamplingClient for OneShot {
    async fn create_message(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        _max_tokens: u32,
    ) -> Result<String, BosunError> {
        *self.seen.lock().unwrap() = Some((system_prompt.to_string(), user_prompt.to_string()));
        Ok(self.reply.clone())
    }
}

fn request<'a>(command: &'a str, history: &'a [HistoryEntry]) -> EvaluationRequest<'a> {
    EvaluationRequest {
        command,
        working_directory: "/work",
        history,
        detected_patterns: &[],
        comment: None,
        stage: EvaluationStage::Initial,
        user_answer: None,
    }
}

#[tokio::test]
async fn command_placeholder_is_substituted_in_reasoning() {
    let client = OneShot::new(
        r#"{"verdict": "DENY", "reasoning": "the command {{COMMAND}} deletes everything"}"#,
    );
    let history: [HistoryEntry; 0] = [];
    let decision = evaluate(&client, &request("rm -rf /data", &history)).await;
    assert_eq!(decision.reasoning, "the command rm -rf /data deletes everything");
}

#[tokio::test]
async fn allow_with_critical_risk_is_downgraded() {
    let client = OneShot::new(
        r#"{"verdict": "ALLOW", "reasoning": "fine", "risk_factors": [{"severity": "critical", "description": "wipes the disk"}]}"#,
    );
    let history: [HistoryEntry; 0] = [];
    let decision = evaluate(&client, &request("dd if=/dev/zero of=/dev/sda", &history)).await;
    assert_eq!(decision.verdict, Verdict::NeedUserConfirm);
    assert!(!decision.warnings.is_empty());
    // A downgrade always leaves a question to ask.
    assert!(
        decision
            .required_context
            .unwrap()
            .user_intent_question
            .is_some()
    );
}

#[tokio::test]
async fn low_confidence_deny_keeps_verdict_with_warning() {
    // Short reasoning keeps confidence at the base; the post-check threshold
    // for DENY is above it only when parsing degraded, so craft a fallback.
    let client = OneShot::new("not json at all");
    let history: [HistoryEntry; 0] = [];
    let decision = evaluate(&client, &request("ls", &history)).await;
    // Parse failure is conservative, not a deny.
    assert_eq!(decision.verdict, Verdict::NeedUserConfirm);
}

#[tokio::test]
async fn prompt_carries_context() {
    let client = OneShot::new(r#"{"verdict": "ALLOW", "reasoning": "ok"}"#);
    let history = [HistoryEntry {
        execution_id: "e1".to_string(),
        command: "git status".to_string(),
        working_directory: "/work".to_string(),
        timestamp: Utc::now(),
        executed: true,
        classification: None,
        decision: Some("allow".to_string()),
        output_summary: None,
    }];
    let mut req = request("git push", &history);
    req.detected_patterns = &["privilege_escalation"];
    req.comment = Some("routine sync");
    evaluate(&client, &req).await;

    let (system, user) = client.seen.lock().unwrap().clone().unwrap();
    assert!(system.contains("JSON"));
    assert!(system.contains("{{COMMAND}}"));
    assert!(user.contains("Command: git push"));
    assert!(user.contains("Working directory: /work"));
    assert!(user.contains("privilege_escalation"));
    assert!(user.contains("routine sync"));
    assert!(user.contains("git status"));
}

#[tokio::test]
async fn exchange_failure_yields_conservative_decision() {
    struct Failing;
    #[async_trait]
    impl SamplingClient for Failing {
        async fn create_message(
            &self,
            _s: &str,
            _u: &str,
            _m: u32,
        ) -> Result<String, BosunError> {
            Err(BosunError::ExecutionFailure("link down".to_string()))
        }
    }
    let history: [HistoryEntry; 0] = [];
    let decision = evaluate(&Failing, &request("echo hi", &history)).await;
    assert_eq!(decision.verdict, Verdict::NeedUserConfirm);
    assert!(decision.reasoning.contains("unavailable"));
}
