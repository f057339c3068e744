use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use bosun::error::BosunError;
use bosun::history::HistoryLog;
use bosun::safety::decision::Verdict;
use bosun::safety::elicit::{ElicitAction, ElicitAnswer, Elicitor};
use bosun::safety::evaluator::SamplingClient;
use bosun::safety::{SafetyChannels, SafetyEvaluator, SafetyOutcome};

/// Scripted model: pops one canned reply per evaluation round.
struct ScriptedSampling {
    replies: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSampling {
    fn new<I: IntoIterator<Item = &'static str>>(replies: I) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(str::to_string).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl SamplingClient for ScriptedSampling {
    async fn create_message(
        &self,
        _system_prompt: &str,
        user_prompt: &str,
        _max_tokens: u32,
    ) -> Result<String, BosunError> {
        self.calls.lock().unwrap().push(user_prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| BosunError::ExecutionFailure("script exhausted".to_string()))
    }
}

/// Scripted confirmation channel.
struct ScriptedElicitor {
    answer: ElicitAnswer,
    questions: Mutex<Vec<String>>,
}

impl ScriptedElicitor {
    fn accepting() -> Self {
        Self {
            answer: ElicitAnswer {
                action: ElicitAction::Accept,
                content: Some(serde_json::json!({"approve": true, "reason": "I need this"})),
            },
            questions: Mutex::new(Vec::new()),
        }
    }

    fn declining() -> Self {
        Self {
            answer: ElicitAnswer {
                action: ElicitAction::Decline,
                content: None,
            },
            questions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Elicitor for ScriptedElicitor {
    async fn ask(&self, question: &str, _timeout: Duration) -> Result<ElicitAnswer, BosunError> {
        self.questions.lock().unwrap().push(question.to_string());
        Ok(ElicitAnswer {
            action: self.answer.action,
            content: self.answer.content.clone(),
        })
    }
}

fn evaluator(history: &Arc<HistoryLog>) -> SafetyEvaluator {
    SafetyEvaluator::new(Arc::clone(history), true, true, Duration::from_secs(5))
}

fn history() -> Arc<HistoryLog> {
    Arc::new(HistoryLog::new(100, None))
}

const ALLOW: &str = r#"{"verdict": "ALLOW", "reasoning": "harmless read-only command"}"#;
const DENY: &str =
    r#"{"verdict": "DENY", "reasoning": "irreversibly destructive", "suggested_alternatives": ["use trash-cli"]}"#;
const NEED_CONFIRM: &str = r#"{"verdict": "NEED_USER_CONFIRM", "reasoning": "ambiguous intent", "required_context": {"user_intent_question": "Really delete build artifacts?"}}"#;
const NEED_HISTORY: &str = r#"{"verdict": "NEED_MORE_HISTORY", "reasoning": "need earlier context", "required_context": {"history_depth": 25}}"#;

#[tokio::test]
async fn allow_verdict_admits() {
    let history = history();
    let safety = evaluator(&history);
    let sampling = ScriptedSampling::new([ALLOW]);
    let channels = SafetyChannels {
        sampling: Some(&sampling),
        elicitor: None,
    };

    let outcome = safety
        .assess("ls -la", "/tmp", None, &channels)
        .await
        .unwrap();
    assert!(matches!(outcome, SafetyOutcome::Admitted(_)));
    // Admissions are recorded by the process manager, not here.
    assert_eq!(history.len(), 0);
}

#[tokio::test]
async fn deny_verdict_refuses_and_records() {
    let history = history();
    let safety = evaluator(&history);
    let sampling = ScriptedSampling::new([DENY]);
    let channels = SafetyChannels {
        sampling: Some(&sampling),
        elicitor: None,
    };

    let outcome = safety
        .assess("rm -rf /", "/tmp", None, &channels)
        .await
        .unwrap();
    let SafetyOutcome::Refused(decision) = outcome else {
        panic!("expected refusal");
    };
    assert_eq!(decision.verdict, Verdict::Deny);
    assert_eq!(decision.suggested_alternatives, vec!["use trash-cli"]);

    let entries = history.recent(10);
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].executed);
    assert_eq!(entries[0].decision.as_deref(), Some("deny"));
    // The scanner tags ride along as classification context.
    assert!(entries[0]
        .classification
        .as_deref()
        .unwrap()
        .contains("destructive_root_delete"));
}

#[tokio::test]
async fn user_confirmation_accept_reevaluates_to_allow() {
    let history = history();
    let safety = evaluator(&history);
    let sampling = ScriptedSampling::new([NEED_CONFIRM, ALLOW]);
    let elicitor = ScriptedElicitor::accepting();
    let channels = SafetyChannels {
        sampling: Some(&sampling),
        elicitor: Some(&elicitor),
    };

    let outcome = safety
        .assess("rm -r build/", "/work", None, &channels)
        .await
        .unwrap();
    assert!(matches!(outcome, SafetyOutcome::Admitted(_)));
    assert_eq!(sampling.call_count(), 2);
    // The question came from the model's required_context.
    assert_eq!(
        elicitor.questions.lock().unwrap().as_slice(),
        ["Really delete build artifacts?"]
    );
    // The user's answer is fed into the re-evaluation prompt.
    assert!(sampling.calls.lock().unwrap()[1].contains("I need this"));
    // One synthetic confirmation entry recorded.
    let entries = history.recent(10);
    assert_eq!(entries.len(), 1);
    assert!(entries[0].command.starts_with("[user confirmation]"));
    assert_eq!(entries[0].decision.as_deref(), Some("accept"));
}

#[tokio::test]
async fn user_confirmation_decline_refuses() {
    let history = history();
    let safety = evaluator(&history);
    let sampling = ScriptedSampling::new([NEED_CONFIRM]);
    let elicitor = ScriptedElicitor::declining();
    let channels = SafetyChannels {
        sampling: Some(&sampling),
        elicitor: Some(&elicitor),
    };

    let outcome = safety
        .assess("rm -r build/", "/work", None, &channels)
        .await
        .unwrap();
    let SafetyOutcome::Refused(decision) = outcome else {
        panic!("expected refusal");
    };
    assert!(decision.reasoning.contains("decline"));
    // No second model round after a decline.
    assert_eq!(sampling.call_count(), 1);
}

#[tokio::test]
async fn need_more_history_widens_and_reevaluates() {
    let history = history();
    let safety = evaluator(&history);
    let sampling = ScriptedSampling::new([NEED_HISTORY, ALLOW]);
    let channels = SafetyChannels {
        sampling: Some(&sampling),
        elicitor: None,
    };

    let outcome = safety
        .assess("make deploy", "/work", None, &channels)
        .await
        .unwrap();
    assert!(matches!(outcome, SafetyOutcome::Admitted(_)));
    assert_eq!(sampling.call_count(), 2);
    assert!(sampling.calls.lock().unwrap()[1].contains("reevaluate_with_additional_context"));
}

#[tokio::test]
async fn evaluation_loop_is_bounded() {
    let history = history();
    let safety = evaluator(&history);
    // The model keeps asking for more history; after two re-evaluations the
    // pipeline refuses conservatively.
    let sampling = ScriptedSampling::new([NEED_HISTORY, NEED_HISTORY, NEED_HISTORY, NEED_HISTORY]);
    let channels = SafetyChannels {
        sampling: Some(&sampling),
        elicitor: None,
    };

    let outcome = safety
        .assess("make deploy", "/work", None, &channels)
        .await
        .unwrap();
    let SafetyOutcome::Refused(decision) = outcome else {
        panic!("expected conservative refusal");
    };
    assert!(decision.reasoning.contains("exhausted"));
    assert_eq!(sampling.call_count(), 3); // initial + two re-evaluations
}

#[tokio::test]
async fn assistant_confirm_returns_to_caller() {
    let history = history();
    let safety = evaluator(&history);
    let sampling = ScriptedSampling::new([
        r#"{"verdict": "NEED_ASSISTANT_CONFIRM", "reasoning": "explain the deployment target", "required_context": {"assistant_request": "State which environment this deploys to."}}"#,
    ]);
    let channels = SafetyChannels {
        sampling: Some(&sampling),
        elicitor: None,
    };

    let outcome = safety
        .assess("make deploy", "/work", None, &channels)
        .await
        .unwrap();
    let SafetyOutcome::AssistantConfirmRequired(decision) = outcome else {
        panic!("expected assistant-confirm outcome");
    };
    assert_eq!(
        decision
            .required_context
            .unwrap()
            .assistant_request
            .as_deref(),
        Some("State which environment this deploys to.")
    );
}

#[tokio::test]
async fn confirmation_without_elicitor_is_unavailable() {
    let history = history();
    let safety = evaluator(&history);
    let sampling = ScriptedSampling::new([NEED_CONFIRM]);
    let channels = SafetyChannels {
        sampling: Some(&sampling),
        elicitor: None,
    };

    let err = safety
        .assess("rm -r build/", "/work", None, &channels)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "elicitation_unavailable");
}

#[tokio::test]
async fn pattern_only_mode_refuses_on_match() {
    let history = history();
    // LLM evaluation disabled: scanner verdict is authoritative.
    let safety = SafetyEvaluator::new(Arc::clone(&history), false, true, Duration::from_secs(5));
    let channels = SafetyChannels {
        sampling: None,
        elicitor: None,
    };

    let refused = safety
        .assess("rm -rf /", "/tmp", None, &channels)
        .await
        .unwrap();
    let SafetyOutcome::Refused(decision) = refused else {
        panic!("expected refusal");
    };
    assert!(decision.reasoning.contains("destructive_root_delete"));

    let admitted = safety
        .assess("echo hi", "/tmp", None, &channels)
        .await
        .unwrap();
    assert!(matches!(admitted, SafetyOutcome::Admitted(_)));
}

#[tokio::test]
async fn sampling_failure_degrades_to_user_confirm() {
    let history = history();
    let safety = evaluator(&history);
    // Empty script: the exchange itself errors, which must not admit.
    let sampling = ScriptedSampling::new([]);
    let elicitor = ScriptedElicitor::declining();
    let channels = SafetyChannels {
        sampling: Some(&sampling),
        elicitor: Some(&elicitor),
    };

    let outcome = safety
        .assess("echo hi", "/tmp", None, &channels)
        .await
        .unwrap();
    assert!(matches!(outcome, SafetyOutcome::Refused(_)));
}
