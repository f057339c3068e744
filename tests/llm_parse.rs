use bosun::safety::decision::{Severity, Verdict};
use bosun::safety::parse::{extract_balanced, parse_decision, repair_json};

#[test]
fn direct_json_parses() {
    let decision = parse_decision(
        r#"{"verdict": "ALLOW", "reasoning": "read-only directory listing, no side effects"}"#,
    );
    assert_eq!(decision.verdict, Verdict::Allow);
    assert!(decision.reasoning.contains("read-only"));
    // base 0.8 + reasoning-length bonus
    assert!(decision.confidence > 0.8);
}

#[test]
fn fenced_block_parses_with_confidence_bonus() {
    let raw = "Here is my assessment:\n```json\n{\"verdict\": \"DENY\", \"reasoning\": \"destroys data irrecoverably across the filesystem\"}\n```\nLet me know.";
    let decision = parse_decision(raw);
    assert_eq!(decision.verdict, Verdict::Deny);
    assert!((decision.confidence - 0.95).abs() < 1e-9);
}

#[test]
fn balanced_brace_extraction_parses() {
    let raw = "The verdict follows. {\"verdict\": \"NEED_USER_CONFIRM\", \"reasoning\": \"ambiguous target\", \"required_context\": {\"user_intent_question\": \"Which directory?\"}} trailing prose";
    let decision = parse_decision(raw);
    assert_eq!(decision.verdict, Verdict::NeedUserConfirm);
    assert_eq!(
        decision
            .required_context
            .unwrap()
            .user_intent_question
            .as_deref(),
        Some("Which directory?")
    );
}

#[test]
fn repaired_json_parses() {
    // Single quotes, bare keys, trailing comma: all repairable.
    let raw = "{verdict: 'ALLOW', reasoning: 'temporary file cleanup in a scratch directory',}";
    let decision = parse_decision(raw);
    assert_eq!(decision.verdict, Verdict::Allow);
}

#[test]
fn unparseable_reply_falls_back_conservatively() {
    let decision = parse_decision("I think this command is probably fine to run.");
    assert_eq!(decision.verdict, Verdict::NeedUserConfirm);
    assert!(decision.reasoning.contains("could not be parsed"));
    assert!(decision.confidence < 0.5);
}

#[test]
fn unknown_verdict_falls_back() {
    let decision = parse_decision(r#"{"verdict": "MAYBE", "reasoning": "unsure"}"#);
    assert_eq!(decision.verdict, Verdict::NeedUserConfirm);
}

#[test]
fn risk_factors_and_alternatives_are_validated() {
    let decision = parse_decision(
        r#"{
            "verdict": "DENY",
            "reasoning": "writes to a raw block device",
            "risk_factors": [
                {"severity": "critical", "description": "destroys the partition table"},
                {"severity": "low", "description": "also noisy"}
            ],
            "suggested_alternatives": ["lsblk to inspect first"]
        }"#,
    );
    assert_eq!(decision.risk_factors.len(), 2);
    assert_eq!(decision.risk_factors[0].severity, Severity::Critical);
    assert_eq!(decision.suggested_alternatives.len(), 1);
}

#[test]
fn invalid_risk_severity_fails_validation() {
    // Schema violation inside risk_factors rejects the candidate entirely.
    let decision = parse_decision(
        r#"{"verdict": "ALLOW", "reasoning": "ok", "risk_factors": [{"severity": "apocalyptic"}]}"#,
    );
    assert_eq!(decision.verdict, Verdict::NeedUserConfirm);
}

#[test]
fn balanced_extraction_respects_strings() {
    let raw = r#"noise {"a": "brace } in string", "b": {"c": 1}} tail"#;
    let extracted = extract_balanced(raw).unwrap();
    assert_eq!(extracted, r#"{"a": "brace } in string", "b": {"c": 1}}"#);
}

#[test]
fn repair_handles_common_damage() {
    assert_eq!(
        repair_json("{key: 'value',}"),
        r#"{"key": "value"}"#
    );
    assert_eq!(repair_json(r#"{"a": [1, 2,]}"#), r#"{"a": [1, 2]}"#);
}
