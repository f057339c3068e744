//! Structured-response parsing for the LLM evaluator.
//!
//! Models are pinned to a JSON-only response shape, but replies still arrive
//! wrapped in prose, code fences, or with sloppy syntax. Parsing runs four
//! stages in order (direct parse, fenced-block extraction, balanced-brace
//! extraction, then JSON repair) and validates each candidate against the
//! decision schema. A total parse failure is a first-class outcome: the
//! caller gets a conservative NEED_USER_CONFIRM decision, never an error.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::decision::{RequiredContext, RiskFactor, SafetyDecision, Severity, Verdict};

const BASE_CONFIDENCE: f64 = 0.8;
const FENCED_BONUS: f64 = 0.1;
const REASONING_BONUS: f64 = 0.05;
const REASONING_BONUS_MIN_LEN: usize = 40;
const FALLBACK_CONFIDENCE: f64 = 0.3;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("static pattern must compile")
});
static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("static pattern must compile"));
static BARE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).expect("static pattern must compile")
});

/// Parse a raw model reply into a safety decision. Never fails; the fallback
/// decision identifies the parse failure in its reasoning.
pub fn parse_decision(raw: &str) -> SafetyDecision {
    // Stage 1: the whole reply is the JSON object.
    if let Ok(value) = serde_json::from_str::<Value>(raw.trim())
        && let Ok(mut decision) = decision_from_value(&value)
    {
        decision.confidence = score_confidence(&decision, false);
        return decision;
    }

    // Stage 2: fenced code block.
    if let Some(block) = FENCED_BLOCK.captures(raw).and_then(|c| c.get(1))
        && let Ok(value) = serde_json::from_str::<Value>(block.as_str())
        && let Ok(mut decision) = decision_from_value(&value)
    {
        decision.confidence = score_confidence(&decision, true);
        return decision;
    }

    // Stage 3: first balanced-brace substring.
    if let Some(candidate) = extract_balanced(raw)
        && let Ok(value) = serde_json::from_str::<Value>(&candidate)
        && let Ok(mut decision) = decision_from_value(&value)
    {
        decision.confidence = score_confidence(&decision, false);
        return decision;
    }

    // Stage 4: JSON repair on the most plausible candidate.
    let candidate = extract_balanced(raw).unwrap_or_else(|| raw.trim().to_string());
    let repaired = repair_json(&candidate);
    if let Ok(value) = serde_json::from_str::<Value>(&repaired)
        && let Ok(mut decision) = decision_from_value(&value)
    {
        decision.confidence = score_confidence(&decision, false);
        return decision;
    }

    tracing::warn!(reply_len = raw.len(), "evaluator reply failed all parse stages");
    SafetyDecision::new(
        Verdict::NeedUserConfirm,
        "evaluator response could not be parsed as a structured decision; \
         requiring user confirmation",
        FALLBACK_CONFIDENCE,
    )
}

/// Validate-then-construct: every field is checked against the schema before
/// a decision is built.
fn decision_from_value(value: &Value) -> Result<SafetyDecision, String> {
    let obj = value.as_object().ok_or("response is not a JSON object")?;

    let verdict_str = obj
        .get("verdict")
        .and_then(Value::as_str)
        .ok_or("missing string field: verdict")?;
    let verdict =
        Verdict::parse(verdict_str).ok_or_else(|| format!("unknown verdict: {verdict_str}"))?;

    let reasoning = obj
        .get("reasoning")
        .and_then(Value::as_str)
        .ok_or("missing string field: reasoning")?
        .to_string();

    let risk_factors = match obj.get("risk_factors") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(risk_factor_from_value)
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err("risk_factors must be an array".to_string()),
    };

    let suggested_alternatives = match obj.get("suggested_alternatives") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or("suggested_alternatives entries must be strings".to_string())
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err("suggested_alternatives must be an array".to_string()),
    };

    let required_context = match obj.get("required_context") {
        None | Some(Value::Null) => None,
        Some(ctx) => Some(required_context_from_value(ctx)?),
    };

    Ok(SafetyDecision {
        verdict,
        reasoning,
        confidence: BASE_CONFIDENCE,
        risk_factors,
        suggested_alternatives,
        required_context,
        warnings: Vec::new(),
    })
}

fn risk_factor_from_value(value: &Value) -> Result<RiskFactor, String> {
    let obj = value
        .as_object()
        .ok_or("risk_factors entries must be objects")?;
    let severity = match obj.get("severity").and_then(Value::as_str) {
        Some("low") => Severity::Low,
        Some("medium") => Severity::Medium,
        Some("high") => Severity::High,
        Some("critical") => Severity::Critical,
        other => return Err(format!("invalid risk severity: {other:?}")),
    };
    let description = obj
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    Ok(RiskFactor {
        severity,
        description,
    })
}

fn required_context_from_value(value: &Value) -> Result<RequiredContext, String> {
    let obj = value
        .as_object()
        .ok_or("required_context must be an object")?;
    Ok(RequiredContext {
        history_depth: obj.get("history_depth").and_then(Value::as_u64).map(|n| n as u32),
        execution_results: obj
            .get("execution_results")
            .and_then(Value::as_u64)
            .map(|n| n as u32),
        search_keywords: obj.get("search_keywords").and_then(Value::as_array).map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        }),
        user_intent_question: obj
            .get("user_intent_question")
            .and_then(Value::as_str)
            .map(str::to_string),
        assistant_request: obj
            .get("assistant_request")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn score_confidence(decision: &SafetyDecision, fenced: bool) -> f64 {
    let mut confidence = BASE_CONFIDENCE;
    if fenced {
        confidence += FENCED_BONUS;
    }
    if decision.reasoning.len() >= REASONING_BONUS_MIN_LEN {
        confidence += REASONING_BONUS;
    }
    confidence.min(1.0)
}

/// Extract the first balanced `{ ... }` substring, respecting strings and
/// escapes.
pub fn extract_balanced(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(raw[start..start + i + c.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Best-effort JSON repair: single-quote normalisation, trailing-comma
/// removal, bare-key quoting. Applied only after strict parsing failed.
pub fn repair_json(candidate: &str) -> String {
    let mut repaired = String::with_capacity(candidate.len());
    let mut in_double = false;
    for c in candidate.chars() {
        match c {
            '"' => {
                in_double = !in_double;
                repaired.push(c);
            }
            '\'' if !in_double => repaired.push('"'),
            _ => repaired.push(c),
        }
    }
    let repaired = TRAILING_COMMA.replace_all(&repaired, "$1");
    BARE_KEY.replace_all(&repaired, "$1\"$2\":").to_string()
}
