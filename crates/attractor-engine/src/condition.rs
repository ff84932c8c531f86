use crate::context::ContextValues;
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Exists,
}

/// One `lhs OP rhs` clause of an edge condition. Conditions are parsed once
/// and evaluated purely against the run context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Clause {
    key: String,
    operator: Operator,
    value: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    clauses: Vec<Clause>,
}

impl Condition {
    /// Grammar: `lhs OP rhs (&& lhs OP rhs)*` with OP in {`=`, `!=`}, plus
    /// a bare key as an existence test. `lhs` is `outcome`,
    /// `preferred_label`, or `context.<key>`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut clauses = Vec::new();
        for raw_clause in raw.split("&&") {
            let clause = raw_clause.trim();
            if clause.is_empty() {
                continue;
            }
            let parsed = if let Some((left, right)) = clause.split_once("!=") {
                Clause {
                    key: left.trim().to_string(),
                    operator: Operator::Ne,
                    value: Some(right.trim().to_string()),
                }
            } else if let Some((left, right)) = clause.split_once('=') {
                Clause {
                    key: left.trim().to_string(),
                    operator: Operator::Eq,
                    value: Some(right.trim().to_string()),
                }
            } else {
                Clause {
                    key: clause.to_string(),
                    operator: Operator::Exists,
                    value: None,
                }
            };

            if !is_condition_key(&parsed.key) {
                return Err(format!("condition key '{}' is invalid", parsed.key));
            }
            if matches!(parsed.operator, Operator::Eq | Operator::Ne)
                && parsed.value.as_deref().unwrap_or_default().is_empty()
            {
                return Err(format!("condition clause '{clause}' has an empty value"));
            }
            clauses.push(parsed);
        }
        Ok(Self { clauses })
    }

    /// All clauses must hold. The context carries the routing built-ins
    /// (`outcome`, `failure_class`, `preferred_label`, ...) refreshed after
    /// every node, so evaluation only needs the context.
    pub fn evaluate(&self, context: &ContextValues) -> bool {
        self.clauses.iter().all(|clause| {
            let actual = resolve_key(&clause.key, context);
            match clause.operator {
                Operator::Exists => is_truthy(actual.as_ref()),
                Operator::Eq => equals(actual.as_ref(), clause.value.as_deref().unwrap_or_default()),
                Operator::Ne => !equals(actual.as_ref(), clause.value.as_deref().unwrap_or_default()),
            }
        })
    }
}

pub fn validate_condition(raw: &str) -> Result<(), String> {
    Condition::parse(raw).map(|_| ())
}

pub fn evaluate_condition(raw: &str, context: &ContextValues) -> Result<bool, String> {
    Ok(Condition::parse(raw)?.evaluate(context))
}

fn is_condition_key(key: &str) -> bool {
    if matches!(key, "outcome" | "preferred_label" | "failure_class" | "failure_reason") {
        return true;
    }
    let Some(suffix) = key.strip_prefix("context.") else {
        return false;
    };
    let mut chars = suffix.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '.')
}

fn resolve_key(key: &str, context: &ContextValues) -> Option<Value> {
    let lookup = key.strip_prefix("context.").unwrap_or(key);
    context.get(lookup).cloned()
}

fn equals(actual: Option<&Value>, expected_raw: &str) -> bool {
    let expected = parse_literal(expected_raw);
    match (actual, &expected) {
        (Some(Value::String(left)), Value::String(right)) => left == right,
        (Some(Value::Bool(left)), Value::Bool(right)) => left == right,
        (Some(Value::Number(left)), Value::Number(right)) => left == right,
        (Some(left), right) => json_to_string(left) == json_to_string(right),
        (None, Value::Null) => true,
        (None, _) => false,
    }
}

fn parse_literal(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(integer) = trimmed.parse::<i64>() {
        return Value::Number(integer.into());
    }
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(trimmed);
    Value::String(unquoted.to_string())
}

fn json_to_string(value: &Value) -> String {
    match value {
        Value::String(inner) => inner.clone(),
        _ => value.to_string(),
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(inner)) => *inner,
        Some(Value::String(inner)) => !inner.is_empty(),
        Some(Value::Number(_)) => true,
        Some(Value::Array(inner)) => !inner.is_empty(),
        Some(Value::Object(inner)) => !inner.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn context(pairs: &[(&str, Value)]) -> ContextValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<BTreeMap<_, _>>()
    }

    #[test]
    fn evaluate_all_clauses_match_expected_true() {
        let ctx = context(&[
            ("outcome", json!("success")),
            ("ready", json!(true)),
            ("tries", json!(2)),
        ]);
        let ok = evaluate_condition(
            "outcome=success && context.ready=true && context.tries=2",
            &ctx,
        )
        .expect("evaluation should succeed");
        assert!(ok);
    }

    #[test]
    fn evaluate_ne_clause_expected_false_on_equal() {
        let ctx = context(&[("outcome", json!("success"))]);
        let ok = evaluate_condition("outcome!=success", &ctx).expect("evaluation should succeed");
        assert!(!ok);
    }

    #[test]
    fn evaluate_failure_class_key_expected_routable() {
        let ctx = context(&[
            ("outcome", json!("fail")),
            ("failure_class", json!("transient_infra")),
        ]);
        let ok = evaluate_condition("outcome=fail && failure_class=transient_infra", &ctx)
            .expect("evaluation should succeed");
        assert!(ok);
    }

    #[test]
    fn parse_invalid_key_expected_err() {
        let error = validate_condition("bogus_key=1").expect_err("validation should fail");
        assert!(error.contains("invalid"));
    }

    #[test]
    fn parse_empty_value_expected_err() {
        let error = validate_condition("outcome=").expect_err("validation should fail");
        assert!(error.contains("empty value"));
    }

    #[test]
    fn evaluate_missing_context_key_expected_false() {
        let ctx = ContextValues::new();
        let ok = evaluate_condition("context.flag=true", &ctx).expect("evaluation should succeed");
        assert!(!ok);
    }

    #[test]
    fn evaluate_bare_key_expected_existence_semantics() {
        let ctx = context(&[("flag", json!("yes"))]);
        assert!(evaluate_condition("context.flag", &ctx).expect("ok"));
        assert!(!evaluate_condition("context.other", &ctx).expect("ok"));
    }
}
