use serde_json::{Map, Value};

use crate::{parse_bool, Condition, Filter, FilterValue, Op};

/// Evaluates a filter against a resource map.
///
/// A missing or null property never matches, for either `eq` or `neq`,
/// mirroring SQL three-valued logic.
pub fn matches(filter: &Filter, data: &Map<String, Value>) -> bool {
    match filter {
        Filter::Bool(b) => *b,
        Filter::And(items) => items.iter().all(|f| matches(f, data)),
        Filter::Or(items) => items.iter().any(|f| matches(f, data)),
        Filter::Cond(cond) => matches_condition(cond, data),
    }
}

fn matches_condition(cond: &Condition, data: &Map<String, Value>) -> bool {
    let actual = match data.get(&cond.property) {
        None | Some(Value::Null) => return false,
        Some(v) => v,
    };
    match (&cond.value, cond.op) {
        (FilterValue::Scalar(Value::Null), _) => false,
        (FilterValue::Scalar(expected), Op::Eq) => loose_eq(actual, expected),
        (FilterValue::Scalar(expected), Op::Neq) => !loose_eq(actual, expected),
        (FilterValue::List(items), Op::Eq) => items.iter().any(|e| loose_eq(actual, e)),
        (FilterValue::List(items), Op::Neq) => !items.iter().any(|e| loose_eq(actual, e)),
        (FilterValue::Substring(s), op) => {
            let text = match actual {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                // booleans are stored as 1 and 0
                Value::Bool(b) => u8::from(*b).to_string(),
                _ => return false,
            };
            like_match(s.pattern(), &text) == (op == Op::Eq)
        }
    }
}

/// Equality with the coercions SQLite applies when a stored value meets a
/// bound one. The stored value's type stands for the column's affinity:
/// text columns compare bound numbers and booleans as text, numeric and
/// boolean columns compare numeric-looking text as numbers.
pub fn loose_eq(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Bool(a), Value::String(s)) => parse_bool(s) == Some(*a),
        (Value::String(s), Value::Bool(b)) => s == if *b { "1" } else { "0" },
        (Value::Bool(a), Value::Number(n)) | (Value::Number(n), Value::Bool(a)) => {
            n.as_f64() == Some(if *a { 1.0 } else { 0.0 })
        }
        (Value::Number(n), Value::String(s)) => s.trim().parse::<f64>().ok() == n.as_f64(),
        (Value::String(s), Value::Number(n)) => *s == n.to_string(),
        (a, b) => a == b,
    }
}

/// SQL `LIKE` with `\` as the escape character, ASCII case-insensitive.
pub fn like_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<Token> = tokenize(pattern);
    let text: Vec<char> = text.chars().map(|c| c.to_ascii_lowercase()).collect();
    // dp[j] is true when pattern[..i] matches text[..j]
    let mut dp = vec![false; text.len() + 1];
    dp[0] = true;
    for token in &pattern {
        let mut next = vec![false; text.len() + 1];
        match token {
            Token::Any => {
                let mut seen = false;
                for j in 0..=text.len() {
                    seen |= dp[j];
                    next[j] = seen;
                }
            }
            Token::One => {
                for j in 1..=text.len() {
                    next[j] = dp[j - 1];
                }
            }
            Token::Lit(c) => {
                for j in 1..=text.len() {
                    next[j] = dp[j - 1] && text[j - 1] == *c;
                }
            }
        }
        dp = next;
    }
    dp[text.len()]
}

enum Token {
    Any,
    One,
    Lit(char),
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let mut out = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        out.push(match c {
            '%' => Token::Any,
            '_' => Token::One,
            '\\' => match chars.next() {
                Some(escaped) => Token::Lit(escaped.to_ascii_lowercase()),
                None => Token::Lit('\\'),
            },
            other => Token::Lit(other.to_ascii_lowercase()),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn data(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn bool_and_empty_combinators() {
        let r = data(json!({"a": 1}));
        assert!(matches(&Filter::Bool(true), &r));
        assert!(!matches(&Filter::Bool(false), &r));
        assert!(matches(&Filter::And(vec![]), &r));
        assert!(!matches(&Filter::Or(vec![]), &r));
    }

    #[test]
    fn missing_or_null_property_never_matches() {
        let r = data(json!({"a": null}));
        assert!(!matches(&Filter::eq("a", json!(1)), &r));
        assert!(!matches(&Filter::neq("a", json!(1)), &r));
        assert!(!matches(&Filter::eq("missing", json!(1)), &r));
    }

    #[test]
    fn list_equality_matches_any_element() {
        let r = data(json!({"c": "x"}));
        assert!(matches(&Filter::eq("c", json!(["z", "y", "x"])), &r));
        assert!(!matches(&Filter::neq("c", json!(["z", "x"])), &r));
        assert!(matches(&Filter::neq("c", json!(["z"])), &r));
        assert!(!matches(&Filter::eq("c", json!([])), &r));
        assert!(matches(&Filter::neq("c", json!([])), &r));
    }

    #[test]
    fn boolean_strings_coerce() {
        let r = data(json!({"b": false}));
        assert!(matches(&Filter::eq("b", json!("false")), &r));
        assert!(matches(&Filter::eq("b", json!(["true", "False"])), &r));
        assert!(!matches(&Filter::eq("b", json!("true")), &r));
    }

    #[test]
    fn nested_and_or() {
        let f = Filter::from_value(&json!({"__and__": [
            {"__or__": [{"property": "a", "type": "eq", "value": 1}, {"__bool__": false}]},
            {"__or__": [{"property": "c", "type": "eq", "value": ["z", "y", "x"]}, {"__bool__": true}]}
        ]}))
        .unwrap();
        assert!(matches(&f, &data(json!({"a": 1, "b": false, "c": "x"}))));
        assert!(!matches(&f, &data(json!({"a": 2, "b": false, "c": "x"}))));
    }

    #[test]
    fn substring_like_semantics() {
        let r = data(json!({"name": "Web_Server%1"}));
        assert!(matches(&Filter::substring("name", "server%"), &r));
        assert!(matches(&Filter::substring("name", "b_s"), &r));
        assert!(!matches(&Filter::substring("name", "bXs"), &r));
        assert!(like_match("a_c", "abc"));
        assert!(like_match("%", ""));
        assert!(!like_match(r"a\_c", "abc"));
    }

    #[test]
    fn text_values_compare_as_text() {
        let r = data(json!({"c": "1.0", "n": 3, "b": true}));
        assert!(!matches(&Filter::eq("c", json!(1)), &r));
        assert!(matches(&Filter::eq("c", json!(1.0)), &r));
        assert!(matches(&Filter::eq("n", json!("3")), &r));
        assert!(!matches(&Filter::eq("c", json!(true)), &r));
    }

    #[test]
    fn booleans_substring_as_digits() {
        let r = data(json!({"b": true}));
        assert!(!matches(&Filter::substring("b", "tru"), &r));
        assert!(matches(&Filter::substring("b", "1"), &r));
    }
}
