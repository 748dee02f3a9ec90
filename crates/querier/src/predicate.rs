//! Store-agnostic predicate trees.
//!
//! A [`Predicate`] is the compiled form every filter input reduces to. Stores
//! receive the tree and translate it to their native query language; the
//! in-memory store evaluates it directly via [`Predicate::matches`].

use crate::error::{QuerierError, QuerierResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

/// Comparison operators accepted by the filter DSL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Like,
}

impl CmpOp {
    /// Parse an operator name. Anything outside the supported set is a
    /// configuration error and fails loudly.
    pub fn parse(op: &str) -> QuerierResult<Self> {
        match op {
            "=" => Ok(Self::Eq),
            "<>" | "!=" => Ok(Self::Ne),
            "like" => Ok(Self::Like),
            other => {
                let err = QuerierError::UnsupportedOperator {
                    operator: other.to_string(),
                };
                tracing::error!(operator = other, "unsupported filter operator");
                Err(err)
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Like => "like",
        }
    }
}

/// Boolean combinators accepted by the filter DSL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionKind {
    And,
    Or,
}

impl ConditionKind {
    /// Parse a condition name, case-insensitive.
    pub fn parse(condition: &str) -> QuerierResult<Self> {
        match condition.to_lowercase().as_str() {
            "and" => Ok(Self::And),
            "or" => Ok(Self::Or),
            other => {
                let err = QuerierError::UnsupportedCondition {
                    condition: other.to_string(),
                };
                tracing::error!(condition = other, "unsupported filter condition");
                Err(err)
            }
        }
    }
}

/// A boolean predicate over rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Cmp {
        field: String,
        op: CmpOp,
        value: Value,
    },
}

impl Predicate {
    pub fn and(children: Vec<Predicate>) -> Self {
        Self::And(children)
    }

    pub fn or(children: Vec<Predicate>) -> Self {
        Self::Or(children)
    }

    pub fn cmp(field: impl Into<String>, op: CmpOp, value: impl Into<Value>) -> Self {
        Self::Cmp {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, CmpOp::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, CmpOp::Ne, value)
    }

    pub fn like(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cmp(field, CmpOp::Like, value)
    }

    /// True when the tree contains no comparison at any depth.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Cmp { .. } => false,
            Self::And(children) | Self::Or(children) => {
                children.iter().all(Predicate::is_empty)
            }
        }
    }

    /// Evaluate the predicate against a JSON row.
    ///
    /// Empty groups are neutral and match everything. Comparison fields may be
    /// dotted paths into attached associations; a `Model.column` key that does
    /// not resolve as a path falls back to its final segment.
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Self::And(children) => children.iter().all(|c| c.matches(row)),
            Self::Or(children) => {
                children.is_empty() || children.iter().any(|c| c.matches(row))
            }
            Self::Cmp { field, op, value } => {
                let actual = lookup(row, field);
                match op {
                    CmpOp::Eq => loose_eq(actual.unwrap_or(&Value::Null), value),
                    CmpOp::Ne => !loose_eq(actual.unwrap_or(&Value::Null), value),
                    CmpOp::Like => match actual {
                        None => false,
                        Some(actual) => match value {
                            Value::String(pattern) => like_match(pattern, &stringify(actual)),
                            // Non-string patterns degrade to equality.
                            other => loose_eq(actual, other),
                        },
                    },
                }
            }
        }
    }
}

fn lookup<'a>(row: &'a Value, field: &str) -> Option<&'a Value> {
    get_path(row, field).or_else(|| {
        field
            .rsplit_once('.')
            .and_then(|(_, last)| row.get(last))
    })
}

/// Resolve a dotted path against a JSON value.
pub(crate) fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Equality with numeric leniency: `1` equals `"1"`.
fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (left, right) {
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            s == &n.to_string()
        }
        _ => false,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Case-insensitive SQL LIKE matching with `%` and `_` wildcards.
pub(crate) fn like_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();
    // dp[j] = pattern[..i] matches text[..j]
    let mut dp = vec![false; text.len() + 1];
    dp[0] = true;
    for &p in &pattern {
        if p == '%' {
            for j in 1..=text.len() {
                dp[j] = dp[j] || dp[j - 1];
            }
        } else {
            let mut prev = dp[0];
            dp[0] = false;
            for j in 1..=text.len() {
                let matched = prev && (p == '_' || p == text[j - 1]);
                prev = dp[j];
                dp[j] = matched;
            }
        }
    }
    dp[text.len()]
}

static DATE_LIKE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}").expect("invalid built-in date regex")
});

/// True when a string starts with a `YYYY-MM-DD` date.
pub(crate) fn is_date_like(value: &str) -> bool {
    DATE_LIKE.is_match(value)
}

/// Coerce a filter value before comparison.
///
/// Numeric-looking strings become integers for equality operators, date-looking
/// strings are validated against the calendar. Coercion failures are logged as
/// warnings and leave the value untouched, they never abort the query.
pub(crate) fn coerce_value(value: &Value, op: CmpOp) -> Value {
    let Value::String(s) = value else {
        return value.clone();
    };
    if op != CmpOp::Like {
        if let Ok(n) = s.parse::<i64>() {
            return Value::Number(n.into());
        }
    }
    if is_date_like(s) {
        let head = &s[..10];
        if chrono::NaiveDate::parse_from_str(head, "%Y-%m-%d").is_err() {
            tracing::warn!(value = %s, "date-looking filter value failed to parse");
        }
    }
    value.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_operator() {
        assert_eq!(CmpOp::parse("=").unwrap(), CmpOp::Eq);
        assert_eq!(CmpOp::parse("<>").unwrap(), CmpOp::Ne);
        assert_eq!(CmpOp::parse("like").unwrap(), CmpOp::Like);
        let err = CmpOp::parse("abc").unwrap_err();
        assert_eq!(err.to_string(), "this operator not supported.");
    }

    #[test]
    fn test_parse_condition() {
        assert_eq!(ConditionKind::parse("and").unwrap(), ConditionKind::And);
        assert_eq!(ConditionKind::parse("OR").unwrap(), ConditionKind::Or);
        let err = ConditionKind::parse("xor").unwrap_err();
        assert_eq!(err.to_string(), "this condition not supported.");
    }

    #[test]
    fn test_eq_matches_with_numeric_leniency() {
        let row = json!({"id": 1, "name": "alpha"});
        assert!(Predicate::eq("id", 1).matches(&row));
        assert!(Predicate::eq("id", "1").matches(&row));
        assert!(!Predicate::eq("id", 2).matches(&row));
        assert!(Predicate::ne("name", "beta").matches(&row));
    }

    #[test]
    fn test_like_wildcards() {
        assert!(like_match("%lph%", "Alpha"));
        assert!(like_match("a_pha", "alpha"));
        assert!(like_match("alpha", "ALPHA"));
        assert!(!like_match("beta%", "alpha"));
    }

    #[test]
    fn test_dotted_path_with_fallback() {
        let row = json!({"name": "alpha", "Group": {"role": "ADMIN"}});
        assert!(Predicate::eq("Group.role", "ADMIN").matches(&row));
        // Model-prefixed key falls back to the bare column.
        assert!(Predicate::like("User.name", "%alph%").matches(&row));
    }

    #[test]
    fn test_empty_groups_are_neutral() {
        let row = json!({"id": 1});
        assert!(Predicate::And(vec![]).matches(&row));
        assert!(Predicate::Or(vec![]).matches(&row));
        assert!(Predicate::And(vec![Predicate::Or(vec![])]).is_empty());
    }

    #[test]
    fn test_coerce_numeric_string() {
        assert_eq!(coerce_value(&json!("42"), CmpOp::Eq), json!(42));
        // LIKE values stay strings.
        assert_eq!(coerce_value(&json!("42"), CmpOp::Like), json!("42"));
        assert_eq!(coerce_value(&json!("2024-01-02"), CmpOp::Eq), json!("2024-01-02"));
    }
}
