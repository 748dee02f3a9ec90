//! Filter DSL compilation.
//!
//! Turns the caller-facing filter inputs (where map, searchable rules, keyword
//! search, raw predicate) into a single [`Predicate`] tree.

use crate::error::QuerierResult;
use crate::predicate::{coerce_value, CmpOp, ConditionKind, Predicate};
use crate::schema::ModelDescriptor;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Per-field compilation rule from a searchable map.
///
/// Operator and condition names are kept as strings and parsed at compile
/// time, so a bad name fails identically whatever call path declared it.
#[derive(Debug, Clone)]
pub enum SearchableRule {
    /// String form: operator only, AND-combined, no default.
    Operator(String),
    /// Object form: operator, condition and optional default value.
    Full {
        operator: String,
        condition: String,
        default_value: Option<Value>,
    },
}

impl SearchableRule {
    pub fn operator(op: impl Into<String>) -> Self {
        Self::Operator(op.into())
    }

    pub fn full(
        operator: impl Into<String>,
        condition: impl Into<String>,
        default_value: impl Into<Option<Value>>,
    ) -> Self {
        Self::Full {
            operator: operator.into(),
            condition: condition.into(),
            default_value: default_value.into(),
        }
    }
}

/// Everything the compiler needs to produce a predicate.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    /// Field/value pairs from the request.
    pub where_map: Map<String, Value>,
    /// Caller-supplied predicate. When present it fully replaces the compiled
    /// output, searchable rules and keyword search included.
    pub raw: Option<Predicate>,
    /// Per-field rules. `BTreeMap` keeps compilation order deterministic so
    /// identical inputs yield identical predicates.
    pub searchable: Option<BTreeMap<String, SearchableRule>>,
    /// Free-text search term.
    pub keyword: Option<String>,
    /// Columns the keyword is matched against. Empty means every text-like
    /// column of the model.
    pub search_columns: Vec<String>,
}

/// Compile a filter spec against a model into one predicate tree.
///
/// Output shape: `AND(field-level predicates, OR(or-bucket ++ keyword likes))`.
/// Rules whose field has no request value and no default are skipped with a
/// debug log, never an error.
pub fn compile(spec: &FilterSpec, model: &ModelDescriptor) -> QuerierResult<Predicate> {
    if let Some(raw) = &spec.raw {
        return Ok(raw.clone());
    }

    let mut and_bucket = Vec::new();
    let mut or_bucket = Vec::new();

    match &spec.searchable {
        None => {
            // No rules: every provided pair becomes a substring match.
            for (field, value) in &spec.where_map {
                if value.is_null() {
                    continue;
                }
                and_bucket.push(Predicate::cmp(
                    field.clone(),
                    CmpOp::Like,
                    coerce_value(value, CmpOp::Like),
                ));
            }
        }
        Some(rules) => {
            for (field, rule) in rules {
                let (op, condition, default_value) = match rule {
                    SearchableRule::Operator(op) => {
                        (CmpOp::parse(op)?, ConditionKind::And, None)
                    }
                    SearchableRule::Full {
                        operator,
                        condition,
                        default_value,
                    } => (
                        CmpOp::parse(operator)?,
                        ConditionKind::parse(condition)?,
                        default_value.clone(),
                    ),
                };
                let value = spec
                    .where_map
                    .get(field)
                    .filter(|v| !v.is_null())
                    .cloned()
                    .or(default_value);
                let Some(value) = value else {
                    tracing::debug!(field, "searchable field absent from request, skipped");
                    continue;
                };
                let cmp = Predicate::cmp(field.clone(), op, coerce_value(&value, op));
                match condition {
                    ConditionKind::And => and_bucket.push(cmp),
                    ConditionKind::Or => or_bucket.push(cmp),
                }
            }
            // Pairs not covered by a rule keep the substring-match default.
            for (field, value) in &spec.where_map {
                if rules.contains_key(field) || value.is_null() {
                    continue;
                }
                and_bucket.push(Predicate::cmp(
                    field.clone(),
                    CmpOp::Like,
                    coerce_value(value, CmpOp::Like),
                ));
            }
        }
    }

    if let Some(keyword) = spec.keyword.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
        let pattern = format!("%{keyword}%");
        let columns: Vec<String> = if spec.search_columns.is_empty() {
            model
                .columns
                .iter()
                .filter(|c| c.type_tag.is_text_searchable())
                .map(|c| c.name.clone())
                .collect()
        } else {
            spec.search_columns.clone()
        };
        for column in columns {
            or_bucket.push(Predicate::like(column, pattern.clone()));
        }
    }

    if !or_bucket.is_empty() {
        and_bucket.push(Predicate::Or(or_bucket));
    }
    Ok(Predicate::And(and_bucket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AssociationMeta, ColumnMeta, ModelDescriptor, TypeTag};
    use serde_json::json;

    fn user_model() -> ModelDescriptor {
        ModelDescriptor::new("User")
            .with_column(ColumnMeta::new("name", TypeTag::String))
            .with_column(ColumnMeta::new("age", TypeTag::Integer))
            .with_column(ColumnMeta::new("visibility", TypeTag::String))
            .with_association(AssociationMeta::one_to_one("Group"))
    }

    fn where_map(pairs: Value) -> Map<String, Value> {
        match pairs {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_where_without_searchable_compiles_to_likes() {
        let spec = FilterSpec {
            where_map: where_map(json!({"name": "al", "age": null})),
            ..Default::default()
        };
        let predicate = compile(&spec, &user_model()).unwrap();
        assert_eq!(
            predicate,
            Predicate::And(vec![Predicate::like("name", "al")])
        );
    }

    #[test]
    fn test_searchable_default_value_applies_when_absent() {
        let mut searchable = BTreeMap::new();
        searchable.insert(
            "visibility".to_string(),
            SearchableRule::full("<>", "and", json!("public")),
        );
        let spec = FilterSpec {
            searchable: Some(searchable),
            ..Default::default()
        };
        let predicate = compile(&spec, &user_model()).unwrap();
        assert_eq!(
            predicate,
            Predicate::And(vec![Predicate::ne("visibility", "public")])
        );
    }

    #[test]
    fn test_searchable_request_value_wins_over_default() {
        let mut searchable = BTreeMap::new();
        searchable.insert(
            "visibility".to_string(),
            SearchableRule::full("=", "and", json!("public")),
        );
        let spec = FilterSpec {
            where_map: where_map(json!({"visibility": "private"})),
            searchable: Some(searchable),
            ..Default::default()
        };
        let predicate = compile(&spec, &user_model()).unwrap();
        assert_eq!(
            predicate,
            Predicate::And(vec![Predicate::eq("visibility", "private")])
        );
    }

    #[test]
    fn test_or_condition_lands_in_or_group() {
        let mut searchable = BTreeMap::new();
        searchable.insert("age".to_string(), SearchableRule::full("=", "or", None));
        searchable.insert("name".to_string(), SearchableRule::operator("like"));
        let spec = FilterSpec {
            where_map: where_map(json!({"age": "30", "name": "al"})),
            searchable: Some(searchable),
            ..Default::default()
        };
        let predicate = compile(&spec, &user_model()).unwrap();
        assert_eq!(
            predicate,
            Predicate::And(vec![
                Predicate::like("name", "al"),
                Predicate::Or(vec![Predicate::eq("age", 30)]),
            ])
        );
    }

    #[test]
    fn test_keyword_search_expands_to_text_columns() {
        let spec = FilterSpec {
            keyword: Some("  term ".to_string()),
            ..Default::default()
        };
        let predicate = compile(&spec, &user_model()).unwrap();
        let Predicate::And(parts) = predicate else {
            panic!("expected AND root");
        };
        assert_eq!(parts.len(), 1);
        let Predicate::Or(likes) = &parts[0] else {
            panic!("expected OR keyword group");
        };
        assert!(
            likes
                .iter()
                .all(|p| matches!(p, Predicate::Cmp { op: CmpOp::Like, value, .. } if value == &json!("%term%")))
        );
    }

    #[test]
    fn test_raw_replaces_everything() {
        let raw = Predicate::eq("id", 7);
        let mut searchable = BTreeMap::new();
        searchable.insert("name".to_string(), SearchableRule::operator("like"));
        let spec = FilterSpec {
            where_map: where_map(json!({"name": "al"})),
            raw: Some(raw.clone()),
            searchable: Some(searchable),
            keyword: Some("term".to_string()),
            ..Default::default()
        };
        assert_eq!(compile(&spec, &user_model()).unwrap(), raw);
    }

    #[test]
    fn test_bad_operator_fails_loudly() {
        let mut searchable = BTreeMap::new();
        searchable.insert("name".to_string(), SearchableRule::operator("abc"));
        let spec = FilterSpec {
            searchable: Some(searchable),
            ..Default::default()
        };
        let err = compile(&spec, &user_model()).unwrap_err();
        assert_eq!(err.to_string(), "this operator not supported.");
    }

    #[test]
    fn test_bad_condition_fails_loudly() {
        let mut searchable = BTreeMap::new();
        searchable.insert(
            "name".to_string(),
            SearchableRule::full("=", "xor", json!("x")),
        );
        let spec = FilterSpec {
            searchable: Some(searchable),
            ..Default::default()
        };
        let err = compile(&spec, &user_model()).unwrap_err();
        assert_eq!(err.to_string(), "this condition not supported.");
    }
}
