//! The storage seam and the in-memory reference store.
//!
//! A [`Store`] receives fully-resolved [`QueryDescriptor`]s and speaks JSON
//! rows. [`MemoryStore`] implements the full contract in process, soft-delete
//! and association attachment included, and backs the test suite.

use crate::error::{QuerierError, QuerierResult};
use crate::predicate::Predicate;
use crate::query::{IncludeSpec, OrderTerm, QueryDescriptor, SortDir};
use crate::schema::{Cardinality, ModelDescriptor};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;

/// A page of rows plus the ungrouped total matching the predicate.
#[derive(Debug, Clone)]
pub struct FindResult {
    pub rows: Vec<Value>,
    pub total: u64,
}

/// Backend seam for row storage.
#[async_trait]
pub trait Store: Send + Sync {
    /// Execute a listing query.
    async fn find(&self, query: &QueryDescriptor) -> QuerierResult<FindResult>;

    /// Fetch the first row matching a query.
    async fn find_one(&self, query: &QueryDescriptor) -> QuerierResult<Option<Value>>;

    /// Insert a record, cascading into nested association payloads.
    async fn create(
        &self,
        model: &ModelDescriptor,
        data: &Value,
        includes: &[IncludeSpec],
    ) -> QuerierResult<Value>;

    /// Merge fields into every row matching the predicate. Returns the
    /// affected row count.
    async fn update(
        &self,
        model: &ModelDescriptor,
        predicate: &Predicate,
        data: &Value,
    ) -> QuerierResult<u64>;

    /// Delete rows matching the predicate. Soft-deletes when the model has a
    /// `deletedAt` column and `force` is false. Returns the affected count.
    async fn destroy(
        &self,
        model: &ModelDescriptor,
        predicate: &Predicate,
        force: bool,
    ) -> QuerierResult<u64>;
}

#[derive(Default)]
struct Table {
    next_id: i64,
    rows: Vec<Map<String, Value>>,
}

type Tables = HashMap<String, Table>;

/// In-process [`Store`] keyed by model name.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> QuerierResult<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| QuerierError::Store("store mutex poisoned".to_string()))
    }
}

fn now_string() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn soft_deleted(model: &ModelDescriptor, row: &Map<String, Value>) -> bool {
    model.has_column("deletedAt") && row.get("deletedAt").is_some_and(|v| !v.is_null())
}

fn create_row(
    tables: &mut Tables,
    model: &ModelDescriptor,
    data: &Value,
    includes: &[IncludeSpec],
) -> QuerierResult<Value> {
    let Value::Object(data) = data else {
        return Err(QuerierError::validation(format!(
            "{} record payload must be an object",
            model.name
        )));
    };
    let mut data = data.clone();
    let mut stored = Map::new();
    let mut attached = Map::new();

    // One-to-one children first so the foreign key is known before insert.
    for include in includes {
        if include.association.cardinality != Cardinality::OneToOne {
            continue;
        }
        let Some(child) = data.remove(include.attach_key()) else {
            continue;
        };
        if child.is_null() {
            continue;
        }
        let child_record = create_row(tables, &include.model, &child, &include.includes)?;
        stored.insert(
            format!("{}Id", include.association.singular),
            child_record["id"].clone(),
        );
        attached.insert(include.attach_key().to_string(), child_record);
    }

    let collection_keys: Vec<String> = includes
        .iter()
        .filter(|i| i.association.cardinality == Cardinality::OneToMany)
        .map(|i| i.attach_key().to_string())
        .collect();
    for (key, value) in &data {
        // Foreign keys filled from nested children above win over the
        // payload's own (usually null) values.
        if collection_keys.contains(key) || stored.contains_key(key) {
            continue;
        }
        stored.insert(key.clone(), value.clone());
    }

    let table = tables.entry(model.name.clone()).or_default();
    table.next_id += 1;
    let id = table.next_id;
    let now = now_string();
    stored.insert("id".to_string(), Value::from(id));
    stored.insert("createdAt".to_string(), Value::from(now.clone()));
    stored.insert("updatedAt".to_string(), Value::from(now));
    if model.has_column("deletedAt") {
        stored.entry("deletedAt".to_string()).or_insert(Value::Null);
    }
    table.rows.push(stored.clone());

    // Collection children carry the parent's foreign key.
    for include in includes {
        if include.association.cardinality != Cardinality::OneToMany {
            continue;
        }
        let Some(Value::Array(children)) = data.remove(include.attach_key()) else {
            continue;
        };
        let mut records = Vec::with_capacity(children.len());
        for child in children {
            let Value::Object(mut child) = child else {
                return Err(QuerierError::validation(format!(
                    "{} nested payload must contain objects",
                    include.model.name
                )));
            };
            child.insert(format!("{}Id", model.name), Value::from(id));
            records.push(create_row(
                tables,
                &include.model,
                &Value::Object(child),
                &include.includes,
            )?);
        }
        attached.insert(include.attach_key().to_string(), Value::Array(records));
    }

    let mut result = stored;
    result.append(&mut attached);
    Ok(Value::Object(result))
}

/// Attach one include level to a row. Returns `false` when a required
/// association has no match and the row must be dropped.
fn attach_includes(
    tables: &Tables,
    parent: &ModelDescriptor,
    row: &mut Map<String, Value>,
    includes: &[IncludeSpec],
) -> bool {
    for include in includes {
        let table = tables.get(&include.model.name);
        let rows = table.map(|t| t.rows.as_slice()).unwrap_or_default();
        match include.association.cardinality {
            Cardinality::OneToOne => {
                let fk = row
                    .get(&format!("{}Id", include.association.singular))
                    .cloned()
                    .unwrap_or(Value::Null);
                let child = rows
                    .iter()
                    .filter(|r| !soft_deleted(&include.model, r))
                    .find(|r| r.get("id") == Some(&fk))
                    .cloned()
                    .and_then(|mut child| {
                        if !attach_includes(tables, &include.model, &mut child, &include.includes)
                        {
                            return None;
                        }
                        let value = Value::Object(child);
                        match &include.predicate {
                            Some(p) if !p.matches(&value) => None,
                            _ => Some(value),
                        }
                    })
                    .map(|child| project(child, &include.attributes, &include.includes));
                if include.required && child.is_none() {
                    return false;
                }
                row.insert(
                    include.attach_key().to_string(),
                    child.unwrap_or(Value::Null),
                );
            }
            Cardinality::OneToMany => {
                let parent_id = row.get("id").cloned().unwrap_or(Value::Null);
                let fk_column = parent_fk_column(parent, include);
                let mut children: Vec<Value> = rows
                    .iter()
                    .filter(|r| !soft_deleted(&include.model, r))
                    .filter(|r| r.get(&fk_column) == Some(&parent_id))
                    .cloned()
                    .filter_map(|mut child| {
                        if !attach_includes(tables, &include.model, &mut child, &include.includes)
                        {
                            return None;
                        }
                        let value = Value::Object(child);
                        match &include.predicate {
                            Some(p) if !p.matches(&value) => None,
                            _ => Some(value),
                        }
                    })
                    .map(|child| project(child, &include.attributes, &include.includes))
                    .collect();
                if let Some(limit) = include.limit {
                    children.truncate(limit as usize);
                }
                if include.required && children.is_empty() {
                    return false;
                }
                row.insert(include.attach_key().to_string(), Value::Array(children));
            }
        }
    }
    true
}

fn parent_fk_column(parent: &ModelDescriptor, include: &IncludeSpec) -> String {
    // The child holds `<ParentSingular>Id` back to its parent.
    include
        .model
        .association_to(&parent.name)
        .map(|a| format!("{}Id", a.singular))
        .unwrap_or_else(|| format!("{}Id", parent.name))
}

fn project(value: Value, attributes: &[String], includes: &[IncludeSpec]) -> Value {
    if attributes.is_empty() {
        return value;
    }
    let Value::Object(map) = value else {
        return value;
    };
    let keep: Vec<&str> = includes.iter().map(|i| i.attach_key()).collect();
    let projected: Map<String, Value> = map
        .into_iter()
        .filter(|(k, _)| attributes.iter().any(|a| a == k) || keep.contains(&k.as_str()))
        .collect();
    Value::Object(projected)
}

fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        _ => Ordering::Equal,
    }
}

fn sort_rows(rows: &mut [Value], order: &[OrderTerm]) {
    rows.sort_by(|a, b| {
        for term in order {
            let left = a.get(&term.column).unwrap_or(&Value::Null);
            let right = b.get(&term.column).unwrap_or(&Value::Null);
            let ordering = match term.dir {
                SortDir::Asc => compare_values(left, right),
                SortDir::Desc => compare_values(right, left),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn collect_rows(tables: &Tables, query: &QueryDescriptor) -> Vec<Value> {
    let rows = tables
        .get(&query.model.name)
        .map(|t| t.rows.clone())
        .unwrap_or_default();
    let mut matched: Vec<Value> = rows
        .into_iter()
        .filter(|row| !soft_deleted(&query.model, row))
        .filter_map(|mut row| {
            if !attach_includes(tables, &query.model, &mut row, &query.includes) {
                return None;
            }
            let value = Value::Object(row);
            query.predicate.matches(&value).then_some(value)
        })
        .collect();
    sort_rows(&mut matched, &query.order);
    if !query.group.is_empty() {
        let mut seen = Vec::new();
        matched.retain(|row| {
            let key: Vec<Value> = query
                .group
                .iter()
                .map(|g| row.get(g).cloned().unwrap_or(Value::Null))
                .collect();
            if seen.contains(&key) {
                false
            } else {
                seen.push(key);
                true
            }
        });
    }
    matched
}

#[async_trait]
impl Store for MemoryStore {
    async fn find(&self, query: &QueryDescriptor) -> QuerierResult<FindResult> {
        let tables = self.lock()?;
        let mut rows = collect_rows(&tables, query);
        let total = rows.len() as u64;
        if let Some(offset) = query.pagination.offset {
            rows = rows.split_off((offset as usize).min(rows.len()));
        }
        if let Some(limit) = query.pagination.limit {
            rows.truncate(limit as usize);
        }
        let rows = rows
            .into_iter()
            .map(|row| project(row, &query.attributes, &query.includes))
            .collect();
        Ok(FindResult { rows, total })
    }

    async fn find_one(&self, query: &QueryDescriptor) -> QuerierResult<Option<Value>> {
        let tables = self.lock()?;
        let rows = collect_rows(&tables, query);
        Ok(rows
            .into_iter()
            .next()
            .map(|row| project(row, &query.attributes, &query.includes)))
    }

    async fn create(
        &self,
        model: &ModelDescriptor,
        data: &Value,
        includes: &[IncludeSpec],
    ) -> QuerierResult<Value> {
        let mut tables = self.lock()?;
        create_row(&mut tables, model, data, includes)
    }

    async fn update(
        &self,
        model: &ModelDescriptor,
        predicate: &Predicate,
        data: &Value,
    ) -> QuerierResult<u64> {
        let Value::Object(data) = data else {
            return Err(QuerierError::validation(format!(
                "{} update payload must be an object",
                model.name
            )));
        };
        let mut tables = self.lock()?;
        let Some(table) = tables.get_mut(&model.name) else {
            return Ok(0);
        };
        let now = now_string();
        let mut affected = 0;
        for row in &mut table.rows {
            if soft_deleted(model, row) || !predicate.matches(&Value::Object(row.clone())) {
                continue;
            }
            for (key, value) in data {
                // Nested association payloads are not merged into the row.
                if value.is_object() || value.is_array() {
                    continue;
                }
                row.insert(key.clone(), value.clone());
            }
            row.insert("updatedAt".to_string(), Value::from(now.clone()));
            affected += 1;
        }
        Ok(affected)
    }

    async fn destroy(
        &self,
        model: &ModelDescriptor,
        predicate: &Predicate,
        force: bool,
    ) -> QuerierResult<u64> {
        let mut tables = self.lock()?;
        let Some(table) = tables.get_mut(&model.name) else {
            return Ok(0);
        };
        if !force && model.has_column("deletedAt") {
            let now = now_string();
            let mut affected = 0;
            for row in &mut table.rows {
                if soft_deleted(model, row) || !predicate.matches(&Value::Object(row.clone())) {
                    continue;
                }
                row.insert("deletedAt".to_string(), Value::from(now.clone()));
                row.insert("updatedAt".to_string(), Value::from(now.clone()));
                affected += 1;
            }
            Ok(affected)
        } else {
            let before = table.rows.len();
            table
                .rows
                .retain(|row| !predicate.matches(&Value::Object(row.clone())));
            Ok((before - table.rows.len()) as u64)
        }
    }
}
