//! Field descriptors and input/output shaping.
//!
//! Format paths are dotted field names. Shaping walks each declared path,
//! coerces the value and writes it into the result, so nested association
//! payloads travel through create/update/getDetail uniformly.

use crate::error::QuerierResult;
use crate::predicate::{get_path, is_date_like};
use crate::query::QueryDescriptor;
use crate::schema::{
    AssociationSelect, ModelRegistry, Prefix, TypeTag, AUDIT_FIELDS,
};
use crate::store::Store;
use heck::ToTitleCase;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Record-level transform hook run after shaping.
pub type FormatCb = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Field-name to display-label transform, the i18n seam.
pub type Labeler = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// UI-facing type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Text,
    Number,
    Date,
    Boolean,
    Json,
    Uuid,
    /// Single-select from a fixed value list.
    Chosen,
}

impl From<TypeTag> for FieldType {
    fn from(tag: TypeTag) -> Self {
        match tag {
            TypeTag::String => Self::String,
            TypeTag::Text => Self::Text,
            TypeTag::Integer | TypeTag::Double => Self::Number,
            TypeTag::Date | TypeTag::DateOnly => Self::Date,
            TypeTag::Boolean => Self::Boolean,
            TypeTag::Json => Self::Json,
            TypeTag::Uuid => Self::Uuid,
            TypeTag::Enum => Self::Chosen,
        }
    }
}

/// One selectable option of a chosen field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChoice {
    pub value: Value,
    pub name: Value,
}

/// Declared presentation of one model field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub label: String,
    pub required: bool,
    pub readonly: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<FieldChoice>>,
}

/// Options for [`output_fields`].
#[derive(Clone, Default)]
pub struct OutputFieldsOpts {
    pub prefix: Prefix,
    pub required: Vec<String>,
    pub readonly: Vec<String>,
    pub exclude: Vec<String>,
    /// Extra field names appended with string type.
    pub include: Vec<String>,
    pub labeler: Option<Labeler>,
}

fn label_for(name: &str, labeler: Option<&Labeler>) -> String {
    match labeler {
        Some(labeler) => labeler(name),
        None => name.to_title_case(),
    }
}

/// Field descriptors of a model's non-audit columns.
pub fn output_fields(
    registry: &ModelRegistry,
    model_name: &str,
    opts: &OutputFieldsOpts,
) -> QuerierResult<Vec<FieldDescriptor>> {
    let model = registry.get(model_name)?;
    let prefix = match &opts.prefix {
        Prefix::None => String::new(),
        Prefix::Model => format!("{}.", model.name),
        Prefix::ModelPlural => format!("{}s.", model.name),
        Prefix::Custom(p) => format!("{p}."),
    };
    let mut fields = Vec::new();
    for column in &model.columns {
        if AUDIT_FIELDS.contains(&column.name.as_str())
            || opts.exclude.iter().any(|e| *e == column.name)
        {
            continue;
        }
        let name = format!("{prefix}{}", column.name);
        let values = column.enum_values.as_ref().map(|values| {
            values
                .iter()
                .map(|v| FieldChoice {
                    value: Value::from(v.clone()),
                    name: Value::from(v.clone()),
                })
                .collect()
        });
        fields.push(FieldDescriptor {
            name: name.clone(),
            field_type: column.type_tag.into(),
            label: label_for(&name, opts.labeler.as_ref()),
            required: opts.required.iter().any(|r| *r == name)
                || (!column.nullable && !column.primary_key),
            readonly: opts.readonly.iter().any(|r| *r == name),
            limit: column.length,
            values,
        });
    }
    for name in &opts.include {
        fields.push(FieldDescriptor {
            name: name.clone(),
            field_type: FieldType::String,
            label: label_for(name, opts.labeler.as_ref()),
            required: opts.required.iter().any(|r| r == name),
            readonly: opts.readonly.iter().any(|r| r == name),
            limit: None,
            values: None,
        });
    }
    Ok(fields)
}

/// Write a value at a dotted path, creating intermediate objects.
pub(crate) fn set_path(target: &mut Value, path: &str, value: Value) {
    let mut current = target;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = match current.as_object_mut() {
            Some(map) => map,
            None => return,
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Coerce one raw field value.
///
/// Empty strings, empty collections and the literal `"Invalid date"` become
/// null. Date-looking strings are validated against the calendar; failures
/// are logged as warnings and pass through untouched.
fn coerce_field(value: &Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
        Value::String(s) => {
            if s.is_empty() || s == "Invalid date" {
                return Value::Null;
            }
            if is_date_like(s) && chrono::NaiveDate::parse_from_str(&s[..10], "%Y-%m-%d").is_err()
            {
                tracing::warn!(value = %s, "date-looking value failed to parse");
            }
            value.clone()
        }
        Value::Array(items) if items.is_empty() => Value::Null,
        Value::Object(map) if map.is_empty() => Value::Null,
        other => other.clone(),
    }
}

/// Shape a raw input payload onto a base record.
///
/// Only declared paths present in the input are written; everything else on
/// the base survives, which makes the same call serve create (empty base) and
/// update (existing record base).
pub fn format_input(
    format: &[String],
    mut base: Value,
    input: &Value,
    cb: Option<&FormatCb>,
) -> Value {
    for path in format {
        if let Some(value) = get_path(input, path) {
            set_path(&mut base, path, coerce_field(value));
        }
    }
    match cb {
        Some(cb) => cb(base),
        None => base,
    }
}

/// Options for [`format_output`].
#[derive(Clone, Default)]
pub struct FormatOutputOpts {
    pub format: Vec<String>,
    pub fields: Option<Vec<FieldDescriptor>>,
    pub required: Vec<String>,
    pub readonly: Vec<String>,
    /// Extra top-level entries merged into the result.
    pub extra: Map<String, Value>,
    /// View mode attaches `_fields` metadata for form rendering.
    pub view: bool,
    pub cb: Option<FormatCb>,
}

/// Shape a fetched record for output.
pub fn format_output(opts: &FormatOutputOpts, data: Option<Value>) -> Value {
    let mut result = if opts.format.is_empty() {
        data.unwrap_or(Value::Null)
    } else {
        let data = data.unwrap_or(Value::Null);
        let mut shaped = Value::Object(Map::new());
        for path in &opts.format {
            let value = get_path(&data, path)
                .map(coerce_field)
                .unwrap_or(Value::Null);
            set_path(&mut shaped, path, value);
        }
        shaped
    };
    if opts.view {
        if let Some(fields) = &opts.fields {
            let annotated: Vec<FieldDescriptor> = fields
                .iter()
                .cloned()
                .map(|mut field| {
                    field.required =
                        field.required || opts.required.iter().any(|r| *r == field.name);
                    field.readonly =
                        field.readonly || opts.readonly.iter().any(|r| *r == field.name);
                    field
                })
                .collect();
            if !result.is_object() {
                result = Value::Object(Map::new());
            }
            result["_fields"] = json!(annotated);
        }
    }
    if !opts.extra.is_empty() {
        if !result.is_object() {
            result = Value::Object(Map::new());
        }
        if let Some(map) = result.as_object_mut() {
            for (key, value) in &opts.extra {
                map.insert(key.clone(), value.clone());
            }
        }
    }
    match &opts.cb {
        Some(cb) => cb(result),
        None => result,
    }
}

/// How to derive a display name for one model's chosen options.
#[derive(Clone)]
pub enum DisplayName {
    /// Read the given property off each row.
    Property(String),
    /// Compute the name from the full row.
    Func(Arc<dyn Fn(&Value) -> Value + Send + Sync>),
}

/// Display-name rule for one associated model.
#[derive(Clone)]
pub struct OutputFieldNamePair {
    pub model_name: String,
    pub display: DisplayName,
}

impl OutputFieldNamePair {
    pub fn property(model_name: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            display: DisplayName::Property(property.into()),
        }
    }

    pub fn func(
        model_name: impl Into<String>,
        func: Arc<dyn Fn(&Value) -> Value + Send + Sync>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            display: DisplayName::Func(func),
        }
    }
}

fn display_name(row: &Value, display: Option<&DisplayName>) -> Value {
    let derived = match display {
        Some(DisplayName::Property(prop)) => row.get(prop).cloned(),
        Some(DisplayName::Func(func)) => Some(func(row)),
        None => None,
    };
    derived
        .filter(|v| !v.is_null())
        .or_else(|| row.get("name").cloned().filter(|v| !v.is_null()))
        .or_else(|| row.get("key").cloned().filter(|v| !v.is_null()))
        .or_else(|| row.get("id").cloned())
        .unwrap_or(Value::Null)
}

/// Turn each `<Association>Id` foreign-key field into a chosen field whose
/// options are the associated model's current rows, plus a null option.
pub async fn apply_chosen_fields(
    registry: &ModelRegistry,
    store: &dyn Store,
    model_name: &str,
    fields: &mut [FieldDescriptor],
    pairs: &[OutputFieldNamePair],
) -> QuerierResult<()> {
    let associations = registry.associations(model_name, AssociationSelect::One2One)?;
    for association in associations {
        let fk_name = format!("{}Id", association.singular);
        let Some(field) = fields.iter_mut().find(|f| f.name == fk_name) else {
            continue;
        };
        let target = registry.get(&association.target)?;
        let pk = target.primary_key().to_string();
        let rows = store.find(&QueryDescriptor::all(target)).await?.rows;
        let display = pairs
            .iter()
            .find(|p| p.model_name.eq_ignore_ascii_case(&association.target))
            .map(|p| &p.display);
        let mut choices = vec![FieldChoice {
            value: Value::Null,
            name: Value::Null,
        }];
        for row in &rows {
            choices.push(FieldChoice {
                value: row.get(&pk).cloned().unwrap_or(Value::Null),
                name: display_name(row, display),
            });
        }
        field.field_type = FieldType::Chosen;
        field.required = true;
        field.values = Some(choices);
    }
    Ok(())
}

/// Index-page table metadata derived from field descriptors.
pub(crate) fn table_meta(fields: &[FieldDescriptor]) -> Value {
    let headers: Vec<Value> = fields
        .iter()
        .map(|f| json!({"label": f.label, "key": f.name}))
        .collect();
    let columns: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
    json!({"headers": headers, "columns": columns})
}
