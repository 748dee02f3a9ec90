//! Model metadata and schema introspection.
//!
//! The registry is the single resolution point for model names (case-insensitive,
//! matching the hosting framework's registry contract). Descriptors are read-only
//! to the rest of the crate: they are registered once and shared via `Arc`.

use crate::error::{QuerierError, QuerierResult};
use crate::predicate::Predicate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Audit fields excluded from column listings by default.
pub const AUDIT_FIELDS: [&str; 4] = ["createdAt", "updatedAt", "deletedAt", "id"];

/// Type tag of a model column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeTag {
    String,
    Text,
    Integer,
    Double,
    Boolean,
    Date,
    DateOnly,
    Json,
    Uuid,
    Enum,
}

impl TypeTag {
    /// Columns eligible for free-text keyword search.
    pub fn is_text_searchable(self) -> bool {
        matches!(
            self,
            Self::String | Self::Text | Self::Json | Self::Uuid | Self::Enum
        )
    }
}

/// Metadata for a single model column.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    pub type_tag: TypeTag,
    pub nullable: bool,
    pub primary_key: bool,
    pub length: Option<u32>,
    pub enum_values: Option<Vec<String>>,
}

impl ColumnMeta {
    /// Create a nullable, non-key column.
    pub fn new(name: impl Into<String>, type_tag: TypeTag) -> Self {
        Self {
            name: name.into(),
            type_tag,
            nullable: true,
            primary_key: false,
            length: None,
            enum_values: None,
        }
    }

    /// Mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark the column as the primary key.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Set the declared length (VARCHAR-style limit).
    pub fn with_length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    /// Set the enum value list (for `TypeTag::Enum` columns).
    pub fn with_values(mut self, values: &[&str]) -> Self {
        self.enum_values = Some(values.iter().map(|s| s.to_string()).collect());
        self
    }
}

/// Association cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    /// Foreign-key style: this model carries a `<Name>Id` column.
    OneToOne,
    /// Collection style: the target carries a `<ThisModel>Id` column.
    OneToMany,
}

/// A declared association between two model types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationMeta {
    /// The association key this model exposes (singular for one-to-one,
    /// plural for one-to-many).
    pub name: String,
    pub singular: String,
    pub plural: String,
    /// Target model name.
    pub target: String,
    pub cardinality: Cardinality,
}

impl AssociationMeta {
    /// A foreign-key association (`belongsTo`): this model has `<target>Id`.
    pub fn one_to_one(target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            name: target.clone(),
            singular: target.clone(),
            plural: format!("{target}s"),
            target,
            cardinality: Cardinality::OneToOne,
        }
    }

    /// A collection association (`hasMany`): the target has `<this>Id`.
    pub fn one_to_many(target: impl Into<String>) -> Self {
        let target = target.into();
        let plural = format!("{target}s");
        Self {
            name: plural.clone(),
            singular: target.clone(),
            plural,
            target,
            cardinality: Cardinality::OneToMany,
        }
    }

    /// Override the plural alias (for irregular plurals).
    pub fn with_plural(mut self, plural: impl Into<String>) -> Self {
        self.plural = plural.into();
        if self.cardinality == Cardinality::OneToMany {
            self.name = self.plural.clone();
        }
        self
    }
}

/// A named, reusable predicate preset attached to a model.
#[derive(Debug, Clone)]
pub struct Scope {
    pub predicate: Predicate,
}

/// Opaque handle to a named entity type: columns, associations, scopes.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub name: String,
    pub columns: Vec<ColumnMeta>,
    pub associations: Vec<AssociationMeta>,
    pub scopes: HashMap<String, Scope>,
}

impl ModelDescriptor {
    /// Create a descriptor with the standard audit columns pre-declared.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: vec![
                ColumnMeta::new("id", TypeTag::Integer).primary_key(),
                ColumnMeta::new("createdAt", TypeTag::Date),
                ColumnMeta::new("updatedAt", TypeTag::Date),
            ],
            associations: Vec::new(),
            scopes: HashMap::new(),
        }
    }

    /// Add a column.
    pub fn with_column(mut self, column: ColumnMeta) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a `deletedAt` audit column, enabling soft-delete semantics.
    pub fn with_soft_delete(self) -> Self {
        self.with_column(ColumnMeta::new("deletedAt", TypeTag::Date))
    }

    /// Add an association.
    pub fn with_association(mut self, association: AssociationMeta) -> Self {
        // One-to-one associations imply a foreign-key column on this model.
        if association.cardinality == Cardinality::OneToOne
            && !self.has_column(&format!("{}Id", association.singular))
        {
            self.columns.push(ColumnMeta::new(
                format!("{}Id", association.singular),
                TypeTag::Integer,
            ));
        }
        self.associations.push(association);
        self
    }

    /// Attach a named scope.
    pub fn with_scope(mut self, name: impl Into<String>, predicate: Predicate) -> Self {
        self.scopes.insert(name.into(), Scope { predicate });
        self
    }

    /// The primary key column name (`id` when none is declared).
    pub fn primary_key(&self) -> &str {
        self.columns
            .iter()
            .find(|c| c.primary_key)
            .map_or("id", |c| c.name.as_str())
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Check if the model declares a column with the given name.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Look up an association whose target is the given model name.
    pub fn association_to(&self, target: &str) -> Option<&AssociationMeta> {
        self.associations
            .iter()
            .find(|a| a.target.eq_ignore_ascii_case(target))
    }
}

/// Column prefixing mode for [`ModelRegistry::columns`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Prefix {
    #[default]
    None,
    /// Dotted model-name prefix: `Parent.email`.
    Model,
    /// Dotted plural model-name prefix: `Parents.email`.
    ModelPlural,
    /// Custom dotted prefix, for nested include paths.
    Custom(String),
}

/// Options for [`ModelRegistry::columns`].
#[derive(Debug, Clone, Default)]
pub struct ColumnsQuery {
    pub prefix: Prefix,
    pub exclude: Vec<String>,
    /// Extra names appended verbatim after the model's own columns.
    pub include: Vec<String>,
    /// Keep only NOT NULL, non-key columns (the auto-required set).
    pub required_only: bool,
}

/// Selection mode for [`ModelRegistry::associations`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationSelect {
    All,
    /// Singular-keyed, foreign-key style associations only.
    One2One,
    /// Plural-keyed collection associations only.
    One2Many,
}

/// A keyword-searchable column reference (`Model.column`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchableColumn {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: SearchKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchKind {
    #[serde(rename = "STRING")]
    Text,
    #[serde(rename = "DATE")]
    Date,
    #[serde(rename = "NUMBER")]
    Number,
}

/// Options for [`ModelRegistry::searchable_columns`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchableColumnsQuery {
    pub date: bool,
    pub integer: bool,
}

/// Case-insensitive model-name registry.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<ModelDescriptor>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model descriptor under its (lowercased) name.
    pub fn register(&mut self, model: ModelDescriptor) {
        self.models
            .insert(model.name.to_lowercase(), Arc::new(model));
    }

    /// Resolve a model by name, case-insensitive.
    ///
    /// Fails with [`QuerierError::ModelNotFound`] when the name does not resolve;
    /// an empty name is a missing-parameter error.
    pub fn get(&self, name: &str) -> QuerierResult<Arc<ModelDescriptor>> {
        if name.is_empty() {
            let err = QuerierError::missing_parameter("modelName");
            tracing::error!(error = %err, "model lookup with empty name");
            return Err(err);
        }
        self.models.get(&name.to_lowercase()).cloned().ok_or_else(|| {
            let err = QuerierError::model_not_found(name);
            tracing::error!(error = %err, model = name, "model not registered");
            err
        })
    }

    /// Column names of a model, audit fields excluded.
    pub fn columns(&self, model_name: &str, query: &ColumnsQuery) -> QuerierResult<Vec<String>> {
        let model = self.get(model_name)?;
        let prefix = match &query.prefix {
            Prefix::None => String::new(),
            Prefix::Model => format!("{}.", model.name),
            Prefix::ModelPlural => {
                // Plural alias from the reverse association when one is declared,
                // naive `s` suffix otherwise.
                format!("{}s.", model.name)
            }
            Prefix::Custom(p) => format!("{p}."),
        };
        let mut names: Vec<String> = model
            .columns
            .iter()
            .filter(|c| !AUDIT_FIELDS.contains(&c.name.as_str()))
            .filter(|c| !query.exclude.iter().any(|ex| *ex == c.name))
            .filter(|c| !query.required_only || (!c.nullable && !c.primary_key))
            .map(|c| format!("{prefix}{}", c.name))
            .collect();
        names.extend(query.include.iter().cloned());
        Ok(names)
    }

    /// Type tag of a column, `None` when the column does not exist.
    pub fn column_type(
        &self,
        model_name: &str,
        column_name: &str,
    ) -> QuerierResult<Option<TypeTag>> {
        let model = self.get(model_name)?;
        Ok(model.column(column_name).map(|c| c.type_tag))
    }

    /// Enum values of a column, `None` for non-enum columns.
    pub fn enum_values(
        &self,
        model_name: &str,
        column_name: &str,
    ) -> QuerierResult<Option<Vec<String>>> {
        if column_name.is_empty() {
            return Err(QuerierError::missing_parameter("columnName"));
        }
        let model = self.get(model_name)?;
        Ok(model.column(column_name).and_then(|c| c.enum_values.clone()))
    }

    /// Associations of a model, filtered by selection mode.
    pub fn associations(
        &self,
        model_name: &str,
        select: AssociationSelect,
    ) -> QuerierResult<Vec<AssociationMeta>> {
        let model = self.get(model_name)?;
        Ok(model
            .associations
            .iter()
            .filter(|a| match select {
                AssociationSelect::All => true,
                AssociationSelect::One2One => a.name == a.singular,
                AssociationSelect::One2Many => a.name == a.plural,
            })
            .cloned()
            .collect())
    }

    /// Association key names of a model (the `name` of each association).
    pub fn association_names(
        &self,
        model_name: &str,
        select: AssociationSelect,
    ) -> QuerierResult<Vec<String>> {
        Ok(self
            .associations(model_name, select)?
            .into_iter()
            .map(|a| a.name)
            .collect())
    }

    /// Keyword-searchable columns as `Model.column` keys.
    ///
    /// Text-like columns are always returned; date and integer columns join the
    /// set when requested.
    pub fn searchable_columns(
        &self,
        model_name: &str,
        query: SearchableColumnsQuery,
    ) -> QuerierResult<Vec<SearchableColumn>> {
        let model = self.get(model_name)?;
        let mut targets = Vec::new();
        for column in &model.columns {
            if AUDIT_FIELDS.contains(&column.name.as_str()) {
                continue;
            }
            let key = format!("{}.{}", model.name, column.name);
            if column.type_tag.is_text_searchable() {
                targets.push(SearchableColumn {
                    key,
                    kind: SearchKind::Text,
                });
            } else if query.date
                && matches!(column.type_tag, TypeTag::Date | TypeTag::DateOnly)
            {
                targets.push(SearchableColumn {
                    key,
                    kind: SearchKind::Date,
                });
            } else if query.integer && column.type_tag == TypeTag::Integer {
                targets.push(SearchableColumn {
                    key,
                    kind: SearchKind::Number,
                });
            }
        }
        Ok(targets)
    }

    /// Empty all-null JSON scaffold of a model's columns.
    pub fn build_empty_model(
        &self,
        model_name: &str,
        exclude: &[String],
        include: &[String],
    ) -> QuerierResult<Value> {
        let names = self.columns(
            model_name,
            &ColumnsQuery {
                exclude: exclude.to_vec(),
                include: include.to_vec(),
                ..Default::default()
            },
        )?;
        let mut empty = Map::new();
        for name in names {
            empty.insert(name, Value::Null);
        }
        Ok(Value::Object(empty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ModelRegistry {
        let mut registry = ModelRegistry::new();
        registry.register(
            ModelDescriptor::new("User")
                .with_soft_delete()
                .with_column(ColumnMeta::new("name", TypeTag::String).not_null())
                .with_column(ColumnMeta::new("age", TypeTag::Integer))
                .with_association(AssociationMeta::one_to_many("Image"))
                .with_association(AssociationMeta::one_to_one("Group")),
        );
        registry.register(
            ModelDescriptor::new("Group")
                .with_column(
                    ColumnMeta::new("role", TypeTag::Enum).with_values(&["USER", "ADMIN"]),
                )
                .with_column(ColumnMeta::new("name", TypeTag::String))
                .with_association(AssociationMeta::one_to_many("User")),
        );
        registry
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = registry();
        assert!(registry.get("user").is_ok());
        assert!(registry.get("USER").is_ok());
        let err = registry.get("missing").unwrap_err();
        assert!(matches!(err, QuerierError::ModelNotFound { .. }));
    }

    #[test]
    fn test_columns_exclude_audit_fields() {
        let registry = registry();
        let columns = registry.columns("User", &ColumnsQuery::default()).unwrap();
        for audit in AUDIT_FIELDS {
            assert!(!columns.contains(&audit.to_string()));
        }
        assert!(columns.contains(&"name".to_string()));
        // Idempotent: pure function of the schema.
        let again = registry.columns("User", &ColumnsQuery::default()).unwrap();
        assert_eq!(columns, again);
    }

    #[test]
    fn test_columns_with_prefix_and_extras() {
        let registry = registry();
        let columns = registry
            .columns(
                "User",
                &ColumnsQuery {
                    prefix: Prefix::Model,
                    exclude: vec!["age".to_string()],
                    include: vec!["email".to_string()],
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(columns.contains(&"User.name".to_string()));
        assert!(!columns.iter().any(|c| c.ends_with(".age")));
        assert_eq!(columns.last().unwrap(), "email");
    }

    #[test]
    fn test_required_only_columns() {
        let registry = registry();
        let columns = registry
            .columns(
                "User",
                &ColumnsQuery {
                    required_only: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(columns, vec!["name".to_string()]);
    }

    #[test]
    fn test_one_to_one_implies_fk_column() {
        let registry = registry();
        let user = registry.get("User").unwrap();
        assert!(user.has_column("GroupId"));
    }

    #[test]
    fn test_association_selection() {
        let registry = registry();
        let one2one = registry
            .association_names("User", AssociationSelect::One2One)
            .unwrap();
        assert_eq!(one2one, vec!["Group".to_string()]);
        let one2many = registry
            .association_names("User", AssociationSelect::One2Many)
            .unwrap();
        assert_eq!(one2many, vec!["Images".to_string()]);
    }

    #[test]
    fn test_searchable_columns() {
        let registry = registry();
        let targets = registry
            .searchable_columns("Group", SearchableColumnsQuery::default())
            .unwrap();
        let keys: Vec<_> = targets.iter().map(|t| t.key.as_str()).collect();
        assert!(keys.contains(&"Group.name"));
        assert!(keys.contains(&"Group.role"));

        let with_numbers = registry
            .searchable_columns(
                "User",
                SearchableColumnsQuery {
                    integer: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(
            with_numbers
                .iter()
                .any(|t| t.key == "User.age" && t.kind == SearchKind::Number)
        );
    }

    #[test]
    fn test_enum_values() {
        let registry = registry();
        let values = registry.enum_values("Group", "role").unwrap().unwrap();
        assert_eq!(values, vec!["USER".to_string(), "ADMIN".to_string()]);
        assert!(registry.enum_values("Group", "name").unwrap().is_none());
    }

    #[test]
    fn test_build_empty_model() {
        let registry = registry();
        let empty = registry.build_empty_model("User", &[], &[]).unwrap();
        assert!(empty["name"].is_null());
        assert!(empty.get("id").is_none());
    }
}
