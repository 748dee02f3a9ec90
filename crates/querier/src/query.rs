//! Query composition: includes, ordering, grouping and pagination.
//!
//! [`compose`] assembles the fully-resolved [`QueryDescriptor`] a store
//! executes. Everything here is pure metadata work, no I/O.

use crate::error::{QuerierError, QuerierResult};
use crate::filter::{self, FilterSpec};
use crate::predicate::Predicate;
use crate::schema::{AssociationMeta, ModelDescriptor, ModelRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Sort direction. Descending is the default ordering of every listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDir {
    #[serde(rename = "ASC")]
    Asc,
    #[default]
    #[serde(rename = "DESC")]
    Desc,
}

impl SortDir {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_uppercase().as_str() {
            "ASC" => Some(Self::Asc),
            "DESC" => Some(Self::Desc),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// One column of an ORDER BY clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTerm {
    pub column: String,
    pub dir: SortDir,
}

impl OrderTerm {
    pub fn new(column: impl Into<String>, dir: SortDir) -> Self {
        Self {
            column: column.into(),
            dir,
        }
    }
}

/// Grouping behavior of a listing query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum GroupBy {
    /// Group by the root primary key when includes are present, so collection
    /// joins do not multiply the root rows. No grouping otherwise.
    #[default]
    Infer,
    Disabled,
    Columns(Vec<String>),
}

/// Reference to a model, either by registry name or by handle.
#[derive(Debug, Clone)]
pub enum ModelRef {
    Name(String),
    Handle(Arc<ModelDescriptor>),
}

impl ModelRef {
    pub(crate) fn resolve(&self, registry: &ModelRegistry) -> QuerierResult<Arc<ModelDescriptor>> {
        match self {
            Self::Name(name) => registry.get(name),
            Self::Handle(model) => Ok(model.clone()),
        }
    }
}

impl From<&str> for ModelRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for ModelRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<Arc<ModelDescriptor>> for ModelRef {
    fn from(model: Arc<ModelDescriptor>) -> Self {
        Self::Handle(model)
    }
}

/// Caller-facing include declaration, before association resolution.
#[derive(Debug, Clone)]
pub struct IncludeDef {
    pub target: ModelRef,
    pub alias: Option<String>,
    pub predicate: Option<Predicate>,
    pub includes: Vec<IncludeDef>,
    /// Inner-join semantics: parent rows without a match are dropped.
    pub required: bool,
    pub through: Option<String>,
    pub attributes: Vec<String>,
    pub limit: Option<u64>,
}

impl IncludeDef {
    pub fn new(target: impl Into<ModelRef>) -> Self {
        Self {
            target: target.into(),
            alias: None,
            predicate: None,
            includes: Vec::new(),
            required: false,
            through: None,
            attributes: Vec::new(),
            limit: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_include(mut self, include: IncludeDef) -> Self {
        self.includes.push(include);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_through(mut self, through: impl Into<String>) -> Self {
        self.through = Some(through.into());
        self
    }

    pub fn with_attributes(mut self, attributes: &[&str]) -> Self {
        self.attributes = attributes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Resolved include: target model plus the association that links it to the
/// parent.
#[derive(Debug, Clone)]
pub struct IncludeSpec {
    pub model: Arc<ModelDescriptor>,
    pub association: AssociationMeta,
    pub alias: Option<String>,
    pub predicate: Option<Predicate>,
    pub includes: Vec<IncludeSpec>,
    pub required: bool,
    pub through: Option<String>,
    pub attributes: Vec<String>,
    pub limit: Option<u64>,
}

impl IncludeSpec {
    /// The key the association's rows are attached under.
    pub fn attach_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.association.name)
    }
}

/// Validate include declarations against the parent model's associations.
///
/// Fails fast with [`QuerierError::AssociationNotFound`] on the first target
/// that is not associated with its parent. A target that repeats one of its
/// ancestors is rejected as accidental self-reference.
pub fn normalize_includes(
    registry: &ModelRegistry,
    parent: &ModelDescriptor,
    defs: &[IncludeDef],
) -> QuerierResult<Vec<IncludeSpec>> {
    let mut ancestry = vec![parent.name.clone()];
    normalize_level(registry, parent, defs, &mut ancestry)
}

fn normalize_level(
    registry: &ModelRegistry,
    parent: &ModelDescriptor,
    defs: &[IncludeDef],
    ancestry: &mut Vec<String>,
) -> QuerierResult<Vec<IncludeSpec>> {
    let mut specs = Vec::with_capacity(defs.len());
    for def in defs {
        let model = def.target.resolve(registry)?;
        let association = parent.association_to(&model.name).cloned().ok_or_else(|| {
            let err = QuerierError::association_not_found(&parent.name, &model.name);
            tracing::error!(error = %err, "include target is not associated");
            err
        })?;
        if ancestry.iter().any(|a| a.eq_ignore_ascii_case(&model.name)) {
            return Err(QuerierError::validation(format!(
                "circular include: {} already on path {}",
                model.name,
                ancestry.join(".")
            )));
        }
        ancestry.push(model.name.clone());
        let includes = normalize_level(registry, &model, &def.includes, ancestry)?;
        ancestry.pop();
        specs.push(IncludeSpec {
            model,
            association,
            alias: def.alias.clone(),
            predicate: def.predicate.clone(),
            includes,
            required: def.required,
            through: def.through.clone(),
            attributes: def.attributes.clone(),
            limit: def.limit,
        });
    }
    Ok(specs)
}

/// Resolved window of a listing query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pagination {
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub cur_page: Option<u64>,
    pub per_page: Option<u64>,
}

/// Listing options as the caller supplies them.
#[derive(Debug, Clone)]
pub struct QueryOpts {
    pub paging: bool,
    pub cur_page: u64,
    pub per_page: u64,
    pub sort: SortDir,
    pub sort_by: Option<String>,
    /// Explicit multi-column ordering, takes precedence over sort inference.
    pub order: Vec<OrderTerm>,
    pub group: GroupBy,
    pub collate: Option<String>,
    /// Ceiling on rows per fetch. Under paging it caps the page size, it never
    /// widens it.
    pub limit: Option<u64>,
}

impl Default for QueryOpts {
    fn default() -> Self {
        Self {
            paging: true,
            cur_page: 1,
            per_page: 30,
            sort: SortDir::Desc,
            sort_by: None,
            order: Vec::new(),
            group: GroupBy::Infer,
            collate: None,
            limit: None,
        }
    }
}

/// The store-facing description of one query.
#[derive(Debug, Clone)]
pub struct QueryDescriptor {
    pub model: Arc<ModelDescriptor>,
    /// Named scopes applied before execution.
    pub scopes: Vec<String>,
    pub predicate: Predicate,
    /// Projected columns; empty means all.
    pub attributes: Vec<String>,
    pub includes: Vec<IncludeSpec>,
    pub order: Vec<OrderTerm>,
    pub group: Vec<String>,
    pub pagination: Pagination,
    pub collate: Option<String>,
}

impl QueryDescriptor {
    /// A bare descriptor matching everything on one model.
    pub fn all(model: Arc<ModelDescriptor>) -> Self {
        Self {
            model,
            scopes: Vec::new(),
            predicate: Predicate::And(Vec::new()),
            attributes: Vec::new(),
            includes: Vec::new(),
            order: Vec::new(),
            group: Vec::new(),
            pagination: Pagination::default(),
            collate: None,
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_includes(mut self, includes: Vec<IncludeSpec>) -> Self {
        self.includes = includes;
        self
    }
}

/// Assemble a full query descriptor.
///
/// Sort inference when no explicit order is given: `sort_by`, else `createdAt`
/// when the model has it, else the primary key, else unsorted.
pub fn compose(
    registry: &ModelRegistry,
    model: Arc<ModelDescriptor>,
    spec: &FilterSpec,
    include_defs: &[IncludeDef],
    attributes: Vec<String>,
    scopes: Vec<String>,
    opts: &QueryOpts,
) -> QuerierResult<QueryDescriptor> {
    let predicate = filter::compile(spec, &model)?;
    let includes = normalize_includes(registry, &model, include_defs)?;

    let order = if !opts.order.is_empty() {
        opts.order.clone()
    } else {
        let column = opts
            .sort_by
            .clone()
            .or_else(|| {
                model
                    .has_column("createdAt")
                    .then(|| "createdAt".to_string())
            })
            .or_else(|| Some(model.primary_key().to_string()));
        column
            .map(|c| vec![OrderTerm::new(c, opts.sort)])
            .unwrap_or_default()
    };

    let pagination = if opts.paging {
        let per_page = match opts.limit {
            // Explicit limit is a ceiling on the page size, never an override.
            Some(limit) => opts.per_page.min(limit.max(1)),
            None => opts.per_page,
        };
        let cur_page = opts.cur_page.max(1);
        Pagination {
            offset: Some((cur_page - 1) * per_page),
            limit: Some(per_page),
            cur_page: Some(cur_page),
            per_page: Some(per_page),
        }
    } else {
        Pagination {
            offset: None,
            limit: opts.limit,
            cur_page: None,
            per_page: None,
        }
    };

    let group = match &opts.group {
        GroupBy::Infer => {
            if includes.is_empty() {
                Vec::new()
            } else {
                vec![model.primary_key().to_string()]
            }
        }
        GroupBy::Disabled => Vec::new(),
        GroupBy::Columns(columns) => columns.clone(),
    };

    Ok(QueryDescriptor {
        model,
        scopes,
        predicate,
        attributes,
        includes,
        order,
        group,
        pagination,
        collate: opts.collate.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AssociationMeta, ColumnMeta, TypeTag};

    fn registry() -> ModelRegistry {
        let mut registry = ModelRegistry::new();
        registry.register(
            ModelDescriptor::new("User")
                .with_column(ColumnMeta::new("name", TypeTag::String))
                .with_association(AssociationMeta::one_to_many("Image"))
                .with_association(AssociationMeta::one_to_one("Group")),
        );
        registry.register(
            ModelDescriptor::new("Image")
                .with_column(ColumnMeta::new("url", TypeTag::String))
                .with_association(AssociationMeta::one_to_one("User")),
        );
        registry.register(
            ModelDescriptor::new("Group").with_column(ColumnMeta::new("name", TypeTag::String)),
        );
        registry
    }

    fn compose_default(opts: &QueryOpts, includes: &[IncludeDef]) -> QueryDescriptor {
        let registry = registry();
        let model = registry.get("User").unwrap();
        compose(
            &registry,
            model,
            &FilterSpec::default(),
            includes,
            Vec::new(),
            Vec::new(),
            opts,
        )
        .unwrap()
    }

    #[test]
    fn test_sort_inference_prefers_created_at() {
        let descriptor = compose_default(&QueryOpts::default(), &[]);
        assert_eq!(
            descriptor.order,
            vec![OrderTerm::new("createdAt", SortDir::Desc)]
        );
    }

    #[test]
    fn test_explicit_order_wins() {
        let opts = QueryOpts {
            order: vec![OrderTerm::new("name", SortDir::Asc)],
            sort_by: Some("createdAt".to_string()),
            ..Default::default()
        };
        let descriptor = compose_default(&opts, &[]);
        assert_eq!(descriptor.order, vec![OrderTerm::new("name", SortDir::Asc)]);
    }

    #[test]
    fn test_limit_caps_page_size() {
        let opts = QueryOpts {
            cur_page: 2,
            per_page: 10,
            limit: Some(5),
            ..Default::default()
        };
        let descriptor = compose_default(&opts, &[]);
        assert_eq!(descriptor.pagination.per_page, Some(5));
        assert_eq!(descriptor.pagination.offset, Some(5));

        let opts = QueryOpts {
            per_page: 10,
            limit: Some(100),
            ..Default::default()
        };
        let descriptor = compose_default(&opts, &[]);
        // A large limit never widens the page.
        assert_eq!(descriptor.pagination.per_page, Some(10));
    }

    #[test]
    fn test_non_paged_limit_is_plain_cap() {
        let opts = QueryOpts {
            paging: false,
            limit: Some(3),
            ..Default::default()
        };
        let descriptor = compose_default(&opts, &[]);
        assert_eq!(descriptor.pagination.limit, Some(3));
        assert_eq!(descriptor.pagination.cur_page, None);
    }

    #[test]
    fn test_group_inferred_from_includes() {
        let descriptor = compose_default(&QueryOpts::default(), &[IncludeDef::new("Image")]);
        assert_eq!(descriptor.group, vec!["id".to_string()]);
        let descriptor = compose_default(&QueryOpts::default(), &[]);
        assert!(descriptor.group.is_empty());

        let opts = QueryOpts {
            group: GroupBy::Disabled,
            ..Default::default()
        };
        let descriptor = compose_default(&opts, &[IncludeDef::new("Image")]);
        assert!(descriptor.group.is_empty());
    }

    #[test]
    fn test_include_resolution_and_attach_key() {
        let descriptor = compose_default(&QueryOpts::default(), &[IncludeDef::new("Image")]);
        assert_eq!(descriptor.includes[0].attach_key(), "Images");
        let descriptor = compose_default(
            &QueryOpts::default(),
            &[IncludeDef::new("Group").with_alias("Team")],
        );
        assert_eq!(descriptor.includes[0].attach_key(), "Team");
    }

    #[test]
    fn test_unassociated_include_fails_fast() {
        let registry = registry();
        let model = registry.get("Group").unwrap();
        let err = normalize_includes(&registry, &model, &[IncludeDef::new("Image")]).unwrap_err();
        assert_eq!(err.to_string(), "Group has no association with Image.");
    }

    #[test]
    fn test_circular_include_is_rejected() {
        let registry = registry();
        let model = registry.get("User").unwrap();
        let defs = [IncludeDef::new("Image").with_include(IncludeDef::new("User"))];
        let err = normalize_includes(&registry, &model, &defs).unwrap_err();
        assert!(err.is_validation());
    }
}
