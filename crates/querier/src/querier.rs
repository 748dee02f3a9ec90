//! The top-level engine: generic CRUD and view-oriented listings over a
//! registry, a store and an optional cache.

use crate::builder::QueryChain;
use crate::cache::CacheBackend;
use crate::error::{QuerierError, QuerierResult};
use crate::executor::{self, DestroyOutcome, Paged, Presenter};
use crate::filter::FilterSpec;
use crate::format::{
    apply_chosen_fields, format_input, format_output, output_fields, table_meta, FormatCb,
    FormatOutputOpts, Labeler, OutputFieldNamePair, OutputFieldsOpts,
};
use crate::predicate::{coerce_value, CmpOp, ConditionKind, Predicate};
use crate::query::{
    normalize_includes, IncludeDef, IncludeSpec, ModelRef, QueryDescriptor, QueryOpts,
};
use crate::schema::{
    AssociationSelect, Cardinality, ColumnsQuery, ModelDescriptor, ModelRegistry, Prefix,
    SearchableColumnsQuery,
};
use crate::store::Store;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Query-construction and CRUD engine over an opaque store.
///
/// Cheap to clone; all parts are shared.
#[derive(Clone)]
pub struct Querier {
    registry: Arc<ModelRegistry>,
    store: Arc<dyn Store>,
    cache: Option<Arc<dyn CacheBackend>>,
    labeler: Option<Labeler>,
}

/// Arguments for [`Querier::create`].
#[derive(Clone, Default)]
pub struct CreateArgs {
    pub model_name: String,
    pub input: Value,
    pub includes: Vec<IncludeDef>,
    /// Dotted field paths to copy from the input; empty derives the full
    /// column set of the model and its includes.
    pub format: Vec<String>,
    pub format_cb: Option<FormatCb>,
    pub presenter: Option<Presenter>,
}

impl CreateArgs {
    pub fn new(model_name: impl Into<String>, input: Value) -> Self {
        Self {
            model_name: model_name.into(),
            input,
            ..Default::default()
        }
    }
}

/// Arguments for [`Querier::update`].
#[derive(Clone, Default)]
pub struct UpdateArgs {
    pub model_name: String,
    pub input: Value,
    /// Exact-match pairs locating the target record.
    pub where_map: Map<String, Value>,
    /// Named scopes narrowing which record may be updated.
    pub scopes: Vec<String>,
    pub includes: Vec<IncludeDef>,
    pub format: Vec<String>,
    pub format_cb: Option<FormatCb>,
    pub presenter: Option<Presenter>,
}

impl UpdateArgs {
    pub fn new(model_name: impl Into<String>, where_map: Map<String, Value>, input: Value) -> Self {
        Self {
            model_name: model_name.into(),
            where_map,
            input,
            ..Default::default()
        }
    }
}

/// Arguments for [`Querier::destroy`].
#[derive(Clone, Default)]
pub struct DestroyArgs {
    pub model_name: String,
    pub ids: Vec<Value>,
    /// Named scopes narrowing which records may be destroyed.
    pub scopes: Vec<String>,
    /// Associations destroyed before each root record.
    pub includes: Vec<IncludeDef>,
    pub force: bool,
}

impl DestroyArgs {
    pub fn new(model_name: impl Into<String>, ids: Vec<Value>) -> Self {
        Self {
            model_name: model_name.into(),
            ids,
            ..Default::default()
        }
    }
}

/// Arguments for [`Querier::get_detail`].
#[derive(Clone, Default)]
pub struct DetailArgs {
    pub model_name: String,
    /// Exact-match pairs locating the record.
    pub where_map: Map<String, Value>,
    pub includes: Vec<IncludeDef>,
    /// Restrict the output to these field names.
    pub attributes: Vec<String>,
    pub format: Vec<String>,
    pub format_cb: Option<FormatCb>,
    pub required: Vec<String>,
    pub readonly: Vec<String>,
    /// Field names dropped from the view metadata.
    pub exclude_fields: Vec<String>,
    /// Extra field names appended to the view metadata.
    pub include_fields: Vec<String>,
    /// View mode attaches `_fields`, `_associations` and chosen options.
    pub view: bool,
    pub output_field_name_pairs: Vec<OutputFieldNamePair>,
}

impl DetailArgs {
    pub fn new(model_name: impl Into<String>, where_map: Map<String, Value>) -> Self {
        Self {
            model_name: model_name.into(),
            where_map,
            ..Default::default()
        }
    }
}

/// Arguments for [`Querier::find_by`].
#[derive(Clone)]
pub struct FindByArgs {
    pub model_name: String,
    /// Exact-match pairs.
    pub where_map: Map<String, Value>,
    /// How the where pairs combine.
    pub condition: ConditionKind,
    /// Loose pairs: numeric values match exactly, strings as substrings.
    /// Duplicate keys merge into an OR group.
    pub field_pairs: Vec<(String, Value)>,
    pub keyword: Option<String>,
    pub search_columns: Vec<String>,
    pub scopes: Vec<String>,
    pub includes: Vec<IncludeDef>,
    pub attributes: Vec<String>,
    pub format: Vec<String>,
    pub format_cb: Option<FormatCb>,
    pub presenter: Option<Presenter>,
    /// View mode attaches index-page table metadata and the searchable list.
    pub view: bool,
    pub include_columns: Vec<String>,
    pub exclude_columns: Vec<String>,
    pub opts: QueryOpts,
}

impl Default for FindByArgs {
    fn default() -> Self {
        Self {
            model_name: String::new(),
            where_map: Map::new(),
            condition: ConditionKind::And,
            field_pairs: Vec::new(),
            keyword: None,
            search_columns: Vec::new(),
            scopes: Vec::new(),
            includes: Vec::new(),
            attributes: Vec::new(),
            format: Vec::new(),
            format_cb: None,
            presenter: None,
            view: false,
            include_columns: Vec::new(),
            exclude_columns: Vec::new(),
            opts: QueryOpts::default(),
        }
    }
}

impl FindByArgs {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..Default::default()
        }
    }
}

/// Fold named scopes into one guard predicate, when any are set.
pub(crate) fn scope_guard(
    model: &ModelDescriptor,
    scopes: &[String],
) -> QuerierResult<Option<Predicate>> {
    if scopes.is_empty() {
        return Ok(None);
    }
    Ok(Some(Predicate::And(executor::resolve_scopes(
        model, scopes,
    )?)))
}

/// Exact-match predicate from a where map, with value coercion.
pub(crate) fn exact_predicate(where_map: &Map<String, Value>) -> Predicate {
    Predicate::And(
        where_map
            .iter()
            .map(|(field, value)| {
                Predicate::cmp(field.clone(), CmpOp::Eq, coerce_value(value, CmpOp::Eq))
            })
            .collect(),
    )
}

impl Querier {
    pub fn new(registry: ModelRegistry, store: Arc<dyn Store>) -> Self {
        Self {
            registry: Arc::new(registry),
            store,
            cache: None,
            labeler: None,
        }
    }

    /// Attach a default cache backend for chains that enable caching.
    pub fn with_cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Attach a label transform used when building field descriptors.
    pub fn with_labeler(mut self, labeler: Labeler) -> Self {
        self.labeler = Some(labeler);
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub(crate) fn cache_backend(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.cache.as_ref()
    }

    /// Start a fluent query chain on one model.
    pub fn select(&self, model: impl Into<ModelRef>) -> QueryChain {
        QueryChain::new(self.clone(), model.into())
    }

    /// Drop every cached listing of a model.
    pub(crate) async fn invalidate_model_cache(&self, model_name: &str) {
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.del_prefix(model_name).await {
                tracing::warn!(model = model_name, error = %err, "cache invalidation failed");
            }
        }
    }

    /// Full dotted column set of a model plus its resolved includes.
    pub(crate) fn full_format(
        &self,
        model: &ModelDescriptor,
        includes: &[IncludeSpec],
    ) -> QuerierResult<Vec<String>> {
        let mut format = self
            .registry
            .columns(&model.name, &ColumnsQuery::default())?;
        self.push_include_columns(includes, "", &mut format)?;
        Ok(format)
    }

    fn push_include_columns(
        &self,
        includes: &[IncludeSpec],
        prefix: &str,
        out: &mut Vec<String>,
    ) -> QuerierResult<()> {
        for include in includes {
            let path = if prefix.is_empty() {
                include.attach_key().to_string()
            } else {
                format!("{prefix}.{}", include.attach_key())
            };
            out.extend(self.registry.columns(
                &include.model.name,
                &ColumnsQuery {
                    prefix: Prefix::Custom(path.clone()),
                    ..Default::default()
                },
            )?);
            self.push_include_columns(&include.includes, &path, out)?;
        }
        Ok(())
    }

    /// Create one record, cascading into nested association payloads.
    pub async fn create(&self, args: CreateArgs) -> QuerierResult<Value> {
        if !args.input.is_object() {
            return Err(QuerierError::validation("create input must be an object"));
        }
        let model = self.registry.get(&args.model_name)?;
        let includes = normalize_includes(&self.registry, &model, &args.includes)?;
        let format = if args.format.is_empty() {
            self.full_format(&model, &includes)?
        } else {
            args.format
        };
        let base = self.registry.build_empty_model(&model.name, &[], &[])?;
        let mut data = format_input(&format, base, &args.input, args.format_cb.as_ref());
        // Dotted format paths cannot address collection payloads; carry them
        // over verbatim for the nested-create cascade.
        for include in &includes {
            if include.association.cardinality != Cardinality::OneToMany {
                continue;
            }
            if let Some(children) = args.input.get(include.attach_key()) {
                data[include.attach_key()] = children.clone();
            }
        }
        let record = executor::create(
            self.store(),
            &model,
            &data,
            &includes,
            args.presenter.as_ref(),
        )
        .await?;
        self.invalidate_model_cache(&model.name).await;
        Ok(record)
    }

    /// Update the record located by the where map and return it refreshed.
    pub async fn update(&self, args: UpdateArgs) -> QuerierResult<Value> {
        if args.where_map.is_empty() {
            return Err(QuerierError::missing_parameter("where"));
        }
        if !args.input.is_object() {
            return Err(QuerierError::validation("update input must be an object"));
        }
        let model = self.registry.get(&args.model_name)?;
        let includes = normalize_includes(&self.registry, &model, &args.includes)?;
        let mut parts = executor::resolve_scopes(&model, &args.scopes)?;
        parts.push(exact_predicate(&args.where_map));
        let predicate = Predicate::And(parts);
        let query = QueryDescriptor::all(model.clone())
            .with_predicate(predicate.clone())
            .with_includes(includes.clone());
        let target = self.store.find_one(&query).await?.ok_or_else(|| {
            QuerierError::not_found(format!(
                "{}: {}",
                model.name,
                Value::Object(args.where_map.clone())
            ))
        })?;
        // Refetch by primary key: the update may rewrite the very fields the
        // where pairs matched on.
        let pk = model.primary_key().to_string();
        let pk_value = target.get(pk.as_str()).cloned().unwrap_or(Value::Null);
        let format = if args.format.is_empty() {
            self.full_format(&model, &includes)?
        } else {
            args.format
        };
        let merged = format_input(&format, target, &args.input, args.format_cb.as_ref());
        executor::update(self.store(), &model, &predicate, &merged).await?;
        self.invalidate_model_cache(&model.name).await;
        let refetch = QueryDescriptor::all(model.clone())
            .with_predicate(Predicate::eq(pk, pk_value))
            .with_includes(includes);
        let record = self.store.find_one(&refetch).await?.ok_or_else(|| {
            QuerierError::not_found(format!("{} after update", model.name))
        })?;
        match args.presenter.as_ref() {
            Some(presenter) => presenter(record),
            None => Ok(record),
        }
    }

    /// Destroy records by primary key, one outcome per id.
    pub async fn destroy(&self, args: DestroyArgs) -> QuerierResult<Vec<DestroyOutcome>> {
        if args.ids.is_empty() {
            return Err(QuerierError::missing_parameter("ids"));
        }
        let model = self.registry.get(&args.model_name)?;
        let includes = normalize_includes(&self.registry, &model, &args.includes)?;
        let guard = scope_guard(&model, &args.scopes)?;
        let outcomes = executor::destroy_by_ids(
            self.store(),
            &model,
            &includes,
            &args.ids,
            args.force,
            guard.as_ref(),
        )
        .await?;
        self.invalidate_model_cache(&model.name).await;
        Ok(outcomes)
    }

    /// Fetch one record shaped for a detail page.
    ///
    /// Returns `Ok(None)` when nothing matches outside view mode; in view mode
    /// the field metadata is returned even without a record, so empty forms
    /// can still render.
    pub async fn get_detail(&self, args: DetailArgs) -> QuerierResult<Option<Value>> {
        if args.where_map.is_empty() {
            return Err(QuerierError::missing_parameter("where"));
        }
        let model = self.registry.get(&args.model_name)?;
        let includes = normalize_includes(&self.registry, &model, &args.includes)?;

        let mut fields = output_fields(
            &self.registry,
            &model.name,
            &OutputFieldsOpts {
                required: args.required.clone(),
                readonly: args.readonly.clone(),
                exclude: args.exclude_fields.clone(),
                include: args.include_fields.clone(),
                labeler: self.labeler.clone(),
                ..Default::default()
            },
        )?;
        for include in &includes {
            fields.extend(output_fields(
                &self.registry,
                &include.model.name,
                &OutputFieldsOpts {
                    prefix: Prefix::Custom(include.attach_key().to_string()),
                    exclude: args.exclude_fields.clone(),
                    labeler: self.labeler.clone(),
                    ..Default::default()
                },
            )?);
        }
        if !args.attributes.is_empty() {
            fields.retain(|f| args.attributes.iter().any(|a| *a == f.name));
        }

        let format = if args.format.is_empty() {
            fields.iter().map(|f| f.name.clone()).collect()
        } else {
            args.format
        };

        let query = QueryDescriptor::all(model.clone())
            .with_predicate(exact_predicate(&args.where_map))
            .with_includes(includes);
        let data = self.store.find_one(&query).await?;
        if data.is_none() && !args.view {
            return Ok(None);
        }

        let mut extra = Map::new();
        if args.view {
            extra.insert(
                "_associations".to_string(),
                json!(self
                    .registry
                    .association_names(&model.name, AssociationSelect::All)?),
            );
            apply_chosen_fields(
                &self.registry,
                self.store(),
                &model.name,
                &mut fields,
                &args.output_field_name_pairs,
            )
            .await?;
        }

        let result = format_output(
            &FormatOutputOpts {
                format,
                fields: args.view.then_some(fields),
                required: args.required,
                readonly: args.readonly,
                extra,
                view: args.view,
                cb: args.format_cb,
            },
            data,
        );
        Ok(Some(result))
    }

    /// List records with the loose filter DSL of index pages.
    pub async fn find_by(&self, args: FindByArgs) -> QuerierResult<Paged> {
        let model = self.registry.get(&args.model_name)?;

        let mut parts = Vec::new();
        let where_parts: Vec<Predicate> = args
            .where_map
            .iter()
            .map(|(field, value)| {
                Predicate::cmp(field.clone(), CmpOp::Eq, coerce_value(value, CmpOp::Eq))
            })
            .collect();
        if !where_parts.is_empty() {
            match args.condition {
                ConditionKind::And => parts.extend(where_parts),
                ConditionKind::Or => parts.push(Predicate::Or(where_parts)),
            }
        }
        parts.extend(compile_field_pairs(&args.field_pairs));
        if let Some(keyword) = args
            .keyword
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
        {
            let pattern = format!("%{keyword}%");
            let columns: Vec<String> = if args.search_columns.is_empty() {
                model
                    .columns
                    .iter()
                    .filter(|c| c.type_tag.is_text_searchable())
                    .map(|c| c.name.clone())
                    .collect()
            } else {
                args.search_columns.clone()
            };
            parts.push(Predicate::Or(
                columns
                    .into_iter()
                    .map(|c| Predicate::like(c, pattern.clone()))
                    .collect(),
            ));
        }

        let spec = FilterSpec {
            raw: Some(Predicate::And(parts)),
            ..Default::default()
        };
        let descriptor = crate::query::compose(
            &self.registry,
            model.clone(),
            &spec,
            &args.includes,
            args.attributes.clone(),
            args.scopes.clone(),
            &args.opts,
        )?;

        let presenter = row_presenter(args.format, args.format_cb, args.presenter);
        let filter_echo = json!({
            "where": args.where_map,
            "keyword": args.keyword,
        });
        let mut paged = executor::find(
            self.store(),
            descriptor,
            &args.opts,
            filter_echo,
            presenter.as_ref(),
        )
        .await?;

        if args.view {
            let fields = output_fields(
                &self.registry,
                &model.name,
                &OutputFieldsOpts {
                    exclude: args.exclude_columns.clone(),
                    include: args.include_columns.clone(),
                    labeler: self.labeler.clone(),
                    ..Default::default()
                },
            )?;
            paged.extra.insert("table".to_string(), table_meta(&fields));
            paged.extra.insert(
                "searchable".to_string(),
                json!(self
                    .registry
                    .searchable_columns(&model.name, SearchableColumnsQuery::default())?),
            );
            paged.extra.insert(
                "_associations".to_string(),
                json!(self
                    .registry
                    .association_names(&model.name, AssociationSelect::All)?),
            );
        }
        Ok(paged)
    }
}

/// Compile loose field pairs, merging duplicate keys into OR groups.
fn compile_field_pairs(pairs: &[(String, Value)]) -> Vec<Predicate> {
    let mut grouped: Vec<(String, Vec<Predicate>)> = Vec::new();
    for (key, value) in pairs {
        let coerced = coerce_value(value, CmpOp::Eq);
        let cmp = if coerced.is_number() {
            Predicate::cmp(key.clone(), CmpOp::Eq, coerced)
        } else {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Predicate::like(key.clone(), format!("%{text}%"))
        };
        match grouped.iter_mut().find(|(k, _)| k == key) {
            Some((_, bucket)) => bucket.push(cmp),
            None => grouped.push((key.clone(), vec![cmp])),
        }
    }
    grouped
        .into_iter()
        .map(|(_, mut bucket)| {
            if bucket.len() == 1 {
                bucket.remove(0)
            } else {
                Predicate::Or(bucket)
            }
        })
        .collect()
}

fn row_presenter(
    format: Vec<String>,
    format_cb: Option<FormatCb>,
    presenter: Option<Presenter>,
) -> Option<Presenter> {
    if format.is_empty() && format_cb.is_none() {
        return presenter;
    }
    let opts = FormatOutputOpts {
        format,
        cb: format_cb,
        ..Default::default()
    };
    Some(Arc::new(move |row| {
        let shaped = format_output(&opts, Some(row));
        match presenter.as_ref() {
            Some(presenter) => presenter(shaped),
            None => Ok(shaped),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_predicate_coerces_numeric_strings() {
        let mut where_map = Map::new();
        where_map.insert("id".to_string(), json!("7"));
        assert_eq!(
            exact_predicate(&where_map),
            Predicate::And(vec![Predicate::eq("id", 7)])
        );
    }

    #[test]
    fn test_field_pairs_group_duplicates_into_or() {
        let pairs = vec![
            ("name".to_string(), json!("al")),
            ("name".to_string(), json!("be")),
            ("age".to_string(), json!(30)),
        ];
        let compiled = compile_field_pairs(&pairs);
        assert_eq!(
            compiled,
            vec![
                Predicate::Or(vec![
                    Predicate::like("name", "%al%"),
                    Predicate::like("name", "%be%"),
                ]),
                Predicate::eq("age", 30),
            ]
        );
    }
}
