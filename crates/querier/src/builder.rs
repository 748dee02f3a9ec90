//! Fluent query chains.
//!
//! A [`QueryChain`] accumulates filter inputs with consuming `use_*` methods
//! and resolves them lazily: nothing touches the registry or the store until
//! a terminal method runs. Where maps merge left to right; the raw predicate,
//! when set, replaces the compiled filter outright.

use crate::cache::{CacheHandle, CacheOptions};
use crate::error::QuerierResult;
use crate::executor::{DestroyOutcome, Paged, Presenter};
use crate::filter::{FilterSpec, SearchableRule};
use crate::format::FormatCb;
use crate::predicate::Predicate;
use crate::query::{
    compose, GroupBy, IncludeDef, ModelRef, OrderTerm, QueryOpts, SortDir,
};
use crate::querier::{exact_predicate, scope_guard, CreateArgs, Querier, UpdateArgs};
use crate::{executor, query};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

const DEFAULT_KEY_NAME: &str = "keyword";

/// Page-oriented listing options for [`QueryChain::get_paging`].
#[derive(Debug, Clone, Default)]
pub struct PageQuery {
    pub cur_page: Option<u64>,
    pub per_page: Option<u64>,
    pub sort: Option<SortDir>,
    pub sort_by: Option<String>,
    pub order: Vec<OrderTerm>,
    pub group: GroupBy,
    pub collate: Option<String>,
    /// Ceiling on the page size.
    pub limit: Option<u64>,
}

impl PageQuery {
    fn into_opts(self, paging: bool) -> QueryOpts {
        let defaults = QueryOpts::default();
        QueryOpts {
            paging,
            cur_page: self.cur_page.unwrap_or(defaults.cur_page),
            per_page: self.per_page.unwrap_or(defaults.per_page),
            sort: self.sort.unwrap_or(defaults.sort),
            sort_by: self.sort_by,
            order: self.order,
            group: self.group,
            collate: self.collate,
            limit: self.limit,
        }
    }
}

enum WhereParam {
    Map(Map<String, Value>),
    FromRequest(Box<dyn Fn(&Map<String, Value>) -> Map<String, Value> + Send + Sync>),
}

/// A composable query over one model.
pub struct QueryChain {
    engine: Querier,
    model: ModelRef,
    attributes: Vec<String>,
    scopes: Vec<String>,
    includes: Vec<IncludeDef>,
    wheres: Vec<WhereParam>,
    raw_where: Option<Predicate>,
    request: Map<String, Value>,
    searchable: Option<BTreeMap<String, SearchableRule>>,
    search_columns: Vec<String>,
    presenter: Option<Presenter>,
    format: Vec<String>,
    format_cb: Option<FormatCb>,
    key_name: String,
    cache: Option<CacheOptions>,
}

impl QueryChain {
    pub(crate) fn new(engine: Querier, model: ModelRef) -> Self {
        Self {
            engine,
            model,
            attributes: Vec::new(),
            scopes: Vec::new(),
            includes: Vec::new(),
            wheres: Vec::new(),
            raw_where: None,
            request: Map::new(),
            searchable: None,
            search_columns: Vec::new(),
            presenter: None,
            format: Vec::new(),
            format_cb: None,
            key_name: DEFAULT_KEY_NAME.to_string(),
            cache: None,
        }
    }

    /// Apply named scopes of the model.
    pub fn use_scope(mut self, scopes: &[&str]) -> Self {
        self.scopes.extend(scopes.iter().map(|s| s.to_string()));
        self
    }

    /// Project only the given columns.
    pub fn use_attribute(mut self, attributes: &[&str]) -> Self {
        self.attributes
            .extend(attributes.iter().map(|s| s.to_string()));
        self
    }

    /// Attach an association to the result rows.
    pub fn use_include(mut self, include: IncludeDef) -> Self {
        self.includes.push(include);
        self
    }

    /// Merge field/value pairs into the filter. Later entries win.
    pub fn use_where(mut self, where_map: Map<String, Value>) -> Self {
        self.wheres.push(WhereParam::Map(where_map));
        self
    }

    /// Derive where pairs from the request at execution time.
    pub fn use_where_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Map<String, Value> + Send + Sync + 'static,
    {
        self.wheres.push(WhereParam::FromRequest(Box::new(f)));
        self
    }

    /// Supply a predicate verbatim, replacing the compiled filter entirely.
    pub fn use_raw_where(mut self, predicate: Predicate) -> Self {
        self.raw_where = Some(predicate);
        self
    }

    /// Attach the raw request parameters, the source for `use_where_fn`
    /// closures and the keyword lookup.
    pub fn use_request(mut self, request: Map<String, Value>) -> Self {
        self.request = request;
        self
    }

    /// Declare per-field compilation rules.
    pub fn use_searchable(mut self, searchable: BTreeMap<String, SearchableRule>) -> Self {
        self.searchable = Some(searchable);
        self
    }

    /// Columns keyword search matches against.
    pub fn use_search_columns(mut self, columns: &[&str]) -> Self {
        self.search_columns
            .extend(columns.iter().map(|s| s.to_string()));
        self
    }

    /// Request key the keyword is read from. Defaults to `keyword`.
    pub fn use_key_name(mut self, key_name: impl Into<String>) -> Self {
        self.key_name = key_name.into();
        self
    }

    /// Per-row transform applied after fetch.
    pub fn use_presenter<F>(mut self, presenter: F) -> Self
    where
        F: Fn(Value) -> QuerierResult<Value> + Send + Sync + 'static,
    {
        self.presenter = Some(Arc::new(presenter));
        self
    }

    /// Dotted field paths shaped through create/update.
    pub fn use_format(mut self, format: &[&str]) -> Self {
        self.format.extend(format.iter().map(|s| s.to_string()));
        self
    }

    /// Record-level transform applied after shaping.
    pub fn use_format_cb<F>(mut self, cb: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.format_cb = Some(Arc::new(cb));
        self
    }

    /// Cache listings of this chain.
    pub fn use_cache(mut self, options: CacheOptions) -> Self {
        self.cache = Some(options);
        self
    }

    /// Fold the accumulated where inputs against the request.
    fn query_init(&self) -> (Map<String, Value>, Option<String>) {
        let mut where_map = Map::new();
        for param in &self.wheres {
            let merged = match param {
                WhereParam::Map(map) => map.clone(),
                WhereParam::FromRequest(f) => f(&self.request),
            };
            for (key, value) in merged {
                where_map.insert(key, value);
            }
        }
        let keyword = self
            .request
            .get(&self.key_name)
            .and_then(Value::as_str)
            .map(str::to_string);
        (where_map, keyword)
    }

    fn filter_spec(&self) -> (FilterSpec, Map<String, Value>) {
        let (where_map, keyword) = self.query_init();
        let spec = FilterSpec {
            where_map: where_map.clone(),
            raw: self.raw_where.clone(),
            searchable: self.searchable.clone(),
            keyword,
            search_columns: self.search_columns.clone(),
        };
        (spec, where_map)
    }

    fn cache_handle(&self, model_name: &str) -> QuerierResult<Option<CacheHandle>> {
        match &self.cache {
            None => Ok(None),
            Some(options) => Ok(Some(CacheHandle::new(
                model_name,
                options,
                self.engine.cache_backend(),
            )?)),
        }
    }

    async fn run_find(self, opts: QueryOpts) -> QuerierResult<Paged> {
        let model = self.model.resolve(self.engine.registry())?;
        let (spec, where_map) = self.filter_spec();
        let cache = self.cache_handle(&model.name)?;
        if let Some(cache) = &cache {
            if let Some(hit) = cache.get_listing().await {
                return Ok(serde_json::from_value(hit)?);
            }
        }
        let descriptor = compose(
            self.engine.registry(),
            model,
            &spec,
            &self.includes,
            self.attributes.clone(),
            self.scopes.clone(),
            &opts,
        )?;
        let filter_echo = json!({"where": where_map, "keyword": spec.keyword});
        let paged = executor::find(
            self.engine.store(),
            descriptor,
            &opts,
            filter_echo,
            self.presenter.as_ref(),
        )
        .await?;
        if let Some(cache) = &cache {
            cache.put_listing(&serde_json::to_value(&paged)?).await?;
        }
        Ok(paged)
    }

    /// Execute as a paginated listing.
    pub async fn get_paging(self, page: PageQuery) -> QuerierResult<Paged> {
        self.run_find(page.into_opts(true)).await
    }

    /// Execute without pagination; `limit` caps the row count.
    pub async fn find_all(self, page: PageQuery) -> QuerierResult<Paged> {
        self.run_find(page.into_opts(false)).await
    }

    /// Fetch the first matching row.
    pub async fn find_one(self) -> QuerierResult<Option<Value>> {
        let model = self.model.resolve(self.engine.registry())?;
        let (spec, _) = self.filter_spec();
        let opts = QueryOpts {
            paging: false,
            limit: Some(1),
            ..Default::default()
        };
        let mut descriptor = compose(
            self.engine.registry(),
            model,
            &spec,
            &self.includes,
            self.attributes.clone(),
            self.scopes.clone(),
            &opts,
        )?;
        executor::apply_scopes(&mut descriptor)?;
        let row = self.engine.store().find_one(&descriptor).await?;
        match (row, self.presenter.as_ref()) {
            (Some(row), Some(presenter)) => presenter(row).map(Some),
            (row, _) => Ok(row),
        }
    }

    /// Create a record through the chain's format settings and cache it.
    pub async fn create(self, input: Value) -> QuerierResult<Value> {
        let model = self.model.resolve(self.engine.registry())?;
        let cache = self.cache_handle(&model.name)?;
        let record = self
            .engine
            .create(CreateArgs {
                model_name: model.name.clone(),
                input,
                includes: self.includes,
                format: self.format,
                format_cb: self.format_cb,
                presenter: self.presenter,
            })
            .await?;
        if let Some(cache) = &cache {
            cache.put_item(&record, &record["id"]).await?;
        }
        Ok(record)
    }

    /// Update the records matched by the accumulated where pairs.
    pub async fn update(self, input: Value) -> QuerierResult<Value> {
        let model = self.model.resolve(self.engine.registry())?;
        let (where_map, _) = self.query_init();
        let cache = self.cache_handle(&model.name)?;
        let record = self
            .engine
            .update(UpdateArgs {
                model_name: model.name.clone(),
                input,
                where_map,
                scopes: self.scopes,
                includes: self.includes,
                format: self.format,
                format_cb: self.format_cb,
                presenter: self.presenter,
            })
            .await?;
        if let Some(cache) = &cache {
            cache.invalidate().await?;
        }
        Ok(record)
    }

    /// Destroy the records matched by the accumulated where pairs. Returns
    /// the affected count.
    pub async fn destroy(self, force: bool) -> QuerierResult<u64> {
        let model = self.model.resolve(self.engine.registry())?;
        let (where_map, _) = self.query_init();
        let mut predicate = match &self.raw_where {
            Some(raw) => raw.clone(),
            None => exact_predicate(&where_map),
        };
        if let Some(guard) = scope_guard(&model, &self.scopes)? {
            predicate = Predicate::And(vec![predicate, guard]);
        }
        let affected =
            executor::destroy(self.engine.store(), &model, &predicate, force).await?;
        if let Some(cache) = self.cache_handle(&model.name)? {
            cache.invalidate().await?;
        }
        self.engine.invalidate_model_cache(&model.name).await;
        Ok(affected)
    }

    /// Destroy by primary keys with per-id outcomes, cascading into the
    /// chain's includes.
    pub async fn destroy_by_ids(
        self,
        ids: Vec<Value>,
        force: bool,
    ) -> QuerierResult<Vec<DestroyOutcome>> {
        let model = self.model.resolve(self.engine.registry())?;
        let includes = query::normalize_includes(self.engine.registry(), &model, &self.includes)?;
        let guard = scope_guard(&model, &self.scopes)?;
        let outcomes = executor::destroy_by_ids(
            self.engine.store(),
            &model,
            &includes,
            &ids,
            force,
            guard.as_ref(),
        )
        .await?;
        if let Some(cache) = self.cache_handle(&model.name)? {
            cache.invalidate().await?;
        }
        self.engine.invalidate_model_cache(&model.name).await;
        Ok(outcomes)
    }

    /// Read the cached listing for this chain, if any.
    pub async fn get_cache(self) -> QuerierResult<Option<Value>> {
        let model = self.model.resolve(self.engine.registry())?;
        match self.cache_handle(&model.name)? {
            Some(cache) => Ok(cache.get_listing().await),
            None => Ok(None),
        }
    }
}
