//! # querier
//!
//! Dynamic query construction and generic CRUD over an opaque relational
//! store.
//!
//! ## Features
//!
//! - **Filter DSL**: where maps, per-field searchable rules, keyword search
//!   and raw predicates compile to one [`Predicate`] tree
//! - **Fluent chains**: accumulate filters with `use_*` methods, execute with
//!   `get_paging` / `find_all` / `create` / `update` / `destroy`
//! - **Generic CRUD**: create, update, batched destroy and detail fetch for
//!   any registered model, with nested association payloads
//! - **Field introspection**: form/table field descriptors with labels, enum
//!   choices and foreign-key chosen options
//! - **Caching**: listing results cached behind a pluggable backend with
//!   TTLs and prefix invalidation on mutation
//! - **Store seam**: bring your own [`Store`]; an in-memory reference store
//!   backs the tests
//!
//! ## Query chains
//!
//! ```ignore
//! use querier::{PageQuery, Querier};
//! use serde_json::json;
//!
//! let page = querier
//!     .select("User")
//!     .use_where(where_map)
//!     .use_search_columns(&["name", "email"])
//!     .use_request(request)
//!     .get_paging(PageQuery {
//!         per_page: Some(20),
//!         ..Default::default()
//!     })
//!     .await?;
//! ```

pub mod builder;
pub mod cache;
pub mod error;
pub mod executor;
pub mod filter;
pub mod format;
pub mod predicate;
pub mod query;
pub mod querier;
pub mod schema;
pub mod store;

pub use builder::{PageQuery, QueryChain};
pub use cache::{CacheBackend, CacheOptions, MemoryCache};
pub use error::{QuerierError, QuerierResult};
pub use executor::{DestroyOutcome, Paged, Paging, Presenter};
pub use filter::{FilterSpec, SearchableRule};
pub use format::{
    DisplayName, FieldChoice, FieldDescriptor, FieldType, FormatCb, FormatOutputOpts, Labeler,
    OutputFieldNamePair, OutputFieldsOpts, apply_chosen_fields, format_input, format_output,
    output_fields,
};
pub use predicate::{CmpOp, ConditionKind, Predicate};
pub use query::{
    GroupBy, IncludeDef, IncludeSpec, ModelRef, OrderTerm, Pagination, QueryDescriptor,
    QueryOpts, SortDir, compose, normalize_includes,
};
pub use querier::{
    CreateArgs, DestroyArgs, DetailArgs, FindByArgs, Querier, UpdateArgs,
};
pub use schema::{
    AssociationMeta, AssociationSelect, Cardinality, ColumnMeta, ColumnsQuery, ModelDescriptor,
    ModelRegistry, Prefix, Scope, SearchKind, SearchableColumn, SearchableColumnsQuery, TypeTag,
    AUDIT_FIELDS,
};
pub use store::{FindResult, MemoryStore, Store};
