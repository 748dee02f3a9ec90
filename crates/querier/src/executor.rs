//! CRUD execution over a [`Store`].
//!
//! The executor resolves named scopes into the predicate, runs the store call
//! and shapes the result envelope. Presenters run per row after fetch.

use crate::error::{QuerierError, QuerierResult};
use crate::predicate::Predicate;
use crate::query::{IncludeSpec, OrderTerm, QueryDescriptor, QueryOpts};
use crate::schema::{Cardinality, ModelDescriptor};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Per-row output transform applied after fetch.
pub type Presenter = Arc<dyn Fn(Value) -> QuerierResult<Value> + Send + Sync>;

/// Pagination metadata of a listing result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paging {
    pub last_page: Option<u64>,
    pub cur_page: Option<u64>,
    pub per_page: Option<u64>,
    pub sort: String,
    pub sort_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<Vec<OrderTerm>>,
    pub limit: Option<u64>,
    pub total: u64,
}

/// Listing result envelope: paging metadata, filter echo, rows and any extra
/// top-level entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paged {
    pub paging: Paging,
    pub filter: Value,
    pub items: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-id outcome of a batched destroy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestroyOutcome {
    pub id: Value,
    pub success: bool,
}

/// Resolve named scopes to their predicates. Unknown scope names fail as
/// validation errors.
pub(crate) fn resolve_scopes(
    model: &ModelDescriptor,
    names: &[String],
) -> QuerierResult<Vec<Predicate>> {
    names
        .iter()
        .map(|name| {
            model
                .scopes
                .get(name)
                .map(|scope| scope.predicate.clone())
                .ok_or_else(|| {
                    QuerierError::validation(format!(
                        "{} has no scope named {name}",
                        model.name
                    ))
                })
        })
        .collect()
}

/// Replace the descriptor's named scopes with their predicates, merged into
/// the compiled filter.
pub(crate) fn apply_scopes(descriptor: &mut QueryDescriptor) -> QuerierResult<()> {
    if descriptor.scopes.is_empty() {
        return Ok(());
    }
    let names = std::mem::take(&mut descriptor.scopes);
    let mut parts = resolve_scopes(&descriptor.model, &names)?;
    parts.push(std::mem::replace(
        &mut descriptor.predicate,
        Predicate::And(Vec::new()),
    ));
    descriptor.predicate = Predicate::And(parts);
    Ok(())
}

fn present_rows(rows: Vec<Value>, presenter: Option<&Presenter>) -> QuerierResult<Vec<Value>> {
    match presenter {
        None => Ok(rows),
        Some(presenter) => rows.into_iter().map(|row| presenter(row)).collect(),
    }
}

/// Run a listing query and wrap the result in the paged envelope.
///
/// `filter_echo` is reflected back verbatim so callers can re-render the
/// request that produced the page.
pub(crate) async fn find(
    store: &dyn Store,
    mut descriptor: QueryDescriptor,
    opts: &QueryOpts,
    filter_echo: Value,
    presenter: Option<&Presenter>,
) -> QuerierResult<Paged> {
    apply_scopes(&mut descriptor)?;
    let pagination = descriptor.pagination.clone();
    let order = descriptor.order.clone();
    let result = store.find(&descriptor).await?;
    tracing::debug!(
        model = %descriptor.model.name,
        total = result.total,
        rows = result.rows.len(),
        "listing executed"
    );
    let items = present_rows(result.rows, presenter)?;
    let last_page = pagination
        .per_page
        .map(|per_page| (result.total.div_ceil(per_page.max(1))).max(1));
    Ok(Paged {
        paging: Paging {
            last_page,
            cur_page: pagination.cur_page,
            per_page: pagination.per_page,
            sort: opts.sort.as_str().to_string(),
            sort_by: opts.sort_by.as_ref().map(|s| s.to_lowercase()),
            order: (!order.is_empty()).then_some(order),
            limit: if opts.paging {
                opts.limit
            } else {
                pagination.limit
            },
            total: result.total,
        },
        filter: filter_echo,
        items,
        extra: Map::new(),
    })
}

pub(crate) async fn create(
    store: &dyn Store,
    model: &ModelDescriptor,
    data: &Value,
    includes: &[IncludeSpec],
    presenter: Option<&Presenter>,
) -> QuerierResult<Value> {
    let record = store.create(model, data, includes).await?;
    tracing::debug!(model = %model.name, id = %record["id"], "record created");
    match presenter {
        Some(presenter) => presenter(record),
        None => Ok(record),
    }
}

pub(crate) async fn update(
    store: &dyn Store,
    model: &ModelDescriptor,
    predicate: &Predicate,
    data: &Value,
) -> QuerierResult<u64> {
    let affected = store.update(model, predicate, data).await?;
    tracing::debug!(model = %model.name, affected, "records updated");
    Ok(affected)
}

pub(crate) async fn destroy(
    store: &dyn Store,
    model: &ModelDescriptor,
    predicate: &Predicate,
    force: bool,
) -> QuerierResult<u64> {
    let affected = store.destroy(model, predicate, force).await?;
    tracing::debug!(model = %model.name, affected, force, "records destroyed");
    Ok(affected)
}

/// Destroy records by primary key, one by one, cascading into the given
/// associations first.
///
/// For each id the associated record is located through the root record, with
/// a `<ModelName>Id` lookup on the association's side as fallback. A missing
/// association link aborts the whole batch; a missing root id only marks that
/// entry unsuccessful. A `guard` predicate narrows which roots may be
/// destroyed; ids outside it are marked unsuccessful without cascading.
pub(crate) async fn destroy_by_ids(
    store: &dyn Store,
    model: &Arc<ModelDescriptor>,
    includes: &[IncludeSpec],
    ids: &[Value],
    force: bool,
    guard: Option<&Predicate>,
) -> QuerierResult<Vec<DestroyOutcome>> {
    let mut outcomes = Vec::with_capacity(ids.len());
    let pk = model.primary_key().to_string();
    for id in ids {
        let root_predicate = match guard {
            None => Predicate::eq(pk.clone(), id.clone()),
            Some(guard) => Predicate::And(vec![
                Predicate::eq(pk.clone(), id.clone()),
                guard.clone(),
            ]),
        };
        if guard.is_some() {
            let root_query =
                QueryDescriptor::all(model.clone()).with_predicate(root_predicate.clone());
            if store.find_one(&root_query).await?.is_none() {
                outcomes.push(DestroyOutcome {
                    id: id.clone(),
                    success: false,
                });
                continue;
            }
        }
        for include in includes {
            let associated_id = find_associated_id(store, model, include, id).await?;
            let Some(associated_id) = associated_id else {
                let err =
                    QuerierError::association_not_found(&model.name, include.attach_key());
                tracing::error!(error = %err, id = %id, "cascade target missing");
                return Err(err);
            };
            let target_pk = include.model.primary_key().to_string();
            destroy(
                store,
                &include.model,
                &Predicate::eq(target_pk, associated_id),
                force,
            )
            .await?;
        }
        let affected = destroy(store, model, &root_predicate, force).await?;
        outcomes.push(DestroyOutcome {
            id: id.clone(),
            success: affected > 0,
        });
    }
    Ok(outcomes)
}

async fn find_associated_id(
    store: &dyn Store,
    model: &Arc<ModelDescriptor>,
    include: &IncludeSpec,
    id: &Value,
) -> QuerierResult<Option<Value>> {
    let pk = model.primary_key().to_string();
    let root_query = QueryDescriptor::all(model.clone())
        .with_predicate(Predicate::eq(pk, id.clone()))
        .with_includes(vec![include.clone()]);
    if let Some(root) = store.find_one(&root_query).await? {
        let attached = &root[include.attach_key()];
        let candidate = match include.association.cardinality {
            Cardinality::OneToOne => attached.get("id"),
            Cardinality::OneToMany => attached.get(0).and_then(|c| c.get("id")),
        };
        if let Some(candidate) = candidate.filter(|c| !c.is_null()) {
            return Ok(Some(candidate.clone()));
        }
    }
    // Fallback: look the association up by its foreign key to the root.
    let fk_query = QueryDescriptor::all(include.model.clone())
        .with_predicate(Predicate::eq(format!("{}Id", model.name), id.clone()));
    Ok(store
        .find_one(&fk_query)
        .await?
        .and_then(|row| row.get("id").cloned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterSpec;
    use crate::query::{compose, IncludeDef};
    use crate::schema::{AssociationMeta, ColumnMeta, ModelRegistry, TypeTag};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn registry() -> ModelRegistry {
        let mut registry = ModelRegistry::new();
        registry.register(
            ModelDescriptor::new("User")
                .with_soft_delete()
                .with_column(ColumnMeta::new("name", TypeTag::String))
                .with_column(ColumnMeta::new("age", TypeTag::Integer))
                .with_scope("adults", Predicate::eq("age", 18))
                .with_association(AssociationMeta::one_to_many("Image")),
        );
        registry.register(
            ModelDescriptor::new("Image")
                .with_column(ColumnMeta::new("url", TypeTag::String))
                .with_association(AssociationMeta::one_to_one("User")),
        );
        registry
    }

    async fn seed_users(store: &MemoryStore, model: &ModelDescriptor, count: usize) {
        for i in 0..count {
            store
                .create(model, &json!({"name": format!("user-{i}"), "age": 18}), &[])
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_find_shapes_paging_envelope() {
        let registry = registry();
        let user = registry.get("User").unwrap();
        let store = MemoryStore::new();
        seed_users(&store, &user, 7).await;
        let opts = QueryOpts {
            cur_page: 2,
            per_page: 3,
            ..Default::default()
        };
        let descriptor = compose(
            &registry,
            user.clone(),
            &FilterSpec::default(),
            &[],
            Vec::new(),
            Vec::new(),
            &opts,
        )
        .unwrap();
        let paged = find(&store, descriptor, &opts, json!({}), None)
            .await
            .unwrap();
        assert_eq!(paged.paging.total, 7);
        assert_eq!(paged.paging.last_page, Some(3));
        assert_eq!(paged.paging.cur_page, Some(2));
        assert_eq!(paged.items.len(), 3);
        assert_eq!(paged.paging.sort, "DESC");
    }

    #[tokio::test]
    async fn test_last_page_is_at_least_one() {
        let registry = registry();
        let user = registry.get("User").unwrap();
        let store = MemoryStore::new();
        let opts = QueryOpts::default();
        let descriptor = compose(
            &registry,
            user.clone(),
            &FilterSpec::default(),
            &[],
            Vec::new(),
            Vec::new(),
            &opts,
        )
        .unwrap();
        let paged = find(&store, descriptor, &opts, json!({}), None)
            .await
            .unwrap();
        assert_eq!(paged.paging.last_page, Some(1));
        assert_eq!(paged.paging.total, 0);
    }

    #[tokio::test]
    async fn test_scopes_merge_into_predicate() {
        let registry = registry();
        let user = registry.get("User").unwrap();
        let store = MemoryStore::new();
        store
            .create(&user, &json!({"name": "kid", "age": 7}), &[])
            .await
            .unwrap();
        store
            .create(&user, &json!({"name": "adult", "age": 18}), &[])
            .await
            .unwrap();
        let opts = QueryOpts::default();
        let descriptor = compose(
            &registry,
            user.clone(),
            &FilterSpec::default(),
            &[],
            Vec::new(),
            vec!["adults".to_string()],
            &opts,
        )
        .unwrap();
        let paged = find(&store, descriptor, &opts, json!({}), None)
            .await
            .unwrap();
        assert_eq!(paged.paging.total, 1);
        assert_eq!(paged.items[0]["name"], "adult");
    }

    #[tokio::test]
    async fn test_unknown_scope_fails() {
        let registry = registry();
        let user = registry.get("User").unwrap();
        let mut descriptor = QueryDescriptor::all(user);
        descriptor.scopes = vec!["nope".to_string()];
        assert!(apply_scopes(&mut descriptor).unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_presenter_runs_per_row() {
        let registry = registry();
        let user = registry.get("User").unwrap();
        let store = MemoryStore::new();
        seed_users(&store, &user, 2).await;
        let presenter: Presenter = Arc::new(|mut row| {
            row["shouted"] = Value::from(true);
            Ok(row)
        });
        let opts = QueryOpts::default();
        let descriptor = compose(
            &registry,
            user.clone(),
            &FilterSpec::default(),
            &[],
            Vec::new(),
            Vec::new(),
            &opts,
        )
        .unwrap();
        let paged = find(&store, descriptor, &opts, json!({}), Some(&presenter))
            .await
            .unwrap();
        assert!(paged.items.iter().all(|i| i["shouted"] == true));
    }

    #[tokio::test]
    async fn test_destroy_by_ids_reports_missing_ids() {
        let registry = registry();
        let user = registry.get("User").unwrap();
        let store = MemoryStore::new();
        seed_users(&store, &user, 1).await;
        let outcomes = destroy_by_ids(&store, &user, &[], &[json!(1), json!(99)], false, None)
            .await
            .unwrap();
        assert_eq!(
            outcomes,
            vec![
                DestroyOutcome {
                    id: json!(1),
                    success: true
                },
                DestroyOutcome {
                    id: json!(99),
                    success: false
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_destroy_by_ids_guard_skips_rows_outside_it() {
        let registry = registry();
        let user = registry.get("User").unwrap();
        let store = MemoryStore::new();
        store
            .create(&user, &json!({"name": "kid", "age": 7}), &[])
            .await
            .unwrap();
        store
            .create(&user, &json!({"name": "adult", "age": 18}), &[])
            .await
            .unwrap();
        let guard = Predicate::eq("age", 18);
        let outcomes = destroy_by_ids(
            &store,
            &user,
            &[],
            &[json!(1), json!(2)],
            true,
            Some(&guard),
        )
        .await
        .unwrap();
        assert_eq!(
            outcomes,
            vec![
                DestroyOutcome {
                    id: json!(1),
                    success: false
                },
                DestroyOutcome {
                    id: json!(2),
                    success: true
                },
            ]
        );
        // The guarded-out row survives.
        let left = store.find(&QueryDescriptor::all(user)).await.unwrap();
        assert_eq!(left.total, 1);
        assert_eq!(left.rows[0]["name"], "kid");
    }

    #[tokio::test]
    async fn test_destroy_by_ids_cascades_and_fails_fast() {
        let registry = registry();
        let user = registry.get("User").unwrap();
        let store = MemoryStore::new();
        let include_specs =
            crate::query::normalize_includes(&registry, &user, &[IncludeDef::new("Image")])
                .unwrap();
        store
            .create(
                &user,
                &json!({"name": "with-image", "Images": [{"url": "a.png"}]}),
                &include_specs,
            )
            .await
            .unwrap();
        store
            .create(&user, &json!({"name": "without-image"}), &[])
            .await
            .unwrap();

        let outcomes = destroy_by_ids(&store, &user, &include_specs, &[json!(1)], true, None)
            .await
            .unwrap();
        assert!(outcomes[0].success);
        let image = registry.get("Image").unwrap();
        let leftover = store
            .find(&QueryDescriptor::all(image))
            .await
            .unwrap()
            .total;
        assert_eq!(leftover, 0);

        // The second user has no image to cascade into: the batch aborts.
        let err = destroy_by_ids(&store, &user, &include_specs, &[json!(2)], true, None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "User has no association with Images.");
    }
}
