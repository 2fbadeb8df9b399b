use std::sync::Arc;

use kura_db::{DbError, Resource, TxHandle};
use kura_extension::{Context, Environment};
use kura_filter::{matches, Filter};
use kura_schema::policy::{ACTION_CREATE, ACTION_DELETE, ACTION_UPDATE};
use kura_schema::{Authorization, LockPolicy, Policy, Schema, SchemaError};
use kura_types::{ResourceError, ResourceProblem};
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::policy::{caller, id_filter, load_policy, readable_filter, scope_filter, visible};
use crate::{chained, current_tx, db_failure, fire, response_map, responded, set_response_item, setup, Resources, TxStep};

fn unauthorized(err: SchemaError) -> ResourceError {
    ResourceError::unauthorized(err.to_string())
}

pub(crate) fn validation_error(err: SchemaError) -> ResourceError {
    ResourceError::wrong_data(format!("Validation error: {err}"))
}

/// `tenant_id` and `domain_id` the new row is owned by, taken from the
/// caller when the request leaves them out.
fn fill_owner(schema: &Schema, auth: &Authorization, data: &mut Map<String, Value>) -> Result<(), ResourceError> {
    if schema.has_property("tenant_id") || data.contains_key("tenant_id") {
        if !data.contains_key("tenant_id") {
            if auth.tenant_id().is_empty() {
                return Err(ResourceError::wrong_data(
                    "A non-empty tenant_id should be provided in the request",
                ));
            }
            data.insert("tenant_id".into(), json!(auth.tenant_id()));
        }
        data.insert("tenant_name".into(), json!(auth.tenant_name()));
    }
    if schema.has_property("domain_id") || data.contains_key("domain_id") {
        if !data.contains_key("domain_id") {
            data.insert("domain_id".into(), json!(auth.domain_id()));
        }
        data.insert("domain_name".into(), json!(auth.domain_name()));
    }
    Ok(())
}

/// The `resource` map hooks see and may rewrite.
fn context_resource(ctx: &Context) -> Result<Map<String, Value>, ResourceError> {
    match ctx.get("resource") {
        Some(Value::Object(data)) => Ok(data.clone()),
        _ => Err(ResourceError::internal("context has no resource")),
    }
}

/// Objects merge key by key; arrays and scalars are replaced.
pub(crate) fn merge(base: &mut Map<String, Value>, update: &Map<String, Value>) {
    for (key, value) in update {
        match (base.get_mut(key), value) {
            (Some(Value::Object(current)), Value::Object(patch)) => merge(current, patch),
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn write_error(err: DbError, problem: ResourceProblem, data: &Map<String, Value>) -> ResourceError {
    match err {
        DbError::ForeignKey(_) => {
            info!(error = %err, "foreign key constraint failed");
            ResourceError::new(
                ResourceProblem::ForeignKeyFailed,
                format!(
                    "Related resource does not exist. Please check your request: {}",
                    Value::Object(data.clone())
                ),
            )
        }
        other => ResourceError::new(problem, format!("Failed to store data in database: {other}")),
    }
}

async fn fetch_for(
    tx: &TxHandle,
    schema: &Arc<Schema>,
    filter: &Filter,
    event: &str,
) -> Result<Resource, DbError> {
    match schema.lock_policy(event) {
        LockPolicy::NoLocking => tx.fetch(schema, filter, None).await,
        lock => tx.lock_fetch(schema, filter, lock, None).await,
    }
}

fn singular_of(ctx: &Context, schema: &Schema) -> Result<Value, ResourceError> {
    let response = response_map(ctx)?;
    Ok(response
        .get(&schema.singular)
        .cloned()
        .unwrap_or_else(|| Value::Object(response.clone())))
}

/// Output filtering for writes: a row the caller could not read back is
/// an authorization failure.
fn visible_written(
    ctx: &Context,
    schema: &Schema,
    policy: &Policy,
    auth: &Authorization,
) -> Result<Value, ResourceError> {
    match singular_of(ctx, schema)? {
        Value::Object(data) => visible(schema, policy, auth, &data)?
            .map(Value::Object)
            .ok_or_else(|| ResourceError::unauthorized("Rejected by property filter")),
        other => Ok(other),
    }
}

impl Resources {
    pub async fn create(
        &self,
        ctx: &mut Context,
        schema: &Arc<Schema>,
        mut data: Map<String, Value>,
    ) -> Result<Value, ResourceError> {
        let chained = chained(ctx);
        setup(ctx, schema, &schema.url);
        let policy = load_policy(ctx, &self.manager, ACTION_CREATE, &schema.url)?;
        let auth = caller(ctx);

        fill_owner(schema, &auth, &mut data)?;
        policy.check(ACTION_CREATE, &auth, &data).map_err(unauthorized)?;
        data.remove("tenant_name");
        data.remove("domain_name");
        policy
            .condition()
            .apply_property_condition_filter(ACTION_CREATE, &data, None)
            .map_err(unauthorized)?;

        let id = match data.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            _ => Uuid::new_v4().to_string(),
        };
        data.insert("id".into(), json!(id));
        ctx.insert("id", json!(id));
        ctx.insert("resource", Value::Object(data));

        let env = self.environment(schema);
        if !chained {
            fire(&env, "pre_create", ctx).await?;
            if responded(ctx)? {
                return singular_of(ctx, schema);
            }
        }

        let mut data = context_resource(ctx)?;
        schema.validate_on_create(&data).map_err(validation_error)?;
        schema.populate_defaults(&mut data);
        if !matches(&scope_filter(schema, &policy, ACTION_CREATE, &auth)?, &data) {
            return Err(ResourceError::unauthorized("Rejected by policy condition"));
        }
        ctx.insert("resource", Value::Object(data));

        self.transact(ctx, &env, schema, ACTION_CREATE, TxStep::Create).await?;
        if !chained {
            fire(&env, "post_create", ctx).await?;
        }
        visible_written(ctx, schema, &policy, &auth)
    }

    pub(crate) async fn create_in_tx(
        &self,
        ctx: &mut Context,
        env: &Arc<dyn Environment>,
        schema: &Arc<Schema>,
    ) -> Result<(), ResourceError> {
        fire(env, "pre_create_in_transaction", ctx).await?;
        let data = context_resource(ctx)?;
        let tx = current_tx(ctx)?;
        let resource = Resource::new(Arc::clone(schema), data);
        if let Err(err) = tx.create(&resource).await {
            debug!(schema = %schema.id, error = %err, "create failed");
            return Err(write_error(err, ResourceProblem::CreateFailed, resource.data()));
        }
        set_response_item(ctx, &schema.singular, Value::Object(resource.into_data()));
        fire(env, "post_create_in_transaction", ctx).await
    }

    pub async fn update(
        &self,
        ctx: &mut Context,
        schema: &Arc<Schema>,
        id: &str,
        data: Map<String, Value>,
    ) -> Result<Value, ResourceError> {
        let chained = chained(ctx);
        let path = schema.single_url().replace(":id", id);
        setup(ctx, schema, &path);
        ctx.insert("id", json!(id));
        let policy = load_policy(ctx, &self.manager, ACTION_UPDATE, &path)?;
        let auth = caller(ctx);
        policy.check(ACTION_UPDATE, &auth, &data).map_err(unauthorized)?;
        ctx.insert("resource", Value::Object(data));

        let env = self.environment(schema);
        if !chained {
            fire(&env, "pre_update", ctx).await?;
            if responded(ctx)? {
                return singular_of(ctx, schema);
            }
        }

        let data = context_resource(ctx)?;
        let filter = id_filter(id).and_with(scope_filter(schema, &policy, ACTION_UPDATE, &auth)?);
        let step = TxStep::Update {
            id,
            filter: &filter,
            data: &data,
        };
        self.transact(ctx, &env, schema, ACTION_UPDATE, step).await?;
        if !chained {
            fire(&env, "post_update", ctx).await?;
        }
        visible_written(ctx, schema, &policy, &auth)
    }

    pub(crate) async fn update_in_tx(
        &self,
        ctx: &mut Context,
        env: &Arc<dyn Environment>,
        schema: &Arc<Schema>,
        id: &str,
        filter: &Filter,
        data: &Map<String, Value>,
    ) -> Result<(), ResourceError> {
        let tx = current_tx(ctx)?;
        let existing = match fetch_for(&tx, schema, filter, "update").await {
            Ok(existing) => existing,
            Err(DbError::NotFound(_)) => return Err(ResourceError::not_found("Resource not found")),
            Err(err) => return Err(db_failure(err)),
        };
        schema.validate_on_update(data).map_err(validation_error)?;
        if let Some(policy) = ctx.policy() {
            policy
                .condition()
                .apply_property_condition_filter(ACTION_UPDATE, existing.data(), Some(data))
                .map_err(unauthorized)?;
        }

        let mut merged = existing.into_data();
        merge(&mut merged, data);
        merged.insert("id".into(), json!(id));
        ctx.insert("resource", Value::Object(merged));
        fire(env, "pre_update_in_transaction", ctx).await?;

        let resource = Resource::new(Arc::clone(schema), context_resource(ctx)?);
        if let Err(err) = tx.update(&resource).await {
            debug!(schema = %schema.id, id, error = %err, "update failed");
            return Err(write_error(err, ResourceProblem::UpdateFailed, data));
        }
        set_response_item(ctx, &schema.singular, Value::Object(resource.into_data()));
        fire(env, "post_update_in_transaction", ctx).await
    }

    /// Deletes one row. A row the caller can read but not delete is
    /// `Forbidden`; one it cannot see at all is `NotFound`.
    pub async fn delete(&self, ctx: &mut Context, schema: &Arc<Schema>, id: &str) -> Result<(), ResourceError> {
        let chained = chained(ctx);
        let path = schema.single_url().replace(":id", id);
        setup(ctx, schema, &path);
        ctx.insert("id", json!(id));

        let env = self.environment(schema);
        if !chained {
            fire(&env, "pre_delete", ctx).await?;
        }
        let policy = load_policy(ctx, &self.manager, ACTION_DELETE, &path)?;
        let auth = caller(ctx);
        let filter = id_filter(id).and_with(scope_filter(schema, &policy, ACTION_DELETE, &auth)?);
        let readable = readable_filter(ctx, &self.manager, schema, &path)?.map(|f| id_filter(id).and_with(f));
        let step = TxStep::Delete {
            id,
            filter: &filter,
            readable: readable.as_ref(),
        };
        self.transact(ctx, &env, schema, ACTION_DELETE, step).await?;
        if !chained {
            fire(&env, "post_delete", ctx).await?;
        }
        Ok(())
    }

    pub(crate) async fn delete_in_tx(
        &self,
        ctx: &mut Context,
        env: &Arc<dyn Environment>,
        schema: &Arc<Schema>,
        id: &str,
        filter: &Filter,
        readable: Option<&Filter>,
    ) -> Result<(), ResourceError> {
        let tx = current_tx(ctx)?;
        let existing = match fetch_for(&tx, schema, filter, "delete").await {
            Ok(existing) => existing,
            Err(DbError::NotFound(_)) => {
                let seen = match readable {
                    Some(readable) => match tx.fetch(schema, readable, None).await {
                        Ok(_) => true,
                        Err(DbError::NotFound(_)) => false,
                        Err(err) => return Err(db_failure(err)),
                    },
                    None => false,
                };
                return Err(if seen {
                    ResourceError::new(ResourceProblem::Forbidden, "Deleting this resource is not allowed")
                } else {
                    ResourceError::not_found("Resource not found")
                });
            }
            Err(err) => return Err(db_failure(err)),
        };
        if let Some(policy) = ctx.policy() {
            policy
                .condition()
                .apply_property_condition_filter(ACTION_DELETE, existing.data(), None)
                .map_err(unauthorized)?;
        }
        ctx.insert("resource", Value::Object(existing.into_data()));
        fire(env, "pre_delete_in_transaction", ctx).await?;
        if let Err(err) = tx.delete(schema, id).await {
            debug!(schema = %schema.id, id, error = %err, "delete failed");
            return Err(ResourceError::new(ResourceProblem::DeleteFailed, err.to_string()));
        }
        fire(env, "post_delete_in_transaction", ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_deep_for_objects_only() {
        let mut base = json!({"name": "a", "config": {"x": 1, "y": 2}, "tags": [1, 2]})
            .as_object()
            .cloned()
            .unwrap();
        let patch = json!({"config": {"y": 3}, "tags": [3]}).as_object().cloned().unwrap();
        merge(&mut base, &patch);
        assert_eq!(
            Value::Object(base),
            json!({"name": "a", "config": {"x": 1, "y": 3}, "tags": [3]})
        );
    }

    #[test]
    fn owner_comes_from_caller() {
        let schema = Schema::from_value(&json!({
            "id": "network", "plural": "networks",
            "schema": {"properties": {"tenant_id": {"type": "string"}, "name": {"type": "string"}}}
        }))
        .unwrap();
        let mut data = Map::new();
        fill_owner(&schema, &Authorization::scoped_to_tenant("t1", "one"), &mut data).unwrap();
        assert_eq!(data.get("tenant_id"), Some(&json!("t1")));

        let mut data = Map::new();
        let err = fill_owner(&schema, &Authorization::scoped_to_domain(Default::default()), &mut data).unwrap_err();
        assert_eq!(err.problem(), ResourceProblem::WrongData);
    }
}
