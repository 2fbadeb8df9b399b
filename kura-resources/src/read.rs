use std::sync::Arc;

use kura_db::{DbError, Paginator, ViewOptions};
use kura_extension::{Context, Environment, Query};
use kura_filter::Filter;
use kura_schema::policy::ACTION_READ;
use kura_schema::Schema;
use kura_types::ResourceError;
use serde_json::{json, Value};

use crate::policy::{caller, id_filter, load_policy, scope_filter, visible, visible_rows};
use crate::query::{query_filter, verify_query_params, view_options};
use crate::{chained, current_tx, db_failure, fire, response_map, responded, set_response_item, setup, Resources, TxStep};

fn list_response(ctx: &Context, schema: &Schema) -> Result<(Vec<Value>, u64), ResourceError> {
    let rows = match response_map(ctx)?.get(&schema.plural) {
        Some(Value::Array(rows)) => rows.clone(),
        Some(other) => {
            return Err(ResourceError::internal(format!(
                "extension returned invalid list response: {other}"
            )))
        }
        None => Vec::new(),
    };
    let total = ctx.get("total").and_then(Value::as_u64).unwrap_or(rows.len() as u64);
    Ok((rows, total))
}

fn show_response(ctx: &Context, schema: &Schema) -> Result<Value, ResourceError> {
    let response = response_map(ctx)?;
    Ok(response
        .get(&schema.singular)
        .cloned()
        .unwrap_or_else(|| Value::Object(response.clone())))
}

impl Resources {
    /// Lists rows visible to the caller. Returns the rows and the total the
    /// backend counted, or the one a hook put in `total`.
    pub async fn list(
        &self,
        ctx: &mut Context,
        schema: &Arc<Schema>,
        query: &Query,
    ) -> Result<(Vec<Value>, u64), ResourceError> {
        setup(ctx, schema, &schema.url);
        let policy = load_policy(ctx, &self.manager, ACTION_READ, &schema.url)?;
        let auth = caller(ctx);

        let filter = query_filter(schema, query, &policy)?.and_with(scope_filter(schema, &policy, ACTION_READ, &auth)?);
        let paginator = Paginator::from_query(schema, query).map_err(|e| ResourceError::wrong_query(e.to_string()))?;
        verify_query_params(schema, query)?;
        let view = view_options(query);

        let env = self.environment(schema);
        let step = TxStep::List {
            filter: &filter,
            view: &view,
            paginator: &paginator,
        };
        if chained(ctx) {
            self.run_step(ctx, &env, schema, step).await?;
        } else {
            fire(&env, "pre_list", ctx).await?;
            if responded(ctx)? {
                return list_response(ctx, schema);
            }
            self.in_transaction(ctx, &env, schema, ACTION_READ, step).await?;
            fire(&env, "post_list", ctx).await?;
        }

        let (rows, total) = list_response(ctx, schema)?;
        Ok((visible_rows(schema, &policy, &auth, rows)?, total))
    }

    pub(crate) async fn list_in_tx(
        &self,
        ctx: &mut Context,
        env: &Arc<dyn Environment>,
        schema: &Arc<Schema>,
        filter: &Filter,
        view: &ViewOptions,
        paginator: &Paginator,
    ) -> Result<(), ResourceError> {
        fire(env, "pre_list_in_transaction", ctx).await?;
        let tx = current_tx(ctx)?;
        let (rows, total) = match tx.list(schema, filter, Some(view), Some(paginator)).await {
            Ok(found) => found,
            Err(err) => {
                set_response_item(ctx, &schema.plural, json!([]));
                return Err(db_failure(err));
            }
        };
        let data: Vec<Value> = rows.into_iter().map(|r| Value::Object(r.into_data())).collect();
        set_response_item(ctx, &schema.plural, Value::Array(data));
        ctx.insert("total", json!(total));
        fire(env, "post_list_in_transaction", ctx).await
    }

    /// Shows one row. Rows outside the caller's scope are `NotFound`.
    pub async fn show(&self, ctx: &mut Context, schema: &Arc<Schema>, id: &str) -> Result<Value, ResourceError> {
        let path = schema.single_url().replace(":id", id);
        setup(ctx, schema, &path);
        ctx.insert("id", json!(id));
        let policy = load_policy(ctx, &self.manager, ACTION_READ, &path)?;
        let auth = caller(ctx);

        let filter = id_filter(id).and_with(scope_filter(schema, &policy, ACTION_READ, &auth)?);
        let view = ViewOptions::default();
        let env = self.environment(schema);
        let step = TxStep::Show {
            filter: &filter,
            view: &view,
        };
        if chained(ctx) {
            self.run_step(ctx, &env, schema, step).await?;
        } else {
            fire(&env, "pre_show", ctx).await?;
            if responded(ctx)? {
                return show_response(ctx, schema);
            }
            self.in_transaction(ctx, &env, schema, ACTION_READ, step).await?;
            fire(&env, "post_show", ctx).await?;
        }

        match show_response(ctx, schema)? {
            Value::Object(data) => visible(schema, &policy, &auth, &data)?
                .map(Value::Object)
                .ok_or_else(|| ResourceError::not_found("Resource not found")),
            other => Ok(other),
        }
    }

    pub(crate) async fn show_in_tx(
        &self,
        ctx: &mut Context,
        env: &Arc<dyn Environment>,
        schema: &Arc<Schema>,
        filter: &Filter,
        view: &ViewOptions,
    ) -> Result<(), ResourceError> {
        fire(env, "pre_show_in_transaction", ctx).await?;
        if responded(ctx)? {
            return Ok(());
        }
        let tx = current_tx(ctx)?;
        let resource = match tx.fetch(schema, filter, Some(view)).await {
            Ok(resource) => resource,
            Err(DbError::NotFound(_)) => return Err(ResourceError::not_found("Resource not found")),
            Err(err) => return Err(db_failure(err)),
        };
        set_response_item(ctx, &schema.singular, Value::Object(resource.into_data()));
        fire(env, "post_show_in_transaction", ctx).await
    }
}
