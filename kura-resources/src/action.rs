use std::sync::Arc;

use kura_db::DbError;
use kura_extension::{Context, Environment};
use kura_filter::Filter;
use kura_schema::{Action, Schema};
use kura_types::ResourceError;
use serde_json::{json, Map, Value};

use crate::policy::{caller, id_filter, load_policy, scope_filter};
use crate::write::validation_error;
use crate::{current_tx, db_failure, fire, Resources, TxStep};

impl Resources {
    /// Runs a custom action. The extension bound to the action's event
    /// produces the response; single-resource actions first check that the
    /// target exists within the caller's scope.
    pub async fn action(
        &self,
        ctx: &mut Context,
        schema: &Arc<Schema>,
        action_id: &str,
        id: Option<&str>,
        input: Value,
    ) -> Result<Value, ResourceError> {
        let action = schema
            .action(action_id)
            .cloned()
            .ok_or_else(|| ResourceError::not_found(format!("Unknown action '{action_id}' on {}", schema.id)))?;

        let path = match id {
            Some(id) if action.targets_single_resource() => format!("{}/{}", schema.url, id),
            _ => schema.url.clone(),
        };
        ctx.set_schema(Arc::clone(schema));
        ctx.insert("path", Value::String(path.clone()));
        if let Some(id) = id {
            ctx.insert("id", json!(id));
        }

        let policy = load_policy(ctx, &self.manager, &action.id, &path)?;
        let auth = caller(ctx);
        let input_map = match &input {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        policy
            .check(&action.id, &auth, &input_map)
            .map_err(|e| ResourceError::unauthorized(e.to_string()))?;
        policy
            .condition()
            .apply_property_condition_filter(&action.id, &input_map, None)
            .map_err(|e| ResourceError::unauthorized(e.to_string()))?;

        if let Some(input_schema) = &action.input_schema {
            schema.validate(input_schema, &input).map_err(validation_error)?;
        }
        ctx.insert("input", input);

        let filter = match id {
            Some(id) if action.targets_single_resource() => {
                Some(id_filter(id).and_with(scope_filter(schema, &policy, &action.id, &auth)?))
            }
            _ => None,
        };
        let env = self.environment(schema);
        let step = TxStep::Action {
            action: &action,
            filter: filter.as_ref(),
        };
        self.transact(ctx, &env, schema, &action.id, step).await?;

        Ok(ctx.response().cloned().unwrap_or(Value::Null))
    }

    pub(crate) async fn action_in_tx(
        &self,
        ctx: &mut Context,
        env: &Arc<dyn Environment>,
        schema: &Arc<Schema>,
        action: &Action,
        filter: Option<&Filter>,
    ) -> Result<(), ResourceError> {
        if let Some(filter) = filter {
            let tx = current_tx(ctx)?;
            match tx.fetch(schema, filter, None).await {
                Ok(_) => {}
                Err(DbError::NotFound(_)) => return Err(ResourceError::not_found("Resource not found")),
                Err(err) => return Err(db_failure(err)),
            }
        }
        fire(env, &action.id, ctx).await?;
        if ctx.response().is_none() && !action.response_ownership {
            return Err(ResourceError::internal(format!(
                "no response from action '{}' on {}",
                action.id, schema.id
            )));
        }
        Ok(())
    }
}
