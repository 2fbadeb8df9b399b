//! Clearing a schema together with everything that depends on it.

use std::collections::HashSet;
use std::sync::Arc;

use kura_db::util::within_tx;
use kura_db::{Db, DbError, IsolationLevel, TxOptions};
use kura_filter::Filter;
use kura_schema::{Manager, Schema};
use tracing::{debug, info};

/// `root` plus every schema that reaches it through a parent link or a
/// relation property, transitively.
fn dependants(manager: &Manager, root: &str) -> HashSet<String> {
    let mut doomed = HashSet::from([root.to_string()]);
    loop {
        let before = doomed.len();
        for schema in manager.schemas().iter().filter(|s| !s.is_abstract) {
            if doomed.contains(&schema.id) {
                continue;
            }
            let child = schema.parent.as_deref().is_some_and(|p| doomed.contains(p));
            let refers = schema
                .properties
                .iter()
                .filter_map(|p| p.relation.as_deref())
                .any(|r| doomed.contains(r));
            if child || refers {
                doomed.insert(schema.id.clone());
            }
        }
        if doomed.len() == before {
            return doomed;
        }
    }
}

/// Deletes every row of `schema_id` and of every schema depending on it,
/// dependants first, in a single transaction. Returns the rows removed.
pub async fn cascade_clear(db: &dyn Db, manager: &Manager, schema_id: &str) -> Result<u64, DbError> {
    let doomed = dependants(manager, schema_id);
    let order: Vec<Arc<Schema>> = manager
        .ordered_schemas()
        .into_iter()
        .rev()
        .filter(|s| doomed.contains(&s.id))
        .collect();
    let options = TxOptions::new(IsolationLevel::Serializable);
    let removed = within_tx(db, &options, |tx| {
        let order = order.clone();
        async move {
            let mut removed = 0;
            for schema in &order {
                let (rows, _) = tx.list(schema, &Filter::all(), None, None).await?;
                for row in &rows {
                    tx.delete(schema, row.id()).await?;
                }
                debug!(schema = %schema.id, rows = rows.len(), "cleared");
                removed += rows.len() as u64;
            }
            Ok::<_, DbError>(removed)
        }
    })
    .await?;
    info!(schema = schema_id, removed, "cascade clear finished");
    Ok(removed)
}
