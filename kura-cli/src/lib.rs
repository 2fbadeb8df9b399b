//! Wiring shared by the `kura` binary subcommands.

use std::sync::Arc;

use anyhow::Context as _;
use kura_db::{connect_db, init_db_with_schemas, Db};
use kura_extension::{EnvironmentManager, Host};
use kura_resources::Resources;
use kura_schema::Manager;
use kura_sync::MemorySync;
use tracing::info;

pub mod config;

use config::Config;

pub fn load_manager(config: &Config) -> anyhow::Result<Arc<Manager>> {
    let mut manager = Manager::new();
    for path in &config.schemas {
        manager
            .load_file(path)
            .with_context(|| format!("loading schemas from {}", path.display()))?;
    }
    manager.validate()?;
    info!(schemas = manager.schemas().len(), "schemas loaded");
    Ok(Arc::new(manager))
}

pub async fn open_db(config: &Config, manager: &Arc<Manager>) -> anyhow::Result<Arc<dyn Db>> {
    let db = &config.database;
    let handle = connect_db(Arc::clone(manager), &db.kind, &db.connection, db.max_open_conn).await?;
    Ok(handle)
}

pub async fn init_db(config: &Config, db: &dyn Db, manager: &Manager) -> anyhow::Result<()> {
    let opts = &config.database;
    init_db_with_schemas(db, manager, opts.drop_on_create, opts.cascade, opts.auto_migrate).await?;
    Ok(())
}

/// A running server's pipeline plus the host it is bound to. The host must
/// outlive the pipeline for scripts to reach `model_*`.
pub struct Server {
    pub host: Arc<Host>,
    pub resources: Arc<Resources>,
}

pub async fn build_server(config: &Config) -> anyhow::Result<Server> {
    let manager = load_manager(config)?;
    let db = open_db(config, &manager).await?;
    init_db(config, db.as_ref(), &manager).await?;

    let mut builder = Host::builder(Arc::clone(&manager))
        .db(Arc::clone(&db))
        .sync(Arc::new(MemorySync::new()))
        .config(config.config.clone())
        .limits(config.extension.limits()?)
        .net(config.extension.net());
    if let Some(fs) = config.extension.fs()? {
        builder = builder.fs(fs);
    }
    let host = builder.build();

    let envs = Arc::new(EnvironmentManager::new());
    let loaded = envs.load_extensions(&host)?;
    info!(environments = loaded, "extensions loaded");
    let resources = Resources::bind(&host, db, envs);
    Ok(Server { host, resources })
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn server_builds_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("schema.yaml"),
            "schemas:\n  - id: network\n    plural: networks\n    schema:\n      properties:\n        name:\n          type: string\n",
        )
        .unwrap();
        let text = format!(
            "database:\n  connection: {}\n  drop_on_create: true\nschemas: [schema.yaml]\n",
            dir.path().join("kura.db").display()
        );
        let config = Config::from_yaml(&text, dir.path()).unwrap();

        let server = build_server(&config).await.unwrap();
        assert!(server.resources.schema("network").is_ok());
        assert!(server.host.db.is_some());
        assert!(Path::new(&config.database.connection).exists());
    }
}
