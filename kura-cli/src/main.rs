use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kura_cli::config::Config;
use kura_cli::{build_server, init_db, load_manager, open_db};
use kura_db::{connect_db, copy_db_resources, init_db_with_schemas};
use kura_testing::TestRunner;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kura", version, about = "Schema-driven REST resource server")]
struct Cli {
    /// Configuration file.
    #[arg(long, short, env = "KURA_CONFIG", default_value = "kura.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the REST API.
    Serve,
    /// Create tables for every configured schema.
    InitDb,
    /// Copy every resource from one database to another.
    Migrate {
        #[arg(long = "in-type", default_value = "yaml")]
        in_type: String,
        #[arg(long = "in")]
        input: String,
        #[arg(long = "out-type", default_value = "sqlite")]
        out_type: String,
        #[arg(long = "out")]
        output: String,
        /// Replace rows that already exist in the target.
        #[arg(long = "override")]
        override_existing: bool,
    },
    /// Run `test_*` functions in extension test scripts.
    TestExtensions {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Only run tests whose name contains this.
        #[arg(long)]
        only: Option<String>,
        #[arg(long, default_value_t = 30_000)]
        timelimit_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve => {
            let config = Config::load(&cli.config)?;
            let server = build_server(&config).await?;
            let app = kura_http::router(Arc::clone(&server.resources));
            kura_http::serve(config.address()?, app).await?;
            drop(server);
        }
        Command::InitDb => {
            let config = Config::load(&cli.config)?;
            let manager = load_manager(&config)?;
            let db = open_db(&config, &manager).await?;
            init_db(&config, db.as_ref(), &manager).await?;
            db.close().await?;
            info!("database initialised");
        }
        Command::Migrate {
            in_type,
            input,
            out_type,
            output,
            override_existing,
        } => {
            let config = Config::load(&cli.config)?;
            let manager = load_manager(&config)?;
            let max = config.database.max_open_conn;
            let source = connect_db(Arc::clone(&manager), &in_type, &input, max).await?;
            let target = connect_db(Arc::clone(&manager), &out_type, &output, max).await?;
            init_db_with_schemas(target.as_ref(), &manager, false, false, false).await?;
            let count = copy_db_resources(source.as_ref(), target.as_ref(), &manager, override_existing).await?;
            source.close().await?;
            target.close().await?;
            println!("copied {count} resources from {input} to {output}");
        }
        Command::TestExtensions {
            files,
            only,
            timelimit_ms,
        } => {
            let mut runner = TestRunner::new().time_limit(Duration::from_millis(timelimit_ms));
            if let Some(pattern) = only {
                runner = runner.only(pattern);
            }
            let report = runner.run_files(&files[..]).await?;
            for outcome in &report.outcomes {
                println!("{outcome}");
            }
            println!("{} passed, {} failed", report.passed(), report.failed());
            if !report.success() {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
