mod config;
mod serve_cmd;
mod status_cmd;

use clap::{Parser, Subcommand};

use conductor_db::pool;

use config::ConductorConfig;

#[derive(Parser)]
#[command(name = "conductor", about = "Autonomous software-engineering orchestrator")]
struct Cli {
    /// Database URL (overrides CONDUCTOR_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a conductor config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/conductor")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the conductor database (requires config file or env vars)
    DbInit,
    /// Run the webhook/trigger/metrics server and the background queue consumers
    Serve {
        /// Address to bind the HTTP server to
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Port to bind the HTTP server to
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Root directory under which per-task workspaces are checked out
        #[arg(long, default_value = "./workspaces")]
        workspace_root: String,
        /// Harness used to run agent invocations
        #[arg(long, default_value = "claude-code")]
        harness: String,
    },
    /// Show task and subtask counts by status
    Status,
}

/// Execute the `conductor init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let webhook_secret = config::generate_webhook_secret();

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        webhook: config::WebhookSection {
            secret: webhook_secret.clone(),
        },
        github_app: config::GitHubAppSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  webhook.secret = {}...{}", &webhook_secret[..8], &webhook_secret[56..]);
    println!();
    println!("Next: run `conductor db-init` to create and migrate the database.");
    println!("Set github_app.app_id / github_app.private_key_path in the config file (or");
    println!("CONDUCTOR_GITHUB_APP_ID / CONDUCTOR_GITHUB_PRIVATE_KEY_PATH) before `conductor serve`.");

    Ok(())
}

/// Execute the `conductor db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = ConductorConfig::resolve(cli_db_url)?;

    println!("Initializing conductor database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("conductor db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve { bind, port, workspace_root, harness } => {
            let resolved = ConductorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = serve_cmd::run_serve(
                db_pool.clone(),
                &bind,
                port,
                &workspace_root,
                &harness,
                resolved,
            )
            .await;
            db_pool.close().await;
            result?;
        }
        Commands::Status => {
            let resolved = ConductorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
