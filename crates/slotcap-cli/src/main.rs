use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use slotcap_provision::{AppConfig, CapacityScheduler, Provisioner};
use slotcap_storage::PgCapacityStore;
use slotcap_web::AppState;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "slotcap")]
#[command(about = "Delivery slot capacity calendar")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API and own the provisioning scheduler.
    Serve,
    /// Provision the upcoming window once and exit.
    Provision {
        /// oneWeek, twoWeeks, oneMonth or twoMonths (default twoMonths).
        #[arg(long)]
        period: Option<String>,
        /// Replace dates that already have capacity configured.
        #[arg(long)]
        overwrite: bool,
    },
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Provision { period, overwrite } => {
            let store = connect(&config).await?;
            let provisioner = Provisioner::from_store(store);
            let summary = provisioner.trigger(period.as_deref(), overwrite).await?;
            println!(
                "provisioning complete: run_id={} window={}..{} provisioned={} skipped={}",
                summary.run_id, summary.window_start, summary.window_end, summary.provisioned, summary.skipped
            );
        }
        Commands::Migrate => {
            connect(&config).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn connect(config: &AppConfig) -> Result<Arc<PgCapacityStore>> {
    let store = PgCapacityStore::connect(&config.database_url, config.database_max_connections)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;
    Ok(Arc::new(store))
}

async fn serve(config: AppConfig) -> Result<()> {
    let store = connect(&config).await?;
    let provisioner = Provisioner::from_store(store);
    let scheduler = Arc::new(CapacityScheduler::new(provisioner.clone(), config.scheduler.clone()));

    if config.scheduler_autostart {
        scheduler.start().await.context("starting capacity scheduler")?;
    }

    let listener = TcpListener::bind(config.web_addr)
        .await
        .with_context(|| format!("binding {}", config.web_addr))?;
    let state = AppState::new(provisioner, scheduler.clone());
    slotcap_web::serve(listener, state, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
    })
    .await?;

    if scheduler.is_active().await {
        if let Err(err) = scheduler.stop().await {
            warn!(error = %err, "failed to stop capacity scheduler");
        }
    }
    Ok(())
}
