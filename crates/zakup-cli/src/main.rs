use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zakup_core::{EntityKind, Trigger};
use zakup_store::{PgStorage, SyncStorage};
use zakup_sync::{run_sync_once, SyncConfig, SyncEngine};

#[derive(Debug, Parser)]
#[command(name = "zakup-cli")]
#[command(about = "Goszakup procurement mirror")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the orchestrator (and scheduler, when enabled) until interrupted.
    Run,
    /// One-shot foreground sync of all entities, or a single one.
    Sync {
        /// Entity wire name: trd_buy, lot, contract, participant.
        #[arg(long)]
        entity: Option<String>,
    },
    /// Cursor positions and failure streaks per entity.
    Status,
    /// Apply pending database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Run => run(config).await,
        Commands::Sync { entity } => sync_once(config, entity).await,
        Commands::Status => status(config).await,
        Commands::Migrate => migrate(config).await,
    }
}

async fn run(config: SyncConfig) -> Result<()> {
    let engine = SyncEngine::from_config(config).await?;
    let scheduler = engine.maybe_build_scheduler().await?;
    if let Some(mut scheduler) = scheduler {
        scheduler.start().await?;
        info!("scheduler started");
        let orchestrator = engine.orchestrator();
        orchestrator.trigger_all(Trigger::Scheduled).await?;
        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        scheduler.shutdown().await?;
    } else {
        let orchestrator = engine.orchestrator();
        orchestrator.trigger_all(Trigger::Manual).await?;
        tokio::signal::ctrl_c().await?;
        info!("shutting down");
    }
    engine.shutdown().await;
    Ok(())
}

async fn sync_once(config: SyncConfig, entity: Option<String>) -> Result<()> {
    let only = match entity.as_deref() {
        Some(name) => match EntityKind::from_wire_name(name) {
            Some(kind) => Some(kind),
            None => bail!("unknown entity {name:?}; expected trd_buy, lot, contract or participant"),
        },
        None => None,
    };

    let summary = run_sync_once(&config, only).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn status(config: SyncConfig) -> Result<()> {
    let storage = PgStorage::connect(&config.database_url).await?;
    for entity in EntityKind::DEPENDENCY_ORDER {
        let cursor = storage.cursor(entity).await?;
        let count = storage.record_count(entity).await?;
        let position = cursor
            .position
            .map(|p| p.encode())
            .unwrap_or_else(|| "-".to_string());
        let last_success = cursor
            .last_success_at
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<12} position={:<35} records={:<8} last_success={} failures={}",
            entity.wire_name(),
            position,
            count,
            last_success,
            cursor.consecutive_failures
        );
    }
    Ok(())
}

async fn migrate(config: SyncConfig) -> Result<()> {
    let storage = PgStorage::connect(&config.database_url).await?;
    storage.migrate().await?;
    println!("migrations applied");
    Ok(())
}
