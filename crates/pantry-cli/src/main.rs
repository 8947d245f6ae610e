use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pantry_sync::{maybe_build_scheduler, SyncConfig, SyncPipeline};
use pantry_warehouse::Warehouse;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "pantry")]
#[command(about = "Pantry recipe warehouse command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one extract -> transform -> load cycle
    Sync {
        /// Refetch sources instead of serving cached payloads
        #[arg(long)]
        refresh: bool,
        /// Fail the run when any quality rule fails
        #[arg(long)]
        strict_quality: bool,
    },
    /// Create the warehouse schema
    Migrate,
    /// Show the latest run's metadata
    Status,
    /// Run the cron scheduler until interrupted
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync {
        refresh: false,
        strict_quality: false,
    }) {
        Commands::Sync {
            refresh,
            strict_quality,
        } => {
            let mut config = SyncConfig::from_env();
            config.strict_quality = config.strict_quality || strict_quality;
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.run_once(refresh).await?;
            println!(
                "sync complete: run_id={} extracted={} transformed={} recipes={} ingredients={} mappings={} quality_passed={}",
                summary.run_id,
                summary.records_extracted,
                summary.records_transformed,
                summary.load.recipes_loaded,
                summary.load.ingredients_loaded,
                summary.load.mappings_loaded,
                summary.quality_passed
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let warehouse = Warehouse::connect(&config.database_url).await?;
            warehouse.init_schema().await?;
            println!("warehouse schema ready at {}", config.database_url);
        }
        Commands::Status => {
            let config = SyncConfig::from_env();
            let warehouse = Warehouse::connect(&config.database_url).await?;
            warehouse.init_schema().await?;
            match warehouse.latest_run().await? {
                Some(run) => println!(
                    "run_id={} status={} extracted={:?} transformed={:?} loaded={:?} quality_passed={:?} error={:?}",
                    run.run_id,
                    run.status,
                    run.records_extracted,
                    run.records_transformed,
                    run.records_loaded,
                    run.quality_check_passed,
                    run.error_message
                ),
                None => println!("no runs recorded yet"),
            }
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            if let Some(scheduler) = maybe_build_scheduler(pipeline).await? {
                scheduler.start().await.context("starting scheduler")?;
                info!("scheduler running; press ctrl-c to stop");
                tokio::signal::ctrl_c()
                    .await
                    .context("waiting for ctrl-c")?;
            }
        }
    }

    Ok(())
}
