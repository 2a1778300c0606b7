use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "starwatch-cli")]
#[command(about = "Starwatch trending pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full rank -> enrich -> publish pipeline once.
    Sync,
    /// Print a digest of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run the pipeline on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = starwatch_pipeline::run_pipeline_once_from_env().await?;
            println!(
                "sync complete: run_id={} ranked={} metadata={} summaries={} report={}",
                summary.run_id,
                summary.ranked,
                summary.metadata_present,
                summary.summaries_generated,
                summary.report_path
            );
        }
        Commands::Report { runs } => {
            // The digest only needs the output directory, never credentials.
            let settings = starwatch_pipeline::PipelineSettings::load(Path::new(
                starwatch_pipeline::SETTINGS_FILE,
            ))?;
            let output_dir = settings
                .output_dir
                .unwrap_or_else(|| PathBuf::from(starwatch_pipeline::DEFAULT_OUTPUT_DIR));
            let digest = starwatch_pipeline::report_digest_markdown(runs, output_dir)?;
            println!("{digest}");
        }
        Commands::Schedule => {
            let config = starwatch_pipeline::PipelineConfig::from_env()?;
            let pipeline = Arc::new(starwatch_pipeline::Pipeline::new(config)?);
            let Some(mut sched) = starwatch_pipeline::maybe_build_scheduler(pipeline).await?
            else {
                anyhow::bail!(
                    "scheduler is disabled; set `scheduler_enabled: true` in starwatch.yaml"
                );
            };
            sched.start().await?;
            tracing::info!("scheduler started; press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            sched.shutdown().await?;
        }
    }

    Ok(())
}
