use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use repmap_adapters::{CivicApiGeocoder, FinanceApiClient};
use repmap_ingest::{
    compute_coverage, EnrichmentPass, ExpectedOffices, IngestConfig, IngestPipeline,
};
use repmap_storage::{CanonicalStore, HttpClientConfig, HttpFetcher, PgStore};
use repmap_web::{AppState, WebConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "repmap-cli")]
#[command(about = "Representative data pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass (or keep running on the cron schedule when
    /// REPMAP_SCHEDULER_ENABLED is set).
    Ingest,
    /// Attach campaign-finance identifiers to canonical rows that lack one.
    Enrich {
        #[arg(long, required = true)]
        state: Vec<String>,
    },
    /// Print the coverage metric for one state.
    Coverage {
        #[arg(long)]
        state: String,
    },
    /// Serve the JSON read API.
    Serve,
    /// Apply pending database migrations.
    Migrate,
}

async fn connect_store(database_url: &str) -> Result<Arc<dyn CanonicalStore>> {
    let pg = PgStore::connect(database_url)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(pg))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let config = IngestConfig::from_env();
            let store = connect_store(&config.database_url).await?;
            let pipeline = Arc::new(IngestPipeline::new(config, store)?);

            match pipeline.maybe_build_scheduler().await? {
                Some(sched) => {
                    sched.start().await.context("starting scheduler")?;
                    let summary = pipeline.run_once().await?;
                    println!(
                        "initial ingest complete: run_id={} records={} inserted={} updated={} conflicts={}",
                        summary.run_id,
                        summary.records_seen,
                        summary.inserted,
                        summary.updated,
                        summary.conflicts
                    );
                    println!("scheduler running; ctrl-c to stop");
                    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                }
                None => {
                    let summary = pipeline.run_once().await?;
                    println!(
                        "ingest complete: run_id={} records={} inserted={} updated={} conflicts={} reports={}",
                        summary.run_id,
                        summary.records_seen,
                        summary.inserted,
                        summary.updated,
                        summary.conflicts,
                        summary.reports_dir
                    );
                }
            }
        }
        Commands::Enrich { state } => {
            let config = IngestConfig::from_env();
            let store = connect_store(&config.database_url).await?;
            let base_url = std::env::var("REPMAP_FINANCE_BASE_URL")
                .context("REPMAP_FINANCE_BASE_URL must be set for enrich")?;
            let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig::default())?);
            let finance = Arc::new(FinanceApiClient::new(fetcher, base_url));
            let pass = EnrichmentPass::new(store, finance);
            let summary = pass.run(&state, Utc::now()).await?;
            println!(
                "enrichment complete: examined={} attached={} lookup_failures={}",
                summary.examined, summary.attached, summary.lookup_failures
            );
        }
        Commands::Coverage { state } => {
            let config = IngestConfig::from_env();
            let store = connect_store(&config.database_url).await?;
            let expected = ExpectedOffices::load_or_default(
                &config.workspace_root.join("config/expected_offices.yaml"),
            )?;
            let metric = compute_coverage(store.as_ref(), &state, &expected, Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&metric)?);
        }
        Commands::Serve => {
            let config = IngestConfig::from_env();
            let store = connect_store(&config.database_url).await?;
            let base_url = std::env::var("REPMAP_GEOCODER_BASE_URL")
                .context("REPMAP_GEOCODER_BASE_URL must be set for serve")?;
            let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig::default())?);
            let geocoder = Arc::new(CivicApiGeocoder::new(fetcher, base_url));
            let state = AppState::new(store, geocoder, WebConfig::from_env())?;
            repmap_web::serve(state).await?;
        }
        Commands::Migrate => {
            let config = IngestConfig::from_env();
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
