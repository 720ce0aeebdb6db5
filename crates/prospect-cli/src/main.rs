use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use prospect_sync::{enrich_contacts, EnrichmentPipeline, PipelineConfig, DEFAULT_MATCH_THRESHOLD};
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "prospect")]
#[command(about = "Resumable, rate-limited LinkedIn enrichment pipeline")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct StageArgs {
    /// People CSV with a column ending in `LinkedinURL`.
    input: PathBuf,
    #[arg(long)]
    calls_per_window: Option<u32>,
    #[arg(long)]
    window_secs: Option<u64>,
    #[arg(long)]
    base_url: Option<String>,
}

impl StageArgs {
    fn config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::from_env();
        if let Some(calls) = self.calls_per_window {
            config.calls_per_window = calls;
        }
        if let Some(secs) = self.window_secs {
            config.window_secs = secs;
        }
        if let Some(url) = &self.base_url {
            config.base_url = url.clone();
        }
        config
    }

    fn pipeline(&self) -> Result<EnrichmentPipeline> {
        EnrichmentPipeline::from_config(&self.input, &self.config())
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Every stage in order.
    Run(StageArgs),
    /// Fetch people into the interim tier.
    People(StageArgs),
    FinalizePeople(StageArgs),
    ExtractCompanies(StageArgs),
    /// Fetch companies from the extracted company list.
    Companies(StageArgs),
    FinalizeCompanies(StageArgs),
    /// Copy emails and phone numbers onto a processed people file by name match.
    Contacts {
        base: PathBuf,
        contacts: PathBuf,
        #[arg(long, default_value_t = DEFAULT_MATCH_THRESHOLD)]
        threshold: f64,
    },
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn execute(command: Commands) -> Result<()> {
    match command {
        Commands::Run(args) => {
            let summary = args.pipeline()?.run_once().await?;
            println!(
                "run complete: run_id={} people={}/{} companies={}/{} reports={}",
                summary.run_id,
                summary.people.resolved,
                summary.people.total(),
                summary.companies.resolved,
                summary.companies.total(),
                summary.reports_dir
            );
        }
        Commands::People(args) => {
            let counts = args.pipeline()?.fetch_people().await?;
            println!("people: resolved={} unresolved={}", counts.resolved, counts.unresolved);
        }
        Commands::FinalizePeople(args) => {
            let counts = EnrichmentPipeline::offline(&args.input).finalize_people().await?;
            println!("people finalized: appended={} skipped={}", counts.appended, counts.skipped);
        }
        Commands::ExtractCompanies(args) => {
            let companies = EnrichmentPipeline::offline(&args.input).extract_company_list().await?;
            println!("companies listed: {companies}");
        }
        Commands::Companies(args) => {
            let counts = args.pipeline()?.fetch_companies().await?;
            println!("companies: resolved={} unresolved={}", counts.resolved, counts.unresolved);
        }
        Commands::FinalizeCompanies(args) => {
            let counts = EnrichmentPipeline::offline(&args.input).finalize_companies().await?;
            println!("companies finalized: appended={} skipped={}", counts.appended, counts.skipped);
        }
        Commands::Contacts {
            base,
            contacts,
            threshold,
        } => {
            let report = enrich_contacts(&base, &contacts, threshold).await?;
            println!(
                "contacts: enriched={}/{} output={}",
                report.enriched,
                report.rows,
                report.output.display()
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let result = execute(cli.command).await;
    if let Err(err) = &result {
        error!("{err:#}");
    }
    result
}
