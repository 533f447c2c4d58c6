#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `sr_trends`: exports tidy tables of 311 service requests from a CKAN
//! catalog.
//!
//! ```text
//! sr_trends                              # export with defaults
//! sr_trends --config sr_trends.toml --years 2023,2024 export
//! sr_trends resources                    # show which resource serves each year
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use sr_trends_cli_utils::{IndicatifProgress, MultiProgress};
use sr_trends_export::config::PipelineConfig;
use sr_trends_export::{CancelFlag, ExportError, run_export};
use sr_trends_source::catalog::discover_year_resources;
use sr_trends_source::client::CkanClient;

#[derive(Parser)]
#[command(name = "sr_trends", about = "Export tidy 311 service-request tables")]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Comma-separated years to export (e.g., "2023,2024")
    #[arg(long, value_delimiter = ',')]
    years: Option<Vec<i32>>,

    /// Request types kept per year in the top-N table
    #[arg(long)]
    top_n: Option<usize>,

    /// Keep requests whose status is `Canceled`
    #[arg(long)]
    include_canceled: bool,

    /// Directory the CSV files are written to
    #[arg(long)]
    export_dir: Option<PathBuf>,

    /// Years retrieved at the same time
    #[arg(long)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve, aggregate and write the three export tables (default)
    Export,
    /// List the resource chosen for each wanted year
    Resources,
}

impl Cli {
    fn pipeline_config(&self) -> Result<PipelineConfig, ExportError> {
        let mut config = PipelineConfig::load(self.config.as_deref())?;

        if let Some(years) = &self.years {
            config.export.wanted_years = years.iter().copied().collect();
        }
        if let Some(top_n) = self.top_n {
            config.export.top_n = top_n;
        }
        if self.include_canceled {
            config.export.exclude_canceled = false;
        }
        if let Some(dir) = &self.export_dir {
            config.export.dir.clone_from(dir);
        }
        if let Some(concurrency) = self.concurrency {
            config.export.concurrency = concurrency;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let multi = sr_trends_cli_utils::init_logger();
    let cli = Cli::parse();

    match run(&cli, &multi).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, multi: &MultiProgress) -> Result<(), ExportError> {
    let config = cli.pipeline_config()?;

    match cli.command.as_ref().unwrap_or(&Commands::Export) {
        Commands::Export => export(&config, multi).await,
        Commands::Resources => list_resources(&config).await,
    }
}

async fn export(config: &PipelineConfig, multi: &MultiProgress) -> Result<(), ExportError> {
    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted, finishing in-flight years and writing nothing");
                cancel.cancel();
            }
        });
    }

    let progress = IndicatifProgress::years_bar(multi, "Exporting");
    let summary = run_export(config, &cancel, progress.as_ref()).await?;

    for path in summary.written() {
        println!("{}", path.display());
    }
    if summary.dropped > 0 {
        log::warn!(
            "{} source rows were unusable and left out of the export",
            summary.dropped
        );
    }

    Ok(())
}

async fn list_resources(config: &PipelineConfig) -> Result<(), ExportError> {
    let resolve = |source| ExportError::Resolve { source };
    let client = CkanClient::new(&config.catalog).map_err(resolve)?;
    let resources = discover_year_resources(&client, &config.export.wanted_years)
        .await
        .map_err(resolve)?;

    println!("{:<6} {:<38} {:<10} NAME", "YEAR", "ID", "DATASTORE");
    println!("{}", "-".repeat(80));
    for (year, resource) in &resources {
        println!(
            "{year:<6} {:<38} {:<10} {}",
            resource.id,
            resource.datastore_active,
            resource.name.as_deref().unwrap_or_default()
        );
    }

    Ok(())
}
