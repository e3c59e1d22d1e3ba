mod registry;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use registry::{init_providers, Registry};
use std::process::ExitCode;
use stream_backup_core::config::Config;
use stream_backup_core::plan::Plan;
use stream_backup_core::report::{ReportStore, RunRecord, RunStatus, RunSummary};
use stream_backup_service::{CloudManagerClient, Orchestrator, PollOptions};
use stream_backup_storage::Provider;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const LOG_CRATES: [&str; 4] = [
    "stream_backup",
    "stream_backup_core",
    "stream_backup_service",
    "stream_backup_storage",
];

#[derive(Parser)]
#[command(
    name = "stream-backup",
    version,
    about = "Streams the latest cloud-managed database snapshot into object storage"
)]
struct Cli {
    #[arg(long, default_value = "/etc/stream-backup/config.toml")]
    config: String,
    /// Log at debug level regardless of RUST_LOG.
    #[arg(long, short)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Back up every deployment (or one) to each of its providers.
    Run {
        #[arg(long)]
        deployment: Option<String>,
        /// Append one row per (deployment, provider) to this TSV file.
        #[arg(long)]
        report: Option<String>,
    },
    /// Validate the configuration and print the plan.
    Check,
    /// Restore the latest snapshot of a deployment and print its download URL.
    Resolve { deployment: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("stream-backup failed: {err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let default_directives = LOG_CRATES
        .iter()
        .map(|krate| format!("{krate}={level}"))
        .collect::<Vec<_>>()
        .join(",");
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) if !verbose => filter,
        _ => EnvFilter::new(default_directives),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let cfg = load_config(&cli.config)?;
    match cli.command {
        Command::Run { deployment, report } => run(&cfg, deployment.as_deref(), report.as_deref()).await,
        Command::Check => check(&cfg),
        Command::Resolve { deployment } => resolve(&cfg, &deployment).await,
    }
}

fn load_config(path: &str) -> Result<Config> {
    Config::load(path).with_context(|| format!("config required at {path}"))
}

fn build_plan(cfg: &Config, deployment: Option<&str>) -> Result<Plan> {
    let plan = Plan::from_config(cfg).context("invalid backup plan")?;
    match deployment {
        Some(name) => Ok(plan.only(name)?),
        None => Ok(plan),
    }
}

async fn run(cfg: &Config, deployment: Option<&str>, report: Option<&str>) -> Result<ExitCode> {
    let plan = build_plan(cfg, deployment)?;
    let providers = init_providers(&plan, &cfg.upload)
        .await
        .context("failed to initialize provider instances")?;
    let registry = Registry::new(
        &plan,
        providers,
        |planned| CloudManagerClient::new(&planned.settings, &cfg.api),
        PollOptions::from(&cfg.api),
        &cfg.upload.content_type,
    )?;
    info!(pairs = registry.pairs(), "starting backup run");

    let summary = registry.run().await;
    print_summary(&summary);
    if let Some(path) = report {
        ReportStore::new(path)
            .append_records(&summary.records)
            .with_context(|| format!("failed to write report {path}"))?;
    }

    let status = summary.status();
    info!(
        pairs = summary.records.len(),
        failed = summary.failures().count(),
        ?status,
        "backup run finished"
    );
    Ok(match status {
        RunStatus::AllSucceeded => ExitCode::SUCCESS,
        RunStatus::Partial => ExitCode::from(2),
        RunStatus::AllFailed => ExitCode::from(1),
    })
}

fn print_summary(summary: &RunSummary) {
    for record in &summary.records {
        println!("{}", summary_line(record));
    }
}

fn summary_line(record: &RunRecord) -> String {
    if record.succeeded() {
        format!(
            "ok   {} -> {} {} bytes={} parts={} sha256={}",
            record.deployment, record.provider, record.object_key, record.bytes, record.parts, record.sha256
        )
    } else {
        format!(
            "FAIL {} -> {} [{}] {}",
            record.deployment, record.provider, record.error_kind, record.message
        )
    }
}

fn check(cfg: &Config) -> Result<ExitCode> {
    let plan = build_plan(cfg, None)?;
    for instance in &plan.providers {
        Provider::validate_instance(instance)?;
    }
    for deployment in &plan.deployments {
        for reference in &deployment.providers {
            println!("{} -> {}", deployment.name, reference);
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn resolve(cfg: &Config, deployment: &str) -> Result<ExitCode> {
    let plan = build_plan(cfg, Some(deployment))?;
    let planned = plan
        .deployments
        .first()
        .with_context(|| format!("deployment {deployment} is not in the plan"))?;
    let api = CloudManagerClient::new(&planned.settings, &cfg.api)?;
    let orchestrator = Orchestrator::new(
        planned.name.clone(),
        planned.settings.clone(),
        api,
        PollOptions::from(&cfg.api),
    )
    .with_content_type(cfg.upload.content_type.clone());
    let descriptor = orchestrator
        .resolve_delivery()
        .await
        .with_context(|| format!("failed to resolve delivery for {deployment}"))?;
    println!("{}\t{}", descriptor.download_url, descriptor.destination_key);
    Ok(ExitCode::SUCCESS)
}
