use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use infbench::catalog::catalog_for;
use infbench::config::{Config, MetricsClientType};
use infbench::report::{compose_artifacts, ReportInput};
use infbench::runner::{build_datagen, build_runner, RunOutcome};
use infbench::scrape::{MetricsClient, PrometheusScraper};
use infbench::sink::Outcome;
use infbench::storage::{LocalStorage, StorageClient};
use infbench::tokenizer::{BpeTokenizer, Tokenizer};

/// Raw-export range query step, seconds.
const RAW_EXPORT_STEP: u64 = 5;

const EXIT_CONFIG_INVALID: u8 = 1;
const EXIT_ABORTED: u8 = 2;
const EXIT_ALL_FAILED: u8 = 3;

#[derive(Parser)]
#[command(name = "infbench")]
#[command(about = "Load benchmarking harness for OpenAI-compatible LLM inference servers", long_about = None)]
struct Cli {
    /// Path to the benchmark config file (YAML)
    #[arg(short, long, env = "INFBENCH_CONFIG")]
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "infbench=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = shellexpand::tilde(&cli.config).to_string();
    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };
    tracing::info!("loaded config from {}", config_path);

    match run(config).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "run failed");
            ExitCode::from(EXIT_ABORTED)
        }
    }
}

async fn run(config: Config) -> Result<ExitCode> {
    let tokenizer: Arc<dyn Tokenizer> =
        Arc::new(BpeTokenizer::new().context("failed to initialize tokenizer")?);
    let datagen = build_datagen(&config, &tokenizer)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping run");
                cancel.cancel();
            }
        });
    }

    tracing::info!(
        stages = config.load.stages.len(),
        workers = config.load.num_workers,
        server = %config.server.base_url,
        "starting benchmark run"
    );
    let runner = build_runner(&config, datagen, tokenizer, cancel.clone())?;
    let outcome = runner.run().await?;

    let scraper: Option<Box<dyn MetricsClient>> =
        match (&config.metrics.metrics_type, &config.metrics.prometheus) {
            (MetricsClientType::Prometheus, Some(prom)) => {
                let catalog = catalog_for(
                    config.server.server_type,
                    &config.server.model_name,
                    &prom.filters,
                );
                Some(Box::new(PrometheusScraper::new(prom, catalog)?))
            }
            _ => None,
        };

    let mut prometheus_by_stage = BTreeMap::new();
    let mut prometheus_summary = None;
    let mut raw_by_stage = BTreeMap::new();
    if let Some(scraper) = &scraper {
        scraper.wait_for_scrape().await;
        for stage in &outcome.stage_infos {
            prometheus_by_stage.insert(stage.stage_id, scraper.collect_stage(stage).await);
            if config.report.raw_export {
                if let Some(raw) = scraper
                    .collect_raw(Some((stage.start_unix, stage.end_unix, RAW_EXPORT_STEP)))
                    .await
                {
                    raw_by_stage.insert(stage.stage_id, raw);
                }
            }
        }
        if let (Some(first), Some(last)) =
            (outcome.stage_infos.first(), outcome.stage_infos.last())
        {
            prometheus_summary =
                Some(scraper.collect_summary(first.start_unix, last.end_unix).await);
        }
    }

    let records_by_stage = outcome.sink.drain_by_stage();
    let total: usize = records_by_stage.values().map(|v| v.len()).sum();
    let successes: usize = records_by_stage
        .values()
        .flatten()
        .filter(|r| r.outcome == Outcome::Success)
        .count();

    let input = ReportInput {
        records_by_stage,
        stages: outcome.stage_infos,
        prometheus_by_stage,
        prometheus_summary,
        raw_by_stage,
        per_request: config.report.per_request,
    };
    let artifacts = compose_artifacts(&input)?;

    let storage_config = config.storage.local.clone().unwrap_or_default();
    let local = LocalStorage::create(&storage_config.path, &config.report.name)?;
    let report_dir = local.dir().to_path_buf();
    let storage: Box<dyn StorageClient> = Box::new(local);
    let saved = storage.save_all(&artifacts).await;
    tracing::info!(
        dir = %report_dir.display(),
        saved,
        of = artifacts.len(),
        "report artifacts written"
    );

    summarize_to_console(&input);

    if outcome.canceled {
        return Ok(ExitCode::from(EXIT_ABORTED));
    }
    if total > 0 && successes == 0 {
        tracing::error!("every request failed");
        return Ok(ExitCode::from(EXIT_ALL_FAILED));
    }
    Ok(ExitCode::SUCCESS)
}

fn summarize_to_console(input: &ReportInput) {
    for stage in &input.stages {
        let records = input
            .records_by_stage
            .get(&stage.stage_id)
            .map(|v| v.as_slice())
            .unwrap_or_default();
        let successes = records
            .iter()
            .filter(|r| r.outcome == Outcome::Success)
            .count();
        let duration =
            std::time::Duration::from_secs_f64(stage.end_time - stage.start_time);
        tracing::info!(
            stage = stage.stage_id,
            requests = records.len(),
            successes,
            failures = records.len() - successes,
            duration = %humantime::format_duration(std::time::Duration::from_secs(duration.as_secs())),
            "stage summary"
        );
    }
}
