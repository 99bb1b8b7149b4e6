use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::RunClock;
use crate::config::{Config, DataType};
use crate::data::{
    load_trace_timestamps, DataGenerator, MockDataGenerator, SyntheticCorpusGenerator,
};
use crate::http::{build_client, endpoint_url};
use crate::lifecycle::EngineContext;
use crate::scheduler::{Scheduler, StageRuntimeInfo};
use crate::sink::MetricSink;
use crate::tokenizer::Tokenizer;
use crate::worker::{spawn_worker, PendingCounter, WorkerHandle, STAGE_NONE};

/// What a finished run hands to the report layer.
pub struct RunOutcome {
    pub stage_infos: Vec<StageRuntimeInfo>,
    pub sink: Arc<MetricSink>,
    pub clock: RunClock,
    pub canceled: bool,
}

/// Assembled workers plus scheduler, ready to run.
pub struct Runner {
    scheduler: Scheduler,
    worker_joins: Vec<JoinHandle<()>>,
    sink: Arc<MetricSink>,
    clock: RunClock,
    cancel: CancellationToken,
}

/// Build the corpus adapter the configuration asks for.
pub fn build_datagen(
    config: &Config,
    tokenizer: &Arc<dyn Tokenizer>,
) -> Result<Arc<dyn DataGenerator>> {
    Ok(match config.data.data_type {
        DataType::Mock => Arc::new(MockDataGenerator::new(config.api.api_type, &config.data)),
        DataType::Synthetic => Arc::new(SyntheticCorpusGenerator::new(
            config.api.api_type,
            &config.data,
            tokenizer.as_ref(),
            config.load.num_workers,
            config.load.seed,
        )?),
    })
}

/// Wire up clock, sink, workers, and scheduler from a validated config.
pub fn build_runner(
    config: &Config,
    datagen: Arc<dyn DataGenerator>,
    tokenizer: Arc<dyn Tokenizer>,
    cancel: CancellationToken,
) -> Result<Runner> {
    let clock = RunClock::start();
    let sink = Arc::new(MetricSink::new());
    let pending = PendingCounter::new();
    let current_stage = Arc::new(AtomicU32::new(STAGE_NONE));

    let endpoint = endpoint_url(&config.server.base_url, config.api.api_type);
    let timeout = Duration::from_secs_f64(config.server.timeout);

    let mut workers: Vec<WorkerHandle> = Vec::with_capacity(config.load.num_workers);
    let mut worker_joins = Vec::with_capacity(config.load.num_workers);
    for id in 0..config.load.num_workers {
        let ctx = EngineContext {
            clock,
            client: build_client(&config.server)
                .with_context(|| format!("failed to build HTTP client for worker {id}"))?,
            api: config.api.clone(),
            endpoint: endpoint.clone(),
            timeout,
            tokenizer: Arc::clone(&tokenizer),
        };
        let (handle, join) = spawn_worker(
            id,
            ctx,
            Arc::clone(&datagen),
            Arc::clone(&sink),
            Arc::clone(&pending),
            Arc::clone(&current_stage),
            config.load.worker_max_concurrency as usize,
        );
        workers.push(handle);
        worker_joins.push(join);
    }

    let trace = match &config.load.trace_file {
        Some(path) => Some(load_trace_timestamps(path)?),
        None => None,
    };

    let scheduler = Scheduler::new(
        clock,
        config.load.clone(),
        config.server.model_name.clone(),
        workers,
        datagen,
        sink.clone(),
        pending,
        current_stage,
        cancel.clone(),
        trace,
    );

    Ok(Runner {
        scheduler,
        worker_joins,
        sink,
        clock,
        cancel,
    })
}

impl Runner {
    /// Run all stages, then quiesce the workers. The sink is complete when
    /// this returns.
    pub async fn run(mut self) -> Result<RunOutcome> {
        let stage_infos = self.scheduler.run().await?;
        let canceled = self.cancel.is_cancelled();

        // Dropping the scheduler closes every worker channel; workers drain
        // their remaining tasks and exit.
        drop(self.scheduler);
        for join in self.worker_joins {
            if let Err(err) = join.await {
                tracing::error!(error = %err, "worker task panicked");
            }
        }

        Ok(RunOutcome {
            stage_infos,
            sink: self.sink,
            clock: self.clock,
            canceled,
        })
    }
}
