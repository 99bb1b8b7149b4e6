//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use infbench::config::{
    ApiConfig, ApiType, Config, DataConfig, LoadConfig, LoadType, MetricsConfig, ReportConfig,
    ServerConfig, StageConfig, StorageConfig,
};
use infbench::runner::{build_datagen, build_runner, RunOutcome};
use infbench::sink::LifecycleRecord;
use infbench::tokenizer::Tokenizer;

/// Cheap whitespace tokenizer so tests skip the BPE vocabulary load. The
/// mock server reports usage, so counts only feed fallback paths.
pub struct WsTokenizer;

impl Tokenizer for WsTokenizer {
    fn count_tokens(&self, text: &str) -> u32 {
        text.split_whitespace().count() as u32
    }

    fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .map(|i| format!("w{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn vocab_size(&self) -> usize {
        10_000
    }
}

pub fn rate_stage(rate: f64, duration: f64) -> StageConfig {
    StageConfig {
        rate: Some(rate),
        duration: Some(duration),
        concurrency: None,
        num_requests: None,
        traffic_split: None,
    }
}

pub fn concurrency_stage(concurrency: u32, num_requests: u64) -> StageConfig {
    StageConfig {
        rate: None,
        duration: None,
        concurrency: Some(concurrency),
        num_requests: Some(num_requests),
        traffic_split: None,
    }
}

pub fn base_config(base_url: &str, stages: Vec<StageConfig>) -> Config {
    Config {
        api: ApiConfig {
            api_type: ApiType::Completion,
            streaming: false,
            ignore_eos: true,
        },
        load: LoadConfig {
            load_type: LoadType::Constant,
            interval: 0.1,
            stage_drain_timeout: 5.0,
            num_workers: 1,
            worker_max_concurrency: 64,
            seed: Some(42),
            trace_file: None,
            stages,
        },
        data: DataConfig {
            output_tokens: 8,
            ..DataConfig::default()
        },
        server: ServerConfig::for_tests(base_url),
        metrics: MetricsConfig::default(),
        report: ReportConfig::default(),
        storage: StorageConfig::default(),
    }
}

/// Build and run the harness against `config`, returning the drained-able
/// outcome. The config must already be valid.
pub async fn run_bench(config: &Config, cancel: CancellationToken) -> RunOutcome {
    config.validate().expect("test config must be valid");
    let tokenizer: Arc<dyn Tokenizer> = Arc::new(WsTokenizer);
    let datagen = build_datagen(config, &tokenizer).expect("datagen");
    let runner = build_runner(config, datagen, tokenizer, cancel).expect("runner");
    runner.run().await.expect("run")
}

/// Every record must satisfy the lifecycle time ordering.
pub fn assert_time_invariants(records: &[LifecycleRecord]) {
    for r in records {
        assert!(
            r.scheduled_time <= r.dispatch_time + 1e-9,
            "scheduled {} > dispatch {}",
            r.scheduled_time,
            r.dispatch_time
        );
        assert!(
            r.dispatch_time <= r.completion_time + 1e-9,
            "dispatch {} > completion {}",
            r.dispatch_time,
            r.completion_time
        );
        if let (Some(ft), Some(lt)) = (r.first_token_time, r.last_token_time) {
            assert!(r.dispatch_time <= ft + 1e-9);
            assert!(ft <= lt + 1e-9);
            assert!(lt <= r.completion_time + 1e-9);
        }
    }
}

/// Peak number of records simultaneously between dispatch and completion.
pub fn max_parallelism(records: &[LifecycleRecord]) -> usize {
    let mut events: Vec<(f64, i32)> = Vec::with_capacity(records.len() * 2);
    for r in records {
        events.push((r.dispatch_time, 1));
        events.push((r.completion_time, -1));
    }
    events.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap().then(a.1.cmp(&b.1)));
    let mut current = 0i32;
    let mut peak = 0i32;
    for (_, delta) in events {
        current += delta;
        peak = peak.max(current);
    }
    peak as usize
}
