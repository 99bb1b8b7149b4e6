use std::collections::BTreeMap;

use crate::config::ServerType;
use crate::promql::{MetricKind, PromMetric, QueryOp};

/// Flat mapping from a well-known report key (e.g. `avg_time_to_first_token`)
/// to the server-side metric that answers it. A key a server does not expose
/// is simply absent; the report layer turns absent keys into `null` fields.
pub type MetricCatalog = BTreeMap<String, PromMetric>;

/// Small registration API for building a server's catalog.
pub struct CatalogBuilder {
    filters: Vec<String>,
    entries: MetricCatalog,
}

impl CatalogBuilder {
    pub fn new(filters: Vec<String>) -> Self {
        Self {
            filters,
            entries: BTreeMap::new(),
        }
    }

    pub fn entry(mut self, key: &str, name: &str, kind: MetricKind, op: QueryOp) -> Self {
        self.entries.insert(
            key.to_string(),
            PromMetric::new(name, kind, op, self.filters.clone()),
        );
        self
    }

    /// Register the standard mean/median/p90/p99 spread for one histogram.
    pub fn histogram_spread(mut self, stem: &str, name: &str) -> Self {
        for (prefix, op) in [
            ("avg", QueryOp::Mean),
            ("median", QueryOp::Median),
            ("p90", QueryOp::P90),
            ("p99", QueryOp::P99),
        ] {
            self = self.entry(&format!("{prefix}_{stem}"), name, MetricKind::Histogram, op);
        }
        self
    }

    /// Register the standard mean/median/p90/p99 spread for one gauge.
    pub fn gauge_spread(mut self, stem: &str, name: &str) -> Self {
        for (prefix, op) in [
            ("avg", QueryOp::Mean),
            ("median", QueryOp::Median),
            ("p90", QueryOp::P90),
            ("p99", QueryOp::P99),
        ] {
            self = self.entry(&format!("{prefix}_{stem}"), name, MetricKind::Gauge, op);
        }
        self
    }

    pub fn build(self) -> MetricCatalog {
        self.entries
    }
}

/// Catalog for the configured server family.
pub fn catalog_for(server: ServerType, model_name: &str, extra_filters: &[String]) -> MetricCatalog {
    let mut filters = vec![format!("model_name='{model_name}'")];
    filters.extend(extra_filters.iter().cloned());
    match server {
        ServerType::Vllm => vllm_catalog(filters),
        ServerType::Mock => mock_catalog(filters),
    }
}

/// vLLM v1 metric names.
fn vllm_catalog(filters: Vec<String>) -> MetricCatalog {
    CatalogBuilder::new(filters)
        .entry(
            "avg_queue_length",
            "vllm:num_requests_waiting",
            MetricKind::Gauge,
            QueryOp::Mean,
        )
        .entry(
            "avg_num_requests_running",
            "vllm:num_requests_running",
            MetricKind::Gauge,
            QueryOp::Mean,
        )
        .histogram_spread("time_to_first_token", "vllm:time_to_first_token_seconds")
        .histogram_spread(
            "time_per_output_token",
            "vllm:request_time_per_output_token_seconds",
        )
        .histogram_spread("inter_token_latency", "vllm:inter_token_latency_seconds")
        .histogram_spread("request_latency", "vllm:e2e_request_latency_seconds")
        .gauge_spread("kv_cache_usage", "vllm:kv_cache_usage_perc")
        .entry(
            "avg_prompt_tokens",
            "vllm:prompt_tokens",
            MetricKind::Counter,
            QueryOp::Mean,
        )
        .entry(
            "prompt_tokens_per_second",
            "vllm:prompt_tokens",
            MetricKind::Counter,
            QueryOp::Rate,
        )
        .entry(
            "avg_output_tokens",
            "vllm:generation_tokens",
            MetricKind::Counter,
            QueryOp::Mean,
        )
        .entry(
            "output_tokens_per_second",
            "vllm:generation_tokens",
            MetricKind::Counter,
            QueryOp::Rate,
        )
        .entry(
            "total_requests",
            "vllm:request_success",
            MetricKind::Counter,
            QueryOp::Increase,
        )
        .entry(
            "requests_per_second",
            "vllm:request_success",
            MetricKind::Counter,
            QueryOp::Rate,
        )
        .entry(
            "num_preemptions",
            "vllm:num_preemptions",
            MetricKind::Counter,
            QueryOp::Increase,
        )
        .build()
}

/// Metric names exposed by the bundled mock server (`infbench-mock`).
fn mock_catalog(filters: Vec<String>) -> MetricCatalog {
    CatalogBuilder::new(filters)
        .entry(
            "avg_num_requests_running",
            "infbench_mock_active_requests",
            MetricKind::Gauge,
            QueryOp::Mean,
        )
        .histogram_spread("time_to_first_token", "infbench_mock_ttft_seconds")
        .histogram_spread("request_latency", "infbench_mock_e2e_latency_seconds")
        .entry(
            "prompt_tokens_per_second",
            "infbench_mock_prompt_tokens_total",
            MetricKind::Counter,
            QueryOp::Rate,
        )
        .entry(
            "output_tokens_per_second",
            "infbench_mock_generation_tokens_total",
            MetricKind::Counter,
            QueryOp::Rate,
        )
        .entry(
            "total_requests",
            "infbench_mock_requests_total",
            MetricKind::Counter,
            QueryOp::Increase,
        )
        .entry(
            "requests_per_second",
            "infbench_mock_requests_total",
            MetricKind::Counter,
            QueryOp::Rate,
        )
        .build()
}
