use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Tolerance for traffic-split weights summing to 1.
const WEIGHT_SUM_EPSILON: f64 = 1e-3;

/// API flavor spoken to the target server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiType {
    Completion,
    Chat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(rename = "type")]
    pub api_type: ApiType,

    /// Stream responses via SSE and record per-token timings.
    #[serde(default = "default_true")]
    pub streaming: bool,

    /// Ask the server to generate exactly `max_tokens` tokens.
    #[serde(default = "default_true")]
    pub ignore_eos: bool,
}

/// Schedule generator family for rate-driven stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadType {
    #[default]
    Constant,
    Poisson,
    Trace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrafficSplitEntry {
    pub model: String,
    pub weight: f64,
}

/// One stage as written in YAML. Exactly one of `rate` / `concurrency` must
/// be set; `kind()` resolves the stage flavor after validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    #[serde(default)]
    pub rate: Option<f64>,

    #[serde(default)]
    pub duration: Option<f64>,

    #[serde(default)]
    pub concurrency: Option<u32>,

    #[serde(default)]
    pub num_requests: Option<u64>,

    #[serde(default)]
    pub traffic_split: Option<Vec<TrafficSplitEntry>>,
}

/// Resolved stage flavor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageKind {
    /// Open loop: arrivals follow the schedule regardless of completions.
    Rate { rate: f64, duration: f64 },
    /// Closed loop: a fixed number of in-flight requests, bounded by a
    /// request count, a duration, or both (first bound wins).
    Concurrency {
        concurrency: u32,
        num_requests: Option<u64>,
        duration: Option<f64>,
    },
}

impl StageConfig {
    pub fn kind(&self) -> StageKind {
        match (self.rate, self.concurrency) {
            (Some(rate), None) => StageKind::Rate {
                rate,
                duration: self.duration.unwrap_or(0.0),
            },
            (None, Some(concurrency)) => StageKind::Concurrency {
                concurrency,
                num_requests: self.num_requests,
                duration: self.duration,
            },
            _ => unreachable!("validated: exactly one of rate/concurrency"),
        }
    }

    fn validate(&self, index: usize) -> Result<()> {
        match (self.rate, self.concurrency) {
            (Some(rate), None) => {
                if rate <= 0.0 {
                    bail!("stage {index}: rate must be > 0");
                }
                match self.duration {
                    Some(d) if d > 0.0 => {}
                    _ => bail!("stage {index}: rate stages need duration > 0"),
                }
                if self.num_requests.is_some() {
                    bail!("stage {index}: num_requests only applies to concurrency stages");
                }
            }
            (None, Some(concurrency)) => {
                if concurrency == 0 {
                    bail!("stage {index}: concurrency must be > 0");
                }
                let has_count = self.num_requests.map(|n| n > 0).unwrap_or(false);
                let has_duration = self.duration.map(|d| d > 0.0).unwrap_or(false);
                if !has_count && !has_duration {
                    bail!("stage {index}: concurrency stages need num_requests or duration");
                }
            }
            (Some(_), Some(_)) => {
                bail!("stage {index}: rate and concurrency are mutually exclusive")
            }
            (None, None) => bail!("stage {index}: one of rate or concurrency is required"),
        }

        if let Some(split) = &self.traffic_split {
            if split.is_empty() {
                bail!("stage {index}: traffic_split must not be empty");
            }
            let sum: f64 = split.iter().map(|e| e.weight).sum();
            if (sum - 1.0).abs() > WEIGHT_SUM_EPSILON {
                bail!("stage {index}: traffic_split weights sum to {sum}, expected 1.0");
            }
            if split.iter().any(|e| e.weight <= 0.0) {
                bail!("stage {index}: traffic_split weights must be > 0");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadConfig {
    #[serde(rename = "type", default)]
    pub load_type: LoadType,

    /// Pause between stages, seconds.
    #[serde(default = "default_interval")]
    pub interval: f64,

    /// How long to wait for in-flight requests after a stage stops issuing.
    #[serde(default = "default_drain_timeout")]
    pub stage_drain_timeout: f64,

    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Per-worker in-flight cap for open-loop stages.
    #[serde(default = "default_worker_max_concurrency")]
    pub worker_max_concurrency: u32,

    /// Seed for schedule noise and traffic-split sampling. Unset = entropy.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Timestamp trace, required when `type: trace`.
    #[serde(default)]
    pub trace_file: Option<PathBuf>,

    pub stages: Vec<StageConfig>,
}

/// Corpus adapter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    Mock,
    Synthetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DataConfig {
    #[serde(rename = "type")]
    pub data_type: DataType,

    /// Synthetic prompt length in tokens.
    pub input_tokens: u32,

    /// Tokens of each synthetic prompt shared within a group.
    pub shared_prefix_tokens: u32,

    /// `max_tokens` stamped on every descriptor.
    pub output_tokens: u32,

    pub num_groups: usize,
    pub prompts_per_group: usize,

    /// Turn groups into FIFO user sessions pinned to a worker.
    pub multi_turn: bool,

    /// Finite corpus bound; exhaustion ends the run cleanly.
    pub total_requests: Option<u64>,

    pub ttft_slo_sec: Option<f64>,
    pub tpot_slo_sec: Option<f64>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_type: DataType::Mock,
            input_tokens: 256,
            shared_prefix_tokens: 0,
            output_tokens: 128,
            num_groups: 8,
            prompts_per_group: 32,
            multi_turn: false,
            total_requests: None,
            ttft_slo_sec: None,
            tpot_slo_sec: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerType {
    #[default]
    Vllm,
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Target server family; selects the Prometheus metric catalog.
    #[serde(rename = "type", default)]
    pub server_type: ServerType,

    pub model_name: String,

    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-request deadline, seconds.
    #[serde(default = "default_request_timeout")]
    pub timeout: f64,

    /// PEM client certificate for mTLS.
    #[serde(default)]
    pub client_cert: Option<PathBuf>,

    /// PEM client key for mTLS.
    #[serde(default)]
    pub client_key: Option<PathBuf>,
}

impl ServerConfig {
    #[doc(hidden)]
    pub fn for_tests(base_url: &str) -> Self {
        Self {
            server_type: ServerType::Mock,
            model_name: "test-model".to_string(),
            base_url: base_url.to_string(),
            api_key: None,
            timeout: 30.0,
            client_cert: None,
            client_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetricsClientType {
    #[default]
    None,
    Prometheus,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(rename = "type", default)]
    pub metrics_type: MetricsClientType,

    #[serde(default)]
    pub prometheus: Option<PrometheusConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrometheusConfig {
    pub url: String,

    /// Target Prometheus scrape interval, seconds. The scraper waits one
    /// interval (plus a small buffer) after each stage before querying.
    #[serde(default = "default_scrape_interval")]
    pub scrape_interval: u64,

    /// Managed-service variant: sign queries with the ambient credential and
    /// skip the federate shortcut.
    #[serde(default)]
    pub google_managed: bool,

    /// Extra PromQL label filters, e.g. `namespace="inference"`.
    #[serde(default)]
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReportConfig {
    /// Run name; the report directory is `<name>-<timestamp>`.
    pub name: String,

    /// Also dump every lifecycle record as one artifact.
    pub per_request: bool,

    /// Save raw Prometheus exposition dumps per stage.
    pub raw_export: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            name: "run".to_string(),
            per_request: false,
            raw_export: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default)]
    pub local: Option<LocalStorageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalStorageConfig {
    #[serde(default = "default_report_path")]
    pub path: PathBuf,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            path: default_report_path(),
        }
    }
}

/// Top-level configuration, one YAML document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub api: ApiConfig,
    pub load: LoadConfig,
    #[serde(default)]
    pub data: DataConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {path}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.load.stages.is_empty() {
            bail!("load.stages must contain at least one stage");
        }
        for (i, stage) in self.load.stages.iter().enumerate() {
            stage.validate(i)?;
        }
        if self.load.num_workers == 0 {
            bail!("load.num_workers must be >= 1");
        }
        if self.load.worker_max_concurrency == 0 {
            bail!("load.worker_max_concurrency must be >= 1");
        }
        if self.load.interval < 0.0 || self.load.stage_drain_timeout < 0.0 {
            bail!("load.interval and load.stage_drain_timeout must be >= 0");
        }
        if self.load.load_type == LoadType::Trace && self.load.trace_file.is_none() {
            bail!("load.trace_file is required when load.type is trace");
        }
        if self.server.base_url.is_empty() {
            bail!("server.base_url must not be empty");
        }
        if self.server.client_cert.is_some() != self.server.client_key.is_some() {
            bail!("server.client_cert and server.client_key must be set together");
        }
        if self.metrics.metrics_type == MetricsClientType::Prometheus
            && self.metrics.prometheus.is_none()
        {
            bail!("metrics.prometheus is required when metrics.type is prometheus");
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_interval() -> f64 {
    1.0
}

fn default_drain_timeout() -> f64 {
    30.0
}

fn default_num_workers() -> usize {
    1
}

fn default_worker_max_concurrency() -> u32 {
    64
}

fn default_request_timeout() -> f64 {
    300.0
}

fn default_scrape_interval() -> u64 {
    15
}

fn default_report_path() -> PathBuf {
    PathBuf::from("./reports")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
api:
  type: completion
load:
  stages:
    - rate: 10
      duration: 30
server:
  model_name: llama
  base_url: http://localhost:8000
"#;

    fn parse(yaml: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert!(config.api.streaming);
        assert!(config.api.ignore_eos);
        assert_eq!(config.load.num_workers, 1);
        assert_eq!(config.load.load_type, LoadType::Constant);
        assert!((config.load.interval - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.server.timeout, 300.0);
        assert_eq!(config.report.name, "run");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = MINIMAL.replace("base_url:", "extra_field: 1\n  base_url:");
        assert!(parse(&yaml).is_err());
    }

    #[test]
    fn zero_rate_stage_is_rejected() {
        let yaml = MINIMAL.replace("rate: 10", "rate: 0");
        let err = parse(&yaml).unwrap_err().to_string();
        assert!(err.contains("rate must be > 0"), "{err}");
    }

    #[test]
    fn rate_and_concurrency_are_mutually_exclusive() {
        let yaml = MINIMAL.replace("rate: 10", "rate: 10\n      concurrency: 4");
        assert!(parse(&yaml).is_err());
    }

    #[test]
    fn concurrency_stage_needs_a_bound() {
        let yaml = r#"
api:
  type: chat
load:
  stages:
    - concurrency: 4
server:
  model_name: llama
  base_url: http://localhost:8000
"#;
        let err = parse(yaml).unwrap_err().to_string();
        assert!(err.contains("num_requests or duration"), "{err}");
    }

    #[test]
    fn concurrency_stage_with_count_resolves_kind() {
        let yaml = r#"
api:
  type: chat
load:
  stages:
    - concurrency: 4
      num_requests: 100
server:
  model_name: llama
  base_url: http://localhost:8000
"#;
        let config = parse(yaml).unwrap();
        match config.load.stages[0].kind() {
            StageKind::Concurrency {
                concurrency,
                num_requests,
                ..
            } => {
                assert_eq!(concurrency, 4);
                assert_eq!(num_requests, Some(100));
            }
            _ => panic!("expected concurrency stage"),
        }
    }

    #[test]
    fn traffic_split_weights_must_sum_to_one() {
        let yaml = r#"
api:
  type: completion
load:
  stages:
    - rate: 10
      duration: 5
      traffic_split:
        - model: a
          weight: 0.7
        - model: b
          weight: 0.2
server:
  model_name: llama
  base_url: http://localhost:8000
"#;
        let err = parse(yaml).unwrap_err().to_string();
        assert!(err.contains("weights sum"), "{err}");
    }

    #[test]
    fn trace_load_requires_trace_file() {
        let yaml = MINIMAL.replace("load:", "load:\n  type: trace");
        let err = parse(&yaml).unwrap_err().to_string();
        assert!(err.contains("trace_file"), "{err}");
    }

    #[test]
    fn mtls_requires_both_halves() {
        let yaml = MINIMAL.replace("server:", "server:\n  client_cert: /tmp/cert.pem");
        assert!(parse(&yaml).is_err());
    }

    #[test]
    fn prometheus_metrics_require_prometheus_section() {
        let yaml = format!("{MINIMAL}metrics:\n  type: prometheus\n");
        let err = parse(&yaml).unwrap_err().to_string();
        assert!(err.contains("metrics.prometheus"), "{err}");
    }
}
