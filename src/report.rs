use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::scheduler::StageRuntimeInfo;
use crate::scrape::ScrapeResult;
use crate::sink::{LifecycleRecord, Outcome};

/// Distribution summary emitted for every latency / token-count field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub mean: f64,
    pub min: f64,
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
    pub max: f64,
}

/// Summarize with linear-interpolation percentiles. `None` for empty input.
pub fn summarize(values: &[f64]) -> Option<Summary> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
    Some(Summary {
        mean,
        min: sorted[0],
        p10: percentile(&sorted, 10.0),
        p50: percentile(&sorted, 50.0),
        p90: percentile(&sorted, 90.0),
        max: sorted[sorted.len() - 1],
    })
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = q / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = rank - lo as f64;
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    /// Every record of the stage, failures and drops included.
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_rate: Option<f64>,
    pub stage_duration: f64,
    /// Actually dispatched requests per second (drops excluded).
    pub send_rate: f64,
    /// How far dispatches lagged their scheduled instants.
    pub schedule_delay: Option<Summary>,
    pub dropped_dispatches: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Throughput {
    pub requests_per_sec: f64,
    pub input_tokens_per_sec: f64,
    pub output_tokens_per_sec: f64,
    pub total_tokens_per_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuccessSummary {
    pub count: usize,
    pub request_latency: Option<Summary>,
    pub time_to_first_token: Option<Summary>,
    pub inter_token_latency: Option<Summary>,
    pub normalized_time_per_output_token: Option<Summary>,
    pub input_tokens: Option<Summary>,
    pub output_tokens: Option<Summary>,
    pub throughput: Throughput,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureSummary {
    pub count: usize,
    pub by_kind: BTreeMap<String, u64>,
    /// Latency of failed requests; dropped dispatches never ran and are
    /// excluded.
    pub request_latency: Option<Summary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SloAttainment {
    pub slo_sec: f64,
    pub requests_met: u64,
    pub requests_failed: u64,
    pub attainment_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SloReport {
    pub ttft: Option<SloAttainment>,
    pub tpot: Option<SloAttainment>,
    /// Tokens per second from successes that met every SLO they carry.
    pub goodput_tokens_per_sec: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<u32>,
    pub load_summary: LoadSummary,
    pub successes: Option<SuccessSummary>,
    pub failures: FailureSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slos: Option<SloReport>,
}

/// One file to be handed to storage. `name` carries the extension.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Everything the composer folds. The composition is a pure function of
/// this input: identical inputs produce byte-identical artifacts.
pub struct ReportInput {
    pub records_by_stage: BTreeMap<u32, Vec<LifecycleRecord>>,
    pub stages: Vec<StageRuntimeInfo>,
    pub prometheus_by_stage: BTreeMap<u32, ScrapeResult>,
    pub prometheus_summary: Option<ScrapeResult>,
    pub raw_by_stage: BTreeMap<u32, String>,
    pub per_request: bool,
}

pub fn compose_artifacts(input: &ReportInput) -> Result<Vec<Artifact>> {
    let mut artifacts = Vec::new();

    for stage in &input.stages {
        let empty = Vec::new();
        let records = input
            .records_by_stage
            .get(&stage.stage_id)
            .unwrap_or(&empty);
        let report = lifecycle_report(
            Some(stage.stage_id),
            records,
            stage.end_time - stage.start_time,
            stage.requested_rate,
        );
        artifacts.push(json_artifact(
            format!("stage_{}_lifecycle_metrics.json", stage.stage_id),
            &report,
        )?);

        if let Some(scrape) = input.prometheus_by_stage.get(&stage.stage_id) {
            artifacts.push(json_artifact(
                format!("stage_{}_prometheus_metrics.json", stage.stage_id),
                scrape,
            )?);
        }
        if let Some(raw) = input.raw_by_stage.get(&stage.stage_id) {
            artifacts.push(Artifact {
                name: format!("stage_{}_raw_metrics.txt", stage.stage_id),
                bytes: raw.clone().into_bytes(),
            });
        }
    }

    let all_records: Vec<LifecycleRecord> = input
        .records_by_stage
        .values()
        .flat_map(|v| v.iter().cloned())
        .collect();
    let run_duration = match (input.stages.first(), input.stages.last()) {
        (Some(first), Some(last)) => last.end_time - first.start_time,
        _ => 0.0,
    };
    let summary = lifecycle_report(None, &all_records, run_duration, None);
    artifacts.push(json_artifact(
        "summary_lifecycle_metrics.json".to_string(),
        &summary,
    )?);

    if let Some(scrape) = &input.prometheus_summary {
        artifacts.push(json_artifact(
            "summary_prometheus_metrics.json".to_string(),
            scrape,
        )?);
    }

    if input.per_request {
        artifacts.push(json_artifact(
            "per_request_lifecycle_metrics.json".to_string(),
            &all_records,
        )?);
    }

    Ok(artifacts)
}

fn json_artifact<T: Serialize>(name: String, value: &T) -> Result<Artifact> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize {name}"))?;
    Ok(Artifact { name, bytes })
}

/// TPOT for SLO purposes: inter-token latency when streamed, otherwise the
/// normalized per-token latency.
fn tpot(record: &LifecycleRecord) -> Option<f64> {
    record
        .inter_token_latency()
        .or_else(|| record.normalized_time_per_output_token())
}

fn lifecycle_report(
    stage_id: Option<u32>,
    records: &[LifecycleRecord],
    duration: f64,
    requested_rate: Option<f64>,
) -> LifecycleReport {
    let successes: Vec<&LifecycleRecord> = records
        .iter()
        .filter(|r| r.outcome == Outcome::Success)
        .collect();
    let failures: Vec<&LifecycleRecord> = records
        .iter()
        .filter(|r| r.outcome != Outcome::Success)
        .collect();
    let dropped = failures
        .iter()
        .filter(|r| r.outcome == Outcome::DispatchDropped)
        .count();

    let dispatched = records.len() - dropped;
    let schedule_delay: Vec<f64> = records
        .iter()
        .filter(|r| r.outcome != Outcome::DispatchDropped)
        .map(|r| r.dispatch_time - r.scheduled_time)
        .collect();
    let load_summary = LoadSummary {
        count: records.len(),
        requested_rate,
        stage_duration: duration,
        send_rate: if duration > 0.0 {
            dispatched as f64 / duration
        } else {
            0.0
        },
        schedule_delay: summarize(&schedule_delay),
        dropped_dispatches: dropped,
    };

    let success_summary = if successes.is_empty() {
        None
    } else {
        let input_tokens: Vec<f64> = successes
            .iter()
            .filter_map(|r| r.input_tokens.map(|t| t as f64))
            .collect();
        let output_tokens: Vec<f64> = successes
            .iter()
            .filter_map(|r| r.output_tokens.map(|t| t as f64))
            .collect();
        let throughput = Throughput {
            requests_per_sec: if duration > 0.0 {
                successes.len() as f64 / duration
            } else {
                0.0
            },
            input_tokens_per_sec: per_second(input_tokens.iter().sum(), duration),
            output_tokens_per_sec: per_second(output_tokens.iter().sum(), duration),
            total_tokens_per_sec: per_second(
                input_tokens.iter().sum::<f64>() + output_tokens.iter().sum::<f64>(),
                duration,
            ),
        };
        Some(SuccessSummary {
            count: successes.len(),
            request_latency: summarize(
                &successes
                    .iter()
                    .map(|r| r.request_latency())
                    .collect::<Vec<_>>(),
            ),
            time_to_first_token: summarize(
                &successes.iter().filter_map(|r| r.ttft()).collect::<Vec<_>>(),
            ),
            inter_token_latency: summarize(
                &successes
                    .iter()
                    .filter_map(|r| r.inter_token_latency())
                    .collect::<Vec<_>>(),
            ),
            normalized_time_per_output_token: summarize(
                &successes
                    .iter()
                    .filter_map(|r| r.normalized_time_per_output_token())
                    .collect::<Vec<_>>(),
            ),
            input_tokens: summarize(&input_tokens),
            output_tokens: summarize(&output_tokens),
            throughput,
        })
    };

    let mut by_kind: BTreeMap<String, u64> = BTreeMap::new();
    for f in &failures {
        *by_kind.entry(f.outcome.tag().to_string()).or_default() += 1;
    }
    let failure_latency: Vec<f64> = failures
        .iter()
        .filter(|r| r.outcome != Outcome::DispatchDropped)
        .map(|r| r.request_latency())
        .collect();
    let failure_summary = FailureSummary {
        count: failures.len(),
        by_kind,
        request_latency: summarize(&failure_latency),
    };

    LifecycleReport {
        stage_id,
        load_summary,
        successes: success_summary,
        failures: failure_summary,
        slos: slo_report(&successes, duration),
    }
}

fn per_second(total: f64, duration: f64) -> f64 {
    if duration > 0.0 {
        total / duration
    } else {
        0.0
    }
}

fn slo_report(successes: &[&LifecycleRecord], duration: f64) -> Option<SloReport> {
    if !successes
        .iter()
        .any(|r| r.ttft_slo_sec.is_some() || r.tpot_slo_sec.is_some())
    {
        return None;
    }

    let ttft = attainment(successes, |r| r.ttft_slo_sec, |r| r.ttft());
    let tpot_report = attainment(successes, |r| r.tpot_slo_sec, tpot);

    let mut goodput_tokens = 0.0f64;
    let mut any_slo = false;
    for r in successes {
        let ttft_ok = match r.ttft_slo_sec {
            Some(slo) => r.ttft().map(|v| v <= slo).unwrap_or(false),
            None => true,
        };
        let tpot_ok = match r.tpot_slo_sec {
            Some(slo) => tpot(r).map(|v| v <= slo).unwrap_or(false),
            None => true,
        };
        if r.ttft_slo_sec.is_some() || r.tpot_slo_sec.is_some() {
            any_slo = true;
            if ttft_ok && tpot_ok {
                goodput_tokens += r.input_tokens.unwrap_or(0) as f64
                    + r.output_tokens.unwrap_or(0) as f64;
            }
        }
    }
    let goodput = if any_slo && duration > 0.0 {
        Some(goodput_tokens / duration)
    } else {
        None
    };

    Some(SloReport {
        ttft,
        tpot: tpot_report,
        goodput_tokens_per_sec: goodput,
    })
}

fn attainment(
    successes: &[&LifecycleRecord],
    slo_of: impl Fn(&LifecycleRecord) -> Option<f64>,
    value_of: impl Fn(&LifecycleRecord) -> Option<f64>,
) -> Option<SloAttainment> {
    let mut met = 0u64;
    let mut failed = 0u64;
    let mut slo_sec = None;
    for r in successes {
        let Some(slo) = slo_of(r) else { continue };
        slo_sec.get_or_insert(slo);
        // A success without the measured value (e.g. non-streamed TTFT) is
        // unmeasurable and excluded from attainment.
        let Some(v) = value_of(r) else { continue };
        if v <= slo {
            met += 1;
        } else {
            failed += 1;
        }
    }
    let slo_sec = slo_sec?;
    let total = met + failed;
    Some(SloAttainment {
        slo_sec,
        requests_met: met,
        requests_failed: failed,
        attainment_pct: if total > 0 {
            met as f64 / total as f64 * 100.0
        } else {
            100.0
        },
    })
}
