use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;

/// Terminal classification of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    ClientError,
    ServerError,
    Timeout,
    ConnectionError,
    Canceled,
    /// Open-loop dispatch found no worker with free capacity. Counted as a
    /// failure for rate fidelity, excluded from latency statistics.
    DispatchDropped,
}

impl Outcome {
    pub fn tag(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::ClientError => "client_error",
            Outcome::ServerError => "server_error",
            Outcome::Timeout => "timeout",
            Outcome::ConnectionError => "connection_error",
            Outcome::Canceled => "canceled",
            Outcome::DispatchDropped => "dispatch_dropped",
        }
    }
}

/// One immutable row summarizing the timing and outcome of one request.
///
/// All timestamps are run-relative seconds from [`RunClock`](crate::clock::RunClock).
/// Field order follows the request timeline:
/// `scheduled_time <= dispatch_time <= first_byte_time <= first_token_time
/// <= last_token_time <= completion_time`, with optional fields absent for
/// non-streamed or failed requests.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleRecord {
    pub stage_id: u32,
    pub model_name: String,
    pub scheduled_time: f64,
    pub dispatch_time: f64,
    pub first_byte_time: Option<f64>,
    pub first_token_time: Option<f64>,
    pub last_token_time: Option<f64>,
    pub completion_time: f64,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub outcome: Outcome,
    pub error_detail: Option<String>,
    pub ttft_slo_sec: Option<f64>,
    pub tpot_slo_sec: Option<f64>,
}

impl LifecycleRecord {
    /// Synthesize the record for an open-loop dispatch that found no free
    /// worker. Times collapse onto the scheduled instant.
    pub fn dropped(stage_id: u32, model_name: String, scheduled_time: f64) -> Self {
        Self {
            stage_id,
            model_name,
            scheduled_time,
            dispatch_time: scheduled_time,
            first_byte_time: None,
            first_token_time: None,
            last_token_time: None,
            completion_time: scheduled_time,
            input_tokens: None,
            output_tokens: None,
            outcome: Outcome::DispatchDropped,
            error_detail: None,
            ttft_slo_sec: None,
            tpot_slo_sec: None,
        }
    }

    pub fn request_latency(&self) -> f64 {
        self.completion_time - self.dispatch_time
    }

    pub fn ttft(&self) -> Option<f64> {
        self.first_token_time.map(|t| t - self.dispatch_time)
    }

    /// Mean inter-token gap: `(last - first) / (n - 1)` over streamed tokens.
    pub fn inter_token_latency(&self) -> Option<f64> {
        let first = self.first_token_time?;
        let last = self.last_token_time?;
        let n = self.output_tokens?;
        if n > 1 {
            Some((last - first) / (n - 1) as f64)
        } else {
            None
        }
    }

    /// Request latency amortized over every generated token.
    pub fn normalized_time_per_output_token(&self) -> Option<f64> {
        let n = self.output_tokens?;
        if n > 0 {
            Some(self.request_latency() / n as f64)
        } else {
            None
        }
    }
}

/// Append-only buffer of lifecycle records shared by all workers.
///
/// `record` is a short critical section on a plain mutex; reads happen only
/// after every worker has quiesced, so there is no reader contention to
/// design around.
#[derive(Default)]
pub struct MetricSink {
    records: Mutex<Vec<LifecycleRecord>>,
}

impl MetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: LifecycleRecord) {
        self.records.lock().push(record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every record out of the sink, partitioned by stage. Each record
    /// is returned exactly once; a second drain yields an empty map.
    pub fn drain_by_stage(&self) -> BTreeMap<u32, Vec<LifecycleRecord>> {
        let records = std::mem::take(&mut *self.records.lock());
        let mut by_stage: BTreeMap<u32, Vec<LifecycleRecord>> = BTreeMap::new();
        for r in records {
            by_stage.entry(r.stage_id).or_default().push(r);
        }
        by_stage
    }
}
