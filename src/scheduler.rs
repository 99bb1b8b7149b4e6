use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::clock::{ConstantSchedule, PoissonSchedule, RunClock, Schedule, TraceSchedule};
use crate::config::{LoadConfig, LoadType, StageConfig, StageKind};
use crate::data::DataGenerator;
use crate::sink::{LifecycleRecord, MetricSink};
use crate::worker::{DispatchItem, PendingCounter, WorkerHandle, STAGE_NONE};

/// Slack added to the stage deadline so a constant schedule's final arrival
/// (mathematically exactly at the deadline) survives float rounding.
const DEADLINE_EPSILON: f64 = 1e-9;

/// How long to wait for canceled in-flight requests to write their records
/// after a drain timeout fires.
const CANCEL_SETTLE: Duration = Duration::from_secs(5);

/// Observed wall-clock envelope of one completed stage.
///
/// `start_time` precedes every dispatch of the stage and `end_time` follows
/// every completion (both run-relative); the unix pair feeds Prometheus
/// query evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct StageRuntimeInfo {
    pub stage_id: u32,
    pub requested_rate: Option<f64>,
    pub start_time: f64,
    pub end_time: f64,
    pub start_unix: f64,
    pub end_unix: f64,
}

/// Why a stage stopped issuing dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageStop {
    ScheduleDone,
    CountReached,
    DeadlineHit,
    CorpusExhausted,
    Canceled,
}

/// Drives the configured stages against the worker set.
///
/// Owns stage progression exclusively; workers observe the active stage
/// through a shared atomic and discard queued items from finished stages.
pub struct Scheduler {
    clock: RunClock,
    load: LoadConfig,
    default_model: String,
    workers: Vec<WorkerHandle>,
    datagen: Arc<dyn DataGenerator>,
    sink: Arc<MetricSink>,
    pending: Arc<PendingCounter>,
    current_stage: Arc<AtomicU32>,
    cancel: CancellationToken,
    rng: StdRng,
    trace: Option<Vec<f64>>,
    round_robin: usize,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: RunClock,
        load: LoadConfig,
        default_model: String,
        workers: Vec<WorkerHandle>,
        datagen: Arc<dyn DataGenerator>,
        sink: Arc<MetricSink>,
        pending: Arc<PendingCounter>,
        current_stage: Arc<AtomicU32>,
        cancel: CancellationToken,
        trace: Option<Vec<f64>>,
    ) -> Self {
        let rng = match load.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            clock,
            load,
            default_model,
            workers,
            datagen,
            sink,
            pending,
            current_stage,
            cancel,
            rng,
            trace,
            round_robin: 0,
        }
    }

    /// Run every stage in order. Returns the observed envelope of each stage
    /// that ran (possibly fewer than configured when canceled or when a
    /// finite corpus runs dry).
    pub async fn run(&mut self) -> Result<Vec<StageRuntimeInfo>> {
        let stages = self.load.stages.clone();
        let mut infos = Vec::with_capacity(stages.len());

        for (stage_id, stage) in stages.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            let (info, stop) = self.run_stage(stage_id as u32, stage).await?;
            tracing::info!(
                stage = stage_id,
                start = info.start_time,
                end = info.end_time,
                "stage complete"
            );
            infos.push(info);

            if stop == StageStop::CorpusExhausted {
                tracing::info!("request corpus exhausted, ending run");
                break;
            }
            let last = stage_id + 1 == stages.len();
            if !last && !self.cancel.is_cancelled() && self.load.interval > 0.0 {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs_f64(self.load.interval)) => {}
                }
            }
        }

        self.current_stage.store(STAGE_NONE, Ordering::Release);
        Ok(infos)
    }

    async fn run_stage(
        &mut self,
        stage_id: u32,
        stage: &StageConfig,
    ) -> Result<(StageRuntimeInfo, StageStop)> {
        let kind = stage.kind();
        let stage_cancel = self.cancel.child_token();
        let split = stage
            .traffic_split
            .as_ref()
            .map(|entries| -> Result<_> {
                let weights: Vec<f64> = entries.iter().map(|e| e.weight).collect();
                let index = WeightedIndex::new(&weights)
                    .context("invalid traffic split weights")?;
                let models: Vec<String> = entries.iter().map(|e| e.model.clone()).collect();
                Ok((index, models))
            })
            .transpose()?;

        match kind {
            StageKind::Rate { .. } => {
                let cap = self.load.worker_max_concurrency;
                for w in &self.workers {
                    w.set_max_concurrency(cap);
                }
            }
            StageKind::Concurrency { concurrency, .. } => {
                for (i, cap) in partition_concurrency(concurrency, self.workers.len())
                    .into_iter()
                    .enumerate()
                {
                    self.workers[i].set_max_concurrency(cap);
                }
            }
        }

        self.current_stage.store(stage_id, Ordering::Release);
        let start = self.clock.now();
        tracing::info!(stage = stage_id, ?kind, "stage starting");

        let stop = match kind {
            StageKind::Rate { rate, duration } => {
                self.run_open_loop(stage_id, rate, duration, start, &stage_cancel, &split)
                    .await?
            }
            StageKind::Concurrency {
                concurrency,
                num_requests,
                duration,
            } => {
                self.run_closed_loop(
                    stage_id,
                    concurrency,
                    num_requests,
                    duration,
                    start,
                    &stage_cancel,
                    &split,
                )
                .await
            }
        };

        // A deadline or cancel cuts the stage off: queued items that never
        // started are discarded. A naturally exhausted schedule or request
        // count lets everything already handed out execute.
        if matches!(stop, StageStop::DeadlineHit | StageStop::Canceled) {
            self.current_stage.store(STAGE_NONE, Ordering::Release);
        }

        let drain = Duration::from_secs_f64(self.load.stage_drain_timeout);
        let drained = tokio::time::timeout(drain, self.pending.wait_idle())
            .await
            .is_ok();
        if !drained {
            tracing::warn!(
                stage = stage_id,
                outstanding = self.pending.outstanding(),
                "stage drain timed out, canceling in-flight requests"
            );
            stage_cancel.cancel();
            let _ = tokio::time::timeout(CANCEL_SETTLE, self.pending.wait_idle()).await;
        }
        self.current_stage.store(STAGE_NONE, Ordering::Release);

        let end = self.clock.now();
        let info = StageRuntimeInfo {
            stage_id,
            requested_rate: match kind {
                StageKind::Rate { rate, .. } => Some(rate),
                StageKind::Concurrency { .. } => None,
            },
            start_time: start,
            end_time: end,
            start_unix: self.clock.to_unix(start),
            end_unix: self.clock.to_unix(end),
        };
        Ok((info, stop))
    }

    async fn run_open_loop(
        &mut self,
        stage_id: u32,
        rate: f64,
        duration: f64,
        start: f64,
        stage_cancel: &CancellationToken,
        split: &Option<(WeightedIndex<f64>, Vec<String>)>,
    ) -> Result<StageStop> {
        let deadline = start + duration;
        let mut schedule = self.make_schedule(rate, duration, start)?;
        let mut stop = StageStop::ScheduleDone;

        while let Some(t) = schedule.next() {
            if t > deadline + DEADLINE_EPSILON {
                stop = StageStop::DeadlineHit;
                break;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    stop = StageStop::Canceled;
                    break;
                }
                _ = self.clock.sleep_until(t) => {}
            }
            if self.cancel.is_cancelled() {
                stop = StageStop::Canceled;
                break;
            }

            let Some(descriptor) = self.datagen.next_descriptor() else {
                stop = StageStop::CorpusExhausted;
                break;
            };
            let model = self.pick_model(split);
            let item = DispatchItem {
                descriptor,
                model,
                stage_id,
                scheduled_time: t,
                cancel: stage_cancel.clone(),
            };
            self.dispatch_open_loop(item);
        }
        Ok(stop)
    }

    /// Open loop never queues behind a busy fleet: if no worker has free
    /// capacity the dispatch is dropped and recorded, preserving the
    /// schedule for every later arrival.
    fn dispatch_open_loop(&mut self, item: DispatchItem) {
        let workers = self.workers.len();
        self.pending.add();

        // Session-affine descriptors go to their pinned worker even when it
        // is saturated; the session queue provides the ordering.
        if let Some(preferred) = item.descriptor.preferred_worker() {
            let target = preferred % workers;
            let stage_id = item.stage_id;
            let model = item.model.clone();
            let scheduled_time = item.scheduled_time;
            if self.workers[target].try_dispatch(item).is_err() {
                self.pending.complete();
                self.sink
                    .record(LifecycleRecord::dropped(stage_id, model, scheduled_time));
                tracing::debug!(stage = stage_id, worker = target, "preferred worker queue full, dispatch dropped");
            }
            return;
        }

        let mut item = item;
        for i in 0..workers {
            let target = (self.round_robin + i) % workers;
            if !self.workers[target].has_capacity() {
                continue;
            }
            match self.workers[target].try_dispatch(item) {
                Ok(()) => {
                    self.round_robin = target + 1;
                    return;
                }
                Err(back) => item = back,
            }
        }

        self.pending.complete();
        self.sink.record(LifecycleRecord::dropped(
            item.stage_id,
            item.model,
            item.scheduled_time,
        ));
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_closed_loop(
        &mut self,
        stage_id: u32,
        concurrency: u32,
        num_requests: Option<u64>,
        duration: Option<f64>,
        start: f64,
        stage_cancel: &CancellationToken,
        split: &Option<(WeightedIndex<f64>, Vec<String>)>,
    ) -> StageStop {
        let deadline = duration.map(|d| start + d);
        // Workers past the concurrency count carry a zero cap this stage and
        // must not receive dispatches.
        let active = self.workers.len().min(concurrency as usize).max(1);
        let mut sent = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return StageStop::Canceled;
            }
            if let Some(n) = num_requests {
                if sent >= n {
                    return StageStop::CountReached;
                }
            }
            if let Some(dl) = deadline {
                if self.clock.now() >= dl {
                    return StageStop::DeadlineHit;
                }
            }

            let Some(descriptor) = self.datagen.next_descriptor() else {
                return StageStop::CorpusExhausted;
            };
            let model = self.pick_model(split);
            let target = match descriptor.preferred_worker() {
                Some(w) => w % active,
                None => {
                    let t = self.round_robin % active;
                    self.round_robin += 1;
                    t
                }
            };
            let item = DispatchItem {
                descriptor,
                model,
                stage_id,
                scheduled_time: self.clock.now(),
                cancel: stage_cancel.clone(),
            };

            self.pending.add();
            let accepted = if let Some(dl) = deadline {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    _ = self.clock.sleep_until(dl) => None,
                    ok = self.workers[target].dispatch(item) => Some(ok),
                }
            } else {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    ok = self.workers[target].dispatch(item) => Some(ok),
                }
            };
            match accepted {
                Some(true) => sent += 1,
                Some(false) => {
                    // Worker channel closed; nothing more can run.
                    self.pending.complete();
                    return StageStop::Canceled;
                }
                None => {
                    self.pending.complete();
                    return if self.cancel.is_cancelled() {
                        StageStop::Canceled
                    } else {
                        StageStop::DeadlineHit
                    };
                }
            }
        }
    }

    fn make_schedule(&mut self, rate: f64, duration: f64, start: f64) -> Result<Schedule> {
        Ok(match self.load.load_type {
            LoadType::Constant => {
                Schedule::Constant(ConstantSchedule::new(rate, duration, start, &mut self.rng))
            }
            LoadType::Poisson => {
                Schedule::Poisson(PoissonSchedule::new(rate, start, &mut self.rng))
            }
            LoadType::Trace => {
                let trace = self
                    .trace
                    .as_ref()
                    .context("trace schedule requested without trace data")?;
                Schedule::Trace(TraceSchedule::new(trace, start))
            }
        })
    }

    fn pick_model(&mut self, split: &Option<(WeightedIndex<f64>, Vec<String>)>) -> String {
        match split {
            Some((index, models)) => models[index.sample(&mut self.rng)].clone(),
            None => self.default_model.clone(),
        }
    }
}

/// Split global concurrency N across W workers: the first `N mod W` workers
/// get the ceiling share, the rest the floor.
pub fn partition_concurrency(n: u32, workers: usize) -> Vec<u32> {
    let w = workers as u32;
    let base = n / w;
    let extra = n % w;
    (0..w)
        .map(|i| if i < extra { base + 1 } else { base })
        .collect()
}
