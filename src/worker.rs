use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::data::{DataGenerator, Descriptor};
use crate::lifecycle::{execute_request, EngineContext};
use crate::sink::MetricSink;

/// Sentinel stage id meaning "no stage is accepting work".
pub const STAGE_NONE: u32 = u32::MAX;

/// One scheduled request on its way to a worker.
pub struct DispatchItem {
    pub descriptor: Descriptor,
    pub model: String,
    pub stage_id: u32,
    pub scheduled_time: f64,
    /// Stage-scoped token; canceling it aborts this item in flight.
    pub cancel: CancellationToken,
}

/// Counts dispatches the scheduler has handed out but workers have not yet
/// retired (recorded or discarded). Stage drain waits on this hitting zero.
#[derive(Default)]
pub struct PendingCounter {
    count: AtomicU64,
    idle: Notify,
}

impl PendingCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn complete(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn outstanding(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub async fn wait_idle(&self) {
        loop {
            // Register before checking so a complete() between the check and
            // the await cannot be missed.
            let notified = self.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct WorkerState {
    in_flight: AtomicU32,
    max_concurrency: AtomicU32,
    slot_freed: Notify,
}

impl WorkerState {
    fn try_acquire_slot(&self) -> bool {
        loop {
            let cur = self.in_flight.load(Ordering::Acquire);
            if cur >= self.max_concurrency.load(Ordering::Acquire) {
                return false;
            }
            if self
                .in_flight
                .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release_slot(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.slot_freed.notify_one();
    }
}

/// Scheduler-side handle to one worker.
#[derive(Clone)]
pub struct WorkerHandle {
    pub id: usize,
    tx: mpsc::Sender<DispatchItem>,
    state: Arc<WorkerState>,
}

impl WorkerHandle {
    /// Free iff its in-flight count is under the currently assigned cap.
    pub fn has_capacity(&self) -> bool {
        self.state.in_flight.load(Ordering::Acquire)
            < self.state.max_concurrency.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> u32 {
        self.state.in_flight.load(Ordering::Acquire)
    }

    /// Scheduler updates this between stages only.
    pub fn set_max_concurrency(&self, cap: u32) {
        self.state.max_concurrency.store(cap, Ordering::Release);
        self.state.slot_freed.notify_waiters();
    }

    /// Non-blocking dispatch for the open loop. Returns the item back when
    /// the worker's queue is full so the caller can try another worker.
    pub fn try_dispatch(&self, item: DispatchItem) -> Result<(), DispatchItem> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) | Err(TrySendError::Closed(item)) => Err(item),
        }
    }

    /// Blocking dispatch for the closed loop; resolves when the worker's
    /// queue has room. Returns false if the worker is gone.
    pub async fn dispatch(&self, item: DispatchItem) -> bool {
        self.tx.send(item).await.is_ok()
    }
}

/// Spawn one worker task. The worker owns its engine context (HTTP client
/// and pool included), consumes its dispatch channel, and enforces its local
/// concurrency cap by compare-and-incrementing `in_flight` before each
/// request task starts.
pub fn spawn_worker(
    id: usize,
    ctx: EngineContext,
    datagen: Arc<dyn DataGenerator>,
    sink: Arc<MetricSink>,
    pending: Arc<PendingCounter>,
    current_stage: Arc<AtomicU32>,
    queue_capacity: usize,
) -> (WorkerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(queue_capacity.max(1));
    let state = Arc::new(WorkerState {
        in_flight: AtomicU32::new(0),
        max_concurrency: AtomicU32::new(1),
        slot_freed: Notify::new(),
    });
    let handle = WorkerHandle {
        id,
        tx,
        state: Arc::clone(&state),
    };
    let join = tokio::spawn(run_worker(
        id,
        Arc::new(ctx),
        rx,
        state,
        datagen,
        sink,
        pending,
        current_stage,
    ));
    (handle, join)
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    id: usize,
    ctx: Arc<EngineContext>,
    mut rx: mpsc::Receiver<DispatchItem>,
    state: Arc<WorkerState>,
    datagen: Arc<dyn DataGenerator>,
    sink: Arc<MetricSink>,
    pending: Arc<PendingCounter>,
    current_stage: Arc<AtomicU32>,
) {
    let mut tasks: JoinSet<()> = JoinSet::new();
    let mut failures = 0u64;

    'recv: while let Some(item) = rx.recv().await {
        // Queued items from a stage that already wound down were never
        // dispatched; discard them.
        if item.stage_id != current_stage.load(Ordering::Acquire) {
            pending.complete();
            continue;
        }

        while !state.try_acquire_slot() {
            tokio::select! {
                _ = state.slot_freed.notified() => {}
                _ = item.cancel.cancelled() => {
                    pending.complete();
                    continue 'recv;
                }
            }
        }

        let descriptor = match item.descriptor {
            Descriptor::Concrete(d) => Some(d),
            Descriptor::Lazy { index, .. } => datagen.resolve(index),
        };
        let Some(descriptor) = descriptor else {
            tracing::warn!(worker = id, "lazy descriptor did not resolve, skipping");
            state.release_slot();
            pending.complete();
            continue;
        };

        let ctx = Arc::clone(&ctx);
        let sink = Arc::clone(&sink);
        let state = Arc::clone(&state);
        let pending = Arc::clone(&pending);
        let model = item.model;
        let stage_id = item.stage_id;
        let scheduled_time = item.scheduled_time;
        let cancel = item.cancel;
        tasks.spawn(async move {
            let record = execute_request(
                &ctx,
                descriptor,
                &model,
                stage_id,
                scheduled_time,
                &cancel,
            )
            .await;
            sink.record(record);
            state.release_slot();
            pending.complete();
        });

        // Reap finished tasks without blocking the dispatch path.
        while let Some(result) = tasks.try_join_next() {
            if let Err(err) = result {
                failures += 1;
                tracing::error!(worker = id, error = %err, "request task failed");
            }
        }
    }

    while let Some(result) = tasks.join_next().await {
        if let Err(err) = result {
            failures += 1;
            tracing::error!(worker = id, error = %err, "request task failed");
        }
    }
    if failures > 0 {
        tracing::warn!(worker = id, failures, "worker finished with task failures");
    }
    tracing::debug!(worker = id, "worker exited");
}
