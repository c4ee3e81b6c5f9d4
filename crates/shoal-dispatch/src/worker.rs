// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 21 February 2024

use crate::{
    observable::{RequestResult, SharedObservable},
    queue::BatchQueue,
    timing::WorkerTimings,
    DispatchError,
};
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use shoal_core::{
    device::{DeviceId, DeviceTopology},
    model::{ModelLoader, NativeModel},
    signature::ModelSignature,
    tensor::TensorMap,
};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Lifecycle of a worker thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    /// Spawned, loading its model.
    Created = 0,
    Running = 1,
    /// Asked to stop; finishes the batch in hand first.
    Stopping = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Created,
            1 => WorkerState::Running,
            2 => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Created => "created",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        };

        f.write_str(name)
    }
}

/// A snapshot of one worker's counters.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerStats {
    pub index: usize,
    pub device: DeviceId,
    pub state: WorkerState,
    pub processed_batches: u64,
    pub processed_requests: u64,
    pub failed_requests: u64,
    pub mean_latency: Option<Duration>,
    pub latency_std_dev: Option<Duration>,
    pub max_latency: Option<Duration>,

    /// Mean batch latency per batch size, smallest size first.
    pub latency_by_batch_size: Vec<(usize, Duration)>,
}

/// The part of a worker visible from the pool.
pub(crate) struct WorkerShared {
    index: usize,
    device: DeviceId,
    state: AtomicU8,
    processed_batches: AtomicU64,
    processed_requests: AtomicU64,
    failed_requests: AtomicU64,
    timings: Mutex<WorkerTimings>,
}

impl WorkerShared {
    fn new(index: usize, device: DeviceId) -> Self {
        Self {
            index,
            device,
            state: AtomicU8::new(WorkerState::Created as u8),
            processed_batches: AtomicU64::new(0),
            processed_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            timings: Mutex::new(WorkerTimings::default()),
        }
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move forward to `next`. States never move backwards.
    fn advance(&self, next: WorkerState) {
        self.state.fetch_max(next as u8, Ordering::AcqRel);
    }

    fn record(&self, requests: usize, failed: usize, elapsed: Duration) {
        self.processed_batches.fetch_add(1, Ordering::Relaxed);
        self.processed_requests
            .fetch_add(requests as u64, Ordering::Relaxed);
        self.failed_requests
            .fetch_add(failed as u64, Ordering::Relaxed);
        self.timings.lock().record(requests, elapsed);
    }

    pub(crate) fn stats(&self) -> WorkerStats {
        let timings = self.timings.lock();
        WorkerStats {
            index: self.index,
            device: self.device,
            state: self.state(),
            processed_batches: self.processed_batches.load(Ordering::Relaxed),
            processed_requests: self.processed_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            mean_latency: timings.mean(),
            latency_std_dev: timings.std_dev(),
            max_latency: timings.max(),
            latency_by_batch_size: timings.by_batch_size(),
        }
    }
}

/// Outcome of a worker's model load, reported once to the pool.
pub(crate) type Startup = anyhow::Result<()>;

/// A model replica consuming batches from the shared queue.
///
/// The native model is created on the worker's own thread and dropped
/// there, so it never crosses threads.
pub(crate) struct InferenceWorker {
    shared: Arc<WorkerShared>,
    queue: Arc<BatchQueue<SharedObservable>>,
    loader: Arc<dyn ModelLoader>,
    topology: Arc<dyn DeviceTopology>,
}

impl InferenceWorker {
    pub(crate) fn new(
        index: usize,
        device: DeviceId,
        queue: Arc<BatchQueue<SharedObservable>>,
        loader: Arc<dyn ModelLoader>,
        topology: Arc<dyn DeviceTopology>,
    ) -> Self {
        Self {
            shared: Arc::new(WorkerShared::new(index, device)),
            queue,
            loader,
            topology,
        }
    }

    /// Start the worker thread. The returned receiver yields the result
    /// of the model load.
    pub(crate) fn spawn(self) -> Result<(WorkerHandle, Receiver<Startup>), DispatchError> {
        let (startup_tx, startup_rx) = bounded(1);
        let shared = self.shared.clone();

        let thread = thread::Builder::new()
            .name(format!("shoal-worker-{}", shared.index))
            .spawn(move || self.run(startup_tx))?;

        Ok((WorkerHandle { shared, thread }, startup_rx))
    }

    fn run(self, startup: Sender<Startup>) {
        let index = self.shared.index;
        let device = self.shared.device;

        self.topology.bind_current_thread(&device);

        let loaded = self.loader.load_model(&device).and_then(|model| {
            let signature = model.signature()?;
            Ok((model, signature))
        });

        let (mut model, signature) = match loaded {
            Ok(loaded) => loaded,
            Err(error) => {
                log::error!("worker {} failed to load model on {}: {:#}", index, device, error);
                self.shared.advance(WorkerState::Stopped);
                let _ = startup.send(Err(error));
                return;
            }
        };

        self.shared.advance(WorkerState::Running);
        let _ = startup.send(Ok(()));
        log::debug!("worker {} running on {}", index, device);

        while let Some(batch) = self.queue.pop() {
            self.process(model.as_mut(), &signature, &batch);
        }

        drop(model);
        self.shared.advance(WorkerState::Stopped);
        log::debug!("worker {} stopped", index);
    }

    fn process(
        &self,
        model: &mut dyn NativeModel,
        signature: &ModelSignature,
        batch: &SharedObservable,
    ) {
        let (id, inputs) = {
            let mut batch = batch.lock();
            (batch.id(), batch.take_for_dispatch())
        };

        // Already resolved elsewhere.
        if inputs.is_empty() {
            return;
        }

        let size = inputs.len();
        let start = Instant::now();
        let results = execute(model, signature, inputs);
        let elapsed = start.elapsed();

        let failed = results.iter().filter(|result| result.is_err()).count();
        self.shared.record(size, failed, elapsed);
        log::debug!(
            "worker {} ran batch {} with {} requests ({} failed) in {:?}",
            self.shared.index,
            id,
            size,
            failed,
            elapsed
        );

        batch.lock().complete(results);
    }
}

/// Validate and run one batch, producing one result per request in
/// input order.
///
/// Requests that fail validation are answered without reaching the
/// model. The rest run one [`NativeModel::infer`] call each, or a single
/// [`NativeModel::infer_batch`] call for models that batch natively. A
/// panic fails only the request that caused it.
pub(crate) fn execute(
    model: &mut dyn NativeModel,
    signature: &ModelSignature,
    inputs: Vec<TensorMap>,
) -> Vec<RequestResult> {
    let mut results: Vec<RequestResult> = Vec::with_capacity(inputs.len());
    let mut accepted = Vec::with_capacity(inputs.len());
    let mut requests = Vec::with_capacity(inputs.len());

    for (idx, request) in inputs.into_iter().enumerate() {
        match signature.validate_request(&request) {
            Ok(()) => {
                accepted.push(idx);
                requests.push(request);
                results.push(Err(DispatchError::Abandoned));
            }
            Err(error) => {
                log::warn!("rejected request: {}", error);
                results.push(Err(DispatchError::Rejected(error)));
            }
        }
    }

    if requests.is_empty() {
        return results;
    }

    let outputs = if model.batches_natively() {
        run_batch(model, &requests)
    } else {
        requests
            .iter()
            .map(|request| run_one(model, request))
            .collect()
    };

    for (idx, output) in accepted.into_iter().zip(outputs) {
        results[idx] = output.map_err(|error| {
            log::warn!("inference failed: {:#}", error);
            DispatchError::Inference(error)
        });
    }

    results
}

fn run_one(model: &mut dyn NativeModel, request: &TensorMap) -> anyhow::Result<TensorMap> {
    match panic::catch_unwind(AssertUnwindSafe(|| model.infer(request))) {
        Ok(output) => output,
        Err(payload) => Err(anyhow::anyhow!(
            "model panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}

/// One native batch call. If it panics the requests are rerun one by one
/// so the panic is pinned to the request that caused it.
fn run_batch(
    model: &mut dyn NativeModel,
    requests: &[TensorMap],
) -> Vec<anyhow::Result<TensorMap>> {
    match panic::catch_unwind(AssertUnwindSafe(|| model.infer_batch(requests))) {
        Ok(outputs) if outputs.len() == requests.len() => outputs,
        Ok(outputs) => {
            let returned = outputs.len();
            requests
                .iter()
                .map(|_| {
                    Err(anyhow::anyhow!(
                        "model returned {} results for {} requests",
                        returned,
                        requests.len()
                    ))
                })
                .collect()
        }
        Err(payload) => {
            log::warn!(
                "batch of {} panicked, retrying each request: {}",
                requests.len(),
                panic_message(payload.as_ref())
            );
            requests
                .iter()
                .map(|request| run_one(model, request))
                .collect()
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// The pool's handle to a running worker thread.
pub(crate) struct WorkerHandle {
    shared: Arc<WorkerShared>,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    pub(crate) fn stop(&self) {
        self.shared.advance(WorkerState::Stopping);
    }

    /// Wait for the thread to exit. The queue must already be closed.
    pub(crate) fn join(self) {
        if self.thread.join().is_err() {
            log::error!("worker {} thread panicked", self.shared.index);
        }

        self.shared.advance(WorkerState::Stopped);
    }
}
