// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 22 February 2024

use crate::{
    config::{DispatchMode, PoolConfig},
    observable::{ticket, InferenceObservable, SharedObservable, Ticket},
    provider::ObservablesProvider,
    queue::BatchQueue,
    worker::{InferenceWorker, WorkerHandle, WorkerShared, WorkerStats},
    DispatchError,
};
use parking_lot::Mutex;
use shoal_core::{
    device::{CpuTopology, DeviceTopology},
    model::ModelLoader,
    tensor::TensorMap,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// A fixed set of model replicas serving requests from one shared queue.
///
/// Every worker owns its own model instance, loaded on its own thread.
/// Callers block in [`ThreadPool::infer`] until their request has been
/// processed; in [`DispatchMode::Batched`] concurrent requests are
/// coalesced into shared batches of at most `batch_limit` requests.
pub struct ThreadPool {
    config: PoolConfig,
    queue: Arc<BatchQueue<SharedObservable>>,
    provider: Option<ObservablesProvider>,
    workers: Mutex<Vec<WorkerHandle>>,
    stats: Vec<Arc<WorkerShared>>,
    next_id: AtomicU64,
}

impl ThreadPool {
    /// Build a pool on the local CPU with a single device.
    pub fn new(loader: Arc<dyn ModelLoader>, config: PoolConfig) -> Result<Self, DispatchError> {
        Self::build(loader, Arc::new(CpuTopology::new()), config)
    }

    /// Build a pool, spreading workers round-robin over the devices of
    /// `topology`.
    ///
    /// Returns once every worker has loaded its model. If any load fails
    /// all workers are stopped and joined before the error is returned.
    pub fn build(
        loader: Arc<dyn ModelLoader>,
        topology: Arc<dyn DeviceTopology>,
        config: PoolConfig,
    ) -> Result<Self, DispatchError> {
        config.validate()?;

        let devices = topology.devices();
        if devices.is_empty() {
            return Err(DispatchError::NoDevices);
        }

        let count = config.workers.unwrap_or(devices.len());
        let queue = Arc::new(BatchQueue::new(config.queue_limit));

        let mut workers = Vec::with_capacity(count);
        let mut startups = Vec::with_capacity(count);
        for index in 0..count {
            let device = devices[index % devices.len()];
            let worker = InferenceWorker::new(
                index,
                device,
                queue.clone(),
                loader.clone(),
                topology.clone(),
            );

            match worker.spawn() {
                Ok((handle, startup)) => {
                    workers.push(handle);
                    startups.push(startup);
                }
                Err(error) => {
                    teardown(&queue, workers);
                    return Err(error);
                }
            }
        }

        let mut failure = None;
        for (index, startup) in startups.into_iter().enumerate() {
            let loaded = startup.recv().unwrap_or_else(|_| {
                Err(anyhow::anyhow!("worker thread exited before loading its model"))
            });

            match loaded {
                Err(error) if failure.is_none() => {
                    failure = Some(DispatchError::ModelLoad {
                        worker: index,
                        error,
                    });
                }
                _ => {}
            }
        }

        if let Some(error) = failure {
            teardown(&queue, workers);
            return Err(error);
        }

        let provider = match config.mode {
            DispatchMode::Sequential => None,
            DispatchMode::Batched => Some(ObservablesProvider::new(
                queue.clone(),
                config.batch_limit,
                config.enqueue_timeout,
            )),
        };

        log::info!(
            "started {} workers on {} devices ({:?}, batch limit {}, queue limit {})",
            count,
            devices.len(),
            config.mode,
            config.batch_limit,
            config.queue_limit
        );

        Ok(Self {
            stats: workers.iter().map(|w| w.shared().clone()).collect(),
            workers: Mutex::new(workers),
            config,
            queue,
            provider,
            next_id: AtomicU64::new(0),
        })
    }

    /// Queue a request without waiting for it.
    ///
    /// Blocks while the queue is full. If the request cannot be queued
    /// the returned ticket resolves to the error immediately.
    pub fn submit(&self, inputs: TensorMap) -> Ticket {
        let (waiter, ticket) = ticket();

        match &self.provider {
            Some(provider) => provider.attach(inputs, waiter),
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let batch = InferenceObservable::single(id, inputs, waiter).shared();
                if let Err(rejected) = self.queue.push(batch, self.config.enqueue_timeout) {
                    rejected.fail();
                }
            }
        }

        ticket
    }

    /// Run one request and wait for its outputs.
    pub fn infer(&self, inputs: TensorMap) -> Result<TensorMap, DispatchError> {
        self.submit(inputs).wait()
    }

    /// Stop every worker and wait for them to exit.
    ///
    /// Batches already taken by a worker complete normally; requests still
    /// queued fail with [`DispatchError::ShuttingDown`]. Calling this more
    /// than once is harmless.
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock();
        if workers.is_empty() {
            return;
        }

        for worker in workers.iter() {
            worker.stop();
        }

        let stranded = self.queue.close();
        if !stranded.is_empty() {
            log::info!("failing {} queued batches on shutdown", stranded.len());
        }

        for batch in stranded {
            batch.lock().fail(|| DispatchError::ShuttingDown);
        }

        for worker in workers.drain(..) {
            worker.join();
        }

        log::info!("pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.stats.len()
    }

    /// Number of batches waiting in the queue.
    pub fn queued_batches(&self) -> usize {
        self.queue.len()
    }

    /// Number of requests waiting in the queue, across all batches.
    pub fn pending_requests(&self) -> usize {
        self.queue.pending_requests()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.stats.iter().map(|shared| shared.stats()).collect()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn teardown(queue: &BatchQueue<SharedObservable>, workers: Vec<WorkerHandle>) {
    for worker in &workers {
        worker.stop();
    }

    queue.close();
    for worker in workers {
        worker.join();
    }
}
