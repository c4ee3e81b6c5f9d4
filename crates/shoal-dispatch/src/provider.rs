// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 21 February 2024

/*!
Coalescing of concurrent requests into shared batches.

The provider keeps a weak reference to the most recently created
batch, so a batch lives only as long as the queue or a worker holds it.
Callers append to it until it is full or a worker has locked it, and
the caller that opened a batch is the one that enqueues it.
 */

use crate::{
    observable::{InferenceObservable, SharedObservable, Waiter},
    queue::BatchQueue,
};
use parking_lot::Mutex;
use shoal_core::tensor::TensorMap;
use std::{
    sync::{Arc, Weak},
    time::Duration,
};

struct ProviderState {
    open: Weak<Mutex<InferenceObservable>>,
    next_id: u64,
}

pub(crate) struct ObservablesProvider {
    queue: Arc<BatchQueue<SharedObservable>>,
    batch_limit: usize,
    enqueue_timeout: Option<Duration>,
    state: Mutex<ProviderState>,
}

impl ObservablesProvider {
    pub(crate) fn new(
        queue: Arc<BatchQueue<SharedObservable>>,
        batch_limit: usize,
        enqueue_timeout: Option<Duration>,
    ) -> Self {
        Self {
            queue,
            batch_limit,
            enqueue_timeout,
            state: Mutex::new(ProviderState {
                open: Weak::new(),
                next_id: 0,
            }),
        }
    }

    /// Attach a request to the open batch, or open a new one.
    ///
    /// Blocks while a new batch waits for queue space. If the queue
    /// refuses it every request in that batch is failed.
    pub(crate) fn attach(&self, inputs: TensorMap, waiter: Waiter) {
        let opened = {
            let mut state = self.state.lock();

            // Workers lock a batch through its own mutex, held here until
            // the request is appended.
            if let Some(open) = state.open.upgrade() {
                let mut batch = open.lock();
                if !batch.is_locked() && batch.len() < self.batch_limit {
                    batch.push(inputs, waiter);
                    return;
                }
            }

            let id = state.next_id;
            state.next_id += 1;

            let batch = InferenceObservable::single(id, inputs, waiter).shared();
            state.open = Arc::downgrade(&batch);
            batch
        };

        if let Err(rejected) = self.queue.push(opened, self.enqueue_timeout) {
            log::warn!("batch refused by the queue: {:?}", rejected.reason);
            rejected.fail();
        }
    }
}
