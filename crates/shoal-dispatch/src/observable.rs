// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 20 February 2024

/*!
The unit of work moving through the queue.

An [`InferenceObservable`] collects one or more requests together with
one [`Waiter`] each. Ownership moves provider → queue → worker; each
caller keeps the matching [`Ticket`] and blocks on it. Once a worker
has taken the inputs the observable is locked and nothing more may be
appended.
 */

use crate::DispatchError;
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use shoal_core::tensor::TensorMap;
use std::sync::Arc;

pub(crate) type RequestResult = Result<TensorMap, DispatchError>;

/// A batch shared between the provider, the queue and one worker.
pub(crate) type SharedObservable = Arc<Mutex<InferenceObservable>>;

/// The completion side of one request.
pub(crate) struct Waiter(Sender<RequestResult>);

impl Waiter {
    fn resolve(self, result: RequestResult) {
        // The caller may have stopped waiting; nothing to report then.
        let _ = self.0.send(result);
    }
}

/// Handle to a submitted request. Resolves exactly once.
#[derive(Debug)]
pub struct Ticket(Receiver<RequestResult>);

impl Ticket {
    /// Block until the request has been processed.
    ///
    /// Resolves to [`DispatchError::Abandoned`] if the request's batch was
    /// dropped without producing a result.
    pub fn wait(self) -> Result<TensorMap, DispatchError> {
        self.0.recv().unwrap_or(Err(DispatchError::Abandoned))
    }
}

/// Create a connected waiter and ticket.
pub(crate) fn ticket() -> (Waiter, Ticket) {
    let (tx, rx) = bounded(1);
    (Waiter(tx), Ticket(rx))
}

pub(crate) struct InferenceObservable {
    id: u64,
    inputs: Vec<TensorMap>,
    waiters: Vec<Waiter>,
    count: usize,
    locked: bool,
}

impl InferenceObservable {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            inputs: Vec::new(),
            waiters: Vec::new(),
            count: 0,
            locked: false,
        }
    }

    /// An observable holding exactly one request.
    pub(crate) fn single(id: u64, inputs: TensorMap, waiter: Waiter) -> Self {
        let mut this = Self::new(id);
        this.push(inputs, waiter);
        this
    }

    pub(crate) fn shared(self) -> SharedObservable {
        Arc::new(Mutex::new(self))
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Number of requests appended so far.
    pub(crate) fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.locked
    }

    /// Append a request. Must not be called once locked.
    pub(crate) fn push(&mut self, inputs: TensorMap, waiter: Waiter) {
        debug_assert!(!self.locked, "appended to a locked batch");
        self.inputs.push(inputs);
        self.waiters.push(waiter);
        self.count += 1;
    }

    /// Lock the batch and take its inputs for execution. Returns nothing
    /// if the batch was already locked.
    pub(crate) fn take_for_dispatch(&mut self) -> Vec<TensorMap> {
        if self.locked {
            return Vec::new();
        }

        self.locked = true;
        std::mem::take(&mut self.inputs)
    }

    /// Deliver one result per request, in input order.
    pub(crate) fn complete(&mut self, results: Vec<RequestResult>) {
        self.locked = true;
        debug_assert_eq!(results.len(), self.waiters.len());

        // Waiters without a result are dropped and resolve as abandoned.
        for (waiter, result) in self.waiters.drain(..).zip(results) {
            waiter.resolve(result);
        }
    }

    /// Fail every request in the batch.
    pub(crate) fn fail(&mut self, error: impl Fn() -> DispatchError) {
        self.locked = true;
        self.inputs.clear();
        for waiter in self.waiters.drain(..) {
            waiter.resolve(Err(error()));
        }
    }
}
