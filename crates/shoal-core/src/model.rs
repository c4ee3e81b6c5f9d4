// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 12 February 2024

/*!
The seam between the dispatcher and a native inference runtime.

A [`ModelLoader`] is shared by every worker of a pool and produces one
[`NativeModel`] per worker. Models are loaded on the worker thread that
owns them and never leave it, so `NativeModel` does not require `Send`.
 */

use crate::{device::DeviceId, signature::ModelSignature, tensor::TensorMap};
use anyhow::Result;

/// A loaded model instance, exclusively owned by one worker.
pub trait NativeModel {
    /// Query the model's inputs and outputs. Called once per worker
    /// right after loading; the result is cached for every later call.
    fn signature(&self) -> Result<ModelSignature>;

    /// Execute the model on a single request.
    fn infer(&mut self, inputs: &TensorMap) -> Result<TensorMap>;

    /// Whether [`NativeModel::infer_batch`] executes a batch in one native
    /// call. Dispatchers call [`NativeModel::infer`] per request otherwise.
    fn batches_natively(&self) -> bool {
        false
    }

    /// Execute the model on several independent requests, returning one
    /// result per request in the same order.
    ///
    /// The default runs [`NativeModel::infer`] once per request. Runtimes
    /// that can stack requests into one native call override it together
    /// with [`NativeModel::batches_natively`].
    fn infer_batch(&mut self, batch: &[TensorMap]) -> Vec<Result<TensorMap>> {
        batch.iter().map(|request| self.infer(request)).collect()
    }
}

impl<M: NativeModel + ?Sized> NativeModel for Box<M> {
    fn signature(&self) -> Result<ModelSignature> {
        self.as_ref().signature()
    }

    fn infer(&mut self, inputs: &TensorMap) -> Result<TensorMap> {
        self.as_mut().infer(inputs)
    }

    fn batches_natively(&self) -> bool {
        self.as_ref().batches_natively()
    }

    fn infer_batch(&mut self, batch: &[TensorMap]) -> Vec<Result<TensorMap>> {
        self.as_mut().infer_batch(batch)
    }
}

/// Produces ready-to-use model instances.
pub trait ModelLoader: Send + Sync {
    /// Load a fresh model instance for `device`. Invoked once per worker,
    /// on that worker's thread.
    fn load_model(&self, device: &DeviceId) -> Result<Box<dyn NativeModel>>;
}

impl<F> ModelLoader for F
where
    F: Fn(&DeviceId) -> Result<Box<dyn NativeModel>> + Send + Sync,
{
    fn load_model(&self, device: &DeviceId) -> Result<Box<dyn NativeModel>> {
        self(device)
    }
}
