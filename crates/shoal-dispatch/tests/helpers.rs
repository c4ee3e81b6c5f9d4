// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 22 February 2024

#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use shoal_core::prelude::*;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

/// A latch the test opens to let blocked model calls continue.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    changed: Condvar,
}

impl Gate {
    pub fn closed() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.changed.notify_all();
    }

    fn pass(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.changed.wait(&mut open);
        }
    }
}

/// Instrumentation shared by every model a loader produced.
#[derive(Default)]
pub struct Probe {
    pub loads: AtomicUsize,
    pub drops: AtomicUsize,
    pub entered: AtomicUsize,
    pub batches: Mutex<Vec<usize>>,
    pub owners: Mutex<Vec<ThreadId>>,
    pub bound: Mutex<Vec<(DeviceId, Option<DeviceId>)>>,
}

impl Probe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }

    /// Wait until `count` model calls have started.
    pub fn wait_entered(&self, count: usize) {
        wait_for(|| self.entered.load(Ordering::SeqCst) >= count);
    }
}

/// `y = x + 1` on a single `f32`, failing on negative input and
/// panicking on 13.
pub struct AddOne {
    owner: ThreadId,
    probe: Arc<Probe>,
    gate: Option<Arc<Gate>>,
    latency: Duration,
}

impl NativeModel for AddOne {
    fn signature(&self) -> anyhow::Result<ModelSignature> {
        Ok(ModelSignature::new(
            vec![TensorSpec::fixed("x", ElementType::F32, &[1])],
            vec![TensorSpec::fixed("y", ElementType::F32, &[1])],
        ))
    }

    fn infer(&mut self, inputs: &TensorMap) -> anyhow::Result<TensorMap> {
        anyhow::ensure!(
            thread::current().id() == self.owner,
            "model used off its worker thread"
        );

        let x = inputs["x"]
            .as_slice::<f32>()
            .and_then(|values| values.first().copied())
            .ok_or_else(|| anyhow::anyhow!("empty input"))?;

        if x == 13.0 {
            panic!("unlucky input");
        }
        anyhow::ensure!(x >= 0.0, "negative input: {}", x);

        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }

        Ok(response(x + 1.0))
    }

    fn batches_natively(&self) -> bool {
        true
    }

    fn infer_batch(&mut self, batch: &[TensorMap]) -> Vec<anyhow::Result<TensorMap>> {
        self.probe.entered.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.pass();
        }

        self.probe.batches.lock().push(batch.len());
        batch.iter().map(|request| self.infer(request)).collect()
    }
}

impl Drop for AddOne {
    fn drop(&mut self) {
        self.probe.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Builds loaders for [`AddOne`].
#[derive(Clone)]
pub struct Stub {
    pub probe: Arc<Probe>,
    pub gate: Option<Arc<Gate>>,
    pub latency: Duration,
    pub topology: Option<Arc<dyn DeviceTopology>>,
    pub fail_on: Option<DeviceId>,
}

impl Stub {
    pub fn new(probe: &Arc<Probe>) -> Self {
        Self {
            probe: probe.clone(),
            gate: None,
            latency: Duration::ZERO,
            topology: None,
            fail_on: None,
        }
    }

    pub fn gated(mut self, gate: &Arc<Gate>) -> Self {
        self.gate = Some(gate.clone());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn observing(mut self, topology: &Arc<dyn DeviceTopology>) -> Self {
        self.topology = Some(topology.clone());
        self
    }

    pub fn failing_on(mut self, device: DeviceId) -> Self {
        self.fail_on = Some(device);
        self
    }
}

impl ModelLoader for Stub {
    fn load_model(&self, device: &DeviceId) -> anyhow::Result<Box<dyn NativeModel>> {
        if let Some(topology) = &self.topology {
            self.probe
                .bound
                .lock()
                .push((*device, topology.current_device()));
        }

        if self.fail_on == Some(*device) {
            anyhow::bail!("no model for {}", device);
        }

        self.probe.loads.fetch_add(1, Ordering::SeqCst);
        self.probe.owners.lock().push(thread::current().id());

        Ok(Box::new(AddOne {
            owner: thread::current().id(),
            probe: self.probe.clone(),
            gate: self.gate.clone(),
            latency: self.latency,
        }))
    }
}

pub fn request(x: f32) -> TensorMap {
    let mut map = TensorMap::new();
    map.insert("x".to_owned(), Tensor::from_vec(vec![1], vec![x]).unwrap());
    map
}

pub fn response(y: f32) -> TensorMap {
    let mut map = TensorMap::new();
    map.insert("y".to_owned(), Tensor::from_vec(vec![1], vec![y]).unwrap());
    map
}

/// A request whose input has the wrong element type.
pub fn malformed() -> TensorMap {
    let mut map = TensorMap::new();
    map.insert("x".to_owned(), Tensor::from_vec(vec![1], vec![1i32]).unwrap());
    map
}

pub fn output(outputs: &TensorMap) -> f32 {
    outputs["y"].as_slice::<f32>().unwrap()[0]
}

/// Poll `condition` for up to five seconds.
pub fn wait_for(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}
