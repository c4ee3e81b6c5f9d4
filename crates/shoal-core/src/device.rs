// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 14 February 2024

/*!
Compute devices and per-thread device affinity.

A pool asks its [`DeviceTopology`] which devices exist and binds each
worker thread to one of them before loading that worker's model. The
topology is passed in explicitly, there is no process-wide registry.
 */

use serde::{Deserialize, Serialize};
use std::{cell::Cell, fmt};

/// The kind of compute device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

/// Identifier for a specific device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub kind: DeviceKind,
    pub ordinal: usize,
}

impl DeviceId {
    pub fn cpu(ordinal: usize) -> Self {
        Self {
            kind: DeviceKind::Cpu,
            ordinal,
        }
    }

    pub fn gpu(ordinal: usize) -> Self {
        Self {
            kind: DeviceKind::Gpu,
            ordinal,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
        };
        write!(f, "{}:{}", kind, self.ordinal)
    }
}

/// Lists devices and tracks which device the calling thread is bound to.
pub trait DeviceTopology: Send + Sync {
    /// All devices workers may be placed on.
    fn devices(&self) -> Vec<DeviceId>;

    /// Bind the calling thread to `device`.
    fn bind_current_thread(&self, device: &DeviceId);

    /// The device the calling thread is bound to, if any.
    fn current_device(&self) -> Option<DeviceId>;
}

thread_local! {
    static BOUND_DEVICE: Cell<Option<DeviceId>> = const { Cell::new(None) };
}

fn bind_thread_local(device: &DeviceId) {
    BOUND_DEVICE.with(|bound| bound.set(Some(*device)));
}

fn thread_local_device() -> Option<DeviceId> {
    BOUND_DEVICE.with(|bound| bound.get())
}

/// Logical CPU devices with thread-local binding.
#[derive(Clone, Debug)]
pub struct CpuTopology {
    count: usize,
}

impl Default for CpuTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuTopology {
    /// A single `cpu:0` device.
    pub fn new() -> Self {
        Self { count: 1 }
    }

    /// `count` logical CPU devices.
    pub fn with_devices(count: usize) -> Self {
        Self { count }
    }

    /// One device per logical core.
    pub fn per_core() -> Self {
        Self::with_devices(num_cpus::get())
    }
}

impl DeviceTopology for CpuTopology {
    fn devices(&self) -> Vec<DeviceId> {
        (0..self.count).map(DeviceId::cpu).collect()
    }

    fn bind_current_thread(&self, device: &DeviceId) {
        bind_thread_local(device);
    }

    fn current_device(&self) -> Option<DeviceId> {
        thread_local_device()
    }
}

/// An explicit device list, e.g. taken from configuration.
#[derive(Clone, Debug)]
pub struct ListedTopology {
    devices: Vec<DeviceId>,
}

impl ListedTopology {
    pub fn new(devices: Vec<DeviceId>) -> Self {
        Self { devices }
    }
}

impl DeviceTopology for ListedTopology {
    fn devices(&self) -> Vec<DeviceId> {
        self.devices.clone()
    }

    fn bind_current_thread(&self, device: &DeviceId) {
        bind_thread_local(device);
    }

    fn current_device(&self) -> Option<DeviceId> {
        thread_local_device()
    }
}
