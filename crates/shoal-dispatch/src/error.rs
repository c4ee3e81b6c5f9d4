// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 19 February 2024

use shoal_core::signature::SignatureError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can be returned by the dispatcher.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("the device topology lists no devices")]
    NoDevices,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("worker {worker} failed to load its model: {error:#}")]
    ModelLoad { worker: usize, error: anyhow::Error },

    #[error("request rejected: {0}")]
    Rejected(#[from] SignatureError),

    #[error("inference failed: {0:#}")]
    Inference(anyhow::Error),

    #[error("timed out after {0:?} waiting for queue space")]
    QueueFull(Duration),

    #[error("the pool is shutting down")]
    ShuttingDown,

    #[error("the request was dropped before it produced a result")]
    Abandoned,
}
