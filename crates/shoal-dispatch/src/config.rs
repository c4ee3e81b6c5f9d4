// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 19 February 2024

use crate::DispatchError;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

pub const DEFAULT_BATCH_LIMIT: usize = 32;
pub const DEFAULT_QUEUE_LIMIT: usize = 64;

/// How requests reach the workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Every request is its own queue entry.
    Sequential,

    /// Concurrent requests are coalesced into shared queue entries.
    #[default]
    Batched,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(DispatchMode::Sequential),
            "batched" => Ok(DispatchMode::Batched),
            _ => Err(format!("unknown dispatch mode: {}", s)),
        }
    }
}

/// Construction parameters for a [`ThreadPool`](crate::ThreadPool).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Number of workers. `None` means one per device in the topology.
    pub workers: Option<usize>,

    /// Maximum number of requests coalesced into one batch.
    pub batch_limit: usize,

    /// Capacity of the shared queue, in batches.
    pub queue_limit: usize,

    pub mode: DispatchMode,

    /// How long a producer may wait for queue space. `None` waits
    /// indefinitely.
    #[serde(rename = "enqueue_timeout_ms", with = "millis")]
    pub enqueue_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: None,
            batch_limit: DEFAULT_BATCH_LIMIT,
            queue_limit: DEFAULT_QUEUE_LIMIT,
            mode: DispatchMode::default(),
            enqueue_timeout: None,
        }
    }
}

impl PoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit;
        self
    }

    pub fn with_queue_limit(mut self, queue_limit: usize) -> Self {
        self.queue_limit = queue_limit;
        self
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_enqueue_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    /// Reject parameters no pool can run with.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.workers == Some(0) {
            return Err(DispatchError::InvalidConfig("workers must be at least 1"));
        }

        if self.batch_limit == 0 {
            return Err(DispatchError::InvalidConfig("batch_limit must be at least 1"));
        }

        if self.queue_limit == 0 {
            return Err(DispatchError::InvalidConfig("queue_limit must be at least 1"));
        }

        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value
            .map(|duration| duration.as_millis() as u64)
            .serialize(serializer)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
