// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 19 February 2024

/*!
A batched inference dispatcher: a fixed pool of worker threads, each
owning one replica of a native model, fed from a shared bounded queue.

Callers hand in named tensors and block until their outputs are ready.
In batched mode concurrent requests are coalesced into one queue entry
of up to `batch_limit` requests, which a single worker runs in one go
before fanning the results back out.

```no_run
use shoal_core::prelude::*;
use shoal_dispatch::{PoolConfig, ThreadPool};
use std::sync::Arc;

struct Echo;

impl NativeModel for Echo {
    fn signature(&self) -> anyhow::Result<ModelSignature> {
        Ok(ModelSignature::new(
            vec![TensorSpec::fixed("x", ElementType::F32, &[4])],
            vec![TensorSpec::fixed("x", ElementType::F32, &[4])],
        ))
    }

    fn infer(&mut self, inputs: &TensorMap) -> anyhow::Result<TensorMap> {
        Ok(inputs.clone())
    }
}

let loader = |_device: &DeviceId| -> anyhow::Result<Box<dyn NativeModel>> { Ok(Box::new(Echo)) };
let pool = ThreadPool::new(Arc::new(loader), PoolConfig::default().with_workers(2))?;

let mut request = TensorMap::new();
request.insert("x".to_owned(), Tensor::from_vec(vec![4], vec![1.0f32, 2.0, 3.0, 4.0])?);

let response = pool.infer(request)?;
assert_eq!(response["x"].as_slice::<f32>(), Some(&[1.0, 2.0, 3.0, 4.0][..]));

pool.shutdown();
# Ok::<(), Box<dyn std::error::Error>>(())
```

## Ordering

Batches leave the queue in the order they were created, and results
within a batch are delivered in the order requests were attached. Each
request resolves exactly once: with its outputs, its own error, or
[`DispatchError::ShuttingDown`] if the pool stopped before it ran.
 */

#![warn(rust_2018_idioms)]

mod config;
mod error;
mod observable;
mod pool;
mod provider;
mod queue;
mod timing;
mod worker;

#[doc(inline)]
pub use crate::config::{DispatchMode, PoolConfig, DEFAULT_BATCH_LIMIT, DEFAULT_QUEUE_LIMIT};
#[doc(inline)]
pub use crate::error::DispatchError;
pub use crate::observable::Ticket;
#[doc(inline)]
pub use crate::pool::ThreadPool;
pub use crate::worker::{WorkerState, WorkerStats};
