/*!

# Shoal

Shoal serves native inference models from a fixed pool of worker
threads. Each worker owns one model replica; concurrent requests are
coalesced into batches and fanned back out to their callers.

## Shoal Core

Runtime-agnostic tensors, model signatures, and the traits a native
runtime implements to be served.

## Shoal Dispatch

The worker pool itself: a bounded queue, request batching, per-request
error isolation and orderly shutdown.

```no_run
use shoal::dispatch::{PoolConfig, ThreadPool};
use shoal::onnx::OnnxLoader;
use std::sync::Arc;

let loader = OnnxLoader::from_path("model.onnx")?;
let pool = ThreadPool::new(Arc::new(loader), PoolConfig::default().with_workers(4))?;
# let request = Default::default();
let response = pool.infer(request)?;
# let _ = response;
# Ok::<(), Box<dyn std::error::Error>>(())
```

## Shoal ONNX

Loads ONNX models with `tract-onnx` and converts tensors to and from
tract's representation.

*/

#![warn(rust_2018_idioms)]

pub use shoal_core as core;
pub use shoal_dispatch as dispatch;
pub use shoal_onnx as onnx;
