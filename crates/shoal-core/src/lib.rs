/*!

# Shoal Core

This crate contains the runtime-agnostic vocabulary shared by the Shoal
dispatcher and its backends: named tensors, the element-type table,
model signatures and the traits a native runtime implements to be
served from a worker pool.

 */

#![warn(rust_2018_idioms)]

pub mod device;
pub mod model;
pub mod signature;
pub mod tensor;

/// Most core utilities are re-exported here.
pub mod prelude {
    pub use super::device::{CpuTopology, DeviceId, DeviceKind, DeviceTopology, ListedTopology};
    pub use super::model::{ModelLoader, NativeModel};
    pub use super::signature::{ModelSignature, SignatureError, TensorSpec};
    pub use super::tensor::{Element, ElementType, Tensor, TensorData, TensorError, TensorMap};
}
