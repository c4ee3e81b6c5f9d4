// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 27 February 2024

use shoal_core::prelude::{DeviceId, ElementType, ModelLoader, NativeModel, Tensor, TensorMap};
use shoal_dispatch::{DispatchError, PoolConfig, ThreadPool};
use shoal_onnx::{signature_of, OnnxLoader, OnnxModel};
use std::sync::Arc;
use tract_onnx::prelude::*;

fn identity(shape: &[usize]) -> TypedModel {
    let mut model = TypedModel::default();
    let source = model
        .add_source("obs", f32::fact(shape.iter().copied()))
        .unwrap();
    model.set_output_outlets(&[source]).unwrap();
    model
}

fn request(values: Vec<f32>) -> TensorMap {
    let mut map = TensorMap::new();
    let len = values.len();
    map.insert("obs".to_owned(), Tensor::from_vec(vec![len], values).unwrap());
    map
}

#[test]
fn test_signature_from_typed_model() {
    let signature = signature_of(&identity(&[2])).unwrap();

    assert_eq!(signature.inputs.len(), 1);
    assert_eq!(signature.inputs[0].name, "obs");
    assert_eq!(signature.inputs[0].element_type, ElementType::F32);
    assert_eq!(signature.inputs[0].shape, vec![Some(2)]);
    assert_eq!(signature.outputs[0].shape, vec![Some(2)]);
}

#[test]
fn test_symbolic_dims_are_dynamic() {
    let mut model = TypedModel::default();
    let batch = model.symbols.sym("N");
    let source = model
        .add_source("obs", f32::fact([batch.to_dim(), 3usize.to_dim()]))
        .unwrap();
    model.set_output_outlets(&[source]).unwrap();

    let signature = signature_of(&model).unwrap();
    assert_eq!(signature.inputs[0].shape, vec![None, Some(3)]);
}

#[test]
fn test_infer_identity() {
    let mut model = OnnxModel::from_typed(identity(&[2])).unwrap();
    let out = model.infer(&request(vec![0.5, -1.0])).unwrap();
    assert_eq!(out["obs"].as_slice::<f32>(), Some(&[0.5, -1.0][..]));
}

#[test]
fn test_missing_input_is_an_error() {
    let mut model = OnnxModel::from_typed(identity(&[2])).unwrap();
    assert!(model.infer(&TensorMap::new()).is_err());
}

#[test]
fn test_garbage_bytes_fail_to_load() {
    let loader = OnnxLoader::from_bytes(vec![0xde, 0xad, 0xbe, 0xef]);
    assert!(loader.load_model(&DeviceId::cpu(0)).is_err());
}

#[test]
fn test_pool_rejects_wrong_shape() {
    let loader = |_: &DeviceId| -> anyhow::Result<Box<dyn NativeModel>> {
        Ok(Box::new(OnnxModel::from_typed(identity(&[2]))?))
    };
    let pool = ThreadPool::new(Arc::new(loader), PoolConfig::default().with_workers(2)).unwrap();

    let out = pool.infer(request(vec![1.0, 2.0])).unwrap();
    assert_eq!(out["obs"].as_slice::<f32>(), Some(&[1.0, 2.0][..]));

    assert!(matches!(
        pool.infer(request(vec![1.0, 2.0, 3.0])),
        Err(DispatchError::Rejected(_))
    ));
}
