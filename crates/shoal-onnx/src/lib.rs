//! ONNX models served through Shoal, executed with `tract-onnx`.
//!
//! An [`OnnxLoader`] holds the serialized model and builds an independent
//! [`OnnxModel`] for every worker that asks for one.

pub use tract_onnx;

use anyhow::{bail, Context, Result};
use shoal_core::{
    device::DeviceId,
    model::{ModelLoader, NativeModel},
    signature::{ModelSignature, TensorSpec},
    tensor::{ElementType, Tensor, TensorMap},
};
use std::{io::Read, path::Path, sync::Arc};
use tract_onnx::prelude::*;

type TractTensor = tract_onnx::prelude::Tensor;

/// Shares one serialized ONNX model between the workers of a pool.
#[derive(Clone)]
pub struct OnnxLoader {
    bytes: Arc<[u8]>,
}

impl OnnxLoader {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            std::fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        Ok(Self::from_bytes(bytes))
    }

    /// Parse and optimize a fresh model instance.
    pub fn load(&self) -> Result<OnnxModel> {
        OnnxModel::from_reader(&mut &self.bytes[..])
    }
}

impl ModelLoader for OnnxLoader {
    fn load_model(&self, device: &DeviceId) -> Result<Box<dyn NativeModel>> {
        log::debug!("building onnx plan for {}", device);
        Ok(Box::new(self.load()?))
    }
}

/// A runnable tract plan together with its signature.
pub struct OnnxModel {
    plan: TypedSimplePlan<TypedModel>,
    signature: ModelSignature,
}

impl OnnxModel {
    /// Read an ONNX model from `reader`.
    pub fn from_reader(reader: &mut dyn Read) -> Result<Self> {
        let model = tract_onnx::onnx()
            .model_for_read(reader)
            .context("failed parsing onnx model")?;

        Self::from_typed(model.into_typed()?.into_decluttered()?)
    }

    /// Wrap an already typed model.
    pub fn from_typed(model: TypedModel) -> Result<Self> {
        let signature = signature_of(&model)?;
        let plan = model.into_optimized()?.into_runnable()?;

        Ok(Self { plan, signature })
    }
}

impl NativeModel for OnnxModel {
    fn signature(&self) -> Result<ModelSignature> {
        Ok(self.signature.clone())
    }

    fn infer(&mut self, inputs: &TensorMap) -> Result<TensorMap> {
        let mut tensors: TVec<TractTensor> = TVec::new();
        for spec in &self.signature.inputs {
            let tensor = inputs
                .get(&spec.name)
                .with_context(|| format!("no value for input {:?}", spec.name))?;
            tensors.push(to_tract(tensor)?);
        }

        let result = self.plan.run(tensors.into_iter().map(Into::into).collect())?;

        let mut outputs = TensorMap::new();
        for (spec, value) in self.signature.outputs.iter().zip(result.iter()) {
            outputs.insert(spec.name.clone(), from_tract(value)?);
        }

        Ok(outputs)
    }
}

fn clean_name(name: &str) -> String {
    let name = name.split(':').next().unwrap_or(name);
    name.strip_suffix("_0").unwrap_or(name).to_owned()
}

fn spec_for(name: String, fact: &TypedFact) -> Result<TensorSpec> {
    let element_type = element_type(fact.datum_type)?;
    let shape = fact
        .shape
        .iter()
        .map(|dim| dim.to_i64().ok().map(|v| v as usize))
        .collect();

    Ok(TensorSpec::new(name, element_type, shape))
}

/// Extract input and output names, element types and shapes. Symbolic
/// dimensions become dynamic.
pub fn signature_of(model: &TypedModel) -> Result<ModelSignature> {
    let mut inputs = vec![];
    for outlet in model.input_outlets()? {
        let name = clean_name(&model.node(outlet.node).name);
        inputs.push(spec_for(name, model.outlet_fact(*outlet)?)?);
    }

    let mut outputs = vec![];
    for outlet in model.output_outlets()? {
        let name = match model.outlet_labels.get(outlet) {
            Some(label) => clean_name(label),
            None => clean_name(&model.node(outlet.node).name),
        };
        outputs.push(spec_for(name, model.outlet_fact(*outlet)?)?);
    }

    Ok(ModelSignature::new(inputs, outputs))
}

// The only place tract type codes meet `ElementType`. Ordered like
// `ElementType`.
const DATUM_TYPES: [(ElementType, DatumType); 8] = [
    (ElementType::F32, DatumType::F32),
    (ElementType::F64, DatumType::F64),
    (ElementType::I8, DatumType::I8),
    (ElementType::I16, DatumType::I16),
    (ElementType::I32, DatumType::I32),
    (ElementType::I64, DatumType::I64),
    (ElementType::U8, DatumType::U8),
    (ElementType::Bool, DatumType::Bool),
];

fn element_type(datum_type: DatumType) -> Result<ElementType> {
    DATUM_TYPES
        .iter()
        .find(|(_, dt)| *dt == datum_type)
        .map(|(element_type, _)| *element_type)
        .with_context(|| format!("unsupported datum type {:?}", datum_type))
}

fn datum_type(element_type: ElementType) -> DatumType {
    DATUM_TYPES[element_type as usize].1
}

// Tract keeps elements in host order, which the little-endian codec matches.
fn to_tract(tensor: &Tensor) -> Result<TractTensor> {
    let bytes = tensor.to_le_bytes();

    #[allow(unsafe_code)]
    let converted = unsafe {
        TractTensor::from_raw_dt(datum_type(tensor.element_type()), tensor.shape(), &bytes)?
    };

    Ok(converted)
}

fn from_tract(tensor: &TractTensor) -> Result<Tensor> {
    let element_type = element_type(tensor.datum_type())?;
    Ok(Tensor::from_le_bytes(
        element_type,
        tensor.shape().to_vec(),
        tensor.as_bytes(),
    )?)
}
