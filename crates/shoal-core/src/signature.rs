// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 13 February 2024

use crate::tensor::{ElementType, TensorMap};
use serde::{Deserialize, Serialize};

/// Reasons a request does not fit a [`ModelSignature`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("missing required input {0:?}")]
    MissingInput(String),

    #[error("key doesn't match an input: {0:?}")]
    UnknownInput(String),

    #[error("input {name:?} has element type {actual} but the model expects {expected}")]
    TypeMismatch {
        name: String,
        expected: ElementType,
        actual: ElementType,
    },

    #[error("input {name:?} has shape {actual:?} but the model expects {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<Option<usize>>,
        actual: Vec<usize>,
    },
}

/// Name, element type and shape of one model input or output. `None`
/// marks a dynamic dimension.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub element_type: ElementType,
    pub shape: Vec<Option<usize>>,
}

impl TensorSpec {
    pub fn new(
        name: impl Into<String>,
        element_type: ElementType,
        shape: Vec<Option<usize>>,
    ) -> Self {
        Self {
            name: name.into(),
            element_type,
            shape,
        }
    }

    /// A spec where every dimension is known.
    pub fn fixed(name: impl Into<String>, element_type: ElementType, shape: &[usize]) -> Self {
        Self::new(name, element_type, shape.iter().copied().map(Some).collect())
    }

    /// Whether a tensor of `shape` fits this spec.
    pub fn accepts_shape(&self, shape: &[usize]) -> bool {
        self.shape.len() == shape.len()
            && self
                .shape
                .iter()
                .zip(shape)
                .all(|(expected, actual)| expected.map_or(true, |dim| dim == *actual))
    }

    /// The shape with dynamic dimensions replaced by `fill`.
    pub fn concrete_shape(&self, fill: usize) -> Vec<usize> {
        self.shape.iter().map(|dim| dim.unwrap_or(fill)).collect()
    }
}

/// The `ModelSignature` describes the inputs and outputs for a model.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSignature {
    /// The named model inputs, in the order the runtime expects them.
    pub inputs: Vec<TensorSpec>,

    /// The named model outputs.
    pub outputs: Vec<TensorSpec>,
}

impl ModelSignature {
    pub fn new(inputs: Vec<TensorSpec>, outputs: Vec<TensorSpec>) -> Self {
        Self { inputs, outputs }
    }

    pub fn input(&self, name: &str) -> Option<&TensorSpec> {
        self.inputs.iter().find(|spec| spec.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&TensorSpec> {
        self.outputs.iter().find(|spec| spec.name == name)
    }

    /// Check that `request` supplies exactly the declared inputs with
    /// matching element types and shapes. Element types must match
    /// exactly; nothing is converted.
    pub fn validate_request(&self, request: &TensorMap) -> Result<(), SignatureError> {
        if let Some(missing) = self
            .inputs
            .iter()
            .find(|spec| !request.contains_key(&spec.name))
        {
            return Err(SignatureError::MissingInput(missing.name.clone()));
        }

        if let Some(unknown) = request
            .keys()
            .filter(|name| self.input(name).is_none())
            .min()
        {
            return Err(SignatureError::UnknownInput(unknown.clone()));
        }

        for spec in &self.inputs {
            let tensor = &request[&spec.name];

            if tensor.element_type() != spec.element_type {
                return Err(SignatureError::TypeMismatch {
                    name: spec.name.clone(),
                    expected: spec.element_type,
                    actual: tensor.element_type(),
                });
            }

            if !spec.accepts_shape(tensor.shape()) {
                return Err(SignatureError::ShapeMismatch {
                    name: spec.name.clone(),
                    expected: spec.shape.clone(),
                    actual: tensor.shape().to_vec(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ModelSignature, SignatureError, TensorSpec};
    use crate::tensor::{ElementType, Tensor, TensorMap};

    fn signature() -> ModelSignature {
        ModelSignature::new(
            vec![
                TensorSpec::new("obs", ElementType::F32, vec![None, Some(3)]),
                TensorSpec::fixed("mask", ElementType::Bool, &[3]),
            ],
            vec![TensorSpec::new("out", ElementType::F32, vec![None, Some(2)])],
        )
    }

    fn request() -> TensorMap {
        let mut request = TensorMap::new();
        request.insert(
            "obs".to_owned(),
            Tensor::from_vec(vec![2, 3], vec![0.0f32; 6]).unwrap(),
        );
        request.insert(
            "mask".to_owned(),
            Tensor::from_vec(vec![3], vec![true; 3]).unwrap(),
        );
        request
    }

    #[test]
    fn accepts_dynamic_batch_dimension() {
        assert_eq!(signature().validate_request(&request()), Ok(()));
    }

    #[test]
    fn missing_input() {
        let mut request = request();
        request.remove("mask");
        assert_eq!(
            signature().validate_request(&request),
            Err(SignatureError::MissingInput("mask".to_owned()))
        );
    }

    #[test]
    fn unknown_input() {
        let mut request = request();
        request.insert("extra".to_owned(), Tensor::scalar(1.0f32));
        assert_eq!(
            signature().validate_request(&request),
            Err(SignatureError::UnknownInput("extra".to_owned()))
        );
    }

    #[test]
    fn no_silent_casts() {
        let mut request = request();
        request.insert(
            "obs".to_owned(),
            Tensor::from_vec(vec![1, 3], vec![0.0f64; 3]).unwrap(),
        );
        assert_eq!(
            signature().validate_request(&request),
            Err(SignatureError::TypeMismatch {
                name: "obs".to_owned(),
                expected: ElementType::F32,
                actual: ElementType::F64,
            })
        );
    }

    #[test]
    fn static_dimension_must_match() {
        let mut request = request();
        request.insert(
            "obs".to_owned(),
            Tensor::from_vec(vec![1, 4], vec![0.0f32; 4]).unwrap(),
        );
        assert!(matches!(
            signature().validate_request(&request),
            Err(SignatureError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn concrete_shape_fills_dynamic_dims() {
        let spec = TensorSpec::new("obs", ElementType::F32, vec![None, Some(3)]);
        assert_eq!(spec.concrete_shape(1), vec![1, 3]);
    }
}
