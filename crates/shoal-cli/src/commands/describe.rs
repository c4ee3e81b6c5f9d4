// Copyright © 2024, Embark Studios, all rights reserved.
// Created: 26 February 2024

use anyhow::Result;
use clap::Parser;
use shoal::core::prelude::{NativeModel, TensorSpec};
use shoal::onnx::OnnxLoader;
use std::path::PathBuf;

/// Print the inputs and outputs of a model.
#[derive(Parser, Debug)]
#[clap()]
pub(crate) struct DescribeArgs {
    /// The ONNX model file.
    file: PathBuf,

    /// Print the signature as JSON.
    #[clap(long)]
    json: bool,
}

fn format_shape(spec: &TensorSpec) -> String {
    let dims: Vec<_> = spec
        .shape
        .iter()
        .map(|dim| match dim {
            Some(dim) => dim.to_string(),
            None => "?".to_owned(),
        })
        .collect();

    format!("[{}]", dims.join(", "))
}

pub(super) fn describe(config: DescribeArgs) -> Result<()> {
    let model = OnnxLoader::from_path(&config.file)?.load()?;
    let signature = model.signature()?;

    if config.json {
        println!("{}", serde_json::to_string_pretty(&signature)?);
        return Ok(());
    }

    println!("Inputs:");
    for spec in &signature.inputs {
        println!("\t{:40}: {:5} {}", spec.name, spec.element_type, format_shape(spec));
    }

    println!("\nOutputs:");
    for spec in &signature.outputs {
        println!("\t{:40}: {:5} {}", spec.name, spec.element_type, format_shape(spec));
    }

    Ok(())
}
