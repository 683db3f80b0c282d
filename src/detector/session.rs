// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Inference session abstraction
//!
//! The lifecycle manager only sees [`InferenceBackend`] and
//! [`InferenceSession`]; [`OrtBackend`] is the ONNX Runtime implementation.
//! Sessions run on CPU so detection never competes with other GPU work.

use ndarray::ArrayView4;
use ort::execution_providers::CPUExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use tracing::{debug, info};

use super::error::DetectorError;
use super::variant::ModelVariant;

/// Default ONNX Runtime intra-op thread count
pub const DEFAULT_INTRA_THREADS: usize = 4;

/// Flattened first output of one inference run
///
/// The runtime's output buffers are released before this is returned, so
/// holding a `RawOutput` never pins runtime memory.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
    pub data: Vec<f32>,
    pub dims: Vec<usize>,
}

/// A compiled, runnable detector graph
pub trait InferenceSession: Send {
    /// Run one `[1, 3, S, S]` input through the graph
    fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<RawOutput, DetectorError>;
}

/// Compiles fetched weights into sessions
pub trait InferenceBackend: Send + Sync {
    fn compile(
        &self,
        bytes: &[u8],
        variant: ModelVariant,
    ) -> Result<Box<dyn InferenceSession>, DetectorError>;
}

/// ONNX Runtime backend (CPU execution provider)
#[derive(Debug, Clone)]
pub struct OrtBackend {
    intra_threads: usize,
}

impl Default for OrtBackend {
    fn default() -> Self {
        Self::new(DEFAULT_INTRA_THREADS)
    }
}

impl OrtBackend {
    pub fn new(intra_threads: usize) -> Self {
        Self {
            intra_threads: intra_threads.max(1),
        }
    }

    pub fn intra_threads(&self) -> usize {
        self.intra_threads
    }
}

impl InferenceBackend for OrtBackend {
    fn compile(
        &self,
        bytes: &[u8],
        variant: ModelVariant,
    ) -> Result<Box<dyn InferenceSession>, DetectorError> {
        if bytes.is_empty() {
            return Err(DetectorError::ModelCompileFailed(format!(
                "{} weights are empty",
                variant
            )));
        }

        info!("Compiling {} detector ({} bytes)", variant, bytes.len());

        let session = Session::builder()
            .map_err(|e| compile_err("Failed to create session builder", e))?
            .with_execution_providers([CPUExecutionProvider::default().build()])
            .map_err(|e| compile_err("Failed to set CPU execution provider", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| compile_err("Failed to set optimization level", e))?
            .with_intra_threads(self.intra_threads)
            .map_err(|e| compile_err("Failed to set intra threads", e))?
            .commit_from_memory(bytes)
            .map_err(|e| compile_err(&format!("Failed to load {} detector", variant), e))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| {
                DetectorError::ModelCompileFailed(format!("{} graph has no inputs", variant))
            })?;

        if session.outputs.is_empty() {
            return Err(DetectorError::ModelCompileFailed(format!(
                "{} graph has no outputs",
                variant
            )));
        }

        for input in &session.inputs {
            debug!("Detector input {}: {:?}", input.name, input.input_type);
        }
        for output in &session.outputs {
            debug!("Detector output {}: {:?}", output.name, output.output_type);
        }

        info!(
            "✅ {} detector compiled (input: {}, {}x{}, CPU-only)",
            variant,
            input_name,
            variant.input_size(),
            variant.input_size()
        );

        Ok(Box::new(OrtSession {
            session,
            input_name,
            variant,
        }))
    }
}

fn compile_err(step: &str, e: impl std::fmt::Display) -> DetectorError {
    DetectorError::ModelCompileFailed(format!("{}: {}", step, e))
}

/// ONNX Runtime session for one variant
pub struct OrtSession {
    session: Session,
    input_name: String,
    variant: ModelVariant,
}

impl std::fmt::Debug for OrtSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrtSession")
            .field("input_name", &self.input_name)
            .field("variant", &self.variant)
            .finish_non_exhaustive()
    }
}

impl InferenceSession for OrtSession {
    fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<RawOutput, DetectorError> {
        let shape = input.shape();
        let size = self.variant.input_size() as usize;
        if shape != [1, 3, size, size] {
            return Err(DetectorError::InvalidOutput(format!(
                "input shape {:?} does not match [1, 3, {}, {}]",
                shape, size, size
            )));
        }

        // ort needs an owned array
        let input_value = Value::from_array(input.to_owned())
            .map_err(|e| DetectorError::InvalidOutput(format!("Failed to create input tensor: {}", e)))?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input_value])
            .map_err(|e| DetectorError::InvalidOutput(format!("Detection inference failed: {}", e)))?;

        let raw = {
            let output_tensor = outputs[0]
                .try_extract_array::<f32>()
                .map_err(|e| {
                    DetectorError::InvalidOutput(format!("Failed to extract output tensor: {}", e))
                })?;
            RawOutput {
                dims: output_tensor.shape().to_vec(),
                data: output_tensor.iter().copied().collect(),
            }
        };
        drop(outputs);

        debug!("Detector output shape: {:?}", raw.dims);
        Ok(raw)
    }
}
