// ONNX Runtime session construction with automatic hardware acceleration
// fallback. Shared by the detection service and its tests.

use anyhow::{Context, Result};
use ort::execution_providers::CPUExecutionProvider;
use ort::session::{builder::GraphOptimizationLevel, Session};
use tracing::{debug, info, warn};

#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

#[cfg(all(target_os = "macos", feature = "coreml"))]
use ort::execution_providers::CoreMLExecutionProvider;

#[cfg(all(target_os = "windows", feature = "directml"))]
use ort::execution_providers::DirectMLExecutionProvider;

/// Intra-op thread count for CPU inference.
///
/// Windows suffers from thread-synchronization overhead past ~6 threads, see
/// https://github.com/microsoft/onnxruntime/issues/3713
fn optimal_intra_op_threads() -> usize {
    let total_cores = num_cpus::get();

    #[cfg(target_os = "windows")]
    let optimal = std::cmp::min(6, total_cores).max(1);

    #[cfg(not(target_os = "windows"))]
    let optimal = total_cores.max(1);

    debug!(
        "CPU threads: {} total cores, using {} for inference",
        total_cores, optimal
    );
    optimal
}

/// Build a session for the tray detector model.
///
/// Tries acceleration providers in order (TensorRT → CUDA → CoreML →
/// DirectML → CPU), restricted to the ones compiled in via Cargo features.
/// Returns the backend name alongside the session so startup logs can report
/// the inference device.
pub fn build_session(
    model_bytes: &[u8],
    forced_backend: Option<&str>,
) -> Result<(String, Session)> {
    if let Some(backend) = forced_backend {
        if !backend.eq_ignore_ascii_case("auto") {
            info!("INFERENCE_BACKEND={}, forcing specific backend", backend);
            return try_forced_backend(backend, model_bytes);
        }
    }

    #[cfg(feature = "tensorrt")]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([TensorRTExecutionProvider::default().build()]))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(optimal_intra_op_threads()))
            .and_then(|b| b.commit_from_memory(model_bytes))
        {
            info!("Using TensorRT acceleration");
            return Ok(("TensorRT".to_string(), session));
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([CUDAExecutionProvider::default().build()]))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(optimal_intra_op_threads()))
            .and_then(|b| b.commit_from_memory(model_bytes))
        {
            info!("Using CUDA acceleration");
            return Ok(("CUDA".to_string(), session));
        }
    }

    #[cfg(all(target_os = "macos", feature = "coreml"))]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([CoreMLExecutionProvider::default().build()]))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(optimal_intra_op_threads()))
            .and_then(|b| b.commit_from_memory(model_bytes))
        {
            info!("Using CoreML acceleration");
            return Ok(("CoreML".to_string(), session));
        }
    }

    #[cfg(all(target_os = "windows", feature = "directml"))]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([DirectMLExecutionProvider::default().build()]))
            .and_then(|b| b.with_parallel_execution(false))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level1))
            .and_then(|b| b.with_intra_threads(optimal_intra_op_threads()))
            .and_then(|b| b.commit_from_memory(model_bytes))
        {
            info!("Using DirectML acceleration");
            return Ok(("DirectML".to_string(), session));
        }
    }

    let session = cpu_session(model_bytes)?;
    warn!("Using CPU-only inference (no GPU acceleration available)");
    Ok(("CPU".to_string(), session))
}

fn cpu_session(model_bytes: &[u8]) -> Result<Session> {
    Session::builder()
        .context("Failed to create ONNX session builder")?
        .with_execution_providers([CPUExecutionProvider::default().build()])
        .context("Failed to configure CPU execution provider")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("Failed to set graph optimization level")?
        .with_intra_threads(optimal_intra_op_threads())
        .context("Failed to configure intra-op threads")?
        .commit_from_memory(model_bytes)
        .context(
            "Failed to load detector ONNX model. This usually indicates model \
            file corruption or an incompatible ONNX opset version",
        )
}

fn try_forced_backend(backend: &str, model_bytes: &[u8]) -> Result<(String, Session)> {
    match backend.to_uppercase().as_str() {
        #[cfg(feature = "tensorrt")]
        "TENSORRT" => {
            let session = Session::builder()?
                .with_execution_providers([TensorRTExecutionProvider::default().build()])?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(optimal_intra_op_threads())?
                .commit_from_memory(model_bytes)
                .context("Failed to load model with TensorRT")?;
            Ok(("TensorRT (forced)".to_string(), session))
        }
        #[cfg(not(feature = "tensorrt"))]
        "TENSORRT" => {
            anyhow::bail!("TensorRT backend not available. Rebuild with: cargo build --features tensorrt")
        }

        #[cfg(feature = "cuda")]
        "CUDA" => {
            let session = Session::builder()?
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(optimal_intra_op_threads())?
                .commit_from_memory(model_bytes)
                .context("Failed to load model with CUDA")?;
            Ok(("CUDA (forced)".to_string(), session))
        }
        #[cfg(not(feature = "cuda"))]
        "CUDA" => {
            anyhow::bail!("CUDA backend not available. Rebuild with: cargo build --features cuda")
        }

        "CPU" => Ok(("CPU (forced)".to_string(), cpu_session(model_bytes)?)),

        other => {
            warn!("Unknown backend {:?}, falling back to auto-detection", other);
            build_session(model_bytes, None)
        }
    }
}
