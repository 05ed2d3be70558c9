#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Render engine trait, device descriptors and CPU engines.
//!
//! This crate defines the `RenderEngine` trait so the service layer can
//! enumerate and drive compute devices without knowing which backend sits
//! behind them, plus two CPU implementations:
//! - `BaselineCpuEngine`: single-threaded scan using the reference path in
//!   `fractal-core`. Intended as the correctness reference.
//! - `ParallelCpuEngine`: splits the frame into row bands, one per worker
//!   thread. This is the CPU device exposed to users.
//!
//! GPU engines (wgpu, OpenCL) live in their own crates and implement the same trait.

use std::fmt;
use std::thread;

use fractal_core::{fill_rows, IterationField, ParamsError, PixelBuffer, RenderParams};
use thiserror::Error;

/// Compute backend a device belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Backend {
    Cpu,
    Gpu,
    OpenCl,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Cpu => "cpu",
            Backend::Gpu => "gpu",
            Backend::OpenCl => "opencl",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An enumerated compute device.
///
/// `id` is assigned by the enumerator: dense, starting at 0, in enumeration order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Device {
    pub id: usize,
    pub name: String,
    pub backend: Backend,
}

/// Errors raised while enumerating devices or dispatching renders.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("compute backend unavailable: {0}")]
    Unavailable(String),
    #[error("invalid device id {id} ({available} devices enumerated)")]
    InvalidDevice { id: usize, available: usize },
    #[error(transparent)]
    InvalidParams(#[from] ParamsError),
    #[error("kernel build failed: {0}")]
    KernelBuild(String),
    #[error("device out of memory: {0}")]
    OutOfMemory(String),
    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

/// Abstract render engine bound to one compute device.
///
/// Implementations compile whatever kernel they need when constructed, so
/// repeated `render` calls only pay for the dispatch itself.
pub trait RenderEngine: Send + Sync {
    /// Engine kind, for logs and metrics.
    fn name(&self) -> &'static str;

    fn backend(&self) -> Backend;

    /// Human-readable device name as reported by the driver or OS.
    fn device_name(&self) -> String;

    /// Compute escape counts for the whole frame.
    ///
    /// Implementations must validate `params` before touching the device and
    /// return `EngineError::InvalidParams` for rejected input.
    fn render(&self, params: &RenderParams) -> Result<IterationField, EngineError>;

    /// Render and color a frame with the shared palette.
    fn render_image(&self, params: &RenderParams) -> Result<PixelBuffer, EngineError> {
        Ok(self.render(params)?.colorize())
    }
}

/// Baseline CPU engine.
///
/// Scans every pixel on the calling thread.
#[derive(Default)]
pub struct BaselineCpuEngine;

impl BaselineCpuEngine {
    pub fn new() -> Self {
        Self
    }
}

impl RenderEngine for BaselineCpuEngine {
    fn name(&self) -> &'static str {
        "cpu-baseline"
    }

    fn backend(&self) -> Backend {
        Backend::Cpu
    }

    fn device_name(&self) -> String {
        "CPU (1 thread)".to_string()
    }

    fn render(&self, params: &RenderParams) -> Result<IterationField, EngineError> {
        Ok(fractal_core::render_reference(params)?)
    }
}

/// Multi-threaded CPU engine.
///
/// The frame is cut into contiguous row bands, one per worker, rendered on
/// scoped threads and written straight into the shared output buffer.
pub struct ParallelCpuEngine {
    workers: usize,
}

impl Default for ParallelCpuEngine {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ParallelCpuEngine {
    /// `workers = None` uses every logical CPU. Zero is bumped to one.
    pub fn new(workers: Option<usize>) -> Self {
        let workers = workers.unwrap_or_else(num_cpus::get).max(1);
        log::debug!(target: "engine_cpu", "parallel cpu engine with {workers} workers");
        Self { workers }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl RenderEngine for ParallelCpuEngine {
    fn name(&self) -> &'static str {
        "cpu-parallel"
    }

    fn backend(&self) -> Backend {
        Backend::Cpu
    }

    fn device_name(&self) -> String {
        match self.workers {
            1 => "CPU (1 thread)".to_string(),
            n => format!("CPU ({n} threads)"),
        }
    }

    fn render(&self, params: &RenderParams) -> Result<IterationField, EngineError> {
        params.validate()?;

        let width = params.width as usize;
        let height = params.height;
        let bands = self.workers.min(height as usize).max(1);
        let rows_per_band = (height as usize).div_ceil(bands);

        let mut counts = vec![0u32; params.pixel_count()];
        thread::scope(|scope| {
            for (band, out) in counts.chunks_mut(rows_per_band * width).enumerate() {
                let first = (band * rows_per_band) as u32;
                let last = first + (out.len() / width) as u32;
                scope.spawn(move || fill_rows(params, first..last, out));
            }
        });

        IterationField::from_counts(params, counts)
            .ok_or_else(|| EngineError::Dispatch("cpu output size mismatch".to_string()))
    }
}
