//! Render service for clmandelbrot.
//!
//! This crate ties the engines together:
//! - Device discovery across the CPU, wgpu and OpenCL backends (`DeviceRegistry`)
//! - Dispatch of a render to an enumerated device by id
//! - The timed per-device benchmark run (`bench`)

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod bench;

use std::fmt;
use std::path::PathBuf;

use anyhow::Context;

use engine_cpu::{Backend, Device, EngineError, ParallelCpuEngine, RenderEngine};
use engine_gpu::GpuEngine;
use engine_gpu_opencl::OpenClEngine;
use fractal_core::{PixelBuffer, RenderParams, DEFAULT_MAX_ITERATIONS};

pub use bench::{
    format_device_line, format_timing_line, render_once, run_benchmark, BenchReport, DeviceTiming,
};

/// Renders per device in a benchmark run.
pub const DEFAULT_ITERATIONS: u32 = 100;
pub const DEFAULT_WIDTH: u32 = 1024;
pub const DEFAULT_HEIGHT: u32 = 1024;
pub const DEFAULT_FILE_PREFIX: &str = "clmandelbrot";

/// Device enumeration plus render dispatch, the contract the benchmark runs against.
pub trait ComputeBackend {
    /// Enumerate devices. Ids are dense and start at 0.
    fn list_devices(&self) -> Result<Vec<Device>, EngineError>;

    /// Render and color one frame on the device with `device_id`.
    fn compute_fractal(
        &self,
        params: &RenderParams,
        device_id: usize,
    ) -> Result<PixelBuffer, EngineError>;
}

/// Which backends to enumerate and how to size the CPU engine.
#[derive(Clone, Debug, Default)]
pub struct DiscoveryConfig {
    /// Backends to enumerate (None = every backend compiled in, failures skipped).
    /// When set, each listed backend must initialise and yield a device.
    pub backends: Option<Vec<Backend>>,
    /// Worker threads for the CPU engine (None = all logical CPUs)
    pub cpu_workers: Option<usize>,
}

impl DiscoveryConfig {
    fn wants(&self, backend: Backend) -> bool {
        self.backends
            .as_ref()
            .map_or(true, |list| list.contains(&backend))
    }

    fn required(&self) -> bool {
        self.backends.is_some()
    }
}

impl fmt::Display for DiscoveryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backends = match &self.backends {
            Some(list) => list
                .iter()
                .map(Backend::as_str)
                .collect::<Vec<_>>()
                .join(","),
            None => "auto".to_string(),
        };
        let workers = self
            .cpu_workers
            .map_or_else(|| "auto".to_string(), |n| n.to_string());
        write!(f, "backends={backends} cpu_workers={workers}")
    }
}

/// Settings for one benchmark run.
#[derive(Clone, Debug)]
pub struct BenchConfig {
    pub width: u32,
    pub height: u32,
    /// Complex-plane units per pixel (None = fit a 2.0 span into the shorter side)
    pub unit: Option<f64>,
    pub max_iterations: u32,
    /// Renders per device inside the timed batch
    pub iterations: u32,
    pub output_dir: PathBuf,
    pub file_prefix: String,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            unit: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            iterations: DEFAULT_ITERATIONS,
            output_dir: PathBuf::from("."),
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
        }
    }
}

impl BenchConfig {
    pub fn render_params(&self) -> RenderParams {
        RenderParams::new(self.width, self.height, self.unit).with_max_iterations(self.max_iterations)
    }

    /// Check the run settings and return the render parameters.
    ///
    /// Cheap; callers run it before device discovery so bad input never
    /// pays for pipeline compilation.
    pub fn validate(&self) -> anyhow::Result<RenderParams> {
        if self.iterations == 0 {
            anyhow::bail!("iterations must be at least 1");
        }
        let params = self.render_params();
        params.validate().context("invalid render parameters")?;
        Ok(params)
    }

    /// `<output_dir>/<prefix><id>.png`
    pub fn output_path(&self, device_id: usize) -> PathBuf {
        self.output_dir
            .join(format!("{}{}.png", self.file_prefix, device_id))
    }
}

impl fmt::Display for BenchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self.render_params();
        write!(
            f,
            "{}x{} unit={} max_iterations={} iterations={} output={}",
            self.width,
            self.height,
            params.unit,
            self.max_iterations,
            self.iterations,
            self.output_path(0)
                .with_file_name(format!("{}<id>.png", self.file_prefix))
                .display()
        )
    }
}

/// Enumerated devices, each bound to its engine.
pub struct DeviceRegistry {
    engines: Vec<Box<dyn RenderEngine>>,
    devices: Vec<Device>,
}

impl DeviceRegistry {
    /// Wrap already-built engines. Ids follow the order of `engines`.
    pub fn from_engines(engines: Vec<Box<dyn RenderEngine>>) -> Self {
        let devices = engines
            .iter()
            .enumerate()
            .map(|(id, engine)| Device {
                id,
                name: engine.device_name(),
                backend: engine.backend(),
            })
            .collect();
        Self { engines, devices }
    }

    /// Enumerate devices: CPU first, then wgpu adapters, then OpenCL devices.
    pub fn discover(config: &DiscoveryConfig) -> Result<Self, EngineError> {
        let mut engines: Vec<Box<dyn RenderEngine>> = Vec::new();

        if config.wants(Backend::Cpu) {
            let cpu = ParallelCpuEngine::new(config.cpu_workers);
            metrics::set_cpu_workers(cpu.workers() as i64);
            engines.push(Box::new(cpu));
        }
        if config.wants(Backend::Gpu) {
            collect_backend(Backend::Gpu, GpuEngine::enumerate(), config.required(), &mut engines)?;
        }
        if config.wants(Backend::OpenCl) {
            collect_backend(
                Backend::OpenCl,
                OpenClEngine::enumerate(),
                config.required(),
                &mut engines,
            )?;
        }

        let registry = Self::from_engines(engines);
        metrics::set_devices(registry.devices.len() as i64);
        for device in &registry.devices {
            log::info!("Device #{} [{}] {}", device.id, device.backend, device.name);
        }
        Ok(registry)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    pub fn engine(&self, device_id: usize) -> Result<&dyn RenderEngine, EngineError> {
        self.engines
            .get(device_id)
            .map(|engine| engine.as_ref())
            .ok_or(EngineError::InvalidDevice {
                id: device_id,
                available: self.engines.len(),
            })
    }

    /// Render with the default centre and iteration cap.
    pub fn render(
        &self,
        width: u32,
        height: u32,
        unit: Option<f64>,
        device_id: usize,
    ) -> Result<PixelBuffer, EngineError> {
        self.compute_fractal(&RenderParams::new(width, height, unit), device_id)
    }
}

impl ComputeBackend for DeviceRegistry {
    fn list_devices(&self) -> Result<Vec<Device>, EngineError> {
        Ok(self.devices.clone())
    }

    fn compute_fractal(
        &self,
        params: &RenderParams,
        device_id: usize,
    ) -> Result<PixelBuffer, EngineError> {
        params.validate()?;
        self.engine(device_id)?.render_image(params)
    }
}

fn collect_backend<E: RenderEngine + 'static>(
    backend: Backend,
    result: Result<Vec<E>, EngineError>,
    required: bool,
    engines: &mut Vec<Box<dyn RenderEngine>>,
) -> Result<(), EngineError> {
    match result {
        Ok(found) if found.is_empty() && required => Err(EngineError::Unavailable(format!(
            "no {backend} devices found"
        ))),
        Ok(found) => {
            log::debug!("{} backend: {} device(s)", backend, found.len());
            engines.extend(
                found
                    .into_iter()
                    .map(|engine| Box::new(engine) as Box<dyn RenderEngine>),
            );
            Ok(())
        }
        Err(e) if required => Err(e),
        Err(e) => {
            log::warn!("{} backend unavailable: {}", backend, e);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_cpu::BaselineCpuEngine;

    fn cpu_registry() -> DeviceRegistry {
        DeviceRegistry::from_engines(vec![
            Box::new(BaselineCpuEngine::new()),
            Box::new(ParallelCpuEngine::new(Some(3))),
        ])
    }

    #[test]
    fn registry_assigns_dense_ids_in_order() {
        let registry = cpu_registry();
        let devices = registry.list_devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, 0);
        assert_eq!(devices[0].name, "CPU (1 thread)");
        assert_eq!(devices[1].id, 1);
        assert_eq!(devices[1].name, "CPU (3 threads)");
        assert!(devices.iter().all(|d| d.backend == Backend::Cpu));
    }

    #[test]
    fn devices_render_identical_images() {
        let registry = cpu_registry();
        let a = registry.render(48, 32, None, 0).unwrap();
        let b = registry.render(48, 32, None, 1).unwrap();
        assert_eq!(a, b);
        assert_eq!((a.width(), a.height()), (48, 32));
    }

    #[test]
    fn unknown_device_id_is_rejected() {
        let registry = cpu_registry();
        let err = registry.render(8, 8, None, 2).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidDevice {
                id: 2,
                available: 2
            }
        ));
    }

    #[test]
    fn params_are_checked_before_device_lookup() {
        let registry = cpu_registry();
        let err = registry.render(8, 8, Some(0.0), 99).unwrap_err();
        assert!(matches!(err, EngineError::InvalidParams(_)));
    }

    #[test]
    fn discover_cpu_only() {
        let config = DiscoveryConfig {
            backends: Some(vec![Backend::Cpu]),
            cpu_workers: Some(2),
        };
        let registry = DeviceRegistry::discover(&config).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.devices()[0].name, "CPU (2 threads)");
    }

    #[test]
    fn discover_with_no_backends_is_empty() {
        let config = DiscoveryConfig {
            backends: Some(Vec::new()),
            cpu_workers: None,
        };
        let registry = DeviceRegistry::discover(&config).unwrap();
        assert!(registry.is_empty());
    }

    #[cfg(not(feature = "opencl"))]
    #[test]
    fn required_backend_failure_propagates() {
        let config = DiscoveryConfig {
            backends: Some(vec![Backend::OpenCl]),
            cpu_workers: None,
        };
        assert!(matches!(
            DeviceRegistry::discover(&config),
            Err(EngineError::Unavailable(_))
        ));
    }

    #[test]
    fn config_defaults_reproduce_example_run() {
        let config = BenchConfig::default();
        assert_eq!(config.iterations, 100);
        let params = config.render_params();
        assert_eq!((params.width, params.height), (1024, 1024));
        assert_eq!(params.unit, 1.0 / 512.0);
        assert_eq!(config.output_path(3), PathBuf::from("./clmandelbrot3.png"));
    }

    #[test]
    fn config_validation() {
        assert!(BenchConfig::default().validate().is_ok());

        let no_iterations = BenchConfig {
            iterations: 0,
            ..BenchConfig::default()
        };
        assert!(no_iterations
            .validate()
            .unwrap_err()
            .to_string()
            .contains("iterations"));

        let no_width = BenchConfig {
            width: 0,
            ..BenchConfig::default()
        };
        assert!(no_width.validate().is_err());

        let bad_unit = BenchConfig {
            unit: Some(-1.0),
            ..BenchConfig::default()
        };
        assert!(bad_unit.validate().is_err());
    }

    #[test]
    fn config_display_is_one_line() {
        let text = BenchConfig::default().to_string();
        assert!(!text.contains('\n'));
        assert!(text.contains("1024x1024"));
        assert!(text.contains("iterations=100"));

        let discovery = DiscoveryConfig {
            backends: Some(vec![Backend::Cpu, Backend::Gpu]),
            cpu_workers: Some(4),
        };
        assert_eq!(discovery.to_string(), "backends=cpu,gpu cpu_workers=4");
    }
}
