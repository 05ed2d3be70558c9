#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! wgpu render engine.
//!
//! Every adapter reported by wgpu becomes one `GpuEngine`. The compute
//! pipeline is built once per adapter in `GpuEngine::enumerate`; renders
//! reuse it, and the output/staging buffers are kept for the last frame size.

use std::sync::{mpsc, Mutex};

use engine_cpu::{Backend, EngineError, RenderEngine};
use fractal_core::{IterationField, RenderParams};
use futures::executor::block_on;

const WORKGROUP_SIZE: u32 = 8;

/// Uniform block mirrored by `Params` in `mandelbrot.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
struct GpuParams {
    width: u32,
    height: u32,
    max_iterations: u32,
    _pad0: u32,
    x_min: f32,
    y_max: f32,
    unit: f32,
    _pad1: f32,
}

impl From<&RenderParams> for GpuParams {
    fn from(params: &RenderParams) -> Self {
        let (x_min, y_max) = params.origin();
        Self {
            width: params.width,
            height: params.height,
            max_iterations: params.max_iterations,
            _pad0: 0,
            x_min: x_min as f32,
            y_max: y_max as f32,
            unit: params.unit as f32,
            _pad1: 0.0,
        }
    }
}

/// Per-size device buffers, rebuilt when the frame size changes.
struct FrameBuffers {
    width: u32,
    height: u32,
    size: u64,
    output: wgpu::Buffer,
    staging: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

impl FrameBuffers {
    fn fits(&self, params: &RenderParams) -> bool {
        self.width == params.width && self.height == params.height
    }
}

pub struct GpuEngine {
    info: wgpu::AdapterInfo,
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    params_buffer: wgpu::Buffer,
    frame: Mutex<Option<FrameBuffers>>,
}

impl GpuEngine {
    /// Initialise one engine per usable adapter.
    ///
    /// Fails with `Unavailable` when wgpu reports no adapters at all. Adapters
    /// that fail to initialise are logged and skipped.
    pub fn enumerate() -> Result<Vec<GpuEngine>, EngineError> {
        log::info!(target: "gpu_engine", "Initializing WGPU...");
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapters: Vec<_> = instance
            .enumerate_adapters(wgpu::Backends::PRIMARY)
            .into_iter()
            .collect();
        if adapters.is_empty() {
            return Err(EngineError::Unavailable(
                "no suitable GPU adapters found".to_string(),
            ));
        }

        let mut engines = Vec::with_capacity(adapters.len());
        for (i, adapter) in adapters.into_iter().enumerate() {
            let info = adapter.get_info();
            log::info!(
                target: "gpu_engine",
                "Initializing GPU adapter {}: {} (Backend: {:?})",
                i,
                info.name,
                info.backend
            );
            match block_on(Self::init(adapter, info.clone())) {
                Ok(engine) => engines.push(engine),
                Err(e) => log::warn!(target: "gpu_engine", "Skipping adapter {} ({}): {}", i, info.name, e),
            }
        }

        log::info!(target: "gpu_engine", "GPU engine initialized with {} devices", engines.len());
        Ok(engines)
    }

    async fn init(adapter: wgpu::Adapter, info: wgpu::AdapterInfo) -> Result<Self, EngineError> {
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Mandelbrot Device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
                ..Default::default()
            })
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Mandelbrot Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("mandelbrot.wgsl").into()),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Mandelbrot Pipeline"),
            layout: None,
            module: &shader,
            entry_point: Some("mandelbrot_main"),
            compilation_options: Default::default(),
            cache: None,
        });
        if let Some(err) = device.pop_error_scope().await {
            return Err(EngineError::KernelBuild(err.to_string()));
        }

        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Params Buffer"),
            size: std::mem::size_of::<GpuParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        log::debug!(target: "gpu_engine", "Pipeline compiled for {}: {:?}", info.name, info);

        Ok(Self {
            info,
            device,
            queue,
            pipeline,
            params_buffer,
            frame: Mutex::new(None),
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.info
    }

    fn allocate_frame(&self, width: u32, height: u32) -> Result<FrameBuffers, EngineError> {
        let size = u64::from(width) * u64::from(height) * 4;
        let limits = self.device.limits();
        if size > u64::from(limits.max_storage_buffer_binding_size) || size > limits.max_buffer_size
        {
            return Err(EngineError::OutOfMemory(format!(
                "{width}x{height} frame needs {size} bytes, device allows {}",
                limits.max_storage_buffer_binding_size
            )));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let output = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Counts Buffer"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            return Err(EngineError::OutOfMemory(err.to_string()));
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Mandelbrot Bind Group"),
            layout: &self.pipeline.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: output.as_entire_binding(),
                },
            ],
        });

        log::debug!(target: "gpu_engine", "Allocated {}x{} frame buffers on {}", width, height, self.info.name);

        Ok(FrameBuffers {
            width,
            height,
            size,
            output,
            staging,
            bind_group,
        })
    }
}

impl RenderEngine for GpuEngine {
    fn name(&self) -> &'static str {
        "gpu-wgpu"
    }

    fn backend(&self) -> Backend {
        Backend::Gpu
    }

    fn device_name(&self) -> String {
        format!("{} ({:?})", self.info.name, self.info.backend)
    }

    fn render(&self, params: &RenderParams) -> Result<IterationField, EngineError> {
        params.validate()?;

        let mut frame = self
            .frame
            .lock()
            .map_err(|_| EngineError::Dispatch("frame buffer lock poisoned".to_string()))?;
        let buffers = match frame.take() {
            Some(buffers) if buffers.fits(params) => frame.insert(buffers),
            _ => frame.insert(self.allocate_frame(params.width, params.height)?),
        };

        self.queue.write_buffer(
            &self.params_buffer,
            0,
            bytemuck::bytes_of(&GpuParams::from(params)),
        );

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Mandelbrot Encoder"),
            });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Mandelbrot Pass"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(&self.pipeline);
            cpass.set_bind_group(0, &buffers.bind_group, &[]);
            cpass.dispatch_workgroups(
                params.width.div_ceil(WORKGROUP_SIZE),
                params.height.div_ceil(WORKGROUP_SIZE),
                1,
            );
        }
        encoder.copy_buffer_to_buffer(&buffers.output, 0, &buffers.staging, 0, buffers.size);
        self.queue.submit(Some(encoder.finish()));

        let slice = buffers.staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| EngineError::Dispatch(e.to_string()))?;
        rx.recv()
            .map_err(|e| EngineError::Dispatch(e.to_string()))?
            .map_err(|e| EngineError::Dispatch(e.to_string()))?;

        let counts = {
            let data = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, u32>(&data).to_vec()
        };
        buffers.staging.unmap();

        IterationField::from_counts(params, counts)
            .ok_or_else(|| EngineError::Dispatch("gpu readback size mismatch".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fractal_core::render_reference;

    fn first_engine() -> Option<GpuEngine> {
        match GpuEngine::enumerate() {
            Ok(mut engines) if !engines.is_empty() => Some(engines.remove(0)),
            _ => {
                println!("No GPU adapter available, skipping test");
                None
            }
        }
    }

    #[test]
    fn params_block_matches_shader_layout() {
        assert_eq!(std::mem::size_of::<GpuParams>(), 32);

        let params = RenderParams::new(4, 4, Some(0.5)).with_center(0.0, 0.0);
        let gpu = GpuParams::from(&params);
        assert_eq!((gpu.width, gpu.height), (4, 4));
        assert_eq!(gpu.max_iterations, params.max_iterations);
        assert_eq!((gpu.x_min, gpu.y_max, gpu.unit), (-0.75, 0.75, 0.5));
    }

    #[test]
    fn gpu_render_matches_cpu_reference_closely() {
        let Some(engine) = first_engine() else {
            return;
        };
        let params = RenderParams::new(67, 45, None).with_max_iterations(64);
        let gpu = engine.render(&params).unwrap();
        let cpu = render_reference(&params).unwrap();

        assert_eq!((gpu.width, gpu.height), (67, 45));
        // f32 on the device vs f64 on the host: only boundary pixels may differ.
        let differing = gpu
            .counts
            .iter()
            .zip(&cpu.counts)
            .filter(|(a, b)| a != b)
            .count();
        assert!(
            differing * 20 < cpu.counts.len(),
            "{differing} of {} pixels differ",
            cpu.counts.len()
        );
    }

    #[test]
    fn gpu_render_is_repeatable_across_frame_sizes() {
        let Some(engine) = first_engine() else {
            return;
        };
        let small = RenderParams::new(16, 16, None);
        let large = RenderParams::new(40, 24, None);

        let a = engine.render(&small).unwrap();
        let b = engine.render(&large).unwrap();
        let c = engine.render(&small).unwrap();

        assert_eq!(a, c);
        assert_eq!(b.counts.len(), 40 * 24);
    }

    #[test]
    fn gpu_rejects_invalid_params() {
        let Some(engine) = first_engine() else {
            return;
        };
        let bad = RenderParams::new(16, 0, None);
        assert!(matches!(
            engine.render(&bad),
            Err(EngineError::InvalidParams(_))
        ));
    }
}
