use std::sync::Mutex;

use engine_cpu::{Backend, EngineError, RenderEngine};
use fractal_core::{IterationField, RenderParams};
use ocl::flags::MemFlags;
use ocl::{Buffer, Context, Device, Kernel, Platform, Program, Queue};

const KERNEL_SRC: &str = include_str!("mandelbrot.cl");
const KERNEL_NAME: &str = "mandelbrot";

/// Output buffer for the last frame, reused while the pixel count is unchanged.
struct FrameBuffer {
    len: usize,
    counts: Buffer<u32>,
}

pub struct OpenClEngine {
    device: Device,
    device_name: String,
    queue: Queue,
    program: Program,
    frame: Mutex<Option<FrameBuffer>>,
}

impl OpenClEngine {
    /// Build one engine per device across all platforms.
    ///
    /// Fails with `Unavailable` when no platform is installed. Devices whose
    /// context or program fails to build are logged and skipped.
    pub fn enumerate() -> Result<Vec<OpenClEngine>, EngineError> {
        let platforms = Platform::list();
        if platforms.is_empty() {
            return Err(EngineError::Unavailable(
                "no OpenCL platforms found".to_string(),
            ));
        }

        let mut engines = Vec::new();
        for platform in platforms {
            let platform_name = platform.name().unwrap_or_else(|_| "Unknown".into());
            let devices = match Device::list_all(platform) {
                Ok(devices) => devices,
                Err(e) => {
                    log::warn!(target: "opencl_engine", "Skipping platform {}: {}", platform_name, e);
                    continue;
                }
            };
            log::info!(
                target: "opencl_engine",
                "OpenCL platform {}: {} device(s)",
                platform_name,
                devices.len()
            );

            for device in devices {
                match Self::with_device(platform, device) {
                    Ok(engine) => engines.push(engine),
                    Err(e) => log::warn!(target: "opencl_engine", "Skipping device on {}: {}", platform_name, e),
                }
            }
        }

        log::info!(target: "opencl_engine", "OpenCL engine initialized with {} devices", engines.len());
        Ok(engines)
    }

    /// Create a context, queue and built program for one device.
    pub fn with_device(platform: Platform, device: Device) -> Result<Self, EngineError> {
        let device_name = device.name().unwrap_or_else(|_| "Unknown".into());

        let context = Context::builder()
            .platform(platform)
            .devices(device)
            .build()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        let queue = Queue::new(&context, device, None)
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        let program = Program::builder()
            .devices(device)
            .src(KERNEL_SRC)
            .build(&context)
            .map_err(|e| EngineError::KernelBuild(e.to_string()))?;

        log::debug!(target: "opencl_engine", "Program built for {}", device_name);

        Ok(Self {
            device,
            device_name,
            queue,
            program,
            frame: Mutex::new(None),
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn allocate_frame(&self, len: usize) -> Result<FrameBuffer, EngineError> {
        let counts = Buffer::<u32>::builder()
            .queue(self.queue.clone())
            .flags(MemFlags::new().write_only())
            .len(len)
            .build()
            .map_err(|e| EngineError::OutOfMemory(e.to_string()))?;
        log::debug!(target: "opencl_engine", "Allocated {} pixel buffer on {}", len, self.device_name);
        Ok(FrameBuffer { len, counts })
    }
}

impl RenderEngine for OpenClEngine {
    fn name(&self) -> &'static str {
        "gpu-opencl"
    }

    fn backend(&self) -> Backend {
        Backend::OpenCl
    }

    fn device_name(&self) -> String {
        self.device_name.clone()
    }

    fn render(&self, params: &RenderParams) -> Result<IterationField, EngineError> {
        params.validate()?;

        let len = params.pixel_count();
        let mut frame = self
            .frame
            .lock()
            .map_err(|_| EngineError::Dispatch("frame buffer lock poisoned".to_string()))?;
        let buffer = match frame.take() {
            Some(buffer) if buffer.len == len => frame.insert(buffer),
            _ => frame.insert(self.allocate_frame(len)?),
        };

        let (x_min, y_max) = params.origin();
        let kernel = Kernel::builder()
            .program(&self.program)
            .name(KERNEL_NAME)
            .queue(self.queue.clone())
            .global_work_size((params.width as usize, params.height as usize))
            .arg(&buffer.counts)
            .arg(params.width)
            .arg(params.height)
            .arg(params.max_iterations)
            .arg(x_min as f32)
            .arg(y_max as f32)
            .arg(params.unit as f32)
            .build()
            .map_err(|e| EngineError::KernelBuild(e.to_string()))?;

        // SAFETY: every kernel argument is set above and the output buffer
        // holds exactly width * height elements.
        unsafe { kernel.enq() }.map_err(|e| EngineError::Dispatch(e.to_string()))?;

        let mut counts = vec![0u32; len];
        buffer
            .counts
            .read(&mut counts)
            .enq()
            .map_err(|e| EngineError::Dispatch(e.to_string()))?;

        IterationField::from_counts(params, counts)
            .ok_or_else(|| EngineError::Dispatch("opencl readback size mismatch".to_string()))
    }
}
