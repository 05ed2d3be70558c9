//! Timed per-device render run.
//!
//! For every enumerated device, in order: render `iterations` frames back to
//! back, time the whole batch, print one timing line, then write the last
//! frame to `<prefix><id>.png`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use engine_cpu::Device;
use fractal_core::{encode_png, RenderParams};

use crate::{BenchConfig, ComputeBackend};

/// Timing and output file for one device.
#[derive(Clone, Debug)]
pub struct DeviceTiming {
    pub device: Device,
    pub elapsed: Duration,
    pub output: PathBuf,
}

#[derive(Clone, Debug, Default)]
pub struct BenchReport {
    pub timings: Vec<DeviceTiming>,
}

impl BenchReport {
    pub fn total_elapsed(&self) -> Duration {
        self.timings.iter().map(|t| t.elapsed).sum()
    }
}

/// `device #<id> (<name>): <seconds, 6 decimals>sec.`
pub fn format_timing_line(device: &Device, elapsed: Duration) -> String {
    format!(
        "device #{} ({}): {:.6}sec.",
        device.id,
        device.name,
        elapsed.as_secs_f64()
    )
}

/// `#<id> [<backend>] <name>`, one line of the device listing.
pub fn format_device_line(device: &Device) -> String {
    format!("#{} [{}] {}", device.id, device.backend, device.name)
}

/// Run the benchmark against `backend`, writing timing lines to `out`.
///
/// Any failure aborts the run; lines and files already produced for earlier
/// devices are left in place.
pub fn run_benchmark<B, W>(backend: &B, config: &BenchConfig, out: &mut W) -> Result<BenchReport>
where
    B: ComputeBackend + ?Sized,
    W: Write,
{
    let params = config.validate()?;

    let devices = backend
        .list_devices()
        .context("device enumeration failed")?;
    log::info!(
        "Benchmarking {} device(s), {} renders each",
        devices.len(),
        config.iterations
    );

    let mut report = BenchReport::default();
    for device in devices {
        let start = Instant::now();
        let mut last = None;
        let mut dispatched = 0u32;
        let outcome = (0..config.iterations).try_for_each(|_| {
            last = Some(backend.compute_fractal(&params, device.id)?);
            dispatched += 1;
            Ok::<_, engine_cpu::EngineError>(())
        });
        let elapsed = start.elapsed();

        for _ in 0..dispatched {
            metrics::record_dispatch(params.pixel_count() as u64);
        }
        outcome.with_context(|| format!("render failed on device #{} ({})", device.id, device.name))?;
        metrics::record_batch(elapsed.as_secs_f64());

        writeln!(out, "{}", format_timing_line(&device, elapsed))?;

        let image = last.context("no frame rendered")?;
        let output = config.output_path(device.id);
        encode_png(&image, &output)
            .with_context(|| format!("failed to write {}", output.display()))?;
        log::debug!("Device #{} frame written to {}", device.id, output.display());

        report.timings.push(DeviceTiming {
            device,
            elapsed,
            output,
        });
    }

    Ok(report)
}

/// Render one frame on one device and write it to `path`. Returns the render time.
pub fn render_once<B>(
    backend: &B,
    params: &RenderParams,
    device_id: usize,
    path: &Path,
) -> Result<Duration>
where
    B: ComputeBackend + ?Sized,
{
    let start = Instant::now();
    let image = backend
        .compute_fractal(params, device_id)
        .with_context(|| format!("render failed on device #{device_id}"))?;
    let elapsed = start.elapsed();
    metrics::record_dispatch(params.pixel_count() as u64);

    encode_png(&image, path).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(elapsed)
}
