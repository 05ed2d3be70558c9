use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use engine_cpu::Backend;
use fractal_core::{RenderParams, DEFAULT_MAX_ITERATIONS};
use render_service::{
    format_device_line, format_timing_line, render_once, run_benchmark, BenchConfig,
    DeviceRegistry, DiscoveryConfig, DEFAULT_FILE_PREFIX, DEFAULT_HEIGHT, DEFAULT_ITERATIONS,
    DEFAULT_WIDTH,
};

#[derive(Subcommand, Debug)]
enum Command {
    /// Render on every device, time each batch and write one PNG per device (default)
    Bench(BenchArgs),
    /// List enumerated compute devices
    Devices {
        #[command(flatten)]
        discovery: DiscoveryArgs,
    },
    /// Render a single frame on one device
    Render(RenderArgs),
}

/// Mandelbrot render benchmark across CPU, wgpu and OpenCL devices
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum BackendCli {
    /// Multithreaded CPU engine
    Cpu,
    /// wgpu compute shader, one device per adapter
    Gpu,
    /// OpenCL kernel (requires the `opencl` build feature)
    #[value(name = "opencl")]
    OpenCl,
}

impl From<BackendCli> for Backend {
    fn from(value: BackendCli) -> Self {
        match value {
            BackendCli::Cpu => Backend::Cpu,
            BackendCli::Gpu => Backend::Gpu,
            BackendCli::OpenCl => Backend::OpenCl,
        }
    }
}

#[derive(clap::Args, Debug, Default)]
struct DiscoveryArgs {
    /// Backends to enumerate (repeat --backend or comma-separated).
    /// When given, each listed backend must provide at least one device.
    #[arg(long, env = "CLMANDELBROT_BACKEND", value_enum, value_delimiter = ',')]
    backend: Option<Vec<BackendCli>>,

    /// Worker threads for the CPU engine (defaults to all logical CPUs)
    #[arg(long, env = "CLMANDELBROT_WORKERS")]
    workers: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long, env = "CLMANDELBROT_VERBOSE")]
    verbose: bool,
}

impl DiscoveryArgs {
    fn config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            backends: self
                .backend
                .as_ref()
                .map(|list| list.iter().copied().map(Backend::from).collect()),
            cpu_workers: self.workers,
        }
    }
}

#[derive(clap::Args, Debug)]
struct BenchArgs {
    #[command(flatten)]
    discovery: DiscoveryArgs,

    /// Image width in pixels
    #[arg(long, env = "CLMANDELBROT_WIDTH", default_value_t = DEFAULT_WIDTH)]
    width: u32,

    /// Image height in pixels
    #[arg(long, env = "CLMANDELBROT_HEIGHT", default_value_t = DEFAULT_HEIGHT)]
    height: u32,

    /// Complex-plane size of one pixel (defaults to 2.0 / min(width, height))
    #[arg(long, env = "CLMANDELBROT_UNIT")]
    unit: Option<f64>,

    /// Renders per device inside the timed batch
    #[arg(long, env = "CLMANDELBROT_ITERATIONS", default_value_t = DEFAULT_ITERATIONS)]
    iterations: u32,

    /// Escape-time iteration cap
    #[arg(long = "max-iterations", env = "CLMANDELBROT_MAX_ITERATIONS", default_value_t = DEFAULT_MAX_ITERATIONS)]
    max_iterations: u32,

    /// Directory for the per-device PNG files
    #[arg(long = "output-dir", env = "CLMANDELBROT_OUTPUT_DIR", default_value = ".")]
    output_dir: PathBuf,

    /// File name prefix; files are written as <prefix><device id>.png
    #[arg(long, env = "CLMANDELBROT_PREFIX", default_value = DEFAULT_FILE_PREFIX)]
    prefix: String,

    /// Optional Prometheus metrics exporter port; if omitted, metrics are not served
    #[arg(long = "metrics-port", env = "CLMANDELBROT_METRICS_PORT")]
    metrics_port: Option<u16>,
}

impl Default for BenchArgs {
    fn default() -> Self {
        Self {
            discovery: DiscoveryArgs::default(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            unit: None,
            iterations: DEFAULT_ITERATIONS,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            output_dir: PathBuf::from("."),
            prefix: DEFAULT_FILE_PREFIX.to_string(),
            metrics_port: None,
        }
    }
}

impl BenchArgs {
    fn config(&self) -> BenchConfig {
        BenchConfig {
            width: self.width,
            height: self.height,
            unit: self.unit,
            max_iterations: self.max_iterations,
            iterations: self.iterations,
            output_dir: self.output_dir.clone(),
            file_prefix: self.prefix.clone(),
        }
    }
}

#[derive(clap::Args, Debug)]
struct RenderArgs {
    #[command(flatten)]
    discovery: DiscoveryArgs,

    /// Device id as listed by `clmandelbrot devices`
    #[arg(long, env = "CLMANDELBROT_DEVICE", default_value_t = 0)]
    device: usize,

    /// Output PNG path
    #[arg(short, long, env = "CLMANDELBROT_OUTPUT", default_value = "clmandelbrot.png")]
    output: PathBuf,

    /// Image width in pixels
    #[arg(long, env = "CLMANDELBROT_WIDTH", default_value_t = DEFAULT_WIDTH)]
    width: u32,

    /// Image height in pixels
    #[arg(long, env = "CLMANDELBROT_HEIGHT", default_value_t = DEFAULT_HEIGHT)]
    height: u32,

    /// Complex-plane size of one pixel
    #[arg(long, env = "CLMANDELBROT_UNIT")]
    unit: Option<f64>,

    /// Escape-time iteration cap
    #[arg(long = "max-iterations", env = "CLMANDELBROT_MAX_ITERATIONS", default_value_t = DEFAULT_MAX_ITERATIONS)]
    max_iterations: u32,

    /// Centre of the view on the real axis
    #[arg(long = "center-x", env = "CLMANDELBROT_CENTER_X", allow_hyphen_values = true)]
    center_x: Option<f64>,

    /// Centre of the view on the imaginary axis
    #[arg(long = "center-y", env = "CLMANDELBROT_CENTER_Y", allow_hyphen_values = true)]
    center_y: Option<f64>,
}

impl RenderArgs {
    fn params(&self) -> RenderParams {
        let params = RenderParams::new(self.width, self.height, self.unit)
            .with_max_iterations(self.max_iterations);
        let center_x = self.center_x.unwrap_or(params.center_x);
        let center_y = self.center_y.unwrap_or(params.center_y);
        params.with_center(center_x, center_y)
    }

    /// Parameters, rejected up front so bad input skips device discovery.
    fn checked_params(&self) -> Result<RenderParams> {
        let params = self.params();
        params.validate().context("invalid render parameters")?;
        Ok(params)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // No subcommand: run `bench`, still honouring CLMANDELBROT_* variables.
    let command = args.command.unwrap_or_else(|| {
        Args::parse_from(["clmandelbrot", "bench"])
            .command
            .unwrap_or_else(|| Command::Bench(BenchArgs::default()))
    });

    let result = match command {
        Command::Bench(bench) => run_bench_command(bench).await,
        Command::Devices { discovery } => run_devices_command(discovery).await,
        Command::Render(render) => run_render_command(render).await,
    };

    if let Err(e) = result {
        log::error!("clmandelbrot terminated with error: {e:?}");
        std::process::exit(1);
    }
}

/// Initialize the logger. If RUST_LOG is not set, default based on the verbose flag.
fn init_logging(verbose: bool) {
    if std::env::var("RUST_LOG").is_err() {
        let log_level = if verbose {
            "debug,engine_cpu=debug,gpu_engine=debug,opencl_engine=debug,wgpu_core=warn,wgpu_hal=warn,naga=warn"
        } else {
            "info,wgpu_core=warn,wgpu_hal=warn,naga=warn"
        };
        std::env::set_var("RUST_LOG", log_level);
    }
    env_logger::init();
}

async fn run_bench_command(args: BenchArgs) -> Result<()> {
    init_logging(args.discovery.verbose);

    if let Some(port) = args.metrics_port {
        metrics::start_http_exporter(port)
            .await
            .context("failed to start metrics exporter")?;
    }

    let discovery = args.discovery.config();
    let config = args.config();
    log::info!("Effective config: {config} {discovery}");
    config.validate()?;

    // Device work blocks on GPU queues; keep it off the async workers.
    let report = tokio::task::spawn_blocking(move || -> Result<_> {
        let registry = DeviceRegistry::discover(&discovery).context("device discovery failed")?;
        if registry.is_empty() {
            log::warn!("No compute devices found; nothing to render");
        }
        let stdout = io::stdout();
        run_benchmark(&registry, &config, &mut stdout.lock())
    })
    .await
    .context("benchmark task panicked")??;

    log::info!(
        "Benchmark finished: {} device(s) in {:.3}s",
        report.timings.len(),
        report.total_elapsed().as_secs_f64()
    );
    Ok(())
}

async fn run_devices_command(args: DiscoveryArgs) -> Result<()> {
    init_logging(args.verbose);

    let discovery = args.config();
    let devices = tokio::task::spawn_blocking(move || {
        DeviceRegistry::discover(&discovery).map(|registry| registry.devices().to_vec())
    })
    .await
    .context("device discovery task panicked")?
    .context("device discovery failed")?;

    for device in &devices {
        println!("{}", format_device_line(device));
    }
    Ok(())
}

async fn run_render_command(args: RenderArgs) -> Result<()> {
    init_logging(args.discovery.verbose);

    let discovery = args.discovery.config();
    let params = args.checked_params()?;
    let device_id = args.device;
    let output = args.output;
    log::info!(
        "Rendering {}x{} unit={} on device #{} to {}",
        params.width,
        params.height,
        params.unit,
        device_id,
        output.display()
    );

    let line = tokio::task::spawn_blocking(move || -> Result<String> {
        let registry = DeviceRegistry::discover(&discovery).context("device discovery failed")?;
        let elapsed = render_once(&registry, &params, device_id, &output)?;
        let device = registry
            .devices()
            .get(device_id)
            .context("device disappeared after render")?;
        log::info!("Wrote {}", output.display());
        Ok(format_timing_line(device, elapsed))
    })
    .await
    .context("render task panicked")??;

    println!("{line}");
    Ok(())
}
