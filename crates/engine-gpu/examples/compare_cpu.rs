use engine_cpu::{ParallelCpuEngine, RenderEngine};
use engine_gpu::GpuEngine;
use fractal_core::RenderParams;
use std::time::Instant;

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    log::info!("Starting compare_cpu example");

    let params = RenderParams::new(1024, 1024, None);
    let cpu_engine = ParallelCpuEngine::new(None);

    let start = Instant::now();
    let reference = match cpu_engine.render(&params) {
        Ok(field) => field,
        Err(e) => {
            log::error!("CPU render failed: {e}");
            return;
        }
    };
    log::info!("CPU render took {:?}", start.elapsed());

    let engines = match GpuEngine::enumerate() {
        Ok(engines) => engines,
        Err(e) => {
            log::error!("No GPU engine: {e}");
            return;
        }
    };

    for (i, engine) in engines.iter().enumerate() {
        let start = Instant::now();
        match engine.render(&params) {
            Ok(field) => {
                let differing = field
                    .counts
                    .iter()
                    .zip(&reference.counts)
                    .filter(|(a, b)| a != b)
                    .count();
                log::info!(
                    "GPU {} ({}) took {:?}; {} of {} pixels differ from CPU",
                    i,
                    engine.device_name(),
                    start.elapsed(),
                    differing,
                    reference.counts.len()
                );
            }
            Err(e) => log::error!("FAILURE: GPU {} render failed: {e}", i),
        }
    }
}
