use engine_cpu::{Backend, EngineError, RenderEngine};
use fractal_core::{IterationField, RenderParams};

/// Placeholder for builds without the `opencl` feature. Has no values.
pub enum OpenClEngine {}

impl OpenClEngine {
    pub fn enumerate() -> Result<Vec<OpenClEngine>, EngineError> {
        Err(EngineError::Unavailable(
            "built without OpenCL support (enable the `opencl` feature)".to_string(),
        ))
    }
}

impl RenderEngine for OpenClEngine {
    fn name(&self) -> &'static str {
        match *self {}
    }

    fn backend(&self) -> Backend {
        match *self {}
    }

    fn device_name(&self) -> String {
        match *self {}
    }

    fn render(&self, _params: &RenderParams) -> Result<IterationField, EngineError> {
        match *self {}
    }
}
