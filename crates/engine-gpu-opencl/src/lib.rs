#![deny(rust_2018_idioms)]

//! OpenCL render engine.
//!
//! With the `opencl` feature enabled, every device on every OpenCL platform
//! becomes one `OpenClEngine`. The program is built once per device when the
//! engine is created; renders only create a kernel handle and enqueue it.
//!
//! Without the feature the crate still builds: `OpenClEngine` is an empty
//! type and `enumerate` reports the backend as unavailable.

#[cfg(feature = "opencl")]
mod engine;
#[cfg(not(feature = "opencl"))]
mod stub;

#[cfg(feature = "opencl")]
pub use engine::OpenClEngine;
#[cfg(not(feature = "opencl"))]
pub use stub::OpenClEngine;

/// Whether this build has OpenCL support compiled in.
pub fn opencl_available() -> bool {
    cfg!(feature = "opencl")
}
