#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Mandelbrot math core shared by every render engine.
//!
//! This crate provides:
//! - `RenderParams`: validated render request (dimensions, unit, iteration cap, centre)
//! - `escape_time`: the reference per-point iteration used by the CPU engines
//! - `IterationField`: raw escape counts produced by an engine
//! - `Palette` / `PixelBuffer`: host-side coloring into RGBA8 pixels
//! - `encode_png`: PNG serialization of a `PixelBuffer`
//!
//! GPU engines only produce an `IterationField`; coloring always happens here
//! so every backend maps counts to the same colors.

mod png;

pub use png::{encode_png, EncodeError};

use core::ops::Range;
use thiserror::Error;

/// Iteration cap used when the caller does not pick one.
pub const DEFAULT_MAX_ITERATIONS: u32 = 256;

/// Default view centre in the complex plane.
pub const DEFAULT_CENTER: (f64, f64) = (-0.5, 0.0);

/// Largest accepted width or height, in pixels.
pub const MAX_DIMENSION: u32 = 16_384;

/// Squared escape radius.
pub const ESCAPE_RADIUS_SQ: f64 = 4.0;

/// Rejected render parameters.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParamsError {
    #[error("image dimensions must be positive (got {width}x{height})")]
    ZeroDimension { width: u32, height: u32 },
    #[error("image dimensions {width}x{height} exceed the {MAX_DIMENSION} pixel limit")]
    TooLarge { width: u32, height: u32 },
    #[error("unit must be a positive finite number (got {0})")]
    InvalidUnit(f64),
    #[error("max_iterations must be positive")]
    ZeroIterations,
}

/// A single render request.
///
/// `unit` is the width of one pixel in the complex plane. Pixel `(x, y)` is
/// sampled at its centre, with `y` growing downwards (top row first).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderParams {
    pub width: u32,
    pub height: u32,
    pub unit: f64,
    pub max_iterations: u32,
    pub center_x: f64,
    pub center_y: f64,
}

impl RenderParams {
    /// Build parameters with the default centre and iteration cap.
    ///
    /// When `unit` is `None` the view spans 2.0 along the shorter side,
    /// so `(1024, 1024, None)` is the same view as `(1024, 1024, Some(1.0 / 512.0))`.
    pub fn new(width: u32, height: u32, unit: Option<f64>) -> Self {
        Self {
            width,
            height,
            unit: unit.unwrap_or_else(|| Self::default_unit(width, height)),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            center_x: DEFAULT_CENTER.0,
            center_y: DEFAULT_CENTER.1,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_center(mut self, center_x: f64, center_y: f64) -> Self {
        self.center_x = center_x;
        self.center_y = center_y;
        self
    }

    /// Unit that fits a 2.0-wide span into the shorter side.
    pub fn default_unit(width: u32, height: u32) -> f64 {
        2.0 / f64::from(width.min(height).max(1))
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.width == 0 || self.height == 0 {
            return Err(ParamsError::ZeroDimension {
                width: self.width,
                height: self.height,
            });
        }
        if self.width > MAX_DIMENSION || self.height > MAX_DIMENSION {
            return Err(ParamsError::TooLarge {
                width: self.width,
                height: self.height,
            });
        }
        if !self.unit.is_finite() || self.unit <= 0.0 {
            return Err(ParamsError::InvalidUnit(self.unit));
        }
        if self.max_iterations == 0 {
            return Err(ParamsError::ZeroIterations);
        }
        Ok(())
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Complex coordinate of the top-left pixel centre as `(x_min, y_max)`.
    ///
    /// Every engine maps pixel `(x, y)` to `(x_min + x * unit, y_max - y * unit)`.
    pub fn origin(&self) -> (f64, f64) {
        let x_min = self.center_x + (0.5 - f64::from(self.width) / 2.0) * self.unit;
        let y_max = self.center_y + (f64::from(self.height) / 2.0 - 0.5) * self.unit;
        (x_min, y_max)
    }

    /// Complex coordinate sampled for pixel `(x, y)`.
    pub fn point(&self, x: u32, y: u32) -> (f64, f64) {
        let (x_min, y_max) = self.origin();
        (
            x_min + f64::from(x) * self.unit,
            y_max - f64::from(y) * self.unit,
        )
    }
}

/// Number of iterations before `z <- z^2 + c` leaves the escape radius.
///
/// Returns `max_iterations` for points that never escape.
#[inline]
pub fn escape_time(cx: f64, cy: f64, max_iterations: u32) -> u32 {
    let mut zx = 0.0f64;
    let mut zy = 0.0f64;
    let mut i = 0;
    while i < max_iterations {
        let zx2 = zx * zx;
        let zy2 = zy * zy;
        if zx2 + zy2 > ESCAPE_RADIUS_SQ {
            break;
        }
        zy = 2.0 * zx * zy + cy;
        zx = zx2 - zy2 + cx;
        i += 1;
    }
    i
}

/// Fill `out` with escape counts for the rows in `rows`.
///
/// `out` must hold exactly `rows.len() * params.width` counts.
pub fn fill_rows(params: &RenderParams, rows: Range<u32>, out: &mut [u32]) {
    let width = params.width as usize;
    debug_assert_eq!(out.len(), rows.len() * width);
    let (x_min, y_max) = params.origin();
    for (row, y) in out.chunks_exact_mut(width).zip(rows) {
        let cy = y_max - f64::from(y) * params.unit;
        for (x, slot) in row.iter_mut().enumerate() {
            let cx = x_min + x as f64 * params.unit;
            *slot = escape_time(cx, cy, params.max_iterations);
        }
    }
}

/// Escape counts for a whole frame, row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IterationField {
    pub width: u32,
    pub height: u32,
    pub max_iterations: u32,
    pub counts: Vec<u32>,
}

impl IterationField {
    /// Wrap engine output. Returns `None` when `counts` does not match the frame size.
    pub fn from_counts(params: &RenderParams, counts: Vec<u32>) -> Option<Self> {
        if counts.len() != params.pixel_count() {
            return None;
        }
        Some(Self {
            width: params.width,
            height: params.height,
            max_iterations: params.max_iterations,
            counts,
        })
    }

    pub fn count(&self, x: u32, y: u32) -> u32 {
        self.counts[y as usize * self.width as usize + x as usize]
    }

    /// Color the field with a palette sized for its iteration cap.
    pub fn colorize(&self) -> PixelBuffer {
        PixelBuffer::from_iterations(self, &Palette::new(self.max_iterations))
    }
}

/// Precomputed gradient, one entry per escape count.
///
/// Points that reach the cap are black; the rest follow a smooth
/// polynomial gradient from dark blue through orange to pale yellow.
#[derive(Clone, Debug)]
pub struct Palette {
    max_iterations: u32,
    gradient: Vec<[u8; 4]>,
}

impl Palette {
    pub fn new(max_iterations: u32) -> Self {
        let steps = max_iterations.max(1);
        let gradient = (0..steps)
            .map(|i| gradient_color(f64::from(i) / f64::from(steps)))
            .collect();
        Self {
            max_iterations,
            gradient,
        }
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    #[inline]
    pub fn color(&self, iterations: u32) -> [u8; 4] {
        if iterations >= self.max_iterations {
            return [0, 0, 0, 0xFF];
        }
        self.gradient[iterations as usize]
    }
}

fn gradient_color(t: f64) -> [u8; 4] {
    let u = 1.0 - t;
    let r = 9.0 * u * t * t * t;
    let g = 15.0 * u * u * t * t;
    let b = 8.5 * u * u * u * t;
    [channel(r), channel(g), channel(b), 0xFF]
}

fn channel(v: f64) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// RGBA8 image, row-major, top row first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl PixelBuffer {
    pub fn from_iterations(field: &IterationField, palette: &Palette) -> Self {
        let mut pixels = Vec::with_capacity(field.counts.len() * 4);
        for &count in &field.counts {
            pixels.extend_from_slice(&palette.color(count));
        }
        Self {
            width: field.width,
            height: field.height,
            pixels,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let idx = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.pixels[idx],
            self.pixels[idx + 1],
            self.pixels[idx + 2],
            self.pixels[idx + 3],
        ]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.pixels
    }
}

/// Render a frame on the calling thread. Used as the correctness reference.
pub fn render_reference(params: &RenderParams) -> Result<IterationField, ParamsError> {
    params.validate()?;
    let mut counts = vec![0u32; params.pixel_count()];
    fill_rows(params, 0..params.height, &mut counts);
    Ok(IterationField {
        width: params.width,
        height: params.height,
        max_iterations: params.max_iterations,
        counts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_is_inside_the_set() {
        assert_eq!(escape_time(0.0, 0.0, 500), 500);
        assert_eq!(escape_time(-1.0, 0.0, 500), 500);
    }

    #[test]
    fn far_points_escape_quickly() {
        // z1 = 2, |z1|^2 = 4 is still inside the radius, z2 = 6 escapes.
        assert_eq!(escape_time(2.0, 0.0, 100), 2);
        assert_eq!(escape_time(10.0, 10.0, 100), 1);
    }

    #[test]
    fn default_unit_matches_example_view() {
        let p = RenderParams::new(1024, 1024, None);
        assert_eq!(p.unit, 1.0 / 512.0);
        let wide = RenderParams::new(800, 400, None);
        assert_eq!(wide.unit, 2.0 / 400.0);
    }

    #[test]
    fn pixel_mapping_is_symmetric_about_the_centre() {
        let p = RenderParams::new(4, 4, Some(0.5)).with_center(0.0, 0.0);
        assert_eq!(p.point(0, 0), (-0.75, 0.75));
        assert_eq!(p.point(3, 3), (0.75, -0.75));
    }

    #[test]
    fn validation_rejects_bad_params() {
        assert_eq!(
            RenderParams::new(0, 10, Some(0.1)).validate(),
            Err(ParamsError::ZeroDimension {
                width: 0,
                height: 10
            })
        );
        assert!(matches!(
            RenderParams::new(10, 10, Some(0.0)).validate(),
            Err(ParamsError::InvalidUnit(_))
        ));
        assert!(matches!(
            RenderParams::new(10, 10, Some(f64::NAN)).validate(),
            Err(ParamsError::InvalidUnit(_))
        ));
        assert_eq!(
            RenderParams::new(10, 10, None)
                .with_max_iterations(0)
                .validate(),
            Err(ParamsError::ZeroIterations)
        );
        assert!(matches!(
            RenderParams::new(MAX_DIMENSION + 1, 1, None).validate(),
            Err(ParamsError::TooLarge { .. })
        ));
        assert!(RenderParams::new(16, 9, None).validate().is_ok());
    }

    #[test]
    fn reference_render_is_deterministic() {
        let p = RenderParams::new(32, 24, None).with_max_iterations(64);
        let a = render_reference(&p).unwrap();
        let b = render_reference(&p).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.counts.len(), 32 * 24);
        // Centre pixel of the default view sits on the main cardioid.
        assert_eq!(a.count(16, 12), 64);
    }

    #[test]
    fn from_counts_checks_length() {
        let p = RenderParams::new(4, 4, None);
        assert!(IterationField::from_counts(&p, vec![0; 15]).is_none());
        assert!(IterationField::from_counts(&p, vec![0; 16]).is_some());
    }

    #[test]
    fn palette_paints_interior_black_and_is_opaque() {
        let palette = Palette::new(100);
        assert_eq!(palette.color(100), [0, 0, 0, 0xFF]);
        assert_eq!(palette.color(250), [0, 0, 0, 0xFF]);
        for i in 0..100 {
            assert_eq!(palette.color(i)[3], 0xFF);
        }
        assert_ne!(palette.color(50), palette.color(100));
    }

    #[test]
    fn pixel_buffer_follows_field_layout() {
        let p = RenderParams::new(3, 2, None).with_max_iterations(10);
        let field = IterationField::from_counts(&p, vec![0, 1, 2, 10, 10, 10]).unwrap();
        let image = field.colorize();
        assert_eq!((image.width(), image.height()), (3, 2));
        assert_eq!(image.as_bytes().len(), 3 * 2 * 4);
        assert_eq!(image.pixel(1, 1), [0, 0, 0, 0xFF]);
        assert_eq!(image.pixel(2, 0), Palette::new(10).color(2));
    }
}
