//! Nearest-neighbor coordinate warping of frames by a deformation field.
//!
//! Each output pixel `(r, c)` samples the source at
//!
//! ```text
//! (r + s * dY[r, c], c + s * dX[r, c]),   s = max(height, width) - 1
//! ```
//!
//! where `s` converts the registration tool's normalized displacements to
//! pixels. Samples are rounded to the nearest pixel; samples that land
//! outside the source take the source's own mean value.

use ndarray::{Array2, Array3, ArrayView2, Axis};

use crate::data::deformation::DeformationField;
use crate::data::model::{ImageFrame, SpectralFrame};
use crate::error::WarpError;

// ---------------------------------------------------------------------------
// Sample – pixel element types the engine can resample
// ---------------------------------------------------------------------------

/// A pixel element type. Integer types round the out-of-bounds fill value
/// to the nearest representable value.
pub trait Sample: Copy {
    fn to_f64(self) -> f64;
    fn from_mean(mean: f64) -> Self;
}

macro_rules! integer_sample {
    ($($ty:ty),*) => {$(
        impl Sample for $ty {
            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_mean(mean: f64) -> Self {
                // `as` saturates and maps NaN to 0.
                mean.round() as $ty
            }
        }
    )*};
}

integer_sample!(u8, u16, u32, u64, i32, i64);

impl Sample for f32 {
    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    fn from_mean(mean: f64) -> Self {
        mean as f32
    }
}

impl Sample for f64 {
    fn to_f64(self) -> f64 {
        self
    }

    fn from_mean(mean: f64) -> Self {
        mean
    }
}

/// Arithmetic mean of all elements; `NaN` for an empty array.
pub fn mean<T: Sample>(values: ArrayView2<'_, T>) -> f64 {
    let n = values.len();
    values.iter().map(|v| v.to_f64()).sum::<f64>() / n as f64
}

// ---------------------------------------------------------------------------
// SamplePlan
// ---------------------------------------------------------------------------

/// Nearest source pixel for every output pixel of one deformation field.
///
/// Built once per frame and shared by the image and every spectral
/// channel, since the spatial warp is identical for all of them.
#[derive(Debug, Clone)]
pub struct SamplePlan {
    height: usize,
    width: usize,
    sources: Vec<Option<(usize, usize)>>,
}

impl SamplePlan {
    pub fn new(field: &DeformationField) -> Self {
        let (height, width) = field.shape();
        let (rows, cols) = sample_coordinates(field);
        let sources = rows
            .iter()
            .zip(cols.iter())
            .map(|(&r, &c)| Some((nearest(r, height)?, nearest(c, width)?)))
            .collect();
        Self { height, width, sources }
    }

    /// (height, width)
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Number of output pixels whose sample falls outside the source.
    pub fn out_of_bounds(&self) -> usize {
        self.sources.iter().filter(|s| s.is_none()).count()
    }

    fn check(&self, what: &'static str, dim: (usize, usize)) -> Result<(), WarpError> {
        if dim != self.shape() {
            return Err(WarpError::ShapeMismatch {
                what,
                expected: self.shape(),
                actual: dim,
            });
        }
        Ok(())
    }

    /// Resample one plane.
    pub fn apply<T: Sample>(&self, source: ArrayView2<'_, T>) -> Result<Array2<T>, WarpError> {
        self.check("source frame", source.dim())?;
        let fill = T::from_mean(mean(source.view()));
        Ok(Array2::from_shape_fn(self.shape(), |(r, c)| {
            match self.sources[r * self.width + c] {
                Some((sr, sc)) => source[[sr, sc]],
                None => fill,
            }
        }))
    }
}

/// Row and column sample coordinates: the pixel grid plus scaled (dY, dX).
pub fn sample_coordinates(field: &DeformationField) -> (Array2<f64>, Array2<f64>) {
    let (height, width) = field.shape();
    let scale = height.max(width).saturating_sub(1) as f64;
    let rows = Array2::from_shape_fn((height, width), |(r, c)| r as f64 + scale * field.dy[[r, c]]);
    let cols = Array2::from_shape_fn((height, width), |(r, c)| c as f64 + scale * field.dx[[r, c]]);
    (rows, cols)
}

fn nearest(coord: f64, len: usize) -> Option<usize> {
    let idx = coord.round();
    if idx.is_finite() && idx >= 0.0 && idx < len as f64 {
        Some(idx as usize)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Public warp operations
// ---------------------------------------------------------------------------

/// Warp a dense 2-D array.
pub fn warp_dense<T: Sample>(source: &Array2<T>, field: &DeformationField) -> Result<Array2<T>, WarpError> {
    SamplePlan::new(field).apply(source.view())
}

/// Warp a channels-first cube one channel at a time with a shared plan.
/// Each channel is filled with its own mean.
pub fn warp_channels<T: Sample>(cube: &Array3<T>, field: &DeformationField) -> Result<Array3<T>, WarpError> {
    let plan = SamplePlan::new(field);
    warp_channels_with(&plan, cube)
}

pub fn warp_channels_with<T: Sample>(plan: &SamplePlan, cube: &Array3<T>) -> Result<Array3<T>, WarpError> {
    let (_, height, width) = cube.dim();
    plan.check("spectral cube", (height, width))?;
    let mut out = cube.clone();
    for (src, mut dst) in cube.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
        dst.assign(&plan.apply(src)?);
    }
    Ok(out)
}

pub fn warp_image(plan: &SamplePlan, frame: &ImageFrame) -> Result<ImageFrame, WarpError> {
    Ok(match frame {
        ImageFrame::Gray8(a) => ImageFrame::Gray8(plan.apply(a.view())?),
        ImageFrame::Gray16(a) => ImageFrame::Gray16(plan.apply(a.view())?),
    })
}

/// Densify, warp per channel, and re-flatten a sparse spectral frame.
pub fn warp_spectrum(plan: &SamplePlan, frame: &SpectralFrame) -> Result<SpectralFrame, WarpError> {
    let shape = frame.shape();
    plan.check("spectral frame", (shape.height, shape.width))?;
    let warped = warp_channels_with(plan, &frame.to_dense())?;
    Ok(SpectralFrame::from_dense(&warped))
}
