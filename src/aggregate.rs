use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use ndarray::Array2;
use serde::Serialize;

use crate::data::loader;
use crate::data::model::{BitDepth, Calibration, CsrMatrix, ImageFrame, SpectralFrame, SpectralShape};
use crate::error::AggregateError;

// ---------------------------------------------------------------------------
// Image accumulation
// ---------------------------------------------------------------------------

/// Running `u64` sum of same-shaped frames of one bit depth.
#[derive(Debug, Clone, Default)]
pub struct ImageAccumulator {
    sum: Option<Array2<u64>>,
    depth: Option<BitDepth>,
    count: usize,
}

impl ImageAccumulator {
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether `frame` could be added without error.
    pub fn check(&self, frame: &ImageFrame) -> Result<(), AggregateError> {
        if let Some(sum) = &self.sum {
            let (h, w) = frame.dim();
            if sum.dim() != (h, w) {
                return Err(AggregateError::ShapeMismatch {
                    expected: sum.shape().to_vec(),
                    actual: vec![h, w],
                });
            }
        }
        if self.depth.is_some_and(|d| d != frame.bit_depth()) {
            return Err(AggregateError::BitDepthMismatch);
        }
        Ok(())
    }

    pub fn add(&mut self, frame: &ImageFrame) -> Result<(), AggregateError> {
        self.check(frame)?;
        let wide = frame.widened();
        self.sum = Some(match self.sum.take() {
            Some(sum) => sum + &wide,
            None => wide,
        });
        self.depth = Some(frame.bit_depth());
        self.count += 1;
        Ok(())
    }

    pub fn merge(mut self, other: Self) -> Result<Self, AggregateError> {
        let (Some(other_sum), Some(other_depth)) = (other.sum, other.depth) else {
            return Ok(self);
        };
        match self.sum.take() {
            None => {
                self.sum = Some(other_sum);
                self.depth = Some(other_depth);
            }
            Some(mut sum) => {
                if sum.dim() != other_sum.dim() {
                    return Err(AggregateError::ShapeMismatch {
                        expected: sum.shape().to_vec(),
                        actual: other_sum.shape().to_vec(),
                    });
                }
                if self.depth != Some(other_depth) {
                    return Err(AggregateError::BitDepthMismatch);
                }
                sum += &other_sum;
                self.sum = Some(sum);
            }
        }
        self.count += other.count;
        Ok(self)
    }

    /// Integer mean (floor) in the widened type.
    fn mean_wide(&self, what: &'static str) -> Result<(Array2<u64>, BitDepth), AggregateError> {
        match (&self.sum, self.depth) {
            (Some(sum), Some(depth)) if self.count > 0 => {
                let n = self.count as u64;
                Ok((sum.mapv(|v| v / n), depth))
            }
            _ => Err(AggregateError::Empty(what)),
        }
    }
}

// ---------------------------------------------------------------------------
// Spectrum accumulation
// ---------------------------------------------------------------------------

/// Running sparse `u64` totals of same-shaped spectral frames.
#[derive(Debug, Clone, Default)]
pub struct SpectrumAccumulator {
    shape: Option<SpectralShape>,
    totals: HashMap<(usize, usize), u64>,
    count: usize,
}

impl SpectrumAccumulator {
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn check(&self, frame: &SpectralFrame) -> Result<(), AggregateError> {
        match self.shape {
            Some(shape) if shape != frame.shape() => Err(AggregateError::ShapeMismatch {
                expected: shape_vec(shape),
                actual: shape_vec(frame.shape()),
            }),
            _ => Ok(()),
        }
    }

    pub fn add(&mut self, frame: &SpectralFrame) -> Result<(), AggregateError> {
        self.check(frame)?;
        self.shape = Some(frame.shape());
        for (pixel, channel, v) in frame.counts().iter() {
            *self.totals.entry((pixel, channel)).or_insert(0) += u64::from(v);
        }
        self.count += 1;
        Ok(())
    }

    pub fn merge(mut self, other: Self) -> Result<Self, AggregateError> {
        let Some(other_shape) = other.shape else {
            return Ok(self);
        };
        if let Some(shape) = self.shape {
            if shape != other_shape {
                return Err(AggregateError::ShapeMismatch {
                    expected: shape_vec(shape),
                    actual: shape_vec(other_shape),
                });
            }
        }
        self.shape = Some(other_shape);
        for (key, v) in other.totals {
            *self.totals.entry(key).or_insert(0) += v;
        }
        self.count += other.count;
        Ok(self)
    }

    fn finish(&self, what: &'static str) -> Result<SpectrumSummary, AggregateError> {
        let shape = match self.shape {
            Some(shape) if self.count > 0 => shape,
            _ => return Err(AggregateError::Empty(what)),
        };
        let total = CsrMatrix::from_triplets(
            shape.pixels(),
            shape.channels,
            self.totals.iter().map(|(&(p, c), &v)| (p, c, v)),
        )
        .map_err(|_| AggregateError::ShapeMismatch {
            expected: shape_vec(shape),
            actual: vec![self.totals.len()],
        })?;
        let n = self.count as f64;
        let mean = total.map(|v| v as f64 / n);
        Ok(SpectrumSummary { shape, frames: self.count, total, mean })
    }
}

fn shape_vec(shape: SpectralShape) -> Vec<usize> {
    vec![shape.channels, shape.height, shape.width]
}

/// Summed and averaged spectrum of one frame set.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumSummary {
    pub shape: SpectralShape,
    pub frames: usize,
    pub total: CsrMatrix<u64>,
    pub mean: CsrMatrix<f64>,
}

// ---------------------------------------------------------------------------
// AggregateResult
// ---------------------------------------------------------------------------

/// Spectral products, present only for runs with spectral data.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralProducts {
    pub before: SpectrumSummary,
    pub after: SpectrumSummary,
    /// `after.mean - before.mean`
    pub difference: CsrMatrix<f64>,
}

/// Mean and difference products for the frames before and after warping.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateResult {
    pub before_image: ImageFrame,
    pub after_image: ImageFrame,
    /// `after_image - before_image`, signed.
    pub image_difference: Array2<i64>,
    pub spectra: Option<SpectralProducts>,
    /// Axis calibration written alongside the products.
    pub calibration: Calibration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductSummary {
    pub height: usize,
    pub width: usize,
    pub bit_depth: BitDepth,
    pub min_difference: i64,
    pub max_difference: i64,
    pub spectral_channels: Option<usize>,
    pub calibration: Calibration,
}

impl AggregateResult {
    pub fn with_calibration(mut self, calibration: Calibration) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn summary(&self) -> ProductSummary {
        let (height, width) = self.before_image.dim();
        ProductSummary {
            height,
            width,
            bit_depth: self.before_image.bit_depth(),
            min_difference: self.image_difference.iter().copied().min().unwrap_or(0),
            max_difference: self.image_difference.iter().copied().max().unwrap_or(0),
            spectral_channels: self.spectra.as_ref().map(|s| s.before.shape.channels),
            calibration: self.calibration.clone(),
        }
    }

    /// Write every product into `dir`.
    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        loader::save_image(&dir.join("averaged_original.png"), &self.before_image)?;
        loader::save_image(&dir.join("averaged_deformed.png"), &self.after_image)?;
        loader::save_signed_grid(&dir.join("difference_images.csv"), &self.image_difference)?;
        log::info!("Wrote averaged images and their difference to {}", dir.display());

        if let Some(spectra) = &self.spectra {
            let shape = spectra.before.shape;
            let axes = self.calibration.entries();
            let save_total = |name: &str, m: &CsrMatrix<u64>| {
                loader::save_sparse_with_metadata(&dir.join(name), shape, m, &axes)
            };
            let save_mean = |name: &str, m: &CsrMatrix<f64>| {
                loader::save_sparse_with_metadata(&dir.join(name), shape, m, &axes)
            };
            save_total("total_original_spectrum.parquet", &spectra.before.total)?;
            save_total("total_deformed_spectrum.parquet", &spectra.after.total)?;
            save_mean("averaged_original_spectrum.parquet", &spectra.before.mean)?;
            save_mean("averaged_deformed_spectrum.parquet", &spectra.after.mean)?;
            save_mean("difference_spectrum.parquet", &spectra.difference)
                .context("writing spectral difference")?;
            log::info!("Wrote total, averaged and difference spectra to {}", dir.display());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RunAccumulator – before/after sets of one run
// ---------------------------------------------------------------------------

/// Accumulates the before and after sets frame by frame so that a run
/// never holds more than one frame's pixels per worker.
#[derive(Debug, Clone, Default)]
pub struct RunAccumulator {
    before_images: ImageAccumulator,
    after_images: ImageAccumulator,
    before_spectra: SpectrumAccumulator,
    after_spectra: SpectrumAccumulator,
}

impl RunAccumulator {
    /// Add one frame's before/after pair. Nothing is added unless every
    /// part is consistent with what was accumulated so far.
    pub fn add_frame(
        &mut self,
        before: &ImageFrame,
        after: &ImageFrame,
        spectra: Option<(&SpectralFrame, &SpectralFrame)>,
    ) -> Result<(), AggregateError> {
        self.before_images.check(before)?;
        self.after_images.check(after)?;
        if let Some((b, a)) = spectra {
            self.before_spectra.check(b)?;
            self.after_spectra.check(a)?;
        }

        self.before_images.add(before)?;
        self.after_images.add(after)?;
        if let Some((b, a)) = spectra {
            self.before_spectra.add(b)?;
            self.after_spectra.add(a)?;
        }
        Ok(())
    }

    pub fn add_before_image(&mut self, frame: &ImageFrame) -> Result<(), AggregateError> {
        self.before_images.add(frame)
    }

    pub fn add_after_image(&mut self, frame: &ImageFrame) -> Result<(), AggregateError> {
        self.after_images.add(frame)
    }

    pub fn add_before_spectrum(&mut self, frame: &SpectralFrame) -> Result<(), AggregateError> {
        self.before_spectra.add(frame)
    }

    pub fn add_after_spectrum(&mut self, frame: &SpectralFrame) -> Result<(), AggregateError> {
        self.after_spectra.add(frame)
    }

    pub fn merge(self, other: Self) -> Result<Self, AggregateError> {
        Ok(Self {
            before_images: self.before_images.merge(other.before_images)?,
            after_images: self.after_images.merge(other.after_images)?,
            before_spectra: self.before_spectra.merge(other.before_spectra)?,
            after_spectra: self.after_spectra.merge(other.after_spectra)?,
        })
    }

    /// Frames in the after-warp image set.
    pub fn frames(&self) -> usize {
        self.after_images.count()
    }

    pub fn finish(&self) -> Result<AggregateResult, AggregateError> {
        let (before_wide, before_depth) = self.before_images.mean_wide("images before warp")?;
        let (after_wide, after_depth) = self.after_images.mean_wide("images after warp")?;
        if before_wide.dim() != after_wide.dim() {
            return Err(AggregateError::ShapeMismatch {
                expected: before_wide.shape().to_vec(),
                actual: after_wide.shape().to_vec(),
            });
        }
        if before_depth != after_depth {
            return Err(AggregateError::BitDepthMismatch);
        }

        let image_difference = ndarray::Zip::from(&after_wide)
            .and(&before_wide)
            .map_collect(|&a, &b| a as i64 - b as i64);

        let spectra = match (self.before_spectra.count(), self.after_spectra.count()) {
            (0, 0) => None,
            _ => {
                let before = self.before_spectra.finish("spectra before warp")?;
                let after = self.after_spectra.finish("spectra after warp")?;
                if before.shape != after.shape {
                    return Err(AggregateError::ShapeMismatch {
                        expected: shape_vec(before.shape),
                        actual: shape_vec(after.shape),
                    });
                }
                let difference = sparse_difference(&after.mean, &before.mean);
                Some(SpectralProducts { before, after, difference })
            }
        };

        Ok(AggregateResult {
            before_image: ImageFrame::from_widened(&before_wide, before_depth),
            after_image: ImageFrame::from_widened(&after_wide, after_depth),
            image_difference,
            spectra,
            calibration: Calibration::default(),
        })
    }
}

/// `a - b` over the union of both sparsity patterns. Shapes must agree.
fn sparse_difference(a: &CsrMatrix<f64>, b: &CsrMatrix<f64>) -> CsrMatrix<f64> {
    let mut entries: HashMap<(usize, usize), f64> = a.iter().map(|(r, c, v)| ((r, c), v)).collect();
    for (r, c, v) in b.iter() {
        *entries.entry((r, c)).or_insert(0.0) -= v;
    }
    let (rows, cols) = a.shape();
    // Keys are unique and in range, so construction cannot fail.
    CsrMatrix::from_triplets(rows, cols, entries.into_iter().map(|((r, c), v)| (r, c, v)))
        .unwrap_or_else(|_| CsrMatrix::empty(rows, cols))
}

/// Mean and difference products of two frame sets held in memory.
pub fn aggregate(
    before_images: &[ImageFrame],
    after_images: &[ImageFrame],
    before_spectra: Option<&[SpectralFrame]>,
    after_spectra: Option<&[SpectralFrame]>,
) -> Result<AggregateResult, AggregateError> {
    let mut acc = RunAccumulator::default();
    for frame in before_images {
        acc.add_before_image(frame)?;
    }
    for frame in after_images {
        acc.add_after_image(frame)?;
    }
    for frame in before_spectra.unwrap_or_default() {
        acc.add_before_spectrum(frame)?;
    }
    for frame in after_spectra.unwrap_or_default() {
        acc.add_after_spectrum(frame)?;
    }
    acc.finish()
}
