use anyhow::{bail, Result};
use ndarray::{Array2, Array3};
use num_traits::Zero;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ImageFrame – one dense acquisition frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitDepth {
    Eight,
    Sixteen,
}

/// A grayscale frame in its acquisition bit depth.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageFrame {
    Gray8(Array2<u8>),
    Gray16(Array2<u16>),
}

impl ImageFrame {
    /// (height, width)
    pub fn dim(&self) -> (usize, usize) {
        match self {
            ImageFrame::Gray8(a) => a.dim(),
            ImageFrame::Gray16(a) => a.dim(),
        }
    }

    pub fn bit_depth(&self) -> BitDepth {
        match self {
            ImageFrame::Gray8(_) => BitDepth::Eight,
            ImageFrame::Gray16(_) => BitDepth::Sixteen,
        }
    }

    /// Pixels widened to `u64`, row-major.
    pub fn widened(&self) -> Array2<u64> {
        match self {
            ImageFrame::Gray8(a) => a.mapv(u64::from),
            ImageFrame::Gray16(a) => a.mapv(u64::from),
        }
    }

    /// Narrow `u64` pixels back to `depth`, saturating at the type maximum.
    pub fn from_widened(values: &Array2<u64>, depth: BitDepth) -> Self {
        match depth {
            BitDepth::Eight => {
                ImageFrame::Gray8(values.mapv(|v| u8::try_from(v).unwrap_or(u8::MAX)))
            }
            BitDepth::Sixteen => {
                ImageFrame::Gray16(values.mapv(|v| u16::try_from(v).unwrap_or(u16::MAX)))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CsrMatrix – compressed sparse rows
// ---------------------------------------------------------------------------

/// Compressed-sparse-row matrix. Explicit zeros are never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix<T> {
    rows: usize,
    cols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    data: Vec<T>,
}

impl<T: Copy + Zero> CsrMatrix<T> {
    pub fn empty(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            indptr: vec![0; rows + 1],
            indices: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Build from `(row, col, value)` entries; zeros are dropped and a
    /// repeated position is an error.
    pub fn from_triplets(
        rows: usize,
        cols: usize,
        triplets: impl IntoIterator<Item = (usize, usize, T)>,
    ) -> Result<Self> {
        let mut entries: Vec<(usize, usize, T)> =
            triplets.into_iter().filter(|(_, _, v)| !v.is_zero()).collect();
        entries.sort_unstable_by_key(|&(r, c, _)| (r, c));

        let mut matrix = Self::empty(rows, cols);
        matrix.indices.reserve(entries.len());
        matrix.data.reserve(entries.len());

        let mut previous: Option<(usize, usize)> = None;
        for (r, c, v) in entries {
            if r >= rows || c >= cols {
                bail!("entry ({r}, {c}) outside a {rows}x{cols} matrix");
            }
            if previous == Some((r, c)) {
                bail!("entry ({r}, {c}) given twice");
            }
            previous = Some((r, c));
            matrix.indptr[r + 1] += 1;
            matrix.indices.push(c);
            matrix.data.push(v);
        }
        for r in 0..rows {
            matrix.indptr[r + 1] += matrix.indptr[r];
        }
        Ok(matrix)
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Number of stored (non-zero) entries.
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    /// Stored entries in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        (0..self.rows).flat_map(move |r| {
            let span = self.indptr[r]..self.indptr[r + 1];
            self.indices[span.clone()]
                .iter()
                .zip(&self.data[span])
                .map(move |(&c, &v)| (r, c, v))
        })
    }

    pub fn get(&self, row: usize, col: usize) -> T {
        if row >= self.rows {
            return T::zero();
        }
        let span = self.indptr[row]..self.indptr[row + 1];
        match self.indices[span.clone()].binary_search(&col) {
            Ok(i) => self.data[span.start + i],
            Err(_) => T::zero(),
        }
    }

    /// Apply `f` to every stored value, dropping entries that become zero.
    pub fn map<U: Copy + Zero>(&self, f: impl Fn(T) -> U) -> CsrMatrix<U> {
        let mut out = CsrMatrix::empty(self.rows, self.cols);
        for r in 0..self.rows {
            for i in self.indptr[r]..self.indptr[r + 1] {
                let v = f(self.data[i]);
                if !v.is_zero() {
                    out.indices.push(self.indices[i]);
                    out.data.push(v);
                }
            }
            out.indptr[r + 1] = out.data.len();
        }
        out
    }
}

// ---------------------------------------------------------------------------
// SpectralFrame – sparse (pixels x channels) counts of one frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpectralShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl SpectralShape {
    pub fn pixels(&self) -> usize {
        self.height * self.width
    }
}

/// Per-pixel spectra of one frame stored as a `(height*width) x channels`
/// sparse matrix. Pixel `(r, c)` is row `r * width + c`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralFrame {
    shape: SpectralShape,
    counts: CsrMatrix<u32>,
}

impl SpectralFrame {
    pub fn new(shape: SpectralShape, counts: CsrMatrix<u32>) -> Result<Self> {
        if counts.shape() != (shape.pixels(), shape.channels) {
            bail!(
                "sparse counts are {:?}, expected {}x{} for {:?}",
                counts.shape(),
                shape.pixels(),
                shape.channels,
                shape
            );
        }
        Ok(Self { shape, counts })
    }

    pub fn shape(&self) -> SpectralShape {
        self.shape
    }

    pub fn counts(&self) -> &CsrMatrix<u32> {
        &self.counts
    }

    /// Unravel into a dense channels-first cube.
    pub fn to_dense(&self) -> Array3<u32> {
        let SpectralShape { channels, height, width } = self.shape;
        let mut cube = Array3::zeros((channels, height, width));
        for (pixel, channel, v) in self.counts.iter() {
            cube[[channel, pixel / width, pixel % width]] = v;
        }
        cube
    }

    /// Re-flatten a channels-first cube.
    pub fn from_dense(cube: &Array3<u32>) -> Self {
        let (channels, height, width) = cube.dim();
        let shape = SpectralShape { channels, height, width };
        let mut counts = CsrMatrix::empty(shape.pixels(), channels);
        for r in 0..height {
            for c in 0..width {
                for ch in 0..channels {
                    let v = cube[[ch, r, c]];
                    if v != 0 {
                        counts.indices.push(ch);
                        counts.data.push(v);
                    }
                }
                counts.indptr[r * width + c + 1] = counts.data.len();
            }
        }
        Self { shape, counts }
    }

    /// Sum of all counts.
    pub fn total_counts(&self) -> u64 {
        self.counts.iter().map(|(_, _, v)| u64::from(v)).sum()
    }
}

// ---------------------------------------------------------------------------
// AcquisitionMetadata – `metadata.json` written at extraction time
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisInfo {
    #[serde(rename = "Pixels")]
    pub pixels: usize,
    #[serde(rename = "PixelSize", default)]
    pub pixel_size: Option<f64>,
    #[serde(rename = "PixelSize_Units", default)]
    pub pixel_size_units: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanInfo {
    #[serde(rename = "Height")]
    pub height: AxisInfo,
    #[serde(rename = "Width")]
    pub width: AxisInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdxInfo {
    #[serde(rename = "Channels")]
    pub channels: usize,
    #[serde(rename = "Dispersion", default)]
    pub dispersion: Option<f64>,
    #[serde(rename = "Dispersion_Unit", default)]
    pub dispersion_unit: Option<String>,
    #[serde(rename = "EnergyOffset", default)]
    pub energy_offset: Option<f64>,
}

/// Axis calibration carried onto the averaged products. Absent entries
/// were missing from `metadata.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Calibration {
    pub x_scale: Option<f64>,
    pub x_units: Option<String>,
    pub y_scale: Option<f64>,
    pub y_units: Option<String>,
    pub energy_scale: Option<f64>,
    pub energy_units: Option<String>,
    pub energy_offset: Option<f64>,
}

impl Calibration {
    /// Present entries as `(key, value)` strings, e.g. for file metadata.
    pub fn entries(&self) -> Vec<(String, String)> {
        let numbers = [
            ("x_scale", self.x_scale),
            ("y_scale", self.y_scale),
            ("energy_scale", self.energy_scale),
            ("energy_offset", self.energy_offset),
        ];
        let units = [
            ("x_units", &self.x_units),
            ("y_units", &self.y_units),
            ("energy_units", &self.energy_units),
        ];
        numbers
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k.to_string(), v.to_string())))
            .chain(
                units
                    .into_iter()
                    .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), v.clone()))),
            )
            .collect()
    }
}

/// The subset of acquisition metadata the warp pipeline reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionMetadata {
    #[serde(rename = "Scan")]
    pub scan: ScanInfo,
    #[serde(rename = "EDX", default, skip_serializing_if = "Option::is_none")]
    pub edx: Option<EdxInfo>,
}

impl AcquisitionMetadata {
    /// (height, width) in pixels.
    pub fn frame_dim(&self) -> (usize, usize) {
        (self.scan.height.pixels, self.scan.width.pixels)
    }

    /// Physical axes of the scan and, with EDX data, the energy axis.
    pub fn calibration(&self) -> Calibration {
        let edx = self.edx.as_ref();
        Calibration {
            x_scale: self.scan.width.pixel_size,
            x_units: self.scan.width.pixel_size_units.clone(),
            y_scale: self.scan.height.pixel_size,
            y_units: self.scan.height.pixel_size_units.clone(),
            energy_scale: edx.and_then(|e| e.dispersion),
            energy_units: edx.and_then(|e| e.dispersion_unit.clone()),
            energy_offset: edx.and_then(|e| e.energy_offset),
        }
    }

    /// Spectral cube shape, when the acquisition carries EDX data.
    pub fn spectral_shape(&self) -> Option<SpectralShape> {
        self.edx.as_ref().map(|edx| SpectralShape {
            channels: edx.channels,
            height: self.scan.height.pixels,
            width: self.scan.width.pixels,
        })
    }
}
