use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{Array, ArrayRef, Float64Array, UInt32Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use image::{DynamicImage, ImageBuffer, Luma};
use ndarray::Array2;
use num_traits::Zero;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::Serialize;

use super::model::{AcquisitionMetadata, CsrMatrix, ImageFrame, SpectralFrame, SpectralShape};

// ---------------------------------------------------------------------------
// Image frames
// ---------------------------------------------------------------------------

/// Load a grayscale frame. Format is picked by the `image` crate from the
/// extension; 16-bit sources stay 16-bit, everything else becomes 8-bit.
pub fn load_image(path: &Path) -> Result<ImageFrame> {
    let img = image::open(path).with_context(|| format!("reading image {}", path.display()))?;
    let frame = match img {
        DynamicImage::ImageLuma8(buf) => luma_to_array(buf).map(ImageFrame::Gray8),
        DynamicImage::ImageLuma16(buf) => luma_to_array(buf).map(ImageFrame::Gray16),
        other if other.color().bytes_per_pixel() / other.color().channel_count() > 1 => {
            log::debug!("{}: converting {:?} to 16-bit gray", path.display(), other.color());
            luma_to_array(other.to_luma16()).map(ImageFrame::Gray16)
        }
        other => {
            log::debug!("{}: converting {:?} to 8-bit gray", path.display(), other.color());
            luma_to_array(other.to_luma8()).map(ImageFrame::Gray8)
        }
    };
    frame.with_context(|| format!("unpacking pixels of {}", path.display()))
}

fn luma_to_array<P>(buf: ImageBuffer<Luma<P>, Vec<P>>) -> Result<Array2<P>>
where
    Luma<P>: image::Pixel<Subpixel = P>,
    P: image::Primitive,
{
    let (w, h) = buf.dimensions();
    Ok(Array2::from_shape_vec((h as usize, w as usize), buf.into_raw())?)
}

fn array_to_luma<P>(pixels: &Array2<P>) -> Result<ImageBuffer<Luma<P>, Vec<P>>>
where
    Luma<P>: image::Pixel<Subpixel = P>,
    P: image::Primitive,
{
    let (h, w) = pixels.dim();
    let raw: Vec<P> = pixels.iter().copied().collect();
    ImageBuffer::from_raw(w as u32, h as u32, raw).context("pixel buffer size mismatch")
}

/// Save a frame in its own bit depth; the extension picks PNG or TIFF.
pub fn save_image(path: &Path, frame: &ImageFrame) -> Result<()> {
    match frame {
        ImageFrame::Gray8(a) => array_to_luma(a)?.save(path),
        ImageFrame::Gray16(a) => array_to_luma(a)?.save(path),
    }
    .with_context(|| format!("writing image {}", path.display()))
}

// ---------------------------------------------------------------------------
// Sparse containers (Parquet)
// ---------------------------------------------------------------------------

/// Value types that can populate the `value` column of a sparse file.
pub trait SparseValue: Copy + Zero {
    const DATA_TYPE: DataType;
    fn to_array(values: Vec<Self>) -> ArrayRef;
    fn from_array(col: &ArrayRef) -> Result<Vec<Self>>;
}

macro_rules! sparse_value {
    ($ty:ty, $data_type:expr, $array:ty) => {
        impl SparseValue for $ty {
            const DATA_TYPE: DataType = $data_type;

            fn to_array(values: Vec<Self>) -> ArrayRef {
                Arc::new(<$array>::from(values))
            }

            fn from_array(col: &ArrayRef) -> Result<Vec<Self>> {
                let arr = col
                    .as_any()
                    .downcast_ref::<$array>()
                    .with_context(|| format!("expected {:?} values, got {:?}", $data_type, col.data_type()))?;
                if arr.null_count() > 0 {
                    bail!("null entries in value column");
                }
                Ok(arr.values().to_vec())
            }
        }
    };
}

sparse_value!(u32, DataType::UInt32, UInt32Array);
sparse_value!(u64, DataType::UInt64, UInt64Array);
sparse_value!(f64, DataType::Float64, Float64Array);

const META_HEIGHT: &str = "height";
const META_WIDTH: &str = "width";
const META_CHANNELS: &str = "channels";

/// Write a `(pixels x channels)` sparse matrix as `pixel, channel, value`
/// rows; the cube shape travels in the schema metadata.
pub fn save_sparse<T: SparseValue>(path: &Path, shape: SpectralShape, matrix: &CsrMatrix<T>) -> Result<()> {
    save_sparse_with_metadata(path, shape, matrix, &[])
}

/// [`save_sparse`] plus extra key-value pairs (e.g. axis calibration) in
/// the schema metadata.
pub fn save_sparse_with_metadata<T: SparseValue>(
    path: &Path,
    shape: SpectralShape,
    matrix: &CsrMatrix<T>,
    extra: &[(String, String)],
) -> Result<()> {
    let metadata: HashMap<String, String> = [
        (META_HEIGHT, shape.height),
        (META_WIDTH, shape.width),
        (META_CHANNELS, shape.channels),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .chain(extra.iter().cloned())
    .collect();
    let schema = Arc::new(Schema::new_with_metadata(
        vec![
            Field::new("pixel", DataType::UInt64, false),
            Field::new("channel", DataType::UInt64, false),
            Field::new("value", T::DATA_TYPE, false),
        ],
        metadata,
    ));

    let mut pixels = Vec::with_capacity(matrix.nnz());
    let mut channels = Vec::with_capacity(matrix.nnz());
    let mut values = Vec::with_capacity(matrix.nnz());
    for (p, c, v) in matrix.iter() {
        pixels.push(p as u64);
        channels.push(c as u64);
        values.push(v);
    }

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(UInt64Array::from(pixels)),
            Arc::new(UInt64Array::from(channels)),
            T::to_array(values),
        ],
    )
    .context("assembling sparse record batch")?;

    let file = std::fs::File::create(path)
        .with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None).context("creating parquet writer")?;
    writer.write(&batch).context("writing sparse record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(())
}

/// Read a file written by [`save_sparse`].
pub fn load_sparse<T: SparseValue>(path: &Path) -> Result<(SpectralShape, CsrMatrix<T>)> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("reading parquet metadata")?;

    let schema_meta = builder.schema().metadata().clone();
    let dim = |key: &str| -> Result<usize> {
        schema_meta
            .get(key)
            .with_context(|| format!("{}: missing '{key}' in schema metadata", path.display()))?
            .parse()
            .with_context(|| format!("{}: bad '{key}' in schema metadata", path.display()))
    };
    let shape = SpectralShape {
        channels: dim(META_CHANNELS)?,
        height: dim(META_HEIGHT)?,
        width: dim(META_WIDTH)?,
    };

    let reader = builder.build().context("building parquet reader")?;
    let mut triplets = Vec::new();
    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        let pixels = u64::from_array(column(&batch, "pixel")?)?;
        let channels = u64::from_array(column(&batch, "channel")?)?;
        let values = T::from_array(column(&batch, "value")?)?;
        triplets.extend(
            pixels
                .into_iter()
                .zip(channels)
                .zip(values)
                .map(|((p, c), v)| (p as usize, c as usize, v)),
        );
    }

    let matrix = CsrMatrix::from_triplets(shape.pixels(), shape.channels, triplets)
        .with_context(|| format!("{}: inconsistent sparse entries", path.display()))?;
    Ok((shape, matrix))
}

/// Schema key-value metadata of a sparse file.
pub fn sparse_metadata(path: &Path) -> Result<HashMap<String, String>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("reading parquet metadata")?;
    Ok(builder.schema().metadata().clone())
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|_| anyhow::anyhow!("Parquet file missing '{name}' column"))?;
    Ok(batch.column(idx))
}

pub fn load_spectrum(path: &Path) -> Result<SpectralFrame> {
    let (shape, counts) = load_sparse::<u32>(path)?;
    SpectralFrame::new(shape, counts)
}

pub fn save_spectrum(path: &Path, frame: &SpectralFrame) -> Result<()> {
    save_sparse(path, frame.shape(), frame.counts())
}

// ---------------------------------------------------------------------------
// Metadata and reports (JSON / CSV)
// ---------------------------------------------------------------------------

pub fn load_metadata(path: &Path) -> Result<AcquisitionMetadata> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serializing JSON")?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

/// Write a signed image as a CSV grid, one image row per record.
pub fn save_signed_grid(path: &Path, grid: &Array2<i64>) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    for row in grid.rows() {
        writer
            .write_record(row.iter().map(|v| v.to_string()))
            .context("writing CSV row")?;
    }
    writer.flush().context("flushing CSV")?;
    Ok(())
}

pub fn load_signed_grid(path: &Path) -> Result<Array2<i64>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut values = Vec::new();
    let mut width = None;
    let mut height = 0;
    for (row_no, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("CSV row {row_no}"))?;
        if *width.get_or_insert(record.len()) != record.len() {
            bail!("CSV row {row_no} has {} values, expected {:?}", record.len(), width);
        }
        for tok in record.iter() {
            values.push(
                tok.trim()
                    .parse::<i64>()
                    .with_context(|| format!("Row {row_no}: '{tok}' is not an integer"))?,
            );
        }
        height += 1;
    }
    Ok(Array2::from_shape_vec((height, width.unwrap_or(0)), values)?)
}

/// Non-hidden files in `dir` with the given extension, sorted by name.
pub fn list_frames(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("listing {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            let visible = p
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.'));
            visible && p.is_file() && p.extension().is_some_and(|e| e == extension)
        })
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_image_roundtrip_keeps_bit_depth() {
        let dir = tempfile::tempdir().unwrap();
        let frames = [
            ("a.png", ImageFrame::Gray8(array![[0u8, 10, 250], [1, 2, 3]])),
            ("b.png", ImageFrame::Gray16(array![[0u16, 1000], [65535, 7]])),
            ("c.tiff", ImageFrame::Gray16(array![[4u16, 40000]])),
        ];
        for (name, frame) in frames {
            let path = dir.path().join(name);
            save_image(&path, &frame).unwrap();
            assert_eq!(load_image(&path).unwrap(), frame, "{name}");
        }
    }

    #[test]
    fn test_spectrum_parquet_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let shape = SpectralShape { channels: 5, height: 2, width: 3 };
        let counts = CsrMatrix::from_triplets(6, 5, vec![(0, 4, 3u32), (5, 0, 1), (2, 2, 8)]).unwrap();
        let frame = SpectralFrame::new(shape, counts).unwrap();
        let path = dir.path().join("frame_0001.parquet");
        save_spectrum(&path, &frame).unwrap();
        assert_eq!(load_spectrum(&path).unwrap(), frame);
    }

    #[test]
    fn test_sparse_float_values() {
        let dir = tempfile::tempdir().unwrap();
        let shape = SpectralShape { channels: 2, height: 1, width: 2 };
        let m = CsrMatrix::from_triplets(2, 2, vec![(1, 1, -0.5f64)]).unwrap();
        let path = dir.path().join("diff.parquet");
        save_sparse(&path, shape, &m).unwrap();
        let (read_shape, read) = load_sparse::<f64>(&path).unwrap();
        assert_eq!(read_shape, shape);
        assert_eq!(read, m);
        // wrong value type is reported, not coerced
        assert!(load_sparse::<u32>(&path).is_err());
    }

    #[test]
    fn test_sparse_extra_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let shape = SpectralShape { channels: 2, height: 1, width: 1 };
        let m = CsrMatrix::from_triplets(1, 2, vec![(0, 1, 4u64)]).unwrap();
        let path = dir.path().join("total.parquet");
        let extra = vec![("energy_scale".to_string(), "10".to_string())];
        save_sparse_with_metadata(&path, shape, &m, &extra).unwrap();

        let meta = sparse_metadata(&path).unwrap();
        assert_eq!(meta.get("energy_scale").map(String::as_str), Some("10"));
        assert_eq!(meta.get("channels").map(String::as_str), Some("2"));
        assert_eq!(load_sparse::<u64>(&path).unwrap(), (shape, m));
    }

    #[test]
    fn test_signed_grid_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("difference_images.csv");
        let grid = array![[-3i64, 0], [7, -1]];
        save_signed_grid(&path, &grid).unwrap();
        assert_eq!(load_signed_grid(&path).unwrap(), grid);
    }

    #[test]
    fn test_list_frames_skips_hidden_and_other_extensions() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["f_02.png", "f_01.png", ".f_00.png", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let names: Vec<_> = list_frames(dir.path(), "png")
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["f_01.png", "f_02.png"]);
    }
}
