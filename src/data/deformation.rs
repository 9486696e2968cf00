use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use ndarray::Array2;

use crate::error::{DecodeError, WarpError};

// ---------------------------------------------------------------------------
// Element precision
// ---------------------------------------------------------------------------

/// Element type of a deformation field payload, selected by the magic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// `P8`: 32-bit float.
    Single,
    /// `P9`: 64-bit float.
    Double,
}

impl Precision {
    fn from_code(code: u8) -> Result<Self, DecodeError> {
        match code {
            b'8' => Ok(Precision::Single),
            b'9' => Ok(Precision::Double),
            other => Err(DecodeError::NotImplemented(other as char)),
        }
    }

    fn code(self) -> char {
        match self {
            Precision::Single => '8',
            Precision::Double => '9',
        }
    }

    /// Size of one payload element in bytes.
    pub fn element_size(self) -> usize {
        match self {
            Precision::Single => 4,
            Precision::Double => 8,
        }
    }
}

// ---------------------------------------------------------------------------
// FieldComponent – one decoded file
// ---------------------------------------------------------------------------

/// One displacement component (X or Y) as stored in a single file.
///
/// Values are widened to `f64` in memory; `precision` remembers the on-disk
/// element type so that encoding reproduces the original bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldComponent {
    pub precision: Precision,
    pub values: Array2<f64>,
}

impl FieldComponent {
    /// (height, width)
    pub fn shape(&self) -> (usize, usize) {
        self.values.dim()
    }
}

// ---------------------------------------------------------------------------
// DeformationField – an (dX, dY) pair for one frame/stage
// ---------------------------------------------------------------------------

/// Paired displacement fields for one frame. Both components share a shape.
#[derive(Debug, Clone, PartialEq)]
pub struct DeformationField {
    pub dx: Array2<f64>,
    pub dy: Array2<f64>,
}

impl DeformationField {
    pub fn new(dx: Array2<f64>, dy: Array2<f64>) -> Result<Self, WarpError> {
        if dx.dim() != dy.dim() {
            return Err(WarpError::ShapeMismatch {
                what: "dY field",
                expected: dx.dim(),
                actual: dy.dim(),
            });
        }
        Ok(Self { dx, dy })
    }

    /// All-zero displacement of the given (height, width).
    pub fn zeros(height: usize, width: usize) -> Self {
        Self {
            dx: Array2::zeros((height, width)),
            dy: Array2::zeros((height, width)),
        }
    }

    pub fn from_components(x: FieldComponent, y: FieldComponent) -> Result<Self, WarpError> {
        Self::new(x.values, y.values)
    }

    /// Decode the X and Y component files of one frame.
    pub fn read(x_path: &Path, y_path: &Path) -> anyhow::Result<Self> {
        let x = read_component(x_path)?;
        let y = read_component(y_path)?;
        Ok(Self::from_components(x, y)?)
    }

    /// (height, width)
    pub fn shape(&self) -> (usize, usize) {
        self.dx.dim()
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Whether a path names a bzip2 container, judged by extension.
pub fn is_compressed(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("bz2") | Some("q2bz")
    )
}

/// Open and decode one component file, decompressing `.bz2`/`.q2bz` on the fly.
pub fn read_component(path: &Path) -> Result<FieldComponent, DecodeError> {
    let file = File::open(path)?;
    if is_compressed(path) {
        decode(bzip2::read::BzDecoder::new(file))
    } else {
        decode(file)
    }
}

/// Decode a raw (already decompressed) deformation field stream.
///
/// ```text
/// P8|P9\n
/// <comment>\n
/// <width> <height>\n
/// <max>\n                 scanned byte-wise
/// <height*width little-endian floats>
/// ```
pub fn decode<R: Read>(source: R) -> Result<FieldComponent, DecodeError> {
    let mut reader = BufReader::new(source);

    let magic = read_header_line(&mut reader, "magic")?;
    let magic = trim_ascii_end(&magic);
    match magic.first() {
        Some(b'P') => {}
        _ => {
            return Err(DecodeError::Format(format!(
                "doesn't start with 'P': {:?}",
                String::from_utf8_lossy(magic)
            )))
        }
    }
    let code = magic
        .get(1)
        .copied()
        .ok_or_else(|| DecodeError::Format("magic line has no type code".into()))?;
    let precision = Precision::from_code(code)?;

    // Free-form comment, never parsed.
    read_header_line(&mut reader, "comment")?;

    let dims = read_header_line(&mut reader, "dimensions")?;
    let (width, height) = parse_dimensions(&dims)?;

    read_max_token(&mut reader)?;

    let mut payload = Vec::new();
    reader.read_to_end(&mut payload)?;

    let values = decode_payload(&payload, precision, height, width)?;
    Ok(FieldComponent { precision, values })
}

fn read_header_line<R: BufRead>(reader: &mut R, what: &str) -> Result<Vec<u8>, DecodeError> {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line)?;
    if n == 0 {
        return Err(DecodeError::Format(format!("stream ends before {what} line")));
    }
    Ok(line)
}

fn trim_ascii_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

fn parse_dimensions(line: &[u8]) -> Result<(usize, usize), DecodeError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| DecodeError::Format("dimension line is not ASCII".into()))?;
    let mut parts = text.split_whitespace().map(str::parse::<usize>);
    match (parts.next(), parts.next()) {
        (Some(Ok(width)), Some(Ok(height))) => Ok((width, height)),
        _ => Err(DecodeError::Format(format!(
            "expected '<width> <height>', got {:?}",
            text.trim_end()
        ))),
    }
}

/// Scanner state for the max token.
enum MaxScan {
    /// No digit consumed yet.
    Start,
    /// Accumulated value so far.
    Digits(u64),
}

/// Read the max token one byte at a time up to its single `\n` terminator.
///
/// The payload starts right after that byte and may itself contain `0x0A`,
/// so a line read here could swallow payload.
fn read_max_token<R: Read>(reader: &mut R) -> Result<u64, DecodeError> {
    let mut state = MaxScan::Start;
    let mut byte = [0u8; 1];
    loop {
        if reader.read(&mut byte)? == 0 {
            return Err(DecodeError::Format("stream ends inside max token".into()));
        }
        state = match (state, byte[0]) {
            (MaxScan::Start, b'\n') => {
                return Err(DecodeError::Format("empty max token".into()));
            }
            (MaxScan::Digits(value), b'\n') => return Ok(value),
            (MaxScan::Start, d @ b'0'..=b'9') => MaxScan::Digits(u64::from(d - b'0')),
            (MaxScan::Digits(value), d @ b'0'..=b'9') => value
                .checked_mul(10)
                .and_then(|v| v.checked_add(u64::from(d - b'0')))
                .map(MaxScan::Digits)
                .ok_or_else(|| DecodeError::Format("max token overflows".into()))?,
            (_, other) => {
                return Err(DecodeError::Format(format!(
                    "unexpected byte 0x{other:02x} in max token"
                )));
            }
        };
    }
}

fn decode_payload(
    payload: &[u8],
    precision: Precision,
    height: usize,
    width: usize,
) -> Result<Array2<f64>, DecodeError> {
    let size = precision.element_size();
    let expected = height
        .checked_mul(width)
        .ok_or_else(|| DecodeError::Format(format!("{width}x{height} overflows the element count")))?;
    let actual = payload.len() / size;
    if actual != expected || payload.len() % size != 0 {
        return Err(DecodeError::Truncated { expected, actual });
    }

    let values: Vec<f64> = match precision {
        Precision::Single => payload
            .chunks_exact(4)
            .map(|c| f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect(),
        Precision::Double => payload
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                f64::from_le_bytes(b)
            })
            .collect(),
    };

    Array2::from_shape_vec((height, width), values)
        .map_err(|e| DecodeError::Format(format!("reshape to {height}x{width}: {e}")))
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a component in the same layout `decode` reads.
///
/// The registration tool is the only real producer of these files; this
/// exists for synthetic data and tests.
pub fn encode<W: Write>(mut sink: W, component: &FieldComponent) -> std::io::Result<()> {
    let (height, width) = component.shape();
    writeln!(sink, "P{}", component.precision.code())?;
    writeln!(sink, "# deformation component written by match-warp")?;
    writeln!(sink, "{width} {height}")?;
    writeln!(sink, "255")?;
    for &v in component.values.iter() {
        match component.precision {
            Precision::Single => sink.write_all(&(v as f32).to_le_bytes())?,
            Precision::Double => sink.write_all(&v.to_le_bytes())?,
        }
    }
    sink.flush()
}

/// Encode to a file, bzip2-compressing when the extension asks for it.
pub fn write_component(path: &Path, component: &FieldComponent) -> std::io::Result<()> {
    let file = BufWriter::new(File::create(path)?);
    if is_compressed(path) {
        let mut encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
        encode(&mut encoder, component)?;
        encoder.finish()?.flush()
    } else {
        encode(file, component)
    }
}
