use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::{Array2, Array3};

use match_warp::data::config::{NamePattern, RegistrationParameters};
use match_warp::data::deformation::{write_component, FieldComponent, Precision};
use match_warp::data::loader;
use match_warp::data::model::{
    AcquisitionMetadata, AxisInfo, EdxInfo, ImageFrame, ScanInfo, SpectralFrame,
};
use match_warp::sequence::{stage_root, FrameSequence};

const HEIGHT: usize = 48;
const WIDTH: usize = 64;
const CHANNELS: usize = 32;
const FRAMES: usize = 6;
const LEVEL: u32 = 6;
const EXTRA_STAGES: usize = 2;

fn gaussian(x: f64, mu: f64, sigma: f64, amplitude: f64) -> f64 {
    amplitude * (-(x - mu).powi(2) / (2.0 * sigma.powi(2))).exp()
}

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5))
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

/// Bright round "particles" on a dark background, in [0, 1].
fn scene(height: usize, width: usize) -> Array2<f64> {
    let blobs = [(12.0, 15.0, 5.0), (30.0, 40.0, 7.0), (20.0, 52.0, 3.5), (38.0, 10.0, 4.0)];
    Array2::from_shape_fn((height, width), |(r, c)| {
        blobs
            .iter()
            .map(|&(br, bc, sigma)| {
                let d = ((r as f64 - br).powi(2) + (c as f64 - bc).powi(2)).sqrt();
                gaussian(d, 0.0, sigma, 1.0)
            })
            .sum::<f64>()
            .min(1.0)
    })
}

/// Integer drift of frame `i` in pixels (rows, cols). Frame 0 is the reference.
fn drift(i: usize) -> (isize, isize) {
    if i == 0 {
        return (0, 0);
    }
    let i = i as isize;
    (i % 3 - 1, 2 * i % 5 - 2)
}

/// `frame[r, c] = scene[r - dr, c - dc]`, clamped at the border.
fn shifted(base: &Array2<f64>, (dr, dc): (isize, isize)) -> Array2<f64> {
    let (h, w) = base.dim();
    Array2::from_shape_fn((h, w), |(r, c)| {
        let sr = (r as isize - dr).clamp(0, h as isize - 1) as usize;
        let sc = (c as isize - dc).clamp(0, w as isize - 1) as usize;
        base[[sr, sc]]
    })
}

fn image(frame: &Array2<f64>, rng: &mut SimpleRng) -> ImageFrame {
    ImageFrame::Gray16(frame.mapv(|v| {
        let level = 4000.0 + 50000.0 * v + rng.gauss(0.0, 600.0);
        level.clamp(0.0, u16::MAX as f64).round() as u16
    }))
}

/// Two emission lines whose strength follows the particle intensity.
fn spectrum(frame: &Array2<f64>, rng: &mut SimpleRng) -> SpectralFrame {
    let (h, w) = frame.dim();
    let cube = Array3::from_shape_fn((CHANNELS, h, w), |(ch, r, c)| {
        let line = gaussian(ch as f64, 8.0, 1.2, 3.0) + gaussian(ch as f64, 21.0, 1.5, 1.5);
        let expected = frame[[r, c]] * line;
        // Sparse counts: most pixel/channel pairs stay empty.
        if rng.next_f64() < expected.fract() {
            expected.floor() as u32 + 1
        } else {
            expected.floor() as u32
        }
    });
    SpectralFrame::from_dense(&cube)
}

/// Displacements that map frame `i` back onto the reference, in the
/// registration tool's normalized units.
fn field(i: usize) -> (FieldComponent, FieldComponent) {
    let (dr, dc) = drift(i);
    let scale = (HEIGHT.max(WIDTH) - 1) as f64;
    let component = |d: isize| FieldComponent {
        precision: Precision::Single,
        values: Array2::from_elem((HEIGHT, WIDTH), d as f64 / scale),
    };
    (component(dc), component(dr))
}

fn write_fields(root: &Path, sequence: &FrameSequence, level_tag: &str) -> Result<()> {
    for stage in 1..=EXTRA_STAGES + 1 {
        let stage_dir = stage_root(&root.join("nonrigid_results"), stage);
        for job in sequence.jobs(&stage_dir) {
            std::fs::create_dir_all(&job.deformation_dir)?;
            let (x, y) = field(job.index);
            let (x_path, y_path) = job.field_paths(level_tag);
            write_component(&x_path, &x).with_context(|| format!("writing {}", x_path.display()))?;
            write_component(&y_path, &y).with_context(|| format!("writing {}", y_path.display()))?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let root = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("sample_run"));
    let images = root.join("images");
    let spectra = root.join("spectra");
    std::fs::create_dir_all(&images)?;
    std::fs::create_dir_all(&spectra)?;

    let mut rng = SimpleRng::new(42);
    let skip: BTreeSet<usize> = [3].into_iter().collect();

    let params = RegistrationParameters {
        name_pattern: images.join("frame_%02d.tiff").display().to_string(),
        root: root.clone(),
        precision_level: LEVEL,
        frame_count: FRAMES,
        skip_frames: skip.clone(),
        extra_stages: EXTRA_STAGES,
        ..RegistrationParameters::default()
    };
    params.write(&root.join("registration.par"))?;

    let metadata = AcquisitionMetadata {
        scan: ScanInfo {
            height: AxisInfo {
                pixels: HEIGHT,
                pixel_size: Some(0.21),
                pixel_size_units: Some("nm".into()),
            },
            width: AxisInfo {
                pixels: WIDTH,
                pixel_size: Some(0.21),
                pixel_size_units: Some("nm".into()),
            },
        },
        edx: Some(EdxInfo {
            channels: CHANNELS,
            dispersion: Some(10.0),
            dispersion_unit: Some("eV".into()),
            energy_offset: Some(0.0),
        }),
    };
    loader::save_json(&root.join("metadata.json"), &metadata)?;

    let pattern = NamePattern::parse(&params.name_pattern)?;
    let base = scene(HEIGHT, WIDTH);
    for i in 0..FRAMES {
        let frame = shifted(&base, drift(i));
        loader::save_image(&images.join(pattern.file_name(i)), &image(&frame, &mut rng))?;
        loader::save_spectrum(
            &spectra.join(pattern.file_name_with_extension(i, "parquet")),
            &spectrum(&frame, &mut rng),
        )?;
    }

    let sequence = FrameSequence::new(FRAMES, &skip);
    write_fields(&root, &sequence, &format!("{LEVEL:02}"))?;

    println!(
        "Wrote {FRAMES} frames ({HEIGHT}x{WIDTH}, {CHANNELS} channels, frame 3 skipped) to {}",
        root.display()
    );
    Ok(())
}
