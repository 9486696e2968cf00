//! Walks a registration result folder frame by frame, warps every image
//! (and spectrum) with its deformation field and aggregates the results.
//!
//! Run folder layout:
//!
//! ```text
//! <root>/
//!   *.par                      registration config (first by name)
//!   metadata.json              acquisition metadata (optional)
//!   images/<base>_<NNNN>.<ext>
//!   spectra/<base>_<NNNN>.parquet
//!   nonrigid_results/stage<S>/<i>[-r]/deformation_<LL>_{0,1}.dat.bz2
//!   deformedImages/            written
//!   deformedSpectra/           written
//!   processed_results/         written
//! ```

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use rayon::prelude::*;
use serde::Serialize;

use crate::aggregate::{AggregateResult, ProductSummary, RunAccumulator};
use crate::data::config::ConfigRecord;
use crate::data::deformation::DeformationField;
use crate::data::loader;
use crate::data::model::{
    AcquisitionMetadata, BitDepth, Calibration, ImageFrame, SpectralFrame, SpectralShape,
};
use crate::error::{AggregateError, PipelineError};
use crate::sequence::{stage_root, FrameJob, FrameSequence};
use crate::warp::{self, SamplePlan};

/// Extension of sparse spectral frame files.
pub const SPECTRUM_EXTENSION: &str = "parquet";

// ---------------------------------------------------------------------------
// Options and layout
// ---------------------------------------------------------------------------

/// Folder names and run switches. Defaults match the registration tool's
/// result layout.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub images_dir: String,
    pub spectra_dir: String,
    pub results_dir: String,
    pub deformed_images_dir: String,
    pub deformed_spectra_dir: String,
    pub products_dir: String,
    pub metadata_file: String,
    /// Stage folder to read; `None` reads the final stage.
    pub stage: Option<usize>,
    /// Worker threads; `None` uses rayon's default.
    pub threads: Option<usize>,
    /// Compute and write the averaged products after warping.
    pub aggregate: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            images_dir: "images".into(),
            spectra_dir: "spectra".into(),
            results_dir: "nonrigid_results".into(),
            deformed_images_dir: "deformedImages".into(),
            deformed_spectra_dir: "deformedSpectra".into(),
            products_dir: "processed_results".into(),
            metadata_file: "metadata.json".into(),
            stage: None,
            threads: None,
            aggregate: true,
        }
    }
}

/// Resolved folders of one run.
#[derive(Debug, Clone)]
pub struct RunLayout {
    pub images: PathBuf,
    /// Present when the acquisition has spectral data on disk.
    pub spectra: Option<PathBuf>,
    pub stage_root: PathBuf,
    pub deformed_images: PathBuf,
    pub deformed_spectra: PathBuf,
    pub products: PathBuf,
}

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

/// A frame that could not be warped. The run carries on without it.
#[derive(Debug)]
pub struct FrameFailure {
    pub index: usize,
    pub error: anyhow::Error,
}

#[derive(Debug)]
pub struct RunReport {
    pub processed: Vec<usize>,
    pub skipped: Vec<usize>,
    pub failures: Vec<FrameFailure>,
    pub aggregate: Option<AggregateResult>,
    pub warp_time: Duration,
    pub aggregate_time: Duration,
}

#[derive(Debug, Serialize)]
struct FailureSummary {
    index: usize,
    cause: String,
}

/// Serialized form of a [`RunReport`].
#[derive(Debug, Serialize)]
pub struct RunSummary {
    processed: Vec<usize>,
    skipped: Vec<usize>,
    failed: Vec<FailureSummary>,
    warp_seconds: f64,
    aggregate_seconds: f64,
    products: Option<ProductSummary>,
}

impl RunReport {
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            processed: self.processed.clone(),
            skipped: self.skipped.clone(),
            failed: self
                .failures
                .iter()
                .map(|f| FailureSummary {
                    index: f.index,
                    cause: format!("{:#}", f.error),
                })
                .collect(),
            warp_seconds: self.warp_time.as_secs_f64(),
            aggregate_seconds: self.aggregate_time.as_secs_f64(),
            products: self.aggregate.as_ref().map(AggregateResult::summary),
        }
    }

    /// One-line processed/skipped/failed count.
    pub fn status_line(&self) -> String {
        format!(
            "{} frames processed, {} skipped, {} failed",
            self.processed.len(),
            self.skipped.len(),
            self.failures.len()
        )
    }
}

/// `{h}h:{m}m:{s}s`
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    format!("{}h:{}m:{}s", total / 3600, (total % 3600) / 60, total % 60)
}

// ---------------------------------------------------------------------------
// Per-frame tally (rayon fold state)
// ---------------------------------------------------------------------------

struct FrameOutput {
    index: usize,
    original: ImageFrame,
    warped: ImageFrame,
    spectra: Option<(SpectralFrame, SpectralFrame)>,
    /// Files written for this frame, removed again if it is rejected later.
    written: Vec<PathBuf>,
}

/// Size and bit depth every frame of a run must share. Fixed before the
/// parallel pass so that no two fold pieces can accept incompatible frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameReference {
    dim: (usize, usize),
    depth: BitDepth,
}

#[derive(Default)]
struct RunTally {
    processed: Vec<usize>,
    failures: Vec<FrameFailure>,
    accumulator: RunAccumulator,
}

impl RunTally {
    fn record(mut self, index: usize, outcome: anyhow::Result<FrameOutput>) -> Self {
        let result = outcome.and_then(|out| {
            let spectra = out.spectra.as_ref().map(|(b, a)| (b, a));
            if let Err(e) = self.accumulator.add_frame(&out.original, &out.warped, spectra) {
                discard(&out.written);
                return Err(anyhow::Error::new(e)
                    .context(format!("frame {} does not match the other frames", out.index)));
            }
            Ok(out.index)
        });
        match result {
            Ok(index) => self.processed.push(index),
            Err(error) => {
                log::error!("Frame {index} failed: {error:#}");
                self.failures.push(FrameFailure { index, error });
            }
        }
        self
    }

    fn merge(mut self, other: Self) -> Result<Self, AggregateError> {
        self.processed.extend(other.processed);
        self.failures.extend(other.failures);
        self.accumulator = self.accumulator.merge(other.accumulator)?;
        Ok(self)
    }
}

/// Best-effort removal of a failed frame's outputs.
fn discard(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => log::debug!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Could not remove {}: {e}", path.display()),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A run folder whose config and metadata were read successfully.
pub struct Pipeline {
    root: PathBuf,
    options: PipelineOptions,
    config: ConfigRecord,
    metadata: Option<AcquisitionMetadata>,
}

impl Pipeline {
    /// Read the config record and metadata of a run folder. Any config
    /// problem is fatal here, before a single frame is touched.
    pub fn open(root: &Path, options: PipelineOptions) -> Result<Self, PipelineError> {
        log::info!("Looking for config file in {}", root.display());
        let config_path = ConfigRecord::discover(root)?;
        log::info!("Reading registration parameters from {}", config_path.display());
        let config = ConfigRecord::load(&config_path)?;
        Self::with_config(root, options, config)
    }

    /// Like [`Pipeline::open`] with an already parsed config record.
    pub fn with_config(
        root: &Path,
        options: PipelineOptions,
        config: ConfigRecord,
    ) -> Result<Self, PipelineError> {
        let metadata_path = root.join(&options.metadata_file);
        let metadata = if metadata_path.is_file() {
            Some(loader::load_metadata(&metadata_path).map_err(PipelineError::Metadata)?)
        } else {
            log::warn!("No {} found; spectra will not be processed", metadata_path.display());
            None
        };

        Ok(Self {
            root: root.to_path_buf(),
            options,
            config,
            metadata,
        })
    }

    pub fn config(&self) -> &ConfigRecord {
        &self.config
    }

    pub fn sequence(&self) -> FrameSequence {
        FrameSequence::from_config(&self.config)
    }

    /// Stage folder actually read.
    pub fn stage(&self) -> usize {
        self.options.stage.unwrap_or(self.config.stage_count())
    }

    fn spectral_shape(&self) -> Option<SpectralShape> {
        self.metadata.as_ref().and_then(AcquisitionMetadata::spectral_shape)
    }

    pub fn layout(&self) -> RunLayout {
        let o = &self.options;
        let spectra = self.root.join(&o.spectra_dir);
        let has_spectra = self.spectral_shape().is_some() && spectra.is_dir();
        RunLayout {
            images: self.root.join(&o.images_dir),
            spectra: has_spectra.then_some(spectra),
            stage_root: stage_root(&self.root.join(&o.results_dir), self.stage()),
            deformed_images: self.root.join(&o.deformed_images_dir),
            deformed_spectra: self.root.join(&o.deformed_spectra_dir),
            products: self.root.join(&o.products_dir),
        }
    }

    /// Warp every frame of the sequence, then aggregate.
    pub fn run(&self) -> Result<RunReport, PipelineError> {
        let layout = self.layout();
        let sequence = self.sequence();

        create_dir(&layout.deformed_images)?;
        if layout.spectra.is_some() {
            create_dir(&layout.deformed_spectra)?;
        }

        log::info!(
            "Warping {} of {} frames with stage {} level {} fields",
            sequence.len(),
            self.config.frame_count(),
            self.stage(),
            self.config.level_tag()
        );
        for index in sequence.skipped() {
            log::info!("Skipping frame {index}");
        }

        let start = Instant::now();
        let reference = self.reference_frame(&layout, &sequence);
        let jobs = sequence.jobs(&layout.stage_root);
        let warp_all = || -> Result<RunTally, AggregateError> {
            jobs.par_iter()
                .fold(RunTally::default, |tally, job| {
                    let outcome = self.process_frame(job, &layout, reference);
                    tally.record(job.index, outcome)
                })
                .collect::<Vec<_>>()
                .into_iter()
                .try_fold(RunTally::default(), RunTally::merge)
        };
        let mut tally = match self.options.threads {
            Some(n) => rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()?
                .install(warp_all)?,
            None => warp_all()?,
        };
        tally.processed.sort_unstable();
        tally.failures.sort_by_key(|f| f.index);
        let warp_time = start.elapsed();
        log::info!("Finished applying deformations in {}", format_elapsed(warp_time));

        let start = Instant::now();
        let aggregate = if self.options.aggregate && !tally.processed.is_empty() {
            let result = tally.accumulator.finish()?.with_calibration(self.calibration());
            create_dir(&layout.products)?;
            result.save(&layout.products).map_err(PipelineError::Products)?;
            Some(result)
        } else {
            if self.options.aggregate {
                log::warn!("No frame was processed; nothing to aggregate");
            }
            None
        };
        let aggregate_time = start.elapsed();

        let report = RunReport {
            processed: tally.processed,
            skipped: sequence.skipped().to_vec(),
            failures: tally.failures,
            aggregate,
            warp_time,
            aggregate_time,
        };
        if report.aggregate.is_some() {
            log::info!("Finished calculation of averages in {}", format_elapsed(aggregate_time));
            loader::save_json(&layout.products.join("run_summary.json"), &report.summary())
                .map_err(PipelineError::Products)?;
        }
        log::info!("{}", report.status_line());
        Ok(report)
    }

    fn calibration(&self) -> Calibration {
        self.metadata
            .as_ref()
            .map(AcquisitionMetadata::calibration)
            .unwrap_or_default()
    }

    /// Size and depth of the first readable frame in sequence order. With
    /// metadata, frames of another size than the scan are passed over.
    fn reference_frame(&self, layout: &RunLayout, sequence: &FrameSequence) -> Option<FrameReference> {
        let pattern = self.config.name_pattern();
        let scan_dim = self.metadata.as_ref().map(AcquisitionMetadata::frame_dim);
        let reference = sequence.indices().iter().find_map(|&index| {
            let frame = loader::load_image(&layout.images.join(pattern.file_name(index))).ok()?;
            let dim = frame.dim();
            if scan_dim.is_some_and(|d| d != dim) {
                return None;
            }
            Some(FrameReference { dim, depth: frame.bit_depth() })
        });
        match reference {
            Some(r) => log::info!("Frames are {}x{} {:?}", r.dim.0, r.dim.1, r.depth),
            None => log::warn!("No frame of the run could be read"),
        }
        reference
    }

    fn process_frame(
        &self,
        job: &FrameJob,
        layout: &RunLayout,
        reference: Option<FrameReference>,
    ) -> anyhow::Result<FrameOutput> {
        let index = job.index;
        let pattern = self.config.name_pattern();
        log::info!("Processing frame {index}");

        let (x_path, y_path) = job.field_paths(&self.config.level_tag());
        let field = DeformationField::read(&x_path, &y_path)
            .with_context(|| format!("decoding deformation fields in {}", job.deformation_dir.display()))?;
        let plan = SamplePlan::new(&field);
        if plan.out_of_bounds() > 0 {
            log::debug!("Frame {index}: {} samples fall outside the frame", plan.out_of_bounds());
        }

        let image_name = pattern.file_name(index);
        let original = loader::load_image(&layout.images.join(&image_name))?;
        let Some(reference) = reference else {
            bail!("no reference frame to check {image_name} against");
        };
        let found = FrameReference { dim: original.dim(), depth: original.bit_depth() };
        if found != reference {
            bail!(
                "image {image_name} is {:?} {:?}, the run's frames are {:?} {:?}",
                found.dim,
                found.depth,
                reference.dim,
                reference.depth
            );
        }
        let warped = warp::warp_image(&plan, &original)?;

        let spectra = match (&layout.spectra, self.spectral_shape()) {
            (Some(dir), Some(expected)) => {
                let name = pattern.file_name_with_extension(index, SPECTRUM_EXTENSION);
                let spectrum = loader::load_spectrum(&dir.join(&name))?;
                if spectrum.shape() != expected {
                    bail!(
                        "spectral frame {name} is {:?}, metadata says {:?}",
                        spectrum.shape(),
                        expected
                    );
                }
                let warped_spectrum = warp::warp_spectrum(&plan, &spectrum)?;
                Some((name, spectrum, warped_spectrum))
            }
            _ => None,
        };

        // Everything fallible is done; persist last so a failed frame leaves
        // nothing behind.
        let mut written = Vec::new();
        let warped_spectrum = spectra.as_ref().map(|(name, _, after)| (name.as_str(), after));
        if let Err(e) = save_outputs(layout, &image_name, &warped, warped_spectrum, &mut written) {
            discard(&written);
            return Err(e);
        }
        log::info!("Wrote deformed frame {index}");

        Ok(FrameOutput {
            index,
            original,
            warped,
            spectra: spectra.map(|(_, before, after)| (before, after)),
            written,
        })
    }

    /// Aggregate image/spectrum folders already on disk, e.g. after an
    /// earlier warp run. Unreadable files are logged and left out.
    pub fn aggregate_existing(&self) -> Result<AggregateResult, PipelineError> {
        let layout = self.layout();
        let extension = &self.config.name_pattern().extension;
        let mut acc = RunAccumulator::default();

        for (dir, before) in [(&layout.images, true), (&layout.deformed_images, false)] {
            for path in list_or_empty(dir, extension) {
                match loader::load_image(&path) {
                    Ok(frame) if before => acc.add_before_image(&frame)?,
                    Ok(frame) => acc.add_after_image(&frame)?,
                    Err(e) => log::error!("Skipping {}: {e:#}", path.display()),
                }
            }
        }
        if let Some(spectra) = &layout.spectra {
            for (dir, before) in [(spectra, true), (&layout.deformed_spectra, false)] {
                for path in list_or_empty(dir, SPECTRUM_EXTENSION) {
                    match loader::load_spectrum(&path) {
                        Ok(frame) if before => acc.add_before_spectrum(&frame)?,
                        Ok(frame) => acc.add_after_spectrum(&frame)?,
                        Err(e) => log::error!("Skipping {}: {e:#}", path.display()),
                    }
                }
            }
        }

        log::info!("Aggregating {} deformed frames", acc.frames());
        let result = acc.finish()?.with_calibration(self.calibration());
        create_dir(&layout.products)?;
        result.save(&layout.products).map_err(PipelineError::Products)?;
        Ok(result)
    }
}

/// Write a frame's warped image and spectrum, noting each path before it
/// is created.
fn save_outputs(
    layout: &RunLayout,
    image_name: &str,
    warped: &ImageFrame,
    spectrum: Option<(&str, &SpectralFrame)>,
    written: &mut Vec<PathBuf>,
) -> anyhow::Result<()> {
    let image_path = layout.deformed_images.join(image_name);
    written.push(image_path.clone());
    loader::save_image(&image_path, warped)?;
    if let Some((name, frame)) = spectrum {
        let path = layout.deformed_spectra.join(name);
        written.push(path.clone());
        loader::save_spectrum(&path, frame)?;
    }
    Ok(())
}

fn list_or_empty(dir: &Path, extension: &str) -> Vec<PathBuf> {
    loader::list_frames(dir, extension).unwrap_or_else(|e| {
        log::warn!("{e:#}");
        Vec::new()
    })
}

fn create_dir(path: &Path) -> Result<(), PipelineError> {
    std::fs::create_dir_all(path).map_err(|source| PipelineError::OutputDir {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(3 * 3600 + 25 * 60 + 7)), "3h:25m:7s");
        assert_eq!(format_elapsed(Duration::from_millis(900)), "0h:0m:0s");
    }

    #[test]
    fn test_open_without_config_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = Pipeline::open(dir.path(), PipelineOptions::default()).err().unwrap();
        assert!(matches!(
            err,
            PipelineError::Config(crate::error::ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_bad_metadata_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("metadata.json"), "{ not json").unwrap();
        let config = ConfigRecord::parse(
            "templateNamePattern /x/f_%02d.png\nnumTemplates 2\nstopLevel 3\nnumExtraStages 0\n",
        )
        .unwrap();
        let result = Pipeline::with_config(dir.path(), PipelineOptions::default(), config);
        assert!(matches!(result, Err(PipelineError::Metadata(_))));
    }

    #[test]
    fn test_layout_uses_final_stage_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigRecord::parse(
            "templateNamePattern /x/f_%02d.png\nnumTemplates 2\nstopLevel 3\nnumExtraStages 2\n",
        )
        .unwrap();
        let pipeline = Pipeline::with_config(dir.path(), PipelineOptions::default(), config).unwrap();
        let layout = pipeline.layout();
        assert_eq!(layout.stage_root, dir.path().join("nonrigid_results").join("stage3"));
        assert!(layout.spectra.is_none());
    }
}
