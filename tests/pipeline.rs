use std::path::Path;

use ndarray::Array2;

use match_warp::data::config::ConfigRecord;
use match_warp::data::deformation::{write_component, FieldComponent, Precision};
use match_warp::data::loader;
use match_warp::data::model::{CsrMatrix, ImageFrame, SpectralFrame, SpectralShape};
use match_warp::error::{ConfigError, PipelineError};
use match_warp::pipeline::{Pipeline, PipelineOptions};
use match_warp::sequence::{stage_root, FrameSequence};

const HEIGHT: usize = 4;
const WIDTH: usize = 5;
const FRAMES: usize = 5;

fn frame_pixels(i: usize) -> Array2<u8> {
    Array2::from_shape_fn((HEIGHT, WIDTH), |(r, c)| ((r * WIDTH + c) * 10 + i) as u8)
}

fn component(value: f64) -> FieldComponent {
    FieldComponent {
        precision: Precision::Double,
        values: Array2::from_elem((HEIGHT, WIDTH), value),
    }
}

/// Run folder with 5 frames, frame 2 skipped, frame 1 shifted one column
/// and frame 4 missing its deformation fields.
fn build_run(root: &Path, with_spectra: bool) {
    let images = root.join("images");
    std::fs::create_dir_all(&images).unwrap();
    std::fs::write(
        root.join("run.par"),
        format!(
            "templateNamePattern {}/f_%02d.png\n\
             numTemplates {FRAMES}\n\
             templateSkipNums {{ 2 }}\n\
             numExtraStages 0\n\
             stopLevel 3\n",
            images.display()
        ),
    )
    .unwrap();

    for i in 0..FRAMES {
        let path = images.join(format!("f_{i:02}.png"));
        loader::save_image(&path, &ImageFrame::Gray8(frame_pixels(i))).unwrap();
    }

    if with_spectra {
        std::fs::write(
            root.join("metadata.json"),
            r#"{
                "Scan": {
                    "Height": {"Pixels": 4, "PixelSize": 0.5, "PixelSize_Units": "nm"},
                    "Width": {"Pixels": 5, "PixelSize": 0.5, "PixelSize_Units": "nm"}
                },
                "EDX": {"Channels": 3, "Dispersion": 10.0, "Dispersion_Unit": "eV", "EnergyOffset": -0.1}
            }"#,
        )
        .unwrap();
        let spectra = root.join("spectra");
        std::fs::create_dir_all(&spectra).unwrap();
        let shape = SpectralShape { channels: 3, height: HEIGHT, width: WIDTH };
        for i in 0..FRAMES {
            let counts = CsrMatrix::from_triplets(shape.pixels(), 3, vec![(6, i % 3, 2u32)]).unwrap();
            let frame = SpectralFrame::new(shape, counts).unwrap();
            loader::save_spectrum(&spectra.join(format!("f_{i:02}.parquet")), &frame).unwrap();
        }
    }

    let sequence = FrameSequence::new(FRAMES, &[2].into_iter().collect());
    for job in sequence.jobs(&stage_root(&root.join("nonrigid_results"), 1)) {
        if job.index == 4 {
            continue;
        }
        std::fs::create_dir_all(&job.deformation_dir).unwrap();
        let dx = if job.index == 1 { 0.25 } else { 0.0 };
        let (x, y) = job.field_paths("03");
        write_component(&x, &component(dx)).unwrap();
        write_component(&y, &component(0.0)).unwrap();
    }
}

#[test]
fn test_run_warps_aggregates_and_reports_failures() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    build_run(root, true);

    let pipeline = Pipeline::open(root, PipelineOptions::default()).unwrap();
    let report = pipeline.run().unwrap();

    assert_eq!(report.processed, vec![0, 1, 3]);
    assert_eq!(report.skipped, vec![2]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].index, 4);

    let deformed = root.join("deformedImages");
    assert!(deformed.join("f_00.png").is_file());
    assert!(deformed.join("f_03.png").is_file());
    assert!(!deformed.join("f_02.png").exists());
    assert!(!deformed.join("f_04.png").exists());

    // Zero field: unchanged.
    let f0 = loader::load_image(&deformed.join("f_00.png")).unwrap();
    assert_eq!(f0, ImageFrame::Gray8(frame_pixels(0)));

    // One column to the right; the last column falls outside.
    let ImageFrame::Gray8(f1) = loader::load_image(&deformed.join("f_01.png")).unwrap() else {
        panic!("expected 8-bit frame");
    };
    let src = frame_pixels(1);
    assert_eq!(f1[[2, 0]], src[[2, 1]]);
    assert_eq!(f1[[2, 3]], src[[2, 4]]);
    let fill = src.iter().map(|&v| v as f64).sum::<f64>() / src.len() as f64;
    assert_eq!(f1[[2, 4]], fill.round() as u8);

    let products = report.aggregate.as_ref().unwrap();
    // Originals of frames 0, 1, 3: (3 * base + 4) / 3 floors to base + 1.
    assert_eq!(
        products.before_image,
        ImageFrame::Gray8(frame_pixels(0).mapv(|v| v + 1))
    );
    let spectra = products.spectra.as_ref().unwrap();
    assert_eq!(spectra.before.frames, 3);
    assert_eq!(spectra.before.total.get(6, 0), 4);
    assert_eq!(spectra.before.total.get(6, 1), 2);
    assert!(root.join("deformedSpectra").join("f_03.parquet").is_file());
    assert!(!root.join("deformedSpectra").join("f_02.parquet").exists());

    let out = root.join("processed_results");
    for name in [
        "averaged_original.png",
        "averaged_deformed.png",
        "difference_images.csv",
        "difference_spectrum.parquet",
        "run_summary.json",
    ] {
        assert!(out.join(name).is_file(), "{name}");
    }
    let difference = loader::load_signed_grid(&out.join("difference_images.csv")).unwrap();
    assert_eq!(difference, products.image_difference);

    assert_eq!(products.calibration.x_scale, Some(0.5));
    assert_eq!(products.calibration.energy_offset, Some(-0.1));
    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("run_summary.json")).unwrap()).unwrap();
    assert_eq!(summary["products"]["calibration"]["energy_units"], "eV");
    assert_eq!(summary["failed"][0]["index"], 4);
    let meta = loader::sparse_metadata(&out.join("averaged_deformed_spectrum.parquet")).unwrap();
    assert_eq!(meta.get("y_units").map(String::as_str), Some("nm"));
}

/// Run folder without skips where frame `i` is `sizes[i]` and its zero
/// field is `field_sizes[i]`.
fn build_sized_run(root: &Path, sizes: &[(usize, usize)], field_sizes: &[(usize, usize)]) {
    let images = root.join("images");
    std::fs::create_dir_all(&images).unwrap();
    std::fs::write(
        root.join("run.par"),
        format!(
            "templateNamePattern {}/f_%02d.png\nnumTemplates {}\nnumExtraStages 0\nstopLevel 3\n",
            images.display(),
            sizes.len()
        ),
    )
    .unwrap();
    for (i, &dim) in sizes.iter().enumerate() {
        let pixels = Array2::from_shape_fn(dim, |(r, c)| (r * 7 + c + i) as u8);
        loader::save_image(&images.join(format!("f_{i:02}.png")), &ImageFrame::Gray8(pixels)).unwrap();
    }
    let sequence = FrameSequence::new(sizes.len(), &Default::default());
    for job in sequence.jobs(&stage_root(&root.join("nonrigid_results"), 1)) {
        std::fs::create_dir_all(&job.deformation_dir).unwrap();
        let zero = FieldComponent {
            precision: Precision::Single,
            values: Array2::zeros(field_sizes[job.index]),
        };
        let (x, y) = job.field_paths("03");
        write_component(&x, &zero).unwrap();
        write_component(&y, &zero).unwrap();
    }
}

fn failed_indices(report: &match_warp::pipeline::RunReport) -> Vec<usize> {
    report.failures.iter().map(|f| f.index).collect()
}

#[test]
fn test_odd_sized_frame_fails_alone() {
    let sizes = [(4, 4), (4, 4), (3, 3), (4, 4)];
    for threads in [None, Some(1), Some(4)] {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        build_sized_run(root, &sizes, &sizes);

        let options = PipelineOptions { threads, ..PipelineOptions::default() };
        let report = Pipeline::open(root, options).unwrap().run().unwrap();

        assert_eq!(report.processed, vec![0, 1, 3], "{threads:?}");
        assert_eq!(failed_indices(&report), vec![2]);
        assert!(!root.join("deformedImages").join("f_02.png").exists());
        let products = report.aggregate.as_ref().unwrap();
        assert_eq!(products.before_image.dim(), (4, 4));
    }
}

#[test]
fn test_field_of_wrong_size_fails_its_frame_only() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let sizes = [(4, 5); 4];
    let mut fields = sizes;
    fields[1] = (5, 4);
    build_sized_run(root, &sizes, &fields);

    let report = Pipeline::open(root, PipelineOptions::default()).unwrap().run().unwrap();

    assert_eq!(report.processed, vec![0, 2, 3]);
    assert_eq!(failed_indices(&report), vec![1]);
    let cause = format!("{:#}", report.failures[0].error);
    assert!(cause.contains("(5, 4)") && cause.contains("(4, 5)"), "{cause}");
    assert!(!root.join("deformedImages").join("f_01.png").exists());
    assert!(report.aggregate.is_some());
}

#[test]
fn test_failed_frame_leaves_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    build_run(root, true);
    // Spectra folder present but empty: every spectral load fails.
    std::fs::remove_dir_all(root.join("spectra")).unwrap();
    std::fs::create_dir_all(root.join("spectra")).unwrap();

    let report = Pipeline::open(root, PipelineOptions::default()).unwrap().run().unwrap();

    assert!(report.processed.is_empty());
    assert_eq!(failed_indices(&report), vec![0, 1, 3, 4]);
    let left = std::fs::read_dir(root.join("deformedImages")).unwrap().count();
    assert_eq!(left, 0);
}

#[test]
fn test_run_without_spectra_or_aggregation() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    build_run(root, false);

    let options = PipelineOptions {
        aggregate: false,
        threads: Some(2),
        ..PipelineOptions::default()
    };
    let report = Pipeline::open(root, options).unwrap().run().unwrap();

    assert_eq!(report.processed, vec![0, 1, 3]);
    assert!(report.aggregate.is_none());
    assert!(!root.join("processed_results").exists());
    assert!(!root.join("deformedSpectra").exists());
}

#[test]
fn test_aggregate_existing_matches_run() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    build_run(root, false);

    let pipeline = Pipeline::open(root, PipelineOptions::default()).unwrap();
    let report = pipeline.run().unwrap();
    let again = pipeline.aggregate_existing().unwrap();

    // The on-disk originals include the skipped and failed frames.
    let ran = report.aggregate.unwrap();
    assert_eq!(again.after_image, ran.after_image);
    assert_ne!(again.before_image, ran.before_image);
}

#[test]
fn test_every_frame_failing_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    build_run(root, false);
    std::fs::remove_dir_all(root.join("nonrigid_results")).unwrap();

    let report = Pipeline::open(root, PipelineOptions::default()).unwrap().run().unwrap();
    assert!(report.processed.is_empty());
    assert_eq!(report.failures.len(), 4);
    assert!(report.aggregate.is_none());
    assert_eq!(report.status_line(), "0 frames processed, 1 skipped, 4 failed");
}

#[test]
fn test_missing_config_field_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("run.par"),
        "templateNamePattern /data/f_%02d.png\nnumTemplates 3\nnumExtraStages 0\n",
    )
    .unwrap();

    let err = Pipeline::open(dir.path(), PipelineOptions::default()).err().unwrap();
    assert!(matches!(err, PipelineError::Config(ConfigError::MissingField("stopLevel"))));
}

#[test]
fn test_first_config_file_by_name_is_used() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("a.par"),
        "templateNamePattern /d/f_%02d.png\nnumTemplates 2\nnumExtraStages 1\nstopLevel 7\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("b.par"), "garbage\n").unwrap();

    let path = ConfigRecord::discover(dir.path()).unwrap();
    assert_eq!(path, dir.path().join("a.par"));
    let pipeline = Pipeline::open(dir.path(), PipelineOptions::default()).unwrap();
    assert_eq!(pipeline.stage(), 2);
    assert_eq!(pipeline.config().level_tag(), "07");
}
