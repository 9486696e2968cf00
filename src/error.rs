use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Deformation field decoding
// ---------------------------------------------------------------------------

/// Errors raised while decoding a deformation field file.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Header is malformed (bad magic, bad dimensions, bad max token).
    #[error("Invalid deformation field header: {0}")]
    Format(String),

    /// Magic type code other than `8` (f32) or `9` (f64).
    #[error("Unsupported element type '{0}', only float (8) and double (9) are implemented")]
    NotImplemented(char),

    /// Payload holds a different number of elements than `width * height`.
    #[error("Payload holds {actual} elements, header promises {expected}")]
    Truncated { expected: usize, actual: usize },

    #[error("I/O error while decoding deformation field: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Registration config record
// ---------------------------------------------------------------------------

/// Errors raised while reading the registration config record.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Config field '{field}' has an unparsable value '{value}'")]
    InvalidValue { field: &'static str, value: String },

    #[error("templateNamePattern '{0}' does not look like <dir>/<name>_%0<N>d.<ext>")]
    InvalidPattern(String),

    #[error("Counter width {width} cannot represent {frames} frames")]
    CounterTooNarrow { width: usize, frames: usize },

    #[error("No .par config file found in {0}")]
    NotFound(PathBuf),

    #[error("Reading config failed: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Warping
// ---------------------------------------------------------------------------

/// Errors raised by the coordinate warp engine.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WarpError {
    #[error("Shape mismatch: {what} is {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AggregateError {
    #[error("Nothing to aggregate for {0}")]
    Empty(&'static str),

    #[error("Frame shape {actual:?} differs from {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Frames mix 8-bit and 16-bit pixels")]
    BitDepthMismatch,
}

// ---------------------------------------------------------------------------
// Run-fatal errors
// ---------------------------------------------------------------------------

/// Errors that abort a whole run before or after per-frame processing.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Acquisition metadata unusable: {0:#}")]
    Metadata(anyhow::Error),

    #[error("Cannot create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("Writing aggregate products failed: {0:#}")]
    Products(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_names_key() {
        let err = ConfigError::MissingField("numTemplates");
        assert_eq!(err.to_string(), "Config is missing required field 'numTemplates'");
    }

    #[test]
    fn test_shape_mismatch_reports_both_dimensions() {
        let err = WarpError::ShapeMismatch {
            what: "dX",
            expected: (4, 5),
            actual: (5, 4),
        };
        let msg = err.to_string();
        assert!(msg.contains("(5, 4)"));
        assert!(msg.contains("(4, 5)"));
    }

    #[test]
    fn test_config_error_converts_into_pipeline_error() {
        let err: PipelineError = ConfigError::MissingField("stopLevel").into();
        assert!(matches!(err, PipelineError::Config(ConfigError::MissingField("stopLevel"))));
    }
}
