use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// NamePattern – `<dir>/<base>_%0<N>d.<ext>`
// ---------------------------------------------------------------------------

/// The frame naming scheme recovered from `templateNamePattern`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePattern {
    pub base_name: String,
    pub counter_width: usize,
    pub extension: String,
}

impl NamePattern {
    /// Parse the last path segment of a printf-style pattern.
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidPattern(pattern.to_string());

        let file = pattern
            .rsplit(['/', '\\'])
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(invalid)?;
        let (base_name, rest) = file.rsplit_once("_%0").ok_or_else(invalid)?;
        let (width, extension) = rest.split_once("d.").ok_or_else(invalid)?;
        let counter_width: usize = width.parse().map_err(|_| invalid())?;

        let extension_ok = !extension.is_empty()
            && extension.chars().all(|c| c.is_ascii_alphanumeric());
        if base_name.is_empty() || counter_width == 0 || !extension_ok {
            return Err(invalid());
        }

        Ok(Self {
            base_name: base_name.to_string(),
            counter_width,
            extension: extension.to_string(),
        })
    }

    /// Zero-padded counter for a frame index.
    pub fn counter(&self, index: usize) -> String {
        format!("{index:0width$}", width = self.counter_width)
    }

    /// `{base}_{counter}.{ext}`
    pub fn file_name(&self, index: usize) -> String {
        format!("{}_{}.{}", self.base_name, self.counter(index), self.extension)
    }

    /// Same stem as [`NamePattern::file_name`] with another extension.
    pub fn file_name_with_extension(&self, index: usize, extension: &str) -> String {
        format!("{}_{}.{}", self.base_name, self.counter(index), extension)
    }
}

// ---------------------------------------------------------------------------
// ConfigRecord
// ---------------------------------------------------------------------------

/// The registration tool's parameter file, read back after a run.
///
/// Every `<identifier> <value>` line is kept for lookup. The fields the
/// warp pipeline needs are derived once at parse time and cannot be changed
/// afterwards.
#[derive(Debug, Clone)]
pub struct ConfigRecord {
    entries: BTreeMap<String, String>,
    name_pattern: NamePattern,
    frame_count: usize,
    skip_frames: BTreeSet<usize>,
    stop_level: u32,
    stage_count: usize,
}

impl ConfigRecord {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let entries: BTreeMap<String, String> = text
            .lines()
            .filter_map(parse_line)
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let required = |key: &'static str| {
            entries
                .get(key)
                .map(String::as_str)
                .ok_or(ConfigError::MissingField(key))
        };

        let name_pattern = NamePattern::parse(required("templateNamePattern")?)?;
        let frame_count = parse_number::<usize>("numTemplates", required("numTemplates")?)?;
        let stop_level = parse_number::<u32>("stopLevel", required("stopLevel")?)?;
        let extra_stages = parse_number::<usize>("numExtraStages", required("numExtraStages")?)?;
        let skip_frames = entries
            .get("templateSkipNums")
            .map(|v| parse_skip_list(v))
            .unwrap_or_default();

        if digit_count(frame_count) > name_pattern.counter_width {
            return Err(ConfigError::CounterTooNarrow {
                width: name_pattern.counter_width,
                frames: frame_count,
            });
        }

        Ok(Self {
            entries,
            name_pattern,
            frame_count,
            skip_frames,
            stop_level,
            stage_count: extra_stages + 1,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Locate the first `.par` file (by name) in a run folder.
    pub fn discover(folder: &Path) -> Result<PathBuf, ConfigError> {
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(folder)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "par"))
            .collect();
        candidates.sort();
        candidates
            .into_iter()
            .next()
            .ok_or_else(|| ConfigError::NotFound(folder.to_path_buf()))
    }

    /// Raw value of any `<key> <value>` line.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn name_pattern(&self) -> &NamePattern {
        &self.name_pattern
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Zero-based indices excluded from processing.
    pub fn skip_frames(&self) -> &BTreeSet<usize> {
        &self.skip_frames
    }

    pub fn stop_level(&self) -> u32 {
        self.stop_level
    }

    /// Stop level as it appears in deformation file names, e.g. `08`.
    pub fn level_tag(&self) -> String {
        format!("{:02}", self.stop_level)
    }

    /// `numExtraStages + 1`; also the index of the final stage folder.
    pub fn stage_count(&self) -> usize {
        self.stage_count
    }
}

/// Split `<identifier> <value>`; anything else (comments, blanks) is `None`.
fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    let (key, value) = line.split_once(char::is_whitespace)?;
    let mut chars = key.chars();
    let head_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !head_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((key, value.trim()))
}

/// Parse the leading token of a value; anything after it (e.g. `# final`)
/// is ignored.
fn parse_number<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError> {
    let token = value.split_whitespace().next().unwrap_or_default();
    token.parse().map_err(|_| ConfigError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

/// Every run of digits in the value is one skipped index: accepts
/// `{ 1 2 }`, `{ [1, 2] }` and the empty `{ [] }`.
fn parse_skip_list(value: &str) -> BTreeSet<usize> {
    value
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

fn digit_count(n: usize) -> usize {
    n.checked_ilog10().map_or(1, |d| d as usize + 1)
}

// ---------------------------------------------------------------------------
// RegistrationParameters – rendering the file for the registration tool
// ---------------------------------------------------------------------------

/// Inputs for a fresh `.par` file. Defaults are the usual starting guess.
#[derive(Debug, Clone)]
pub struct RegistrationParameters {
    /// printf-style frame path, e.g. `/data/images/frame_%04d.tiff`
    pub name_pattern: String,
    /// Run folder; results land in `<root>/nonrigid_results`.
    pub root: PathBuf,
    /// Base-2 power of the image size.
    pub precision_level: u32,
    pub frame_count: usize,
    pub num_offset: usize,
    pub num_step: usize,
    pub skip_frames: BTreeSet<usize>,
    pub pre_smooth: bool,
    pub save_ref_and_template: bool,
    pub extra_stages: usize,
    pub normalize: bool,
    pub enhance_fraction: f64,
    pub min_to_zero: bool,
    pub regularization: f64,
    pub regularization_factor: f64,
    pub max_gd_iterations: u32,
    pub epsilon: f64,
    pub start_level_offset: u32,
    pub extra_stages_lambda: f64,
}

impl Default for RegistrationParameters {
    fn default() -> Self {
        Self {
            name_pattern: String::new(),
            root: PathBuf::new(),
            precision_level: 8,
            frame_count: 1,
            num_offset: 0,
            num_step: 1,
            skip_frames: BTreeSet::new(),
            pre_smooth: false,
            save_ref_and_template: false,
            extra_stages: 2,
            normalize: true,
            enhance_fraction: 0.15,
            min_to_zero: true,
            regularization: 200.0,
            regularization_factor: 1.0,
            max_gd_iterations: 500,
            epsilon: 1e-6,
            start_level_offset: 2,
            extra_stages_lambda: 0.1,
        }
    }
}

impl RegistrationParameters {
    /// Render the key-value text the registration tool consumes.
    pub fn render(&self) -> String {
        let level = self.precision_level;
        let save_dir = self.root.join("nonrigid_results");
        let skip: Vec<String> = self.skip_frames.iter().map(usize::to_string).collect();
        let flag = |b: bool| u8::from(b);

        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = writeln!(out, "templateNamePattern {}", self.name_pattern);
        let _ = writeln!(out, "templateNumOffset {}", self.num_offset);
        let _ = writeln!(out, "templateNumStep {}", self.num_step);
        let _ = writeln!(out, "numTemplates {}", self.frame_count);
        let _ = writeln!(out, "templateSkipNums {{ {} }}", skip.join(" "));
        let _ = writeln!(out);
        let _ = writeln!(out, "preSmoothSigma {}", flag(self.pre_smooth));
        let _ = writeln!(out);
        let _ = writeln!(out, "saveRefAndTempl {}", flag(self.save_ref_and_template));
        let _ = writeln!(out);
        let _ = writeln!(out, "numExtraStages {}", self.extra_stages);
        let _ = writeln!(out);
        let _ = writeln!(out, "saveDirectory {}", save_dir.display());
        let _ = writeln!(out);
        let _ = writeln!(out, "dontNormalizeInputImages {}", flag(!self.normalize));
        let _ = writeln!(out, "enhanceContrastSaturationPercentage {}", self.enhance_fraction);
        let _ = writeln!(out, "normalizeMinToZero {}", flag(self.min_to_zero));
        let _ = writeln!(out);
        let _ = writeln!(out, "# lambda weights the deformation regularization term");
        let _ = writeln!(out, "lambda {}", self.regularization);
        let _ = writeln!(
            out,
            "# lambdaFactor scales lambda depending on the current level: \
             On level d, lambda is multiplied by pow ( lambdaFactor, stopLevel - d )"
        );
        let _ = writeln!(out, "lambdaFactor {}", self.regularization_factor);
        let _ = writeln!(out);
        let _ = writeln!(out, "maxGDIterations {}", self.max_gd_iterations);
        let _ = writeln!(out, "stopEpsilon {}", self.epsilon);
        let _ = writeln!(out);
        let _ = writeln!(out, "startLevel {}", level.saturating_sub(self.start_level_offset));
        let _ = writeln!(out, "stopLevel {level}");
        let _ = writeln!(out, "precisionLevel {level}");
        let _ = writeln!(out, "refineStartLevel {}", level.saturating_sub(1));
        let _ = writeln!(out, "refineStopLevel {level}");
        let _ = writeln!(out);
        let _ = writeln!(out, "checkboxWidth {level}");
        let _ = writeln!(out);
        let _ = writeln!(out, "resizeInput 0");
        let _ = writeln!(out);
        let _ = writeln!(out, "dontAccumulateDeformation 0");
        let _ = writeln!(out, "reuseStage1Results 1");
        let _ = writeln!(out, "extraStagesLambdaFactor {}", self.extra_stages_lambda);
        let _ = writeln!(out, "useMedianAsNewTarget 1");
        let _ = writeln!(out, "calcInverseDeformation 0");
        let _ = writeln!(out, "skipStage1 0");
        let _ = writeln!(out);
        let _ = writeln!(out, "saveNamedDeformedTemplates 1");
        let _ = writeln!(out, "saveNamedDeformedTemplatesUsingNearestNeighborInterpolation 1");
        let _ = writeln!(out, "saveNamedDeformedTemplatesExtendedWithMean 1");
        let _ = writeln!(out, "saveDeformedTemplates 1");
        let _ = writeln!(out, "saveNamedDeformedDMXTemplatesAsDMX 1");
        out
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.render())?;
        log::debug!("Wrote registration config {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
templateNamePattern /data/run/images_000/frame_%04d.tiff
templateNumOffset 0
templateNumStep 1
numTemplates 10
templateSkipNums { 2 7 }

# lambda weights the deformation regularization term
lambda 200
numExtraStages  2
stopLevel   8
";

    #[test]
    fn test_name_pattern_scenario() {
        let config = ConfigRecord::parse(SAMPLE).unwrap();
        let pattern = config.name_pattern();
        assert_eq!(pattern.counter_width, 4);
        assert_eq!(pattern.base_name, "frame");
        assert_eq!(pattern.extension, "tiff");
        assert_eq!(pattern.file_name(3), "frame_0003.tiff");
        assert_eq!(pattern.file_name_with_extension(12, "parquet"), "frame_0012.parquet");
    }

    #[test]
    fn test_derived_fields() {
        let config = ConfigRecord::parse(SAMPLE).unwrap();
        assert_eq!(config.frame_count(), 10);
        assert_eq!(config.skip_frames().iter().copied().collect::<Vec<_>>(), vec![2, 7]);
        assert_eq!(config.stop_level(), 8);
        assert_eq!(config.level_tag(), "08");
        assert_eq!(config.stage_count(), 3);
        assert_eq!(config.get("templateNumStep"), Some("1"));
        assert_eq!(config.get("lambda"), Some("200"));
        assert_eq!(config.get("#"), None);
    }

    #[test]
    fn test_commented_skip_line_means_no_skips() {
        let text = SAMPLE.replace("templateSkipNums { 2 7 }", "# templateSkipNums { 2 7 }");
        let config = ConfigRecord::parse(&text).unwrap();
        assert!(config.skip_frames().is_empty());
    }

    #[test]
    fn test_python_list_skip_syntax() {
        assert_eq!(parse_skip_list("{ [1, 12] }").into_iter().collect::<Vec<_>>(), vec![1, 12]);
        assert!(parse_skip_list("{ [] }").is_empty());
    }

    #[test]
    fn test_missing_fields_are_named() {
        for key in ["templateNamePattern", "numTemplates", "stopLevel", "numExtraStages"] {
            let text: String = SAMPLE
                .lines()
                .filter(|l| !l.starts_with(key))
                .map(|l| format!("{l}\n"))
                .collect();
            match ConfigRecord::parse(&text) {
                Err(ConfigError::MissingField(missing)) => assert_eq!(missing, key),
                other => panic!("expected missing {key}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_trailing_comment_after_number() {
        let text = SAMPLE
            .replace("stopLevel   8", "stopLevel 8 # final")
            .replace("numTemplates 10", "numTemplates 10\t# all frames");
        let config = ConfigRecord::parse(&text).unwrap();
        assert_eq!(config.stop_level(), 8);
        assert_eq!(config.frame_count(), 10);

        let bad = SAMPLE.replace("stopLevel   8", "stopLevel eight");
        assert!(matches!(
            ConfigRecord::parse(&bad),
            Err(ConfigError::InvalidValue { field: "stopLevel", .. })
        ));
    }

    #[test]
    fn test_invalid_pattern() {
        let text = SAMPLE.replace("frame_%04d.tiff", "frame.tiff");
        assert!(matches!(ConfigRecord::parse(&text), Err(ConfigError::InvalidPattern(_))));
    }

    #[test]
    fn test_counter_too_narrow() {
        let text = SAMPLE.replace("numTemplates 10", "numTemplates 12345");
        assert!(matches!(
            ConfigRecord::parse(&text),
            Err(ConfigError::CounterTooNarrow { width: 4, frames: 12345 })
        ));
    }

    #[test]
    fn test_rendered_parameters_parse_back() {
        let params = RegistrationParameters {
            name_pattern: "/data/run/images/frame_%03d.png".into(),
            root: PathBuf::from("/data/run"),
            frame_count: 40,
            skip_frames: [3, 9].into_iter().collect(),
            ..Default::default()
        };
        let config = ConfigRecord::parse(&params.render()).unwrap();
        assert_eq!(config.frame_count(), 40);
        assert_eq!(config.name_pattern().counter_width, 3);
        assert_eq!(config.skip_frames(), &params.skip_frames);
        assert_eq!(config.level_tag(), "08");
        assert_eq!(config.stage_count(), 3);
        assert_eq!(config.get("startLevel"), Some("6"));
        assert_eq!(config.get("dontNormalizeInputImages"), Some("0"));
    }

    #[test]
    fn test_discover_picks_first_par_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.par"), SAMPLE).unwrap();
        std::fs::write(dir.path().join("a.par"), SAMPLE).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        let found = ConfigRecord::discover(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "a.par");

        let empty = tempfile::tempdir().unwrap();
        assert!(matches!(
            ConfigRecord::discover(empty.path()),
            Err(ConfigError::NotFound(_))
        ));
    }
}
