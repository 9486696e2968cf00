use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::data::config::ConfigRecord;

// ---------------------------------------------------------------------------
// FrameSequence – which frames a run touches, and in what order
// ---------------------------------------------------------------------------

/// Frame indices `0..frame_count` minus the skip set, ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSequence {
    indices: Vec<usize>,
    skipped: Vec<usize>,
}

impl FrameSequence {
    pub fn new(frame_count: usize, skip: &BTreeSet<usize>) -> Self {
        let (skipped, indices) = (0..frame_count).partition(|i| skip.contains(i));
        Self { indices, skipped }
    }

    pub fn from_config(config: &ConfigRecord) -> Self {
        Self::new(config.frame_count(), config.skip_frames())
    }

    /// Indices to process, in order.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Configured skips that fall inside `0..frame_count`.
    pub fn skipped(&self) -> &[usize] {
        &self.skipped
    }

    /// The first index that is processed; its deformation fields live in
    /// the plain `{i}` folder, all later ones in `{i}-r`.
    pub fn first(&self) -> Option<usize> {
        self.indices.first().copied()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Frame jobs with their deformation folders resolved.
    pub fn jobs(&self, stage_root: &Path) -> Vec<FrameJob> {
        let first = self.first();
        self.indices
            .iter()
            .map(|&index| FrameJob {
                index,
                deformation_dir: deformation_dir(stage_root, index, Some(index) == first),
            })
            .collect()
    }
}

/// One frame to warp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameJob {
    pub index: usize,
    pub deformation_dir: PathBuf,
}

impl FrameJob {
    /// `deformation_{level}_0.dat.bz2` (X) and `..._1.dat.bz2` (Y).
    pub fn field_paths(&self, level_tag: &str) -> (PathBuf, PathBuf) {
        (
            self.deformation_dir.join(format!("deformation_{level_tag}_0.dat.bz2")),
            self.deformation_dir.join(format!("deformation_{level_tag}_1.dat.bz2")),
        )
    }
}

/// `{stage_root}/{i}` for the first processed frame, `{stage_root}/{i}-r` otherwise.
pub fn deformation_dir(stage_root: &Path, index: usize, first: bool) -> PathBuf {
    if first {
        stage_root.join(index.to_string())
    } else {
        stage_root.join(format!("{index}-r"))
    }
}

/// `{result_root}/stage{stage}`
pub fn stage_root(result_root: &Path, stage: usize) -> PathBuf {
    result_root.join(format!("stage{stage}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skip(values: &[usize]) -> BTreeSet<usize> {
        values.iter().copied().collect()
    }

    #[test]
    fn test_skip_set_removed_in_order() {
        let seq = FrameSequence::new(5, &skip(&[2]));
        assert_eq!(seq.indices(), &[0, 1, 3, 4]);
        assert_eq!(seq.skipped(), &[2]);
        assert_eq!(seq.first(), Some(0));
    }

    #[test]
    fn test_first_follows_skipped_leading_frames() {
        let seq = FrameSequence::new(6, &skip(&[0, 1, 4, 9]));
        assert_eq!(seq.indices(), &[2, 3, 5]);
        assert_eq!(seq.skipped(), &[0, 1, 4]);
        assert_eq!(seq.first(), Some(2));
    }

    #[test]
    fn test_everything_skipped() {
        let seq = FrameSequence::new(2, &skip(&[0, 1]));
        assert!(seq.is_empty());
        assert_eq!(seq.first(), None);
        assert!(seq.jobs(Path::new("r")).is_empty());
    }

    #[test]
    fn test_jobs_use_plain_folder_only_for_first() {
        let root = stage_root(Path::new("/run/nonrigid_results"), 3);
        let jobs = FrameSequence::new(5, &skip(&[2])).jobs(&root);
        let dirs: Vec<_> = jobs.iter().map(|j| j.deformation_dir.clone()).collect();
        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/run/nonrigid_results/stage3/0"),
                PathBuf::from("/run/nonrigid_results/stage3/1-r"),
                PathBuf::from("/run/nonrigid_results/stage3/3-r"),
                PathBuf::from("/run/nonrigid_results/stage3/4-r"),
            ]
        );
        let (x, y) = jobs[1].field_paths("08");
        assert_eq!(x, PathBuf::from("/run/nonrigid_results/stage3/1-r/deformation_08_0.dat.bz2"));
        assert_eq!(y, PathBuf::from("/run/nonrigid_results/stage3/1-r/deformation_08_1.dat.bz2"));
    }

    #[test]
    fn test_first_job_after_skip_uses_plain_folder() {
        let jobs = FrameSequence::new(3, &skip(&[0])).jobs(Path::new("s"));
        assert_eq!(jobs[0].deformation_dir, PathBuf::from("s/1"));
        assert_eq!(jobs[1].deformation_dir, PathBuf::from("s/2-r"));
    }
}
