//! Line-level change mapping
//!
//! Compares two diff snapshots of one file and reports the test methods
//! whose definition ranges contain a changed line.

use std::collections::BTreeSet;
use std::path::Path;

use crate::config::DetectConfig;
use crate::errors::MapError;
use crate::indexer::index_file;
use crate::test_model::{DiffSnapshot, SourceIndex, TestIdentifier};

/// Lines of `current` that are new or differ from `previous`
pub fn changed_lines(previous: &DiffSnapshot, current: &DiffSnapshot) -> BTreeSet<u32> {
    current
        .iter()
        .filter(|(line, text)| previous.get(*line) != Some(*text))
        .map(|(line, _)| *line)
        .collect()
}

/// Tests in `index` whose range covers at least one changed line
pub fn changed_tests(
    previous: &DiffSnapshot,
    current: &DiffSnapshot,
    index: &SourceIndex,
) -> BTreeSet<TestIdentifier> {
    let lines = changed_lines(previous, current);
    if lines.is_empty() {
        return BTreeSet::new();
    }

    index
        .iter()
        .filter(|(_, range)| lines.range(range.start..=range.end).next().is_some())
        .map(|(name, _)| name.clone())
        .collect()
}

/// Index `path` fresh and map the snapshot change onto its tests
pub fn map_file(
    root: &Path,
    path: &Path,
    previous: &DiffSnapshot,
    current: &DiffSnapshot,
    detect: &DetectConfig,
) -> Result<BTreeSet<TestIdentifier>, MapError> {
    let index = index_file(root, path, detect).map_err(|source| MapError {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(changed_tests(previous, current, &index))
}
