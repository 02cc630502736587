//! Working-tree diff snapshots for line-level impact detection

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use git2::{DiffFormat, DiffOptions, Repository};
use regex::Regex;

use crate::errors::DiffError;
use crate::test_model::DiffSnapshot;

/// `@@ -a[,b] +c[,d] @@` with optional section text after the closing `@@`
static HUNK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("hardcoded hunk regex")
});

/// Source of per-file diff snapshots since the last committed state
pub trait DiffProvider {
    /// Snapshots keyed by path relative to the watched root, one entry per
    /// file with at least one added or removed line.
    fn snapshots(&self) -> Result<HashMap<String, DiffSnapshot>, DiffError>;
}

/// Git diff operations
pub struct GitDiff {
    repo: Repository,
    root: PathBuf,
}

impl GitDiff {
    /// Open the repository containing `root`
    pub fn open(root: &Path) -> Result<Self> {
        let repo = Repository::discover(root)
            .with_context(|| format!("Failed to find git repository at {}", root.display()))?;

        Ok(Self {
            repo,
            root: root.to_path_buf(),
        })
    }

    /// Zero-context unified diff of HEAD against the working tree and index,
    /// untracked files included with their content.
    pub fn unified_diff(&self) -> Result<String, DiffError> {
        let head_tree = match self.repo.head() {
            Ok(head) => Some(head.peel_to_tree()?),
            // Unborn branch: everything is new relative to the empty tree
            Err(_) => None,
        };

        let mut opts = DiffOptions::new();
        opts.context_lines(0)
            .include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);

        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(head_tree.as_ref(), Some(&mut opts))?;

        let mut text = String::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            let content = String::from_utf8_lossy(line.content());
            match line.origin() {
                origin @ ('+' | '-' | ' ') => {
                    text.push(origin);
                    text.push_str(&content);
                    if !content.ends_with('\n') {
                        text.push('\n');
                    }
                }
                // End-of-file newline markers carry no line of their own
                '=' | '>' | '<' => {}
                _ => text.push_str(&content),
            }
            true
        })?;

        Ok(text)
    }

    /// Re-key repository-relative paths to root-relative ones, dropping
    /// files outside the root.
    fn reroot(&self, snapshots: HashMap<String, DiffSnapshot>) -> HashMap<String, DiffSnapshot> {
        let Some(workdir) = self.repo.workdir() else {
            return snapshots;
        };
        // Canonical forms so symlinked temp dirs and the like still line up
        let workdir = workdir.canonicalize().unwrap_or_else(|_| workdir.to_path_buf());
        let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());

        snapshots
            .into_iter()
            .filter_map(|(path, snapshot)| {
                let abs = workdir.join(&path);
                let rel = abs.strip_prefix(&root).ok()?;
                Some((rel.to_string_lossy().replace('\\', "/"), snapshot))
            })
            .collect()
    }
}

impl DiffProvider for GitDiff {
    fn snapshots(&self) -> Result<HashMap<String, DiffSnapshot>, DiffError> {
        let text = self.unified_diff()?;
        let snapshots = parse_unified_diff(&text)?;
        Ok(self.reroot(snapshots))
    }
}

/// No repository: every check sees an empty diff
impl<D: DiffProvider> DiffProvider for Option<D> {
    fn snapshots(&self) -> Result<HashMap<String, DiffSnapshot>, DiffError> {
        match self {
            Some(provider) => provider.snapshots(),
            None => Ok(HashMap::new()),
        }
    }
}

/// Parse zero-context unified diff text into per-file snapshots.
///
/// - `+++ b/<path>` selects the current file, `+++ /dev/null` clears it
/// - a hunk header sets the line counter to the new-side start
/// - every added or removed line is stored at the counter, which then
///   advances
/// - any `@@` line that is not a well-formed hunk header is fatal
pub fn parse_unified_diff(input: &str) -> Result<HashMap<String, DiffSnapshot>, DiffError> {
    let mut snapshots: HashMap<String, DiffSnapshot> = HashMap::new();
    let mut current_file: Option<String> = None;
    let mut counter: u32 = 0;
    // Lines still owed by the current hunk, old side and new side
    let mut removed_left: u32 = 0;
    let mut added_left: u32 = 0;

    for line in input.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let in_hunk = removed_left > 0 || added_left > 0;

        if in_hunk {
            if let Some(marker) = line.chars().next().filter(|c| *c == '+' || *c == '-') {
                if marker == '+' {
                    added_left = added_left.saturating_sub(1);
                } else {
                    removed_left = removed_left.saturating_sub(1);
                }
                if let Some(file) = &current_file {
                    snapshots
                        .entry(file.clone())
                        .or_default()
                        .insert(counter, line.to_string());
                }
                counter += 1;
                continue;
            }
            if line.starts_with('\\') {
                continue;
            }
            // Anything else ends the hunk early
            removed_left = 0;
            added_left = 0;
        }

        if let Some(path) = line.strip_prefix("+++ ") {
            current_file = if path == "/dev/null" {
                None
            } else {
                Some(path.strip_prefix("b/").unwrap_or(path).to_string())
            };
            continue;
        }

        if line.starts_with("@@") {
            let caps = HUNK_RE.captures(line).ok_or_else(|| DiffError::MalformedHunk {
                line: line.to_string(),
            })?;
            let number = |i: usize, default: u32| -> Result<u32, DiffError> {
                match caps.get(i) {
                    Some(m) => m.as_str().parse().map_err(|_| DiffError::MalformedHunk {
                        line: line.to_string(),
                    }),
                    None => Ok(default),
                }
            };
            removed_left = number(2, 1)?;
            counter = number(3, 0)?;
            added_left = number(4, 1)?;
            continue;
        }

        // `diff --git`, `index`, `---`, mode lines and the like
    }

    Ok(snapshots)
}
