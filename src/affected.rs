//! Coarse impact resolution
//!
//! When a change cannot be mapped to individual test methods, the changed
//! file still names a module path. Test files fall back to their whole
//! module; any other source file falls back to its app-level grouping.

use std::path::{Component, Path};

use crate::config::DetectConfig;
use crate::test_model::TestIdentifier;

pub const MODULE_SEPARATOR: &str = ".";

/// Module path segments of `path` relative to `root`, extension stripped.
///
/// `app/sub/views.py` -> `["app", "sub", "views"]`. A trailing `__init__`
/// stem names its package, so `app/__init__.py` -> `["app"]`.
pub fn module_segments(root: &Path, path: &Path) -> Vec<String> {
    let rel = path.strip_prefix(root).unwrap_or(path);

    let mut segments: Vec<String> = rel
        .with_extension("")
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    if segments.last().map(String::as_str) == Some("__init__") {
        segments.pop();
    }

    segments
}

/// Dotted module path (`app.sub.views`)
pub fn module_path(root: &Path, path: &Path) -> String {
    module_segments(root, path).join(MODULE_SEPARATOR)
}

/// Whether the file's base name carries the test-file prefix
pub fn is_test_file(path: &Path, detect: &DetectConfig) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(&detect.test_file_prefix))
        .unwrap_or(false)
}

/// Coarse target for a changed file, or `None` when the path yields no
/// module segments at all.
pub fn fallback_target(root: &Path, path: &Path, detect: &DetectConfig) -> Option<TestIdentifier> {
    let segments = module_segments(root, path);
    if segments.is_empty() {
        return None;
    }

    if is_test_file(path, detect) {
        return Some(segments.join(MODULE_SEPARATOR));
    }

    let depth = detect.app_depth.min(segments.len());
    Some(segments[..depth].join(MODULE_SEPARATOR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_path() {
        let root = Path::new("/project");
        assert_eq!(module_path(root, Path::new("/project/app/sub/views.py")), "app.sub.views");
        assert_eq!(module_path(root, Path::new("/project/app/__init__.py")), "app");
        assert_eq!(module_path(root, Path::new("app/models.py")), "app.models");
    }

    #[test]
    fn test_is_test_file() {
        let detect = DetectConfig::default();
        assert!(is_test_file(Path::new("app/tests/test_views.py"), &detect));
        assert!(is_test_file(Path::new("tests.py"), &detect));
        assert!(!is_test_file(Path::new("app/tests/helpers.py"), &detect));
    }

    #[test]
    fn test_fallback_for_test_file_is_whole_module() {
        let detect = DetectConfig::default();
        let root = Path::new("/project");
        assert_eq!(
            fallback_target(root, Path::new("/project/app/sub/test_foo.py"), &detect).as_deref(),
            Some("app.sub.test_foo")
        );
    }

    #[test]
    fn test_fallback_for_source_file_is_app_grouping() {
        let detect = DetectConfig::default();
        let root = Path::new("/project");
        assert_eq!(
            fallback_target(root, Path::new("/project/app/sub/views.py"), &detect).as_deref(),
            Some("app.sub")
        );
        assert_eq!(
            fallback_target(root, Path::new("/project/settings.py"), &detect).as_deref(),
            Some("settings")
        );
    }

    #[test]
    fn test_fallback_respects_app_depth() {
        let detect = DetectConfig {
            app_depth: 1,
            ..DetectConfig::default()
        };
        let root = Path::new("/project");
        assert_eq!(
            fallback_target(root, Path::new("/project/app/sub/views.py"), &detect).as_deref(),
            Some("app")
        );
    }

    #[test]
    fn test_fallback_empty_path() {
        let detect = DetectConfig::default();
        let root = Path::new("/project");
        assert_eq!(fallback_target(root, Path::new("/project/__init__.py"), &detect), None);
    }
}
