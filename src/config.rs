use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const CONFIG_FILE: &str = "testwatch.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub runner: RunnerConfig,
    pub detect: DetectConfig,
    pub watch: WatchConfig,
}

/// How the external test command is invoked
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Program and leading arguments (e.g. `["python", "manage.py"]`)
    pub cmd: Vec<String>,
    pub subcommand: String,
    /// Flag placed before each filter pattern
    pub pattern_flag: String,
    /// Substring marking a test that could not be loaded
    pub failed_marker: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            cmd: vec!["python".to_string(), "manage.py".to_string()],
            subcommand: "test".to_string(),
            pattern_flag: "-k".to_string(),
            failed_marker: "unittest.loader._FailedTest".to_string(),
        }
    }
}

/// Naming conventions used to recognise tests
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectConfig {
    pub source_extension: String,
    pub test_file_prefix: String,
    pub test_class_suffixes: Vec<String>,
    pub test_method_prefix: String,
    /// Number of leading module segments forming an app-level target
    pub app_depth: usize,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            source_extension: "py".to_string(),
            test_file_prefix: "test".to_string(),
            test_class_suffixes: vec![
                "Test".to_string(),
                "Tests".to_string(),
                "TestCase".to_string(),
            ],
            test_method_prefix: "test".to_string(),
            app_depth: 2,
        }
    }
}

impl DetectConfig {
    pub fn is_test_class(&self, name: &str) -> bool {
        self.test_class_suffixes.iter().any(|s| name.ends_with(s.as_str()))
    }

    pub fn is_test_method(&self, name: &str) -> bool {
        name.starts_with(&self.test_method_prefix)
    }

    pub fn is_source_file(&self, path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some(self.source_extension.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Quiet period that closes a batch of change events
    pub debounce_ms: u64,
    /// Glob patterns (relative to the root) that are never watched
    pub exclude: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            exclude: [
                "**/.git/**",
                "**/__pycache__/**",
                "**/node_modules/**",
                "**/.venv/**",
                "**/target/**",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        config.expand()?;
        config.validate()?;

        Ok(config)
    }

    /// Load an explicit config file, or `testwatch.toml` under `root` when
    /// present, or fall back to defaults.
    pub fn load_or_default(root: &Path, explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let default_path = root.join(CONFIG_FILE);
        if default_path.exists() {
            Self::load(&default_path)
        } else {
            tracing::debug!("no {} found, using defaults", CONFIG_FILE);
            Ok(Self::default())
        }
    }

    fn expand(&mut self) -> Result<()> {
        for arg in self.runner.cmd.iter_mut() {
            let expanded = shellexpand::full(arg.as_str())
                .with_context(|| format!("Failed to expand runner argument '{}'", arg))?;
            *arg = expanded.into_owned();
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.runner.cmd.is_empty() {
            anyhow::bail!("runner.cmd must name at least the program to run");
        }

        if self.detect.source_extension.is_empty() {
            anyhow::bail!("detect.source_extension must not be empty");
        }

        if self.detect.app_depth == 0 {
            anyhow::bail!("detect.app_depth must be at least 1");
        }

        for pattern in &self.watch.exclude {
            glob::Pattern::new(pattern)
                .with_context(|| format!("Invalid exclude pattern '{}'", pattern))?;
        }

        Ok(())
    }

    /// Compiled exclude globs; invalid entries were rejected by `validate`
    pub fn exclude_patterns(&self) -> Vec<glob::Pattern> {
        self.watch
            .exclude
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[runner]
cmd = ["python3", "src/manage.py"]
pattern_flag = "--keyword"

[detect]
test_class_suffixes = ["Spec"]
app_depth = 1

[watch]
debounce_ms = 50
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.runner.cmd, vec!["python3", "src/manage.py"]);
        assert_eq!(config.runner.subcommand, "test");
        assert_eq!(config.runner.pattern_flag, "--keyword");
        assert!(config.detect.is_test_class("UserSpec"));
        assert!(!config.detect.is_test_class("UserTests"));
        assert_eq!(config.detect.app_depth, 1);
        assert_eq!(config.watch.debounce_ms, 50);
        assert!(!config.watch.exclude.is_empty());
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.detect.is_test_class("ViewTests"));
        assert!(config.detect.is_test_class("ModelTestCase"));
        assert!(!config.detect.is_test_class("Helper"));
        assert!(config.detect.is_test_method("test_index"));
        assert!(config.detect.is_source_file(Path::new("app/views.py")));
        assert!(!config.detect.is_source_file(Path::new("app/views.html")));
    }

    #[test]
    fn test_validate_rejects_bad_glob() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[watch]\nexclude = [\"[\"]\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path(), None).unwrap();
        assert_eq!(config.runner.cmd, vec!["python", "manage.py"]);

        let missing = dir.path().join("nope.toml");
        assert!(Config::load_or_default(dir.path(), Some(&missing)).is_err());
    }

    #[test]
    fn test_runner_cmd_is_expanded() {
        std::env::set_var("TESTWATCH_CONFIG_TEST_PY", "/opt/py/bin/python");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[runner]\ncmd = [\"$TESTWATCH_CONFIG_TEST_PY\", \"manage.py\"]\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.runner.cmd[0], "/opt/py/bin/python");
    }
}
