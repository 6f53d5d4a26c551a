//! Analyzer configuration with JSON file loading and environment overrides.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ImpactError, ImpactResult};
use crate::query::guards::{clamp_int, MAX_CONTEXT_WINDOW, MAX_TRACE_DEPTH, MAX_TRACES_PER_FILE};

/// Directory, relative to the project root, holding cache and hint files.
pub const DEFAULT_STATE_DIR: &str = ".endpoint-impact";

pub const DEFAULT_EXCLUDE_PATTERNS: &[&str] = &[
    "**/test_*.py",
    "**/*_test.py",
    "**/tests/**",
    "**/conftest.py",
];

/// Which dependency backend answers "does this entry point reach that file".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Type-aware symbol tracing.
    #[default]
    Symbol,
    /// Module import graph reachability.
    Import,
    /// Coarse whole-file reachability.
    Coverage,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Symbol => "symbol",
            BackendKind::Import => "import",
            BackendKind::Coverage => "coverage",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "symbol" | "mypy" | "type" => Some(BackendKind::Symbol),
            "import" | "imports" => Some(BackendKind::Import),
            "coverage" | "coarse" => Some(BackendKind::Coverage),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub backend: BackendKind,
    pub confidence_threshold: f64,
    pub track_transitive: bool,
    pub context_window: i64,
    pub use_cache: bool,
    pub invalidate_on_source_change: bool,
    pub cache_dir: Option<PathBuf>,
    pub max_trace_depth: i64,
    pub max_traces_per_file: i64,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub parallel: bool,
    pub fine_progress: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Symbol,
            confidence_threshold: 0.5,
            track_transitive: true,
            context_window: 3,
            use_cache: true,
            invalidate_on_source_change: false,
            cache_dir: None,
            max_trace_depth: 256,
            max_traces_per_file: 8,
            include_patterns: Vec::new(),
            exclude_patterns: DEFAULT_EXCLUDE_PATTERNS.iter().map(|p| p.to_string()).collect(),
            parallel: true,
            fine_progress: false,
        }
    }
}

impl AnalyzerConfig {
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.use_cache = enabled;
        self
    }

    /// Load a JSON config file. Missing keys take their defaults.
    pub fn from_json_file(path: &Path) -> ImpactResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AnalyzerConfig = serde_json::from_str(&content)
            .map_err(|e| ImpactError::Config(format!("{}: {e}", path.display())))?;
        Ok(config.normalized())
    }

    /// Apply `ENDPOINT_IMPACT_*` environment overrides.
    pub fn with_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(backend) = lookup("ENDPOINT_IMPACT_BACKEND").and_then(|v| BackendKind::parse(&v)) {
            self.backend = backend;
        }
        if let Some(threshold) = lookup("ENDPOINT_IMPACT_THRESHOLD").and_then(|v| v.trim().parse::<f64>().ok()) {
            self.confidence_threshold = threshold;
        }
        if let Some(window) = lookup("ENDPOINT_IMPACT_CONTEXT_WINDOW").and_then(|v| v.trim().parse::<i64>().ok()) {
            self.context_window = window;
        }
        if let Some(flag) = lookup("ENDPOINT_IMPACT_NO_CACHE") {
            let v = flag.trim().to_lowercase();
            if !matches!(v.as_str(), "" | "0" | "false" | "no" | "off") {
                self.use_cache = false;
            }
        }
        self.normalized()
    }

    /// Clamp numeric settings into their supported ranges.
    pub fn normalized(mut self) -> Self {
        self.confidence_threshold = if self.confidence_threshold.is_finite() {
            self.confidence_threshold.clamp(0.0, 1.0)
        } else {
            0.5
        };
        self.context_window = clamp_int(self.context_window, 0, MAX_CONTEXT_WINDOW);
        self.max_trace_depth = clamp_int(self.max_trace_depth, 1, MAX_TRACE_DEPTH);
        self.max_traces_per_file = clamp_int(self.max_traces_per_file, 1, MAX_TRACES_PER_FILE);
        self
    }

    /// Directory holding the cache database and semantic hint sidecars.
    pub fn state_dir(&self, project_root: &Path) -> PathBuf {
        match &self.cache_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => project_root.join(dir),
            None => project_root.join(DEFAULT_STATE_DIR),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = AnalyzerConfig::default();
        assert_eq!(config.backend, BackendKind::Symbol);
        assert_eq!(config.context_window, 3);
        assert!((config.confidence_threshold - 0.5).abs() < f64::EPSILON);
        assert!(config.track_transitive);
        assert!(config.use_cache);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ENDPOINT_IMPACT_BACKEND", "import"),
            ("ENDPOINT_IMPACT_THRESHOLD", "2.5"),
            ("ENDPOINT_IMPACT_NO_CACHE", "1"),
            ("ENDPOINT_IMPACT_CONTEXT_WINDOW", "5"),
        ]
        .into_iter()
        .collect();
        let config = AnalyzerConfig::default().apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.backend, BackendKind::Import);
        assert!((config.confidence_threshold - 1.0).abs() < f64::EPSILON);
        assert!(!config.use_cache);
        assert_eq!(config.context_window, 5);
    }

    #[test]
    fn test_json_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("impact.json");
        std::fs::write(&path, r#"{"backend": "coverage", "context_window": -2}"#).unwrap();
        let config = AnalyzerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.backend, BackendKind::Coverage);
        assert_eq!(config.context_window, 0);
        assert!(config.track_transitive);
    }

    #[test]
    fn test_json_file_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("impact.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            AnalyzerConfig::from_json_file(&path),
            Err(ImpactError::Config(_))
        ));
    }

    #[test]
    fn test_state_dir() {
        let root = Path::new("/srv/app");
        assert_eq!(
            AnalyzerConfig::default().state_dir(root),
            PathBuf::from("/srv/app/.endpoint-impact")
        );
        let custom = AnalyzerConfig {
            cache_dir: Some(PathBuf::from("cache")),
            ..AnalyzerConfig::default()
        };
        assert_eq!(custom.state_dir(root), PathBuf::from("/srv/app/cache"));
    }
}
