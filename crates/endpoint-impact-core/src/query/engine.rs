//! Top-level analyzer: turns entry points and a diff into an
//! [`AnalysisReport`], never failing past its own boundary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::{AnalyzerConfig, BackendKind};
use crate::errors::{ImpactError, ImpactResult};
use crate::indexer::pipeline::ProjectIndex;
use crate::indexer::semantic::ChainedOracle;
use crate::models::{
    AnalysisReport, ChangedFile, Confidence, EntryPoint, EntryPointDependencies, ImpactFinding,
    OrphanChange, ProgressCallback, ProgressEvent,
};
use crate::query::backend::{backend_for, CoverageBackend, DependencyBackend};
use crate::query::guards::{clamp_depth, MAX_TRACES_PER_FILE};
use crate::query::mapper::ImpactMapper;
use crate::query::registry::EntryPointRegistry;
use crate::store::cache::{AnalysisCache, DependencyMap};

/// Supplier of entry points, typically a route-table extractor.
pub trait EntryPointSource {
    fn entry_points(&self) -> ImpactResult<Vec<EntryPoint>>;
}

impl EntryPointSource for [EntryPoint] {
    fn entry_points(&self) -> ImpactResult<Vec<EntryPoint>> {
        Ok(self.to_vec())
    }
}

impl EntryPointSource for Vec<EntryPoint> {
    fn entry_points(&self) -> ImpactResult<Vec<EntryPoint>> {
        Ok(self.clone())
    }
}

/// Supplier of changed files, typically a unified-diff parser.
pub trait DiffSource {
    fn changed_files(&self) -> ImpactResult<Vec<ChangedFile>>;
}

impl DiffSource for [ChangedFile] {
    fn changed_files(&self) -> ImpactResult<Vec<ChangedFile>> {
        Ok(self.to_vec())
    }
}

impl DiffSource for Vec<ChangedFile> {
    fn changed_files(&self) -> ImpactResult<Vec<ChangedFile>> {
        Ok(self.clone())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn scaled(low: u8, high: u8, done: usize, total: usize) -> u8 {
    let span = usize::from(high.saturating_sub(low));
    low + (span * done / total.max(1)).min(span) as u8
}

/// Keep the first finding per entry point; a direct handler edit still
/// replaces a weaker finding recorded for an earlier file.
fn merge_finding(findings: &mut Vec<ImpactFinding>, positions: &mut HashMap<String, usize>, finding: ImpactFinding) {
    let id = finding.entry_id();
    match positions.get(&id) {
        None => {
            positions.insert(id, findings.len());
            findings.push(finding);
        }
        Some(&at) => {
            if finding.confidence == Confidence::High && findings[at].confidence != Confidence::High {
                findings[at] = finding;
            }
        }
    }
}

pub struct ImpactAnalyzer {
    root: PathBuf,
    config: AnalyzerConfig,
    index: Option<ProjectIndex>,
}

impl ImpactAnalyzer {
    pub fn new(root: impl Into<PathBuf>, config: AnalyzerConfig) -> Self {
        Self {
            root: root.into(),
            config: config.normalized(),
            index: None,
        }
    }

    /// Use a prebuilt index instead of scanning the project root.
    pub fn with_index(mut self, index: ProjectIndex) -> Self {
        self.index = Some(index);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn cache(&self) -> AnalysisCache {
        AnalysisCache::for_project(&self.root, &self.config)
    }

    /// Discard the persisted cache of every backend.
    pub fn clear_cache(&self) -> ImpactResult<()> {
        self.cache().clear()
    }

    fn with_project_index<T>(&self, f: impl FnOnce(&ProjectIndex) -> T) -> ImpactResult<T> {
        match &self.index {
            Some(index) => Ok(f(index)),
            None => {
                let index = ProjectIndex::build(&self.root, &self.config)?;
                Ok(f(&index))
            }
        }
    }

    /// Dependency records for `entries` with the configured backend, read
    /// from and written back to the cache when it is enabled.
    pub fn dependencies(&self, entries: &[EntryPoint]) -> ImpactResult<DependencyMap> {
        if entries.is_empty() {
            return Err(ImpactError::EntryPoints("no entry points supplied".to_string()));
        }
        let registry = EntryPointRegistry::from_entries(entries.iter().cloned());
        self.with_project_index(|index| {
            let oracle = ChainedOracle::standard(&self.config.state_dir(&self.root));
            let backend = backend_for(self.config.backend, index, &oracle, &self.config);
            let mut warnings = Vec::new();
            self.collect_dependencies(index, &registry, backend.as_ref(), None, &mut warnings)
        })
    }

    fn collect_dependencies(
        &self,
        index: &ProjectIndex,
        registry: &EntryPointRegistry,
        backend: &dyn DependencyBackend,
        progress: Option<ProgressCallback<'_>>,
        warnings: &mut Vec<String>,
    ) -> DependencyMap {
        let cache = self.config.use_cache.then(|| self.cache());
        let mut known = cache.as_ref().map(AnalysisCache::load).unwrap_or_default();
        if !known.is_empty() && self.config.invalidate_on_source_change {
            let stored = cache.as_ref().and_then(AnalysisCache::fingerprint);
            if stored.as_deref() != Some(index.fingerprint()) {
                info!(entries = known.len(), "project sources changed, discarding cached dependencies");
                known.clear();
            }
        }

        let missing: Vec<&EntryPoint> = registry
            .iter()
            .filter(|entry| !known.contains_key(&entry.id()))
            .collect();
        if missing.is_empty() {
            info!(entries = registry.len(), "all entry points served from cache");
            if let Some(progress) = progress {
                progress(&ProgressEvent::stage(65, "Loaded cached dependencies"));
            }
            return known;
        }

        let started = Instant::now();
        let traced = self.trace_entries(&missing, backend, progress);
        info!(
            traced = traced.len(),
            cached = known.len(),
            backend = backend.kind().as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "entry points traced"
        );
        known.extend(traced);

        if let Some(cache) = &cache {
            if let Err(err) = cache.save(&known, Some(index.fingerprint())) {
                warn!(path = %cache.path().display(), error = %err, "cache save failed");
                warnings.push(format!("Failed to save cache: {err}"));
            }
        }
        known
    }

    fn trace_entries(
        &self,
        entries: &[&EntryPoint],
        backend: &dyn DependencyBackend,
        progress: Option<ProgressCallback<'_>>,
    ) -> Vec<(String, EntryPointDependencies)> {
        let total = entries.len();
        // Counting and reporting share one lock so percentages arrive in
        // order even when workers finish together.
        let done = Mutex::new(0usize);
        let fine = progress.filter(|_| self.config.fine_progress);
        let work = |entry: &&EntryPoint| {
            let id = entry.id();
            let deps = backend.resolve(entry, fine);
            let mut finished = done.lock();
            *finished += 1;
            if let Some(progress) = progress {
                progress(&ProgressEvent::EntryPointTraced {
                    id: id.clone(),
                    done: *finished,
                    total,
                });
                progress(&ProgressEvent::stage(
                    scaled(10, 65, *finished, total),
                    format!("Analyzing endpoint {}/{total}: {}", *finished, entry.path),
                ));
            }
            drop(finished);
            (id, deps)
        };

        if !self.config.parallel || total < 2 {
            return entries.iter().map(work).collect();
        }
        let workers = std::thread::available_parallelism().map_or(1, |n| n.get());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.min(total).max(1))
            .build();
        match pool {
            Ok(pool) => pool.install(|| entries.par_iter().map(work).collect()),
            Err(_) => entries.iter().map(work).collect(),
        }
    }

    /// Run the whole analysis. Structural failures land in `errors`,
    /// per-file failures in `warnings`; a report is always returned.
    pub fn analyze(
        &self,
        entries: &dyn EntryPointSource,
        diff: &dyn DiffSource,
        progress: Option<ProgressCallback<'_>>,
    ) -> AnalysisReport {
        let started = Instant::now();
        let emit = |percent: u8, message: String| {
            if let Some(progress) = progress {
                progress(&ProgressEvent::stage(percent, message));
            }
        };
        let mut report = AnalysisReport {
            timestamp: unix_now(),
            project_root: self.root.display().to_string(),
            backend: self.config.backend.as_str().to_string(),
            ..AnalysisReport::default()
        };

        emit(0, "Parsing diff...".to_string());
        let changed = diff.changed_files().unwrap_or_else(|err| {
            report.errors.push(format!("Failed to parse diff: {err}"));
            Vec::new()
        });
        let sources: Vec<&ChangedFile> = changed.iter().filter(|f| f.is_source_file()).collect();
        report.total_files_changed = changed.len();
        report.source_files_changed = sources.len();

        emit(5, "Loading entry points...".to_string());
        let registry = match entries.entry_points() {
            Ok(list) if list.is_empty() => {
                report.errors.push("No entry points found".to_string());
                EntryPointRegistry::new()
            }
            Ok(list) => EntryPointRegistry::from_entries(list),
            Err(err) => {
                report.errors.push(format!("Failed to load entry points: {err}"));
                EntryPointRegistry::new()
            }
        };
        report.total_endpoints = registry.len();

        if !registry.is_empty() && !sources.is_empty() {
            emit(
                10,
                format!("Analyzing {} endpoints ({})...", registry.len(), self.config.backend),
            );
            let outcome = self.with_project_index(|index| {
                self.evaluate(index, &registry, &sources, progress, &mut report);
            });
            if let Err(err) = outcome {
                warn!(root = %self.root.display(), error = %err, "project index failed");
                report.errors.push(format!("Failed to index project: {err}"));
            }
        }

        emit(100, "Complete!".to_string());
        report.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!(
            endpoints = report.total_endpoints,
            affected = report.affected_count(),
            orphans = report.orphan_count(),
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            duration_ms = report.duration_ms as u64,
            "impact analysis finished"
        );
        report
    }

    fn evaluate(
        &self,
        index: &ProjectIndex,
        registry: &EntryPointRegistry,
        sources: &[&ChangedFile],
        progress: Option<ProgressCallback<'_>>,
        report: &mut AnalysisReport,
    ) {
        let oracle = ChainedOracle::standard(&self.config.state_dir(&self.root));
        let backend = backend_for(self.config.backend, index, &oracle, &self.config);
        let coverage = CoverageBackend::new(index, &self.config);
        let deps = self.collect_dependencies(index, registry, backend.as_ref(), progress, &mut report.warnings);

        if let Some(progress) = progress {
            progress(&ProgressEvent::stage(70, format!("Checking {} changed files...", sources.len())));
        }
        let mut mapper = ImpactMapper::new(registry, index, backend.as_ref(), &deps)
            .with_context_window(self.config.context_window)
            .with_trace_cap(clamp_depth(self.config.max_traces_per_file, MAX_TRACES_PER_FILE));
        if self.config.backend == BackendKind::Import {
            mapper = mapper.with_fallback(&coverage);
        }

        let mut findings: Vec<ImpactFinding> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let total = sources.len();
        for (i, file) in sources.iter().enumerate() {
            match mapper.map(file) {
                Ok(found) if found.is_empty() => {
                    if !file.changed_lines().is_empty() {
                        report.orphan_changes.push(OrphanChange::new(
                            &file.path,
                            file.added_lines().into_iter().collect(),
                            file.removed_lines().into_iter().collect(),
                        ));
                    }
                }
                Ok(found) => {
                    for finding in found {
                        merge_finding(&mut findings, &mut positions, finding);
                    }
                }
                Err(err) => {
                    warn!(file = %file.path, error = %err, "changed file analysis failed");
                    report.warnings.push(format!("Error analyzing {}: {err}", file.path));
                }
            }
            if let Some(progress) = progress {
                progress(&ProgressEvent::FileEvaluated {
                    path: file.path.clone(),
                    done: i + 1,
                    total,
                });
                let name = Path::new(&file.path)
                    .file_name()
                    .map_or_else(|| file.path.clone(), |n| n.to_string_lossy().to_string());
                progress(&ProgressEvent::stage(scaled(70, 90, i + 1, total), format!("Analyzing {name}...")));
            }
        }

        if let Some(progress) = progress {
            progress(&ProgressEvent::stage(95, "Filtering results..."));
        }
        let threshold = self.config.confidence_threshold;
        report.affected_endpoints = findings
            .into_iter()
            .filter(|finding| finding.confidence.score() >= threshold)
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::models::{ChangeKind, DiffHunk, HandlerLocation, HttpMethod};

    struct BrokenDiff;

    impl DiffSource for BrokenDiff {
        fn changed_files(&self) -> ImpactResult<Vec<ChangedFile>> {
            Err(ImpactError::Diff("unexpected hunk header".to_string()))
        }
    }

    const MAIN: &str = concat!(
        "from app.services import process\n",
        "\n",
        "\n",
        "def create_item(payload):\n",
        "    return process(payload)\n",
    );
    const SERVICES: &str = concat!(
        "from app.helpers import helper\n",
        "\n",
        "\n",
        "def process(payload):\n",
        "    return helper(payload)\n",
        "\n",
        "\n",
        "def audit(payload):\n",
        "    return helper(payload)\n",
    );
    const HELPERS: &str = "def helper(payload):\n    return payload\n";
    const UTIL: &str = "def utility(value):\n    return value * 2\n";
    const SERVICE_A: &str = "from app.util import utility\n\n\ndef run_a(v):\n    return utility(v)\n";
    const SERVICE_B: &str = "from app.util import utility\n\n\ndef run_b(v):\n    return utility(v)\n";
    const SHARED: &str = concat!(
        "from app.service_a import run_a\n",
        "from app.service_b import run_b\n",
        "\n",
        "\n",
        "def combined(v):\n",
        "    return run_a(v) + run_b(v)\n",
    );

    fn orders_source() -> String {
        let mut lines: Vec<String> = (1..10).map(|i| format!("# note {i}")).collect();
        lines.push("def list_orders():".to_string());
        lines.extend((11..20).map(|i| format!("    x{i} = {i}")));
        lines.push("    return x19".to_string());
        lines.join("\n") + "\n"
    }

    fn project() -> TempDir {
        let dir = tempfile::Builder::new().prefix("impact").tempdir().unwrap();
        let files: Vec<(&str, String)> = vec![
            ("app/__init__.py", String::new()),
            ("app/main.py", MAIN.to_string()),
            ("app/services.py", SERVICES.to_string()),
            ("app/helpers.py", HELPERS.to_string()),
            ("app/util.py", UTIL.to_string()),
            ("app/service_a.py", SERVICE_A.to_string()),
            ("app/service_b.py", SERVICE_B.to_string()),
            ("app/shared.py", SHARED.to_string()),
            ("app/orders.py", orders_source()),
            ("app/unused.py", "def idle():\n    return None\n".to_string()),
        ];
        for (path, content) in files {
            let full = dir.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
        dir
    }

    fn entries() -> Vec<EntryPoint> {
        vec![
            EntryPoint::new(
                "/items",
                [HttpMethod::Post],
                HandlerLocation::new("app/main.py", "app.main", "create_item", 4).with_end_line(5),
            ),
            EntryPoint::new(
                "/combined",
                [HttpMethod::Get],
                HandlerLocation::new("app/shared.py", "app.shared", "combined", 5).with_end_line(6),
            ),
            EntryPoint::new(
                "/orders",
                [HttpMethod::Get],
                HandlerLocation::new("app/orders.py", "app.orders", "list_orders", 10).with_end_line(20),
            ),
        ]
    }

    fn modified(path: &str, lines: impl IntoIterator<Item = i64>) -> ChangedFile {
        let lines: Vec<i64> = lines.into_iter().collect();
        let start = lines.first().copied().unwrap_or(1);
        ChangedFile::new(path, ChangeKind::Modified).with_hunk(
            DiffHunk::new(start, lines.len() as i64, start, lines.len() as i64).with_added(lines),
        )
    }

    fn analyzer(dir: &TempDir, config: AnalyzerConfig) -> ImpactAnalyzer {
        ImpactAnalyzer::new(dir.path(), config)
    }

    fn no_cache() -> AnalyzerConfig {
        AnalyzerConfig::default().with_cache(false)
    }

    #[test]
    fn test_added_function_next_to_reached_code() {
        let dir = project();
        let diff = vec![modified("app/services.py", [7, 8, 9])];
        let report = analyzer(&dir, no_cache()).analyze(&entries(), &diff, None);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.affected_count(), 1);
        let finding = &report.affected_endpoints[0];
        assert_eq!(finding.entry_id(), "POST /items");
        assert_eq!(finding.confidence, Confidence::Medium);
        let trace = &finding.traces[0];
        assert_eq!(trace.len(), 3);
        assert!(trace[0].is_origin());
        assert_eq!(trace[1].symbol, "create_item");
        assert_eq!(trace[2].symbol, "process");
    }

    #[test]
    fn test_edit_inside_handler_is_high() {
        let dir = project();
        let diff = vec![modified("app/orders.py", 12..=14)];
        let report = analyzer(&dir, no_cache()).analyze(&entries(), &diff, None);
        assert_eq!(report.affected_count(), 1);
        let finding = &report.affected_endpoints[0];
        assert_eq!(finding.confidence, Confidence::High);
        assert!(finding.reason.contains("app/orders.py"));
    }

    #[test]
    fn test_shared_utility_yields_one_finding_with_two_traces() {
        let dir = project();
        let diff = vec![modified("app/util.py", [2])];
        let report = analyzer(&dir, no_cache()).analyze(&entries(), &diff, None);
        assert_eq!(report.affected_count(), 1);
        let finding = &report.affected_endpoints[0];
        assert_eq!(finding.entry_id(), "GET /combined");
        assert_eq!(finding.traces.len(), 2);
        let through: Vec<&str> = finding.traces.iter().map(|t| t[2].symbol.as_str()).collect();
        assert!(through.contains(&"run_a"));
        assert!(through.contains(&"run_b"));
    }

    #[test]
    fn test_unrelated_change_is_an_orphan() {
        let dir = project();
        let diff = vec![
            modified("app/unused.py", [1, 2]),
            ChangedFile::new("README.md", ChangeKind::Modified),
        ];
        let report = analyzer(&dir, no_cache()).analyze(&entries(), &diff, None);
        assert!(report.affected_endpoints.is_empty());
        assert_eq!(report.total_endpoints, 3);
        assert!(report.errors.is_empty());
        assert_eq!(report.total_files_changed, 2);
        assert_eq!(report.source_files_changed, 1);
        assert_eq!(report.orphan_count(), 1);
        assert_eq!(report.total_orphan_lines(), 2);
    }

    #[test]
    fn test_broken_diff_reports_one_error() {
        let dir = project();
        let report = analyzer(&dir, no_cache()).analyze(&entries(), &BrokenDiff, None);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("Failed to parse diff"));
        assert!(report.affected_endpoints.is_empty());
        assert_eq!(report.total_endpoints, 3);
    }

    #[test]
    fn test_missing_entry_points_are_an_error() {
        let dir = project();
        let diff = vec![modified("app/util.py", [2])];
        let none: Vec<EntryPoint> = Vec::new();
        let report = analyzer(&dir, no_cache()).analyze(&none, &diff, None);
        assert!(report.has_errors());
        assert_eq!(report.total_endpoints, 0);
    }

    #[test]
    fn test_one_finding_per_entry_point_across_files() {
        let dir = project();
        let diff = vec![modified("app/util.py", [2]), modified("app/service_a.py", [5])];
        let report = analyzer(&dir, no_cache()).analyze(&entries(), &diff, None);
        let ids: Vec<String> = report.affected_endpoints.iter().map(|f| f.entry_id()).collect();
        assert_eq!(ids, vec!["GET /combined"]);
        assert_eq!(report.affected_endpoints[0].changed_files, vec!["app/util.py"]);
    }

    #[test]
    fn test_direct_edit_wins_over_earlier_file() {
        let dir = project();
        let diff = vec![modified("app/util.py", [2]), modified("app/shared.py", [6])];
        let report = analyzer(&dir, no_cache()).analyze(&entries(), &diff, None);
        assert_eq!(report.affected_count(), 1);
        assert_eq!(report.affected_endpoints[0].confidence, Confidence::High);
    }

    #[test]
    fn test_raising_threshold_never_adds_findings() {
        let dir = project();
        let diff = vec![modified("app/util.py", [2]), modified("app/orders.py", [12])];
        let mut previous = usize::MAX;
        for threshold in [0.0, 0.3, 0.5, 0.7, 0.9, 1.0] {
            let config = no_cache().with_backend(BackendKind::Import).with_threshold(threshold);
            let count = analyzer(&dir, config).analyze(&entries(), &diff, None).affected_count();
            assert!(count <= previous, "threshold {threshold} raised count to {count}");
            previous = count;
        }
        let low = analyzer(&dir, no_cache().with_backend(BackendKind::Import).with_threshold(0.3))
            .analyze(&entries(), &diff, None);
        assert_eq!(low.by_confidence(Confidence::Low).len(), 1);
        assert_eq!(low.high_confidence_count(), 1);
    }

    #[test]
    fn test_cache_round_trip_and_clear() {
        let dir = project();
        let config = AnalyzerConfig::default();
        let analyzer = analyzer(&dir, config.clone());
        let diff = vec![modified("app/util.py", [2])];
        let first = analyzer.analyze(&entries(), &diff, None);
        assert!(analyzer.cache().exists());

        let cached = AnalysisCache::for_project(dir.path(), &config).load();
        let fresh = ImpactAnalyzer::new(dir.path(), config.clone().with_cache(false))
            .dependencies(&entries())
            .unwrap();
        for entry in entries() {
            let id = entry.id();
            assert_eq!(cached[&id].referenced_files, fresh[&id].referenced_files);
        }

        let second = analyzer.analyze(&entries(), &diff, None);
        assert_eq!(first.affected_endpoints, second.affected_endpoints);

        analyzer.clear_cache().unwrap();
        assert!(!analyzer.cache().exists());
    }

    #[test]
    fn test_coverage_backend_end_to_end() {
        let dir = project();
        let diff = vec![modified("app/services.py", [9])];
        let config = no_cache().with_backend(BackendKind::Coverage);
        let report = analyzer(&dir, config).analyze(&entries(), &diff, None);
        assert_eq!(report.backend, "coverage");
        assert_eq!(report.affected_count(), 1);
        assert!(report.affected_endpoints[0].reason.starts_with("Coverage intersects with app/services.py"));
    }

    #[test]
    fn test_progress_milestones() {
        let dir = project();
        let diff = vec![modified("app/util.py", [2])];
        let events: Mutex<Vec<ProgressEvent>> = Mutex::new(Vec::new());
        let sink = |event: &ProgressEvent| events.lock().push(event.clone());
        let config = AnalyzerConfig {
            fine_progress: true,
            parallel: false,
            ..no_cache()
        };
        analyzer(&dir, config).analyze(&entries(), &diff, Some(&sink));

        let events = events.into_inner();
        let stages: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Stage { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(stages.first(), Some(&0));
        assert_eq!(stages.last(), Some(&100));
        assert!(stages.windows(2).all(|w| w[0] <= w[1]));
        let traced = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::EntryPointTraced { .. }))
            .count();
        assert_eq!(traced, 3);
        assert!(events.iter().any(|e| matches!(e, ProgressEvent::CallResolved { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::FileEvaluated { done: 1, total: 1, .. })));
    }

    #[test]
    fn test_parallel_tracing_reports_progress_in_order() {
        let dir = project();
        let diff = vec![modified("app/util.py", [2])];
        let events: Mutex<Vec<ProgressEvent>> = Mutex::new(Vec::new());
        let sink = |event: &ProgressEvent| events.lock().push(event.clone());
        let config = AnalyzerConfig {
            parallel: true,
            ..no_cache()
        };
        analyzer(&dir, config).analyze(&entries(), &diff, Some(&sink));

        let events = events.into_inner();
        let traced: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::EntryPointTraced { done, .. } => Some(*done),
                _ => None,
            })
            .collect();
        assert_eq!(traced, vec![1, 2, 3]);
        let stages: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Stage { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert!(stages.windows(2).all(|w| w[0] <= w[1]), "{stages:?}");
    }

    #[test]
    fn test_prebuilt_index_skips_scanning() {
        let index = ProjectIndex::from_sources(
            Path::new("/virtual"),
            [("app/util.py", UTIL), ("app/service_a.py", SERVICE_A)],
        );
        let entry = EntryPoint::new(
            "/a",
            [HttpMethod::Get],
            HandlerLocation::new("app/service_a.py", "app.service_a", "run_a", 4).with_end_line(5),
        );
        let analyzer = ImpactAnalyzer::new("/virtual", no_cache()).with_index(index);
        let report = analyzer.analyze(&vec![entry], &vec![modified("app/util.py", [1])], None);
        assert_eq!(report.affected_count(), 1);
    }
}
