//! Dependency backends: interchangeable strategies answering "does this entry
//! point reach the changed lines", from precise symbol tracing down to module
//! imports.

use std::collections::BTreeSet;

use crate::config::{AnalyzerConfig, BackendKind};
use crate::errors::{ImpactError, ImpactResult};
use crate::indexer::filesystem::normalize_path;
use crate::indexer::pipeline::ProjectIndex;
use crate::indexer::semantic::TypeOracle;
use crate::models::{
    ChangedFile, Confidence, EntryPoint, EntryPointDependencies, ImpactFinding, ProgressCallback,
    SymbolReference, Trace, TraceFrame,
};
use crate::query::guards::{clamp_depth, MAX_REASON_LINES, MAX_TRACES_PER_FILE};
use crate::query::import_graph::ImportGraph;
use crate::query::reachability::CoarseReachability;
use crate::query::tracer::SymbolTracer;

/// Line sets of one changed file, widened by the context window.
#[derive(Clone, Debug)]
pub struct ChangeContext<'c> {
    pub file: &'c ChangedFile,
    pub path: String,
    pub added: BTreeSet<i64>,
    pub removed: BTreeSet<i64>,
    pub changed: BTreeSet<i64>,
    /// Changed lines plus every line within the window of one.
    pub window: BTreeSet<i64>,
}

impl<'c> ChangeContext<'c> {
    pub fn new(file: &'c ChangedFile, context_window: i64) -> Self {
        let added = file.added_lines();
        let removed = file.removed_lines();
        let changed: BTreeSet<i64> = added.union(&removed).copied().collect();
        let radius = context_window.max(0);
        let window = changed
            .iter()
            .flat_map(|line| (line - radius).max(1)..=line + radius)
            .collect();
        Self {
            file,
            path: normalize_path(&file.path),
            added,
            removed,
            changed,
            window,
        }
    }
}

pub trait DependencyBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Dependency record for one entry point. Records are plain data and may
    /// be cached between runs.
    fn resolve(&self, entry: &EntryPoint, progress: Option<ProgressCallback<'_>>) -> EntryPointDependencies;

    /// Judge `entry` against one changed file. `deps` is the record from
    /// [`resolve`](Self::resolve), when one was computed. An `Err` means the
    /// backend cannot judge this file at all.
    fn assess(
        &self,
        entry: &EntryPoint,
        deps: Option<&EntryPointDependencies>,
        change: &ChangeContext<'_>,
    ) -> ImpactResult<Option<ImpactFinding>>;
}

/// Build the configured backend over `index`.
pub fn backend_for<'a>(
    kind: BackendKind,
    index: &'a ProjectIndex,
    oracle: &'a dyn TypeOracle,
    config: &AnalyzerConfig,
) -> Box<dyn DependencyBackend + 'a> {
    match kind {
        BackendKind::Symbol => Box::new(SymbolBackend::new(index, oracle, config)),
        BackendKind::Import => Box::new(ImportBackend::new(index, config)),
        BackendKind::Coverage => Box::new(CoverageBackend::new(index, config)),
    }
}

// ---------------------------------------------------------------------------
// Finding assembly shared by the line-level backends
// ---------------------------------------------------------------------------

/// Consecutive runs of `lines` as inclusive ranges.
pub fn group_lines(lines: &BTreeSet<i64>) -> Vec<(i64, i64)> {
    let mut groups: Vec<(i64, i64)> = Vec::new();
    for &line in lines {
        match groups.last_mut() {
            Some((_, end)) if *end + 1 == line => *end = line,
            _ => groups.push((line, line)),
        }
    }
    groups
}

/// `[1, 2, 3]` with a trailing `...` past the first few lines.
pub fn line_preview(lines: &BTreeSet<i64>) -> String {
    let shown: Vec<String> = lines.iter().take(MAX_REASON_LINES).map(i64::to_string).collect();
    let more = if lines.len() > MAX_REASON_LINES { "..." } else { "" };
    format!("[{}]{more}", shown.join(", "))
}

fn dedent(lines: &[&str]) -> String {
    let indent = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    lines
        .iter()
        .map(|l| l.get(indent..).unwrap_or_else(|| l.trim_start()).trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Frame covering `start..=end` of `file`, with the code as its snippet.
pub fn range_frame(index: &ProjectIndex, file: &str, symbol: &str, start: i64, end: i64) -> TraceFrame {
    let code: Vec<&str> = (start..=end).filter_map(|l| index.line_text(file, l)).collect();
    let body = dedent(&code);
    let snippet = if body.trim().is_empty() {
        format!("[lines {start}-{end}]")
    } else {
        format!("[lines {start}-{end}]\n{body}")
    };
    TraceFrame::new(file, start, symbol, Some(snippet))
}

/// One trace per distinct path into the symbols owning `lines`, each ending
/// in a frame showing the affected lines.
pub fn finding_traces(
    index: &ProjectIndex,
    deps: &EntryPointDependencies,
    file: &str,
    lines: &BTreeSet<i64>,
    cap: usize,
) -> Vec<Trace> {
    let stored = deps.traces_for(file);
    let mut traces: Vec<Trace> = Vec::new();
    for (start, end) in group_lines(lines) {
        let owner = deps.symbol_at_line(file, start);
        let symbol = owner.map_or("<module>", |o| o.symbol.as_str());
        let owner_file = owner.map_or(file, |o| o.file.as_str());
        let frame = range_frame(index, owner_file, symbol, start, end);

        let bases: Vec<&Trace> = stored
            .iter()
            .filter(|t| t.last().is_some_and(|f| f.symbol == symbol))
            .collect();
        if bases.is_empty() {
            // No recorded path ends at the owner: show only where it starts.
            let mut trace: Trace = stored
                .iter()
                .find_map(|t| t.first().filter(|f| f.is_origin()).cloned())
                .into_iter()
                .collect();
            trace.push(frame);
            if !traces.contains(&trace) {
                traces.push(trace);
            }
            if traces.len() >= cap {
                return traces;
            }
            continue;
        }
        for base in bases {
            let mut trace = base.clone();
            if trace.len() > 1 && trace.last().is_some_and(|f| !f.is_origin()) {
                trace.pop();
            }
            trace.push(frame.clone());
            if !traces.contains(&trace) {
                traces.push(trace);
            }
            if traces.len() >= cap {
                return traces;
            }
        }
    }
    traces
}

/// Handler module, then each distinct symbol along `trace`, then `file`.
pub fn chain_from_trace(entry: &EntryPoint, trace: Option<&Trace>, file: &str) -> Vec<String> {
    let mut chain = vec![if entry.handler.module.is_empty() {
        "unknown".to_string()
    } else {
        entry.handler.module.clone()
    }];
    for frame in trace.into_iter().flatten().filter(|f| !f.is_origin()) {
        if chain.last() != Some(&frame.symbol) {
            chain.push(frame.symbol.clone());
        }
    }
    if chain.last().map(String::as_str) != Some(file) {
        chain.push(file.to_string());
    }
    chain
}

fn line_overlap_finding(
    index: &ProjectIndex,
    entry: &EntryPoint,
    deps: &EntryPointDependencies,
    change: &ChangeContext<'_>,
    label: &str,
    cap: usize,
) -> Option<ImpactFinding> {
    if !deps.references_file(&change.path) {
        return None;
    }
    let overlap = deps.references_lines(&change.path, &change.window);
    if overlap.is_empty() {
        return None;
    }
    let direct = deps.references_lines(&change.path, &change.changed);
    let shown = if direct.is_empty() { &overlap } else { &direct };

    let reason = format!("{label} {} (lines {})", change.path, line_preview(shown));
    let traces = finding_traces(index, deps, &change.path, shown, cap);
    let mut finding = ImpactFinding::new(entry.clone(), Confidence::Medium, reason);
    finding.dependency_chain = chain_from_trace(entry, traces.first(), &change.path);
    finding.changed_files = vec![change.path.clone()];
    finding.traces = traces;
    Some(finding)
}

// ---------------------------------------------------------------------------
// Symbol-level tracing
// ---------------------------------------------------------------------------

pub struct SymbolBackend<'a> {
    index: &'a ProjectIndex,
    oracle: &'a dyn TypeOracle,
    max_depth: i64,
    max_traces: i64,
}

impl<'a> SymbolBackend<'a> {
    pub fn new(index: &'a ProjectIndex, oracle: &'a dyn TypeOracle, config: &AnalyzerConfig) -> Self {
        Self {
            index,
            oracle,
            max_depth: config.max_trace_depth,
            max_traces: config.max_traces_per_file,
        }
    }
}

impl DependencyBackend for SymbolBackend<'_> {
    fn kind(&self) -> BackendKind {
        BackendKind::Symbol
    }

    fn resolve(&self, entry: &EntryPoint, progress: Option<ProgressCallback<'_>>) -> EntryPointDependencies {
        let mut tracer = SymbolTracer::new(self.index, self.oracle).with_limits(self.max_depth, self.max_traces);
        if let Some(progress) = progress {
            tracer = tracer.with_progress(progress);
        }
        tracer.trace(entry)
    }

    fn assess(
        &self,
        entry: &EntryPoint,
        deps: Option<&EntryPointDependencies>,
        change: &ChangeContext<'_>,
    ) -> ImpactResult<Option<ImpactFinding>> {
        let owned;
        let deps = match deps {
            Some(deps) => deps,
            None => {
                owned = self.resolve(entry, None);
                &owned
            }
        };
        Ok(line_overlap_finding(
            self.index,
            entry,
            deps,
            change,
            "Type analysis shows dependency on",
            clamp_depth(self.max_traces, MAX_TRACES_PER_FILE),
        ))
    }
}

// ---------------------------------------------------------------------------
// Coarse whole-file reachability
// ---------------------------------------------------------------------------

pub struct CoverageBackend<'a> {
    index: &'a ProjectIndex,
    max_traces: usize,
}

impl<'a> CoverageBackend<'a> {
    pub fn new(index: &'a ProjectIndex, config: &AnalyzerConfig) -> Self {
        Self {
            index,
            max_traces: clamp_depth(config.max_traces_per_file, MAX_TRACES_PER_FILE),
        }
    }
}

impl DependencyBackend for CoverageBackend<'_> {
    fn kind(&self) -> BackendKind {
        BackendKind::Coverage
    }

    fn resolve(&self, entry: &EntryPoint, _progress: Option<ProgressCallback<'_>>) -> EntryPointDependencies {
        CoarseReachability::new(self.index)
            .with_trace_cap(self.max_traces)
            .trace(entry)
    }

    fn assess(
        &self,
        entry: &EntryPoint,
        deps: Option<&EntryPointDependencies>,
        change: &ChangeContext<'_>,
    ) -> ImpactResult<Option<ImpactFinding>> {
        let owned;
        let deps = match deps {
            Some(deps) => deps,
            None => {
                owned = self.resolve(entry, None);
                &owned
            }
        };
        Ok(line_overlap_finding(
            self.index,
            entry,
            deps,
            change,
            "Coverage intersects with",
            self.max_traces,
        ))
    }
}

// ---------------------------------------------------------------------------
// Module import reachability
// ---------------------------------------------------------------------------

pub struct ImportBackend<'a> {
    index: &'a ProjectIndex,
    graph: ImportGraph,
    track_transitive: bool,
}

impl<'a> ImportBackend<'a> {
    pub fn new(index: &'a ProjectIndex, config: &AnalyzerConfig) -> Self {
        Self {
            index,
            graph: ImportGraph::build(index),
            track_transitive: config.track_transitive,
        }
    }

    pub fn graph(&self) -> &ImportGraph {
        &self.graph
    }

    fn handler_module(&self, entry: &EntryPoint) -> Option<String> {
        self.index
            .module_for_file(&entry.handler.file)
            .map(|m| m.name.clone())
            .or_else(|| {
                self.index
                    .canonical_module(&entry.handler.module)
                    .map(str::to_string)
            })
    }

    /// Line in `from` importing `to`, or 1.
    fn import_line(&self, from: &str, to: &str) -> i64 {
        let Some(module) = self.index.module(from) else {
            return 1;
        };
        module
            .imports
            .iter()
            .find(|record| {
                self.index.canonical_module(&record.module) == Some(to)
                    || record
                        .names
                        .iter()
                        .any(|n| self.index.canonical_module(&format!("{}.{n}", record.module)) == Some(to))
            })
            .map_or(1, |record| record.line)
    }

    /// Traceback along a module chain: one frame per import statement.
    fn chain_trace(&self, entry: &EntryPoint, chain: &[String]) -> Trace {
        let handler_file = self
            .graph
            .module_to_file(chain.first().map_or("", String::as_str))
            .unwrap_or(entry.handler.file.as_str())
            .to_string();
        let mut trace = vec![TraceFrame::origin(entry, handler_file, entry.handler.start_line)];
        for pair in chain.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            let file = self.graph.module_to_file(from).unwrap_or_default();
            let line = self.import_line(from, to);
            let snippet = self.index.line_text(file, line).map(|t| t.trim().to_string());
            trace.push(TraceFrame::new(file, line, from, snippet));
        }
        if let Some(last) = chain.last() {
            let file = self.graph.module_to_file(last).unwrap_or_default();
            trace.push(TraceFrame::new(file, 1, last, None));
        }
        trace
    }

    fn finding(
        &self,
        entry: &EntryPoint,
        confidence: Confidence,
        reason: String,
        chain: Vec<String>,
        change: &ChangeContext<'_>,
    ) -> ImpactFinding {
        let mut finding = ImpactFinding::new(entry.clone(), confidence, reason);
        finding.traces = vec![self.chain_trace(entry, &chain)];
        finding.dependency_chain = chain;
        finding.changed_files = vec![change.path.clone()];
        finding
    }
}

/// `a.b.c`, `a.b`, `a`.
fn module_and_parents(module: &str) -> Vec<String> {
    let parts: Vec<&str> = module.split('.').collect();
    (1..=parts.len()).rev().map(|n| parts[..n].join(".")).collect()
}

impl DependencyBackend for ImportBackend<'_> {
    fn kind(&self) -> BackendKind {
        BackendKind::Import
    }

    /// Every module file the handler's module reaches, each recorded whole.
    fn resolve(&self, entry: &EntryPoint, _progress: Option<ProgressCallback<'_>>) -> EntryPointDependencies {
        let mut deps = EntryPointDependencies::new();
        deps.add_symbol_reference(SymbolReference::new(
            &entry.handler.file,
            &entry.handler.symbol,
            entry.handler.start_line,
            entry.handler.effective_end(),
        ));
        let Some(handler_module) = self.handler_module(entry) else {
            return deps;
        };
        let reached = if self.track_transitive {
            self.graph.transitively_imports(&handler_module)
        } else {
            self.graph.directly_imports(&handler_module)
        };
        for module in reached {
            let Some(info) = self.index.module(&module) else {
                continue;
            };
            deps.add_symbol_lines(
                SymbolReference::new(&info.path, &info.name, 1, info.line_count().max(1)),
                info.executable_lines.iter().copied(),
            );
            if let Some(chain) = self.graph.shortest_path(&handler_module, &module) {
                deps.add_trace(&info.path, self.chain_trace(entry, &chain), 1);
            }
        }
        deps
    }

    fn assess(
        &self,
        entry: &EntryPoint,
        _deps: Option<&EntryPointDependencies>,
        change: &ChangeContext<'_>,
    ) -> ImpactResult<Option<ImpactFinding>> {
        let changed_module = self
            .graph
            .file_to_module(&change.path)
            .ok_or_else(|| ImpactError::Mapping(format!("{} is not part of the import graph", change.path)))?;
        let Some(handler_module) = self.handler_module(entry) else {
            return Ok(None);
        };
        if handler_module == changed_module {
            return Ok(None);
        }
        let candidates = module_and_parents(changed_module);

        let direct = self.graph.directly_imports(&handler_module);
        if let Some(module) = candidates.iter().find(|m| direct.contains(*m)) {
            let reason = format!("Handler imports {module} (changed: {changed_module})");
            let chain = vec![handler_module.clone(), module.clone()];
            return Ok(Some(self.finding(entry, Confidence::Medium, reason, chain, change)));
        }

        if self.track_transitive {
            let upstream = self.graph.transitively_imports(&handler_module);
            if let Some(module) = candidates.iter().find(|m| upstream.contains(*m)) {
                let reason = format!("Handler transitively depends on {module} (changed: {changed_module})");
                let chain = self
                    .graph
                    .shortest_path(&handler_module, module)
                    .unwrap_or_else(|| vec![handler_module.clone(), module.clone()]);
                return Ok(Some(self.finding(entry, Confidence::Low, reason, chain, change)));
            }
        }
        Ok(None)
    }
}
