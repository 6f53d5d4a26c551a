//! Shared typed models used across indexing, tracing, mapping, and storage layers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::indexer::filesystem::{normalize_path, same_source_file};

// ---------------------------------------------------------------------------
// Contract constants
// ---------------------------------------------------------------------------

/// Assumed handler span when the extractor could not report an end line.
pub const HANDLER_FALLBACK_SPAN: i64 = 50;

/// Prefix of the synthetic first frame of every recorded trace.
pub const ENDPOINT_FRAME_MARKER: &str = "[ENDPOINT]";

static LINE_RANGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[lines (\d+)-(\d+)\]").unwrap());

// ---------------------------------------------------------------------------
// 1. EntryPoint
// ---------------------------------------------------------------------------

/// HTTP verbs an entry point can answer to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Head,
    Trace,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Head => "HEAD",
            HttpMethod::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "DELETE" => Some(HttpMethod::Delete),
            "PATCH" => Some(HttpMethod::Patch),
            "OPTIONS" => Some(HttpMethod::Options),
            "HEAD" => Some(HttpMethod::Head),
            "TRACE" => Some(HttpMethod::Trace),
            _ => None,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the handler of an entry point is declared.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerLocation {
    pub file: String,
    pub module: String,
    pub symbol: String,
    pub start_line: i64,
    pub end_line: Option<i64>,
}

impl HandlerLocation {
    pub fn new(file: impl Into<String>, module: impl Into<String>, symbol: impl Into<String>, start_line: i64) -> Self {
        Self {
            file: file.into(),
            module: module.into(),
            symbol: symbol.into(),
            start_line,
            end_line: None,
        }
    }

    pub fn with_end_line(mut self, end_line: i64) -> Self {
        self.end_line = Some(end_line);
        self
    }

    /// Declared end line, or a fixed span past the start when unknown.
    pub fn effective_end(&self) -> i64 {
        self.end_line
            .unwrap_or(self.start_line + HANDLER_FALLBACK_SPAN)
            .max(self.start_line)
    }

    pub fn contains_line(&self, line: i64) -> bool {
        self.start_line <= line && line <= self.effective_end()
    }
}

/// An addressable unit of the analyzed application's public surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub path: String,
    pub methods: Vec<HttpMethod>,
    pub handler: HandlerLocation,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl EntryPoint {
    pub fn new(path: impl Into<String>, methods: impl IntoIterator<Item = HttpMethod>, handler: HandlerLocation) -> Self {
        let mut methods: Vec<HttpMethod> = methods.into_iter().collect();
        methods.dedup();
        Self {
            path: path.into(),
            methods,
            handler,
            name: None,
            tags: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Stable identifier: sorted method names joined by commas, a space, then the path.
    pub fn id(&self) -> String {
        let mut names: Vec<&str> = self.methods.iter().map(HttpMethod::as_str).collect();
        names.sort_unstable();
        names.dedup();
        format!("{} {}", names.join(","), self.path)
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}.{}", self.id(), self.handler.module, self.handler.symbol)
    }
}

// ---------------------------------------------------------------------------
// 2. Traced dependencies
// ---------------------------------------------------------------------------

/// A symbol and its line range, reached from an entry point.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolReference {
    pub file: String,
    pub symbol: String,
    #[serde(rename = "start")]
    pub start_line: i64,
    #[serde(rename = "end")]
    pub end_line: i64,
}

impl SymbolReference {
    pub fn new(file: impl Into<String>, symbol: impl Into<String>, start_line: i64, end_line: i64) -> Self {
        Self {
            file: normalize_path(&file.into()),
            symbol: symbol.into(),
            start_line,
            end_line: end_line.max(start_line),
        }
    }

    pub fn contains_line(&self, line: i64) -> bool {
        self.start_line <= line && line <= self.end_line
    }

    fn span(&self) -> i64 {
        self.end_line - self.start_line
    }
}

/// One step of a call chain.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceFrame {
    pub file: String,
    pub line: i64,
    pub symbol: String,
    #[serde(default)]
    pub snippet: Option<String>,
}

impl TraceFrame {
    pub fn new(file: impl Into<String>, line: i64, symbol: impl Into<String>, snippet: Option<String>) -> Self {
        Self {
            file: file.into(),
            line,
            symbol: symbol.into(),
            snippet,
        }
    }

    /// Synthetic origin frame naming the entry point and its handler.
    pub fn origin(entry: &EntryPoint, file: impl Into<String>, line: i64) -> Self {
        Self::new(
            file,
            line,
            format!("{ENDPOINT_FRAME_MARKER} {}", entry.id()),
            Some(format!("Handler: {}", entry.handler.symbol)),
        )
    }

    pub fn is_origin(&self) -> bool {
        self.symbol.starts_with(ENDPOINT_FRAME_MARKER)
    }

    /// Render the frame the way an interpreter traceback would.
    pub fn format_traceback(&self) -> String {
        let mut line_display = format!("line {}", self.line);
        if let Some(snippet) = &self.snippet {
            if let Some(caps) = LINE_RANGE_RE.captures(snippet) {
                line_display = format!("lines {}-{}", &caps[1], &caps[2]);
            }
        }
        let mut out = format!("  File \"{}\", {}, in {}", self.file, line_display, self.symbol);
        if let Some(snippet) = &self.snippet {
            let body = snippet.trim();
            for line in body.lines() {
                out.push_str("\n    ");
                out.push_str(line);
            }
        }
        out
    }
}

/// Ordered call chain from a handler to a discovered location.
pub type Trace = Vec<TraceFrame>;

/// Everything statically reachable from one entry point.
///
/// Every line stored in `referenced_files` lies inside the range of some
/// entry in `referenced_symbols` for the same file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPointDependencies {
    #[serde(default)]
    pub referenced_files: BTreeMap<String, BTreeSet<i64>>,
    #[serde(default)]
    pub referenced_symbols: Vec<SymbolReference>,
    #[serde(default)]
    pub traces: BTreeMap<String, Vec<Trace>>,
}

impl EntryPointDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a symbol and every line of its range.
    pub fn add_symbol_reference(&mut self, reference: SymbolReference) {
        let lines = reference.start_line..=reference.end_line;
        self.add_symbol_lines(reference, lines);
    }

    /// Record a single line owned by `symbol`.
    pub fn add_reference(&mut self, file: &str, line: i64, symbol: &str) {
        self.add_symbol_reference(SymbolReference::new(file, symbol, line, line));
    }

    /// Record a symbol together with a subset of its lines. Lines outside
    /// the symbol's range are dropped.
    pub fn add_symbol_lines(&mut self, reference: SymbolReference, lines: impl IntoIterator<Item = i64>) {
        let owned: Vec<i64> = lines
            .into_iter()
            .filter(|line| reference.contains_line(*line))
            .collect();
        self.referenced_files
            .entry(reference.file.clone())
            .or_default()
            .extend(owned);
        if !self.referenced_symbols.contains(&reference) {
            self.referenced_symbols.push(reference);
        }
    }

    /// Keep `trace` for `file` unless an identical chain is already stored.
    /// `cap` bounds the alternative paths kept per final symbol, so every
    /// reached symbol keeps at least one trace. Returns whether it was stored.
    pub fn add_trace(&mut self, file: &str, trace: Trace, cap: usize) -> bool {
        let slot = self.traces.entry(normalize_path(file)).or_default();
        if slot.contains(&trace) {
            return false;
        }
        let target = trace.last().map(|f| f.symbol.as_str());
        let alternatives = slot
            .iter()
            .filter(|t| t.last().map(|f| f.symbol.as_str()) == target)
            .count();
        if alternatives >= cap.max(1) {
            return false;
        }
        slot.push(trace);
        true
    }

    fn file_key(&self, file: &str) -> Option<&str> {
        let normalized = normalize_path(file);
        if let Some((key, _)) = self.referenced_files.get_key_value(&normalized) {
            return Some(key.as_str());
        }
        self.referenced_files
            .keys()
            .find(|key| same_source_file(key, &normalized))
            .map(String::as_str)
    }

    pub fn references_file(&self, file: &str) -> bool {
        self.file_key(file).is_some()
    }

    pub fn lines_for(&self, file: &str) -> Option<&BTreeSet<i64>> {
        self.file_key(file).and_then(|key| self.referenced_files.get(key))
    }

    /// Intersection of the recorded lines for `file` with `lines`.
    pub fn references_lines(&self, file: &str, lines: &BTreeSet<i64>) -> BTreeSet<i64> {
        match self.lines_for(file) {
            Some(recorded) => recorded.intersection(lines).copied().collect(),
            None => BTreeSet::new(),
        }
    }

    pub fn traces_for(&self, file: &str) -> &[Trace] {
        let normalized = normalize_path(file);
        if let Some(traces) = self.traces.get(&normalized) {
            return traces;
        }
        self.traces
            .iter()
            .find(|(key, _)| same_source_file(key, &normalized))
            .map(|(_, traces)| traces.as_slice())
            .unwrap_or(&[])
    }

    /// First recorded trace reaching `file`.
    pub fn primary_trace(&self, file: &str) -> Option<&Trace> {
        self.traces_for(file).first()
    }

    /// Narrowest recorded symbol whose range contains `line` in `file`.
    pub fn symbol_at_line(&self, file: &str, line: i64) -> Option<&SymbolReference> {
        let normalized = normalize_path(file);
        self.referenced_symbols
            .iter()
            .filter(|r| r.contains_line(line) && same_source_file(&r.file, &normalized))
            .min_by_key(|r| r.span())
    }

    pub fn is_empty(&self) -> bool {
        self.referenced_files.is_empty()
    }
}

// ---------------------------------------------------------------------------
// 3. Changed regions
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// One hunk of a unified diff with its per-side line numbers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffHunk {
    pub source_start: i64,
    pub source_length: i64,
    pub target_start: i64,
    pub target_length: i64,
    #[serde(default)]
    pub added_lines: Vec<i64>,
    #[serde(default)]
    pub removed_lines: Vec<i64>,
}

impl DiffHunk {
    pub fn new(source_start: i64, source_length: i64, target_start: i64, target_length: i64) -> Self {
        Self {
            source_start,
            source_length,
            target_start,
            target_length,
            added_lines: Vec::new(),
            removed_lines: Vec::new(),
        }
    }

    pub fn with_added(mut self, lines: impl IntoIterator<Item = i64>) -> Self {
        self.added_lines.extend(lines);
        self
    }

    pub fn with_removed(mut self, lines: impl IntoIterator<Item = i64>) -> Self {
        self.removed_lines.extend(lines);
        self
    }
}

/// A file touched by the diff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub kind: ChangeKind,
    #[serde(default)]
    pub previous_path: Option<String>,
    #[serde(default)]
    pub hunks: Vec<DiffHunk>,
}

impl ChangedFile {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            previous_path: None,
            hunks: Vec::new(),
        }
    }

    pub fn with_hunk(mut self, hunk: DiffHunk) -> Self {
        self.hunks.push(hunk);
        self
    }

    pub fn renamed_from(mut self, previous: impl Into<String>) -> Self {
        self.previous_path = Some(previous.into());
        self
    }

    pub fn is_source_file(&self) -> bool {
        self.path.ends_with(".py")
    }

    /// Inclusive line ranges touched by each hunk. Deleted files report
    /// source-side ranges, every other kind target-side ranges.
    pub fn affected_line_ranges(&self) -> Vec<(i64, i64)> {
        self.hunks
            .iter()
            .map(|hunk| {
                let (start, length) = match self.kind {
                    ChangeKind::Deleted => (hunk.source_start, hunk.source_length),
                    _ => (hunk.target_start, hunk.target_length),
                };
                (start, start + (length - 1).max(0))
            })
            .collect()
    }

    pub fn added_lines(&self) -> BTreeSet<i64> {
        self.hunks.iter().flat_map(|h| h.added_lines.iter().copied()).collect()
    }

    pub fn removed_lines(&self) -> BTreeSet<i64> {
        self.hunks.iter().flat_map(|h| h.removed_lines.iter().copied()).collect()
    }

    /// Union of added and removed line numbers.
    pub fn changed_lines(&self) -> BTreeSet<i64> {
        let mut lines = self.added_lines();
        lines.extend(self.removed_lines());
        lines
    }
}

// ---------------------------------------------------------------------------
// 4. Findings and report
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    /// Numeric weight compared against the configured threshold.
    pub fn score(&self) -> f64 {
        match self {
            Confidence::High => 1.0,
            Confidence::Medium => 0.7,
            Confidence::Low => 0.3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entry point judged to be affected by a change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImpactFinding {
    pub entry_point: EntryPoint,
    pub confidence: Confidence,
    pub reason: String,
    #[serde(default)]
    pub dependency_chain: Vec<String>,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub traces: Vec<Trace>,
}

impl ImpactFinding {
    pub fn new(entry_point: EntryPoint, confidence: Confidence, reason: impl Into<String>) -> Self {
        Self {
            entry_point,
            confidence,
            reason: reason.into(),
            dependency_chain: Vec::new(),
            changed_files: Vec::new(),
            traces: Vec::new(),
        }
    }

    pub fn entry_id(&self) -> String {
        self.entry_point.id()
    }

    /// Every trace as a labelled traceback block.
    pub fn format_traceback(&self) -> String {
        let total = self.traces.len();
        let mut blocks = Vec::with_capacity(total);
        for (i, trace) in self.traces.iter().enumerate() {
            let mut block = if total > 1 {
                vec![format!("Traceback (dependency chain, path {} of {total}):", i + 1)]
            } else {
                vec!["Traceback (dependency chain):".to_string()]
            };
            block.extend(trace.iter().map(TraceFrame::format_traceback));
            blocks.push(block.join("\n"));
        }
        blocks.join("\n\n")
    }
}

impl fmt::Display for ImpactFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.confidence.as_str().to_ascii_uppercase(),
            self.entry_point.id(),
            self.reason
        )?;
        if !self.traces.is_empty() {
            write!(f, "\n{}", self.format_traceback())?;
        }
        Ok(())
    }
}

/// A changed source file that no entry point was found to depend on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanChange {
    pub file: String,
    pub added_lines: Vec<i64>,
    pub removed_lines: Vec<i64>,
    pub reason: String,
}

impl OrphanChange {
    pub const DEFAULT_REASON: &'static str = "Changed code is not related to any endpoint";
    const MAX_LISTED_LINES: usize = 10;

    pub fn new(file: impl Into<String>, added_lines: Vec<i64>, removed_lines: Vec<i64>) -> Self {
        Self {
            file: file.into(),
            added_lines,
            removed_lines,
            reason: Self::DEFAULT_REASON.to_string(),
        }
    }

    pub fn total_lines(&self) -> usize {
        self.added_lines.len() + self.removed_lines.len()
    }

    /// Human summary such as `Added: lines 1, 2, 3; Removed: line 7`.
    pub fn format_lines(&self) -> String {
        let mut parts = Vec::new();
        if !self.added_lines.is_empty() {
            parts.push(format!("Added: {}", Self::format_line_list(&self.added_lines)));
        }
        if !self.removed_lines.is_empty() {
            parts.push(format!("Removed: {}", Self::format_line_list(&self.removed_lines)));
        }
        parts.join("; ")
    }

    fn format_line_list(lines: &[i64]) -> String {
        let label = if lines.len() == 1 { "line" } else { "lines" };
        let shown: Vec<String> = lines
            .iter()
            .take(Self::MAX_LISTED_LINES)
            .map(i64::to_string)
            .collect();
        if lines.len() > Self::MAX_LISTED_LINES {
            format!("{label} {}, ... ({} total)", shown.join(", "), lines.len())
        } else {
            format!("{label} {}", shown.join(", "))
        }
    }
}

/// Aggregate result of one analysis run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Seconds since the Unix epoch when the run started.
    pub timestamp: u64,
    pub project_root: String,
    pub backend: String,
    pub total_endpoints: usize,
    pub affected_endpoints: Vec<ImpactFinding>,
    #[serde(default)]
    pub orphan_changes: Vec<OrphanChange>,
    pub total_files_changed: usize,
    pub source_files_changed: usize,
    pub duration_ms: f64,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl AnalysisReport {
    pub fn affected_count(&self) -> usize {
        self.affected_endpoints.len()
    }

    pub fn high_confidence_count(&self) -> usize {
        self.by_confidence(Confidence::High).len()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn by_confidence(&self, level: Confidence) -> Vec<&ImpactFinding> {
        self.affected_endpoints
            .iter()
            .filter(|finding| finding.confidence == level)
            .collect()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphan_changes.len()
    }

    pub fn total_orphan_lines(&self) -> usize {
        self.orphan_changes.iter().map(OrphanChange::total_lines).sum()
    }
}

// ---------------------------------------------------------------------------
// 5. Progress
// ---------------------------------------------------------------------------

/// Milestones reported synchronously on the analysis thread.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Stage { percent: u8, message: String },
    EntryPointTraced { id: String, done: usize, total: usize },
    FileEvaluated { path: String, done: usize, total: usize },
    /// Per call site; only emitted when fine-grained progress is enabled.
    CallResolved { entry: String, file: String, line: i64, target: String },
}

impl ProgressEvent {
    pub fn stage(percent: u8, message: impl Into<String>) -> Self {
        ProgressEvent::Stage {
            percent: percent.min(100),
            message: message.into(),
        }
    }
}

/// Callback receiving [`ProgressEvent`]s; shared across tracing workers.
pub type ProgressCallback<'a> = &'a (dyn Fn(&ProgressEvent) + Sync);
