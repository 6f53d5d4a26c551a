//! Maps one changed file onto the entry points it affects.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, warn};

use crate::errors::ImpactResult;
use crate::indexer::pipeline::ProjectIndex;
use crate::models::{ChangedFile, Confidence, EntryPoint, ImpactFinding, TraceFrame};
use crate::query::backend::{group_lines, range_frame, ChangeContext, DependencyBackend};
use crate::query::registry::EntryPointRegistry;
use crate::store::cache::DependencyMap;

pub struct ImpactMapper<'a> {
    registry: &'a EntryPointRegistry,
    index: &'a ProjectIndex,
    backend: &'a dyn DependencyBackend,
    dependencies: &'a DependencyMap,
    fallback: Option<&'a dyn DependencyBackend>,
    context_window: i64,
    max_traces: usize,
}

impl<'a> ImpactMapper<'a> {
    pub fn new(
        registry: &'a EntryPointRegistry,
        index: &'a ProjectIndex,
        backend: &'a dyn DependencyBackend,
        dependencies: &'a DependencyMap,
    ) -> Self {
        Self {
            registry,
            index,
            backend,
            dependencies,
            fallback: None,
            context_window: 3,
            max_traces: 8,
        }
    }

    /// Backend consulted for the rest of a file once the primary backend
    /// reports it cannot judge that file.
    pub fn with_fallback(mut self, fallback: &'a dyn DependencyBackend) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_context_window(mut self, window: i64) -> Self {
        self.context_window = window.max(0);
        self
    }

    pub fn with_trace_cap(mut self, cap: usize) -> Self {
        self.max_traces = cap.max(1);
        self
    }

    /// HIGH finding when the changed lines touch the handler itself.
    pub fn direct_hit(&self, entry: &EntryPoint, change: &ChangeContext<'_>) -> Option<ImpactFinding> {
        let handler = &entry.handler;
        let end = handler.effective_end();
        if end < handler.start_line {
            return None;
        }
        let touched: BTreeSet<i64> = change
            .changed
            .range(handler.start_line..=end)
            .copied()
            .collect();
        if touched.is_empty() {
            return None;
        }
        let mut finding = ImpactFinding::new(
            entry.clone(),
            Confidence::High,
            format!("Handler function directly modified in {}", change.path),
        );
        let origin = TraceFrame::origin(entry, &handler.file, handler.start_line);
        finding.traces = group_lines(&touched)
            .into_iter()
            .take(self.max_traces)
            .map(|(start, end)| {
                vec![
                    origin.clone(),
                    range_frame(self.index, &handler.file, &handler.symbol, start, end),
                ]
            })
            .collect();
        finding.dependency_chain = vec![change.path.clone()];
        finding.changed_files = vec![change.path.clone()];
        Some(finding)
    }

    /// Findings for one changed file, at most one per entry point. Direct
    /// handler edits are checked first and take precedence.
    pub fn map(&self, file: &ChangedFile) -> ImpactResult<Vec<ImpactFinding>> {
        let change = ChangeContext::new(file, self.context_window);
        let mut findings = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for entry in self.registry.by_file(&change.path) {
            if let Some(finding) = self.direct_hit(entry, &change) {
                seen.insert(entry.id());
                findings.push(finding);
            }
        }

        let mut active = self.backend;
        let mut fell_back = false;
        for entry in self.registry.iter() {
            let id = entry.id();
            if seen.contains(&id) {
                continue;
            }
            let deps = if fell_back { None } else { self.dependencies.get(&id) };
            let outcome = match active.assess(entry, deps, &change) {
                Ok(outcome) => outcome,
                Err(err) => match self.fallback.filter(|_| !fell_back) {
                    Some(fallback) => {
                        warn!(
                            file = %change.path,
                            from = active.kind().as_str(),
                            to = fallback.kind().as_str(),
                            error = %err,
                            "backend cannot judge file, falling back"
                        );
                        active = fallback;
                        fell_back = true;
                        fallback.assess(entry, None, &change)?
                    }
                    None => return Err(err),
                },
            };
            if let Some(finding) = outcome {
                seen.insert(id);
                findings.push(finding);
            }
        }
        debug!(file = %change.path, findings = findings.len(), "changed file evaluated");
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::config::AnalyzerConfig;
    use crate::indexer::semantic::LocalInference;
    use crate::models::{ChangeKind, DiffHunk, HandlerLocation, HttpMethod};
    use crate::query::backend::{CoverageBackend, ImportBackend, SymbolBackend};

    const USERS: &str = concat!(
        "from services.accounts import load_account\n",
        "\n",
        "\n",
        "def read_user(user_id):\n",
        "    account = load_account(user_id)\n",
        "    return account\n",
    );
    const ACCOUNTS: &str = concat!(
        "def load_account(user_id):\n",
        "    return {'id': user_id}\n",
        "\n",
        "\n",
        "\n",
        "\n",
        "\n",
        "\n",
        "\n",
        "def archive():\n",
        "    return None\n",
    );

    fn index() -> ProjectIndex {
        ProjectIndex::from_sources(
            Path::new("/p"),
            [
                ("api/users.py", USERS),
                ("services/accounts.py", ACCOUNTS),
                ("scripts/seed.py", "def seed():\n    return 1\n"),
            ],
        )
    }

    fn registry() -> EntryPointRegistry {
        EntryPointRegistry::from_entries([EntryPoint::new(
            "/users/{id}",
            [HttpMethod::Get],
            HandlerLocation::new("api/users.py", "api.users", "read_user", 4).with_end_line(6),
        )])
    }

    fn change(path: &str, line: i64) -> ChangedFile {
        ChangedFile::new(path, ChangeKind::Modified)
            .with_hunk(DiffHunk::new(line, 1, line, 1).with_added([line]))
    }

    fn traced(registry: &EntryPointRegistry, backend: &dyn DependencyBackend) -> DependencyMap {
        registry.iter().map(|e| (e.id(), backend.resolve(e, None))).collect()
    }

    #[test]
    fn test_direct_handler_edit_is_high() {
        let index = index();
        let registry = registry();
        let oracle = LocalInference::new();
        let backend = SymbolBackend::new(&index, &oracle, &AnalyzerConfig::default());
        let deps = traced(&registry, &backend);
        let mapper = ImpactMapper::new(&registry, &index, &backend, &deps);

        let findings = mapper.map(&change("/abs/checkout/api/users.py", 5)).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].confidence, Confidence::High);
        assert!(findings[0].reason.contains("api/users.py"));
        let frame = findings[0].traces[0].last().unwrap();
        assert!(frame.snippet.as_deref().unwrap().starts_with("[lines 5-5]"));
    }

    #[test]
    fn test_context_window_boundary() {
        let index = index();
        let registry = registry();
        let oracle = LocalInference::new();
        let backend = SymbolBackend::new(&index, &oracle, &AnalyzerConfig::default());
        let deps = traced(&registry, &backend);
        let mapper = ImpactMapper::new(&registry, &index, &backend, &deps);

        // load_account covers lines 1-2; line 5 is three away, line 6 four.
        let near = mapper.map(&change("services/accounts.py", 5)).unwrap();
        assert_eq!(near.len(), 1);
        assert_eq!(near[0].confidence, Confidence::Medium);
        assert!(near[0].reason.ends_with("(lines [2])"));
        assert!(mapper.map(&change("services/accounts.py", 6)).unwrap().is_empty());

        let wide = ImpactMapper::new(&registry, &index, &backend, &deps).with_context_window(4);
        assert_eq!(wide.map(&change("services/accounts.py", 6)).unwrap().len(), 1);
    }

    #[test]
    fn test_import_backend_falls_back_to_coverage() {
        let index = index();
        let registry = registry();
        let config = AnalyzerConfig::default();
        let imports = ImportBackend::new(&index, &config);
        let coverage = CoverageBackend::new(&index, &config);
        let deps = DependencyMap::new();

        let strict = ImpactMapper::new(&registry, &index, &imports, &deps);
        assert!(strict.map(&change("notes/readme.py", 1)).is_err());

        let lenient = ImpactMapper::new(&registry, &index, &imports, &deps).with_fallback(&coverage);
        assert!(lenient.map(&change("notes/readme.py", 1)).unwrap().is_empty());
        assert!(lenient.map(&change("scripts/seed.py", 1)).unwrap().is_empty());
        let found = lenient.map(&change("services/accounts.py", 11)).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].reason.starts_with("Handler imports services.accounts"));
    }
}
