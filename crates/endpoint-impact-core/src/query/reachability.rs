//! Coarse file reachability: which project files a handler touches through
//! its module's imports, without type-directed member resolution.

use std::collections::HashMap;

use tracing::debug;

use crate::indexer::pipeline::{ModuleInfo, ProjectIndex, Target};
use crate::indexer::semantic::normalize_annotation;
use crate::indexer::symbols::{Expr, SymbolDef};
use crate::models::{EntryPoint, EntryPointDependencies, SymbolReference, Trace, TraceFrame};

pub struct CoarseReachability<'a> {
    index: &'a ProjectIndex,
    max_traces_per_file: usize,
}

fn root_name(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Name(name) => Some(name),
        Expr::Attribute { object, .. } => root_name(object),
        Expr::Call { func } => root_name(func),
        Expr::Other => None,
    }
}

impl<'a> CoarseReachability<'a> {
    pub fn new(index: &'a ProjectIndex) -> Self {
        Self {
            index,
            max_traces_per_file: 1,
        }
    }

    pub fn with_trace_cap(mut self, cap: usize) -> Self {
        self.max_traces_per_file = cap.max(1);
        self
    }

    /// Project module each import binding of `module` lands in.
    fn import_targets(&self, module: &ModuleInfo) -> HashMap<String, &'a ModuleInfo> {
        module
            .bindings
            .iter()
            .filter_map(|(local, target)| {
                let landed = match self.index.resolve(target)? {
                    Target::Symbol(symbol) => self.index.module(&symbol.module)?,
                    Target::Module(module) => module,
                    Target::Variable(module, _) => module,
                };
                Some((local.clone(), landed))
            })
            .collect()
    }

    /// Parameter names typed with an imported name map to the same file.
    fn parameter_targets(&self, handler: &SymbolDef, imports: &mut HashMap<String, &'a ModuleInfo>) {
        for parameter in &handler.parameters {
            let Some(type_name) = parameter.annotation.as_deref().and_then(normalize_annotation) else {
                continue;
            };
            let head = type_name.split('.').next().unwrap_or(&type_name);
            if let Some(module) = imports.get(head).copied() {
                imports.insert(parameter.name.clone(), module);
            }
        }
    }

    pub fn trace(&self, entry: &EntryPoint) -> EntryPointDependencies {
        let mut deps = EntryPointDependencies::new();
        let Some(handler) = self.index.find_handler(&entry.handler) else {
            deps.add_symbol_reference(SymbolReference::new(
                &entry.handler.file,
                &entry.handler.symbol,
                entry.handler.start_line,
                entry.handler.effective_end(),
            ));
            return deps;
        };
        deps.add_symbol_reference(handler.reference());
        let origin: Trace = vec![TraceFrame::origin(entry, &handler.file, handler.def_line)];
        deps.add_trace(&handler.file, origin.clone(), self.max_traces_per_file);

        let Some(module) = self.index.module(&handler.module) else {
            return deps;
        };
        let mut targets = self.import_targets(module);
        self.parameter_targets(handler, &mut targets);

        let sites = handler
            .calls
            .iter()
            .map(|c| (c.line, &c.callee))
            .chain(handler.name_uses.iter().map(|u| (u.line, &u.expr)));
        for (line, expr) in sites {
            let Some(target) = root_name(expr).and_then(|name| targets.get(name)) else {
                continue;
            };
            if target.path == handler.file {
                continue;
            }
            let reference = SymbolReference::new(&target.path, &target.name, 1, target.line_count().max(1));
            deps.add_symbol_lines(reference, target.executable_lines.iter().copied());
            let mut trace = origin.clone();
            trace.push(TraceFrame::new(
                &handler.file,
                line,
                &handler.qualified_name,
                module.line_text(line).map(|t| t.trim().to_string()),
            ));
            trace.push(TraceFrame::new(&target.path, 1, &target.name, None));
            deps.add_trace(&target.path, trace, self.max_traces_per_file);
        }
        debug!(entry = %entry.id(), files = deps.referenced_files.len(), "coarse reachability traced");
        deps
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::models::{HandlerLocation, HttpMethod};

    fn index() -> ProjectIndex {
        ProjectIndex::from_sources(
            Path::new("/p"),
            [
                ("services/__init__.py", ""),
                (
                    "services/user_service.py",
                    "# users\nclass UserService:\n\n    def get(self):\n        return 1\n",
                ),
                ("utils/helpers.py", "def slug():\n    return 's'\n"),
                ("utils/unused.py", "def nope():\n    return 0\n"),
                (
                    "routers/users.py",
                    concat!(
                        "from services.user_service import UserService\n",
                        "from utils import helpers\n",
                        "import utils.unused\n",
                        "\n",
                        "def read(service: Optional[UserService]):\n",
                        "    service.get()\n",
                        "    return helpers.slug()\n",
                    ),
                ),
            ],
        )
    }

    fn entry(symbol: &str, line: i64) -> EntryPoint {
        EntryPoint::new(
            "/users",
            [HttpMethod::Get],
            HandlerLocation::new("routers/users.py", "routers.users", symbol, line),
        )
    }

    #[test]
    fn test_marks_whole_files_reached_through_imports() {
        let index = index();
        let deps = CoarseReachability::new(&index).trace(&entry("read", 5));
        let service = deps.lines_for("services/user_service.py").unwrap();
        assert_eq!(service.iter().copied().collect::<Vec<_>>(), vec![2, 4, 5]);
        assert!(deps.references_file("utils/helpers.py"));
        assert!(!deps.references_file("utils/unused.py"));
        let trace = deps.primary_trace("utils/helpers.py").unwrap();
        assert_eq!(trace.len(), 3);
        assert_eq!(trace[1].line, 7);
    }

    #[test]
    fn test_missing_handler_falls_back_to_declared_range() {
        let index = index();
        let deps = CoarseReachability::new(&index).trace(&entry("missing", 5));
        assert_eq!(deps.lines_for("routers/users.py").unwrap().len(), 51);
    }
}
