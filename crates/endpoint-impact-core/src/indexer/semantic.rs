//! Receiver type inference for member-call resolution.
//!
//! The tracer only needs one question answered: "what nominal class does this
//! expression evaluate to". [`LocalInference`] answers it from annotations and
//! simple assignments; [`SidecarHints`] answers it from JSON hints written by
//! an external checker. Both sit behind [`TypeOracle`].

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use regex::Regex;
use tracing::debug;

use crate::indexer::filesystem::normalize_path;
use crate::indexer::pipeline::{ModuleInfo, ProjectIndex, Target};
use crate::indexer::symbols::{Expr, ModuleVariable, SymbolDef, SymbolKind};
use crate::query::guards::MAX_INFERENCE_DEPTH;

/// Environment variable naming a project-wide hints file.
pub const HINTS_FILE_ENV: &str = "ENDPOINT_IMPACT_SEMANTIC_HINTS_FILE";

/// An expression seen at `line` inside `scope`.
#[derive(Clone, Copy, Debug)]
pub struct TypeQuery<'a> {
    pub scope: &'a SymbolDef,
    pub line: i64,
    pub expr: &'a Expr,
}

pub trait TypeOracle: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fully-qualified name of the project class `query.expr` evaluates to.
    fn infer(&self, index: &ProjectIndex, query: &TypeQuery<'_>) -> Option<String>;
}

// ---------------------------------------------------------------------------
// Annotation text
// ---------------------------------------------------------------------------

static WRAPPER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:typing\.|t\.)?(Optional|Annotated|Union|Final|ClassVar)\[(.*)\]$").unwrap()
});
static DOTTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*$").unwrap());

fn split_top_level(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '[' | '(' => depth += 1,
            ']' | ')' => depth -= 1,
            c if c == separator && depth == 0 => {
                parts.push(text[start..i].trim());
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(text[start..].trim());
    parts
}

fn single_non_none<'t>(members: &[&'t str]) -> Option<&'t str> {
    let rest: Vec<&str> = members
        .iter()
        .copied()
        .filter(|m| !m.is_empty() && *m != "None")
        .collect();
    match rest.as_slice() {
        [only] => Some(only),
        _ => None,
    }
}

/// Reduce annotation text to the dotted name of its nominal type.
///
/// Unwraps quotes, `Optional[X]`, `X | None`, `Union[X, None]`,
/// `Annotated[X, ...]`, `Final[X]`, and drops generic arguments.
pub fn normalize_annotation(raw: &str) -> Option<String> {
    let mut text = raw.trim();
    for _ in 0..MAX_INFERENCE_DEPTH {
        let unquoted = text.trim_matches(|c| c == '"' || c == '\'').trim();
        if unquoted != text {
            text = unquoted;
            continue;
        }
        let union = split_top_level(text, '|');
        if union.len() > 1 {
            text = single_non_none(&union)?;
            continue;
        }
        if let Some(caps) = WRAPPER_RE.captures(text) {
            let wrapper = caps.get(1).map_or("", |m| m.as_str());
            let inner = caps.get(2).map_or("", |m| m.as_str());
            let args = split_top_level(inner, ',');
            text = match wrapper {
                "Union" => single_non_none(&args)?,
                _ => args.first().copied()?,
            };
            continue;
        }
        break;
    }
    let head = text.split('[').next().unwrap_or(text).trim();
    (DOTTED_RE.is_match(head) && head != "None").then(|| head.to_string())
}

// ---------------------------------------------------------------------------
// Local inference
// ---------------------------------------------------------------------------

/// Where a name is looked up.
#[derive(Clone, Copy)]
enum Site<'a> {
    Scope(&'a SymbolDef),
    Module(&'a str),
}

impl<'a> Site<'a> {
    fn resolve(self, index: &'a ProjectIndex, dotted: &str) -> Option<Target<'a>> {
        match self {
            Site::Scope(scope) => index.resolve_in_scope(scope, dotted),
            Site::Module(module) => index.resolve_in_module(module, dotted),
        }
    }
}

type InferenceKey = (String, i64, String);

/// Lightweight, annotation-driven inference over the project index.
#[derive(Default)]
pub struct LocalInference {
    cache: RwLock<HashMap<InferenceKey, Option<String>>>,
}

impl LocalInference {
    pub fn new() -> Self {
        Self::default()
    }

    fn annotation_class(&self, index: &ProjectIndex, site: Site<'_>, annotation: &str) -> Option<String> {
        let name = normalize_annotation(annotation)?;
        match site.resolve(index, &name)? {
            Target::Symbol(symbol) if symbol.is_class() => Some(symbol.fqn.clone()),
            _ => None,
        }
    }

    fn return_class(&self, index: &ProjectIndex, function: &SymbolDef) -> Option<String> {
        let annotation = function.return_annotation.as_deref()?;
        self.annotation_class(index, Site::Scope(function), annotation)
    }

    /// Type produced by calling whatever `target` names.
    fn call_target_class(&self, index: &ProjectIndex, target: Target<'_>) -> Option<String> {
        match target {
            Target::Symbol(symbol) if symbol.is_class() => Some(symbol.fqn.clone()),
            Target::Symbol(symbol) => self.return_class(index, symbol),
            _ => None,
        }
    }

    fn variable_class(&self, index: &ProjectIndex, module: &ModuleInfo, variable: &ModuleVariable, depth: usize) -> Option<String> {
        if depth > MAX_INFERENCE_DEPTH {
            return None;
        }
        let site = Site::Module(&module.name);
        if let Some(annotation) = variable.annotation.as_deref() {
            if let Some(class) = self.annotation_class(index, site, annotation) {
                return Some(class);
            }
        }
        match variable.value.as_ref()? {
            Expr::Call { func } => {
                let dotted = func.dotted()?;
                self.call_target_class(index, site.resolve(index, &dotted)?)
            }
            value => {
                let dotted = value.dotted()?;
                match site.resolve(index, &dotted)? {
                    Target::Variable(m, v) if v.name != variable.name || m.name != module.name => {
                        self.variable_class(index, m, v, depth + 1)
                    }
                    _ => None,
                }
            }
        }
    }

    /// Type of `attr` read from an instance of `class`.
    fn attribute_class(&self, index: &ProjectIndex, class: &SymbolDef, attr: &str, depth: usize) -> Option<String> {
        if depth > MAX_INFERENCE_DEPTH {
            return None;
        }
        if let Some((owner, attribute)) = index.class_attribute(class, attr) {
            let site = match attribute.scope.as_deref().and_then(|s| index.symbol(s)) {
                Some(method) => Site::Scope(method),
                None => Site::Module(&owner.module),
            };
            if let Some(annotation) = attribute.annotation.as_deref() {
                if let Some(found) = self.annotation_class(index, site, annotation) {
                    return Some(found);
                }
            }
            if let Some(value) = attribute.value.as_ref() {
                let found = match site {
                    Site::Scope(method) => self.infer_expr(index, method, attribute.start_line, value, depth + 1),
                    Site::Module(module) => value
                        .dotted()
                        .or_else(|| match value {
                            Expr::Call { func } => func.dotted(),
                            _ => None,
                        })
                        .and_then(|d| index.resolve_in_module(module, &d))
                        .and_then(|t| self.call_target_class(index, t)),
                };
                if found.is_some() {
                    return found;
                }
            }
        }
        // Properties and other zero-argument accessors.
        let member = index.lookup_member(class, attr)?;
        (member.kind == SymbolKind::Method).then(|| self.return_class(index, member)).flatten()
    }

    fn enclosing_class<'a>(&self, index: &'a ProjectIndex, scope: &'a SymbolDef) -> Option<&'a SymbolDef> {
        let mut current = Some(scope);
        while let Some(frame) = current {
            if let Some(owner) = frame.owner_class() {
                return index.symbol(owner);
            }
            current = frame.parent.as_deref().and_then(|p| index.symbol(p));
        }
        None
    }

    fn name_class(&self, index: &ProjectIndex, scope: &SymbolDef, line: i64, name: &str, depth: usize) -> Option<String> {
        if name == "self" || name == "cls" {
            return self.enclosing_class(index, scope).map(|c| c.fqn.clone());
        }
        let mut current = Some(scope);
        while let Some(frame) = current {
            if frame.kind != SymbolKind::Class {
                let at = if std::ptr::eq(frame, scope) { line } else { frame.end_line };
                if let Some(binding) = frame.local(name, at) {
                    if let Some(annotation) = binding.annotation.as_deref() {
                        if let Some(class) = self.annotation_class(index, Site::Scope(frame), annotation) {
                            return Some(class);
                        }
                    }
                    if let Some(value) = binding.value.as_ref() {
                        if let Some(class) = self.infer_expr(index, frame, binding.line, value, depth + 1) {
                            return Some(class);
                        }
                    }
                }
                if let Some(annotation) = frame.parameter(name).and_then(|p| p.annotation.as_deref()) {
                    return self.annotation_class(index, Site::Scope(frame), annotation);
                }
            }
            current = frame.parent.as_deref().and_then(|p| index.symbol(p));
        }
        match index.resolve_in_module(&scope.module, name)? {
            Target::Variable(module, variable) => self.variable_class(index, module, variable, depth + 1),
            _ => None,
        }
    }

    fn infer_expr(&self, index: &ProjectIndex, scope: &SymbolDef, line: i64, expr: &Expr, depth: usize) -> Option<String> {
        if depth > MAX_INFERENCE_DEPTH {
            return None;
        }
        match expr {
            Expr::Name(name) => self.name_class(index, scope, line, name, depth),
            Expr::Attribute { object, attr } => {
                if let Some(owner) = self.infer_expr(index, scope, line, object, depth + 1) {
                    if let Some(class) = index.symbol(&owner) {
                        return self.attribute_class(index, class, attr, depth + 1);
                    }
                }
                match index.resolve_in_scope(scope, &expr.dotted()?)? {
                    Target::Variable(module, variable) => self.variable_class(index, module, variable, depth + 1),
                    _ => None,
                }
            }
            Expr::Call { func } => {
                if let Some(dotted) = func.dotted() {
                    if let Some(target) = index.resolve_in_scope(scope, &dotted) {
                        if let Some(class) = self.call_target_class(index, target) {
                            return Some(class);
                        }
                    }
                }
                let Expr::Attribute { object, attr } = func.as_ref() else {
                    return None;
                };
                let owner = self.infer_expr(index, scope, line, object, depth + 1)?;
                let member = index.lookup_member(index.symbol(&owner)?, attr)?;
                self.call_target_class(index, Target::Symbol(member))
            }
            Expr::Other => None,
        }
    }
}

impl TypeOracle for LocalInference {
    fn name(&self) -> &'static str {
        "local"
    }

    fn infer(&self, index: &ProjectIndex, query: &TypeQuery<'_>) -> Option<String> {
        let key = (query.scope.fqn.clone(), query.line, query.expr.render());
        if let Some(cached) = self.cache.read().get(&key) {
            return cached.clone();
        }
        let inferred = self.infer_expr(index, query.scope, query.line, query.expr, 0);
        self.cache.write().insert(key, inferred.clone());
        inferred
    }
}

// ---------------------------------------------------------------------------
// Sidecar hints
// ---------------------------------------------------------------------------

type HintMap = HashMap<(i64, String), BTreeSet<String>>;

/// Receiver hints produced by an external type checker.
///
/// Per-file hints live at `<state_dir>/semantic/<relative path>.hints.json`;
/// a project-wide file named by [`HINTS_FILE_ENV`] holds a `files` map of the
/// same payloads.
pub struct SidecarHints {
    semantic_dir: PathBuf,
    global: Option<serde_json::Value>,
    loaded: RwLock<HashMap<String, Arc<HintMap>>>,
}

impl SidecarHints {
    pub fn new(state_dir: &Path) -> Self {
        let global = std::env::var(HINTS_FILE_ENV)
            .ok()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .and_then(|p| load_json(Path::new(&p)));
        Self {
            semantic_dir: state_dir.join("semantic"),
            global,
            loaded: RwLock::new(HashMap::new()),
        }
    }

    fn hints_for(&self, relative_path: &str) -> Arc<HintMap> {
        if let Some(hints) = self.loaded.read().get(relative_path) {
            return Arc::clone(hints);
        }
        let hints = Arc::new(self.load_receiver_type_hints(relative_path));
        self.loaded
            .write()
            .insert(relative_path.to_string(), Arc::clone(&hints));
        hints
    }

    fn load_receiver_type_hints(&self, relative_path: &str) -> HintMap {
        let mut hints = HintMap::new();
        let normalized = normalize_path(relative_path);

        let sidecar = self.semantic_dir.join(format!("{normalized}.hints.json"));
        if let Some(payload) = load_json(&sidecar) {
            merge_hint_maps(&mut hints, parse_hint_payload(&payload));
        }

        if let Some(files) = self
            .global
            .as_ref()
            .and_then(|g| g.get("files"))
            .and_then(|v| v.as_object())
        {
            if let Some(payload) = files.get(&normalized).or_else(|| files.get(relative_path)) {
                merge_hint_maps(&mut hints, parse_hint_payload(payload));
            }
        }
        if !hints.is_empty() {
            debug!(path = %normalized, hints = hints.len(), "loaded receiver hints");
        }
        hints
    }
}

fn load_json(path: &Path) -> Option<serde_json::Value> {
    if !path.exists() {
        return None;
    }
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn parse_hint_payload(payload: &serde_json::Value) -> HintMap {
    let mut hints = HintMap::new();
    let Some(entries) = payload.get("receiver_hints").and_then(|v| v.as_array()) else {
        return hints;
    };
    for item in entries {
        let Some(obj) = item.as_object() else {
            continue;
        };
        let text = |key: &str| {
            obj.get(key)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string()
        };
        let receiver = text("receiver");
        let owner_type = text("owner_type");
        if receiver.is_empty() || owner_type.is_empty() {
            continue;
        }
        let line = obj.get("line").and_then(|v| v.as_i64());
        let start = obj
            .get("line_start")
            .and_then(|v| v.as_i64())
            .or(line)
            .unwrap_or(1)
            .max(1);
        let end = obj
            .get("line_end")
            .and_then(|v| v.as_i64())
            .unwrap_or(start)
            .max(start);
        for line_num in start..=end.min(start + 512) {
            hints
                .entry((line_num, receiver.clone()))
                .or_default()
                .insert(owner_type.clone());
        }
    }
    hints
}

fn merge_hint_maps(target: &mut HintMap, source: HintMap) {
    for (key, values) in source {
        target.entry(key).or_default().extend(values);
    }
}

impl TypeOracle for SidecarHints {
    fn name(&self) -> &'static str {
        "sidecar"
    }

    fn infer(&self, index: &ProjectIndex, query: &TypeQuery<'_>) -> Option<String> {
        let hints = self.hints_for(&query.scope.file);
        let owners = hints.get(&(query.line, query.expr.render()))?;
        owners.iter().find_map(|owner| match index.resolve(owner) {
            Some(Target::Symbol(symbol)) if symbol.is_class() => Some(symbol.fqn.clone()),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

/// Asks each oracle in order; the first answer wins.
#[derive(Default)]
pub struct ChainedOracle {
    oracles: Vec<Box<dyn TypeOracle>>,
}

impl ChainedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, oracle: impl TypeOracle + 'static) -> Self {
        self.oracles.push(Box::new(oracle));
        self
    }

    /// External hints first, then local inference.
    pub fn standard(state_dir: &Path) -> Self {
        Self::new()
            .with(SidecarHints::new(state_dir))
            .with(LocalInference::new())
    }
}

impl TypeOracle for ChainedOracle {
    fn name(&self) -> &'static str {
        "chained"
    }

    fn infer(&self, index: &ProjectIndex, query: &TypeQuery<'_>) -> Option<String> {
        self.oracles.iter().find_map(|oracle| oracle.infer(index, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> ProjectIndex {
        ProjectIndex::from_sources(
            Path::new("/p"),
            [
                (
                    "app/repo.py",
                    "class Repo:\n    def get(self):\n        return 1\n\nclass Session:\n    def repo(self) -> 'Repo':\n        return Repo()\n",
                ),
                (
                    "app/service.py",
                    concat!(
                        "from typing import Optional\n",
                        "from app.repo import Repo, Session\n",
                        "\n",
                        "default_repo = Repo()\n",
                        "\n",
                        "class Service:\n",
                        "    session: Session\n",
                        "\n",
                        "    def __init__(self, repo: Optional[Repo] = None):\n",
                        "        self.repo = repo\n",
                        "\n",
                        "    def run(self, other: 'Repo | None'):\n",
                        "        local = Repo()\n",
                        "        made = self.session.repo()\n",
                        "        return self.repo.get()\n",
                        "\n",
                        "def make() -> Service:\n",
                        "    return Service()\n",
                    ),
                ),
            ],
        )
    }

    fn infer(index: &ProjectIndex, scope: &str, line: i64, expr: &str) -> Option<String> {
        let scope = index.symbol(scope).unwrap();
        let expr = Expr::from_dotted(expr);
        LocalInference::new().infer(index, &TypeQuery { scope, line, expr: &expr })
    }

    #[test]
    fn test_normalize_annotation() {
        assert_eq!(normalize_annotation("Optional[Repo]").as_deref(), Some("Repo"));
        assert_eq!(normalize_annotation("'Repo | None'").as_deref(), Some("Repo"));
        assert_eq!(
            normalize_annotation("Annotated[app.Repo, Depends(get_repo)]").as_deref(),
            Some("app.Repo")
        );
        assert_eq!(normalize_annotation("Union[None, Repo]").as_deref(), Some("Repo"));
        assert_eq!(normalize_annotation("list[Repo]").as_deref(), Some("list"));
        assert_eq!(normalize_annotation("Repo | Session"), None);
        assert_eq!(normalize_annotation("None"), None);
    }

    #[test]
    fn test_local_inference_sources() {
        let index = index();
        let run = "app.service.Service.run";
        assert_eq!(infer(&index, run, 15, "self").as_deref(), Some("app.service.Service"));
        assert_eq!(infer(&index, run, 15, "self.repo").as_deref(), Some("app.repo.Repo"));
        assert_eq!(infer(&index, run, 15, "local").as_deref(), Some("app.repo.Repo"));
        assert_eq!(infer(&index, run, 15, "other").as_deref(), Some("app.repo.Repo"));
        assert_eq!(infer(&index, run, 15, "made").as_deref(), Some("app.repo.Repo"));
        assert_eq!(infer(&index, run, 15, "default_repo").as_deref(), Some("app.repo.Repo"));
        assert_eq!(infer(&index, run, 15, "unknown"), None);
    }

    #[test]
    fn test_call_results_use_return_annotations() {
        let index = index();
        let scope = index.symbol("app.service.make").unwrap();
        let call = Expr::Call {
            func: Box::new(Expr::name("make")),
        };
        let inferred = LocalInference::new().infer(&index, &TypeQuery { scope, line: 18, expr: &call });
        assert_eq!(inferred.as_deref(), Some("app.service.Service"));
    }

    #[test]
    fn test_sidecar_hints_and_chain() {
        let dir = tempfile::tempdir().unwrap();
        let semantic = dir.path().join("semantic/app");
        std::fs::create_dir_all(&semantic).unwrap();
        std::fs::write(
            semantic.join("service.py.hints.json"),
            r#"{"receiver_hints":[{"receiver":"mystery","owner_type":"app.repo.Session","line_start":14,"line_end":15}]}"#,
        )
        .unwrap();
        let index = index();
        let scope = index.symbol("app.service.Service.run").unwrap();
        let expr = Expr::name("mystery");
        let query = TypeQuery { scope, line: 15, expr: &expr };
        let hints = SidecarHints::new(dir.path());
        assert_eq!(hints.infer(&index, &query).as_deref(), Some("app.repo.Session"));

        let chain = ChainedOracle::standard(dir.path());
        assert_eq!(chain.infer(&index, &query).as_deref(), Some("app.repo.Session"));
        let self_expr = Expr::name("self");
        let fallback = TypeQuery { scope, line: 15, expr: &self_expr };
        assert_eq!(chain.infer(&index, &fallback).as_deref(), Some("app.service.Service"));
    }
}
