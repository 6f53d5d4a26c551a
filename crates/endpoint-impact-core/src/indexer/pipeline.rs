//! Project index construction with Rayon-based parallelism, plus the name
//! resolution the tracer and backends run against.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Instant;

use indexmap::IndexMap;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::config::AnalyzerConfig;
use crate::errors::ImpactResult;
use crate::indexer::filesystem::{
    content_digest, iter_python_files, normalize_path, project_fingerprint, relative_path,
    same_source_file,
};
use crate::indexer::imports::{module_name_for_path, prefix_splits, resolve_module_file};
use crate::indexer::symbols::{
    extract_module, ClassAttribute, ExtractedModule, ImportRecord, ModuleVariable, SymbolDef,
    SymbolKind,
};
use crate::models::HandlerLocation;
use crate::query::guards::{MAX_MRO_DEPTH, MAX_RESOLUTION_HOPS};

/// One indexed source file.
#[derive(Clone, Debug)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub is_package: bool,
    pub content_hash: String,
    /// Fully-qualified names of every definition in the file, in source order.
    pub symbols: Vec<String>,
    pub variables: IndexMap<String, ModuleVariable>,
    /// Local name to absolute dotted target.
    pub bindings: HashMap<String, String>,
    pub star_imports: Vec<String>,
    pub imports: Vec<ImportRecord>,
    pub lines: Vec<String>,
    pub executable_lines: BTreeSet<i64>,
}

impl ModuleInfo {
    pub fn line_text(&self, line: i64) -> Option<&str> {
        if line < 1 {
            return None;
        }
        self.lines.get((line - 1) as usize).map(String::as_str)
    }

    pub fn line_count(&self) -> i64 {
        self.lines.len() as i64
    }
}

/// What a dotted name resolves to.
#[derive(Clone, Copy, Debug)]
pub enum Target<'a> {
    Symbol(&'a SymbolDef),
    Module(&'a ModuleInfo),
    Variable(&'a ModuleInfo, &'a ModuleVariable),
}

/// Explicitly owned replacement for process-wide module maps: every module,
/// definition, and import binding of one project.
#[derive(Debug)]
pub struct ProjectIndex {
    root: PathBuf,
    canonical_root: Option<PathBuf>,
    root_package: Option<String>,
    modules: IndexMap<String, ModuleInfo>,
    files: HashMap<String, String>,
    symbols: HashMap<String, SymbolDef>,
    failed_files: Vec<String>,
    fingerprint: String,
}

type Extraction = Result<(ExtractedModule, String), String>;

struct Job {
    absolute: PathBuf,
    relative: String,
    module: String,
    is_package: bool,
}

fn extract_file_worker(job: &Job) -> Extraction {
    let source = std::fs::read_to_string(&job.absolute).map_err(|e| {
        debug!(path = %job.relative, error = %e, "unreadable source file");
        job.relative.clone()
    })?;
    extract_source(&job.relative, &job.module, job.is_package, &source)
}

fn extract_source(relative: &str, module: &str, is_package: bool, source: &str) -> Extraction {
    let hash = content_digest(source.as_bytes());
    match extract_module(source, relative, module, is_package) {
        Ok(extracted) => Ok((extracted, hash)),
        Err(e) => {
            debug!(path = %relative, error = %e, "skipping unparsable source file");
            Err(relative.to_string())
        }
    }
}

fn parallel_extract(jobs: &[Job], parallel: bool) -> Vec<Extraction> {
    if jobs.is_empty() {
        return vec![];
    }
    if !parallel {
        return jobs.iter().map(extract_file_worker).collect();
    }
    let workers = std::thread::available_parallelism().map_or(1, |n| n.get());
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build();
    match pool {
        Ok(pool) => pool.install(|| jobs.par_iter().map(extract_file_worker).collect()),
        Err(_) => jobs.iter().map(extract_file_worker).collect(),
    }
}

/// Module name for a project-relative path, dropping a leading `src/` that is
/// not itself a package.
fn module_identity(relative: &str, src_is_package: bool) -> (String, bool) {
    let (name, is_package) = module_name_for_path(relative);
    if !src_is_package {
        if let Some(stripped) = name.strip_prefix("src.") {
            return (stripped.to_string(), is_package);
        }
        if name == "src" {
            return (String::new(), is_package);
        }
    }
    (name, is_package)
}

fn split_first(dotted: &str) -> (&str, Option<&str>) {
    match dotted.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (dotted, None),
    }
}

fn qualify(module: &str, name: &str) -> String {
    if module.is_empty() {
        name.to_string()
    } else {
        format!("{module}.{name}")
    }
}

impl ProjectIndex {
    /// Discover, read, and extract every Python file under `root`.
    pub fn build(root: &Path, config: &AnalyzerConfig) -> ImpactResult<Self> {
        let started = Instant::now();
        let paths = iter_python_files(root, &config.include_patterns, &config.exclude_patterns)?;
        let relatives: Vec<String> = paths.iter().map(|p| relative_path(root, p)).collect();
        let src_is_package = relatives.iter().any(|r| r == "src/__init__.py");
        let jobs: Vec<Job> = paths
            .into_iter()
            .zip(relatives)
            .map(|(absolute, relative)| {
                let (module, is_package) = module_identity(&relative, src_is_package);
                Job {
                    absolute,
                    relative,
                    module,
                    is_package,
                }
            })
            .collect();
        let extracted = parallel_extract(&jobs, config.parallel);
        let index = Self::assemble(root, extracted);
        info!(
            root = %root.display(),
            modules = index.modules.len(),
            symbols = index.symbols.len(),
            failed = index.failed_files.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "project index built"
        );
        Ok(index)
    }

    /// Build an index from in-memory `(relative path, source)` pairs.
    pub fn from_sources<P, S>(root: &Path, sources: impl IntoIterator<Item = (P, S)>) -> Self
    where
        P: AsRef<str>,
        S: AsRef<str>,
    {
        let sources: Vec<(String, S)> = sources
            .into_iter()
            .map(|(p, s)| (normalize_path(p.as_ref()), s))
            .collect();
        let src_is_package = sources.iter().any(|(p, _)| p == "src/__init__.py");
        let extracted = sources
            .iter()
            .map(|(relative, source)| {
                let (module, is_package) = module_identity(relative, src_is_package);
                extract_source(relative, &module, is_package, source.as_ref())
            })
            .collect();
        Self::assemble(root, extracted)
    }

    fn assemble(root: &Path, extracted: Vec<Extraction>) -> Self {
        let mut modules = IndexMap::new();
        let mut files = HashMap::new();
        let mut symbols = HashMap::new();
        let mut failed_files = Vec::new();

        for result in extracted {
            let (module, hash) = match result {
                Ok(pair) => pair,
                Err(path) => {
                    failed_files.push(path);
                    continue;
                }
            };
            let mut symbol_names = Vec::with_capacity(module.symbols.len());
            for symbol in module.symbols {
                // A redefinition replaces the earlier binding, as at runtime.
                if !symbol_names.contains(&symbol.fqn) {
                    symbol_names.push(symbol.fqn.clone());
                }
                symbols.insert(symbol.fqn.clone(), symbol);
            }
            let info = ModuleInfo {
                name: module.module.clone(),
                path: module.path.clone(),
                is_package: module.is_package,
                content_hash: hash,
                symbols: symbol_names,
                variables: module
                    .variables
                    .into_iter()
                    .map(|v| (v.name.clone(), v))
                    .collect(),
                bindings: module
                    .bindings
                    .into_iter()
                    .map(|b| (b.local, b.target))
                    .collect(),
                star_imports: module.star_imports,
                imports: module.imports,
                lines: module.lines,
                executable_lines: module.executable_lines,
            };
            files.insert(info.path.clone(), info.name.clone());
            modules.insert(info.name.clone(), info);
        }

        let fingerprint = project_fingerprint(
            modules
                .values()
                .map(|m| (m.path.as_str(), m.content_hash.as_str())),
        );
        let root_package = root
            .join("__init__.py")
            .is_file()
            .then(|| root.file_name().map(|n| n.to_string_lossy().to_string()))
            .flatten();

        Self {
            root: root.to_path_buf(),
            canonical_root: std::fs::canonicalize(root).ok(),
            root_package,
            modules,
            files,
            symbols,
            failed_files,
            fingerprint,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Digest of every indexed file's path and content.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn failed_files(&self) -> &[String] {
        &self.failed_files
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modules.values()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    pub fn symbol(&self, fqn: &str) -> Option<&SymbolDef> {
        self.symbols.get(fqn)
    }

    fn strip_root_package<'n>(&self, name: &'n str) -> Option<&'n str> {
        let package = self.root_package.as_deref()?;
        name.strip_prefix(package)?.strip_prefix('.')
    }

    /// Canonical spelling of a module name, accepting names qualified with
    /// the project directory's own package.
    pub fn canonical_module<'n>(&self, name: &'n str) -> Option<&'n str> {
        if self.modules.contains_key(name) {
            return Some(name);
        }
        self.strip_root_package(name)
            .filter(|stripped| self.modules.contains_key(*stripped))
    }

    pub fn module(&self, name: &str) -> Option<&ModuleInfo> {
        self.canonical_module(name)
            .and_then(|canonical| self.modules.get(canonical))
    }

    fn relative_spelling(&self, path: &str) -> String {
        let normalized = normalize_path(path);
        let candidate = Path::new(&normalized);
        for root in std::iter::once(&self.root).chain(self.canonical_root.as_ref()) {
            if let Ok(stripped) = candidate.strip_prefix(root) {
                return normalize_path(&stripped.to_string_lossy());
            }
        }
        normalized
    }

    /// Module defined by `path`, which may be absolute, project-relative or
    /// repository-relative.
    pub fn module_for_file(&self, path: &str) -> Option<&ModuleInfo> {
        let relative = self.relative_spelling(path);
        if let Some(name) = self.files.get(&relative) {
            return self.modules.get(name);
        }
        self.modules
            .values()
            .find(|m| same_source_file(&m.path, &relative))
    }

    /// Project-relative file defining `module`.
    pub fn file_for_module(&self, module: &str) -> Option<String> {
        if let Some(info) = self.module(module) {
            return Some(info.path.clone());
        }
        let canonical = self.strip_root_package(module).unwrap_or(module);
        resolve_module_file(canonical, &self.files)
    }

    pub fn line_text(&self, file: &str, line: i64) -> Option<&str> {
        self.module_for_file(file)?.line_text(line)
    }

    pub fn symbols_in_module<'a>(&'a self, module: &'a ModuleInfo) -> impl Iterator<Item = &'a SymbolDef> {
        module.symbols.iter().filter_map(|fqn| self.symbols.get(fqn))
    }

    /// Direct members (methods, nested classes) of a class.
    pub fn members_of<'a>(&'a self, class: &'a SymbolDef) -> impl Iterator<Item = &'a SymbolDef> {
        self.module(&class.module)
            .into_iter()
            .flat_map(move |m| self.symbols_in_module(m))
            .filter(move |s| s.parent.as_deref() == Some(class.fqn.as_str()))
    }

    /// Definition implementing `handler`: file first, then symbol name, nearest
    /// to the declared start line when several share the name. An exact
    /// qualified-name match only breaks ties in distance.
    pub fn find_handler(&self, handler: &HandlerLocation) -> Option<&SymbolDef> {
        let module = self
            .module_for_file(&handler.file)
            .or_else(|| self.module(&handler.module))?;
        let wanted = handler.symbol.trim();
        let tail = wanted.rsplit('.').next().unwrap_or(wanted);
        self.symbols_in_module(module)
            .filter(|s| !s.is_class())
            .filter(|s| s.qualified_name == wanted || s.name == tail || s.fqn == wanted)
            .min_by_key(|s| {
                let inexact = s.qualified_name != wanted && s.fqn != wanted;
                let distance = (s.def_line - handler.start_line)
                    .abs()
                    .min((s.start_line - handler.start_line).abs());
                (distance, inexact)
            })
    }

    /// Resolve a fully-qualified dotted name.
    pub fn resolve(&self, fqn: &str) -> Option<Target<'_>> {
        self.resolve_with_hops(fqn, 0)
    }

    fn resolve_with_hops(&self, fqn: &str, hops: usize) -> Option<Target<'_>> {
        if hops > MAX_RESOLUTION_HOPS || fqn.is_empty() {
            return None;
        }
        if let Some(symbol) = self.symbols.get(fqn) {
            return Some(Target::Symbol(symbol));
        }
        if let Some(module) = self.modules.get(fqn) {
            return Some(Target::Module(module));
        }
        for (head, rest) in prefix_splits(fqn) {
            if let Some(module) = self.modules.get(head) {
                return self.resolve_member_path(module, rest, hops);
            }
        }
        let stripped = self.strip_root_package(fqn)?;
        self.resolve_with_hops(stripped, hops + 1)
    }

    /// Resolve `dotted` as seen from the top level of `module`.
    pub fn resolve_in_module(&self, module: &str, dotted: &str) -> Option<Target<'_>> {
        let info = self.module(module)?;
        self.resolve_member_path(info, dotted, 0)
    }

    fn resolve_member_path<'a>(&'a self, module: &'a ModuleInfo, rest: &str, hops: usize) -> Option<Target<'a>> {
        if hops > MAX_RESOLUTION_HOPS {
            return None;
        }
        let (first, remainder) = split_first(rest);
        if let Some(symbol) = self.symbols.get(&qualify(&module.name, first)) {
            return match remainder {
                None => Some(Target::Symbol(symbol)),
                Some(remainder) => self.resolve_symbol_member(symbol, remainder),
            };
        }
        if let Some(target) = module.bindings.get(first) {
            let next = match remainder {
                Some(remainder) => format!("{target}.{remainder}"),
                None => target.clone(),
            };
            if next != qualify(&module.name, rest) {
                return self.resolve_with_hops(&next, hops + 1);
            }
        }
        if let Some(variable) = module.variables.get(first) {
            return remainder.is_none().then_some(Target::Variable(module, variable));
        }
        let submodule = qualify(&module.name, first);
        if let Some(child) = self.modules.get(&submodule) {
            return match remainder {
                None => Some(Target::Module(child)),
                Some(remainder) => self.resolve_member_path(child, remainder, hops + 1),
            };
        }
        module
            .star_imports
            .iter()
            .find_map(|star| self.resolve_with_hops(&format!("{star}.{rest}"), hops + 1))
    }

    fn resolve_symbol_member<'a>(&'a self, symbol: &'a SymbolDef, rest: &str) -> Option<Target<'a>> {
        let (first, remainder) = split_first(rest);
        let member = if symbol.is_class() {
            self.lookup_member(symbol, first)?
        } else {
            self.symbols.get(&format!("{}.{first}", symbol.fqn))?
        };
        match remainder {
            None => Some(Target::Symbol(member)),
            Some(remainder) => self.resolve_symbol_member(member, remainder),
        }
    }

    /// Resolve `dotted` from inside `scope`: enclosing function scopes first
    /// (class bodies do not enclose), then the module top level.
    pub fn resolve_in_scope<'a>(&'a self, scope: &'a SymbolDef, dotted: &str) -> Option<Target<'a>> {
        let (head, remainder) = split_first(dotted);
        let mut current = Some(scope);
        while let Some(frame) = current {
            if frame.kind != SymbolKind::Class {
                if let Some(nested) = self.symbols.get(&format!("{}.{head}", frame.fqn)) {
                    return match remainder {
                        None => Some(Target::Symbol(nested)),
                        Some(remainder) => self.resolve_symbol_member(nested, remainder),
                    };
                }
            }
            current = frame.parent.as_deref().and_then(|p| self.symbols.get(p));
        }
        self.resolve_in_module(&scope.module, dotted)
    }

    /// Project classes named in the bases of `class`.
    pub fn base_classes<'a>(&'a self, class: &'a SymbolDef) -> Vec<&'a SymbolDef> {
        class
            .bases
            .iter()
            .filter_map(|base| match self.resolve_in_module(&class.module, base) {
                Some(Target::Symbol(s)) if s.is_class() && s.fqn != class.fqn => Some(s),
                _ => None,
            })
            .collect()
    }

    /// Method or nested class `name` on `class` or its bases, depth first.
    pub fn lookup_member<'a>(&'a self, class: &'a SymbolDef, name: &str) -> Option<&'a SymbolDef> {
        self.lookup_member_depth(class, name, 0)
    }

    fn lookup_member_depth<'a>(&'a self, class: &'a SymbolDef, name: &str, depth: usize) -> Option<&'a SymbolDef> {
        if depth > MAX_MRO_DEPTH {
            return None;
        }
        if let Some(member) = self.symbols.get(&format!("{}.{name}", class.fqn)) {
            return Some(member);
        }
        self.base_classes(class)
            .into_iter()
            .find_map(|base| self.lookup_member_depth(base, name, depth + 1))
    }

    /// Class-level or instance attribute `name` on `class` or its bases, with
    /// the class that declares it.
    pub fn class_attribute<'a>(&'a self, class: &'a SymbolDef, name: &str) -> Option<(&'a SymbolDef, &'a ClassAttribute)> {
        self.class_attribute_depth(class, name, 0)
    }

    fn class_attribute_depth<'a>(
        &'a self,
        class: &'a SymbolDef,
        name: &str,
        depth: usize,
    ) -> Option<(&'a SymbolDef, &'a ClassAttribute)> {
        if depth > MAX_MRO_DEPTH {
            return None;
        }
        let own = class
            .attributes
            .iter()
            .filter(|a| a.name == name)
            .min_by_key(|a| (a.annotation.is_none(), a.scope.is_some(), a.start_line));
        if let Some(attribute) = own {
            return Some((class, attribute));
        }
        self.base_classes(class)
            .into_iter()
            .find_map(|base| self.class_attribute_depth(base, name, depth + 1))
    }
}
