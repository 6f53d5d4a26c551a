//! Symbol, import, and call-site extraction from Python source.
//!
//! One pass over the tree-sitter tree produces plain data: definitions with
//! their line ranges, the calls and name reads inside each body, local
//! bindings used for type inference, and the import bindings of the module.
//! Nothing here keeps the tree alive, so extracted modules can be shared
//! freely across threads.

use std::collections::{BTreeSet, HashMap};

use tree_sitter::Node;

use crate::errors::ImpactResult;
use crate::indexer::imports::resolve_relative_module;
use crate::indexer::parser::{
    definition_of, end_line, field_text, named_children, node_text, parse_python, start_line,
};
use crate::models::SymbolReference;

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// The slice of Python expression syntax call resolution cares about.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Expr {
    Name(String),
    Attribute { object: Box<Expr>, attr: String },
    Call { func: Box<Expr> },
    Other,
}

impl Expr {
    pub fn name(name: &str) -> Self {
        Expr::Name(name.to_string())
    }

    pub fn attr(object: Expr, attr: &str) -> Self {
        Expr::Attribute {
            object: Box::new(object),
            attr: attr.to_string(),
        }
    }

    /// Build an expression from dotted text such as `self.repo.get`.
    pub fn from_dotted(text: &str) -> Self {
        let mut parts = text.trim().split('.').filter(|p| !p.is_empty());
        let Some(first) = parts.next() else {
            return Expr::Other;
        };
        parts.fold(Expr::name(first), Expr::attr)
    }

    /// `a.b.c` for pure name/attribute chains.
    pub fn dotted(&self) -> Option<String> {
        match self {
            Expr::Name(name) => Some(name.clone()),
            Expr::Attribute { object, attr } => object.dotted().map(|base| format!("{base}.{attr}")),
            _ => None,
        }
    }

    /// Source-like rendering, used as the receiver key for external hints.
    pub fn render(&self) -> String {
        match self {
            Expr::Name(name) => name.clone(),
            Expr::Attribute { object, attr } => format!("{}.{attr}", object.render()),
            Expr::Call { func } => format!("{}()", func.render()),
            Expr::Other => "?".to_string(),
        }
    }
}

pub fn to_expr(node: &Node, source: &str) -> Expr {
    match node.kind() {
        "identifier" => Expr::Name(node_text(node, source).to_string()),
        "attribute" => {
            let object = node
                .child_by_field_name("object")
                .map(|o| to_expr(&o, source))
                .unwrap_or(Expr::Other);
            match field_text(node, "attribute", source) {
                Some(attr) => Expr::Attribute {
                    object: Box::new(object),
                    attr: attr.to_string(),
                },
                None => Expr::Other,
            }
        }
        "call" => match node.child_by_field_name("function") {
            Some(func) => Expr::Call {
                func: Box::new(to_expr(&func, source)),
            },
            None => Expr::Other,
        },
        "await" | "parenthesized_expression" => named_children(node)
            .first()
            .map(|inner| to_expr(inner, source))
            .unwrap_or(Expr::Other),
        _ => Expr::Other,
    }
}

// ---------------------------------------------------------------------------
// Extracted types
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Function,
    Method,
    Class,
}

/// A call expression inside a body. Dependencies handed to the framework
/// through `Depends(...)` or `Security(...)` are recorded as calls too.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallSite {
    pub line: i64,
    pub callee: Expr,
}

/// A name or attribute read that is not in call position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameUse {
    pub line: i64,
    pub expr: Expr,
}

/// `name = value`, `name: T = value`, `with v as name`, `name := value`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalBinding {
    pub name: String,
    pub line: i64,
    pub annotation: Option<String>,
    pub value: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub annotation: Option<String>,
    pub has_default: bool,
}

/// Class-level attribute or `self.<name>` assignment inside a method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassAttribute {
    pub name: String,
    pub start_line: i64,
    pub end_line: i64,
    pub annotation: Option<String>,
    pub value: Option<Expr>,
    /// Fully-qualified method the assignment lives in; `None` at class level.
    pub scope: Option<String>,
}

/// A function, method, or class definition.
#[derive(Clone, Debug)]
pub struct SymbolDef {
    pub name: String,
    /// Dotted path inside the module, e.g. `UserService.create`.
    pub qualified_name: String,
    /// Module name plus qualified name.
    pub fqn: String,
    pub kind: SymbolKind,
    pub file: String,
    pub module: String,
    /// First line, decorators included.
    pub start_line: i64,
    /// Line of the `def` or `class` keyword.
    pub def_line: i64,
    pub end_line: i64,
    pub parent: Option<String>,
    pub parent_kind: Option<SymbolKind>,
    pub parameters: Vec<Parameter>,
    pub return_annotation: Option<String>,
    pub bases: Vec<String>,
    pub calls: Vec<CallSite>,
    pub name_uses: Vec<NameUse>,
    pub locals: Vec<LocalBinding>,
    pub attributes: Vec<ClassAttribute>,
}

impl SymbolDef {
    pub fn reference(&self) -> SymbolReference {
        SymbolReference::new(&self.file, &self.qualified_name, self.start_line, self.end_line)
    }

    pub fn is_class(&self) -> bool {
        self.kind == SymbolKind::Class
    }

    /// Enclosing class for methods.
    pub fn owner_class(&self) -> Option<&str> {
        match (self.kind, self.parent_kind) {
            (SymbolKind::Method, Some(SymbolKind::Class)) => self.parent.as_deref(),
            _ => None,
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Latest binding of `name` at or before `line`, else the first one.
    pub fn local(&self, name: &str, line: i64) -> Option<&LocalBinding> {
        let bindings: Vec<&LocalBinding> = self.locals.iter().filter(|b| b.name == name).collect();
        bindings
            .iter()
            .filter(|b| b.line <= line)
            .max_by_key(|b| b.line)
            .or(bindings.first())
            .copied()
    }
}

/// A module-level assignment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleVariable {
    pub name: String,
    pub start_line: i64,
    pub end_line: i64,
    pub annotation: Option<String>,
    pub value: Option<Expr>,
}

/// A local name introduced by an import, mapped to an absolute dotted target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportBinding {
    pub local: String,
    pub target: String,
    pub line: i64,
}

/// One import statement: the absolute module and any names taken from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportRecord {
    pub module: String,
    pub names: Vec<String>,
    pub line: i64,
}

/// Everything extracted from one source file.
#[derive(Clone, Debug, Default)]
pub struct ExtractedModule {
    pub path: String,
    pub module: String,
    pub is_package: bool,
    pub symbols: Vec<SymbolDef>,
    pub variables: Vec<ModuleVariable>,
    pub bindings: Vec<ImportBinding>,
    pub star_imports: Vec<String>,
    pub imports: Vec<ImportRecord>,
    pub lines: Vec<String>,
    pub executable_lines: BTreeSet<i64>,
}

// ---------------------------------------------------------------------------
// Body events
// ---------------------------------------------------------------------------

const INJECTION_MARKERS: &[&str] = &["Depends", "Security"];

#[derive(Default)]
struct BodyEvents {
    calls: Vec<CallSite>,
    uses: Vec<NameUse>,
}

fn is_definition(kind: &str) -> bool {
    matches!(
        kind,
        "function_definition" | "class_definition" | "decorated_definition"
    )
}

fn is_import(kind: &str) -> bool {
    matches!(
        kind,
        "import_statement" | "import_from_statement" | "future_import_statement"
    )
}

fn is_injection_marker(callee: &Expr) -> bool {
    match callee {
        Expr::Name(name) => INJECTION_MARKERS.contains(&name.as_str()),
        Expr::Attribute { attr, .. } => INJECTION_MARKERS.contains(&attr.as_str()),
        _ => false,
    }
}

/// The dependency passed to `Depends(dep)` or `Depends(dependency=dep)`.
fn injected_dependency<'t>(arguments: &Node<'t>, source: &str) -> Option<Node<'t>> {
    for arg in named_children(arguments) {
        match arg.kind() {
            "keyword_argument" => {
                if field_text(&arg, "name", source) == Some("dependency") {
                    return arg.child_by_field_name("value");
                }
            }
            "comment" => {}
            _ => return Some(arg),
        }
    }
    None
}

fn collect_children_except(node: &Node, skip: Option<Node>, source: &str, out: &mut BodyEvents) {
    let skip_id = skip.map(|s| s.id());
    for child in named_children(node) {
        if Some(child.id()) != skip_id {
            collect_events(&child, source, out);
        }
    }
}

/// Walk a callee without recording the callee chain itself as a read.
fn collect_callee_parts(func: &Node, source: &str, out: &mut BodyEvents) {
    match func.kind() {
        "identifier" => {}
        "attribute" => {
            if let Some(object) = func.child_by_field_name("object") {
                collect_callee_parts(&object, source, out);
            }
        }
        _ => collect_events(func, source, out),
    }
}

fn collect_parameters(params: &Node, source: &str, out: &mut BodyEvents) {
    for param in named_children(params) {
        for field in ["type", "value"] {
            if let Some(part) = param.child_by_field_name(field) {
                collect_events(&part, source, out);
            }
        }
    }
}

fn collect_events(node: &Node, source: &str, out: &mut BodyEvents) {
    let kind = node.kind();
    if is_definition(kind) || is_import(kind) {
        return;
    }
    match kind {
        "global_statement" | "nonlocal_statement" | "comment" => {}
        "call" => {
            let line = start_line(node);
            let func = node.child_by_field_name("function");
            let callee = func.map(|f| to_expr(&f, source)).unwrap_or(Expr::Other);
            let arguments = node.child_by_field_name("arguments");
            if is_injection_marker(&callee) {
                if let Some(dep) = arguments.and_then(|a| injected_dependency(&a, source)) {
                    let dep_expr = to_expr(&dep, source);
                    if dep_expr.dotted().is_some() {
                        out.calls.push(CallSite {
                            line: start_line(&dep),
                            callee: dep_expr,
                        });
                    }
                }
            }
            if callee != Expr::Other {
                out.calls.push(CallSite { line, callee });
            }
            if let Some(func) = func {
                collect_callee_parts(&func, source, out);
            }
            if let Some(arguments) = arguments {
                collect_events(&arguments, source, out);
            }
        }
        "attribute" => {
            let expr = to_expr(node, source);
            if expr.dotted().is_some() {
                out.uses.push(NameUse {
                    line: start_line(node),
                    expr,
                });
            } else if let Some(object) = node.child_by_field_name("object") {
                collect_events(&object, source, out);
            }
        }
        "identifier" => {
            let name = node_text(node, source);
            if name != "self" && name != "cls" {
                out.uses.push(NameUse {
                    line: start_line(node),
                    expr: Expr::name(name),
                });
            }
        }
        "keyword_argument" => {
            if let Some(value) = node.child_by_field_name("value") {
                collect_events(&value, source, out);
            }
        }
        "assignment" => {
            for field in ["right", "type"] {
                if let Some(part) = node.child_by_field_name(field) {
                    collect_events(&part, source, out);
                }
            }
            if let Some(left) = node.child_by_field_name("left") {
                if left.kind() == "subscript" {
                    collect_events(&left, source, out);
                }
            }
        }
        "for_statement" | "for_in_clause" => {
            collect_children_except(node, node.child_by_field_name("left"), source, out);
        }
        "as_pattern" => {
            if let Some(value) = named_children(node).first() {
                collect_events(value, source, out);
            }
        }
        "named_expression" => {
            if let Some(value) = node.child_by_field_name("value") {
                collect_events(&value, source, out);
            }
        }
        "parameters" | "lambda_parameters" => collect_parameters(node, source, out),
        _ => collect_children_except(node, None, source, out),
    }
}

// ---------------------------------------------------------------------------
// Local bindings
// ---------------------------------------------------------------------------

fn collect_locals(node: &Node, source: &str, out: &mut Vec<LocalBinding>) {
    for child in named_children(node) {
        let kind = child.kind();
        if is_definition(kind) || kind == "lambda" {
            continue;
        }
        match kind {
            "assignment" => {
                if let Some(left) = child.child_by_field_name("left") {
                    if left.kind() == "identifier" {
                        out.push(LocalBinding {
                            name: node_text(&left, source).to_string(),
                            line: start_line(&child),
                            annotation: field_text(&child, "type", source).map(str::to_string),
                            value: child.child_by_field_name("right").map(|r| to_expr(&r, source)),
                        });
                    }
                }
            }
            "as_pattern" => {
                let value = named_children(&child).first().map(|v| to_expr(v, source));
                if let Some(name) = child.child_by_field_name("alias").and_then(|a| alias_name(&a, source)) {
                    out.push(LocalBinding {
                        name,
                        line: start_line(&child),
                        annotation: None,
                        value,
                    });
                }
            }
            "named_expression" => {
                if let Some(name) = field_text(&child, "name", source) {
                    out.push(LocalBinding {
                        name: name.to_string(),
                        line: start_line(&child),
                        annotation: None,
                        value: child.child_by_field_name("value").map(|v| to_expr(&v, source)),
                    });
                }
            }
            _ => {}
        }
        collect_locals(&child, source, out);
    }
}

fn alias_name(alias: &Node, source: &str) -> Option<String> {
    if alias.kind() == "identifier" {
        return Some(node_text(alias, source).to_string());
    }
    named_children(alias)
        .into_iter()
        .find(|c| c.kind() == "identifier")
        .map(|c| node_text(&c, source).to_string())
}

/// `self.<attr> = value` assignments inside a method body.
fn collect_instance_attributes(node: &Node, source: &str, scope: &str, out: &mut Vec<ClassAttribute>) {
    for child in named_children(node) {
        let kind = child.kind();
        if is_definition(kind) || kind == "lambda" {
            continue;
        }
        if kind == "assignment" {
            if let Some(left) = child.child_by_field_name("left") {
                let target = to_expr(&left, source);
                if let Expr::Attribute { object, attr } = &target {
                    if **object == Expr::name("self") {
                        out.push(ClassAttribute {
                            name: attr.clone(),
                            start_line: start_line(&child),
                            end_line: end_line(&child),
                            annotation: field_text(&child, "type", source).map(str::to_string),
                            value: child.child_by_field_name("right").map(|r| to_expr(&r, source)),
                            scope: Some(scope.to_string()),
                        });
                    }
                }
            }
        }
        collect_instance_attributes(&child, source, scope, out);
    }
}

fn extract_parameters(params: &Node, source: &str) -> Vec<Parameter> {
    let mut out = Vec::new();
    for param in named_children(params) {
        let (name, annotation, has_default) = match param.kind() {
            "identifier" => (Some(node_text(&param, source).to_string()), None, false),
            "typed_parameter" => {
                let name = named_children(&param)
                    .into_iter()
                    .find(|c| c.kind() == "identifier")
                    .map(|c| node_text(&c, source).to_string());
                (name, field_text(&param, "type", source).map(str::to_string), false)
            }
            "default_parameter" | "typed_default_parameter" => (
                field_text(&param, "name", source).map(str::to_string),
                field_text(&param, "type", source).map(str::to_string),
                true,
            ),
            "list_splat_pattern" | "dictionary_splat_pattern" => (
                named_children(&param)
                    .first()
                    .map(|c| node_text(c, source).to_string()),
                None,
                false,
            ),
            _ => (None, None, false),
        };
        if let Some(name) = name {
            out.push(Parameter {
                name,
                annotation,
                has_default,
            });
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Module walk
// ---------------------------------------------------------------------------

struct Parent {
    fqn: String,
    qualified: String,
    kind: SymbolKind,
}

struct Extractor<'s> {
    source: &'s str,
    out: ExtractedModule,
    pending_attributes: HashMap<String, Vec<ClassAttribute>>,
}

impl<'s> Extractor<'s> {
    fn qualify(&self, qualified: &str) -> String {
        if self.out.module.is_empty() {
            qualified.to_string()
        } else {
            format!("{}.{qualified}", self.out.module)
        }
    }

    /// Statements of a module or class body.
    fn visit_container(&mut self, node: &Node, parent: Option<&Parent>) {
        for child in named_children(node) {
            let kind = child.kind();
            if is_definition(kind) {
                self.visit_definition(&child, parent);
            } else if is_import(kind) {
                self.visit_import(&child);
            } else if kind == "expression_statement" {
                self.visit_assignment_statement(&child, parent);
            } else if matches!(
                kind,
                "if_statement"
                    | "elif_clause"
                    | "else_clause"
                    | "try_statement"
                    | "except_clause"
                    | "finally_clause"
                    | "with_statement"
                    | "block"
            ) {
                self.visit_container(&child, parent);
            }
        }
    }

    /// Nested definitions and imports inside a function body.
    fn scan_nested(&mut self, node: &Node, parent: &Parent) {
        for child in named_children(node) {
            let kind = child.kind();
            if is_definition(kind) {
                self.visit_definition(&child, Some(parent));
            } else if is_import(kind) {
                self.visit_import(&child);
            } else {
                self.scan_nested(&child, parent);
            }
        }
    }

    fn visit_assignment_statement(&mut self, stmt: &Node, parent: Option<&Parent>) {
        let source = self.source;
        for assignment in named_children(stmt) {
            if assignment.kind() != "assignment" {
                continue;
            }
            let Some(left) = assignment.child_by_field_name("left") else {
                continue;
            };
            if left.kind() != "identifier" {
                continue;
            }
            let name = node_text(&left, source).to_string();
            let annotation = field_text(&assignment, "type", source).map(str::to_string);
            let value = assignment
                .child_by_field_name("right")
                .map(|r| to_expr(&r, source));
            match parent {
                None => self.out.variables.push(ModuleVariable {
                    name,
                    start_line: start_line(stmt),
                    end_line: end_line(stmt),
                    annotation,
                    value,
                }),
                Some(p) if p.kind == SymbolKind::Class => {
                    self.pending_attributes
                        .entry(p.fqn.clone())
                        .or_default()
                        .push(ClassAttribute {
                            name,
                            start_line: start_line(stmt),
                            end_line: end_line(stmt),
                            annotation,
                            value,
                            scope: None,
                        });
                }
                Some(_) => {}
            }
        }
    }

    fn visit_definition(&mut self, outer: &Node, parent: Option<&Parent>) {
        let source = self.source;
        let def = definition_of(*outer);
        let Some(name) = field_text(&def, "name", source) else {
            return;
        };
        let qualified = match parent {
            Some(p) => format!("{}.{name}", p.qualified),
            None => name.to_string(),
        };
        let fqn = self.qualify(&qualified);

        let mut events = BodyEvents::default();
        if outer.kind() == "decorated_definition" {
            for decorator in named_children(outer) {
                if decorator.kind() == "decorator" {
                    collect_events(&decorator, source, &mut events);
                }
            }
        }

        let is_class = def.kind() == "class_definition";
        let kind = if is_class {
            SymbolKind::Class
        } else if parent.is_some_and(|p| p.kind == SymbolKind::Class) {
            SymbolKind::Method
        } else {
            SymbolKind::Function
        };

        let mut parameters = Vec::new();
        let mut bases = Vec::new();
        let mut locals = Vec::new();
        let body = def.child_by_field_name("body");

        if is_class {
            if let Some(superclasses) = def.child_by_field_name("superclasses") {
                for base in named_children(&superclasses) {
                    if matches!(base.kind(), "identifier" | "attribute" | "subscript") {
                        let text = node_text(&base, source);
                        let head = text.split('[').next().unwrap_or(text).trim();
                        bases.push(head.to_string());
                    }
                }
                collect_events(&superclasses, source, &mut events);
            }
            if let Some(body) = &body {
                for stmt in named_children(body) {
                    if !is_definition(stmt.kind()) {
                        collect_events(&stmt, source, &mut events);
                    }
                }
            }
        } else {
            if let Some(params) = def.child_by_field_name("parameters") {
                parameters = extract_parameters(&params, source);
                collect_events(&params, source, &mut events);
            }
            if let Some(returns) = def.child_by_field_name("return_type") {
                collect_events(&returns, source, &mut events);
            }
            if let Some(body) = &body {
                collect_events(body, source, &mut events);
                collect_locals(body, source, &mut locals);
                if let Some(p) = parent.filter(|p| p.kind == SymbolKind::Class) {
                    let mut attrs = Vec::new();
                    collect_instance_attributes(body, source, &fqn, &mut attrs);
                    self.pending_attributes
                        .entry(p.fqn.clone())
                        .or_default()
                        .extend(attrs);
                }
            }
        }

        self.out.symbols.push(SymbolDef {
            name: name.to_string(),
            qualified_name: qualified.clone(),
            fqn: fqn.clone(),
            kind,
            file: self.out.path.clone(),
            module: self.out.module.clone(),
            start_line: start_line(outer),
            def_line: start_line(&def),
            end_line: end_line(&def),
            parent: parent.map(|p| p.fqn.clone()),
            parent_kind: parent.map(|p| p.kind),
            parameters,
            return_annotation: field_text(&def, "return_type", source).map(str::to_string),
            bases,
            calls: events.calls,
            name_uses: events.uses,
            locals,
            attributes: Vec::new(),
        });

        let me = Parent {
            fqn,
            qualified,
            kind,
        };
        if let Some(body) = body {
            if is_class {
                self.visit_container(&body, Some(&me));
            } else {
                self.scan_nested(&body, &me);
            }
        }
    }

    fn visit_import(&mut self, node: &Node) {
        let source = self.source;
        let line = start_line(node);
        let mut cursor = node.walk();
        let names: Vec<Node> = node.children_by_field_name("name", &mut cursor).collect();
        match node.kind() {
            "import_statement" => {
                for name in names {
                    let (dotted, alias) = split_alias(&name, source);
                    if dotted.is_empty() {
                        continue;
                    }
                    // `import a.b` binds `a`; `import a.b as c` binds `c` to `a.b`.
                    let (local, target) = match alias {
                        Some(alias) => (alias, dotted.clone()),
                        None => {
                            let head = dotted.split('.').next().unwrap_or(&dotted).to_string();
                            (head.clone(), head)
                        }
                    };
                    self.out.bindings.push(ImportBinding {
                        local,
                        target,
                        line,
                    });
                    self.out.imports.push(ImportRecord {
                        module: dotted,
                        names: Vec::new(),
                        line,
                    });
                }
            }
            "import_from_statement" => {
                let Some(module_node) = node.child_by_field_name("module_name") else {
                    return;
                };
                let raw = node_text(&module_node, source).trim();
                let base = if raw.starts_with('.') {
                    let level = raw.chars().take_while(|&c| c == '.').count();
                    resolve_relative_module(
                        &self.out.module,
                        self.out.is_package,
                        level,
                        raw[level..].trim(),
                    )
                } else {
                    raw.to_string()
                };
                let is_star = named_children(node)
                    .iter()
                    .any(|c| c.kind() == "wildcard_import");
                if is_star {
                    self.out.star_imports.push(base.clone());
                }
                let mut imported = Vec::new();
                for name in names {
                    let (dotted, alias) = split_alias(&name, source);
                    if dotted.is_empty() {
                        continue;
                    }
                    let target = if base.is_empty() {
                        dotted.clone()
                    } else {
                        format!("{base}.{dotted}")
                    };
                    self.out.bindings.push(ImportBinding {
                        local: alias.unwrap_or_else(|| dotted.clone()),
                        target,
                        line,
                    });
                    imported.push(dotted);
                }
                self.out.imports.push(ImportRecord {
                    module: base,
                    names: imported,
                    line,
                });
            }
            _ => {}
        }
    }
}

/// `(dotted name, alias)` of a `dotted_name` or `aliased_import` node.
fn split_alias(node: &Node, source: &str) -> (String, Option<String>) {
    if node.kind() == "aliased_import" {
        let dotted = field_text(node, "name", source).unwrap_or("").trim().to_string();
        let alias = field_text(node, "alias", source).map(|a| a.trim().to_string());
        (dotted, alias)
    } else {
        (node_text(node, source).trim().to_string(), None)
    }
}

/// Extract symbols, imports, and line data from one module's source.
pub fn extract_module(source: &str, path: &str, module: &str, is_package: bool) -> ImpactResult<ExtractedModule> {
    let tree = parse_python(source, path)?;
    let lines: Vec<String> = source.lines().map(str::to_string).collect();
    let executable_lines = lines
        .iter()
        .enumerate()
        .filter(|(_, text)| {
            let trimmed = text.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .map(|(i, _)| i as i64 + 1)
        .collect();

    let mut extractor = Extractor {
        source,
        out: ExtractedModule {
            path: path.to_string(),
            module: module.to_string(),
            is_package,
            lines,
            executable_lines,
            ..ExtractedModule::default()
        },
        pending_attributes: HashMap::new(),
    };
    extractor.visit_container(&tree.root_node(), None);

    let mut pending = std::mem::take(&mut extractor.pending_attributes);
    for symbol in extractor.out.symbols.iter_mut() {
        if symbol.is_class() {
            if let Some(attrs) = pending.remove(&symbol.fqn) {
                symbol.attributes = attrs;
            }
        }
    }
    Ok(extractor.out)
}
