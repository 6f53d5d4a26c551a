//! Module-level import graph with BFS reachability queries.

use std::collections::{BTreeSet, HashMap, VecDeque};

use indexmap::IndexMap;
use tracing::debug;

use crate::indexer::filesystem::same_source_file;
use crate::indexer::pipeline::ProjectIndex;
use crate::query::guards::MAX_GRAPH_VISITED;

/// Directed `module -> imported module` edges between project modules.
/// Imports of third-party or standard-library modules are not edges.
#[derive(Clone, Debug, Default)]
pub struct ImportGraph {
    edges: IndexMap<String, BTreeSet<String>>,
    reverse: HashMap<String, BTreeSet<String>>,
    files: IndexMap<String, String>,
}

impl ImportGraph {
    pub fn build(index: &ProjectIndex) -> Self {
        let mut graph = Self::default();
        for module in index.modules() {
            graph.files.insert(module.name.clone(), module.path.clone());
            let targets = graph.edges.entry(module.name.clone()).or_default();
            for record in &module.imports {
                if let Some(canonical) = index.canonical_module(&record.module) {
                    targets.insert(canonical.to_string());
                }
                for name in &record.names {
                    let candidate = format!("{}.{name}", record.module);
                    if let Some(canonical) = index.canonical_module(&candidate) {
                        targets.insert(canonical.to_string());
                    }
                }
            }
            targets.remove(&module.name);
        }
        for (source, targets) in &graph.edges {
            for target in targets {
                graph
                    .reverse
                    .entry(target.clone())
                    .or_default()
                    .insert(source.clone());
            }
        }
        debug!(
            modules = graph.edges.len(),
            edges = graph.edges.values().map(BTreeSet::len).sum::<usize>(),
            "import graph built"
        );
        graph
    }

    pub fn contains(&self, module: &str) -> bool {
        self.edges.contains_key(module)
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    pub fn directly_imports(&self, module: &str) -> BTreeSet<String> {
        self.edges.get(module).cloned().unwrap_or_default()
    }

    pub fn imported_by(&self, module: &str) -> BTreeSet<String> {
        self.reverse.get(module).cloned().unwrap_or_default()
    }

    /// Every module reachable from `module` over import edges.
    pub fn transitively_imports(&self, module: &str) -> BTreeSet<String> {
        bfs(module, |m| self.edges.get(m))
    }

    /// Every module that reaches `module` over import edges.
    pub fn downstream(&self, module: &str) -> BTreeSet<String> {
        bfs(module, |m| self.reverse.get(m))
    }

    /// First path found by BFS from `from` to `to`, both ends included.
    pub fn shortest_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        if from == to {
            return self.contains(from).then(|| vec![from.to_string()]);
        }
        let mut parents: HashMap<&str, &str> = HashMap::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(from);
        parents.insert(from, from);
        while let Some(current) = queue.pop_front() {
            if parents.len() > MAX_GRAPH_VISITED {
                break;
            }
            let Some(targets) = self.edges.get(current) else {
                continue;
            };
            for next in targets {
                if parents.contains_key(next.as_str()) {
                    continue;
                }
                parents.insert(next.as_str(), current);
                if next == to {
                    let mut path = vec![to.to_string()];
                    let mut cursor = current;
                    while cursor != from {
                        path.push(cursor.to_string());
                        cursor = parents[cursor];
                    }
                    path.push(from.to_string());
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next.as_str());
            }
        }
        None
    }

    pub fn module_to_file(&self, module: &str) -> Option<&str> {
        self.files.get(module).map(String::as_str)
    }

    /// Module defined by `file`, under any path spelling.
    pub fn file_to_module(&self, file: &str) -> Option<&str> {
        self.files
            .iter()
            .find(|(_, path)| same_source_file(path, file))
            .map(|(module, _)| module.as_str())
    }
}

fn bfs<'g>(start: &str, neighbours: impl Fn(&str) -> Option<&'g BTreeSet<String>>) -> BTreeSet<String> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(start.to_string());
    while let Some(current) = queue.pop_front() {
        if seen.len() >= MAX_GRAPH_VISITED {
            break;
        }
        for next in neighbours(&current).into_iter().flatten() {
            if next != start && seen.insert(next.clone()) {
                queue.push_back(next.clone());
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn graph() -> ImportGraph {
        let index = ProjectIndex::from_sources(
            Path::new("/p"),
            [
                ("main.py", "from routers import users\nimport os\n"),
                ("routers/__init__.py", ""),
                ("routers/users.py", "from services.user_service import create\n"),
                ("services/__init__.py", ""),
                ("services/user_service.py", "from database import connection\nfrom utils.helpers import slug\n"),
                ("database/__init__.py", ""),
                ("database/connection.py", "import services.user_service\n"),
                ("utils/helpers.py", "def slug():\n    pass\n"),
            ],
        );
        ImportGraph::build(&index)
    }

    #[test]
    fn test_direct_edges_skip_external_modules() {
        let graph = graph();
        let direct = graph.directly_imports("main");
        assert_eq!(direct.into_iter().collect::<Vec<_>>(), vec!["routers", "routers.users"]);
        assert_eq!(
            graph.directly_imports("services.user_service").into_iter().collect::<Vec<_>>(),
            vec!["database", "database.connection", "utils.helpers"]
        );
    }

    #[test]
    fn test_transitive_and_cycles() {
        let graph = graph();
        let reach = graph.transitively_imports("main");
        assert!(reach.contains("utils.helpers"));
        assert!(reach.contains("database.connection"));
        assert!(!reach.contains("main"));
        let cyclic = graph.transitively_imports("database.connection");
        assert!(cyclic.contains("services.user_service"));
        assert!(!cyclic.contains("database.connection"));
    }

    #[test]
    fn test_shortest_path() {
        let graph = graph();
        assert_eq!(
            graph.shortest_path("main", "utils.helpers").unwrap(),
            vec!["main", "routers.users", "services.user_service", "utils.helpers"]
        );
        assert!(graph.shortest_path("utils.helpers", "main").is_none());
        assert_eq!(graph.shortest_path("main", "main").unwrap(), vec!["main"]);
    }

    #[test]
    fn test_reverse_queries_and_files() {
        let graph = graph();
        assert!(graph.imported_by("utils.helpers").contains("services.user_service"));
        let downstream = graph.downstream("utils.helpers");
        assert!(downstream.contains("main"));
        assert!(downstream.contains("routers.users"));
        assert_eq!(graph.module_to_file("routers"), Some("routers/__init__.py"));
        assert_eq!(graph.file_to_module("/abs/project/utils/helpers.py"), Some("utils.helpers"));
    }
}
