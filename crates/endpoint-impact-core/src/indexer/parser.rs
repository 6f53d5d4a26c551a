//! Python parsing wrapper and tree-sitter node helpers used by extraction passes.

use tree_sitter::{Node, Parser, Tree};

use crate::errors::{ImpactError, ImpactResult};

/// Parse Python source into a tree-sitter tree.
///
/// A tree with syntax errors is still returned; extraction works on the
/// well-formed parts.
pub fn parse_python(source: &str, path: &str) -> ImpactResult<Tree> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| ImpactError::Parse(format!("Failed to set language: {e}")))?;
    parser
        .parse(source.as_bytes(), None)
        .ok_or_else(|| ImpactError::Parse(format!("Failed to parse {path}")))
}

/// Source text spanned by `node`.
pub fn node_text<'s>(node: &Node, source: &'s str) -> &'s str {
    source.get(node.start_byte()..node.end_byte()).unwrap_or("")
}

/// 1-based first line of `node`.
pub fn start_line(node: &Node) -> i64 {
    node.start_position().row as i64 + 1
}

/// 1-based last line of `node`. A node ending at column 0 ends on the previous line.
pub fn end_line(node: &Node) -> i64 {
    let end = node.end_position();
    let row = if end.column == 0 && end.row > node.start_position().row {
        end.row - 1
    } else {
        end.row
    };
    row as i64 + 1
}

pub fn named_children<'t>(node: &Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

pub fn field_text<'s>(node: &Node, field: &str, source: &'s str) -> Option<&'s str> {
    node.child_by_field_name(field).map(|child| node_text(&child, source))
}

/// Unwrap `decorated_definition` to the function or class it decorates.
pub fn definition_of<'t>(node: Node<'t>) -> Node<'t> {
    if node.kind() == "decorated_definition" {
        if let Some(def) = node.child_by_field_name("definition") {
            return def;
        }
    }
    node
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_python_function() {
        let source = "def handler(x):\n    return x\n";
        let tree = parse_python(source, "m.py").unwrap();
        let root = tree.root_node();
        let children = named_children(&root);
        assert_eq!(children.len(), 1);
        let func = children[0];
        assert_eq!(func.kind(), "function_definition");
        assert_eq!(field_text(&func, "name", source), Some("handler"));
        assert_eq!(start_line(&func), 1);
        assert_eq!(end_line(&func), 2);
    }

    #[test]
    fn test_definition_of_decorated() {
        let source = "@app.get('/x')\nasync def route():\n    pass\n";
        let tree = parse_python(source, "m.py").unwrap();
        let decorated = named_children(&tree.root_node())[0];
        assert_eq!(decorated.kind(), "decorated_definition");
        let def = definition_of(decorated);
        assert_eq!(def.kind(), "function_definition");
        assert_eq!(start_line(&decorated), 1);
        assert_eq!(start_line(&def), 2);
    }

    #[test]
    fn test_syntax_errors_still_parse() {
        let source = "def broken(:\n    pass\n";
        let tree = parse_python(source, "m.py").unwrap();
        assert!(tree.root_node().has_error());
    }
}
