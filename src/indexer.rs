//! Source indexing
//!
//! Parses one Python file with tree-sitter and records, for every test
//! method defined directly inside a test-case class, the line range of its
//! definition. Scopes are tracked on an explicit stack so a nested class
//! never leaks its test-case status to siblings or to its parent's methods.

use std::path::Path;

use tree_sitter::{Language, Node, Parser};

use crate::affected::{module_path, MODULE_SEPARATOR};
use crate::config::DetectConfig;
use crate::errors::IndexError;
use crate::test_model::{LineRange, SourceIndex};

struct Scope<'s> {
    name: &'s str,
    test_case: bool,
}

enum Step<'t> {
    Visit(Node<'t>),
    Leave,
}

/// Read and index `path`, naming entries after its module path under `root`
pub fn index_file(root: &Path, path: &Path, detect: &DetectConfig) -> Result<SourceIndex, IndexError> {
    let source = std::fs::read_to_string(path).map_err(|source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    index_source(&module_path(root, path), path, &source, detect)
}

/// Index already-loaded source text.
///
/// `module` prefixes every key; `path` is only used for error reporting.
pub fn index_source(
    module: &str,
    path: &Path,
    source: &str,
    detect: &DetectConfig,
) -> Result<SourceIndex, IndexError> {
    let language: Language = tree_sitter_python::LANGUAGE.into();
    let mut parser = Parser::new();
    parser
        .set_language(&language)
        .map_err(|e| IndexError::Grammar(e.to_string()))?;

    let tree = parser.parse(source, None).ok_or_else(|| IndexError::Syntax {
        path: path.to_path_buf(),
        line: 1,
    })?;

    let root = tree.root_node();
    if root.has_error() {
        return Err(IndexError::Syntax {
            path: path.to_path_buf(),
            line: first_error_line(root),
        });
    }

    let bytes = source.as_bytes();
    let mut index = SourceIndex::new();
    let mut scopes: Vec<Scope> = Vec::new();
    let mut work = vec![Step::Visit(root)];

    while let Some(step) = work.pop() {
        let node = match step {
            Step::Leave => {
                scopes.pop();
                continue;
            }
            Step::Visit(node) => node,
        };

        match node.kind() {
            kind @ ("class_definition" | "function_definition") => {
                let Some(name) = node
                    .child_by_field_name("name")
                    .and_then(|n| n.utf8_text(bytes).ok())
                else {
                    continue;
                };
                let Some(body) = node.child_by_field_name("body") else {
                    continue;
                };

                let is_class = kind == "class_definition";

                if !is_class && detect.is_test_method(name) {
                    if let Some(class) = scopes.last().filter(|s| s.test_case) {
                        let key = [module, class.name, name]
                            .iter()
                            .filter(|part| !part.is_empty())
                            .copied()
                            .collect::<Vec<_>>()
                            .join(MODULE_SEPARATOR);
                        let range = LineRange::new(
                            node.start_position().row as u32 + 1,
                            body.end_position().row as u32 + 1,
                        );
                        index.insert(key, range);
                    }
                }

                scopes.push(Scope {
                    name,
                    test_case: is_class && detect.is_test_class(name),
                });
                work.push(Step::Leave);
                work.push(Step::Visit(body));
            }
            _ => {
                let mut cursor = node.walk();
                let children: Vec<Node> = node.named_children(&mut cursor).collect();
                work.extend(children.into_iter().rev().map(Step::Visit));
            }
        }
    }

    tracing::debug!(path = %path.display(), tests = index.len(), "indexed source");
    Ok(index)
}

/// 1-based line of the first error or missing node in document order
fn first_error_line(root: Node) -> u32 {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() {
            return node.start_position().row as u32 + 1;
        }
        if !node.has_error() {
            continue;
        }
        let mut cursor = node.walk();
        let children: Vec<Node> = node.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }
    root.start_position().row as u32 + 1
}
