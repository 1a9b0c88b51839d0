//! Static extraction of top-level package names from Python source.
//!
//! Registered functions carry their source text; before a sandbox is
//! provisioned the source is parsed and every import is reduced to its first
//! dotted segment (`import pandas.io` contributes `pandas`). Relative
//! imports contribute nothing. The packages the worker itself needs are
//! always added on top.

use std::collections::BTreeSet;

use tree_sitter::{Node, Parser};

use crate::logger::Logger;

/// Packages every sandbox needs regardless of what the user code imports:
/// the worker's reply encoder requires them to run at all.
pub(crate) const WORKER_PACKAGES: &[&str] = &["numpy"];

fn parser() -> Parser {
    let mut parser = Parser::new();
    parser
        .set_language(tree_sitter_python::language())
        .expect("Error loading Python grammar");
    parser
}

/// Parses `source` and returns the first dotted segment of every absolute
/// import found anywhere in the tree.
pub fn extract_imports(source: &str) -> BTreeSet<String> {
    let mut packages = BTreeSet::new();
    let Some(tree) = parser().parse(source, None) else {
        return packages;
    };
    collect(tree.root_node(), source, &mut packages);
    packages
}

fn first_segment(source: &str, node: Node) -> Option<String> {
    let text = &source[node.start_byte()..node.end_byte()];
    text.split('.').next().map(str::to_string)
}

fn collect(node: Node, source: &str, packages: &mut BTreeSet<String>) {
    match node.kind() {
        "import_statement" => {
            for name in node.children_by_field_name("name", &mut node.walk()) {
                // `import a.b as c` wraps the dotted name in an aliased_import.
                let dotted = if name.kind() == "aliased_import" {
                    name.named_child(0)
                } else {
                    Some(name)
                };
                if let Some(dotted) = dotted
                    && let Some(segment) = first_segment(source, dotted)
                {
                    packages.insert(segment);
                }
            }
            return;
        }
        "import_from_statement" => {
            if let Some(module) = node.child_by_field_name("module_name")
                && module.kind() != "relative_import"
                && let Some(segment) = first_segment(source, module)
            {
                packages.insert(segment);
            }
            return;
        }
        "future_import_statement" => {
            packages.insert("__future__".to_string());
            return;
        }
        _ => {}
    }
    for i in 0..node.named_child_count() {
        if let Some(child) = node.named_child(i) {
            collect(child, source, packages);
        }
    }
}

/// Import extraction plus the forced worker packages. A missing source
/// (opaque registration) is warned about once and degrades to the forced
/// set only; the explicit declaration still applies at the call site.
pub(crate) fn inferred_dependencies(
    logger: &Logger,
    name: &str,
    source: Option<&str>,
) -> BTreeSet<String> {
    let mut packages = match source {
        Some(source) => extract_imports(source),
        None => {
            logger.warn(format!("{name} is a builtin/C extension (explicit deps only)"));
            BTreeSet::new()
        }
    };
    for package in WORKER_PACKAGES {
        packages.insert((*package).to_string());
    }
    packages
}

/// Returns the name of the first top-level `def` in `source`, looking
/// through decorators. `None` when the source defines no function or does
/// not parse.
pub(crate) fn top_level_function_name(source: &str) -> Option<String> {
    let tree = parser().parse(source, None)?;
    let root = tree.root_node();
    if root.has_error() {
        return None;
    }
    for i in 0..root.named_child_count() {
        let child = root.named_child(i)?;
        let def = match child.kind() {
            "function_definition" => Some(child),
            "decorated_definition" => child
                .child_by_field_name("definition")
                .filter(|d| d.kind() == "function_definition"),
            _ => None,
        };
        if let Some(def) = def
            && let Some(name) = def.child_by_field_name("name")
        {
            return Some(source[name.start_byte()..name.end_byte()].to_string());
        }
    }
    None
}
