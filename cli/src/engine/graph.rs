//! Dependency-graph pretty printer.
//!
//! Renders the forward adjacency (who unblocks whom) as a tree with
//! `├─`/`└─`/`│` connectors. Roots are tasks without dependencies; a
//! component with no root (a cycle) is entered at its lexicographically
//! first node and the first re-visit is marked `↻ cycle`.

use std::collections::{BTreeMap, HashSet};

use super::TaskRegistry;

/// Format the task dependency graph as a tree string.
#[must_use]
pub fn format_dependency_graph<C>(registry: &TaskRegistry<C>) -> String {
    let tasks = registry.tasks();
    if tasks.is_empty() {
        return String::new();
    }

    let mut children: BTreeMap<&str, Vec<&str>> =
        tasks.iter().map(|task| (task.name, Vec::new())).collect();
    for task in tasks {
        for dep in task.deps.iter().copied() {
            children.entry(dep).or_default().push(task.name);
        }
    }
    for list in children.values_mut() {
        list.sort_unstable();
    }

    let mut roots: Vec<&str> = tasks
        .iter()
        .filter(|task| task.deps.is_empty())
        .map(|task| task.name)
        .collect();
    roots.sort_unstable();

    let mut lines: Vec<String> = Vec::new();
    let mut rendered: HashSet<&str> = HashSet::new();

    for root in roots.iter().copied() {
        if !lines.is_empty() {
            lines.push(String::new());
        }
        lines.push(root.to_string());
        rendered.insert(root);
        let descendants = children.get(root).cloned().unwrap_or_default();
        let mut path = HashSet::new();
        path.insert(root);
        for (index, child) in descendants.iter().enumerate() {
            render_node(
                *child,
                "",
                index == descendants.len() - 1,
                &path,
                &children,
                &mut rendered,
                &mut lines,
            );
        }
    }

    // Rootless components (cycles): enter at the first unrendered name.
    let mut unrendered: Vec<&str> = children
        .keys()
        .filter(|name| !rendered.contains(*name))
        .copied()
        .collect();
    unrendered.sort_unstable();
    for name in unrendered {
        if rendered.contains(name) {
            continue;
        }
        if !lines.is_empty() {
            lines.push(String::new());
        }
        lines.push(name.to_string());
        rendered.insert(name);
        let descendants = children.get(name).cloned().unwrap_or_default();
        let mut path = HashSet::new();
        path.insert(name);
        for (index, child) in descendants.iter().enumerate() {
            render_node(
                *child,
                "",
                index == descendants.len() - 1,
                &path,
                &children,
                &mut rendered,
                &mut lines,
            );
        }
    }

    lines.join("\n")
}

fn render_node<'graph>(
    node: &'graph str,
    prefix: &str,
    is_last: bool,
    path: &HashSet<&'graph str>,
    children: &BTreeMap<&'graph str, Vec<&'graph str>>,
    rendered: &mut HashSet<&'graph str>,
    lines: &mut Vec<String>,
) {
    let connector = if is_last { "└─" } else { "├─" };
    lines.push(format!("{prefix}{connector} {node}"));
    if path.contains(node) {
        lines.push(format!("{prefix}   ↻ cycle"));
        return;
    }
    rendered.insert(node);
    let descendants = children.get(node).cloned().unwrap_or_default();
    if descendants.is_empty() {
        return;
    }
    let next_prefix = if is_last {
        format!("{prefix}   ")
    } else {
        format!("{prefix}│  ")
    };
    let mut next_path = path.clone();
    next_path.insert(node);
    for (index, child) in descendants.iter().enumerate() {
        render_node(
            *child,
            &next_prefix,
            index == descendants.len() - 1,
            &next_path,
            children,
            rendered,
            lines,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::inert_task;
    use super::super::TaskRegistry;
    use super::*;

    fn registry(
        specs: Vec<(&'static str, &'static [&'static str])>,
    ) -> TaskRegistry<super::super::testing::RecordingContext> {
        let mut registry = TaskRegistry::new();
        for (name, deps) in specs {
            registry.register(inert_task(name, deps)).expect("unique");
        }
        registry
    }

    #[test]
    fn test_empty_registry_renders_empty() {
        let reg = registry(vec![]);
        assert_eq!(format_dependency_graph(&reg), "");
    }

    #[test]
    fn test_single_root_renders_bare() {
        let reg = registry(vec![("alone", &[])]);
        assert_eq!(format_dependency_graph(&reg), "alone");
    }

    #[test]
    fn test_chain_renders_nested_connectors() {
        let reg = registry(vec![("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let output = format_dependency_graph(&reg);
        assert_eq!(output, "a\n└─ b\n   └─ c");
    }

    #[test]
    fn test_diamond_renders_both_branches() {
        let reg = registry(vec![
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]);
        let output = format_dependency_graph(&reg);
        assert!(output.starts_with("a\n├─ b\n"));
        assert!(output.contains("└─ c"));
        // d appears under both unblocking branches.
        assert_eq!(output.matches(" d").count(), 2);
    }

    #[test]
    fn test_cycle_is_marked_at_first_revisit() {
        let reg = registry(vec![("a", &["b"]), ("b", &["a"])]);
        let output = format_dependency_graph(&reg);
        assert!(output.contains("↻ cycle"), "output was:\n{output}");
        assert!(output.starts_with('a'), "cycle entered at first name");
        assert!(output.contains("└─ b"));
    }

    #[test]
    fn test_multiple_roots_separated_by_blank_line() {
        let reg = registry(vec![("x", &[]), ("y", &[])]);
        assert_eq!(format_dependency_graph(&reg), "x\n\ny");
    }
}
