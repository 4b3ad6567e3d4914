//! Printing and structured export of a dependency graph
//!
//! Both walks expand each module file once per pass; later occurrences are printed (or
//! exported) as back-reference leaves. Printing never marks the root itself, the export does.
//! The set of files seen is reset at the start of every pass and is independent from the
//! resolution cache.

use crate::graph::DependencyGraph;
use crate::node::NodeId;
use crate::resolver::SearchStrategy;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::PathBuf;

/// A module in the structured export; `dependencies` is empty for back-references
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExportedNode {
    pub module_name: String,
    pub filepath: Option<PathBuf>,
    pub search_strategy: SearchStrategy,
    pub dependencies: Vec<ExportedNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExportedGraph {
    pub root: ExportedNode,
    pub max_recursion: usize,
}

struct ExportFrame {
    node: NodeId,
    pending: std::vec::IntoIter<NodeId>,
    built: Vec<ExportedNode>,
}

impl DependencyGraph<'_> {
    pub fn reset_visited(&self) {
        self.visited.borrow_mut().clear();
    }

    /// true the first time the file of this node is met during the current pass
    pub fn mark_visited(&self, id: NodeId) -> bool {
        self.visited
            .borrow_mut()
            .insert(self.node(id).filepath().map(|p| p.to_owned()))
    }

    fn exported_leaf(&self, id: NodeId) -> ExportedNode {
        let node = self.node(id);
        ExportedNode {
            module_name: node.module_name().to_owned(),
            filepath: node.filepath().map(|p| p.to_owned()),
            search_strategy: node.search_strategy(),
            dependencies: Vec::new(),
        }
    }

    /// Print the tree of resolved modules, one line per edge
    ///
    /// Only the children are marked as visited: a module importing the root expands it once more.
    pub fn full_print(&self, out: &mut dyn Write) -> io::Result<()> {
        self.reset_visited();
        let root = self.root();
        self.print_line(out, root, 0)?;
        let mut stack: Vec<(NodeId, usize)> = self.children_of(root, 1);
        while let Some((id, depth)) = stack.pop() {
            self.print_line(out, id, depth)?;
            if self.mark_visited(id) {
                stack.extend(self.children_of(id, depth + 1));
            }
        }
        Ok(())
    }

    fn print_line(&self, out: &mut dyn Write, id: NodeId, depth: usize) -> io::Result<()> {
        let node = self.node(id);
        writeln!(
            out,
            "{}├ {} ({}) : {}",
            "|  ".repeat(depth),
            node.module_name(),
            node.search_strategy(),
            node.filepath()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        )
    }

    /// children in reverse order, so that popping them yields the import order
    fn children_of(&self, id: NodeId, depth: usize) -> Vec<(NodeId, usize)> {
        self.node(id)
            .resolved_children()
            .iter()
            .rev()
            .map(|&c| (c, depth))
            .collect()
    }

    /// Structured form of the graph
    ///
    /// Modules met for the first time list every import edge (repeats included), the others
    /// are leaves.
    pub fn export(&self) -> ExportedGraph {
        self.reset_visited();
        let root = self.root();
        let mut stack = vec![self.export_frame(root)];
        let mut exported_root = None;

        while let Some(mut frame) = stack.pop() {
            match frame.pending.next() {
                Some(child) if self.mark_visited(child) => {
                    let next = self.export_frame_unmarked(child);
                    stack.push(frame);
                    stack.push(next);
                }
                Some(child) => {
                    frame.built.push(self.exported_leaf(child));
                    stack.push(frame);
                }
                None => {
                    let mut exported = self.exported_leaf(frame.node);
                    exported.dependencies = frame.built;
                    match stack.last_mut() {
                        Some(parent) => parent.built.push(exported),
                        None => exported_root = Some(exported),
                    }
                }
            }
        }

        ExportedGraph {
            root: exported_root.unwrap_or_else(|| self.exported_leaf(root)),
            max_recursion: self.max_recursion(),
        }
    }

    fn export_frame(&self, id: NodeId) -> ExportFrame {
        if self.mark_visited(id) {
            self.export_frame_unmarked(id)
        } else {
            ExportFrame {
                node: id,
                pending: Vec::new().into_iter(),
                built: Vec::new(),
            }
        }
    }

    fn export_frame_unmarked(&self, id: NodeId) -> ExportFrame {
        ExportFrame {
            node: id,
            pending: self.node(id).full_dependencies().to_vec().into_iter(),
            built: Vec::new(),
        }
    }
}
