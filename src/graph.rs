//! The dependency graph of a root binary: owns every module node, deduplicates them by
//! (name, path), and expands not-yet-seen modules depth-first in import order

use crate::common::LookupError;
use crate::managed::ManagedReader;
use crate::node::{CacheKey, DependencyNode, NodeId};
use crate::pe::BinaryLoader;
use crate::resolver::{ModuleResolver, Resolution, RootBinary, SearchStrategy};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// The external capabilities the graph needs to build itself
#[derive(Clone, Copy)]
pub struct LoaderServices<'a> {
    pub loader: &'a dyn BinaryLoader,
    pub managed: &'a dyn ManagedReader,
    pub resolver: &'a dyn ModuleResolver,
}

/// A module whose imports are being expanded, with the children still to visit
struct Frame {
    node: NodeId,
    pending: std::vec::IntoIter<NodeId>,
}

pub struct DependencyGraph<'a> {
    services: LoaderServices<'a>,
    root_binary: RootBinary,
    nodes: Vec<DependencyNode>,
    cache: HashMap<CacheKey, NodeId>,
    root: NodeId,
    max_recursion: usize,
    /// files already printed or exported during the current traversal
    pub(crate) visited: RefCell<HashSet<Option<PathBuf>>>,
}

impl<'a> DependencyGraph<'a> {
    /// Graph holding only the root module, not loaded yet
    pub fn new(services: LoaderServices<'a>, root_binary: RootBinary, max_recursion: usize) -> Self {
        let mut graph = Self {
            services,
            nodes: Vec::new(),
            cache: HashMap::new(),
            root: 0,
            max_recursion,
            visited: RefCell::new(HashSet::new()),
            root_binary,
        };
        let name = graph.root_binary.name.clone();
        let path = graph.root_binary.path.clone();
        graph.root = graph.get_or_create_node(&name, Some(path), SearchStrategy::Root, 0);
        graph
    }

    /// Resolve the whole dependency chain of the root binary
    ///
    /// `max_recursion` limits the depth of the expansion (0: unlimited).
    pub fn build(
        services: LoaderServices<'a>,
        root_binary: RootBinary,
        max_recursion: usize,
    ) -> Result<Self, LookupError> {
        let mut graph = Self::new(services, root_binary, max_recursion);
        graph.expand()?;
        Ok(graph)
    }

    /// Resolve a module name, always relative to the root binary
    pub fn resolve(&self, module_name: &str) -> Result<Resolution, LookupError> {
        let resolution = self.services.resolver.resolve(&self.root_binary, module_name)?;
        if resolution.strategy == SearchStrategy::NotFound {
            return Ok(Resolution::not_found());
        }
        Ok(resolution)
    }

    pub fn is_cached(&self, module_name: &str, filepath: Option<&Path>) -> bool {
        self.lookup(module_name, filepath).is_some()
    }

    pub fn lookup(&self, module_name: &str, filepath: Option<&Path>) -> Option<NodeId> {
        let key = CacheKey {
            module_name: module_name.to_owned(),
            filepath: filepath.map(Path::to_owned),
        };
        self.cache.get(&key).copied()
    }

    /// The node for (name, path): the cached one if any, else a new one
    pub fn get_or_create_node(
        &mut self,
        module_name: &str,
        filepath: Option<PathBuf>,
        strategy: SearchStrategy,
        recursion_level: usize,
    ) -> NodeId {
        let key = CacheKey {
            module_name: module_name.to_owned(),
            filepath,
        };
        if let Some(&id) = self.cache.get(&key) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(DependencyNode::new(
            module_name,
            key.filepath.clone(),
            strategy,
            recursion_level,
        ));
        self.cache.insert(key, id);
        id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn root_binary(&self) -> &RootBinary {
        &self.root_binary
    }

    pub fn node(&self, id: NodeId) -> &DependencyNode {
        &self.nodes[id]
    }

    /// All the nodes, in creation order
    pub fn nodes(&self) -> &[DependencyNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn max_recursion(&self) -> usize {
        self.max_recursion
    }

    /// The module table, ordered by search strategy (creation order within a strategy)
    pub fn modules(&self) -> Vec<&DependencyNode> {
        let mut modules: Vec<&DependencyNode> = self.nodes.iter().collect();
        modules.sort_by_key(|n| n.search_strategy());
        modules
    }

    /// Depth-first expansion from the root, with an explicit stack
    fn expand(&mut self) -> Result<(), LookupError> {
        let root = self.root;
        let first = match self.load_and_resolve(root) {
            Ok(children) => children,
            Err(e) => return Err(self.report_failure(e, root, &[])),
        };
        let mut stack = vec![Frame {
            node: root,
            pending: first.into_iter(),
        }];

        while let Some(frame) = stack.last_mut() {
            let child = match frame.pending.next() {
                Some(child) => child,
                None => {
                    stack.pop();
                    continue;
                }
            };
            match self.load_and_resolve(child) {
                Ok(children) => stack.push(Frame {
                    node: child,
                    pending: children.into_iter(),
                }),
                Err(e) => return Err(self.report_failure(e, child, &stack)),
            }
        }
        Ok(())
    }

    fn load_and_resolve(&mut self, id: NodeId) -> Result<Vec<NodeId>, LookupError> {
        self.nodes[id].load(&self.services)?;
        self.resolve_node(id)
    }

    /// Resolve the imports of a loaded node, and return the children that still need expansion
    ///
    /// Does nothing if the node was already resolved.
    fn resolve_node(&mut self, id: NodeId) -> Result<Vec<NodeId>, LookupError> {
        if self.nodes[id].resolved {
            return Ok(Vec::new());
        }
        let depth = self.nodes[id].recursion_level;
        let names: Vec<String> = self.nodes[id]
            .imports
            .iter()
            .map(|i| i.name.clone())
            .collect();

        let mut to_expand = Vec::new();
        for name in names {
            let resolution = self.resolve(&name)?;
            let already_cached = self.is_cached(&name, resolution.path.as_deref());
            let child = self.get_or_create_node(&name, resolution.path, resolution.strategy, depth + 1);

            let has_edge = self.nodes[id]
                .resolved_children
                .iter()
                .any(|&c| self.nodes[c].module_name == name);
            let node = &mut self.nodes[id];
            if !has_edge {
                node.resolved_children.push(child);
            }
            node.full_dependencies.push(child);
            if !already_cached {
                debug!(depth, parent = %node.module_name, module = %name, "new dependency");
                to_expand.push(child);
            }
        }

        self.nodes[id].resolved = true;
        if self.max_recursion > 0 && depth + 1 >= self.max_recursion {
            return Ok(Vec::new());
        }
        Ok(to_expand)
    }

    /// Log a failure once, and attach the modules from the failing one up to the root
    fn report_failure(&self, err: LookupError, failing: NodeId, stack: &[Frame]) -> LookupError {
        let identity = self.nodes[failing].identity();
        error!(module = %identity, error = %err, "unhandled failure while processing module");
        stack
            .iter()
            .rev()
            .fold(err.in_module(identity), |err, frame| {
                err.in_module(self.nodes[frame.node].identity())
            })
    }
}
