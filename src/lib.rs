extern crate thiserror;

pub mod apiset;
pub mod common;
pub mod graph;
pub mod image;
pub mod import;
#[cfg(windows)]
pub mod knowndlls;
pub mod lookup_path;
pub mod managed;
pub mod node;
pub mod pe;
pub mod query;
pub mod report;
pub mod resolver;
pub mod sxs;
pub mod system;
pub mod traversal;

#[cfg(test)]
mod testing;

pub use common::{decanonicalize, path_to_string, readable_canonical_path, LookupError};
pub use graph::{DependencyGraph, LoaderServices};
pub use lookup_path::LookupPath;
pub use node::{DependencyNode, NodeId};
pub use query::LookupQuery;
pub use resolver::{ModuleResolver, Resolution, RootBinary, SearchStrategy};
pub use traversal::{ExportedGraph, ExportedNode};
