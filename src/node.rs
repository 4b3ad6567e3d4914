//! One module of the dependency graph

use crate::common::LookupError;
use crate::graph::LoaderServices;
use crate::import::{unify, ImportedModule};
use crate::managed::AssemblyReference;
use crate::resolver::SearchStrategy;
use crate::sxs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Handle of a node inside its `DependencyGraph`
pub type NodeId = usize;

/// Identity of a module occurrence: the same name resolved to the same file (or not resolved)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub module_name: String,
    pub filepath: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub(crate) module_name: String,
    pub(crate) filepath: Option<PathBuf>,
    pub(crate) search_strategy: SearchStrategy,
    pub(crate) recursion_level: usize,
    pub(crate) imports: Vec<ImportedModule>,
    pub(crate) assembly_references: Vec<AssemblyReference>,
    /// one edge per imported name, in import order
    pub(crate) resolved_children: Vec<NodeId>,
    /// one edge per import record, repeats included
    pub(crate) full_dependencies: Vec<NodeId>,
    pub(crate) resolved: bool,
    pub(crate) diagnostics: Vec<String>,
}

impl DependencyNode {
    pub(crate) fn new(
        module_name: &str,
        filepath: Option<PathBuf>,
        search_strategy: SearchStrategy,
        recursion_level: usize,
    ) -> Self {
        Self {
            module_name: module_name.to_owned(),
            filepath,
            search_strategy,
            recursion_level,
            imports: Vec::new(),
            assembly_references: Vec::new(),
            resolved_children: Vec::new(),
            full_dependencies: Vec::new(),
            resolved: false,
            diagnostics: Vec::new(),
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn filepath(&self) -> Option<&Path> {
        self.filepath.as_deref()
    }

    pub fn search_strategy(&self) -> SearchStrategy {
        self.search_strategy
    }

    /// Depth at which the module was first met
    pub fn recursion_level(&self) -> usize {
        self.recursion_level
    }

    pub fn imports(&self) -> &[ImportedModule] {
        &self.imports
    }

    pub fn assembly_references(&self) -> &[AssemblyReference] {
        &self.assembly_references
    }

    pub fn resolved_children(&self) -> &[NodeId] {
        &self.resolved_children
    }

    pub fn full_dependencies(&self) -> &[NodeId] {
        &self.full_dependencies
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Problems met while loading the module that did not stop the analysis
    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    pub fn key(&self) -> CacheKey {
        CacheKey {
            module_name: self.module_name.clone(),
            filepath: self.filepath.clone(),
        }
    }

    /// File path if resolved, else the module name
    pub fn identity(&self) -> String {
        match &self.filepath {
            Some(p) => p.to_string_lossy().into_owned(),
            None => self.module_name.clone(),
        }
    }

    /// Read the imports of the module file
    ///
    /// A module without file (not found) has no imports. Not being a managed image is expected
    /// and leaves the managed references empty.
    pub(crate) fn load(&mut self, services: &LoaderServices) -> Result<(), LookupError> {
        let path = match &self.filepath {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        let binary = services.loader.load(&path)?;

        let managed = if binary.recognized {
            match services.managed.read_managed(&path) {
                Ok(references) => Some(references),
                Err(LookupError::NotManagedImage(_)) => None,
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        self.imports = unify(&binary.imports, managed.as_ref());
        self.assembly_references = managed
            .map(|m| m.assembly_references)
            .unwrap_or_default();

        if let Some(manifest) = &binary.manifest {
            if let Err(e) = sxs::parse_manifest(manifest) {
                warn!(module = %self.module_name, error = %e, "malformed manifest");
                self.diagnostics.push(format!("malformed manifest: {}", e));
            }
        }

        debug!(
            module = %self.module_name,
            imports = self.imports.len(),
            depth = self.recursion_level,
            "module loaded"
        );
        Ok(())
    }
}
