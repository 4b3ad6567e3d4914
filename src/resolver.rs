//! Boundary between the dependency graph and the module search: how a name was resolved, and
//! the context every resolution is relative to

use crate::common::LookupError;
use crate::pe::LoadedBinary;
use crate::sxs::{self, SxsEntries};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// How a module name was turned into a file, in loader precedence order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SearchStrategy {
    /// the analyzed binary itself
    Root,
    KnownDll,
    ApiSet,
    SideBySide,
    /// application dir, system dirs, working dir, PATH
    StandardSearch,
    NotFound,
}

impl fmt::Display for SearchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SearchStrategy::Root => "Root",
            SearchStrategy::KnownDll => "KnownDll",
            SearchStrategy::ApiSet => "ApiSet",
            SearchStrategy::SideBySide => "SideBySide",
            SearchStrategy::StandardSearch => "StandardSearch",
            SearchStrategy::NotFound => "NotFound",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub strategy: SearchStrategy,
    /// always None for `SearchStrategy::NotFound`
    pub path: Option<PathBuf>,
}

impl Resolution {
    pub fn found(strategy: SearchStrategy, path: PathBuf) -> Self {
        if strategy == SearchStrategy::NotFound {
            return Self::not_found();
        }
        Self {
            strategy,
            path: Some(path),
        }
    }

    pub fn not_found() -> Self {
        Self {
            strategy: SearchStrategy::NotFound,
            path: None,
        }
    }
}

/// The analyzed binary, as seen by the module search
#[derive(Debug, Clone)]
pub struct RootBinary {
    /// file name of the binary
    pub name: String,
    pub path: PathBuf,
    /// DLLs redirected by the binary's manifest
    pub sxs_entries: SxsEntries,
    /// set when the embedded manifest could not be parsed
    pub manifest_error: Option<String>,
}

impl RootBinary {
    pub fn new(path: &Path, sxs_entries: SxsEntries) -> Self {
        Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string_lossy().into_owned()),
            path: path.to_owned(),
            sxs_entries,
            manifest_error: None,
        }
    }

    /// Build the context of a loaded binary, collecting its side-by-side entries
    ///
    /// A malformed manifest is not fatal: it is logged, and the binary has no SxS entries.
    pub fn open(
        binary: &LoadedBinary,
        app_dir: &Path,
        win_dir: Option<&Path>,
    ) -> Result<Self, LookupError> {
        match sxs::entries_for(binary, app_dir, win_dir) {
            Ok(entries) => Ok(Self::new(&binary.path, entries)),
            Err(LookupError::XmlError(e)) => {
                warn!(path = %binary.path.display(), error = %e, "malformed manifest, ignoring side-by-side entries");
                let mut root = Self::new(&binary.path, SxsEntries::default());
                root.manifest_error = Some(e.to_string());
                Ok(root)
            }
            Err(e) => Err(e),
        }
    }
}

/// Capability to find the file the loader would map for a module name
pub trait ModuleResolver {
    /// Resolve `module_name`; the search is always relative to the root binary
    fn resolve(&self, root: &RootBinary, module_name: &str) -> Result<Resolution, LookupError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sxs::fixtures::binary_with_manifest;

    #[test]
    fn strategies_sort_in_precedence_order() {
        let mut strategies = vec![
            SearchStrategy::NotFound,
            SearchStrategy::StandardSearch,
            SearchStrategy::Root,
            SearchStrategy::SideBySide,
            SearchStrategy::ApiSet,
            SearchStrategy::KnownDll,
        ];
        strategies.sort();
        assert_eq!(
            strategies,
            vec![
                SearchStrategy::Root,
                SearchStrategy::KnownDll,
                SearchStrategy::ApiSet,
                SearchStrategy::SideBySide,
                SearchStrategy::StandardSearch,
                SearchStrategy::NotFound,
            ]
        );
        assert_eq!(SearchStrategy::SideBySide.to_string(), "SideBySide");
    }

    #[test]
    fn not_found_has_no_path() {
        let r = Resolution::found(SearchStrategy::NotFound, PathBuf::from("a.dll"));
        assert_eq!(r, Resolution::not_found());
    }

    #[test]
    fn malformed_root_manifest_is_recovered() -> Result<(), LookupError> {
        let binary = binary_with_manifest(Path::new("/app/app.exe"), "<assembly><file>");
        let root = RootBinary::open(&binary, Path::new("/app"), None)?;
        assert_eq!(root.name, "app.exe");
        assert!(root.sxs_entries.is_empty());
        assert!(root.manifest_error.is_some());
        Ok(())
    }
}
