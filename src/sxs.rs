//! Side-by-side (SxS) assemblies: manifest parsing and discovery of the DLLs that a manifest
//! redirects to a private or a WinSxS assembly folder
//!
//! https://docs.microsoft.com/en-us/windows/win32/sbscs/assembly-searching-sequence

use crate::common::LookupError;
use crate::pe::LoadedBinary;
use fs_err as fs;
use glob::{MatchOptions, Pattern};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssemblyIdentity {
    pub name: String,
    pub version: Option<String>,
    pub processor_architecture: Option<String>,
    pub public_key_token: Option<String>,
    pub language: Option<String>,
}

/// The parts of an application or assembly manifest relevant for DLL redirection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub identity: Option<AssemblyIdentity>,
    /// DLLs shipped with (and redirected to) the assembly
    pub files: Vec<String>,
    pub dependent_assemblies: Vec<AssemblyIdentity>,
}

fn parse_identity(node: roxmltree::Node) -> Option<AssemblyIdentity> {
    let attribute = |name: &str| node.attribute(name).map(str::to_owned);
    Some(AssemblyIdentity {
        name: attribute("name")?,
        version: attribute("version"),
        processor_architecture: attribute("processorArchitecture"),
        public_key_token: attribute("publicKeyToken"),
        language: attribute("language"),
    })
}

fn child<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
}

/// Decode manifest bytes to text (UTF-8, with or without BOM)
pub fn manifest_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Parse a manifest; element names are matched regardless of their namespace
pub fn parse_manifest(bytes: &[u8]) -> Result<Manifest, LookupError> {
    let text = manifest_text(bytes);
    let doc = roxmltree::Document::parse(text.trim_start())?;
    let root = doc.root_element();

    let identity = child(root, "assemblyIdentity").and_then(parse_identity);
    let files = root
        .children()
        .filter(|c| c.is_element() && c.tag_name().name() == "file")
        .filter_map(|f| f.attribute("name").map(str::to_owned))
        .collect();
    let dependent_assemblies = root
        .descendants()
        .filter(|d| d.is_element() && d.tag_name().name() == "dependentAssembly")
        .filter_map(|d| child(d, "assemblyIdentity").and_then(parse_identity))
        .collect();

    Ok(Manifest {
        identity,
        files,
        dependent_assemblies,
    })
}

/// A DLL redirected by a manifest; `path` is None if the assembly providing it was not found
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SxsEntry {
    pub name: String,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SxsEntries(pub Vec<SxsEntry>);

impl SxsEntries {
    /// Entry for a DLL name, compared case-insensitively
    pub fn find(&self, dll_name: &str) -> Option<&SxsEntry> {
        self.0.iter().find(|e| e.name.eq_ignore_ascii_case(dll_name))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SxsEntry> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Find the manifest of an assembly: private assemblies in the application directory first,
/// then the WinSxS store
pub fn locate_assembly(
    identity: &AssemblyIdentity,
    app_dir: &Path,
    win_dir: Option<&Path>,
) -> Result<Option<PathBuf>, LookupError> {
    let private_candidates = [
        app_dir.join(format!("{}.manifest", identity.name)),
        app_dir
            .join(&identity.name)
            .join(format!("{}.manifest", identity.name)),
    ];
    if let Some(found) = private_candidates.iter().find(|c| c.is_file()) {
        return Ok(Some(found.clone()));
    }

    let manifests_dir = match win_dir {
        Some(win_dir) => win_dir.join("WinSxS").join("Manifests"),
        None => return Ok(None),
    };
    if !manifests_dir.is_dir() {
        return Ok(None);
    }

    let component = |value: &Option<String>, default: &str| match value.as_deref() {
        None | Some("*") => default.to_owned(),
        Some(v) => Pattern::escape(&v.to_lowercase()),
    };
    let pattern = format!(
        "{}/{}_{}_{}_{}_*.manifest",
        Pattern::escape(&manifests_dir.to_string_lossy()),
        component(&identity.processor_architecture, "*"),
        Pattern::escape(&identity.name.to_lowercase()),
        component(&identity.public_key_token, "none"),
        component(&identity.version, "*"),
    );
    let options = MatchOptions {
        case_sensitive: false,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    let mut matches: Vec<PathBuf> = glob::glob_with(&pattern, options)?
        .filter_map(Result::ok)
        .collect();
    matches.sort();
    Ok(matches.pop())
}

/// Folder holding the files of the assembly described by `manifest_path`
fn assembly_folder(manifest_path: &Path) -> Option<PathBuf> {
    let parent = manifest_path.parent()?;
    let is_winsxs = parent
        .file_name()
        .map(|n| n.eq_ignore_ascii_case("Manifests"))
        .unwrap_or(false);
    if is_winsxs {
        Some(parent.parent()?.join(manifest_path.file_stem()?))
    } else {
        Some(parent.to_owned())
    }
}

fn assembly_entries(
    identity: &AssemblyIdentity,
    app_dir: &Path,
    win_dir: Option<&Path>,
) -> Result<Vec<SxsEntry>, LookupError> {
    let manifest_path = match locate_assembly(identity, app_dir, win_dir)? {
        Some(p) => p,
        None => {
            debug!(assembly = %identity.name, "side-by-side assembly not found");
            return Ok(vec![SxsEntry {
                name: identity.name.clone(),
                path: None,
            }]);
        }
    };
    let folder = match assembly_folder(&manifest_path) {
        Some(f) => f,
        None => return Ok(Vec::new()),
    };
    let manifest = match parse_manifest(&fs::read(&manifest_path)?) {
        Ok(m) => m,
        Err(e) => {
            warn!(path = %manifest_path.display(), error = %e, "malformed assembly manifest");
            return Ok(Vec::new());
        }
    };
    Ok(manifest
        .files
        .into_iter()
        .map(|f| SxsEntry {
            path: Some(folder.join(&f)),
            name: f,
        })
        .collect())
}

/// DLLs redirected by the embedded manifest of a binary
///
/// Fails with `LookupError::XmlError` if the manifest of the binary itself can't be parsed.
pub fn entries_for(
    binary: &LoadedBinary,
    app_dir: &Path,
    win_dir: Option<&Path>,
) -> Result<SxsEntries, LookupError> {
    let manifest = match &binary.manifest {
        Some(bytes) => parse_manifest(bytes)?,
        None => return Ok(SxsEntries::default()),
    };

    let mut entries: Vec<SxsEntry> = manifest
        .files
        .iter()
        .map(|f| SxsEntry {
            name: f.clone(),
            path: Some(app_dir.join(f)),
        })
        .collect();
    for identity in &manifest.dependent_assemblies {
        entries.extend(assembly_entries(identity, app_dir, win_dir)?);
    }
    Ok(SxsEntries(entries))
}
