//! Printable reports for the actions of the command line tool
//!
//! Every report can be rendered as text (`PrettyPrint`) or serialized to JSON.

use crate::apiset::{ApisetEntry, ApisetMap};
use crate::common::LookupError;
use crate::graph::DependencyGraph;
use crate::managed::{AssemblyReference, ManagedReferences};
use crate::pe::{demangle_symbol, ExportedSymbol, ImportDescriptor, LoadedBinary};
use crate::resolver::SearchStrategy;
use crate::sxs::{self, SxsEntries};
use crate::system::WindowsSystem;
use serde::{Serialize, Serializer};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub trait PrettyPrint {
    fn pretty_print(&self, out: &mut dyn Write) -> io::Result<()>;
}

/// Write a report either as text or as indented JSON
pub fn print_report<R: PrettyPrint + Serialize>(
    report: &R,
    json: bool,
    out: &mut dyn Write,
) -> Result<(), LookupError> {
    if json {
        serde_json::to_writer_pretty(&mut *out, report)?;
        writeln!(out)?;
    } else {
        report.pretty_print(out)?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImportsReport {
    #[serde(skip)]
    filepath: PathBuf,
    imports: Vec<ImportDescriptor>,
}

impl ImportsReport {
    pub fn new(binary: &LoadedBinary) -> Self {
        Self {
            filepath: binary.path.clone(),
            imports: binary.imports.clone(),
        }
    }
}

impl PrettyPrint for ImportsReport {
    fn pretty_print(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "[-] Import listing for file : {}", self.filepath.display())?;
        for descriptor in &self.imports {
            writeln!(out, "Import from module {} :", descriptor.dll)?;
            let delay = if descriptor.delay { " (Delay Import)" } else { "" };
            for function in &descriptor.functions {
                match (&function.name, function.ordinal) {
                    (Some(name), _) => {
                        let readable = demangle_symbol(name).unwrap_or_else(|| name.clone());
                        writeln!(out, "\t Function {}{}", readable, delay)?
                    }
                    (None, Some(ordinal)) => writeln!(out, "\t Ordinal_{}{}", ordinal, delay)?,
                    (None, None) => writeln!(out, "\t ???{}", delay)?,
                }
            }
        }
        writeln!(out, "[-] Import listing done")
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExportsReport {
    #[serde(skip)]
    filepath: PathBuf,
    exports: Vec<ExportedSymbol>,
}

impl ExportsReport {
    pub fn new(binary: &LoadedBinary) -> Self {
        Self {
            filepath: binary.path.clone(),
            exports: binary.exports.clone(),
        }
    }
}

impl PrettyPrint for ExportsReport {
    fn pretty_print(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "[-] Export listing for file : {}", self.filepath.display())?;
        for export in &self.exports {
            writeln!(out, "Export {} :", export.ordinal)?;
            let name = export
                .name
                .as_deref()
                .map(|n| demangle_symbol(n).unwrap_or_else(|| n.to_owned()))
                .unwrap_or_default();
            writeln!(out, "\t Name : {}", name)?;
            writeln!(out, "\t VA : 0x{:X}", export.rva)?;
            if let Some(forwarded) = &export.forwarded_to {
                writeln!(out, "\t ForwardedName : {}", forwarded)?;
            }
        }
        writeln!(out, "[-] Export listing done")
    }
}

/// The embedded manifest, as text
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestReport {
    #[serde(skip)]
    filepath: PathBuf,
    manifest: Option<String>,
    #[serde(skip)]
    error: Option<String>,
}

impl ManifestReport {
    pub fn new(binary: &LoadedBinary) -> Self {
        let error = binary
            .manifest
            .as_ref()
            .and_then(|m| sxs::parse_manifest(m).err())
            .map(|e| e.to_string());
        Self {
            filepath: binary.path.clone(),
            manifest: binary.manifest.as_deref().map(sxs::manifest_text),
            error,
        }
    }
}

impl PrettyPrint for ManifestReport {
    fn pretty_print(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "[-] Manifest for file : {}", self.filepath.display())?;
        let manifest = match &self.manifest {
            Some(m) => m,
            None => {
                return writeln!(
                    out,
                    "[x] No embedded pe manifest for file {}",
                    self.filepath.display()
                )
            }
        };
        if let Some(error) = &self.error {
            writeln!(
                out,
                "[x] \"Malformed\" pe manifest for file {} : {}",
                self.filepath.display(),
                manifest
            )?;
            return writeln!(out, "[x] Error : {}", error);
        }
        writeln!(out, "{}", manifest.trim_end())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SxsReport {
    #[serde(skip)]
    filepath: PathBuf,
    sxs: SxsEntries,
}

impl SxsReport {
    pub fn new(filepath: &Path, entries: SxsEntries) -> Self {
        Self {
            filepath: filepath.to_owned(),
            sxs: entries,
        }
    }
}

impl PrettyPrint for SxsReport {
    fn pretty_print(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "[-] sxs dependencies for executable : {}",
            self.filepath.display()
        )?;
        for entry in self.sxs.iter() {
            match &entry.path {
                Some(p) => writeln!(out, "  [+] {} : {}", entry.name, p.display())?,
                None => writeln!(out, "  [x] {} : ???", entry.name)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModuleRefsReport {
    #[serde(skip)]
    filepath: PathBuf,
    module_references: Vec<String>,
}

impl ModuleRefsReport {
    pub fn new(filepath: &Path, references: &ManagedReferences) -> Self {
        Self {
            filepath: filepath.to_owned(),
            module_references: references.module_references.clone(),
        }
    }
}

impl PrettyPrint for ModuleRefsReport {
    fn pretty_print(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "[-] Module references listing for file : {}",
            self.filepath.display()
        )?;
        for name in &self.module_references {
            writeln!(out, "Import module {} :", name)?;
        }
        writeln!(out, "[-] Import listing done")
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AssemblyRefsReport {
    #[serde(skip)]
    filepath: PathBuf,
    assembly_references: Vec<AssemblyReference>,
}

impl AssemblyRefsReport {
    pub fn new(filepath: &Path, references: &ManagedReferences) -> Self {
        Self {
            filepath: filepath.to_owned(),
            assembly_references: references.assembly_references.clone(),
        }
    }
}

impl PrettyPrint for AssemblyRefsReport {
    fn pretty_print(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "[-] Assembly references listing for file : {}",
            self.filepath.display()
        )?;
        for reference in &self.assembly_references {
            writeln!(out, "Import assembly {} ({}) :", reference.name, reference.version)?;
        }
        writeln!(out, "[-] Import listing done")
    }
}

#[derive(Debug, Serialize)]
pub struct KnownDllsReport {
    x64: Vec<PathBuf>,
    x86: Vec<PathBuf>,
}

impl KnownDllsReport {
    pub fn new(system: &WindowsSystem) -> Self {
        Self {
            x64: system
                .known_dlls
                .as_ref()
                .map(|k| k.paths())
                .unwrap_or_default(),
            x86: system
                .known_dlls_wow64
                .as_ref()
                .map(|k| k.paths())
                .unwrap_or_default(),
        }
    }
}

impl PrettyPrint for KnownDllsReport {
    fn pretty_print(&self, out: &mut dyn Write) -> io::Result<()> {
        for (title, paths) in [("64-bit", &self.x64), ("32-bit", &self.x86)] {
            writeln!(out, "[-] {} KnownDlls : ", title)?;
            for p in paths {
                writeln!(out, "  {}", p.display())?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApisetsReport {
    schema: Vec<ApisetEntry>,
}

impl ApisetsReport {
    pub fn new(map: &ApisetMap) -> Self {
        Self {
            schema: map.entries().into_iter().cloned().collect(),
        }
    }
}

impl PrettyPrint for ApisetsReport {
    fn pretty_print(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "[-] Api Sets Map : ")?;
        for entry in &self.schema {
            let hosts: Vec<&str> = entry
                .hosts
                .iter()
                .map(|h| h.host.as_str())
                .filter(|h| !h.is_empty())
                .collect();
            writeln!(out, "{} -> [ {} ]", entry.name, hosts.join(","))?;
        }
        writeln!(out)
    }
}

/// The whole dependency chain: printed as a tree, serialized as the structured export
pub struct ChainReport<'g, 'a> {
    graph: &'g DependencyGraph<'a>,
}

impl<'g, 'a> ChainReport<'g, 'a> {
    pub fn new(graph: &'g DependencyGraph<'a>) -> Self {
        Self { graph }
    }
}

impl PrettyPrint for ChainReport<'_, '_> {
    fn pretty_print(&self, out: &mut dyn Write) -> io::Result<()> {
        self.graph.full_print(out)
    }
}

impl Serialize for ChainReport<'_, '_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.graph.export().serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModuleEntry {
    pub module_name: String,
    pub filepath: Option<PathBuf>,
    pub search_strategy: SearchStrategy,
}

/// Every module met while resolving the chain, ordered by search strategy
#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct ModulesReport {
    modules: Vec<ModuleEntry>,
}

impl ModulesReport {
    pub fn new(graph: &DependencyGraph) -> Self {
        Self {
            modules: graph
                .modules()
                .into_iter()
                .map(|n| ModuleEntry {
                    module_name: n.module_name().to_owned(),
                    filepath: n.filepath().map(Path::to_owned),
                    search_strategy: n.search_strategy(),
                })
                .collect(),
        }
    }

    pub fn modules(&self) -> &[ModuleEntry] {
        &self.modules
    }
}

impl PrettyPrint for ModulesReport {
    fn pretty_print(&self, out: &mut dyn Write) -> io::Result<()> {
        for m in &self.modules {
            writeln!(
                out,
                "[{}] {} : {}",
                m.search_strategy,
                m.module_name,
                m.filepath
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apiset::ApisetHost;
    use crate::pe::ImportedFunction;
    use crate::sxs::SxsEntry;
    use crate::testing::FakeSystem;

    fn rendered<R: PrettyPrint + Serialize>(report: &R, json: bool) -> Result<String, LookupError> {
        let mut out = Vec::new();
        print_report(report, json, &mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn binary(imports: Vec<ImportDescriptor>, manifest: Option<&str>) -> LoadedBinary {
        LoadedBinary {
            path: PathBuf::from("app.exe"),
            recognized: true,
            is_64: true,
            dll_name: None,
            imports,
            exports: vec![ExportedSymbol {
                ordinal: 3,
                name: Some("Run".to_owned()),
                rva: 0x1a30,
                forwarded_to: None,
            }],
            manifest: manifest.map(|m| m.as_bytes().to_vec()),
            apiset_schema: None,
        }
    }

    #[test]
    fn imports_listing() -> Result<(), LookupError> {
        let imports = vec![
            ImportDescriptor {
                dll: "KERNEL32.dll".to_owned(),
                delay: false,
                functions: vec![
                    ImportedFunction {
                        name: Some("GetLastError".to_owned()),
                        ordinal: None,
                    },
                    ImportedFunction {
                        name: None,
                        ordinal: Some(12),
                    },
                ],
            },
            ImportDescriptor {
                dll: "shell32.dll".to_owned(),
                delay: true,
                functions: vec![ImportedFunction {
                    name: Some("ShellExecuteW".to_owned()),
                    ordinal: None,
                }],
            },
        ];
        let text = rendered(&ImportsReport::new(&binary(imports, None)), false)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "[-] Import listing for file : app.exe",
                "Import from module KERNEL32.dll :",
                "\t Function GetLastError",
                "\t Ordinal_12",
                "Import from module shell32.dll :",
                "\t Function ShellExecuteW (Delay Import)",
                "[-] Import listing done",
            ]
        );
        Ok(())
    }

    #[test]
    fn exports_listing() -> Result<(), LookupError> {
        let text = rendered(&ExportsReport::new(&binary(Vec::new(), None)), false)?;
        assert!(text.contains("Export 3 :\n\t Name : Run\n\t VA : 0x1A30\n"));
        let json = rendered(&ExportsReport::new(&binary(Vec::new(), None)), true)?;
        assert!(json.contains("\"Exports\""));
        assert!(!json.contains("app.exe"));
        Ok(())
    }

    #[test]
    fn manifest_states() -> Result<(), LookupError> {
        let none = rendered(&ManifestReport::new(&binary(Vec::new(), None)), false)?;
        assert!(none.contains("[x] No embedded pe manifest for file app.exe"));

        let good = "<assembly manifestVersion=\"1.0\"></assembly>";
        let text = rendered(&ManifestReport::new(&binary(Vec::new(), Some(good))), false)?;
        assert!(text.ends_with(&format!("{}\n", good)));

        let broken = rendered(
            &ManifestReport::new(&binary(Vec::new(), Some("<assembly"))),
            false,
        )?;
        assert!(broken.contains("\"Malformed\" pe manifest"));
        Ok(())
    }

    #[test]
    fn sxs_listing() -> Result<(), LookupError> {
        let entries = SxsEntries(vec![
            SxsEntry {
                name: "comctl32.dll".to_owned(),
                path: Some(PathBuf::from("comctl32.dll")),
            },
            SxsEntry {
                name: "missing.dll".to_owned(),
                path: None,
            },
        ]);
        let text = rendered(&SxsReport::new(Path::new("app.exe"), entries), false)?;
        assert!(text.contains("  [+] comctl32.dll : comctl32.dll\n"));
        assert!(text.contains("  [x] missing.dll : ???\n"));
        Ok(())
    }

    #[test]
    fn apisets_listing() -> Result<(), LookupError> {
        let map = ApisetMap::from_entries(vec![ApisetEntry {
            name: "api-ms-win-core-synch-l1-2-0".to_owned(),
            hosts: vec![
                ApisetHost {
                    importer: None,
                    host: "kernelbase.dll".to_owned(),
                },
                ApisetHost {
                    importer: Some("kernel32.dll".to_owned()),
                    host: "kernel32.dll".to_owned(),
                },
            ],
        }]);
        let text = rendered(&ApisetsReport::new(&map), false)?;
        assert!(text.contains("api-ms-win-core-synch-l1-2-0 -> [ kernelbase.dll,kernel32.dll ]"));
        Ok(())
    }

    #[test]
    fn modules_ordered_by_strategy() -> Result<(), LookupError> {
        let fake = FakeSystem::new()
            .module("a.exe", &["b.dll", "missing.dll", "kernel32.dll"])
            .module("b.dll", &[])
            .module("kernel32.dll", &[])
            .known_dll("kernel32.dll");
        let graph = DependencyGraph::build(fake.services(), fake.root("a.exe"), 0)?;
        let report = ModulesReport::new(&graph);
        let strategies: Vec<SearchStrategy> =
            report.modules().iter().map(|m| m.search_strategy).collect();
        assert_eq!(
            strategies,
            vec![
                SearchStrategy::Root,
                SearchStrategy::KnownDll,
                SearchStrategy::StandardSearch,
                SearchStrategy::NotFound
            ]
        );
        let text = rendered(&report, false)?;
        assert_eq!(text.lines().last(), Some("[NotFound] missing.dll : "));

        let json: serde_json::Value = serde_json::from_str(&rendered(&report, true)?)?;
        assert_eq!(json[0]["ModuleName"], "a.exe");
        Ok(())
    }

    #[test]
    fn chain_as_json() -> Result<(), LookupError> {
        let fake = FakeSystem::new()
            .module("a.exe", &["b.dll"])
            .module("b.dll", &["a.exe"]);
        let graph = DependencyGraph::build(fake.services(), fake.root("a.exe"), 0)?;
        let json: serde_json::Value =
            serde_json::from_str(&rendered(&ChainReport::new(&graph), true)?)?;
        assert_eq!(json["Root"]["ModuleName"], "a.exe");
        assert_eq!(json["Root"]["Dependencies"][0]["ModuleName"], "b.dll");
        assert_eq!(json["MaxRecursion"], 0);
        Ok(())
    }
}
