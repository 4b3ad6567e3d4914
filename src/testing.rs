//! In-memory stand-ins for the binary loader, the managed reader and the module resolver

use crate::common::{path_to_string, LookupError};
use crate::graph::LoaderServices;
use crate::managed::{ManagedReader, ManagedReferences};
use crate::pe::{BinaryLoader, ImportDescriptor, LoadedBinary};
use crate::resolver::{ModuleResolver, Resolution, RootBinary, SearchStrategy};
use crate::sxs::SxsEntries;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

const APP_DIR: &str = "/app";
const SYSTEM_DIR: &str = "/windows/system32";

#[derive(Default)]
struct FakeModule {
    imports: Vec<String>,
    module_references: Option<Vec<String>>,
    manifest: Option<Vec<u8>>,
    fail: bool,
}

/// A fake system where every module lives in the application dir, unless it is a known DLL
#[derive(Default)]
pub(crate) struct FakeSystem {
    modules: HashMap<String, FakeModule>,
    known_dlls: HashSet<String>,
    loads: RefCell<HashMap<String, usize>>,
}

impl FakeSystem {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn module(mut self, name: &str, imports: &[&str]) -> Self {
        self.modules.entry(name.to_lowercase()).or_default().imports =
            imports.iter().map(|s| s.to_string()).collect();
        self
    }

    pub(crate) fn managed_module(mut self, name: &str, imports: &[&str], module_refs: &[&str]) -> Self {
        self = self.module(name, imports);
        if let Some(m) = self.modules.get_mut(&name.to_lowercase()) {
            m.module_references = Some(module_refs.iter().map(|s| s.to_string()).collect());
        }
        self
    }

    pub(crate) fn with_manifest(mut self, name: &str, manifest: &str) -> Self {
        self.modules.entry(name.to_lowercase()).or_default().manifest =
            Some(manifest.as_bytes().to_vec());
        self
    }

    pub(crate) fn known_dll(mut self, name: &str) -> Self {
        self.known_dlls.insert(name.to_lowercase());
        self
    }

    /// Loading this module fails with a scan error
    pub(crate) fn failing(mut self, name: &str) -> Self {
        self.modules.entry(name.to_lowercase()).or_default().fail = true;
        self
    }

    pub(crate) fn path_of(&self, name: &str) -> PathBuf {
        Path::new(APP_DIR).join(name)
    }

    pub(crate) fn known_path_of(&self, name: &str) -> PathBuf {
        Path::new(SYSTEM_DIR).join(name)
    }

    pub(crate) fn root(&self, name: &str) -> RootBinary {
        RootBinary::new(&self.path_of(name), SxsEntries::default())
    }

    pub(crate) fn services(&self) -> LoaderServices<'_> {
        LoaderServices {
            loader: self,
            managed: self,
            resolver: self,
        }
    }

    /// How many times a module file was loaded
    pub(crate) fn load_count(&self, name: &str) -> usize {
        self.loads
            .borrow()
            .get(&name.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    fn module_of(&self, path: &Path) -> Result<(String, &FakeModule), LookupError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match self.modules.get(&name) {
            Some(m) => Ok((name, m)),
            None => Err(LookupError::IOError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                path_to_string(path),
            ))),
        }
    }
}

impl BinaryLoader for FakeSystem {
    fn load(&self, path: &Path) -> Result<Rc<LoadedBinary>, LookupError> {
        let (name, module) = self.module_of(path)?;
        *self.loads.borrow_mut().entry(name).or_insert(0) += 1;
        if module.fail {
            return Err(LookupError::ScanError(format!(
                "injected failure for {}",
                path_to_string(path)
            )));
        }
        Ok(Rc::new(LoadedBinary {
            path: path.to_owned(),
            recognized: true,
            is_64: true,
            dll_name: None,
            imports: module
                .imports
                .iter()
                .map(|dll| ImportDescriptor {
                    dll: dll.clone(),
                    delay: false,
                    functions: Vec::new(),
                })
                .collect(),
            exports: Vec::new(),
            manifest: module.manifest.clone(),
            apiset_schema: None,
        }))
    }
}

impl ManagedReader for FakeSystem {
    fn read_managed(&self, path: &Path) -> Result<ManagedReferences, LookupError> {
        let (_, module) = self.module_of(path)?;
        match &module.module_references {
            Some(refs) => Ok(ManagedReferences {
                module_references: refs.clone(),
                assembly_references: Vec::new(),
            }),
            None => Err(LookupError::NotManagedImage(path_to_string(path))),
        }
    }
}

impl ModuleResolver for FakeSystem {
    fn resolve(&self, _root: &RootBinary, module_name: &str) -> Result<Resolution, LookupError> {
        let lower = module_name.to_lowercase();
        if self.known_dlls.contains(&lower) {
            return Ok(Resolution::found(
                SearchStrategy::KnownDll,
                self.known_path_of(module_name),
            ));
        }
        if self.modules.contains_key(&lower) {
            return Ok(Resolution::found(
                SearchStrategy::StandardSearch,
                self.path_of(module_name),
            ));
        }
        Ok(Resolution::not_found())
    }
}
