//! Uniform view over the two sources of module imports: the native import table and the
//! module references of managed images

use crate::managed::ManagedReferences;
use crate::pe::ImportDescriptor;
use serde::Serialize;

/// Name of a module imported by a binary, whatever the kind of import
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportedModule {
    pub name: String,
}

impl From<&ImportDescriptor> for ImportedModule {
    fn from(i: &ImportDescriptor) -> Self {
        Self {
            name: i.dll.clone(),
        }
    }
}

/// Native imports first, then managed module references, each in their own order
///
/// Duplicated names are kept: they are collapsed when the imports are resolved.
pub fn unify(native: &[ImportDescriptor], managed: Option<&ManagedReferences>) -> Vec<ImportedModule> {
    let managed_modules = managed
        .into_iter()
        .flat_map(|m| m.module_references.iter())
        .map(|name| ImportedModule { name: name.clone() });
    native
        .iter()
        .map(ImportedModule::from)
        .chain(managed_modules)
        .collect()
}
