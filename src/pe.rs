//! Low-level PE file format access through the goblin and pelite libraries, and the binary
//! loader the dependency graph relies on

use crate::apiset::{self, ApisetMap};
use crate::common::LookupError;
use crate::image::PeImage;
use fs_err as fs;
use pelite::resources::{FindError, Name, Resources};
use pelite::PeFile;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, warn};

/// A function imported from a DLL, either by name or by ordinal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportedFunction {
    pub name: Option<String>,
    pub ordinal: Option<u16>,
}

/// One entry of the import table (or of the delay-load import table)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportDescriptor {
    pub dll: String,
    pub delay: bool,
    pub functions: Vec<ImportedFunction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedSymbol {
    pub ordinal: u32,
    pub name: Option<String>,
    pub rva: u32,
    pub forwarded_to: Option<String>,
}

/// Everything the dependency resolution needs to know about a file on disk
#[derive(Debug, Clone)]
pub struct LoadedBinary {
    pub path: PathBuf,
    /// false if the file is not a PE image at all; in that case it has no imports
    pub recognized: bool,
    pub is_64: bool,
    /// DLL name as specified in the export directory
    pub dll_name: Option<String>,
    /// standard imports first, then delay-load imports, each in table order
    pub imports: Vec<ImportDescriptor>,
    pub exports: Vec<ExportedSymbol>,
    /// raw bytes of the embedded manifest
    pub manifest: Option<Vec<u8>>,
    /// only present in apisetschema.dll
    pub apiset_schema: Option<ApisetMap>,
}

impl LoadedBinary {
    fn unrecognized(path: &Path) -> Self {
        Self {
            path: path.to_owned(),
            recognized: false,
            is_64: false,
            dll_name: None,
            imports: Vec::new(),
            exports: Vec::new(),
            manifest: None,
            apiset_schema: None,
        }
    }
}

/// Capability to open a binary and extract its import/export information
pub trait BinaryLoader {
    fn load(&self, path: &Path) -> Result<Rc<LoadedBinary>, LookupError>;
}

/// Group the flat goblin import list by DLL, keeping the table order
fn group_imports(imports: &[goblin::pe::import::Import]) -> Vec<ImportDescriptor> {
    let mut descriptors: Vec<ImportDescriptor> = Vec::new();
    for i in imports {
        // goblin names by-ordinal imports "ORDINAL <n>"
        let function = if i.name.starts_with("ORDINAL ") {
            ImportedFunction {
                name: None,
                ordinal: Some(i.ordinal),
            }
        } else {
            ImportedFunction {
                name: Some(i.name.to_string()),
                ordinal: None,
            }
        };
        match descriptors.last_mut() {
            Some(d) if d.dll == i.dll => d.functions.push(function),
            _ => descriptors.push(ImportDescriptor {
                dll: i.dll.to_owned(),
                delay: false,
                functions: vec![function],
            }),
        }
    }
    descriptors
}

/// Name the DLL declares for itself, and its exported symbols in ordinal order
fn read_exports(file: &PeFile) -> Result<(Option<String>, Vec<ExportedSymbol>), LookupError> {
    let exports = match file.exports() {
        Ok(exports) => exports,
        // there is no export directory, e.g. in case of an executable
        Err(pelite::Error::Null) => return Ok((None, Vec::new())),
        Err(e) => return Err(e.into()),
    };
    let dll_name = match exports.dll_name() {
        Ok(name) => Some(String::from_utf8_lossy(name).into_owned()),
        Err(pelite::Error::Null) => None,
        Err(e) => return Err(e.into()),
    };
    let directory = file
        .data_directory()
        .get(pelite::image::IMAGE_DIRECTORY_ENTRY_EXPORT)
        .ok_or(pelite::Error::Bounds)?;
    let ordinal_base = exports.image().Base;

    let by = exports.by()?;
    let mut names_by_index: Vec<Option<String>> = vec![None; by.functions().len()];
    for (name, index) in by.iter_name_indices() {
        if let Some(slot) = names_by_index.get_mut(index) {
            let name = String::from_utf8_lossy(name?).into_owned();
            slot.get_or_insert(name);
        }
    }

    let mut symbols = Vec::new();
    for (index, (&rva, name)) in by.functions().iter().zip(names_by_index).enumerate() {
        if rva == 0 {
            continue;
        }
        // forwarders point back into the export directory
        let forwarded_to = match rva.checked_sub(directory.VirtualAddress) {
            Some(offset) if offset < directory.Size => Some(
                String::from_utf8_lossy(file.derva_c_str(rva)?).into_owned(),
            ),
            _ => None,
        };
        let ordinal = u32::try_from(index)
            .ok()
            .and_then(|index| ordinal_base.checked_add(index))
            .ok_or_else(|| {
                LookupError::MalformedImage(format!("export ordinal base {:#x} overflows", ordinal_base))
            })?;
        symbols.push(ExportedSymbol {
            ordinal,
            name,
            rva,
            forwarded_to,
        });
    }

    Ok((dll_name, symbols))
}

fn find_manifest<'a>(resources: &Resources<'a>) -> Result<&'a [u8], FindError> {
    Ok(resources
        .root()?
        .get_dir(Name::MANIFEST)?
        .first_dir()?
        .first_data()?
        .bytes()?)
}

/// Raw bytes of the first RT_MANIFEST resource
fn read_manifest<'a>(file: &PeFile<'a>) -> Result<Option<&'a [u8]>, LookupError> {
    let resources = match file.resources() {
        Ok(resources) => resources,
        Err(pelite::Error::Null) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match find_manifest(&resources) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(FindError::NotFound) => Ok(None),
        Err(FindError::Pe(e)) => Err(e.into()),
        Err(e) => Err(LookupError::MalformedImage(format!(
            "manifest resource: {}",
            e
        ))),
    }
}

/// Parse the content of a file
///
/// Files which are not PE images are not an error: they are returned with `recognized == false`
/// and no imports.
pub fn parse_binary(path: &Path, bytes: &[u8]) -> Result<LoadedBinary, LookupError> {
    if !bytes.starts_with(b"MZ") {
        debug!(path = %path.display(), "not a PE file, skipping import extraction");
        return Ok(LoadedBinary::unrecognized(path));
    }

    // prefer goblin for the import table since it seems to be less fragile
    let peobject = match goblin::Object::parse(bytes) {
        Ok(goblin::Object::PE(pe)) => pe,
        Ok(_) | Err(goblin::error::Error::BadMagic(_)) => {
            debug!(path = %path.display(), "unexpected executable format, skipping import extraction");
            return Ok(LoadedBinary::unrecognized(path));
        }
        Err(e) => return Err(e.into()),
    };

    let image = PeImage::parse(bytes)?;
    let file = PeFile::from_bytes(bytes)?;
    let mut imports = group_imports(&peobject.imports);
    imports.extend(image.delay_imports()?);

    // a broken export table only costs the export listing
    let (dll_name, exports) = match read_exports(&file) {
        Ok(exports) => exports,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable export directory");
            (None, Vec::new())
        }
    };

    let manifest = match read_manifest(&file) {
        Ok(m) => m.map(<[u8]>::to_vec),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable manifest resource");
            None
        }
    };

    let has_apiset_section = peobject
        .sections
        .iter()
        .any(|s| s.name().map(|n| n == ".apiset").unwrap_or(false));
    let apiset_schema = if has_apiset_section {
        apiset::parse_apiset_image(bytes)?
    } else {
        None
    };

    Ok(LoadedBinary {
        path: path.to_owned(),
        recognized: true,
        is_64: image.is_64(),
        dll_name,
        imports,
        exports,
        manifest,
        apiset_schema,
    })
}

/// Default binary loader
///
/// With `use_cache` the whole file is read in memory (so it's not kept mapped, nor locked) and
/// the parsed content is kept for further requests; otherwise the file is mapped and parsed on
/// every request.
pub struct BinaryCache {
    use_cache: bool,
    entries: RefCell<HashMap<PathBuf, Rc<LoadedBinary>>>,
}

impl BinaryCache {
    pub fn new(use_cache: bool) -> Self {
        Self {
            use_cache,
            entries: RefCell::new(HashMap::new()),
        }
    }

    pub fn is_caching(&self) -> bool {
        self.use_cache
    }
}

impl BinaryLoader for BinaryCache {
    fn load(&self, path: &Path) -> Result<Rc<LoadedBinary>, LookupError> {
        if !self.use_cache {
            let filemap = pelite::FileMap::open(path)?;
            return Ok(Rc::new(parse_binary(path, filemap.as_ref())?));
        }

        if let Some(binary) = self.entries.borrow().get(path) {
            return Ok(binary.clone());
        }
        let content = fs::read(path)?;
        let binary = Rc::new(parse_binary(path, &content)?);
        self.entries
            .borrow_mut()
            .insert(path.to_owned(), binary.clone());
        Ok(binary)
    }
}

/// Get a humanly-readable version of the (imported or exported) symbol
pub fn demangle_symbol(symbol: &str) -> Option<String> {
    let flags =
        msvc_demangler::DemangleFlags::llvm() | msvc_demangler::DemangleFlags::NO_MS_KEYWORDS;
    msvc_demangler::demangle(symbol, flags).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::fixtures::{pe32, DIRECTORY_EXPORT, DIRECTORY_RESOURCE};

    /// export directory at 0x1000 naming the DLL "mylib.dll", with `names_rva` as name table
    fn export_table(names_rva: u32) -> Vec<u8> {
        pe32(&[(DIRECTORY_EXPORT, 0x1000, 0x100)], |s| {
            s.u32(0x100c, 0x1080); // name
            s.u32(0x1010, 5); // ordinal base
            s.u32(0x1014, 3); // functions
            s.u32(0x1018, 2); // names
            s.u32(0x101c, 0x1040);
            s.u32(0x1020, names_rva);
            s.u32(0x1024, 0x1060);
            // function 0 is named, 1 is ordinal-only, 2 is a named forwarder
            s.u32(0x1040, 0x2000);
            s.u32(0x1044, 0x2010);
            s.u32(0x1048, 0x10a0);
            s.u32(0x1050, 0x1090);
            s.u32(0x1054, 0x1098);
            s.u16(0x1060, 0);
            s.u16(0x1062, 2);
            s.str(0x1080, "mylib.dll");
            s.str(0x1090, "Alpha");
            s.str(0x1098, "Gamma");
            s.str(0x10a0, "other.Real");
        })
    }

    #[test]
    fn non_pe_files_are_not_an_error() -> Result<(), LookupError> {
        let binary = parse_binary(Path::new("readme.txt"), b"just some text")?;
        assert!(!binary.recognized);
        assert!(binary.imports.is_empty());
        assert!(binary.manifest.is_none());
        Ok(())
    }

    #[test]
    fn cache_memoizes_loaded_files() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data.bin");
        fs::write(&path, b"not a binary")?;

        let cache = BinaryCache::new(true);
        assert!(cache.is_caching());
        let first = cache.load(&path)?;
        // the cached copy is returned even if the file changes on disk
        fs::write(&path, b"MZ but broken")?;
        let second = cache.load(&path)?;
        assert!(Rc::ptr_eq(&first, &second));
        assert!(!second.recognized);
        Ok(())
    }

    #[test]
    fn missing_file_is_an_error() {
        let cache = BinaryCache::new(true);
        assert!(matches!(
            cache.load(Path::new("/definitely/not/here.dll")),
            Err(LookupError::IOError(_))
        ));
    }

    #[test]
    fn demangle() {
        let demangled = demangle_symbol("?foo@@YAHH@Z");
        assert!(demangled.is_some_and(|d| d.contains("foo(int)")));
        assert_eq!(demangle_symbol("GetProcAddress"), None);
    }

    #[test]
    fn exports_with_ordinals_and_forwarders() -> Result<(), LookupError> {
        let bytes = export_table(0x1050);
        let (name, exports) = read_exports(&PeFile::from_bytes(&bytes)?)?;
        assert_eq!(name.as_deref(), Some("mylib.dll"));
        assert_eq!(exports.len(), 3);
        assert_eq!(exports[0].ordinal, 5);
        assert_eq!(exports[0].name.as_deref(), Some("Alpha"));
        assert_eq!(exports[0].forwarded_to, None);
        assert_eq!(exports[1].ordinal, 6);
        assert_eq!(exports[1].name, None);
        assert_eq!(exports[2].name.as_deref(), Some("Gamma"));
        assert_eq!(exports[2].forwarded_to.as_deref(), Some("other.Real"));

        let binary = parse_binary(Path::new("mylib.dll"), &bytes)?;
        assert!(binary.recognized);
        assert_eq!(binary.dll_name.as_deref(), Some("mylib.dll"));
        assert_eq!(binary.exports, exports);
        Ok(())
    }

    #[test]
    fn unmapped_export_directory_is_not_fatal() -> Result<(), LookupError> {
        let bytes = pe32(&[(DIRECTORY_EXPORT, 0xFFFF_FFF8, 0x100)], |_| {});
        assert!(read_exports(&PeFile::from_bytes(&bytes)?).is_err());

        let binary = parse_binary(Path::new("broken.dll"), &bytes)?;
        assert!(binary.recognized);
        assert_eq!(binary.dll_name, None);
        assert!(binary.exports.is_empty());
        Ok(())
    }

    #[test]
    fn corrupt_export_name_table_is_not_fatal() -> Result<(), LookupError> {
        let bytes = export_table(0x9000_0000);
        assert!(read_exports(&PeFile::from_bytes(&bytes)?).is_err());

        let binary = parse_binary(Path::new("broken.dll"), &bytes)?;
        assert!(binary.recognized);
        assert!(binary.exports.is_empty());
        assert!(binary.imports.is_empty());
        Ok(())
    }

    #[test]
    fn manifest_resource() -> Result<(), LookupError> {
        let manifest = b"<assembly/>";
        let bytes = pe32(&[(DIRECTORY_RESOURCE, 0x1300, 0x200)], |s| {
            // root: one id entry, type 24 -> subdirectory at 0x18
            s.u16(0x130e, 1);
            s.u32(0x1310, 24);
            s.u32(0x1314, 0x8000_0018);
            // name level: one id entry -> subdirectory at 0x30
            s.u16(0x1318 + 14, 1);
            s.u32(0x1318 + 16, 1);
            s.u32(0x1318 + 20, 0x8000_0030);
            // language level: one entry -> data entry at 0x48
            s.u16(0x1330 + 14, 1);
            s.u32(0x1330 + 16, 0x409);
            s.u32(0x1330 + 20, 0x48);
            s.u32(0x1348, 0x1400);
            s.u32(0x134c, manifest.len() as u32);
            s.bytes(0x1400, manifest);
        });
        assert_eq!(
            read_manifest(&PeFile::from_bytes(&bytes)?)?,
            Some(&manifest[..])
        );
        let binary = parse_binary(Path::new("app.exe"), &bytes)?;
        assert_eq!(binary.manifest.as_deref(), Some(&manifest[..]));
        Ok(())
    }

    #[test]
    fn no_resources_no_manifest() -> Result<(), LookupError> {
        let bytes = pe32(&[], |_| {});
        assert_eq!(read_manifest(&PeFile::from_bytes(&bytes)?)?, None);
        assert_eq!(read_exports(&PeFile::from_bytes(&bytes)?)?, (None, Vec::new()));
        Ok(())
    }
}
