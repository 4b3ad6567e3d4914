use crate::apiset::is_apiset_contract_name;
use crate::query::LookupQuery;
use crate::resolver::{ModuleResolver, Resolution, RootBinary, SearchStrategy};
use crate::system::WinFileSystemCache;
use crate::LookupError;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory/set of DLLs to be searched, and relative metadata
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum LookupPathEntry {
    /// The DLL is implicitely loaded by the OS for every process, and not looked up every time
    KnownDLLs,
    /// Virtual DLL names redirected by the API set schema to their host DLL
    ApiSet,
    /// DLLs redirected by the manifest of the root executable
    SideBySide,
    /// Directory where the root executable sits
    ExecutableDir(PathBuf),
    /// Windows System directory (typically C:\Windows\System32)
    SystemDir(PathBuf),
    // SystemDir16, // ignored
    /// Windows directory (typically C:\Windows)
    WindowsDir(PathBuf),
    /// Working directory of the (virtual) process whose DLL lookup we are simulating
    WorkingDir(PathBuf),
    /// PATH as specified by the system (value PATH variable in the shell executing the process)
    SystemPath(PathBuf),
    /// Additional path entries specified by the user
    UserPath(PathBuf),
}

impl LookupPathEntry {
    pub(crate) fn get_path(&self) -> Option<PathBuf> {
        match self {
            // we have a fixed list, no need to scan
            Self::KnownDLLs | Self::ApiSet | Self::SideBySide => None,
            // else
            Self::ExecutableDir(p)
            | Self::SystemDir(p)
            | Self::WindowsDir(p)
            | Self::WorkingDir(p)
            | Self::SystemPath(p)
            | Self::UserPath(p) => Some(p.clone()),
        }
    }

    fn strategy(&self) -> SearchStrategy {
        match self {
            Self::KnownDLLs => SearchStrategy::KnownDll,
            Self::ApiSet => SearchStrategy::ApiSet,
            Self::SideBySide => SearchStrategy::SideBySide,
            _ => SearchStrategy::StandardSearch,
        }
    }
}

/// Full location of a DLL found during lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    pub location: LookupPathEntry,
    pub fullpath: PathBuf,
}

/// Outcome of the API set step of the search
enum ApisetLookup {
    /// not a contract known to the schema, the search goes on
    NotAContract,
    Redirected(PathBuf),
    /// a contract without a host that can be located: the loader gives up
    Unresolvable,
}

/// Sorted list of directories to be looked up when searching for a DLL
/// It is built from a query, depending on the current system configuration
/// (availability of a Windows root, and its configuration that influences the lookup)
pub struct LookupPath {
    pub query: LookupQuery,
    pub entries: Vec<LookupPathEntry>,
    fs_cache: std::cell::RefCell<WinFileSystemCache>,
}

impl LookupPath {
    pub fn new(query: LookupQuery) -> Self {
        let target = &query.target;
        let entries = if let Some(system) = &query.system {
            let knowndlls_entry = if system.known_dlls.is_some() {
                vec![LookupPathEntry::KnownDLLs]
            } else {
                vec![]
            };
            let apiset_entry = if system.apiset_map.is_some() {
                vec![LookupPathEntry::ApiSet]
            } else {
                vec![]
            };
            let system_entries = vec![
                LookupPathEntry::SystemDir(system.sys_dir.clone()),
                // 16-bit system directory ignored
                LookupPathEntry::WindowsDir(system.win_dir.clone()),
            ];

            if system.safe_dll_search_mode_on.unwrap_or(true) {
                // default mode (assume if not specified)
                [
                    knowndlls_entry,
                    apiset_entry,
                    vec![
                        LookupPathEntry::SideBySide,
                        LookupPathEntry::ExecutableDir(target.app_dir.clone()),
                    ],
                    system_entries,
                    vec![LookupPathEntry::WorkingDir(target.working_dir.clone())],
                    Self::system_path_entries(&query),
                    Self::user_path_entries(&query),
                ]
                .concat()
            } else {
                // SafeDllSearchMode disabled: the working directory comes right after the app dir
                [
                    knowndlls_entry,
                    apiset_entry,
                    vec![
                        LookupPathEntry::SideBySide,
                        LookupPathEntry::ExecutableDir(target.app_dir.clone()),
                        LookupPathEntry::WorkingDir(target.working_dir.clone()),
                    ],
                    system_entries,
                    Self::system_path_entries(&query),
                    Self::user_path_entries(&query),
                ]
                .concat()
            }
        } else {
            [
                vec![
                    LookupPathEntry::SideBySide,
                    LookupPathEntry::ExecutableDir(target.app_dir.clone()),
                    LookupPathEntry::WorkingDir(target.working_dir.clone()),
                ],
                Self::system_path_entries(&query),
                Self::user_path_entries(&query),
            ]
            .concat()
        };

        Self {
            query,
            entries,
            fs_cache: std::cell::RefCell::new(WinFileSystemCache::new()),
        }
    }

    /// Get the PATH entries specified by the system
    fn system_path_entries(q: &LookupQuery) -> Vec<LookupPathEntry> {
        q.system
            .as_ref()
            .and_then(|s| s.system_path.as_ref())
            .map(|path| {
                path.iter()
                    .map(|s| LookupPathEntry::SystemPath(s.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get the PATH entries that were provided by the user when running the program
    fn user_path_entries(q: &LookupQuery) -> Vec<LookupPathEntry> {
        q.target
            .user_path
            .iter()
            .map(|s| LookupPathEntry::UserPath(s.clone()))
            .collect::<Vec<_>>()
    }

    // linearize the lookup context into a single vector of directories
    pub fn search_path(&self) -> Vec<PathBuf> {
        self.entries.iter().flat_map(|e| e.get_path()).collect()
    }

    // looks for a DLL by name
    // first looks in the known dlls, then in the api set, then in the SxS entries of the root,
    // then in the concrete entries
    pub fn search_dll(
        &self,
        root: &RootBinary,
        library: &str,
    ) -> Result<Option<LookupResult>, LookupError> {
        for e in &self.entries {
            match e {
                LookupPathEntry::KnownDLLs => {
                    if let Some(fullpath) = self.search_dll_in_known_dlls(library) {
                        return Ok(Some(LookupResult {
                            location: e.clone(),
                            fullpath,
                        }));
                    }
                }
                LookupPathEntry::ApiSet => match self.search_dll_in_apiset_map(library)? {
                    ApisetLookup::NotAContract => {}
                    ApisetLookup::Redirected(fullpath) => {
                        return Ok(Some(LookupResult {
                            location: e.clone(),
                            fullpath,
                        }))
                    }
                    ApisetLookup::Unresolvable => return Ok(None),
                },
                LookupPathEntry::SideBySide => {
                    let redirected = root
                        .sxs_entries
                        .find(library)
                        .and_then(|entry| entry.path.as_ref())
                        .filter(|p| p.is_file());
                    if let Some(fullpath) = redirected {
                        return Ok(Some(LookupResult {
                            location: e.clone(),
                            fullpath: fullpath.clone(),
                        }));
                    }
                }
                LookupPathEntry::ExecutableDir(p)
                | LookupPathEntry::SystemDir(p)
                | LookupPathEntry::WindowsDir(p)
                | LookupPathEntry::SystemPath(p)
                | LookupPathEntry::UserPath(p)
                | LookupPathEntry::WorkingDir(p) => {
                    if let Some(r) = self.search_file_in_folder(OsStr::new(library), p)? {
                        return Ok(Some(LookupResult {
                            location: e.clone(),
                            fullpath: r,
                        }));
                    }
                }
            }
        }
        Ok(None)
    }

    fn search_dll_in_known_dlls(&self, library: &str) -> Option<PathBuf> {
        self.query
            .system
            .as_ref()
            .and_then(|s| s.known_dlls.as_ref())
            .and_then(|kd| kd.search_dll_in_known_dlls(library))
    }

    fn search_dll_in_apiset_map(&self, library: &str) -> Result<ApisetLookup, LookupError> {
        let system = match &self.query.system {
            Some(system) => system,
            None => return Ok(ApisetLookup::NotAContract),
        };
        let entry = match system.apiset_map.as_ref() {
            Some(map) if is_apiset_contract_name(library) => map.lookup(library),
            _ => None,
        };
        let entry = match entry {
            Some(entry) => entry,
            None => return Ok(ApisetLookup::NotAContract),
        };

        let host = match entry.default_host() {
            Some(host) => host,
            None => {
                debug!(contract = library, "API set contract without host");
                return Ok(ApisetLookup::Unresolvable);
            }
        };
        if let Some(known) = self.search_dll_in_known_dlls(host) {
            return Ok(ApisetLookup::Redirected(known));
        }
        match self.search_file_in_folder(OsStr::new(host), &system.sys_dir)? {
            Some(p) => Ok(ApisetLookup::Redirected(p)),
            None => {
                debug!(contract = library, host, "API set host not found");
                Ok(ApisetLookup::Unresolvable)
            }
        }
    }

    fn search_file_in_folder<P: AsRef<Path>>(
        &self,
        filename: &OsStr,
        p: P,
    ) -> Result<Option<PathBuf>, LookupError> {
        self.fs_cache
            .borrow_mut()
            .test_file_in_folder_case_insensitive(filename, p.as_ref())
    }
}

impl ModuleResolver for LookupPath {
    fn resolve(&self, root: &RootBinary, module_name: &str) -> Result<Resolution, LookupError> {
        let resolution = match self.search_dll(root, module_name)? {
            Some(found) => Resolution::found(found.location.strategy(), found.fullpath),
            None => Resolution::not_found(),
        };
        debug!(
            module = module_name,
            strategy = %resolution.strategy,
            path = ?resolution.path,
            "module resolved"
        );
        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apiset::{ApisetEntry, ApisetHost, ApisetMap};
    use crate::query::{LookupParameters, LookupTarget};
    use crate::sxs::{SxsEntries, SxsEntry};
    use crate::system::{KnownDLLList, WindowsSystem};
    use fs_err as fs;

    struct Layout {
        _tmp: tempfile::TempDir,
        app_dir: PathBuf,
        work_dir: PathBuf,
        sys_dir: PathBuf,
        win_dir: PathBuf,
    }

    fn layout() -> Result<Layout, LookupError> {
        let tmp = tempfile::tempdir()?;
        let app_dir = tmp.path().join("app");
        let work_dir = tmp.path().join("work");
        let win_dir = tmp.path().join("Windows");
        let sys_dir = win_dir.join("System32");
        for d in [&app_dir, &work_dir, &sys_dir] {
            fs::create_dir_all(d)?;
        }
        for f in ["kernel32.dll", "KernelBase.dll", "dup.dll"] {
            fs::write(sys_dir.join(f), b"MZ")?;
        }
        for f in ["kernel32.dll", "foo.dll"] {
            fs::write(app_dir.join(f), b"MZ")?;
        }
        fs::write(work_dir.join("dup.dll"), b"MZ")?;
        Ok(Layout {
            _tmp: tmp,
            app_dir,
            work_dir,
            sys_dir,
            win_dir,
        })
    }

    fn lookup_path(l: &Layout, safe_mode: bool) -> LookupPath {
        let apiset = ApisetMap::from_entries(vec![
            ApisetEntry {
                name: "api-ms-win-core-synch-l1-2-0".to_owned(),
                hosts: vec![ApisetHost {
                    importer: None,
                    host: "kernelbase.dll".to_owned(),
                }],
            },
            ApisetEntry {
                name: "ext-ms-win-gone-l1-1-0".to_owned(),
                hosts: vec![ApisetHost {
                    importer: None,
                    host: "gone.dll".to_owned(),
                }],
            },
        ]);
        let system = WindowsSystem {
            safe_dll_search_mode_on: Some(safe_mode),
            apiset_map: Some(apiset),
            known_dlls: Some(KnownDLLList::from_names(["kernel32.dll"], &l.sys_dir)),
            known_dlls_wow64: None,
            win_dir: l.win_dir.clone(),
            sys_dir: l.sys_dir.clone(),
            system_path: None,
        };
        LookupPath::new(LookupQuery {
            system: Some(system),
            target: LookupTarget {
                target_exe: l.app_dir.join("app.exe"),
                app_dir: l.app_dir.clone(),
                working_dir: l.work_dir.clone(),
                user_path: Vec::new(),
            },
            parameters: LookupParameters::default(),
        })
    }

    fn root(l: &Layout) -> RootBinary {
        RootBinary::new(&l.app_dir.join("app.exe"), SxsEntries::default())
    }

    #[test]
    fn known_dll_wins_over_application_dir() -> Result<(), LookupError> {
        let l = layout()?;
        let r = lookup_path(&l, true).resolve(&root(&l), "KERNEL32.dll")?;
        assert_eq!(r.strategy, SearchStrategy::KnownDll);
        assert_eq!(r.path, Some(l.sys_dir.join("kernel32.dll")));
        Ok(())
    }

    #[test]
    fn standard_search_and_not_found() -> Result<(), LookupError> {
        let l = layout()?;
        let lp = lookup_path(&l, true);
        let r = lp.resolve(&root(&l), "FOO.dll")?;
        assert_eq!(r.strategy, SearchStrategy::StandardSearch);
        assert_eq!(r.path, Some(l.app_dir.join("foo.dll")));

        assert_eq!(lp.resolve(&root(&l), "nowhere.dll")?, Resolution::not_found());
        Ok(())
    }

    #[test]
    fn apiset_contracts() -> Result<(), LookupError> {
        let l = layout()?;
        let lp = lookup_path(&l, true);
        let r = lp.resolve(&root(&l), "api-ms-win-core-synch-l1-2-0.dll")?;
        assert_eq!(r.strategy, SearchStrategy::ApiSet);
        assert_eq!(r.path, Some(l.sys_dir.join("KernelBase.dll")));

        // host missing from the system directory
        let r = lp.resolve(&root(&l), "ext-ms-win-gone-l1-1-0.dll")?;
        assert_eq!(r, Resolution::not_found());
        Ok(())
    }

    #[test]
    fn side_by_side_before_standard_search() -> Result<(), LookupError> {
        let l = layout()?;
        let assembly_dir = l.app_dir.join("Contoso.Widgets");
        fs::create_dir_all(&assembly_dir)?;
        fs::write(assembly_dir.join("foo.dll"), b"MZ")?;
        let root = RootBinary::new(
            &l.app_dir.join("app.exe"),
            SxsEntries(vec![
                SxsEntry {
                    name: "foo.dll".to_owned(),
                    path: Some(assembly_dir.join("foo.dll")),
                },
                SxsEntry {
                    name: "Missing.Assembly".to_owned(),
                    path: None,
                },
            ]),
        );
        let r = lookup_path(&l, true).resolve(&root, "foo.dll")?;
        assert_eq!(r.strategy, SearchStrategy::SideBySide);
        assert_eq!(r.path, Some(assembly_dir.join("foo.dll")));
        Ok(())
    }

    #[test]
    fn unsafe_mode_searches_working_dir_first() -> Result<(), LookupError> {
        let l = layout()?;
        let safe = lookup_path(&l, true).resolve(&root(&l), "dup.dll")?;
        assert_eq!(safe.path, Some(l.sys_dir.join("dup.dll")));
        let unsafe_mode = lookup_path(&l, false).resolve(&root(&l), "dup.dll")?;
        assert_eq!(unsafe_mode.path, Some(l.work_dir.join("dup.dll")));
        Ok(())
    }

    #[test]
    fn search_path_lists_directories_in_order() -> Result<(), LookupError> {
        let l = layout()?;
        assert_eq!(
            lookup_path(&l, true).search_path(),
            vec![
                l.app_dir.clone(),
                l.sys_dir.clone(),
                l.win_dir.clone(),
                l.work_dir.clone()
            ]
        );
        Ok(())
    }
}
