#[cfg(windows)]
extern crate winapi;
use crate::apiset;
use crate::common::LookupError;
#[cfg(windows)]
use crate::knowndlls;
use fs_err as fs;
use std::collections::HashMap;
#[cfg(windows)]
use std::ffi::OsString;
#[cfg(windows)]
use std::os::windows::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// List of DLLs provided by the operating system and hardcoded into the loader
/// If a DLL with this name is required, the OS will not perform any further lookup but load the
/// copy distributed with Windows
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct KnownDLLList {
    pub entries: HashMap<String, PathBuf>,
}

impl KnownDLLList {
    /// Build the list from bare DLL names, all located in `dir`
    pub fn from_names<S: AsRef<str>>(names: impl IntoIterator<Item = S>, dir: &Path) -> Self {
        Self {
            entries: names
                .into_iter()
                .map(|n| n.as_ref().trim().to_owned())
                .filter(|n| !n.is_empty())
                .map(|n| (n.to_ascii_lowercase(), dir.join(&n)))
                .collect(),
        }
    }

    /// Read a list of known DLL names, one per line ('#' starts a comment)
    pub fn from_list_file<P: AsRef<Path>>(list: P, dir: &Path) -> Result<Self, LookupError> {
        let content = fs::read_to_string(list.as_ref())?;
        Ok(Self::from_names(
            content
                .lines()
                .map(|l| l.split('#').next().unwrap_or(""))
                .filter(|l| !l.trim().is_empty()),
            dir,
        ))
    }

    /// look for a DLL by name among the entries
    pub fn search_dll_in_known_dlls(&self, library: &str) -> Option<PathBuf> {
        self.entries.get(&library.to_ascii_lowercase()).cloned()
    }

    /// Full paths of the entries, sorted
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.entries.values().cloned().collect();
        paths.sort();
        paths
    }
}

// supported DLL search modes: standard for desktop application, safe or unsafe
// https://docs.microsoft.com/en-us/windows/win32/dlls/dynamic-link-library-search-order#standard-search-order-for-desktop-applications

/// Description of a Windows system
/// If running from within Windows we extract the available information from the environment
/// variables and the Windows API.
/// If running in another OS we can only guess the directories, and can't do anything about the PATH
#[derive(Debug, Clone)]
pub struct WindowsSystem {
    pub safe_dll_search_mode_on: Option<bool>,
    pub apiset_map: Option<apiset::ApisetMap>,
    pub known_dlls: Option<KnownDLLList>,
    /// known DLLs of 32-bit processes on a 64-bit system (from SysWOW64)
    pub known_dlls_wow64: Option<KnownDLLList>,
    pub win_dir: PathBuf,
    pub sys_dir: PathBuf,
    // sys16_dir ignored, since it is not supported on 64-bit systems
    pub system_path: Option<Vec<PathBuf>>,
}

fn load_apiset_map(sys_dir: &Path) -> Option<apiset::ApisetMap> {
    let schema_path = sys_dir.join("apisetschema.dll");
    if !schema_path.exists() {
        debug!(path = %schema_path.display(), "no API set schema available");
        return None;
    }
    match apiset::parse_apiset(&schema_path) {
        Ok(map) => Some(map),
        Err(e) => {
            warn!(path = %schema_path.display(), error = %e, "could not read the API set schema");
            None
        }
    }
}

impl WindowsSystem {
    /// Collect information about the host operating system
    #[cfg(windows)]
    pub fn current() -> Result<Self, LookupError> {
        let win_dir = get_windows_directory()?;
        let sys_dir = get_system_directory()?;
        let apiset_map = load_apiset_map(&sys_dir);

        let path = std::env::var("PATH").ok().map(|s| {
            s.split(';')
                .filter_map(|subs| fs::canonicalize(subs).ok())
                .collect()
        });
        let known_dlls = match knowndlls::get_known_dlls(false) {
            Ok(names) => Some(KnownDLLList::from_names(names, &sys_dir)),
            Err(e) => {
                warn!(error = %e, "could not list the known DLLs");
                None
            }
        };
        let wow64_dir = win_dir.join("SysWOW64");
        let known_dlls_wow64 = knowndlls::get_known_dlls(true)
            .ok()
            .filter(|_| wow64_dir.exists())
            .map(|names| KnownDLLList::from_names(names, &wow64_dir));
        Ok(Self {
            safe_dll_search_mode_on: None,
            apiset_map,
            known_dlls,
            known_dlls_wow64,
            win_dir,
            sys_dir,
            system_path: path,
        })
    }

    /// Collect information about the Windows operating system installed on the partition the target
    /// executable lies into
    #[cfg(not(windows))]
    pub fn from_exe_location<P: AsRef<Path>>(p: P) -> Result<Option<Self>, LookupError> {
        Ok(Self::find_root(&p).and_then(Self::from_root))
    }

    /// Try finding a Windows installation along the path to the target executable
    /// Rationale: the user may have mounted a Windows partition at an unknown depth in the filesystem
    #[cfg(not(windows))]
    fn find_root<P: AsRef<Path>>(p: P) -> Option<PathBuf> {
        p.as_ref()
            .parent()?
            .ancestors()
            .find(|a| a.join("Windows").join("System32").exists())
            .map(Path::to_owned)
    }

    /// Collect information about the Windows installation at the given path
    /// The path should point to the C:\ partition
    pub fn from_root<P: AsRef<Path>>(root_path: P) -> Option<Self> {
        // known DLLs can't be read from an offline partition, they have to be provided
        // separately (see KnownDLLList::from_list_file)
        let win_dir = root_path.as_ref().join("Windows");
        let sys_dir = win_dir.join("System32");
        if sys_dir.exists() {
            Some(Self {
                safe_dll_search_mode_on: None,
                apiset_map: load_apiset_map(&sys_dir),
                known_dlls: None,
                known_dlls_wow64: None,
                win_dir,
                sys_dir,
                system_path: None,
            })
        } else {
            None
        }
    }
}

/// Fetch the path to a system directory through the Windows API
#[cfg(windows)]
fn get_winapi_directory(
    a: unsafe extern "system" fn(
        winapi::um::winnt::LPWSTR,
        winapi::shared::minwindef::UINT,
    ) -> winapi::shared::minwindef::UINT,
) -> Result<PathBuf, std::io::Error> {
    use std::io::Error;

    const BFR_SIZE: usize = 512;
    let mut bfr: [u16; BFR_SIZE] = [0; BFR_SIZE];

    let ret: u32 = unsafe { a(bfr.as_mut_ptr(), BFR_SIZE as u32) };
    if ret == 0 {
        Err(Error::last_os_error())
    } else {
        let valid_bfr = &bfr[..ret as usize];
        fs::canonicalize(OsString::from_wide(valid_bfr))
    }
}

/// Get the path to the System directory (typically C:\Windows\System32)
#[cfg(windows)]
fn get_system_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::sysinfoapi::GetSystemDirectoryW)
}

/// Get the path to the Windows directory (typically C:\Windows)
#[cfg(windows)]
fn get_windows_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::sysinfoapi::GetWindowsDirectoryW)
}

/// Caches the content of already scanned directories, to avoid repeated expensive filesystem access
pub(crate) struct WinFileSystemCache {
    files_in_dirs: HashMap<PathBuf, HashMap<String, PathBuf>>,
}

impl WinFileSystemCache {
    pub(crate) fn new() -> Self {
        Self {
            files_in_dirs: HashMap::new(),
        }
    }

    pub(crate) fn test_file_in_folder_case_insensitive<P: AsRef<Path>, Q: AsRef<Path>>(
        &mut self,
        filename: P,
        folder: Q,
    ) -> Result<Option<PathBuf>, LookupError> {
        let filename = filename.as_ref().to_str().ok_or_else(|| {
            LookupError::ScanError(format!(
                "Non-unicode file name {:?}",
                filename.as_ref()
            ))
        })?;
        let dir = self.scan_folder(folder.as_ref());
        Ok(dir
            .get(&filename.to_lowercase())
            .map(|p| folder.as_ref().join(p)))
    }

    /// List the files in a folder; a folder that can't be read counts as empty
    pub(crate) fn scan_folder(&mut self, folder: &Path) -> &HashMap<String, PathBuf> {
        self.files_in_dirs
            .entry(folder.to_owned())
            .or_insert_with(|| match fs::read_dir(folder) {
                Ok(entries) => entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.metadata().map_or_else(|_| false, |m| m.is_file()))
                    .filter_map(|entry| {
                        entry
                            .file_name()
                            .to_str()
                            .map(|s| (s.to_lowercase(), entry.file_name().into()))
                    })
                    .collect(),
                Err(e) => {
                    debug!(folder = %folder.display(), error = %e, "skipping unreadable directory");
                    HashMap::new()
                }
            })
    }
}
