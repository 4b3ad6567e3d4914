//! Data structures that must be filled with the input and the parameters for the dependency scan

use crate::common::LookupError;
use crate::system::WindowsSystem;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct LookupTarget {
    /// Path to the target executable
    pub target_exe: PathBuf,
    /// Parent directory of target_exe, cached for performance purposes
    pub app_dir: PathBuf,
    /// Working directory as it should appear in the search path
    pub working_dir: PathBuf,
    /// Additional executable search path set by the user
    pub user_path: Vec<PathBuf>,
}

#[derive(Clone, Debug, Default)]
pub struct LookupParameters {
    /// Maximum library recursion depth for the search (None: unlimited)
    pub max_depth: Option<usize>,
    /// Read binaries fully in memory and keep them, instead of mapping (and locking) the files
    pub use_binary_cache: bool,
}

impl LookupParameters {
    /// Depth limit in the form the dependency graph expects (0 = unlimited)
    pub fn max_recursion(&self) -> usize {
        self.max_depth.unwrap_or(0)
    }
}

/// Complete specification of a search task
#[derive(Clone, Debug)]
pub struct LookupQuery {
    pub system: Option<WindowsSystem>,
    pub target: LookupTarget,
    pub parameters: LookupParameters,
}

fn app_dir_of(target_exe: &Path) -> Result<&Path, LookupError> {
    target_exe.parent().ok_or_else(|| {
        LookupError::ContextDeductionError(
            "Could not find application directory for given executable ".to_owned()
                + target_exe.to_str().unwrap_or("---"),
        )
    })
}

impl LookupQuery {
    /// autodetects the settings with sensible defaults
    ///
    /// The working directory will be set to the one containing the executable (i.e. the app_dir)
    #[cfg(windows)]
    pub fn deduce_from_executable_location<P: AsRef<Path>>(
        target_exe: P,
    ) -> Result<Self, LookupError> {
        let app_dir = fs_err::canonicalize(app_dir_of(target_exe.as_ref())?)?;
        Ok(Self {
            system: Some(WindowsSystem::current()?),
            target: LookupTarget {
                user_path: vec![],
                target_exe: target_exe.as_ref().into(),
                app_dir: app_dir.clone(),
                working_dir: app_dir,
            },
            parameters: LookupParameters::default(),
        })
    }

    /// autodetects the settings with sensible defaults
    ///
    /// The working directory will be set to the one containing the executable (i.e. the app_dir)
    #[cfg(not(windows))]
    pub fn deduce_from_executable_location<P: AsRef<Path>>(
        target_exe: P,
    ) -> Result<Self, LookupError> {
        let app_dir = app_dir_of(target_exe.as_ref())?;
        Ok(Self {
            system: WindowsSystem::from_exe_location(&target_exe)?,
            target: LookupTarget {
                user_path: Vec::new(),
                target_exe: target_exe.as_ref().to_owned(),
                app_dir: app_dir.to_owned(),
                working_dir: app_dir.to_owned(),
            },
            parameters: LookupParameters::default(),
        })
    }
}
