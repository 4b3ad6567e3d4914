use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("Lookup context building error: {0}")]
    ContextDeductionError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Malformed PE image: {0}")]
    MalformedImage(String),

    #[error("Not a managed (.NET) image: {0}")]
    NotManagedImage(String),

    #[error("API set schema error: {0}")]
    ApisetError(String),

    /// Failure already reported at the module where it happened; `trail` lists the module
    /// identities from the failing module up to the root
    #[error("failure while processing \"{}\"", .trail.first().map(String::as_str).unwrap_or("<unknown>"))]
    DependencyChain {
        trail: Vec<String>,
        source: Box<LookupError>,
    },

    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    GoblinError(#[from] goblin::error::Error),
    #[error(transparent)]
    PEError(#[from] pelite::Error),
    #[error(transparent)]
    XmlError(#[from] roxmltree::Error),
    #[error(transparent)]
    GlobError(#[from] glob::PatternError),
    #[error(transparent)]
    RegexError(#[from] regex::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

impl LookupError {
    /// Attach the identity of the module being processed when this error surfaced
    ///
    /// The first call wraps the original error; later calls only append to the trail, so every
    /// module on the chain appears exactly once.
    pub fn in_module(self, identity: impl Into<String>) -> Self {
        match self {
            LookupError::DependencyChain { mut trail, source } => {
                trail.push(identity.into());
                LookupError::DependencyChain { trail, source }
            }
            other => LookupError::DependencyChain {
                trail: vec![identity.into()],
                source: Box::new(other),
            },
        }
    }

    /// Modules backtrace, innermost first (empty if this error was never attached to a module)
    pub fn module_trail(&self) -> &[String] {
        match self {
            LookupError::DependencyChain { trail, .. } => trail,
            _ => &[],
        }
    }

    /// The error that started the chain
    pub fn root_cause(&self) -> &LookupError {
        match self {
            LookupError::DependencyChain { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Lossy conversion of a path to a printable string
pub fn path_to_string<P: AsRef<Path>>(p: P) -> String {
    p.as_ref().to_string_lossy().into_owned()
}

/// Canonicalize a path, and return it in a format that is pleasant to read
pub fn readable_canonical_path<P: AsRef<Path>>(p: P) -> Result<String, LookupError> {
    let canonical = fs_err::canonicalize(p.as_ref())?;
    Ok(decanonicalize(&path_to_string(canonical)))
}

/// Strip the verbatim prefix that canonicalization adds on Windows
pub fn decanonicalize(s: &str) -> String {
    s.strip_prefix(r"\\?\").unwrap_or(s).to_owned()
}
