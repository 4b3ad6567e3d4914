/*!
API set schema (version 6, Windows 10 and later) parsing and contract lookup

Resources:

* https://lucasg.github.io/2017/10/15/Api-set-resolution/
* https://www.geoffchappell.com/studies/windows/win32/apisetschema/index.htm
 */

use crate::common::LookupError;
use crate::image::read_u32;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

const SCHEMA_VERSION: u32 = 6;
const ENTRY_SIZE: usize = 24;
const VALUE_SIZE: usize = 20;

/// Module implementing a contract, optionally only for a specific importer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApisetHost {
    pub importer: Option<String>,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApisetEntry {
    /// full contract name, without extension (e.g. api-ms-win-core-synch-l1-2-0)
    pub name: String,
    pub hosts: Vec<ApisetHost>,
}

impl ApisetEntry {
    /// Host used when the importer has no dedicated redirection
    pub fn default_host(&self) -> Option<&str> {
        self.hosts
            .iter()
            .find(|h| h.importer.is_none())
            .or_else(|| self.hosts.first())
            .map(|h| h.host.as_str())
            .filter(|h| !h.is_empty())
    }
}

/// Contracts indexed by their hashed name (lowercase, up to the last '-')
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApisetMap {
    entries: HashMap<String, ApisetEntry>,
}

impl ApisetMap {
    pub fn from_entries(entries: impl IntoIterator<Item = ApisetEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| (hashed_name(&e.name), e))
                .collect(),
        }
    }

    /// Find the contract matching a module name, ignoring case, extension and minor version
    pub fn lookup(&self, module_name: &str) -> Option<&ApisetEntry> {
        self.entries.get(&hashed_name(module_name))
    }

    /// All entries, sorted by contract name
    pub fn entries(&self) -> Vec<&ApisetEntry> {
        let mut entries: Vec<&ApisetEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whether the name has the shape of an API set contract (api-*/ext-* with a -lN-N-N suffix)
pub fn is_apiset_contract_name(module_name: &str) -> bool {
    static CONTRACT_NAME: OnceLock<Option<Regex>> = OnceLock::new();
    CONTRACT_NAME
        .get_or_init(|| Regex::new(r"(?i)^(api|ext)-.+-l\d+-\d+-\d+(\.dll)?$").ok())
        .as_ref()
        .map(|re| re.is_match(module_name))
        .unwrap_or(false)
}

/// Key under which the loader hashes a contract: the last version number is not significant
pub fn hashed_name(module_name: &str) -> String {
    let lower = module_name.to_lowercase();
    let stem = lower.strip_suffix(".dll").unwrap_or(&lower);
    match stem.rfind('-') {
        Some(idx) => stem[..idx].to_owned(),
        None => stem.to_owned(),
    }
}

fn read_utf16(section: &[u8], offset: u32, length: u32) -> Result<String, LookupError> {
    let start = offset as usize;
    let end = start + length as usize;
    let bytes = section.get(start..end).ok_or_else(|| {
        LookupError::ApisetError(format!("string out of bounds at offset {:#x}", start))
    })?;
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

/// Parse the content of the .apiset section
pub fn parse_schema(section: &[u8]) -> Result<ApisetMap, LookupError> {
    let version = read_u32(section, 0)?;
    if version != SCHEMA_VERSION {
        return Err(LookupError::ApisetError(format!(
            "unsupported API set schema version {}",
            version
        )));
    }
    let count = read_u32(section, 12)? as usize;
    let entries_offset = read_u32(section, 16)? as usize;

    let mut entries = Vec::with_capacity(count.min(0x4000));
    for i in 0..count {
        let entry = entries_offset + i * ENTRY_SIZE;
        let name = read_utf16(section, read_u32(section, entry + 4)?, read_u32(section, entry + 8)?)?;
        let values_offset = read_u32(section, entry + 16)? as usize;
        let value_count = read_u32(section, entry + 20)? as usize;

        let mut hosts = Vec::with_capacity(value_count.min(16));
        for j in 0..value_count {
            let value = values_offset + j * VALUE_SIZE;
            let importer = read_utf16(
                section,
                read_u32(section, value + 4)?,
                read_u32(section, value + 8)?,
            )?;
            let host = read_utf16(
                section,
                read_u32(section, value + 12)?,
                read_u32(section, value + 16)?,
            )?;
            hosts.push(ApisetHost {
                importer: Some(importer).filter(|s| !s.is_empty()),
                host,
            });
        }
        entries.push(ApisetEntry {
            name: name.to_lowercase(),
            hosts,
        });
    }
    Ok(ApisetMap::from_entries(entries))
}

/// Extract the schema from the bytes of a PE file, if it has an .apiset section
pub fn parse_apiset_image(bytes: &[u8]) -> Result<Option<ApisetMap>, LookupError> {
    let pefile = pelite::PeFile::from_bytes(bytes)?;
    match pefile.section_headers().by_name(".apiset") {
        Some(section) => Ok(Some(parse_schema(pefile.get_section_bytes(section)?)?)),
        None => Ok(None),
    }
}

/// Read the schema from a file (usually System32\apisetschema.dll)
pub fn parse_apiset<P: AsRef<Path>>(apisetschema_path: P) -> Result<ApisetMap, LookupError> {
    let filemap = pelite::FileMap::open(apisetschema_path.as_ref())?;
    Ok(parse_apiset_image(filemap.as_ref())?.unwrap_or_default())
}
