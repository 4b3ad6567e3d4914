//! Module and assembly references of managed (.NET) images, read from the ECMA-335 metadata
//! tables

use crate::common::{path_to_string, LookupError};
use crate::image::{read_c_str, read_u16, read_u32, PeImage};
use fs_err as fs;
use serde::Serialize;
use std::path::Path;

const METADATA_SIGNATURE: u32 = 0x424A_5342;

const TABLE_COUNT: usize = 64;
const MODULE_REF: usize = 0x1A;
const ASSEMBLY_REF: usize = 0x23;

// table indices referenced by the row layouts
const TYPE_REF: usize = 0x01;
const TYPE_DEF: usize = 0x02;
const FIELD: usize = 0x04;
const METHOD_DEF: usize = 0x06;
const PARAM: usize = 0x08;
const INTERFACE_IMPL: usize = 0x09;
const MEMBER_REF: usize = 0x0A;
const DECL_SECURITY: usize = 0x0E;
const STAND_ALONE_SIG: usize = 0x11;
const EVENT: usize = 0x14;
const PROPERTY: usize = 0x17;
const TYPE_SPEC: usize = 0x1B;
const ASSEMBLY: usize = 0x20;
const FILE: usize = 0x26;
const EXPORTED_TYPE: usize = 0x27;
const MANIFEST_RESOURCE: usize = 0x28;
const GENERIC_PARAM: usize = 0x2A;
const METHOD_SPEC: usize = 0x2B;
const GENERIC_PARAM_CONSTRAINT: usize = 0x2C;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssemblyReference {
    pub name: String,
    pub version: String,
}

/// References found in the metadata of a managed image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagedReferences {
    /// native modules referenced through P/Invoke (ModuleRef table)
    pub module_references: Vec<String>,
    pub assembly_references: Vec<AssemblyReference>,
}

/// Capability to extract the managed references of a binary
///
/// Must fail with `LookupError::NotManagedImage` when the file has no CLR metadata.
pub trait ManagedReader {
    fn read_managed(&self, path: &Path) -> Result<ManagedReferences, LookupError>;
}

/// Default reader, parsing the metadata tables directly from the file
#[derive(Debug, Default, Clone, Copy)]
pub struct ClrMetadataReader;

impl ManagedReader for ClrMetadataReader {
    fn read_managed(&self, path: &Path) -> Result<ManagedReferences, LookupError> {
        let bytes = fs::read(path)?;
        read_managed_image(path, &bytes)
    }
}

/// Extract the references from the content of a PE file
pub fn read_managed_image(path: &Path, bytes: &[u8]) -> Result<ManagedReferences, LookupError> {
    let image = match PeImage::parse(bytes) {
        Ok(image) => image,
        Err(_) => return Err(LookupError::NotManagedImage(path_to_string(path))),
    };
    match image.clr_metadata()? {
        Some(metadata) => parse_metadata(metadata),
        None => Err(LookupError::NotManagedImage(path_to_string(path))),
    }
}

struct Streams<'a> {
    tables: &'a [u8],
    strings: &'a [u8],
}

fn find_streams(root: &[u8]) -> Result<Streams<'_>, LookupError> {
    if read_u32(root, 0)? != METADATA_SIGNATURE {
        return Err(LookupError::MalformedImage(
            "invalid metadata signature".to_owned(),
        ));
    }
    let version_length = read_u32(root, 12)? as usize;
    let stream_count = read_u16(root, 16 + version_length + 2)? as usize;

    let mut tables = None;
    let mut strings = None;
    let mut header = 16 + version_length + 4;
    for _ in 0..stream_count {
        let offset = read_u32(root, header)? as usize;
        let size = read_u32(root, header + 4)? as usize;
        let name = read_c_str(root, header + 8)?;
        let data = root.get(offset..offset + size).ok_or_else(|| {
            LookupError::MalformedImage(format!("metadata stream {} out of bounds", name))
        })?;
        match name.as_str() {
            "#~" | "#-" => tables = Some(data),
            "#Strings" => strings = Some(data),
            _ => {}
        }
        // name is null-terminated and padded to 4 bytes
        header += 8 + (name.len() + 4) / 4 * 4;
    }

    match (tables, strings) {
        (Some(tables), Some(strings)) => Ok(Streams { tables, strings }),
        _ => Err(LookupError::MalformedImage(
            "metadata without table or string stream".to_owned(),
        )),
    }
}

/// Index widths of one metadata table stream
struct Layout {
    rows: [u32; TABLE_COUNT],
    string: usize,
    guid: usize,
    blob: usize,
}

impl Layout {
    fn table(&self, table: usize) -> usize {
        if self.rows[table] < 1 << 16 {
            2
        } else {
            4
        }
    }

    fn coded(&self, tag_bits: u32, tables: &[usize]) -> usize {
        let max_rows = tables.iter().map(|&t| self.rows[t]).max().unwrap_or(0);
        if max_rows < 1 << (16 - tag_bits) {
            2
        } else {
            4
        }
    }

    fn type_def_or_ref(&self) -> usize {
        self.coded(2, &[TYPE_DEF, TYPE_REF, TYPE_SPEC])
    }

    fn method_def_or_ref(&self) -> usize {
        self.coded(1, &[METHOD_DEF, MEMBER_REF])
    }

    /// Size in bytes of one row of the given table
    fn row_size(&self, table: usize) -> Result<usize, LookupError> {
        let (s, g, b) = (self.string, self.guid, self.blob);
        let size = match table {
            0x00 => 2 + s + 3 * g,
            0x01 => self.coded(2, &[0x00, MODULE_REF, ASSEMBLY_REF, TYPE_REF]) + 2 * s,
            0x02 => {
                4 + 2 * s + self.type_def_or_ref() + self.table(FIELD) + self.table(METHOD_DEF)
            }
            0x03 => self.table(FIELD),
            0x04 => 2 + s + b,
            0x05 => self.table(METHOD_DEF),
            0x06 => 8 + s + b + self.table(PARAM),
            0x07 => self.table(PARAM),
            0x08 => 4 + s,
            0x09 => self.table(TYPE_DEF) + self.type_def_or_ref(),
            0x0A => {
                self.coded(3, &[TYPE_DEF, TYPE_REF, MODULE_REF, METHOD_DEF, TYPE_SPEC]) + s + b
            }
            0x0B => 2 + self.coded(2, &[FIELD, PARAM, PROPERTY]) + b,
            0x0C => {
                let parent = self.coded(
                    5,
                    &[
                        METHOD_DEF,
                        FIELD,
                        TYPE_REF,
                        TYPE_DEF,
                        PARAM,
                        INTERFACE_IMPL,
                        MEMBER_REF,
                        0x00,
                        DECL_SECURITY,
                        PROPERTY,
                        EVENT,
                        STAND_ALONE_SIG,
                        MODULE_REF,
                        TYPE_SPEC,
                        ASSEMBLY,
                        ASSEMBLY_REF,
                        FILE,
                        EXPORTED_TYPE,
                        MANIFEST_RESOURCE,
                        GENERIC_PARAM,
                        GENERIC_PARAM_CONSTRAINT,
                        METHOD_SPEC,
                    ],
                );
                parent + self.coded(3, &[METHOD_DEF, MEMBER_REF]) + b
            }
            0x0D => self.coded(1, &[FIELD, PARAM]) + b,
            0x0E => 2 + self.coded(2, &[TYPE_DEF, METHOD_DEF, ASSEMBLY]) + b,
            0x0F => 6 + self.table(TYPE_DEF),
            0x10 => 4 + self.table(FIELD),
            0x11 => b,
            0x12 => self.table(TYPE_DEF) + self.table(EVENT),
            0x13 => self.table(EVENT),
            0x14 => 2 + s + self.type_def_or_ref(),
            0x15 => self.table(TYPE_DEF) + self.table(PROPERTY),
            0x16 => self.table(PROPERTY),
            0x17 => 2 + s + b,
            0x18 => 2 + self.table(METHOD_DEF) + self.coded(1, &[EVENT, PROPERTY]),
            0x19 => self.table(TYPE_DEF) + 2 * self.method_def_or_ref(),
            0x1A => s,
            0x1B => b,
            0x1C => 2 + self.coded(1, &[FIELD, METHOD_DEF]) + s + self.table(MODULE_REF),
            0x1D => 4 + self.table(FIELD),
            0x1E => 8,
            0x1F => 4,
            0x20 => 16 + b + 2 * s,
            0x21 => 4,
            0x22 => 12,
            0x23 => 12 + 2 * b + 2 * s,
            _ => {
                return Err(LookupError::MalformedImage(format!(
                    "no row layout for metadata table {:#x}",
                    table
                )))
            }
        };
        Ok(size)
    }
}

fn read_index(bytes: &[u8], offset: usize, width: usize) -> Result<u32, LookupError> {
    if width == 2 {
        Ok(read_u16(bytes, offset)? as u32)
    } else {
        read_u32(bytes, offset)
    }
}

fn read_string(strings: &[u8], index: u32) -> Result<String, LookupError> {
    read_c_str(strings, index as usize)
}

/// Parse the metadata root (BSJB) and read the ModuleRef and AssemblyRef tables
pub fn parse_metadata(root: &[u8]) -> Result<ManagedReferences, LookupError> {
    let streams = find_streams(root)?;
    let tables = streams.tables;

    let heap_sizes = *tables
        .get(6)
        .ok_or_else(|| LookupError::MalformedImage("truncated table stream".to_owned()))?;
    let valid = u64::from(read_u32(tables, 8)?) | (u64::from(read_u32(tables, 12)?) << 32);

    let mut layout = Layout {
        rows: [0; TABLE_COUNT],
        string: if heap_sizes & 0x01 != 0 { 4 } else { 2 },
        guid: if heap_sizes & 0x02 != 0 { 4 } else { 2 },
        blob: if heap_sizes & 0x04 != 0 { 4 } else { 2 },
    };
    let mut cursor = 24;
    for (table, rows) in layout.rows.iter_mut().enumerate() {
        if valid & (1u64 << table) != 0 {
            *rows = read_u32(tables, cursor)?;
            cursor += 4;
        }
    }
    // extra data flag, found in some obfuscated or edit-and-continue images
    if heap_sizes & 0x40 != 0 {
        cursor += 4;
    }

    let mut table_offsets = [0usize; ASSEMBLY_REF + 1];
    for (table, offset) in table_offsets.iter_mut().enumerate() {
        *offset = cursor;
        if layout.rows[table] > 0 {
            cursor += layout.row_size(table)? * layout.rows[table] as usize;
        }
    }

    let mut references = ManagedReferences::default();

    let module_ref_size = layout.row_size(MODULE_REF)?;
    for row in 0..layout.rows[MODULE_REF] as usize {
        let offset = table_offsets[MODULE_REF] + row * module_ref_size;
        let name = read_string(streams.strings, read_index(tables, offset, layout.string)?)?;
        if !name.is_empty() {
            references.module_references.push(name);
        }
    }

    let assembly_ref_size = layout.row_size(ASSEMBLY_REF)?;
    for row in 0..layout.rows[ASSEMBLY_REF] as usize {
        let offset = table_offsets[ASSEMBLY_REF] + row * assembly_ref_size;
        let version = (0..4)
            .map(|i| read_u16(tables, offset + 2 * i).map(|v| v.to_string()))
            .collect::<Result<Vec<_>, LookupError>>()?
            .join(".");
        let name_offset = offset + 12 + layout.blob;
        let name = read_string(streams.strings, read_index(tables, name_offset, layout.string)?)?;
        references
            .assembly_references
            .push(AssemblyReference { name, version });
    }

    Ok(references)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::image::fixtures::{put_u16, put_u32};

    /// Metadata root with two ModuleRefs (user32.dll and an empty name) and one AssemblyRef
    /// (System.Runtime 8.0.0.0)
    pub(crate) fn metadata_root() -> Vec<u8> {
        let strings = b"\0user32.dll\0System.Runtime\0\0".to_vec();

        let mut tables = vec![0u8; 24];
        tables[4] = 2;
        let valid: u64 = (1 << 0x1A) | (1 << 0x23);
        put_u32(&mut tables, 8, valid as u32);
        put_u32(&mut tables, 12, (valid >> 32) as u32);
        tables.extend_from_slice(&2u32.to_le_bytes());
        tables.extend_from_slice(&1u32.to_le_bytes());
        // ModuleRef rows
        tables.extend_from_slice(&1u16.to_le_bytes());
        tables.extend_from_slice(&0u16.to_le_bytes());
        // AssemblyRef row
        let mut assembly_ref = vec![0u8; 20];
        put_u16(&mut assembly_ref, 0, 8);
        put_u16(&mut assembly_ref, 14, 12);
        tables.extend_from_slice(&assembly_ref);
        while tables.len() % 4 != 0 {
            tables.push(0);
        }

        let version = b"v4.0.30319\0\0";
        let headers_offset = 16 + version.len() + 4;
        let headers_size = (8 + 4) + (8 + 12);
        let tables_offset = headers_offset + headers_size;
        let strings_offset = tables_offset + tables.len();

        let mut root = vec![0u8; 16];
        put_u32(&mut root, 0, super::METADATA_SIGNATURE);
        put_u16(&mut root, 4, 1);
        put_u16(&mut root, 6, 1);
        put_u32(&mut root, 12, version.len() as u32);
        root.extend_from_slice(version);
        root.extend_from_slice(&0u16.to_le_bytes());
        root.extend_from_slice(&2u16.to_le_bytes());
        root.extend_from_slice(&(tables_offset as u32).to_le_bytes());
        root.extend_from_slice(&(tables.len() as u32).to_le_bytes());
        root.extend_from_slice(b"#~\0\0");
        root.extend_from_slice(&(strings_offset as u32).to_le_bytes());
        root.extend_from_slice(&(strings.len() as u32).to_le_bytes());
        root.extend_from_slice(b"#Strings\0\0\0\0");
        root.extend_from_slice(&tables);
        root.extend_from_slice(&strings);
        root
    }
}
