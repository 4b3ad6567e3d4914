//! Raw access to the PE data directories that neither goblin nor pelite expose in the form we
//! need (delay imports and the CLR header)
//!
//! All reads are bounds checked and all RVA arithmetic is checked; anything pointing outside
//! the file is reported as a `MalformedImage` error.

use crate::common::LookupError;
use crate::pe::{ImportDescriptor, ImportedFunction};
use dataview::DataView;

pub(crate) const DIRECTORY_DELAY_IMPORT: usize = 13;
pub(crate) const DIRECTORY_CLR: usize = 14;

// upper bound on table walks, so that a corrupt file can't keep us spinning
const MAX_TABLE_ENTRIES: u32 = 0x10000;

fn truncated(what: &str, offset: usize) -> LookupError {
    LookupError::MalformedImage(format!("{} out of bounds at offset {:#x}", what, offset))
}

/// `base + offset`, or an error if the sum leaves the 32-bit address space
fn rva_add(base: u32, offset: u32) -> Result<u32, LookupError> {
    base.checked_add(offset).ok_or_else(|| {
        LookupError::MalformedImage(format!("RVA {:#x} + {:#x} overflows", base, offset))
    })
}

/// RVA of the `index`-th entry of a table of `entry_size` byte entries
fn rva_index(table: u32, entry_size: u32, index: u32) -> Result<u32, LookupError> {
    let offset = entry_size.checked_mul(index).ok_or_else(|| {
        LookupError::MalformedImage(format!("table entry {} at RVA {:#x} overflows", index, table))
    })?;
    rva_add(table, offset)
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> Result<u16, LookupError> {
    DataView::from(bytes)
        .try_read::<u16>(offset)
        .map(u16::from_le)
        .ok_or_else(|| truncated("u16", offset))
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, LookupError> {
    DataView::from(bytes)
        .try_read::<u32>(offset)
        .map(u32::from_le)
        .ok_or_else(|| truncated("u32", offset))
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> Result<u64, LookupError> {
    DataView::from(bytes)
        .try_read::<u64>(offset)
        .map(u64::from_le)
        .ok_or_else(|| truncated("u64", offset))
}

/// Null-terminated string starting at `offset`, decoded lossily
pub(crate) fn read_c_str(bytes: &[u8], offset: usize) -> Result<String, LookupError> {
    let tail = bytes
        .get(offset..)
        .ok_or_else(|| truncated("string", offset))?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| truncated("unterminated string", offset))?;
    Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
}

#[derive(Debug, Clone, Copy)]
struct Section {
    virtual_address: u32,
    virtual_size: u32,
    raw_offset: u32,
    raw_size: u32,
}

/// Header-level view of a PE file
pub struct PeImage<'a> {
    bytes: &'a [u8],
    is_64: bool,
    image_base: u64,
    directories: Vec<(u32, u32)>,
    sections: Vec<Section>,
}

impl<'a> PeImage<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, LookupError> {
        if !bytes.starts_with(b"MZ") {
            return Err(LookupError::MalformedImage(
                "missing MZ signature".to_owned(),
            ));
        }
        let pe_offset = read_u32(bytes, 0x3c)? as usize;
        if bytes.get(pe_offset..pe_offset + 4) != Some(&b"PE\0\0"[..]) {
            return Err(LookupError::MalformedImage(
                "missing PE signature".to_owned(),
            ));
        }

        let file_header = pe_offset + 4;
        let number_of_sections = read_u16(bytes, file_header + 2)? as usize;
        let size_of_optional_header = read_u16(bytes, file_header + 16)? as usize;
        let optional_header = file_header + 20;

        let (is_64, image_base, rva_count_offset) = match read_u16(bytes, optional_header)? {
            0x10b => (
                false,
                read_u32(bytes, optional_header + 28)? as u64,
                optional_header + 92,
            ),
            0x20b => (
                true,
                read_u64(bytes, optional_header + 24)?,
                optional_header + 108,
            ),
            magic => {
                return Err(LookupError::MalformedImage(format!(
                    "unknown optional header magic {:#x}",
                    magic
                )))
            }
        };

        let number_of_directories = (read_u32(bytes, rva_count_offset)? as usize).min(16);
        let directories = (0..number_of_directories)
            .map(|i| {
                let entry = rva_count_offset + 4 + 8 * i;
                Ok((read_u32(bytes, entry)?, read_u32(bytes, entry + 4)?))
            })
            .collect::<Result<Vec<_>, LookupError>>()?;

        let section_table = optional_header + size_of_optional_header;
        let sections = (0..number_of_sections)
            .map(|i| {
                let header = section_table + 40 * i;
                Ok(Section {
                    virtual_size: read_u32(bytes, header + 8)?,
                    virtual_address: read_u32(bytes, header + 12)?,
                    raw_size: read_u32(bytes, header + 16)?,
                    raw_offset: read_u32(bytes, header + 20)?,
                })
            })
            .collect::<Result<Vec<_>, LookupError>>()?;

        Ok(Self {
            bytes,
            is_64,
            image_base,
            directories,
            sections,
        })
    }

    pub fn is_64(&self) -> bool {
        self.is_64
    }

    /// (RVA, size) of a data directory, if present
    pub fn directory(&self, index: usize) -> Option<(u32, u32)> {
        self.directories
            .get(index)
            .copied()
            .filter(|&(rva, _)| rva != 0)
    }

    pub fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        for s in &self.sections {
            let extent = s.virtual_size.max(s.raw_size);
            if rva >= s.virtual_address && rva - s.virtual_address < extent {
                let delta = rva - s.virtual_address;
                if delta >= s.raw_size {
                    // inside the zero-filled tail of the section
                    return None;
                }
                return s.raw_offset.checked_add(delta).map(|offset| offset as usize);
            }
        }
        // headers are mapped 1:1
        let first_section = self.sections.iter().map(|s| s.virtual_address).min();
        if first_section.map(|va| rva < va).unwrap_or(true) && (rva as usize) < self.bytes.len() {
            Some(rva as usize)
        } else {
            None
        }
    }

    fn offset_of(&self, rva: u32, what: &str) -> Result<usize, LookupError> {
        self.rva_to_offset(rva).ok_or_else(|| {
            LookupError::MalformedImage(format!("{} at RVA {:#x} is not mapped", what, rva))
        })
    }

    fn u32_at_rva(&self, rva: u32) -> Result<u32, LookupError> {
        read_u32(self.bytes, self.offset_of(rva, "u32")?)
    }

    fn u64_at_rva(&self, rva: u32) -> Result<u64, LookupError> {
        read_u64(self.bytes, self.offset_of(rva, "u64")?)
    }

    fn c_str_at_rva(&self, rva: u32) -> Result<String, LookupError> {
        read_c_str(self.bytes, self.offset_of(rva, "string")?)
    }

    pub fn bytes_at_rva(&self, rva: u32, len: u32) -> Result<&'a [u8], LookupError> {
        let start = self.offset_of(rva, "data")?;
        start
            .checked_add(len as usize)
            .and_then(|end| self.bytes.get(start..end))
            .ok_or_else(|| truncated("data", start))
    }

    /// Delay-load import descriptors, in table order
    pub fn delay_imports(&self) -> Result<Vec<ImportDescriptor>, LookupError> {
        let (dir_rva, _) = match self.directory(DIRECTORY_DELAY_IMPORT) {
            Some(d) => d,
            None => return Ok(Vec::new()),
        };

        let mut descriptors = Vec::new();
        for i in 0..MAX_TABLE_ENTRIES {
            let entry = rva_index(dir_rva, 32, i)?;
            let attributes = self.u32_at_rva(entry)?;
            let dll_name = self.u32_at_rva(rva_add(entry, 4)?)?;
            if dll_name == 0 {
                break;
            }
            let name_table = self.u32_at_rva(rva_add(entry, 16)?)?;
            // bit 0 set: the fields are RVAs; otherwise (VC 6 era) they are VAs
            let to_rva = |field: u32| -> u32 {
                if attributes & 1 == 1 {
                    field
                } else {
                    (field as u64).wrapping_sub(self.image_base) as u32
                }
            };
            descriptors.push(ImportDescriptor {
                dll: self.c_str_at_rva(to_rva(dll_name))?,
                delay: true,
                functions: if name_table != 0 {
                    self.thunk_names(to_rva(name_table))?
                } else {
                    Vec::new()
                },
            });
        }
        Ok(descriptors)
    }

    fn thunk_names(&self, table_rva: u32) -> Result<Vec<ImportedFunction>, LookupError> {
        let thunk_size: u32 = if self.is_64 { 8 } else { 4 };
        let ordinal_flag: u64 = if self.is_64 { 1 << 63 } else { 1 << 31 };
        let mut functions = Vec::new();
        for i in 0..MAX_TABLE_ENTRIES {
            let thunk_rva = rva_index(table_rva, thunk_size, i)?;
            let thunk = if self.is_64 {
                self.u64_at_rva(thunk_rva)?
            } else {
                self.u32_at_rva(thunk_rva)? as u64
            };
            if thunk == 0 {
                break;
            }
            if thunk & ordinal_flag != 0 {
                functions.push(ImportedFunction {
                    name: None,
                    ordinal: Some((thunk & 0xffff) as u16),
                });
            } else {
                // hint/name entry: u16 hint followed by the name
                let hint_name = (thunk & 0x7fff_ffff) as u32;
                functions.push(ImportedFunction {
                    name: Some(self.c_str_at_rva(rva_add(hint_name, 2)?)?),
                    ordinal: None,
                });
            }
        }
        Ok(functions)
    }

    /// Metadata root of a managed image, if the file has a CLR header
    pub fn clr_metadata(&self) -> Result<Option<&'a [u8]>, LookupError> {
        let (cor20_rva, _) = match self.directory(DIRECTORY_CLR) {
            Some(d) => d,
            None => return Ok(None),
        };
        let metadata_rva = self.u32_at_rva(rva_add(cor20_rva, 8)?)?;
        let metadata_size = self.u32_at_rva(rva_add(cor20_rva, 12)?)?;
        if metadata_rva == 0 {
            return Ok(None);
        }
        Ok(Some(self.bytes_at_rva(metadata_rva, metadata_size)?))
    }
}

/// Minimal PE writer, enough to exercise the directory readers
#[cfg(test)]
pub(crate) mod fixtures {
    pub(crate) const DIRECTORY_EXPORT: usize = 0;
    pub(crate) const DIRECTORY_RESOURCE: usize = 2;
    /// file offset of the header of the only section
    pub(crate) const SECTION_HEADER: usize = 0x138;
    pub(crate) const SECTION_RVA: u32 = 0x1000;
    pub(crate) const SECTION_RAW: u32 = 0x200;
    pub(crate) const SECTION_SIZE: u32 = 0x1000;

    pub(crate) fn put_u16(buf: &mut [u8], offset: usize, v: u16) {
        buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_u32(buf: &mut [u8], offset: usize, v: u32) {
        buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_str(buf: &mut [u8], offset: usize, s: &str) {
        buf[offset..offset + s.len()].copy_from_slice(s.as_bytes());
        buf[offset + s.len()] = 0;
    }

    /// PE32 image with a single section mapped at `SECTION_RVA`; `directories` are
    /// (index, rva, size) triples, `fill` writes the section content (offsets are RVAs)
    pub(crate) fn pe32(directories: &[(usize, u32, u32)], fill: impl FnOnce(&mut Section)) -> Vec<u8> {
        let mut buf = vec![0u8; (SECTION_RAW + SECTION_SIZE) as usize];
        buf[0..2].copy_from_slice(b"MZ");
        put_u32(&mut buf, 0x3c, 0x40);
        buf[0x40..0x44].copy_from_slice(b"PE\0\0");
        let file_header = 0x44;
        put_u16(&mut buf, file_header, 0x14c);
        put_u16(&mut buf, file_header + 2, 1);
        put_u16(&mut buf, file_header + 16, 0xe0);
        let optional = file_header + 20;
        put_u16(&mut buf, optional, 0x10b);
        put_u32(&mut buf, optional + 28, 0x40_0000);
        put_u32(&mut buf, optional + 32, SECTION_RVA);
        put_u32(&mut buf, optional + 36, SECTION_RAW);
        put_u32(&mut buf, optional + 56, SECTION_RVA + SECTION_SIZE);
        put_u32(&mut buf, optional + 60, SECTION_RAW);
        put_u32(&mut buf, optional + 92, 16);
        for &(index, rva, size) in directories {
            put_u32(&mut buf, optional + 96 + 8 * index, rva);
            put_u32(&mut buf, optional + 100 + 8 * index, size);
        }
        let section = SECTION_HEADER;
        buf[section..section + 6].copy_from_slice(b".rdata");
        put_u32(&mut buf, section + 8, SECTION_SIZE);
        put_u32(&mut buf, section + 12, SECTION_RVA);
        put_u32(&mut buf, section + 16, SECTION_SIZE);
        put_u32(&mut buf, section + 20, SECTION_RAW);
        let mut s = Section { buf };
        fill(&mut s);
        s.buf
    }

    pub(crate) struct Section {
        buf: Vec<u8>,
    }

    impl Section {
        fn at(rva: u32) -> usize {
            (rva - SECTION_RVA + SECTION_RAW) as usize
        }
        pub(crate) fn u16(&mut self, rva: u32, v: u16) {
            put_u16(&mut self.buf, Self::at(rva), v)
        }
        pub(crate) fn u32(&mut self, rva: u32, v: u32) {
            put_u32(&mut self.buf, Self::at(rva), v)
        }
        pub(crate) fn str(&mut self, rva: u32, s: &str) {
            put_str(&mut self.buf, Self::at(rva), s)
        }
        pub(crate) fn bytes(&mut self, rva: u32, b: &[u8]) {
            let start = Self::at(rva);
            self.buf[start..start + b.len()].copy_from_slice(b);
        }
    }
}
