//! Support for walking the target module's Portable Executable headers.
//!
//! Discovery only needs two things from the image: the executable section
//! ranges to scan for signatures, and the size of the image.

use bytemuck::{Pod, Zeroable};

use crate::address::Address;
use crate::error::{Error, Result};
use crate::process::Process;

// Reference:
// https://learn.microsoft.com/en-us/windows/win32/debug/pe-format

#[derive(Debug, Copy, Clone, Zeroable, Pod)]
#[repr(C)]
struct DosHeader {
    e_magic: [u8; 2],
    _reserved: [u8; 58],
    e_lfanew: u32,
}

#[derive(Debug, Copy, Clone, Zeroable, Pod)]
#[repr(C)]
struct CoffHeader {
    magic: [u8; 4],
    machine: u16,
    number_of_sections: u16,
    time_date_stamp: u32,
    pointer_to_symbol_table: u32,
    number_of_symbols: u32,
    size_of_optional_header: u16,
    characteristics: u16,
}

#[derive(Debug, Copy, Clone, Zeroable, Pod)]
#[repr(C)]
struct SectionHeader {
    name: [u8; 8],
    virtual_size: u32,
    virtual_address: u32,
    size_of_raw_data: u32,
    pointer_to_raw_data: u32,
    pointer_to_relocations: u32,
    pointer_to_line_numbers: u32,
    number_of_relocations: u16,
    number_of_line_numbers: u16,
    characteristics: u32,
}

const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;

/// A section of the image, resolved to target addresses.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub base: Address,
    pub size: u64,
    pub executable: bool,
}

/// The parts of a module's PE headers that discovery consumes.
#[derive(Debug, Clone)]
pub struct PeImage {
    pub base: Address,
    pub size_of_image: u64,
    pub sections: Vec<Section>,
}

impl PeImage {
    /// Reads the PE headers of the module loaded at `base` in the target.
    pub fn read(process: &Process, base: Address) -> Result<Self> {
        let dos = process.read::<DosHeader>(base)?;
        if dos.e_magic != *b"MZ" {
            return Err(Error::CorruptLayout {
                location: "PE DOS magic",
            });
        }

        let coff_addr = base.add(dos.e_lfanew as u64);
        let coff = process.read::<CoffHeader>(coff_addr)?;
        if coff.magic != *b"PE\0\0" {
            return Err(Error::CorruptLayout {
                location: "PE COFF magic",
            });
        }

        // SizeOfImage sits at a fixed offset in the optional header for
        // both PE32 and PE32+.
        let optional_addr = coff_addr.add(24);
        let size_of_image = process.read::<u32>(optional_addr.add(56))? as u64;

        let mut sections = Vec::with_capacity(coff.number_of_sections as usize);
        let mut cursor = optional_addr.add(coff.size_of_optional_header as u64);
        for _ in 0..coff.number_of_sections {
            let raw = process.read::<SectionHeader>(cursor)?;
            let end = memchr::memchr(0, &raw.name).unwrap_or(raw.name.len());
            sections.push(Section {
                name: String::from_utf8_lossy(&raw.name[..end]).into_owned(),
                base: base.add(raw.virtual_address as u64),
                size: raw.virtual_size as u64,
                executable: raw.characteristics & IMAGE_SCN_MEM_EXECUTE != 0,
            });
            cursor = cursor.add(core::mem::size_of::<SectionHeader>() as u64);
        }

        Ok(Self {
            base,
            size_of_image,
            sections,
        })
    }

    /// The sections signature scans should cover.
    pub fn executable_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|s| s.executable)
    }
}
