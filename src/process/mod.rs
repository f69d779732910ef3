//! Attaching to the target process and reading its memory.
//!
//! The reader is deliberately dumb: every read is single-shot and bounded,
//! partial reads fail, nothing is cached and nothing is retried. Retry
//! policy belongs to the caller.

use std::io;
use std::mem;

use bytemuck::AnyBitPattern;

use crate::address::Address;
use crate::error::{Error, Result};

pub mod list;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

pub use list::{system_processes, ProcessListing};

/// A loaded module of the target process.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub name: String,
    pub base: Address,
    pub size: u64,
}

impl ModuleInfo {
    /// Whether `addr` lies inside `[base, base + size)`.
    pub fn contains(&self, addr: Address) -> bool {
        addr.value() >= self.base.value() && addr.value() < self.base.value() + self.size
    }
}

/// A committed region of the target's address space.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: Address,
    pub size: u64,
    pub readable: bool,
}

/// File-version metadata of a module, as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u32,
}

/// Raw access to a target process.
///
/// The OS backends implement this; tests substitute an in-memory image.
/// Everything above this trait is platform-independent.
pub trait MemorySource: Send + Sync {
    /// Fills `buf` from target memory at `addr`. Partial reads are errors.
    fn read_bytes_into(&self, addr: Address, buf: &mut [u8]) -> io::Result<()>;

    /// Enumerates the loaded modules. Called once, on attach.
    fn modules(&self) -> io::Result<Vec<ModuleInfo>>;

    /// Enumerates committed memory regions.
    fn regions(&self) -> io::Result<Vec<MemoryRegion>>;

    /// File-version metadata of the named module, when the OS exposes it.
    fn file_version(&self, module_name: &str) -> Option<FileVersion>;

    fn pid(&self) -> u32;

    /// The target's executable name.
    fn process_name(&self) -> &str;
}

/// The modules of the attached process, frozen at attach time.
///
/// Rebuilt only by re-attaching.
#[derive(Debug, Clone)]
pub struct ModuleMap {
    modules: Vec<ModuleInfo>,
    main: usize,
}

impl ModuleMap {
    fn new(modules: Vec<ModuleInfo>, process_name: &str) -> Result<Self> {
        if modules.is_empty() {
            return Err(Error::NotFound {
                what: "module",
                key: process_name.to_owned(),
            });
        }
        let main = modules
            .iter()
            .position(|m| m.name.eq_ignore_ascii_case(process_name))
            .unwrap_or(0);
        Ok(Self { modules, main })
    }

    /// The module the process was started from.
    pub fn main_module(&self) -> &ModuleInfo {
        &self.modules[self.main]
    }

    /// Base address of the named module, case-insensitive.
    pub fn base(&self, name: &str) -> Option<Address> {
        self.modules
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
            .map(|m| m.base)
    }

    /// Whether `addr` points into any loaded module.
    pub fn contains(&self, addr: Address) -> bool {
        self.modules.iter().any(|m| m.contains(addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modules.iter()
    }
}

/// An attached target process: the OS handle plus its frozen module map.
pub struct Process {
    source: Box<dyn MemorySource>,
    modules: ModuleMap,
}

impl Process {
    /// Attaches to the process with the given pid using the OS backend.
    #[cfg(windows)]
    pub fn attach(pid: u32) -> Result<Self> {
        Self::from_source(Box::new(windows::WindowsProcess::open(pid)?))
    }

    /// Attaches to the process with the given pid using the OS backend.
    #[cfg(unix)]
    pub fn attach(pid: u32) -> Result<Self> {
        Self::from_source(Box::new(unix::UnixProcess::open(pid)?))
    }

    /// Wraps an already-opened source, building the module map once.
    pub fn from_source(source: Box<dyn MemorySource>) -> Result<Self> {
        let modules = source.modules().map_err(|_| Error::NotAttached)?;
        let modules = ModuleMap::new(modules, source.process_name())?;
        Ok(Self { source, modules })
    }

    pub fn pid(&self) -> u32 {
        self.source.pid()
    }

    pub fn name(&self) -> &str {
        self.source.process_name()
    }

    pub fn modules(&self) -> &ModuleMap {
        &self.modules
    }

    pub fn regions(&self) -> Vec<MemoryRegion> {
        self.source.regions().unwrap_or_default()
    }

    pub fn file_version(&self, module_name: &str) -> Option<FileVersion> {
        self.source.file_version(module_name)
    }

    /// Reads `buf.len()` bytes at `addr`. Partial reads fail.
    pub fn read_into(&self, addr: Address, buf: &mut [u8]) -> Result<()> {
        self.source
            .read_bytes_into(addr, buf)
            .map_err(|source| Error::ReadFault {
                address: addr,
                len: buf.len(),
                field: "bytes",
                source: Some(source),
            })
    }

    /// Reads `len` bytes at `addr` into a fresh buffer.
    pub fn read_bytes(&self, addr: Address, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(addr, &mut buf)?;
        Ok(buf)
    }

    /// Reads a value of the given type out of target memory.
    pub fn read<T: AnyBitPattern>(&self, addr: Address) -> Result<T> {
        let mut buf = vec![0u8; mem::size_of::<T>()];
        self.read_into(addr, &mut buf)?;
        Ok(bytemuck::pod_read_unaligned(&buf))
    }

    /// Reads a pointer-sized value and wraps it as an [`Address`].
    pub fn read_ptr(&self, addr: Address) -> Result<Address> {
        self.read::<u64>(addr).map(Address::new)
    }

    /// Reads a NUL-terminated UTF-8 string of at most `max_len` bytes.
    ///
    /// Walks forward in chunks and degrades to single-byte reads at the
    /// edge of readable memory, so a string right at the end of a region
    /// still decodes. Running off readable memory ends the string.
    pub fn read_cstring(&self, addr: Address, max_len: usize) -> Result<String> {
        const CHUNK: usize = 32;
        let mut out = Vec::new();
        let mut cursor = addr;
        while out.len() < max_len {
            let want = CHUNK.min(max_len - out.len());
            let mut buf = [0u8; CHUNK];
            if self.source.read_bytes_into(cursor, &mut buf[..want]).is_ok() {
                match memchr::memchr(0, &buf[..want]) {
                    Some(pos) => {
                        out.extend_from_slice(&buf[..pos]);
                        return Self::decode_utf8(out);
                    }
                    None => {
                        out.extend_from_slice(&buf[..want]);
                        cursor = cursor.add(want as u64);
                    }
                }
            } else {
                let mut byte = [0u8; 1];
                let mut progressed = false;
                while out.len() < max_len
                    && self.source.read_bytes_into(cursor, &mut byte).is_ok()
                {
                    progressed = true;
                    if byte[0] == 0 {
                        return Self::decode_utf8(out);
                    }
                    out.push(byte[0]);
                    cursor = cursor.add(1);
                }
                if out.is_empty() && !progressed {
                    return Err(Error::read_fault(addr, max_len, "cstring"));
                }
                return Self::decode_utf8(out);
            }
        }
        Self::decode_utf8(out)
    }

    fn decode_utf8(bytes: Vec<u8>) -> Result<String> {
        String::from_utf8(bytes).map_err(|_| Error::CorruptLayout {
            location: "cstring payload",
        })
    }

    /// Reads `code_units` UTF-16 code units and transcodes them.
    pub fn read_wstring(&self, addr: Address, code_units: usize) -> Result<String> {
        let mut units = vec![0u16; code_units];
        self.read_into(addr, bytemuck::cast_slice_mut(&mut units))?;
        let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
        Ok(String::from_utf16_lossy(&units[..end]))
    }

    /// The pointer validity oracle: `addr` is non-null and either inside a
    /// module or a single byte at it is readable.
    pub fn is_pointer(&self, addr: Address) -> bool {
        if addr.is_null() {
            return false;
        }
        if self.modules.contains(addr) {
            return true;
        }
        let mut probe = [0u8; 1];
        self.source.read_bytes_into(addr, &mut probe).is_ok()
    }
}
