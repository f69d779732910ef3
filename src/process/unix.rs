//! Linux backend: `process_vm_readv` plus `/proc/<pid>/maps`.

use std::fs;
use std::io;
use std::path::Path;

use crate::address::Address;
use crate::error::{Error, Result};

use super::{FileVersion, MemoryRegion, MemorySource, ModuleInfo};

pub struct UnixProcess {
    pid: u32,
    name: String,
}

impl UnixProcess {
    pub fn open(pid: u32) -> Result<Self> {
        let comm = fs::read_to_string(format!("/proc/{pid}/comm"))
            .map_err(|_| Error::NotFound {
                what: "process",
                key: pid.to_string(),
            })?;
        Ok(Self {
            pid,
            name: comm.trim_end().to_owned(),
        })
    }

    fn maps(&self) -> io::Result<Vec<MapsEntry>> {
        let text = fs::read_to_string(format!("/proc/{}/maps", self.pid))?;
        Ok(text.lines().filter_map(MapsEntry::parse).collect())
    }
}

struct MapsEntry {
    start: u64,
    end: u64,
    readable: bool,
    path: Option<String>,
}

impl MapsEntry {
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let perms = fields.next()?;
        let (start, end) = range.split_once('-')?;
        let path = fields.nth(3).filter(|p| p.starts_with('/'));
        Some(Self {
            start: u64::from_str_radix(start, 16).ok()?,
            end: u64::from_str_radix(end, 16).ok()?,
            readable: perms.starts_with('r'),
            path: path.map(str::to_owned),
        })
    }
}

impl MemorySource for UnixProcess {
    fn read_bytes_into(&self, addr: Address, buf: &mut [u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let local = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: addr.value() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // SAFETY: both iovecs describe valid lengths; the local one points
        // into `buf`, which outlives the call.
        let copied =
            unsafe { libc::process_vm_readv(self.pid as libc::pid_t, &local, 1, &remote, 1, 0) };
        if copied == buf.len() as isize {
            Ok(())
        } else if copied < 0 {
            Err(io::Error::last_os_error())
        } else {
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short remote read",
            ))
        }
    }

    fn modules(&self) -> io::Result<Vec<ModuleInfo>> {
        // Group file-backed mappings by path; the module spans the first
        // to last mapping of that file.
        let mut modules: Vec<(String, u64, u64)> = Vec::new();
        for entry in self.maps()? {
            let Some(path) = entry.path else { continue };
            match modules.iter_mut().find(|(p, _, _)| *p == path) {
                Some((_, start, end)) => {
                    *start = (*start).min(entry.start);
                    *end = (*end).max(entry.end);
                }
                None => modules.push((path, entry.start, entry.end)),
            }
        }
        Ok(modules
            .into_iter()
            .map(|(path, start, end)| ModuleInfo {
                name: Path::new(&path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or(path),
                base: Address::new(start),
                size: end - start,
            })
            .collect())
    }

    fn regions(&self) -> io::Result<Vec<MemoryRegion>> {
        Ok(self
            .maps()?
            .into_iter()
            .map(|e| MemoryRegion {
                base: Address::new(e.start),
                size: e.end - e.start,
                readable: e.readable,
            })
            .collect())
    }

    fn file_version(&self, _module_name: &str) -> Option<FileVersion> {
        // ELF targets carry no version resource.
        None
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn process_name(&self) -> &str {
        &self.name
    }
}
