//! Windows backend: `ReadProcessMemory` plus the PSAPI module list and the
//! module's version resource.

use std::ffi::c_void;
use std::io;
use std::mem;

use windows::Win32::Foundation::{CloseHandle, HANDLE, HMODULE, MAX_PATH};
use windows::Win32::Storage::FileSystem::{
    GetFileVersionInfoSizeW, GetFileVersionInfoW, VerQueryValueW, VS_FIXEDFILEINFO,
};
use windows::Win32::System::Diagnostics::Debug::ReadProcessMemory;
use windows::Win32::System::Memory::{
    VirtualQueryEx, MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
};
use windows::Win32::System::ProcessStatus::{
    K32EnumProcessModulesEx, K32GetModuleBaseNameW, K32GetModuleFileNameExW,
    K32GetModuleInformation, LIST_MODULES_64BIT, MODULEINFO,
};
use windows::Win32::System::Threading::{
    OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
};

use crate::address::Address;
use crate::error::{Error, Result};

use super::{FileVersion, MemoryRegion, MemorySource, ModuleInfo};

pub struct WindowsProcess {
    handle: HANDLE,
    pid: u32,
    name: String,
}

// SAFETY: the handle is only used for read-type syscalls, which are
// thread-safe; the OS handle itself is just an opaque token.
unsafe impl Send for WindowsProcess {}
unsafe impl Sync for WindowsProcess {}

impl WindowsProcess {
    pub fn open(pid: u32) -> Result<Self> {
        let handle = unsafe {
            OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid)
        }
        .map_err(|_| Error::NotFound {
            what: "process",
            key: pid.to_string(),
        })?;

        let mut this = Self {
            handle,
            pid,
            name: String::new(),
        };
        this.name = this
            .main_module_base_name()
            .unwrap_or_else(|| pid.to_string());
        Ok(this)
    }

    fn raw_modules(&self) -> io::Result<Vec<HMODULE>> {
        let mut handles = vec![HMODULE::default(); 1024];
        let mut needed = 0u32;
        unsafe {
            K32EnumProcessModulesEx(
                self.handle,
                handles.as_mut_ptr(),
                (handles.len() * mem::size_of::<HMODULE>()) as u32,
                &mut needed,
                LIST_MODULES_64BIT,
            )
        }
        .ok()
        .map_err(|e| io::Error::other(e.message()))?;
        handles.truncate(needed as usize / mem::size_of::<HMODULE>());
        Ok(handles)
    }

    fn main_module_base_name(&self) -> Option<String> {
        let module = *self.raw_modules().ok()?.first()?;
        let mut name = [0u16; MAX_PATH as usize];
        let len = unsafe { K32GetModuleBaseNameW(self.handle, Some(module), &mut name) };
        (len > 0).then(|| String::from_utf16_lossy(&name[..len as usize]))
    }

    fn module_path(&self, module: HMODULE) -> Option<Vec<u16>> {
        let mut path = [0u16; MAX_PATH as usize];
        let len = unsafe { K32GetModuleFileNameExW(Some(self.handle), Some(module), &mut path) };
        (len > 0).then(|| {
            let mut path = path[..len as usize].to_vec();
            path.push(0);
            path
        })
    }
}

impl Drop for WindowsProcess {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

impl MemorySource for WindowsProcess {
    fn read_bytes_into(&self, addr: Address, buf: &mut [u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut copied = 0usize;
        unsafe {
            ReadProcessMemory(
                self.handle,
                addr.value() as *const c_void,
                buf.as_mut_ptr().cast(),
                buf.len(),
                Some(&mut copied),
            )
        }
        .map_err(|e| io::Error::other(e.message()))?;
        if copied == buf.len() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short remote read",
            ))
        }
    }

    fn modules(&self) -> io::Result<Vec<ModuleInfo>> {
        let mut modules = Vec::new();
        for handle in self.raw_modules()? {
            let mut info = MODULEINFO::default();
            let ok = unsafe {
                K32GetModuleInformation(
                    self.handle,
                    handle,
                    &mut info,
                    mem::size_of::<MODULEINFO>() as u32,
                )
            };
            if !ok.as_bool() {
                continue;
            }
            let mut name = [0u16; MAX_PATH as usize];
            let len = unsafe { K32GetModuleBaseNameW(self.handle, Some(handle), &mut name) };
            if len == 0 {
                continue;
            }
            modules.push(ModuleInfo {
                name: String::from_utf16_lossy(&name[..len as usize]),
                base: Address::new(info.lpBaseOfDll as u64),
                size: info.SizeOfImage as u64,
            });
        }
        Ok(modules)
    }

    fn regions(&self) -> io::Result<Vec<MemoryRegion>> {
        let mut regions = Vec::new();
        let mut cursor = 0u64;
        loop {
            let mut info = MEMORY_BASIC_INFORMATION::default();
            let got = unsafe {
                VirtualQueryEx(
                    self.handle,
                    Some(cursor as *const c_void),
                    &mut info,
                    mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if got == 0 {
                break;
            }
            let readable = info.State == MEM_COMMIT
                && [
                    PAGE_READONLY,
                    PAGE_READWRITE,
                    PAGE_WRITECOPY,
                    PAGE_EXECUTE_READ,
                    PAGE_EXECUTE_READWRITE,
                    PAGE_EXECUTE_WRITECOPY,
                ]
                .contains(&info.Protect);
            if info.State == MEM_COMMIT {
                regions.push(MemoryRegion {
                    base: Address::new(info.BaseAddress as u64),
                    size: info.RegionSize as u64,
                    readable,
                });
            }
            cursor = info.BaseAddress as u64 + info.RegionSize as u64;
        }
        Ok(regions)
    }

    fn file_version(&self, module_name: &str) -> Option<FileVersion> {
        let module = self
            .raw_modules()
            .ok()?
            .into_iter()
            .find(|&handle| {
                let mut name = [0u16; MAX_PATH as usize];
                let len =
                    unsafe { K32GetModuleBaseNameW(self.handle, Some(handle), &mut name) };
                len > 0
                    && String::from_utf16_lossy(&name[..len as usize])
                        .eq_ignore_ascii_case(module_name)
            })?;
        let path = self.module_path(module)?;

        let path = windows::core::PCWSTR(path.as_ptr());
        let size = unsafe { GetFileVersionInfoSizeW(path, None) };
        if size == 0 {
            return None;
        }
        let mut data = vec![0u8; size as usize];
        unsafe { GetFileVersionInfoW(path, None, size, data.as_mut_ptr().cast()) }.ok()?;

        let mut fixed: *mut VS_FIXEDFILEINFO = std::ptr::null_mut();
        let mut fixed_len = 0u32;
        let ok = unsafe {
            VerQueryValueW(
                data.as_ptr().cast(),
                windows::core::w!("\\"),
                &mut fixed as *mut _ as *mut *mut c_void,
                &mut fixed_len,
            )
        };
        if !ok.as_bool() || fixed.is_null() {
            return None;
        }
        let info = unsafe { *fixed };
        Some(FileVersion {
            major: info.dwFileVersionMS >> 16,
            minor: info.dwFileVersionMS & 0xFFFF,
            patch: info.dwFileVersionLS >> 16,
            build: info.dwFileVersionLS & 0xFFFF,
        })
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn process_name(&self) -> &str {
        &self.name
    }
}
