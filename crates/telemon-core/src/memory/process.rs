//! Windows process accessor: toolhelp lookup, region walk, remote reads.

use tracing::debug;

use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Diagnostics::Debug::ReadProcessMemory;
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, PROCESSENTRY32W, Process32FirstW, Process32NextW,
    TH32CS_SNAPPROCESS,
};
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_PRIVATE, MEMORY_BASIC_INFORMATION, PAGE_GUARD, PAGE_NOACCESS, VirtualQueryEx,
};
use windows::Win32::System::Threading::{
    OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
};

use crate::error::{Error, Result};
use crate::memory::{MemoryAccessor, MemoryRegion, ProcessIdentity};

/// Highest user-mode address worth querying on x64 Windows.
const MAX_USER_ADDRESS: u64 = 0x0000_7FFF_FFFF_FFFF;

/// Read-only handle to a running process, found by executable name.
pub struct ProcessAccessor {
    handle: HANDLE,
    identity: ProcessIdentity,
}

// A process handle is valid for concurrent read access from any thread.
unsafe impl Send for ProcessAccessor {}
unsafe impl Sync for ProcessAccessor {}

impl ProcessAccessor {
    /// Open the first process whose executable name matches (case-insensitive).
    pub fn open(exe_name: &str) -> Result<Self> {
        let identity = find_process(exe_name)?
            .ok_or_else(|| Error::ProcessNotFound(exe_name.to_string()))?;

        let handle = unsafe {
            OpenProcess(
                PROCESS_VM_READ | PROCESS_QUERY_INFORMATION,
                false,
                identity.pid,
            )
        }
        .map_err(|e| Error::ProcessOpenFailed(format!("{}: {e}", identity)))?;

        debug!("Opened {} for reading", identity);
        Ok(Self { handle, identity })
    }
}

impl Drop for ProcessAccessor {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

impl MemoryAccessor for ProcessAccessor {
    fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    fn regions(&self) -> Result<Vec<MemoryRegion>> {
        let mut regions = Vec::new();
        let mut address: u64 = 0;

        while address < MAX_USER_ADDRESS {
            let mut info = MEMORY_BASIC_INFORMATION::default();
            let written = unsafe {
                VirtualQueryEx(
                    self.handle,
                    Some(address as *const core::ffi::c_void),
                    &mut info,
                    std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if written == 0 || info.RegionSize == 0 {
                break;
            }

            if info.State == MEM_COMMIT {
                let protect = info.Protect.0;
                regions.push(MemoryRegion {
                    base: info.BaseAddress as u64,
                    size: info.RegionSize as u64,
                    readable: protect != 0
                        && protect & (PAGE_NOACCESS.0 | PAGE_GUARD.0) == 0,
                    private: info.Type == MEM_PRIVATE,
                });
            }

            address = info.BaseAddress as u64 + info.RegionSize as u64;
        }

        debug!("Enumerated {} committed regions", regions.len());
        Ok(regions)
    }

    fn read_bytes(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        let mut read: usize = 0;

        unsafe {
            ReadProcessMemory(
                self.handle,
                address as *const core::ffi::c_void,
                buffer.as_mut_ptr() as *mut core::ffi::c_void,
                len,
                Some(&mut read),
            )
        }
        .map_err(|e| Error::read_failed(address, e.to_string()))?;

        if read != len {
            return Err(Error::read_failed(
                address,
                format!("partial read ({read} of {len} bytes)"),
            ));
        }
        Ok(buffer)
    }
}

/// Walk the process snapshot for an executable name match.
fn find_process(exe_name: &str) -> Result<Option<ProcessIdentity>> {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }
        .map_err(|e| Error::ProcessOpenFailed(format!("snapshot failed: {e}")))?;

    let mut entry = PROCESSENTRY32W {
        dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };

    let mut found = None;
    if unsafe { Process32FirstW(snapshot, &mut entry) }.is_ok() {
        loop {
            let name = exe_file_name(&entry);
            if name.eq_ignore_ascii_case(exe_name) {
                found = Some(ProcessIdentity::new(
                    entry.th32ProcessID,
                    entry.th32ParentProcessID,
                    name,
                ));
                break;
            }
            if unsafe { Process32NextW(snapshot, &mut entry) }.is_err() {
                break;
            }
        }
    }

    unsafe {
        let _ = CloseHandle(snapshot);
    }
    Ok(found)
}

fn exe_file_name(entry: &PROCESSENTRY32W) -> String {
    let len = entry
        .szExeFile
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(entry.szExeFile.len());
    String::from_utf16_lossy(&entry.szExeFile[..len])
}
