//! In-memory accessor for tests: scripted regions, mutation, failure injection.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::memory::{MemoryAccessor, MemoryRegion, ProcessIdentity};

struct MockRegion {
    info: MemoryRegion,
    /// `None` simulates a region that exists but cannot be read.
    data: Option<Mutex<Vec<u8>>>,
}

pub struct MockAccessor {
    identity: ProcessIdentity,
    regions: Vec<MockRegion>,
    dead: AtomicBool,
}

impl MockAccessor {
    /// Overwrite bytes at an absolute address, e.g. to break a liveness check.
    pub fn write(&self, address: u64, bytes: &[u8]) {
        for region in &self.regions {
            if region.info.contains(address) {
                if let Some(data) = &region.data {
                    let start = (address - region.info.base) as usize;
                    let mut data = data.lock().unwrap();
                    data[start..start + bytes.len()].copy_from_slice(bytes);
                }
                return;
            }
        }
        panic!("mock write outside any region: {address:#x}");
    }

    /// Make every subsequent read fail, as if the process exited.
    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }
}

impl MemoryAccessor for MockAccessor {
    fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    fn regions(&self) -> Result<Vec<MemoryRegion>> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::read_failed(0, "process terminated"));
        }
        Ok(self.regions.iter().map(|r| r.info).collect())
    }

    fn read_bytes(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::read_failed(address, "process terminated"));
        }
        let region = self
            .regions
            .iter()
            .find(|r| r.info.contains(address))
            .ok_or_else(|| Error::read_failed(address, "address not mapped"))?;
        if address + len as u64 > region.info.end() {
            return Err(Error::read_failed(address, "read crosses region end"));
        }
        let data = region
            .data
            .as_ref()
            .ok_or_else(|| Error::read_failed(address, "region not readable"))?;
        let start = (address - region.info.base) as usize;
        let data = data.lock().unwrap();
        Ok(data[start..start + len].to_vec())
    }
}

pub struct MockMemoryBuilder {
    identity: ProcessIdentity,
    regions: Vec<MockRegion>,
}

impl MockMemoryBuilder {
    pub fn new() -> Self {
        Self {
            identity: ProcessIdentity::new(4242, 1, "Target.exe"),
            regions: Vec::new(),
        }
    }

    pub fn identity(mut self, pid: u32, parent_pid: u32, exe: &str) -> Self {
        self.identity = ProcessIdentity::new(pid, parent_pid, exe);
        self
    }

    /// Add a readable private region backed by the given bytes.
    pub fn region(mut self, base: u64, data: Vec<u8>) -> Self {
        self.regions.push(MockRegion {
            info: MemoryRegion {
                base,
                size: data.len() as u64,
                readable: true,
                private: true,
            },
            data: Some(Mutex::new(data)),
        });
        self
    }

    /// Add a region that is enumerated but whose reads always fail.
    pub fn failing_region(mut self, base: u64, size: u64) -> Self {
        self.regions.push(MockRegion {
            info: MemoryRegion {
                base,
                size,
                readable: true,
                private: true,
            },
            data: None,
        });
        self
    }

    /// Add a region excluded from scanning (image-backed or unreadable).
    pub fn excluded_region(mut self, base: u64, data: Vec<u8>, readable: bool) -> Self {
        self.regions.push(MockRegion {
            info: MemoryRegion {
                base,
                size: data.len() as u64,
                readable,
                private: false,
            },
            data: Some(Mutex::new(data)),
        });
        self
    }

    pub fn build(self) -> MockAccessor {
        MockAccessor {
            identity: self.identity,
            regions: self.regions,
            dead: AtomicBool::new(false),
        }
    }
}

impl Default for MockMemoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_within_region() {
        let mock = MockMemoryBuilder::new()
            .region(0x1000, vec![1, 2, 3, 4, 5, 6, 7, 8])
            .build();
        assert_eq!(mock.read_bytes(0x1002, 3).unwrap(), vec![3, 4, 5]);
        assert_eq!(mock.read_u32(0x1000).unwrap(), u32::from_le_bytes([1, 2, 3, 4]));
    }

    #[test]
    fn test_read_unmapped_fails() {
        let mock = MockMemoryBuilder::new().region(0x1000, vec![0; 16]).build();
        assert!(mock.read_bytes(0x5000, 4).is_err());
        assert!(mock.read_bytes(0x100C, 8).is_err());
    }

    #[test]
    fn test_write_then_read() {
        let mock = MockMemoryBuilder::new().region(0x1000, vec![0; 16]).build();
        mock.write(0x1004, &[0xAA, 0xBB]);
        assert_eq!(mock.read_bytes(0x1004, 2).unwrap(), vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_kill_fails_everything() {
        let mock = MockMemoryBuilder::new().region(0x1000, vec![0; 16]).build();
        mock.kill();
        assert!(mock.read_bytes(0x1000, 4).is_err());
        assert!(mock.regions().is_err());
    }
}
