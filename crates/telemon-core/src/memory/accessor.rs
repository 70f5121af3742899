use crate::error::{Error, Result};
use crate::fields::{ScalarType, ScalarValue};
use crate::memory::{MemoryRegion, ProcessIdentity};

/// Read-only view of an external process's memory.
///
/// Implementations never write to the target. All scalar reads are
/// little-endian. A failed read surfaces as [`Error::ReadFailed`]; callers
/// walking many regions treat that as transient and skip the region.
pub trait MemoryAccessor: Send + Sync {
    /// Identity of the process this accessor is attached to.
    fn identity(&self) -> &ProcessIdentity;

    /// Enumerate the committed regions of the target's address space.
    fn regions(&self) -> Result<Vec<MemoryRegion>>;

    /// Read `len` bytes starting at `address`.
    fn read_bytes(&self, address: u64, len: usize) -> Result<Vec<u8>>;

    fn read_u32(&self, address: u64) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array(address)?))
    }

    fn read_i32(&self, address: u64) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array(address)?))
    }

    fn read_f32(&self, address: u64) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_array(address)?))
    }

    /// Read one typed scalar.
    fn read_scalar(&self, address: u64, scalar_type: ScalarType) -> Result<ScalarValue> {
        Ok(scalar_type.decode(self.read_array(address)?))
    }

    #[doc(hidden)]
    fn read_array(&self, address: u64) -> Result<[u8; 4]> {
        let bytes = self.read_bytes(address, ScalarType::SIZE)?;
        bytes
            .try_into()
            .map_err(|_| Error::read_failed(address, "short read"))
    }
}
