mod accessor;
mod region;

#[cfg(target_os = "windows")]
mod process;

#[cfg(test)]
pub mod mock;

pub use accessor::MemoryAccessor;
pub use region::{MemoryRegion, ProcessIdentity};

#[cfg(target_os = "windows")]
pub use process::ProcessAccessor;

#[cfg(test)]
pub use mock::{MockAccessor, MockMemoryBuilder};
