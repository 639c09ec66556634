//! Named shared-memory regions.
//!
//! Thin wrapper around the `shared_memory` crate that maps a region by name
//! and exposes it as one of the typed layouts. The process that creates a
//! region owns it; dropping the owner removes the name, and foreign
//! processes merely map it.

use std::mem::size_of;

use shared_memory::{Shmem, ShmemConf};

use crate::error::{BusError, BusResult};
use crate::shm::layout::{RawRegion, RawServerRegion};

/// A mapped shared-memory region.
pub(crate) struct Region {
    shmem: Shmem,
}

// The region is only ever accessed through the atomic fields of the layout
// structs, so sharing the mapping between threads is sound.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create and map a region of `size` bytes under `name`, removing any
    /// stale segment a crashed owner may have left behind.
    pub fn create(name: &str, size: usize) -> BusResult<Self> {
        remove_stale(name);
        let shmem = ShmemConf::new()
            .size(size)
            .os_id(name)
            .create()
            .map_err(|err| {
                BusError::SharedMemory(format!("failed to create region {name}: {err}"))
            })?;
        Ok(Self { shmem })
    }

    /// Map an existing region and verify that it is at least `size` bytes.
    pub fn open(name: &str, size: usize) -> BusResult<Self> {
        let shmem = ShmemConf::new().os_id(name).open().map_err(|err| {
            BusError::SharedMemory(format!("failed to open region {name}: {err}"))
        })?;
        if shmem.len() < size {
            return Err(BusError::SharedMemory(format!(
                "region {name} is too small ({}/{size})",
                shmem.len()
            )));
        }
        Ok(Self { shmem })
    }

    /// View the region as the broadcast broker layout.
    pub fn broker_region(&self) -> &RawRegion {
        debug_assert!(self.shmem.len() >= size_of::<RawRegion>());
        unsafe { &*(self.shmem.as_ptr() as *const RawRegion) }
    }

    /// View the region as the server/client TX/RX layout.
    pub fn server_region(&self) -> &RawServerRegion {
        debug_assert!(self.shmem.len() >= size_of::<RawServerRegion>());
        unsafe { &*(self.shmem.as_ptr() as *const RawServerRegion) }
    }
}

/// Size in bytes of the broadcast broker region.
pub(crate) fn broker_region_size() -> usize {
    size_of::<RawRegion>()
}

/// Size in bytes of the server/client region.
pub(crate) fn server_region_size() -> usize {
    size_of::<RawServerRegion>()
}

#[cfg(target_os = "linux")]
fn remove_stale(name: &str) {
    let _ = std::fs::remove_file(format!("/dev/shm/{name}"));
}

#[cfg(not(target_os = "linux"))]
fn remove_stale(_name: &str) {}
