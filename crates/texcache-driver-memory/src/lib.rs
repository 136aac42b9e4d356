//! Software texture cache driver.
//!
//! Guest memory is a plain byte buffer and device resources are tightly
//! packed pixel buffers. Page protection is tracked per page and enforced
//! by [`MemoryCacheDriver::read_guest`] and [`MemoryCacheDriver::write_guest`],
//! which report trapped accesses as [`Error::AccessViolation`] instead of
//! raising a host fault. The caller forwards the fault to
//! [`TextureCache::handle_fault`] and retries the access.
//!
//! [`TextureCache::handle_fault`]: texcache_core::TextureCache::handle_fault

mod driver;
mod error;

use texcache_core::{
    AccessFault, CacheAccess, CacheError, CopyRegion, GuestAddress, PageProtection, PixelLayout,
    ResourceHandle, TextureDevice, TextureInfo, TextureTransfer,
};

pub use self::error::Error;
use self::driver::MemoryDriver;

/// Default granularity of protection changes.
pub const DEFAULT_PAGE_SIZE: u32 = 0x1000;

/// Counters of the work performed by a [`MemoryCacheDriver`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDriverStats {
    /// Number of live device resources.
    pub resources: usize,

    /// Number of uploads from guest memory.
    pub pulls: usize,

    /// Number of downloads into guest memory.
    pub pushes: usize,

    /// Number of resource-to-resource copies.
    pub copies: usize,

    /// Number of protection changes.
    pub protection_changes: usize,
}

/// Software texture cache driver.
pub struct MemoryCacheDriver {
    inner: MemoryDriver,
}

impl MemoryCacheDriver {
    /// Creates a new driver with `guest_size` bytes of zeroed guest memory
    /// and 4 KiB pages.
    pub fn new(guest_size: usize) -> Result<Self, CacheError> {
        Self::with_page_size(guest_size, DEFAULT_PAGE_SIZE)
    }

    /// Creates a new driver with a custom page size.
    pub fn with_page_size(guest_size: usize, page_size: u32) -> Result<Self, CacheError> {
        Ok(Self {
            inner: MemoryDriver::new(guest_size, page_size)?,
        })
    }

    /// Reads guest memory as the guest would.
    ///
    /// Fails with [`Error::AccessViolation`] if any touched page traps
    /// reads.
    pub fn read_guest(&self, address: GuestAddress, buffer: &mut [u8]) -> Result<(), Error> {
        self.inner.read_guest(address, buffer)
    }

    /// Writes guest memory as the guest would.
    ///
    /// Fails with [`Error::AccessViolation`] if any touched page traps
    /// writes.
    pub fn write_guest(&self, address: GuestAddress, content: &[u8]) -> Result<(), Error> {
        self.inner.write_guest(address, content)
    }

    /// Returns the fault an access would raise, if any.
    pub fn probe(
        &self,
        address: GuestAddress,
        size: u32,
        access: CacheAccess,
    ) -> Option<AccessFault> {
        self.inner.probe(address, size, access)
    }

    /// Returns the accesses trapped on the page containing `address`.
    pub fn protection(&self, address: GuestAddress) -> CacheAccess {
        self.inner.protection(address)
    }

    /// Returns a copy of a device resource's content.
    pub fn resource_data(&self, handle: ResourceHandle) -> Result<Vec<u8>, Error> {
        self.inner.resource_data(handle)
    }

    /// Overwrites a device resource's content, as rendering would.
    pub fn write_resource(&self, handle: ResourceHandle, content: &[u8]) -> Result<(), Error> {
        self.inner.write_resource(handle, content)
    }

    /// Returns the driver counters.
    pub fn stats(&self) -> MemoryDriverStats {
        self.inner.stats()
    }
}

impl TextureDevice for MemoryCacheDriver {
    fn create(&self, info: &TextureInfo) -> Result<ResourceHandle, CacheError> {
        Ok(self.inner.create(info)?)
    }

    fn destroy(&self, handle: ResourceHandle) -> Result<(), CacheError> {
        Ok(self.inner.destroy(handle)?)
    }

    fn copy(
        &self,
        src: ResourceHandle,
        dst: ResourceHandle,
        region: CopyRegion,
    ) -> Result<(), CacheError> {
        Ok(self.inner.copy(src, dst, region)?)
    }
}

impl TextureTransfer for MemoryCacheDriver {
    fn pull(
        &self,
        info: &TextureInfo,
        dst: ResourceHandle,
        layout: PixelLayout,
    ) -> Result<(), CacheError> {
        Ok(self.inner.pull(info, dst, layout)?)
    }

    fn pull_compressed(
        &self,
        info: &TextureInfo,
        dst: ResourceHandle,
        size: u32,
    ) -> Result<(), CacheError> {
        Ok(self.inner.pull_compressed(info, dst, size)?)
    }

    fn push(
        &self,
        info: &TextureInfo,
        src: ResourceHandle,
        layout: PixelLayout,
    ) -> Result<(), CacheError> {
        Ok(self.inner.push(info, src, layout)?)
    }
}

impl PageProtection for MemoryCacheDriver {
    fn page_size(&self) -> u32 {
        self.inner.page_size()
    }

    fn set_protection(
        &self,
        address: GuestAddress,
        size: u32,
        old: CacheAccess,
        new: CacheAccess,
    ) -> Result<(), CacheError> {
        Ok(self.inner.set_protection(address, size, old, new)?)
    }
}
