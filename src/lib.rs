//! Page-granular coherency cache between guest memory and device textures.
//!
//! An emulator keeps textures in two places: the guest's memory, which the
//! emulated program reads and writes directly, and the host device, which
//! samples from and renders into its own resources. [`TextureCache`] tracks
//! which copy is current, moves data only when a consumer needs it, and uses
//! host page protection to notice guest accesses that would observe or
//! invalidate a stale copy.
//!
//! The cache is backend-agnostic: everything that touches pixels or page
//! tables goes through a [`CacheDriver`]. The `driver-memory` feature
//! provides a software driver, useful for tests and tooling.
//!
//! # Example
//!
//! ```
//! use texcache::{
//!     CacheBuffers, GuestAddress, TextureCache, TextureFormat, TextureInfo,
//!     driver::memory::MemoryCacheDriver,
//! };
//!
//! # fn main() -> Result<(), texcache::CacheError> {
//! let mut cache = TextureCache::new(MemoryCacheDriver::new(0x10_0000)?)?;
//! let info = TextureInfo::new(GuestAddress(0x10000), 256, 256, TextureFormat::Rgba8);
//!
//! let texture = cache.entry(&info, CacheBuffers::LOCAL)?;
//! assert!(texture.is_synchronized(CacheBuffers::ALL));
//!
//! cache.update_protection()?;
//! # Ok(())
//! # }
//! ```

pub use texcache_core::*;

/// Cache drivers.
pub mod driver {
    /// Software driver backed by in-memory buffers.
    #[cfg(feature = "driver-memory")]
    pub mod memory {
        pub use texcache_driver_memory::*;
    }

    pub use texcache_core::driver::*;
}
