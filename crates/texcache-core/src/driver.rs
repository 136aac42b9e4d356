//! Collaborators the cache drives.
//!
//! The cache itself never touches pixels or page tables. Everything that
//! moves data or changes host state goes through the traits in this module,
//! which a backend implements once and bundles as a [`CacheDriver`].

use serde::{Deserialize, Serialize};

use crate::{CacheAccess, CacheError, GuestAddress, ResourceHandle, TextureInfo};

/// Layout of uncompressed pixel data in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelLayout {
    /// Row pitch expressed in pixels.
    pub row_length: u32,

    /// Alignment of each row start in bytes.
    pub alignment: u32,

    /// Whether the bytes of each component are swapped.
    pub swap_bytes: bool,
}

/// A sub-rectangle copied between two device resources.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CopyRegion {
    /// Source origin, in pixels.
    pub src: (u32, u32, u32),

    /// Destination origin, in pixels.
    pub dst: (u32, u32, u32),

    /// Width of the copied block, in pixels.
    pub width: u32,

    /// Height of the copied block, in pixels.
    pub height: u32,

    /// Number of copied slices.
    pub depth: u32,
}

/// Device resource lifecycle.
pub trait TextureDevice {
    /// Creates a zero-initialized device resource matching the descriptor.
    fn create(&self, info: &TextureInfo) -> Result<ResourceHandle, CacheError>;

    /// Destroys a device resource.
    fn destroy(&self, handle: ResourceHandle) -> Result<(), CacheError>;

    /// Copies a sub-rectangle between two device resources.
    fn copy(
        &self,
        src: ResourceHandle,
        dst: ResourceHandle,
        region: CopyRegion,
    ) -> Result<(), CacheError>;
}

/// Pixel transfer between guest memory and device resources.
///
/// Implementations may return [`CacheError::NotSupported`] for a transfer
/// they cannot perform; the cache treats it as a degraded, non-fatal result.
pub trait TextureTransfer {
    /// Uploads the texture from guest memory into `dst`.
    fn pull(
        &self,
        info: &TextureInfo,
        dst: ResourceHandle,
        layout: PixelLayout,
    ) -> Result<(), CacheError>;

    /// Uploads `size` bytes of pre-compressed data from guest memory into
    /// `dst`.
    fn pull_compressed(
        &self,
        info: &TextureInfo,
        dst: ResourceHandle,
        size: u32,
    ) -> Result<(), CacheError>;

    /// Downloads the content of `src` into guest memory.
    fn push(
        &self,
        info: &TextureInfo,
        src: ResourceHandle,
        layout: PixelLayout,
    ) -> Result<(), CacheError>;
}

/// Host page protection over guest memory.
pub trait PageProtection {
    /// Returns the granularity of protection changes, in bytes.
    fn page_size(&self) -> u32;

    /// Changes the trapped accesses of a page-aligned range from `old` to
    /// `new`.
    fn set_protection(
        &self,
        address: GuestAddress,
        size: u32,
        old: CacheAccess,
        new: CacheAccess,
    ) -> Result<(), CacheError>;
}

/// A backend implementing every collaborator of the cache.
pub trait CacheDriver: TextureDevice + TextureTransfer + PageProtection {}

impl<T> CacheDriver for T where T: TextureDevice + TextureTransfer + PageProtection {}
