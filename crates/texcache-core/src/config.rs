use serde::{Deserialize, Serialize};

/// Configuration of a [`TextureCache`].
///
/// [`TextureCache`]: crate::TextureCache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Granularity of regions and protection changes.
    ///
    /// When `None`, the page size reported by the driver is used.
    pub page_size: Option<u32>,

    /// Whether a stale texture may be filled by a device-side copy from a
    /// sibling texture covering it, instead of a pull from guest memory.
    pub donor_copy: bool,

    /// Whether overlapping textures holding the only valid copy of their
    /// data are written back to guest memory before a texture is pulled
    /// from it.
    pub flush_before_pull: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: None,
            donor_copy: true,
            flush_before_pull: true,
        }
    }
}
