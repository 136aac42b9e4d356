use serde::{Deserialize, Serialize};

use super::{AddressRange, GuestAddress, TextureFormat};
use crate::{CacheError, PixelLayout};

/// Describes the identity and geometry of a texture in guest memory.
///
/// Two descriptors refer to the same cached texture only if every field
/// matches, which is why the descriptor doubles as the key of the texture
/// map in a [`ProtectedRegion`].
///
/// [`ProtectedRegion`]: crate::ProtectedRegion
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TextureInfo {
    /// Address of the first texel in guest memory.
    pub start_address: GuestAddress,

    /// Distance in bytes between the starts of two consecutive rows.
    pub pitch: u32,

    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,

    /// Number of slices.
    pub depth: u32,

    /// Pixel format.
    pub format: TextureFormat,

    /// Size of the pre-compressed image data, if the guest stores the
    /// texture block-compressed.
    pub compressed_size: Option<u32>,
}

impl TextureInfo {
    /// Creates a descriptor for a tightly packed 2D texture.
    pub fn new(start_address: GuestAddress, width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            start_address,
            pitch: width.saturating_mul(format.bytes_per_pixel()),
            width,
            height,
            depth: 1,
            format,
            compressed_size: None,
        }
    }

    /// Sets the row pitch.
    pub fn with_pitch(self, pitch: u32) -> Self {
        Self { pitch, ..self }
    }

    /// Sets the number of slices.
    pub fn with_depth(self, depth: u32) -> Self {
        Self { depth, ..self }
    }

    /// Marks the texture as stored pre-compressed in guest memory.
    pub fn with_compressed_size(self, compressed_size: u32) -> Self {
        Self {
            compressed_size: Some(compressed_size),
            ..self
        }
    }

    /// Returns the number of guest bytes covered by the texture.
    pub fn size(&self) -> u32 {
        match self.compressed_size {
            Some(size) => size,
            None => self
                .pitch
                .saturating_mul(self.height)
                .saturating_mul(self.depth.max(1)),
        }
    }

    /// Returns the guest byte range covered by the texture.
    pub fn range(&self) -> AddressRange {
        AddressRange::new(self.start_address, self.size())
    }

    /// Checks if the guest data is stored pre-compressed.
    pub fn is_compressed(&self) -> bool {
        self.compressed_size.is_some()
    }

    /// Returns the row pitch expressed in pixels.
    pub fn row_length(&self) -> u32 {
        self.pitch / self.format.bytes_per_pixel()
    }

    /// Returns the layout of the texture in guest memory for uncompressed
    /// transfers.
    pub fn pixel_layout(&self) -> PixelLayout {
        PixelLayout {
            row_length: self.row_length(),
            alignment: 1,
            swap_bytes: self.format.swap_bytes(),
        }
    }

    /// Checks that the descriptor is self-consistent.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.width == 0 || self.height == 0 || self.depth == 0 {
            return Err(CacheError::InvalidDescriptor("zero-sized texture"));
        }

        match self.compressed_size {
            Some(0) => Err(CacheError::InvalidDescriptor("empty compressed texture")),
            Some(size) => {
                if u64::from(self.start_address.0) + u64::from(size) > 1 << 32 {
                    return Err(CacheError::InvalidDescriptor(
                        "texture exceeds the guest address space",
                    ));
                }

                Ok(())
            }
            None => {
                if self.format.is_block_compressed() {
                    return Err(CacheError::InvalidDescriptor(
                        "block-compressed format without compressed size",
                    ));
                }

                let bpp = self.format.bytes_per_pixel();

                if self.pitch % bpp != 0 {
                    return Err(CacheError::InvalidDescriptor(
                        "pitch is not a multiple of the pixel size",
                    ));
                }

                if u64::from(self.pitch) < u64::from(self.width) * u64::from(bpp) {
                    return Err(CacheError::InvalidDescriptor("pitch is shorter than a row"));
                }

                let size = u64::from(self.pitch) * u64::from(self.height) * u64::from(self.depth);
                if u64::from(self.start_address.0) + size > 1 << 32 {
                    return Err(CacheError::InvalidDescriptor(
                        "texture exceeds the guest address space",
                    ));
                }

                Ok(())
            }
        }
    }
}

impl std::fmt::Display for TextureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} {}x{}x{} {} (pitch {})",
            self.start_address, self.width, self.height, self.depth, self.format, self.pitch
        )
    }
}
