use serde::{Deserialize, Serialize};

/// Pixel format of a cached texture.
///
/// Guest texture data is stored in big-endian order, so formats built from
/// multi-byte components need their bytes swapped on transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    /// Single 8-bit channel.
    R8,
    /// Two 8-bit channels.
    Rg8,
    /// Four 8-bit channels.
    Rgba8,
    /// Four 8-bit channels, blue first.
    Bgra8,
    /// Packed 16-bit 5:6:5 color.
    R5g6b5,
    /// Single 16-bit channel.
    R16,
    /// Four 16-bit float channels.
    Rgba16f,
    /// Single 32-bit float channel.
    R32f,
    /// Four 32-bit float channels.
    Rgba32f,
    /// 16-bit depth.
    Depth16,
    /// 24-bit depth with 8-bit stencil.
    Depth24Stencil8,
    /// BC1 block compression.
    Dxt1,
    /// BC2 block compression.
    Dxt3,
    /// BC3 block compression.
    Dxt5,
}

impl TextureFormat {
    /// Returns the number of bytes occupied by one pixel.
    ///
    /// For block-compressed formats this is the size of one 4x4 block.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::R8 => 1,
            Self::Rg8 | Self::R5g6b5 | Self::R16 | Self::Depth16 => 2,
            Self::Rgba8 | Self::Bgra8 | Self::R32f | Self::Depth24Stencil8 => 4,
            Self::Rgba16f | Self::Dxt1 => 8,
            Self::Rgba32f | Self::Dxt3 | Self::Dxt5 => 16,
        }
    }

    /// Returns the size of the unit whose bytes are swapped on transfer.
    pub fn component_size(self) -> u32 {
        match self {
            Self::R8 | Self::Rg8 | Self::Rgba8 | Self::Bgra8 => 1,
            Self::R5g6b5 | Self::R16 | Self::Rgba16f | Self::Depth16 => 2,
            Self::R32f | Self::Rgba32f | Self::Depth24Stencil8 => 4,
            Self::Dxt1 | Self::Dxt3 | Self::Dxt5 => 1,
        }
    }

    /// Checks if transfers of this format must swap bytes within each
    /// component.
    pub fn swap_bytes(self) -> bool {
        self.component_size() > 1
    }

    /// Checks if this is a depth or depth-stencil format.
    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth16 | Self::Depth24Stencil8)
    }

    /// Checks if this is a block-compressed format.
    pub fn is_block_compressed(self) -> bool {
        matches!(self, Self::Dxt1 | Self::Dxt3 | Self::Dxt5)
    }
}

impl std::fmt::Display for TextureFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}
