use crate::{GuestAddress, TextureInfo};

/// An error that can occur when working with the texture cache.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// An error occurred in the cache driver.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error>),

    /// The texture is already registered in the region.
    #[error("Texture already cached ({0})")]
    DuplicateTexture(TextureInfo),

    /// The texture is not registered in the cache.
    #[error("Texture not cached ({0})")]
    TextureNotFound(TextureInfo),

    /// The texture descriptor is inconsistent.
    #[error("Invalid texture descriptor: {0}")]
    InvalidDescriptor(&'static str),

    /// The page size is not a power of two.
    #[error("Invalid page size ({0})")]
    InvalidPageSize(u32),

    /// The address is not page-aligned.
    #[error("Unaligned address ({0})")]
    Unaligned(GuestAddress),

    /// Operation not supported.
    #[error("Operation not supported.")]
    NotSupported,

    /// Out of bounds.
    #[error("Out of bounds")]
    OutOfBounds,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}
