use texcache_core::{AccessFault, CacheError, GuestAddress, ResourceHandle};

/// Error type for the memory driver.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A guest access hit a trapped page.
    #[error("Access violation at {} ({})", .0.address, .0.access)]
    AccessViolation(AccessFault),

    /// The resource handle is unknown.
    #[error("Invalid resource handle ({0})")]
    InvalidHandle(ResourceHandle),

    /// The address or size is not page-aligned.
    #[error("Unaligned address ({0})")]
    Unaligned(GuestAddress),

    /// Operation not supported.
    #[error("Operation not supported.")]
    NotSupported,

    /// Out of bounds.
    #[error("Out of bounds")]
    OutOfBounds,
}

impl From<Error> for CacheError {
    fn from(value: Error) -> Self {
        match value {
            Error::Unaligned(address) => Self::Unaligned(address),
            Error::NotSupported => Self::NotSupported,
            Error::OutOfBounds => Self::OutOfBounds,
            value => Self::Driver(Box::new(value)),
        }
    }
}
