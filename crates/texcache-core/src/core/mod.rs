mod access;
mod address;
mod format;
mod info;
pub(crate) mod macros;

pub use self::{
    access::{AccessFault, CacheAccess, CacheBuffers},
    address::{AddressRange, GuestAddress, ResourceHandle, align_up},
    format::TextureFormat,
    info::TextureInfo,
};

#[cfg(test)]
mod access_tests;
