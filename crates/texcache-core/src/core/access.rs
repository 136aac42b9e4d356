use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Guest memory accesses that are trapped by page protection.
    ///
    /// A set flag means the corresponding access by the guest raises a fault
    /// instead of completing silently.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CacheAccess: u8 {
        /// Reads are trapped.
        const READ = 0b00000001;

        /// Writes are trapped.
        const WRITE = 0b00000010;

        /// Both reads and writes are trapped.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl std::fmt::Display for CacheAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut result = [b'-'; 2];

        if self.contains(CacheAccess::READ) {
            result[0] = b'r';
        }
        if self.contains(CacheAccess::WRITE) {
            result[1] = b'w';
        }

        // SAFETY: The `result` array is always valid UTF-8.
        f.write_str(unsafe { std::str::from_utf8_unchecked(&result) })
    }
}

bitflags::bitflags! {
    /// Sides of a cached texture that a synchronization request targets.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CacheBuffers: u8 {
        /// The guest memory backing the texture.
        const HOST = 0b00000001;

        /// The device resource holding the materialized texture.
        const LOCAL = 0b00000010;

        /// Both sides.
        const ALL = Self::HOST.bits() | Self::LOCAL.bits();
    }
}

/// A trapped guest access reported by the host fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessFault {
    /// The faulting guest address.
    pub address: super::GuestAddress,

    /// The kind of access that faulted.
    pub access: CacheAccess,
}

impl AccessFault {
    /// Creates a fault for a trapped read.
    pub fn read(address: super::GuestAddress) -> Self {
        Self {
            address,
            access: CacheAccess::READ,
        }
    }

    /// Creates a fault for a trapped write.
    pub fn write(address: super::GuestAddress) -> Self {
        Self {
            address,
            access: CacheAccess::WRITE,
        }
    }
}
