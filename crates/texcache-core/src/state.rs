use serde::{Deserialize, Serialize};

use crate::{CacheAccess, CacheBuffers};

/// Synchronization state of a cached texture.
///
/// The state records which side holds authoritative pixel data: the guest
/// memory (host) side, the device (local) side, both, or neither.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheState {
    /// Neither side can be trusted.
    #[default]
    Invalid,

    /// Guest memory is up to date, the device resource is stale.
    HostSynchronized,

    /// The device resource is up to date, guest memory is stale.
    LocalSynchronized,

    /// Both sides hold the same data.
    Synchronized,
}

impl CacheState {
    fn from_sides(host: bool, local: bool) -> Self {
        match (host, local) {
            (false, false) => Self::Invalid,
            (true, false) => Self::HostSynchronized,
            (false, true) => Self::LocalSynchronized,
            (true, true) => Self::Synchronized,
        }
    }

    /// Checks if guest memory holds valid data.
    pub fn host(self) -> bool {
        matches!(self, Self::HostSynchronized | Self::Synchronized)
    }

    /// Checks if the device resource holds valid data.
    pub fn local(self) -> bool {
        matches!(self, Self::LocalSynchronized | Self::Synchronized)
    }

    /// Checks if every requested side holds valid data.
    pub fn contains(self, buffers: CacheBuffers) -> bool {
        (!buffers.contains(CacheBuffers::HOST) || self.host())
            && (!buffers.contains(CacheBuffers::LOCAL) || self.local())
    }

    /// Returns the state with the given sides marked valid.
    pub(crate) fn with(self, buffers: CacheBuffers) -> Self {
        Self::from_sides(
            self.host() || buffers.contains(CacheBuffers::HOST),
            self.local() || buffers.contains(CacheBuffers::LOCAL),
        )
    }

    /// Returns the state with the given sides marked stale.
    pub(crate) fn without(self, buffers: CacheBuffers) -> Self {
        Self::from_sides(
            self.host() && !buffers.contains(CacheBuffers::HOST),
            self.local() && !buffers.contains(CacheBuffers::LOCAL),
        )
    }

    /// Returns the guest accesses that must be trapped in this state.
    ///
    /// While only the device is up to date, any guest access must be
    /// intercepted: reads to flush the device data first, writes to
    /// invalidate it. While both sides agree, only writes can make them
    /// diverge.
    pub fn requires_protection(self) -> CacheAccess {
        match self {
            Self::LocalSynchronized => CacheAccess::READ_WRITE,
            Self::Synchronized => CacheAccess::WRITE,
            Self::Invalid | Self::HostSynchronized => CacheAccess::empty(),
        }
    }
}
