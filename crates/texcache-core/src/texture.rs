use crate::{
    CacheAccess, CacheBuffers, CacheConfig, CacheDriver, CacheError, CacheState, ProtectedRegion,
    RegionId, ResourceHandle, TextureDevice, TextureInfo,
};

/// A texture tracked by the cache.
///
/// Holds the device resource materializing the texture and the
/// synchronization state between that resource and guest memory. The
/// descriptor is the key under which the owning [`ProtectedRegion`] stores
/// the texture.
#[derive(Debug)]
pub struct CachedTexture {
    handle: Option<ResourceHandle>,
    state: CacheState,
    region: RegionId,
}

impl CachedTexture {
    pub(crate) fn new(region: RegionId) -> Self {
        Self {
            handle: None,
            state: CacheState::Invalid,
            region,
        }
    }

    /// Returns the device resource, if it has been created.
    pub fn handle(&self) -> Option<ResourceHandle> {
        self.handle
    }

    /// Checks if the device resource has been created.
    pub fn is_created(&self) -> bool {
        self.handle.is_some()
    }

    /// Returns the synchronization state.
    pub fn state(&self) -> CacheState {
        self.state
    }

    /// Returns the region owning this texture.
    pub fn region(&self) -> RegionId {
        self.region
    }

    /// Checks if every requested side holds valid data.
    pub fn is_synchronized(&self, buffers: CacheBuffers) -> bool {
        self.state.contains(buffers)
    }

    /// Returns the guest accesses that must be trapped for this texture.
    pub fn requires_protection(&self) -> CacheAccess {
        self.state.requires_protection()
    }

    pub(crate) fn ignore(&mut self, buffers: CacheBuffers) {
        self.state = self.state.with(buffers);
    }

    pub(crate) fn invalidate(&mut self, buffers: CacheBuffers) {
        self.state = self.state.without(buffers);
    }

    pub(crate) fn parent(&mut self, region: RegionId) {
        self.region = region;
    }

    pub(crate) fn create<Driver>(
        &mut self,
        driver: &Driver,
        info: &TextureInfo,
    ) -> Result<ResourceHandle, CacheError>
    where
        Driver: TextureDevice,
    {
        debug_assert!(!self.is_created());

        let handle = driver.create(info)?;
        tracing::debug!(address = %info.start_address, %handle, "created device resource");

        self.handle = Some(handle);
        Ok(handle)
    }

    pub(crate) fn remove<Driver>(&mut self, driver: &Driver) -> Result<(), CacheError>
    where
        Driver: TextureDevice,
    {
        if let Some(handle) = self.handle {
            driver.destroy(handle)?;
            self.handle = None;
        }

        Ok(())
    }
}

/// A cached texture together with the region and driver it operates on.
///
/// Returned by [`TextureCache::entry`] and [`TextureCache::texture`].
/// Operations that affect sibling textures, such as the invalidation cascade
/// or donor copies, go through the owning region.
///
/// [`TextureCache::entry`]: crate::TextureCache::entry
/// [`TextureCache::texture`]: crate::TextureCache::texture
pub struct TextureEntry<'a, Driver>
where
    Driver: CacheDriver,
{
    region: &'a mut ProtectedRegion,
    info: TextureInfo,
    driver: &'a Driver,
    config: &'a CacheConfig,
}

impl<'a, Driver> TextureEntry<'a, Driver>
where
    Driver: CacheDriver,
{
    pub(crate) fn new(
        region: &'a mut ProtectedRegion,
        info: TextureInfo,
        driver: &'a Driver,
        config: &'a CacheConfig,
    ) -> Self {
        debug_assert!(region.find(&info).is_some());

        Self {
            region,
            info,
            driver,
            config,
        }
    }

    /// Returns the texture descriptor.
    pub fn info(&self) -> &TextureInfo {
        &self.info
    }

    /// Returns the cached texture.
    pub fn texture(&self) -> &CachedTexture {
        &self.region.textures[&self.info]
    }

    /// Returns the region owning the texture.
    pub fn region(&self) -> &ProtectedRegion {
        &*self.region
    }

    /// Returns the synchronization state.
    pub fn state(&self) -> CacheState {
        self.texture().state()
    }

    /// Returns the device resource, if it has been created.
    pub fn handle(&self) -> Option<ResourceHandle> {
        self.texture().handle()
    }

    /// Checks if every requested side holds valid data.
    pub fn is_synchronized(&self, buffers: CacheBuffers) -> bool {
        self.texture().is_synchronized(buffers)
    }

    /// Returns the guest accesses that must be trapped for this texture.
    pub fn requires_protection(&self) -> CacheAccess {
        self.texture().requires_protection()
    }

    /// Makes the requested sides of the texture valid.
    ///
    /// See [`ProtectedRegion::sync`].
    pub fn sync(&mut self, buffers: CacheBuffers) -> Result<bool, CacheError> {
        self.region.sync(self.driver, self.config, &self.info, buffers)
    }

    /// Marks the requested sides of the texture stale.
    ///
    /// See [`ProtectedRegion::invalidate`].
    pub fn invalidate(&mut self, buffers: CacheBuffers) -> Result<(), CacheError> {
        self.region.invalidate(&self.info, buffers)
    }

    /// Marks the requested sides of the texture valid without transferring
    /// any data.
    pub fn ignore(&mut self, buffers: CacheBuffers) -> Result<(), CacheError> {
        self.region.ignore(&self.info, buffers)
    }
}
