use std::collections::{BTreeMap, btree_map::Entry};

use serde::{Deserialize, Serialize};

use crate::{
    AddressRange, CacheAccess, CacheBuffers, CacheConfig, CacheDriver, CacheError, CacheState,
    CachedTexture, CopyRegion, GuestAddress, PageProtection, ResourceHandle, TextureDevice,
    TextureInfo, TextureTransfer,
};

/// Identifies a [`ProtectedRegion`] for the lifetime of a cache.
///
/// Textures refer to their region through this handle rather than through
/// the start address, which changes whenever the region grows downwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionId(pub u64);

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A page-aligned range of guest memory and the textures living in it.
///
/// The region is the unit of page protection: the trapped accesses applied
/// to its pages are the union of what every contained texture requires.
#[derive(Debug)]
pub struct ProtectedRegion {
    id: RegionId,
    start_address: GuestAddress,
    pages_count: u32,
    page_size: u32,
    pub(crate) textures: BTreeMap<TextureInfo, CachedTexture>,
    current_protection: CacheAccess,
}

impl ProtectedRegion {
    pub(crate) fn new(id: RegionId, range: AddressRange, page_size: u32) -> Self {
        debug_assert!(range.start.is_aligned(page_size));
        debug_assert!(range.size % page_size == 0);

        Self {
            id,
            start_address: range.start,
            pages_count: range.size / page_size,
            page_size,
            textures: BTreeMap::new(),
            current_protection: CacheAccess::empty(),
        }
    }

    /// Returns the region handle.
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Returns the first address of the region.
    pub fn start_address(&self) -> GuestAddress {
        self.start_address
    }

    /// Returns the number of pages covered by the region.
    pub fn pages_count(&self) -> u32 {
        self.pages_count
    }

    /// Returns the size of the region in bytes.
    pub fn size(&self) -> u32 {
        self.pages_count * self.page_size
    }

    /// Returns the guest range covered by the region.
    pub fn range(&self) -> AddressRange {
        AddressRange::new(self.start_address, self.size())
    }

    /// Returns the accesses currently trapped on the region's pages.
    pub fn current_protection(&self) -> CacheAccess {
        self.current_protection
    }

    /// Returns the number of textures in the region.
    pub fn len(&self) -> usize {
        self.textures.len()
    }

    /// Checks if the region holds no textures.
    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    /// Returns an iterator over the textures in the region.
    pub fn textures(&self) -> impl Iterator<Item = (&TextureInfo, &CachedTexture)> {
        self.textures.iter()
    }

    /// Looks up a texture by its exact descriptor.
    pub fn find(&self, info: &TextureInfo) -> Option<&CachedTexture> {
        self.textures.get(info)
    }

    /// Calls `callback` for every texture overlapping `range`.
    pub fn for_each(
        &self,
        range: AddressRange,
        mut callback: impl FnMut(&TextureInfo, &CachedTexture),
    ) {
        for (info, texture) in self.overlapping(range) {
            callback(info, texture);
        }
    }

    fn overlapping(
        &self,
        range: AddressRange,
    ) -> impl Iterator<Item = (&TextureInfo, &CachedTexture)> {
        self.textures
            .iter()
            .filter(move |(info, _)| info.range().overlaps(&range))
    }

    /// Returns the accesses that must be trapped for the region.
    pub fn requires_protection(&self) -> CacheAccess {
        self.textures
            .values()
            .fold(CacheAccess::empty(), |result, texture| {
                result | texture.requires_protection()
            })
    }

    /// Applies the protection required by the contained textures.
    ///
    /// The driver is called only when the requirement differs from the
    /// protection currently applied. Returns `true` if the protection was
    /// changed.
    pub fn protect<Driver>(&mut self, driver: &Driver) -> Result<bool, CacheError>
    where
        Driver: PageProtection,
    {
        let required = self.requires_protection();

        if required == self.current_protection {
            return Ok(false);
        }

        tracing::debug!(
            id = %self.id,
            range = %self.range(),
            old = %self.current_protection,
            new = %required,
            "protecting region"
        );

        driver.set_protection(
            self.start_address,
            self.size(),
            self.current_protection,
            required,
        )?;

        self.current_protection = required;
        Ok(true)
    }

    /// Stops trapping the requested accesses.
    ///
    /// Only accesses that are currently trapped are released; if none of the
    /// requested accesses are trapped, the driver is not called.
    pub fn unprotect<Driver>(
        &mut self,
        driver: &Driver,
        access: CacheAccess,
    ) -> Result<(), CacheError>
    where
        Driver: PageProtection,
    {
        let released = self.current_protection & access;

        if released.is_empty() {
            return Ok(());
        }

        let remaining = self.current_protection - released;

        tracing::debug!(
            id = %self.id,
            range = %self.range(),
            %released,
            "unprotecting region"
        );

        driver.set_protection(
            self.start_address,
            self.size(),
            self.current_protection,
            remaining,
        )?;

        self.current_protection = remaining;
        Ok(())
    }

    /// Moves every texture of `other` into this region.
    ///
    /// Both regions are unprotected first. The region grows to the smallest
    /// range covering both, and `other` is left empty for the caller to
    /// discard. If unprotecting fails, neither region's textures are moved.
    pub fn combine<Driver>(
        &mut self,
        driver: &Driver,
        other: &mut ProtectedRegion,
    ) -> Result<(), CacheError>
    where
        Driver: PageProtection,
    {
        debug_assert_eq!(self.page_size, other.page_size);

        let range = self
            .range()
            .union(&other.range())
            .ok_or(CacheError::OutOfBounds)?;

        other.unprotect(driver, CacheAccess::READ_WRITE)?;
        self.unprotect(driver, CacheAccess::READ_WRITE)?;

        tracing::debug!(
            id = %self.id,
            into = %self.range(),
            from = %other.range(),
            textures = other.len(),
            "combining regions"
        );

        for (info, mut texture) in std::mem::take(&mut other.textures) {
            texture.parent(self.id);
            let previous = self.textures.insert(info, texture);
            debug_assert!(previous.is_none(), "texture cached in two regions");
        }

        self.resize(range);
        Ok(())
    }

    /// Grows the region to also cover `range`.
    ///
    /// The current protection only covers the old pages, so it is released
    /// before the region changes size.
    pub(crate) fn grow<Driver>(
        &mut self,
        driver: &Driver,
        range: AddressRange,
    ) -> Result<(), CacheError>
    where
        Driver: PageProtection,
    {
        let range = self
            .range()
            .union(&range)
            .and_then(|range| range.page_aligned(self.page_size))
            .ok_or(CacheError::OutOfBounds)?;

        if range != self.range() {
            self.unprotect(driver, CacheAccess::READ_WRITE)?;
            self.resize(range);
        }

        Ok(())
    }

    fn resize(&mut self, range: AddressRange) {
        debug_assert!(range.start.is_aligned(self.page_size));
        debug_assert!(range.size % self.page_size == 0);

        self.start_address = range.start;
        self.pages_count = range.size / self.page_size;
    }

    /// Registers a new texture in the region.
    ///
    /// The texture starts [`Invalid`] with no device resource. Fails if the
    /// descriptor is already registered or lies outside the region.
    ///
    /// [`Invalid`]: CacheState::Invalid
    pub fn add(&mut self, info: TextureInfo) -> Result<&mut CachedTexture, CacheError> {
        if !self.range().contains(&info.range()) {
            return Err(CacheError::OutOfBounds);
        }

        let textures = self.textures.len() + 1;

        match self.textures.entry(info) {
            Entry::Occupied(_) => Err(CacheError::DuplicateTexture(info)),
            Entry::Vacant(entry) => {
                tracing::debug!(
                    id = %self.id,
                    address = %info.start_address,
                    textures,
                    "new texture in cache"
                );

                Ok(entry.insert(CachedTexture::new(self.id)))
            }
        }
    }

    /// Removes protection, destroys every device resource and forgets all
    /// textures.
    ///
    /// If the protection cannot be released, nothing is destroyed and the
    /// region is left as it was. Otherwise every resource is destroyed even
    /// if some fail; textures whose resource survives stay registered and
    /// the first error is returned.
    pub fn clear<Driver>(&mut self, driver: &Driver) -> Result<(), CacheError>
    where
        Driver: TextureDevice + PageProtection,
    {
        self.unprotect(driver, CacheAccess::READ_WRITE)?;

        let mut result = Ok(());

        self.textures.retain(|info, texture| match texture.remove(driver) {
            Ok(()) => false,
            Err(err) => {
                tracing::error!(
                    %err,
                    address = %info.start_address,
                    "failed to destroy texture"
                );

                if result.is_ok() {
                    result = Err(err);
                }

                true
            }
        });

        result
    }

    /// Makes the requested sides of a texture valid.
    ///
    /// Creates the device resource on first use. A texture whose device side
    /// is stale is read when `buffers` asks for the device side; an
    /// [`Invalid`] texture is read for any request, since neither side can
    /// serve it. A texture whose guest side is stale is written back when
    /// `buffers` asks for the guest side.
    ///
    /// Returns `true` if a transfer took place.
    ///
    /// [`Invalid`]: CacheState::Invalid
    pub fn sync<Driver>(
        &mut self,
        driver: &Driver,
        config: &CacheConfig,
        info: &TextureInfo,
        buffers: CacheBuffers,
    ) -> Result<bool, CacheError>
    where
        Driver: CacheDriver,
    {
        let texture = self
            .textures
            .get_mut(info)
            .ok_or(CacheError::TextureNotFound(*info))?;

        if !texture.is_created() {
            texture.create(driver, info)?;
        }

        match texture.state() {
            CacheState::Invalid if !buffers.is_empty() => {
                self.read(driver, config, info)?;
                Ok(true)
            }
            CacheState::HostSynchronized if buffers.contains(CacheBuffers::LOCAL) => {
                self.read(driver, config, info)?;
                Ok(true)
            }
            CacheState::LocalSynchronized if buffers.contains(CacheBuffers::HOST) => {
                self.write(driver, info)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Marks the requested sides of a texture stale.
    ///
    /// Marking the guest side stale means the device side was modified, so
    /// the device copies of every other texture overlapping it are stale as
    /// well.
    pub fn invalidate(
        &mut self,
        info: &TextureInfo,
        buffers: CacheBuffers,
    ) -> Result<(), CacheError> {
        let texture = self
            .textures
            .get_mut(info)
            .ok_or(CacheError::TextureNotFound(*info))?;

        texture.invalidate(buffers);

        if buffers.contains(CacheBuffers::HOST) {
            let range = info.range();

            for (other, texture) in &mut self.textures {
                if other != info && other.range().overlaps(&range) {
                    tracing::trace!(
                        address = %info.start_address,
                        other = %other.start_address,
                        "invalidating overlapping texture"
                    );

                    texture.invalidate(CacheBuffers::LOCAL);
                }
            }
        }

        Ok(())
    }

    /// Marks the requested sides of every texture in the region stale.
    pub fn invalidate_all(&mut self, buffers: CacheBuffers) {
        for texture in self.textures.values_mut() {
            texture.invalidate(buffers);
        }
    }

    /// Marks the requested sides of a texture valid without any transfer.
    pub fn ignore(&mut self, info: &TextureInfo, buffers: CacheBuffers) -> Result<(), CacheError> {
        let texture = self
            .textures
            .get_mut(info)
            .ok_or(CacheError::TextureNotFound(*info))?;

        texture.ignore(buffers);
        Ok(())
    }

    /// Writes every texture whose device side holds the only valid copy
    /// back to guest memory.
    ///
    /// Returns the number of textures written.
    pub fn flush<Driver>(&mut self, driver: &Driver) -> Result<usize, CacheError>
    where
        Driver: CacheDriver,
    {
        let pending = self.pending_writes(None);

        for info in &pending {
            self.write(driver, info)?;
        }

        Ok(pending.len())
    }

    fn pending_writes(&self, around: Option<&TextureInfo>) -> Vec<TextureInfo> {
        self.textures
            .iter()
            .filter(|(info, texture)| {
                texture.state() == CacheState::LocalSynchronized
                    && around.is_none_or(|around| {
                        *info != around && info.range().overlaps(&around.range())
                    })
            })
            .map(|(info, _)| *info)
            .collect()
    }

    fn handle_of(&self, info: &TextureInfo) -> Result<ResourceHandle, CacheError> {
        self.textures
            .get(info)
            .and_then(CachedTexture::handle)
            .ok_or(CacheError::TextureNotFound(*info))
    }

    fn read<Driver>(
        &mut self,
        driver: &Driver,
        config: &CacheConfig,
        info: &TextureInfo,
    ) -> Result<(), CacheError>
    where
        Driver: CacheDriver,
    {
        let handle = self.handle_of(info)?;

        let donor = if config.donor_copy {
            self.find_donor(info)
        }
        else {
            None
        };

        match donor {
            Some((src, region)) => {
                tracing::debug!(
                    address = %info.start_address,
                    %src,
                    dst = %handle,
                    "reading texture from local buffer"
                );

                driver.copy(src, handle, region)?;
            }
            None => {
                if config.flush_before_pull {
                    for other in self.pending_writes(Some(info)) {
                        self.write(driver, &other)?;
                    }
                }

                Self::pull(driver, info, handle)?;
            }
        }

        self.ignore(info, CacheBuffers::ALL)
    }

    fn pull<Driver>(
        driver: &Driver,
        info: &TextureInfo,
        handle: ResourceHandle,
    ) -> Result<(), CacheError>
    where
        Driver: TextureTransfer,
    {
        let result = if info.format.is_depth() {
            Err(CacheError::NotSupported)
        }
        else if let Some(size) = info.compressed_size {
            tracing::debug!(
                address = %info.start_address,
                size,
                "reading compressed texture from host buffer"
            );

            driver.pull_compressed(info, handle, size)
        }
        else {
            tracing::debug!(address = %info.start_address, "reading texture from host buffer");

            driver.pull(info, handle, info.pixel_layout())
        };

        match result {
            Err(CacheError::NotSupported) => {
                tracing::error!(
                    address = %info.start_address,
                    format = %info.format,
                    "unsupported texture read from host buffer"
                );

                Ok(())
            }
            result => result,
        }
    }

    fn write<Driver>(&mut self, driver: &Driver, info: &TextureInfo) -> Result<(), CacheError>
    where
        Driver: CacheDriver,
    {
        let handle = self.handle_of(info)?;

        let result = if info.format.is_depth() || info.is_compressed() {
            Err(CacheError::NotSupported)
        }
        else {
            tracing::debug!(address = %info.start_address, "writing texture to host buffer");

            driver.push(info, handle, info.pixel_layout())
        };

        match result {
            Err(CacheError::NotSupported) => {
                tracing::error!(
                    address = %info.start_address,
                    format = %info.format,
                    compressed = info.is_compressed(),
                    "unsupported texture write to host buffer"
                );
            }
            result => result?,
        }

        self.ignore(info, CacheBuffers::ALL)
    }

    /// Finds a sibling whose valid device copy covers `info` entirely.
    ///
    /// The sibling must share the pitch and format, so that the texture maps
    /// onto a sub-rectangle of it.
    fn find_donor(&self, info: &TextureInfo) -> Option<(ResourceHandle, CopyRegion)> {
        if info.is_compressed() || info.pitch == 0 {
            return None;
        }

        let range = info.range();
        let bpp = info.format.bytes_per_pixel();

        self.textures.iter().find_map(|(donor, texture)| {
            if donor == info || !texture.state().local() {
                return None;
            }

            if donor.is_compressed() || donor.format != info.format || donor.pitch != info.pitch {
                return None;
            }

            if !donor.range().contains(&range) {
                return None;
            }

            let offset = info.start_address - donor.start_address;
            let y = offset / info.pitch;
            let x_bytes = offset % info.pitch;

            if x_bytes % bpp != 0 {
                return None;
            }

            let x = x_bytes / bpp;

            if u64::from(x) + u64::from(info.width) > u64::from(donor.width)
                || u64::from(y) + u64::from(info.height) > u64::from(donor.height)
                || info.depth > donor.depth
            {
                return None;
            }

            // Slices are laid out `pitch * height` apart, so a multi-slice
            // texture must match the donor's slice stride.
            if info.depth > 1 && (y != 0 || donor.height != info.height) {
                return None;
            }

            let region = CopyRegion {
                src: (x, y, 0),
                dst: (0, 0, 0),
                width: info.width,
                height: info.height,
                depth: info.depth,
            };

            Some((texture.handle()?, region))
        })
    }
}
