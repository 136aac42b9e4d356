//! Core texture cache functionality.
//!
//! The cache keeps device textures coherent with the guest memory they were
//! materialized from. Textures are grouped into page-aligned
//! [`ProtectedRegion`]s; each region traps the guest accesses its textures
//! need to hear about, which turns page protection into a dirty bit.
//!
//! Three tiers cooperate:
//!
//! - [`CachedTexture`] tracks which side (guest memory or device resource)
//!   holds valid data for one texture.
//! - [`ProtectedRegion`] owns the textures of a page range, derives the
//!   protection they need and performs cross-texture operations.
//! - [`TextureCache`] maps guest addresses to regions and merges regions as
//!   textures of different extents are registered.

mod config;
mod core;
pub mod driver;
mod error;
mod region;
mod state;
mod texture;

use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
};

use smallvec::SmallVec;

pub use self::{
    config::CacheConfig,
    core::{
        AccessFault, AddressRange, CacheAccess, CacheBuffers, GuestAddress, ResourceHandle,
        TextureFormat, TextureInfo, align_up,
    },
    driver::{
        CacheDriver, CopyRegion, PageProtection, PixelLayout, TextureDevice, TextureTransfer,
    },
    error::CacheError,
    region::{ProtectedRegion, RegionId},
    state::CacheState,
    texture::{CachedTexture, TextureEntry},
};

/// Regions keyed by their start address.
struct RegionMap {
    map: BTreeMap<GuestAddress, ProtectedRegion>,

    /// Start address of every region, by handle.
    ids: HashMap<RegionId, GuestAddress>,

    page_size: u32,
    next_id: u64,
}

impl RegionMap {
    fn new(page_size: u32) -> Self {
        Self {
            map: BTreeMap::new(),
            ids: HashMap::new(),
            page_size,
            next_id: 0,
        }
    }

    fn insert(&mut self, region: ProtectedRegion) {
        self.ids.insert(region.id(), region.start_address());

        let previous = self.map.insert(region.start_address(), region);
        debug_assert!(previous.is_none(), "overlapping regions");
    }

    fn remove(&mut self, start: &GuestAddress) -> Option<ProtectedRegion> {
        let region = self.map.remove(start)?;
        self.ids.remove(&region.id());
        Some(region)
    }

    fn get(&self, id: RegionId) -> Option<&ProtectedRegion> {
        self.map.get(self.ids.get(&id)?)
    }

    fn get_mut(&mut self, start: GuestAddress) -> Result<&mut ProtectedRegion, CacheError> {
        self.map
            .get_mut(&start)
            .ok_or(CacheError::Other("region table out of sync"))
    }

    fn find(&self, address: GuestAddress) -> Option<&ProtectedRegion> {
        let (_, region) = self.map.range(..=address).next_back()?;
        region.range().contains_address(address).then_some(region)
    }

    fn find_mut(&mut self, address: GuestAddress) -> Option<&mut ProtectedRegion> {
        let (_, region) = self.map.range_mut(..=address).next_back()?;
        region.range().contains_address(address).then_some(region)
    }

    /// Returns the start addresses of all regions intersecting `range`, in
    /// ascending order.
    fn find_keys(&self, range: AddressRange) -> SmallVec<[GuestAddress; 2]> {
        let end = match u32::try_from(range.end()) {
            Ok(end) => Bound::Excluded(GuestAddress(end)),
            Err(_) => Bound::Unbounded,
        };

        // Regions don't overlap, so their ends ascend with their starts and
        // the backwards scan can stop at the first region ending before the
        // range.
        let mut result: SmallVec<[GuestAddress; 2]> = self
            .map
            .range((Bound::Unbounded, end))
            .rev()
            .take_while(|(_, region)| region.range().end() > u64::from(range.start.0))
            .map(|(&start, _)| start)
            .collect();

        result.reverse();
        result
    }

    /// Returns the region covering the page-aligned `range`, creating or
    /// merging regions as needed.
    fn resolve<Driver>(
        &mut self,
        driver: &Driver,
        range: AddressRange,
    ) -> Result<&mut ProtectedRegion, CacheError>
    where
        Driver: PageProtection,
    {
        let keys = self.find_keys(range);

        if keys.is_empty() {
            let id = RegionId(self.next_id);
            self.next_id += 1;

            tracing::debug!(%id, %range, "new region");

            self.insert(ProtectedRegion::new(id, range, self.page_size));
            return self.get_mut(range.start);
        }

        // Take the regions out of the map before merging; the survivor's
        // start address, and therefore its key, may change.
        let mut regions = keys
            .iter()
            .filter_map(|key| self.remove(key))
            .collect::<SmallVec<[ProtectedRegion; 2]>>()
            .into_iter();

        let mut survivor = match regions.next() {
            Some(survivor) => survivor,
            None => return Err(CacheError::Other("region table out of sync")),
        };

        while let Some(mut other) = regions.next() {
            if let Err(err) = survivor.combine(driver, &mut other) {
                self.insert(survivor);
                self.insert(other);
                regions.for_each(|region| self.insert(region));
                return Err(err);
            }
        }

        if let Err(err) = survivor.grow(driver, range) {
            self.insert(survivor);
            return Err(err);
        }

        let start = survivor.start_address();
        self.insert(survivor);
        self.get_mut(start)
    }
}

/// A page-granular coherency cache between guest memory and device
/// textures.
///
/// All guest-visible effects go through the [`CacheDriver`] owned by the
/// cache. The cache is meant to be driven by a single thread; the host fault
/// handler reports trapped accesses through [`handle_fault`] before letting
/// the faulting access proceed.
///
/// Page protection is not updated when textures are requested. Call
/// [`update_protection`] once per batch of requests to apply the
/// accumulated changes.
///
/// [`handle_fault`]: Self::handle_fault
/// [`update_protection`]: Self::update_protection
pub struct TextureCache<Driver>
where
    Driver: CacheDriver,
{
    driver: Driver,
    config: CacheConfig,
    regions: RegionMap,
}

impl<Driver> TextureCache<Driver>
where
    Driver: CacheDriver,
{
    /// Creates a new cache with the default configuration.
    pub fn new(driver: Driver) -> Result<Self, CacheError> {
        Self::with_config(driver, CacheConfig::default())
    }

    /// Creates a new cache with the given configuration.
    ///
    /// Fails if the configured (or driver-reported) page size is not a power
    /// of two.
    pub fn with_config(driver: Driver, config: CacheConfig) -> Result<Self, CacheError> {
        let page_size = config.page_size.unwrap_or_else(|| driver.page_size());

        if !page_size.is_power_of_two() {
            return Err(CacheError::InvalidPageSize(page_size));
        }

        Ok(Self {
            driver,
            config,
            regions: RegionMap::new(page_size),
        })
    }

    /// Returns the driver used by this cache.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Returns the configuration of this cache.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the page size regions are aligned to.
    pub fn page_size(&self) -> u32 {
        self.regions.page_size
    }

    /// Enables filling stale textures from covering siblings.
    pub fn enable_donor_copy(&mut self) {
        self.config.donor_copy = true;
    }

    /// Disables filling stale textures from covering siblings.
    ///
    /// Subsequent reads always pull from guest memory.
    pub fn disable_donor_copy(&mut self) {
        self.config.donor_copy = false;
    }

    /// Returns the number of regions.
    pub fn len(&self) -> usize {
        self.regions.map.len()
    }

    /// Checks if the cache holds no regions.
    pub fn is_empty(&self) -> bool {
        self.regions.map.is_empty()
    }

    /// Returns an iterator over the regions, in ascending address order.
    pub fn regions(&self) -> impl Iterator<Item = &ProtectedRegion> {
        self.regions.map.values()
    }

    /// Returns the texture for the given descriptor, synchronizing the
    /// requested sides.
    ///
    /// The texture's page range is merged with every region it touches and
    /// the texture is registered if it is not cached yet. Page protection is
    /// left untouched; see [`update_protection`].
    ///
    /// [`update_protection`]: Self::update_protection
    pub fn entry(
        &mut self,
        info: &TextureInfo,
        sync: CacheBuffers,
    ) -> Result<TextureEntry<'_, Driver>, CacheError> {
        info.validate()?;

        let range = info
            .range()
            .page_aligned(self.regions.page_size)
            .ok_or(CacheError::OutOfBounds)?;

        let region = self.regions.resolve(&self.driver, range)?;

        if region.find(info).is_none() {
            region.add(*info)?;
        }

        let mut entry = TextureEntry::new(region, *info, &self.driver, &self.config);
        entry.sync(sync)?;

        Ok(entry)
    }

    /// Returns the texture for the given descriptor without synchronizing
    /// it, if it is cached.
    pub fn texture(&mut self, info: &TextureInfo) -> Option<TextureEntry<'_, Driver>> {
        let region = self.regions.find_mut(info.start_address)?;
        region.find(info)?;

        Some(TextureEntry::new(region, *info, &self.driver, &self.config))
    }

    /// Looks up a cached texture by its exact descriptor.
    pub fn find(&self, info: &TextureInfo) -> Option<&CachedTexture> {
        self.regions.find(info.start_address)?.find(info)
    }

    /// Returns the region containing `address`.
    pub fn find_region(&self, address: GuestAddress) -> Option<&ProtectedRegion> {
        self.regions.find(address)
    }

    /// Returns the region containing `address`.
    pub fn find_region_mut(&mut self, address: GuestAddress) -> Option<&mut ProtectedRegion> {
        self.regions.find_mut(address)
    }

    /// Returns every region intersecting `[address, address + size)`, in
    /// ascending address order.
    pub fn find_regions(&self, address: GuestAddress, size: u32) -> Vec<&ProtectedRegion> {
        self.regions
            .find_keys(AddressRange::new(address, size))
            .iter()
            .filter_map(|key| self.regions.map.get(key))
            .collect()
    }

    /// Returns the region with the given handle.
    pub fn region(&self, id: RegionId) -> Option<&ProtectedRegion> {
        self.regions.get(id)
    }

    /// Applies the protection required by every region.
    pub fn update_protection(&mut self) -> Result<(), CacheError> {
        for region in self.regions.map.values_mut() {
            region.protect(&self.driver)?;
        }

        Ok(())
    }

    /// Handles a trapped guest access.
    ///
    /// Textures whose device copy is the only valid one are written back to
    /// guest memory first. On a write, every texture of the region then
    /// loses its device copy, since the protection that would report further
    /// writes is shared by the whole region. Finally the region is protected
    /// according to the new states, so the faulting access can proceed.
    ///
    /// Returns `false` if no region covers the address.
    pub fn handle_fault(&mut self, fault: AccessFault) -> Result<bool, CacheError> {
        let region = match self.regions.find_mut(fault.address) {
            Some(region) => region,
            None => return Ok(false),
        };

        tracing::debug!(
            address = %fault.address,
            access = %fault.access,
            id = %region.id(),
            "access violation"
        );

        region.flush(&self.driver)?;

        if fault.access.contains(CacheAccess::WRITE) {
            region.invalidate_all(CacheBuffers::LOCAL);
        }

        region.protect(&self.driver)?;
        Ok(true)
    }

    /// Clears and removes every region.
    ///
    /// Every region is cleared even if some fail; the first error is
    /// returned. A region that fails to clear stays in the cache with
    /// whatever it still holds, so its trapped pages keep being handled and
    /// a later `clear` can retry.
    pub fn clear(&mut self) -> Result<(), CacheError> {
        let mut result = Ok(());

        self.regions.ids.clear();

        for (_, mut region) in std::mem::take(&mut self.regions.map) {
            if let Err(err) = region.clear(&self.driver) {
                tracing::error!(%err, range = %region.range(), "failed to clear region");

                if result.is_ok() {
                    result = Err(err);
                }

                self.regions.insert(region);
            }
        }

        result
    }
}

#[cfg(test)]
mod cache_tests;
