use std::cell::{Cell, RefCell};

use super::{
    AccessFault, AddressRange, CacheAccess, CacheBuffers, CacheConfig, CacheError, CacheState,
    CopyRegion, GuestAddress, PageProtection, PixelLayout, RegionId, ResourceHandle, TextureCache,
    TextureDevice, TextureFormat, TextureInfo, TextureTransfer,
};

///////////////////////////////////////////////////////////////////////////////
// Mock Driver
///////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Create(GuestAddress),
    Destroy(ResourceHandle),
    Copy(ResourceHandle, ResourceHandle, CopyRegion),
    Pull(GuestAddress),
    PullCompressed(GuestAddress, u32),
    Push(GuestAddress),
    Protect(GuestAddress, u32, CacheAccess, CacheAccess),
}

struct MockCacheDriver {
    calls: RefCell<Vec<Call>>,
    next_handle: Cell<u64>,
    fail_protection: Cell<bool>,
    fail_destroy: Cell<bool>,
    unsupported: Cell<bool>,
}

impl MockCacheDriver {
    fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            next_handle: Cell::new(1),
            fail_protection: Cell::new(false),
            fail_destroy: Cell::new(false),
            unsupported: Cell::new(false),
        }
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }

    /// Returns the recorded calls and forgets them.
    fn take_calls(&self) -> Vec<Call> {
        self.calls.take()
    }

    fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.borrow().iter().filter(|call| predicate(call)).count()
    }
}

impl TextureDevice for MockCacheDriver {
    fn create(&self, info: &TextureInfo) -> Result<ResourceHandle, CacheError> {
        self.record(Call::Create(info.start_address));

        let handle = self.next_handle.get();
        self.next_handle.set(handle + 1);
        Ok(ResourceHandle(handle))
    }

    fn destroy(&self, handle: ResourceHandle) -> Result<(), CacheError> {
        self.record(Call::Destroy(handle));

        if self.fail_destroy.get() {
            return Err(CacheError::Other("resource in use"));
        }

        Ok(())
    }

    fn copy(
        &self,
        src: ResourceHandle,
        dst: ResourceHandle,
        region: CopyRegion,
    ) -> Result<(), CacheError> {
        self.record(Call::Copy(src, dst, region));
        Ok(())
    }
}

impl TextureTransfer for MockCacheDriver {
    fn pull(
        &self,
        info: &TextureInfo,
        _dst: ResourceHandle,
        _layout: PixelLayout,
    ) -> Result<(), CacheError> {
        self.record(Call::Pull(info.start_address));

        if self.unsupported.get() {
            return Err(CacheError::NotSupported);
        }

        Ok(())
    }

    fn pull_compressed(
        &self,
        info: &TextureInfo,
        _dst: ResourceHandle,
        size: u32,
    ) -> Result<(), CacheError> {
        self.record(Call::PullCompressed(info.start_address, size));
        Ok(())
    }

    fn push(
        &self,
        info: &TextureInfo,
        _src: ResourceHandle,
        _layout: PixelLayout,
    ) -> Result<(), CacheError> {
        self.record(Call::Push(info.start_address));
        Ok(())
    }
}

impl PageProtection for MockCacheDriver {
    fn page_size(&self) -> u32 {
        0x1000
    }

    fn set_protection(
        &self,
        address: GuestAddress,
        size: u32,
        old: CacheAccess,
        new: CacheAccess,
    ) -> Result<(), CacheError> {
        if self.fail_protection.get() {
            return Err(CacheError::Other("protection change refused"));
        }

        self.record(Call::Protect(address, size, old, new));
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////
// Test Helpers
///////////////////////////////////////////////////////////////////////////////

fn make_cache() -> Result<TextureCache<MockCacheDriver>, CacheError> {
    TextureCache::new(MockCacheDriver::new())
}

fn rgba8(address: u32, width: u32, height: u32) -> TextureInfo {
    TextureInfo::new(GuestAddress(address), width, height, TextureFormat::Rgba8)
}

/// A linear R8 texture of `pages` full pages.
fn r8_pages(address: u32, pages: u32) -> TextureInfo {
    TextureInfo::new(GuestAddress(address), 0x1000, pages, TextureFormat::R8)
}

fn is_pull(call: &Call) -> bool {
    matches!(call, Call::Pull(_) | Call::PullCompressed(..))
}

fn is_push(call: &Call) -> bool {
    matches!(call, Call::Push(_))
}

fn is_copy(call: &Call) -> bool {
    matches!(call, Call::Copy(..))
}

fn is_protect(call: &Call) -> bool {
    matches!(call, Call::Protect(..))
}

fn is_destroy(call: &Call) -> bool {
    matches!(call, Call::Destroy(_))
}

fn assert_disjoint(cache: &TextureCache<MockCacheDriver>) {
    let regions = cache.regions().collect::<Vec<_>>();

    for (index, region) in regions.iter().enumerate() {
        for other in &regions[index + 1..] {
            assert!(
                !region.range().overlaps(&other.range()),
                "{} overlaps {}",
                region.range(),
                other.range()
            );
        }

        for (info, texture) in region.textures() {
            assert!(region.range().contains(&info.range()));
            assert_eq!(texture.region(), region.id());
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Entry / Sync
///////////////////////////////////////////////////////////////////////////////

#[test]
fn first_request_pulls_from_guest_memory() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let info = rgba8(0x10000, 256, 256);

    let entry = cache.entry(&info, CacheBuffers::LOCAL)?;
    assert_eq!(entry.state(), CacheState::Synchronized);
    assert_eq!(entry.handle(), Some(ResourceHandle(1)));
    assert_eq!(entry.requires_protection(), CacheAccess::WRITE);

    assert_eq!(
        cache.driver().take_calls(),
        vec![
            Call::Create(GuestAddress(0x10000)),
            Call::Pull(GuestAddress(0x10000)),
        ]
    );

    let region = cache.find_region(GuestAddress(0x10000)).unwrap();
    assert_eq!(region.start_address(), GuestAddress(0x10000));
    assert_eq!(region.pages_count(), 0x40);
    assert!(region.current_protection().is_empty());

    Ok(())
}

#[test]
fn repeated_sync_is_noop() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let info = rgba8(0x10000, 64, 64);

    cache.entry(&info, CacheBuffers::LOCAL)?;
    cache.entry(&info, CacheBuffers::LOCAL)?;
    cache.entry(&info, CacheBuffers::ALL)?;

    let mut entry = cache.texture(&info).unwrap();
    assert!(!entry.sync(CacheBuffers::ALL)?);

    assert_eq!(cache.driver().count(|call| matches!(call, Call::Create(_))), 1);
    assert_eq!(cache.driver().count(is_pull), 1);
    assert_eq!(cache.len(), 1);

    Ok(())
}

#[test]
fn covered_texture_is_copied_from_donor() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let outer = rgba8(0x10000, 256, 256);
    let inner = rgba8(0x10000 + 16 * 1024 + 64 * 4, 128, 128).with_pitch(1024);

    cache.entry(&outer, CacheBuffers::LOCAL)?;
    cache.driver().take_calls();

    let entry = cache.entry(&inner, CacheBuffers::HOST)?;
    assert_eq!(entry.state(), CacheState::Synchronized);

    assert_eq!(
        cache.driver().take_calls(),
        vec![
            Call::Create(inner.start_address),
            Call::Copy(
                ResourceHandle(1),
                ResourceHandle(2),
                CopyRegion {
                    src: (64, 16, 0),
                    dst: (0, 0, 0),
                    width: 128,
                    height: 128,
                    depth: 1,
                }
            ),
        ]
    );

    assert_eq!(cache.len(), 1);
    Ok(())
}

#[test]
fn same_origin_subset_reads_from_donor() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let outer = rgba8(0x1000, 256, 256);
    let inner = rgba8(0x1000, 128, 128).with_pitch(1024);

    cache.entry(&outer, CacheBuffers::LOCAL)?;
    let entry = cache.entry(&inner, CacheBuffers::HOST)?;
    assert!(entry.is_synchronized(CacheBuffers::ALL));

    assert_eq!(cache.driver().count(is_pull), 1);
    assert_eq!(cache.driver().count(is_copy), 1);
    Ok(())
}

#[test]
fn packed_subset_is_pulled_from_guest_memory() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let outer = rgba8(0x1000, 256, 256);
    let inner = rgba8(0x1000, 128, 128);

    cache.entry(&outer, CacheBuffers::LOCAL)?;
    let entry = cache.entry(&inner, CacheBuffers::HOST)?;
    assert!(entry.is_synchronized(CacheBuffers::ALL));

    // A 512-byte pitch does not match the donor's rows.
    assert_eq!(cache.driver().count(is_pull), 2);
    assert_eq!(cache.driver().count(is_copy), 0);
    Ok(())
}

#[test]
fn donor_copy_can_be_disabled() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    cache.disable_donor_copy();

    let outer = rgba8(0x10000, 256, 256);
    let inner = rgba8(0x10000 + 16 * 1024, 128, 128).with_pitch(1024);

    cache.entry(&outer, CacheBuffers::LOCAL)?;
    cache.entry(&inner, CacheBuffers::LOCAL)?;

    assert_eq!(cache.driver().count(is_copy), 0);
    assert_eq!(cache.driver().count(is_pull), 2);

    Ok(())
}

#[test]
fn donor_requires_matching_layout() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let outer = rgba8(0x10000, 256, 256);

    // Same bytes, different pitch: rows do not line up.
    let narrow = rgba8(0x10000, 64, 64);
    // Same bytes, different format.
    let float = TextureInfo::new(GuestAddress(0x10000), 256, 16, TextureFormat::R32f)
        .with_pitch(1024);

    cache.entry(&outer, CacheBuffers::LOCAL)?;
    cache.entry(&narrow, CacheBuffers::LOCAL)?;
    cache.entry(&float, CacheBuffers::LOCAL)?;

    assert_eq!(cache.driver().count(is_copy), 0);
    assert_eq!(cache.driver().count(is_pull), 3);

    Ok(())
}

#[test]
fn write_back_when_guest_side_requested() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let info = rgba8(0x10000, 64, 64);

    let mut entry = cache.entry(&info, CacheBuffers::LOCAL)?;
    entry.invalidate(CacheBuffers::HOST)?;
    assert_eq!(entry.state(), CacheState::LocalSynchronized);
    assert_eq!(entry.requires_protection(), CacheAccess::READ_WRITE);

    // Asking for the device side only does not move anything.
    assert!(!entry.sync(CacheBuffers::LOCAL)?);
    assert!(entry.sync(CacheBuffers::HOST)?);
    assert_eq!(entry.state(), CacheState::Synchronized);

    assert_eq!(cache.driver().count(is_push), 1);
    Ok(())
}

#[test]
fn ignore_marks_valid_without_transfer() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let info = rgba8(0x10000, 64, 64);

    let mut entry = cache.entry(&info, CacheBuffers::empty())?;
    assert_eq!(entry.state(), CacheState::Invalid);
    assert!(entry.handle().is_some());

    entry.ignore(CacheBuffers::LOCAL)?;
    assert_eq!(entry.state(), CacheState::LocalSynchronized);

    assert_eq!(cache.driver().count(is_pull), 0);
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Invalidation
///////////////////////////////////////////////////////////////////////////////

#[test]
fn device_write_invalidates_overlapping_textures() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let a = rgba8(0x10000, 16, 16);
    let b = rgba8(0x10000, 8, 8).with_pitch(64);
    let c = rgba8(0x10800, 16, 16);

    cache.entry(&a, CacheBuffers::LOCAL)?;
    cache.entry(&b, CacheBuffers::LOCAL)?;
    cache.entry(&c, CacheBuffers::LOCAL)?;
    assert_eq!(cache.len(), 1);

    cache.texture(&a).unwrap().invalidate(CacheBuffers::HOST)?;

    assert_eq!(cache.find(&a).unwrap().state(), CacheState::LocalSynchronized);
    assert_eq!(cache.find(&b).unwrap().state(), CacheState::HostSynchronized);
    assert_eq!(cache.find(&c).unwrap().state(), CacheState::Synchronized);

    Ok(())
}

#[test]
fn local_invalidation_does_not_cascade() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let a = rgba8(0x10000, 16, 16);
    let b = rgba8(0x10000, 8, 8).with_pitch(64);

    cache.entry(&a, CacheBuffers::LOCAL)?;
    cache.entry(&b, CacheBuffers::LOCAL)?;

    cache.texture(&a).unwrap().invalidate(CacheBuffers::LOCAL)?;

    assert_eq!(cache.find(&a).unwrap().state(), CacheState::HostSynchronized);
    assert_eq!(cache.find(&b).unwrap().state(), CacheState::Synchronized);

    Ok(())
}

#[test]
fn flush_before_pull() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let a = rgba8(0x10000, 16, 16);
    let alias = TextureInfo::new(GuestAddress(0x10000), 16, 8, TextureFormat::R32f);

    cache.entry(&a, CacheBuffers::LOCAL)?;
    cache.texture(&a).unwrap().invalidate(CacheBuffers::HOST)?;
    cache.driver().take_calls();

    cache.entry(&alias, CacheBuffers::LOCAL)?;

    assert_eq!(
        cache.driver().take_calls(),
        vec![
            Call::Create(GuestAddress(0x10000)),
            Call::Push(GuestAddress(0x10000)),
            Call::Pull(GuestAddress(0x10000)),
        ]
    );
    assert_eq!(cache.find(&a).unwrap().state(), CacheState::Synchronized);

    Ok(())
}

#[test]
fn flush_before_pull_can_be_disabled() -> Result<(), CacheError> {
    let config = CacheConfig {
        flush_before_pull: false,
        ..Default::default()
    };

    let mut cache = TextureCache::with_config(MockCacheDriver::new(), config)?;
    let a = rgba8(0x10000, 16, 16);
    let alias = TextureInfo::new(GuestAddress(0x10000), 16, 8, TextureFormat::R32f);

    cache.entry(&a, CacheBuffers::LOCAL)?;
    cache.texture(&a).unwrap().invalidate(CacheBuffers::HOST)?;
    cache.entry(&alias, CacheBuffers::LOCAL)?;

    assert_eq!(cache.driver().count(is_push), 0);
    assert_eq!(cache.find(&a).unwrap().state(), CacheState::LocalSynchronized);

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Unsupported Transfers
///////////////////////////////////////////////////////////////////////////////

#[test]
fn depth_texture_is_marked_synchronized() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let info = TextureInfo::new(GuestAddress(0x10000), 64, 64, TextureFormat::Depth16);

    let entry = cache.entry(&info, CacheBuffers::LOCAL)?;
    assert_eq!(entry.state(), CacheState::Synchronized);

    assert_eq!(cache.driver().count(is_pull), 0);
    Ok(())
}

#[test]
fn driver_refusal_is_not_fatal() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    cache.driver().unsupported.set(true);

    let info = rgba8(0x10000, 64, 64);
    let entry = cache.entry(&info, CacheBuffers::LOCAL)?;
    assert_eq!(entry.state(), CacheState::Synchronized);

    assert_eq!(cache.driver().count(is_pull), 1);
    Ok(())
}

#[test]
fn compressed_texture_is_pulled_verbatim() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let info = TextureInfo::new(GuestAddress(0x20000), 16, 16, TextureFormat::Dxt1)
        .with_compressed_size(128);

    let mut entry = cache.entry(&info, CacheBuffers::LOCAL)?;
    assert_eq!(entry.state(), CacheState::Synchronized);

    // Compressed textures are never written back.
    entry.invalidate(CacheBuffers::HOST)?;
    assert!(entry.sync(CacheBuffers::HOST)?);
    assert_eq!(entry.state(), CacheState::Synchronized);

    assert_eq!(
        cache.driver().take_calls(),
        vec![
            Call::Create(GuestAddress(0x20000)),
            Call::PullCompressed(GuestAddress(0x20000), 128),
        ]
    );

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Regions
///////////////////////////////////////////////////////////////////////////////

#[test]
fn overlapping_requests_merge_regions() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let first = r8_pages(0x2000, 3);
    let second = r8_pages(0x4000, 4);

    cache.entry(&first, CacheBuffers::empty())?;
    cache.entry(&second, CacheBuffers::empty())?;

    assert_eq!(cache.len(), 1);

    let region = cache.find_region(GuestAddress(0x7fff)).unwrap();
    assert_eq!(region.start_address(), GuestAddress(0x2000));
    assert_eq!(region.pages_count(), 6);
    assert_eq!(region.len(), 2);

    assert_disjoint(&cache);
    Ok(())
}

#[test]
fn bridging_request_merges_all_regions() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let left = r8_pages(0x1000, 1);
    let right = r8_pages(0x5000, 1);
    let middle = r8_pages(0x3000, 1);

    cache.entry(&left, CacheBuffers::empty())?;
    cache.entry(&right, CacheBuffers::empty())?;
    cache.entry(&middle, CacheBuffers::empty())?;
    assert_eq!(cache.len(), 3);
    assert_eq!(cache.find_regions(GuestAddress(0x1800), 0x4000).len(), 3);

    let bridge = r8_pages(0x1000, 5);
    cache.entry(&bridge, CacheBuffers::empty())?;

    assert_eq!(cache.len(), 1);

    let region = cache.region(RegionId(0)).unwrap();
    assert_eq!(region.start_address(), GuestAddress(0x1000));
    assert_eq!(region.pages_count(), 5);
    assert_eq!(region.len(), 4);
    assert!(cache.region(RegionId(1)).is_none());

    assert_disjoint(&cache);
    Ok(())
}

#[test]
fn merge_releases_protection() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let first = r8_pages(0x2000, 1);
    let second = r8_pages(0x4000, 1);

    cache.entry(&first, CacheBuffers::LOCAL)?;
    cache.entry(&second, CacheBuffers::LOCAL)?;
    cache.update_protection()?;
    cache.driver().take_calls();

    let bridge = r8_pages(0x2000, 3);
    cache.entry(&bridge, CacheBuffers::empty())?;

    let calls = cache.driver().take_calls();
    assert!(calls.contains(&Call::Protect(
        GuestAddress(0x2000),
        0x1000,
        CacheAccess::WRITE,
        CacheAccess::empty()
    )));
    assert!(calls.contains(&Call::Protect(
        GuestAddress(0x4000),
        0x1000,
        CacheAccess::WRITE,
        CacheAccess::empty()
    )));

    cache.update_protection()?;
    assert_eq!(
        cache.driver().take_calls(),
        vec![Call::Protect(
            GuestAddress(0x2000),
            0x3000,
            CacheAccess::empty(),
            CacheAccess::WRITE
        )]
    );

    Ok(())
}

#[test]
fn failed_merge_restores_regions() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let first = r8_pages(0x2000, 1);
    let second = r8_pages(0x4000, 1);

    cache.entry(&first, CacheBuffers::LOCAL)?;
    cache.entry(&second, CacheBuffers::LOCAL)?;
    cache.update_protection()?;
    cache.driver().fail_protection.set(true);

    let bridge = r8_pages(0x2000, 3);
    assert!(cache.entry(&bridge, CacheBuffers::empty()).is_err());

    assert_eq!(cache.len(), 2);
    assert!(cache.find(&bridge).is_none());

    for (info, id) in [(&first, RegionId(0)), (&second, RegionId(1))] {
        let region = cache.find_region(info.start_address).unwrap();
        assert_eq!(region.id(), id);
        assert_eq!(region.pages_count(), 1);
        assert_eq!(region.current_protection(), CacheAccess::WRITE);
        assert!(region.find(info).is_some());
        assert!(cache.region(id).is_some());
    }

    assert_disjoint(&cache);

    // The same request succeeds once the driver cooperates again.
    cache.driver().fail_protection.set(false);
    cache.entry(&bridge, CacheBuffers::empty())?;
    assert_eq!(cache.len(), 1);

    Ok(())
}

#[test]
fn region_handle_follows_start_address() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let upper = r8_pages(0x6000, 1);
    let lower = r8_pages(0x3000, 1);

    cache.entry(&upper, CacheBuffers::empty())?;
    cache.entry(&lower, CacheBuffers::empty())?;

    // Absorbs the upper region into the lower one, then grows it downwards.
    cache.entry(&r8_pages(0x1000, 6), CacheBuffers::empty())?;

    let region = cache.region(RegionId(1)).unwrap();
    assert_eq!(region.start_address(), GuestAddress(0x1000));
    assert_eq!(region.pages_count(), 6);
    assert_eq!(region.len(), 3);
    assert!(cache.region(RegionId(0)).is_none());

    cache.clear()?;
    assert!(cache.region(RegionId(1)).is_none());

    Ok(())
}

#[test]
fn growing_region_reapplies_protection() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let small = r8_pages(0x10000, 1);
    let large = r8_pages(0x10000, 2);

    cache.entry(&small, CacheBuffers::LOCAL)?;
    cache.update_protection()?;

    cache.entry(&large, CacheBuffers::empty())?;
    cache.update_protection()?;

    let region = cache.find_region(GuestAddress(0x11000)).unwrap();
    assert_eq!(region.pages_count(), 2);
    assert_eq!(region.current_protection(), CacheAccess::WRITE);

    assert_eq!(
        cache.driver().take_calls().last(),
        Some(&Call::Protect(
            GuestAddress(0x10000),
            0x2000,
            CacheAccess::empty(),
            CacheAccess::WRITE
        ))
    );

    Ok(())
}

#[test]
fn regions_stay_disjoint() -> Result<(), CacheError> {
    let mut cache = make_cache()?;

    for (address, pages) in [
        (0x8000, 2),
        (0x1000, 1),
        (0x3800, 1),
        (0x9800, 3),
        (0x0000, 4),
        (0x20000, 1),
        (0x1f000, 2),
    ] {
        cache.entry(&r8_pages(address, pages), CacheBuffers::empty())?;
        assert_disjoint(&cache);
    }

    assert!(cache.find_region(GuestAddress(0x1e000)).is_none());
    assert_eq!(cache.find_regions(GuestAddress(0), 0x10000).len(), 2);
    Ok(())
}

#[test]
fn for_each_visits_overlapping_textures() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let a = rgba8(0x10000, 16, 16);
    let b = rgba8(0x10400, 16, 16);
    let c = rgba8(0x10800, 16, 16);

    for info in [&a, &b, &c] {
        cache.entry(info, CacheBuffers::empty())?;
    }

    let entry = cache.texture(&b).unwrap();
    let region = entry.region();

    let mut visited = Vec::new();
    region.for_each(
        AddressRange::new(GuestAddress(0x103ff), 0x402),
        |info, _| visited.push(info.start_address),
    );

    assert_eq!(
        visited,
        vec![a.start_address, b.start_address, c.start_address]
    );

    visited.clear();
    region.for_each(b.range(), |info, _| visited.push(info.start_address));
    assert_eq!(visited, vec![b.start_address]);

    Ok(())
}

#[test]
fn duplicate_texture_is_rejected() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let info = rgba8(0x10000, 64, 64);

    cache.entry(&info, CacheBuffers::empty())?;

    let region = cache.find_region_mut(info.start_address).unwrap();
    assert!(matches!(
        region.add(info),
        Err(CacheError::DuplicateTexture(_))
    ));
    assert!(matches!(
        region.add(rgba8(0x40000, 1, 1)),
        Err(CacheError::OutOfBounds)
    ));

    assert_eq!(region.len(), 1);
    Ok(())
}

#[test]
fn invalid_descriptor_is_rejected() -> Result<(), CacheError> {
    let mut cache = make_cache()?;

    assert!(matches!(
        cache.entry(&rgba8(0x10000, 0, 64), CacheBuffers::LOCAL),
        Err(CacheError::InvalidDescriptor(_))
    ));
    assert!(matches!(
        cache.entry(&rgba8(0xffff_f000, 64, 64), CacheBuffers::LOCAL),
        Err(CacheError::InvalidDescriptor(_))
    ));

    assert!(cache.is_empty());
    assert!(cache.driver().take_calls().is_empty());
    Ok(())
}

#[test]
fn page_size_must_be_power_of_two() {
    let config = CacheConfig {
        page_size: Some(3000),
        ..Default::default()
    };

    assert!(matches!(
        TextureCache::with_config(MockCacheDriver::new(), config),
        Err(CacheError::InvalidPageSize(3000))
    ));
}

///////////////////////////////////////////////////////////////////////////////
// Protection
///////////////////////////////////////////////////////////////////////////////

#[test]
fn protection_is_applied_once() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let info = rgba8(0x10000, 64, 64);

    cache.entry(&info, CacheBuffers::LOCAL)?;
    cache.update_protection()?;
    cache.update_protection()?;

    assert_eq!(cache.driver().count(is_protect), 1);

    let region = cache.find_region(info.start_address).unwrap();
    assert_eq!(region.current_protection(), CacheAccess::WRITE);
    Ok(())
}

#[test]
fn failed_protection_keeps_bookkeeping() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let info = rgba8(0x10000, 64, 64);

    cache.entry(&info, CacheBuffers::LOCAL)?;
    cache.driver().fail_protection.set(true);

    assert!(cache.update_protection().is_err());

    let region = cache.find_region(info.start_address).unwrap();
    assert!(region.current_protection().is_empty());

    cache.driver().fail_protection.set(false);
    cache.update_protection()?;
    assert_eq!(cache.driver().count(is_protect), 1);

    Ok(())
}

#[test]
fn read_fault_flushes_device_data() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let info = rgba8(0x10000, 64, 64);

    cache.entry(&info, CacheBuffers::LOCAL)?;
    cache.texture(&info).unwrap().invalidate(CacheBuffers::HOST)?;
    cache.update_protection()?;
    cache.driver().take_calls();

    assert!(cache.handle_fault(AccessFault::read(GuestAddress(0x10010)))?);

    assert_eq!(
        cache.driver().take_calls(),
        vec![
            Call::Push(GuestAddress(0x10000)),
            Call::Protect(
                GuestAddress(0x10000),
                0x4000,
                CacheAccess::READ_WRITE,
                CacheAccess::WRITE
            ),
        ]
    );
    assert_eq!(cache.find(&info).unwrap().state(), CacheState::Synchronized);

    Ok(())
}

#[test]
fn write_fault_invalidates_device_data() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let info = rgba8(0x10000, 64, 64);

    cache.entry(&info, CacheBuffers::LOCAL)?;
    cache.update_protection()?;
    cache.driver().take_calls();

    assert!(cache.handle_fault(AccessFault::write(GuestAddress(0x13ffc)))?);

    assert_eq!(
        cache.driver().take_calls(),
        vec![Call::Protect(
            GuestAddress(0x10000),
            0x4000,
            CacheAccess::WRITE,
            CacheAccess::empty()
        )]
    );
    assert_eq!(
        cache.find(&info).unwrap().state(),
        CacheState::HostSynchronized
    );

    // The next request pulls the new guest data.
    cache.entry(&info, CacheBuffers::LOCAL)?;
    assert_eq!(cache.driver().count(is_pull), 1);

    Ok(())
}

#[test]
fn fault_outside_regions_is_ignored() -> Result<(), CacheError> {
    let mut cache = make_cache()?;

    cache.entry(&rgba8(0x10000, 64, 64), CacheBuffers::LOCAL)?;
    cache.driver().take_calls();

    assert!(!cache.handle_fault(AccessFault::write(GuestAddress(0x14000)))?);
    assert!(cache.driver().take_calls().is_empty());

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Clear
///////////////////////////////////////////////////////////////////////////////

#[test]
fn clear_releases_everything() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let first = rgba8(0x10000, 64, 64);
    let second = rgba8(0x40000, 64, 64);
    let unprotected = rgba8(0x80000, 64, 64);

    cache.entry(&first, CacheBuffers::LOCAL)?;
    cache.entry(&second, CacheBuffers::LOCAL)?;
    cache.update_protection()?;
    cache.entry(&unprotected, CacheBuffers::LOCAL)?;
    cache.driver().take_calls();

    cache.clear()?;

    assert!(cache.is_empty());
    assert!(cache.find_region(GuestAddress(0x10000)).is_none());
    assert!(cache.find(&first).is_none());

    assert_eq!(cache.driver().count(is_protect), 2);
    assert_eq!(cache.driver().count(is_destroy), 3);

    Ok(())
}

#[test]
fn clear_keeps_regions_it_cannot_unprotect() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let info = rgba8(0x10000, 64, 64);

    cache.entry(&info, CacheBuffers::LOCAL)?;
    cache.update_protection()?;
    cache.driver().take_calls();
    cache.driver().fail_protection.set(true);

    assert!(cache.clear().is_err());

    // Nothing was destroyed and the trapped pages are still tracked.
    assert_eq!(cache.driver().count(is_destroy), 0);
    assert_eq!(cache.len(), 1);
    assert!(cache.region(RegionId(0)).is_some());
    assert!(cache.find(&info).unwrap().handle().is_some());

    let region = cache.find_region(GuestAddress(0x10000)).unwrap();
    assert_eq!(region.current_protection(), CacheAccess::WRITE);

    cache.driver().fail_protection.set(false);
    assert!(cache.handle_fault(AccessFault::write(GuestAddress(0x10010)))?);

    cache.clear()?;
    assert!(cache.is_empty());
    assert_eq!(cache.driver().count(is_destroy), 1);

    Ok(())
}

#[test]
fn clear_attempts_every_texture() -> Result<(), CacheError> {
    let mut cache = make_cache()?;
    let first = rgba8(0x10000, 16, 16);
    let second = rgba8(0x10400, 16, 16);

    cache.entry(&first, CacheBuffers::LOCAL)?;
    cache.entry(&second, CacheBuffers::LOCAL)?;
    cache.update_protection()?;
    cache.driver().take_calls();
    cache.driver().fail_destroy.set(true);

    assert!(cache.clear().is_err());
    assert_eq!(cache.driver().count(is_destroy), 2);

    // The textures whose resources survived stay registered, unprotected.
    let region = cache.find_region(first.start_address).unwrap();
    assert_eq!(region.len(), 2);
    assert!(region.current_protection().is_empty());
    assert!(cache.find(&second).unwrap().handle().is_some());

    cache.driver().fail_destroy.set(false);
    cache.driver().take_calls();

    cache.clear()?;
    assert!(cache.is_empty());
    assert_eq!(cache.driver().count(is_destroy), 2);
    assert_eq!(cache.driver().count(is_protect), 0);

    Ok(())
}
