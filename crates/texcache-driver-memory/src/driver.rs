use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
};

use texcache_core::{
    AccessFault, CacheAccess, CopyRegion, GuestAddress, PixelLayout, ResourceHandle, TextureInfo,
};

use crate::{Error, MemoryDriverStats};

/// A device resource: tightly packed pixels, or the raw compressed blocks.
struct Resource {
    info: TextureInfo,
    data: Vec<u8>,
}

impl Resource {
    fn new(info: &TextureInfo) -> Result<Self, Error> {
        let size = match info.compressed_size {
            Some(size) => u64::from(size),
            None => {
                u64::from(info.width)
                    * u64::from(info.height)
                    * u64::from(info.depth)
                    * u64::from(info.format.bytes_per_pixel())
            }
        };

        let size = usize::try_from(size).map_err(|_| Error::OutOfBounds)?;

        Ok(Self {
            info: *info,
            data: vec![0; size],
        })
    }

    fn bytes_per_pixel(&self) -> usize {
        self.info.format.bytes_per_pixel() as usize
    }

    /// Returns the byte offset of the pixel `(x, y, z)`.
    fn offset(&self, x: u32, y: u32, z: u32) -> usize {
        let row = z as usize * self.info.height as usize + y as usize;
        (row * self.info.width as usize + x as usize) * self.bytes_per_pixel()
    }
}

/// Software texture cache driver.
pub struct MemoryDriver {
    guest: RefCell<Vec<u8>>,
    page_size: u32,
    resources: RefCell<HashMap<ResourceHandle, Resource>>,
    protection: RefCell<HashMap<u32, CacheAccess>>,
    next_handle: Cell<u64>,
    stats: Cell<MemoryDriverStats>,
}

impl MemoryDriver {
    pub fn new(guest_size: usize, page_size: u32) -> Result<Self, Error> {
        if !page_size.is_power_of_two() {
            return Err(Error::NotSupported);
        }

        if guest_size as u64 > 1 << 32 {
            return Err(Error::OutOfBounds);
        }

        Ok(Self {
            guest: RefCell::new(vec![0; guest_size]),
            page_size,
            resources: RefCell::new(HashMap::new()),
            protection: RefCell::new(HashMap::new()),
            next_handle: Cell::new(1),
            stats: Cell::new(MemoryDriverStats::default()),
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn stats(&self) -> MemoryDriverStats {
        MemoryDriverStats {
            resources: self.resources.borrow().len(),
            ..self.stats.get()
        }
    }

    fn update_stats(&self, update: impl FnOnce(&mut MemoryDriverStats)) {
        let mut stats = self.stats.get();
        update(&mut stats);
        self.stats.set(stats);
    }

    fn guest_range(
        &self,
        address: GuestAddress,
        size: usize,
    ) -> Result<std::ops::Range<usize>, Error> {
        let start = address.0 as usize;
        let end = start.checked_add(size).ok_or(Error::OutOfBounds)?;

        if end > self.guest.borrow().len() {
            return Err(Error::OutOfBounds);
        }

        Ok(start..end)
    }

    fn page_index(&self, address: u64) -> u32 {
        (address / u64::from(self.page_size)) as u32
    }

    //
    // Guest access
    //

    pub fn protection(&self, address: GuestAddress) -> CacheAccess {
        self.protection
            .borrow()
            .get(&self.page_index(u64::from(address.0)))
            .copied()
            .unwrap_or_else(CacheAccess::empty)
    }

    pub fn probe(
        &self,
        address: GuestAddress,
        size: u32,
        access: CacheAccess,
    ) -> Option<AccessFault> {
        if size == 0 {
            return None;
        }

        let first = self.page_index(u64::from(address.0));
        let last = self.page_index(u64::from(address.0) + u64::from(size) - 1);
        let protection = self.protection.borrow();

        (first..=last).find_map(|page| {
            let trapped = protection.get(&page).copied().unwrap_or_else(CacheAccess::empty);

            if !trapped.intersects(access) {
                return None;
            }

            // Report the first faulting byte, not the page start.
            let page_start = u64::from(page) * u64::from(self.page_size);
            let address = GuestAddress(page_start.max(u64::from(address.0)) as u32);

            Some(AccessFault {
                address,
                access: trapped & access,
            })
        })
    }

    pub fn read_guest(&self, address: GuestAddress, buffer: &mut [u8]) -> Result<(), Error> {
        let size = u32::try_from(buffer.len()).map_err(|_| Error::OutOfBounds)?;
        let range = self.guest_range(address, buffer.len())?;

        if let Some(fault) = self.probe(address, size, CacheAccess::READ) {
            return Err(Error::AccessViolation(fault));
        }

        buffer.copy_from_slice(&self.guest.borrow()[range]);
        Ok(())
    }

    pub fn write_guest(&self, address: GuestAddress, content: &[u8]) -> Result<(), Error> {
        let size = u32::try_from(content.len()).map_err(|_| Error::OutOfBounds)?;
        let range = self.guest_range(address, content.len())?;

        if let Some(fault) = self.probe(address, size, CacheAccess::WRITE) {
            return Err(Error::AccessViolation(fault));
        }

        self.guest.borrow_mut()[range].copy_from_slice(content);
        Ok(())
    }

    //
    // Device resources
    //

    pub fn resource_data(&self, handle: ResourceHandle) -> Result<Vec<u8>, Error> {
        let resources = self.resources.borrow();
        let resource = resources.get(&handle).ok_or(Error::InvalidHandle(handle))?;
        Ok(resource.data.clone())
    }

    pub fn write_resource(&self, handle: ResourceHandle, content: &[u8]) -> Result<(), Error> {
        let mut resources = self.resources.borrow_mut();
        let resource = resources
            .get_mut(&handle)
            .ok_or(Error::InvalidHandle(handle))?;

        if content.len() != resource.data.len() {
            return Err(Error::OutOfBounds);
        }

        resource.data.copy_from_slice(content);
        Ok(())
    }

    pub fn create(&self, info: &TextureInfo) -> Result<ResourceHandle, Error> {
        let resource = Resource::new(info)?;

        let handle = ResourceHandle(self.next_handle.get());
        self.next_handle.set(handle.0 + 1);

        tracing::trace!(%handle, size = resource.data.len(), "creating resource");
        self.resources.borrow_mut().insert(handle, resource);
        Ok(handle)
    }

    pub fn destroy(&self, handle: ResourceHandle) -> Result<(), Error> {
        tracing::trace!(%handle, "destroying resource");

        match self.resources.borrow_mut().remove(&handle) {
            Some(_) => Ok(()),
            None => Err(Error::InvalidHandle(handle)),
        }
    }

    pub fn copy(
        &self,
        src: ResourceHandle,
        dst: ResourceHandle,
        region: CopyRegion,
    ) -> Result<(), Error> {
        if region.width == 0 || region.height == 0 || region.depth == 0 {
            return Ok(());
        }

        let mut resources = self.resources.borrow_mut();

        let (rows, bpp) = {
            let source = resources.get(&src).ok_or(Error::InvalidHandle(src))?;

            if source.info.is_compressed() {
                return Err(Error::NotSupported);
            }

            Self::check_region(&source.info, region.src, &region)?;

            let bpp = source.bytes_per_pixel();
            let row_size = region.width as usize * bpp;
            let (x, y, z) = region.src;

            let mut rows =
                Vec::with_capacity(row_size * region.height as usize * region.depth as usize);
            for slice in 0..region.depth {
                for row in 0..region.height {
                    let offset = source.offset(x, y + row, z + slice);
                    rows.extend_from_slice(&source.data[offset..offset + row_size]);
                }
            }

            (rows, bpp)
        };

        let target = resources.get_mut(&dst).ok_or(Error::InvalidHandle(dst))?;

        if target.info.is_compressed() || target.bytes_per_pixel() != bpp {
            return Err(Error::NotSupported);
        }

        Self::check_region(&target.info, region.dst, &region)?;

        let row_size = region.width as usize * bpp;
        let (x, y, z) = region.dst;

        for (index, chunk) in rows.chunks_exact(row_size).enumerate() {
            let slice = index as u32 / region.height;
            let row = index as u32 % region.height;
            let offset = target.offset(x, y + row, z + slice);
            target.data[offset..offset + row_size].copy_from_slice(chunk);
        }

        self.update_stats(|stats| stats.copies += 1);
        Ok(())
    }

    fn check_region(
        info: &TextureInfo,
        origin: (u32, u32, u32),
        region: &CopyRegion,
    ) -> Result<(), Error> {
        let (x, y, z) = origin;

        let fits = |origin: u32, extent: u32, limit: u32| {
            u64::from(origin) + u64::from(extent) <= u64::from(limit)
        };

        if !fits(x, region.width, info.width)
            || !fits(y, region.height, info.height)
            || !fits(z, region.depth, info.depth)
        {
            return Err(Error::OutOfBounds);
        }

        Ok(())
    }

    //
    // Transfers
    //

    /// Returns the guest offsets of every row of the texture, together with
    /// the matching resource offsets.
    fn rows(
        info: &TextureInfo,
        layout: PixelLayout,
    ) -> Result<impl Iterator<Item = (usize, usize)>, Error> {
        let bpp = info.format.bytes_per_pixel() as usize;

        if layout.row_length < info.width || layout.alignment != 1 {
            return Err(Error::NotSupported);
        }

        let stride = layout.row_length as usize * bpp;
        let row_size = info.width as usize * bpp;
        let start = info.start_address.0 as usize;
        let rows = info.height as usize * info.depth as usize;

        Ok((0..rows).map(move |row| (start + row * stride, row * row_size)))
    }

    fn swap_components(data: &mut [u8], component_size: usize) {
        for component in data.chunks_exact_mut(component_size) {
            component.reverse();
        }
    }

    pub fn pull(
        &self,
        info: &TextureInfo,
        dst: ResourceHandle,
        layout: PixelLayout,
    ) -> Result<(), Error> {
        let guest = self.guest.borrow();
        let mut resources = self.resources.borrow_mut();
        let resource = resources.get_mut(&dst).ok_or(Error::InvalidHandle(dst))?;

        if resource.info.is_compressed() {
            return Err(Error::NotSupported);
        }

        let row_size = info.width as usize * info.format.bytes_per_pixel() as usize;

        for (guest_offset, offset) in Self::rows(info, layout)? {
            let source = guest
                .get(guest_offset..guest_offset + row_size)
                .ok_or(Error::OutOfBounds)?;
            let target = resource
                .data
                .get_mut(offset..offset + row_size)
                .ok_or(Error::OutOfBounds)?;

            target.copy_from_slice(source);

            if layout.swap_bytes {
                Self::swap_components(target, info.format.component_size() as usize);
            }
        }

        self.update_stats(|stats| stats.pulls += 1);
        Ok(())
    }

    pub fn pull_compressed(
        &self,
        info: &TextureInfo,
        dst: ResourceHandle,
        size: u32,
    ) -> Result<(), Error> {
        let range = self.guest_range(info.start_address, size as usize)?;
        let guest = self.guest.borrow();

        let mut resources = self.resources.borrow_mut();
        let resource = resources.get_mut(&dst).ok_or(Error::InvalidHandle(dst))?;

        if resource.data.len() != range.len() {
            return Err(Error::OutOfBounds);
        }

        resource.data.copy_from_slice(&guest[range]);

        self.update_stats(|stats| stats.pulls += 1);
        Ok(())
    }

    pub fn push(
        &self,
        info: &TextureInfo,
        src: ResourceHandle,
        layout: PixelLayout,
    ) -> Result<(), Error> {
        let mut guest = self.guest.borrow_mut();
        let resources = self.resources.borrow();
        let resource = resources.get(&src).ok_or(Error::InvalidHandle(src))?;

        if resource.info.is_compressed() {
            return Err(Error::NotSupported);
        }

        let row_size = info.width as usize * info.format.bytes_per_pixel() as usize;

        for (guest_offset, offset) in Self::rows(info, layout)? {
            let source = resource
                .data
                .get(offset..offset + row_size)
                .ok_or(Error::OutOfBounds)?;
            let target = guest
                .get_mut(guest_offset..guest_offset + row_size)
                .ok_or(Error::OutOfBounds)?;

            target.copy_from_slice(source);

            if layout.swap_bytes {
                Self::swap_components(target, info.format.component_size() as usize);
            }
        }

        self.update_stats(|stats| stats.pushes += 1);
        Ok(())
    }

    //
    // Protection
    //

    pub fn set_protection(
        &self,
        address: GuestAddress,
        size: u32,
        old: CacheAccess,
        new: CacheAccess,
    ) -> Result<(), Error> {
        if !address.is_aligned(self.page_size) {
            return Err(Error::Unaligned(address));
        }

        if size % self.page_size != 0 {
            return Err(Error::Unaligned(address));
        }

        let first = self.page_index(u64::from(address.0));
        let count = size / self.page_size;

        tracing::trace!(%address, size, %old, %new, "changing page protection");

        let mut protection = self.protection.borrow_mut();

        for page in first..first + count {
            let current = protection.get(&page).copied().unwrap_or_else(CacheAccess::empty);

            if current != old {
                tracing::warn!(page, %current, %old, "unexpected page protection");
            }

            if new.is_empty() {
                protection.remove(&page);
            }
            else {
                protection.insert(page, new);
            }
        }

        self.update_stats(|stats| stats.protection_changes += 1);
        Ok(())
    }
}
