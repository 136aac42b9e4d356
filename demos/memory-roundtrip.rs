//! Walks a texture through a guest write, a device render and a guest read
//! using the software driver.

use texcache::{
    CacheBuffers, GuestAddress, TextureCache, TextureFormat, TextureInfo,
    driver::memory::{Error as MemoryError, MemoryCacheDriver},
};
use tracing_subscriber::EnvFilter;

/// Writes guest memory, resolving trapped pages through the cache.
fn guest_write(
    cache: &mut TextureCache<MemoryCacheDriver>,
    address: GuestAddress,
    content: &[u8],
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        match cache.driver().write_guest(address, content) {
            Err(MemoryError::AccessViolation(fault)) => {
                tracing::info!(address = %fault.address, access = %fault.access, "guest write trapped");

                if !cache.handle_fault(fault)? {
                    return Err("unhandled access violation".into());
                }
            }
            result => return Ok(result?),
        }
    }
}

/// Reads guest memory, resolving trapped pages through the cache.
fn guest_read(
    cache: &mut TextureCache<MemoryCacheDriver>,
    address: GuestAddress,
    buffer: &mut [u8],
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        match cache.driver().read_guest(address, buffer) {
            Err(MemoryError::AccessViolation(fault)) => {
                tracing::info!(address = %fault.address, access = %fault.access, "guest read trapped");

                if !cache.handle_fault(fault)? {
                    return Err("unhandled access violation".into());
                }
            }
            result => return Ok(result?),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_target(false)
        .init();

    let driver = MemoryCacheDriver::new(0x40_0000)?;
    let mut cache = TextureCache::new(driver)?;

    let info = TextureInfo::new(GuestAddress(0x10000), 64, 64, TextureFormat::Rgba8);
    let size = info.size() as usize;

    // The guest uploads pixel data, then the texture is sampled.
    let pixels = (0..size).map(|index| index as u8).collect::<Vec<_>>();
    guest_write(&mut cache, info.start_address, &pixels)?;

    let handle = {
        let texture = cache.entry(&info, CacheBuffers::LOCAL)?;
        tracing::info!(state = ?texture.state(), "texture sampled");
        texture.handle().ok_or("texture has no device resource")?
    };
    cache.update_protection()?;

    // The guest patches a few pixels; the device copy becomes stale.
    guest_write(&mut cache, GuestAddress(0x10100), &[0xff; 64])?;
    tracing::info!(state = ?cache.find(&info).map(|t| t.state()), "after guest write");

    // Sampling again pulls the patched data.
    cache.entry(&info, CacheBuffers::LOCAL)?;
    cache.update_protection()?;

    // The device renders into the texture.
    cache.driver().write_resource(handle, &vec![0x5a; size])?;
    if let Some(mut texture) = cache.texture(&info) {
        texture.invalidate(CacheBuffers::HOST)?;
    }
    cache.update_protection()?;

    // The guest reads the rendered image back.
    let mut readback = vec![0; size];
    guest_read(&mut cache, info.start_address, &mut readback)?;
    tracing::info!(
        matches = readback.iter().all(|&byte| byte == 0x5a),
        "guest read back rendered data"
    );

    tracing::info!(stats = ?cache.driver().stats(), "done");

    cache.clear()?;
    Ok(())
}
