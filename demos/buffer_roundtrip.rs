use std::sync::Arc;

use clmem::device::{
    ClVersion, DeviceCaps, MemHandle, RunParams, SoftwareDevice, SvmCapabilities,
};
use clmem::diag::TracingSink;
use clmem::memory::{AccessMode, MemoryRegion, RegionConfig, SvmTier};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    println!("============================================================");
    println!("        clmem - Buffer/Image Round-Trip Demonstration       ");
    println!("============================================================");

    // 1. Stand in a software device with pre-2.0 capabilities, so image
    //    bindings go through explicit copies.
    let device = Arc::new(SoftwareDevice::new());
    let caps = DeviceCaps::new(ClVersion::new(1, 2), SvmCapabilities::from_raw(0));
    println!("[+] Device version: {} (unified memory objects: {})", caps.version,
        caps.supports_unified_memory_objects());

    // 2. Allocate a 4096-byte read-write region without shared memory.
    println!("[+] Allocating 4096-byte region (tier: none)...");
    let region = MemoryRegion::allocate(
        device.clone(),
        caps,
        Arc::new(TracingSink),
        RegionConfig {
            size_bytes: 4096,
            access: AccessMode::ReadWrite,
            tier: SvmTier::None,
        },
    )?;
    println!("    Host mapped after allocation: {}", region.is_host_mapped());

    // 3. Write a test pattern through the host mapping.
    let pattern: Vec<u8> = (0..4096).map(|i| (i % 256) as u8).collect();
    region.write_from(&pattern)?;
    println!("[+] Wrote {} pattern bytes", pattern.len());

    // 4. Lease the region to the device and bind it as a 64x64 read-only
    //    image argument. The buffer content is copied into the new image.
    println!("[+] Acquiring device lease and binding as image argument...");
    let kernel = device.register_kernel();
    {
        let lease = region.acquire_lease()?;
        lease.bind_as_kernel_argument(
            kernel,
            0,
            true,
            AccessMode::ReadOnly,
            &RunParams::new([64usize, 64]),
        )?;

        match device.kernel_arg(kernel, 0) {
            Some(MemHandle::Image(img)) => {
                let bytes = device.image_bytes(img).unwrap_or_default();
                println!("    Bound image of {} bytes (64x64 RGBA f32)", bytes.len());
            }
            other => println!("    Unexpected binding: {other:?}"),
        }
    }
    println!("[+] Lease released");

    // 5. Re-establish host access; the image is torn down and the original
    //    content is still there.
    let mut readback = vec![0u8; 4096];
    region.read_into(&mut readback)?;
    println!(
        "[+] Read back {} bytes, pattern intact: {}",
        readback.len(),
        readback == pattern
    );

    Ok(())
}
