//! End-to-end lifecycle tests driving the memory core through the software
//! backend: host write, kernel-argument binding in image shape, conversion
//! back, and host read.

use std::sync::Arc;

use parking_lot::Mutex;

use clmem::MemError;
use clmem::device::{
    ClVersion, DeviceCaps, MemHandle, RunParams, SoftwareDevice, SvmCapabilities,
};
use clmem::diag::{DiagnosticSink, TracingSink};
use clmem::memory::{AccessMode, MemoryRegion, RegionConfig, SvmTier};

fn pre_threshold() -> DeviceCaps {
    DeviceCaps::new(ClVersion::new(1, 2), SvmCapabilities::from_raw(0))
}

fn allocate(
    dev: &Arc<SoftwareDevice>,
    caps: DeviceCaps,
    size: usize,
    access: AccessMode,
    tier: SvmTier,
) -> MemoryRegion {
    MemoryRegion::allocate(
        dev.clone(),
        caps,
        Arc::new(TracingSink),
        RegionConfig {
            size_bytes: size,
            access,
            tier,
        },
    )
    .unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn image_roundtrip_preserves_buffer_content() {
    let dev = Arc::new(SoftwareDevice::new());
    let region = allocate(
        &dev,
        pre_threshold(),
        1024,
        AccessMode::ReadWrite,
        SvmTier::None,
    );

    let data = pattern(1024);
    region.write_from(&data).unwrap();

    {
        let lease = region.acquire_lease().unwrap();
        let kernel = dev.register_kernel();
        // Read-only image on a pre-threshold device: seeded with a copy-in.
        lease
            .bind_as_kernel_argument(
                kernel,
                0,
                true,
                AccessMode::ReadOnly,
                &RunParams::new([8usize, 8]),
            )
            .unwrap();
        let Some(MemHandle::Image(img)) = dev.kernel_arg(kernel, 0) else {
            panic!("image shape expected");
        };
        assert_eq!(&dev.image_bytes(img).unwrap()[..1024], &data[..]);
    }

    let mut out = vec![0u8; 1024];
    region.read_into(&mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn write_only_image_skips_the_seed_copy() {
    let dev = Arc::new(SoftwareDevice::new());
    let region = allocate(
        &dev,
        pre_threshold(),
        256,
        AccessMode::ReadWrite,
        SvmTier::None,
    );

    // Sentinel in the buffer that must never reach the image.
    region.write_from(&[0xEE; 256]).unwrap();

    let lease = region.acquire_lease().unwrap();
    let kernel = dev.register_kernel();
    lease
        .bind_as_kernel_argument(
            kernel,
            0,
            true,
            AccessMode::WriteOnly,
            &RunParams::new([4usize, 4]),
        )
        .unwrap();
    let Some(MemHandle::Image(img)) = dev.kernel_arg(kernel, 0) else {
        panic!("image shape expected");
    };
    let img_bytes = dev.image_bytes(img).unwrap();
    assert!(
        img_bytes.iter().all(|&b| b != 0xEE),
        "write-only image must not be seeded from the buffer"
    );

    // Converting back copies the (unwritten) image over the buffer, since a
    // write-only image attribute means the kernel may have produced output.
    lease
        .bind_as_kernel_argument(
            kernel,
            0,
            false,
            AccessMode::ReadWrite,
            &RunParams::new([4usize, 4]),
        )
        .unwrap();
    drop(lease);

    let mut out = vec![0u8; 256];
    region.read_into(&mut out).unwrap();
    assert!(out.iter().all(|&b| b != 0xEE));
}

#[test]
fn concrete_4096_byte_scenario() {
    // Region of 4096 bytes, ReadWrite, tier None, pre-threshold device.
    let dev = Arc::new(SoftwareDevice::new());
    let region = allocate(
        &dev,
        pre_threshold(),
        4096,
        AccessMode::ReadWrite,
        SvmTier::None,
    );

    let ptr = region.host_access(AccessMode::ReadWrite).unwrap();
    let data = pattern(4096);
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), 4096) };

    {
        let lease = region.acquire_lease().unwrap();
        let kernel = dev.register_kernel();
        lease
            .bind_as_kernel_argument(
                kernel,
                0,
                true,
                AccessMode::ReadOnly,
                &RunParams::new([64usize, 64]),
            )
            .unwrap();

        // A 64x64 RGBA-float image, seeded with the buffer content.
        let Some(MemHandle::Image(img)) = dev.kernel_arg(kernel, 0) else {
            panic!("image shape expected");
        };
        let bytes = dev.image_bytes(img).unwrap();
        assert_eq!(bytes.len(), 64 * 64 * 16);
        assert_eq!(&bytes[..4096], &data[..]);
    }

    // Host re-entry syncs the image back and releases it; the content is
    // unchanged since the kernel argument was read-only.
    let back = region.host_access(AccessMode::ReadOnly).unwrap();
    let out = unsafe { std::slice::from_raw_parts(back.as_ptr(), 4096) };
    assert_eq!(out, &data[..]);
}

#[test]
fn coarse_tier_roundtrip_through_shared_pointer() {
    let dev = Arc::new(SoftwareDevice::new());
    let region = allocate(
        &dev,
        pre_threshold(),
        512,
        AccessMode::ReadWrite,
        SvmTier::Coarse,
    );

    let data = pattern(512);
    region.write_from(&data).unwrap();
    let before = region.host_access(AccessMode::ReadWrite).unwrap();

    {
        let lease = region.acquire_lease().unwrap();
        let kernel = dev.register_kernel();
        lease
            .bind_as_kernel_argument(kernel, 0, false, AccessMode::ReadOnly, &RunParams::new([
                64usize,
            ]))
            .unwrap();
    }

    // The shared pointer is stable across unmap/remap.
    let after = region.host_access(AccessMode::ReadOnly).unwrap();
    assert_eq!(before, after);
    let mut out = vec![0u8; 512];
    region.read_into(&mut out).unwrap();
    assert_eq!(out, data);
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<(&'static str, i32)>>);

impl DiagnosticSink for RecordingSink {
    fn release_failure(&self, op: &'static str, code: i32) {
        self.0.lock().push((op, code));
    }
}

#[test]
fn teardown_failures_reach_the_diagnostic_sink() {
    let dev = Arc::new(SoftwareDevice::new());
    let sink = Arc::new(RecordingSink::default());
    let region = MemoryRegion::allocate(
        dev.clone(),
        pre_threshold(),
        sink.clone(),
        RegionConfig {
            size_bytes: 64,
            access: AccessMode::ReadWrite,
            tier: SvmTier::None,
        },
    )
    .unwrap();

    {
        let lease = region.acquire_lease().unwrap();
        let kernel = dev.register_kernel();
        lease
            .bind_as_kernel_argument(
                kernel,
                0,
                true,
                AccessMode::ReadWrite,
                &RunParams::new([2usize, 2]),
            )
            .unwrap();
    }

    dev.fail_next_image_release();
    drop(region);

    let reports = sink.0.lock();
    assert_eq!(reports.as_slice(), &[("release_image", -5)]);
    assert_eq!(dev.live_images(), 0);
    assert_eq!(dev.live_buffers(), 0);
}

#[test]
fn poisoned_region_still_tears_down_cleanly() {
    let dev = Arc::new(SoftwareDevice::new());
    {
        let region = allocate(
            &dev,
            pre_threshold(),
            64,
            AccessMode::ReadWrite,
            SvmTier::None,
        );
        {
            let lease = region.acquire_lease().unwrap();
            let kernel = dev.register_kernel();
            lease
                .bind_as_kernel_argument(kernel, 0, false, AccessMode::ReadOnly, &RunParams::new(
                    [8usize],
                ))
                .unwrap();
        }
        dev.shift_next_map();
        assert!(matches!(
            region.host_access(AccessMode::ReadWrite),
            Err(MemError::MapAddressMismatch { .. })
        ));
    }
    assert_eq!(dev.live_buffers(), 0);
}

#[test]
fn two_regions_share_one_device() {
    let dev = Arc::new(SoftwareDevice::new());
    let a = allocate(
        &dev,
        pre_threshold(),
        128,
        AccessMode::ReadOnly,
        SvmTier::None,
    );
    let b = allocate(
        &dev,
        pre_threshold(),
        128,
        AccessMode::WriteOnly,
        SvmTier::Fine,
    );

    a.write_from(&[1u8; 128]).unwrap();
    b.write_from(&[2u8; 128]).unwrap();

    let mut out_a = vec![0u8; 128];
    let mut out_b = vec![0u8; 128];
    a.read_into(&mut out_a).unwrap();
    b.read_into(&mut out_b).unwrap();
    assert!(out_a.iter().all(|&x| x == 1));
    assert!(out_b.iter().all(|&x| x == 2));

    drop(a);
    assert_eq!(dev.live_buffers(), 1);
    drop(b);
    assert_eq!(dev.live_buffers(), 0);
    assert_eq!(dev.live_svm_allocs(), 0);
}
