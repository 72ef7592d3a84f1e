//! Short-lived capability authorizing device-side use of a region.

use crate::device::{KernelHandle, RunParams};
use crate::error::MemResult;
use crate::memory::{AccessMode, MemoryRegion};

/// Obtained from [`MemoryRegion::acquire_lease`]. While it lives, the region
/// refuses host access; dropping it (or calling [`Self::release`]) makes host
/// access eligible again without re-establishing it.
///
/// The borrow ties the lease's lifetime to its region, so a lease can never
/// outlive the region it came from.
pub struct DeviceLease<'a> {
    region: &'a MemoryRegion,
}

impl<'a> DeviceLease<'a> {
    pub(crate) fn new(region: &'a MemoryRegion) -> Self {
        Self { region }
    }

    /// Binds the region to a kernel argument slot in the requested shape.
    ///
    /// Releases any host mapping first (device access requires the region not
    /// be host-mapped), then resolves the buffer or image representation and
    /// binds the handle. Errors from either step propagate without a partial
    /// binding.
    ///
    /// # Errors
    /// `InvalidDimensions` for an image shape with zero work dimensions;
    /// `DeviceOperationFailure` for failed unmap, conversion, or bind calls.
    pub fn bind_as_kernel_argument(
        &self,
        kernel: KernelHandle,
        index: u32,
        wants_image: bool,
        kernel_access: AccessMode,
        run: &RunParams,
    ) -> MemResult<()> {
        self.region
            .bind_kernel_arg(kernel, index, wants_image, kernel_access, run)
    }

    #[must_use]
    pub fn region(&self) -> &MemoryRegion {
        self.region
    }

    /// Explicitly ends the lease; equivalent to dropping it.
    pub fn release(self) {}
}

impl Drop for DeviceLease<'_> {
    fn drop(&mut self) {
        self.region.on_lease_released();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::{
        ClVersion, DeviceCaps, MemHandle, SoftwareDevice, SvmCapabilities,
    };
    use crate::diag::TracingSink;
    use crate::memory::{RegionConfig, SvmTier};

    fn pre_threshold_region(dev: &Arc<SoftwareDevice>, size: usize) -> MemoryRegion {
        MemoryRegion::allocate(
            dev.clone(),
            DeviceCaps::new(ClVersion::new(1, 2), SvmCapabilities::from_raw(0)),
            Arc::new(TracingSink),
            RegionConfig {
                size_bytes: size,
                access: AccessMode::ReadWrite,
                tier: SvmTier::None,
            },
        )
        .unwrap()
    }

    #[test]
    fn lease_flags_follow_lifecycle() {
        let dev = Arc::new(SoftwareDevice::new());
        let region = pre_threshold_region(&dev, 64);
        assert!(!region.is_device_leased());
        let lease = region.acquire_lease().unwrap();
        assert!(lease.region().is_device_leased());
        lease.release();
        assert!(!region.is_device_leased());
    }

    #[test]
    fn leasing_and_binding_keep_the_region_unmapped() {
        let dev = Arc::new(SoftwareDevice::new());
        let region = pre_threshold_region(&dev, 64);
        assert!(region.is_host_mapped());
        let lease = region.acquire_lease().unwrap();
        assert!(!region.is_host_mapped());
        let kernel = dev.register_kernel();
        lease
            .bind_as_kernel_argument(kernel, 0, false, AccessMode::ReadOnly, &RunParams::new([
                8usize,
            ]))
            .unwrap();
        assert!(!region.is_host_mapped());
    }

    #[test]
    fn bind_buffer_shape_records_the_buffer_handle() {
        let dev = Arc::new(SoftwareDevice::new());
        let region = pre_threshold_region(&dev, 64);
        let lease = region.acquire_lease().unwrap();
        let kernel = dev.register_kernel();
        lease
            .bind_as_kernel_argument(kernel, 2, false, AccessMode::ReadWrite, &RunParams::new([
                8usize,
            ]))
            .unwrap();
        assert!(matches!(
            dev.kernel_arg(kernel, 2),
            Some(MemHandle::Buffer(_))
        ));
    }

    #[test]
    fn bind_image_shape_records_an_image_handle() {
        let dev = Arc::new(SoftwareDevice::new());
        let region = pre_threshold_region(&dev, 64);
        let lease = region.acquire_lease().unwrap();
        let kernel = dev.register_kernel();
        lease
            .bind_as_kernel_argument(
                kernel,
                0,
                true,
                AccessMode::ReadOnly,
                &RunParams::new([2usize, 2]),
            )
            .unwrap();
        assert!(matches!(
            dev.kernel_arg(kernel, 0),
            Some(MemHandle::Image(_))
        ));
    }

    #[test]
    fn dropping_the_lease_does_not_restore_the_mapping() {
        let dev = Arc::new(SoftwareDevice::new());
        let region = pre_threshold_region(&dev, 64);
        {
            let lease = region.acquire_lease().unwrap();
            let kernel = dev.register_kernel();
            lease
                .bind_as_kernel_argument(kernel, 0, false, AccessMode::ReadOnly, &RunParams::new(
                    [8usize],
                ))
                .unwrap();
        }
        assert!(!region.is_host_mapped());
        region.host_access(AccessMode::ReadOnly).unwrap();
        assert!(region.is_host_mapped());
    }
}
