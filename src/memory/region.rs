//! The memory region: one device-backed allocation, arbitrated between a
//! host mapping and device-side kernel access, with on-demand conversion
//! between buffer and image shape.

use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::debug;

use crate::device::{
    BufferHandle, DeviceCaps, DeviceOps, ImageDesc, ImageHandle, KernelHandle, MapFlags,
    MemHandle, RunParams,
};
use crate::diag::DiagnosticSink;
use crate::error::{MemError, MemResult};
use crate::memory::{AccessMode, DeviceLease, RegionConfig, SvmTier};

/// Mutable region state. One in-flight operation per region at a time is the
/// caller's contract, so interior mutability is a `RefCell`.
struct RegionState {
    buffer: BufferHandle,
    image: Option<ImageHandle>,
    /// Host address of the allocation. For SVM tiers this is the shared
    /// allocation and stays fixed for the region's lifetime; for tier None it
    /// is the address the initial blocking map returned, kept across unmaps
    /// so remaps can be checked against it.
    host_ptr: NonNull<u8>,
    host_mapped: bool,
    device_leased: bool,
    /// Access direction the current image was created under. Reset to
    /// `ReadOnly` whenever no image exists.
    image_access: AccessMode,
    /// Set once a remap came back at a different address. Unrecoverable for
    /// this region.
    poisoned: Option<(usize, usize)>,
}

pub struct MemoryRegion {
    device: Arc<dyn DeviceOps>,
    caps: DeviceCaps,
    diag: Arc<dyn DiagnosticSink>,
    size_bytes: usize,
    access: AccessMode,
    tier: SvmTier,
    state: RefCell<RegionState>,
}

// A region may be handed to a worker thread dedicated to its lifecycle. The
// raw host pointer is dereferenced only while host-mapped, and the caller
// serializes all operations on one region.
unsafe impl Send for MemoryRegion {}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.borrow();
        f.debug_struct("MemoryRegion")
            .field("size_bytes", &self.size_bytes)
            .field("access", &self.access)
            .field("tier", &self.tier)
            .field("host_mapped", &st.host_mapped)
            .field("device_leased", &st.device_leased)
            .finish_non_exhaustive()
    }
}

impl MemoryRegion {
    /// Allocates a region per its tier.
    ///
    /// Fine/Coarse tiers take one shared allocation and wrap it in a buffer
    /// object so kernels reach the same bytes. Tier None creates a buffer
    /// with host-accessible backing and performs the initial blocking map,
    /// leaving the region host-mapped. Partial successes are rolled back
    /// before the error returns.
    ///
    /// # Errors
    /// `AllocationFailure` when the shared allocation, buffer creation, or
    /// initial map fails.
    pub fn allocate(
        device: Arc<dyn DeviceOps>,
        caps: DeviceCaps,
        diag: Arc<dyn DiagnosticSink>,
        config: RegionConfig,
    ) -> MemResult<Self> {
        let RegionConfig {
            size_bytes,
            access,
            tier,
        } = config;

        let (buffer, host_ptr, host_mapped) = match tier {
            SvmTier::Fine | SvmTier::Coarse => {
                let host = device.svm_alloc(tier, access, size_bytes);
                let Some(host_ptr) = NonNull::new(host) else {
                    return Err(MemError::AllocationFailure(format!(
                        "shared allocation of {size_bytes} bytes failed (tier {})",
                        tier.name()
                    )));
                };
                match device.create_buffer_from_host(access, size_bytes, host) {
                    Ok(buf) => (buf, host_ptr, false),
                    Err(code) => {
                        device.svm_free(host);
                        return Err(MemError::AllocationFailure(format!(
                            "buffer wrap over shared allocation failed with status {code}"
                        )));
                    }
                }
            }
            SvmTier::None => {
                let buf = device.create_buffer(access, size_bytes).map_err(|code| {
                    MemError::AllocationFailure(format!(
                        "buffer creation of {size_bytes} bytes failed with status {code}"
                    ))
                })?;
                match device.map_buffer(buf, MapFlags::initial_for(access), size_bytes) {
                    Ok(ptr) => match NonNull::new(ptr) {
                        Some(host_ptr) => (buf, host_ptr, true),
                        None => {
                            device.release_buffer(buf).ok();
                            return Err(MemError::AllocationFailure(
                                "initial blocking map returned a null host pointer".into(),
                            ));
                        }
                    },
                    Err(code) => {
                        device.release_buffer(buf).ok();
                        return Err(MemError::AllocationFailure(format!(
                            "initial blocking map failed with status {code}"
                        )));
                    }
                }
            }
        };

        Ok(Self {
            device,
            caps,
            diag,
            size_bytes,
            access,
            tier,
            state: RefCell::new(RegionState {
                buffer,
                image: None,
                host_ptr,
                host_mapped,
                device_leased: false,
                image_access: AccessMode::ReadOnly,
                poisoned: None,
            }),
        })
    }

    /// Establishes (or confirms) host access and returns the host address.
    ///
    /// Idempotent while already mapped. If an image representation exists, it
    /// is synchronized back into the buffer first (below the unified-memory
    /// threshold and unless the host intends a pure overwrite) and released.
    ///
    /// # Errors
    /// `AccessConflict` while a device lease is outstanding;
    /// `MapAddressMismatch` (fatal for the region) when a tier-None remap
    /// comes back at a different address; `DeviceOperationFailure` for any
    /// failed device call, which leaves the region in its prior state.
    pub fn host_access(&self, direction: AccessMode) -> MemResult<NonNull<u8>> {
        let mut st = self.state.borrow_mut();
        if st.device_leased {
            return Err(MemError::AccessConflict);
        }
        if let Some((expected, actual)) = st.poisoned {
            return Err(MemError::MapAddressMismatch { expected, actual });
        }
        if st.host_mapped {
            return Ok(st.host_ptr);
        }

        if let Some(img) = st.image.take() {
            // The buffer must hold the freshest data before the host reads
            // it; a host about to overwrite everything can skip the copy.
            if !self.caps.supports_unified_memory_objects() && direction != AccessMode::WriteOnly {
                if let Err(e) = self.copy_image_back(img, st.buffer) {
                    st.image = Some(img);
                    return Err(e);
                }
            }
            if let Err(code) = self.device.release_image(img) {
                st.image = Some(img);
                return Err(MemError::DeviceOperationFailure {
                    op: "release_image",
                    code,
                });
            }
            st.image_access = AccessMode::ReadOnly;
        }

        let flags = MapFlags::from_direction(direction);
        match self.tier {
            SvmTier::None => {
                let ptr = self
                    .device
                    .map_buffer(st.buffer, flags, self.size_bytes)
                    .map_err(|code| MemError::DeviceOperationFailure {
                        op: "map_buffer",
                        code,
                    })?;
                if ptr != st.host_ptr.as_ptr() {
                    let mismatch = (st.host_ptr.as_ptr() as usize, ptr as usize);
                    st.poisoned = Some(mismatch);
                    st.host_mapped = false;
                    return Err(MemError::MapAddressMismatch {
                        expected: mismatch.0,
                        actual: mismatch.1,
                    });
                }
            }
            SvmTier::Coarse => {
                self.device
                    .svm_map(st.host_ptr.as_ptr(), self.size_bytes, flags)
                    .map_err(|code| MemError::DeviceOperationFailure { op: "svm_map", code })?;
            }
            // Fine-grained sharing is always coherent; mark mapped for
            // bookkeeping symmetry only.
            SvmTier::Fine => {}
        }
        st.host_mapped = true;
        Ok(st.host_ptr)
    }

    /// Establishes host access for writing and copies `src` into the region.
    /// Copies at most `size_bytes`.
    ///
    /// # Errors
    /// Same conditions as [`Self::host_access`].
    pub fn write_from(&self, src: &[u8]) -> MemResult<()> {
        let ptr = self.host_access(AccessMode::WriteOnly)?;
        let n = src.len().min(self.size_bytes);
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), n) };
        Ok(())
    }

    /// Establishes host access for reading and copies the region into `dst`.
    /// Copies at most `size_bytes`.
    ///
    /// # Errors
    /// Same conditions as [`Self::host_access`].
    pub fn read_into(&self, dst: &mut [u8]) -> MemResult<()> {
        let ptr = self.host_access(AccessMode::ReadOnly)?;
        let n = dst.len().min(self.size_bytes);
        unsafe { std::ptr::copy_nonoverlapping(ptr.as_ptr(), dst.as_mut_ptr(), n) };
        Ok(())
    }

    /// Drops the host mapping. Idempotent when already unmapped.
    pub(crate) fn release_host_access(&self) -> MemResult<()> {
        let mut st = self.state.borrow_mut();
        if !st.host_mapped {
            return Ok(());
        }
        match self.tier {
            SvmTier::None => self
                .device
                .unmap_buffer(st.buffer, st.host_ptr.as_ptr())
                .map_err(|code| MemError::DeviceOperationFailure {
                    op: "unmap_buffer",
                    code,
                })?,
            SvmTier::Coarse => self
                .device
                .svm_unmap(st.host_ptr.as_ptr())
                .map_err(|code| MemError::DeviceOperationFailure {
                    op: "svm_unmap",
                    code,
                })?,
            SvmTier::Fine => {}
        }
        st.host_mapped = false;
        Ok(())
    }

    /// Converts the region into the representation a kernel argument expects
    /// and returns the device handle, copying between representations only
    /// where the device cannot alias them.
    pub(crate) fn resolve_device_memory(
        &self,
        run: &RunParams,
        wants_image: bool,
        kernel_access: AccessMode,
    ) -> MemResult<MemHandle> {
        let mut st = self.state.borrow_mut();
        let unified = self.caps.supports_unified_memory_objects();

        match (wants_image, st.image) {
            (true, None) => {
                let desc = ImageDesc::from_work_dims(run).ok_or(MemError::InvalidDimensions)?;
                let link = if unified { Some(st.buffer) } else { None };
                let img = self
                    .device
                    .create_image(kernel_access, &desc, link)
                    .map_err(|code| MemError::DeviceOperationFailure {
                        op: "create_image",
                        code,
                    })?;

                // A write-only argument is assumed to overwrite every element,
                // so seeding the image from the buffer is skipped. Sound only
                // if the kernel really writes the whole image.
                if !unified && kernel_access != AccessMode::WriteOnly {
                    debug!(
                        width = desc.width,
                        height = desc.height,
                        depth = desc.depth,
                        "copying buffer contents into new image"
                    );
                    if let Err(code) = self.device.copy_buffer_to_image(st.buffer, img) {
                        self.device.release_image(img).ok();
                        return Err(MemError::DeviceOperationFailure {
                            op: "copy_buffer_to_image",
                            code,
                        });
                    }
                }
                st.image = Some(img);
                st.image_access = kernel_access;
                Ok(MemHandle::Image(img))
            }
            (false, Some(img)) => {
                // A read-only image cannot have been mutated by the kernel,
                // so the buffer is already current.
                if !unified && st.image_access != AccessMode::ReadOnly {
                    self.copy_image_back(img, st.buffer)?;
                }
                self.device
                    .release_image(img)
                    .map_err(|code| MemError::DeviceOperationFailure {
                        op: "release_image",
                        code,
                    })?;
                st.image = None;
                st.image_access = AccessMode::ReadOnly;
                Ok(MemHandle::Buffer(st.buffer))
            }
            (true, Some(img)) => Ok(MemHandle::Image(img)),
            (false, None) => Ok(MemHandle::Buffer(st.buffer)),
        }
    }

    /// Synchronizes image contents back into the buffer, sized from the live
    /// image region.
    fn copy_image_back(&self, img: ImageHandle, buf: BufferHandle) -> MemResult<()> {
        let region =
            self.device
                .image_region(img)
                .map_err(|code| MemError::DeviceOperationFailure {
                    op: "image_region",
                    code,
                })?;
        debug!(
            width = region[0],
            height = region[1],
            depth = region[2],
            "copying image contents back to buffer"
        );
        self.device
            .copy_image_to_buffer(img, buf)
            .map_err(|code| MemError::DeviceOperationFailure {
                op: "copy_image_to_buffer",
                code,
            })
    }

    /// Authorizes device-side use of the region. Any host mapping is released
    /// first, so a host pointer and a lease never coexist; while the lease
    /// lives, host access is refused.
    ///
    /// # Errors
    /// `AlreadyLeased` while another lease is outstanding;
    /// `DeviceOperationFailure` when releasing the host mapping fails, in
    /// which case no lease is taken.
    pub fn acquire_lease(&self) -> MemResult<DeviceLease<'_>> {
        if self.state.borrow().device_leased {
            return Err(MemError::AlreadyLeased);
        }
        self.release_host_access()?;
        self.state.borrow_mut().device_leased = true;
        Ok(DeviceLease::new(self))
    }

    /// Binds the region to a kernel argument slot: releases host access,
    /// resolves the requested representation, and binds the handle.
    pub(crate) fn bind_kernel_arg(
        &self,
        kernel: KernelHandle,
        index: u32,
        wants_image: bool,
        kernel_access: AccessMode,
        run: &RunParams,
    ) -> MemResult<()> {
        self.release_host_access()?;
        let mem = self.resolve_device_memory(run, wants_image, kernel_access)?;
        self.device
            .set_kernel_arg(kernel, index, mem)
            .map_err(|code| MemError::DeviceOperationFailure {
                op: "set_kernel_arg",
                code,
            })
    }

    pub(crate) fn on_lease_released(&self) {
        self.state.borrow_mut().device_leased = false;
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    #[must_use]
    pub fn access(&self) -> AccessMode {
        self.access
    }

    #[must_use]
    pub fn tier(&self) -> SvmTier {
        self.tier
    }

    #[must_use]
    pub fn tier_name(&self) -> &'static str {
        self.tier.name()
    }

    /// Host address, present only while host-mapped.
    #[must_use]
    pub fn host_ptr(&self) -> Option<NonNull<u8>> {
        let st = self.state.borrow();
        st.host_mapped.then_some(st.host_ptr)
    }

    #[must_use]
    pub fn is_host_mapped(&self) -> bool {
        self.state.borrow().host_mapped
    }

    #[must_use]
    pub fn is_device_leased(&self) -> bool {
        self.state.borrow().device_leased
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        let st = self.state.get_mut();

        if st.host_mapped {
            let res = match self.tier {
                SvmTier::None => self.device.unmap_buffer(st.buffer, st.host_ptr.as_ptr()),
                SvmTier::Coarse => self.device.svm_unmap(st.host_ptr.as_ptr()),
                SvmTier::Fine => Ok(()),
            };
            if let Err(code) = res {
                self.diag.release_failure("unmap", code);
            }
            st.host_mapped = false;
        }

        if let Some(img) = st.image.take() {
            if let Err(code) = self.device.release_image(img) {
                self.diag.release_failure("release_image", code);
            }
        }

        if let Err(code) = self.device.release_buffer(st.buffer) {
            self.diag.release_failure("release_buffer", code);
        }

        if self.tier != SvmTier::None {
            self.device.svm_free(st.host_ptr.as_ptr());
        }
    }
}
