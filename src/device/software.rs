//! In-process reference backend.
//!
//! Simulates device buffers, images, and shared allocations over page-aligned
//! host memory, and records kernel-argument bindings. Carries fault-injection
//! switches so the failure paths of the memory core can be driven without
//! hardware.

use std::collections::HashMap;
use std::ptr;

use parking_lot::Mutex;

use crate::device::{
    BufferHandle, DeviceOps, DeviceStatus, ImageDesc, ImageHandle, KernelHandle, MapFlags,
    MemHandle, STATUS_INVALID_KERNEL, STATUS_INVALID_MEM_OBJECT, STATUS_INVALID_VALUE,
    STATUS_MAP_FAILURE, STATUS_MEM_OBJECT_ALLOCATION_FAILURE, STATUS_OUT_OF_RESOURCES,
};
use crate::memory::{AccessMode, SvmTier};

const PAGE_SIZE: usize = 4096;

/// Page-aligned zeroed host allocation, freed on drop.
struct HostAlloc {
    ptr: *mut u8,
    size: usize,
}

impl HostAlloc {
    fn new(size: usize) -> Option<Self> {
        let size = size.max(1);
        let mut raw: *mut libc::c_void = ptr::null_mut();
        let rc = unsafe { libc::posix_memalign(&mut raw, PAGE_SIZE, size) };
        if rc != 0 || raw.is_null() {
            return None;
        }
        let ptr = raw.cast::<u8>();
        unsafe { ptr::write_bytes(ptr, 0, size) };
        Some(Self { ptr, size })
    }
}

impl Drop for HostAlloc {
    fn drop(&mut self) {
        unsafe { libc::free(self.ptr.cast()) };
    }
}

/// Backing bytes of a simulated buffer object.
enum Backing {
    /// Storage allocated for this buffer (alloc-host-ptr).
    Owned(HostAlloc),
    /// Storage owned by a shared allocation (use-host-ptr).
    Foreign { ptr: *mut u8, size: usize },
}

impl Backing {
    fn ptr(&self) -> *mut u8 {
        match self {
            Self::Owned(alloc) => alloc.ptr,
            Self::Foreign { ptr, .. } => *ptr,
        }
    }

    fn size(&self) -> usize {
        match self {
            Self::Owned(alloc) => alloc.size,
            Self::Foreign { size, .. } => *size,
        }
    }
}

enum ImageStorage {
    Owned(HostAlloc),
    /// View over an existing buffer's bytes (unified memory objects).
    Aliased(BufferHandle),
}

struct ImageCell {
    desc: ImageDesc,
    storage: ImageStorage,
}

#[derive(Default)]
struct Faults {
    fail_next_buffer_create: bool,
    fail_next_map: bool,
    shift_next_map: bool,
    fail_next_image_release: bool,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    buffers: HashMap<u64, Backing>,
    images: HashMap<u64, ImageCell>,
    svm: HashMap<usize, HostAlloc>,
    kernel_args: HashMap<u64, HashMap<u32, MemHandle>>,
    faults: Faults,
}

impl Inner {
    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn image_bytes_locked(&self, id: u64) -> Option<Vec<u8>> {
        let cell = self.images.get(&id)?;
        let (ptr, len) = match &cell.storage {
            ImageStorage::Owned(alloc) => (alloc.ptr, alloc.size),
            ImageStorage::Aliased(buf) => {
                let backing = self.buffers.get(&buf.raw())?;
                (backing.ptr(), cell.desc.byte_len().min(backing.size()))
            }
        };
        Some(unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec())
    }
}

pub struct SoftwareDevice {
    inner: Mutex<Inner>,
}

// Raw pointers in the tables refer to heap allocations owned by the tables
// themselves; every access goes through the mutex.
unsafe impl Send for SoftwareDevice {}
unsafe impl Sync for SoftwareDevice {}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareDevice {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Issues a kernel handle, standing in for the program/kernel layer.
    pub fn register_kernel(&self) -> KernelHandle {
        let mut inner = self.inner.lock();
        let id = inner.fresh_id();
        inner.kernel_args.insert(id, HashMap::new());
        KernelHandle::from_raw(id)
    }

    /// Memory bound to a kernel argument slot, if any.
    #[must_use]
    pub fn kernel_arg(&self, kernel: KernelHandle, index: u32) -> Option<MemHandle> {
        let inner = self.inner.lock();
        inner.kernel_args.get(&kernel.raw())?.get(&index).copied()
    }

    /// Snapshot of an image's bytes. Aliased images read through to the
    /// linked buffer.
    #[must_use]
    pub fn image_bytes(&self, img: ImageHandle) -> Option<Vec<u8>> {
        self.inner.lock().image_bytes_locked(img.raw())
    }

    /// Whether the image is a view over a buffer rather than its own storage.
    #[must_use]
    pub fn image_aliases_buffer(&self, img: ImageHandle) -> bool {
        matches!(
            self.inner.lock().images.get(&img.raw()),
            Some(ImageCell {
                storage: ImageStorage::Aliased(_),
                ..
            })
        )
    }

    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    #[must_use]
    pub fn live_images(&self) -> usize {
        self.inner.lock().images.len()
    }

    #[must_use]
    pub fn live_svm_allocs(&self) -> usize {
        self.inner.lock().svm.len()
    }

    pub fn fail_next_buffer_create(&self) {
        self.inner.lock().faults.fail_next_buffer_create = true;
    }

    pub fn fail_next_map(&self) {
        self.inner.lock().faults.fail_next_map = true;
    }

    /// Makes the next blocking map return an address different from the
    /// buffer's backing, to drive the map-mismatch path.
    pub fn shift_next_map(&self) {
        self.inner.lock().faults.shift_next_map = true;
    }

    pub fn fail_next_image_release(&self) {
        self.inner.lock().faults.fail_next_image_release = true;
    }
}

impl DeviceOps for SoftwareDevice {
    fn create_buffer(&self, _access: AccessMode, size: usize) -> DeviceStatus<BufferHandle> {
        let mut inner = self.inner.lock();
        if inner.faults.fail_next_buffer_create {
            inner.faults.fail_next_buffer_create = false;
            return Err(STATUS_MEM_OBJECT_ALLOCATION_FAILURE);
        }
        let alloc = HostAlloc::new(size).ok_or(STATUS_MEM_OBJECT_ALLOCATION_FAILURE)?;
        let id = inner.fresh_id();
        inner.buffers.insert(id, Backing::Owned(alloc));
        Ok(BufferHandle::from_raw(id))
    }

    fn create_buffer_from_host(
        &self,
        _access: AccessMode,
        size: usize,
        host: *mut u8,
    ) -> DeviceStatus<BufferHandle> {
        let mut inner = self.inner.lock();
        if inner.faults.fail_next_buffer_create {
            inner.faults.fail_next_buffer_create = false;
            return Err(STATUS_MEM_OBJECT_ALLOCATION_FAILURE);
        }
        if host.is_null() {
            return Err(STATUS_INVALID_VALUE);
        }
        let id = inner.fresh_id();
        inner
            .buffers
            .insert(id, Backing::Foreign { ptr: host, size });
        Ok(BufferHandle::from_raw(id))
    }

    fn release_buffer(&self, buf: BufferHandle) -> DeviceStatus<()> {
        self.inner
            .lock()
            .buffers
            .remove(&buf.raw())
            .map(|_| ())
            .ok_or(STATUS_INVALID_MEM_OBJECT)
    }

    fn svm_alloc(&self, _tier: SvmTier, _access: AccessMode, size: usize) -> *mut u8 {
        let Some(alloc) = HostAlloc::new(size) else {
            return ptr::null_mut();
        };
        let addr = alloc.ptr;
        self.inner.lock().svm.insert(addr as usize, alloc);
        addr
    }

    fn svm_free(&self, ptr: *mut u8) {
        self.inner.lock().svm.remove(&(ptr as usize));
    }

    fn svm_map(&self, ptr: *mut u8, size: usize, _flags: MapFlags) -> DeviceStatus<()> {
        let inner = self.inner.lock();
        match inner.svm.get(&(ptr as usize)) {
            Some(alloc) if size <= alloc.size => Ok(()),
            _ => Err(STATUS_INVALID_VALUE),
        }
    }

    fn svm_unmap(&self, ptr: *mut u8) -> DeviceStatus<()> {
        if self.inner.lock().svm.contains_key(&(ptr as usize)) {
            Ok(())
        } else {
            Err(STATUS_INVALID_VALUE)
        }
    }

    fn map_buffer(
        &self,
        buf: BufferHandle,
        _flags: MapFlags,
        _size: usize,
    ) -> DeviceStatus<*mut u8> {
        let mut inner = self.inner.lock();
        if inner.faults.fail_next_map {
            inner.faults.fail_next_map = false;
            return Err(STATUS_MAP_FAILURE);
        }
        let shifted = std::mem::take(&mut inner.faults.shift_next_map);
        let backing = inner
            .buffers
            .get(&buf.raw())
            .ok_or(STATUS_INVALID_MEM_OBJECT)?;
        let ptr = backing.ptr();
        Ok(if shifted {
            ptr.wrapping_add(PAGE_SIZE)
        } else {
            ptr
        })
    }

    fn unmap_buffer(&self, buf: BufferHandle, _ptr: *mut u8) -> DeviceStatus<()> {
        if self.inner.lock().buffers.contains_key(&buf.raw()) {
            Ok(())
        } else {
            Err(STATUS_INVALID_MEM_OBJECT)
        }
    }

    fn create_image(
        &self,
        _access: AccessMode,
        desc: &ImageDesc,
        link: Option<BufferHandle>,
    ) -> DeviceStatus<ImageHandle> {
        let mut inner = self.inner.lock();
        let storage = match link {
            Some(buf) => {
                if !inner.buffers.contains_key(&buf.raw()) {
                    return Err(STATUS_INVALID_MEM_OBJECT);
                }
                ImageStorage::Aliased(buf)
            }
            None => ImageStorage::Owned(
                HostAlloc::new(desc.byte_len()).ok_or(STATUS_MEM_OBJECT_ALLOCATION_FAILURE)?,
            ),
        };
        let id = inner.fresh_id();
        inner.images.insert(id, ImageCell { desc: *desc, storage });
        Ok(ImageHandle::from_raw(id))
    }

    fn release_image(&self, img: ImageHandle) -> DeviceStatus<()> {
        let mut inner = self.inner.lock();
        let removed = inner.images.remove(&img.raw());
        if removed.is_none() {
            return Err(STATUS_INVALID_MEM_OBJECT);
        }
        if inner.faults.fail_next_image_release {
            inner.faults.fail_next_image_release = false;
            return Err(STATUS_OUT_OF_RESOURCES);
        }
        Ok(())
    }

    fn image_region(&self, img: ImageHandle) -> DeviceStatus<[usize; 3]> {
        let inner = self.inner.lock();
        let cell = inner.images.get(&img.raw()).ok_or(STATUS_INVALID_MEM_OBJECT)?;
        Ok([
            cell.desc.width,
            cell.desc.height.max(1),
            cell.desc.depth.max(1),
        ])
    }

    fn copy_buffer_to_image(&self, buf: BufferHandle, img: ImageHandle) -> DeviceStatus<()> {
        let inner = self.inner.lock();
        let backing = inner
            .buffers
            .get(&buf.raw())
            .ok_or(STATUS_INVALID_MEM_OBJECT)?;
        let cell = inner.images.get(&img.raw()).ok_or(STATUS_INVALID_MEM_OBJECT)?;
        match &cell.storage {
            // Same bytes already; nothing to transfer.
            ImageStorage::Aliased(_) => Ok(()),
            ImageStorage::Owned(alloc) => {
                let n = backing.size().min(alloc.size);
                unsafe { ptr::copy_nonoverlapping(backing.ptr(), alloc.ptr, n) };
                Ok(())
            }
        }
    }

    fn copy_image_to_buffer(&self, img: ImageHandle, buf: BufferHandle) -> DeviceStatus<()> {
        let inner = self.inner.lock();
        let backing = inner
            .buffers
            .get(&buf.raw())
            .ok_or(STATUS_INVALID_MEM_OBJECT)?;
        let cell = inner.images.get(&img.raw()).ok_or(STATUS_INVALID_MEM_OBJECT)?;
        match &cell.storage {
            ImageStorage::Aliased(_) => Ok(()),
            ImageStorage::Owned(alloc) => {
                let n = backing.size().min(alloc.size);
                unsafe { ptr::copy_nonoverlapping(alloc.ptr, backing.ptr(), n) };
                Ok(())
            }
        }
    }

    fn set_kernel_arg(
        &self,
        kernel: KernelHandle,
        index: u32,
        mem: MemHandle,
    ) -> DeviceStatus<()> {
        let mut inner = self.inner.lock();
        let args = inner
            .kernel_args
            .get_mut(&kernel.raw())
            .ok_or(STATUS_INVALID_KERNEL)?;
        args.insert(index, mem);
        Ok(())
    }
}
