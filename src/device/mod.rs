//! Seams to the external device layer: the capability descriptor, opaque
//! memory handles, run parameters, and the [`DeviceOps`] trait a backend
//! implements. The memory core borrows the device queue/context through
//! `DeviceOps` and never owns it.

pub mod software;

use std::fmt;

use crate::memory::{AccessMode, SvmTier};

pub use software::SoftwareDevice;

// Native status codes follow the OpenCL numbering so real backends can pass
// their cl_int through unchanged.
pub const STATUS_MEM_OBJECT_ALLOCATION_FAILURE: i32 = -4;
pub const STATUS_OUT_OF_RESOURCES: i32 = -5;
pub const STATUS_MAP_FAILURE: i32 = -12;
pub const STATUS_INVALID_VALUE: i32 = -30;
pub const STATUS_INVALID_MEM_OBJECT: i32 = -38;
pub const STATUS_INVALID_KERNEL: i32 = -48;

/// Result of a raw device call: the payload or the native status code.
pub type DeviceStatus<T> = Result<T, i32>;

/// Platform version of a device, e.g. the `1.2` in `"OpenCL 1.2 CUDA"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClVersion {
    pub major: u32,
    pub minor: u32,
}

impl ClVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parses a `CL_DEVICE_VERSION` string of the form
    /// `"OpenCL <major>.<minor> <vendor-specific>"`.
    #[must_use]
    pub fn parse(device_version: &str) -> Option<Self> {
        let rest = device_version.strip_prefix("OpenCL ")?;
        let number = rest.split_whitespace().next()?;
        let (major, minor) = number.split_once('.')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }
}

impl fmt::Display for ClVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Raw shared-virtual-memory capability word as reported by the device.
/// Devices that reject the query report zero capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SvmCapabilities(u64);

impl SvmCapabilities {
    pub const COARSE_GRAIN_BUFFER: u64 = 1 << 0;
    pub const FINE_GRAIN_BUFFER: u64 = 1 << 1;
    pub const FINE_GRAIN_SYSTEM: u64 = 1 << 2;
    pub const ATOMICS: u64 = 1 << 3;

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn coarse_grain_buffer(self) -> bool {
        self.0 & Self::COARSE_GRAIN_BUFFER != 0
    }

    #[must_use]
    pub const fn fine_grain_buffer(self) -> bool {
        self.0 & Self::FINE_GRAIN_BUFFER != 0
    }

    /// Highest shared-memory tier this capability word allows.
    #[must_use]
    pub const fn best_tier(self) -> SvmTier {
        if self.fine_grain_buffer() {
            SvmTier::Fine
        } else if self.coarse_grain_buffer() {
            SvmTier::Coarse
        } else {
            SvmTier::None
        }
    }
}

/// Immutable capability descriptor for the device backing a region.
/// Owned by the context layer; regions hold a copy of this small struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    pub version: ClVersion,
    pub svm: SvmCapabilities,
}

impl DeviceCaps {
    /// Version from which buffer and image objects may alias the same
    /// storage (unified memory objects).
    pub const UNIFIED_MEMORY_OBJECTS: ClVersion = ClVersion::new(2, 0);

    #[must_use]
    pub const fn new(version: ClVersion, svm: SvmCapabilities) -> Self {
        Self { version, svm }
    }

    /// Single threshold check shared by host-access re-entry and
    /// representation conversion.
    #[must_use]
    pub fn supports_unified_memory_objects(&self) -> bool {
        self.version >= Self::UNIFIED_MEMORY_OBJECTS
    }
}

/// Opaque handle to a linear device buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(u64);

/// Opaque handle to a multi-dimensional device image object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(u64);

/// Opaque handle to a compiled kernel, issued by the program layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(u64);

impl BufferHandle {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl ImageHandle {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl KernelHandle {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Device memory in whichever shape a kernel argument expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemHandle {
    Buffer(BufferHandle),
    Image(ImageHandle),
}

/// Mapping flags for a blocking host map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapFlags {
    Read,
    Write,
    ReadWrite,
    /// Write access where prior content may be discarded.
    WriteInvalidate,
}

impl MapFlags {
    /// Flags for an explicit host-access request.
    #[must_use]
    pub const fn from_direction(direction: AccessMode) -> Self {
        match direction {
            AccessMode::ReadOnly => Self::Read,
            AccessMode::WriteOnly => Self::Write,
            AccessMode::ReadWrite => Self::ReadWrite,
        }
    }

    /// Flags for the initial map right after a tier-None allocation.
    /// A read-only consumer is about to write input, a write-only consumer
    /// will only ever read results back.
    #[must_use]
    pub const fn initial_for(access: AccessMode) -> Self {
        match access {
            AccessMode::ReadOnly => Self::WriteInvalidate,
            AccessMode::WriteOnly => Self::Read,
            AccessMode::ReadWrite => Self::ReadWrite,
        }
    }
}

/// Work-dimension view of one kernel run, used to size on-demand images.
#[derive(Debug, Clone)]
pub struct RunParams {
    global_work: Vec<usize>,
}

impl RunParams {
    #[must_use]
    pub fn new(global_work: impl Into<Vec<usize>>) -> Self {
        Self {
            global_work: global_work.into(),
        }
    }

    #[must_use]
    pub fn num_dims(&self) -> usize {
        self.global_work.len()
    }

    #[must_use]
    pub fn global_work_items(&self) -> &[usize] {
        &self.global_work
    }
}

/// Shape of an on-demand image. A zero height or depth means the dimension
/// is absent; the pixel format is fixed at 4-channel f32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl ImageDesc {
    pub const BYTES_PER_PIXEL: usize = 16; // RGBA, f32 per channel

    /// Builds a descriptor from the global work items, one per dimension.
    /// Returns `None` when no work dimensions were supplied.
    #[must_use]
    pub fn from_work_dims(run: &RunParams) -> Option<Self> {
        let (&width, rest) = run.global_work_items().split_first()?;
        Some(Self {
            width,
            height: rest.first().copied().unwrap_or(0),
            depth: rest.get(1).copied().unwrap_or(0),
        })
    }

    #[must_use]
    pub const fn is_3d(&self) -> bool {
        self.depth > 0
    }

    #[must_use]
    pub const fn byte_len(&self) -> usize {
        let height = if self.height == 0 { 1 } else { self.height };
        let depth = if self.depth == 0 { 1 } else { self.depth };
        self.width * height * depth * Self::BYTES_PER_PIXEL
    }
}

/// Raw operations a backend provides on the shared device queue/context.
///
/// All calls are blocking with respect to the queue: when a call returns,
/// its transfer or release has completed. Fallible calls surface the native
/// status code; the memory core wraps it into its own error taxonomy.
pub trait DeviceOps: Send + Sync {
    /// Creates a buffer with host-accessible backing requested at
    /// allocation time.
    fn create_buffer(&self, access: AccessMode, size: usize) -> DeviceStatus<BufferHandle>;

    /// Creates a buffer wrapping an existing shared allocation
    /// (use-host-pointer semantics), so kernels reach the same bytes.
    fn create_buffer_from_host(
        &self,
        access: AccessMode,
        size: usize,
        host: *mut u8,
    ) -> DeviceStatus<BufferHandle>;

    fn release_buffer(&self, buf: BufferHandle) -> DeviceStatus<()>;

    /// Shared-memory allocation visible to host and device without a copy.
    /// Returns null on failure.
    fn svm_alloc(&self, tier: SvmTier, access: AccessMode, size: usize) -> *mut u8;

    fn svm_free(&self, ptr: *mut u8);

    fn svm_map(&self, ptr: *mut u8, size: usize, flags: MapFlags) -> DeviceStatus<()>;

    fn svm_unmap(&self, ptr: *mut u8) -> DeviceStatus<()>;

    /// Blocking map of a buffer object; returns the host address.
    fn map_buffer(&self, buf: BufferHandle, flags: MapFlags, size: usize)
    -> DeviceStatus<*mut u8>;

    fn unmap_buffer(&self, buf: BufferHandle, ptr: *mut u8) -> DeviceStatus<()>;

    /// Creates an image. With `link`, the image is a view aliasing the given
    /// buffer's storage instead of a fresh allocation.
    fn create_image(
        &self,
        access: AccessMode,
        desc: &ImageDesc,
        link: Option<BufferHandle>,
    ) -> DeviceStatus<ImageHandle>;

    fn release_image(&self, img: ImageHandle) -> DeviceStatus<()>;

    /// Width/height/depth of a live image, for sizing copies back out of it.
    fn image_region(&self, img: ImageHandle) -> DeviceStatus<[usize; 3]>;

    fn copy_buffer_to_image(&self, buf: BufferHandle, img: ImageHandle) -> DeviceStatus<()>;

    fn copy_image_to_buffer(&self, img: ImageHandle, buf: BufferHandle) -> DeviceStatus<()>;

    /// Binds device memory to a kernel's indexed argument slot.
    fn set_kernel_arg(&self, kernel: KernelHandle, index: u32, mem: MemHandle)
    -> DeviceStatus<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parse_plain() {
        let v = ClVersion::parse("OpenCL 1.2 CUDA").unwrap();
        assert_eq!(v, ClVersion::new(1, 2));
    }

    #[test]
    fn version_parse_no_vendor_suffix() {
        let v = ClVersion::parse("OpenCL 3.0").unwrap();
        assert_eq!(v, ClVersion::new(3, 0));
    }

    #[test]
    fn version_parse_rejects_garbage() {
        assert!(ClVersion::parse("Vulkan 1.3").is_none());
        assert!(ClVersion::parse("OpenCL x.y").is_none());
        assert!(ClVersion::parse("").is_none());
    }

    #[test]
    fn version_ordering() {
        assert!(ClVersion::new(1, 2) < ClVersion::new(2, 0));
        assert!(ClVersion::new(2, 1) > ClVersion::new(2, 0));
        assert!(ClVersion::new(10, 0) > ClVersion::new(2, 9));
    }

    #[test]
    fn unified_memory_threshold() {
        let pre = DeviceCaps::new(ClVersion::new(1, 2), SvmCapabilities::default());
        let at = DeviceCaps::new(ClVersion::new(2, 0), SvmCapabilities::default());
        let above = DeviceCaps::new(ClVersion::new(3, 0), SvmCapabilities::default());
        assert!(!pre.supports_unified_memory_objects());
        assert!(at.supports_unified_memory_objects());
        assert!(above.supports_unified_memory_objects());
    }

    #[test]
    fn svm_caps_best_tier() {
        assert_eq!(SvmCapabilities::from_raw(0).best_tier(), SvmTier::None);
        assert_eq!(
            SvmCapabilities::from_raw(SvmCapabilities::COARSE_GRAIN_BUFFER).best_tier(),
            SvmTier::Coarse
        );
        assert_eq!(
            SvmCapabilities::from_raw(
                SvmCapabilities::COARSE_GRAIN_BUFFER | SvmCapabilities::FINE_GRAIN_BUFFER
            )
            .best_tier(),
            SvmTier::Fine
        );
    }

    #[test]
    fn image_desc_2d_from_two_dims() {
        let run = RunParams::new([64usize, 32]);
        let desc = ImageDesc::from_work_dims(&run).unwrap();
        assert_eq!((desc.width, desc.height, desc.depth), (64, 32, 0));
        assert!(!desc.is_3d());
        assert_eq!(desc.byte_len(), 64 * 32 * 16);
    }

    #[test]
    fn image_desc_3d_from_three_dims() {
        let run = RunParams::new([16usize, 8, 4]);
        let desc = ImageDesc::from_work_dims(&run).unwrap();
        assert!(desc.is_3d());
        assert_eq!(desc.byte_len(), 16 * 8 * 4 * 16);
    }

    #[test]
    fn image_desc_rejects_zero_dims() {
        let run = RunParams::new(Vec::new());
        assert!(ImageDesc::from_work_dims(&run).is_none());
    }

    #[test]
    fn map_flags_for_initial_map() {
        assert_eq!(
            MapFlags::initial_for(AccessMode::ReadOnly),
            MapFlags::WriteInvalidate
        );
        assert_eq!(MapFlags::initial_for(AccessMode::WriteOnly), MapFlags::Read);
        assert_eq!(
            MapFlags::initial_for(AccessMode::ReadWrite),
            MapFlags::ReadWrite
        );
    }
}
