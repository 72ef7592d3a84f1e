//! The memory core: regions, leases, and their access/tier vocabulary.

pub mod lease;
pub mod region;

pub use lease::DeviceLease;
pub use region::MemoryRegion;

/// Access direction of a region or of one kernel argument binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Shared-virtual-memory tier the region was allocated under.
///
/// `Fine` is coherent without explicit mapping, `Coarse` shares a pointer but
/// needs map/unmap around host access, `None` uses separate allocations with
/// an explicit blocking map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SvmTier {
    None,
    Coarse,
    Fine,
}

impl SvmTier {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Coarse => "coarse",
            Self::Fine => "fine",
        }
    }
}

/// Immutable parameters of one region allocation.
#[derive(Debug, Clone, Copy)]
pub struct RegionConfig {
    pub size_bytes: usize,
    pub access: AccessMode,
    pub tier: SvmTier,
}
