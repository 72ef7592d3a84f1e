//! Host/device shared memory regions for compute accelerators.
//!
//! A [`memory::MemoryRegion`] owns one device-backed allocation and arbitrates
//! access to it: the same bytes are reachable either through a host mapping or,
//! while a [`memory::DeviceLease`] is outstanding, as a kernel argument in
//! buffer or image shape. The device itself is reached through the
//! [`device::DeviceOps`] seam; [`device::SoftwareDevice`] is an in-process
//! reference backend.

pub mod device;
pub mod diag;
pub mod error;
pub mod memory;

pub use error::{MemError, MemResult};
