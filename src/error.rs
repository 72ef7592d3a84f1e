use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemError {
    #[error("Allocation failed: {0}")]
    AllocationFailure(String),

    #[error("Host access requires the device lease to be released first")]
    AccessConflict,

    #[error("A device lease is already outstanding for this region")]
    AlreadyLeased,

    #[error("Mapped address {actual:#x} differs from original address {expected:#x}")]
    MapAddressMismatch { expected: usize, actual: usize },

    #[error("An image-shaped binding requires at least one work dimension")]
    InvalidDimensions,

    #[error("Device call `{op}` failed with status {code}")]
    DeviceOperationFailure { op: &'static str, code: i32 },
}

// A convenient alias
pub type MemResult<T> = Result<T, MemError>;
