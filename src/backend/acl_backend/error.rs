//! ACL error types

use thiserror::Error;

/// ACL driver error types
///
/// Every variant carries the failing call, the status code it returned and
/// the arguments it was called with.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AclError {
    #[error("Device query failed: {0}")]
    DeviceQueryFailed(String),
    #[error("Address reservation failed: {0}")]
    AddressReservationFailed(String),
    #[error("Address release failed: {0}")]
    AddressReleaseFailed(String),
    #[error("Physical allocation failed: {0}")]
    PhysicalAllocationFailed(String),
    #[error("Physical release failed: {0}")]
    PhysicalReleaseFailed(String),
    #[error("Memory map failed: {0}")]
    MapFailed(String),
    #[error("Memory unmap failed: {0}")]
    UnmapFailed(String),
    #[error("Host allocation failed: {0}")]
    HostAllocationFailed(String),
    #[error("Host release failed: {0}")]
    HostReleaseFailed(String),
    #[error("Memory copy failed: {0}")]
    MemoryCopyFailed(String),
}

/// ACL result type
pub type AclResult<T> = Result<T, AclError>;

impl AclError {
    /// Name of the driver call family that failed, for log fields
    pub fn call(&self) -> &'static str {
        match self {
            AclError::DeviceQueryFailed(_) => "aclrtGetDevice",
            AclError::AddressReservationFailed(_) => "aclrtReserveMemAddress",
            AclError::AddressReleaseFailed(_) => "aclrtReleaseMemAddress",
            AclError::PhysicalAllocationFailed(_) => "aclrtMallocPhysical",
            AclError::PhysicalReleaseFailed(_) => "aclrtFreePhysical",
            AclError::MapFailed(_) => "aclrtMapMem",
            AclError::UnmapFailed(_) => "aclrtUnmapMem",
            AclError::HostAllocationFailed(_) => "aclrtMallocHost",
            AclError::HostReleaseFailed(_) => "aclrtFreeHost",
            AclError::MemoryCopyFailed(_) => "aclrtMemcpy",
        }
    }
}
