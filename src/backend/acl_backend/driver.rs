//! Device driver contract
//!
//! The allocator never talks to the runtime directly. Everything it needs
//! from the driver goes through [`DeviceDriver`], which mirrors the ACL
//! virtual memory API one call per method. `AclDriver` binds the real
//! runtime; `SimulatedDriver` backs device memory with host buffers.

use crate::backend::acl_backend::error::AclResult;
use crate::backend::acl_backend::types::{DevicePtr, HostPtr, MemoryAttr, PhysicalHandle};

/// Calls the allocator makes into the device runtime.
///
/// Implementations must be callable from any thread. The registry never holds
/// its lock while calling into the driver, so calls for unrelated addresses
/// may run concurrently.
pub trait DeviceDriver: Send + Sync {
    /// Device bound to the calling thread's context (`aclrtGetDevice`)
    fn current_device(&self) -> AclResult<i32>;

    /// Reserve `size` bytes of device virtual address space
    fn reserve_address(&self, size: usize) -> AclResult<DevicePtr>;

    /// Release a reservation made by [`DeviceDriver::reserve_address`]
    fn release_address(&self, ptr: DevicePtr) -> AclResult<()>;

    /// Create `size` bytes of physical memory on `device`
    fn create_physical(
        &self,
        size: usize,
        device: i32,
        attr: MemoryAttr,
    ) -> AclResult<PhysicalHandle>;

    /// Release physical memory. The handle must no longer be mapped.
    fn free_physical(&self, handle: PhysicalHandle) -> AclResult<()>;

    /// Map `handle` at the start of the reserved range `ptr`
    fn map(&self, ptr: DevicePtr, size: usize, handle: PhysicalHandle) -> AclResult<()>;

    /// Unmap whatever backing is mapped at `ptr`
    fn unmap(&self, ptr: DevicePtr) -> AclResult<()>;

    /// Allocate pinned host memory
    fn alloc_host(&self, size: usize) -> AclResult<HostPtr>;

    /// Free pinned host memory
    fn free_host(&self, host: HostPtr) -> AclResult<()>;

    /// Synchronous device-to-host copy
    fn copy_to_host(&self, dst: HostPtr, src: DevicePtr, size: usize) -> AclResult<()>;

    /// Synchronous host-to-device copy
    fn copy_to_device(&self, dst: DevicePtr, src: HostPtr, size: usize) -> AclResult<()>;
}
