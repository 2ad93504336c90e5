//! Entry point dispatcher
//!
//! [`MemorySaver`] is the service object behind every entry point. Each
//! allocation call is routed on the calling thread's region flag: inside a
//! region it goes to the [`AllocationRegistry`], outside it goes unchanged to
//! the real driver through the [`ApiForwarder`].

use std::ffi::c_void;
use std::sync::Arc;

use crate::allocator::{AllocationRegistry, BatchReport, TagFilter};
use crate::backend::{DeviceDriver, DevicePtr, ACL_SUCCESS};
use crate::config::SaverConfig;
use crate::debug_log;
use crate::error::{SaverError, SaverResult};
use crate::forwarder::{ApiForwarder, NextObjectResolver, SymbolResolver};
use crate::region;

/// Routes allocation calls and runs pause/resume batches
pub struct MemorySaver<D: DeviceDriver, R: SymbolResolver = NextObjectResolver> {
    registry: AllocationRegistry<D>,
    forwarder: ApiForwarder<R>,
}

impl<D: DeviceDriver> MemorySaver<D> {
    /// Saver that forwards non-region calls to the next loaded `libascendcl`
    pub fn new(driver: Arc<D>, config: SaverConfig) -> Self {
        Self::with_forwarder(driver, config, ApiForwarder::default())
    }
}

impl<D: DeviceDriver, R: SymbolResolver> MemorySaver<D, R> {
    pub fn with_forwarder(driver: Arc<D>, config: SaverConfig, forwarder: ApiForwarder<R>) -> Self {
        MemorySaver {
            registry: AllocationRegistry::new(driver, config),
            forwarder,
        }
    }

    pub fn registry(&self) -> &AllocationRegistry<D> {
        &self.registry
    }

    pub fn forwarder(&self) -> &ApiForwarder<R> {
        &self.forwarder
    }

    /// `aclrtMallocAlign32` semantics.
    ///
    /// Inside a region the allocation is virtualized on the current device
    /// and `ACL_SUCCESS` is returned; outside, the real call's status comes
    /// back unchanged.
    ///
    /// # Safety
    /// `out` must be valid for a pointer-sized write.
    pub unsafe fn allocate(
        &self,
        out: *mut *mut c_void,
        size: usize,
        policy: u32,
    ) -> SaverResult<i32> {
        if !region::region_active() {
            return self.forwarder.malloc(out, size, policy);
        }
        if out.is_null() {
            return Err(SaverError::NullArgument("devPtr"));
        }

        let device = self.registry.driver().current_device()?;
        let config = region::current();
        let ptr = self
            .registry
            .malloc(device, size, &config.tag, config.backup_enabled)?;
        *out = ptr.as_ptr();
        Ok(ACL_SUCCESS)
    }

    /// `aclrtFree` semantics.
    ///
    /// # Safety
    /// Outside a region `ptr` must satisfy the real call's contract.
    pub unsafe fn release(&self, ptr: *mut c_void) -> SaverResult<i32> {
        if !region::region_active() {
            return self.forwarder.free(ptr);
        }
        self.registry.free(DevicePtr::from_ptr(ptr))?;
        Ok(ACL_SUCCESS)
    }

    /// Framework pluggable-allocator malloc. Only valid inside a region.
    pub fn framework_allocate(
        &self,
        size: isize,
        device: i32,
        stream: *mut c_void,
    ) -> SaverResult<DevicePtr> {
        debug_log!("tms_torch_malloc size={} device={} stream={:?}", size, device, stream);
        if !region::region_active() {
            return Err(SaverError::OutsideRegion("tms_torch_malloc"));
        }
        let size = usize::try_from(size).map_err(|_| {
            SaverError::InvalidArgument(format!("negative allocation size {}", size))
        })?;

        let config = region::current();
        self.registry
            .malloc(device, size, &config.tag, config.backup_enabled)
    }

    /// Framework pluggable-allocator free. Only valid inside a region.
    pub fn framework_release(
        &self,
        ptr: DevicePtr,
        size: isize,
        device: i32,
        stream: *mut c_void,
    ) -> SaverResult<()> {
        debug_log!(
            "tms_torch_free ptr={} size={} device={} stream={:?}",
            ptr,
            size,
            device,
            stream
        );
        if !region::region_active() {
            return Err(SaverError::OutsideRegion("tms_torch_free"));
        }
        self.registry.free(ptr)
    }

    /// Pause every allocation whose tag matches; `None` or `""` means all
    pub fn pause(&self, tag: Option<&str>) -> SaverResult<BatchReport> {
        self.registry.pause(TagFilter::from_option(tag))
    }

    /// Resume every allocation whose tag matches; `None` or `""` means all
    pub fn resume(&self, tag: Option<&str>) -> SaverResult<BatchReport> {
        self.registry.resume(TagFilter::from_option(tag))
    }
}

impl<D: DeviceDriver, R: SymbolResolver> std::fmt::Debug for MemorySaver<D, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySaver")
            .field("registry", &self.registry)
            .field("forwarder_resolved", &self.forwarder.is_resolved())
            .finish()
    }
}
