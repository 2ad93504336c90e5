//! ACL runtime implementation of [`DeviceDriver`]

use std::ffi::{c_void, CStr};
use std::ptr;

use crate::backend::acl_backend::driver::DeviceDriver;
use crate::backend::acl_backend::error::{AclError, AclResult};
use crate::backend::acl_backend::ffi;
use crate::backend::acl_backend::types::{
    DevicePtr, HostPtr, MemoryAttr, PhysicalHandle, ACL_SUCCESS,
};

/// Last error message recorded by the runtime for this thread
pub fn recent_error_message() -> String {
    let msg = unsafe { ffi::aclGetRecentErrMsg() };
    if msg.is_null() {
        return String::from("<no message>");
    }
    unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
}

fn describe(call: &str, code: i32) -> String {
    format!(
        "{} failed with code {}: {}",
        call,
        code,
        recent_error_message()
    )
}

/// Driver bound to the Ascend ACL runtime.
///
/// Stateless: every method is a direct call into libascendcl, which keeps
/// its own per-thread device context.
#[derive(Debug, Default, Clone, Copy)]
pub struct AclDriver;

impl AclDriver {
    pub fn new() -> Self {
        AclDriver
    }
}

impl DeviceDriver for AclDriver {
    fn current_device(&self) -> AclResult<i32> {
        let mut device: i32 = -1;
        let result = unsafe { ffi::aclrtGetDevice(&mut device) };
        if result != ACL_SUCCESS {
            return Err(AclError::DeviceQueryFailed(describe(
                "aclrtGetDevice",
                result,
            )));
        }
        Ok(device)
    }

    fn reserve_address(&self, size: usize) -> AclResult<DevicePtr> {
        let mut vir_ptr: *mut c_void = ptr::null_mut();
        let result =
            unsafe { ffi::aclrtReserveMemAddress(&mut vir_ptr, size, 0, ptr::null_mut(), 0) };
        if result != ACL_SUCCESS {
            return Err(AclError::AddressReservationFailed(format!(
                "{} (size={})",
                describe("aclrtReserveMemAddress", result),
                size
            )));
        }
        if vir_ptr.is_null() {
            return Err(AclError::AddressReservationFailed(format!(
                "aclrtReserveMemAddress returned null pointer for {} bytes",
                size
            )));
        }
        Ok(DevicePtr::from_ptr(vir_ptr))
    }

    fn release_address(&self, ptr: DevicePtr) -> AclResult<()> {
        let result = unsafe { ffi::aclrtReleaseMemAddress(ptr.as_ptr()) };
        if result != ACL_SUCCESS {
            return Err(AclError::AddressReleaseFailed(format!(
                "{} (ptr={})",
                describe("aclrtReleaseMemAddress", result),
                ptr
            )));
        }
        Ok(())
    }

    fn create_physical(
        &self,
        size: usize,
        device: i32,
        attr: MemoryAttr,
    ) -> AclResult<PhysicalHandle> {
        let device_id = u32::try_from(device).map_err(|_| {
            AclError::PhysicalAllocationFailed(format!("invalid device id {}", device))
        })?;
        let prop = ffi::AclrtPhysicalMemProp {
            handle_type: ffi::ACL_MEM_HANDLE_TYPE_NONE,
            allocation_type: ffi::ACL_MEM_ALLOCATION_TYPE_PINNED,
            mem_attr: match attr {
                MemoryAttr::Huge => ffi::ACL_HBM_MEM_HUGE,
                MemoryAttr::Normal => ffi::ACL_HBM_MEM_NORMAL,
            },
            location: ffi::AclrtMemLocation {
                id: device_id,
                location_type: ffi::ACL_MEM_LOCATION_TYPE_DEVICE,
            },
            reserve: 0,
        };

        let mut handle: *mut c_void = ptr::null_mut();
        let result = unsafe { ffi::aclrtMallocPhysical(&mut handle, size, &prop, 0) };
        if result != ACL_SUCCESS {
            return Err(AclError::PhysicalAllocationFailed(format!(
                "{} (size={}, device={})",
                describe("aclrtMallocPhysical", result),
                size,
                device
            )));
        }
        Ok(PhysicalHandle::from_raw(handle as usize))
    }

    fn free_physical(&self, handle: PhysicalHandle) -> AclResult<()> {
        let result = unsafe { ffi::aclrtFreePhysical(handle.raw() as *mut c_void) };
        if result != ACL_SUCCESS {
            return Err(AclError::PhysicalReleaseFailed(format!(
                "{} (handle={:?})",
                describe("aclrtFreePhysical", result),
                handle
            )));
        }
        Ok(())
    }

    fn map(&self, ptr: DevicePtr, size: usize, handle: PhysicalHandle) -> AclResult<()> {
        let result =
            unsafe { ffi::aclrtMapMem(ptr.as_ptr(), size, 0, handle.raw() as *mut c_void, 0) };
        if result != ACL_SUCCESS {
            return Err(AclError::MapFailed(format!(
                "{} (ptr={}, size={}, handle={:?})",
                describe("aclrtMapMem", result),
                ptr,
                size,
                handle
            )));
        }
        Ok(())
    }

    fn unmap(&self, ptr: DevicePtr) -> AclResult<()> {
        let result = unsafe { ffi::aclrtUnmapMem(ptr.as_ptr()) };
        if result != ACL_SUCCESS {
            return Err(AclError::UnmapFailed(format!(
                "{} (ptr={})",
                describe("aclrtUnmapMem", result),
                ptr
            )));
        }
        Ok(())
    }

    fn alloc_host(&self, size: usize) -> AclResult<HostPtr> {
        let mut host: *mut c_void = ptr::null_mut();
        let result = unsafe { ffi::aclrtMallocHost(&mut host, size) };
        if result != ACL_SUCCESS {
            return Err(AclError::HostAllocationFailed(format!(
                "{} (size={})",
                describe("aclrtMallocHost", result),
                size
            )));
        }
        if host.is_null() {
            return Err(AclError::HostAllocationFailed(format!(
                "aclrtMallocHost returned null pointer for {} bytes",
                size
            )));
        }
        Ok(HostPtr::from_ptr(host))
    }

    fn free_host(&self, host: HostPtr) -> AclResult<()> {
        let result = unsafe { ffi::aclrtFreeHost(host.as_ptr()) };
        if result != ACL_SUCCESS {
            return Err(AclError::HostReleaseFailed(format!(
                "{} (host={:?})",
                describe("aclrtFreeHost", result),
                host
            )));
        }
        Ok(())
    }

    fn copy_to_host(&self, dst: HostPtr, src: DevicePtr, size: usize) -> AclResult<()> {
        let result = unsafe {
            ffi::aclrtMemcpy(
                dst.as_ptr(),
                size,
                src.as_ptr() as *const c_void,
                size,
                ffi::ACL_MEMCPY_DEVICE_TO_HOST,
            )
        };
        if result != ACL_SUCCESS {
            return Err(AclError::MemoryCopyFailed(format!(
                "{} D2H (src={}, size={})",
                describe("aclrtMemcpy", result),
                src,
                size
            )));
        }
        Ok(())
    }

    fn copy_to_device(&self, dst: DevicePtr, src: HostPtr, size: usize) -> AclResult<()> {
        let result = unsafe {
            ffi::aclrtMemcpy(
                dst.as_ptr(),
                size,
                src.as_ptr() as *const c_void,
                size,
                ffi::ACL_MEMCPY_HOST_TO_DEVICE,
            )
        };
        if result != ACL_SUCCESS {
            return Err(AclError::MemoryCopyFailed(format!(
                "{} H2D (dst={}, size={})",
                describe("aclrtMemcpy", result),
                dst,
                size
            )));
        }
        Ok(())
    }
}
