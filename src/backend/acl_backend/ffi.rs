//! ACL FFI bindings
//!
//! FFI declarations below are bound to the Ascend CANN runtime (libascendcl).
//! Only the virtual memory, host memory and device query calls the allocator
//! needs are declared. The intercepted entry points (`aclrtMallocAlign32`,
//! `aclrtFree`) are deliberately absent: they are reached through
//! `dlsym(RTLD_NEXT, ..)` in the forwarder.

use std::ffi::c_void;
use std::os::raw::c_char;

/// `aclrtPhysicalMemProp`
///
/// Layout follows acl_rt.h: three 32-bit enums, the location struct
/// (`uint32_t id` + 32-bit enum) and a trailing `uint64_t`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AclrtPhysicalMemProp {
    pub handle_type: u32,
    pub allocation_type: u32,
    pub mem_attr: u32,
    pub location: AclrtMemLocation,
    pub reserve: u64,
}

/// `aclrtMemLocation`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AclrtMemLocation {
    pub id: u32,
    pub location_type: u32,
}

#[link(name = "ascendcl")]
extern "C" {
    pub fn aclrtGetDevice(device_id: *mut i32) -> i32;
    pub fn aclrtReserveMemAddress(
        vir_ptr: *mut *mut c_void,
        size: usize,
        alignment: usize,
        expect_ptr: *mut c_void,
        flags: u64,
    ) -> i32;
    pub fn aclrtReleaseMemAddress(vir_ptr: *mut c_void) -> i32;
    pub fn aclrtMallocPhysical(
        handle: *mut *mut c_void,
        size: usize,
        prop: *const AclrtPhysicalMemProp,
        flags: u64,
    ) -> i32;
    pub fn aclrtFreePhysical(handle: *mut c_void) -> i32;
    pub fn aclrtMapMem(
        vir_ptr: *mut c_void,
        size: usize,
        offset: usize,
        handle: *mut c_void,
        flags: u64,
    ) -> i32;
    pub fn aclrtUnmapMem(vir_ptr: *mut c_void) -> i32;
    pub fn aclrtMallocHost(host_ptr: *mut *mut c_void, size: usize) -> i32;
    pub fn aclrtFreeHost(host_ptr: *mut c_void) -> i32;
    pub fn aclrtMemcpy(
        dst: *mut c_void,
        dest_max: usize,
        src: *const c_void,
        count: usize,
        kind: i32,
    ) -> i32;
    pub fn aclGetRecentErrMsg() -> *const c_char;
}

/// ACL memory copy kinds
pub const ACL_MEMCPY_HOST_TO_DEVICE: i32 = 1;
pub const ACL_MEMCPY_DEVICE_TO_HOST: i32 = 2;

/// `ACL_MEM_HANDLE_TYPE_NONE`
pub const ACL_MEM_HANDLE_TYPE_NONE: u32 = 0;
/// `ACL_MEM_ALLOCATION_TYPE_PINNED`
pub const ACL_MEM_ALLOCATION_TYPE_PINNED: u32 = 0;
/// `ACL_MEM_LOCATION_TYPE_DEVICE`
pub const ACL_MEM_LOCATION_TYPE_DEVICE: u32 = 1;
/// `ACL_HBM_MEM_HUGE`
pub const ACL_HBM_MEM_HUGE: u32 = 4;
/// `ACL_HBM_MEM_NORMAL`
pub const ACL_HBM_MEM_NORMAL: u32 = 5;
