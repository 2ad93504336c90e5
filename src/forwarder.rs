//! Forwarding to the real, un-intercepted allocation entry points
//!
//! When a call arrives outside a region it must reach the runtime's own
//! `aclrtMallocAlign32` / `aclrtFree` unchanged. In preload mode this library
//! shadows those symbols, so the real ones are looked up with
//! `dlsym(RTLD_NEXT, ..)`. Each symbol is resolved at most once; concurrent
//! first calls block on the same `OnceCell` initializer instead of racing.

use std::ffi::{c_void, CStr};

use once_cell::sync::OnceCell;

use crate::debug_log;
use crate::error::{SaverError, SaverResult};

/// `aclrtMallocAlign32(void **devPtr, size_t size, aclrtMemMallocPolicy policy)`
pub type MallocFn = unsafe extern "C" fn(*mut *mut c_void, usize, u32) -> i32;

/// `aclrtFree(void *devPtr)`
pub type FreeFn = unsafe extern "C" fn(*mut c_void) -> i32;

pub const MALLOC_SYMBOL: &CStr = c"aclrtMallocAlign32";
pub const FREE_SYMBOL: &CStr = c"aclrtFree";

/// Looks up the address of a driver entry point
pub trait SymbolResolver: Send + Sync {
    fn resolve(&self, symbol: &CStr) -> SaverResult<*mut c_void>;
}

/// Resolves symbols in the objects loaded after this one (`RTLD_NEXT`)
#[derive(Debug, Default, Clone, Copy)]
pub struct NextObjectResolver;

impl SymbolResolver for NextObjectResolver {
    fn resolve(&self, symbol: &CStr) -> SaverResult<*mut c_void> {
        let address = unsafe { libc::dlsym(libc::RTLD_NEXT, symbol.as_ptr()) };
        if address.is_null() {
            let reason = unsafe {
                let err = libc::dlerror();
                if err.is_null() {
                    String::from("symbol not found")
                } else {
                    CStr::from_ptr(err).to_string_lossy().into_owned()
                }
            };
            return Err(SaverError::SymbolResolution {
                symbol: symbol.to_string_lossy().into_owned(),
                reason,
            });
        }
        Ok(address)
    }
}

/// Calls the real allocation entry points, resolving each on first use
pub struct ApiForwarder<R: SymbolResolver = NextObjectResolver> {
    resolver: R,
    real_malloc: OnceCell<MallocFn>,
    real_free: OnceCell<FreeFn>,
}

impl Default for ApiForwarder<NextObjectResolver> {
    fn default() -> Self {
        Self::new(NextObjectResolver)
    }
}

impl<R: SymbolResolver> ApiForwarder<R> {
    pub fn new(resolver: R) -> Self {
        ApiForwarder {
            resolver,
            real_malloc: OnceCell::new(),
            real_free: OnceCell::new(),
        }
    }

    fn malloc_fn(&self) -> SaverResult<MallocFn> {
        self.real_malloc
            .get_or_try_init(|| {
                let address = self.resolver.resolve(MALLOC_SYMBOL)?;
                tracing::debug!("resolved {:?} at {:?}", MALLOC_SYMBOL, address);
                // SAFETY: the resolved symbol is the runtime's aclrtMallocAlign32
                Ok(unsafe { std::mem::transmute::<*mut c_void, MallocFn>(address) })
            })
            .copied()
    }

    fn free_fn(&self) -> SaverResult<FreeFn> {
        self.real_free
            .get_or_try_init(|| {
                let address = self.resolver.resolve(FREE_SYMBOL)?;
                tracing::debug!("resolved {:?} at {:?}", FREE_SYMBOL, address);
                // SAFETY: the resolved symbol is the runtime's aclrtFree
                Ok(unsafe { std::mem::transmute::<*mut c_void, FreeFn>(address) })
            })
            .copied()
    }

    /// Whether both entry points have been resolved
    pub fn is_resolved(&self) -> bool {
        self.real_malloc.get().is_some() && self.real_free.get().is_some()
    }

    /// Forward to the real `aclrtMallocAlign32`.
    ///
    /// Returns the driver's status unchanged. `Err` only when the symbol
    /// cannot be resolved.
    ///
    /// # Safety
    /// `ptr` must be valid for a pointer-sized write, as for the real call.
    pub unsafe fn malloc(
        &self,
        ptr: *mut *mut c_void,
        size: usize,
        policy: u32,
    ) -> SaverResult<i32> {
        let real = self.malloc_fn()?;
        let ret = real(ptr, size, policy);
        debug_log!(
            "aclrtMallocAlign32 [MODE NORMAL] ptr={:?} *ptr={:?} size={} ret={}",
            ptr,
            if ptr.is_null() { std::ptr::null_mut() } else { *ptr },
            size,
            ret
        );
        Ok(ret)
    }

    /// Forward to the real `aclrtFree`.
    ///
    /// # Safety
    /// `ptr` must satisfy the real call's contract.
    pub unsafe fn free(&self, ptr: *mut c_void) -> SaverResult<i32> {
        let real = self.free_fn()?;
        let ret = real(ptr);
        debug_log!("aclrtFree [MODE NORMAL] ptr={:?} ret={}", ptr, ret);
        Ok(ret)
    }
}
