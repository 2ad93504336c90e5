//! C ABI surface
//!
//! The exported functions keep the names and signatures the Python layer and
//! the preload shim expect. Every failure here is fatal: it is logged with
//! its source location and the process exits, because the callers have no
//! error channel.
//!
//! The process-wide [`MemorySaver`] is built on first use from the
//! environment, or installed up front with [`install`].

use std::ffi::{c_char, CStr};

use crate::error::{SaverError, SaverResult};

/// Owned tag from a required C string
///
/// # Safety
/// `tag` must be null or point to a NUL-terminated string.
pub unsafe fn tag_from_c(tag: *const c_char) -> SaverResult<String> {
    if tag.is_null() {
        return Err(SaverError::NullArgument("tag"));
    }
    CStr::from_ptr(tag)
        .to_str()
        .map(str::to_owned)
        .map_err(|e| SaverError::InvalidArgument(format!("tag is not valid UTF-8: {}", e)))
}

/// Tag filter from an optional C string; null selects every allocation
///
/// # Safety
/// `tag` must be null or point to a NUL-terminated string.
pub unsafe fn tag_filter_from_c(tag: *const c_char) -> SaverResult<Option<String>> {
    if tag.is_null() {
        return Ok(None);
    }
    tag_from_c(tag).map(Some)
}

#[cfg(feature = "ascend")]
pub use exports::*;

#[cfg(feature = "ascend")]
mod exports {
    use std::ffi::{c_char, c_void};
    use std::sync::Arc;

    use once_cell::sync::OnceCell;

    use super::{tag_filter_from_c, tag_from_c};
    use crate::backend::AclDriver;
    use crate::config::SaverConfig;
    use crate::error::{fatal, OrFatal, SaverError, SaverResult};
    use crate::logging::init_logging_default;
    use crate::region;
    use crate::saver::MemorySaver;

    static SAVER: OnceCell<MemorySaver<AclDriver>> = OnceCell::new();

    /// Install the process-wide saver before the first intercepted call.
    ///
    /// Fails if an instance already exists, whether installed or built lazily.
    pub fn install(config: SaverConfig) -> SaverResult<&'static MemorySaver<AclDriver>> {
        config.validate_environment()?;
        let mut installed = false;
        let saver = SAVER.get_or_init(|| {
            installed = true;
            MemorySaver::new(Arc::new(AclDriver::new()), config)
        });
        if !installed {
            return Err(SaverError::InvalidConfiguration(
                "memory saver is already initialized".to_string(),
            ));
        }
        Ok(saver)
    }

    /// The process-wide saver, built from the environment on first use
    pub fn instance() -> &'static MemorySaver<AclDriver> {
        SAVER.get_or_init(|| {
            init_logging_default();
            let config = SaverConfig::from_env().or_fatal();
            tracing::info!(memory_attr = ?config.memory_attr, "npu memory saver initialized");
            MemorySaver::new(Arc::new(AclDriver::new()), config)
        })
    }

    #[cfg(feature = "hook-preload")]
    #[no_mangle]
    #[allow(non_snake_case)]
    pub unsafe extern "C" fn aclrtMallocAlign32(
        dev_ptr: *mut *mut c_void,
        size: usize,
        policy: u32,
    ) -> i32 {
        instance().allocate(dev_ptr, size, policy).or_fatal()
    }

    #[cfg(feature = "hook-preload")]
    #[no_mangle]
    #[allow(non_snake_case)]
    pub unsafe extern "C" fn aclrtFree(dev_ptr: *mut c_void) -> i32 {
        instance().release(dev_ptr).or_fatal()
    }

    #[cfg(feature = "hook-torch")]
    #[no_mangle]
    pub extern "C" fn tms_torch_malloc(
        size: isize,
        device: i32,
        stream: *mut c_void,
    ) -> *mut c_void {
        instance()
            .framework_allocate(size, device, stream)
            .or_fatal()
            .as_ptr()
    }

    #[cfg(feature = "hook-torch")]
    #[no_mangle]
    pub extern "C" fn tms_torch_free(
        ptr: *mut c_void,
        size: isize,
        device: i32,
        stream: *mut c_void,
    ) {
        instance()
            .framework_release(crate::backend::DevicePtr::from_ptr(ptr), size, device, stream)
            .or_fatal()
    }

    #[no_mangle]
    pub extern "C" fn tms_set_interesting_region(is_interesting_region: bool) {
        region::set_region_active(is_interesting_region);
    }

    #[no_mangle]
    pub extern "C" fn tms_get_interesting_region() -> bool {
        region::region_active()
    }

    #[no_mangle]
    pub unsafe extern "C" fn tms_set_current_tag(tag: *const c_char) {
        match tag_from_c(tag) {
            Ok(tag) => region::set_tag(&tag),
            Err(err) => fatal(err),
        }
    }

    #[no_mangle]
    pub extern "C" fn tms_set_enable_cpu_backup(enable_cpu_backup: bool) {
        region::set_backup_policy(enable_cpu_backup);
    }

    #[no_mangle]
    pub unsafe extern "C" fn tms_pause(tag: *const c_char) {
        let tag = tag_filter_from_c(tag).or_fatal();
        instance().pause(tag.as_deref()).or_fatal();
    }

    #[no_mangle]
    pub unsafe extern "C" fn tms_resume(tag: *const c_char) {
        let tag = tag_filter_from_c(tag).or_fatal();
        instance().resume(tag.as_deref()).or_fatal();
    }
}
