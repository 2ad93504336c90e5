//! Handle types shared by every device driver implementation
//!
//! Driver handles are opaque pointers on the C side. They are stored here as
//! plain integers so records holding them stay `Send + Sync` and can live in
//! the registry's map without unsafe impls.

use std::ffi::c_void;
use std::fmt;

/// ACL success status code
pub const ACL_SUCCESS: i32 = 0;

/// Device virtual address (the key of every allocation record)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(usize);

impl DevicePtr {
    pub const fn from_addr(addr: usize) -> Self {
        DevicePtr(addr)
    }

    pub fn from_ptr(ptr: *mut c_void) -> Self {
        DevicePtr(ptr as usize)
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr(0x{:x})", self.0)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Physical memory handle (`aclrtDrvMemHandle`)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalHandle(usize);

impl PhysicalHandle {
    pub const fn from_raw(raw: usize) -> Self {
        PhysicalHandle(raw)
    }

    pub const fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Debug for PhysicalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalHandle(0x{:x})", self.0)
    }
}

/// Pinned host memory returned by `aclrtMallocHost`
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostPtr(usize);

impl HostPtr {
    pub const fn from_addr(addr: usize) -> Self {
        HostPtr(addr)
    }

    pub fn from_ptr(ptr: *mut c_void) -> Self {
        HostPtr(ptr as usize)
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

impl fmt::Debug for HostPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostPtr(0x{:x})", self.0)
    }
}

/// Page attribute for physical device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryAttr {
    /// HBM huge pages (2MB granularity)
    #[default]
    Huge,
    /// HBM normal pages
    Normal,
}

impl MemoryAttr {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "huge" | "hbm_huge" => Some(MemoryAttr::Huge),
            "normal" | "hbm_normal" => Some(MemoryAttr::Normal),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_ptr_roundtrips_raw_pointer() {
        let raw = 0x1240_0000usize as *mut c_void;
        let ptr = DevicePtr::from_ptr(raw);
        assert_eq!(ptr.addr(), 0x1240_0000);
        assert_eq!(ptr.as_ptr(), raw);
        assert_eq!(format!("{}", ptr), "0x12400000");
        assert!(!ptr.is_null());
        assert!(DevicePtr::from_addr(0).is_null());
    }

    #[test]
    fn test_memory_attr_from_str() {
        assert_eq!(MemoryAttr::from_str("huge"), Some(MemoryAttr::Huge));
        assert_eq!(MemoryAttr::from_str("HBM_NORMAL"), Some(MemoryAttr::Normal));
        assert_eq!(MemoryAttr::from_str("ddr"), None);
        assert_eq!(MemoryAttr::default(), MemoryAttr::Huge);
    }
}
