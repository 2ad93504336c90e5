//! Host-memory simulation of the ACL virtual memory API
//!
//! `SimulatedDriver` implements [`DeviceDriver`] without any device: physical
//! handles own a `Vec<u8>`, reservations are bookkeeping entries in a
//! synthetic address space, and copies move bytes between those buffers. It
//! enforces the same ordering rules the runtime does (no release of a mapped
//! range, no freeing of a mapped handle, no copies through an unmapped range),
//! which makes protocol mistakes in the allocator show up as errors in tests.
//!
//! Failures can be injected per call with [`SimulatedDriver::fail_next`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::backend::acl_backend::{
    AclError, AclResult, DeviceDriver, DevicePtr, HostPtr, MemoryAttr, PhysicalHandle,
};

/// Status returned for calls that violate the driver's ordering rules
pub const SIM_ERROR_INVALID_PARAM: i32 = 107000;

/// Status returned when a simulated allocation cannot be satisfied
pub const SIM_ERROR_BAD_ALLOC: i32 = 207001;

/// Granularity of the synthetic virtual address space
const VA_GRANULARITY: usize = 2 * 1024 * 1024;

/// First address handed out by `reserve_address`
const VA_BASE: usize = 0x1_0000_0000;

/// Driver calls, used for call counting and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverCall {
    CurrentDevice,
    ReserveAddress,
    ReleaseAddress,
    CreatePhysical,
    FreePhysical,
    Map,
    Unmap,
    AllocHost,
    FreeHost,
    CopyToHost,
    CopyToDevice,
}

#[derive(Debug)]
struct PhysicalBlock {
    device: i32,
    data: Vec<u8>,
    mapped_at: Option<DevicePtr>,
}

#[derive(Debug)]
struct SimState {
    current_device: i32,
    device_count: i32,
    next_addr: usize,
    next_handle: usize,
    reservations: HashMap<DevicePtr, usize>,
    physical: HashMap<PhysicalHandle, PhysicalBlock>,
    mappings: HashMap<DevicePtr, PhysicalHandle>,
    host: HashMap<HostPtr, Box<[u8]>>,
    calls: HashMap<DriverCall, usize>,
    faults: HashMap<DriverCall, VecDeque<i32>>,
}

/// Host-backed stand-in for the ACL runtime
#[derive(Debug)]
pub struct SimulatedDriver {
    state: Mutex<SimState>,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDriver {
    /// Driver with eight devices, device 0 current
    pub fn new() -> Self {
        Self::with_device_count(8)
    }

    pub fn with_device_count(device_count: i32) -> Self {
        SimulatedDriver {
            state: Mutex::new(SimState {
                current_device: 0,
                device_count,
                next_addr: VA_BASE,
                next_handle: 1,
                reservations: HashMap::new(),
                physical: HashMap::new(),
                mappings: HashMap::new(),
                host: HashMap::new(),
                calls: HashMap::new(),
                faults: HashMap::new(),
            }),
        }
    }

    // A panic while holding the lock only happens inside a failing test,
    // so recover the state instead of cascading the poison.
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Change the device returned by `current_device`
    pub fn set_current_device(&self, device: i32) {
        self.state().current_device = device;
    }

    /// Make the next `call` fail with status `code`. Repeated calls queue
    /// further failures.
    pub fn fail_next(&self, call: DriverCall, code: i32) {
        self.state()
            .faults
            .entry(call)
            .or_insert_with(VecDeque::new)
            .push_back(code);
    }

    /// Number of times `call` has been issued, including failed attempts
    pub fn call_count(&self, call: DriverCall) -> usize {
        self.state().calls.get(&call).copied().unwrap_or(0)
    }

    /// Write `data` at the start of the mapped range `ptr`
    pub fn write_device(&self, ptr: DevicePtr, data: &[u8]) -> AclResult<()> {
        let mut state = self.state();
        let block = state.mapped_block_mut(ptr, data.len(), "write")?;
        block.data[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Read `len` bytes from the start of the mapped range `ptr`
    pub fn read_device(&self, ptr: DevicePtr, len: usize) -> AclResult<Vec<u8>> {
        let mut state = self.state();
        let block = state.mapped_block_mut(ptr, len, "read")?;
        Ok(block.data[..len].to_vec())
    }

    /// Contents of a pinned host buffer
    pub fn read_host(&self, host: HostPtr) -> Option<Vec<u8>> {
        self.state().host.get(&host).map(|buf| buf.to_vec())
    }

    pub fn is_reserved(&self, ptr: DevicePtr) -> bool {
        self.state().reservations.contains_key(&ptr)
    }

    pub fn is_mapped(&self, ptr: DevicePtr) -> bool {
        self.state().mappings.contains_key(&ptr)
    }

    /// Handle currently mapped at `ptr`
    pub fn mapped_handle(&self, ptr: DevicePtr) -> Option<PhysicalHandle> {
        self.state().mappings.get(&ptr).copied()
    }

    /// Physical bytes held on `device`
    pub fn physical_bytes(&self, device: i32) -> usize {
        self.state()
            .physical
            .values()
            .filter(|block| block.device == device)
            .map(|block| block.data.len())
            .sum()
    }

    pub fn live_reservations(&self) -> usize {
        self.state().reservations.len()
    }

    pub fn live_physical_handles(&self) -> usize {
        self.state().physical.len()
    }

    pub fn live_host_buffers(&self) -> usize {
        self.state().host.len()
    }
}

impl SimState {
    fn enter(&mut self, call: DriverCall) -> Option<i32> {
        *self.calls.entry(call).or_insert(0) += 1;
        self.faults.get_mut(&call).and_then(VecDeque::pop_front)
    }

    fn mapped_block_mut(
        &mut self,
        ptr: DevicePtr,
        len: usize,
        what: &str,
    ) -> AclResult<&mut PhysicalBlock> {
        let handle = *self.mappings.get(&ptr).ok_or_else(|| {
            AclError::MemoryCopyFailed(format!(
                "simulated {} through unmapped range {} (code {})",
                what, ptr, SIM_ERROR_INVALID_PARAM
            ))
        })?;
        let block = self.physical.get_mut(&handle).ok_or_else(|| {
            AclError::MemoryCopyFailed(format!(
                "mapping at {} refers to released handle {:?}",
                ptr, handle
            ))
        })?;
        if len > block.data.len() {
            return Err(AclError::MemoryCopyFailed(format!(
                "simulated {} of {} bytes exceeds {} mapped at {}",
                what,
                len,
                block.data.len(),
                ptr
            )));
        }
        Ok(block)
    }
}

fn injected(call: &str, code: i32) -> String {
    format!("simulated {} failed with code {}", call, code)
}

impl DeviceDriver for SimulatedDriver {
    fn current_device(&self) -> AclResult<i32> {
        let mut state = self.state();
        if let Some(code) = state.enter(DriverCall::CurrentDevice) {
            return Err(AclError::DeviceQueryFailed(injected("aclrtGetDevice", code)));
        }
        Ok(state.current_device)
    }

    fn reserve_address(&self, size: usize) -> AclResult<DevicePtr> {
        let mut state = self.state();
        if let Some(code) = state.enter(DriverCall::ReserveAddress) {
            return Err(AclError::AddressReservationFailed(injected(
                "aclrtReserveMemAddress",
                code,
            )));
        }
        if size == 0 {
            return Err(AclError::AddressReservationFailed(format!(
                "zero-size reservation (code {})",
                SIM_ERROR_INVALID_PARAM
            )));
        }
        let ptr = DevicePtr::from_addr(state.next_addr);
        let span = size.div_ceil(VA_GRANULARITY) * VA_GRANULARITY;
        // Leave a guard gap so neighbouring reservations never touch
        state.next_addr += span + VA_GRANULARITY;
        state.reservations.insert(ptr, size);
        Ok(ptr)
    }

    fn release_address(&self, ptr: DevicePtr) -> AclResult<()> {
        let mut state = self.state();
        if let Some(code) = state.enter(DriverCall::ReleaseAddress) {
            return Err(AclError::AddressReleaseFailed(injected(
                "aclrtReleaseMemAddress",
                code,
            )));
        }
        if state.mappings.contains_key(&ptr) {
            return Err(AclError::AddressReleaseFailed(format!(
                "range {} is still mapped (code {})",
                ptr, SIM_ERROR_INVALID_PARAM
            )));
        }
        state.reservations.remove(&ptr).map(|_| ()).ok_or_else(|| {
            AclError::AddressReleaseFailed(format!(
                "range {} is not reserved (code {})",
                ptr, SIM_ERROR_INVALID_PARAM
            ))
        })
    }

    fn create_physical(
        &self,
        size: usize,
        device: i32,
        _attr: MemoryAttr,
    ) -> AclResult<PhysicalHandle> {
        let mut state = self.state();
        if let Some(code) = state.enter(DriverCall::CreatePhysical) {
            return Err(AclError::PhysicalAllocationFailed(injected(
                "aclrtMallocPhysical",
                code,
            )));
        }
        if size == 0 || device < 0 || device >= state.device_count {
            return Err(AclError::PhysicalAllocationFailed(format!(
                "invalid request size={} device={} (code {})",
                size, device, SIM_ERROR_BAD_ALLOC
            )));
        }
        let handle = PhysicalHandle::from_raw(state.next_handle);
        state.next_handle += 1;
        state.physical.insert(
            handle,
            PhysicalBlock {
                device,
                data: vec![0u8; size],
                mapped_at: None,
            },
        );
        Ok(handle)
    }

    fn free_physical(&self, handle: PhysicalHandle) -> AclResult<()> {
        let mut state = self.state();
        if let Some(code) = state.enter(DriverCall::FreePhysical) {
            return Err(AclError::PhysicalReleaseFailed(injected(
                "aclrtFreePhysical",
                code,
            )));
        }
        match state.physical.get(&handle) {
            None => Err(AclError::PhysicalReleaseFailed(format!(
                "unknown handle {:?} (code {})",
                handle, SIM_ERROR_INVALID_PARAM
            ))),
            Some(block) if block.mapped_at.is_some() => {
                Err(AclError::PhysicalReleaseFailed(format!(
                    "handle {:?} is still mapped (code {})",
                    handle, SIM_ERROR_INVALID_PARAM
                )))
            }
            Some(_) => {
                state.physical.remove(&handle);
                Ok(())
            }
        }
    }

    fn map(&self, ptr: DevicePtr, size: usize, handle: PhysicalHandle) -> AclResult<()> {
        let mut state = self.state();
        if let Some(code) = state.enter(DriverCall::Map) {
            return Err(AclError::MapFailed(injected("aclrtMapMem", code)));
        }
        let reserved = state.reservations.get(&ptr).copied().ok_or_else(|| {
            AclError::MapFailed(format!(
                "range {} is not reserved (code {})",
                ptr, SIM_ERROR_INVALID_PARAM
            ))
        })?;
        if size > reserved || state.mappings.contains_key(&ptr) {
            return Err(AclError::MapFailed(format!(
                "cannot map {} bytes at {} (reserved {}, mapped {})",
                size,
                ptr,
                reserved,
                state.mappings.contains_key(&ptr)
            )));
        }
        let block = state.physical.get_mut(&handle).ok_or_else(|| {
            AclError::MapFailed(format!(
                "unknown handle {:?} (code {})",
                handle, SIM_ERROR_INVALID_PARAM
            ))
        })?;
        if block.mapped_at.is_some() || block.data.len() < size {
            return Err(AclError::MapFailed(format!(
                "handle {:?} cannot back {} bytes at {}",
                handle, size, ptr
            )));
        }
        block.mapped_at = Some(ptr);
        state.mappings.insert(ptr, handle);
        Ok(())
    }

    fn unmap(&self, ptr: DevicePtr) -> AclResult<()> {
        let mut state = self.state();
        if let Some(code) = state.enter(DriverCall::Unmap) {
            return Err(AclError::UnmapFailed(injected("aclrtUnmapMem", code)));
        }
        let handle = state.mappings.remove(&ptr).ok_or_else(|| {
            AclError::UnmapFailed(format!(
                "range {} is not mapped (code {})",
                ptr, SIM_ERROR_INVALID_PARAM
            ))
        })?;
        if let Some(block) = state.physical.get_mut(&handle) {
            block.mapped_at = None;
        }
        Ok(())
    }

    fn alloc_host(&self, size: usize) -> AclResult<HostPtr> {
        let mut state = self.state();
        if let Some(code) = state.enter(DriverCall::AllocHost) {
            return Err(AclError::HostAllocationFailed(injected(
                "aclrtMallocHost",
                code,
            )));
        }
        let buf = vec![0u8; size.max(1)].into_boxed_slice();
        let host = HostPtr::from_addr(buf.as_ptr() as usize);
        state.host.insert(host, buf);
        Ok(host)
    }

    fn free_host(&self, host: HostPtr) -> AclResult<()> {
        let mut state = self.state();
        if let Some(code) = state.enter(DriverCall::FreeHost) {
            return Err(AclError::HostReleaseFailed(injected("aclrtFreeHost", code)));
        }
        state.host.remove(&host).map(|_| ()).ok_or_else(|| {
            AclError::HostReleaseFailed(format!(
                "unknown host buffer {:?} (code {})",
                host, SIM_ERROR_INVALID_PARAM
            ))
        })
    }

    fn copy_to_host(&self, dst: HostPtr, src: DevicePtr, size: usize) -> AclResult<()> {
        let mut state = self.state();
        if let Some(code) = state.enter(DriverCall::CopyToHost) {
            return Err(AclError::MemoryCopyFailed(injected("aclrtMemcpy D2H", code)));
        }
        let data = state.mapped_block_mut(src, size, "D2H copy")?.data[..size].to_vec();
        let buf = state.host.get_mut(&dst).ok_or_else(|| {
            AclError::MemoryCopyFailed(format!("unknown host buffer {:?}", dst))
        })?;
        if buf.len() < size {
            return Err(AclError::MemoryCopyFailed(format!(
                "host buffer {:?} holds {} bytes, copy needs {}",
                dst,
                buf.len(),
                size
            )));
        }
        buf[..size].copy_from_slice(&data);
        Ok(())
    }

    fn copy_to_device(&self, dst: DevicePtr, src: HostPtr, size: usize) -> AclResult<()> {
        let mut state = self.state();
        if let Some(code) = state.enter(DriverCall::CopyToDevice) {
            return Err(AclError::MemoryCopyFailed(injected("aclrtMemcpy H2D", code)));
        }
        let data = match state.host.get(&src) {
            Some(buf) if buf.len() >= size => buf[..size].to_vec(),
            Some(buf) => {
                return Err(AclError::MemoryCopyFailed(format!(
                    "host buffer {:?} holds {} bytes, copy needs {}",
                    src,
                    buf.len(),
                    size
                )))
            }
            None => {
                return Err(AclError::MemoryCopyFailed(format!(
                    "unknown host buffer {:?}",
                    src
                )))
            }
        };
        let block = state.mapped_block_mut(dst, size, "H2D copy")?;
        block.data[..size].copy_from_slice(&data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_write_read_cycle() {
        let driver = SimulatedDriver::new();
        let ptr = driver.reserve_address(4096).unwrap();
        let handle = driver.create_physical(4096, 0, MemoryAttr::Huge).unwrap();
        driver.map(ptr, 4096, handle).unwrap();

        driver.write_device(ptr, &[7u8; 16]).unwrap();
        assert_eq!(driver.read_device(ptr, 16).unwrap(), vec![7u8; 16]);
        assert_eq!(driver.physical_bytes(0), 4096);
        assert_eq!(driver.mapped_handle(ptr), Some(handle));
    }

    #[test]
    fn test_enforces_unmap_before_release() {
        let driver = SimulatedDriver::new();
        let ptr = driver.reserve_address(64).unwrap();
        let handle = driver.create_physical(64, 0, MemoryAttr::Huge).unwrap();
        driver.map(ptr, 64, handle).unwrap();

        assert!(driver.release_address(ptr).is_err());
        assert!(driver.free_physical(handle).is_err());

        driver.unmap(ptr).unwrap();
        driver.free_physical(handle).unwrap();
        driver.release_address(ptr).unwrap();
        assert_eq!(driver.live_reservations(), 0);
        assert_eq!(driver.live_physical_handles(), 0);
    }

    #[test]
    fn test_reservations_do_not_overlap() {
        let driver = SimulatedDriver::new();
        let a = driver.reserve_address(3 * VA_GRANULARITY).unwrap();
        let b = driver.reserve_address(1).unwrap();
        assert!(b.addr() >= a.addr() + 3 * VA_GRANULARITY);
    }

    #[test]
    fn test_unmapped_range_is_unreadable() {
        let driver = SimulatedDriver::new();
        let ptr = driver.reserve_address(64).unwrap();
        assert!(driver.read_device(ptr, 1).is_err());
    }

    #[test]
    fn test_fail_next_is_consumed_once() {
        let driver = SimulatedDriver::new();
        driver.fail_next(DriverCall::AllocHost, SIM_ERROR_BAD_ALLOC);

        let err = driver.alloc_host(32).unwrap_err();
        assert!(matches!(err, AclError::HostAllocationFailed(_)));
        assert!(driver.alloc_host(32).is_ok());
        assert_eq!(driver.call_count(DriverCall::AllocHost), 2);
    }

    #[test]
    fn test_rejects_unknown_device() {
        let driver = SimulatedDriver::with_device_count(2);
        assert!(driver.create_physical(16, 2, MemoryAttr::Normal).is_err());
        assert!(driver.create_physical(16, 1, MemoryAttr::Normal).is_ok());
    }
}
