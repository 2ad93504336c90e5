//! Allocation registry
//!
//! Maps each virtualized address to its [`AllocationRecord`]. The mutex
//! guards the map only: driver calls, which can be slow, always run with the
//! lock released so unrelated allocations never wait on each other's
//! hardware work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::allocator::record::{AllocationInfo, AllocationRecord, Backing};
use crate::backend::{DeviceDriver, DevicePtr, PhysicalHandle};
use crate::config::SaverConfig;
use crate::debug_log;
use crate::error::{SaverError, SaverResult};

/// Owner of every virtualized allocation in the process
pub struct AllocationRegistry<D: DeviceDriver> {
    pub(crate) driver: Arc<D>,
    pub(crate) config: SaverConfig,
    records: Mutex<HashMap<DevicePtr, AllocationRecord>>,
}

impl<D: DeviceDriver> AllocationRegistry<D> {
    pub fn new(driver: Arc<D>, config: SaverConfig) -> Self {
        AllocationRegistry {
            driver,
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn config(&self) -> &SaverConfig {
        &self.config
    }

    pub(crate) fn records(
        &self,
    ) -> SaverResult<MutexGuard<'_, HashMap<DevicePtr, AllocationRecord>>> {
        self.records
            .lock()
            .map_err(|e| SaverError::LockPoisoned(format!("allocation registry: {}", e)))
    }

    /// Reserve, back and map `size` bytes on `device`, then track them.
    ///
    /// On failure whatever the driver already handed out is returned to it
    /// and nothing is recorded.
    pub fn malloc(
        &self,
        device: i32,
        size: usize,
        tag: &str,
        backup_enabled: bool,
    ) -> SaverResult<DevicePtr> {
        let driver = &*self.driver;

        let handle = driver.create_physical(size, device, self.config.memory_attr)?;

        let ptr = match driver.reserve_address(size) {
            Ok(ptr) => ptr,
            Err(err) => {
                if let Err(cleanup) = driver.free_physical(handle) {
                    tracing::warn!("rollback after failed reservation: {}", cleanup);
                }
                return Err(err.into());
            }
        };

        if let Err(err) = driver.map(ptr, size, handle) {
            self.rollback(ptr, handle, false);
            return Err(err.into());
        }

        let inserted = {
            let mut records = self.records()?;
            if records.contains_key(&ptr) {
                false
            } else {
                records.insert(
                    ptr,
                    AllocationRecord::new(size, device, handle, tag, backup_enabled),
                );
                true
            }
        };
        if !inserted {
            self.rollback(ptr, handle, true);
            return Err(SaverError::DuplicateAddress(ptr));
        }

        debug_log!(
            "malloc ptr={} size={} device={} handle={:?} tag={} backup={}",
            ptr,
            size,
            device,
            handle,
            tag,
            backup_enabled
        );
        Ok(ptr)
    }

    /// Best-effort return of a half-built allocation to the driver
    fn rollback(&self, ptr: DevicePtr, handle: PhysicalHandle, mapped: bool) {
        let driver = &*self.driver;
        if mapped {
            if let Err(cleanup) = driver.unmap(ptr) {
                tracing::warn!("rollback of {}: {}", ptr, cleanup);
            }
        }
        if let Err(cleanup) = driver.release_address(ptr) {
            tracing::warn!("rollback of {}: {}", ptr, cleanup);
        }
        if let Err(cleanup) = driver.free_physical(handle) {
            tracing::warn!("rollback of {}: {}", ptr, cleanup);
        }
    }

    /// Stop tracking `ptr` and give its resources back to the driver.
    ///
    /// The entry is erased under the lock before teardown starts, so no other
    /// operation can observe a half-freed record.
    pub fn free(&self, ptr: DevicePtr) -> SaverResult<()> {
        let record = {
            let mut records = self.records()?;
            match records.get(&ptr) {
                None => return Err(SaverError::UntrackedAddress(ptr)),
                Some(record) if record.backing == Backing::InTransition => {
                    return Err(SaverError::AllocationBusy(ptr));
                }
                Some(_) => {}
            }
            records.remove(&ptr).ok_or(SaverError::UntrackedAddress(ptr))?
        };

        let driver = &*self.driver;
        if let Backing::Mapped(handle) = record.backing {
            driver.unmap(ptr)?;
            driver.free_physical(handle)?;
        }
        driver.release_address(ptr)?;
        if let Some(host) = record.host_backup {
            driver.free_host(host)?;
        }

        debug_log!(
            "free ptr={} size={} backing={:?} tag={}",
            ptr,
            record.size,
            record.backing,
            record.tag
        );
        Ok(())
    }

    /// Snapshot of every tracked allocation, in no particular order
    pub fn allocations(&self) -> SaverResult<Vec<AllocationInfo>> {
        Ok(self
            .records()?
            .iter()
            .map(|(ptr, record)| record.info(*ptr))
            .collect())
    }

    pub fn get(&self, ptr: DevicePtr) -> SaverResult<Option<AllocationInfo>> {
        Ok(self.records()?.get(&ptr).map(|record| record.info(ptr)))
    }

    pub fn contains(&self, ptr: DevicePtr) -> SaverResult<bool> {
        Ok(self.records()?.contains_key(&ptr))
    }

    pub fn len(&self) -> SaverResult<usize> {
        Ok(self.records()?.len())
    }

    pub fn is_empty(&self) -> SaverResult<bool> {
        Ok(self.records()?.is_empty())
    }
}

impl<D: DeviceDriver> std::fmt::Debug for AllocationRegistry<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tracked = self.records.lock().map(|r| r.len()).unwrap_or(0);
        f.debug_struct("AllocationRegistry")
            .field("config", &self.config)
            .field("tracked", &tracked)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::record::AllocationState;
    use crate::backend::{AclError, DriverCall, SimulatedDriver};

    fn registry() -> (Arc<SimulatedDriver>, AllocationRegistry<SimulatedDriver>) {
        let driver = Arc::new(SimulatedDriver::new());
        let registry = AllocationRegistry::new(Arc::clone(&driver), SaverConfig::default());
        (driver, registry)
    }

    #[test]
    fn test_malloc_maps_and_records() {
        let (driver, registry) = registry();
        let ptr = registry.malloc(0, 4096, "default", false).unwrap();

        assert!(driver.is_mapped(ptr));
        assert_eq!(driver.physical_bytes(0), 4096);

        let info = registry.get(ptr).unwrap().unwrap();
        assert_eq!(info.size, 4096);
        assert_eq!(info.device, 0);
        assert_eq!(info.tag, "default");
        assert!(!info.backup_enabled);
        assert_eq!(info.state, AllocationState::Active(driver.mapped_handle(ptr).unwrap()));
    }

    #[test]
    fn test_free_releases_everything() {
        let (driver, registry) = registry();
        let ptr = registry.malloc(0, 1024, "t", false).unwrap();
        registry.free(ptr).unwrap();

        assert!(registry.is_empty().unwrap());
        assert_eq!(driver.live_reservations(), 0);
        assert_eq!(driver.live_physical_handles(), 0);
    }

    #[test]
    fn test_free_of_unknown_address_is_fatal() {
        let (_driver, registry) = registry();
        let err = registry.free(DevicePtr::from_addr(0xdead_0000)).unwrap_err();
        assert!(matches!(err, SaverError::UntrackedAddress(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_double_free_is_fatal() {
        let (_driver, registry) = registry();
        let ptr = registry.malloc(0, 64, "t", false).unwrap();
        registry.free(ptr).unwrap();
        assert!(matches!(
            registry.free(ptr),
            Err(SaverError::UntrackedAddress(p)) if p == ptr
        ));
    }

    #[test]
    fn test_free_during_transition_is_rejected() {
        let (driver, registry) = registry();
        let ptr = registry.malloc(0, 64, "t", false).unwrap();
        registry.records().unwrap().get_mut(&ptr).unwrap().backing = Backing::InTransition;

        assert!(matches!(registry.free(ptr), Err(SaverError::AllocationBusy(p)) if p == ptr));
        assert!(registry.contains(ptr).unwrap());
        assert!(driver.is_mapped(ptr));
    }

    #[test]
    fn test_failed_map_rolls_back() {
        let (driver, registry) = registry();
        driver.fail_next(DriverCall::Map, 1);

        let err = registry.malloc(0, 256, "t", false).unwrap_err();
        assert!(matches!(err, SaverError::Acl(AclError::MapFailed(_))));
        assert!(registry.is_empty().unwrap());
        assert_eq!(driver.live_reservations(), 0);
        assert_eq!(driver.live_physical_handles(), 0);
    }

    #[test]
    fn test_failed_reservation_rolls_back() {
        let (driver, registry) = registry();
        driver.fail_next(DriverCall::ReserveAddress, 2);

        assert!(registry.malloc(0, 256, "t", false).is_err());
        assert!(registry.is_empty().unwrap());
        assert_eq!(driver.live_physical_handles(), 0);
    }

    #[test]
    fn test_duplicate_address_rolls_back() {
        let (driver, registry) = registry();
        // First address the simulated driver hands out
        let taken = DevicePtr::from_addr(0x1_0000_0000);
        registry.records().unwrap().insert(
            taken,
            AllocationRecord::new(64, 0, PhysicalHandle::from_raw(999), "stale", false),
        );

        let err = registry.malloc(0, 64, "t", false).unwrap_err();
        assert!(matches!(err, SaverError::DuplicateAddress(p) if p == taken));
        assert_eq!(registry.len().unwrap(), 1);
        assert!(!driver.is_mapped(taken));
        assert_eq!(driver.live_reservations(), 0);
        assert_eq!(driver.live_physical_handles(), 0);
    }

    #[test]
    fn test_failed_physical_allocation_records_nothing() {
        let (driver, registry) = registry();
        driver.fail_next(DriverCall::CreatePhysical, 3);

        assert!(registry.malloc(0, 256, "t", false).is_err());
        assert!(registry.is_empty().unwrap());
        assert_eq!(driver.call_count(DriverCall::ReserveAddress), 0);
    }

    #[test]
    fn test_allocations_enumerates_live_records() {
        let (_driver, registry) = registry();
        let a = registry.malloc(0, 64, "a", false).unwrap();
        let b = registry.malloc(1, 128, "b", true).unwrap();
        registry.free(a).unwrap();

        let all = registry.allocations().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].ptr, b);
        assert_eq!(all[0].device, 1);
        assert!(all[0].backup_enabled);
        assert!(!registry.contains(a).unwrap());
        assert!(registry.contains(b).unwrap());
    }
}
