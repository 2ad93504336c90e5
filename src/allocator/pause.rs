//! Pause/resume engine
//!
//! A batch walks the records matching a tag filter one at a time. Each record
//! goes through the same three steps:
//!
//! 1. claim: under the registry lock, check the record's backing and mark it
//!    `InTransition`
//! 2. work: with the lock released, talk to the driver
//! 3. commit: under the lock again, store the backing the driver actually
//!    ended up with
//!
//! A record's sequence finishes before the next record is claimed, so a
//! failure leaves at most one record short of its target state. The first
//! failure ends the batch.

use crate::allocator::record::{Backing, TagFilter};
use crate::allocator::registry::AllocationRegistry;
use crate::backend::{DeviceDriver, DevicePtr, HostPtr, PhysicalHandle};
use crate::debug_log;
use crate::error::{SaverError, SaverResult};

/// Outcome of a pause or resume batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Records that changed state
    pub processed: usize,
    /// Matching records already in the target state, or owned by another batch
    pub skipped: usize,
}

/// What a claimed record looked like when it was taken
#[derive(Debug)]
struct Claim {
    size: usize,
    device: i32,
    tag: String,
    backup_enabled: bool,
    host_backup: Option<HostPtr>,
    /// Present when the record was active
    handle: Option<PhysicalHandle>,
}

/// Where the driver is after a (possibly failed) per-record sequence
struct Settled {
    backing: Backing,
    host_backup: Option<HostPtr>,
    result: SaverResult<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Pause,
    Resume,
}

impl<D: DeviceDriver> AllocationRegistry<D> {
    /// Release the physical backing of every matching active record.
    ///
    /// Records with backup enabled are copied to host memory first. Already
    /// paused records are skipped.
    pub fn pause<'a>(&self, filter: impl Into<TagFilter<'a>>) -> SaverResult<BatchReport> {
        self.run_batch(filter.into(), Direction::Pause)
    }

    /// Give every matching paused record fresh physical backing at its old
    /// address, restoring its contents when it has a host backup.
    pub fn resume<'a>(&self, filter: impl Into<TagFilter<'a>>) -> SaverResult<BatchReport> {
        self.run_batch(filter.into(), Direction::Resume)
    }

    fn run_batch(&self, filter: TagFilter<'_>, direction: Direction) -> SaverResult<BatchReport> {
        let candidates: Vec<DevicePtr> = self
            .records()?
            .iter()
            .filter(|(_, record)| filter.matches(&record.tag))
            .map(|(ptr, _)| *ptr)
            .collect();

        let mut report = BatchReport::default();
        for ptr in candidates {
            let claim = match self.claim(ptr, direction)? {
                Some(claim) => claim,
                None => {
                    report.skipped += 1;
                    continue;
                }
            };

            let tag = claim.tag.clone();
            let settled = match direction {
                Direction::Pause => self.pause_claimed(ptr, claim),
                Direction::Resume => self.resume_claimed(ptr, claim),
            };
            self.commit(ptr, settled.backing, settled.host_backup)?;

            if let Err(source) = settled.result {
                tracing::error!(
                    ptr = %ptr,
                    tag = %tag,
                    call = source.failed_call().unwrap_or("-"),
                    "{:?} aborted: {}",
                    direction,
                    source
                );
                let source = Box::new(source);
                return Err(match direction {
                    Direction::Pause => SaverError::PauseFailed { ptr, tag, source },
                    Direction::Resume => SaverError::ResumeFailed { ptr, tag, source },
                });
            }
            report.processed += 1;
        }

        tracing::debug!(
            ?filter,
            processed = report.processed,
            skipped = report.skipped,
            "{:?} batch complete",
            direction
        );
        Ok(report)
    }

    /// Take ownership of `ptr` for one per-record sequence.
    ///
    /// `None` when there is nothing to do: the record is already in the
    /// target state, another batch owns it, or it was freed since the batch
    /// listed it.
    fn claim(&self, ptr: DevicePtr, direction: Direction) -> SaverResult<Option<Claim>> {
        let mut records = self.records()?;
        let record = match records.get_mut(&ptr) {
            Some(record) => record,
            None => return Ok(None),
        };

        let handle = match (direction, record.backing) {
            (Direction::Pause, Backing::Mapped(handle)) => Some(handle),
            (Direction::Resume, Backing::Unmapped) => None,
            (_, backing) => {
                debug_log!("{:?} skips ptr={} backing={:?}", direction, ptr, backing);
                return Ok(None);
            }
        };

        record.backing = Backing::InTransition;
        Ok(Some(Claim {
            size: record.size,
            device: record.device,
            tag: record.tag.clone(),
            backup_enabled: record.backup_enabled,
            host_backup: record.host_backup,
            handle,
        }))
    }

    fn commit(
        &self,
        ptr: DevicePtr,
        backing: Backing,
        host_backup: Option<HostPtr>,
    ) -> SaverResult<()> {
        let mut records = self.records()?;
        let record = records.get_mut(&ptr).ok_or(SaverError::RecordLost(ptr))?;
        record.backing = backing;
        record.host_backup = host_backup;
        Ok(())
    }

    fn pause_claimed(&self, ptr: DevicePtr, claim: Claim) -> Settled {
        let driver = &*self.driver;
        let Claim {
            size,
            backup_enabled,
            mut host_backup,
            handle,
            ..
        } = claim;
        let handle = match handle {
            Some(handle) => handle,
            None => {
                return Settled {
                    backing: Backing::Unmapped,
                    host_backup,
                    result: Ok(()),
                }
            }
        };
        let still_mapped = |host_backup, err: SaverError| Settled {
            backing: Backing::Mapped(handle),
            host_backup,
            result: Err(err),
        };

        if backup_enabled {
            let host = match host_backup {
                Some(host) => host,
                None => match driver.alloc_host(size) {
                    Ok(host) => {
                        host_backup = Some(host);
                        host
                    }
                    Err(err) => return still_mapped(host_backup, err.into()),
                },
            };
            if let Err(err) = driver.copy_to_host(host, ptr, size) {
                return still_mapped(host_backup, err.into());
            }
        }

        if let Err(err) = driver.unmap(ptr) {
            return still_mapped(host_backup, err.into());
        }

        // From here on the range is unmapped whatever happens to the handle.
        let result = driver.free_physical(handle).map_err(SaverError::from);

        debug_log!(
            "pause ptr={} size={} handle={:?} backup={:?}",
            ptr,
            size,
            handle,
            host_backup
        );
        Settled {
            backing: Backing::Unmapped,
            host_backup,
            result,
        }
    }

    fn resume_claimed(&self, ptr: DevicePtr, claim: Claim) -> Settled {
        let driver = &*self.driver;
        let Claim {
            size,
            device,
            backup_enabled,
            host_backup,
            ..
        } = claim;
        let unmapped = |err: SaverError| Settled {
            backing: Backing::Unmapped,
            host_backup,
            result: Err(err),
        };

        let restore_from = if backup_enabled {
            match host_backup {
                Some(host) => Some(host),
                None => return unmapped(SaverError::BackupMissing(ptr)),
            }
        } else {
            None
        };

        let handle = match driver.create_physical(size, device, self.config.memory_attr) {
            Ok(handle) => handle,
            Err(err) => return unmapped(err.into()),
        };

        if let Err(err) = driver.map(ptr, size, handle) {
            if let Err(cleanup) = driver.free_physical(handle) {
                tracing::warn!("rollback after failed map at {}: {}", ptr, cleanup);
            }
            return unmapped(err.into());
        }

        let result = match restore_from {
            Some(host) => driver.copy_to_device(ptr, host, size).map_err(SaverError::from),
            None => Ok(()),
        };

        debug_log!(
            "resume ptr={} size={} handle={:?} restored={}",
            ptr,
            size,
            handle,
            restore_from.is_some()
        );
        Settled {
            backing: Backing::Mapped(handle),
            host_backup,
            result,
        }
    }
}
