//! Routing of intercepted calls between the registry and the real runtime

mod common;

use std::ffi::c_void;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{
    reset_passthrough_counters, serial, SaverFixture, PASSTHROUGH_BASE, PASSTHROUGH_FREES,
    PASSTHROUGH_MALLOCS,
};
use npu_memory_saver::backend::ACL_SUCCESS;
use npu_memory_saver::region::{self, DisableGuard};
use npu_memory_saver::{DevicePtr, ErrorCategory, RegionGuard, SaverError};

fn acl_malloc(fixture: &SaverFixture, size: usize) -> *mut c_void {
    let mut out: *mut c_void = std::ptr::null_mut();
    let ret = unsafe { fixture.saver.allocate(&mut out, size, 0) }.unwrap();
    assert_eq!(ret, ACL_SUCCESS);
    out
}

#[test]
#[serial]
fn test_outside_region_forwards_to_runtime() {
    reset_passthrough_counters();
    let fixture = SaverFixture::new();

    let ptr = acl_malloc(&fixture, 1024);
    assert!(ptr as usize >= PASSTHROUGH_BASE);
    assert_eq!(PASSTHROUGH_MALLOCS.load(Ordering::SeqCst), 1);
    assert!(fixture.saver.registry().is_empty().unwrap());

    assert_eq!(unsafe { fixture.saver.release(ptr) }.unwrap(), ACL_SUCCESS);
    assert_eq!(PASSTHROUGH_FREES.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.driver.live_reservations(), 0);
}

#[test]
#[serial]
fn test_inside_region_virtualizes() {
    reset_passthrough_counters();
    let fixture = SaverFixture::new();

    region::set_region_active(true);
    region::set_tag("activations");
    let ptr = acl_malloc(&fixture, 1024);
    region::reset();

    assert_eq!(PASSTHROUGH_MALLOCS.load(Ordering::SeqCst), 0);
    let info = fixture
        .saver
        .registry()
        .get(DevicePtr::from_ptr(ptr))
        .unwrap()
        .unwrap();
    assert_eq!(info.tag, "activations");
    assert!(!info.backup_enabled);
    assert!(fixture.driver.is_mapped(info.ptr));
}

#[test]
#[serial]
fn test_disable_guard_forwards_inside_region() {
    reset_passthrough_counters();
    let fixture = SaverFixture::new();

    let _region = RegionGuard::enter("t", false).unwrap();
    let scratch = {
        let _off = DisableGuard::new();
        acl_malloc(&fixture, 64)
    };
    let tracked = acl_malloc(&fixture, 64);

    assert_eq!(PASSTHROUGH_MALLOCS.load(Ordering::SeqCst), 1);
    assert!(!fixture
        .saver
        .registry()
        .contains(DevicePtr::from_ptr(scratch))
        .unwrap());
    assert!(fixture
        .saver
        .registry()
        .contains(DevicePtr::from_ptr(tracked))
        .unwrap());
}

#[test]
#[serial]
fn test_concurrent_passthrough_leaves_registry_empty() {
    reset_passthrough_counters();
    let fixture = Arc::new(SaverFixture::new());

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let fixture = Arc::clone(&fixture);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let ptr = acl_malloc(&fixture, 256);
                    unsafe { fixture.saver.release(ptr) }.unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(PASSTHROUGH_MALLOCS.load(Ordering::SeqCst), 100);
    assert_eq!(PASSTHROUGH_FREES.load(Ordering::SeqCst), 100);
    assert!(fixture.saver.registry().is_empty().unwrap());
    assert!(fixture.saver.forwarder().is_resolved());
}

#[test]
fn test_region_on_one_thread_only() {
    let fixture = Arc::new(SaverFixture::new());
    let _region = RegionGuard::enter("main", false).unwrap();

    let other = {
        let fixture = Arc::clone(&fixture);
        std::thread::spawn(move || {
            fixture
                .saver
                .framework_allocate(64, 0, std::ptr::null_mut())
                .unwrap_err()
        })
    };
    let err = other.join().unwrap();
    assert!(matches!(err, SaverError::OutsideRegion(_)));

    assert!(fixture
        .saver
        .framework_allocate(64, 0, std::ptr::null_mut())
        .is_ok());
}

#[test]
fn test_concurrent_region_allocations_from_many_threads() {
    let fixture = Arc::new(SaverFixture::new());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let fixture = Arc::clone(&fixture);
            std::thread::spawn(move || {
                let tag = format!("worker{}", t);
                let _region = RegionGuard::enter(&tag, t % 2 == 0).unwrap();
                (0..25)
                    .map(|_| {
                        fixture
                            .saver
                            .framework_allocate(4096, 0, std::ptr::null_mut())
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 100);
    assert_eq!(fixture.saver.registry().len().unwrap(), 100);

    let report = fixture.saver.pause(Some("worker1")).unwrap();
    assert_eq!(report.processed, 25);
}

#[test]
fn test_unknown_free_inside_region_is_contract_error() {
    let fixture = SaverFixture::new();
    let _region = RegionGuard::enter("t", false).unwrap();

    let err = unsafe { fixture.saver.release(0x1234_5000 as *mut c_void) }.unwrap_err();
    assert!(matches!(err, SaverError::UntrackedAddress(_)));
    assert_eq!(err.category(), ErrorCategory::Contract);
    assert!(err.is_fatal());
}

#[test]
fn test_double_free_inside_region() {
    let fixture = SaverFixture::new();
    let _region = RegionGuard::enter("t", false).unwrap();

    let ptr = acl_malloc(&fixture, 128);
    unsafe { fixture.saver.release(ptr) }.unwrap();
    assert!(matches!(
        unsafe { fixture.saver.release(ptr) },
        Err(SaverError::UntrackedAddress(p)) if p == DevicePtr::from_ptr(ptr)
    ));
    fixture.assert_no_leak();
}

#[test]
fn test_device_query_failure_propagates() {
    let fixture = SaverFixture::new();
    fixture
        .driver
        .fail_next(npu_memory_saver::backend::DriverCall::CurrentDevice, 107002);
    let _region = RegionGuard::enter("t", false).unwrap();

    let mut out: *mut c_void = std::ptr::null_mut();
    let err = unsafe { fixture.saver.allocate(&mut out, 64, 0) }.unwrap_err();
    assert_eq!(err.failed_call(), Some("aclrtGetDevice"));
    assert!(out.is_null());
    assert!(fixture.saver.registry().is_empty().unwrap());
}
