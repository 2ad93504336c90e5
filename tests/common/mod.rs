//! Common test utilities
//!
//! Every test builds its own [`SaverFixture`]: a fresh [`MemorySaver`] over a
//! fresh [`SimulatedDriver`], so registry state never leaks between tests.
//! Calls that leave the region reach [`StubResolver`]'s fake runtime entry
//! points, which count invocations in process-wide atomics. Tests that read
//! those counters must be `#[serial]`.

#![allow(dead_code)]

use std::ffi::{c_void, CStr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use npu_memory_saver::backend::SimulatedDriver;
use npu_memory_saver::forwarder::{FreeFn, MallocFn, MALLOC_SYMBOL};
use npu_memory_saver::{ApiForwarder, MemorySaver, SaverConfig, SaverResult, SymbolResolver};
#[allow(unused_imports)]
pub use serial_test::serial;

/// Base of the addresses handed out by the fake runtime malloc
pub const PASSTHROUGH_BASE: usize = 0x7f00_0000_0000;

pub static PASSTHROUGH_MALLOCS: AtomicUsize = AtomicUsize::new(0);
pub static PASSTHROUGH_FREES: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn fake_runtime_malloc(ptr: *mut *mut c_void, _size: usize, _policy: u32) -> i32 {
    let n = PASSTHROUGH_MALLOCS.fetch_add(1, Ordering::SeqCst);
    *ptr = (PASSTHROUGH_BASE + n * 0x1000) as *mut c_void;
    0
}

unsafe extern "C" fn fake_runtime_free(_ptr: *mut c_void) -> i32 {
    PASSTHROUGH_FREES.fetch_add(1, Ordering::SeqCst);
    0
}

/// Resolves the runtime entry points to in-process fakes
#[derive(Debug, Default, Clone, Copy)]
pub struct StubResolver;

impl SymbolResolver for StubResolver {
    fn resolve(&self, symbol: &CStr) -> SaverResult<*mut c_void> {
        if symbol == MALLOC_SYMBOL {
            Ok(fake_runtime_malloc as MallocFn as *mut c_void)
        } else {
            Ok(fake_runtime_free as FreeFn as *mut c_void)
        }
    }
}

pub fn reset_passthrough_counters() {
    PASSTHROUGH_MALLOCS.store(0, Ordering::SeqCst);
    PASSTHROUGH_FREES.store(0, Ordering::SeqCst);
}

pub struct SaverFixture {
    pub driver: Arc<SimulatedDriver>,
    pub saver: MemorySaver<SimulatedDriver, StubResolver>,
}

impl SaverFixture {
    pub fn new() -> Self {
        Self::with_config(SaverConfig::default())
    }

    pub fn with_config(config: SaverConfig) -> Self {
        npu_memory_saver::region::reset();
        let driver = Arc::new(SimulatedDriver::new());
        let saver = MemorySaver::with_forwarder(
            Arc::clone(&driver),
            config,
            ApiForwarder::new(StubResolver),
        );
        SaverFixture { driver, saver }
    }

    /// Every driver resource handed out has been returned
    pub fn assert_no_leak(&self) {
        assert_eq!(self.driver.live_reservations(), 0, "leaked address reservations");
        assert_eq!(self.driver.live_physical_handles(), 0, "leaked physical handles");
        assert_eq!(self.driver.live_host_buffers(), 0, "leaked host buffers");
    }
}

/// `len` bytes of a repeating, position-dependent pattern
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
