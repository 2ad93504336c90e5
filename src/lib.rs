//! npu-memory-saver - pausable device memory for Ascend NPU runtimes
//!
//! Intercepts device allocations made inside a thread-local "region" and
//! backs them with reserved virtual address ranges. The physical memory
//! behind those ranges can later be released (`pause`) and recreated
//! (`resume`) while every address stays valid, optionally round-tripping the
//! contents through pinned host memory.
//!
//! Allocations made outside a region are forwarded untouched to the real
//! runtime.

#![allow(clippy::missing_safety_doc)] // FFI entry points documented at module level
#![allow(clippy::should_implement_trait)] // from_str helpers return Option, not Result

pub mod allocator;
pub mod backend;
pub mod config;
pub mod entrypoint;
pub mod error;
pub mod forwarder;
pub mod logging;
pub mod region;
pub mod saver;

pub use allocator::{AllocationInfo, AllocationRegistry, AllocationState, BatchReport, TagFilter};
pub use backend::{DeviceDriver, DevicePtr, MemoryAttr, SimulatedDriver};
pub use config::SaverConfig;
pub use error::{ErrorCategory, SaverError, SaverResult};
pub use forwarder::{ApiForwarder, NextObjectResolver, SymbolResolver};
pub use region::{DisableGuard, RegionGuard};
pub use saver::MemorySaver;

#[cfg(feature = "ascend")]
pub use backend::AclDriver;
