//! Virtualized allocation tracking and the pause/resume engine

pub mod pause;
pub mod record;
pub mod registry;

pub use pause::BatchReport;
pub use record::{AllocationInfo, AllocationState, TagFilter};
pub use registry::AllocationRegistry;
