//! Ascend ACL backend
//!
//! Driver contract, handle types and errors are always available. The FFI
//! bindings and the runtime-backed driver require the `ascend` feature, which
//! links libascendcl.

mod driver;
mod error;
#[cfg(feature = "ascend")]
pub mod ffi;
#[cfg(feature = "ascend")]
mod runtime;
mod types;

pub use driver::DeviceDriver;
pub use error::{AclError, AclResult};
#[cfg(feature = "ascend")]
pub use runtime::{recent_error_message, AclDriver};
pub use types::{DevicePtr, HostPtr, MemoryAttr, PhysicalHandle, ACL_SUCCESS};
