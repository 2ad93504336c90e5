//! Device driver backends

pub mod acl_backend;
pub mod sim_driver;

pub use acl_backend::*;
pub use sim_driver::{DriverCall, SimulatedDriver};
