//! VM lifecycle: provisioning and decommissioning.

pub mod creator;
pub mod deleter;

pub use creator::{DnsEncoder, ProvisionRequest, VmCreator};
pub use deleter::VmDeleter;
