//! # keel-id
//!
//! Typed identifiers handed out by the recovery engine.
//!
//! Every id renders as `{prefix}_{ulid}`:
//! - `agent_01HV4Z2WQXKJNM8GPQY6VBKC3D` is the management agent baked into a
//!   freshly provisioned VM
//! - `task_01HV4Z3MXNKPQR9HSTZ7WCLD4E` is the recovery task driving an
//!   operation
//!
//! Cloud ids (VM and disk CIDs) are opaque strings chosen by the cloud
//! backend and are deliberately not modelled here.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
