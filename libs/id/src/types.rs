//! Id types used by the recovery engine.

use crate::define_id;

define_id!(
    /// Identity of the management agent running inside a VM.
    ///
    /// A new one is generated for every VM the engine provisions, so an old
    /// agent can never answer for its replacement.
    AgentId,
    "agent"
);

define_id!(
    /// Identity of the recovery task an operation runs under.
    TaskId,
    "task"
);
