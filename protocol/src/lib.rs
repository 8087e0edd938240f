//! Shared data model for a redcell session tree.
//!
//! Everything a front-end or a persistence layer needs to talk about
//! (sessions, messages, parts, permission requests, engagement state and
//! the aggregated trajectory) lives here as plain serde types. The `core` crate
//! owns the behavior; this crate deliberately has no async machinery.

pub mod protocol;
pub mod state;
pub mod trajectory;

pub use protocol::Event;
pub use protocol::EventMsg;
pub use protocol::Message;
pub use protocol::Part;
pub use protocol::PartKind;
pub use protocol::PermissionRequest;
pub use protocol::PermissionResponse;
pub use protocol::Session;
pub use state::EngagementState;
pub use trajectory::EngagementLog;
pub use trajectory::TrajectoryEntry;
