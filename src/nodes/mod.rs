//! Node identity and the coordinator's connection registry

mod registry;
mod types;

pub use registry::{AttachOutcome, NodeRegistry, PeerSession};
pub use types::{NodeInfo, ServerStatus, local_hostname, node_platform};
