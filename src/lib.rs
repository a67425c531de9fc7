//! Forge Fleet - distributed packaging for multi-platform builds
//!
//! One node acts as coordinator, accepting connections and distributing
//! build tasks; other nodes act as workers, executing the packaging
//! pipeline locally and streaming the resulting artifacts back to the
//! coordinator over a chunked upload protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Coordinator                         │
//! │  Registry  │  Task Orchestrator  │  Upload Receiver │
//! └────────────────────┬────────────────────────────────┘
//!                      │ envelopes (one WebSocket per worker)
//! ┌────────────────────▼────────────────────────────────┐
//! │                    Workers                           │
//! │  Pipeline: clone → checkout → install → build × N   │
//! │            → locate artifact → package → upload     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod net;
pub mod nodes;
pub mod pipeline;
pub mod protocol;
pub mod tasks;
pub mod transfer;

pub use config::{Config, GitConfig};
pub use error::{Error, Result};
pub use events::{EventBus, FleetEvent};
pub use net::{NetEvent, NetworkManager};
pub use nodes::{NodeInfo, NodeRegistry, ServerStatus};
pub use pipeline::PackExecutor;
pub use protocol::{CHUNK_SIZE, Envelope};
pub use tasks::{Task, TaskConfig, TaskManager, TaskProgress, TaskResult, TaskStatus};
pub use transfer::UploadSessions;
