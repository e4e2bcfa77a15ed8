//! `AgentDesk` Engine Library
//!
//! Orchestration core driving an external coding agent:
//! - Session connector owning backend sessions
//! - Approval gate deciding every tool call
//! - Streaming coordinator with per-state timeouts
//! - Iterative task loop on top of streamed turns

pub mod approval;
pub mod backend;
pub mod connector;
pub mod events;
pub mod iteration;
pub mod orchestrator;
pub mod session;
pub mod streaming;

pub use approval::ApprovalGate;
pub use connector::SessionConnector;
pub use events::{CoreEvent, EventBus};
pub use iteration::IterationEngine;
pub use orchestrator::Orchestrator;
pub use session::{AutonomyFlags, Session, SharedSession};
pub use streaming::StreamingCoordinator;
