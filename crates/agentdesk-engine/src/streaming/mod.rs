//! Streaming responses.
//!
//! Per-session state machine (`Idle → Streaming ⇄ ToolExecuting → Completed |
//! Error | Cancelled`), the registry holding it, and the coordinator that
//! exposes a prompt's response as a stream of partial messages.

mod coordinator;
mod registry;
mod settings;
mod state;

pub use coordinator::{PartialMessage, StreamingCoordinator};
pub use registry::{StreamingRegistry, TurnShared};
pub use settings::{CachedSettings, ConfigSettingsProvider, SettingsProvider, StaticSettingsProvider};
pub use state::{SessionStreamingContext, StreamingState, TimeoutCheck, timeout_notice};
