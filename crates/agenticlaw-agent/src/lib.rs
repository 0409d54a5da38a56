//! Agenticlaw Agent - Runtime for tool-using AI agents with .ctx persistence

pub mod checkpoint;
pub mod context;
pub mod ctx_file;
pub mod output_event;
pub mod runtime;
pub mod session;
pub mod store;
pub mod subagent;

pub use checkpoint::{CheckpointManager, FileSnapshot};
pub use context::ContextManager;
pub use output_event::OutputEvent;
pub use runtime::{bootstrap, bootstrap_with_provider, AgentConfig, AgentEvent, AgentRuntime};
pub use session::{Session, SessionKey, SessionRegistry};
pub use store::{
    NotebookEntry, NotebookStore, TodoItem, TodoStatus, TodoStore, UsefulInfoItem, UsefulInfoStore,
};
pub use subagent::{SubagentEntry, SubagentInfo, SubagentRegistry, SubagentStatus};
