//! Session loop and tool orchestration for the Kestrel runtime.
//!
//! A [`Session`](session::Session) drives a model through repeated rounds of
//! think, call tools, observe results, continue. It owns the conversation
//! history, executes tool calls through a shared [`tools::ToolRegistry`],
//! enforces truncation and loop guards, accepts mid-flight steering, and
//! surfaces everything it does on an observable event stream.

pub mod config;
pub mod env;
pub mod error;
pub mod events;
pub mod profile;
pub mod session;
pub mod subagent;
pub mod tools;
pub mod truncate;

pub use config::SessionConfig;
pub use env::{ExecutionEnv, LocalEnv};
pub use error::AgentError;
pub use events::{SessionEvent, SessionEventKind};
pub use profile::Profile;
pub use session::Session;
