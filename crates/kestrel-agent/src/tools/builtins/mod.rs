//! Builtin coding-agent tools, each a thin executor over [`ExecutionEnv`].
//!
//! [`ExecutionEnv`]: crate::env::ExecutionEnv

use std::sync::Arc;

use crate::error::ToolError;
use crate::tools::ToolRegistry;

mod edit_file;
mod glob;
mod grep;
mod ls;
mod read_file;
mod shell;
mod write_file;

pub use edit_file::EditFileTool;
pub use glob::GlobTool;
pub use grep::GrepTool;
pub use ls::LsTool;
pub use read_file::ReadFileTool;
pub use shell::ShellTool;
pub use write_file::WriteFileTool;

/// Register the full builtin toolset.
pub fn register_builtins(registry: &ToolRegistry) -> Result<(), ToolError> {
    registry.register(Arc::new(ReadFileTool))?;
    registry.register(Arc::new(WriteFileTool))?;
    registry.register(Arc::new(EditFileTool))?;
    registry.register(Arc::new(ShellTool))?;
    registry.register(Arc::new(GlobTool))?;
    registry.register(Arc::new(GrepTool))?;
    registry.register(Arc::new(LsTool))?;
    Ok(())
}
