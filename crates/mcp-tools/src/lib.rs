// # -----------------------------
// # crates/mcp-tools/src/lib.rs
// # -----------------------------
//! MCP tools over persistent repository mirrors: lifecycle, edits, diffs,
//! command execution and the pull-request workflow.

use std::sync::Arc;

use mcp_core::{McpResult, McpTool};
use mirrorkit_engine::{CoreConfig, MirrorManager, PullRequestGateway};

mod context;
mod diff;
mod edit;
mod errors;
mod exec;
mod gh;
mod mirror;
mod workflow;

pub use context::{MirrorContext, Target};
pub use diff::{ApplyPatchTool, CompareTool, MakeDiffTool};
pub use edit::{ApplyBatchTool, WorkspaceEditTool};
pub use errors::{internal_error, mirror_error, validation_error};
pub use exec::RunCommandTool;
pub use gh::GhCliGateway;
pub use mirror::{
    CheckoutWorkspaceTool, DeleteWorkspaceTool, EnsureWorkspaceTool, ListWorkspacesTool,
    WorkspaceStatusTool,
};
pub use workflow::RunWorkflowTool;

/// Optional collaborators for [`default_tools_with_options`].
#[derive(Clone, Default)]
pub struct ToolOptions {
    /// Pull-request backend; the `gh` CLI when absent
    pub gateway: Option<Arc<dyn PullRequestGateway>>,
}

/// Build the full tool set for one mirror store.
pub fn default_tools(config: CoreConfig) -> McpResult<Vec<Arc<dyn McpTool>>> {
    default_tools_with_options(config, ToolOptions::default())
}

pub fn default_tools_with_options(
    config: CoreConfig,
    options: ToolOptions,
) -> McpResult<Vec<Arc<dyn McpTool>>> {
    let manager = MirrorManager::new(config).map_err(mirror_error)?;
    let context = Arc::new(MirrorContext::new(manager));
    let gateway = options
        .gateway
        .unwrap_or_else(|| Arc::new(GhCliGateway::default()));

    let mut tools: Vec<Arc<dyn McpTool>> = vec![
        Arc::new(EnsureWorkspaceTool::new(Arc::clone(&context))),
        Arc::new(CheckoutWorkspaceTool::new(Arc::clone(&context))),
        Arc::new(WorkspaceStatusTool::new(Arc::clone(&context))),
        Arc::new(ListWorkspacesTool::new(Arc::clone(&context))),
        Arc::new(DeleteWorkspaceTool::new(Arc::clone(&context))),
    ];
    for tool in WorkspaceEditTool::all(&context) {
        tools.push(Arc::new(tool));
    }
    tools.push(Arc::new(ApplyBatchTool::new(Arc::clone(&context))));
    tools.push(Arc::new(MakeDiffTool::new(Arc::clone(&context))));
    tools.push(Arc::new(CompareTool::new(Arc::clone(&context))));
    tools.push(Arc::new(ApplyPatchTool::new(Arc::clone(&context))));
    tools.push(Arc::new(RunCommandTool::new(Arc::clone(&context))));
    tools.push(Arc::new(RunWorkflowTool::new(context, gateway)));

    Ok(tools)
}
