use chrono::{SecondsFormat, Utc};
use mcp_core::{codes, McpError};
use mirrorkit_engine::{ErrorCategory, MirrorError};
use serde_json::{json, Value};
use uuid::Uuid;

pub fn validation_error(message: &str) -> McpError {
    build_rpc_error(
        codes::INVALID_PARAMS,
        "E_VALIDATION",
        message,
        "Fix the parameter and resend the call.",
        true,
        None,
    )
}

pub fn internal_error(message: impl Into<String>) -> McpError {
    let message = message.into();
    build_rpc_error(
        codes::INTERNAL_ERROR,
        "E_INTERNAL",
        format!("internal error ({})", message),
        "Report this error with its correlation id.",
        false,
        Some(json!({
            "component": "mcp-tools",
            "message": message,
            "correlation_id": Uuid::new_v4().to_string()
        })),
    )
}

/// A blocking engine task panicked or was cancelled.
pub fn join_error(err: tokio::task::JoinError) -> McpError {
    internal_error(format!("engine task failed: {}", err))
}

/// Map an engine error onto the JSON-RPC error shape, keeping its code,
/// hints and structured context.
pub fn mirror_error(err: MirrorError) -> McpError {
    let rpc_code = match err.category() {
        ErrorCategory::Validation | ErrorCategory::Security => codes::INVALID_PARAMS,
        ErrorCategory::State => codes::STATE_CONFLICT,
        ErrorCategory::Operation => codes::EXECUTION_FAILED,
        ErrorCategory::System => codes::INTERNAL_ERROR,
    };
    let hints = err.recovery_hints();
    let hint = hints.first().cloned().unwrap_or_default();
    let mut details = error_details(&err);
    details["hints"] = json!(hints);
    details["retryable"] = json!(err.is_retryable());

    build_rpc_error(
        rpc_code,
        err.error_code(),
        err.to_string(),
        hint,
        !matches!(err.category(), ErrorCategory::System),
        Some(details),
    )
}

fn error_details(err: &MirrorError) -> Value {
    match err {
        MirrorError::Validation {
            field,
            operation_index,
            ..
        } => json!({ "field": field, "operation_index": operation_index }),
        MirrorError::PathEscape { path, rule } => json!({ "path": path, "rule": rule }),
        MirrorError::DivergedState {
            repo,
            git_ref,
            detail,
        } => json!({
            "repo": repo,
            "ref": git_ref,
            "detail": detail,
            "recommended_action": "ensure with reset=true"
        }),
        MirrorError::ApplyFailure {
            path,
            operation_index,
            ..
        } => json!({ "path": path, "operation_index": operation_index }),
        MirrorError::Timeout {
            timeout_secs,
            command,
        } => json!({ "timeout_secs": timeout_secs, "command": command }),
        MirrorError::LockContention { key, lock_path } => json!({
            "key": key,
            "lock_path": lock_path.to_string_lossy()
        }),
        MirrorError::MirrorNotFound { key } => json!({ "key": key }),
        MirrorError::GitCommand {
            args,
            exit_code,
            stderr,
            network,
        } => json!({
            "args": args,
            "exit_code": exit_code,
            "stderr": stderr,
            "network": network
        }),
        MirrorError::Remote {
            service, operation, ..
        } => json!({ "service": service, "operation": operation }),
        MirrorError::Config { .. } => json!({}),
        MirrorError::Io {
            operation, path, ..
        } => json!({
            "operation": operation,
            "path": path.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
        MirrorError::Internal {
            component,
            correlation_id,
            ..
        } => json!({ "component": component, "correlation_id": correlation_id }),
    }
}

pub(crate) fn current_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn build_rpc_error(
    rpc_code: i32,
    code: &str,
    message: impl Into<String>,
    hint: impl Into<String>,
    actionable: bool,
    details: Option<Value>,
) -> McpError {
    let message = message.into();
    let hint = hint.into();
    let mut data = json!({
        "code": code,
        "message": message,
        "hint": hint,
        "actionable": actionable,
        "timestamp": current_timestamp(),
    });

    if let Some(details) = details {
        data["details"] = details;
    }

    McpError::rpc(rpc_code, message, Some(data))
}
