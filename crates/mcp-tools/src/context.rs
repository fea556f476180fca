use mcp_core::McpResult;
use mirrorkit_engine::{MirrorHandle, MirrorKey, MirrorManager, MirrorResult};
use serde_json::{json, Value};
use tracing::debug;

use crate::errors::{join_error, mirror_error, validation_error};

/// Shared state for every tool: the mirror manager and its configuration.
#[derive(Debug, Clone)]
pub struct MirrorContext {
    manager: MirrorManager,
}

impl MirrorContext {
    pub fn new(manager: MirrorManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &MirrorManager {
        &self.manager
    }

    /// Run engine work on the blocking pool; the engine is synchronous.
    pub async fn blocking<T, F>(&self, work: F) -> McpResult<T>
    where
        F: FnOnce(&MirrorManager) -> MirrorResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || work(&manager))
            .await
            .map_err(join_error)?
            .map_err(mirror_error)
    }
}

/// Repository and optional ref named by a call.
#[derive(Debug, Clone)]
pub struct Target {
    pub repo: String,
    pub git_ref: Option<String>,
}

impl Target {
    pub fn from_params(params: &Value) -> McpResult<Self> {
        Ok(Self {
            repo: required_str(params, "repo")?.to_string(),
            git_ref: optional_str(params, "ref")?.map(str::to_string),
        })
    }

    pub fn key(&self, manager: &MirrorManager) -> MirrorResult<MirrorKey> {
        manager.key(&self.repo, self.git_ref.as_deref())
    }
}

/// Clone the mirror on first use so edit tools work against a fresh key.
fn materialize(manager: &MirrorManager, key: &MirrorKey) -> MirrorResult<()> {
    if manager.store().lookup(key)?.is_none() {
        debug!(target: "mirrorkit_tools", key = %key, "materializing mirror on first use");
        manager.ensure(key, false)?;
    }
    Ok(())
}

/// Locked handle for a mutating call.
pub fn acquire(manager: &MirrorManager, target: &Target) -> MirrorResult<MirrorHandle> {
    let key = target.key(manager)?;
    materialize(manager, &key)?;
    manager.acquire(&key)
}

/// Lock-free handle for inspection.
pub fn open(manager: &MirrorManager, target: &Target) -> MirrorResult<MirrorHandle> {
    let key = target.key(manager)?;
    materialize(manager, &key)?;
    manager.open(&key)
}

pub fn required_str<'a>(params: &'a Value, field: &str) -> McpResult<&'a str> {
    match params.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::String(_)) => Err(validation_error(&format!(
            "Parameter '{}' cannot be empty",
            field
        ))),
        Some(_) => Err(validation_error(&format!(
            "Parameter '{}' must be a string",
            field
        ))),
        None => Err(validation_error(&format!(
            "Parameter '{}' is required",
            field
        ))),
    }
}

pub fn optional_str<'a>(params: &'a Value, field: &str) -> McpResult<Option<&'a str>> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(validation_error(&format!(
            "Parameter '{}' must be a string",
            field
        ))),
    }
}

pub fn optional_bool(params: &Value, field: &str, default: bool) -> McpResult<bool> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(validation_error(&format!(
            "Parameter '{}' must be a boolean",
            field
        ))),
    }
}

pub fn optional_u64(params: &Value, field: &str) -> McpResult<Option<u64>> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or_else(|| {
            validation_error(&format!(
                "Parameter '{}' must be a non-negative integer",
                field
            ))
        }),
    }
}

/// Object schema with the shared `repo`/`ref` properties merged in.
pub fn target_schema(mut properties: Value, required: &[&str]) -> Value {
    if let Some(map) = properties.as_object_mut() {
        map.insert(
            "repo".to_string(),
            json!({
                "type": "string",
                "description": "Repository identifier (owner/name, URL or absolute path)"
            }),
        );
        map.insert(
            "ref".to_string(),
            json!({
                "type": "string",
                "description": "Branch; the configured default branch when omitted"
            }),
        );
    }
    let mut all_required = vec!["repo"];
    all_required.extend_from_slice(required);
    json!({
        "type": "object",
        "properties": properties,
        "required": all_required
    })
}
