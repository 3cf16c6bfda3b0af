//! Filesystem tools. Every path is contained to the workspace root before any
//! I/O happens; reads and writes respect the policy size cap.

use crate::errors::{CodedError, ErrorCode};
use crate::safety::path::contain;
use crate::tools::{Tool, ToolContext};
use crate::utils::truncate_at_utf8_boundary;
use async_trait::async_trait;
use serde_json::Value;
use std::io::Read;

fn path_param(input: &Value) -> &str {
    input["path"].as_str().unwrap_or_default()
}

pub struct FsReadTool;

#[async_trait]
impl Tool for FsReadTool {
    fn id(&self) -> &str {
        "fs.read"
    }

    fn description(&self) -> &str {
        "Read a file inside the workspace."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path, relative to the workspace root" }
            },
            "required": ["path"]
        })
    }

    async fn run(&self, input: Value, ctx: &ToolContext) -> Result<Value, CodedError> {
        let path_str = path_param(&input);
        let resolved = contain(path_str, &ctx.workspace)?;

        let meta = std::fs::metadata(&resolved).map_err(|e| {
            CodedError::new(ErrorCode::NotFound, format!("file not found: {}", path_str))
                .with_internal(e.to_string())
        })?;
        if !meta.is_file() {
            return Err(CodedError::new(
                ErrorCode::InvalidInput,
                format!("not a file: {}", path_str),
            ));
        }

        // Read at most the cap; never pull a multi-gigabyte file into memory
        // just to throw most of it away.
        let max = ctx.policy.max_bytes;
        let truncated = meta.len() > max as u64;
        let mut buf = Vec::with_capacity(meta.len().min(max as u64) as usize);
        let file = std::fs::File::open(&resolved)
            .map_err(|e| CodedError::internal_error(format!("open failed: {}", e)))?;
        file.take(max as u64)
            .read_to_end(&mut buf)
            .map_err(|e| CodedError::internal_error(format!("read failed: {}", e)))?;
        let content = String::from_utf8_lossy(truncate_at_utf8_boundary(&buf, max)).into_owned();

        Ok(serde_json::json!({
            "path": path_str,
            "content": content,
            "truncated": truncated,
        }))
    }
}

pub struct FsWriteTool;

#[async_trait]
impl Tool for FsWriteTool {
    fn id(&self) -> &str {
        "fs.write"
    }

    fn description(&self) -> &str {
        "Write content to a file inside the workspace, creating parent directories as needed."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        })
    }

    async fn run(&self, input: Value, ctx: &ToolContext) -> Result<Value, CodedError> {
        let path_str = path_param(&input);
        let content = input["content"].as_str().unwrap_or_default();
        let resolved = contain(path_str, &ctx.workspace)?;

        if content.len() > ctx.policy.max_bytes {
            return Err(CodedError::new(
                ErrorCode::SizeLimit,
                format!(
                    "content is {} bytes, write cap is {}",
                    content.len(),
                    ctx.policy.max_bytes
                ),
            ));
        }

        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CodedError::internal_error(format!("mkdir failed: {}", e)))?;
        }
        std::fs::write(&resolved, content)
            .map_err(|e| CodedError::internal_error(format!("write failed: {}", e)))?;

        Ok(serde_json::json!({
            "path": path_str,
            "bytesWritten": content.len(),
        }))
    }
}

pub struct FsListTool;

#[async_trait]
impl Tool for FsListTool {
    fn id(&self) -> &str {
        "fs.list"
    }

    fn description(&self) -> &str {
        "List the contents of a directory inside the workspace."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" }
            },
            "required": ["path"]
        })
    }

    async fn run(&self, input: Value, ctx: &ToolContext) -> Result<Value, CodedError> {
        let path_str = path_param(&input);
        let resolved = contain(path_str, &ctx.workspace)?;

        if !resolved.is_dir() {
            return Err(CodedError::new(
                ErrorCode::NotFound,
                format!("not a directory: {}", path_str),
            ));
        }

        let mut entries = Vec::new();
        let read = std::fs::read_dir(&resolved)
            .map_err(|e| CodedError::internal_error(format!("read_dir failed: {}", e)))?;
        for entry in read.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let suffix = if entry.path().is_dir() { "/" } else { "" };
            entries.push(format!("{}{}", name, suffix));
        }
        entries.sort();

        Ok(serde_json::json!({
            "path": path_str,
            "entries": entries,
        }))
    }
}
