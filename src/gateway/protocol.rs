//! JSON-RPC 2.0 envelope types. Requests echo their `id`; notifications omit
//! it. Protocol errors use the reserved code space; application codes ride in
//! `error.data.code`.

use crate::errors::{CodedError, ErrorCode};
use crate::utils::redact;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const SERVER_ERROR: i64 = -32000;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    /// Absent for client-to-server notifications.
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("unknown method '{}'", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        let mut err = Self::new(INVALID_PARAMS, message);
        err.data = Some(serde_json::json!({ "code": ErrorCode::InvalidInput }));
        err
    }

    /// Application failure. The outward message is sanitized here, at the
    /// transport boundary; internal detail never crosses it.
    pub fn app(error: &CodedError) -> Self {
        let public = redact::scrub_error(error);
        let code = match public.code {
            ErrorCode::InvalidInput | ErrorCode::ValidationError => INVALID_PARAMS,
            _ => SERVER_ERROR,
        };
        Self {
            code,
            message: public.message,
            data: Some(serde_json::json!({ "code": public.code })),
        }
    }
}

pub fn response_ok(id: Value, result: Value) -> String {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
    .to_string()
}

pub fn response_err(id: Value, error: RpcError) -> String {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": error,
    })
    .to_string()
}

pub fn notification(method: &str, params: Value) -> String {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    })
    .to_string()
}
