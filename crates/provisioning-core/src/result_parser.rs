// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Parsing of raw callback payloads posted by the execution layer.
//!
//! ```text
//! { "request_id": "…",
//!   "status": "ok" | "err" | "<instance status>",
//!   "response": { "result": { "instance_id": "i-1" | ["i-1", "i-2"],
//!                             "hostname": "…",
//!                             "computational_url": [{"description": "…", "url": "…"}],
//!                             "error": "…" } } }
//! ```

use serde_json::Value;
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::model::{ActionKind, ResourceKind, ResourceUrl, UserInstanceStatus};

const STATUS_FIELD: &str = "status";
const RESPONSE_NODE: &str = "response";
const RESULT_NODE: &str = "result";
const INSTANCE_ID_FIELD: &str = "instance_id";
const ERROR_FIELD: &str = "error";

/// Joins multi-host instance ids into the single stored string.
pub const INSTANCE_ID_DELIMITER: &str = ";";

/// Outcome as reported by the execution layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportedStatus {
    /// Generic success (`ok`).
    Succeeded,
    /// Generic failure (`err`).
    Failed,
    /// An explicit instance status.
    Status(UserInstanceStatus),
    /// A value this engine does not know.
    Unrecognized(String),
}

impl ReportedStatus {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "ok" | "success" => Self::Succeeded,
            "err" | "error" => Self::Failed,
            other => match other.parse::<UserInstanceStatus>() {
                Ok(status) => Self::Status(status),
                Err(_) => Self::Unrecognized(raw.to_string()),
            },
        }
    }
}

impl std::fmt::Display for ReportedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => f.write_str("ok"),
            Self::Failed => f.write_str("err"),
            Self::Status(status) => f.write_str(status.as_str()),
            Self::Unrecognized(raw) => f.write_str(raw),
        }
    }
}

/// Validated, structured view of a callback payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackResult {
    pub reported: ReportedStatus,
    pub instance_id: Option<String>,
    pub host_id: Option<String>,
    pub urls: Vec<ResourceUrl>,
    pub error_message: Option<String>,
    /// The raw result node; `None` means the payload carried no result.
    pub result: Option<Value>,
}

impl CallbackResult {
    /// Whether the payload carried a result node at all.
    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }
}

/// Parse a raw callback payload for the given resource kind and action.
pub fn parse(
    resource_kind: ResourceKind,
    action: ActionKind,
    raw: &Value,
) -> Result<CallbackResult> {
    let reported = match raw.get(STATUS_FIELD) {
        Some(Value::String(status)) => ReportedStatus::parse(status),
        Some(other) => {
            return Err(EngineError::malformed(format!(
                "'{}' must be a string for {} {}, got {}",
                STATUS_FIELD, action, resource_kind, other
            )));
        }
        None => {
            return Err(EngineError::malformed(format!(
                "'{}' is required for {} {}",
                STATUS_FIELD, action, resource_kind
            )));
        }
    };

    let Some(result) = result_node(raw)? else {
        return Ok(CallbackResult {
            reported,
            instance_id: None,
            host_id: None,
            urls: Vec::new(),
            error_message: None,
            result: None,
        });
    };

    Ok(CallbackResult {
        reported,
        instance_id: instance_id(result.get(INSTANCE_ID_FIELD))?,
        host_id: text_value(result.get(resource_kind.host_id_field())),
        urls: urls(resource_kind, result),
        error_message: text_value(result.get(ERROR_FIELD)),
        result: Some(result.clone()),
    })
}

/// `response.result`, distinguishing "absent" from "present but not an object".
fn result_node(raw: &Value) -> Result<Option<&Value>> {
    let response = match raw.get(RESPONSE_NODE) {
        None | Some(Value::Null) => return Ok(None),
        Some(response) if response.is_object() => response,
        Some(_) => return Err(EngineError::malformed("'response' must be an object")),
    };
    match response.get(RESULT_NODE) {
        None | Some(Value::Null) => Ok(None),
        Some(result) if result.is_object() => Ok(Some(result)),
        Some(_) => Err(EngineError::malformed("'response.result' must be an object")),
    }
}

fn instance_id(node: Option<&Value>) -> Result<Option<String>> {
    match node {
        Some(Value::Array(ids)) => {
            let ids = ids
                .iter()
                .map(|id| {
                    scalar_text(id).ok_or_else(|| {
                        EngineError::malformed(format!(
                            "'{}' elements must be scalars, got {}",
                            INSTANCE_ID_FIELD, id
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok((!ids.is_empty()).then(|| ids.join(INSTANCE_ID_DELIMITER)))
        }
        other => Ok(text_value(other)),
    }
}

fn urls(resource_kind: ResourceKind, result: &Value) -> Vec<ResourceUrl> {
    let field = resource_kind.url_field();
    let Some(node) = result.get(field) else {
        return Vec::new();
    };
    match serde_json::from_value::<Vec<ResourceUrl>>(node.clone()) {
        Ok(urls) => urls,
        Err(e) => {
            warn!(
                field = %format!("{}.{}.{}", RESPONSE_NODE, RESULT_NODE, field),
                error = %e,
                "Cannot parse URL list in callback payload"
            );
            Vec::new()
        }
    }
}

fn text_value(node: Option<&Value>) -> Option<String> {
    node.and_then(scalar_text)
}

fn scalar_text(node: &Value) -> Option<String> {
    match node {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
