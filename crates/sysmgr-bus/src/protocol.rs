// Wire format of the sysmgr service bus: JSON-RPC 2.0 requests whose
// `method` is a luna:// service URI.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::BusError;

pub const JSONRPC_VERSION: &str = "2.0";

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// A call on the bus. Only numeric ids are accepted; anything else is
/// answered with `INVALID_REQUEST`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: u64,
    /// Service URI, e.g. `luna://com.palm.sysMgrDataBackup/preBackup`.
    pub method: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

/// Reply to a `Request`. `id` is `null` when the request was too broken to
/// read an id from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl Request {
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: next_id(),
            method: method.into(),
            params,
        }
    }
}

impl Response {
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self::rejected(Some(id), code, message)
    }

    /// Error reply for a request whose id may be unknown.
    pub fn rejected(id: Option<u64>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// ---------------------------------------------------------------------------
// Service URIs
// ---------------------------------------------------------------------------

pub const URI_SCHEME: &str = "luna://";

/// Parsed `luna://<service>/<category>/<method>` address.
///
/// The category is everything between the service name and the last path
/// segment, so `luna://svc/preBackup` lives in the root category `/` and
/// `luna://svc/a/b/run` in `/a/b`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUri {
    pub service: String,
    pub category: String,
    pub method: String,
}

impl ServiceUri {
    pub fn new(
        service: impl Into<String>,
        category: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            category: category.into(),
            method: method.into(),
        }
    }

    pub fn parse(uri: &str) -> Result<Self, BusError> {
        let invalid = || BusError::InvalidUri(uri.to_string());
        let rest = uri.strip_prefix(URI_SCHEME).ok_or_else(invalid)?;
        let (service, path) = rest.split_once('/').ok_or_else(invalid)?;
        if service.is_empty() || path.split('/').any(str::is_empty) {
            return Err(invalid());
        }
        let (category, method) = match path.rsplit_once('/') {
            Some((category, method)) => (format!("/{}", category), method),
            None => ("/".to_string(), path),
        };
        Ok(Self::new(service, category, method))
    }
}

impl fmt::Display for ServiceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let category = self.category.trim_end_matches('/');
        write!(f, "{}{}{}/{}", URI_SCHEME, self.service, category, self.method)
    }
}

// ---------------------------------------------------------------------------
// Backup service
// ---------------------------------------------------------------------------

/// Well-known bus name of the system manager's backup responder.
pub const BACKUP_SERVICE_NAME: &str = "com.palm.sysMgrDataBackup";

/// Method names exposed by the backup responder on its root category.
pub mod methods {
    pub const PRE_BACKUP: &str = "preBackup";
    pub const POST_RESTORE: &str = "postRestore";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreBackupResult {
    pub description: String,
    pub version: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRestoreResult {
    #[serde(rename = "returnValue")]
    pub return_value: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes() {
        let req = Request::new(
            "luna://com.palm.sysMgrDataBackup/preBackup",
            serde_json::json!({"tempDir": "/tmp"}),
        );
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"luna://com.palm.sysMgrDataBackup/preBackup\""));
    }

    #[test]
    fn response_err_carries_code() {
        let resp = Response::err(2, INVALID_PARAMS, "missing files");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("\"result\""));
        let parsed: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.error.as_ref().unwrap().code, INVALID_PARAMS);
    }

    #[test]
    fn rejected_response_has_null_id() {
        let resp = Response::rejected(None, PARSE_ERROR, "parse error");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["id"], serde_json::Value::Null);
        assert_eq!(json["error"]["code"], PARSE_ERROR);
    }

    #[test]
    fn unique_ids() {
        let a = next_id();
        let b = next_id();
        assert_ne!(a, b);
    }

    #[test]
    fn uri_root_category() {
        let uri = ServiceUri::parse("luna://com.palm.sysMgrDataBackup/preBackup").unwrap();
        assert_eq!(uri.service, BACKUP_SERVICE_NAME);
        assert_eq!(uri.category, "/");
        assert_eq!(uri.method, methods::PRE_BACKUP);
        assert_eq!(uri.to_string(), "luna://com.palm.sysMgrDataBackup/preBackup");
    }

    #[test]
    fn uri_nested_category() {
        let uri = ServiceUri::parse("luna://svc/launcher/pages/save").unwrap();
        assert_eq!(uri.category, "/launcher/pages");
        assert_eq!(uri.method, "save");
        assert_eq!(uri.to_string(), "luna://svc/launcher/pages/save");
    }

    #[test]
    fn uri_rejects_malformed() {
        for bad in [
            "palm://svc/method",
            "luna://svc",
            "luna:///method",
            "luna://svc/",
            "luna://svc/a//b",
        ] {
            assert!(
                matches!(ServiceUri::parse(bad), Err(BusError::InvalidUri(_))),
                "accepted {bad}"
            );
        }
    }

    #[test]
    fn post_restore_result_uses_wire_name() {
        let json = serde_json::to_value(PostRestoreResult { return_value: true }).unwrap();
        assert_eq!(json, serde_json::json!({"returnValue": true}));
    }
}
