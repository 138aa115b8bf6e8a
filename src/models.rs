use axum::http::{header::HeaderName, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A single entry in the key tree, either a directory or a leaf.
///
/// Serializes to the etcd v2 node shape: `ttl`, `expiration` and `nodes`
/// are omitted when absent, everything else is always present.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Node {
    pub key: String,
    pub value: String,
    #[serde(rename = "createdIndex")]
    pub created_index: i64,
    #[serde(rename = "modifiedIndex")]
    pub modified_index: i64,
    pub dir: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Node>,
}

/// The success envelope for every key-space operation.
#[derive(Debug, Clone, Serialize)]
pub struct ActionUpdate {
    pub action: String,
    pub node: Node,
    #[serde(rename = "prevNode", skip_serializing_if = "Option::is_none")]
    pub prev_node: Option<Node>,
}

impl ActionUpdate {
    pub fn new(action: &str, node: Node) -> Self {
        ActionUpdate {
            action: action.to_string(),
            node,
            prev_node: None,
        }
    }
}

/// The etcd v2 wire error: `{errorCode, message, cause, index}`.
///
/// The `index` is the current global index at the time the error was
/// produced; failed mutations roll back their increment, so this is the
/// index of the last applied mutation.
#[derive(Debug, Clone, Serialize, thiserror::Error, PartialEq)]
#[error("etcd error ({error_code}) at index {index} {message}: {cause}")]
pub struct EtcdError {
    #[serde(rename = "errorCode")]
    pub error_code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cause: String,
    pub index: i64,
}

impl EtcdError {
    fn new(error_code: i32, message: &str, cause: String, index: i64) -> Self {
        EtcdError {
            error_code,
            message: message.to_string(),
            cause,
            index,
        }
    }

    pub fn not_found(key: &str, index: i64) -> Self {
        Self::new(100, "Key not found", key.to_string(), index)
    }

    pub fn compare_failed(
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
        index: i64,
    ) -> Self {
        Self::new(
            101,
            "Compare failed",
            format!("[{} != {}]", expected, actual),
            index,
        )
    }

    pub fn not_a_file(key: &str, index: i64) -> Self {
        Self::new(102, "Not a file", key.to_string(), index)
    }

    pub fn not_a_directory(key: &str, index: i64) -> Self {
        Self::new(104, "Not a directory", key.to_string(), index)
    }

    pub fn key_exists(key: &str, index: i64) -> Self {
        Self::new(105, "Key already exists", key.to_string(), index)
    }

    pub fn root_read_only(index: i64) -> Self {
        Self::new(107, "Root is read only", "/".to_string(), index)
    }

    pub fn directory_not_empty(key: &str, index: i64) -> Self {
        Self::new(108, "Directory not empty", key.to_string(), index)
    }

    pub fn invalid_field(cause: String) -> Self {
        Self::new(209, "Invalid field", cause, 0)
    }

    pub fn internal(cause: String) -> Self {
        Self::new(300, "Raft Internal Error", cause, 0)
    }

    /// The watch history no longer reaches back to the requested index.
    pub fn index_cleared(oldest_index: i64, wait_index: i64, current_index: i64) -> Self {
        Self::new(
            401,
            "The event in requested index is outdated and cleared",
            format!(
                "the requested history has been cleared [{}/{}]",
                oldest_index, wait_index
            ),
            current_index,
        )
    }

    pub fn status(&self) -> StatusCode {
        match self.error_code {
            100 => StatusCode::NOT_FOUND,
            101 | 105 => StatusCode::PRECONDITION_FAILED,
            102 | 104 | 107 | 108 => StatusCode::FORBIDDEN,
            300 => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<sqlx::Error> for EtcdError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = %err, "database error");
        EtcdError::internal(err.to_string())
    }
}

pub static X_ETCD_INDEX: HeaderName = HeaderName::from_static("x-etcd-index");

impl IntoResponse for EtcdError {
    fn into_response(self) -> Response {
        let status = self.status();
        let index = self.index.to_string();
        (status, [(X_ETCD_INDEX.clone(), index)], Json(self)).into_response()
    }
}
