use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::types::SessionStatus;

/// Body of every error reply.
#[derive(Debug, Serialize, PartialEq)]
pub struct ApiError {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub session_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct FilesQuery {
    pub session_id: Uuid,
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WriteFileRequest {
    pub session_id: Uuid,
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub session_id: Uuid,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub session_id: Uuid,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub session_id: Uuid,
    pub command: Option<String>,
}

/// Query of the terminal WebSocket; missing dimensions use the configured PTY size.
#[derive(Debug, Default, Deserialize)]
pub struct TerminalQuery {
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// Control frame a terminal client may send as WebSocket text.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TerminalControl {
    Resize { cols: u16, rows: u16 },
}

#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub files: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FileContentResponse {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct WriteFileResponse {
    pub success: bool,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: SessionStatus,
}
