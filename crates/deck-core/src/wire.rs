//! Payloads exchanged with the control plane outside the instance snapshot itself.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Control frames sent on an interactive terminal channel. Everything else on
/// that channel is raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Resize { cols: u16, rows: u16 },
}

impl From<TerminalSize> for ControlMessage {
    fn from(size: TerminalSize) -> Self {
        ControlMessage::Resize {
            cols: size.cols,
            rows: size.rows,
        }
    }
}

/// Response of the log tail endpoint: content after the requested offset and
/// the total size the log has reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LogChunk {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub size: u64,
}

/// Configuration message that opens a build job channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BuildRequest {
    pub preset: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub git_url: String,
    #[serde(default)]
    pub python_ver: String,
    #[serde(default)]
    pub cuda_ver: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMode {
    #[default]
    Trash,
    Permanent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeleteOptions {
    pub mode: DeleteMode,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CopyRequest {
    pub new_name: String,
}

/// Error body returned by the control plane on rejected commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ErrorDetail {
    #[serde(default)]
    pub detail: Option<String>,
}

/// Partial instance body used for both create and update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InstancePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_blueprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_ids: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autostart: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_custom_hostname: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuda_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub torch_version: Option<String>,
}

impl InstancePatch {
    pub fn is_empty(&self) -> bool {
        self == &InstancePatch::default()
    }
}
