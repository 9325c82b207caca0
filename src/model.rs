use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct UserInfo {
    #[serde(default)]
    pub id: serde_json::Value,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct LoginRequest {
    pub identifier: String,
    pub password: String,
}

impl LoginRequest {
    pub fn validate(&self) -> Result<()> {
        if self.identifier.trim().is_empty() || self.password.is_empty() {
            return Err(SessionError::validation(
                "Username/email and password are required",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl RegisterRequest {
    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty()
            || self.email.trim().is_empty()
            || self.password.is_empty()
        {
            return Err(SessionError::validation("All fields are required"));
        }
        Ok(())
    }
}

/// Result of the session check performed on startup.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct AuthStatus {
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub user: Option<UserInfo>,
    #[serde(default)]
    pub environment_initialized: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One entry of a directory snapshot as the server sends it.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct FileNode {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default = "default_entry_kind")]
    pub kind: EntryKind,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub children: Option<Vec<FileNode>>,
}

fn default_entry_kind() -> EntryKind {
    EntryKind::Directory
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Success {
        output: String,
        error: Option<String>,
        exit_code: Option<i32>,
    },
    CompileError {
        output: String,
    },
    Timeout,
    Failed {
        message: String,
    },
}

impl RunOutcome {
    /// Text shown in the output area after a run.
    pub fn render(&self) -> String {
        match self {
            RunOutcome::Success { output, error, .. } => {
                let mut text = if output.is_empty() {
                    "Program finished (no output)".to_string()
                } else {
                    output.clone()
                };
                if let Some(err) = error.as_deref().filter(|e| !e.is_empty()) {
                    text.push_str("\nerror: ");
                    text.push_str(err);
                }
                text
            }
            RunOutcome::CompileError { output } => format!("Compile error:\n{output}"),
            RunOutcome::Timeout => "Execution timed out".to_string(),
            RunOutcome::Failed { message } => format!("Error: {message}"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct SystemInfo {
    #[serde(default)]
    pub proot_available: bool,
    #[serde(default)]
    pub environments_count: u64,
    #[serde(default)]
    pub users_count: u64,
    #[serde(default)]
    pub initialized_environments: u64,
    #[serde(default)]
    pub terminal_available: bool,
}

impl SystemInfo {
    pub fn summary(&self) -> String {
        let yes_no = |b: bool| if b { "yes" } else { "no" };
        format!(
            "System info:\nproot available: {}\nenvironments: {}\nusers: {}\ninitialized environments: {}\nterminal available: {}",
            yes_no(self.proot_available),
            self.environments_count,
            self.users_count,
            self.initialized_environments,
            yes_no(self.terminal_available),
        )
    }
}

/// Payload of the server's `connected` notification, or of the link coming up.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ConnectedInfo {
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct InitStatusSnapshot {
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub in_progress: bool,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub percent: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct InitProgress {
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub percent: f64,
    #[serde(default)]
    pub message: String,
}
