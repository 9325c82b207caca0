use std::time::Duration;

use thiserror::Error;

use crate::tabs::TabId;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Everything the session core reports back to its caller.
///
/// None of these are fatal: the model that raised the error is left at its
/// last-known-good value and the user may retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Rejected locally before any network call.
    #[error("{0}")]
    Validation(String),
    #[error("not logged in")]
    NotAuthenticated,
    #[error("terminal connection is not established")]
    NotConnected,
    #[error("no file is open")]
    NoActiveTab,
    #[error("tab {0} is not open")]
    UnknownTab(TabId),
    #[error("{operation} failed: {message}")]
    Remote {
        operation: &'static str,
        message: String,
    },
    #[error("terminal did not start within {0:?}")]
    StartTimeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

impl SessionError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn remote(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Remote {
            operation,
            message: message.into(),
        }
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}
