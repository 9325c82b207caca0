//! Client-side session core for a browser-style Rust workspace.
//!
//! [`Session`] owns the event channel, the HTTP client and four models: open
//! editor tabs, the remote file tree, the interactive terminal and the
//! environment bootstrap tracker. Drive it by calling user operations and
//! [`Session::pump`] from one thread.

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod file_tree;
pub mod init_tracker;
pub mod logger;
pub mod model;
pub mod session;
pub mod socket;
pub mod state_saver;
pub mod tabs;
pub mod terminal;

pub use error::{Result, SessionError};
pub use session::{Notice, NoticeLevel, Session};
