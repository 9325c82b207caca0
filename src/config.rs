use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

const APP_DIR_NAME: &str = "ide-session";

fn default_server_url() -> String {
    "http://127.0.0.1:5554".to_string()
}

fn default_tree_root() -> String {
    "/home/user".to_string()
}

fn default_terminal_start_timeout_ms() -> u64 {
    5000
}

fn default_init_dismiss_ms() -> u64 {
    3000
}

fn default_reconnect_initial_ms() -> u64 {
    1000
}

fn default_reconnect_max_ms() -> u64 {
    5000
}

fn default_http_timeout_ms() -> u64 {
    30_000
}

fn default_notice_ttl_ms() -> u64 {
    5000
}

fn default_new_file_template() -> String {
    "// New file created\n".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_tree_root")]
    pub tree_root: String,
    #[serde(default = "default_terminal_start_timeout_ms")]
    pub terminal_start_timeout_ms: u64,
    #[serde(default = "default_init_dismiss_ms")]
    pub init_dismiss_ms: u64,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default = "default_notice_ttl_ms")]
    pub notice_ttl_ms: u64,
    /// Drop terminal output tagged with a session id other than the current one.
    #[serde(default)]
    pub strict_terminal_session: bool,
    #[serde(default = "default_new_file_template")]
    pub new_file_template: String,
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            tree_root: default_tree_root(),
            terminal_start_timeout_ms: default_terminal_start_timeout_ms(),
            init_dismiss_ms: default_init_dismiss_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            http_timeout_ms: default_http_timeout_ms(),
            notice_ttl_ms: default_notice_ttl_ms(),
            strict_terminal_session: false,
            new_file_template: default_new_file_template(),
            state_path: None,
            log_path: None,
        }
    }
}

impl ClientConfig {
    pub fn terminal_start_timeout(&self) -> Duration {
        Duration::from_millis(self.terminal_start_timeout_ms)
    }

    pub fn init_dismiss(&self) -> Duration {
        Duration::from_millis(self.init_dismiss_ms)
    }

    pub fn notice_ttl(&self) -> Duration {
        Duration::from_millis(self.notice_ttl_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> (Duration, Duration) {
        let initial = self.reconnect_initial_ms.max(1);
        let max = self.reconnect_max_ms.max(initial);
        (Duration::from_millis(initial), Duration::from_millis(max))
    }

    pub fn resolved_state_path(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| config_dir().join("state.json"))
    }

    pub fn resolved_log_path(&self) -> PathBuf {
        self.log_path
            .clone()
            .unwrap_or_else(|| config_dir().join("logs").join("session.log"))
    }
}

/// Client-side state that survives restarts. Not synchronized anywhere.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientState {
    #[serde(default)]
    pub expanded: BTreeMap<String, bool>,
    /// Last buffer typed into the editor while no tab was open.
    #[serde(default)]
    pub scratch_buffer: Option<String>,
}

fn config_dir() -> PathBuf {
    // %APPDATA%\ide-session, else $XDG_CONFIG_HOME/ide-session, else ~/.config/ide-session.
    if let Some(p) = std::env::var_os("APPDATA") {
        return PathBuf::from(p).join(APP_DIR_NAME);
    }
    if let Some(p) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(p).join(APP_DIR_NAME);
    }
    if let Some(p) = std::env::var_os("HOME") {
        return PathBuf::from(p).join(".config").join(APP_DIR_NAME);
    }
    PathBuf::from(".")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

pub fn try_load_from(path: &Path) -> anyhow::Result<ClientConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

/// Loads the config, falling back to defaults if the file is missing or broken.
pub fn load_from(path: &Path) -> ClientConfig {
    match try_load_from(path) {
        Ok(cfg) => cfg,
        Err(err) => {
            if path.exists() {
                tracing::warn!("{err:#}; using defaults");
            }
            ClientConfig::default()
        }
    }
}

pub fn load() -> ClientConfig {
    load_from(&config_path())
}

pub fn load_state_from(path: &Path) -> ClientState {
    let Ok(bytes) = fs::read(path) else {
        return ClientState::default();
    };
    match serde_json::from_slice(&bytes) {
        Ok(state) => state,
        Err(err) => {
            tracing::warn!(path = %path.display(), "discarding unreadable client state: {err}");
            ClientState::default()
        }
    }
}

/// Writes `state` via a temp file and rename.
pub fn save_state_to(path: &Path, state: &ClientState) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_vec_pretty(state).context("serializing client state")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    if fs::rename(&tmp, path).is_err() {
        // Rename can fail across devices; copy instead.
        let bytes = fs::read(&tmp).with_context(|| format!("reading {}", tmp.display()))?;
        fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
        let _ = fs::remove_file(&tmp);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: ClientConfig = toml::from_str(
            r#"
            server_url = "https://ide.example.net"
            strict_terminal_session = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server_url, "https://ide.example.net");
        assert!(cfg.strict_terminal_session);
        assert_eq!(cfg.tree_root, "/home/user");
        assert_eq!(cfg.terminal_start_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.new_file_template, "// New file created\n");
    }

    #[test]
    fn broken_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "server_url = [").unwrap();
        assert!(try_load_from(&path).is_err());
        assert_eq!(load_from(&path), ClientConfig::default());
        assert_eq!(load_from(&dir.path().join("missing.toml")), ClientConfig::default());
    }

    #[test]
    fn backoff_is_ordered() {
        let cfg = ClientConfig {
            reconnect_initial_ms: 8000,
            reconnect_max_ms: 10,
            ..ClientConfig::default()
        };
        let (initial, max) = cfg.reconnect_backoff();
        assert!(initial <= max);
    }

    #[test]
    fn state_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let mut state = ClientState::default();
        state.expanded.insert("/home/user/src".into(), true);
        state.expanded.insert("/home/user/target".into(), false);
        state.scratch_buffer = Some("fn main() {}".into());

        save_state_to(&path, &state).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_state_from(&path), state);
    }

    #[test]
    fn unreadable_state_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();
        assert_eq!(load_state_from(&path), ClientState::default());
    }
}
