//! The session context: one owner for the channel, the HTTP client and the four
//! client models.
//!
//! Every mutation happens on the thread that calls [`Session::pump`] or one of
//! the user operations. Network completions arrive as messages and are applied
//! in arrival order.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::api::{ApiReply, ApiRequest, ApiResponse, CookieJar, HttpApi, RemoteApi};
use crate::channel::{Channel, ChannelState, Connector, ServerEvent};
use crate::config::{self, ClientConfig, ClientState};
use crate::error::{Result, SessionError};
use crate::file_tree::{
    path_is_within, remote_file_name, replace_path_prefix, FileTree, LoadApplied, ToggleEffect,
    TreeChange,
};
use crate::init_tracker::{InitState, InitTracker, ProgressEffect};
use crate::model::{EntryKind, LoginRequest, RegisterRequest, RunOutcome, SystemInfo, UserInfo};
use crate::socket::WsConnector;
use crate::state_saver::AsyncStateSaver;
use crate::tabs::{CloseOutcome, OpenAction, TabId, TabManager};
use crate::terminal::{InputFailure, SendOutcome, TerminalController};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// A short user-facing message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub posted_at: Instant,
}

#[derive(Debug)]
enum Pending {
    CheckAuth,
    Login,
    Register,
    Logout,
    TreeLoad { seq: u64 },
    Open { path: String, name: String },
    Save {
        tab: TabId,
        content: String,
        then_run: Option<String>,
    },
    Mutation(TreeChange),
    Run,
    SystemInfo,
}

pub struct Session {
    config: ClientConfig,
    channel: Channel,
    api: Box<dyn RemoteApi>,
    cookies: CookieJar,
    tabs: TabManager,
    tree: FileTree,
    terminal: TerminalController,
    init: InitTracker,
    notices: VecDeque<Notice>,
    user: Option<UserInfo>,
    scratch_buffer: Option<String>,
    saver: Option<AsyncStateSaver>,
    pending: HashMap<u64, Pending>,
    last_run: Option<RunOutcome>,
    last_system_info: Option<SystemInfo>,
}

impl Session {
    pub fn new(config: ClientConfig, connector: Box<dyn Connector>, api: Box<dyn RemoteApi>) -> Self {
        let tree = FileTree::new(config.tree_root.clone(), Default::default());
        let terminal =
            TerminalController::new(config.terminal_start_timeout(), config.strict_terminal_session);
        let init = InitTracker::new(config.init_dismiss());
        Self {
            channel: Channel::new(connector),
            api,
            cookies: CookieJar::default(),
            tabs: TabManager::new(),
            tree,
            terminal,
            init,
            notices: VecDeque::new(),
            user: None,
            scratch_buffer: None,
            saver: None,
            pending: HashMap::new(),
            last_run: None,
            last_system_info: None,
            config,
        }
    }

    /// Restores persisted client state; later changes are written through `saver`.
    pub fn with_state(mut self, state: ClientState, saver: Option<AsyncStateSaver>) -> Self {
        self.tree = FileTree::new(self.config.tree_root.clone(), state.expanded);
        self.scratch_buffer = state.scratch_buffer;
        self.saver = saver;
        self
    }

    pub fn with_cookies(mut self, cookies: CookieJar) -> Self {
        self.cookies = cookies;
        self
    }

    /// Wires up the HTTP client, the WebSocket connector and the state file
    /// named by `config`.
    pub fn from_config(config: ClientConfig) -> anyhow::Result<Self> {
        let cookies = CookieJar::default();
        let api = HttpApi::new(&config.server_url, config.http_timeout(), cookies.clone());
        let connector = WsConnector::new(&config.server_url, cookies.clone(), config.reconnect_backoff())?;
        let state_path = config.resolved_state_path();
        let state = config::load_state_from(&state_path);
        let saver = AsyncStateSaver::new(state_path);
        Ok(Session::new(config, Box::new(connector), Box::new(api))
            .with_cookies(cookies)
            .with_state(state, Some(saver)))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn user(&self) -> Option<&UserInfo> {
        self.user.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn tabs(&self) -> &TabManager {
        &self.tabs
    }

    pub fn tree(&self) -> &FileTree {
        &self.tree
    }

    pub fn terminal(&self) -> &TerminalController {
        &self.terminal
    }

    pub fn init(&self) -> &InitTracker {
        &self.init
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// For subscribing additional handlers.
    pub fn channel_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }

    pub fn scratch_buffer(&self) -> Option<&str> {
        self.scratch_buffer.as_deref()
    }

    pub fn last_run(&self) -> Option<&RunOutcome> {
        self.last_run.as_ref()
    }

    pub fn last_system_info(&self) -> Option<&SystemInfo> {
        self.last_system_info.as_ref()
    }

    pub fn notices(&self) -> impl Iterator<Item = &Notice> {
        self.notices.iter()
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        self.notices.drain(..).collect()
    }

    fn notify(&mut self, level: NoticeLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            NoticeLevel::Error => tracing::warn!(%message, "notice"),
            _ => tracing::info!(%message, "notice"),
        }
        self.notices.push_back(Notice {
            level,
            message,
            posted_at: Instant::now(),
        });
    }

    /// Mirrors an error into the notice queue and hands it back.
    fn surface<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.notify(NoticeLevel::Error, err.to_string());
        }
        result
    }

    fn report_input_failures(&mut self, failures: Vec<InputFailure>) {
        for failure in failures {
            self.notify(
                NoticeLevel::Error,
                format!("Command not sent ({}): {}", failure.error, failure.input),
            );
        }
    }

    fn require_auth(&self) -> Result<()> {
        if self.user.is_none() {
            return Err(SessionError::NotAuthenticated);
        }
        Ok(())
    }

    fn submit(&mut self, request: ApiRequest, purpose: Pending) -> u64 {
        let id = self.api.submit(request);
        self.pending.insert(id, purpose);
        id
    }

    fn persist(&self) {
        if let Some(saver) = self.saver.as_ref() {
            saver.request_save(ClientState {
                expanded: self.tree.expansion_flags().clone(),
                scratch_buffer: self.scratch_buffer.clone(),
            });
        }
    }

    // Authentication

    pub fn check_auth(&mut self) {
        self.submit(ApiRequest::CheckAuth, Pending::CheckAuth);
    }

    pub fn login(&mut self, identifier: &str, password: &str) -> Result<()> {
        let request = LoginRequest {
            identifier: identifier.trim().to_string(),
            password: password.to_string(),
        };
        let valid = request.validate();
        self.surface(valid)?;
        self.submit(ApiRequest::Login(request), Pending::Login);
        Ok(())
    }

    pub fn register(&mut self, username: &str, email: &str, password: &str) -> Result<()> {
        let request = RegisterRequest {
            username: username.trim().to_string(),
            email: email.trim().to_string(),
            password: password.to_string(),
        };
        let valid = request.validate();
        self.surface(valid)?;
        self.submit(ApiRequest::Register(request), Pending::Register);
        Ok(())
    }

    /// Ends the session locally right away; the server call is best-effort.
    pub fn logout(&mut self) {
        if self.user.is_some() {
            self.submit(ApiRequest::Logout, Pending::Logout);
        }
        self.teardown();
        self.notify(NoticeLevel::Info, "Logged out");
    }

    fn teardown(&mut self) {
        tracing::info!("session torn down");
        self.user = None;
        self.channel.disconnect();
        self.tabs.reset();
        self.tree.reset();
        self.terminal.reset();
        self.init.reset();
        self.last_run = None;
        // Answers to anything issued before now belong to the old session.
        self.pending.retain(|_, p| matches!(p, Pending::Logout));
        self.cookies.clear();
    }

    fn on_authenticated(&mut self, user: UserInfo, environment_initialized: Option<bool>) {
        tracing::info!(username = %user.username, "authenticated");
        self.user = Some(user);
        self.tabs.reset();
        self.terminal.reset();
        self.init.reset();
        match environment_initialized {
            Some(true) => self.init.mark_initialized(),
            Some(false) => self.init.mark_needs_decision(),
            None => {}
        }
        // Reconnect so the handshake carries the fresh session cookie.
        self.channel.disconnect();
        let connected = self.channel.connect();
        let _ = self.surface(connected);
        self.issue_tree_load();
    }

    // Files and tabs

    pub fn reload_tree(&mut self) -> Result<()> {
        let auth = self.require_auth();
        self.surface(auth)?;
        self.issue_tree_load();
        Ok(())
    }

    fn issue_tree_load(&mut self) {
        let seq = self.tree.begin_load();
        let path = self.tree.root_path().to_string();
        self.submit(ApiRequest::Tree { path }, Pending::TreeLoad { seq });
    }

    pub fn toggle_dir(&mut self, path: &str) -> Result<ToggleEffect> {
        let toggled = self.tree.toggle(path);
        let effect = self.surface(toggled)?;
        self.persist();
        if effect == ToggleEffect::NeedsLoad {
            self.issue_tree_load();
        }
        Ok(effect)
    }

    pub fn open_file(&mut self, path: &str) -> Result<Option<TabId>> {
        let auth = self.require_auth();
        self.surface(auth)?;
        match self.tabs.open(path) {
            OpenAction::Activated(id) => Ok(Some(id)),
            OpenAction::Pending => Ok(None),
            OpenAction::Fetch => {
                let name = self
                    .tree
                    .find(path)
                    .map(|n| n.name.clone())
                    .unwrap_or_else(|| remote_file_name(path).to_string());
                self.submit(
                    ApiRequest::Read {
                        path: path.to_string(),
                    },
                    Pending::Open {
                        path: path.to_string(),
                        name,
                    },
                );
                Ok(None)
            }
        }
    }

    pub fn activate_tab(&mut self, id: TabId) -> Result<()> {
        let activated = self.tabs.activate(id);
        self.surface(activated)
    }

    /// Edits the active tab, or the scratch buffer when no tab is open.
    pub fn edit(&mut self, content: &str) -> Result<()> {
        if self.tabs.is_empty() {
            self.scratch_buffer = Some(content.to_string());
            self.persist();
            return Ok(());
        }
        let edited = self.tabs.edit(content.to_string()).map(|_| ());
        self.surface(edited)
    }

    pub fn save(&mut self) -> Result<()> {
        let saved = self.issue_save(None);
        self.surface(saved)
    }

    fn issue_save(&mut self, then_run: Option<String>) -> Result<()> {
        self.require_auth()?;
        let request = self.tabs.save()?;
        self.submit(
            ApiRequest::Write {
                path: request.path,
                content: request.content.clone(),
            },
            Pending::Save {
                tab: request.tab,
                content: request.content,
                then_run,
            },
        );
        Ok(())
    }

    pub fn close_tab(&mut self, id: TabId) -> Result<CloseOutcome> {
        let outcome = self.tabs.request_close(id);
        self.surface(outcome)
    }

    pub fn confirm_close(&mut self, id: TabId) -> Result<()> {
        let closed = self.tabs.confirm_close(id);
        self.surface(closed)
    }

    pub fn cancel_close(&mut self, id: TabId) {
        self.tabs.cancel_close(id);
    }

    pub fn create_file(&mut self, parent: &str, name: &str) -> Result<()> {
        let planned = self.tree.plan_create(parent, name, EntryKind::File);
        let change = self.surface(planned)?;
        self.issue_mutation(change)
    }

    pub fn create_dir(&mut self, parent: &str, name: &str) -> Result<()> {
        let planned = self.tree.plan_create(parent, name, EntryKind::Directory);
        let change = self.surface(planned)?;
        self.issue_mutation(change)
    }

    pub fn rename(&mut self, path: &str, new_name: &str) -> Result<()> {
        let planned = self.tree.plan_rename(path, new_name);
        let change = self.surface(planned)?;
        self.issue_mutation(change)
    }

    pub fn delete(&mut self, path: &str) -> Result<()> {
        let planned = self.tree.plan_delete(path);
        let change = self.surface(planned)?;
        self.issue_mutation(change)
    }

    fn issue_mutation(&mut self, change: TreeChange) -> Result<()> {
        let auth = self.require_auth();
        self.surface(auth)?;
        let request = match &change {
            TreeChange::Created {
                path,
                kind: EntryKind::File,
            } => ApiRequest::Create {
                path: path.clone(),
                content: self.config.new_file_template.clone(),
            },
            TreeChange::Created {
                path,
                kind: EntryKind::Directory,
            } => ApiRequest::Mkdir { path: path.clone() },
            TreeChange::Renamed { old_path, new_path } => ApiRequest::Rename {
                old_path: old_path.clone(),
                new_path: new_path.clone(),
            },
            TreeChange::Deleted { path } => ApiRequest::Delete { path: path.clone() },
        };
        self.submit(request, Pending::Mutation(change));
        Ok(())
    }

    fn apply_mutation(&mut self, change: TreeChange) {
        self.tree.apply_change(&change);
        let message = match &change {
            TreeChange::Created {
                kind: EntryKind::File,
                ..
            } => "File created".to_string(),
            TreeChange::Created { .. } => "Folder created".to_string(),
            TreeChange::Renamed { old_path, new_path } => {
                self.tabs.reconcile_rename(old_path, new_path);
                for purpose in self.pending.values_mut() {
                    if let Pending::Open { path, name } = purpose {
                        if let Some(moved) = replace_path_prefix(path, old_path, new_path) {
                            *name = remote_file_name(&moved).to_string();
                            *path = moved;
                        }
                    }
                }
                "Renamed".to_string()
            }
            TreeChange::Deleted { path } => {
                // Reads still in flight would resurrect a tab for a missing file.
                self.pending.retain(|_, purpose| {
                    !matches!(purpose, Pending::Open { path: open, .. } if path_is_within(open, path))
                });
                let removed = self.tabs.reconcile_delete(path);
                let discarded = removed.iter().filter(|t| t.dirty).count();
                if discarded > 0 {
                    format!("Deleted; {discarded} unsaved tab(s) discarded")
                } else {
                    "Deleted".to_string()
                }
            }
        };
        self.notify(NoticeLevel::Success, message);
        self.persist();
        self.issue_tree_load();
    }

    // Terminal and environment

    pub fn send_terminal_input(&mut self, text: &str, now: Instant) -> Result<SendOutcome> {
        let sent = self.terminal.send_input(&mut self.channel, text, now);
        self.surface(sent)
    }

    pub fn start_init(&mut self) -> Result<()> {
        let auth = self.require_auth();
        self.surface(auth)?;
        let started = self.init.start(&mut self.channel);
        self.surface(started)
    }

    pub fn skip_init(&mut self) -> Result<()> {
        let skipped = self.init.skip();
        self.surface(skipped)
    }

    fn request_init_status(&mut self) {
        let requested = self.init.request_status(&mut self.channel);
        let _ = self.surface(requested);
    }

    // Run and status

    /// Runs the active tab's buffer (saving it first) or the scratch buffer.
    pub fn run_code(&mut self) -> Result<()> {
        let auth = self.require_auth();
        self.surface(auth)?;
        if let Some(tab) = self.tabs.active() {
            let code = tab.buffered_content.clone();
            let saved = self.issue_save(Some(code));
            return self.surface(saved);
        }
        let code = self.scratch_buffer.clone().unwrap_or_default();
        if code.trim().is_empty() {
            return self.surface(Err(SessionError::validation("There is no code to run")));
        }
        self.submit(ApiRequest::RunCode { code }, Pending::Run);
        Ok(())
    }

    pub fn system_info(&mut self) {
        self.submit(ApiRequest::SystemInfo, Pending::SystemInfo);
    }

    // Event loop

    /// Applies finished HTTP calls, then channel events, then timers. Notices
    /// older than the configured lifetime are dropped first.
    pub fn pump(&mut self, now: Instant) -> Vec<ServerEvent> {
        let ttl = self.config.notice_ttl();
        self.expire_notices(now, ttl);

        for response in self.api.poll_responses() {
            self.handle_response(response);
        }

        let events = self.channel.poll();
        for event in &events {
            self.route_event(event, now);
        }

        let expired = self.terminal.tick(now);
        self.report_input_failures(expired);
        self.init.tick(now);
        events
    }

    fn expire_notices(&mut self, now: Instant, ttl: Duration) {
        while let Some(front) = self.notices.front() {
            if now.saturating_duration_since(front.posted_at) < ttl {
                break;
            }
            self.notices.pop_front();
        }
    }

    fn route_event(&mut self, event: &ServerEvent, now: Instant) {
        match event {
            ServerEvent::Connected(_) => {
                if self.user.is_some()
                    && matches!(
                        self.init.state(),
                        InitState::NotStarted | InitState::AwaitingDecision
                    )
                {
                    self.request_init_status();
                }
            }
            ServerEvent::TerminalOutput {
                output,
                terminal_id,
            } => {
                self.terminal.on_output(output, terminal_id.as_deref());
            }
            ServerEvent::TerminalStarted { terminal_id } => {
                let failures = self.terminal.on_started(&mut self.channel, terminal_id.clone());
                self.report_input_failures(failures);
            }
            ServerEvent::InitializationStatus(status) => self.init.on_status(status),
            ServerEvent::InitializationProgress(progress) => {
                match self.init.on_progress(progress, now) {
                    ProgressEffect::Failed(message) => {
                        self.notify(NoticeLevel::Error, format!("Initialization failed: {message}"))
                    }
                    ProgressEffect::Completed => {
                        self.notify(NoticeLevel::Success, "Environment initialization complete")
                    }
                    ProgressEffect::Updated | ProgressEffect::Ignored => {}
                }
            }
            ServerEvent::Disconnected { .. } => {
                let failures = self.terminal.on_disconnected();
                self.report_input_failures(failures);
                if self.user.is_some() {
                    self.notify(NoticeLevel::Info, "Connection lost, reconnecting...");
                }
            }
            ServerEvent::Reconnected => {
                let failures = self.terminal.on_disconnected();
                self.report_input_failures(failures);
                let requeried = self.init.on_reconnected(&mut self.channel);
                let _ = self.surface(requeried);
                self.notify(NoticeLevel::Success, "Connection restored");
            }
        }
    }

    fn handle_response(&mut self, response: ApiResponse) {
        let Some(purpose) = self.pending.remove(&response.request_id) else {
            tracing::debug!(request_id = response.request_id, "ignoring response for unknown request");
            return;
        };
        let result = response.result;
        match purpose {
            Pending::CheckAuth => match result {
                Ok(ApiReply::Auth(status)) => match (status.authenticated, status.user) {
                    (true, Some(user)) => {
                        self.notify(NoticeLevel::Success, "Signed in automatically");
                        self.on_authenticated(user, Some(status.environment_initialized));
                    }
                    _ => tracing::debug!("no existing session"),
                },
                other => tracing::debug!(reply = ?other, "session check failed"),
            },
            Pending::Login => match result {
                Ok(ApiReply::LoggedIn(user)) => {
                    self.notify(NoticeLevel::Success, "Login successful");
                    self.on_authenticated(user, None);
                }
                other => self.remote_failure("login", other),
            },
            Pending::Register => match result {
                Ok(ApiReply::Registered) => {
                    self.notify(NoticeLevel::Success, "Registration successful, please log in")
                }
                other => self.remote_failure("registration", other),
            },
            Pending::Logout => {
                if let Err(message) = result {
                    tracing::warn!(%message, "server logout failed");
                }
            }
            Pending::TreeLoad { seq } => {
                let snapshot = match result {
                    Ok(ApiReply::Tree(node)) => Ok(node),
                    Ok(other) => Err(format!("unexpected reply: {other:?}")),
                    Err(message) => Err(message),
                };
                if self.tree.apply_load(seq, snapshot) == LoadApplied::Failed {
                    let message = self.tree.last_error().unwrap_or_default().to_string();
                    self.notify(
                        NoticeLevel::Error,
                        SessionError::remote("loading file tree", message).to_string(),
                    );
                }
            }
            Pending::Open { path, name } => match result {
                Ok(ApiReply::Content(content)) => {
                    self.tabs.complete_open(&path, &name, content);
                }
                other => {
                    self.tabs.fail_open(&path);
                    self.remote_failure("opening file", other);
                }
            },
            Pending::Save {
                tab,
                content,
                then_run,
            } => match result {
                Ok(ApiReply::Done) => {
                    if self.tabs.complete_save(tab, content) {
                        self.notify(NoticeLevel::Success, "File saved");
                    }
                    if let Some(code) = then_run {
                        self.submit(ApiRequest::RunCode { code }, Pending::Run);
                    }
                }
                other => {
                    self.tabs.fail_save(tab);
                    self.remote_failure("saving file", other);
                    if then_run.is_some() {
                        self.notify(NoticeLevel::Info, "Run skipped because the file was not saved");
                    }
                }
            },
            Pending::Mutation(change) => match result {
                Ok(ApiReply::Done) => self.apply_mutation(change),
                other => {
                    let operation = match change {
                        TreeChange::Created {
                            kind: EntryKind::File,
                            ..
                        } => "creating file",
                        TreeChange::Created { .. } => "creating folder",
                        TreeChange::Renamed { .. } => "rename",
                        TreeChange::Deleted { .. } => "delete",
                    };
                    self.remote_failure(operation, other);
                }
            },
            Pending::Run => {
                let outcome = match result {
                    Ok(ApiReply::Run(outcome)) => outcome,
                    Ok(other) => RunOutcome::Failed {
                        message: format!("unexpected reply: {other:?}"),
                    },
                    Err(message) => RunOutcome::Failed { message },
                };
                self.last_run = Some(outcome);
            }
            Pending::SystemInfo => match result {
                Ok(ApiReply::SystemInfo(info)) => {
                    self.notify(NoticeLevel::Info, info.summary());
                    self.last_system_info = Some(info);
                }
                other => self.remote_failure("system info", other),
            },
        }
    }

    fn remote_failure(&mut self, operation: &'static str, result: std::result::Result<ApiReply, String>) {
        let message = match result {
            Err(message) => message,
            Ok(other) => format!("unexpected reply: {other:?}"),
        };
        self.notify(
            NoticeLevel::Error,
            SessionError::remote(operation, message).to_string(),
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.channel.disconnect();
        if let Some(saver) = self.saver.as_ref() {
            saver.flush(Duration::from_secs(2));
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::api::fake::FakeApi;
    use crate::channel::test_link::MemoryConnector;
    use crate::channel::EventSink;
    use crate::model::{FileNode, InitProgress, InitStatusSnapshot};
    use crate::terminal::TerminalState;

    struct Harness {
        session: Session,
        api: FakeApi,
        link: MemoryConnector,
    }

    fn user() -> UserInfo {
        UserInfo {
            id: json!(1),
            username: "alice".into(),
            email: "alice@example.net".into(),
        }
    }

    fn tree_snapshot(files: &[&str]) -> FileNode {
        FileNode {
            path: "/home/user".into(),
            name: "user".into(),
            kind: EntryKind::Directory,
            extension: None,
            children: Some(
                files
                    .iter()
                    .map(|f| FileNode {
                        path: format!("/home/user/{f}"),
                        name: f.to_string(),
                        kind: EntryKind::File,
                        extension: Some(".rs".into()),
                        children: None,
                    })
                    .collect(),
            ),
        }
    }

    /// Logs in, brings the channel up and applies an initial tree.
    fn logged_in() -> Harness {
        let api = FakeApi::default();
        let link = MemoryConnector::default();
        let mut session = Session::new(
            ClientConfig::default(),
            Box::new(link.clone()),
            Box::new(api.clone()),
        );
        session.login("alice", "pw").unwrap();
        let (id, _) = api.last();
        api.reply(id, Ok(ApiReply::LoggedIn(user())));
        let now = Instant::now();
        session.pump(now);
        assert!(session.is_authenticated());

        let (tree_id, req) = api.last();
        assert!(matches!(req, ApiRequest::Tree { .. }));
        api.reply(tree_id, Ok(ApiReply::Tree(tree_snapshot(&["a.rs", "b.rs"]))));
        link.last().up();
        session.pump(now);
        assert!(session.channel.is_connected());
        session.drain_notices();
        Harness { session, api, link }
    }

    fn open(h: &mut Harness, path: &str, content: &str) -> TabId {
        h.session.open_file(path).unwrap();
        let (id, _) = h.api.last();
        h.api.reply(id, Ok(ApiReply::Content(content.into())));
        h.session.pump(Instant::now());
        h.session.tabs().find_by_path(path).unwrap().id
    }

    #[test]
    fn operations_require_login() {
        let api = FakeApi::default();
        let mut session = Session::new(
            ClientConfig::default(),
            Box::new(MemoryConnector::default()),
            Box::new(api.clone()),
        );
        assert_eq!(session.open_file("/x"), Err(SessionError::NotAuthenticated));
        assert_eq!(api.count(), 0);
        assert_eq!(session.drain_notices().len(), 1);
    }

    #[test]
    fn login_validation_makes_no_call() {
        let api = FakeApi::default();
        let mut session = Session::new(
            ClientConfig::default(),
            Box::new(MemoryConnector::default()),
            Box::new(api.clone()),
        );
        assert!(matches!(session.login("", "pw"), Err(SessionError::Validation(_))));
        assert_eq!(api.count(), 0);
    }

    #[test]
    fn connect_queries_initialization_status() {
        let h = logged_in();
        assert_eq!(
            h.link.last().emitted(),
            vec![crate::channel::ClientEvent::CheckInitialization]
        );
    }

    #[test]
    fn status_is_queried_when_first_attempt_fails() {
        let api = FakeApi::default();
        let link = MemoryConnector::default();
        let mut session = Session::new(
            ClientConfig::default(),
            Box::new(link.clone()),
            Box::new(api.clone()),
        );
        session.login("alice", "pw").unwrap();
        let (id, _) = api.last();
        api.reply(id, Ok(ApiReply::LoggedIn(user())));
        let now = Instant::now();
        session.pump(now);

        link.last().down();
        session.pump(now);
        assert_eq!(session.channel_state(), ChannelState::Connecting);
        link.last().up();
        let events = session.pump(now);
        assert!(matches!(events.as_slice(), [ServerEvent::Connected(_)]));
        assert_eq!(
            link.last().emitted(),
            vec![crate::channel::ClientEvent::CheckInitialization]
        );
    }

    #[test]
    fn read_in_flight_follows_rename() {
        let mut h = logged_in();
        h.session.open_file("/home/user/a.rs").unwrap();
        let (read_id, _) = h.api.last();
        h.session.rename("/home/user/a.rs", "c.rs").unwrap();
        let (rename_id, _) = h.api.last();
        h.api.reply(rename_id, Ok(ApiReply::Done));
        h.session.pump(Instant::now());

        h.api.reply(read_id, Ok(ApiReply::Content("fn a() {}".into())));
        h.session.pump(Instant::now());
        let paths: Vec<_> = h.session.tabs().tabs().iter().map(|t| t.path.clone()).collect();
        assert_eq!(paths, vec!["/home/user/c.rs"]);
        assert_eq!(h.session.tabs().active().unwrap().name, "c.rs");
    }

    #[test]
    fn read_in_flight_is_dropped_by_delete() {
        let mut h = logged_in();
        h.session.open_file("/home/user/a.rs").unwrap();
        let (read_id, _) = h.api.last();
        h.session.delete("/home/user/a.rs").unwrap();
        let (delete_id, _) = h.api.last();
        h.api.reply(delete_id, Ok(ApiReply::Done));
        h.session.pump(Instant::now());

        h.api.reply(read_id, Ok(ApiReply::Content("fn a() {}".into())));
        h.session.pump(Instant::now());
        assert!(h.session.tabs().is_empty());
        assert!(!h.session.tabs().is_opening("/home/user/a.rs"));
    }

    #[test]
    fn failed_save_skips_the_run() {
        let mut h = logged_in();
        open(&mut h, "/home/user/a.rs", "fn main() {}");
        h.session.edit("fn main() { panic!() }").unwrap();
        h.session.run_code().unwrap();
        let (save_id, _) = h.api.last();
        let calls = h.api.count();
        h.api.reply(save_id, Err("read-only file system".into()));
        h.session.pump(Instant::now());

        assert_eq!(h.api.count(), calls);
        assert!(h.session.last_run().is_none());
        assert!(h.session.tabs().active().unwrap().dirty);
        let notices = h.session.drain_notices();
        assert!(notices.iter().any(|n| n.message.contains("read-only")));
        assert!(notices.iter().any(|n| n.message.contains("Run skipped")));
    }

    #[test]
    fn failed_save_reports_and_keeps_dirty() {
        let mut h = logged_in();
        let id = open(&mut h, "/home/user/a.rs", "fn a() {}");
        h.session.edit("fn a() { todo!() }").unwrap();
        h.session.save().unwrap();
        let (req_id, _) = h.api.last();
        h.api.reply(req_id, Err("disk full".into()));
        h.session.pump(Instant::now());
        assert!(h.session.tabs().get(id).unwrap().dirty);
        let notices = h.session.drain_notices();
        assert_eq!(notices[0].level, NoticeLevel::Error);
        assert!(notices[0].message.contains("disk full"));
    }

    #[test]
    fn rename_reconciles_tab_and_reloads() {
        let mut h = logged_in();
        let id = open(&mut h, "/home/user/a.rs", "x");
        h.session.edit("y").unwrap();
        h.session.rename("/home/user/a.rs", "c.rs").unwrap();
        let (req_id, req) = h.api.last();
        assert_eq!(
            req,
            ApiRequest::Rename {
                old_path: "/home/user/a.rs".into(),
                new_path: "/home/user/c.rs".into()
            }
        );
        h.api.reply(req_id, Ok(ApiReply::Done));
        h.session.pump(Instant::now());

        let tab = h.session.tabs().get(id).unwrap();
        assert_eq!(tab.path, "/home/user/c.rs");
        assert_eq!(tab.name, "c.rs");
        assert!(tab.dirty);
        assert!(matches!(h.api.last().1, ApiRequest::Tree { .. }));
    }

    #[test]
    fn failed_mutation_leaves_tabs_alone() {
        let mut h = logged_in();
        let id = open(&mut h, "/home/user/a.rs", "x");
        h.session.delete("/home/user/a.rs").unwrap();
        let calls = h.api.count();
        let (req_id, _) = h.api.last();
        h.api.reply(req_id, Err("busy".into()));
        h.session.pump(Instant::now());
        assert!(h.session.tabs().get(id).is_some());
        assert_eq!(h.api.count(), calls);
    }

    #[test]
    fn create_file_uses_template() {
        let mut h = logged_in();
        h.session.create_file("/home/user", "new.rs").unwrap();
        assert_eq!(
            h.api.last().1,
            ApiRequest::Create {
                path: "/home/user/new.rs".into(),
                content: "// New file created\n".into()
            }
        );
    }

    #[test]
    fn edit_without_tabs_goes_to_scratch_buffer() {
        let mut h = logged_in();
        h.session.edit("fn main() {}").unwrap();
        assert_eq!(h.session.scratch_buffer(), Some("fn main() {}"));
        h.session.run_code().unwrap();
        assert_eq!(
            h.api.last().1,
            ApiRequest::RunCode {
                code: "fn main() {}".into()
            }
        );
    }

    #[test]
    fn run_saves_active_tab_first() {
        let mut h = logged_in();
        open(&mut h, "/home/user/a.rs", "fn main() {}");
        h.session.run_code().unwrap();
        let (save_id, save) = h.api.last();
        assert!(matches!(save, ApiRequest::Write { .. }));
        h.api.reply(save_id, Ok(ApiReply::Done));
        h.session.pump(Instant::now());
        let (run_id, run) = h.api.last();
        assert!(matches!(run, ApiRequest::RunCode { .. }));
        h.api.reply(run_id, Ok(ApiReply::Run(RunOutcome::Timeout)));
        h.session.pump(Instant::now());
        assert_eq!(h.session.last_run(), Some(&RunOutcome::Timeout));
    }

    #[test]
    fn terminal_flow_over_channel() {
        let mut h = logged_in();
        h.link.last().emitted();
        let now = Instant::now();
        assert_eq!(
            h.session.send_terminal_input("ls", now),
            Ok(SendOutcome::Queued)
        );
        h.link.last().push(ServerEvent::TerminalStarted {
            terminal_id: "t-1".into(),
        });
        for chunk in ["a", "b", "c"] {
            h.link.last().push(ServerEvent::TerminalOutput {
                output: chunk.into(),
                terminal_id: Some("t-1".into()),
            });
        }
        h.session.pump(now);
        assert_eq!(h.session.terminal().transcript(), "abc");
        assert_eq!(
            h.link.last().emitted(),
            vec![
                crate::channel::ClientEvent::StartTerminal,
                crate::channel::ClientEvent::TerminalInput { input: "ls".into() },
            ]
        );
    }

    #[test]
    fn connection_loss_resets_terminal() {
        let mut h = logged_in();
        let now = Instant::now();
        h.link.last().push(ServerEvent::TerminalStarted {
            terminal_id: "t-1".into(),
        });
        h.session.pump(now);
        h.link.last().down();
        h.session.pump(now);
        assert_eq!(h.session.terminal().state(), &TerminalState::Absent);
        assert_eq!(
            h.session.send_terminal_input("ls", now),
            Err(SessionError::NotConnected)
        );
        assert_eq!(h.session.terminal().queued_inputs(), 0);
    }

    #[test]
    fn initialization_progress_flows_to_tracker() {
        let mut h = logged_in();
        let now = Instant::now();
        h.link
            .last()
            .push(ServerEvent::InitializationStatus(InitStatusSnapshot::default()));
        h.session.pump(now);
        assert_eq!(h.session.init().state(), &InitState::AwaitingDecision);
        h.session.start_init().unwrap();
        h.link.last().push(ServerEvent::InitializationProgress(InitProgress {
            stage: "complete".into(),
            percent: 100.0,
            message: "done".into(),
        }));
        h.session.pump(now);
        assert_eq!(h.session.init().state(), &InitState::Complete);
        h.session.pump(now + Duration::from_secs(3));
        assert_eq!(h.session.init().state(), &InitState::Dismissed);
    }

    #[test]
    fn logout_resets_everything_and_ignores_late_replies() {
        let mut h = logged_in();
        open(&mut h, "/home/user/a.rs", "x");
        h.session.open_file("/home/user/b.rs").unwrap();
        let (late_id, _) = h.api.last();
        h.session.logout();

        assert!(!h.session.is_authenticated());
        assert!(h.session.tabs().is_empty());
        assert!(h.session.tree().root().is_none());
        assert_eq!(h.session.terminal().transcript(), "");
        assert_eq!(h.session.init().state(), &InitState::NotStarted);
        assert_eq!(h.session.channel_state(), ChannelState::Disconnected);

        h.api.reply(late_id, Ok(ApiReply::Content("late".into())));
        h.session.pump(Instant::now());
        assert!(h.session.tabs().is_empty());
    }

    #[test]
    fn stale_tree_reply_is_discarded() {
        let mut h = logged_in();
        h.session.reload_tree().unwrap();
        let (first, _) = h.api.last();
        h.session.reload_tree().unwrap();
        let (second, _) = h.api.last();
        h.api.reply(second, Ok(ApiReply::Tree(tree_snapshot(&["new.rs"]))));
        h.api.reply(first, Ok(ApiReply::Tree(tree_snapshot(&["old.rs"]))));
        h.session.pump(Instant::now());
        assert!(h.session.tree().find("/home/user/new.rs").is_some());
        assert!(h.session.tree().find("/home/user/old.rs").is_none());
    }

    #[test]
    fn notices_expire() {
        let mut h = logged_in();
        h.session.system_info();
        let (id, _) = h.api.last();
        h.api.reply(id, Ok(ApiReply::SystemInfo(SystemInfo::default())));
        let now = Instant::now();
        h.session.pump(now);
        assert!(h.session.notices().count() >= 1);
        h.session.pump(now + Duration::from_secs(6));
        assert_eq!(h.session.notices().count(), 0);
    }
}
