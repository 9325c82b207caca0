//! Request/response calls to the workspace backend.
//!
//! Every call is submitted with [`RemoteApi::submit`] and answered later through
//! [`RemoteApi::poll_responses`], tagged with the id `submit` returned. The
//! HTTP implementation runs each call on its own short-lived thread.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Context as _;
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::{json, Value};

use crate::model::{
    AuthStatus, FileNode, LoginRequest, RegisterRequest, RunOutcome, SystemInfo, UserInfo,
};

#[derive(Clone, Debug, PartialEq)]
pub enum ApiRequest {
    CheckAuth,
    Login(LoginRequest),
    Register(RegisterRequest),
    Logout,
    Tree { path: String },
    Read { path: String },
    Write { path: String, content: String },
    Create { path: String, content: String },
    Mkdir { path: String },
    Rename { old_path: String, new_path: String },
    Delete { path: String },
    RunCode { code: String },
    SystemInfo,
}

impl ApiRequest {
    /// Short human name used in error messages.
    pub fn operation(&self) -> &'static str {
        match self {
            ApiRequest::CheckAuth => "session check",
            ApiRequest::Login(_) => "login",
            ApiRequest::Register(_) => "registration",
            ApiRequest::Logout => "logout",
            ApiRequest::Tree { .. } => "loading file tree",
            ApiRequest::Read { .. } => "opening file",
            ApiRequest::Write { .. } => "saving file",
            ApiRequest::Create { .. } => "creating file",
            ApiRequest::Mkdir { .. } => "creating folder",
            ApiRequest::Rename { .. } => "rename",
            ApiRequest::Delete { .. } => "delete",
            ApiRequest::RunCode { .. } => "run",
            ApiRequest::SystemInfo => "system info",
        }
    }

    fn endpoint(&self) -> &'static str {
        match self {
            ApiRequest::CheckAuth => "/api/check_auth",
            ApiRequest::Login(_) => "/api/login",
            ApiRequest::Register(_) => "/api/register",
            ApiRequest::Logout => "/api/logout",
            ApiRequest::Tree { .. } => "/api/files/tree",
            ApiRequest::Read { .. } => "/api/files/read",
            ApiRequest::Write { .. } => "/api/files/write",
            ApiRequest::Create { .. } => "/api/files/create",
            ApiRequest::Mkdir { .. } => "/api/files/mkdir",
            ApiRequest::Rename { .. } => "/api/files/rename",
            ApiRequest::Delete { .. } => "/api/files/delete",
            ApiRequest::RunCode { .. } => "/api/run_rust",
            ApiRequest::SystemInfo => "/api/system_info",
        }
    }

    /// Query string for GET calls, JSON body for POST calls.
    fn shape(&self) -> RequestShape {
        match self {
            ApiRequest::CheckAuth | ApiRequest::SystemInfo => RequestShape::Get(None),
            ApiRequest::Tree { path } | ApiRequest::Read { path } => {
                RequestShape::Get(Some(path.clone()))
            }
            ApiRequest::Login(req) => RequestShape::Post(json!(req)),
            ApiRequest::Register(req) => RequestShape::Post(json!(req)),
            ApiRequest::Logout => RequestShape::Post(json!({})),
            ApiRequest::Write { path, content } | ApiRequest::Create { path, content } => {
                RequestShape::Post(json!({ "path": path, "content": content }))
            }
            ApiRequest::Mkdir { path } | ApiRequest::Delete { path } => {
                RequestShape::Post(json!({ "path": path }))
            }
            ApiRequest::Rename { old_path, new_path } => {
                RequestShape::Post(json!({ "old_path": old_path, "new_path": new_path }))
            }
            ApiRequest::RunCode { code } => RequestShape::Post(json!({ "code": code })),
        }
    }
}

enum RequestShape {
    Get(Option<String>),
    Post(Value),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ApiReply {
    Auth(AuthStatus),
    LoggedIn(UserInfo),
    Registered,
    LoggedOut,
    Tree(FileNode),
    Content(String),
    Done,
    Run(RunOutcome),
    SystemInfo(SystemInfo),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ApiResponse {
    pub request_id: u64,
    pub result: Result<ApiReply, String>,
}

pub trait RemoteApi {
    /// Issues a call and returns the id its response will carry.
    fn submit(&mut self, request: ApiRequest) -> u64;
    /// Responses completed since the last poll, in completion order.
    fn poll_responses(&mut self) -> Vec<ApiResponse>;
}

fn status_of(body: &Value) -> &str {
    body.get("status").and_then(Value::as_str).unwrap_or("")
}

fn message_of(body: &Value, fallback: &str) -> String {
    body.get("message")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

fn field<T: serde::de::DeserializeOwned>(body: &Value, key: &str) -> Result<T, String> {
    let value = body
        .get(key)
        .cloned()
        .ok_or_else(|| format!("response is missing `{key}`"))?;
    serde_json::from_value(value).map_err(|err| format!("malformed `{key}`: {err}"))
}

/// Interprets a response body for the call that produced it.
pub fn decode_reply(request: &ApiRequest, body: Value) -> Result<ApiReply, String> {
    match request {
        ApiRequest::CheckAuth => serde_json::from_value(body)
            .map(ApiReply::Auth)
            .map_err(|err| format!("malformed session status: {err}")),
        ApiRequest::RunCode { .. } => Ok(ApiReply::Run(match status_of(&body) {
            "success" => RunOutcome::Success {
                output: body
                    .get("output")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                error: body
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                exit_code: body
                    .get("exit_code")
                    .and_then(Value::as_i64)
                    .and_then(|c| i32::try_from(c).ok()),
            },
            "compile_error" => RunOutcome::CompileError {
                output: body
                    .get("output")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            "timeout" => RunOutcome::Timeout,
            _ => RunOutcome::Failed {
                message: message_of(&body, "unknown error"),
            },
        })),
        _ => {
            if status_of(&body) != "success" {
                return Err(message_of(&body, "request failed"));
            }
            match request {
                ApiRequest::Login(_) => field(&body, "data").map(ApiReply::LoggedIn),
                ApiRequest::Register(_) => Ok(ApiReply::Registered),
                ApiRequest::Logout => Ok(ApiReply::LoggedOut),
                ApiRequest::Tree { .. } => field(&body, "tree").map(ApiReply::Tree),
                ApiRequest::Read { .. } => field(&body, "content").map(ApiReply::Content),
                ApiRequest::SystemInfo => field(&body, "data").map(ApiReply::SystemInfo),
                _ => Ok(ApiReply::Done),
            }
        }
    }
}

/// Session cookies captured from HTTP responses, replayed on later calls and
/// on the event-channel handshake.
#[derive(Clone, Debug, Default)]
pub struct CookieJar {
    inner: Arc<Mutex<BTreeMap<String, String>>>,
}

impl CookieJar {
    fn cookies(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records one `Set-Cookie` header value.
    pub fn store(&self, set_cookie: &str) {
        let pair = set_cookie.split(';').next().unwrap_or_default();
        let Some((name, value)) = pair.split_once('=') else {
            return;
        };
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        let mut cookies = self.cookies();
        if value.trim().is_empty() {
            cookies.remove(name);
        } else {
            cookies.insert(name.to_string(), value.trim().to_string());
        }
    }

    /// Value for a `Cookie` request header, if any cookie is held.
    pub fn header_value(&self) -> Option<String> {
        let cookies = self.cookies();
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn clear(&self) {
        self.cookies().clear();
    }
}

pub struct HttpApi {
    base_url: String,
    agent: ureq::Agent,
    cookies: CookieJar,
    next_id: u64,
    tx: Sender<ApiResponse>,
    rx: Receiver<ApiResponse>,
}

impl HttpApi {
    pub fn new(base_url: &str, timeout: Duration, cookies: CookieJar) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let (tx, rx) = unbounded();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
            cookies,
            next_id: 1,
            tx,
            rx,
        }
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }
}

fn perform(
    agent: &ureq::Agent,
    base_url: &str,
    cookies: &CookieJar,
    request: &ApiRequest,
) -> anyhow::Result<Value> {
    let url = format!("{base_url}{}", request.endpoint());
    let mut call = match request.shape() {
        RequestShape::Get(_) => agent.get(&url),
        RequestShape::Post(_) => agent.post(&url),
    };
    if let Some(cookie) = cookies.header_value() {
        call = call.set("Cookie", &cookie);
    }
    let sent = match request.shape() {
        RequestShape::Get(Some(path)) => call.query("path", &path).call(),
        RequestShape::Get(None) => call.call(),
        RequestShape::Post(body) => call.send_json(body),
    };
    let response = match sent {
        Ok(resp) => resp,
        // Error statuses still carry a JSON body with a message.
        Err(ureq::Error::Status(_, resp)) => resp,
        Err(err) => return Err(err).with_context(|| format!("requesting {url}")),
    };
    for value in response.all("set-cookie") {
        cookies.store(value);
    }
    response
        .into_json::<Value>()
        .with_context(|| format!("reading response from {url}"))
}

impl RemoteApi for HttpApi {
    fn submit(&mut self, request: ApiRequest) -> u64 {
        let request_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        let agent = self.agent.clone();
        let base_url = self.base_url.clone();
        let cookies = self.cookies.clone();
        let tx = self.tx.clone();
        tracing::debug!(request_id, operation = request.operation(), "api call");
        let spawned = thread::Builder::new()
            .name("ide-http".to_string())
            .spawn(move || {
                let result = perform(&agent, &base_url, &cookies, &request)
                    .map_err(|err| format!("{err:#}"))
                    .and_then(|body| decode_reply(&request, body));
                let _ = tx.send(ApiResponse { request_id, result });
            });
        if let Err(err) = spawned {
            let _ = self.tx.send(ApiResponse {
                request_id,
                result: Err(format!("could not start request: {err}")),
            });
        }
        request_id
    }

    fn poll_responses(&mut self) -> Vec<ApiResponse> {
        self.rx.try_iter().collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_reply_carries_user() {
        let req = ApiRequest::Login(LoginRequest {
            identifier: "alice".into(),
            password: "pw".into(),
        });
        let body = json!({
            "status": "success",
            "data": {"id": 7, "username": "alice", "email": "a@example.net", "token": "t"}
        });
        let ApiReply::LoggedIn(user) = decode_reply(&req, body).unwrap() else {
            panic!("expected LoggedIn");
        };
        assert_eq!(user.username, "alice");
    }

    #[test]
    fn error_status_becomes_message() {
        let req = ApiRequest::Delete {
            path: "/home/user/x".into(),
        };
        let body = json!({"status": "error", "message": "Permission denied"});
        assert_eq!(decode_reply(&req, body), Err("Permission denied".to_string()));
        assert_eq!(
            decode_reply(&req, json!({})),
            Err("request failed".to_string())
        );
    }

    #[test]
    fn run_outcomes_decode() {
        let req = ApiRequest::RunCode {
            code: "fn main() {}".into(),
        };
        let cases = [
            (
                json!({"status": "success", "output": "hi\n", "exit_code": 0}),
                RunOutcome::Success {
                    output: "hi\n".into(),
                    error: None,
                    exit_code: Some(0),
                },
            ),
            (
                json!({"status": "compile_error", "output": "E0425"}),
                RunOutcome::CompileError {
                    output: "E0425".into(),
                },
            ),
            (json!({"status": "timeout"}), RunOutcome::Timeout),
            (
                json!({"status": "error", "message": "No environment"}),
                RunOutcome::Failed {
                    message: "No environment".into(),
                },
            ),
        ];
        for (body, expected) in cases {
            assert_eq!(decode_reply(&req, body), Ok(ApiReply::Run(expected)));
        }
    }

    #[test]
    fn tree_and_read_payloads() {
        let tree = decode_reply(
            &ApiRequest::Tree {
                path: "/home/user".into(),
            },
            json!({"status": "success", "tree": {"path": "/home/user", "name": "user", "type": "directory", "children": []}}),
        )
        .unwrap();
        assert!(matches!(tree, ApiReply::Tree(node) if node.children == Some(vec![])));

        let missing = decode_reply(
            &ApiRequest::Read {
                path: "/a".into(),
            },
            json!({"status": "success"}),
        );
        assert!(missing.is_err());
    }

    #[test]
    fn cookie_jar_round_trip() {
        let jar = CookieJar::default();
        assert_eq!(jar.header_value(), None);
        jar.store("session=abc123; Path=/; HttpOnly");
        jar.store("theme=dark");
        assert_eq!(jar.header_value().as_deref(), Some("session=abc123; theme=dark"));
        jar.store("session=; Max-Age=0");
        assert_eq!(jar.header_value().as_deref(), Some("theme=dark"));
        jar.clear();
        assert_eq!(jar.header_value(), None);
    }
}
