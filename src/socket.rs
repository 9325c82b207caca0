//! WebSocket transport for the event channel.
//!
//! Speaks Engine.IO v4 / Socket.IO v5 text framing on a dedicated worker thread
//! running a current-thread tokio runtime. The worker reconnects with
//! exponential backoff until told to stop.

use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, COOKIE};
use tokio_tungstenite::tungstenite::Message;

use crate::api::CookieJar;
use crate::channel::{ClientEvent, Connector, LinkCommand, LinkEvent, LinkHandles, ServerEvent};

const READ_POLL_INTERVAL: Duration = Duration::from_millis(30);
const SOCKET_PATH: &str = "/socket.io/?EIO=4&transport=websocket";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    Open(Value),
    Close,
    Ping,
    Pong,
    /// Namespace connect acknowledged; carries the payload, e.g. `{"sid": ..}`.
    Connect(Option<Value>),
    ConnectError(Value),
    NamespaceDisconnect,
    Event { name: String, payload: Value },
    Unknown,
}

fn parse_json(text: &str) -> Option<Value> {
    if text.is_empty() {
        return None;
    }
    serde_json::from_str(text).ok()
}

pub(crate) fn decode_frame(text: &str) -> Frame {
    let mut chars = text.chars();
    match chars.next() {
        Some('0') => Frame::Open(parse_json(chars.as_str()).unwrap_or(Value::Null)),
        Some('1') => Frame::Close,
        Some('2') => Frame::Ping,
        Some('3') => Frame::Pong,
        Some('4') => {
            let kind = chars.next();
            let body = chars.as_str();
            // Default namespace only; a `/nsp,` prefix is not used by this server.
            match kind {
                Some('0') => Frame::Connect(parse_json(body)),
                Some('1') => Frame::NamespaceDisconnect,
                Some('2') => decode_event(body),
                Some('4') => Frame::ConnectError(parse_json(body).unwrap_or(Value::Null)),
                _ => Frame::Unknown,
            }
        }
        _ => Frame::Unknown,
    }
}

fn decode_event(body: &str) -> Frame {
    // An ack id may precede the array.
    let body = body.trim_start_matches(|c: char| c.is_ascii_digit());
    let Some(Value::Array(mut items)) = parse_json(body) else {
        return Frame::Unknown;
    };
    if items.is_empty() {
        return Frame::Unknown;
    }
    let Value::String(name) = items.remove(0) else {
        return Frame::Unknown;
    };
    let payload = if items.is_empty() {
        Value::Null
    } else {
        items.remove(0)
    };
    Frame::Event { name, payload }
}

pub(crate) fn encode_event(event: &ClientEvent) -> String {
    let mut items = vec![Value::String(event.name().to_string())];
    if let Some(payload) = event.payload() {
        items.push(payload);
    }
    format!("42{}", Value::Array(items))
}

/// Maps the HTTP base URL to the Socket.IO WebSocket endpoint.
pub fn socket_url(server_url: &str) -> anyhow::Result<String> {
    let server_url = server_url.trim().trim_end_matches('/');
    let rest = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if server_url.starts_with("ws://") || server_url.starts_with("wss://") {
        server_url.to_string()
    } else {
        return Err(anyhow!("unsupported server URL: {server_url}"));
    };
    Ok(format!("{rest}{SOCKET_PATH}"))
}

pub struct WsConnector {
    url: String,
    cookies: CookieJar,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl WsConnector {
    pub fn new(server_url: &str, cookies: CookieJar, backoff: (Duration, Duration)) -> anyhow::Result<Self> {
        Ok(Self {
            url: socket_url(server_url)?,
            cookies,
            initial_backoff: backoff.0,
            max_backoff: backoff.1,
        })
    }
}

impl Connector for WsConnector {
    fn open(&self) -> anyhow::Result<LinkHandles> {
        let (cmd_tx, cmd_rx) = unbounded();
        let (ev_tx, ev_rx) = unbounded();
        let url = self.url.clone();
        let cookies = self.cookies.clone();
        let backoff = (self.initial_backoff, self.max_backoff);
        let worker = thread::Builder::new()
            .name("ide-socket".to_string())
            .spawn(move || {
                tracing::info!(%url, "starting socket worker");
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt.block_on(run_link(url, cookies, backoff, cmd_rx, &ev_tx)),
                    Err(err) => tracing::error!("failed to create async runtime: {err}"),
                }
                let _ = ev_tx.send(LinkEvent::Closed);
            })
            .context("spawning socket worker")?;
        Ok(LinkHandles {
            commands: cmd_tx,
            events: ev_rx,
            worker: Some(worker),
        })
    }
}

enum ConnectionEnd {
    /// Disconnect was requested, or the owning channel is gone.
    Requested,
    Lost(String),
}

async fn run_link(
    url: String,
    cookies: CookieJar,
    backoff: (Duration, Duration),
    commands: Receiver<LinkCommand>,
    events: &Sender<LinkEvent>,
) {
    let (initial, max) = backoff;
    let mut delay = initial;
    loop {
        let mut was_up = false;
        let reason = match run_connection(&url, &cookies, &commands, events, &mut was_up).await {
            Ok(ConnectionEnd::Requested) => {
                tracing::info!("socket disconnected on request");
                return;
            }
            Ok(ConnectionEnd::Lost(reason)) => reason,
            Err(err) => format!("{err:#}"),
        };
        if was_up {
            delay = initial;
        }
        tracing::warn!(%reason, retry_in = ?delay, "socket link down");
        if events.send(LinkEvent::Down { reason }).is_err() {
            return;
        }
        if wait_for_retry(&commands, delay).await {
            return;
        }
        delay = (delay * 2).min(max);
    }
}

/// Sleeps for `delay` while watching for a disconnect request. Returns true if
/// the link should stop.
async fn wait_for_retry(commands: &Receiver<LinkCommand>, delay: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    while tokio::time::Instant::now() < deadline {
        loop {
            match commands.try_recv() {
                Ok(LinkCommand::Disconnect) | Err(TryRecvError::Disconnected) => return true,
                Ok(LinkCommand::Emit(event)) => {
                    tracing::debug!(event = event.name(), "dropping emit while reconnecting");
                }
                Err(TryRecvError::Empty) => break,
            }
        }
        tokio::time::sleep(READ_POLL_INTERVAL).await;
    }
    false
}

async fn run_connection(
    url: &str,
    cookies: &CookieJar,
    commands: &Receiver<LinkCommand>,
    events: &Sender<LinkEvent>,
    was_up: &mut bool,
) -> anyhow::Result<ConnectionEnd> {
    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid socket URL {url}"))?;
    if let Some(cookie) = cookies.header_value() {
        let value = HeaderValue::from_str(&cookie).context("invalid cookie header")?;
        request.headers_mut().insert(COOKIE, value);
    }
    let (ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    let (mut sink, mut stream) = ws.split();
    let mut namespace_ready = false;

    loop {
        loop {
            match commands.try_recv() {
                Ok(LinkCommand::Emit(event)) => {
                    if namespace_ready {
                        sink.send(Message::Text(encode_event(&event)))
                            .await
                            .context("socket write failed")?;
                    } else {
                        tracing::debug!(event = event.name(), "dropping emit before namespace connect");
                    }
                }
                Ok(LinkCommand::Disconnect) | Err(TryRecvError::Disconnected) => {
                    let _ = sink.send(Message::Text("41".to_string())).await;
                    let _ = sink.close().await;
                    return Ok(ConnectionEnd::Requested);
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        match tokio::time::timeout(READ_POLL_INTERVAL, stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match decode_frame(&text) {
                Frame::Open(handshake) => {
                    tracing::debug!(%handshake, "engine.io open");
                    sink.send(Message::Text("40".to_string()))
                        .await
                        .context("socket write failed")?;
                }
                Frame::Ping => {
                    sink.send(Message::Text("3".to_string()))
                        .await
                        .context("socket write failed")?;
                }
                Frame::Connect(payload) => {
                    namespace_ready = true;
                    *was_up = true;
                    let sid = payload
                        .as_ref()
                        .and_then(|p| p.get("sid"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    if events.send(LinkEvent::Up { sid }).is_err() {
                        return Ok(ConnectionEnd::Requested);
                    }
                }
                Frame::ConnectError(payload) => {
                    return Err(anyhow!("server refused connection: {payload}"));
                }
                Frame::NamespaceDisconnect | Frame::Close => {
                    return Ok(ConnectionEnd::Lost("server closed the session".to_string()));
                }
                Frame::Event { name, payload } => {
                    // The server greets every connection; the channel reports that itself.
                    if name == "connected" {
                        tracing::info!(%payload, "server greeting");
                        continue;
                    }
                    match ServerEvent::from_wire(&name, payload) {
                        Some(event) => {
                            if events.send(LinkEvent::Server(event)).is_err() {
                                return Ok(ConnectionEnd::Requested);
                            }
                        }
                        None => tracing::debug!(%name, "ignoring unknown server event"),
                    }
                }
                Frame::Pong | Frame::Unknown => {}
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                return Ok(ConnectionEnd::Lost("connection closed".to_string()));
            }
            Ok(Some(Ok(_))) => {
                // Binary and control frames carry nothing for us.
            }
            Ok(Some(Err(err))) => return Err(err).context("socket read failed"),
            Err(_) => {
                // Poll timeout keeps command handling responsive.
            }
        }
    }
}
