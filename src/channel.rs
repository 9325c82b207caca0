//! Remote session channel: the persistent, reconnecting event link to the backend.
//!
//! The transport itself runs on a worker (see [`crate::socket`]); this module owns
//! the connection state machine and the typed publish/subscribe surface. Events
//! are drained by [`Channel::poll`] on the owning thread in arrival order, so
//! handlers never run concurrently with the models they touch.

use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde_json::{json, Value};

use crate::error::{Result, SessionError};
use crate::model::{ConnectedInfo, InitProgress, InitStatusSnapshot};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    StartTerminal,
    TerminalInput { input: String },
    CheckInitialization,
    StartInitialization,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::StartTerminal => "start_terminal",
            ClientEvent::TerminalInput { .. } => "terminal_input",
            ClientEvent::CheckInitialization => "check_initialization",
            ClientEvent::StartInitialization => "start_initialization",
        }
    }

    pub fn payload(&self) -> Option<Value> {
        match self {
            ClientEvent::TerminalInput { input } => Some(json!({ "input": input })),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    TerminalOutput,
    TerminalStarted,
    InitializationStatus,
    InitializationProgress,
    Disconnected,
    Reconnected,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    Connected(ConnectedInfo),
    TerminalOutput {
        output: String,
        terminal_id: Option<String>,
    },
    TerminalStarted {
        terminal_id: String,
    },
    InitializationStatus(InitStatusSnapshot),
    InitializationProgress(InitProgress),
    Disconnected {
        reason: String,
    },
    Reconnected,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::Connected(_) => EventKind::Connected,
            ServerEvent::TerminalOutput { .. } => EventKind::TerminalOutput,
            ServerEvent::TerminalStarted { .. } => EventKind::TerminalStarted,
            ServerEvent::InitializationStatus(_) => EventKind::InitializationStatus,
            ServerEvent::InitializationProgress(_) => EventKind::InitializationProgress,
            ServerEvent::Disconnected { .. } => EventKind::Disconnected,
            ServerEvent::Reconnected => EventKind::Reconnected,
        }
    }

    /// Maps a named server event to its typed form. Unknown names yield `None`.
    pub fn from_wire(name: &str, payload: Value) -> Option<Self> {
        let str_field = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        match name {
            "connected" => Some(ServerEvent::Connected(
                serde_json::from_value(payload.clone()).unwrap_or_default(),
            )),
            "terminal_output" => {
                let output = match &payload {
                    Value::String(s) => s.clone(),
                    _ => str_field("output")?,
                };
                Some(ServerEvent::TerminalOutput {
                    output,
                    terminal_id: str_field("terminal_id"),
                })
            }
            "terminal_started" => Some(ServerEvent::TerminalStarted {
                terminal_id: str_field("terminal_id")?,
            }),
            "initialization_status" => serde_json::from_value(payload)
                .ok()
                .map(ServerEvent::InitializationStatus),
            "initialization_progress" => serde_json::from_value(payload)
                .ok()
                .map(ServerEvent::InitializationProgress),
            _ => None,
        }
    }
}

/// What the transport worker reports back to the channel.
#[derive(Debug)]
pub enum LinkEvent {
    Up { sid: Option<String> },
    Down { reason: String },
    Server(ServerEvent),
    /// The worker has stopped for good.
    Closed,
}

#[derive(Debug)]
pub enum LinkCommand {
    Emit(ClientEvent),
    Disconnect,
}

pub struct LinkHandles {
    pub commands: Sender<LinkCommand>,
    pub events: Receiver<LinkEvent>,
    pub worker: Option<JoinHandle<()>>,
}

/// Opens a transport link. The production implementation is
/// [`crate::socket::WsConnector`].
pub trait Connector {
    fn open(&self) -> anyhow::Result<LinkHandles>;
}

/// The narrow surface the terminal and initialization components need.
pub trait EventSink {
    fn is_connected(&self) -> bool;
    fn emit(&mut self, event: ClientEvent) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

pub type HandlerId = u64;

type Handler = Box<dyn FnMut(&ServerEvent)>;

pub struct Channel {
    connector: Box<dyn Connector>,
    link: Option<LinkHandles>,
    state: ChannelState,
    handlers: Vec<(HandlerId, EventKind, Handler)>,
    next_handler_id: HandlerId,
}

impl Channel {
    pub fn new(connector: Box<dyn Connector>) -> Self {
        Self {
            connector,
            link: None,
            state: ChannelState::Disconnected,
            handlers: Vec::new(),
            next_handler_id: 1,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn connect(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Ok(());
        }
        let link = self.connector.open().map_err(SessionError::transport)?;
        self.link = Some(link);
        self.state = ChannelState::Connecting;
        tracing::info!("channel connecting");
        Ok(())
    }

    /// Tears the link down. Returns the lifecycle event dispatched to handlers,
    /// if the channel had been live.
    pub fn disconnect(&mut self) -> Option<ServerEvent> {
        let Some(link) = self.link.take() else {
            self.state = ChannelState::Disconnected;
            return None;
        };
        let _ = link.commands.send(LinkCommand::Disconnect);
        let was_live = matches!(
            self.state,
            ChannelState::Connected | ChannelState::Reconnecting
        );
        self.state = ChannelState::Disconnected;
        tracing::info!("channel disconnected on request");
        if !was_live {
            return None;
        }
        let event = ServerEvent::Disconnected {
            reason: "client disconnect".to_string(),
        };
        self.dispatch(&event);
        Some(event)
    }

    /// Registers a handler for one event kind. Handlers for the same kind run in
    /// registration order, once per delivered event.
    pub fn on(&mut self, kind: EventKind, handler: impl FnMut(&ServerEvent) + 'static) -> HandlerId {
        let id = self.next_handler_id;
        self.next_handler_id += 1;
        self.handlers.push((id, kind, Box::new(handler)));
        id
    }

    pub fn off(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(hid, _, _)| *hid != id);
        self.handlers.len() != before
    }

    /// Drains everything the link has delivered so far, updates the connection
    /// state, runs handlers and returns the events in arrival order.
    pub fn poll(&mut self) -> Vec<ServerEvent> {
        let mut raw = Vec::new();
        let mut worker_gone = false;
        if let Some(link) = self.link.as_ref() {
            loop {
                match link.events.try_recv() {
                    Ok(LinkEvent::Closed) | Err(TryRecvError::Disconnected) => {
                        worker_gone = true;
                        break;
                    }
                    Ok(ev) => raw.push(ev),
                    Err(TryRecvError::Empty) => break,
                }
            }
        }

        let mut out = Vec::new();
        for ev in raw {
            match ev {
                LinkEvent::Up { sid } => {
                    let previous = self.state;
                    self.state = ChannelState::Connected;
                    if previous == ChannelState::Reconnecting {
                        tracing::info!("channel reconnected");
                        out.push(ServerEvent::Reconnected);
                    } else {
                        tracing::info!(sid = ?sid, "channel connected");
                        out.push(ServerEvent::Connected(ConnectedInfo { sid, message: None }));
                    }
                }
                LinkEvent::Down { reason } => match self.state {
                    ChannelState::Connected => {
                        tracing::warn!(%reason, "channel lost, reconnecting");
                        out.push(ServerEvent::Disconnected { reason });
                        self.state = ChannelState::Reconnecting;
                    }
                    // Never been up: the next link-up is still the first connection.
                    ChannelState::Connecting => {
                        tracing::debug!(%reason, "connection attempt failed, retrying");
                    }
                    ChannelState::Reconnecting | ChannelState::Disconnected => {}
                },
                LinkEvent::Server(event) => out.push(event),
                LinkEvent::Closed => {}
            }
        }

        if worker_gone {
            if self.state == ChannelState::Connected {
                out.push(ServerEvent::Disconnected {
                    reason: "transport closed".to_string(),
                });
            }
            self.link = None;
            self.state = ChannelState::Disconnected;
        }

        for event in &out {
            self.dispatch(event);
        }
        out
    }

    fn dispatch(&mut self, event: &ServerEvent) {
        let kind = event.kind();
        for (_, handler_kind, handler) in self.handlers.iter_mut() {
            if *handler_kind == kind {
                handler(event);
            }
        }
    }
}

impl EventSink for Channel {
    fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    fn emit(&mut self, event: ClientEvent) -> Result<()> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let Some(link) = self.link.as_ref() else {
            return Err(SessionError::NotConnected);
        };
        tracing::debug!(event = event.name(), "emit");
        link.commands
            .send(LinkCommand::Emit(event))
            .map_err(|_| SessionError::transport("link worker stopped"))
    }
}
