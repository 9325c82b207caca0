use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::config::{self, ClientState};

const DEBOUNCE: Duration = Duration::from_millis(250);

/// Writes [`ClientState`] on a background thread so callers never wait on disk.
///
/// Bursts of updates (every tree toggle, every scratch edit) are coalesced and
/// only the newest state is written. `flush()` waits for pending writes.
pub struct AsyncStateSaver {
    tx: mpsc::Sender<Msg>,
    handle: Option<thread::JoinHandle<()>>,
}

enum Msg {
    Save(ClientState),
    Flush(mpsc::Sender<()>),
    Shutdown,
}

impl AsyncStateSaver {
    pub fn new(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel::<Msg>();
        let handle = thread::Builder::new()
            .name("ide-state-saver".to_string())
            .spawn(move || saver_thread(path, rx))
            .ok();
        Self { tx, handle }
    }

    /// Best-effort; returns immediately.
    pub fn request_save(&self, state: ClientState) {
        let _ = self.tx.send(Msg::Save(state));
    }

    /// Writes anything pending and waits for it, up to `timeout`.
    pub fn flush(&self, timeout: Duration) {
        let (ack_tx, ack_rx) = mpsc::channel::<()>();
        if self.tx.send(Msg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv_timeout(timeout);
        }
    }
}

impl Drop for AsyncStateSaver {
    fn drop(&mut self) {
        let _ = self.tx.send(Msg::Shutdown);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn write(path: &Path, pending: &mut Option<ClientState>) {
    if let Some(state) = pending.take() {
        if let Err(err) = config::save_state_to(path, &state) {
            tracing::warn!("client state not saved: {err:#}");
        }
    }
}

fn saver_thread(path: PathBuf, rx: mpsc::Receiver<Msg>) {
    let mut pending: Option<ClientState> = None;
    loop {
        let msg = match rx.recv() {
            Ok(m) => m,
            Err(_) => return,
        };

        match msg {
            Msg::Save(state) => {
                pending = Some(state);
                loop {
                    match rx.recv_timeout(DEBOUNCE) {
                        Ok(Msg::Save(state)) => pending = Some(state),
                        Ok(Msg::Flush(ack)) => {
                            write(&path, &mut pending);
                            let _ = ack.send(());
                        }
                        Ok(Msg::Shutdown) => {
                            write(&path, &mut pending);
                            return;
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => break,
                        Err(mpsc::RecvTimeoutError::Disconnected) => {
                            write(&path, &mut pending);
                            return;
                        }
                    }
                }
                write(&path, &mut pending);
            }
            Msg::Flush(ack) => {
                write(&path, &mut pending);
                let _ = ack.send(());
            }
            Msg::Shutdown => {
                write(&path, &mut pending);
                return;
            }
        }
    }
}
