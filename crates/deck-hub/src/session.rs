use axum::extract::ws::{CloseFrame, Message, WebSocket};
use deck_core::dispatch::preview;
use deck_core::{Dispatcher, Response};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const OUTBOUND_QUEUE: usize = 256;
const CLOSE_GOING_AWAY: u16 = 1001;

pub struct HubState {
    dispatcher: Dispatcher,
    shutdown: watch::Receiver<bool>,
    write_timeout: Duration,
    conn_counter: AtomicU64,
    // Dropped with the last session; shutdown waits for that.
    _drain: mpsc::Sender<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    ClientClose,
    Disconnect,
    ReadError,
    SendError,
    Shutdown,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClose => "client_close",
            CloseReason::Disconnect => "disconnect",
            CloseReason::ReadError => "read_error",
            CloseReason::SendError => "send_error",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl HubState {
    pub fn new(
        dispatcher: Dispatcher,
        shutdown: watch::Receiver<bool>,
        write_timeout: Duration,
        drain: mpsc::Sender<()>,
    ) -> Self {
        Self {
            dispatcher,
            shutdown,
            write_timeout,
            conn_counter: AtomicU64::new(0),
            _drain: drain,
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    /// Runs one message at a time on the blocking pool. `run` may wait on a
    /// child process, and a panic there must not take the session down.
    async fn dispatch(&self, conn_id: &str, data: Vec<u8>) -> Response {
        let dispatcher = self.dispatcher.clone();
        let conn = conn_id.to_string();
        match tokio::task::spawn_blocking(move || dispatcher.handle_raw(&conn, &data)).await {
            Ok(response) => response,
            Err(err) => {
                error!(event = "dispatch_panic", conn_id = conn_id, error = %err);
                Response::failure("Internal server error")
            }
        }
    }

    pub async fn handle_socket(&self, socket: WebSocket, remote: SocketAddr) {
        let conn_id = self.next_conn_id();
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let write_timeout = self.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        });

        info!(event = "client_connected", conn_id = %conn_id, remote = %remote);

        let mut shutdown = self.shutdown.clone();
        let reason = loop {
            if *shutdown.borrow() {
                break CloseReason::Shutdown;
            }
            let next = tokio::select! {
                _ = shutdown.changed() => break CloseReason::Shutdown,
                next = ws_receiver.next() => next,
            };
            let msg = match next {
                Some(Ok(msg)) => msg,
                Some(Err(err)) => {
                    warn!(event = "read_error", conn_id = %conn_id, error = %err);
                    break CloseReason::ReadError;
                }
                None => break CloseReason::Disconnect,
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(frame) => {
                    let code = frame.map(|frame| frame.code);
                    info!(event = "client_close", conn_id = %conn_id, code = ?code);
                    break CloseReason::ClientClose;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };

            let response = self.dispatch(&conn_id, data).await;
            let text = response.to_json();
            debug!(event = "message_sent", conn_id = %conn_id, raw = %preview(&text));
            if tx.send(Message::Text(text)).await.is_err() {
                warn!(event = "send_error", conn_id = %conn_id);
                break CloseReason::SendError;
            }
        };

        match reason {
            CloseReason::ClientClose => {}
            CloseReason::Shutdown => {
                let _ = tx
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_GOING_AWAY,
                        reason: "server shutting down".into(),
                    })))
                    .await;
            }
            CloseReason::Disconnect | CloseReason::ReadError | CloseReason::SendError => {
                warn!(event = "unexpected_disconnect", conn_id = %conn_id, reason = reason.as_str());
            }
        }
        info!(event = "client_disconnected", conn_id = %conn_id, reason = reason.as_str());
        drop(tx);
        let _ = write_task.await;
    }
}
