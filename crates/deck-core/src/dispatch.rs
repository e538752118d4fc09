use crate::config::ConfigStore;
use crate::exec::{self, Executor};
use crate::protocol::{decode_request, Request, Response};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const LOG_PREVIEW_CHARS: usize = 200;

/// Answers one client message at a time against the latest committed
/// snapshot. Holds no per-connection state; navigation context arrives with
/// every request.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<ConfigStore>,
    executor: Arc<dyn Executor>,
}

impl Dispatcher {
    pub fn new(store: Arc<ConfigStore>, executor: Arc<dyn Executor>) -> Self {
        Self { store, executor }
    }

    pub fn handle_raw(&self, conn_id: &str, raw: &[u8]) -> Response {
        debug!(
            event = "message_received",
            conn_id = conn_id,
            raw = %preview(&String::from_utf8_lossy(raw))
        );
        match decode_request(raw) {
            Ok(request) => self.handle(conn_id, request),
            Err(err) => {
                warn!(event = "message_invalid", conn_id = conn_id, error = %err);
                err.to_response()
            }
        }
    }

    pub fn handle(&self, conn_id: &str, request: Request) -> Response {
        info!(event = "request", conn_id = conn_id, r#type = request.kind());
        let snapshot = self.store.current();
        match request {
            Request::Init => {
                let commands = snapshot.root_commands();
                debug!(event = "init", conn_id = conn_id, commands = commands.len());
                Response::Commands {
                    layout: Some(snapshot.layout.clone()),
                    commands,
                }
            }
            Request::FetchCommands => Response::Commands {
                layout: None,
                commands: snapshot.root_commands(),
            },
            Request::SwitchContext { context } => {
                let commands = snapshot.context_commands(&context);
                debug!(
                    event = "switch_context",
                    conn_id = conn_id,
                    context = %context,
                    commands = commands.len() - 1
                );
                Response::Commands {
                    layout: None,
                    commands,
                }
            }
            Request::Run { context, uuid } => {
                let Some(command) = snapshot.find(&context, &uuid) else {
                    error!(
                        event = "command_not_found",
                        conn_id = conn_id,
                        uuid = %uuid,
                        context = %context
                    );
                    return Response::failure("Command not found");
                };
                if !command.is_action() {
                    warn!(
                        event = "command_not_runnable",
                        conn_id = conn_id,
                        uuid = %uuid,
                        kind = %command.kind
                    );
                    return Response::failure("Command is not an action");
                }
                info!(
                    event = "run_command",
                    conn_id = conn_id,
                    description = %command.description,
                    app = %command.application_target,
                    action = %command.action_line
                );
                match exec::execute(self.executor.as_ref(), command) {
                    Ok(()) => {
                        info!(event = "command_succeeded", conn_id = conn_id, uuid = %uuid);
                        Response::ok()
                    }
                    Err(err) => {
                        error!(event = "command_failed", conn_id = conn_id, uuid = %uuid, error = %err);
                        Response::failure(format!("Command failed: {err}"))
                    }
                }
            }
            Request::Unknown(kind) => {
                warn!(event = "unknown_message", conn_id = conn_id, r#type = %kind);
                Response::failure(format!("Unknown event type: {kind}"))
            }
        }
    }
}

pub fn preview(text: &str) -> String {
    if text.chars().count() <= LOG_PREVIEW_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(LOG_PREVIEW_CHARS).collect();
    format!("{head}...(truncated)")
}
