mod discovery;
mod logging;
mod session;
mod watcher;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::{header::USER_AGENT, HeaderMap, Method},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use deck_core::config::default_config_path;
use deck_core::{ConfigStore, Dispatcher, ServerSettings, SystemExecutor};
use session::HubState;
use std::{
    future::Future,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

const DEFAULT_PORT: u16 = 4242;
const DEFAULT_BIND: &str = "0.0.0.0";
const SERVER_NAME: &str = "DevDeck";

#[derive(Clone, Debug)]
struct Config {
    config_path: PathBuf,
    addr: String,
    log_level: String,
    log_dir: Option<PathBuf>,
    discovery: bool,
    grace: Duration,
    write_timeout: Duration,
}

#[derive(Parser, Debug)]
#[command(name = "deck-hub", about = "Serves a command deck to companion clients")]
struct Args {
    /// Path to devdeck.toml
    #[arg(long, default_value = "")]
    config: String,
    #[arg(long, default_value = "")]
    bind: String,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, default_value = "")]
    log_level: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    /// Also append logs to a dated file
    #[arg(long, default_value_t = false)]
    log_file: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    no_discovery: bool,
    #[arg(long, default_value_t = 5)]
    grace_seconds: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let config_path = resolve_config_path(&args.config, env_value("DEVDECK_CONFIG"));
    let dir_error = ensure_config_dir(&config_path).err();
    let settings = ServerSettings::read(&config_path).unwrap_or_default();
    let config = load_config(&args, config_path, &settings);
    logging::init(&config.log_level, config.log_dir.as_deref());

    if let Some(err) = dir_error {
        warn!(event = "config_dir_error", error = %err);
    }
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(event = "runtime_error", error = %err);
            return ExitCode::FAILURE;
        }
    };
    let code = runtime.block_on(run(config));
    release_runtime(runtime);
    code
}

/// A `run` still waiting on its child holds a blocking-pool thread; the grace
/// period has already passed, so the process must not wait for it.
fn release_runtime(runtime: tokio::runtime::Runtime) {
    runtime.shutdown_background();
}

async fn run(config: Config) -> ExitCode {
    info!(
        event = "hub_start",
        config = %config.config_path.display(),
        addr = %config.addr,
        log_level = %config.log_level
    );
    discovery::log_interfaces();

    let store = match ConfigStore::open(&config.config_path) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(event = "config_error", error = %err);
            return ExitCode::FAILURE;
        }
    };
    let _watcher = match watcher::spawn(store.clone()) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!(event = "config_watch_failed", error = %err);
            None
        }
    };

    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return ExitCode::FAILURE;
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return ExitCode::FAILURE;
        }
    };
    let port = listener.local_addr().map(|a| a.port()).unwrap_or(addr.port());

    let advertisement = if config.discovery {
        match discovery::advertise(port) {
            Ok(advertisement) => Some(advertisement),
            Err(err) => {
                warn!(event = "discovery_failed", error = %format!("{err:#}"));
                None
            }
        }
    } else {
        None
    };

    let dispatcher = Dispatcher::new(store, Arc::new(SystemExecutor));
    let code = serve(listener, dispatcher, &config, shutdown_signal()).await;

    if let Some(advertisement) = advertisement {
        advertisement.stop();
    }
    info!(event = "hub_stopped");
    code
}

/// Serves until `shutdown` resolves, then gives sessions `config.grace` to
/// close before returning anyway.
async fn serve(
    listener: tokio::net::TcpListener,
    dispatcher: Dispatcher,
    config: &Config,
    shutdown: impl Future<Output = ()>,
) -> ExitCode {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (drain_tx, mut drain_rx) = mpsc::channel::<()>(1);
    let hub = Arc::new(HubState::new(
        dispatcher,
        shutdown_rx.clone(),
        config.write_timeout,
        drain_tx,
    ));
    let app = build_router(hub);
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();

    info!(event = "hub_listening", port = port, health = "/health", ws = "/ws");

    let mut server_shutdown = shutdown_rx;
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        })
        .await
    });

    let mut code = ExitCode::SUCCESS;
    tokio::select! {
        _ = shutdown => {
            info!(event = "shutdown_requested", grace_seconds = config.grace.as_secs());
            let _ = shutdown_tx.send(true);
            let drained = async {
                log_server_exit((&mut server).await);
                // Resolves once the router and every session have released the hub.
                let _ = drain_rx.recv().await;
            };
            if tokio::time::timeout(config.grace, drained).await.is_err() {
                warn!(event = "shutdown_forced");
                server.abort();
            }
        }
        result = &mut server => {
            log_server_exit(result);
            code = ExitCode::FAILURE;
        }
    }
    code
}

fn log_server_exit(result: Result<io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => debug!(event = "server_closed"),
        Ok(Err(err)) => error!(event = "hub_error", error = %err),
        Err(err) => error!(event = "hub_error", error = %err),
    }
}

fn build_router(hub: Arc<HubState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(hub)
        .layer(cors)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    if let Some(agent) = user_agent(&headers) {
        debug!(event = "ws_upgrade", remote = %addr, user_agent = agent);
    }
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, addr).await;
    })
}

async fn health_handler(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    info!(event = "health_check", remote = %addr);
    if let Some(agent) = user_agent(&headers) {
        debug!(event = "health_check", user_agent = agent);
    }
    Json(serde_json::json!({ "status": "ok", "server": SERVER_NAME }))
}

fn user_agent(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(event = "signal_error", error = %err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn load_config(args: &Args, config_path: PathBuf, settings: &ServerSettings) -> Config {
    let port = resolve_port(args.port, env_value("DEVDECK_PORT"), settings.server.port);
    let bind = first_non_empty(&args.bind, env_value("DEVDECK_BIND"))
        .unwrap_or_else(|| DEFAULT_BIND.to_string());
    let log_level = resolve_log_level(
        args.debug,
        &args.log_level,
        env_value("DEVDECK_LOG_LEVEL"),
        settings.log.level.as_deref(),
    );
    let log_file = args.log_file || env_flag("DEVDECK_LOG_FILE") || settings.log.file_enabled;
    let log_dir = log_file.then(|| {
        first_non_empty(&args.log_dir, env_value("DEVDECK_LOG_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(|| logging::default_dir(&config_path))
    });
    Config {
        config_path,
        addr: format_addr(&bind, port),
        log_level,
        log_dir,
        discovery: !args.no_discovery,
        grace: Duration::from_secs(args.grace_seconds),
        write_timeout: Duration::from_secs(args.write_timeout),
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_flag(key: &str) -> bool {
    env_value(key).is_some_and(|value| {
        ["1", "true", "yes", "on"]
            .iter()
            .any(|accepted| value.trim().eq_ignore_ascii_case(accepted))
    })
}

fn first_non_empty(flag: &str, env: Option<String>) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    env
}

fn resolve_config_path(flag: &str, env: Option<String>) -> PathBuf {
    first_non_empty(flag, env)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path)
}

fn resolve_port(flag: Option<u16>, env: Option<String>, file: Option<u16>) -> u16 {
    flag.or_else(|| env.and_then(|value| value.trim().parse().ok()))
        .or(file)
        .unwrap_or(DEFAULT_PORT)
}

fn resolve_log_level(debug: bool, flag: &str, env: Option<String>, file: Option<&str>) -> String {
    if debug {
        return "debug".to_string();
    }
    first_non_empty(flag, env)
        .or_else(|| file.map(str::to_string))
        .unwrap_or_else(|| "info".to_string())
}

fn format_addr(bind: &str, port: u16) -> String {
    if bind.contains(':') && !bind.starts_with('[') {
        format!("[{bind}]:{port}")
    } else {
        format!("{bind}:{port}")
    }
}

fn ensure_config_dir(config_path: &Path) -> io::Result<()> {
    match config_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir),
        _ => Ok(()),
    }
}
