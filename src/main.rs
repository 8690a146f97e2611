//! Fossclaw - multiplexing bridge between coding-agent CLIs and web browsers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fossclaw::agent::adapters::{JsonRpcAdapter, SseAdapter};
use fossclaw::agent::bridge::AgentBridge;
use fossclaw::agent::launcher::AgentLauncher;
use fossclaw::agent::session_store::AgentSessionStore;
use fossclaw::agent::AgentState;
use fossclaw::api::build_app;
use fossclaw::auth::handler::AuthHttpState;
use fossclaw::auth::AuthState;
use fossclaw::config::Config;
use fossclaw::gateway::{GatewayBuilder, GatewayHttpState};
use fossclaw::naming::Namer;
use fossclaw::scheduler::handler::SchedulerState;
use fossclaw::scheduler::store::CronJobStore;
use fossclaw::scheduler::Scheduler;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fossclaw")]
#[command(version)]
#[command(about = "Multiplexing bridge between coding-agent CLIs and web browsers")]
struct Cli {
    /// Enable verbose (debug) logging.
    #[arg(short, long, env = "FOSSCLAW_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Fossclaw gateway (default if no subcommand is given).
    Serve {
        #[arg(long, env = "PORT")]
        port: Option<u16>,

        #[arg(long, env = "SESSION_DIR")]
        session_dir: Option<std::path::PathBuf>,

        #[arg(long, env = "BASE_CWD")]
        base_cwd: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("fossclaw={log_level},tower_http=info").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env();
    if let Some(Commands::Serve { port, session_dir, base_cwd }) = cli.command {
        if let Some(port) = port {
            config.port = port;
            config.alt_provider_port = port + 100;
        }
        if let Some(dir) = session_dir {
            config.session_dir = dir;
        }
        if let Some(cwd) = base_cwd {
            config.base_cwd = cwd;
        }
    }

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "fossclaw exited with an error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    tokio::fs::create_dir_all(&config.session_dir)
        .await
        .with_context(|| format!("creating session directory {}", config.session_dir.display()))?;

    // `session_dir` holds one subdirectory per session (spec's
    // `{base}/sessions/{sessionId}/...`); everything else persisted
    // (credentials, cron jobs, auth cookies) lives in its parent.
    let base_dir = config.session_dir.parent().map(Path::to_path_buf).unwrap_or_else(|| config.session_dir.clone());

    let (username, password) = fossclaw::credentials::resolve(&base_dir, config.user.clone(), config.pass.clone()).await;

    let store = Arc::new(AgentSessionStore::new(config.session_dir.clone()));
    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<String>();
    let (first_turn_tx, first_turn_rx) = mpsc::channel::<(String, String)>(64);
    let (activity_tx, mut activity_rx) = mpsc::unbounded_channel::<(String, i64)>();

    let launcher = Arc::new(AgentLauncher::new(&config, store.clone(), exit_tx));
    let bridge = Arc::new(AgentBridge::new(store.clone(), first_turn_tx, activity_tx));

    launcher.restore_from_disk().await;
    bridge.restore_from_disk().await;

    // Process exits reported by the launcher archive their bridge session;
    // a socket merely closing (handled in agent::handler) does not.
    let exit_bridge = bridge.clone();
    tokio::spawn(async move {
        while let Some(session_id) = exit_rx.recv().await {
            exit_bridge.handle_agent_close(&session_id, true).await;
        }
    });

    // Activity observed on the wire (assistant/user/result frames, browser
    // messages) is forwarded here so the launcher's session record stays
    // current for idle/TTL bookkeeping.
    let activity_launcher = launcher.clone();
    tokio::spawn(async move {
        while let Some((session_id, at_millis)) = activity_rx.recv().await {
            activity_launcher.touch_activity(&session_id, at_millis).await;
        }
    });

    let namer = Arc::new(Namer::new(config.naming_url.clone(), config.naming_model.clone(), launcher.clone()));
    namer.spawn(first_turn_rx);

    let cron_store = Arc::new(CronJobStore::new(base_dir.clone()));
    let scheduler = Arc::new(Scheduler::new(&config, cron_store.clone(), launcher.clone(), bridge.clone()));
    scheduler.restore_from_disk().await;
    scheduler.start();

    let auth_path = base_dir.join("auth-sessions.json");
    let auth = Arc::new(AuthState::new(username, password, auth_path));
    auth.restore_from_disk().await;

    launcher.start_reconnect_watchdog();

    let sse_adapter = Some(Arc::new(SseAdapter::new(
        format!("http://127.0.0.1:{}", config.alt_provider_port),
        config.sse_truncate_bytes,
        bridge.clone(),
    )));

    // The JSON-RPC adapter has no dedicated endpoint configuration in this
    // deployment (spec §4.3.2 leaves upstream discovery unspecified), so it
    // stays unconfigured; `rpc-adapter` session creation reports 501 until
    // a future config surface names the socket to dial.
    let jsonrpc_adapter: Option<Arc<JsonRpcAdapter>> = None;

    let agent_state = AgentState {
        launcher: launcher.clone(),
        bridge: bridge.clone(),
        store: store.clone(),
        sse_adapter,
        jsonrpc_adapter,
        base_cwd: config.base_cwd.to_string_lossy().to_string(),
    };
    let auth_state = AuthHttpState { auth: auth.clone() };
    let scheduler_state = SchedulerState { scheduler: scheduler.clone() };

    let gateway = Arc::new(GatewayBuilder::new().build());
    let gateway_state = GatewayHttpState { gateway: gateway.clone() };

    let app = build_app(agent_state, auth_state, scheduler_state, gateway_state, &[]);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    gateway.mark_started().await;
    tracing::info!(%addr, "fossclaw listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    gateway.mark_stopping().await;
    store.flush().await;
    cron_store.flush().await;
    auth.flush().await;
    gateway.mark_stopped().await;
    tracing::info!("fossclaw shut down cleanly");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received shutdown signal");
}
