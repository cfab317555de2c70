mod cli;
mod config;
mod signaling;
mod synthetic;

use std::sync::Arc;

use anyhow::Context;
use careline_engine::{CallController, CallDeps, CallState, CallStatus, IceProber, WebRtcLinkFactory};
use signaling::WsSignaling;
use synthetic::SyntheticDevices;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Log every status change until the call reaches a terminal status.
async fn follow_state(mut rx: watch::Receiver<CallState>) -> CallState {
    let mut last = rx.borrow_and_update().clone();
    info!(status = %last.status, "Call state");
    while rx.changed().await.is_ok() {
        let state = rx.borrow_and_update().clone();
        if state.status != last.status || state.using_relay_only != last.using_relay_only {
            info!(
                status = %state.status,
                dial_seconds = state.dial_seconds,
                relay_only = state.using_relay_only,
                remote_tracks = state.remote_tracks.len(),
                "Call state"
            );
        }
        if let Some(message) = state.error_message()
            && state.failure != last.failure
        {
            warn!(status = %state.status, "{message}");
        }
        last = state;
        if last.status.is_terminal() {
            break;
        }
    }
    last
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Needed for wss:// relay URLs
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = cli::parse_args()?;
    let config = config::load_config(&args.config)?;
    config::check(&config)?;

    info!(
        user = %args.user,
        peer = %args.peer,
        conversation = %args.conversation,
        role = ?args.role,
        mode = ?args.mode,
        relay_url = %args.relay_url,
        "Starting careline-agent"
    );

    let (signaling, connection) = WsSignaling::connect(&args.relay_url, &args.user);
    let controller = CallController::new(CallDeps {
        signaling,
        devices: Arc::new(SyntheticDevices),
        prober: Arc::new(IceProber::new(config.timers.probe_timeout())),
        links: Arc::new(WebRtcLinkFactory),
        config,
    });

    let watcher = tokio::spawn(follow_state(controller.subscribe()));

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let opened = {
        let opening = controller.open(args.session_params());
        tokio::pin!(opening);
        // close() waits for the cancelled open, so both are polled together
        tokio::select! {
            result = &mut opening => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C during setup");
                tokio::join!(controller.close(), &mut opening).1
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM during setup");
                tokio::join!(controller.close(), &mut opening).1
            }
        }
    };
    if let Err(e) = &opened {
        error!("Call could not be opened: {e}");
    } else {
        let mut rx = controller.subscribe();
        tokio::select! {
            _ = rx.wait_for(|s| s.status.is_terminal()) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, hanging up");
                controller.hangup().await;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, hanging up");
                controller.hangup().await;
            }
        }
        controller.close().await;
    }

    let final_state = controller.state();
    // Give the hangup frame a moment to leave before the socket goes away
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    drop(controller);
    connection.abort();
    watcher.abort();

    info!(status = %final_state.status, "careline-agent exiting");
    if final_state.status == CallStatus::Failed {
        std::process::exit(1);
    }
    opened.map_err(anyhow::Error::from).context("Call setup failed")?;
    Ok(())
}
