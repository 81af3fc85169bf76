//! modelcast host: serves a live model and supervises its backend.
//!
//! Configuration comes from `MODELCAST_*` environment variables; only
//! `MODELCAST_BACKEND_CMD` is required.

use std::process::ExitCode;

use log::{error, info};
use modelcast_core::{shared, LiveModel};
use modelcast_sync::config::EnvConfig;
use modelcast_sync::server::WsServer;
use modelcast_sync::supervisor::{Supervisor, SupervisorEvent};

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let env = EnvConfig::new();
    let server_config = env.server_config()?;
    let supervisor_config = env.supervisor_config()?;

    let model = shared(LiveModel::new());
    let server = WsServer::bind(server_config, model.clone()).await?;
    let supervisor = Supervisor::spawn(supervisor_config, model, Some(server.clone()))?;

    if let Some(mut events) = supervisor.take_event_rx() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let SupervisorEvent::BackendCrashed { code, during_start } = event {
                    error!("Backend crashed (exit code {code:?}, during start: {during_start})");
                }
            }
        });
    }

    supervisor.start().await?;
    info!(
        "Serving on ws://{}{} (backend {})",
        server.local_addr(),
        server.config().ws_path,
        supervisor.state()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    supervisor.stop().await;
    server.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    info!("Starting modelcast host...");
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
