//! Neurofit Daemon - online encoding-model fitting service
//!
//! This daemon owns one fit session, managing:
//! - Stimulus tracking and per-frame model fitting
//! - Milestone and final snapshots
//! - Model image persistence
//! - Line-delimited JSON server for upstream producers and clients
//!
//! Storage locations:
//! - Linux: ~/.local/share/neurofit/
//! - Windows: %APPDATA%\neurofit\
//! - MacOS: ~/Library/Application Support/neurofit/

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use neurofit::boundary::protocol::{Request, Response};
use neurofit::stimulus::StimulusEvent;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod engine;
mod paths;

use engine::{Command, Engine, EngineHandle};
use paths::AppPaths;

const LISTEN_ADDR: &str = "127.0.0.1:9877";
const MAX_LINE: usize = 64 * 1024 * 1024;

// ═══════════════════════════════════════════════════════════════════════════
// Client Handler
// ═══════════════════════════════════════════════════════════════════════════

async fn route(request: Request, engine: &EngineHandle) -> Response {
    match request {
        Request::GetState => {
            let status = engine.status.borrow().clone();
            Response::State(status)
        }
        Request::Stimulus { event } => match StimulusEvent::from_message(&event) {
            Some(ev) => match engine.stimuli.send(ev).await {
                Ok(()) => Response::ok(format!("Stimulus queued for frame {}", ev.frame)),
                Err(_) => Response::err("engine stopped"),
            },
            None => Response::err(format!("Malformed stimulus message: {}", event)),
        },
        Request::PutFrame { handle, payload } => {
            engine.call(Command::PutFrame { handle, payload }).await
        }
        req @ (Request::FrameReady { .. } | Request::FrameMissing { .. }) => {
            let Some(notice) = req.notice() else {
                return Response::err("not a frame notice");
            };
            match engine.frames.send(notice).await {
                Ok(()) => Response::ok("Frame queued"),
                Err(_) => Response::err("engine stopped"),
            }
        }
        Request::GetAnalysis { frame } => engine.call(Command::GetAnalysis { frame }).await,
        Request::SaveModel => engine.call(Command::SaveModel).await,
        Request::Shutdown => engine.call(Command::Shutdown).await,
    }
}

async fn handle_client(
    stream: TcpStream,
    engine: EngineHandle,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));

    while let Some(line) = lines.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => route(request, &engine).await,
            Err(e) => Response::err(format!("Invalid request: {}", e)),
        };
        lines.send(serde_json::to_string(&response)?).await?;
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Setup application paths and configuration
    let paths = AppPaths::new()?;
    info!("Data directory: {:?}", paths.data_dir());
    let cfg = paths.load_config()?;

    let (engine, channels) = Engine::new(cfg, paths)?;
    let shutdown = CancellationToken::new();

    let engine_task = tokio::spawn(engine.run(
        channels.stimuli,
        channels.frames,
        channels.commands,
        shutdown.clone(),
    ));

    // Ctrl-C takes the same path as a Shutdown request.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C: shutting down");
                shutdown.cancel();
            }
        });
    }

    let listener = TcpListener::bind(LISTEN_ADDR).await?;
    info!("Neurofit daemon listening on {}", LISTEN_ADDR);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                info!("Client connected: {}", addr);
                let handle = channels.handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, handle).await {
                        error!("Client handler error: {}", e);
                    }
                });
            }
        }
    }

    engine_task.await?;
    // Give in-flight responses a moment to flush before exiting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    info!("Neurofit daemon stopped");
    Ok(())
}
