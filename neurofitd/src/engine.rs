//! Engine task: sole owner of the fit controller.
//!
//! Events arrive on three channels and are served in priority order
//! (shutdown, stimulus, frame notices, client commands). Stimulus events are
//! drained ahead of frames so a frame's fit sees every onset queued before it.

use std::fs::File;
use std::io::{BufReader, BufWriter};

use neurofit::boundary::protocol::Response;
use neurofit::boundary::{ActivityFrame, FrameNotice, MemoryStore, Publication, TickOutcome};
use neurofit::model::EncodingModel;
use neurofit::observer::{ControllerAdapter, FitStatus};
use neurofit::snapshot;
use neurofit::stimulus::StimulusEvent;
use neurofit::{FitConfig, OnlineFitController};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::paths::AppPaths;

pub enum Command {
    PutFrame {
        handle: String,
        payload: ActivityFrame,
    },
    GetAnalysis {
        frame: usize,
    },
    SaveModel,
    Shutdown,
}

pub type Reply = oneshot::Sender<Response>;

/// Handles held by client connections.
#[derive(Clone)]
pub struct EngineHandle {
    pub stimuli: mpsc::Sender<StimulusEvent>,
    pub frames: mpsc::Sender<FrameNotice>,
    pub commands: mpsc::Sender<(Command, Reply)>,
    pub status: watch::Receiver<FitStatus>,
}

impl EngineHandle {
    /// Send a command and wait for the engine's reply.
    pub async fn call(&self, cmd: Command) -> Response {
        let (tx, rx) = oneshot::channel();
        if self.commands.send((cmd, tx)).await.is_err() {
            return Response::err("engine stopped");
        }
        rx.await.unwrap_or_else(|_| Response::err("engine stopped"))
    }
}

pub struct Engine {
    controller: OnlineFitController,
    store: MemoryStore,
    paths: AppPaths,
    status: watch::Sender<FitStatus>,
}

const CHANNEL_DEPTH: usize = 256;

impl Engine {
    /// Build the engine, resuming from a saved model image when one matches `cfg`.
    pub fn new(cfg: FitConfig, paths: AppPaths) -> Result<(Self, EngineChannels), neurofit::FitError> {
        let controller = match load_model(&paths, &cfg) {
            Some(model) => OnlineFitController::with_model(cfg, model)?,
            None => OnlineFitController::new(cfg)?,
        };

        let (status, status_rx) = watch::channel(ControllerAdapter::new(&controller).status());
        let (stim_tx, stim_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (frame_tx, frame_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_DEPTH);

        let engine = Self {
            controller,
            store: MemoryStore::default(),
            paths,
            status,
        };
        let channels = EngineChannels {
            handle: EngineHandle {
                stimuli: stim_tx,
                frames: frame_tx,
                commands: cmd_tx,
                status: status_rx,
            },
            stimuli: stim_rx,
            frames: frame_rx,
            commands: cmd_rx,
        };
        Ok((engine, channels))
    }

    pub async fn run(
        mut self,
        mut stimuli: mpsc::Receiver<StimulusEvent>,
        mut frames: mpsc::Receiver<FrameNotice>,
        mut commands: mpsc::Receiver<(Command, Reply)>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(event) = stimuli.recv() => {
                    self.controller.apply_stimulus(event);
                }
                Some(notice) = frames.recv() => self.on_frame(notice),
                Some((cmd, reply)) = commands.recv() => {
                    let stop = matches!(cmd, Command::Shutdown);
                    let response = self.on_command(cmd);
                    let _ = reply.send(response);
                    if stop {
                        shutdown.cancel();
                        break;
                    }
                }
                else => break,
            }
            self.status
                .send_replace(ControllerAdapter::new(&self.controller).status());
        }

        if let Err(e) = self.finish() {
            error!("final snapshot failed: {}", e);
        }
    }

    fn on_frame(&mut self, notice: FrameNotice) {
        match self.controller.tick(notice, &mut self.store) {
            TickOutcome::Published {
                frame,
                milestone: true,
            } => {
                let snap = self.controller.milestone_snapshot();
                match snapshot::write_milestone(self.paths.data_dir(), &snap) {
                    Ok(_) => info!("milestone snapshot written for frame {}", frame),
                    Err(e) => error!("milestone snapshot for frame {} failed: {}", frame, e),
                }
            }
            TickOutcome::Halted => warn!("frame notice after shutdown ignored"),
            _ => {}
        }
    }

    fn on_command(&mut self, cmd: Command) -> Response {
        match cmd {
            Command::PutFrame { handle, payload } => {
                self.store.put_frame(handle.clone(), payload);
                Response::ok(format!("Stored {}", handle))
            }
            Command::GetAnalysis { frame } => match self.store.publication(frame) {
                Some(Publication::Analysis(bundle)) => Response::Analysis(bundle.clone()),
                Some(Publication::Missing { .. }) => Response::err(format!("Frame {} was missing", frame)),
                None => Response::err(format!("No analysis retained for frame {}", frame)),
            },
            Command::SaveModel => match self.save_model() {
                Ok(()) => Response::ok("Model saved"),
                Err(e) => Response::err(format!("Save failed: {}", e)),
            },
            Command::Shutdown => {
                info!("Shutdown requested");
                Response::ok("Shutting down")
            }
        }
    }

    fn save_model(&self) -> std::io::Result<()> {
        let path = self.paths.model_file();
        let mut w = BufWriter::new(File::create(&path)?);
        self.controller.model().save_image_to(&mut w)?;
        info!("Model saved to {:?}", path);
        Ok(())
    }

    /// Terminal transition plus final snapshot and model image.
    fn finish(mut self) -> std::io::Result<()> {
        self.controller.shutdown();
        self.status
            .send_replace(ControllerAdapter::new(&self.controller).status());
        let files = snapshot::write_final(self.paths.data_dir(), &self.controller.final_snapshot())?;
        info!("Final snapshot: {} files under {:?}", files.len(), self.paths.data_dir());
        self.save_model()
    }
}

pub struct EngineChannels {
    pub handle: EngineHandle,
    pub stimuli: mpsc::Receiver<StimulusEvent>,
    pub frames: mpsc::Receiver<FrameNotice>,
    pub commands: mpsc::Receiver<(Command, Reply)>,
}

fn load_model(paths: &AppPaths, cfg: &FitConfig) -> Option<EncodingModel> {
    let path = paths.model_file();
    let file = File::open(&path).ok()?;
    match EncodingModel::load_image_from(&mut BufReader::new(file)) {
        Ok(model)
            if model.history_dim() == cfg.history_dim
                && model.stimulus_dim() == cfg.stimulus_dim =>
        {
            info!("Resuming model with {} neurons from {:?}", model.neurons(), path);
            Some(model)
        }
        Ok(_) => {
            warn!("Saved model dimensions differ from config; starting fresh");
            None
        }
        Err(e) => {
            warn!("Could not load model: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use neurofit::FitState;

    fn scratch(name: &str) -> AppPaths {
        let dir = std::env::temp_dir().join(format!("neurofitd_engine_{name}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        AppPaths::at(dir).unwrap()
    }

    #[tokio::test]
    async fn session_over_channels_writes_final_snapshot() {
        let paths = scratch("session");
        let cfg = FitConfig::default().with_neurons(3, 3).with_horizon(100);
        let (engine, ch) = Engine::new(cfg, paths.clone()).unwrap();
        let token = CancellationToken::new();
        let task = tokio::spawn(engine.run(ch.stimuli, ch.frames, ch.commands, token.clone()));
        let handle = ch.handle;

        handle.stimuli.send(StimulusEvent::new(0, 3, 0.0)).await.unwrap();
        handle.stimuli.send(StimulusEvent::new(2, 3, 4.0)).await.unwrap();
        let r = handle
            .call(Command::PutFrame {
                handle: "est5".into(),
                payload: ActivityFrame::new(Array2::ones((3, 6))),
            })
            .await;
        assert!(matches!(r, Response::Success { .. }));
        handle
            .frames
            .send(FrameNotice::Ready {
                handle: "est5".into(),
                frame: 5,
            })
            .await
            .unwrap();

        let r = handle.call(Command::GetAnalysis { frame: 5 }).await;
        let Response::Analysis(bundle) = r else {
            panic!("expected analysis");
        };
        assert_eq!(bundle.onsets.get(&3), Some(&vec![2]));
        assert_eq!(bundle.likelihood.len(), 1);

        let r = handle.call(Command::Shutdown).await;
        assert!(matches!(r, Response::Success { .. }));
        task.await.unwrap();

        assert!(token.is_cancelled());
        assert_eq!(handle.status.borrow().state, FitState::Terminal);
        assert!(paths.data_dir().join("output/model_weights.txt").exists());
        assert!(paths.data_dir().join("output_snap/stims.txt").exists());
        assert!(paths
            .data_dir()
            .join("output/timing/analysis_frame_time.txt")
            .exists());
        assert!(paths.model_file().exists());

        // A restart resumes the fitted model.
        let (engine, _ch) = Engine::new(FitConfig::default().with_neurons(3, 3), paths.clone()).unwrap();
        assert_eq!(engine.controller.model().steps(), 1);
        std::fs::remove_dir_all(paths.data_dir()).unwrap();
    }
}
