//! Newline-delimited JSON protocol spoken by the daemon and the CLI.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::boundary::{ActivityFrame, AnalysisBundle, FrameNotice};
use crate::observer::FitStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    GetState,
    /// Raw stimulus message, `{"<frame>": [<id>, <intensity>]}`.
    Stimulus { event: Value },
    /// Store activity under `handle` for a later `FrameReady`.
    PutFrame { handle: String, payload: ActivityFrame },
    FrameReady { handle: String, frame: usize },
    FrameMissing { frame: usize },
    GetAnalysis { frame: usize },
    SaveModel,
    Shutdown,
}

impl Request {
    /// The frame notice carried by this request, if any.
    pub fn notice(&self) -> Option<FrameNotice> {
        match self {
            Request::FrameReady { handle, frame } => Some(FrameNotice::Ready {
                handle: handle.clone(),
                frame: *frame,
            }),
            Request::FrameMissing { frame } => Some(FrameNotice::Missing { frame: *frame }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    State(FitStatus),
    Analysis(Box<AnalysisBundle>),
    Success { message: String },
    Error { message: String },
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Response::Success {
            message: message.into(),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }
}
