//! Runs the model's blocking `generate` off the async executor.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::task::{JoinError, JoinHandle};
use tracing::debug;

use crate::bridge::CallbackBridge;
use crate::errors::GenerationError;
use crate::handoff::Handoff;
use crate::model::{StoppingCriterion, TokenId};
use crate::request::GenerationRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneOutcome {
    Completed,
    Failed,
    Stopped,
}

/// What a lane did, available once it has been joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub steps: usize,
    pub outcome: LaneOutcome,
}

/// One blocking-pool task per request, calling `generate` exactly once.
#[derive(Debug)]
pub struct WorkerLane {
    handle: JoinHandle<WorkerReport>,
}

impl WorkerLane {
    pub fn spawn(request: GenerationRequest, bridge: CallbackBridge) -> Self {
        let handle = tokio::task::spawn_blocking(move || run_lane(request, bridge));
        Self { handle }
    }

    pub fn poll_join(&mut self, cx: &mut Context<'_>) -> Poll<Result<WorkerReport, GenerationError>> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| joined.map_err(lost_worker))
    }

    pub async fn join(self) -> Result<WorkerReport, GenerationError> {
        self.handle.await.map_err(lost_worker)
    }
}

fn lost_worker(err: JoinError) -> GenerationError {
    match err.try_into_panic() {
        Ok(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|message| message.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            GenerationError::WorkerLost(format!("model panicked: {message}"))
        }
        Err(err) => GenerationError::WorkerLost(err.to_string()),
    }
}

fn run_lane(request: GenerationRequest, mut bridge: CallbackBridge) -> WorkerReport {
    debug!(
        device = %request.device(),
        input_len = request.input_ids().len(),
        "generation lane started"
    );

    let result = {
        let mut hooks: [&mut dyn StoppingCriterion; 1] = [&mut bridge];
        request.model().generate(&request, &mut hooks)
    };

    let steps = bridge.steps_published();
    let (marker, outcome) = if bridge.stop_requested() {
        (Handoff::StopAcknowledged, LaneOutcome::Stopped)
    } else {
        match result {
            Ok(_) => (Handoff::Completed, LaneOutcome::Completed),
            Err(err) => {
                debug!(error = %err, steps, "model raised during generation");
                (Handoff::Failed(err), LaneOutcome::Failed)
            }
        }
    };

    if bridge.into_sender().put_blocking(marker).is_err() {
        debug!(steps, ?outcome, "consumer left before the terminal marker");
    }
    debug!(steps, ?outcome, "generation lane finished");

    WorkerReport { steps, outcome }
}

/// Single full-generation call with no step hooks, for callers that do not
/// stream.
pub async fn generate_to_completion(
    request: GenerationRequest,
) -> Result<Vec<TokenId>, GenerationError> {
    tokio::task::spawn_blocking(move || request.model().generate(&request, &mut []))
        .await
        .map_err(lost_worker)?
        .map_err(GenerationError::Model)
}
