//! Pull-based view over a running generation.
//!
//! A [`GenerationStream`] starts its worker lane on the first poll and
//! yields one decoded chunk per decoding step. Each chunk is the decoded
//! cumulative output, so chunks never shrink.

use futures::{Future, Stream};
use pin_project::{pin_project, pinned_drop};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{sleep, Sleep};
use tracing::{debug, warn};

use crate::bridge::{CallbackBridge, StopFlag};
use crate::errors::GenerationError;
use crate::handoff::{self, Handoff, HandoffReceiver};
use crate::model::Tokenizer;
use crate::request::GenerationRequest;
use crate::worker::{WorkerLane, WorkerReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl GenerationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationState::Completed | GenerationState::Failed | GenerationState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    step_timeout: Option<Duration>,
    stop_at_eos: bool,
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upper bound on the wait for any single step. Exceeding it ends the
    /// stream with [`GenerationError::Timeout`].
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    /// End the stream cleanly, without yielding, at the first step whose
    /// last token is the tokenizer's end-of-sequence id.
    pub fn with_stop_at_eos(mut self, stop_at_eos: bool) -> Self {
        self.stop_at_eos = stop_at_eos;
        self
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout
    }

    pub fn stop_at_eos(&self) -> bool {
        self.stop_at_eos
    }
}

#[pin_project(PinnedDrop)]
pub struct GenerationStream {
    receiver: HandoffReceiver,
    tokenizer: Arc<dyn Tokenizer>,
    stop: StopFlag,
    pending: Option<(GenerationRequest, CallbackBridge)>,
    lane: Option<WorkerLane>,
    report: Option<WorkerReport>,
    state: GenerationState,
    options: StreamOptions,
    #[pin]
    timer: Option<Sleep>,
}

impl GenerationStream {
    pub fn new(
        request: GenerationRequest,
        tokenizer: Arc<dyn Tokenizer>,
        options: StreamOptions,
    ) -> Self {
        let (sender, receiver) = handoff::channel();
        let stop = StopFlag::new();
        let bridge = CallbackBridge::new(sender, stop.clone());

        Self {
            receiver,
            tokenizer,
            stop,
            pending: Some((request, bridge)),
            lane: None,
            report: None,
            state: GenerationState::Idle,
            options,
            timer: None,
        }
    }

    pub fn state(&self) -> GenerationState {
        self.state
    }

    /// Set once the worker lane has been joined, by [`cancel`](Self::cancel)
    /// or after the lane disappeared without a terminal marker.
    pub fn worker_report(&self) -> Option<WorkerReport> {
        self.report
    }

    /// Stops the generation and waits for the worker lane to exit.
    ///
    /// Items still in flight are discarded. Returns the final state, which
    /// is `Cancelled` unless the worker had already finished on its own.
    pub async fn cancel(self: Pin<&mut Self>) -> GenerationState {
        let mut this = self.project();

        match *this.state {
            GenerationState::Idle => {
                this.pending.take();
                *this.state = GenerationState::Cancelled;
                return GenerationState::Cancelled;
            }
            GenerationState::Running => {}
            state => return state,
        }

        this.stop.request_stop();
        this.timer.set(None);
        debug!("cancelling generation");

        let mut discarded = 0usize;
        let final_state = loop {
            match this.receiver.take().await {
                Some(Handoff::Step(_)) => discarded += 1,
                Some(Handoff::StopAcknowledged) => break GenerationState::Cancelled,
                Some(Handoff::Completed) => break GenerationState::Completed,
                Some(Handoff::Failed(err)) => {
                    debug!(error = %err, "model failed while cancelling");
                    break GenerationState::Failed;
                }
                None => break GenerationState::Cancelled,
            }
        };

        if let Some(lane) = this.lane.take() {
            match lane.join().await {
                Ok(report) => {
                    debug!(steps = report.steps, discarded, ?final_state, "worker lane joined");
                    *this.report = Some(report);
                }
                Err(err) => warn!(error = %err, "worker lane lost during cancel"),
            }
        }

        *this.state = final_state;
        final_state
    }
}

impl Stream for GenerationStream {
    type Item = Result<String, GenerationError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        match *this.state {
            GenerationState::Idle => {
                if let Some((request, bridge)) = this.pending.take() {
                    *this.lane = Some(WorkerLane::spawn(request, bridge));
                }
                *this.state = GenerationState::Running;
            }
            GenerationState::Running => {}
            _ => return Poll::Ready(None),
        }

        if let Some(timeout) = this.options.step_timeout {
            if this.timer.is_none() {
                this.timer.set(Some(sleep(timeout)));
            }
        }

        match this.receiver.poll_take(cx) {
            Poll::Ready(Some(Handoff::Step(output))) => {
                this.timer.set(None);

                if this.options.stop_at_eos {
                    if let (Some(eos), Some(last)) = (this.tokenizer.eos_token_id(), output.last_token()) {
                        if eos == last {
                            debug!(step = output.step(), "end-of-sequence token reached");
                            this.stop.request_stop();
                            this.receiver.close();
                            *this.state = GenerationState::Completed;
                            return Poll::Ready(None);
                        }
                    }
                }

                match this.tokenizer.decode(output.tokens()) {
                    Ok(text) => Poll::Ready(Some(Ok(text))),
                    Err(err) => {
                        this.stop.request_stop();
                        this.receiver.close();
                        *this.state = GenerationState::Failed;
                        Poll::Ready(Some(Err(err)))
                    }
                }
            }
            Poll::Ready(Some(Handoff::Completed)) | Poll::Ready(Some(Handoff::StopAcknowledged)) => {
                *this.state = GenerationState::Completed;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Handoff::Failed(err))) => {
                *this.state = GenerationState::Failed;
                Poll::Ready(Some(Err(GenerationError::Model(err))))
            }
            Poll::Ready(None) => {
                // The lane dropped its sender without a marker; its join
                // result says why.
                let err = match this.lane.as_mut().map(|lane| lane.poll_join(cx)) {
                    Some(Poll::Pending) => return Poll::Pending,
                    Some(Poll::Ready(Err(err))) => err,
                    Some(Poll::Ready(Ok(report))) => {
                        *this.report = Some(report);
                        GenerationError::WorkerLost("channel closed without a terminal marker".to_string())
                    }
                    None => GenerationError::WorkerLost("channel closed without a terminal marker".to_string()),
                };
                this.lane.take();
                this.timer.set(None);
                *this.state = GenerationState::Failed;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Pending => {
                if let Some(timer) = this.timer.as_mut().as_pin_mut() {
                    if timer.poll(cx).is_ready() {
                        warn!("no generation step within the step timeout");
                        this.stop.request_stop();
                        this.receiver.close();
                        *this.state = GenerationState::Failed;
                        return Poll::Ready(Some(Err(GenerationError::Timeout)));
                    }
                }
                Poll::Pending
            }
        }
    }
}

#[pinned_drop]
impl PinnedDrop for GenerationStream {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if *this.state == GenerationState::Running {
            debug!("generation stream dropped while running, stopping worker");
            this.stop.request_stop();
            this.receiver.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ModelError;
    use crate::model::{GenerationConfig, GenerativeModel, StoppingCriterion, TokenId};
    use futures::StreamExt;

    struct CountingModel {
        steps: usize,
    }

    impl GenerativeModel for CountingModel {
        fn generate(
            &self,
            request: &GenerationRequest,
            hooks: &mut [&mut dyn StoppingCriterion],
        ) -> Result<Vec<TokenId>, ModelError> {
            let mut output = request.input_ids().to_vec();
            for step in 0..self.steps {
                output.push(step as TokenId + 100);
                if hooks.iter_mut().any(|hook| hook.should_stop(&output)) {
                    break;
                }
            }
            Ok(output)
        }
    }

    struct LengthTokenizer;

    impl Tokenizer for LengthTokenizer {
        fn encode(&self, text: &str) -> Result<Vec<TokenId>, GenerationError> {
            Ok(text.bytes().map(TokenId::from).collect())
        }

        fn decode(&self, ids: &[TokenId]) -> Result<String, GenerationError> {
            Ok("x".repeat(ids.len()))
        }
    }

    fn stream_for(steps: usize) -> GenerationStream {
        let model: Arc<dyn GenerativeModel> = Arc::new(CountingModel { steps });
        let request = GenerationRequest::new(model, vec![1, 2], GenerationConfig::default()).unwrap();
        GenerationStream::new(request, Arc::new(LengthTokenizer), StreamOptions::new())
    }

    #[tokio::test]
    async fn starts_lazily_and_ends_completed() {
        let stream = stream_for(2);
        tokio::pin!(stream);
        assert_eq!(stream.state(), GenerationState::Idle);

        assert_eq!(stream.next().await.unwrap().unwrap(), "xxx");
        assert_eq!(stream.state(), GenerationState::Running);
        assert_eq!(stream.next().await.unwrap().unwrap(), "xxxx");
        assert!(stream.next().await.is_none());
        assert_eq!(stream.state(), GenerationState::Completed);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn cancel_before_start_never_spawns() {
        let stream = stream_for(3);
        tokio::pin!(stream);
        assert_eq!(stream.as_mut().cancel().await, GenerationState::Cancelled);
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(!GenerationState::Idle.is_terminal());
        assert!(!GenerationState::Running.is_terminal());
        assert!(GenerationState::Cancelled.is_terminal());
    }
}
