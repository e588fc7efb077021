use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::handoff::{Handoff, HandoffSender, StepOutput};
use crate::model::{StoppingCriterion, TokenId};

/// Cooperative cancellation signal. Set by the consumer side, polled by the
/// bridge after every published step.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    inner: Arc<AtomicBool>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

/// Forwards each decoding step out of the model's loop.
pub struct CallbackBridge {
    sender: HandoffSender,
    stop: StopFlag,
    steps: usize,
    stop_requested: bool,
}

impl CallbackBridge {
    pub fn new(sender: HandoffSender, stop: StopFlag) -> Self {
        Self {
            sender,
            stop,
            steps: 0,
            stop_requested: false,
        }
    }

    pub fn steps_published(&self) -> usize {
        self.steps
    }

    /// Whether this bridge has asked the model to halt.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub(crate) fn into_sender(self) -> HandoffSender {
        self.sender
    }
}

impl StoppingCriterion for CallbackBridge {
    fn should_stop(&mut self, output_so_far: &[TokenId]) -> bool {
        if self.stop_requested {
            return true;
        }

        // The model keeps mutating its buffer; publish an owned copy.
        let step = StepOutput::new(self.steps + 1, output_so_far.to_vec());
        if self.sender.put_blocking(Handoff::Step(step)).is_err() {
            debug!(step = self.steps + 1, "consumer gone, stopping generation");
            self.stop_requested = true;
            return true;
        }
        self.steps += 1;

        if self.stop.is_set() {
            debug!(step = self.steps, "stop flag observed");
            self.stop_requested = true;
        }
        self.stop_requested
    }
}
