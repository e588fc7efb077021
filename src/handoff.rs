//! Single-slot rendezvous between the worker lane and the consumer.
//!
//! The slot holds at most one unread item. A `put` while it is occupied
//! waits until the consumer takes the previous item, so a slow consumer
//! throttles generation instead of letting steps pile up.

use std::fmt;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::errors::{GenerationError, ModelError};
use crate::model::TokenId;

const SLOT_CAPACITY: usize = 1;

/// Cumulative output after one decoding step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    step: usize,
    tokens: Vec<TokenId>,
}

impl StepOutput {
    pub fn new(step: usize, tokens: Vec<TokenId>) -> Self {
        Self { step, tokens }
    }

    /// 1-based index of the decoding step that produced this output.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn last_token(&self) -> Option<TokenId> {
        self.tokens.last().copied()
    }
}

pub enum Handoff {
    Step(StepOutput),
    Completed,
    Failed(ModelError),
    StopAcknowledged,
}

impl fmt::Debug for Handoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handoff::Step(output) => f
                .debug_struct("Step")
                .field("step", &output.step)
                .field("len", &output.tokens.len())
                .finish(),
            Handoff::Completed => write!(f, "Completed"),
            Handoff::Failed(err) => f.debug_tuple("Failed").field(&err.to_string()).finish(),
            Handoff::StopAcknowledged => write!(f, "StopAcknowledged"),
        }
    }
}

/// The consumer side is gone; nothing will ever read this item.
#[derive(Debug, Error)]
#[error("handoff channel closed")]
pub struct Closed;

pub fn channel() -> (HandoffSender, HandoffReceiver) {
    let (tx, rx) = mpsc::channel(SLOT_CAPACITY);
    (HandoffSender { inner: tx }, HandoffReceiver { inner: rx })
}

#[derive(Debug)]
pub struct HandoffSender {
    inner: mpsc::Sender<Handoff>,
}

impl HandoffSender {
    /// Blocks the calling thread until the slot is free. Must only be called
    /// from a blocking context, never from inside an async task.
    pub fn put_blocking(&self, item: Handoff) -> Result<(), Closed> {
        self.inner.blocking_send(item).map_err(|_| Closed)
    }

    pub async fn put(&self, item: Handoff) -> Result<(), Closed> {
        self.inner.send(item).await.map_err(|_| Closed)
    }
}

#[derive(Debug)]
pub struct HandoffReceiver {
    inner: mpsc::Receiver<Handoff>,
}

impl HandoffReceiver {
    /// Waits for the next item. `None` means the sender is gone.
    pub async fn take(&mut self) -> Option<Handoff> {
        self.inner.recv().await
    }

    pub async fn take_timeout(&mut self, timeout: Duration) -> Result<Option<Handoff>, GenerationError> {
        tokio::time::timeout(timeout, self.inner.recv())
            .await
            .map_err(|_| GenerationError::Timeout)
    }

    pub fn poll_take(&mut self, cx: &mut Context<'_>) -> Poll<Option<Handoff>> {
        self.inner.poll_recv(cx)
    }

    /// Refuses further items. A `put` waiting on the slot fails with
    /// [`Closed`]; an item already in the slot can still be taken.
    pub fn close(&mut self) {
        self.inner.close();
    }
}
