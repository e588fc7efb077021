#![allow(dead_code)]

use genstream::{
    GenerationError, GenerationRequest, GenerativeModel, ModelError, StoppingCriterion, TokenId,
    Tokenizer,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const EOS: TokenId = 0;

/// What the scripted model did, readable from the test while it runs.
#[derive(Debug, Default)]
pub struct Probe {
    pub steps_run: AtomicUsize,
    pub finished: AtomicBool,
    pub stopped_by_hook: AtomicBool,
    pub hook_returns: Mutex<Vec<Instant>>,
}

impl Probe {
    pub fn steps_run(&self) -> usize {
        self.steps_run.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn stopped_by_hook(&self) -> bool {
        self.stopped_by_hook.load(Ordering::SeqCst)
    }

    /// Polls until the model's `generate` has returned or `limit` elapses.
    pub async fn wait_finished(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if self.finished() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.finished()
    }
}

struct FinishGuard(Arc<Probe>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.finished.store(true, Ordering::SeqCst);
    }
}

/// A model that appends a scripted batch of tokens per decoding step.
pub struct ScriptedModel {
    steps: Vec<Vec<TokenId>>,
    echo_prompt: bool,
    step_delay: Duration,
    fail_at_step: Option<usize>,
    panic_at_step: Option<usize>,
    pub probe: Arc<Probe>,
}

impl ScriptedModel {
    /// Each step appends `n` copies of the byte `'a'`.
    pub fn with_step_lengths(lengths: &[usize]) -> Self {
        Self::from_steps(
            lengths
                .iter()
                .map(|&n| vec![TokenId::from(b'a'); n])
                .collect(),
        )
    }

    /// Echoes the prompt, then writes `reply` `chunk` bytes per step.
    pub fn replying(reply: &str, chunk: usize) -> Self {
        let steps = reply
            .as_bytes()
            .chunks(chunk)
            .map(|piece| piece.iter().map(|&b| TokenId::from(b)).collect())
            .collect();
        let mut model = Self::from_steps(steps);
        model.echo_prompt = true;
        model
    }

    pub fn from_steps(steps: Vec<Vec<TokenId>>) -> Self {
        Self {
            steps,
            echo_prompt: false,
            step_delay: Duration::ZERO,
            fail_at_step: None,
            panic_at_step: None,
            probe: Arc::new(Probe::default()),
        }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Raises instead of producing step `step` (1-based).
    pub fn failing_at(mut self, step: usize) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    pub fn panicking_at(mut self, step: usize) -> Self {
        self.panic_at_step = Some(step);
        self
    }

    /// Adds a final step emitting only the end-of-sequence token.
    pub fn ending_with_eos(mut self) -> Self {
        self.steps.push(vec![EOS]);
        self
    }

    pub fn probe(&self) -> Arc<Probe> {
        self.probe.clone()
    }
}

impl GenerativeModel for ScriptedModel {
    fn generate(
        &self,
        request: &GenerationRequest,
        hooks: &mut [&mut dyn StoppingCriterion],
    ) -> Result<Vec<TokenId>, ModelError> {
        let _finish = FinishGuard(self.probe.clone());
        let mut output = if self.echo_prompt {
            request.input_ids().to_vec()
        } else {
            Vec::new()
        };

        for (index, tokens) in self.steps.iter().enumerate() {
            let step = index + 1;
            if !self.step_delay.is_zero() {
                std::thread::sleep(self.step_delay);
            }
            if self.fail_at_step == Some(step) {
                return Err(format!("model exploded at step {step}").into());
            }
            if self.panic_at_step == Some(step) {
                panic!("model panicked at step {step}");
            }

            output.extend_from_slice(tokens);
            self.probe.steps_run.fetch_add(1, Ordering::SeqCst);

            let mut stop = false;
            for hook in hooks.iter_mut() {
                stop |= hook.should_stop(&output);
            }
            self.probe.hook_returns.lock().unwrap().push(Instant::now());
            if stop {
                self.probe.stopped_by_hook.store(true, Ordering::SeqCst);
                break;
            }
        }

        Ok(output)
    }
}

/// One token per byte. Decoding drops the end-of-sequence token.
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, GenerationError> {
        Ok(text.bytes().map(TokenId::from).collect())
    }

    fn decode(&self, ids: &[TokenId]) -> Result<String, GenerationError> {
        let bytes = ids
            .iter()
            .filter(|&&id| id != EOS)
            .map(|&id| {
                u8::try_from(id).map_err(|_| GenerationError::Tokenizer(format!("unknown token {id}")))
            })
            .collect::<Result<Vec<u8>, _>>()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token_id(&self) -> Option<TokenId> {
        Some(EOS)
    }
}

pub fn shared(model: ScriptedModel) -> (Arc<dyn GenerativeModel>, Arc<Probe>) {
    let probe = model.probe();
    (Arc::new(model), probe)
}

pub fn tokenizer() -> Arc<dyn Tokenizer> {
    Arc::new(ByteTokenizer)
}
