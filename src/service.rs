use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

use crate::config::ServiceConfig;
use crate::errors::GenerationError;
use crate::model::{GenerationConfig, GenerativeModel, Tokenizer};
use crate::prompt::Prompter;
use crate::request::GenerationRequest;
use crate::stream::{GenerationStream, StreamOptions};
use crate::worker;

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

/// One inbound generation request as the serving layer receives it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateParams {
    pub instruction: String,
    pub input: Option<String>,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub num_beams: u32,
    pub max_new_tokens: u32,
    pub stream_output: bool,
}

impl Default for EvaluateParams {
    fn default() -> Self {
        let defaults = GenerationConfig::default();
        Self {
            instruction: String::new(),
            input: None,
            temperature: defaults.temperature,
            top_p: defaults.top_p,
            top_k: defaults.top_k,
            num_beams: defaults.num_beams,
            max_new_tokens: defaults.max_new_tokens,
            stream_output: false,
        }
    }
}

impl EvaluateParams {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_stream_output(mut self, stream_output: bool) -> Self {
        self.stream_output = stream_output;
        self
    }

    pub fn with_sampling(mut self, temperature: f32, top_p: f32, top_k: u32) -> Self {
        self.temperature = temperature;
        self.top_p = top_p;
        self.top_k = top_k;
        self
    }

    pub fn with_num_beams(mut self, num_beams: u32) -> Self {
        self.num_beams = num_beams;
        self
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: u32) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig::new()
            .with_temperature(self.temperature)
            .with_top_p(self.top_p)
            .with_top_k(self.top_k)
            .with_num_beams(self.num_beams)
            .with_max_new_tokens(self.max_new_tokens)
    }
}

/// Turns [`EvaluateParams`] into a stream of response text, streaming step
/// by step or with a single full-generation call.
#[derive(Clone)]
pub struct GenerationService {
    model: Arc<dyn GenerativeModel>,
    tokenizer: Arc<dyn Tokenizer>,
    prompter: Prompter,
    config: ServiceConfig,
}

impl GenerationService {
    pub fn new(
        model: Arc<dyn GenerativeModel>,
        tokenizer: Arc<dyn Tokenizer>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            model,
            tokenizer,
            prompter: Prompter::new(config.prompt_template()),
            config,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Validates the parameters, renders and encodes the prompt.
    pub fn prepare(&self, params: &EvaluateParams) -> Result<GenerationRequest, GenerationError> {
        self.config.validate()?;
        if params.instruction.trim().is_empty() {
            return Err(GenerationError::InvalidParams("instruction is empty".to_string()));
        }
        let generation_config = params.generation_config();
        generation_config.validate()?;

        let prompt = self
            .prompter
            .generate_prompt(&params.instruction, params.input.as_deref(), None);
        let input_ids = self.tokenizer.encode(&prompt)?;

        Ok(GenerationRequest::new(self.model.clone(), input_ids, generation_config)?
            .with_device(self.config.device()))
    }

    pub fn evaluate(&self, params: EvaluateParams) -> ResponseStream {
        let request = match self.prepare(&params) {
            Ok(request) => request,
            Err(err) => return Box::pin(stream::once(async move { Err::<String, _>(err) })),
        };
        let prompter = self.prompter;
        debug!(stream_output = params.stream_output, ?request, "evaluating");

        if params.stream_output {
            let mut options = StreamOptions::new().with_stop_at_eos(self.config.stop_at_eos());
            if let Some(timeout) = self.config.step_timeout() {
                options = options.with_step_timeout(timeout);
            }
            let chunks = GenerationStream::new(request, self.tokenizer.clone(), options);
            return Box::pin(
                chunks.map(move |chunk| chunk.map(|text| prompter.get_response(&text).to_string())),
            );
        }

        let tokenizer = self.tokenizer.clone();
        let response = async move {
            let output = worker::generate_to_completion(request).await?;
            let text = tokenizer.decode(&output)?;
            Ok::<_, GenerationError>(prompter.get_response(&text).to_string())
        };
        Box::pin(stream::once(response))
    }
}
