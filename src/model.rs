//! Capabilities the adapter calls into: the blocking model, its per-step
//! stopping hook, and the tokenizer.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{GenerationError, ModelError};
use crate::request::GenerationRequest;

pub type TokenId = u32;

/// Hook invoked by [`GenerativeModel::generate`] once per decoding step with
/// the cumulative output so far. Returning `true` asks the model to halt.
pub trait StoppingCriterion: Send {
    fn should_stop(&mut self, output_so_far: &[TokenId]) -> bool;
}

/// A model exposing a blocking "generate the whole output" routine.
///
/// Implementations must call every hook in `hooks` after each decoding step
/// and return as soon as any of them asks to stop. The returned sequence is
/// the final cumulative output.
pub trait GenerativeModel: Send + Sync {
    fn generate(
        &self,
        request: &GenerationRequest,
        hooks: &mut [&mut dyn StoppingCriterion],
    ) -> Result<Vec<TokenId>, ModelError>;
}

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, GenerationError>;

    fn decode(&self, ids: &[TokenId]) -> Result<String, GenerationError>;

    fn eos_token_id(&self) -> Option<TokenId> {
        None
    }
}

/// Where the model runs. Travels with each request instead of living in a
/// process-wide default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

/// Sampling parameters for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub num_beams: u32,
    pub max_new_tokens: u32,
    pub do_sample: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 50,
            num_beams: 4,
            max_new_tokens: 128,
            do_sample: true,
        }
    }
}

impl GenerationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_top_k(mut self, top_k: u32) -> Self {
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

    pub fn with_do_sample(mut self, do_sample: bool) -> Self {
        self.do_sample = do_sample;
        self
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(GenerationError::InvalidParams(format!(
                "temperature must be within [0, 1], got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(GenerationError::InvalidParams(format!(
                "top_p must be within [0, 1], got {}",
                self.top_p
            )));
        }
        if self.top_k < 1 {
            return Err(GenerationError::InvalidParams("top_k must be at least 1".to_string()));
        }
        if self.num_beams < 1 {
            return Err(GenerationError::InvalidParams(
                "num_beams must be at least 1".to_string(),
            ));
        }
        if self.max_new_tokens < 1 {
            return Err(GenerationError::InvalidParams(
                "max_new_tokens must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GenerationConfig::default();
        assert_eq!(config.top_k, 50);
        assert_eq!(config.num_beams, 4);
        assert_eq!(config.max_new_tokens, 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_sampling() {
        assert!(GenerationConfig::new().with_temperature(1.5).validate().is_err());
        assert!(GenerationConfig::new().with_temperature(f32::NAN).validate().is_err());
        assert!(GenerationConfig::new().with_top_p(-0.1).validate().is_err());
        assert!(GenerationConfig::new().with_top_k(0).validate().is_err());
        assert!(GenerationConfig::new().with_num_beams(0).validate().is_err());
        assert!(GenerationConfig::new().with_max_new_tokens(0).validate().is_err());
    }

    #[test]
    fn boundary_values_are_accepted() {
        let config = GenerationConfig::new()
            .with_temperature(0.0)
            .with_top_p(1.0)
            .with_top_k(1)
            .with_num_beams(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn device_display() {
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
    }
}
