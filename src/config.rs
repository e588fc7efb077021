use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::codec::MAX_WIRE_FRAME_LEN;
use crate::errors::GenerationError;
use crate::model::Device;
use crate::prompt::PromptTemplate;

pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QuantType {
    Fp4,
    #[default]
    Nf4,
}

/// How the served model was loaded. The server logs it on bind; loading
/// itself happens outside this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    model_name_or_path: String,
    lora_model_name_or_path: Option<String>,
    cache_dir: Option<PathBuf>,
    bits: u8,
    quant_type: QuantType,
    double_quant: bool,
    fp16: bool,
    bf16: bool,
    max_memory_mb: u64,
    trust_remote_code: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_name_or_path: "facebook/opt-125m".to_string(),
            lora_model_name_or_path: None,
            cache_dir: None,
            bits: 4,
            quant_type: QuantType::Nf4,
            double_quant: true,
            fp16: false,
            bf16: false,
            max_memory_mb: 80_000,
            trust_remote_code: false,
        }
    }
}

impl ModelConfig {
    pub fn new(model_name_or_path: impl Into<String>) -> Self {
        Self {
            model_name_or_path: model_name_or_path.into(),
            ..Self::default()
        }
    }

    pub fn with_lora_model<S: Into<String>>(mut self, path: S) -> Self {
        self.lora_model_name_or_path = Some(path.into());
        self
    }

    pub fn with_cache_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    pub fn with_bits(mut self, bits: u8) -> Self {
        self.bits = bits;
        self
    }

    pub fn with_quant_type(mut self, quant_type: QuantType) -> Self {
        self.quant_type = quant_type;
        self
    }

    pub fn with_double_quant(mut self, double_quant: bool) -> Self {
        self.double_quant = double_quant;
        self
    }

    pub fn with_fp16(mut self, fp16: bool) -> Self {
        self.fp16 = fp16;
        self
    }

    pub fn with_bf16(mut self, bf16: bool) -> Self {
        self.bf16 = bf16;
        self
    }

    pub fn with_max_memory_mb(mut self, max_memory_mb: u64) -> Self {
        self.max_memory_mb = max_memory_mb;
        self
    }

    pub fn with_trust_remote_code(mut self, trust: bool) -> Self {
        self.trust_remote_code = trust;
        self
    }

    pub fn model_name_or_path(&self) -> &str {
        &self.model_name_or_path
    }

    pub fn lora_model_name_or_path(&self) -> Option<&str> {
        self.lora_model_name_or_path.as_deref()
    }

    pub fn cache_dir(&self) -> Option<&PathBuf> {
        self.cache_dir.as_ref()
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn quant_type(&self) -> QuantType {
        self.quant_type
    }

    pub fn double_quant(&self) -> bool {
        self.double_quant
    }

    pub fn fp16(&self) -> bool {
        self.fp16
    }

    pub fn bf16(&self) -> bool {
        self.bf16
    }

    pub fn max_memory_mb(&self) -> u64 {
        self.max_memory_mb
    }

    pub fn trust_remote_code(&self) -> bool {
        self.trust_remote_code
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.model_name_or_path.trim().is_empty() {
            return Err(GenerationError::Config("model_name_or_path is empty".to_string()));
        }
        if !matches!(self.bits, 4 | 8 | 16 | 32) {
            return Err(GenerationError::Config(format!(
                "bits must be one of 4, 8, 16 or 32, got {}",
                self.bits
            )));
        }
        if self.fp16 && self.bf16 {
            return Err(GenerationError::Config(
                "fp16 and bf16 are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-request behaviour of the generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    prompt_template: PromptTemplate,
    device: Device,
    step_timeout: Option<Duration>,
    stop_at_eos: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            prompt_template: PromptTemplate::Default,
            device: Device::Cpu,
            step_timeout: Some(Duration::from_secs(30)),
            stop_at_eos: true,
        }
    }
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompt_template(mut self, template: PromptTemplate) -> Self {
        self.prompt_template = template;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn without_step_timeout(mut self) -> Self {
        self.step_timeout = None;
        self
    }

    pub fn with_stop_at_eos(mut self, stop_at_eos: bool) -> Self {
        self.stop_at_eos = stop_at_eos;
        self
    }

    pub fn prompt_template(&self) -> PromptTemplate {
        self.prompt_template
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout
    }

    pub fn stop_at_eos(&self) -> bool {
        self.stop_at_eos
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.step_timeout == Some(Duration::ZERO) {
            return Err(GenerationError::Config("step_timeout must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,

    pub max_frame_len: usize,

    pub model: ModelConfig,

    pub service: ServiceConfig,
}

impl ServerConfig {
    pub fn new(bind_address: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            model: ModelConfig::default(),
            service: ServiceConfig::default(),
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.model = model;
        self
    }

    pub fn with_service(mut self, service: ServiceConfig) -> Self {
        self.service = service;
        self
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.bind_address.trim().is_empty() {
            return Err(GenerationError::Config("bind_address is empty".to_string()));
        }
        if self.max_frame_len == 0 {
            return Err(GenerationError::Config("max_frame_len must be positive".to_string()));
        }
        if self.max_frame_len > MAX_WIRE_FRAME_LEN {
            return Err(GenerationError::Config(format!(
                "max_frame_len must not exceed {MAX_WIRE_FRAME_LEN}"
            )));
        }
        self.service.validate()?;
        self.model.validate()
    }
}
