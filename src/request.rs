use std::fmt;
use std::sync::Arc;

use crate::errors::GenerationError;
use crate::model::{Device, GenerationConfig, GenerativeModel, TokenId};

/// Everything one blocking generation call needs. Built once per inbound
/// request and moved into the worker lane.
#[derive(Clone)]
pub struct GenerationRequest {
    input_ids: Arc<[TokenId]>,
    config: GenerationConfig,
    device: Device,
    model: Arc<dyn GenerativeModel>,
}

impl GenerationRequest {
    pub fn new(
        model: Arc<dyn GenerativeModel>,
        input_ids: Vec<TokenId>,
        config: GenerationConfig,
    ) -> Result<Self, GenerationError> {
        config.validate()?;
        Ok(Self {
            input_ids: input_ids.into(),
            config,
            device: Device::default(),
            model,
        })
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn input_ids(&self) -> &[TokenId] {
        &self.input_ids
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn model(&self) -> &Arc<dyn GenerativeModel> {
        &self.model
    }
}

impl fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("input_len", &self.input_ids.len())
            .field("config", &self.config)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}
