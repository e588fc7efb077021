use thiserror::Error;

/// Error raised by a model's blocking `generate` call.
pub type ModelError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Model execution error: {0}")]
    Model(#[source] ModelError),

    #[error("Timed out waiting for the next generation step")]
    Timeout,

    #[error("Generation worker exited without reporting: {0}")]
    WorkerLost(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Invalid generation parameters: {0}")]
    InvalidParams(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {0} bytes exceeds the configured limit")]
    FrameTooLarge(usize),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GenerationError {
    /// Wraps any model-side failure, keeping it as the error source.
    pub fn model<E>(err: E) -> Self
    where
        E: Into<ModelError>,
    {
        GenerationError::Model(err.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GenerationError::Timeout)
    }
}
