//! Streams the output of a blocking text-generation call step by step.
//!
//! A model's `generate` runs on a dedicated blocking lane. A
//! [`bridge::CallbackBridge`], installed as the model's stopping criterion,
//! hands every decoding step to the consumer through a single-slot
//! [`handoff`] channel, and a [`stream::GenerationStream`] exposes the steps
//! as a cancellable `futures::Stream` of decoded text.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use futures::StreamExt;
//! # use genstream::{GenerationConfig, GenerationRequest, GenerationStream, StreamOptions};
//! # async fn run(
//! #     model: Arc<dyn genstream::GenerativeModel>,
//! #     tokenizer: Arc<dyn genstream::Tokenizer>,
//! # ) -> Result<(), genstream::GenerationError> {
//! let input_ids = tokenizer.encode("Tell me about alpacas.")?;
//! let request = GenerationRequest::new(model, input_ids, GenerationConfig::default())?;
//! let stream = GenerationStream::new(request, tokenizer, StreamOptions::new());
//! tokio::pin!(stream);
//! while let Some(chunk) = stream.next().await {
//!     println!("{}", chunk?);
//! }
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

pub mod bridge;
pub mod client;
pub mod codec;
pub mod config;
pub mod errors;
pub mod handoff;
pub mod model;
pub mod prompt;
pub mod request;
pub mod server;
pub mod service;
pub mod stream;
pub mod worker;

pub use bridge::{CallbackBridge, StopFlag};
pub use client::GenerationClient;
pub use config::{ModelConfig, QuantType, ServerConfig, ServiceConfig};
pub use errors::{GenerationError, ModelError};
pub use handoff::{Handoff, StepOutput};
pub use model::{Device, GenerationConfig, GenerativeModel, StoppingCriterion, TokenId, Tokenizer};
pub use prompt::{PromptTemplate, Prompter};
pub use request::GenerationRequest;
pub use server::{GenerationServer, ServeOutcome};
pub use service::{EvaluateParams, GenerationService};
pub use stream::{GenerationState, GenerationStream, StreamOptions};

pub mod runtime {
    //! Helpers for configuring Tokio runtimes.
    use std::{env, thread};

    /// Environment variable that controls the number of server worker threads.
    pub const SERVER_THREADS_ENV: &str = "GENSTREAM_SERVER_THREADS";

    /// Environment variable that caps the blocking pool, and with it the
    /// number of generation lanes that can run at once.
    pub const MAX_LANES_ENV: &str = "GENSTREAM_MAX_LANES";

    const DEFAULT_MAX_LANES: usize = 64;

    /// Returns the worker thread count derived from [`SERVER_THREADS_ENV`],
    /// falling back to the number of available CPU threads.
    pub fn server_worker_threads() -> usize {
        threads_from_env(SERVER_THREADS_ENV).unwrap_or_else(default_worker_threads)
    }

    /// Returns the generation lane cap from [`MAX_LANES_ENV`], falling back
    /// to 64.
    pub fn max_generation_lanes() -> usize {
        threads_from_env(MAX_LANES_ENV).unwrap_or(DEFAULT_MAX_LANES)
    }

    /// Parses an environment variable as a positive thread count.
    pub fn threads_from_env(key: &str) -> Option<usize> {
        let raw = env::var(key).ok()?;
        parse_threads(&raw)
    }

    /// A multi-threaded runtime sized from the environment.
    pub fn build_server_runtime() -> std::io::Result<tokio::runtime::Runtime> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(server_worker_threads())
            .max_blocking_threads(max_generation_lanes())
            .thread_name("genstream-worker")
            .enable_all()
            .build()
    }

    fn default_worker_threads() -> usize {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    fn parse_threads(raw: &str) -> Option<usize> {
        let value = raw.trim().parse::<usize>().ok()?;
        (value > 0).then_some(value)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parse_threads_rejects_invalid_values() {
            assert_eq!(parse_threads("0"), None);
            assert_eq!(parse_threads("-1"), None);
            assert_eq!(parse_threads("abc"), None);
        }

        #[test]
        fn parse_threads_accepts_positive_values() {
            assert_eq!(parse_threads("8"), Some(8));
            assert_eq!(parse_threads(" 4 "), Some(4));
        }

        #[test]
        fn builds_runtime_from_defaults() {
            let runtime = build_server_runtime().unwrap();
            assert_eq!(runtime.block_on(async { 2 + 2 }), 4);
        }
    }
}

#[cfg(not(test))]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
