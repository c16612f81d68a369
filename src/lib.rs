//! ytscript - resilient YouTube transcript acquisition
//!
//! Walks a fixed fallback chain per video: the official captions API, the
//! timedtext endpoint, a player-response scrape behind a circuit breaker,
//! and finally an audio download transcribed by a speech-to-text backend.
//! Egress is proxied with per-job sticky sessions; account cookies are only
//! ever consumed by the audio stage.

pub mod breaker;
pub mod classify;
pub mod cli;
pub mod config;
pub mod cookies;
pub mod jobs;
pub mod metrics;
pub mod output;
pub mod pipeline;
pub mod proxy;
pub mod retry;
pub mod stages;
pub mod transcribe;
pub mod utils;

pub use classify::{classify, FailClass, StageError};
pub use cli::{Cli, Commands, OutputFormat};
pub use config::Config;
pub use pipeline::{AcquisitionRequest, PipelineError, TranscriptPipeline, TranscriptResult};
pub use stages::Stage;

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;
