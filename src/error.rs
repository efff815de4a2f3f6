//! Typed error taxonomy covering configuration, devices, network, codec, and
//! DSP failures.

use thiserror::Error;

/// Top-level error type for every fallible operation in the core pipeline.
///
/// `main` wraps this in `anyhow::Result` at the process boundary; inside the
/// library every fallible call returns `Result<T, VoxError>` (or a narrower
/// alias below) so callers can match on category instead of a string.
#[derive(Debug, Error)]
pub enum VoxError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("dsp error: {0}")]
    Dsp(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type VoxResult<T> = Result<T, VoxError>;
