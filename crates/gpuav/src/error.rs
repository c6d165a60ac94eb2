use gpuav_spirv::SpirvError;
use thiserror::Error;

use crate::driver::DriverError;

pub type Result<T> = std::result::Result<T, GpuAvError>;

/// Errors surfaced by the engine's public entry points.
///
/// Internal failures (instrumentation, decoding) never show up here: they are turned
/// into meta-diagnostics and the application keeps running. What remains are driver
/// failures, which are forwarded as-is, and misuse of the engine API.
#[derive(Debug, Error)]
pub enum GpuAvError {
    #[error("driver call failed: {0}")]
    Driver(#[from] DriverError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown {kind} handle {handle}")]
    UnknownHandle { kind: &'static str, handle: u64 },

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// Why a shader was not (or could not be) rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstrumentError {
    #[error("failed to parse shader: {0}")]
    Parse(#[from] SpirvError),

    #[error("shader has {words} words, above the {limit} word instrumentation limit")]
    TooLarge { words: usize, limit: usize },

    #[error("unsupported shader: {0}")]
    Unsupported(&'static str),

    #[error("rewritten shader failed structural checks: {0}")]
    Malformed(SpirvError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("command buffer {0} has no submission context")]
    UnknownCommandBuffer(u64),

    #[error("command buffer {cmd} is {state}, expected {expected}")]
    InvalidState {
        cmd: u64,
        state: &'static str,
        expected: &'static str,
    },
}
