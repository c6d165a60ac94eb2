//! GPU-assisted validation.
//!
//! Catches errors only visible while shaders run: out-of-bounds buffer and image
//! accesses, bad descriptor indices, uninitialized descriptors, stray buffer device
//! addresses and out-of-range push constant reads. Shaders are rewritten to check each
//! access and append a record to a diagnostic buffer when a check fails. Once the GPU
//! signals completion those records are decoded into [`ViolationReport`]s delivered
//! through the application's [`DiagnosticSink`].
//!
//! [`GpuAv`] is the entry point: one per device, wrapping a [`Driver`].
//!
//! Instrumentation problems never reach the application as errors. A shader that cannot
//! be rewritten runs as written and a meta-diagnostic says so.

#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
pub mod decode;
pub mod diagnostics;
pub mod driver;
mod engine;
pub mod error;
pub mod instrument;
pub mod layout;
pub mod printf;
pub mod protocol;
pub mod shader;
pub mod stats;
pub mod tracker;

pub use crate::cache::{CacheKey, CacheStats, ShaderCache};
pub use crate::config::{CheckSet, GpuAvConfig};
pub use crate::decode::{decode_output_buffer, DecodeOutcome, ShaderLookup};
pub use crate::diagnostics::{
    rules, CollectingSink, DiagnosticSink, ObjectHandle, Severity, TracingSink, ViolationReport,
};
pub use crate::driver::Driver;
pub use crate::engine::GpuAv;
pub use crate::error::{GpuAvError, InstrumentError, Result, TrackerError};
pub use crate::instrument::{
    instrument_shader, InstrumentOptions, InstrumentedShaderRecord, Outcome, SkipReason,
};
pub use crate::layout::{LayoutAugmentation, LayoutManager};
pub use crate::protocol::{DiagnosticRecord, Payload, RecordKind};
pub use crate::shader::{ShaderImage, SourceId};
pub use crate::stats::{GpuAvStats, GpuAvStatsSnapshot};
pub use crate::tracker::{RetireReason, SubmissionState, SubmissionTracker};
