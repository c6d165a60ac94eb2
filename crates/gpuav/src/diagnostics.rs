//! Reports delivered to the application.
//!
//! Violations found on the GPU and the engine's own meta-diagnostics (skipped shaders,
//! truncated results, lost devices) share one report shape and one sink, so the
//! application sees them in the same stream as its parameter validation messages.

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{error, info, warn};

/// Stable rule identifiers.
pub mod rules {
    pub const BUFFER_OOB: &str = "GPUAV-BufferAccess-OutOfBounds";
    pub const DESCRIPTOR_INDEX_OOB: &str = "GPUAV-DescriptorIndex-OutOfBounds";
    pub const DESCRIPTOR_UNINITIALIZED: &str = "GPUAV-Descriptor-Uninitialized";
    pub const ADDRESS_OOB: &str = "GPUAV-BufferDeviceAddress-OutOfBounds";
    pub const PUSH_CONSTANT_OOB: &str = "GPUAV-PushConstant-OutOfRange";
    pub const IMAGE_OOB: &str = "GPUAV-ImageAccess-OutOfBounds";
    pub const DEBUG_PRINTF: &str = "GPUAV-DebugPrintf";

    pub const RESERVED_SLOT_UNAVAILABLE: &str = "GPUAV-Setup-ReservedSlotUnavailable";
    pub const INSTRUMENTATION_SKIPPED: &str = "GPUAV-Instrumentation-Skipped";
    pub const RESULTS_TRUNCATED: &str = "GPUAV-Results-Truncated";
    pub const RESULTS_DEVICE_LOST: &str = "GPUAV-Results-DeviceLost";
    pub const RESULTS_ABANDONED: &str = "GPUAV-Results-Abandoned";
    pub const MALFORMED_RECORD: &str = "GPUAV-Internal-MalformedRecord";
    pub const INTERNAL_ERROR: &str = "GPUAV-Internal-Error";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// The API object a report is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "handle", rename_all = "snake_case")]
pub enum ObjectHandle {
    None,
    ShaderModule(u64),
    PipelineLayout(u64),
    Pipeline(u64),
    CommandBuffer(u64),
    Device,
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::ShaderModule(h) => write!(f, "shader module {h:#x}"),
            Self::PipelineLayout(h) => write!(f, "pipeline layout {h:#x}"),
            Self::Pipeline(h) => write!(f, "pipeline {h:#x}"),
            Self::CommandBuffer(h) => write!(f, "command buffer {h:#x}"),
            Self::Device => f.write_str("device"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationReport {
    pub severity: Severity,
    pub rule_id: &'static str,
    pub message: String,
    pub object: ObjectHandle,
}

impl ViolationReport {
    pub fn new(
        severity: Severity,
        rule_id: &'static str,
        object: ObjectHandle,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            rule_id,
            message: message.into(),
            object,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Receives reports. Must tolerate calls from any thread.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, report: ViolationReport);
}

/// Keeps every report in memory; handy for tests and for batching.
#[derive(Debug, Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<ViolationReport>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<ViolationReport> {
        std::mem::take(&mut *self.reports.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn snapshot(&self) -> Vec<ViolationReport> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn count(&self, rule_id: &str) -> usize {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.rule_id == rule_id)
            .count()
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, report: ViolationReport) {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(report);
    }
}

/// Forwards reports to `tracing` at a level matching their severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, report: ViolationReport) {
        let ViolationReport {
            severity,
            rule_id,
            message,
            object,
        } = report;
        match severity {
            Severity::Error => error!(rule_id, %object, "{message}"),
            Severity::Warning => warn!(rule_id, %object, "{message}"),
            Severity::Info => info!(rule_id, %object, "{message}"),
        }
    }
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for std::sync::Arc<S> {
    fn report(&self, report: ViolationReport) {
        (**self).report(report);
    }
}
