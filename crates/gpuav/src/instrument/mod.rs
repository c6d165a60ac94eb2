//! Shader instrumentation: parse, analyze, rewrite, serialize.
//!
//! [`instrument_shader`] is a pure function of its inputs. It never fails: anything it
//! cannot handle produces a [`Outcome::Skipped`] record carrying the original words, so
//! the pipeline still gets created and runs uninstrumented.

mod analysis;
mod emit;
mod rewrite;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use gpuav_spirv::{op, Module};
use tracing::{debug, warn};

use crate::config::CheckSet;
use crate::error::InstrumentError;
use crate::layout::{InstrumentationLayout, LayoutFingerprint};
use crate::shader::{ShaderImage, SourceId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstrumentOptions {
    pub checks: CheckSet,
    pub safe_mode: bool,
    pub max_shader_words: usize,
    /// Engine-wide id written into every record the shader produces.
    pub shader_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Excluded by the shader name filter.
    Filtered,
    TooLarge { words: usize, limit: usize },
    /// The pipeline layout has no room for the reserved set.
    LayoutNotInstrumentable,
    Failed(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filtered => f.write_str("excluded by shader filter"),
            Self::TooLarge { words, limit } => {
                write!(f, "{words} words exceeds the {limit} word limit")
            }
            Self::LayoutNotInstrumentable => f.write_str("pipeline layout not instrumentable"),
            Self::Failed(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Instrumented,
    /// Nothing to check; the original words are used.
    PassThrough,
    Skipped(SkipReason),
}

impl Outcome {
    /// Whether the skip deserves a `GPUAV-Instrumentation-Skipped` diagnostic.
    pub fn is_reportable_skip(&self) -> bool {
        matches!(
            self,
            Self::Skipped(SkipReason::TooLarge { .. } | SkipReason::Failed(_))
        )
    }
}

/// How a site's instruction relates to its checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// Skipped when a check fails.
    Guarded,
    /// Checked, but always executed.
    ReportOnly,
    /// In a loop header: neither checked nor guarded.
    Unguarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteInfo {
    pub opcode: u16,
    pub checks: CheckSet,
    pub source: Option<SourceLocation>,
    pub guard: Guard,
}

/// Result of instrumenting one shader for one check set and pipeline layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentedShaderRecord {
    pub shader_id: u32,
    pub source: SourceId,
    pub checks: CheckSet,
    pub layout: LayoutFingerprint,
    /// Words to hand to the driver. The original words unless instrumented.
    pub words: Arc<[u32]>,
    pub outcome: Outcome,
    /// Keyed by word offset of the instruction in the original module.
    pub sites: BTreeMap<u32, SiteInfo>,
    pub printf_formats: Vec<String>,
    pub unguarded_sites: u32,
    pub debug_name: Option<String>,
    pub execution_model: Option<u32>,
}

impl InstrumentedShaderRecord {
    pub fn skipped(
        image: &ShaderImage,
        reason: SkipReason,
        layout: LayoutFingerprint,
        options: &InstrumentOptions,
    ) -> Self {
        Self {
            shader_id: options.shader_id,
            source: image.source,
            checks: options.checks,
            layout,
            words: image.words.clone(),
            outcome: Outcome::Skipped(reason),
            sites: BTreeMap::new(),
            printf_formats: Vec::new(),
            unguarded_sites: 0,
            debug_name: image.debug_name.clone(),
            execution_model: first_execution_model(image),
        }
    }

    pub fn is_instrumented(&self) -> bool {
        self.outcome == Outcome::Instrumented
    }

    pub fn site(&self, location: u32) -> Option<&SiteInfo> {
        self.sites.get(&location)
    }

    pub fn printf_format(&self, index: u32) -> Option<&str> {
        self.printf_formats.get(index as usize).map(String::as_str)
    }

    /// Name used in messages.
    pub fn display_name(&self) -> String {
        match &self.debug_name {
            Some(name) => name.clone(),
            None => format!("shader {}", self.source),
        }
    }
}

fn first_execution_model(image: &ShaderImage) -> Option<u32> {
    image
        .interface
        .as_ref()
        .and_then(|i| i.entry_points.first())
        .map(|e| e.execution_model)
}

/// Rewrites `image` to carry the checks in `options.checks`.
pub fn instrument_shader(
    image: &ShaderImage,
    layout: &InstrumentationLayout,
    fingerprint: LayoutFingerprint,
    options: &InstrumentOptions,
) -> InstrumentedShaderRecord {
    let words = image.word_len();
    if words > options.max_shader_words {
        warn!(
            shader = %image.source,
            words,
            limit = options.max_shader_words,
            "shader too large to instrument"
        );
        return InstrumentedShaderRecord::skipped(
            image,
            SkipReason::TooLarge {
                words,
                limit: options.max_shader_words,
            },
            fingerprint,
            options,
        );
    }

    match try_instrument(image, layout, options) {
        Ok(Some(rewritten)) => {
            debug!(
                shader = %image.source,
                shader_id = options.shader_id,
                sites = rewritten.sites.len(),
                unguarded = rewritten.unguarded_sites,
                "instrumented shader"
            );
            InstrumentedShaderRecord {
                shader_id: options.shader_id,
                source: image.source,
                checks: options.checks,
                layout: fingerprint,
                words: rewritten.words.into(),
                outcome: Outcome::Instrumented,
                sites: rewritten.sites,
                printf_formats: rewritten.printf_formats,
                unguarded_sites: rewritten.unguarded_sites,
                debug_name: image.debug_name.clone(),
                execution_model: first_execution_model(image),
            }
        }
        Ok(None) => {
            let mut record =
                InstrumentedShaderRecord::skipped(image, SkipReason::Filtered, fingerprint, options);
            record.outcome = Outcome::PassThrough;
            record
        }
        Err(err) => {
            warn!(shader = %image.source, error = %err, "shader instrumentation skipped");
            InstrumentedShaderRecord::skipped(
                image,
                SkipReason::Failed(err.to_string()),
                fingerprint,
                options,
            )
        }
    }
}

fn try_instrument(
    image: &ShaderImage,
    layout: &InstrumentationLayout,
    options: &InstrumentOptions,
) -> Result<Option<rewrite::Rewritten>, InstrumentError> {
    let module = Module::parse(&image.words)?;
    if module.entry_points.is_empty() {
        return Err(InstrumentError::Unsupported("module has no entry points"));
    }
    if !module.has_capability(op::capability::SHADER) {
        return Err(InstrumentError::Unsupported("module lacks the Shader capability"));
    }
    let plan = analysis::plan_module(&module, layout, options.checks);
    if plan.sites.is_empty() {
        return Ok(None);
    }
    rewrite::rewrite(
        module,
        plan,
        options.shader_id,
        layout.reserved_set,
        options.safe_mode,
    )
    .map(Some)
}
