//! Per-recording bookkeeping from command buffer begin to result harvest.
//!
//! Each recording owns a [`SubmissionContext`]: the diagnostic output buffer its
//! instrumented draws write into, the input chunks and reserved descriptor sets
//! allocated for it, and the shader records needed to decode what comes back.
//!
//! The recorded commands reference those resources, so they stay with the context for as
//! long as the command buffer can be submitted. Every submission resets the output
//! header and is harvested on its own. Resources go back to the pool once the command
//! buffer is recorded again, freed or abandoned, and never before its last completion
//! token has been signaled.

mod pool;
mod state;

pub use pool::{BufferPool, InputArena, InputChunk, INPUT_CHUNK_BYTES};
pub use state::{RetireReason, SubmissionState};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use crate::decode::{decode_output_buffer, DecodeOutcome, ShaderLookup};
use crate::diagnostics::{rules, DiagnosticSink, ObjectHandle, Severity, ViolationReport};
use crate::driver::{
    BufferHandle, CommandBufferHandle, CompletionToken, DescriptorPoolHandle,
    DescriptorSetHandle, Driver, TokenStatus,
};
use crate::error::{Result, TrackerError};
use crate::instrument::InstrumentedShaderRecord;
use crate::protocol::output_buffer_words;
use crate::stats::GpuAvStats;

/// GPU resources a recording holds until its command buffer is re-recorded or freed.
#[derive(Debug, Default)]
struct Resources {
    output: Option<BufferHandle>,
    chunks: Vec<InputChunk>,
    reserved_sets: Vec<(DescriptorPoolHandle, DescriptorSetHandle)>,
}

impl Resources {
    fn is_empty(&self) -> bool {
        self.output.is_none() && self.chunks.is_empty() && self.reserved_sets.is_empty()
    }

    /// Hands buffers back to the pool for reuse.
    fn recycle(self, driver: &dyn Driver, pool: &mut BufferPool) {
        if let Some(output) = self.output {
            pool.release_output(output);
        }
        for chunk in self.chunks {
            pool.release_chunk(chunk);
        }
        for (descriptor_pool, set) in self.reserved_sets {
            driver.free_descriptor_set(descriptor_pool, set);
        }
    }

    /// Destroys buffers whose contents can no longer be trusted.
    fn discard(self, driver: &dyn Driver, pool: &mut BufferPool) {
        if let Some(output) = self.output {
            pool.discard(driver, output);
        }
        for chunk in self.chunks {
            pool.discard(driver, chunk.buffer);
        }
        for (descriptor_pool, set) in self.reserved_sets {
            driver.free_descriptor_set(descriptor_pool, set);
        }
    }
}

#[derive(Debug)]
pub struct SubmissionContext {
    pub cmd: CommandBufferHandle,
    pub state: SubmissionState,
    pub token: Option<CompletionToken>,
    resources: Resources,
    shaders: ShaderLookup,
    /// Output buffer words read at the last harvest.
    snapshot: Option<Arc<[u32]>>,
    /// State to return to if the pending submission is rejected.
    before_submit: Option<SubmissionState>,
    /// The output buffer could not be reset for the current submission.
    output_stale: bool,
}

impl SubmissionContext {
    fn new(cmd: CommandBufferHandle) -> Self {
        Self {
            cmd,
            state: SubmissionState::Recording,
            token: None,
            resources: Resources::default(),
            shaders: ShaderLookup::new(),
            snapshot: None,
            before_submit: None,
            output_stale: false,
        }
    }

    pub fn output_buffer(&self) -> Option<BufferHandle> {
        self.resources.output
    }

    pub fn shader_count(&self) -> usize {
        self.shaders.len()
    }

    fn advance(&mut self, next: SubmissionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "{} -> {next}",
            self.state
        );
        trace!(submission = self.cmd.raw(), from = %self.state, to = %next, "submission state");
        self.state = next;
    }

    fn object(&self) -> ObjectHandle {
        ObjectHandle::CommandBuffer(self.cmd.raw())
    }
}

#[derive(Debug)]
struct Inner {
    contexts: HashMap<CommandBufferHandle, SubmissionContext>,
    /// Contexts waiting on a completion token, in submission order.
    awaiting: Vec<CommandBufferHandle>,
    /// Contexts retired since the last harvest; they are dropped by the next one.
    retired: Vec<CommandBufferHandle>,
    /// Resources of abandoned recordings still in flight on the GPU.
    deferred: Vec<(CompletionToken, Resources)>,
    pool: BufferPool,
}

fn recording(
    contexts: &mut HashMap<CommandBufferHandle, SubmissionContext>,
    cmd: CommandBufferHandle,
) -> std::result::Result<&mut SubmissionContext, TrackerError> {
    let ctx = match contexts.get_mut(&cmd) {
        Some(ctx) if !ctx.state.is_retired() => ctx,
        _ => return Err(TrackerError::UnknownCommandBuffer(cmd.raw())),
    };
    if ctx.state != SubmissionState::Recording {
        return Err(TrackerError::InvalidState {
            cmd: cmd.raw(),
            state: ctx.state.as_str(),
            expected: SubmissionState::Recording.as_str(),
        });
    }
    Ok(ctx)
}

impl Inner {
    /// Retires a live context without decoding and releases its resources, deferring
    /// them when GPU work may still use them. Returns an abandonment report when the
    /// context had results outstanding.
    fn abandon(
        &mut self,
        driver: &dyn Driver,
        cmd: CommandBufferHandle,
        reason: RetireReason,
    ) -> Option<ViolationReport> {
        let ctx = self.contexts.get_mut(&cmd)?;
        let resources = std::mem::take(&mut ctx.resources);
        let previous = ctx.state;
        ctx.snapshot = None;
        ctx.shaders.clear();
        match previous {
            SubmissionState::Retired(_) => None,
            SubmissionState::Recording | SubmissionState::Harvested => {
                let reason = if previous == SubmissionState::Harvested {
                    RetireReason::Harvested
                } else {
                    reason
                };
                ctx.advance(SubmissionState::Retired(reason));
                resources.recycle(driver, &mut self.pool);
                None
            }
            SubmissionState::Submitted | SubmissionState::AwaitingCompletion => {
                ctx.advance(SubmissionState::Retired(RetireReason::Abandoned));
                let report = ViolationReport::new(
                    Severity::Warning,
                    rules::RESULTS_ABANDONED,
                    ctx.object(),
                    "GPU-assisted validation results were discarded before the submission completed",
                );
                match ctx.token {
                    Some(token) if !resources.is_empty() => self.deferred.push((token, resources)),
                    _ => resources.discard(driver, &mut self.pool),
                }
                Some(report)
            }
        }
    }
}

/// Tracks every recording through submission and harvest.
#[derive(Debug)]
pub struct SubmissionTracker {
    inner: Mutex<Inner>,
    stats: Arc<GpuAvStats>,
}

impl SubmissionTracker {
    pub fn new(capacity: u32, alignment: u64, stats: Arc<GpuAvStats>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                contexts: HashMap::new(),
                awaiting: Vec::new(),
                retired: Vec::new(),
                deferred: Vec::new(),
                pool: BufferPool::new(capacity, alignment),
            }),
            stats,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self, cmd: CommandBufferHandle) -> Option<SubmissionState> {
        self.lock().contexts.get(&cmd).map(|c| c.state)
    }

    pub fn output_buffer(&self, cmd: CommandBufferHandle) -> Option<BufferHandle> {
        self.lock().contexts.get(&cmd).and_then(|c| c.output_buffer())
    }

    /// Contexts currently held, live or retired since the last harvest.
    pub fn tracked(&self) -> usize {
        self.lock().contexts.len()
    }

    /// Buffers created by the pool and not yet destroyed.
    pub fn live_buffers(&self) -> usize {
        self.lock().pool.live_buffers()
    }

    pub fn pooled_buffers(&self) -> usize {
        self.lock().pool.pooled_buffers()
    }

    /// Starts a new recording for `cmd`, retiring whatever context it had before.
    pub fn begin(&self, driver: &dyn Driver, sink: &dyn DiagnosticSink, cmd: CommandBufferHandle) {
        let report = {
            let mut inner = self.lock();
            let report = inner.abandon(driver, cmd, RetireReason::Reset);
            inner.contexts.insert(cmd, SubmissionContext::new(cmd));
            report
        };
        if let Some(report) = report {
            self.stats.inc_submissions_abandoned();
            sink.report(report);
        }
        trace!(submission = cmd.raw(), "recording started");
    }

    /// Remembers shader records the recording's draws use, for decoding its results.
    pub fn note_pipeline(
        &self,
        cmd: CommandBufferHandle,
        records: &[Arc<InstrumentedShaderRecord>],
    ) -> Result<()> {
        let mut inner = self.lock();
        let ctx = recording(&mut inner.contexts, cmd)?;
        for record in records.iter().filter(|r| r.is_instrumented()) {
            ctx.shaders
                .entry(record.shader_id)
                .or_insert_with(|| record.clone());
        }
        Ok(())
    }

    /// The recording's output buffer, acquired and initialized on first use.
    pub fn diagnostic_buffer(&self, driver: &dyn Driver, cmd: CommandBufferHandle) -> Result<BufferHandle> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let ctx = recording(&mut inner.contexts, cmd)?;
        if let Some(output) = ctx.resources.output {
            return Ok(output);
        }
        let output = inner.pool.acquire_output(driver)?;
        ctx.resources.output = Some(output);
        debug!(submission = cmd.raw(), buffer = output.raw(), "attached diagnostic buffer");
        Ok(output)
    }

    /// Uploads `words` into an aligned region of an input chunk.
    ///
    /// Returns `(buffer, offset, size)` in bytes.
    pub fn input_region(
        &self,
        driver: &dyn Driver,
        cmd: CommandBufferHandle,
        words: &[u32],
    ) -> Result<(BufferHandle, u64, u64)> {
        let bytes: &[u8] = bytemuck::cast_slice(words);
        let size = bytes.len() as u64;
        let mut inner = self.lock();
        let inner = &mut *inner;
        let alignment = inner.pool.alignment();
        let ctx = recording(&mut inner.contexts, cmd)?;

        let existing = ctx
            .resources
            .chunks
            .last_mut()
            .and_then(|c| c.arena.alloc(size, alignment).map(|offset| (c.buffer, offset)));
        let (buffer, offset) = match existing {
            Some(found) => found,
            None => {
                let mut chunk = inner.pool.acquire_chunk(driver, size)?;
                let offset = chunk.arena.alloc(size, alignment).unwrap_or(0);
                let buffer = chunk.buffer;
                ctx.resources.chunks.push(chunk);
                (buffer, offset)
            }
        };
        driver.write_buffer(buffer, offset, bytes)?;
        Ok((buffer, offset, size))
    }

    /// Hands a reserved descriptor set to the recording; it is freed at retirement.
    pub fn add_reserved_set(
        &self,
        cmd: CommandBufferHandle,
        pool: DescriptorPoolHandle,
        set: DescriptorSetHandle,
    ) -> Result<()> {
        let mut inner = self.lock();
        recording(&mut inner.contexts, cmd)?.resources.reserved_sets.push((pool, set));
        Ok(())
    }

    /// Moves every tracked recording in `cmds` to `Submitted`.
    ///
    /// A harvested recording gets its output header reset so the new submission reports
    /// only its own findings. A recording still in flight keeps its buffer contents and
    /// is harvested once the newer submission completes. Command buffers the tracker does
    /// not hold a live context for are ignored.
    pub fn mark_submitted(&self, driver: &dyn Driver, cmds: &[CommandBufferHandle]) {
        let mut inner = self.lock();
        let inner = &mut *inner;
        for cmd in cmds {
            let Some(ctx) = inner.contexts.get_mut(cmd) else {
                continue;
            };
            let previous = ctx.state;
            match previous {
                SubmissionState::Recording | SubmissionState::AwaitingCompletion => {}
                SubmissionState::Harvested => {
                    ctx.snapshot = None;
                    if let Some(output) = ctx.resources.output {
                        ctx.output_stale = match inner.pool.reset_output(driver, output) {
                            Ok(()) => false,
                            Err(e) => {
                                warn!(submission = cmd.raw(), error = %e, "failed to reset diagnostic buffer");
                                true
                            }
                        };
                    }
                }
                SubmissionState::Submitted | SubmissionState::Retired(_) => continue,
            }
            ctx.before_submit = Some(previous);
            ctx.advance(SubmissionState::Submitted);
        }
    }

    /// Attaches the completion token of a successful submission.
    pub fn await_completion(&self, cmds: &[CommandBufferHandle], token: CompletionToken) {
        let mut inner = self.lock();
        let inner = &mut *inner;
        for cmd in cmds {
            if let Some(ctx) = inner.contexts.get_mut(cmd) {
                if ctx.state == SubmissionState::Submitted {
                    ctx.token = Some(token);
                    ctx.before_submit = None;
                    ctx.advance(SubmissionState::AwaitingCompletion);
                    if !inner.awaiting.contains(cmd) {
                        inner.awaiting.push(*cmd);
                    }
                }
            }
        }
        debug!(token = token.raw(), count = cmds.len(), "submission awaiting completion");
    }

    /// The driver rejected the submission: nothing reached the GPU, so each recording
    /// returns to the state it was submitted from and keeps its resources.
    pub fn submit_failed(&self, cmds: &[CommandBufferHandle]) {
        let mut inner = self.lock();
        for cmd in cmds {
            if let Some(ctx) = inner.contexts.get_mut(cmd) {
                if ctx.state == SubmissionState::Submitted {
                    let previous = ctx.before_submit.take().unwrap_or(SubmissionState::Recording);
                    trace!(submission = cmd.raw(), to = %previous, "submission rejected");
                    ctx.state = previous;
                }
            }
        }
    }

    /// Decodes every completed submission and reports its findings.
    ///
    /// Harvested contexts keep their snapshot for [`Self::decode_again`] until they are
    /// submitted again, recorded again or freed. Contexts retired since the previous call
    /// are dropped. Returns the number of contexts harvested by this call.
    pub fn harvest(&self, driver: &dyn Driver, sink: &dyn DiagnosticSink) -> usize {
        let mut reports = Vec::new();
        let mut harvested = 0;
        {
            let mut inner = self.lock();
            let Inner {
                contexts,
                awaiting,
                retired,
                deferred,
                pool,
            } = &mut *inner;
            let mut statuses: HashMap<CompletionToken, TokenStatus> = HashMap::new();
            let mut status = |token: CompletionToken| {
                *statuses
                    .entry(token)
                    .or_insert_with(|| driver.token_status(token))
            };

            for cmd in retired.drain(..) {
                if contexts.get(&cmd).is_some_and(|c| c.state.is_retired()) {
                    contexts.remove(&cmd);
                }
            }

            for (token, resources) in std::mem::take(deferred) {
                match status(token) {
                    TokenStatus::Pending => deferred.push((token, resources)),
                    TokenStatus::Complete => resources.recycle(driver, pool),
                    TokenStatus::DeviceLost => resources.discard(driver, pool),
                }
            }

            let output_words = output_buffer_words(pool.capacity());
            for cmd in std::mem::take(awaiting) {
                let Some(ctx) = contexts.get_mut(&cmd) else { continue };
                if ctx.state != SubmissionState::AwaitingCompletion {
                    continue;
                }
                let Some(token) = ctx.token else { continue };
                match status(token) {
                    TokenStatus::Pending => {
                        awaiting.push(cmd);
                        continue;
                    }
                    TokenStatus::DeviceLost => {
                        ctx.advance(SubmissionState::Retired(RetireReason::DeviceLost));
                        std::mem::take(&mut ctx.resources).discard(driver, pool);
                        self.stats.inc_submissions_lost();
                        reports.push(device_lost_report(ctx));
                        retired.push(cmd);
                        continue;
                    }
                    TokenStatus::Complete => {}
                }

                match ctx.resources.output {
                    Some(_) if ctx.output_stale => reports.push(ViolationReport::new(
                        Severity::Error,
                        rules::INTERNAL_ERROR,
                        ctx.object(),
                        "GPU-assisted validation results are unavailable: the diagnostic buffer could not be reset before submission",
                    )),
                    Some(output) => {
                        let mut words = vec![0u32; output_words];
                        match driver.read_buffer(output, 0, bytemuck::cast_slice_mut(&mut words)) {
                            Ok(()) => {
                                let outcome = decode_output_buffer(&words, ctx.object(), &ctx.shaders);
                                self.record_outcome(&outcome);
                                reports.extend(outcome.reports);
                                ctx.snapshot = Some(words.into());
                            }
                            Err(e) => {
                                warn!(submission = ctx.cmd.raw(), error = %e, "failed to read diagnostic buffer");
                                reports.push(ViolationReport::new(
                                    Severity::Error,
                                    rules::INTERNAL_ERROR,
                                    ctx.object(),
                                    format!("failed to read GPU-assisted validation results: {e}"),
                                ));
                            }
                        }
                    }
                    None => {}
                }
                ctx.advance(SubmissionState::Harvested);
                self.stats.inc_submissions_harvested();
                harvested += 1;
            }
        }
        for report in reports {
            sink.report(report);
        }
        harvested
    }

    fn record_outcome(&self, outcome: &DecodeOutcome) {
        self.stats.add_records_decoded(outcome.records.len() as u64);
        self.stats.add_records_malformed(u64::from(outcome.malformed));
        self.stats.add_records_dropped(u64::from(outcome.dropped));
    }

    /// Decodes a harvested context's snapshot again without reporting anything.
    pub fn decode_again(&self, cmd: CommandBufferHandle) -> Option<DecodeOutcome> {
        let inner = self.lock();
        let ctx = inner.contexts.get(&cmd)?;
        if ctx.state != SubmissionState::Harvested {
            return None;
        }
        let words = ctx.snapshot.as_ref()?;
        Some(decode_output_buffer(words, ctx.object(), &ctx.shaders))
    }

    /// Retires every context that has not been harvested, without decoding.
    ///
    /// Emits one device-lost diagnostic per retired context.
    pub fn device_lost(&self, driver: &dyn Driver, sink: &dyn DiagnosticSink) -> usize {
        let reports: Vec<_> = {
            let mut inner = self.lock();
            let Inner {
                contexts,
                awaiting,
                retired,
                deferred,
                pool,
            } = &mut *inner;
            for (_, resources) in deferred.drain(..) {
                resources.discard(driver, pool);
            }
            awaiting.clear();
            contexts
                .values_mut()
                .filter(|ctx| {
                    !ctx.state.is_retired() && ctx.state != SubmissionState::Harvested
                })
                .map(|ctx| {
                    ctx.advance(SubmissionState::Retired(RetireReason::DeviceLost));
                    std::mem::take(&mut ctx.resources).discard(driver, pool);
                    self.stats.inc_submissions_lost();
                    retired.push(ctx.cmd);
                    device_lost_report(ctx)
                })
                .collect()
        };
        warn!(count = reports.len(), "device lost, GPU-assisted validation results discarded");
        let count = reports.len();
        for report in reports {
            sink.report(report);
        }
        count
    }

    /// Cancels one recording. Results still in flight are discarded with a diagnostic.
    ///
    /// The retired context stays visible until the next harvest.
    pub fn abandon(&self, driver: &dyn Driver, sink: &dyn DiagnosticSink, cmd: CommandBufferHandle) {
        let report = {
            let mut inner = self.lock();
            let report = inner.abandon(driver, cmd, RetireReason::Abandoned);
            if inner.contexts.contains_key(&cmd) {
                inner.retired.push(cmd);
            }
            report
        };
        if let Some(report) = report {
            self.stats.inc_submissions_abandoned();
            sink.report(report);
        }
    }

    /// Forgets `cmd` entirely, as when the application frees the command buffer.
    pub fn free(&self, driver: &dyn Driver, sink: &dyn DiagnosticSink, cmd: CommandBufferHandle) {
        let report = {
            let mut inner = self.lock();
            let report = inner.abandon(driver, cmd, RetireReason::Abandoned);
            inner.contexts.remove(&cmd);
            report
        };
        if let Some(report) = report {
            self.stats.inc_submissions_abandoned();
            sink.report(report);
        }
        trace!(submission = cmd.raw(), "recording freed");
    }

    /// Abandons everything and destroys every buffer the pool created.
    ///
    /// The caller must have waited for the device to go idle.
    pub fn shutdown(&self, driver: &dyn Driver, sink: &dyn DiagnosticSink) {
        let reports: Vec<_> = {
            let mut inner = self.lock();
            let cmds: Vec<_> = inner.contexts.keys().copied().collect();
            let reports = cmds
                .into_iter()
                .filter_map(|cmd| inner.abandon(driver, cmd, RetireReason::Abandoned))
                .collect();
            let inner = &mut *inner;
            for (_, resources) in inner.deferred.drain(..) {
                resources.discard(driver, &mut inner.pool);
            }
            inner.pool.destroy_pooled(driver);
            inner.contexts.clear();
            inner.awaiting.clear();
            inner.retired.clear();
            reports
        };
        self.stats.add_submissions_abandoned(reports.len() as u64);
        for report in reports {
            sink.report(report);
        }
    }
}

fn device_lost_report(ctx: &SubmissionContext) -> ViolationReport {
    ViolationReport::new(
        Severity::Error,
        rules::RESULTS_DEVICE_LOST,
        ctx.object(),
        "GPU-assisted validation results are unavailable: the device was lost",
    )
}
