//! The device-lifetime validation context.
//!
//! [`GpuAv`] sits between the application and a [`Driver`]. Every entry point forwards to
//! the driver; when validation is enabled it also keeps the side tables needed to swap in
//! instrumented shaders, bind the reserved descriptor set before each draw or dispatch,
//! and decode what the shaders report once the GPU is done.

mod shadow;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStats, ShaderCache};
use crate::config::GpuAvConfig;
use crate::decode::DecodeOutcome;
use crate::diagnostics::{rules, DiagnosticSink, ObjectHandle, Severity, ViolationReport};
use crate::driver::{
    BufferDesc, BufferHandle, BufferUsage, CommandBufferHandle, CompletionToken,
    ComputePipelineDesc, DescriptorPoolDesc, DescriptorPoolHandle, DescriptorResource,
    DescriptorSetHandle, DescriptorSetLayoutDesc, DescriptorSetLayoutHandle, DescriptorWrite,
    DeviceLimits, DispatchParams, DrawParams, Driver, GraphicsPipelineDesc, PipelineBindPoint,
    PipelineHandle, PipelineLayoutDesc, PipelineLayoutHandle, ShaderModuleHandle,
    ShaderStageDesc, WHOLE_SIZE,
};
use crate::error::{GpuAvError, Result};
use crate::instrument::{instrument_shader, InstrumentOptions, InstrumentedShaderRecord, Outcome};
use crate::layout::{
    augment_pool_sizes, reserved_set_layout_desc, AugmentedLayout, InternalSetLayouts,
    LayoutAugmentation, LayoutManager, INPUT_BINDING, OUTPUT_BINDING,
};
use crate::shader::{ShaderImage, SourceId};
use crate::stats::GpuAvStats;
use crate::tracker::{SubmissionState, SubmissionTracker};

use shadow::ShadowState;

/// Reserved sets per engine-owned descriptor pool.
const RESERVED_SETS_PER_POOL: u32 = 256;

#[derive(Debug)]
struct PipelineInfo {
    bind_point: PipelineBindPoint,
    /// Set when at least one stage runs instrumented.
    layout: Option<Arc<AugmentedLayout>>,
    records: Vec<Arc<InstrumentedShaderRecord>>,
}

#[derive(Debug, Default, Clone)]
struct BindPointState {
    pipeline: Option<PipelineHandle>,
    sets: Vec<Option<DescriptorSetHandle>>,
}

#[derive(Debug, Default)]
struct Recording {
    compute: BindPointState,
    graphics: BindPointState,
}

impl Recording {
    fn bind_point(&mut self, bind_point: PipelineBindPoint) -> &mut BindPointState {
        match bind_point {
            PipelineBindPoint::Compute => &mut self.compute,
            PipelineBindPoint::Graphics => &mut self.graphics,
        }
    }
}

#[derive(Debug, Default)]
struct ShaderTable {
    modules: HashMap<ShaderModuleHandle, Arc<ShaderImage>>,
    /// Live modules per source hash; the cache is evicted when it drops to zero.
    sources: HashMap<SourceId, usize>,
}

/// What a pipeline stage ends up running.
struct StageBuild {
    module: ShaderModuleHandle,
    record: Option<Arc<InstrumentedShaderRecord>>,
    /// Instrumented module created for pipeline creation only.
    temporary: Option<ShaderModuleHandle>,
}

pub struct GpuAv<D: Driver> {
    driver: D,
    config: GpuAvConfig,
    sink: Arc<dyn DiagnosticSink>,
    stats: Arc<GpuAvStats>,
    limits: DeviceLimits,
    internal: Option<InternalSetLayouts>,
    layouts: LayoutManager,
    cache: ShaderCache,
    tracker: SubmissionTracker,
    shaders: Mutex<ShaderTable>,
    pipelines: Mutex<HashMap<PipelineHandle, Arc<PipelineInfo>>>,
    recordings: Mutex<HashMap<CommandBufferHandle, Recording>>,
    shadow: Mutex<ShadowState>,
    reserved_pools: Mutex<Vec<DescriptorPoolHandle>>,
    next_shader_id: AtomicU32,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl<D: Driver> GpuAv<D> {
    /// Validates `config` and sets up the engine-owned layouts.
    pub fn new(driver: D, config: GpuAvConfig, sink: Arc<dyn DiagnosticSink>) -> Result<Self> {
        config.validate()?;
        let limits = driver.limits();
        let stats = Arc::new(GpuAvStats::new());

        let internal = if config.enabled {
            let empty = driver.create_descriptor_set_layout(&DescriptorSetLayoutDesc::default())?;
            let reserved = match driver.create_descriptor_set_layout(&reserved_set_layout_desc()) {
                Ok(reserved) => reserved,
                Err(e) => {
                    driver.destroy_descriptor_set_layout(empty);
                    return Err(e.into());
                }
            };
            Some(InternalSetLayouts { empty, reserved })
        } else {
            None
        };
        info!(
            enabled = config.enabled,
            checks = ?config.checks,
            safe_mode = config.safe_mode,
            capacity = config.buffer_capacity,
            "GPU-assisted validation initialized"
        );

        Ok(Self {
            layouts: LayoutManager::new(
                limits,
                config.reserved_set,
                config.max_tracked_descriptors,
                stats.clone(),
            ),
            cache: ShaderCache::new(stats.clone()),
            tracker: SubmissionTracker::new(
                config.buffer_capacity,
                limits.min_storage_buffer_offset_alignment,
                stats.clone(),
            ),
            driver,
            config,
            sink,
            stats,
            limits,
            internal,
            shaders: Mutex::default(),
            pipelines: Mutex::default(),
            recordings: Mutex::default(),
            shadow: Mutex::default(),
            reserved_pools: Mutex::default(),
            next_shader_id: AtomicU32::new(1),
        })
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn config(&self) -> &GpuAvConfig {
        &self.config
    }

    pub fn limits(&self) -> DeviceLimits {
        self.limits
    }

    pub fn stats(&self) -> &GpuAvStats {
        &self.stats
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn enabled(&self) -> bool {
        self.internal.is_some()
    }

    fn report(&self, report: ViolationReport) {
        self.sink.report(report);
    }

    // Shader modules

    pub fn create_shader_module(
        &self,
        words: &[u32],
        debug_name: Option<&str>,
    ) -> Result<ShaderModuleHandle> {
        let handle = self.driver.create_shader_module(words)?;
        if self.enabled() {
            let image = Arc::new(ShaderImage::new(words, debug_name.map(str::to_owned)));
            let mut shaders = lock(&self.shaders);
            *shaders.sources.entry(image.source).or_default() += 1;
            shaders.modules.insert(handle, image);
        }
        Ok(handle)
    }

    /// Destroys the module. Instrumented variants are evicted once no live module shares
    /// the same words; pipelines already built keep theirs.
    pub fn destroy_shader_module(&self, module: ShaderModuleHandle) {
        self.driver.destroy_shader_module(module);
        let orphaned = {
            let mut shaders = lock(&self.shaders);
            let Some(image) = shaders.modules.remove(&module) else {
                return;
            };
            match shaders.sources.get_mut(&image.source) {
                Some(refs) if *refs > 1 => {
                    *refs -= 1;
                    None
                }
                _ => {
                    shaders.sources.remove(&image.source);
                    Some(image.source)
                }
            }
        };
        if let Some(source) = orphaned {
            let evicted = self.cache.evict_source(source);
            debug!(%source, evicted, "evicted instrumented shaders");
        }
    }

    // Layouts

    pub fn create_descriptor_set_layout(
        &self,
        desc: &DescriptorSetLayoutDesc,
    ) -> Result<DescriptorSetLayoutHandle> {
        let handle = self.driver.create_descriptor_set_layout(desc)?;
        if self.enabled() {
            self.layouts.register_set_layout(handle, desc.clone());
        }
        Ok(handle)
    }

    pub fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle) {
        self.layouts.forget_set_layout(layout);
        self.driver.destroy_descriptor_set_layout(layout);
    }

    /// Creates the application's layout and, when there is room, its instrumented twin.
    pub fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> Result<PipelineLayoutHandle> {
        let handle = self.driver.create_pipeline_layout(desc)?;
        if let Some(internal) = self.internal {
            self.layouts
                .augment_pipeline_layout(handle, desc, internal, &*self.sink, |twin| {
                    self.driver.create_pipeline_layout(twin)
                });
        }
        Ok(handle)
    }

    pub fn pipeline_layout_augmentation(
        &self,
        layout: PipelineLayoutHandle,
    ) -> Option<LayoutAugmentation> {
        self.layouts.lookup(layout)
    }

    pub fn destroy_pipeline_layout(&self, layout: PipelineLayoutHandle) {
        if let Some(twin) = self.layouts.forget(layout) {
            self.driver.destroy_pipeline_layout(twin);
        }
        self.driver.destroy_pipeline_layout(layout);
    }

    // Pipelines

    fn next_shader_id(&self) -> u32 {
        self.next_shader_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Looks up or builds the instrumented variant of `module` for `layout`.
    fn build_stage(
        &self,
        module: ShaderModuleHandle,
        layout: Option<&AugmentedLayout>,
    ) -> StageBuild {
        let original = StageBuild {
            module,
            record: None,
            temporary: None,
        };
        let Some(layout) = layout else {
            return original;
        };
        let Some(image) = lock(&self.shaders).modules.get(&module).cloned() else {
            debug!(module = module.raw(), "pipeline uses a module the engine never saw");
            return original;
        };
        if !self.config.shader_selected(image.debug_name.as_deref()) {
            debug!(module = module.raw(), "shader excluded by filter");
            return original;
        }

        let key = CacheKey::new(image.source, self.config.checks, layout.fingerprint);
        let mut built = false;
        let record = self.cache.get_or_build(key, || {
            built = true;
            instrument_shader(
                &image,
                &layout.instrumentation,
                layout.fingerprint,
                &InstrumentOptions {
                    checks: self.config.checks,
                    safe_mode: self.config.safe_mode,
                    max_shader_words: self.config.max_shader_words,
                    shader_id: self.next_shader_id(),
                },
            )
        });
        if built {
            match &record.outcome {
                Outcome::Instrumented => self.stats.inc_shaders_instrumented(),
                Outcome::PassThrough => self.stats.inc_shaders_passed_through(),
                Outcome::Skipped(_) => self.stats.inc_shaders_skipped(),
            }
            if let Outcome::Skipped(reason) = &record.outcome {
                if record.outcome.is_reportable_skip() {
                    self.report(ViolationReport::new(
                        Severity::Warning,
                        rules::INSTRUMENTATION_SKIPPED,
                        ObjectHandle::ShaderModule(module.raw()),
                        format!(
                            "{} runs without GPU-assisted validation: {reason}",
                            record.display_name()
                        ),
                    ));
                }
            }
        }
        if !record.is_instrumented() {
            return original;
        }

        match self.driver.create_shader_module(&record.words) {
            Ok(instrumented) => StageBuild {
                module: instrumented,
                record: Some(record),
                temporary: Some(instrumented),
            },
            Err(e) => {
                warn!(module = module.raw(), error = %e, "driver rejected instrumented module");
                self.report(ViolationReport::new(
                    Severity::Warning,
                    rules::INTERNAL_ERROR,
                    ObjectHandle::ShaderModule(module.raw()),
                    format!(
                        "{} runs without GPU-assisted validation: driver rejected the instrumented module: {e}",
                        record.display_name()
                    ),
                ));
                original
            }
        }
    }

    fn augmented(&self, layout: PipelineLayoutHandle) -> Option<Arc<AugmentedLayout>> {
        self.layouts
            .lookup(layout)
            .and_then(|a| a.augmented().cloned())
    }

    fn register_pipeline(
        &self,
        pipeline: PipelineHandle,
        bind_point: PipelineBindPoint,
        layout: Option<Arc<AugmentedLayout>>,
        records: Vec<Arc<InstrumentedShaderRecord>>,
    ) {
        debug!(
            pipeline = pipeline.raw(),
            instrumented = records.len(),
            "created pipeline"
        );
        lock(&self.pipelines).insert(
            pipeline,
            Arc::new(PipelineInfo {
                bind_point,
                layout: if records.is_empty() { None } else { layout },
                records,
            }),
        );
    }

    pub fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> Result<PipelineHandle> {
        if !self.enabled() {
            return Ok(self.driver.create_compute_pipeline(desc)?);
        }
        let layout = self.augmented(desc.layout);
        let stage = self.build_stage(desc.module, layout.as_deref());
        let pipeline = match (&stage.record, &layout) {
            (Some(_), Some(augmented)) => self.driver.create_compute_pipeline(&ComputePipelineDesc {
                layout: augmented.driver_layout,
                module: stage.module,
                entry_point: desc.entry_point.clone(),
            }),
            _ => self.driver.create_compute_pipeline(desc),
        };
        if let Some(temporary) = stage.temporary {
            self.driver.destroy_shader_module(temporary);
        }
        let pipeline = pipeline?;
        self.register_pipeline(
            pipeline,
            PipelineBindPoint::Compute,
            layout,
            stage.record.into_iter().collect(),
        );
        Ok(pipeline)
    }

    /// Stages are instrumented independently. If any stage is, the pipeline is built
    /// against the twin layout.
    pub fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<PipelineHandle> {
        if !self.enabled() {
            return Ok(self.driver.create_graphics_pipeline(desc)?);
        }
        let layout = self.augmented(desc.layout);
        let builds: Vec<StageBuild> = desc
            .stages
            .iter()
            .map(|s| self.build_stage(s.module, layout.as_deref()))
            .collect();
        let records: Vec<_> = builds.iter().filter_map(|b| b.record.clone()).collect();

        let pipeline = match &layout {
            Some(augmented) if !records.is_empty() => {
                self.driver.create_graphics_pipeline(&GraphicsPipelineDesc {
                    layout: augmented.driver_layout,
                    stages: desc
                        .stages
                        .iter()
                        .zip(&builds)
                        .map(|(s, b)| ShaderStageDesc {
                            stage: s.stage,
                            module: b.module,
                            entry_point: s.entry_point.clone(),
                        })
                        .collect(),
                })
            }
            _ => self.driver.create_graphics_pipeline(desc),
        };
        for temporary in builds.iter().filter_map(|b| b.temporary) {
            self.driver.destroy_shader_module(temporary);
        }
        let pipeline = pipeline?;
        self.register_pipeline(pipeline, PipelineBindPoint::Graphics, layout, records);
        Ok(pipeline)
    }

    /// Whether `pipeline` runs at least one instrumented stage.
    pub fn pipeline_instrumented(&self, pipeline: PipelineHandle) -> bool {
        lock(&self.pipelines)
            .get(&pipeline)
            .is_some_and(|p| p.layout.is_some())
    }

    /// Instrumented shader records of `pipeline`'s stages.
    pub fn pipeline_records(&self, pipeline: PipelineHandle) -> Vec<Arc<InstrumentedShaderRecord>> {
        lock(&self.pipelines)
            .get(&pipeline)
            .map(|p| p.records.clone())
            .unwrap_or_default()
    }

    pub fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        lock(&self.pipelines).remove(&pipeline);
        self.driver.destroy_pipeline(pipeline);
    }

    // Descriptors and buffers

    pub fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc) -> Result<DescriptorPoolHandle> {
        Ok(self.driver.create_descriptor_pool(desc)?)
    }

    pub fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        lock(&self.shadow).destroy_pool(pool);
        self.driver.destroy_descriptor_pool(pool);
    }

    pub fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle> {
        let set = self.driver.allocate_descriptor_set(pool, layout)?;
        if self.enabled() {
            lock(&self.shadow).allocate_set(pool, set);
        }
        Ok(set)
    }

    pub fn free_descriptor_set(&self, pool: DescriptorPoolHandle, set: DescriptorSetHandle) {
        lock(&self.shadow).free_set(set);
        self.driver.free_descriptor_set(pool, set);
    }

    pub fn update_descriptor_set(&self, set: DescriptorSetHandle, writes: &[DescriptorWrite]) {
        if self.enabled() {
            lock(&self.shadow).update_set(set, writes);
        }
        self.driver.update_descriptor_set(set, writes);
    }

    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        let buffer = self.driver.create_buffer(desc)?;
        if self.enabled() {
            let address = if desc.usage.contains(BufferUsage::DEVICE_ADDRESS) {
                self.driver.buffer_device_address(buffer)
            } else {
                None
            };
            lock(&self.shadow).create_buffer(buffer, desc, address);
        }
        Ok(buffer)
    }

    pub fn destroy_buffer(&self, buffer: BufferHandle) {
        lock(&self.shadow).destroy_buffer(buffer);
        self.driver.destroy_buffer(buffer);
    }

    // Command recording

    pub fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()> {
        self.driver.begin_command_buffer(cmd)?;
        if self.enabled() {
            self.tracker.begin(&self.driver, &*self.sink, cmd);
            lock(&self.recordings).insert(cmd, Recording::default());
        }
        Ok(())
    }

    pub fn end_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()> {
        self.driver.end_command_buffer(cmd)?;
        // Bind state only matters while commands are recorded.
        lock(&self.recordings).remove(&cmd);
        Ok(())
    }

    /// Stops tracking `cmd`, discarding any results it has in flight.
    pub fn abandon_command_buffer(&self, cmd: CommandBufferHandle) {
        if self.enabled() {
            lock(&self.recordings).remove(&cmd);
            self.tracker.abandon(&self.driver, &*self.sink, cmd);
        }
    }

    /// Releases everything held for `cmd`. Call when the application frees the command
    /// buffer; the GPU must be done with it.
    pub fn free_command_buffer(&self, cmd: CommandBufferHandle) {
        if self.enabled() {
            lock(&self.recordings).remove(&cmd);
            self.tracker.free(&self.driver, &*self.sink, cmd);
        }
    }

    /// Command buffers the engine currently holds state for.
    pub fn tracked_command_buffers(&self) -> usize {
        self.tracker.tracked()
    }

    pub fn cmd_bind_pipeline(
        &self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
    ) {
        if self.enabled() {
            if let Some(recording) = lock(&self.recordings).get_mut(&cmd) {
                recording.bind_point(bind_point).pipeline = Some(pipeline);
            }
        }
        self.driver.cmd_bind_pipeline(cmd, bind_point, pipeline);
    }

    pub fn cmd_bind_descriptor_sets(
        &self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    ) {
        if self.enabled() {
            if let Some(recording) = lock(&self.recordings).get_mut(&cmd) {
                let bound = &mut recording.bind_point(bind_point).sets;
                let end = first_set as usize + sets.len();
                if bound.len() < end {
                    bound.resize(end, None);
                }
                for (slot, set) in bound[first_set as usize..end].iter_mut().zip(sets) {
                    *slot = Some(*set);
                }
            }
        }
        self.driver
            .cmd_bind_descriptor_sets(cmd, bind_point, layout, first_set, sets);
    }

    pub fn cmd_dispatch(&self, cmd: CommandBufferHandle, params: &DispatchParams) {
        if self.enabled() {
            if let Err(e) = self.bind_reserved_set(cmd, PipelineBindPoint::Compute) {
                self.record_unchecked(cmd, e);
            }
        }
        self.driver.cmd_dispatch(cmd, params);
    }

    pub fn cmd_draw(&self, cmd: CommandBufferHandle, params: &DrawParams) {
        if self.enabled() {
            if let Err(e) = self.bind_reserved_set(cmd, PipelineBindPoint::Graphics) {
                self.record_unchecked(cmd, e);
            }
        }
        self.driver.cmd_draw(cmd, params);
    }

    fn record_unchecked(&self, cmd: CommandBufferHandle, error: GpuAvError) {
        warn!(submission = cmd.raw(), %error, "recording command without validation");
        self.stats.inc_draws_unchecked();
        self.report(ViolationReport::new(
            Severity::Error,
            rules::INTERNAL_ERROR,
            ObjectHandle::CommandBuffer(cmd.raw()),
            format!("GPU-assisted validation could not prepare a draw or dispatch, it runs unchecked: {error}"),
        ));
    }

    /// Fills a fresh input region, points a reserved set at it and the recording's output
    /// buffer, and binds that set at the reserved index.
    ///
    /// On error nothing is bound and no reserved set is left allocated.
    fn bind_reserved_set(&self, cmd: CommandBufferHandle, bind_point: PipelineBindPoint) -> Result<()> {
        let Some(state) = lock(&self.recordings)
            .get_mut(&cmd)
            .map(|r| r.bind_point(bind_point).clone())
        else {
            return Ok(());
        };
        let Some(pipeline) = state
            .pipeline
            .and_then(|p| lock(&self.pipelines).get(&p).cloned())
        else {
            return Ok(());
        };
        let Some(layout) = pipeline.layout.as_ref() else {
            return Ok(());
        };
        debug_assert_eq!(pipeline.bind_point, bind_point);

        self.tracker.note_pipeline(cmd, &pipeline.records)?;
        let output = self.tracker.diagnostic_buffer(&self.driver, cmd)?;
        let words = lock(&self.shadow).input_words(
            &layout.instrumentation,
            &state.sets,
            self.config.max_address_ranges,
        );
        let (input, offset, range) = self.tracker.input_region(&self.driver, cmd, &words)?;
        let (pool, set) = self.allocate_reserved_set()?;
        self.driver.update_descriptor_set(
            set,
            &[
                DescriptorWrite {
                    binding: OUTPUT_BINDING,
                    array_element: 0,
                    resource: DescriptorResource::Buffer {
                        buffer: output,
                        offset: 0,
                        range: WHOLE_SIZE,
                    },
                },
                DescriptorWrite {
                    binding: INPUT_BINDING,
                    array_element: 0,
                    resource: DescriptorResource::Buffer {
                        buffer: input,
                        offset,
                        range,
                    },
                },
            ],
        );
        if let Err(e) = self.tracker.add_reserved_set(cmd, pool, set) {
            self.driver.free_descriptor_set(pool, set);
            return Err(e);
        }
        self.driver.cmd_bind_descriptor_sets(
            cmd,
            bind_point,
            layout.driver_layout,
            layout.reserved_set,
            &[set],
        );
        Ok(())
    }

    fn allocate_reserved_set(&self) -> Result<(DescriptorPoolHandle, DescriptorSetHandle)> {
        let reserved = self
            .internal
            .ok_or_else(|| GpuAvError::InvalidConfig("validation is disabled".into()))?
            .reserved;
        let mut pools = lock(&self.reserved_pools);
        if let Some(&pool) = pools.last() {
            if let Ok(set) = self.driver.allocate_descriptor_set(pool, reserved) {
                return Ok((pool, set));
            }
        }
        let pool = self.driver.create_descriptor_pool(&DescriptorPoolDesc {
            max_sets: RESERVED_SETS_PER_POOL,
            pool_sizes: augment_pool_sizes(&[], RESERVED_SETS_PER_POOL),
        })?;
        pools.push(pool);
        debug!(pool = pool.raw(), count = pools.len(), "created reserved descriptor pool");
        let set = self.driver.allocate_descriptor_set(pool, reserved)?;
        Ok((pool, set))
    }

    // Submission and results

    pub fn queue_submit(&self, cmds: &[CommandBufferHandle]) -> Result<CompletionToken> {
        if !self.enabled() {
            return Ok(self.driver.queue_submit(cmds)?);
        }
        self.tracker.mark_submitted(&self.driver, cmds);
        match self.driver.queue_submit(cmds) {
            Ok(token) => {
                self.tracker.await_completion(cmds, token);
                Ok(token)
            }
            Err(e) => {
                self.tracker.submit_failed(cmds);
                Err(e.into())
            }
        }
    }

    /// Harvests every completed submission. Returns how many were decoded.
    pub fn poll_completions(&self) -> usize {
        if !self.enabled() {
            return 0;
        }
        self.tracker.harvest(&self.driver, &*self.sink)
    }

    pub fn submission_state(&self, cmd: CommandBufferHandle) -> Option<SubmissionState> {
        self.tracker.state(cmd)
    }

    /// The diagnostic output buffer attached to `cmd`'s current recording, if any.
    pub fn diagnostic_buffer(&self, cmd: CommandBufferHandle) -> Option<BufferHandle> {
        self.tracker.output_buffer(cmd)
    }

    /// Decodes the last harvested results of `cmd` again, without reporting.
    pub fn decode_again(&self, cmd: CommandBufferHandle) -> Option<DecodeOutcome> {
        self.tracker.decode_again(cmd)
    }

    /// Discards every outstanding result. Returns the number of recordings affected.
    pub fn notify_device_lost(&self) -> usize {
        if !self.enabled() {
            return 0;
        }
        self.tracker.device_lost(&self.driver, &*self.sink)
    }

    /// Releases every engine-owned object and hands the driver back.
    ///
    /// The device must be idle.
    pub fn destroy(self) -> D {
        if let Some(internal) = self.internal {
            self.tracker.shutdown(&self.driver, &*self.sink);
            for pool in lock(&self.reserved_pools).drain(..) {
                self.driver.destroy_descriptor_pool(pool);
            }
            for twin in self.layouts.drain_twins() {
                self.driver.destroy_pipeline_layout(twin);
            }
            self.driver.destroy_descriptor_set_layout(internal.reserved);
            self.driver.destroy_descriptor_set_layout(internal.empty);
            self.cache.clear();
            info!(stats = %self.stats.to_json(), "GPU-assisted validation destroyed");
        }
        self.driver
    }
}
