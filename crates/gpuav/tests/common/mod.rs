#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use gpuav::driver::*;
use gpuav::protocol::{output_buffer_words, DiagnosticRecord, InvocationState, RecordWriter};
use gpuav::{CollectingSink, DiagnosticSink, GpuAv, GpuAvConfig};

/// A driver call as the mock saw it. Parameters are copied byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateShaderModule(Vec<u32>),
    CreatePipelineLayout(PipelineLayoutDesc),
    CreateComputePipeline(ComputePipelineDesc),
    CreateGraphicsPipeline(GraphicsPipelineDesc),
    BeginCommandBuffer(CommandBufferHandle),
    BindPipeline(CommandBufferHandle, PipelineBindPoint, PipelineHandle),
    BindDescriptorSets {
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: Vec<DescriptorSetHandle>,
    },
    Dispatch(CommandBufferHandle, Vec<u8>),
    Draw(CommandBufferHandle, Vec<u8>),
    Submit(Vec<CommandBufferHandle>),
}

#[derive(Debug, Default)]
pub struct MockState {
    pub calls: Vec<Call>,
    pub modules: HashMap<ShaderModuleHandle, Vec<u32>>,
    pub pipeline_layouts: HashMap<PipelineLayoutHandle, PipelineLayoutDesc>,
    pub pipelines: HashMap<PipelineHandle, (PipelineLayoutHandle, Vec<ShaderModuleHandle>)>,
    /// Words of every module a pipeline was created from, captured at creation.
    pub pipeline_words: HashMap<PipelineHandle, Vec<Vec<u32>>>,
    pub buffers: HashMap<BufferHandle, Vec<u8>>,
    pub addresses: HashMap<BufferHandle, u64>,
    pub set_writes: HashMap<DescriptorSetHandle, Vec<DescriptorWrite>>,
    pub live_sets: usize,
    pub tokens: HashMap<CompletionToken, TokenStatus>,
    pub fail_next_submit: bool,
    /// Descriptor set allocations left to reject.
    pub fail_set_allocations: usize,
    pub device_lost: bool,
}

pub struct MockDriver {
    limits: DeviceLimits,
    next: AtomicU64,
    state: Mutex<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::with_limits(DeviceLimits::default())
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        Self {
            limits,
            next: AtomicU64::new(1),
            state: Mutex::new(MockState::default()),
        }
    }

    fn handle(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn complete(&self, token: CompletionToken) {
        self.state().tokens.insert(token, TokenStatus::Complete);
    }

    pub fn lose_device(&self) {
        let mut state = self.state();
        state.device_lost = true;
        for status in state.tokens.values_mut() {
            if *status == TokenStatus::Pending {
                *status = TokenStatus::DeviceLost;
            }
        }
    }

    pub fn buffer_words(&self, buffer: BufferHandle) -> Vec<u32> {
        let state = self.state();
        state.buffers[&buffer]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    pub fn set_buffer_words(&self, buffer: BufferHandle, words: &[u32]) {
        let mut state = self.state();
        let bytes = state.buffers.get_mut(&buffer).unwrap();
        bytes[..words.len() * 4].copy_from_slice(bytemuck::cast_slice(words));
    }

    /// Plays the GPU: appends `records` to `buffer` the way instrumented shaders would,
    /// one invocation per record.
    pub fn gpu_write(&self, buffer: BufferHandle, records: &[DiagnosticRecord]) {
        let mut words = self.buffer_words(buffer);
        let mut writer = RecordWriter::new(&mut words);
        for record in records {
            writer.write(&mut InvocationState::default(), record);
        }
        self.set_buffer_words(buffer, &words);
    }

    pub fn pipeline_words(&self, pipeline: PipelineHandle) -> Vec<Vec<u32>> {
        self.state().pipeline_words[&pipeline].clone()
    }

    pub fn pipeline_layout(&self, pipeline: PipelineHandle) -> PipelineLayoutHandle {
        self.state().pipelines[&pipeline].0
    }

    pub fn live_buffers(&self) -> usize {
        self.state().buffers.len()
    }

    pub fn dispatches(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Dispatch(_, bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    pub fn descriptor_binds(&self) -> Vec<(PipelineLayoutHandle, u32, Vec<DescriptorSetHandle>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::BindDescriptorSets {
                    layout,
                    first_set,
                    sets,
                    ..
                } => Some((layout, first_set, sets)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }
}

impl Driver for MockDriver {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_shader_module(&self, words: &[u32]) -> DriverResult<ShaderModuleHandle> {
        let handle = ShaderModuleHandle(self.handle());
        self.record(Call::CreateShaderModule(words.to_vec()));
        self.state().modules.insert(handle, words.to_vec());
        Ok(handle)
    }

    fn destroy_shader_module(&self, module: ShaderModuleHandle) {
        self.state().modules.remove(&module);
    }

    fn create_descriptor_set_layout(
        &self,
        _desc: &DescriptorSetLayoutDesc,
    ) -> DriverResult<DescriptorSetLayoutHandle> {
        Ok(DescriptorSetLayoutHandle(self.handle()))
    }

    fn destroy_descriptor_set_layout(&self, _layout: DescriptorSetLayoutHandle) {}

    fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> DriverResult<PipelineLayoutHandle> {
        if desc.set_layouts.len() as u32 > self.limits.max_bound_descriptor_sets {
            return Err(DriverError::new("too many descriptor sets"));
        }
        let handle = PipelineLayoutHandle(self.handle());
        self.record(Call::CreatePipelineLayout(desc.clone()));
        self.state().pipeline_layouts.insert(handle, desc.clone());
        Ok(handle)
    }

    fn destroy_pipeline_layout(&self, layout: PipelineLayoutHandle) {
        self.state().pipeline_layouts.remove(&layout);
    }

    fn create_descriptor_pool(&self, _desc: &DescriptorPoolDesc) -> DriverResult<DescriptorPoolHandle> {
        Ok(DescriptorPoolHandle(self.handle()))
    }

    fn destroy_descriptor_pool(&self, _pool: DescriptorPoolHandle) {}

    fn allocate_descriptor_set(
        &self,
        _pool: DescriptorPoolHandle,
        _layout: DescriptorSetLayoutHandle,
    ) -> DriverResult<DescriptorSetHandle> {
        let mut state = self.state();
        if state.fail_set_allocations > 0 {
            state.fail_set_allocations -= 1;
            return Err(DriverError::new("descriptor pool exhausted"));
        }
        state.live_sets += 1;
        Ok(DescriptorSetHandle(self.handle()))
    }

    fn free_descriptor_set(&self, _pool: DescriptorPoolHandle, set: DescriptorSetHandle) {
        let mut state = self.state();
        state.live_sets -= 1;
        state.set_writes.remove(&set);
    }

    fn update_descriptor_set(&self, set: DescriptorSetHandle, writes: &[DescriptorWrite]) {
        self.state()
            .set_writes
            .entry(set)
            .or_default()
            .extend_from_slice(writes);
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> DriverResult<PipelineHandle> {
        let handle = PipelineHandle(self.handle());
        self.record(Call::CreateComputePipeline(desc.clone()));
        let mut state = self.state();
        let words = state
            .modules
            .get(&desc.module)
            .cloned()
            .ok_or_else(|| DriverError::new("unknown shader module"))?;
        state.pipelines.insert(handle, (desc.layout, vec![desc.module]));
        state.pipeline_words.insert(handle, vec![words]);
        Ok(handle)
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> DriverResult<PipelineHandle> {
        let handle = PipelineHandle(self.handle());
        self.record(Call::CreateGraphicsPipeline(desc.clone()));
        let mut state = self.state();
        let words = desc
            .stages
            .iter()
            .map(|s| state.modules.get(&s.module).cloned())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| DriverError::new("unknown shader module"))?;
        let modules = desc.stages.iter().map(|s| s.module).collect();
        state.pipelines.insert(handle, (desc.layout, modules));
        state.pipeline_words.insert(handle, words);
        Ok(handle)
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        self.state().pipelines.remove(&pipeline);
    }

    fn create_buffer(&self, desc: &BufferDesc) -> DriverResult<BufferHandle> {
        let handle = BufferHandle(self.handle());
        let mut state = self.state();
        state.buffers.insert(handle, vec![0; desc.size as usize]);
        if desc.usage.contains(BufferUsage::DEVICE_ADDRESS) {
            state.addresses.insert(handle, 0x1_0000_0000 * handle.raw());
        }
        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state();
        state.buffers.remove(&buffer);
        state.addresses.remove(&buffer);
    }

    fn buffer_device_address(&self, buffer: BufferHandle) -> Option<u64> {
        self.state().addresses.get(&buffer).copied()
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> DriverResult<()> {
        let mut state = self.state();
        let bytes = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| DriverError::new("unknown buffer"))?;
        let start = offset as usize;
        let dst = bytes
            .get_mut(start..start + data.len())
            .ok_or_else(|| DriverError::new("write out of range"))?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, dst: &mut [u8]) -> DriverResult<()> {
        let state = self.state();
        let bytes = state
            .buffers
            .get(&buffer)
            .ok_or_else(|| DriverError::new("unknown buffer"))?;
        let start = offset as usize;
        let src = bytes
            .get(start..start + dst.len())
            .ok_or_else(|| DriverError::new("read out of range"))?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> DriverResult<()> {
        self.record(Call::BeginCommandBuffer(cmd));
        Ok(())
    }

    fn end_command_buffer(&self, _cmd: CommandBufferHandle) -> DriverResult<()> {
        Ok(())
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
    ) {
        self.record(Call::BindPipeline(cmd, bind_point, pipeline));
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: CommandBufferHandle,
        _bind_point: PipelineBindPoint,
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    ) {
        self.record(Call::BindDescriptorSets {
            cmd,
            layout,
            first_set,
            sets: sets.to_vec(),
        });
    }

    fn cmd_dispatch(&self, cmd: CommandBufferHandle, params: &DispatchParams) {
        self.record(Call::Dispatch(cmd, params.as_bytes().to_vec()));
    }

    fn cmd_draw(&self, cmd: CommandBufferHandle, params: &DrawParams) {
        self.record(Call::Draw(cmd, params.as_bytes().to_vec()));
    }

    fn queue_submit(&self, cmds: &[CommandBufferHandle]) -> DriverResult<CompletionToken> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_submit) {
            return Err(DriverError::new("queue submission rejected"));
        }
        state.calls.push(Call::Submit(cmds.to_vec()));
        let token = CompletionToken(self.handle());
        let status = if state.device_lost {
            TokenStatus::DeviceLost
        } else {
            TokenStatus::Pending
        };
        state.tokens.insert(token, status);
        Ok(token)
    }

    fn token_status(&self, token: CompletionToken) -> TokenStatus {
        self.state()
            .tokens
            .get(&token)
            .copied()
            .unwrap_or(TokenStatus::Pending)
    }
}

pub type Engine = GpuAv<MockDriver>;

/// Routes engine logs to the test harness output. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn engine_with(config: GpuAvConfig, limits: DeviceLimits) -> (Engine, Arc<CollectingSink>) {
    init_tracing();
    let sink = Arc::new(CollectingSink::new());
    let engine = GpuAv::new(
        MockDriver::with_limits(limits),
        config,
        sink.clone() as Arc<dyn DiagnosticSink>,
    )
    .unwrap();
    (engine, sink)
}

pub fn engine(config: GpuAvConfig) -> (Engine, Arc<CollectingSink>) {
    engine_with(config, DeviceLimits::default())
}

pub fn output_words(capacity: u32) -> usize {
    output_buffer_words(capacity)
}

pub fn storage_buffer_set_layout(count: u32) -> DescriptorSetLayoutDesc {
    DescriptorSetLayoutDesc {
        bindings: vec![DescriptorBinding {
            binding: 0,
            kind: DescriptorKind::StorageBuffer,
            count,
            stages: ShaderStages::COMPUTE,
        }],
    }
}

/// Everything a compute dispatch over `set = 0, binding = 0` needs.
pub struct ComputeSetup {
    pub set_layout: DescriptorSetLayoutHandle,
    pub layout: PipelineLayoutHandle,
    pub module: ShaderModuleHandle,
    pub pipeline: PipelineHandle,
    pub data: BufferHandle,
    pub set: DescriptorSetHandle,
}

/// Creates a pipeline from `words` and a descriptor set pointing at a `data_bytes` buffer.
pub fn compute_setup(engine: &Engine, words: &[u32], data_bytes: u64) -> ComputeSetup {
    let set_layout = engine
        .create_descriptor_set_layout(&storage_buffer_set_layout(1))
        .unwrap();
    let layout = engine
        .create_pipeline_layout(&PipelineLayoutDesc {
            set_layouts: vec![set_layout],
            push_constant_ranges: vec![],
        })
        .unwrap();
    let module = engine.create_shader_module(words, Some("main.comp")).unwrap();
    let pipeline = engine
        .create_compute_pipeline(&ComputePipelineDesc {
            layout,
            module,
            entry_point: "main".into(),
        })
        .unwrap();
    let data = engine
        .create_buffer(&BufferDesc {
            size: data_bytes,
            usage: BufferUsage::STORAGE,
        })
        .unwrap();
    let pool = engine
        .create_descriptor_pool(&DescriptorPoolDesc {
            max_sets: 4,
            pool_sizes: vec![PoolSize {
                kind: DescriptorKind::StorageBuffer,
                count: 4,
            }],
        })
        .unwrap();
    let set = engine.allocate_descriptor_set(pool, set_layout).unwrap();
    engine.update_descriptor_set(
        set,
        &[DescriptorWrite {
            binding: 0,
            array_element: 0,
            resource: DescriptorResource::Buffer {
                buffer: data,
                offset: 0,
                range: WHOLE_SIZE,
            },
        }],
    );
    ComputeSetup {
        set_layout,
        layout,
        module,
        pipeline,
        data,
        set,
    }
}

/// Records bind + dispatch on `cmd` and submits it.
pub fn record_and_submit(engine: &Engine, setup: &ComputeSetup, cmd: CommandBufferHandle) -> CompletionToken {
    engine.begin_command_buffer(cmd).unwrap();
    engine.cmd_bind_pipeline(cmd, PipelineBindPoint::Compute, setup.pipeline);
    engine.cmd_bind_descriptor_sets(cmd, PipelineBindPoint::Compute, setup.layout, 0, &[setup.set]);
    engine.cmd_dispatch(cmd, &DispatchParams::new(128, 1, 1));
    engine.end_command_buffer(cmd).unwrap();
    engine.queue_submit(&[cmd]).unwrap()
}
