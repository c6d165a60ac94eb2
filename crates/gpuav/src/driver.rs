//! The dispatch boundary to the underlying driver.
//!
//! The engine consumes the driver only through [`Driver`]. Implementations are expected
//! to be thin adapters over the real API; tests use an in-memory recording driver.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

macro_rules! handles {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);

            impl $name {
                #[inline]
                pub fn raw(self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

handles! {
    ShaderModuleHandle,
    DescriptorSetLayoutHandle,
    PipelineLayoutHandle,
    PipelineHandle,
    BufferHandle,
    DescriptorPoolHandle,
    DescriptorSetHandle,
    CommandBufferHandle,
    /// Identifies one queue submission; see [`Driver::token_status`].
    CompletionToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DriverError(pub String);

impl DriverError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformTexelBuffer,
    StorageTexelBuffer,
    UniformBuffer,
    StorageBuffer,
}

impl DescriptorKind {
    pub fn is_buffer(self) -> bool {
        matches!(self, Self::UniformBuffer | Self::StorageBuffer)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 4;
        const COMPUTE = 1 << 5;
        const ALL_GRAPHICS = 0x1f;
        const ALL = 0x7fff_ffff;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const UNIFORM = 1 << 4;
        const STORAGE = 1 << 5;
        const INDIRECT = 1 << 8;
        const DEVICE_ADDRESS = 1 << 17;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub count: u32,
    pub stages: ShaderStages,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutDesc {
    pub bindings: Vec<DescriptorBinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushConstantRange {
    pub stages: ShaderStages,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PipelineLayoutDesc {
    pub set_layouts: Vec<DescriptorSetLayoutHandle>,
    pub push_constant_ranges: Vec<PushConstantRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSize {
    pub kind: DescriptorKind,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorPoolDesc {
    pub max_sets: u32,
    pub pool_sizes: Vec<PoolSize>,
}

/// Range value meaning "to the end of the buffer".
pub const WHOLE_SIZE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    Image {
        view: u64,
    },
    Sampler {
        sampler: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub array_element: u32,
    pub resource: DescriptorResource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputePipelineDesc {
    pub layout: PipelineLayoutHandle,
    pub module: ShaderModuleHandle,
    pub entry_point: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderStageDesc {
    pub stage: ShaderStages,
    pub module: ShaderModuleHandle,
    pub entry_point: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsPipelineDesc {
    pub layout: PipelineLayoutHandle,
    pub stages: Vec<ShaderStageDesc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineBindPoint {
    Graphics,
    Compute,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DispatchParams {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl DispatchParams {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawParams {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

impl DrawParams {
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_bound_descriptor_sets: u32,
    pub min_storage_buffer_offset_alignment: u64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_bound_descriptor_sets: 8,
            min_storage_buffer_offset_alignment: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Pending,
    Complete,
    DeviceLost,
}

/// The subset of the driver API the engine intercepts or calls itself.
///
/// Calls may arrive from several recording threads at once.
pub trait Driver: Send + Sync {
    fn limits(&self) -> DeviceLimits;

    fn create_shader_module(&self, words: &[u32]) -> DriverResult<ShaderModuleHandle>;
    fn destroy_shader_module(&self, module: ShaderModuleHandle);

    fn create_descriptor_set_layout(
        &self,
        desc: &DescriptorSetLayoutDesc,
    ) -> DriverResult<DescriptorSetLayoutHandle>;
    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle);

    fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc)
        -> DriverResult<PipelineLayoutHandle>;
    fn destroy_pipeline_layout(&self, layout: PipelineLayoutHandle);

    fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc)
        -> DriverResult<DescriptorPoolHandle>;
    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle);
    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> DriverResult<DescriptorSetHandle>;
    fn free_descriptor_set(&self, pool: DescriptorPoolHandle, set: DescriptorSetHandle);
    fn update_descriptor_set(&self, set: DescriptorSetHandle, writes: &[DescriptorWrite]);

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc) -> DriverResult<PipelineHandle>;
    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc)
        -> DriverResult<PipelineHandle>;
    fn destroy_pipeline(&self, pipeline: PipelineHandle);

    fn create_buffer(&self, desc: &BufferDesc) -> DriverResult<BufferHandle>;
    fn destroy_buffer(&self, buffer: BufferHandle);
    /// Only valid for buffers created with [`BufferUsage::DEVICE_ADDRESS`].
    fn buffer_device_address(&self, buffer: BufferHandle) -> Option<u64>;
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> DriverResult<()>;
    fn read_buffer(&self, buffer: BufferHandle, offset: u64, dst: &mut [u8]) -> DriverResult<()>;

    fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> DriverResult<()>;
    fn end_command_buffer(&self, cmd: CommandBufferHandle) -> DriverResult<()>;
    fn cmd_bind_pipeline(
        &self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
    );
    fn cmd_bind_descriptor_sets(
        &self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    );
    fn cmd_dispatch(&self, cmd: CommandBufferHandle, params: &DispatchParams);
    fn cmd_draw(&self, cmd: CommandBufferHandle, params: &DrawParams);

    fn queue_submit(&self, cmds: &[CommandBufferHandle]) -> DriverResult<CompletionToken>;
    fn token_status(&self, token: CompletionToken) -> TokenStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_tightly_packed() {
        let d = DispatchParams::new(1, 2, 3);
        assert_eq!(d.as_bytes().len(), 12);
        assert_eq!(&d.as_bytes()[4..8], &2u32.to_le_bytes());
        let draw = DrawParams {
            vertex_count: 3,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        };
        assert_eq!(draw.as_bytes().len(), 16);
    }

    #[test]
    fn buffer_kinds() {
        assert!(DescriptorKind::StorageBuffer.is_buffer());
        assert!(!DescriptorKind::StorageImage.is_buffer());
    }
}
