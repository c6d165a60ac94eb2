//! Recycled GPU buffers for diagnostic output and per-draw input metadata.
//!
//! Output buffers all have the same size (the configured record capacity). Input metadata
//! is small and written once per draw, so it is sub-allocated linearly out of larger
//! chunk buffers with [`InputArena`].

use std::fmt;

use tracing::trace;

use crate::driver::{BufferDesc, BufferHandle, BufferUsage, Driver, DriverResult};
use crate::protocol::{output_buffer_words, OutputHeader};

/// Default size of one input chunk buffer.
pub const INPUT_CHUNK_BYTES: u64 = 64 * 1024;

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);

    let add = alignment - 1;
    match value.checked_add(add) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

/// A linear allocator handing out byte offsets in `[0, capacity)`.
///
/// Only tracks offsets; the memory is the chunk buffer it is paired with.
#[derive(Clone)]
pub struct InputArena {
    capacity: u64,
    cursor: u64,
}

impl InputArena {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            cursor: 0,
        }
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn remaining(&self) -> u64 {
        self.capacity.saturating_sub(self.cursor)
    }

    /// Allocate `size` bytes at an `alignment` boundary, returning the offset.
    pub fn alloc(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let aligned = align_up(self.cursor, alignment.max(1));
        let end = aligned.checked_add(size)?;
        if end > self.capacity {
            return None;
        }
        self.cursor = end;
        Some(aligned)
    }
}

impl fmt::Debug for InputArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputArena")
            .field("capacity", &self.capacity)
            .field("cursor", &self.cursor)
            .finish()
    }
}

/// One input chunk buffer and its allocation cursor.
#[derive(Debug)]
pub struct InputChunk {
    pub buffer: BufferHandle,
    pub arena: InputArena,
}

#[derive(Debug)]
pub struct BufferPool {
    capacity: u32,
    alignment: u64,
    free_outputs: Vec<BufferHandle>,
    free_chunks: Vec<InputChunk>,
    /// Buffers created and not yet destroyed, pooled or in use.
    live: usize,
}

impl BufferPool {
    /// `capacity` is the record capacity of every output buffer; `alignment` the storage
    /// buffer offset alignment input regions must respect.
    pub fn new(capacity: u32, alignment: u64) -> Self {
        Self {
            capacity,
            alignment: alignment.max(4),
            free_outputs: Vec::new(),
            free_chunks: Vec::new(),
            live: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn output_bytes(&self) -> u64 {
        output_buffer_words(self.capacity) as u64 * 4
    }

    pub fn live_buffers(&self) -> usize {
        self.live
    }

    pub fn pooled_buffers(&self) -> usize {
        self.free_outputs.len() + self.free_chunks.len()
    }

    /// Returns an output buffer with a zeroed body and a fresh header.
    pub fn acquire_output(&mut self, driver: &dyn Driver) -> DriverResult<BufferHandle> {
        let buffer = match self.free_outputs.pop() {
            Some(buffer) => buffer,
            None => {
                let buffer = driver.create_buffer(&BufferDesc {
                    size: self.output_bytes(),
                    usage: BufferUsage::STORAGE
                        | BufferUsage::TRANSFER_SRC
                        | BufferUsage::TRANSFER_DST,
                })?;
                self.live += 1;
                trace!(buffer = buffer.raw(), "created diagnostic output buffer");
                buffer
            }
        };
        if let Err(e) = self.reset_output(driver, buffer) {
            self.free_outputs.push(buffer);
            return Err(e);
        }
        Ok(buffer)
    }

    /// Zeroes `buffer`'s records and writes a fresh header.
    pub fn reset_output(&self, driver: &dyn Driver, buffer: BufferHandle) -> DriverResult<()> {
        let mut init = vec![0u8; self.output_bytes() as usize];
        let header = OutputHeader::new(self.capacity);
        init[..header.as_bytes().len()].copy_from_slice(header.as_bytes());
        driver.write_buffer(buffer, 0, &init)
    }

    pub fn release_output(&mut self, buffer: BufferHandle) {
        self.free_outputs.push(buffer);
    }

    /// Returns a chunk with at least `min_bytes` free.
    pub fn acquire_chunk(&mut self, driver: &dyn Driver, min_bytes: u64) -> DriverResult<InputChunk> {
        if let Some(i) = self
            .free_chunks
            .iter()
            .position(|c| c.arena.capacity() >= min_bytes)
        {
            let mut chunk = self.free_chunks.swap_remove(i);
            chunk.arena.reset();
            return Ok(chunk);
        }
        let size = align_up(min_bytes.max(INPUT_CHUNK_BYTES), self.alignment);
        let buffer = driver.create_buffer(&BufferDesc {
            size,
            usage: BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
        })?;
        self.live += 1;
        trace!(buffer = buffer.raw(), size, "created input chunk buffer");
        Ok(InputChunk {
            buffer,
            arena: InputArena::new(size),
        })
    }

    pub fn release_chunk(&mut self, chunk: InputChunk) {
        self.free_chunks.push(chunk);
    }

    /// Destroys a buffer that will not come back to the pool.
    pub fn discard(&mut self, driver: &dyn Driver, buffer: BufferHandle) {
        driver.destroy_buffer(buffer);
        self.live = self.live.saturating_sub(1);
    }

    /// Destroys every pooled buffer. Buffers still held elsewhere are not touched.
    pub fn destroy_pooled(&mut self, driver: &dyn Driver) {
        let outputs = std::mem::take(&mut self.free_outputs);
        let chunks = std::mem::take(&mut self.free_chunks);
        for buffer in outputs.into_iter().chain(chunks.into_iter().map(|c| c.buffer)) {
            self.discard(driver, buffer);
        }
    }
}
