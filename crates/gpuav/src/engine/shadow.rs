//! Host-side copies of descriptor and buffer state the input buffer is built from.

use std::collections::HashMap;

use tracing::warn;

use crate::driver::{
    BufferDesc, BufferHandle, DescriptorPoolHandle, DescriptorResource, DescriptorSetHandle,
    DescriptorWrite, WHOLE_SIZE,
};
use crate::layout::{
    InstrumentationLayout, INPUT_ADDRESS_COUNT_WORD, INPUT_ADDRESS_TABLE_WORD,
    INPUT_DESCRIPTOR_WORDS_WORD, INPUT_FLAGS_WORD, INPUT_FLAG_ADDRESSES_TRUNCATED,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BufferInfo {
    size: u64,
    address: Option<u64>,
}

#[derive(Debug)]
struct SetState {
    pool: DescriptorPoolHandle,
    /// Bound size per written `(binding, element)`.
    elements: HashMap<(u32, u32), u32>,
}

#[derive(Debug, Default)]
pub(crate) struct ShadowState {
    buffers: HashMap<BufferHandle, BufferInfo>,
    sets: HashMap<DescriptorSetHandle, SetState>,
    truncation_logged: bool,
}

impl ShadowState {
    pub fn create_buffer(&mut self, buffer: BufferHandle, desc: &BufferDesc, address: Option<u64>) {
        self.buffers.insert(
            buffer,
            BufferInfo {
                size: desc.size,
                address,
            },
        );
    }

    pub fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer);
    }

    pub fn allocate_set(
        &mut self,
        pool: DescriptorPoolHandle,
        set: DescriptorSetHandle,
    ) {
        self.sets.insert(
            set,
            SetState {
                pool,
                elements: HashMap::new(),
            },
        );
    }

    pub fn free_set(&mut self, set: DescriptorSetHandle) {
        self.sets.remove(&set);
    }

    /// Forgets every set allocated from `pool`.
    pub fn destroy_pool(&mut self, pool: DescriptorPoolHandle) {
        self.sets.retain(|_, s| s.pool != pool);
    }

    pub fn update_set(&mut self, set: DescriptorSetHandle, writes: &[DescriptorWrite]) {
        let Some(state) = self.sets.get_mut(&set) else {
            return;
        };
        for write in writes {
            let size = match write.resource {
                DescriptorResource::Buffer {
                    buffer,
                    offset,
                    range,
                } => {
                    let bytes = match (range, self.buffers.get(&buffer)) {
                        (WHOLE_SIZE, Some(info)) => info.size.saturating_sub(offset),
                        // Unknown extent: never flag.
                        (WHOLE_SIZE, None) => u64::MAX,
                        (range, _) => range,
                    };
                    bytes.min(u64::from(u32::MAX)) as u32
                }
                DescriptorResource::Image { .. } | DescriptorResource::Sampler { .. } => u32::MAX,
            };
            state
                .elements
                .insert((write.binding, write.array_element), size);
        }
    }

    /// Builds the input buffer for a draw using `layout` with `bound` descriptor sets.
    ///
    /// When more buffers have device addresses than `max_ranges`, the table keeps the
    /// lowest ones and the truncation flag tells shaders to accept addresses it misses.
    pub fn input_words(
        &mut self,
        layout: &InstrumentationLayout,
        bound: &[Option<DescriptorSetHandle>],
        max_ranges: u32,
    ) -> Vec<u32> {
        let mut ranges: Vec<(u64, u64)> = self
            .buffers
            .values()
            .filter_map(|b| b.address.map(|a| (a, b.size)))
            .collect();
        ranges.sort_unstable();
        let truncated = ranges.len() > max_ranges as usize;
        if truncated {
            if !self.truncation_logged {
                warn!(
                    ranges = ranges.len(),
                    max_ranges,
                    "device address table full, addresses outside it are not checked"
                );
                self.truncation_logged = true;
            }
            ranges.truncate(max_ranges as usize);
        }

        let mut words = vec![0u32; layout.input_words(ranges.len() as u32) as usize];
        words[INPUT_ADDRESS_TABLE_WORD] = layout.address_table_word();
        words[INPUT_ADDRESS_COUNT_WORD] = ranges.len() as u32;
        words[INPUT_DESCRIPTOR_WORDS_WORD] = layout.descriptor_words;
        if truncated {
            words[INPUT_FLAGS_WORD] |= INPUT_FLAG_ADDRESSES_TRUNCATED;
        }

        for slot in &layout.descriptors {
            let Some(state) = bound
                .get(slot.set as usize)
                .copied()
                .flatten()
                .and_then(|set| self.sets.get(&set))
            else {
                continue;
            };
            for element in 0..slot.tracked {
                if let Some(size) = state.elements.get(&(slot.binding, element)) {
                    words[slot.written_word(element) as usize] = 1;
                    words[slot.size_word(element) as usize] = *size;
                }
            }
        }

        let table = layout.address_table_word() as usize;
        for (i, (base, size)) in ranges.into_iter().enumerate() {
            let at = table + i * 4;
            words[at..at + 4].copy_from_slice(&[
                base as u32,
                (base >> 32) as u32,
                size as u32,
                (size >> 32) as u32,
            ]);
        }
        words
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{
        BufferUsage, DescriptorBinding, DescriptorKind, DescriptorSetLayoutDesc, ShaderStages,
    };
    use crate::layout::INPUT_HEADER_WORDS;

    fn layout() -> InstrumentationLayout {
        let set = DescriptorSetLayoutDesc {
            bindings: vec![DescriptorBinding {
                binding: 0,
                kind: DescriptorKind::StorageBuffer,
                count: 2,
                stages: ShaderStages::COMPUTE,
            }],
        };
        InstrumentationLayout::new(7, &[set], 0, 16)
    }

    #[test]
    fn written_descriptors_carry_their_bound_size() {
        let mut shadow = ShadowState::default();
        let buffer = BufferHandle(1);
        shadow.create_buffer(
            buffer,
            &BufferDesc {
                size: 4096,
                usage: BufferUsage::STORAGE,
            },
            None,
        );
        let set = DescriptorSetHandle(10);
        shadow.allocate_set(DescriptorPoolHandle(2), set);
        shadow.update_set(
            set,
            &[DescriptorWrite {
                binding: 0,
                array_element: 1,
                resource: DescriptorResource::Buffer {
                    buffer,
                    offset: 1024,
                    range: WHOLE_SIZE,
                },
            }],
        );

        let words = shadow.input_words(&layout(), &[Some(set)], 8);
        let h = INPUT_HEADER_WORDS as usize;
        // element 0 never written, element 1 bound to the last 3 KiB
        assert_eq!(&words[h..h + 4], &[0, 0, 1, 3072]);
        assert_eq!(words[INPUT_ADDRESS_COUNT_WORD], 0);
    }

    #[test]
    fn address_ranges_are_sorted_and_capped() {
        let mut shadow = ShadowState::default();
        let desc = BufferDesc {
            size: 256,
            usage: BufferUsage::DEVICE_ADDRESS,
        };
        shadow.create_buffer(BufferHandle(1), &desc, Some(0x2_0000_0000));
        shadow.create_buffer(BufferHandle(2), &desc, Some(0x1000));
        shadow.create_buffer(BufferHandle(3), &desc, Some(0x3_0000_0000));

        let layout = layout();
        let words = shadow.input_words(&layout, &[], 2);
        let table = layout.address_table_word() as usize;
        assert_eq!(words[INPUT_ADDRESS_TABLE_WORD] as usize, table);
        assert_eq!(words[INPUT_ADDRESS_COUNT_WORD], 2);
        assert_eq!(&words[table..table + 8], &[0x1000, 0, 256, 0, 0, 2, 256, 0]);
        assert_eq!(words[INPUT_FLAGS_WORD], INPUT_FLAG_ADDRESSES_TRUNCATED);

        let words = shadow.input_words(&layout, &[], 3);
        assert_eq!(words[INPUT_ADDRESS_COUNT_WORD], 3);
        assert_eq!(words[INPUT_FLAGS_WORD], 0);
    }

    #[test]
    fn table_at_exact_capacity_is_not_truncated() {
        let mut shadow = ShadowState::default();
        let desc = BufferDesc {
            size: 64,
            usage: BufferUsage::DEVICE_ADDRESS,
        };
        for i in 0..16u64 {
            shadow.create_buffer(BufferHandle(i + 1), &desc, Some(0x1_0000 * (i + 1)));
        }
        let layout = layout();
        assert_eq!(shadow.input_words(&layout, &[], 16)[INPUT_FLAGS_WORD], 0);
        let words = shadow.input_words(&layout, &[], 15);
        assert_eq!(words[INPUT_ADDRESS_COUNT_WORD], 15);
        assert_eq!(words[INPUT_FLAGS_WORD], INPUT_FLAG_ADDRESSES_TRUNCATED);
        assert!(shadow.truncation_logged);
    }
}
