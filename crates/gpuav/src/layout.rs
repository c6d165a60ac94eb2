//! Reserved descriptor set management.
//!
//! Every instrumentable pipeline layout gets a driver-side twin with one extra descriptor
//! set appended:
//!
//! - `set < app_sets` = the application's own set layouts, unchanged
//! - `app_sets <= set < reserved` = empty padding layouts
//! - `set == reserved` = engine resources:
//!   - `binding 0` = diagnostic output buffer (read-write storage buffer)
//!   - `binding 1` = input buffer (descriptor metadata, address ranges)
//!
//! The application only ever sees its own layout handle, so original set indices keep their
//! meaning and pipelines created against the twin stay compatible with descriptor sets
//! allocated from the application's layouts.
//!
//! Input buffer words:
//!
//! ```text
//! 0   address table word offset
//! 1   address range count
//! 2   descriptor words
//! 3   flags (bit 0: address table truncated, unmatched addresses are not reported)
//! 4.. per tracked descriptor element: [written flag, bound size in bytes]
//! ..  per address range: [base lo, base hi, size lo, size hi]
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::diagnostics::{rules, DiagnosticSink, ObjectHandle, Severity, ViolationReport};
use crate::driver::{
    DescriptorBinding, DescriptorKind, DescriptorSetLayoutDesc, DescriptorSetLayoutHandle,
    DeviceLimits, DriverError, PipelineLayoutDesc, PipelineLayoutHandle, PoolSize, ShaderStages,
};
use crate::stats::GpuAvStats;

pub const OUTPUT_BINDING: u32 = 0;
pub const INPUT_BINDING: u32 = 1;

pub const INPUT_ADDRESS_TABLE_WORD: usize = 0;
pub const INPUT_ADDRESS_COUNT_WORD: usize = 1;
pub const INPUT_DESCRIPTOR_WORDS_WORD: usize = 2;
pub const INPUT_FLAGS_WORD: usize = 3;
pub const INPUT_FLAG_ADDRESSES_TRUNCATED: u32 = 1;
pub const INPUT_HEADER_WORDS: u32 = 4;
pub const WORDS_PER_DESCRIPTOR: u32 = 2;
pub const WORDS_PER_ADDRESS_RANGE: u32 = 4;

/// Layout of the reserved set itself.
pub fn reserved_set_layout_desc() -> DescriptorSetLayoutDesc {
    let binding = |binding| DescriptorBinding {
        binding,
        kind: DescriptorKind::StorageBuffer,
        count: 1,
        stages: ShaderStages::ALL,
    };
    DescriptorSetLayoutDesc {
        bindings: vec![binding(OUTPUT_BINDING), binding(INPUT_BINDING)],
    }
}

/// Pool sizes with room for `max_sets` reserved sets added.
pub fn augment_pool_sizes(sizes: &[PoolSize], max_sets: u32) -> Vec<PoolSize> {
    let extra = max_sets.saturating_mul(2);
    let mut out = sizes.to_vec();
    match out
        .iter_mut()
        .find(|p| p.kind == DescriptorKind::StorageBuffer)
    {
        Some(p) => p.count = p.count.saturating_add(extra),
        None => out.push(PoolSize {
            kind: DescriptorKind::StorageBuffer,
            count: extra,
        }),
    }
    out
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayoutFingerprint(pub [u8; 32]);

impl LayoutFingerprint {
    /// Fingerprint used for shaders built without a layout (skipped or filtered).
    pub const NONE: Self = Self([0; 32]);
}

impl std::fmt::Debug for LayoutFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LayoutFingerprint(")?;
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

/// Where a descriptor's metadata lives in the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSlot {
    pub set: u32,
    pub binding: u32,
    pub kind: DescriptorKind,
    pub count: u32,
    /// Elements with metadata in the input buffer; the rest go unchecked.
    pub tracked: u32,
    pub first_word: u32,
}

impl DescriptorSlot {
    pub fn written_word(&self, element: u32) -> u32 {
        self.first_word + element * WORDS_PER_DESCRIPTOR
    }

    pub fn size_word(&self, element: u32) -> u32 {
        self.written_word(element) + 1
    }
}

/// What the instrumentation pass needs to know about a pipeline layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationLayout {
    pub reserved_set: u32,
    /// End of the highest push constant range, in bytes.
    pub push_constant_end: u32,
    pub descriptors: Vec<DescriptorSlot>,
    pub descriptor_words: u32,
}

impl InstrumentationLayout {
    pub fn new(
        reserved_set: u32,
        sets: &[DescriptorSetLayoutDesc],
        push_constant_end: u32,
        max_tracked: u32,
    ) -> Self {
        let mut descriptors = Vec::new();
        let mut next = INPUT_HEADER_WORDS;
        for (set, desc) in sets.iter().enumerate() {
            let mut bindings = desc.bindings.clone();
            bindings.sort_by_key(|b| b.binding);
            for b in bindings {
                let tracked = b.count.min(max_tracked);
                descriptors.push(DescriptorSlot {
                    set: set as u32,
                    binding: b.binding,
                    kind: b.kind,
                    count: b.count,
                    tracked,
                    first_word: next,
                });
                next = next.saturating_add(tracked.saturating_mul(WORDS_PER_DESCRIPTOR));
            }
        }
        Self {
            reserved_set,
            push_constant_end,
            descriptors,
            descriptor_words: next - INPUT_HEADER_WORDS,
        }
    }

    pub fn slot(&self, set: u32, binding: u32) -> Option<&DescriptorSlot> {
        self.descriptors
            .iter()
            .find(|d| d.set == set && d.binding == binding)
    }

    pub fn address_table_word(&self) -> u32 {
        INPUT_HEADER_WORDS + self.descriptor_words
    }

    /// Input buffer size for `ranges` address ranges.
    pub fn input_words(&self, ranges: u32) -> u32 {
        self.address_table_word() + ranges * WORDS_PER_ADDRESS_RANGE
    }
}

/// An instrumentable layout and its driver-side twin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AugmentedLayout {
    pub reserved_set: u32,
    pub fingerprint: LayoutFingerprint,
    pub instrumentation: Arc<InstrumentationLayout>,
    pub driver_layout: PipelineLayoutHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutAugmentation {
    Augmented(Arc<AugmentedLayout>),
    NotInstrumentable { reason: String },
}

impl LayoutAugmentation {
    pub fn augmented(&self) -> Option<&Arc<AugmentedLayout>> {
        match self {
            Self::Augmented(a) => Some(a),
            Self::NotInstrumentable { .. } => None,
        }
    }
}

/// Computed before the twin layout exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AugmentationPlan {
    pub desc: PipelineLayoutDesc,
    pub reserved_set: u32,
    pub fingerprint: LayoutFingerprint,
    pub instrumentation: InstrumentationLayout,
}

/// Engine-owned set layouts referenced by every twin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalSetLayouts {
    pub empty: DescriptorSetLayoutHandle,
    pub reserved: DescriptorSetLayoutHandle,
}

#[derive(Debug, Default)]
struct LayoutTables {
    set_layouts: HashMap<DescriptorSetLayoutHandle, DescriptorSetLayoutDesc>,
    pipeline_layouts: HashMap<PipelineLayoutHandle, LayoutAugmentation>,
}

#[derive(Debug)]
pub struct LayoutManager {
    limits: DeviceLimits,
    desired_reserved_set: Option<u32>,
    max_tracked_descriptors: u32,
    stats: Arc<GpuAvStats>,
    tables: Mutex<LayoutTables>,
}

impl LayoutManager {
    pub fn new(
        limits: DeviceLimits,
        desired_reserved_set: Option<u32>,
        max_tracked_descriptors: u32,
        stats: Arc<GpuAvStats>,
    ) -> Self {
        Self {
            limits,
            desired_reserved_set,
            max_tracked_descriptors,
            stats,
            tables: Mutex::new(LayoutTables::default()),
        }
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, LayoutTables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_set_layout(&self, handle: DescriptorSetLayoutHandle, desc: DescriptorSetLayoutDesc) {
        self.tables().set_layouts.insert(handle, desc);
    }

    pub fn forget_set_layout(&self, handle: DescriptorSetLayoutHandle) {
        self.tables().set_layouts.remove(&handle);
    }

    pub fn set_layout(&self, handle: DescriptorSetLayoutHandle) -> Option<DescriptorSetLayoutDesc> {
        self.tables().set_layouts.get(&handle).cloned()
    }

    /// Decides where the reserved set goes and how the input buffer is laid out.
    pub fn plan(
        &self,
        desc: &PipelineLayoutDesc,
        internal: InternalSetLayouts,
    ) -> Result<AugmentationPlan, String> {
        let max_sets = self.limits.max_bound_descriptor_sets;
        let app_sets = desc.set_layouts.len() as u32;
        let desired = self
            .desired_reserved_set
            .unwrap_or_else(|| max_sets.saturating_sub(1));
        let reserved_set = desired.max(app_sets);
        if reserved_set >= max_sets {
            return Err(format!(
                "layout uses {app_sets} of {max_sets} descriptor sets, no index left to reserve"
            ));
        }

        let sets = {
            let tables = self.tables();
            desc.set_layouts
                .iter()
                .map(|h| {
                    tables
                        .set_layouts
                        .get(h)
                        .cloned()
                        .ok_or_else(|| format!("unknown descriptor set layout {:#x}", h.raw()))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let push_constant_end = desc
            .push_constant_ranges
            .iter()
            .map(|r| r.offset.saturating_add(r.size))
            .max()
            .unwrap_or(0);

        let mut set_layouts = desc.set_layouts.clone();
        set_layouts.resize(reserved_set as usize, internal.empty);
        set_layouts.push(internal.reserved);

        Ok(AugmentationPlan {
            desc: PipelineLayoutDesc {
                set_layouts,
                push_constant_ranges: desc.push_constant_ranges.clone(),
            },
            reserved_set,
            fingerprint: fingerprint(reserved_set, &sets, desc),
            instrumentation: InstrumentationLayout::new(
                reserved_set,
                &sets,
                push_constant_end,
                self.max_tracked_descriptors,
            ),
        })
    }

    /// Plans the twin of `handle`, creates it through `create` and records the result.
    ///
    /// A layout with no room for the reserved set degrades to uninstrumented with one
    /// warning diagnostic.
    pub fn augment_pipeline_layout(
        &self,
        handle: PipelineLayoutHandle,
        desc: &PipelineLayoutDesc,
        internal: InternalSetLayouts,
        sink: &dyn DiagnosticSink,
        create: impl FnOnce(&PipelineLayoutDesc) -> Result<PipelineLayoutHandle, DriverError>,
    ) -> LayoutAugmentation {
        let result = self.plan(desc, internal).and_then(|plan| {
            let driver_layout = create(&plan.desc)
                .map_err(|e| format!("failed to create instrumented layout: {e}"))?;
            Ok(AugmentedLayout {
                reserved_set: plan.reserved_set,
                fingerprint: plan.fingerprint,
                instrumentation: Arc::new(plan.instrumentation),
                driver_layout,
            })
        });
        let augmentation = match result {
            Ok(augmented) => {
                debug!(
                    layout = handle.raw(),
                    reserved_set = augmented.reserved_set,
                    "augmented pipeline layout"
                );
                self.stats.inc_layouts_augmented();
                LayoutAugmentation::Augmented(Arc::new(augmented))
            }
            Err(reason) => {
                warn!(layout = handle.raw(), %reason, "pipeline layout runs uninstrumented");
                self.stats.inc_layouts_degraded();
                sink.report(ViolationReport::new(
                    Severity::Warning,
                    rules::RESERVED_SLOT_UNAVAILABLE,
                    ObjectHandle::PipelineLayout(handle.raw()),
                    format!("GPU-assisted validation disabled for pipelines using this layout: {reason}"),
                ));
                LayoutAugmentation::NotInstrumentable { reason }
            }
        };
        self.tables()
            .pipeline_layouts
            .insert(handle, augmentation.clone());
        augmentation
    }

    pub fn lookup(&self, handle: PipelineLayoutHandle) -> Option<LayoutAugmentation> {
        self.tables().pipeline_layouts.get(&handle).cloned()
    }

    /// Drops the side table entry; returns the twin layout to destroy, if any.
    pub fn forget(&self, handle: PipelineLayoutHandle) -> Option<PipelineLayoutHandle> {
        match self.tables().pipeline_layouts.remove(&handle)? {
            LayoutAugmentation::Augmented(a) => Some(a.driver_layout),
            LayoutAugmentation::NotInstrumentable { .. } => None,
        }
    }

    /// Every twin layout still alive, emptying the table.
    pub fn drain_twins(&self) -> Vec<PipelineLayoutHandle> {
        self.tables()
            .pipeline_layouts
            .drain()
            .filter_map(|(_, a)| a.augmented().map(|a| a.driver_layout))
            .collect()
    }
}

fn kind_tag(kind: DescriptorKind) -> u8 {
    match kind {
        DescriptorKind::Sampler => 0,
        DescriptorKind::CombinedImageSampler => 1,
        DescriptorKind::SampledImage => 2,
        DescriptorKind::StorageImage => 3,
        DescriptorKind::UniformTexelBuffer => 4,
        DescriptorKind::StorageTexelBuffer => 5,
        DescriptorKind::UniformBuffer => 6,
        DescriptorKind::StorageBuffer => 7,
    }
}

fn fingerprint(
    reserved_set: u32,
    sets: &[DescriptorSetLayoutDesc],
    desc: &PipelineLayoutDesc,
) -> LayoutFingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&reserved_set.to_le_bytes());
    hasher.update(&(sets.len() as u32).to_le_bytes());
    for set in sets {
        let mut bindings = set.bindings.clone();
        bindings.sort_by_key(|b| b.binding);
        hasher.update(&(bindings.len() as u32).to_le_bytes());
        for b in bindings {
            hasher.update(&b.binding.to_le_bytes());
            hasher.update(&[kind_tag(b.kind)]);
            hasher.update(&b.count.to_le_bytes());
        }
    }
    for range in &desc.push_constant_ranges {
        hasher.update(&range.offset.to_le_bytes());
        hasher.update(&range.size.to_le_bytes());
    }
    LayoutFingerprint(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingSink;
    use crate::driver::PushConstantRange;

    const INTERNAL: InternalSetLayouts = InternalSetLayouts {
        empty: DescriptorSetLayoutHandle(900),
        reserved: DescriptorSetLayoutHandle(901),
    };

    fn manager(max_sets: u32) -> LayoutManager {
        LayoutManager::new(
            DeviceLimits {
                max_bound_descriptor_sets: max_sets,
                ..DeviceLimits::default()
            },
            None,
            8,
            Arc::new(GpuAvStats::new()),
        )
    }

    fn ssbo_set(count: u32) -> DescriptorSetLayoutDesc {
        DescriptorSetLayoutDesc {
            bindings: vec![DescriptorBinding {
                binding: 0,
                kind: DescriptorKind::StorageBuffer,
                count,
                stages: ShaderStages::COMPUTE,
            }],
        }
    }

    #[test]
    fn reserved_set_goes_last_and_pads() {
        let mgr = manager(4);
        mgr.register_set_layout(DescriptorSetLayoutHandle(1), ssbo_set(1));
        let desc = PipelineLayoutDesc {
            set_layouts: vec![DescriptorSetLayoutHandle(1)],
            push_constant_ranges: vec![],
        };
        let plan = mgr.plan(&desc, INTERNAL).unwrap();
        assert_eq!(plan.reserved_set, 3);
        assert_eq!(
            plan.desc.set_layouts,
            vec![
                DescriptorSetLayoutHandle(1),
                INTERNAL.empty,
                INTERNAL.empty,
                INTERNAL.reserved
            ]
        );
    }

    #[test]
    fn full_layout_degrades_once() {
        let mgr = manager(2);
        for h in 1..=2 {
            mgr.register_set_layout(DescriptorSetLayoutHandle(h), ssbo_set(1));
        }
        let desc = PipelineLayoutDesc {
            set_layouts: vec![DescriptorSetLayoutHandle(1), DescriptorSetLayoutHandle(2)],
            push_constant_ranges: vec![],
        };
        let sink = CollectingSink::new();
        let mut created = false;
        let aug = mgr.augment_pipeline_layout(PipelineLayoutHandle(7), &desc, INTERNAL, &sink, |_| {
            created = true;
            Ok(PipelineLayoutHandle(8))
        });
        assert!(!created);
        assert!(matches!(aug, LayoutAugmentation::NotInstrumentable { .. }));
        assert_eq!(sink.count(rules::RESERVED_SLOT_UNAVAILABLE), 1);
        assert_eq!(mgr.stats.snapshot().layouts_degraded, 1);
        assert_eq!(mgr.forget(PipelineLayoutHandle(7)), None);
    }

    #[test]
    fn augmented_layout_is_recorded_and_forgotten() {
        let mgr = manager(4);
        mgr.register_set_layout(DescriptorSetLayoutHandle(1), ssbo_set(3));
        let desc = PipelineLayoutDesc {
            set_layouts: vec![DescriptorSetLayoutHandle(1)],
            push_constant_ranges: vec![PushConstantRange {
                stages: ShaderStages::COMPUTE,
                offset: 0,
                size: 16,
            }],
        };
        let sink = CollectingSink::new();
        let aug = mgr.augment_pipeline_layout(PipelineLayoutHandle(7), &desc, INTERNAL, &sink, |d| {
            assert_eq!(d.set_layouts.len(), 4);
            Ok(PipelineLayoutHandle(8))
        });
        let a = aug.augmented().unwrap();
        assert_eq!(a.instrumentation.push_constant_end, 16);
        let slot = a.instrumentation.slot(0, 0).unwrap();
        assert_eq!(slot.first_word, INPUT_HEADER_WORDS);
        assert_eq!(slot.tracked, 3);
        assert_eq!(a.instrumentation.address_table_word(), INPUT_HEADER_WORDS + 6);
        assert!(sink.snapshot().is_empty());
        assert_eq!(mgr.lookup(PipelineLayoutHandle(7)), Some(aug.clone()));
        assert_eq!(mgr.forget(PipelineLayoutHandle(7)), Some(PipelineLayoutHandle(8)));
        assert_eq!(mgr.lookup(PipelineLayoutHandle(7)), None);
    }

    #[test]
    fn tracked_elements_are_capped() {
        let layout = InstrumentationLayout::new(1, &[ssbo_set(100)], 0, 8);
        assert_eq!(layout.descriptors[0].tracked, 8);
        assert_eq!(layout.descriptor_words, 16);
        assert_eq!(layout.input_words(2), INPUT_HEADER_WORDS + 16 + 8);
    }

    #[test]
    fn fingerprint_tracks_shape() {
        let mgr = manager(4);
        mgr.register_set_layout(DescriptorSetLayoutHandle(1), ssbo_set(1));
        mgr.register_set_layout(DescriptorSetLayoutHandle(2), ssbo_set(1));
        mgr.register_set_layout(DescriptorSetLayoutHandle(3), ssbo_set(2));
        let plan = |h| {
            mgr.plan(
                &PipelineLayoutDesc {
                    set_layouts: vec![DescriptorSetLayoutHandle(h)],
                    push_constant_ranges: vec![],
                },
                INTERNAL,
            )
            .unwrap()
            .fingerprint
        };
        assert_eq!(plan(1), plan(2));
        assert_ne!(plan(1), plan(3));
    }

    #[test]
    fn pool_sizes_gain_room_for_reserved_sets() {
        let sizes = augment_pool_sizes(
            &[PoolSize {
                kind: DescriptorKind::StorageBuffer,
                count: 4,
            }],
            8,
        );
        assert_eq!(sizes[0].count, 20);
        let sizes = augment_pool_sizes(&[], 2);
        assert_eq!(
            sizes,
            vec![PoolSize {
                kind: DescriptorKind::StorageBuffer,
                count: 4
            }]
        );
    }
}
