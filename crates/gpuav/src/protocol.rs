//! Layout of the diagnostic output buffer shared between instrumented shaders and the host.
//!
//! ```text
//! word 0          written counter, bumped atomically for every attempted record
//! word 1          capacity in records, written by the host
//! words 2..4      reserved, zero
//! word 4 + 16*i   record slot i
//! ```
//!
//! Each slot is a 7-word [`RecordHeader`] followed by 9 payload words. A slot whose kind
//! word is zero was never written.

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::diagnostics::{rules, Severity};

pub const HEADER_WORDS: usize = 4;
pub const COUNTER_WORD: usize = 0;
pub const CAPACITY_WORD: usize = 1;
pub const RECORD_WORDS: usize = 16;
pub const RECORD_HEADER_WORDS: usize = 7;
pub const PAYLOAD_WORDS: usize = RECORD_WORDS - RECORD_HEADER_WORDS;
/// Payload words passed to the generated check function.
pub const CHECK_PAYLOAD_WORDS: usize = 8;
/// Argument words a single debug-printf record can carry.
pub const PRINTF_MAX_ARG_WORDS: usize = PAYLOAD_WORDS - 2;

/// Execution model word used when a module's entry points disagree.
pub const MIXED_EXECUTION_MODEL: u32 = u32::MAX;

/// Words needed for an output buffer with `capacity` record slots.
pub const fn output_buffer_words(capacity: u32) -> usize {
    HEADER_WORDS + capacity as usize * RECORD_WORDS
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct OutputHeader {
    pub counter: u32,
    pub capacity: u32,
    pub reserved: [u32; 2],
}

impl OutputHeader {
    pub fn new(capacity: u32) -> Self {
        Self {
            counter: 0,
            capacity,
            reserved: [0; 2],
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RecordHeader {
    pub kind: u32,
    pub shader_id: u32,
    /// Word offset of the checked instruction in the original module.
    pub location: u32,
    pub execution_model: u32,
    pub stage: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RawRecord {
    pub header: RecordHeader,
    pub payload: [u32; PAYLOAD_WORDS],
}

impl RawRecord {
    pub const SIZE_BYTES: u64 = core::mem::size_of::<Self>() as u64;

    pub fn from_words(words: &[u32; RECORD_WORDS]) -> Self {
        bytemuck::cast(*words)
    }

    pub fn to_words(self) -> [u32; RECORD_WORDS] {
        bytemuck::cast(self)
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    BufferOob = 1,
    DescriptorIndexOob = 2,
    DescriptorUninitialized = 3,
    AddressOob = 4,
    PushConstantOob = 5,
    ImageOob = 6,
    DebugPrintf = 7,
}

impl RecordKind {
    pub const ALL: [RecordKind; 7] = [
        Self::BufferOob,
        Self::DescriptorIndexOob,
        Self::DescriptorUninitialized,
        Self::AddressOob,
        Self::PushConstantOob,
        Self::ImageOob,
        Self::DebugPrintf,
    ];

    pub fn from_u32(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|k| *k as u32 == raw)
    }

    pub fn rule_id(self) -> &'static str {
        match self {
            Self::BufferOob => rules::BUFFER_OOB,
            Self::DescriptorIndexOob => rules::DESCRIPTOR_INDEX_OOB,
            Self::DescriptorUninitialized => rules::DESCRIPTOR_UNINITIALIZED,
            Self::AddressOob => rules::ADDRESS_OOB,
            Self::PushConstantOob => rules::PUSH_CONSTANT_OOB,
            Self::ImageOob => rules::IMAGE_OOB,
            Self::DebugPrintf => rules::DEBUG_PRINTF,
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::DebugPrintf => Severity::Info,
            _ => Severity::Error,
        }
    }

    /// Debug-printf records do not claim the invocation's single violation report.
    pub fn is_violation(self) -> bool {
        self != Self::DebugPrintf
    }
}

/// Which limit a [`Payload::BufferOob`] record was checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferCheck {
    /// `value` is the end byte of the access, `limit` the bound range size.
    BoundRange,
    /// `value` is an array index, `limit` the array length.
    ArrayIndex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    BufferOob {
        set: u32,
        binding: u32,
        element: u32,
        value: u32,
        limit: u32,
        check: BufferCheck,
    },
    DescriptorIndexOob {
        set: u32,
        binding: u32,
        index: u32,
        count: u32,
    },
    DescriptorUninitialized {
        set: u32,
        binding: u32,
        index: u32,
    },
    AddressOob {
        address: u64,
        size: u32,
    },
    PushConstantOob {
        end: u32,
        range_end: u32,
    },
    ImageOob {
        set: u32,
        binding: u32,
        coord: [u32; 3],
        extent: [u32; 3],
    },
    DebugPrintf {
        format_index: u32,
        /// Total argument words the shader produced; may exceed `args.len()`.
        arg_words: u32,
        args: Vec<u32>,
    },
}

impl Payload {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::BufferOob { .. } => RecordKind::BufferOob,
            Self::DescriptorIndexOob { .. } => RecordKind::DescriptorIndexOob,
            Self::DescriptorUninitialized { .. } => RecordKind::DescriptorUninitialized,
            Self::AddressOob { .. } => RecordKind::AddressOob,
            Self::PushConstantOob { .. } => RecordKind::PushConstantOob,
            Self::ImageOob { .. } => RecordKind::ImageOob,
            Self::DebugPrintf { .. } => RecordKind::DebugPrintf,
        }
    }

    fn encode(&self) -> [u32; PAYLOAD_WORDS] {
        let mut p = [0u32; PAYLOAD_WORDS];
        match self {
            Self::BufferOob {
                set,
                binding,
                element,
                value,
                limit,
                check,
            } => {
                let mode = match check {
                    BufferCheck::BoundRange => 0,
                    BufferCheck::ArrayIndex => 1,
                };
                p[..6].copy_from_slice(&[*set, *binding, *element, *value, *limit, mode]);
            }
            Self::DescriptorIndexOob {
                set,
                binding,
                index,
                count,
            } => p[..4].copy_from_slice(&[*set, *binding, *index, *count]),
            Self::DescriptorUninitialized {
                set,
                binding,
                index,
            } => p[..3].copy_from_slice(&[*set, *binding, *index]),
            Self::AddressOob { address, size } => {
                p[..3].copy_from_slice(&[*address as u32, (*address >> 32) as u32, *size])
            }
            Self::PushConstantOob { end, range_end } => p[..2].copy_from_slice(&[*end, *range_end]),
            Self::ImageOob {
                set,
                binding,
                coord,
                extent,
            } => {
                p[0] = *set;
                p[1] = *binding;
                p[2..5].copy_from_slice(coord);
                p[5..8].copy_from_slice(extent);
            }
            Self::DebugPrintf {
                format_index,
                arg_words,
                args,
            } => {
                p[0] = *format_index;
                p[1] = *arg_words;
                let n = args.len().min(PRINTF_MAX_ARG_WORDS);
                p[2..2 + n].copy_from_slice(&args[..n]);
            }
        }
        p
    }

    fn decode(kind: RecordKind, p: &[u32; PAYLOAD_WORDS]) -> Result<Self, MalformedRecord> {
        let inconsistent = |reason| Err(MalformedRecord::Inconsistent { kind, reason });
        let payload = match kind {
            RecordKind::BufferOob => {
                let check = match p[5] {
                    0 => BufferCheck::BoundRange,
                    1 => BufferCheck::ArrayIndex,
                    _ => return inconsistent("unknown buffer check mode"),
                };
                let (value, limit) = (p[3], p[4]);
                let violated = match check {
                    BufferCheck::BoundRange => value > limit,
                    BufferCheck::ArrayIndex => value >= limit,
                };
                if !violated {
                    return inconsistent("reported access is within bounds");
                }
                Self::BufferOob {
                    set: p[0],
                    binding: p[1],
                    element: p[2],
                    value,
                    limit,
                    check,
                }
            }
            RecordKind::DescriptorIndexOob => {
                if p[2] < p[3] {
                    return inconsistent("reported descriptor index is within the array");
                }
                Self::DescriptorIndexOob {
                    set: p[0],
                    binding: p[1],
                    index: p[2],
                    count: p[3],
                }
            }
            RecordKind::DescriptorUninitialized => Self::DescriptorUninitialized {
                set: p[0],
                binding: p[1],
                index: p[2],
            },
            RecordKind::AddressOob => {
                if p[2] == 0 {
                    return inconsistent("zero-sized address access");
                }
                Self::AddressOob {
                    address: u64::from(p[0]) | (u64::from(p[1]) << 32),
                    size: p[2],
                }
            }
            RecordKind::PushConstantOob => {
                if p[0] <= p[1] {
                    return inconsistent("reported push constant access is within range");
                }
                Self::PushConstantOob {
                    end: p[0],
                    range_end: p[1],
                }
            }
            RecordKind::ImageOob => {
                let coord = [p[2], p[3], p[4]];
                let extent = [p[5], p[6], p[7]];
                if coord.iter().zip(&extent).all(|(c, e)| c < e) {
                    return inconsistent("reported coordinate is inside the image");
                }
                Self::ImageOob {
                    set: p[0],
                    binding: p[1],
                    coord,
                    extent,
                }
            }
            RecordKind::DebugPrintf => {
                let stored = (p[1] as usize).min(PRINTF_MAX_ARG_WORDS);
                Self::DebugPrintf {
                    format_index: p[0],
                    arg_words: p[1],
                    args: p[2..2 + stored].to_vec(),
                }
            }
        };
        Ok(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecord {
    #[error("unknown record kind {0}")]
    UnknownKind(u32),

    #[error("{kind:?} record is inconsistent: {reason}")]
    Inconsistent {
        kind: RecordKind,
        reason: &'static str,
    },
}

/// A decoded record slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRecord {
    pub shader_id: u32,
    pub location: u32,
    pub execution_model: u32,
    pub stage: [u32; 3],
    pub payload: Payload,
}

impl DiagnosticRecord {
    pub fn kind(&self) -> RecordKind {
        self.payload.kind()
    }

    pub fn encode(&self) -> [u32; RECORD_WORDS] {
        RawRecord {
            header: RecordHeader {
                kind: self.kind() as u32,
                shader_id: self.shader_id,
                location: self.location,
                execution_model: self.execution_model,
                stage: self.stage,
            },
            payload: self.payload.encode(),
        }
        .to_words()
    }

    pub fn decode(words: &[u32; RECORD_WORDS]) -> Result<Self, MalformedRecord> {
        let raw = RawRecord::from_words(words);
        let kind = RecordKind::from_u32(raw.header.kind)
            .ok_or(MalformedRecord::UnknownKind(raw.header.kind))?;
        Ok(Self {
            shader_id: raw.header.shader_id,
            location: raw.header.location,
            execution_model: raw.header.execution_model,
            stage: raw.header.stage,
            payload: Payload::decode(kind, &raw.payload)?,
        })
    }
}

/// Per-invocation state of the GPU write protocol.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InvocationState {
    reported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { slot: u32 },
    /// Counted but no slot left.
    Dropped,
    /// The invocation already reported a violation.
    Suppressed,
}

/// Host-side implementation of the protocol the generated shader code follows.
///
/// Tests and the mock driver use it to produce output buffers exactly as an instrumented
/// shader would.
#[derive(Debug)]
pub struct RecordWriter<'a> {
    words: &'a mut [u32],
}

impl<'a> RecordWriter<'a> {
    pub fn new(words: &'a mut [u32]) -> Self {
        Self { words }
    }

    /// Zeroes the buffer and writes a fresh header.
    pub fn init(words: &'a mut [u32], capacity: u32) -> Self {
        words.fill(0);
        if words.len() > CAPACITY_WORD {
            words[CAPACITY_WORD] = capacity;
        }
        Self { words }
    }

    pub fn counter(&self) -> u32 {
        self.words.get(COUNTER_WORD).copied().unwrap_or(0)
    }

    pub fn capacity(&self) -> u32 {
        self.words.get(CAPACITY_WORD).copied().unwrap_or(0)
    }

    pub fn write(
        &mut self,
        invocation: &mut InvocationState,
        record: &DiagnosticRecord,
    ) -> WriteOutcome {
        if record.kind().is_violation() {
            if invocation.reported {
                return WriteOutcome::Suppressed;
            }
            invocation.reported = true;
        }
        if self.words.len() < HEADER_WORDS {
            return WriteOutcome::Dropped;
        }
        let slot = self.words[COUNTER_WORD];
        self.words[COUNTER_WORD] = slot.wrapping_add(1);
        if slot >= self.words[CAPACITY_WORD] {
            return WriteOutcome::Dropped;
        }
        let start = HEADER_WORDS + slot as usize * RECORD_WORDS;
        let Some(dst) = self.words.get_mut(start..start + RECORD_WORDS) else {
            return WriteOutcome::Dropped;
        };
        dst.copy_from_slice(&record.encode());
        WriteOutcome::Written { slot }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(payload: Payload) -> DiagnosticRecord {
        DiagnosticRecord {
            shader_id: 3,
            location: 120,
            execution_model: 5,
            stage: [1, 2, 3],
            payload,
        }
    }

    #[test]
    fn layout_sizes() {
        assert_eq!(core::mem::size_of::<OutputHeader>(), HEADER_WORDS * 4);
        assert_eq!(core::mem::size_of::<RecordHeader>(), RECORD_HEADER_WORDS * 4);
        assert_eq!(RawRecord::SIZE_BYTES as usize, RECORD_WORDS * 4);
        assert_eq!(output_buffer_words(2), 4 + 32);
    }

    #[test]
    fn unknown_kind_is_malformed() {
        let mut words = [0u32; RECORD_WORDS];
        words[0] = 99;
        assert_eq!(
            DiagnosticRecord::decode(&words),
            Err(MalformedRecord::UnknownKind(99))
        );
    }

    #[test]
    fn in_bounds_payload_is_inconsistent() {
        let mut words = record(Payload::PushConstantOob {
            end: 20,
            range_end: 16,
        })
        .encode();
        words[RECORD_HEADER_WORDS] = 8;
        assert!(matches!(
            DiagnosticRecord::decode(&words),
            Err(MalformedRecord::Inconsistent {
                kind: RecordKind::PushConstantOob,
                ..
            })
        ));
    }

    #[test]
    fn writer_enforces_first_violation_and_capacity() {
        let mut buf = vec![0u32; output_buffer_words(1)];
        let mut writer = RecordWriter::init(&mut buf, 1);
        let oob = record(Payload::DescriptorUninitialized {
            set: 0,
            binding: 1,
            index: 2,
        });
        let mut a = InvocationState::default();
        let mut b = InvocationState::default();
        assert_eq!(writer.write(&mut a, &oob), WriteOutcome::Written { slot: 0 });
        assert_eq!(writer.write(&mut a, &oob), WriteOutcome::Suppressed);
        assert_eq!(writer.write(&mut b, &oob), WriteOutcome::Dropped);
        assert_eq!(writer.counter(), 2);

        let printf = record(Payload::DebugPrintf {
            format_index: 0,
            arg_words: 0,
            args: vec![],
        });
        // Printf does not consume the invocation's report.
        let mut c = InvocationState::default();
        assert_eq!(writer.write(&mut c, &printf), WriteOutcome::Dropped);
        assert_eq!(writer.write(&mut c, &oob), WriteOutcome::Dropped);
        assert_eq!(writer.counter(), 4);
    }

    fn arb_payload() -> impl Strategy<Value = Payload> {
        prop_oneof![
            (any::<u32>(), any::<u32>(), any::<u32>(), 0u32..u32::MAX, any::<bool>()).prop_map(
                |(set, binding, element, limit, index)| Payload::BufferOob {
                    set,
                    binding,
                    element,
                    value: limit + 1,
                    limit,
                    check: if index {
                        BufferCheck::ArrayIndex
                    } else {
                        BufferCheck::BoundRange
                    },
                }
            ),
            (any::<u32>(), any::<u32>(), any::<u32>()).prop_flat_map(|(set, binding, index)| {
                (0..=index).prop_map(move |count| Payload::DescriptorIndexOob {
                    set,
                    binding,
                    index,
                    count,
                })
            }),
            (any::<u32>(), any::<u32>(), any::<u32>()).prop_map(|(set, binding, index)| {
                Payload::DescriptorUninitialized {
                    set,
                    binding,
                    index,
                }
            }),
            (any::<u64>(), 1u32..).prop_map(|(address, size)| Payload::AddressOob { address, size }),
            (0u32..u32::MAX).prop_map(|range_end| Payload::PushConstantOob {
                end: range_end + 1,
                range_end,
            }),
            (any::<u32>(), any::<u32>(), any::<[u32; 3]>(), any::<[u32; 3]>()).prop_map(
                |(set, binding, coord, mut extent)| {
                    extent[0] = extent[0].min(coord[0]);
                    Payload::ImageOob {
                        set,
                        binding,
                        coord,
                        extent,
                    }
                }
            ),
            (any::<u32>(), proptest::collection::vec(any::<u32>(), 0..=PRINTF_MAX_ARG_WORDS))
                .prop_map(|(format_index, args)| Payload::DebugPrintf {
                    format_index,
                    arg_words: args.len() as u32,
                    args,
                }),
        ]
    }

    proptest! {
        #[test]
        fn records_roundtrip_for_every_kind(
            shader_id in any::<u32>(),
            location in any::<u32>(),
            execution_model in any::<u32>(),
            stage in any::<[u32; 3]>(),
            payload in arb_payload(),
        ) {
            let rec = DiagnosticRecord { shader_id, location, execution_model, stage, payload };
            let words = rec.encode();
            prop_assert_eq!(words[0], rec.kind() as u32);
            prop_assert_eq!(DiagnosticRecord::decode(&words), Ok(rec));
        }
    }
}
