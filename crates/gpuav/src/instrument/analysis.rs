//! Finds instrumentable operations and describes the checks each one needs.
//!
//! Analysis only reads the module. Everything the rewrite needs is copied into owned
//! [`Site`]s so the module can be mutated afterwards.

use gpuav_spirv::{op, Module};

use crate::config::CheckSet;
use crate::layout::InstrumentationLayout;
use crate::protocol::MIXED_EXECUTION_MODEL;
use crate::shader::ModuleIndex;

use super::SourceLocation;

/// Longest access chain sequence followed back to its variable.
const MAX_CHAIN_DEPTH: usize = 16;

/// An integer operand of a check, before normalisation to `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Index {
    Const(u32),
    Dynamic { id: u32, width: u32, signed: bool },
}

/// `constant + sum(index * stride)` in bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ByteOffset {
    pub constant: u64,
    pub terms: Vec<(Index, u64)>,
}

impl ByteOffset {
    fn add(&mut self, index: Index, stride: u64) {
        match index {
            Index::Const(c) => self.constant = self.constant.saturating_add(u64::from(c) * stride),
            dynamic => self.terms.push((dynamic, stride)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CheckOp {
    /// `index < count` for a dynamically indexed descriptor array.
    DescriptorIndex {
        set: u32,
        binding: u32,
        index: Index,
        count: u32,
    },
    /// The descriptor element was written before the draw, per the input buffer.
    DescriptorWritten {
        set: u32,
        binding: u32,
        index: Index,
        first_word: u32,
        tracked: u32,
    },
    /// `index < length` for a fixed-size array, vector or matrix inside a buffer block.
    ArrayIndex {
        set: u32,
        binding: u32,
        element: Index,
        index: Index,
        length: u32,
    },
    /// The access ends within the bound range, read from the input buffer.
    BoundRange {
        set: u32,
        binding: u32,
        element: Index,
        end: ByteOffset,
        first_word: u32,
        tracked: u32,
    },
    PushConstantRange {
        end: ByteOffset,
        range_end: u32,
    },
    Address {
        pointer: u32,
        size: u32,
    },
    ImageBounds {
        set: u32,
        binding: u32,
        image: u32,
        coord: u32,
        components: u32,
        coord_signed: bool,
    },
}

impl CheckOp {
    pub fn check_set(&self) -> CheckSet {
        match self {
            Self::DescriptorIndex { .. } | Self::DescriptorWritten { .. } => {
                CheckSet::DESCRIPTOR_INDEXING
            }
            Self::ArrayIndex { .. } | Self::BoundRange { .. } => CheckSet::BUFFER_OOB,
            Self::PushConstantRange { .. } => CheckSet::PUSH_CONSTANT,
            Self::Address { .. } => CheckSet::BUFFER_ADDRESS,
            Self::ImageBounds { .. } => CheckSet::IMAGE_OOB,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scalar {
    Bool,
    Int { width: u32, signed: bool },
    Float { width: u32 },
    /// Formatted as a zero word.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PrintfArg {
    pub id: u32,
    pub ty: u32,
    pub scalar: Scalar,
    pub scalar_ty: u32,
    /// `1` for scalars.
    pub components: u32,
}

impl PrintfArg {
    pub fn words(&self) -> u32 {
        let per = match self.scalar {
            Scalar::Int { width: 64, .. } | Scalar::Float { width: 64 } => 2,
            _ => 1,
        };
        per * self.components
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PrintfCall {
    pub format: String,
    pub args: Vec<PrintfArg>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SiteAction {
    Check(Vec<CheckOp>),
    Printf(PrintfCall),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Site {
    pub func: usize,
    pub block: usize,
    pub inst: usize,
    /// Word offset of the instruction in the original module.
    pub location: u32,
    pub opcode: u16,
    pub action: SiteAction,
    pub source: Option<SourceLocation>,
    pub in_loop_header: bool,
    /// `(type, id)` of the instruction's result.
    pub result: Option<(u32, u32)>,
    /// The result can be replaced by `OpConstantNull` through an `OpPhi`.
    pub nullable_result: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ModulePlan {
    pub sites: Vec<Site>,
    pub printf_import: Option<u32>,
    /// Shared execution model, or [`MIXED_EXECUTION_MODEL`].
    pub execution_model: u32,
}

pub(crate) fn plan_module(
    module: &Module,
    layout: &InstrumentationLayout,
    checks: CheckSet,
) -> ModulePlan {
    let index = ModuleIndex::new(module);
    let analyzer = Analyzer {
        index: &index,
        module,
        layout,
        checks,
        printf_import: module.ext_inst_import(op::DEBUG_PRINTF_SET),
    };
    let offsets = module.instruction_offsets();
    let mut sites = Vec::new();

    for (f, func) in module.functions.iter().enumerate() {
        for (b, block) in func.blocks.iter().enumerate() {
            let in_loop_header = block.loop_merge().is_some();
            // OpLine scope ends at the block boundary.
            let mut line: Option<SourceLocation> = None;
            for (i, inst) in block.instructions.iter().enumerate() {
                match inst.opcode {
                    op::LINE => {
                        line = inst.operand(0).map(|file| SourceLocation {
                            file: module.string(file).unwrap_or_default(),
                            line: inst.operand(1).unwrap_or(0),
                            column: inst.operand(2).unwrap_or(0),
                        });
                        continue;
                    }
                    op::NO_LINE => {
                        line = None;
                        continue;
                    }
                    _ => {}
                }
                let Some(action) = analyzer.site_action(inst) else {
                    continue;
                };
                let location = offsets
                    .get(f)
                    .and_then(|blocks| blocks.get(b))
                    .and_then(|insts| insts.get(i))
                    .copied()
                    .unwrap_or(0) as u32;
                let result = inst.result_type().zip(inst.result_id());
                sites.push(Site {
                    func: f,
                    block: b,
                    inst: i,
                    location,
                    opcode: inst.opcode,
                    action,
                    source: line.clone(),
                    in_loop_header,
                    result,
                    nullable_result: result.map_or(true, |(ty, _)| nullable(&index, ty, 0)),
                });
            }
        }
    }

    let mut models = module.entry_point_infos().into_iter().map(|(m, _, _)| m);
    let first = models.next().unwrap_or(MIXED_EXECUTION_MODEL);
    let execution_model = if models.all(|m| m == first) {
        first
    } else {
        MIXED_EXECUTION_MODEL
    };

    ModulePlan {
        sites,
        printf_import: analyzer.printf_import,
        execution_model,
    }
}

/// Whether values of `ty` may flow through `OpPhi` and `OpConstantNull`.
fn nullable(index: &ModuleIndex<'_>, ty: u32, depth: u32) -> bool {
    if depth > 16 {
        return false;
    }
    let Some(def) = index.def(ty) else {
        return false;
    };
    match def.opcode {
        op::TYPE_BOOL | op::TYPE_INT | op::TYPE_FLOAT => true,
        op::TYPE_VECTOR | op::TYPE_MATRIX | op::TYPE_ARRAY => def
            .operand(1)
            .is_some_and(|inner| nullable(index, inner, depth + 1)),
        op::TYPE_STRUCT => def
            .operands
            .iter()
            .skip(1)
            .all(|&member| nullable(index, member, depth + 1)),
        _ => false,
    }
}

struct Analyzer<'a, 'm> {
    index: &'a ModuleIndex<'m>,
    module: &'m Module,
    layout: &'a InstrumentationLayout,
    checks: CheckSet,
    printf_import: Option<u32>,
}

impl Analyzer<'_, '_> {
    fn site_action(&self, inst: &gpuav_spirv::Instruction) -> Option<SiteAction> {
        let pointer = match inst.opcode {
            op::LOAD | op::ATOMIC_LOAD => inst.operand(2)?,
            op::STORE | op::ATOMIC_STORE => inst.operand(0)?,
            op::ATOMIC_EXCHANGE..=op::ATOMIC_XOR => inst.operand(2)?,
            op::IMAGE_READ => return self.image_site(inst.operand(2)?, inst.operand(3)?),
            op::IMAGE_WRITE => return self.image_site(inst.operand(0)?, inst.operand(1)?),
            op::EXT_INST => return self.printf_site(inst),
            _ => return None,
        };
        let ops = self.memory_checks(pointer)?;
        let ops: Vec<CheckOp> = ops
            .into_iter()
            .filter(|c| self.checks.contains(c.check_set()))
            .collect();
        (!ops.is_empty()).then_some(SiteAction::Check(ops))
    }

    fn classify(&self, id: u32) -> Option<Index> {
        if let Some(def) = self.index.def(id) {
            if def.opcode == op::CONSTANT {
                let lo = def.operand(2)?;
                let hi = def.operand(3).unwrap_or(0);
                return Some(if hi == 0 {
                    Index::Const(lo)
                } else {
                    Index::Const(u32::MAX)
                });
            }
        }
        let ty = self.index.def(self.index.value_type(id)?)?;
        if ty.opcode != op::TYPE_INT {
            return None;
        }
        Some(Index::Dynamic {
            id,
            width: ty.operand(1)?,
            signed: ty.operand(2)? == 1,
        })
    }

    /// Follows access chains from `pointer` back to a module-scope variable.
    fn resolve_chain(&self, pointer: u32) -> Option<(u32, Vec<u32>)> {
        let mut segments: Vec<&[u32]> = Vec::new();
        let mut cur = pointer;
        for _ in 0..MAX_CHAIN_DEPTH {
            if let Some(def) = self.index.def(cur) {
                if def.opcode != op::VARIABLE {
                    return None;
                }
                let indices = segments.iter().rev().flat_map(|s| s.iter().copied()).collect();
                return Some((cur, indices));
            }
            let def = self.index.local_def(cur)?;
            if !matches!(def.opcode, op::ACCESS_CHAIN | op::IN_BOUNDS_ACCESS_CHAIN) {
                return None;
            }
            segments.push(def.operands.get(3..).unwrap_or(&[]));
            cur = def.operand(2)?;
        }
        None
    }

    fn memory_checks(&self, pointer: u32) -> Option<Vec<CheckOp>> {
        let ptr_ty = self.index.value_type(pointer)?;
        let (sc, pointee) = self.index.pointer(ptr_ty)?;
        if sc == op::storage_class::PHYSICAL_STORAGE_BUFFER {
            let size = self.index.type_size(pointee)?;
            return Some(vec![CheckOp::Address {
                pointer,
                size: u32::try_from(size).ok()?,
            }]);
        }

        let (var, indices) = self.resolve_chain(pointer)?;
        let var_def = self.index.def(var)?;
        let var_sc = var_def.operand(2)?;
        let (_, var_pointee) = self.index.pointer(var_def.operand(0)?)?;
        match var_sc {
            op::storage_class::STORAGE_BUFFER | op::storage_class::UNIFORM => {
                self.buffer_checks(var, var_pointee, &indices)
            }
            op::storage_class::PUSH_CONSTANT => {
                let walk = self.walk(var_pointee, &indices)?;
                if walk.offset.terms.is_empty() {
                    return None;
                }
                let mut end = walk.offset;
                end.constant = end.constant.saturating_add(walk.access_size?);
                Some(vec![CheckOp::PushConstantRange {
                    end,
                    range_end: self.layout.push_constant_end,
                }])
            }
            _ => None,
        }
    }

    fn buffer_checks(&self, var: u32, pointee: u32, indices: &[u32]) -> Option<Vec<CheckOp>> {
        let set = self.index.decoration_word(var, op::decoration::DESCRIPTOR_SET)?;
        let binding = self.index.decoration_word(var, op::decoration::BINDING)?;
        let slot = self.layout.slot(set, binding).copied();

        let def = self.index.def(pointee)?;
        let (element, array_len, block_ty, rest) = match def.opcode {
            op::TYPE_ARRAY | op::TYPE_RUNTIME_ARRAY => {
                let (first, rest) = indices.split_first()?;
                let len = match def.opcode {
                    op::TYPE_ARRAY => Some(self.index.constant(def.operand(2)?)?),
                    _ => None,
                };
                (self.classify(*first)?, len, def.operand(1)?, rest)
            }
            _ => (Index::Const(0), Some(1), pointee, indices),
        };

        let mut ops = Vec::new();
        if let Index::Dynamic { .. } = element {
            if let Some(count) = array_len.or(slot.map(|s| s.count)) {
                ops.push(CheckOp::DescriptorIndex {
                    set,
                    binding,
                    index: element,
                    count,
                });
            }
        }
        if let Some(slot) = slot.filter(|s| s.tracked > 0) {
            ops.push(CheckOp::DescriptorWritten {
                set,
                binding,
                index: element,
                first_word: slot.first_word,
                tracked: slot.tracked,
            });
        }

        let walk = self.walk(block_ty, rest)?;
        for (index, length) in walk.sized {
            ops.push(CheckOp::ArrayIndex {
                set,
                binding,
                element,
                index,
                length,
            });
        }
        if walk.runtime {
            if let (Some(size), Some(slot)) = (walk.access_size, slot.filter(|s| s.tracked > 0)) {
                let mut end = walk.offset;
                end.constant = end.constant.saturating_add(size);
                ops.push(CheckOp::BoundRange {
                    set,
                    binding,
                    element,
                    end,
                    first_word: slot.first_word,
                    tracked: slot.tracked,
                });
            }
        }
        Some(ops)
    }

    fn walk(&self, mut ty: u32, indices: &[u32]) -> Option<Walk> {
        let mut walk = Walk::default();
        let mut offset_known = true;
        for &id in indices {
            let def = self.index.def(ty)?;
            match def.opcode {
                op::TYPE_STRUCT => {
                    let member = self.index.constant(id)?;
                    match self.index.member_offset(ty, member) {
                        Some(off) => walk.offset.add(Index::Const(off), 1),
                        None => offset_known = false,
                    }
                    ty = def.operand(1 + member as usize)?;
                }
                op::TYPE_ARRAY | op::TYPE_RUNTIME_ARRAY => {
                    let element = def.operand(1)?;
                    let index = self.classify(id)?;
                    match self.index.array_stride(ty, element, 0) {
                        Some(stride) => walk.offset.add(index, stride),
                        None => offset_known = false,
                    }
                    if def.opcode == op::TYPE_RUNTIME_ARRAY {
                        walk.runtime = true;
                    } else if let Index::Dynamic { .. } = index {
                        walk.sized
                            .push((index, self.index.constant(def.operand(2)?)?));
                    }
                    ty = element;
                }
                op::TYPE_VECTOR | op::TYPE_MATRIX => {
                    let element = def.operand(1)?;
                    let count = def.operand(2)?;
                    let index = self.classify(id)?;
                    if let Index::Dynamic { .. } = index {
                        walk.sized.push((index, count));
                    }
                    if def.opcode == op::TYPE_VECTOR {
                        match self.index.type_size(element) {
                            Some(size) => walk.offset.add(index, size),
                            None => offset_known = false,
                        }
                    } else {
                        // Column stride lives on the enclosing struct member.
                        offset_known = false;
                    }
                    ty = element;
                }
                _ => return None,
            }
        }
        walk.access_size = if offset_known {
            self.index.type_size(ty)
        } else {
            None
        };
        Some(walk)
    }

    fn image_site(&self, image: u32, coord: u32) -> Option<SiteAction> {
        if !self.checks.contains(CheckSet::IMAGE_OOB) {
            return None;
        }
        // OpTypeImage: id, sampled type, dim, depth, arrayed, ms, sampled, format
        let image_ty = self.index.def(self.index.value_type(image)?)?;
        if image_ty.opcode != op::TYPE_IMAGE || image_ty.operand(4)? != 0 || image_ty.operand(5)? != 0
        {
            return None;
        }
        let components = match image_ty.operand(2)? {
            op::dim::DIM_1D => 1,
            op::dim::DIM_2D => 2,
            op::dim::DIM_3D => 3,
            _ => return None,
        };
        let coord_ty = self.index.def(self.index.value_type(coord)?)?;
        let (scalar, count) = match coord_ty.opcode {
            op::TYPE_VECTOR => (self.index.def(coord_ty.operand(1)?)?, coord_ty.operand(2)?),
            _ => (coord_ty, 1),
        };
        if scalar.opcode != op::TYPE_INT || scalar.operand(1)? != 32 || count != components {
            return None;
        }
        let (set, binding) = self
            .index
            .local_def(image)
            .filter(|d| d.opcode == op::LOAD)
            .and_then(|d| d.operand(2))
            .and_then(|var| {
                Some((
                    self.index.decoration_word(var, op::decoration::DESCRIPTOR_SET)?,
                    self.index.decoration_word(var, op::decoration::BINDING)?,
                ))
            })
            .unwrap_or((u32::MAX, u32::MAX));
        Some(SiteAction::Check(vec![CheckOp::ImageBounds {
            set,
            binding,
            image,
            coord,
            components,
            coord_signed: scalar.operand(2)? == 1,
        }]))
    }

    fn printf_site(&self, inst: &gpuav_spirv::Instruction) -> Option<SiteAction> {
        let import = self.printf_import?;
        if !self.checks.contains(CheckSet::DEBUG_PRINTF)
            || inst.operand(2) != Some(import)
            || inst.operand(3) != Some(op::DEBUG_PRINTF_INSTRUCTION)
        {
            return None;
        }
        let format = self.module.string(inst.operand(4)?)?;
        let args = inst
            .operands
            .get(5..)
            .unwrap_or(&[])
            .iter()
            .map(|&id| self.printf_arg(id))
            .collect();
        Some(SiteAction::Printf(PrintfCall { format, args }))
    }

    fn printf_arg(&self, id: u32) -> PrintfArg {
        let ty = self.index.value_type(id).unwrap_or(0);
        let (scalar_ty, components) = match self.index.def(ty) {
            Some(def) if def.opcode == op::TYPE_VECTOR => (
                def.operand(1).unwrap_or(0),
                def.operand(2).unwrap_or(1),
            ),
            _ => (ty, 1),
        };
        let scalar = match self.index.def(scalar_ty) {
            Some(def) => match (def.opcode, def.operand(1), def.operand(2)) {
                (op::TYPE_BOOL, _, _) => Scalar::Bool,
                (op::TYPE_INT, Some(width @ (8 | 16 | 32 | 64)), Some(signed)) => Scalar::Int {
                    width,
                    signed: signed == 1,
                },
                (op::TYPE_FLOAT, Some(width @ (16 | 32 | 64)), _) => Scalar::Float { width },
                _ => Scalar::Other,
            },
            None => Scalar::Other,
        };
        PrintfArg {
            id,
            ty,
            scalar,
            scalar_ty,
            components,
        }
    }
}

#[derive(Debug, Default)]
struct Walk {
    offset: ByteOffset,
    sized: Vec<(Index, u32)>,
    runtime: bool,
    /// Size of the accessed value; `None` when the offset could not be computed.
    access_size: Option<u64>,
}
