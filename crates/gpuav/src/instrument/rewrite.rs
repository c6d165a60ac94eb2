//! Applies a [`ModulePlan`] to the module.
//!
//! In safe mode a guarded instruction is moved into its own block:
//!
//! ```text
//! %pre:    ...checks...                      %pre:   (unchanged label)
//!          %r = OpLoad ...           =>               OpSelectionMerge %merge
//!          ...rest...                                 OpBranchConditional %ok %valid %merge
//!                                            %valid:  %r' = OpLoad ...
//!                                                     OpBranch %merge
//!                                            %merge:  %r = OpPhi %r' %valid %null %pre
//!                                                     ...rest...
//! ```
//!
//! `OpPhi`s elsewhere in the function that named the original block as a parent are
//! pointed at the block that now holds its terminator.

use std::collections::{BTreeMap, HashMap, HashSet};

use gpuav_spirv::{op, Block, Instruction, Module, SpirvError};

use crate::config::CheckSet;
use crate::error::InstrumentError;
use crate::protocol::{RecordKind, PRINTF_MAX_ARG_WORDS};

use super::analysis::{ByteOffset, CheckOp, Index, ModulePlan, PrintfCall, Scalar, Site, SiteAction};
use super::emit::{stmt, value, Runtime};
use super::{Guard, SiteInfo};

#[derive(Debug)]
pub(crate) struct Rewritten {
    pub words: Vec<u32>,
    pub sites: BTreeMap<u32, SiteInfo>,
    pub printf_formats: Vec<String>,
    pub unguarded_sites: u32,
}

pub(crate) fn rewrite(
    mut module: Module,
    plan: ModulePlan,
    shader_id: u32,
    reserved_set: u32,
    safe_mode: bool,
) -> Result<Rewritten, InstrumentError> {
    let m = &mut module;
    let runtime = Runtime::new(m, shader_id, plan.execution_model, reserved_set)
        .map_err(InstrumentError::Malformed)?;
    let mut rw = Rewriter {
        rt: runtime,
        safe_mode,
        sites: BTreeMap::new(),
        merge_labels: HashSet::new(),
        printf_formats: Vec::new(),
        unguarded_sites: 0,
    };

    let mut by_block: HashMap<(usize, usize), BTreeMap<usize, Site>> = HashMap::new();
    for site in plan.sites {
        by_block
            .entry((site.func, site.block))
            .or_default()
            .insert(site.inst, site);
    }

    let mut functions = std::mem::take(&mut m.functions);
    for (f, func) in functions.iter_mut().enumerate() {
        let blocks = std::mem::take(&mut func.blocks);
        let mut new_blocks = Vec::with_capacity(blocks.len());
        let mut relabeled: HashMap<u32, u32> = HashMap::new();
        for (b, block) in blocks.into_iter().enumerate() {
            match by_block.remove(&(f, b)) {
                Some(sites) => {
                    let original = block.label;
                    let last = rw
                        .rewrite_block(m, block, sites, &mut new_blocks)
                        .map_err(InstrumentError::Malformed)?;
                    if last != original {
                        relabeled.insert(original, last);
                    }
                }
                None => new_blocks.push(block),
            }
        }
        if !relabeled.is_empty() {
            fix_phi_parents(&mut new_blocks, &relabeled, &rw.merge_labels);
        }
        func.blocks = new_blocks;
    }
    functions.extend(rw.rt.take_functions());
    m.functions = functions;

    if let Some(import) = plan.printf_import {
        remove_unused_import(m, import);
    }

    let words = module.to_words().map_err(InstrumentError::Malformed)?;
    // The result must survive our own parser before a driver sees it.
    Module::parse(&words)
        .and_then(|reparsed| reparsed.check_structure())
        .map_err(InstrumentError::Malformed)?;

    Ok(Rewritten {
        words,
        sites: rw.sites,
        printf_formats: rw.printf_formats,
        unguarded_sites: rw.unguarded_sites,
    })
}

fn fix_phi_parents(
    blocks: &mut [Block],
    relabeled: &HashMap<u32, u32>,
    created: &HashSet<u32>,
) {
    for block in blocks.iter_mut().filter(|b| !created.contains(&b.label)) {
        for inst in block
            .instructions
            .iter_mut()
            .take_while(|i| i.opcode == op::PHI || i.opcode == op::LINE || i.opcode == op::NO_LINE)
            .filter(|i| i.opcode == op::PHI)
        {
            // Operands: type, result, (value, parent)*
            for parent in inst.operands.iter_mut().skip(3).step_by(2) {
                if let Some(&last) = relabeled.get(parent) {
                    *parent = last;
                }
            }
        }
    }
}

fn remove_unused_import(m: &mut Module, import: u32) {
    let used = m.functions.iter().any(|f| {
        f.blocks.iter().any(|b| {
            b.instructions
                .iter()
                .any(|i| i.opcode == op::EXT_INST && i.operand(2) == Some(import))
        })
    });
    if !used {
        m.ext_inst_imports.retain(|i| i.result_id() != Some(import));
        m.debug_names.retain(|i| !(i.opcode == op::NAME && i.operand(0) == Some(import)));
    }
}

struct Rewriter {
    rt: Runtime,
    safe_mode: bool,
    sites: BTreeMap<u32, SiteInfo>,
    /// Blocks created by splitting; their `OpPhi`s already name the right parents.
    merge_labels: HashSet<u32>,
    printf_formats: Vec<String>,
    unguarded_sites: u32,
}

impl Rewriter {
    /// Returns the label of the block that ends up holding the original terminator.
    fn rewrite_block(
        &mut self,
        m: &mut Module,
        block: Block,
        mut sites: BTreeMap<usize, Site>,
        blocks: &mut Vec<Block>,
    ) -> Result<u32, SpirvError> {
        let mut label = block.label;
        let mut out = Vec::with_capacity(block.instructions.len());
        for (i, inst) in block.instructions.into_iter().enumerate() {
            let Some(site) = sites.remove(&i) else {
                out.push(inst);
                continue;
            };
            match &site.action {
                SiteAction::Printf(call) => {
                    self.lower_printf(m, &mut out, &site, call)?;
                    self.record(&site, CheckSet::DEBUG_PRINTF, Guard::ReportOnly);
                }
                SiteAction::Check(ops) => {
                    let checks = ops
                        .iter()
                        .fold(CheckSet::empty(), |acc, c| acc | c.check_set());
                    let guard = if !self.safe_mode {
                        Guard::ReportOnly
                    } else if site.in_loop_header {
                        Guard::Unguarded
                    } else if site.result.is_some() && !site.nullable_result {
                        Guard::ReportOnly
                    } else {
                        Guard::Guarded
                    };
                    self.record(&site, checks, guard);
                    if guard == Guard::Unguarded {
                        // Splitting a loop header would break its structure.
                        out.push(inst);
                        self.unguarded_sites += 1;
                        continue;
                    }
                    let ok = self.lower_checks(m, &mut out, site.location, ops)?;
                    match (guard, ok) {
                        (Guard::Guarded, Some(ok)) => {
                            label = self.split(m, label, &mut out, blocks, inst, &site, ok)?;
                        }
                        _ => out.push(inst),
                    }
                }
            }
        }
        blocks.push(Block {
            label,
            instructions: out,
        });
        Ok(label)
    }

    fn record(&mut self, site: &Site, checks: CheckSet, guard: Guard) {
        self.sites.insert(
            site.location,
            SiteInfo {
                opcode: site.opcode,
                checks,
                source: site.source.clone(),
                guard,
            },
        );
    }

    /// Closes the current block with a conditional branch around `inst`. Returns the label
    /// of the merge block, which becomes the current block.
    #[allow(clippy::too_many_arguments)]
    fn split(
        &mut self,
        m: &mut Module,
        label: u32,
        out: &mut Vec<Instruction>,
        blocks: &mut Vec<Block>,
        mut inst: Instruction,
        site: &Site,
        ok: u32,
    ) -> Result<u32, SpirvError> {
        let valid = m.alloc_id()?;
        let merge = m.alloc_id()?;
        self.merge_labels.insert(merge);
        stmt(out, op::SELECTION_MERGE, &[merge, 0]);
        stmt(out, op::BRANCH_CONDITIONAL, &[ok, valid, merge]);
        blocks.push(Block {
            label,
            instructions: std::mem::take(out),
        });

        let phi = match site.result {
            Some((ty, original)) => {
                let renamed = m.alloc_id()?;
                if let Some(id) = inst.result_id_mut() {
                    *id = renamed;
                }
                let null = m.constant_null(ty)?;
                Some(Instruction::new(
                    op::PHI,
                    vec![ty, original, renamed, valid, null, label],
                ))
            }
            None => None,
        };
        blocks.push(Block {
            label: valid,
            instructions: vec![inst, Instruction::new(op::BRANCH, vec![merge])],
        });
        out.extend(phi);
        Ok(merge)
    }

    /// Emits every check and returns the conjunction of their results.
    fn lower_checks(
        &mut self,
        m: &mut Module,
        out: &mut Vec<Instruction>,
        location: u32,
        ops: &[CheckOp],
    ) -> Result<Option<u32>, SpirvError> {
        let mut all: Option<u32> = None;
        for check in ops {
            let Some(ok) = self.lower_check(m, out, location, check)? else {
                continue;
            };
            all = Some(match all {
                Some(prev) => value(m, out, op::LOGICAL_AND, self.rt.bool_ty, &[prev, ok])?,
                None => ok,
            });
        }
        Ok(all)
    }

    fn lower_check(
        &mut self,
        m: &mut Module,
        out: &mut Vec<Instruction>,
        location: u32,
        check: &CheckOp,
    ) -> Result<Option<u32>, SpirvError> {
        let (uint, bool_ty) = (self.rt.uint, self.rt.bool_ty);
        let (ok, kind, payload) = match *check {
            CheckOp::DescriptorIndex {
                set,
                binding,
                index,
                count,
            } => {
                let index = self.normalize(m, out, index)?;
                let count_id = self.rt.const_u32(m, count)?;
                let ok = value(m, out, op::U_LESS_THAN, bool_ty, &[index, count_id])?;
                let set = self.rt.const_u32(m, set)?;
                let binding = self.rt.const_u32(m, binding)?;
                (
                    ok,
                    RecordKind::DescriptorIndexOob,
                    vec![set, binding, index, count_id],
                )
            }
            CheckOp::DescriptorWritten {
                set,
                binding,
                index,
                first_word,
                tracked,
            } => {
                let Some((element, in_tracked)) = self.tracked_element(m, out, index, tracked)?
                else {
                    return Ok(None);
                };
                let word = self.descriptor_word(m, out, (element, in_tracked), first_word, 0)?;
                let flag = self.rt.input_word(m, out, word)?;
                let zero = self.rt.const_u32(m, 0)?;
                let written = value(m, out, op::I_NOT_EQUAL, bool_ty, &[flag, zero])?;
                let ok = self.unless_untracked(m, out, in_tracked, written)?;
                let set = self.rt.const_u32(m, set)?;
                let binding = self.rt.const_u32(m, binding)?;
                (
                    ok,
                    RecordKind::DescriptorUninitialized,
                    vec![set, binding, element],
                )
            }
            CheckOp::ArrayIndex {
                set,
                binding,
                element,
                index,
                length,
            } => {
                let element = self.normalize(m, out, element)?;
                let index = self.normalize(m, out, index)?;
                let length_id = self.rt.const_u32(m, length)?;
                let ok = value(m, out, op::U_LESS_THAN, bool_ty, &[index, length_id])?;
                let set = self.rt.const_u32(m, set)?;
                let binding = self.rt.const_u32(m, binding)?;
                let mode = self.rt.const_u32(m, 1)?;
                (
                    ok,
                    RecordKind::BufferOob,
                    vec![set, binding, element, index, length_id, mode],
                )
            }
            CheckOp::BoundRange {
                set,
                binding,
                element,
                ref end,
                first_word,
                tracked,
            } => {
                let Some((element, in_tracked)) =
                    self.tracked_element(m, out, element, tracked)?
                else {
                    return Ok(None);
                };
                let (end, fits) = self.byte_end(m, out, end)?;
                let size_word =
                    self.descriptor_word(m, out, (element, in_tracked), first_word, 1)?;
                let size = self.rt.input_word(m, out, size_word)?;
                let within = value(m, out, op::U_LESS_THAN_EQUAL, bool_ty, &[end, size])?;
                let in_range = value(m, out, op::LOGICAL_AND, bool_ty, &[fits, within])?;
                let ok = self.unless_untracked(m, out, in_tracked, in_range)?;
                let set = self.rt.const_u32(m, set)?;
                let binding = self.rt.const_u32(m, binding)?;
                let mode = self.rt.const_u32(m, 0)?;
                (
                    ok,
                    RecordKind::BufferOob,
                    vec![set, binding, element, end, size, mode],
                )
            }
            CheckOp::PushConstantRange { ref end, range_end } => {
                let (end, fits) = self.byte_end(m, out, end)?;
                let limit = self.rt.const_u32(m, range_end)?;
                let within = value(m, out, op::U_LESS_THAN_EQUAL, bool_ty, &[end, limit])?;
                let ok = value(m, out, op::LOGICAL_AND, bool_ty, &[fits, within])?;
                (ok, RecordKind::PushConstantOob, vec![end, limit])
            }
            CheckOp::Address { pointer, size } => {
                let ulong = self.rt.u64_type(m)?;
                let address = value(m, out, op::CONVERT_PTR_TO_U, ulong, &[pointer])?;
                let size_id = self.rt.const_u32(m, size)?;
                let ok = self.rt.call_address_valid(m, out, address, size_id)?;
                let c32 = self.rt.const_u32(m, 32)?;
                let lo = value(m, out, op::U_CONVERT, uint, &[address])?;
                let high = value(m, out, op::SHIFT_RIGHT_LOGICAL, ulong, &[address, c32])?;
                let hi = value(m, out, op::U_CONVERT, uint, &[high])?;
                (ok, RecordKind::AddressOob, vec![lo, hi, size_id])
            }
            CheckOp::ImageBounds {
                set,
                binding,
                image,
                coord,
                components,
                coord_signed,
            } => {
                m.ensure_capability(op::capability::IMAGE_QUERY);
                let vec_ty = match components {
                    1 => uint,
                    n => m.type_vector(uint, n)?,
                };
                let coord = if coord_signed {
                    value(m, out, op::BITCAST, vec_ty, &[coord])?
                } else {
                    coord
                };
                let extent = value(m, out, op::IMAGE_QUERY_SIZE, vec_ty, &[image])?;
                let ok = match components {
                    1 => value(m, out, op::U_LESS_THAN, bool_ty, &[coord, extent])?,
                    n => {
                        let bvec = m.type_vector(bool_ty, n)?;
                        let lanes = value(m, out, op::U_LESS_THAN, bvec, &[coord, extent])?;
                        value(m, out, op::ALL, bool_ty, &[lanes])?
                    }
                };
                let zero = self.rt.const_u32(m, 0)?;
                let one = self.rt.const_u32(m, 1)?;
                let mut coords = [zero; 3];
                let mut extents = [one; 3];
                for k in 0..components.min(3) {
                    let (c, e) = if components == 1 {
                        (coord, extent)
                    } else {
                        (
                            value(m, out, op::COMPOSITE_EXTRACT, uint, &[coord, k])?,
                            value(m, out, op::COMPOSITE_EXTRACT, uint, &[extent, k])?,
                        )
                    };
                    coords[k as usize] = c;
                    extents[k as usize] = e;
                }
                let mut payload = vec![self.rt.const_u32(m, set)?, self.rt.const_u32(m, binding)?];
                payload.extend(coords);
                payload.extend(extents);
                (ok, RecordKind::ImageOob, payload)
            }
        };
        self.rt
            .call_check(m, out, ok, kind as u32, location, &payload)?;
        Ok(Some(ok))
    }

    /// Converts an index operand to a `u32` id. Negative and wide values that do not fit
    /// become large unsigned values so bounds checks fail.
    fn normalize(
        &mut self,
        m: &mut Module,
        out: &mut Vec<Instruction>,
        index: Index,
    ) -> Result<u32, SpirvError> {
        let uint = self.rt.uint;
        match index {
            Index::Const(c) => self.rt.const_u32(m, c),
            Index::Dynamic {
                id,
                width: 32,
                signed: false,
            } => Ok(id),
            Index::Dynamic {
                id,
                width: 32,
                signed: true,
            } => value(m, out, op::BITCAST, uint, &[id]),
            Index::Dynamic {
                id,
                width: 64,
                signed,
            } => {
                let ulong = self.rt.u64_type(m)?;
                let id = if signed {
                    value(m, out, op::BITCAST, ulong, &[id])?
                } else {
                    id
                };
                let max = m.constant_u64(ulong, u64::from(u32::MAX))?;
                let fits = value(m, out, op::U_LESS_THAN, self.rt.bool_ty, &[id, max])?;
                let narrow = value(m, out, op::U_CONVERT, uint, &[id])?;
                let saturated = self.rt.const_u32(m, u32::MAX)?;
                value(m, out, op::SELECT, uint, &[fits, narrow, saturated])
            }
            Index::Dynamic {
                id,
                signed: true,
                ..
            } => {
                let int = m.type_int(32, true)?;
                let wide = value(m, out, op::S_CONVERT, int, &[id])?;
                value(m, out, op::BITCAST, uint, &[wide])
            }
            Index::Dynamic { id, .. } => value(m, out, op::U_CONVERT, uint, &[id]),
        }
    }

    /// Returns the element index and, for dynamic indices, whether it has metadata in
    /// the input buffer. `None` when a constant index is past the tracked elements.
    fn tracked_element(
        &mut self,
        m: &mut Module,
        out: &mut Vec<Instruction>,
        index: Index,
        tracked: u32,
    ) -> Result<Option<(u32, Option<u32>)>, SpirvError> {
        if let Index::Const(c) = index {
            if c >= tracked {
                return Ok(None);
            }
            return Ok(Some((self.rt.const_u32(m, c)?, None)));
        }
        let element = self.normalize(m, out, index)?;
        let limit = self.rt.const_u32(m, tracked)?;
        let in_tracked = value(m, out, op::U_LESS_THAN, self.rt.bool_ty, &[element, limit])?;
        Ok(Some((element, Some(in_tracked))))
    }

    /// Input buffer word `first_word + element * 2 + field`, clamped to element 0 when the
    /// element is untracked.
    fn descriptor_word(
        &mut self,
        m: &mut Module,
        out: &mut Vec<Instruction>,
        (element, in_tracked): (u32, Option<u32>),
        first_word: u32,
        field: u32,
    ) -> Result<u32, SpirvError> {
        let uint = self.rt.uint;
        let element = match in_tracked {
            Some(in_tracked) => {
                let zero = self.rt.const_u32(m, 0)?;
                value(m, out, op::SELECT, uint, &[in_tracked, element, zero])?
            }
            None => element,
        };
        let two = self.rt.const_u32(m, crate::layout::WORDS_PER_DESCRIPTOR)?;
        let base = self.rt.const_u32(m, first_word + field)?;
        let scaled = value(m, out, op::I_MUL, uint, &[element, two])?;
        value(m, out, op::I_ADD, uint, &[scaled, base])
    }

    /// `!in_tracked || cond`; untracked elements are not checked.
    fn unless_untracked(
        &mut self,
        m: &mut Module,
        out: &mut Vec<Instruction>,
        in_tracked: Option<u32>,
        cond: u32,
    ) -> Result<u32, SpirvError> {
        match in_tracked {
            Some(in_tracked) => {
                let bool_ty = self.rt.bool_ty;
                let untracked = value(m, out, op::LOGICAL_NOT, bool_ty, &[in_tracked])?;
                value(m, out, op::LOGICAL_OR, bool_ty, &[untracked, cond])
            }
            None => Ok(cond),
        }
    }

    /// Computes a byte end offset in 32-bit arithmetic. Each dynamic term is limited so
    /// the sum cannot wrap; the returned `fits` is false (and the end saturated) when a
    /// term is over its limit.
    fn byte_end(
        &mut self,
        m: &mut Module,
        out: &mut Vec<Instruction>,
        end: &ByteOffset,
    ) -> Result<(u32, u32), SpirvError> {
        let (uint, bool_ty) = (self.rt.uint, self.rt.bool_ty);
        let share = u32::MAX / (end.terms.len() as u32 + 1);
        let constant = u32::try_from(end.constant).unwrap_or(u32::MAX).min(share);
        let mut sum = self.rt.const_u32(m, constant)?;
        let mut fits = m.constant_bool(u64::from(constant) == end.constant)?;
        for &(index, stride) in &end.terms {
            let stride = u32::try_from(stride).unwrap_or(u32::MAX).max(1);
            let index = self.normalize(m, out, index)?;
            let limit = self.rt.const_u32(m, share / stride)?;
            let ok = value(m, out, op::U_LESS_THAN_EQUAL, bool_ty, &[index, limit])?;
            fits = value(m, out, op::LOGICAL_AND, bool_ty, &[fits, ok])?;
            let stride = self.rt.const_u32(m, stride)?;
            let term = value(m, out, op::I_MUL, uint, &[index, stride])?;
            sum = value(m, out, op::I_ADD, uint, &[sum, term])?;
        }
        let saturated = self.rt.const_u32(m, u32::MAX)?;
        let end = value(m, out, op::SELECT, uint, &[fits, sum, saturated])?;
        Ok((end, fits))
    }

    fn lower_printf(
        &mut self,
        m: &mut Module,
        out: &mut Vec<Instruction>,
        site: &Site,
        call: &PrintfCall,
    ) -> Result<(), SpirvError> {
        let format_index = match self.printf_formats.iter().position(|f| *f == call.format) {
            Some(i) => i,
            None => {
                self.printf_formats.push(call.format.clone());
                self.printf_formats.len() - 1
            }
        };
        let mut words = Vec::new();
        for arg in &call.args {
            for k in 0..arg.components {
                let component = if arg.components > 1 {
                    value(m, out, op::COMPOSITE_EXTRACT, arg.scalar_ty, &[arg.id, k])?
                } else {
                    arg.id
                };
                self.printf_words(m, out, component, arg.scalar, &mut words)?;
            }
        }
        let total = words.len() as u32;
        words.truncate(PRINTF_MAX_ARG_WORDS);
        let mut payload = vec![
            self.rt.const_u32(m, format_index as u32)?,
            self.rt.const_u32(m, total)?,
        ];
        payload.extend(words);
        self.rt.call_printf(
            m,
            out,
            RecordKind::DebugPrintf as u32,
            site.location,
            &payload,
        )
    }

    fn printf_words(
        &mut self,
        m: &mut Module,
        out: &mut Vec<Instruction>,
        v: u32,
        scalar: Scalar,
        words: &mut Vec<u32>,
    ) -> Result<(), SpirvError> {
        let uint = self.rt.uint;
        match scalar {
            Scalar::Bool => {
                let one = self.rt.const_u32(m, 1)?;
                let zero = self.rt.const_u32(m, 0)?;
                words.push(value(m, out, op::SELECT, uint, &[v, one, zero])?);
            }
            Scalar::Int {
                width: 32,
                signed: false,
            } => words.push(v),
            Scalar::Int { width: 32, .. } | Scalar::Float { width: 32 } => {
                words.push(value(m, out, op::BITCAST, uint, &[v])?);
            }
            Scalar::Int { width: 64, .. } | Scalar::Float { width: 64 } => {
                let ulong = self.rt.u64_type(m)?;
                let bits = value(m, out, op::BITCAST, ulong, &[v])?;
                let c32 = self.rt.const_u32(m, 32)?;
                let high = value(m, out, op::SHIFT_RIGHT_LOGICAL, ulong, &[bits, c32])?;
                words.push(value(m, out, op::U_CONVERT, uint, &[bits])?);
                words.push(value(m, out, op::U_CONVERT, uint, &[high])?);
            }
            Scalar::Int { signed: true, .. } => {
                let int = m.type_int(32, true)?;
                let wide = value(m, out, op::S_CONVERT, int, &[v])?;
                words.push(value(m, out, op::BITCAST, uint, &[wide])?);
            }
            Scalar::Int { .. } => words.push(value(m, out, op::U_CONVERT, uint, &[v])?),
            Scalar::Float { .. } => {
                let float = m.type_float(32)?;
                let wide = value(m, out, op::F_CONVERT, float, &[v])?;
                words.push(value(m, out, op::BITCAST, uint, &[wide])?);
            }
            Scalar::Other => words.push(self.rt.const_u32(m, 0)?),
        }
        Ok(())
    }
}
