//! GPU-side support code added to instrumented modules.
//!
//! [`Runtime`] declares the reserved-set buffers and lazily generates three helper
//! functions:
//!
//! - `gpuav_check(ok, kind, location, p0..p7)`: reports the first failed check of an
//!   invocation
//! - `gpuav_printf(kind, location, p0..p8)`: writes a debug-printf record
//! - `gpuav_address_valid(addr, size) -> bool`: scans the input buffer's address table,
//!   accepting anything when the host had to truncate it
//!
//! Both writers reserve a slot with an atomic add on word 0 and only write when the slot is
//! below the capacity in word 1. The kind word is stored last.

use gpuav_spirv::{op, version, Block, Function, Instruction, Module, SpirvError};

use crate::layout::{
    INPUT_ADDRESS_COUNT_WORD, INPUT_ADDRESS_TABLE_WORD, INPUT_BINDING, INPUT_FLAGS_WORD,
    INPUT_FLAG_ADDRESSES_TRUNCATED, OUTPUT_BINDING, WORDS_PER_ADDRESS_RANGE,
};
use crate::protocol::{
    CAPACITY_WORD, CHECK_PAYLOAD_WORDS, COUNTER_WORD, HEADER_WORDS, PAYLOAD_WORDS, RECORD_WORDS,
};

/// Appends a value-producing instruction and returns its result id.
pub(crate) fn value(
    m: &mut Module,
    out: &mut Vec<Instruction>,
    opcode: u16,
    ty: u32,
    args: &[u32],
) -> Result<u32, SpirvError> {
    let id = m.alloc_id()?;
    let mut operands = Vec::with_capacity(args.len() + 2);
    operands.push(ty);
    operands.push(id);
    operands.extend_from_slice(args);
    out.push(Instruction::new(opcode, operands));
    Ok(id)
}

pub(crate) fn stmt(out: &mut Vec<Instruction>, opcode: u16, args: &[u32]) {
    out.push(Instruction::new(opcode, args.to_vec()));
}

/// Builds the blocks of a generated function.
struct FnBuilder {
    blocks: Vec<Block>,
    label: u32,
    out: Vec<Instruction>,
}

impl FnBuilder {
    fn new(label: u32) -> Self {
        Self {
            blocks: Vec::new(),
            label,
            out: Vec::new(),
        }
    }

    /// Closes the current block (its terminator must already be emitted) and opens `next`.
    fn next_block(&mut self, next: u32) {
        let instructions = std::mem::take(&mut self.out);
        self.blocks.push(Block {
            label: self.label,
            instructions,
        });
        self.label = next;
    }

    fn finish(mut self) -> Vec<Block> {
        let instructions = std::mem::take(&mut self.out);
        self.blocks.push(Block {
            label: self.label,
            instructions,
        });
        self.blocks
    }
}

#[derive(Debug)]
pub(crate) struct Runtime {
    pub shader_id: u32,
    pub execution_model: u32,
    pub void: u32,
    pub bool_ty: u32,
    pub uint: u32,
    ptr_sb_uint: u32,
    output: u32,
    input: u32,
    /// Entry point interfaces list every global (SPIR-V 1.4+).
    full_interface: bool,
    reported: Option<u32>,
    check_fn: Option<u32>,
    printf_fn: Option<u32>,
    address_fn: Option<u32>,
    functions: Vec<Function>,
}

impl Runtime {
    pub fn new(
        m: &mut Module,
        shader_id: u32,
        execution_model: u32,
        reserved_set: u32,
    ) -> Result<Self, SpirvError> {
        let void = m.type_void()?;
        let bool_ty = m.type_bool()?;
        let uint = m.type_uint(32)?;
        let ptr_sb_uint = m.type_pointer(op::storage_class::STORAGE_BUFFER, uint)?;
        let words = m.new_type_runtime_array(uint)?;
        m.decorate(words, op::decoration::ARRAY_STRIDE, &[4]);

        if m.header.version < version(1, 3) {
            m.ensure_extension("SPV_KHR_storage_buffer_storage_class");
        }
        let full_interface = m.header.version >= version(1, 4);

        let mut buffer = |binding: u32, name: &str, read_only: bool| -> Result<u32, SpirvError> {
            let block = m.new_type_struct(&[words])?;
            m.decorate(block, op::decoration::BLOCK, &[]);
            m.member_decorate(block, 0, op::decoration::OFFSET, &[0]);
            if read_only {
                m.member_decorate(block, 0, op::decoration::NON_WRITABLE, &[]);
            }
            let ptr = m.type_pointer(op::storage_class::STORAGE_BUFFER, block)?;
            let var = m.add_global_variable(ptr, op::storage_class::STORAGE_BUFFER, None)?;
            m.decorate(var, op::decoration::DESCRIPTOR_SET, &[reserved_set]);
            m.decorate(var, op::decoration::BINDING, &[binding]);
            m.set_name(var, name);
            if full_interface {
                m.add_to_entry_point_interfaces(var);
            }
            Ok(var)
        };
        let output = buffer(OUTPUT_BINDING, "gpuav_output", false)?;
        let input = buffer(INPUT_BINDING, "gpuav_input", true)?;

        Ok(Self {
            shader_id,
            execution_model,
            void,
            bool_ty,
            uint,
            ptr_sb_uint,
            output,
            input,
            full_interface,
            reported: None,
            check_fn: None,
            printf_fn: None,
            address_fn: None,
            functions: Vec::new(),
        })
    }

    /// Generated functions, to be appended after the module's own.
    pub fn take_functions(&mut self) -> Vec<Function> {
        std::mem::take(&mut self.functions)
    }

    pub fn const_u32(&self, m: &mut Module, v: u32) -> Result<u32, SpirvError> {
        m.constant_u32(self.uint, v)
    }

    pub fn u64_type(&self, m: &mut Module) -> Result<u32, SpirvError> {
        m.ensure_capability(op::capability::INT64);
        m.type_uint(64)
    }

    /// Loads word `index` (an id) of the input buffer.
    pub fn input_word(
        &self,
        m: &mut Module,
        out: &mut Vec<Instruction>,
        index: u32,
    ) -> Result<u32, SpirvError> {
        let zero = self.const_u32(m, 0)?;
        let ptr = value(m, out, op::ACCESS_CHAIN, self.ptr_sb_uint, &[self.input, zero, index])?;
        value(m, out, op::LOAD, self.uint, &[ptr])
    }

    fn output_ptr(
        &self,
        m: &mut Module,
        out: &mut Vec<Instruction>,
        index: u32,
    ) -> Result<u32, SpirvError> {
        let zero = self.const_u32(m, 0)?;
        value(m, out, op::ACCESS_CHAIN, self.ptr_sb_uint, &[self.output, zero, index])
    }

    /// Emits `gpuav_check(ok, kind, location, payload...)`.
    pub fn call_check(
        &mut self,
        m: &mut Module,
        out: &mut Vec<Instruction>,
        ok: u32,
        kind: u32,
        location: u32,
        payload: &[u32],
    ) -> Result<(), SpirvError> {
        let func = match self.check_fn {
            Some(f) => f,
            None => {
                let f = self.build_writer(m, true, CHECK_PAYLOAD_WORDS)?;
                self.check_fn = Some(f);
                f
            }
        };
        let mut args = vec![ok, self.const_u32(m, kind)?, self.const_u32(m, location)?];
        self.pad_payload(m, &mut args, payload, CHECK_PAYLOAD_WORDS)?;
        let mut call = vec![func];
        call.extend(args);
        value(m, out, op::FUNCTION_CALL, self.void, &call)?;
        Ok(())
    }

    /// Emits `gpuav_printf(kind, location, payload...)`.
    pub fn call_printf(
        &mut self,
        m: &mut Module,
        out: &mut Vec<Instruction>,
        kind: u32,
        location: u32,
        payload: &[u32],
    ) -> Result<(), SpirvError> {
        let func = match self.printf_fn {
            Some(f) => f,
            None => {
                let f = self.build_writer(m, false, PAYLOAD_WORDS)?;
                self.printf_fn = Some(f);
                f
            }
        };
        let mut args = vec![self.const_u32(m, kind)?, self.const_u32(m, location)?];
        self.pad_payload(m, &mut args, payload, PAYLOAD_WORDS)?;
        let mut call = vec![func];
        call.extend(args);
        value(m, out, op::FUNCTION_CALL, self.void, &call)?;
        Ok(())
    }

    /// Emits `gpuav_address_valid(addr, size)` and returns the bool result.
    pub fn call_address_valid(
        &mut self,
        m: &mut Module,
        out: &mut Vec<Instruction>,
        address: u32,
        size: u32,
    ) -> Result<u32, SpirvError> {
        let func = match self.address_fn {
            Some(f) => f,
            None => {
                let f = self.build_address_check(m)?;
                self.address_fn = Some(f);
                f
            }
        };
        value(m, out, op::FUNCTION_CALL, self.bool_ty, &[func, address, size])
    }

    fn pad_payload(
        &self,
        m: &mut Module,
        args: &mut Vec<u32>,
        payload: &[u32],
        words: usize,
    ) -> Result<(), SpirvError> {
        let zero = self.const_u32(m, 0)?;
        args.extend(payload.iter().copied().take(words));
        args.resize(args.len() + words.saturating_sub(payload.len()), zero);
        Ok(())
    }

    fn reported_flag(&mut self, m: &mut Module) -> Result<u32, SpirvError> {
        if let Some(var) = self.reported {
            return Ok(var);
        }
        let ptr = m.type_pointer(op::storage_class::PRIVATE, self.bool_ty)?;
        let init = m.constant_bool(false)?;
        let var = m.add_global_variable(ptr, op::storage_class::PRIVATE, Some(init))?;
        m.set_name(var, "gpuav_reported");
        if self.full_interface {
            m.add_to_entry_point_interfaces(var);
        }
        self.reported = Some(var);
        Ok(var)
    }

    fn build_writer(
        &mut self,
        m: &mut Module,
        first_violation: bool,
        payload_words: usize,
    ) -> Result<u32, SpirvError> {
        let mut param_types = Vec::new();
        if first_violation {
            param_types.push(self.bool_ty);
        }
        param_types.extend(std::iter::repeat(self.uint).take(2 + payload_words));
        let fn_ty = m.type_function(self.void, &param_types)?;
        let id = m.alloc_id()?;
        m.set_name(
            id,
            if first_violation {
                "gpuav_check"
            } else {
                "gpuav_printf"
            },
        );
        let mut params = Vec::with_capacity(param_types.len());
        let mut param_ids = Vec::with_capacity(param_types.len());
        for ty in param_types {
            let p = m.alloc_id()?;
            params.push(Instruction::new(op::FUNCTION_PARAMETER, vec![ty, p]));
            param_ids.push(p);
        }
        let (ok, rest) = if first_violation {
            (param_ids.first().copied(), &param_ids[1..])
        } else {
            (None, &param_ids[..])
        };
        let (kind, location, payload) = (rest[0], rest[1], &rest[2..]);

        let c0 = self.const_u32(m, 0)?;
        let c1 = self.const_u32(m, 1)?;
        let device = self.const_u32(m, op::scope::DEVICE)?;
        let relaxed = c0;

        let entry = m.alloc_id()?;
        let write = m.alloc_id()?;
        let done = m.alloc_id()?;
        let mut f = FnBuilder::new(entry);

        let claimed = match (first_violation, ok) {
            (true, Some(ok)) => {
                let reported = self.reported_flag(m)?;
                let claim = m.alloc_id()?;
                let claim_done = m.alloc_id()?;
                let was = value(m, &mut f.out, op::LOAD, self.bool_ty, &[reported])?;
                let failed = value(m, &mut f.out, op::LOGICAL_NOT, self.bool_ty, &[ok])?;
                let fresh = value(m, &mut f.out, op::LOGICAL_NOT, self.bool_ty, &[was])?;
                let go = value(m, &mut f.out, op::LOGICAL_AND, self.bool_ty, &[failed, fresh])?;
                stmt(&mut f.out, op::SELECTION_MERGE, &[done, 0]);
                stmt(&mut f.out, op::BRANCH_CONDITIONAL, &[go, claim, done]);
                f.next_block(claim);
                let yes = m.constant_bool(true)?;
                stmt(&mut f.out, op::STORE, &[reported, yes]);
                Some(claim_done)
            }
            _ => None,
        };

        let counter_index = self.const_u32(m, COUNTER_WORD as u32)?;
        let counter = self.output_ptr(m, &mut f.out, counter_index)?;
        let slot = value(
            m,
            &mut f.out,
            op::ATOMIC_I_ADD,
            self.uint,
            &[counter, device, relaxed, c1],
        )?;
        let capacity_index = self.const_u32(m, CAPACITY_WORD as u32)?;
        let capacity_ptr = self.output_ptr(m, &mut f.out, capacity_index)?;
        let capacity = value(m, &mut f.out, op::LOAD, self.uint, &[capacity_ptr])?;
        let has_room = value(m, &mut f.out, op::U_LESS_THAN, self.bool_ty, &[slot, capacity])?;
        let after_write = claimed.unwrap_or(done);
        stmt(&mut f.out, op::SELECTION_MERGE, &[after_write, 0]);
        stmt(&mut f.out, op::BRANCH_CONDITIONAL, &[has_room, write, after_write]);

        f.next_block(write);
        let record_words = self.const_u32(m, RECORD_WORDS as u32)?;
        let header_words = self.const_u32(m, HEADER_WORDS as u32)?;
        let scaled = value(m, &mut f.out, op::I_MUL, self.uint, &[slot, record_words])?;
        let base = value(m, &mut f.out, op::I_ADD, self.uint, &[scaled, header_words])?;
        let stage = self.stage_words(m, &mut f.out)?;
        let mut words = vec![
            kind,
            self.const_u32(m, self.shader_id)?,
            location,
            self.const_u32(m, self.execution_model)?,
        ];
        words.extend_from_slice(&stage);
        words.extend_from_slice(payload);
        // Kind goes last so a reader never sees a tagged, half-written slot.
        for (i, &w) in words.iter().enumerate().skip(1) {
            let offset = self.const_u32(m, i as u32)?;
            let index = value(m, &mut f.out, op::I_ADD, self.uint, &[base, offset])?;
            let ptr = self.output_ptr(m, &mut f.out, index)?;
            stmt(&mut f.out, op::STORE, &[ptr, w]);
        }
        let ptr = self.output_ptr(m, &mut f.out, base)?;
        stmt(&mut f.out, op::STORE, &[ptr, words[0]]);
        stmt(&mut f.out, op::BRANCH, &[after_write]);

        if let Some(claim_done) = claimed {
            f.next_block(claim_done);
            stmt(&mut f.out, op::BRANCH, &[done]);
        }
        f.next_block(done);
        stmt(&mut f.out, op::RETURN, &[]);

        self.functions.push(Function {
            def: Instruction::new(op::FUNCTION, vec![self.void, id, 0, fn_ty]),
            params,
            blocks: f.finish(),
        });
        Ok(id)
    }

    fn build_address_check(&mut self, m: &mut Module) -> Result<u32, SpirvError> {
        let ulong = self.u64_type(m)?;
        let fn_ty = m.type_function(self.bool_ty, &[ulong, self.uint])?;
        let id = m.alloc_id()?;
        m.set_name(id, "gpuav_address_valid");
        let addr = m.alloc_id()?;
        let size = m.alloc_id()?;
        let params = vec![
            Instruction::new(op::FUNCTION_PARAMETER, vec![ulong, addr]),
            Instruction::new(op::FUNCTION_PARAMETER, vec![self.uint, size]),
        ];

        let c0 = self.const_u32(m, 0)?;
        let c1 = self.const_u32(m, 1)?;
        let c32 = self.const_u32(m, 32)?;
        let stride = self.const_u32(m, WORDS_PER_ADDRESS_RANGE)?;
        let no = m.constant_bool(false)?;

        let [entry, header, cond, body, cont, merge] = [
            m.alloc_id()?,
            m.alloc_id()?,
            m.alloc_id()?,
            m.alloc_id()?,
            m.alloc_id()?,
            m.alloc_id()?,
        ];
        let (i, found, in_range, next) = (m.alloc_id()?, m.alloc_id()?, m.alloc_id()?, m.alloc_id()?);
        let mut f = FnBuilder::new(entry);

        let size64 = value(m, &mut f.out, op::U_CONVERT, ulong, &[size])?;
        let end = value(m, &mut f.out, op::I_ADD, ulong, &[addr, size64])?;
        let table_word = self.const_u32(m, INPUT_ADDRESS_TABLE_WORD as u32)?;
        let table = self.input_word(m, &mut f.out, table_word)?;
        let count_word = self.const_u32(m, INPUT_ADDRESS_COUNT_WORD as u32)?;
        let count = self.input_word(m, &mut f.out, count_word)?;
        let flags_word = self.const_u32(m, INPUT_FLAGS_WORD as u32)?;
        let flags = self.input_word(m, &mut f.out, flags_word)?;
        let truncated_bit = self.const_u32(m, INPUT_FLAG_ADDRESSES_TRUNCATED)?;
        let masked = value(m, &mut f.out, op::BITWISE_AND, self.uint, &[flags, truncated_bit])?;
        let truncated = value(m, &mut f.out, op::I_NOT_EQUAL, self.bool_ty, &[masked, c0])?;
        stmt(&mut f.out, op::BRANCH, &[header]);

        f.next_block(header);
        stmt(&mut f.out, op::PHI, &[self.uint, i, c0, entry, next, cont]);
        stmt(&mut f.out, op::PHI, &[self.bool_ty, found, no, entry, in_range, cont]);
        stmt(&mut f.out, op::LOOP_MERGE, &[merge, cont, 0]);
        stmt(&mut f.out, op::BRANCH, &[cond]);

        f.next_block(cond);
        let more = value(m, &mut f.out, op::U_LESS_THAN, self.bool_ty, &[i, count])?;
        let searching = value(m, &mut f.out, op::LOGICAL_NOT, self.bool_ty, &[found])?;
        let go = value(m, &mut f.out, op::LOGICAL_AND, self.bool_ty, &[more, searching])?;
        stmt(&mut f.out, op::BRANCH_CONDITIONAL, &[go, body, merge]);

        f.next_block(body);
        let scaled = value(m, &mut f.out, op::I_MUL, self.uint, &[i, stride])?;
        let first = value(m, &mut f.out, op::I_ADD, self.uint, &[table, scaled])?;
        let mut range = [0u32; 4];
        for (k, slot) in range.iter_mut().enumerate() {
            let offset = self.const_u32(m, k as u32)?;
            let w = value(m, &mut f.out, op::I_ADD, self.uint, &[first, offset])?;
            *slot = self.input_word(m, &mut f.out, w)?;
        }
        let join = |m: &mut Module,
                    out: &mut Vec<Instruction>,
                    lo: u32,
                    hi: u32|
         -> Result<u32, SpirvError> {
            let lo = value(m, out, op::U_CONVERT, ulong, &[lo])?;
            let hi = value(m, out, op::U_CONVERT, ulong, &[hi])?;
            let hi = value(m, out, op::SHIFT_LEFT_LOGICAL, ulong, &[hi, c32])?;
            value(m, out, op::BITWISE_OR, ulong, &[lo, hi])
        };
        let range_base = join(m, &mut f.out, range[0], range[1])?;
        let range_size = join(m, &mut f.out, range[2], range[3])?;
        let range_end = value(m, &mut f.out, op::I_ADD, ulong, &[range_base, range_size])?;
        let above = value(
            m,
            &mut f.out,
            op::U_GREATER_THAN_EQUAL,
            self.bool_ty,
            &[addr, range_base],
        )?;
        let below = value(
            m,
            &mut f.out,
            op::U_LESS_THAN_EQUAL,
            self.bool_ty,
            &[end, range_end],
        )?;
        f.out.push(Instruction::new(
            op::LOGICAL_AND,
            vec![self.bool_ty, in_range, above, below],
        ));
        stmt(&mut f.out, op::BRANCH, &[cont]);

        f.next_block(cont);
        f.out.push(Instruction::new(op::I_ADD, vec![self.uint, next, i, c1]));
        stmt(&mut f.out, op::BRANCH, &[header]);

        f.next_block(merge);
        let valid = value(m, &mut f.out, op::LOGICAL_OR, self.bool_ty, &[found, truncated])?;
        stmt(&mut f.out, op::RETURN_VALUE, &[valid]);

        self.functions.push(Function {
            def: Instruction::new(op::FUNCTION, vec![self.bool_ty, id, 0, fn_ty]),
            params,
            blocks: f.finish(),
        });
        Ok(id)
    }

    /// Per-invocation identification for the record header.
    fn stage_words(
        &self,
        m: &mut Module,
        out: &mut Vec<Instruction>,
    ) -> Result<[u32; 3], SpirvError> {
        use op::{builtin, execution_model as model};

        let zero = self.const_u32(m, 0)?;
        let mut words = [zero; 3];
        match self.execution_model {
            model::GL_COMPUTE => {
                let uvec3 = m.type_vector(self.uint, 3)?;
                let gid = self.load_builtin(m, out, builtin::GLOBAL_INVOCATION_ID, uvec3)?;
                for (k, w) in gid.into_iter().take(3).enumerate() {
                    words[k] = w;
                }
            }
            model::VERTEX => {
                let vertex = self.load_builtin(m, out, builtin::VERTEX_INDEX, self.uint)?;
                let instance = self.load_builtin(m, out, builtin::INSTANCE_INDEX, self.uint)?;
                words[0] = vertex.first().copied().unwrap_or(zero);
                words[1] = instance.first().copied().unwrap_or(zero);
            }
            model::FRAGMENT => {
                let float = m.type_float(32)?;
                let vec4 = m.type_vector(float, 4)?;
                let coord = self.load_builtin(m, out, builtin::FRAG_COORD, vec4)?;
                for (k, w) in coord.into_iter().take(2).enumerate() {
                    words[k] = w;
                }
            }
            _ => {}
        }
        Ok(words)
    }

    /// Loads a built-in input, declaring it when the module has none, and returns its
    /// components converted to `u32`.
    fn load_builtin(
        &self,
        m: &mut Module,
        out: &mut Vec<Instruction>,
        builtin: u32,
        default_ty: u32,
    ) -> Result<Vec<u32>, SpirvError> {
        let existing = m.annotations.iter().find_map(|inst| {
            (inst.opcode == op::DECORATE
                && inst.operand(1) == Some(op::decoration::BUILT_IN)
                && inst.operand(2) == Some(builtin))
            .then(|| inst.operand(0))
            .flatten()
        });
        let found = existing.and_then(|var| {
            let def = m
                .types_values
                .iter()
                .find(|i| i.opcode == op::VARIABLE && i.operand(1) == Some(var))?;
            let ptr = m.type_def(def.operand(0)?)?;
            (ptr.opcode == op::TYPE_POINTER && ptr.operand(1) == Some(op::storage_class::INPUT))
                .then(|| ptr.operand(2).map(|ty| (var, ty)))
                .flatten()
        });
        let (var, ty) = match found {
            Some(pair) => pair,
            None => {
                let ptr = m.type_pointer(op::storage_class::INPUT, default_ty)?;
                let var = m.add_global_variable(ptr, op::storage_class::INPUT, None)?;
                m.decorate(var, op::decoration::BUILT_IN, &[builtin]);
                (var, default_ty)
            }
        };
        m.add_to_entry_point_interfaces(var);
        let loaded = value(m, out, op::LOAD, ty, &[var])?;
        self.to_uint_words(m, out, loaded, ty)
    }

    /// Components of a scalar or vector value as `u32` words.
    fn to_uint_words(
        &self,
        m: &mut Module,
        out: &mut Vec<Instruction>,
        v: u32,
        ty: u32,
    ) -> Result<Vec<u32>, SpirvError> {
        let Some(def) = m.type_def(ty).cloned() else {
            return Ok(Vec::new());
        };
        match def.opcode {
            op::TYPE_VECTOR => {
                let (Some(component), Some(n)) = (def.operand(1), def.operand(2)) else {
                    return Ok(Vec::new());
                };
                let mut words = Vec::with_capacity(n as usize);
                for k in 0..n {
                    let c = value(m, out, op::COMPOSITE_EXTRACT, component, &[v, k])?;
                    words.extend(self.to_uint_words(m, out, c, component)?);
                }
                Ok(words)
            }
            op::TYPE_INT if def.operand(1) == Some(32) => Ok(vec![if def.operand(2) == Some(1) {
                value(m, out, op::BITCAST, self.uint, &[v])?
            } else {
                v
            }]),
            op::TYPE_FLOAT => Ok(vec![value(m, out, op::CONVERT_F_TO_U, self.uint, &[v])?]),
            _ => Ok(Vec::new()),
        }
    }
}
