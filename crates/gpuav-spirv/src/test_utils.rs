//! A tiny section-aware assembler plus a handful of fixture shaders.
//!
//! The fixtures are hand-assembled equivalents of short GLSL compute/vertex shaders. Each
//! one exercises a single class of checked operation so instrumentation tests can assert
//! on exactly what was guarded.

use crate::instruction::{encode_literal_string, Instruction};
use crate::module::{version, Module, MAGIC};
use crate::op::{self, builtin, capability, decoration, execution_model, storage_class};

/// Assembles a module one instruction at a time. Instructions are routed to their
/// logical section, so declarations may be emitted in any order.
#[derive(Debug)]
pub struct Asm {
    version: u32,
    next_id: u32,
    capabilities: Vec<Instruction>,
    extensions: Vec<Instruction>,
    imports: Vec<Instruction>,
    memory_model: Instruction,
    entry_points: Vec<Instruction>,
    execution_modes: Vec<Instruction>,
    debug_source: Vec<Instruction>,
    names: Vec<Instruction>,
    annotations: Vec<Instruction>,
    globals: Vec<Instruction>,
    body: Vec<Instruction>,
}

impl Asm {
    /// Logical addressing, GLSL450 memory model, `Shader` capability.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            next_id: 1,
            capabilities: vec![Instruction::new(op::CAPABILITY, vec![capability::SHADER])],
            extensions: Vec::new(),
            imports: Vec::new(),
            memory_model: Instruction::new(
                op::MEMORY_MODEL,
                vec![op::addressing_model::LOGICAL, op::memory_model::GLSL450],
            ),
            entry_points: Vec::new(),
            execution_modes: Vec::new(),
            debug_source: Vec::new(),
            names: Vec::new(),
            annotations: Vec::new(),
            globals: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn capability(&mut self, cap: u32) {
        self.capabilities
            .push(Instruction::new(op::CAPABILITY, vec![cap]));
    }

    pub fn extension(&mut self, name: &str) {
        self.extensions
            .push(Instruction::new(op::EXTENSION, encode_literal_string(name)));
    }

    pub fn ext_inst_import(&mut self, name: &str) -> u32 {
        let id = self.id();
        let mut operands = vec![id];
        operands.extend(encode_literal_string(name));
        self.imports
            .push(Instruction::new(op::EXT_INST_IMPORT, operands));
        id
    }

    pub fn memory_model(&mut self, addressing: u32, memory: u32) {
        self.memory_model = Instruction::new(op::MEMORY_MODEL, vec![addressing, memory]);
    }

    pub fn entry_point(&mut self, model: u32, function: u32, name: &str, interface: &[u32]) {
        let mut operands = vec![model, function];
        operands.extend(encode_literal_string(name));
        operands.extend_from_slice(interface);
        self.entry_points
            .push(Instruction::new(op::ENTRY_POINT, operands));
    }

    pub fn execution_mode(&mut self, function: u32, mode: u32, args: &[u32]) {
        let mut operands = vec![function, mode];
        operands.extend_from_slice(args);
        self.execution_modes
            .push(Instruction::new(op::EXECUTION_MODE, operands));
    }

    pub fn string(&mut self, s: &str) -> u32 {
        let id = self.id();
        let mut operands = vec![id];
        operands.extend(encode_literal_string(s));
        self.debug_source
            .push(Instruction::new(op::STRING, operands));
        id
    }

    pub fn name(&mut self, id: u32, s: &str) {
        let mut operands = vec![id];
        operands.extend(encode_literal_string(s));
        self.names.push(Instruction::new(op::NAME, operands));
    }

    pub fn decorate(&mut self, id: u32, dec: u32, args: &[u32]) {
        let mut operands = vec![id, dec];
        operands.extend_from_slice(args);
        self.annotations
            .push(Instruction::new(op::DECORATE, operands));
    }

    pub fn member_decorate(&mut self, id: u32, member: u32, dec: u32, args: &[u32]) {
        let mut operands = vec![id, member, dec];
        operands.extend_from_slice(args);
        self.annotations
            .push(Instruction::new(op::MEMBER_DECORATE, operands));
    }

    /// Declares a type; `args` are the operands after the result id.
    pub fn ty(&mut self, opcode: u16, args: &[u32]) -> u32 {
        let id = self.id();
        let mut operands = vec![id];
        operands.extend_from_slice(args);
        self.globals.push(Instruction::new(opcode, operands));
        id
    }

    /// Declares an `OpConstant` with the given literal words.
    pub fn constant(&mut self, ty: u32, words: &[u32]) -> u32 {
        let id = self.id();
        let mut operands = vec![ty, id];
        operands.extend_from_slice(words);
        self.globals.push(Instruction::new(op::CONSTANT, operands));
        id
    }

    pub fn global_variable(&mut self, pointer_type: u32, storage: u32) -> u32 {
        let id = self.id();
        self.globals
            .push(Instruction::new(op::VARIABLE, vec![pointer_type, id, storage]));
        id
    }

    /// Starts a function whose id was reserved earlier (entry points need it up front).
    pub fn begin_function(&mut self, id: u32, return_type: u32, function_type: u32) {
        self.body.push(Instruction::new(
            op::FUNCTION,
            vec![return_type, id, 0, function_type],
        ));
    }

    pub fn begin_block(&mut self, label: u32) {
        self.body.push(Instruction::new(op::LABEL, vec![label]));
    }

    /// Emits an instruction with no result.
    pub fn emit(&mut self, opcode: u16, operands: &[u32]) {
        self.body.push(Instruction::new(opcode, operands.to_vec()));
    }

    /// Emits an instruction with a result type and a fresh result id.
    pub fn op(&mut self, opcode: u16, result_type: u32, args: &[u32]) -> u32 {
        let id = self.id();
        let mut operands = vec![result_type, id];
        operands.extend_from_slice(args);
        self.body.push(Instruction::new(opcode, operands));
        id
    }

    pub fn end_function(&mut self) {
        self.body.push(Instruction::new(op::FUNCTION_END, Vec::new()));
    }

    pub fn assemble(self) -> Vec<u32> {
        let mut out = vec![MAGIC, self.version, 0, self.next_id, 0];
        let sections = self
            .capabilities
            .iter()
            .chain(&self.extensions)
            .chain(&self.imports)
            .chain(std::iter::once(&self.memory_model))
            .chain(&self.entry_points)
            .chain(&self.execution_modes)
            .chain(&self.debug_source)
            .chain(&self.names)
            .chain(&self.annotations)
            .chain(&self.globals)
            .chain(&self.body);
        for inst in sections {
            inst.encode_into(&mut out)
                .expect("fixture instruction exceeds the word count limit");
        }
        out
    }

    pub fn into_module(self) -> Module {
        Module::parse(&self.assemble()).expect("assembled fixture should parse")
    }
}

/// Ids shared by every compute fixture.
struct Compute {
    main: u32,
    void: u32,
    main_type: u32,
    uint: u32,
    boolean: u32,
    uvec3: u32,
    gid: u32,
    ptr_uint_in: u32,
}

fn compute_prologue(a: &mut Asm, extra_interface: &[u32]) -> Compute {
    let main = a.id();
    let void = a.ty(op::TYPE_VOID, &[]);
    let main_type = a.ty(op::TYPE_FUNCTION, &[void]);
    let uint = a.ty(op::TYPE_INT, &[32, 0]);
    let boolean = a.ty(op::TYPE_BOOL, &[]);
    let uvec3 = a.ty(op::TYPE_VECTOR, &[uint, 3]);
    let ptr_uvec3_in = a.ty(op::TYPE_POINTER, &[storage_class::INPUT, uvec3]);
    let ptr_uint_in = a.ty(op::TYPE_POINTER, &[storage_class::INPUT, uint]);
    let gid = a.global_variable(ptr_uvec3_in, storage_class::INPUT);
    a.decorate(gid, decoration::BUILT_IN, &[builtin::GLOBAL_INVOCATION_ID]);
    a.name(main, "main");
    a.name(gid, "gl_GlobalInvocationID");

    let mut interface = vec![gid];
    interface.extend_from_slice(extra_interface);
    a.entry_point(execution_model::GL_COMPUTE, main, "main", &interface);
    a.execution_mode(main, op::execution_mode::LOCAL_SIZE, &[64, 1, 1]);
    Compute {
        main,
        void,
        main_type,
        uint,
        boolean,
        uvec3,
        gid,
        ptr_uint_in,
    }
}

/// `gl_GlobalInvocationID.x`, emitted in the current block.
fn load_gid_x(a: &mut Asm, c: &Compute, zero: u32) -> u32 {
    let ptr = a.op(op::ACCESS_CHAIN, c.ptr_uint_in, &[c.gid, zero]);
    a.op(op::LOAD, c.uint, &[ptr])
}

/// `buffer Data { uint data[]; }` at `set = 0, binding = 0`. Returns `(variable, ptr to uint)`.
fn runtime_array_ssbo(a: &mut Asm, uint: u32) -> (u32, u32) {
    let rt = a.ty(op::TYPE_RUNTIME_ARRAY, &[uint]);
    a.decorate(rt, decoration::ARRAY_STRIDE, &[4]);
    let block = a.ty(op::TYPE_STRUCT, &[rt]);
    a.decorate(block, decoration::BLOCK, &[]);
    a.member_decorate(block, 0, decoration::OFFSET, &[0]);
    let ptr_block = a.ty(op::TYPE_POINTER, &[storage_class::STORAGE_BUFFER, block]);
    let ptr_uint = a.ty(op::TYPE_POINTER, &[storage_class::STORAGE_BUFFER, uint]);
    let var = a.global_variable(ptr_block, storage_class::STORAGE_BUFFER);
    a.decorate(var, decoration::DESCRIPTOR_SET, &[0]);
    a.decorate(var, decoration::BINDING, &[0]);
    a.name(var, "data");
    (var, ptr_uint)
}

/// A compute shader with no resources at all.
///
/// ```glsl
/// void main() {}
/// ```
pub fn trivial_compute() -> Vec<u32> {
    let mut a = Asm::new(version(1, 3));
    let c = compute_prologue(&mut a, &[]);
    a.begin_function(c.main, c.void, c.main_type);
    let entry = a.id();
    a.begin_block(entry);
    a.emit(op::RETURN, &[]);
    a.end_function();
    a.assemble()
}

/// A loop that walks a runtime-sized storage buffer array.
///
/// ```glsl
/// layout(set = 0, binding = 0) buffer Data { uint data[]; };
/// void main() {
///     uint g = gl_GlobalInvocationID.x;
///     for (uint i = 0; i < ITERATIONS; i++) { data[i] += g; }
/// }
/// ```
///
/// Bound with `ITERATIONS - 1` elements, every invocation goes out of bounds exactly once,
/// on the last iteration.
pub fn ssbo_runtime_array_loop(iterations: u32) -> Vec<u32> {
    let mut a = Asm::new(version(1, 3));
    let c = compute_prologue(&mut a, &[]);
    let (data, ptr_uint_sb) = runtime_array_ssbo(&mut a, c.uint);
    let ptr_uint_fn = a.ty(op::TYPE_POINTER, &[storage_class::FUNCTION, c.uint]);
    let zero = a.constant(c.uint, &[0]);
    let one = a.constant(c.uint, &[1]);
    let limit = a.constant(c.uint, &[iterations]);

    let (entry, header, cond, body, cont, merge) = (a.id(), a.id(), a.id(), a.id(), a.id(), a.id());
    a.begin_function(c.main, c.void, c.main_type);
    a.begin_block(entry);
    let i = a.op(op::VARIABLE, ptr_uint_fn, &[storage_class::FUNCTION]);
    a.name(i, "i");
    let g = load_gid_x(&mut a, &c, zero);
    a.emit(op::STORE, &[i, zero]);
    a.emit(op::BRANCH, &[header]);

    a.begin_block(header);
    a.emit(op::LOOP_MERGE, &[merge, cont, 0]);
    a.emit(op::BRANCH, &[cond]);

    a.begin_block(cond);
    let iv = a.op(op::LOAD, c.uint, &[i]);
    let in_range = a.op(op::U_LESS_THAN, c.boolean, &[iv, limit]);
    a.emit(op::BRANCH_CONDITIONAL, &[in_range, body, merge]);

    a.begin_block(body);
    let elem = a.op(op::ACCESS_CHAIN, ptr_uint_sb, &[data, zero, iv]);
    let old = a.op(op::LOAD, c.uint, &[elem]);
    let new = a.op(op::I_ADD, c.uint, &[old, g]);
    a.emit(op::STORE, &[elem, new]);
    a.emit(op::BRANCH, &[cont]);

    a.begin_block(cont);
    let next = a.op(op::I_ADD, c.uint, &[iv, one]);
    a.emit(op::STORE, &[i, next]);
    a.emit(op::BRANCH, &[header]);

    a.begin_block(merge);
    a.emit(op::RETURN, &[]);
    a.end_function();
    a.assemble()
}

/// Dynamic index into a fixed-size array of storage buffer descriptors.
///
/// ```glsl
/// layout(set = 0, binding = 0) buffer B { uint v; } bufs[4];
/// layout(push_constant) uniform PC { uint idx; };
/// void main() { bufs[idx].v = 1; }
/// ```
pub fn descriptor_array_dynamic_index() -> Vec<u32> {
    let mut a = Asm::new(version(1, 3));
    let c = compute_prologue(&mut a, &[]);
    let zero = a.constant(c.uint, &[0]);
    let one = a.constant(c.uint, &[1]);
    let four = a.constant(c.uint, &[4]);

    let b = a.ty(op::TYPE_STRUCT, &[c.uint]);
    a.decorate(b, decoration::BLOCK, &[]);
    a.member_decorate(b, 0, decoration::OFFSET, &[0]);
    let arr = a.ty(op::TYPE_ARRAY, &[b, four]);
    let ptr_arr = a.ty(op::TYPE_POINTER, &[storage_class::STORAGE_BUFFER, arr]);
    let ptr_uint_sb = a.ty(op::TYPE_POINTER, &[storage_class::STORAGE_BUFFER, c.uint]);
    let bufs = a.global_variable(ptr_arr, storage_class::STORAGE_BUFFER);
    a.decorate(bufs, decoration::DESCRIPTOR_SET, &[0]);
    a.decorate(bufs, decoration::BINDING, &[0]);
    a.name(bufs, "bufs");

    let pc_block = a.ty(op::TYPE_STRUCT, &[c.uint]);
    a.decorate(pc_block, decoration::BLOCK, &[]);
    a.member_decorate(pc_block, 0, decoration::OFFSET, &[0]);
    let ptr_pc = a.ty(op::TYPE_POINTER, &[storage_class::PUSH_CONSTANT, pc_block]);
    let ptr_pc_uint = a.ty(op::TYPE_POINTER, &[storage_class::PUSH_CONSTANT, c.uint]);
    let pc = a.global_variable(ptr_pc, storage_class::PUSH_CONSTANT);

    a.begin_function(c.main, c.void, c.main_type);
    let entry = a.id();
    a.begin_block(entry);
    let idx_ptr = a.op(op::ACCESS_CHAIN, ptr_pc_uint, &[pc, zero]);
    let idx = a.op(op::LOAD, c.uint, &[idx_ptr]);
    let dst = a.op(op::ACCESS_CHAIN, ptr_uint_sb, &[bufs, idx, zero]);
    a.emit(op::STORE, &[dst, one]);
    a.emit(op::RETURN, &[]);
    a.end_function();
    a.assemble()
}

/// Dynamic index into an array inside the push-constant block.
///
/// ```glsl
/// layout(push_constant) uniform PC { uint count; uint values[4]; };
/// layout(set = 0, binding = 0) buffer Data { uint data[]; };
/// void main() { uint g = gl_GlobalInvocationID.x; data[g] = values[g]; }
/// ```
///
/// The push-constant block spans 20 bytes.
pub fn push_constant_array() -> Vec<u32> {
    let mut a = Asm::new(version(1, 3));
    let c = compute_prologue(&mut a, &[]);
    let (data, ptr_uint_sb) = runtime_array_ssbo(&mut a, c.uint);
    let zero = a.constant(c.uint, &[0]);
    let one = a.constant(c.uint, &[1]);
    let four = a.constant(c.uint, &[4]);

    let values = a.ty(op::TYPE_ARRAY, &[c.uint, four]);
    a.decorate(values, decoration::ARRAY_STRIDE, &[4]);
    let pc_block = a.ty(op::TYPE_STRUCT, &[c.uint, values]);
    a.decorate(pc_block, decoration::BLOCK, &[]);
    a.member_decorate(pc_block, 0, decoration::OFFSET, &[0]);
    a.member_decorate(pc_block, 1, decoration::OFFSET, &[4]);
    let ptr_pc = a.ty(op::TYPE_POINTER, &[storage_class::PUSH_CONSTANT, pc_block]);
    let ptr_pc_uint = a.ty(op::TYPE_POINTER, &[storage_class::PUSH_CONSTANT, c.uint]);
    let pc = a.global_variable(ptr_pc, storage_class::PUSH_CONSTANT);

    a.begin_function(c.main, c.void, c.main_type);
    let entry = a.id();
    a.begin_block(entry);
    let g = load_gid_x(&mut a, &c, zero);
    let src = a.op(op::ACCESS_CHAIN, ptr_pc_uint, &[pc, one, g]);
    let value = a.op(op::LOAD, c.uint, &[src]);
    let dst = a.op(op::ACCESS_CHAIN, ptr_uint_sb, &[data, zero, g]);
    a.emit(op::STORE, &[dst, value]);
    a.emit(op::RETURN, &[]);
    a.end_function();
    a.assemble()
}

/// A load through a buffer device address taken from push constants.
///
/// ```glsl
/// layout(buffer_reference) buffer Ptr { uint v; };
/// layout(push_constant) uniform PC { Ptr addr; };
/// uint result;
/// void main() { result = addr.v; }
/// ```
pub fn physical_storage_buffer_load() -> Vec<u32> {
    let mut a = Asm::new(version(1, 5));
    a.capability(capability::INT64);
    a.capability(capability::PHYSICAL_STORAGE_BUFFER_ADDRESSES);
    a.extension("SPV_KHR_physical_storage_buffer");
    a.memory_model(
        op::addressing_model::PHYSICAL_STORAGE_BUFFER_64,
        op::memory_model::GLSL450,
    );

    // SPIR-V 1.4+ lists every referenced global in the interface; reserve ids first.
    let pc = a.id();
    let result = a.id();
    let c = compute_prologue(&mut a, &[pc, result]);
    let zero = a.constant(c.uint, &[0]);
    let ulong = a.ty(op::TYPE_INT, &[64, 0]);
    let pc_block = a.ty(op::TYPE_STRUCT, &[ulong]);
    a.decorate(pc_block, decoration::BLOCK, &[]);
    a.member_decorate(pc_block, 0, decoration::OFFSET, &[0]);
    let ptr_pc = a.ty(op::TYPE_POINTER, &[storage_class::PUSH_CONSTANT, pc_block]);
    let ptr_pc_ulong = a.ty(op::TYPE_POINTER, &[storage_class::PUSH_CONSTANT, ulong]);
    let ptr_psb_uint = a.ty(
        op::TYPE_POINTER,
        &[storage_class::PHYSICAL_STORAGE_BUFFER, c.uint],
    );
    let ptr_private_uint = a.ty(op::TYPE_POINTER, &[storage_class::PRIVATE, c.uint]);
    a.globals.push(Instruction::new(
        op::VARIABLE,
        vec![ptr_pc, pc, storage_class::PUSH_CONSTANT],
    ));
    a.globals.push(Instruction::new(
        op::VARIABLE,
        vec![ptr_private_uint, result, storage_class::PRIVATE],
    ));

    a.begin_function(c.main, c.void, c.main_type);
    let entry = a.id();
    a.begin_block(entry);
    let addr_ptr = a.op(op::ACCESS_CHAIN, ptr_pc_ulong, &[pc, zero]);
    let addr = a.op(op::LOAD, ulong, &[addr_ptr]);
    let ptr = a.op(op::CONVERT_U_TO_PTR, ptr_psb_uint, &[addr]);
    let value = a.op(op::LOAD, c.uint, &[ptr, op::memory_access::ALIGNED, 4]);
    a.emit(op::STORE, &[result, value]);
    a.emit(op::RETURN, &[]);
    a.end_function();
    a.assemble()
}

/// Read-modify-write of a storage image at the invocation's coordinates.
///
/// ```glsl
/// layout(set = 0, binding = 0, r32ui) uniform uimage2D img;
/// void main() {
///     ivec2 p = ivec2(gl_GlobalInvocationID.xy);
///     imageStore(img, p, imageLoad(img, p));
/// }
/// ```
pub fn storage_image_read_write() -> Vec<u32> {
    let mut a = Asm::new(version(1, 3));
    let c = compute_prologue(&mut a, &[]);
    let int = a.ty(op::TYPE_INT, &[32, 1]);
    let ivec2 = a.ty(op::TYPE_VECTOR, &[int, 2]);
    let uvec2 = a.ty(op::TYPE_VECTOR, &[c.uint, 2]);
    let uvec4 = a.ty(op::TYPE_VECTOR, &[c.uint, 4]);
    let image = a.ty(
        op::TYPE_IMAGE,
        &[c.uint, op::dim::DIM_2D, 0, 0, 0, 2, op::image_format::R32UI],
    );
    let ptr_image = a.ty(op::TYPE_POINTER, &[storage_class::UNIFORM_CONSTANT, image]);
    let img = a.global_variable(ptr_image, storage_class::UNIFORM_CONSTANT);
    a.decorate(img, decoration::DESCRIPTOR_SET, &[0]);
    a.decorate(img, decoration::BINDING, &[0]);
    a.name(img, "img");

    a.begin_function(c.main, c.void, c.main_type);
    let entry = a.id();
    a.begin_block(entry);
    let g = a.op(op::LOAD, c.uvec3, &[c.gid]);
    let xy = a.op(op::VECTOR_SHUFFLE, uvec2, &[g, g, 0, 1]);
    let p = a.op(op::BITCAST, ivec2, &[xy]);
    let loaded = a.op(op::LOAD, image, &[img]);
    let texel = a.op(op::IMAGE_READ, uvec4, &[loaded, p]);
    let target = a.op(op::LOAD, image, &[img]);
    a.emit(op::IMAGE_WRITE, &[target, p, texel]);
    a.emit(op::RETURN, &[]);
    a.end_function();
    a.assemble()
}

/// The format string used by [`debug_printf`].
pub const DEBUG_PRINTF_FORMAT: &str = "gid=%u value=%f";

/// ```glsl
/// void main() { debugPrintfEXT("gid=%u value=%f", gl_GlobalInvocationID.x, 1.5); }
/// ```
pub fn debug_printf() -> Vec<u32> {
    let mut a = Asm::new(version(1, 3));
    a.extension("SPV_KHR_non_semantic_info");
    let printf = a.ext_inst_import(op::DEBUG_PRINTF_SET);
    let fmt = a.string(DEBUG_PRINTF_FORMAT);
    let c = compute_prologue(&mut a, &[]);
    let zero = a.constant(c.uint, &[0]);
    let float = a.ty(op::TYPE_FLOAT, &[32]);
    let one_and_half = a.constant(float, &[1.5f32.to_bits()]);

    a.begin_function(c.main, c.void, c.main_type);
    let entry = a.id();
    a.begin_block(entry);
    let g = load_gid_x(&mut a, &c, zero);
    a.op(
        op::EXT_INST,
        c.void,
        &[printf, op::DEBUG_PRINTF_INSTRUCTION, fmt, g, one_and_half],
    );
    a.emit(op::RETURN, &[]);
    a.end_function();
    a.assemble()
}

/// A vertex shader fetching from a storage buffer by vertex index.
///
/// ```glsl
/// layout(set = 0, binding = 0) buffer Data { uint data[]; };
/// layout(location = 0) out uint value;
/// void main() { value = data[gl_VertexIndex]; }
/// ```
pub fn vertex_ssbo_fetch() -> Vec<u32> {
    let mut a = Asm::new(version(1, 3));
    let main = a.id();
    let vertex_index = a.id();
    let value = a.id();
    let void = a.ty(op::TYPE_VOID, &[]);
    let main_type = a.ty(op::TYPE_FUNCTION, &[void]);
    let uint = a.ty(op::TYPE_INT, &[32, 0]);
    let int = a.ty(op::TYPE_INT, &[32, 1]);
    let (data, ptr_uint_sb) = runtime_array_ssbo(&mut a, uint);
    let zero = a.constant(uint, &[0]);
    let ptr_int_in = a.ty(op::TYPE_POINTER, &[storage_class::INPUT, int]);
    let ptr_uint_out = a.ty(op::TYPE_POINTER, &[storage_class::OUTPUT, uint]);
    a.globals.push(Instruction::new(
        op::VARIABLE,
        vec![ptr_int_in, vertex_index, storage_class::INPUT],
    ));
    a.globals.push(Instruction::new(
        op::VARIABLE,
        vec![ptr_uint_out, value, storage_class::OUTPUT],
    ));
    a.decorate(vertex_index, decoration::BUILT_IN, &[builtin::VERTEX_INDEX]);
    a.decorate(value, decoration::LOCATION, &[0]);
    a.entry_point(execution_model::VERTEX, main, "main", &[vertex_index, value]);

    a.begin_function(main, void, main_type);
    let entry = a.id();
    a.begin_block(entry);
    let vi = a.op(op::LOAD, int, &[vertex_index]);
    let src = a.op(op::ACCESS_CHAIN, ptr_uint_sb, &[data, zero, vi]);
    let v = a.op(op::LOAD, uint, &[src]);
    a.emit(op::STORE, &[value, v]);
    a.emit(op::RETURN, &[]);
    a.end_function();
    a.assemble()
}
