//! Opcode numbers and the per-opcode result layout table.
//!
//! Only the opcodes the engine inspects or emits are named here. Unknown opcodes still
//! parse and serialize verbatim; they just report [`ResultLayout::None`].

pub const NOP: u16 = 0;
pub const UNDEF: u16 = 1;
pub const SOURCE_CONTINUED: u16 = 2;
pub const SOURCE: u16 = 3;
pub const SOURCE_EXTENSION: u16 = 4;
pub const NAME: u16 = 5;
pub const MEMBER_NAME: u16 = 6;
pub const STRING: u16 = 7;
pub const LINE: u16 = 8;
pub const EXTENSION: u16 = 10;
pub const EXT_INST_IMPORT: u16 = 11;
pub const EXT_INST: u16 = 12;
pub const MEMORY_MODEL: u16 = 14;
pub const ENTRY_POINT: u16 = 15;
pub const EXECUTION_MODE: u16 = 16;
pub const CAPABILITY: u16 = 17;
pub const TYPE_VOID: u16 = 19;
pub const TYPE_BOOL: u16 = 20;
pub const TYPE_INT: u16 = 21;
pub const TYPE_FLOAT: u16 = 22;
pub const TYPE_VECTOR: u16 = 23;
pub const TYPE_MATRIX: u16 = 24;
pub const TYPE_IMAGE: u16 = 25;
pub const TYPE_SAMPLER: u16 = 26;
pub const TYPE_SAMPLED_IMAGE: u16 = 27;
pub const TYPE_ARRAY: u16 = 28;
pub const TYPE_RUNTIME_ARRAY: u16 = 29;
pub const TYPE_STRUCT: u16 = 30;
pub const TYPE_POINTER: u16 = 32;
pub const TYPE_FUNCTION: u16 = 33;
pub const TYPE_FORWARD_POINTER: u16 = 39;
pub const CONSTANT_TRUE: u16 = 41;
pub const CONSTANT_FALSE: u16 = 42;
pub const CONSTANT: u16 = 43;
pub const CONSTANT_COMPOSITE: u16 = 44;
pub const CONSTANT_NULL: u16 = 46;
pub const SPEC_CONSTANT: u16 = 50;
pub const FUNCTION: u16 = 54;
pub const FUNCTION_PARAMETER: u16 = 55;
pub const FUNCTION_END: u16 = 56;
pub const FUNCTION_CALL: u16 = 57;
pub const VARIABLE: u16 = 59;
pub const LOAD: u16 = 61;
pub const STORE: u16 = 62;
pub const ACCESS_CHAIN: u16 = 65;
pub const IN_BOUNDS_ACCESS_CHAIN: u16 = 66;
pub const PTR_ACCESS_CHAIN: u16 = 67;
pub const DECORATE: u16 = 71;
pub const MEMBER_DECORATE: u16 = 72;
pub const DECORATION_GROUP: u16 = 73;
pub const GROUP_DECORATE: u16 = 74;
pub const GROUP_MEMBER_DECORATE: u16 = 75;
pub const VECTOR_SHUFFLE: u16 = 79;
pub const COMPOSITE_CONSTRUCT: u16 = 80;
pub const COMPOSITE_EXTRACT: u16 = 81;
pub const IMAGE_READ: u16 = 98;
pub const IMAGE_WRITE: u16 = 99;
pub const IMAGE_QUERY_SIZE: u16 = 104;
pub const CONVERT_F_TO_U: u16 = 109;
pub const U_CONVERT: u16 = 113;
pub const S_CONVERT: u16 = 114;
pub const F_CONVERT: u16 = 115;
pub const CONVERT_PTR_TO_U: u16 = 117;
pub const CONVERT_U_TO_PTR: u16 = 120;
pub const BITCAST: u16 = 124;
pub const I_ADD: u16 = 128;
pub const I_SUB: u16 = 130;
pub const I_MUL: u16 = 132;
pub const U_DIV: u16 = 134;
pub const ALL: u16 = 155;
pub const LOGICAL_OR: u16 = 166;
pub const LOGICAL_AND: u16 = 167;
pub const LOGICAL_NOT: u16 = 168;
pub const SELECT: u16 = 169;
pub const I_EQUAL: u16 = 170;
pub const I_NOT_EQUAL: u16 = 171;
pub const U_GREATER_THAN: u16 = 172;
pub const U_GREATER_THAN_EQUAL: u16 = 174;
pub const U_LESS_THAN: u16 = 176;
pub const U_LESS_THAN_EQUAL: u16 = 178;
pub const SHIFT_RIGHT_LOGICAL: u16 = 194;
pub const SHIFT_LEFT_LOGICAL: u16 = 196;
pub const BITWISE_OR: u16 = 197;
pub const BITWISE_AND: u16 = 199;
pub const ATOMIC_LOAD: u16 = 227;
pub const ATOMIC_STORE: u16 = 228;
pub const ATOMIC_EXCHANGE: u16 = 229;
pub const ATOMIC_I_ADD: u16 = 234;
pub const ATOMIC_XOR: u16 = 242;
pub const PHI: u16 = 245;
pub const LOOP_MERGE: u16 = 246;
pub const SELECTION_MERGE: u16 = 247;
pub const LABEL: u16 = 248;
pub const BRANCH: u16 = 249;
pub const BRANCH_CONDITIONAL: u16 = 250;
pub const SWITCH: u16 = 251;
pub const KILL: u16 = 252;
pub const RETURN: u16 = 253;
pub const RETURN_VALUE: u16 = 254;
pub const UNREACHABLE: u16 = 255;
pub const NO_LINE: u16 = 317;
pub const MODULE_PROCESSED: u16 = 330;
pub const EXECUTION_MODE_ID: u16 = 331;
pub const DECORATE_ID: u16 = 332;
pub const TERMINATE_INVOCATION: u16 = 4416;
pub const IGNORE_INTERSECTION_KHR: u16 = 4448;
pub const TERMINATE_RAY_KHR: u16 = 4449;
pub const EMIT_MESH_TASKS_EXT: u16 = 5294;
pub const DECORATE_STRING: u16 = 5632;
pub const MEMBER_DECORATE_STRING: u16 = 5633;

/// Where (if anywhere) an instruction stores its result type and result id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultLayout {
    /// No result.
    None,
    /// `operands[0]` is the result id.
    Id,
    /// `operands[0]` is the result type, `operands[1]` the result id.
    TypeAndId,
}

pub fn result_layout(opcode: u16) -> ResultLayout {
    match opcode {
        STRING | EXT_INST_IMPORT | DECORATION_GROUP | LABEL => ResultLayout::Id,
        // Type declarations, minus OpTypeForwardPointer which declares nothing new.
        19..=38 => ResultLayout::Id,
        UNDEF | EXT_INST => ResultLayout::TypeAndId,
        41..=46 | 48..=52 => ResultLayout::TypeAndId,
        FUNCTION | FUNCTION_PARAMETER | FUNCTION_CALL => ResultLayout::TypeAndId,
        59..=61 | 65..=70 => ResultLayout::TypeAndId,
        77..=84 | 86..=98 | 100..=107 => ResultLayout::TypeAndId,
        109..=124 | 126..=152 | 154..=205 | 207..=215 => ResultLayout::TypeAndId,
        ATOMIC_LOAD | 229..=242 => ResultLayout::TypeAndId,
        PHI => ResultLayout::TypeAndId,
        // Group non-uniform operations.
        333..=366 => ResultLayout::TypeAndId,
        // OpCopyLogical, OpPtrEqual, OpPtrNotEqual, OpPtrDiff.
        400..=403 => ResultLayout::TypeAndId,
        _ => ResultLayout::None,
    }
}

/// Returns `true` for block terminators.
pub fn is_terminator(opcode: u16) -> bool {
    matches!(
        opcode,
        BRANCH
            | BRANCH_CONDITIONAL
            | SWITCH
            | KILL
            | RETURN
            | RETURN_VALUE
            | UNREACHABLE
            | TERMINATE_INVOCATION
            | IGNORE_INTERSECTION_KHR
            | TERMINATE_RAY_KHR
            | EMIT_MESH_TASKS_EXT
    )
}

/// Returns `true` for instructions that belong to the annotation section.
pub fn is_annotation(opcode: u16) -> bool {
    matches!(
        opcode,
        DECORATE
            | MEMBER_DECORATE
            | DECORATION_GROUP
            | GROUP_DECORATE
            | GROUP_MEMBER_DECORATE
            | DECORATE_ID
            | DECORATE_STRING
            | MEMBER_DECORATE_STRING
    )
}

/// Returns `true` for type declarations.
pub fn is_type_declaration(opcode: u16) -> bool {
    matches!(opcode, 19..=39)
}

/// Short mnemonic for diagnostics. Falls back to the numeric opcode.
pub fn name(opcode: u16) -> std::borrow::Cow<'static, str> {
    let name = match opcode {
        LOAD => "OpLoad",
        STORE => "OpStore",
        ACCESS_CHAIN => "OpAccessChain",
        IN_BOUNDS_ACCESS_CHAIN => "OpInBoundsAccessChain",
        IMAGE_READ => "OpImageRead",
        IMAGE_WRITE => "OpImageWrite",
        EXT_INST => "OpExtInst",
        ATOMIC_LOAD => "OpAtomicLoad",
        ATOMIC_STORE => "OpAtomicStore",
        ATOMIC_EXCHANGE => "OpAtomicExchange",
        230 => "OpAtomicCompareExchange",
        231 => "OpAtomicCompareExchangeWeak",
        232 => "OpAtomicIIncrement",
        233 => "OpAtomicIDecrement",
        ATOMIC_I_ADD => "OpAtomicIAdd",
        235 => "OpAtomicISub",
        236 => "OpAtomicSMin",
        237 => "OpAtomicUMin",
        238 => "OpAtomicSMax",
        239 => "OpAtomicUMax",
        240 => "OpAtomicAnd",
        241 => "OpAtomicOr",
        ATOMIC_XOR => "OpAtomicXor",
        _ => return std::borrow::Cow::Owned(format!("Op#{opcode}")),
    };
    std::borrow::Cow::Borrowed(name)
}

pub mod storage_class {
    pub const UNIFORM_CONSTANT: u32 = 0;
    pub const INPUT: u32 = 1;
    pub const UNIFORM: u32 = 2;
    pub const OUTPUT: u32 = 3;
    pub const PRIVATE: u32 = 6;
    pub const FUNCTION: u32 = 7;
    pub const PUSH_CONSTANT: u32 = 9;
    pub const STORAGE_BUFFER: u32 = 12;
    pub const PHYSICAL_STORAGE_BUFFER: u32 = 5349;

    pub fn name(storage_class: u32) -> &'static str {
        match storage_class {
            UNIFORM_CONSTANT => "UniformConstant",
            INPUT => "Input",
            UNIFORM => "Uniform",
            OUTPUT => "Output",
            PRIVATE => "Private",
            FUNCTION => "Function",
            PUSH_CONSTANT => "PushConstant",
            STORAGE_BUFFER => "StorageBuffer",
            PHYSICAL_STORAGE_BUFFER => "PhysicalStorageBuffer",
            _ => "Other",
        }
    }
}

pub mod decoration {
    pub const BLOCK: u32 = 2;
    pub const BUFFER_BLOCK: u32 = 3;
    pub const ARRAY_STRIDE: u32 = 6;
    pub const MATRIX_STRIDE: u32 = 7;
    pub const BUILT_IN: u32 = 11;
    pub const NON_WRITABLE: u32 = 24;
    pub const BINDING: u32 = 33;
    pub const DESCRIPTOR_SET: u32 = 34;
    pub const LOCATION: u32 = 30;
    pub const OFFSET: u32 = 35;
}

pub mod builtin {
    pub const FRAG_COORD: u32 = 15;
    pub const GLOBAL_INVOCATION_ID: u32 = 28;
    pub const VERTEX_INDEX: u32 = 42;
    pub const INSTANCE_INDEX: u32 = 43;
}

pub mod capability {
    pub const SHADER: u32 = 1;
    pub const INT64: u32 = 11;
    pub const IMAGE_QUERY: u32 = 50;
    pub const PHYSICAL_STORAGE_BUFFER_ADDRESSES: u32 = 5347;
}

pub mod execution_model {
    pub const VERTEX: u32 = 0;
    pub const TESSELLATION_CONTROL: u32 = 1;
    pub const TESSELLATION_EVALUATION: u32 = 2;
    pub const GEOMETRY: u32 = 3;
    pub const FRAGMENT: u32 = 4;
    pub const GL_COMPUTE: u32 = 5;
    pub const TASK_EXT: u32 = 5364;
    pub const MESH_EXT: u32 = 5365;

    pub fn name(model: u32) -> &'static str {
        match model {
            VERTEX => "vertex",
            TESSELLATION_CONTROL => "tessellation control",
            TESSELLATION_EVALUATION => "tessellation evaluation",
            GEOMETRY => "geometry",
            FRAGMENT => "fragment",
            GL_COMPUTE => "compute",
            TASK_EXT => "task",
            MESH_EXT => "mesh",
            5313..=5318 => "ray tracing",
            _ => "unknown",
        }
    }
}

pub mod execution_mode {
    pub const ORIGIN_UPPER_LEFT: u32 = 7;
    pub const LOCAL_SIZE: u32 = 17;
}

pub mod image_format {
    pub const R32UI: u32 = 33;
}

pub mod memory_access {
    pub const ALIGNED: u32 = 0x2;
}

pub mod addressing_model {
    pub const LOGICAL: u32 = 0;
    pub const PHYSICAL_STORAGE_BUFFER_64: u32 = 5348;
}

pub mod memory_model {
    pub const GLSL450: u32 = 1;
}

pub mod scope {
    pub const DEVICE: u32 = 1;
}

pub mod dim {
    pub const DIM_1D: u32 = 0;
    pub const DIM_2D: u32 = 1;
    pub const DIM_3D: u32 = 2;
    pub const CUBE: u32 = 3;
    pub const RECT: u32 = 4;
    pub const BUFFER: u32 = 5;
}

/// Extended instruction set name for `debugPrintfEXT`.
pub const DEBUG_PRINTF_SET: &str = "NonSemantic.DebugPrintf";
/// `DebugPrintf` instruction number within [`DEBUG_PRINTF_SET`].
pub const DEBUG_PRINTF_INSTRUCTION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_layout_matches_common_opcodes() {
        assert_eq!(result_layout(TYPE_INT), ResultLayout::Id);
        assert_eq!(result_layout(TYPE_FORWARD_POINTER), ResultLayout::None);
        assert_eq!(result_layout(LOAD), ResultLayout::TypeAndId);
        assert_eq!(result_layout(STORE), ResultLayout::None);
        assert_eq!(result_layout(IMAGE_WRITE), ResultLayout::None);
        assert_eq!(result_layout(ATOMIC_STORE), ResultLayout::None);
        assert_eq!(result_layout(ATOMIC_I_ADD), ResultLayout::TypeAndId);
        assert_eq!(result_layout(LABEL), ResultLayout::Id);
        assert_eq!(result_layout(DECORATE), ResultLayout::None);
    }

    #[test]
    fn terminators() {
        assert!(is_terminator(RETURN));
        assert!(is_terminator(BRANCH_CONDITIONAL));
        assert!(!is_terminator(SELECTION_MERGE));
        assert!(!is_terminator(LOAD));
    }
}
