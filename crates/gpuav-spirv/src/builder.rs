//! Mutation helpers used by instrumentation passes: id allocation, type and
//! constant interning, and section-aware insertion.

use crate::error::SpirvError;
use crate::instruction::{encode_literal_string, Instruction};
use crate::module::Module;
use crate::op;

impl Module {
    /// Allocates a fresh result id and bumps the header bound.
    pub fn alloc_id(&mut self) -> Result<u32, SpirvError> {
        let id = self.header.bound;
        self.header.bound = id.checked_add(1).ok_or(SpirvError::IdBoundExhausted)?;
        Ok(id)
    }

    /// Finds an existing declaration with identical opcode and non-result operands,
    /// or appends a new one.
    fn intern(&mut self, opcode: u16, args: &[u32]) -> Result<u32, SpirvError> {
        if let Some(id) = self.types_values.iter().find_map(|inst| {
            (inst.opcode == opcode && inst.operands.get(1..) == Some(args))
                .then(|| inst.operand(0))
                .flatten()
        }) {
            return Ok(id);
        }
        let id = self.alloc_id()?;
        let mut operands = Vec::with_capacity(args.len() + 1);
        operands.push(id);
        operands.extend_from_slice(args);
        self.types_values.push(Instruction::new(opcode, operands));
        Ok(id)
    }

    pub fn type_void(&mut self) -> Result<u32, SpirvError> {
        self.intern(op::TYPE_VOID, &[])
    }

    pub fn type_bool(&mut self) -> Result<u32, SpirvError> {
        self.intern(op::TYPE_BOOL, &[])
    }

    pub fn type_uint(&mut self, width: u32) -> Result<u32, SpirvError> {
        self.type_int(width, false)
    }

    pub fn type_int(&mut self, width: u32, signed: bool) -> Result<u32, SpirvError> {
        self.intern(op::TYPE_INT, &[width, u32::from(signed)])
    }

    pub fn type_float(&mut self, width: u32) -> Result<u32, SpirvError> {
        self.intern(op::TYPE_FLOAT, &[width])
    }

    pub fn type_vector(&mut self, component: u32, count: u32) -> Result<u32, SpirvError> {
        self.intern(op::TYPE_VECTOR, &[component, count])
    }

    pub fn type_pointer(&mut self, storage_class: u32, pointee: u32) -> Result<u32, SpirvError> {
        self.intern(op::TYPE_POINTER, &[storage_class, pointee])
    }

    pub fn type_function(&mut self, ret: u32, params: &[u32]) -> Result<u32, SpirvError> {
        let mut args = Vec::with_capacity(params.len() + 1);
        args.push(ret);
        args.extend_from_slice(params);
        self.intern(op::TYPE_FUNCTION, &args)
    }

    /// Always declares a new runtime array; callers decorate it.
    pub fn new_type_runtime_array(&mut self, element: u32) -> Result<u32, SpirvError> {
        let id = self.alloc_id()?;
        self.types_values
            .push(Instruction::new(op::TYPE_RUNTIME_ARRAY, vec![id, element]));
        Ok(id)
    }

    /// Always declares a new struct; struct types are nominal.
    pub fn new_type_struct(&mut self, members: &[u32]) -> Result<u32, SpirvError> {
        let id = self.alloc_id()?;
        let mut operands = vec![id];
        operands.extend_from_slice(members);
        self.types_values.push(Instruction::new(op::TYPE_STRUCT, operands));
        Ok(id)
    }

    /// Interns a 32-bit integer constant of type `ty`.
    pub fn constant_u32(&mut self, ty: u32, value: u32) -> Result<u32, SpirvError> {
        self.intern_constant(ty, &[value])
    }

    /// Interns a 64-bit integer constant of type `ty` (low word first).
    pub fn constant_u64(&mut self, ty: u32, value: u64) -> Result<u32, SpirvError> {
        self.intern_constant(ty, &[value as u32, (value >> 32) as u32])
    }

    fn intern_constant(&mut self, ty: u32, value: &[u32]) -> Result<u32, SpirvError> {
        if let Some(id) = self.types_values.iter().find_map(|inst| {
            (inst.opcode == op::CONSTANT
                && inst.operand(0) == Some(ty)
                && inst.operands.get(2..) == Some(value))
            .then(|| inst.operand(1))
            .flatten()
        }) {
            return Ok(id);
        }
        let id = self.alloc_id()?;
        let mut operands = vec![ty, id];
        operands.extend_from_slice(value);
        self.types_values.push(Instruction::new(op::CONSTANT, operands));
        Ok(id)
    }

    pub fn constant_bool(&mut self, value: bool) -> Result<u32, SpirvError> {
        let ty = self.type_bool()?;
        let opcode = if value {
            op::CONSTANT_TRUE
        } else {
            op::CONSTANT_FALSE
        };
        self.intern_typed(opcode, ty)
    }

    pub fn constant_null(&mut self, ty: u32) -> Result<u32, SpirvError> {
        self.intern_typed(op::CONSTANT_NULL, ty)
    }

    fn intern_typed(&mut self, opcode: u16, ty: u32) -> Result<u32, SpirvError> {
        if let Some(id) = self.types_values.iter().find_map(|inst| {
            (inst.opcode == opcode && inst.operands.len() == 2 && inst.operand(0) == Some(ty))
                .then(|| inst.operand(1))
                .flatten()
        }) {
            return Ok(id);
        }
        let id = self.alloc_id()?;
        self.types_values.push(Instruction::new(opcode, vec![ty, id]));
        Ok(id)
    }

    /// Declares a module-scope `OpVariable`.
    pub fn add_global_variable(
        &mut self,
        pointer_type: u32,
        storage_class: u32,
        initializer: Option<u32>,
    ) -> Result<u32, SpirvError> {
        let id = self.alloc_id()?;
        let mut operands = vec![pointer_type, id, storage_class];
        operands.extend(initializer);
        self.types_values.push(Instruction::new(op::VARIABLE, operands));
        Ok(id)
    }

    pub fn decorate(&mut self, id: u32, decoration: u32, args: &[u32]) {
        let mut operands = vec![id, decoration];
        operands.extend_from_slice(args);
        self.annotations
            .push(Instruction::new(op::DECORATE, operands));
    }

    pub fn member_decorate(&mut self, id: u32, member: u32, decoration: u32, args: &[u32]) {
        let mut operands = vec![id, member, decoration];
        operands.extend_from_slice(args);
        self.annotations
            .push(Instruction::new(op::MEMBER_DECORATE, operands));
    }

    pub fn set_name(&mut self, id: u32, name: &str) {
        let mut operands = vec![id];
        operands.extend(encode_literal_string(name));
        // OpName must precede OpModuleProcessed.
        let pos = self
            .debug_names
            .iter()
            .position(|inst| inst.opcode == op::MODULE_PROCESSED)
            .unwrap_or(self.debug_names.len());
        self.debug_names
            .insert(pos, Instruction::new(op::NAME, operands));
    }

    pub fn ensure_capability(&mut self, capability: u32) {
        if !self.has_capability(capability) {
            self.capabilities
                .push(Instruction::new(op::CAPABILITY, vec![capability]));
        }
    }

    pub fn ensure_extension(&mut self, name: &str) {
        let encoded = encode_literal_string(name);
        if !self.extensions.iter().any(|inst| inst.operands == encoded) {
            self.extensions
                .push(Instruction::new(op::EXTENSION, encoded));
        }
    }

    /// Adds `var` to the interface list of every entry point that lacks it.
    pub fn add_to_entry_point_interfaces(&mut self, var: u32) {
        for ep in &mut self.entry_points {
            // Operands: model, function, name words..., interface ids...
            let Some(name_words) = ep.operands.get(2..).and_then(|rest| {
                rest.iter()
                    .position(|w| w.to_le_bytes().contains(&0))
                    .map(|p| p + 1)
            }) else {
                continue;
            };
            let interface_start = 2 + name_words;
            if !ep.operands[interface_start..].contains(&var) {
                ep.operands.push(var);
            }
        }
    }

    /// Id of the `OpTypeBool`, `OpTypeInt` etc. whose result is `id`.
    pub fn type_def(&self, id: u32) -> Option<&Instruction> {
        self.types_values
            .iter()
            .find(|inst| op::is_type_declaration(inst.opcode) && inst.operand(0) == Some(id))
    }

    /// Value of a 32-bit `OpConstant`.
    pub fn constant_value(&self, id: u32) -> Option<u32> {
        self.types_values.iter().find_map(|inst| {
            (inst.opcode == op::CONSTANT && inst.operand(1) == Some(id))
                .then(|| inst.operand(2))
                .flatten()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{version, Header};

    fn empty() -> Module {
        Module::empty(Header {
            version: version(1, 3),
            generator: 0,
            bound: 1,
            schema: 0,
        })
    }

    #[test]
    fn types_and_constants_are_interned() {
        let mut m = empty();
        let u32_a = m.type_uint(32).unwrap();
        let u32_b = m.type_uint(32).unwrap();
        assert_eq!(u32_a, u32_b);
        let u64_ty = m.type_uint(64).unwrap();
        assert_ne!(u32_a, u64_ty);

        let c1 = m.constant_u32(u32_a, 7).unwrap();
        let c2 = m.constant_u32(u32_a, 7).unwrap();
        let c3 = m.constant_u32(u32_a, 8).unwrap();
        assert_eq!(c1, c2);
        assert_ne!(c1, c3);
        assert_eq!(m.constant_value(c3), Some(8));
        let wide = m.constant_u64(u64_ty, 1 << 40).unwrap();
        assert_ne!(wide, c1);
        assert_eq!(m.constant_u64(u64_ty, 1 << 40).unwrap(), wide);

        let t = m.constant_bool(true).unwrap();
        let f = m.constant_bool(false).unwrap();
        assert_ne!(t, f);
        assert_eq!(m.constant_bool(true).unwrap(), t);
        assert_eq!(m.header.bound, 9);
    }

    #[test]
    fn structs_are_never_interned() {
        let mut m = empty();
        let u = m.type_uint(32).unwrap();
        let a = m.new_type_struct(&[u]).unwrap();
        let b = m.new_type_struct(&[u]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn names_stay_before_module_processed() {
        let mut m = empty();
        m.debug_names.push(Instruction::new(
            op::MODULE_PROCESSED,
            encode_literal_string("opt"),
        ));
        m.set_name(3, "x");
        assert_eq!(m.debug_names[0].opcode, op::NAME);
        assert_eq!(m.debug_name(3).as_deref(), Some("x"));
    }

    #[test]
    fn entry_point_interface_gets_variable_once() {
        let mut m = empty();
        let mut operands = vec![op::execution_model::GL_COMPUTE, 1];
        operands.extend(encode_literal_string("main"));
        operands.push(9);
        m.entry_points.push(Instruction::new(op::ENTRY_POINT, operands));
        m.add_to_entry_point_interfaces(10);
        m.add_to_entry_point_interfaces(10);
        m.add_to_entry_point_interfaces(9);
        let ep = &m.entry_points[0];
        assert_eq!(&ep.operands[ep.operands.len() - 2..], &[9, 10]);
    }
}
