//! Application shader images and the resource interface reflected from them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use gpuav_spirv::{op, Instruction, Module};

use crate::driver::DescriptorKind;

/// Identity of a shader binary: blake3 over its words.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub [u8; 32]);

impl SourceId {
    pub fn of_words(words: &[u32]) -> Self {
        Self(*blake3::hash(bytemuck::cast_slice(words)).as_bytes())
    }
}

impl fmt::Debug for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceId({self})")
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceBinding {
    pub set: u32,
    pub binding: u32,
    pub kind: DescriptorKind,
    /// Array length; `0` for runtime-sized arrays.
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub execution_model: u32,
    pub name: String,
}

/// Resources a shader module declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderInterface {
    pub bindings: Vec<InterfaceBinding>,
    pub push_constant_size: u32,
    pub entry_points: Vec<EntryPoint>,
}

impl ShaderInterface {
    pub fn reflect(module: &Module) -> Self {
        let index = ModuleIndex::new(module);
        let mut bindings = Vec::new();
        let mut push_constant_size = 0u32;
        for inst in &module.types_values {
            if inst.opcode != op::VARIABLE {
                continue;
            }
            let (Some(ptr_ty), Some(id), Some(sc)) =
                (inst.operand(0), inst.operand(1), inst.operand(2))
            else {
                continue;
            };
            let Some((_, pointee)) = index.pointer(ptr_ty) else {
                continue;
            };
            if sc == op::storage_class::PUSH_CONSTANT {
                let size = index.type_size(pointee).unwrap_or(0);
                push_constant_size = push_constant_size.max(size.min(u64::from(u32::MAX)) as u32);
                continue;
            }
            let (Some(set), Some(binding)) = (
                index.decoration_word(id, op::decoration::DESCRIPTOR_SET),
                index.decoration_word(id, op::decoration::BINDING),
            ) else {
                continue;
            };
            let (element, count) = match index.def(pointee) {
                Some(def) if def.opcode == op::TYPE_ARRAY => (
                    def.operand(1).unwrap_or(0),
                    def.operand(2).and_then(|len| index.constant(len)).unwrap_or(0),
                ),
                Some(def) if def.opcode == op::TYPE_RUNTIME_ARRAY => (def.operand(1).unwrap_or(0), 0),
                _ => (pointee, 1),
            };
            if let Some(kind) = descriptor_kind(&index, sc, element) {
                bindings.push(InterfaceBinding {
                    set,
                    binding,
                    kind,
                    count,
                });
            }
        }
        bindings.sort_by_key(|b| (b.set, b.binding));
        let entry_points = module
            .entry_point_infos()
            .into_iter()
            .map(|(execution_model, _, name)| EntryPoint {
                execution_model,
                name,
            })
            .collect();
        Self {
            bindings,
            push_constant_size,
            entry_points,
        }
    }

    pub fn binding(&self, set: u32, binding: u32) -> Option<&InterfaceBinding> {
        self.bindings
            .iter()
            .find(|b| b.set == set && b.binding == binding)
    }
}

/// An application-owned shader module as the engine sees it.
#[derive(Debug, Clone)]
pub struct ShaderImage {
    pub words: Arc<[u32]>,
    pub debug_name: Option<String>,
    pub source: SourceId,
    /// `None` when the words do not parse; instrumentation then skips the shader.
    pub interface: Option<ShaderInterface>,
}

impl ShaderImage {
    pub fn new(words: &[u32], debug_name: Option<String>) -> Self {
        let interface = Module::parse(words)
            .ok()
            .map(|module| ShaderInterface::reflect(&module));
        Self {
            words: words.into(),
            debug_name,
            source: SourceId::of_words(words),
            interface,
        }
    }

    pub fn word_len(&self) -> usize {
        self.words.len()
    }
}

/// Hash-indexed view of a module's global declarations and value types.
pub(crate) struct ModuleIndex<'m> {
    pub module: &'m Module,
    defs: HashMap<u32, &'m Instruction>,
    decorations: HashMap<(u32, u32), &'m [u32]>,
    member_offsets: HashMap<(u32, u32), u32>,
    value_types: HashMap<u32, u32>,
    locals: HashMap<u32, &'m Instruction>,
}

impl<'m> ModuleIndex<'m> {
    pub fn new(module: &'m Module) -> Self {
        let mut defs = HashMap::new();
        let mut value_types = HashMap::new();
        let mut locals = HashMap::new();
        for inst in module.types_values.iter().chain(&module.ext_inst_imports) {
            if let Some(id) = inst.result_id() {
                defs.insert(id, inst);
            }
        }
        let function_body = module.functions.iter().flat_map(|f| {
            f.params
                .iter()
                .chain(f.blocks.iter().flat_map(|b| b.instructions.iter()))
        });
        for inst in module.types_values.iter() {
            if let (Some(ty), Some(id)) = (inst.result_type(), inst.result_id()) {
                value_types.insert(id, ty);
            }
        }
        for inst in function_body {
            if let Some(id) = inst.result_id() {
                locals.insert(id, inst);
                if let Some(ty) = inst.result_type() {
                    value_types.insert(id, ty);
                }
            }
        }
        let mut decorations = HashMap::new();
        let mut member_offsets = HashMap::new();
        for inst in &module.annotations {
            match (inst.opcode, inst.operand(0), inst.operand(1)) {
                (op::DECORATE, Some(id), Some(deco)) => {
                    decorations
                        .entry((id, deco))
                        .or_insert(inst.operands.get(2..).unwrap_or(&[]));
                }
                (op::MEMBER_DECORATE, Some(id), Some(member))
                    if inst.operand(2) == Some(op::decoration::OFFSET) =>
                {
                    if let Some(offset) = inst.operand(3) {
                        member_offsets.entry((id, member)).or_insert(offset);
                    }
                }
                _ => {}
            }
        }
        Self {
            module,
            defs,
            decorations,
            member_offsets,
            value_types,
            locals,
        }
    }

    /// Function-body instruction defining `id`.
    pub fn local_def(&self, id: u32) -> Option<&'m Instruction> {
        self.locals.get(&id).copied()
    }

    /// Global instruction (type, constant, variable, import) defining `id`.
    pub fn def(&self, id: u32) -> Option<&'m Instruction> {
        self.defs.get(&id).copied()
    }

    pub fn decoration(&self, id: u32, decoration: u32) -> Option<&'m [u32]> {
        self.decorations.get(&(id, decoration)).copied()
    }

    pub fn decoration_word(&self, id: u32, decoration: u32) -> Option<u32> {
        self.decoration(id, decoration)?.first().copied()
    }

    pub fn has_decoration(&self, id: u32, decoration: u32) -> bool {
        self.decorations.contains_key(&(id, decoration))
    }

    pub fn member_offset(&self, ty: u32, member: u32) -> Option<u32> {
        self.member_offsets.get(&(ty, member)).copied()
    }

    /// Value of a 32-bit integer `OpConstant`.
    pub fn constant(&self, id: u32) -> Option<u32> {
        let def = self.def(id)?;
        (def.opcode == op::CONSTANT && def.operands.len() == 3)
            .then(|| def.operand(2))
            .flatten()
    }

    pub fn value_type(&self, id: u32) -> Option<u32> {
        self.value_types.get(&id).copied()
    }

    /// `(storage class, pointee)` of an `OpTypePointer`.
    pub fn pointer(&self, ptr_ty: u32) -> Option<(u32, u32)> {
        let def = self.def(ptr_ty)?;
        if def.opcode != op::TYPE_POINTER {
            return None;
        }
        Some((def.operand(1)?, def.operand(2)?))
    }

    /// Byte size of `ty` under the module's explicit layout decorations.
    ///
    /// Runtime arrays contribute nothing; opaque types have no size.
    pub fn type_size(&self, ty: u32) -> Option<u64> {
        self.type_size_at(ty, 0)
    }

    fn type_size_at(&self, ty: u32, depth: u32) -> Option<u64> {
        if depth > 32 {
            return None;
        }
        let inst = self.def(ty)?;
        match inst.opcode {
            op::TYPE_BOOL => Some(4),
            op::TYPE_INT | op::TYPE_FLOAT => Some(u64::from(inst.operand(1)?) / 8),
            op::TYPE_VECTOR | op::TYPE_MATRIX => Some(
                self.type_size_at(inst.operand(1)?, depth + 1)? * u64::from(inst.operand(2)?),
            ),
            op::TYPE_ARRAY => {
                let len = u64::from(self.constant(inst.operand(2)?)?);
                Some(len * self.array_stride(ty, inst.operand(1)?, depth)?)
            }
            op::TYPE_RUNTIME_ARRAY => Some(0),
            op::TYPE_STRUCT => {
                let mut end = 0u64;
                let mut running = 0u64;
                for (member, &member_ty) in inst.operands.iter().skip(1).enumerate() {
                    let offset = self
                        .member_offset(ty, member as u32)
                        .map(u64::from)
                        .unwrap_or(running);
                    running = offset + self.type_size_at(member_ty, depth + 1)?;
                    end = end.max(running);
                }
                Some(end)
            }
            op::TYPE_POINTER
                if inst.operand(1) == Some(op::storage_class::PHYSICAL_STORAGE_BUFFER) =>
            {
                Some(8)
            }
            _ => None,
        }
    }

    /// `ArrayStride` of an array type, falling back to the element size.
    pub fn array_stride(&self, array_ty: u32, element_ty: u32, depth: u32) -> Option<u64> {
        match self.decoration_word(array_ty, op::decoration::ARRAY_STRIDE) {
            Some(stride) => Some(u64::from(stride)),
            None => self.type_size_at(element_ty, depth + 1),
        }
    }
}

fn descriptor_kind(index: &ModuleIndex<'_>, storage_class: u32, ty: u32) -> Option<DescriptorKind> {
    use op::storage_class as sc;
    let def = index.def(ty)?;
    match storage_class {
        sc::STORAGE_BUFFER => Some(DescriptorKind::StorageBuffer),
        sc::UNIFORM if index.has_decoration(ty, op::decoration::BUFFER_BLOCK) => {
            Some(DescriptorKind::StorageBuffer)
        }
        sc::UNIFORM => Some(DescriptorKind::UniformBuffer),
        sc::UNIFORM_CONSTANT => match def.opcode {
            op::TYPE_SAMPLER => Some(DescriptorKind::Sampler),
            op::TYPE_SAMPLED_IMAGE => Some(DescriptorKind::CombinedImageSampler),
            op::TYPE_IMAGE => {
                // OpTypeImage: id, sampled type, dim, depth, arrayed, ms, sampled, format
                let buffer = def.operand(2) == Some(op::dim::BUFFER);
                let storage = def.operand(6) == Some(2);
                Some(match (buffer, storage) {
                    (true, true) => DescriptorKind::StorageTexelBuffer,
                    (true, false) => DescriptorKind::UniformTexelBuffer,
                    (false, true) => DescriptorKind::StorageImage,
                    (false, false) => DescriptorKind::SampledImage,
                })
            }
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuav_spirv::test_utils;

    #[test]
    fn source_id_is_content_hash() {
        let a = test_utils::trivial_compute();
        let mut b = a.clone();
        assert_eq!(SourceId::of_words(&a), SourceId::of_words(&b));
        b.push(0);
        assert_ne!(SourceId::of_words(&a), SourceId::of_words(&b));
        assert_eq!(SourceId::of_words(&a).to_string().len(), 16);
    }

    #[test]
    fn reflects_storage_buffer_binding() {
        let image = ShaderImage::new(&test_utils::ssbo_runtime_array_loop(4), None);
        let interface = image.interface.unwrap();
        let b = interface.binding(0, 0).unwrap();
        assert_eq!(b.kind, DescriptorKind::StorageBuffer);
        assert_eq!(b.count, 1);
        assert_eq!(interface.entry_points.len(), 1);
        assert_eq!(interface.entry_points[0].execution_model, op::execution_model::GL_COMPUTE);
    }

    #[test]
    fn reflects_descriptor_array_and_push_constants() {
        let image = ShaderImage::new(&test_utils::descriptor_array_dynamic_index(), None);
        let interface = image.interface.unwrap();
        assert_eq!(interface.binding(0, 0).unwrap().count, 4);
        assert!(interface.push_constant_size >= 4);

        let image = ShaderImage::new(&test_utils::push_constant_array(), None);
        assert_eq!(image.interface.unwrap().push_constant_size, 20);
    }

    #[test]
    fn reflects_storage_image() {
        let image = ShaderImage::new(&test_utils::storage_image_read_write(), None);
        let interface = image.interface.unwrap();
        assert_eq!(interface.binding(0, 0).unwrap().kind, DescriptorKind::StorageImage);
    }

    #[test]
    fn garbage_has_no_interface() {
        let image = ShaderImage::new(&[1, 2, 3], Some("junk".into()));
        assert!(image.interface.is_none());
        assert_eq!(image.debug_name.as_deref(), Some("junk"));
    }
}
