use crate::error::SpirvError;
use crate::instruction::{decode_literal_string, Instruction};
use crate::op;

/// SPIR-V magic number in host word order.
pub const MAGIC: u32 = 0x0723_0203;
/// Header length in words: magic, version, generator, bound, schema.
pub const HEADER_WORDS: usize = 5;

/// SPIR-V version word for `major.minor`.
pub const fn version(major: u8, minor: u8) -> u32 {
    ((major as u32) << 16) | ((minor as u32) << 8)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub generator: u32,
    /// All result ids in the module are `< bound`.
    pub bound: u32,
    pub schema: u32,
}

/// A basic block. `instructions` excludes the `OpLabel` and ends with the terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub label: u32,
    pub instructions: Vec<Instruction>,
}

impl Block {
    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last().filter(|inst| inst.is_terminator())
    }

    /// The `OpLoopMerge` of a loop header block, if any.
    pub fn loop_merge(&self) -> Option<&Instruction> {
        self.instructions
            .iter()
            .rev()
            .nth(1)
            .filter(|inst| inst.opcode == op::LOOP_MERGE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    /// The `OpFunction` instruction.
    pub def: Instruction,
    pub params: Vec<Instruction>,
    /// Empty for function declarations (imported functions).
    pub blocks: Vec<Block>,
}

impl Function {
    pub fn id(&self) -> u32 {
        self.def.result_id().unwrap_or(0)
    }

    pub fn block_index(&self, label: u32) -> Option<usize> {
        self.blocks.iter().position(|block| block.label == label)
    }
}

/// A SPIR-V module split into its logical layout sections.
///
/// Instruction order within each section is preserved exactly, so `to_words` of an
/// unmodified parse reproduces the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub header: Header,
    pub capabilities: Vec<Instruction>,
    pub extensions: Vec<Instruction>,
    pub ext_inst_imports: Vec<Instruction>,
    pub memory_model: Option<Instruction>,
    pub entry_points: Vec<Instruction>,
    pub execution_modes: Vec<Instruction>,
    /// `OpString`, `OpSource*`.
    pub debug_source: Vec<Instruction>,
    /// `OpName`, `OpMemberName`, `OpModuleProcessed`.
    pub debug_names: Vec<Instruction>,
    pub annotations: Vec<Instruction>,
    /// Types, constants, global variables and anything else declared at module scope.
    pub types_values: Vec<Instruction>,
    pub functions: Vec<Function>,
}

/// Word offset of an instruction in the serialized module, addressed by
/// `(function, block, instruction)`.
pub type InstructionOffsets = Vec<Vec<Vec<usize>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Section {
    Capability,
    Extension,
    ExtInstImport,
    MemoryModel,
    EntryPoint,
    ExecutionMode,
    DebugSource,
    DebugName,
    Annotation,
    TypesValues,
}

fn section_of(opcode: u16) -> Section {
    match opcode {
        op::CAPABILITY => Section::Capability,
        op::EXTENSION => Section::Extension,
        op::EXT_INST_IMPORT => Section::ExtInstImport,
        op::MEMORY_MODEL => Section::MemoryModel,
        op::ENTRY_POINT => Section::EntryPoint,
        op::EXECUTION_MODE | op::EXECUTION_MODE_ID => Section::ExecutionMode,
        op::STRING | op::SOURCE | op::SOURCE_CONTINUED | op::SOURCE_EXTENSION => {
            Section::DebugSource
        }
        op::NAME | op::MEMBER_NAME | op::MODULE_PROCESSED => Section::DebugName,
        opcode if op::is_annotation(opcode) => Section::Annotation,
        _ => Section::TypesValues,
    }
}

struct Reader<'a> {
    words: &'a [u32],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn next(&mut self) -> Option<Result<(usize, Instruction), SpirvError>> {
        if self.pos >= self.words.len() {
            return None;
        }
        let at_word = self.pos;
        let first = self.words[at_word];
        let count = (first >> 16) as usize;
        let opcode = (first & 0xffff) as u16;
        if count == 0 {
            return Some(Err(SpirvError::ZeroWordCount { at_word }));
        }
        let available = self.words.len() - at_word;
        if count > available {
            return Some(Err(SpirvError::Truncated {
                at_word,
                declared: count,
                available,
            }));
        }
        let operands = self.words[at_word + 1..at_word + count].to_vec();
        self.pos += count;
        Some(Ok((at_word, Instruction::new(opcode, operands))))
    }
}

impl Module {
    /// Parses a module from words in host order.
    ///
    /// The input is treated as untrusted: every word count is bounds-checked and the
    /// function never panics on malformed data.
    pub fn parse(words: &[u32]) -> Result<Module, SpirvError> {
        if words.len() < HEADER_WORDS {
            return Err(SpirvError::TooSmall {
                needed: HEADER_WORDS,
                got: words.len(),
            });
        }
        if words[0] != MAGIC {
            return Err(SpirvError::BadMagic(words[0]));
        }
        let header = Header {
            version: words[1],
            generator: words[2],
            bound: words[3],
            schema: words[4],
        };

        let mut module = Module::empty(header);
        let mut reader = Reader {
            words,
            pos: HEADER_WORDS,
        };
        let mut section = Section::Capability;
        let mut current_fn: Option<Function> = None;
        let mut current_block: Option<Block> = None;
        // OpLine/OpNoLine seen between OpFunction and the first OpLabel.
        let mut pending_lines: Vec<Instruction> = Vec::new();

        while let Some(next) = reader.next() {
            let (at_word, inst) = next?;
            let opcode = inst.opcode;

            if let Some(func) = current_fn.as_mut() {
                if let Some(block) = current_block.as_mut() {
                    let terminates = inst.is_terminator();
                    block.instructions.push(inst);
                    if terminates {
                        if let Some(done) = current_block.take() {
                            func.blocks.push(done);
                        }
                    }
                    continue;
                }
                match opcode {
                    op::FUNCTION_PARAMETER if func.blocks.is_empty() => func.params.push(inst),
                    op::LABEL => {
                        let label = inst.operand(0).ok_or(SpirvError::Layout {
                            at_word,
                            opcode,
                            reason: "OpLabel without result id",
                        })?;
                        current_block = Some(Block {
                            label,
                            instructions: std::mem::take(&mut pending_lines),
                        });
                    }
                    op::LINE | op::NO_LINE => pending_lines.push(inst),
                    op::FUNCTION_END => {
                        if !pending_lines.is_empty() {
                            return Err(SpirvError::Layout {
                                at_word,
                                opcode,
                                reason: "debug line info before OpFunctionEnd",
                            });
                        }
                        if let Some(done) = current_fn.take() {
                            module.functions.push(done);
                        }
                    }
                    _ => {
                        return Err(SpirvError::Layout {
                            at_word,
                            opcode,
                            reason: "expected OpLabel, OpFunctionParameter or OpFunctionEnd",
                        })
                    }
                }
                continue;
            }

            if opcode == op::FUNCTION {
                current_fn = Some(Function {
                    def: inst,
                    params: Vec::new(),
                    blocks: Vec::new(),
                });
                continue;
            }
            if !module.functions.is_empty() {
                return Err(SpirvError::Layout {
                    at_word,
                    opcode,
                    reason: "module-scope instruction after the first function",
                });
            }

            let target = section_of(opcode);
            // Line info and non-semantic instructions may interleave with types.
            let flexible = matches!(opcode, op::LINE | op::NO_LINE | op::EXT_INST | op::UNDEF);
            if target < section && !(flexible && section == Section::TypesValues) {
                return Err(SpirvError::Layout {
                    at_word,
                    opcode,
                    reason: "instruction appears after a later logical section",
                });
            }
            section = if flexible { section.max(Section::TypesValues) } else { target };
            match target {
                Section::Capability => module.capabilities.push(inst),
                Section::Extension => module.extensions.push(inst),
                Section::ExtInstImport => module.ext_inst_imports.push(inst),
                Section::MemoryModel => {
                    if module.memory_model.is_some() {
                        return Err(SpirvError::Layout {
                            at_word,
                            opcode,
                            reason: "duplicate OpMemoryModel",
                        });
                    }
                    module.memory_model = Some(inst);
                }
                Section::EntryPoint => module.entry_points.push(inst),
                Section::ExecutionMode => module.execution_modes.push(inst),
                Section::DebugSource => module.debug_source.push(inst),
                Section::DebugName => module.debug_names.push(inst),
                Section::Annotation => module.annotations.push(inst),
                Section::TypesValues => module.types_values.push(inst),
            }
        }

        if current_fn.is_some() || current_block.is_some() {
            return Err(SpirvError::Layout {
                at_word: words.len(),
                opcode: op::FUNCTION_END,
                reason: "module ends inside a function",
            });
        }
        Ok(module)
    }

    /// Parses a module from bytes, accepting either endianness.
    pub fn parse_bytes(bytes: &[u8]) -> Result<Module, SpirvError> {
        if bytes.len() % 4 != 0 {
            return Err(SpirvError::UnalignedBytes(bytes.len()));
        }
        let mut words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        if words.first() == Some(&MAGIC.swap_bytes()) {
            for word in &mut words {
                *word = word.swap_bytes();
            }
        }
        Module::parse(&words)
    }

    /// An empty module with the given header. Mostly useful for building fixtures.
    pub fn empty(header: Header) -> Module {
        Module {
            header,
            capabilities: Vec::new(),
            extensions: Vec::new(),
            ext_inst_imports: Vec::new(),
            memory_model: None,
            entry_points: Vec::new(),
            execution_modes: Vec::new(),
            debug_source: Vec::new(),
            debug_names: Vec::new(),
            annotations: Vec::new(),
            types_values: Vec::new(),
            functions: Vec::new(),
        }
    }

    fn module_scope(&self) -> impl Iterator<Item = &Instruction> {
        self.capabilities
            .iter()
            .chain(&self.extensions)
            .chain(&self.ext_inst_imports)
            .chain(self.memory_model.iter())
            .chain(&self.entry_points)
            .chain(&self.execution_modes)
            .chain(&self.debug_source)
            .chain(&self.debug_names)
            .chain(&self.annotations)
            .chain(&self.types_values)
    }

    /// Serializes the module back to words.
    pub fn to_words(&self) -> Result<Vec<u32>, SpirvError> {
        let mut out = Vec::with_capacity(self.word_len());
        out.extend_from_slice(&[
            MAGIC,
            self.header.version,
            self.header.generator,
            self.header.bound,
            self.header.schema,
        ]);
        for inst in self.module_scope() {
            inst.encode_into(&mut out)?;
        }
        for func in &self.functions {
            func.def.encode_into(&mut out)?;
            for param in &func.params {
                param.encode_into(&mut out)?;
            }
            for block in &func.blocks {
                Instruction::new(op::LABEL, vec![block.label]).encode_into(&mut out)?;
                for inst in &block.instructions {
                    inst.encode_into(&mut out)?;
                }
            }
            Instruction::new(op::FUNCTION_END, Vec::new()).encode_into(&mut out)?;
        }
        Ok(out)
    }

    /// Serialized length in words.
    pub fn word_len(&self) -> usize {
        let scope: usize = self.module_scope().map(Instruction::word_count).sum();
        let funcs: usize = self
            .functions
            .iter()
            .map(|func| {
                func.def.word_count()
                    + func.params.iter().map(Instruction::word_count).sum::<usize>()
                    + func
                        .blocks
                        .iter()
                        .map(|b| 2 + b.instructions.iter().map(Instruction::word_count).sum::<usize>())
                        .sum::<usize>()
                    + 1
            })
            .sum();
        HEADER_WORDS + scope + funcs
    }

    /// Word offsets of every function-body instruction in the serialized module.
    pub fn instruction_offsets(&self) -> InstructionOffsets {
        let mut pos = HEADER_WORDS + self.module_scope().map(Instruction::word_count).sum::<usize>();
        let mut out = Vec::with_capacity(self.functions.len());
        for func in &self.functions {
            pos += func.def.word_count();
            pos += func.params.iter().map(Instruction::word_count).sum::<usize>();
            let mut blocks = Vec::with_capacity(func.blocks.len());
            for block in &func.blocks {
                pos += 2; // OpLabel
                let mut offsets = Vec::with_capacity(block.instructions.len());
                for inst in &block.instructions {
                    offsets.push(pos);
                    pos += inst.word_count();
                }
                blocks.push(offsets);
            }
            pos += 1; // OpFunctionEnd
            out.push(blocks);
        }
        out
    }

    /// Returns `(execution_model, function_id, name)` for each entry point.
    pub fn entry_point_infos(&self) -> Vec<(u32, u32, String)> {
        self.entry_points
            .iter()
            .filter_map(|ep| {
                let model = ep.operand(0)?;
                let func = ep.operand(1)?;
                let (name, _) = decode_literal_string(ep.operands.get(2..)?, 0).ok()?;
                Some((model, func, name))
            })
            .collect()
    }

    /// Module-scope instruction defining `id`, if any.
    pub fn global_def(&self, id: u32) -> Option<&Instruction> {
        self.types_values
            .iter()
            .chain(&self.ext_inst_imports)
            .chain(&self.debug_source)
            .find(|inst| inst.result_id() == Some(id))
    }

    /// Decoration operands (after the decoration number) for `decoration` on `id`.
    pub fn decoration(&self, id: u32, decoration: u32) -> Option<&[u32]> {
        self.annotations.iter().find_map(|inst| {
            (inst.opcode == op::DECORATE
                && inst.operand(0) == Some(id)
                && inst.operand(1) == Some(decoration))
            .then(|| inst.operands.get(2..).unwrap_or(&[]))
        })
    }

    pub fn has_decoration(&self, id: u32, decoration: u32) -> bool {
        self.decoration(id, decoration).is_some()
    }

    /// Decoration operands for `decoration` on member `member` of struct `id`.
    pub fn member_decoration(&self, id: u32, member: u32, decoration: u32) -> Option<&[u32]> {
        self.annotations.iter().find_map(|inst| {
            (inst.opcode == op::MEMBER_DECORATE
                && inst.operand(0) == Some(id)
                && inst.operand(1) == Some(member)
                && inst.operand(2) == Some(decoration))
            .then(|| inst.operands.get(3..).unwrap_or(&[]))
        })
    }

    /// Debug name attached with `OpName`.
    pub fn debug_name(&self, id: u32) -> Option<String> {
        self.debug_names.iter().find_map(|inst| {
            if inst.opcode != op::NAME || inst.operand(0) != Some(id) {
                return None;
            }
            decode_literal_string(inst.operands.get(1..)?, 0)
                .ok()
                .map(|(s, _)| s)
        })
    }

    /// Contents of the `OpString` with result id `id`.
    pub fn string(&self, id: u32) -> Option<String> {
        self.debug_source.iter().find_map(|inst| {
            if inst.opcode != op::STRING || inst.operand(0) != Some(id) {
                return None;
            }
            decode_literal_string(inst.operands.get(1..)?, 0)
                .ok()
                .map(|(s, _)| s)
        })
    }

    /// Result id of the `OpExtInstImport` named `name`.
    pub fn ext_inst_import(&self, name: &str) -> Option<u32> {
        self.ext_inst_imports.iter().find_map(|inst| {
            let (import, _) = decode_literal_string(inst.operands.get(1..)?, 0).ok()?;
            (import == name).then(|| inst.operand(0)).flatten()
        })
    }

    pub fn has_capability(&self, capability: u32) -> bool {
        self.capabilities
            .iter()
            .any(|inst| inst.operand(0) == Some(capability))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::encode_literal_string;

    fn minimal_compute() -> Vec<u32> {
        let mut words = vec![MAGIC, version(1, 0), 0, 5, 0];
        let mut push = |inst: Instruction| inst.encode_into(&mut words).unwrap();
        push(Instruction::new(op::CAPABILITY, vec![op::capability::SHADER]));
        push(Instruction::new(op::MEMORY_MODEL, vec![0, 1]));
        let mut ep = vec![op::execution_model::GL_COMPUTE, 3];
        ep.extend(encode_literal_string("main"));
        push(Instruction::new(op::ENTRY_POINT, ep));
        push(Instruction::new(op::TYPE_VOID, vec![1]));
        push(Instruction::new(op::TYPE_FUNCTION, vec![2, 1]));
        push(Instruction::new(op::FUNCTION, vec![1, 3, 0, 2]));
        push(Instruction::new(op::LABEL, vec![4]));
        push(Instruction::new(op::RETURN, vec![]));
        push(Instruction::new(op::FUNCTION_END, vec![]));
        words
    }

    #[test]
    fn parse_and_serialize_roundtrip_exactly() {
        let words = minimal_compute();
        let module = Module::parse(&words).unwrap();
        assert_eq!(module.capabilities.len(), 1);
        assert_eq!(module.types_values.len(), 2);
        assert_eq!(module.functions.len(), 1);
        assert_eq!(module.functions[0].blocks[0].label, 4);
        assert_eq!(module.to_words().unwrap(), words);
        assert_eq!(module.word_len(), words.len());
    }

    #[test]
    fn entry_point_infos_decode_names() {
        let module = Module::parse(&minimal_compute()).unwrap();
        assert_eq!(
            module.entry_point_infos(),
            vec![(op::execution_model::GL_COMPUTE, 3, "main".to_string())]
        );
    }

    #[test]
    fn instruction_offsets_point_at_instruction_headers() {
        let words = minimal_compute();
        let module = Module::parse(&words).unwrap();
        let offsets = module.instruction_offsets();
        let ret = offsets[0][0][0];
        assert_eq!(words[ret] & 0xffff, u32::from(op::RETURN));
    }

    #[test]
    fn byte_swapped_input_is_accepted() {
        let words = minimal_compute();
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        let module = Module::parse_bytes(&bytes).unwrap();
        assert_eq!(module.to_words().unwrap(), words);
    }

    #[test]
    fn truncated_instruction_is_an_error() {
        let mut words = minimal_compute();
        words.pop();
        // Claim the final OpReturn needs two words.
        let last = words.len() - 1;
        words[last] = (2 << 16) | u32::from(op::RETURN);
        assert!(matches!(
            Module::parse(&words),
            Err(SpirvError::Truncated { .. })
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut words = minimal_compute();
        words[0] = 0x1234_5678;
        assert_eq!(Module::parse(&words), Err(SpirvError::BadMagic(0x1234_5678)));
    }

    #[test]
    fn zero_word_count_is_rejected() {
        let mut words = minimal_compute();
        words.push(0);
        assert!(matches!(
            Module::parse(&words),
            Err(SpirvError::ZeroWordCount { .. })
        ));
    }

    #[test]
    fn unterminated_function_is_rejected() {
        let mut words = minimal_compute();
        words.pop();
        assert!(matches!(Module::parse(&words), Err(SpirvError::Layout { .. })));
    }
}
