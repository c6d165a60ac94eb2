use core::fmt;

use crate::error::SpirvError;
use crate::op::{self, ResultLayout};

/// One SPIR-V instruction: opcode plus every operand word that follows the
/// `word_count | opcode` header word.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub opcode: u16,
    pub operands: Vec<u32>,
}

impl Instruction {
    pub fn new(opcode: u16, operands: Vec<u32>) -> Self {
        Self { opcode, operands }
    }

    /// Total encoded length in words, including the header word.
    pub fn word_count(&self) -> usize {
        1 + self.operands.len()
    }

    pub fn operand(&self, index: usize) -> Option<u32> {
        self.operands.get(index).copied()
    }

    pub fn result_id(&self) -> Option<u32> {
        match op::result_layout(self.opcode) {
            ResultLayout::None => None,
            ResultLayout::Id => self.operand(0),
            ResultLayout::TypeAndId => self.operand(1),
        }
    }

    pub fn result_type(&self) -> Option<u32> {
        match op::result_layout(self.opcode) {
            ResultLayout::TypeAndId => self.operand(0),
            _ => None,
        }
    }

    /// Mutable access to the result id slot, if the opcode has one.
    pub fn result_id_mut(&mut self) -> Option<&mut u32> {
        match op::result_layout(self.opcode) {
            ResultLayout::None => None,
            ResultLayout::Id => self.operands.get_mut(0),
            ResultLayout::TypeAndId => self.operands.get_mut(1),
        }
    }

    /// Operands that follow the result type / result id slots.
    pub fn args(&self) -> &[u32] {
        let skip = match op::result_layout(self.opcode) {
            ResultLayout::None => 0,
            ResultLayout::Id => 1,
            ResultLayout::TypeAndId => 2,
        };
        self.operands.get(skip..).unwrap_or(&[])
    }

    pub fn is_terminator(&self) -> bool {
        op::is_terminator(self.opcode)
    }

    /// Appends the binary encoding of this instruction to `out`.
    pub fn encode_into(&self, out: &mut Vec<u32>) -> Result<(), SpirvError> {
        let words = self.word_count();
        if words > u16::MAX as usize {
            return Err(SpirvError::InstructionTooLong {
                opcode: self.opcode,
                words,
            });
        }
        out.push(((words as u32) << 16) | u32::from(self.opcode));
        out.extend_from_slice(&self.operands);
        Ok(())
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Op#{}", self.opcode)?;
        f.debug_list().entries(self.operands.iter()).finish()
    }
}

/// Encodes `s` as a nul-terminated, zero-padded SPIR-V literal string.
pub fn encode_literal_string(s: &str) -> Vec<u32> {
    let bytes = s.as_bytes();
    let mut words = Vec::with_capacity(bytes.len() / 4 + 1);
    for chunk in bytes.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        words.push(u32::from_le_bytes(word));
    }
    if bytes.len() % 4 == 0 {
        // Terminator needs its own word.
        words.push(0);
    }
    words
}

/// Decodes a literal string starting at `words[0]`.
///
/// Returns the string and the number of words it occupied. `at_word` is only used
/// for error reporting.
pub fn decode_literal_string(words: &[u32], at_word: usize) -> Result<(String, usize), SpirvError> {
    let mut bytes = Vec::new();
    for (i, word) in words.iter().enumerate() {
        for byte in word.to_le_bytes() {
            if byte == 0 {
                let s = String::from_utf8(bytes)
                    .map_err(|_| SpirvError::InvalidUtf8 { at_word })?;
                return Ok((s, i + 1));
            }
            bytes.push(byte);
        }
    }
    Err(SpirvError::UnterminatedString { at_word })
}
