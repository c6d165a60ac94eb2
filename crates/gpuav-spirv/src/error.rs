use thiserror::Error;

/// Errors produced while parsing or re-encoding a SPIR-V module.
///
/// Every parse error carries the word offset at which it was detected so callers can
/// report where an untrusted blob went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpirvError {
    #[error("module too small: need at least {needed} words, got {got}")]
    TooSmall { needed: usize, got: usize },

    #[error("byte length {0} is not a multiple of 4")]
    UnalignedBytes(usize),

    #[error("bad magic number 0x{0:08x}")]
    BadMagic(u32),

    #[error("instruction at word {at_word} declares word count 0")]
    ZeroWordCount { at_word: usize },

    #[error("instruction at word {at_word} declares {declared} words but only {available} remain")]
    Truncated {
        at_word: usize,
        declared: usize,
        available: usize,
    },

    #[error("instruction {opcode} at word {at_word} is out of place: {reason}")]
    Layout {
        at_word: usize,
        opcode: u16,
        reason: &'static str,
    },

    #[error("unterminated literal string at word {at_word}")]
    UnterminatedString { at_word: usize },

    #[error("literal string at word {at_word} is not valid UTF-8")]
    InvalidUtf8 { at_word: usize },

    #[error("instruction with opcode {opcode} has {words} words, exceeding the 65535 word limit")]
    InstructionTooLong { opcode: u16, words: usize },

    #[error("id bound exhausted")]
    IdBoundExhausted,

    #[error("inconsistent module structure: {0}")]
    Structure(String),
}
