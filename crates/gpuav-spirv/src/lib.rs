//! A safe SPIR-V module parser, editor and serializer.
//!
//! Shader binaries handed to the validation layer are **untrusted**: this crate parses them
//! without panicking or reading out of bounds, splits them into the logical layout sections
//! so rewriting passes can insert declarations in the right place, and serializes the
//! result back to words.
//!
//! The IR is deliberately thin. Instructions keep their raw operand words, so opcodes this
//! crate knows nothing about survive a parse/serialize round trip unchanged.

#![forbid(unsafe_code)]

mod builder;
mod error;
mod instruction;
mod module;
/// Opcode numbers and enumerant values.
pub mod op;
mod structure;

/// Helpers for assembling synthetic SPIR-V modules in tests.
///
/// Only available for this crate's own tests or with the `test-utils` feature. Not part
/// of the stable API.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use crate::error::SpirvError;
pub use crate::instruction::{decode_literal_string, encode_literal_string, Instruction};
pub use crate::module::{
    version, Block, Function, Header, InstructionOffsets, Module, HEADER_WORDS, MAGIC,
};
pub use crate::structure::successors;
