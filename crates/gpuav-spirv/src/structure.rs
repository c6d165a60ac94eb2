//! Cheap structural consistency checks.
//!
//! This is not a validator. It catches the mistakes a rewriting pass can make
//! (duplicate ids, ids past the bound, dangling branch targets, stale `OpPhi`
//! parents) so a broken rewrite can be discarded instead of handed to a driver.

use std::collections::{HashMap, HashSet};

use crate::error::SpirvError;
use crate::instruction::Instruction;
use crate::module::{Function, Module};
use crate::op;

fn structure(reason: String) -> SpirvError {
    SpirvError::Structure(reason)
}

/// Branch targets named by a terminator.
pub fn successors(module: &Module, terminator: &Instruction) -> Vec<u32> {
    match terminator.opcode {
        op::BRANCH => terminator.operands.first().copied().into_iter().collect(),
        op::BRANCH_CONDITIONAL => terminator.operands.get(1..3).unwrap_or(&[]).to_vec(),
        op::SWITCH => {
            let Some(&selector) = terminator.operands.first() else {
                return Vec::new();
            };
            let literal_words = if selector_is_64_bit(module, selector) { 2 } else { 1 };
            let mut targets: Vec<u32> = terminator.operands.get(1).copied().into_iter().collect();
            let mut rest = terminator.operands.get(2..).unwrap_or(&[]);
            while rest.len() > literal_words {
                targets.push(rest[literal_words]);
                rest = &rest[literal_words + 1..];
            }
            targets
        }
        _ => Vec::new(),
    }
}

fn selector_is_64_bit(module: &Module, selector: u32) -> bool {
    let ty = module
        .global_def(selector)
        .and_then(Instruction::result_type)
        .or_else(|| {
            module.functions.iter().find_map(|f| {
                f.blocks
                    .iter()
                    .flat_map(|b| &b.instructions)
                    .find(|inst| inst.result_id() == Some(selector))
                    .and_then(Instruction::result_type)
            })
        });
    ty.and_then(|ty| module.type_def(ty))
        .is_some_and(|def| def.opcode == op::TYPE_INT && def.operand(1) == Some(64))
}

fn check_function(module: &Module, func: &Function) -> Result<(), SpirvError> {
    let fid = func.id();
    let labels: HashSet<u32> = func.blocks.iter().map(|b| b.label).collect();
    if labels.len() != func.blocks.len() {
        return Err(structure(format!("function %{fid} has duplicate block labels")));
    }

    let mut preds: HashMap<u32, HashSet<u32>> = HashMap::new();
    for block in &func.blocks {
        let Some((last, body)) = block.instructions.split_last() else {
            return Err(structure(format!("block %{} is empty", block.label)));
        };
        if !last.is_terminator() {
            return Err(structure(format!(
                "block %{} does not end with a terminator",
                block.label
            )));
        }
        if body.iter().any(Instruction::is_terminator) {
            return Err(structure(format!(
                "block %{} has a terminator before its end",
                block.label
            )));
        }
        for target in successors(module, last) {
            if !labels.contains(&target) {
                return Err(structure(format!(
                    "block %{} branches to %{target}, which is not a block of function %{fid}",
                    block.label
                )));
            }
            preds.entry(target).or_default().insert(block.label);
        }
    }

    for block in &func.blocks {
        let block_preds = preds.get(&block.label);
        for phi in block.instructions.iter().filter(|i| i.opcode == op::PHI) {
            for pair in phi.operands.get(2..).unwrap_or(&[]).chunks(2) {
                let [_, parent] = pair else {
                    return Err(structure(format!("malformed OpPhi in block %{}", block.label)));
                };
                if !block_preds.is_some_and(|p| p.contains(parent)) {
                    return Err(structure(format!(
                        "OpPhi in block %{} names %{parent}, which is not a predecessor",
                        block.label
                    )));
                }
            }
        }
    }
    Ok(())
}

impl Module {
    /// Verifies id uniqueness, the id bound and control-flow references.
    pub fn check_structure(&self) -> Result<(), SpirvError> {
        let bound = self.header.bound;
        let mut seen = HashSet::new();
        let mut define = |id: u32| -> Result<(), SpirvError> {
            if id == 0 || id >= bound {
                return Err(structure(format!("result id %{id} outside bound {bound}")));
            }
            if !seen.insert(id) {
                return Err(structure(format!("result id %{id} defined twice")));
            }
            Ok(())
        };

        let module_scope = self
            .ext_inst_imports
            .iter()
            .chain(&self.debug_source)
            .chain(&self.annotations)
            .chain(&self.types_values);
        for inst in module_scope {
            if let Some(id) = inst.result_id() {
                define(id)?;
            }
        }
        for func in &self.functions {
            define(func.id())?;
            for param in &func.params {
                if let Some(id) = param.result_id() {
                    define(id)?;
                }
            }
            for block in &func.blocks {
                define(block.label)?;
                for inst in &block.instructions {
                    if let Some(id) = inst.result_id() {
                        define(id)?;
                    }
                }
            }
        }

        for func in &self.functions {
            check_function(self, func)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{version, Block, Header};

    fn func_with_blocks(blocks: Vec<Block>) -> Module {
        let mut m = Module::empty(Header {
            version: version(1, 0),
            generator: 0,
            bound: 20,
            schema: 0,
        });
        m.types_values.push(Instruction::new(op::TYPE_VOID, vec![1]));
        m.types_values.push(Instruction::new(op::TYPE_FUNCTION, vec![2, 1]));
        m.types_values.push(Instruction::new(op::TYPE_BOOL, vec![3]));
        m.types_values.push(Instruction::new(op::CONSTANT_TRUE, vec![3, 4]));
        m.functions.push(Function {
            def: Instruction::new(op::FUNCTION, vec![1, 5, 0, 2]),
            params: Vec::new(),
            blocks,
        });
        m
    }

    #[test]
    fn well_formed_diamond_passes() {
        let m = func_with_blocks(vec![
            Block {
                label: 10,
                instructions: vec![
                    Instruction::new(op::SELECTION_MERGE, vec![13, 0]),
                    Instruction::new(op::BRANCH_CONDITIONAL, vec![4, 11, 12]),
                ],
            },
            Block {
                label: 11,
                instructions: vec![Instruction::new(op::BRANCH, vec![13])],
            },
            Block {
                label: 12,
                instructions: vec![Instruction::new(op::BRANCH, vec![13])],
            },
            Block {
                label: 13,
                instructions: vec![
                    Instruction::new(op::PHI, vec![3, 14, 4, 11, 4, 12]),
                    Instruction::new(op::RETURN, vec![]),
                ],
            },
        ]);
        m.check_structure().unwrap();
    }

    #[test]
    fn stale_phi_parent_is_caught() {
        let m = func_with_blocks(vec![
            Block {
                label: 10,
                instructions: vec![Instruction::new(op::BRANCH, vec![11])],
            },
            Block {
                label: 11,
                instructions: vec![
                    Instruction::new(op::PHI, vec![3, 14, 4, 12]),
                    Instruction::new(op::RETURN, vec![]),
                ],
            },
        ]);
        assert!(matches!(m.check_structure(), Err(SpirvError::Structure(_))));
    }

    #[test]
    fn duplicate_ids_and_out_of_bound_ids_are_caught() {
        let mut m = func_with_blocks(vec![Block {
            label: 10,
            instructions: vec![Instruction::new(op::RETURN, vec![])],
        }]);
        m.types_values.push(Instruction::new(op::TYPE_BOOL, vec![3]));
        assert!(m.check_structure().is_err());

        let mut m = func_with_blocks(vec![Block {
            label: 25,
            instructions: vec![Instruction::new(op::RETURN, vec![])],
        }]);
        assert!(m.check_structure().is_err());
        m.header.bound = 26;
        m.check_structure().unwrap();
    }

    #[test]
    fn dangling_branch_is_caught() {
        let m = func_with_blocks(vec![Block {
            label: 10,
            instructions: vec![Instruction::new(op::BRANCH, vec![99])],
        }]);
        assert!(m.check_structure().is_err());
    }
}
