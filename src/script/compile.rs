//! Flattening pass: block-structured AST -> jump-addressed instruction list.
//!
//! `if`/`while` become `JumpIfFalse`/`Jump`, labels become plain positions,
//! so every statement has a stable index the runner can checkpoint and
//! resume at.

use std::collections::HashMap;

use super::ast::{Instruction, Program, Statement};
use super::ScriptError;

struct Flattener {
    instructions: Vec<Instruction>,
    labels: HashMap<String, usize>,
    /// (instruction index, label) pairs needing patching once all labels are known
    gotos: Vec<(usize, String)>,
}

impl Flattener {
    fn new() -> Self {
        Self {
            instructions: Vec::new(),
            labels: HashMap::new(),
            gotos: Vec::new(),
        }
    }

    fn emit_block(&mut self, statements: &[Statement]) -> Result<(), ScriptError> {
        for statement in statements {
            self.emit_statement(statement)?;
        }
        Ok(())
    }

    fn emit_statement(&mut self, statement: &Statement) -> Result<(), ScriptError> {
        match statement {
            Statement::Assign { target, expr } => {
                self.instructions.push(Instruction::Assign {
                    target: target.clone(),
                    expr: expr.clone(),
                });
            }
            Statement::Invoke {
                target,
                module,
                function,
                args,
            } => {
                self.instructions.push(Instruction::Invoke {
                    target: target.clone(),
                    module: module.clone(),
                    function: function.clone(),
                    args: args.clone(),
                });
            }
            Statement::Builtin { builtin, msg } => {
                self.instructions.push(Instruction::Builtin {
                    builtin: *builtin,
                    msg: msg.clone(),
                });
            }
            Statement::If {
                cond,
                then_block,
                else_block,
            } => {
                let branch_at = self.instructions.len();
                // Placeholder dest, patched below
                self.instructions.push(Instruction::JumpIfFalse {
                    cond: cond.clone(),
                    dest: 0,
                });
                self.emit_block(then_block)?;

                if else_block.is_empty() {
                    let after = self.instructions.len();
                    self.patch_jump(branch_at, after);
                } else {
                    let skip_else_at = self.instructions.len();
                    self.instructions.push(Instruction::Jump { dest: 0 });
                    let else_start = self.instructions.len();
                    self.patch_jump(branch_at, else_start);
                    self.emit_block(else_block)?;
                    let after = self.instructions.len();
                    self.patch_jump(skip_else_at, after);
                }
            }
            Statement::While { cond, body } => {
                let loop_start = self.instructions.len();
                let branch_at = self.instructions.len();
                self.instructions.push(Instruction::JumpIfFalse {
                    cond: cond.clone(),
                    dest: 0,
                });
                self.emit_block(body)?;
                self.instructions.push(Instruction::Jump { dest: loop_start });
                let after = self.instructions.len();
                self.patch_jump(branch_at, after);
            }
            Statement::Label(name) => {
                if self
                    .labels
                    .insert(name.clone(), self.instructions.len())
                    .is_some()
                {
                    return Err(ScriptError::new(format!("duplicate label '{}'", name)));
                }
            }
            Statement::Goto(name) => {
                let at = self.instructions.len();
                self.instructions.push(Instruction::Jump { dest: 0 });
                self.gotos.push((at, name.clone()));
            }
        }
        Ok(())
    }

    fn patch_jump(&mut self, at: usize, dest: usize) {
        match &mut self.instructions[at] {
            Instruction::Jump { dest: slot } | Instruction::JumpIfFalse { dest: slot, .. } => {
                *slot = dest;
            }
            _ => unreachable!("patch target is not a jump"),
        }
    }

    fn finish(mut self) -> Result<Program, ScriptError> {
        let gotos = std::mem::take(&mut self.gotos);
        for (at, label) in gotos {
            let dest = *self
                .labels
                .get(&label)
                .ok_or_else(|| ScriptError::new(format!("goto to undefined label '{}'", label)))?;
            self.patch_jump(at, dest);
        }
        Ok(Program {
            instructions: self.instructions,
        })
    }
}

/// Flatten a parsed script into an executable program
pub fn flatten(statements: &[Statement]) -> Result<Program, ScriptError> {
    let mut flattener = Flattener::new();
    flattener.emit_block(statements)?;
    flattener.finish()
}
