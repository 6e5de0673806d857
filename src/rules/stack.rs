use crate::error::TranslateError;
use crate::ir::{Instruction, Opcode, Operand};
use crate::rules::{InstructionRule, RuleMetadata, index_operand, int_operand};
use crate::sil::expr::{Const, Expr, UnopKind};
use crate::sil::instr::Instr;
use crate::sil::types::{FloatKind, IntKind, Typ};
use crate::translate::state::TranslationState;

/// Loads, stores, constants and arithmetic on the operand stack.
pub(crate) struct StackRule;

impl InstructionRule for StackRule {
    fn metadata(&self) -> RuleMetadata {
        RuleMetadata {
            id: "STACK",
            name: "Stack operations",
            description: "Argument and local access, constants, arithmetic and comparisons",
        }
    }

    fn translate(
        &self,
        instruction: &Instruction,
        state: &mut TranslationState<'_>,
    ) -> Result<bool, TranslateError> {
        match instruction.opcode() {
            Opcode::Nop => {}
            Opcode::Ldarg(index) => {
                let index = match index {
                    Some(index) => usize::from(index),
                    None => index_operand(instruction)?,
                };
                let (var, typ) = state.argument(index)?;
                load(state, var, typ)?;
            }
            Opcode::Starg => {
                let (var, typ) = state.argument(index_operand(instruction)?)?;
                store(state, var, typ)?;
            }
            Opcode::Ldloc(index) => {
                let index = match index {
                    Some(index) => usize::from(index),
                    None => index_operand(instruction)?,
                };
                let (var, typ) = state.local(index)?;
                load(state, var, typ)?;
            }
            Opcode::Stloc(index) => {
                let index = match index {
                    Some(index) => usize::from(index),
                    None => index_operand(instruction)?,
                };
                let (var, typ) = state.local(index)?;
                store(state, var, typ)?;
            }
            Opcode::LdcI4(value) => {
                let value = match value {
                    Some(value) => value,
                    None => int_operand(instruction)?,
                };
                state.push(Expr::int(value), Typ::int());
            }
            Opcode::LdcI8 => {
                state.push(Expr::int(int_operand(instruction)?), Typ::Int(IntKind::I64));
            }
            Opcode::LdcR4 | Opcode::LdcR8 => {
                let value = match instruction.operand {
                    Operand::Float(value) => value,
                    Operand::Int(value) => value as f64,
                    _ => {
                        return Err(TranslateError::MissingOperand {
                            opcode: instruction.opcode.clone(),
                            expected: "float",
                            offset: instruction.offset,
                        });
                    }
                };
                let kind = if instruction.opcode() == Opcode::LdcR4 {
                    FloatKind::Float
                } else {
                    FloatKind::Double
                };
                state.push(Expr::Const(Const::Float(value)), Typ::Float(kind));
            }
            Opcode::Ldstr => {
                let Operand::String(value) = &instruction.operand else {
                    return Err(TranslateError::MissingOperand {
                        opcode: instruction.opcode.clone(),
                        expected: "string",
                        offset: instruction.offset,
                    });
                };
                state.push(
                    Expr::Const(Const::Str(value.clone())),
                    Typ::from_type_name("System.String"),
                );
            }
            Opcode::Ldnull => {
                state.push(Expr::null(), Typ::from_type_name("System.Object"));
            }
            Opcode::Dup => {
                let top = state.peek()?.clone();
                state.push_value(top);
            }
            Opcode::Pop => {
                state.pop()?;
            }
            Opcode::Binop(op) => {
                let right = state.pop()?;
                let left = state.pop()?;
                state.push(Expr::binop(op, left.expr, right.expr), left.typ);
            }
            Opcode::Compare(op) => {
                let right = state.pop()?;
                let left = state.pop()?;
                state.push(Expr::binop(op, left.expr, right.expr), Typ::int());
            }
            Opcode::Neg | Opcode::Not => {
                let operand = state.pop()?;
                let op = if instruction.opcode() == Opcode::Neg {
                    UnopKind::Neg
                } else {
                    UnopKind::BNot
                };
                state.push(
                    Expr::Unop {
                        op,
                        expr: Box::new(operand.expr),
                    },
                    operand.typ,
                );
            }
            _ => return Ok(false),
        }
        state.fall_through()?;
        Ok(true)
    }
}

fn load(state: &mut TranslationState<'_>, var: Expr, typ: Typ) -> Result<(), TranslateError> {
    let id = state.fresh_ident();
    let loc = state.location();
    state.emit(Instr::Load {
        id,
        lvalue: var,
        typ: typ.clone(),
        loc,
    })?;
    state.push(Expr::Var(id), typ);
    Ok(())
}

fn store(state: &mut TranslationState<'_>, var: Expr, typ: Typ) -> Result<(), TranslateError> {
    let value = state.pop()?;
    let loc = state.location();
    state.emit(Instr::Store {
        lvalue: var,
        value: value.expr,
        typ,
        loc,
    })
}
