use crate::error::TranslateError;
use crate::ir::{FieldRef, Instruction, Opcode};
use crate::rules::{InstructionRule, RuleMetadata, field_operand};
use crate::sil::expr::{Expr, Pvar};
use crate::sil::instr::Instr;
use crate::sil::types::{FieldIdent, Typ};
use crate::translate::state::TranslationState;

/// Instance and static field access.
pub(crate) struct FieldRule;

impl InstructionRule for FieldRule {
    fn metadata(&self) -> RuleMetadata {
        RuleMetadata {
            id: "FIELD",
            name: "Field access",
            description: "ldfld, stfld, ldsfld and stsfld",
        }
    }

    fn translate(
        &self,
        instruction: &Instruction,
        state: &mut TranslationState<'_>,
    ) -> Result<bool, TranslateError> {
        let opcode = instruction.opcode();
        if !matches!(
            opcode,
            Opcode::Ldfld | Opcode::Stfld | Opcode::Ldsfld | Opcode::Stsfld
        ) {
            return Ok(false);
        }
        let field = field_operand(instruction)?;
        let field_type = Typ::from_type_name(&field.field_type);
        let loc = state.location();

        match opcode {
            Opcode::Ldfld | Opcode::Ldsfld => {
                let base = if opcode == Opcode::Ldfld {
                    state.pop()?.expr
                } else {
                    static_base(field)
                };
                let id = state.fresh_ident();
                state.emit(Instr::Load {
                    id,
                    lvalue: field_address(base, field),
                    typ: field_type.clone(),
                    loc,
                })?;
                state.push(Expr::Var(id), field_type);
            }
            _ => {
                let value = state.pop()?;
                let base = if opcode == Opcode::Stfld {
                    state.pop()?.expr
                } else {
                    static_base(field)
                };
                state.emit(Instr::Store {
                    lvalue: field_address(base, field),
                    value: value.expr,
                    typ: field_type,
                    loc,
                })?;
            }
        }
        state.fall_through()?;
        Ok(true)
    }
}

/// Static fields live on a global named after the declaring type.
fn static_base(field: &FieldRef) -> Expr {
    Expr::Lvar(Pvar::global(field.declaring_type.as_str()))
}

pub(crate) fn field_address(base: Expr, field: &FieldRef) -> Expr {
    Expr::field(
        base,
        FieldIdent::new(field.full_name(), Typ::from_type_name(&field.field_type)),
        Typ::Struct(field.declaring_type.clone()),
    )
}
