use crate::error::TranslateError;
use crate::ir::{Instruction, Opcode, VOID_TYPE};
use crate::rules::{InstructionRule, RuleMetadata, method_operand};
use crate::sil::expr::Expr;
use crate::sil::instr::{CallArg, CallFlags, Instr};
use crate::sil::types::Typ;
use crate::translate::state::TranslationState;

/// Allocation builtin used for `newobj`.
pub(crate) const BUILTIN_NEW: &str = "__new";

/// Static, virtual and constructor calls.
pub(crate) struct CallRule;

impl InstructionRule for CallRule {
    fn metadata(&self) -> RuleMetadata {
        RuleMetadata {
            id: "CALL",
            name: "Calls",
            description: "call, callvirt and newobj",
        }
    }

    fn translate(
        &self,
        instruction: &Instruction,
        state: &mut TranslationState<'_>,
    ) -> Result<bool, TranslateError> {
        let opcode = instruction.opcode();
        if !matches!(opcode, Opcode::Call | Opcode::Callvirt | Opcode::Newobj) {
            return Ok(false);
        }
        let callee = method_operand(instruction)?;
        let loc = state.location();

        if opcode == Opcode::Newobj {
            let arguments = state.pop_many(callee.parameters.len())?;
            let object_type = Typ::from_type_name(&callee.declaring_type);
            let object = state.fresh_ident();
            state.emit(Instr::Call {
                ret: object,
                ret_typ: object_type.clone(),
                callee: Expr::fun(BUILTIN_NEW),
                args: vec![CallArg::new(
                    Expr::Sizeof(object_type.strip_pointer().clone()),
                    Typ::Void,
                )],
                flags: CallFlags::default(),
                loc: loc.clone(),
            })?;

            let mut args = vec![CallArg::new(Expr::Var(object), object_type.clone())];
            args.extend(
                arguments
                    .into_iter()
                    .map(|argument| CallArg::new(argument.expr, argument.typ)),
            );
            let ret = state.fresh_ident();
            state.emit(Instr::Call {
                ret,
                ret_typ: Typ::Void,
                callee: Expr::fun(callee.full_name()),
                args,
                flags: CallFlags::default(),
                loc,
            })?;
            state.push(Expr::Var(object), object_type);
        } else {
            let count = callee.parameters.len() + usize::from(callee.has_this);
            let args = state
                .pop_many(count)?
                .into_iter()
                .map(|argument| CallArg::new(argument.expr, argument.typ))
                .collect();
            let ret = state.fresh_ident();
            let ret_typ = Typ::from_type_name(&callee.return_type);
            state.emit(Instr::Call {
                ret,
                ret_typ: ret_typ.clone(),
                callee: Expr::fun(callee.full_name()),
                args,
                flags: CallFlags {
                    is_virtual: opcode == Opcode::Callvirt,
                    ..CallFlags::default()
                },
                loc,
            })?;
            if callee.return_type != VOID_TYPE {
                state.push(Expr::Var(ret), ret_typ);
            }
        }
        state.fall_through()?;
        Ok(true)
    }
}
