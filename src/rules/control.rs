use crate::error::TranslateError;
use crate::ir::{Instruction, Opcode, VOID_TYPE};
use crate::rules::{InstructionRule, RuleMetadata, target_operand};
use crate::sil::expr::Expr;
use crate::sil::instr::Instr;
use crate::sil::types::Typ;
use crate::translate::state::{FinallyExit, TranslationState};

/// Method exits and exception-related control transfers.
pub(crate) struct ControlRule;

impl InstructionRule for ControlRule {
    fn metadata(&self) -> RuleMetadata {
        RuleMetadata {
            id: "CONTROL",
            name: "Control transfers",
            description: "ret, throw, leave and endfinally",
        }
    }

    fn translate(
        &self,
        instruction: &Instruction,
        state: &mut TranslationState<'_>,
    ) -> Result<bool, TranslateError> {
        match instruction.opcode() {
            Opcode::Ret => {
                let return_type = &state.method().return_type;
                if return_type != VOID_TYPE {
                    let value = state.pop()?;
                    let loc = state.location();
                    state.emit(Instr::Store {
                        lvalue: TranslationState::return_var(),
                        value: value.expr,
                        typ: Typ::from_type_name(return_type),
                        loc,
                    })?;
                }
                let node = state.current_node()?;
                let exit = state.exit_node();
                state.procedure_mut().link(node, exit);
            }
            Opcode::Throw => {
                let value = state.pop()?;
                rethrow(state, Expr::Exn(Box::new(value.expr)), value.typ)?;
            }
            Opcode::Leave => {
                let target = target_operand(instruction)?;
                state.clear_stack();
                match state.regions().finally_for_leave(instruction.offset, target) {
                    Some(finally) => state.enter_finally(finally, FinallyExit::Continue(target))?,
                    None => state.jump(target)?,
                }
            }
            Opcode::Endfinally => match state.finally_exit() {
                Some(FinallyExit::Continue(target)) => {
                    state.clear_stack();
                    state.leave_finally();
                    state.jump(target)?;
                }
                Some(FinallyExit::Rethrow(exception)) => {
                    state.leave_finally();
                    rethrow(
                        state,
                        Expr::Exn(Box::new(Expr::Var(exception))),
                        Typ::from_type_name("System.Object"),
                    )?;
                }
                None => return Err(TranslateError::UnexpectedEndfinally(instruction.offset)),
            },
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Stores the exception into the return slot and routes the block to the enclosing handler.
fn rethrow(state: &mut TranslationState<'_>, exception: Expr, typ: Typ) -> Result<(), TranslateError> {
    let loc = state.location();
    state.emit(Instr::Store {
        lvalue: TranslationState::return_var(),
        value: exception,
        typ,
        loc,
    })?;
    let node = state.current_node()?;
    let destination = state.exception_destination()?;
    state.procedure_mut().link(node, destination);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Operand;
    use crate::rules::testing::{DECLARING_TYPE, body, instruction, method, procedure};

    #[test]
    fn ret_stores_value_and_links_to_exit() {
        let method = method("System.Int32", &[]);
        let body = body(
            &[],
            vec![
                instruction(0, "ldc.i4.1", Operand::None),
                instruction(1, "ret", Operand::None),
            ],
        );
        let mut state = TranslationState::new(DECLARING_TYPE, &method, &body, procedure());
        let start = state.procedure_mut().start();
        state.seed(start);
        let rules = crate::rules::RuleSet::standard();
        for instruction in &body.instructions {
            let pending = state.next_pending().expect("pending instruction");
            state.resume(pending);
            assert!(rules.translate(instruction, &mut state).expect("translate"));
        }
        assert!(state.next_pending().is_none());

        let procedure = state.into_procedure();
        let exit = procedure.exit();
        let returning = procedure
            .nodes()
            .iter()
            .find(|node| node.succs.contains(&exit))
            .expect("returning node");
        assert_eq!(returning.instrs.len(), 1);
        assert_eq!(returning.instrs[0].to_string(), "*&return:int=1 [line 1]");
    }

    #[test]
    fn endfinally_outside_finally_is_an_error() {
        let method = method("System.Void", &[]);
        let body = body(&[], vec![instruction(0, "endfinally", Operand::None)]);
        let mut state = TranslationState::new(DECLARING_TYPE, &method, &body, procedure());
        let start = state.procedure_mut().start();
        state.seed(start);
        let pending = state.next_pending().expect("seeded entry");
        state.resume(pending);

        let result = ControlRule.translate(&body.instructions[0], &mut state);

        assert_eq!(result, Err(TranslateError::UnexpectedEndfinally(0)));
    }
}
