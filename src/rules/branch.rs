use crate::error::TranslateError;
use crate::ir::{Instruction, Opcode, Operand};
use crate::rules::{InstructionRule, RuleMetadata, target_operand};
use crate::sil::expr::{BinopKind, Expr};
use crate::sil::instr::IfKind;
use crate::translate::state::{StackValue, TranslationState};

/// Unconditional, conditional and multi-way branches.
pub(crate) struct BranchRule;

impl InstructionRule for BranchRule {
    fn metadata(&self) -> RuleMetadata {
        RuleMetadata {
            id: "BRANCH",
            name: "Branches",
            description: "br, brtrue, brfalse, compare-and-branch and switch",
        }
    }

    fn translate(
        &self,
        instruction: &Instruction,
        state: &mut TranslationState<'_>,
    ) -> Result<bool, TranslateError> {
        match instruction.opcode() {
            Opcode::Br => state.jump(target_operand(instruction)?)?,
            Opcode::Brtrue => {
                let value = state.pop()?;
                two_way(state, truthy(value, true), target_operand(instruction)?)?;
            }
            Opcode::Brfalse => {
                let value = state.pop()?;
                two_way(state, truthy(value, false), target_operand(instruction)?)?;
            }
            Opcode::BranchCompare(op) => {
                let right = state.pop()?;
                let left = state.pop()?;
                let cond = Expr::binop(op, left.expr, right.expr);
                two_way(state, cond, target_operand(instruction)?)?;
            }
            Opcode::Switch => {
                let Operand::Targets(targets) = &instruction.operand else {
                    return Err(TranslateError::MissingOperand {
                        opcode: instruction.opcode.clone(),
                        expected: "switch targets",
                        offset: instruction.offset,
                    });
                };
                let value = state.pop()?;
                switch(state, value, targets)?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Condition under which `brtrue` (`taken_when == true`) or `brfalse` jumps. References are
/// compared against null.
fn truthy(value: StackValue, taken_when: bool) -> Expr {
    if value.typ.is_pointer() {
        let op = if taken_when { BinopKind::Ne } else { BinopKind::Eq };
        Expr::binop(op, value.expr, Expr::null())
    } else if taken_when {
        value.expr
    } else {
        Expr::not(value.expr)
    }
}

/// Splits the current block into a taken and a not-taken prune node.
fn two_way(state: &mut TranslationState<'_>, cond: Expr, target: u32) -> Result<(), TranslateError> {
    let next = state.next_offset(state.offset())?;
    let from = state.current_node()?;
    let taken = state.prune_node(from, cond.clone(), true, IfKind::If)?;
    let not_taken = state.prune_node(from, Expr::not(cond), false, IfKind::If)?;
    state.branch_from(not_taken, next);
    state.branch_from(taken, target);
    Ok(())
}

/// One prune pair per case, chained through the not-taken nodes; the default case follows
/// the last of them.
fn switch(
    state: &mut TranslationState<'_>,
    value: StackValue,
    targets: &[u32],
) -> Result<(), TranslateError> {
    let next = state.next_offset(state.offset())?;
    let mut from = state.current_node()?;
    let mut cases = Vec::with_capacity(targets.len());
    for (case, target) in targets.iter().enumerate() {
        let cond = Expr::binop(BinopKind::Eq, value.expr.clone(), Expr::int(case as i64));
        let taken = state.prune_node(from, cond.clone(), true, IfKind::Switch)?;
        from = state.prune_node(from, Expr::not(cond), false, IfKind::Switch)?;
        cases.push((taken, *target));
    }
    state.branch_from(from, next);
    for (taken, target) in cases.into_iter().rev() {
        state.branch_from(taken, target);
    }
    Ok(())
}
