use crate::error::TranslateError;
use crate::ir::{FieldRef, Instruction, MethodRef, Operand};
use crate::translate::state::TranslationState;

pub(crate) mod branch;
pub(crate) mod call;
pub(crate) mod control;
pub(crate) mod field;
pub(crate) mod stack;

/// Metadata describing a translation rule.
#[derive(Clone, Debug)]
pub(crate) struct RuleMetadata {
    pub(crate) id: &'static str,
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
}

/// Translates one family of opcodes into SIL.
///
/// `translate` returns `Ok(false)` without touching the state when the opcode is not one the
/// rule covers.
pub(crate) trait InstructionRule {
    fn metadata(&self) -> RuleMetadata;
    fn translate(
        &self,
        instruction: &Instruction,
        state: &mut TranslationState<'_>,
    ) -> Result<bool, TranslateError>;
}

/// Ordered rule list; the first rule accepting an instruction wins.
pub(crate) struct RuleSet {
    rules: Vec<Box<dyn InstructionRule>>,
}

impl RuleSet {
    pub(crate) fn new(rules: Vec<Box<dyn InstructionRule>>) -> Self {
        Self { rules }
    }

    pub(crate) fn standard() -> Self {
        Self::new(vec![
            Box::new(stack::StackRule),
            Box::new(branch::BranchRule),
            Box::new(call::CallRule),
            Box::new(field::FieldRule),
            Box::new(control::ControlRule),
        ])
    }

    pub(crate) fn metadata(&self) -> Vec<RuleMetadata> {
        self.rules.iter().map(|rule| rule.metadata()).collect()
    }

    pub(crate) fn translate(
        &self,
        instruction: &Instruction,
        state: &mut TranslationState<'_>,
    ) -> Result<bool, TranslateError> {
        for rule in &self.rules {
            if rule.translate(instruction, state)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn missing(instruction: &Instruction, expected: &'static str) -> TranslateError {
    TranslateError::MissingOperand {
        opcode: instruction.opcode.clone(),
        expected,
        offset: instruction.offset,
    }
}

pub(crate) fn int_operand(instruction: &Instruction) -> Result<i64, TranslateError> {
    match instruction.operand {
        Operand::Int(value) => Ok(value),
        _ => Err(missing(instruction, "integer")),
    }
}

pub(crate) fn index_operand(instruction: &Instruction) -> Result<usize, TranslateError> {
    let value = int_operand(instruction)?;
    usize::try_from(value).map_err(|_| missing(instruction, "index"))
}

pub(crate) fn target_operand(instruction: &Instruction) -> Result<u32, TranslateError> {
    match instruction.operand {
        Operand::Target(target) => Ok(target),
        _ => Err(missing(instruction, "branch target")),
    }
}

pub(crate) fn method_operand(instruction: &Instruction) -> Result<&MethodRef, TranslateError> {
    match &instruction.operand {
        Operand::Method(method) => Ok(method),
        _ => Err(missing(instruction, "method")),
    }
}

pub(crate) fn field_operand(instruction: &Instruction) -> Result<&FieldRef, TranslateError> {
    match &instruction.operand {
        Operand::Field(field) => Ok(field),
        _ => Err(missing(instruction, "field")),
    }
}
