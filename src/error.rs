use thiserror::Error;

/// Internal inconsistency hit while translating one method body.
#[derive(Debug, Error, PartialEq)]
pub(crate) enum TranslateError {
    #[error("operand stack underflow at offset {offset}")]
    StackUnderflow { offset: u32 },
    #[error("missing {expected} operand for {opcode} at offset {offset}")]
    MissingOperand {
        opcode: String,
        expected: &'static str,
        offset: u32,
    },
    #[error("no instruction at offset {0}")]
    OffsetNotFound(u32),
    #[error("index {index} out of range for {what} at offset {offset}")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        offset: u32,
    },
    #[error("endfinally outside a finally handler at offset {0}")]
    UnexpectedEndfinally(u32),
}

/// A pipeline stage was invoked before the stage it depends on.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum PipelineError {
    #[error("pipeline stage `{stage}` requires `{requires}` to run first")]
    MissingInput {
        stage: &'static str,
        requires: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_offsets() {
        assert_eq!(
            TranslateError::StackUnderflow { offset: 12 }.to_string(),
            "operand stack underflow at offset 12"
        );
        assert_eq!(
            PipelineError::MissingInput {
                stage: "cfg",
                requires: "load"
            }
            .to_string(),
            "pipeline stage `cfg` requires `load` to run first"
        );
    }
}
