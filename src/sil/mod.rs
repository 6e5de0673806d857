//! Three-address, heap-explicit intermediate language consumed by the analyzer.

pub(crate) mod expr;
pub(crate) mod instr;
pub(crate) mod types;
