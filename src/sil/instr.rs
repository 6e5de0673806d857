use std::fmt;

use crate::sil::expr::{Expr, Ident};
use crate::sil::types::Typ;

/// Source position of an instruction; `line` is -1 when unknown.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Location {
    pub(crate) line: i64,
    pub(crate) col: i64,
    pub(crate) file: String,
}

impl Location {
    pub(crate) fn new(line: u32, file: &str) -> Self {
        Self {
            line: i64::from(line),
            col: -1,
            file: file.to_string(),
        }
    }

    pub(crate) fn unknown(file: &str) -> Self {
        Self {
            line: -1,
            col: -1,
            file: file.to_string(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}]", self.line)
    }
}

/// Syntactic origin of a prune. Branch lowering only emits `If` and `Switch`.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum IfKind {
    If,
    While,
    For,
    DoWhile,
    AndOr,
    Switch,
    BoolExpr,
}

impl IfKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            IfKind::If => "Ik_if",
            IfKind::While => "Ik_while",
            IfKind::For => "Ik_for",
            IfKind::DoWhile => "Ik_dowhile",
            IfKind::AndOr => "Ik_land_lor",
            IfKind::Switch => "Ik_switch",
            IfKind::BoolExpr => "Ik_bexp",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct CallFlags {
    pub(crate) is_virtual: bool,
    pub(crate) no_return: bool,
    pub(crate) is_block: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct CallArg {
    pub(crate) expr: Expr,
    pub(crate) typ: Typ,
}

impl CallArg {
    pub(crate) fn new(expr: Expr, typ: Typ) -> Self {
        Self { expr, typ }
    }
}

/// SIL instruction. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Instr {
    Load {
        id: Ident,
        lvalue: Expr,
        typ: Typ,
        loc: Location,
    },
    Store {
        lvalue: Expr,
        value: Expr,
        typ: Typ,
        loc: Location,
    },
    Prune {
        cond: Expr,
        true_branch: bool,
        kind: IfKind,
        loc: Location,
    },
    Call {
        ret: Ident,
        ret_typ: Typ,
        callee: Expr,
        args: Vec<CallArg>,
        flags: CallFlags,
        loc: Location,
    },
}

impl Instr {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Instr::Load { .. } => "Load",
            Instr::Store { .. } => "Store",
            Instr::Prune { .. } => "Prune",
            Instr::Call { .. } => "Call",
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Load {
                id,
                lvalue,
                typ,
                loc,
            } => write!(f, "{id}=*{lvalue}:{typ} {loc}"),
            Instr::Store {
                lvalue,
                value,
                typ,
                loc,
            } => write!(f, "*{lvalue}:{typ}={value} {loc}"),
            Instr::Prune {
                cond,
                true_branch,
                loc,
                ..
            } => write!(f, "PRUNE({cond}, {true_branch}); {loc}"),
            Instr::Call {
                ret,
                ret_typ,
                callee,
                args,
                flags,
                loc,
            } => {
                let rendered: Vec<String> = args
                    .iter()
                    .map(|arg| format!("{}:{}", arg.expr, arg.typ))
                    .collect();
                let virtual_flag = if flags.is_virtual { " virtual" } else { "" };
                write!(
                    f,
                    "{ret}:{ret_typ}={callee}({}){virtual_flag} {loc}",
                    rendered.join(",")
                )
            }
        }
    }
}
