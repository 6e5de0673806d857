use std::fmt;

use crate::sil::types::{FieldIdent, Typ};

/// Temporary identifier; the stamp is unique within a procedure path.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct Ident {
    pub(crate) stamp: u32,
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n${}", self.stamp)
    }
}

/// Program variable: a local, a formal, or a global backing static fields.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) struct Pvar {
    pub(crate) name: String,
    pub(crate) global: bool,
}

impl Pvar {
    pub(crate) fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            global: false,
        }
    }

    pub(crate) fn global(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            global: true,
        }
    }
}

impl fmt::Display for Pvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.global {
            write!(f, "#GB<>${}", self.name)
        } else {
            f.write_str(&self.name)
        }
    }
}

pub(crate) const RETURN_VAR: &str = "return";
pub(crate) const THIS_VAR: &str = "this";

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Const {
    Int(i64),
    Float(f64),
    Str(String),
    Null,
    Fun(String),
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Int(value) => write!(f, "{value}"),
            Const::Float(value) => write!(f, "{value}"),
            Const::Str(value) => write!(f, "{value:?}"),
            Const::Null => f.write_str("null"),
            Const::Fun(name) => write!(f, "_fun_{name}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum BinopKind {
    PlusA,
    MinusA,
    Mult,
    Div,
    Mod,
    Shiftlt,
    Shiftrt,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    BAnd,
    BXor,
    BOr,
}

impl BinopKind {
    fn symbol(self) -> &'static str {
        match self {
            BinopKind::PlusA => "+",
            BinopKind::MinusA => "-",
            BinopKind::Mult => "*",
            BinopKind::Div => "/",
            BinopKind::Mod => "%",
            BinopKind::Shiftlt => "<<",
            BinopKind::Shiftrt => ">>",
            BinopKind::Lt => "<",
            BinopKind::Gt => ">",
            BinopKind::Le => "<=",
            BinopKind::Ge => ">=",
            BinopKind::Eq => "==",
            BinopKind::Ne => "!=",
            BinopKind::BAnd => "&",
            BinopKind::BXor => "^",
            BinopKind::BOr => "|",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum UnopKind {
    Neg,
    BNot,
    LNot,
}

/// SIL expression. Heap addresses are explicit (`Lvar`, `Lfield`).
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Expr {
    Var(Ident),
    Lvar(Pvar),
    Lfield {
        base: Box<Expr>,
        field: FieldIdent,
        typ: Typ,
    },
    Const(Const),
    Binop {
        op: BinopKind,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unop {
        op: UnopKind,
        expr: Box<Expr>,
    },
    Exn(Box<Expr>),
    Sizeof(Typ),
}

impl Expr {
    pub(crate) fn int(value: i64) -> Expr {
        Expr::Const(Const::Int(value))
    }

    pub(crate) fn null() -> Expr {
        Expr::Const(Const::Null)
    }

    pub(crate) fn fun(name: impl Into<String>) -> Expr {
        Expr::Const(Const::Fun(name.into()))
    }

    pub(crate) fn lvar(name: impl Into<String>) -> Expr {
        Expr::Lvar(Pvar::local(name))
    }

    pub(crate) fn binop(op: BinopKind, left: Expr, right: Expr) -> Expr {
        Expr::Binop {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub(crate) fn not(expr: Expr) -> Expr {
        Expr::Unop {
            op: UnopKind::LNot,
            expr: Box::new(expr),
        }
    }

    pub(crate) fn field(base: Expr, field: FieldIdent, declaring: Typ) -> Expr {
        Expr::Lfield {
            base: Box::new(base),
            field,
            typ: declaring,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Var(ident) => write!(f, "{ident}"),
            Expr::Lvar(pvar) => write!(f, "&{pvar}"),
            Expr::Lfield { base, field, .. } => write!(f, "{base}.{}", field.name),
            Expr::Const(value) => write!(f, "{value}"),
            Expr::Binop { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Unop { op, expr } => match op {
                UnopKind::Neg => write!(f, "-{expr}"),
                UnopKind::BNot => write!(f, "~{expr}"),
                UnopKind::LNot => write!(f, "!{expr}"),
            },
            Expr::Exn(expr) => write!(f, "EXN {expr}"),
            Expr::Sizeof(typ) => write!(f, "sizeof(t={typ})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_renders_heap_addresses() {
        let this = Expr::Var(Ident { stamp: 3 });
        let field = Expr::field(
            this,
            FieldIdent::new("App.Widget.count", Typ::int()),
            Typ::Struct("App.Widget".to_string()),
        );
        assert_eq!(field.to_string(), "n$3.App.Widget.count");

        let condition = Expr::not(Expr::binop(BinopKind::Ne, Expr::lvar("x"), Expr::null()));
        assert_eq!(condition.to_string(), "!(&x != null)");
        assert_eq!(Expr::Lvar(Pvar::global("App.Config")).to_string(), "&#GB<>$App.Config");
    }
}
