use serde::{Deserialize, Serialize};

use crate::sil::expr::BinopKind;

/// Metadata dump for one loaded binary.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Assembly {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) types: Vec<TypeDef>,
}

/// Type definition with its declared members.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct TypeDef {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) base: Option<String>,
    #[serde(default)]
    pub(crate) interfaces: Vec<String>,
    #[serde(default)]
    pub(crate) fields: Vec<FieldDef>,
    #[serde(default)]
    pub(crate) methods: Vec<MethodDef>,
}

/// Field declared on a type.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct FieldDef {
    pub(crate) name: String,
    pub(crate) field_type: String,
    #[serde(default)]
    pub(crate) is_static: bool,
}

/// Method declaration and, when present, its body.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct MethodDef {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) parameters: Vec<Parameter>,
    #[serde(default = "void_type")]
    pub(crate) return_type: String,
    #[serde(default)]
    pub(crate) is_static: bool,
    #[serde(default)]
    pub(crate) is_abstract: bool,
    #[serde(default)]
    pub(crate) source_file: Option<String>,
    #[serde(default)]
    pub(crate) body: Option<MethodBody>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Parameter {
    pub(crate) name: String,
    pub(crate) param_type: String,
}

/// Instruction stream and exception handler table of a method.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub(crate) struct MethodBody {
    #[serde(default)]
    pub(crate) locals: Vec<String>,
    #[serde(default)]
    pub(crate) instructions: Vec<Instruction>,
    #[serde(default)]
    pub(crate) exception_handlers: Vec<ExceptionHandler>,
}

/// Exception handler metadata. Range ends are exclusive offsets.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct ExceptionHandler {
    pub(crate) kind: HandlerKind,
    pub(crate) try_start: u32,
    pub(crate) try_end: u32,
    #[serde(default)]
    pub(crate) handler_start: Option<u32>,
    #[serde(default)]
    pub(crate) handler_end: Option<u32>,
    #[serde(default)]
    pub(crate) catch_type: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum HandlerKind {
    Catch,
    Finally,
    Filter,
    Fault,
}

/// Bytecode instruction with its offset and optional source line.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Instruction {
    pub(crate) offset: u32,
    pub(crate) opcode: String,
    #[serde(default)]
    pub(crate) operand: Operand,
    #[serde(default)]
    pub(crate) line: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub(crate) enum Operand {
    #[default]
    None,
    Int(i64),
    Float(f64),
    String(String),
    Target(u32),
    Targets(Vec<u32>),
    Method(MethodRef),
    Field(FieldRef),
    Type(String),
}

/// Callee referenced by a call instruction.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub(crate) struct MethodRef {
    pub(crate) declaring_type: String,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) parameters: Vec<String>,
    #[serde(default = "void_type")]
    pub(crate) return_type: String,
    #[serde(default)]
    pub(crate) has_this: bool,
}

/// Field referenced by a field access instruction.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub(crate) struct FieldRef {
    pub(crate) declaring_type: String,
    pub(crate) name: String,
    pub(crate) field_type: String,
}

/// Opcode families the rule set distinguishes. Short (`.s`) and unsigned
/// (`.un`) forms fold into their base opcode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Opcode {
    Nop,
    Ldarg(Option<u16>),
    Starg,
    Ldloc(Option<u16>),
    Stloc(Option<u16>),
    LdcI4(Option<i64>),
    LdcI8,
    LdcR4,
    LdcR8,
    Ldstr,
    Ldnull,
    Dup,
    Pop,
    Binop(BinopKind),
    Compare(BinopKind),
    Neg,
    Not,
    Br,
    Brtrue,
    Brfalse,
    BranchCompare(BinopKind),
    Switch,
    Call,
    Callvirt,
    Newobj,
    Ldfld,
    Stfld,
    Ldsfld,
    Stsfld,
    Ret,
    Throw,
    Leave,
    Endfinally,
    Unknown,
}

impl Opcode {
    pub(crate) fn parse(mnemonic: &str) -> Opcode {
        let lowered = mnemonic.to_ascii_lowercase();
        let base = lowered.strip_suffix(".s").unwrap_or(&lowered);
        let base = base.strip_suffix(".un").unwrap_or(base);
        match base {
            "nop" => Opcode::Nop,
            "ldarg" => Opcode::Ldarg(None),
            "ldarg.0" => Opcode::Ldarg(Some(0)),
            "ldarg.1" => Opcode::Ldarg(Some(1)),
            "ldarg.2" => Opcode::Ldarg(Some(2)),
            "ldarg.3" => Opcode::Ldarg(Some(3)),
            "starg" => Opcode::Starg,
            "ldloc" => Opcode::Ldloc(None),
            "ldloc.0" => Opcode::Ldloc(Some(0)),
            "ldloc.1" => Opcode::Ldloc(Some(1)),
            "ldloc.2" => Opcode::Ldloc(Some(2)),
            "ldloc.3" => Opcode::Ldloc(Some(3)),
            "stloc" => Opcode::Stloc(None),
            "stloc.0" => Opcode::Stloc(Some(0)),
            "stloc.1" => Opcode::Stloc(Some(1)),
            "stloc.2" => Opcode::Stloc(Some(2)),
            "stloc.3" => Opcode::Stloc(Some(3)),
            "ldc.i4" => Opcode::LdcI4(None),
            "ldc.i4.m1" => Opcode::LdcI4(Some(-1)),
            "ldc.i8" => Opcode::LdcI8,
            "ldc.r4" => Opcode::LdcR4,
            "ldc.r8" => Opcode::LdcR8,
            "ldstr" => Opcode::Ldstr,
            "ldnull" => Opcode::Ldnull,
            "dup" => Opcode::Dup,
            "pop" => Opcode::Pop,
            "add" => Opcode::Binop(BinopKind::PlusA),
            "sub" => Opcode::Binop(BinopKind::MinusA),
            "mul" => Opcode::Binop(BinopKind::Mult),
            "div" => Opcode::Binop(BinopKind::Div),
            "rem" => Opcode::Binop(BinopKind::Mod),
            "and" => Opcode::Binop(BinopKind::BAnd),
            "or" => Opcode::Binop(BinopKind::BOr),
            "xor" => Opcode::Binop(BinopKind::BXor),
            "shl" => Opcode::Binop(BinopKind::Shiftlt),
            "shr" => Opcode::Binop(BinopKind::Shiftrt),
            "ceq" => Opcode::Compare(BinopKind::Eq),
            "cgt" => Opcode::Compare(BinopKind::Gt),
            "clt" => Opcode::Compare(BinopKind::Lt),
            "neg" => Opcode::Neg,
            "not" => Opcode::Not,
            "br" => Opcode::Br,
            "brtrue" | "brinst" => Opcode::Brtrue,
            "brfalse" | "brnull" | "brzero" => Opcode::Brfalse,
            "beq" => Opcode::BranchCompare(BinopKind::Eq),
            "bne" => Opcode::BranchCompare(BinopKind::Ne),
            "blt" => Opcode::BranchCompare(BinopKind::Lt),
            "bgt" => Opcode::BranchCompare(BinopKind::Gt),
            "ble" => Opcode::BranchCompare(BinopKind::Le),
            "bge" => Opcode::BranchCompare(BinopKind::Ge),
            "switch" => Opcode::Switch,
            "call" => Opcode::Call,
            "callvirt" => Opcode::Callvirt,
            "newobj" => Opcode::Newobj,
            "ldfld" => Opcode::Ldfld,
            "stfld" => Opcode::Stfld,
            "ldsfld" => Opcode::Ldsfld,
            "stsfld" => Opcode::Stsfld,
            "ret" => Opcode::Ret,
            "throw" => Opcode::Throw,
            "leave" => Opcode::Leave,
            "endfinally" => Opcode::Endfinally,
            other => match other.strip_prefix("ldc.i4.") {
                Some(digit) => digit
                    .parse::<i64>()
                    .map(|value| Opcode::LdcI4(Some(value)))
                    .unwrap_or(Opcode::Unknown),
                None => Opcode::Unknown,
            },
        }
    }
}

impl Instruction {
    pub(crate) fn opcode(&self) -> Opcode {
        Opcode::parse(&self.opcode)
    }

    /// Explicit control transfer targets (branch, switch and leave operands).
    pub(crate) fn branch_targets(&self) -> Vec<u32> {
        match (&self.operand, self.opcode()) {
            (Operand::Target(target), _) => vec![*target],
            (Operand::Targets(targets), Opcode::Switch) => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// Whether control can continue with the next instruction in the stream.
    pub(crate) fn falls_through(&self) -> bool {
        !matches!(
            self.opcode(),
            Opcode::Br | Opcode::Ret | Opcode::Throw | Opcode::Leave | Opcode::Endfinally
        )
    }
}

impl MethodDef {
    /// Fully qualified signature used as the procedure key.
    pub(crate) fn full_name(&self, declaring_type: &str) -> String {
        let parameters: Vec<&str> = self
            .parameters
            .iter()
            .map(|parameter| parameter.param_type.as_str())
            .collect();
        format!(
            "{} {}::{}({})",
            self.return_type,
            declaring_type,
            self.name,
            parameters.join(",")
        )
    }

    pub(crate) fn has_this(&self) -> bool {
        !self.is_static
    }

    /// First source line of the body; `None` when the method has no debug information.
    pub(crate) fn first_line(&self) -> Option<u32> {
        self.body
            .as_ref()?
            .instructions
            .iter()
            .find_map(|instruction| instruction.line)
    }

    pub(crate) fn is_dispose(&self) -> bool {
        matches!(self.name.as_str(), "Dispose" | "System.IDisposable.Dispose")
            && self.return_type == VOID_TYPE
    }

    pub(crate) fn is_constructor(&self) -> bool {
        self.name == ".ctor"
    }
}

impl MethodRef {
    pub(crate) fn full_name(&self) -> String {
        format!(
            "{} {}::{}({})",
            self.return_type,
            self.declaring_type,
            self.name,
            self.parameters.join(",")
        )
    }
}

impl FieldRef {
    pub(crate) fn full_name(&self) -> String {
        format!("{}.{}", self.declaring_type, self.name)
    }
}

pub(crate) const VOID_TYPE: &str = "System.Void";

fn void_type() -> String {
    VOID_TYPE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_parse_folds_short_and_unsigned_forms() {
        assert_eq!(Opcode::parse("br.s"), Opcode::Br);
        assert_eq!(
            Opcode::parse("blt.un.s"),
            Opcode::BranchCompare(BinopKind::Lt)
        );
        assert_eq!(Opcode::parse("ldc.i4.7"), Opcode::LdcI4(Some(7)));
        assert_eq!(Opcode::parse("ldc.i4.m1"), Opcode::LdcI4(Some(-1)));
        assert_eq!(Opcode::parse("ldc.i4.s"), Opcode::LdcI4(None));
        assert_eq!(Opcode::parse("Stloc.2"), Opcode::Stloc(Some(2)));
        assert_eq!(Opcode::parse("conv.i8"), Opcode::Unknown);
    }

    #[test]
    fn method_full_name_follows_cil_convention() {
        let method = MethodDef {
            name: "Run".to_string(),
            parameters: vec![
                Parameter {
                    name: "a".to_string(),
                    param_type: "System.Int32".to_string(),
                },
                Parameter {
                    name: "b".to_string(),
                    param_type: "System.String".to_string(),
                },
            ],
            return_type: VOID_TYPE.to_string(),
            is_static: false,
            is_abstract: false,
            source_file: None,
            body: None,
        };

        assert_eq!(
            method.full_name("App.Worker"),
            "System.Void App.Worker::Run(System.Int32,System.String)"
        );
        assert!(!method.is_dispose());
    }

    #[test]
    fn instruction_deserializes_tagged_operand() {
        let instruction: Instruction = serde_json::from_str(
            r#"{"offset": 4, "opcode": "switch", "operand": {"kind": "targets", "value": [8, 12]}, "line": 3}"#,
        )
        .expect("deserialize instruction");

        assert_eq!(instruction.branch_targets(), vec![8, 12]);
        assert!(instruction.falls_through());
        assert_eq!(instruction.line, Some(3));
    }
}
