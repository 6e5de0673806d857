use std::fmt;

use serde::{Serialize, Serializer};

/// Integer kinds distinguished by the analyzer.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum IntKind {
    Bool,
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum FloatKind {
    Float,
    Double,
}

/// SIL type.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) enum Typ {
    Int(IntKind),
    Float(FloatKind),
    Void,
    Ptr(Box<Typ>),
    Struct(String),
    Array(Box<Typ>),
}

impl Typ {
    /// Maps a CIL type name onto its SIL type. Reference types become pointers to structs.
    pub(crate) fn from_type_name(name: &str) -> Typ {
        if let Some(element) = name.strip_suffix("[]") {
            return Typ::Ptr(Box::new(Typ::Array(Box::new(Typ::from_type_name(
                element,
            )))));
        }
        if let Some(referenced) = name.strip_suffix('&') {
            return Typ::Ptr(Box::new(Typ::from_type_name(referenced)));
        }
        match name {
            "System.Void" => Typ::Void,
            "System.Boolean" => Typ::Int(IntKind::Bool),
            "System.Char" => Typ::Int(IntKind::Char),
            "System.SByte" => Typ::Int(IntKind::I8),
            "System.Byte" => Typ::Int(IntKind::U8),
            "System.Int16" => Typ::Int(IntKind::I16),
            "System.UInt16" => Typ::Int(IntKind::U16),
            "System.Int32" => Typ::Int(IntKind::I32),
            "System.UInt32" => Typ::Int(IntKind::U32),
            "System.Int64" | "System.IntPtr" => Typ::Int(IntKind::I64),
            "System.UInt64" | "System.UIntPtr" => Typ::Int(IntKind::U64),
            "System.Single" => Typ::Float(FloatKind::Float),
            "System.Double" => Typ::Float(FloatKind::Double),
            other => Typ::Ptr(Box::new(Typ::Struct(other.to_string()))),
        }
    }

    pub(crate) fn int() -> Typ {
        Typ::Int(IntKind::I32)
    }

    pub(crate) fn bool() -> Typ {
        Typ::Int(IntKind::Bool)
    }

    pub(crate) fn is_pointer(&self) -> bool {
        matches!(self, Typ::Ptr(_))
    }

    pub(crate) fn strip_pointer(&self) -> &Typ {
        match self {
            Typ::Ptr(inner) => inner,
            other => other,
        }
    }
}

impl fmt::Display for Typ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Typ::Int(kind) => {
                let name = match kind {
                    IntKind::Bool => "bool",
                    IntKind::Char => "char",
                    IntKind::I8 => "signed char",
                    IntKind::U8 => "unsigned char",
                    IntKind::I16 => "short",
                    IntKind::U16 => "unsigned short",
                    IntKind::I32 => "int",
                    IntKind::U32 => "unsigned int",
                    IntKind::I64 => "long long",
                    IntKind::U64 => "unsigned long long",
                };
                f.write_str(name)
            }
            Typ::Float(FloatKind::Float) => f.write_str("float"),
            Typ::Float(FloatKind::Double) => f.write_str("double"),
            Typ::Void => f.write_str("void"),
            Typ::Ptr(inner) => write!(f, "{inner}*"),
            Typ::Struct(name) => f.write_str(name),
            Typ::Array(element) => write!(f, "{element}[_]"),
        }
    }
}

impl Serialize for Typ {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Fully qualified field name together with the field's type.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
pub(crate) struct FieldIdent {
    pub(crate) name: String,
    #[serde(rename = "type")]
    pub(crate) typ: Typ,
}

impl FieldIdent {
    pub(crate) fn new(name: impl Into<String>, typ: Typ) -> Self {
        Self {
            name: name.into(),
            typ,
        }
    }
}

impl fmt::Display for FieldIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.typ)
    }
}

/// Flattened layout of a type: own members first, inherited members after.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct Struct {
    pub(crate) instance_fields: Vec<FieldIdent>,
    pub(crate) static_fields: Vec<FieldIdent>,
    pub(crate) supers: Vec<String>,
    pub(crate) methods: Vec<String>,
}

/// Resolved type with its flattened struct description.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub(crate) struct TypeEntry {
    pub(crate) type_name: String,
    pub(crate) type_struct: Struct,
}

impl fmt::Display for TypeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.type_name)?;
        writeln!(f, "  supers: {}", self.type_struct.supers.join(", "))?;
        for field in &self.type_struct.instance_fields {
            writeln!(f, "  field {field}")?;
        }
        for field in &self.type_struct.static_fields {
            writeln!(f, "  static {field}")?;
        }
        for method in &self.type_struct.methods {
            writeln!(f, "  method {method}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_type_name_maps_primitives_and_references() {
        assert_eq!(Typ::from_type_name("System.Int32"), Typ::int());
        assert_eq!(Typ::from_type_name("System.Void"), Typ::Void);
        assert_eq!(
            Typ::from_type_name("App.Widget"),
            Typ::Ptr(Box::new(Typ::Struct("App.Widget".to_string())))
        );
        assert_eq!(
            Typ::from_type_name("System.Byte[]").to_string(),
            "unsigned char[_]*"
        );
    }

    #[test]
    fn strip_pointer_leaves_value_types_untouched() {
        let widget = Typ::from_type_name("App.Widget");
        assert_eq!(widget.strip_pointer(), &Typ::Struct("App.Widget".to_string()));
        assert_eq!(Typ::bool().strip_pointer(), &Typ::bool());
    }
}
