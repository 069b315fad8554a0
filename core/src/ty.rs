//! Type-system primitives: the primitive kind enumeration and the structural
//! [TypeInfo] record used everywhere a type is carried around. Assignability,
//! conversion cost and generic substitution live with the class registry,
//! which has the hierarchy needed to answer those questions.

use crate::consts::ARRAY_SUFFIX;
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// The primitive kinds of the language. `Null` and `Unknown` are internal:
/// `Null` is the type of the `null` literal and `Unknown` marks types that
/// are not primitive (class references, type parameters, arrays).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Primitive {
    Int,
    Long,
    Float,
    Bit,
    Boolean,
    Str,
    Char,
    Qubit,
    Void,
    Null,
    Unknown,
}

impl Primitive {
    /// The source-level spelling of this primitive.
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Bit => "bit",
            Self::Boolean => "boolean",
            Self::Str => "string",
            Self::Char => "char",
            Self::Qubit => "qubit",
            Self::Void => "void",
            Self::Null => "null",
            Self::Unknown => "?",
        }
    }

    /// Is this one of the integer kinds?
    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Int | Self::Long)
    }

    /// Numeric rank used for arithmetic promotion: int < long < float.
    /// `bit` promotes to int for arithmetic, so it shares int's rank.
    pub(crate) fn rank(&self) -> Option<u8> {
        match self {
            Self::Bit | Self::Int => Some(0),
            Self::Long => Some(1),
            Self::Float => Some(2),
            _ => None,
        }
    }

    /// The primitive kinds that participate in explicit casts.
    pub fn is_castable(&self) -> bool {
        matches!(self, Self::Int | Self::Long | Self::Float | Self::Bit)
    }
}

impl Display for Primitive {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.keyword())
    }
}

/// A fully resolved type. Class references carry their name and type
/// arguments; arrays are encoded with a `"[]"`-suffixed class name and the
/// element type in `type_args[0]`; type parameters carry the parameter name
/// in `class_name`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TypeInfo {
    pub primitive: Primitive,
    pub class_name: Option<String>,
    pub type_args: Vec<TypeInfo>,
    pub is_type_param: bool,
}

impl TypeInfo {
    pub fn primitive(primitive: Primitive) -> Self {
        Self {
            primitive,
            class_name: None,
            type_args: Vec::new(),
            is_type_param: false,
        }
    }

    pub fn class(name: impl Into<String>, type_args: Vec<TypeInfo>) -> Self {
        Self {
            primitive: Primitive::Unknown,
            class_name: Some(name.into()),
            type_args,
            is_type_param: false,
        }
    }

    pub fn type_param(name: impl Into<String>) -> Self {
        Self {
            primitive: Primitive::Unknown,
            class_name: Some(name.into()),
            type_args: Vec::new(),
            is_type_param: true,
        }
    }

    pub fn array(element: TypeInfo) -> Self {
        Self {
            primitive: Primitive::Unknown,
            class_name: Some(format!("{}{}", element, ARRAY_SUFFIX)),
            type_args: vec![element],
            is_type_param: false,
        }
    }

    pub const fn unknown() -> Self {
        Self {
            primitive: Primitive::Unknown,
            class_name: None,
            type_args: Vec::new(),
            is_type_param: false,
        }
    }

    pub fn is_array(&self) -> bool {
        self.class_name
            .as_deref()
            .map(|name| name.ends_with(ARRAY_SUFFIX))
            .unwrap_or(false)
    }

    /// Element type of an array type, if this is one.
    pub fn element(&self) -> Option<&TypeInfo> {
        if self.is_array() {
            self.type_args.first()
        } else {
            None
        }
    }

    /// Bound of a type parameter, if this is a bounded parameter. The bound
    /// rides along in `type_args[0]` so assignability can be answered
    /// without a side table.
    pub fn param_bound(&self) -> Option<&TypeInfo> {
        if self.is_type_param {
            self.type_args.first()
        } else {
            None
        }
    }

    /// A type parameter reference carrying its declared bound.
    pub fn bounded_type_param(
        name: impl Into<String>,
        bound: TypeInfo,
    ) -> Self {
        Self {
            primitive: Primitive::Unknown,
            class_name: Some(name.into()),
            type_args: vec![bound],
            is_type_param: true,
        }
    }

    /// Is this a (possibly generic) class reference? Arrays and type
    /// parameters are excluded.
    pub fn is_class_ref(&self) -> bool {
        self.class_name.is_some() && !self.is_array() && !self.is_type_param
    }

    pub fn is_unknown(&self) -> bool {
        self.primitive == Primitive::Unknown && self.class_name.is_none()
    }

    pub fn is_null(&self) -> bool {
        self.primitive == Primitive::Null
    }

    pub fn is_void(&self) -> bool {
        self.primitive == Primitive::Void
    }

    /// Valid in a condition position: boolean and bit are interchangeable
    /// there, and nowhere else.
    pub fn is_condition(&self) -> bool {
        matches!(self.primitive, Primitive::Boolean | Primitive::Bit)
    }

    pub fn is_numeric(&self) -> bool {
        self.primitive.rank().is_some()
    }

    pub fn is_integer(&self) -> bool {
        self.primitive.is_integer()
    }
}

impl Display for TypeInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.class_name {
            // A type parameter displays as its bare name; its bound is
            // carried in type_args but isn't part of the spelling
            Some(name) if self.is_type_param => write!(f, "{}", name),
            Some(name) if self.is_array() => write!(f, "{}", name),
            Some(name) => {
                write!(f, "{}", name)?;
                if !self.type_args.is_empty() {
                    write!(f, "<")?;
                    for (i, arg) in self.type_args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", arg)?;
                    }
                    write!(f, ">")?;
                }
                Ok(())
            }
            None => write!(f, "{}", self.primitive),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_encoding() {
        let arr = TypeInfo::array(TypeInfo::primitive(Primitive::Bit));
        assert!(arr.is_array());
        assert_eq!(arr.class_name.as_deref(), Some("bit[]"));
        assert_eq!(
            arr.element(),
            Some(&TypeInfo::primitive(Primitive::Bit))
        );
        assert_eq!(arr.to_string(), "bit[]");
    }

    #[test]
    fn test_generic_display() {
        let ty = TypeInfo::class(
            "Box",
            vec![TypeInfo::class("Pair", vec![])],
        );
        assert_eq!(ty.to_string(), "Box<Pair>");
    }
}
