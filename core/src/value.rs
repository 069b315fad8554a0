//! Runtime values. The interpreter is a tagged-value machine: every slot in
//! the environment, every field, and every expression result is a [Value].

use crate::{heap::Object, ty::TypeInfo};
use std::cell::RefCell;
use std::fmt::{self, Display, Formatter};
use std::rc::Rc;

/// A strong reference to a heap object.
pub(crate) type ObjRef = Rc<RefCell<Object>>;

/// A heap-allocated array. Arrays have reference semantics: copying a value
/// copies the handle, and element assignment is visible through every copy.
#[derive(Debug)]
pub(crate) struct ArrayValue {
    /// Element type, used for runtime element-assignment checks
    pub element: TypeInfo,
    pub items: RefCell<Vec<Value>>,
}

impl ArrayValue {
    pub fn new(element: TypeInfo, items: Vec<Value>) -> Rc<Self> {
        Rc::new(Self {
            element,
            items: RefCell::new(items),
        })
    }
}

/// A runtime value.
#[derive(Clone, Debug)]
pub(crate) enum Value {
    Int(i32),
    Long(i64),
    Float(f64),
    /// A classical bit: 0 or 1. Distinct from boolean.
    Bit(u8),
    Boolean(bool),
    Str(String),
    Char(char),
    /// An index into the simulator's amplitude space
    Qubit(usize),
    Array(Rc<ArrayValue>),
    /// An object reference. `class` is the *static* type used for overload
    /// resolution; the object itself knows its dynamic class.
    Object { obj: ObjRef, class: String },
    /// A class reference (receiver of static member access)
    Class(String),
    Null,
    Void,
}

impl Value {
    /// Condition value: booleans and bits are interchangeable here.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Boolean(b) => *b,
            Value::Bit(b) => *b != 0,
            _ => false,
        }
    }

}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bit(v) => write!(f, "{}", v),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{}", v),
            Value::Char(v) => write!(f, "{}", v),
            Value::Qubit(index) => write!(f, "q[{}]", index),
            Value::Array(array) => {
                write!(f, "[")?;
                for (i, item) in array.items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Object { obj, .. } => {
                write!(f, "{}", obj.borrow().class)
            }
            Value::Class(name) => write!(f, "{}", name),
            Value::Null => write!(f, "null"),
            Value::Void => write!(f, "void"),
        }
    }
}
