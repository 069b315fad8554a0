//! All error-related Tangle types.

use crate::util::{self, Span};
use serde::Serialize;
use std::fmt::{self, Debug, Display, Formatter};
use thiserror::Error;

/// A trait for any error that originates in source code. [SourceError]s rely
/// on having source code present in order to display themselves.
pub trait SourceError: 'static + Send + Sync + Debug + Serialize {
    /// A simple type label for this error, e.g. `"Semantic"` or `"Runtime"`.
    fn type_label(&self) -> &'static str;

    /// Format this error into a simple message. `spanned_src` is the slice of
    /// the source code that corresponds to this error's [Span]. This needs to
    /// be provided by the caller in order to create a proper error message.
    fn fmt_msg(&self, f: &mut Formatter<'_>, spanned_src: &str) -> fmt::Result;
}

/// An error that occurs during compilation of a program. The error will be
/// due to a flaw in the program. This indicates a user error, _not_ an
/// internal compiler error. Compiler bugs will always cause a panic.
#[derive(Clone, Debug, Serialize)]
pub enum CompileError {
    /// Failed to parse the program because of a syntax error. `expected` is
    /// the name of the type of element that was expected where the error
    /// occurred.
    Syntax { expected: &'static str },
    /// Referenced a name that isn't in scope
    UnknownName,
    /// Referenced a type that doesn't exist
    UnknownType,
    /// Named a base class that doesn't exist
    UnknownBaseClass,
    /// Accessed a member that the class (hierarchy) doesn't declare
    UnknownMember { class: String },
    /// No overload of the named function/method/constructor accepts the
    /// given argument types
    NoMatchingOverload { name: String },
    /// Two or more overloads tie at minimum conversion cost
    AmbiguousCall { name: String },
    /// An expression's type doesn't fit where it's used
    TypeMismatch { expected: String, actual: String },
    /// Condition of if/while/for/ternary isn't boolean or bit
    InvalidCondition { actual: String },
    /// A binary/unary operator was applied to operands it doesn't support
    InvalidOperands { op: String, lhs: String, rhs: String },
    /// Equality comparison between arrays is not supported
    ArrayEquality,
    /// `null` used where only class references allow it
    NullMisuse,
    /// Cast between types outside {int, long, float, bit}
    InvalidCast { from: String, to: String },
    /// Array size expression isn't a compile-time integer constant
    NonConstArraySize,
    /// Postfix ++/-- on something that isn't an int/long variable or field
    InvalidPostfixTarget,
    /// Assignment to something that isn't a variable, field, or array element
    InvalidAssignTarget,
    /// The same name was declared twice in the same scope/class
    DuplicateDeclaration { original: Span },
    /// Class inheritance chain loops back on itself
    InheritanceCycle,
    /// The root class broke one of its special rules
    InvalidObjectClass { detail: &'static str },
    /// A static class declared instance members, constructors, or a
    /// destructor
    StaticClassMember,
    /// A non-static class declared no constructor
    MissingConstructor,
    /// More than one destructor in a class
    MultipleDestructors,
    /// `new` on an abstract class
    AbstractInstantiation { class: String, missing: String },
    /// `new` on a static class
    StaticInstantiation { class: String },
    /// An override/virtual rule was broken; `detail` says which
    InvalidOverride { detail: &'static str },
    /// Accessed a member that visibility rules hide from this context
    VisibilityViolation { class: String },
    /// Assignment to a final variable or field after initialization
    FinalReassignment,
    /// A final field without initializer isn't assigned on every constructor
    /// path
    FinalFieldUnassigned { field: String },
    /// A final field was assigned somewhere other than a top-level statement
    /// of the constructor body
    FinalFieldConditionalAssignment,
    /// `= default` constructor parameter doesn't match a bindable field
    DefaultConstructorParam { detail: &'static str },
    /// `super(...)` somewhere other than the first statement of a
    /// constructor body
    SuperNotFirst,
    /// `this` or `super` used in a static context
    StaticContext { what: &'static str },
    /// A non-void function or method has a path with no return
    MissingReturn { name: String },
    /// Wrong number of type arguments for a generic class
    GenericArity { class: String, expected: usize, actual: usize },
    /// A type argument doesn't satisfy the parameter's bound
    GenericBound { param: String, bound: String, actual: String },
    /// An annotation sits on a declaration it's not allowed on
    BadAnnotation { detail: &'static str },
    /// The program has no `main` function
    MissingMain,
}

impl SourceError for CompileError {
    fn type_label(&self) -> &'static str {
        match self {
            Self::Syntax { .. } => "Syntax",
            _ => "Semantic",
        }
    }

    fn fmt_msg(&self, f: &mut Formatter<'_>, spanned_src: &str) -> fmt::Result {
        match self {
            // the source span for syntax errors is just the remaining source,
            // so not very helpful
            Self::Syntax { expected } => write!(f, "Expected {}", expected),
            Self::UnknownName => {
                write!(f, "Unknown name `{}`", spanned_src)
            }
            Self::UnknownType => {
                write!(f, "Unknown type `{}`", spanned_src)
            }
            Self::UnknownBaseClass => {
                write!(f, "Unknown base class `{}`", spanned_src)
            }
            Self::UnknownMember { class } => write!(
                f,
                "Class `{}` has no member `{}`",
                class, spanned_src
            ),
            Self::NoMatchingOverload { name } => {
                write!(f, "No overload of `{}` matches these arguments", name)
            }
            Self::AmbiguousCall { name } => {
                write!(f, "Ambiguous call to `{}`", name)
            }
            Self::TypeMismatch { expected, actual } => write!(
                f,
                "Type mismatch: expected `{}`, found `{}`",
                expected, actual
            ),
            Self::InvalidCondition { actual } => write!(
                f,
                "Condition must be boolean or bit, found `{}`",
                actual
            ),
            Self::InvalidOperands { op, lhs, rhs } => write!(
                f,
                "Operator `{}` cannot be applied to `{}` and `{}`",
                op, lhs, rhs
            ),
            Self::ArrayEquality => {
                write!(f, "Arrays cannot be compared with `==` or `!=`")
            }
            Self::NullMisuse => write!(
                f,
                "`null` can only be used with class reference types"
            ),
            Self::InvalidCast { from, to } => {
                write!(f, "Cannot cast `{}` to `{}`", from, to)
            }
            Self::NonConstArraySize => write!(
                f,
                "Array size must be a compile-time integer constant"
            ),
            Self::InvalidPostfixTarget => write!(
                f,
                "`++`/`--` require an int or long variable or field"
            ),
            Self::InvalidAssignTarget => {
                write!(f, "Cannot assign to this expression")
            }
            Self::DuplicateDeclaration {
                original: original_span,
            } => write!(
                f,
                "Duplicate declaration of `{}`, originally declared on \
                line {}",
                spanned_src, original_span.start_line,
            ),
            Self::InheritanceCycle => write!(
                f,
                "Class `{}` is part of an inheritance cycle",
                spanned_src
            ),
            Self::InvalidObjectClass { detail } => {
                write!(f, "Invalid `Object` declaration: {}", detail)
            }
            Self::StaticClassMember => write!(
                f,
                "Static classes cannot declare instance members, \
                constructors, or destructors"
            ),
            Self::MissingConstructor => write!(
                f,
                "Non-static class `{}` must declare at least one constructor",
                spanned_src
            ),
            Self::MultipleDestructors => {
                write!(f, "A class can declare at most one destructor")
            }
            Self::AbstractInstantiation { class, missing } => write!(
                f,
                "Cannot instantiate abstract class `{}` (missing {})",
                class, missing
            ),
            Self::StaticInstantiation { class } => write!(
                f,
                "Cannot instantiate static class `{}`",
                class
            ),
            Self::InvalidOverride { detail } => {
                write!(f, "Invalid override: {}", detail)
            }
            Self::VisibilityViolation { class } => write!(
                f,
                "Member `{}` of class `{}` is not visible here",
                spanned_src, class
            ),
            Self::FinalReassignment => {
                write!(f, "Cannot reassign final `{}`", spanned_src)
            }
            Self::FinalFieldUnassigned { field } => write!(
                f,
                "Final field `{}` must be assigned exactly once in every \
                constructor",
                field
            ),
            Self::FinalFieldConditionalAssignment => write!(
                f,
                "Final fields must be assigned at the top level of the \
                constructor body, not inside branches or loops"
            ),
            Self::DefaultConstructorParam { detail } => {
                write!(f, "Invalid default constructor parameter: {}", detail)
            }
            Self::SuperNotFirst => write!(
                f,
                "`super(...)` must be the first statement of the \
                constructor body"
            ),
            Self::StaticContext { what } => {
                write!(f, "`{}` cannot be used in a static context", what)
            }
            Self::MissingReturn { name } => write!(
                f,
                "`{}` must return a value on every path",
                name
            ),
            Self::GenericArity {
                class,
                expected,
                actual,
            } => write!(
                f,
                "Class `{}` takes {} type argument(s), found {}",
                class, expected, actual
            ),
            Self::GenericBound {
                param,
                bound,
                actual,
            } => write!(
                f,
                "Type argument `{}` does not satisfy the bound `{}` of \
                parameter `{}`",
                actual, bound, param
            ),
            Self::BadAnnotation { detail } => {
                write!(f, "Invalid annotation: {}", detail)
            }
            Self::MissingMain => {
                write!(f, "Program has no `main` function")
            }
        }
    }
}

/// An error that occurs during execution of a program. The error will be
/// due to a flaw in the program. This indicates a user error, _not_ a bug in
/// the interpreter. Interpreter bugs will always panic.
#[derive(Clone, Debug, Serialize)]
pub enum RuntimeError {
    /// Array index outside the array's bounds
    IndexOutOfBounds { index: i64, length: usize },
    /// Array constructed with a negative size
    NegativeArraySize { size: i64 },
    /// Indexed into a value that isn't an array
    IndexNonArray,
    /// Gate or measurement on a qubit that was already measured
    QubitMeasured { qubit: usize },
    /// Gate, measurement, or reset on a qubit index the simulator doesn't
    /// know
    InvalidQubit { qubit: usize },
    /// Division or modulo by zero
    DivideByZero,
    /// Assigned a value of the wrong type into an array element
    ArrayElementType { expected: String, actual: String },
    /// Bitwise operator on bit arrays of different lengths
    BitArrayLength { lhs: usize, rhs: usize },
    /// Cast failed at runtime
    InvalidCast { from: String, to: String },
    /// Member access through a null reference
    NullReference,
    /// A single-use machine was executed twice
    MachineReused,
    /// Overload resolution tied at runtime. Semantic analysis rules this
    /// out, but the runtime guards anyway.
    AmbiguousOverload { name: String },
}

impl SourceError for RuntimeError {
    fn type_label(&self) -> &'static str {
        "Runtime"
    }

    fn fmt_msg(&self, f: &mut Formatter<'_>, spanned_src: &str) -> fmt::Result {
        match self {
            Self::IndexOutOfBounds { index, length } => write!(
                f,
                "Index {} out of bounds for array of length {}",
                index, length
            ),
            Self::NegativeArraySize { size } => {
                write!(f, "Negative array size {}", size)
            }
            Self::IndexNonArray => {
                write!(f, "Cannot index into `{}`", spanned_src)
            }
            Self::QubitMeasured { qubit } => write!(
                f,
                "Qubit {} was already measured; reset it before applying \
                further gates",
                qubit
            ),
            Self::InvalidQubit { qubit } => {
                write!(f, "Invalid qubit index {}", qubit)
            }
            Self::DivideByZero => write!(f, "Division by zero"),
            Self::ArrayElementType { expected, actual } => write!(
                f,
                "Cannot store `{}` in an array of `{}`",
                actual, expected
            ),
            Self::BitArrayLength { lhs, rhs } => write!(
                f,
                "Bitwise operator on bit arrays of different lengths \
                ({} and {})",
                lhs, rhs
            ),
            Self::InvalidCast { from, to } => {
                write!(f, "Cannot cast `{}` to `{}`", from, to)
            }
            Self::NullReference => {
                write!(f, "Null reference in `{}`", spanned_src)
            }
            Self::MachineReused => write!(
                f,
                "A machine executes a program exactly once; allocate a \
                fresh one"
            ),
            Self::AmbiguousOverload { name } => {
                write!(f, "Ambiguous overload of `{}` at runtime", name)
            }
        }
    }
}

/// A wrapper around a [SourceError], that holds some extra data:
/// - The [Span] of the source code that caused the error
/// - The offending chunk of source code itself
///
/// This type on its own can be formatted, without any external data.
#[derive(Clone, Debug, Error, Serialize)]
pub struct SourceErrorWrapper<E: SourceError> {
    error: E,
    span: Span,
    spanned_source: String,
}

impl<E: SourceError> SourceErrorWrapper<E> {
    pub fn new(error: E, span: Span, src: &str) -> Self {
        Self {
            error,
            span,
            spanned_source: span.get_source_slice(src).into(),
        }
    }

    pub fn span(&self) -> Span {
        self.span
    }

    pub fn error(&self) -> &E {
        &self.error
    }
}

impl<E: SourceError> Display for SourceErrorWrapper<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} error at {}:{}: ",
            self.error.type_label(),
            self.span.start_line,
            self.span.start_col,
        )?;
        self.error.fmt_msg(f, &self.spanned_source)?;
        Ok(())
    }
}

/// A wrapper around a collection of errors. This holds the errors as well as
/// the source code, and can be used to render associated source code with
/// each error.
#[derive(Clone, Debug, Error, Serialize)]
pub struct WithSource<E: SourceError> {
    errors: Vec<SourceErrorWrapper<E>>,
    #[serde(skip)]
    source_code: String,
}

impl<E: SourceError> WithSource<E> {
    /// Wrap a collection of errors with its source code.
    pub(crate) fn new(
        errors: impl IntoIterator<Item = SourceErrorWrapper<E>>,
        source: String,
    ) -> Self {
        Self {
            errors: errors.into_iter().collect(),
            source_code: source,
        }
    }

    /// Get a reference to the errors wrapped by this type.
    pub fn errors(&self) -> &[SourceErrorWrapper<E>] {
        &self.errors
    }
}

impl<E: SourceError> Display for WithSource<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Write each error, separated by a newline
        for (i, error) in self.errors.iter().enumerate() {
            // Prefix with a newline for all errors but the first
            if i > 0 {
                writeln!(f)?;
            }

            write!(f, "{}", error)?;
            if f.alternate() {
                util::fmt_src_highlights(f, &error.span, &self.source_code)?;
            }
        }
        Ok(())
    }
}
