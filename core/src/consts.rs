/// Name of the entry-point function. Programs without a function of this name
/// are rejected during semantic analysis.
pub const MAIN_FUNCTION: &str = "main";

/// The implicit root of the class hierarchy. Injected into the registry when
/// the program doesn't declare it. It cannot be generic and cannot declare a
/// base class.
pub const OBJECT_CLASS: &str = "Object";

/// Built-in gate names. Calls to these dispatch straight to the statevector
/// simulator instead of a user function.
pub const GATE_NAMES: &[&str] = &["h", "x", "y", "z", "rx", "ry", "rz", "cx"];

/// Rotation gates take an angle argument in addition to a qubit.
pub const ROTATION_GATES: &[&str] = &["rx", "ry", "rz"];

/// How long the cycle-collector worker sleeps between setting the pending
/// flag. The mutator checks the flag at statement boundaries, so the actual
/// collection cadence is at least this long.
pub const COLLECTOR_WAKE_MILLIS: u64 = 50;

/// The class-name suffix used to encode array types. The element type is
/// carried in the first type argument.
pub const ARRAY_SUFFIX: &str = "[]";
