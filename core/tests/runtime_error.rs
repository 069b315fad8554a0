//! Integration tests for Tangle programs that compile but fail during
//! execution.

use tangle::Compiler;

/// Compile and execute the program, expecting a runtime error whose
/// rendered message contains the given fragment.
fn expect_runtime_error(src: &str, expected_fragment: &str) {
    let compiled = Compiler::compile(src.into())
        .unwrap_or_else(|err| panic!("Compile failed: {}", err));
    let mut machine = compiled.allocate_seeded(0);
    let error = machine
        .execute()
        .expect_err("expected a runtime error, but execution succeeded");
    let message = error.to_string();
    assert!(
        message.starts_with("Runtime error at"),
        "not a runtime error: {}",
        message
    );
    assert!(
        message.contains(expected_fragment),
        "expected `{}` in `{}`",
        expected_fragment,
        message
    );
}

#[test]
fn test_gate_after_measure() {
    expect_runtime_error(
        "
        function main() -> void {
            qubit q;
            measure q;
            h(q);
        }
        ",
        "already measured",
    );
}

#[test]
fn test_measure_after_measure() {
    expect_runtime_error(
        "
        function main() -> void {
            qubit q;
            measure q;
            measure q;
        }
        ",
        "already measured",
    );
}

#[test]
fn test_gate_after_measure_leaves_state_untouched() {
    // The failing gate must not appear in the transcript
    let compiled = Compiler::compile(
        "
        function main() -> void {
            qubit q;
            measure q;
            x(q);
        }
        "
        .into(),
    )
    .unwrap();
    let mut machine = compiled.allocate_seeded(0);
    machine.execute().unwrap_err();
    assert!(!machine.qasm().contains("x q[0];"));
}

#[test]
fn test_index_out_of_bounds() {
    expect_runtime_error(
        "
        function main() -> void {
            int[2] values;
            echo(values[2]);
        }
        ",
        "Index 2 out of bounds for array of length 2",
    );
}

#[test]
fn test_zero_length_array_index_fails() {
    expect_runtime_error(
        "
        function main() -> void {
            int[0] empty;
            echo(empty[0]);
        }
        ",
        "Index 0 out of bounds for array of length 0",
    );
}

#[test]
fn test_negative_array_size() {
    expect_runtime_error(
        "
        function main() -> void {
            final int n = -1;
            int[n] values;
        }
        ",
        "Negative array size -1",
    );
}

#[test]
fn test_divide_by_zero() {
    expect_runtime_error(
        "
        function main() -> void {
            int zero = 0;
            echo(1 / zero);
        }
        ",
        "Division by zero",
    );
}

#[test]
fn test_modulo_by_zero() {
    expect_runtime_error(
        "
        function main() -> void {
            int zero = 0;
            echo(1 % zero);
        }
        ",
        "Division by zero",
    );
}

#[test]
fn test_null_reference() {
    expect_runtime_error(
        "
        class A {
            constructor() -> A {}
            function f() -> int { return 1; }
        }
        function main() -> void {
            A a = null;
            echo(a.f());
        }
        ",
        "Null reference",
    );
}

#[test]
fn test_null_field_access() {
    expect_runtime_error(
        "
        class Node {
            public Node next;
            constructor() -> Node {}
        }
        function main() -> void {
            Node n = new Node();
            echo(n.next.next == null);
        }
        ",
        "Null reference",
    );
}

#[test]
fn test_machine_is_single_use() {
    let compiled =
        Compiler::compile("function main() -> void {}".into()).unwrap();
    let mut machine = compiled.allocate_seeded(0);
    machine.execute().unwrap();
    let error = machine.execute().unwrap_err();
    assert!(error.to_string().contains("exactly once"));
}

#[test]
fn test_bit_array_length_mismatch() {
    expect_runtime_error(
        "
        function main() -> void {
            bit[2] a;
            bit[3] b;
            bit[2] c = a & b;
        }
        ",
        "different lengths",
    );
}
