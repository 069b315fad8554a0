//! Integration tests for Tangle programs that should compile and execute
//! successfully.

use tangle::Compiler;

/// Compile and execute the program (one shot, seeded), panicking on any
/// error. Returns the echo output.
fn execute_expect_success(src: &str) -> Vec<String> {
    let compiled = Compiler::compile(src.into())
        .unwrap_or_else(|err| panic!("Compile failed: {}", err));
    let mut machine = compiled.allocate_seeded(0);
    machine
        .execute()
        .unwrap_or_else(|err| panic!("Execution failed: {}", err));
    machine.echo_output().to_vec()
}

#[test]
fn test_bell_state_transcript() {
    let compiled = Compiler::compile(
        "
        function main() -> void {
            qubit q0;
            qubit q1;
            h(q0);
            cx(q0, q1);
            measure q0;
            measure q1;
        }
        "
        .into(),
    )
    .unwrap();

    for seed in 0..8 {
        let mut machine = compiled.allocate_seeded(seed);
        machine.execute().unwrap();
        assert_eq!(
            machine.qasm(),
            "OPENQASM 2.0;\n\
             include \"qelib1.inc\";\n\
             qreg q[2];\n\
             creg c[2];\n\
             h q[0];\n\
             cx q[0],q[1];\n\
             measure q[0] -> c[0];\n\
             measure q[1] -> c[1];\n"
        );
        // The two halves of a Bell pair always agree
        let bits = machine.measurements();
        assert_eq!(bits.len(), 2);
        assert_eq!(bits[0], bits[1], "diverged at seed {}", seed);
    }
}

#[test]
fn test_virtual_dispatch() {
    let output = execute_expect_success(
        "
        class A {
            constructor() -> A {}
            virtual function f() -> int { return 1; }
        }
        class B extends A {
            constructor() -> B {}
            override function f() -> int { return 2; }
        }
        function main() -> void {
            A a = new B();
            echo(a.f());
        }
        ",
    );
    assert_eq!(output, ["2"]);
}

#[test]
fn test_tracked_qubit_histogram_over_shots() {
    let compiled = Compiler::compile(
        "
        @shots(8)
        function main() -> void {
            @tracked qubit q;
            h(q);
            measure q;
        }
        "
        .into(),
    )
    .unwrap();
    assert_eq!(compiled.shots(), 8);

    let mut zeroes = 0;
    let mut ones = 0;
    for shot in 0..compiled.shots() {
        let mut machine = compiled.allocate_seeded(shot);
        machine.execute().unwrap();
        let counts = &machine.tracked_counts()["qubit q"];
        zeroes += counts.get("0").copied().unwrap_or(0);
        ones += counts.get("1").copied().unwrap_or(0);
    }
    assert_eq!(zeroes + ones, 8);
}

#[test]
fn test_generic_bound_accepts_subclass() {
    let output = execute_expect_success(
        "
        class A {
            constructor() -> A {}
            virtual function tag() -> int { return 1; }
        }
        class B extends A {
            constructor() -> B {}
            override function tag() -> int { return 2; }
        }
        class Box<T extends A> {
            public T v;
            constructor(T v) -> Box<T> { this.v = v; }
        }
        function main() -> void {
            Box<B> b = new Box<B>(new B());
            echo(b.v.tag());
        }
        ",
    );
    assert_eq!(output, ["2"]);
}

#[test]
fn test_destructors_run_derived_first() {
    let output = execute_expect_success(
        "
        class Base {
            constructor() -> Base {}
            destructor() { echo(\"base gone\"); }
        }
        class Derived extends Base {
            constructor() -> Derived {}
            destructor() { echo(\"derived gone\"); }
        }
        function main() -> void {
            Derived d = new Derived();
            destroy d;
            echo(\"after\");
        }
        ",
    );
    assert_eq!(output, ["derived gone", "base gone", "after"]);
}

#[test]
fn test_double_destroy_is_noop() {
    let output = execute_expect_success(
        "
        class Loud {
            constructor() -> Loud {}
            destructor() { echo(\"gone\"); }
        }
        function main() -> void {
            Loud l = new Loud();
            destroy l;
            destroy l;
            echo(\"end\");
        }
        ",
    );
    assert_eq!(output, ["gone", "end"]);
}

#[test]
fn test_cycle_collector_skips_destructors() {
    let compiled = Compiler::compile(
        "
        class Pair {
            public Pair partner;
            constructor() -> Pair {}
            destructor() { echo(\"dtor\"); }
        }
        function main() -> void {
            Pair a = new Pair();
            Pair b = new Pair();
            a.partner = b;
            b.partner = a;
            destroy a;
            destroy b;
            echo(\"done\");
        }
        "
        .into(),
    )
    .unwrap();
    let mut machine = compiled.allocate_seeded(0);
    machine.execute().unwrap();
    // The cycle was unreachable and untracked: destructors are skipped and
    // the objects are gone
    assert_eq!(machine.echo_output(), ["done"]);
    assert_eq!(machine.heap_size(), 0);
}

#[test]
fn test_static_fields_and_methods() {
    let output = execute_expect_success(
        "
        class Counter {
            public static int total = 0;
            constructor() -> Counter {}
            public static function bump() -> int {
                total = total + 1;
                return total;
            }
        }
        function main() -> void {
            Counter.bump();
            Counter.bump();
            echo(Counter.total);
        }
        ",
    );
    assert_eq!(output, ["2"]);
}

#[test]
fn test_field_initializers_and_constructor_chain() {
    let output = execute_expect_success(
        "
        class Shape {
            public int sides;
            constructor(int sides) -> Shape {
                this.sides = sides;
            }
            virtual function describe() -> string { return \"shape\"; }
        }
        class Square extends Shape {
            public string label = \"sq\";
            constructor() -> Square {
                super(4);
            }
            override function describe() -> string {
                return super.describe() + \":\" + this.sides + \":\" + this.label;
            }
        }
        function main() -> void {
            Shape s = new Square();
            echo(s.describe());
        }
        ",
    );
    assert_eq!(output, ["shape:4:sq"]);
}

#[test]
fn test_default_constructor_binds_fields() {
    let output = execute_expect_success(
        "
        class Point {
            public int x;
            public int y;
            constructor(int x, int y) -> Point = default;
        }
        function main() -> void {
            Point p = new Point(3, 4);
            echo(p.x + p.y);
        }
        ",
    );
    assert_eq!(output, ["7"]);
}

#[test]
fn test_arithmetic_and_promotion() {
    let output = execute_expect_success(
        "
        function main() -> void {
            int a = 7;
            long b = a + 1L;
            float c = 1.5;
            echo(a / 2);
            echo(a % 2);
            echo(b);
            echo(c * 2.0);
            echo(\"n=\" + a);
            echo((bit) 3);
            echo((float) a);
        }
        ",
    );
    assert_eq!(output, ["3", "1", "8", "3", "n=7", "1", "7"]);
}

#[test]
fn test_control_flow_and_postfix() {
    let output = execute_expect_success(
        "
        function main() -> void {
            int total = 0;
            for (int i = 0; i < 5; i++) {
                total += i;
            }
            echo(total);
            int n = 3;
            while (n > 0) {
                n--;
            }
            echo(n);
            echo(n == 0 ? \"zero\" : \"nonzero\");
        }
        ",
    );
    assert_eq!(output, ["10", "0", "zero"]);
}

#[test]
fn test_recursive_function() {
    let output = execute_expect_success(
        "
        function fib(int n) -> int {
            if (n < 2) {
                return n;
            }
            return fib(n - 1) + fib(n - 2);
        }
        function main() -> void {
            echo(fib(10));
        }
        ",
    );
    assert_eq!(output, ["55"]);
}

#[test]
fn test_fixed_size_arrays() {
    let output = execute_expect_success(
        "
        function main() -> void {
            int[4] regs;
            regs[0] = 5;
            regs[3] = regs[0] + 1;
            echo(regs[3]);
            echo(regs[1]);
        }
        ",
    );
    assert_eq!(output, ["6", "0"]);
}

#[test]
fn test_array_size_from_final_constant() {
    let output = execute_expect_success(
        "
        function main() -> void {
            final int n = 2 + 1;
            int[n] values;
            values[2] = 9;
            echo(values[2]);
        }
        ",
    );
    assert_eq!(output, ["9"]);
}

#[test]
fn test_measure_reset_cycle() {
    let output = execute_expect_success(
        "
        function main() -> void {
            qubit q;
            x(q);
            bit first = measure q;
            reset q;
            bit second = measure q;
            echo(first);
            echo(second);
        }
        ",
    );
    assert_eq!(output, ["1", "0"]);
}

#[test]
fn test_bit_operations() {
    let output = execute_expect_success(
        "
        function main() -> void {
            qubit q;
            bit b = measure q;
            bit c = b | (bit) 1;
            echo(c);
            echo(b & c);
            echo(b ^ c);
        }
        ",
    );
    assert_eq!(output, ["1", "0", "1"]);
}

#[test]
fn test_quantum_function_returns_bit() {
    let output = execute_expect_success(
        "
        @quantum
        function excite(qubit q) -> bit {
            x(q);
            return measure q;
        }
        function main() -> void {
            qubit q;
            echo(excite(q));
        }
        ",
    );
    assert_eq!(output, ["1"]);
}

#[test]
fn test_tracked_qubit_array() {
    let compiled = Compiler::compile(
        "
        function main() -> void {
            @tracked qubit[2] qs;
            x(qs[0]);
            measure qs[0];
            measure qs[1];
        }
        "
        .into(),
    )
    .unwrap();
    let mut machine = compiled.allocate_seeded(0);
    machine.execute().unwrap();
    let counts = &machine.tracked_counts()["qubit[] qs"];
    assert_eq!(counts.get("10").copied().unwrap_or(0), 1);
}

#[test]
fn test_unmeasured_tracked_qubit_counts_unknown() {
    let compiled = Compiler::compile(
        "
        function main() -> void {
            @tracked qubit q;
            h(q);
        }
        "
        .into(),
    )
    .unwrap();
    let mut machine = compiled.allocate_seeded(0);
    machine.execute().unwrap();
    let counts = &machine.tracked_counts()["qubit q"];
    assert_eq!(counts.get("?").copied().unwrap_or(0), 1);
    // And the exit warning fires for the unmeasured qubit
    assert!(machine.warnings().iter().any(|w| w.contains("never measured")));
}

#[test]
fn test_transcript_reflects_registers_without_logging() {
    let compiled = Compiler::compile(
        "
        function main() -> void {
            qubit a;
            qubit b;
            h(a);
            measure a;
            measure b;
        }
        "
        .into(),
    )
    .unwrap();
    let mut machine = compiled.allocate_seeded(0);
    machine.set_transcript(false);
    machine.execute().unwrap();
    assert_eq!(
        machine.qasm(),
        "OPENQASM 2.0;\n\
         include \"qelib1.inc\";\n\
         qreg q[2];\n\
         creg c[2];\n"
    );
}

#[test]
fn test_rotation_gate_transcript() {
    let compiled = Compiler::compile(
        "
        function main() -> void {
            qubit q;
            rx(q, 1.5);
            measure q;
        }
        "
        .into(),
    )
    .unwrap();
    let mut machine = compiled.allocate_seeded(0);
    machine.execute().unwrap();
    assert!(machine.qasm().contains("rx(1.5) q[0];"));
}

#[test]
fn test_null_handling() {
    let output = execute_expect_success(
        "
        class Node {
            public Node next;
            constructor() -> Node {}
        }
        function main() -> void {
            Node n = new Node();
            echo(n.next == null);
            n.next = new Node();
            echo(n.next != null);
        }
        ",
    );
    assert_eq!(output, ["true", "true"]);
}

#[test]
fn test_zero_length_array_constructs() {
    let output = execute_expect_success(
        "
        function main() -> void {
            int[0] empty;
            echo(\"ok\");
        }
        ",
    );
    assert_eq!(output, ["ok"]);
}
