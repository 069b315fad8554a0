//! Integration tests for Tangle programs that should fail during
//! compilation (syntax or semantic analysis).

use tangle::Compiler;

/// Compile the program, expecting an error whose rendered message contains
/// the given fragment.
fn expect_compile_error(src: &str, expected_fragment: &str) {
    let error = Compiler::compile(src.into())
        .err()
        .expect("expected a compile error, but compilation succeeded");
    let message = error.to_string();
    assert!(
        message.contains(expected_fragment),
        "expected `{}` in `{}`",
        expected_fragment,
        message
    );
}

#[test]
fn test_syntax_error() {
    expect_compile_error(
        "function main( -> void {}",
        "Syntax error at",
    );
}

#[test]
fn test_unknown_name() {
    expect_compile_error(
        "function main() -> void { echo(x); }",
        "Unknown name `x`",
    );
}

#[test]
fn test_unknown_type() {
    expect_compile_error(
        "function main() -> void { Widget w = null; }",
        "Unknown type",
    );
}

#[test]
fn test_type_mismatch() {
    expect_compile_error(
        "function main() -> void { int x = \"hi\"; }",
        "expected `int`, found `string`",
    );
}

#[test]
fn test_condition_must_be_boolean_or_bit() {
    expect_compile_error(
        "function main() -> void { if (1) { echo(1); } }",
        "Condition must be boolean or bit",
    );
}

#[test]
fn test_missing_return() {
    expect_compile_error(
        "
        function f(int n) -> int {
            if (n > 0) {
                return 1;
            }
        }
        function main() -> void {}
        ",
        "`f` must return a value on every path",
    );
}

#[test]
fn test_final_field_assigned_in_branch() {
    // Final fields without initializers must be assigned as a top-level
    // statement of the constructor body, on every path
    expect_compile_error(
        "
        class Holder {
            private final int x;
            constructor(int v) -> Holder {
                if (v > 0) {
                    x = v;
                }
            }
        }
        function main() -> void {}
        ",
        "top level of the constructor body",
    );
}

#[test]
fn test_final_field_never_assigned() {
    expect_compile_error(
        "
        class Holder {
            private final int x;
            constructor() -> Holder {}
        }
        function main() -> void {}
        ",
        "must be assigned exactly once",
    );
}

#[test]
fn test_final_field_assigned_twice() {
    expect_compile_error(
        "
        class Holder {
            private final int x;
            constructor() -> Holder {
                x = 1;
                x = 2;
            }
        }
        function main() -> void {}
        ",
        "Cannot reassign final",
    );
}

#[test]
fn test_final_field_with_initializer_reassigned() {
    expect_compile_error(
        "
        class Holder {
            private final int x = 1;
            constructor() -> Holder {
                x = 2;
            }
        }
        function main() -> void {}
        ",
        "Cannot reassign final",
    );
}

#[test]
fn test_generic_bound_violation() {
    expect_compile_error(
        "
        class A { constructor() -> A {} }
        class Box<T extends A> {
            public T v;
            constructor(T v) -> Box<T> { this.v = v; }
        }
        function main() -> void {
            Box<string> bad = new Box<string>(\"hi\");
        }
        ",
        "does not satisfy the bound",
    );
}

#[test]
fn test_generic_arity() {
    expect_compile_error(
        "
        class A { constructor() -> A {} }
        function main() -> void {
            A<A> a = null;
        }
        ",
        "takes 0 type argument(s)",
    );
}

#[test]
fn test_super_not_first() {
    expect_compile_error(
        "
        class A { constructor() -> A {} }
        class B extends A {
            constructor() -> B {
                int x = 1;
                super();
            }
        }
        function main() -> void {}
        ",
        "first statement of the constructor body",
    );
}

#[test]
fn test_array_size_must_be_const() {
    expect_compile_error(
        "
        function main() -> void {
            int n = 3;
            int[n] values;
        }
        ",
        "compile-time integer constant",
    );
}

#[test]
fn test_array_equality_rejected() {
    expect_compile_error(
        "
        function main() -> void {
            int[2] a;
            int[2] b;
            echo(a == b);
        }
        ",
        "Arrays cannot be compared",
    );
}

#[test]
fn test_null_to_primitive_rejected() {
    expect_compile_error(
        "function main() -> void { int x = null; }",
        "`null` can only be used with class reference types",
    );
}

#[test]
fn test_invalid_cast() {
    expect_compile_error(
        "function main() -> void { string s = \"x\"; int i = (int) s; }",
        "Cannot cast `string` to `int`",
    );
}

#[test]
fn test_override_requires_virtual_base() {
    expect_compile_error(
        "
        class A {
            constructor() -> A {}
            function f() -> int { return 1; }
        }
        class B extends A {
            constructor() -> B {}
            override function f() -> int { return 2; }
        }
        function main() -> void {}
        ",
        "Invalid override: base method is not virtual",
    );
}

#[test]
fn test_override_return_type_must_match() {
    expect_compile_error(
        "
        class A {
            constructor() -> A {}
            virtual function f() -> int { return 1; }
        }
        class B extends A {
            constructor() -> B {}
            override function f() -> long { return 2L; }
        }
        function main() -> void {}
        ",
        "Invalid override: return type differs",
    );
}

#[test]
fn test_abstract_class_instantiation() {
    expect_compile_error(
        "
        abstract class A {
            constructor() -> A {}
            virtual function f() -> int;
        }
        function main() -> void {
            A a = new A();
        }
        ",
        "Cannot instantiate abstract class `A`",
    );
}

#[test]
fn test_class_with_abstract_method_is_forced_abstract() {
    expect_compile_error(
        "
        class A {
            constructor() -> A {}
            virtual function f() -> int;
        }
        function main() -> void {
            A a = new A();
        }
        ",
        "Cannot instantiate abstract class `A`",
    );
}

#[test]
fn test_ambiguous_overload() {
    expect_compile_error(
        "
        class A {
            constructor() -> A {}
            function f(long x, int y) -> int { return 1; }
            function f(int x, long y) -> int { return 2; }
        }
        function main() -> void {
            A a = new A();
            a.f(1, 2);
        }
        ",
        "Ambiguous call to `f`",
    );
}

#[test]
fn test_private_member_not_visible() {
    expect_compile_error(
        "
        class A {
            private int secret;
            constructor() -> A {}
        }
        function main() -> void {
            A a = new A();
            echo(a.secret);
        }
        ",
        "not visible here",
    );
}

#[test]
fn test_shots_only_on_main() {
    expect_compile_error(
        "
        @shots(4)
        function helper() -> void {}
        function main() -> void {}
        ",
        "@shots only annotates main",
    );
}

#[test]
fn test_quantum_not_on_main() {
    expect_compile_error(
        "
        @quantum
        function main() -> void {}
        ",
        "@quantum cannot annotate main",
    );
}

#[test]
fn test_quantum_return_type_restricted() {
    expect_compile_error(
        "
        @quantum
        function f() -> int { return 1; }
        function main() -> void {}
        ",
        "must return bit",
    );
}

#[test]
fn test_tracked_only_on_variables_and_fields() {
    expect_compile_error(
        "
        @tracked
        function f() -> void {}
        function main() -> void {}
        ",
        "@tracked only annotates variables and fields",
    );
}

#[test]
fn test_missing_main() {
    expect_compile_error(
        "function helper() -> void {}",
        "no `main` function",
    );
}

#[test]
fn test_duplicate_class() {
    expect_compile_error(
        "
        class A { constructor() -> A {} }
        class A { constructor() -> A {} }
        function main() -> void {}
        ",
        "Duplicate declaration of `A`",
    );
}

#[test]
fn test_inheritance_cycle() {
    expect_compile_error(
        "
        class A extends B { constructor() -> A {} }
        class B extends A { constructor() -> B {} }
        function main() -> void {}
        ",
        "inheritance cycle",
    );
}

#[test]
fn test_static_class_cannot_declare_instance_members() {
    expect_compile_error(
        "
        static class Util {
            public int x;
        }
        function main() -> void {}
        ",
        "Static classes cannot declare instance members",
    );
}

#[test]
fn test_missing_constructor() {
    expect_compile_error(
        "
        class A { public int x; }
        function main() -> void {}
        ",
        "must declare at least one constructor",
    );
}

#[test]
fn test_this_in_static_context() {
    expect_compile_error(
        "
        class A {
            constructor() -> A {}
            public static function f() -> int { return this.g(); }
            function g() -> int { return 1; }
        }
        function main() -> void {}
        ",
        "`this` cannot be used in a static context",
    );
}

#[test]
fn test_qubit_cannot_be_copied() {
    expect_compile_error(
        "
        function main() -> void {
            qubit a;
            qubit b = a;
        }
        ",
        "fresh qubit",
    );
}

#[test]
fn test_default_constructor_param_must_match_field() {
    expect_compile_error(
        "
        class Point {
            public int x;
            constructor(int x, int y) -> Point = default;
        }
        function main() -> void {}
        ",
        "no matching field",
    );
}
