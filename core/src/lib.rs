//! Core implementation of the Tangle language: a small statically typed,
//! class-aware, quantum-classical hybrid language. Classical control flow is
//! interpreted directly; quantum gates are dispatched to an ideal
//! statevector simulator that also maintains an OpenQASM 2.0 transcript.
//!
//! The main usage of this crate is to compile a program from source and
//! execute it on a [Machine]:
//!
//! ```
//! use tangle::Compiler;
//!
//! let source = r#"
//! function main() -> void {
//!     qubit a;
//!     qubit b;
//!     h(a);
//!     cx(a, b);
//!     bit first = measure a;
//!     bit second = measure b;
//!     echo(first == second);
//! }
//! "#;
//!
//! // Compile (parse + semantic analysis)
//! let compiled = Compiler::compile(source.into()).unwrap();
//!
//! // Execute one shot
//! let mut machine = compiled.allocate();
//! machine.execute().unwrap();
//!
//! // The two halves of a Bell pair always agree
//! assert_eq!(machine.echo_output(), ["true"]);
//! ```

#![deny(clippy::all)]

mod analyze;
pub mod ast;
mod consts;
pub mod error;
mod heap;
mod machine;
mod parse;
mod registry;
mod simulator;
mod ty;
mod util;
mod value;

pub use consts::{GATE_NAMES, MAIN_FUNCTION};
pub use machine::Machine;
pub use ty::{Primitive, TypeInfo};
pub use util::Span;

use ast::Program;
use error::{CompileError, WithSource};
use registry::Registry;
use std::fmt::Debug;

/// A fully checked program: the syntax tree plus the class registry built
/// during analysis. Cloneable so the driver can allocate one [Machine] per
/// shot.
#[derive(Clone, Debug)]
pub struct CheckedProgram {
    pub(crate) program: Program,
    pub(crate) registry: Registry,
}

/// Struct used to compile a program. `T` represents the current type of the
/// program. It starts as `()`, and as the compiler executes, the program
/// gets transformed. See the library-level documentation for examples on how
/// to compile and execute a program.
#[derive(Debug)]
pub struct Compiler<T: Debug> {
    // These are deliberately private, to prevent direct construction
    source: String,
    ast: T,
}

impl Compiler<()> {
    /// Compile a source program: parse it into a syntax tree, then run
    /// semantic analysis against the class registry. The resulting checked
    /// program can allocate [Machine]s for execution.
    pub fn compile(
        source: String,
    ) -> Result<Compiler<CheckedProgram>, WithSource<CompileError>> {
        Ok(Self { source, ast: () }
            .debug()
            .parse()?
            .debug()
            .analyze()?
            .debug())
    }

    #[cfg(test)]
    pub(crate) fn for_source(source: String) -> Self {
        Self { source, ast: () }
    }
}

impl Compiler<CheckedProgram> {
    /// The shot count requested by `@shots(N)` on `main`, defaulting to 1.
    pub fn shots(&self) -> u64 {
        self.ast
            .registry
            .main_function()
            .and_then(|main| main.shots)
            .unwrap_or(1)
    }

    /// Allocate a new [Machine] to execute the checked program. Each
    /// machine runs the program exactly once (one shot); allocate one per
    /// shot and merge their tracked counts.
    pub fn allocate(&self) -> Machine {
        Machine::new(self.ast.clone(), self.source.clone(), None)
    }

    /// Like [Self::allocate], but with a fixed RNG seed for the simulator,
    /// so measurement outcomes are deterministic. Meant for tests.
    pub fn allocate_seeded(&self, seed: u64) -> Machine {
        Machine::new(self.ast.clone(), self.source.clone(), Some(seed))
    }
}

impl<T: Debug> Compiler<T> {
    /// Print out the current state of this compiler, if debug mode is
    /// enabled. Takes in self and returns the same value, so that this can
    /// be used in the function call chain.
    fn debug(self) -> Self {
        debug!(println!("{:?}", &self));
        self
    }
}
