//! The ideal statevector simulator. Owns the amplitude vector over the
//! computational basis, per-qubit measured flags, and the OpenQASM 2.0
//! transcript. The RNG is threaded through construction so tests can be
//! deterministic.

use crate::error::RuntimeError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::{Add, Mul, Sub};

const FRAC_1_SQRT_2: f64 = std::f64::consts::FRAC_1_SQRT_2;

/// A complex amplitude. The pack carries no complex-number crate, so this
/// small local type covers the handful of operations the simulator needs.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct Complex {
    pub re: f64,
    pub im: f64,
}

impl Complex {
    pub const ZERO: Complex = Complex { re: 0.0, im: 0.0 };
    pub const ONE: Complex = Complex { re: 1.0, im: 0.0 };

    pub fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    pub fn norm_sqr(&self) -> f64 {
        self.re * self.re + self.im * self.im
    }

    pub fn scale(&self, factor: f64) -> Self {
        Self::new(self.re * factor, self.im * factor)
    }
}

impl Add for Complex {
    type Output = Complex;
    fn add(self, rhs: Complex) -> Complex {
        Complex::new(self.re + rhs.re, self.im + rhs.im)
    }
}

impl Sub for Complex {
    type Output = Complex;
    fn sub(self, rhs: Complex) -> Complex {
        Complex::new(self.re - rhs.re, self.im - rhs.im)
    }
}

impl Mul for Complex {
    type Output = Complex;
    fn mul(self, rhs: Complex) -> Complex {
        Complex::new(
            self.re * rhs.re - self.im * rhs.im,
            self.re * rhs.im + self.im * rhs.re,
        )
    }
}

/// The statevector simulator. Amplitude vector length is always `2^n` for
/// `n` allocated qubits; it starts at `2^0 = 1` holding the empty `|0⟩`.
#[derive(Debug)]
pub(crate) struct Simulator {
    amplitudes: Vec<Complex>,
    /// Measured flag per qubit; gates on a measured qubit fail until reset
    measured: Vec<bool>,
    /// Whether each qubit was ever measured (for end-of-run warnings)
    ever_measured: Vec<bool>,
    num_qubits: usize,
    /// Appended QASM statements, in application order
    transcript: Vec<String>,
    logging: bool,
    rng: StdRng,
}

impl Simulator {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            amplitudes: vec![Complex::ONE],
            measured: Vec::new(),
            ever_measured: Vec::new(),
            num_qubits: 0,
            transcript: Vec::new(),
            logging: true,
            rng,
        }
    }

    pub fn set_logging(&mut self, logging: bool) {
        self.logging = logging;
    }

    pub fn num_qubits(&self) -> usize {
        self.num_qubits
    }

    pub fn was_ever_measured(&self, qubit: usize) -> bool {
        self.ever_measured.get(qubit).copied().unwrap_or(false)
    }

    /// Allocate a fresh qubit in |0⟩. Doubles the amplitude vector,
    /// keeping the existing state in the `|…0⟩` subspace.
    pub fn allocate_qubit(&mut self) -> usize {
        let old_len = self.amplitudes.len();
        self.amplitudes
            .extend(std::iter::repeat(Complex::ZERO).take(old_len));
        let index = self.num_qubits;
        self.num_qubits += 1;
        self.measured.push(false);
        self.ever_measured.push(false);
        index
    }

    fn log(&mut self, statement: String) {
        if self.logging {
            self.transcript.push(statement);
        }
    }

    /// Reject invalid indices, then measured qubits, before any state is
    /// touched.
    fn check_gate_target(&self, qubit: usize) -> Result<(), RuntimeError> {
        if qubit >= self.num_qubits {
            return Err(RuntimeError::InvalidQubit { qubit });
        }
        if self.measured[qubit] {
            return Err(RuntimeError::QubitMeasured { qubit });
        }
        Ok(())
    }

    /// Apply a 2x2 unitary to the target qubit: iterate the amplitude
    /// vector in blocks of `2*step` where `step = 2^q`, pairing indices
    /// that differ only at bit `q`.
    fn apply_single(&mut self, qubit: usize, matrix: [[Complex; 2]; 2]) {
        let step = 1 << qubit;
        let mut base = 0;
        while base < self.amplitudes.len() {
            for offset in 0..step {
                let zero = base + offset;
                let one = zero + step;
                let a = self.amplitudes[zero];
                let b = self.amplitudes[one];
                self.amplitudes[zero] =
                    matrix[0][0] * a + matrix[0][1] * b;
                self.amplitudes[one] = matrix[1][0] * a + matrix[1][1] * b;
            }
            base += 2 * step;
        }
    }

    pub fn h(&mut self, qubit: usize) -> Result<(), RuntimeError> {
        self.check_gate_target(qubit)?;
        let s = Complex::new(FRAC_1_SQRT_2, 0.0);
        self.apply_single(
            qubit,
            [[s, s], [s, Complex::new(-FRAC_1_SQRT_2, 0.0)]],
        );
        self.log(format!("h q[{}];", qubit));
        Ok(())
    }

    pub fn x(&mut self, qubit: usize) -> Result<(), RuntimeError> {
        self.check_gate_target(qubit)?;
        self.apply_single(
            qubit,
            [[Complex::ZERO, Complex::ONE], [Complex::ONE, Complex::ZERO]],
        );
        self.log(format!("x q[{}];", qubit));
        Ok(())
    }

    pub fn y(&mut self, qubit: usize) -> Result<(), RuntimeError> {
        self.check_gate_target(qubit)?;
        let i = Complex::new(0.0, 1.0);
        let neg_i = Complex::new(0.0, -1.0);
        self.apply_single(
            qubit,
            [[Complex::ZERO, neg_i], [i, Complex::ZERO]],
        );
        self.log(format!("y q[{}];", qubit));
        Ok(())
    }

    pub fn z(&mut self, qubit: usize) -> Result<(), RuntimeError> {
        self.check_gate_target(qubit)?;
        self.apply_single(
            qubit,
            [
                [Complex::ONE, Complex::ZERO],
                [Complex::ZERO, Complex::new(-1.0, 0.0)],
            ],
        );
        self.log(format!("z q[{}];", qubit));
        Ok(())
    }

    /// Rotations use the half-angle convention.
    pub fn rx(&mut self, qubit: usize, theta: f64) -> Result<(), RuntimeError> {
        self.check_gate_target(qubit)?;
        let half = theta / 2.0;
        let cos = Complex::new(half.cos(), 0.0);
        let neg_i_sin = Complex::new(0.0, -half.sin());
        self.apply_single(qubit, [[cos, neg_i_sin], [neg_i_sin, cos]]);
        self.log(format!("rx({}) q[{}];", theta, qubit));
        Ok(())
    }

    pub fn ry(&mut self, qubit: usize, theta: f64) -> Result<(), RuntimeError> {
        self.check_gate_target(qubit)?;
        let half = theta / 2.0;
        let cos = Complex::new(half.cos(), 0.0);
        let sin = Complex::new(half.sin(), 0.0);
        self.apply_single(
            qubit,
            [[cos, Complex::ZERO - sin], [sin, cos]],
        );
        self.log(format!("ry({}) q[{}];", theta, qubit));
        Ok(())
    }

    pub fn rz(&mut self, qubit: usize, theta: f64) -> Result<(), RuntimeError> {
        self.check_gate_target(qubit)?;
        let half = theta / 2.0;
        let phase_neg = Complex::new(half.cos(), -half.sin());
        let phase_pos = Complex::new(half.cos(), half.sin());
        self.apply_single(
            qubit,
            [
                [phase_neg, Complex::ZERO],
                [Complex::ZERO, phase_pos],
            ],
        );
        self.log(format!("rz({}) q[{}];", theta, qubit));
        Ok(())
    }

    /// Controlled-X: swap amplitudes at index pairs where the control bit
    /// is 1 and the target bit differs.
    pub fn cx(
        &mut self,
        control: usize,
        target: usize,
    ) -> Result<(), RuntimeError> {
        self.check_gate_target(control)?;
        self.check_gate_target(target)?;
        let control_bit = 1usize << control;
        let target_bit = 1usize << target;
        for index in 0..self.amplitudes.len() {
            if index & control_bit != 0 && index & target_bit == 0 {
                self.amplitudes.swap(index, index | target_bit);
            }
        }
        self.log(format!("cx q[{}],q[{}];", control, target));
        Ok(())
    }

    /// Measure in the computational basis: draw against P(|1⟩), zero the
    /// incompatible subspace, renormalize, and mark the qubit measured.
    pub fn measure(&mut self, qubit: usize) -> Result<u8, RuntimeError> {
        self.check_gate_target(qubit)?;
        let bit_mask = 1usize << qubit;
        let p_one: f64 = self
            .amplitudes
            .iter()
            .enumerate()
            .filter(|(index, _)| index & bit_mask != 0)
            .map(|(_, amp)| amp.norm_sqr())
            .sum();
        let sample: f64 = self.rng.gen();
        let outcome = if sample < p_one { 1u8 } else { 0u8 };

        let keep_one = outcome == 1;
        let mut norm = 0.0;
        for (index, amp) in self.amplitudes.iter_mut().enumerate() {
            let is_one = index & bit_mask != 0;
            if is_one != keep_one {
                *amp = Complex::ZERO;
            } else {
                norm += amp.norm_sqr();
            }
        }
        if norm > 0.0 {
            let factor = 1.0 / norm.sqrt();
            for amp in &mut self.amplitudes {
                *amp = amp.scale(factor);
            }
        }

        self.measured[qubit] = true;
        self.ever_measured[qubit] = true;
        self.log(format!("measure q[{}] -> c[{}];", qubit, qubit));
        Ok(outcome)
    }

    /// Return the qubit to |0⟩ and clear its measured flag. Never fails on
    /// a valid index. If all weight sits in the |1⟩ subspace, the
    /// amplitude is moved deterministically (no randomization).
    pub fn reset(&mut self, qubit: usize) -> Result<(), RuntimeError> {
        if qubit >= self.num_qubits {
            return Err(RuntimeError::InvalidQubit { qubit });
        }
        let bit_mask = 1usize << qubit;
        let norm_zero: f64 = self
            .amplitudes
            .iter()
            .enumerate()
            .filter(|(index, _)| index & bit_mask == 0)
            .map(|(_, amp)| amp.norm_sqr())
            .sum();

        if norm_zero == 0.0 {
            // Deterministically move |1⟩ weight into |0⟩
            for index in 0..self.amplitudes.len() {
                if index & bit_mask == 0 {
                    self.amplitudes[index] =
                        self.amplitudes[index | bit_mask];
                    self.amplitudes[index | bit_mask] = Complex::ZERO;
                }
            }
        } else {
            let factor = 1.0 / norm_zero.sqrt();
            for (index, amp) in self.amplitudes.iter_mut().enumerate() {
                if index & bit_mask != 0 {
                    *amp = Complex::ZERO;
                } else {
                    *amp = amp.scale(factor);
                }
            }
        }

        self.measured[qubit] = false;
        self.log(format!("reset q[{}];", qubit));
        Ok(())
    }

    /// Destruction courtesy: return the qubit to |0⟩ and mark it measured
    /// so the index can't silently receive further gates.
    pub fn retire(&mut self, qubit: usize) {
        let _ = self.reset(qubit);
        if qubit < self.num_qubits {
            // The reset statement is already in the transcript; just bar
            // further gates
            self.measured[qubit] = true;
        }
    }

    /// The full QASM 2.0 transcript. The register sizes reflect the real
    /// qubit count even when statement logging is off.
    pub fn qasm(&self) -> String {
        let mut out = String::from("OPENQASM 2.0;\ninclude \"qelib1.inc\";\n");
        out.push_str(&format!(
            "qreg q[{}];\ncreg c[{}];\n",
            self.num_qubits, self.num_qubits
        ));
        for statement in &self.transcript {
            out.push_str(statement);
            out.push('\n');
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn probability_of_one(&self, qubit: usize) -> f64 {
        let bit_mask = 1usize << qubit;
        self.amplitudes
            .iter()
            .enumerate()
            .filter(|(index, _)| index & bit_mask != 0)
            .map(|(_, amp)| amp.norm_sqr())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    #[test]
    fn test_allocate_doubles_state() {
        let mut sim = Simulator::new(Some(1));
        assert_eq!(sim.amplitudes.len(), 1);
        sim.allocate_qubit();
        assert_eq!(sim.amplitudes.len(), 2);
        sim.allocate_qubit();
        assert_eq!(sim.amplitudes.len(), 4);
        assert_eq!(sim.num_qubits(), 2);
    }

    #[test]
    fn test_fresh_qubit_measures_zero() {
        let mut sim = Simulator::new(Some(7));
        let q = sim.allocate_qubit();
        assert_eq!(sim.measure(q).unwrap(), 0);
    }

    #[test]
    fn test_x_flips_to_one() {
        let mut sim = Simulator::new(Some(7));
        let q = sim.allocate_qubit();
        sim.x(q).unwrap();
        assert_eq!(sim.measure(q).unwrap(), 1);
    }

    #[test]
    fn test_double_h_is_identity() {
        let mut sim = Simulator::new(Some(7));
        let q = sim.allocate_qubit();
        sim.h(q).unwrap();
        sim.h(q).unwrap();
        assert!(sim.probability_of_one(q) < EPSILON);
        assert_eq!(sim.measure(q).unwrap(), 0);
    }

    #[test]
    fn test_h_gives_even_superposition() {
        let mut sim = Simulator::new(Some(7));
        let q = sim.allocate_qubit();
        sim.h(q).unwrap();
        assert!((sim.probability_of_one(q) - 0.5).abs() < EPSILON);
    }

    #[test]
    fn test_bell_pair_correlated() {
        for seed in 0..16 {
            let mut sim = Simulator::new(Some(seed));
            let a = sim.allocate_qubit();
            let b = sim.allocate_qubit();
            sim.h(a).unwrap();
            sim.cx(a, b).unwrap();
            let first = sim.measure(a).unwrap();
            let second = sim.measure(b).unwrap();
            assert_eq!(first, second, "bell pair diverged at seed {}", seed);
        }
    }

    #[test]
    fn test_gate_after_measure_fails() {
        let mut sim = Simulator::new(Some(7));
        let q = sim.allocate_qubit();
        sim.measure(q).unwrap();
        assert!(matches!(
            sim.h(q),
            Err(RuntimeError::QubitMeasured { .. })
        ));
    }

    #[test]
    fn test_reset_restores_gate_access() {
        let mut sim = Simulator::new(Some(7));
        let q = sim.allocate_qubit();
        sim.x(q).unwrap();
        sim.measure(q).unwrap();
        sim.reset(q).unwrap();
        sim.h(q).unwrap();
        assert!((sim.probability_of_one(q) - 0.5).abs() < EPSILON);
    }

    #[test]
    fn test_reset_on_definite_one() {
        let mut sim = Simulator::new(Some(7));
        let q = sim.allocate_qubit();
        sim.x(q).unwrap();
        sim.reset(q).unwrap();
        assert!(sim.probability_of_one(q) < EPSILON);
    }

    #[test]
    fn test_invalid_qubit_rejected() {
        let mut sim = Simulator::new(Some(7));
        assert!(matches!(
            sim.h(3),
            Err(RuntimeError::InvalidQubit { qubit: 3 })
        ));
    }

    #[test]
    fn test_rx_pi_acts_like_x() {
        let mut sim = Simulator::new(Some(7));
        let q = sim.allocate_qubit();
        sim.rx(q, std::f64::consts::PI).unwrap();
        assert!((sim.probability_of_one(q) - 1.0).abs() < EPSILON);
    }

    #[test]
    fn test_transcript_format() {
        let mut sim = Simulator::new(Some(7));
        let a = sim.allocate_qubit();
        let b = sim.allocate_qubit();
        sim.h(a).unwrap();
        sim.cx(a, b).unwrap();
        sim.measure(a).unwrap();
        sim.measure(b).unwrap();
        assert_eq!(
            sim.qasm(),
            "OPENQASM 2.0;\n\
             include \"qelib1.inc\";\n\
             qreg q[2];\n\
             creg c[2];\n\
             h q[0];\n\
             cx q[0],q[1];\n\
             measure q[0] -> c[0];\n\
             measure q[1] -> c[1];\n"
        );
    }

    #[test]
    fn test_transcript_registers_without_logging() {
        let mut sim = Simulator::new(Some(7));
        sim.set_logging(false);
        sim.allocate_qubit();
        sim.allocate_qubit();
        sim.allocate_qubit();
        assert_eq!(
            sim.qasm(),
            "OPENQASM 2.0;\n\
             include \"qelib1.inc\";\n\
             qreg q[3];\n\
             creg c[3];\n"
        );
    }
}
