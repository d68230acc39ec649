//! Transfer-function sweeps of the original and reduced systems.
//!
//! Both systems are solved in real-equivalent form: at `ω = 2πf`
//!
//! ```text
//! [ G - s0 C    -ω C     ] [x_re]   [b]
//! [   ω C     G - s0 C   ] [x_im] = [0]
//! ```
//!
//! with one factorization per frequency and one solve per port.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ferrite_core::{DaeMatrix, SparsityBuilder, SparsityPattern, VarId};
use log::debug;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;
use num_traits::Zero;
use serde::Serialize;

use super::reduced::ReducedSystem;
use crate::error::{Error, Result};
use crate::linear::{DirectSolver, FaerLu};

/// Frequency spacing of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SweepType {
    /// `np` points, evenly spaced.
    Lin,
    /// `np` points per decade.
    Dec,
    /// `np` points per octave.
    Oct,
}

impl FromStr for SweepType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LIN" => Ok(SweepType::Lin),
            "DEC" => Ok(SweepType::Dec),
            "OCT" => Ok(SweepType::Oct),
            _ => Err(Error::UnsupportedSweep(s.to_string())),
        }
    }
}

impl fmt::Display for SweepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SweepType::Lin => "LIN",
            SweepType::Dec => "DEC",
            SweepType::Oct => "OCT",
        };
        f.write_str(name)
    }
}

/// Slack on the point count of log sweeps so an exact number of decades or
/// octaves is not lost to rounding.
const COUNT_SLACK: f64 = 1e-9;

/// Sweep frequencies in Hz, in sweep order.
pub fn frequencies(kind: SweepType, np: usize, fstart: f64, fstop: f64) -> Vec<f64> {
    match kind {
        SweepType::Lin => {
            let step = if np > 1 {
                (fstop - fstart) / (np as f64 - 1.0)
            } else {
                0.0
            };
            (0..np).map(|i| fstart + step * i as f64).collect()
        }
        SweepType::Dec => {
            let mult = 10.0_f64.powf(1.0 / np as f64);
            let decades = (fstart.log10() - fstop.log10()).abs();
            let count = (decades * np as f64 + 1.0 + COUNT_SLACK).floor();
            (0..count as usize)
                .map(|i| fstart * mult.powi(i as i32))
                .collect()
        }
        SweepType::Oct => {
            let mult = 2.0_f64.powf(1.0 / np as f64);
            let octaves = (fstart.ln() - fstop.ln()).abs() / 2.0_f64.ln();
            let count = (octaves * np as f64 + 1.0 + COUNT_SLACK).floor();
            (0..count as usize)
                .map(|i| fstart * mult.powi(i as i32))
                .collect()
        }
    }
}

/// Port-to-port transfer matrix at one frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSnapshot {
    pub step: usize,
    pub frequency: f64,
    /// `h[(i, j)]`: response at port `i` to a unit drive at port `j`.
    pub h: DMatrix<Complex64>,
}

/// Which system a sweep failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SweepSystem {
    Original,
    Reduced,
}

impl fmt::Display for SweepSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepSystem::Original => f.write_str("original"),
            SweepSystem::Reduced => f.write_str("reduced"),
        }
    }
}

/// A frequency whose factorization or solve failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepFailure {
    pub system: SweepSystem,
    pub step: usize,
    pub frequency: f64,
    pub reason: String,
}

/// Outcome of one sweep: snapshots of the good frequencies and the failures.
#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    pub snapshots: Vec<TransferSnapshot>,
    pub failures: Vec<SweepFailure>,
}

impl SweepOutcome {
    fn collect(system: SweepSystem, results: Vec<PointResult>) -> Self {
        let mut out = SweepOutcome::default();
        for (step, frequency, res) in results {
            match res {
                Ok(h) => out.snapshots.push(TransferSnapshot { step, frequency, h }),
                Err(e) => {
                    debug!("{} system failed at f = {:.6e} Hz: {}", system, frequency, e);
                    out.failures.push(SweepFailure {
                        system,
                        step,
                        frequency,
                        reason: e.to_string(),
                    });
                }
            }
        }
        out
    }
}

/// `(step, frequency, H or the error)`.
type PointResult = (usize, f64, Result<DMatrix<Complex64>>);

#[cfg(feature = "parallel")]
fn map_frequencies<F>(freqs: &[f64], eval: F) -> Vec<PointResult>
where
    F: Fn(f64) -> Result<DMatrix<Complex64>> + Sync,
{
    use rayon::prelude::*;
    freqs
        .par_iter()
        .enumerate()
        .map(|(i, &f)| (i, f, eval(f)))
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn map_frequencies<F>(freqs: &[f64], eval: F) -> Vec<PointResult>
where
    F: Fn(f64) -> Result<DMatrix<Complex64>>,
{
    freqs
        .iter()
        .enumerate()
        .map(|(i, &f)| (i, f, eval(f)))
        .collect()
}

/// Pattern of the 2N real-equivalent matrix: the base pattern in all four blocks.
pub fn block_pattern(base: &SparsityPattern) -> Result<Arc<SparsityPattern>> {
    let n = base.size();
    let mut builder = SparsityBuilder::new(2 * n);
    let (row_ptr, col_idx) = (base.row_ptr(), base.col_idx());
    for r in 0..n {
        for &c in &col_idx[row_ptr[r]..row_ptr[r + 1]] {
            for (dr, dc) in [(0, 0), (0, n), (n, 0), (n, n)] {
                builder.request(VarId::new(r + dr), VarId::new(c + dc))?;
            }
        }
    }
    builder.ensure_diagonal();
    Ok(Arc::new(builder.finalize()))
}

/// Load `[[G - s0 C, -ωC], [ωC, G - s0 C]]` into `block`.
pub fn fill_block(
    block: &mut DaeMatrix,
    g: &DaeMatrix,
    c: &DaeMatrix,
    s0: f64,
    omega: f64,
) -> Result<()> {
    let n = g.size();
    block.zero();
    for (r, col, v) in g.triplets() {
        if v != 0.0 {
            block.set(r, col, block.get(r, col) + v)?;
            block.set(r + n, col + n, block.get(r + n, col + n) + v)?;
        }
    }
    for (r, col, v) in c.triplets() {
        if v == 0.0 {
            continue;
        }
        if s0 != 0.0 {
            block.set(r, col, block.get(r, col) - s0 * v)?;
            block.set(r + n, col + n, block.get(r + n, col + n) - s0 * v)?;
        }
        block.set(r, col + n, -omega * v)?;
        block.set(r + n, col, omega * v)?;
    }
    Ok(())
}

/// Sweeps `H(f)` of the full sparse system at the port rows.
pub struct OriginalSweep<'a> {
    g: &'a DaeMatrix,
    c: &'a DaeMatrix,
    port_rows: &'a [usize],
    s0: f64,
    template: DaeMatrix,
    solver: FaerLu,
}

impl<'a> OriginalSweep<'a> {
    /// Build the block pattern and run the symbolic factorization once.
    pub fn new(
        g: &'a DaeMatrix,
        c: &'a DaeMatrix,
        port_rows: &'a [usize],
        s0: f64,
    ) -> Result<Self> {
        let pattern = block_pattern(g.pattern())?;
        let mut template = DaeMatrix::new(pattern);
        fill_block(&mut template, g, c, s0, 1.0)?;
        let mut solver = FaerLu::new();
        solver.symbolic_factorization(&template)?;
        Ok(Self {
            g,
            c,
            port_rows,
            s0,
            template,
            solver,
        })
    }

    /// Transfer matrix at `freq`.
    pub fn eval(&self, freq: f64) -> Result<DMatrix<Complex64>> {
        let n = self.g.size();
        let p = self.port_rows.len();
        let mut block = self.template.clone();
        fill_block(&mut block, self.g, self.c, self.s0, 2.0 * PI * freq)?;
        let mut lu = self.solver.fork();
        lu.numeric_factorization(&block)?;

        let mut h = DMatrix::from_element(p, p, Complex64::zero());
        let mut rhs = DVector::zeros(2 * n);
        for (j, &drive) in self.port_rows.iter().enumerate() {
            rhs.fill(0.0);
            rhs[drive] = -1.0;
            let x = lu.solve(&rhs)?;
            for (i, &row) in self.port_rows.iter().enumerate() {
                h[(i, j)] = Complex64::new(-x[row], -x[row + n]);
            }
        }
        Ok(h)
    }

    pub fn run(&self, freqs: &[f64]) -> SweepOutcome {
        SweepOutcome::collect(SweepSystem::Original, map_frequencies(freqs, |f| self.eval(f)))
    }
}

/// Sweeps `H(f) = L̂ᵀ y` of a dense reduced system.
pub struct ReducedSweep<'a> {
    red: &'a ReducedSystem,
    /// Diagonal blocks `Ĝ - s0 Ĉ`, computed once.
    shifted: DMatrix<f64>,
}

impl<'a> ReducedSweep<'a> {
    pub fn new(red: &'a ReducedSystem, s0: f64) -> Self {
        let shifted = &red.g - &red.c * s0;
        Self { red, shifted }
    }

    pub fn eval(&self, freq: f64) -> Result<DMatrix<Complex64>> {
        let k = self.red.order();
        let p = self.red.num_ports();
        let omega = 2.0 * PI * freq;
        let mut m = DMatrix::zeros(2 * k, 2 * k);
        m.view_mut((0, 0), (k, k)).copy_from(&self.shifted);
        m.view_mut((k, k), (k, k)).copy_from(&self.shifted);
        m.view_mut((0, k), (k, k)).copy_from(&(&self.red.c * -omega));
        m.view_mut((k, 0), (k, k)).copy_from(&(&self.red.c * omega));

        let mut rhs = DMatrix::zeros(2 * k, p);
        rhs.view_mut((0, 0), (k, p)).copy_from(&self.red.b);

        let y = m.lu().solve(&rhs).ok_or(Error::SingularMatrix)?;
        if y.iter().any(|v| !v.is_finite()) {
            return Err(Error::SingularMatrix);
        }
        let re = self.red.l.tr_mul(&y.rows(0, k));
        let im = self.red.l.tr_mul(&y.rows(k, k));
        Ok(DMatrix::from_fn(p, p, |i, j| Complex64::new(re[(i, j)], im[(i, j)])))
    }

    pub fn run(&self, freqs: &[f64]) -> SweepOutcome {
        SweepOutcome::collect(SweepSystem::Reduced, map_frequencies(freqs, |f| self.eval(f)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dmatrix;

    fn close(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len()
            && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= 1e-9 * y.abs().max(1.0))
    }

    #[test]
    fn sweep_type_parses_case_insensitively() {
        assert_eq!("dec".parse::<SweepType>().unwrap(), SweepType::Dec);
        assert_eq!("LIN".parse::<SweepType>().unwrap(), SweepType::Lin);
        assert_eq!("Oct".parse::<SweepType>().unwrap(), SweepType::Oct);
        assert!(matches!(
            "LOG".parse::<SweepType>(),
            Err(Error::UnsupportedSweep(s)) if s == "LOG"
        ));
    }

    #[test]
    fn linear_grid() {
        let f = frequencies(SweepType::Lin, 5, 1.0, 5.0);
        assert!(close(&f, &[1.0, 2.0, 3.0, 4.0, 5.0]));
        assert_eq!(frequencies(SweepType::Lin, 1, 7.0, 100.0), vec![7.0]);
        assert!(frequencies(SweepType::Lin, 0, 1.0, 2.0).is_empty());
    }

    #[test]
    fn decade_and_octave_grids() {
        let f = frequencies(SweepType::Dec, 2, 1.0, 100.0);
        assert!(close(&f, &[1.0, 10f64.sqrt(), 10.0, 10.0 * 10f64.sqrt(), 100.0]));

        let f = frequencies(SweepType::Oct, 1, 1e3, 8e3);
        assert!(close(&f, &[1e3, 2e3, 4e3, 8e3]));
    }

    #[test]
    fn reduced_sweep_of_first_order_system() {
        // H(s) = 1 / (1 + s) at ω = 1
        let red = ReducedSystem {
            g: dmatrix![1.0],
            c: dmatrix![1.0],
            b: dmatrix![1.0],
            l: dmatrix![1.0],
        };
        let sweep = ReducedSweep::new(&red, 0.0);
        let h = sweep.eval(1.0 / (2.0 * PI)).unwrap();
        assert!((h[(0, 0)] - Complex64::new(0.5, -0.5)).norm() < 1e-12);
    }

    #[test]
    fn singular_reduced_system_is_recorded_and_sweep_continues() {
        // G - s0 C vanishes, so only ω = 0 is singular
        let red = ReducedSystem {
            g: dmatrix![0.0],
            c: dmatrix![1.0],
            b: dmatrix![1.0],
            l: dmatrix![1.0],
        };
        let out = ReducedSweep::new(&red, 0.0).run(&[0.0, 1.0, 2.0]);
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].step, 0);
        assert_eq!(out.failures[0].system, SweepSystem::Reduced);
        assert_eq!(out.snapshots.len(), 2);
        assert_eq!(out.snapshots[0].step, 1);
        assert_eq!(out.snapshots[1].frequency, 2.0);
    }

    #[test]
    fn block_pattern_mirrors_base() {
        let mut b = SparsityBuilder::new(2);
        b.request(VarId::new(0), VarId::new(1)).unwrap();
        b.ensure_diagonal();
        let base = b.finalize();
        let block = block_pattern(&base).unwrap();
        assert_eq!(block.size(), 4);
        assert_eq!(block.nnz(), 4 * base.nnz());
        assert!(block.position(0, 3).is_some());
        assert!(block.position(2, 1).is_some());
        assert!(block.position(1, 0).is_none());
    }
}
