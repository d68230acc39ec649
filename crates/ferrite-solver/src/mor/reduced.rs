//! Projected (reduced) systems.

use ferrite_core::DaeMatrix;
use nalgebra::DMatrix;

use crate::error::{Error, Result};

/// Dense reduced system `(Ĝ, Ĉ, B̂, L̂)` with transfer function `L̂ᵀ (Ĝ + sĈ)⁻¹ B̂`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedSystem {
    /// k x k
    pub g: DMatrix<f64>,
    /// k x k
    pub c: DMatrix<f64>,
    /// k x ports
    pub b: DMatrix<f64>,
    /// k x ports
    pub l: DMatrix<f64>,
}

impl ReducedSystem {
    pub fn order(&self) -> usize {
        self.g.nrows()
    }

    pub fn num_ports(&self) -> usize {
        self.b.ncols()
    }
}

/// `A * X` for a sparse `A` and dense `X`.
pub fn sparse_times_dense(a: &DaeMatrix, x: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if a.size() != x.nrows() {
        return Err(Error::DimensionMismatch {
            expected: a.size(),
            actual: x.nrows(),
        });
    }
    let mut out = DMatrix::zeros(x.nrows(), x.ncols());
    for j in 0..x.ncols() {
        let col = x.column(j).clone_owned();
        let mut y = vec![0.0; x.nrows()];
        a.matvec(col.as_slice(), &mut y);
        out.set_column(j, &nalgebra::DVector::from_vec(y));
    }
    Ok(out)
}

/// Project `(G, C, B)` onto the basis.
///
/// `w` is the orthonormal basis and `v` the (possibly scaled) one:
/// `Ĝ = Wᵀ G V`, `Ĉ = Wᵀ C V`, `B̂ = Wᵀ B`, `L̂ = Vᵀ B`. Column scaling then
/// cancels in the transfer function.
pub fn project(
    g: &DaeMatrix,
    c: &DaeMatrix,
    b: &DMatrix<f64>,
    w: &DMatrix<f64>,
    v: &DMatrix<f64>,
) -> Result<ReducedSystem> {
    if w.shape() != v.shape() {
        return Err(Error::DimensionMismatch {
            expected: w.ncols(),
            actual: v.ncols(),
        });
    }
    let gv = sparse_times_dense(g, v)?;
    let cv = sparse_times_dense(c, v)?;
    Ok(ReducedSystem {
        g: w.tr_mul(&gv),
        c: w.tr_mul(&cv),
        b: w.tr_mul(b),
        l: v.tr_mul(b),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_core::{SparsityBuilder, VarId};
    use nalgebra::dmatrix;
    use std::sync::Arc;

    fn dense_to_dae(m: &DMatrix<f64>) -> DaeMatrix {
        let mut b = SparsityBuilder::new(m.nrows());
        for i in 0..m.nrows() {
            for j in 0..m.ncols() {
                if m[(i, j)] != 0.0 && i != j {
                    b.request(VarId::new(i), VarId::new(j)).unwrap();
                }
            }
        }
        b.ensure_diagonal();
        let mut out = DaeMatrix::new(Arc::new(b.finalize()));
        for i in 0..m.nrows() {
            for j in 0..m.ncols() {
                if m[(i, j)] != 0.0 {
                    out.set(i, j, m[(i, j)]).unwrap();
                }
            }
        }
        out
    }

    #[test]
    fn sparse_product_matches_dense() {
        let a = dmatrix![1.0, 2.0, 0.0; 0.0, 3.0, -1.0; 4.0, 0.0, 5.0];
        let x = dmatrix![1.0, 0.5; -1.0, 2.0; 0.0, 1.0];
        let got = sparse_times_dense(&dense_to_dae(&a), &x).unwrap();
        assert!((got - &a * &x).amax() < 1e-15);
    }

    #[test]
    fn scaled_basis_keeps_port_response() {
        let g = dmatrix![2.0, -1.0, 0.0; -1.0, 2.0, -1.0; 0.0, -1.0, 2.0];
        let c = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![1.0, 2.0, 3.0]));
        let b = dmatrix![-1.0; 0.0; 0.0];
        let (gs, cs) = (dense_to_dae(&g), dense_to_dae(&c));
        let w = DMatrix::<f64>::identity(3, 3);
        let v = &w * DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![0.5, 4.0, 2.0]));

        let plain = project(&gs, &cs, &b, &w, &w).unwrap();
        let scaled = project(&gs, &cs, &b, &w, &v).unwrap();
        let s = 0.7;
        let h = |r: &ReducedSystem| {
            let m = &r.g + &r.c * s;
            let x = m.lu().solve(&r.b).unwrap();
            (r.l.transpose() * x)[(0, 0)]
        };
        assert!((h(&plain) - h(&scaled)).abs() < 1e-12);
        assert_eq!(plain.order(), 3);
        assert_eq!(plain.num_ports(), 1);
    }
}
