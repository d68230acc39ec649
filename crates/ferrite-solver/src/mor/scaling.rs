//! Column scaling of the projection basis.
//!
//! Policies:
//! - 0: none
//! - 1: every column divided by `factor`
//! - 2: columns measured against `factor`, then scaled by `factor` or `factor1`
//!   depending on whether the measure exceeds `factor`
//! - 3: columns scaled in proportion to their magnitude
//! - 4: like 2 but measured against unit weights and saturating at 1
//!
//! A column's measure is the projection of the weight vector onto it.

use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};

/// Largest supported policy number.
pub const MAX_SCALE_TYPE: u8 = 4;

/// Per-column divisors for `basis` under `scale_type`, or `None` for policy 0.
///
/// A zero divisor means the column is left unscaled.
pub fn scale_vector(
    basis: &DMatrix<f64>,
    scale_type: u8,
    factor: f64,
    factor1: f64,
) -> Result<Option<DVector<f64>>> {
    let k = basis.ncols();
    let measure = |weight: f64| -> DVector<f64> {
        let w = DVector::from_element(basis.nrows(), weight);
        basis.tr_mul(&w)
    };
    let scales = match scale_type {
        0 => return Ok(None),
        1 => DVector::from_element(k, factor),
        2 => measure(factor).map(|x| saturate(x, factor, factor, factor1)),
        3 => measure(1.0).map(|x| factor * x.abs()),
        4 => measure(1.0).map(|x| saturate(x, 1.0, factor, factor1)),
        other => {
            return Err(Error::InvalidParameter(format!(
                "basis scale type {} (expected 0..={})",
                other, MAX_SCALE_TYPE
            )));
        }
    };
    Ok(Some(scales))
}

fn saturate(x: f64, limit: f64, factor: f64, factor1: f64) -> f64 {
    let mag = x.abs();
    if mag == 0.0 {
        0.0
    } else if mag > limit {
        factor / mag
    } else {
        factor1 / mag
    }
}

/// Divide each basis column by its scale; zero scales leave the column alone.
pub fn apply_scaling(basis: &DMatrix<f64>, scales: &DVector<f64>) -> DMatrix<f64> {
    let mut scaled = basis.clone();
    for (j, &s) in scales.iter().enumerate() {
        if s != 0.0 {
            scaled.column_mut(j).scale_mut(1.0 / s);
        }
    }
    scaled
}
