//! Solution, state and store vector families.

use nalgebra::DVector;

/// Every per-unknown vector an analysis carries between time points.
///
/// The three solution vectors hold unknowns at the new (`next`), current and
/// previous time points. `state` vectors hold device-internal quantities such
/// as capacitor charge, and `store` vectors hold output-only quantities such as
/// lead currents.
#[derive(Debug, Clone, PartialEq)]
pub struct SolutionSet {
    pub next_solution: DVector<f64>,
    pub curr_solution: DVector<f64>,
    pub last_solution: DVector<f64>,
    pub next_state: DVector<f64>,
    pub curr_state: DVector<f64>,
    pub last_state: DVector<f64>,
    pub next_state_deriv: DVector<f64>,
    pub next_store: DVector<f64>,
    pub curr_store: DVector<f64>,
    pub last_store: DVector<f64>,
}

impl SolutionSet {
    pub fn new(num_unknowns: usize, num_states: usize, num_stores: usize) -> Self {
        Self {
            next_solution: DVector::zeros(num_unknowns),
            curr_solution: DVector::zeros(num_unknowns),
            last_solution: DVector::zeros(num_unknowns),
            next_state: DVector::zeros(num_states),
            curr_state: DVector::zeros(num_states),
            last_state: DVector::zeros(num_states),
            next_state_deriv: DVector::zeros(num_states),
            next_store: DVector::zeros(num_stores),
            curr_store: DVector::zeros(num_stores),
            last_store: DVector::zeros(num_stores),
        }
    }

    pub fn num_unknowns(&self) -> usize {
        self.next_solution.len()
    }

    /// Shift time levels after an accepted point: last <- curr <- next.
    ///
    /// `next` keeps its values and serves as the initial guess for the
    /// following step until a predictor overwrites it.
    pub fn rotate(&mut self) {
        std::mem::swap(&mut self.last_solution, &mut self.curr_solution);
        self.curr_solution.copy_from(&self.next_solution);
        std::mem::swap(&mut self.last_state, &mut self.curr_state);
        self.curr_state.copy_from(&self.next_state);
        std::mem::swap(&mut self.last_store, &mut self.curr_store);
        self.curr_store.copy_from(&self.next_store);
    }

    /// Make all three time levels equal to `next`.
    pub fn set_constant_history(&mut self) {
        self.curr_solution.copy_from(&self.next_solution);
        self.last_solution.copy_from(&self.next_solution);
        self.curr_state.copy_from(&self.next_state);
        self.last_state.copy_from(&self.next_state);
        self.curr_store.copy_from(&self.next_store);
        self.last_store.copy_from(&self.next_store);
    }

    /// Discard `next` and restart from the current point.
    pub fn use_previous_as_predictor(&mut self) {
        self.next_solution.copy_from(&self.curr_solution);
        self.next_state.copy_from(&self.curr_state);
        self.next_store.copy_from(&self.curr_store);
    }
}

/// Sum of squared weighted entries, `sum((v_i / w_i)^2)`.
///
/// Kept separate from [`wrms_norm`] so partial sums from several partitions
/// or sub-problems can be combined before taking the root.
pub fn wrms_partial_sum(v: &DVector<f64>, weights: &DVector<f64>) -> f64 {
    v.iter()
        .zip(weights.iter())
        .map(|(&vi, &wi)| {
            let r = vi / wi;
            r * r
        })
        .sum()
}

/// Weighted root-mean-square norm, `sqrt(sum((v_i / w_i)^2) / n)`.
pub fn wrms_norm(v: &DVector<f64>, weights: &DVector<f64>) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    (wrms_partial_sum(v, weights) / v.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    #[test]
    fn rotate_shifts_levels() {
        let mut set = SolutionSet::new(1, 1, 0);
        set.next_solution[0] = 1.0;
        set.rotate();
        set.next_solution[0] = 2.0;
        set.rotate();

        assert_eq!(set.last_solution[0], 1.0);
        assert_eq!(set.curr_solution[0], 2.0);
        assert_eq!(set.next_solution[0], 2.0);
    }

    #[test]
    fn constant_history_and_predictor_reset() {
        let mut set = SolutionSet::new(2, 1, 1);
        set.next_solution = dvector![1.0, -1.0];
        set.next_state[0] = 3.0;
        set.set_constant_history();
        assert_eq!(set.last_solution, set.next_solution);
        assert_eq!(set.curr_state[0], 3.0);

        set.next_solution = dvector![5.0, 5.0];
        set.use_previous_as_predictor();
        assert_eq!(set.next_solution, dvector![1.0, -1.0]);
    }

    #[test]
    fn wrms_of_unit_ratio_is_one() {
        let v = dvector![2.0, -4.0];
        let w = dvector![2.0, 4.0];
        assert!((wrms_norm(&v, &w) - 1.0).abs() < 1e-15);
        assert!((wrms_partial_sum(&v, &w) - 2.0).abs() < 1e-15);
        assert_eq!(wrms_norm(&DVector::zeros(0), &DVector::zeros(0)), 0.0);
    }
}
