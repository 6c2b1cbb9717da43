//! GRU cell.

use ndarray::{s, Array1, Array2, ArrayView2};
use rand::Rng;

use super::{sigmoid, LayerState, RecurrentCell};
use crate::init;

/// Gated recurrent unit.
///
/// The state tuple mirrors the hidden vector into both slots so GRU layers
/// compose with the same `(cell, output)` plumbing as LSTM layers.
pub struct GruCell {
    w_gates: Array2<f32>,
    b_gates: Array1<f32>,
    w_cand: Array2<f32>,
    b_cand: Array1<f32>,
    input_units: usize,
    num_units: usize,
}

impl GruCell {
    /// New cell with uniform-initialized weights.
    pub fn new<R: Rng>(
        input_units: usize,
        num_units: usize,
        init_weight: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            w_gates: init::uniform_matrix(rng, input_units + num_units, 2 * num_units, init_weight),
            b_gates: init::uniform_vector(rng, 2 * num_units, init_weight),
            w_cand: init::uniform_matrix(rng, input_units + num_units, num_units, init_weight),
            b_cand: init::uniform_vector(rng, num_units, init_weight),
            input_units,
            num_units,
        }
    }
}

impl RecurrentCell for GruCell {
    fn step(&self, input: ArrayView2<f32>, state: &LayerState) -> LayerState {
        let batch = input.nrows();
        let h = self.num_units;
        debug_assert_eq!(input.ncols(), self.input_units);
        debug_assert_eq!(state.units(), h);

        let mut xh = Array2::zeros((batch, self.input_units + h));
        xh.slice_mut(s![.., ..self.input_units]).assign(&input);
        xh.slice_mut(s![.., self.input_units..]).assign(&state.hidden);
        let gates = xh.dot(&self.w_gates) + &self.b_gates;

        // Candidate input reuses x but gates the previous hidden by r.
        let mut hidden = Array2::zeros((batch, h));
        let mut xr = Array2::zeros((batch, self.input_units + h));
        xr.slice_mut(s![.., ..self.input_units]).assign(&input);
        for b in 0..batch {
            for u in 0..h {
                let r = sigmoid(gates[[b, h + u]]);
                xr[[b, self.input_units + u]] = r * state.hidden[[b, u]];
            }
        }
        let cand = xr.dot(&self.w_cand) + &self.b_cand;

        for b in 0..batch {
            for u in 0..h {
                let z = sigmoid(gates[[b, u]]);
                let n = cand[[b, u]].tanh();
                hidden[[b, u]] = z * state.hidden[[b, u]] + (1.0 - z) * n;
            }
        }
        LayerState {
            cell: hidden.clone(),
            hidden,
        }
    }

    fn num_units(&self) -> usize {
        self.num_units
    }

    fn input_units(&self) -> usize {
        self.input_units
    }

    fn param_count(&self) -> usize {
        self.w_gates.len() + self.b_gates.len() + self.w_cand.len() + self.b_cand.len()
    }
}
