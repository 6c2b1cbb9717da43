//! LSTM cell.

use ndarray::{s, Array1, Array2, ArrayView2};
use rand::Rng;

use super::{sigmoid, LayerState, RecurrentCell};
use crate::init;

/// Basic LSTM cell with a single fused gate matrix.
///
/// Gate layout along the last axis is `[input, forget, candidate, output]`;
/// `forget_bias` is added to the forget gate before the sigmoid.
pub struct LstmCell {
    w: Array2<f32>,
    b: Array1<f32>,
    forget_bias: f32,
    input_units: usize,
    num_units: usize,
}

impl LstmCell {
    /// New cell with uniform-initialized weights.
    pub fn new<R: Rng>(
        input_units: usize,
        num_units: usize,
        forget_bias: f32,
        init_weight: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            w: init::uniform_matrix(rng, input_units + num_units, 4 * num_units, init_weight),
            b: init::uniform_vector(rng, 4 * num_units, init_weight),
            forget_bias,
            input_units,
            num_units,
        }
    }
}

impl RecurrentCell for LstmCell {
    fn step(&self, input: ArrayView2<f32>, state: &LayerState) -> LayerState {
        let batch = input.nrows();
        let h = self.num_units;
        debug_assert_eq!(input.ncols(), self.input_units);
        debug_assert_eq!(state.units(), h);

        let mut xh = Array2::zeros((batch, self.input_units + h));
        xh.slice_mut(s![.., ..self.input_units]).assign(&input);
        xh.slice_mut(s![.., self.input_units..]).assign(&state.hidden);
        let gates = xh.dot(&self.w) + &self.b;

        let mut cell = Array2::zeros((batch, h));
        let mut hidden = Array2::zeros((batch, h));
        for b in 0..batch {
            for u in 0..h {
                let i = sigmoid(gates[[b, u]]);
                let f = sigmoid(gates[[b, h + u]] + self.forget_bias);
                let g = gates[[b, 2 * h + u]].tanh();
                let o = sigmoid(gates[[b, 3 * h + u]]);
                let c = f * state.cell[[b, u]] + i * g;
                cell[[b, u]] = c;
                hidden[[b, u]] = o * c.tanh();
            }
        }
        LayerState { cell, hidden }
    }

    fn num_units(&self) -> usize {
        self.num_units
    }

    fn input_units(&self) -> usize {
        self.input_units
    }

    fn param_count(&self) -> usize {
        self.w.len() + self.b.len()
    }
}
