//! Recurrent cells and multi-layer stacks.
//!
//! Cells implement [`RecurrentCell`] as batch-level step functions; the
//! [`build_stack`] builder assembles a multi-layer [`RnnStack`] with input
//! dropout and residual connections on the top layers. Unrolling follows
//! dynamic-RNN semantics: past an example's valid length its state is
//! frozen and its output zeroed.

mod gru;
mod lstm;

pub use gru::GruCell;
pub use lstm::LstmCell;

use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3};
use rand::Rng;

use crate::config::UnitType;
use crate::error::{ModelError, Result};
use crate::init;

/// Logistic sigmoid
pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Per-layer recurrent state with (cell, output) components, `[B, H]` each.
///
/// GRU carries its hidden state in both slots so that every layer exposes
/// the same tuple shape to the latent-augmentation path.
#[derive(Debug, Clone)]
pub struct LayerState {
    pub cell: Array2<f32>,
    pub hidden: Array2<f32>,
}

impl LayerState {
    /// Zero state for `batch` examples of width `units`.
    pub fn zeros(batch: usize, units: usize) -> Self {
        Self {
            cell: Array2::zeros((batch, units)),
            hidden: Array2::zeros((batch, units)),
        }
    }

    /// State width.
    pub fn units(&self) -> usize {
        self.hidden.ncols()
    }

    /// Number of examples.
    pub fn batch(&self) -> usize {
        self.hidden.nrows()
    }
}

/// A single recurrent layer stepping a whole batch at once.
pub trait RecurrentCell {
    /// One step: `input` is `[B, input_units]`, returns the next state.
    fn step(&self, input: ArrayView2<f32>, state: &LayerState) -> LayerState;

    /// Hidden width.
    fn num_units(&self) -> usize;

    /// Expected input width.
    fn input_units(&self) -> usize;

    /// Number of learned scalars.
    fn param_count(&self) -> usize;
}

/// Fully connected layer.
#[derive(Debug, Clone)]
pub struct Dense {
    pub w: Array2<f32>,
    pub b: Array1<f32>,
}

impl Dense {
    /// New layer with uniform-initialized weights.
    pub fn new<R: Rng>(
        input_units: usize,
        output_units: usize,
        init_weight: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            w: init::uniform_matrix(rng, input_units, output_units, init_weight),
            b: init::uniform_vector(rng, output_units, init_weight),
        }
    }

    /// Linear forward, `[B, in] -> [B, out]`.
    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        x.dot(&self.w) + &self.b
    }

    /// Tanh-activated forward.
    pub fn forward_tanh(&self, x: ArrayView2<f32>) -> Array2<f32> {
        self.forward(x).mapv(f32::tanh)
    }

    /// Number of learned scalars.
    pub fn param_count(&self) -> usize {
        self.w.len() + self.b.len()
    }
}

/// Multi-layer recurrent stack with dropout and top-layer residuals.
pub struct RnnStack {
    cells: Vec<Box<dyn RecurrentCell>>,
    num_residual: usize,
    dropout: f32,
}

impl RnnStack {
    /// Number of layers.
    pub fn num_layers(&self) -> usize {
        self.cells.len()
    }

    /// Hidden width of the top layer.
    pub fn num_units(&self) -> usize {
        self.cells.last().map_or(0, |c| c.num_units())
    }

    /// Input width of the bottom layer.
    pub fn input_units(&self) -> usize {
        self.cells.first().map_or(0, |c| c.input_units())
    }

    /// Number of learned scalars across all layers.
    pub fn param_count(&self) -> usize {
        self.cells.iter().map(|c| c.param_count()).sum()
    }

    /// Zero state for every layer.
    pub fn zero_state(&self, batch: usize) -> Vec<LayerState> {
        self.cells
            .iter()
            .map(|c| LayerState::zeros(batch, c.num_units()))
            .collect()
    }

    /// One step through all layers, mutating `states` in place.
    ///
    /// Returns the top layer's output, `[B, H]`. Residual layers add their
    /// pre-dropout input to the layer output.
    pub fn step<R: Rng>(
        &self,
        input: ArrayView2<f32>,
        states: &mut [LayerState],
        training: bool,
        rng: &mut R,
    ) -> Array2<f32> {
        debug_assert_eq!(states.len(), self.cells.len());
        let residual_from = self.cells.len() - self.num_residual;

        let mut x = input.to_owned();
        for (li, cell) in self.cells.iter().enumerate() {
            let cell_input = if training && self.dropout > 0.0 {
                let keep = 1.0 - self.dropout;
                x.mapv(|v| {
                    if rng.random::<f32>() < self.dropout {
                        0.0
                    } else {
                        v / keep
                    }
                })
            } else {
                x.clone()
            };
            let next = cell.step(cell_input.view(), &states[li]);
            let mut out = next.hidden.clone();
            if li >= residual_from {
                debug_assert_eq!(out.dim(), x.dim());
                out += &x;
            }
            states[li] = next;
            x = out;
        }
        x
    }

    /// Unroll over a time-major sequence `[S, B, in]`.
    ///
    /// Past `lengths[b]` the state of example `b` is carried through
    /// unchanged and its output rows are zero. Returns `([S, B, H], final
    /// states)`.
    pub fn run<R: Rng>(
        &self,
        inputs: ArrayView3<f32>,
        lengths: &[usize],
        initial: Vec<LayerState>,
        training: bool,
        rng: &mut R,
    ) -> (Array3<f32>, Vec<LayerState>) {
        let (steps, batch, _) = inputs.dim();
        debug_assert_eq!(lengths.len(), batch);
        let mut states = initial;
        let mut outputs = Array3::zeros((steps, batch, self.num_units()));

        for t in 0..steps {
            let frozen: Vec<usize> = (0..batch).filter(|&b| t >= lengths[b]).collect();
            let previous: Option<Vec<LayerState>> = if frozen.is_empty() {
                None
            } else {
                Some(states.clone())
            };

            let out = self.step(inputs.slice(s![t, .., ..]), &mut states, training, rng);
            let mut out_slice = outputs.slice_mut(s![t, .., ..]);
            out_slice.assign(&out);

            if let Some(previous) = previous {
                for &b in &frozen {
                    for (layer, prev) in states.iter_mut().zip(&previous) {
                        layer.cell.row_mut(b).assign(&prev.cell.row(b));
                        layer.hidden.row_mut(b).assign(&prev.hidden.row(b));
                    }
                    out_slice.row_mut(b).fill(0.0);
                }
            }
        }
        (outputs, states)
    }
}

/// Build a multi-layer recurrent stack.
///
/// The bottom layer consumes `input_units`-wide rows, upper layers consume
/// `num_units`. The top `num_residual_layers` layers get residual
/// connections; a residual layer whose input width differs from its output
/// width is a configuration error.
#[allow(clippy::too_many_arguments)]
pub fn build_stack<R: Rng>(
    unit_type: UnitType,
    num_units: usize,
    input_units: usize,
    num_layers: usize,
    num_residual_layers: usize,
    dropout: f32,
    forget_bias: f32,
    init_weight: f32,
    rng: &mut R,
) -> Result<RnnStack> {
    if num_layers == 0 {
        return Err(ModelError::InvalidConfig("num_layers must be > 0".into()));
    }
    if num_residual_layers > num_layers {
        return Err(ModelError::InvalidConfig(format!(
            "num_residual_layers {num_residual_layers} exceeds num_layers {num_layers}"
        )));
    }
    let residual_from = num_layers - num_residual_layers;
    let mut cells: Vec<Box<dyn RecurrentCell>> = Vec::with_capacity(num_layers);
    for li in 0..num_layers {
        let layer_input = if li == 0 { input_units } else { num_units };
        if li >= residual_from && layer_input != num_units {
            return Err(ModelError::InvalidConfig(format!(
                "residual layer {li} input width {layer_input} differs from output width {num_units}"
            )));
        }
        let cell: Box<dyn RecurrentCell> = match unit_type {
            UnitType::Lstm => Box::new(LstmCell::new(
                layer_input,
                num_units,
                forget_bias,
                init_weight,
                rng,
            )),
            UnitType::Gru => Box::new(GruCell::new(layer_input, num_units, init_weight, rng)),
        };
        cells.push(cell);
    }
    Ok(RnnStack {
        cells,
        num_residual: num_residual_layers,
        dropout,
    })
}
