/*!
# Gated memory cell

Base recurrent cell of the hLSTMat family ("Hierarchical LSTM with
Adjusted Temporal Attention for Video Captioning", Song et al. 2017).
All three gates read the previous memory rather than the previous hidden
state, the modulation gate rescales the previous memory instead of a
forget gate, and the output gate sees the update candidate before the
sequence mask is blended in.
*/

use burn::{
    config::Config,
    module::{Module, Param},
    tensor::{activation, backend::Backend, Tensor},
};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::LayerError;
use crate::init;

/// Recurrent state carried across time steps: hidden output and memory,
/// both [`batch_size`, `dim`].
#[derive(Clone, Debug)]
pub struct CellState<B: Backend> {
    pub hidden: Tensor<B, 2>,
    pub memory: Tensor<B, 2>,
}

impl<B: Backend> CellState<B> {
    pub const fn new(hidden: Tensor<B, 2>, memory: Tensor<B, 2>) -> Self {
        Self { hidden, memory }
    }

    /// All-zero state, the default start of a sequence pass.
    pub fn zeros(batch_size: usize, dim: usize, device: &B::Device) -> Self {
        Self {
            hidden: Tensor::zeros([batch_size, dim], device),
            memory: Tensor::zeros([batch_size, dim], device),
        }
    }

    /// Detach both tensors from the computational graph.
    pub fn detach(self) -> Self {
        Self {
            hidden: self.hidden.detach(),
            memory: self.memory.detach(),
        }
    }
}

/// Configuration for [`GatedCell`].
#[derive(Config, Debug)]
pub struct GatedCellConfig {
    /// Width of the raw input vectors.
    pub input_size: usize,
    /// Width of the memory and hidden state.
    pub dim: usize,
    /// Scale of the Gaussian draws used for non-square weights.
    #[config(default = "0.01")]
    pub init_scale: f32,
    /// Seed for the initialization draws.
    #[config(default = "1234")]
    pub seed: u64,
}

impl GatedCellConfig {
    /// Initialize a new gated cell.
    pub fn init<B: Backend>(&self, device: &B::Device) -> GatedCell<B> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        GatedCell {
            w: Param::from_tensor(init::gate_stack(
                &mut rng,
                self.input_size,
                self.dim,
                self.init_scale,
                device,
            )),
            u: Param::from_tensor(init::gate_stack(
                &mut rng,
                self.dim,
                self.dim,
                self.init_scale,
                device,
            )),
            b: Param::from_tensor(Tensor::zeros([3 * self.dim], device)),
            dim: self.dim,
        }
    }
}

/// Gated recurrent memory cell.
///
/// `w` maps the raw input into three `dim`-wide gate slices laid out as
/// `[input, modulation, output]`; `u` maps the carried memory into the
/// same layout; `b` is the shared bias folded into the input projection.
#[derive(Module, Debug)]
pub struct GatedCell<B: Backend> {
    /// Input projection, shape [`input_size`, `3 * dim`].
    pub w: Param<Tensor<B, 2>>,
    /// Recurrent weights, shape [`dim`, `3 * dim`].
    pub u: Param<Tensor<B, 2>>,
    /// Gate bias, shape [`3 * dim`].
    pub b: Param<Tensor<B, 1>>,
    /// Memory width.
    pub dim: usize,
}

impl<B: Backend> GatedCell<B> {
    /// Project one step of raw input into the concatenated gate layout,
    /// [`batch_size`, `3 * dim`].
    pub fn project_input(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        input.matmul(self.w.val()) + self.b.val().unsqueeze_dim(0)
    }

    /// Project a whole input sequence at once,
    /// [`batch_size`, `seq_length`, `3 * dim`].
    pub fn project_input_seq(&self, input_seq: Tensor<B, 3>) -> Tensor<B, 3> {
        input_seq.matmul(self.w.val().unsqueeze_dim::<3>(0))
            + self.b.val().unsqueeze_dim::<2>(0).unsqueeze_dim::<3>(0)
    }

    /// One recurrent step.
    ///
    /// `projected_input` is one row of [`Self::project_input`]. `mask` is
    /// a per-sample activity column; masked-out samples keep their
    /// previous memory, while the output gate still reads the pre-mask
    /// candidate.
    pub fn step(
        &self,
        mask: Option<&Tensor<B, 1>>,
        projected_input: Tensor<B, 2>,
        state: &CellState<B>,
    ) -> CellState<B> {
        let dim = self.dim;
        let u = self.u.val();
        let u_i = u.clone().slice([0..dim, 0..dim]);
        let u_m = u.clone().slice([0..dim, dim..2 * dim]);
        let u_o = u.slice([0..dim, 2 * dim..3 * dim]);

        let x = projected_input.chunk(3, 1);
        let prev = state.memory.clone();

        let i = activation::sigmoid(prev.clone().matmul(u_i) + x[0].clone());
        let m = (prev.clone().matmul(u_m) + x[1].clone()).tanh();
        let candidate = m * prev.clone() + i;
        let o = activation::sigmoid(candidate.clone().matmul(u_o) + x[2].clone());

        let memory = match mask {
            Some(mask) => {
                let active = mask.clone().unsqueeze_dim::<2>(1);
                candidate * active.clone() + prev * (active.ones_like() - active)
            }
            None => candidate,
        };
        let hidden = o * memory.clone();

        CellState::new(hidden, memory)
    }

    /// Run the cell over a full sequence.
    ///
    /// `input_seq` is [`batch_size`, `seq_length`, `input_size`]; the gate
    /// projection is computed once up front, then the recurrence is driven
    /// strictly in time order. `mask` is [`batch_size`, `seq_length`];
    /// `None` treats every sample as active at every step.
    ///
    /// Returns the stacked hidden and memory sequences, both
    /// [`batch_size`, `seq_length`, `dim`].
    pub fn run(
        &self,
        input_seq: Tensor<B, 3>,
        mask: Option<&Tensor<B, 2>>,
        state: Option<CellState<B>>,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 3>), LayerError> {
        let [batch_size, seq_length, width] = input_seq.dims();
        let device = input_seq.device();

        if seq_length == 0 {
            return Err(LayerError::InvalidShape {
                what: "input sequence",
                expected: "at least one time step".into(),
                got: alloc::format!("{:?}", input_seq.dims()),
            });
        }
        let [input_size, _] = self.w.val().dims();
        if width != input_size {
            return Err(LayerError::InvalidShape {
                what: "input sequence",
                expected: alloc::format!("input width {input_size}"),
                got: alloc::format!("{:?}", input_seq.dims()),
            });
        }
        if let Some(mask) = mask {
            if mask.dims() != [batch_size, seq_length] {
                return Err(LayerError::InvalidShape {
                    what: "sequence mask",
                    expected: alloc::format!("[{batch_size}, {seq_length}]"),
                    got: alloc::format!("{:?}", mask.dims()),
                });
            }
        }
        if let Some(state) = &state {
            if state.hidden.dims() != [batch_size, self.dim]
                || state.memory.dims() != [batch_size, self.dim]
            {
                return Err(LayerError::InvalidShape {
                    what: "initial state",
                    expected: alloc::format!("[{batch_size}, {}]", self.dim),
                    got: alloc::format!(
                        "{:?} and {:?}",
                        state.hidden.dims(),
                        state.memory.dims()
                    ),
                });
            }
        }

        let mut state = state.unwrap_or_else(|| CellState::zeros(batch_size, self.dim, &device));
        let projected = self.project_input_seq(input_seq);

        let mut hidden_seq = alloc::vec::Vec::with_capacity(seq_length);
        let mut memory_seq = alloc::vec::Vec::with_capacity(seq_length);
        for t in 0..seq_length {
            let input_t = projected
                .clone()
                .slice([0..batch_size, t..(t + 1), 0..(3 * self.dim)])
                .squeeze(1);
            let mask_t =
                mask.map(|m| m.clone().slice([0..batch_size, t..(t + 1)]).squeeze::<1>(1));

            state = self.step(mask_t.as_ref(), input_t, &state);
            hidden_seq.push(state.hidden.clone().unsqueeze_dim(1));
            memory_seq.push(state.memory.clone().unsqueeze_dim(1));
        }

        Ok((Tensor::cat(hidden_seq, 1), Tensor::cat(memory_seq, 1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type TestBackend = burn_ndarray::NdArray<f32>;

    #[test]
    fn test_run_shapes() {
        let device = Default::default();
        let cell = GatedCellConfig::new(16, 32).init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 3>::random([4, 10, 16], Distribution::Default, &device);
        let (hidden, memory) = cell.run(input, None, None).unwrap();

        assert_eq!(hidden.dims(), [4, 10, 32]);
        assert_eq!(memory.dims(), [4, 10, 32]);
    }

    #[test]
    fn test_run_matches_manual_steps() {
        let device = Default::default();
        let batch_size = 2;
        let seq_len = 6;
        let cell = GatedCellConfig::new(8, 12).init::<TestBackend>(&device);

        let input =
            Tensor::<TestBackend, 3>::random([batch_size, seq_len, 8], Distribution::Default, &device);
        let (hidden_seq, memory_seq) = cell.run(input.clone(), None, None).unwrap();

        let mut state = CellState::zeros(batch_size, 12, &device);
        for t in 0..seq_len {
            let x_t = input
                .clone()
                .slice([0..batch_size, t..(t + 1), 0..8])
                .squeeze::<2>(1);
            state = cell.step(None, cell.project_input(x_t), &state);
        }

        let last_hidden = hidden_seq
            .slice([0..batch_size, (seq_len - 1)..seq_len, 0..12])
            .squeeze::<2>(1);
        let last_memory = memory_seq
            .slice([0..batch_size, (seq_len - 1)..seq_len, 0..12])
            .squeeze::<2>(1);

        let h_diff = (last_hidden - state.hidden).abs().max().into_scalar();
        let c_diff = (last_memory - state.memory).abs().max().into_scalar();
        assert!(h_diff < 1e-5, "hidden diverged by {h_diff}");
        assert!(c_diff < 1e-5, "memory diverged by {c_diff}");
    }

    #[test]
    fn test_all_ones_mask_is_identity() {
        let device = Default::default();
        let cell = GatedCellConfig::new(8, 8).init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 3>::random([3, 5, 8], Distribution::Default, &device);
        let mask = Tensor::<TestBackend, 2>::ones([3, 5], &device);

        let (h_masked, c_masked) = cell.run(input.clone(), Some(&mask), None).unwrap();
        let (h_plain, c_plain) = cell.run(input, None, None).unwrap();

        assert!((h_masked - h_plain).abs().max().into_scalar() < 1e-7);
        assert!((c_masked - c_plain).abs().max().into_scalar() < 1e-7);
    }

    #[test]
    fn test_zero_mask_freezes_memory() {
        let device = Default::default();
        let cell = GatedCellConfig::new(8, 8).init::<TestBackend>(&device);

        let prev = CellState::new(
            Tensor::<TestBackend, 2>::random([2, 8], Distribution::Default, &device),
            Tensor::<TestBackend, 2>::random([2, 8], Distribution::Default, &device),
        );
        let x = Tensor::<TestBackend, 2>::random([2, 8], Distribution::Default, &device);
        let mask = Tensor::<TestBackend, 1>::zeros([2], &device);

        let next = cell.step(Some(&mask), cell.project_input(x), &prev);

        let diff = (next.memory.clone() - prev.memory.clone()).abs().max().into_scalar();
        assert!(diff < 1e-7, "masked-out memory must stay frozen, moved by {diff}");

        // The hidden output is still refreshed: the output gate reads the
        // pre-mask candidate and multiplies the frozen memory.
        let hidden_diff = (next.hidden - prev.hidden).abs().max().into_scalar();
        assert!(hidden_diff > 0.0);
    }

    #[test]
    fn test_zero_mask_output_gate_reads_candidate() {
        let device = Default::default();
        let mut cell = GatedCellConfig::new(1, 1).init::<TestBackend>(&device);
        // Unit recurrent weights make the step arithmetic scalar: with the
        // previous memory at 2 and zero input, i = sigmoid(2), m = tanh(2),
        // candidate = tanh(2) * 2 + sigmoid(2) = 2.8089.
        cell.u = Param::from_tensor(Tensor::ones([1, 3], &device));

        let prev = CellState::new(
            Tensor::<TestBackend, 2>::zeros([1, 1], &device),
            Tensor::<TestBackend, 2>::full([1, 1], 2.0, &device),
        );
        let mask = Tensor::<TestBackend, 1>::zeros([1], &device);

        let next = cell.step(Some(&mask), Tensor::zeros([1, 3], &device), &prev);

        let memory = next.memory.clone().into_scalar();
        assert!((memory - 2.0).abs() < 1e-6, "memory must stay frozen, got {memory}");

        // The output gate reads the pre-mask candidate, sigmoid(2.8089) =
        // 0.9432; reading the frozen memory instead would give sigmoid(2) =
        // 0.8808.
        let o = (next.hidden / next.memory).into_scalar();
        assert!((o - 0.9432).abs() < 1e-3, "output gate saw the wrong memory: {o}");
    }

    #[test]
    fn test_mask_shape_rejected() {
        let device = Default::default();
        let cell = GatedCellConfig::new(4, 4).init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 3>::random([2, 5, 4], Distribution::Default, &device);
        let mask = Tensor::<TestBackend, 2>::ones([2, 4], &device);

        let result = cell.run(input, Some(&mask), None);
        assert!(matches!(result, Err(LayerError::InvalidShape { .. })));
    }

    #[test]
    fn test_width_mismatch_rejected() {
        let device = Default::default();
        let cell = GatedCellConfig::new(4, 4).init::<TestBackend>(&device);

        let wide = Tensor::<TestBackend, 3>::random([2, 5, 6], Distribution::Default, &device);
        assert!(matches!(
            cell.run(wide, None, None),
            Err(LayerError::InvalidShape { .. })
        ));

        let input = Tensor::<TestBackend, 3>::random([2, 5, 4], Distribution::Default, &device);
        let narrow_state = CellState::zeros(2, 3, &device);
        assert!(matches!(
            cell.run(input, None, Some(narrow_state)),
            Err(LayerError::InvalidShape { .. })
        ));
    }

    #[test]
    fn test_empty_sequence_rejected() {
        let device = Default::default();
        let cell = GatedCellConfig::new(4, 4).init::<TestBackend>(&device);

        let empty = Tensor::<TestBackend, 3>::zeros([2, 0, 4], &device);
        assert!(matches!(
            cell.run(empty, None, None),
            Err(LayerError::InvalidShape { .. })
        ));
    }

    #[test]
    fn test_state_continuation() {
        let device = Default::default();
        let cell = GatedCellConfig::new(8, 8).init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 3>::random([2, 8, 8], Distribution::Default, &device);
        let (h_full, _) = cell.run(input.clone(), None, None).unwrap();

        let first = input.clone().slice([0..2, 0..4, 0..8]);
        let second = input.slice([0..2, 4..8, 0..8]);
        let (h_a, c_a) = cell.run(first, None, None).unwrap();
        let carried = CellState::new(
            h_a.clone().slice([0..2, 3..4, 0..8]).squeeze::<2>(1),
            c_a.slice([0..2, 3..4, 0..8]).squeeze::<2>(1),
        );
        let (h_b, _) = cell.run(second, None, Some(carried)).unwrap();

        let tail = h_full.slice([0..2, 4..8, 0..8]);
        let diff = (tail - h_b).abs().max().into_scalar();
        assert!(diff < 1e-5, "chunked run diverged by {diff}");
    }
}
