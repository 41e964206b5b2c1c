/*!
# Attention-conditioned gated cell

The decoding cell of the hLSTMat captioning model: the gate arithmetic of
[`GatedCell`](crate::GatedCell) interleaved with per-step soft attention
over a set of context vectors (e.g. spatial regions of a frame), an
optional scalar selector gate, and optional recurrent dropout on the gate
pre-activations.

The attention half runs after the gate half inside a single step: the
fresh hidden state is projected into context space, folded into the
projected context through a `tanh`, scored per position and normalized
into a distribution, which then weights the raw context vectors. The
selector gate instead reads the hidden state of the *previous* step.
*/

use burn::{
    config::Config,
    module::{Module, Param},
    tensor::{activation, backend::Backend, Distribution, Tensor},
};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::LayerError;
use crate::gated::CellState;
use crate::init;

/// Everything one attentive step produces.
#[derive(Clone, Debug)]
pub struct AttentiveStep<B: Backend> {
    /// New hidden output, [`batch_size`, `dim`].
    pub hidden: Tensor<B, 2>,
    /// New memory, [`batch_size`, `dim`].
    pub memory: Tensor<B, 2>,
    /// Attention distribution over context positions,
    /// [`batch_size`, `positions`].
    pub alpha: Tensor<B, 2>,
    /// Attention-weighted context, selector applied,
    /// [`batch_size`, `ctx_dim`].
    pub attended_context: Tensor<B, 2>,
    /// Selector gate per sample, [`batch_size`]; all ones when the gate
    /// is disabled.
    pub selector: Tensor<B, 1>,
    /// Hidden state projected into context space, [`batch_size`, `ctx_dim`].
    pub attention_preactivation: Tensor<B, 2>,
    /// Projected context after folding in the hidden state,
    /// [`batch_size`, `positions`, `ctx_dim`].
    pub updated_projected_context: Tensor<B, 3>,
    /// Input gate after the sigmoid, [`batch_size`, `dim`].
    pub gate_i: Tensor<B, 2>,
    /// Modulation gate after the tanh, [`batch_size`, `dim`].
    pub gate_m: Tensor<B, 2>,
    /// Output gate after the sigmoid, [`batch_size`, `dim`].
    pub gate_o: Tensor<B, 2>,
    /// Concatenated gate pre-activations, dropout already applied,
    /// [`batch_size`, `3 * dim`].
    pub preactivation_concat: Tensor<B, 2>,
    /// Unnormalized attention scores, [`batch_size`, `positions`].
    pub alpha_logits: Tensor<B, 2>,
}

/// Per-step outputs of a full sequence pass, stacked along time (axis 1).
#[derive(Clone, Debug)]
pub struct AttentiveSequence<B: Backend> {
    /// [`batch_size`, `seq_length`, `dim`]
    pub hidden: Tensor<B, 3>,
    /// [`batch_size`, `seq_length`, `dim`]
    pub memory: Tensor<B, 3>,
    /// [`batch_size`, `seq_length`, `positions`]
    pub alpha: Tensor<B, 3>,
    /// [`batch_size`, `seq_length`, `ctx_dim`]
    pub attended_context: Tensor<B, 3>,
    /// [`batch_size`, `seq_length`]
    pub selector: Tensor<B, 2>,
    /// [`batch_size`, `seq_length`, `ctx_dim`]
    pub attention_preactivation: Tensor<B, 3>,
    /// [`batch_size`, `seq_length`, `positions`, `ctx_dim`]
    pub updated_projected_context: Tensor<B, 4>,
    /// [`batch_size`, `seq_length`, `dim`]
    pub gate_i: Tensor<B, 3>,
    /// [`batch_size`, `seq_length`, `dim`]
    pub gate_m: Tensor<B, 3>,
    /// [`batch_size`, `seq_length`, `dim`]
    pub gate_o: Tensor<B, 3>,
    /// [`batch_size`, `seq_length`, `3 * dim`]
    pub preactivation_concat: Tensor<B, 3>,
    /// [`batch_size`, `seq_length`, `positions`]
    pub alpha_logits: Tensor<B, 3>,
}

impl<B: Backend> AttentiveSequence<B> {
    /// State after the last step, for continuation or incremental decoding.
    pub fn final_state(&self) -> CellState<B> {
        let [batch_size, seq_length, dim] = self.hidden.dims();
        let hidden = self
            .hidden
            .clone()
            .slice([0..batch_size, (seq_length - 1)..seq_length, 0..dim])
            .squeeze(1);
        let memory = self
            .memory
            .clone()
            .slice([0..batch_size, (seq_length - 1)..seq_length, 0..dim])
            .squeeze(1);
        CellState::new(hidden, memory)
    }
}

/// Scalar gate modulating how much attended context reaches the caller.
#[derive(Module, Debug)]
pub struct Selector<B: Backend> {
    /// Projection from the hidden state, shape [`dim`, 1].
    pub w: Param<Tensor<B, 2>>,
    /// Bias, shape [1].
    pub b: Param<Tensor<B, 1>>,
}

impl<B: Backend> Selector<B> {
    /// Gate value per sample, [`batch_size`].
    pub fn forward(&self, hidden: Tensor<B, 2>) -> Tensor<B, 1> {
        activation::sigmoid(hidden.matmul(self.w.val()) + self.b.val().unsqueeze_dim(0)).squeeze(1)
    }
}

/// Configuration for [`AttentiveCell`].
#[derive(Config, Debug)]
pub struct AttentiveCellConfig {
    /// Width of the raw input vectors.
    pub input_size: usize,
    /// Width of the memory and hidden state.
    pub dim: usize,
    /// Width of each context vector.
    pub ctx_dim: usize,
    /// Build the scalar selector gate.
    #[config(default = "true")]
    pub selector: bool,
    /// Apply recurrent dropout to the gate pre-activations.
    #[config(default = "false")]
    pub use_dropout: bool,
    /// Scale of the Gaussian draws used for non-square weights.
    #[config(default = "0.01")]
    pub init_scale: f32,
    /// Seed for the initialization draws.
    #[config(default = "1234")]
    pub seed: u64,
}

impl AttentiveCellConfig {
    /// Initialize a new attentive cell.
    pub fn init<B: Backend>(&self, device: &B::Device) -> AttentiveCell<B> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let scale = self.init_scale;

        let w = init::gate_stack(&mut rng, self.input_size, self.dim, scale, device);
        let u = init::gate_stack(&mut rng, self.dim, self.dim, scale, device);
        let wc_att = init::norm_weight(&mut rng, self.ctx_dim, self.ctx_dim, scale, false, device);
        let wd_att = init::norm_weight(&mut rng, self.dim, self.ctx_dim, scale, true, device);
        let u_att = init::norm_weight(&mut rng, self.ctx_dim, 1, scale, true, device);
        let selector = if self.selector {
            Some(Selector {
                w: Param::from_tensor(init::norm_weight(&mut rng, self.dim, 1, scale, true, device)),
                b: Param::from_tensor(Tensor::zeros([1], device)),
            })
        } else {
            None
        };

        AttentiveCell {
            w: Param::from_tensor(w),
            u: Param::from_tensor(u),
            b: Param::from_tensor(Tensor::zeros([3 * self.dim], device)),
            wc_att: Param::from_tensor(wc_att),
            b_att: Param::from_tensor(Tensor::zeros([self.ctx_dim], device)),
            wd_att: Param::from_tensor(wd_att),
            u_att: Param::from_tensor(u_att),
            c_att: Param::from_tensor(Tensor::zeros([1], device)),
            selector,
            dim: self.dim,
            ctx_dim: self.ctx_dim,
            use_dropout: self.use_dropout,
        }
    }
}

/// Attention-conditioned gated recurrent cell.
#[derive(Module, Debug)]
pub struct AttentiveCell<B: Backend> {
    /// Input projection, shape [`input_size`, `3 * dim`].
    pub w: Param<Tensor<B, 2>>,
    /// Recurrent weights, shape [`dim`, `3 * dim`].
    pub u: Param<Tensor<B, 2>>,
    /// Gate bias, shape [`3 * dim`].
    pub b: Param<Tensor<B, 1>>,
    /// Context projection for attention, shape [`ctx_dim`, `ctx_dim`].
    pub wc_att: Param<Tensor<B, 2>>,
    /// Context projection bias, shape [`ctx_dim`].
    pub b_att: Param<Tensor<B, 1>>,
    /// Hidden-to-context attention projection, shape [`dim`, `ctx_dim`].
    pub wd_att: Param<Tensor<B, 2>>,
    /// Attention score projection, shape [`ctx_dim`, 1].
    pub u_att: Param<Tensor<B, 2>>,
    /// Attention score bias, shape [1].
    pub c_att: Param<Tensor<B, 1>>,
    /// Optional selector gate.
    pub selector: Option<Selector<B>>,
    /// Memory width.
    pub dim: usize,
    /// Context vector width.
    pub ctx_dim: usize,
    /// Whether gate-preactivation dropout is applied.
    pub use_dropout: bool,
}

impl<B: Backend> AttentiveCell<B> {
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

    /// Project the context once per sequence pass; the result does not
    /// depend on time. [`batch_size`, `positions`, `ctx_dim`].
    pub fn project_context(&self, context: &Tensor<B, 3>) -> Tensor<B, 3> {
        context.clone().matmul(self.wc_att.val().unsqueeze_dim::<3>(0))
            + self.b_att.val().unsqueeze_dim::<2>(0).unsqueeze_dim::<3>(0)
    }

    /// Draw the gate dropout tensor for a whole pass,
    /// [`batch_size`, `steps`, `3 * dim`]: Bernoulli(0.5) draws while
    /// gradients are tracked, the matching constant 0.5 otherwise.
    /// `None` when the cell was built without dropout.
    pub fn sample_dropout(
        &self,
        batch_size: usize,
        steps: usize,
        device: &B::Device,
    ) -> Option<Tensor<B, 3>> {
        if !self.use_dropout {
            return None;
        }
        let shape = [batch_size, steps, 3 * self.dim];
        let mask = if B::ad_enabled() {
            Tensor::random(shape, Distribution::Bernoulli(0.5), device)
        } else {
            Tensor::full(shape, 0.5, device)
        };
        Some(mask)
    }

    /// One-step counterpart of [`Self::sample_dropout`] for stochastic
    /// incremental decoding, [`batch_size`, `3 * dim`].
    pub fn sample_step_dropout(
        &self,
        batch_size: usize,
        device: &B::Device,
    ) -> Option<Tensor<B, 2>> {
        if !self.use_dropout {
            return None;
        }
        let shape = [batch_size, 3 * self.dim];
        let mask = if B::ad_enabled() {
            Tensor::random(shape, Distribution::Bernoulli(0.5), device)
        } else {
            Tensor::full(shape, 0.5, device)
        };
        Some(mask)
    }

    /// One attentive step.
    ///
    /// `projected_input` is one row of [`Self::project_input`];
    /// `projected_context` comes from [`Self::project_context`]. The raw
    /// `context` is still needed for the value aggregation and must be
    /// present. `prev_hidden` defaults to zeros when absent; `prev_memory`
    /// has no default in one-step use and its absence is an error.
    /// `dropout` is one time slice of [`Self::sample_dropout`]; passing
    /// `None` on a dropout-enabled cell falls back to the inference
    /// constant, passing `Some` on a cell built without dropout is a
    /// configuration error.
    pub fn step(
        &self,
        mask: Option<&Tensor<B, 1>>,
        projected_input: Tensor<B, 2>,
        prev_hidden: Option<Tensor<B, 2>>,
        prev_memory: Option<Tensor<B, 2>>,
        context: Option<&Tensor<B, 3>>,
        projected_context: &Tensor<B, 3>,
        dropout: Option<&Tensor<B, 2>>,
    ) -> Result<AttentiveStep<B>, LayerError> {
        let dim = self.dim;
        let context = context.ok_or(LayerError::MissingContext)?;
        let prev_memory = prev_memory.ok_or(LayerError::MissingMemory)?;
        let [batch_size, _] = projected_input.dims();
        let device = projected_input.device();
        let prev_hidden =
            prev_hidden.unwrap_or_else(|| Tensor::zeros([batch_size, dim], &device));

        if dropout.is_some() && !self.use_dropout {
            return Err(LayerError::Configuration {
                what: "dropout mask supplied to a cell built without dropout".into(),
            });
        }
        let dropout = match dropout {
            Some(mask) => Some(mask.clone()),
            None if self.use_dropout => Some(Tensor::full([batch_size, 3 * dim], 0.5, &device)),
            None => None,
        };
        let dropout = dropout.map(|d| d.chunk(3, 1));

        let u = self.u.val();
        let u_i = u.clone().slice([0..dim, 0..dim]);
        let u_m = u.clone().slice([0..dim, dim..2 * dim]);
        let u_o = u.slice([0..dim, 2 * dim..3 * dim]);
        let x = projected_input.chunk(3, 1);

        let mut pi = prev_memory.clone().matmul(u_i) + x[0].clone();
        let mut pm = prev_memory.clone().matmul(u_m) + x[1].clone();
        if let Some(d) = &dropout {
            pi = pi * d[0].clone();
            pm = pm * d[1].clone();
        }
        let gate_i = activation::sigmoid(pi.clone());
        let gate_m = pm.clone().tanh();
        let candidate = gate_m.clone() * prev_memory.clone() + gate_i.clone();

        let mut po = candidate.clone().matmul(u_o) + x[2].clone();
        if let Some(d) = &dropout {
            po = po * d[2].clone();
        }
        let preactivation_concat = Tensor::cat(alloc::vec![pi, pm, po.clone()], 1);
        let gate_o = activation::sigmoid(po);

        let memory = match mask {
            Some(mask) => {
                let active = mask.clone().unsqueeze_dim::<2>(1);
                candidate * active.clone() + prev_memory * (active.ones_like() - active)
            }
            None => candidate,
        };
        let hidden = gate_o.clone() * memory.clone();

        // Attention reads the hidden state just computed; the selector
        // below reads the previous one.
        let attention_preactivation = hidden.clone().matmul(self.wd_att.val());
        let updated_projected_context = (projected_context.clone()
            + attention_preactivation.clone().unsqueeze_dim::<3>(1))
        .tanh();

        let alpha_logits = (updated_projected_context
            .clone()
            .matmul(self.u_att.val().unsqueeze_dim::<3>(0))
            + self.c_att.val().unsqueeze_dim::<2>(0).unsqueeze_dim::<3>(0))
        .squeeze::<2>(2);
        let alpha = activation::softmax(alpha_logits.clone(), 1);

        let mut attended_context = (context.clone() * alpha.clone().unsqueeze_dim::<3>(2))
            .sum_dim(1)
            .squeeze::<2>(1);

        let selector = match &self.selector {
            Some(gate) => {
                let sel = gate.forward(prev_hidden);
                attended_context = attended_context * sel.clone().unsqueeze_dim::<2>(1);
                sel
            }
            None => Tensor::ones([batch_size], &device),
        };

        Ok(AttentiveStep {
            hidden,
            memory,
            alpha,
            attended_context,
            selector,
            attention_preactivation,
            updated_projected_context,
            gate_i,
            gate_m,
            gate_o,
            preactivation_concat,
            alpha_logits,
        })
    }

    /// Drive [`Self::step`] over a whole sequence.
    ///
    /// `input_seq` is [`batch_size`, `seq_length`, `input_size`];
    /// `context` is [`batch_size`, `positions`, `ctx_dim`], projected once
    /// before the loop; `mask` is [`batch_size`, `seq_length`]. When
    /// dropout is enabled the whole pass shares one draw, sliced per step.
    /// Every per-step output comes back stacked along the time axis.
    pub fn run(
        &self,
        input_seq: Tensor<B, 3>,
        mask: Option<&Tensor<B, 2>>,
        context: Option<&Tensor<B, 3>>,
        state: Option<CellState<B>>,
    ) -> Result<AttentiveSequence<B>, LayerError> {
        let context = context.ok_or(LayerError::MissingContext)?;
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
        let [ctx_batch, _, ctx_width] = context.dims();
        if ctx_batch != batch_size || ctx_width != self.ctx_dim {
            return Err(LayerError::InvalidShape {
                what: "context",
                expected: alloc::format!("[{batch_size}, positions, {}]", self.ctx_dim),
                got: alloc::format!("{:?}", context.dims()),
            });
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

        let state = state.unwrap_or_else(|| CellState::zeros(batch_size, self.dim, &device));
        let projected_context = self.project_context(context);
        let projected_input = self.project_input_seq(input_seq);
        let dropout = self.sample_dropout(batch_size, seq_length, &device);

        let mut hidden = state.hidden;
        let mut memory = state.memory;
        let mut steps = alloc::vec::Vec::with_capacity(seq_length);
        for t in 0..seq_length {
            let input_t = projected_input
                .clone()
                .slice([0..batch_size, t..(t + 1), 0..(3 * self.dim)])
                .squeeze(1);
            let mask_t =
                mask.map(|m| m.clone().slice([0..batch_size, t..(t + 1)]).squeeze::<1>(1));
            let dropout_t = dropout.as_ref().map(|d| {
                d.clone()
                    .slice([0..batch_size, t..(t + 1), 0..(3 * self.dim)])
                    .squeeze::<2>(1)
            });

            let step = self.step(
                mask_t.as_ref(),
                input_t,
                Some(hidden),
                Some(memory),
                Some(context),
                &projected_context,
                dropout_t.as_ref(),
            )?;
            hidden = step.hidden.clone();
            memory = step.memory.clone();
            steps.push(step);
        }

        Ok(AttentiveSequence {
            hidden: stacked(&steps, |s| s.hidden.clone()),
            memory: stacked(&steps, |s| s.memory.clone()),
            alpha: stacked(&steps, |s| s.alpha.clone()),
            attended_context: stacked(&steps, |s| s.attended_context.clone()),
            selector: stacked(&steps, |s| s.selector.clone()),
            attention_preactivation: stacked(&steps, |s| s.attention_preactivation.clone()),
            updated_projected_context: stacked(&steps, |s| s.updated_projected_context.clone()),
            gate_i: stacked(&steps, |s| s.gate_i.clone()),
            gate_m: stacked(&steps, |s| s.gate_m.clone()),
            gate_o: stacked(&steps, |s| s.gate_o.clone()),
            preactivation_concat: stacked(&steps, |s| s.preactivation_concat.clone()),
            alpha_logits: stacked(&steps, |s| s.alpha_logits.clone()),
        })
    }
}

/// Stack one per-step output along a fresh time axis.
fn stacked<B: Backend, const D: usize, const D2: usize>(
    steps: &[AttentiveStep<B>],
    pick: impl Fn(&AttentiveStep<B>) -> Tensor<B, D>,
) -> Tensor<B, D2> {
    let parts: alloc::vec::Vec<Tensor<B, D2>> = steps
        .iter()
        .map(|step| pick(step).unsqueeze_dim(1))
        .collect();
    Tensor::cat(parts, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type TestBackend = burn_ndarray::NdArray<f32>;

    fn random_inputs(
        batch_size: usize,
        seq_len: usize,
        input_size: usize,
        positions: usize,
        ctx_dim: usize,
    ) -> (Tensor<TestBackend, 3>, Tensor<TestBackend, 3>) {
        let device = Default::default();
        let input = Tensor::random([batch_size, seq_len, input_size], Distribution::Default, &device);
        let context = Tensor::random([batch_size, positions, ctx_dim], Distribution::Default, &device);
        (input, context)
    }

    #[test]
    fn test_run_shapes() {
        let device = Default::default();
        let cell = AttentiveCellConfig::new(16, 32, 24).init::<TestBackend>(&device);
        let (input, context) = random_inputs(4, 5, 16, 7, 24);

        let out = cell.run(input, None, Some(&context), None).unwrap();

        assert_eq!(out.hidden.dims(), [4, 5, 32]);
        assert_eq!(out.memory.dims(), [4, 5, 32]);
        assert_eq!(out.alpha.dims(), [4, 5, 7]);
        assert_eq!(out.attended_context.dims(), [4, 5, 24]);
        assert_eq!(out.selector.dims(), [4, 5]);
        assert_eq!(out.attention_preactivation.dims(), [4, 5, 24]);
        assert_eq!(out.updated_projected_context.dims(), [4, 5, 7, 24]);
        assert_eq!(out.gate_i.dims(), [4, 5, 32]);
        assert_eq!(out.preactivation_concat.dims(), [4, 5, 96]);
        assert_eq!(out.alpha_logits.dims(), [4, 5, 7]);
    }

    #[test]
    fn test_alpha_is_a_distribution() {
        let device = Default::default();
        let cell = AttentiveCellConfig::new(8, 16, 12).init::<TestBackend>(&device);
        let (input, context) = random_inputs(3, 4, 8, 9, 12);

        let out = cell.run(input, None, Some(&context), None).unwrap();
        let sums = out.alpha.sum_dim(2);
        let data = sums.into_data();
        for value in data.as_slice::<f32>().unwrap() {
            assert!((value - 1.0).abs() < 1e-5, "alpha summed to {value}");
        }
    }

    #[test]
    fn test_missing_context_rejected() {
        let device = Default::default();
        let cell = AttentiveCellConfig::new(8, 16, 12).init::<TestBackend>(&device);
        let (input, context) = random_inputs(2, 3, 8, 5, 12);

        assert_eq!(
            cell.run(input, None, None, None).unwrap_err(),
            LayerError::MissingContext
        );

        let projected = cell.project_context(&context);
        let x = Tensor::<TestBackend, 2>::zeros([2, 48], &device);
        assert_eq!(
            cell.step(None, x, None, Some(Tensor::zeros([2, 16], &device)), None, &projected, None)
                .unwrap_err(),
            LayerError::MissingContext
        );
    }

    #[test]
    fn test_missing_memory_rejected() {
        let device = Default::default();
        let cell = AttentiveCellConfig::new(8, 16, 12).init::<TestBackend>(&device);
        let (_, context) = random_inputs(2, 1, 8, 5, 12);

        let projected = cell.project_context(&context);
        let x = Tensor::<TestBackend, 2>::zeros([2, 48], &device);
        let result = cell.step(None, x, None, None, Some(&context), &projected, None);
        assert_eq!(result.unwrap_err(), LayerError::MissingMemory);
    }

    #[test]
    fn test_disabled_selector_is_identity() {
        let device = Default::default();
        let cell = AttentiveCellConfig::new(8, 16, 12)
            .with_selector(false)
            .init::<TestBackend>(&device);
        let (input, context) = random_inputs(2, 4, 8, 6, 12);

        let out = cell.run(input, None, Some(&context), None).unwrap();

        let data = out.selector.into_data();
        for value in data.as_slice::<f32>().unwrap() {
            assert_eq!(*value, 1.0);
        }

        // With the gate forced to one, the attended context is exactly the
        // alpha-weighted sum of the raw context vectors.
        let recomputed = (context.unsqueeze_dim::<4>(1) * out.alpha.unsqueeze_dim::<4>(3))
            .sum_dim(2)
            .squeeze::<3>(2);
        let diff = (recomputed - out.attended_context).abs().max().into_scalar();
        assert!(diff < 1e-6, "attended context diverged by {diff}");
    }

    #[test]
    fn test_dropout_constant_at_inference() {
        let device = Default::default();
        let cell = AttentiveCellConfig::new(8, 16, 12)
            .with_use_dropout(true)
            .init::<TestBackend>(&device);

        // NdArray does not track gradients, so the draw degenerates to the
        // deterministic inference constant.
        let mask = cell.sample_dropout(2, 3, &device).unwrap();
        assert_eq!(mask.dims(), [2, 3, 48]);
        let data = mask.into_data();
        for value in data.as_slice::<f32>().unwrap() {
            assert_eq!(*value, 0.5);
        }

        let step_mask = cell.sample_step_dropout(2, &device).unwrap();
        assert_eq!(step_mask.dims(), [2, 48]);
        let data = step_mask.into_data();
        for value in data.as_slice::<f32>().unwrap() {
            assert_eq!(*value, 0.5);
        }

        let plain = AttentiveCellConfig::new(8, 16, 12).init::<TestBackend>(&device);
        assert!(plain.sample_dropout(2, 3, &device).is_none());
        assert!(plain.sample_step_dropout(2, &device).is_none());
    }

    #[test]
    fn test_dropout_mask_on_plain_cell_rejected() {
        let device = Default::default();
        let cell = AttentiveCellConfig::new(8, 16, 12).init::<TestBackend>(&device);
        let (_, context) = random_inputs(2, 1, 8, 5, 12);

        let projected = cell.project_context(&context);
        let x = Tensor::<TestBackend, 2>::zeros([2, 48], &device);
        let stray = Tensor::<TestBackend, 2>::full([2, 48], 0.5, &device);
        let result = cell.step(
            None,
            x,
            None,
            Some(Tensor::zeros([2, 16], &device)),
            Some(&context),
            &projected,
            Some(&stray),
        );
        assert!(matches!(result, Err(LayerError::Configuration { .. })));
    }

    #[test]
    fn test_context_shape_rejected() {
        let device = Default::default();
        let cell = AttentiveCellConfig::new(8, 16, 12).init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 3>::random([2, 3, 8], Distribution::Default, &device);
        let context = Tensor::<TestBackend, 3>::random([2, 5, 10], Distribution::Default, &device);

        let result = cell.run(input, None, Some(&context), None);
        assert!(matches!(result, Err(LayerError::InvalidShape { .. })));
    }

    #[test]
    fn test_empty_sequence_rejected() {
        let device = Default::default();
        let cell = AttentiveCellConfig::new(8, 16, 12).init::<TestBackend>(&device);
        let (_, context) = random_inputs(2, 1, 8, 5, 12);

        let empty = Tensor::<TestBackend, 3>::zeros([2, 0, 8], &device);
        let result = cell.run(empty, None, Some(&context), None);
        assert!(matches!(result, Err(LayerError::InvalidShape { .. })));
    }
}
