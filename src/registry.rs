/*!
# Layer registry

One enumerated entry point over the four layer families, replacing
selection by string key with a typed identifier. [`LayerConfig`] holds
the union of every family's options, validates the combination, and
builds the matching [`Layer`]; [`Layer::forward`] dispatches a rank-3
input to whichever entry point the family expects.
*/

use burn::{
    config::Config,
    module::Module,
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::attentive::{AttentiveCell, AttentiveCellConfig, AttentiveSequence};
use crate::error::LayerError;
use crate::gated::{CellState, GatedCell, GatedCellConfig};
use crate::nonlocal::{NonLocalBlock, NonLocalBlockConfig, ValueMode};
use crate::spatiotemporal::{SpatioTemporalCell, SpatioTemporalCellConfig};

/// Identifier of a layer family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    /// Plain gated recurrence.
    Gated,
    /// Gated recurrence with per-step attention.
    Attentive,
    /// Feed-forward non-local mixing.
    NonLocal,
    /// Non-local mixing plus temporal aggregation.
    SpatioTemporal,
}

/// Union of every layer family's options.
///
/// `input_dim` only matters for the recurrent kinds; the non-local kinds
/// read their channel width from `hidden_dim`. A `context_dim` of zero
/// means "same as `hidden_dim`".
#[derive(Config, Debug)]
pub struct LayerConfig {
    /// Which family to build.
    pub kind: LayerKind,
    /// Width of raw step inputs (recurrent kinds).
    pub input_dim: usize,
    /// Width of the hidden state, or the channel width of grid rows.
    pub hidden_dim: usize,
    /// Width of context vectors; 0 defaults to `hidden_dim`.
    #[config(default = "0")]
    pub context_dim: usize,
    /// Build the selector gate (attentive kind).
    #[config(default = "true")]
    pub selector: bool,
    /// Recurrent gate dropout (attentive kind).
    #[config(default = "false")]
    pub use_dropout: bool,
    /// Value path of the non-local kinds.
    #[config(default = "ValueMode::Channel")]
    pub value_mode: ValueMode,
    /// Time slices per volume (spatio-temporal kind).
    #[config(default = "0")]
    pub time_steps: usize,
    /// Spatial grid width (spatio-temporal kind).
    #[config(default = "0")]
    pub spatial_width: usize,
    /// Spatial grid height (spatio-temporal kind).
    #[config(default = "0")]
    pub spatial_height: usize,
    /// Scale of the Gaussian draws used for non-square weights.
    #[config(default = "0.01")]
    pub init_scale: f32,
    /// Seed for the initialization draws.
    #[config(default = "1234")]
    pub seed: u64,
}

impl LayerConfig {
    fn context_dim_or_default(&self) -> usize {
        if self.context_dim == 0 {
            self.hidden_dim
        } else {
            self.context_dim
        }
    }

    fn validate(&self) -> Result<(), LayerError> {
        if self.hidden_dim == 0 {
            return Err(LayerError::Configuration {
                what: "hidden_dim must be at least 1".into(),
            });
        }
        match self.kind {
            LayerKind::Gated | LayerKind::Attentive => {
                if self.input_dim == 0 {
                    return Err(LayerError::Configuration {
                        what: "recurrent layers need an input_dim of at least 1".into(),
                    });
                }
            }
            LayerKind::NonLocal => {
                if self.value_mode == (ValueMode::Position { positions: 0 }) {
                    return Err(LayerError::Configuration {
                        what: "position-mixing value path needs at least one position".into(),
                    });
                }
            }
            LayerKind::SpatioTemporal => {
                if self.time_steps == 0 || self.spatial_width == 0 || self.spatial_height == 0 {
                    return Err(LayerError::Configuration {
                        what: alloc::format!(
                            "spatio-temporal layers need nonzero time_steps, spatial_width and spatial_height, got {}, {} and {}",
                            self.time_steps,
                            self.spatial_width,
                            self.spatial_height
                        ),
                    });
                }
                if let ValueMode::Position { positions } = self.value_mode {
                    let window = self.spatial_width * self.spatial_height;
                    if positions != window {
                        return Err(LayerError::Configuration {
                            what: alloc::format!(
                                "position-mixing value path covers {positions} positions, but the spatial window has {window}"
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Validate the option combination and build the layer.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Layer<B>, LayerError> {
        self.validate()?;
        let layer = match self.kind {
            LayerKind::Gated => Layer::Gated(
                GatedCellConfig::new(self.input_dim, self.hidden_dim)
                    .with_init_scale(self.init_scale)
                    .with_seed(self.seed)
                    .init(device),
            ),
            LayerKind::Attentive => Layer::Attentive(
                AttentiveCellConfig::new(
                    self.input_dim,
                    self.hidden_dim,
                    self.context_dim_or_default(),
                )
                .with_selector(self.selector)
                .with_use_dropout(self.use_dropout)
                .with_init_scale(self.init_scale)
                .with_seed(self.seed)
                .init(device),
            ),
            LayerKind::NonLocal => Layer::NonLocal(
                NonLocalBlockConfig::new(self.hidden_dim)
                    .with_value_mode(self.value_mode)
                    .with_init_scale(self.init_scale)
                    .with_seed(self.seed)
                    .init(device),
            ),
            LayerKind::SpatioTemporal => Layer::SpatioTemporal(
                SpatioTemporalCellConfig::new(
                    self.hidden_dim,
                    self.time_steps,
                    self.spatial_width,
                    self.spatial_height,
                )
                .with_value_mode(self.value_mode)
                .with_init_scale(self.init_scale)
                .with_seed(self.seed)
                .init(device),
            ),
        };
        Ok(layer)
    }
}

/// A built layer of any family.
#[derive(Module, Debug)]
pub enum Layer<B: Backend> {
    /// Plain gated recurrence.
    Gated(GatedCell<B>),
    /// Gated recurrence with per-step attention.
    Attentive(AttentiveCell<B>),
    /// Feed-forward non-local mixing.
    NonLocal(NonLocalBlock<B>),
    /// Non-local mixing plus temporal aggregation.
    SpatioTemporal(SpatioTemporalCell<B>),
}

/// What a [`Layer`] pass produces, per family.
#[derive(Clone, Debug)]
pub enum LayerOutput<B: Backend> {
    /// Hidden and memory sequences of the gated cell,
    /// each [`batch_size`, `seq_length`, `dim`].
    Sequence {
        /// Hidden outputs.
        hidden: Tensor<B, 3>,
        /// Memory states.
        memory: Tensor<B, 3>,
    },
    /// Full per-step outputs of the attentive cell.
    Attentive(AttentiveSequence<B>),
    /// Refined grids of the non-local block,
    /// [`batch_size`, `rows`, `channels`].
    Grid(Tensor<B, 3>),
    /// Final per-patch features of the spatio-temporal cell,
    /// [`batch_size`, `window`, `channels`].
    Patches(Tensor<B, 3>),
}

impl<B: Backend> Layer<B> {
    /// The family this layer belongs to.
    pub fn kind(&self) -> LayerKind {
        match self {
            Layer::Gated(_) => LayerKind::Gated,
            Layer::Attentive(_) => LayerKind::Attentive,
            Layer::NonLocal(_) => LayerKind::NonLocal,
            Layer::SpatioTemporal(_) => LayerKind::SpatioTemporal,
        }
    }

    /// Run one pass of whichever family this is.
    ///
    /// The rank-3 `input` is a step sequence for the recurrent kinds, a
    /// batch of grids for the non-local kind, and a slice-major flattened
    /// volume for the spatio-temporal kind. `mask`, `context` and `state`
    /// only reach the kinds that consume them.
    pub fn forward(
        &self,
        input: Tensor<B, 3>,
        mask: Option<&Tensor<B, 2>>,
        context: Option<&Tensor<B, 3>>,
        state: Option<CellState<B>>,
    ) -> Result<LayerOutput<B>, LayerError> {
        match self {
            Layer::Gated(cell) => {
                let (hidden, memory) = cell.run(input, mask, state)?;
                Ok(LayerOutput::Sequence { hidden, memory })
            }
            Layer::Attentive(cell) => {
                Ok(LayerOutput::Attentive(cell.run(input, mask, context, state)?))
            }
            Layer::NonLocal(block) => Ok(LayerOutput::Grid(block.forward(input)?)),
            Layer::SpatioTemporal(cell) => Ok(LayerOutput::Patches(cell.forward_flat(input)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type TestBackend = burn_ndarray::NdArray<f32>;

    #[test]
    fn test_gated_dispatch() {
        let device = Default::default();
        let layer = LayerConfig::new(LayerKind::Gated, 16, 32)
            .init::<TestBackend>(&device)
            .unwrap();
        assert_eq!(layer.kind(), LayerKind::Gated);

        let input = Tensor::random([2, 5, 16], Distribution::Default, &device);
        let out = layer.forward(input, None, None, None).unwrap();
        match out {
            LayerOutput::Sequence { hidden, memory } => {
                assert_eq!(hidden.dims(), [2, 5, 32]);
                assert_eq!(memory.dims(), [2, 5, 32]);
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_attentive_dispatch() {
        let device = Default::default();
        let layer = LayerConfig::new(LayerKind::Attentive, 16, 32)
            .with_context_dim(24)
            .init::<TestBackend>(&device)
            .unwrap();
        assert_eq!(layer.kind(), LayerKind::Attentive);

        let input = Tensor::random([2, 5, 16], Distribution::Default, &device);
        let context = Tensor::random([2, 7, 24], Distribution::Default, &device);
        let out = layer.forward(input, None, Some(&context), None).unwrap();
        match out {
            LayerOutput::Attentive(seq) => {
                assert_eq!(seq.hidden.dims(), [2, 5, 32]);
                assert_eq!(seq.alpha.dims(), [2, 5, 7]);
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_non_local_dispatch() {
        let device = Default::default();
        let layer = LayerConfig::new(LayerKind::NonLocal, 0, 16)
            .init::<TestBackend>(&device)
            .unwrap();
        assert_eq!(layer.kind(), LayerKind::NonLocal);

        let grids = Tensor::random([3, 9, 16], Distribution::Default, &device);
        let out = layer.forward(grids, None, None, None).unwrap();
        match out {
            LayerOutput::Grid(refined) => assert_eq!(refined.dims(), [3, 9, 16]),
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_spatio_temporal_dispatch() {
        let device = Default::default();
        let layer = LayerConfig::new(LayerKind::SpatioTemporal, 0, 8)
            .with_time_steps(3)
            .with_spatial_width(2)
            .with_spatial_height(2)
            .init::<TestBackend>(&device)
            .unwrap();
        assert_eq!(layer.kind(), LayerKind::SpatioTemporal);

        let volume = Tensor::random([2, 12, 8], Distribution::Default, &device);
        let out = layer.forward(volume, None, None, None).unwrap();
        match out {
            LayerOutput::Patches(features) => assert_eq!(features.dims(), [2, 4, 8]),
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_context_dim_defaults_to_hidden_dim() {
        let device = Default::default();
        let layer = LayerConfig::new(LayerKind::Attentive, 16, 32)
            .init::<TestBackend>(&device)
            .unwrap();
        match layer {
            Layer::Attentive(cell) => assert_eq!(cell.ctx_dim, 32),
            other => panic!("unexpected layer {other:?}"),
        }
    }

    #[test]
    fn test_invalid_combinations_rejected() {
        let device = Default::default();

        let zero_hidden = LayerConfig::new(LayerKind::Gated, 16, 0).init::<TestBackend>(&device);
        assert!(matches!(zero_hidden, Err(LayerError::Configuration { .. })));

        let zero_input = LayerConfig::new(LayerKind::Attentive, 0, 32).init::<TestBackend>(&device);
        assert!(matches!(zero_input, Err(LayerError::Configuration { .. })));

        let no_grid = LayerConfig::new(LayerKind::SpatioTemporal, 0, 8)
            .with_time_steps(3)
            .init::<TestBackend>(&device);
        assert!(matches!(no_grid, Err(LayerError::Configuration { .. })));

        let bad_positions = LayerConfig::new(LayerKind::SpatioTemporal, 0, 8)
            .with_time_steps(3)
            .with_spatial_width(2)
            .with_spatial_height(2)
            .with_value_mode(ValueMode::Position { positions: 9 })
            .init::<TestBackend>(&device);
        assert!(matches!(bad_positions, Err(LayerError::Configuration { .. })));
    }
}
