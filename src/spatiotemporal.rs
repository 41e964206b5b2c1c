/*!
# Spatio-temporal non-local cell

Composition of [`NonLocalBlock`](crate::NonLocalBlock) and
[`GatedCell`](crate::GatedCell) for video feature volumes laid out as
`[sample, spatial_position, time, channel]`: spatial positions of each
time slice are mixed through the non-local block (never across slices),
then every spatial patch is aggregated across time by the gated cell.
Only the final hidden state per patch survives, so a whole volume
collapses to one feature vector per spatial position.

Sequences here have fixed, known length; no mask is involved.
*/

use burn::{
    config::Config,
    module::Module,
    tensor::{backend::Backend, Tensor},
};

use crate::error::LayerError;
use crate::gated::{GatedCell, GatedCellConfig};
use crate::nonlocal::{NonLocalBlock, NonLocalBlockConfig, ValueMode};

/// Configuration for [`SpatioTemporalCell`].
#[derive(Config, Debug)]
pub struct SpatioTemporalCellConfig {
    /// Feature width of every grid position.
    pub channels: usize,
    /// Number of time slices per volume.
    pub time_steps: usize,
    /// Spatial grid width.
    pub spatial_width: usize,
    /// Spatial grid height.
    pub spatial_height: usize,
    /// Value path variant of the embedded non-local block.
    #[config(default = "ValueMode::Channel")]
    pub value_mode: ValueMode,
    /// Scale of the Gaussian draws used for non-square weights.
    #[config(default = "0.01")]
    pub init_scale: f32,
    /// Seed for the initialization draws.
    #[config(default = "1234")]
    pub seed: u64,
}

impl SpatioTemporalCellConfig {
    /// Number of spatial positions per time slice.
    pub const fn window(&self) -> usize {
        self.spatial_width * self.spatial_height
    }

    /// Initialize a new spatio-temporal cell.
    pub fn init<B: Backend>(&self, device: &B::Device) -> SpatioTemporalCell<B> {
        let block = NonLocalBlockConfig::new(self.channels)
            .with_value_mode(self.value_mode)
            .with_init_scale(self.init_scale)
            .with_seed(self.seed)
            .init(device);
        let cell = GatedCellConfig::new(self.channels, self.channels)
            .with_init_scale(self.init_scale)
            .with_seed(self.seed.wrapping_add(1))
            .init(device);

        SpatioTemporalCell {
            block,
            cell,
            time_steps: self.time_steps,
            window: self.window(),
        }
    }
}

/// Spatial non-local mixing followed by temporal gated aggregation.
#[derive(Module, Debug)]
pub struct SpatioTemporalCell<B: Backend> {
    /// Spatial mixer, shared by every time slice.
    pub block: NonLocalBlock<B>,
    /// Temporal aggregator, shared by every spatial patch.
    pub cell: GatedCell<B>,
    /// Number of time slices per volume.
    pub time_steps: usize,
    /// Number of spatial positions per time slice.
    pub window: usize,
}

impl<B: Backend> SpatioTemporalCell<B> {
    fn check_volume(
        &self,
        what: &'static str,
        got: [usize; 4],
    ) -> Result<(), LayerError> {
        let [_, window, time_steps, channels] = got;
        if window != self.window || time_steps != self.time_steps || channels != self.block.channels
        {
            return Err(LayerError::InvalidShape {
                what,
                expected: alloc::format!(
                    "[batch, {}, {}, {}]",
                    self.window,
                    self.time_steps,
                    self.block.channels
                ),
                got: alloc::format!("{got:?}"),
            });
        }
        Ok(())
    }

    /// Mix spatial positions within every time slice, keeping the
    /// `[batch, window, time, channel]` layout.
    pub fn mix_spatial(&self, volume: Tensor<B, 4>) -> Result<Tensor<B, 4>, LayerError> {
        let [batch_size, window, time_steps, channels] = volume.dims();
        let slices = volume
            .swap_dims(1, 2)
            .reshape([batch_size * time_steps, window, channels]);
        let mixed = self.block.forward(slices)?;
        Ok(mixed
            .reshape([batch_size, time_steps, window, channels])
            .swap_dims(1, 2))
    }

    /// Collapse a `[batch, window, time, channel]` volume to the final
    /// hidden state per spatial patch, `[batch, window, channel]`.
    pub fn forward(&self, volume: Tensor<B, 4>) -> Result<Tensor<B, 3>, LayerError> {
        let dims = volume.dims();
        self.check_volume("feature volume", dims)?;
        let [batch_size, window, time_steps, channels] = dims;

        let mixed = self.mix_spatial(volume)?;
        // Hold the patch fixed and recur across its time axis; patches are
        // independent sequences, so they fold into the batch.
        let seq = mixed.reshape([batch_size * window, time_steps, channels]);
        let (hidden, _) = self.cell.run(seq, None, None)?;
        let last = hidden
            .slice([
                0..batch_size * window,
                (time_steps - 1)..time_steps,
                0..channels,
            ])
            .squeeze::<2>(1);
        Ok(last.reshape([batch_size, window, channels]))
    }

    /// Like [`Self::forward`], for volumes already flattened to
    /// `[batch, time * window, channel]` with slice-major rows (the first
    /// `window` rows belong to time slice 0).
    pub fn forward_flat(&self, volume: Tensor<B, 3>) -> Result<Tensor<B, 3>, LayerError> {
        let [batch_size, rows, channels] = volume.dims();
        if rows != self.time_steps * self.window {
            return Err(LayerError::InvalidShape {
                what: "flattened feature volume",
                expected: alloc::format!(
                    "[batch, {}, {}]",
                    self.time_steps * self.window,
                    self.block.channels
                ),
                got: alloc::format!("{:?}", volume.dims()),
            });
        }
        let unflattened = volume
            .reshape([batch_size, self.time_steps, self.window, channels])
            .swap_dims(1, 2);
        self.forward(unflattened)
    }
}
