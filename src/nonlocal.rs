/*!
# Non-local attention block

Self-attention over the rows of a feature grid in the style of Wang et
al., *Non-local Neural Networks* (CVPR 2018): every row is recomputed as
an affinity-weighted mixture of value vectors.

The affinity is `softmax(theta(x) . phi(x)^T)` row-wise. The value path
has two modes: the usual per-row channel projection, and a position-mixing
variant whose square kernel acts across rows instead of channels and
therefore pins the kernel size to the number of grid rows.

[`NonLocalBlock::forward_sliced`] applies the block independently to the
time slices of a flattened spatio-temporal volume; affinities never cross
slice boundaries.
*/

use burn::{
    config::Config,
    module::{Module, Param},
    tensor::{activation, backend::Backend, Tensor},
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::LayerError;
use crate::init;

/// How the value path treats the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueMode {
    /// Project every row through a `channels x channels` kernel.
    Channel,
    /// Mix rows through a `positions x positions` kernel; requires grids
    /// with exactly this many rows.
    Position {
        /// Number of grid rows the kernel covers.
        positions: usize,
    },
}

/// Configuration for [`NonLocalBlock`].
#[derive(Config, Debug)]
pub struct NonLocalBlockConfig {
    /// Feature width of every grid row.
    pub channels: usize,
    /// Value path variant.
    #[config(default = "ValueMode::Channel")]
    pub value_mode: ValueMode,
    /// Scale of the Gaussian draws used for non-square kernels.
    #[config(default = "0.01")]
    pub init_scale: f32,
    /// Seed for the initialization draws.
    #[config(default = "1234")]
    pub seed: u64,
}

impl NonLocalBlockConfig {
    /// Initialize a new non-local block.
    pub fn init<B: Backend>(&self, device: &B::Device) -> NonLocalBlock<B> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let scale = self.init_scale;
        let c = self.channels;

        let w_theta = init::norm_weight(&mut rng, c, c, scale, true, device);
        let w_phi = init::norm_weight(&mut rng, c, c, scale, true, device);
        let value = match self.value_mode {
            ValueMode::Channel => ValueKernel::Channel(Param::from_tensor(init::norm_weight(
                &mut rng, c, c, scale, true, device,
            ))),
            ValueMode::Position { positions } => ValueKernel::Position(Param::from_tensor(
                init::norm_weight(&mut rng, positions, positions, scale, true, device),
            )),
        };

        NonLocalBlock {
            w_theta: Param::from_tensor(w_theta),
            w_phi: Param::from_tensor(w_phi),
            value,
            channels: c,
        }
    }
}

/// Value-path kernel of a [`NonLocalBlock`].
#[derive(Module, Debug)]
pub enum ValueKernel<B: Backend> {
    /// Channel projection, shape [`channels`, `channels`].
    Channel(Param<Tensor<B, 2>>),
    /// Row mixing, shape [`positions`, `positions`].
    Position(Param<Tensor<B, 2>>),
}

/// Non-local self-attention over grid rows.
#[derive(Module, Debug)]
pub struct NonLocalBlock<B: Backend> {
    /// Query projection, shape [`channels`, `channels`].
    pub w_theta: Param<Tensor<B, 2>>,
    /// Key projection, shape [`channels`, `channels`].
    pub w_phi: Param<Tensor<B, 2>>,
    /// Value kernel.
    pub value: ValueKernel<B>,
    /// Feature width of every grid row.
    pub channels: usize,
}

impl<B: Backend> NonLocalBlock<B> {
    fn check_channels(&self, what: &'static str, got: usize) -> Result<(), LayerError> {
        if got != self.channels {
            return Err(LayerError::InvalidShape {
                what,
                expected: alloc::format!("{} channels", self.channels),
                got: alloc::format!("{got} channels"),
            });
        }
        Ok(())
    }

    /// Apply the block to a single grid, [`rows`, `channels`].
    pub fn forward_single(&self, grid: Tensor<B, 2>) -> Result<Tensor<B, 2>, LayerError> {
        let [rows, channels] = grid.dims();
        self.check_channels("grid", channels)?;

        let theta = grid.clone().matmul(self.w_theta.val());
        let phi = grid.clone().matmul(self.w_phi.val());
        let affinity = activation::softmax(theta.matmul(phi.transpose()), 1);

        let value = match &self.value {
            ValueKernel::Channel(w) => grid.matmul(w.val()),
            ValueKernel::Position(w) => {
                let [positions, _] = w.val().dims();
                if rows != positions {
                    return Err(LayerError::InvalidShape {
                        what: "grid",
                        expected: alloc::format!("{positions} rows"),
                        got: alloc::format!("{rows} rows"),
                    });
                }
                w.val().matmul(grid)
            }
        };

        Ok(affinity.matmul(value))
    }

    /// Apply the block to a batch of grids, [`batch_size`, `rows`,
    /// `channels`]; every grid attends only to itself.
    pub fn forward(&self, grids: Tensor<B, 3>) -> Result<Tensor<B, 3>, LayerError> {
        let [_, rows, channels] = grids.dims();
        self.check_channels("grid", channels)?;

        let theta = grids.clone().matmul(self.w_theta.val().unsqueeze_dim::<3>(0));
        let phi = grids.clone().matmul(self.w_phi.val().unsqueeze_dim::<3>(0));
        let affinity = activation::softmax(theta.matmul(phi.swap_dims(1, 2)), 2);

        let value = match &self.value {
            ValueKernel::Channel(w) => grids.matmul(w.val().unsqueeze_dim::<3>(0)),
            ValueKernel::Position(w) => {
                let [positions, _] = w.val().dims();
                if rows != positions {
                    return Err(LayerError::InvalidShape {
                        what: "grid",
                        expected: alloc::format!("{positions} rows"),
                        got: alloc::format!("{rows} rows"),
                    });
                }
                // w . grid per batch entry, written right-to-left so the
                // broadcast stays on the kernel side.
                grids
                    .swap_dims(1, 2)
                    .matmul(w.val().transpose().unsqueeze_dim::<3>(0))
                    .swap_dims(1, 2)
            }
        };

        Ok(affinity.matmul(value))
    }

    /// Apply the block independently to every time slice of a flattened
    /// volume, [`batch_size`, `time_steps * window`, `channels`]. Rows
    /// are grouped slice-major: the first `window` rows form slice 0.
    pub fn forward_sliced(
        &self,
        volume: Tensor<B, 3>,
        time_steps: usize,
    ) -> Result<Tensor<B, 3>, LayerError> {
        let [batch_size, rows, channels] = volume.dims();
        self.check_channels("spatio-temporal volume", channels)?;
        if time_steps == 0 || rows % time_steps != 0 {
            return Err(LayerError::InvalidShape {
                what: "spatio-temporal volume",
                expected: alloc::format!("row count divisible by {time_steps} time steps"),
                got: alloc::format!("{rows} rows"),
            });
        }
        let window = rows / time_steps;

        let slices = volume.reshape([batch_size * time_steps, window, channels]);
        let mixed = self.forward(slices)?;
        Ok(mixed.reshape([batch_size, rows, channels]))
    }
}
