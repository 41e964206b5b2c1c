/*
# hLSTMat layers: attention-augmented recurrence for video description

This library implements the layer family behind hierarchical LSTMs with
adjusted temporal attention, as described in:
"Hierarchical LSTM with Adjusted Temporal Attention for Video Captioning"
(Song et al. 2017), with the non-local extensions of
"Non-local Neural Networks" (Wang et al. 2018).

The decoding core is a gated memory cell whose gates read the previous
memory state; the attentive variant interleaves per-step soft attention
over frame regions with an optional selector gate. Non-local blocks mix
spatial positions of a feature grid, and the spatio-temporal cell chains
that mixing into a temporal recurrence per patch.

## Features

- **GatedCell**: memory-gated recurrence with mask-aware sequence driving
- **AttentiveCell**: per-step soft attention over context vectors, with an
  optional selector gate and recurrent gate dropout
- **NonLocalBlock**: all-pairs affinity mixing over feature grids, with a
  channel-projected or position-mixing value path
- **SpatioTemporalCell**: per-slice spatial mixing composed with temporal
  aggregation, one output feature per spatial patch
- **Layer registry**: one typed configuration surface over all four
  families

## Example

```rust,no_run
use burn::backend::NdArray;
use burn::tensor::{Distribution, Tensor};
use hlstmat::AttentiveCellConfig;

type Backend = NdArray;

let device = Default::default();
let cell = AttentiveCellConfig::new(64, 128, 256).init::<Backend>(&device);

let words = Tensor::<Backend, 3>::random([2, 5, 64], Distribution::Default, &device);
let regions = Tensor::<Backend, 3>::random([2, 28, 256], Distribution::Default, &device);

let out = cell.run(words, None, Some(&regions), None).unwrap();
// One attention distribution per step: [2, 5, 28].
println!("{:?}", out.alpha.dims());
```
*/

extern crate alloc;

mod attentive;
mod error;
mod gated;
pub mod init;
mod nonlocal;
mod registry;
mod spatiotemporal;

pub use attentive::{AttentiveCell, AttentiveCellConfig, AttentiveSequence, AttentiveStep, Selector};
pub use error::LayerError;
pub use gated::{CellState, GatedCell, GatedCellConfig};
pub use nonlocal::{NonLocalBlock, NonLocalBlockConfig, ValueKernel, ValueMode};
pub use registry::{Layer, LayerConfig, LayerKind, LayerOutput};
pub use spatiotemporal::{SpatioTemporalCell, SpatioTemporalCellConfig};

pub const VERSION: &str = "0.1.0";
