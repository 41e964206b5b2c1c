/*!
Weight initialization used by every cell in the crate.

Recurrent blocks start from random orthogonal matrices, plain projections
from scaled Gaussian draws. [`norm_weight`] picks between the two the way
the hLSTMat family of captioning models does: a square target comes out
orthogonal unless explicitly asked not to.

Draws happen on the host from a seeded [`StdRng`], so initialization is
reproducible independently of the backend.
*/

use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

/// Matrix with entries drawn from `scale * N(0, 1)`.
pub fn scaled_normal<B: Backend>(
    rng: &mut StdRng,
    rows: usize,
    cols: usize,
    scale: f32,
    device: &B::Device,
) -> Tensor<B, 2> {
    let mut data = alloc::vec::Vec::with_capacity(rows * cols);
    for _ in 0..rows * cols {
        let z: f32 = rng.sample(StandardNormal);
        data.push(scale * z);
    }
    Tensor::from_data(TensorData::new(data, [rows, cols]), device)
}

/// Random orthogonal matrix of shape [`size`, `size`].
///
/// Householder QR of a square Gaussian draw; the diagonal of `R` is
/// forced positive so the factorization is unique and `Q` stays
/// orthogonal after the sign correction.
pub fn orthogonal<B: Backend>(rng: &mut StdRng, size: usize, device: &B::Device) -> Tensor<B, 2> {
    let n = size;
    let mut r = alloc::vec::Vec::with_capacity(n * n);
    for _ in 0..n * n {
        let z: f32 = rng.sample(StandardNormal);
        r.push(z);
    }
    let mut q = alloc::vec![0.0f32; n * n];
    for i in 0..n {
        q[i * n + i] = 1.0;
    }

    let mut v = alloc::vec![0.0f32; n];
    for k in 0..n {
        let mut norm = 0.0f32;
        for i in k..n {
            norm += r[i * n + k] * r[i * n + k];
        }
        let norm = norm.sqrt();
        if norm <= f32::EPSILON {
            continue;
        }
        let alpha = if r[k * n + k] > 0.0 { -norm } else { norm };
        for entry in v.iter_mut() {
            *entry = 0.0;
        }
        v[k] = r[k * n + k] - alpha;
        for i in (k + 1)..n {
            v[i] = r[i * n + k];
        }
        let vtv: f32 = v[k..].iter().map(|x| x * x).sum();
        if vtv <= f32::EPSILON {
            continue;
        }

        // r <- (I - 2 v v^T / v^T v) r, columns before k are already zero
        // below the diagonal.
        for j in k..n {
            let mut s = 0.0f32;
            for i in k..n {
                s += v[i] * r[i * n + j];
            }
            let s = 2.0 * s / vtv;
            for i in k..n {
                r[i * n + j] -= s * v[i];
            }
        }
        // q <- q (I - 2 v v^T / v^T v), accumulating the reflectors.
        for i in 0..n {
            let mut s = 0.0f32;
            for j in k..n {
                s += q[i * n + j] * v[j];
            }
            let s = 2.0 * s / vtv;
            for j in k..n {
                q[i * n + j] -= s * v[j];
            }
        }
    }

    for j in 0..n {
        if r[j * n + j] < 0.0 {
            for i in 0..n {
                q[i * n + j] = -q[i * n + j];
            }
        }
    }

    Tensor::from_data(TensorData::new(q, [n, n]), device)
}

/// Default weight draw: orthogonal when the target is square and `ortho`
/// is set, `scale * N(0, 1)` otherwise.
pub fn norm_weight<B: Backend>(
    rng: &mut StdRng,
    rows: usize,
    cols: usize,
    scale: f32,
    ortho: bool,
    device: &B::Device,
) -> Tensor<B, 2> {
    if rows == cols && ortho {
        orthogonal(rng, rows, device)
    } else {
        scaled_normal(rng, rows, cols, scale, device)
    }
}

/// Three gate blocks of shape [`rows`, `cols`] concatenated along the
/// column axis, one per gate (input, modulation, output).
pub fn gate_stack<B: Backend>(
    rng: &mut StdRng,
    rows: usize,
    cols: usize,
    scale: f32,
    device: &B::Device,
) -> Tensor<B, 2> {
    let blocks = alloc::vec![
        norm_weight(rng, rows, cols, scale, true, device),
        norm_weight(rng, rows, cols, scale, true, device),
        norm_weight(rng, rows, cols, scale, true, device),
    ];
    Tensor::cat(blocks, 1)
}
