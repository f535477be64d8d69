mod attention;

use rayon::prelude::*;

use crate::backend::{Activation, AttentionDims, ComputeBackend};
use crate::error::{Result, TensorError};

/// Pure-Rust CPU compute backend.
///
/// Implements all operations with straightforward loops. The parallel
/// variant splits matmul rows and attention heads across the rayon pool;
/// every output element is still reduced in the same order, so both
/// variants produce bit-identical results.
#[derive(Debug, Clone, Default)]
pub struct CpuBackend {
    parallel: bool,
}

impl CpuBackend {
    /// Single-threaded backend.
    pub fn new() -> Self {
        CpuBackend { parallel: false }
    }

    /// Backend that fans work out over the rayon thread pool.
    pub fn parallel() -> Self {
        CpuBackend { parallel: true }
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }
}

fn check_rows(op: &str, len: usize, row: usize) -> Result<usize> {
    if row == 0 {
        return Err(TensorError::Other(format!("{}: row size must be > 0", op)));
    }
    if len % row != 0 {
        return Err(TensorError::Other(format!(
            "{}: x.len()={} is not a multiple of {}",
            op, len, row
        )));
    }
    Ok(len / row)
}

fn matmul_row(a_row: &[f32], b: &[f32], n: usize, out: &mut [f32]) {
    for (j, slot) in out.iter_mut().enumerate() {
        let mut sum = 0.0f32;
        for (p, &a) in a_row.iter().enumerate() {
            sum += a * b[p * n + j];
        }
        *slot = sum;
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        if self.parallel {
            "cpu-parallel"
        } else {
            "cpu"
        }
    }

    fn matmul(&self, a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Result<Vec<f32>> {
        if a.len() != m * k {
            return Err(TensorError::Other(format!(
                "matmul: a.len()={} but expected m*k={}",
                a.len(),
                m * k
            )));
        }
        if b.len() != k * n {
            return Err(TensorError::Other(format!(
                "matmul: b.len()={} but expected k*n={}",
                b.len(),
                k * n
            )));
        }

        let mut c = vec![0.0f32; m * n];
        if n == 0 {
            return Ok(c);
        }
        if self.parallel {
            c.par_chunks_mut(n)
                .enumerate()
                .for_each(|(i, row)| matmul_row(&a[i * k..(i + 1) * k], b, n, row));
        } else {
            for (i, row) in c.chunks_mut(n).enumerate() {
                matmul_row(&a[i * k..(i + 1) * k], b, n, row);
            }
        }
        Ok(c)
    }

    fn add(&self, a: &[f32], b: &[f32]) -> Result<Vec<f32>> {
        if a.len() != b.len() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![a.len()],
                got: vec![b.len()],
            });
        }
        Ok(a.iter().zip(b.iter()).map(|(x, y)| x + y).collect())
    }

    fn scale(&self, a: &[f32], s: f32) -> Result<Vec<f32>> {
        Ok(a.iter().map(|x| x * s).collect())
    }

    fn bias_add(&self, x: &[f32], bias: &[f32]) -> Result<Vec<f32>> {
        check_rows("bias_add", x.len(), bias.len())?;
        Ok(x
            .chunks(bias.len())
            .flat_map(|row| row.iter().zip(bias.iter()).map(|(v, b)| v + b))
            .collect())
    }

    fn layer_norm(
        &self,
        x: &[f32],
        gamma: &[f32],
        beta: &[f32],
        eps: f32,
        hidden_size: usize,
    ) -> Result<Vec<f32>> {
        if gamma.len() != hidden_size || beta.len() != hidden_size {
            return Err(TensorError::Other(format!(
                "layer_norm: gamma/beta lengths {}/{} but hidden_size={}",
                gamma.len(),
                beta.len(),
                hidden_size
            )));
        }
        check_rows("layer_norm", x.len(), hidden_size)?;

        let mut result = vec![0.0f32; x.len()];
        for (row, out) in x.chunks(hidden_size).zip(result.chunks_mut(hidden_size)) {
            let mean = row.iter().sum::<f32>() / hidden_size as f32;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>()
                / hidden_size as f32;
            let inv_std = 1.0 / (var + eps).sqrt();
            for i in 0..hidden_size {
                out[i] = (row[i] - mean) * inv_std * gamma[i] + beta[i];
            }
        }
        Ok(result)
    }

    fn softmax(&self, x: &[f32], n: usize) -> Result<Vec<f32>> {
        check_rows("softmax", x.len(), n)?;
        let mut result = vec![0.0f32; x.len()];
        for (chunk, out) in x.chunks(n).zip(result.chunks_mut(n)) {
            softmax_into(chunk, out);
        }
        Ok(result)
    }

    fn log_softmax(&self, x: &[f32], n: usize) -> Result<Vec<f32>> {
        check_rows("log_softmax", x.len(), n)?;
        let mut result = vec![0.0f32; x.len()];
        for (chunk, out) in x.chunks(n).zip(result.chunks_mut(n)) {
            let max_val = chunk.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let log_sum = chunk.iter().map(|v| (v - max_val).exp()).sum::<f32>().ln();
            for (o, v) in out.iter_mut().zip(chunk.iter()) {
                *o = v - max_val - log_sum;
            }
        }
        Ok(result)
    }

    fn activation(&self, x: &[f32], activation: Activation) -> Result<Vec<f32>> {
        Ok(match activation {
            Activation::Linear => x.to_vec(),
            Activation::Relu => x.iter().map(|&v| v.max(0.0)).collect(),
            Activation::Gelu => x
                .iter()
                .map(|&v| {
                    let c = (2.0f32 / std::f32::consts::PI).sqrt();
                    0.5 * v * (1.0 + (c * (v + 0.044715 * v * v * v)).tanh())
                })
                .collect(),
        })
    }

    fn attention(
        &self,
        query: &[f32],
        key: &[f32],
        value: &[f32],
        mask: &[bool],
        dims: AttentionDims,
    ) -> Result<Vec<f32>> {
        if query.len() != dims.query_numel() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![dims.batch, dims.query_len, dims.num_heads, dims.head_dim],
                got: vec![query.len()],
            });
        }
        if key.len() != dims.key_numel() || value.len() != dims.key_numel() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![dims.batch, dims.key_len, dims.num_heads, dims.head_dim],
                got: vec![key.len(), value.len()],
            });
        }
        if mask.len() != dims.mask_numel() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![dims.batch, dims.query_len, dims.key_len],
                got: vec![mask.len()],
            });
        }

        let pairs = dims.batch * dims.num_heads;
        let head_outputs: Vec<Vec<f32>> = if self.parallel {
            (0..pairs)
                .into_par_iter()
                .map(|p| attention::attend_head(query, key, value, mask, &dims, p))
                .collect()
        } else {
            (0..pairs)
                .map(|p| attention::attend_head(query, key, value, mask, &dims, p))
                .collect()
        };

        Ok(attention::interleave_heads(&head_outputs, &dims))
    }
}

pub(crate) fn softmax_into(chunk: &[f32], out: &mut [f32]) {
    // Subtract the max for numerical stability.
    let max_val = chunk.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for (o, &v) in out.iter_mut().zip(chunk.iter()) {
        *o = (v - max_val).exp();
        sum += *o;
    }
    for o in out.iter_mut() {
        *o /= sum;
    }
}
