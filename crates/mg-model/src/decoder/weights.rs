use rand::Rng;

use mg_tensor::{Activation, ComputeBackend, Shape, Tensor};

use crate::error::{ModelError, Result};

/// Fully connected layer: `y = activation(x @ kernel + bias)`.
///
/// `kernel` is stored `[in_dim, out_dim]` so inputs multiply from the left.
#[derive(Debug, Clone)]
pub struct Dense {
    pub kernel: Tensor,
    pub bias: Vec<f32>,
    pub activation: Activation,
}

impl Dense {
    pub fn new(kernel: Tensor, bias: Vec<f32>) -> Result<Self> {
        let dims = kernel.shape().dims();
        if dims.len() != 2 || dims[1] != bias.len() {
            return Err(ModelError::InvalidConfig(format!(
                "dense kernel {:?} does not match bias of length {}",
                dims,
                bias.len()
            )));
        }
        Ok(Dense {
            kernel,
            bias,
            activation: Activation::Linear,
        })
    }

    /// Glorot-uniform kernel, zero bias.
    pub fn glorot<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (in_dim + out_dim) as f32).sqrt();
        Dense {
            kernel: Tensor::from_fn(Shape::new(vec![in_dim, out_dim]), |_| {
                rng.gen_range(-limit..limit)
            }),
            bias: vec![0.0; out_dim],
            activation: Activation::Linear,
        }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn in_dim(&self) -> usize {
        self.kernel.shape().dim(0)
    }

    pub fn out_dim(&self) -> usize {
        self.kernel.shape().dim(1)
    }

    /// Apply the layer to the last axis of `x`: `[..., in_dim] -> [..., out_dim]`.
    pub fn forward(&self, x: &Tensor, backend: &dyn ComputeBackend) -> Result<Tensor> {
        let dims = x.shape().dims();
        let in_dim = self.in_dim();
        if dims.last() != Some(&in_dim) {
            return Err(ModelError::TensorError(mg_tensor::TensorError::ShapeMismatch {
                expected: vec![in_dim],
                got: dims.to_vec(),
            }));
        }
        let rows = x.shape().numel() / in_dim;
        let projected = backend.matmul(x.data(), self.kernel.data(), rows, in_dim, self.out_dim())?;
        let biased = backend.bias_add(&projected, &self.bias)?;
        let activated = match self.activation {
            Activation::Linear => biased,
            other => backend.activation(&biased, other)?,
        };

        let mut out_dims = dims.to_vec();
        if let Some(last) = out_dims.last_mut() {
            *last = self.out_dim();
        }
        Ok(Tensor::try_new(activated, Shape::new(out_dims))?)
    }
}

/// Layer normalization over the last axis.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub gamma: Vec<f32>,
    pub beta: Vec<f32>,
    pub epsilon: f32,
}

impl LayerNorm {
    /// Unit scale, zero shift.
    pub fn new(dim: usize, epsilon: f32) -> Self {
        LayerNorm {
            gamma: vec![1.0; dim],
            beta: vec![0.0; dim],
            epsilon,
        }
    }

    pub fn forward(&self, x: &Tensor, backend: &dyn ComputeBackend) -> Result<Tensor> {
        let data = backend.layer_norm(x.data(), &self.gamma, &self.beta, self.epsilon, self.gamma.len())?;
        Ok(Tensor::try_new(data, x.shape().clone())?)
    }
}

/// Lookup table, `[rows, dim]`.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub table: Tensor,
}

impl Embedding {
    pub fn new(table: Tensor) -> Result<Self> {
        if table.shape().ndim() != 2 {
            return Err(ModelError::InvalidConfig(format!(
                "embedding table must be 2D, got {}",
                table.shape()
            )));
        }
        Ok(Embedding { table })
    }

    /// Uniform(-0.05, 0.05) initialisation.
    pub fn uniform<R: Rng + ?Sized>(rows: usize, dim: usize, rng: &mut R) -> Self {
        Embedding {
            table: Tensor::from_fn(Shape::new(vec![rows, dim]), |_| rng.gen_range(-0.05..0.05)),
        }
    }

    pub fn rows(&self) -> usize {
        self.table.shape().dim(0)
    }

    pub fn dim(&self) -> usize {
        self.table.shape().dim(1)
    }

    pub fn row(&self, i: usize) -> Option<&[f32]> {
        let dim = self.dim();
        (i < self.rows()).then(|| &self.table.data()[i * dim..(i + 1) * dim])
    }
}
