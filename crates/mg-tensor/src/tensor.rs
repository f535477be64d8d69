use crate::backend::ComputeBackend;
use crate::error::{Result, TensorError};
use crate::shape::Shape;

/// A dense, row-major f32 tensor.
///
/// Operations that require real computation are dispatched to a
/// `ComputeBackend`; layout operations (select, stack, reshape) are done here.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Shape,
}

impl Tensor {
    /// Create a new tensor from f32 data and a shape.
    ///
    /// # Panics
    /// Panics if `data.len() != shape.numel()`.
    pub fn new(data: Vec<f32>, shape: Shape) -> Self {
        assert_eq!(
            data.len(),
            shape.numel(),
            "data length {} does not match shape {:?} (numel={})",
            data.len(),
            shape,
            shape.numel()
        );
        Tensor { data, shape }
    }

    /// Fallible variant of [`Tensor::new`] for data that comes from callers.
    pub fn try_new(data: Vec<f32>, shape: Shape) -> Result<Self> {
        if data.len() != shape.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: shape.dims().to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Tensor { data, shape })
    }

    /// Create a zero-filled tensor with the given shape.
    pub fn zeros(shape: Shape) -> Self {
        let n = shape.numel();
        Tensor {
            data: vec![0.0; n],
            shape,
        }
    }

    /// Create a tensor whose element at flat offset `i` is `f(i)`.
    pub fn from_fn(shape: Shape, f: impl FnMut(usize) -> f32) -> Self {
        let data = (0..shape.numel()).map(f).collect();
        Tensor { data, shape }
    }

    /// Returns a reference to the tensor's shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the underlying data as an f32 slice.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Returns the underlying data as a mutable f32 slice.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consumes the tensor and returns its data buffer.
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Reshape the tensor, returning a new tensor with the same data but
    /// a different shape.
    ///
    /// The total number of elements must remain the same.
    pub fn reshape(self, new_shape: Shape) -> Result<Tensor> {
        if self.shape.numel() != new_shape.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.dims().to_vec(),
                got: new_shape.dims().to_vec(),
            });
        }
        Ok(Tensor {
            data: self.data,
            shape: new_shape,
        })
    }

    /// Flat offset of a multi-dimensional index.
    pub fn offset(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.shape.ndim() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.dims().to_vec(),
                got: index.to_vec(),
            });
        }
        let strides = self.shape.strides();
        let mut offset = 0;
        for (axis, (&i, &stride)) in index.iter().zip(strides.iter()).enumerate() {
            let size = self.shape.dim(axis);
            if i >= size {
                return Err(TensorError::IndexOutOfRange { index: i, size });
            }
            offset += i * stride;
        }
        Ok(offset)
    }

    /// Read the element at a multi-dimensional index.
    pub fn get(&self, index: &[usize]) -> Result<f32> {
        Ok(self.data[self.offset(index)?])
    }

    /// Write the element at a multi-dimensional index.
    pub fn set(&mut self, index: &[usize], value: f32) -> Result<()> {
        let offset = self.offset(index)?;
        self.data[offset] = value;
        Ok(())
    }

    /// Returns the sub-tensor at `index` along `axis`, with that axis removed.
    ///
    /// For a cache of shape `[batch, layers, ...]`, `select(1, i)` yields the
    /// per-layer slice `[batch, ...]`.
    pub fn select(&self, axis: usize, index: usize) -> Result<Tensor> {
        let ndim = self.shape.ndim();
        if axis >= ndim {
            return Err(TensorError::InvalidAxis { axis, ndim });
        }
        let (outer, size, inner) = self.shape.split_at_axis(axis);
        if index >= size {
            return Err(TensorError::IndexOutOfRange { index, size });
        }

        let mut data = Vec::with_capacity(outer * inner);
        for o in 0..outer {
            let start = (o * size + index) * inner;
            data.extend_from_slice(&self.data[start..start + inner]);
        }
        Ok(Tensor {
            data,
            shape: self.shape.without_axis(axis),
        })
    }

    /// Stacks equally shaped tensors along a new axis inserted at `axis`.
    ///
    /// This is the inverse of [`Tensor::select`]:
    /// `stack(&[t.select(a, 0), t.select(a, 1), ...], a) == t`.
    pub fn stack(tensors: &[Tensor], axis: usize) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| TensorError::Other("stack requires at least one tensor".to_string()))?;
        let base = first.shape();
        if axis > base.ndim() {
            return Err(TensorError::InvalidAxis {
                axis,
                ndim: base.ndim() + 1,
            });
        }
        for t in tensors {
            if t.shape() != base {
                return Err(TensorError::ShapeMismatch {
                    expected: base.dims().to_vec(),
                    got: t.shape().dims().to_vec(),
                });
            }
        }

        let shape = base.with_axis(axis, tensors.len());
        let (outer, _, inner) = shape.split_at_axis(axis);
        let mut data = Vec::with_capacity(shape.numel());
        for o in 0..outer {
            for t in tensors {
                let start = o * inner;
                data.extend_from_slice(&t.data[start..start + inner]);
            }
        }
        Ok(Tensor { data, shape })
    }

    /// Matrix multiplication of two 2D tensors using the given backend.
    ///
    /// self is [m, k], other is [k, n], result is [m, n].
    pub fn matmul(&self, other: &Tensor, backend: &dyn ComputeBackend) -> Result<Tensor> {
        if self.shape.ndim() != 2 || other.shape.ndim() != 2 {
            return Err(TensorError::Other(
                "matmul requires 2D tensors".to_string(),
            ));
        }

        let m = self.shape.dim(0);
        let k = self.shape.dim(1);
        let k2 = other.shape.dim(0);
        let n = other.shape.dim(1);

        if k != k2 {
            return Err(TensorError::MatmulMismatch { m, k, k2, n });
        }

        let result_data = backend.matmul(&self.data, &other.data, m, k, n)?;
        Ok(Tensor::new(result_data, Shape::new(vec![m, n])))
    }
}
