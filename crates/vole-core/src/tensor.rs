use crate::error::{Error, Result};
use crate::shape::Shape;

// Tensor — N-dimensional strided array with owned flat storage
//
// The fundamental data type of the framework. A Tensor owns a flat, row-major
// `Vec<f64>` buffer, a shape, and the strides derived from that shape.
//
// DESIGN CONTRACT — no views, no aliasing:
//
// Every transforming operation (transpose, reshape, matmul, add, ...)
// allocates a fresh buffer and returns a new Tensor. Nothing ever aliases
// another tensor's storage. This costs copies but buys a crucial freedom:
// backward passes may mutate any tensor they receive or produce in place
// without worrying about who else can see the buffer.
//
// INDEXING:
//
// flat_index([i0, i1, ...]) = Σ i_k * strides[k], and Shape::unravel is its
// exact inverse. These two functions carry all of the index arithmetic in
// the framework — convolution and attention loops decode flat positions
// through them rather than nesting loops of compile-time depth.

/// N-dimensional tensor of `f64` values with row-major flat storage.
///
/// # Examples
/// ```
/// use vole_core::Tensor;
/// let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3)).unwrap();
/// assert_eq!(t.get(&[1, 2]), 6.0);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f64>,
    shape: Shape,
    strides: Vec<usize>,
}

impl Tensor {
    /// Create a tensor from flat data and a shape.
    ///
    /// Fails with [`Error::ElementCountMismatch`] unless
    /// `shape.elem_count() == data.len()` — a silent size mismatch here
    /// would corrupt every downstream index computation.
    pub fn from_vec(data: Vec<f64>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        let expected = shape.elem_count();
        if expected != data.len() {
            return Err(Error::ElementCountMismatch {
                expected,
                got: data.len(),
                shape,
            });
        }
        let strides = shape.stride_contiguous();
        Ok(Tensor {
            data,
            shape,
            strides,
        })
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let strides = shape.stride_contiguous();
        Tensor {
            data: vec![0.0; shape.elem_count()],
            shape,
            strides,
        }
    }

    /// Create a tensor filled with ones.
    pub fn ones(shape: impl Into<Shape>) -> Self {
        Self::full(shape, 1.0)
    }

    /// Create a tensor filled with a constant value.
    pub fn full(shape: impl Into<Shape>, value: f64) -> Self {
        let shape = shape.into();
        let strides = shape.stride_contiguous();
        Tensor {
            data: vec![value; shape.elem_count()],
            shape,
            strides,
        }
    }

    /// The tensor's shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        self.data.len()
    }

    /// The row-major strides derived from the shape.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Read-only view of the flat storage.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Mutable view of the flat storage. The length is fixed; callers may
    /// rewrite values freely (gradient accumulation relies on this).
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Convert a multi-index into the flat storage offset:
    /// `Σ index[i] * strides[i]`. Inverse of [`Shape::unravel`].
    pub fn flat_index(&self, index: &[usize]) -> usize {
        let mut flat = 0;
        for (i, &idx) in index.iter().enumerate() {
            flat += idx * self.strides[i];
        }
        flat
    }

    /// Read the element at a multi-index.
    pub fn get(&self, index: &[usize]) -> f64 {
        self.data[self.flat_index(index)]
    }

    /// Write the element at a multi-index.
    pub fn set(&mut self, index: &[usize], value: f64) {
        let flat = self.flat_index(index);
        self.data[flat] = value;
    }

    /// Reset every element to zero in place. Gradient accumulators call
    /// this at the start of each backward pass.
    pub fn zero(&mut self) {
        for v in self.data.iter_mut() {
            *v = 0.0;
        }
    }

    /// Return a copy with a new shape. Fails with
    /// [`Error::ReshapeElementMismatch`] unless element counts agree.
    /// The result shares no storage with `self`.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Tensor> {
        let new_shape = new_shape.into();
        if new_shape.elem_count() != self.data.len() {
            return Err(Error::ReshapeElementMismatch {
                src: self.data.len(),
                dst: new_shape.elem_count(),
                dst_shape: new_shape,
            });
        }
        Tensor::from_vec(self.data.clone(), new_shape)
    }

    /// Swap two axes, materializing the permutation into a new buffer.
    ///
    /// Every flat position of the source is unraveled, the two coordinates
    /// are swapped, and the value is written at the corresponding offset of
    /// the destination — an O(n) pass, not a zero-copy view.
    pub fn transpose(&self, a: usize, b: usize) -> Result<Tensor> {
        let rank = self.rank();
        if a >= rank || b >= rank {
            return Err(Error::DimOutOfRange {
                dim: a.max(b),
                rank,
            });
        }
        let mut new_dims = self.dims().to_vec();
        new_dims.swap(a, b);
        let mut out = Tensor::zeros(new_dims);

        for flat in 0..self.data.len() {
            let mut idx = self.shape.unravel(flat);
            idx.swap(a, b);
            let dst = out.flat_index(&idx);
            out.data[dst] = self.data[flat];
        }
        Ok(out)
    }

    /// Elementwise sum. Shapes must match exactly.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.check_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a + b)
            .collect();
        Tensor::from_vec(data, self.shape.clone())
    }

    /// Elementwise difference. Shapes must match exactly.
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.check_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a - b)
            .collect();
        Tensor::from_vec(data, self.shape.clone())
    }

    /// Multiply every element by a scalar.
    pub fn scale(&self, factor: f64) -> Tensor {
        let data = self.data.iter().map(|v| v * factor).collect();
        Tensor {
            data,
            shape: self.shape.clone(),
            strides: self.strides.clone(),
        }
    }

    /// Apply a function to every element.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Tensor {
        let data = self.data.iter().map(|&v| f(v)).collect();
        Tensor {
            data,
            shape: self.shape.clone(),
            strides: self.strides.clone(),
        }
    }

    /// Sum of all elements.
    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    fn check_same_shape(&self, other: &Tensor) -> Result<()> {
        if self.shape != other.shape {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        Ok(())
    }

    // Batched matrix multiply

    /// Batched matrix product over arbitrary equal leading dimensions.
    ///
    /// The last two dimensions of each operand are the matrix dimensions;
    /// everything before them is a batch prefix that must be identical on
    /// both sides. For `A[..., m, k]` and `B[..., k, n]` the result is
    /// `[..., m, n]`.
    ///
    /// Fails with [`Error::MatmulShapeMismatch`] when the inner dimensions
    /// disagree — never silently broadcast or truncated — and with
    /// [`Error::RankMismatch`] / [`Error::ShapeMismatch`] when the ranks or
    /// batch prefixes differ.
    ///
    /// Algorithm: each flat batch index is unraveled into a prefix, one 2-D
    /// slice per operand is extracted at that prefix, multiplied with a
    /// dense triple loop, and written back at the same prefix.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        let a_rank = self.rank();
        let b_rank = other.rank();
        if a_rank < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: a_rank,
            });
        }
        if b_rank != a_rank {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }

        let a_dims = self.dims();
        let b_dims = other.dims();
        let (a_rows, a_cols) = (a_dims[a_rank - 2], a_dims[a_rank - 1]);
        let (b_rows, b_cols) = (b_dims[b_rank - 2], b_dims[b_rank - 1]);

        if a_cols != b_rows {
            return Err(Error::MatmulShapeMismatch {
                m: a_rows,
                k1: a_cols,
                k2: b_rows,
                n: b_cols,
            });
        }
        if a_dims[..a_rank - 2] != b_dims[..b_rank - 2] {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }

        let batch_shape = Shape::new(a_dims[..a_rank - 2].to_vec());
        let batch_size = batch_shape.elem_count();

        let mut out_dims = a_dims[..a_rank - 2].to_vec();
        out_dims.push(a_rows);
        out_dims.push(b_cols);
        let mut out = Tensor::zeros(out_dims);

        for batch in 0..batch_size {
            let prefix = batch_shape.unravel(batch);
            let a2 = self.extract_mat(&prefix, a_rows, a_cols);
            let b2 = other.extract_mat(&prefix, b_rows, b_cols);
            let r2 = matmul_2d(&a2, a_rows, a_cols, &b2, b_cols);
            out.write_mat(&prefix, a_rows, b_cols, &r2);
        }
        Ok(out)
    }

    /// Copy the 2-D slice at a batch prefix into a flat row-major buffer.
    fn extract_mat(&self, prefix: &[usize], rows: usize, cols: usize) -> Vec<f64> {
        let mut base = 0;
        for (i, &p) in prefix.iter().enumerate() {
            base += p * self.strides[i];
        }
        let mut out = vec![0.0; rows * cols];
        let row_stride = self.strides[prefix.len()];
        let col_stride = self.strides[prefix.len() + 1];
        for r in 0..rows {
            for c in 0..cols {
                out[r * cols + c] = self.data[base + r * row_stride + c * col_stride];
            }
        }
        out
    }

    /// Write a flat row-major buffer back as the 2-D slice at a batch prefix.
    fn write_mat(&mut self, prefix: &[usize], rows: usize, cols: usize, src: &[f64]) {
        let mut base = 0;
        for (i, &p) in prefix.iter().enumerate() {
            base += p * self.strides[i];
        }
        let row_stride = self.strides[prefix.len()];
        let col_stride = self.strides[prefix.len() + 1];
        for r in 0..rows {
            for c in 0..cols {
                self.data[base + r * row_stride + c * col_stride] = src[r * cols + c];
            }
        }
    }
}

/// Dense 2-D matrix product on flat row-major buffers:
/// `[rows_a x cols_a] @ [cols_a x cols_b]`.
fn matmul_2d(a: &[f64], rows_a: usize, cols_a: usize, b: &[f64], cols_b: usize) -> Vec<f64> {
    let mut out = vec![0.0; rows_a * cols_b];
    for r in 0..rows_a {
        for k in 0..cols_a {
            let av = a[r * cols_a + k];
            for c in 0..cols_b {
                out[r * cols_b + c] += av * b[k * cols_b + c];
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_validates_count() {
        assert!(Tensor::from_vec(vec![1.0, 2.0, 3.0], (2, 2)).is_err());
        assert!(Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], (2, 2)).is_ok());
    }

    #[test]
    fn test_index_roundtrip() {
        let t = Tensor::zeros((2, 3, 4));
        for p in 0..t.elem_count() {
            let idx = t.shape().unravel(p);
            assert_eq!(t.flat_index(&idx), p);
        }
    }

    #[test]
    fn test_get_set() {
        let mut t = Tensor::zeros((2, 3));
        assert_eq!(t.strides(), &[3, 1]);
        t.set(&[1, 2], 7.5);
        assert_eq!(t.get(&[1, 2]), 7.5);
        assert_eq!(t.data()[5], 7.5);
        assert_eq!(t.sum(), 7.5);
    }

    #[test]
    fn test_reshape() {
        let t = Tensor::from_vec((0..6).map(|i| i as f64).collect(), (2, 3)).unwrap();
        let r = t.reshape((3, 2)).unwrap();
        assert_eq!(r.dims(), &[3, 2]);
        // Row-major order preserved
        assert_eq!(r.data(), t.data());
        assert!(t.reshape((4, 2)).is_err());
    }

    #[test]
    fn test_transpose_2d() {
        // [[0, 1, 2], [3, 4, 5]] → [[0, 3], [1, 4], [2, 5]]
        let t = Tensor::from_vec((0..6).map(|i| i as f64).collect(), (2, 3)).unwrap();
        let tt = t.transpose(0, 1).unwrap();
        assert_eq!(tt.dims(), &[3, 2]);
        assert_eq!(tt.data(), &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        assert!(t.transpose(0, 2).is_err());
    }

    #[test]
    fn test_transpose_is_involution() {
        let t = Tensor::from_vec((0..24).map(|i| i as f64).collect(), (2, 3, 4)).unwrap();
        let back = t.transpose(0, 2).unwrap().transpose(0, 2).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_add_sub_shape_checked() {
        let a = Tensor::ones((2, 2));
        let b = Tensor::ones((2, 2));
        assert_eq!(a.add(&b).unwrap().data(), &[2.0, 2.0, 2.0, 2.0]);
        assert_eq!(a.sub(&b).unwrap().data(), &[0.0, 0.0, 0.0, 0.0]);
        let c = Tensor::ones((4,));
        assert!(a.add(&c).is_err());
    }

    #[test]
    fn test_matmul_2d() {
        // [[1, 2], [3, 4]] @ [[5, 6], [7, 8]] = [[19, 22], [43, 50]]
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], (2, 2)).unwrap();
        let b = Tensor::from_vec(vec![5.0, 6.0, 7.0, 8.0], (2, 2)).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.dims(), &[2, 2]);
        assert_eq!(c.data(), &[19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_result_shape() {
        // A[..., m, k] @ B[..., k, n] → [..., m, n]
        let a = Tensor::zeros((2, 3, 4, 5));
        let b = Tensor::zeros((2, 3, 5, 6));
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.dims(), &[2, 3, 4, 6]);
    }

    #[test]
    fn test_matmul_inner_dim_mismatch_fails() {
        let a = Tensor::zeros((2, 3));
        let b = Tensor::zeros((4, 2));
        match a.matmul(&b) {
            Err(Error::MatmulShapeMismatch { k1: 3, k2: 4, .. }) => {}
            other => panic!("expected MatmulShapeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_matmul_batched_values() {
        // Two independent 2x2 products in one call
        let a = Tensor::from_vec(
            vec![1.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 2.0],
            (2, 2, 2),
        )
        .unwrap();
        let b = Tensor::from_vec(
            vec![1.0, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, 4.0],
            (2, 2, 2),
        )
        .unwrap();
        let c = a.matmul(&b).unwrap();
        // batch 0: identity @ b = b; batch 1: 2*I @ b = 2b
        assert_eq!(c.data(), &[1.0, 2.0, 3.0, 4.0, 2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_matmul_batch_prefix_mismatch_fails() {
        let a = Tensor::zeros((2, 3, 4));
        let b = Tensor::zeros((3, 4, 5));
        assert!(a.matmul(&b).is_err());
    }
}
