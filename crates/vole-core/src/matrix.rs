use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

// Matrix — the simplified two-dimensional tensor form
//
// A plain row-major matrix of rows. Some callers only ever work with 2-D
// data and do not need strides or batch dimensions; Matrix is the cheap
// representation for them, and the Tensor↔Matrix conversions below are the
// boundary between the two worlds.
//
// The conversions preserve total element count and row-major ordering in
// both directions, and fail explicitly on any mismatch — a Matrix is never
// a truncated or padded view of a Tensor.

/// Row-major 2-D matrix of `f64` values.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Create a matrix from flat row-major data.
    pub fn from_vec(data: Vec<f64>, rows: usize, cols: usize) -> Result<Self> {
        if rows * cols != data.len() {
            return Err(Error::ElementCountMismatch {
                expected: rows * cols,
                got: data.len(),
                shape: Shape::from((rows, cols)),
            });
        }
        Ok(Matrix { rows, cols, data })
    }

    /// Create a zero-filled matrix.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Matrix {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Read-only view of the flat row-major storage.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    pub fn set(&mut self, r: usize, c: usize, value: f64) {
        self.data[r * self.cols + c] = value;
    }

    /// Dense matrix product. Fails with [`Error::MatmulShapeMismatch`] when
    /// the inner dimensions disagree.
    pub fn matmul(&self, other: &Matrix) -> Result<Matrix> {
        if self.cols != other.rows {
            return Err(Error::MatmulShapeMismatch {
                m: self.rows,
                k1: self.cols,
                k2: other.rows,
                n: other.cols,
            });
        }
        let mut out = Matrix::zeros(self.rows, other.cols);
        for r in 0..self.rows {
            for k in 0..self.cols {
                let av = self.data[r * self.cols + k];
                for c in 0..other.cols {
                    out.data[r * other.cols + c] += av * other.data[k * other.cols + c];
                }
            }
        }
        Ok(out)
    }

    /// Elementwise sum. Dimensions must match exactly.
    pub fn add(&self, other: &Matrix) -> Result<Matrix> {
        self.check_same_dims(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a + b)
            .collect();
        Ok(Matrix {
            rows: self.rows,
            cols: self.cols,
            data,
        })
    }

    /// Elementwise difference. Dimensions must match exactly.
    pub fn sub(&self, other: &Matrix) -> Result<Matrix> {
        self.check_same_dims(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a - b)
            .collect();
        Ok(Matrix {
            rows: self.rows,
            cols: self.cols,
            data,
        })
    }

    /// Transposed copy.
    pub fn transpose(&self) -> Matrix {
        let mut out = Matrix::zeros(self.cols, self.rows);
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        out
    }

    /// Apply a function to every element.
    pub fn apply(&self, f: impl Fn(f64) -> f64) -> Matrix {
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Sum of all elements.
    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    fn check_same_dims(&self, other: &Matrix) -> Result<()> {
        if self.rows != other.rows || self.cols != other.cols {
            return Err(Error::ShapeMismatch {
                expected: Shape::from((self.rows, self.cols)),
                got: Shape::from((other.rows, other.cols)),
            });
        }
        Ok(())
    }

    // Conversion boundary with the N-D Tensor representation

    /// Convert an N-D tensor into the simplified 2-D form.
    ///
    /// - rank 0 is rejected (`RankMismatch`)
    /// - rank 1 `[n]` becomes a single row `1 × n`
    /// - rank ≥ 2 keeps the last dimension as columns and flattens every
    ///   leading dimension into rows
    ///
    /// The flat row-major data is copied unchanged, so the round trip back
    /// through [`Matrix::to_tensor`] reproduces it exactly.
    pub fn from_tensor(t: &Tensor) -> Result<Matrix> {
        let rank = t.rank();
        if rank == 0 {
            return Err(Error::RankMismatch {
                expected: 1,
                got: 0,
            });
        }
        let dims = t.dims();
        let cols = dims[rank - 1];
        let rows: usize = dims[..rank - 1].iter().product::<usize>().max(1);
        Matrix::from_vec(t.data().to_vec(), rows, cols)
    }

    /// Convert the matrix back into an N-D tensor with the given shape.
    /// Fails on element-count mismatch or an empty shape.
    pub fn to_tensor(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        if shape.rank() == 0 {
            return Err(Error::RankMismatch {
                expected: 1,
                got: 0,
            });
        }
        Tensor::from_vec(self.data.clone(), shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul() {
        let a = Matrix::from_vec(vec![1.0, 2.0, 3.0, 4.0], 2, 2).unwrap();
        let b = Matrix::from_vec(vec![5.0, 6.0, 7.0, 8.0], 2, 2).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.data(), &[19.0, 22.0, 43.0, 50.0]);

        let bad = Matrix::zeros(3, 2);
        assert!(a.matmul(&bad).is_err());
    }

    #[test]
    fn test_elementwise_and_apply() {
        let mut a = Matrix::zeros(2, 2);
        a.set(0, 0, 1.0);
        a.set(1, 1, 2.0);
        assert_eq!(a.get(1, 1), 2.0);

        let b = a.apply(|v| v * 10.0);
        assert_eq!(b.sum(), 30.0);

        let c = a.add(&b).unwrap();
        assert_eq!(c.get(0, 0), 11.0);
        let d = c.sub(&a).unwrap();
        assert_eq!(d.data(), b.data());

        assert!(a.add(&Matrix::zeros(3, 2)).is_err());
    }

    #[test]
    fn test_transpose() {
        let m = Matrix::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3).unwrap();
        let t = m.transpose();
        assert_eq!(t.rows(), 3);
        assert_eq!(t.cols(), 2);
        assert_eq!(t.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_roundtrip_rank1() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0], (3,)).unwrap();
        let m = Matrix::from_tensor(&t).unwrap();
        assert_eq!((m.rows(), m.cols()), (1, 3));
        let back = m.to_tensor((3,)).unwrap();
        assert_eq!(back.data(), t.data());
    }

    #[test]
    fn test_roundtrip_rank2() {
        let t = Tensor::from_vec((0..6).map(|i| i as f64).collect(), (2, 3)).unwrap();
        let m = Matrix::from_tensor(&t).unwrap();
        assert_eq!((m.rows(), m.cols()), (2, 3));
        assert_eq!(m.to_tensor((2, 3)).unwrap().data(), t.data());
    }

    #[test]
    fn test_roundtrip_rank4() {
        let t = Tensor::from_vec((0..24).map(|i| i as f64).collect(), (2, 1, 3, 4)).unwrap();
        let m = Matrix::from_tensor(&t).unwrap();
        // Leading dims flattened into rows, last dim kept as columns
        assert_eq!((m.rows(), m.cols()), (6, 4));
        assert_eq!(m.to_tensor((2, 1, 3, 4)).unwrap().data(), t.data());
    }

    #[test]
    fn test_to_tensor_size_mismatch_fails() {
        let m = Matrix::zeros(2, 3);
        assert!(m.to_tensor((4, 2)).is_err());
    }
}
