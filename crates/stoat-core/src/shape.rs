use std::fmt;

use crate::error::{Error, Result};

// Shape — N-dimensional shape representation
//
// A Shape describes the extent of each axis of an array:
//   - Scalar: Shape([])          — 0 axes, 1 element
//   - Vector: Shape([5])         — 1 axis, 5 elements
//   - Matrix: Shape([3, 4])      — 2 axes, 12 elements
//   - Batch:  Shape([2, 3, 4])   — 3 axes, 24 elements
//
// The shape determines:
//   1. The total element count (product of all extents)
//   2. The row-major strides used to address the flat buffer
//   3. Whether two arrays are compatible for an operation (broadcasting)
//
// Shapes are immutable value objects; equality is structural.

/// N-dimensional shape of an array.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of axis extents.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The scalar shape (0 axes, 1 element).
    pub fn scalar() -> Self {
        Shape(vec![])
    }

    /// The axis extents as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of axes (0 for scalar, 1 for vector, 2 for matrix, ...).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all extents).
    /// A scalar shape [] has 1 element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Extent of a specific axis.
    pub fn dim(&self, axis: usize) -> Result<usize> {
        self.0.get(axis).copied().ok_or(Error::AxisOutOfRange {
            axis,
            rank: self.rank(),
        })
    }

    /// Validate that `axis` addresses an existing axis.
    pub fn check_axis(&self, axis: usize) -> Result<()> {
        if axis >= self.rank() {
            return Err(Error::AxisOutOfRange {
                axis,
                rank: self.rank(),
            });
        }
        Ok(())
    }

    /// Compute the contiguous (row-major / C-order) strides for this shape.
    ///
    /// For shape [2, 3, 4], strides are [12, 4, 1]: moving one step along
    /// axis 0 jumps 12 elements (3*4), axis 1 jumps 4, axis 2 jumps 1.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    // Broadcasting

    /// Compute the broadcast output shape from two input shapes.
    ///
    /// NumPy-style rules:
    ///   1. Align shapes from the right (trailing axes).
    ///   2. An axis pair is compatible if the extents are equal or one is 1.
    ///   3. Missing leading axes are treated as 1.
    ///
    /// Examples:
    ///   [3, 4] and [4]       → [3, 4]
    ///   [2, 1] and [1, 3]    → [2, 3]
    ///   [5, 3, 1] and [3, 4] → [5, 3, 4]
    ///   [3] and [4]          → Error (3 ≠ 4 and neither is 1)
    pub fn broadcast(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            // Index from the right; axes past the shorter rank count as 1.
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };

            if ld == rd {
                result.push(ld);
            } else if ld == 1 {
                result.push(rd);
            } else if rd == 1 {
                result.push(ld);
            } else {
                return Err(Error::BroadcastMismatch {
                    lhs: lhs.clone(),
                    rhs: rhs.clone(),
                });
            }
        }

        result.reverse();
        Ok(Shape::new(result))
    }

    /// Return the strides this shape takes on when broadcast to `target`.
    ///
    /// For each axis where the source extent is 1 and the target extent is
    /// larger, the stride is 0 (the single element repeats). Missing leading
    /// axes also get stride 0. `target` must already be a valid broadcast
    /// of `self`.
    pub fn broadcast_strides(&self, target: &Shape) -> Vec<usize> {
        let self_dims = self.dims();
        let target_dims = target.dims();
        let self_strides = self.strides();

        let mut result = vec![0usize; target_dims.len()];
        let offset = target_dims.len() - self_dims.len();

        for i in 0..self_dims.len() {
            if self_dims[i] == target_dims[i + offset] {
                result[i + offset] = self_strides[i];
            } else {
                // self_dims[i] is 1 here → stride 0 repeats the element
                result[i + offset] = 0;
            }
        }
        result
    }

    /// Whether `target` is reachable from this shape by summing over
    /// broadcast-expanded axes — i.e. whether `target` broadcasts to `self`.
    ///
    /// This is the validity rule for `sum_to`, the gradient-side inverse of
    /// `broadcast_to`.
    pub fn check_sum_to(&self, target: &Shape) -> Result<()> {
        match Shape::broadcast(self, target) {
            Ok(ref b) if b == self => Ok(()),
            _ => Err(Error::SumToMismatch {
                src: self.clone(),
                target: target.clone(),
            }),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// Convenient From implementations.
// These let you write Shape::from((3, 4)) instead of Shape::new(vec![3, 4]).

impl From<()> for Shape {
    /// Scalar shape (0 axes).
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    /// 1-D shape.
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize,)> for Shape {
    fn from((d0,): (usize,)) -> Self {
        Shape(vec![d0])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}
