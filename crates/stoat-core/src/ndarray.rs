use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::thread_rng;
use rand_distr::{Distribution, StandardNormal};

use crate::bail;
use crate::error::{Error, Result};
use crate::shape::Shape;

// NdArray — The fundamental data structure
//
// An NdArray is a dense n-dimensional array of f64 values: a flat row-major
// buffer addressed through a Shape. All kernels live here; the autograd
// layer (Variable/Op) is a thin recording wrapper around these methods.
//
// MEMORY MODEL:
//
//   The buffer is wrapped in Arc<RwLock<Vec<f64>>>. Cloning an NdArray is
//   cheap (one refcount increment) and the clone SHARES the buffer with the
//   original. `reshape` also shares: it returns a new handle with a new
//   shape over the same buffer, so an element written through one view is
//   visible through every other. This aliasing is a documented contract:
//   once a value has been consumed by the graph, callers must not mutate it
//   in place unless they are certain no aliasing view survives.
//
//   Every buffer is contiguous with offset 0. Operations that cannot be
//   expressed that way (transpose, permute, narrow, broadcast_to) return a
//   freshly allocated buffer, which is what keeps reshape a pure view.

/// Dense n-dimensional array of `f64` values.
///
/// Cloning is cheap and shares the underlying buffer; see the module notes
/// for the aliasing contract.
pub struct NdArray {
    buffer: Arc<RwLock<Vec<f64>>>,
    shape: Shape,
}

impl Clone for NdArray {
    fn clone(&self) -> Self {
        NdArray {
            buffer: Arc::clone(&self.buffer),
            shape: self.shape.clone(),
        }
    }
}

impl std::fmt::Debug for NdArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NdArray(shape={})", self.shape)
    }
}

impl NdArray {
    // Constructors

    /// Build an array from an owned buffer without copying.
    /// The caller guarantees `buffer.len() == shape.elem_count()`.
    pub(crate) fn from_buffer(buffer: Vec<f64>, shape: Shape) -> Self {
        debug_assert_eq!(buffer.len(), shape.elem_count());
        NdArray {
            buffer: Arc::new(RwLock::new(buffer)),
            shape,
        }
    }

    /// Create an array from a flat slice and a shape.
    pub fn of(data: &[f64], shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        Ok(Self::from_buffer(data.to_vec(), shape))
    }

    /// Create a scalar (rank-0) array.
    pub fn scalar(value: f64) -> Self {
        Self::from_buffer(vec![value], Shape::scalar())
    }

    /// Create an array filled with zeros.
    pub fn zeros(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let n = shape.elem_count();
        Self::from_buffer(vec![0.0; n], shape)
    }

    /// Create an array filled with ones.
    pub fn ones(shape: impl Into<Shape>) -> Self {
        Self::full(shape, 1.0)
    }

    /// Create an array filled with a constant value.
    pub fn full(shape: impl Into<Shape>, value: f64) -> Self {
        let shape = shape.into();
        let n = shape.elem_count();
        Self::from_buffer(vec![value; n], shape)
    }

    /// Create an array of zeros with the same shape as `other`.
    pub fn zeros_like(other: &Self) -> Self {
        Self::zeros(other.shape().clone())
    }

    /// Create an array of ones with the same shape as `other`.
    pub fn ones_like(other: &Self) -> Self {
        Self::ones(other.shape().clone())
    }

    /// Create a 1-D array with values [0, 1, ..., n-1].
    pub fn arange(n: usize) -> Self {
        let data: Vec<f64> = (0..n).map(|i| i as f64).collect();
        Self::from_buffer(data, Shape::from(n))
    }

    /// Create a 1-D array with `steps` evenly spaced values from `start`
    /// to `end` (inclusive).
    pub fn linspace(start: f64, end: f64, steps: usize) -> Result<Self> {
        if steps == 0 {
            bail!("linspace requires steps >= 1");
        }
        if steps == 1 {
            return Ok(Self::from_buffer(vec![start], Shape::from(1usize)));
        }
        let step = (end - start) / (steps as f64 - 1.0);
        let data: Vec<f64> = (0..steps).map(|i| start + step * i as f64).collect();
        Ok(Self::from_buffer(data, Shape::from(steps)))
    }

    /// Create an identity matrix of size `n × n`.
    pub fn eye(n: usize) -> Self {
        let mut data = vec![0.0f64; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        Self::from_buffer(data, Shape::from((n, n)))
    }

    /// Create an array of samples from the standard normal distribution.
    pub fn random_normal(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let mut rng = thread_rng();
        let data: Vec<f64> = (0..shape.elem_count())
            .map(|_| StandardNormal.sample(&mut rng))
            .collect();
        Self::from_buffer(data, shape)
    }

    // Accessors

    /// The shape of this array.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// The axis extents as a slice.
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    /// Number of axes.
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Whether this array and `other` share the same underlying buffer.
    pub fn shares_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    fn data(&self) -> RwLockReadGuard<'_, Vec<f64>> {
        self.buffer.read().expect("buffer lock poisoned")
    }

    fn data_mut(&self) -> RwLockWriteGuard<'_, Vec<f64>> {
        self.buffer.write().expect("buffer lock poisoned")
    }

    /// Copy all elements into a flat Vec in row-major order.
    pub fn to_vec(&self) -> Vec<f64> {
        self.data().clone()
    }

    /// Extract the single element of a one-element array.
    pub fn to_scalar(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            bail!("not a scalar: array has shape {}", self.shape);
        }
        Ok(self.data()[0])
    }

    fn flat_index(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.rank() {
            return Err(Error::IndexOutOfBounds {
                index: index.to_vec(),
                shape: self.shape.clone(),
            });
        }
        let dims = self.dims();
        for (i, &idx) in index.iter().enumerate() {
            if idx >= dims[i] {
                return Err(Error::IndexOutOfBounds {
                    index: index.to_vec(),
                    shape: self.shape.clone(),
                });
            }
        }
        let strides = self.shape.strides();
        Ok(index.iter().zip(strides.iter()).map(|(&i, &s)| i * s).sum())
    }

    /// Read a single element by multi-dimensional index.
    pub fn get(&self, index: &[usize]) -> Result<f64> {
        let flat = self.flat_index(index)?;
        Ok(self.data()[flat])
    }

    /// Write a single element by multi-dimensional index.
    ///
    /// The write goes through the shared buffer, so it is visible through
    /// every view that aliases it (see the module notes).
    pub fn set(&self, index: &[usize], value: f64) -> Result<()> {
        let flat = self.flat_index(index)?;
        self.data_mut()[flat] = value;
        Ok(())
    }

    // Elementwise operations (with broadcasting)

    /// Apply a binary closure over both operands broadcast to a common shape.
    fn broadcast_zip(&self, rhs: &Self, f: impl Fn(f64, f64) -> f64) -> Result<Self> {
        let out_shape = Shape::broadcast(self.shape(), rhs.shape())?;
        let ls = self.shape.broadcast_strides(&out_shape);
        let rs = rhs.shape.broadcast_strides(&out_shape);
        let l = self.data();
        let r = rhs.data();

        let dims = out_shape.dims().to_vec();
        let total = out_shape.elem_count();
        let mut out = Vec::with_capacity(total);
        let mut idx = vec![0usize; dims.len()];
        for _ in 0..total {
            let li: usize = idx.iter().zip(ls.iter()).map(|(&i, &s)| i * s).sum();
            let ri: usize = idx.iter().zip(rs.iter()).map(|(&i, &s)| i * s).sum();
            out.push(f(l[li], r[ri]));
            advance_index(&mut idx, &dims);
        }
        drop(l);
        drop(r);
        Ok(Self::from_buffer(out, out_shape))
    }

    /// Element-wise addition with broadcasting.
    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.broadcast_zip(rhs, |a, b| a + b)
    }

    /// Element-wise subtraction with broadcasting.
    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.broadcast_zip(rhs, |a, b| a - b)
    }

    /// Element-wise multiplication with broadcasting.
    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.broadcast_zip(rhs, |a, b| a * b)
    }

    /// Element-wise division with broadcasting.
    ///
    /// Fails with an arithmetic error if any used denominator element is
    /// exactly zero.
    pub fn div(&self, rhs: &Self) -> Result<Self> {
        {
            let r = rhs.data();
            if r.iter().any(|&v| v == 0.0) {
                return Err(Error::DivisionByZero);
            }
        }
        self.broadcast_zip(rhs, |a, b| a / b)
    }

    /// Apply a unary closure to every element.
    pub(crate) fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        let data: Vec<f64> = self.data().iter().map(|&v| f(v)).collect();
        Self::from_buffer(data, self.shape.clone())
    }

    /// Element-wise negation.
    pub fn neg(&self) -> Self {
        self.map(|v| -v)
    }

    /// Affine transform: `result[i] = self[i] * mul + add`.
    pub fn affine(&self, mul: f64, add: f64) -> Self {
        self.map(|v| v * mul + add)
    }

    /// Element-wise exponential.
    pub fn exp(&self) -> Self {
        self.map(f64::exp)
    }

    /// Element-wise natural logarithm.
    pub fn log(&self) -> Self {
        self.map(f64::ln)
    }

    /// Element-wise hyperbolic tangent.
    pub fn tanh(&self) -> Self {
        self.map(f64::tanh)
    }

    /// Element-wise power with a scalar exponent.
    pub fn powf(&self, exponent: f64) -> Self {
        self.map(|v| v.powf(exponent))
    }

    /// Element-wise square root.
    pub fn sqrt(&self) -> Self {
        self.map(f64::sqrt)
    }

    /// Element-wise sine.
    pub fn sin(&self) -> Self {
        self.map(f64::sin)
    }

    /// Element-wise cosine.
    pub fn cos(&self) -> Self {
        self.map(f64::cos)
    }

    /// Rectified linear unit: `max(0, x)`.
    pub fn relu(&self) -> Self {
        self.map(|v| v.max(0.0))
    }

    /// Logistic sigmoid: `1 / (1 + e^(-x))`.
    pub fn sigmoid(&self) -> Self {
        self.map(|v| 1.0 / (1.0 + (-v).exp()))
    }

    /// Element-wise clamp to `[min, max]`.
    pub fn clamp(&self, min: f64, max: f64) -> Self {
        self.map(|v| v.clamp(min, max))
    }

    // Reductions

    /// Output shape after reducing `axis` (the axis is dropped; a global
    /// reduction yields the scalar shape).
    fn reduced_shape(&self, axis: Option<usize>) -> Shape {
        match axis {
            None => Shape::scalar(),
            Some(a) => {
                let mut dims = self.dims().to_vec();
                dims.remove(a);
                Shape::new(dims)
            }
        }
    }

    /// Reduce along `axis` by folding every lane with `f`, starting from
    /// `init`. `axis = None` reduces all elements to a scalar.
    fn reduce(&self, axis: Option<usize>, init: f64, f: impl Fn(f64, f64) -> f64) -> Result<Self> {
        if self.elem_count() == 0 {
            bail!("reduction over an empty array");
        }
        let data = self.data();
        match axis {
            None => {
                let acc = data.iter().fold(init, |a, &v| f(a, v));
                drop(data);
                Ok(Self::scalar(acc))
            }
            Some(a) => {
                self.shape.check_axis(a)?;
                let dims = self.dims();
                let n = dims[a];
                let outer: usize = dims[..a].iter().product();
                let inner: usize = dims[a + 1..].iter().product();
                let mut out = vec![init; outer * inner];
                for o in 0..outer {
                    for d in 0..n {
                        let row = (o * n + d) * inner;
                        for i in 0..inner {
                            let slot = o * inner + i;
                            out[slot] = f(out[slot], data[row + i]);
                        }
                    }
                }
                drop(data);
                Ok(Self::from_buffer(out, self.reduced_shape(axis)))
            }
        }
    }

    /// Sum along `axis`, or over all elements when `axis` is `None`.
    pub fn sum(&self, axis: Option<usize>) -> Result<Self> {
        self.reduce(axis, 0.0, |a, v| a + v)
    }

    /// Arithmetic mean along `axis`, or over all elements.
    pub fn mean(&self, axis: Option<usize>) -> Result<Self> {
        let n = match axis {
            None => self.elem_count(),
            Some(a) => self.shape.dim(a)?,
        };
        Ok(self.sum(axis)?.affine(1.0 / n as f64, 0.0))
    }

    /// Population variance along `axis` (divide by N, not N−1), or over all
    /// elements.
    pub fn var(&self, axis: Option<usize>) -> Result<Self> {
        let mu = self.mean(axis)?;
        let mu_full = match axis {
            None => mu.broadcast_to(self.shape())?,
            Some(a) => {
                let mut dims = self.dims().to_vec();
                dims[a] = 1;
                mu.reshape(Shape::new(dims))?.broadcast_to(self.shape())?
            }
        };
        let centered = self.sub(&mu_full)?;
        centered.mul(&centered)?.mean(axis)
    }

    /// Maximum along `axis`, or over all elements.
    pub fn max(&self, axis: Option<usize>) -> Result<Self> {
        self.reduce(axis, f64::NEG_INFINITY, f64::max)
    }

    /// Minimum along `axis`, or over all elements.
    pub fn min(&self, axis: Option<usize>) -> Result<Self> {
        self.reduce(axis, f64::INFINITY, f64::min)
    }

    // Matrix multiplication

    /// Batched matrix product.
    ///
    /// Both operands must have rank ≥ 2. The trailing two axes are the
    /// matrix dims; all leading axes are the batch and broadcast against
    /// each other with the equal-or-1 rule:
    ///
    ///   [m, k] @ [k, n]          → [m, n]
    ///   [b, m, k] @ [b, k, n]    → [b, m, n]
    ///   [2, 1, m, k] @ [3, k, n] → [2, 3, m, n]
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        if self.rank() < 2 || rhs.rank() < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank().min(rhs.rank()),
            });
        }
        let ld = self.dims();
        let rd = rhs.dims();
        let m = ld[ld.len() - 2];
        let k1 = ld[ld.len() - 1];
        let k2 = rd[rd.len() - 2];
        let n = rd[rd.len() - 1];
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }

        let lhs_batch = Shape::new(ld[..ld.len() - 2].to_vec());
        let rhs_batch = Shape::new(rd[..rd.len() - 2].to_vec());
        let batch = Shape::broadcast(&lhs_batch, &rhs_batch)?;

        // Per-batch-cell element offsets: broadcast strides counted in
        // whole matrices, scaled up to element units.
        let ls: Vec<usize> = lhs_batch
            .broadcast_strides(&batch)
            .into_iter()
            .map(|s| s * m * k1)
            .collect();
        let rs: Vec<usize> = rhs_batch
            .broadcast_strides(&batch)
            .into_iter()
            .map(|s| s * k1 * n)
            .collect();

        let batch_dims = batch.dims().to_vec();
        let batch_count = batch.elem_count();
        let mut out_dims = batch_dims.clone();
        out_dims.push(m);
        out_dims.push(n);
        let out_shape = Shape::new(out_dims);

        let l = self.data();
        let r = rhs.data();
        let mut out = vec![0.0f64; out_shape.elem_count()];
        let mut idx = vec![0usize; batch_dims.len()];
        for cell in 0..batch_count {
            let lo: usize = idx.iter().zip(ls.iter()).map(|(&i, &s)| i * s).sum();
            let ro: usize = idx.iter().zip(rs.iter()).map(|(&i, &s)| i * s).sum();
            gemm(
                &l[lo..lo + m * k1],
                &r[ro..ro + k1 * n],
                &mut out[cell * m * n..(cell + 1) * m * n],
                m,
                n,
                k1,
            );
            advance_index(&mut idx, &batch_dims);
        }
        drop(l);
        drop(r);
        Ok(Self::from_buffer(out, out_shape))
    }

    // Layout operations

    /// Reshape to a new shape with the same element count.
    ///
    /// This is a view: the returned array SHARES this array's buffer, and
    /// writes through either handle are visible through both.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: shape.elem_count(),
                dst_shape: shape,
            });
        }
        Ok(NdArray {
            buffer: Arc::clone(&self.buffer),
            shape,
        })
    }

    /// Reverse the axis order (the full transpose). Copies.
    pub fn transpose(&self) -> Self {
        let axes: Vec<usize> = (0..self.rank()).rev().collect();
        self.permute_unchecked(&axes)
    }

    /// Reorder axes by an explicit permutation. Copies.
    ///
    /// `permute(&[2, 0, 1])` on shape [A, B, C] → [C, A, B].
    pub fn permute(&self, axes: &[usize]) -> Result<Self> {
        let rank = self.rank();
        if axes.len() != rank {
            bail!("permute: expected {} axes, got {}", rank, axes.len());
        }
        let mut seen = vec![false; rank];
        for &a in axes {
            if a >= rank {
                return Err(Error::AxisOutOfRange { axis: a, rank });
            }
            if seen[a] {
                bail!("permute: duplicate axis {}", a);
            }
            seen[a] = true;
        }
        Ok(self.permute_unchecked(axes))
    }

    /// Permutation core; `axes` must already be a valid permutation.
    fn permute_unchecked(&self, axes: &[usize]) -> Self {
        let src_dims = self.dims();
        let src_strides = self.shape.strides();
        let new_dims: Vec<usize> = axes.iter().map(|&a| src_dims[a]).collect();
        let perm_strides: Vec<usize> = axes.iter().map(|&a| src_strides[a]).collect();

        let data = self.data();
        let total = self.elem_count();
        let mut out = Vec::with_capacity(total);
        let mut idx = vec![0usize; axes.len()];
        for _ in 0..total {
            let src: usize = idx
                .iter()
                .zip(perm_strides.iter())
                .map(|(&i, &s)| i * s)
                .sum();
            out.push(data[src]);
            advance_index(&mut idx, &new_dims);
        }
        drop(data);
        Self::from_buffer(out, Shape::new(new_dims))
    }

    /// Swap two axes. Copies.
    pub fn swap_axes(&self, a: usize, b: usize) -> Result<Self> {
        self.shape.check_axis(a)?;
        self.shape.check_axis(b)?;
        let mut axes: Vec<usize> = (0..self.rank()).collect();
        axes.swap(a, b);
        self.permute(&axes)
    }

    /// Slice `len` elements along `axis`, starting at `start`. Copies.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Self> {
        self.shape.check_axis(axis)?;
        let dims = self.dims();
        let axis_size = dims[axis];
        if start + len > axis_size {
            return Err(Error::NarrowOutOfBounds {
                axis,
                start,
                len,
                axis_size,
            });
        }
        let outer: usize = dims[..axis].iter().product();
        let inner: usize = dims[axis + 1..].iter().product();

        let data = self.data();
        let mut out = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            for d in start..start + len {
                let row = (o * axis_size + d) * inner;
                out.extend_from_slice(&data[row..row + inner]);
            }
        }
        drop(data);
        let mut new_dims = dims.to_vec();
        new_dims[axis] = len;
        Ok(Self::from_buffer(out, Shape::new(new_dims)))
    }

    /// Broadcast this array to `target`, validating compatibility first.
    /// Returns a freshly materialized buffer.
    pub fn broadcast_to(&self, target: &Shape) -> Result<Self> {
        let joined = Shape::broadcast(self.shape(), target)?;
        if &joined != target {
            return Err(Error::BroadcastMismatch {
                lhs: self.shape.clone(),
                rhs: target.clone(),
            });
        }
        let strides = self.shape.broadcast_strides(target);
        let dims = target.dims().to_vec();
        let total = target.elem_count();

        let data = self.data();
        let mut out = Vec::with_capacity(total);
        let mut idx = vec![0usize; dims.len()];
        for _ in 0..total {
            let src: usize = idx.iter().zip(strides.iter()).map(|(&i, &s)| i * s).sum();
            out.push(data[src]);
            advance_index(&mut idx, &dims);
        }
        drop(data);
        Ok(Self::from_buffer(out, target.clone()))
    }

    /// Sum this array down to `target` — the inverse of `broadcast_to`.
    ///
    /// Every axis that a broadcast from `target` would have expanded is
    /// summed over. Fails when `target` is not broadcastable to this shape.
    pub fn sum_to(&self, target: &Shape) -> Result<Self> {
        self.shape.check_sum_to(target)?;
        if &self.shape == target {
            return Ok(self.clone());
        }
        // Strides of the target viewed as broadcast over self: axes the
        // broadcast repeated get stride 0, so accumulation folds them.
        let strides = target.broadcast_strides(&self.shape);
        let dims = self.dims().to_vec();

        let data = self.data();
        let mut out = vec![0.0f64; target.elem_count()];
        let mut idx = vec![0usize; dims.len()];
        for &v in data.iter() {
            let dst: usize = idx.iter().zip(strides.iter()).map(|(&i, &s)| i * s).sum();
            out[dst] += v;
            advance_index(&mut idx, &dims);
        }
        drop(data);
        Ok(Self::from_buffer(out, target.clone()))
    }

    /// Concatenate arrays along `axis`.
    ///
    /// All arrays must have the same shape except in the concatenation
    /// axis. Copies data from every input into a new buffer.
    pub fn concat(arrays: &[Self], axis: usize) -> Result<Self> {
        if arrays.is_empty() {
            bail!("concat: empty array list");
        }
        let first = &arrays[0];
        let rank = first.rank();
        first.shape.check_axis(axis)?;

        for (i, a) in arrays.iter().enumerate().skip(1) {
            if a.rank() != rank {
                return Err(Error::RankMismatch {
                    expected: rank,
                    got: a.rank(),
                });
            }
            for d in 0..rank {
                if d != axis && a.dims()[d] != first.dims()[d] {
                    bail!(
                        "concat: array {} has extent {} at axis {}, expected {}",
                        i,
                        a.dims()[d],
                        d,
                        first.dims()[d]
                    );
                }
            }
        }

        let cat_size: usize = arrays.iter().map(|a| a.dims()[axis]).sum();
        let mut out_dims = first.dims().to_vec();
        out_dims[axis] = cat_size;
        let outer: usize = first.dims()[..axis].iter().product();
        let inner: usize = first.dims()[axis + 1..].iter().product();

        let mut out = Vec::with_capacity(outer * cat_size * inner);
        for o in 0..outer {
            for a in arrays {
                let n = a.dims()[axis];
                let data = a.data();
                let row = o * n * inner;
                out.extend_from_slice(&data[row..row + n * inner]);
            }
        }
        Ok(Self::from_buffer(out, Shape::new(out_dims)))
    }

    // 2D max pooling

    /// 2D max pooling over a 4-axis input `[batch, channels, h, w]`.
    pub fn max_pool2d(
        &self,
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Self> {
        let (out, _indices) = self.max_pool2d_with_indices(kernel_size, stride, padding)?;
        Ok(out)
    }

    /// Like [`max_pool2d`](Self::max_pool2d) but also returns the argmax
    /// positions (flat indices into the input), which the backward pass
    /// uses to route gradients.
    pub(crate) fn max_pool2d_with_indices(
        &self,
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<(Self, Vec<usize>)> {
        if self.rank() != 4 {
            bail!(
                "max_pool2d input must be 4D [batch, channels, h, w], got rank {}",
                self.rank()
            );
        }
        let dims = self.dims();
        let (n, c, h, w) = (dims[0], dims[1], dims[2], dims[3]);
        let [kh, kw] = kernel_size;
        let [sh, sw] = stride;
        let [ph, pw] = padding;
        if sh == 0 || sw == 0 {
            bail!("max_pool2d: stride must be positive");
        }
        if kh == 0 || kw == 0 {
            bail!("max_pool2d: kernel extents must be positive");
        }
        if h + 2 * ph < kh || w + 2 * pw < kw {
            bail!("max_pool2d: kernel larger than padded input");
        }

        let h_out = (h + 2 * ph - kh) / sh + 1;
        let w_out = (w + 2 * pw - kw) / sw + 1;

        let input_data = self.to_vec();
        let out_size = n * c * h_out * w_out;
        let mut output = vec![f64::NEG_INFINITY; out_size];
        let mut indices = vec![0usize; out_size];

        for ni in 0..n {
            for ci in 0..c {
                for oh in 0..h_out {
                    for ow in 0..w_out {
                        let out_idx = ((ni * c + ci) * h_out + oh) * w_out + ow;
                        let mut max_val = f64::NEG_INFINITY;
                        let mut max_idx = 0usize;
                        for ki in 0..kh {
                            for kj in 0..kw {
                                let ih = (oh * sh + ki) as isize - ph as isize;
                                let iw = (ow * sw + kj) as isize - pw as isize;
                                if ih >= 0 && ih < h as isize && iw >= 0 && iw < w as isize {
                                    let in_idx =
                                        ((ni * c + ci) * h + ih as usize) * w + iw as usize;
                                    if input_data[in_idx] > max_val {
                                        max_val = input_data[in_idx];
                                        max_idx = in_idx;
                                    }
                                }
                            }
                        }
                        output[out_idx] = max_val;
                        indices[out_idx] = max_idx;
                    }
                }
            }
        }

        let out_shape = Shape::new(vec![n, c, h_out, w_out]);
        Ok((Self::from_buffer(output, out_shape), indices))
    }

    // Windowed correlation (2D cross-correlation)

    /// 2D windowed correlation of a 4-axis input with a 4-axis kernel.
    ///
    /// - `self`:   `[batch, inChannels, h, w]`
    /// - `kernel`: `[outChannels, inChannels, kh, kw]`
    ///
    /// Output: `[batch, outChannels, outH, outW]` with
    /// `outDim = (dim + 2*padding - kernelDim) / stride + 1`.
    pub fn corr2d(&self, kernel: &Self, stride: [usize; 2], padding: [usize; 2]) -> Result<Self> {
        let (out, _cols) = self.corr2d_with_cols(kernel, stride, padding)?;
        Ok(out)
    }

    /// Like [`corr2d`](Self::corr2d) but also returns the unrolled column
    /// matrix (one `[inChannels*kh*kw, outH*outW]` block per sample), which
    /// the backward pass reuses for both gradient products.
    pub(crate) fn corr2d_with_cols(
        &self,
        kernel: &Self,
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<(Self, Vec<f64>)> {
        if self.rank() != 4 {
            bail!(
                "corr2d input must be 4D [batch, channels, h, w], got rank {}",
                self.rank()
            );
        }
        if kernel.rank() != 4 {
            bail!(
                "corr2d kernel must be 4D [outChannels, inChannels, kh, kw], got rank {}",
                kernel.rank()
            );
        }

        let in_dims = self.dims();
        let k_dims = kernel.dims();
        let (n, c_in, h, w) = (in_dims[0], in_dims[1], in_dims[2], in_dims[3]);
        let (c_out, kc_in, kh, kw) = (k_dims[0], k_dims[1], k_dims[2], k_dims[3]);

        if c_in != kc_in {
            bail!(
                "corr2d: input channels {} != kernel channels {}",
                c_in,
                kc_in
            );
        }

        let [sh, sw] = stride;
        let [ph, pw] = padding;
        if sh == 0 || sw == 0 {
            bail!("corr2d: stride must be positive");
        }
        if h + 2 * ph < kh || w + 2 * pw < kw {
            bail!("corr2d: kernel larger than padded input");
        }

        let h_out = (h + 2 * ph - kh) / sh + 1;
        let w_out = (w + 2 * pw - kw) / sw + 1;

        let input_data = self.to_vec();
        let kernel_data = kernel.to_vec();

        let col_rows = c_in * kh * kw;
        let col_cols = h_out * w_out;
        let sample_size = c_in * h * w;
        let mut cols = vec![0.0f64; n * col_rows * col_cols];
        let mut out = vec![0.0f64; n * c_out * col_cols];

        for ni in 0..n {
            let in_offset = ni * sample_size;
            let col_offset = ni * col_rows * col_cols;
            im2col(
                &input_data[in_offset..in_offset + sample_size],
                c_in,
                h,
                w,
                kh,
                kw,
                sh,
                sw,
                ph,
                pw,
                h_out,
                w_out,
                &mut cols[col_offset..col_offset + col_rows * col_cols],
            );

            // out[ni] = kernel [c_out, col_rows] × cols [col_rows, col_cols]
            let out_offset = ni * c_out * col_cols;
            gemm(
                &kernel_data,
                &cols[col_offset..col_offset + col_rows * col_cols],
                &mut out[out_offset..out_offset + c_out * col_cols],
                c_out,
                col_cols,
                col_rows,
            );
        }

        let out_shape = Shape::new(vec![n, c_out, h_out, w_out]);
        Ok((Self::from_buffer(out, out_shape), cols))
    }
}

/// Advance a row-major multi-dimensional index by one position.
pub(crate) fn advance_index(idx: &mut [usize], dims: &[usize]) {
    for i in (0..dims.len()).rev() {
        idx[i] += 1;
        if idx[i] < dims[i] {
            return;
        }
        idx[i] = 0;
    }
}

// im2col / col2im — correlation via matrix multiplication
//
// im2col extracts every sliding-window patch of one sample and lays them out
// as columns of a matrix, turning the correlation into a single GEMM:
//
//   cols = im2col(input)       shape: [c_in * kh * kw,  h_out * w_out]
//   out  = kernel × cols       shape: [c_out, h_out * w_out]
//
// col2im is the inverse scatter: it adds column entries back into an
// image-shaped buffer, accumulating overlapping contributions. That summed
// (never overwritten) accumulation is exactly what the backward pass of the
// correlation needs.

/// Extract sliding-window patches from a single `[c_in, h, w]` sample into
/// `cols` of shape `[c_in * kh * kw, h_out * w_out]`. Out-of-bounds
/// (padding) positions contribute 0.
#[inline]
#[allow(clippy::too_many_arguments)]
pub(crate) fn im2col(
    input: &[f64],
    c_in: usize,
    h: usize,
    w: usize,
    kh: usize,
    kw: usize,
    sh: usize,
    sw: usize,
    ph: usize,
    pw: usize,
    h_out: usize,
    w_out: usize,
    cols: &mut [f64],
) {
    let col_cols = h_out * w_out;
    for ci in 0..c_in {
        for ki in 0..kh {
            for kj in 0..kw {
                let row = (ci * kh + ki) * kw + kj;
                let row_offset = row * col_cols;
                for oh in 0..h_out {
                    for ow in 0..w_out {
                        let ih = (oh * sh + ki) as isize - ph as isize;
                        let iw = (ow * sw + kj) as isize - pw as isize;
                        let val = if ih >= 0 && ih < h as isize && iw >= 0 && iw < w as isize {
                            input[(ci * h + ih as usize) * w + iw as usize]
                        } else {
                            0.0
                        };
                        cols[row_offset + oh * w_out + ow] = val;
                    }
                }
            }
        }
    }
}

/// Scatter a column matrix back into a `[c_in, h, w]` buffer, accumulating
/// overlapping receptive-field contributions. `output` must be pre-zeroed.
#[inline]
#[allow(clippy::too_many_arguments)]
pub(crate) fn col2im(
    cols: &[f64],
    c_in: usize,
    h: usize,
    w: usize,
    kh: usize,
    kw: usize,
    sh: usize,
    sw: usize,
    ph: usize,
    pw: usize,
    h_out: usize,
    w_out: usize,
    output: &mut [f64],
) {
    let col_cols = h_out * w_out;
    for ci in 0..c_in {
        for ki in 0..kh {
            for kj in 0..kw {
                let row = (ci * kh + ki) * kw + kj;
                let row_offset = row * col_cols;
                for oh in 0..h_out {
                    for ow in 0..w_out {
                        let ih = (oh * sh + ki) as isize - ph as isize;
                        let iw = (ow * sw + kj) as isize - pw as isize;
                        if ih >= 0 && ih < h as isize && iw >= 0 && iw < w as isize {
                            output[(ci * h + ih as usize) * w + iw as usize] +=
                                cols[row_offset + oh * w_out + ow];
                        }
                    }
                }
            }
        }
    }
}

/// GEMM: C += A × B. A: [m, k], B: [k, n], C: [m, n], all row-major.
#[inline]
pub(crate) fn gemm(a: &[f64], b: &[f64], c: &mut [f64], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let a_row = i * k;
        let c_row = i * n;
        for p in 0..k {
            let a_val = a[a_row + p];
            let b_row = p * n;
            for j in 0..n {
                c[c_row + j] += a_val * b[b_row + j];
            }
        }
    }
}

/// GEMM: C += A^T × B. A: [k, m], B: [k, n], C: [m, n].
#[inline]
pub(crate) fn gemm_at_b(a: &[f64], b: &[f64], c: &mut [f64], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let c_row = i * n;
        for p in 0..k {
            let a_val = a[p * m + i];
            let b_row = p * n;
            for j in 0..n {
                c[c_row + j] += a_val * b[b_row + j];
            }
        }
    }
}

/// GEMM: C += A × B^T. A: [m, k], B: [n, k], C: [m, n].
#[inline]
pub(crate) fn gemm_a_bt(a: &[f64], b: &[f64], c: &mut [f64], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let a_row = i * k;
        let c_row = i * n;
        for j in 0..n {
            let b_row = j * k;
            let mut val = 0.0f64;
            for p in 0..k {
                val += a[a_row + p] * b[b_row + p];
            }
            c[c_row + j] += val;
        }
    }
}
