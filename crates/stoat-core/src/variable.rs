use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::ndarray::NdArray;
use crate::op::Op;
use crate::shape::Shape;

// Variable — Graph node pairing a value with gradient metadata
//
// A Variable wraps one computed NdArray together with everything reverse-mode
// differentiation needs: an optional gradient accumulator, a record of the
// operation that created it (its "creator") plus the parent Variables that
// operation consumed, a `requires_grad` flag, and a generation number.
//
// The generation is the topological depth of the node: 0 for leaves,
// 1 + max(parent generations) otherwise. The backward engine processes nodes
// in strictly decreasing generation order, which guarantees that a node's
// gradient is complete (all consumers have contributed) before it is
// propagated further back.
//
// OWNERSHIP: the inner struct is Arc-wrapped, so cloning a Variable is one
// refcount increment. Creator records hold strong references from child to
// parents, keeping the whole recorded graph alive as long as the output is;
// a Variable can only be created after its parents exist, so the references
// form a DAG, never a cycle.

/// Unique identifier for a Variable. Used to deduplicate graph traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(u64);

impl VarId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        VarId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// The operation that produced a derived Variable, with the parents it
/// consumed in call order.
pub(crate) struct Creator {
    pub(crate) op: Op,
    pub(crate) inputs: Vec<Variable>,
}

struct VarInner {
    id: VarId,
    value: NdArray,
    grad: RwLock<Option<NdArray>>,
    creator: Option<Creator>,
    generation: u32,
    requires_grad: bool,
    /// Stable key for parameter snapshotting by surrounding model code.
    name: RwLock<Option<String>>,
}

/// A node of the dynamic computation graph.
///
/// Cloning is cheap (Arc refcount increment) and both clones refer to the
/// same node — same value, same gradient accumulator.
pub struct Variable {
    inner: Arc<VarInner>,
}

impl Clone for Variable {
    fn clone(&self) -> Self {
        Variable {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Variable(id={:?}, shape={}, gen={}, requires_grad={})",
            self.inner.id,
            self.shape(),
            self.inner.generation,
            self.inner.requires_grad,
        )
    }
}

impl Variable {
    fn from_parts(
        value: NdArray,
        creator: Option<Creator>,
        generation: u32,
        requires_grad: bool,
    ) -> Self {
        Variable {
            inner: Arc::new(VarInner {
                id: VarId::new(),
                value,
                grad: RwLock::new(None),
                creator,
                generation,
                requires_grad,
                name: RwLock::new(None),
            }),
        }
    }

    /// Create a leaf Variable that does NOT track gradients.
    pub fn new(value: NdArray) -> Self {
        Self::from_parts(value, None, 0, false)
    }

    /// Create a leaf Variable that tracks gradients.
    pub fn with_grad(value: NdArray) -> Self {
        Self::from_parts(value, None, 0, true)
    }

    /// Create a tracked leaf with a stable parameter name, so surrounding
    /// model code can snapshot/restore a name → NdArray mapping.
    pub fn parameter(value: NdArray, name: impl Into<String>) -> Self {
        let v = Self::from_parts(value, None, 0, true);
        *v.inner.name.write().expect("name lock poisoned") = Some(name.into());
        v
    }

    /// Wire the output of an operation into the graph.
    ///
    /// The output is tracked iff at least one input is tracked; tracking is
    /// decided here, at construction, never lazily. Untracked outputs record
    /// no creator, so backward traversal stops at them by construction.
    pub(crate) fn apply(op: Op, inputs: &[&Variable], value: NdArray) -> Variable {
        let tracked = inputs.iter().any(|v| v.requires_grad());
        if !tracked {
            return Self::from_parts(value, None, 0, false);
        }
        let generation = 1 + inputs.iter().map(|v| v.generation()).max().unwrap_or(0);
        let creator = Creator {
            op,
            inputs: inputs.iter().map(|&v| v.clone()).collect(),
        };
        Self::from_parts(value, Some(creator), generation, true)
    }

    // Accessors

    /// Unique node id.
    pub fn id(&self) -> VarId {
        self.inner.id
    }

    /// The wrapped value.
    pub fn value(&self) -> &NdArray {
        &self.inner.value
    }

    /// The shape of the wrapped value.
    pub fn shape(&self) -> &Shape {
        self.inner.value.shape()
    }

    /// The axis extents as a slice.
    pub fn dims(&self) -> &[usize] {
        self.inner.value.dims()
    }

    /// Number of axes.
    pub fn rank(&self) -> usize {
        self.inner.value.rank()
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        self.inner.value.elem_count()
    }

    /// Whether gradients are tracked through this node.
    pub fn requires_grad(&self) -> bool {
        self.inner.requires_grad
    }

    /// Topological depth: 0 for leaves, 1 + max parent generation otherwise.
    pub fn generation(&self) -> u32 {
        self.inner.generation
    }

    /// Whether this is a leaf node (no creator).
    pub fn is_leaf(&self) -> bool {
        self.inner.creator.is_none()
    }

    pub(crate) fn creator(&self) -> Option<&Creator> {
        self.inner.creator.as_ref()
    }

    /// The stable parameter name, if one was assigned.
    pub fn name(&self) -> Option<String> {
        self.inner.name.read().expect("name lock poisoned").clone()
    }

    /// Assign a stable parameter name.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.inner.name.write().expect("name lock poisoned") = Some(name.into());
    }

    // Gradient accumulator

    /// The accumulated gradient, if any.
    pub fn grad(&self) -> Option<NdArray> {
        self.inner.grad.read().expect("grad lock poisoned").clone()
    }

    /// Reset the gradient accumulator.
    pub fn clear_grad(&self) {
        *self.inner.grad.write().expect("grad lock poisoned") = None;
    }

    /// Add `g` into the accumulator (created on first write). The gradient
    /// must have exactly the value's shape.
    pub(crate) fn accumulate_grad(&self, g: NdArray) -> Result<()> {
        if g.shape() != self.shape() {
            return Err(Error::GradShapeMismatch {
                expected: self.shape().clone(),
                got: g.shape().clone(),
            });
        }
        let mut slot = self.inner.grad.write().expect("grad lock poisoned");
        *slot = match slot.take() {
            Some(existing) => Some(existing.add(&g)?),
            None => Some(g),
        };
        Ok(())
    }

    pub(crate) fn drop_grad(&self) {
        *self.inner.grad.write().expect("grad lock poisoned") = None;
    }

    // Backward

    /// Run reverse-mode differentiation from this node.
    ///
    /// Requires a one-element value (the seed is implicitly ones); non-leaf
    /// gradients are discarded after use. Leaf gradients accumulate across
    /// repeated calls until `clear_grad`.
    pub fn backward(&self) -> Result<()> {
        crate::backward::run_backward(self, None, false)
    }

    /// Run backward with an explicit seed gradient (required when this node
    /// is not a scalar). The seed must have exactly this node's shape.
    pub fn backward_with(&self, seed: &NdArray) -> Result<()> {
        crate::backward::run_backward(self, Some(seed), false)
    }

    /// Run backward with full control over seeding and whether non-leaf
    /// gradients are retained.
    pub fn backward_opts(&self, seed: Option<&NdArray>, retain_grad: bool) -> Result<()> {
        crate::backward::run_backward(self, seed, retain_grad)
    }

    // Elementwise arithmetic

    /// Element-wise addition with broadcasting.
    pub fn add(&self, rhs: &Variable) -> Result<Variable> {
        let value = self.value().add(rhs.value())?;
        let op = Op::Add {
            lhs_shape: self.shape().clone(),
            rhs_shape: rhs.shape().clone(),
        };
        Ok(Self::apply(op, &[self, rhs], value))
    }

    /// Element-wise subtraction with broadcasting.
    pub fn sub(&self, rhs: &Variable) -> Result<Variable> {
        let value = self.value().sub(rhs.value())?;
        let op = Op::Sub {
            lhs_shape: self.shape().clone(),
            rhs_shape: rhs.shape().clone(),
        };
        Ok(Self::apply(op, &[self, rhs], value))
    }

    /// Element-wise multiplication with broadcasting.
    pub fn mul(&self, rhs: &Variable) -> Result<Variable> {
        let value = self.value().mul(rhs.value())?;
        let op = Op::Mul {
            lhs: self.value().clone(),
            rhs: rhs.value().clone(),
        };
        Ok(Self::apply(op, &[self, rhs], value))
    }

    /// Element-wise division with broadcasting. Fails on exact zero
    /// denominators.
    pub fn div(&self, rhs: &Variable) -> Result<Variable> {
        let value = self.value().div(rhs.value())?;
        let op = Op::Div {
            lhs: self.value().clone(),
            rhs: rhs.value().clone(),
        };
        Ok(Self::apply(op, &[self, rhs], value))
    }

    /// Element-wise negation.
    pub fn neg(&self) -> Variable {
        Self::apply(Op::Neg, &[self], self.value().neg())
    }

    /// Affine transform: `self * mul + add`.
    pub fn affine(&self, mul: f64, add: f64) -> Variable {
        Self::apply(Op::Affine { mul }, &[self], self.value().affine(mul, add))
    }

    /// Element-wise exponential.
    pub fn exp(&self) -> Variable {
        let op = Op::Exp {
            input: self.value().clone(),
        };
        Self::apply(op, &[self], self.value().exp())
    }

    /// Element-wise natural logarithm.
    pub fn log(&self) -> Variable {
        let op = Op::Log {
            input: self.value().clone(),
        };
        Self::apply(op, &[self], self.value().log())
    }

    /// Element-wise hyperbolic tangent.
    pub fn tanh(&self) -> Variable {
        let op = Op::Tanh {
            input: self.value().clone(),
        };
        Self::apply(op, &[self], self.value().tanh())
    }

    /// Element-wise power with a scalar exponent.
    pub fn powf(&self, exponent: f64) -> Variable {
        let op = Op::Pow {
            input: self.value().clone(),
            exponent,
        };
        Self::apply(op, &[self], self.value().powf(exponent))
    }

    /// Element-wise square root.
    pub fn sqrt(&self) -> Variable {
        let op = Op::Sqrt {
            input: self.value().clone(),
        };
        Self::apply(op, &[self], self.value().sqrt())
    }

    /// Element-wise sine.
    pub fn sin(&self) -> Variable {
        let op = Op::Sin {
            input: self.value().clone(),
        };
        Self::apply(op, &[self], self.value().sin())
    }

    /// Element-wise cosine.
    pub fn cos(&self) -> Variable {
        let op = Op::Cos {
            input: self.value().clone(),
        };
        Self::apply(op, &[self], self.value().cos())
    }

    /// Rectified linear unit: `max(0, x)`.
    pub fn relu(&self) -> Variable {
        let op = Op::Relu {
            input: self.value().clone(),
        };
        Self::apply(op, &[self], self.value().relu())
    }

    /// Logistic sigmoid.
    pub fn sigmoid(&self) -> Variable {
        let op = Op::Sigmoid {
            input: self.value().clone(),
        };
        Self::apply(op, &[self], self.value().sigmoid())
    }

    /// Element-wise clamp to `[min, max]`. The gradient is zero outside
    /// the open interval.
    pub fn clamp(&self, min: f64, max: f64) -> Variable {
        let op = Op::Clamp {
            input: self.value().clone(),
            min,
            max,
        };
        Self::apply(op, &[self], self.value().clamp(min, max))
    }

    // Reductions

    /// Sum along `axis`, or over all elements when `None`.
    pub fn sum(&self, axis: Option<usize>) -> Result<Variable> {
        let value = self.value().sum(axis)?;
        let op = Op::Sum {
            axis,
            src_shape: self.shape().clone(),
        };
        Ok(Self::apply(op, &[self], value))
    }

    /// Arithmetic mean along `axis`, or over all elements.
    pub fn mean(&self, axis: Option<usize>) -> Result<Variable> {
        let value = self.value().mean(axis)?;
        let op = Op::Mean {
            axis,
            src_shape: self.shape().clone(),
        };
        Ok(Self::apply(op, &[self], value))
    }

    /// Population variance along `axis` (divide by N, not N−1).
    pub fn var(&self, axis: Option<usize>) -> Result<Variable> {
        let value = self.value().var(axis)?;
        let op = Op::Var {
            axis,
            input: self.value().clone(),
        };
        Ok(Self::apply(op, &[self], value))
    }

    /// Maximum along `axis`, or over all elements.
    pub fn max(&self, axis: Option<usize>) -> Result<Variable> {
        let value = self.value().max(axis)?;
        let op = Op::Max {
            axis,
            input: self.value().clone(),
        };
        Ok(Self::apply(op, &[self], value))
    }

    /// Minimum along `axis`, or over all elements.
    pub fn min(&self, axis: Option<usize>) -> Result<Variable> {
        let value = self.value().min(axis)?;
        let op = Op::Min {
            axis,
            input: self.value().clone(),
        };
        Ok(Self::apply(op, &[self], value))
    }

    // Linear algebra

    /// Batched matrix product (see [`NdArray::matmul`] for the shape rules).
    pub fn matmul(&self, rhs: &Variable) -> Result<Variable> {
        let value = self.value().matmul(rhs.value())?;
        let op = Op::MatMul {
            lhs: self.value().clone(),
            rhs: rhs.value().clone(),
        };
        Ok(Self::apply(op, &[self, rhs], value))
    }

    // Shape operations

    /// Reshape to a new shape with the same element count. The output's
    /// value is a view sharing this node's buffer.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Variable> {
        let op = Op::Reshape {
            src_shape: self.shape().clone(),
        };
        let value = self.value().reshape(shape)?;
        Ok(Self::apply(op, &[self], value))
    }

    /// Broadcast to `target`, validating compatibility.
    pub fn broadcast_to(&self, target: &Shape) -> Result<Variable> {
        let value = self.value().broadcast_to(target)?;
        let op = Op::BroadcastTo {
            src_shape: self.shape().clone(),
        };
        Ok(Self::apply(op, &[self], value))
    }

    /// Sum down to `target` — the inverse of `broadcast_to`.
    pub fn sum_to(&self, target: &Shape) -> Result<Variable> {
        let value = self.value().sum_to(target)?;
        let op = Op::SumTo {
            src_shape: self.shape().clone(),
        };
        Ok(Self::apply(op, &[self], value))
    }

    /// Reverse the axis order.
    pub fn transpose(&self) -> Variable {
        Self::apply(Op::Transpose { axes: None }, &[self], self.value().transpose())
    }

    /// Reorder axes by an explicit permutation.
    pub fn permute(&self, axes: &[usize]) -> Result<Variable> {
        let value = self.value().permute(axes)?;
        let op = Op::Transpose {
            axes: Some(axes.to_vec()),
        };
        Ok(Self::apply(op, &[self], value))
    }

    /// Slice `len` elements along `axis`, starting at `start`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Variable> {
        let value = self.value().narrow(axis, start, len)?;
        let op = Op::Narrow {
            src_shape: self.shape().clone(),
            axis,
            start,
        };
        Ok(Self::apply(op, &[self], value))
    }

    /// Concatenate Variables along `axis`.
    pub fn concat(vars: &[Variable], axis: usize) -> Result<Variable> {
        let arrays: Vec<NdArray> = vars.iter().map(|v| v.value().clone()).collect();
        let value = NdArray::concat(&arrays, axis)?;
        let sizes: Vec<usize> = arrays.iter().map(|a| a.dims()[axis]).collect();
        let op = Op::Concat { axis, sizes };
        let refs: Vec<&Variable> = vars.iter().collect();
        Ok(Self::apply(op, &refs, value))
    }

    /// 2D max pooling over a 4-axis input.
    pub fn max_pool2d(
        &self,
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Variable> {
        let (value, indices) = self
            .value()
            .max_pool2d_with_indices(kernel_size, stride, padding)?;
        let op = Op::MaxPool2d {
            src_shape: self.shape().clone(),
            indices,
        };
        Ok(Self::apply(op, &[self], value))
    }

    // Windowed correlation

    /// 2D windowed correlation with a 4-axis kernel (see
    /// [`NdArray::corr2d`]). The unrolled column matrix built during
    /// forward is cached on the graph node and reused by backward.
    pub fn corr2d(
        &self,
        kernel: &Variable,
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Variable> {
        let (value, cols) = self
            .value()
            .corr2d_with_cols(kernel.value(), stride, padding)?;
        let op = Op::Corr2d {
            input: self.value().clone(),
            kernel: kernel.value().clone(),
            cols,
            stride,
            padding,
        };
        Ok(Self::apply(op, &[self, kernel], value))
    }
}
