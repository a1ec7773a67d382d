use crate::error::Result;
use crate::ndarray::{col2im, gemm_a_bt, gemm_at_b, NdArray};
use crate::shape::Shape;

// Op — Operation nodes of the computation graph
//
// Every derived Variable records HOW it was created as one variant of this
// closed enum. Each variant carries exactly the state its backward rule
// needs: shapes for ops whose local derivative is shape-only (add, sub,
// reshape), operand arrays where the derivative depends on the values (mul,
// div, matmul, reductions over extrema), and for the windowed correlation
// the unrolled column matrix produced during forward.
//
// A closed enum instead of an open trait object means the gradient rules are
// dispatched by pattern matching and the compiler checks exhaustiveness: an
// op without a backward rule cannot exist.
//
// Gradient rules (chain rule per variant):
//
//   Add:       g_lhs = sum_to(g, lhs_shape),  g_rhs = sum_to(g, rhs_shape)
//   Sub:       g_lhs = sum_to(g, ·),          g_rhs = sum_to(-g, ·)
//   Mul:       g_lhs = sum_to(g·rhs, ·),      g_rhs = sum_to(g·lhs, ·)
//   Div:       g_lhs = sum_to(g/rhs, ·),      g_rhs = sum_to(-g·lhs/rhs², ·)
//   MatMul:    g_lhs = sum_to(g @ rhsᵀ, ·),   g_rhs = sum_to(lhsᵀ @ g, ·)
//   Sum:       g_in  = broadcast(g)
//   Mean:      g_in  = broadcast(g) / n
//   Var:       g_in  = 2(x − μ)/n · broadcast(g)
//   Max/Min:   g_in  = broadcast(g) routed to the extremal entries,
//              split equally among ties
//   Reshape:   g_in  = reshape(g, src_shape)
//   Corr2d:    g_in  = col2im(kernelᵀ @ g),   g_k = g @ colsᵀ
//
// The broadcast-collapsing `sum_to` in every binary rule is what keeps
// gradients shaped identically to the inputs the forward call broadcast.

/// One recorded differentiable operation, carrying its forward cache.
pub enum Op {
    /// Element-wise addition; caches the pre-broadcast operand shapes.
    Add { lhs_shape: Shape, rhs_shape: Shape },
    /// Element-wise subtraction.
    Sub { lhs_shape: Shape, rhs_shape: Shape },
    /// Element-wise multiplication; caches both operands.
    Mul { lhs: NdArray, rhs: NdArray },
    /// Element-wise division; caches both operands.
    Div { lhs: NdArray, rhs: NdArray },
    /// Additive inverse.
    Neg,
    /// Fused scale-and-shift: `x * mul + add`.
    Affine { mul: f64 },
    /// Element-wise exponential.
    Exp { input: NdArray },
    /// Element-wise natural logarithm.
    Log { input: NdArray },
    /// Element-wise hyperbolic tangent.
    Tanh { input: NdArray },
    /// Element-wise power with a fixed scalar exponent.
    Pow { input: NdArray, exponent: f64 },
    /// Element-wise square root.
    Sqrt { input: NdArray },
    /// Element-wise sine.
    Sin { input: NdArray },
    /// Element-wise cosine.
    Cos { input: NdArray },
    /// Rectified linear unit.
    Relu { input: NdArray },
    /// Logistic sigmoid.
    Sigmoid { input: NdArray },
    /// Element-wise clamp to `[min, max]`.
    Clamp { input: NdArray, min: f64, max: f64 },
    /// Sum along `axis` (all axes when `None`).
    Sum {
        axis: Option<usize>,
        src_shape: Shape,
    },
    /// Arithmetic mean along `axis`.
    Mean {
        axis: Option<usize>,
        src_shape: Shape,
    },
    /// Population variance along `axis`; needs the input values.
    Var { axis: Option<usize>, input: NdArray },
    /// Maximum along `axis`; needs the input values to locate the extrema.
    Max { axis: Option<usize>, input: NdArray },
    /// Minimum along `axis`.
    Min { axis: Option<usize>, input: NdArray },
    /// Batched matrix product; caches both operands.
    MatMul { lhs: NdArray, rhs: NdArray },
    /// Zero-copy reshape; caches the source shape.
    Reshape { src_shape: Shape },
    /// Explicit broadcast; backward collapses with `sum_to`.
    BroadcastTo { src_shape: Shape },
    /// Broadcast-collapsing sum; backward re-broadcasts.
    SumTo { src_shape: Shape },
    /// Axis reordering; `None` is the full reverse.
    Transpose { axes: Option<Vec<usize>> },
    /// Slice along one axis; backward scatters into a zero array.
    Narrow {
        src_shape: Shape,
        axis: usize,
        start: usize,
    },
    /// Concatenation along one axis; `sizes` records each input's extent
    /// along that axis so backward can slice the gradient apart.
    Concat { axis: usize, sizes: Vec<usize> },
    /// 2D max pooling; caches the argmax positions from forward.
    MaxPool2d {
        src_shape: Shape,
        indices: Vec<usize>,
    },
    /// 2D windowed correlation; caches both operands and the unrolled
    /// column matrix from forward.
    Corr2d {
        input: NdArray,
        kernel: NdArray,
        cols: Vec<f64>,
        stride: [usize; 2],
        padding: [usize; 2],
    },
}

impl Op {
    /// Number of inputs this operation consumed (and the number of
    /// gradients its backward returns).
    pub fn arity(&self) -> usize {
        match self {
            Op::Add { .. }
            | Op::Sub { .. }
            | Op::Mul { .. }
            | Op::Div { .. }
            | Op::MatMul { .. }
            | Op::Corr2d { .. } => 2,
            Op::Concat { sizes, .. } => sizes.len(),
            Op::Neg
            | Op::Affine { .. }
            | Op::Exp { .. }
            | Op::Log { .. }
            | Op::Tanh { .. }
            | Op::Pow { .. }
            | Op::Sqrt { .. }
            | Op::Sin { .. }
            | Op::Cos { .. }
            | Op::Relu { .. }
            | Op::Sigmoid { .. }
            | Op::Clamp { .. }
            | Op::Sum { .. }
            | Op::Mean { .. }
            | Op::Var { .. }
            | Op::Max { .. }
            | Op::Min { .. }
            | Op::Reshape { .. }
            | Op::BroadcastTo { .. }
            | Op::SumTo { .. }
            | Op::Transpose { .. }
            | Op::Narrow { .. }
            | Op::MaxPool2d { .. } => 1,
        }
    }

    /// Short operation name, used in trace logging.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Add { .. } => "add",
            Op::Sub { .. } => "sub",
            Op::Mul { .. } => "mul",
            Op::Div { .. } => "div",
            Op::Neg => "neg",
            Op::Affine { .. } => "affine",
            Op::Exp { .. } => "exp",
            Op::Log { .. } => "log",
            Op::Tanh { .. } => "tanh",
            Op::Pow { .. } => "pow",
            Op::Sqrt { .. } => "sqrt",
            Op::Sin { .. } => "sin",
            Op::Cos { .. } => "cos",
            Op::Relu { .. } => "relu",
            Op::Sigmoid { .. } => "sigmoid",
            Op::Clamp { .. } => "clamp",
            Op::Sum { .. } => "sum",
            Op::Mean { .. } => "mean",
            Op::Var { .. } => "var",
            Op::Max { .. } => "max",
            Op::Min { .. } => "min",
            Op::MatMul { .. } => "matmul",
            Op::Reshape { .. } => "reshape",
            Op::BroadcastTo { .. } => "broadcast_to",
            Op::SumTo { .. } => "sum_to",
            Op::Transpose { .. } => "transpose",
            Op::Narrow { .. } => "narrow",
            Op::Concat { .. } => "concat",
            Op::MaxPool2d { .. } => "max_pool2d",
            Op::Corr2d { .. } => "corr2d",
        }
    }

    /// Compute the input gradients from the output gradient.
    ///
    /// Returns exactly `arity()` gradients, one per original input, each
    /// shaped identically to that input.
    pub fn backward(&self, gout: &NdArray) -> Result<Vec<NdArray>> {
        match self {
            Op::Add {
                lhs_shape,
                rhs_shape,
            } => Ok(vec![gout.sum_to(lhs_shape)?, gout.sum_to(rhs_shape)?]),

            Op::Sub {
                lhs_shape,
                rhs_shape,
            } => Ok(vec![gout.sum_to(lhs_shape)?, gout.neg().sum_to(rhs_shape)?]),

            Op::Mul { lhs, rhs } => {
                let g_lhs = gout.mul(rhs)?.sum_to(lhs.shape())?;
                let g_rhs = gout.mul(lhs)?.sum_to(rhs.shape())?;
                Ok(vec![g_lhs, g_rhs])
            }

            Op::Div { lhs, rhs } => {
                // rhs contains no zeros: forward would have failed.
                let g_lhs = gout.div(rhs)?.sum_to(lhs.shape())?;
                let rhs_sq = rhs.mul(rhs)?;
                let g_rhs = gout.mul(lhs)?.neg().div(&rhs_sq)?.sum_to(rhs.shape())?;
                Ok(vec![g_lhs, g_rhs])
            }

            Op::Neg => Ok(vec![gout.neg()]),

            Op::Affine { mul } => Ok(vec![gout.affine(*mul, 0.0)]),

            Op::Exp { input } => Ok(vec![gout.mul(&input.exp())?]),

            Op::Log { input } => Ok(vec![gout.mul(&input.powf(-1.0))?]),

            Op::Tanh { input } => {
                // d tanh(x)/dx = 1 - tanh²(x)
                let t = input.tanh();
                let d = t.mul(&t)?.affine(-1.0, 1.0);
                Ok(vec![gout.mul(&d)?])
            }

            Op::Pow { input, exponent } => {
                let d = input.powf(exponent - 1.0).affine(*exponent, 0.0);
                Ok(vec![gout.mul(&d)?])
            }

            Op::Sqrt { input } => {
                // d √x/dx = 1 / (2√x)
                let d = input.powf(-0.5).affine(0.5, 0.0);
                Ok(vec![gout.mul(&d)?])
            }

            Op::Sin { input } => Ok(vec![gout.mul(&input.cos())?]),

            Op::Cos { input } => Ok(vec![gout.mul(&input.sin().neg())?]),

            Op::Relu { input } => {
                let mask = input.map(|v| if v > 0.0 { 1.0 } else { 0.0 });
                Ok(vec![gout.mul(&mask)?])
            }

            Op::Sigmoid { input } => {
                // d σ(x)/dx = σ(x) (1 − σ(x))
                let s = input.sigmoid();
                let d = s.mul(&s.affine(-1.0, 1.0))?;
                Ok(vec![gout.mul(&d)?])
            }

            Op::Clamp { input, min, max } => {
                // Gradient passes only strictly inside the clamp band.
                let (lo, hi) = (*min, *max);
                let mask = input.map(move |v| if v > lo && v < hi { 1.0 } else { 0.0 });
                Ok(vec![gout.mul(&mask)?])
            }

            Op::Sum { axis, src_shape } => {
                Ok(vec![expand_reduced(gout, src_shape, *axis)?])
            }

            Op::Mean { axis, src_shape } => {
                let n = reduced_lane_len(src_shape, *axis);
                let g = expand_reduced(gout, src_shape, *axis)?;
                Ok(vec![g.affine(1.0 / n as f64, 0.0)])
            }

            Op::Var { axis, input } => {
                // d var/dx_i = 2 (x_i − μ) / n for population variance.
                let n = reduced_lane_len(input.shape(), *axis);
                let mu = expand_reduced(&input.mean(*axis)?, input.shape(), *axis)?;
                let g = expand_reduced(gout, input.shape(), *axis)?;
                let centered = input.sub(&mu)?;
                Ok(vec![centered.affine(2.0 / n as f64, 0.0).mul(&g)?])
            }

            Op::Max { axis, input } => extremum_grad(gout, input, *axis, true),
            Op::Min { axis, input } => extremum_grad(gout, input, *axis, false),

            Op::MatMul { lhs, rhs } => {
                let lr = lhs.rank();
                let rr = rhs.rank();
                let rhs_t = rhs.swap_axes(rr - 2, rr - 1)?;
                let lhs_t = lhs.swap_axes(lr - 2, lr - 1)?;
                // sum_to collapses any batch broadcasting the forward did.
                let g_lhs = gout.matmul(&rhs_t)?.sum_to(lhs.shape())?;
                let g_rhs = lhs_t.matmul(gout)?.sum_to(rhs.shape())?;
                Ok(vec![g_lhs, g_rhs])
            }

            Op::Reshape { src_shape } => Ok(vec![gout.reshape(src_shape.clone())?]),

            Op::BroadcastTo { src_shape } => Ok(vec![gout.sum_to(src_shape)?]),

            Op::SumTo { src_shape } => Ok(vec![gout.broadcast_to(src_shape)?]),

            Op::Transpose { axes } => match axes {
                None => Ok(vec![gout.transpose()]),
                Some(axes) => {
                    let mut inverse = vec![0usize; axes.len()];
                    for (i, &a) in axes.iter().enumerate() {
                        inverse[a] = i;
                    }
                    Ok(vec![gout.permute(&inverse)?])
                }
            },

            Op::Narrow {
                src_shape,
                axis,
                start,
            } => Ok(vec![narrow_grad(gout, src_shape, *axis, *start)]),

            Op::Concat { axis, sizes } => {
                // Slice the gradient back into per-input pieces.
                let mut gxs = Vec::with_capacity(sizes.len());
                let mut offset = 0usize;
                for &sz in sizes {
                    gxs.push(gout.narrow(*axis, offset, sz)?);
                    offset += sz;
                }
                Ok(gxs)
            }

            Op::MaxPool2d { src_shape, indices } => {
                // Gradient flows only to the argmax positions saved during
                // forward; overlapping windows accumulate.
                let g = gout.to_vec();
                let mut grad_in = vec![0.0f64; src_shape.elem_count()];
                for (out_idx, &in_idx) in indices.iter().enumerate() {
                    grad_in[in_idx] += g[out_idx];
                }
                Ok(vec![NdArray::from_buffer(grad_in, src_shape.clone())])
            }

            Op::Corr2d {
                input,
                kernel,
                cols,
                stride,
                padding,
            } => corr2d_grad(gout, input, kernel, cols, *stride, *padding),
        }
    }
}

/// Expand the gradient of a reduction back to the source shape: reinsert
/// the reduced axis as extent 1, then broadcast.
fn expand_reduced(gout: &NdArray, src_shape: &Shape, axis: Option<usize>) -> Result<NdArray> {
    match axis {
        None => gout.broadcast_to(src_shape),
        Some(a) => {
            let mut dims = src_shape.dims().to_vec();
            dims[a] = 1;
            gout.reshape(Shape::new(dims))?.broadcast_to(src_shape)
        }
    }
}

/// Number of elements each output cell of a reduction aggregated.
fn reduced_lane_len(src_shape: &Shape, axis: Option<usize>) -> usize {
    match axis {
        None => src_shape.elem_count(),
        Some(a) => src_shape.dims()[a],
    }
}

/// Gradient of max/min: route the upstream gradient to the entries that
/// achieved the extremum, splitting equally among ties.
fn extremum_grad(
    gout: &NdArray,
    input: &NdArray,
    axis: Option<usize>,
    is_max: bool,
) -> Result<Vec<NdArray>> {
    let extremum = if is_max {
        input.max(axis)?
    } else {
        input.min(axis)?
    };
    let ext_full = expand_reduced(&extremum, input.shape(), axis)?;

    let x = input.to_vec();
    let e = ext_full.to_vec();
    let mask_data: Vec<f64> = x
        .iter()
        .zip(e.iter())
        .map(|(&xi, &ei)| if xi == ei { 1.0 } else { 0.0 })
        .collect();
    let mask = NdArray::from_buffer(mask_data, input.shape().clone());

    // Ties share the gradient equally; every lane has at least one hit.
    let counts = expand_reduced(&mask.sum(axis)?, input.shape(), axis)?;
    let g_full = expand_reduced(gout, input.shape(), axis)?;
    Ok(vec![mask.mul(&g_full)?.div(&counts)?])
}

/// Gradient of narrow: place the slice gradient into a zero array at the
/// original offset.
fn narrow_grad(gout: &NdArray, src_shape: &Shape, axis: usize, start: usize) -> NdArray {
    let dims = src_shape.dims();
    let axis_size = dims[axis];
    let len = gout.dims()[axis];
    let outer: usize = dims[..axis].iter().product();
    let inner: usize = dims[axis + 1..].iter().product();

    let g = gout.to_vec();
    let mut out = vec![0.0f64; src_shape.elem_count()];
    for o in 0..outer {
        for d in 0..len {
            let src_row = (o * len + d) * inner;
            let dst_row = (o * axis_size + start + d) * inner;
            out[dst_row..dst_row + inner].copy_from_slice(&g[src_row..src_row + inner]);
        }
    }
    NdArray::from_buffer(out, src_shape.clone())
}

/// Gradient of the windowed correlation.
///
/// The kernel gradient multiplies the output gradient against the cached
/// unrolled column matrix (transposed); the input gradient is the exact
/// inverse scatter of the forward gather — `col2im` accumulates into
/// overlapping receptive-field positions instead of overwriting them.
fn corr2d_grad(
    gout: &NdArray,
    input: &NdArray,
    kernel: &NdArray,
    cols: &[f64],
    stride: [usize; 2],
    padding: [usize; 2],
) -> Result<Vec<NdArray>> {
    let in_dims = input.dims();
    let k_dims = kernel.dims();
    let go_dims = gout.dims();
    let (n, c_in, h, w) = (in_dims[0], in_dims[1], in_dims[2], in_dims[3]);
    let (c_out, _, kh, kw) = (k_dims[0], k_dims[1], k_dims[2], k_dims[3]);
    let (h_out, w_out) = (go_dims[2], go_dims[3]);
    let [sh, sw] = stride;
    let [ph, pw] = padding;

    let kernel_data = kernel.to_vec();
    let gout_data = gout.to_vec();

    let col_rows = c_in * kh * kw;
    let col_cols = h_out * w_out;
    let sample_size = c_in * h * w;

    // grad_kernel = Σ_samples gout[ni] × cols[ni]ᵀ  →  [c_out, col_rows]
    let mut grad_k = vec![0.0f64; c_out * col_rows];
    for ni in 0..n {
        let go_offset = ni * c_out * col_cols;
        let col_offset = ni * col_rows * col_cols;
        gemm_a_bt(
            &gout_data[go_offset..go_offset + c_out * col_cols],
            &cols[col_offset..col_offset + col_rows * col_cols],
            &mut grad_k,
            c_out,
            col_rows,
            col_cols,
        );
    }

    // grad_input[ni] = col2im(kernelᵀ × gout[ni])
    let mut grad_in = vec![0.0f64; n * sample_size];
    let mut grad_cols = vec![0.0f64; col_rows * col_cols];
    for ni in 0..n {
        for v in grad_cols.iter_mut() {
            *v = 0.0;
        }
        let go_offset = ni * c_out * col_cols;
        gemm_at_b(
            &kernel_data,
            &gout_data[go_offset..go_offset + c_out * col_cols],
            &mut grad_cols,
            col_rows,
            col_cols,
            c_out,
        );
        let in_offset = ni * sample_size;
        col2im(
            &grad_cols,
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
            &mut grad_in[in_offset..in_offset + sample_size],
        );
    }

    let grad_input = NdArray::from_buffer(grad_in, input.shape().clone());
    let grad_kernel = NdArray::from_buffer(grad_k, kernel.shape().clone());
    Ok(vec![grad_input, grad_kernel])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arity() {
        let op = Op::Add {
            lhs_shape: Shape::from(2),
            rhs_shape: Shape::from(2),
        };
        assert_eq!(op.arity(), 2);
        assert_eq!(Op::Neg.arity(), 1);
    }

    #[test]
    fn test_add_backward_collapses_broadcast() {
        // lhs [2, 3] + rhs [3] → gout [2, 3]; rhs gradient collapses to [3].
        let op = Op::Add {
            lhs_shape: Shape::from((2, 3)),
            rhs_shape: Shape::from(3),
        };
        let gout = NdArray::ones((2, 3));
        let gxs = op.backward(&gout).unwrap();
        assert_eq!(gxs.len(), 2);
        assert_eq!(gxs[0].dims(), &[2, 3]);
        assert_eq!(gxs[1].dims(), &[3]);
        assert_eq!(gxs[1].to_vec(), vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_max_backward_splits_ties() {
        let input = NdArray::of(&[3.0, 3.0, 1.0], 3).unwrap();
        let op = Op::Max {
            axis: None,
            input: input.clone(),
        };
        let gxs = op.backward(&NdArray::scalar(1.0)).unwrap();
        assert_eq!(gxs[0].to_vec(), vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_narrow_backward_scatters() {
        let op = Op::Narrow {
            src_shape: Shape::from(4),
            axis: 0,
            start: 1,
        };
        let gout = NdArray::of(&[5.0, 6.0], 2).unwrap();
        let gxs = op.backward(&gout).unwrap();
        assert_eq!(gxs[0].to_vec(), vec![0.0, 5.0, 6.0, 0.0]);
    }
}
