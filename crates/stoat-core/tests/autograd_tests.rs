// Integration tests for the autodiff engine.
//
// The master correctness property is the gradient check: for every kernel,
// the reverse-mode gradient must match a central finite-difference estimate
// within a small tolerance. The remaining tests pin down the graph
// semantics: diamond-shaped sharing, repeated/seeded backward, and the
// windowed-correlation boundary cases.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use stoat_core::{NdArray, Shape, Variable};

const EPS: f64 = 1e-5;
const TOL: f64 = 1e-5;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol * 1.0f64.max(b.abs())
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

/// Central finite-difference gradient of a scalar-valued function of `x`.
fn numeric_grad(x: &NdArray, f: impl Fn(&NdArray) -> f64) -> Vec<f64> {
    let base = x.to_vec();
    let mut grads = Vec::with_capacity(base.len());
    for i in 0..base.len() {
        let mut plus = base.clone();
        let mut minus = base.clone();
        plus[i] += EPS;
        minus[i] -= EPS;
        let fp = f(&NdArray::of(&plus, x.shape().clone()).unwrap());
        let fm = f(&NdArray::of(&minus, x.shape().clone()).unwrap());
        grads.push((fp - fm) / (2.0 * EPS));
    }
    grads
}

/// Check the reverse-mode gradient of `f` (a scalar-valued graph function)
/// against finite differences at the point `x`.
fn check_gradient(x: &NdArray, f: impl Fn(&Variable) -> Variable) {
    let v = Variable::with_grad(x.clone());
    let y = f(&v);
    assert_eq!(y.elem_count(), 1, "gradient check target must be scalar");
    y.backward().unwrap();
    let analytic = v.grad().unwrap().to_vec();
    let numeric = numeric_grad(x, |arr| {
        f(&Variable::new(arr.clone())).value().to_scalar().unwrap()
    });
    assert_vec_approx(&analytic, &numeric, TOL);
}

fn rand_array(rng: &mut StdRng, shape: impl Into<Shape>) -> NdArray {
    let shape = shape.into();
    let data: Vec<f64> = (0..shape.elem_count())
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect();
    NdArray::of(&data, shape).unwrap()
}

// Elementwise gradients

#[test]
fn grad_add_with_broadcast() {
    let x = NdArray::of(&[1.0, -2.0, 3.0, 0.5, 2.0, -1.0], (2, 3)).unwrap();
    let y = NdArray::of(&[0.3, -0.7, 1.2], 3).unwrap();

    // d/dx of sum(x + y)
    let yc = y.clone();
    check_gradient(&x, move |v| {
        v.add(&Variable::new(yc.clone())).unwrap().sum(None).unwrap()
    });
    // d/dy — the broadcast side must collapse back to [3]
    let xc = x.clone();
    check_gradient(&y, move |v| {
        Variable::new(xc.clone()).add(v).unwrap().sum(None).unwrap()
    });
}

#[test]
fn grad_sub_mul_div() {
    let x = NdArray::of(&[1.5, -0.5, 2.0, 0.8], (2, 2)).unwrap();
    let y = NdArray::of(&[0.7, 1.3], 2).unwrap(); // broadcast over rows, no zeros

    let yc = y.clone();
    check_gradient(&x, move |v| {
        v.sub(&Variable::new(yc.clone())).unwrap().sum(None).unwrap()
    });

    let yc = y.clone();
    check_gradient(&x, move |v| {
        v.mul(&Variable::new(yc.clone())).unwrap().sum(None).unwrap()
    });
    let xc = x.clone();
    check_gradient(&y, move |v| {
        Variable::new(xc.clone()).mul(v).unwrap().sum(None).unwrap()
    });

    let yc = y.clone();
    check_gradient(&x, move |v| {
        v.div(&Variable::new(yc.clone())).unwrap().sum(None).unwrap()
    });
    let xc = x.clone();
    check_gradient(&y, move |v| {
        Variable::new(xc.clone()).div(v).unwrap().sum(None).unwrap()
    });
}

#[test]
fn grad_unary_ops() {
    let x = NdArray::of(&[0.5, -1.2, 2.0, 0.1], (2, 2)).unwrap();

    check_gradient(&x, |v| v.neg().sum(None).unwrap());
    check_gradient(&x, |v| v.exp().sum(None).unwrap());
    check_gradient(&x, |v| v.tanh().sum(None).unwrap());
    check_gradient(&x, |v| v.affine(3.0, -1.0).sum(None).unwrap());
    check_gradient(&x, |v| v.powf(2.0).sum(None).unwrap());

    // log needs positive inputs
    let xp = NdArray::of(&[0.5, 1.2, 2.0, 0.1], (2, 2)).unwrap();
    check_gradient(&xp, |v| v.log().sum(None).unwrap());
}

#[test]
fn grad_activation_ops() {
    // Inputs kept away from the relu/clamp kinks, where the derivative is
    // discontinuous and finite differences are meaningless.
    let x = NdArray::of(&[0.5, -1.2, 2.0, -0.1], (2, 2)).unwrap();

    check_gradient(&x, |v| v.sin().sum(None).unwrap());
    check_gradient(&x, |v| v.cos().sum(None).unwrap());
    check_gradient(&x, |v| v.relu().sum(None).unwrap());
    check_gradient(&x, |v| v.sigmoid().sum(None).unwrap());
    check_gradient(&x, |v| v.clamp(-1.0, 1.5).sum(None).unwrap());

    // sqrt needs positive inputs
    let xp = NdArray::of(&[0.5, 1.2, 2.0, 0.1], (2, 2)).unwrap();
    check_gradient(&xp, |v| v.sqrt().sum(None).unwrap());
}

#[test]
fn grad_concat() {
    let a = NdArray::of(&[1.0, 2.0, 3.0, 4.0], (2, 2)).unwrap();
    let b = NdArray::of(&[5.0, 6.0], (2, 1)).unwrap();
    let w = NdArray::of(&[0.5, -1.0, 2.0, 1.5, -0.5, 1.0], (2, 3)).unwrap();

    let (bc, wc) = (b.clone(), w.clone());
    check_gradient(&a, move |v| {
        Variable::concat(&[v.clone(), Variable::new(bc.clone())], 1)
            .unwrap()
            .mul(&Variable::new(wc.clone()))
            .unwrap()
            .sum(None)
            .unwrap()
    });
    let (ac, wc) = (a.clone(), w.clone());
    check_gradient(&b, move |v| {
        Variable::concat(&[Variable::new(ac.clone()), v.clone()], 1)
            .unwrap()
            .mul(&Variable::new(wc.clone()))
            .unwrap()
            .sum(None)
            .unwrap()
    });
}

#[test]
fn grad_max_pool2d() {
    // Distinct values keep the argmax stable under the probe step.
    let img = NdArray::arange(16).reshape((1, 1, 4, 4)).unwrap();
    check_gradient(&img, |v| {
        v.max_pool2d([2, 2], [2, 2], [0, 0])
            .unwrap()
            .powf(2.0)
            .sum(None)
            .unwrap()
    });

    // Overlapping windows: stride 1 makes several outputs share an input.
    let img = NdArray::of(
        &[9.0, 1.0, 2.0, 3.0, 8.0, 0.5, 4.0, 6.0, 7.0],
        (1, 1, 3, 3),
    )
    .unwrap();
    check_gradient(&img, |v| {
        v.max_pool2d([2, 2], [1, 1], [0, 0]).unwrap().sum(None).unwrap()
    });
}

// Reduction gradients

#[test]
fn grad_sum_and_mean() {
    let x = NdArray::of(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3)).unwrap();
    // Weight the per-axis outputs so every output cell has a distinct
    // contribution to the scalar.
    let w = NdArray::of(&[0.5, -1.0, 2.0], 3).unwrap();

    let wc = w.clone();
    check_gradient(&x, move |v| {
        v.sum(Some(0))
            .unwrap()
            .mul(&Variable::new(wc.clone()))
            .unwrap()
            .sum(None)
            .unwrap()
    });
    let wc = w.clone();
    check_gradient(&x, move |v| {
        v.mean(Some(0))
            .unwrap()
            .mul(&Variable::new(wc.clone()))
            .unwrap()
            .sum(None)
            .unwrap()
    });
    check_gradient(&x, |v| v.mean(None).unwrap());
}

#[test]
fn grad_var_population() {
    let x = NdArray::of(&[1.0, 2.0, 4.0, 8.0, 3.0, 5.0], (2, 3)).unwrap();
    check_gradient(&x, |v| v.var(None).unwrap());
    check_gradient(&x, |v| v.var(Some(1)).unwrap().sum(None).unwrap());
    check_gradient(&x, |v| v.var(Some(0)).unwrap().sum(None).unwrap());
}

#[test]
fn grad_max_min() {
    // Distinct values: finite differences are only valid away from ties.
    let x = NdArray::of(&[3.0, 1.0, 4.0, 1.5, 5.0, 9.0], (2, 3)).unwrap();
    check_gradient(&x, |v| v.max(None).unwrap());
    check_gradient(&x, |v| v.min(None).unwrap());
    check_gradient(&x, |v| v.max(Some(1)).unwrap().sum(None).unwrap());
    check_gradient(&x, |v| v.min(Some(0)).unwrap().sum(None).unwrap());
}

// Matmul gradients

#[test]
fn grad_matmul_2d() {
    let mut rng = StdRng::seed_from_u64(7);
    let a = rand_array(&mut rng, (2, 3));
    let b = rand_array(&mut rng, (3, 4));

    let bc = b.clone();
    check_gradient(&a, move |v| {
        v.matmul(&Variable::new(bc.clone())).unwrap().sum(None).unwrap()
    });
    let ac = a.clone();
    check_gradient(&b, move |v| {
        Variable::new(ac.clone()).matmul(v).unwrap().sum(None).unwrap()
    });
}

#[test]
fn grad_matmul_batch_broadcast() {
    let mut rng = StdRng::seed_from_u64(11);
    // [2, 1, 2, 3] @ [3, 3, 2] → batch broadcast to [2, 3]
    let a = rand_array(&mut rng, (2, 1, 2, 3));
    let b = rand_array(&mut rng, (3, 3, 2));

    let bc = b.clone();
    check_gradient(&a, move |v| {
        v.matmul(&Variable::new(bc.clone())).unwrap().sum(None).unwrap()
    });
    let ac = a.clone();
    check_gradient(&b, move |v| {
        Variable::new(ac.clone()).matmul(v).unwrap().sum(None).unwrap()
    });
}

// Shape-op gradients

#[test]
fn grad_shape_ops() {
    let x = NdArray::of(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3)).unwrap();
    let w = NdArray::of(&[0.5, -1.0, 2.0, 1.5, -0.5, 1.0], (3, 2)).unwrap();

    let wc = w.clone();
    check_gradient(&x, move |v| {
        v.reshape((3, 2))
            .unwrap()
            .mul(&Variable::new(wc.clone()))
            .unwrap()
            .sum(None)
            .unwrap()
    });
    let wc = w.clone();
    check_gradient(&x, move |v| {
        v.transpose()
            .mul(&Variable::new(wc.clone()))
            .unwrap()
            .sum(None)
            .unwrap()
    });
    check_gradient(&x, |v| {
        v.permute(&[1, 0]).unwrap().powf(2.0).sum(None).unwrap()
    });
    check_gradient(&x, |v| {
        v.narrow(1, 1, 2).unwrap().powf(2.0).sum(None).unwrap()
    });
    check_gradient(&x, |v| {
        v.broadcast_to(&Shape::from((4, 2, 3)))
            .unwrap()
            .powf(2.0)
            .sum(None)
            .unwrap()
    });
    check_gradient(&x, |v| {
        v.sum_to(&Shape::from((1, 3))).unwrap().powf(2.0).sum(None).unwrap()
    });
}

// Windowed-correlation gradients

#[test]
fn grad_corr2d() {
    let mut rng = StdRng::seed_from_u64(23);
    let img = rand_array(&mut rng, (1, 2, 3, 3));
    let kernel = rand_array(&mut rng, (2, 2, 2, 2));

    let kc = kernel.clone();
    check_gradient(&img, move |v| {
        v.corr2d(&Variable::new(kc.clone()), [1, 1], [0, 0])
            .unwrap()
            .sum(None)
            .unwrap()
    });
    let ic = img.clone();
    check_gradient(&kernel, move |v| {
        Variable::new(ic.clone())
            .corr2d(v, [1, 1], [0, 0])
            .unwrap()
            .sum(None)
            .unwrap()
    });
}

#[test]
fn grad_corr2d_stride_padding() {
    let mut rng = StdRng::seed_from_u64(29);
    let img = rand_array(&mut rng, (2, 1, 4, 4));
    let kernel = rand_array(&mut rng, (3, 1, 3, 3));

    let kc = kernel.clone();
    check_gradient(&img, move |v| {
        v.corr2d(&Variable::new(kc.clone()), [2, 2], [1, 1])
            .unwrap()
            .sum(None)
            .unwrap()
    });
    let ic = img.clone();
    check_gradient(&kernel, move |v| {
        Variable::new(ic.clone())
            .corr2d(v, [2, 2], [1, 1])
            .unwrap()
            .sum(None)
            .unwrap()
    });
}

#[test]
fn corr2d_overlap_scatters_sum() {
    // All-ones 2x2 kernel, 3x3 image: each input pixel's gradient is the
    // number of windows covering it — overlapping contributions must sum,
    // not overwrite.
    let img = Variable::with_grad(NdArray::arange(9).reshape((1, 1, 3, 3)).unwrap());
    let k = Variable::new(NdArray::ones((1, 1, 2, 2)));
    let y = img.corr2d(&k, [1, 1], [0, 0]).unwrap().sum(None).unwrap();
    y.backward().unwrap();
    assert_eq!(
        img.grad().unwrap().to_vec(),
        vec![1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0]
    );
}

#[test]
fn corr2d_1x1_equals_matmul() {
    // With a 1x1 kernel, stride 1, padding 0, the correlation is a
    // per-pixel matrix multiply over the channel axis.
    let mut rng = StdRng::seed_from_u64(31);
    let img = rand_array(&mut rng, (2, 3, 4, 4));
    let kernel = rand_array(&mut rng, (5, 3, 1, 1));

    let conv = img.corr2d(&kernel, [1, 1], [0, 0]).unwrap();

    let k2 = kernel.reshape((5, 3)).unwrap();
    let x2 = img.reshape((2, 3, 16)).unwrap();
    let by_matmul = k2.matmul(&x2).unwrap(); // [5,3] @ [2,3,16] → [2,5,16]

    assert_vec_approx(&conv.to_vec(), &by_matmul.to_vec(), 1e-12);
    assert_eq!(conv.dims(), &[2, 5, 4, 4]);
}

// Graph semantics

#[test]
fn diamond_graph_sums_contributions() {
    // c feeds two different downstream ops; its gradient must be the sum
    // of both contributions.
    let x = Variable::with_grad(NdArray::scalar(2.0));
    let c = x.mul(&x).unwrap(); // c = x² = 4
    let d1 = c.mul(&c).unwrap(); // c²
    let d2 = c.affine(3.0, 0.0); // 3c
    let y = d1.add(&d2).unwrap(); // y = c² + 3c

    y.backward_opts(None, true).unwrap();
    // dy/dc = 2c + 3 = 11, dy/dx = 11 · 2x = 44
    assert_eq!(c.grad().unwrap().to_scalar().unwrap(), 11.0);
    assert_eq!(x.grad().unwrap().to_scalar().unwrap(), 44.0);
}

#[test]
fn diamond_graph_gradient_check() {
    let x = NdArray::of(&[0.4, -0.8, 1.1, 0.3], (2, 2)).unwrap();
    check_gradient(&x, |v| {
        let c = v.tanh();
        let d1 = c.mul(&c).unwrap();
        let d2 = c.exp();
        d1.add(&d2).unwrap().sum(None).unwrap()
    });
}

#[test]
fn shared_leaf_used_twice() {
    // x used directly by two ops: same accumulation rule applies to leaves.
    let x = Variable::with_grad(NdArray::scalar(3.0));
    let y = x.mul(&x).unwrap().add(&x).unwrap(); // x² + x
    y.backward().unwrap();
    assert_eq!(x.grad().unwrap().to_scalar().unwrap(), 7.0); // 2x + 1
}

#[test]
fn seeded_backward_weights_outputs() {
    let x = Variable::with_grad(NdArray::of(&[1.0, 2.0, 3.0], 3).unwrap());
    let y = x.powf(2.0);
    let seed = NdArray::of(&[1.0, 0.0, 10.0], 3).unwrap();
    y.backward_with(&seed).unwrap();
    // dy_i/dx_i = 2 x_i, weighted by the seed
    assert_vec_approx(&x.grad().unwrap().to_vec(), &[2.0, 0.0, 60.0], 1e-12);
}

#[test]
fn long_chain_backward() {
    // Deep graphs must not rely on call-stack recursion.
    let x = Variable::with_grad(NdArray::scalar(1.0));
    let mut y = x.clone();
    for _ in 0..2000 {
        y = y.affine(1.0, 0.001);
    }
    let z = y.sum(None).unwrap();
    z.backward().unwrap();
    assert_eq!(x.grad().unwrap().to_scalar().unwrap(), 1.0);
}

#[test]
fn parameter_snapshot_keys() {
    use std::collections::HashMap;

    let w = Variable::parameter(NdArray::arange(4).reshape((2, 2)).unwrap(), "dense.weight");
    let b = Variable::parameter(NdArray::zeros(2), "dense.bias");

    let mut snapshot: HashMap<String, Vec<f64>> = HashMap::new();
    for p in [&w, &b] {
        snapshot.insert(p.name().unwrap(), p.value().to_vec());
    }
    assert_eq!(snapshot["dense.weight"], vec![0.0, 1.0, 2.0, 3.0]);
    assert_eq!(snapshot["dense.bias"], vec![0.0, 0.0]);
}
