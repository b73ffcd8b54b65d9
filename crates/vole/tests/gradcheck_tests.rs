// Finite-difference gradient checks
//
// For every layer class, the analytic backward pass is compared against a
// central-difference approximation of d(loss)/d(input) and
// d(loss)/d(parameter), where the loss is a fixed random weighting of the
// layer's output (so every output element contributes a distinct gradient).
//
// The inputs are small and random but seeded, so failures reproduce.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vole::prelude::*;

const EPS: f64 = 1e-5;
const TOL: f64 = 1e-4;

fn rand_vec(n: usize, rng: &mut StdRng) -> Vec<f64> {
    (0..n).map(|_| rng.gen::<f64>() * 2.0 - 1.0).collect()
}

fn rand_tensor(shape: impl Into<Shape>, rng: &mut StdRng) -> Tensor {
    let shape = shape.into();
    let n = shape.elem_count();
    Tensor::from_vec(rand_vec(n, rng), shape).unwrap()
}

fn assert_close(analytic: f64, numeric: f64, what: &str) {
    let scale = 1.0_f64.max(analytic.abs()).max(numeric.abs());
    assert!(
        (analytic - numeric).abs() <= TOL * scale,
        "{}: analytic {} vs numeric {}",
        what,
        analytic,
        numeric
    );
}

/// Shift one element of one parameter tensor by `delta`.
fn nudge_param<L: Layer>(layer: &mut L, pi: usize, j: usize, delta: f64) {
    let mut params = layer.parameters();
    params[pi].value.data_mut()[j] += delta;
}

/// Full input + parameter gradient check for a single-input layer.
fn check_layer<L: Layer>(layer: &mut L, x: &Tensor, rng: &mut StdRng) {
    let y = layer.forward(x).unwrap();
    let seed = rand_vec(y.elem_count(), rng);
    let grad_out = Tensor::from_vec(seed.clone(), y.shape().clone()).unwrap();
    let grad_in = layer.backward(&grad_out).unwrap();
    let param_grads: Vec<Vec<f64>> = layer
        .parameters()
        .iter()
        .map(|p| p.grad.data().to_vec())
        .collect();

    let mut eval = |layer: &mut L, x: &Tensor| -> f64 {
        let y = layer.forward(x).unwrap();
        y.data().iter().zip(seed.iter()).map(|(a, b)| a * b).sum()
    };

    for i in 0..x.elem_count() {
        let mut xp = x.clone();
        xp.data_mut()[i] += EPS;
        let fp = eval(layer, &xp);
        let mut xm = x.clone();
        xm.data_mut()[i] -= EPS;
        let fm = eval(layer, &xm);
        assert_close(
            grad_in.data()[i],
            (fp - fm) / (2.0 * EPS),
            &format!("input[{}]", i),
        );
    }

    for (pi, grads) in param_grads.iter().enumerate() {
        for (j, &analytic) in grads.iter().enumerate() {
            nudge_param(layer, pi, j, EPS);
            let fp = eval(layer, x);
            nudge_param(layer, pi, j, -2.0 * EPS);
            let fm = eval(layer, x);
            nudge_param(layer, pi, j, EPS);
            assert_close(
                analytic,
                (fp - fm) / (2.0 * EPS),
                &format!("param[{}][{}]", pi, j),
            );
        }
    }
}

#[test]
fn gradcheck_linear() {
    let mut rng = StdRng::seed_from_u64(1);
    let mut layer = Linear::new(3, 4);
    let x = rand_tensor((2, 3), &mut rng);
    check_layer(&mut layer, &x, &mut rng);
}

#[test]
fn gradcheck_linear_3d_input() {
    let mut rng = StdRng::seed_from_u64(2);
    let mut layer = Linear::new(3, 2);
    let x = rand_tensor((2, 4, 3), &mut rng);
    check_layer(&mut layer, &x, &mut rng);
}

#[test]
fn gradcheck_layernorm() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut layer = LayerNorm::new(5, 1e-5).unwrap();
    let x = rand_tensor((2, 3, 5), &mut rng);
    check_layer(&mut layer, &x, &mut rng);
}

#[test]
fn gradcheck_activations() {
    let mut rng = StdRng::seed_from_u64(4);
    // Inputs kept away from ReLU's kink at 0 by the offset
    let base = rand_tensor((2, 6), &mut rng);
    let x = base.map(|v| v + if v >= 0.0 { 0.5 } else { -0.5 });

    check_layer(&mut ReLU::new(), &x, &mut rng);
    check_layer(&mut Sigmoid::new(), &x, &mut rng);
    check_layer(&mut Tanh::new(), &x, &mut rng);
    check_layer(&mut Gelu::new(), &x, &mut rng);
    check_layer(&mut LeakyReLU::new(0.1), &x, &mut rng);
    check_layer(&mut Softplus::new(), &x, &mut rng);
    check_layer(&mut Softmax::new(), &x, &mut rng);
}

#[test]
fn gradcheck_conv_nd() {
    let mut rng = StdRng::seed_from_u64(5);
    // 2-D, stride 2 < kernel 3 so output footprints overlap
    let mut layer = ConvND::new(2, 2, vec![3, 3], vec![2, 2], vec![1, 1]).unwrap();
    let x = rand_tensor((2, 2, 5, 5), &mut rng);
    check_layer(&mut layer, &x, &mut rng);
}

#[test]
fn gradcheck_conv_nd_1d() {
    let mut rng = StdRng::seed_from_u64(6);
    let mut layer = ConvND::new(1, 3, vec![3], vec![1], vec![0]).unwrap();
    let x = rand_tensor((2, 1, 6), &mut rng);
    check_layer(&mut layer, &x, &mut rng);
}

#[test]
fn gradcheck_conv_transpose_nd() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut layer = ConvTransposeND::new(2, 2, vec![3, 3], vec![2, 2], vec![1, 1]).unwrap();
    let x = rand_tensor((1, 2, 3, 3), &mut rng);
    check_layer(&mut layer, &x, &mut rng);
}

#[test]
fn gradcheck_avg_pool() {
    let mut rng = StdRng::seed_from_u64(8);
    let mut layer = AvgPoolND::new(vec![2, 2], vec![1, 1], vec![0, 0]).unwrap();
    let x = rand_tensor((2, 2, 4, 4), &mut rng);
    check_layer(&mut layer, &x, &mut rng);
}

#[test]
fn gradcheck_rnn() {
    let mut rng = StdRng::seed_from_u64(9);
    let mut layer = RNN::new(3, 4).unwrap();
    let x = rand_tensor((2, 3, 3), &mut rng);
    check_layer(&mut layer, &x, &mut rng);
}

#[test]
fn gradcheck_lstm() {
    let mut rng = StdRng::seed_from_u64(10);
    let mut layer = LSTM::new(3, 4).unwrap();
    let x = rand_tensor((2, 3, 3), &mut rng);
    check_layer(&mut layer, &x, &mut rng);
}

#[test]
fn gradcheck_gru() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut layer = GRU::new(3, 4).unwrap();
    let x = rand_tensor((2, 3, 3), &mut rng);
    check_layer(&mut layer, &x, &mut rng);
}

#[test]
fn gradcheck_self_attention() {
    let mut rng = StdRng::seed_from_u64(12);
    let mut layer = MultiHeadAttention::new(4, 2).unwrap();
    let x = rand_tensor((2, 3, 4), &mut rng);
    check_layer(&mut layer, &x, &mut rng);
}

#[test]
fn gradcheck_causal_self_attention() {
    let mut rng = StdRng::seed_from_u64(13);
    let mut layer = MultiHeadAttention::new(4, 2).unwrap().with_causal(true);
    let x = rand_tensor((1, 4, 4), &mut rng);
    check_layer(&mut layer, &x, &mut rng);
}

#[test]
fn gradcheck_cross_attention() {
    let mut rng = StdRng::seed_from_u64(14);
    let mut attn = MultiHeadAttention::new(4, 2).unwrap();
    let q = rand_tensor((1, 3, 4), &mut rng);
    let kv = rand_tensor((1, 5, 4), &mut rng);

    let y = attn.forward_cross(&q, &kv).unwrap();
    let seed = rand_vec(y.elem_count(), &mut rng);
    let grad_out = Tensor::from_vec(seed.clone(), y.shape().clone()).unwrap();
    let (d_query, d_context) = attn.backward_cross(&grad_out).unwrap();
    let param_grads: Vec<Vec<f64>> = attn
        .parameters()
        .iter()
        .map(|p| p.grad.data().to_vec())
        .collect();

    let mut eval = |attn: &mut MultiHeadAttention, q: &Tensor, kv: &Tensor| -> f64 {
        let y = attn.forward_cross(q, kv).unwrap();
        y.data().iter().zip(seed.iter()).map(|(a, b)| a * b).sum()
    };

    // Query-side input gradient
    for i in 0..q.elem_count() {
        let mut p = q.clone();
        p.data_mut()[i] += EPS;
        let fp = eval(&mut attn, &p, &kv);
        let mut m = q.clone();
        m.data_mut()[i] -= EPS;
        let fm = eval(&mut attn, &m, &kv);
        assert_close(
            d_query.data()[i],
            (fp - fm) / (2.0 * EPS),
            &format!("query[{}]", i),
        );
    }

    // Key/value-side (encoder) input gradient
    for i in 0..kv.elem_count() {
        let mut p = kv.clone();
        p.data_mut()[i] += EPS;
        let fp = eval(&mut attn, &q, &p);
        let mut m = kv.clone();
        m.data_mut()[i] -= EPS;
        let fm = eval(&mut attn, &q, &m);
        assert_close(
            d_context.data()[i],
            (fp - fm) / (2.0 * EPS),
            &format!("context[{}]", i),
        );
    }

    // Parameter gradients
    for (pi, grads) in param_grads.iter().enumerate() {
        for (j, &analytic) in grads.iter().enumerate() {
            nudge_param(&mut attn, pi, j, EPS);
            let fp = eval(&mut attn, &q, &kv);
            nudge_param(&mut attn, pi, j, -2.0 * EPS);
            let fm = eval(&mut attn, &q, &kv);
            nudge_param(&mut attn, pi, j, EPS);
            assert_close(
                analytic,
                (fp - fm) / (2.0 * EPS),
                &format!("param[{}][{}]", pi, j),
            );
        }
    }
}

#[test]
fn gradcheck_encoder_block() {
    let mut rng = StdRng::seed_from_u64(15);
    let mut layer = TransformerEncoder::new(4, 2, 6).unwrap();
    let x = rand_tensor((1, 3, 4), &mut rng);
    check_layer(&mut layer, &x, &mut rng);
}

#[test]
fn gradcheck_decoder_block() {
    let mut rng = StdRng::seed_from_u64(16);
    let mut block = TransformerDecoder::new(4, 2, 6).unwrap();
    let x = rand_tensor((1, 3, 4), &mut rng);
    let enc = rand_tensor((1, 4, 4), &mut rng);

    let y = block.forward(&x, &enc).unwrap();
    let seed = rand_vec(y.elem_count(), &mut rng);
    let grad_out = Tensor::from_vec(seed.clone(), y.shape().clone()).unwrap();
    let (d_x, d_enc) = block.backward(&grad_out).unwrap();

    let mut eval = |block: &mut TransformerDecoder, x: &Tensor, enc: &Tensor| -> f64 {
        let y = block.forward(x, enc).unwrap();
        y.data().iter().zip(seed.iter()).map(|(a, b)| a * b).sum()
    };

    for i in 0..x.elem_count() {
        let mut p = x.clone();
        p.data_mut()[i] += EPS;
        let fp = eval(&mut block, &p, &enc);
        let mut m = x.clone();
        m.data_mut()[i] -= EPS;
        let fm = eval(&mut block, &m, &enc);
        assert_close(
            d_x.data()[i],
            (fp - fm) / (2.0 * EPS),
            &format!("decoder input[{}]", i),
        );
    }

    // The encoder-side gradient must cover the cross-attention path
    for i in 0..enc.elem_count() {
        let mut p = enc.clone();
        p.data_mut()[i] += EPS;
        let fp = eval(&mut block, &x, &p);
        let mut m = enc.clone();
        m.data_mut()[i] -= EPS;
        let fm = eval(&mut block, &x, &m);
        assert_close(
            d_enc.data()[i],
            (fp - fm) / (2.0 * EPS),
            &format!("encoder out[{}]", i),
        );
    }
}

#[test]
fn gradcheck_cross_entropy() {
    let mut rng = StdRng::seed_from_u64(17);
    let logits = rand_tensor((3, 4), &mut rng);
    let targets = [2usize, 0, 3];

    let mut loss = CrossEntropyLoss::new();
    loss.forward(&logits, &targets).unwrap();
    let grad = loss.backward().unwrap();

    for i in 0..logits.elem_count() {
        let mut p = logits.clone();
        p.data_mut()[i] += EPS;
        let fp = loss.forward(&p, &targets).unwrap().data()[0];
        let mut m = logits.clone();
        m.data_mut()[i] -= EPS;
        let fm = loss.forward(&m, &targets).unwrap().data()[0];
        assert_close(
            grad.data()[i],
            (fp - fm) / (2.0 * EPS),
            &format!("logits[{}]", i),
        );
    }
}

#[test]
fn gradcheck_embedding_weights() {
    let mut rng = StdRng::seed_from_u64(18);
    let mut emb = Embedding::new(5, 3).unwrap();
    let idx = Tensor::from_vec(vec![1.0, 4.0, 1.0], (3,)).unwrap();

    let y = emb.forward(&idx).unwrap();
    let seed = rand_vec(y.elem_count(), &mut rng);
    let grad_out = Tensor::from_vec(seed.clone(), y.shape().clone()).unwrap();
    emb.backward(&grad_out).unwrap();
    let analytic = emb.parameters()[0].grad.data().to_vec();

    let mut nudge = |emb: &mut Embedding, j: usize, delta: f64| {
        let mut params = emb.parameters();
        params[0].value.data_mut()[j] += delta;
    };

    for j in 0..analytic.len() {
        nudge(&mut emb, j, EPS);
        let yp = emb.forward(&idx).unwrap();
        let fp: f64 = yp.data().iter().zip(seed.iter()).map(|(a, b)| a * b).sum();
        nudge(&mut emb, j, -2.0 * EPS);
        let ym = emb.forward(&idx).unwrap();
        let fm: f64 = ym.data().iter().zip(seed.iter()).map(|(a, b)| a * b).sum();
        nudge(&mut emb, j, EPS);
        assert_close(
            analytic[j],
            (fp - fm) / (2.0 * EPS),
            &format!("embedding weight[{}]", j),
        );
    }
}
