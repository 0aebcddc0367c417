// math.rs
// ============================================================================
// Hinweis: Numerik-Bausteine: Softmax und Log-Softmax (1-D, der Decoder
//          arbeitet schrittweise), Softmax-Backward, Cross-Entropy je
//          Schritt, Argmax und L2-Gradienten-Clipping.
// ============================================================================

use ndarray::{Array1, Array2};

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Numerisch stabiler Softmax ueber einen Vektor.
pub fn softmax_1d(logits: &Array1<f32>) -> Array1<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut out = logits.mapv(|x| (x - max).exp());
    let sum: f32 = out.sum();
    if sum > 0.0 {
        out.mapv_inplace(|x| x / sum);
    }
    out
}

pub fn log_softmax_1d(logits: &Array1<f32>) -> Array1<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = logits.iter().map(|&x| (x - max).exp()).sum::<f32>().ln();
    logits.mapv(|x| x - max - log_sum)
}

/// dL/dLogits aus der Softmax-Ausgabe y und dL/dy.
pub fn softmax_backward_1d(y: &Array1<f32>, dy: &Array1<f32>) -> Array1<f32> {
    let dot: f32 = y.iter().zip(dy.iter()).map(|(&a, &b)| a * b).sum();
    Array1::from_iter(y.iter().zip(dy.iter()).map(|(&a, &b)| a * (b - dot)))
}

/// Cross-Entropy eines Schritts: -ln p[target]; p ist Softmax-normiert.
pub fn cross_entropy_step(probs: &Array1<f32>, target: usize) -> f32 {
    -probs[target].max(1e-15).ln()
}

/// dL/dLogits fuer Softmax + Cross-Entropy eines Schritts: p - onehot.
pub fn cross_entropy_grad_step(probs: &Array1<f32>, target: usize) -> Array1<f32> {
    let mut g = probs.clone();
    g[target] -= 1.0;
    g
}

/// Index des groessten Eintrags; bei Gleichstand gewinnt der erste.
pub fn argmax_1d(v: &Array1<f32>) -> usize {
    let mut best_idx = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &val) in v.iter().enumerate() {
        if val > best_val {
            best_val = val;
            best_idx = i;
        }
    }
    best_idx
}

/// Skaliert die Matrix herunter, falls ihre L2-Norm max_norm uebersteigt.
pub fn clip_gradients(grads: &mut Array2<f32>, max_norm: f32) {
    let norm = grads.iter().map(|&g| g * g).sum::<f32>().sqrt();
    if norm > max_norm && norm > 0.0 {
        let scale = max_norm / norm;
        grads.mapv_inplace(|g| g * scale);
    }
}
