// adam.rs
// ============================================================================
// Hinweis: Adam-Optimierer plus Param: Gewichtsmatrix mit Gradientenpuffer
//          und eigenem Optimiererzustand. Gradienten sammeln sich ueber
//          einen Minibatch an; step() clippt, wendet genau eine
//          Aktualisierung an und leert den Puffer.
// ============================================================================

use bincode::{Decode, Encode};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

use crate::math::clip_gradients;

const GRAD_CLIP_NORM: f32 = 5.0;

#[derive(Clone, Serialize, Deserialize, Encode, Decode)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    timestep: usize,
    #[bincode(with_serde)]
    m: Array2<f32>,
    #[bincode(with_serde)]
    v: Array2<f32>,
}

impl Adam {
    pub fn new(shape: (usize, usize)) -> Self {
        Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            timestep: 0,
            m: Array2::zeros(shape),
            v: Array2::zeros(shape),
        }
    }

    /// Ein Adam-Schritt mit Bias-Korrektur.
    pub fn step(&mut self, params: &mut Array2<f32>, grads: &Array2<f32>, lr: f32) {
        self.timestep += 1;
        let t = self.timestep as i32;
        let b1 = self.beta1;
        let b2 = self.beta2;

        Zip::from(&mut self.m)
            .and(grads)
            .for_each(|m, &g| *m = b1 * *m + (1.0 - b1) * g);
        Zip::from(&mut self.v)
            .and(grads)
            .for_each(|v, &g| *v = b2 * *v + (1.0 - b2) * g * g);

        let bias_c1 = 1.0 - b1.powi(t);
        let bias_c2 = 1.0 - b2.powi(t);

        Zip::from(params)
            .and(&self.m)
            .and(&self.v)
            .for_each(|w, &m, &v| {
                let m_hat = m / bias_c1;
                let v_hat = v / bias_c2;
                *w -= lr * m_hat / (v_hat.sqrt() + self.epsilon);
            });
    }
}

/// Lernbarer Parameter: Gewichte, Gradientenpuffer, Optimiererzustand.
#[derive(Clone, Serialize, Deserialize, Encode, Decode)]
pub struct Param {
    #[bincode(with_serde)]
    pub w: Array2<f32>,
    #[bincode(with_serde)]
    pub grad: Array2<f32>,
    pub opt: Adam,
}

impl Param {
    pub fn new(w: Array2<f32>) -> Self {
        let dim = w.dim();
        Param {
            w,
            grad: Array2::zeros(dim),
            opt: Adam::new(dim),
        }
    }

    /// Akkumuliert einen Beitrag in den Gradientenpuffer.
    pub fn accumulate(&mut self, grad: &Array2<f32>) {
        self.grad += grad;
    }

    /// Clippt den gesammelten Gradienten, wendet einen Adam-Schritt an und
    /// leert den Puffer. Genau ein Aufruf pro Minibatch.
    pub fn step(&mut self, lr: f32) {
        clip_gradients(&mut self.grad, GRAD_CLIP_NORM);
        let grads = std::mem::replace(&mut self.grad, Array2::zeros(self.w.dim()));
        self.opt.step(&mut self.w, &grads, lr);
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    pub fn parameter_count(&self) -> usize {
        self.w.len()
    }
}
