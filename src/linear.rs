// linear.rs
// ============================================================================
// Hinweis: Dichte Schicht ueber Param. Initialisierung Normal(0,
//          sqrt(2/fan_in)), Bias null. Der Backward bekommt die gecachte
//          Eingabe explizit uebergeben.
// ============================================================================

use bincode::{Decode, Encode};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::adam::Param;

#[derive(Clone, Serialize, Deserialize, Encode, Decode)]
pub struct Linear {
    pub w: Param, // [in, out]
    pub b: Param, // [1, out]
}

impl Linear {
    pub fn new(in_dim: usize, out_dim: usize, rng: &mut StdRng) -> Self {
        let std = (2.0 / in_dim as f32).sqrt();
        let normal = Normal::new(0.0, std).expect("ungueltige Normalverteilung");
        Linear {
            w: Param::new(Array2::from_shape_fn((in_dim, out_dim), |_| normal.sample(rng))),
            b: Param::new(Array2::zeros((1, out_dim))),
        }
    }

    pub fn forward(&self, input: &Array2<f32>) -> Array2<f32> {
        input.dot(&self.w.w) + &self.b.w
    }

    /// Sammelt Parametergradienten und liefert dL/dInput.
    pub fn backward(&mut self, input: &Array2<f32>, grads: &Array2<f32>) -> Array2<f32> {
        self.w.accumulate(&input.t().dot(grads));
        self.b.accumulate(&grads.sum_axis(Axis(0)).insert_axis(Axis(0)));
        grads.dot(&self.w.w.t())
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.w, &mut self.b]
    }

    pub fn parameter_count(&self) -> usize {
        self.w.parameter_count() + self.b.parameter_count()
    }
}
