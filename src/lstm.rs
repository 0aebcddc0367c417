// lstm.rs
// ============================================================================
// Hinweis: LSTM-Zelle mit fusionierten Gattern [i|f|g|o] in je einer
//          [D,4H]- und [H,4H]-Matrix. step() liefert einen expliziten
//          Cache, backward_step() rechnet einen BPTT-Schritt zurueck und
//          sammelt Parametergradienten im jeweiligen Puffer.
// ============================================================================

use bincode::{Decode, Encode};
use ndarray::{concatenate, s, Array2, Axis};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::adam::Param;
use crate::math::sigmoid;

#[derive(Clone, Serialize, Deserialize, Encode, Decode)]
pub struct LstmCell {
    pub w_ih: Param, // [input_dim, 4H]
    pub w_hh: Param, // [H, 4H]
    pub b: Param,    // [1, 4H]
    pub hidden: usize,
}

/// Zwischenergebnisse eines Schritts. Eingaben und Zustaende gehoeren dem
/// Aufrufer und wandern per Wert von Schritt zu Schritt, nie ueber Aliase.
pub struct LstmStepCache {
    pub x: Array2<f32>,      // [B, D]
    pub h_prev: Array2<f32>, // [B, H]
    pub c_prev: Array2<f32>, // [B, H]
    pub i: Array2<f32>,
    pub f: Array2<f32>,
    pub g: Array2<f32>,
    pub o: Array2<f32>,
    pub c: Array2<f32>,
    pub h: Array2<f32>,
}

impl LstmCell {
    pub fn new(input_dim: usize, hidden: usize, rng: &mut StdRng) -> Self {
        let std = (1.0 / hidden as f32).sqrt();
        let normal = Normal::new(0.0, std).expect("ungueltige Normalverteilung");
        let mut b = Array2::<f32>::zeros((1, 4 * hidden));
        // Forget-Gate-Bias auf 1: Zellzustaende bleiben anfangs erhalten
        b.slice_mut(s![0, hidden..2 * hidden]).fill(1.0);
        LstmCell {
            w_ih: Param::new(Array2::from_shape_fn((input_dim, 4 * hidden), |_| {
                normal.sample(rng)
            })),
            w_hh: Param::new(Array2::from_shape_fn((hidden, 4 * hidden), |_| {
                normal.sample(rng)
            })),
            b: Param::new(b),
            hidden,
        }
    }

    /// Ein Rekurrenzschritt fuer einen Batch von Zeilen.
    pub fn step(&self, x: &Array2<f32>, h_prev: &Array2<f32>, c_prev: &Array2<f32>) -> LstmStepCache {
        let hsz = self.hidden;
        let gates = x.dot(&self.w_ih.w) + h_prev.dot(&self.w_hh.w) + &self.b.w;
        let i = gates.slice(s![.., 0..hsz]).mapv(sigmoid);
        let f = gates.slice(s![.., hsz..2 * hsz]).mapv(sigmoid);
        let g = gates.slice(s![.., 2 * hsz..3 * hsz]).mapv(f32::tanh);
        let o = gates.slice(s![.., 3 * hsz..4 * hsz]).mapv(sigmoid);
        let c = &f * c_prev + &i * &g;
        let h = &o * &c.mapv(f32::tanh);
        LstmStepCache {
            x: x.clone(),
            h_prev: h_prev.clone(),
            c_prev: c_prev.clone(),
            i,
            f,
            g,
            o,
            c,
            h,
        }
    }

    /// BPTT fuer einen Schritt. dh und dc beziehen sich auf die Ausgaben
    /// h und c des Schritts; zurueck kommen (dx, dh_prev, dc_prev).
    pub fn backward_step(
        &mut self,
        cache: &LstmStepCache,
        dh: &Array2<f32>,
        dc: &Array2<f32>,
    ) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
        let tanh_c = cache.c.mapv(f32::tanh);
        let one_minus_tanh2 = tanh_c.mapv(|t| 1.0 - t * t);

        let d_o = dh * &tanh_c;
        let dc_total = dc + &(dh * &cache.o * &one_minus_tanh2);

        let d_i = &dc_total * &cache.g;
        let d_f = &dc_total * &cache.c_prev;
        let d_g = &dc_total * &cache.i;
        let dc_prev = &dc_total * &cache.f;

        // Sigmoid- bzw. Tanh-Ableitungen auf die Vor-Aktivierungen
        let da_i = &d_i * &cache.i * &cache.i.mapv(|v| 1.0 - v);
        let da_f = &d_f * &cache.f * &cache.f.mapv(|v| 1.0 - v);
        let da_g = &d_g * &cache.g.mapv(|v| 1.0 - v * v);
        let da_o = &d_o * &cache.o * &cache.o.mapv(|v| 1.0 - v);

        let da = concatenate(
            Axis(1),
            &[da_i.view(), da_f.view(), da_g.view(), da_o.view()],
        )
        .expect("Gate-Gradienten passen nicht zusammen");

        self.w_ih.accumulate(&cache.x.t().dot(&da));
        self.w_hh.accumulate(&cache.h_prev.t().dot(&da));
        self.b.accumulate(&da.sum_axis(Axis(0)).insert_axis(Axis(0)));

        let dx = da.dot(&self.w_ih.w.t());
        let dh_prev = da.dot(&self.w_hh.w.t());
        (dx, dh_prev, dc_prev)
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.w_ih, &mut self.w_hh, &mut self.b]
    }

    pub fn parameter_count(&self) -> usize {
        self.w_ih.parameter_count() + self.w_hh.parameter_count() + self.b.parameter_count()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::Rng;
    use rand::SeedableRng;

    use super::*;

    fn random_matrix(rng: &mut StdRng, shape: (usize, usize)) -> Array2<f32> {
        Array2::from_shape_fn(shape, |_| rng.random::<f32>() - 0.5)
    }

    #[test]
    fn step_haelt_die_formen_ein() {
        let mut rng = StdRng::seed_from_u64(3);
        let cell = LstmCell::new(5, 4, &mut rng);
        let x = random_matrix(&mut rng, (2, 5));
        let h = Array2::zeros((2, 4));
        let c = Array2::zeros((2, 4));
        let cache = cell.step(&x, &h, &c);
        assert_eq!(cache.h.dim(), (2, 4));
        assert_eq!(cache.c.dim(), (2, 4));
        // Gates sind beschraenkt
        assert!(cache.i.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!(cache.g.iter().all(|&v| (-1.0..=1.0).contains(&v)));
    }

    // L = sum(h) + sum(c); Finite-Differenzen-Pruefung der Parameter- und
    // Eingabegradienten eines einzelnen Schritts.
    #[test]
    fn backward_step_stimmt_mit_finiter_differenz() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut cell = LstmCell::new(3, 4, &mut rng);
        let x = random_matrix(&mut rng, (2, 3));
        let h0 = random_matrix(&mut rng, (2, 4));
        let c0 = random_matrix(&mut rng, (2, 4));

        let loss = |cell: &LstmCell, x: &Array2<f32>| {
            let cache = cell.step(x, &h0, &c0);
            cache.h.sum() + cache.c.sum()
        };

        let cache = cell.step(&x, &h0, &c0);
        let ones = Array2::from_elem((2, 4), 1.0f32);
        let (dx, _, _) = cell.backward_step(&cache, &ones, &ones);

        let eps = 1e-2f32;
        for &(r, c) in &[(0usize, 0usize), (1, 5), (2, 11)] {
            let orig = cell.w_ih.w[(r, c)];
            cell.w_ih.w[(r, c)] = orig + eps;
            let lp = loss(&cell, &x);
            cell.w_ih.w[(r, c)] = orig - eps;
            let lm = loss(&cell, &x);
            cell.w_ih.w[(r, c)] = orig;
            let numeric = (lp - lm) / (2.0 * eps);
            assert_relative_eq!(
                cell.w_ih.grad[(r, c)],
                numeric,
                epsilon = 2e-2,
                max_relative = 0.05
            );
        }

        for &(r, c) in &[(0usize, 1usize), (1, 2)] {
            let mut xp = x.clone();
            xp[(r, c)] += eps;
            let lp = loss(&cell, &xp);
            let mut xm = x.clone();
            xm[(r, c)] -= eps;
            let lm = loss(&cell, &xm);
            let numeric = (lp - lm) / (2.0 * eps);
            assert_relative_eq!(dx[(r, c)], numeric, epsilon = 2e-2, max_relative = 0.05);
        }
    }
}
