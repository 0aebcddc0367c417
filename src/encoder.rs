// encoder.rs
// ============================================================================
// Hinweis: Batch-Encoder ueber variable Sequenzlaengen. Die Rekurrenz wird
//          pro Position maskiert: Zeilen hinter ihrer echten Laenge behalten
//          Hidden- und Zellzustand, Padding erzeugt weder Zustaende noch
//          Gradienten. Die Laengen duerfen in beliebiger Reihenfolge
//          stehen, die Zeilenordnung der Ausgaben entspricht der Eingabe.
//          Optional bidirektional: zweite Zelle ueber die je Zeile
//          umgedrehten Praefixe, Positionsausgaben beider Richtungen werden
//          summiert, die Endzustaende ueber zwei gelernte lineare
//          Reduktionen von 2H auf H gebracht.
// ============================================================================

use bincode::{Decode, Encode};
use ndarray::{concatenate, s, Array2, Array3, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::adam::Param;
use crate::linear::Linear;
use crate::lstm::{LstmCell, LstmStepCache};

#[derive(Clone, Serialize, Deserialize, Encode, Decode)]
pub struct RnnEncoder {
    pub fwd: LstmCell,
    pub bwd: Option<LstmCell>,
    pub reduce_h: Option<Linear>, // [2H -> H]
    pub reduce_c: Option<Linear>, // [2H -> H]
    pub hidden: usize,
}

/// Ergebnis eines Encoder-Laufs.
pub struct EncoderOutput {
    /// [B, T, H]; Padding-Positionen sind exakt null.
    pub outputs: Array3<f32>,
    /// [B, T], 1 = echtes Token. Wird je Batch neu abgeleitet.
    pub context_mask: Array2<f32>,
    pub h: Array2<f32>, // [B, H] finaler Hidden-Zustand
    pub c: Array2<f32>, // [B, H] finaler Zellzustand
}

/// Laufzeit-Cache fuer den Backward-Pass.
pub struct EncoderCache {
    dir_fwd: DirectionCache,
    dir_bwd: Option<DirectionCache>,
    concat_h: Option<Array2<f32>>, // [B, 2H] vor der Reduktion
    concat_c: Option<Array2<f32>>,
    lens: Vec<usize>,
}

struct DirectionCache {
    steps: Vec<LstmStepCache>,
}

/// [B, 1]-Maske: 1, solange Position t vor der echten Laenge liegt.
fn step_mask(lens: &[usize], t: usize) -> Array2<f32> {
    Array2::from_shape_fn((lens.len(), 1), |(i, _)| if t < lens[i] { 1.0 } else { 0.0 })
}

/// Dreht je Zeile den gueltigen Praefix um; Padding bleibt, wo es ist.
/// Die Funktion ist ihre eigene Umkehrung.
fn reverse_rows(x: &Array3<f32>, lens: &[usize]) -> Array3<f32> {
    let mut out = Array3::zeros(x.raw_dim());
    for (i, &len) in lens.iter().enumerate() {
        for t in 0..len {
            out.slice_mut(s![i, t, ..]).assign(&x.slice(s![i, len - 1 - t, ..]));
        }
    }
    out
}

fn run_direction(
    cell: &LstmCell,
    emb: &Array3<f32>,
    lens: &[usize],
) -> (Array3<f32>, Array2<f32>, Array2<f32>, DirectionCache) {
    let (bsz, t_max, _) = emb.dim();
    let hsz = cell.hidden;
    let mut h = Array2::<f32>::zeros((bsz, hsz));
    let mut c = Array2::<f32>::zeros((bsz, hsz));
    let mut outputs = Array3::<f32>::zeros((bsz, t_max, hsz));
    let mut steps = Vec::with_capacity(t_max);

    for t in 0..t_max {
        let x_t = emb.slice(s![.., t, ..]).to_owned();
        let cache = cell.step(&x_t, &h, &c);
        let m = step_mask(lens, t);
        let inv_m = m.mapv(|v| 1.0 - v);
        // maskierte Uebernahme: fertige Zeilen behalten ihren Zustand
        h = &cache.h * &m + &h * &inv_m;
        c = &cache.c * &m + &c * &inv_m;
        outputs.slice_mut(s![.., t, ..]).assign(&(&cache.h * &m));
        steps.push(cache);
    }
    (outputs, h, c, DirectionCache { steps })
}

fn backward_direction(
    cell: &mut LstmCell,
    cache: &DirectionCache,
    lens: &[usize],
    d_outputs: &Array3<f32>,
    dh_fin: &Array2<f32>,
    dc_fin: &Array2<f32>,
) -> Array3<f32> {
    let t_max = cache.steps.len();
    let bsz = dh_fin.nrows();
    let in_dim = cell.w_ih.w.nrows();
    let mut dh = dh_fin.clone();
    let mut dc = dc_fin.clone();
    let mut d_emb = Array3::<f32>::zeros((bsz, t_max, in_dim));

    for t in (0..t_max).rev() {
        let m = step_mask(lens, t);
        let inv_m = m.mapv(|v| 1.0 - v);
        let d_out_t = d_outputs.slice(s![.., t, ..]).to_owned();
        // Gradient fliesst nur in Zeilen, die in Schritt t aktiv waren
        let dh_new = (&dh + &d_out_t) * &m;
        let dc_new = &dc * &m;
        let (dx, dh_prev, dc_prev) = cell.backward_step(&cache.steps[t], &dh_new, &dc_new);
        d_emb.slice_mut(s![.., t, ..]).assign(&dx);
        dh = dh_prev + &dh * &inv_m;
        dc = dc_prev + &dc * &inv_m;
    }
    d_emb
}

impl RnnEncoder {
    pub fn new(emb_dim: usize, hidden: usize, bidirect: bool, rng: &mut StdRng) -> Self {
        let fwd = LstmCell::new(emb_dim, hidden, rng);
        let bwd = if bidirect { Some(LstmCell::new(emb_dim, hidden, rng)) } else { None };
        let reduce_h = if bidirect { Some(Linear::new(2 * hidden, hidden, rng)) } else { None };
        let reduce_c = if bidirect { Some(Linear::new(2 * hidden, hidden, rng)) } else { None };
        RnnEncoder { fwd, bwd, reduce_h, reduce_c, hidden }
    }

    /// Verarbeitet einen gepolsterten Batch eingebetteter Eingaben.
    pub fn forward(&self, emb: &Array3<f32>, lens: &[usize]) -> (EncoderOutput, EncoderCache) {
        let (bsz, t_max, _) = emb.dim();
        assert_eq!(bsz, lens.len(), "Laengenvektor passt nicht zum Batch");
        debug_assert!(lens.iter().all(|&l| l <= t_max));

        let (out_f, h_f, c_f, cache_f) = run_direction(&self.fwd, emb, lens);
        let context_mask = Array2::from_shape_fn((bsz, t_max), |(i, j)| {
            if j < lens[i] { 1.0 } else { 0.0 }
        });

        match &self.bwd {
            None => (
                EncoderOutput { outputs: out_f, context_mask, h: h_f, c: c_f },
                EncoderCache {
                    dir_fwd: cache_f,
                    dir_bwd: None,
                    concat_h: None,
                    concat_c: None,
                    lens: lens.to_vec(),
                },
            ),
            Some(bwd) => {
                let emb_rev = reverse_rows(emb, lens);
                let (out_b_rev, h_b, c_b, cache_b) = run_direction(bwd, &emb_rev, lens);
                let out_b = reverse_rows(&out_b_rev, lens);
                // Summe statt Konkatenation: das Alignment bleibt H-breit
                let outputs = out_f + out_b;

                let concat_h = concatenate(Axis(1), &[h_f.view(), h_b.view()])
                    .expect("Endzustaende passen nicht zusammen");
                let concat_c = concatenate(Axis(1), &[c_f.view(), c_b.view()])
                    .expect("Zellzustaende passen nicht zusammen");
                let h = self.reduce_h.as_ref().expect("reduce_h fehlt").forward(&concat_h);
                let c = self.reduce_c.as_ref().expect("reduce_c fehlt").forward(&concat_c);

                (
                    EncoderOutput { outputs, context_mask, h, c },
                    EncoderCache {
                        dir_fwd: cache_f,
                        dir_bwd: Some(cache_b),
                        concat_h: Some(concat_h),
                        concat_c: Some(concat_c),
                        lens: lens.to_vec(),
                    },
                )
            }
        }
    }

    /// Vollstaendiger BPTT-Backward. d_outputs ist der Gradient auf die
    /// Positionsausgaben, dh_fin/dc_fin auf die finalen Zustaende.
    /// Rueckgabe: Gradient auf die eingebetteten Eingaben [B, T, D].
    pub fn backward(
        &mut self,
        cache: &EncoderCache,
        d_outputs: &Array3<f32>,
        dh_fin: &Array2<f32>,
        dc_fin: &Array2<f32>,
    ) -> Array3<f32> {
        let lens = &cache.lens;
        match (&mut self.bwd, &cache.dir_bwd) {
            (None, None) => {
                backward_direction(&mut self.fwd, &cache.dir_fwd, lens, d_outputs, dh_fin, dc_fin)
            }
            (Some(bwd), Some(cache_b)) => {
                let hsz = self.hidden;
                let concat_h = cache.concat_h.as_ref().expect("Cache ohne concat_h");
                let concat_c = cache.concat_c.as_ref().expect("Cache ohne concat_c");
                let d_concat_h =
                    self.reduce_h.as_mut().expect("reduce_h fehlt").backward(concat_h, dh_fin);
                let d_concat_c =
                    self.reduce_c.as_mut().expect("reduce_c fehlt").backward(concat_c, dc_fin);
                let dh_f = d_concat_h.slice(s![.., 0..hsz]).to_owned();
                let dh_b = d_concat_h.slice(s![.., hsz..2 * hsz]).to_owned();
                let dc_f = d_concat_c.slice(s![.., 0..hsz]).to_owned();
                let dc_b = d_concat_c.slice(s![.., hsz..2 * hsz]).to_owned();

                // Summierte Ausgaben: der Gradient geht in beide Richtungen
                let d_emb_f =
                    backward_direction(&mut self.fwd, &cache.dir_fwd, lens, d_outputs, &dh_f, &dc_f);
                let d_out_rev = reverse_rows(d_outputs, lens);
                let d_emb_b_rev =
                    backward_direction(bwd, cache_b, lens, &d_out_rev, &dh_b, &dc_b);
                let d_emb_b = reverse_rows(&d_emb_b_rev, lens);
                d_emb_f + d_emb_b
            }
            _ => panic!("Cache passt nicht zur Encoder-Konfiguration"),
        }
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.fwd.params_mut();
        if let Some(bwd) = &mut self.bwd {
            params.extend(bwd.params_mut());
        }
        if let Some(r) = &mut self.reduce_h {
            params.extend(r.params_mut());
        }
        if let Some(r) = &mut self.reduce_c {
            params.extend(r.params_mut());
        }
        params
    }

    pub fn parameter_count(&self) -> usize {
        self.fwd.parameter_count()
            + self.bwd.as_ref().map_or(0, |c| c.parameter_count())
            + self.reduce_h.as_ref().map_or(0, |l| l.parameter_count())
            + self.reduce_c.as_ref().map_or(0, |l| l.parameter_count())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use rand::Rng;
    use rand::SeedableRng;

    use super::*;

    fn random_emb(rng: &mut StdRng, shape: (usize, usize, usize)) -> Array3<f32> {
        Array3::from_shape_fn(shape, |_| rng.random::<f32>() - 0.5)
    }

    #[test]
    fn kontextmaske_folgt_den_laengen() {
        let mut rng = StdRng::seed_from_u64(8);
        let enc = RnnEncoder::new(3, 4, false, &mut rng);
        let emb = random_emb(&mut rng, (2, 3, 3));
        let (out, _) = enc.forward(&emb, &[1, 3]);
        assert_eq!(out.context_mask.row(0).to_vec(), vec![1.0, 0.0, 0.0]);
        assert_eq!(out.context_mask.row(1).to_vec(), vec![1.0, 1.0, 1.0]);
        // Padding-Positionen der Ausgaben sind exakt null
        assert!(out.outputs.slice(s![0, 1.., ..]).iter().all(|&v| v == 0.0));
    }

    // Unsortierte Laengen: eine kurze Zeile zwischen laengeren. Die Zeile
    // muss denselben Endzustand liefern wie allein encodiert.
    #[test]
    fn maskierte_rekurrenz_entspricht_einzelverarbeitung() {
        let mut rng = StdRng::seed_from_u64(9);
        let enc = RnnEncoder::new(3, 5, false, &mut rng);
        let emb = random_emb(&mut rng, (3, 4, 3));
        let lens = [2usize, 4, 3];
        let (batch_out, _) = enc.forward(&emb, &lens);

        for b in 0..3 {
            let solo = emb.slice(s![b..b + 1, 0..lens[b], ..]).to_owned();
            let (solo_out, _) = enc.forward(&solo, &[lens[b]]);
            for k in 0..5 {
                assert_abs_diff_eq!(batch_out.h[(b, k)], solo_out.h[(0, k)], epsilon = 1e-4);
                assert_abs_diff_eq!(batch_out.c[(b, k)], solo_out.c[(0, k)], epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn bidirektionaler_endzustand_bleibt_h_breit() {
        let mut rng = StdRng::seed_from_u64(10);
        let enc = RnnEncoder::new(3, 6, true, &mut rng);
        let emb = random_emb(&mut rng, (2, 5, 3));
        let (out, _) = enc.forward(&emb, &[5, 2]);
        assert_eq!(out.h.dim(), (2, 6));
        assert_eq!(out.c.dim(), (2, 6));
        assert_eq!(out.outputs.dim(), (2, 5, 6));
    }

    #[test]
    fn reverse_rows_ist_selbstinvers() {
        let mut rng = StdRng::seed_from_u64(12);
        let x = random_emb(&mut rng, (2, 4, 3));
        let lens = [3usize, 4];
        let twice = reverse_rows(&reverse_rows(&x, &lens), &lens);
        for (a, b) in x.iter().zip(twice.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }
}
