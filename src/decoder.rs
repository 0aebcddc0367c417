// decoder.rs
// ============================================================================
// Hinweis: Attention-Decoder als Zustandsautomat ueber Einzelschritte:
//          LSTM-Schritt, rohes Skalarprodukt-Alignment gegen die (auf die
//          echte Laenge zugeschnittenen) Encoder-Ausgaben, Softmax,
//          Kontextvektor als Konvexkombination, Konkatenation [h; ctx],
//          Projektion auf das Ausgabevokabular. Terminierung (EOS oder
//          Schrittlimit) steuert der Aufrufer.
// ============================================================================

use bincode::{Decode, Encode};
use ndarray::{concatenate, s, Array1, Array2, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::adam::Param;
use crate::linear::Linear;
use crate::lstm::{LstmCell, LstmStepCache};
use crate::math::{softmax_1d, softmax_backward_1d};

#[derive(Clone, Serialize, Deserialize, Encode, Decode)]
pub struct AttentionDecoder {
    pub cell: LstmCell, // emb_dim -> H
    pub w_out: Linear,  // [2H, vocab]
    pub hidden: usize,
}

/// Cache eines Decoder-Schritts fuer den Backward-Pass.
pub struct DecoderStepCache {
    pub lstm: LstmStepCache,
    /// Softmax-Gewichte ueber die Encoder-Positionen.
    pub attn: Array1<f32>,
    pub concat: Array2<f32>, // [1, 2H]
}

fn outer(a: &Array1<f32>, b: &Array1<f32>) -> Array2<f32> {
    let a2 = a.view().insert_axis(Axis(1));
    let b2 = b.view().insert_axis(Axis(0));
    a2.dot(&b2)
}

impl AttentionDecoder {
    pub fn new(emb_dim: usize, hidden: usize, vocab_size: usize, rng: &mut StdRng) -> Self {
        AttentionDecoder {
            cell: LstmCell::new(emb_dim, hidden, rng),
            w_out: Linear::new(2 * hidden, vocab_size, rng),
            hidden,
        }
    }

    /// Ein Decoder-Schritt. x_emb ist das eingebettete vorige Token [1, D],
    /// enc_outs sind die Encoder-Ausgaben eines Beispiels [L, H].
    pub fn step(
        &self,
        x_emb: &Array2<f32>,
        h: &Array2<f32>,
        c: &Array2<f32>,
        enc_outs: &Array2<f32>,
    ) -> (Array2<f32>, DecoderStepCache) {
        let lstm = self.cell.step(x_emb, h, c);
        let u = lstm.h.row(0).to_owned(); // [H]
        let scores = enc_outs.dot(&u); // [L]
        let attn = softmax_1d(&scores);
        let ctx = enc_outs.t().dot(&attn); // [H]
        let concat = concatenate(Axis(0), &[u.view(), ctx.view()])
            .expect("Zustand und Kontext passen nicht zusammen")
            .insert_axis(Axis(0)); // [1, 2H]
        let logits = self.w_out.forward(&concat); // [1, vocab]
        (logits, DecoderStepCache { lstm, attn, concat })
    }

    /// Backward eines Schritts. dh_next/dc_next stammen aus dem folgenden
    /// Decoder-Schritt. Rueckgabe: (dx_emb, dh_prev, dc_prev, d_enc_outs).
    pub fn backward_step(
        &mut self,
        cache: &DecoderStepCache,
        enc_outs: &Array2<f32>,
        d_logits: &Array2<f32>,
        dh_next: &Array2<f32>,
        dc_next: &Array2<f32>,
    ) -> (Array2<f32>, Array2<f32>, Array2<f32>, Array2<f32>) {
        let hsz = self.hidden;
        let d_concat = self.w_out.backward(&cache.concat, d_logits); // [1, 2H]
        let du_direct = d_concat.slice(s![0, 0..hsz]).to_owned();
        let d_ctx = d_concat.slice(s![0, hsz..2 * hsz]).to_owned();

        // ctx = enc^T attn  =>  d_attn = enc d_ctx,  d_enc += attn (x) d_ctx
        let d_attn = enc_outs.dot(&d_ctx);
        let d_scores = softmax_backward_1d(&cache.attn, &d_attn);

        // scores = enc u  =>  d_enc += d_scores (x) u,  du += enc^T d_scores
        let u = cache.lstm.h.row(0).to_owned();
        let d_enc = outer(&d_scores, &u) + outer(&cache.attn, &d_ctx);
        let du_attn = enc_outs.t().dot(&d_scores);

        let dh_total = (du_direct + du_attn).insert_axis(Axis(0)) + dh_next;
        let (dx, dh_prev, dc_prev) = self.cell.backward_step(&cache.lstm, &dh_total, dc_next);
        (dx, dh_prev, dc_prev, d_enc)
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.cell.params_mut();
        params.extend(self.w_out.params_mut());
        params
    }

    pub fn parameter_count(&self) -> usize {
        self.cell.parameter_count() + self.w_out.parameter_count()
    }
}
