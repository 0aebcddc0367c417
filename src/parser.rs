// parser.rs
// ============================================================================
// Hinweis: Seq2Seq-Kern. batch_step() rechnet Teacher-Forcing-Forward und
//          vollstaendigen manuellen Backward fuer einen Minibatch, die
//          Attention laeuft je Beispiel gegen dessen zugeschnittene
//          Encoder-Ausgaben. apply_step() ist der eine Optimiererschritt
//          pro Minibatch. Greedy-Inferenz und bincode-Checkpoints.
// ============================================================================

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind};

use anyhow::{Context, Result};
use bincode::config::standard;
use bincode::{decode_from_std_read, encode_into_std_write, Decode, Encode};
use ndarray::{s, Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::adam::Param;
use crate::batching::Minibatch;
use crate::config::{Mode, ParserConfig};
use crate::data::{Derivation, Example};
use crate::decoder::AttentionDecoder;
use crate::embedding::EmbeddingLayer;
use crate::encoder::RnnEncoder;
use crate::indexer::Indexer;
use crate::math::{argmax_1d, cross_entropy_grad_step, cross_entropy_step, log_softmax_1d, softmax_1d};

/// Gemeinsamer Ausgabevertrag beider Parser: je Testbeispiel eine
/// k-best-Liste von Derivationen (hier stets Laenge 1).
pub trait SemanticParser {
    fn decode(&self, test_data: &[Example]) -> Vec<Vec<Derivation>>;
}

#[derive(Serialize, Deserialize, Encode, Decode)]
pub struct Seq2SeqParser {
    pub config: ParserConfig,
    pub input_indexer: Indexer,
    pub output_indexer: Indexer,
    pub input_emb: EmbeddingLayer,
    pub output_emb: EmbeddingLayer,
    pub encoder: RnnEncoder,
    pub decoder: AttentionDecoder,
}

impl Seq2SeqParser {
    /// Baut ein untrainiertes Modell; Konfigurationsfehler schlagen hier fehl.
    pub fn new(
        config: ParserConfig,
        input_indexer: Indexer,
        output_indexer: Indexer,
        rng: &mut StdRng,
    ) -> Result<Self> {
        config.validate()?;
        let input_emb =
            EmbeddingLayer::new(input_indexer.len(), config.emb_dim, config.emb_dropout, rng);
        let output_emb =
            EmbeddingLayer::new(output_indexer.len(), config.emb_dim, config.emb_dropout, rng);
        let encoder = RnnEncoder::new(config.emb_dim, config.hidden_size, config.bidirect, rng);
        let decoder =
            AttentionDecoder::new(config.emb_dim, config.hidden_size, output_indexer.len(), rng);
        Ok(Seq2SeqParser {
            config,
            input_indexer,
            output_indexer,
            input_emb,
            output_emb,
            encoder,
            decoder,
        })
    }

    /// Ein Trainingsschritt: Teacher-Forcing-Forward plus vollstaendiger
    /// Backward fuer einen Minibatch. Liefert die ueber alle Schritte und
    /// Beispiele summierte Cross-Entropy; Padding-Positionen der Ausgabe
    /// tragen nie zum Verlust bei.
    pub fn batch_step(&mut self, batch: &Minibatch, rng: &mut StdRng) -> f32 {
        let bsz = batch.x_lens.len();
        let hsz = self.config.hidden_size;
        let sos = self.output_indexer.sos_id();

        // Einmal einbetten und encodieren, dann je Beispiel decodieren
        let (emb_x, emb_x_cache) = self.input_emb.forward_batch(&batch.x, Mode::Train, rng);
        let (enc, enc_cache) = self.encoder.forward(&emb_x, &batch.x_lens);

        let mut total_loss = 0.0f32;
        let mut d_enc_outputs = Array3::<f32>::zeros(enc.outputs.raw_dim());
        let mut d_h_fin = Array2::<f32>::zeros((bsz, hsz));
        let mut d_c_fin = Array2::<f32>::zeros((bsz, hsz));

        for b in 0..bsz {
            let in_len = batch.x_lens[b];
            let out_len = batch.y_lens[b];
            let enc_b = enc.outputs.slice(s![b, 0..in_len, ..]).to_owned(); // [L, H]

            let mut h = enc.h.row(b).to_owned().insert_axis(Axis(0)); // [1, H]
            let mut c = enc.c.row(b).to_owned().insert_axis(Axis(0));

            // Forward: Gold-Token des Vorschritts als Eingabe
            let mut step_caches = Vec::with_capacity(out_len);
            let mut prev_token = sos;
            for idx in 0..out_len {
                let gold = batch.y[(b, idx)];
                let (x_emb, emb_cache) = self.output_emb.forward(&[prev_token], Mode::Train, rng);
                let (logits, cache) = self.decoder.step(&x_emb, &h, &c, &enc_b);
                let probs = softmax_1d(&logits.row(0).to_owned());
                total_loss += cross_entropy_step(&probs, gold);
                let d_logits = cross_entropy_grad_step(&probs, gold).insert_axis(Axis(0));
                h = cache.lstm.h.clone();
                c = cache.lstm.c.clone();
                step_caches.push((cache, emb_cache, d_logits));
                prev_token = gold;
            }

            // Backward in umgekehrter Schrittfolge
            let mut dh_next = Array2::<f32>::zeros((1, hsz));
            let mut dc_next = Array2::<f32>::zeros((1, hsz));
            let mut d_enc_b = Array2::<f32>::zeros((in_len, hsz));
            for (cache, emb_cache, d_logits) in step_caches.iter().rev() {
                let (dx, dh_prev, dc_prev, d_enc) =
                    self.decoder.backward_step(cache, &enc_b, d_logits, &dh_next, &dc_next);
                self.output_emb.backward(emb_cache, &dx);
                d_enc_b += &d_enc;
                dh_next = dh_prev;
                dc_next = dc_prev;
            }

            // Beitraege dieses Beispiels an den Encoder weiterreichen
            d_enc_outputs.slice_mut(s![b, 0..in_len, ..]).assign(&d_enc_b);
            d_h_fin.row_mut(b).assign(&dh_next.row(0));
            d_c_fin.row_mut(b).assign(&dc_next.row(0));
        }

        let d_emb_x = self.encoder.backward(&enc_cache, &d_enc_outputs, &d_h_fin, &d_c_fin);
        self.input_emb.backward_batch(&emb_x_cache, &d_emb_x);

        total_loss
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.input_emb.params_mut();
        params.extend(self.output_emb.params_mut());
        params.extend(self.encoder.params_mut());
        params.extend(self.decoder.params_mut());
        params
    }

    /// Genau ein Optimiererschritt pro Minibatch, ueber alle Parameter.
    pub fn apply_step(&mut self, lr: f32) {
        for p in self.params_mut() {
            p.step(lr);
        }
    }

    pub fn zero_grads(&mut self) {
        for p in self.params_mut() {
            p.zero_grad();
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.input_emb.parameter_count()
            + self.output_emb.parameter_count()
            + self.encoder.parameter_count()
            + self.decoder.parameter_count()
    }

    /// Speichert das komplette Modell als bincode-Checkpoint.
    pub fn save_checkpoint(&self, path: &str) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Checkpoint {} konnte nicht angelegt werden", path))?;
        let mut writer = BufWriter::with_capacity(8 * 1024 * 1024, file);
        encode_into_std_write(self, &mut writer, standard())
            .context("Checkpoint konnte nicht geschrieben werden")?;
        Ok(())
    }

    /// Liest ein komplettes Modell aus einem Checkpoint; anders als
    /// load_checkpoint() muss die Datei hier existieren.
    pub fn from_checkpoint(path: &str) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Checkpoint {} konnte nicht geoeffnet werden", path))?;
        let mut reader = BufReader::new(file);
        let model = decode_from_std_read(&mut reader, standard())
            .context("Checkpoint konnte nicht gelesen werden")?;
        Ok(model)
    }

    /// Laedt einen Checkpoint; eine fehlende Datei ist kein Fehler, das
    /// Modell bleibt dann unveraendert.
    pub fn load_checkpoint(&mut self, path: &str) -> Result<()> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                eprintln!("Checkpoint {} nicht gefunden, Modell bleibt wie es ist", path);
                return Ok(());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Checkpoint {} konnte nicht geoeffnet werden", path))
            }
        };
        let mut reader = BufReader::new(file);
        *self = decode_from_std_read(&mut reader, standard())
            .context("Checkpoint konnte nicht gelesen werden")?;
        Ok(())
    }
}

impl SemanticParser for Seq2SeqParser {
    /// Greedy-Inferenz: Start bei SOS, Abbruch bei EOS oder Schrittlimit;
    /// EOS wird nie an die Ausgabe angehaengt. p = exp der aufsummierten
    /// Log-Wahrscheinlichkeiten der Argmax-Token.
    fn decode(&self, test_data: &[Example]) -> Vec<Vec<Derivation>> {
        // Eval: Dropout ist No-op, der RNG wird nie gezogen
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let sos = self.output_indexer.sos_id();
        let eos = self.output_indexer.eos_id();
        let cap = self.config.decoder_len_limit;

        let mut derivs = Vec::with_capacity(test_data.len());
        for ex in test_data {
            // Eingabe wie im Training lesen
            let ids: Vec<usize> = if self.config.reverse_input {
                ex.x_indexed.iter().rev().copied().collect()
            } else {
                ex.x_indexed.clone()
            };
            let len = ids.len();
            let ids_arr = Array2::from_shape_vec((1, len), ids).expect("Eingabeform ungueltig");
            let (emb_x, _) = self.input_emb.forward_batch(&ids_arr, Mode::Eval, &mut rng);
            let (enc, _) = self.encoder.forward(&emb_x, &[len]);
            let enc_outs = enc.outputs.slice(s![0, .., ..]).to_owned();

            let mut h = enc.h.clone();
            let mut c = enc.c.clone();
            let mut token = sos;
            let mut log_p = 0.0f32;
            let mut out_tokens: Vec<usize> = Vec::new();

            while out_tokens.len() < cap {
                let (x_emb, _) = self.output_emb.forward(&[token], Mode::Eval, &mut rng);
                let (logits, cache) = self.decoder.step(&x_emb, &h, &c, &enc_outs);
                let logits_row = logits.row(0).to_owned();
                let log_probs = log_softmax_1d(&logits_row);
                let next = argmax_1d(&logits_row);
                log_p += log_probs[next];
                h = cache.lstm.h.clone();
                c = cache.lstm.c.clone();
                if next == eos {
                    break;
                }
                out_tokens.push(next);
                token = next;
            }

            let y_toks = out_tokens
                .iter()
                .map(|&id| self.output_indexer.get_object(id).to_string())
                .collect();
            derivs.push(vec![Derivation { example: ex.clone(), p: log_p.exp(), y_toks }]);
        }
        derivs
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use approx::assert_relative_eq;

    use super::*;
    use crate::batching::make_epoch_batches;
    use crate::data::index_data;
    use crate::indexer::EOS_SYMBOL;

    fn tiny_setup(bidirect: bool, dropout: f32) -> (Seq2SeqParser, Vec<Example>, StdRng) {
        let pairs = vec![
            ("what rivers run here".to_string(), "answer river all".to_string()),
            ("what states".to_string(), "answer state".to_string()),
        ];
        let mut in_ix = Indexer::new();
        let mut out_ix = Indexer::new();
        let data = index_data(&pairs, &mut in_ix, &mut out_ix, true);
        let config = ParserConfig {
            seed: 21,
            epochs: 1,
            lr: 1e-2,
            batch_size: 2,
            decoder_len_limit: 10,
            emb_dim: 6,
            hidden_size: 5,
            emb_dropout: dropout,
            bidirect,
            reverse_input: false,
        };
        let mut rng = StdRng::seed_from_u64(config.seed);
        let parser = Seq2SeqParser::new(config, in_ix, out_ix, &mut rng).unwrap();
        (parser, data, rng)
    }

    #[test]
    fn decode_ist_deterministisch() {
        let (parser, data, _) = tiny_setup(false, 0.2);
        let a = parser.decode(&data);
        let b = parser.decode(&data);
        for (da, db) in a.iter().zip(b.iter()) {
            assert_eq!(da[0].y_toks, db[0].y_toks);
            assert_eq!(da[0].p, db[0].p);
        }
    }

    #[test]
    fn decode_respektiert_schrittlimit_und_enthaelt_kein_eos() {
        let (mut parser, data, _) = tiny_setup(false, 0.0);
        parser.config.decoder_len_limit = 3;
        let derivs = parser.decode(&data);
        for kbest in &derivs {
            assert!(kbest[0].y_toks.len() <= 3);
            assert!(!kbest[0].y_toks.iter().any(|t| t == EOS_SYMBOL));
            assert!(kbest[0].p > 0.0 && kbest[0].p <= 1.0);
        }
    }

    // Finite-Differenzen-Pruefung des kompletten Trainingsschritts
    // (Embeddings, Encoder, Attention, Decoder), bidirektional und mit
    // unsortierten Laengen. Dropout 0, damit der Verlust deterministisch ist.
    #[test]
    fn batch_step_gradienten_stimmen_mit_finiter_differenz() {
        let (mut parser, data, mut rng) = tiny_setup(true, 0.0);
        let batches = make_epoch_batches(
            &data,
            &parser.input_indexer,
            &parser.output_indexer,
            2,
            false,
            &mut rng,
        );
        let batch = &batches[0];

        let loss0 = parser.batch_step(batch, &mut rng);
        assert!(loss0.is_finite() && loss0 > 0.0);

        let analytic = [
            ("dec_w_out", parser.decoder.w_out.w.grad[(0, 4)]),
            ("dec_cell", parser.decoder.cell.w_ih.grad[(1, 2)]),
            ("enc_fwd", parser.encoder.fwd.w_ih.grad[(0, 3)]),
            ("enc_red_h", parser.encoder.reduce_h.as_ref().unwrap().w.grad[(2, 1)]),
            ("out_emb", parser.output_emb.table.grad[(4, 0)]),
        ];

        let eps = 1e-2f32;
        let mut numeric = Vec::new();
        {
            let perturb = |parser: &mut Seq2SeqParser, delta: f32, which: usize| {
                match which {
                    0 => parser.decoder.w_out.w.w[(0, 4)] += delta,
                    1 => parser.decoder.cell.w_ih.w[(1, 2)] += delta,
                    2 => parser.encoder.fwd.w_ih.w[(0, 3)] += delta,
                    3 => parser.encoder.reduce_h.as_mut().unwrap().w.w[(2, 1)] += delta,
                    _ => parser.output_emb.table.w[(4, 0)] += delta,
                }
            };
            for which in 0..analytic.len() {
                parser.zero_grads();
                perturb(&mut parser, eps, which);
                let lp = parser.batch_step(batch, &mut rng);
                parser.zero_grads();
                perturb(&mut parser, -2.0 * eps, which);
                let lm = parser.batch_step(batch, &mut rng);
                perturb(&mut parser, eps, which);
                parser.zero_grads();
                numeric.push((lp - lm) / (2.0 * eps));
            }
        }

        for ((name, a), n) in analytic.iter().zip(numeric.iter()) {
            assert_relative_eq!(*a, *n, epsilon = 5e-3, max_relative = 0.08);
            assert!(a.is_finite(), "Gradient {name} ist nicht endlich");
        }
    }

    #[test]
    fn checkpoint_roundtrip_erhaelt_die_vorhersagen() {
        let (parser, data, _) = tiny_setup(false, 0.0);
        let before = parser.decode(&data);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let path = path.to_str().unwrap();
        parser.save_checkpoint(path).unwrap();

        let (mut reloaded, _, _) = tiny_setup(false, 0.0);
        // anderes Gewicht, damit der Load etwas zu tun hat
        reloaded.decoder.w_out.w.w[(0, 0)] += 1.0;
        reloaded.load_checkpoint(path).unwrap();
        let after = reloaded.decode(&data);

        for (da, db) in before.iter().zip(after.iter()) {
            assert_eq!(da[0].y_toks, db[0].y_toks);
            assert_abs_diff_eq!(da[0].p, db[0].p, epsilon = 1e-6);
        }
    }

    #[test]
    fn from_checkpoint_liefert_ein_lauffaehiges_modell() {
        let (parser, data, _) = tiny_setup(false, 0.0);
        let before = parser.decode(&data);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let path = path.to_str().unwrap();
        parser.save_checkpoint(path).unwrap();

        let loaded = Seq2SeqParser::from_checkpoint(path).unwrap();
        let after = loaded.decode(&data);
        for (da, db) in before.iter().zip(after.iter()) {
            assert_eq!(da[0].y_toks, db[0].y_toks);
            assert_abs_diff_eq!(da[0].p, db[0].p, epsilon = 1e-6);
        }
    }

    #[test]
    fn from_checkpoint_verlangt_eine_vorhandene_datei() {
        assert!(Seq2SeqParser::from_checkpoint("/nonexistent/model.bin").is_err());
    }

    #[test]
    fn fehlender_checkpoint_wird_toleriert() {
        let (mut parser, _, _) = tiny_setup(false, 0.0);
        let w_before = parser.decoder.w_out.w.w.clone();
        parser.load_checkpoint("/nonexistent/model.bin").unwrap();
        assert_eq!(parser.decoder.w_out.w.w, w_before);
    }
}
