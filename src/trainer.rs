// trainer.rs
// ============================================================================
// Hinweis: Trainingsschleife: je Epoche mischen, batchen, Teacher-Forcing,
//          ein Adam-Schritt pro Minibatch. Konsolenbericht mit mittlerem
//          Batch-Verlust und Dauer. Dazu die Auswertung der 1-best-
//          Derivationen (exakte Treffer und Token-Genauigkeit).
// ============================================================================

use std::time::Instant;

use anyhow::{ensure, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::batching::make_epoch_batches;
use crate::config::ParserConfig;
use crate::data::{Derivation, Example};
use crate::indexer::Indexer;
use crate::parser::Seq2SeqParser;

/// Trainiert das Encoder-Decoder-Modell auf den indizierten Daten.
pub fn train_encdec(
    train_data: &[Example],
    input_indexer: &Indexer,
    output_indexer: &Indexer,
    config: ParserConfig,
) -> Result<Seq2SeqParser> {
    config.validate()?;
    ensure!(!train_data.is_empty(), "Trainingsdatensatz ist leer");
    ensure!(
        train_data.iter().all(|ex| !ex.x_indexed.is_empty() && !ex.y_indexed.is_empty()),
        "Beispiele ohne Token im Trainingsdatensatz"
    );

    let mut rng = StdRng::seed_from_u64(config.seed);
    let i_epochs = config.epochs;
    let d_lr = config.lr;
    let mut model =
        Seq2SeqParser::new(config, input_indexer.clone(), output_indexer.clone(), &mut rng)?;

    println!(
        "Modell: emb_dim={}, hidden={}, Parameter: {}",
        model.config.emb_dim,
        model.config.hidden_size,
        model.parameter_count()
    );

    for i_epoch in 0..i_epochs {
        let t_start = Instant::now();
        let mut d_total_loss = 0.0f32;
        let mut i_batches = 0usize;

        let batches = make_epoch_batches(
            train_data,
            &model.input_indexer,
            &model.output_indexer,
            model.config.batch_size,
            model.config.reverse_input,
            &mut rng,
        );
        for batch in &batches {
            d_total_loss += model.batch_step(batch, &mut rng);
            model.apply_step(d_lr);
            i_batches += 1;
        }

        let d_avg_loss = if i_batches > 0 { d_total_loss / i_batches as f32 } else { 0.0 };
        println!(
            "Epoch {}  Loss {:.4}  (Batches: {}, Dauer: {:.2}s)",
            i_epoch,
            d_avg_loss,
            i_batches,
            t_start.elapsed().as_secs_f32()
        );
    }
    Ok(model)
}

/// Exakte-Treffer- und Token-Genauigkeit der 1-best-Derivationen.
pub fn evaluate(derivs: &[Vec<Derivation>], test_data: &[Example]) -> (f32, f32) {
    assert_eq!(derivs.len(), test_data.len(), "Derivationen passen nicht zu den Beispielen");
    let mut i_exact = 0usize;
    let mut i_tok_correct = 0usize;
    let mut i_tok_total = 0usize;

    for (kbest, ex) in derivs.iter().zip(test_data) {
        let Some(best) = kbest.first() else { continue };
        if best.y_toks == ex.y_tok {
            i_exact += 1;
        }
        i_tok_total += ex.y_tok.len();
        i_tok_correct += best.y_toks.iter().zip(&ex.y_tok).filter(|(a, b)| a == b).count();
    }

    let n = test_data.len().max(1) as f32;
    (i_exact as f32 / n, i_tok_correct as f32 / i_tok_total.max(1) as f32)
}
