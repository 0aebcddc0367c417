// batching.rs
// ============================================================================
// Hinweis: Padding auf rechteckige Id-Tensoren und Minibatch-Bildung.
//          Gepolstert wird je Batch auf dessen Maximallaenge; jede Epoche
//          mischt neu und deckt alle Beispiele genau einmal ab, der Rest
//          bildet einen kleineren Schlussbatch.
// ============================================================================

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::data::Example;
use crate::indexer::Indexer;

/// Ein Minibatch: rechteckige Id-Tensoren plus echte Laengen je Zeile.
/// Positionen ab der echten Laenge tragen PAD und sind nie Signal.
pub struct Minibatch {
    pub x: Array2<usize>, // [batch, max_in_len]
    pub x_lens: Vec<usize>,
    pub y: Array2<usize>, // [batch, max_out_len]
    pub y_lens: Vec<usize>,
}

/// Polstert die Eingaben auf max_len, optional rueckwaerts gelesen. Zeile i
/// enthaelt die ersten len_i Ids unveraendert, danach PAD.
pub fn make_padded_input_tensor(
    exs: &[&Example],
    input_indexer: &Indexer,
    max_len: usize,
    reverse_input: bool,
) -> Array2<usize> {
    let pad = input_indexer.pad_id();
    Array2::from_shape_fn((exs.len(), max_len), |(i, j)| {
        let xs = &exs[i].x_indexed;
        if j < xs.len() {
            if reverse_input {
                xs[xs.len() - 1 - j]
            } else {
                xs[j]
            }
        } else {
            pad
        }
    })
}

pub fn make_padded_output_tensor(
    exs: &[&Example],
    output_indexer: &Indexer,
    max_len: usize,
) -> Array2<usize> {
    let pad = output_indexer.pad_id();
    Array2::from_shape_fn((exs.len(), max_len), |(i, j)| {
        exs[i].y_indexed.get(j).copied().unwrap_or(pad)
    })
}

/// Mischt die Beispielreihenfolge und bildet Minibatches fester Groesse.
pub fn make_epoch_batches(
    data: &[Example],
    input_indexer: &Indexer,
    output_indexer: &Indexer,
    batch_size: usize,
    reverse_input: bool,
    rng: &mut StdRng,
) -> Vec<Minibatch> {
    let mut order: Vec<usize> = (0..data.len()).collect();
    order.shuffle(rng);

    order
        .chunks(batch_size)
        .map(|chunk| {
            let exs: Vec<&Example> = chunk.iter().map(|&i| &data[i]).collect();
            let x_lens: Vec<usize> = exs.iter().map(|e| e.x_indexed.len()).collect();
            let y_lens: Vec<usize> = exs.iter().map(|e| e.y_indexed.len()).collect();
            let max_in = x_lens.iter().copied().max().unwrap_or(0);
            let max_out = y_lens.iter().copied().max().unwrap_or(0);
            Minibatch {
                x: make_padded_input_tensor(&exs, input_indexer, max_in, reverse_input),
                x_lens,
                y: make_padded_output_tensor(&exs, output_indexer, max_out),
                y_lens,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    fn example(x_ids: &[usize], y_ids: &[usize]) -> Example {
        Example {
            x_tok: x_ids.iter().map(|i| format!("x{i}")).collect(),
            x_indexed: x_ids.to_vec(),
            y_tok: y_ids.iter().map(|i| format!("y{i}")).collect(),
            y_indexed: y_ids.to_vec(),
        }
    }

    #[test]
    fn padding_erhaelt_praefix_und_fuellt_mit_pad() {
        let ix = Indexer::new();
        let a = example(&[4, 5, 6], &[7]);
        let b = example(&[8], &[9]);
        let t = make_padded_input_tensor(&[&a, &b], &ix, 4, false);
        assert_eq!(t.row(0).to_vec(), vec![4, 5, 6, ix.pad_id()]);
        assert_eq!(t.row(1).to_vec(), vec![8, ix.pad_id(), ix.pad_id(), ix.pad_id()]);
    }

    #[test]
    fn padding_mit_umkehrung_dreht_nur_den_praefix() {
        let ix = Indexer::new();
        let a = example(&[4, 5, 6], &[7]);
        let t = make_padded_input_tensor(&[&a], &ix, 5, true);
        assert_eq!(t.row(0).to_vec(), vec![6, 5, 4, ix.pad_id(), ix.pad_id()]);
    }

    #[test]
    fn epoche_deckt_jedes_beispiel_genau_einmal_ab() {
        let in_ix = Indexer::new();
        let out_ix = Indexer::new();
        // 7 Beispiele, Batchgroesse 3: Batches der Groessen 3, 3, 1
        let data: Vec<Example> = (0..7).map(|i| example(&[4 + i, 4], &[5, 6])).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let batches = make_epoch_batches(&data, &in_ix, &out_ix, 3, false, &mut rng);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].x_lens.len(), 1);

        let mut seen: Vec<usize> = batches
            .iter()
            .flat_map(|b| (0..b.x_lens.len()).map(|r| b.x.row(r)[0]).collect::<Vec<_>>())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (4..11).collect::<Vec<_>>());
    }

    #[test]
    fn batch_padding_richtet_sich_nach_dem_batchmaximum() {
        let in_ix = Indexer::new();
        let out_ix = Indexer::new();
        let data = vec![example(&[4, 5], &[6]), example(&[4, 5, 6, 7], &[6, 7])];
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let batches = make_epoch_batches(&data, &in_ix, &out_ix, 2, false, &mut rng);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].x.ncols(), 4);
        assert_eq!(batches[0].y.ncols(), 2);
    }
}
