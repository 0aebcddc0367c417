// data.rs
// ============================================================================
// Hinweis: Beispiele, Derivationen, Tokenisierung und Datensatz-Lader
//          (TSV und JSON). Indizierung erweitert die Vokabulare nur im
//          Trainingsmodus; sonst faellt jedes unbekannte Token auf UNK.
//          Ausgabesequenzen sind stets EOS-terminiert.
// ============================================================================

use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use csv::ReaderBuilder;
use serde::Deserialize;

use crate::indexer::Indexer;

/// Ein Trainings- oder Testbeispiel: rohe und indizierte Token beider
/// Seiten. Nach der Konstruktion unveraenderlich.
#[derive(Clone, Debug, PartialEq)]
pub struct Example {
    pub x_tok: Vec<String>,
    pub x_indexed: Vec<usize>,
    pub y_tok: Vec<String>,
    pub y_indexed: Vec<usize>,
}

/// Eine Parse-Hypothese: Beispiel, Wahrscheinlichkeit, vorhergesagte Token.
#[derive(Clone, Debug)]
pub struct Derivation {
    pub example: Example,
    pub p: f32,
    pub y_toks: Vec<String>,
}

/// Whitespace-Tokenisierung, kleingeschrieben.
pub fn tokenize(s: &str) -> Vec<String> {
    s.split_whitespace().map(|t| t.to_lowercase()).collect()
}

#[derive(Clone, Copy)]
#[allow(clippy::upper_case_acronyms)]
pub enum DatasetType {
    TSV,
    JSON,
}

#[derive(Debug, Deserialize)]
struct RawPair {
    x: String,
    y: String,
}

/// Laedt rohe (Frage, logische Form)-Paare aus einer Datei.
pub fn load_pairs(path: &Path, kind: DatasetType) -> Result<Vec<(String, String)>> {
    match kind {
        DatasetType::TSV => load_pairs_tsv(path),
        DatasetType::JSON => load_pairs_json(path),
    }
}

fn load_pairs_tsv(path: &Path) -> Result<Vec<(String, String)>> {
    let file = fs::File::open(path)
        .with_context(|| format!("Datensatz {:?} konnte nicht geoeffnet werden", path))?;
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b'\t')
        .flexible(true)
        .from_reader(file);

    let mut pairs = Vec::new();
    for result in rdr.records() {
        let record = result.context("Fehler beim Lesen eines TSV-Datensatzes")?;
        ensure!(record.len() >= 2, "TSV-Zeile braucht zwei Spalten (x<TAB>y)");
        pairs.push((record[0].to_string(), record[1].to_string()));
    }
    Ok(pairs)
}

fn load_pairs_json(path: &Path) -> Result<Vec<(String, String)>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Datensatz {:?} konnte nicht gelesen werden", path))?;
    let raw: Vec<RawPair> =
        serde_json::from_str(&text).context("Datensatz ist kein JSON-Array aus {x, y}-Objekten")?;
    Ok(raw.into_iter().map(|p| (p.x, p.y)).collect())
}

/// Indiziert rohe Paare. `train` erweitert die Vokabulare; sonst werden
/// unbekannte Eingabetoken auf UNK abgebildet. y_indexed endet auf EOS.
pub fn index_data(
    pairs: &[(String, String)],
    input_indexer: &mut Indexer,
    output_indexer: &mut Indexer,
    train: bool,
) -> Vec<Example> {
    let mut out = Vec::with_capacity(pairs.len());
    for (x, y) in pairs {
        let x_tok = tokenize(x);
        let y_tok = tokenize(y);
        let x_indexed = x_tok
            .iter()
            .map(|t| {
                if train {
                    input_indexer.add_and_get_index(t)
                } else {
                    input_indexer.index_of(t).unwrap_or_else(|| input_indexer.unk_id())
                }
            })
            .collect();
        let mut y_indexed: Vec<usize> = y_tok
            .iter()
            .map(|t| {
                if train {
                    output_indexer.add_and_get_index(t)
                } else {
                    output_indexer.index_of(t).unwrap_or_else(|| output_indexer.unk_id())
                }
            })
            .collect();
        y_indexed.push(output_indexer.eos_id());
        out.push(Example { x_tok, x_indexed, y_tok, y_indexed });
    }
    out
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn tokenize_trennt_an_whitespace() {
        assert_eq!(tokenize("What  Rivers\trun"), vec!["what", "rivers", "run"]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn index_data_terminiert_ausgaben_mit_eos() {
        let mut in_ix = Indexer::new();
        let mut out_ix = Indexer::new();
        let pairs = vec![("what rivers".to_string(), "answer river".to_string())];
        let exs = index_data(&pairs, &mut in_ix, &mut out_ix, true);
        assert_eq!(exs.len(), 1);
        assert_eq!(exs[0].y_indexed.len(), exs[0].y_tok.len() + 1);
        assert_eq!(*exs[0].y_indexed.last().unwrap(), out_ix.eos_id());
    }

    #[test]
    fn eval_indizierung_bildet_unbekanntes_auf_unk_ab() {
        let mut in_ix = Indexer::new();
        let mut out_ix = Indexer::new();
        let train = vec![("what rivers".to_string(), "answer river".to_string())];
        index_data(&train, &mut in_ix, &mut out_ix, true);
        let vocab_before = in_ix.len();

        let dev = vec![("what mountains".to_string(), "answer mountain".to_string())];
        let exs = index_data(&dev, &mut in_ix, &mut out_ix, false);
        assert_eq!(in_ix.len(), vocab_before, "Eval darf das Vokabular nicht erweitern");
        assert_eq!(exs[0].x_indexed[1], in_ix.unk_id());
    }

    #[test]
    fn tsv_lader_liest_zwei_spalten() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "what rivers\tanswer river").unwrap();
        writeln!(f, "what states\tanswer state").unwrap();
        let pairs = load_pairs(f.path(), DatasetType::TSV).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].0, "what states");
        assert_eq!(pairs[1].1, "answer state");
    }

    #[test]
    fn json_lader_liest_xy_objekte() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"[{{"x": "what rivers", "y": "answer river"}}]"#).unwrap();
        let pairs = load_pairs(f.path(), DatasetType::JSON).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, "what rivers");
    }
}
