// nearest.rs
// ============================================================================
// Hinweis: Nearest-Neighbor-Baseline: Jaccard-Aehnlichkeit der rohen
//          Eingabetoken, striktes '>' als Tie-Break, d.h. das zuerst
//          gesehene Maximum gewinnt. Kein Training. Parallelisiert wird
//          nur ueber die Testbeispiele; der Scan ueber die Trainingsdaten
//          bleibt sequentiell, damit die Tie-Break-Reihenfolge steht.
// ============================================================================

use std::collections::HashSet;

use anyhow::{ensure, Result};
use rayon::prelude::*;

use crate::data::{Derivation, Example};
use crate::parser::SemanticParser;

pub struct NearestNeighborParser {
    training_data: Vec<Example>,
}

impl NearestNeighborParser {
    /// Ohne Trainingsbeispiele gibt es keinen Nachbarn; das ist ein
    /// Datenfehler und schlaegt sofort fehl.
    pub fn new(training_data: Vec<Example>) -> Result<Self> {
        ensure!(!training_data.is_empty(), "Trainingsdatensatz ist leer");
        Ok(NearestNeighborParser { training_data })
    }
}

/// |Schnitt| / |Vereinigung| der Tokenmengen; 0, wenn beide Mengen leer
/// sind (kein Teilen durch null).
pub fn jaccard(a: &[String], b: &[String]) -> f32 {
    let sa: HashSet<&str> = a.iter().map(String::as_str).collect();
    let sb: HashSet<&str> = b.iter().map(String::as_str).collect();
    let union = sa.union(&sb).count();
    if union == 0 {
        return 0.0;
    }
    let inter = sa.intersection(&sb).count();
    inter as f32 / union as f32
}

impl SemanticParser for NearestNeighborParser {
    fn decode(&self, test_data: &[Example]) -> Vec<Vec<Derivation>> {
        test_data
            .par_iter()
            .map(|test_ex| {
                // Start unter 0: auch ein Nachbar mit Aehnlichkeit 0 wird genommen
                let mut best_sim = -1.0f32;
                let mut best_train: Option<&Example> = None;
                for train_ex in &self.training_data {
                    let sim = jaccard(&train_ex.x_tok, &test_ex.x_tok);
                    if sim > best_sim {
                        best_sim = sim;
                        best_train = Some(train_ex);
                    }
                }
                let y_toks = best_train.map(|ex| ex.y_tok.clone()).unwrap_or_default();
                vec![Derivation { example: test_ex.clone(), p: 1.0, y_toks }]
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn toks(ts: &[&str]) -> Vec<String> {
        ts.iter().map(|s| s.to_string()).collect()
    }

    fn example(x: &[&str], y: &[&str]) -> Example {
        Example {
            x_tok: toks(x),
            x_indexed: vec![0; x.len()],
            y_tok: toks(y),
            y_indexed: vec![0; y.len()],
        }
    }

    #[test]
    fn jaccard_grundeigenschaften() {
        let a = toks(&["what", "rivers"]);
        let b = toks(&["what", "states"]);
        let sim = jaccard(&a, &b);
        assert_abs_diff_eq!(sim, 1.0 / 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(sim, jaccard(&b, &a), epsilon = 1e-6);
        assert_abs_diff_eq!(jaccard(&a, &a), 1.0, epsilon = 1e-6);
        assert_eq!(jaccard(&[], &[]), 0.0);
        assert_eq!(jaccard(&a, &[]), 0.0);
        // Mengen, nicht Multimengen: Wiederholungen zaehlen nicht
        assert_abs_diff_eq!(
            jaccard(&toks(&["what", "what"]), &toks(&["what"])),
            1.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn bei_gleichstand_gewinnt_das_fruehere_trainingsbeispiel() {
        // Beide Kandidaten haben Jaccard 0.5 zum Testbeispiel
        let train = vec![
            example(&["what", "rivers"], &["answer", "river"]),
            example(&["what", "states"], &["answer", "state"]),
        ];
        let parser = NearestNeighborParser::new(train).unwrap();
        let test = vec![example(&["what", "cities"], &[])];
        let derivs = parser.decode(&test);
        assert_eq!(derivs[0][0].y_toks, toks(&["answer", "river"]));
        assert_eq!(derivs[0][0].p, 1.0);
    }

    #[test]
    fn auch_ohne_ueberlappung_gibt_es_einen_nachbarn() {
        let train = vec![example(&["what", "rivers"], &["answer", "river"])];
        let parser = NearestNeighborParser::new(train).unwrap();
        let test = vec![example(&["list", "cities"], &[])];
        let derivs = parser.decode(&test);
        assert_eq!(derivs[0][0].y_toks, toks(&["answer", "river"]));
    }

    #[test]
    fn leerer_trainingsdatensatz_wird_abgelehnt() {
        assert!(NearestNeighborParser::new(Vec::new()).is_err());
    }
}
