// config.rs
// ============================================================================
// Hinweis: Hyperparameter des Parsers. Keine versteckten Konstanten: alles
//          liegt explizit in ParserConfig, validate() schlaegt vor dem
//          Training fehl, nicht mittendrin.
// ============================================================================

use anyhow::{ensure, Result};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Train schaltet Dropout aktiv, Eval macht ihn zum No-op. Der Modus wird
/// explizit durch jeden Forward-Aufruf gereicht statt als globaler Zustand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

#[derive(Clone, Debug, Serialize, Deserialize, Encode, Decode)]
pub struct ParserConfig {
    pub seed: u64,
    pub epochs: usize,
    pub lr: f32,
    pub batch_size: usize,
    /// Hartes Schrittlimit des Greedy-Decoders.
    pub decoder_len_limit: usize,
    pub emb_dim: usize,
    pub hidden_size: usize,
    pub emb_dropout: f32,
    /// Bidirektionaler Encoder; die Zustandsbreite zum Decoder bleibt H.
    pub bidirect: bool,
    /// Eingabe rueckwaerts lesen (nur fuer unidirektionale Encoder sinnvoll).
    pub reverse_input: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            seed: 0,
            epochs: 10,
            lr: 1e-3,
            batch_size: 2,
            decoder_len_limit: 100,
            emb_dim: 300,
            hidden_size: 256,
            emb_dropout: 0.2,
            bidirect: false,
            reverse_input: false,
        }
    }
}

impl ParserConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.epochs > 0, "epochs muss > 0 sein");
        ensure!(self.lr > 0.0 && self.lr.is_finite(), "lr muss > 0 und endlich sein");
        ensure!(self.batch_size > 0, "batch_size muss > 0 sein");
        ensure!(self.decoder_len_limit > 0, "decoder_len_limit muss > 0 sein");
        ensure!(self.emb_dim > 0, "emb_dim muss > 0 sein");
        ensure!(self.hidden_size > 0, "hidden_size muss > 0 sein");
        ensure!(
            (0.0..1.0).contains(&self.emb_dropout),
            "emb_dropout muss in [0, 1) liegen"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_ist_gueltig() {
        assert!(ParserConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_lehnt_unsinnige_werte_ab() {
        let cfg = ParserConfig { batch_size: 0, ..ParserConfig::default() };
        assert!(cfg.validate().is_err());

        let cfg = ParserConfig { hidden_size: 0, ..ParserConfig::default() };
        assert!(cfg.validate().is_err());

        let cfg = ParserConfig { emb_dropout: 1.0, ..ParserConfig::default() };
        assert!(cfg.validate().is_err());

        let cfg = ParserConfig { lr: -0.5, ..ParserConfig::default() };
        assert!(cfg.validate().is_err());
    }
}
