// lib.rs
// ============================================================================
// Hinweis: Seq2Seq-Semantikparser (GeoQuery-Stil): bildet natuerlich-
//          sprachliche Fragen auf logische Formen ab. Kern: LSTM-Encoder
//          ueber variable Sequenzlaengen, Attention-Decoder, Teacher-
//          Forcing-Training, Greedy-Inferenz. Dazu eine Jaccard-Nearest-
//          Neighbor-Baseline zum Vergleich.
// ============================================================================

#![deny(unsafe_code)]

pub mod adam;
pub mod batching;
pub mod config;
pub mod data;
pub mod decoder;
pub mod embedding;
pub mod encoder;
pub mod indexer;
pub mod linear;
pub mod lstm;
pub mod math;
pub mod nearest;
pub mod parser;
pub mod trainer;

pub use config::{Mode, ParserConfig};
pub use data::{Derivation, Example};
pub use indexer::Indexer;
pub use nearest::NearestNeighborParser;
pub use parser::{SemanticParser, Seq2SeqParser};
pub use trainer::{evaluate, train_encdec};
