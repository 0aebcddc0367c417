// main.rs
// ============================================================================
// Hinweis: Einstiegspunkt. Datensaetze laden und indizieren, Baseline oder
//          Seq2Seq-Modell ausfuehren, Genauigkeit auf dem Dev-Set
//          berichten, optional einen Checkpoint schreiben.
// ============================================================================

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};

use geoparse::data::{index_data, load_pairs, DatasetType};
use geoparse::{
    evaluate, train_encdec, Indexer, NearestNeighborParser, ParserConfig, SemanticParser,
    Seq2SeqParser,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModelKind {
    /// Jaccard-Nearest-Neighbor-Baseline
    Nearest,
    /// LSTM-Encoder-Decoder mit Attention
    Seq2seq,
}

#[derive(Parser, Debug)]
#[command(name = "geoparse", about = "Seq2Seq-Semantikparser: Fragen -> logische Formen")]
struct Args {
    /// Trainingsdaten (TSV: Frage<TAB>logische Form)
    #[arg(long)]
    train_path: PathBuf,

    /// Entwicklungsdaten zum Auswerten
    #[arg(long)]
    dev_path: PathBuf,

    /// Datensaetze liegen als JSON-Array aus {x, y}-Objekten vor
    #[arg(long)]
    json: bool,

    #[arg(long, value_enum, default_value_t = ModelKind::Seq2seq)]
    model: ModelKind,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long, default_value_t = 10)]
    epochs: usize,

    #[arg(long, default_value_t = 1e-3)]
    lr: f32,

    #[arg(long, default_value_t = 2)]
    batch_size: usize,

    /// Hartes Schrittlimit des Greedy-Decoders
    #[arg(long, default_value_t = 100)]
    decoder_len_limit: usize,

    #[arg(long, default_value_t = 300)]
    emb_dim: usize,

    #[arg(long, default_value_t = 256)]
    hidden_size: usize,

    #[arg(long, default_value_t = 0.2)]
    emb_dropout: f32,

    /// Bidirektionaler Encoder
    #[arg(long)]
    bidirect: bool,

    /// Eingabe rueckwaerts lesen (nur unidirektional sinnvoll)
    #[arg(long)]
    reverse_input: bool,

    /// Checkpoint-Pfad; wird nach dem Training geschrieben
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Vorhandenen Checkpoint laden und das Training ueberspringen
    #[arg(long)]
    load_checkpoint: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let kind = if args.json { DatasetType::JSON } else { DatasetType::TSV };

    let train_pairs = load_pairs(&args.train_path, kind)?;
    let dev_pairs = load_pairs(&args.dev_path, kind)?;

    let mut input_indexer = Indexer::new();
    let mut output_indexer = Indexer::new();
    let train_data = index_data(&train_pairs, &mut input_indexer, &mut output_indexer, true);
    let dev_data = index_data(&dev_pairs, &mut input_indexer, &mut output_indexer, false);

    println!(
        "Daten: {} Train / {} Dev, Vokabular: {} Eingabe / {} Ausgabe",
        train_data.len(),
        dev_data.len(),
        input_indexer.len(),
        output_indexer.len()
    );

    let derivs = match args.model {
        ModelKind::Nearest => {
            let parser = NearestNeighborParser::new(train_data.clone())?;
            parser.decode(&dev_data)
        }
        ModelKind::Seq2seq => {
            let model = if let Some(path) = &args.load_checkpoint {
                let model = Seq2SeqParser::from_checkpoint(path.to_string_lossy().as_ref())?;
                println!("Checkpoint geladen aus {:?}", path);
                model
            } else {
                let config = ParserConfig {
                    seed: args.seed,
                    epochs: args.epochs,
                    lr: args.lr,
                    batch_size: args.batch_size,
                    decoder_len_limit: args.decoder_len_limit,
                    emb_dim: args.emb_dim,
                    hidden_size: args.hidden_size,
                    emb_dropout: args.emb_dropout,
                    bidirect: args.bidirect,
                    reverse_input: args.reverse_input,
                };
                train_encdec(&train_data, &input_indexer, &output_indexer, config)?
            };
            if let Some(path) = &args.checkpoint {
                model.save_checkpoint(path.to_string_lossy().as_ref())?;
                println!("Checkpoint gespeichert unter {:?}", path);
            }
            model.decode(&dev_data)
        }
    };

    let (exact, token_acc) = evaluate(&derivs, &dev_data);
    println!(
        "Exakte Treffer: {:.1}%  Token-Genauigkeit: {:.1}%",
        exact * 100.0,
        token_acc * 100.0
    );
    Ok(())
}
