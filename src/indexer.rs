// indexer.rs
// ============================================================================
// Hinweis: Bidirektionale Symbol<->Id-Abbildung. Die ersten vier Ids sind
//          fest fuer PAD/UNK/SOS/EOS reserviert, damit Padding und
//          Steuerzeichen in beiden Vokabularen dieselben Ids tragen.
// ============================================================================

use std::collections::HashMap;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

pub const PAD_SYMBOL: &str = "<PAD>";
pub const UNK_SYMBOL: &str = "<UNK>";
pub const SOS_SYMBOL: &str = "<SOS>";
pub const EOS_SYMBOL: &str = "<EOS>";

#[derive(Clone, Debug, Serialize, Deserialize, Encode, Decode)]
pub struct Indexer {
    objs: Vec<String>,
    ids: HashMap<String, usize>,
}

impl Indexer {
    /// Legt einen Indexer an, dessen erste vier Ids fest vergeben sind.
    pub fn new() -> Self {
        let mut ix = Indexer {
            objs: Vec::new(),
            ids: HashMap::new(),
        };
        for s in [PAD_SYMBOL, UNK_SYMBOL, SOS_SYMBOL, EOS_SYMBOL] {
            ix.add_and_get_index(s);
        }
        ix
    }

    pub fn len(&self) -> usize {
        self.objs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    pub fn index_of(&self, symbol: &str) -> Option<usize> {
        self.ids.get(symbol).copied()
    }

    /// Id eines Symbols, das vorhanden sein muss; Panik sonst (Aufbaufehler).
    pub fn must_index(&self, symbol: &str) -> usize {
        self.index_of(symbol)
            .unwrap_or_else(|| panic!("Symbol {symbol} fehlt im Indexer"))
    }

    pub fn get_object(&self, id: usize) -> &str {
        &self.objs[id]
    }

    pub fn add_and_get_index(&mut self, symbol: &str) -> usize {
        if let Some(&id) = self.ids.get(symbol) {
            return id;
        }
        let id = self.objs.len();
        self.objs.push(symbol.to_string());
        self.ids.insert(symbol.to_string(), id);
        id
    }

    pub fn pad_id(&self) -> usize {
        self.must_index(PAD_SYMBOL)
    }

    pub fn unk_id(&self) -> usize {
        self.must_index(UNK_SYMBOL)
    }

    pub fn sos_id(&self) -> usize {
        self.must_index(SOS_SYMBOL)
    }

    pub fn eos_id(&self) -> usize {
        self.must_index(EOS_SYMBOL)
    }
}

impl Default for Indexer {
    fn default() -> Self {
        Self::new()
    }
}
