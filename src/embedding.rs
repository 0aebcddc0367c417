// embedding.rs
// ============================================================================
// Hinweis: Embedding-Schicht: trainierbare Lookup-Tabelle [vocab, dim] plus
//          invertiertes Dropout, das nur im Trainingsmodus wirkt. Der
//          Forward liefert einen expliziten Cache, den der Backward
//          konsumiert; eine Id ausserhalb des Vokabulars ist ein
//          Programmierfehler und fuehrt zur Panik.
// ============================================================================

use bincode::{Decode, Encode};
use ndarray::{s, Array2, Array3};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::adam::Param;
use crate::config::Mode;

#[derive(Clone, Serialize, Deserialize, Encode, Decode)]
pub struct EmbeddingLayer {
    pub table: Param, // [vocab, dim]
    pub dropout: f32,
}

/// Cache eines Forward-Passes ueber eine Sequenz.
pub struct EmbeddingCache {
    pub ids: Vec<usize>,
    /// Dropout-Maske mit Werten 0 oder 1/(1-p); None ausserhalb des Trainings.
    pub mask: Option<Array2<f32>>,
}

/// Cache der Batch-Variante.
pub struct EmbeddingBatchCache {
    pub ids: Array2<usize>,
    pub mask: Option<Array3<f32>>,
}

impl EmbeddingLayer {
    pub fn new(vocab_size: usize, dim: usize, dropout: f32, rng: &mut StdRng) -> Self {
        let normal = Normal::new(0.0, 0.02).expect("ungueltige Normalverteilung");
        EmbeddingLayer {
            table: Param::new(Array2::from_shape_fn((vocab_size, dim), |_| normal.sample(rng))),
            dropout,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.table.w.nrows()
    }

    pub fn dim(&self) -> usize {
        self.table.w.ncols()
    }

    fn check_id(&self, id: usize) {
        assert!(
            id < self.vocab_size(),
            "Token-Id {} liegt ausserhalb des Vokabulars ({})",
            id,
            self.vocab_size()
        );
    }

    /// Bettet eine Sequenz ein: [len] -> [len, dim].
    pub fn forward(&self, ids: &[usize], mode: Mode, rng: &mut StdRng) -> (Array2<f32>, EmbeddingCache) {
        let dim = self.dim();
        let mut out = Array2::<f32>::zeros((ids.len(), dim));
        for (i, &id) in ids.iter().enumerate() {
            self.check_id(id);
            out.row_mut(i).assign(&self.table.w.row(id));
        }
        let mask = if mode == Mode::Train && self.dropout > 0.0 {
            let p = self.dropout;
            let scale = 1.0 / (1.0 - p);
            Some(Array2::from_shape_fn((ids.len(), dim), |_| {
                if rng.random::<f32>() < p { 0.0 } else { scale }
            }))
        } else {
            None
        };
        if let Some(m) = &mask {
            out *= m;
        }
        (out, EmbeddingCache { ids: ids.to_vec(), mask })
    }

    /// Akkumuliert dL/dTabelle zeilenweise in den Gradientenpuffer.
    pub fn backward(&mut self, cache: &EmbeddingCache, grads: &Array2<f32>) {
        let effective = match &cache.mask {
            Some(m) => grads * m,
            None => grads.clone(),
        };
        for (i, &id) in cache.ids.iter().enumerate() {
            let mut row = self.table.grad.row_mut(id);
            row += &effective.row(i);
        }
    }

    /// Batch-Variante fuer den Encoder: [batch, seq] -> [batch, seq, dim].
    pub fn forward_batch(
        &self,
        ids: &Array2<usize>,
        mode: Mode,
        rng: &mut StdRng,
    ) -> (Array3<f32>, EmbeddingBatchCache) {
        let (bsz, t_max) = ids.dim();
        let dim = self.dim();
        let mut out = Array3::<f32>::zeros((bsz, t_max, dim));
        for i in 0..bsz {
            for j in 0..t_max {
                let id = ids[(i, j)];
                self.check_id(id);
                out.slice_mut(s![i, j, ..]).assign(&self.table.w.row(id));
            }
        }
        let mask = if mode == Mode::Train && self.dropout > 0.0 {
            let p = self.dropout;
            let scale = 1.0 / (1.0 - p);
            Some(Array3::from_shape_fn((bsz, t_max, dim), |_| {
                if rng.random::<f32>() < p { 0.0 } else { scale }
            }))
        } else {
            None
        };
        if let Some(m) = &mask {
            out *= m;
        }
        (out, EmbeddingBatchCache { ids: ids.clone(), mask })
    }

    pub fn backward_batch(&mut self, cache: &EmbeddingBatchCache, grads: &Array3<f32>) {
        let effective = match &cache.mask {
            Some(m) => grads * m,
            None => grads.clone(),
        };
        let (bsz, t_max) = cache.ids.dim();
        for i in 0..bsz {
            for j in 0..t_max {
                let id = cache.ids[(i, j)];
                let mut row = self.table.grad.row_mut(id);
                row += &effective.slice(s![i, j, ..]);
            }
        }
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.table]
    }

    pub fn parameter_count(&self) -> usize {
        self.table.parameter_count()
    }
}
