// src/attention.rs
use tch::{nn, nn::Module, Kind, Tensor};

use crate::ops::{sequence_mask, tile_batch, MASK_SENTINEL};

/// Memory bound to one decode: passage encoding, its pre-projected keys and the
/// validity mask. Built once after encoding and only read afterwards.
pub struct AttentionMemory {
    /// [B, T, 2H]
    pub values: Tensor,
    /// [B, T, A]
    pub keys: Tensor,
    /// [B, T] float, 1 valid / 0 pad
    pub mask: Tensor,
    /// [B]
    pub lengths: Tensor,
}

impl AttentionMemory {
    pub fn batch_size(&self) -> i64 {
        self.values.size()[0]
    }

    pub fn max_len(&self) -> i64 {
        self.values.size()[1]
    }

    /// Same memory with every row repeated `k` times (beam slots).
    pub fn tile(&self, k: i64) -> Self {
        Self {
            values: tile_batch(&self.values, k),
            keys: tile_batch(&self.keys, k),
            mask: tile_batch(&self.mask, k),
            lengths: tile_batch(&self.lengths, k),
        }
    }
}

/// One attention step. `scores` are the pre-softmax e_j (pad already at the
/// sentinel); they double as raw copy logits.
pub struct Attended {
    /// [B, 2H]
    pub context: Tensor,
    /// [B, T]
    pub alignments: Tensor,
    /// [B, T]
    pub scores: Tensor,
}

/// Bahdanau (additive) scorer: e_j = v . tanh(W_s s + W_m m_j)
pub struct AdditiveScorer {
    query_layer: nn::Linear,  // decoder hidden H_dec -> A
    memory_layer: nn::Linear, // memory 2H -> A
    v: Tensor,                // [A]
}

impl AdditiveScorer {
    pub fn new(vs: &nn::Path, query_dim: i64, memory_dim: i64, num_units: i64) -> Self {
        let no_bias = nn::LinearConfig {
            bias: false,
            ..Default::default()
        };
        let bound = (1.0 / num_units as f64).sqrt();
        Self {
            query_layer: nn::linear(vs / "query_layer", query_dim, num_units, no_bias),
            memory_layer: nn::linear(vs / "memory_layer", memory_dim, num_units, no_bias),
            v: vs.var("attention_v", &[num_units], nn::Init::Uniform { lo: -bound, up: bound }),
        }
    }

    /// Project the memory once per decode.
    pub fn bind(&self, memory: &Tensor, lengths: &Tensor) -> AttentionMemory {
        let t = memory.size()[1];
        AttentionMemory {
            values: memory.shallow_clone(),
            keys: self.memory_layer.forward(memory),
            mask: sequence_mask(lengths, t),
            lengths: lengths.shallow_clone(),
        }
    }

    /// Raw per-position scores [B, T]; padded positions set to the sentinel.
    pub fn score(&self, query: &Tensor, memory: &AttentionMemory) -> Tensor {
        let q = self.query_layer.forward(query).unsqueeze(1); // [B,1,A]
        let e = (q + &memory.keys).tanh().matmul(&self.v);    // [B,T]
        let pad = memory.mask.eq(0.0);
        e.masked_fill(&pad, MASK_SENTINEL)
    }

    /// Scores -> softmax alignments -> weighted context.
    pub fn attend(&self, query: &Tensor, memory: &AttentionMemory) -> Attended {
        let scores = self.score(query, memory);
        let alignments = scores.softmax(-1, Kind::Float) * &memory.mask; // exact zeros on pad
        let context = alignments.unsqueeze(1).bmm(&memory.values).squeeze_dim(1); // [B,2H]
        Attended {
            context,
            alignments,
            scores,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn setup() -> (nn::VarStore, AdditiveScorer) {
        tch::manual_seed(3);
        let vs = nn::VarStore::new(Device::Cpu);
        let scorer = AdditiveScorer::new(&vs.root(), 4, 6, 5);
        (vs, scorer)
    }

    #[test]
    fn alignments_normalize_over_valid_positions_only() {
        let (_vs, scorer) = setup();
        let memory = Tensor::randn([2, 5, 6], (Kind::Float, Device::Cpu));
        let lengths = Tensor::from_slice(&[3i64, 5]);
        let bound = scorer.bind(&memory, &lengths);
        let query = Tensor::randn([2, 4], (Kind::Float, Device::Cpu));

        let out = scorer.attend(&query, &bound);
        let sums: Vec<f32> = Vec::try_from(&out.alignments.sum_dim_intlist(&[1i64][..], false, Kind::Float)).unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
        let row0: Vec<f32> = Vec::try_from(&out.alignments.get(0)).unwrap();
        assert_eq!(row0[3], 0.0);
        assert_eq!(row0[4], 0.0);
        assert_eq!(out.context.size(), vec![2, 6]);
    }

    #[test]
    fn copy_scores_are_the_attention_scores() {
        let (_vs, scorer) = setup();
        let memory = Tensor::randn([1, 4, 6], (Kind::Float, Device::Cpu));
        let lengths = Tensor::from_slice(&[4i64]);
        let bound = scorer.bind(&memory, &lengths);
        let query = Tensor::randn([1, 4], (Kind::Float, Device::Cpu));

        let out = scorer.attend(&query, &bound);
        let direct = scorer.score(&query, &bound);
        let diff = f64::try_from(&(&out.scores - &direct).abs().max()).unwrap();
        assert!(diff < 1e-7);
        let renormalized = out.scores.softmax(-1, Kind::Float);
        let diff = f64::try_from(&(&out.alignments - &renormalized).abs().max()).unwrap();
        assert!(diff < 1e-6);
    }
}
