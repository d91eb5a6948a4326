// src/encoder.rs - passage encoder + answer-conditioned encoder
use tch::{nn, nn::LSTMState, nn::Module, nn::RNN, Kind, Tensor};

use crate::config::ConditionSource;
use crate::ops::{coerce_to_vocab, sequence_mask, tile_batch};
use crate::vocab::OOV_ID;

/// Output of a length-masked bidirectional run.
pub struct BiOutput {
    /// [B, T, 2U], zero past each row's length
    pub outputs: Tensor,
    /// [B, 2U] cell state at each row's last valid step (fwd ++ bwd)
    pub final_cell: Tensor,
}

/// Two single-direction LSTMs stepped with a length mask, so padding never
/// leaks into either direction and final states stop at the true length.
pub struct BiLstm {
    fwd: nn::LSTM,
    bwd: nn::LSTM,
}

impl BiLstm {
    pub fn new(vs: &nn::Path, input_dim: i64, units: i64) -> Self {
        let cfg = nn::RNNConfig::default();
        Self {
            fwd: nn::lstm(vs / "fwd", input_dim, units, cfg),
            bwd: nn::lstm(vs / "bwd", input_dim, units, cfg),
        }
    }

    /// input: [B,T,F], lengths: [B]
    pub fn forward(&self, input: &Tensor, lengths: &Tensor) -> BiOutput {
        let (b, t) = (input.size()[0], input.size()[1]);
        let mask = sequence_mask(lengths, t); // [B,T]

        let run = |cell: &nn::LSTM, order: Vec<i64>| {
            let mut state = cell.zero_state(b);
            let mut outs: Vec<Option<Tensor>> = (0..t).map(|_| None).collect();
            for step in order {
                let x = input.select(1, step);
                let next = cell.step(&x, &state);
                let m = mask.select(1, step).view([1, b, 1]);
                let keep = m.ones_like() - &m;
                let h = &m * next.h() + &keep * state.h();
                let c = &m * next.c() + &keep * state.c();
                outs[step as usize] = Some(h.squeeze_dim(0) * m.squeeze_dim(0));
                state = LSTMState((h, c));
            }
            let outs: Vec<Tensor> = outs.into_iter().flatten().collect();
            (outs, state.c().squeeze_dim(0))
        };

        let (fwd_out, fwd_c) = run(&self.fwd, (0..t).collect());
        let (bwd_out, bwd_c) = run(&self.bwd, (0..t).rev().collect());

        let outputs = if t == 0 {
            Tensor::zeros([b, 0, fwd_c.size()[1] * 2], (Kind::Float, input.device()))
        } else {
            Tensor::cat(&[Tensor::stack(&fwd_out, 1), Tensor::stack(&bwd_out, 1)], 2)
        };
        BiOutput {
            outputs,
            final_cell: Tensor::cat(&[fwd_c, bwd_c], 1),
        }
    }
}

/// 1.0 on [start, start+len), 0.0 elsewhere: [B, T]
pub fn in_answer_feature(answer_start: &Tensor, answer_len: &Tensor, max_len: i64) -> Tensor {
    let device = answer_start.device();
    let b = answer_start.size()[0];
    let positions = Tensor::arange(max_len, (Kind::Int64, device))
        .unsqueeze(0)
        .expand([b, max_len], false);
    let start = answer_start.to_kind(Kind::Int64).unsqueeze(1);
    let end = &start + answer_len.to_kind(Kind::Int64).unsqueeze(1);
    positions
        .ge_tensor(&start)
        .logical_and(&positions.lt_tensor(&end))
        .to_kind(Kind::Float)
}

/// Passage positions under the answer, clamped into [0, passage_len - 1]: [B, A]
pub fn answer_positions(answer_start: &Tensor, width: i64, context_len: &Tensor) -> Tensor {
    let device = answer_start.device();
    let offsets = Tensor::arange(width, (Kind::Int64, device)).unsqueeze(0);
    let idx = answer_start.to_kind(Kind::Int64).unsqueeze(1) + offsets;
    let last = (context_len.to_kind(Kind::Int64) - 1).clamp_min(0).unsqueeze(1);
    idx.minimum(&last).clamp_min(0)
}

/// Everything the decoder reads; nothing here is mutated after `encode`.
pub struct Encoding {
    /// [B, T, 2H]
    pub memory: Tensor,
    /// [B]
    pub context_len: Tensor,
    /// [B, 2H]
    pub condition: Tensor,
    /// [B, T]
    pub in_answer: Tensor,
}

impl Encoding {
    pub fn tile(&self, k: i64) -> Self {
        Self {
            memory: tile_batch(&self.memory, k),
            context_len: tile_batch(&self.context_len, k),
            condition: tile_batch(&self.condition, k),
            in_answer: tile_batch(&self.in_answer, k),
        }
    }
}

/// Raw inputs the encoder consumes, borrowed from a `Batch`.
pub struct EncoderInput<'a> {
    pub context_ids: &'a Tensor,
    pub context_len: &'a Tensor,
    pub answer_ids: &'a Tensor,
    pub answer_len: &'a Tensor,
    pub answer_start: &'a Tensor,
}

pub struct ContextAnswerEncoder {
    context_encoder: BiLstm,
    answer_encoder: BiLstm,
    condition: ConditionSource,
    dropout: f64,
    vocab_size: i64,
}

impl ContextAnswerEncoder {
    pub fn new(
        vs: &nn::Path,
        embedding_size: i64,
        units: i64,
        vocab_size: i64,
        condition: ConditionSource,
        dropout: f64,
    ) -> Self {
        // +1 for the in-answer channel
        let context_encoder = BiLstm::new(&(vs / "context_encoder"), embedding_size + 1, units);
        let answer_encoder = BiLstm::new(&(vs / "a_encoder"), units * 2 + embedding_size, units);
        Self {
            context_encoder,
            answer_encoder,
            condition,
            dropout,
            vocab_size,
        }
    }

    pub fn encode(&self, embedding: &nn::Embedding, input: &EncoderInput, train: bool) -> Encoding {
        let t = input.context_ids.size()[1];

        let context_emb = embedding.forward(&coerce_to_vocab(input.context_ids, self.vocab_size, OOV_ID));
        let in_answer = in_answer_feature(input.answer_start, input.answer_len, t);
        let augmented = Tensor::cat(&[context_emb, in_answer.unsqueeze(2)], 2).dropout(self.dropout, train);
        let memory = self.context_encoder.forward(&augmented, input.context_len).outputs; // [B,T,2H]

        // extractive condition: memory rows under the answer ++ answer embeddings
        let (b, width) = (input.answer_ids.size()[0], input.answer_ids.size()[1]);
        let d = memory.size()[2];
        let idx = answer_positions(input.answer_start, width, input.context_len);
        let span = memory.gather(1, &idx.unsqueeze(2).expand([b, width, d], false), false); // [B,A,2H]

        let condition = match self.condition {
            ConditionSource::SpanMean => {
                let n = input.answer_len.to_kind(Kind::Int64).clamp_min(1);
                let m = sequence_mask(&n, width).unsqueeze(2);
                (&span * m).sum_dim_intlist(&[1i64][..], false, Kind::Float)
                    / n.to_kind(Kind::Float).unsqueeze(1)
            }
            ConditionSource::AnswerEncoder => {
                let answer_emb = embedding.forward(&coerce_to_vocab(input.answer_ids, self.vocab_size, OOV_ID));
                let cond_in = Tensor::cat(&[&span, &answer_emb], 2).dropout(self.dropout, train);
                self.answer_encoder.forward(&cond_in, input.answer_len).final_cell
            }
        };

        Encoding {
            memory,
            context_len: input.context_len.shallow_clone(),
            condition,
            in_answer,
        }
    }
}
