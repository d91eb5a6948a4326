// src/model.rs - encoder + bridge + copy-attention decoder behind one step function
use std::collections::HashMap;

use tch::{nn, nn::Module, Kind, Tensor};
use tracing::debug;

use crate::attention::AttentionMemory;
use crate::batch::Batch;
use crate::bridge::StateBridge;
use crate::cell::{Cell, CopyAttentionCell, DecoderState};
use crate::config::ModelConfig;
use crate::copy_layer::{CopyLayer, OutputStep};
use crate::encoder::{ContextAnswerEncoder, EncoderInput, Encoding};
use crate::error::QgError;
use crate::ops::coerce_to_vocab;
use crate::vocab::{OOV_ID, SOS_ID};

/// Read-only products of encoding one batch.
pub struct DecodeContext {
    pub encoding: Encoding,
    pub memory: AttentionMemory,
}

impl DecodeContext {
    /// Every row repeated `k` times, one copy per beam slot.
    pub fn tile(&self, k: i64) -> Self {
        Self {
            encoding: self.encoding.tile(k),
            memory: self.memory.tile(k),
        }
    }
}

pub struct QgModel {
    embedding: nn::Embedding,
    encoder: ContextAnswerEncoder,
    bridge: StateBridge,
    cell: CopyAttentionCell,
    output: CopyLayer,
    cfg: ModelConfig,
    vocab_size: i64,
}

impl QgModel {
    pub fn new(vs: &nn::Path, vocab_size: i64, cfg: &ModelConfig) -> Self {
        let e = cfg.embedding_size;
        let c = cfg.max_copy_size as i64;
        let memory_dim = cfg.memory_dim();

        let embedding = nn::embedding(vs / "word_embeddings", vocab_size, e, Default::default());
        let encoder = ContextAnswerEncoder::new(
            &(vs / "encoder"),
            e,
            cfg.context_encoder_units,
            vocab_size,
            cfg.condition,
            cfg.dropout,
        );
        let bridge = StateBridge::new(vs, memory_dim, cfg.decoder_units);
        // step input = word embedding ++ one-hot over the copy slots
        let cell = CopyAttentionCell::new(
            &(vs / "decoder"),
            e + c,
            cfg.decoder_units,
            memory_dim,
            cfg.attention_layer_size,
            cfg.dropout,
        );
        let output = CopyLayer::new(
            &(vs / "output"),
            cell.output_size(cfg.decoder_units),
            memory_dim,
            e + c,
            cfg.decoder_units,
            vocab_size,
            c,
            cfg.blend,
            cfg.vocab_conditioning,
        );

        Self {
            embedding,
            encoder,
            bridge,
            cell,
            output,
            cfg: cfg.clone(),
            vocab_size,
        }
    }

    pub fn vocab_size(&self) -> i64 {
        self.vocab_size
    }

    /// V + C
    pub fn extended_size(&self) -> i64 {
        self.output.extended_size()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    /// Overwrite embedding rows once from pretrained vectors; returns rows written.
    pub fn load_pretrained(&self, vectors: &HashMap<i64, Vec<f32>>) -> usize {
        let ws = &self.embedding.ws;
        let dim = ws.size()[1] as usize;
        tch::no_grad(|| {
            let mut written = 0;
            for (&id, values) in vectors {
                if id < 0 || id >= self.vocab_size || values.len() != dim {
                    continue;
                }
                let mut row = ws.get(id);
                row.copy_(&Tensor::from_slice(values).to_device(ws.device()));
                written += 1;
            }
            written
        })
    }

    /// Encode passage + answer and bind the attention memory.
    pub fn encode(&self, batch: &Batch, train: bool) -> Result<DecodeContext, QgError> {
        self.cfg.check_passages(batch.max_context_len() as usize)?;

        let input = EncoderInput {
            context_ids: &batch.context_ids,
            context_len: &batch.context_len,
            answer_ids: &batch.answer_ids,
            answer_len: &batch.answer_len,
            answer_start: &batch.answer_start,
        };
        let encoding = self.encoder.encode(&self.embedding, &input, train);
        let memory = self.cell.scorer().bind(&encoding.memory, &encoding.context_len);
        Ok(DecodeContext { encoding, memory })
    }

    pub fn initial_state(&self, ctx: &DecodeContext) -> DecoderState {
        let lstm = self.bridge.initial_state(&ctx.encoding);
        self.cell.initial_state(lstm, &ctx.memory)
    }

    /// [B] extended ids -> [B, E + C] decoder input.
    ///
    /// Ids below V use their word embedding; copy ids get the OOV embedding
    /// plus a one-hot marking which passage position was copied.
    pub fn step_input(&self, ids: &Tensor) -> Tensor {
        let ids = ids.to_kind(Kind::Int64);
        let c = self.cfg.max_copy_size as i64;
        let words = self
            .embedding
            .forward(&coerce_to_vocab(&ids, self.vocab_size, OOV_ID));
        let is_copy = ids.ge(self.vocab_size).to_kind(Kind::Float).unsqueeze(1);
        let slot = (&ids - self.vocab_size).clamp(0, c - 1);
        let identity = slot.one_hot(c).to_kind(Kind::Float) * is_copy;
        Tensor::cat(&[words, identity], 1)
    }

    /// One decode step: previous ids [B] + state -> (distribution [B, V + C], state).
    /// Training unroll and beam search both go through here.
    pub fn step(
        &self,
        prev_ids: &Tensor,
        state: &DecoderState,
        ctx: &DecodeContext,
        train: bool,
    ) -> (Tensor, DecoderState) {
        let x = self.step_input(prev_ids);
        let (cell_output, next) = self.cell.bind(&ctx.memory, train).step(&x, state);
        let dist = self.output.distribution(&OutputStep {
            cell_output: &cell_output,
            state: &next,
            condition: &ctx.encoding.condition,
            memory_mask: &ctx.memory.mask,
            step_input: &x,
        });
        (dist, next)
    }

    /// Teacher-forced inputs: SOS followed by the gold question shifted right.
    pub fn teacher_inputs(question_ids: &Tensor) -> Tensor {
        let (b, q) = (question_ids.size()[0], question_ids.size()[1]);
        let sos = Tensor::full([b, 1], SOS_ID, (Kind::Int64, question_ids.device()));
        Tensor::cat(&[sos, question_ids.narrow(1, 0, q - 1)], 1)
    }

    /// Unroll over the gold question: [B, Q, V + C].
    pub fn forward_teacher(&self, batch: &Batch, train: bool) -> Result<Tensor, QgError> {
        let ctx = self.encode(batch, train)?;
        let mut state = self.initial_state(&ctx);
        let inputs = Self::teacher_inputs(&batch.question_ids);
        let steps = inputs.size()[1];
        debug!(batch = batch.size, steps, "teacher-forced unroll");

        let mut dists = Vec::with_capacity(steps as usize);
        for t in 0..steps {
            let (dist, next) = self.step(&inputs.select(1, t), &state, &ctx, train);
            dists.push(dist);
            state = next;
        }
        Ok(Tensor::stack(&dists, 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn tiny() -> ModelConfig {
        ModelConfig {
            embedding_size: 4,
            context_encoder_units: 3,
            decoder_units: 5,
            attention_layer_size: 4,
            max_copy_size: 8,
            dropout: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn step_input_uses_identity_channel_for_copies() {
        tch::manual_seed(1);
        let vs = nn::VarStore::new(Device::Cpu);
        let model = QgModel::new(&vs.root(), 10, &tiny());
        let x = model.step_input(&Tensor::from_slice(&[4i64, 11]));
        assert_eq!(x.size(), vec![2, 4 + 8]);

        let word_row: Vec<f32> = Vec::try_from(&x.get(0).narrow(0, 4, 8)).unwrap();
        assert!(word_row.iter().all(|v| *v == 0.0));

        let copy_row: Vec<f32> = Vec::try_from(&x.get(1).narrow(0, 4, 8)).unwrap();
        assert_eq!(copy_row, vec![0., 1., 0., 0., 0., 0., 0., 0.]);

        let oov = model.embedding.forward(&Tensor::from_slice(&[OOV_ID]));
        let emb_part = x.get(1).narrow(0, 0, 4);
        assert!(f64::try_from(&(&emb_part - oov.get(0)).abs().max()).unwrap() < 1e-7);
    }

    #[test]
    fn teacher_inputs_shift_right_after_sos() {
        let q = Tensor::from_slice(&[11i64, 4, 3]).view([1, 3]);
        let inputs: Vec<i64> = Vec::try_from(&QgModel::teacher_inputs(&q).view([-1])).unwrap();
        assert_eq!(inputs, vec![SOS_ID, 11, 4]);
    }

    #[test]
    fn pretrained_rows_are_overwritten() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = QgModel::new(&vs.root(), 10, &tiny());
        let mut vectors = HashMap::new();
        vectors.insert(5i64, vec![1.0f32, 2.0, 3.0, 4.0]);
        vectors.insert(6i64, vec![1.0f32]); // wrong width, skipped
        assert_eq!(model.load_pretrained(&vectors), 1);
        let row: Vec<f32> = Vec::try_from(&model.embedding.ws.get(5)).unwrap();
        assert_eq!(row, vec![1.0, 2.0, 3.0, 4.0]);
    }
}
