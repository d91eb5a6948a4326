// src/cell.rs - recurrent cell contract + copy-attention wrapper around an LSTM
use tch::{nn, nn::LSTMState, nn::Module, nn::RNN, Kind, Tensor};

use crate::attention::{AdditiveScorer, AttentionMemory};
use crate::ops::gather_rows;

/// Standard step contract: (input, prior_state) -> (output, new_state).
pub trait Cell {
    type State;

    fn step(&self, input: &Tensor, state: &Self::State) -> (Tensor, Self::State);
}

/// Everything carried between decoder steps.
pub struct DecoderState {
    pub lstm: LSTMState,
    /// [B, H_attn] attention vector fed into the next step
    pub attention: Tensor,
    /// [B, 2H] weighted memory
    pub context: Tensor,
    /// [B, T]
    pub alignments: Tensor,
    /// [B, T] raw scores from the last step, reused as copy logits
    pub copy_scores: Tensor,
}

impl DecoderState {
    /// Rows reordered/duplicated by `index` (beam parents).
    pub fn select_rows(&self, index: &[i64]) -> Self {
        let LSTMState((h, c)) = &self.lstm;
        let idx = Tensor::from_slice(index).to_device(h.device());
        Self {
            lstm: LSTMState((h.index_select(1, &idx), c.index_select(1, &idx))),
            attention: gather_rows(&self.attention, index),
            context: gather_rows(&self.context, index),
            alignments: gather_rows(&self.alignments, index),
            copy_scores: gather_rows(&self.copy_scores, index),
        }
    }

    pub fn hidden(&self) -> Tensor {
        self.lstm.h().squeeze_dim(0)
    }
}

pub struct CopyAttentionCell {
    lstm: nn::LSTM,
    scorer: AdditiveScorer,
    attention_layer: nn::Linear,
    attention_size: i64,
    dropout: f64,
}

impl CopyAttentionCell {
    pub fn new(
        vs: &nn::Path,
        input_dim: i64,
        decoder_units: i64,
        memory_dim: i64,
        attention_size: i64,
        dropout: f64,
    ) -> Self {
        let lstm = nn::lstm(vs / "lstm", input_dim + attention_size, decoder_units, Default::default());
        let scorer = AdditiveScorer::new(&(vs / "attention"), decoder_units, memory_dim, decoder_units);
        let attention_layer = nn::linear(
            vs / "attention_layer",
            decoder_units + memory_dim,
            attention_size,
            nn::LinearConfig {
                bias: false,
                ..Default::default()
            },
        );
        Self {
            lstm,
            scorer,
            attention_layer,
            attention_size,
            dropout,
        }
    }

    pub fn scorer(&self) -> &AdditiveScorer {
        &self.scorer
    }

    /// cell output (H_dec) + attention vector (H_attn)
    pub fn output_size(&self, decoder_units: i64) -> i64 {
        decoder_units + self.attention_size
    }

    /// Wrap an LSTM state with zeroed attention fields sized for `memory`.
    pub fn initial_state(&self, lstm: LSTMState, memory: &AttentionMemory) -> DecoderState {
        let device = memory.values.device();
        let (b, t, d) = (memory.batch_size(), memory.max_len(), memory.values.size()[2]);
        DecoderState {
            lstm,
            attention: Tensor::zeros([b, self.attention_size], (Kind::Float, device)),
            context: Tensor::zeros([b, d], (Kind::Float, device)),
            alignments: Tensor::zeros([b, t], (Kind::Float, device)),
            copy_scores: Tensor::zeros([b, t], (Kind::Float, device)),
        }
    }

    /// Attach the cell to one decode's memory and mode.
    pub fn bind<'a>(&'a self, memory: &'a AttentionMemory, train: bool) -> BoundCell<'a> {
        BoundCell {
            cell: self,
            memory,
            train,
        }
    }
}

/// A `CopyAttentionCell` tied to a memory; this is what decode loops step.
pub struct BoundCell<'a> {
    cell: &'a CopyAttentionCell,
    memory: &'a AttentionMemory,
    train: bool,
}

impl Cell for BoundCell<'_> {
    type State = DecoderState;

    fn step(&self, input: &Tensor, state: &DecoderState) -> (Tensor, DecoderState) {
        let cell = self.cell;
        let x = input.dropout(cell.dropout, self.train);
        let lstm_in = Tensor::cat(&[&x, &state.attention], 1);
        let lstm = cell.lstm.step(&lstm_in, &state.lstm);

        let cell_out = lstm.h().squeeze_dim(0); // [B,H_dec]
        let attended = cell.scorer.attend(&cell_out, self.memory);
        let attention = cell
            .attention_layer
            .forward(&Tensor::cat(&[&cell_out, &attended.context], 1));

        let output = Tensor::cat(&[&cell_out, &attention], 1);
        let next = DecoderState {
            lstm,
            attention,
            context: attended.context,
            alignments: attended.alignments,
            copy_scores: attended.scores,
        };
        (output, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn step_shapes_and_state_threading() {
        tch::manual_seed(2);
        let vs = nn::VarStore::new(Device::Cpu);
        let cell = CopyAttentionCell::new(&vs.root(), 3, 5, 6, 4, 0.0);
        let memory = cell
            .scorer()
            .bind(&Tensor::randn([2, 7, 6], (Kind::Float, Device::Cpu)), &Tensor::from_slice(&[7i64, 2]));
        let lstm = LSTMState((
            Tensor::zeros([1, 2, 5], (Kind::Float, Device::Cpu)),
            Tensor::zeros([1, 2, 5], (Kind::Float, Device::Cpu)),
        ));
        let state = cell.initial_state(lstm, &memory);
        let bound = cell.bind(&memory, false);

        let input = Tensor::randn([2, 3], (Kind::Float, Device::Cpu));
        let (out, next) = bound.step(&input, &state);
        assert_eq!(out.size(), vec![2, cell.output_size(5)]);
        assert_eq!(next.copy_scores.size(), vec![2, 7]);
        assert_eq!(next.attention.size(), vec![2, 4]);

        let (out2, _) = bound.step(&input, &next);
        let moved = f64::try_from(&(&out2 - &out).abs().max()).unwrap();
        assert!(moved > 0.0, "state must feed back into the next step");
    }

    #[test]
    fn inference_steps_are_deterministic() {
        tch::manual_seed(4);
        let vs = nn::VarStore::new(Device::Cpu);
        let cell = CopyAttentionCell::new(&vs.root(), 3, 5, 6, 4, 0.5);
        let memory = cell
            .scorer()
            .bind(&Tensor::randn([1, 3, 6], (Kind::Float, Device::Cpu)), &Tensor::from_slice(&[3i64]));
        let lstm = LSTMState((
            Tensor::zeros([1, 1, 5], (Kind::Float, Device::Cpu)),
            Tensor::zeros([1, 1, 5], (Kind::Float, Device::Cpu)),
        ));
        let state = cell.initial_state(lstm, &memory);
        let bound = cell.bind(&memory, false);
        let input = Tensor::ones([1, 3], (Kind::Float, Device::Cpu));
        let (a, _) = bound.step(&input, &state);
        let (b, _) = bound.step(&input, &state);
        assert_eq!(f64::try_from(&(&a - &b).abs().max()).unwrap(), 0.0);
    }

    #[test]
    fn training_steps_apply_dropout() {
        tch::manual_seed(4);
        let vs = nn::VarStore::new(Device::Cpu);
        let cell = CopyAttentionCell::new(&vs.root(), 32, 5, 6, 4, 0.5);
        let memory = cell
            .scorer()
            .bind(&Tensor::randn([1, 3, 6], (Kind::Float, Device::Cpu)), &Tensor::from_slice(&[3i64]));
        let lstm = LSTMState((
            Tensor::zeros([1, 1, 5], (Kind::Float, Device::Cpu)),
            Tensor::zeros([1, 1, 5], (Kind::Float, Device::Cpu)),
        ));
        let state = cell.initial_state(lstm, &memory);
        let bound = cell.bind(&memory, true);
        let input = Tensor::randn([1, 32], (Kind::Float, Device::Cpu));
        let (a, _) = bound.step(&input, &state);
        let (b, _) = bound.step(&input, &state);
        assert!(f64::try_from(&(&a - &b).abs().max()).unwrap() > 0.0);
    }

    #[test]
    fn select_rows_follows_index() {
        let device = Device::Cpu;
        let state = DecoderState {
            lstm: LSTMState((
                Tensor::from_slice(&[1f32, 2.]).view([1, 2, 1]),
                Tensor::from_slice(&[3f32, 4.]).view([1, 2, 1]),
            )),
            attention: Tensor::from_slice(&[5f32, 6.]).view([2, 1]),
            context: Tensor::zeros([2, 1], (Kind::Float, device)),
            alignments: Tensor::zeros([2, 1], (Kind::Float, device)),
            copy_scores: Tensor::zeros([2, 1], (Kind::Float, device)),
        };
        let picked = state.select_rows(&[1, 1, 0]);
        let h: Vec<f32> = Vec::try_from(&picked.lstm.h().reshape([-1])).unwrap();
        let a: Vec<f32> = Vec::try_from(&picked.attention.reshape([-1])).unwrap();
        assert_eq!(h, vec![2., 2., 1.]);
        assert_eq!(a, vec![6., 6., 5.]);
    }
}
