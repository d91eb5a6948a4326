// src/copy_layer.rs - generation + copy scores -> one distribution over V + C
use tch::{nn, nn::Module, Kind, Tensor};

use crate::cell::DecoderState;
use crate::config::OutputBlend;
use crate::ops::MASK_SENTINEL;

/// Learned generate-vs-copy gate (the `Switch` blend).
struct SwitchGate {
    h1: nn::Linear,
    h2: nn::Linear,
    out: nn::Linear,
}

impl SwitchGate {
    fn new(vs: &nn::Path, input_dim: i64) -> Self {
        Self {
            h1: nn::linear(vs / "switch_h1", input_dim, 64, Default::default()),
            h2: nn::linear(vs / "switch_h2", 64, 64, Default::default()),
            out: nn::linear(vs / "switch_out", 64, 1, Default::default()),
        }
    }

    /// p(copy) in (0, 1): [B, 1]
    fn forward(&self, x: &Tensor) -> Tensor {
        self.h1
            .forward(x)
            .tanh()
            .apply(&self.h2)
            .tanh()
            .apply(&self.out)
            .sigmoid()
    }
}

/// Inputs of one output step.
pub struct OutputStep<'a> {
    /// [B, H_dec + H_attn]
    pub cell_output: &'a Tensor,
    pub state: &'a DecoderState,
    /// [B, 2H]
    pub condition: &'a Tensor,
    /// [B, T] 1 valid / 0 pad
    pub memory_mask: &'a Tensor,
    /// decoder step input (switch gate only)
    pub step_input: &'a Tensor,
}

pub struct CopyLayer {
    vocab_projection: nn::Linear,
    copy_scale: Tensor,
    copy_offset: Tensor,
    switch: Option<SwitchGate>,
    vocab_size: i64,
    max_copy_size: i64,
    vocab_conditioning: bool,
}

impl CopyLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vs: &nn::Path,
        cell_output_size: i64,
        condition_size: i64,
        step_input_size: i64,
        hidden_size: i64,
        vocab_size: i64,
        max_copy_size: i64,
        blend: OutputBlend,
        vocab_conditioning: bool,
    ) -> Self {
        let proj_in = if vocab_conditioning {
            cell_output_size + condition_size
        } else {
            cell_output_size
        };
        let switch = match blend {
            OutputBlend::JointSoftmax => None,
            OutputBlend::Switch => Some(SwitchGate::new(
                &(vs / "switch"),
                condition_size * 2 + hidden_size + step_input_size,
            )),
        };
        Self {
            vocab_projection: nn::linear(vs / "vocab_projection", proj_in, vocab_size, Default::default()),
            copy_scale: vs.var("copy_scale", &[1], nn::Init::Const(1.0)),
            copy_offset: vs.var("copy_offset", &[1], nn::Init::Const(0.0)),
            switch,
            vocab_size,
            max_copy_size,
            vocab_conditioning,
        }
    }

    pub fn extended_size(&self) -> i64 {
        self.vocab_size + self.max_copy_size
    }

    fn vocab_logits(&self, step: &OutputStep) -> Tensor {
        if self.vocab_conditioning {
            self.vocab_projection
                .forward(&Tensor::cat(&[step.cell_output, step.condition], 1))
        } else {
            self.vocab_projection.forward(step.cell_output)
        }
    }

    /// [B, T] -> [B, C], filling slots past T with `fill`.
    fn to_copy_slots(&self, block: &Tensor, fill: f64) -> Tensor {
        let (b, t) = (block.size()[0], block.size()[1]);
        let c = self.max_copy_size;
        if t >= c {
            return block.narrow(1, 0, c);
        }
        let rest = Tensor::full([b, c - t], fill, (Kind::Float, block.device()));
        Tensor::cat(&[block, &rest], 1)
    }

    /// Unnormalized [B, V + C] scores for the joint softmax.
    pub fn logits(&self, step: &OutputStep) -> Tensor {
        let vocab = self.vocab_logits(step);
        let copy = (&step.state.copy_scores * &self.copy_scale + &self.copy_offset)
            .masked_fill(&step.memory_mask.eq(0.0), MASK_SENTINEL);
        Tensor::cat(&[vocab, self.to_copy_slots(&copy, MASK_SENTINEL)], 1)
    }

    /// Probability distribution [B, V + C]; rows sum to 1, slots past the passage get ~0.
    pub fn distribution(&self, step: &OutputStep) -> Tensor {
        match &self.switch {
            None => self.logits(step).softmax(-1, Kind::Float),
            Some(gate) => {
                let gate_in = Tensor::cat(
                    &[
                        &step.state.context,
                        step.condition,
                        &step.state.hidden(),
                        step.step_input,
                    ],
                    1,
                );
                let p_copy = gate.forward(&gate_in);
                let p_gen = p_copy.ones_like() - &p_copy;
                let vocab = self.vocab_logits(step).softmax(-1, Kind::Float) * p_gen;
                let copy = self.to_copy_slots(&(&step.state.alignments * &p_copy), 0.0);
                Tensor::cat(&[vocab, copy], 1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::nn::LSTMState;
    use tch::Device;

    const V: i64 = 10;
    const C: i64 = 8;

    fn state(t: i64, valid: i64) -> (DecoderState, Tensor) {
        let opts = (Kind::Float, Device::Cpu);
        let mask = Tensor::cat(&[Tensor::ones([1, valid], opts), Tensor::zeros([1, t - valid], opts)], 1);
        let alignments = (Tensor::randn([1, t], opts).masked_fill(&mask.eq(0.0), MASK_SENTINEL))
            .softmax(-1, Kind::Float);
        let st = DecoderState {
            lstm: LSTMState((Tensor::randn([1, 1, 5], opts), Tensor::zeros([1, 1, 5], opts))),
            attention: Tensor::zeros([1, 3], opts),
            context: Tensor::randn([1, 6], opts),
            alignments,
            copy_scores: Tensor::randn([1, t], opts),
        };
        (st, mask)
    }

    fn check(blend: OutputBlend, conditioning: bool) {
        tch::manual_seed(9);
        let vs = nn::VarStore::new(Device::Cpu);
        let layer = CopyLayer::new(&vs.root(), 8, 6, 4, 5, V, C, blend, conditioning);
        let (st, mask) = state(5, 5);
        let opts = (Kind::Float, Device::Cpu);
        let step = OutputStep {
            cell_output: &Tensor::randn([1, 8], opts),
            state: &st,
            condition: &Tensor::randn([1, 6], opts),
            memory_mask: &mask,
            step_input: &Tensor::randn([1, 4], opts),
        };
        let dist = layer.distribution(&step);
        assert_eq!(dist.size(), vec![1, V + C]);
        let total = f64::try_from(&dist.sum(Kind::Float)).unwrap();
        assert!((total - 1.0).abs() < 1e-5, "sum = {total}");
        let beyond = f64::try_from(&dist.narrow(1, V + 5, C - 5).sum(Kind::Float)).unwrap();
        assert!(beyond < 1e-12, "mass past the passage = {beyond}");
    }

    #[test]
    fn joint_softmax_is_normalized_over_extended_space() {
        check(OutputBlend::JointSoftmax, false);
        check(OutputBlend::JointSoftmax, true);
    }

    #[test]
    fn switch_blend_is_normalized_over_extended_space() {
        check(OutputBlend::Switch, false);
    }

    #[test]
    fn padded_passage_positions_get_no_mass() {
        tch::manual_seed(10);
        let vs = nn::VarStore::new(Device::Cpu);
        let layer = CopyLayer::new(&vs.root(), 8, 6, 4, 5, V, C, OutputBlend::JointSoftmax, false);
        // batch memory is 5 wide but this row only has 3 valid tokens
        let (st, mask) = state(5, 3);
        let opts = (Kind::Float, Device::Cpu);
        let step = OutputStep {
            cell_output: &Tensor::randn([1, 8], opts),
            state: &st,
            condition: &Tensor::zeros([1, 6], opts),
            memory_mask: &mask,
            step_input: &Tensor::zeros([1, 4], opts),
        };
        let dist = layer.distribution(&step);
        let beyond = f64::try_from(&dist.narrow(1, V + 3, C - 3).sum(Kind::Float)).unwrap();
        assert!(beyond < 1e-12);
        let copy_mass = f64::try_from(&dist.narrow(1, V, 3).sum(Kind::Float)).unwrap();
        assert!(copy_mass > 0.0);
    }
}
