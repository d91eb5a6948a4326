// src/loss.rs - masked cross-entropy + answer suppression + entropy term
use tch::{Kind, Tensor};

use crate::ops::{safe_log, sequence_mask};

/// All terms of one batch loss; `total` is the one to backprop.
pub struct LossParts {
    pub total: Tensor,
    pub xe: Tensor,
    pub suppression: Tensor,
    pub entropy: Tensor,
}

#[derive(Debug, Clone, Copy)]
pub struct LossWeights {
    pub suppression: f64,
    pub entropy: f64,
}

/// [B, Q] -> scalar: sum over steps, mean over the batch.
fn per_example_mean(values: &Tensor) -> Tensor {
    values.sum_dim_intlist(&[1i64][..], false, Kind::Float).mean(Kind::Float)
}

/// -log p(target) at every valid step. probs: [B, Q, K], targets: [B, Q].
pub fn masked_cross_entropy(probs: &Tensor, targets: &Tensor, mask: &Tensor) -> Tensor {
    let picked = probs
        .gather(2, &targets.to_kind(Kind::Int64).unsqueeze(2), false)
        .squeeze_dim(2);
    per_example_mean(&(-safe_log(&picked) * mask))
}

/// [B, K] with 1.0 at every extended id used by a (valid) answer token.
pub fn answer_indicator(answer_ids: &Tensor, answer_len: &Tensor, extended_size: i64) -> Tensor {
    let b = answer_ids.size()[0];
    let width = answer_ids.size()[1];
    let valid = sequence_mask(answer_len, width);
    Tensor::zeros([b, extended_size], (Kind::Float, answer_ids.device()))
        .scatter_add(1, &answer_ids.to_kind(Kind::Int64), &valid)
        .clamp_max(1.0)
}

/// Mass put on answer ids, over all valid steps.
pub fn suppression(probs: &Tensor, indicator: &Tensor, mask: &Tensor) -> Tensor {
    let on_answer = (probs * indicator.unsqueeze(1)).sum_dim_intlist(&[2i64][..], false, Kind::Float);
    per_example_mean(&(on_answer * mask))
}

/// sum q log q over valid steps (negative entropy, so lower means flatter).
pub fn negative_entropy(probs: &Tensor, mask: &Tensor) -> Tensor {
    let plogp = (probs * safe_log(probs)).sum_dim_intlist(&[2i64][..], false, Kind::Float);
    per_example_mean(&(plogp * mask))
}

/// Full training objective for a teacher-forced unroll.
pub fn question_loss(
    probs: &Tensor,
    targets: &Tensor,
    target_len: &Tensor,
    answer_ids: &Tensor,
    answer_len: &Tensor,
    weights: LossWeights,
) -> LossParts {
    let steps = probs.size()[1];
    let k = probs.size()[2];
    let mask = sequence_mask(target_len, steps);

    let xe = masked_cross_entropy(probs, targets, &mask);
    let indicator = answer_indicator(answer_ids, answer_len, k);
    let suppression = suppression(probs, &indicator, &mask);
    let entropy = negative_entropy(probs, &mask);
    let total = &xe + &suppression * weights.suppression + &entropy * weights.entropy;

    LossParts {
        total,
        xe,
        suppression,
        entropy,
    }
}

/// Token match rate over the masked question length.
pub fn accuracy(probs: &Tensor, targets: &Tensor, target_len: &Tensor) -> Tensor {
    let mask = sequence_mask(target_len, targets.size()[1]);
    let hits = probs
        .argmax(-1, false)
        .eq_tensor(&targets.to_kind(Kind::Int64))
        .to_kind(Kind::Float);
    (hits * &mask).sum(Kind::Float) / mask.sum(Kind::Float).clamp_min(1.0)
}
