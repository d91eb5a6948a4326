// src/beam.rs - beam-search decoding over the extended id space
use std::cmp::Ordering;

use tch::{Kind, Tensor};
use tracing::debug;

use crate::batch::Batch;
use crate::error::QgError;
use crate::model::QgModel;
use crate::ops::safe_log;
use crate::vocab::{EOS_ID, SOS_ID};

/// One partial question. `slot` is the decoder-state row (within its
/// example's block of `beam_width` rows) that continues this hypothesis.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    pub tokens: Vec<i64>,
    pub score: f64,
    pub finished: bool,
    pub slot: usize,
}

impl Hypothesis {
    pub fn start() -> Self {
        Self {
            tokens: Vec::new(),
            score: 0.0,
            finished: false,
            slot: 0,
        }
    }

    pub fn last_token(&self) -> i64 {
        self.tokens.last().copied().unwrap_or(SOS_ID)
    }
}

/// One round of pruning for a single example.
///
/// `proposals[i]` holds `(token, log_prob)` extensions of `beam[i]`, best
/// first; finished hypotheses carry forward as they are. The returned beam
/// keeps the top `width` by cumulative score, earlier candidates winning
/// ties, and each entry's `slot` names the parent row to copy state from.
pub fn select_beam(beam: &[Hypothesis], proposals: &[Vec<(i64, f64)>], width: usize) -> Vec<Hypothesis> {
    let mut candidates: Vec<Hypothesis> = Vec::new();
    for (hyp, extensions) in beam.iter().zip(proposals) {
        if hyp.finished {
            candidates.push(hyp.clone());
            continue;
        }
        for &(token, log_prob) in extensions.iter().take(width) {
            let mut tokens = hyp.tokens.clone();
            tokens.push(token);
            candidates.push(Hypothesis {
                tokens,
                score: hyp.score + log_prob,
                finished: token == EOS_ID,
                slot: hyp.slot,
            });
        }
    }
    // stable: equal scores keep first-seen order
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    candidates.truncate(width);
    candidates
}

/// Highest cumulative score, finished or not; first wins ties.
pub fn best(beam: &[Hypothesis]) -> Option<&Hypothesis> {
    beam.iter().fold(None, |acc: Option<&Hypothesis>, h| match acc {
        Some(b) if b.score >= h.score => Some(b),
        _ => Some(h),
    })
}

/// Decode every example of `batch`; returns generated extended ids (EOS kept
/// when produced, SOS dropped).
pub fn beam_search(
    model: &QgModel,
    batch: &Batch,
    beam_width: usize,
    max_decode_len: usize,
) -> Result<Vec<Vec<i64>>, QgError> {
    beam_search_with(model, batch, beam_width, max_decode_len, |_, _| {})
}

/// `beam_search`, calling `on_step(step, beams)` with every example's kept
/// hypotheses after each pruning round.
pub fn beam_search_with<F>(
    model: &QgModel,
    batch: &Batch,
    beam_width: usize,
    max_decode_len: usize,
    mut on_step: F,
) -> Result<Vec<Vec<i64>>, QgError>
where
    F: FnMut(usize, &[Vec<Hypothesis>]),
{
    if beam_width == 0 {
        return Err(crate::error::ConfigError::ZeroBeamWidth.into());
    }
    tch::no_grad(|| {
        let w = beam_width;
        let ctx = model.encode(batch, false)?.tile(w as i64);
        let mut state = model.initial_state(&ctx);
        let device = ctx.memory.values.device();
        let k = (w as i64).min(model.extended_size());
        // ids at or past V + passage_len carry no mass
        let limits: Vec<i64> = Vec::<i64>::try_from(&batch.context_len.to_kind(Kind::Int64))?
            .into_iter()
            .map(|len| model.vocab_size() + len)
            .collect();

        let mut beams: Vec<Vec<Hypothesis>> = (0..batch.size).map(|_| vec![Hypothesis::start()]).collect();

        for step in 0..max_decode_len {
            if beams.iter().all(|b| b.iter().all(|h| h.finished)) {
                debug!(step, "all hypotheses finished");
                break;
            }

            let prev: Vec<i64> = beams
                .iter()
                .flat_map(|b| (0..w).map(move |i| b.get(i).map_or(SOS_ID, Hypothesis::last_token)))
                .collect();
            let prev = Tensor::from_slice(&prev).to_device(device);
            let (dist, next) = model.step(&prev, &state, &ctx, false);

            let (values, indices) = safe_log(&dist).topk(k, -1, true, true);
            let values: Vec<f64> = Vec::try_from(&values.to_kind(Kind::Double).reshape([-1]))?;
            let indices: Vec<i64> = Vec::try_from(&indices.reshape([-1]))?;

            let mut rows = Vec::with_capacity(beams.len() * w);
            for (e, beam) in beams.iter_mut().enumerate() {
                let base = e * w;
                let limit = limits[e];
                let proposals: Vec<Vec<(i64, f64)>> = beam
                    .iter()
                    .map(|h| {
                        if h.finished {
                            return Vec::new();
                        }
                        let row = (base + h.slot) * k as usize;
                        (0..k as usize)
                            .map(|r| (indices[row + r], values[row + r]))
                            .filter(|&(id, _)| id < limit)
                            .collect()
                    })
                    .collect();

                let mut kept = select_beam(beam, &proposals, w);
                for (i, h) in kept.iter_mut().enumerate() {
                    rows.push((base + h.slot) as i64);
                    h.slot = i;
                }
                // unused slots just mirror the first row
                rows.extend(std::iter::repeat(base as i64).take(w - kept.len()));
                *beam = kept;
            }
            state = next.select_rows(&rows);
            on_step(step, &beams);
        }

        Ok(beams
            .iter()
            .map(|b| best(b).map(|h| h.tokens.clone()).unwrap_or_default())
            .collect())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hyp(tokens: &[i64], score: f64, finished: bool, slot: usize) -> Hypothesis {
        Hypothesis {
            tokens: tokens.to_vec(),
            score,
            finished,
            slot,
        }
    }

    #[test]
    fn first_step_expands_the_single_start_hypothesis() {
        let beam = vec![Hypothesis::start()];
        let proposals = vec![vec![(7, -0.1), (5, -0.5), (EOS_ID, -0.9)]];
        let next = select_beam(&beam, &proposals, 2);
        assert_eq!(next.len(), 2);
        assert_eq!(next[0].tokens, vec![7]);
        assert_eq!(next[1].tokens, vec![5]);
        assert!(next.iter().all(|h| h.slot == 0));
    }

    #[test]
    fn live_count_never_exceeds_width_and_scores_are_sorted() {
        let beam = vec![hyp(&[4], -1.0, false, 0), hyp(&[5], -1.2, false, 1), hyp(&[6], -3.0, false, 2)];
        let proposals = vec![
            vec![(8, -0.1), (9, -0.2), (10, -2.0)],
            vec![(8, -0.05), (9, -0.3), (10, -0.4)],
            vec![(8, -0.01), (9, -0.02), (10, -0.03)],
        ];
        let next = select_beam(&beam, &proposals, 3);
        assert_eq!(next.len(), 3);
        for pair in next.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert_eq!(next[0].tokens, vec![4, 8]);
        assert_eq!(next[1].tokens, vec![4, 9]);
        assert_eq!(next[2].tokens, vec![5, 8]);
        assert_eq!(next[2].slot, 1);
    }

    #[test]
    fn ties_keep_first_seen_order() {
        let beam = vec![hyp(&[4], -1.0, false, 0), hyp(&[5], -1.0, false, 1)];
        let proposals = vec![vec![(8, -0.5), (9, -0.5)], vec![(8, -0.5), (9, -0.5)]];
        let next = select_beam(&beam, &proposals, 2);
        assert_eq!(next[0].tokens, vec![4, 8]);
        assert_eq!(next[1].tokens, vec![4, 9]);
    }

    #[test]
    fn finished_hypotheses_carry_forward_unchanged() {
        let done = hyp(&[4, EOS_ID], -0.5, true, 0);
        let beam = vec![done.clone(), hyp(&[5], -0.6, false, 1)];
        let proposals = vec![Vec::new(), vec![(EOS_ID, -0.1), (6, -2.0)]];
        let next = select_beam(&beam, &proposals, 2);
        assert_eq!(next[0], done);
        assert_eq!(next[1].tokens, vec![5, EOS_ID]);
        assert!(next[1].finished);
        assert!((next[1].score - (-0.7)).abs() < 1e-12);
    }

    #[test]
    fn best_prefers_score_over_completion() {
        let beam = vec![hyp(&[4, EOS_ID], -2.0, true, 0), hyp(&[5, 6], -1.0, false, 1)];
        assert_eq!(best(&beam).unwrap().tokens, vec![5, 6]);
        assert!(best(&[]).is_none());
    }
}
