// src/metrics.rs - sentence BLEU / ROUGE-1 between generated and gold questions
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, Default)]
pub struct BleuScore {
    /// modified n-gram precisions, n = 1..=4
    pub precisions: [f64; 4],
    pub brevity_penalty: f64,
    pub bleu: f64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Rouge {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

fn count_ngrams<'a>(tokens: &'a [String], n: usize) -> HashMap<&'a [String], usize> {
    let mut counts = HashMap::new();
    if n > 0 {
        for gram in tokens.windows(n) {
            *counts.entry(gram).or_insert(0) += 1;
        }
    }
    counts
}

/// (clipped matches, candidate n-grams, reference n-grams)
fn overlap(reference: &[String], candidate: &[String], n: usize) -> (usize, usize, usize) {
    let refs = count_ngrams(reference, n);
    let cands = count_ngrams(candidate, n);
    let matched = cands
        .iter()
        .map(|(gram, &c)| c.min(refs.get(gram).copied().unwrap_or(0)))
        .sum();
    (matched, cands.values().sum(), refs.values().sum())
}

/// Sentence BLEU-4 with brevity penalty, unsmoothed.
pub fn bleu(reference: &[String], candidate: &[String]) -> BleuScore {
    if reference.is_empty() || candidate.is_empty() {
        return BleuScore::default();
    }
    let mut precisions = [0.0; 4];
    for (i, p) in precisions.iter_mut().enumerate() {
        let (matched, total, _) = overlap(reference, candidate, i + 1);
        if total > 0 {
            *p = matched as f64 / total as f64;
        }
    }

    let (c, r) = (candidate.len() as f64, reference.len() as f64);
    let brevity_penalty = if c > r { 1.0 } else { (1.0 - r / c).exp() };
    let bleu = if precisions.iter().all(|p| *p > 0.0) {
        let log_mean = precisions.iter().map(|p| p.ln()).sum::<f64>() / 4.0;
        brevity_penalty * log_mean.exp()
    } else {
        0.0
    };

    BleuScore {
        precisions,
        brevity_penalty,
        bleu,
    }
}

/// Unigram overlap.
pub fn rouge_1(reference: &[String], candidate: &[String]) -> Rouge {
    let (matched, cand_total, ref_total) = overlap(reference, candidate, 1);
    if cand_total == 0 || ref_total == 0 {
        return Rouge::default();
    }
    let precision = matched as f64 / cand_total as f64;
    let recall = matched as f64 / ref_total as f64;
    let f1 = if matched == 0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };
    Rouge { precision, recall, f1 }
}

/// Running means over a decode run.
#[derive(Debug, Default)]
pub struct ScoreSummary {
    bleu: f64,
    rouge_f1: f64,
    count: usize,
}

impl ScoreSummary {
    pub fn add(&mut self, reference: &[String], candidate: &[String]) {
        self.bleu += bleu(reference, candidate).bleu;
        self.rouge_f1 += rouge_1(reference, candidate).f1;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// (mean BLEU, mean ROUGE-1 F1)
    pub fn means(&self) -> (f64, f64) {
        if self.count == 0 {
            return (0.0, 0.0);
        }
        let n = self.count as f64;
        (self.bleu / n, self.rouge_f1 / n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_loader::tokenize;

    #[test]
    fn identical_sentences_score_one() {
        let q = tokenize("what is the capital of france ?");
        let score = bleu(&q, &q);
        assert!((score.bleu - 1.0).abs() < 1e-12);
        assert!((rouge_1(&q, &q).f1 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn short_candidate_is_penalized() {
        let reference = tokenize("what is the capital of france ?");
        let candidate = tokenize("what is the capital ?");
        let score = bleu(&reference, &candidate);
        assert_eq!(score.precisions[0], 1.0);
        assert!(score.brevity_penalty < 1.0);
    }

    #[test]
    fn clipped_unigram_counts() {
        let reference = tokenize("the cat");
        let candidate = tokenize("the the the");
        let score = bleu(&reference, &candidate);
        assert!((score.precisions[0] - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(score.bleu, 0.0);
    }

    #[test]
    fn rouge_precision_and_recall() {
        let reference = tokenize("who wrote hamlet");
        let candidate = tokenize("who wrote it ?");
        let r = rouge_1(&reference, &candidate);
        assert!((r.precision - 0.5).abs() < 1e-12);
        assert!((r.recall - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn empty_inputs_score_zero() {
        let q = tokenize("why ?");
        assert_eq!(bleu(&q, &[]).bleu, 0.0);
        assert_eq!(rouge_1(&[], &q).f1, 0.0);
        let mut summary = ScoreSummary::default();
        assert_eq!(summary.means(), (0.0, 0.0));
        summary.add(&q, &q);
        assert_eq!(summary.count(), 1);
    }
}
