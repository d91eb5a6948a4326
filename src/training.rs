// src/training.rs - teacher-forced training loop, validation and beam generation
use std::path::Path;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tch::{nn, Device, Tensor};
use tracing::{debug, info, warn};

use crate::batch::Batch;
use crate::beam::beam_search;
use crate::config::TrainConfig;
use crate::data_loader::Example;
use crate::loss::{accuracy, question_loss, LossWeights};
use crate::model::QgModel;
use crate::vocab::Vocab;

pub const BEST_CHECKPOINT: &str = "best_model.pt";

/// Means over one pass of the data.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpochStats {
    pub loss: f64,
    pub xe: f64,
    pub suppression: f64,
    pub entropy: f64,
    pub accuracy: f64,
    pub batches: usize,
}

impl EpochStats {
    fn add(&mut self, loss: f64, xe: f64, suppression: f64, entropy: f64, acc: f64) {
        self.loss += loss;
        self.xe += xe;
        self.suppression += suppression;
        self.entropy += entropy;
        self.accuracy += acc;
        self.batches += 1;
    }

    fn finish(mut self) -> Self {
        if self.batches > 0 {
            let n = self.batches as f64;
            self.loss /= n;
            self.xe /= n;
            self.suppression /= n;
            self.entropy /= n;
            self.accuracy /= n;
        }
        self
    }
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(f64::try_from(t)?)
}

pub struct Trainer {
    model: QgModel,
    vs: nn::VarStore,
    opt: nn::Optimizer,
    device: Device,
    cfg: TrainConfig,
    step: usize,
}

impl Trainer {
    pub fn new(model: QgModel, mut vs: nn::VarStore, opt: nn::Optimizer, device: Device, cfg: TrainConfig) -> Self {
        vs.unfreeze();
        Self {
            model,
            vs,
            opt,
            device,
            cfg,
            step: 0,
        }
    }

    pub fn model(&self) -> &QgModel {
        &self.model
    }

    /// Optimizer steps taken so far.
    pub fn global_step(&self) -> usize {
        self.step
    }

    fn weights(&self) -> LossWeights {
        LossWeights {
            suppression: self.cfg.suppression_weight,
            entropy: self.cfg.entropy_weight,
        }
    }

    fn progress(len: usize) -> Result<ProgressBar> {
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .context("progress bar template")?
                .progress_chars("=>-"),
        );
        Ok(pb)
    }

    pub fn train_epoch(&mut self, data: &[Example], vocab: &Vocab, rng: &mut StdRng) -> Result<EpochStats> {
        self.vs.unfreeze();
        let mut order: Vec<usize> = (0..data.len()).collect();
        order.shuffle(rng);

        let batch_size = self.cfg.batch_size;
        let pb = Self::progress((data.len() + batch_size - 1) / batch_size)?;
        let mut stats = EpochStats::default();

        for chunk in order.chunks(batch_size) {
            let examples: Vec<Example> = chunk.iter().map(|&i| data[i].clone()).collect();
            let batch = Batch::from_examples(&examples, vocab, self.device)?;

            let probs = self.model.forward_teacher(&batch, true)?;
            let parts = question_loss(
                &probs,
                &batch.question_ids,
                &batch.question_len,
                &batch.answer_ids,
                &batch.answer_len,
                self.weights(),
            );
            self.opt.backward_step_clip_norm(&parts.total, self.cfg.clip_norm);
            self.step += 1;

            let loss = scalar(&parts.total)?;
            let acc = tch::no_grad(|| accuracy(&probs, &batch.question_ids, &batch.question_len));
            stats.add(
                loss,
                scalar(&parts.xe)?,
                scalar(&parts.suppression)?,
                scalar(&parts.entropy)?,
                scalar(&acc)?,
            );
            if !loss.is_finite() {
                warn!(step = self.step, loss, "non-finite training loss");
            }
            pb.set_message(format!("Loss: {:.4}", loss));
            pb.inc(1);
        }

        pb.finish_with_message("Epoch complete");
        Ok(stats.finish())
    }

    /// Loss/accuracy on held-out data, plus one rendered (generated, gold) pair.
    pub fn validate(&self, data: &[Example], vocab: &Vocab) -> Result<(EpochStats, Option<(String, String)>)> {
        let mut stats = EpochStats::default();
        let mut sample = None;

        tch::no_grad(|| -> Result<()> {
            for chunk in data.chunks(self.cfg.batch_size) {
                let batch = Batch::from_examples(chunk, vocab, self.device)?;
                let probs = self.model.forward_teacher(&batch, false)?;
                let parts = question_loss(
                    &probs,
                    &batch.question_ids,
                    &batch.question_len,
                    &batch.answer_ids,
                    &batch.answer_len,
                    self.weights(),
                );
                let acc = accuracy(&probs, &batch.question_ids, &batch.question_len);
                stats.add(
                    scalar(&parts.total)?,
                    scalar(&parts.xe)?,
                    scalar(&parts.suppression)?,
                    scalar(&parts.entropy)?,
                    scalar(&acc)?,
                );

                if sample.is_none() {
                    let predicted: Vec<i64> = Vec::try_from(&probs.get(0).argmax(-1, false))?;
                    let gold = batch.gold_questions()?;
                    let passage = &batch.context_raw[0];
                    sample = Some((vocab.render_text(&predicted, passage), vocab.render_text(&gold[0], passage)));
                }
            }
            Ok(())
        })?;

        Ok((stats.finish(), sample))
    }

    /// Epoch loop; keeps the best validation checkpoint in `out_dir`.
    pub fn train(
        &mut self,
        train_data: &[Example],
        val_data: &[Example],
        vocab: &Vocab,
        epochs: usize,
        out_dir: &Path,
        seed: u64,
    ) -> Result<f64> {
        let trainable = self.vs.trainable_variables().len();
        info!(trainable, "checking gradient setup");
        if trainable == 0 {
            anyhow::bail!("No trainable variables found! Model initialization failed.");
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut best_val_loss = f64::INFINITY;
        let best_path = out_dir.join(BEST_CHECKPOINT);

        for epoch in 1..=epochs {
            info!("Epoch {}/{}", epoch, epochs);
            let train = self.train_epoch(train_data, vocab, &mut rng)?;
            let (val, sample) = self.validate(val_data, vocab)?;

            info!(
                step = self.step,
                train_loss = train.loss,
                val_loss = val.loss,
                val_xe = val.xe,
                val_acc = val.accuracy,
                "epoch {} done",
                epoch
            );
            debug!(suppression = val.suppression, entropy = val.entropy, "auxiliary terms");
            if let Some((q_hat, q_gold)) = sample {
                info!("q_hat:  {}", q_hat);
                info!("q_gold: {}", q_gold);
            }

            if val.batches > 0 && val.loss < best_val_loss {
                best_val_loss = val.loss;
                self.vs
                    .save(&best_path)
                    .with_context(|| format!("saving {}", best_path.display()))?;
                info!(val_loss = val.loss, "saved best model");
            }
        }

        info!("Training complete. Best val loss: {:.4}", best_val_loss);
        Ok(best_val_loss)
    }

    pub fn save_model(&self, path: impl AsRef<Path>) -> Result<()> {
        self.vs.save(path)?;
        Ok(())
    }
}

/// Beam-decode `examples` and render each question as text.
pub fn generate_questions(
    model: &QgModel,
    examples: &[Example],
    vocab: &Vocab,
    batch_size: usize,
    device: Device,
) -> Result<Vec<String>> {
    let cfg = model.config();
    let mut out = Vec::with_capacity(examples.len());
    for chunk in examples.chunks(batch_size.max(1)) {
        let batch = Batch::from_examples(chunk, vocab, device)?;
        let decoded = beam_search(model, &batch, cfg.beam_width, cfg.max_decode_len)?;
        for (ids, passage) in decoded.iter().zip(&batch.context_raw) {
            out.push(vocab.render_text(ids, passage));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use tch::nn::OptimizerConfig;

    fn examples() -> Vec<Example> {
        vec![
            Example::new("zorbo lives in paris", "where does zorbo live ?", "paris", 3),
            Example::new("the cat sat on the mat", "where did the cat sit ?", "the mat", 4),
            Example::new("ada wrote code", "who wrote code ?", "ada", 0),
        ]
    }

    fn tiny() -> ModelConfig {
        ModelConfig {
            embedding_size: 6,
            context_encoder_units: 4,
            decoder_units: 5,
            attention_layer_size: 4,
            max_copy_size: 8,
            dropout: 0.1,
            beam_width: 2,
            max_decode_len: 6,
            ..Default::default()
        }
    }

    fn vocab_for(data: &[Example]) -> Vocab {
        let words: Vec<&str> = data
            .iter()
            .flat_map(|e| e.question.iter().map(String::as_str))
            .collect();
        Vocab::fit(words, 50)
    }

    fn trainer(vocab: &Vocab) -> Trainer {
        tch::manual_seed(21);
        let vs = nn::VarStore::new(Device::Cpu);
        let model = QgModel::new(&vs.root(), vocab.len() as i64, &tiny());
        let opt = nn::Adam::default().build(&vs, 1e-2).unwrap();
        let cfg = TrainConfig {
            batch_size: 2,
            ..Default::default()
        };
        Trainer::new(model, vs, opt, Device::Cpu, cfg)
    }

    #[test]
    fn loss_goes_down_on_a_tiny_corpus() {
        let data = examples();
        let vocab = vocab_for(&data);
        let mut trainer = trainer(&vocab);
        let mut rng = StdRng::seed_from_u64(0);

        let (before, _) = trainer.validate(&data, &vocab).unwrap();
        for _ in 0..15 {
            trainer.train_epoch(&data, &vocab, &mut rng).unwrap();
        }
        let (after, sample) = trainer.validate(&data, &vocab).unwrap();

        assert_eq!(trainer.global_step(), 15 * 2);
        assert!(after.loss < before.loss, "{} !< {}", after.loss, before.loss);
        assert!(sample.is_some());
    }

    #[test]
    fn best_checkpoint_is_written() {
        let data = examples();
        let vocab = vocab_for(&data);
        let mut trainer = trainer(&vocab);
        let dir = tempfile::tempdir().unwrap();
        let best = trainer.train(&data, &data, &vocab, 1, dir.path(), 3).unwrap();
        assert!(best.is_finite());
        assert!(dir.path().join(BEST_CHECKPOINT).exists());

        let questions = generate_questions(trainer.model(), &data, &vocab, 2, Device::Cpu).unwrap();
        assert_eq!(questions.len(), data.len());
    }
}
