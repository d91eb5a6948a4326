// src/batch.rs - examples -> padded tensors in the extended id space
use rayon::prelude::*;
use tch::{Device, Kind, Tensor};

use crate::data_loader::Example;
use crate::error::QgError;
use crate::ops::pad_rows;
use crate::vocab::{Vocab, EOS_ID, PAD_ID};

/// Everything the core needs for one batch, already materialized on `device`.
pub struct Batch {
    /// [B, T] vocabulary ids (unknown words -> OOV)
    pub context_ids: Tensor,
    /// [B]
    pub context_len: Tensor,
    /// [B, Q] gold question in the extended id space, EOS terminated
    pub question_ids: Tensor,
    /// [B]
    pub question_len: Tensor,
    /// [B, A] answer ids in the extended id space, A >= 1
    pub answer_ids: Tensor,
    /// [B]
    pub answer_len: Tensor,
    /// [B]
    pub answer_start: Tensor,
    /// Raw passage tokens, for rendering copy ids.
    pub context_raw: Vec<Vec<String>>,
    pub size: i64,
}

struct Encoded {
    context: Vec<i64>,
    question: Vec<i64>,
    answer: Vec<i64>,
    start: i64,
}

impl Batch {
    pub fn from_examples(examples: &[Example], vocab: &Vocab, device: Device) -> Result<Self, QgError> {
        if examples.is_empty() {
            return Err(QgError::EmptyBatch);
        }

        let encoded: Vec<Encoded> = examples
            .par_iter()
            .map(|ex| {
                let context = ex.context.iter().map(|w| vocab.id_or_oov(w)).collect();
                let mut question: Vec<i64> = ex
                    .question
                    .iter()
                    .map(|w| vocab.extended_id(w, &ex.context))
                    .collect();
                question.push(EOS_ID);
                let start = ex.span_start();
                // answer tokens are copies of the span, so unknown words get their own position
                let answer = ex
                    .answer
                    .iter()
                    .enumerate()
                    .map(|(j, w)| match vocab.id(w) {
                        Some(id) => id,
                        None if ex.context.get(start + j) == Some(w) => vocab.len() as i64 + (start + j) as i64,
                        None => vocab.extended_id(w, &ex.context),
                    })
                    .collect();
                Encoded {
                    context,
                    question,
                    answer,
                    start: start as i64,
                }
            })
            .collect();

        let contexts: Vec<Vec<i64>> = encoded.iter().map(|e| e.context.clone()).collect();
        let questions: Vec<Vec<i64>> = encoded.iter().map(|e| e.question.clone()).collect();
        let answers: Vec<Vec<i64>> = encoded.iter().map(|e| e.answer.clone()).collect();

        let width = |rows: &[Vec<i64>]| rows.iter().map(Vec::len).max().unwrap_or(0).max(1);
        let lens = |rows: &[Vec<i64>]| {
            let l: Vec<i64> = rows.iter().map(|r| r.len() as i64).collect();
            Tensor::from_slice(&l).to_device(device)
        };
        let starts: Vec<i64> = encoded.iter().map(|e| e.start).collect();

        Ok(Self {
            context_ids: pad_rows(&contexts, width(&contexts), PAD_ID, device),
            context_len: lens(&contexts),
            question_ids: pad_rows(&questions, width(&questions), PAD_ID, device),
            question_len: lens(&questions),
            answer_ids: pad_rows(&answers, width(&answers), PAD_ID, device),
            answer_len: lens(&answers),
            answer_start: Tensor::from_slice(&starts).to_device(device),
            context_raw: examples.iter().map(|e| e.context.clone()).collect(),
            size: examples.len() as i64,
        })
    }

    /// Longest passage in the batch.
    pub fn max_context_len(&self) -> i64 {
        self.context_ids.size()[1]
    }

    /// Per-row gold question ids, trimmed to each row's length.
    pub fn gold_questions(&self) -> Result<Vec<Vec<i64>>, QgError> {
        let lens: Vec<i64> = Vec::try_from(&self.question_len.to_kind(Kind::Int64))?;
        let q = self.question_ids.size()[1];
        let flat: Vec<i64> = Vec::try_from(&self.question_ids.reshape([-1]))?;
        Ok(flat
            .chunks(q as usize)
            .zip(lens)
            .map(|(row, l)| row[..l as usize].to_vec())
            .collect())
    }
}
