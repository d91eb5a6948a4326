// src/ops.rs - small tensor helpers shared by encoder, decoder and loss
use tch::{Device, Kind, Tensor};

/// Floor used by `safe_log`; probabilities below this are treated as this value.
pub const LOG_FLOOR: f64 = 1e-10;

/// Logit used for positions that must get (numerically) zero probability.
pub const MASK_SENTINEL: f64 = -1e9;

/// log(p) with p clamped away from zero, so masked entries never become -inf/NaN.
pub fn safe_log(p: &Tensor) -> Tensor {
    p.clamp_min(LOG_FLOOR).log()
}

/// [B] lengths -> [B, max_len] float mask (1 valid, 0 pad)
pub fn sequence_mask(lengths: &Tensor, max_len: i64) -> Tensor {
    let device = lengths.device();
    let b = lengths.size()[0];
    let steps = Tensor::arange(max_len, (Kind::Int64, device))
        .unsqueeze(0)
        .expand([b, max_len], false);
    steps
        .lt_tensor(&lengths.to_kind(Kind::Int64).unsqueeze(1))
        .to_kind(Kind::Float)
}

/// Repeat every batch row `multiplier` times along dim 0: rows [a, b] -> [a, a, b, b].
pub fn tile_batch(t: &Tensor, multiplier: i64) -> Tensor {
    let b = t.size()[0];
    let index: Vec<i64> = (0..b)
        .flat_map(|row| std::iter::repeat(row).take(multiplier as usize))
        .collect();
    t.index_select(0, &Tensor::from_slice(&index).to_device(t.device()))
}

/// Reorder batch rows by `index` (used by beam search to follow parent slots).
pub fn gather_rows(t: &Tensor, index: &[i64]) -> Tensor {
    t.index_select(0, &Tensor::from_slice(index).to_device(t.device()))
}

/// Ids >= vocab_size replaced with `oov_id`; embedding lookups only see the fixed vocabulary.
pub fn coerce_to_vocab(ids: &Tensor, vocab_size: i64, oov_id: i64) -> Tensor {
    let oov = ids.full_like(oov_id);
    oov.where_self(&ids.ge(vocab_size), ids)
}

/// `Vec<i64>` rows -> [B, width] int tensor padded with `pad`
pub fn pad_rows(rows: &[Vec<i64>], width: usize, pad: i64, device: Device) -> Tensor {
    let b = rows.len() as i64;
    let data: Vec<i64> = rows
        .iter()
        .flat_map(|row| {
            row.iter()
                .copied()
                .chain(std::iter::repeat(pad))
                .take(width)
        })
        .collect();
    Tensor::from_slice(&data).view([b, width as i64]).to_device(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_mask_marks_valid_prefix() {
        let lengths = Tensor::from_slice(&[2i64, 0, 4]);
        let mask = sequence_mask(&lengths, 4);
        let flat: Vec<f32> = Vec::try_from(&mask.view([-1])).unwrap();
        assert_eq!(
            flat,
            vec![1., 1., 0., 0., 0., 0., 0., 0., 1., 1., 1., 1.]
        );
    }

    #[test]
    fn tile_batch_repeats_rows_in_place() {
        let t = Tensor::from_slice(&[10i64, 20]);
        let tiled: Vec<i64> = Vec::try_from(&tile_batch(&t, 3)).unwrap();
        assert_eq!(tiled, vec![10, 10, 10, 20, 20, 20]);
    }

    #[test]
    fn coerce_maps_copy_ids_to_oov() {
        let ids = Tensor::from_slice(&[2i64, 11, 4, 3]);
        let out: Vec<i64> = Vec::try_from(&coerce_to_vocab(&ids, 10, 1)).unwrap();
        assert_eq!(out, vec![2, 1, 4, 3]);
    }

    #[test]
    fn safe_log_is_finite_at_zero() {
        let p = Tensor::from_slice(&[0.0f32, 1.0]);
        let l: Vec<f32> = Vec::try_from(&safe_log(&p)).unwrap();
        assert!(l[0].is_finite());
        assert!(l[0] < -20.0);
        assert!(l[1].abs() < 1e-6);
    }

    #[test]
    fn pad_rows_truncates_and_pads() {
        let rows = vec![vec![5i64, 6, 7], vec![8]];
        let t = pad_rows(&rows, 2, 0, Device::Cpu);
        let flat: Vec<i64> = Vec::try_from(&t.view([-1])).unwrap();
        assert_eq!(flat, vec![5, 6, 8, 0]);
    }
}
