// src/bridge.rs - encoder summaries -> initial decoder state
use tch::{nn, nn::LSTMState, Kind, Tensor};

use crate::encoder::Encoding;

pub struct StateBridge {
    l: Tensor,  // [2H, 2H]
    w0: Tensor, // [2H, H_dec]
    b0: Tensor, // [H_dec]
}

impl StateBridge {
    pub fn new(vs: &nn::Path, memory_dim: i64, decoder_units: i64) -> Self {
        let p = vs / "decoder_initial_state";
        let bound = (1.0 / memory_dim as f64).sqrt();
        Self {
            l: p.var("decoder_L", &[memory_dim, memory_dim], nn::Init::Uniform { lo: -bound, up: bound }),
            w0: p.var("decoder_W0", &[memory_dim, decoder_units], nn::Init::Uniform { lo: -bound, up: bound }),
            b0: p.var("decoder_b0", &[decoder_units], nn::Init::Const(0.0)),
        }
    }

    /// r = sum_t(memory) / len + condition . L ;  s0 = tanh(r . W0 + b0) ;  c0 = 0
    pub fn initial_state(&self, enc: &Encoding) -> LSTMState {
        let len = enc
            .context_len
            .to_kind(Kind::Float)
            .clamp_min(1.0)
            .unsqueeze(1);
        let mean = enc.memory.sum_dim_intlist(&[1i64][..], false, Kind::Float) / len;
        let r = mean + enc.condition.matmul(&self.l);
        let s0 = (r.matmul(&self.w0) + &self.b0).tanh();
        let c0 = s0.zeros_like();
        LSTMState((s0.unsqueeze(0), c0.unsqueeze(0)))
    }
}
