use serde::{Deserialize, Serialize};

use super::{
    runtime::Runtime,
    state::{LayerState, ModelState},
};
use crate::tensor::{
    matrix::Matrix,
    ops::{
        add_in_place, layer_norm, layer_norm_in_place, mul_in_place, scale_in_place,
        sigmoid_in_place, squared_relu_in_place, token_shift,
    },
    shape::Shape,
    TensorCpu, TensorError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerNorm {
    pub w: TensorCpu<f32>,
    pub b: TensorCpu<f32>,
}

impl LayerNorm {
    pub fn check(&self, num_emb: usize) -> Result<(), TensorError> {
        self.w.check_shape(Shape::vector(num_emb))?;
        self.b.check_shape(Shape::vector(num_emb))
    }

    /// Normalize each of the `num_emb`-sized rows of `input` into `output`.
    pub fn forward(&self, input: &[f32], output: &mut [f32], eps: f32) {
        let num_emb = self.w.len();
        for (input, output) in input
            .chunks_exact(num_emb)
            .zip(output.chunks_exact_mut(num_emb))
        {
            layer_norm(input, &self.w, &self.b, eps, output);
        }
    }

    pub fn forward_in_place(&self, x: &mut [f32], eps: f32) {
        let num_emb = self.w.len();
        for x in x.chunks_exact_mut(num_emb) {
            layer_norm_in_place(x, &self.w, &self.b, eps);
        }
    }
}

/// The time-mixing block: token shift, key/value/receptance projections and the WKV recurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Att {
    /// Stored as `-exp(w)` so it adds directly to the running exponent.
    pub time_decay: TensorCpu<f32>,
    pub time_first: TensorCpu<f32>,
    pub time_mix_k: TensorCpu<f32>,
    pub time_mix_v: TensorCpu<f32>,
    pub time_mix_r: TensorCpu<f32>,

    pub w_k: Matrix,
    pub w_v: Matrix,
    pub w_r: Matrix,
    pub w_o: Matrix,
}

/// Running WKV accumulators: numerator, denominator and maximum exponent.
struct Accumulator<'a> {
    a: &'a mut [f32],
    b: &'a mut [f32],
    p: &'a mut [f32],
}

impl Att {
    pub fn check(&self, num_emb: usize) -> Result<(), TensorError> {
        let shape = Shape::vector(num_emb);
        for vector in [
            &self.time_decay,
            &self.time_first,
            &self.time_mix_k,
            &self.time_mix_v,
            &self.time_mix_r,
        ] {
            vector.check_shape(shape)?;
        }
        for matrix in [&self.w_k, &self.w_v, &self.w_r, &self.w_o] {
            matrix.check(num_emb, num_emb)?;
        }
        Ok(())
    }

    /// One step of the recurrence. Writes `r * wkv` into `output` and advances `acc`.
    fn wkv(&self, k: &[f32], v: &[f32], r: &[f32], acc: Accumulator, output: &mut [f32]) {
        let Accumulator { a, b, p } = acc;
        for j in 0..output.len() {
            let (k, v) = (k[j], v[j]);

            let ww = k + self.time_first[j];
            let q = p[j].max(ww);
            let e1 = (p[j] - q).exp();
            let e2 = (ww - q).exp();
            output[j] = r[j] * (e1 * a[j] + e2 * v) / (e1 * b[j] + e2);

            let ww = p[j] + self.time_decay[j];
            let q = ww.max(k);
            let e1 = (ww - q).exp();
            let e2 = (k - q).exp();
            a[j] = e1 * a[j] + e2 * v;
            b[j] = e1 * b[j] + e2;
            p[j] = q;
        }
    }

    /// Reads the normalized input from `rt.att_x[..num_emb]`, writes the output to `rt.att_o`.
    pub fn forward_one(&self, rt: &mut Runtime, state: &mut LayerState) -> Result<(), TensorError> {
        let c = rt.num_emb;
        let x = &rt.att_x[..c];
        token_shift(&self.time_mix_k, x, &state.att_x, &mut rt.att_kx[..c]);
        token_shift(&self.time_mix_v, x, &state.att_x, &mut rt.att_vx[..c]);
        token_shift(&self.time_mix_r, x, &state.att_x, &mut rt.att_rx[..c]);

        self.w_k.matmul(&rt.att_kx[..c], &mut rt.att_k[..c])?;
        self.w_v.matmul(&rt.att_vx[..c], &mut rt.att_v[..c])?;
        self.w_r.matmul(&rt.att_rx[..c], &mut rt.att_r[..c])?;
        sigmoid_in_place(&mut rt.att_r[..c]);

        let acc = Accumulator {
            a: &mut state.att_a,
            b: &mut state.att_b,
            p: &mut state.att_p,
        };
        // reuse the key-mix buffer for the gated wkv
        self.wkv(
            &rt.att_k[..c],
            &rt.att_v[..c],
            &rt.att_r[..c],
            acc,
            &mut rt.att_kx[..c],
        );
        self.w_o.matmul(&rt.att_kx[..c], &mut rt.att_o[..c])?;

        state.att_x.copy_from_slice(&rt.att_x[..c]);
        Ok(())
    }

    /// Same as [`Att::forward_one`] over `num_token` tokens. Each token shifts against its predecessor,
    /// and the carried state is written once after the last token.
    pub fn forward_seq(
        &self,
        rt: &mut Runtime,
        num_token: usize,
        state: &mut LayerState,
    ) -> Result<(), TensorError> {
        let c = rt.num_emb;
        let len = num_token * c;
        for t in 0..num_token {
            let range = t * c..(t + 1) * c;
            let x = &rt.att_x[range.clone()];
            let last = match t {
                0 => &state.att_x[..],
                t => &rt.att_x[(t - 1) * c..t * c],
            };
            token_shift(&self.time_mix_k, x, last, &mut rt.att_kx[range.clone()]);
            token_shift(&self.time_mix_v, x, last, &mut rt.att_vx[range.clone()]);
            token_shift(&self.time_mix_r, x, last, &mut rt.att_rx[range]);
        }

        self.w_k.matmul_seq(&rt.att_kx, &mut rt.att_k, num_token)?;
        self.w_v.matmul_seq(&rt.att_vx, &mut rt.att_v, num_token)?;
        self.w_r.matmul_seq(&rt.att_rx, &mut rt.att_r, num_token)?;
        sigmoid_in_place(&mut rt.att_r[..len]);

        let mut a = state.att_a.clone();
        let mut b = state.att_b.clone();
        let mut p = state.att_p.clone();
        for t in 0..num_token {
            let range = t * c..(t + 1) * c;
            let acc = Accumulator {
                a: &mut a,
                b: &mut b,
                p: &mut p,
            };
            self.wkv(
                &rt.att_k[range.clone()],
                &rt.att_v[range.clone()],
                &rt.att_r[range.clone()],
                acc,
                &mut rt.att_kx[range],
            );
        }
        self.w_o.matmul_seq(&rt.att_kx, &mut rt.att_o, num_token)?;

        state.att_x.copy_from_slice(&rt.att_x[len - c..len]);
        state.att_a = a;
        state.att_b = b;
        state.att_p = p;
        Ok(())
    }
}

/// The channel-mixing block: a token-shifted, receptance-gated feed-forward network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ffn {
    pub time_mix_k: TensorCpu<f32>,
    pub time_mix_r: TensorCpu<f32>,

    pub w_k: Matrix,
    pub w_v: Matrix,
    pub w_r: Matrix,
}

impl Ffn {
    pub fn check(&self, num_emb: usize, num_hidden: usize) -> Result<(), TensorError> {
        self.time_mix_k.check_shape(Shape::vector(num_emb))?;
        self.time_mix_r.check_shape(Shape::vector(num_emb))?;
        self.w_k.check(num_emb, num_hidden)?;
        self.w_v.check(num_hidden, num_emb)?;
        self.w_r.check(num_emb, num_emb)
    }

    /// Reads the normalized input from `rt.ffn_x`, writes the output to `rt.ffn_v`.
    pub fn forward_seq(
        &self,
        rt: &mut Runtime,
        num_token: usize,
        state: &mut LayerState,
    ) -> Result<(), TensorError> {
        let c = rt.num_emb;
        let len = num_token * c;
        for t in 0..num_token {
            let range = t * c..(t + 1) * c;
            let x = &rt.ffn_x[range.clone()];
            let last = match t {
                0 => &state.ffn_x[..],
                t => &rt.ffn_x[(t - 1) * c..t * c],
            };
            token_shift(&self.time_mix_k, x, last, &mut rt.ffn_kx[range.clone()]);
            token_shift(&self.time_mix_r, x, last, &mut rt.ffn_rx[range]);
        }

        self.w_k.matmul_seq(&rt.ffn_kx, &mut rt.ffn_k, num_token)?;
        squared_relu_in_place(&mut rt.ffn_k[..num_token * rt.num_hidden]);
        self.w_v.matmul_seq(&rt.ffn_k, &mut rt.ffn_v, num_token)?;

        self.w_r.matmul_seq(&rt.ffn_rx, &mut rt.ffn_r, num_token)?;
        sigmoid_in_place(&mut rt.ffn_r[..len]);
        mul_in_place(&mut rt.ffn_v[..len], &rt.ffn_r[..len]);

        state.ffn_x.copy_from_slice(&rt.ffn_x[len - c..len]);
        Ok(())
    }

    pub fn forward_one(&self, rt: &mut Runtime, state: &mut LayerState) -> Result<(), TensorError> {
        let c = rt.num_emb;
        let h = rt.num_hidden;
        let x = &rt.ffn_x[..c];
        token_shift(&self.time_mix_k, x, &state.ffn_x, &mut rt.ffn_kx[..c]);
        token_shift(&self.time_mix_r, x, &state.ffn_x, &mut rt.ffn_rx[..c]);

        self.w_k.matmul(&rt.ffn_kx[..c], &mut rt.ffn_k[..h])?;
        squared_relu_in_place(&mut rt.ffn_k[..h]);
        self.w_v.matmul(&rt.ffn_k[..h], &mut rt.ffn_v[..c])?;

        self.w_r.matmul(&rt.ffn_rx[..c], &mut rt.ffn_r[..c])?;
        sigmoid_in_place(&mut rt.ffn_r[..c]);
        mul_in_place(&mut rt.ffn_v[..c], &rt.ffn_r[..c]);

        state.ffn_x.copy_from_slice(&rt.ffn_x[..c]);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    /// Extra normalization of the embeddings, only present on the first layer.
    pub ln0: Option<LayerNorm>,
    pub att_layer_norm: LayerNorm,
    pub ffn_layer_norm: LayerNorm,
    pub att: Att,
    pub ffn: Ffn,
}

impl Layer {
    pub fn check(&self, num_emb: usize, num_hidden: usize) -> Result<(), TensorError> {
        if let Some(ln0) = &self.ln0 {
            ln0.check(num_emb)?;
        }
        self.att_layer_norm.check(num_emb)?;
        self.ffn_layer_norm.check(num_emb)?;
        self.att.check(num_emb)?;
        self.ffn.check(num_emb, num_hidden)
    }

    pub fn forward_one(
        &self,
        x: &mut [f32],
        state: &mut LayerState,
        rt: &mut Runtime,
        eps: f32,
    ) -> Result<(), TensorError> {
        let c = rt.num_emb;
        let x = &mut x[..c];
        if let Some(ln0) = &self.ln0 {
            ln0.forward_in_place(x, eps);
        }

        self.att_layer_norm.forward(x, &mut rt.att_x[..c], eps);
        self.att.forward_one(rt, state)?;
        add_in_place(x, &rt.att_o[..c]);

        self.ffn_layer_norm.forward(x, &mut rt.ffn_x[..c], eps);
        self.ffn.forward_one(rt, state)?;
        add_in_place(x, &rt.ffn_v[..c]);
        Ok(())
    }

    pub fn forward_seq(
        &self,
        x: &mut [f32],
        num_token: usize,
        state: &mut LayerState,
        rt: &mut Runtime,
        eps: f32,
    ) -> Result<(), TensorError> {
        let len = num_token * rt.num_emb;
        let x = &mut x[..len];
        if let Some(ln0) = &self.ln0 {
            ln0.forward_in_place(x, eps);
        }

        self.att_layer_norm.forward(x, &mut rt.att_x[..len], eps);
        self.att.forward_seq(rt, num_token, state)?;
        add_in_place(x, &rt.att_o[..len]);

        self.ffn_layer_norm.forward(x, &mut rt.ffn_x[..len], eps);
        self.ffn.forward_seq(rt, num_token, state)?;
        add_in_place(x, &rt.ffn_v[..len]);
        Ok(())
    }
}

/// The layer stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoder {
    pub layers: Vec<Layer>,
    /// Halve the hidden value after every this many layers; 0 disables it.
    pub rescale_layer: usize,
    pub layer_norm_eps: f32,
}

impl Encoder {
    #[inline]
    fn rescale(&self, index: usize, x: &mut [f32]) {
        if self.rescale_layer > 0 && (index + 1) % self.rescale_layer == 0 {
            scale_in_place(x, 0.5);
        }
    }

    fn check_input(&self, x: &[f32], len: usize, rt: &Runtime) -> Result<(), TensorError> {
        if x.len() < len {
            return Err(TensorError::Size(len, x.len()));
        }
        if rt.num_token * rt.num_emb < len {
            return Err(TensorError::Size(len, rt.num_token * rt.num_emb));
        }
        Ok(())
    }

    /// Advance the state by one token. `x` holds that token's embedding and receives its hidden value.
    pub fn forward_one(
        &self,
        x: &mut [f32],
        state: &mut ModelState,
        rt: &mut Runtime,
    ) -> Result<(), TensorError> {
        self.check_input(x, rt.num_emb, rt)?;
        for (index, (layer, state)) in self.layers.iter().zip(state.iter_mut()).enumerate() {
            layer.forward_one(x, state, rt, self.layer_norm_eps)?;
            self.rescale(index, &mut x[..rt.num_emb]);
        }
        Ok(())
    }

    /// Advance the state by `num_token` tokens whose embeddings are laid out consecutively in `x`.
    /// Gives the same hidden values and final state as calling [`Encoder::forward_one`] per token.
    pub fn forward_seq(
        &self,
        x: &mut [f32],
        num_token: usize,
        state: &mut ModelState,
        rt: &mut Runtime,
    ) -> Result<(), TensorError> {
        if num_token == 0 {
            return Ok(());
        }
        let len = num_token * rt.num_emb;
        self.check_input(x, len, rt)?;
        for (index, (layer, state)) in self.layers.iter().zip(state.iter_mut()).enumerate() {
            layer.forward_seq(x, num_token, state, rt, self.layer_norm_eps)?;
            self.rescale(index, &mut x[..len]);
        }
        Ok(())
    }
}
