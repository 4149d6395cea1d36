// Copyright 2018 Rui Meng (seq2seq-keyphrase-pytorch)
// Copyright 2025 Rust CopyRNN contributors
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use tch::kind::Kind::Float;
use tch::{nn, Tensor};

/// Additive penalty applied to the energies of padded source positions.
/// Large enough that the corresponding post-softmax weight underflows to 0.
const MASKED_ENERGY_PENALTY: f64 = -1e10;

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// # Attention scoring function
/// Alignment functions from [Effective Approaches to Attention-based Neural Machine
/// Translation](https://arxiv.org/abs/1508.04025) (Luong et al., 2015).
pub enum AttentionMethod {
    /// query · key (keys must be projected to the decoder dimension beforehand)
    dot,
    /// query · (W key)
    general,
    /// vᵀ tanh(W \[query; key\]), computed per target position
    concat,
}

#[derive(Debug)]
/// # Luong-style attention layer
/// Scores a batch of decoder states against the encoder states, masks padded source
/// positions and blends the encoder states into an attentional hidden vector.
pub struct Attention {
    method: AttentionMethod,
    general_attn: Option<nn::Linear>,
    concat_attn: Option<nn::Linear>,
    concat_v: Option<nn::Linear>,
    linear_out: nn::Linear,
}

impl Attention {
    pub fn new(
        p: nn::Path,
        method: AttentionMethod,
        encoder_dim: i64,
        decoder_dim: i64,
    ) -> Attention {
        let no_bias = nn::LinearConfig {
            bias: false,
            ..Default::default()
        };
        let (general_attn, concat_attn, concat_v) = match method {
            AttentionMethod::dot => (None, None, None),
            AttentionMethod::general => (
                Some(nn::linear(
                    &p / "attn",
                    encoder_dim,
                    decoder_dim,
                    Default::default(),
                )),
                None,
                None,
            ),
            AttentionMethod::concat => (
                None,
                Some(nn::linear(
                    &p / "attn",
                    encoder_dim + decoder_dim,
                    decoder_dim,
                    Default::default(),
                )),
                Some(nn::linear(&p / "v", decoder_dim, 1, Default::default())),
            ),
        };

        // the W_c of Eq. 5 in Luong et al.; for dot attention the keys have already
        // been projected to the decoder dimension
        let linear_out = match method {
            AttentionMethod::dot => nn::linear(&p / "linear_out", 2 * decoder_dim, decoder_dim, no_bias),
            _ => nn::linear(
                &p / "linear_out",
                encoder_dim + decoder_dim,
                decoder_dim,
                no_bias,
            ),
        };

        Attention {
            method,
            general_attn,
            concat_attn,
            concat_v,
            linear_out,
        }
    }

    pub fn method(&self) -> AttentionMethod {
        self.method
    }

    /// Raw alignment energies, shape (batch size, target length, source length).
    fn score(&self, query: &Tensor, keys: &Tensor, mask: Option<&Tensor>) -> Tensor {
        match self.method {
            AttentionMethod::dot => query.bmm(&keys.transpose(1, 2)),
            AttentionMethod::general => {
                let projected_keys = keys.apply(self.general_attn.as_ref().unwrap());
                let projected_keys = match mask {
                    Some(mask) => projected_keys * mask.unsqueeze(-1),
                    None => projected_keys,
                };
                query.bmm(&projected_keys.transpose(1, 2))
            }
            AttentionMethod::concat => {
                // the concatenation depends on the source position, so each target
                // step is scored independently
                let source_length = keys.size()[1];
                let target_length = query.size()[1];
                let mut energies: Vec<Tensor> = Vec::with_capacity(target_length as usize);
                for step in 0..target_length {
                    let query_step = query.narrow(1, step, 1).expand(&[-1, source_length, -1], true);
                    let mut features = Tensor::cat(&[&query_step, keys], 2);
                    if let Some(mask) = mask {
                        features = features * mask.unsqueeze(-1);
                    }
                    let mut energy = features.apply(self.concat_attn.as_ref().unwrap()).tanh();
                    if let Some(mask) = mask {
                        energy = energy * mask.unsqueeze(-1);
                    }
                    energies.push(energy.apply(self.concat_v.as_ref().unwrap()).squeeze_dim(-1));
                }
                let energies = Tensor::stack(&energies, 1);
                match mask {
                    Some(mask) => energies * mask.unsqueeze(1),
                    None => energies,
                }
            }
        }
    }

    /// Computes the attentional hidden vector and attention weights.
    ///
    /// * `query` - decoder output states, shape (batch size, target length, decoder dim)
    /// * `keys` - encoder states, shape (batch size, source length, encoder dim). For
    ///   `dot` attention the keys must have been projected to the decoder dimension.
    /// * `mask` - optional 0/1 source padding mask, shape (batch size, source length)
    ///
    /// Returns `(output, weights, energies)` where `output` is
    /// tanh(W_c \[context; query\]) with shape (batch size, target length, decoder dim),
    /// `weights` the normalized attention weights and `energies` the (masked) alignment
    /// energies before the softmax. Padded positions receive exactly zero weight.
    pub fn forward(
        &self,
        query: &Tensor,
        keys: &Tensor,
        mask: Option<&Tensor>,
    ) -> (Tensor, Tensor, Tensor) {
        let (batch_size, target_length) = (query.size()[0], query.size()[1]);
        let source_length = keys.size()[1];

        let energies = self.score(query, keys, mask);
        let energies = match mask {
            Some(mask) => {
                let expanded_mask =
                    mask.unsqueeze(1)
                        .expand(&[batch_size, target_length, source_length], true);
                energies + expanded_mask.ne(1).to_kind(Float) * MASKED_ENERGY_PENALTY
            }
            None => energies,
        };
        let weights = energies.softmax(-1, Float);

        let context = weights.bmm(keys);
        let output = Tensor::cat(&[&context, query], 2)
            .apply(&self.linear_out)
            .tanh();

        (output, weights, energies)
    }
}
