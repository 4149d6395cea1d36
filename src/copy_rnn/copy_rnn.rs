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

use crate::common::error::CopyRnnError;
use crate::copy_rnn::attention::AttentionMethod;
use crate::copy_rnn::sampling::{DecayCurve, TeacherForcingPolicy};
use crate::Config;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
/// # CopyRNN model configuration
/// Defines the decoder architecture (vocabulary and layer sizes, attention scoring
/// functions, copy/input-feeding wiring) and the teacher-forcing schedule.
pub struct CopyRnnConfig {
    pub vocab_size: i64,
    pub embedding_dim: i64,
    /// Dimensionality of the encoder states as seen by the decoder (already folded
    /// over encoder directions).
    pub encoder_hidden_dim: i64,
    pub decoder_hidden_dim: i64,
    pub decoder_layers: i64,
    /// Dropout between stacked decoder layers (no-op for a single layer).
    pub dropout: f64,
    pub attention_method: AttentionMethod,
    /// Enables the copy mechanism (Gu et al., 2016).
    pub copy_attention: bool,
    /// Scoring function for the copy attention; defaults to `attention_method`.
    pub copy_method: Option<AttentionMethod>,
    /// Reuses the generation attention weights as the copy distribution instead of a
    /// separately parameterized copy attention.
    pub reuse_copy_attention: bool,
    /// Feeds the previous step's attentional vector back into the next input.
    pub input_feeding: bool,
    /// Feeds the previous step's copy-attentional vector back into the next input.
    pub copy_input_feeding: bool,
    pub must_teacher_forcing: bool,
    pub teacher_forcing_ratio: f64,
    pub scheduled_sampling: bool,
    pub scheduled_sampling_steps: u64,
    pub scheduled_sampling_decay: DecayCurve,
    pub pad_token_id: i64,
    pub bos_token_id: i64,
    pub unk_token_id: i64,
}

impl Config<CopyRnnConfig> for CopyRnnConfig {}

impl Default for CopyRnnConfig {
    fn default() -> CopyRnnConfig {
        CopyRnnConfig {
            vocab_size: 50000,
            embedding_dim: 150,
            encoder_hidden_dim: 600,
            decoder_hidden_dim: 300,
            decoder_layers: 1,
            dropout: 0.0,
            attention_method: AttentionMethod::general,
            copy_attention: true,
            copy_method: None,
            reuse_copy_attention: false,
            input_feeding: false,
            copy_input_feeding: false,
            must_teacher_forcing: false,
            teacher_forcing_ratio: 1.0,
            scheduled_sampling: false,
            scheduled_sampling_steps: 10000,
            scheduled_sampling_decay: DecayCurve::inverse_sigmoid,
            pad_token_id: 0,
            bos_token_id: 1,
            unk_token_id: 3,
        }
    }
}

impl CopyRnnConfig {
    /// Rejects inconsistent configurations before any parameter is allocated.
    pub fn validate(&self) -> Result<(), CopyRnnError> {
        if self.vocab_size <= 0 {
            return Err(CopyRnnError::InvalidConfigurationError(format!(
                "vocab_size must be positive, got {}",
                self.vocab_size
            )));
        }
        if self.embedding_dim <= 0 || self.encoder_hidden_dim <= 0 || self.decoder_hidden_dim <= 0 {
            return Err(CopyRnnError::InvalidConfigurationError(
                "embedding and hidden dimensions must be positive".into(),
            ));
        }
        if self.decoder_layers < 1 {
            return Err(CopyRnnError::InvalidConfigurationError(format!(
                "decoder_layers must be at least 1, got {}",
                self.decoder_layers
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(CopyRnnError::InvalidConfigurationError(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if !self.copy_attention {
            if self.copy_input_feeding {
                return Err(CopyRnnError::InvalidConfigurationError(
                    "copy_input_feeding requires copy_attention".into(),
                ));
            }
            if self.reuse_copy_attention {
                return Err(CopyRnnError::InvalidConfigurationError(
                    "reuse_copy_attention requires copy_attention".into(),
                ));
            }
            if self.copy_method.is_some() {
                return Err(CopyRnnError::InvalidConfigurationError(
                    "copy_method requires copy_attention".into(),
                ));
            }
        }
        if self.reuse_copy_attention && self.copy_method.is_some() {
            return Err(CopyRnnError::InvalidConfigurationError(
                "copy_method has no effect when reuse_copy_attention is set".into(),
            ));
        }
        for (name, id) in &[
            ("pad_token_id", self.pad_token_id),
            ("bos_token_id", self.bos_token_id),
            ("unk_token_id", self.unk_token_id),
        ] {
            if *id < 0 || *id >= self.vocab_size {
                return Err(CopyRnnError::InvalidConfigurationError(format!(
                    "{} ({}) is outside the base vocabulary of size {}",
                    name, id, self.vocab_size
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.teacher_forcing_ratio) {
            return Err(CopyRnnError::InvalidConfigurationError(format!(
                "teacher_forcing_ratio must be in [0, 1], got {}",
                self.teacher_forcing_ratio
            )));
        }
        Ok(())
    }

    /// Scoring function effectively used by the copy attention.
    pub fn effective_copy_method(&self) -> AttentionMethod {
        self.copy_method.unwrap_or(self.attention_method)
    }

    /// Maps the configuration flags to a [`TeacherForcingPolicy`], with the same
    /// precedence the flags have at training time: a sampling schedule wins over
    /// forced teacher forcing, which wins over a static ratio.
    pub fn teacher_forcing_policy(&self) -> TeacherForcingPolicy {
        if self.scheduled_sampling {
            TeacherForcingPolicy::Decay {
                curve: self.scheduled_sampling_decay,
                total_steps: self.scheduled_sampling_steps,
            }
        } else if self.must_teacher_forcing || self.teacher_forcing_ratio >= 1.0 {
            TeacherForcingPolicy::Always
        } else {
            TeacherForcingPolicy::Ratio(self.teacher_forcing_ratio)
        }
    }
}
