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
use crate::copy_rnn::attention::{Attention, AttentionMethod};
use crate::copy_rnn::copy_rnn::CopyRnnConfig;
use crate::copy_rnn::extended_vocab::{merge_copy_logits, SourceMap};
use crate::copy_rnn::sampling::{FeedDecision, ScheduledSampler, TeacherForcingPolicy};
use rand::Rng;
use tch::kind::Kind::Float;
use tch::nn::{EmbeddingConfig, Init, LSTMState, RNNConfig, RNN};
use tch::{nn, Device, Tensor};

#[derive(Debug)]
/// # Encoded source text
/// Borrowed view over the encoder outputs for one batch: per-position state vectors of
/// shape (batch size, source length, encoder dim) and a 0/1 mask of shape
/// (batch size, source length) marking real vs. padding positions. Both tensors are
/// owned by the caller and read-only for the duration of a decode call.
pub struct EncodedSource<'a> {
    pub states: &'a Tensor,
    pub mask: &'a Tensor,
}

impl<'a> EncodedSource<'a> {
    pub fn new(states: &'a Tensor, mask: &'a Tensor) -> Result<EncodedSource<'a>, CopyRnnError> {
        let states_size = states.size3().map_err(|_| {
            CopyRnnError::InvalidBatch(format!(
                "encoder states must have shape (batch size, source length, encoder dim), got {:?}",
                states.size()
            ))
        })?;
        let mask_size = mask.size2().map_err(|_| {
            CopyRnnError::InvalidBatch(format!(
                "source mask must have shape (batch size, source length), got {:?}",
                mask.size()
            ))
        })?;
        if mask_size != (states_size.0, states_size.1) {
            return Err(CopyRnnError::InvalidBatch(format!(
                "source mask shape {:?} disagrees with encoder states shape {:?}",
                mask.size(),
                states.size()
            )));
        }
        Ok(EncodedSource { states, mask })
    }

    pub fn batch_size(&self) -> i64 {
        self.states.size()[0]
    }

    pub fn source_length(&self) -> i64 {
        self.states.size()[1]
    }

    pub fn encoder_dim(&self) -> i64 {
        self.states.size()[2]
    }
}

#[derive(Debug)]
/// # Decoder recurrent state
/// Hidden and cell tensors of shape (decoder layers, batch size, decoder hidden dim).
/// The state is exclusively owned: every step consumes the previous state and returns
/// a new one, and no two steps ever hold it concurrently.
pub struct DecoderState {
    pub hidden: Tensor,
    pub cell: Tensor,
}

impl DecoderState {
    /// Deep copy, e.g. to snapshot the state of a live beam-search hypothesis.
    pub fn copy(&self) -> DecoderState {
        DecoderState {
            hidden: self.hidden.copy(),
            cell: self.cell.copy(),
        }
    }

    /// Reorders the batch axis to follow surviving hypotheses after beam pruning.
    pub fn reorder(&self, new_indices: &Tensor) -> DecoderState {
        DecoderState {
            hidden: self.hidden.index_select(1, new_indices),
            cell: self.cell.index_select(1, new_indices),
        }
    }

    pub fn batch_size(&self) -> i64 {
        self.hidden.size()[1]
    }

    fn as_lstm_state(&self) -> LSTMState {
        LSTMState((self.hidden.shallow_clone(), self.cell.shallow_clone()))
    }

    fn from_lstm_state(state: LSTMState) -> DecoderState {
        let LSTMState((hidden, cell)) = state;
        DecoderState { hidden, cell }
    }
}

#[derive(Debug)]
/// Attentional vectors carried over from the previous step under input feeding.
/// Zero-initialized at sequence start and recomputed every step.
pub struct FeedbackContext {
    pub context: Tensor,
    pub copy_context: Tensor,
}

impl FeedbackContext {
    pub fn zeros(batch_size: i64, hidden_dim: i64, device: Device) -> FeedbackContext {
        FeedbackContext {
            context: Tensor::zeros(&[batch_size, 1, hidden_dim], (Float, device)),
            copy_context: Tensor::zeros(&[batch_size, 1, hidden_dim], (Float, device)),
        }
    }
}

#[derive(Debug)]
/// Output of one decoding step.
pub struct DecoderStepOutput {
    /// Log-probabilities over the extended vocabulary, shape
    /// (batch size, 1, vocab size + max_oov).
    pub log_probs: Tensor,
    /// Updated recurrent state.
    pub state: DecoderState,
    /// Raw decoder cell output, shape (batch size, 1, decoder hidden dim).
    pub output: Tensor,
    /// Attentional vector, fed back on the next step under input feeding.
    pub context: Tensor,
    /// Copy-attentional vector, fed back under copy input feeding.
    pub copy_context: Tensor,
    /// Generation attention weights, shape (batch size, 1, source length).
    pub attention: Tensor,
    /// Copy attention weights; `None` when the copy mechanism is disabled.
    pub copy_attention: Option<Tensor>,
}

#[derive(Debug)]
/// Output of a full decode over one target sequence (or a set of cascaded phrases,
/// in which case the leading axis is batch size × phrase count, phrase-major).
pub struct DecoderOutput {
    /// Log-probabilities, shape (examples, steps, vocab size + max_oov).
    pub log_probs: Tensor,
    /// Raw decoder cell outputs, shape (examples, steps, decoder hidden dim).
    pub hidden_states: Tensor,
    /// Generation attention weights, shape (examples, steps, source length).
    pub attention: Tensor,
    /// Copy attention weights; `None` when the copy mechanism is disabled.
    pub copy_attention: Option<Tensor>,
}

#[derive(Debug)]
/// Output of a greedy rollout, for the evaluation collaborator. Token ids live in the
/// extended vocabulary: ids `>= vocab_size` must be resolved by the caller against the
/// example's own OOV list.
pub struct GreedyDecodeOutput {
    /// Predicted ids, shape (batch size, steps).
    pub token_ids: Tensor,
    /// Cumulative log-probability after each step, shape (batch size, steps).
    pub scores: Tensor,
    /// Per-step log-probabilities, shape (batch size, steps, vocab size + max_oov).
    pub log_probs: Tensor,
    /// Generation attention weights, shape (batch size, steps, source length).
    pub attention: Tensor,
    /// Final recurrent state.
    pub state: DecoderState,
}

#[derive(Debug)]
/// # CopyRNN decoder
/// Attentional LSTM decoder with a pointer-generator copy mechanism: every step merges
/// a generation distribution over the base vocabulary with a copy distribution over
/// source positions into one distribution over the example-specific extended
/// vocabulary. Supports teacher forcing, scheduled sampling and cascaded decoding of
/// several phrases per source.
pub struct CopyRnnDecoder {
    embeddings: nn::Embedding,
    decoder: nn::LSTM,
    attention: Attention,
    copy_attention: Option<Attention>,
    vocab_projection: nn::Linear,
    input_bridge: Option<nn::Linear>,
    encoder_bridge_hidden: nn::Linear,
    encoder_bridge_cell: nn::Linear,
    vocab_size: i64,
    hidden_dim: i64,
    encoder_dim: i64,
    decoder_layers: i64,
    input_feeding: bool,
    copy_input_feeding: bool,
    copying_enabled: bool,
    unk_token_id: i64,
}

impl CopyRnnDecoder {
    pub fn new(p: nn::Path, config: &CopyRnnConfig) -> Result<CopyRnnDecoder, CopyRnnError> {
        config.validate()?;

        let embeddings = nn::embedding(
            &p / "embeddings",
            config.vocab_size,
            config.embedding_dim,
            EmbeddingConfig {
                ws_init: Init::Uniform { lo: -0.1, up: 0.1 },
                padding_idx: config.pad_token_id,
                ..Default::default()
            },
        );

        let mut input_dim = config.embedding_dim;
        if config.input_feeding {
            tracing::info!("applying input feeding");
            input_dim += config.decoder_hidden_dim;
        }
        if config.copy_input_feeding {
            tracing::info!("applying copy input feeding");
            input_dim += config.decoder_hidden_dim;
        }
        // the bridge compresses the enriched input back to the embedding width; it
        // only exists when at least one feedback source is enabled
        let input_bridge = if input_dim > config.embedding_dim {
            Some(nn::linear(
                &p / "input_bridge",
                input_dim,
                config.embedding_dim,
                Default::default(),
            ))
        } else {
            None
        };

        let decoder = nn::lstm(
            &p / "decoder",
            config.embedding_dim,
            config.decoder_hidden_dim,
            RNNConfig {
                num_layers: config.decoder_layers,
                dropout: config.dropout,
                batch_first: true,
                ..Default::default()
            },
        );

        let attention = Attention::new(
            &p / "attention",
            config.attention_method,
            config.encoder_hidden_dim,
            config.decoder_hidden_dim,
        );
        let copy_attention = if config.copy_attention && !config.reuse_copy_attention {
            Some(Attention::new(
                &p / "copy_attention",
                config.effective_copy_method(),
                config.encoder_hidden_dim,
                config.decoder_hidden_dim,
            ))
        } else {
            None
        };
        if config.copy_attention {
            tracing::info!(
                method = ?config.effective_copy_method(),
                reused = config.reuse_copy_attention,
                "applying copy mechanism"
            );
        }

        let vocab_projection = nn::linear(
            &p / "decoder2vocab",
            config.decoder_hidden_dim,
            config.vocab_size,
            Default::default(),
        );
        let encoder_bridge_hidden = nn::linear(
            &p / "encoder2decoder_hidden",
            config.encoder_hidden_dim,
            config.decoder_hidden_dim,
            Default::default(),
        );
        let encoder_bridge_cell = nn::linear(
            &p / "encoder2decoder_cell",
            config.encoder_hidden_dim,
            config.decoder_hidden_dim,
            Default::default(),
        );

        match config.teacher_forcing_policy() {
            TeacherForcingPolicy::Always => tracing::info!("training with full teacher forcing"),
            TeacherForcingPolicy::Ratio(ratio) => {
                tracing::info!(ratio, "training with static teacher forcing rate")
            }
            TeacherForcingPolicy::Decay { curve, total_steps } => {
                tracing::info!(?curve, total_steps, "applying scheduled sampling")
            }
        }

        Ok(CopyRnnDecoder {
            embeddings,
            decoder,
            attention,
            copy_attention,
            vocab_projection,
            input_bridge,
            encoder_bridge_hidden,
            encoder_bridge_cell,
            vocab_size: config.vocab_size,
            hidden_dim: config.decoder_hidden_dim,
            encoder_dim: config.encoder_hidden_dim,
            decoder_layers: config.decoder_layers,
            input_feeding: config.input_feeding,
            copy_input_feeding: config.copy_input_feeding,
            copying_enabled: config.copy_attention,
            unk_token_id: config.unk_token_id,
        })
    }

    pub fn vocab_size(&self) -> i64 {
        self.vocab_size
    }

    /// True when any feedback source is concatenated to the decoder input.
    pub fn uses_input_feeding(&self) -> bool {
        self.input_bridge.is_some()
    }

    /// Derives the initial decoder state from the encoder's final hidden and cell
    /// vectors, shape (batch size, encoder dim) each.
    pub fn init_state(
        &self,
        encoder_hidden: &Tensor,
        encoder_cell: &Tensor,
    ) -> Result<DecoderState, CopyRnnError> {
        let (batch_size, dim) = encoder_hidden.size2().map_err(|_| {
            CopyRnnError::ShapeMismatch(format!(
                "encoder final state must have shape (batch size, encoder dim), got {:?}",
                encoder_hidden.size()
            ))
        })?;
        if dim != self.encoder_dim {
            return Err(CopyRnnError::ShapeMismatch(format!(
                "encoder final state dimension {} disagrees with the configured encoder dim {}",
                dim, self.encoder_dim
            )));
        }
        let hidden = encoder_hidden
            .apply(&self.encoder_bridge_hidden)
            .tanh()
            .unsqueeze(0);
        let cell = encoder_cell
            .apply(&self.encoder_bridge_cell)
            .tanh()
            .unsqueeze(0);
        let (hidden, cell) = if self.decoder_layers > 1 {
            (
                hidden
                    .expand(&[self.decoder_layers, batch_size, self.hidden_dim], true)
                    .contiguous(),
                cell.expand(&[self.decoder_layers, batch_size, self.hidden_dim], true)
                    .contiguous(),
            )
        } else {
            (hidden, cell)
        };
        Ok(DecoderState { hidden, cell })
    }

    /// Structural batch validation, run before any computation touches the state.
    fn validate_batch(
        &self,
        encoded: &EncodedSource,
        source_map: Option<&SourceMap>,
    ) -> Result<(), CopyRnnError> {
        if encoded.encoder_dim() != self.encoder_dim {
            return Err(CopyRnnError::ShapeMismatch(format!(
                "encoder states dimension {} disagrees with the configured encoder dim {}",
                encoded.encoder_dim(),
                self.encoder_dim
            )));
        }
        if self.copying_enabled {
            let source_map = source_map.ok_or_else(|| {
                CopyRnnError::InvalidBatch("copy attention requires a source map".into())
            })?;
            if source_map.batch_size() != encoded.batch_size()
                || source_map.source_length() != encoded.source_length()
            {
                return Err(CopyRnnError::InvalidBatch(format!(
                    "source map shape ({}, {}) disagrees with encoder states shape ({}, {})",
                    source_map.batch_size(),
                    source_map.source_length(),
                    encoded.batch_size(),
                    encoded.source_length()
                )));
            }
        }
        // an all-padding example would make the attention softmax degenerate
        let min_coverage = f64::from(
            &encoded
                .mask
                .sum_dim_intlist(&[1], false, Float)
                .min(),
        );
        if min_coverage <= 0.0 {
            return Err(CopyRnnError::InvalidBatch(
                "every example must have at least one unmasked source position".into(),
            ));
        }
        Ok(())
    }

    /// Projects the encoder states into attention keys. Only the `dot` scoring
    /// function needs an actual projection (into the decoder dimension).
    fn prepare_source(&self, encoded: &EncodedSource) -> Tensor {
        match self.attention.method() {
            AttentionMethod::dot => {
                let projected = encoded.states.apply(&self.encoder_bridge_hidden).tanh();
                projected * encoded.mask.unsqueeze(-1)
            }
            _ => encoded.states.shallow_clone(),
        }
    }

    /// Concatenates the feedback contexts to the embedded input and compresses the
    /// result through the bridge. Without any feedback source the raw embedding is
    /// used unmodified.
    fn merge_decode_inputs(&self, embedded: &Tensor, feedback: &FeedbackContext) -> Tensor {
        match &self.input_bridge {
            Some(bridge) => {
                let mut features = vec![embedded.shallow_clone()];
                if self.input_feeding {
                    features.push(feedback.context.shallow_clone());
                }
                if self.copy_input_feeding {
                    features.push(feedback.copy_context.shallow_clone());
                }
                Tensor::cat(&features, 2).apply(bridge).tanh()
            }
            None => embedded.shallow_clone(),
        }
    }

    /// One recurrence of the decoder over pre-projected attention keys.
    fn step(
        &self,
        prev_tokens: &Tensor,
        state: &DecoderState,
        keys: &Tensor,
        mask: &Tensor,
        source_map: Option<&SourceMap>,
        feedback: &FeedbackContext,
    ) -> Result<DecoderStepOutput, CopyRnnError> {
        let (batch_size, step_width) = prev_tokens.size2().map_err(|_| {
            CopyRnnError::ShapeMismatch(format!(
                "previous tokens must have shape (batch size, 1), got {:?}",
                prev_tokens.size()
            ))
        })?;
        if step_width != 1 {
            return Err(CopyRnnError::ShapeMismatch(format!(
                "decode step expects one token per example, got {} per example",
                step_width
            )));
        }
        if batch_size != state.batch_size() {
            return Err(CopyRnnError::ShapeMismatch(format!(
                "input batch size {} disagrees with decoder state batch size {}",
                batch_size,
                state.batch_size()
            )));
        }

        let embedded = prev_tokens.apply(&self.embeddings);
        let input = self.merge_decode_inputs(&embedded, feedback);
        let (output, new_state) = self.decoder.seq_init(&input, &state.as_lstm_state());

        let (context, attention_weights, attention_logits) =
            self.attention.forward(&output, keys, Some(mask));
        let generation_logits = context.apply(&self.vocab_projection);

        let (log_probs, copy_context, copy_weights) = if self.copying_enabled {
            let source_map = source_map.ok_or_else(|| {
                CopyRnnError::InvalidBatch("copy attention requires a source map".into())
            })?;
            let (copy_context, copy_weights, copy_logits) = match &self.copy_attention {
                Some(copy_attention) => copy_attention.forward(&output, keys, Some(mask)),
                None => (
                    context.shallow_clone(),
                    attention_weights.shallow_clone(),
                    attention_logits.shallow_clone(),
                ),
            };
            let log_probs =
                merge_copy_logits(&generation_logits, &copy_logits, source_map, self.vocab_size)?;
            (log_probs, copy_context, Some(copy_weights))
        } else {
            (
                generation_logits.log_softmax(-1, Float),
                context.shallow_clone(),
                None,
            )
        };

        Ok(DecoderStepOutput {
            log_probs,
            state: DecoderState::from_lstm_state(new_state),
            output,
            context,
            copy_context,
            attention: attention_weights,
            copy_attention: copy_weights,
        })
    }

    /// Teacher-forced decode of a whole target sequence in one unrolled call.
    ///
    /// This is a performance shortcut for full ground-truth feedback and is
    /// numerically equivalent to running the step loop with ground-truth inputs. It
    /// cannot honor input feeding (the feedback contexts only exist step by step) and
    /// rejects such configurations.
    ///
    /// * `target_tokens` - (batch size, target length); the final token is never used
    ///   as an input.
    pub fn forward(
        &self,
        target_tokens: &Tensor,
        encoded: &EncodedSource,
        source_map: Option<&SourceMap>,
        state: DecoderState,
    ) -> Result<DecoderOutput, CopyRnnError> {
        self.validate_batch(encoded, source_map)?;
        if self.uses_input_feeding() {
            return Err(CopyRnnError::InvalidConfigurationError(
                "unrolled teacher forcing cannot honor input feeding; use the step-by-step driver"
                    .into(),
            ));
        }
        let (batch_size, target_length) = self.check_targets(target_tokens, encoded)?;
        if batch_size != state.batch_size() {
            return Err(CopyRnnError::ShapeMismatch(format!(
                "target batch size {} disagrees with decoder state batch size {}",
                batch_size,
                state.batch_size()
            )));
        }
        let steps = target_length - 1;
        let keys = self.prepare_source(encoded);

        let inputs = target_tokens.narrow(1, 0, steps).apply(&self.embeddings);
        let (outputs, _) = self.decoder.seq_init(&inputs, &state.as_lstm_state());

        let (contexts, attention_weights, attention_logits) =
            self.attention.forward(&outputs, &keys, Some(encoded.mask));
        let generation_logits = contexts.apply(&self.vocab_projection);

        let (log_probs, copy_weights) = if self.copying_enabled {
            let source_map = source_map.ok_or_else(|| {
                CopyRnnError::InvalidBatch("copy attention requires a source map".into())
            })?;
            let (_, copy_weights, copy_logits) = match &self.copy_attention {
                Some(copy_attention) => copy_attention.forward(&outputs, &keys, Some(encoded.mask)),
                None => (
                    contexts.shallow_clone(),
                    attention_weights.shallow_clone(),
                    attention_logits.shallow_clone(),
                ),
            };
            (
                merge_copy_logits(&generation_logits, &copy_logits, source_map, self.vocab_size)?,
                Some(copy_weights),
            )
        } else {
            (generation_logits.log_softmax(-1, Float), None)
        };

        Ok(DecoderOutput {
            log_probs,
            hidden_states: outputs,
            attention: attention_weights,
            copy_attention: copy_weights,
        })
    }

    /// Step-by-step decode, consulting the scheduled sampler once per step to pick the
    /// next input: the ground-truth token, or the model's own top-1 prediction with
    /// OOV ids remapped to `<unk>` (extended-vocabulary ids are never embedded).
    pub fn decode_sampled<R>(
        &self,
        target_tokens: &Tensor,
        encoded: &EncodedSource,
        source_map: Option<&SourceMap>,
        state: DecoderState,
        sampler: &mut ScheduledSampler<R>,
    ) -> Result<DecoderOutput, CopyRnnError>
    where
        R: Rng,
    {
        self.validate_batch(encoded, source_map)?;
        let (batch_size, target_length) = self.check_targets(target_tokens, encoded)?;
        if batch_size != state.batch_size() {
            return Err(CopyRnnError::ShapeMismatch(format!(
                "target batch size {} disagrees with decoder state batch size {}",
                batch_size,
                state.batch_size()
            )));
        }
        let steps = target_length - 1;
        let keys = self.prepare_source(encoded);
        let device = encoded.states.device();

        let mut state = state;
        let mut feedback = FeedbackContext::zeros(batch_size, self.hidden_dim, device);
        let mut prev_tokens = target_tokens.narrow(1, 0, 1);

        let mut log_probs: Vec<Tensor> = Vec::with_capacity(steps as usize);
        let mut outputs: Vec<Tensor> = Vec::with_capacity(steps as usize);
        let mut attention: Vec<Tensor> = Vec::with_capacity(steps as usize);
        let mut copy_attention: Vec<Tensor> = Vec::with_capacity(steps as usize);

        for step_index in 0..steps {
            let step_output = self.step(
                &prev_tokens,
                &state,
                &keys,
                encoded.mask,
                source_map,
                &feedback,
            )?;
            let DecoderStepOutput {
                log_probs: step_log_probs,
                state: new_state,
                output,
                context,
                copy_context,
                attention: step_attention,
                copy_attention: step_copy_attention,
            } = step_output;

            prev_tokens = match sampler.next_decision() {
                FeedDecision::GroundTruth => target_tokens.narrow(1, step_index + 1, 1),
                FeedDecision::ModelPrediction => {
                    let (_, top_ids) = step_log_probs.topk(1, -1, true, true);
                    let top_ids = top_ids.squeeze_dim(-1);
                    top_ids.masked_fill(&top_ids.ge(self.vocab_size), self.unk_token_id)
                }
            };

            log_probs.push(step_log_probs);
            outputs.push(output);
            attention.push(step_attention);
            if let Some(weights) = step_copy_attention {
                copy_attention.push(weights);
            }
            feedback = FeedbackContext {
                context,
                copy_context,
            };
            state = new_state;
        }

        Ok(DecoderOutput {
            log_probs: Tensor::cat(&log_probs, 1),
            hidden_states: Tensor::cat(&outputs, 1),
            attention: Tensor::cat(&attention, 1),
            copy_attention: if self.copying_enabled {
                Some(Tensor::cat(&copy_attention, 1))
            } else {
                None
            },
        })
    }

    /// Decodes a full target sequence, dispatching to the unrolled driver when the
    /// policy can never sample (and no feedback is fed), to the step loop otherwise.
    pub fn decode<R>(
        &self,
        target_tokens: &Tensor,
        encoded: &EncodedSource,
        source_map: Option<&SourceMap>,
        state: DecoderState,
        sampler: &mut ScheduledSampler<R>,
    ) -> Result<DecoderOutput, CopyRnnError>
    where
        R: Rng,
    {
        if sampler.policy().always_ground_truth() && !self.uses_input_feeding() {
            self.forward(target_tokens, encoded, source_map, state)
        } else {
            self.decode_sampled(target_tokens, encoded, source_map, state, sampler)
        }
    }

    /// Decodes several target phrases per source, carrying decoder state across
    /// phrase boundaries.
    ///
    /// After phrase *k*, the state snapshot taken at each example's true (unpadded)
    /// phrase length, not the batch-padded length, seeds phrase *k+1*, so state
    /// computed from padding steps never leaks into the next phrase.
    ///
    /// * `target_phrases` - (batch size, phrase count, phrase length)
    /// * `phrase_lengths` - true lengths (start token included), one `Vec` per
    ///   example, one entry per phrase
    ///
    /// Outputs are phrase-major: (batch size × phrase count, phrase length - 1, ·).
    pub fn decode_cascade<R>(
        &self,
        target_phrases: &Tensor,
        phrase_lengths: &[Vec<i64>],
        encoded: &EncodedSource,
        source_map: Option<&SourceMap>,
        state: DecoderState,
        sampler: &mut ScheduledSampler<R>,
    ) -> Result<DecoderOutput, CopyRnnError>
    where
        R: Rng,
    {
        self.validate_batch(encoded, source_map)?;
        let (batch_size, phrase_count, phrase_length) =
            target_phrases.size3().map_err(|_| {
                CopyRnnError::InvalidBatch(format!(
                    "cascaded targets must have shape (batch size, phrase count, phrase length), got {:?}",
                    target_phrases.size()
                ))
            })?;
        if batch_size != encoded.batch_size() {
            return Err(CopyRnnError::InvalidBatch(format!(
                "target batch size {} disagrees with encoder batch size {}",
                batch_size,
                encoded.batch_size()
            )));
        }
        if phrase_length < 2 {
            return Err(CopyRnnError::InvalidBatch(
                "target phrases must hold at least two tokens (start token plus one target)".into(),
            ));
        }
        if phrase_lengths.len() != batch_size as usize
            || phrase_lengths
                .iter()
                .any(|lengths| lengths.len() != phrase_count as usize)
        {
            return Err(CopyRnnError::InvalidBatch(format!(
                "phrase lengths must hold {} entries per example for {} examples",
                phrase_count, batch_size
            )));
        }
        if phrase_lengths
            .iter()
            .flatten()
            .any(|&length| length > phrase_length)
        {
            return Err(CopyRnnError::InvalidBatch(
                "a true phrase length exceeds the padded phrase length".into(),
            ));
        }
        if batch_size != state.batch_size() {
            return Err(CopyRnnError::ShapeMismatch(format!(
                "target batch size {} disagrees with decoder state batch size {}",
                batch_size,
                state.batch_size()
            )));
        }

        let steps = phrase_length - 1;
        let keys = self.prepare_source(encoded);
        let device = encoded.states.device();

        let mut state = state;
        // the feedback contexts persist across phrase boundaries
        let mut feedback = FeedbackContext::zeros(batch_size, self.hidden_dim, device);

        let mut log_probs_phrases: Vec<Tensor> = Vec::with_capacity(phrase_count as usize);
        let mut output_phrases: Vec<Tensor> = Vec::with_capacity(phrase_count as usize);
        let mut attention_phrases: Vec<Tensor> = Vec::with_capacity(phrase_count as usize);
        let mut copy_attention_phrases: Vec<Tensor> = Vec::with_capacity(phrase_count as usize);

        for phrase_index in 0..phrase_count {
            let phrase = target_phrases.select(1, phrase_index);
            let mut prev_tokens = phrase.narrow(1, 0, 1);

            let mut hidden_snapshots: Vec<Tensor> = vec![state.hidden.shallow_clone()];
            let mut cell_snapshots: Vec<Tensor> = vec![state.cell.shallow_clone()];
            let mut log_probs: Vec<Tensor> = Vec::with_capacity(steps as usize);
            let mut outputs: Vec<Tensor> = Vec::with_capacity(steps as usize);
            let mut attention: Vec<Tensor> = Vec::with_capacity(steps as usize);
            let mut copy_attention: Vec<Tensor> = Vec::with_capacity(steps as usize);

            for step_index in 0..steps {
                let step_output = self.step(
                    &prev_tokens,
                    &state,
                    &keys,
                    encoded.mask,
                    source_map,
                    &feedback,
                )?;
                let DecoderStepOutput {
                    log_probs: step_log_probs,
                    state: new_state,
                    output,
                    context,
                    copy_context,
                    attention: step_attention,
                    copy_attention: step_copy_attention,
                } = step_output;

                prev_tokens = match sampler.next_decision() {
                    FeedDecision::GroundTruth => phrase.narrow(1, step_index + 1, 1),
                    FeedDecision::ModelPrediction => {
                        let (_, top_ids) = step_log_probs.topk(1, -1, true, true);
                        let top_ids = top_ids.squeeze_dim(-1);
                        top_ids.masked_fill(&top_ids.ge(self.vocab_size), self.unk_token_id)
                    }
                };

                hidden_snapshots.push(new_state.hidden.shallow_clone());
                cell_snapshots.push(new_state.cell.shallow_clone());
                log_probs.push(step_log_probs);
                outputs.push(output);
                attention.push(step_attention);
                if let Some(weights) = step_copy_attention {
                    copy_attention.push(weights);
                }
                feedback = FeedbackContext {
                    context,
                    copy_context,
                };
                state = new_state;
            }

            log_probs_phrases.push(Tensor::cat(&log_probs, 1));
            output_phrases.push(Tensor::cat(&outputs, 1));
            attention_phrases.push(Tensor::cat(&attention, 1));
            if self.copying_enabled {
                copy_attention_phrases.push(Tensor::cat(&copy_attention, 1));
            }

            // pick, independently per example, the state after that example's last
            // real token (the start token only serves as input)
            let hidden_stack = Tensor::stack(&hidden_snapshots, 0);
            let cell_stack = Tensor::stack(&cell_snapshots, 0);
            let mut selected_hidden: Vec<Tensor> = Vec::with_capacity(batch_size as usize);
            let mut selected_cell: Vec<Tensor> = Vec::with_capacity(batch_size as usize);
            for (example, lengths) in phrase_lengths.iter().enumerate() {
                let snapshot_index = (lengths[phrase_index as usize] - 1).max(0);
                selected_hidden.push(
                    hidden_stack
                        .select(0, snapshot_index)
                        .narrow(1, example as i64, 1),
                );
                selected_cell.push(
                    cell_stack
                        .select(0, snapshot_index)
                        .narrow(1, example as i64, 1),
                );
            }
            state = DecoderState {
                hidden: Tensor::cat(&selected_hidden, 1),
                cell: Tensor::cat(&selected_cell, 1),
            };
        }

        Ok(DecoderOutput {
            log_probs: Tensor::cat(&log_probs_phrases, 0),
            hidden_states: Tensor::cat(&output_phrases, 0),
            attention: Tensor::cat(&attention_phrases, 0),
            copy_attention: if self.copying_enabled {
                Some(Tensor::cat(&copy_attention_phrases, 0))
            } else {
                None
            },
        })
    }

    /// Single-step inference entry point for an external beam search.
    ///
    /// Runs exactly one decode step from a caller-supplied previous token and state.
    /// No teacher-forcing or sampling decision is taken here; expanding and pruning
    /// hypotheses is the caller's responsibility.
    pub fn generate_step(
        &self,
        prev_tokens: &Tensor,
        state: DecoderState,
        encoded: &EncodedSource,
        source_map: Option<&SourceMap>,
        feedback: Option<&FeedbackContext>,
    ) -> Result<DecoderStepOutput, CopyRnnError> {
        self.validate_batch(encoded, source_map)?;
        let keys = self.prepare_source(encoded);
        let zero_feedback;
        let feedback = match feedback {
            Some(feedback) => feedback,
            None => {
                zero_feedback = FeedbackContext::zeros(
                    prev_tokens.size()[0],
                    self.hidden_dim,
                    encoded.states.device(),
                );
                &zero_feedback
            }
        };
        self.step(prev_tokens, &state, &keys, encoded.mask, source_map, feedback)
    }

    /// Greedy rollout: feeds the top-1 prediction back for `max_length` steps and
    /// returns the predicted extended-vocabulary ids with their cumulative scores.
    pub fn generate_greedy(
        &self,
        start_tokens: &Tensor,
        state: DecoderState,
        encoded: &EncodedSource,
        source_map: Option<&SourceMap>,
        max_length: i64,
    ) -> Result<GreedyDecodeOutput, CopyRnnError> {
        self.validate_batch(encoded, source_map)?;
        if max_length < 1 {
            return Err(CopyRnnError::InvalidBatch(format!(
                "max_length must be at least 1, got {}",
                max_length
            )));
        }
        let keys = self.prepare_source(encoded);
        let device = encoded.states.device();
        let batch_size = start_tokens.size()[0];

        let mut state = state;
        let mut feedback = FeedbackContext::zeros(batch_size, self.hidden_dim, device);
        let mut prev_tokens = start_tokens.shallow_clone();
        let mut cumulative = Tensor::zeros(&[batch_size, 1], (Float, device));

        let mut token_ids: Vec<Tensor> = Vec::with_capacity(max_length as usize);
        let mut scores: Vec<Tensor> = Vec::with_capacity(max_length as usize);
        let mut log_probs: Vec<Tensor> = Vec::with_capacity(max_length as usize);
        let mut attention: Vec<Tensor> = Vec::with_capacity(max_length as usize);

        for _ in 0..max_length {
            let step_output = self.step(
                &prev_tokens,
                &state,
                &keys,
                encoded.mask,
                source_map,
                &feedback,
            )?;
            let (top_scores, top_ids) = step_output.log_probs.topk(1, -1, true, true);
            let top_ids = top_ids.squeeze_dim(-1);
            cumulative = cumulative + top_scores.squeeze_dim(-1);

            token_ids.push(top_ids.shallow_clone());
            scores.push(cumulative.shallow_clone());
            log_probs.push(step_output.log_probs);
            attention.push(step_output.attention);

            prev_tokens = top_ids.masked_fill(&top_ids.ge(self.vocab_size), self.unk_token_id);
            feedback = FeedbackContext {
                context: step_output.context,
                copy_context: step_output.copy_context,
            };
            state = step_output.state;
        }

        Ok(GreedyDecodeOutput {
            token_ids: Tensor::cat(&token_ids, 1),
            scores: Tensor::cat(&scores, 1),
            log_probs: Tensor::cat(&log_probs, 1),
            attention: Tensor::cat(&attention, 1),
            state,
        })
    }

    fn check_targets(
        &self,
        target_tokens: &Tensor,
        encoded: &EncodedSource,
    ) -> Result<(i64, i64), CopyRnnError> {
        let (batch_size, target_length) = target_tokens.size2().map_err(|_| {
            CopyRnnError::InvalidBatch(format!(
                "target tokens must have shape (batch size, target length), got {:?}",
                target_tokens.size()
            ))
        })?;
        if batch_size != encoded.batch_size() {
            return Err(CopyRnnError::InvalidBatch(format!(
                "target batch size {} disagrees with encoder batch size {}",
                batch_size,
                encoded.batch_size()
            )));
        }
        if target_length < 2 {
            return Err(CopyRnnError::InvalidBatch(
                "target sequences must hold at least two tokens (start token plus one target)"
                    .into(),
            ));
        }
        Ok((batch_size, target_length))
    }
}
