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
use tch::kind::Kind::{Float, Int64};
use tch::{Kind, Tensor};

#[derive(Debug)]
/// # Source map for the copy mechanism
/// Per-example mapping from source position to extended-vocabulary index. Indices
/// `>= vocab_size` address temporary out-of-vocabulary slots that exist only for the
/// lifetime of one decode call; slot numbering is per example, not global.
pub struct SourceMap {
    indices: Tensor,
    oov_counts: Vec<i64>,
    max_oov: i64,
    max_index: i64,
}

impl SourceMap {
    /// Builds a source map from a (batch size, source length) tensor of extended
    /// vocabulary ids and the number of distinct OOV slots used by each example.
    pub fn new(indices: Tensor, oov_counts: Vec<i64>) -> Result<SourceMap, CopyRnnError> {
        let size = indices.size();
        if size.len() != 2 {
            return Err(CopyRnnError::InvalidBatch(format!(
                "source map must have shape (batch size, source length), got {:?}",
                size
            )));
        }
        if indices.kind() != Kind::Int64 {
            return Err(CopyRnnError::InvalidBatch(format!(
                "source map indices must be of kind Int64, got {:?}",
                indices.kind()
            )));
        }
        if size[0] as usize != oov_counts.len() {
            return Err(CopyRnnError::InvalidBatch(format!(
                "source map batch size ({}) disagrees with the number of OOV counts ({})",
                size[0],
                oov_counts.len()
            )));
        }
        if size[1] == 0 {
            return Err(CopyRnnError::InvalidBatch(
                "source map must cover at least one source position".into(),
            ));
        }
        if oov_counts.iter().any(|&count| count < 0) {
            return Err(CopyRnnError::InvalidBatch(
                "per-example OOV counts must be non-negative".into(),
            ));
        }
        let min_index = i64::from(&indices.min());
        if min_index < 0 {
            return Err(CopyRnnError::IndexOutOfRange(format!(
                "source map contains a negative vocabulary index ({})",
                min_index
            )));
        }
        let max_oov = oov_counts.iter().copied().max().unwrap_or(0);
        let max_index = i64::from(&indices.max());
        Ok(SourceMap {
            indices,
            oov_counts,
            max_oov,
            max_index,
        })
    }

    pub fn indices(&self) -> &Tensor {
        &self.indices
    }

    pub fn oov_counts(&self) -> &[i64] {
        &self.oov_counts
    }

    /// Largest per-example OOV count in the batch; the extended vocabulary has
    /// `vocab_size + max_oov` entries.
    pub fn max_oov(&self) -> i64 {
        self.max_oov
    }

    pub fn batch_size(&self) -> i64 {
        self.indices.size()[0]
    }

    pub fn source_length(&self) -> i64 {
        self.indices.size()[1]
    }
}

/// Merges generation logits with copy logits into one log-probability distribution
/// over the extended vocabulary.
///
/// The merge operates on logits, not probabilities: the generation logits are first
/// extended by `max_oov` slots, the copy logits are scattered (accumulating) into the
/// slots their source positions map to, and a single log-softmax normalizes the
/// generative and copying mass jointly. The extension slots of an example are
/// initialized to 0 for its own OOV slots and to -inf beyond them, so that examples
/// with fewer OOV words than the batch maximum assign exactly zero probability to the
/// slots they do not use.
///
/// * `generation_logits` - (batch size, steps, vocab size)
/// * `copy_logits` - (batch size, steps, source length)
///
/// Returns log-probabilities of shape (batch size, steps, vocab size + max_oov).
pub fn merge_copy_logits(
    generation_logits: &Tensor,
    copy_logits: &Tensor,
    source_map: &SourceMap,
    vocab_size: i64,
) -> Result<Tensor, CopyRnnError> {
    let (batch_size, steps, logits_width) = generation_logits.size3()?;
    let (copy_batch_size, copy_steps, source_length) = copy_logits.size3()?;
    if logits_width != vocab_size {
        return Err(CopyRnnError::ShapeMismatch(format!(
            "generation logits cover {} entries, expected the base vocabulary size {}",
            logits_width, vocab_size
        )));
    }
    if copy_batch_size != batch_size || copy_steps != steps {
        return Err(CopyRnnError::ShapeMismatch(format!(
            "copy logits shape ({}, {}) disagrees with generation logits shape ({}, {})",
            copy_batch_size, copy_steps, batch_size, steps
        )));
    }
    if source_map.batch_size() != batch_size || source_map.source_length() != source_length {
        return Err(CopyRnnError::ShapeMismatch(format!(
            "source map shape ({}, {}) disagrees with copy logits source axis ({}, {})",
            source_map.batch_size(),
            source_map.source_length(),
            batch_size,
            source_length
        )));
    }

    let max_oov = source_map.max_oov();
    if source_map.max_index >= vocab_size + max_oov {
        return Err(CopyRnnError::IndexOutOfRange(format!(
            "source map index {} exceeds the extended vocabulary size {}",
            source_map.max_index,
            vocab_size + max_oov
        )));
    }

    let device = generation_logits.device();
    let mut flattened_logits = generation_logits.contiguous().view((batch_size * steps, vocab_size));
    if max_oov > 0 {
        // 0 keeps an example's own OOV slots neutral in logit space; -inf removes the
        // unused tail slots after normalization. Initializing the tail to 0 instead
        // would rank it above the (mostly negative) generation logits.
        let extension_rows = source_map
            .oov_counts()
            .iter()
            .map(|&oov_count| {
                let mut row = vec![0f32; max_oov as usize];
                for slot in &mut row[oov_count as usize..] {
                    *slot = f32::NEG_INFINITY;
                }
                Tensor::of_slice(&row)
            })
            .collect::<Vec<_>>();
        let extension = Tensor::stack(&extension_rows, 0)
            .to_device(device)
            .unsqueeze(1)
            .expand(&[batch_size, steps, max_oov], true)
            .contiguous()
            .view((batch_size * steps, max_oov));
        flattened_logits = Tensor::cat(&[flattened_logits, extension], 1);
    }

    // repeated source words map to the same slot; their copy mass must accumulate
    let scatter_indices = source_map
        .indices()
        .unsqueeze(1)
        .expand(&[batch_size, steps, source_length], true)
        .contiguous()
        .view((batch_size * steps, source_length));
    let merged = flattened_logits.scatter_add(
        1,
        &scatter_indices,
        &copy_logits.contiguous().view((batch_size * steps, source_length)),
    );

    Ok(merged
        .log_softmax(-1, Float)
        .view((batch_size, steps, vocab_size + max_oov)))
}

/// Folds the probability mass of all OOV slots into the `<unk>` entry of the base
/// vocabulary, for consumers that need predictions constrained to the base vocabulary.
///
/// * `log_probs` - (batch size, steps, vocab size + max_oov)
///
/// Returns log-probabilities of shape (batch size, steps, vocab size).
pub fn fold_oov_into_unk(
    log_probs: &Tensor,
    vocab_size: i64,
    unk_token_id: i64,
) -> Result<Tensor, CopyRnnError> {
    let (batch_size, steps, extended_size) = log_probs.size3()?;
    let max_oov = extended_size - vocab_size;
    if max_oov < 0 {
        return Err(CopyRnnError::ShapeMismatch(format!(
            "log-probabilities cover {} entries, fewer than the base vocabulary size {}",
            extended_size, vocab_size
        )));
    }
    if unk_token_id >= vocab_size {
        return Err(CopyRnnError::IndexOutOfRange(format!(
            "unknown-word id {} is outside the base vocabulary of size {}",
            unk_token_id, vocab_size
        )));
    }
    if max_oov == 0 {
        return Ok(log_probs.copy());
    }

    let probs = log_probs.exp();
    let base_probs = probs.narrow(2, 0, vocab_size);
    let oov_mass = probs
        .narrow(2, vocab_size, max_oov)
        .sum_dim_intlist(&[2], true, Float);
    let unk_scatter = Tensor::full(
        &[batch_size, steps, 1],
        unk_token_id,
        (Int64, log_probs.device()),
    );
    Ok(base_probs.scatter_add(2, &unk_scatter, &oov_mass).log())
}
