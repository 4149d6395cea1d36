//! # CopyRNN (Meng et al.)
//!
//! Implementation of the CopyRNN keyphrase generation decoder ([Deep Keyphrase Generation](https://arxiv.org/abs/1704.06879) Meng, Zhao, Han, He, Brusilovsky, Chi, 2017):
//! an attentional LSTM decoder extended with the copy mechanism of [Gu et al., 2016](https://arxiv.org/abs/1603.06393),
//! which can either generate a word from the base vocabulary or copy a word straight from the
//! source text, including out-of-vocabulary words. The generation and copy distributions are
//! merged in logit space over an example-specific extended vocabulary and normalized jointly.
//!
//! Encoding the source text into state vectors, batching and beam search are the
//! responsibility of the caller; the decoder consumes encoder states through
//! [`EncodedSource`](crate::copy_rnn::EncodedSource) and exposes the single-step
//! [`generate_step`](crate::copy_rnn::CopyRnnDecoder::generate_step) entry point for an
//! external beam-search controller.
//!
//! # Model set-up
//!
//! ```no_run
//! use rust_copyrnn::copy_rnn::{CopyRnnConfig, CopyRnnDecoder};
//! use rust_copyrnn::Config;
//! use tch::{nn, Device};
//! # use std::path::PathBuf;
//!
//! # fn main() -> anyhow::Result<()> {
//! let device = Device::cuda_if_available();
//! let vs = nn::VarStore::new(device);
//! let config = CopyRnnConfig::from_file(PathBuf::from("path/to/config.json"));
//! let decoder = CopyRnnDecoder::new(vs.root(), &config)?;
//! # Ok(())
//! # }
//! ```

mod attention;
mod copy_rnn;
mod decoder;
mod extended_vocab;
mod sampling;

pub use attention::{Attention, AttentionMethod};
pub use copy_rnn::CopyRnnConfig;
pub use decoder::{
    CopyRnnDecoder, DecoderOutput, DecoderState, DecoderStepOutput, EncodedSource,
    FeedbackContext, GreedyDecodeOutput,
};
pub use extended_vocab::{fold_oov_into_unk, merge_copy_logits, SourceMap};
pub use sampling::{DecayCurve, FeedDecision, ScheduledSampler, TeacherForcingPolicy};
