//! Ready-to-use pointer-generator decoders for keyphrase generation.
//!
//! The crate covers the decoding half of a CopyRNN model: Luong-style attention with a
//! copy mechanism over an example-specific extended vocabulary, teacher-forced and
//! scheduled-sampling drivers, cascaded multi-phrase decoding and a single-step entry
//! point for external beam search. See the [`copy_rnn`] module documentation for an
//! overview and a set-up example.

pub mod common;
pub mod copy_rnn;

pub use common::config::Config;
pub use common::error::CopyRnnError;
