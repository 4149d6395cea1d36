use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_copyrnn::copy_rnn::{
    fold_oov_into_unk, merge_copy_logits, AttentionMethod, CopyRnnConfig, CopyRnnDecoder,
    DecayCurve, EncodedSource, ScheduledSampler, SourceMap, TeacherForcingPolicy,
};
use rust_copyrnn::CopyRnnError;
use tch::kind::Kind::{Float, Int64};
use tch::{nn, Device, Tensor};

fn test_config() -> CopyRnnConfig {
    CopyRnnConfig {
        vocab_size: 10,
        embedding_dim: 8,
        encoder_hidden_dim: 12,
        decoder_hidden_dim: 16,
        decoder_layers: 1,
        dropout: 0.0,
        attention_method: AttentionMethod::general,
        copy_attention: true,
        copy_method: None,
        reuse_copy_attention: false,
        input_feeding: false,
        copy_input_feeding: false,
        must_teacher_forcing: true,
        teacher_forcing_ratio: 1.0,
        scheduled_sampling: false,
        scheduled_sampling_steps: 1000,
        scheduled_sampling_decay: DecayCurve::inverse_sigmoid,
        pad_token_id: 0,
        bos_token_id: 1,
        unk_token_id: 3,
    }
}

/// Two examples over three source positions; the second example's last position is
/// padding. Example 0 uses two OOV slots (ids 10 and 11), example 1 a single one.
fn test_batch(device: Device) -> (Tensor, Tensor, Tensor, SourceMap) {
    let encoder_states = Tensor::randn(&[2, 3, 12], (Float, device));
    let mask = Tensor::of_slice(&[1f32, 1., 1., 1., 1., 0.]).view((2, 3));
    let map_indices = Tensor::of_slice(&[10i64, 2, 11, 10, 4, 0]).view((2, 3));
    let source_map = SourceMap::new(map_indices, vec![2, 1]).unwrap();
    let encoder_final = Tensor::randn(&[2, 12], (Float, device));
    (encoder_states, mask, encoder_final, source_map)
}

fn always_forced() -> ScheduledSampler<StdRng> {
    ScheduledSampler::with_rng(TeacherForcingPolicy::Always, StdRng::seed_from_u64(0))
}

#[test]
fn copy_rnn_extended_distribution_is_normalized() -> anyhow::Result<()> {
    tch::manual_seed(42);
    let device = Device::Cpu;
    let vs = nn::VarStore::new(device);
    let decoder = CopyRnnDecoder::new(vs.root(), &test_config())?;

    let (encoder_states, mask, encoder_final, source_map) = test_batch(device);
    let encoded = EncodedSource::new(&encoder_states, &mask)?;
    let state = decoder.init_state(&encoder_final, &encoder_final)?;

    let targets = Tensor::of_slice(&[1i64, 5, 6, 2, 1, 7, 3, 2]).view((2, 4));
    let output = decoder.forward(&targets, &encoded, Some(&source_map), state)?;

    assert_eq!(output.log_probs.size(), vec![2, 3, 12]);
    let probability_sums = output.log_probs.exp().sum_dim_intlist(&[2], false, Float);
    for example in 0..2 {
        for step in 0..3 {
            let sum = probability_sums.double_value(&[example, step]);
            assert!((sum - 1.0).abs() < 1e-4, "sum = {}", sum);
        }
    }

    // example 1 only owns OOV slot 10; slot 11 must carry no mass
    let probabilities = output.log_probs.exp();
    for step in 0..3 {
        assert!(probabilities.double_value(&[1, step, 11]) < 1e-6);
    }
    Ok(())
}

#[test]
fn copy_rnn_masked_positions_get_zero_attention() -> anyhow::Result<()> {
    tch::manual_seed(42);
    let device = Device::Cpu;
    let vs = nn::VarStore::new(device);
    let decoder = CopyRnnDecoder::new(vs.root(), &test_config())?;

    let (encoder_states, mask, encoder_final, source_map) = test_batch(device);
    let encoded = EncodedSource::new(&encoder_states, &mask)?;
    let state = decoder.init_state(&encoder_final, &encoder_final)?;

    let targets = Tensor::of_slice(&[1i64, 5, 6, 2, 1, 7, 3, 2]).view((2, 4));
    let output = decoder.forward(&targets, &encoded, Some(&source_map), state)?;

    // example 1's third source position is padding
    for step in 0..3 {
        assert_eq!(output.attention.double_value(&[1, step, 2]), 0.0);
    }
    let copy_attention = output.copy_attention.unwrap();
    for step in 0..3 {
        assert_eq!(copy_attention.double_value(&[1, step, 2]), 0.0);
    }
    Ok(())
}

#[test]
fn copy_rnn_unrolled_matches_step_by_step() -> anyhow::Result<()> {
    tch::manual_seed(42);
    let device = Device::Cpu;
    let vs = nn::VarStore::new(device);
    let decoder = CopyRnnDecoder::new(vs.root(), &test_config())?;

    let (encoder_states, mask, encoder_final, source_map) = test_batch(device);
    let encoded = EncodedSource::new(&encoder_states, &mask)?;
    let targets = Tensor::of_slice(&[1i64, 5, 6, 2, 1, 7, 3, 2]).view((2, 4));

    let unrolled = decoder.forward(
        &targets,
        &encoded,
        Some(&source_map),
        decoder.init_state(&encoder_final, &encoder_final)?,
    )?;
    let mut sampler = always_forced();
    let stepped = decoder.decode_sampled(
        &targets,
        &encoded,
        Some(&source_map),
        decoder.init_state(&encoder_final, &encoder_final)?,
        &mut sampler,
    )?;

    let difference = f64::from(&(&unrolled.log_probs - &stepped.log_probs).abs().max());
    assert!(difference < 1e-5, "difference = {}", difference);
    let attention_difference = f64::from(&(&unrolled.attention - &stepped.attention).abs().max());
    assert!(attention_difference < 1e-5);
    Ok(())
}

#[test]
fn copy_rnn_cascade_is_invariant_to_phrase_padding() -> anyhow::Result<()> {
    tch::manual_seed(42);
    let device = Device::Cpu;
    let vs = nn::VarStore::new(device);
    let decoder = CopyRnnDecoder::new(vs.root(), &test_config())?;

    let (encoder_states, mask, encoder_final, source_map) = test_batch(device);
    let encoded = EncodedSource::new(&encoder_states, &mask)?;
    let lengths = vec![vec![4i64, 3], vec![3, 4]];

    // the same two phrases per example, padded to 4 and to 6 tokens
    let short_phrases = Tensor::of_slice(&[
        1i64, 5, 6, 2, // example 0, phrase 0 (length 4)
        1, 7, 2, 0, // example 0, phrase 1 (length 3)
        1, 8, 2, 0, // example 1, phrase 0 (length 3)
        1, 4, 9, 2, // example 1, phrase 1 (length 4)
    ])
    .view((2, 2, 4));
    let long_phrases = Tensor::of_slice(&[
        1i64, 5, 6, 2, 0, 0, //
        1, 7, 2, 0, 0, 0, //
        1, 8, 2, 0, 0, 0, //
        1, 4, 9, 2, 0, 0, //
    ])
    .view((2, 2, 6));

    let short_output = decoder.decode_cascade(
        &short_phrases,
        &lengths,
        &encoded,
        Some(&source_map),
        decoder.init_state(&encoder_final, &encoder_final)?,
        &mut always_forced(),
    )?;
    let long_output = decoder.decode_cascade(
        &long_phrases,
        &lengths,
        &encoded,
        Some(&source_map),
        decoder.init_state(&encoder_final, &encoder_final)?,
        &mut always_forced(),
    )?;

    // outputs are phrase-major: rows 2..4 hold phrase 1 of both examples. The extra
    // padding of phrase 0 must not bleed into phrase 1 through the carried state.
    let short_phrase_1 = short_output.log_probs.narrow(0, 2, 2);
    let long_phrase_1 = long_output.log_probs.narrow(0, 2, 2).narrow(1, 0, 3);
    let difference = f64::from(&(&short_phrase_1 - &long_phrase_1).abs().max());
    assert!(difference < 1e-5, "difference = {}", difference);
    Ok(())
}

#[test]
fn copy_rnn_merges_copy_logits_into_extended_slots() -> anyhow::Result<()> {
    let generation_logits = Tensor::zeros(&[1, 1, 5], (Float, Device::Cpu));
    let copy_logits = Tensor::of_slice(&[2f32, 1., 3.]).view((1, 1, 3));
    let source_map = SourceMap::new(Tensor::of_slice(&[5i64, 2, 6]).view((1, 3)), vec![2]).unwrap();

    let log_probs = merge_copy_logits(&generation_logits, &copy_logits, &source_map, 5)?;

    // position 0 copies into OOV slot 5, position 1 into vocabulary slot 2,
    // position 2 into OOV slot 6
    let expected = Tensor::of_slice(&[0f32, 0., 1., 0., 0., 2., 3.]).log_softmax(-1, Float);
    for slot in 0..7 {
        let value = log_probs.double_value(&[0, 0, slot]);
        let expected_value = expected.double_value(&[slot]);
        assert!(
            (value - expected_value).abs() < 1e-6,
            "slot {}: {} vs {}",
            slot,
            value,
            expected_value
        );
    }
    Ok(())
}

#[test]
fn copy_rnn_dead_oov_slots_carry_no_mass_in_mixed_batches() -> anyhow::Result<()> {
    let generation_logits = Tensor::zeros(&[2, 1, 5], (Float, Device::Cpu));
    let copy_logits = Tensor::of_slice(&[2f32, 1., 3., 2., 1., 3.]).view((2, 1, 3));
    // example 1 only uses one OOV slot: its slot 6 must end with zero probability
    let source_map = SourceMap::new(
        Tensor::of_slice(&[5i64, 2, 6, 5, 2, 3]).view((2, 3)),
        vec![2, 1],
    )
    .unwrap();

    let log_probs = merge_copy_logits(&generation_logits, &copy_logits, &source_map, 5)?;
    assert_eq!(log_probs.size(), vec![2, 1, 7]);
    assert!(log_probs.exp().double_value(&[1, 0, 6]) < 1e-12);

    let sums = log_probs.exp().sum_dim_intlist(&[2], false, Float);
    assert!((sums.double_value(&[0, 0]) - 1.0).abs() < 1e-5);
    assert!((sums.double_value(&[1, 0]) - 1.0).abs() < 1e-5);
    Ok(())
}

#[test]
fn copy_rnn_folds_oov_mass_into_unk() -> anyhow::Result<()> {
    let generation_logits = Tensor::zeros(&[1, 1, 5], (Float, Device::Cpu));
    let copy_logits = Tensor::of_slice(&[2f32, 1., 3.]).view((1, 1, 3));
    let source_map = SourceMap::new(Tensor::of_slice(&[5i64, 2, 6]).view((1, 3)), vec![2]).unwrap();
    let log_probs = merge_copy_logits(&generation_logits, &copy_logits, &source_map, 5)?;

    let folded = fold_oov_into_unk(&log_probs, 5, 3)?;
    assert_eq!(folded.size(), vec![1, 1, 5]);

    let sum = folded.exp().sum_dim_intlist(&[2], false, Float).double_value(&[0, 0]);
    assert!((sum - 1.0).abs() < 1e-5);

    // <unk> absorbs the mass of both OOV slots
    let expected_unk = log_probs.exp().double_value(&[0, 0, 3])
        + log_probs.exp().double_value(&[0, 0, 5])
        + log_probs.exp().double_value(&[0, 0, 6]);
    assert!((folded.exp().double_value(&[0, 0, 3]) - expected_unk).abs() < 1e-6);
    Ok(())
}

#[test]
fn copy_rnn_rejects_malformed_source_map() {
    let generation_logits = Tensor::zeros(&[1, 1, 5], (Float, Device::Cpu));
    let copy_logits = Tensor::of_slice(&[2f32, 1., 3.]).view((1, 1, 3));
    // slot 6 does not exist when the batch-wide maximum OOV count is 1
    let source_map = SourceMap::new(Tensor::of_slice(&[5i64, 2, 6]).view((1, 3)), vec![1]).unwrap();

    match merge_copy_logits(&generation_logits, &copy_logits, &source_map, 5) {
        Err(CopyRnnError::IndexOutOfRange(_)) => {}
        other => panic!("expected IndexOutOfRange, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn copy_rnn_rejects_inconsistent_batches_and_configurations() -> anyhow::Result<()> {
    tch::manual_seed(42);
    let device = Device::Cpu;

    let mut config = test_config();
    config.copy_attention = false;
    config.copy_input_feeding = true;
    let vs = nn::VarStore::new(device);
    match CopyRnnDecoder::new(vs.root(), &config) {
        Err(CopyRnnError::InvalidConfigurationError(_)) => {}
        other => panic!(
            "expected InvalidConfigurationError, got {:?}",
            other.map(|_| ())
        ),
    }

    let vs = nn::VarStore::new(device);
    let decoder = CopyRnnDecoder::new(vs.root(), &test_config())?;
    let (encoder_states, mask, encoder_final, _) = test_batch(device);
    let encoded = EncodedSource::new(&encoder_states, &mask)?;
    let state = decoder.init_state(&encoder_final, &encoder_final)?;
    let targets = Tensor::of_slice(&[1i64, 5, 6, 2, 1, 7, 3, 2]).view((2, 4));

    // source map narrower than the encoded source
    let narrow_map = SourceMap::new(Tensor::of_slice(&[10i64, 2, 10, 4]).view((2, 2)), vec![1, 1])?;
    match decoder.forward(&targets, &encoded, Some(&narrow_map), state) {
        Err(CopyRnnError::InvalidBatch(_)) => {}
        other => panic!("expected InvalidBatch, got {:?}", other.map(|_| ())),
    }

    // an all-padding example must be rejected before any computation
    let dead_mask = Tensor::of_slice(&[1f32, 1., 1., 0., 0., 0.]).view((2, 3));
    let encoded = EncodedSource::new(&encoder_states, &dead_mask)?;
    let (_, _, _, source_map) = test_batch(device);
    let state = decoder.init_state(&encoder_final, &encoder_final)?;
    match decoder.forward(&targets, &encoded, Some(&source_map), state) {
        Err(CopyRnnError::InvalidBatch(_)) => {}
        other => panic!("expected InvalidBatch, got {:?}", other.map(|_| ())),
    }
    Ok(())
}

#[test]
fn copy_rnn_input_feeding_decodes_step_by_step() -> anyhow::Result<()> {
    tch::manual_seed(42);
    let device = Device::Cpu;
    let mut config = test_config();
    config.input_feeding = true;
    config.copy_input_feeding = true;
    let vs = nn::VarStore::new(device);
    let decoder = CopyRnnDecoder::new(vs.root(), &config)?;

    let (encoder_states, mask, encoder_final, source_map) = test_batch(device);
    let encoded = EncodedSource::new(&encoder_states, &mask)?;
    let targets = Tensor::of_slice(&[1i64, 5, 6, 2, 1, 7, 3, 2]).view((2, 4));

    // the unrolled driver cannot honor feedback
    match decoder.forward(
        &targets,
        &encoded,
        Some(&source_map),
        decoder.init_state(&encoder_final, &encoder_final)?,
    ) {
        Err(CopyRnnError::InvalidConfigurationError(_)) => {}
        other => panic!(
            "expected InvalidConfigurationError, got {:?}",
            other.map(|_| ())
        ),
    }

    // the dispatching driver falls back to the step loop
    let mut sampler = always_forced();
    let output = decoder.decode(
        &targets,
        &encoded,
        Some(&source_map),
        decoder.init_state(&encoder_final, &encoder_final)?,
        &mut sampler,
    )?;
    assert_eq!(output.log_probs.size(), vec![2, 3, 12]);
    let sums = output.log_probs.exp().sum_dim_intlist(&[2], false, Float);
    assert!((sums.double_value(&[0, 0]) - 1.0).abs() < 1e-4);
    Ok(())
}

#[test]
fn copy_rnn_generates_step_by_step_for_beam_search() -> anyhow::Result<()> {
    tch::manual_seed(42);
    let device = Device::Cpu;
    let vs = nn::VarStore::new(device);
    let decoder = CopyRnnDecoder::new(vs.root(), &test_config())?;

    let (encoder_states, mask, encoder_final, source_map) = test_batch(device);
    let encoded = EncodedSource::new(&encoder_states, &mask)?;
    let state = decoder.init_state(&encoder_final, &encoder_final)?;

    let prev_tokens = Tensor::of_slice(&[1i64, 1]).view((2, 1));
    let step = decoder.generate_step(&prev_tokens, state, &encoded, Some(&source_map), None)?;
    assert_eq!(step.log_probs.size(), vec![2, 1, 12]);
    assert_eq!(step.state.batch_size(), 2);
    assert_eq!(step.attention.size(), vec![2, 1, 3]);

    // realign the state after (mock) beam pruning: both slots continue hypothesis 0
    let reordered = step
        .state
        .reorder(&Tensor::of_slice(&[0i64, 0]).to_device(device));
    assert_eq!(reordered.batch_size(), 2);
    let hidden_difference = f64::from(
        &(&reordered.hidden.select(1, 0) - &reordered.hidden.select(1, 1))
            .abs()
            .max(),
    );
    assert!(hidden_difference < 1e-12);
    Ok(())
}

#[test]
fn copy_rnn_greedy_rollout_reports_extended_ids_and_scores() -> anyhow::Result<()> {
    tch::manual_seed(42);
    let device = Device::Cpu;
    let vs = nn::VarStore::new(device);
    let decoder = CopyRnnDecoder::new(vs.root(), &test_config())?;

    let (encoder_states, mask, encoder_final, source_map) = test_batch(device);
    let encoded = EncodedSource::new(&encoder_states, &mask)?;
    let state = decoder.init_state(&encoder_final, &encoder_final)?;

    let start_tokens = Tensor::of_slice(&[1i64, 1]).view((2, 1));
    let output =
        decoder.generate_greedy(&start_tokens, state, &encoded, Some(&source_map), 4)?;

    assert_eq!(output.token_ids.size(), vec![2, 4]);
    assert_eq!(output.token_ids.kind(), Int64);
    assert_eq!(output.scores.size(), vec![2, 4]);
    assert_eq!(output.log_probs.size(), vec![2, 4, 12]);

    // ids live in the extended vocabulary, scores are cumulative log-probabilities
    let max_id = i64::from(&output.token_ids.max());
    assert!(max_id < 12);
    for example in 0..2 {
        let mut previous = 0.0;
        for step in 0..4 {
            let score = output.scores.double_value(&[example, step]);
            assert!(score <= previous + 1e-6);
            previous = score;
        }
    }
    Ok(())
}
