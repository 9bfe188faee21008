use anyhow::Result;
use attention::KeyValueCache;
use candle_core::{DType, Device, Tensor};
use model::{generate, CacheMode, DenseWeights, GenerationConfig, Model, ModelConfig, ModelError};

fn tiny_config() -> ModelConfig {
    serde_json::from_str(
        r#"{
            "vocab_size": 32,
            "hidden_size": 16,
            "intermediate_size": 24,
            "num_hidden_layers": 2,
            "num_attention_heads": 2,
            "max_position_embeddings": 64,
            "rms_norm_eps": 1e-6
        }"#,
    )
    .unwrap()
}

fn tiny_model() -> Result<Model> {
    let config = tiny_config();
    let weights = DenseWeights::random(&config, 0.3, DType::F32, &Device::Cpu)?;
    Ok(Model::load(config, &weights)?)
}

fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()?)
}

fn prompt(device: &Device) -> Result<Tensor> {
    Ok(Tensor::new(&[[3u32, 7, 1, 12, 5], [9, 2, 2, 30, 4]], device)?)
}

#[test]
fn forward_produces_logits() -> Result<()> {
    let model = tiny_model()?;
    let ids = prompt(&Device::Cpu)?;
    let output = model.forward(&ids, None, None, None, CacheMode::None, None)?;
    assert_eq!(output.logits.dims(), &[2, 5, 32]);
    assert_eq!(output.logits.dtype(), DType::F32);
    assert!(output.present.is_none());
    assert!(output.attentions.is_empty());
    Ok(())
}

#[test]
fn cached_steps_match_full_recompute() -> Result<()> {
    let model = tiny_model()?;
    let ids = prompt(&Device::Cpu)?;
    let full = model.forward(&ids, None, None, None, CacheMode::None, None)?.logits;

    let prefill = model.forward(&ids.narrow(1, 0, 3)?, None, None, None, CacheMode::Full, None)?;
    assert_eq!(prefill.attentions.len(), 2);
    let mut past = prefill.present;
    let mut pieces = vec![prefill.logits];
    for position in 3..5 {
        let step = model.forward(&ids.narrow(1, position, 1)?, None, None, past.take(), CacheMode::Full, None)?;
        pieces.push(step.logits);
        past = step.present;
    }
    let stepped = Tensor::cat(&pieces, 1)?;
    assert!(max_diff(&full, &stepped)? < 1e-4);

    let caches = past.expect("full mode returns caches");
    assert_eq!(caches.len(), 2);
    assert!(caches.iter().all(|cache| cache.seq_len() == 5));
    Ok(())
}

#[test]
fn padded_attention_mask_matches_unpadded_prefix() -> Result<()> {
    let model = tiny_model()?;
    let device = Device::Cpu;
    let ids = Tensor::new(&[[3u32, 7, 1, 0]], &device)?;
    let mask = Tensor::new(&[[1u32, 1, 1, 0]], &device)?;
    let padded = model.forward(&ids, Some(&mask), None, None, CacheMode::Full, None)?;
    let plain = model.forward(&ids.narrow(1, 0, 3)?, None, None, None, CacheMode::Full, None)?;
    let diff = max_diff(&padded.logits.narrow(1, 0, 3)?, &plain.logits)?;
    assert!(diff < 1e-4);
    Ok(())
}

#[test]
fn wide_sliding_window_matches_full_cache() -> Result<()> {
    let model = tiny_model()?;
    let ids = prompt(&Device::Cpu)?;
    let window = CacheMode::SlidingWindow { cutoff: 32 };
    let (mut full_past, mut window_past) = (None, None);
    for (start, len) in [(0, 2), (2, 1), (3, 1), (4, 1)] {
        let chunk = ids.narrow(1, start, len)?;
        let a = model.forward(&chunk, None, None, full_past.take(), CacheMode::Full, None)?;
        let b = model.forward(&chunk, None, None, window_past.take(), window, None)?;
        assert!(max_diff(&a.logits, &b.logits)? < 1e-4);
        full_past = a.present;
        window_past = b.present;
    }
    Ok(())
}

#[test]
fn sliding_window_prefill_is_causal() -> Result<()> {
    let model = tiny_model()?;
    let device = Device::Cpu;
    let ids = prompt(&device)?;
    let window = CacheMode::SlidingWindow { cutoff: 2 };
    let full = model.forward(&ids, None, None, None, CacheMode::None, None)?.logits;
    let windowed = model.forward(&ids, None, None, None, window, None)?.logits;
    assert!(max_diff(&full, &windowed)? < 1e-4);

    let padded_ids = Tensor::new(&[[3u32, 7, 1, 0]], &device)?;
    let mask = Tensor::new(&[[1u32, 1, 1, 0]], &device)?;
    let padded = model.forward(&padded_ids, Some(&mask), None, None, window, None)?;
    let plain = model.forward(&padded_ids.narrow(1, 0, 3)?, None, None, None, CacheMode::None, None)?;
    assert!(max_diff(&padded.logits.narrow(1, 0, 3)?, &plain.logits)? < 1e-4);
    Ok(())
}

#[test]
fn empty_prompt_is_rejected() -> Result<()> {
    let mut model = tiny_model()?;
    let ids = Tensor::zeros((1, 0), DType::U32, &Device::Cpu)?;
    let err = generate(&mut model, &ids, &GenerationConfig::default()).unwrap_err();
    assert!(matches!(err, ModelError::Input(_)));
    assert!(err.to_string().contains("at least one token"));
    Ok(())
}

#[test]
fn greedy_cached_decode_reproduces_recompute() -> Result<()> {
    let mut model = tiny_model()?;
    let ids = prompt(&Device::Cpu)?;
    let mut config = GenerationConfig {
        max_new_tokens: 6,
        ..GenerationConfig::default()
    };
    let cached = generate(&mut model, &ids, &config)?;
    config.cache_mode = CacheMode::None;
    let recomputed = generate(&mut model, &ids, &config)?;
    assert_eq!(cached.sequences, recomputed.sequences);
    assert_eq!(cached.sequences[0].len(), 11);
    assert_eq!(cached.token_latencies.len(), 6);
    Ok(())
}

#[test]
fn beam_search_with_cache_matches_recompute() -> Result<()> {
    let mut model = tiny_model()?;
    let ids = prompt(&Device::Cpu)?;
    let mut config = GenerationConfig {
        max_new_tokens: 4,
        num_beams: 3,
        cache_mode: CacheMode::Full,
    };
    let cached = generate(&mut model, &ids, &config)?;
    config.cache_mode = CacheMode::None;
    let recomputed = generate(&mut model, &ids, &config)?;
    assert_eq!(cached.sequences, recomputed.sequences);
    assert_eq!(model.executor_config().beam_width, 3);
    Ok(())
}

#[test]
fn generation_past_capacity_is_an_error() -> Result<()> {
    let model = tiny_model()?;
    let ids = prompt(&Device::Cpu)?;
    let mut model = model;
    model.configure_cache(1, 4);
    let err = model.forward(&ids, None, None, None, CacheMode::Full, None).unwrap_err();
    assert!(err.to_string().contains("text_max_length"));
    Ok(())
}

#[test]
fn tied_embeddings_need_no_lm_head() -> Result<()> {
    let mut config = tiny_config();
    config.tie_word_embeddings = true;
    let weights = DenseWeights::random(&config, 0.3, DType::F32, &Device::Cpu)?;
    let model = Model::load(config, &weights)?;
    let output = model.forward(&prompt(&Device::Cpu)?, None, None, None, CacheMode::None, None)?;
    assert_eq!(output.logits.dims(), &[2, 5, 32]);
    Ok(())
}
