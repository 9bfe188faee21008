use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use cascade_inference::{
    prelude::*,
    quantization::{artifact, config::QuantMode, weight_only},
    setup_device,
};

fn tiny_config() -> ModelConfig {
    serde_json::from_str(
        r#"{
            "vocab_size": 40,
            "hidden_size": 16,
            "intermediate_size": 32,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "max_position_embeddings": 48,
            "variance_epsilon": 1e-5
        }"#,
    )
    .unwrap()
}

fn quantized_model(device: &Device) -> Result<Model> {
    let config = tiny_config();
    let weights = DenseWeights::random(&config, 0.3, DType::F32, device)?;
    let mut model = Model::load(config, &weights)?;
    weight_only::quantize(&mut model, QuantDType::Int4, Some(8), LowpMode::Fp32)?;
    Ok(model)
}

fn prompts(device: &Device) -> Result<Tensor> {
    Ok(Tensor::new(&[[4u32, 11, 2, 38], [7, 7, 19, 1]], device)?)
}

#[test]
fn device_is_cpu() {
    assert!(setup_device().is_cpu());
}

#[test]
fn quantized_greedy_decode_matches_recompute() -> Result<()> {
    let device = setup_device();
    let mut model = quantized_model(&device)?;
    let ids = prompts(&device)?;

    let cached = generate(
        &mut model,
        &ids,
        &GenerationConfig {
            max_new_tokens: 6,
            num_beams: 1,
            cache_mode: CacheMode::Full,
        },
    )?;
    let recomputed = generate(
        &mut model,
        &ids,
        &GenerationConfig {
            max_new_tokens: 6,
            num_beams: 1,
            cache_mode: CacheMode::None,
        },
    )?;
    assert_eq!(cached.sequences, recomputed.sequences);
    assert_eq!(cached.sequences[0].len(), 10);
    assert_eq!(cached.token_latencies.len(), 6);
    Ok(())
}

#[test]
fn wide_sliding_window_matches_full_cache_with_beams() -> Result<()> {
    let device = setup_device();
    let mut model = quantized_model(&device)?;
    let ids = prompts(&device)?;
    let config = |cache_mode| GenerationConfig {
        max_new_tokens: 5,
        num_beams: 3,
        cache_mode,
    };
    let full = generate(&mut model, &ids, &config(CacheMode::Full))?;
    let window = generate(
        &mut model,
        &ids,
        &config(CacheMode::SlidingWindow { cutoff: 32 }),
    )?;
    assert_eq!(full.sequences, window.sequences);
    Ok(())
}

#[test]
fn frozen_artifact_decodes_like_the_live_model() -> Result<()> {
    let device = setup_device();
    let mut live = quantized_model(&device)?;
    let recipe = QuantRecipe {
        mode: QuantMode::WeightOnly,
        weight_dtype: QuantDType::Int4,
        lowp_mode: Some(LowpMode::Fp32),
        alpha: None,
        group_size: Some(8),
        from_checkpoint: false,
    };
    let dir = tempfile::tempdir()?;
    let path = artifact::save(&live, &recipe, dir.path())?;
    let mut loaded = artifact::load(&path, &device)?;
    assert_eq!(loaded.manifest.model_config, tiny_config());

    let generation = GenerationConfig {
        max_new_tokens: 4,
        num_beams: 2,
        cache_mode: CacheMode::Full,
    };
    let ids = prompts(&device)?;
    let expected = generate(&mut live, &ids, &generation)?;
    let actual = generate(&mut loaded.model, &ids, &generation)?;
    assert_eq!(expected.sequences, actual.sequences);
    Ok(())
}
