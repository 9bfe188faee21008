//! Frozen quantized model stored as one safetensors file.
//!
//! Tensors hold the dense parameters and, per projection, either its float
//! weight or its packed payload (`qweight`, `scales`, `qzeros`, plus
//! `smoothing` for smooth-quant). The header metadata key `manifest` holds a
//! JSON [`ArtifactManifest`]: model config, recipe, execution plan and the
//! recipe fingerprint. Loading rebuilds each projection with the recorded
//! kernel; calibration is never re-run.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use candle_core::{DType, Device, Tensor};
use layers::{
    Linear, LinearConfig, LinearKernel, LinearLayer, LowpMode, QScheme, QuantDType,
    QuantizationConfig, QuantizedTensor,
};
use model::{weights::quantizable_linears, Model, ModelConfig, ModelError, ModelResult, WeightSource};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};

use crate::{
    checkpoint::{QWEIGHT_SUFFIX, QZEROS_SUFFIX, SCALES_SUFFIX},
    error::{QuantizationError, QuantizationResult},
    recipe::QuantRecipe,
};

pub const ARTIFACT_VERSION: u32 = 1;
pub const ARTIFACT_FILENAME: &str = "best_model.safetensors";
pub const MANIFEST_KEY: &str = "manifest";
const SMOOTHING_SUFFIX: &str = "smoothing";

/// Kernel recorded for one projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kernel", rename_all = "snake_case")]
pub enum KernelPlan {
    Dense,
    WeightOnly {
        dtype: QuantDType,
        scheme: QScheme,
        lowp: LowpMode,
    },
    SmoothQuant {
        scheme: QScheme,
        input_scale: f32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearPlan {
    pub name: String,
    pub in_dim: usize,
    pub out_dim: usize,
    pub bias: bool,
    pub kernel: KernelPlan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub version: u32,
    pub model_config: ModelConfig,
    pub recipe: QuantRecipe,
    pub plan: Vec<LinearPlan>,
    pub recipe_sha256: String,
}

impl ArtifactManifest {
    /// Checks version, fingerprint and that the plan covers exactly the
    /// projections of the recorded model config.
    pub fn verify(&self) -> QuantizationResult<()> {
        if self.version != ARTIFACT_VERSION {
            return Err(QuantizationError::artifact(format!(
                "unsupported artifact version {} (expected {})",
                self.version, ARTIFACT_VERSION
            )));
        }
        let actual = self.recipe.fingerprint()?;
        if actual != self.recipe_sha256 {
            return Err(QuantizationError::artifact(
                "recipe fingerprint does not match the manifest",
            ));
        }
        let expected: HashSet<String> = quantizable_linears(&self.model_config)
            .into_iter()
            .map(|(name, _, _)| name)
            .collect();
        let recorded: HashSet<String> = self.plan.iter().map(|entry| entry.name.clone()).collect();
        if expected != recorded || recorded.len() != self.plan.len() {
            return Err(QuantizationError::artifact(format!(
                "execution plan lists {} projections, the model has {}",
                self.plan.len(),
                expected.len()
            )));
        }
        Ok(())
    }
}

/// A loaded artifact: the rebuilt model and the manifest it came from.
#[derive(Debug)]
pub struct LoadedArtifact {
    pub manifest: ArtifactManifest,
    pub model: Model,
}

/// Writes `model` to `output_dir/best_model.safetensors`.
pub fn save(model: &Model, recipe: &QuantRecipe, output_dir: &Path) -> QuantizationResult<PathBuf> {
    fs::create_dir_all(output_dir)?;
    let mut tensors: Vec<(String, Tensor)> = model.dense_parameters()?;
    let mut plan = Vec::new();
    for (name, layer) in model.linears() {
        let config = layer.config();
        if let Some(bias) = layer.bias() {
            tensors.push((field(&name, "bias"), bias.clone()));
        }
        let kernel = match layer.kernel() {
            LinearKernel::Dense { weight } => {
                tensors.push((field(&name, "weight"), weight.clone()));
                KernelPlan::Dense
            }
            LinearKernel::WeightOnly { weight, lowp, .. } => {
                push_quantized(&mut tensors, &name, weight)?;
                KernelPlan::WeightOnly {
                    dtype: weight.config().dtype(),
                    scheme: weight.config().scheme(),
                    lowp: *lowp,
                }
            }
            LinearKernel::SmoothQuant {
                weight,
                smoothing,
                input_scale,
            } => {
                push_quantized(&mut tensors, &name, weight)?;
                tensors.push((field(&name, SMOOTHING_SUFFIX), smoothing.clone()));
                KernelPlan::SmoothQuant {
                    scheme: weight.config().scheme(),
                    input_scale: *input_scale,
                }
            }
        };
        plan.push(LinearPlan {
            name,
            in_dim: config.input_dim,
            out_dim: config.output_dim,
            bias: layer.bias().is_some(),
            kernel,
        });
    }

    let manifest = ArtifactManifest {
        version: ARTIFACT_VERSION,
        model_config: model.config().clone(),
        recipe: recipe.clone(),
        plan,
        recipe_sha256: recipe.fingerprint()?,
    };
    let metadata = HashMap::from([(MANIFEST_KEY.to_string(), serde_json::to_string(&manifest)?)]);
    let tensors = tensors
        .into_iter()
        .map(|(name, tensor)| Ok((name, tensor.contiguous()?)))
        .collect::<QuantizationResult<Vec<_>>>()?;

    let path = output_dir.join(ARTIFACT_FILENAME);
    safetensors::serialize_to_file(
        tensors.iter().map(|(name, tensor)| (name.as_str(), tensor)),
        &Some(metadata),
        &path,
    )?;
    log::info!(
        "artifact: {} tensors, {} projections ({}) -> {}",
        tensors.len(),
        manifest.plan.len(),
        manifest.recipe,
        path.display()
    );
    Ok(path)
}

/// Reads only the manifest of an artifact.
pub fn read_manifest(path: impl AsRef<Path>) -> QuantizationResult<ArtifactManifest> {
    let bytes = fs::read(path.as_ref())?;
    manifest_from_bytes(&bytes)
}

/// Loads and verifies an artifact and rebuilds its model on `device`.
pub fn load(path: impl AsRef<Path>, device: &Device) -> QuantizationResult<LoadedArtifact> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let manifest = manifest_from_bytes(&bytes)?;
    manifest.verify()?;
    let tensors = candle_core::safetensors::load_buffer(&bytes, device)?;
    let weights = ArtifactWeights::new(tensors, &manifest.plan, device);
    let model = Model::load(manifest.model_config.clone(), &weights)?;
    log::info!(
        "artifact: loaded {} ({}) from {}",
        manifest.recipe_sha256.get(..12).unwrap_or(&manifest.recipe_sha256),
        manifest.recipe,
        path.display()
    );
    Ok(LoadedArtifact { manifest, model })
}

fn manifest_from_bytes(bytes: &[u8]) -> QuantizationResult<ArtifactManifest> {
    let (_, metadata) = SafeTensors::read_metadata(bytes)?;
    let json = metadata
        .metadata()
        .as_ref()
        .and_then(|entries| entries.get(MANIFEST_KEY))
        .ok_or_else(|| QuantizationError::artifact("header carries no manifest"))?;
    serde_json::from_str(json)
        .map_err(|err| QuantizationError::artifact(format!("malformed manifest: {err}")))
}

fn push_quantized(
    tensors: &mut Vec<(String, Tensor)>,
    name: &str,
    weight: &QuantizedTensor,
) -> QuantizationResult<()> {
    let config = weight.config();
    let count = config.scales().len();
    let zeros: Vec<i64> = config.zero_points().iter().map(|z| *z as i64).collect();
    tensors.push((field(name, QWEIGHT_SUFFIX), weight.packed_tensor(&Device::Cpu)?));
    tensors.push((
        field(name, SCALES_SUFFIX),
        Tensor::from_slice(config.scales(), count, &Device::Cpu)?,
    ));
    tensors.push((field(name, QZEROS_SUFFIX), Tensor::from_vec(zeros, count, &Device::Cpu)?));
    Ok(())
}

fn field(name: &str, suffix: &str) -> String {
    format!("{name}.{suffix}")
}

/// [`WeightSource`] over artifact tensors that builds every projection with
/// the kernel named in the execution plan.
#[derive(Debug)]
pub struct ArtifactWeights {
    tensors: HashMap<String, Tensor>,
    plan: HashMap<String, LinearPlan>,
    device: Device,
}

impl ArtifactWeights {
    pub fn new(tensors: HashMap<String, Tensor>, plan: &[LinearPlan], device: &Device) -> Self {
        Self {
            tensors,
            plan: plan
                .iter()
                .map(|entry| (entry.name.clone(), entry.clone()))
                .collect(),
            device: device.clone(),
        }
    }

    fn quantized(
        &self,
        entry: &LinearPlan,
        dtype: QuantDType,
        scheme: QScheme,
    ) -> ModelResult<QuantizedTensor> {
        let name = &entry.name;
        let bytes = self
            .tensor(&field(name, QWEIGHT_SUFFIX))?
            .flatten_all()?
            .to_vec1::<u8>()?;
        let values = QuantizedTensor::unpack(dtype, &bytes, entry.out_dim, entry.in_dim)?;
        let scales = self
            .tensor(&field(name, SCALES_SUFFIX))?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        let zeros = self
            .tensor(&field(name, QZEROS_SUFFIX))?
            .to_dtype(DType::I64)?
            .to_vec1::<i64>()?
            .into_iter()
            .map(|z| z as i32)
            .collect();
        let config = QuantizationConfig::new(dtype, scheme, scales, zeros)?;
        Ok(QuantizedTensor::from_parts(
            config,
            entry.out_dim,
            entry.in_dim,
            values,
        )?)
    }

    fn bias(&self, entry: &LinearPlan) -> ModelResult<Option<Tensor>> {
        if entry.bias {
            Ok(Some(self.tensor(&field(&entry.name, "bias"))?))
        } else {
            Ok(None)
        }
    }
}

impl WeightSource for ArtifactWeights {
    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    fn tensor(&self, name: &str) -> ModelResult<Tensor> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| ModelError::MissingWeight(name.to_string()))
    }

    fn linear(&self, name: &str, in_dim: usize, out_dim: usize) -> ModelResult<Linear> {
        let Some(entry) = self.plan.get(name) else {
            // Projections outside the plan (the lm head) are stored dense.
            let weight = self.tensor(&field(name, "weight"))?;
            let bias_name = field(name, "bias");
            let bias = if self.contains(&bias_name) {
                Some(self.tensor(&bias_name)?)
            } else {
                None
            };
            let config = LinearConfig::new(in_dim, out_dim).with_bias(bias.is_some());
            return Ok(Linear::new(config, weight, bias)?);
        };
        if (entry.in_dim, entry.out_dim) != (in_dim, out_dim) {
            return Err(ModelError::Config(format!(
                "{name}: plan records [{} -> {}], model expects [{in_dim} -> {out_dim}]",
                entry.in_dim, entry.out_dim
            )));
        }
        let bias = self.bias(entry)?;
        let config = LinearConfig::new(in_dim, out_dim).with_bias(entry.bias);
        let linear = match &entry.kernel {
            KernelPlan::Dense => Linear::new(config, self.tensor(&field(name, "weight"))?, bias)?,
            KernelPlan::WeightOnly { dtype, scheme, lowp } => {
                let weight = self.quantized(entry, *dtype, *scheme)?;
                Linear::weight_only(config, weight, bias, *lowp, &self.device)?
            }
            KernelPlan::SmoothQuant {
                scheme,
                input_scale,
            } => {
                let weight = self.quantized(entry, QuantDType::Int8, *scheme)?;
                let smoothing = self.tensor(&field(name, SMOOTHING_SUFFIX))?;
                Linear::smooth_quant(config, weight, smoothing, *input_scale, bias)?
            }
        };
        Ok(linear)
    }
}
