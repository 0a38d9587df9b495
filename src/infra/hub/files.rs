use crate::core::{ModelDescriptor, Precision};
use crate::models::{LoadedModel, ModelFamily, Processor};
use anyhow::{anyhow, bail, Context, Result};
use candle_core::{Device, Tensor};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CONFIG_FILE: &str = "config.json";
pub const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

#[derive(Debug, Deserialize)]
struct WeightsIndex {
    weight_map: HashMap<String, String>,
}

/// Shard file names listed by a `model.safetensors.index.json`, sorted.
pub fn shards_from_index(index: &str) -> Result<Vec<String>> {
    let index: WeightsIndex =
        serde_json::from_str(index).context("Failed to parse safetensors index")?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    if shards.is_empty() {
        bail!("Safetensors index lists no shards");
    }
    Ok(shards.into_iter().collect())
}

/// Local paths of everything needed to load one model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub processor: PathBuf,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Files of a model laid out in `dir` the way the hub stores them.
    pub fn in_dir(dir: &Path, family: ModelFamily) -> Result<Self> {
        if !dir.is_dir() {
            bail!("Model directory not found: {}", dir.display());
        }

        let single = dir.join(SINGLE_WEIGHTS_FILE);
        let weights = if single.exists() {
            vec![single]
        } else {
            let index_path = dir.join(WEIGHTS_INDEX_FILE);
            let index = std::fs::read_to_string(&index_path).with_context(|| {
                format!("No safetensors weights in {}", dir.display())
            })?;
            shards_from_index(&index)?
                .into_iter()
                .map(|shard| dir.join(shard))
                .collect()
        };

        Ok(Self {
            config: dir.join(CONFIG_FILE),
            processor: dir.join(family.processor_file()),
            weights,
        })
    }

    pub fn load(
        &self,
        descriptor: &ModelDescriptor,
        family: ModelFamily,
    ) -> Result<LoadedModel> {
        let config_text = std::fs::read_to_string(&self.config)
            .with_context(|| format!("Failed to read {}", self.config.display()))?;
        let config: serde_json::Value = serde_json::from_str(&config_text)
            .with_context(|| format!("Failed to parse {}", self.config.display()))?;

        let processor = load_processor(&self.processor, family)?;

        let mut weights = HashMap::new();
        for path in &self.weights {
            debug!("Loading weights from {}", path.display());
            let tensors = candle_core::safetensors::load(path, &Device::Cpu)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            for (name, tensor) in tensors {
                weights.insert(name, cast(tensor, descriptor.precision)?);
            }
        }
        if weights.is_empty() {
            bail!("No tensors found for {}", descriptor.id());
        }

        let model = LoadedModel {
            descriptor: descriptor.clone(),
            config,
            processor,
            weights,
        };
        info!(
            "Loaded {} ({}): {} tensors, {} parameters",
            descriptor,
            model.architecture().unwrap_or("unknown architecture"),
            model.weights.len(),
            model.parameter_count()
        );
        Ok(model)
    }
}

fn load_processor(path: &Path, family: ModelFamily) -> Result<Processor> {
    match family {
        ModelFamily::CausalLm => {
            let tokenizer = tokenizers::Tokenizer::from_file(path)
                .map_err(|e| anyhow!("Failed to load tokenizer {}: {}", path.display(), e))?;
            Ok(Processor::Tokenizer(Box::new(tokenizer)))
        }
        ModelFamily::TextToSpeech | ModelFamily::SpeechEncoder => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config = serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(Processor::Config(config))
        }
    }
}

/// Floating-point weights take the load precision; integer buffers keep
/// their dtype.
fn cast(tensor: Tensor, precision: Precision) -> Result<Tensor> {
    if tensor.dtype().is_float() && tensor.dtype() != precision.to_candle() {
        Ok(tensor.to_dtype(precision.to_candle())?)
    } else {
        Ok(tensor)
    }
}
