pub mod acoustic;
pub mod causal_lm;
pub mod speech_encoder;

pub use acoustic::{AcousticConfig, AcousticWrapper};
pub use causal_lm::{CausalLmConfig, CausalLmWrapper};
pub use speech_encoder::{SpeechEncoderConfig, SpeechEncoderWrapper};

use crate::core::{Capability, ExportError, ModelDescriptor, TraceableWrapper};
use candle_core::Tensor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    CausalLm,
    TextToSpeech,
    SpeechEncoder,
}

impl ModelFamily {
    pub fn processor_file(&self) -> &'static str {
        match self {
            ModelFamily::CausalLm => "tokenizer.json",
            ModelFamily::TextToSpeech | ModelFamily::SpeechEncoder => "preprocessor_config.json",
        }
    }

    pub fn wrap(
        &self,
        model: &LoadedModel,
        capability: Capability,
    ) -> Result<Box<dyn TraceableWrapper>, ExportError> {
        Ok(match self {
            ModelFamily::CausalLm => Box::new(CausalLmWrapper::new(model, capability)?),
            ModelFamily::TextToSpeech => Box::new(AcousticWrapper::new(model, capability)?),
            ModelFamily::SpeechEncoder => Box::new(SpeechEncoderWrapper::new(model, capability)?),
        })
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelFamily::CausalLm => "causal-lm",
            ModelFamily::TextToSpeech => "text-to-speech",
            ModelFamily::SpeechEncoder => "speech-encoder",
        };
        f.write_str(name)
    }
}

pub enum Processor {
    Tokenizer(Box<tokenizers::Tokenizer>),
    Config(serde_json::Value),
}

impl Processor {
    pub fn vocab_size(&self) -> Option<usize> {
        match self {
            Processor::Tokenizer(tokenizer) => Some(tokenizer.get_vocab_size(true)),
            Processor::Config(_) => None,
        }
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Processor::Tokenizer(tokenizer) => f
                .debug_struct("Tokenizer")
                .field("vocab_size", &tokenizer.get_vocab_size(true))
                .finish(),
            Processor::Config(config) => f.debug_tuple("Config").field(config).finish(),
        }
    }
}

/// Weights, config and processor of one model, held in memory for the
/// duration of a job.
#[derive(Debug)]
pub struct LoadedModel {
    pub descriptor: ModelDescriptor,
    pub config: serde_json::Value,
    pub processor: Processor,
    pub weights: HashMap<String, Tensor>,
}

impl LoadedModel {
    pub fn architecture(&self) -> Option<&str> {
        self.config
            .get("architectures")
            .and_then(|a| a.get(0))
            .and_then(|a| a.as_str())
    }

    pub fn parse_config<T: DeserializeOwned>(&self) -> Result<T, ExportError> {
        serde_json::from_value(self.config.clone()).map_err(|e| ExportError::Load {
            model: self.descriptor.id(),
            reason: format!("config.json: {}", e),
        })
    }

    pub fn has_weight_prefix(&self, prefix: &str) -> bool {
        self.weights.keys().any(|name| name.starts_with(prefix))
    }

    pub fn weights_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Tensor)> + 'a {
        self.weights
            .iter()
            .filter(move |(name, _)| name.starts_with(prefix))
    }

    /// Fails unless `name` is present with exactly the dims `config.json`
    /// implies for it.
    pub fn check_weight_shape(&self, name: &str, expected: &[usize]) -> Result<(), ExportError> {
        let tensor = self.weights.get(name).ok_or_else(|| {
            ExportError::shape_mismatch(
                name,
                format!("missing from the checkpoint, config.json implies {:?}", expected),
            )
        })?;
        if tensor.dims() != expected {
            return Err(ExportError::shape_mismatch(
                name,
                format!(
                    "checkpoint holds {:?} but config.json implies {:?}",
                    tensor.dims(),
                    expected
                ),
            ));
        }
        Ok(())
    }

    pub fn parameter_count(&self) -> usize {
        self.weights.values().map(|t| t.elem_count()).sum()
    }
}

/// A loaded model together with the descriptor that produced it.
#[derive(Debug)]
pub struct ResolvedModel {
    pub model: LoadedModel,
    pub fell_back: bool,
}

impl ResolvedModel {
    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.model.descriptor
    }
}

#[derive(Debug, Error)]
pub enum LoadFailure {
    #[error("access denied (HTTP {status})")]
    AccessDenied { status: u16 },
    #[error(transparent)]
    Unavailable(#[from] anyhow::Error),
}

pub trait ModelSource {
    fn load(
        &self,
        descriptor: &ModelDescriptor,
        family: ModelFamily,
    ) -> Result<LoadedModel, LoadFailure>;
}

fn unsupported(family: ModelFamily, capability: Capability) -> ExportError {
    ExportError::UnsupportedCapability {
        family: family.to_string(),
        capability,
    }
}
