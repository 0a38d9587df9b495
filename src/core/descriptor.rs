use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelLocation {
    Hub(String),
    Local(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    F16,
    BF16,
}

impl Precision {
    pub fn to_candle(self) -> candle_core::DType {
        match self {
            Precision::F32 => candle_core::DType::F32,
            Precision::F16 => candle_core::DType::F16,
            Precision::BF16 => candle_core::DType::BF16,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Precision::F32 => "float32",
            Precision::F16 => "float16",
            Precision::BF16 => "bfloat16",
        };
        f.write_str(name)
    }
}

/// Identity of a model to convert. Never mutated after construction; the
/// resolver hands out the descriptor that was actually loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub location: ModelLocation,
    pub precision: Precision,
    pub gated: bool,
}

impl ModelDescriptor {
    pub fn hub(repo_id: impl Into<String>) -> Self {
        Self {
            location: ModelLocation::Hub(repo_id.into()),
            precision: Precision::F32,
            gated: false,
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            location: ModelLocation::Local(path.into()),
            precision: Precision::F32,
            gated: false,
        }
    }

    pub fn precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    pub fn id(&self) -> String {
        match &self.location {
            ModelLocation::Hub(repo_id) => repo_id.clone(),
            ModelLocation::Local(path) => path.display().to_string(),
        }
    }
}

impl fmt::Display for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id(), self.precision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_builders() {
        let llama = ModelDescriptor::hub("meta-llama/Llama-3.2-1B-Instruct").gated();
        assert!(llama.gated);
        assert_eq!(llama.precision, Precision::F32);
        assert_eq!(llama.id(), "meta-llama/Llama-3.2-1B-Instruct");

        let local = ModelDescriptor::local("/models/llama-1b").precision(Precision::F16);
        assert_eq!(local.id(), "/models/llama-1b");
        assert_eq!(local.to_string(), "/models/llama-1b (float16)");
    }
}
