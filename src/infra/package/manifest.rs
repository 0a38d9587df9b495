use crate::core::{Capability, Graph, ModelDescriptor, Precision, TensorSpec};
use crate::models::ModelFamily;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const FORMAT_VERSION: u32 = 1;

/// Hardware the on-device runtime may schedule the package on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeUnits {
    All,
    CpuOnly,
    CpuAndGpu,
    CpuAndNeuralEngine,
}

impl fmt::Display for ComputeUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComputeUnits::All => "all",
            ComputeUnits::CpuOnly => "cpu-only",
            ComputeUnits::CpuAndGpu => "cpu+gpu",
            ComputeUnits::CpuAndNeuralEngine => "cpu+neural-engine",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Macos,
}

/// Minimum OS release able to load the package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub platform: Platform,
    pub major: u32,
}

impl DeploymentTarget {
    pub fn ios(major: u32) -> Self {
        Self {
            platform: Platform::Ios,
            major,
        }
    }

    pub fn macos(major: u32) -> Self {
        Self {
            platform: Platform::Macos,
            major,
        }
    }
}

impl fmt::Display for DeploymentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.platform {
            Platform::Ios => write!(f, "iOS{}", self.major),
            Platform::Macos => write!(f, "macOS{}", self.major),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportTarget {
    pub compute_units: ComputeUnits,
    pub deployment_target: DeploymentTarget,
    pub precision: Precision,
}

impl Default for ExportTarget {
    fn default() -> Self {
        Self {
            compute_units: ComputeUnits::All,
            deployment_target: DeploymentTarget::ios(16),
            precision: Precision::F16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightsInfo {
    pub file: String,
    pub tensors: usize,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub model: ModelDescriptor,
    pub fell_back: bool,
    pub family: ModelFamily,
    pub capability: Capability,
    pub compute_units: ComputeUnits,
    pub deployment_target: DeploymentTarget,
    pub precision: Precision,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub graph: Graph,
    pub weights: WeightsInfo,
}

impl Manifest {
    pub fn summary(&self) -> String {
        format!(
            "{} {} v{} | {} | {} | {} | {} nodes, {} tensors",
            self.family,
            self.capability,
            self.format_version,
            self.model,
            self.compute_units,
            self.deployment_target,
            self.graph.nodes.len(),
            self.weights.tensors
        )
    }
}
